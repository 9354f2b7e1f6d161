//! Fixed-capacity descriptor tables.
//!
//! This module provides the descriptor slot allocators used by the render
//! device:
//! - [`DescriptorHeapKind`] names the four independent tables
//! - [`Descriptor`] is a bound slot: index plus CPU/GPU handles
//! - [`DescriptorHeap`] is one table with its free list
//! - [`DescriptorHeapPool`] groups the four tables and offers typed allocators
//!
//! # Overview
//!
//! Each table is created once with a fixed capacity and never grows. A slot is
//! either free (its index sits on the free list) or bound to exactly one view.
//! Allocation pops an index, writes the view through the backend and computes
//! the slot's handles as `heap start + index * increment`. Freeing pushes the
//! index back. Both are O(1).
//!
//! Running out of slots means the pool was sized too small; it is reported as
//! [`RhiError::PoolExhausted`] and logged, never retried.
//!
//! The pool is not internally synchronized. Mutation requires `&mut`, so
//! sharing it between recording threads needs an external lock.
//!
//! # Example
//!
//! ```
//! use frameflight_rhi::descriptor::{DescriptorCapacities, DescriptorHeapPool, SamplerDesc};
//! use frameflight_rhi::software::SoftwareBackend;
//!
//! # fn main() -> Result<(), frameflight_rhi::RhiError> {
//! let backend = SoftwareBackend::new();
//! let mut pool = DescriptorHeapPool::new(&backend, DescriptorCapacities::uniform(4))?;
//!
//! let sampler = pool.allocate_sampler_descriptor(&SamplerDesc::default())?;
//! assert!(sampler.valid());
//! assert_eq!(sampler.index(), 0);
//!
//! pool.free(sampler)?;
//! # Ok(())
//! # }
//! ```

use tracing::{debug, error, info};

use crate::backend::{GpuDescriptorHeap, RenderBackend};
use crate::error::{RhiError, RhiResult};

/// The four independent descriptor tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DescriptorHeapKind {
    /// Constant buffer, shader resource and unordered access views
    CbvSrvUav,
    /// Samplers
    Sampler,
    /// Render target views
    RenderTarget,
    /// Depth-stencil views
    DepthStencil,
}

impl DescriptorHeapKind {
    /// All kinds, in pool order.
    pub const ALL: [DescriptorHeapKind; 4] = [
        DescriptorHeapKind::CbvSrvUav,
        DescriptorHeapKind::Sampler,
        DescriptorHeapKind::RenderTarget,
        DescriptorHeapKind::DepthStencil,
    ];

    /// Returns true for tables shaders can index (these carry a GPU handle).
    pub fn is_shader_visible(self) -> bool {
        matches!(
            self,
            DescriptorHeapKind::CbvSrvUav | DescriptorHeapKind::Sampler
        )
    }

    /// Returns a human-readable name for the table.
    pub fn name(self) -> &'static str {
        match self {
            DescriptorHeapKind::CbvSrvUav => "cbv/srv/uav descriptor",
            DescriptorHeapKind::Sampler => "sampler descriptor",
            DescriptorHeapKind::RenderTarget => "render target descriptor",
            DescriptorHeapKind::DepthStencil => "depth stencil descriptor",
        }
    }
}

/// Texture filtering mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum SamplerFilter {
    /// Nearest texel
    Point,
    /// Bilinear / trilinear
    #[default]
    Linear,
    /// Anisotropic (16x)
    Anisotropic,
}

/// Texture coordinate addressing outside [0, 1].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum AddressMode {
    /// Repeat
    #[default]
    Wrap,
    /// Repeat mirrored
    Mirror,
    /// Clamp to edge
    Clamp,
    /// Clamp to a transparent black border
    Border,
}

/// Sampler state. One address mode applies to u, v and w.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct SamplerDesc {
    /// Filtering mode
    pub filter: SamplerFilter,
    /// Addressing for all three coordinates
    pub address_mode: AddressMode,
}

impl SamplerDesc {
    /// Creates a sampler description.
    pub fn new(filter: SamplerFilter, address_mode: AddressMode) -> Self {
        Self {
            filter,
            address_mode,
        }
    }

    /// Maximum anisotropy implied by the filter (0 when not anisotropic).
    pub fn max_anisotropy(&self) -> u32 {
        match self.filter {
            SamplerFilter::Anisotropic => 16,
            _ => 0,
        }
    }
}

/// A view to write into a descriptor slot.
pub enum DescriptorView<'a, B: RenderBackend> {
    /// Constant buffer view of a buffer
    ConstantBuffer(&'a B::Resource),
    /// Read-only view of a buffer or one texture mip
    ShaderResource {
        /// Viewed resource
        resource: &'a B::Resource,
        /// Mip level (0 for buffers)
        mip_level: u32,
    },
    /// Read-write view of a buffer or one texture mip
    UnorderedAccess {
        /// Viewed resource
        resource: &'a B::Resource,
        /// Mip level (0 for buffers)
        mip_level: u32,
    },
    /// Sampler state
    Sampler(SamplerDesc),
    /// Render target view
    RenderTarget(&'a B::Resource),
    /// Depth-stencil view
    DepthStencil(&'a B::Resource),
}

impl<B: RenderBackend> DescriptorView<'_, B> {
    /// Table this view must be written into.
    pub fn heap_kind(&self) -> DescriptorHeapKind {
        match self {
            DescriptorView::ConstantBuffer(_)
            | DescriptorView::ShaderResource { .. }
            | DescriptorView::UnorderedAccess { .. } => DescriptorHeapKind::CbvSrvUav,
            DescriptorView::Sampler(_) => DescriptorHeapKind::Sampler,
            DescriptorView::RenderTarget(_) => DescriptorHeapKind::RenderTarget,
            DescriptorView::DepthStencil(_) => DescriptorHeapKind::DepthStencil,
        }
    }
}

/// A descriptor slot handle.
///
/// Copyable and backend-independent. A descriptor is [`valid`](Self::valid)
/// when it carries a slot index and the handles its table requires.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Descriptor {
    kind: DescriptorHeapKind,
    index: u32,
    cpu_handle: u64,
    gpu_handle: u64,
}

impl Descriptor {
    /// The unbound descriptor.
    pub const INVALID: Descriptor = Descriptor {
        kind: DescriptorHeapKind::CbvSrvUav,
        index: u32::MAX,
        cpu_handle: 0,
        gpu_handle: 0,
    };

    /// Returns true if the descriptor refers to a bound slot.
    pub fn valid(&self) -> bool {
        let gpu_ok = !self.kind.is_shader_visible() || self.gpu_handle != 0;
        self.index != u32::MAX && self.cpu_handle != 0 && gpu_ok
    }

    /// Table the slot lives in.
    #[inline]
    pub fn kind(&self) -> DescriptorHeapKind {
        self.kind
    }

    /// Slot index within its table.
    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// CPU-side handle.
    #[inline]
    pub fn cpu_handle(&self) -> u64 {
        self.cpu_handle
    }

    /// GPU-side handle (zero for tables that are not shader visible).
    #[inline]
    pub fn gpu_handle(&self) -> u64 {
        self.gpu_handle
    }
}

impl Default for Descriptor {
    fn default() -> Self {
        Self::INVALID
    }
}

/// One fixed-capacity descriptor table with its free list.
pub struct DescriptorHeap<B: RenderBackend> {
    raw: B::DescriptorHeap,
    kind: DescriptorHeapKind,
    capacity: u32,
    free_list: Vec<u32>,
    bound: Vec<bool>,
}

impl<B: RenderBackend> DescriptorHeap<B> {
    /// Creates a table with `capacity` slots, all free.
    ///
    /// # Errors
    ///
    /// Returns an error if the capacity is zero or the backend heap cannot be created.
    pub fn new(backend: &B, kind: DescriptorHeapKind, capacity: u32) -> RhiResult<Self> {
        if capacity == 0 {
            return Err(RhiError::InvalidUsage(format!(
                "{} heap capacity must be greater than 0",
                kind.name()
            )));
        }

        let raw = backend.create_descriptor_heap(kind, capacity)?;

        // Seeded in descending order so the first pop yields slot 0.
        let free_list: Vec<u32> = (0..capacity).rev().collect();

        debug!("Created {} heap with {} slots", kind.name(), capacity);

        Ok(Self {
            raw,
            kind,
            capacity,
            free_list,
            bound: vec![false; capacity as usize],
        })
    }

    /// Binds `view` to a free slot.
    ///
    /// # Errors
    ///
    /// - [`RhiError::InvalidUsage`] if the view belongs to another table
    /// - [`RhiError::PoolExhausted`] if every slot is bound
    /// - backend errors from writing the view (the slot stays free)
    pub fn allocate(&mut self, view: &DescriptorView<'_, B>) -> RhiResult<Descriptor> {
        if view.heap_kind() != self.kind {
            return Err(RhiError::InvalidUsage(format!(
                "{:?} view cannot be written into the {} heap",
                view.heap_kind(),
                self.kind.name()
            )));
        }

        let Some(index) = self.free_list.pop() else {
            error!(
                "{} heap exhausted: all {} slots are bound",
                self.kind.name(),
                self.capacity
            );
            return Err(RhiError::PoolExhausted {
                pool: self.kind.name(),
                capacity: self.capacity as usize,
            });
        };

        if let Err(e) = self.raw.write(index, view) {
            self.free_list.push(index);
            return Err(e);
        }
        self.bound[index as usize] = true;

        Ok(self.descriptor_at(index))
    }

    /// Returns a slot to the free list.
    ///
    /// Freeing an invalid descriptor does nothing.
    ///
    /// # Errors
    ///
    /// - [`RhiError::InvalidDescriptor`] for a descriptor of another table or out of range
    /// - [`RhiError::DoubleFree`] if the slot is already free
    pub fn free(&mut self, descriptor: Descriptor) -> RhiResult<()> {
        if !descriptor.valid() {
            return Ok(());
        }
        if descriptor.kind != self.kind {
            return Err(RhiError::InvalidDescriptor(format!(
                "{:?} descriptor returned to the {} heap",
                descriptor.kind,
                self.kind.name()
            )));
        }
        if descriptor.index >= self.capacity || descriptor != self.descriptor_at(descriptor.index)
        {
            return Err(RhiError::InvalidDescriptor(format!(
                "descriptor {} does not belong to this {} heap",
                descriptor.index,
                self.kind.name()
            )));
        }
        if !self.bound[descriptor.index as usize] {
            return Err(RhiError::DoubleFree {
                kind: self.kind,
                index: descriptor.index,
            });
        }

        self.raw.clear(descriptor.index);
        self.bound[descriptor.index as usize] = false;
        self.free_list.push(descriptor.index);
        Ok(())
    }

    /// Returns true if `index` is currently bound.
    pub fn is_bound(&self, index: u32) -> bool {
        self.bound.get(index as usize).copied().unwrap_or(false)
    }

    fn descriptor_at(&self, index: u32) -> Descriptor {
        let increment = self.raw.increment_size();
        let gpu_handle = if self.kind.is_shader_visible() {
            self.raw.gpu_start() + increment * index as u64
        } else {
            0
        };
        Descriptor {
            kind: self.kind,
            index,
            cpu_handle: self.raw.cpu_start() + increment * index as u64,
            gpu_handle,
        }
    }

    /// Table kind.
    #[inline]
    pub fn kind(&self) -> DescriptorHeapKind {
        self.kind
    }

    /// Fixed number of slots.
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Number of bound slots.
    #[inline]
    pub fn allocated_count(&self) -> u32 {
        self.capacity - self.free_list.len() as u32
    }

    /// Number of free slots.
    #[inline]
    pub fn free_count(&self) -> u32 {
        self.free_list.len() as u32
    }

    /// Backend heap.
    #[inline]
    pub fn raw(&self) -> &B::DescriptorHeap {
        &self.raw
    }
}

/// Capacities of the four tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescriptorCapacities {
    /// Constant/shader/unordered resource views
    pub cbv_srv_uav: u32,
    /// Samplers
    pub sampler: u32,
    /// Render target views
    pub render_target: u32,
    /// Depth-stencil views
    pub depth_stencil: u32,
}

impl DescriptorCapacities {
    /// Same capacity for every table.
    pub fn uniform(capacity: u32) -> Self {
        Self {
            cbv_srv_uav: capacity,
            sampler: capacity,
            render_target: capacity,
            depth_stencil: capacity,
        }
    }

    /// Capacity of one table.
    pub fn get(&self, kind: DescriptorHeapKind) -> u32 {
        match kind {
            DescriptorHeapKind::CbvSrvUav => self.cbv_srv_uav,
            DescriptorHeapKind::Sampler => self.sampler,
            DescriptorHeapKind::RenderTarget => self.render_target,
            DescriptorHeapKind::DepthStencil => self.depth_stencil,
        }
    }
}

impl Default for DescriptorCapacities {
    fn default() -> Self {
        Self::uniform(4000)
    }
}

/// The four descriptor tables of a render device.
pub struct DescriptorHeapPool<B: RenderBackend> {
    cbv_srv_uav: DescriptorHeap<B>,
    sampler: DescriptorHeap<B>,
    render_target: DescriptorHeap<B>,
    depth_stencil: DescriptorHeap<B>,
}

impl<B: RenderBackend> DescriptorHeapPool<B> {
    /// Creates all four tables.
    ///
    /// # Errors
    ///
    /// Returns an error if any table cannot be created.
    pub fn new(backend: &B, capacities: DescriptorCapacities) -> RhiResult<Self> {
        let pool = Self {
            cbv_srv_uav: DescriptorHeap::new(
                backend,
                DescriptorHeapKind::CbvSrvUav,
                capacities.cbv_srv_uav,
            )?,
            sampler: DescriptorHeap::new(backend, DescriptorHeapKind::Sampler, capacities.sampler)?,
            render_target: DescriptorHeap::new(
                backend,
                DescriptorHeapKind::RenderTarget,
                capacities.render_target,
            )?,
            depth_stencil: DescriptorHeap::new(
                backend,
                DescriptorHeapKind::DepthStencil,
                capacities.depth_stencil,
            )?,
        };

        info!(
            "Descriptor heap pool created (cbv/srv/uav {}, sampler {}, rtv {}, dsv {})",
            capacities.cbv_srv_uav,
            capacities.sampler,
            capacities.render_target,
            capacities.depth_stencil
        );

        Ok(pool)
    }

    /// Binds any view to a slot of the matching table.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::PoolExhausted`] when the table is full.
    pub fn allocate(&mut self, view: &DescriptorView<'_, B>) -> RhiResult<Descriptor> {
        self.heap_mut(view.heap_kind()).allocate(view)
    }

    /// Allocates a constant buffer view.
    pub fn allocate_cb_descriptor(&mut self, resource: &B::Resource) -> RhiResult<Descriptor> {
        self.allocate(&DescriptorView::ConstantBuffer(resource))
    }

    /// Allocates a shader resource view of one mip level.
    pub fn allocate_sr_descriptor(
        &mut self,
        resource: &B::Resource,
        mip_level: u32,
    ) -> RhiResult<Descriptor> {
        self.allocate(&DescriptorView::ShaderResource {
            resource,
            mip_level,
        })
    }

    /// Allocates an unordered access view of one mip level.
    pub fn allocate_ua_descriptor(
        &mut self,
        resource: &B::Resource,
        mip_level: u32,
    ) -> RhiResult<Descriptor> {
        self.allocate(&DescriptorView::UnorderedAccess {
            resource,
            mip_level,
        })
    }

    /// Allocates a sampler.
    pub fn allocate_sampler_descriptor(&mut self, desc: &SamplerDesc) -> RhiResult<Descriptor> {
        self.allocate(&DescriptorView::Sampler(*desc))
    }

    /// Allocates a render target view.
    pub fn allocate_rt_descriptor(&mut self, resource: &B::Resource) -> RhiResult<Descriptor> {
        self.allocate(&DescriptorView::RenderTarget(resource))
    }

    /// Allocates a depth-stencil view.
    pub fn allocate_ds_descriptor(&mut self, resource: &B::Resource) -> RhiResult<Descriptor> {
        self.allocate(&DescriptorView::DepthStencil(resource))
    }

    /// Returns a descriptor to its table. Invalid descriptors are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::DoubleFree`] if the slot is already free.
    pub fn free(&mut self, descriptor: Descriptor) -> RhiResult<()> {
        if !descriptor.valid() {
            return Ok(());
        }
        self.heap_mut(descriptor.kind()).free(descriptor)
    }

    /// One table.
    pub fn heap(&self, kind: DescriptorHeapKind) -> &DescriptorHeap<B> {
        match kind {
            DescriptorHeapKind::CbvSrvUav => &self.cbv_srv_uav,
            DescriptorHeapKind::Sampler => &self.sampler,
            DescriptorHeapKind::RenderTarget => &self.render_target,
            DescriptorHeapKind::DepthStencil => &self.depth_stencil,
        }
    }

    fn heap_mut(&mut self, kind: DescriptorHeapKind) -> &mut DescriptorHeap<B> {
        match kind {
            DescriptorHeapKind::CbvSrvUav => &mut self.cbv_srv_uav,
            DescriptorHeapKind::Sampler => &mut self.sampler,
            DescriptorHeapKind::RenderTarget => &mut self.render_target,
            DescriptorHeapKind::DepthStencil => &mut self.depth_stencil,
        }
    }

    /// Bound slots across all tables.
    pub fn allocated_count(&self) -> u32 {
        DescriptorHeapKind::ALL
            .iter()
            .map(|&kind| self.heap(kind).allocated_count())
            .sum()
    }
}

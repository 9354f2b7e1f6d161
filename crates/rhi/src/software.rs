//! In-process software device.
//!
//! [`SoftwareBackend`] implements the backend traits on plain memory so the
//! frame pipeline runs (and is tested) without a GPU. It models a single GPU
//! timeline shared by all queues:
//!
//! - resources are byte vectors with synthetic GPU addresses
//! - command lists record copies, executed against those bytes
//! - fences are counters guarded by a mutex and condition variable
//! - descriptor heaps record which view each slot holds
//!
//! # Execution modes
//!
//! In [`ExecutionMode::Immediate`] submitted work runs during submission, so
//! fences signal as soon as they are queued. In [`ExecutionMode::Deferred`]
//! work waits until [`SoftwareBackend::run_pending`] (or
//! [`run_pending_steps`](SoftwareBackend::run_pending_steps)) is called,
//! which lets tests hold the "GPU" back and observe the CPU side racing ahead.
//!
//! # Destruction checks
//!
//! Recorded commands refer to resource memory weakly. If a resource is
//! dropped while a command that uses it is still pending, executing the
//! command counts a use-after-free in [`SoftwareStats`] instead of touching
//! the memory.
//!
//! # Example
//!
//! ```
//! use frameflight_rhi::backend::{GpuFence, QueueKind, RenderBackend};
//! use frameflight_rhi::backend::GpuQueue;
//! use frameflight_rhi::software::SoftwareBackend;
//!
//! # fn main() -> Result<(), frameflight_rhi::RhiError> {
//! let backend = SoftwareBackend::deferred();
//! let queue = backend.create_queue(QueueKind::Copy)?;
//! let fence = backend.create_fence(0)?;
//!
//! queue.signal(&fence, 1)?;
//! assert_eq!(fence.completed_value()?, 0);
//!
//! backend.run_pending();
//! assert_eq!(fence.completed_value()?, 1);
//! # Ok(())
//! # }
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::backend::{
    GpuCommandList, GpuDescriptorHeap, GpuFence, GpuQueue, GpuResource, MemoryKind, QueueKind,
    RenderBackend, ResourceDesc, ResourceKind, TextureFootprint, align_up,
};
use crate::descriptor::{DescriptorHeapKind, DescriptorView, SamplerDesc};
use crate::error::{RhiError, RhiResult};

/// Distance between descriptor slot handles.
const DESCRIPTOR_INCREMENT: u64 = 32;

/// Offset separating a heap's GPU handles from its CPU handles.
const GPU_HANDLE_OFFSET: u64 = 1 << 48;

/// Heap base addresses are unique per process so that a descriptor can never
/// be mistaken for a slot of another heap.
static NEXT_HEAP_BASE: AtomicU64 = AtomicU64::new(0x1000_0000);

fn lock<T>(mutex: &Mutex<T>) -> RhiResult<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| RhiError::Backend("software device state poisoned".to_string()))
}

/// When submitted work executes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ExecutionMode {
    /// During submission
    #[default]
    Immediate,
    /// When [`SoftwareBackend::run_pending`] is called
    Deferred,
}

/// Counters describing what the software device has done.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SoftwareStats {
    /// Resources created over the device's lifetime
    pub resources_created: usize,
    /// Resources currently alive
    pub resources_alive: usize,
    /// Command lists created over the device's lifetime
    pub command_lists_created: usize,
    /// Copy commands executed
    pub commands_executed: usize,
    /// Commands that referenced an already destroyed resource
    pub use_after_free: usize,
    /// Fence signals that did not raise the fence's value
    pub stale_signals: usize,
}

type Memory = Arc<Mutex<Vec<u8>>>;

#[derive(Clone)]
enum Command {
    Copy {
        dst: Weak<Mutex<Vec<u8>>>,
        src: Weak<Mutex<Vec<u8>>>,
        size: u64,
    },
    CopyToTexture {
        dst: Weak<Mutex<Vec<u8>>>,
        dst_offset: u64,
        src: Weak<Mutex<Vec<u8>>>,
        footprint: TextureFootprint,
    },
}

struct FenceState {
    value: Mutex<u64>,
    reached: Condvar,
}

enum Work {
    Commands(Vec<Command>),
    Signal { fence: Arc<FenceState>, value: u64 },
    Wait { fence: Arc<FenceState>, value: u64 },
}

struct Shared {
    mode: ExecutionMode,
    lost: AtomicBool,
    pending: Mutex<VecDeque<Work>>,
    next_address: AtomicU64,
    resources_created: AtomicUsize,
    resources_alive: AtomicUsize,
    command_lists_created: AtomicUsize,
    commands_executed: AtomicUsize,
    use_after_free: AtomicUsize,
    stale_signals: AtomicUsize,
    /// Resources that may still be created; `usize::MAX` is unlimited.
    allocation_budget: AtomicUsize,
}

impl Shared {
    fn check_device(&self) -> RhiResult<()> {
        if self.lost.load(Ordering::Acquire) {
            return Err(RhiError::DeviceLost(
                "software device was removed".to_string(),
            ));
        }
        Ok(())
    }

    fn submit(&self, work: Work) -> RhiResult<()> {
        self.check_device()?;
        lock(&self.pending)?.push_back(work);
        if self.mode == ExecutionMode::Immediate {
            self.run(usize::MAX)?;
        }
        Ok(())
    }

    /// Executes up to `max_steps` queued items in order. Stops early at a
    /// queue wait whose fence has not been reached.
    fn run(&self, max_steps: usize) -> RhiResult<usize> {
        if self.lost.load(Ordering::Acquire) {
            return Ok(0);
        }

        let mut pending = lock(&self.pending)?;
        let mut steps = 0;
        while steps < max_steps {
            let Some(work) = pending.front() else {
                break;
            };
            if let Work::Wait { fence, value } = work
                && *lock(&fence.value)? < *value
            {
                break;
            }

            let Some(work) = pending.pop_front() else {
                break;
            };
            match work {
                Work::Commands(commands) => {
                    for command in &commands {
                        self.execute(command)?;
                    }
                }
                Work::Signal { fence, value } => {
                    let mut current = lock(&fence.value)?;
                    // Timeline values must strictly increase.
                    if value <= *current {
                        self.stale_signals.fetch_add(1, Ordering::Relaxed);
                        warn!("Fence signaled with {} but already reached {}", value, *current);
                    }
                    *current = (*current).max(value);
                    fence.reached.notify_all();
                }
                Work::Wait { .. } => {}
            }
            steps += 1;
        }
        Ok(steps)
    }

    fn execute(&self, command: &Command) -> RhiResult<()> {
        match command {
            Command::Copy { dst, src, size } => {
                let (Some(dst), Some(src)) = (dst.upgrade(), src.upgrade()) else {
                    self.report_use_after_free("buffer copy");
                    return Ok(());
                };
                let size = *size as usize;
                let source = lock(&src)?[..size].to_vec();
                lock(&dst)?[..size].copy_from_slice(&source);
            }
            Command::CopyToTexture {
                dst,
                dst_offset,
                src,
                footprint,
            } => {
                let (Some(dst), Some(src)) = (dst.upgrade(), src.upgrade()) else {
                    self.report_use_after_free("texture copy");
                    return Ok(());
                };
                let source = lock(&src)?.clone();
                let mut texels = lock(&dst)?;
                let row = footprint.row_size as usize;
                let mut out = *dst_offset as usize;
                for z in 0..footprint.depth {
                    for y in 0..footprint.height {
                        let at = footprint.row_offset(y, z) as usize;
                        texels[out..out + row].copy_from_slice(&source[at..at + row]);
                        out += row;
                    }
                }
            }
        }
        self.commands_executed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn report_use_after_free(&self, what: &str) {
        error!("Software device executed a {} on a destroyed resource", what);
        self.use_after_free.fetch_add(1, Ordering::Relaxed);
    }
}

/// A software GPU.
///
/// Cloning yields another handle to the same device.
#[derive(Clone)]
pub struct SoftwareBackend {
    shared: Arc<Shared>,
}

impl SoftwareBackend {
    /// Creates a device that executes work during submission.
    pub fn new() -> Self {
        Self::with_mode(ExecutionMode::Immediate)
    }

    /// Creates a device that executes work only when asked to.
    pub fn deferred() -> Self {
        Self::with_mode(ExecutionMode::Deferred)
    }

    /// Creates a device with the given execution mode.
    pub fn with_mode(mode: ExecutionMode) -> Self {
        debug!("Created software device ({:?})", mode);
        Self {
            shared: Arc::new(Shared {
                mode,
                lost: AtomicBool::new(false),
                pending: Mutex::new(VecDeque::new()),
                next_address: AtomicU64::new(0x1_0000),
                resources_created: AtomicUsize::new(0),
                resources_alive: AtomicUsize::new(0),
                command_lists_created: AtomicUsize::new(0),
                commands_executed: AtomicUsize::new(0),
                use_after_free: AtomicUsize::new(0),
                stale_signals: AtomicUsize::new(0),
                allocation_budget: AtomicUsize::new(usize::MAX),
            }),
        }
    }

    /// Execution mode.
    pub fn mode(&self) -> ExecutionMode {
        self.shared.mode
    }

    /// Executes all queued work that is not blocked on a queue wait.
    ///
    /// Returns the number of work items executed.
    pub fn run_pending(&self) -> usize {
        self.run_pending_steps(usize::MAX)
    }

    /// Executes at most `steps` queued work items.
    pub fn run_pending_steps(&self, steps: usize) -> usize {
        match self.shared.run(steps) {
            Ok(done) => done,
            Err(e) => {
                error!("Software device failed to execute work: {}", e);
                0
            }
        }
    }

    /// Number of queued work items (command batches, signals and waits).
    pub fn pending_work(&self) -> usize {
        self.shared
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Simulates device removal.
    ///
    /// Pending work is discarded and every later operation reports
    /// [`RhiError::DeviceLost`].
    pub fn lose_device(&self) {
        warn!("Software device lost");
        self.shared.lost.store(true, Ordering::Release);
        self.shared
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Makes resource creation fail once `count` more resources exist.
    ///
    /// Simulates running out of device memory.
    pub fn limit_allocations(&self, count: usize) {
        self.shared.allocation_budget.store(count, Ordering::Release);
    }

    /// Snapshot of the device counters.
    pub fn stats(&self) -> SoftwareStats {
        let shared = &self.shared;
        SoftwareStats {
            resources_created: shared.resources_created.load(Ordering::Relaxed),
            resources_alive: shared.resources_alive.load(Ordering::Relaxed),
            command_lists_created: shared.command_lists_created.load(Ordering::Relaxed),
            commands_executed: shared.commands_executed.load(Ordering::Relaxed),
            use_after_free: shared.use_after_free.load(Ordering::Relaxed),
            stale_signals: shared.stale_signals.load(Ordering::Relaxed),
        }
    }
}

impl Default for SoftwareBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderBackend for SoftwareBackend {
    type Resource = SoftwareResource;
    type CommandList = SoftwareCommandList;
    type Queue = SoftwareQueue;
    type Fence = SoftwareFence;
    type DescriptorHeap = SoftwareDescriptorHeap;

    fn name(&self) -> &str {
        "software"
    }

    fn create_resource(&self, desc: &ResourceDesc) -> RhiResult<SoftwareResource> {
        self.shared.check_device()?;

        let size = desc.size();
        if size == 0 {
            return Err(RhiError::InvalidUsage(format!(
                "resource '{}' has zero size",
                desc.name
            )));
        }

        let budget = self.shared.allocation_budget.fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |left| match left {
                0 => None,
                usize::MAX => Some(usize::MAX),
                left => Some(left - 1),
            },
        );
        if budget.is_err() {
            return Err(RhiError::Backend(format!(
                "out of device memory creating '{}'",
                desc.name
            )));
        }

        let gpu_address = self
            .shared
            .next_address
            .fetch_add(align_up(size, 256), Ordering::Relaxed);
        self.shared.resources_created.fetch_add(1, Ordering::Relaxed);
        self.shared.resources_alive.fetch_add(1, Ordering::Relaxed);

        Ok(SoftwareResource {
            desc: desc.clone(),
            memory: Arc::new(Mutex::new(vec![0; size as usize])),
            gpu_address,
            shared: self.shared.clone(),
        })
    }

    fn create_command_list(&self, kind: QueueKind) -> RhiResult<SoftwareCommandList> {
        self.shared.check_device()?;
        self.shared
            .command_lists_created
            .fetch_add(1, Ordering::Relaxed);
        Ok(SoftwareCommandList {
            kind,
            commands: Vec::new(),
            closed: false,
            shared: self.shared.clone(),
        })
    }

    fn create_queue(&self, kind: QueueKind) -> RhiResult<SoftwareQueue> {
        self.shared.check_device()?;
        Ok(SoftwareQueue {
            kind,
            shared: self.shared.clone(),
        })
    }

    fn create_fence(&self, initial_value: u64) -> RhiResult<SoftwareFence> {
        self.shared.check_device()?;
        Ok(SoftwareFence {
            state: Arc::new(FenceState {
                value: Mutex::new(initial_value),
                reached: Condvar::new(),
            }),
            shared: self.shared.clone(),
        })
    }

    fn create_descriptor_heap(
        &self,
        kind: DescriptorHeapKind,
        capacity: u32,
    ) -> RhiResult<SoftwareDescriptorHeap> {
        self.shared.check_device()?;

        let span = (capacity as u64 + 1) * DESCRIPTOR_INCREMENT;
        let cpu_start = NEXT_HEAP_BASE.fetch_add(align_up(span, 0x1_0000), Ordering::Relaxed);
        let gpu_start = if kind.is_shader_visible() {
            cpu_start + GPU_HANDLE_OFFSET
        } else {
            0
        };

        Ok(SoftwareDescriptorHeap {
            kind,
            cpu_start,
            gpu_start,
            slots: vec![None; capacity as usize],
        })
    }

    fn check_device(&self) -> RhiResult<()> {
        self.shared.check_device()
    }
}

/// A buffer or texture in host memory.
pub struct SoftwareResource {
    desc: ResourceDesc,
    memory: Memory,
    gpu_address: u64,
    shared: Arc<Shared>,
}

impl SoftwareResource {
    /// Copy of the resource's bytes (textures are tightly packed, mip 0 first).
    pub fn contents(&self) -> Vec<u8> {
        self.memory
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl GpuResource for SoftwareResource {
    fn desc(&self) -> &ResourceDesc {
        &self.desc
    }

    fn gpu_address(&self) -> u64 {
        self.gpu_address
    }

    fn write_bytes(&mut self, offset: u64, data: &[u8]) -> RhiResult<()> {
        self.shared.check_device()?;
        if self.desc.memory != MemoryKind::Upload {
            return Err(RhiError::InvalidUsage(format!(
                "'{}' lives in {} memory and is not CPU-writable",
                self.desc.name,
                self.desc.memory.name()
            )));
        }

        let end = offset + data.len() as u64;
        if end > self.desc.size() {
            return Err(RhiError::WriteOutOfBounds {
                size: end,
                capacity: self.desc.size(),
            });
        }

        lock(&self.memory)?[offset as usize..end as usize].copy_from_slice(data);
        Ok(())
    }
}

impl Drop for SoftwareResource {
    fn drop(&mut self) {
        self.shared.resources_alive.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Recorded copy commands.
pub struct SoftwareCommandList {
    kind: QueueKind,
    commands: Vec<Command>,
    closed: bool,
    shared: Arc<Shared>,
}

impl SoftwareCommandList {
    fn expect_open(&self) -> RhiResult<()> {
        if self.closed {
            return Err(RhiError::Backend(
                "recording into a closed command list".to_string(),
            ));
        }
        Ok(())
    }
}

impl GpuCommandList<SoftwareBackend> for SoftwareCommandList {
    fn kind(&self) -> QueueKind {
        self.kind
    }

    fn reset(&mut self) -> RhiResult<()> {
        self.shared.check_device()?;
        self.commands.clear();
        self.closed = false;
        Ok(())
    }

    fn close(&mut self) -> RhiResult<()> {
        self.closed = true;
        Ok(())
    }

    fn copy_buffer(
        &mut self,
        dst: &SoftwareResource,
        src: &SoftwareResource,
        size: u64,
    ) -> RhiResult<()> {
        self.expect_open()?;
        let capacity = dst.size().min(src.size());
        if size > capacity {
            return Err(RhiError::WriteOutOfBounds { size, capacity });
        }
        self.commands.push(Command::Copy {
            dst: Arc::downgrade(&dst.memory),
            src: Arc::downgrade(&src.memory),
            size,
        });
        Ok(())
    }

    fn copy_buffer_to_texture(
        &mut self,
        dst: &SoftwareResource,
        src: &SoftwareResource,
        footprint: &TextureFootprint,
    ) -> RhiResult<()> {
        self.expect_open()?;
        let ResourceKind::Texture(info) = dst.desc().kind else {
            return Err(RhiError::InvalidUsage(format!(
                "'{}' is not a texture",
                dst.desc().name
            )));
        };
        if footprint.mip_level >= info.mip_levels {
            return Err(RhiError::InvalidUsage(format!(
                "'{}' has no mip level {}",
                dst.desc().name,
                footprint.mip_level
            )));
        }
        if footprint.upload_size() > src.size() {
            return Err(RhiError::WriteOutOfBounds {
                size: footprint.upload_size(),
                capacity: src.size(),
            });
        }
        self.commands.push(Command::CopyToTexture {
            dst: Arc::downgrade(&dst.memory),
            dst_offset: info.mip_offset(footprint.mip_level),
            src: Arc::downgrade(&src.memory),
            footprint: *footprint,
        });
        Ok(())
    }

    fn command_count(&self) -> usize {
        self.commands.len()
    }
}

/// A queue on the shared software timeline.
pub struct SoftwareQueue {
    kind: QueueKind,
    shared: Arc<Shared>,
}

impl GpuQueue<SoftwareBackend> for SoftwareQueue {
    fn kind(&self) -> QueueKind {
        self.kind
    }

    fn execute(&self, lists: &[&SoftwareCommandList]) -> RhiResult<()> {
        if lists.iter().any(|list| !list.closed) {
            return Err(RhiError::Backend(
                "executing a command list that is still recording".to_string(),
            ));
        }
        let commands = lists
            .iter()
            .flat_map(|list| list.commands.iter().cloned())
            .collect();
        self.shared.submit(Work::Commands(commands))
    }

    fn signal(&self, fence: &SoftwareFence, value: u64) -> RhiResult<()> {
        self.shared.submit(Work::Signal {
            fence: fence.state.clone(),
            value,
        })
    }

    fn wait(&self, fence: &SoftwareFence, value: u64) -> RhiResult<()> {
        self.shared.submit(Work::Wait {
            fence: fence.state.clone(),
            value,
        })
    }
}

/// A counter on the software timeline.
pub struct SoftwareFence {
    state: Arc<FenceState>,
    shared: Arc<Shared>,
}

impl GpuFence for SoftwareFence {
    fn completed_value(&self) -> RhiResult<u64> {
        self.shared.check_device()?;
        Ok(*lock(&self.state.value)?)
    }

    fn wait(&self, value: u64, timeout: Duration) -> RhiResult<bool> {
        self.shared.check_device()?;
        let guard = lock(&self.state.value)?;
        let (guard, result) = self
            .state
            .reached
            .wait_timeout_while(guard, timeout, |current| *current < value)
            .map_err(|_| RhiError::Backend("software fence poisoned".to_string()))?;
        drop(guard);

        self.shared.check_device()?;
        Ok(!result.timed_out())
    }
}

/// What a software descriptor slot holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BoundView {
    /// Constant buffer at a GPU address
    ConstantBuffer {
        /// Buffer address
        address: u64,
    },
    /// Read-only view
    ShaderResource {
        /// Resource address
        address: u64,
        /// Viewed mip
        mip_level: u32,
    },
    /// Read-write view
    UnorderedAccess {
        /// Resource address
        address: u64,
        /// Viewed mip
        mip_level: u32,
    },
    /// Sampler state
    Sampler(SamplerDesc),
    /// Render target
    RenderTarget {
        /// Resource address
        address: u64,
    },
    /// Depth-stencil target
    DepthStencil {
        /// Resource address
        address: u64,
    },
}

/// A descriptor table in host memory.
pub struct SoftwareDescriptorHeap {
    kind: DescriptorHeapKind,
    cpu_start: u64,
    gpu_start: u64,
    slots: Vec<Option<BoundView>>,
}

impl SoftwareDescriptorHeap {
    /// View bound at `index`, if any.
    pub fn bound(&self, index: u32) -> Option<BoundView> {
        self.slots.get(index as usize).copied().flatten()
    }

    fn check_mip(resource: &SoftwareResource, mip_level: u32) -> RhiResult<()> {
        match resource.desc().texture_info() {
            Some(info) if mip_level >= info.mip_levels => Err(RhiError::InvalidUsage(format!(
                "'{}' has no mip level {}",
                resource.desc().name,
                mip_level
            ))),
            None if mip_level != 0 => Err(RhiError::InvalidUsage(format!(
                "buffer '{}' has no mip levels",
                resource.desc().name
            ))),
            _ => Ok(()),
        }
    }
}

impl GpuDescriptorHeap<SoftwareBackend> for SoftwareDescriptorHeap {
    fn kind(&self) -> DescriptorHeapKind {
        self.kind
    }

    fn capacity(&self) -> u32 {
        self.slots.len() as u32
    }

    fn cpu_start(&self) -> u64 {
        self.cpu_start
    }

    fn gpu_start(&self) -> u64 {
        self.gpu_start
    }

    fn increment_size(&self) -> u64 {
        DESCRIPTOR_INCREMENT
    }

    fn write(&mut self, index: u32, view: &DescriptorView<'_, SoftwareBackend>) -> RhiResult<()> {
        let bound = match view {
            DescriptorView::ConstantBuffer(resource) => BoundView::ConstantBuffer {
                address: resource.gpu_address(),
            },
            DescriptorView::ShaderResource {
                resource,
                mip_level,
            } => {
                Self::check_mip(resource, *mip_level)?;
                BoundView::ShaderResource {
                    address: resource.gpu_address(),
                    mip_level: *mip_level,
                }
            }
            DescriptorView::UnorderedAccess {
                resource,
                mip_level,
            } => {
                Self::check_mip(resource, *mip_level)?;
                BoundView::UnorderedAccess {
                    address: resource.gpu_address(),
                    mip_level: *mip_level,
                }
            }
            DescriptorView::Sampler(desc) => BoundView::Sampler(*desc),
            DescriptorView::RenderTarget(resource) => BoundView::RenderTarget {
                address: resource.gpu_address(),
            },
            DescriptorView::DepthStencil(resource) => BoundView::DepthStencil {
                address: resource.gpu_address(),
            },
        };

        let slot = self.slots.get_mut(index as usize).ok_or_else(|| {
            RhiError::InvalidDescriptor(format!("slot {} out of range", index))
        })?;
        *slot = Some(bound);
        Ok(())
    }

    fn clear(&mut self, index: u32) {
        if let Some(slot) = self.slots.get_mut(index as usize) {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{TextureDimension, TextureFormat, TextureInfo, TextureUsage};

    fn assert_send_sync<T: Send + Sync>() {}
    fn assert_send<T: Send>() {}

    #[test]
    fn test_software_types_are_thread_safe() {
        assert_send_sync::<SoftwareBackend>();
        assert_send_sync::<SoftwareQueue>();
        assert_send_sync::<SoftwareFence>();
        assert_send::<SoftwareResource>();
        assert_send::<SoftwareCommandList>();
        assert_send::<SoftwareDescriptorHeap>();
    }

    #[test]
    fn test_copy_between_buffers() {
        let backend = SoftwareBackend::new();
        let queue = backend.create_queue(QueueKind::Copy).unwrap();
        let dst = backend
            .create_resource(&ResourceDesc::buffer("dst", 8, MemoryKind::Default))
            .unwrap();
        let mut src = backend
            .create_resource(&ResourceDesc::buffer("src", 8, MemoryKind::Upload))
            .unwrap();
        src.write_bytes(0, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();

        let mut list = backend.create_command_list(QueueKind::Copy).unwrap();
        list.copy_buffer(&dst, &src, 8).unwrap();
        list.close().unwrap();
        queue.execute(&[&list]).unwrap();

        assert_eq!(dst.contents(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(backend.stats().commands_executed, 1);
    }

    #[test]
    fn test_default_memory_is_not_cpu_writable() {
        let backend = SoftwareBackend::new();
        let mut buffer = backend
            .create_resource(&ResourceDesc::buffer("gpu", 8, MemoryKind::Default))
            .unwrap();
        assert!(matches!(
            buffer.write_bytes(0, &[0]),
            Err(RhiError::InvalidUsage(_))
        ));
    }

    #[test]
    fn test_write_bounds() {
        let backend = SoftwareBackend::new();
        let mut buffer = backend
            .create_resource(&ResourceDesc::buffer("up", 4, MemoryKind::Upload))
            .unwrap();
        assert!(matches!(
            buffer.write_bytes(2, &[0; 3]),
            Err(RhiError::WriteOutOfBounds {
                size: 5,
                capacity: 4
            })
        ));
    }

    #[test]
    fn test_deferred_work_waits_for_run() {
        let backend = SoftwareBackend::deferred();
        let queue = backend.create_queue(QueueKind::Graphics).unwrap();
        let fence = backend.create_fence(0).unwrap();
        queue.signal(&fence, 1).unwrap();
        queue.signal(&fence, 2).unwrap();

        assert_eq!(backend.pending_work(), 2);
        assert_eq!(backend.run_pending_steps(1), 1);
        assert_eq!(fence.completed_value().unwrap(), 1);
        assert_eq!(backend.run_pending(), 1);
        assert_eq!(fence.completed_value().unwrap(), 2);
    }

    #[test]
    fn test_queue_wait_blocks_later_work() {
        let backend = SoftwareBackend::deferred();
        let queue = backend.create_queue(QueueKind::Graphics).unwrap();
        let gate = backend.create_fence(0).unwrap();
        let done = backend.create_fence(0).unwrap();

        queue.wait(&gate, 1).unwrap();
        queue.signal(&done, 1).unwrap();
        assert_eq!(backend.run_pending(), 0);
        assert_eq!(done.completed_value().unwrap(), 0);

        queue.signal(&gate, 1).unwrap();
        // The gate signal sits behind the wait on the single timeline.
        assert_eq!(backend.run_pending(), 0);
        assert_eq!(backend.pending_work(), 3);
    }

    #[test]
    fn test_fence_wait_times_out() {
        let backend = SoftwareBackend::deferred();
        let fence = backend.create_fence(0).unwrap();
        assert!(!fence.wait(1, Duration::from_millis(10)).unwrap());
    }

    #[test]
    fn test_fence_wait_wakes_on_signal() {
        let backend = SoftwareBackend::deferred();
        let queue = backend.create_queue(QueueKind::Copy).unwrap();
        let fence = backend.create_fence(0).unwrap();
        queue.signal(&fence, 1).unwrap();

        let worker = backend.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            worker.run_pending();
        });

        assert!(fence.wait(1, Duration::from_secs(5)).unwrap());
        handle.join().unwrap();
    }

    #[test]
    fn test_destroyed_resource_is_detected() {
        let backend = SoftwareBackend::deferred();
        let queue = backend.create_queue(QueueKind::Copy).unwrap();
        let dst = backend
            .create_resource(&ResourceDesc::buffer("dst", 4, MemoryKind::Default))
            .unwrap();
        let src = backend
            .create_resource(&ResourceDesc::buffer("src", 4, MemoryKind::Upload))
            .unwrap();

        let mut list = backend.create_command_list(QueueKind::Copy).unwrap();
        list.copy_buffer(&dst, &src, 4).unwrap();
        list.close().unwrap();
        queue.execute(&[&list]).unwrap();

        drop(src);
        backend.run_pending();
        assert_eq!(backend.stats().use_after_free, 1);
        assert_eq!(backend.stats().resources_alive, 1);
    }

    #[test]
    fn test_texture_copy_strips_row_padding() {
        let backend = SoftwareBackend::new();
        let queue = backend.create_queue(QueueKind::Copy).unwrap();
        let info = TextureInfo {
            dimension: TextureDimension::D2,
            width: 2,
            height: 2,
            depth: 1,
            mip_levels: 1,
            format: TextureFormat::Rgba8Unorm,
            usage: TextureUsage::default(),
        };
        let texture = backend
            .create_resource(&ResourceDesc::texture("tex", info))
            .unwrap();
        let footprint = TextureFootprint::for_subresource(&info, 0);
        let mut upload = backend
            .create_resource(&ResourceDesc::buffer(
                "staging",
                footprint.upload_size(),
                MemoryKind::Upload,
            ))
            .unwrap();
        upload.write_bytes(0, &[1; 8]).unwrap();
        upload.write_bytes(footprint.row_pitch, &[2; 8]).unwrap();

        let mut list = backend.create_command_list(QueueKind::Copy).unwrap();
        list.copy_buffer_to_texture(&texture, &upload, &footprint)
            .unwrap();
        list.close().unwrap();
        queue.execute(&[&list]).unwrap();

        let mut expected = vec![1u8; 8];
        expected.extend_from_slice(&[2; 8]);
        assert_eq!(texture.contents(), expected);
    }

    #[test]
    fn test_lost_device_rejects_everything() {
        let backend = SoftwareBackend::new();
        let queue = backend.create_queue(QueueKind::Copy).unwrap();
        let fence = backend.create_fence(0).unwrap();
        backend.lose_device();

        assert!(matches!(
            backend.create_resource(&ResourceDesc::buffer("b", 4, MemoryKind::Upload)),
            Err(RhiError::DeviceLost(_))
        ));
        assert!(matches!(
            queue.signal(&fence, 1),
            Err(RhiError::DeviceLost(_))
        ));
        assert!(matches!(
            backend.check_device(),
            Err(RhiError::DeviceLost(_))
        ));
    }

    #[test]
    fn test_repeated_signal_value_is_counted() {
        let backend = SoftwareBackend::new();
        let queue = backend.create_queue(QueueKind::Copy).unwrap();
        let fence = backend.create_fence(0).unwrap();

        queue.signal(&fence, 1).unwrap();
        queue.signal(&fence, 2).unwrap();
        assert_eq!(backend.stats().stale_signals, 0);
        queue.signal(&fence, 2).unwrap();
        assert_eq!(backend.stats().stale_signals, 1);
        assert_eq!(fence.completed_value().unwrap(), 2);
    }

    #[test]
    fn test_allocation_limit() {
        let backend = SoftwareBackend::new();
        backend.limit_allocations(1);
        let desc = ResourceDesc::buffer("b", 4, MemoryKind::Upload);

        assert!(backend.create_resource(&desc).is_ok());
        assert!(matches!(
            backend.create_resource(&desc),
            Err(RhiError::Backend(_))
        ));
        assert_eq!(backend.stats().resources_created, 1);
    }

    #[test]
    fn test_list_reset_fails_on_lost_device() {
        let backend = SoftwareBackend::new();
        let mut list = backend.create_command_list(QueueKind::Copy).unwrap();
        list.close().unwrap();
        backend.lose_device();

        assert!(matches!(list.reset(), Err(RhiError::DeviceLost(_))));
    }

    #[test]
    fn test_heaps_have_distinct_handles() {
        let backend = SoftwareBackend::new();
        let a = backend
            .create_descriptor_heap(DescriptorHeapKind::Sampler, 4)
            .unwrap();
        let b = backend
            .create_descriptor_heap(DescriptorHeapKind::Sampler, 4)
            .unwrap();
        assert_ne!(a.cpu_start(), b.cpu_start());
        assert_ne!(a.cpu_start(), 0);

        let rtv = backend
            .create_descriptor_heap(DescriptorHeapKind::RenderTarget, 4)
            .unwrap();
        assert_eq!(rtv.gpu_start(), 0);
    }
}

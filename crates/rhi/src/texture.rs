//! Textures and samplers.
//!
//! A [`Texture`] owns one GPU-resident resource plus the descriptors created
//! for it. Initial texel data goes through upload resources whose rows are
//! padded to [`TEXTURE_PITCH_ALIGNMENT`]; each upload resource is handed to
//! the release queue as soon as its copy is recorded, so it lives exactly
//! until the frame that consumes it completes.
//!
//! Descriptors are allocated on first request and cached: one shader
//! resource and one unordered access view per mip level, one render target
//! view and one depth-stencil view. Retiring a texture defers the resource
//! and every cached descriptor together.

use tracing::{debug, warn};

use crate::backend::{
    GpuResource, MemoryKind, RenderBackend, ResourceDesc, TEXTURE_PITCH_ALIGNMENT,
    TextureDimension, TextureFootprint, TextureFormat, TextureInfo, TextureUsage,
};
use crate::buffer::UploadContext;
use crate::descriptor::{Descriptor, DescriptorHeapPool, SamplerDesc};
use crate::error::{RhiError, RhiResult};
use crate::release::{ReleaseQueue, Retired};

/// Creation parameters for a [`Texture`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TextureDesc {
    /// Debug name
    pub name: String,
    /// 2D or 3D
    pub dimension: TextureDimension,
    /// Width in texels
    pub width: u32,
    /// Height in texels
    pub height: u32,
    /// Depth in texels (1 for 2D)
    pub depth: u32,
    /// Mip levels (at least 1)
    pub mip_levels: u32,
    /// Texel format
    pub format: TextureFormat,
    /// Extra binding flags
    pub usage: TextureUsage,
}

impl TextureDesc {
    /// Describes a single-mip 2D texture.
    pub fn new_2d(name: impl Into<String>, width: u32, height: u32, format: TextureFormat) -> Self {
        Self {
            name: name.into(),
            dimension: TextureDimension::D2,
            width,
            height,
            depth: 1,
            mip_levels: 1,
            format,
            usage: TextureUsage::default(),
        }
    }

    /// Describes a single-mip 3D texture.
    pub fn new_3d(
        name: impl Into<String>,
        width: u32,
        height: u32,
        depth: u32,
        format: TextureFormat,
    ) -> Self {
        Self {
            dimension: TextureDimension::D3,
            depth,
            ..Self::new_2d(name, width, height, format)
        }
    }

    /// Sets the number of mip levels.
    pub fn with_mip_levels(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels;
        self
    }

    /// Sets the binding flags.
    pub fn with_usage(mut self, usage: TextureUsage) -> Self {
        self.usage = usage;
        self
    }

    /// Shape and format as the backend sees it.
    pub fn info(&self) -> TextureInfo {
        TextureInfo {
            dimension: self.dimension,
            width: self.width,
            height: self.height,
            depth: self.depth,
            mip_levels: self.mip_levels,
            format: self.format,
            usage: self.usage,
        }
    }

    fn validate(&self) -> RhiResult<()> {
        let invalid = |reason: String| {
            Err(RhiError::InvalidUsage(format!(
                "texture '{}': {}",
                self.name, reason
            )))
        };

        if self.width == 0 || self.height == 0 || self.depth == 0 {
            return invalid(format!(
                "zero extent {}x{}x{}",
                self.width, self.height, self.depth
            ));
        }
        if self.dimension == TextureDimension::D2 && self.depth != 1 {
            return invalid(format!("2D texture with depth {}", self.depth));
        }

        let largest = match self.dimension {
            TextureDimension::D2 => self.width.max(self.height),
            TextureDimension::D3 => self.width.max(self.height).max(self.depth),
        };
        let max_mips = u32::BITS - largest.leading_zeros();
        if self.mip_levels == 0 || self.mip_levels > max_mips {
            return invalid(format!(
                "{} mip levels (1..={} allowed)",
                self.mip_levels, max_mips
            ));
        }

        if self.usage.contains(TextureUsage::DEPTH_STENCIL) && !self.format.is_depth() {
            return invalid(format!("{:?} cannot be a depth-stencil target", self.format));
        }
        if self.format.is_depth()
            && self
                .usage
                .intersects(TextureUsage::RENDER_TARGET | TextureUsage::UNORDERED_ACCESS)
        {
            return invalid(format!(
                "depth format {:?} cannot be a color or unordered target",
                self.format
            ));
        }
        Ok(())
    }
}

/// A GPU-resident texture with cached descriptors.
pub struct Texture<B: RenderBackend> {
    desc: TextureDesc,
    resource: B::Resource,
    srv: Vec<Option<Descriptor>>,
    uav: Vec<Option<Descriptor>>,
    rtv: Option<Descriptor>,
    dsv: Option<Descriptor>,
}

impl<B: RenderBackend> Texture<B> {
    /// Creates a texture and optionally uploads texel data.
    ///
    /// `data` is tightly packed and covers either mip 0 or the whole mip chain.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::InvalidUsage`] for an invalid description, data of
    /// the wrong size, or data for a depth format.
    pub fn new(
        ctx: &mut UploadContext<'_, B>,
        desc: TextureDesc,
        data: Option<&[u8]>,
    ) -> RhiResult<Self> {
        desc.validate()?;
        let info = desc.info();

        let uploaded_mips = match data {
            None => 0,
            Some(_) if desc.format.is_depth() => {
                return Err(RhiError::InvalidUsage(format!(
                    "texture '{}': depth formats cannot be uploaded",
                    desc.name
                )));
            }
            Some(data) if data.len() as u64 == info.total_size() => desc.mip_levels,
            Some(data) if data.len() as u64 == info.mip_size(0) => 1,
            Some(data) => {
                return Err(RhiError::InvalidUsage(format!(
                    "texture '{}': {} bytes of data, expected {} (mip 0) or {} (all mips)",
                    desc.name,
                    data.len(),
                    info.mip_size(0),
                    info.total_size()
                )));
            }
        };

        let resource = ctx
            .backend
            .create_resource(&ResourceDesc::texture(desc.name.clone(), info))?;

        if let Some(data) = data {
            for mip in 0..uploaded_mips {
                let offset = info.mip_offset(mip) as usize;
                let texels = &data[offset..offset + info.mip_size(mip) as usize];
                if let Err(err) =
                    Self::upload_subresource(ctx, &resource, &desc.name, &info, mip, texels)
                {
                    // Earlier mips already recorded copies into the resource.
                    warn!(
                        "Texture '{}' failed to upload mip {}: {}; deferring its destruction",
                        desc.name, mip, err
                    );
                    ctx.release_queue
                        .push(ctx.frame_number, Retired::Resource(resource));
                    return Err(err);
                }
            }
        }

        debug!(
            "Created {}x{}x{} {:?} texture '{}' ({} mips, {} uploaded)",
            desc.width,
            desc.height,
            desc.depth,
            desc.format,
            desc.name,
            desc.mip_levels,
            uploaded_mips
        );

        let mips = desc.mip_levels as usize;
        Ok(Self {
            desc,
            resource,
            srv: vec![None; mips],
            uav: vec![None; mips],
            rtv: None,
            dsv: None,
        })
    }

    fn upload_subresource(
        ctx: &mut UploadContext<'_, B>,
        resource: &B::Resource,
        name: &str,
        info: &TextureInfo,
        mip: u32,
        texels: &[u8],
    ) -> RhiResult<()> {
        let footprint = TextureFootprint::for_subresource(info, mip);
        let mut upload = ctx.backend.create_resource(&ResourceDesc::buffer(
            format!("{name} (upload mip {mip})"),
            footprint.upload_size(),
            MemoryKind::Upload,
        ))?;

        let row = footprint.row_size as usize;
        let mut rows = texels.chunks_exact(row);
        for z in 0..footprint.depth {
            for y in 0..footprint.height {
                if let Some(src) = rows.next() {
                    upload.write_bytes(footprint.row_offset(y, z), src)?;
                }
            }
        }

        ctx.command_list
            .copy_buffer_to_texture(resource, &upload, &footprint)?;
        ctx.release_queue
            .push(ctx.frame_number, Retired::Resource(upload));
        Ok(())
    }

    // ===== Descriptors =====

    /// Shader resource view of `mip`, allocated on first use.
    pub fn srv(&mut self, pool: &mut DescriptorHeapPool<B>, mip: u32) -> RhiResult<Descriptor> {
        let index = self.check_mip(mip)?;
        if let Some(descriptor) = self.srv[index] {
            return Ok(descriptor);
        }
        let descriptor = pool.allocate_sr_descriptor(&self.resource, mip)?;
        self.srv[index] = Some(descriptor);
        Ok(descriptor)
    }

    /// Unordered access view of `mip`, allocated on first use.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::InvalidUsage`] unless created with unordered access.
    pub fn uav(&mut self, pool: &mut DescriptorHeapPool<B>, mip: u32) -> RhiResult<Descriptor> {
        self.check_usage(TextureUsage::UNORDERED_ACCESS, "unordered access")?;
        let index = self.check_mip(mip)?;
        if let Some(descriptor) = self.uav[index] {
            return Ok(descriptor);
        }
        let descriptor = pool.allocate_ua_descriptor(&self.resource, mip)?;
        self.uav[index] = Some(descriptor);
        Ok(descriptor)
    }

    /// Render target view, allocated on first use.
    pub fn rtv(&mut self, pool: &mut DescriptorHeapPool<B>) -> RhiResult<Descriptor> {
        self.check_usage(TextureUsage::RENDER_TARGET, "render target")?;
        if let Some(descriptor) = self.rtv {
            return Ok(descriptor);
        }
        let descriptor = pool.allocate_rt_descriptor(&self.resource)?;
        self.rtv = Some(descriptor);
        Ok(descriptor)
    }

    /// Depth-stencil view, allocated on first use.
    pub fn dsv(&mut self, pool: &mut DescriptorHeapPool<B>) -> RhiResult<Descriptor> {
        self.check_usage(TextureUsage::DEPTH_STENCIL, "depth stencil")?;
        if let Some(descriptor) = self.dsv {
            return Ok(descriptor);
        }
        let descriptor = pool.allocate_ds_descriptor(&self.resource)?;
        self.dsv = Some(descriptor);
        Ok(descriptor)
    }

    fn check_mip(&self, mip: u32) -> RhiResult<usize> {
        if mip >= self.desc.mip_levels {
            return Err(RhiError::InvalidUsage(format!(
                "texture '{}' has {} mip levels, requested {}",
                self.desc.name, self.desc.mip_levels, mip
            )));
        }
        Ok(mip as usize)
    }

    fn check_usage(&self, required: TextureUsage, what: &str) -> RhiResult<()> {
        if !self.desc.usage.contains(required) {
            return Err(RhiError::InvalidUsage(format!(
                "texture '{}' was not created for {} use",
                self.desc.name, what
            )));
        }
        Ok(())
    }

    // ===== Retirement =====

    /// Defers the resource and every cached descriptor until `frame_number` completes.
    pub fn retire(self, frame_number: u64, queue: &mut ReleaseQueue<Retired<B>>) {
        debug!("Retiring texture '{}' at frame {}", self.desc.name, frame_number);
        let descriptors = self
            .srv
            .into_iter()
            .chain(self.uav)
            .chain([self.rtv, self.dsv])
            .flatten();
        for descriptor in descriptors {
            queue.push(frame_number, Retired::Descriptor(descriptor));
        }
        queue.push(frame_number, Retired::Resource(self.resource));
    }

    // ===== Accessors =====

    /// Number of subresources (one per mip level).
    #[inline]
    pub fn subresource_count(&self) -> u32 {
        self.desc.mip_levels
    }

    /// Upload layout of mip level `mip`.
    pub fn subresource_footprint(&self, mip: u32) -> RhiResult<TextureFootprint> {
        self.check_mip(mip)?;
        Ok(TextureFootprint::for_subresource(&self.desc.info(), mip))
    }

    /// Creation parameters.
    #[inline]
    pub fn desc(&self) -> &TextureDesc {
        &self.desc
    }

    /// GPU resource.
    #[inline]
    pub fn resource(&self) -> &B::Resource {
        &self.resource
    }

    /// Row pitch alignment used for uploads.
    #[inline]
    pub fn pitch_alignment(&self) -> u64 {
        TEXTURE_PITCH_ALIGNMENT
    }
}

/// Sampler state with a lazily allocated descriptor.
pub struct Sampler {
    desc: SamplerDesc,
    descriptor: Option<Descriptor>,
}

impl Sampler {
    /// Creates a sampler without allocating its descriptor.
    pub fn new(desc: SamplerDesc) -> Self {
        Self {
            desc,
            descriptor: None,
        }
    }

    /// Sampler descriptor, allocated on first use.
    pub fn descriptor<B: RenderBackend>(
        &mut self,
        pool: &mut DescriptorHeapPool<B>,
    ) -> RhiResult<Descriptor> {
        if let Some(descriptor) = self.descriptor {
            return Ok(descriptor);
        }
        let descriptor = pool.allocate_sampler_descriptor(&self.desc)?;
        self.descriptor = Some(descriptor);
        Ok(descriptor)
    }

    /// Sampler state.
    #[inline]
    pub fn desc(&self) -> &SamplerDesc {
        &self.desc
    }

    /// Defers the descriptor (if allocated) until `frame_number` completes.
    pub fn retire<B: RenderBackend>(self, frame_number: u64, queue: &mut ReleaseQueue<Retired<B>>) {
        if let Some(descriptor) = self.descriptor {
            queue.push(frame_number, Retired::Descriptor(descriptor));
        }
    }
}

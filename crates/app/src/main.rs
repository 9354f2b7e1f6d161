//! frameflight - headless frame-pipeline driver
//!
//! Runs the render device for a fixed number of frames without a window:
//! static geometry and a texture are uploaded once, a constant buffer is
//! rewritten every frame, and per-frame descriptors are recycled through
//! deferred release. Settings come from `FRAMEFLIGHT_*` environment
//! variables (see [`RenderConfig`]).

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use tracing::info;

use frameflight_core::{BackendKind, RenderConfig};
use frameflight_renderer::FrameManager;
use frameflight_rhi::backend::{RenderBackend, TextureFormat};
use frameflight_rhi::software::SoftwareBackend;
use frameflight_rhi::{
    BufferDesc, BufferUsage, BufferViewKind, DescriptorCapacities, DeviceConfig, RenderDevice,
    Sampler, SamplerDesc, TextureDesc,
};

const CHECKER_SIZE: u32 = 64;
const CHECKER_CELL: u32 = 8;

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct Vertex {
    position: [f32; 3],
    color: [f32; 3],
}

const TRIANGLE: [Vertex; 3] = [
    Vertex {
        position: [0.0, -0.5, 0.0],
        color: [1.0, 0.0, 0.0],
    },
    Vertex {
        position: [0.5, 0.5, 0.0],
        color: [0.0, 1.0, 0.0],
    },
    Vertex {
        position: [-0.5, 0.5, 0.0],
        color: [0.0, 0.0, 1.0],
    },
];

/// Per-frame shader constants.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct FrameConstants {
    model_view_projection: Mat4,
    time: f32,
    _padding: [f32; 3],
}

impl FrameConstants {
    fn at(time: f32) -> Self {
        let projection = Mat4::perspective_rh(60f32.to_radians(), 16.0 / 9.0, 0.1, 100.0);
        let view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 3.0), Vec3::ZERO, Vec3::Y);
        let model = Mat4::from_rotation_y(time);
        Self {
            model_view_projection: projection * view * model,
            time,
            _padding: [0.0; 3],
        }
    }
}

fn device_config(config: &RenderConfig) -> DeviceConfig {
    DeviceConfig {
        descriptor_capacities: DescriptorCapacities::uniform(config.descriptor_capacity),
        max_command_lists: config.max_command_lists,
        gpu_wait_timeout: config.gpu_wait_timeout,
        ..DeviceConfig::default()
    }
}

fn checkerboard() -> Vec<u8> {
    (0..CHECKER_SIZE * CHECKER_SIZE)
        .flat_map(|i| {
            let (x, y) = (i % CHECKER_SIZE, i / CHECKER_SIZE);
            if (x / CHECKER_CELL + y / CHECKER_CELL) % 2 == 0 {
                [255, 255, 255, 255]
            } else {
                [32, 32, 32, 255]
            }
        })
        .collect()
}

fn run<B: RenderBackend>(backend: Arc<B>, config: &RenderConfig) -> Result<()> {
    let backend_name = backend.name().to_string();
    let mut device = RenderDevice::new(backend, device_config(config))?;
    let mut frames = FrameManager::new(&device, config.frames_in_flight)?;

    let vertices = device.create_buffer(
        BufferDesc::for_type::<Vertex>("triangle", TRIANGLE.len() as u32, BufferUsage::Default),
        Some(bytemuck::cast_slice(&TRIANGLE)),
    )?;
    let constants = device.create_buffer(
        BufferDesc::for_type::<FrameConstants>("frame constants", 1, BufferUsage::Upload),
        None,
    )?;
    let texture = device.create_texture(
        TextureDesc::new_2d("checkerboard", CHECKER_SIZE, CHECKER_SIZE, TextureFormat::Rgba8Unorm),
        Some(&checkerboard()),
    )?;
    let texture_srv = device.texture_srv(texture, 0)?;
    let mut sampler = Sampler::new(SamplerDesc::default());
    let sampler_descriptor = device.sampler_descriptor(&mut sampler)?;
    let vertex_srv = device.allocate_buffer_descriptor(vertices, BufferViewKind::ShaderResource)?;

    info!(
        "Rendering {} frames on the {} backend (texture srv {}, sampler {}, vertices {})",
        config.frame_count,
        backend_name,
        texture_srv.index(),
        sampler_descriptor.index(),
        vertex_srv.index()
    );

    let start = Instant::now();
    let mut released = 0;
    let mut recycled = 0;
    for _ in 0..config.frame_count {
        frames.begin_frame(&device)?;

        let time = start.elapsed().as_secs_f32();
        device.write_buffer_pod(constants, &[FrameConstants::at(time)])?;

        // The upload resource rotates every frame, so its view is rebuilt
        // and handed back once the frame completes.
        let constants_view = device.allocate_buffer_descriptor(constants, BufferViewKind::Constant)?;
        device.safe_release_descriptor(constants_view);

        let report = frames.end_frame(&mut device)?;
        released += report.released;
        recycled += report.command_lists_recycled;
    }

    frames.flush(&mut device).context("failed to drain the GPU")?;
    let upload_allocations = device.buffer(constants)?.upload_allocations();
    device.safe_release_descriptor(vertex_srv);
    device.destroy_sampler(sampler);
    device.destroy_texture(texture)?;
    device.destroy_buffer(constants)?;
    device.destroy_buffer(vertices)?;
    device.flush()?;

    let elapsed = start.elapsed();
    info!(
        "Rendered {} frames in {:.2?} ({:.1} fps): {} deferred releases, {} upload lists recycled",
        config.frame_count,
        elapsed,
        config.frame_count as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
        released,
        recycled
    );
    info!(
        "Upload allocations for frame constants: {}, graphics lists created: {}",
        upload_allocations,
        frames.command_lists().created_count()
    );
    Ok(())
}

#[cfg(feature = "vulkan")]
fn run_vulkan(config: &RenderConfig) -> Result<()> {
    let backend = frameflight_rhi::vulkan::VulkanBackend::new(config.validation)
        .context("failed to initialize Vulkan")?;
    info!("Using GPU: {}", backend.device_name());
    run(Arc::new(backend), config)
}

#[cfg(not(feature = "vulkan"))]
fn run_vulkan(config: &RenderConfig) -> Result<()> {
    tracing::warn!("Built without the vulkan feature; falling back to the software backend");
    run(Arc::new(SoftwareBackend::new()), config)
}

fn main() -> Result<()> {
    let config = RenderConfig::from_env().context("invalid configuration")?;
    frameflight_core::init_logging();
    info!("Starting frameflight ({:?})", config);

    match config.backend {
        BackendKind::Software => run(Arc::new(SoftwareBackend::new()), &config),
        BackendKind::Vulkan => run_vulkan(&config),
    }
}

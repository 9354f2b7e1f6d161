//! Frame pacing on top of the frameflight render device.
//!
//! This crate owns the render loop's side of the frame pipeline:
//! - Bounding how many frames the CPU may run ahead of the GPU
//! - Graphics command list recycling
//! - Ordering graphics work after the frame's uploads
//! - Reporting completed frames to [`frameflight_rhi::RenderDevice`]

pub mod frame_manager;

pub use frame_manager::FrameManager;

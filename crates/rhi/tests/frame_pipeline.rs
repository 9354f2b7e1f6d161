//! Integration tests for the frame pipeline on the software backend.
//!
//! Most tests use the deferred software device so the "GPU" lags behind the
//! CPU exactly as far as each test decides.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use frameflight_rhi::backend::{MemoryKind, RenderBackend, ResourceDesc, TextureFormat};
use frameflight_rhi::software::SoftwareBackend;
use frameflight_rhi::{
    BufferDesc, BufferUsage, DescriptorCapacities, DescriptorHeapKind, DescriptorHeapPool,
    DeviceConfig, RenderDevice, RhiError, SamplerDesc, TextureDesc,
};

fn init_logging() {
    let _ = frameflight_core::try_init_logging();
}

fn config() -> DeviceConfig {
    DeviceConfig {
        gpu_wait_timeout: Duration::from_millis(50),
        ..DeviceConfig::default()
    }
}

fn deferred_device() -> (SoftwareBackend, RenderDevice<SoftwareBackend>) {
    init_logging();
    let backend = SoftwareBackend::deferred();
    let device = RenderDevice::new(Arc::new(backend.clone()), config()).unwrap();
    (backend, device)
}

#[test]
fn test_descriptor_pool_of_four() {
    init_logging();
    let backend = SoftwareBackend::new();
    let mut pool = DescriptorHeapPool::new(&backend, DescriptorCapacities::uniform(4)).unwrap();

    let indices: HashSet<u32> = (0..4)
        .map(|_| {
            pool.allocate_sampler_descriptor(&SamplerDesc::default())
                .unwrap()
                .index()
        })
        .collect();
    assert_eq!(indices, HashSet::from([0, 1, 2, 3]));

    let fifth = pool.allocate_sampler_descriptor(&SamplerDesc::default());
    assert!(matches!(
        fifth,
        Err(RhiError::PoolExhausted { capacity: 4, .. })
    ));
    assert_eq!(pool.heap(DescriptorHeapKind::Sampler).allocated_count(), 4);
}

#[test]
fn test_default_buffer_upload_scenario() {
    let (backend, mut device) = deferred_device();
    let data: Vec<u8> = (0..64).collect();

    let buffer = device
        .create_buffer(BufferDesc::new("scenario", 1, 64, BufferUsage::Default), None)
        .unwrap();
    device.write_buffer(buffer, &data, 0).unwrap();

    let frame = device.frame_number();
    device.execute_uploading().unwrap();
    assert_eq!(device.buffer(buffer).unwrap().in_flight_count(), 1);

    backend.run_pending();
    device.copy_fence().wait_for_gpu().unwrap();
    device.finish_frame(frame).unwrap();

    let buffer = device.buffer(buffer).unwrap();
    assert_eq!(buffer.in_flight_count(), 0);
    assert_eq!(buffer.default_resource().unwrap().contents(), data);
}

#[test]
fn test_round_trip_of_partial_write() {
    let (backend, mut device) = deferred_device();
    let buffer = device
        .create_buffer(BufferDesc::new("partial", 4, 32, BufferUsage::Default), None)
        .unwrap();

    let data = [0xAB; 40];
    device.write_buffer(buffer, &data, 0).unwrap();
    device.execute_uploading().unwrap();
    backend.run_pending();
    device.copy_fence().wait_for_gpu().unwrap();

    let contents = device
        .buffer(buffer)
        .unwrap()
        .default_resource()
        .unwrap()
        .contents();
    assert_eq!(&contents[..40], &data[..]);
    assert!(contents[40..].iter().all(|&b| b == 0));
}

#[test]
fn test_write_after_execute_in_same_frame_is_uploaded() {
    init_logging();
    let backend = SoftwareBackend::new();
    let mut device = RenderDevice::new(Arc::new(backend.clone()), config()).unwrap();
    let buffer = device
        .create_buffer(BufferDesc::new("late", 1, 8, BufferUsage::Default), None)
        .unwrap();
    let frame = device.frame_number();

    device.write_buffer(buffer, &[1; 8], 0).unwrap();
    device.execute_uploading().unwrap();
    device.write_buffer(buffer, &[2; 8], 0).unwrap();
    device.execute_uploading().unwrap().wait_for_gpu().unwrap();
    assert_eq!(backend.stats().commands_executed, 2);
    assert_eq!(device.buffer(buffer).unwrap().in_flight_count(), 2);

    device.finish_frame(frame).unwrap();
    let buffer = device.buffer(buffer).unwrap();
    assert_eq!(buffer.in_flight_count(), 0);
    assert_eq!(buffer.default_resource().unwrap().contents(), vec![2; 8]);
    assert_eq!(backend.stats().stale_signals, 0);
    assert_eq!(backend.stats().use_after_free, 0);
}

#[test]
fn test_second_upload_batch_signals_a_fresh_value() {
    let (backend, mut device) = deferred_device();
    let buffer = device
        .create_buffer(BufferDesc::new("batched", 1, 8, BufferUsage::Default), None)
        .unwrap();
    let frame = device.frame_number();

    device.write_buffer(buffer, &[1; 8], 0).unwrap();
    device.execute_uploading().unwrap();
    device.write_buffer(buffer, &[2; 8], 0).unwrap();
    let fence = device.execute_uploading().unwrap();
    assert_eq!(fence.expected_value(), frame + 1);
    // Two batches, each followed by its own signal.
    assert_eq!(backend.pending_work(), 4);

    // Nothing new was recorded, so this neither submits nor signals.
    device.execute_uploading().unwrap();
    assert_eq!(backend.pending_work(), 4);

    backend.run_pending();
    assert_eq!(device.copy_fence().completed_value().unwrap(), frame + 1);
    device.finish_frame(frame).unwrap();

    device.write_buffer(buffer, &[3; 8], 0).unwrap();
    device.execute_uploading().unwrap();
    backend.run_pending();
    assert_eq!(device.copy_fence().completed_value().unwrap(), frame + 2);
    assert_eq!(backend.stats().stale_signals, 0);
    assert_eq!(
        device.buffer(buffer).unwrap().default_resource().unwrap().contents(),
        vec![3; 8]
    );
}

#[test]
fn test_partial_write_does_not_expose_stale_tail() {
    init_logging();
    let backend = SoftwareBackend::new();
    let mut device = RenderDevice::new(Arc::new(backend.clone()), config()).unwrap();
    let buffer = device
        .create_buffer(BufferDesc::new("tail", 1, 16, BufferUsage::Default), Some(&[9; 16]))
        .unwrap();

    let frame = device.frame_number();
    device.execute_uploading().unwrap().wait_for_gpu().unwrap();
    device.finish_frame(frame).unwrap();

    device.write_buffer(buffer, &[1; 4], 0).unwrap();
    let frame = device.frame_number();
    device.execute_uploading().unwrap().wait_for_gpu().unwrap();
    device.finish_frame(frame).unwrap();

    let mut expected = vec![1u8; 4];
    expected.extend_from_slice(&[0; 12]);
    assert_eq!(
        device.buffer(buffer).unwrap().default_resource().unwrap().contents(),
        expected
    );
}

#[test]
fn test_releases_never_precede_gpu_completion() {
    let (backend, mut device) = deferred_device();
    let buffer = device
        .create_buffer(BufferDesc::new("streamed", 4, 16, BufferUsage::Default), None)
        .unwrap();

    for i in 0..24u8 {
        let frame = device.frame_number();

        device.write_buffer(buffer, &[i; 64], 0).unwrap();
        let transient = backend
            .create_resource(&ResourceDesc::buffer("transient", 16, MemoryKind::Upload))
            .unwrap();
        device.safe_release(transient, None);
        device.execute_uploading().unwrap();

        // The GPU catches up only every third frame.
        if i % 3 == 2 {
            backend.run_pending();
        }

        let completed = device.copy_fence().completed_value().unwrap();
        device.finish_frame(completed).unwrap();

        let outstanding = frame.saturating_sub(completed) as usize;
        assert_eq!(device.pending_releases(), outstanding);
    }

    backend.run_pending();
    assert_eq!(backend.stats().use_after_free, 0);
}

#[test]
fn test_upload_allocations_plateau() {
    init_logging();
    let frames_in_flight = 2;
    let mut device =
        RenderDevice::new(Arc::new(SoftwareBackend::new()), DeviceConfig::default()).unwrap();
    let constants = device
        .create_buffer(BufferDesc::new("constants", 256, 1, BufferUsage::Upload), None)
        .unwrap();

    let mut allocations = Vec::new();
    for _ in 0..30 {
        let frame = device.frame_number();
        device.write_buffer(constants, &[1; 200], 256).unwrap();
        device.execute_uploading().unwrap();
        device
            .finish_frame(frame.saturating_sub(frames_in_flight))
            .unwrap();
        allocations.push(device.buffer(constants).unwrap().upload_allocations());
    }

    assert_eq!(allocations[9], allocations[29]);
    assert_eq!(allocations[29], frames_in_flight as usize + 1);
}

#[test]
fn test_finish_frame_is_idempotent() {
    let (backend, mut device) = deferred_device();
    let buffer = device
        .create_buffer(BufferDesc::new("b", 1, 16, BufferUsage::Default), Some(&[3; 16]))
        .unwrap();
    let sampler = device
        .create_sampler_descriptor(&SamplerDesc::default())
        .unwrap();
    device.safe_release_descriptor(sampler);
    device.destroy_buffer(buffer).unwrap();

    let frame = device.frame_number();
    device.execute_uploading().unwrap();
    backend.run_pending();

    let first = device.finish_frame(frame).unwrap();
    assert_eq!(first.released, 3);
    assert_eq!(first.command_lists_recycled, 1);

    let second = device.finish_frame(frame).unwrap();
    assert_eq!(second.released, 0);
    assert_eq!(second.command_lists_recycled, 0);
    assert_eq!(second.upload_resources_reclaimed, 0);
}

#[test]
fn test_hung_gpu_times_out() {
    let (backend, mut device) = deferred_device();
    let buffer = device
        .create_buffer(BufferDesc::new("b", 1, 8, BufferUsage::Default), Some(&[1; 8]))
        .unwrap();
    assert!(device.buffer(buffer).is_ok());

    let result = device.execute_uploading().unwrap().wait_for_gpu();
    match result {
        Err(RhiError::Timeout {
            target, completed, ..
        }) => {
            assert_eq!(target, 1);
            assert_eq!(completed, 0);
        }
        other => panic!("expected timeout, got {:?}", other),
    }

    backend.run_pending();
    assert!(device.copy_fence().wait_for_gpu().is_ok());
}

#[test]
fn test_device_loss_is_distinct_and_sticky() {
    let (backend, mut device) = deferred_device();
    let buffer = device
        .create_buffer(BufferDesc::new("b", 1, 8, BufferUsage::Default), Some(&[1; 8]))
        .unwrap();

    backend.lose_device();

    let err = device.execute_uploading().err().unwrap();
    assert!(matches!(err, RhiError::DeviceLost(_)));
    assert!(err.is_fatal());
    assert!(matches!(
        device.copy_fence().wait_for_gpu(),
        Err(RhiError::DeviceLost(_))
    ));
    assert!(matches!(
        device.finish_frame(1),
        Err(RhiError::DeviceLost(_))
    ));
    assert!(matches!(
        device.write_buffer(buffer, &[2; 8], 0),
        Err(RhiError::DeviceLost(_))
    ));
}

#[test]
fn test_logic_errors_are_recoverable() {
    let (backend, mut device) = deferred_device();

    let sampler = device
        .create_sampler_descriptor(&SamplerDesc::default())
        .unwrap();
    device.free_descriptor(sampler).unwrap();
    assert!(matches!(
        device.free_descriptor(sampler),
        Err(RhiError::DoubleFree { .. })
    ));

    let buffer = device
        .create_buffer(BufferDesc::new("small", 4, 4, BufferUsage::Default), None)
        .unwrap();
    assert!(matches!(
        device.write_buffer(buffer, &[0; 17], 0),
        Err(RhiError::WriteOutOfBounds {
            size: 17,
            capacity: 16
        })
    ));
    assert!(matches!(
        device.write_buffer(buffer, &[0; 10], 32),
        Err(RhiError::WriteOutOfBounds {
            size: 32,
            capacity: 16
        })
    ));

    device.destroy_buffer(buffer).unwrap();
    assert!(matches!(
        device.write_buffer(buffer, &[0; 4], 0),
        Err(RhiError::UnregisteredResource(_))
    ));

    // The device keeps working after every error above.
    let frame = device.frame_number();
    device.execute_uploading().unwrap();
    backend.run_pending();
    device.finish_frame(frame).unwrap();
    assert_eq!(device.pending_releases(), 0);
}

#[test]
fn test_upload_list_recycler_exhaustion() {
    init_logging();
    let backend = SoftwareBackend::deferred();
    let mut device = RenderDevice::new(
        Arc::new(backend.clone()),
        DeviceConfig {
            max_command_lists: 2,
            ..config()
        },
    )
    .unwrap();
    let buffer = device
        .create_buffer(BufferDesc::new("b", 1, 8, BufferUsage::Default), None)
        .unwrap();

    // Frame 1 submits a list the GPU never finishes.
    device.write_buffer(buffer, &[1; 8], 0).unwrap();
    device.execute_uploading().unwrap();
    device.finish_frame(0).unwrap();
    assert_eq!(device.upload_lists().created_count(), 2);

    // Frame 2 submits the second list and finds nothing to record frame 3 into.
    device.write_buffer(buffer, &[2; 8], 0).unwrap();
    device.execute_uploading().unwrap();
    assert!(matches!(
        device.finish_frame(0),
        Err(RhiError::PoolExhausted {
            pool: "command list",
            capacity: 2
        })
    ));

    // Once the GPU catches up the lists come back.
    backend.run_pending();
    let completed = device.copy_fence().completed_value().unwrap();
    let report = device.finish_frame(completed).unwrap();
    assert_eq!(report.command_lists_recycled, 2);
    assert_eq!(device.upload_lists().created_count(), 2);
}

#[test]
fn test_texture_upload_round_trip() {
    let (backend, mut device) = deferred_device();
    let (width, height) = (5u32, 3u32);
    let texels: Vec<u8> = (0..width * height * 4).map(|i| i as u8).collect();

    let texture = device
        .create_texture(
            TextureDesc::new_2d("checker", width, height, TextureFormat::Rgba8Unorm),
            Some(&texels),
        )
        .unwrap();
    let srv = device.texture_srv(texture, 0).unwrap();
    assert!(srv.valid());
    assert_eq!(device.texture_srv(texture, 0).unwrap(), srv);

    let frame = device.frame_number();
    device.execute_uploading().unwrap();
    backend.run_pending();
    device.finish_frame(frame).unwrap();

    let texture_ref = device.texture(texture).unwrap();
    assert_eq!(texture_ref.resource().contents(), texels);
    assert_eq!(device.pending_releases(), 0);

    device.destroy_texture(texture).unwrap();
    assert!(device.pending_releases() > 0);
    let frame = device.frame_number();
    device.finish_frame(frame).unwrap();
    assert_eq!(device.pending_releases(), 0);
    assert_eq!(device.descriptor_pool().allocated_count(), 0);
}

//! Headless checks against a real Vulkan device.
//!
//! Run with `cargo test -- --ignored` on a machine with a working driver.

use ash::vk;
use gpu_allocator::MemoryLocation;
use std::sync::Arc;
use std::time::{Duration, Instant};

use frame_pacer::backend::memory::{GpuBuffer, GpuImage};
use frame_pacer::backend::pipeline_cache::PipelineCache;
use frame_pacer::backend::staging::{self, BufferUpload, ImageUpload};
use frame_pacer::backend::sync::{self, DEFAULT_FENCE_TIMEOUT_NS};
use frame_pacer::backend::{command, CommandPool, DeviceDesc, Fence, FenceStatus, VulkanDevice};
use frame_pacer::frame::parallel::WorkerPools;
use frame_pacer::frame::FrameRing;
use frame_pacer::FrameError;

fn headless_device() -> Arc<VulkanDevice> {
    let _ = env_logger::builder().is_test(true).try_init();
    let (device, surface) = VulkanDevice::new(&DeviceDesc {
        app_name: "frame-pacer tests",
        enable_validation: false,
        window: None,
    })
    .unwrap();
    assert!(surface.is_none());
    device
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

fn device_local(device: &Arc<VulkanDevice>, size: usize) -> GpuBuffer {
    GpuBuffer::new(
        device,
        "upload target",
        size as vk::DeviceSize,
        vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::TRANSFER_SRC,
        MemoryLocation::GpuOnly,
        false,
    )
    .unwrap()
}

fn readback_buffer(device: &Arc<VulkanDevice>, size: usize) -> GpuBuffer {
    GpuBuffer::new(
        device,
        "readback",
        size as vk::DeviceSize,
        vk::BufferUsageFlags::TRANSFER_DST,
        MemoryLocation::GpuToCpu,
        true,
    )
    .unwrap()
}

fn upload(
    device: &Arc<VulkanDevice>,
    scratch: vk::CommandBuffer,
    target: &GpuBuffer,
    data: &[u8],
    timeout_ns: u64,
) -> frame_pacer::FrameResult<()> {
    staging::upload_to_buffer(
        device,
        data,
        &BufferUpload {
            buffer: target.handle(),
            offset: 0,
            current_access: vk::AccessFlags::TRANSFER_READ,
            new_access: vk::AccessFlags::TRANSFER_READ,
            generating_stages: vk::PipelineStageFlags::TRANSFER,
            consuming_stages: vk::PipelineStageFlags::TRANSFER,
        },
        device.graphics_queue.handle,
        scratch,
        &[],
        timeout_ns,
    )
}

/// Record `copy` into `scratch`, make the result host-visible, submit and wait.
fn copy_to_host(device: &Arc<VulkanDevice>, scratch: vk::CommandBuffer, copy: impl FnOnce()) {
    command::begin(&device.device, scratch, true).unwrap();
    copy();
    let to_host = vk::MemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .dst_access_mask(vk::AccessFlags::HOST_READ);
    unsafe {
        device.device.cmd_pipeline_barrier(
            scratch,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::HOST,
            vk::DependencyFlags::empty(),
            &[to_host],
            &[],
            &[],
        )
    };
    command::end(&device.device, scratch).unwrap();

    let fence = Fence::new(device, false).unwrap();
    sync::submit(device, device.graphics_queue.handle, &[], &[scratch], &[], fence.handle()).unwrap();
    assert_eq!(fence.wait(DEFAULT_FENCE_TIMEOUT_NS).unwrap(), FenceStatus::Signaled);
}

fn read_buffer(device: &Arc<VulkanDevice>, scratch: vk::CommandBuffer, source: &GpuBuffer, size: usize) -> Vec<u8> {
    let readback = readback_buffer(device, size);
    copy_to_host(device, scratch, || unsafe {
        device.device.cmd_copy_buffer(
            scratch,
            source.handle(),
            readback.handle(),
            &[vk::BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size: size as vk::DeviceSize,
            }],
        )
    });
    // The mapping may be padded past the requested size
    readback.mapped().unwrap()[..size].to_vec()
}

#[test]
#[ignore = "requires a Vulkan device"]
fn repeated_upload_matches_a_single_upload() {
    let device = headless_device();
    let pool = CommandPool::new(&device, device.graphics_queue.family).unwrap();
    let scratch = pool.allocate(1).unwrap()[0];
    let data = pattern(64 * 1024 + 3, 7);

    let once = device_local(&device, data.len());
    upload(&device, scratch, &once, &data, DEFAULT_FENCE_TIMEOUT_NS).unwrap();

    let twice = device_local(&device, data.len());
    let baseline = device.live_allocations();
    upload(&device, scratch, &twice, &data, DEFAULT_FENCE_TIMEOUT_NS).unwrap();
    assert_eq!(device.live_allocations(), baseline);
    upload(&device, scratch, &twice, &data, DEFAULT_FENCE_TIMEOUT_NS).unwrap();
    assert_eq!(device.live_allocations(), baseline);

    let single = read_buffer(&device, scratch, &once, data.len());
    let repeated = read_buffer(&device, scratch, &twice, data.len());
    assert_eq!(single, data);
    assert_eq!(repeated, single);
    assert_eq!(device.live_allocations(), baseline);
}

#[test]
#[ignore = "requires a Vulkan device"]
fn image_upload_lands_in_the_requested_layout() {
    let device = headless_device();
    let pool = CommandPool::new(&device, device.graphics_queue.family).unwrap();
    let scratch = pool.allocate(1).unwrap()[0];
    let extent = vk::Extent2D { width: 16, height: 8 };
    let data = pattern((extent.width * extent.height * 4) as usize, 42);

    let image = GpuImage::new_2d(
        &device,
        "upload image",
        vk::Format::R8G8B8A8_UNORM,
        extent,
        vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::TRANSFER_SRC,
    )
    .unwrap();
    let subresource = vk::ImageSubresourceLayers {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        mip_level: 0,
        base_array_layer: 0,
        layer_count: 1,
    };
    let baseline = device.live_allocations();

    staging::upload_to_image(
        &device,
        &data,
        &ImageUpload {
            image: image.handle(),
            subresource,
            offset: vk::Offset3D::default(),
            extent: vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
            current_layout: vk::ImageLayout::UNDEFINED,
            new_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            current_access: vk::AccessFlags::empty(),
            new_access: vk::AccessFlags::TRANSFER_READ,
            generating_stages: vk::PipelineStageFlags::TOP_OF_PIPE,
            consuming_stages: vk::PipelineStageFlags::TRANSFER,
        },
        device.graphics_queue.handle,
        scratch,
        &[],
        DEFAULT_FENCE_TIMEOUT_NS,
    )
    .unwrap();
    assert_eq!(device.live_allocations(), baseline);

    let readback = readback_buffer(&device, data.len());
    copy_to_host(&device, scratch, || unsafe {
        device.device.cmd_copy_image_to_buffer(
            scratch,
            image.handle(),
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            readback.handle(),
            &[vk::BufferImageCopy {
                buffer_offset: 0,
                buffer_row_length: 0,
                buffer_image_height: 0,
                image_subresource: subresource,
                image_offset: vk::Offset3D::default(),
                image_extent: vk::Extent3D {
                    width: extent.width,
                    height: extent.height,
                    depth: 1,
                },
            }],
        )
    });
    assert_eq!(&readback.mapped().unwrap()[..data.len()], &data[..]);
}

#[test]
#[ignore = "requires a Vulkan device"]
fn timed_out_upload_still_releases_staging_memory() {
    let device = headless_device();
    let pool = CommandPool::new(&device, device.graphics_queue.family).unwrap();
    let scratch = pool.allocate(1).unwrap()[0];
    let data = pattern(32 * 1024 * 1024, 3);
    let target = device_local(&device, data.len());
    let baseline = device.live_allocations();

    // A zero timeout polls once; a 32 MiB copy is not done by then
    match upload(&device, scratch, &target, &data, 0) {
        Err(FrameError::FenceTimeout { timeout_ns: 0 }) | Ok(()) => {}
        Err(e) => panic!("unexpected upload error: {}", e),
    }
    assert_eq!(device.live_allocations(), baseline);

    // The device was waited idle, so the target can be written again at once
    upload(&device, scratch, &target, &data, DEFAULT_FENCE_TIMEOUT_NS).unwrap();
    assert_eq!(device.live_allocations(), baseline);
}

#[test]
#[ignore = "requires a Vulkan device"]
fn empty_upload_is_rejected() {
    let device = headless_device();
    let pool = CommandPool::new(&device, device.graphics_queue.family).unwrap();
    let scratch = pool.allocate(1).unwrap()[0];
    let target = GpuBuffer::new(
        &device,
        "upload target",
        16,
        vk::BufferUsageFlags::TRANSFER_DST,
        MemoryLocation::GpuOnly,
        false,
    )
    .unwrap();

    let result = staging::upload_to_buffer(
        &device,
        &[],
        &BufferUpload {
            buffer: target.handle(),
            offset: 0,
            current_access: vk::AccessFlags::empty(),
            new_access: vk::AccessFlags::SHADER_READ,
            generating_stages: vk::PipelineStageFlags::TOP_OF_PIPE,
            consuming_stages: vk::PipelineStageFlags::VERTEX_SHADER,
        },
        device.graphics_queue.handle,
        scratch,
        &[],
        DEFAULT_FENCE_TIMEOUT_NS,
    );
    assert!(matches!(result, Err(FrameError::EmptyUpload)));
}

#[test]
#[ignore = "requires a Vulkan device"]
fn unsubmitted_fence_times_out_and_stays_unsignaled() {
    let device = headless_device();
    let fence = Fence::new(&device, false).unwrap();

    let start = Instant::now();
    assert_eq!(fence.wait(DEFAULT_FENCE_TIMEOUT_NS).unwrap(), FenceStatus::TimedOut);
    assert!(start.elapsed() >= Duration::from_millis(1900));

    assert_eq!(fence.wait(0).unwrap(), FenceStatus::TimedOut);
}

#[test]
#[ignore = "requires a Vulkan device"]
fn fresh_ring_slots_do_not_block() {
    let device = headless_device();
    let pool = CommandPool::new(&device, device.graphics_queue.family).unwrap();

    for count in [2, 3] {
        let ring = FrameRing::new(&device, &pool, count, None).unwrap();
        assert_eq!(ring.len(), count);
        for slot in 0..count {
            let fence = ring.slot(slot).drawing_finished().unwrap();
            assert_eq!(fence.wait(0).unwrap(), FenceStatus::Signaled);
        }
    }

    assert!(matches!(
        FrameRing::new(&device, &pool, 1, None),
        Err(FrameError::RingTooSmall(1))
    ));
}

#[test]
#[ignore = "requires a Vulkan device"]
fn worker_pools_record_and_submit() {
    let device = headless_device();
    let workers = WorkerPools::new(&device, device.graphics_queue.family, 4).unwrap();

    let targets = workers
        .record(|_, cmd| {
            let barrier = vk::MemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::MEMORY_WRITE)
                .dst_access_mask(vk::AccessFlags::MEMORY_READ);
            unsafe {
                device.device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::ALL_COMMANDS,
                    vk::PipelineStageFlags::ALL_COMMANDS,
                    vk::DependencyFlags::empty(),
                    &[barrier],
                    &[],
                    &[],
                )
            };
            Ok(())
        })
        .unwrap();
    assert_eq!(targets.len(), 4);

    let fence = Fence::new(&device, false).unwrap();
    sync::submit(&device, device.graphics_queue.handle, &[], &targets, &[], fence.handle()).unwrap();
    assert_eq!(fence.wait(DEFAULT_FENCE_TIMEOUT_NS).unwrap(), FenceStatus::Signaled);
}

#[test]
#[ignore = "requires a Vulkan device"]
fn pipeline_cache_persists_only_when_useful() {
    let device = headless_device();
    let dir = std::env::temp_dir().join(format!("frame-pacer-cache-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("pipelines.bin");
    let _ = std::fs::remove_file(&path);

    let untouched = PipelineCache::load_or_empty(&device, &path).unwrap();
    assert!(!untouched.persist(&path).unwrap());
    assert!(!path.exists());

    let mut merged = PipelineCache::empty(&device).unwrap();
    let worker = PipelineCache::empty(&device).unwrap();
    let report = merged.merge_from(&[&worker]);
    assert_eq!(report.failed, 0);
    assert!(merged.persist(&path).unwrap());
    assert!(path.exists());

    let reloaded = PipelineCache::load_or_empty(&device, &path).unwrap();
    assert!(reloaded.persist(&path).unwrap());

    std::fs::remove_dir_all(&dir).unwrap();
}

// Staging uploads into device-local memory
//
// Each call is synchronous: staging buffer and fence are created, used and released
// before it returns. The scratch command buffer must not be in use on the GPU.
// Concurrent uploads need distinct scratch buffers and queues.

use ash::vk;
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

use super::barrier::{self, BufferTransition, ImageTransition};
use super::command;
use super::memory::GpuBuffer;
use super::sync::{self, Fence, FenceStatus};
use super::VulkanDevice;
use crate::error::{FrameError, FrameResult};

/// Destination of a buffer upload and the access scopes around the copy.
#[derive(Debug, Clone, Copy)]
pub struct BufferUpload {
    pub buffer: vk::Buffer,
    pub offset: vk::DeviceSize,
    pub current_access: vk::AccessFlags,
    pub new_access: vk::AccessFlags,
    /// Stages that last touched the buffer.
    pub generating_stages: vk::PipelineStageFlags,
    /// Stages that will read the uploaded data.
    pub consuming_stages: vk::PipelineStageFlags,
}

/// Destination of an image upload, including the layouts around the copy.
#[derive(Debug, Clone, Copy)]
pub struct ImageUpload {
    pub image: vk::Image,
    pub subresource: vk::ImageSubresourceLayers,
    pub offset: vk::Offset3D,
    pub extent: vk::Extent3D,
    pub current_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub current_access: vk::AccessFlags,
    pub new_access: vk::AccessFlags,
    pub generating_stages: vk::PipelineStageFlags,
    pub consuming_stages: vk::PipelineStageFlags,
}

/// Copy `data` into `dst.buffer` at `dst.offset` through a host-visible staging buffer.
pub fn upload_to_buffer(
    device: &Arc<VulkanDevice>,
    data: &[u8],
    dst: &BufferUpload,
    queue: vk::Queue,
    scratch: vk::CommandBuffer,
    signal_semaphores: &[vk::Semaphore],
    timeout_ns: u64,
) -> FrameResult<()> {
    let staging = create_staging(device, data)?;
    let size = data.len() as vk::DeviceSize;
    let ash_device = &device.device;

    command::begin(ash_device, scratch, true)?;

    barrier::set_buffer_memory_barrier(
        ash_device,
        scratch,
        dst.generating_stages,
        vk::PipelineStageFlags::TRANSFER,
        &[BufferTransition::new(
            dst.buffer,
            dst.current_access,
            vk::AccessFlags::TRANSFER_WRITE,
        )],
    );

    let region = vk::BufferCopy {
        src_offset: 0,
        dst_offset: dst.offset,
        size,
    };
    unsafe { ash_device.cmd_copy_buffer(scratch, staging.handle(), dst.buffer, &[region]) };

    barrier::set_buffer_memory_barrier(
        ash_device,
        scratch,
        vk::PipelineStageFlags::TRANSFER,
        dst.consuming_stages,
        &[BufferTransition::new(
            dst.buffer,
            vk::AccessFlags::TRANSFER_WRITE,
            dst.new_access,
        )],
    );

    command::end(ash_device, scratch)?;

    log::trace!("Uploading {} bytes into buffer at offset {}", size, dst.offset);
    submit_and_wait(device, queue, scratch, signal_semaphores, timeout_ns)
    // staging dropped here, after the GPU is done with it
}

/// Copy `data` into a region of `dst.image` through a host-visible staging buffer.
///
/// The image ends up in `dst.new_layout`; the data is tightly packed.
pub fn upload_to_image(
    device: &Arc<VulkanDevice>,
    data: &[u8],
    dst: &ImageUpload,
    queue: vk::Queue,
    scratch: vk::CommandBuffer,
    signal_semaphores: &[vk::Semaphore],
    timeout_ns: u64,
) -> FrameResult<()> {
    let staging = create_staging(device, data)?;
    let ash_device = &device.device;
    let range = barrier::range_of(dst.subresource);

    command::begin(ash_device, scratch, true)?;

    barrier::set_image_memory_barrier(
        ash_device,
        scratch,
        dst.generating_stages,
        vk::PipelineStageFlags::TRANSFER,
        &[ImageTransition::new(
            dst.image,
            dst.subresource.aspect_mask,
            (dst.current_access, vk::AccessFlags::TRANSFER_WRITE),
            (dst.current_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL),
        )
        .with_range(range)],
    );

    let region = vk::BufferImageCopy {
        buffer_offset: 0,
        buffer_row_length: 0,
        buffer_image_height: 0,
        image_subresource: dst.subresource,
        image_offset: dst.offset,
        image_extent: dst.extent,
    };
    unsafe {
        ash_device.cmd_copy_buffer_to_image(
            scratch,
            staging.handle(),
            dst.image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &[region],
        )
    };

    barrier::set_image_memory_barrier(
        ash_device,
        scratch,
        vk::PipelineStageFlags::TRANSFER,
        dst.consuming_stages,
        &[ImageTransition::new(
            dst.image,
            dst.subresource.aspect_mask,
            (vk::AccessFlags::TRANSFER_WRITE, dst.new_access),
            (vk::ImageLayout::TRANSFER_DST_OPTIMAL, dst.new_layout),
        )
        .with_range(range)],
    );

    command::end(ash_device, scratch)?;

    log::trace!(
        "Uploading {} bytes into {}x{}x{} image region",
        data.len(),
        dst.extent.width,
        dst.extent.height,
        dst.extent.depth
    );
    submit_and_wait(device, queue, scratch, signal_semaphores, timeout_ns)
}

fn create_staging(device: &Arc<VulkanDevice>, data: &[u8]) -> FrameResult<GpuBuffer> {
    if data.is_empty() {
        return Err(FrameError::EmptyUpload);
    }

    let mut staging = GpuBuffer::new(
        device,
        "staging buffer",
        data.len() as vk::DeviceSize,
        vk::BufferUsageFlags::TRANSFER_SRC,
        MemoryLocation::CpuToGpu,
        true,
    )?;
    staging.write(0, data)?;
    Ok(staging)
}

fn submit_and_wait(
    device: &Arc<VulkanDevice>,
    queue: vk::Queue,
    scratch: vk::CommandBuffer,
    signal_semaphores: &[vk::Semaphore],
    timeout_ns: u64,
) -> FrameResult<()> {
    let fence = Fence::new(device, false)?;
    sync::submit(device, queue, &[], &[scratch], signal_semaphores, fence.handle())?;

    match fence.wait(timeout_ns)? {
        FenceStatus::Signaled => Ok(()),
        FenceStatus::TimedOut => {
            log::error!("Staging upload did not finish within {} ns", timeout_ns);
            // The copy may still be reading the staging buffer; do not free it under the GPU
            if let Err(e) = device.wait_idle() {
                log::error!("Device wait after staging timeout failed: {}", e);
            }
            Err(FrameError::FenceTimeout { timeout_ns })
        }
    }
}

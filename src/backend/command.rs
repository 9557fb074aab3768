// Command pools and recording targets
//
// A pool belongs to one thread. Targets allocated from it are reset individually,
// never by resetting the whole pool.

use ash::vk;
use std::sync::Arc;

use super::VulkanDevice;
use crate::error::{FrameError, FrameResult};

pub struct CommandPool {
    handle: vk::CommandPool,
    family: u32,
    device: Arc<VulkanDevice>,
}

impl CommandPool {
    /// Pool whose command buffers can be reset one by one.
    pub fn new(device: &Arc<VulkanDevice>, queue_family: u32) -> FrameResult<Self> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family);

        let handle = unsafe { device.device.create_command_pool(&create_info, None) }
            .map_err(FrameError::creation("command pool"))?;

        Ok(Self {
            handle,
            family: queue_family,
            device: Arc::clone(device),
        })
    }

    pub fn handle(&self) -> vk::CommandPool {
        self.handle
    }

    pub fn queue_family(&self) -> u32 {
        self.family
    }

    pub fn allocate(&self, count: u32) -> FrameResult<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.handle)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        unsafe { self.device.device.allocate_command_buffers(&alloc_info) }
            .map_err(FrameError::creation("command buffers"))
    }

    /// Return targets to the pool. Callers must know the GPU no longer uses them.
    pub fn free(&self, command_buffers: &[vk::CommandBuffer]) {
        if !command_buffers.is_empty() {
            unsafe { self.device.device.free_command_buffers(self.handle, command_buffers) };
        }
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_command_pool(self.handle, None) };
    }
}

/// Reset `cmd` and start recording.
pub fn begin(device: &ash::Device, cmd: vk::CommandBuffer, one_time: bool) -> FrameResult<()> {
    unsafe { device.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty()) }
        .map_err(FrameError::vulkan("vkResetCommandBuffer"))?;

    let flags = if one_time {
        vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT
    } else {
        vk::CommandBufferUsageFlags::empty()
    };
    let begin_info = vk::CommandBufferBeginInfo::default().flags(flags);
    unsafe { device.begin_command_buffer(cmd, &begin_info) }
        .map_err(FrameError::vulkan("vkBeginCommandBuffer"))
}

pub fn end(device: &ash::Device, cmd: vk::CommandBuffer) -> FrameResult<()> {
    unsafe { device.end_command_buffer(cmd) }.map_err(FrameError::vulkan("vkEndCommandBuffer"))
}

// Presentation surface
//
// Owns the VkSurfaceKHR and answers the capability queries the swapchain needs.

use ash::vk;
use std::sync::Arc;

use super::VulkanDevice;
use crate::error::{FrameError, FrameResult};

/// Everything the surface reports about what a swapchain may look like.
#[derive(Debug, Clone)]
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

pub struct Surface {
    handle: vk::SurfaceKHR,
    loader: ash::khr::surface::Instance,
    device: Arc<VulkanDevice>,
}

impl Surface {
    pub(crate) fn from_raw(
        device: &Arc<VulkanDevice>,
        loader: ash::khr::surface::Instance,
        handle: vk::SurfaceKHR,
    ) -> Self {
        Self {
            handle,
            loader,
            device: Arc::clone(device),
        }
    }

    pub fn handle(&self) -> vk::SurfaceKHR {
        self.handle
    }

    pub fn query_capabilities(&self) -> FrameResult<vk::SurfaceCapabilitiesKHR> {
        unsafe {
            self.loader
                .get_physical_device_surface_capabilities(self.device.physical_device, self.handle)
        }
        .map_err(FrameError::vulkan("vkGetPhysicalDeviceSurfaceCapabilitiesKHR"))
    }

    pub fn query_support(&self) -> FrameResult<SurfaceSupport> {
        let capabilities = self.query_capabilities()?;
        let formats = unsafe {
            self.loader
                .get_physical_device_surface_formats(self.device.physical_device, self.handle)
        }
        .map_err(FrameError::vulkan("vkGetPhysicalDeviceSurfaceFormatsKHR"))?;
        let present_modes = unsafe {
            self.loader
                .get_physical_device_surface_present_modes(self.device.physical_device, self.handle)
        }
        .map_err(FrameError::vulkan("vkGetPhysicalDeviceSurfacePresentModesKHR"))?;

        Ok(SurfaceSupport {
            capabilities,
            formats,
            present_modes,
        })
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        unsafe { self.loader.destroy_surface(self.handle, None) };
    }
}

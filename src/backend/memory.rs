// GPU memory owners
//
// Buffers, images and image views with paired create/destroy, backed by gpu-allocator.
// Every owner releases its allocation on drop, including on early-return error paths.

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

use super::VulkanDevice;
use crate::error::{FrameError, FrameResult};

/// Buffer plus the memory bound to it.
pub struct GpuBuffer {
    buffer: vk::Buffer,
    allocation: Option<Allocation>,
    size: vk::DeviceSize,
    dedicated: bool,
    device: Arc<VulkanDevice>,
}

impl GpuBuffer {
    /// Create a buffer with memory in `location`.
    ///
    /// `dedicated` gives the buffer its own memory object at offset 0, which keeps
    /// flushes of the whole mapping valid without alignment bookkeeping.
    pub fn new(
        device: &Arc<VulkanDevice>,
        name: &'static str,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        dedicated: bool,
    ) -> FrameResult<Self> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.device.create_buffer(&buffer_info, None) }
            .map_err(FrameError::creation(name))?;

        // From here on, drop releases whatever has been created so far
        let mut owned = Self {
            buffer,
            allocation: None,
            size,
            dedicated,
            device: Arc::clone(device),
        };

        let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };
        let allocation_scheme = if dedicated {
            AllocationScheme::DedicatedBuffer(buffer)
        } else {
            AllocationScheme::GpuAllocatorManaged
        };
        let allocation = device
            .allocator()
            .lock()
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear: true,
                allocation_scheme,
            })
            .map_err(FrameError::allocation(name))?;
        device.track_allocation();

        let bind = unsafe {
            device
                .device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };
        owned.allocation = Some(allocation);
        bind.map_err(FrameError::vulkan("vkBindBufferMemory"))?;

        Ok(owned)
    }

    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Copy `data` into the mapped memory at `offset`, flushing it when the memory is
    /// not host-coherent.
    ///
    /// Non-coherent memory is only writable through dedicated buffers: a suballocation's
    /// offset need not be aligned to `nonCoherentAtomSize`.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> FrameResult<()> {
        let dedicated = self.dedicated;
        let allocation = self
            .allocation
            .as_mut()
            .ok_or(FrameError::Unsupported("writing an unbound buffer".to_string()))?;
        let flush = flush_policy(allocation.memory_properties(), dedicated)?;
        let memory = unsafe { allocation.memory() };
        let mapped = allocation
            .mapped_slice_mut()
            .ok_or(FrameError::vulkan("vkMapMemory")(vk::Result::ERROR_MEMORY_MAP_FAILED))?;

        let end = offset + data.len();
        if end > mapped.len() {
            return Err(FrameError::Unsupported(format!(
                "writing {} bytes at offset {} into a {} byte mapping",
                data.len(),
                offset,
                mapped.len()
            )));
        }
        mapped[offset..end].copy_from_slice(data);

        if flush == FlushPolicy::None {
            return Ok(());
        }
        // Dedicated memory starts at offset 0, so the whole range is atom-aligned
        let range = vk::MappedMemoryRange::default()
            .memory(memory)
            .offset(0)
            .size(vk::WHOLE_SIZE);
        unsafe { self.device.device.flush_mapped_memory_ranges(&[range]) }
            .map_err(FrameError::vulkan("vkFlushMappedMemoryRanges"))
    }

    /// Mapped contents, for host-visible buffers.
    pub fn mapped(&self) -> Option<&[u8]> {
        self.allocation.as_ref().and_then(|a| a.mapped_slice())
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_buffer(self.buffer, None) };
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = self.device.allocator().lock().free(allocation) {
                log::error!("Failed to free buffer memory: {}", e);
            }
            self.device.untrack_allocation();
        }
    }
}

/// Image plus the memory bound to it.
pub struct GpuImage {
    image: vk::Image,
    allocation: Option<Allocation>,
    format: vk::Format,
    device: Arc<VulkanDevice>,
}

impl GpuImage {
    /// Create a device-local 2D image with a single mip level and layer.
    pub fn new_2d(
        device: &Arc<VulkanDevice>,
        name: &'static str,
        format: vk::Format,
        extent: vk::Extent2D,
        usage: vk::ImageUsageFlags,
    ) -> FrameResult<Self> {
        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(usage)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image = unsafe { device.device.create_image(&image_info, None) }
            .map_err(FrameError::creation(name))?;

        let mut owned = Self {
            image,
            allocation: None,
            format,
            device: Arc::clone(device),
        };

        let requirements = unsafe { device.device.get_image_memory_requirements(image) };
        let allocation = device
            .allocator()
            .lock()
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location: MemoryLocation::GpuOnly,
                linear: false,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(FrameError::allocation(name))?;
        device.track_allocation();

        let bind = unsafe {
            device
                .device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        };
        owned.allocation = Some(allocation);
        bind.map_err(FrameError::vulkan("vkBindImageMemory"))?;

        Ok(owned)
    }

    pub fn handle(&self) -> vk::Image {
        self.image
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }
}

impl Drop for GpuImage {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_image(self.image, None) };
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = self.device.allocator().lock().free(allocation) {
                log::error!("Failed to free image memory: {}", e);
            }
            self.device.untrack_allocation();
        }
    }
}

/// Owned view onto an image this struct does not own.
pub struct ImageView {
    view: vk::ImageView,
    device: Arc<VulkanDevice>,
}

impl ImageView {
    pub fn new_2d(
        device: &Arc<VulkanDevice>,
        image: vk::Image,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
    ) -> FrameResult<Self> {
        let create_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .components(vk::ComponentMapping {
                r: vk::ComponentSwizzle::IDENTITY,
                g: vk::ComponentSwizzle::IDENTITY,
                b: vk::ComponentSwizzle::IDENTITY,
                a: vk::ComponentSwizzle::IDENTITY,
            })
            .subresource_range(super::barrier::whole_range(aspect));

        let view = unsafe { device.device.create_image_view(&create_info, None) }
            .map_err(FrameError::creation("image view"))?;

        Ok(Self {
            view,
            device: Arc::clone(device),
        })
    }

    pub fn handle(&self) -> vk::ImageView {
        self.view
    }

    /// Destroy the view. Safe to call more than once.
    pub fn destroy(&mut self) {
        if self.view != vk::ImageView::null() {
            unsafe { self.device.device.destroy_image_view(self.view, None) };
            self.view = vk::ImageView::null();
        }
    }
}

impl Drop for ImageView {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Depth image and its view, sized to the swapchain.
pub struct DepthAttachment {
    // View first: it must not outlive the image
    view: ImageView,
    image: GpuImage,
}

impl DepthAttachment {
    pub fn new(device: &Arc<VulkanDevice>, format: vk::Format, extent: vk::Extent2D) -> FrameResult<Self> {
        let image = GpuImage::new_2d(
            device,
            "depth attachment",
            format,
            extent,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
        )?;
        let view = ImageView::new_2d(device, image.handle(), format, depth_aspect(format))?;
        Ok(Self { view, image })
    }

    pub fn view(&self) -> vk::ImageView {
        self.view.handle()
    }

    pub fn image(&self) -> vk::Image {
        self.image.handle()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushPolicy {
    None,
    WholeMemory,
}

fn flush_policy(properties: vk::MemoryPropertyFlags, dedicated: bool) -> FrameResult<FlushPolicy> {
    if properties.contains(vk::MemoryPropertyFlags::HOST_COHERENT) {
        Ok(FlushPolicy::None)
    } else if dedicated {
        Ok(FlushPolicy::WholeMemory)
    } else {
        Err(FrameError::Unsupported(
            "host writes to non-coherent memory need a dedicated buffer".to_string(),
        ))
    }
}

/// Aspect mask for a depth or depth/stencil format.
pub fn depth_aspect(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM_S8_UINT | vk::Format::D24_UNORM_S8_UINT | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        _ => vk::ImageAspectFlags::DEPTH,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stencil_formats_get_both_aspects() {
        assert_eq!(
            depth_aspect(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(depth_aspect(vk::Format::D16_UNORM), vk::ImageAspectFlags::DEPTH);
        assert_eq!(depth_aspect(vk::Format::D32_SFLOAT), vk::ImageAspectFlags::DEPTH);
    }

    #[test]
    fn only_dedicated_non_coherent_memory_is_flushed() {
        let visible = vk::MemoryPropertyFlags::HOST_VISIBLE;
        let coherent = visible | vk::MemoryPropertyFlags::HOST_COHERENT;

        assert_eq!(flush_policy(coherent, false).unwrap(), FlushPolicy::None);
        assert_eq!(flush_policy(coherent, true).unwrap(), FlushPolicy::None);
        assert_eq!(flush_policy(visible, true).unwrap(), FlushPolicy::WholeMemory);
        assert!(matches!(
            flush_policy(visible | vk::MemoryPropertyFlags::HOST_CACHED, false),
            Err(FrameError::Unsupported(_))
        ));
    }
}

// Pipeline barriers
//
// Every change of access scope, image layout or queue ownership is declared with one of
// these transitions. Queue families default to IGNORED (no ownership transfer).

use ash::vk;

/// Access scope (and optionally queue ownership) change of a whole buffer.
#[derive(Debug, Clone, Copy)]
pub struct BufferTransition {
    pub buffer: vk::Buffer,
    pub current_access: vk::AccessFlags,
    pub new_access: vk::AccessFlags,
    pub current_queue_family: u32,
    pub new_queue_family: u32,
}

impl BufferTransition {
    pub fn new(buffer: vk::Buffer, current_access: vk::AccessFlags, new_access: vk::AccessFlags) -> Self {
        Self {
            buffer,
            current_access,
            new_access,
            current_queue_family: vk::QUEUE_FAMILY_IGNORED,
            new_queue_family: vk::QUEUE_FAMILY_IGNORED,
        }
    }

    fn to_vk(self) -> vk::BufferMemoryBarrier<'static> {
        vk::BufferMemoryBarrier::default()
            .src_access_mask(self.current_access)
            .dst_access_mask(self.new_access)
            .src_queue_family_index(self.current_queue_family)
            .dst_queue_family_index(self.new_queue_family)
            .buffer(self.buffer)
            .offset(0)
            .size(vk::WHOLE_SIZE)
    }
}

/// Access, layout and queue ownership change of an image subresource range.
#[derive(Debug, Clone, Copy)]
pub struct ImageTransition {
    pub image: vk::Image,
    pub current_access: vk::AccessFlags,
    pub new_access: vk::AccessFlags,
    pub current_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub current_queue_family: u32,
    pub new_queue_family: u32,
    pub range: vk::ImageSubresourceRange,
}

impl ImageTransition {
    /// Transition of the first mip level and array layer of `aspect`.
    pub fn new(
        image: vk::Image,
        aspect: vk::ImageAspectFlags,
        (current_access, new_access): (vk::AccessFlags, vk::AccessFlags),
        (current_layout, new_layout): (vk::ImageLayout, vk::ImageLayout),
    ) -> Self {
        Self {
            image,
            current_access,
            new_access,
            current_layout,
            new_layout,
            current_queue_family: vk::QUEUE_FAMILY_IGNORED,
            new_queue_family: vk::QUEUE_FAMILY_IGNORED,
            range: whole_range(aspect),
        }
    }

    /// Hand the image from one queue family to another.
    pub fn with_queue_transfer(mut self, from: u32, to: u32) -> Self {
        if from != to {
            self.current_queue_family = from;
            self.new_queue_family = to;
        }
        self
    }

    pub fn with_range(mut self, range: vk::ImageSubresourceRange) -> Self {
        self.range = range;
        self
    }

    fn to_vk(self) -> vk::ImageMemoryBarrier<'static> {
        vk::ImageMemoryBarrier::default()
            .src_access_mask(self.current_access)
            .dst_access_mask(self.new_access)
            .old_layout(self.current_layout)
            .new_layout(self.new_layout)
            .src_queue_family_index(self.current_queue_family)
            .dst_queue_family_index(self.new_queue_family)
            .image(self.image)
            .subresource_range(self.range)
    }
}

/// Single mip level, single layer.
pub fn whole_range(aspect: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: aspect,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

/// Range covering exactly the layers addressed by a copy.
pub fn range_of(layers: vk::ImageSubresourceLayers) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: layers.aspect_mask,
        base_mip_level: layers.mip_level,
        level_count: 1,
        base_array_layer: layers.base_array_layer,
        layer_count: layers.layer_count,
    }
}

pub fn set_buffer_memory_barrier(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    generating_stages: vk::PipelineStageFlags,
    consuming_stages: vk::PipelineStageFlags,
    transitions: &[BufferTransition],
) {
    if transitions.is_empty() {
        return;
    }
    let barriers: Vec<_> = transitions.iter().map(|t| t.to_vk()).collect();
    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            generating_stages,
            consuming_stages,
            vk::DependencyFlags::empty(),
            &[],
            &barriers,
            &[],
        );
    }
}

pub fn set_image_memory_barrier(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    generating_stages: vk::PipelineStageFlags,
    consuming_stages: vk::PipelineStageFlags,
    transitions: &[ImageTransition],
) {
    if transitions.is_empty() {
        return;
    }
    let barriers: Vec<_> = transitions.iter().map(|t| t.to_vk()).collect();
    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            generating_stages,
            consuming_stages,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &barriers,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn same_family_transfer_stays_ignored() {
        let t = ImageTransition::new(
            vk::Image::from_raw(1),
            vk::ImageAspectFlags::COLOR,
            (vk::AccessFlags::MEMORY_READ, vk::AccessFlags::MEMORY_READ),
            (vk::ImageLayout::UNDEFINED, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL),
        )
        .with_queue_transfer(2, 2);

        assert_eq!(t.current_queue_family, vk::QUEUE_FAMILY_IGNORED);
        assert_eq!(t.new_queue_family, vk::QUEUE_FAMILY_IGNORED);
    }

    #[test]
    fn cross_family_transfer_is_explicit() {
        let barrier = ImageTransition::new(
            vk::Image::from_raw(1),
            vk::ImageAspectFlags::COLOR,
            (vk::AccessFlags::MEMORY_READ, vk::AccessFlags::MEMORY_READ),
            (vk::ImageLayout::PRESENT_SRC_KHR, vk::ImageLayout::PRESENT_SRC_KHR),
        )
        .with_queue_transfer(0, 1)
        .to_vk();

        assert_eq!(barrier.src_queue_family_index, 0);
        assert_eq!(barrier.dst_queue_family_index, 1);
        assert_eq!(barrier.old_layout, vk::ImageLayout::PRESENT_SRC_KHR);
    }

    #[test]
    fn copy_layers_map_onto_barrier_range() {
        let layers = vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 2,
            base_array_layer: 1,
            layer_count: 6,
        };
        let range = range_of(layers);
        assert_eq!(range.base_mip_level, 2);
        assert_eq!(range.level_count, 1);
        assert_eq!(range.base_array_layer, 1);
        assert_eq!(range.layer_count, 6);
    }
}

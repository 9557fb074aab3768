// Render pass and framebuffers
//
// One subpass that clears the swapchain image and (optionally) a depth attachment.
// Framebuffers are transient: one per ring slot, rebuilt each cycle for the acquired image.

use ash::vk;
use std::sync::Arc;

use super::VulkanDevice;
use crate::error::{FrameError, FrameResult};

pub struct RenderPass {
    handle: vk::RenderPass,
    has_depth: bool,
    device: Arc<VulkanDevice>,
}

impl RenderPass {
    /// Color attachment in `color_format`, ending in PRESENT_SRC_KHR, plus a depth
    /// attachment when `depth_format` is given.
    pub fn new(
        device: &Arc<VulkanDevice>,
        color_format: vk::Format,
        depth_format: Option<vk::Format>,
    ) -> FrameResult<Self> {
        // Color attachment (the swapchain image)
        let color_attachment = vk::AttachmentDescription::default()
            .format(color_format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::PRESENT_SRC_KHR);

        let color_refs = [vk::AttachmentReference {
            attachment: 0,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        }];
        let depth_ref = vk::AttachmentReference {
            attachment: 1,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        };

        let mut attachments = vec![color_attachment];
        let mut stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
        let mut access = vk::AccessFlags::COLOR_ATTACHMENT_WRITE;

        let mut subpass = vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs);

        if let Some(depth_format) = depth_format {
            // Depth is never read after the pass
            attachments.push(
                vk::AttachmentDescription::default()
                    .format(depth_format)
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .load_op(vk::AttachmentLoadOp::CLEAR)
                    .store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(vk::ImageLayout::UNDEFINED)
                    .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL),
            );
            subpass = subpass.depth_stencil_attachment(&depth_ref);
            stages |= vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS;
            access |= vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE;
        }

        // Matches the COLOR_ATTACHMENT_OUTPUT wait on the image-acquired semaphore
        let dependency = vk::SubpassDependency::default()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(stages)
            .src_access_mask(vk::AccessFlags::empty())
            .dst_stage_mask(stages)
            .dst_access_mask(access);

        let subpasses = [subpass];
        let dependencies = [dependency];
        let render_pass_info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        let handle = unsafe { device.device.create_render_pass(&render_pass_info, None) }
            .map_err(FrameError::creation("render pass"))?;

        Ok(Self {
            handle,
            has_depth: depth_format.is_some(),
            device: Arc::clone(device),
        })
    }

    pub fn handle(&self) -> vk::RenderPass {
        self.handle
    }

    pub fn has_depth(&self) -> bool {
        self.has_depth
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_render_pass(self.handle, None) };
    }
}

pub struct Framebuffer {
    handle: vk::Framebuffer,
    extent: vk::Extent2D,
    device: Arc<VulkanDevice>,
}

impl Framebuffer {
    /// Attachments must be given in render pass order: color first, then depth.
    pub fn new(
        device: &Arc<VulkanDevice>,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> FrameResult<Self> {
        let framebuffer_info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass)
            .attachments(attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);

        let handle = unsafe { device.device.create_framebuffer(&framebuffer_info, None) }
            .map_err(FrameError::creation("framebuffer"))?;

        Ok(Self {
            handle,
            extent,
            device: Arc::clone(device),
        })
    }

    pub fn handle(&self) -> vk::Framebuffer {
        self.handle
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Destroy the framebuffer. Safe to call more than once.
    pub fn destroy(&mut self) {
        if self.handle != vk::Framebuffer::null() {
            unsafe { self.device.device.destroy_framebuffer(self.handle, None) };
            self.handle = vk::Framebuffer::null();
        }
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        self.destroy();
    }
}

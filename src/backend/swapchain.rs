// Swapchain - Window presentation
//
// Manages the chain of images we render to and present to the screen.
// A zero-sized surface (minimized window) is a valid "not ready" state with no images.
// Rebuilds chain the new handle to the old one and destroy the old handle last.

use ash::vk;
use std::sync::Arc;

use super::memory::ImageView;
use super::surface::{Surface, SurfaceSupport};
use super::VulkanDevice;
use crate::error::{FrameError, FrameResult};

/// What the caller would like the swapchain to look like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainPreferences {
    pub usage: vk::ImageUsageFlags,
    pub format: vk::Format,
    pub color_space: vk::ColorSpaceKHR,
    pub present_mode: vk::PresentModeKHR,
    pub transform: vk::SurfaceTransformFlagsKHR,
    /// Used only when the surface leaves the extent up to the swapchain.
    pub fallback_extent: vk::Extent2D,
}

impl Default for SwapchainPreferences {
    fn default() -> Self {
        Self {
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            format: vk::Format::B8G8R8A8_SRGB,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            present_mode: vk::PresentModeKHR::FIFO,
            transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            fallback_extent: vk::Extent2D {
                width: 1280,
                height: 720,
            },
        }
    }
}

/// Presentable image (owned by the swapchain) and the view we created for it.
pub struct SwapchainImage {
    image: vk::Image,
    view: ImageView,
}

impl SwapchainImage {
    pub fn image(&self) -> vk::Image {
        self.image
    }

    pub fn view(&self) -> vk::ImageView {
        self.view.handle()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired { index: u32, suboptimal: bool },
    OutOfDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    /// Out of date or suboptimal; the swapchain should be rebuilt.
    Stale,
}

pub struct SwapchainState {
    handle: vk::SwapchainKHR,
    loader: ash::khr::swapchain::Device,
    images: Vec<SwapchainImage>,
    format: vk::Format,
    color_space: vk::ColorSpaceKHR,
    extent: vk::Extent2D,
    present_mode: vk::PresentModeKHR,
    surface: Surface,
    device: Arc<VulkanDevice>,
}

impl SwapchainState {
    /// Take ownership of `surface` and build the first swapchain for it.
    pub fn new(
        device: &Arc<VulkanDevice>,
        surface: Surface,
        preferences: &SwapchainPreferences,
    ) -> FrameResult<Self> {
        let loader = ash::khr::swapchain::Device::new(&device.instance, &device.device);
        let mut state = Self {
            handle: vk::SwapchainKHR::null(),
            loader,
            images: Vec::new(),
            format: preferences.format,
            color_space: preferences.color_space,
            extent: vk::Extent2D::default(),
            present_mode: preferences.present_mode,
            surface,
            device: Arc::clone(device),
        };
        state.rebuild(preferences)?;
        Ok(state)
    }

    /// Recreate the swapchain for the surface's current size.
    ///
    /// Waits for the device to go idle first, so no image of the old chain is in use.
    pub fn rebuild(&mut self, preferences: &SwapchainPreferences) -> FrameResult<()> {
        self.device
            .wait_idle()
            .map_err(FrameError::vulkan("vkDeviceWaitIdle"))?;

        // Views go first, the images they point at belong to the old handle
        self.images.clear();

        let support = self.surface.query_support()?;
        let plan = match plan_swapchain(&support, preferences)? {
            SwapchainPlan::NotReady { extent } => {
                log::info!("Surface has zero extent, swapchain not ready");
                self.destroy_handle();
                self.extent = extent;
                return Ok(());
            }
            SwapchainPlan::Build(plan) => plan,
        };

        // Shared between the two families instead of transferring ownership every frame
        let families = [self.device.graphics_queue.family, self.device.present_queue.family];
        let (sharing_mode, family_indices): (vk::SharingMode, &[u32]) = if families[0] != families[1] {
            (vk::SharingMode::CONCURRENT, &families[..])
        } else {
            (vk::SharingMode::EXCLUSIVE, &[])
        };

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.surface.handle())
            .min_image_count(plan.image_count)
            .image_format(plan.surface_format.format)
            .image_color_space(plan.surface_format.color_space)
            .image_extent(plan.extent)
            .image_array_layers(1)
            .image_usage(plan.usage)
            .image_sharing_mode(sharing_mode)
            .queue_family_indices(family_indices)
            .pre_transform(plan.transform)
            .composite_alpha(plan.composite_alpha)
            .present_mode(plan.present_mode)
            .clipped(true)
            .old_swapchain(self.handle);

        let new_handle = unsafe { self.loader.create_swapchain(&create_info, None) }
            .map_err(FrameError::creation("swapchain"))?;

        // The new chain is live, the old one can go
        self.destroy_handle();
        self.handle = new_handle;
        self.format = plan.surface_format.format;
        self.color_space = plan.surface_format.color_space;
        self.extent = plan.extent;
        self.present_mode = plan.present_mode;

        let images = unsafe { self.loader.get_swapchain_images(self.handle) }
            .map_err(FrameError::vulkan("vkGetSwapchainImagesKHR"))?;
        for image in images {
            let view = ImageView::new_2d(&self.device, image, self.format, vk::ImageAspectFlags::COLOR)?;
            self.images.push(SwapchainImage { image, view });
        }

        log::info!(
            "Swapchain rebuilt: {}x{}, {} images, {:?}/{:?}, {:?}",
            self.extent.width,
            self.extent.height,
            self.images.len(),
            self.format,
            self.color_space,
            self.present_mode
        );
        Ok(())
    }

    fn destroy_handle(&mut self) {
        if self.handle != vk::SwapchainKHR::null() {
            unsafe { self.loader.destroy_swapchain(self.handle, None) };
            self.handle = vk::SwapchainKHR::null();
        }
    }

    /// True while the surface is zero-sized; nothing may be acquired or presented.
    pub fn not_ready(&self) -> bool {
        self.handle == vk::SwapchainKHR::null() || self.images.is_empty()
    }

    pub fn handle(&self) -> vk::SwapchainKHR {
        self.handle
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn color_space(&self) -> vk::ColorSpaceKHR {
        self.color_space
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    pub fn images(&self) -> &[SwapchainImage] {
        &self.images
    }

    pub fn surface(&self) -> &Surface {
        &self.surface
    }

    /// Acquire the next image, signaling `semaphore` when it is ready to be written.
    pub fn acquire_next_image(
        &self,
        semaphore: vk::Semaphore,
        timeout_ns: u64,
    ) -> FrameResult<AcquireOutcome> {
        if self.not_ready() {
            return Err(FrameError::NotReady);
        }
        let result = unsafe {
            self.loader
                .acquire_next_image(self.handle, timeout_ns, semaphore, vk::Fence::null())
        };

        match result {
            Ok((index, suboptimal)) => Ok(AcquireOutcome::Acquired { index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(e) => Err(FrameError::vulkan("vkAcquireNextImageKHR")(e)),
        }
    }

    /// Queue `image_index` for presentation once `wait_semaphores` are signaled.
    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> FrameResult<PresentOutcome> {
        if self.not_ready() {
            return Err(FrameError::NotReady);
        }
        let swapchains = [self.handle];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match unsafe { self.loader.queue_present(queue, &present_info) } {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::Stale),
            Err(e) => Err(FrameError::vulkan("vkQueuePresentKHR")(e)),
        }
    }
}

impl Drop for SwapchainState {
    fn drop(&mut self) {
        self.images.clear();
        self.destroy_handle();
    }
}

/// Everything a swapchain build needs, decided from the surface alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainParams {
    pub extent: vk::Extent2D,
    /// Minimum image count requested from the driver.
    pub image_count: u32,
    pub surface_format: vk::SurfaceFormatKHR,
    pub usage: vk::ImageUsageFlags,
    pub transform: vk::SurfaceTransformFlagsKHR,
    pub composite_alpha: vk::CompositeAlphaFlagsKHR,
    pub present_mode: vk::PresentModeKHR,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapchainPlan {
    /// Zero-sized surface: no handle, no images.
    NotReady { extent: vk::Extent2D },
    Build(SwapchainParams),
}

/// Decide what `rebuild` will create for the surface as it is now.
pub fn plan_swapchain(
    support: &SurfaceSupport,
    preferences: &SwapchainPreferences,
) -> FrameResult<SwapchainPlan> {
    let caps = &support.capabilities;
    let extent = choose_extent(caps, preferences.fallback_extent);
    if extent.width == 0 || extent.height == 0 {
        return Ok(SwapchainPlan::NotReady { extent });
    }

    let desired_format = vk::SurfaceFormatKHR {
        format: preferences.format,
        color_space: preferences.color_space,
    };
    Ok(SwapchainPlan::Build(SwapchainParams {
        extent,
        image_count: select_image_count(caps),
        surface_format: select_surface_format(&support.formats, desired_format)?,
        usage: select_usage(caps, preferences.usage)?,
        transform: select_transform(caps, preferences.transform),
        composite_alpha: select_composite_alpha(caps),
        present_mode: select_present_mode(&support.present_modes, preferences.present_mode)?,
    }))
}

/// Desired mode if offered, otherwise FIFO.
pub fn select_present_mode(
    available: &[vk::PresentModeKHR],
    desired: vk::PresentModeKHR,
) -> FrameResult<vk::PresentModeKHR> {
    if available.contains(&desired) {
        return Ok(desired);
    }
    if available.contains(&vk::PresentModeKHR::FIFO) {
        log::warn!("Present mode {:?} not supported, using FIFO", desired);
        return Ok(vk::PresentModeKHR::FIFO);
    }
    // FIFO is mandatory, a surface without it is broken
    Err(FrameError::Unsupported(
        "surface does not offer the FIFO present mode".to_string(),
    ))
}

/// The surface's current extent, or `fallback` clamped to the allowed range when the
/// surface reports the 0xFFFFFFFF "swapchain decides" sentinel.
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, fallback: vk::Extent2D) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }
    let clamp = |value: u32, min: u32, max: u32| value.max(min).min(max);
    vk::Extent2D {
        width: clamp(
            fallback.width,
            caps.min_image_extent.width,
            caps.max_image_extent.width,
        ),
        height: clamp(
            fallback.height,
            caps.min_image_extent.height,
            caps.max_image_extent.height,
        ),
    }
}

/// One more than the minimum, so acquire rarely waits on the presentation engine.
pub fn select_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = caps.min_image_count + 1;
    if caps.max_image_count > 0 {
        count.min(caps.max_image_count)
    } else {
        count
    }
}

pub fn select_surface_format(
    available: &[vk::SurfaceFormatKHR],
    desired: vk::SurfaceFormatKHR,
) -> FrameResult<vk::SurfaceFormatKHR> {
    let Some(first) = available.first() else {
        return Err(FrameError::Unsupported(
            "surface reports no formats".to_string(),
        ));
    };

    // A lone UNDEFINED entry means any format is accepted
    if available.len() == 1 && first.format == vk::Format::UNDEFINED {
        return Ok(desired);
    }

    if available
        .iter()
        .any(|f| f.format == desired.format && f.color_space == desired.color_space)
    {
        return Ok(desired);
    }

    if let Some(format_only) = available.iter().find(|f| f.format == desired.format) {
        log::warn!(
            "Color space {:?} not supported with {:?}, using {:?}",
            desired.color_space,
            desired.format,
            format_only.color_space
        );
        return Ok(*format_only);
    }

    log::warn!(
        "Surface format {:?}/{:?} not supported, using {:?}/{:?}",
        desired.format,
        desired.color_space,
        first.format,
        first.color_space
    );
    Ok(*first)
}

pub fn select_usage(
    caps: &vk::SurfaceCapabilitiesKHR,
    desired: vk::ImageUsageFlags,
) -> FrameResult<vk::ImageUsageFlags> {
    let supported = caps.supported_usage_flags & desired;
    if supported != desired {
        return Err(FrameError::Unsupported(format!(
            "swapchain image usage {:?}",
            desired & !caps.supported_usage_flags
        )));
    }
    Ok(supported)
}

pub fn select_transform(
    caps: &vk::SurfaceCapabilitiesKHR,
    desired: vk::SurfaceTransformFlagsKHR,
) -> vk::SurfaceTransformFlagsKHR {
    if caps.supported_transforms.contains(desired) {
        desired
    } else {
        caps.current_transform
    }
}

fn select_composite_alpha(caps: &vk::SurfaceCapabilitiesKHR) -> vk::CompositeAlphaFlagsKHR {
    [
        vk::CompositeAlphaFlagsKHR::OPAQUE,
        vk::CompositeAlphaFlagsKHR::INHERIT,
        vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED,
    ]
    .into_iter()
    .find(|&mode| caps.supported_composite_alpha.contains(mode))
    .unwrap_or(vk::CompositeAlphaFlagsKHR::OPAQUE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps() -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 8,
            current_extent: vk::Extent2D {
                width: 800,
                height: 600,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            supported_transforms: vk::SurfaceTransformFlagsKHR::IDENTITY,
            current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            supported_composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            supported_usage_flags: vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::TRANSFER_DST,
            ..Default::default()
        }
    }

    fn pair(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space,
        }
    }

    const SRGB: vk::ColorSpaceKHR = vk::ColorSpaceKHR::SRGB_NONLINEAR;
    const HDR: vk::ColorSpaceKHR = vk::ColorSpaceKHR::HDR10_ST2084_EXT;

    #[test]
    fn undefined_wildcard_accepts_desired_pair() {
        let desired = pair(vk::Format::R8G8B8A8_UNORM, SRGB);
        let chosen =
            select_surface_format(&[pair(vk::Format::UNDEFINED, SRGB)], desired).unwrap();
        assert_eq!(chosen, desired);
    }

    #[test]
    fn exact_match_wins() {
        let desired = pair(vk::Format::B8G8R8A8_SRGB, SRGB);
        let available = [pair(vk::Format::R8G8B8A8_UNORM, SRGB), desired];
        assert_eq!(select_surface_format(&available, desired).unwrap(), desired);
    }

    #[test]
    fn format_only_match_takes_supported_color_space() {
        let desired = pair(vk::Format::B8G8R8A8_UNORM, SRGB);
        let available = [
            pair(vk::Format::R8G8B8A8_UNORM, SRGB),
            pair(vk::Format::B8G8R8A8_UNORM, HDR),
        ];
        let chosen = select_surface_format(&available, desired).unwrap();
        assert_eq!(chosen, pair(vk::Format::B8G8R8A8_UNORM, HDR));
    }

    #[test]
    fn no_match_falls_back_to_first_pair() {
        let desired = pair(vk::Format::B8G8R8A8_SRGB, SRGB);
        let available = [
            pair(vk::Format::A2B10G10R10_UNORM_PACK32, HDR),
            pair(vk::Format::R8G8B8A8_UNORM, SRGB),
        ];
        assert_eq!(
            select_surface_format(&available, desired).unwrap(),
            available[0]
        );
    }

    #[test]
    fn empty_format_list_is_an_error() {
        let err = select_surface_format(&[], pair(vk::Format::B8G8R8A8_SRGB, SRGB)).unwrap_err();
        assert!(matches!(err, FrameError::Unsupported(_)));
    }

    #[test]
    fn present_mode_falls_back_to_fifo() {
        let available = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE];
        assert_eq!(
            select_present_mode(&available, vk::PresentModeKHR::MAILBOX).unwrap(),
            vk::PresentModeKHR::FIFO
        );
        assert_eq!(
            select_present_mode(&available, vk::PresentModeKHR::IMMEDIATE).unwrap(),
            vk::PresentModeKHR::IMMEDIATE
        );
        assert!(select_present_mode(&[vk::PresentModeKHR::MAILBOX], vk::PresentModeKHR::IMMEDIATE).is_err());
    }

    #[test]
    fn extent_follows_surface_unless_sentinel() {
        let fallback = vk::Extent2D {
            width: 10_000,
            height: 0,
        };
        assert_eq!(choose_extent(&caps(), fallback), caps().current_extent);

        let mut sentinel = caps();
        sentinel.current_extent = vk::Extent2D {
            width: u32::MAX,
            height: u32::MAX,
        };
        assert_eq!(
            choose_extent(&sentinel, fallback),
            vk::Extent2D {
                width: 4096,
                height: 1
            }
        );
    }

    #[test]
    fn zero_current_extent_is_passed_through() {
        let mut minimized = caps();
        minimized.current_extent = vk::Extent2D {
            width: 0,
            height: 0,
        };
        minimized.min_image_extent = vk::Extent2D {
            width: 0,
            height: 0,
        };
        let extent = choose_extent(&minimized, vk::Extent2D { width: 800, height: 600 });
        assert_eq!(extent.width, 0);
    }

    #[test]
    fn image_count_is_min_plus_one_within_max() {
        assert_eq!(select_image_count(&caps()), 3);

        let mut tight = caps();
        tight.min_image_count = 3;
        tight.max_image_count = 3;
        assert_eq!(select_image_count(&tight), 3);

        let mut unbounded = caps();
        unbounded.max_image_count = 0;
        assert_eq!(select_image_count(&unbounded), 3);
    }

    #[test]
    fn unsupported_usage_bit_is_rejected() {
        let ok = select_usage(&caps(), vk::ImageUsageFlags::COLOR_ATTACHMENT).unwrap();
        assert_eq!(ok, vk::ImageUsageFlags::COLOR_ATTACHMENT);

        let err = select_usage(
            &caps(),
            vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::STORAGE,
        )
        .unwrap_err();
        assert!(matches!(err, FrameError::Unsupported(_)));
    }

    #[test]
    fn unsupported_transform_uses_current() {
        let mut rotated = caps();
        rotated.current_transform = vk::SurfaceTransformFlagsKHR::ROTATE_90;
        rotated.supported_transforms = vk::SurfaceTransformFlagsKHR::ROTATE_90;
        assert_eq!(
            select_transform(&rotated, vk::SurfaceTransformFlagsKHR::IDENTITY),
            vk::SurfaceTransformFlagsKHR::ROTATE_90
        );
        assert_eq!(
            select_transform(&caps(), vk::SurfaceTransformFlagsKHR::IDENTITY),
            vk::SurfaceTransformFlagsKHR::IDENTITY
        );
    }

    fn support(current_extent: vk::Extent2D) -> SurfaceSupport {
        SurfaceSupport {
            capabilities: vk::SurfaceCapabilitiesKHR {
                current_extent,
                ..caps()
            },
            formats: vec![
                pair(vk::Format::B8G8R8A8_UNORM, SRGB),
                pair(vk::Format::B8G8R8A8_SRGB, SRGB),
            ],
            present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
        }
    }

    #[test]
    fn zero_extent_plans_no_swapchain_then_valid_extent_plans_one() {
        let preferences = SwapchainPreferences {
            present_mode: vk::PresentModeKHR::MAILBOX,
            ..Default::default()
        };

        let minimized = support(vk::Extent2D { width: 0, height: 600 });
        assert_eq!(
            plan_swapchain(&minimized, &preferences).unwrap(),
            SwapchainPlan::NotReady {
                extent: vk::Extent2D { width: 0, height: 600 }
            }
        );

        let restored = support(vk::Extent2D { width: 1024, height: 768 });
        let SwapchainPlan::Build(params) = plan_swapchain(&restored, &preferences).unwrap() else {
            panic!("expected a swapchain to be planned");
        };
        assert_eq!(params.extent, vk::Extent2D { width: 1024, height: 768 });
        assert_eq!(params.image_count, 3);
        assert_eq!(params.surface_format, pair(vk::Format::B8G8R8A8_SRGB, SRGB));
        assert_eq!(params.present_mode, vk::PresentModeKHR::MAILBOX);
        assert_eq!(params.usage, vk::ImageUsageFlags::COLOR_ATTACHMENT);
        assert_eq!(params.composite_alpha, vk::CompositeAlphaFlagsKHR::OPAQUE);
    }

    #[test]
    fn zero_extent_wins_over_unsupported_surface() {
        // Nothing is selected for a minimized window, so no selection error either
        let mut minimized = support(vk::Extent2D { width: 0, height: 0 });
        minimized.formats.clear();
        assert!(matches!(
            plan_swapchain(&minimized, &SwapchainPreferences::default()),
            Ok(SwapchainPlan::NotReady { .. })
        ));
    }
}

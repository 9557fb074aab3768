// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation with validation layers
// - Physical device selection (prefer discrete GPU, must present to the surface if any)
// - Logical device + graphics/present queue creation
// - Memory allocator setup
//
// Bootstrap only: the frame pacing core consumes the queues and the allocator but never
// creates them itself.

use anyhow::{Context, Result};
use ash::{vk, Entry};
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use parking_lot::Mutex;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::ffi::{c_char, CStr, CString};
use std::mem::ManuallyDrop;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::surface::Surface;

/// What to build: a headless device when `window` is `None`.
pub struct DeviceDesc<'a> {
    pub app_name: &'a str,
    pub enable_validation: bool,
    pub window: Option<(RawDisplayHandle, RawWindowHandle)>,
}

/// A queue handle together with the family it came from.
#[derive(Debug, Clone, Copy)]
pub struct Queue {
    pub handle: vk::Queue,
    pub family: u32,
}

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    // Dropped by hand before the device goes away
    allocator: ManuallyDrop<Mutex<Allocator>>,
    live_allocations: AtomicUsize,

    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    pub entry: Entry,

    // Queue handles (graphics and present may be the same queue)
    pub graphics_queue: Queue,
    pub present_queue: Queue,

    // Debug utils (if validation enabled)
    debug_utils: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,

    // Device properties (cached)
    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl VulkanDevice {
    /// Create the Vulkan device, plus the presentation surface when a window is given.
    pub fn new(desc: &DeviceDesc<'_>) -> Result<(Arc<Self>, Option<Surface>)> {
        log::info!("Creating Vulkan device: {}", desc.app_name);

        // Step 1: Load Vulkan library
        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        // Step 2: Create instance with the surface extensions this window needs
        let mut extensions: Vec<*const c_char> = match desc.window {
            Some((display, _)) => ash_window::enumerate_required_extensions(display)
                .context("Failed to query surface extensions")?
                .to_vec(),
            None => Vec::new(),
        };
        if desc.enable_validation {
            extensions.push(ash::ext::debug_utils::NAME.as_ptr());
        }
        let instance = Self::create_instance(&entry, desc.app_name, &extensions, desc.enable_validation)?;

        // Step 3: Setup debug messenger if validation enabled
        let debug_utils = if desc.enable_validation {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        // Step 4: Surface first, physical device selection needs it
        let surface = match desc.window {
            Some((display, window)) => Some(
                unsafe { ash_window::create_surface(&entry, &instance, display, window, None) }
                    .context("Failed to create presentation surface")?,
            ),
            None => None,
        };
        let surface_loader = ash::khr::surface::Instance::new(&entry, &instance);

        // Step 5: Pick physical device (GPU)
        let picked = Self::pick_physical_device(&instance, &surface_loader, surface);
        let (physical_device, graphics_family, present_family) = match picked {
            Ok(picked) => picked,
            Err(e) => {
                unsafe {
                    if let Some(surface) = surface {
                        surface_loader.destroy_surface(surface, None);
                    }
                    if let Some((utils, messenger)) = &debug_utils {
                        utils.destroy_debug_utils_messenger(*messenger, None);
                    }
                    instance.destroy_instance(None);
                }
                return Err(e);
            }
        };

        // Step 6: Create logical device
        let device = Self::create_logical_device(
            &instance,
            physical_device,
            graphics_family,
            present_family,
            surface.is_some(),
        )?;
        let graphics_queue = Queue {
            handle: unsafe { device.get_device_queue(graphics_family, 0) },
            family: graphics_family,
        };
        let present_queue = Queue {
            handle: unsafe { device.get_device_queue(present_family, 0) },
            family: present_family,
        };

        // Step 7: Cache device properties
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        log::info!(
            "Selected GPU: {}",
            properties
                .device_name_as_c_str()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "<unnamed>".to_string())
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );
        if graphics_family != present_family {
            log::info!(
                "Graphics family {} and present family {} differ",
                graphics_family,
                present_family
            );
        }

        // Step 8: Create memory allocator
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .context("Failed to create memory allocator")?;

        let device = Arc::new(Self {
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            live_allocations: AtomicUsize::new(0),
            device,
            physical_device,
            instance,
            entry,
            graphics_queue,
            present_queue,
            debug_utils,
            properties,
            memory_properties,
        });

        let surface = surface.map(|handle| Surface::from_raw(&device, surface_loader, handle));
        Ok((device, surface))
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        extensions: &[*const c_char],
        enable_validation: bool,
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)?;
        let engine_name = c"frame-pacer";

        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_2);

        // Validation layers
        let layer_names = if enable_validation {
            vec![c"VK_LAYER_KHRONOS_validation".as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")?;

        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::ext::debug_utils::Instance::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .context("Failed to create debug messenger")?;

        Ok((debug_utils, messenger))
    }

    /// Returns (physical device, graphics family, present family).
    fn pick_physical_device(
        instance: &ash::Instance,
        surface_loader: &ash::khr::surface::Instance,
        surface: Option<vk::SurfaceKHR>,
    ) -> Result<(vk::PhysicalDevice, u32, u32)> {
        let devices = unsafe { instance.enumerate_physical_devices() }?;

        if devices.is_empty() {
            anyhow::bail!("No Vulkan-capable GPU found");
        }

        // Score each device
        let mut best_device = None;
        let mut best_score = 0;

        for device in devices {
            let props = unsafe { instance.get_physical_device_properties(device) };
            let queue_families =
                unsafe { instance.get_physical_device_queue_family_properties(device) };

            let graphics_family = queue_families
                .iter()
                .position(|family| family.queue_flags.contains(vk::QueueFlags::GRAPHICS))
                .map(|i| i as u32);
            let Some(graphics_family) = graphics_family else {
                continue;
            };

            // Present family: prefer the graphics family when it can present
            let present_family = match surface {
                None => Some(graphics_family),
                Some(surface) => {
                    let supports = |family: u32| unsafe {
                        surface_loader
                            .get_physical_device_surface_support(device, family, surface)
                            .unwrap_or(false)
                    };
                    if supports(graphics_family) {
                        Some(graphics_family)
                    } else {
                        (0..queue_families.len() as u32).find(|&family| supports(family))
                    }
                }
            };
            let Some(present_family) = present_family else {
                continue;
            };

            // Score device (prefer discrete GPU)
            let score = match props.device_type {
                vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
                vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
                _ => 1,
            };

            if score > best_score {
                best_score = score;
                best_device = Some((device, graphics_family, present_family));
            }
        }

        best_device.ok_or_else(|| anyhow::anyhow!("No suitable GPU found"))
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        graphics_family: u32,
        present_family: u32,
        presenting: bool,
    ) -> Result<ash::Device> {
        let queue_priorities = [1.0];
        let mut queue_create_infos = vec![vk::DeviceQueueCreateInfo::default()
            .queue_family_index(graphics_family)
            .queue_priorities(&queue_priorities)];
        if present_family != graphics_family {
            queue_create_infos.push(
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(present_family)
                    .queue_priorities(&queue_priorities),
            );
        }

        // Required device extensions
        let extensions = if presenting {
            vec![ash::khr::swapchain::NAME.as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .context("Failed to create logical device")?;

        Ok(device)
    }

    /// Wait for device to be idle (e.g., before cleanup or a swapchain rebuild)
    pub fn wait_idle(&self) -> Result<(), vk::Result> {
        unsafe { self.device.device_wait_idle() }
    }

    /// Shared memory allocator
    pub fn allocator(&self) -> &Mutex<Allocator> {
        &self.allocator
    }

    /// Number of gpu-allocator allocations currently owned by RAII resources.
    pub fn live_allocations(&self) -> usize {
        self.live_allocations.load(Ordering::Acquire)
    }

    pub(crate) fn track_allocation(&self) {
        self.live_allocations.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn untrack_allocation(&self) {
        self.live_allocations.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        // Wait for device to finish
        let _ = self.wait_idle();

        let leaked = self.live_allocations();
        if leaked != 0 {
            log::warn!("{} GPU allocations still alive at device teardown", leaked);
        }

        // Cleanup in reverse order; the allocator must go before the device
        unsafe {
            ManuallyDrop::drop(&mut self.allocator);

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() || (*p_callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}

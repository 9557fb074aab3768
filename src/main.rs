// =============================================================================
// FRAME PACER DEMO - Clears the window every frame through the frame pacer
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  winit App (window, input, resize)                              │
// │    └── FramePacer                                               │
// │          └── VulkanFrameBackend                                 │
// │                ├── SwapchainState (images, rebuilds)            │
// │                └── FrameRing (per-frame fences, semaphores,     │
// │                               depth, framebuffer)               │
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW (one FramePacer::run_cycle):
// 1. Wait for the ring slot's fence, reset it
// 2. Acquire swapchain image
// 3. Build the slot's framebuffer
// 4. Record (the closure below: upload this frame's constants through a staging
//    buffer, then a render pass that clears color + depth)
// 5. Submit
// 6. Present
//
// =============================================================================

use anyhow::{Context, Result};
use ash::vk;
use frame_pacer::backend::memory::GpuBuffer;
use frame_pacer::backend::staging::{self, BufferUpload};
use frame_pacer::backend::{command, CommandPool, DeviceDesc, VulkanDevice};
use frame_pacer::config::Config;
use frame_pacer::frame::{CycleOutcome, FramePacer, SkipReason, VulkanFrameBackend};
use frame_pacer::FrameResult;
use gpu_allocator::MemoryLocation;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    window::{Fullscreen, Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    // Load configuration from config.toml
    let config = Config::load();

    // Initialize logging
    init_logging(&config);
    log::info!("Starting frame pacer demo");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );
    log::info!(
        "Present mode: {}, ring size: {}",
        config.graphics.present_mode,
        config.frames.ring_size
    );

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

/// Log to stderr, or to a fresh log file when `debug.log_to_file` is set.
fn init_logging(config: &Config) {
    use env_logger::{Builder, Target};
    use log::LevelFilter;

    let mut builder = Builder::from_default_env();
    builder.filter_level(LevelFilter::Info);

    if config.debug.log_to_file {
        match OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
        {
            Ok(mut file) => {
                let _ = writeln!(file, "=== Frame Pacer Log ===");
                let _ = writeln!(file, "Started: {:?}", std::time::SystemTime::now());
                let _ = writeln!(file);
                builder.target(Target::Pipe(Box::new(file)));
            }
            // Logging is not up yet
            Err(e) => eprintln!("Cannot open {}: {}", config.debug.log_file, e),
        }
    }

    builder.init();
}

/// Map a key name from config.toml onto a winit key code.
fn key_code(name: &str) -> Option<KeyCode> {
    let code = match name.to_lowercase().as_str() {
        "escape" | "esc" => KeyCode::Escape,
        "q" => KeyCode::KeyQ,
        "f" => KeyCode::KeyF,
        "enter" | "return" => KeyCode::Enter,
        "f1" => KeyCode::F1,
        "f2" => KeyCode::F2,
        "f3" => KeyCode::F3,
        "f4" => KeyCode::F4,
        "f5" => KeyCode::F5,
        "f6" => KeyCode::F6,
        "f7" => KeyCode::F7,
        "f8" => KeyCode::F8,
        "f9" => KeyCode::F9,
        "f10" => KeyCode::F10,
        "f11" => KeyCode::F11,
        "f12" => KeyCode::F12,
        _ => {
            log::warn!("Unknown key '{}' in config, binding ignored", name);
            return None;
        }
    };
    Some(code)
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// IMPORTANT: Field order matters for Drop! The pacer (and everything it owns)
/// must go before the last reference to the device.
struct App {
    // ─────────────────────────────────────────────────────────────────────────
    // CONFIGURATION
    // ─────────────────────────────────────────────────────────────────────────
    config: Config,
    fullscreen_key: Option<KeyCode>,
    quit_key: Option<KeyCode>,

    // ─────────────────────────────────────────────────────────────────────────
    // VULKAN
    // ─────────────────────────────────────────────────────────────────────────
    uploads: Option<FrameUploads>,
    pacer: Option<FramePacer<VulkanFrameBackend>>,
    device: Option<Arc<VulkanDevice>>,

    // ─────────────────────────────────────────────────────────────────────────
    // WINDOW
    // ─────────────────────────────────────────────────────────────────────────
    window: Option<Arc<Window>>,
    is_fullscreen: bool,
    /// Set on resize, handled before the next frame
    needs_resize: bool,

    // ─────────────────────────────────────────────────────────────────────────
    // FPS TRACKING
    // ─────────────────────────────────────────────────────────────────────────
    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
    started: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        let is_fullscreen = config.window.fullscreen;
        let fullscreen_key = key_code(&config.controls.fullscreen_key);
        let quit_key = key_code(&config.controls.quit_key);
        let now = Instant::now();
        Self {
            config,
            fullscreen_key,
            quit_key,
            uploads: None,
            pacer: None,
            device: None,
            window: None,
            is_fullscreen,
            needs_resize: false,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
            started: now,
        }
    }

    // =========================================================================
    // INITIALIZATION
    // =========================================================================

    /// Device + surface, then swapchain, ring and render pass behind the pacer.
    fn init_vulkan(&mut self, window: &Window) -> Result<()> {
        log::info!("Initializing Vulkan...");

        // Enable validation layers based on config (and debug build)
        let enable_validation = cfg!(debug_assertions) && self.config.debug.validation_layers;
        let display = window
            .display_handle()
            .context("Failed to get display handle")?
            .as_raw();
        let window_handle = window
            .window_handle()
            .context("Failed to get window handle")?
            .as_raw();

        let (device, surface) = VulkanDevice::new(&DeviceDesc {
            app_name: &self.config.window.title,
            enable_validation,
            window: Some((display, window_handle)),
        })?;
        let surface = surface.context("Device was created without a surface")?;

        let mut preferences = self.config.swapchain_preferences();
        let size = window.inner_size();
        preferences.fallback_extent = vk::Extent2D {
            width: size.width,
            height: size.height,
        };

        let settings = self.config.pacer_settings();
        let backend = VulkanFrameBackend::new(
            &device,
            surface,
            preferences,
            settings.ring_size,
            self.config.depth_format(),
        )?;

        self.uploads = Some(FrameUploads::new(&device)?);
        self.pacer = Some(FramePacer::new(backend, settings));
        self.device = Some(device);

        log::info!("Vulkan initialized successfully!");
        Ok(())
    }

    // =========================================================================
    // RENDER LOOP
    // =========================================================================

    /// Run one pacer cycle. Returns whether a frame was presented.
    fn render_frame(&mut self) -> Result<bool> {
        let Some(pacer) = self.pacer.as_mut() else {
            return Ok(false);
        };

        if self.needs_resize {
            if let Some(ref window) = self.window {
                let size = window.inner_size();
                pacer.backend_mut().set_fallback_extent(vk::Extent2D {
                    width: size.width,
                    height: size.height,
                });
            }
            pacer.resize()?;
            self.needs_resize = false;
        }

        // Everything the recorder needs is fixed for the whole cycle
        let backend = pacer.backend();
        let device = Arc::clone(backend.device());
        let render_pass = backend.render_pass();
        let extent = backend.extent();
        let has_depth = backend.ring().depth_format().is_some();
        let staging_timeout_ns = pacer.settings().staging_timeout_ns;
        let constants = FrameConstants {
            clear_color: pulse(self.config.graphics.clear_color, self.started.elapsed().as_secs_f32()),
            time: self.started.elapsed().as_secs_f32(),
            frame: pacer.frame_counter() as f32,
            extent,
        };
        let uploads = self.uploads.as_ref().context("Frame uploads missing")?;

        let mut record = |cmd: vk::CommandBuffer, _image_index: u32, framebuffer: vk::Framebuffer| -> Result<()> {
            uploads.upload(&constants, staging_timeout_ns)?;
            record_clear(
                &device.device,
                cmd,
                render_pass,
                framebuffer,
                extent,
                constants.clear_color,
                has_depth,
            )?;
            Ok(())
        };

        match pacer.run_cycle(&mut record, &[])? {
            CycleOutcome::Presented { rebuilt, .. } => {
                if rebuilt {
                    log::debug!("Swapchain rebuilt after present");
                }
                Ok(true)
            }
            CycleOutcome::Skipped(SkipReason::NotReady) => Ok(false),
            CycleOutcome::Skipped(SkipReason::SwapchainStale) => {
                log::debug!("Frame skipped, swapchain was out of date");
                Ok(false)
            }
        }
    }

    // =========================================================================
    // FULLSCREEN TOGGLE
    // =========================================================================

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                // Enter fullscreen (use current monitor)
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }

            self.needs_resize = true;
        }
    }

    // =========================================================================
    // FPS TRACKING
    // =========================================================================

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        // Update title every second
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;

            if let (Some(window), Some(pacer)) = (&self.window, &self.pacer) {
                let mode = if self.is_fullscreen { "fullscreen" } else { "windowed" };
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms) [{}] frame {} slot {}",
                    self.config.window.title,
                    fps,
                    frame_time * 1000.0,
                    mode,
                    pacer.frame_counter(),
                    pacer.current_slot()
                ));
            }

            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

// =============================================================================
// PER-FRAME CONSTANTS
// =============================================================================

/// Small per-frame block, laid out like a std140 uniform block.
struct FrameConstants {
    clear_color: [f32; 4],
    time: f32,
    frame: f32,
    extent: vk::Extent2D,
}

impl FrameConstants {
    const SIZE: usize = 32;

    fn to_bytes(&self) -> Vec<u8> {
        let values = [
            self.clear_color[0],
            self.clear_color[1],
            self.clear_color[2],
            self.clear_color[3],
            self.time,
            self.frame,
            self.extent.width as f32,
            self.extent.height as f32,
        ];
        values.iter().flat_map(|v| v.to_ne_bytes()).collect()
    }
}

/// Slowly breathe the configured clear color so frames are visibly distinct.
fn pulse(color: [f32; 4], seconds: f32) -> [f32; 4] {
    let scale = 0.75 + 0.25 * (seconds * std::f32::consts::TAU * 0.25).sin();
    [color[0] * scale, color[1] * scale, color[2] * scale, color[3]]
}

/// Device-local uniform buffer refreshed every frame through a staging upload.
struct FrameUploads {
    constants: GpuBuffer,
    scratch: vk::CommandBuffer,
    // Frees `scratch`; dropped after it is no longer used
    _pool: CommandPool,
    device: Arc<VulkanDevice>,
}

impl FrameUploads {
    fn new(device: &Arc<VulkanDevice>) -> Result<Self> {
        let pool = CommandPool::new(device, device.graphics_queue.family)?;
        let scratch = pool
            .allocate(1)?
            .pop()
            .context("No upload command buffer allocated")?;
        let constants = GpuBuffer::new(
            device,
            "frame constants",
            FrameConstants::SIZE as vk::DeviceSize,
            vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuOnly,
            false,
        )?;
        Ok(Self {
            constants,
            scratch,
            _pool: pool,
            device: Arc::clone(device),
        })
    }

    /// Synchronous: returns once the copy has finished on the GPU.
    fn upload(&self, constants: &FrameConstants, timeout_ns: u64) -> FrameResult<()> {
        staging::upload_to_buffer(
            &self.device,
            &constants.to_bytes(),
            &BufferUpload {
                buffer: self.constants.handle(),
                offset: 0,
                current_access: vk::AccessFlags::UNIFORM_READ,
                new_access: vk::AccessFlags::UNIFORM_READ,
                generating_stages: vk::PipelineStageFlags::FRAGMENT_SHADER,
                consuming_stages: vk::PipelineStageFlags::FRAGMENT_SHADER,
            },
            self.device.graphics_queue.handle,
            self.scratch,
            &[],
            timeout_ns,
        )
    }
}

// =============================================================================
// COMMAND RECORDING
// =============================================================================

/// Clear color (and depth) with a render pass. The pass leaves the image in
/// PRESENT_SRC_KHR, so no extra barrier is needed before presenting.
fn record_clear(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    render_pass: vk::RenderPass,
    framebuffer: vk::Framebuffer,
    extent: vk::Extent2D,
    color: [f32; 4],
    has_depth: bool,
) -> frame_pacer::FrameResult<()> {
    command::begin(device, cmd, true)?;

    let mut clear_values = vec![vk::ClearValue {
        color: vk::ClearColorValue { float32: color },
    }];
    if has_depth {
        clear_values.push(vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue {
                depth: 1.0,
                stencil: 0,
            },
        });
    }

    let begin_info = vk::RenderPassBeginInfo::default()
        .render_pass(render_pass)
        .framebuffer(framebuffer)
        .render_area(vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        })
        .clear_values(&clear_values);

    unsafe {
        device.cmd_begin_render_pass(cmd, &begin_info, vk::SubpassContents::INLINE);
        device.cmd_end_render_pass(cmd);
    }

    command::end(device, cmd)
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    /// Called when the application is ready to create windows.
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        // Create window with settings from config
        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        if self.config.window.fullscreen {
            window_attributes = window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        if let Err(e) = self.init_vulkan(&window) {
            log::error!("Failed to initialize Vulkan: {:?}", e);
            event_loop.exit();
            return;
        }

        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                if let Some(ref device) = self.device {
                    let _ = device.wait_idle();
                }
                event_loop.exit();
            }

            // Zero-sized (minimized) windows are handled by the pacer as "not ready"
            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                self.needs_resize = true;
            }

            WindowEvent::RedrawRequested => match self.render_frame() {
                Ok(true) => self.update_fps(),
                Ok(false) => {}
                Err(e) => {
                    log::error!("Render error: {:?}", e);
                    let lost = e
                        .downcast_ref::<frame_pacer::FrameError>()
                        .is_some_and(|e| e.is_device_lost());
                    if lost {
                        log::error!("GPU appears to be lost, exiting");
                        event_loop.exit();
                    }
                }
            },

            WindowEvent::KeyboardInput { event, .. } => {
                if !event.state.is_pressed() {
                    return;
                }
                if let PhysicalKey::Code(key) = event.physical_key {
                    if Some(key) == self.quit_key {
                        log::info!("{:?} pressed, exiting...", key);
                        event_loop.exit();
                    } else if Some(key) == self.fullscreen_key {
                        self.toggle_fullscreen();
                    }
                }
            }

            _ => {}
        }
    }

    /// Request continuous redraws.
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}

// =============================================================================
// CLEANUP
// =============================================================================

impl Drop for App {
    fn drop(&mut self) {
        log::info!("Cleaning up Vulkan resources...");

        if let Some(ref device) = self.device {
            // Wait for GPU to finish before destroying anything
            let _ = device.wait_idle();
        }
        // Everything holding device objects goes before the device itself
        self.uploads = None;
        self.pacer = None;
        self.device = None;

        log::info!("Cleanup complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_key_names_map_to_key_codes() {
        assert_eq!(key_code("F11"), Some(KeyCode::F11));
        assert_eq!(key_code("Escape"), Some(KeyCode::Escape));
        assert_eq!(key_code("esc"), Some(KeyCode::Escape));
        assert_eq!(key_code("Hyper"), None);
    }

    #[test]
    fn frame_constants_fill_the_uniform_block() {
        let constants = FrameConstants {
            clear_color: [0.1, 0.2, 0.3, 1.0],
            time: 2.5,
            frame: 7.0,
            extent: vk::Extent2D { width: 640, height: 480 },
        };
        let bytes = constants.to_bytes();
        assert_eq!(bytes.len(), FrameConstants::SIZE);
        assert_eq!(&bytes[16..20], &2.5f32.to_ne_bytes());
        assert_eq!(&bytes[28..32], &480.0f32.to_ne_bytes());
    }

    #[test]
    fn pulse_keeps_alpha_and_stays_in_range() {
        for step in 0..16 {
            let color = pulse([0.8, 0.4, 1.0, 0.5], step as f32 * 0.37);
            assert_eq!(color[3], 0.5);
            assert!(color[2] >= 0.5 - 1e-6 && color[2] <= 1.0 + 1e-6);
        }
    }
}

// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// This module handles loading and parsing configuration from config.toml.
// Provides sensible defaults if config file is missing or has errors.
// Unknown enum strings fall back to a default with a warning.

use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;
use std::path::Path;

use crate::backend::sync::DEFAULT_FENCE_TIMEOUT_NS;
use crate::backend::SwapchainPreferences;
use crate::frame::PacerSettings;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub frames: FramesConfig,
    pub debug: DebugConfig,
    pub controls: ControlsConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Frame Pacer".to_string(),
            width: 1280,
            height: 720,
            fullscreen: false,
        }
    }
}

/// Swapchain and render pass settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub present_mode: String,
    pub surface_format: String,
    pub color_space: String,
    pub clear_color: [f32; 4],
    pub depth_attachments: bool,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: "fifo".to_string(),
            surface_format: "b8g8r8a8_srgb".to_string(),
            color_space: "srgb_nonlinear".to_string(),
            clear_color: [0.1, 0.2, 0.8, 1.0],
            depth_attachments: true,
        }
    }
}

/// Frame ring and timeout settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct FramesConfig {
    pub ring_size: usize,
    pub fence_timeout_ns: u64,
    pub staging_timeout_ns: u64,
}

impl Default for FramesConfig {
    fn default() -> Self {
        Self {
            ring_size: 3,
            fence_timeout_ns: DEFAULT_FENCE_TIMEOUT_NS,
            staging_timeout_ns: DEFAULT_FENCE_TIMEOUT_NS,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_to_file: bool,
    pub log_file: String,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_to_file: false,
            log_file: "frame_pacer.log".to_string(),
            show_fps: true,
        }
    }
}

/// Control key bindings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ControlsConfig {
    pub fullscreen_key: String,
    pub quit_key: String,
}

impl Default for ControlsConfig {
    fn default() -> Self {
        Self {
            fullscreen_key: "F11".to_string(),
            quit_key: "Escape".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    /// Get present mode as Vulkan enum
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        match self.graphics.present_mode.to_lowercase().as_str() {
            "immediate" => vk::PresentModeKHR::IMMEDIATE,
            "mailbox" => vk::PresentModeKHR::MAILBOX,
            "fifo" => vk::PresentModeKHR::FIFO,
            "fifo_relaxed" => vk::PresentModeKHR::FIFO_RELAXED,
            _ => {
                log::warn!(
                    "Unknown present mode '{}', defaulting to FIFO",
                    self.graphics.present_mode
                );
                vk::PresentModeKHR::FIFO
            }
        }
    }

    pub fn surface_format(&self) -> vk::Format {
        match self.graphics.surface_format.to_lowercase().as_str() {
            "b8g8r8a8_srgb" => vk::Format::B8G8R8A8_SRGB,
            "b8g8r8a8_unorm" => vk::Format::B8G8R8A8_UNORM,
            "r8g8b8a8_srgb" => vk::Format::R8G8B8A8_SRGB,
            "r8g8b8a8_unorm" => vk::Format::R8G8B8A8_UNORM,
            "a2b10g10r10_unorm" => vk::Format::A2B10G10R10_UNORM_PACK32,
            "r16g16b16a16_sfloat" => vk::Format::R16G16B16A16_SFLOAT,
            _ => {
                log::warn!(
                    "Unknown surface format '{}', defaulting to B8G8R8A8_SRGB",
                    self.graphics.surface_format
                );
                vk::Format::B8G8R8A8_SRGB
            }
        }
    }

    pub fn color_space(&self) -> vk::ColorSpaceKHR {
        match self.graphics.color_space.to_lowercase().as_str() {
            "srgb_nonlinear" => vk::ColorSpaceKHR::SRGB_NONLINEAR,
            "extended_srgb_linear" => vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT,
            "hdr10_st2084" => vk::ColorSpaceKHR::HDR10_ST2084_EXT,
            _ => {
                log::warn!(
                    "Unknown color space '{}', defaulting to SRGB_NONLINEAR",
                    self.graphics.color_space
                );
                vk::ColorSpaceKHR::SRGB_NONLINEAR
            }
        }
    }

    /// Depth format for the ring's attachments, if depth is enabled.
    pub fn depth_format(&self) -> Option<vk::Format> {
        self.graphics.depth_attachments.then_some(vk::Format::D32_SFLOAT)
    }

    pub fn swapchain_preferences(&self) -> SwapchainPreferences {
        SwapchainPreferences {
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            format: self.surface_format(),
            color_space: self.color_space(),
            present_mode: self.present_mode(),
            transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            fallback_extent: vk::Extent2D {
                width: self.window.width,
                height: self.window.height,
            },
        }
    }

    pub fn pacer_settings(&self) -> PacerSettings {
        let ring_size = if self.frames.ring_size < 2 {
            log::warn!(
                "ring_size {} is too small, using 2",
                self.frames.ring_size
            );
            2
        } else {
            self.frames.ring_size
        };

        PacerSettings {
            ring_size,
            fence_timeout_ns: self.frames.fence_timeout_ns,
            acquire_timeout_ns: self.frames.fence_timeout_ns,
            staging_timeout_ns: self.frames.staging_timeout_ns,
        }
    }
}

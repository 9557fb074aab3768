// Backend module - Vulkan abstraction layer
//
// Design: Thin wrapper around ash with safety and ergonomics
// Every handle has one owner that destroys it on drop.

pub mod barrier;
pub mod command;
pub mod device;
pub mod memory;
pub mod pipeline_cache;
pub mod render_pass;
pub mod staging;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use command::CommandPool;
pub use device::{DeviceDesc, Queue, VulkanDevice};
pub use surface::Surface;
pub use swapchain::{SwapchainPreferences, SwapchainState};
pub use sync::{Fence, FenceStatus, Semaphore, WaitSemaphore};

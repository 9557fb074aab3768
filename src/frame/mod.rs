// Frame pacing
//
// ring: per-frame resources; pacer: the per-frame state machine;
// vulkan: the pacer's Vulkan backend; parallel: multi-threaded recording.

pub mod parallel;
pub mod pacer;
pub mod ring;
pub mod vulkan;

pub use pacer::{CycleOutcome, FrameBackend, FramePacer, PacerSettings, PacerState, Recorder, SkipReason};
pub use ring::{FrameRing, FrameSlot};
pub use vulkan::VulkanFrameBackend;

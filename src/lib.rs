//! Frame pacing and GPU/CPU synchronization for a Vulkan render loop.
//!
//! The [`frame::FramePacer`] runs one acquire, record, submit, present cycle per call
//! over a small [`frame::FrameRing`] of per-frame resources. [`backend::staging`] uploads
//! host data into device-local memory; [`backend::swapchain`] owns presentation and its
//! rebuilds.

pub mod backend;
pub mod config;
pub mod error;
pub mod frame;

pub use error::{FrameError, FrameResult};

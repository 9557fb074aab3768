// Frame pacer
//
// Drives one acquire -> record -> submit -> present cycle per call, using ring slots
// round-robin. The ring size bounds how many frames the CPU may run ahead of the GPU.
//
// Recoverable swapchain conditions are absorbed here and reported as skipped frames;
// everything else is returned to the caller.

use ash::vk;

use crate::backend::swapchain::{AcquireOutcome, PresentOutcome};
use crate::backend::sync::{FenceStatus, WaitSemaphore, DEFAULT_FENCE_TIMEOUT_NS};
use crate::error::{FrameError, FrameResult};

/// Records one frame's commands. Must not submit or present.
pub trait Recorder {
    fn record(
        &mut self,
        target: vk::CommandBuffer,
        image_index: u32,
        framebuffer: vk::Framebuffer,
    ) -> anyhow::Result<()>;
}

impl<F> Recorder for F
where
    F: FnMut(vk::CommandBuffer, u32, vk::Framebuffer) -> anyhow::Result<()>,
{
    fn record(
        &mut self,
        target: vk::CommandBuffer,
        image_index: u32,
        framebuffer: vk::Framebuffer,
    ) -> anyhow::Result<()> {
        self(target, image_index, framebuffer)
    }
}

/// The GPU-facing half of the pacer, one method per step of a cycle.
pub trait FrameBackend {
    fn slot_count(&self) -> usize;

    /// Zero-sized surface; nothing can be acquired.
    fn not_ready(&self) -> bool;

    fn image_acquired(&self, slot: usize) -> vk::Semaphore;

    fn wait_slot(&mut self, slot: usize, timeout_ns: u64) -> FrameResult<FenceStatus>;

    fn reset_slot(&mut self, slot: usize) -> FrameResult<()>;

    fn acquire(&mut self, slot: usize, timeout_ns: u64) -> FrameResult<AcquireOutcome>;

    /// Build the slot's framebuffer around the acquired image.
    fn prepare_framebuffer(&mut self, slot: usize, image_index: u32) -> FrameResult<vk::Framebuffer>;

    fn recording_target(&self, slot: usize) -> vk::CommandBuffer;

    /// Submit the slot's recording, signaling its present semaphore and fence.
    fn submit(&mut self, slot: usize, waits: &[WaitSemaphore]) -> FrameResult<()>;

    fn present(&mut self, slot: usize, image_index: u32) -> FrameResult<PresentOutcome>;

    /// Signal the slot's fence without real work after an aborted cycle, consuming the
    /// image-acquired semaphore when it was signaled.
    fn retire(&mut self, slot: usize, image_acquired: bool) -> FrameResult<()>;

    /// Wait for the device, then rebuild the swapchain and everything sized to it.
    fn rebuild(&mut self) -> FrameResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacerState {
    Idle,
    SlotSelected,
    ImageAcquired,
    Recorded,
    Submitted,
    Presented,
    /// Swapchain has no images; left once a rebuild produces some.
    Unready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotReady,
    SwapchainStale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Presented {
        slot: usize,
        image_index: u32,
        /// The swapchain was rebuilt after presenting.
        rebuilt: bool,
    },
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacerSettings {
    pub ring_size: usize,
    pub fence_timeout_ns: u64,
    pub acquire_timeout_ns: u64,
    pub staging_timeout_ns: u64,
}

impl Default for PacerSettings {
    fn default() -> Self {
        Self {
            ring_size: 3,
            fence_timeout_ns: DEFAULT_FENCE_TIMEOUT_NS,
            acquire_timeout_ns: DEFAULT_FENCE_TIMEOUT_NS,
            staging_timeout_ns: DEFAULT_FENCE_TIMEOUT_NS,
        }
    }
}

pub struct FramePacer<B: FrameBackend> {
    backend: B,
    settings: PacerSettings,
    frame_counter: u64,
    rebuilds: u64,
    state: PacerState,
}

impl<B: FrameBackend> FramePacer<B> {
    pub fn new(backend: B, settings: PacerSettings) -> Self {
        let state = if backend.not_ready() {
            PacerState::Unready
        } else {
            PacerState::Idle
        };
        Self {
            backend,
            settings,
            frame_counter: 0,
            rebuilds: 0,
            state,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn settings(&self) -> &PacerSettings {
        &self.settings
    }

    pub fn state(&self) -> PacerState {
        self.state
    }

    /// Frames presented so far.
    pub fn frame_counter(&self) -> u64 {
        self.frame_counter
    }

    /// Swapchain rebuilds so far, whether triggered by resize or by a stale swapchain.
    pub fn rebuild_count(&self) -> u64 {
        self.rebuilds
    }

    /// Slot the next cycle will use.
    pub fn current_slot(&self) -> usize {
        (self.frame_counter % self.backend.slot_count() as u64) as usize
    }

    /// Rebuild for a new surface size. Call on window resize.
    pub fn resize(&mut self) -> FrameResult<()> {
        self.rebuild_swapchain()
    }

    fn rebuild_swapchain(&mut self) -> FrameResult<()> {
        self.backend.rebuild()?;
        self.rebuilds += 1;
        self.state = if self.backend.not_ready() {
            PacerState::Unready
        } else {
            PacerState::Idle
        };
        Ok(())
    }

    /// Put the slot's fence back into the signaled state after a cycle that reset it
    /// but will not submit. Failures here are secondary to whatever aborted the cycle.
    fn retire_quietly(&mut self, slot: usize, image_acquired: bool) {
        if let Err(e) = self.backend.retire(slot, image_acquired) {
            log::warn!("Failed to retire frame slot {}: {}", slot, e);
        }
        self.state = PacerState::Idle;
    }

    /// Give up on an acquired image that will never be presented. The image stays
    /// acquired until its swapchain is replaced, so the swapchain is rebuilt.
    fn abandon_image(&mut self, slot: usize) -> FrameResult<()> {
        self.retire_quietly(slot, true);
        self.rebuild_swapchain()
    }

    /// As `abandon_image`, for cycles that already fail with another error.
    fn abandon_image_quietly(&mut self, slot: usize) {
        if let Err(e) = self.abandon_image(slot) {
            log::warn!("Swapchain rebuild after aborted frame failed: {}", e);
        }
    }

    /// Run one frame cycle, calling `recorder` once if the cycle gets that far.
    ///
    /// `waits` are extra semaphores the submission waits on (e.g. from uploads).
    pub fn run_cycle<R: Recorder + ?Sized>(
        &mut self,
        recorder: &mut R,
        waits: &[WaitSemaphore],
    ) -> FrameResult<CycleOutcome> {
        if self.backend.not_ready() {
            if self.state != PacerState::Unready {
                log::debug!("Swapchain not ready, skipping frames");
            }
            self.state = PacerState::Unready;
            return Ok(CycleOutcome::Skipped(SkipReason::NotReady));
        }

        let slot = self.current_slot();
        self.state = PacerState::SlotSelected;

        // 1. The slot's previous submission must be finished before anything is reused
        let timeout_ns = self.settings.fence_timeout_ns;
        match self.backend.wait_slot(slot, timeout_ns) {
            Ok(FenceStatus::Signaled) => {}
            Ok(FenceStatus::TimedOut) => {
                log::error!("Frame slot {} fence not signaled after {} ns", slot, timeout_ns);
                self.state = PacerState::Idle;
                return Err(FrameError::FenceTimeout { timeout_ns });
            }
            Err(e) => {
                self.state = PacerState::Idle;
                return Err(e);
            }
        }
        if let Err(e) = self.backend.reset_slot(slot) {
            self.state = PacerState::Idle;
            return Err(e);
        }

        // 2. Acquire
        let image_index = match self.backend.acquire(slot, self.settings.acquire_timeout_ns) {
            Ok(AcquireOutcome::Acquired { index, suboptimal }) => {
                if suboptimal {
                    log::trace!("Acquired suboptimal image {}", index);
                }
                index
            }
            Ok(AcquireOutcome::OutOfDate) => {
                log::debug!("Swapchain out of date at acquire, rebuilding");
                self.retire_quietly(slot, false);
                self.rebuild_swapchain()?;
                return Ok(CycleOutcome::Skipped(SkipReason::SwapchainStale));
            }
            Err(e) => {
                self.retire_quietly(slot, false);
                return Err(e);
            }
        };
        self.state = PacerState::ImageAcquired;

        // 3. + 4. Framebuffer and recording
        let framebuffer = match self.backend.prepare_framebuffer(slot, image_index) {
            Ok(framebuffer) => framebuffer,
            Err(FrameError::SwapchainStale) => {
                log::debug!("Acquired image {} has no framebuffer, rebuilding", image_index);
                self.abandon_image(slot)?;
                return Ok(CycleOutcome::Skipped(SkipReason::SwapchainStale));
            }
            Err(FrameError::NotReady) => {
                self.abandon_image(slot)?;
                return Ok(CycleOutcome::Skipped(SkipReason::NotReady));
            }
            Err(e) => {
                self.abandon_image_quietly(slot);
                return Err(e);
            }
        };
        let target = self.backend.recording_target(slot);
        if let Err(e) = recorder.record(target, image_index, framebuffer) {
            self.abandon_image_quietly(slot);
            return Err(FrameError::Callback(e));
        }
        self.state = PacerState::Recorded;

        // 5. Submit
        let mut all_waits = Vec::with_capacity(waits.len() + 1);
        all_waits.extend_from_slice(waits);
        all_waits.push(WaitSemaphore {
            semaphore: self.backend.image_acquired(slot),
            stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        });
        if let Err(e) = self.backend.submit(slot, &all_waits) {
            self.abandon_image_quietly(slot);
            return Err(e);
        }
        self.state = PacerState::Submitted;

        // 6. Present
        let rebuilt = match self.backend.present(slot, image_index)? {
            PresentOutcome::Presented => false,
            PresentOutcome::Stale => {
                log::debug!("Swapchain stale at present, rebuilding");
                true
            }
        };
        self.state = PacerState::Presented;

        // 7. Advance
        self.frame_counter += 1;
        if rebuilt {
            self.rebuild_swapchain()?;
        } else {
            self.state = PacerState::Idle;
        }

        Ok(CycleOutcome::Presented {
            slot,
            image_index,
            rebuilt,
        })
    }
}

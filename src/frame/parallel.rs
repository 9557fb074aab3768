// Parallel command recording
//
// Each worker records into its own command buffer allocated from its own pool.
// Pools are never touched by more than one thread.

use ash::vk;
use std::sync::Arc;
use std::thread;

use crate::backend::{command, CommandPool, VulkanDevice};
use crate::error::{FrameError, FrameResult};

/// One unit of recording work and the target it records into.
pub struct RecordJob<'a> {
    pub target: vk::CommandBuffer,
    pub record: Box<dyn FnOnce(vk::CommandBuffer) -> anyhow::Result<()> + Send + 'a>,
}

impl<'a> RecordJob<'a> {
    pub fn new<F>(target: vk::CommandBuffer, record: F) -> Self
    where
        F: FnOnce(vk::CommandBuffer) -> anyhow::Result<()> + Send + 'a,
    {
        Self {
            target,
            record: Box::new(record),
        }
    }
}

/// Run every job on its own thread and wait for all of them.
///
/// Returns the targets in job order, ready for a single submission. Every worker is
/// joined even when some fail; the first failure in job order is returned.
pub fn record_in_parallel(jobs: Vec<RecordJob<'_>>) -> FrameResult<Vec<vk::CommandBuffer>> {
    let targets: Vec<vk::CommandBuffer> = jobs.iter().map(|job| job.target).collect();

    let results: Vec<anyhow::Result<()>> = thread::scope(|scope| {
        let handles: Vec<_> = jobs
            .into_iter()
            .enumerate()
            .map(|(i, job)| {
                thread::Builder::new()
                    .name(format!("record-worker-{}", i))
                    .spawn_scoped(scope, move || (job.record)(job.target))
            })
            .collect();

        handles
            .into_iter()
            .map(|handle| match handle {
                Ok(handle) => handle
                    .join()
                    .unwrap_or_else(|_| Err(anyhow::anyhow!("recording worker panicked"))),
                Err(e) => Err(anyhow::Error::new(e).context("failed to spawn recording worker")),
            })
            .collect()
    });

    for (i, result) in results.into_iter().enumerate() {
        if let Err(e) = result {
            log::error!("Recording job {} failed: {:#}", i, e);
            return Err(FrameError::Callback(e));
        }
    }
    Ok(targets)
}

/// One command pool and one recording target per worker thread.
pub struct WorkerPools {
    // Targets are freed with their pool
    workers: Vec<(CommandPool, vk::CommandBuffer)>,
    device: Arc<VulkanDevice>,
}

impl WorkerPools {
    pub fn new(device: &Arc<VulkanDevice>, queue_family: u32, workers: usize) -> FrameResult<Self> {
        let workers = (0..workers)
            .map(|_| {
                let pool = CommandPool::new(device, queue_family)?;
                let target = pool
                    .allocate(1)?
                    .pop()
                    .ok_or(FrameError::creation("command buffers")(
                        vk::Result::ERROR_OUT_OF_POOL_MEMORY,
                    ))?;
                Ok((pool, target))
            })
            .collect::<FrameResult<Vec<_>>>()?;

        Ok(Self {
            workers,
            device: Arc::clone(device),
        })
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn target(&self, worker: usize) -> vk::CommandBuffer {
        self.workers[worker].1
    }

    /// Record with one closure per worker, each wrapped in begin/end.
    ///
    /// The caller must have waited for any earlier submission of these targets.
    pub fn record<F>(&self, record: F) -> FrameResult<Vec<vk::CommandBuffer>>
    where
        F: Fn(usize, vk::CommandBuffer) -> anyhow::Result<()> + Sync,
    {
        let device = &self.device.device;
        let record = &record;
        let jobs = self
            .workers
            .iter()
            .enumerate()
            .map(|(i, &(_, target))| {
                RecordJob::new(target, move |cmd| {
                    command::begin(device, cmd, true)?;
                    record(i, cmd)?;
                    command::end(device, cmd)?;
                    Ok(())
                })
            })
            .collect();
        record_in_parallel(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn target(raw: u64) -> vk::CommandBuffer {
        vk::CommandBuffer::from_raw(raw)
    }

    #[test]
    fn targets_come_back_in_job_order() {
        let jobs = (1..=4)
            .map(|raw| RecordJob::new(target(raw), |_| Ok(())))
            .collect();
        let targets = record_in_parallel(jobs).unwrap();
        assert_eq!(targets, vec![target(1), target(2), target(3), target(4)]);
    }

    #[test]
    fn each_job_sees_its_own_target_on_its_own_thread() {
        let seen = Mutex::new(Vec::new());
        let jobs = (10..14)
            .map(|raw| {
                let seen = &seen;
                RecordJob::new(target(raw), move |cmd| {
                    let name = thread::current().name().map(str::to_owned);
                    seen.lock().unwrap().push((cmd.as_raw(), name));
                    Ok(())
                })
            })
            .collect();
        record_in_parallel(jobs).unwrap();

        let mut seen = seen.into_inner().unwrap();
        seen.sort();
        let raws: Vec<u64> = seen.iter().map(|(raw, _)| *raw).collect();
        assert_eq!(raws, vec![10, 11, 12, 13]);
        assert!(seen
            .iter()
            .all(|(_, name)| name.as_deref().is_some_and(|n| n.starts_with("record-worker-"))));
    }

    #[test]
    fn one_failure_still_joins_every_worker() {
        let finished = AtomicUsize::new(0);
        let jobs = (0..4)
            .map(|i| {
                let finished = &finished;
                RecordJob::new(target(i + 1), move |_| {
                    finished.fetch_add(1, Ordering::SeqCst);
                    if i == 1 {
                        anyhow::bail!("worker {} ran out of descriptors", i);
                    }
                    Ok(())
                })
            })
            .collect();

        let err = record_in_parallel(jobs).unwrap_err();
        assert_eq!(err.to_string(), "worker 1 ran out of descriptors");
        assert_eq!(finished.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn panicking_worker_is_reported() {
        let jobs = vec![
            RecordJob::new(target(1), |_| Ok(())),
            RecordJob::new(target(2), |_| panic!("boom")),
        ];
        let err = record_in_parallel(jobs).unwrap_err();
        assert_eq!(err.to_string(), "recording worker panicked");
    }

    #[test]
    fn no_jobs_is_fine() {
        assert!(record_in_parallel(Vec::new()).unwrap().is_empty());
    }
}

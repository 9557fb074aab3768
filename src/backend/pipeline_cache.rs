// Pipeline cache: load, merge, persist
//
// Workers each fill their own cache while building pipelines; the results are merged
// into one target that is written back to disk for the next run.

use ash::vk;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::VulkanDevice;
use crate::error::{FrameError, FrameResult};

/// How a merge went. Failing sources are skipped, not fatal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub merged: usize,
    pub failed: usize,
}

pub struct PipelineCache {
    handle: vk::PipelineCache,
    loaded_from_disk: bool,
    merged_any: bool,
    device: Arc<VulkanDevice>,
}

impl PipelineCache {
    pub fn empty(device: &Arc<VulkanDevice>) -> FrameResult<Self> {
        Self::with_data(device, &[], false)
    }

    /// Seed from `path` when it holds data the driver accepts, otherwise start empty.
    pub fn load_or_empty(device: &Arc<VulkanDevice>, path: &Path) -> FrameResult<Self> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) => {
                log::info!("No pipeline cache at {}: {}", path.display(), e);
                return Self::empty(device);
            }
        };

        match Self::with_data(device, &data, true) {
            Ok(cache) => {
                log::info!("Loaded {} bytes of pipeline cache from {}", data.len(), path.display());
                Ok(cache)
            }
            Err(e) => {
                log::warn!("Discarding pipeline cache {}: {}", path.display(), e);
                Self::empty(device)
            }
        }
    }

    fn with_data(device: &Arc<VulkanDevice>, data: &[u8], loaded_from_disk: bool) -> FrameResult<Self> {
        let create_info = vk::PipelineCacheCreateInfo::default().initial_data(data);
        let handle = unsafe { device.device.create_pipeline_cache(&create_info, None) }
            .map_err(FrameError::creation("pipeline cache"))?;

        Ok(Self {
            handle,
            loaded_from_disk,
            merged_any: false,
            device: Arc::clone(device),
        })
    }

    pub fn handle(&self) -> vk::PipelineCache {
        self.handle
    }

    /// Merge each source into this cache, one at a time.
    pub fn merge_from(&mut self, sources: &[&PipelineCache]) -> MergeReport {
        let mut report = MergeReport::default();
        for (i, source) in sources.iter().enumerate() {
            let result = unsafe {
                self.device
                    .device
                    .merge_pipeline_caches(self.handle, &[source.handle])
            };
            match result {
                Ok(()) => report.merged += 1,
                Err(e) => {
                    log::warn!("Skipping pipeline cache source {}: {}", i, e);
                    report.failed += 1;
                }
            }
        }
        self.merged_any |= report.merged > 0;
        report
    }

    pub fn data(&self) -> FrameResult<Vec<u8>> {
        unsafe { self.device.device.get_pipeline_cache_data(self.handle) }
            .map_err(FrameError::vulkan("vkGetPipelineCacheData"))
    }

    /// Write the cache to `path` if it holds anything worth keeping.
    ///
    /// Returns whether a file was written.
    pub fn persist(&self, path: &Path) -> FrameResult<bool> {
        if !should_persist(self.merged_any, self.loaded_from_disk) {
            log::debug!("Pipeline cache unchanged, not writing {}", path.display());
            return Ok(false);
        }
        let data = self.data()?;
        write_atomically(path, &data)?;
        log::info!("Saved {} bytes of pipeline cache to {}", data.len(), path.display());
        Ok(true)
    }
}

impl Drop for PipelineCache {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_pipeline_cache(self.handle, None) };
    }
}

fn should_persist(merged_any: bool, loaded_from_disk: bool) -> bool {
    merged_any || loaded_from_disk
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write to a sibling temp file and rename it over `path`, so readers never see a
/// half-written cache.
fn write_atomically(path: &Path, data: &[u8]) -> FrameResult<()> {
    let tmp = temp_path(path);
    let io_error = |source| FrameError::CacheIo {
        path: path.to_path_buf(),
        source,
    };
    fs::write(&tmp, data).map_err(io_error)?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(io_error(e));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persists_only_with_new_or_loaded_content() {
        assert!(!should_persist(false, false));
        assert!(should_persist(true, false));
        assert!(should_persist(false, true));
    }

    #[test]
    fn temp_file_sits_next_to_target() {
        let tmp = temp_path(Path::new("cache/pipelines.bin"));
        assert_eq!(tmp, Path::new("cache/pipelines.bin.tmp"));
    }

    #[test]
    fn atomic_write_replaces_previous_contents() {
        let path = std::env::temp_dir().join(format!("frame-pacer-cache-{}.bin", std::process::id()));
        write_atomically(&path, b"first").unwrap();
        write_atomically(&path, b"second").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"second");
        assert!(!temp_path(&path).exists());
        fs::remove_file(&path).unwrap();
    }
}

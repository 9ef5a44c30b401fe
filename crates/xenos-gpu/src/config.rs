//! Command processor tuning.

use crate::pipeline_cache::PipelineCacheConfig;
use crate::scratch::DEFAULT_SCRATCH_INCREMENT;

/// Forces a CPU/GPU sync at every frame (one frame in flight). Handy when
/// bisecting corruption caused by resource reuse.
pub const SYNC_EVERY_FRAME_ENV: &str = "XENOS_GPU_SYNC_EVERY_FRAME";
pub const FRAMES_IN_FLIGHT_ENV: &str = "XENOS_GPU_FRAMES_IN_FLIGHT";
pub const PIPELINE_CACHE_CAPACITY_ENV: &str = "XENOS_GPU_PIPELINE_CACHE_CAPACITY";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandProcessorConfig {
    /// Frames that may be submitted and not yet retired.
    pub frames_in_flight: usize,
    /// Shader-visible view descriptors available to one frame.
    pub view_descriptors_per_frame: u32,
    /// Shader-visible sampler descriptors available to one frame.
    pub sampler_descriptors_per_frame: u32,
    pub constant_page_size: u64,
    /// Page size for shared memory staging uploads.
    pub upload_page_size: u64,
    pub scratch_increment: u64,
    /// Bytes of guest physical memory mirrored on the GPU.
    pub shared_memory_size: u64,
    pub pipeline_cache: PipelineCacheConfig,
}

impl Default for CommandProcessorConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 3,
            view_descriptors_per_frame: 65536,
            sampler_descriptors_per_frame: 680,
            constant_page_size: 1 << 20,
            upload_page_size: 4 << 20,
            scratch_increment: DEFAULT_SCRATCH_INCREMENT,
            shared_memory_size: 512 << 20,
            pipeline_cache: PipelineCacheConfig::default(),
        }
    }
}

fn env_var_truthy(name: &str) -> bool {
    let Ok(raw) = std::env::var(name) else {
        return false;
    };
    let v = raw.trim();
    v == "1"
        || v.eq_ignore_ascii_case("true")
        || v.eq_ignore_ascii_case("yes")
        || v.eq_ignore_ascii_case("on")
}

fn env_var_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.trim().parse().ok()
}

impl CommandProcessorConfig {
    /// Defaults with `XENOS_GPU_*` environment overrides applied.
    pub fn from_env() -> Self {
        Self::default().with_overrides(
            env_var_truthy(SYNC_EVERY_FRAME_ENV),
            env_var_parse(FRAMES_IN_FLIGHT_ENV),
            env_var_parse(PIPELINE_CACHE_CAPACITY_ENV),
        )
    }

    fn with_overrides(
        mut self,
        sync_every_frame: bool,
        frames_in_flight: Option<usize>,
        pipeline_capacity: Option<usize>,
    ) -> Self {
        if let Some(frames) = frames_in_flight.filter(|&f| f > 0) {
            self.frames_in_flight = frames;
        }
        if sync_every_frame {
            self.frames_in_flight = 1;
        }
        if let Some(capacity) = pipeline_capacity.filter(|&c| c > 0) {
            self.pipeline_cache.capacity = capacity;
        }
        self
    }
}

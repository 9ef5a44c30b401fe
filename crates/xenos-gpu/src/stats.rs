use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters updated on the GPU thread and readable from any other thread.
#[derive(Debug, Default)]
pub struct GpuStats {
    frames_submitted: AtomicU64,
    fence_waits: AtomicU64,
    draws: AtomicU64,
    draws_skipped: AtomicU64,
    copies: AtomicU64,
    swaps: AtomicU64,
    cache_clears: AtomicU64,

    shader_translations: AtomicU64,
    pipeline_hits: AtomicU64,
    pipeline_misses: AtomicU64,
    pipeline_evictions: AtomicU64,
    root_signatures_created: AtomicU64,

    view_full_updates: AtomicU64,
    view_partial_updates: AtomicU64,
    sampler_full_updates: AtomicU64,
    sampler_partial_updates: AtomicU64,

    deferred_released: AtomicU64,
    shared_memory_bytes_uploaded: AtomicU64,
}

macro_rules! counters {
    ($($field:ident => $inc:ident),* $(,)?) => {
        impl GpuStats {
            $(
                pub fn $inc(&self) {
                    self.$field.fetch_add(1, Ordering::Relaxed);
                }
            )*

            pub fn snapshot(&self) -> GpuStatsSnapshot {
                GpuStatsSnapshot {
                    $($field: self.$field.load(Ordering::Relaxed),)*
                    deferred_released: self.deferred_released.load(Ordering::Relaxed),
                    shared_memory_bytes_uploaded: self
                        .shared_memory_bytes_uploaded
                        .load(Ordering::Relaxed),
                }
            }
        }

        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
        pub struct GpuStatsSnapshot {
            $(pub $field: u64,)*
            pub deferred_released: u64,
            pub shared_memory_bytes_uploaded: u64,
        }
    };
}

counters! {
    frames_submitted => inc_frames_submitted,
    fence_waits => inc_fence_waits,
    draws => inc_draws,
    draws_skipped => inc_draws_skipped,
    copies => inc_copies,
    swaps => inc_swaps,
    cache_clears => inc_cache_clears,
    shader_translations => inc_shader_translations,
    pipeline_hits => inc_pipeline_hits,
    pipeline_misses => inc_pipeline_misses,
    pipeline_evictions => inc_pipeline_evictions,
    root_signatures_created => inc_root_signatures_created,
    view_full_updates => inc_view_full_updates,
    view_partial_updates => inc_view_partial_updates,
    sampler_full_updates => inc_sampler_full_updates,
    sampler_partial_updates => inc_sampler_partial_updates,
}

impl GpuStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_deferred_released(&self, count: u64) {
        self.deferred_released.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_shared_memory_bytes_uploaded(&self, bytes: u64) {
        self.shared_memory_bytes_uploaded
            .fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn to_json(&self) -> String {
        self.snapshot().to_json()
    }
}

impl GpuStatsSnapshot {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_json_contains_counters() {
        let stats = GpuStats::new();
        stats.inc_draws();
        stats.inc_draws();
        stats.inc_view_partial_updates();
        stats.add_shared_memory_bytes_uploaded(4096);
        let json = stats.to_json();
        assert!(json.contains("\"draws\":2"));
        assert!(json.contains("\"view_partial_updates\":1"));
        assert!(json.contains("\"shared_memory_bytes_uploaded\":4096"));
    }
}

//! Runtime-tunable knobs (§6 "Configuration"). Every field has a built-in
//! default; [`Config::from_env`] overrides them from the process
//! environment, the way the command-dispatch collaborator's CLI layer
//! reads its own options.

use std::time::Duration;

/// Tunables for the hierarchy store, the auto-indexing engine, and the
/// compression sweeper. None of these change observable semantics (§8) —
/// only performance and memory/time tradeoffs.
#[derive(Debug, Clone)]
pub struct Config {
    /// Initial capacity of a node's parent/child vectors.
    pub hierarchy_initial_vector_len: usize,
    /// Initial capacity reserved for a `find` result array.
    pub hierarchy_expected_resp_len: usize,
    /// Deflate level used when detaching (compressing) a subtree.
    pub hierarchy_compression_level: u32,
    /// Cadence of the background compression sweep.
    pub hierarchy_auto_compress_period: Duration,
    /// Minimum node age before the sweep will compress a detached subtree.
    pub hierarchy_auto_compress_old_age_lim: Duration,
    /// Max simultaneously materialized ICB indices; 0 disables indexing.
    pub find_indices_max: usize,
    /// Minimum average find-result size before an ICB is considered for
    /// materialization.
    pub find_indexing_threshold: usize,
    /// Per-ICB popularity/size stats update cadence.
    pub find_indexing_icb_update_interval: Duration,
    /// Top-indices promote/evict decision cadence.
    pub find_indexing_interval: Duration,
    /// Time constant of the popularity low-pass filter.
    pub find_indexing_popularity_ave_period: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hierarchy_initial_vector_len: 2,
            hierarchy_expected_resp_len: 16,
            hierarchy_compression_level: 6,
            hierarchy_auto_compress_period: Duration::from_secs(3600),
            hierarchy_auto_compress_old_age_lim: Duration::from_secs(86_400),
            find_indices_max: 100,
            find_indexing_threshold: 100,
            find_indexing_icb_update_interval: Duration::from_secs(10),
            find_indexing_interval: Duration::from_secs(60),
            find_indexing_popularity_ave_period: Duration::from_secs(300),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        read_usize("HIERARCHY_INITIAL_VECTOR_LEN", &mut cfg.hierarchy_initial_vector_len);
        read_usize("HIERARCHY_EXPECTED_RESP_LEN", &mut cfg.hierarchy_expected_resp_len);
        read_u32("HIERARCHY_COMPRESSION_LEVEL", &mut cfg.hierarchy_compression_level);
        read_ms("HIERARCHY_AUTO_COMPRESS_PERIOD_MS", &mut cfg.hierarchy_auto_compress_period);
        read_ms("HIERARCHY_AUTO_COMPRESS_OLD_AGE_LIM", &mut cfg.hierarchy_auto_compress_old_age_lim);
        read_usize("FIND_INDICES_MAX", &mut cfg.find_indices_max);
        read_usize("FIND_INDEXING_THRESHOLD", &mut cfg.find_indexing_threshold);
        read_ms("FIND_INDEXING_ICB_UPDATE_INTERVAL", &mut cfg.find_indexing_icb_update_interval);
        read_ms("FIND_INDEXING_INTERVAL", &mut cfg.find_indexing_interval);
        read_ms("FIND_INDEXING_POPULARITY_AVE_PERIOD", &mut cfg.find_indexing_popularity_ave_period);
        cfg
    }

    /// Indexing is entirely disabled when the budget is zero.
    pub fn indexing_enabled(&self) -> bool {
        self.find_indices_max > 0
    }
}

fn read_usize(var: &str, slot: &mut usize) {
    if let Some(v) = std::env::var(var).ok().and_then(|s| s.parse().ok()) {
        *slot = v;
    }
}

fn read_u32(var: &str, slot: &mut u32) {
    if let Some(v) = std::env::var(var).ok().and_then(|s| s.parse().ok()) {
        *slot = v;
    }
}

fn read_ms(var: &str, slot: &mut Duration) {
    if let Some(v) = std::env::var(var).ok().and_then(|s| s.parse().ok()) {
        *slot = Duration::from_millis(v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_keep_indexing_enabled() {
        assert!(Config::default().indexing_enabled());
    }

    #[test]
    fn zero_budget_disables_indexing() {
        let cfg = Config { find_indices_max: 0, ..Config::default() };
        assert!(!cfg.indexing_enabled());
    }
}

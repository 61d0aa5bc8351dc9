//! Run sampling: one decision per run, inherited by every event in it.

use sha2::{Digest, Sha256};

use crate::config::TraceConfig;

/// Decides whether a run is traced. Implementations must be deterministic
/// for a given `run_id` so the decision is stable across processes.
pub trait Sampler: Send + Sync {
    fn should_sample(&self, run_id: &str, run_name: &str, config: &TraceConfig) -> bool;
}

/// Default sampler: `hash(run_id) / 2^64 < sample_rate`, with the hash taken
/// from the first eight bytes of SHA-256(run_id).
#[derive(Debug, Default, Clone, Copy)]
pub struct HashSampler;

impl HashSampler {
    fn bucket(run_id: &str) -> u64 {
        let digest = Sha256::digest(run_id.as_bytes());
        u64::from_be_bytes(digest[..8].try_into().expect("digest >= 8 bytes"))
    }
}

impl Sampler for HashSampler {
    fn should_sample(&self, run_id: &str, _run_name: &str, config: &TraceConfig) -> bool {
        // only_on_error collects everything and decides at run end.
        if config.only_on_error {
            return true;
        }
        if config.sample_rate >= 1.0 {
            return true;
        }
        if config.sample_rate <= 0.0 {
            return false;
        }
        (Self::bucket(run_id) as f64) / (u64::MAX as f64 + 1.0) < config.sample_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_and_full_rates_are_absolute() {
        let sampler = HashSampler;
        let mut config = TraceConfig::default();

        config.sample_rate = 0.0;
        for i in 0..100 {
            assert!(!sampler.should_sample(&format!("run-{i}"), "n", &config));
        }

        config.sample_rate = 1.0;
        for i in 0..100 {
            assert!(sampler.should_sample(&format!("run-{i}"), "n", &config));
        }
    }

    #[test]
    fn decision_is_deterministic() {
        let sampler = HashSampler;
        let mut config = TraceConfig::default();
        config.sample_rate = 0.5;
        for i in 0..50 {
            let id = format!("stable-{i}");
            let first = sampler.should_sample(&id, "n", &config);
            for _ in 0..5 {
                assert_eq!(first, sampler.should_sample(&id, "n", &config));
            }
        }
    }

    #[test]
    fn rate_roughly_controls_volume() {
        let sampler = HashSampler;
        let mut config = TraceConfig::default();
        config.sample_rate = 0.5;
        let sampled = (0..1000)
            .filter(|i| sampler.should_sample(&format!("vol-{i}"), "n", &config))
            .count();
        // SHA-256 buckets are uniform; allow a generous band.
        assert!((350..=650).contains(&sampled), "got {sampled}");
    }

    #[test]
    fn only_on_error_always_collects() {
        let sampler = HashSampler;
        let mut config = TraceConfig::default();
        config.sample_rate = 0.0;
        config.only_on_error = true;
        assert!(sampler.should_sample("any", "n", &config));
    }
}

use crate::common::error::{Result, RidgelineError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub sensor: SensorConfig,
    #[serde(default)]
    pub matcher: MatcherConfig,
    #[serde(default)]
    pub enroll: EnrollConfig,
    #[serde(default)]
    pub authority: AuthorityConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SensorConfig {
    /// Poll cadence of the scan loops. Cancellation latency is bounded by
    /// one capture round-trip plus one poll interval.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_capture_timeout")]
    pub capture_timeout_ms: u64,
}

fn default_poll_interval() -> u64 {
    50
}
fn default_capture_timeout() -> u64 {
    500
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            capture_timeout_ms: default_capture_timeout(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum MatchStrategy {
    /// Global descriptor index, vote tally, geometric check on the top
    /// candidate only. Cost is roughly flat in the number of subjects.
    Indexed,
    /// Walk every subject and template and fit each one. O(subjects x
    /// templates), kept as the reference strategy.
    LinearScan,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MatcherConfig {
    #[serde(default = "default_strategy")]
    pub strategy: MatchStrategy,
    /// Lowe ratio: a nearest neighbor counts only when it is this much
    /// closer than the second nearest. Looser values admit more partial
    /// overlap at the price of ambiguous correspondences.
    #[serde(default = "default_ratio_test")]
    pub ratio_test: f32,
    /// Minimum ratio-test votes before a candidate is worth a geometric fit.
    #[serde(default = "default_min_votes")]
    pub min_votes: usize,
    /// Inliers required to accept a match. Calibrated for the 4-DOF
    /// similarity fit; raising it trades false accepts for false rejects.
    #[serde(default = "default_min_inliers")]
    pub min_inliers: usize,
    #[serde(default = "default_ransac_iterations")]
    pub ransac_iterations: usize,
    /// Reprojection threshold in pixels.
    #[serde(default = "default_ransac_threshold")]
    pub ransac_threshold: f32,
    /// Search budget of the descriptor index; higher is closer to exact.
    #[serde(default = "default_index_checks")]
    pub index_checks: usize,
}

fn default_strategy() -> MatchStrategy {
    MatchStrategy::Indexed
}
fn default_ratio_test() -> f32 {
    0.75
}
fn default_min_votes() -> usize {
    4
}
fn default_min_inliers() -> usize {
    15
}
fn default_ransac_iterations() -> usize {
    200
}
fn default_ransac_threshold() -> f32 {
    5.0
}
fn default_index_checks() -> usize {
    64
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            ratio_test: default_ratio_test(),
            min_votes: default_min_votes(),
            min_inliers: default_min_inliers(),
            ransac_iterations: default_ransac_iterations(),
            ransac_threshold: default_ransac_threshold(),
            index_checks: default_index_checks(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EnrollConfig {
    /// Accepted touches required to finish an enrollment.
    #[serde(default = "default_stages")]
    pub stages: usize,
    /// Keypoints a frame must exceed to survive the quality gate.
    #[serde(default = "default_min_keypoints")]
    pub min_keypoints: usize,
    /// Settle time after an accepted touch before watching for release.
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,
    /// Consecutive clear polls required before the next touch counts.
    #[serde(default = "default_clear_polls")]
    pub clear_polls: u32,
}

fn default_stages() -> usize {
    5
}
fn default_min_keypoints() -> usize {
    5
}
fn default_settle_delay() -> u64 {
    300
}
fn default_clear_polls() -> u32 {
    2
}

impl Default for EnrollConfig {
    fn default() -> Self {
        Self {
            stages: default_stages(),
            min_keypoints: default_min_keypoints(),
            settle_delay_ms: default_settle_delay(),
            clear_polls: default_clear_polls(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AuthorityConfig {
    /// Interactive credential entry can take minutes; a timeout is a denial.
    #[serde(default = "default_auth_timeout")]
    pub timeout_secs: u64,
}

fn default_auth_timeout() -> u64 {
    300
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_auth_timeout(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_data_dir() -> PathBuf {
    crate::common::paths::system_data_dir()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl Config {
    pub fn load_from_path(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Err(RidgelineError::Other(anyhow::anyhow!(
                "Config file not found: {}",
                path.display()
            )));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)
            .map_err(|e| RidgelineError::Other(anyhow::anyhow!("Config parse error: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.matcher.ratio_test <= 0.0 || self.matcher.ratio_test >= 1.0 {
            return Err(RidgelineError::Other(anyhow::anyhow!(
                "matcher.ratio_test must be in (0, 1), got {}",
                self.matcher.ratio_test
            )));
        }
        if self.matcher.min_votes < 4 {
            return Err(RidgelineError::Other(anyhow::anyhow!(
                "matcher.min_votes must be at least 4 (a geometric fit needs 4 correspondences), got {}",
                self.matcher.min_votes
            )));
        }
        if self.matcher.ransac_iterations == 0 {
            return Err(RidgelineError::Other(anyhow::anyhow!(
                "matcher.ransac_iterations must be positive"
            )));
        }
        if self.matcher.ransac_threshold <= 0.0 {
            return Err(RidgelineError::Other(anyhow::anyhow!(
                "matcher.ransac_threshold must be positive, got {}",
                self.matcher.ransac_threshold
            )));
        }
        if self.enroll.stages == 0 || self.enroll.stages > 32 {
            return Err(RidgelineError::Other(anyhow::anyhow!(
                "enroll.stages must be between 1 and 32, got {}",
                self.enroll.stages
            )));
        }
        if self.sensor.poll_interval_ms == 0 {
            return Err(RidgelineError::Other(anyhow::anyhow!(
                "sensor.poll_interval_ms must be positive"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn rejects_out_of_range_ratio() {
        let mut config = Config::default();
        config.matcher.ratio_test = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [matcher]
            strategy = "linear-scan"
            min_inliers = 20
            "#,
        )
        .unwrap();
        assert_eq!(config.matcher.strategy, MatchStrategy::LinearScan);
        assert_eq!(config.matcher.min_inliers, 20);
        assert_eq!(config.enroll.stages, 5);
    }
}

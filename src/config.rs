//! Configuration loaded from `leadflow.toml`.
//!
//! [`LeadflowConfig`] groups every tunable used by the scoring engine, the
//! qualification service, the enrollment state machine, the dispatcher and the
//! scheduler. Values missing from the file fall back to the defaults below.
//! `LEADFLOW_API_KEY` takes precedence over the file for the transport key.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::LeadflowError;
use crate::lead::Tier;

pub const DEFAULT_CONFIG_PATH: &str = "leadflow.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LeadflowConfig {
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub qualification: QualificationConfig,
    #[serde(default)]
    pub automation: AutomationConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

/// Score cut-offs, highest first. A score at or above a cut-off lands in
/// that bucket.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct TierThresholds {
    pub hot: f64,
    pub warm: f64,
    pub cold: f64,
}

impl TierThresholds {
    pub fn classify(&self, score: f64) -> Tier {
        if score >= self.hot {
            Tier::Hot
        } else if score >= self.warm {
            Tier::Warm
        } else if score >= self.cold {
            Tier::Cold
        } else {
            Tier::Trash
        }
    }

    fn validate(&self, section: &str) -> Result<(), LeadflowError> {
        if !(self.hot >= self.warm && self.warm >= self.cold) {
            return Err(LeadflowError::Config(format!(
                "{section} thresholds must be ordered hot >= warm >= cold"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct ScoringWeights {
    pub algorithmic: f64,
    pub contextual: f64,
    pub predictive: f64,
}

/// One row of the confidence table: disagreement up to `max_diff` yields
/// `confidence`.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct ConfidenceStep {
    pub max_diff: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScoringConfig {
    #[serde(default = "default_scoring_weights")]
    pub weights: ScoringWeights,

    #[serde(default = "default_scoring_thresholds")]
    pub thresholds: TierThresholds,

    /// Evaluated in order; the first row whose `max_diff` covers the
    /// disagreement wins.
    #[serde(default = "default_confidence_steps")]
    pub confidence_steps: Vec<ConfidenceStep>,

    #[serde(default = "default_confidence_floor")]
    pub confidence_floor: f64,

    #[serde(default = "default_score_ceiling")]
    pub score_ceiling: f64,
}

fn default_scoring_weights() -> ScoringWeights {
    ScoringWeights {
        algorithmic: 0.5,
        contextual: 0.3,
        predictive: 0.2,
    }
}

fn default_scoring_thresholds() -> TierThresholds {
    TierThresholds {
        hot: 8.0,
        warm: 6.5,
        cold: 4.0,
    }
}

fn default_confidence_steps() -> Vec<ConfidenceStep> {
    vec![
        ConfidenceStep {
            max_diff: 1.0,
            confidence: 0.95,
        },
        ConfidenceStep {
            max_diff: 2.0,
            confidence: 0.80,
        },
        ConfidenceStep {
            max_diff: 3.0,
            confidence: 0.65,
        },
    ]
}

fn default_confidence_floor() -> f64 {
    0.50
}

fn default_score_ceiling() -> f64 {
    10.0
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            weights: default_scoring_weights(),
            thresholds: default_scoring_thresholds(),
            confidence_steps: default_confidence_steps(),
            confidence_floor: default_confidence_floor(),
            score_ceiling: default_score_ceiling(),
        }
    }
}

impl ScoringConfig {
    /// Maps the disagreement between two sub-scores to a confidence value.
    pub fn confidence_for(&self, diff: f64) -> f64 {
        self.confidence_steps
            .iter()
            .find(|step| diff <= step.max_diff)
            .map(|step| step.confidence)
            .unwrap_or(self.confidence_floor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct QualificationWeights {
    pub bant: f64,
    pub behavioral: f64,
    pub demographic: f64,
    pub engagement: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct BantWeights {
    pub budget: f64,
    pub authority: f64,
    pub need: f64,
    pub timeline: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QualificationConfig {
    #[serde(default = "default_qualification_weights")]
    pub weights: QualificationWeights,

    #[serde(default = "default_bant_weights")]
    pub bant_weights: BantWeights,

    #[serde(default = "default_qualification_thresholds")]
    pub thresholds: TierThresholds,

    /// Upper bound for a single bulk qualification run.
    #[serde(default = "default_bulk_limit_max")]
    pub bulk_limit_max: usize,

    /// Pause between leads in a bulk run, in milliseconds.
    #[serde(default = "default_bulk_pause_ms")]
    pub bulk_pause_ms: u64,
}

fn default_qualification_weights() -> QualificationWeights {
    QualificationWeights {
        bant: 0.40,
        behavioral: 0.25,
        demographic: 0.20,
        engagement: 0.15,
    }
}

fn default_bant_weights() -> BantWeights {
    BantWeights {
        budget: 0.30,
        authority: 0.25,
        need: 0.25,
        timeline: 0.20,
    }
}

fn default_qualification_thresholds() -> TierThresholds {
    TierThresholds {
        hot: 8.0,
        warm: 6.0,
        cold: 4.0,
    }
}

fn default_bulk_limit_max() -> usize {
    50
}

fn default_bulk_pause_ms() -> u64 {
    100
}

impl Default for QualificationConfig {
    fn default() -> Self {
        Self {
            weights: default_qualification_weights(),
            bant_weights: default_bant_weights(),
            thresholds: default_qualification_thresholds(),
            bulk_limit_max: default_bulk_limit_max(),
            bulk_pause_ms: default_bulk_pause_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AutomationConfig {
    /// Maximum enrollments examined per `process_due` pass.
    #[serde(default = "default_automation_batch_limit")]
    pub batch_limit: usize,
}

fn default_automation_batch_limit() -> usize {
    100
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            batch_limit: default_automation_batch_limit(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatcherConfig {
    /// Send endpoint of the outbound transport.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_from_address")]
    pub from_address: String,

    /// Maximum work items pulled per `send_due` pass.
    #[serde(default = "default_dispatch_batch_limit")]
    pub batch_limit: usize,

    /// Transport calls per work item before it is abandoned.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base delay for exponential backoff, in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Minimum gap between two sends of the same batch, in milliseconds.
    #[serde(default = "default_min_send_interval_ms")]
    pub min_send_interval_ms: u64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_endpoint() -> String {
    "http://localhost:8025/v1/messages".to_string()
}

fn default_from_address() -> String {
    "outreach@localhost".to_string()
}

fn default_dispatch_batch_limit() -> usize {
    50
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_min_send_interval_ms() -> u64 {
    100
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            api_key: String::new(),
            from_address: default_from_address(),
            batch_limit: default_dispatch_batch_limit(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            min_send_interval_ms: default_min_send_interval_ms(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl DispatcherConfig {
    /// Backoff before retry number `attempt`: `base_delay_ms * 2^(attempt - 1)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }

    pub fn min_send_interval(&self) -> Duration {
        Duration::from_millis(self.min_send_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between two scheduler ticks.
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
}

fn default_tick_secs() -> u64 {
    120
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
        }
    }
}

impl LeadflowConfig {
    /// Loads `leadflow.toml` from the current directory, or defaults when the
    /// file does not exist.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(DEFAULT_CONFIG_PATH))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            toml::from_str::<LeadflowConfig>(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?
        } else {
            Self::default()
        };

        config.override_api_key(std::env::var("LEADFLOW_API_KEY").ok());
        config.validate()?;
        Ok(config)
    }

    /// The environment wins over the file for the transport key. An empty
    /// value is ignored.
    fn override_api_key(&mut self, key: Option<String>) {
        if let Some(key) = key
            && !key.is_empty()
        {
            self.dispatcher.api_key = key;
        }
    }

    pub fn validate(&self) -> Result<(), LeadflowError> {
        self.scoring.thresholds.validate("scoring")?;
        self.qualification.thresholds.validate("qualification")?;

        let w = &self.scoring.weights;
        if [w.algorithmic, w.contextual, w.predictive]
            .iter()
            .any(|v| *v < 0.0)
        {
            return Err(LeadflowError::Config(
                "scoring weights must not be negative".into(),
            ));
        }
        let ceiling = self.scoring.score_ceiling;
        if !ceiling.is_finite() || ceiling < 1.0 {
            return Err(LeadflowError::Config(format!(
                "scoring.score_ceiling must be a finite value of at least 1.0, got {ceiling}"
            )));
        }
        if self.dispatcher.max_attempts == 0 {
            return Err(LeadflowError::Config(
                "dispatcher.max_attempts must be at least 1".into(),
            ));
        }
        if self.scheduler.tick_secs == 0 {
            return Err(LeadflowError::Config(
                "scheduler.tick_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

//! Lead scoring strategies.
//!
//! Two independent scorers share the [`Scorer`] capability: the hybrid
//! [`ScoringEngine`] (rule-based + contextual + predictive) and the BANT-driven
//! [`QualificationService`](crate::qualification::QualificationService).
//! Callers pick one without depending on the other's internals.

mod engine;
mod features;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::lead::{Lead, Tier};

pub use engine::{
    ConstantPredictor, EstimatedValue, NextAction, Predictor, ScoreBreakdown, ScoreResult,
    ScoringEngine, ValueConfidence, ValueRange, apply_to_lead,
};
pub use features::{
    EmailSignal, FeatureExtractor, GeoTier, LeadFeatures, PhoneSignal, SocialPresence,
};

/// Aggregated message interaction history of a lead.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngagementHistory {
    pub sent: u32,
    pub opened: u32,
    pub clicked: u32,
    pub replied: u32,
}

/// Everything a scorer may look at.
#[derive(Debug, Clone, Copy)]
pub struct ScoringInput<'a> {
    pub lead: &'a Lead,
    pub history: EngagementHistory,
    pub now: DateTime<Utc>,
}

/// Strategy-neutral scoring outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct Assessment {
    pub strategy: &'static str,
    pub score: f64,
    /// `None` when the strategy could not classify the lead.
    pub tier: Option<Tier>,
}

/// Common capability of every scoring strategy.
pub trait Scorer {
    fn strategy(&self) -> &'static str;

    fn assess(&self, input: &ScoringInput<'_>) -> Assessment;
}

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{debug, warn};
use uuid::Uuid;

use super::features::{EmailSignal, FeatureExtractor, GeoTier, LeadFeatures, PhoneSignal};
use super::{Assessment, Scorer, ScoringInput};
use crate::clock::{Clock, SystemClock};
use crate::config::ScoringConfig;
use crate::error::ScoringError;
use crate::lead::{Lead, Tier};

const NEUTRAL_SCORE: f64 = 5.0;

/// Descriptions shorter than this are not analyzed by the contextual scorer.
const MIN_ANALYZABLE_LEN: usize = 20;

const BUSINESS_KEYWORDS: &[&str] = &[
    "serious",
    "professional",
    "booking",
    "available",
    "rates",
    "outcall",
    "incall",
];

const POSITIVE_INDICATORS: &[&str] = &[
    "professional",
    "serious",
    "discreet",
    "upscale",
    "verified",
    "elite",
];

const NEGATIVE_INDICATORS: &[&str] = &["cheap", "quick", "fast", "low", "discount"];

const SCORING_METHOD: &str = "hybrid_algorithmic_contextual";

/// Suggested follow-up for a scored lead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NextAction {
    ContactImmediately,
    EmailSequence,
    NurtureCampaign,
    Discard,
    ManualReview,
}

impl NextAction {
    fn for_tier(tier: Option<Tier>) -> Self {
        match tier {
            Some(Tier::Hot) => NextAction::ContactImmediately,
            Some(Tier::Warm) => NextAction::EmailSequence,
            Some(Tier::Cold) => NextAction::NurtureCampaign,
            Some(Tier::Trash) => NextAction::Discard,
            None => NextAction::ManualReview,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub algorithmic: f64,
    pub contextual: f64,
    pub predictive: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueConfidence {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EstimatedValue {
    pub estimated_value_usd: f64,
    pub confidence: ValueConfidence,
    pub value_range: ValueRange,
}

/// Outcome of one scoring call. Created fresh every time, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreResult {
    pub lead_id: Uuid,
    pub final_score: f64,
    /// `None` when scoring degraded to the default result. Serialized as
    /// the tier label, or "UNKNOWN".
    #[serde(with = "classification_label")]
    pub classification: Option<Tier>,
    pub confidence: f64,
    pub breakdown: ScoreBreakdown,
    pub estimated_value: EstimatedValue,
    pub next_action: NextAction,
    pub scoring_method: String,
    pub scored_at: DateTime<Utc>,
}

impl ScoreResult {
    pub fn classification_label(&self) -> String {
        self.classification
            .map(|t| t.to_string())
            .unwrap_or_else(|| UNKNOWN_LABEL.to_string())
    }

    /// Degraded result returned when any sub-score fails.
    pub fn fallback(lead_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            lead_id,
            final_score: NEUTRAL_SCORE,
            classification: None,
            confidence: 0.5,
            breakdown: ScoreBreakdown {
                algorithmic: NEUTRAL_SCORE,
                contextual: NEUTRAL_SCORE,
                predictive: NEUTRAL_SCORE,
            },
            estimated_value: EstimatedValue {
                estimated_value_usd: 100.0,
                confidence: ValueConfidence::Low,
                value_range: ValueRange {
                    min: 60.0,
                    max: 200.0,
                },
            },
            next_action: NextAction::ManualReview,
            scoring_method: "fallback".to_string(),
            scored_at: now,
        }
    }
}

const UNKNOWN_LABEL: &str = "UNKNOWN";

mod classification_label {
    use serde::de::IntoDeserializer;

    use super::*;

    pub fn serialize<S: Serializer>(tier: &Option<Tier>, s: S) -> Result<S::Ok, S::Error> {
        match tier {
            Some(t) => t.serialize(s),
            None => s.serialize_str(UNKNOWN_LABEL),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Tier>, D::Error> {
        match Option::<String>::deserialize(d)? {
            None => Ok(None),
            Some(label) if label == UNKNOWN_LABEL => Ok(None),
            Some(label) => Tier::deserialize(label.into_deserializer())
                .map(Some)
                .map_err(|e: serde::de::value::Error| serde::de::Error::custom(e)),
        }
    }
}

/// Predictive sub-score source. Swappable without touching callers.
pub trait Predictor: Send + Sync {
    fn predict(&self, features: &LeadFeatures) -> Result<f64, ScoringError>;
}

/// Stand-in predictor returning the same value for every lead.
pub struct ConstantPredictor(pub f64);

impl Default for ConstantPredictor {
    fn default() -> Self {
        Self(NEUTRAL_SCORE)
    }
}

impl Predictor for ConstantPredictor {
    fn predict(&self, _features: &LeadFeatures) -> Result<f64, ScoringError> {
        Ok(self.0)
    }
}

/// Hybrid scorer combining rule-based, contextual and predictive sub-scores.
pub struct ScoringEngine {
    config: ScoringConfig,
    predictor: Box<dyn Predictor>,
    clock: Arc<dyn Clock>,
}

impl ScoringEngine {
    pub fn new(config: ScoringConfig) -> Self {
        Self::with_predictor(config, Box::new(ConstantPredictor::default()))
    }

    pub fn with_predictor(config: ScoringConfig, predictor: Box<dyn Predictor>) -> Self {
        Self {
            config,
            predictor,
            clock: Arc::new(SystemClock),
        }
    }

    /// Stamp results from `clock` instead of the system time.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    /// Scores a lead. Never fails: sub-score errors are logged and the
    /// default result is returned so that ingestion is never blocked.
    pub fn score(&self, lead: &Lead) -> ScoreResult {
        self.score_at(lead, self.clock.now())
    }

    /// Like [`score`](Self::score) with an explicit timestamp.
    pub fn score_at(&self, lead: &Lead, now: DateTime<Utc>) -> ScoreResult {
        match self.try_score(lead, now) {
            Ok(result) => {
                debug!(
                    lead_id = %lead.id,
                    score = result.final_score,
                    tier = %result.classification_label(),
                    "lead scored"
                );
                result
            }
            Err(e) => {
                warn!(lead_id = %lead.id, error = %e, "scoring failed, using default result");
                ScoreResult::fallback(lead.id, now)
            }
        }
    }

    fn try_score(&self, lead: &Lead, now: DateTime<Utc>) -> Result<ScoreResult, ScoringError> {
        let features = FeatureExtractor::extract(lead);

        let algorithmic = finite("algorithmic", self.algorithmic(&features))?;
        let contextual = finite("contextual", self.contextual(&features))?;
        let predictive = finite("predictive", self.predictor.predict(&features)?)?;

        let w = &self.config.weights;
        let weighted =
            algorithmic * w.algorithmic + contextual * w.contextual + predictive * w.predictive;
        let final_score = round2(weighted.clamp(0.0, self.config.score_ceiling));
        let classification = Some(self.classify(final_score));

        Ok(ScoreResult {
            lead_id: lead.id,
            final_score,
            classification,
            confidence: self.config.confidence_for((algorithmic - contextual).abs()),
            breakdown: ScoreBreakdown {
                algorithmic: round2(algorithmic),
                contextual: round2(contextual),
                predictive: round2(predictive),
            },
            estimated_value: estimate_value(final_score, &features),
            next_action: NextAction::for_tier(classification),
            scoring_method: SCORING_METHOD.to_string(),
            scored_at: now,
        })
    }

    pub fn classify(&self, score: f64) -> Tier {
        self.config.thresholds.classify(score)
    }

    /// Additive rule scoring: contact validity, social presence, content
    /// quality and geography. Clamped to the score ceiling.
    pub fn algorithmic(&self, f: &LeadFeatures) -> f64 {
        let mut score = 0.0;

        score += match f.email {
            EmailSignal::Valid => 2.0,
            EmailSignal::Invalid => 1.0,
            EmailSignal::Absent => 0.0,
        };
        score += match f.phone {
            PhoneSignal::Valid => 2.0,
            PhoneSignal::Present => 1.0,
            PhoneSignal::Absent => 0.0,
        };

        let mut social = 0.0;
        if f.social.instagram {
            social += 1.0;
        }
        if f.social.onlyfans {
            social += 1.5;
        }
        if f.social.twitter {
            social += 0.5;
        }
        if f.social.linkedin {
            social += 0.5;
        }
        score += f64::min(social, 2.5);

        if f.description_len > 0 {
            let mut content = match f.description_len {
                n if n > 200 => 1.0,
                n if n > 100 => 0.6,
                n if n > 50 => 0.3,
                _ => 0.0,
            };
            let keywords = count_matches(&f.description, BUSINESS_KEYWORDS);
            content += f64::min(keywords as f64 * 0.3, 1.5);
            score += f64::min(content, 2.5);
        }

        score += match f.geo {
            GeoTier::Major => 1.0,
            GeoTier::Regional => 0.5,
            GeoTier::Unknown => 0.0,
        };

        f64::min(score, self.config.score_ceiling)
    }

    /// Lightweight text analysis centred on a neutral 5.0.
    pub fn contextual(&self, f: &LeadFeatures) -> f64 {
        if f.description_len < MIN_ANALYZABLE_LEN {
            return NEUTRAL_SCORE;
        }

        let positive = count_matches(&f.description, POSITIVE_INDICATORS);
        let negative = count_matches(&f.description, NEGATIVE_INDICATORS);

        let mut score = NEUTRAL_SCORE + positive as f64 * 0.8 - negative as f64 * 0.5;

        // Several complete sentences.
        if f.description.split('.').count() > 3 {
            score += 0.5;
        }
        if f.description.matches('!').count() <= 2 {
            score += 0.3;
        }

        score.clamp(1.0, self.config.score_ceiling)
    }
}

impl Scorer for ScoringEngine {
    fn strategy(&self) -> &'static str {
        "hybrid"
    }

    fn assess(&self, input: &ScoringInput<'_>) -> Assessment {
        let result = self.score_at(input.lead, input.now);
        Assessment {
            strategy: self.strategy(),
            score: result.final_score,
            tier: result.classification,
        }
    }
}

/// Writes the score and grade of a result back onto its lead.
pub fn apply_to_lead(result: &ScoreResult, lead: &mut Lead) {
    lead.score = Some(result.final_score);
    if let Some(tier) = result.classification {
        lead.grade = Some(tier);
    }
}

fn estimate_value(score: f64, f: &LeadFeatures) -> EstimatedValue {
    let mut value = 100.0 * (score / 5.0);
    if f.social.monetized() {
        value *= 1.8;
    }
    if f.premium_location {
        value *= 1.4;
    }

    let confidence = if score >= 7.0 {
        ValueConfidence::High
    } else if score >= 5.0 {
        ValueConfidence::Medium
    } else {
        ValueConfidence::Low
    };

    EstimatedValue {
        estimated_value_usd: round2(value),
        confidence,
        value_range: ValueRange {
            min: round2(value * 0.6),
            max: round2(value * 2.0),
        },
    }
}

fn count_matches(text: &str, words: &[&str]) -> usize {
    words.iter().filter(|w| text.contains(**w)).count()
}

fn finite(component: &'static str, value: f64) -> Result<f64, ScoringError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(ScoringError::NonFinite { component })
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

//! Lead records as seen by the scoring and automation core.
//!
//! Every descriptive field is optional. Blank strings are treated the same as
//! missing values; [`Lead::field`] is the single place that rule lives, and the
//! feature extractor resolves everything else to documented defaults.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Discrete classification bucket. Ordered from lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Tier {
    Trash,
    Cold,
    Warm,
    Hot,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Hot => write!(f, "HOT"),
            Tier::Warm => write!(f, "WARM"),
            Tier::Cold => write!(f, "COLD"),
            Tier::Trash => write!(f, "TRASH"),
        }
    }
}

/// Lifecycle status of a lead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadStatus {
    #[default]
    New,
    Qualified,
    Enrolled,
    Contacted,
    Won,
    Lost,
    Invalid,
}

/// Social profile links. Each platform is weighted separately by the scorer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocialProfiles {
    pub instagram_url: Option<String>,
    pub onlyfans_url: Option<String>,
    pub twitter_url: Option<String>,
    pub linkedin_url: Option<String>,
}

/// A prospect record.
///
/// The core only writes `score`, `grade`, `status` and `last_contact_at`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Lead {
    pub id: Uuid,
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub company: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub industry: Option<String>,
    pub source: Option<String>,
    pub notes: Option<String>,
    pub budget_range: Option<String>,
    #[serde(flatten)]
    pub social: SocialProfiles,
    pub score: Option<f64>,
    pub grade: Option<Tier>,
    pub status: LeadStatus,
    pub created_at: DateTime<Utc>,
    pub last_contact_at: Option<DateTime<Utc>>,
}

impl Lead {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: Some(name.into()),
            created_at: Utc::now(),
            ..Default::default()
        }
    }

    /// Returns the trimmed value of an optional field, or `None` when it is
    /// missing or blank.
    pub fn field(value: &Option<String>) -> Option<&str> {
        value.as_deref().map(str::trim).filter(|v| !v.is_empty())
    }

    pub fn first_name(&self) -> &str {
        Lead::field(&self.name)
            .and_then(|n| n.split_whitespace().next())
            .unwrap_or("")
    }

    pub fn last_name(&self) -> String {
        Lead::field(&self.name)
            .map(|n| n.split_whitespace().skip(1).collect::<Vec<_>>().join(" "))
            .unwrap_or_default()
    }
}

/// Selection of leads for bulk enrollment. Empty sets and a missing
/// `min_score` accept everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeadFilter {
    pub grades: Vec<Tier>,
    pub sources: Vec<String>,
    pub min_score: Option<f64>,
}

impl LeadFilter {
    pub fn matches(&self, lead: &Lead) -> bool {
        if !self.grades.is_empty() && !lead.grade.is_some_and(|g| self.grades.contains(&g)) {
            return false;
        }
        if !self.sources.is_empty() {
            let source = Lead::field(&lead.source);
            if !source.is_some_and(|s| self.sources.iter().any(|w| w.eq_ignore_ascii_case(s))) {
                return false;
            }
        }
        match self.min_score {
            Some(min) => lead.score.is_some_and(|s| s >= min),
            None => true,
        }
    }
}

//! BANT-driven lead qualification.
//!
//! [`BantScorer`] holds the pure scoring rules; [`QualificationService`]
//! resolves leads and engagement history from the store, writes the outcome
//! back, and runs bounded bulk passes.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::QualificationConfig;
use crate::error::{LeadflowError, Result};
use crate::lead::{Lead, LeadStatus, Tier};
use crate::scoring::{Assessment, EngagementHistory, Scorer, ScoringInput};
use crate::store::Store;

const AUTHORITY_MARKERS: &[&str] = &["ceo", "founder", "director", "vp", "head", "manager", "owner"];
const HIGH_NEED_INDUSTRIES: &[&str] =
    &["saas", "ecommerce", "agency", "consulting", "fintech", "marketing"];
const FREE_EMAIL_DOMAINS: &[&str] = &["gmail.com", "yahoo.com", "hotmail.com", "outlook.com"];
const CORPORATE_DOMAIN_MARKERS: &[&str] = &[".co", ".inc", ".llc", ".corp"];
const SOURCE_BONUS: &[(&str, f64)] = &[
    ("referral", 2.0),
    ("linkedin", 1.5),
    ("webinar", 1.5),
    ("website", 1.0),
    ("manual", 0.5),
];

const SCORE_CEILING: f64 = 10.0;
const NEUTRAL: f64 = 5.0;
const NEVER_CONTACTED: f64 = 6.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QualificationTier {
    Unqualified,
    Cold,
    Warm,
    Hot,
}

impl QualificationTier {
    /// Grade written onto the lead. Unqualified leads are graded TRASH.
    pub fn grade(self) -> Tier {
        match self {
            QualificationTier::Hot => Tier::Hot,
            QualificationTier::Warm => Tier::Warm,
            QualificationTier::Cold => Tier::Cold,
            QualificationTier::Unqualified => Tier::Trash,
        }
    }

    fn from_grade(tier: Tier) -> Self {
        match tier {
            Tier::Hot => QualificationTier::Hot,
            Tier::Warm => QualificationTier::Warm,
            Tier::Cold => QualificationTier::Cold,
            Tier::Trash => QualificationTier::Unqualified,
        }
    }
}

impl fmt::Display for QualificationTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QualificationTier::Hot => write!(f, "HOT"),
            QualificationTier::Warm => write!(f, "WARM"),
            QualificationTier::Cold => write!(f, "COLD"),
            QualificationTier::Unqualified => write!(f, "UNQUALIFIED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SubScores {
    pub bant: f64,
    pub behavioral: f64,
    pub demographic: f64,
    pub engagement: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
    Call,
    Email,
    EmailSequence,
    LinkedinConnect,
    NurtureCampaign,
    EnrichData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    High,
    Medium,
    Low,
}

/// A suggested follow-up for a sales rep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionItem {
    pub kind: ActionKind,
    pub priority: Priority,
    pub due_by: DateTime<Utc>,
    pub description: String,
}

impl ActionItem {
    fn new(kind: ActionKind, priority: Priority, due_by: DateTime<Utc>, description: &str) -> Self {
        Self {
            kind,
            priority,
            due_by,
            description: description.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualificationResult {
    pub lead_id: Uuid,
    pub final_score: f64,
    pub sub_scores: SubScores,
    pub tier: QualificationTier,
    pub recommendations: Vec<String>,
    pub next_actions: Vec<ActionItem>,
    pub qualified_at: DateTime<Utc>,
}

/// Outcome of one lead in a bulk pass.
#[derive(Debug)]
pub struct BulkItem {
    pub lead_id: Uuid,
    pub outcome: Result<QualificationResult>,
}

/// Pure BANT, behavioral, demographic and engagement scoring.
pub struct BantScorer {
    config: QualificationConfig,
}

impl BantScorer {
    pub fn new(config: QualificationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &QualificationConfig {
        &self.config
    }

    pub fn sub_scores(&self, input: &ScoringInput<'_>) -> SubScores {
        SubScores {
            bant: self.bant(input.lead),
            behavioral: behavioral(&input.history),
            demographic: demographic(input.lead),
            engagement: engagement(input.lead, input.now),
        }
    }

    /// Weighted final score, rounded to two decimals.
    pub fn combine(&self, s: &SubScores) -> f64 {
        let w = &self.config.weights;
        let total = s.bant * w.bant
            + s.behavioral * w.behavioral
            + s.demographic * w.demographic
            + s.engagement * w.engagement;
        round2(total.clamp(0.0, SCORE_CEILING))
    }

    pub fn classify(&self, score: f64) -> QualificationTier {
        QualificationTier::from_grade(self.config.thresholds.classify(score))
    }

    pub fn bant(&self, lead: &Lead) -> f64 {
        let notes = lowered(&lead.notes);
        let w = &self.config.bant_weights;
        let total = budget(lead) * w.budget
            + authority(lead, &notes) * w.authority
            + need(lead) * w.need
            + timeline(&notes) * w.timeline;
        total.min(SCORE_CEILING)
    }
}

impl Scorer for BantScorer {
    fn strategy(&self) -> &'static str {
        "bant"
    }

    fn assess(&self, input: &ScoringInput<'_>) -> Assessment {
        let score = self.combine(&self.sub_scores(input));
        Assessment {
            strategy: self.strategy(),
            score,
            tier: Some(self.classify(score).grade()),
        }
    }
}

fn lowered(value: &Option<String>) -> String {
    Lead::field(value).unwrap_or_default().to_lowercase()
}

fn budget(lead: &Lead) -> f64 {
    let Some(range) = Lead::field(&lead.budget_range) else {
        return 0.0;
    };
    let range = range.to_lowercase();
    if range.contains("enterprise") || range.contains("50k+") {
        10.0
    } else if range.contains("mid-market") || range.contains("10k-50k") {
        7.5
    } else if range.contains("small") || range.contains("1k-10k") {
        5.0
    } else {
        2.5
    }
}

fn authority(lead: &Lead, notes: &str) -> f64 {
    if AUTHORITY_MARKERS.iter().any(|m| notes.contains(m)) {
        8.0
    } else if Lead::field(&lead.company).is_some() {
        6.0
    } else {
        3.0
    }
}

fn need(lead: &Lead) -> f64 {
    match Lead::field(&lead.industry) {
        Some(industry) => {
            let industry = industry.to_lowercase();
            if HIGH_NEED_INDUSTRIES.iter().any(|i| industry.contains(i)) {
                8.0
            } else {
                5.0
            }
        }
        None => 3.0,
    }
}

fn timeline(notes: &str) -> f64 {
    if notes.contains("urgent") || notes.contains("asap") {
        9.0
    } else if notes.contains("soon") || notes.contains("quick") {
        7.0
    } else {
        NEUTRAL
    }
}

fn behavioral(history: &EngagementHistory) -> f64 {
    if history.sent == 0 {
        return NEUTRAL;
    }
    let rate = f64::from(history.opened + 2 * history.clicked) / f64::from(history.sent);
    let mut score = (rate * 5.0).min(SCORE_CEILING);
    if history.clicked > 0 {
        score += 2.0;
    }
    score.min(SCORE_CEILING)
}

fn demographic(lead: &Lead) -> f64 {
    let mut score = NEUTRAL;

    if let Some(email) = Lead::field(&lead.email) {
        let domain = email
            .split_once('@')
            .map(|(_, d)| d.to_lowercase())
            .unwrap_or_default();
        if !domain.is_empty() && !FREE_EMAIL_DOMAINS.contains(&domain.as_str()) {
            score += 2.0;
        }
        if CORPORATE_DOMAIN_MARKERS
            .iter()
            .any(|m| domain.ends_with(m) || domain.contains(&format!("{m}.")))
        {
            score += 1.0;
        }
    }

    let filled = [&lead.name, &lead.company, &lead.phone, &lead.industry]
        .into_iter()
        .filter(|f| Lead::field(f).is_some())
        .count();
    score += 0.5 * filled as f64;

    let source = lowered(&lead.source);
    score += SOURCE_BONUS
        .iter()
        .find(|(name, _)| *name == source)
        .map_or(0.0, |(_, bonus)| *bonus);

    score.min(SCORE_CEILING)
}

fn engagement(lead: &Lead, now: DateTime<Utc>) -> f64 {
    let Some(last) = lead.last_contact_at else {
        return NEVER_CONTACTED;
    };
    match (now - last).num_days() {
        d if d <= 7 => 9.0,
        d if d <= 30 => 7.0,
        d if d <= 90 => 5.0,
        _ => 3.0,
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn recommendations(lead: &Lead, tier: QualificationTier) -> Vec<String> {
    let base: &[&str] = match tier {
        QualificationTier::Hot => &[
            "Call right away",
            "Offer a discovery call within 24 hours",
            "Prepare a tailored proposal",
        ],
        QualificationTier::Warm => &[
            "Start a personalised email sequence",
            "Schedule a follow-up in 3-5 days",
            "Send relevant educational content",
        ],
        QualificationTier::Cold => &[
            "Add to the nurture campaign",
            "Send valuable content regularly",
            "Requalify in 30 days",
        ],
        QualificationTier::Unqualified => &[
            "Enrich the lead's data",
            "Verify the contact details",
            "Consider archiving if there is no response",
        ],
    };
    let mut out: Vec<String> = base.iter().map(|s| s.to_string()).collect();
    if Lead::field(&lead.phone).is_none() {
        out.push("Find a phone number".into());
    }
    if Lead::field(&lead.company).is_none() {
        out.push("Identify the prospect's company".into());
    }
    out
}

fn next_actions(tier: QualificationTier, now: DateTime<Utc>) -> Vec<ActionItem> {
    match tier {
        QualificationTier::Hot => vec![
            ActionItem::new(
                ActionKind::Call,
                Priority::High,
                now + TimeDelta::hours(2),
                "Urgent discovery call",
            ),
            ActionItem::new(
                ActionKind::Email,
                Priority::High,
                now + TimeDelta::hours(1),
                "Personalised first-contact email",
            ),
        ],
        QualificationTier::Warm => vec![
            ActionItem::new(
                ActionKind::EmailSequence,
                Priority::Medium,
                now + TimeDelta::days(1),
                "Start the email sequence",
            ),
            ActionItem::new(
                ActionKind::LinkedinConnect,
                Priority::Low,
                now + TimeDelta::days(2),
                "LinkedIn connection with a personal note",
            ),
        ],
        QualificationTier::Cold => vec![ActionItem::new(
            ActionKind::NurtureCampaign,
            Priority::Low,
            now + TimeDelta::days(7),
            "Add to the monthly nurture campaign",
        )],
        QualificationTier::Unqualified => vec![ActionItem::new(
            ActionKind::EnrichData,
            Priority::Low,
            now + TimeDelta::days(3),
            "Enrich missing contact and company data",
        )],
    }
}

/// Qualifies stored leads and persists the outcome.
pub struct QualificationService {
    scorer: BantScorer,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl QualificationService {
    pub fn new(config: QualificationConfig, store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self {
            scorer: BantScorer::new(config),
            store,
            clock,
        }
    }

    pub fn scorer(&self) -> &BantScorer {
        &self.scorer
    }

    pub fn qualify(&self, lead_id: Uuid) -> Result<QualificationResult> {
        let lead = self
            .store
            .lead(lead_id)?
            .ok_or_else(|| LeadflowError::not_found("lead", lead_id))?;
        let history = self.store.engagement_history(lead_id)?;
        let now = self.clock.now();

        let input = ScoringInput {
            lead: &lead,
            history,
            now,
        };
        let sub_scores = self.scorer.sub_scores(&input);
        let final_score = self.scorer.combine(&sub_scores);
        let tier = self.scorer.classify(final_score);

        self.store.update_lead(lead_id, &mut |l| {
            l.score = Some(final_score);
            l.grade = Some(tier.grade());
            if l.status == LeadStatus::New && tier != QualificationTier::Unqualified {
                l.status = LeadStatus::Qualified;
            }
            Ok(())
        })?;

        info!(lead_id = %lead_id, score = final_score, tier = %tier, "lead qualified");

        Ok(QualificationResult {
            lead_id,
            final_score,
            sub_scores,
            tier,
            recommendations: recommendations(&lead, tier),
            next_actions: next_actions(tier, now),
            qualified_at: now,
        })
    }

    pub async fn bulk_qualify(&self, limit: usize) -> Result<Vec<BulkItem>> {
        self.bulk_qualify_each(limit, |_| {}).await
    }

    /// Qualify up to `limit` unscored leads, newest first, pausing between
    /// items. A failing lead is reported in its item and the pass continues.
    pub async fn bulk_qualify_each(
        &self,
        limit: usize,
        mut on_item: impl FnMut(&BulkItem),
    ) -> Result<Vec<BulkItem>> {
        let limit = limit.min(self.scorer.config.bulk_limit_max);
        let pause = Duration::from_millis(self.scorer.config.bulk_pause_ms);
        let leads = self.store.unscored_leads(limit)?;

        let mut items = Vec::with_capacity(leads.len());
        for (i, lead) in leads.iter().enumerate() {
            if i > 0 && !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }
            let outcome = self.qualify(lead.id);
            if let Err(e) = &outcome {
                warn!(lead_id = %lead.id, error = %e, "qualification failed");
            }
            let item = BulkItem {
                lead_id: lead.id,
                outcome,
            };
            on_item(&item);
            items.push(item);
        }

        let ok = items.iter().filter(|i| i.outcome.is_ok()).count();
        info!(qualified = ok, failed = items.len() - ok, "bulk qualification finished");
        Ok(items)
    }
}

impl Scorer for QualificationService {
    fn strategy(&self) -> &'static str {
        self.scorer.strategy()
    }

    fn assess(&self, input: &ScoringInput<'_>) -> Assessment {
        self.scorer.assess(input)
    }
}

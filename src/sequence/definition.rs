use std::collections::HashSet;
use std::fmt;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enrollment::Enrollment;
use super::window::DeliveryWindow;
use crate::error::LeadflowError;
use crate::lead::{Lead, Tier};

/// Event name that causes enrollment into a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    LeadQualified,
    LeadGradeChange,
    NoResponse,
    Manual,
    TimeBased,
    Behavior,
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TriggerType::LeadQualified => "lead_qualified",
            TriggerType::LeadGradeChange => "lead_grade_change",
            TriggerType::NoResponse => "no_response",
            TriggerType::Manual => "manual",
            TriggerType::TimeBased => "time_based",
            TriggerType::Behavior => "behavior",
        };
        write!(f, "{name}")
    }
}

/// Which leads a sequence accepts. An empty set matches everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Targeting {
    pub grades: Vec<Tier>,
    pub sources: Vec<String>,
    pub industries: Vec<String>,
}

impl Targeting {
    pub fn matches(&self, lead: &Lead) -> bool {
        if !self.grades.is_empty() {
            match lead.grade {
                Some(grade) if self.grades.contains(&grade) => {}
                _ => return false,
            }
        }
        if !self.sources.is_empty() && !one_of(Lead::field(&lead.source), &self.sources) {
            return false;
        }
        if !self.industries.is_empty() && !one_of(Lead::field(&lead.industry), &self.industries) {
            return false;
        }
        true
    }
}

fn one_of(value: Option<&str>, set: &[String]) -> bool {
    value.is_some_and(|v| set.iter().any(|s| s.eq_ignore_ascii_case(v)))
}

/// Predicate over a lead and its enrollment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    MinScore { value: f64 },
    GradeIn { grades: Vec<Tier> },
    SourceIn { sources: Vec<String> },
    HasPhone,
    HasOpened,
    HasClicked,
    HasReplied,
}

impl Condition {
    pub fn holds(&self, lead: &Lead, enrollment: &Enrollment) -> bool {
        match self {
            Condition::MinScore { value } => lead.score.is_some_and(|s| s >= *value),
            Condition::GradeIn { grades } => lead.grade.is_some_and(|g| grades.contains(&g)),
            Condition::SourceIn { sources } => one_of(Lead::field(&lead.source), sources),
            Condition::HasPhone => Lead::field(&lead.phone).is_some(),
            Condition::HasOpened => enrollment.opened_count > 0,
            Condition::HasClicked => enrollment.clicked_count > 0,
            Condition::HasReplied => enrollment.replied_count > 0,
        }
    }
}

/// Wait before a step, counted from the previous step (or from enrollment
/// for the first one).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepDelay {
    pub days: u32,
    pub hours: u32,
    pub minutes: u32,
}

impl StepDelay {
    pub fn to_duration(self) -> TimeDelta {
        TimeDelta::days(i64::from(self.days))
            + TimeDelta::hours(i64::from(self.hours))
            + TimeDelta::minutes(i64::from(self.minutes))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceStep {
    pub step_number: u32,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub delay: StepDelay,

    /// Content reference handed to the renderer.
    pub template_id: String,

    /// All must hold for the step to be sent.
    #[serde(default)]
    pub send_conditions: Vec<Condition>,

    /// Any holding skips the step without sending.
    #[serde(default)]
    pub skip_conditions: Vec<Condition>,

    #[serde(default)]
    pub stop_on_reply: bool,
}

impl SequenceStep {
    pub fn should_skip(&self, lead: &Lead, enrollment: &Enrollment) -> bool {
        self.skip_conditions.iter().any(|c| c.holds(lead, enrollment))
            || !self.send_conditions.iter().all(|c| c.holds(lead, enrollment))
    }
}

/// Operator-defined outreach sequence. Read-only to automation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceDefinition {
    pub id: Uuid,
    pub name: String,

    #[serde(default = "default_active")]
    pub active: bool,

    pub trigger: TriggerType,

    #[serde(default)]
    pub targeting: Targeting,

    /// Work items created per local day, across all enrollments. 0 disables
    /// the cap.
    #[serde(default = "default_max_sends_per_day")]
    pub max_sends_per_day: u32,

    #[serde(default)]
    pub window: DeliveryWindow,

    #[serde(default)]
    pub steps: Vec<SequenceStep>,
}

fn default_active() -> bool {
    true
}

fn default_max_sends_per_day() -> u32 {
    50
}

impl SequenceDefinition {
    pub fn new(name: impl Into<String>, trigger: TriggerType) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            active: true,
            trigger,
            targeting: Targeting::default(),
            max_sends_per_day: default_max_sends_per_day(),
            window: DeliveryWindow::default(),
            steps: Vec::new(),
        }
    }

    /// Three-touch cold outreach for qualified hot and warm leads from
    /// social sources.
    pub fn cold_outreach(name: impl Into<String>) -> Self {
        let touch = |n: u32, name: &str, delay: StepDelay, template: &str| SequenceStep {
            step_number: n,
            name: name.to_string(),
            delay,
            template_id: template.to_string(),
            send_conditions: Vec::new(),
            skip_conditions: Vec::new(),
            stop_on_reply: true,
        };
        let mut seq = Self::new(name, TriggerType::LeadQualified)
            .with_step(touch(
                1,
                "Cold outreach intro",
                StepDelay {
                    minutes: 5,
                    ..Default::default()
                },
                "cold-intro",
            ))
            .with_step(touch(
                2,
                "Follow-up no response",
                StepDelay {
                    days: 3,
                    ..Default::default()
                },
                "cold-follow-up",
            ))
            .with_step(touch(
                3,
                "Final follow-up",
                StepDelay {
                    days: 7,
                    ..Default::default()
                },
                "cold-final",
            ));
        seq.targeting = Targeting {
            grades: vec![Tier::Hot, Tier::Warm],
            sources: vec!["instagram".into(), "linkedin".into()],
            industries: Vec::new(),
        };
        seq.max_sends_per_day = 50;
        seq
    }

    pub fn with_step(mut self, step: SequenceStep) -> Self {
        self.steps.push(step);
        self.steps.sort_by_key(|s| s.step_number);
        self
    }

    /// The step numbered `number`, or the closest one after it.
    pub fn step_at_or_after(&self, number: u32) -> Option<&SequenceStep> {
        self.steps
            .iter()
            .filter(|s| s.step_number >= number)
            .min_by_key(|s| s.step_number)
    }

    pub fn max_step(&self) -> Option<u32> {
        self.steps.iter().map(|s| s.step_number).max()
    }

    pub fn validate(&self) -> Result<(), LeadflowError> {
        let mut seen = HashSet::new();
        for step in &self.steps {
            if step.step_number == 0 {
                return Err(LeadflowError::Validation(format!(
                    "sequence {}: step numbers start at 1",
                    self.name
                )));
            }
            if !seen.insert(step.step_number) {
                return Err(LeadflowError::Validation(format!(
                    "sequence {}: duplicate step {}",
                    self.name, step.step_number
                )));
            }
        }
        self.window.validate()
    }
}

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of an enrollment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnrollmentStatus {
    Active,
    Paused,
    Completed,
    Stopped,
}

impl EnrollmentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, EnrollmentStatus::Completed | EnrollmentStatus::Stopped)
    }
}

impl fmt::Display for EnrollmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnrollmentStatus::Active => write!(f, "ACTIVE"),
            EnrollmentStatus::Paused => write!(f, "PAUSED"),
            EnrollmentStatus::Completed => write!(f, "COMPLETED"),
            EnrollmentStatus::Stopped => write!(f, "STOPPED"),
        }
    }
}

/// A lead's progress through one sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Enrollment {
    pub id: Uuid,
    pub sequence_id: Uuid,
    pub lead_id: Uuid,
    pub status: EnrollmentStatus,
    /// 1-based number of the step about to be attempted.
    pub current_step: u32,
    /// `None` means nothing further is scheduled.
    pub next_action_at: Option<DateTime<Utc>>,
    pub sent_count: u32,
    pub opened_count: u32,
    pub clicked_count: u32,
    pub replied_count: u32,
    pub failed_count: u32,
    pub enrolled_by: String,
    pub enrolled_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Enrollment {
    pub fn new(
        sequence_id: Uuid,
        lead_id: Uuid,
        enrolled_by: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence_id,
            lead_id,
            status: EnrollmentStatus::Active,
            current_step: 1,
            next_action_at: None,
            sent_count: 0,
            opened_count: 0,
            clicked_count: 0,
            replied_count: 0,
            failed_count: 0,
            enrolled_by: enrolled_by.into(),
            enrolled_at: now,
            ended_at: None,
            end_reason: None,
            updated_at: now,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == EnrollmentStatus::Active && self.next_action_at.is_some_and(|t| t <= now)
    }

    pub fn record_engagement(&mut self, engagement: Engagement, now: DateTime<Utc>) {
        match engagement {
            Engagement::Opened => self.opened_count += 1,
            Engagement::Clicked => self.clicked_count += 1,
            Engagement::Replied => self.replied_count += 1,
        }
        self.updated_at = now;
    }
}

/// Interaction reported asynchronously by the delivery provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Engagement {
    Opened,
    Clicked,
    Replied,
}

/// Identifies one send of one step: `<enrollment id>:<step number>`.
pub fn idempotency_key(enrollment_id: Uuid, step_number: u32) -> String {
    format!("{enrollment_id}:{step_number}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptStatus {
    Pending,
    Sent,
    /// Permanent provider rejection.
    Failed,
    /// Transient failures exhausted the retry budget.
    Abandoned,
}

impl AttemptStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, AttemptStatus::Pending)
    }
}

/// Delivery work item for one step of one enrollment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub idempotency_key: String,
    pub enrollment_id: Uuid,
    pub sequence_id: Uuid,
    pub lead_id: Uuid,
    pub step_number: u32,
    pub template_id: String,
    pub subject: Option<String>,
    pub body: Option<String>,
    pub tracking_refs: Vec<String>,
    pub attempts: u32,
    pub status: AttemptStatus,
    pub provider_message_id: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub not_before: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl DeliveryAttempt {
    pub fn new(
        enrollment: &Enrollment,
        step_number: u32,
        template_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            idempotency_key: idempotency_key(enrollment.id, step_number),
            enrollment_id: enrollment.id,
            sequence_id: enrollment.sequence_id,
            lead_id: enrollment.lead_id,
            step_number,
            template_id: template_id.into(),
            subject: None,
            body: None,
            tracking_refs: Vec::new(),
            attempts: 0,
            status: AttemptStatus::Pending,
            provider_message_id: None,
            failure_reason: None,
            created_at: now,
            not_before: now,
            sent_at: None,
        }
    }
}

/// Final result of dispatching a work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Sent { provider_id: String },
    PermanentFailure { reason: String },
    Abandoned { reason: String },
}

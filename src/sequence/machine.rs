use chrono::{DateTime, Utc};

use super::definition::{SequenceDefinition, SequenceStep};
use super::enrollment::{Enrollment, EnrollmentStatus};
use crate::lead::{Lead, LeadStatus};

pub const REASON_COMPLETED: &str = "completed";
pub const REASON_LEAD_MISSING: &str = "lead missing";
pub const REASON_LEAD_INVALID: &str = "lead invalid";
pub const REASON_LEAD_REPLIED: &str = "lead replied";

/// What the machine may look at while evaluating one due enrollment.
#[derive(Debug, Clone, Copy)]
pub struct StepContext<'a> {
    pub sequence: &'a SequenceDefinition,
    /// `None` when the lead no longer resolves.
    pub lead: Option<&'a Lead>,
    pub now: DateTime<Utc>,
    /// Work items already created for this sequence in the current local day.
    pub sends_today: u32,
}

/// The result of evaluating an enrollment.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Not active, or next action still in the future.
    NotDue,
    /// Produce a delivery work item for this step.
    Send { step_number: u32, template_id: String },
    /// Step passed over without a work item.
    Skip { step_number: u32 },
    /// Daily cap reached; retried at `until`.
    Defer { until: DateTime<Utc> },
    Complete,
    Stop { reason: String },
}

/// Drives an `Enrollment` through its sequence.
pub struct SequenceMachine;

impl SequenceMachine {
    /// Compute the transition for a due enrollment and apply it.
    ///
    /// Checks run in order: lead missing or invalid stops the enrollment; no
    /// step at or after `current_step` completes it; a reply on a
    /// stop-on-reply step stops it; failing conditions skip the step; a full
    /// daily cap defers to the next day's window; anything else sends.
    /// Sending and skipping both advance past the step, and advancing past
    /// the last step completes the enrollment in the same call.
    pub fn next(enrollment: &mut Enrollment, ctx: &StepContext<'_>) -> Transition {
        if !enrollment.is_due(ctx.now) {
            return Transition::NotDue;
        }

        let Some(lead) = ctx.lead else {
            Self::stop(enrollment, REASON_LEAD_MISSING, ctx.now);
            return Transition::Stop {
                reason: REASON_LEAD_MISSING.into(),
            };
        };
        if lead.status == LeadStatus::Invalid {
            Self::stop(enrollment, REASON_LEAD_INVALID, ctx.now);
            return Transition::Stop {
                reason: REASON_LEAD_INVALID.into(),
            };
        }

        let Some(step) = ctx.sequence.step_at_or_after(enrollment.current_step) else {
            Self::complete(enrollment, ctx.now);
            return Transition::Complete;
        };

        if step.stop_on_reply && enrollment.replied_count > 0 {
            Self::stop(enrollment, REASON_LEAD_REPLIED, ctx.now);
            return Transition::Stop {
                reason: REASON_LEAD_REPLIED.into(),
            };
        }

        if step.should_skip(lead, enrollment) {
            let step_number = step.step_number;
            Self::advance(enrollment, ctx.sequence, step, ctx.now);
            return Transition::Skip { step_number };
        }

        let cap = ctx.sequence.max_sends_per_day;
        if cap > 0 && ctx.sends_today >= cap {
            let until = ctx.sequence.window.next_day_start(ctx.now);
            enrollment.next_action_at = Some(until);
            enrollment.updated_at = ctx.now;
            return Transition::Defer { until };
        }

        let transition = Transition::Send {
            step_number: step.step_number,
            template_id: step.template_id.clone(),
        };
        enrollment.sent_count += 1;
        Self::advance(enrollment, ctx.sequence, step, ctx.now);
        transition
    }

    /// Set `next_action_at` for the step at or after `current_step`, or
    /// complete when there is none.
    pub fn schedule(enrollment: &mut Enrollment, sequence: &SequenceDefinition, now: DateTime<Utc>) {
        match sequence.step_at_or_after(enrollment.current_step) {
            Some(step) => {
                enrollment.next_action_at =
                    Some(sequence.window.adjust(now + step.delay.to_duration()));
                enrollment.updated_at = now;
            }
            None => Self::complete(enrollment, now),
        }
    }

    fn advance(
        enrollment: &mut Enrollment,
        sequence: &SequenceDefinition,
        step: &SequenceStep,
        now: DateTime<Utc>,
    ) {
        enrollment.current_step = enrollment.current_step.max(step.step_number + 1);
        Self::schedule(enrollment, sequence, now);
    }

    fn complete(enrollment: &mut Enrollment, now: DateTime<Utc>) {
        enrollment.status = EnrollmentStatus::Completed;
        enrollment.next_action_at = None;
        enrollment.ended_at = Some(now);
        enrollment.end_reason = Some(REASON_COMPLETED.into());
        enrollment.updated_at = now;
    }

    /// Returns `false` when the enrollment had already ended.
    pub fn stop(enrollment: &mut Enrollment, reason: &str, now: DateTime<Utc>) -> bool {
        if enrollment.status.is_terminal() {
            return false;
        }
        enrollment.status = EnrollmentStatus::Stopped;
        enrollment.next_action_at = None;
        enrollment.ended_at = Some(now);
        enrollment.end_reason = Some(reason.to_string());
        enrollment.updated_at = now;
        true
    }

    pub fn pause(enrollment: &mut Enrollment, now: DateTime<Utc>) -> bool {
        if enrollment.status != EnrollmentStatus::Active {
            return false;
        }
        enrollment.status = EnrollmentStatus::Paused;
        enrollment.next_action_at = None;
        enrollment.updated_at = now;
        true
    }

    /// Reactivates a paused enrollment, scheduling from `now`.
    pub fn resume(
        enrollment: &mut Enrollment,
        sequence: &SequenceDefinition,
        now: DateTime<Utc>,
    ) -> bool {
        if enrollment.status != EnrollmentStatus::Paused {
            return false;
        }
        enrollment.status = EnrollmentStatus::Active;
        Self::schedule(enrollment, sequence, now);
        true
    }
}

//! Outreach sequence automation.
//!
//! [`SequenceEngine`] owns every state change of an enrollment: creating it,
//! advancing due enrollments and emitting delivery work items, folding
//! delivery outcomes and engagement back in, and the manual stop, pause and
//! resume controls. Each change is a single atomic update in the store.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::AutomationConfig;
use crate::error::{LeadflowError, Result};
use crate::lead::{Lead, LeadFilter, LeadStatus};
use crate::queue::WorkQueue;
use crate::sequence::{
    AttemptStatus, DeliveryAttempt, DeliveryOutcome, Engagement, Enrollment, EnrollmentStatus,
    SequenceMachine, StepContext, Transition, TriggerType,
};
use crate::store::Store;

pub const REASON_SEQUENCE_MISSING: &str = "sequence missing";

/// `enrolled_by` recorded for [`SequenceEngine::enroll_matching`].
pub const BATCH_ENROLLMENT: &str = "batch_enrollment";

/// Why an enrollment request was turned down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// An ACTIVE enrollment already exists for the lead and sequence.
    Duplicate,
    TargetingMismatch,
    SequenceInactive,
    NoSteps,
    NotPaused,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RejectReason::Duplicate => "already enrolled",
            RejectReason::TargetingMismatch => "lead does not match sequence targeting",
            RejectReason::SequenceInactive => "sequence is inactive",
            RejectReason::NoSteps => "sequence has no steps",
            RejectReason::NotPaused => "enrollment is not paused",
        };
        write!(f, "{text}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum EnrollmentResult {
    Enrolled { enrollment: Enrollment },
    Rejected { reason: RejectReason },
}

impl EnrollmentResult {
    pub fn enrollment(&self) -> Option<&Enrollment> {
        match self {
            EnrollmentResult::Enrolled { enrollment } => Some(enrollment),
            EnrollmentResult::Rejected { .. } => None,
        }
    }

    fn rejected(reason: RejectReason) -> Self {
        EnrollmentResult::Rejected { reason }
    }
}

/// External signal that may enroll a lead into matching sequences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub lead_id: Uuid,
    pub trigger: TriggerType,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Per-sequence result of a trigger. A failing sequence does not stop the
/// others.
#[derive(Debug)]
pub struct TriggeredEnrollment {
    pub sequence_id: Uuid,
    pub outcome: Result<EnrollmentResult>,
}

impl TriggeredEnrollment {
    pub fn enrollment(&self) -> Option<&Enrollment> {
        self.outcome.as_ref().ok().and_then(EnrollmentResult::enrollment)
    }
}

/// Per-lead result of [`SequenceEngine::enroll_matching`].
#[derive(Debug)]
pub struct BulkEnrollment {
    pub lead_id: Uuid,
    pub outcome: Result<EnrollmentResult>,
}

impl BulkEnrollment {
    pub fn enrollment(&self) -> Option<&Enrollment> {
        self.outcome.as_ref().ok().and_then(EnrollmentResult::enrollment)
    }
}

/// Counters for one `process_due` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessStats {
    pub examined: usize,
    pub sends_queued: usize,
    pub skipped: usize,
    pub deferred: usize,
    pub completed: usize,
    pub stopped: usize,
    pub not_due: usize,
    /// Claimed by a concurrent pass.
    pub busy: usize,
    pub errors: usize,
}

impl ProcessStats {
    fn tally(&mut self, transition: &Transition, after: &Enrollment) {
        match transition {
            Transition::NotDue => self.not_due += 1,
            Transition::Send { .. } => self.sends_queued += 1,
            Transition::Skip { .. } => self.skipped += 1,
            Transition::Defer { .. } => self.deferred += 1,
            Transition::Complete => {}
            Transition::Stop { .. } => self.stopped += 1,
        }
        if after.status == EnrollmentStatus::Completed {
            self.completed += 1;
        }
    }
}

/// Set of enrollment ids currently being advanced.
#[derive(Default)]
pub struct EnrollmentLocks {
    held: Mutex<HashSet<Uuid>>,
}

impl EnrollmentLocks {
    /// Claim `id` for this pass, or `None` when another pass holds it.
    pub fn try_claim(&self, id: Uuid) -> Option<EnrollmentClaim<'_>> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if held.insert(id) {
            Some(EnrollmentClaim { locks: self, id })
        } else {
            None
        }
    }
}

/// Releases its enrollment when dropped.
pub struct EnrollmentClaim<'a> {
    locks: &'a EnrollmentLocks,
    id: Uuid,
}

impl Drop for EnrollmentClaim<'_> {
    fn drop(&mut self) {
        let mut held = self.locks.held.lock().unwrap_or_else(|e| e.into_inner());
        held.remove(&self.id);
    }
}

pub struct SequenceEngine {
    store: Arc<dyn Store>,
    queue: Arc<dyn WorkQueue>,
    config: AutomationConfig,
    locks: EnrollmentLocks,
}

impl SequenceEngine {
    pub fn new(store: Arc<dyn Store>, queue: Arc<dyn WorkQueue>, config: AutomationConfig) -> Self {
        Self {
            store,
            queue,
            config,
            locks: EnrollmentLocks::default(),
        }
    }

    pub fn locks(&self) -> &EnrollmentLocks {
        &self.locks
    }

    /// Enroll a lead at step 1 of a sequence.
    ///
    /// Missing lead or sequence is an error; inactive or empty sequences,
    /// targeting mismatches and existing ACTIVE enrollments are rejections.
    pub fn enroll(
        &self,
        lead_id: Uuid,
        sequence_id: Uuid,
        enrolled_by: &str,
        now: DateTime<Utc>,
    ) -> Result<EnrollmentResult> {
        let lead = self
            .store
            .lead(lead_id)?
            .ok_or_else(|| LeadflowError::not_found("lead", lead_id))?;
        let sequence = self
            .store
            .sequence(sequence_id)?
            .ok_or_else(|| LeadflowError::not_found("sequence", sequence_id))?;

        if !sequence.active {
            return Ok(EnrollmentResult::rejected(RejectReason::SequenceInactive));
        }
        if sequence.steps.is_empty() {
            return Ok(EnrollmentResult::rejected(RejectReason::NoSteps));
        }
        if !sequence.targeting.matches(&lead) {
            debug!(lead_id = %lead_id, sequence = %sequence.name, "targeting mismatch");
            return Ok(EnrollmentResult::rejected(RejectReason::TargetingMismatch));
        }

        let mut enrollment = Enrollment::new(sequence_id, lead_id, enrolled_by, now);
        SequenceMachine::schedule(&mut enrollment, &sequence, now);
        if !self.store.insert_enrollment(enrollment.clone())? {
            return Ok(EnrollmentResult::rejected(RejectReason::Duplicate));
        }

        self.store.update_lead(lead_id, &mut |l| {
            if matches!(l.status, LeadStatus::New | LeadStatus::Qualified) {
                l.status = LeadStatus::Enrolled;
            }
            Ok(())
        })?;

        info!(
            enrollment_id = %enrollment.id,
            lead_id = %lead_id,
            sequence = %sequence.name,
            next_action_at = ?enrollment.next_action_at,
            "lead enrolled"
        );
        Ok(EnrollmentResult::Enrolled { enrollment })
    }

    /// Enroll every lead accepted by `filter` (newest first, at most `limit`)
    /// into one sequence. Each lead gets its own outcome.
    pub fn enroll_matching(
        &self,
        sequence_id: Uuid,
        filter: &LeadFilter,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<BulkEnrollment>> {
        let sequence = self
            .store
            .sequence(sequence_id)?
            .ok_or_else(|| LeadflowError::not_found("sequence", sequence_id))?;
        let leads = self.store.leads_matching(filter, limit)?;

        let mut items = Vec::with_capacity(leads.len());
        for lead in leads {
            let outcome = self.enroll(lead.id, sequence_id, BATCH_ENROLLMENT, now);
            if let Err(e) = &outcome {
                warn!(lead_id = %lead.id, sequence = %sequence.name, error = %e, "batch enrollment failed");
            }
            items.push(BulkEnrollment {
                lead_id: lead.id,
                outcome,
            });
        }

        let enrolled = items.iter().filter(|i| i.enrollment().is_some()).count();
        info!(
            sequence = %sequence.name,
            matched = items.len(),
            enrolled,
            "batch enrollment finished"
        );
        Ok(items)
    }

    /// Advance every due enrollment by one step, bounded by the batch limit.
    ///
    /// An enrollment failing to advance is logged and counted; the rest of
    /// the batch continues.
    pub fn process_due(&self, now: DateTime<Utc>) -> Result<ProcessStats> {
        let due = self.store.due_enrollments(now, self.config.batch_limit)?;
        let mut stats = ProcessStats::default();

        for enrollment in due {
            stats.examined += 1;
            let Some(_claim) = self.locks.try_claim(enrollment.id) else {
                stats.busy += 1;
                continue;
            };
            match self.advance(enrollment.id, now) {
                Ok((transition, after)) => stats.tally(&transition, &after),
                Err(e) => {
                    stats.errors += 1;
                    warn!(enrollment_id = %enrollment.id, error = %e, "failed to advance enrollment");
                }
            }
        }

        if stats.examined > 0 {
            info!(
                examined = stats.examined,
                queued = stats.sends_queued,
                skipped = stats.skipped,
                deferred = stats.deferred,
                completed = stats.completed,
                stopped = stats.stopped,
                errors = stats.errors,
                "processed due enrollments"
            );
        }
        Ok(stats)
    }

    fn advance(&self, id: Uuid, now: DateTime<Utc>) -> Result<(Transition, Enrollment)> {
        let current = self
            .store
            .enrollment(id)?
            .ok_or_else(|| LeadflowError::not_found("enrollment", id))?;

        let Some(sequence) = self.store.sequence(current.sequence_id)? else {
            let mut stopped = false;
            let after = self.store.update_enrollment(id, &mut |e| {
                stopped = SequenceMachine::stop(e, REASON_SEQUENCE_MISSING, now);
                Ok(())
            })?;
            let transition = if stopped {
                Transition::Stop {
                    reason: REASON_SEQUENCE_MISSING.into(),
                }
            } else {
                Transition::NotDue
            };
            return Ok((transition, after));
        };
        let lead = self.store.lead(current.lead_id)?;
        let sends_today = self
            .queue
            .count_since(sequence.id, sequence.window.local_day_start(now))?;

        let ctx = StepContext {
            sequence: &sequence,
            lead: lead.as_ref(),
            now,
            sends_today,
        };
        let queue = &self.queue;
        let mut transition = Transition::NotDue;
        let after = self.store.update_enrollment(id, &mut |e| {
            transition = SequenceMachine::next(e, &ctx);
            if let Transition::Send {
                step_number,
                template_id,
            } = &transition
            {
                let attempt = DeliveryAttempt::new(e, *step_number, template_id.clone(), now);
                if !queue.enqueue(attempt)? {
                    debug!(enrollment_id = %e.id, step = step_number, "work item already queued");
                }
            }
            Ok(())
        })?;

        debug!(enrollment_id = %id, transition = ?transition, status = %after.status, "enrollment advanced");
        Ok((transition, after))
    }

    /// Fold a dispatch result back into the attempt, enrollment and lead.
    ///
    /// Returns `false` when the attempt had already reached a final status,
    /// in which case nothing changes.
    pub fn record_outcome(
        &self,
        key: &str,
        outcome: &DeliveryOutcome,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut attempt = self
            .queue
            .get(key)?
            .ok_or_else(|| LeadflowError::not_found("delivery attempt", key))?;
        if attempt.status.is_terminal() {
            debug!(key, status = ?attempt.status, "outcome for finished attempt ignored");
            return Ok(false);
        }

        match outcome {
            DeliveryOutcome::Sent { provider_id } => {
                attempt.status = AttemptStatus::Sent;
                attempt.provider_message_id = Some(provider_id.clone());
                attempt.sent_at = Some(now);
                self.queue.update(attempt.clone())?;
                self.touch_lead(attempt.lead_id, &mut |l| {
                    l.last_contact_at = Some(now);
                    if matches!(
                        l.status,
                        LeadStatus::New | LeadStatus::Qualified | LeadStatus::Enrolled
                    ) {
                        l.status = LeadStatus::Contacted;
                    }
                })?;
                info!(key, provider_id = %provider_id, "step delivered");
            }
            DeliveryOutcome::PermanentFailure { reason } => {
                attempt.status = AttemptStatus::Failed;
                attempt.failure_reason = Some(reason.clone());
                self.queue.update(attempt.clone())?;
                self.count_failure(attempt.enrollment_id, now)?;
                self.touch_lead(attempt.lead_id, &mut |l| l.status = LeadStatus::Invalid)?;
                warn!(key, reason = %reason, "delivery rejected, lead flagged invalid");
            }
            DeliveryOutcome::Abandoned { reason } => {
                attempt.status = AttemptStatus::Abandoned;
                attempt.failure_reason = Some(reason.clone());
                self.queue.update(attempt.clone())?;
                self.count_failure(attempt.enrollment_id, now)?;
                warn!(key, reason = %reason, "delivery abandoned after retries");
            }
        }
        Ok(true)
    }

    fn count_failure(&self, enrollment_id: Uuid, now: DateTime<Utc>) -> Result<()> {
        self.store.update_enrollment(enrollment_id, &mut |e| {
            e.failed_count += 1;
            e.updated_at = now;
            Ok(())
        })?;
        Ok(())
    }

    /// Update a lead that may have been deleted meanwhile.
    fn touch_lead(&self, lead_id: Uuid, f: &mut dyn FnMut(&mut Lead)) -> Result<()> {
        match self.store.update_lead(lead_id, &mut |l| {
            f(l);
            Ok(())
        }) {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                warn!(lead_id = %lead_id, "lead vanished before outcome was recorded");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Count an open, click or reply. Accepted in any status.
    pub fn record_engagement(
        &self,
        enrollment_id: Uuid,
        engagement: Engagement,
        now: DateTime<Utc>,
    ) -> Result<Enrollment> {
        let after = self.store.update_enrollment(enrollment_id, &mut |e| {
            e.record_engagement(engagement, now);
            Ok(())
        })?;
        debug!(enrollment_id = %enrollment_id, engagement = ?engagement, "engagement recorded");
        Ok(after)
    }

    /// Stop an ACTIVE or PAUSED enrollment. Returns `false` when it had
    /// already ended.
    pub fn stop(&self, enrollment_id: Uuid, reason: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut stopped = false;
        self.store.update_enrollment(enrollment_id, &mut |e| {
            stopped = SequenceMachine::stop(e, reason, now);
            Ok(())
        })?;
        if stopped {
            info!(enrollment_id = %enrollment_id, reason, "enrollment stopped");
        }
        Ok(stopped)
    }

    pub fn pause(&self, enrollment_id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let mut paused = false;
        self.store.update_enrollment(enrollment_id, &mut |e| {
            paused = SequenceMachine::pause(e, now);
            Ok(())
        })?;
        if paused {
            info!(enrollment_id = %enrollment_id, "enrollment paused");
        }
        Ok(paused)
    }

    /// Reactivate a paused enrollment, scheduling its current step from
    /// `now`.
    pub fn resume(&self, enrollment_id: Uuid, now: DateTime<Utc>) -> Result<EnrollmentResult> {
        let current = self
            .store
            .enrollment(enrollment_id)?
            .ok_or_else(|| LeadflowError::not_found("enrollment", enrollment_id))?;
        if current.status != EnrollmentStatus::Paused {
            return Ok(EnrollmentResult::rejected(RejectReason::NotPaused));
        }
        let sequence = self
            .store
            .sequence(current.sequence_id)?
            .ok_or_else(|| LeadflowError::not_found("sequence", current.sequence_id))?;

        let mut resumed = false;
        let updated = self.store.update_enrollment(enrollment_id, &mut |e| {
            resumed = SequenceMachine::resume(e, &sequence, now);
            Ok(())
        });
        match updated {
            Ok(enrollment) if resumed => {
                info!(enrollment_id = %enrollment_id, next_action_at = ?enrollment.next_action_at, "enrollment resumed");
                Ok(EnrollmentResult::Enrolled { enrollment })
            }
            Ok(_) => Ok(EnrollmentResult::rejected(RejectReason::NotPaused)),
            Err(LeadflowError::Validation(_)) => {
                Ok(EnrollmentResult::rejected(RejectReason::Duplicate))
            }
            Err(e) => Err(e),
        }
    }

    /// Enroll the event's lead in every active sequence listening for its
    /// trigger. A payload `enrolled_by` string overrides the recorded actor.
    pub fn handle_event(
        &self,
        event: &TriggerEvent,
        now: DateTime<Utc>,
    ) -> Result<Vec<TriggeredEnrollment>> {
        let enrolled_by = event
            .payload
            .get("enrolled_by")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| format!("trigger:{}", event.trigger));

        let sequences = self.store.sequences_for_trigger(event.trigger)?;
        let mut results = Vec::with_capacity(sequences.len());
        for sequence in sequences {
            let outcome = self.enroll(event.lead_id, sequence.id, &enrolled_by, now);
            if let Err(e) = &outcome {
                warn!(lead_id = %event.lead_id, sequence = %sequence.name, error = %e, "trigger enrollment failed");
            }
            results.push(TriggeredEnrollment {
                sequence_id: sequence.id,
                outcome,
            });
        }
        debug!(
            lead_id = %event.lead_id,
            trigger = %event.trigger,
            matched = results.len(),
            "trigger handled"
        );
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lead::Tier;
    use crate::queue::MemoryQueue;
    use crate::sequence::{
        Condition, REASON_LEAD_REPLIED, SequenceDefinition, SequenceStep, StepDelay, Targeting,
        idempotency_key,
    };
    use crate::store::{FaultyStore, MemoryStore};
    use chrono::{TimeDelta, TimeZone};

    struct Harness {
        store: Arc<MemoryStore>,
        queue: Arc<MemoryQueue>,
        engine: SequenceEngine,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let engine = SequenceEngine::new(store.clone(), queue.clone(), AutomationConfig::default());
        Harness {
            store,
            queue,
            engine,
        }
    }

    fn wednesday() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 14, 10, 0, 0).unwrap()
    }

    fn step(n: u32, delay: StepDelay) -> SequenceStep {
        SequenceStep {
            step_number: n,
            name: format!("step {n}"),
            delay,
            template_id: format!("tpl-{n}"),
            send_conditions: vec![],
            skip_conditions: vec![],
            stop_on_reply: false,
        }
    }

    fn cold_outreach() -> SequenceDefinition {
        SequenceDefinition::new("cold outreach", TriggerType::LeadQualified)
            .with_step(step(
                1,
                StepDelay {
                    minutes: 5,
                    ..Default::default()
                },
            ))
            .with_step(step(
                2,
                StepDelay {
                    days: 3,
                    ..Default::default()
                },
            ))
    }

    fn seeded(h: &Harness, seq: SequenceDefinition) -> (Lead, SequenceDefinition) {
        let mut lead = Lead::new("Ana Silva");
        lead.email = Some("ana@studio.io".into());
        lead.grade = Some(Tier::Warm);
        h.store.save_lead(lead.clone()).unwrap();
        h.store.save_sequence(seq.clone()).unwrap();
        (lead, seq)
    }

    fn enrolled(h: &Harness, lead: &Lead, seq: &SequenceDefinition, now: DateTime<Utc>) -> Enrollment {
        h.engine
            .enroll(lead.id, seq.id, "test", now)
            .unwrap()
            .enrollment()
            .cloned()
            .unwrap()
    }

    #[test]
    fn enroll_schedules_first_step_and_marks_lead() {
        let h = harness();
        let (lead, seq) = seeded(&h, cold_outreach());
        let e = enrolled(&h, &lead, &seq, wednesday());
        assert_eq!(e.current_step, 1);
        assert_eq!(e.next_action_at, Some(wednesday() + TimeDelta::minutes(5)));
        assert_eq!(e.enrolled_by, "test");
        let stored = h.store.lead(lead.id).unwrap().unwrap();
        assert_eq!(stored.status, LeadStatus::Enrolled);
    }

    #[test]
    fn second_enroll_is_duplicate() {
        let h = harness();
        let (lead, seq) = seeded(&h, cold_outreach());
        enrolled(&h, &lead, &seq, wednesday());
        let again = h.engine.enroll(lead.id, seq.id, "test", wednesday()).unwrap();
        assert_eq!(
            again,
            EnrollmentResult::Rejected {
                reason: RejectReason::Duplicate
            }
        );
        assert_eq!(h.store.enrollments_for_lead(lead.id).unwrap().len(), 1);
    }

    #[test]
    fn enroll_rejections_and_not_found() {
        let h = harness();
        let mut seq = cold_outreach();
        seq.targeting = Targeting {
            grades: vec![Tier::Hot],
            ..Default::default()
        };
        let (lead, seq) = seeded(&h, seq);
        assert_eq!(
            h.engine.enroll(lead.id, seq.id, "t", wednesday()).unwrap(),
            EnrollmentResult::Rejected {
                reason: RejectReason::TargetingMismatch
            }
        );

        let mut inactive = cold_outreach();
        inactive.active = false;
        h.store.save_sequence(inactive.clone()).unwrap();
        assert_eq!(
            h.engine.enroll(lead.id, inactive.id, "t", wednesday()).unwrap(),
            EnrollmentResult::Rejected {
                reason: RejectReason::SequenceInactive
            }
        );

        let empty = SequenceDefinition::new("empty", TriggerType::Manual);
        h.store.save_sequence(empty.clone()).unwrap();
        assert_eq!(
            h.engine.enroll(lead.id, empty.id, "t", wednesday()).unwrap(),
            EnrollmentResult::Rejected {
                reason: RejectReason::NoSteps
            }
        );

        let err = h.engine.enroll(Uuid::new_v4(), seq.id, "t", wednesday()).unwrap_err();
        assert!(err.is_not_found());
        let err = h.engine.enroll(lead.id, Uuid::new_v4(), "t", wednesday()).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn process_due_queues_work_and_completes() {
        let h = harness();
        let (lead, seq) = seeded(&h, cold_outreach());
        let e = enrolled(&h, &lead, &seq, wednesday());

        let early = h.engine.process_due(wednesday()).unwrap();
        assert_eq!(early.examined, 0);

        let t1 = wednesday() + TimeDelta::minutes(5);
        let stats = h.engine.process_due(t1).unwrap();
        assert_eq!(stats.sends_queued, 1);
        let attempt = h.queue.get(&idempotency_key(e.id, 1)).unwrap().unwrap();
        assert_eq!(attempt.template_id, "tpl-1");
        assert_eq!(attempt.status, AttemptStatus::Pending);

        // Saturday rolls to Monday 09:00.
        let after = h.store.enrollment(e.id).unwrap().unwrap();
        let monday = Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap();
        assert_eq!(after.next_action_at, Some(monday));

        let stats = h.engine.process_due(monday).unwrap();
        assert_eq!(stats.sends_queued, 1);
        assert_eq!(stats.completed, 1);
        let done = h.store.enrollment(e.id).unwrap().unwrap();
        assert_eq!(done.status, EnrollmentStatus::Completed);
        assert_eq!(done.next_action_at, None);
        assert_eq!(done.sent_count, 2);
        assert_eq!(h.queue.all().unwrap().len(), 2);
    }

    #[test]
    fn claimed_enrollment_is_skipped() {
        let h = harness();
        let (lead, seq) = seeded(&h, cold_outreach());
        let e = enrolled(&h, &lead, &seq, wednesday());
        let t1 = wednesday() + TimeDelta::minutes(5);

        let claim = h.engine.locks().try_claim(e.id);
        assert!(claim.is_some());
        let stats = h.engine.process_due(t1).unwrap();
        assert_eq!(stats.busy, 1);
        assert_eq!(stats.sends_queued, 0);

        drop(claim);
        assert_eq!(h.engine.process_due(t1).unwrap().sends_queued, 1);
    }

    #[test]
    fn batch_limit_bounds_a_pass() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let engine = SequenceEngine::new(
            store.clone(),
            queue.clone(),
            AutomationConfig { batch_limit: 2 },
        );
        let h = Harness {
            store,
            queue,
            engine,
        };
        let seq = cold_outreach();
        h.store.save_sequence(seq.clone()).unwrap();
        for i in 0..3 {
            let lead = Lead::new(format!("Lead {i}"));
            h.store.save_lead(lead.clone()).unwrap();
            enrolled(&h, &lead, &seq, wednesday());
        }
        let t1 = wednesday() + TimeDelta::minutes(5);
        assert_eq!(h.engine.process_due(t1).unwrap().sends_queued, 2);
        assert_eq!(h.engine.process_due(t1).unwrap().sends_queued, 1);
    }

    #[test]
    fn skipped_step_creates_no_work_item() {
        let h = harness();
        let mut s1 = step(1, StepDelay::default());
        s1.send_conditions.push(Condition::HasPhone);
        let seq = SequenceDefinition::new("phone only", TriggerType::Manual)
            .with_step(s1)
            .with_step(step(2, StepDelay::default()));
        let (lead, seq) = seeded(&h, seq);
        let e = enrolled(&h, &lead, &seq, wednesday());

        let stats = h.engine.process_due(wednesday()).unwrap();
        assert_eq!(stats.skipped, 1);
        assert!(h.queue.get(&idempotency_key(e.id, 1)).unwrap().is_none());
        assert_eq!(h.store.enrollment(e.id).unwrap().unwrap().current_step, 2);
    }

    #[test]
    fn sent_outcome_is_idempotent() {
        let h = harness();
        let (lead, seq) = seeded(&h, cold_outreach());
        let e = enrolled(&h, &lead, &seq, wednesday());
        let t1 = wednesday() + TimeDelta::minutes(5);
        h.engine.process_due(t1).unwrap();
        let key = idempotency_key(e.id, 1);
        let sent = DeliveryOutcome::Sent {
            provider_id: "msg-1".into(),
        };

        assert!(h.engine.record_outcome(&key, &sent, t1).unwrap());
        let before = h.store.enrollment(e.id).unwrap().unwrap();
        assert!(!h.engine.record_outcome(&key, &sent, t1 + TimeDelta::hours(1)).unwrap());
        assert_eq!(h.store.enrollment(e.id).unwrap().unwrap(), before);

        let attempt = h.queue.get(&key).unwrap().unwrap();
        assert_eq!(attempt.status, AttemptStatus::Sent);
        assert_eq!(attempt.provider_message_id.as_deref(), Some("msg-1"));
        assert_eq!(attempt.sent_at, Some(t1));

        let stored = h.store.lead(lead.id).unwrap().unwrap();
        assert_eq!(stored.status, LeadStatus::Contacted);
        assert_eq!(stored.last_contact_at, Some(t1));
    }

    #[test]
    fn permanent_failure_flags_lead_and_stops_next_pass() {
        let h = harness();
        let (lead, seq) = seeded(&h, cold_outreach());
        let e = enrolled(&h, &lead, &seq, wednesday());
        let t1 = wednesday() + TimeDelta::minutes(5);
        h.engine.process_due(t1).unwrap();

        let key = idempotency_key(e.id, 1);
        let failure = DeliveryOutcome::PermanentFailure {
            reason: "mailbox does not exist".into(),
        };
        assert!(h.engine.record_outcome(&key, &failure, t1).unwrap());

        let after = h.store.enrollment(e.id).unwrap().unwrap();
        assert_eq!(after.failed_count, 1);
        assert_eq!(after.current_step, 2);
        assert_eq!(h.store.lead(lead.id).unwrap().unwrap().status, LeadStatus::Invalid);
        assert_eq!(h.queue.get(&key).unwrap().unwrap().status, AttemptStatus::Failed);

        let monday = Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap();
        let stats = h.engine.process_due(monday).unwrap();
        assert_eq!(stats.stopped, 1);
    }

    #[test]
    fn reply_stops_on_stop_on_reply_step() {
        let h = harness();
        let mut s2 = step(2, StepDelay::default());
        s2.stop_on_reply = true;
        let seq = SequenceDefinition::new("reply aware", TriggerType::Manual)
            .with_step(step(1, StepDelay::default()))
            .with_step(s2);
        let (lead, seq) = seeded(&h, seq);
        let e = enrolled(&h, &lead, &seq, wednesday());
        h.engine.process_due(wednesday()).unwrap();

        h.engine
            .record_engagement(e.id, Engagement::Replied, wednesday())
            .unwrap();
        let stats = h.engine.process_due(wednesday()).unwrap();
        assert_eq!(stats.stopped, 1);
        let after = h.store.enrollment(e.id).unwrap().unwrap();
        assert_eq!(after.end_reason.as_deref(), Some(REASON_LEAD_REPLIED));
    }

    #[test]
    fn stop_pause_resume() {
        let h = harness();
        let (lead, seq) = seeded(&h, cold_outreach());
        let e = enrolled(&h, &lead, &seq, wednesday());

        assert!(h.engine.pause(e.id, wednesday()).unwrap());
        // A new enrollment is allowed while the first is paused.
        let second = enrolled(&h, &lead, &seq, wednesday());
        assert_eq!(
            h.engine.resume(e.id, wednesday()).unwrap(),
            EnrollmentResult::Rejected {
                reason: RejectReason::Duplicate
            }
        );

        assert!(h.engine.stop(second.id, "manual", wednesday()).unwrap());
        assert!(!h.engine.stop(second.id, "manual", wednesday()).unwrap());

        let later = wednesday() + TimeDelta::hours(1);
        let resumed = h.engine.resume(e.id, later).unwrap();
        let resumed = resumed.enrollment().unwrap();
        assert_eq!(resumed.status, EnrollmentStatus::Active);
        assert_eq!(resumed.next_action_at, Some(later + TimeDelta::minutes(5)));

        assert_eq!(
            h.engine.resume(e.id, later).unwrap(),
            EnrollmentResult::Rejected {
                reason: RejectReason::NotPaused
            }
        );
    }

    #[test]
    fn engagement_counts_after_completion() {
        let h = harness();
        let (lead, seq) = seeded(&h, cold_outreach());
        let e = enrolled(&h, &lead, &seq, wednesday());
        h.engine.stop(e.id, "manual", wednesday()).unwrap();
        let after = h
            .engine
            .record_engagement(e.id, Engagement::Opened, wednesday())
            .unwrap();
        assert_eq!(after.opened_count, 1);
        assert_eq!(after.status, EnrollmentStatus::Stopped);
    }

    #[test]
    fn trigger_enrolls_in_matching_sequences() {
        let h = harness();
        let (lead, seq) = seeded(&h, cold_outreach());
        let manual = SequenceDefinition::new("manual", TriggerType::Manual)
            .with_step(step(1, StepDelay::default()));
        h.store.save_sequence(manual).unwrap();

        let event = TriggerEvent {
            lead_id: lead.id,
            trigger: TriggerType::LeadQualified,
            payload: serde_json::json!({ "enrolled_by": "qualifier" }),
        };
        let results = h.engine.handle_event(&event, wednesday()).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].sequence_id, seq.id);
        let enrollment = results[0].enrollment().unwrap();
        assert_eq!(enrollment.enrolled_by, "qualifier");

        let again = h.engine.handle_event(&event, wednesday()).unwrap();
        assert_eq!(
            *again[0].outcome.as_ref().unwrap(),
            EnrollmentResult::Rejected {
                reason: RejectReason::Duplicate
            }
        );
    }

    #[test]
    fn failing_sequence_does_not_block_other_triggers() {
        let store = Arc::new(FaultyStore::new());
        let engine = SequenceEngine::new(
            store.clone(),
            Arc::new(MemoryQueue::new()),
            AutomationConfig::default(),
        );
        let lead = Lead::new("Ana Silva");
        store.save_lead(lead.clone()).unwrap();
        let broken = SequenceDefinition::new("a broken", TriggerType::LeadQualified)
            .with_step(step(1, StepDelay::default()));
        let healthy = SequenceDefinition::new("b healthy", TriggerType::LeadQualified)
            .with_step(step(1, StepDelay::default()));
        store.save_sequence(broken.clone()).unwrap();
        store.save_sequence(healthy.clone()).unwrap();
        store.break_id(broken.id);

        let event = TriggerEvent {
            lead_id: lead.id,
            trigger: TriggerType::LeadQualified,
            payload: serde_json::Value::Null,
        };
        let results = engine.handle_event(&event, wednesday()).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].sequence_id, broken.id);
        assert!(results[0].outcome.is_err());
        assert_eq!(results[1].sequence_id, healthy.id);
        assert!(results[1].enrollment().is_some());
    }

    #[test]
    fn enroll_matching_selects_by_filter() {
        let h = harness();
        let seq = SequenceDefinition::cold_outreach("Cold Outreach");
        h.store.save_sequence(seq.clone()).unwrap();
        let mut picked = Vec::new();
        for (name, grade, source, score) in [
            ("Hot Insta", Tier::Hot, "instagram", 8.5),
            ("Warm Linked", Tier::Warm, "LinkedIn", 6.0),
            ("Warm Low", Tier::Warm, "linkedin", 3.0),
            ("Cold Linked", Tier::Cold, "linkedin", 8.0),
            ("Hot Referral", Tier::Hot, "referral", 9.0),
        ] {
            let mut lead = Lead::new(name);
            lead.grade = Some(grade);
            lead.source = Some(source.into());
            lead.score = Some(score);
            h.store.save_lead(lead.clone()).unwrap();
            if score >= 5.0 && grade >= Tier::Warm && source != "referral" {
                picked.push(lead.id);
            }
        }
        let filter = LeadFilter {
            grades: vec![Tier::Hot, Tier::Warm],
            sources: vec!["instagram".into(), "linkedin".into()],
            min_score: Some(5.0),
        };

        let items = h.engine.enroll_matching(seq.id, &filter, 10, wednesday()).unwrap();
        let mut enrolled: Vec<_> = items
            .iter()
            .map(|i| {
                let e = i.enrollment().unwrap();
                assert_eq!(e.enrolled_by, BATCH_ENROLLMENT);
                i.lead_id
            })
            .collect();
        enrolled.sort();
        picked.sort();
        assert_eq!(enrolled, picked);

        // Already enrolled leads come back as duplicates.
        let again = h.engine.enroll_matching(seq.id, &filter, 10, wednesday()).unwrap();
        assert!(again.iter().all(|i| matches!(
            i.outcome,
            Ok(EnrollmentResult::Rejected {
                reason: RejectReason::Duplicate
            })
        )));

        let err = h
            .engine
            .enroll_matching(Uuid::new_v4(), &filter, 10, wednesday())
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn enroll_matching_reports_each_failure() {
        let store = Arc::new(FaultyStore::new());
        let engine = SequenceEngine::new(
            store.clone(),
            Arc::new(MemoryQueue::new()),
            AutomationConfig::default(),
        );
        let seq = cold_outreach();
        store.save_sequence(seq.clone()).unwrap();
        let good = Lead::new("Good Lead");
        let bad = Lead::new("Bad Lead");
        store.save_lead(good.clone()).unwrap();
        store.save_lead(bad.clone()).unwrap();
        store.break_id(bad.id);

        let items = engine
            .enroll_matching(seq.id, &LeadFilter::default(), 10, wednesday())
            .unwrap();
        assert_eq!(items.len(), 2);
        for item in &items {
            if item.lead_id == bad.id {
                assert!(item.outcome.is_err());
            } else {
                assert!(item.enrollment().is_some());
            }
        }
    }

    #[test]
    fn missing_sequence_stops_enrollment() {
        let h = harness();
        let (lead, _) = seeded(&h, cold_outreach());
        let mut orphan = Enrollment::new(Uuid::new_v4(), lead.id, "t", wednesday());
        orphan.next_action_at = Some(wednesday());
        let id = orphan.id;
        h.store.insert_enrollment(orphan).unwrap();

        let stats = h.engine.process_due(wednesday()).unwrap();
        assert_eq!(stats.stopped, 1);
        let after = h.store.enrollment(id).unwrap().unwrap();
        assert_eq!(after.end_reason.as_deref(), Some(REASON_SEQUENCE_MISSING));
    }
}

//! Persistence collaborator for leads, sequences and enrollments.
//!
//! Every mutation of a single record is one read-modify-write under the
//! store's lock, so concurrent passes never observe or commit a half-applied
//! transition.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{LeadflowError, Result};
use crate::lead::{Lead, LeadFilter};
use crate::scoring::EngagementHistory;
use crate::sequence::{Enrollment, EnrollmentStatus, SequenceDefinition, TriggerType};

pub trait Store: Send + Sync {
    fn lead(&self, id: Uuid) -> Result<Option<Lead>>;

    fn save_lead(&self, lead: Lead) -> Result<()>;

    /// Apply `f` to the stored lead and return the committed copy. Nothing
    /// is written when `f` fails.
    fn update_lead(&self, id: Uuid, f: &mut dyn FnMut(&mut Lead) -> Result<()>) -> Result<Lead>;

    /// Leads without a score, newest first.
    fn unscored_leads(&self, limit: usize) -> Result<Vec<Lead>>;

    /// Leads accepted by `filter`, newest first.
    fn leads_matching(&self, filter: &LeadFilter, limit: usize) -> Result<Vec<Lead>>;

    fn sequence(&self, id: Uuid) -> Result<Option<SequenceDefinition>>;

    fn save_sequence(&self, sequence: SequenceDefinition) -> Result<()>;

    /// Active sequences listening for `trigger`.
    fn sequences_for_trigger(&self, trigger: TriggerType) -> Result<Vec<SequenceDefinition>>;

    fn enrollment(&self, id: Uuid) -> Result<Option<Enrollment>>;

    /// Insert unless an ACTIVE enrollment already exists for the same lead
    /// and sequence. Returns `false` on the duplicate.
    fn insert_enrollment(&self, enrollment: Enrollment) -> Result<bool>;

    /// Apply `f` to the stored enrollment and return the committed copy.
    /// Nothing is written when `f` fails or when the result would make a
    /// second ACTIVE enrollment for the pair.
    fn update_enrollment(
        &self,
        id: Uuid,
        f: &mut dyn FnMut(&mut Enrollment) -> Result<()>,
    ) -> Result<Enrollment>;

    /// ACTIVE enrollments with `next_action_at <= now`, oldest due first.
    fn due_enrollments(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Enrollment>>;

    fn enrollments_for_lead(&self, lead_id: Uuid) -> Result<Vec<Enrollment>>;

    /// Message counters summed over all of a lead's enrollments.
    fn engagement_history(&self, lead_id: Uuid) -> Result<EngagementHistory> {
        let history = self
            .enrollments_for_lead(lead_id)?
            .iter()
            .fold(EngagementHistory::default(), |mut acc, e| {
                acc.sent += e.sent_count;
                acc.opened += e.opened_count;
                acc.clicked += e.clicked_count;
                acc.replied += e.replied_count;
                acc
            });
        Ok(history)
    }
}

#[derive(Default)]
struct Tables {
    leads: HashMap<Uuid, Lead>,
    sequences: HashMap<Uuid, SequenceDefinition>,
    enrollments: HashMap<Uuid, Enrollment>,
}

impl Tables {
    fn has_other_active(&self, enrollment: &Enrollment) -> bool {
        self.enrollments.values().any(|e| {
            e.id != enrollment.id
                && e.lead_id == enrollment.lead_id
                && e.sequence_id == enrollment.sequence_id
                && e.status == EnrollmentStatus::Active
        })
    }
}

/// In-process store backed by hash maps.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| LeadflowError::Storage("store lock poisoned".into()))
    }
}

impl Store for MemoryStore {
    fn lead(&self, id: Uuid) -> Result<Option<Lead>> {
        Ok(self.tables()?.leads.get(&id).cloned())
    }

    fn save_lead(&self, lead: Lead) -> Result<()> {
        self.tables()?.leads.insert(lead.id, lead);
        Ok(())
    }

    fn update_lead(&self, id: Uuid, f: &mut dyn FnMut(&mut Lead) -> Result<()>) -> Result<Lead> {
        let mut tables = self.tables()?;
        let current = tables
            .leads
            .get(&id)
            .ok_or_else(|| LeadflowError::not_found("lead", id))?;
        let mut updated = current.clone();
        f(&mut updated)?;
        tables.leads.insert(id, updated.clone());
        Ok(updated)
    }

    fn unscored_leads(&self, limit: usize) -> Result<Vec<Lead>> {
        let tables = self.tables()?;
        let mut leads: Vec<Lead> = tables
            .leads
            .values()
            .filter(|l| l.score.is_none())
            .cloned()
            .collect();
        leads.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        leads.truncate(limit);
        Ok(leads)
    }

    fn leads_matching(&self, filter: &LeadFilter, limit: usize) -> Result<Vec<Lead>> {
        let tables = self.tables()?;
        let mut leads: Vec<Lead> = tables
            .leads
            .values()
            .filter(|l| filter.matches(l))
            .cloned()
            .collect();
        leads.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        leads.truncate(limit);
        Ok(leads)
    }

    fn sequence(&self, id: Uuid) -> Result<Option<SequenceDefinition>> {
        Ok(self.tables()?.sequences.get(&id).cloned())
    }

    fn save_sequence(&self, sequence: SequenceDefinition) -> Result<()> {
        sequence.validate()?;
        self.tables()?.sequences.insert(sequence.id, sequence);
        Ok(())
    }

    fn sequences_for_trigger(&self, trigger: TriggerType) -> Result<Vec<SequenceDefinition>> {
        let tables = self.tables()?;
        let mut found: Vec<SequenceDefinition> = tables
            .sequences
            .values()
            .filter(|s| s.active && s.trigger == trigger)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(found)
    }

    fn enrollment(&self, id: Uuid) -> Result<Option<Enrollment>> {
        Ok(self.tables()?.enrollments.get(&id).cloned())
    }

    fn insert_enrollment(&self, enrollment: Enrollment) -> Result<bool> {
        let mut tables = self.tables()?;
        if tables.has_other_active(&enrollment) {
            return Ok(false);
        }
        tables.enrollments.insert(enrollment.id, enrollment);
        Ok(true)
    }

    fn update_enrollment(
        &self,
        id: Uuid,
        f: &mut dyn FnMut(&mut Enrollment) -> Result<()>,
    ) -> Result<Enrollment> {
        let mut tables = self.tables()?;
        let current = tables
            .enrollments
            .get(&id)
            .ok_or_else(|| LeadflowError::not_found("enrollment", id))?;
        let mut updated = current.clone();
        f(&mut updated)?;
        if updated.status == EnrollmentStatus::Active && tables.has_other_active(&updated) {
            return Err(LeadflowError::Validation(format!(
                "lead {} already has an active enrollment in sequence {}",
                updated.lead_id, updated.sequence_id
            )));
        }
        tables.enrollments.insert(id, updated.clone());
        Ok(updated)
    }

    fn due_enrollments(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Enrollment>> {
        let tables = self.tables()?;
        let mut due: Vec<Enrollment> = tables
            .enrollments
            .values()
            .filter(|e| e.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|e| (e.next_action_at, e.enrolled_at));
        due.truncate(limit);
        Ok(due)
    }

    fn enrollments_for_lead(&self, lead_id: Uuid) -> Result<Vec<Enrollment>> {
        let tables = self.tables()?;
        Ok(tables
            .enrollments
            .values()
            .filter(|e| e.lead_id == lead_id)
            .cloned()
            .collect())
    }
}

/// Test double that fails lookups of chosen leads and sequences.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct FaultyStore {
    pub inner: MemoryStore,
    broken: Mutex<std::collections::HashSet<Uuid>>,
}

#[cfg(test)]
impl FaultyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn break_id(&self, id: Uuid) {
        self.broken.lock().unwrap().insert(id);
    }

    fn check(&self, id: Uuid) -> Result<()> {
        if self.broken.lock().unwrap().contains(&id) {
            return Err(LeadflowError::Storage(format!("record {id} unavailable")));
        }
        Ok(())
    }
}

#[cfg(test)]
impl Store for FaultyStore {
    fn lead(&self, id: Uuid) -> Result<Option<Lead>> {
        self.check(id)?;
        self.inner.lead(id)
    }

    fn save_lead(&self, lead: Lead) -> Result<()> {
        self.inner.save_lead(lead)
    }

    fn update_lead(&self, id: Uuid, f: &mut dyn FnMut(&mut Lead) -> Result<()>) -> Result<Lead> {
        self.check(id)?;
        self.inner.update_lead(id, f)
    }

    fn unscored_leads(&self, limit: usize) -> Result<Vec<Lead>> {
        self.inner.unscored_leads(limit)
    }

    fn leads_matching(&self, filter: &LeadFilter, limit: usize) -> Result<Vec<Lead>> {
        self.inner.leads_matching(filter, limit)
    }

    fn sequence(&self, id: Uuid) -> Result<Option<SequenceDefinition>> {
        self.check(id)?;
        self.inner.sequence(id)
    }

    fn save_sequence(&self, sequence: SequenceDefinition) -> Result<()> {
        self.inner.save_sequence(sequence)
    }

    fn sequences_for_trigger(&self, trigger: TriggerType) -> Result<Vec<SequenceDefinition>> {
        self.inner.sequences_for_trigger(trigger)
    }

    fn enrollment(&self, id: Uuid) -> Result<Option<Enrollment>> {
        self.inner.enrollment(id)
    }

    fn insert_enrollment(&self, enrollment: Enrollment) -> Result<bool> {
        self.inner.insert_enrollment(enrollment)
    }

    fn update_enrollment(
        &self,
        id: Uuid,
        f: &mut dyn FnMut(&mut Enrollment) -> Result<()>,
    ) -> Result<Enrollment> {
        self.inner.update_enrollment(id, f)
    }

    fn due_enrollments(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Enrollment>> {
        self.inner.due_enrollments(now, limit)
    }

    fn enrollments_for_lead(&self, lead_id: Uuid) -> Result<Vec<Enrollment>> {
        self.inner.enrollments_for_lead(lead_id)
    }
}

//! Delivery work queue.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{LeadflowError, Result};
use crate::sequence::{AttemptStatus, DeliveryAttempt};

pub trait WorkQueue: Send + Sync {
    /// Store a new work item. Idempotent by key: returns `false` and leaves
    /// the existing item untouched when the key is already known.
    fn enqueue(&self, attempt: DeliveryAttempt) -> Result<bool>;

    /// PENDING items with `not_before <= now`, oldest first.
    fn dequeue_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<DeliveryAttempt>>;

    fn get(&self, key: &str) -> Result<Option<DeliveryAttempt>>;

    fn update(&self, attempt: DeliveryAttempt) -> Result<()>;

    /// Items created for `sequence_id` at or after `since`.
    fn count_since(&self, sequence_id: Uuid, since: DateTime<Utc>) -> Result<u32>;
}

#[derive(Default)]
pub struct MemoryQueue {
    items: Mutex<HashMap<String, DeliveryAttempt>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn items(&self) -> Result<MutexGuard<'_, HashMap<String, DeliveryAttempt>>> {
        self.items
            .lock()
            .map_err(|_| LeadflowError::Storage("queue lock poisoned".into()))
    }

    pub fn all(&self) -> Result<Vec<DeliveryAttempt>> {
        let mut all: Vec<DeliveryAttempt> = self.items()?.values().cloned().collect();
        all.sort_by_key(|a| (a.created_at, a.step_number));
        Ok(all)
    }
}

impl WorkQueue for MemoryQueue {
    fn enqueue(&self, attempt: DeliveryAttempt) -> Result<bool> {
        let mut items = self.items()?;
        if items.contains_key(&attempt.idempotency_key) {
            return Ok(false);
        }
        items.insert(attempt.idempotency_key.clone(), attempt);
        Ok(true)
    }

    fn dequeue_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<DeliveryAttempt>> {
        let items = self.items()?;
        let mut due: Vec<DeliveryAttempt> = items
            .values()
            .filter(|a| a.status == AttemptStatus::Pending && a.not_before <= now)
            .cloned()
            .collect();
        due.sort_by_key(|a| (a.not_before, a.created_at));
        due.truncate(limit);
        Ok(due)
    }

    fn get(&self, key: &str) -> Result<Option<DeliveryAttempt>> {
        Ok(self.items()?.get(key).cloned())
    }

    fn update(&self, attempt: DeliveryAttempt) -> Result<()> {
        let mut items = self.items()?;
        match items.get_mut(&attempt.idempotency_key) {
            Some(slot) => {
                *slot = attempt;
                Ok(())
            }
            None => Err(LeadflowError::not_found("delivery attempt", &attempt.idempotency_key)),
        }
    }

    fn count_since(&self, sequence_id: Uuid, since: DateTime<Utc>) -> Result<u32> {
        let count = self
            .items()?
            .values()
            .filter(|a| a.sequence_id == sequence_id && a.created_at >= since)
            .count();
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::Enrollment;
    use chrono::TimeDelta;

    fn attempt(step: u32, now: DateTime<Utc>) -> DeliveryAttempt {
        let e = Enrollment::new(Uuid::new_v4(), Uuid::new_v4(), "t", now);
        DeliveryAttempt::new(&e, step, "tpl", now)
    }

    #[test]
    fn enqueue_is_idempotent_by_key() {
        let q = MemoryQueue::new();
        let now = Utc::now();
        let a = attempt(1, now);
        let mut again = a.clone();
        again.template_id = "other".into();
        assert!(q.enqueue(a.clone()).unwrap());
        assert!(!q.enqueue(again).unwrap());
        assert_eq!(q.get(&a.idempotency_key).unwrap().unwrap().template_id, "tpl");
    }

    #[test]
    fn dequeue_only_pending_and_due() {
        let q = MemoryQueue::new();
        let now = Utc::now();
        let due = attempt(1, now);
        let mut later = attempt(1, now);
        later.not_before = now + TimeDelta::minutes(5);
        let mut sent = attempt(1, now);
        sent.status = AttemptStatus::Sent;
        for a in [due.clone(), later, sent] {
            q.enqueue(a).unwrap();
        }
        let got = q.dequeue_due(now, 10).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].idempotency_key, due.idempotency_key);
    }

    #[test]
    fn update_unknown_key_fails() {
        let q = MemoryQueue::new();
        assert!(q.update(attempt(1, Utc::now())).unwrap_err().is_not_found());
    }

    #[test]
    fn count_since_filters_sequence_and_time() {
        let q = MemoryQueue::new();
        let now = Utc::now();
        let a = attempt(1, now);
        let seq = a.sequence_id;
        let mut old = attempt(2, now - TimeDelta::days(1));
        old.sequence_id = seq;
        q.enqueue(a).unwrap();
        q.enqueue(old).unwrap();
        q.enqueue(attempt(1, now)).unwrap();
        assert_eq!(q.count_since(seq, now - TimeDelta::hours(1)).unwrap(), 1);
    }
}

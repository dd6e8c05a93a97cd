//! Delivery dispatcher.
//!
//! Pulls PENDING work items, renders them, and hands them to the transport
//! with bounded retries. The final result of each item is reported back to
//! the [`SequenceEngine`].

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::automation::SequenceEngine;
use crate::clock::Clock;
use crate::config::DispatcherConfig;
use crate::error::Result;
use crate::lead::Lead;
use crate::queue::WorkQueue;
use crate::render::{MergeData, Renderer};
use crate::sequence::{AttemptStatus, DeliveryAttempt, DeliveryOutcome};
use crate::store::Store;
use crate::transport::{DeliveryError, OutboundMessage, Transport};

/// Counters for one `send_due` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchStats {
    pub attempted: usize,
    pub sent: usize,
    pub failed: usize,
    pub abandoned: usize,
    /// Items that were no longer PENDING when their turn came.
    pub skipped: usize,
    pub errors: usize,
    /// Another pass was running; nothing was done.
    pub busy: bool,
}

pub struct DeliveryDispatcher<T> {
    store: Arc<dyn Store>,
    queue: Arc<dyn WorkQueue>,
    engine: Arc<SequenceEngine>,
    renderer: Arc<dyn Renderer>,
    transport: T,
    clock: Arc<dyn Clock>,
    config: DispatcherConfig,
    batch_lock: Mutex<()>,
}

impl<T: Transport> DeliveryDispatcher<T> {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn WorkQueue>,
        engine: Arc<SequenceEngine>,
        renderer: Arc<dyn Renderer>,
        transport: T,
        clock: Arc<dyn Clock>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            queue,
            engine,
            renderer,
            transport,
            clock,
            config,
            batch_lock: Mutex::new(()),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Deliver up to `limit` due work items (capped by the configured batch
    /// limit), pacing sends by the minimum send interval.
    pub async fn send_due(&self, limit: usize) -> Result<DispatchStats> {
        let mut stats = DispatchStats::default();
        let Ok(_batch) = self.batch_lock.try_lock() else {
            debug!("send_due already running");
            stats.busy = true;
            return Ok(stats);
        };

        let limit = limit.min(self.config.batch_limit);
        let due = self.queue.dequeue_due(self.clock.now(), limit)?;
        let interval = self.config.min_send_interval();

        for (i, item) in due.into_iter().enumerate() {
            if i > 0 && !interval.is_zero() {
                sleep(interval).await;
            }

            // Re-read: a previous run may have finished this item already.
            let current = match self.queue.get(&item.idempotency_key)? {
                Some(current) if current.status == AttemptStatus::Pending => current,
                _ => {
                    stats.skipped += 1;
                    continue;
                }
            };

            stats.attempted += 1;
            let key = current.idempotency_key.clone();
            let outcome = match self.dispatch(current).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    stats.errors += 1;
                    warn!(key = %key, error = %e, "dispatch failed");
                    continue;
                }
            };

            match &outcome {
                DeliveryOutcome::Sent { .. } => stats.sent += 1,
                DeliveryOutcome::PermanentFailure { .. } => stats.failed += 1,
                DeliveryOutcome::Abandoned { .. } => stats.abandoned += 1,
            }
            if let Err(e) = self.engine.record_outcome(&key, &outcome, self.clock.now()) {
                stats.errors += 1;
                warn!(key = %key, error = %e, "failed to record delivery outcome");
            }
        }

        if stats.attempted > 0 {
            info!(
                attempted = stats.attempted,
                sent = stats.sent,
                failed = stats.failed,
                abandoned = stats.abandoned,
                "delivery pass finished"
            );
        }
        Ok(stats)
    }

    async fn dispatch(&self, mut attempt: DeliveryAttempt) -> Result<DeliveryOutcome> {
        let Some(lead) = self.store.lead(attempt.lead_id)? else {
            return Ok(DeliveryOutcome::PermanentFailure {
                reason: "lead no longer exists".into(),
            });
        };
        let Some(to) = Lead::field(&lead.email).map(str::to_string) else {
            return Ok(DeliveryOutcome::PermanentFailure {
                reason: "lead has no email address".into(),
            });
        };

        let rendered = match self
            .renderer
            .render(&attempt.template_id, &MergeData::from_lead(&lead))
        {
            Ok(rendered) => rendered,
            Err(e) => {
                return Ok(DeliveryOutcome::Abandoned {
                    reason: format!("render failed: {e}"),
                });
            }
        };
        attempt.subject = Some(rendered.subject.clone());
        attempt.body = Some(rendered.body.clone());
        attempt.tracking_refs = rendered.tracking_refs.clone();
        self.queue.update(attempt.clone())?;

        let message = OutboundMessage {
            to,
            from: self.config.from_address.clone(),
            subject: rendered.subject,
            body: rendered.body,
            tracking_refs: rendered.tracking_refs,
            idempotency_key: attempt.idempotency_key.clone(),
        };

        let max_attempts = self.config.max_attempts.max(1);
        let mut last_error = String::new();
        for n in 1..=max_attempts {
            attempt.attempts += 1;
            self.queue.update(attempt.clone())?;

            let wait = match timeout(self.config.request_timeout(), self.transport.deliver(&message)).await {
                Ok(Ok(receipt)) => {
                    return Ok(DeliveryOutcome::Sent {
                        provider_id: receipt.provider_id,
                    });
                }
                Ok(Err(e)) if !e.is_transient() => {
                    return Ok(DeliveryOutcome::PermanentFailure {
                        reason: e.to_string(),
                    });
                }
                Ok(Err(e)) => {
                    last_error = e.to_string();
                    self.backoff(n, &e)
                }
                Err(_) => {
                    last_error = format!(
                        "timed out after {}s",
                        self.config.request_timeout().as_secs()
                    );
                    self.config.delay_for_attempt(n)
                }
            };

            if n < max_attempts {
                warn!(
                    key = %attempt.idempotency_key,
                    attempt = n,
                    max_attempts,
                    delay_ms = wait.as_millis() as u64,
                    error = %last_error,
                    "transient delivery failure, retrying"
                );
                sleep(wait).await;
            }
        }

        Ok(DeliveryOutcome::Abandoned {
            reason: format!("gave up after {max_attempts} attempts: {last_error}"),
        })
    }

    /// Exponential backoff, stretched to the provider's retry-after.
    fn backoff(&self, attempt: u32, error: &DeliveryError) -> Duration {
        let base = self.config.delay_for_attempt(attempt);
        match error.retry_after_ms() {
            Some(ms) => base.max(Duration::from_millis(ms)),
            None => base,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::AutomationConfig;
    use crate::lead::LeadStatus;
    use crate::queue::MemoryQueue;
    use crate::render::{Template, TemplateRenderer};
    use crate::sequence::{SequenceDefinition, SequenceStep, StepDelay, TriggerType, idempotency_key};
    use crate::store::MemoryStore;
    use crate::transport::DeliveryReceipt;
    use chrono::{DateTime, TimeZone, Utc};
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use uuid::Uuid;

    #[derive(Default)]
    struct ScriptedTransport {
        replies: StdMutex<VecDeque<std::result::Result<DeliveryReceipt, DeliveryError>>>,
        sent: StdMutex<Vec<OutboundMessage>>,
        delay: Duration,
    }

    impl ScriptedTransport {
        fn with(replies: Vec<std::result::Result<DeliveryReceipt, DeliveryError>>) -> Self {
            Self {
                replies: StdMutex::new(replies.into()),
                ..Default::default()
            }
        }

        fn calls(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    impl Transport for ScriptedTransport {
        async fn deliver(
            &self,
            message: &OutboundMessage,
        ) -> std::result::Result<DeliveryReceipt, DeliveryError> {
            if !self.delay.is_zero() {
                sleep(self.delay).await;
            }
            let n = {
                let mut sent = self.sent.lock().unwrap();
                sent.push(message.clone());
                sent.len()
            };
            let reply = self.replies.lock().unwrap().pop_front();
            reply.unwrap_or_else(|| {
                Ok(DeliveryReceipt {
                    provider_id: format!("msg-{n}"),
                })
            })
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        queue: Arc<MemoryQueue>,
        dispatcher: DeliveryDispatcher<ScriptedTransport>,
        lead_id: Uuid,
        key: String,
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 14, 10, 0, 0).unwrap()
    }

    fn fixture(transport: ScriptedTransport, email: Option<&str>) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let engine = Arc::new(SequenceEngine::new(
            store.clone(),
            queue.clone(),
            AutomationConfig::default(),
        ));

        let mut lead = Lead::new("Rosa Park");
        lead.email = email.map(str::to_string);
        store.save_lead(lead.clone()).unwrap();
        let seq = SequenceDefinition::new("intro", TriggerType::Manual).with_step(SequenceStep {
            step_number: 1,
            name: "hello".into(),
            delay: StepDelay::default(),
            template_id: "hello".into(),
            send_conditions: vec![],
            skip_conditions: vec![],
            stop_on_reply: false,
        });
        store.save_sequence(seq.clone()).unwrap();
        let enrollment = engine
            .enroll(lead.id, seq.id, "test", now())
            .unwrap()
            .enrollment()
            .cloned()
            .unwrap();
        engine.process_due(now()).unwrap();

        let mut renderer = TemplateRenderer::default();
        renderer.insert(
            "hello",
            Template {
                subject: "Hi {{first_name}}".into(),
                body: "Quick hello from us.".into(),
            },
        );
        let config = DispatcherConfig {
            api_key: "test".into(),
            ..Default::default()
        };
        let dispatcher = DeliveryDispatcher::new(
            store.clone(),
            queue.clone(),
            engine,
            Arc::new(renderer),
            transport,
            Arc::new(ManualClock::new(now())),
            config,
        );
        Fixture {
            store,
            queue,
            dispatcher,
            lead_id: lead.id,
            key: idempotency_key(enrollment.id, 1),
        }
    }

    fn attempt(f: &Fixture) -> DeliveryAttempt {
        f.queue.get(&f.key).unwrap().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_and_records_sent() {
        let f = fixture(ScriptedTransport::default(), Some("rosa@park.io"));
        let stats = f.dispatcher.send_due(10).await.unwrap();
        assert_eq!(stats.sent, 1);

        let a = attempt(&f);
        assert_eq!(a.status, AttemptStatus::Sent);
        assert_eq!(a.attempts, 1);
        assert_eq!(a.subject.as_deref(), Some("Hi Rosa"));
        assert_eq!(a.provider_message_id.as_deref(), Some("msg-1"));

        let sent = f.dispatcher.transport().sent.lock().unwrap().clone();
        assert_eq!(sent[0].idempotency_key, f.key);
        assert_eq!(sent[0].to, "rosa@park.io");

        let lead = f.store.lead(f.lead_id).unwrap().unwrap();
        assert_eq!(lead.status, LeadStatus::Contacted);
    }

    #[tokio::test(start_paused = true)]
    async fn sent_item_is_never_resent() {
        let f = fixture(ScriptedTransport::default(), Some("rosa@park.io"));
        f.dispatcher.send_due(10).await.unwrap();
        let again = f.dispatcher.send_due(10).await.unwrap();
        assert_eq!(again.attempted, 0);
        assert_eq!(f.dispatcher.transport().calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_is_retried() {
        let transport = ScriptedTransport::with(vec![Err(DeliveryError::Transient(
            "status 503".into(),
        ))]);
        let f = fixture(transport, Some("rosa@park.io"));
        let stats = f.dispatcher.send_due(10).await.unwrap();
        assert_eq!(stats.sent, 1);
        assert_eq!(attempt(&f).attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_waits_for_retry_after() {
        let transport = ScriptedTransport::with(vec![Err(DeliveryError::RateLimited {
            retry_after_ms: 5000,
        })]);
        let f = fixture(transport, Some("rosa@park.io"));
        let started = tokio::time::Instant::now();
        f.dispatcher.send_due(10).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(5000));
        assert_eq!(attempt(&f).status, AttemptStatus::Sent);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_abandon() {
        let transport = ScriptedTransport::with(
            (0..3)
                .map(|_| Err(DeliveryError::Transient("status 502".into())))
                .collect(),
        );
        let f = fixture(transport, Some("rosa@park.io"));
        let stats = f.dispatcher.send_due(10).await.unwrap();
        assert_eq!(stats.abandoned, 1);

        let a = attempt(&f);
        assert_eq!(a.status, AttemptStatus::Abandoned);
        assert_eq!(a.attempts, 3);
        assert!(a.failure_reason.unwrap().contains("gave up after 3 attempts"));
        let enrollment = f.store.enrollment(a.enrollment_id).unwrap().unwrap();
        assert_eq!(enrollment.failed_count, 1);
        assert_ne!(f.store.lead(f.lead_id).unwrap().unwrap().status, LeadStatus::Invalid);
    }

    #[tokio::test(start_paused = true)]
    async fn rejection_fails_without_retry() {
        let transport = ScriptedTransport::with(vec![Err(DeliveryError::Rejected {
            status: 422,
            message: "hard bounce".into(),
        })]);
        let f = fixture(transport, Some("rosa@park.io"));
        let stats = f.dispatcher.send_due(10).await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(f.dispatcher.transport().calls(), 1);

        let a = attempt(&f);
        assert_eq!(a.status, AttemptStatus::Failed);
        assert!(a.failure_reason.unwrap().contains("hard bounce"));
        assert_eq!(f.store.lead(f.lead_id).unwrap().unwrap().status, LeadStatus::Invalid);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_email_is_permanent() {
        let f = fixture(ScriptedTransport::default(), None);
        let stats = f.dispatcher.send_due(10).await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(f.dispatcher.transport().calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_template_abandons_without_sending() {
        let mut f = fixture(ScriptedTransport::default(), Some("rosa@park.io"));
        f.dispatcher.renderer = Arc::new(TemplateRenderer::default());
        let stats = f.dispatcher.send_due(10).await.unwrap();
        assert_eq!(stats.abandoned, 1);
        assert_eq!(f.dispatcher.transport().calls(), 0);

        let a = attempt(&f);
        assert!(a.failure_reason.unwrap().starts_with("render failed"));
        assert_ne!(f.store.lead(f.lead_id).unwrap().unwrap().status, LeadStatus::Invalid);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_pass_reports_busy() {
        let transport = ScriptedTransport {
            delay: Duration::from_secs(1),
            ..Default::default()
        };
        let f = fixture(transport, Some("rosa@park.io"));
        let (first, second) = tokio::join!(f.dispatcher.send_due(10), f.dispatcher.send_due(10));
        assert_eq!(first.unwrap().sent, 1);
        assert!(second.unwrap().busy);
    }
}

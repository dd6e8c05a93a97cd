//! Periodic driver for sequence processing and delivery.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::automation::{ProcessStats, SequenceEngine};
use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::dispatcher::{DeliveryDispatcher, DispatchStats};
use crate::transport::Transport;

/// What one tick did. A side is `None` when its pass failed.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TickReport {
    pub process: Option<ProcessStats>,
    pub dispatch: Option<DispatchStats>,
}

pub struct Scheduler<T> {
    engine: Arc<SequenceEngine>,
    dispatcher: Arc<DeliveryDispatcher<T>>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
}

impl<T: Transport> Scheduler<T> {
    pub fn new(
        engine: Arc<SequenceEngine>,
        dispatcher: Arc<DeliveryDispatcher<T>>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            engine,
            dispatcher,
            clock,
            config,
        }
    }

    /// Run one `process_due` pass (on a blocking worker) alongside one
    /// `send_due` pass. Errors are logged and reported as `None`.
    pub async fn tick(&self) -> TickReport {
        let engine = Arc::clone(&self.engine);
        let now = self.clock.now();
        let process = tokio::task::spawn_blocking(move || engine.process_due(now));
        let dispatch = self.dispatcher.send_due(self.dispatcher.config().batch_limit);
        let (process, dispatch) = tokio::join!(process, dispatch);

        let process = match process {
            Ok(Ok(stats)) => Some(stats),
            Ok(Err(e)) => {
                error!(error = %e, "process_due failed");
                None
            }
            Err(e) => {
                error!(error = %e, "process_due worker panicked");
                None
            }
        };
        let dispatch = match dispatch {
            Ok(stats) => Some(stats),
            Err(e) => {
                error!(error = %e, "send_due failed");
                None
            }
        };

        debug!(?process, ?dispatch, "scheduler tick");
        TickReport { process, dispatch }
    }

    /// Tick every `tick_secs` until `shutdown` flips to `true` or its sender
    /// goes away. Returns the number of ticks run.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> u64 {
        let period = Duration::from_secs(self.config.tick_secs.max(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(tick_secs = period.as_secs(), "scheduler started");

        let mut ticks = 0;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                    ticks += 1;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!(ticks, "scheduler stopped");
        ticks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{AutomationConfig, DispatcherConfig};
    use crate::lead::Lead;
    use crate::queue::MemoryQueue;
    use crate::render::{Template, TemplateRenderer};
    use crate::sequence::{AttemptStatus, SequenceDefinition, SequenceStep, StepDelay, TriggerType};
    use crate::store::{MemoryStore, Store};
    use crate::transport::{DeliveryError, DeliveryReceipt, OutboundMessage};
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingTransport {
        calls: AtomicUsize,
    }

    impl Transport for CountingTransport {
        async fn deliver(&self, _: &OutboundMessage) -> Result<DeliveryReceipt, DeliveryError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(DeliveryReceipt {
                provider_id: format!("msg-{n}"),
            })
        }
    }

    fn scheduler(tick_secs: u64) -> (Scheduler<CountingTransport>, Arc<MemoryQueue>) {
        let now = Utc.with_ymd_and_hms(2026, 10, 14, 10, 0, 0).unwrap();
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let clock = Arc::new(ManualClock::new(now));
        let engine = Arc::new(SequenceEngine::new(
            store.clone(),
            queue.clone(),
            AutomationConfig::default(),
        ));

        let mut lead = Lead::new("Ines Duarte");
        lead.email = Some("ines@duarte.pt".into());
        store.save_lead(lead.clone()).unwrap();
        let seq = SequenceDefinition::new("welcome", TriggerType::Manual).with_step(SequenceStep {
            step_number: 1,
            name: "welcome".into(),
            delay: StepDelay::default(),
            template_id: "welcome".into(),
            send_conditions: vec![],
            skip_conditions: vec![],
            stop_on_reply: false,
        });
        store.save_sequence(seq.clone()).unwrap();
        engine.enroll(lead.id, seq.id, "test", now).unwrap();

        let mut renderer = TemplateRenderer::default();
        renderer.insert(
            "welcome",
            Template {
                subject: "Welcome {{first_name}}".into(),
                body: "Glad to meet you.".into(),
            },
        );
        let dispatcher = Arc::new(DeliveryDispatcher::new(
            store,
            queue.clone(),
            engine.clone(),
            Arc::new(renderer),
            CountingTransport::default(),
            clock.clone(),
            DispatcherConfig::default(),
        ));
        let scheduler = Scheduler::new(engine, dispatcher, clock, SchedulerConfig { tick_secs });
        (scheduler, queue)
    }

    #[tokio::test]
    async fn ticks_queue_then_deliver() {
        let (scheduler, queue) = scheduler(60);
        let first = scheduler.tick().await;
        assert_eq!(first.process.unwrap().sends_queued, 1);

        let second = scheduler.tick().await;
        let sent = first.dispatch.unwrap().sent + second.dispatch.unwrap().sent;
        assert_eq!(sent, 1);
        assert_eq!(queue.all().unwrap()[0].status, AttemptStatus::Sent);
        assert_eq!(scheduler.dispatcher.transport().calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_shutdown() {
        let (scheduler, queue) = scheduler(60);
        let (tx, rx) = watch::channel(false);
        let stop = async {
            tokio::time::sleep(Duration::from_secs(150)).await;
            tx.send(true).unwrap();
        };
        let (ticks, ()) = tokio::join!(scheduler.run(rx), stop);
        // Ticks at 0s, 60s and 120s.
        assert_eq!(ticks, 3);
        assert_eq!(queue.all().unwrap()[0].status, AttemptStatus::Sent);
    }
}

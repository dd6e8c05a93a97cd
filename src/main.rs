mod cli;
mod ui;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use cli::{Cli, Command, QualifyTarget};
use leadflow::automation::{SequenceEngine, TriggerEvent};
use leadflow::clock::{Clock, SystemClock};
use leadflow::config::LeadflowConfig;
use leadflow::dispatcher::DeliveryDispatcher;
use leadflow::fixtures::Fixtures;
use leadflow::lead::Lead;
use leadflow::qualification::{QualificationService, QualificationTier};
use leadflow::queue::MemoryQueue;
use leadflow::scheduler::Scheduler;
use leadflow::scoring::ScoringEngine;
use leadflow::sequence::TriggerType;
use leadflow::store::{MemoryStore, Store};
use leadflow::transport::HttpTransport;
use ui::{BulkProgress, Console};

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("leadflow={level},warn")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = LeadflowConfig::load_from(&cli.config)?;
    let console = Console::default();

    match cli.command {
        Command::Score { lead } => score(&config, &lead, cli.json, &console),
        Command::Qualify {
            fixtures,
            target,
            limit,
        } => qualify(&config, &fixtures, target, limit, cli.json, &console).await,
        Command::Run { fixtures, once } => run(&config, &fixtures, once, cli.json, &console).await,
        Command::Window {
            fixtures,
            sequence,
            at,
        } => window(&fixtures, sequence, at, cli.json, &console),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn display_name(lead: &Lead) -> String {
    Lead::field(&lead.name)
        .map(str::to_string)
        .unwrap_or_else(|| lead.id.to_string())
}

fn load_fixtures(path: &Path) -> Result<Fixtures> {
    let mut fixtures = Fixtures::load(path)?;
    fixtures.normalize(Utc::now());
    Ok(fixtures)
}

fn score(config: &LeadflowConfig, path: &Path, json: bool, console: &Console) -> Result<()> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let mut lead: Lead = serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse lead from {}", path.display()))?;
    if lead.id.is_nil() {
        lead.id = Uuid::new_v4();
    }

    let result = ScoringEngine::new(config.scoring.clone()).score(&lead);
    if json {
        print_json(&result)
    } else {
        console.print_score(&result);
        Ok(())
    }
}

async fn qualify(
    config: &LeadflowConfig,
    path: &Path,
    target: QualifyTarget,
    limit: usize,
    json: bool,
    console: &Console,
) -> Result<()> {
    let fixtures = load_fixtures(path)?;
    let store = Arc::new(MemoryStore::new());
    fixtures.install(store.as_ref())?;
    let service =
        QualificationService::new(config.qualification.clone(), store.clone(), Arc::new(SystemClock));

    if let Some(id) = target.lead {
        let result = service.qualify(id)?;
        if json {
            return print_json(&result);
        }
        let lead = store.lead(id)?.context("qualified lead disappeared")?;
        console.print_qualification(&display_name(&lead), &result);
        return Ok(());
    }

    let progress = (!json).then(|| BulkProgress::start(limit.min(fixtures.leads.len()) as u64));
    let items = service
        .bulk_qualify_each(limit, |item| {
            if let Some(p) = &progress {
                p.item(item);
            }
        })
        .await?;
    if let Some(p) = &progress {
        p.finish();
    }

    if json {
        let results: Vec<_> = items.iter().filter_map(|i| i.outcome.as_ref().ok()).collect();
        return print_json(&results);
    }
    for item in &items {
        let name = store
            .lead(item.lead_id)?
            .map(|l| display_name(&l))
            .unwrap_or_else(|| item.lead_id.to_string());
        match &item.outcome {
            Ok(result) => console.print_qualification(&name, result),
            Err(e) => console.print_failure(&name, e),
        }
    }
    Ok(())
}

async fn run(
    config: &LeadflowConfig,
    path: &Path,
    once: bool,
    json: bool,
    console: &Console,
) -> Result<()> {
    let fixtures = load_fixtures(path)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(MemoryQueue::new());
    let renderer = fixtures.install(store.as_ref())?;

    let service = QualificationService::new(config.qualification.clone(), store.clone(), clock.clone());
    let engine = Arc::new(SequenceEngine::new(
        store.clone(),
        queue.clone(),
        config.automation.clone(),
    ));

    let mut enrolled = 0;
    for item in service.bulk_qualify(config.qualification.bulk_limit_max).await? {
        let Ok(result) = item.outcome else { continue };
        if result.tier == QualificationTier::Unqualified {
            continue;
        }
        let event = TriggerEvent {
            lead_id: item.lead_id,
            trigger: TriggerType::LeadQualified,
            payload: serde_json::json!({ "tier": result.tier }),
        };
        let triggered = engine.handle_event(&event, clock.now())?;
        enrolled += triggered.iter().filter(|t| t.enrollment().is_some()).count();
    }
    info!(enrolled, "qualified leads enrolled");

    let transport = HttpTransport::new(&config.dispatcher)
        .context("failed to build the delivery transport")?;
    info!(endpoint = transport.endpoint(), "delivering through HTTP transport");
    let dispatcher = Arc::new(DeliveryDispatcher::new(
        store,
        queue,
        engine.clone(),
        Arc::new(renderer),
        transport,
        clock.clone(),
        config.dispatcher.clone(),
    ));
    let scheduler = Scheduler::new(engine, dispatcher, clock, config.scheduler.clone());

    if once {
        let report = scheduler.tick().await;
        if json {
            return print_json(&report);
        }
        console.print_tick(&report);
        return Ok(());
    }

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("received Ctrl+C, shutting down"),
            Err(e) => warn!(error = %e, "failed to listen for Ctrl+C"),
        }
        let _ = tx.send(true);
    });
    scheduler.run(rx).await;
    Ok(())
}

fn window(path: &Path, sequence_id: Uuid, at: DateTime<Utc>, json: bool, console: &Console) -> Result<()> {
    let fixtures = load_fixtures(path)?;
    let sequence = fixtures
        .sequences
        .iter()
        .find(|s| s.id == sequence_id)
        .with_context(|| format!("sequence {sequence_id} not found in {}", path.display()))?;
    sequence.window.validate()?;

    let adjusted = sequence.window.adjust(at);
    if json {
        return print_json(&serde_json::json!({ "requested": at, "adjusted": adjusted }));
    }
    console.print_window(at, adjusted);
    Ok(())
}

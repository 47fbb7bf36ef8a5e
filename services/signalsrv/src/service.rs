//! Service assembly: configuration in, running supervisor out

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use signal_arbiter::{Arbiter, ArbiterSupervisor, EventLedger, JsonLinesSink, SystemClock};
use signal_rules::{default_rules, RuleStore};

use crate::config::Config;

/// Build the arbiter and register the configured topology
pub fn build_arbiter(config: &Config) -> Result<Arc<Arbiter>> {
    let rules = if config.rules.is_empty() {
        let rules = default_rules();
        info!("No rules configured, using {} built-in rules", rules.len());
        rules
    } else {
        config.rules.clone()
    };
    let store = RuleStore::new(rules).context("invalid rule set")?;

    let ledger = EventLedger::new();
    if let Some(path) = &config.ledger.export_path {
        let sink = JsonLinesSink::open(path)
            .with_context(|| format!("failed to open ledger export {:?}", path))?;
        ledger.add_sink(Arc::new(sink));
        info!("Ledger export: {:?}", path);
    }

    let arbiter = Arbiter::new(
        config.arbiter_settings(),
        Arc::new(store),
        Arc::new(ledger),
        Arc::new(SystemClock),
    )?;

    for intersection in &config.intersections {
        let id = intersection.id;
        arbiter
            .register_intersection(intersection.clone())
            .with_context(|| format!("failed to register intersection {}", id))?;
    }
    info!(
        "Registered {} intersections",
        arbiter.intersection_ids().len()
    );

    Ok(Arc::new(arbiter))
}

/// Run until `shutdown` is cancelled
pub async fn run(config: Config, shutdown: CancellationToken) -> Result<()> {
    let arbiter = build_arbiter(&config)?;
    let supervisor = ArbiterSupervisor::new(arbiter.clone(), config.tick_interval());
    let workers = supervisor.start()?;
    info!(
        "{} running: {} workers, tick {:?}",
        config.service.name,
        workers,
        config.tick_interval()
    );

    shutdown.cancelled().await;

    info!("Stopping workers...");
    supervisor.stop().await;
    info!(
        "{} stopped ({} ledger entries)",
        config.service.name,
        arbiter.ledger().len()
    );
    Ok(())
}

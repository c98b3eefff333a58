// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod bench;
mod cli;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use switchboard_config::Persister;
use switchboard_core::{stats_sink_from_config, Dispatcher};
use switchboard_endpoint::{
    ClientManager, DynamicSorter, Endpoint, EndpointRegistry, HealthChecker, InactiveThresholds,
};
use switchboard_server::AppState;
use switchboard_tagging::TaggingPipeline;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match &cli.command {
        Some(Commands::ShowConfig) => show_config(&cli),
        Some(Commands::Bench(args)) => bench::run(args, cli.config.as_deref()).await,
        Some(Commands::Serve) | None => serve(&cli).await,
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        // Load and I/O failures exit 1; clap already exits 2 on bad args.
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init();
}

fn config_path(cli: &Cli) -> PathBuf {
    cli.config.clone().unwrap_or_else(|| {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config/switchboard/config.yaml")
    })
}

fn show_config(cli: &Cli) -> anyhow::Result<()> {
    let config = switchboard_config::load(&config_path(cli))?;
    println!("{}", serde_yaml::to_string(&config)?);
    Ok(())
}

async fn serve(cli: &Cli) -> anyhow::Result<()> {
    let path = config_path(cli);
    let config = switchboard_config::load(&path)?;

    let clients = Arc::new(ClientManager::new()?);
    let registry = Arc::new(EndpointRegistry::new(
        config.endpoints.clone(),
        InactiveThresholds {
            failure_threshold: config.health.failure_threshold,
            min_samples: config.health.min_samples,
        },
    ));
    let persister = Persister::spawn(config.clone(), path, &config.persistence);

    // Learned endpoint fields flow back into the config file through the
    // persister; the write-behind throttle coalesces the churn.
    {
        let persister = persister.clone();
        registry.set_learned_callback(Arc::new(move |ep: &Endpoint| {
            persister.with_config(|cfg| {
                if let Some(entry) = cfg.endpoints.iter_mut().find(|e| e.name == ep.name) {
                    entry.learned = ep.learned_snapshot();
                    if let Some(oauth) = ep.oauth_snapshot() {
                        entry.auth.oauth = Some(oauth);
                    }
                }
            });
            persister.mark_dirty();
        }));
    }

    // Dynamic sorter: re-ranks on every status change, persists the
    // renumbered priorities lazily.
    let (sorter, _resort_trigger) = DynamicSorter::new(registry.clone(), {
        let persister = persister.clone();
        Some(Arc::new(move || persister.mark_dirty()) as Arc<dyn Fn() + Send + Sync>)
    });
    tokio::spawn(sorter.run());

    let health = HealthChecker::new(registry.clone(), config.health.clone(), clients.health().clone());
    tokio::spawn(health.run());

    let tagging = TaggingPipeline::from_config(&config.tagging)?;
    let stats = stats_sink_from_config(&config.stats);
    let dispatcher = Dispatcher::new(registry.clone(), tagging, &config, clients, stats);

    switchboard_server::serve(
        &config.server.bind,
        AppState { dispatcher, registry, persister: persister.clone() },
    )
    .await?;

    // Final flush keeps every learned field across the restart.
    persister.stop().await;
    Ok(())
}

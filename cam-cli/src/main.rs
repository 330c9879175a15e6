//! CAM Descrambling Manager Scenario Runner
//!
//! Replays a scenario of CAM insertions, service starts and stops, and PMT
//! arrivals against simulated CAM slots, then prints the final registries
//! and every CAPMT that was sent.

mod runner;
mod scenario;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use runner::Runner;
use scenario::Scenario;

/// Drive the CAM descrambling manager through a scenario
#[derive(Debug, Parser)]
#[command(name = "camgate", version, about)]
struct Args {
    /// Scenario file (defaults to $XDG_CONFIG_HOME/camgate/scenario.json, then a built-in scenario)
    #[arg(short, long)]
    scenario: Option<PathBuf>,

    /// Write the built-in scenario to the config directory and exit
    #[arg(long)]
    write_default: bool,

    /// Print the report as compact JSON
    #[arg(long)]
    compact: bool,
}

fn main() -> Result<()> {
    // Include all our crates in the default filter
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "camgate=info,cam_protocol=info,cam_mux=info,cam_sim=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    if args.write_default {
        let path = args
            .scenario
            .or_else(Scenario::default_path)
            .context("could not determine scenario path")?;
        Scenario::default().save(&path)?;
        tracing::info!("Wrote default scenario to {}", path.display());
        return Ok(());
    }

    let scenario = Scenario::resolve(args.scenario.as_deref())?;
    tracing::info!("Running scenario with {} steps", scenario.steps.len());

    let report = Runner::new(&scenario).run(&scenario.steps)?;
    let json = if args.compact {
        serde_json::to_string(&report)?
    } else {
        serde_json::to_string_pretty(&report)?
    };
    println!("{}", json);

    Ok(())
}

//! acomms-sim - acoustic link simulator
//!
//! Runs two queue managers against each other over a lossy half-duplex link
//! driven by a simulated clock, then prints their queue summaries.

mod sim;

use acomms_queue::{ManualClock, QueueManagerConfig};
use anyhow::{Context, Result};
use clap::Parser;
use rand::{rngs::StdRng, SeedableRng};
use sim::{Link, LinkConfig};
use std::path::{Path, PathBuf};
use tracing::info;

const DEFAULT_NODE1: &str = include_str!("../config/node1.yaml");
const DEFAULT_NODE2: &str = include_str!("../config/node2.yaml");

#[derive(Parser, Debug)]
#[command(name = "acomms-sim")]
#[command(about = "Simulate two acoustic modem queue managers on a lossy link")]
struct Args {
    /// Configuration of the first node (built-in buoy config if omitted)
    #[arg(long)]
    node1: Option<PathBuf>,

    /// Configuration of the second node (built-in vehicle config if omitted)
    #[arg(long)]
    node2: Option<PathBuf>,

    /// Number of transmission slots to simulate
    #[arg(short, long, default_value = "100")]
    slots: u64,

    /// Probability that a data frame is lost
    #[arg(long, default_value = "0.2")]
    frame_loss: f64,

    /// Probability that an acknowledgment is lost
    #[arg(long, default_value = "0.1")]
    ack_loss: f64,

    /// Bytes per modem frame
    #[arg(long, default_value = "64")]
    frame_bytes: usize,

    /// Simulated seconds per slot
    #[arg(long, default_value = "10")]
    slot_secs: f64,

    /// Random seed
    #[arg(long, default_value = "1")]
    seed: u64,

    /// Log filter, overrides RUST_LOG
    #[arg(short, long)]
    log_level: Option<String>,
}

fn load_config(path: Option<&Path>, fallback: &str) -> Result<QueueManagerConfig> {
    match path {
        Some(path) => QueueManagerConfig::load(path)
            .with_context(|| format!("Failed to load configuration {}", path.display())),
        None => QueueManagerConfig::from_yaml_str(fallback)
            .context("Failed to parse built-in configuration"),
    }
}

fn probability(name: &str, value: f64) -> Result<f64> {
    if !(0.0..=1.0).contains(&value) {
        anyhow::bail!("{} must be between 0 and 1, got {}", name, value);
    }
    Ok(value)
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = match &args.log_level {
        Some(level) => tracing_subscriber::EnvFilter::try_new(level)
            .with_context(|| format!("Invalid log filter '{}'", level))?,
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let node1 = load_config(args.node1.as_deref(), DEFAULT_NODE1)?;
    let node2 = load_config(args.node2.as_deref(), DEFAULT_NODE2)?;

    let link_cfg = LinkConfig {
        frame_loss: probability("frame-loss", args.frame_loss)?,
        ack_loss: probability("ack-loss", args.ack_loss)?,
        frame_bytes: args.frame_bytes,
        slot_secs: args.slot_secs,
        ..LinkConfig::default()
    };

    info!(
        "Simulating {} slots between modems {} and {}",
        args.slots, node1.modem_id, node2.modem_id
    );

    let mut link = Link::new(
        node1,
        node2,
        link_cfg,
        ManualClock::default(),
        StdRng::seed_from_u64(args.seed),
    )?;
    link.run(args.slots);

    for node in [&link.a, &link.b] {
        println!("{}", node.manager);
        println!("  {}", node.stats());
    }

    info!("Simulation finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_builtin_configs_valid() {
        let node1 = load_config(None, DEFAULT_NODE1).unwrap();
        let node2 = load_config(None, DEFAULT_NODE2).unwrap();

        assert!(node1.validate().is_ok());
        assert!(node2.validate().is_ok());
        assert_ne!(node1.modem_id, node2.modem_id);
    }

    #[test]
    fn test_load_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(DEFAULT_NODE2.as_bytes()).unwrap();

        let cfg = load_config(Some(file.path()), DEFAULT_NODE1).unwrap();
        assert_eq!(cfg.queues.len(), 2);
        assert!(load_config(Some(Path::new("/nonexistent/node.yaml")), DEFAULT_NODE1).is_err());
    }

    #[test]
    fn test_probability_bounds() {
        assert!(probability("loss", 0.5).is_ok());
        assert!(probability("loss", 1.5).is_err());
        assert!(probability("loss", f64::NAN).is_err());
    }
}

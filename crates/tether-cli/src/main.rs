//! `tether-cli` – Tether demo node
//!
//! Runs a publisher and a subscriber for one topic in a single process:
//!
//! 1. Loads `~/.tether/config.toml`, writing the defaults on first run.
//! 2. Registers a publisher on every configured transport and a subscriber
//!    that connects over the first one both sides share.
//! 3. Publishes a counter every period and prints what the subscriber gets.
//! 4. On **Ctrl-C** unsubscribes, unpublishes and exits.

mod config;

use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;
use serde::{Deserialize, Serialize};
use tether_middleware::JsonMessage;
use tether_runtime::NodeRuntime;
use tokio::sync::Notify;
use tracing::{error, warn};

/// Message exchanged by the demo nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Chatter {
    seq: u64,
    sent_at_ms: i64,
    text: String,
}

impl JsonMessage for Chatter {
    const TYPE_NAME: &'static str = "tether.demo.Chatter";
}

fn main() {
    let _telemetry = tether_runtime::init_tracing("tether");

    print_banner();

    let cfg = match config::load() {
        Ok(Some(cfg)) => {
            println!("  Config loaded from {}", config::config_path().display().to_string().bold());
            cfg
        }
        Ok(None) => {
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            match config::save(&cfg) {
                Ok(()) => println!(
                    "  {} Default config written to {}",
                    "✓".green().bold(),
                    config::config_path().display().to_string().bold()
                ),
                Err(e) => println!("{}: {}", "Error saving config".red(), e),
            }
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    };

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    let shutdown = Arc::new(Notify::new());
    let shutdown_signal = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – shutting down …".yellow().bold());
        shutdown_signal.notify_one();
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler");
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            println!("{}: {}", "Failed to start runtime".red(), e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(cfg, shutdown)) {
        error!(error = %e, "demo failed");
        println!("{}: {}", "Error".red(), e);
        std::process::exit(1);
    }
    println!("{}", "  ✓ Exiting tether.".green());
}

async fn run(cfg: config::Config, shutdown: Arc<Notify>) -> tether_types::Result<()> {
    let talker = NodeRuntime::new(format!("{}-pub", cfg.node_name));
    let listener = NodeRuntime::with_context(format!("{}-sub", cfg.node_name), talker.context().clone());
    let channel_types = cfg.channel_types();

    let publisher = talker
        .publish::<Chatter>(&cfg.topic, channel_types, cfg.settings.clone())
        .await?;
    if let Some(info) = publisher.topic_info() {
        for source in &info.topic_source {
            println!("  Serving {} on {}", cfg.topic.bold(), source.to_string().cyan());
        }
    }

    listener
        .subscribe(
            &cfg.topic,
            channel_types,
            cfg.settings.clone(),
            |message: Chatter| {
                let latency = chrono::Utc::now().timestamp_millis() - message.sent_at_ms;
                println!(
                    "  {} #{} {} {}",
                    "←".green(),
                    message.seq,
                    message.text,
                    format!("({latency} ms)").dimmed()
                );
            },
            |e| println!("  {} {}", "subscriber error:".red(), e),
        )
        .await?;

    println!("\n  Press {} to stop.\n", "Ctrl-C".bold().cyan());

    let mut ticker = tokio::time::interval(Duration::from_millis(cfg.settings.period_ms.max(1)));
    let mut seq = 0u64;
    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            _ = ticker.tick() => {
                seq += 1;
                publisher.publish(Chatter {
                    seq,
                    sent_at_ms: chrono::Utc::now().timestamp_millis(),
                    text: format!("hello from {}", talker.node_info().name),
                });
            }
        }
    }

    let unsubscribed = listener.shutdown().await;
    let unpublished = talker.shutdown().await;
    println!("{}", "  ✓ Topic released.".green());
    unsubscribed.and(unpublished)
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("  {} {}", "tether".bold().cyan(), format!("v{}", env!("CARGO_PKG_VERSION")).dimmed());
    println!("  Robot pub/sub over TCP, UDP, Unix sockets, shared memory and WebSocket");
    println!();
}

use crate::dm::{config, daemon, events, worker};
use crate::dm::proto::WorkerExit;
use clap::ValueEnum;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "displaymaster", version, about = "X display manager supervisor")]
pub struct Args {
    /// Path to master config YAML
    #[arg(short = 'c', long = "config", default_value = "/etc/displaymaster/config.yaml")]
    pub config: PathBuf,

    /// Run without root and skip the ownership checks on the auth directory
    #[arg(long = "no-daemon-check")]
    pub no_daemon_check: bool,

    #[command(subcommand)]
    pub cmd: Option<Cmd>,
}

#[derive(Debug, Subcommand)]
pub enum Cmd {
    /// Parse the config, print the effective daemon settings and exit
    CheckConfig {
        /// Output format: text (default) or json
        #[arg(long = "format", default_value = "text")]
        format: OutputFormat,
    },
    /// Manage one display (started by the master, not by hand)
    #[command(hide = true)]
    Worker(worker::WorkerArgs),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

fn check_config(cfg: &config::MasterConfig, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Text => {
            println!("config: {}", cfg.source.display());
            println!("socket: {} (mode {:o})", cfg.sock.display(), cfg.sock_mode);
            for d in &cfg.displays {
                let vt = d.vt.map(|v| format!("vt{v}")).unwrap_or_else(|| "vt auto".to_string());
                println!(
                    "display :{} {vt}{} server: {}",
                    d.number,
                    if d.handled { "" } else { " (unhandled)" },
                    cfg.server_command_for(d.number).join(" ")
                );
            }
            println!(
                "flexi: up to {} from :{}",
                cfg.daemon.max_flexi_servers, cfg.daemon.first_flexi_display
            );
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&cfg.daemon)?),
    }
    Ok(())
}

pub fn run() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.cmd {
        Some(Cmd::Worker(w)) => {
            events::init_logging("worker");
            let exit = match worker::run_worker(&w) {
                Ok(exit) => exit,
                Err(e) => {
                    tracing::error!("worker for :{} failed: {e:#}", w.display);
                    WorkerExit::Abort
                }
            };
            std::process::exit(exit.code());
        }
        Some(Cmd::CheckConfig { format }) => {
            let cfg = config::load_master_config(&args.config)?;
            check_config(&cfg, format)
        }
        None => {
            events::init_logging("master");
            let cfg = config::load_master_config(&args.config)?;
            daemon::run_daemon(
                cfg,
                daemon::DaemonOptions {
                    no_daemon_check: args.no_daemon_check,
                },
            )
        }
    }
}

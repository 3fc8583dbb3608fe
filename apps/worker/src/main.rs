//! obsdns worker binary
//!
//! Runs the probe scheduler, and administers the domains it probes.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

mod config;
mod database;
mod monitoring;
mod orchestrator;
mod pool;
#[cfg(test)]
mod testing;

use config::Config;
use database::{DatabaseImpl, initialize_database};
use monitoring::{IncidentTransition, ProbeRunners};
use monitoring::checker::CheckType;
use monitoring::validation::DEFAULT_INTERVAL_MINUTES;
use orchestrator::Orchestrator;

#[derive(Parser)]
#[command(name = "obsdns-worker")]
#[command(about = "Scheduled DNS, TLS and HTTP probes with incident tracking")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the TOML config file
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler until Ctrl-C
    Run,
    /// Manage monitored domains
    Domain {
        #[command(subcommand)]
        cmd: DomainCmd,
    },
    /// Enable or disable a single check
    Check {
        #[command(subcommand)]
        cmd: CheckCmd,
    },
    /// Probe every enabled check of a domain once
    Probe { domain: String },
    /// List incidents, newest first
    Incidents {
        /// Only show open incidents
        #[arg(long)]
        open: bool,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// List recent probe runs
    Runs {
        #[arg(long)]
        domain: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// List pending notifications
    Notifications {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Print the effective configuration
    Config,
}

#[derive(Subcommand)]
enum DomainCmd {
    /// Register a domain with DNS, TLS and HTTP checks
    Add {
        domain: String,
        /// Probe interval in minutes (1-15)
        #[arg(long, default_value_t = DEFAULT_INTERVAL_MINUTES)]
        interval: u32,
    },
    /// List domains and their checks
    List,
    /// Delete a domain with its runs, incidents and notifications
    Remove { domain: String },
    Enable { domain: String },
    Disable { domain: String },
    /// Change the probe interval
    Interval { domain: String, minutes: u32 },
}

#[derive(Subcommand)]
enum CheckCmd {
    Enable { domain: String, check_type: String },
    Disable { domain: String, check_type: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = Config::from_config(cli.config.as_ref())?;

    logger::init_tracing(
        logger::parse_level(&config.logging.level),
        config.logging.format.as_deref().and_then(|raw| raw.parse().ok()),
    );

    if let Commands::Config = cli.command {
        println!("{config}");
        return Ok(());
    }

    let pool = pool::create_pool(&config.database).await?;
    if let Commands::Run = cli.command {
        return Orchestrator::start(config, pool).await;
    }

    let conn = pool.get().await?;
    initialize_database(&conn).await?;
    drop(conn);
    let database = Arc::new(DatabaseImpl::new_from_pool(pool));

    match cli.command {
        Commands::Run | Commands::Config => {}
        Commands::Domain { cmd } => run_domain_command(&database, cmd).await?,
        Commands::Check { cmd } => {
            let (domain, check_type, enabled) = match cmd {
                CheckCmd::Enable { domain, check_type } => (domain, check_type, true),
                CheckCmd::Disable { domain, check_type } => (domain, check_type, false),
            };
            let check_type: CheckType = check_type.parse()?;
            database.set_check_enabled(&domain, check_type, enabled).await?;
            println!("{} check for {} {}", check_type, domain, if enabled { "enabled" } else { "disabled" });
        }
        Commands::Probe { domain } => {
            let runners = ProbeRunners::from_settings(&config.probes)?;
            let orchestrator = Orchestrator::with_runners(config, database.clone(), runners);
            for outcome in orchestrator.probe_now(&domain).await? {
                let run = &outcome.run;
                let status = if run.success { "ok" } else { "FAIL" };
                println!(
                    "{:<5} {:<4} {:>6}ms {}",
                    run.check_type,
                    status,
                    run.total_ms,
                    run.error_message.as_deref().unwrap_or("")
                );
                match outcome.transition {
                    IncidentTransition::Opened(incident) => {
                        println!("      incident {} opened ({})", incident.id, incident.severity)
                    }
                    IncidentTransition::Resolved(incidents) => {
                        println!("      {} incident(s) resolved", incidents.len())
                    }
                    IncidentTransition::Unchanged => {}
                }
            }
        }
        Commands::Incidents { open, limit } => {
            for incident in database.list_incidents(open, limit).await? {
                println!(
                    "{} {:<8} {:<8} {:<4} {} {}",
                    incident.started_at.format("%Y-%m-%d %H:%M:%S"),
                    incident.status,
                    incident.severity,
                    incident.check_type,
                    incident.domain_id,
                    incident.reason
                );
            }
        }
        Commands::Runs { domain, limit } => {
            let domain_id = match domain {
                Some(name) => Some(
                    database
                        .find_domain_by_name(&name)
                        .await?
                        .ok_or_else(|| anyhow::anyhow!("Domain not found: {}", name))?
                        .id,
                ),
                None => None,
            };
            for run in database.recent_probe_runs(domain_id, limit).await? {
                println!(
                    "{} {:<4} {:<5} {:>6}ms {}",
                    run.started_at.format("%Y-%m-%d %H:%M:%S"),
                    run.check_type,
                    if run.success { "ok" } else { "FAIL" },
                    run.total_ms,
                    run.error_code.as_deref().unwrap_or("")
                );
            }
        }
        Commands::Notifications { limit } => {
            for notification in database.pending_notifications(limit).await? {
                println!(
                    "{} {:<8} {} {}",
                    notification.created_at.format("%Y-%m-%d %H:%M:%S"),
                    notification.channel,
                    notification.destination,
                    notification.payload
                );
            }
        }
    }

    Ok(())
}

async fn run_domain_command(database: &DatabaseImpl, cmd: DomainCmd) -> Result<()> {
    match cmd {
        DomainCmd::Add { domain, interval } => {
            let (domain, checks) = database.create_domain(&domain, interval).await?;
            info!(id = %domain.id, "Added {} with {} checks", domain.name, checks.len());
            println!("{} (every {} min)", domain.name, domain.interval_minutes);
        }
        DomainCmd::List => {
            for (domain, checks) in database.list_domains().await? {
                let checks: Vec<String> = checks
                    .iter()
                    .map(|c| if c.enabled { c.check_type.clone() } else { format!("{} (off)", c.check_type) })
                    .collect();
                println!(
                    "{:<40} {:<8} {:>2} min  {}",
                    domain.name,
                    if domain.enabled { "enabled" } else { "disabled" },
                    domain.interval_minutes,
                    checks.join(", ")
                );
            }
        }
        DomainCmd::Remove { domain } => {
            let domain = database.delete_domain(&domain).await?;
            println!("Removed {}", domain.name);
        }
        DomainCmd::Enable { domain } => {
            let domain = database.set_domain_enabled(&domain, true).await?;
            println!("Enabled {}", domain.name);
        }
        DomainCmd::Disable { domain } => {
            let domain = database.set_domain_enabled(&domain, false).await?;
            println!("Disabled {}", domain.name);
        }
        DomainCmd::Interval { domain, minutes } => {
            let domain = database.set_domain_interval(&domain, minutes).await?;
            println!("{} now probed every {} min", domain.name, domain.interval_minutes);
        }
    }
    Ok(())
}

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use healthcheckd::config::{ClusterMode, Config, LogFormat};
use healthcheckd::model::{HealthCheck, NewHealthCheck};

#[derive(Parser)]
#[command(
    name = "healthcheckd",
    about = "Run named health-check commands as ephemeral cluster jobs",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (defaults: $HEALTHCHECKD_CONFIG, /etc/healthcheckd/healthcheckd.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database path (":memory:" for a throwaway store)
    #[arg(long, global = true)]
    db: Option<String>,

    /// Simulate runs instead of dispatching cluster jobs
    #[arg(long, global = true)]
    local: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (HTTP API)
    Serve {
        /// Bind address
        #[arg(long)]
        bind: Option<String>,
    },

    /// Manage and run health checks
    Check {
        #[command(subcommand)]
        action: CheckAction,
    },

    /// Check whether a command would be accepted
    Validate {
        /// The command string
        command: String,
    },
}

#[derive(Subcommand)]
enum CheckAction {
    /// List all health checks
    List,

    /// Show one health check with its execution history
    Show {
        id: String,
    },

    /// Register a new health check
    Add {
        #[arg(long)]
        name: String,

        #[arg(long)]
        owner: String,

        /// Command to execute (must start with an allowed verb)
        #[arg(long)]
        command: String,
    },

    /// Delete a health check and its history
    Remove {
        id: String,
    },

    /// Run a health check now
    Run {
        id: String,

        /// Identity recorded on the run
        #[arg(long, env = "USER", default_value = "cli")]
        triggered_by: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load_or_default(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.storage.path = db;
    }
    if cli.local {
        config.cluster.mode = ClusterMode::Local;
    }

    init_tracing(&config);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            tracing::info!(bind = %config.server.bind, "Starting healthcheckd daemon");
            healthcheckd::serve(config).await?;
        }
        Commands::Validate { command } => match healthcheckd::validate::validate(&command) {
            Ok(()) => println!("accepted"),
            Err(e) => {
                eprintln!("rejected: {}", e);
                std::process::exit(1);
            }
        },
        Commands::Check { action } => {
            let service = healthcheckd::build_service(&config)?;

            match action {
                CheckAction::List => {
                    let checks = service.list().await?;
                    if checks.is_empty() {
                        println!("No health checks found.");
                    } else {
                        println!("{:<36} | {:<20} | {:<12} | {:<8} | Command", "ID", "Name", "Owner", "Last");
                        println!("{:-<36}-|-{:-<20}-|-{:-<12}-|-{:-<8}-|-{:-<30}", "", "", "", "", "");
                        for c in checks {
                            let last = c
                                .latest_log()
                                .map(|l| l.status.as_str())
                                .unwrap_or("-");
                            println!(
                                "{:<36} | {:<20} | {:<12} | {:<8} | {}",
                                c.id.as_deref().unwrap_or_default(),
                                c.name,
                                c.owner,
                                last,
                                c.command
                            );
                        }
                    }
                }
                CheckAction::Show { id } => {
                    let check = service.get(&id).await?;
                    print_check(&check);
                }
                CheckAction::Add { name, owner, command } => {
                    let check = service.create(NewHealthCheck { name, owner, command }).await?;
                    println!("Health check '{}' added with id {}.", check.name, check.id.as_deref().unwrap_or_default());
                }
                CheckAction::Remove { id } => {
                    service.delete(&id).await?;
                    println!("Health check '{}' removed.", id);
                }
                CheckAction::Run { id, triggered_by } => {
                    let cancel = healthcheckd::shutdown::install_shutdown_handler();
                    let check = service.run_with_cancel(&id, &triggered_by, &cancel).await?;
                    if let Some(log) = check.latest_log() {
                        println!("Status: {}", log.status);
                        if let Some(output) = &log.output {
                            println!("{}", output.trim_end());
                        }
                    }
                }
            }
        }
    }

    Ok(())
}

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match config.logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

fn print_check(check: &HealthCheck) {
    println!("ID:      {}", check.id.as_deref().unwrap_or_default());
    println!("Name:    {}", check.name);
    println!("Owner:   {}", check.owner);
    println!("Command: {}", check.command);
    if check.execution_logs.is_empty() {
        println!("\nNo runs yet.");
        return;
    }
    println!("\n{:<25} | {:<25} | {:<8} | {:<12} | Output", "Started", "Ended", "Status", "By");
    println!("{:-<25}-|-{:-<25}-|-{:-<8}-|-{:-<12}-|-{:-<30}", "", "", "", "", "");
    for log in &check.execution_logs {
        let ended = log
            .end_time
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        let output = log
            .output
            .as_deref()
            .and_then(|o| o.lines().next())
            .unwrap_or("");
        println!(
            "{:<25} | {:<25} | {:<8} | {:<12} | {}",
            log.start_time.to_rfc3339(),
            ended,
            log.status.as_str(),
            log.triggered_by,
            output
        );
    }
}

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use dhcp6lease::{Config, Dhcp6Server, Engine, LeaseJournal, Result, ServerContext};

#[derive(Parser)]
#[command(name = "dhcp6lease")]
#[command(author, version, about = "A DHCPv6 server with prefix delegation", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve DHCPv6 requests until interrupted
    Run,
    /// Print the effective configuration as JSON
    ShowConfig,
    /// Print the lease journal
    ListLeases,
    /// Expire leases whose binding has ended and save the journal
    ExpireLeases,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let config = Config::load_or_create(&cli.config)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            info!("Starting DHCPv6 server with config: {:?}", cli.config);
            let server = Dhcp6Server::new(config).await?;

            tokio::select! {
                result = server.run() => result,
                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal, stopping server...");
                    if let Err(error) = server.save_leases().await {
                        tracing::error!("Failed to save leases on shutdown: {}", error);
                    }
                    Ok(())
                }
            }
        }
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::ListLeases => {
            let interval = Duration::from_millis(config.lease_commit_interval_ms);
            let journal = LeaseJournal::load(&config.leases_file, interval).await?;
            let entries = journal.entries();

            if entries.is_empty() {
                println!("No leases.");
                return Ok(());
            }

            println!(
                "{:<40} {:<44} {:<10} {:<24} {:<10}",
                "IA", "Address", "State", "Expires At", "Remaining"
            );
            println!("{}", "-".repeat(132));

            let now = chrono::Utc::now();
            for ia in entries {
                for lease in &ia.leases {
                    let (expires, remaining) = match lease.expires_at() {
                        Some(at) if lease.valid == u32::MAX => {
                            (at.format("%Y-%m-%d %H:%M:%S UTC").to_string(), "infinite".to_string())
                        }
                        Some(at) if at > now => (
                            at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
                            format!("{}s", (at - now).num_seconds()),
                        ),
                        Some(at) => (
                            at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
                            "expired".to_string(),
                        ),
                        None => ("-".to_string(), "-".to_string()),
                    };

                    println!(
                        "{:<40} {:<44} {:<10} {:<24} {:<10}",
                        ia.key.to_string(),
                        lease.describe(),
                        format!("{:?}", lease.state).to_lowercase(),
                        expires,
                        remaining
                    );
                }
            }

            Ok(())
        }
        Commands::ExpireLeases => {
            let interval = Duration::from_millis(config.lease_commit_interval_ms);
            let journal = LeaseJournal::load(&config.leases_file, interval).await?;
            let context = Arc::new(ServerContext::builder(config).build()?);
            let engine = Engine::new(context, journal)?;

            let count = engine.expire_leases(chrono::Utc::now().timestamp()).await;
            engine.save().await?;
            println!("Expired {} lease(s).", count);
            Ok(())
        }
    }
}

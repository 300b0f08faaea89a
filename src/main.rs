use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use leadcaster::campaign::{self, NewCampaign};
use leadcaster::config::Config;
use leadcaster::directory::{DirectorySearch, PlacesClient};
use leadcaster::dispatch::DispatchEngine;
use leadcaster::messaging::{EvolutionGateway, MessagingGateway};
use leadcaster::{health, prospect, server, validate};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// Leadcaster - paced WhatsApp outbound campaigns for local-business prospecting.
#[derive(Parser, Debug)]
#[command(name = "leadcaster")]
#[command(version)]
#[command(about = "Paced WhatsApp outbound campaign dispatcher.", long_about = None)]
struct Cli {
    /// Override the config directory (default: platform config dir)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the dashboard API server (recovers interrupted campaigns first)
    Serve,
    /// Campaign management
    Campaign {
        #[command(subcommand)]
        command: CampaignCommands,
    },
    /// Add a candidate contact to a campaign (validated against the gateway)
    Lead {
        /// Campaign ID
        campaign_id: String,
        /// Business name
        business_name: String,
        /// Raw phone number (normalized before validation)
        phone: String,
    },
    /// Re-check leads the validation gate has not verified yet
    Validate {
        /// Campaign ID
        campaign_id: String,
    },
    /// Search the business directory and validate everything found
    Prospect {
        /// Campaign ID
        campaign_id: String,
        /// Search query (e.g. "bakery")
        query: String,
        /// Location (e.g. "São Paulo, SP")
        location: String,
        /// Pages to fetch at most
        #[arg(long, default_value = "3")]
        max_pages: u32,
    },
    /// Run one campaign's dispatch in the foreground (Ctrl+C pauses it)
    Run {
        /// Campaign ID
        campaign_id: String,
    },
}

#[derive(Subcommand, Debug)]
enum CampaignCommands {
    /// List all campaigns
    List,
    /// Create a campaign
    Add {
        /// Campaign name
        name: String,
        /// Message text sent to every validated lead
        template: String,
        /// Gateway instance (default: [messaging].default_instance)
        #[arg(long)]
        instance: Option<String>,
        /// Minimum wait between sends, whole minutes
        #[arg(long)]
        min_interval: Option<u32>,
        /// Maximum wait between sends, whole minutes
        #[arg(long)]
        max_interval: Option<u32>,
    },
    /// Show one campaign with its leads
    Show {
        /// Campaign ID
        id: String,
    },
    /// Delete a campaign and all of its leads and logs
    Delete {
        /// Campaign ID
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging - respects RUST_LOG env var, defaults to INFO
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    health::init();
    let config = Config::load(cli.config_dir.as_deref())?;

    match cli.command {
        Commands::Serve => serve(config).await,
        Commands::Campaign { command } => handle_campaign(command, &config),
        Commands::Lead {
            campaign_id,
            business_name,
            phone,
        } => {
            let gateway = build_gateway(&config)?;
            let summary = validate::validate_candidates(
                &config,
                gateway.as_ref(),
                &campaign_id,
                &[validate::Candidate {
                    business_name,
                    phone,
                }],
            )
            .await?;
            println!(
                "✅ Validation done: {} valid, {} without WhatsApp, {} skipped, {} errors",
                summary.valid, summary.invalid, summary.skipped, summary.errors
            );
            Ok(())
        }
        Commands::Validate { campaign_id } => {
            let gateway = build_gateway(&config)?;
            let summary =
                validate::validate_pending(&config, gateway.as_ref(), &campaign_id).await?;
            println!(
                "✅ Re-checked {} lead(s): {} valid, {} without WhatsApp, {} errors",
                summary.checked, summary.valid, summary.invalid, summary.errors
            );
            Ok(())
        }
        Commands::Prospect {
            campaign_id,
            query,
            location,
            max_pages,
        } => {
            let gateway = build_gateway(&config)?;
            let directory: Arc<dyn DirectorySearch> =
                Arc::new(PlacesClient::new(&config.directory)?);
            let summary = prospect::run_prospecting(
                &config,
                directory.as_ref(),
                gateway.as_ref(),
                &campaign_id,
                &query,
                &location,
                max_pages,
            )
            .await?;
            println!(
                "✅ Prospecting done: {} businesses over {} page(s); {} queued for dispatch",
                summary.businesses_found, summary.pages_fetched, summary.validation.valid
            );
            Ok(())
        }
        Commands::Run { campaign_id } => run_foreground(config, &campaign_id).await,
    }
}

async fn serve(config: Config) -> Result<()> {
    let gateway = build_gateway(&config)?;
    let directory: Arc<dyn DirectorySearch> = Arc::new(PlacesClient::new(&config.directory)?);
    let engine = Arc::new(DispatchEngine::new(config.clone(), Arc::clone(&gateway)));

    let recovered = engine.recover_interrupted()?;
    if recovered > 0 {
        warn!("Recovered {recovered} campaign(s) left active by a previous run; now paused");
    }
    health::mark_component_ok("engine");

    server::run_server(config, engine, gateway, directory).await
}

fn handle_campaign(command: CampaignCommands, config: &Config) -> Result<()> {
    match command {
        CampaignCommands::List => {
            let campaigns = campaign::list_campaigns(config)?;
            if campaigns.is_empty() {
                println!("No campaigns yet.");
                println!("\nUsage:");
                println!("  leadcaster campaign add 'Bakeries SP' 'Hi! We help local shops.'");
                return Ok(());
            }

            println!("📣 Campaigns ({}):", campaigns.len());
            for c in campaigns {
                println!(
                    "- {} | {} | {} | sent={} failed={} total={}",
                    c.id,
                    c.name,
                    c.status.as_str(),
                    c.sent_messages,
                    c.failed_messages,
                    c.total_leads,
                );
            }
            Ok(())
        }
        CampaignCommands::Add {
            name,
            template,
            instance,
            min_interval,
            max_interval,
        } => {
            let created = campaign::create_campaign(
                config,
                &NewCampaign {
                    name,
                    message_template: template,
                    instance: instance
                        .unwrap_or_else(|| config.messaging.default_instance.clone()),
                    min_interval_minutes: min_interval
                        .unwrap_or(config.dispatch.min_interval_minutes),
                    max_interval_minutes: max_interval
                        .unwrap_or(config.dispatch.max_interval_minutes),
                },
            )?;
            println!("✅ Created campaign {}", created.id);
            println!("  Name    : {}", created.name);
            println!(
                "  Interval: {}-{} min",
                created.min_interval_minutes, created.max_interval_minutes
            );
            Ok(())
        }
        CampaignCommands::Show { id } => {
            let c = campaign::get_campaign(config, &id)?;
            println!("📣 {} ({})", c.name, c.id);
            println!("  Status  : {}", c.status.as_str());
            println!("  Instance: {}", c.instance);
            println!(
                "  Counters: sent={} failed={} total={}",
                c.sent_messages, c.failed_messages, c.total_leads
            );
            if let Some(next) = c.next_dispatch_at {
                println!("  Next    : {}", next.to_rfc3339());
            }

            let leads = campaign::list_leads(config, &id)?;
            for lead in leads {
                let validity = match lead.whatsapp_valid {
                    Some(true) => "valid",
                    Some(false) => "no-whatsapp",
                    None => "unchecked",
                };
                println!(
                    "  - {} | {} | {} | {}",
                    lead.business_name,
                    lead.phone,
                    validity,
                    lead.message_status.as_str(),
                );
            }
            Ok(())
        }
        CampaignCommands::Delete { id } => {
            campaign::delete_campaign(config, &id)?;
            println!("✅ Removed campaign {id}");
            Ok(())
        }
    }
}

/// Foreground dispatch: start the run, poll progress every couple of
/// seconds and pause cleanly on Ctrl+C.
async fn run_foreground(config: Config, campaign_id: &str) -> Result<()> {
    let gateway = build_gateway(&config)?;
    let engine = Arc::new(DispatchEngine::new(config, gateway));

    let outcome = engine.start(campaign_id).await;
    if !outcome.success {
        bail!("{}", outcome.message);
    }
    info!("Dispatch running; press Ctrl+C to pause");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                let paused = engine.pause(campaign_id).await;
                println!("\n⏸️  {}", paused.message);
                return Ok(());
            }
            () = tokio::time::sleep(std::time::Duration::from_secs(2)) => {
                if let Some(snapshot) = engine.progress(campaign_id) {
                    println!(
                        "  sent={} failed={} total={}{}",
                        snapshot.counts.sent,
                        snapshot.counts.failed,
                        snapshot.counts.total,
                        snapshot
                            .next_dispatch_at
                            .map(|t| format!(" next={}", t.to_rfc3339()))
                            .unwrap_or_default(),
                    );
                }
                if !engine.is_running(campaign_id) {
                    println!("✅ Dispatch finished");
                    return Ok(());
                }
            }
        }
    }
}

fn build_gateway(config: &Config) -> Result<Arc<dyn MessagingGateway>> {
    Ok(Arc::new(EvolutionGateway::new(&config.messaging)?))
}

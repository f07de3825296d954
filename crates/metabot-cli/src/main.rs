//! metabot — multi-tenant chat bridge for an agentic execution engine.
//!
//! Usage:
//!   metabot run       — start all configured bots, the scheduler, and the API
//!   metabot onboard   — write a starter configuration
//!   metabot status    — show configuration and registered bots

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use metabot_core::api::{self, ApiState};
use metabot_core::bridge::{BridgeContext, MessageBridge};
use metabot_core::config::{load_bots_file, AppConfig, BotConfig, Platform};
use metabot_core::cost::CostTracker;
use metabot_core::executor::ClaudeExecutor;
use metabot_core::memory::MemoryClient;
use metabot_core::metrics::{AuditLog, Metrics};
use metabot_core::outputs::OutputsManager;
use metabot_core::registry::{BotRegistry, RegisteredBot};
use metabot_core::scheduler::TaskScheduler;
use metabot_core::sender::feishu::FeishuSender;
#[cfg(feature = "telegram")]
use metabot_core::sender::telegram::TelegramSender;
use metabot_core::sender::PlatformSender;
use metabot_core::session::SessionManager;

#[derive(Parser)]
#[command(name = "metabot", version, about = "Chat bridge for an agentic execution engine")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start all configured bots (default)
    Run,
    /// Create a starter configuration
    Onboard,
    /// Show configuration status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run().await,
        Commands::Onboard => onboard(),
        Commands::Status => status(),
    }
}

async fn run() -> Result<()> {
    let config = AppConfig::load().context("failed to load config")?;
    let bots = load_bots(&config)?;
    if bots.is_empty() {
        bail!(
            "no bots configured — add entries to {:?} (see `metabot onboard`)",
            config.bots_file
        );
    }

    let registry = Arc::new(BotRegistry::new());
    let metrics = Arc::new(Metrics::new());
    let audit = Arc::new(AuditLog::new());
    let costs = Arc::new(CostTracker::new());
    let runner = Arc::new(ClaudeExecutor::new(&config.agent_binary));
    let cancel = CancellationToken::new();

    let mut gateways: Vec<tokio::task::JoinHandle<Result<()>>> = Vec::new();
    for bot in bots {
        let sender = build_sender(&bot)?;
        let sessions = Arc::new(SessionManager::new(
            &config.data_dir,
            &bot.name,
            bot.default_working_directory.clone(),
        ));
        let bridge = MessageBridge::new(BridgeContext {
            bot_name: bot.name.clone(),
            config: bot.clone(),
            sender: sender.clone(),
            runner: runner.clone(),
            sessions,
            outputs: OutputsManager::new(config.outputs_base_dir(&bot.name)),
            downloads_dir: config.downloads_dir(&bot.name),
            memory: config.memory_base_url.as_deref().map(MemoryClient::new),
            metrics: metrics.clone(),
            audit: audit.clone(),
            costs: costs.clone(),
            api_port: config.api_port,
            api_secret: config.api_secret.clone(),
        });

        #[cfg(feature = "telegram")]
        if bot.platform == Platform::Telegram {
            let token = bot
                .bot_token
                .clone()
                .with_context(|| format!("bot {} is missing botToken", bot.name))?;
            gateways.push(tokio::spawn(
                metabot_core::gateway::telegram::TelegramGateway::new(&token, bridge.clone()).run(),
            ));
        }
        if bot.platform == Platform::Feishu {
            // Feishu inbound runs over the platform's websocket SDK, which
            // lives outside this process; its events reach us through the
            // sender-side HTTP API only.
            info!(bot = bot.name, "Feishu bot registered (outbound only)");
        }

        info!(bot = bot.name, platform = %bot.platform, "Bot registered");
        registry.register(RegisteredBot {
            name: bot.name.clone(),
            platform: bot.platform,
            config: bot,
            bridge,
            sender,
        });
    }

    let scheduler = TaskScheduler::new(
        registry.clone(),
        config.scheduled_tasks_path(),
        config.default_timezone.clone(),
    );

    if let Some(port) = config.api_port {
        let state = ApiState {
            registry: registry.clone(),
            scheduler: scheduler.clone(),
            costs: costs.clone(),
            metrics: metrics.clone(),
            secret: config.api_secret.clone(),
            bots_file: config.bots_file.clone(),
            started_at: std::time::Instant::now(),
        };
        let api_cancel = cancel.child_token();
        tokio::spawn(async move {
            if let Err(e) = api::serve(state, port, api_cancel).await {
                error!(error = %e, "API server exited");
            }
        });
    }

    info!("metabot is up; press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    cancel.cancel();
    for bot in registry.all() {
        bot.bridge.destroy();
    }
    scheduler.destroy();
    for gateway in gateways {
        gateway.abort();
    }
    Ok(())
}

fn build_sender(bot: &BotConfig) -> Result<Arc<dyn PlatformSender>> {
    match bot.platform {
        Platform::Feishu => {
            let (Some(app_id), Some(app_secret)) = (&bot.app_id, &bot.app_secret) else {
                bail!("bot {} is missing appId/appSecret", bot.name);
            };
            Ok(Arc::new(FeishuSender::new(app_id, app_secret)))
        }
        #[cfg(feature = "telegram")]
        Platform::Telegram => {
            let Some(token) = &bot.bot_token else {
                bail!("bot {} is missing botToken", bot.name);
            };
            Ok(Arc::new(TelegramSender::new(token)))
        }
        #[cfg(not(feature = "telegram"))]
        Platform::Telegram => bail!("built without telegram support"),
    }
}

fn load_bots(config: &AppConfig) -> Result<Vec<BotConfig>> {
    let Some(path) = &config.bots_file else {
        warn!("no botsFile configured");
        return Ok(Vec::new());
    };
    if !path.exists() {
        warn!(path = %path.display(), "bots file does not exist");
        return Ok(Vec::new());
    }
    load_bots_file(path).with_context(|| format!("failed to load bots from {}", path.display()))
}

fn onboard() -> Result<()> {
    let path = AppConfig::write_default_template()?;
    println!("Wrote {}", path.display());
    println!("Next: create the bots file it references, e.g.");
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!([{
            "name": "mybot",
            "platform": "telegram",
            "botToken": "123456:ABC...",
            "defaultWorkingDirectory": "/home/me/projects",
            "authorizedUserIds": ["12345678"],
        }]))?
    );
    Ok(())
}

fn status() -> Result<()> {
    let config = AppConfig::load()?;
    println!("config dir:      {}", AppConfig::default_dir().display());
    println!("data dir:        {}", config.data_dir.display());
    println!("api port:        {:?}", config.api_port);
    println!("timezone:        {}", config.default_timezone);
    println!("agent binary:    {}", config.agent_binary);
    match load_bots(&config) {
        Ok(bots) if !bots.is_empty() => {
            println!("bots:");
            for bot in bots {
                println!("  - {} ({})", bot.name, bot.platform);
            }
        }
        _ => println!("bots:            none configured"),
    }
    Ok(())
}

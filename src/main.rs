mod config;
mod gate;
mod http;
mod ingest;
mod jobs;
mod metrics;
mod notify;
mod probes;
mod runner;
mod scheduler;
mod severity;
mod telegram;

use axum::serve;
use clap::Parser;
use config::Config;
use gate::{CommandGate, CooldownTable};
use ingest::{IngestLoop, IngestSettings};
use jobs::Jobs;
use metrics::Metrics;
use notify::{LogNotifier, Notifier, TelegramNotifier};
use probes::speedtest::OoklaProvider;
use reqwest::Client;
use runner::JobRunner;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::SystemExt;
use teloxide::Bot;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "hostwatch")]
#[command(version)]
struct Cli {
    #[arg(long, default_value = "./config.yaml")]
    config: String,
    #[arg(long)]
    print_default_config: bool,
    #[arg(long, conflicts_with = "telegram_off")]
    telegram_on: bool,
    #[arg(long, conflicts_with = "telegram_on")]
    telegram_off: bool,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let mut cfg = match Config::load_from_file(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, path = %cli.config, "failed to load configuration");
            std::process::exit(1);
        }
    };
    if cli.telegram_on {
        cfg.telegram.enabled = true;
    } else if cli.telegram_off {
        cfg.telegram.enabled = false;
    }

    let bot = if cfg.telegram.enabled {
        match ensure_telegram_settings(&cfg) {
            Ok(token) => Some(Bot::new(token)),
            Err(err) => {
                error!(error = %err, "telegram settings are incomplete");
                std::process::exit(1);
            }
        }
    } else {
        None
    };

    let host = host_name();
    info!(
        listen = %cfg.listen,
        host = %host,
        disk_targets = cfg.disk_targets.len(),
        speedtest = cfg.speedtest.enabled,
        telegram = cfg.telegram.enabled,
        "starting hostwatch"
    );

    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "failed to initialise metrics");
            std::process::exit(1);
        }
    };

    let gate = CommandGate::new(cooldown_table(&cfg));
    let notifier: Arc<dyn Notifier> = match &bot {
        Some(bot) => Arc::new(TelegramNotifier::new(bot.clone(), cfg.telegram.chat_id)),
        None => Arc::new(LogNotifier),
    };
    let client = Client::builder()
        .user_agent("hostwatch/0.1.0")
        .build()
        .unwrap_or_else(|_| Client::new());
    let jobs = Jobs::new(
        JobRunner::new(gate, notifier),
        &cfg,
        Arc::new(OoklaProvider::new(client)),
        metrics.clone(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_task = {
        let listen = cfg.listen.clone();
        let state = http::HttpAppState {
            metrics: metrics.clone(),
            jobs: jobs.clone(),
            host: host.clone(),
        };
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let app = http::build_router(state);
            let addr: SocketAddr = match listen.parse() {
                Ok(addr) => addr,
                Err(err) => {
                    error!(error = %err, listen = %listen, "invalid listen address");
                    return;
                }
            };

            let listener = match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(err) => {
                    error!(error = %err, listen = %listen, "failed to bind http listener");
                    return;
                }
            };
            info!(listen = %listen, "http server listening");

            let server = serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });

            if let Err(err) = server.await {
                error!(error = %err, "http server error");
            }
        })
    };

    let ingest_task = bot.map(|bot| {
        let jobs = jobs.clone();
        let settings = IngestSettings::from(&cfg.telegram);
        let metrics = metrics.clone();
        let host = host.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            telegram::register_commands_logged(&bot, &jobs).await;
            let handler = Arc::new(telegram::ChatCommands::new(jobs, host));
            let source = telegram::TelegramSource::new(bot);
            IngestLoop::new(source, handler, settings, metrics)
                .run(shutdown)
                .await;
        })
    });

    let schedules = scheduler::schedules(&jobs, cfg.speedtest.interval);
    let schedule_tasks = scheduler::spawn_schedules(jobs.clone(), schedules, shutdown_rx.clone());

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for Ctrl+C");
    }
    info!("received Ctrl+C, shutting down");

    let _ = shutdown_tx.send(true);

    // in-flight on-demand measurements are left to die with the runtime
    for task in schedule_tasks {
        task.abort();
        let _ = task.await;
    }
    if let Some(task) = ingest_task {
        let _ = task.await;
    }
    let _ = http_task.await;
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn cooldown_table(cfg: &Config) -> CooldownTable {
    CooldownTable::new(
        Duration::from_secs(cfg.cooldowns.default_secs),
        cfg.cooldowns
            .commands
            .iter()
            .map(|(name, secs)| (name.clone(), Duration::from_secs(*secs)))
            .collect(),
    )
}

fn host_name() -> String {
    sysinfo::System::new()
        .host_name()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "this host".to_string())
}

fn resolve_telegram_token_from_env(env_name: &str) -> Option<String> {
    std::env::var(env_name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn ensure_telegram_settings(cfg: &Config) -> Result<String, String> {
    let env_name = cfg.telegram.bot_token_env.clone();
    let env_token = resolve_telegram_token_from_env(&env_name);
    let cfg_token = cfg
        .telegram
        .bot_token
        .as_ref()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());

    if cfg.telegram.chat_id == 0 {
        return Err("telegram.chat_id is not set".to_string());
    }

    let token = env_token.or(cfg_token).ok_or_else(|| {
        format!("no telegram token: set '{env_name}' in the environment or telegram.bot_token in config")
    })?;
    if !token.contains(':') {
        return Err("telegram token does not look like a bot API key".to_string());
    }
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(token: Option<&str>, chat_id: i64) -> Config {
        let mut cfg: Config = serde_yaml::from_str("listen: \"127.0.0.1:0\"").unwrap();
        cfg.telegram.enabled = true;
        cfg.telegram.bot_token_env = "HOSTWATCH_TEST_TOKEN_UNSET".to_string();
        cfg.telegram.bot_token = token.map(str::to_string);
        cfg.telegram.chat_id = chat_id;
        cfg
    }

    #[test]
    fn telegram_settings_need_chat_and_key() {
        assert_eq!(
            ensure_telegram_settings(&cfg(Some(" 123:abc "), 42)).unwrap(),
            "123:abc"
        );
        assert!(ensure_telegram_settings(&cfg(Some("123:abc"), 0)).is_err());
        assert!(ensure_telegram_settings(&cfg(None, 42)).is_err());
        assert!(ensure_telegram_settings(&cfg(Some("nocolon"), 42)).is_err());
    }

    #[test]
    fn cooldowns_come_from_config() {
        let table = cooldown_table(&cfg(None, 1));
        assert_eq!(table.get("speedtest"), Duration::from_secs(30));
        assert_eq!(table.get("plex_disk_usage"), Duration::from_secs(10));
    }
}

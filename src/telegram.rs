use crate::config::SPEEDTEST_COMMAND;
use crate::gate::Rejection;
use crate::ingest::{CommandHandler, CommandSource, IncomingCommand, SourceError};
use crate::jobs::{Jobs, LaunchError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use teloxide::prelude::*;
use teloxide::types::{BotCommand, UpdateKind};
use teloxide::RequestError;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum TelegramError {
    #[error("telegram request failed: {0}")]
    Request(#[from] RequestError),
}

pub fn parse_command(text: &str) -> Option<IncomingCommand> {
    let mut parts = text.split_whitespace();
    let first = parts.next()?.strip_prefix('/')?;
    let name = first.split('@').next()?.to_lowercase();
    if name.is_empty() {
        return None;
    }
    Some(IncomingCommand {
        name,
        args: parts.map(str::to_string).collect(),
    })
}

pub struct TelegramSource {
    bot: Bot,
    offset: i32,
}

impl TelegramSource {
    pub fn new(bot: Bot) -> Self {
        Self { bot, offset: 0 }
    }
}

#[async_trait]
impl CommandSource for TelegramSource {
    async fn poll(&mut self, timeout: Duration) -> Result<Vec<IncomingCommand>, SourceError> {
        let updates = self
            .bot
            .get_updates()
            .offset(self.offset)
            .timeout(timeout.as_secs() as u32)
            .await
            .map_err(classify_error)?;

        let mut commands = Vec::new();
        for update in updates {
            self.offset = self.offset.max(update.id + 1);
            let UpdateKind::Message(msg) = update.kind else {
                continue;
            };
            if let Some(command) = msg.text().and_then(parse_command) {
                debug!(command = %command.name, chat_id = msg.chat.id.0, "command received");
                commands.push(command);
            }
        }
        Ok(commands)
    }
}

fn classify_error(err: RequestError) -> SourceError {
    match err {
        RequestError::RetryAfter(wait) => SourceError::Throttled(wait),
        RequestError::Network(_) | RequestError::Io(_) => SourceError::Transient(err.to_string()),
        other => SourceError::Permanent(other.to_string()),
    }
}

pub struct ChatCommands {
    jobs: Arc<Jobs>,
    host: String,
}

impl ChatCommands {
    pub fn new(jobs: Arc<Jobs>, host: String) -> Self {
        Self { jobs, host }
    }

    async fn reply(&self, text: &str) {
        self.jobs.runner().notifier().send(text).await;
    }
}

#[async_trait]
impl CommandHandler for ChatCommands {
    async fn handle(&self, command: IncomingCommand) {
        match command.name.as_str() {
            "start" => self.reply(&greeting(&self.host)).await,
            "help" => self.reply(&help_text(&self.jobs)).await,
            name => match self.jobs.admit(name) {
                Ok(admitted) => {
                    if name == SPEEDTEST_COMMAND {
                        self.reply("Running speedtest…").await;
                    }
                    admitted.spawn();
                }
                Err(LaunchError::Unknown(_)) => self.reply("Unknown command. Try /help").await,
                Err(LaunchError::Rejected(rejection)) => {
                    self.reply(&rejection_text(name, &rejection)).await
                }
            },
        }
    }
}

pub fn greeting(host: &str) -> String {
    format!("👋 hostwatch is watching {host}.\nSend /help to see what it can check.")
}

pub fn help_text(jobs: &Jobs) -> String {
    let mut text = String::from("Available commands:\n");
    text.push_str("/start - greeting\n/help - this list\n");
    for (name, description) in jobs.describe() {
        text.push_str(&format!("/{name} - {description}\n"));
    }
    text.trim_end().to_string()
}

pub fn rejection_text(command: &str, rejection: &Rejection) -> String {
    match rejection {
        Rejection::AlreadyRunning => format!("⚠️ {command} is already running"),
        Rejection::CoolingDown { remaining } => format!(
            "⚠️ Please wait {}s before running this command again",
            whole_seconds(*remaining)
        ),
    }
}

fn whole_seconds(d: Duration) -> u64 {
    let secs = d.as_secs() + u64::from(d.subsec_nanos() > 0);
    secs.max(1)
}

pub async fn register_commands(bot: &Bot, jobs: &Jobs) -> Result<(), TelegramError> {
    let mut commands = vec![
        BotCommand::new("start", "Greeting"),
        BotCommand::new("help", "List available commands"),
    ];
    commands.extend(
        jobs.describe()
            .into_iter()
            .map(|(name, description)| BotCommand::new(name, description)),
    );
    let count = commands.len();
    bot.set_my_commands(commands).await?;
    info!(count, "telegram command menu registered");
    Ok(())
}

pub async fn register_commands_logged(bot: &Bot, jobs: &Jobs) {
    if let Err(err) = register_commands(bot, jobs).await {
        warn!(error = %err, "failed to register telegram command menu");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::testing::jobs;
    use crate::probes::speedtest::testing::FakeProvider;
    use teloxide::ApiError;

    fn cmd(name: &str) -> IncomingCommand {
        IncomingCommand {
            name: name.to_string(),
            args: Vec::new(),
        }
    }

    #[test]
    fn parses_bot_suffix_case_and_args() {
        assert_eq!(
            parse_command("/SpeedTest@hostwatch_bot now please"),
            Some(IncomingCommand {
                name: "speedtest".to_string(),
                args: vec!["now".to_string(), "please".to_string()],
            })
        );
        assert_eq!(parse_command("/plex_disk_usage").unwrap().name, "plex_disk_usage");
        assert_eq!(parse_command("hello there"), None);
        assert_eq!(parse_command("/"), None);
        assert_eq!(parse_command(""), None);
    }

    #[test]
    fn api_errors_are_permanent() {
        assert!(matches!(
            classify_error(RequestError::Api(ApiError::BotBlocked)),
            SourceError::Permanent(_)
        ));
    }

    #[test]
    fn dropped_connections_are_transient() {
        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "peer went away");
        assert!(matches!(
            classify_error(RequestError::Io(reset)),
            SourceError::Transient(_)
        ));
    }

    #[test]
    fn flood_control_carries_its_wait() {
        assert_eq!(
            classify_error(RequestError::RetryAfter(Duration::from_secs(3))),
            SourceError::Throttled(Duration::from_secs(3))
        );
    }

    #[test]
    fn rejection_texts() {
        assert_eq!(
            rejection_text("speedtest", &Rejection::AlreadyRunning),
            "⚠️ speedtest is already running"
        );
        assert_eq!(
            rejection_text(
                "speedtest",
                &Rejection::CoolingDown {
                    remaining: Duration::from_millis(12_300)
                }
            ),
            "⚠️ Please wait 13s before running this command again"
        );
    }

    #[tokio::test]
    async fn start_help_and_unknown_are_answered_inline() {
        let (jobs, notifier) = jobs(FakeProvider::default());
        let handler = ChatCommands::new(jobs, "nas".to_string());

        handler.handle(cmd("start")).await;
        handler.handle(cmd("help")).await;
        handler.handle(cmd("reboot")).await;

        let messages = notifier.messages().await;
        assert!(messages[0].contains("nas"));
        assert!(messages[1].contains("/plex_disk_usage - Check Plex disk usage"));
        assert!(messages[1].contains("/speedtest"));
        assert_eq!(messages[2], "Unknown command. Try /help");
    }

    #[tokio::test]
    async fn speedtest_is_acknowledged_then_reported() {
        let (jobs, notifier) = jobs(FakeProvider::default());
        let handler = ChatCommands::new(jobs.clone(), "nas".to_string());

        handler.handle(cmd("speedtest")).await;
        for _ in 0..100 {
            if notifier.messages().await.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let messages = notifier.messages().await;
        assert_eq!(messages[0], "Running speedtest…");
        assert!(messages[1].starts_with("🚀 Speedtest"));
    }

    #[tokio::test]
    async fn busy_command_gets_rejection_reply() {
        let (jobs, notifier) = jobs(FakeProvider::default());
        let held = jobs.admit("speedtest").unwrap();
        let handler = ChatCommands::new(jobs.clone(), "nas".to_string());

        handler.handle(cmd("speedtest")).await;
        assert_eq!(
            notifier.messages().await,
            vec!["⚠️ speedtest is already running".to_string()]
        );
        drop(held);
    }
}

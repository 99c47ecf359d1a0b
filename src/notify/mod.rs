//! Lifecycle and player event notifications.
//!
//! The core never talks to a chat service directly. Each server gets a
//! [`Notifier`] that filters events by the server's [`NotifyConfig`] and hands
//! them to a background dispatcher, which forwards them (in order) to the
//! shared [`NotificationSink`]. Emitting never blocks and sink failures are
//! only logged.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

// ─── Events ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    ServerStarting { server: String },
    ServerStarted { server: String },
    ServerStopped { server: String },
    PlayerJoin { server: String, player: String },
    PlayerLeave { server: String, player: String },
    PlayerAchievement { server: String, player: String, achievement: String },
}

impl ServerEvent {
    pub fn server(&self) -> &str {
        match self {
            Self::ServerStarting { server }
            | Self::ServerStarted { server }
            | Self::ServerStopped { server }
            | Self::PlayerJoin { server, .. }
            | Self::PlayerLeave { server, .. }
            | Self::PlayerAchievement { server, .. } => server,
        }
    }

    /// Category bit this event is filtered by.
    pub fn category(&self) -> NotifyMode {
        match self {
            Self::ServerStarting { .. } | Self::ServerStarted { .. } | Self::ServerStopped { .. } => {
                NotifyMode::SERVER_EVENTS
            }
            Self::PlayerJoin { .. } | Self::PlayerLeave { .. } => NotifyMode::PLAYER_CONN_EVENTS,
            Self::PlayerAchievement { .. } => NotifyMode::PLAYER_OTHER_EVENTS,
        }
    }

    /// Human readable message in the requested language.
    pub fn message(&self, lang: Language) -> String {
        match (lang, self) {
            (Language::En, Self::ServerStarting { server }) => format!("Server \"{}\" starting", server),
            (Language::En, Self::ServerStarted { server }) => format!("Server \"{}\" started", server),
            (Language::En, Self::ServerStopped { server }) => format!("Server \"{}\" stopped", server),
            (Language::En, Self::PlayerJoin { player, .. }) => format!("Player {} join", player),
            (Language::En, Self::PlayerLeave { player, .. }) => format!("Player {} leave", player),
            (Language::En, Self::PlayerAchievement { player, achievement, .. }) => {
                format!("Player {} got achievement \"{}\"", player, achievement)
            }
            (Language::Ru, Self::ServerStarting { server }) => format!("Сервер \"{}\" запускается", server),
            (Language::Ru, Self::ServerStarted { server }) => format!("Сервер \"{}\" запущен", server),
            (Language::Ru, Self::ServerStopped { server }) => format!("Сервер \"{}\" остановлен", server),
            (Language::Ru, Self::PlayerJoin { player, .. }) => format!("Игрок {} присоединился", player),
            (Language::Ru, Self::PlayerLeave { player, .. }) => format!("Игрок {} покинул игру", player),
            (Language::Ru, Self::PlayerAchievement { player, achievement, .. }) => {
                format!("Игрок {} получил достижение \"{}\"", player, achievement)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Language {
    #[default]
    #[serde(rename = "EN")]
    En,
    #[serde(rename = "RU")]
    Ru,
}

// ─── Filtering ───────────────────────────────────────────────

/// Bit set of event categories a server wants forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NotifyMode(pub u8);

impl NotifyMode {
    pub const SERVER_EVENTS: Self = Self(1);
    pub const PLAYER_CONN_EVENTS: Self = Self(2);
    pub const PLAYER_OTHER_EVENTS: Self = Self(4);
    pub const ALL: Self = Self(1 | 2 | 4);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl Default for NotifyMode {
    fn default() -> Self {
        Self::ALL
    }
}

/// Per-server notification settings, persisted with the server definition.
///
/// `token` and `chat_id` are opaque to the core; they are carried for the
/// external sink that delivers the messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub mode: NotifyMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: NotifyMode::ALL,
            token: None,
            chat_id: None,
        }
    }
}

impl NotifyConfig {
    pub fn allows(&self, event: &ServerEvent) -> bool {
        self.enabled && self.mode.contains(event.category())
    }
}

// ─── Sink port ───────────────────────────────────────────────

/// Destination for server events (chat bot, websocket fan-out, ...).
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, event: &ServerEvent, config: &NotifyConfig) -> anyhow::Result<()>;
}

/// Default sink: writes the localized message to the log.
pub struct TracingSink {
    lang: Language,
}

impl TracingSink {
    pub fn new(lang: Language) -> Self {
        Self { lang }
    }
}

#[async_trait]
impl NotificationSink for TracingSink {
    async fn notify(&self, event: &ServerEvent, _config: &NotifyConfig) -> anyhow::Result<()> {
        tracing::info!(server = event.server(), "[Notify] {}", event.message(self.lang));
        Ok(())
    }
}

// ─── Notifier ────────────────────────────────────────────────

/// Per-server, non-blocking event emitter.
#[derive(Clone)]
pub struct Notifier {
    tx: Option<mpsc::UnboundedSender<ServerEvent>>,
    config: NotifyConfig,
}

impl Notifier {
    /// Spawn the dispatcher task. The task ends once every clone of the
    /// returned notifier has been dropped.
    pub fn spawn(sink: Arc<dyn NotificationSink>, config: Option<NotifyConfig>) -> Self {
        let config = config.unwrap_or_default();
        let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
        let task_config = config.clone();

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = sink.notify(&event, &task_config).await {
                    tracing::warn!("Notification for '{}' failed: {}", event.server(), e);
                }
            }
        });

        Self { tx: Some(tx), config }
    }

    /// A notifier that drops everything. Useful where no runtime is around.
    pub fn disabled() -> Self {
        Self {
            tx: None,
            config: NotifyConfig { enabled: false, ..NotifyConfig::default() },
        }
    }

    pub fn emit(&self, event: ServerEvent) {
        if !self.config.allows(&event) {
            return;
        }
        if let Some(tx) = &self.tx {
            if tx.send(event).is_err() {
                tracing::debug!("Notification dispatcher is gone, event dropped");
            }
        }
    }
}

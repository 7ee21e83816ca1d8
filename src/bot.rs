//! Demo bot: wires the client, the built-in commands and a small event loop.
//!
//! Commands are dispatched by the [`crate::framework::Framework`] on its own
//! bus subscription; this loop only reacts to lifecycle events and greets
//! users who come online.

use std::collections::HashSet;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{error, info, trace, warn};

use crate::client::Client;
use crate::config::BotConfig;
use crate::error::{BotError, BotResult};
use crate::events::BotEvent;
use crate::handlers;
use crate::types::{PresenceUpdate, Status};

const PRESENCE_REFRESH: Duration = Duration::from_secs(600);
const ACTIVITY: &str = "!help";

/// Username/password for `POST /auth/login` when no token is configured.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

// ---------------------------------------------------------------------------
// Greeting state
// ---------------------------------------------------------------------------

/// State for the "greet users who come online" feature.
#[derive(Debug, Default)]
pub struct GreetState {
    /// Channel to send greetings in: the first one a user wrote to.
    pub greet_channel_id: Option<String>,
    /// Users already greeted this session.
    pub greeted_users: HashSet<String>,
}

impl GreetState {
    pub fn note_channel(&mut self, channel_id: &str) {
        if self.greet_channel_id.is_none() {
            self.greet_channel_id = Some(channel_id.to_string());
        }
    }

    /// The channel to greet `presence.user` in, at most once per user.
    pub fn greeting_for(&mut self, presence: &PresenceUpdate, self_id: Option<&str>) -> Option<String> {
        if presence.status.as_deref() != Some("online") || presence.user.bot {
            return None;
        }
        if self_id == Some(presence.user.id.as_str()) {
            return None;
        }
        let channel = self.greet_channel_id.clone()?;
        self.greeted_users
            .insert(presence.user.id.clone())
            .then_some(channel)
    }
}

fn greeting(user_id: &str) -> String {
    format!("Welcome online, <@{user_id}>! 🎉 Hope you're having a great day!")
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Run until ctrl-c or until the gateway gives up reconnecting.
pub async fn run(config: BotConfig, credentials: Option<Credentials>) -> BotResult<()> {
    let started = Instant::now();
    let client = Client::new(config)?;

    handlers::register_all(client.framework(), started)?;
    client.framework().use_middleware(handlers::log_invocations);

    let events = client.events();

    if let Some(creds) = credentials {
        client.login(&creds.username, &creds.password).await?;
    }

    client.connect().await.map_err(|e| {
        error!(error = %e, "failed to start gateway");
        e
    })?;
    info!("gateway connected, entering event loop");

    let presence = client.presence();
    client
        .framework()
        .schedule("presence-refresh", PRESENCE_REFRESH, move || {
            let presence = presence.clone();
            async move { presence.set_activity(Status::Online, ACTIVITY).await }
        })?;

    let mut greet = GreetState::default();
    let outcome = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("ctrl-c received, shutting down");
                break Ok(());
            }
            event = events.recv() => match event {
                Ok(event) => {
                    if let Some(outcome) = on_event(&client, &mut greet, event).await {
                        break outcome;
                    }
                }
                Err(_) => {
                    warn!("event stream ended, bot shutting down");
                    break Ok(());
                }
            },
        }
    };

    client.disconnect();
    client.framework().shutdown().await;
    outcome
}

/// Handle one lifecycle event; `Some` ends the loop.
async fn on_event(
    client: &Client,
    greet: &mut GreetState,
    event: BotEvent,
) -> Option<BotResult<()>> {
    match event {
        BotEvent::Ready(ready) => {
            let name = ready
                .user
                .as_ref()
                .map(|u| u.tag())
                .unwrap_or_else(|| "<unknown>".to_string());
            info!(user = %name, servers = ready.servers.len(), "bot is ready");
            if let Err(e) = client.presence().set_activity(Status::Online, ACTIVITY).await {
                warn!(error = %e, "failed to set presence");
            }
        }

        BotEvent::Reconnect { attempts } => {
            info!(attempts, "gateway session restored");
        }

        BotEvent::Disconnect { reason } => {
            error!(reason = %reason, "gateway gave up");
            return Some(Err(BotError::Disconnected));
        }

        BotEvent::Error(message) => {
            warn!(error = %message, "gateway reported an error");
        }

        BotEvent::MessageCreate(msg) => {
            if !msg.author.bot {
                greet.note_channel(&msg.channel_id);
            }
        }

        BotEvent::PresenceUpdate(presence) => {
            let self_id = client.framework().identity();
            if let Some(channel_id) = greet.greeting_for(&presence, self_id.as_deref()) {
                let text = greeting(&presence.user.id);
                if let Err(e) = client.messages().say(&channel_id, &text).await {
                    warn!(error = %e, "failed to send greeting");
                }
            }
        }

        BotEvent::Unknown { event_name, .. } => {
            trace!(event = %event_name, "unhandled gateway event");
        }

        _ => {}
    }
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn presence(user_id: &str, status: &str) -> PresenceUpdate {
        serde_json::from_value(json!({
            "user": {"id": user_id},
            "status": status
        }))
        .unwrap()
    }

    // -- GreetState --------------------------------------------------------

    #[test]
    fn greet_state_default_is_empty() {
        let state = GreetState::default();
        assert!(state.greet_channel_id.is_none());
        assert!(state.greeted_users.is_empty());
    }

    #[test]
    fn first_channel_wins() {
        let mut state = GreetState::default();
        state.note_channel("a");
        state.note_channel("b");
        assert_eq!(state.greet_channel_id.as_deref(), Some("a"));
    }

    #[test]
    fn greets_each_user_once() {
        let mut state = GreetState::default();
        state.note_channel("chan");

        assert_eq!(state.greeting_for(&presence("u1", "online"), None).as_deref(), Some("chan"));
        assert_eq!(state.greeting_for(&presence("u1", "online"), None), None);
        assert_eq!(state.greeting_for(&presence("u2", "online"), None).as_deref(), Some("chan"));
    }

    #[test]
    fn skips_offline_self_and_unknown_channel() {
        let mut state = GreetState::default();
        assert_eq!(state.greeting_for(&presence("u1", "online"), None), None);
        // Not marked greeted while there was nowhere to greet.
        assert!(state.greeted_users.is_empty());

        state.note_channel("chan");
        assert_eq!(state.greeting_for(&presence("u1", "idle"), None), None);
        assert_eq!(state.greeting_for(&presence("me", "online"), Some("me")), None);
    }

    #[test]
    fn greeting_mentions_user() {
        assert!(greeting("42").contains("<@42>"));
    }
}

//! Typed bot events.
//!
//! Instead of matching on raw `(t, serde_json::Value)` pairs everywhere, the
//! session client deserialises dispatch payloads into [`BotEvent`] so
//! subscribers can pattern-match on strongly-typed data. Lifecycle
//! notifications (disconnect, reconnect, error) travel on the same bus.

use serde::de::DeserializeOwned;
use tracing::warn;

use crate::types::*;

// ---------------------------------------------------------------------------
// The top-level event enum
// ---------------------------------------------------------------------------

/// Everything published on the [`crate::bus::EventBus`].
#[derive(Debug, Clone)]
pub enum BotEvent {
    /// A new session was established (IDENTIFY succeeded).
    Ready(ReadyEvent),
    /// A previous session was reattached (RESUME succeeded).
    Resumed,

    MessageCreate(Message),
    MessageUpdate(MessageUpdate),
    MessageDelete(MessageDelete),

    ServerCreate(Server),
    ServerUpdate(Server),
    ServerDelete(UnavailableServer),

    ChannelCreate(Channel),
    ChannelUpdate(Channel),
    ChannelDelete(ChannelRef),

    RoleCreate(RoleEvent),
    RoleUpdate(RoleEvent),
    RoleDelete(RoleDelete),

    MemberAdd(Member),
    MemberUpdate(Member),
    MemberRemove(MemberRemove),

    PresenceUpdate(PresenceUpdate),
    VoiceStateUpdate(VoiceState),
    TypingStart(TypingStart),

    /// The session ended and the client stopped retrying (or the host called
    /// `disconnect`).
    Disconnect { reason: String },
    /// A dropped connection was re-established.
    Reconnect { attempts: u32 },
    /// A non-fatal problem worth surfacing to the host.
    Error(String),

    /// A dispatch we don't have a typed variant for, or one whose payload
    /// failed to parse. Carries the raw JSON so callers can still inspect it.
    Unknown {
        event_name: String,
        data: serde_json::Value,
    },
}

impl BotEvent {
    /// Short, stable name for logging.
    pub fn name(&self) -> &str {
        match self {
            BotEvent::Ready(_) => "READY",
            BotEvent::Resumed => "RESUMED",
            BotEvent::MessageCreate(_) => "MESSAGE_CREATE",
            BotEvent::MessageUpdate(_) => "MESSAGE_UPDATE",
            BotEvent::MessageDelete(_) => "MESSAGE_DELETE",
            BotEvent::ServerCreate(_) => "SERVER_CREATE",
            BotEvent::ServerUpdate(_) => "SERVER_UPDATE",
            BotEvent::ServerDelete(_) => "SERVER_DELETE",
            BotEvent::ChannelCreate(_) => "CHANNEL_CREATE",
            BotEvent::ChannelUpdate(_) => "CHANNEL_UPDATE",
            BotEvent::ChannelDelete(_) => "CHANNEL_DELETE",
            BotEvent::RoleCreate(_) => "ROLE_CREATE",
            BotEvent::RoleUpdate(_) => "ROLE_UPDATE",
            BotEvent::RoleDelete(_) => "ROLE_DELETE",
            BotEvent::MemberAdd(_) => "MEMBER_ADD",
            BotEvent::MemberUpdate(_) => "MEMBER_UPDATE",
            BotEvent::MemberRemove(_) => "MEMBER_REMOVE",
            BotEvent::PresenceUpdate(_) => "PRESENCE_UPDATE",
            BotEvent::VoiceStateUpdate(_) => "VOICE_STATE_UPDATE",
            BotEvent::TypingStart(_) => "TYPING_START",
            BotEvent::Disconnect { .. } => "disconnect",
            BotEvent::Reconnect { .. } => "reconnect",
            BotEvent::Error(_) => "error",
            BotEvent::Unknown { event_name, .. } => event_name,
        }
    }

    // -----------------------------------------------------------------------
    // Parsing from a dispatch envelope
    // -----------------------------------------------------------------------

    /// Convert an op-0 DISPATCH `(t, d)` pair into a typed event.
    ///
    /// This never fails: unrecognised names and malformed payloads become
    /// [`BotEvent::Unknown`] (the latter with a warning).
    pub fn from_dispatch(event_name: &str, data: serde_json::Value) -> Self {
        match event_name {
            "READY" => parse(event_name, data, BotEvent::Ready),
            "RESUMED" => BotEvent::Resumed,
            "MESSAGE_CREATE" => parse(event_name, data, BotEvent::MessageCreate),
            "MESSAGE_UPDATE" => parse(event_name, data, BotEvent::MessageUpdate),
            "MESSAGE_DELETE" => parse(event_name, data, BotEvent::MessageDelete),
            "SERVER_CREATE" => parse(event_name, data, BotEvent::ServerCreate),
            "SERVER_UPDATE" => parse(event_name, data, BotEvent::ServerUpdate),
            "SERVER_DELETE" => parse(event_name, data, BotEvent::ServerDelete),
            "CHANNEL_CREATE" => parse(event_name, data, BotEvent::ChannelCreate),
            "CHANNEL_UPDATE" => parse(event_name, data, BotEvent::ChannelUpdate),
            "CHANNEL_DELETE" => parse(event_name, data, BotEvent::ChannelDelete),
            "ROLE_CREATE" => parse(event_name, data, BotEvent::RoleCreate),
            "ROLE_UPDATE" => parse(event_name, data, BotEvent::RoleUpdate),
            "ROLE_DELETE" => parse(event_name, data, BotEvent::RoleDelete),
            "MEMBER_ADD" => parse(event_name, data, BotEvent::MemberAdd),
            "MEMBER_UPDATE" => parse(event_name, data, BotEvent::MemberUpdate),
            "MEMBER_REMOVE" => parse(event_name, data, BotEvent::MemberRemove),
            "PRESENCE_UPDATE" => parse(event_name, data, BotEvent::PresenceUpdate),
            "VOICE_STATE_UPDATE" => parse(event_name, data, BotEvent::VoiceStateUpdate),
            "TYPING_START" => parse(event_name, data, BotEvent::TypingStart),
            _ => BotEvent::Unknown {
                event_name: event_name.to_string(),
                data,
            },
        }
    }

    /// If this is an `Unknown` event, try to deserialise its data.
    pub fn try_parse_unknown<T: DeserializeOwned>(&self) -> Option<T> {
        match self {
            BotEvent::Unknown { data, .. } => serde_json::from_value(data.clone()).ok(),
            _ => None,
        }
    }
}

fn parse<T, F>(event_name: &str, data: serde_json::Value, wrap: F) -> BotEvent
where
    T: DeserializeOwned,
    F: FnOnce(T) -> BotEvent,
{
    match serde_json::from_value::<T>(data.clone()) {
        Ok(value) => wrap(value),
        Err(e) => {
            warn!(event = event_name, error = %e, "failed to parse dispatch payload");
            BotEvent::Unknown {
                event_name: event_name.to_string(),
                data,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

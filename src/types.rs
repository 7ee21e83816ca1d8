//! Typed representations of gateway envelopes and REST objects.
//!
//! These mirror the platform's wire format so we can deserialize gateway
//! events and REST responses without touching `serde_json::Value` in the rest
//! of the codebase.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};

// ---------------------------------------------------------------------------
// Primitives
// ---------------------------------------------------------------------------

/// IDs are transmitted as strings in JSON.
pub type Snowflake = String;

// ---------------------------------------------------------------------------
// Gateway envelope
// ---------------------------------------------------------------------------

/// Gateway opcodes. Unknown opcodes fail to deserialize and the envelope is
/// dropped by the session client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum OpCode {
    /// Receive: a named event with payload.
    Dispatch = 0,
    /// Send (keep-alive) / receive (server asks for an immediate heartbeat).
    Heartbeat = 1,
    /// Send: start a new session.
    Identify = 2,
    /// Send: presence change.
    StatusUpdate = 3,
    /// Send: voice channel join/leave/mute.
    VoiceStateUpdate = 4,
    /// Send: reattach to an existing session.
    Resume = 6,
    /// Receive: server asks us to reconnect.
    Reconnect = 7,
    /// Receive: session rejected, `d` carries the resumable flag.
    InvalidSession = 9,
    /// Receive: first message on a connection, carries the heartbeat interval.
    Hello = 10,
    /// Receive: confirms the last heartbeat.
    HeartbeatAck = 11,
}

/// The envelope that wraps every gateway message.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct GatewayPayload {
    pub op: OpCode,
    #[serde(default)]
    pub d: Option<serde_json::Value>,
    #[serde(default)]
    pub s: Option<u64>,
    #[serde(default)]
    pub t: Option<String>,
}

impl GatewayPayload {
    /// Build an outbound envelope (no sequence, no event name).
    pub fn new(op: OpCode, d: impl Into<Option<serde_json::Value>>) -> Self {
        Self {
            op,
            d: d.into(),
            s: None,
            t: None,
        }
    }
}

bitflags! {
    /// Gateway intents: which event families the server should send us.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Intents: u64 {
        const SERVERS = 1 << 0;
        const SERVER_MEMBERS = 1 << 1;
        const SERVER_VOICE_STATES = 1 << 7;
        const SERVER_PRESENCES = 1 << 8;
        const SERVER_MESSAGES = 1 << 9;
        const SERVER_MESSAGE_REACTIONS = 1 << 10;
        const SERVER_MESSAGE_TYPING = 1 << 11;
        const DIRECT_MESSAGES = 1 << 12;
        const MESSAGE_CONTENT = 1 << 15;
    }
}

impl Default for Intents {
    /// Everything a prefix-command bot needs.
    fn default() -> Self {
        Self::SERVERS | Self::SERVER_MESSAGES | Self::DIRECT_MESSAGES | Self::MESSAGE_CONTENT
    }
}

/// `d` of a HELLO envelope.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Hello {
    pub heartbeat_interval: u64,
}

/// Client properties sent with IDENTIFY.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct IdentifyProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
}

impl Default for IdentifyProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: env!("CARGO_PKG_NAME").to_string(),
            device: env!("CARGO_PKG_NAME").to_string(),
        }
    }
}

/// `d` of an IDENTIFY envelope.
#[derive(Debug, Clone, Serialize)]
pub struct Identify {
    pub token: String,
    pub properties: IdentifyProperties,
    pub intents: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shard: Option<[u32; 2]>,
}

/// `d` of a RESUME envelope.
#[derive(Debug, Clone, Serialize)]
pub struct Resume {
    pub token: String,
    pub session_id: String,
    pub seq: Option<u64>,
}

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct User {
    pub id: Snowflake,
    pub username: String,
    pub discriminator: Option<String>,
    pub avatar: Option<String>,
    #[serde(default)]
    pub bot: bool,
    pub global_name: Option<String>,
}

impl User {
    /// `username#1234`, or the bare username for accounts without a
    /// discriminator.
    pub fn tag(&self) -> String {
        match self.discriminator.as_deref() {
            Some(d) if d != "0" => format!("{}#{}", self.username, d),
            _ => self.username.clone(),
        }
    }

    /// The name shown in chat: global display name if set, else username.
    pub fn display_name(&self) -> &str {
        self.global_name.as_deref().unwrap_or(&self.username)
    }

    /// Mention markup that pings this user.
    pub fn mention(&self) -> String {
        format!("<@{}>", self.id)
    }
}

/// Partial user object (e.g. inside PRESENCE_UPDATE).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PartialUser {
    pub id: Snowflake,
    pub username: Option<String>,
    pub avatar: Option<String>,
    #[serde(default)]
    pub bot: bool,
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize_repr, Serialize_repr)]
#[repr(u8)]
pub enum ChannelType {
    ServerText = 0,
    Dm = 1,
    ServerVoice = 2,
    GroupDm = 3,
    ServerCategory = 4,
    ServerAnnouncement = 5,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Channel {
    pub id: Snowflake,
    #[serde(rename = "type")]
    pub kind: ChannelType,
    pub server_id: Option<Snowflake>,
    pub name: Option<String>,
    pub topic: Option<String>,
    pub position: Option<i32>,
    pub parent_id: Option<Snowflake>,
    #[serde(default)]
    pub nsfw: bool,
}

/// Body for creating or editing a channel.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChannelEdit {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<ChannelType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Snowflake>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<i32>,
}

/// `d` of CHANNEL_DELETE and similar id-only payloads.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChannelRef {
    pub id: Snowflake,
    pub server_id: Option<Snowflake>,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Message {
    pub id: Snowflake,
    pub channel_id: Snowflake,
    pub server_id: Option<Snowflake>,
    pub author: User,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub timestamp: String,
    pub edited_timestamp: Option<String>,
    #[serde(default)]
    pub mention_everyone: bool,
    #[serde(default)]
    pub mentions: Vec<User>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub embeds: Vec<Embed>,
    #[serde(default)]
    pub pinned: bool,
    pub message_reference: Option<MessageReference>,
}

impl Message {
    /// Whether a given user id is mentioned in the message.
    pub fn mentions_user(&self, user_id: &str) -> bool {
        self.mentions.iter().any(|u| u.id == user_id)
    }

    /// Creation time parsed from the RFC 3339 `timestamp` field.
    pub fn created_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        chrono::DateTime::parse_from_rfc3339(&self.timestamp)
            .ok()
            .map(|dt| dt.with_timezone(&chrono::Utc))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct MessageReference {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<Snowflake>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<Snowflake>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_id: Option<Snowflake>,
    #[serde(default)]
    pub fail_if_not_exists: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Attachment {
    pub id: Snowflake,
    pub filename: String,
    pub size: u64,
    pub url: String,
    pub content_type: Option<String>,
}

/// `d` of MESSAGE_DELETE.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MessageDelete {
    pub id: Snowflake,
    pub channel_id: Snowflake,
    pub server_id: Option<Snowflake>,
}

/// `d` of MESSAGE_UPDATE. Only the id and channel are guaranteed.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MessageUpdate {
    pub id: Snowflake,
    pub channel_id: Snowflake,
    pub server_id: Option<Snowflake>,
    pub content: Option<String>,
    pub edited_timestamp: Option<String>,
}

// ---------------------------------------------------------------------------
// Embed
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Embed {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<EmbedField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub footer: Option<EmbedFooter>,
}

impl Embed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }

    pub fn color(mut self, color: u32) -> Self {
        self.color = Some(color);
        self
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<String>, inline: bool) -> Self {
        self.fields.push(EmbedField {
            name: name.into(),
            value: value.into(),
            inline,
        });
        self
    }

    pub fn footer(mut self, text: impl Into<String>) -> Self {
        self.footer = Some(EmbedFooter { text: text.into() });
        self
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmbedFooter {
    pub text: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub inline: bool,
}

// ---------------------------------------------------------------------------
// Server, roles, members
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Server {
    pub id: Snowflake,
    pub name: String,
    pub icon: Option<String>,
    pub owner_id: Option<Snowflake>,
    pub member_count: Option<u64>,
    #[serde(default)]
    pub channels: Vec<Channel>,
    #[serde(default)]
    pub roles: Vec<Role>,
}

/// `d` of SERVER_DELETE (or a server that became unavailable).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UnavailableServer {
    pub id: Snowflake,
    #[serde(default)]
    pub unavailable: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Role {
    pub id: Snowflake,
    pub name: String,
    #[serde(default)]
    pub color: u32,
    #[serde(default)]
    pub position: i32,
    /// Permission bitset, transmitted as a string.
    #[serde(default)]
    pub permissions: String,
    #[serde(default)]
    pub mentionable: bool,
}

/// Body for creating or editing a role.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RoleEdit {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mentionable: Option<bool>,
}

/// `d` of ROLE_CREATE / ROLE_UPDATE.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RoleEvent {
    pub server_id: Snowflake,
    pub role: Role,
}

/// `d` of ROLE_DELETE.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RoleDelete {
    pub server_id: Snowflake,
    pub role_id: Snowflake,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Member {
    pub user: Option<User>,
    pub server_id: Option<Snowflake>,
    pub nick: Option<String>,
    #[serde(default)]
    pub roles: Vec<Snowflake>,
    pub joined_at: Option<String>,
}

/// `d` of MEMBER_REMOVE.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MemberRemove {
    pub server_id: Snowflake,
    pub user: User,
}

// ---------------------------------------------------------------------------
// Presence + voice
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PresenceUpdate {
    pub user: PartialUser,
    pub server_id: Option<Snowflake>,
    pub status: Option<String>,
    #[serde(default)]
    pub activities: Vec<Activity>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Activity {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Online status values accepted by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Online,
    Idle,
    Dnd,
    Invisible,
    Offline,
}

/// `d` of an outbound STATUS_UPDATE (op 3).
#[derive(Debug, Clone, Serialize)]
pub struct StatusUpdate {
    pub since: Option<u64>,
    pub activities: Vec<Activity>,
    pub status: Status,
    pub afk: bool,
}

/// `d` of an outbound VOICE_STATE_UPDATE (op 4). `channel_id: None` leaves.
#[derive(Debug, Clone, Serialize)]
pub struct VoiceStateUpdate {
    pub server_id: Snowflake,
    pub channel_id: Option<Snowflake>,
    pub self_mute: bool,
    pub self_deaf: bool,
}

/// `d` of an inbound VOICE_STATE_UPDATE dispatch.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VoiceState {
    pub server_id: Option<Snowflake>,
    pub channel_id: Option<Snowflake>,
    pub user_id: Snowflake,
    #[serde(default)]
    pub self_mute: bool,
    #[serde(default)]
    pub self_deaf: bool,
}

/// `d` of TYPING_START.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TypingStart {
    pub channel_id: Snowflake,
    pub server_id: Option<Snowflake>,
    pub user_id: Snowflake,
    pub timestamp: u64,
}

// ---------------------------------------------------------------------------
// READY
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReadyEvent {
    pub session_id: String,
    /// Absent on servers that do not expose a separate resume endpoint.
    pub user: Option<User>,
    pub resume_gateway_url: Option<String>,
    #[serde(default)]
    pub servers: Vec<UnavailableServer>,
}

// ---------------------------------------------------------------------------
// Outbound message body (for REST POST /channels/{id}/messages)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize)]
pub struct CreateMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embeds: Option<Vec<Embed>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_reference: Option<MessageReference>,
}

impl CreateMessage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn content(mut self, text: impl Into<String>) -> Self {
        self.content = Some(text.into());
        self
    }

    pub fn embed(mut self, embed: Embed) -> Self {
        self.embeds.get_or_insert_with(Vec::new).push(embed);
        self
    }

    pub fn reply_to(mut self, message_id: impl Into<String>) -> Self {
        self.message_reference = Some(MessageReference {
            message_id: Some(message_id.into()),
            ..Default::default()
        });
        self
    }
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
    pub token: String,
    pub user: Option<User>,
}

// ---------------------------------------------------------------------------
// Rate-limit info parsed from response headers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateLimitInfo {
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    /// Epoch seconds at which the bucket refills.
    pub reset_at: Option<f64>,
    /// Seconds until the bucket refills; preferred over `reset_at`.
    pub reset_after: Option<f64>,
    pub is_global: bool,
}

impl RateLimitInfo {
    /// Whether the response carried any bucket information at all.
    pub fn is_empty(&self) -> bool {
        self.limit.is_none()
            && self.remaining.is_none()
            && self.reset_at.is_none()
            && self.reset_after.is_none()
            && !self.is_global
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

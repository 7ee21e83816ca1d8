//! Typed REST and gateway wrappers exposed by [`crate::client::Client`].
//!
//! Each sub-API is a thin layer over [`HttpClient`]: it builds the path,
//! serialises the body and hands back the [`ApiResponse`] envelope untouched,
//! so application-level rejections stay values rather than errors.

use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde_json::json;

use crate::commands::Outbound;
use crate::error::BotResult;
use crate::gateway::GatewayClient;
use crate::http::{ApiResponse, HttpClient, NoContent};
use crate::types::{
    Activity, Channel, ChannelEdit, CreateMessage, Member, Message, OpCode, Role, RoleEdit,
    Server, Status, StatusUpdate, VoiceStateUpdate,
};

/// Everything outside the RFC 3986 unreserved set.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Percent-encode one path segment (emoji, names).
fn encode_segment(segment: &str) -> String {
    utf8_percent_encode(segment, SEGMENT).to_string()
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MessagesApi {
    http: HttpClient,
}

impl MessagesApi {
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }

    pub async fn send(&self, channel_id: &str, body: &CreateMessage) -> BotResult<ApiResponse<Message>> {
        self.http
            .post(&format!("channels/{channel_id}/messages"), body)
            .await
    }

    /// Send plain text.
    pub async fn say(&self, channel_id: &str, content: &str) -> BotResult<ApiResponse<Message>> {
        self.send(channel_id, &CreateMessage::new().content(content))
            .await
    }

    /// Send a file with optional text.
    pub async fn send_file(
        &self,
        channel_id: &str,
        content: Option<&str>,
        filename: &str,
        file: Vec<u8>,
    ) -> BotResult<ApiResponse<Message>> {
        let payload = content.map(|c| json!({ "content": c }));
        self.http
            .upload(
                &format!("channels/{channel_id}/messages"),
                filename,
                file,
                payload.as_ref(),
            )
            .await
    }

    pub async fn get(&self, channel_id: &str, message_id: &str) -> BotResult<ApiResponse<Message>> {
        self.http
            .get(&format!("channels/{channel_id}/messages/{message_id}"))
            .await
    }

    /// Up to `limit` messages, newest first, optionally older than `before`.
    pub async fn list(
        &self,
        channel_id: &str,
        limit: u32,
        before: Option<&str>,
    ) -> BotResult<ApiResponse<Vec<Message>>> {
        let mut path = format!("channels/{channel_id}/messages?limit={}", limit.clamp(1, 100));
        if let Some(before) = before {
            path.push_str(&format!("&before={before}"));
        }
        self.http.get(&path).await
    }

    pub async fn edit(
        &self,
        channel_id: &str,
        message_id: &str,
        content: &str,
    ) -> BotResult<ApiResponse<Message>> {
        self.http
            .patch(
                &format!("channels/{channel_id}/messages/{message_id}"),
                &json!({ "content": content }),
            )
            .await
    }

    pub async fn delete(&self, channel_id: &str, message_id: &str) -> BotResult<ApiResponse<NoContent>> {
        self.http
            .delete(&format!("channels/{channel_id}/messages/{message_id}"))
            .await
    }

    pub async fn react(
        &self,
        channel_id: &str,
        message_id: &str,
        emoji: &str,
    ) -> BotResult<ApiResponse<NoContent>> {
        self.http
            .put(
                &format!(
                    "channels/{channel_id}/messages/{message_id}/reactions/{}/@me",
                    encode_segment(emoji)
                ),
                &json!({}),
            )
            .await
    }

    pub async fn unreact(
        &self,
        channel_id: &str,
        message_id: &str,
        emoji: &str,
    ) -> BotResult<ApiResponse<NoContent>> {
        self.http
            .delete(&format!(
                "channels/{channel_id}/messages/{message_id}/reactions/{}/@me",
                encode_segment(emoji)
            ))
            .await
    }

    /// Count messages in a channel by paging backwards, capped at 10 000.
    pub async fn count(&self, channel_id: &str) -> BotResult<usize> {
        let mut count = 0usize;
        let mut before: Option<String> = None;

        for _ in 0..100 {
            let page = self
                .list(channel_id, 100, before.as_deref())
                .await?
                .into_data()?;
            count += page.len();
            before = page.last().map(|m| m.id.clone());
            if page.len() < 100 {
                break;
            }
        }
        Ok(count)
    }
}

#[async_trait]
impl Outbound for MessagesApi {
    async fn send_message(&self, channel_id: &str, body: &CreateMessage) -> BotResult<Message> {
        self.send(channel_id, body).await?.into_data()
    }

    async fn edit_message(
        &self,
        channel_id: &str,
        message_id: &str,
        content: &str,
    ) -> BotResult<Message> {
        self.edit(channel_id, message_id, content).await?.into_data()
    }

    async fn delete_message(&self, channel_id: &str, message_id: &str) -> BotResult<()> {
        self.delete(channel_id, message_id).await?.into_unit()
    }

    async fn add_reaction(&self, channel_id: &str, message_id: &str, emoji: &str) -> BotResult<()> {
        self.react(channel_id, message_id, emoji).await?.into_unit()
    }
}

// ---------------------------------------------------------------------------
// Servers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ServersApi {
    http: HttpClient,
}

impl ServersApi {
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }

    pub async fn get(&self, server_id: &str) -> BotResult<ApiResponse<Server>> {
        self.http.get(&format!("servers/{server_id}")).await
    }

    /// Servers the current user belongs to.
    pub async fn list(&self) -> BotResult<ApiResponse<Vec<Server>>> {
        self.http.get("users/@me/servers").await
    }

    pub async fn members(&self, server_id: &str, limit: u32) -> BotResult<ApiResponse<Vec<Member>>> {
        self.http
            .get(&format!(
                "servers/{server_id}/members?limit={}",
                limit.clamp(1, 1000)
            ))
            .await
    }

    pub async fn leave(&self, server_id: &str) -> BotResult<ApiResponse<NoContent>> {
        self.http
            .delete(&format!("users/@me/servers/{server_id}"))
            .await
    }
}

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ChannelsApi {
    http: HttpClient,
}

impl ChannelsApi {
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }

    pub async fn get(&self, channel_id: &str) -> BotResult<ApiResponse<Channel>> {
        self.http.get(&format!("channels/{channel_id}")).await
    }

    pub async fn list(&self, server_id: &str) -> BotResult<ApiResponse<Vec<Channel>>> {
        self.http.get(&format!("servers/{server_id}/channels")).await
    }

    pub async fn create(&self, server_id: &str, channel: &ChannelEdit) -> BotResult<ApiResponse<Channel>> {
        self.http
            .post(&format!("servers/{server_id}/channels"), channel)
            .await
    }

    pub async fn update(&self, channel_id: &str, edit: &ChannelEdit) -> BotResult<ApiResponse<Channel>> {
        self.http.patch(&format!("channels/{channel_id}"), edit).await
    }

    pub async fn delete(&self, channel_id: &str) -> BotResult<ApiResponse<NoContent>> {
        self.http.delete(&format!("channels/{channel_id}")).await
    }

    /// Show the typing indicator.
    pub async fn typing(&self, channel_id: &str) -> BotResult<ApiResponse<NoContent>> {
        self.http
            .post(&format!("channels/{channel_id}/typing"), &json!({}))
            .await
    }
}

// ---------------------------------------------------------------------------
// Roles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RolesApi {
    http: HttpClient,
}

impl RolesApi {
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }

    pub async fn list(&self, server_id: &str) -> BotResult<ApiResponse<Vec<Role>>> {
        self.http.get(&format!("servers/{server_id}/roles")).await
    }

    pub async fn create(&self, server_id: &str, role: &RoleEdit) -> BotResult<ApiResponse<Role>> {
        self.http
            .post(&format!("servers/{server_id}/roles"), role)
            .await
    }

    pub async fn update(
        &self,
        server_id: &str,
        role_id: &str,
        edit: &RoleEdit,
    ) -> BotResult<ApiResponse<Role>> {
        self.http
            .patch(&format!("servers/{server_id}/roles/{role_id}"), edit)
            .await
    }

    pub async fn delete(&self, server_id: &str, role_id: &str) -> BotResult<ApiResponse<NoContent>> {
        self.http
            .delete(&format!("servers/{server_id}/roles/{role_id}"))
            .await
    }

    /// Give a member a role.
    pub async fn assign(
        &self,
        server_id: &str,
        user_id: &str,
        role_id: &str,
    ) -> BotResult<ApiResponse<NoContent>> {
        self.http
            .put(
                &format!("servers/{server_id}/members/{user_id}/roles/{role_id}"),
                &json!({}),
            )
            .await
    }

    /// Take a role away from a member.
    pub async fn remove(
        &self,
        server_id: &str,
        user_id: &str,
        role_id: &str,
    ) -> BotResult<ApiResponse<NoContent>> {
        self.http
            .delete(&format!(
                "servers/{server_id}/members/{user_id}/roles/{role_id}"
            ))
            .await
    }
}

// ---------------------------------------------------------------------------
// Presence (gateway op 3)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PresenceApi {
    gateway: GatewayClient,
}

impl PresenceApi {
    pub fn new(gateway: GatewayClient) -> Self {
        Self { gateway }
    }

    pub async fn update(&self, update: &StatusUpdate) -> BotResult<()> {
        self.gateway
            .send(OpCode::StatusUpdate, serde_json::to_value(update)?)
            .await
    }

    pub async fn set_status(&self, status: Status) -> BotResult<()> {
        self.update(&status_update(status, None)).await
    }

    /// Show `name` as the current activity (type 0, "Playing").
    pub async fn set_activity(&self, status: Status, name: impl Into<String>) -> BotResult<()> {
        let activity = Activity {
            name: name.into(),
            kind: 0,
            url: None,
        };
        self.update(&status_update(status, Some(activity))).await
    }
}

fn status_update(status: Status, activity: Option<Activity>) -> StatusUpdate {
    StatusUpdate {
        since: None,
        activities: activity.into_iter().collect(),
        status,
        afk: false,
    }
}

// ---------------------------------------------------------------------------
// Voice (gateway op 4)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct VoiceApi {
    gateway: GatewayClient,
}

impl VoiceApi {
    pub fn new(gateway: GatewayClient) -> Self {
        Self { gateway }
    }

    pub async fn update(&self, state: &VoiceStateUpdate) -> BotResult<()> {
        self.gateway
            .send(OpCode::VoiceStateUpdate, serde_json::to_value(state)?)
            .await
    }

    pub async fn join(&self, server_id: &str, channel_id: &str) -> BotResult<()> {
        self.update(&VoiceStateUpdate {
            server_id: server_id.to_string(),
            channel_id: Some(channel_id.to_string()),
            self_mute: false,
            self_deaf: false,
        })
        .await
    }

    pub async fn leave(&self, server_id: &str) -> BotResult<()> {
        self.update(&VoiceStateUpdate {
            server_id: server_id.to_string(),
            channel_id: None,
            self_mute: false,
            self_deaf: false,
        })
        .await
    }

    /// Change mute/deafen flags while staying in `channel_id`.
    pub async fn set_mute(
        &self,
        server_id: &str,
        channel_id: &str,
        mute: bool,
        deaf: bool,
    ) -> BotResult<()> {
        self.update(&VoiceStateUpdate {
            server_id: server_id.to_string(),
            channel_id: Some(channel_id.to_string()),
            self_mute: mute,
            self_deaf: deaf,
        })
        .await
    }
}

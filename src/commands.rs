//! Prefix commands: model, registry, invocation context and cooldowns.
//!
//! A [`Command`] is matched from message text such as `!roll 20` or
//! `<@bot_id> roll 20`. Names and aliases are case-insensitive and unique
//! across the whole registry.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::{BotError, BotResult};
use crate::framework::Framework;
use crate::types::{CreateMessage, Message, User};

// ---------------------------------------------------------------------------
// Side-effect seam
// ---------------------------------------------------------------------------

/// Where command side effects go. Implemented by the REST messages API;
/// tests substitute a recorder.
#[async_trait]
pub trait Outbound: Send + Sync + 'static {
    async fn send_message(&self, channel_id: &str, body: &CreateMessage) -> BotResult<Message>;

    async fn edit_message(
        &self,
        channel_id: &str,
        message_id: &str,
        content: &str,
    ) -> BotResult<Message>;

    async fn delete_message(&self, channel_id: &str, message_id: &str) -> BotResult<()>;

    async fn add_reaction(&self, channel_id: &str, message_id: &str, emoji: &str)
        -> BotResult<()>;
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    async fn call(&self, ctx: Arc<Context>) -> BotResult<()>;
}

#[async_trait]
impl<F, Fut> CommandHandler for F
where
    F: Fn(Arc<Context>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = BotResult<()>> + Send + 'static,
{
    async fn call(&self, ctx: Arc<Context>) -> BotResult<()> {
        (self)(ctx).await
    }
}

// ---------------------------------------------------------------------------
// Command
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Command {
    name: String,
    aliases: Vec<String>,
    description: String,
    usage: Option<String>,
    cooldown: Duration,
    owner_only: bool,
    handler: Arc<dyn CommandHandler>,
}

impl Command {
    pub fn new(name: impl AsRef<str>, handler: impl CommandHandler) -> Self {
        Self {
            name: name.as_ref().trim().to_lowercase(),
            aliases: Vec::new(),
            description: String::new(),
            usage: None,
            cooldown: Duration::ZERO,
            owner_only: false,
            handler: Arc::new(handler),
        }
    }

    pub fn alias(mut self, alias: impl AsRef<str>) -> Self {
        let alias = alias.as_ref().trim().to_lowercase();
        if !self.aliases.contains(&alias) {
            self.aliases.push(alias);
        }
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Argument synopsis shown by help, e.g. `[sides]`.
    pub fn usage(mut self, usage: impl Into<String>) -> Self {
        self.usage = Some(usage.into());
        self
    }

    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn owner_only(mut self, owner_only: bool) -> Self {
        self.owner_only = owner_only;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn aliases(&self) -> &[String] {
        &self.aliases
    }

    pub fn get_description(&self) -> &str {
        &self.description
    }

    pub fn get_usage(&self) -> Option<&str> {
        self.usage.as_deref()
    }

    pub fn get_cooldown(&self) -> Duration {
        self.cooldown
    }

    pub fn is_owner_only(&self) -> bool {
        self.owner_only
    }

    pub(crate) fn handler(&self) -> Arc<dyn CommandHandler> {
        Arc::clone(&self.handler)
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("name", &self.name)
            .field("aliases", &self.aliases)
            .field("cooldown", &self.cooldown)
            .field("owner_only", &self.owner_only)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RegistryInner {
    commands: HashMap<String, Arc<Command>>,
    /// alias -> canonical name
    aliases: HashMap<String, String>,
}

impl RegistryInner {
    fn is_taken(&self, key: &str) -> bool {
        self.commands.contains_key(key) || self.aliases.contains_key(key)
    }
}

/// Name/alias → command map. Lookups hand out an `Arc<Command>` so the lock
/// is never held while a handler runs.
#[derive(Default)]
pub struct CommandRegistry {
    inner: RwLock<RegistryInner>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, RegistryInner> {
        self.inner.write().unwrap_or_else(|p| p.into_inner())
    }

    pub fn register(&self, command: Command) -> BotResult<()> {
        if command.name.is_empty() || command.name.contains(char::is_whitespace) {
            return Err(BotError::Config(format!(
                "invalid command name {:?}",
                command.name
            )));
        }

        let mut inner = self.write();
        if inner.is_taken(&command.name) {
            return Err(BotError::DuplicateCommand(command.name));
        }
        for alias in &command.aliases {
            if *alias == command.name || inner.is_taken(alias) {
                return Err(BotError::DuplicateCommand(alias.clone()));
            }
        }

        for alias in &command.aliases {
            inner.aliases.insert(alias.clone(), command.name.clone());
        }
        inner
            .commands
            .insert(command.name.clone(), Arc::new(command));
        Ok(())
    }

    /// Remove a command by name or alias. In-flight invocations finish.
    pub fn unregister(&self, name: &str) -> Option<Arc<Command>> {
        let key = name.trim().to_lowercase();
        let mut inner = self.write();
        let canonical = inner.aliases.get(&key).cloned().unwrap_or(key);
        let command = inner.commands.remove(&canonical)?;
        for alias in &command.aliases {
            inner.aliases.remove(alias);
        }
        Some(command)
    }

    /// Look up by name or alias, case-insensitively.
    pub fn resolve(&self, name: &str) -> Option<Arc<Command>> {
        let key = name.to_lowercase();
        let inner = self.read();
        let canonical = inner.aliases.get(&key).unwrap_or(&key);
        inner.commands.get(canonical).cloned()
    }

    /// All commands, sorted by name.
    pub fn list(&self) -> Vec<Arc<Command>> {
        let mut commands: Vec<_> = self.read().commands.values().cloned().collect();
        commands.sort_by(|a, b| a.name.cmp(&b.name));
        commands
    }

    pub fn len(&self) -> usize {
        self.read().commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Cooldowns
// ---------------------------------------------------------------------------

/// Records kept before expired ones are swept on the next stamp.
const COOLDOWN_SWEEP_AT: usize = 1024;

/// When each `(user_id, command)` pair may run again.
#[derive(Debug, Default)]
pub struct Cooldowns {
    until: Mutex<HashMap<(String, String), Instant>>,
}

impl Cooldowns {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit and stamp, or return how long is left. Check and stamp happen
    /// under one lock; a refusal does not restart the window.
    pub fn check_and_stamp(
        &self,
        user_id: &str,
        command: &str,
        cooldown: Duration,
    ) -> Result<(), Duration> {
        if cooldown.is_zero() {
            return Ok(());
        }
        let now = Instant::now();
        let mut until = self.until.lock().unwrap_or_else(|p| p.into_inner());
        let key = (user_id.to_string(), command.to_string());

        if let Some(ready_at) = until.get(&key) {
            if *ready_at > now {
                return Err(*ready_at - now);
            }
        }
        if until.len() >= COOLDOWN_SWEEP_AT {
            until.retain(|_, ready_at| *ready_at > now);
        }
        until.insert(key, now + cooldown);
        Ok(())
    }

    /// Number of records currently held.
    pub fn len(&self) -> usize {
        self.until.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every record for `command`.
    pub fn clear_command(&self, command: &str) {
        self.until
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .retain(|(_, cmd), _| cmd != command);
    }
}

// ---------------------------------------------------------------------------
// Prefix parsing
// ---------------------------------------------------------------------------

/// A message that addressed the bot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// The prefix that matched, e.g. `!` or `<@123>`.
    pub prefix: String,
    /// Command token as typed (not yet lower-cased or alias-resolved).
    pub name: String,
    pub args: Vec<String>,
}

/// Split `content` into prefix, command token and arguments.
///
/// Accepts the literal `prefix`, and when `bot_id` is given also `<@id>` and
/// `<@!id>`. After a mention the literal prefix is optional, so both
/// `<@1> ping` and `<@1> !ping` match.
pub fn parse_invocation(content: &str, prefix: &str, bot_id: Option<&str>) -> Option<Invocation> {
    let content = content.trim();
    if content.is_empty() {
        return None;
    }

    let (matched, rest) = match strip_mention(content, bot_id) {
        Some((mention, rest)) => {
            let rest = rest.trim_start();
            let rest = if prefix.is_empty() {
                rest
            } else {
                rest.strip_prefix(prefix).unwrap_or(rest)
            };
            (mention, rest)
        }
        None if !prefix.is_empty() => (prefix.to_string(), content.strip_prefix(prefix)?),
        None => return None,
    };

    let mut tokens = rest.split_whitespace();
    let name = tokens.next()?.to_string();
    Some(Invocation {
        prefix: matched,
        name,
        args: tokens.map(str::to_string).collect(),
    })
}

fn strip_mention<'a>(content: &'a str, bot_id: Option<&str>) -> Option<(String, &'a str)> {
    let id = bot_id?;
    [format!("<@{id}>"), format!("<@!{id}>")]
        .into_iter()
        .find_map(|tag| {
            let rest = content.strip_prefix(tag.as_str())?;
            Some((tag, rest))
        })
}

// ---------------------------------------------------------------------------
// Invocation context
// ---------------------------------------------------------------------------

/// Everything a handler needs for one matched message.
pub struct Context {
    /// Canonical command name.
    pub command: String,
    /// The token the user actually typed (may be an alias).
    pub invoked_as: String,
    pub args: Vec<String>,
    pub prefix: String,
    pub message: Message,
    framework: Framework,
}

impl Context {
    pub(crate) fn new(
        command: &Command,
        invocation: Invocation,
        message: Message,
        framework: Framework,
    ) -> Self {
        Self {
            command: command.name.clone(),
            invoked_as: invocation.name,
            args: invocation.args,
            prefix: invocation.prefix,
            message,
            framework,
        }
    }

    pub fn author(&self) -> &User {
        &self.message.author
    }

    pub fn channel_id(&self) -> &str {
        &self.message.channel_id
    }

    pub fn arg(&self, index: usize) -> Option<&str> {
        self.args.get(index).map(String::as_str)
    }

    /// All arguments joined by single spaces.
    pub fn rest(&self) -> String {
        self.args.join(" ")
    }

    pub fn framework(&self) -> &Framework {
        &self.framework
    }

    /// Reply to the invoking message.
    pub async fn reply(&self, text: impl Into<String>) -> BotResult<Message> {
        let body = CreateMessage::new().content(text).reply_to(&self.message.id);
        self.reply_with(body).await
    }

    pub async fn reply_with(&self, body: CreateMessage) -> BotResult<Message> {
        self.framework
            .outbound()
            .send_message(&self.message.channel_id, &body)
            .await
    }

    /// Post to the invoking channel without a reply reference.
    pub async fn send(&self, text: impl Into<String>) -> BotResult<Message> {
        self.send_to(&self.message.channel_id, text).await
    }

    pub async fn send_to(&self, channel_id: &str, text: impl Into<String>) -> BotResult<Message> {
        let body = CreateMessage::new().content(text);
        self.framework.outbound().send_message(channel_id, &body).await
    }

    /// React to the invoking message.
    pub async fn react(&self, emoji: &str) -> BotResult<()> {
        self.framework
            .outbound()
            .add_reaction(&self.message.channel_id, &self.message.id, emoji)
            .await
    }

    /// Delete the invoking message.
    pub async fn delete(&self) -> BotResult<()> {
        self.framework
            .outbound()
            .delete_message(&self.message.channel_id, &self.message.id)
            .await
    }

    /// Edit a message previously sent by the bot.
    pub async fn edit(&self, message: &Message, content: &str) -> BotResult<Message> {
        self.framework
            .outbound()
            .edit_message(&message.channel_id, &message.id, content)
            .await
    }

    pub async fn wait(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("command", &self.command)
            .field("args", &self.args)
            .field("prefix", &self.prefix)
            .field("message_id", &self.message.id)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use serde_json::json;

    /// One recorded side effect.
    #[derive(Debug, Clone, PartialEq)]
    pub enum Effect {
        Send {
            channel_id: String,
            content: Option<String>,
            reply_to: Option<String>,
        },
        Edit {
            message_id: String,
            content: String,
        },
        Delete {
            message_id: String,
        },
        React {
            message_id: String,
            emoji: String,
        },
    }

    #[derive(Debug, Default)]
    pub struct RecordingOutbound {
        pub effects: Mutex<Vec<Effect>>,
    }

    impl RecordingOutbound {
        pub fn effects(&self) -> Vec<Effect> {
            self.effects.lock().unwrap().clone()
        }

        pub fn replies(&self) -> Vec<String> {
            self.effects()
                .into_iter()
                .filter_map(|e| match e {
                    Effect::Send { content, .. } => content,
                    _ => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl Outbound for RecordingOutbound {
        async fn send_message(
            &self,
            channel_id: &str,
            body: &CreateMessage,
        ) -> BotResult<Message> {
            self.effects.lock().unwrap().push(Effect::Send {
                channel_id: channel_id.to_string(),
                content: body.content.clone(),
                reply_to: body
                    .message_reference
                    .as_ref()
                    .and_then(|r| r.message_id.clone()),
            });
            Ok(message("bot", channel_id, body.content.as_deref().unwrap_or("")))
        }

        async fn edit_message(
            &self,
            channel_id: &str,
            message_id: &str,
            content: &str,
        ) -> BotResult<Message> {
            self.effects.lock().unwrap().push(Effect::Edit {
                message_id: message_id.to_string(),
                content: content.to_string(),
            });
            Ok(message("bot", channel_id, content))
        }

        async fn delete_message(&self, _channel_id: &str, message_id: &str) -> BotResult<()> {
            self.effects.lock().unwrap().push(Effect::Delete {
                message_id: message_id.to_string(),
            });
            Ok(())
        }

        async fn add_reaction(
            &self,
            _channel_id: &str,
            message_id: &str,
            emoji: &str,
        ) -> BotResult<()> {
            self.effects.lock().unwrap().push(Effect::React {
                message_id: message_id.to_string(),
                emoji: emoji.to_string(),
            });
            Ok(())
        }
    }

    pub fn message(author_id: &str, channel_id: &str, content: &str) -> Message {
        serde_json::from_value(json!({
            "id": format!("m-{author_id}-{}", content.len()),
            "channel_id": channel_id,
            "author": {"id": author_id, "username": format!("user{author_id}"), "bot": author_id == "bot"},
            "content": content,
            "timestamp": "2024-01-01T00:00:00Z"
        }))
        .unwrap()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

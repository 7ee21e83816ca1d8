//! Command runtime: turns inbound messages into command invocations.
//!
//! Per message: ignore bots and blank text, match the prefix, resolve the
//! command (aliases included), enforce owner-only and cooldown with an
//! explicit refusal reply, then run the middleware chain ending in the
//! handler. Handler errors and panics are logged and reported in the
//! returned [`DispatchOutcome`]; they never reach the caller as a panic.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bus::EventBus;
use crate::commands::{
    parse_invocation, Command, CommandRegistry, Context, Cooldowns, Outbound,
};
use crate::config::BotConfig;
use crate::error::{BotError, BotResult};
use crate::events::BotEvent;
use crate::middleware::{Middleware, Next};
use crate::scheduler::Scheduler;
use crate::types::{CreateMessage, Message};

// ---------------------------------------------------------------------------
// Plugins
// ---------------------------------------------------------------------------

/// A bundle of commands, middleware and jobs installed as a unit.
#[async_trait]
pub trait Plugin: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Install into the framework. An error aborts the load.
    async fn setup(&self, framework: &Framework) -> BotResult<()>;

    /// Undo `setup`. Errors are logged by the framework.
    async fn teardown(&self, _framework: &Framework) -> BotResult<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Why a matched command was not run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Refusal {
    OwnerOnly,
    Cooldown { remaining: Duration },
}

impl Refusal {
    /// Text replied to the invoking user.
    pub fn message(&self, command: &str) -> String {
        match self {
            Refusal::OwnerOnly => "This command is restricted to bot owners.".to_string(),
            Refusal::Cooldown { remaining } => format!(
                "Please wait {:.1}s before using `{}` again.",
                remaining.as_secs_f64(),
                command
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Not addressed to us: bot author, blank, no prefix, unknown command.
    Ignored,
    Refused(Refusal),
    Completed,
    /// The chain or handler returned an error or panicked.
    Failed(String),
}

// ---------------------------------------------------------------------------
// Framework
// ---------------------------------------------------------------------------

/// A plugin name is reserved while its setup runs, so a second load of the
/// same name fails without holding the map across the await.
enum PluginSlot {
    Loading,
    Loaded(Arc<dyn Plugin>),
}

struct FrameworkInner {
    prefix: String,
    mention_prefix: bool,
    owners: HashSet<String>,
    identity: RwLock<Option<String>>,
    registry: CommandRegistry,
    middleware: RwLock<Vec<Arc<dyn Middleware>>>,
    cooldowns: Cooldowns,
    scheduler: Scheduler,
    plugins: async_lock::Mutex<HashMap<String, PluginSlot>>,
    outbound: Arc<dyn Outbound>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

/// Shared handle to the command runtime. Cheap to clone.
#[derive(Clone)]
pub struct Framework {
    inner: Arc<FrameworkInner>,
}

impl Framework {
    pub fn new(config: &BotConfig, outbound: Arc<dyn Outbound>) -> Self {
        Self {
            inner: Arc::new(FrameworkInner {
                prefix: config.prefix.clone(),
                mention_prefix: config.mention_prefix,
                owners: config.owner_ids.clone(),
                identity: RwLock::new(None),
                registry: CommandRegistry::new(),
                middleware: RwLock::new(Vec::new()),
                cooldowns: Cooldowns::new(),
                scheduler: Scheduler::new(),
                plugins: async_lock::Mutex::new(HashMap::new()),
                outbound,
                listener: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn outbound(&self) -> &Arc<dyn Outbound> {
        &self.inner.outbound
    }

    pub fn prefix(&self) -> &str {
        &self.inner.prefix
    }

    pub fn is_owner(&self, user_id: &str) -> bool {
        self.inner.owners.contains(user_id)
    }

    /// Our own user id, used for the mention prefix. Set from READY when
    /// attached to a bus.
    pub fn set_identity(&self, user_id: impl Into<String>) {
        let user_id = user_id.into();
        debug!(user_id = %user_id, "command runtime identity set");
        *self.inner.identity.write().unwrap_or_else(|p| p.into_inner()) = Some(user_id);
    }

    pub fn identity(&self) -> Option<String> {
        self.inner
            .identity
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    pub fn register(&self, command: Command) -> BotResult<()> {
        let name = command.name().to_string();
        self.inner.registry.register(command)?;
        info!(command = %name, "registered command");
        Ok(())
    }

    /// Stop matching a command. Invocations already running are unaffected.
    pub fn unregister(&self, name: &str) -> bool {
        match self.inner.registry.unregister(name) {
            Some(command) => {
                self.inner.cooldowns.clear_command(command.name());
                info!(command = %command.name(), "unregistered command");
                true
            }
            None => false,
        }
    }

    pub fn command(&self, name: &str) -> Option<Arc<Command>> {
        self.inner.registry.resolve(name)
    }

    /// Registered commands sorted by name.
    pub fn commands(&self) -> Vec<Arc<Command>> {
        self.inner.registry.list()
    }

    /// Append to the middleware chain. Applies to dispatches that start
    /// afterwards.
    pub fn use_middleware(&self, middleware: impl Middleware) {
        self.inner
            .middleware
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(Arc::new(middleware));
    }

    // ------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------

    pub fn schedule<F, Fut>(&self, id: impl Into<String>, every: Duration, task: F) -> BotResult<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = BotResult<()>> + Send + 'static,
    {
        self.inner.scheduler.schedule(id, every, task)
    }

    pub fn cancel_job(&self, id: &str) -> bool {
        self.inner.scheduler.cancel(id)
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    // ------------------------------------------------------------------
    // Plugins
    // ------------------------------------------------------------------

    /// Run the plugin's setup, then record it as loaded. A setup error is
    /// returned and the plugin is not recorded.
    pub async fn load_plugin(&self, plugin: impl Plugin) -> BotResult<()> {
        let name = plugin.name().to_string();
        {
            let mut plugins = self.inner.plugins.lock().await;
            if plugins.contains_key(&name) {
                return Err(BotError::Plugin {
                    name,
                    message: "already loaded".to_string(),
                });
            }
            plugins.insert(name.clone(), PluginSlot::Loading);
        }

        // Setup may call back into the framework; the map is unlocked here.
        if let Err(e) = plugin.setup(self).await {
            warn!(plugin = %name, error = %e, "plugin setup failed");
            self.inner.plugins.lock().await.remove(&name);
            return Err(e);
        }

        self.inner
            .plugins
            .lock()
            .await
            .insert(name.clone(), PluginSlot::Loaded(Arc::new(plugin)));
        info!(plugin = %name, "plugin loaded");
        Ok(())
    }

    /// Remove a plugin and run its teardown. Returns whether it was loaded.
    pub async fn unload_plugin(&self, name: &str) -> bool {
        let plugin = {
            let mut plugins = self.inner.plugins.lock().await;
            // Still loading (or absent): nothing to tear down yet.
            if !matches!(plugins.get(name), Some(PluginSlot::Loaded(_))) {
                return false;
            }
            match plugins.remove(name) {
                Some(PluginSlot::Loaded(plugin)) => plugin,
                _ => return false,
            }
        };
        if let Err(e) = plugin.teardown(self).await {
            error!(plugin = %name, error = %e, "plugin teardown failed");
        }
        info!(plugin = %name, "plugin unloaded");
        true
    }

    pub async fn plugin_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .plugins
            .lock()
            .await
            .iter()
            .filter(|(_, slot)| matches!(slot, PluginSlot::Loaded(_)))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Run one inbound message through the pipeline.
    pub async fn dispatch(&self, message: Message) -> DispatchOutcome {
        if message.author.bot {
            return DispatchOutcome::Ignored;
        }

        let identity = self.identity().filter(|_| self.inner.mention_prefix);
        let Some(invocation) =
            parse_invocation(&message.content, &self.inner.prefix, identity.as_deref())
        else {
            return DispatchOutcome::Ignored;
        };

        let Some(command) = self.inner.registry.resolve(&invocation.name) else {
            debug!(command = %invocation.name, "unknown command, ignoring");
            return DispatchOutcome::Ignored;
        };

        info!(
            command = %command.name(),
            author = %message.author.tag(),
            channel_id = %message.channel_id,
            "handling command"
        );

        if command.is_owner_only() && !self.is_owner(&message.author.id) {
            return self.refuse(&command, &message, Refusal::OwnerOnly).await;
        }

        if let Err(remaining) = self.inner.cooldowns.check_and_stamp(
            &message.author.id,
            command.name(),
            command.get_cooldown(),
        ) {
            return self
                .refuse(&command, &message, Refusal::Cooldown { remaining })
                .await;
        }

        let chain: Arc<[Arc<dyn Middleware>]> = self
            .inner
            .middleware
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .into();
        let ctx = Arc::new(Context::new(&command, invocation, message, self.clone()));
        let run = Next::start(chain, command.handler()).run(ctx);

        match tokio::spawn(run).await {
            Ok(Ok(())) => DispatchOutcome::Completed,
            Ok(Err(e)) => {
                error!(command = %command.name(), error = %e, "command failed");
                DispatchOutcome::Failed(e.to_string())
            }
            Err(e) => {
                error!(command = %command.name(), error = %e, "command panicked");
                DispatchOutcome::Failed(format!("command `{}` panicked", command.name()))
            }
        }
    }

    async fn refuse(&self, command: &Command, message: &Message, refusal: Refusal) -> DispatchOutcome {
        info!(command = %command.name(), author = %message.author.id, ?refusal, "command refused");
        let body = CreateMessage::new()
            .content(refusal.message(command.name()))
            .reply_to(&message.id);
        if let Err(e) = self.inner.outbound.send_message(&message.channel_id, &body).await {
            warn!(error = %e, "failed to send refusal reply");
        }
        DispatchOutcome::Refused(refusal)
    }

    // ------------------------------------------------------------------
    // Bus attachment
    // ------------------------------------------------------------------

    /// Subscribe to the bus: READY sets the identity and every
    /// MESSAGE_CREATE is dispatched on its own task. Replaces an earlier
    /// attachment.
    pub fn attach(&self, bus: &EventBus) {
        let events = bus.subscribe();
        let framework = self.clone();
        let handle = tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                match event {
                    BotEvent::Ready(ready) => {
                        if let Some(user) = ready.user {
                            framework.set_identity(user.id);
                        }
                    }
                    BotEvent::MessageCreate(message) => {
                        let framework = framework.clone();
                        tokio::spawn(async move {
                            let message_id = message.id.clone();
                            let outcome = framework.dispatch(message).await;
                            debug!(message_id = %message_id, ?outcome, "dispatch finished");
                        });
                    }
                    _ => {}
                }
            }
            debug!("event bus closed, command runtime detached");
        });

        if let Some(previous) = self
            .inner
            .listener
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .replace(handle)
        {
            previous.abort();
        }
    }

    pub fn detach(&self) {
        if let Some(handle) = self
            .inner
            .listener
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            handle.abort();
        }
    }

    /// Detach from the bus, cancel all jobs and unload all plugins.
    pub async fn shutdown(&self) {
        self.detach();
        self.inner.scheduler.cancel_all();
        for name in self.plugin_names().await {
            self.unload_plugin(&name).await;
        }
    }
}

impl std::fmt::Debug for Framework {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Framework")
            .field("prefix", &self.inner.prefix)
            .field("commands", &self.inner.registry.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

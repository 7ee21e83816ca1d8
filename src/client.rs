//! The facade hosts build on.
//!
//! [`Client`] wires one [`EventBus`], one [`BucketLimiter`], the REST
//! [`HttpClient`], the [`GatewayClient`] and a command [`Framework`] together.

use std::sync::{Arc, RwLock};

use tracing::info;

use crate::api::{ChannelsApi, MessagesApi, PresenceApi, RolesApi, ServersApi, VoiceApi};
use crate::bus::EventBus;
use crate::config::BotConfig;
use crate::error::{BotError, BotResult};
use crate::events::BotEvent;
use crate::framework::Framework;
use crate::gateway::{ConnectionState, GatewayClient};
use crate::http::{ApiResponse, HttpClient};
use crate::ratelimit::BucketLimiter;
use crate::types::{LoginRequest, LoginResponse, User};

pub struct Client {
    config: BotConfig,
    bus: EventBus,
    limiter: Arc<BucketLimiter>,
    http: HttpClient,
    gateway: GatewayClient,
    framework: Framework,
    user: RwLock<Option<User>>,
}

impl Client {
    pub fn new(config: BotConfig) -> BotResult<Self> {
        let bus = EventBus::new(config.event_buffer);
        let limiter = Arc::new(BucketLimiter::new());
        let http = HttpClient::new(&config, Arc::clone(&limiter))?;
        let gateway = GatewayClient::new(&config, bus.clone());
        let framework = Framework::new(&config, Arc::new(MessagesApi::new(http.clone())));

        Ok(Self {
            config,
            bus,
            limiter,
            http,
            gateway,
            framework,
            user: RwLock::new(None),
        })
    }

    pub fn from_env() -> BotResult<Self> {
        Self::new(BotConfig::from_env()?)
    }

    /// Exchange credentials for a token via `POST /auth/login`.
    ///
    /// The token is kept for REST calls and the next [`Client::connect`].
    pub async fn login(&self, username: &str, password: &str) -> BotResult<LoginResponse> {
        let request = LoginRequest {
            username: username.to_string(),
            password: password.to_string(),
        };
        let response: ApiResponse<LoginResponse> = self.http.post("auth/login", &request).await?;
        let login = response.into_data().map_err(|e| match e {
            BotError::Rejected { message, .. } => BotError::Authentication(message),
            other => other,
        })?;

        self.http.set_token(login.token.clone());
        if let Some(user) = &login.user {
            info!(user = %user.tag(), "logged in");
            self.framework.set_identity(user.id.clone());
        }
        *self.user.write().unwrap_or_else(|p| p.into_inner()) = login.user.clone();
        Ok(login)
    }

    /// Attach the command runtime to the bus and open the gateway session.
    /// Resolves once READY arrives.
    pub async fn connect(&self) -> BotResult<()> {
        let token = self.http.token().ok_or_else(|| {
            BotError::Authentication("no token configured; call login() or set BOT_TOKEN".into())
        })?;
        self.framework.attach(&self.bus);
        self.gateway.connect(token).await
    }

    /// Close the gateway session and stop dispatching commands.
    pub fn disconnect(&self) {
        self.gateway.disconnect();
        self.framework.detach();
    }

    pub fn state(&self) -> ConnectionState {
        self.gateway.state()
    }

    /// Subscribe to every event published from now on.
    pub fn events(&self) -> async_channel::Receiver<BotEvent> {
        self.bus.subscribe()
    }

    /// The logged-in user, if `login` returned one.
    pub fn user(&self) -> Option<User> {
        self.user.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn config(&self) -> &BotConfig {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn limiter(&self) -> &Arc<BucketLimiter> {
        &self.limiter
    }

    pub fn http(&self) -> &HttpClient {
        &self.http
    }

    pub fn gateway(&self) -> &GatewayClient {
        &self.gateway
    }

    pub fn framework(&self) -> &Framework {
        &self.framework
    }

    pub fn messages(&self) -> MessagesApi {
        MessagesApi::new(self.http.clone())
    }

    pub fn servers(&self) -> ServersApi {
        ServersApi::new(self.http.clone())
    }

    pub fn channels(&self) -> ChannelsApi {
        ChannelsApi::new(self.http.clone())
    }

    pub fn roles(&self) -> RolesApi {
        RolesApi::new(self.http.clone())
    }

    pub fn presence(&self) -> PresenceApi {
        PresenceApi::new(self.gateway.clone())
    }

    pub fn voice(&self) -> VoiceApi {
        VoiceApi::new(self.gateway.clone())
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("http", &self.http)
            .field("gateway", &self.gateway)
            .field("framework", &self.framework)
            .finish()
    }
}

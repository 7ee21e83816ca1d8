//! Client runtime for a chat platform's bot API.
//!
//! The pieces are usable on their own ([`bus::EventBus`],
//! [`ratelimit::BucketLimiter`], [`http::HttpClient`],
//! [`gateway::GatewayClient`], [`framework::Framework`]) but most hosts only
//! need [`client::Client`], which wires them together.

pub mod api;
pub mod bot;
pub mod bus;
pub mod client;
pub mod commands;
pub mod config;
pub mod error;
pub mod events;
pub mod framework;
pub mod gateway;
pub mod handlers;
pub mod http;
pub mod middleware;
pub mod ratelimit;
pub mod scheduler;
pub mod types;

pub use client::Client;
pub use commands::{Command, Context};
pub use config::BotConfig;
pub use error::{BotError, BotResult};
pub use events::BotEvent;
pub use framework::{Framework, Plugin};
pub use gateway::ConnectionState;
pub use middleware::Next;

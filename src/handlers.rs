//! Built-in demo commands.
//!
//! `!hello`, `!ping`, `!uptime`, `!roll [sides]`, `!whoami` and `!help`,
//! plus a middleware that logs every invocation. All of them are also
//! reachable through the mention prefix (`@bot ping`).

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::info;

use crate::commands::{Command, Context};
use crate::error::BotResult;
use crate::framework::Framework;
use crate::middleware::Next;
use crate::types::User;

/// Register every demo command. `started` is the reference for `!uptime`.
pub fn register_all(framework: &Framework, started: Instant) -> BotResult<()> {
    framework.register(Command::new("hello", hello).description("Say hello!"))?;
    framework.register(
        Command::new("ping", ping)
            .description("Check bot latency")
            .cooldown(Duration::from_millis(1500)),
    )?;
    framework.register(
        Command::new("uptime", move |ctx: Arc<Context>| uptime(ctx, started))
            .description("See how long the bot has been running"),
    )?;
    framework.register(
        Command::new("roll", roll)
            .alias("dice")
            .usage("[sides]")
            .description("Roll a dice (default: 6 sides)"),
    )?;
    framework.register(Command::new("whoami", whoami).description("Show info about yourself"))?;
    framework.register(
        Command::new("help", help)
            .alias("commands")
            .description("Show this help message"),
    )?;
    Ok(())
}

/// Logs each invocation, then continues the chain.
pub async fn log_invocations(ctx: Arc<Context>, next: Next) -> BotResult<()> {
    info!(
        command = %ctx.command,
        author = %ctx.author().tag(),
        channel_id = %ctx.channel_id(),
        args = ?ctx.args,
        "command invoked"
    );
    let started = Instant::now();
    let result = next.run(ctx).await;
    info!(elapsed_ms = started.elapsed().as_millis() as u64, ok = result.is_ok(), "command finished");
    result
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn hello(ctx: Arc<Context>) -> BotResult<()> {
    ctx.reply("Hello, World! 👋").await?;
    Ok(())
}

async fn ping(ctx: Arc<Context>) -> BotResult<()> {
    let latency = ctx
        .message
        .created_at()
        .map(|sent_at| {
            let diff = chrono::Utc::now().signed_duration_since(sent_at);
            format!("{}ms", diff.num_milliseconds())
        })
        .unwrap_or_else(|| "unknown".to_string());

    ctx.reply(format!("🏓 Pong! Latency: {latency}")).await?;
    Ok(())
}

async fn uptime(ctx: Arc<Context>, started: Instant) -> BotResult<()> {
    ctx.reply(format!("⏱️ Bot uptime: {}", format_uptime(started.elapsed())))
        .await?;
    Ok(())
}

async fn roll(ctx: Arc<Context>) -> BotResult<()> {
    let sides = roll_sides(ctx.arg(0));
    let result = rand::random::<u32>() % sides + 1;
    ctx.reply(format!("🎲 Rolling a d{sides}... **{result}**!"))
        .await?;
    Ok(())
}

async fn whoami(ctx: Arc<Context>) -> BotResult<()> {
    ctx.reply(format_whoami(ctx.author())).await?;
    Ok(())
}

async fn help(ctx: Arc<Context>) -> BotResult<()> {
    ctx.reply(help_text(ctx.framework(), &ctx.prefix)).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Formatting helpers
// ---------------------------------------------------------------------------

fn roll_sides(arg: Option<&str>) -> u32 {
    arg.and_then(|a| a.trim().parse().ok())
        .unwrap_or(6)
        .clamp(2, 1000)
}

fn format_uptime(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
}

fn format_whoami(user: &User) -> String {
    format!(
        "👤 **About You:**\n\
         • **Username:** {}\n\
         • **Display name:** {}\n\
         • **User ID:** {}",
        user.tag(),
        user.display_name(),
        user.id
    )
}

fn help_text(framework: &Framework, prefix: &str) -> String {
    // A mention prefix needs a space before the command name.
    let prefix = if prefix.starts_with("<@") {
        format!("{prefix} ")
    } else {
        prefix.to_string()
    };
    let mut text = String::from("🤖 **Available Commands:**\n");
    for command in framework.commands() {
        text.push_str(&format!("• `{prefix}{}", command.name()));
        if let Some(usage) = command.get_usage() {
            text.push_str(&format!(" {usage}"));
        }
        text.push('`');
        if !command.get_description().is_empty() {
            text.push_str(&format!(" - {}", command.get_description()));
        }
        if !command.aliases().is_empty() {
            text.push_str(&format!(" (aliases: {})", command.aliases().join(", ")));
        }
        text.push('\n');
    }
    text
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

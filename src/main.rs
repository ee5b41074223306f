mod batch;
mod config;
mod conversation;
mod db;
mod error;
mod handlers;
mod media;
mod naming;
mod parser;
mod quality;
mod rename;
mod session;
#[cfg(test)]
mod testing;
mod transport;

use std::sync::Arc;

use anyhow::{Context, Result};
use teloxide::prelude::*;
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::config::Config;
use crate::handlers::{build_handler, AppServices};
use crate::media::{Ffmpeg, MediaTool};
use crate::session::SessionStore;
use crate::transport::{TelegramTransport, Transport};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Parse CLI args for --config-json
    let mut config_json_arg: Option<String> = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if let Some(rest) = arg.strip_prefix("--config-json=") {
            config_json_arg = Some(rest.to_string());
            break;
        }
        if arg == "--config-json" {
            config_json_arg = args.next();
            break;
        }
    }

    let config = match &config_json_arg {
        Some(json) => Config::from_json_str(json).context("failed to parse --config-json")?,
        None => Config::load().context("failed to load config")?,
    };

    // RUST_LOG wins over the configured level
    let default_filter = config
        .log_level
        .clone()
        .unwrap_or_else(|| "info,reqwest=warn,teloxide=info".to_string());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(env_filter).compact().init();
    if config_json_arg.is_some() {
        info!("Config loaded from --config-json");
    }

    // teloxide reads TELOXIDE_TOKEN from env by default
    let bot = Bot::from_env();

    tokio::fs::create_dir_all(&config.work_dir)
        .await
        .with_context(|| format!("cannot create work dir {}", config.work_dir.display()))?;

    let store = SessionStore::open(config.session_db.as_deref()).await;
    let http = reqwest::Client::new();
    let transport: Arc<dyn Transport> = Arc::new(TelegramTransport::new(bot.clone(), http.clone()));
    let media: Arc<dyn MediaTool> = Arc::new(Ffmpeg::default());
    let services = AppServices::new(&config, store, transport, media, http);

    match bot.get_me().await {
        Ok(me) => {
            info!(
                id = me.id.0,
                username = me.user.username.as_deref().unwrap_or(""),
                archive = config.log_channel,
                max_jobs = config.max_concurrent_jobs,
                "Bot started"
            );
        }
        Err(err) => warn!(error = %err, "Failed to fetch bot info"),
    }
    announce_start(&bot, &config).await;

    Dispatcher::builder(bot, build_handler())
        .dependencies(dptree::deps![services])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    Ok(())
}

/// Tells admins and the archive channel that the bot (re)started.
async fn announce_start(bot: &Bot, config: &Config) {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    let stamp = now
        .format(format_description!("[day].[month].[year] [hour]:[minute]:[second]"))
        .unwrap_or_else(|_| now.to_string());

    for admin in &config.admins {
        if let Err(err) = bot.send_message(ChatId(*admin), "🤖 Bot started.").await {
            warn!(admin, error = %err, "Cannot notify admin");
        }
    }
    let notice = format!("🔄 Bot restarted\n📅 {stamp}");
    if let Err(err) = bot.send_message(ChatId(config.log_channel), notice).await {
        warn!(channel = config.log_channel, error = %err, "Cannot post restart notice");
    }
}

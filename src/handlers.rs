use std::sync::Arc;

use anyhow::Result;
use teloxide::dispatching::{UpdateFilterExt, UpdateHandler};
use teloxide::prelude::*;
use teloxide::types::{
    ForceReply, InlineKeyboardButton, InlineKeyboardMarkup, MessageId, ParseMode, ReplyParameters,
    User,
};
use teloxide::utils::command::BotCommands;
use teloxide::utils::html;
use tracing::{debug, info, warn};

use crate::batch::BatchProcessor;
use crate::config::Config;
use crate::conversation::{Conversation, Incoming};
use crate::media::MediaTool;
use crate::rename::{
    build_upload_callback, button_label, parse_upload_callback, resolve_new_name, PendingFile,
    RenameJob, Renamer, SourceKind, MAX_FILE_BYTES,
};
use crate::session::SessionStore;
use crate::transport::Transport;

#[derive(Debug, BotCommands, Clone, PartialEq, Eq)]
#[command(rename_rule = "snake_case", description = "Available commands:")]
pub enum BotCommand {
    #[command(description = "check the bot is alive")]
    Start,
    #[command(description = "show this help")]
    Help,
    #[command(description = "start a batch auto-rename session")]
    AutoRename,
    #[command(description = "rename and upload every queued episode")]
    RenameAll,
    #[command(description = "download a direct link: /leech <url> <new name>")]
    Leech(String),
}

/// Everything the handlers need, injected once into the dispatcher.
#[derive(Clone)]
pub struct AppServices {
    pub store: SessionStore,
    pub conversation: Conversation,
    pub batch: BatchProcessor,
    pub renamer: Renamer,
}

impl AppServices {
    pub fn new(
        config: &Config,
        store: SessionStore,
        transport: Arc<dyn Transport>,
        media: Arc<dyn MediaTool>,
        http: reqwest::Client,
    ) -> Self {
        let archive = ChatId(config.log_channel);
        let conversation = Conversation::new(store.clone(), transport.clone(), config.work_dir.clone());
        let batch = BatchProcessor::new(
            store.clone(),
            transport.clone(),
            media.clone(),
            archive,
            config.work_dir.clone(),
            config.quality_ladder.clone(),
        );
        let renamer = Renamer::new(
            transport,
            media,
            http,
            archive,
            config.work_dir.clone(),
            config.rename_metadata.clone(),
            config.max_concurrent_jobs,
        );
        Self {
            store,
            conversation,
            batch,
            renamer,
        }
    }
}

pub fn build_handler() -> UpdateHandler<anyhow::Error> {
    let messages = Update::filter_message()
        .filter(from_private_chat)
        .branch(
            dptree::entry()
                .filter_command::<BotCommand>()
                .endpoint(handle_command),
        )
        .branch(dptree::endpoint(handle_message));
    let callbacks = Update::filter_callback_query().endpoint(handle_callback);
    dptree::entry().branch(messages).branch(callbacks)
}

/// Groups and channels are never served.
fn from_private_chat(msg: Message) -> bool {
    msg.chat.is_private()
}

/// `/leech` arguments: the first word is the URL, the rest the new name.
fn parse_leech_args(raw: &str) -> Option<(&str, &str)> {
    let (url, name) = raw.trim().split_once(char::is_whitespace)?;
    let name = name.trim();
    if !(url.starts_with("http://") || url.starts_with("https://")) || name.is_empty() {
        return None;
    }
    Some((url, name))
}

fn credit_of(user: &User) -> String {
    match &user.username {
        Some(name) => format!("@{name}"),
        None => user.full_name(),
    }
}

async fn handle_command(
    bot: Bot,
    msg: Message,
    cmd: BotCommand,
    services: AppServices,
) -> Result<()> {
    let Some(user) = msg.from.clone() else {
        return Ok(());
    };
    let user_id = user.id.0;
    info!(chat_id = %msg.chat.id, user = user_id, command = ?cmd, "Command received");
    match cmd {
        BotCommand::Start => {
            bot.send_message(
                msg.chat.id,
                "👋 Send me a file to rename it, or use /auto_rename to rename a whole season.",
            )
            .await?;
        }
        BotCommand::Help => {
            bot.send_message(msg.chat.id, BotCommand::descriptions().to_string())
                .await?;
        }
        BotCommand::AutoRename => {
            let reply = services.conversation.start(user_id).await?;
            bot.send_message(msg.chat.id, reply.text()).await?;
        }
        BotCommand::RenameAll => {
            let batch = services.batch.clone();
            let chat = msg.chat.id;
            tokio::spawn(async move {
                let text = match batch.run(user_id).await {
                    Ok(outcome) => {
                        debug!(user = user_id, ?outcome, "Batch run finished");
                        outcome.text().to_string()
                    }
                    Err(err) => {
                        warn!(user = user_id, error = %err, "Batch run failed");
                        format!("❌ Rename failed: {err}")
                    }
                };
                if let Err(err) = bot.send_message(chat, text).await {
                    warn!(user = user_id, error = %err, "Cannot report batch result");
                }
            });
        }
        BotCommand::Leech(raw) => {
            let Some((url, name)) = parse_leech_args(&raw) else {
                bot.send_message(msg.chat.id, "Usage: /leech <direct url> <new name>")
                    .await?;
                return Ok(());
            };
            let status = bot
                .send_message(msg.chat.id, "📥 Downloading...")
                .reply_parameters(ReplyParameters::new(msg.id))
                .await?;
            let (url, name) = (url.to_string(), name.to_string());
            let credit = html::escape(&credit_of(&user));
            let renamer = services.renamer.clone();
            let chat = msg.chat.id;
            tokio::spawn(async move {
                let text = match renamer.leech(user_id, &url, &name, &credit).await {
                    Ok(file_name) => format!("✅ Uploaded {file_name}"),
                    Err(err) => {
                        warn!(user = user_id, %url, error = %err, "Leech failed");
                        format!("❌ Leech failed: {err}")
                    }
                };
                if let Err(err) = bot.edit_message_text(chat, status.id, text).await {
                    warn!(user = user_id, error = %err, "Cannot update leech status");
                }
            });
        }
    }
    Ok(())
}

/// Media attached to a message: file id, name, size and category.
fn media_of(msg: &Message) -> Option<(String, Option<String>, u64, SourceKind)> {
    if let Some(doc) = msg.document() {
        return Some((
            doc.file.id.to_string(),
            doc.file_name.clone(),
            u64::from(doc.file.size),
            SourceKind::Document,
        ));
    }
    if let Some(video) = msg.video() {
        return Some((
            video.file.id.to_string(),
            video.file_name.clone(),
            u64::from(video.file.size),
            SourceKind::Video,
        ));
    }
    if let Some(audio) = msg.audio() {
        return Some((
            audio.file.id.to_string(),
            audio.file_name.clone(),
            u64::from(audio.file.size),
            SourceKind::Audio,
        ));
    }
    None
}

fn incoming_of(msg: &Message) -> Option<Incoming> {
    if let Some(photos) = msg.photo() {
        let best = photos.iter().max_by_key(|p| p.width as u64 * p.height as u64)?;
        return Some(Incoming::Photo {
            file_id: best.file.id.to_string(),
        });
    }
    if let Some((file_id, file_name, _, _)) = media_of(msg) {
        return Some(Incoming::Media {
            file_id,
            file_name,
            caption: msg.caption().map(str::to_string),
            message_id: msg.id.0,
        });
    }
    msg.text().map(|t| Incoming::Text(t.to_string()))
}

async fn handle_message(bot: Bot, msg: Message, services: AppServices) -> Result<()> {
    let Some(user) = msg.from.as_ref() else {
        return Ok(());
    };
    let user_id = user.id.0;

    if let (Some(reply_to), Some(text)) = (msg.reply_to_message(), msg.text()) {
        if let Some(file) = services.renamer.take_prompt(msg.chat.id, reply_to.id) {
            return offer_output_kinds(&bot, &msg, &services, user_id, file, text).await;
        }
    }

    if services.store.read(user_id).await?.is_some() {
        let Some(incoming) = incoming_of(&msg) else {
            return Ok(());
        };
        if let Some(reply) = services.conversation.handle(user_id, incoming).await? {
            bot.send_message(msg.chat.id, reply.text()).await?;
        }
        return Ok(());
    }

    if let Some((source, file_name, size, kind)) = media_of(&msg) {
        if size > MAX_FILE_BYTES {
            bot.send_message(msg.chat.id, "❌ Telegram bots cannot handle files larger than 2 GB.")
                .await?;
            return Ok(());
        }
        let prompt = bot
            .send_message(
                msg.chat.id,
                "✏️ Please enter the new filename (reply to this message).",
            )
            .reply_parameters(ReplyParameters::new(msg.id))
            .reply_markup(ForceReply::new())
            .await?;
        debug!(user = user_id, prompt = prompt.id.0, "Rename prompt sent");
        services.renamer.remember_prompt(
            msg.chat.id,
            prompt.id,
            PendingFile {
                source,
                file_name,
                kind,
            },
        );
    }
    Ok(())
}

async fn offer_output_kinds(
    bot: &Bot,
    msg: &Message,
    services: &AppServices,
    user_id: u64,
    file: PendingFile,
    typed: &str,
) -> Result<()> {
    let new_name = resolve_new_name(typed, file.file_name.as_deref());
    let kind = file.kind;
    let id = services.renamer.register_job(RenameJob {
        user_id,
        source: file.source,
        new_name: new_name.clone(),
        kind,
    });
    let buttons: Vec<InlineKeyboardButton> = kind
        .choices()
        .into_iter()
        .map(|k| InlineKeyboardButton::callback(button_label(k), build_upload_callback(id, k)))
        .collect();
    bot.send_message(
        msg.chat.id,
        format!(
            "Select the output file type\nFile name: {}",
            html::code_inline(&new_name)
        ),
    )
    .parse_mode(ParseMode::Html)
    .reply_parameters(ReplyParameters::new(msg.id))
    .reply_markup(InlineKeyboardMarkup::new([buttons]))
    .await?;
    Ok(())
}

async fn handle_callback(bot: Bot, q: CallbackQuery, services: AppServices) -> Result<()> {
    bot.answer_callback_query(q.id.clone()).await?;
    let Some((id, kind)) = q.data.as_deref().and_then(parse_upload_callback) else {
        return Ok(());
    };
    let Some(message) = q.message.as_ref() else {
        return Ok(());
    };
    let chat = message.chat().id;
    let message_id: MessageId = message.id();

    let Some(job) = services.renamer.take_job(id) else {
        bot.edit_message_text(chat, message_id, "⌛ This request has expired.")
            .await?;
        return Ok(());
    };
    info!(user = job.user_id, job = %id, ?kind, "Rename job accepted");
    bot.edit_message_text(chat, message_id, "⏳ Renaming...").await?;

    let renamer = services.renamer.clone();
    tokio::spawn(async move {
        let user_id = job.user_id;
        let text = match renamer.run_job(id, job, kind).await {
            Ok(()) => "✅ Done.".to_string(),
            Err(err) => {
                warn!(user = user_id, error = %err, "Rename job failed");
                format!("❌ Rename failed: {err}")
            }
        };
        if let Err(err) = bot.edit_message_text(chat, message_id, text).await {
            warn!(user = user_id, error = %err, "Cannot update rename status");
        }
    });
    Ok(())
}

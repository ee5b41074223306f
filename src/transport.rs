use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{FileId, InputFile, MessageId, ParseMode, ReplyParameters};
use teloxide::RequestError;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::AppError;

const UPLOAD_MAX_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadKind {
    Video,
    Audio,
    Document,
}

/// A finished file ready to be sent somewhere.
#[derive(Debug, Clone)]
pub struct Upload {
    pub path: PathBuf,
    /// Name shown to the recipient.
    pub file_name: String,
    pub kind: UploadKind,
    /// HTML caption.
    pub caption: String,
    pub thumbnail: Option<PathBuf>,
    pub duration: Option<u32>,
}

/// Messaging capability: fetch Telegram files, send files and texts.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Downloads the file behind `source` to `dest`, returning the byte count.
    async fn fetch(&self, source: &str, dest: &Path) -> Result<u64, AppError>;
    async fn upload(&self, chat: ChatId, upload: &Upload) -> Result<MessageId, AppError>;
    async fn send_text(
        &self,
        chat: ChatId,
        text: String,
        reply_to: Option<MessageId>,
    ) -> Result<MessageId, AppError>;
}

/// Streams `url` into `dest`. Non-success statuses and empty bodies are errors;
/// a partial file is removed on failure.
pub async fn download_to(client: &reqwest::Client, url: &str, dest: &Path) -> Result<u64, AppError> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut resp = client.get(url).send().await?;
    if !resp.status().is_success() {
        return Err(AppError::DownloadStatus(resp.status()));
    }

    let mut file = tokio::fs::File::create(dest).await?;
    let mut written: u64 = 0;
    let result: Result<(), AppError> = async {
        while let Some(chunk) = resp.chunk().await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(())
    }
    .await;

    if let Err(err) = result {
        let _ = tokio::fs::remove_file(dest).await;
        return Err(err);
    }
    if written == 0 {
        let _ = tokio::fs::remove_file(dest).await;
        return Err(AppError::EmptyDownload);
    }
    debug!(bytes = written, path = %dest.display(), "Download complete");
    Ok(written)
}

/// Download URL of a Telegram file on the Bot API server at `api_base`
/// (a local server lifts the 20 MB download cap).
pub fn file_url(api_base: &str, token: &str, file_path: &str) -> String {
    format!("{}/file/bot{token}/{file_path}", api_base.trim_end_matches('/'))
}

/// Teloxide-backed transport.
#[derive(Clone)]
pub struct TelegramTransport {
    bot: Bot,
    http: reqwest::Client,
}

impl TelegramTransport {
    pub fn new(bot: Bot, http: reqwest::Client) -> Self {
        Self { bot, http }
    }

    async fn send_once(&self, chat: ChatId, upload: &Upload) -> Result<Message, RequestError> {
        let file = InputFile::file(upload.path.clone()).file_name(upload.file_name.clone());
        let thumb = upload
            .thumbnail
            .as_ref()
            .filter(|p| p.exists())
            .map(|p| InputFile::file(p.clone()));

        match upload.kind {
            UploadKind::Video => {
                let mut req = self
                    .bot
                    .send_video(chat, file)
                    .caption(upload.caption.clone())
                    .parse_mode(ParseMode::Html)
                    .supports_streaming(true);
                if let Some(thumb) = thumb {
                    req = req.thumbnail(thumb);
                }
                if let Some(d) = upload.duration {
                    req = req.duration(d);
                }
                req.await
            }
            UploadKind::Audio => {
                let mut req = self
                    .bot
                    .send_audio(chat, file)
                    .caption(upload.caption.clone())
                    .parse_mode(ParseMode::Html);
                if let Some(thumb) = thumb {
                    req = req.thumbnail(thumb);
                }
                if let Some(d) = upload.duration {
                    req = req.duration(d);
                }
                req.await
            }
            UploadKind::Document => {
                let mut req = self
                    .bot
                    .send_document(chat, file)
                    .caption(upload.caption.clone())
                    .parse_mode(ParseMode::Html);
                if let Some(thumb) = thumb {
                    req = req.thumbnail(thumb);
                }
                req.await
            }
        }
    }
}

#[async_trait]
impl Transport for TelegramTransport {
    async fn fetch(&self, source: &str, dest: &Path) -> Result<u64, AppError> {
        let file = self.bot.get_file(FileId(source.to_string())).await?;
        let url = file_url(self.bot.api_url().as_str(), self.bot.token(), &file.path);
        download_to(&self.http, &url, dest).await
    }

    async fn upload(&self, chat: ChatId, upload: &Upload) -> Result<MessageId, AppError> {
        let mut attempt = 1;
        loop {
            match self.send_once(chat, upload).await {
                Ok(sent) => return Ok(sent.id),
                Err(RequestError::RetryAfter(delay)) if attempt < UPLOAD_MAX_ATTEMPTS => {
                    let delay: Duration = delay.duration();
                    warn!(chat = %chat, attempt, ?delay, "Upload throttled, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn send_text(
        &self,
        chat: ChatId,
        text: String,
        reply_to: Option<MessageId>,
    ) -> Result<MessageId, AppError> {
        let mut req = self.bot.send_message(chat, text).parse_mode(ParseMode::Html);
        if let Some(id) = reply_to {
            req = req.reply_parameters(ReplyParameters::new(id));
        }
        Ok(req.await?.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{serve_once, serve_sequence};

    #[test]
    fn file_url_follows_api_server() {
        assert_eq!(
            file_url("https://api.telegram.org/", "1:T", "videos/a.mkv"),
            "https://api.telegram.org/file/bot1:T/videos/a.mkv"
        );
        assert_eq!(
            file_url("http://127.0.0.1:8081", "1:T", "documents/b.mp4"),
            "http://127.0.0.1:8081/file/bot1:T/documents/b.mp4"
        );
    }

    #[tokio::test]
    async fn fetch_downloads_from_the_configured_api_server() {
        let get_file: &'static [u8] = br#"{"ok":true,"result":{"file_id":"x","file_unique_id":"u","file_size":11,"file_path":"videos/a.mkv"}}"#;
        let (base, requests) = serve_sequence(vec![("200 OK", get_file), ("200 OK", &b"video-bytes"[..])]);
        let bot = Bot::new("123:TOKEN").set_api_url(base.parse().unwrap());
        let transport = TelegramTransport::new(bot, reqwest::Client::new());
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("a.mkv");

        let written = transport.fetch("x", &dest).await.unwrap();
        assert_eq!(written, 11);
        assert_eq!(std::fs::read(&dest).unwrap(), b"video-bytes");

        let seen = requests.lock().unwrap().clone();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].contains("/bot123:TOKEN/"), "{seen:?}");
        assert!(seen[1].starts_with("GET /file/bot123:TOKEN/videos/a.mkv"), "{seen:?}");
    }

    #[tokio::test]
    async fn download_streams_body_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("nested").join("clip.mp4");
        let url = serve_once("200 OK", b"video-bytes", "/clip.mp4");

        let written = download_to(&reqwest::Client::new(), &url, &dest).await.unwrap();
        assert_eq!(written, 11);
        assert_eq!(std::fs::read(&dest).unwrap(), b"video-bytes");
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("clip.mp4");
        let url = serve_once("404 Not Found", b"missing", "/clip.mp4");

        let err = download_to(&reqwest::Client::new(), &url, &dest).await.unwrap_err();
        assert!(matches!(err, AppError::DownloadStatus(s) if s == reqwest::StatusCode::NOT_FOUND));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn empty_body_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("clip.mp4");
        let url = serve_once("200 OK", b"", "/clip.mp4");

        let err = download_to(&reqwest::Client::new(), &url, &dest).await.unwrap_err();
        assert!(matches!(err, AppError::EmptyDownload));
        assert!(!dest.exists());
    }
}

//! In-crate fakes for the transport and media collaborators.

use std::collections::HashSet;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use teloxide::types::{ChatId, MessageId};
use tokio::sync::Notify;

use crate::error::AppError;
use crate::media::{MediaTool, TagScope};
use crate::transport::{Transport, Upload, UploadKind};

#[derive(Debug, Clone)]
pub struct SentFile {
    pub chat: ChatId,
    pub file_name: String,
    pub kind: UploadKind,
    pub caption: String,
    pub thumbnail: Option<PathBuf>,
    pub path_existed: bool,
}

#[derive(Default)]
pub struct FakeTransport {
    pub uploads: Mutex<Vec<SentFile>>,
    pub texts: Mutex<Vec<(ChatId, String, Option<MessageId>)>>,
    pub fetched: Mutex<Vec<String>>,
    pub failing_sources: Mutex<HashSet<String>>,
    pub failing_chats: Mutex<HashSet<ChatId>>,
    /// When set, every fetch waits here until notified.
    pub gate: Option<Arc<Notify>>,
    pub fetch_started: Arc<Notify>,
    next_id: AtomicUsize,
}

impl FakeTransport {
    pub fn gated(gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }

    pub fn fail_source(&self, source: &str) {
        self.failing_sources.lock().unwrap().insert(source.to_string());
    }

    pub fn fail_chat(&self, chat: ChatId) {
        self.failing_chats.lock().unwrap().insert(chat);
    }

    pub fn uploads_to(&self, chat: ChatId) -> Vec<SentFile> {
        self.uploads
            .lock()
            .unwrap()
            .iter()
            .filter(|u| u.chat == chat)
            .cloned()
            .collect()
    }

    pub fn texts_to(&self, chat: ChatId) -> Vec<String> {
        self.texts
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _, _)| *c == chat)
            .map(|(_, t, _)| t.clone())
            .collect()
    }

    fn next_message_id(&self) -> MessageId {
        MessageId(self.next_id.fetch_add(1, Ordering::SeqCst) as i32 + 1)
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn fetch(&self, source: &str, dest: &Path) -> Result<u64, AppError> {
        self.fetched.lock().unwrap().push(source.to_string());
        self.fetch_started.notify_one();
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if self.failing_sources.lock().unwrap().contains(source) {
            return Err(AppError::EmptyDownload);
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let body = format!("bytes of {source}");
        tokio::fs::write(dest, &body).await?;
        Ok(body.len() as u64)
    }

    async fn upload(&self, chat: ChatId, upload: &Upload) -> Result<MessageId, AppError> {
        if self.failing_chats.lock().unwrap().contains(&chat) {
            return Err(AppError::tool("upload", "rejected"));
        }
        self.uploads.lock().unwrap().push(SentFile {
            chat,
            file_name: upload.file_name.clone(),
            kind: upload.kind,
            caption: upload.caption.clone(),
            thumbnail: upload.thumbnail.clone(),
            path_existed: upload.path.exists(),
        });
        Ok(self.next_message_id())
    }

    async fn send_text(
        &self,
        chat: ChatId,
        text: String,
        reply_to: Option<MessageId>,
    ) -> Result<MessageId, AppError> {
        self.texts.lock().unwrap().push((chat, text, reply_to));
        Ok(self.next_message_id())
    }
}

#[derive(Default)]
pub struct FakeMedia {
    pub fail_metadata: bool,
    pub metadata_calls: Mutex<Vec<(String, TagScope)>>,
    pub fixed: Mutex<Vec<PathBuf>>,
}

impl FakeMedia {
    pub fn failing() -> Self {
        Self {
            fail_metadata: true,
            ..Self::default()
        }
    }
}

#[async_trait]
impl MediaTool for FakeMedia {
    async fn write_metadata(
        &self,
        src: &Path,
        dst: &Path,
        title: &str,
        scope: TagScope,
    ) -> Result<(), AppError> {
        self.metadata_calls.lock().unwrap().push((title.to_string(), scope));
        if self.fail_metadata {
            return Err(AppError::tool("ffmpeg", "unsupported container"));
        }
        tokio::fs::copy(src, dst).await?;
        Ok(())
    }

    async fn fix_container(&self, src: &Path, dst: &Path) -> Result<(), AppError> {
        self.fixed.lock().unwrap().push(src.to_path_buf());
        tokio::fs::copy(src, dst).await?;
        Ok(())
    }

    async fn probe_duration(&self, _path: &Path) -> Result<Option<u32>, AppError> {
        Ok(Some(120))
    }

    async fn screenshot(&self, _video: &Path, _at_secs: u32, dst: &Path) -> Result<(), AppError> {
        let img = image::RgbImage::from_pixel(64, 36, image::Rgb([200, 10, 10]));
        img.save_with_format(dst, image::ImageFormat::Png)?;
        Ok(())
    }
}

/// Answers a single HTTP request with `status` and `body`, returning the URL
/// to fetch (`path` is appended to the listener address).
pub fn serve_once(status: &'static str, body: &'static [u8], path: &str) -> String {
    let (base, _) = serve_sequence(vec![(status, body)]);
    format!("{base}{path}")
}

/// Answers one HTTP request per response, in order, each on its own
/// connection. Returns the base URL and the request lines received.
pub fn serve_sequence(
    responses: Vec<(&'static str, &'static [u8])>,
) -> (String, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    std::thread::spawn(move || {
        for (status, body) in responses {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut request_line = String::new();
            reader.read_line(&mut request_line).unwrap();
            log.lock().unwrap().push(request_line.trim_end().to_string());

            let mut content_length = 0usize;
            let mut line = String::new();
            while reader.read_line(&mut line).unwrap() > 0 {
                if line == "\r\n" {
                    break;
                }
                if let Some((name, value)) = line.split_once(':') {
                    if name.eq_ignore_ascii_case("content-length") {
                        content_length = value.trim().parse().unwrap_or(0);
                    }
                }
                line.clear();
            }
            let mut request_body = vec![0u8; content_length];
            reader.read_exact(&mut request_body).unwrap();

            let mut stream = stream;
            let head = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            stream.write_all(head.as_bytes()).unwrap();
            stream.write_all(body).unwrap();
        }
    });
    (base, seen)
}

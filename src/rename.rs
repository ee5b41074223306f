use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use teloxide::types::{ChatId, MessageId};
use tokio::sync::Semaphore;
use tracing::{info, instrument, warn};

use crate::error::AppError;
use crate::media::{normalize_thumbnail, MediaTool, TagScope};
use crate::naming::{bold_caption, extension_of, is_video_extension};
use crate::transport::{download_to, Transport, Upload, UploadKind};

/// Telegram bots cannot send files above this size.
pub const MAX_FILE_BYTES: u64 = 2000 * 1024 * 1024;

const UPLOAD_CALLBACK_PREFIX: &str = "upload:";

/// Unanswered name prompts and unclicked output buttons are dropped after this.
const PENDING_TTL: Duration = Duration::from_secs(60 * 60);

/// Media category of the file the user sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Video,
    Audio,
    Document,
}

impl SourceKind {
    /// Output types offered for this source.
    pub fn choices(self) -> Vec<UploadKind> {
        match self {
            SourceKind::Video | SourceKind::Document => vec![UploadKind::Document, UploadKind::Video],
            SourceKind::Audio => vec![UploadKind::Document, UploadKind::Audio],
        }
    }

    fn archive_kind(self) -> UploadKind {
        match self {
            SourceKind::Video => UploadKind::Video,
            SourceKind::Audio => UploadKind::Audio,
            SourceKind::Document => UploadKind::Document,
        }
    }
}

/// A file waiting for the user to type its new name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingFile {
    pub source: String,
    pub file_name: Option<String>,
    pub kind: SourceKind,
}

/// A named file waiting for the output-type button.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenameJob {
    pub user_id: u64,
    pub source: String,
    pub new_name: String,
    pub kind: SourceKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

fn kind_label(kind: UploadKind) -> &'static str {
    match kind {
        UploadKind::Document => "document",
        UploadKind::Video => "video",
        UploadKind::Audio => "audio",
    }
}

pub fn button_label(kind: UploadKind) -> &'static str {
    match kind {
        UploadKind::Document => "📁 Document",
        UploadKind::Video => "🎥 Video",
        UploadKind::Audio => "🎵 Audio",
    }
}

pub fn build_upload_callback(id: JobId, kind: UploadKind) -> String {
    format!("{UPLOAD_CALLBACK_PREFIX}{}:{id}", kind_label(kind))
}

pub fn parse_upload_callback(data: &str) -> Option<(JobId, UploadKind)> {
    let payload = data.strip_prefix(UPLOAD_CALLBACK_PREFIX)?;
    let (kind, id) = payload.split_once(':')?;
    let kind = match kind {
        "document" => UploadKind::Document,
        "video" => UploadKind::Video,
        "audio" => UploadKind::Audio,
        _ => return None,
    };
    let id = id.trim().parse().ok()?;
    Some((JobId(id), kind))
}

/// Final filename for a typed name: keeps it when it has a dot, otherwise
/// borrows the original extension (or `mkv`).
pub fn resolve_new_name(typed: &str, original: Option<&str>) -> String {
    let typed = typed.trim();
    if typed.contains('.') {
        return typed.to_string();
    }
    let ext = original
        .filter(|n| n.contains('.'))
        .and_then(|n| n.rsplit('.').next())
        .unwrap_or("mkv");
    format!("{typed}.{ext}")
}

/// Leech filename: `new_name` plus the URL's extension unless already there.
pub fn leech_file_name(url: &str, new_name: &str) -> (String, String) {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let last = path.rsplit('/').next().unwrap_or(path);
    let mut ext = extension_of(last).to_ascii_lowercase();
    if ext.is_empty() {
        ext = ".mp4".to_string();
    }
    let name = if new_name.to_ascii_lowercase().ends_with(&ext) {
        new_name.to_string()
    } else {
        format!("{new_name}{ext}")
    };
    (name, ext)
}

/// Interactive single-file renames and direct-link leeches, bounded by a
/// shared pool of job slots.
#[derive(Clone)]
pub struct Renamer {
    transport: Arc<dyn Transport>,
    media: Arc<dyn MediaTool>,
    http: reqwest::Client,
    archive: ChatId,
    work_dir: PathBuf,
    metadata: Option<String>,
    slots: Arc<Semaphore>,
    prompts: Arc<DashMap<(ChatId, MessageId), (Instant, PendingFile)>>,
    jobs: Arc<DashMap<JobId, (Instant, RenameJob)>>,
    next_job: Arc<AtomicU64>,
    pending_ttl: Duration,
}

impl Renamer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Arc<dyn Transport>,
        media: Arc<dyn MediaTool>,
        http: reqwest::Client,
        archive: ChatId,
        work_dir: PathBuf,
        metadata: Option<String>,
        max_jobs: usize,
    ) -> Self {
        Self {
            transport,
            media,
            http,
            archive,
            work_dir,
            metadata,
            slots: Arc::new(Semaphore::new(max_jobs.max(1))),
            prompts: Arc::new(DashMap::new()),
            jobs: Arc::new(DashMap::new()),
            next_job: Arc::new(AtomicU64::new(1)),
            pending_ttl: PENDING_TTL,
        }
    }

    fn is_fresh(&self, since: Instant) -> bool {
        since.elapsed() < self.pending_ttl
    }

    /// Stores a name prompt, dropping prompts that were never answered.
    pub fn remember_prompt(&self, chat: ChatId, prompt: MessageId, file: PendingFile) {
        self.prompts.retain(|_, (since, _)| self.is_fresh(*since));
        self.prompts.insert((chat, prompt), (Instant::now(), file));
    }

    pub fn take_prompt(&self, chat: ChatId, prompt: MessageId) -> Option<PendingFile> {
        self.prompts
            .remove(&(chat, prompt))
            .filter(|(_, (since, _))| self.is_fresh(*since))
            .map(|(_, (_, f))| f)
    }

    /// Stores a job until its button is clicked, dropping abandoned ones.
    pub fn register_job(&self, job: RenameJob) -> JobId {
        self.jobs.retain(|_, (since, _)| self.is_fresh(*since));
        let id = JobId(self.next_job.fetch_add(1, Ordering::Relaxed));
        self.jobs.insert(id, (Instant::now(), job));
        id
    }

    pub fn take_job(&self, id: JobId) -> Option<RenameJob> {
        self.jobs
            .remove(&id)
            .filter(|(_, (since, _))| self.is_fresh(*since))
            .map(|(_, (_, j))| j)
    }

    async fn acquire_slot(&self) -> Result<tokio::sync::SemaphorePermit<'_>, AppError> {
        self.slots
            .acquire()
            .await
            .map_err(|_| AppError::tool("scheduler", "job slots closed"))
    }

    fn job_dir(&self, user_id: u64, id: JobId) -> PathBuf {
        self.work_dir
            .join("rename")
            .join(user_id.to_string())
            .join(id.to_string())
    }

    /// Runs a rename job once a slot is free.
    #[instrument(skip(self, job), fields(user = job.user_id, file = %job.new_name))]
    pub async fn run_job(&self, id: JobId, job: RenameJob, output: UploadKind) -> Result<(), AppError> {
        let _permit = self.acquire_slot().await?;
        let dir = self.job_dir(job.user_id, id);
        let result = self.rename_in(&dir, &job, output).await;
        if let Err(err) = tokio::fs::remove_dir_all(&dir).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(dir = %dir.display(), error = %err, "Cleanup failed");
            }
        }
        result
    }

    async fn rename_in(&self, dir: &Path, job: &RenameJob, output: UploadKind) -> Result<(), AppError> {
        let ext = extension_of(&job.new_name);
        let dl_path = dir.join(format!("source{ext}"));
        self.transport.fetch(&job.source, &dl_path).await?;

        let path = match self.metadata.as_deref().filter(|m| !m.is_empty()) {
            Some(meta) => {
                let tagged = dir.join(format!("tagged{ext}"));
                match self
                    .media
                    .write_metadata(&dl_path, &tagged, meta, TagScope::Everything)
                    .await
                {
                    Ok(()) => tagged,
                    Err(err) => {
                        warn!(error = %err, "Metadata stamp failed, sending original bytes");
                        dl_path.clone()
                    }
                }
            }
            None => dl_path.clone(),
        };

        let duration = match self.media.probe_duration(&path).await {
            Ok(d) => d,
            Err(err) => {
                warn!(error = %err, "Duration probe failed");
                None
            }
        };
        let thumbnail = self.screenshot_thumbnail(&path, dir, duration).await;

        let caption = bold_caption(&job.new_name);
        let mut upload = Upload {
            path,
            file_name: job.new_name.clone(),
            kind: output,
            caption,
            thumbnail,
            duration,
        };
        self.transport
            .upload(ChatId(job.user_id as i64), &upload)
            .await?;

        upload.kind = job.kind.archive_kind();
        if upload.kind == UploadKind::Document {
            upload.thumbnail = None;
        }
        if let Err(err) = self.transport.upload(self.archive, &upload).await {
            warn!(error = %err, "Archive mirror failed");
        }
        info!("Rename delivered");
        Ok(())
    }

    async fn screenshot_thumbnail(&self, video: &Path, dir: &Path, duration: Option<u32>) -> Option<PathBuf> {
        let thumb = dir.join("thumb.jpg");
        let at = duration.map(|d| d / 2).unwrap_or(0);
        if let Err(err) = self.media.screenshot(video, at, &thumb).await {
            warn!(error = %err, "No screenshot thumbnail");
            return None;
        }
        match normalize_thumbnail(&thumb).await {
            Ok(_) => Some(thumb),
            Err(err) => {
                warn!(error = %err, "Screenshot thumbnail unusable");
                None
            }
        }
    }

    /// Downloads `url`, fixes its container, delivers it and mirrors it to the
    /// archive with a credit line. Returns the final filename.
    #[instrument(skip(self, credit))]
    pub async fn leech(
        &self,
        user_id: u64,
        url: &str,
        new_name: &str,
        credit: &str,
    ) -> Result<String, AppError> {
        let _permit = self.acquire_slot().await?;
        let id = JobId(self.next_job.fetch_add(1, Ordering::Relaxed));
        let dir = self.work_dir.join("leech").join(id.to_string());
        let result = self.leech_in(&dir, user_id, url, new_name, credit).await;
        if let Err(err) = tokio::fs::remove_dir_all(&dir).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(dir = %dir.display(), error = %err, "Cleanup failed");
            }
        }
        result
    }

    async fn leech_in(
        &self,
        dir: &Path,
        user_id: u64,
        url: &str,
        new_name: &str,
        credit: &str,
    ) -> Result<String, AppError> {
        let (final_name, ext) = leech_file_name(url, new_name);
        let raw = dir.join(format!("temp{ext}"));
        download_to(&self.http, url, &raw).await?;

        let fixed = dir.join(format!("fixed{ext}"));
        let path = match self.media.fix_container(&raw, &fixed).await {
            Ok(()) => fixed,
            Err(err) => {
                warn!(error = %err, "Container fix failed, sending as downloaded");
                raw
            }
        };

        let upload = Upload {
            path,
            file_name: final_name.clone(),
            kind: if is_video_extension(&ext) {
                UploadKind::Video
            } else {
                UploadKind::Document
            },
            caption: bold_caption(&final_name),
            thumbnail: None,
            duration: None,
        };
        self.transport
            .upload(ChatId(user_id as i64), &upload)
            .await?;

        match self.transport.upload(self.archive, &upload).await {
            Ok(sent) => {
                let note = format!("This file was renamed by {credit}");
                if let Err(err) = self.transport.send_text(self.archive, note, Some(sent)).await {
                    warn!(error = %err, "Archive credit failed");
                }
            }
            Err(err) => warn!(error = %err, "Archive mirror failed"),
        }
        Ok(final_name)
    }
}

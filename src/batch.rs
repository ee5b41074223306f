use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use teloxide::types::ChatId;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::error::AppError;
use crate::media::{MediaTool, TagScope};
use crate::naming::{bold_caption, build_filename, ensure_extension, extension_of, is_video_extension};
use crate::quality::QualityLadder;
use crate::session::{EntryState, QueueEntry, Session, SessionPatch, SessionStore};
use crate::transport::{Transport, Upload, UploadKind};

/// Template used when a session somehow reaches a run without a format.
const FALLBACK_FORMAT: &str = "{ep} {quality}";

/// Result of a `/rename_all` trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    NoSession,
    EmptyQueue,
    AlreadyRunning,
    Completed(BatchReport),
}

impl RunOutcome {
    /// User-facing text. Per-entry failures are not distinguished here.
    pub fn text(&self) -> &'static str {
        match self {
            RunOutcome::NoSession => "❗ No active auto-rename session. Start with /auto_rename",
            RunOutcome::EmptyQueue => "❗ No episodes queued. Upload files first.",
            RunOutcome::AlreadyRunning => "⚠️ Rename already in progress. Wait for it to finish.",
            RunOutcome::Completed(_) => "✅ All episodes renamed and uploaded successfully!",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub done: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Entries never consumed: empty/non-numeric episode or off-ladder quality.
    pub unscheduled: usize,
}

enum EntryResult {
    Delivered,
    Skipped,
}

/// Queue indices in processing order: numeric episodes ascending by value, then
/// ladder order within an episode, encounter order among ties. Only pending
/// entries are returned.
pub fn processing_order(queue: &[QueueEntry], ladder: &QualityLadder) -> Vec<usize> {
    let mut by_episode: BTreeMap<u64, Vec<usize>> = BTreeMap::new();
    for (idx, entry) in queue.iter().enumerate() {
        let ep = entry.episode.as_str();
        if ep.is_empty() || !ep.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        if entry.state != EntryState::Pending || !ladder.contains(&entry.quality) {
            continue;
        }
        let Ok(n) = ep.parse::<u64>() else { continue };
        by_episode.entry(n).or_default().push(idx);
    }

    let mut order = Vec::new();
    for indices in by_episode.values() {
        for tier in ladder.tiers() {
            order.extend(indices.iter().copied().filter(|&i| queue[i].quality == tier));
        }
    }
    order
}

/// Drains auto-rename sessions, one run per user at a time.
#[derive(Clone)]
pub struct BatchProcessor {
    store: SessionStore,
    transport: Arc<dyn Transport>,
    media: Arc<dyn MediaTool>,
    archive: ChatId,
    work_dir: PathBuf,
    ladder: QualityLadder,
    locks: Arc<DashMap<u64, Arc<Mutex<()>>>>,
}

impl BatchProcessor {
    pub fn new(
        store: SessionStore,
        transport: Arc<dyn Transport>,
        media: Arc<dyn MediaTool>,
        archive: ChatId,
        work_dir: PathBuf,
        ladder: QualityLadder,
    ) -> Self {
        Self {
            store,
            transport,
            media,
            archive,
            work_dir,
            ladder,
            locks: Arc::new(DashMap::new()),
        }
    }

    fn user_dir(&self, user_id: u64) -> PathBuf {
        self.work_dir.join("auto_rename").join(user_id.to_string())
    }

    /// Processes the user's whole queue. Never blocks on another run for the
    /// same user: a held lock yields `AlreadyRunning` immediately.
    #[instrument(skip(self))]
    pub async fn run(&self, user_id: u64) -> Result<RunOutcome, AppError> {
        match self.store.read(user_id).await? {
            None => return Ok(RunOutcome::NoSession),
            Some(s) if s.episode_queue.is_empty() => return Ok(RunOutcome::EmptyQueue),
            Some(_) => {}
        }

        let lock = self.locks.entry(user_id).or_default().clone();
        let Ok(guard) = lock.try_lock_owned() else {
            info!(user = user_id, "Batch already running");
            return Ok(RunOutcome::AlreadyRunning);
        };

        let outcome = self.run_locked(user_id).await;
        drop(guard);
        // entries are cloned under the shard lock, so a count of one means idle
        self.locks
            .remove_if(&user_id, |_, lock| Arc::strong_count(lock) == 1);
        outcome
    }

    async fn run_locked(&self, user_id: u64) -> Result<RunOutcome, AppError> {
        // a run that finished between the first read and the lock has deleted it
        let Some(session) = self.store.read(user_id).await? else {
            return Ok(RunOutcome::NoSession);
        };

        self.store.update(user_id, SessionPatch::processing(true)).await?;
        let chat = ChatId(user_id as i64);
        let start = format!(
            "🚀 Starting auto-rename for {} items... Files are processed one at a time.",
            session.episode_queue.len()
        );
        if let Err(err) = self.transport.send_text(chat, start, None).await {
            warn!(user = user_id, error = %err, "Failed to send start notice");
        }

        let swept = self.sweep(user_id, session).await;

        if let Err(err) = self.store.update(user_id, SessionPatch::processing(false)).await {
            warn!(user = user_id, error = %err, "Failed to clear processing flag");
        }
        self.remove_user_dir(user_id).await;
        self.store.delete(user_id).await?;

        let report = swept?;
        info!(
            user = user_id,
            done = report.done,
            failed = report.failed,
            skipped = report.skipped,
            unscheduled = report.unscheduled,
            "Batch finished"
        );
        Ok(RunOutcome::Completed(report))
    }

    /// Drops the session thumbnail and any leftovers along with the session.
    async fn remove_user_dir(&self, user_id: u64) {
        let dir = self.user_dir(user_id);
        if let Err(err) = tokio::fs::remove_dir_all(&dir).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(user = user_id, dir = %dir.display(), error = %err, "Cleanup failed");
            }
        }
    }

    async fn sweep(&self, user_id: u64, mut session: Session) -> Result<BatchReport, AppError> {
        let order = processing_order(&session.episode_queue, &self.ladder);
        let mut report = BatchReport {
            unscheduled: session.episode_queue.len() - order.len(),
            ..BatchReport::default()
        };

        for (seq, idx) in order.into_iter().enumerate() {
            let entry = session.episode_queue[idx].clone();
            match self.process_entry(&session, &entry, seq).await {
                Ok(EntryResult::Delivered) => {
                    session.episode_queue[idx].settle(true);
                    report.done += 1;
                }
                Ok(EntryResult::Skipped) => {
                    report.skipped += 1;
                    continue;
                }
                Err(err) => {
                    error!(
                        user = user_id,
                        episode = %entry.episode,
                        quality = %entry.quality,
                        error = %err,
                        "Entry failed"
                    );
                    session.episode_queue[idx].settle(false);
                    report.failed += 1;
                }
            }
            self.store
                .update(
                    user_id,
                    SessionPatch {
                        episode_queue: Some(session.episode_queue.clone()),
                        ..SessionPatch::default()
                    },
                )
                .await?;
        }
        Ok(report)
    }

    async fn process_entry(
        &self,
        session: &Session,
        entry: &QueueEntry,
        seq: usize,
    ) -> Result<EntryResult, AppError> {
        let Some(source) = entry.source_reference.as_deref() else {
            debug!(episode = %entry.episode, "Placeholder entry without a file, skipping");
            return Ok(EntryResult::Skipped);
        };

        let dir = self.user_dir(session.user_id);
        let ext = extension_of(entry.original_filename.as_deref().unwrap_or("file"));
        let dl_path = dir.join(format!("dl_{seq}_{}_{}{ext}", entry.episode, entry.quality));
        let out_path = dir.join(format!("renamed_{seq}{ext}"));

        let result = self
            .deliver(session, entry, source, &ext, &dl_path, &out_path)
            .await;

        for path in [&dl_path, &out_path] {
            if let Err(err) = tokio::fs::remove_file(path).await {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %err, "Cleanup failed");
                }
            }
        }
        result.map(|_| EntryResult::Delivered)
    }

    async fn deliver(
        &self,
        session: &Session,
        entry: &QueueEntry,
        source: &str,
        ext: &str,
        dl_path: &Path,
        out_path: &Path,
    ) -> Result<(), AppError> {
        self.transport.fetch(source, dl_path).await?;

        let format = session.rename_format.as_deref().unwrap_or(FALLBACK_FORMAT);
        let new_name = ensure_extension(
            &build_filename(format, &entry.episode, &entry.season, &entry.quality),
            ext,
        );

        let upload_path = match session.metadata_text.as_deref().filter(|m| !m.is_empty()) {
            Some(meta) => match self
                .media
                .write_metadata(dl_path, out_path, meta, TagScope::ContainerAndFirstAudio)
                .await
            {
                Ok(()) => out_path.to_path_buf(),
                Err(err) => {
                    warn!(file = %new_name, error = %err, "Metadata rewrite failed, sending original bytes");
                    dl_path.to_path_buf()
                }
            },
            None => dl_path.to_path_buf(),
        };

        let upload = Upload {
            path: upload_path,
            file_name: new_name.clone(),
            kind: if is_video_extension(ext) {
                UploadKind::Video
            } else {
                UploadKind::Document
            },
            caption: bold_caption(&new_name),
            thumbnail: session.thumbnail.clone().filter(|p| p.exists()),
            duration: None,
        };

        self.transport
            .upload(ChatId(session.user_id as i64), &upload)
            .await?;
        if let Err(err) = self.transport.upload(self.archive, &upload).await {
            warn!(file = %new_name, error = %err, "Archive mirror failed");
        }
        info!(user = session.user_id, file = %new_name, "Entry delivered");
        Ok(())
    }
}

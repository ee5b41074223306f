use std::path::PathBuf;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::error::AppError;
use crate::media::normalize_thumbnail;
use crate::parser;
use crate::quality::{self, DEFAULT_QUALITY};
use crate::session::{QueueEntry, Session, SessionPatch, SessionStore};
use crate::transport::Transport;

static MANUAL_ENTRY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(\d{1,3})\s*(\d{3,4}p)?$").expect("manual entry regex"));

/// A user message, reduced to what the auto-rename workflow looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    Photo {
        file_id: String,
    },
    Text(String),
    Media {
        file_id: String,
        file_name: Option<String>,
        caption: Option<String>,
        message_id: i32,
    },
}

/// Which session field the next message fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    AwaitingThumbnail,
    AwaitingMetadata,
    AwaitingFormat,
    AwaitingFiles,
}

impl Step {
    pub fn of(session: &Session) -> Step {
        if session.thumbnail.is_none() {
            Step::AwaitingThumbnail
        } else if session.metadata_text.is_none() {
            Step::AwaitingMetadata
        } else if session.rename_format.is_none() {
            Step::AwaitingFormat
        } else {
            Step::AwaitingFiles
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    SaveThumbnail { file_id: String },
    ThumbnailAlreadySet,
    SaveMetadata(String),
    SaveFormat { format: String, has_placeholders: bool },
    Enqueue(QueueEntry),
    FormatRequired,
    Busy,
    Ignore,
}

/// What the user is told after a message was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Started,
    ThumbnailSaved,
    ThumbnailAlreadySet,
    MetadataSaved,
    FormatSaved { has_placeholders: bool },
    Queued { episode: String, quality: String },
    FormatRequired,
    Busy,
}

impl Reply {
    pub fn text(&self) -> String {
        match self {
            Reply::Started => "📸 Please send a thumbnail image for auto rename.".to_string(),
            Reply::ThumbnailSaved => "✅ Thumbnail saved! Now send metadata (video title, audio title, subtitle).\nExample: @CrunchyRollChannel For More Animes In Hindi!".to_string(),
            Reply::ThumbnailAlreadySet => "✅ Thumbnail already set. If you want to replace it, send /auto_rename again.".to_string(),
            Reply::MetadataSaved => "✅ Metadata saved! Now send rename format. Use placeholders {ep} {Sn} {quality}.\nExample: [Group] Naruto S{Sn}E{ep} {quality} Hindi".to_string(),
            Reply::FormatSaved { has_placeholders } => {
                let saved = "✅ Format saved! Now upload your files (videos/documents). SxxExx and quality are detected from filenames.";
                if *has_placeholders {
                    saved.to_string()
                } else {
                    format!("⚠️ Format doesn't contain {{ep}} or {{Sn}}, every file will get the same name.\n\n{saved}")
                }
            }
            Reply::Queued { episode, quality } => {
                let ep = if episode.is_empty() { "Unknown" } else { episode.as_str() };
                format!("📥 Saved Episode {ep} • {quality}")
            }
            Reply::FormatRequired => "❗ Please set format first. Use /auto_rename and follow the steps.".to_string(),
            Reply::Busy => "⚠️ Rename already in progress. Wait for it to finish.".to_string(),
        }
    }
}

fn queue_from_upload(
    session: &Session,
    file_id: &str,
    file_name: Option<&str>,
    caption: Option<&str>,
    message_id: i32,
) -> QueueEntry {
    let original = file_name
        .or(caption)
        .map(str::to_string)
        .unwrap_or_else(|| format!("file_{message_id}"));
    let parsed = parser::parse(&original);
    let season = parsed
        .season
        .or_else(|| session.season_default.clone())
        .unwrap_or_default();
    QueueEntry::pending(
        parsed.episode.unwrap_or_default(),
        season,
        parsed.quality.unwrap_or_else(|| DEFAULT_QUALITY.to_string()),
        Some(file_id.to_string()),
        Some(original),
    )
}

fn queue_from_shorthand(session: &Session, text: &str) -> Option<QueueEntry> {
    let caps = MANUAL_ENTRY.captures(text.trim())?;
    let episode = format!("{:0>2}", &caps[1]);
    let quality = caps
        .get(2)
        .map(|m| quality::normalize(m.as_str()))
        .unwrap_or_else(|| DEFAULT_QUALITY.to_string());
    Some(QueueEntry::pending(
        episode,
        session.season_default.clone().unwrap_or_default(),
        quality,
        None,
        None,
    ))
}

/// Decides what a message does to an open session. Pure: no I/O.
pub fn route(session: &Session, incoming: &Incoming) -> Transition {
    if session.processing {
        return Transition::Busy;
    }
    match (Step::of(session), incoming) {
        (Step::AwaitingThumbnail, Incoming::Photo { file_id }) => Transition::SaveThumbnail {
            file_id: file_id.clone(),
        },
        (Step::AwaitingThumbnail, _) => Transition::Ignore,
        (_, Incoming::Photo { .. }) => Transition::ThumbnailAlreadySet,
        (Step::AwaitingMetadata, Incoming::Text(text)) => Transition::SaveMetadata(text.clone()),
        (Step::AwaitingFormat, Incoming::Text(text)) => Transition::SaveFormat {
            format: text.clone(),
            has_placeholders: text.contains("{ep}") || text.contains("{Sn}"),
        },
        (Step::AwaitingMetadata | Step::AwaitingFormat, Incoming::Media { .. }) => {
            Transition::FormatRequired
        }
        (
            Step::AwaitingFiles,
            Incoming::Media {
                file_id,
                file_name,
                caption,
                message_id,
            },
        ) => Transition::Enqueue(queue_from_upload(
            session,
            file_id,
            file_name.as_deref(),
            caption.as_deref(),
            *message_id,
        )),
        (Step::AwaitingFiles, Incoming::Text(text)) => match queue_from_shorthand(session, text) {
            Some(entry) => Transition::Enqueue(entry),
            None => Transition::Ignore,
        },
    }
}

/// Applies routed transitions to the session store.
#[derive(Clone)]
pub struct Conversation {
    store: SessionStore,
    transport: Arc<dyn Transport>,
    work_dir: PathBuf,
}

impl Conversation {
    pub fn new(store: SessionStore, transport: Arc<dyn Transport>, work_dir: PathBuf) -> Self {
        Self {
            store,
            transport,
            work_dir,
        }
    }

    fn user_dir(&self, user_id: u64) -> PathBuf {
        self.work_dir.join("auto_rename").join(user_id.to_string())
    }

    pub async fn start(&self, user_id: u64) -> Result<Reply, AppError> {
        self.store.create(user_id).await?;
        info!(user = user_id, "Auto-rename session started");
        Ok(Reply::Started)
    }

    /// Returns `None` when the user has no open session or the message is ignored.
    pub async fn handle(&self, user_id: u64, incoming: Incoming) -> Result<Option<Reply>, AppError> {
        let Some(session) = self.store.read(user_id).await? else {
            return Ok(None);
        };

        let reply = match route(&session, &incoming) {
            Transition::Ignore => return Ok(None),
            Transition::Busy => Reply::Busy,
            Transition::ThumbnailAlreadySet => Reply::ThumbnailAlreadySet,
            Transition::FormatRequired => Reply::FormatRequired,
            Transition::SaveThumbnail { file_id } => {
                let path = self.user_dir(user_id).join("auto_thumb.jpg");
                self.transport.fetch(&file_id, &path).await?;
                if let Err(err) = normalize_thumbnail(&path).await {
                    warn!(user = user_id, error = %err, "Thumbnail kept as uploaded");
                }
                self.store
                    .update(
                        user_id,
                        SessionPatch {
                            thumbnail: Some(path),
                            ..SessionPatch::default()
                        },
                    )
                    .await?;
                Reply::ThumbnailSaved
            }
            Transition::SaveMetadata(text) => {
                self.store
                    .update(
                        user_id,
                        SessionPatch {
                            metadata_text: Some(text),
                            ..SessionPatch::default()
                        },
                    )
                    .await?;
                Reply::MetadataSaved
            }
            Transition::SaveFormat {
                format,
                has_placeholders,
            } => {
                if !has_placeholders {
                    warn!(user = user_id, %format, "Rename format has no placeholders");
                }
                self.store
                    .update(
                        user_id,
                        SessionPatch {
                            rename_format: Some(format),
                            ..SessionPatch::default()
                        },
                    )
                    .await?;
                Reply::FormatSaved { has_placeholders }
            }
            Transition::Enqueue(entry) => {
                let reply = Reply::Queued {
                    episode: entry.episode.clone(),
                    quality: entry.quality.clone(),
                };
                debug!(user = user_id, episode = %entry.episode, quality = %entry.quality, "Queue entry added");
                self.store.append_entry(user_id, entry).await?;
                reply
            }
        };
        Ok(Some(reply))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::EntryState;
    use crate::testing::FakeTransport;

    fn ready_session() -> Session {
        Session {
            thumbnail: Some("thumb.jpg".into()),
            metadata_text: Some("meta".into()),
            rename_format: Some("S{Sn}E{ep} {quality}".into()),
            ..Session::new(1)
        }
    }

    fn media(name: &str) -> Incoming {
        Incoming::Media {
            file_id: format!("id-{name}"),
            file_name: Some(name.to_string()),
            caption: None,
            message_id: 10,
        }
    }

    #[test]
    fn fill_order_is_strict() {
        let mut s = Session::new(1);
        assert_eq!(Step::of(&s), Step::AwaitingThumbnail);
        assert_eq!(route(&s, &Incoming::Text("meta".into())), Transition::Ignore);
        assert_eq!(route(&s, &media("a.mkv")), Transition::Ignore);
        assert_eq!(
            route(&s, &Incoming::Photo { file_id: "p".into() }),
            Transition::SaveThumbnail { file_id: "p".into() }
        );

        s.thumbnail = Some("t.jpg".into());
        assert_eq!(
            route(&s, &Incoming::Text("meta".into())),
            Transition::SaveMetadata("meta".into())
        );
        assert_eq!(route(&s, &media("a.mkv")), Transition::FormatRequired);
        assert_eq!(
            route(&s, &Incoming::Photo { file_id: "p2".into() }),
            Transition::ThumbnailAlreadySet
        );

        s.metadata_text = Some("meta".into());
        assert_eq!(
            route(&s, &Incoming::Text("Show {quality}".into())),
            Transition::SaveFormat {
                format: "Show {quality}".into(),
                has_placeholders: false
            }
        );
    }

    #[test]
    fn uploads_are_parsed_into_entries() {
        let mut s = ready_session();
        s.season_default = Some("03".into());
        let Transition::Enqueue(e) = route(&s, &media("Show.E07.360p.mkv")) else {
            panic!("expected enqueue");
        };
        assert_eq!(e.episode, "07");
        assert_eq!(e.season, "03");
        assert_eq!(e.quality, "480p");
        assert_eq!(e.source_reference.as_deref(), Some("id-Show.E07.360p.mkv"));
        assert_eq!(e.state, EntryState::Pending);

        let Transition::Enqueue(e) = route(&s, &media("notes.txt")) else {
            panic!("expected enqueue");
        };
        assert_eq!(e.episode, "");
        assert_eq!(e.quality, "480p");
    }

    #[test]
    fn manual_shorthand_only_after_format() {
        let s = ready_session();
        let Transition::Enqueue(e) = route(&s, &Incoming::Text("7 720P".into())) else {
            panic!("expected enqueue");
        };
        assert_eq!((e.episode.as_str(), e.quality.as_str()), ("07", "720p"));
        assert_eq!(e.source_reference, None);
        assert_eq!(route(&s, &Incoming::Text("hello there".into())), Transition::Ignore);

        let mut early = ready_session();
        early.rename_format = None;
        assert!(matches!(
            route(&early, &Incoming::Text("7 720p".into())),
            Transition::SaveFormat { .. }
        ));
    }

    #[test]
    fn busy_session_rejects_everything() {
        let mut s = ready_session();
        s.processing = true;
        assert_eq!(route(&s, &media("Show.S01E01.mkv")), Transition::Busy);
        assert_eq!(route(&s, &Incoming::Text("1".into())), Transition::Busy);
    }

    #[tokio::test]
    async fn walks_the_whole_workflow() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::in_memory();
        let transport = Arc::new(FakeTransport::default());
        let conv = Conversation::new(store.clone(), transport.clone(), dir.path().to_path_buf());

        assert_eq!(conv.handle(5, Incoming::Text("x".into())).await.unwrap(), None);
        assert_eq!(conv.start(5).await.unwrap(), Reply::Started);

        let reply = conv
            .handle(5, Incoming::Photo { file_id: "photo".into() })
            .await
            .unwrap();
        assert_eq!(reply, Some(Reply::ThumbnailSaved));
        let thumb = store.read(5).await.unwrap().unwrap().thumbnail.unwrap();
        assert!(thumb.exists());

        conv.handle(5, Incoming::Text("My meta".into())).await.unwrap();
        let reply = conv
            .handle(5, Incoming::Text("[G] S{Sn}E{ep} {quality}".into()))
            .await
            .unwrap();
        assert_eq!(reply, Some(Reply::FormatSaved { has_placeholders: true }));

        let reply = conv.handle(5, media("[G] Show S01E02 1080p.mkv")).await.unwrap();
        assert_eq!(
            reply,
            Some(Reply::Queued {
                episode: "02".into(),
                quality: "1080p".into()
            })
        );

        let s = store.read(5).await.unwrap().unwrap();
        assert_eq!(s.metadata_text.as_deref(), Some("My meta"));
        assert_eq!(s.episode_queue.len(), 1);
        assert_eq!(s.episode_queue[0].season, "01");
    }

    #[test]
    fn reply_texts() {
        assert_eq!(
            Reply::Queued { episode: String::new(), quality: "720p".into() }.text(),
            "📥 Saved Episode Unknown • 720p"
        );
        assert!(Reply::FormatSaved { has_placeholders: false }.text().starts_with("⚠️"));
    }
}

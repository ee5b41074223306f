use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::error::AppError;

/// Telegram rejects thumbnails larger than this on either side.
const THUMB_MAX_SIDE: u32 = 320;

/// Which streams receive the metadata title.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagScope {
    /// Container title plus the first audio stream.
    ContainerAndFirstAudio,
    /// Container title/author/artist plus every video, audio and subtitle stream.
    Everything,
}

/// External media tooling. All operations stream-copy; nothing re-encodes.
#[async_trait]
pub trait MediaTool: Send + Sync {
    async fn write_metadata(
        &self,
        src: &Path,
        dst: &Path,
        title: &str,
        scope: TagScope,
    ) -> Result<(), AppError>;

    /// Remux with `+faststart`/`+genpts` so players see a real duration.
    async fn fix_container(&self, src: &Path, dst: &Path) -> Result<(), AppError>;

    /// Duration in whole seconds, `None` when the probe reports nothing usable.
    async fn probe_duration(&self, path: &Path) -> Result<Option<u32>, AppError>;

    /// Grabs one frame at `at_secs` into `dst`.
    async fn screenshot(&self, video: &Path, at_secs: u32, dst: &Path) -> Result<(), AppError>;
}

/// `ffmpeg`/`ffprobe` found on `PATH`.
#[derive(Debug, Clone)]
pub struct Ffmpeg {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl Default for Ffmpeg {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
        }
    }
}

fn metadata_args(title: &str, scope: TagScope) -> Vec<String> {
    let tag = format!("title={title}");
    match scope {
        TagScope::ContainerAndFirstAudio => vec![
            "-c".into(),
            "copy".into(),
            "-metadata".into(),
            tag.clone(),
            "-metadata:s:a:0".into(),
            tag,
        ],
        TagScope::Everything => vec![
            "-c:s".into(),
            "copy".into(),
            "-c:a".into(),
            "copy".into(),
            "-c:v".into(),
            "copy".into(),
            "-metadata".into(),
            tag.clone(),
            "-metadata".into(),
            format!("author={title}"),
            "-metadata:s:s".into(),
            tag.clone(),
            "-metadata:s:a".into(),
            tag.clone(),
            "-metadata:s:v".into(),
            tag,
            "-metadata".into(),
            format!("artist={title}"),
        ],
    }
}

async fn run_tool(tool: &'static str, cmd: &mut Command) -> Result<Vec<u8>, AppError> {
    let output = cmd.output().await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: String = stderr.trim().lines().last().unwrap_or_default().to_string();
        warn!(tool, status = %output.status, stderr = %tail, "External tool failed");
        return Err(AppError::tool(tool, format!("{} ({tail})", output.status)));
    }
    Ok(output.stdout)
}

#[async_trait]
impl MediaTool for Ffmpeg {
    #[instrument(skip(self, src, title), fields(src = %src.display()))]
    async fn write_metadata(
        &self,
        src: &Path,
        dst: &Path,
        title: &str,
        scope: TagScope,
    ) -> Result<(), AppError> {
        let mut cmd = Command::new(&self.ffmpeg);
        cmd.arg("-y")
            .arg("-i")
            .arg(src)
            .args(["-map", "0"])
            .args(metadata_args(title, scope))
            .arg(dst);
        run_tool("ffmpeg", &mut cmd).await?;
        debug!(dst = %dst.display(), "Metadata written");
        Ok(())
    }

    #[instrument(skip(self, src), fields(src = %src.display()))]
    async fn fix_container(&self, src: &Path, dst: &Path) -> Result<(), AppError> {
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut cmd = Command::new(&self.ffmpeg);
        cmd.arg("-i")
            .arg(src)
            .args(["-c", "copy", "-map", "0", "-movflags", "+faststart", "-fflags", "+genpts", "-y"])
            .arg(dst);
        run_tool("ffmpeg", &mut cmd).await?;
        Ok(())
    }

    async fn probe_duration(&self, path: &Path) -> Result<Option<u32>, AppError> {
        let mut cmd = Command::new(&self.ffprobe);
        cmd.args([
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
        ])
        .arg(path);
        let stdout = run_tool("ffprobe", &mut cmd).await?;
        Ok(parse_duration(&String::from_utf8_lossy(&stdout)))
    }

    async fn screenshot(&self, video: &Path, at_secs: u32, dst: &Path) -> Result<(), AppError> {
        let mut cmd = Command::new(&self.ffmpeg);
        cmd.arg("-ss")
            .arg(at_secs.to_string())
            .arg("-i")
            .arg(video)
            .args(["-vframes", "1", "-y"])
            .arg(dst);
        run_tool("ffmpeg", &mut cmd).await?;
        if !tokio::fs::try_exists(dst).await.unwrap_or(false) {
            return Err(AppError::tool("ffmpeg", "screenshot produced no file"));
        }
        Ok(())
    }
}

fn parse_duration(raw: &str) -> Option<u32> {
    let secs: f64 = raw.trim().parse().ok()?;
    if secs.is_finite() && secs > 0.0 {
        Some(secs as u32)
    } else {
        None
    }
}

/// Re-encodes an image in place as an RGB JPEG no larger than 320px a side.
/// Returns the resulting dimensions.
pub async fn normalize_thumbnail(path: &Path) -> Result<(u32, u32), AppError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<(u32, u32), AppError> {
        let img = image::io::Reader::open(&path)?
            .with_guessed_format()?
            .decode()?;
        let img = if img.width() > THUMB_MAX_SIDE || img.height() > THUMB_MAX_SIDE {
            img.thumbnail(THUMB_MAX_SIDE, THUMB_MAX_SIDE)
        } else {
            img
        };
        let rgb = img.to_rgb8();
        rgb.save_with_format(&path, image::ImageFormat::Jpeg)?;
        Ok(rgb.dimensions())
    })
    .await?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_probe_output() {
        assert_eq!(parse_duration("1423.456000\n"), Some(1423));
        assert_eq!(parse_duration("N/A"), None);
        assert_eq!(parse_duration("0.0"), None);
    }

    #[test]
    fn first_audio_scope_uses_stream_copy() {
        let args = metadata_args("My Title", TagScope::ContainerAndFirstAudio);
        assert_eq!(
            args,
            vec!["-c", "copy", "-metadata", "title=My Title", "-metadata:s:a:0", "title=My Title"]
        );
        let all = metadata_args("T", TagScope::Everything);
        assert!(all.contains(&"-metadata:s:s".to_string()));
        assert!(all.contains(&"artist=T".to_string()));
    }

    #[tokio::test]
    async fn thumbnail_is_shrunk_to_jpeg() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("thumb.jpg");
        let img = image::RgbaImage::from_pixel(640, 480, image::Rgba([10, 20, 30, 255]));
        img.save_with_format(&path, image::ImageFormat::Png).unwrap();

        let (w, h) = normalize_thumbnail(&path).await.unwrap();
        assert_eq!((w, h), (320, 240));
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(image::guess_format(&bytes).unwrap(), image::ImageFormat::Jpeg);
    }
}

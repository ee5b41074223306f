use std::path::Path;

use teloxide::utils::html;

const VIDEO_EXTENSIONS: &[&str] = &[".mp4", ".mkv", ".mov", ".webm", ".avi"];

/// Re-pads purely numeric values to two digits; anything else passes through.
fn repad(value: &str) -> String {
    if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) {
        match value.parse::<u64>() {
            Ok(n) => format!("{n:02}"),
            Err(_) => value.to_string(),
        }
    } else {
        value.to_string()
    }
}

/// Renders a rename template.
///
/// Recognised placeholders are `{ep}`, `{Sn}` and `{quality}`. When the season
/// is empty a conventional `S{Sn}` prefix is removed as a whole before the
/// bare token, so `S{Sn}E{ep}` degrades to `E{ep}`. Whitespace runs collapse
/// to a single space and the result is trimmed.
pub fn build_filename(template: &str, episode: &str, season: &str, quality: &str) -> String {
    let episode = repad(episode);
    let season = repad(season);

    let mut out = template.to_string();
    if season.is_empty() && out.contains("{Sn}") {
        out = out.replace("S{Sn}", "").replace("{Sn}", "");
    }
    let out = out
        .replace("{ep}", &episode)
        .replace("{Sn}", &season)
        .replace("{quality}", quality);

    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Extension of `filename` including the leading dot, or an empty string.
pub fn extension_of(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{e}"))
        .unwrap_or_default()
}

/// Appends `ext` when `name` does not already carry an extension.
pub fn ensure_extension(name: &str, ext: &str) -> String {
    if extension_of(name).is_empty() {
        format!("{name}{ext}")
    } else {
        name.to_string()
    }
}

pub fn is_video_extension(ext: &str) -> bool {
    let ext = ext.to_ascii_lowercase();
    VIDEO_EXTENSIONS.contains(&ext.as_str())
}

/// HTML caption with the filename in bold.
pub fn bold_caption(name: &str) -> String {
    html::bold(&html::escape(name))
}

use once_cell::sync::Lazy;
use regex::Regex;

use crate::quality;

static SEASON_EPISODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)s(\d{1,2})e(\d{1,2})").expect("season/episode regex"));
static CROSS_SEASON_EPISODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(\d{1,2})x(\d{1,2})").expect("NxM regex"));
static EPISODE_ONLY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)e(\d{1,2})").expect("episode regex"));
static QUALITY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(\d{3,4}p|[24]k)").expect("quality regex"));
static CHANNEL_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[(@[A-Za-z0-9_\-]+)\]").expect("channel tag regex"));

/// Fields recovered from an uploaded filename.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedName {
    pub season: Option<String>,
    pub episode: Option<String>,
    pub quality: Option<String>,
    pub channel_tag: Option<String>,
}

/// Zero-pads a 1-2 digit capture to two characters.
fn pad2(raw: &str) -> String {
    format!("{:0>2}", raw)
}

/// Extracts season, episode, quality and channel tag from a filename.
///
/// Season/episode patterns are tried in precedence order (`S01E02`, `1x02`,
/// `E02`) and the first family that matches wins. Quality and channel tag
/// are matched independently. Nothing here fails: unmatched fields stay
/// `None`.
pub fn parse(filename: &str) -> ParsedName {
    let mut parsed = ParsedName::default();

    if let Some(caps) = SEASON_EPISODE
        .captures(filename)
        .or_else(|| CROSS_SEASON_EPISODE.captures(filename))
    {
        parsed.season = Some(pad2(&caps[1]));
        parsed.episode = Some(pad2(&caps[2]));
    } else if let Some(caps) = EPISODE_ONLY.captures(filename) {
        parsed.episode = Some(pad2(&caps[1]));
    }

    parsed.quality = QUALITY
        .captures(filename)
        .map(|caps| quality::normalize(&caps[1]));

    parsed.channel_tag = CHANNEL_TAG
        .captures(filename)
        .map(|caps| caps[1].to_string());

    parsed
}

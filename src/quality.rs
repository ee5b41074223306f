use serde::{Deserialize, Serialize};

/// Label used when a filename carries no recognisable quality.
pub const DEFAULT_QUALITY: &str = "480p";

/// Lowercases a quality label and folds `360p` into `480p`.
pub fn normalize(raw: &str) -> String {
    let q = raw.trim().to_ascii_lowercase();
    if q == "360p" {
        DEFAULT_QUALITY.to_string()
    } else {
        q
    }
}

/// Ordered resolution tiers used to sequence a batch run within one episode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct QualityLadder(Vec<String>);

impl QualityLadder {
    pub fn new<I, S>(tiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut out: Vec<String> = Vec::new();
        for tier in tiers {
            let tier = normalize(tier.as_ref());
            if !tier.is_empty() && !out.contains(&tier) {
                out.push(tier);
            }
        }
        Self(out)
    }

    pub fn tiers(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn contains(&self, quality: &str) -> bool {
        self.0.iter().any(|t| t == quality)
    }
}

impl Default for QualityLadder {
    fn default() -> Self {
        Self::new(["480p", "720p", "1080p"])
    }
}

impl From<Vec<String>> for QualityLadder {
    fn from(tiers: Vec<String>) -> Self {
        Self::new(tiers)
    }
}

impl From<QualityLadder> for Vec<String> {
    fn from(ladder: QualityLadder) -> Self {
        ladder.0
    }
}

// Deezer metadata lookup
//
// Fills ISRC, BPM, label, genre and release date that the upload's own tags
// lack. Free API, no authentication.

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;
use tracing::debug;

const DEEZER_API_URL: &str = "https://api.deezer.com";

/// Candidates scoring below this are ignored
pub const MINIMUM_MATCH_SCORE: f64 = 0.50;

const ARTIST_WEIGHT: f64 = 0.4;
const TITLE_WEIGHT: f64 = 0.6;

static RE_FEATURING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\s*\b(?:feat\.?|ft\.?|featuring)\s+.*$").unwrap_or_else(|e| panic!("{e}"))
});
static RE_PARENTHETICAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s*\(.*?\)").unwrap_or_else(|e| panic!("{e}")));

#[derive(Debug, Clone, Deserialize)]
pub struct Candidate {
    pub id: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub artist: CandidateArtist,
    #[serde(default)]
    pub album: CandidateAlbum,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CandidateArtist {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CandidateAlbum {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    data: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct TrackDetail {
    #[serde(default)]
    isrc: Option<String>,
    #[serde(default)]
    bpm: Option<f64>,
    #[serde(default)]
    release_date: Option<String>,
    #[serde(default)]
    album: Option<AlbumRef>,
}

#[derive(Debug, Deserialize)]
struct AlbumRef {
    id: u64,
}

#[derive(Debug, Deserialize)]
struct AlbumDetail {
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    release_date: Option<String>,
    #[serde(default)]
    genres: Option<GenreList>,
}

#[derive(Debug, Deserialize)]
struct GenreList {
    #[serde(default)]
    data: Vec<Genre>,
}

#[derive(Debug, Deserialize)]
struct Genre {
    name: String,
}

/// Best Deezer match with its details
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeezerMatch {
    pub deezer_id: u64,
    pub score: f64,
    pub title: String,
    pub artist: String,
    pub album: Option<String>,
    pub isrc: Option<String>,
    pub bpm: Option<u32>,
    pub release_date: Option<String>,
    pub label: Option<String>,
    pub genre: Option<String>,
}

pub struct DeezerClient {
    client: reqwest::Client,
    base_url: String,
}

impl DeezerClient {
    pub fn new() -> Result<Self> {
        Self::with_base_url(DEEZER_API_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("stemcut/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Look up a track; `Ok(None)` when nothing scores high enough
    pub async fn lookup(&self, artist: &str, title: &str) -> Result<Option<DeezerMatch>> {
        let (artist, title) = search_terms(artist, title);
        if artist.is_empty() || title.is_empty() {
            return Ok(None);
        }

        let mut candidates = self
            .search(&format!("artist:\"{}\" track:\"{}\"", artist, title))
            .await?;
        if candidates.is_empty() {
            candidates = self.search(&format!("{} {}", artist, title)).await?;
        }

        let Some((best, score)) = best_candidate(&candidates, &artist, &title) else {
            debug!(artist = %artist, title = %title, "No Deezer match above threshold");
            return Ok(None);
        };

        let mut found = DeezerMatch {
            deezer_id: best.id,
            score,
            title: best.title.clone(),
            artist: best.artist.name.clone(),
            album: Some(best.album.title.clone()).filter(|a| !a.is_empty()),
            ..Default::default()
        };

        let detail: TrackDetail = self.get_json(&format!("/track/{}", best.id)).await?;
        found.isrc = detail.isrc.filter(|i| !i.is_empty());
        found.bpm = detail.bpm.filter(|b| *b > 0.0).map(|b| b.round() as u32);
        found.release_date = detail.release_date.filter(|d| !d.is_empty());

        let album_id = detail.album.map(|a| a.id).or(best.album.id);
        if let Some(album_id) = album_id {
            let album: AlbumDetail = self.get_json(&format!("/album/{}", album_id)).await?;
            found.label = album.label.filter(|l| !l.is_empty());
            if found.release_date.is_none() {
                found.release_date = album.release_date.filter(|d| !d.is_empty());
            }
            found.genre = album
                .genres
                .and_then(|g| g.data.into_iter().next())
                .map(|g| g.name);
        }

        debug!(
            deezer_id = found.deezer_id,
            score = found.score,
            "Deezer match: '{}' - '{}'",
            found.artist,
            found.title
        );
        Ok(Some(found))
    }

    async fn search(&self, query: &str) -> Result<Vec<Candidate>> {
        let response = self
            .client
            .get(format!("{}/search", self.base_url))
            .query(&[("q", query), ("limit", "5")])
            .send()
            .await
            .context("Deezer search request failed")?;

        if !response.status().is_success() {
            anyhow::bail!("Deezer search returned error: {}", response.status());
        }
        let body: SearchResponse = response
            .json()
            .await
            .context("Failed to parse Deezer search response")?;
        Ok(body.data)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await
            .with_context(|| format!("Deezer request {} failed", path))?;

        if !response.status().is_success() {
            anyhow::bail!("Deezer {} returned error: {}", path, response.status());
        }
        response
            .json()
            .await
            .with_context(|| format!("Failed to parse Deezer response for {}", path))
    }
}

/// Search terms: artist without featured credits, title without parentheticals
pub fn search_terms(artist: &str, title: &str) -> (String, String) {
    let artist = RE_FEATURING.replace(artist, "").trim().to_string();
    let title = RE_PARENTHETICAL.replace_all(title, "");
    let title = title.trim().trim_end_matches('-').trim().to_string();
    (artist, title)
}

/// Lowercase, punctuation removed, whitespace collapsed
pub fn normalize(s: &str) -> String {
    let cleaned: String = s
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c.is_whitespace() { c } else { ' ' })
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Jaccard overlap of the word sets
pub fn word_overlap(a: &str, b: &str) -> f64 {
    let a = normalize(a);
    let b = normalize(b);
    let words_a: HashSet<&str> = a.split_whitespace().collect();
    let words_b: HashSet<&str> = b.split_whitespace().collect();
    if words_a.is_empty() || words_b.is_empty() {
        return 0.0;
    }
    let intersection = words_a.intersection(&words_b).count();
    let union = words_a.union(&words_b).count();
    intersection as f64 / union as f64
}

/// 1.0 when either normalized string contains the other
pub fn containment(a: &str, b: &str) -> f64 {
    let a = normalize(a);
    let b = normalize(b);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a.contains(&b) || b.contains(&a) {
        1.0
    } else {
        0.0
    }
}

pub fn score_candidate(candidate: &Candidate, artist: &str, title: &str) -> f64 {
    let artist_score = word_overlap(artist, &candidate.artist.name).max(containment(artist, &candidate.artist.name));
    let title_score = word_overlap(title, &candidate.title).max(containment(title, &candidate.title));
    artist_score * ARTIST_WEIGHT + title_score * TITLE_WEIGHT
}

/// Highest-scoring candidate at or above [`MINIMUM_MATCH_SCORE`]
pub fn best_candidate<'a>(candidates: &'a [Candidate], artist: &str, title: &str) -> Option<(&'a Candidate, f64)> {
    candidates
        .iter()
        .map(|c| (c, score_candidate(c, artist, title)))
        .fold(None, |best: Option<(&Candidate, f64)>, (c, score)| match best {
            Some((_, best_score)) if best_score >= score => best,
            _ => Some((c, score)),
        })
        .filter(|(_, score)| *score >= MINIMUM_MATCH_SCORE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: u64, artist: &str, title: &str) -> Candidate {
        Candidate {
            id,
            title: title.to_string(),
            artist: CandidateArtist { name: artist.to_string() },
            album: CandidateAlbum::default(),
        }
    }

    #[test]
    fn test_search_terms_strip_credits() {
        let (artist, title) = search_terms("Akon feat. John Mamann", "Tt Freak (Clean) -");
        assert_eq!(artist, "Akon");
        assert_eq!(title, "Tt Freak");
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("  Don't   Stop!  "), "don t stop");
    }

    #[test]
    fn test_scores() {
        assert_eq!(word_overlap("hot spot", "Hot Spot"), 1.0);
        assert!((word_overlap("hot spot remix", "hot spot") - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(containment("Daft Punk", "Daft Punk & Pharrell"), 1.0);
        assert_eq!(containment("Daft Punk", "Justice"), 0.0);

        let exact = candidate(1, "Daft Punk", "Get Lucky");
        assert!((score_candidate(&exact, "Daft Punk", "Get Lucky") - 1.0).abs() < 1e-9);

        // Right title, wrong artist: 0.6
        let cover = candidate(2, "Some Band", "Get Lucky");
        assert!((score_candidate(&cover, "Daft Punk", "Get Lucky") - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_best_candidate_threshold() {
        let candidates = vec![
            candidate(1, "Other", "Unrelated Song"),
            candidate(2, "Daft Punk", "Get Lucky (Radio Edit)"),
        ];
        let (best, score) = best_candidate(&candidates, "Daft Punk", "Get Lucky").unwrap();
        assert_eq!(best.id, 2);
        assert!(score >= MINIMUM_MATCH_SCORE);

        // Artist only: 0.4 is below the threshold
        let weak = vec![candidate(3, "Daft Punk", "Around The World")];
        assert!(best_candidate(&weak, "Daft Punk", "Get Lucky").is_none());
    }
}

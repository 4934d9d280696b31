//! First-match tracker pattern matching with an O(1) URL cache.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::RwLock;

use regex::{Regex, RegexBuilder};
use serde::Serialize;
use trackcap_configuration::TrackerSettings;

use super::Error;

/// Upper bound on cached URL → id mappings. The cache is flushed when the
/// bound is reached; repeated matches repopulate it immediately.
const URL_CACHE_CAPACITY: usize = 4096;

/// Matching statistics for the stats endpoint.
#[derive(Serialize, PartialEq, Eq, Debug, Clone, Copy, Default)]
pub struct MatcherStats {
    pub cache_size: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

/// One row of the detailed trace returned by [`TrackerMatcher::test`].
#[derive(Serialize, PartialEq, Eq, Debug, Clone)]
pub struct PatternTrace {
    pub tracker_id: String,
    pub pattern: String,
    /// The pattern after forgiving-shorthand normalization, which is what
    /// actually ran against the URL.
    pub normalized: String,
    pub matches: bool,
}

/// The result of testing a URL against the configured patterns.
#[derive(Serialize, PartialEq, Eq, Debug, Clone)]
pub struct MatchTest {
    pub url: String,
    pub matched_tracker: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<Vec<PatternTrace>>,
}

#[derive(Debug)]
struct CompiledPattern {
    tracker_id: String,
    raw: String,
    normalized: String,
    regex: Regex,
}

#[derive(Debug)]
struct Inner {
    trackers: Vec<TrackerSettings>,
    /// Compiled patterns in declared order; the catch-all sits last, so
    /// walking the list front to back yields first-match semantics.
    patterns: Vec<CompiledPattern>,
    catch_all_id: String,
    url_cache: HashMap<String, String>,
}

/// Maps announce URLs to configured tracker ids.
///
/// Patterns are evaluated in declared order and the first match wins. A
/// bounded URL cache accelerates repeated matches; it is invalidated on
/// reload.
#[derive(Debug)]
pub struct TrackerMatcher {
    inner: RwLock<Inner>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl TrackerMatcher {
    /// Compiles the configured patterns.
    ///
    /// # Errors
    ///
    /// Returns an [`Error`] when the list lacks a trailing catch-all or a
    /// pattern does not compile.
    pub fn new(trackers: Vec<TrackerSettings>) -> Result<Self, Error> {
        let inner = Inner::compile(trackers)?;

        Ok(Self {
            inner: RwLock::new(inner),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
        })
    }

    /// Maps a tracker URL to the id of the first matching pattern.
    ///
    /// An empty URL maps to the catch-all tracker.
    #[must_use]
    pub fn match_url(&self, url: &str) -> String {
        if url.is_empty() {
            return self.catch_all_id();
        }

        let cache_key = cache_key(url);

        {
            let inner = self.inner.read().expect("matcher lock is not poisoned");
            if let Some(tracker_id) = inner.url_cache.get(&cache_key) {
                self.cache_hits.fetch_add(1, Relaxed);
                return tracker_id.clone();
            }
        }

        self.cache_misses.fetch_add(1, Relaxed);

        let mut inner = self.inner.write().expect("matcher lock is not poisoned");
        let tracker_id = inner.find_match(url);
        if inner.url_cache.len() >= URL_CACHE_CAPACITY {
            inner.url_cache.clear();
        }
        inner.url_cache.insert(cache_key, tracker_id.clone());
        tracker_id
    }

    /// Matches many URLs at once, reusing the cache.
    #[must_use]
    pub fn bulk_match(&self, urls: &[String]) -> HashMap<String, String> {
        urls.iter()
            .map(|url| (url.clone(), self.match_url(url)))
            .collect()
    }

    /// Replaces the configured trackers, recompiling the patterns and
    /// invalidating the URL cache.
    ///
    /// # Errors
    ///
    /// Returns an [`Error`] when the new list is invalid; the previous
    /// patterns stay active in that case.
    pub fn reload(&self, trackers: Vec<TrackerSettings>) -> Result<(), Error> {
        let compiled = Inner::compile(trackers)?;

        let mut inner = self.inner.write().expect("matcher lock is not poisoned");
        *inner = compiled;

        tracing::info!(trackers = inner.trackers.len(), "reloaded tracker patterns");
        Ok(())
    }

    /// Tests a URL against every configured pattern, for operators
    /// debugging their configuration.
    #[must_use]
    pub fn test(&self, url: &str, detailed: bool) -> MatchTest {
        let matched_tracker = self.match_url(url);

        let trace = detailed.then(|| {
            let inner = self.inner.read().expect("matcher lock is not poisoned");
            inner
                .patterns
                .iter()
                .map(|pattern| PatternTrace {
                    tracker_id: pattern.tracker_id.clone(),
                    pattern: pattern.raw.clone(),
                    normalized: pattern.normalized.clone(),
                    matches: pattern.regex.is_match(url),
                })
                .collect()
        });

        MatchTest {
            url: url.to_string(),
            matched_tracker,
            trace,
        }
    }

    /// The settings for a tracker id, if configured.
    #[must_use]
    pub fn tracker(&self, tracker_id: &str) -> Option<TrackerSettings> {
        let inner = self.inner.read().expect("matcher lock is not poisoned");
        inner.trackers.iter().find(|tracker| tracker.id == tracker_id).cloned()
    }

    /// Every configured tracker, in declared order.
    #[must_use]
    pub fn all_trackers(&self) -> Vec<TrackerSettings> {
        self.inner.read().expect("matcher lock is not poisoned").trackers.clone()
    }

    /// The id of the trailing catch-all tracker.
    #[must_use]
    pub fn catch_all_id(&self) -> String {
        self.inner.read().expect("matcher lock is not poisoned").catch_all_id.clone()
    }

    #[must_use]
    pub fn stats(&self) -> MatcherStats {
        MatcherStats {
            cache_size: self.inner.read().expect("matcher lock is not poisoned").url_cache.len(),
            cache_hits: self.cache_hits.load(Relaxed),
            cache_misses: self.cache_misses.load(Relaxed),
        }
    }
}

impl Inner {
    fn compile(trackers: Vec<TrackerSettings>) -> Result<Self, Error> {
        let catch_all_id = trackers
            .last()
            .filter(|tracker| tracker.is_catch_all())
            .map(|tracker| tracker.id.clone())
            .ok_or(Error::MissingCatchAll)?;

        let mut patterns = Vec::with_capacity(trackers.len());
        for tracker in &trackers {
            let normalized = normalize_pattern(&tracker.pattern);
            let regex = RegexBuilder::new(&normalized)
                .case_insensitive(true)
                .build()
                .map_err(|source| Error::InvalidPattern {
                    tracker_id: tracker.id.clone(),
                    normalized: normalized.clone(),
                    source,
                })?;

            tracing::debug!(tracker_id = %tracker.id, pattern = %tracker.pattern, %normalized, "compiled tracker pattern");

            patterns.push(CompiledPattern {
                tracker_id: tracker.id.clone(),
                raw: tracker.pattern.clone(),
                normalized,
                regex,
            });
        }

        Ok(Self {
            trackers,
            patterns,
            catch_all_id,
            url_cache: HashMap::new(),
        })
    }

    fn find_match(&self, url: &str) -> String {
        for pattern in &self.patterns {
            if pattern.regex.is_match(url) {
                return pattern.tracker_id.clone();
            }
        }

        // The trailing catch-all makes this unreachable in practice.
        self.catch_all_id.clone()
    }
}

/// The cache key is host + path, lowercased, so per-peer query strings do
/// not defeat the cache.
#[must_use]
fn cache_key(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(parsed) => format!(
            "{}{}",
            parsed.host_str().unwrap_or_default().to_lowercase(),
            parsed.path().to_lowercase()
        ),
        Err(_) => url.to_lowercase(),
    }
}

/// Makes simple domain patterns more forgiving.
///
/// Anchored patterns (`^` or `$`) are kept as-is. Otherwise the pattern is
/// widened to `.*<pattern>.*`; a single leading or trailing `.` is treated
/// as an abbreviation of `.*`. This helps operators who write
/// `.example\.com.` when they mean `.*example\.com.*`.
#[must_use]
fn normalize_pattern(pattern: &str) -> String {
    let trimmed = pattern.trim();
    if trimmed.is_empty() || trimmed.starts_with('^') || trimmed.ends_with('$') {
        return trimmed.to_string();
    }

    let mut normalized = if trimmed.starts_with(".*") {
        trimmed.to_string()
    } else if let Some(rest) = trimmed.strip_prefix('.') {
        format!(".*{rest}")
    } else {
        format!(".*{trimmed}")
    };

    if normalized.ends_with(".*") {
        // Already wide open on the right.
    } else if normalized.ends_with('.') {
        normalized.pop();
        normalized.push_str(".*");
    } else {
        normalized.push_str(".*");
    }

    normalized
}

//! Per-torrent activity scoring.
//!
//! Scores drive the weighted distribution and the selection of the
//! managed set. Leech demand dominates; current upload speed breaks
//! ties between equally demanded torrents.
use serde::Serialize;

const LEECH_SATURATION: f64 = 20.0;
const SPEED_SATURATION: f64 = 1_048_576.0;

/// A score in [0, 1]:
/// `0.6 · min(1, leechs/20) + 0.4 · min(1, up_speed/1 MiB)`.
#[must_use]
pub fn activity_score(num_leechs: u32, up_speed: u64) -> f64 {
    let leech_score = (f64::from(num_leechs) / LEECH_SATURATION).min(1.0);
    #[allow(clippy::cast_precision_loss)]
    let speed_score = (up_speed as f64 / SPEED_SATURATION).min(1.0);

    0.6 * leech_score + 0.4 * speed_score
}

/// Telemetry bucket for a score.
#[derive(Serialize, PartialEq, Eq, Debug, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum ScoreBucket {
    High,
    Medium,
    Low,
    Ignored,
}

impl ScoreBucket {
    #[must_use]
    pub fn from_score(score: f64) -> Self {
        if score >= 0.8 {
            Self::High
        } else if score >= 0.5 {
            Self::Medium
        } else if score >= 0.2 {
            Self::Low
        } else {
            Self::Ignored
        }
    }
}

/// How the scored torrents spread across buckets, for the stats
/// endpoint.
#[derive(Serialize, PartialEq, Eq, Debug, Clone, Copy, Default)]
pub struct ScoreDistribution {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    pub ignored: usize,
}

impl ScoreDistribution {
    pub fn record(&mut self, score: f64) {
        match ScoreBucket::from_score(score) {
            ScoreBucket::High => self.high += 1,
            ScoreBucket::Medium => self.medium += 1,
            ScoreBucket::Low => self.low += 1,
            ScoreBucket::Ignored => self.ignored += 1,
        }
    }
}

#[cfg(test)]
mod tests {

    use crate::allocation::scoring::{activity_score, ScoreBucket, ScoreDistribution};

    #[test]
    fn it_should_weigh_leechers_over_upload_speed() {
        // 40 leechers saturate the leech term; 800 KiB/s is 0.78 of the
        // speed saturation point.
        let score = activity_score(40, 800 * 1024);

        assert!((score - 0.9125).abs() < 1e-9);
    }

    #[test]
    fn it_should_score_a_lightly_leeched_slow_torrent_low() {
        let score = activity_score(5, 200 * 1024);

        assert!((score - 0.228_125).abs() < 1e-9);
    }

    #[test]
    fn it_should_cap_the_score_at_one() {
        assert!((activity_score(1000, u64::MAX) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn it_should_score_an_idle_torrent_zero() {
        assert!(activity_score(0, 0).abs() < 1e-9);
    }

    #[test]
    fn it_should_bucket_scores_at_the_documented_boundaries() {
        assert_eq!(ScoreBucket::from_score(0.8), ScoreBucket::High);
        assert_eq!(ScoreBucket::from_score(0.5), ScoreBucket::Medium);
        assert_eq!(ScoreBucket::from_score(0.2), ScoreBucket::Low);
        assert_eq!(ScoreBucket::from_score(0.19), ScoreBucket::Ignored);
    }

    #[test]
    fn it_should_accumulate_a_distribution() {
        let mut distribution = ScoreDistribution::default();

        distribution.record(0.9);
        distribution.record(0.6);
        distribution.record(0.3);
        distribution.record(0.0);

        assert_eq!(distribution.high, 1);
        assert_eq!(distribution.medium, 1);
        assert_eq!(distribution.low, 1);
        assert_eq!(distribution.ignored, 1);
    }
}

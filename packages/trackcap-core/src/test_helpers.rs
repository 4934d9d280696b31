//! Some generic test helpers functions.

#[cfg(test)]
pub(crate) mod tests {
    use std::str::FromStr;

    use rand::Rng;
    use trackcap_configuration::TrackerSettings;

    use crate::torrent::{TorrentHash, TorrentInfo, UNLIMITED};

    /// Generates a random `TorrentHash`.
    #[must_use]
    pub fn random_hash() -> TorrentHash {
        let mut rng = rand::rng();
        let mut random_bytes = [0u8; 20];
        rng.fill(&mut random_bytes);

        TorrentHash::from_bytes(random_bytes)
    }

    /// # Panics
    ///
    /// Will panic if the string representation of the hash is not valid.
    #[must_use]
    pub fn sample_hash() -> TorrentHash {
        "3b245504cf5f11bbdbe1201cea6a6bf45aee1bc0"
            .parse::<TorrentHash>()
            .expect("String should be a valid torrent hash")
    }

    /// # Panics
    ///
    /// Will panic if the string representation of the hash is not valid.
    #[must_use]
    pub fn sample_hash_two() -> TorrentHash {
        "99c82bb73505a3c0b453f9fa0e881d6e5a32a0c1"
            .parse::<TorrentHash>()
            .expect("String should be a valid torrent hash")
    }

    /// Sample torrent whose exact state is not relevant for the tests.
    #[must_use]
    pub fn sample_torrent() -> TorrentInfo {
        sample_torrent_with_hash("3b245504cf5f11bbdbe1201cea6a6bf45aee1bc0")
    }

    /// # Panics
    ///
    /// Will panic if `hex` is not a valid torrent hash.
    #[must_use]
    pub fn sample_torrent_with_hash(hex: &str) -> TorrentInfo {
        TorrentInfo {
            hash: TorrentHash::from_str(hex).expect("String should be a valid torrent hash"),
            name: String::from("ubuntu-24.04-desktop-amd64.iso"),
            tracker_url: String::from("http://tracker.private.example.org/announce"),
            up_speed: 512_000,
            upload_limit: UNLIMITED,
            num_seeds: 4,
            num_leechs: 12,
            size: 4_294_967_296,
            progress: 1.0,
            state: String::from("uploading"),
            added_on: 1_669_397_478,
        }
    }

    /// A torrent pinned to a tracker URL and upload speed, for allocation
    /// tests.
    ///
    /// # Panics
    ///
    /// Will panic if `hex` is not a valid torrent hash.
    #[must_use]
    pub fn sample_torrent_on_tracker(hex: &str, tracker_url: &str, up_speed: u64) -> TorrentInfo {
        let mut torrent = sample_torrent_with_hash(hex);
        torrent.tracker_url = tracker_url.to_string();
        torrent.up_speed = up_speed;
        torrent
    }

    /// Two trackers: a capped private one and the unlimited catch-all.
    #[must_use]
    pub fn sample_trackers() -> Vec<TrackerSettings> {
        vec![
            TrackerSettings {
                id: String::from("priv"),
                name: String::from("Private tracker"),
                pattern: String::from(r".*private\.example\.org.*"),
                max_upload_speed: 4 * 1024 * 1024,
                priority: 5,
            },
            TrackerSettings {
                id: String::from("default"),
                name: String::from("Everything else"),
                pattern: String::from(".*"),
                max_upload_speed: -1,
                priority: 1,
            },
        ]
    }
}

//! Equal distribution: every managed torrent on a tracker gets the same
//! share of the cap.
use std::collections::HashMap;

use super::{TrackerGroup, FLOOR_BYTES};
use crate::torrent::{TorrentHash, UNLIMITED};

/// Splits the group's cap evenly.
///
/// A single torrent receives the full cap. When the even share falls
/// below the floor, every torrent still gets the floor and the cap is
/// knowingly overshot.
#[must_use]
pub(crate) fn allocate(group: &TrackerGroup) -> HashMap<TorrentHash, i64> {
    if group.torrents.is_empty() {
        return HashMap::new();
    }

    if group.is_unlimited() {
        return group
            .torrents
            .iter()
            .map(|torrent| (torrent.hash, UNLIMITED))
            .collect();
    }

    let count = i64::try_from(group.torrents.len()).expect("torrent count fits in an i64");
    let share = if count == 1 {
        group.cap
    } else {
        (group.cap / count).max(FLOOR_BYTES)
    };

    group.torrents.iter().map(|torrent| (torrent.hash, share)).collect()
}

#[cfg(test)]
mod tests {

    mod the_equal_strategy {

        use crate::allocation::strategy::equal::allocate;
        use crate::allocation::strategy::tests::{group, sample};
        use crate::allocation::strategy::FLOOR_BYTES;
        use crate::torrent::UNLIMITED;

        #[test]
        fn it_should_split_the_cap_evenly() {
            // 4 MiB/s across four torrents: 1 MiB/s each.
            let group = group(
                "priv",
                4 * 1024 * 1024,
                1,
                vec![
                    sample(1, 500 * 1024, 0),
                    sample(2, 500 * 1024, 0),
                    sample(3, 500 * 1024, 0),
                    sample(4, 500 * 1024, 0),
                ],
            );

            let limits = allocate(&group);

            assert_eq!(limits.len(), 4);
            for limit in limits.values() {
                assert_eq!(*limit, 1_048_576);
            }
        }

        #[test]
        fn it_should_give_a_single_torrent_the_full_cap() {
            let group = group("priv", 4 * 1024 * 1024, 1, vec![sample(1, 0, 0)]);

            let limits = allocate(&group);

            assert_eq!(limits.values().next(), Some(&4_194_304));
        }

        #[test]
        fn it_should_set_every_torrent_unlimited_on_an_unlimited_tracker() {
            let group = group("default", -1, 1, vec![sample(1, 0, 0), sample(2, 0, 0)]);

            let limits = allocate(&group);

            assert!(limits.values().all(|limit| *limit == UNLIMITED));
        }

        #[test]
        fn it_should_not_assign_below_the_floor() {
            // 30 KiB/s across four torrents would be 7.5 KiB/s each; the
            // floor wins and the cap is overshot.
            let group = group(
                "priv",
                30 * 1024,
                1,
                vec![
                    sample(1, 0, 0),
                    sample(2, 0, 0),
                    sample(3, 0, 0),
                    sample(4, 0, 0),
                ],
            );

            let limits = allocate(&group);

            assert!(limits.values().all(|limit| *limit == FLOOR_BYTES));
        }

        #[test]
        fn it_should_return_nothing_for_an_empty_group() {
            let group = group("priv", 4 * 1024 * 1024, 1, vec![]);

            assert!(allocate(&group).is_empty());
        }

        #[test]
        fn it_should_respect_the_cap_within_the_floor_tolerance() {
            let cap = 4 * 1024 * 1024;
            let torrents: Vec<_> = (1..=7).map(|seed| sample(seed, 100 * 1024, 0)).collect();
            let count = torrents.len() as i64;
            let group = group("priv", cap, 1, torrents);

            let limits = allocate(&group);

            let total: i64 = limits.values().sum();
            assert!(total <= cap + FLOOR_BYTES * count);
        }
    }
}

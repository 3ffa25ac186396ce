//! Hash-range arithmetic: splitting, merging, routing and the join tie-break.
//!
//! Everything here is pure. The node calls into these functions and acts on
//! the result; nothing in this module touches the transport.

use xxhash_rust::xxh3::xxh3_64;

use crate::types::{is_unset, HashRange, Key, Link, PeerAddr, HASH_MAX};
use crate::wire::JoinRequest;

/// Map a key onto the 8-bit ring.
///
/// Deterministic across nodes and runs; collisions are expected and harmless
/// since entries are matched by full key.
pub fn hash_key(key: &Key) -> u8 {
    xxh3_64(key) as u8
}

/// Split a range for a joining node.
///
/// Returns `(kept, granted)`. The lower half (rounded up for odd lengths) is
/// kept. A single-value range cannot be split and yields `None`.
pub fn split(range: HashRange) -> Option<(HashRange, HashRange)> {
    if range.span() == 0 {
        return None;
    }
    let mid = range.min() + range.span() / 2;
    let kept = HashRange::new(range.min(), mid)?;
    let granted = HashRange::new(mid + 1, range.max())?;
    Some((kept, granted))
}

/// Merge a neighbour's range into ours. The two must be adjacent.
pub fn absorb(own: HashRange, other: HashRange) -> Option<HashRange> {
    if own.max().checked_add(1) == Some(other.min()) {
        HashRange::new(own.min(), other.max())
    } else if other.max().checked_add(1) == Some(own.min()) {
        HashRange::new(other.min(), own.max())
    } else {
        None
    }
}

/// Where a keyed request goes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Route {
    Local,
    Forward,
}

/// Routing decision for `key` at a node owning `range`.
pub fn route(range: HashRange, key: &Key) -> Route {
    if range.contains(hash_key(key)) {
        Route::Local
    } else {
        Route::Forward
    }
}

/// The neighbour that takes over a leaving node's range.
///
/// Ranges ascend along successors, so a leaving node hands up to its
/// successor. The node ending at the top of the hash space has the ring's
/// bottom as its successor and hands down to its predecessor instead.
pub fn absorber(range: HashRange) -> Link {
    if range.max() == HASH_MAX {
        Link::Predecessor
    } else {
        Link::Successor
    }
}

/// Whether the node receiving a Join is the one that must split.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinVerdict {
    /// The Join came back naming us with our own span: we split.
    Maximum,
    /// Keep circulating.
    NotMaximum,
}

/// Classify a received Join against this node's identity and range.
///
/// Uses the record as received, before [`challenge`] touches it.
pub fn classify(join: &JoinRequest, own_addr: PeerAddr, own: HashRange) -> JoinVerdict {
    if join.max_addr == own_addr && join.max_span == own.span() {
        JoinVerdict::Maximum
    } else {
        JoinVerdict::NotMaximum
    }
}

/// Put this node forward as the challenger if it beats the carried one.
///
/// An unclaimed Join is taken by the first node to see it. Otherwise only a
/// strictly larger span replaces the challenger, so the first-seen of several
/// equal maxima keeps the claim.
pub fn challenge(join: JoinRequest, own_addr: PeerAddr, own: HashRange) -> JoinRequest {
    if is_unset(&join.max_addr) || own.span() > join.max_span {
        JoinRequest {
            max_span: own.span(),
            max_addr: own_addr,
            ..join
        }
    } else {
        join
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddrV4};

    use super::*;
    use crate::types::UNSET_ADDR;

    fn r(min: u8, max: u8) -> HashRange {
        HashRange::new(min, max).unwrap()
    }

    fn node(n: u8) -> PeerAddr {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, n), 5000)
    }

    fn key_hashing_to(pred: impl Fn(u8) -> bool) -> Key {
        (0u32..)
            .map(|i| {
                let mut k = [b'0'; 12];
                k[..4].copy_from_slice(&i.to_le_bytes());
                k
            })
            .find(|k| pred(hash_key(k)))
            .unwrap()
    }

    #[test]
    fn test_split_arithmetic() {
        assert_eq!(split(r(0, 99)), Some((r(0, 49), r(50, 99))));
        assert_eq!(split(r(0, 255)), Some((r(0, 127), r(128, 255))));
        assert_eq!(split(r(128, 255)), Some((r(128, 191), r(192, 255))));
        assert_eq!(split(r(7, 8)), Some((r(7, 7), r(8, 8))));
        assert_eq!(split(r(7, 9)), Some((r(7, 8), r(9, 9))));
    }

    #[test]
    fn test_split_single_value() {
        assert_eq!(split(r(42, 42)), None);
    }

    #[test]
    fn test_split_halves_cover_original() {
        for min in (0..=255u8).step_by(17) {
            for max in (min..=255u8).step_by(13) {
                let Some((kept, granted)) = split(r(min, max)) else {
                    assert_eq!(min, max);
                    continue;
                };
                assert_eq!(kept.min(), min);
                assert_eq!(granted.max(), max);
                assert_eq!(kept.max() + 1, granted.min());
                assert!(kept.len() >= granted.len());
            }
        }
    }

    #[test]
    fn test_absorb_adjacent() {
        assert_eq!(absorb(r(0, 49), r(50, 99)), Some(r(0, 99)));
        assert_eq!(absorb(r(50, 99), r(0, 49)), Some(r(0, 99)));
        assert_eq!(absorb(r(0, 49), r(51, 99)), None);
        assert_eq!(absorb(r(200, 255), r(0, 10)), None);
    }

    #[test]
    fn test_absorb_reverses_split() {
        let whole = r(30, 200);
        let (kept, granted) = split(whole).unwrap();
        assert_eq!(absorb(kept, granted), Some(whole));
    }

    #[test]
    fn test_route_boundaries() {
        let range = r(100, 150);
        let at_min = key_hashing_to(|h| h == 100);
        let at_max = key_hashing_to(|h| h == 150);
        let below = key_hashing_to(|h| h == 99);
        let above = key_hashing_to(|h| h == 151);
        assert_eq!(route(range, &at_min), Route::Local);
        assert_eq!(route(range, &at_max), Route::Local);
        assert_eq!(route(range, &below), Route::Forward);
        assert_eq!(route(range, &above), Route::Forward);
    }

    #[test]
    fn test_full_range_serves_everything() {
        let key = key_hashing_to(|_| true);
        assert_eq!(route(HashRange::FULL, &key), Route::Local);
    }

    #[test]
    fn test_hash_is_deterministic() {
        let k = *b"199001011234";
        assert_eq!(hash_key(&k), hash_key(&k));
    }

    #[test]
    fn test_absorber_side() {
        assert_eq!(absorber(r(0, 63)), Link::Successor);
        assert_eq!(absorber(r(64, 127)), Link::Successor);
        assert_eq!(absorber(r(128, 254)), Link::Successor);
        // Only the top of the ring wraps back down.
        assert_eq!(absorber(r(192, 255)), Link::Predecessor);
        assert_eq!(absorber(r(255, 255)), Link::Predecessor);
    }

    #[test]
    fn test_unclaimed_join_is_taken() {
        let join = JoinRequest {
            prospect: node(99),
            max_span: 0,
            max_addr: UNSET_ADDR,
        };
        assert_eq!(classify(&join, node(1), r(0, 0)), JoinVerdict::NotMaximum);
        let join = challenge(join, node(1), r(0, 0));
        assert_eq!(join.max_addr, node(1));
        assert_eq!(join.max_span, 0);
    }

    #[test]
    fn test_challenge_needs_strictly_larger_span() {
        let join = JoinRequest {
            prospect: node(99),
            max_span: 30,
            max_addr: node(2),
        };
        assert_eq!(challenge(join, node(3), r(0, 30)), join);
        let taken = challenge(join, node(3), r(0, 31));
        assert_eq!(taken.max_addr, node(3));
        assert_eq!(taken.max_span, 31);
    }

    #[test]
    fn test_classify_requires_matching_span() {
        let join = JoinRequest {
            prospect: node(99),
            max_span: 30,
            max_addr: node(2),
        };
        assert_eq!(classify(&join, node(2), r(0, 30)), JoinVerdict::Maximum);
        assert_eq!(classify(&join, node(2), r(0, 31)), JoinVerdict::NotMaximum);
        assert_eq!(classify(&join, node(3), r(0, 30)), JoinVerdict::NotMaximum);
    }

    /// Drive a Join around `ring` (addr, range) starting at `entry` until some
    /// node classifies itself as the maximum. Returns that node's index.
    fn circulate(ring: &[(PeerAddr, HashRange)], entry: usize) -> usize {
        let mut join = JoinRequest {
            prospect: node(99),
            max_span: 0,
            max_addr: UNSET_ADDR,
        };
        let mut at = entry;
        for _ in 0..ring.len() * 3 {
            let (addr, range) = ring[at];
            if classify(&join, addr, range) == JoinVerdict::Maximum {
                return at;
            }
            join = challenge(join, addr, range);
            at = (at + 1) % ring.len();
        }
        panic!("join never settled");
    }

    #[test]
    fn test_tie_break_first_maximum_wins() {
        // Spans 10, 30, 30.
        let ring = [(node(1), r(0, 10)), (node(2), r(11, 41)), (node(3), r(42, 72))];
        assert_eq!(circulate(&ring, 0), 1);
        assert_eq!(circulate(&ring, 1), 1);
        // Entering at the second 30 makes it the first seen.
        assert_eq!(circulate(&ring, 2), 2);
    }

    #[test]
    fn test_tie_break_unique_maximum() {
        let ring = [
            (node(1), r(0, 63)),
            (node(2), r(64, 95)),
            (node(3), r(96, 127)),
            (node(4), r(128, 255)),
        ];
        for entry in 0..ring.len() {
            assert_eq!(circulate(&ring, entry), 3);
        }
    }
}

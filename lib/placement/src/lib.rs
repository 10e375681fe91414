//! Deterministic placement of keys onto peers via rendezvous (highest random weight) hashing.
//!
//! Unlike consistent hashing with a ring, rendezvous hashing needs no virtual nodes and keeps
//! the expected churn on peer add/remove proportional to `1/n`.

use xxhash_rust::xxh64::xxh64;

/// A stable `host:port` identifying one process in the deployment.
pub type Peer = String;

/// Ranks `peers` for `key` and returns the first `k` of them, most-preferred first.
///
/// `k` is clamped to `peers.len()`. Score for a peer is `xxhash64(key || peer)`; peers are
/// ordered ascending by score, ties (astronomically unlikely) broken by peer name so the order
/// is reproducible across processes regardless of input order.
///
/// Returns an empty vector only when `peers` is empty; callers are expected to treat a peer list
/// of zero peers as a fatal configuration error rather than something this function tolerates.
pub fn rendezvous_hash(key: &str, peers: &[Peer], k: usize) -> Vec<Peer> {
    let k = k.min(peers.len());
    if k == 0 {
        return Vec::new();
    }

    let mut scored: Vec<(u64, &Peer)> = peers.iter().map(|peer| (score(key, peer), peer)).collect();
    scored.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1)));
    scored.into_iter().take(k).map(|(_, peer)| peer.clone()).collect()
}

/// The single most-preferred peer for `key`, i.e. `rendezvous_hash(key, peers, 1)[0]`.
///
/// # Panics
///
/// Panics if `peers` is empty. An empty peer list is a startup misconfiguration, never a
/// condition a running node should try to route around.
pub fn owner(key: &str, peers: &[Peer]) -> Peer {
    rendezvous_hash(key, peers, 1)
        .into_iter()
        .next()
        .expect("rendezvous_hash with non-empty peers always returns at least one entry")
}

fn score(key: &str, peer: &str) -> u64 {
    let mut buf = Vec::with_capacity(key.len() + peer.len());
    buf.extend_from_slice(key.as_bytes());
    buf.extend_from_slice(peer.as_bytes());
    xxh64(&buf, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use itertools::Itertools;
    use rand::{distributions::Alphanumeric, Rng};

    fn random_key(rng: &mut impl Rng) -> String {
        rng.sample_iter(&Alphanumeric)
            .take(12)
            .map(char::from)
            .collect()
    }

    #[test]
    fn empty_peers_returns_empty() {
        assert!(rendezvous_hash("k", &[], 3).is_empty());
    }

    #[test]
    fn k_is_clamped_to_peer_count() {
        let peers = vec!["a:1".to_string(), "b:1".to_string()];
        assert_eq!(rendezvous_hash("k", &peers, 10).len(), 2);
    }

    #[test]
    fn deterministic_and_order_independent() {
        let peers = vec![
            "a:1".to_string(),
            "b:1".to_string(),
            "c:1".to_string(),
            "d:1".to_string(),
        ];
        let expected = rendezvous_hash("some-user-id", &peers, 2);

        for perm in peers.iter().cloned().permutations(peers.len()) {
            assert_eq!(rendezvous_hash("some-user-id", &perm, 2), expected);
        }
    }

    #[test]
    fn balance_is_roughly_uniform() {
        let peers: Vec<Peer> = (0..8).map(|i| format!("peer-{i}:6330")).collect();
        let mut rng = rand::thread_rng();
        let n = 20_000usize;
        let mut counts = vec![0usize; peers.len()];

        for _ in 0..n {
            let key = random_key(&mut rng);
            let owner = owner(&key, &peers);
            let idx = peers.iter().position(|p| p == &owner).unwrap();
            counts[idx] += 1;
        }

        let expected = n as f64 / peers.len() as f64;
        let tolerance = 6.0 * expected.sqrt(); // lenient: ~6 standard deviations of a binomial
        for count in counts {
            let diff = (count as f64 - expected).abs();
            assert!(
                diff < tolerance,
                "peer got {count} keys, expected {expected} +/- {tolerance}"
            );
        }
    }

    #[test]
    fn single_peer_always_wins() {
        let peers = vec!["only:1".to_string()];
        for _ in 0..100 {
            assert_eq!(owner("any-key", &peers), "only:1");
        }
    }
}

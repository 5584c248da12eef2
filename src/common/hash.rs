//! Replica selection for minilock
//!
//! HRW (Highest Random Weight) hashing picks the nodes that hold a resource's lock when
//! the cluster is configured with a replica set smaller than the full node list. Every
//! client computes the same ordering for the same resource and node list.

/// Indices of the `n` highest-weight nodes for `key`, in weight order.
/// Equal weights fall back to registry order.
pub fn select_replica_indices(key: &str, nodes: &[String], n: usize) -> Vec<usize> {
    let mut weights: Vec<(usize, u64)> = nodes
        .iter()
        .enumerate()
        .map(|(idx, node)| (idx, hrw_weight(key, node)))
        .collect();

    weights.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

    weights.into_iter().take(n).map(|(idx, _)| idx).collect()
}

fn hrw_weight(key: &str, node: &str) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(key.as_bytes());
    hasher.update(&[0]);
    hasher.update(node.as_bytes());
    let mut weight = [0u8; 8];
    weight.copy_from_slice(&hasher.finalize().as_bytes()[0..8]);
    u64::from_le_bytes(weight)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes() -> Vec<String> {
        (1..=4).map(|i| format!("http://node{}:9000/minilock/lock/data", i)).collect()
    }

    #[test]
    fn test_selection_is_deterministic() {
        let first = select_replica_indices("bucket/object", &nodes(), 3);
        let second = select_replica_indices("bucket/object", &nodes(), 3);
        assert_eq!(first, second);
        assert_eq!(first.len(), 3);

        let mut distinct = first.clone();
        distinct.sort();
        distinct.dedup();
        assert_eq!(distinct.len(), 3);
    }

    #[test]
    fn test_prefix_of_larger_selection() {
        let three = select_replica_indices("bucket/object", &nodes(), 3);
        let all = select_replica_indices("bucket/object", &nodes(), 4);
        assert_eq!(&all[..3], &three[..]);
    }

    #[test]
    fn test_resources_spread_over_nodes() {
        let mut firsts: Vec<usize> = (0..64)
            .map(|i| select_replica_indices(&format!("bucket/object-{}", i), &nodes(), 1)[0])
            .collect();
        firsts.sort();
        firsts.dedup();
        assert!(firsts.len() > 1);
    }

    #[test]
    fn test_select_more_than_available() {
        let indices = select_replica_indices("bucket/object", &nodes(), 10);
        assert_eq!(indices.len(), 4);
    }
}

//! Deterministic ring placement of chunk replicas.

/// Chooses the replica set for chunk `index` over `active_nodes`, treated as
/// a fixed-order ring: the primary is `active_nodes[index % len]`, followed by
/// the next nodes walking the ring, up to `replication_factor` distinct nodes
/// (or all of them if there are fewer). Returns an empty set if there are no
/// active nodes.
///
/// `active_nodes` is expected to contain no duplicates, which holds for any
/// registry snapshot.
pub fn choose_replicas<T: Clone>(
    index: usize,
    active_nodes: &[T],
    replication_factor: usize,
) -> Vec<T> {
    let population = active_nodes.len();
    if population == 0 {
        return vec![];
    }

    let primary = index % population;
    (0..replication_factor.min(population))
        .map(|step| active_nodes[(primary + step) % population].clone())
        .collect()
}

//! Assigns pending placements to nozzles, one batch per cycle.
//!
//! Only placements of the lowest remaining part height are eligible for a
//! batch. Placing short parts first keeps a tall part from being set down
//! while a shorter one in its path is still waiting.

/// A pending placement offered to the planner.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate<K> {
    pub key: K,
    pub height: f64,
}

/// The nozzle-to-placement assignment for one Plan cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedBatch<N, K> {
    height: f64,
    assignments: Vec<(N, K)>,
}

impl<N, K> PlannedBatch<N, K> {
    /// Shared part height of every placement in the batch.
    pub fn height(&self) -> f64 {
        self.height
    }

    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    /// Assignments in nozzle declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &(N, K)> {
        self.assignments.iter()
    }
}

impl<N, K> IntoIterator for PlannedBatch<N, K> {
    type Item = (N, K);
    type IntoIter = std::vec::IntoIter<(N, K)>;

    fn into_iter(self) -> Self::IntoIter {
        self.assignments.into_iter()
    }
}

/// Plan the next batch.
///
/// Returns `None` when there is nothing left to place. Otherwise the batch
/// holds at most one placement per nozzle, all of the minimum pending height,
/// in nozzle order; ties keep their input order. Placements that do not fit
/// stay pending for a later cycle.
pub fn plan<N, K>(pending: &[Candidate<K>], nozzles: &[N]) -> Option<PlannedBatch<N, K>>
where
    N: Clone,
    K: Clone,
{
    let mut sorted: Vec<&Candidate<K>> = pending.iter().collect();
    sorted.sort_by(|a, b| a.height.total_cmp(&b.height));

    let height = sorted.first()?.height;
    let assignments = nozzles
        .iter()
        .cloned()
        .zip(
            sorted
                .into_iter()
                .take_while(|c| c.height == height)
                .map(|c| c.key.clone()),
        )
        .collect();

    Some(PlannedBatch {
        height,
        assignments,
    })
}

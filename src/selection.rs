//! Partitions of a pulsar's observations into named subsets.
//!
//! White-noise parameters are usually scoped to a receiver/backend system.
//! A [`Selection`] fixes that partition once so every signal reusing it sees
//! the same groups. Groups are disjoint and together cover all observations.

use crate::pulsar::{ModelError, Pulsar};

/// One named subset of observation indices.
#[derive(Debug, Clone)]
pub struct SelectionGroup {
    /// Subset label; empty for the trivial selection. Used as the middle
    /// segment of parameter names (`{pulsar}_{subset}_{quantity}`).
    pub name: String,
    pub indices: Vec<usize>,
}

/// A disjoint, covering partition of a pulsar's observation indices.
#[derive(Debug, Clone)]
pub struct Selection {
    groups: Vec<SelectionGroup>,
}

impl Selection {
    /// The trivial selection: a single anonymous group holding every
    /// observation. Parameters scoped by it are named `{pulsar}_{quantity}`.
    pub fn all(psr: &Pulsar) -> Self {
        Selection {
            groups: vec![SelectionGroup {
                name: String::new(),
                indices: (0..psr.len()).collect(),
            }],
        }
    }

    /// One group per backend label, ordered by first appearance.
    pub fn by_backend(psr: &Pulsar) -> Self {
        let mut groups: Vec<SelectionGroup> = Vec::new();
        for (i, backend) in psr.backends().iter().enumerate() {
            match groups.iter_mut().find(|g| &g.name == backend) {
                Some(g) => g.indices.push(i),
                None => groups.push(SelectionGroup {
                    name: backend.clone(),
                    indices: vec![i],
                }),
            }
        }
        Selection { groups }
    }

    /// A caller-supplied partition, validated to be disjoint and covering.
    pub fn custom(psr: &Pulsar, groups: Vec<SelectionGroup>) -> Result<Self, ModelError> {
        let n = psr.len();
        let mut seen = vec![false; n];
        for g in &groups {
            for &i in &g.indices {
                if i >= n {
                    return Err(ModelError::InvalidPartition {
                        pulsar: psr.name().to_string(),
                        reason: format!("index {} out of range for {} observations", i, n),
                    });
                }
                if seen[i] {
                    return Err(ModelError::InvalidPartition {
                        pulsar: psr.name().to_string(),
                        reason: format!("index {} appears in more than one group", i),
                    });
                }
                seen[i] = true;
            }
        }
        if let Some(missing) = seen.iter().position(|&s| !s) {
            return Err(ModelError::InvalidPartition {
                pulsar: psr.name().to_string(),
                reason: format!("index {} is not covered by any group", missing),
            });
        }
        Ok(Selection { groups })
    }

    pub fn groups(&self) -> &[SelectionGroup] {
        &self.groups
    }

    /// Split each group into epochs: observations sorted by arrival time,
    /// broken wherever the gap to the previous TOA exceeds `dt` seconds.
    /// Epochs with fewer than `nmin` observations are dropped. Used by the
    /// correlated-jitter (ECORR) signal, which only correlates observations
    /// taken together.
    pub(crate) fn epoch_groups(&self, psr: &Pulsar, dt: f64, nmin: usize) -> Vec<Vec<Vec<usize>>> {
        let toas = psr.toas();
        self.groups
            .iter()
            .map(|g| {
                let mut order = g.indices.clone();
                order.sort_by(|&a, &b| {
                    toas[a]
                        .partial_cmp(&toas[b])
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                let mut epochs: Vec<Vec<usize>> = Vec::new();
                for idx in order {
                    match epochs.last_mut() {
                        Some(epoch)
                            if epoch
                                .last()
                                .is_some_and(|&prev| toas[idx] - toas[prev] <= dt) =>
                        {
                            epoch.push(idx)
                        }
                        _ => epochs.push(vec![idx]),
                    }
                }
                epochs.retain(|e| e.len() >= nmin);
                epochs
            })
            .collect()
    }
}

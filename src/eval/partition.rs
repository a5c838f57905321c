//! Deterministic assignment of problems to shards.
//!
//! A strategy maps positions in the canonical problem order to shard ids.
//! It must be a pure function of the problem list and the shard count so
//! every worker computes the same assignment independently.

use serde::{Deserialize, Serialize};

use crate::problem::Problem;

/// Assigns each problem position to a shard.
pub trait PartitionStrategy: Send + Sync {
    fn kind(&self) -> PartitionKind;

    /// Shard id for every position in `problems`. Empty when `shard_count` is 0.
    fn assign(&self, problems: &[Problem], shard_count: usize) -> Vec<usize>;
}

/// Problem `i` goes to shard `i mod shard_count`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModuloPartition;

impl PartitionStrategy for ModuloPartition {
    fn kind(&self) -> PartitionKind {
        PartitionKind::Modulo
    }

    fn assign(&self, problems: &[Problem], shard_count: usize) -> Vec<usize> {
        if shard_count == 0 {
            return Vec::new();
        }
        (0..problems.len()).map(|i| i % shard_count).collect()
    }
}

/// Longest-processing-time-first bucketing over `estimated_cost_secs`.
///
/// Problems are taken in descending cost (ties by position) and each goes to
/// the currently lightest shard (ties by lowest id). Problems without an
/// estimate count as the mean of the known estimates, or 1.0 if none are known.
#[derive(Debug, Clone, Copy, Default)]
pub struct CostBalancedPartition;

impl PartitionStrategy for CostBalancedPartition {
    fn kind(&self) -> PartitionKind {
        PartitionKind::CostBalanced
    }

    fn assign(&self, problems: &[Problem], shard_count: usize) -> Vec<usize> {
        if shard_count == 0 {
            return Vec::new();
        }

        let known: Vec<f64> = problems
            .iter()
            .filter_map(|p| p.metadata.estimated_cost_secs)
            .collect();
        let fallback = if known.is_empty() {
            1.0
        } else {
            known.iter().sum::<f64>() / known.len() as f64
        };
        let costs: Vec<f64> = problems
            .iter()
            .map(|p| p.metadata.estimated_cost_secs.unwrap_or(fallback))
            .collect();

        let mut order: Vec<usize> = (0..problems.len()).collect();
        order.sort_by(|&a, &b| costs[b].total_cmp(&costs[a]).then(a.cmp(&b)));

        let mut loads = vec![0.0f64; shard_count];
        let mut assignment = vec![0usize; problems.len()];
        for pos in order {
            let mut target = 0;
            for shard in 1..shard_count {
                if loads[shard] < loads[target] {
                    target = shard;
                }
            }
            loads[target] += costs[pos];
            assignment[pos] = target;
        }
        assignment
    }
}

/// Serializable name of a strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionKind {
    #[default]
    Modulo,
    CostBalanced,
}

impl PartitionKind {
    pub fn strategy(&self) -> Box<dyn PartitionStrategy> {
        match self {
            PartitionKind::Modulo => Box::new(ModuloPartition),
            PartitionKind::CostBalanced => Box::new(CostBalancedPartition),
        }
    }

    /// True if the assignment depends only on positions, so a merge can
    /// recompute it from the problem ids alone.
    pub fn is_positional(&self) -> bool {
        matches!(self, PartitionKind::Modulo)
    }

    pub fn label(&self) -> &'static str {
        match self {
            PartitionKind::Modulo => "modulo",
            PartitionKind::CostBalanced => "cost_balanced",
        }
    }
}

impl std::fmt::Display for PartitionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

impl std::str::FromStr for PartitionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "modulo" | "mod" => Ok(PartitionKind::Modulo),
            "cost_balanced" | "cost-balanced" | "lpt" => Ok(PartitionKind::CostBalanced),
            other => Err(format!("Unknown partition strategy: {}", other)),
        }
    }
}

/// This shard's problems, in canonical order.
pub fn select<'a>(
    problems: &'a [Problem],
    strategy: &dyn PartitionStrategy,
    shard_count: usize,
    shard_id: usize,
) -> Vec<&'a Problem> {
    strategy
        .assign(problems, shard_count)
        .into_iter()
        .zip(problems)
        .filter(|(shard, _)| *shard == shard_id)
        .map(|(_, p)| p)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::problem::ProblemMetadata;
    use std::collections::HashSet;

    fn problems(n: usize) -> Vec<Problem> {
        (0..n).map(|i| Problem::new(format!("p{:03}", i), "")).collect()
    }

    fn with_cost(id: &str, cost: Option<f64>) -> Problem {
        Problem::new(id, "").with_metadata(ProblemMetadata {
            estimated_cost_secs: cost,
            ..Default::default()
        })
    }

    fn ids(selected: Vec<&Problem>) -> Vec<String> {
        selected.into_iter().map(|p| p.id.clone()).collect()
    }

    #[test]
    fn test_modulo_four_by_two() {
        let ps = problems(4);
        assert_eq!(ids(select(&ps, &ModuloPartition, 2, 0)), vec!["p000", "p002"]);
        assert_eq!(ids(select(&ps, &ModuloPartition, 2, 1)), vec!["p001", "p003"]);
    }

    #[test]
    fn test_partitions_form_disjoint_cover() {
        for strategy in [PartitionKind::Modulo, PartitionKind::CostBalanced] {
            let strategy = strategy.strategy();
            for n in [0usize, 1, 5, 17, 244] {
                let ps: Vec<Problem> = (0..n)
                    .map(|i| with_cost(&format!("p{}", i), (i % 3 != 0).then_some((i * 7 % 11) as f64)))
                    .collect();
                for shard_count in 1..=9 {
                    let mut seen = HashSet::new();
                    let mut total = 0;
                    for shard_id in 0..shard_count {
                        for p in select(&ps, strategy.as_ref(), shard_count, shard_id) {
                            assert!(seen.insert(p.id.clone()), "{} assigned twice", p.id);
                            total += 1;
                        }
                    }
                    assert_eq!(total, n);
                }
            }
        }
    }

    #[test]
    fn test_zero_shards_assigns_nothing() {
        assert!(ModuloPartition.assign(&problems(3), 0).is_empty());
        assert!(select(&problems(3), &CostBalancedPartition, 0, 0).is_empty());
    }

    #[test]
    fn test_cost_balanced_lpt() {
        let ps = vec![
            with_cost("a", Some(10.0)),
            with_cost("b", Some(1.0)),
            with_cost("c", Some(6.0)),
            with_cost("d", Some(5.0)),
        ];
        // a -> 0, c -> 1, d -> 1 (6 < 10), b -> 0 (10 < 11)
        assert_eq!(CostBalancedPartition.assign(&ps, 2), vec![0, 0, 1, 1]);
    }

    #[test]
    fn test_cost_balanced_is_deterministic() {
        let ps: Vec<Problem> = (0..50).map(|i| with_cost(&i.to_string(), None)).collect();
        let first = CostBalancedPartition.assign(&ps, 4);
        assert_eq!(first, CostBalancedPartition.assign(&ps, 4));
        // Equal costs degrade to round-robin.
        assert_eq!(&first[..5], &[0, 1, 2, 3, 0]);
    }

    #[test]
    fn test_partition_kind_parse() {
        assert_eq!("lpt".parse::<PartitionKind>().unwrap(), PartitionKind::CostBalanced);
        assert_eq!(PartitionKind::Modulo.to_string(), "modulo");
        assert!(PartitionKind::Modulo.is_positional());
        assert!(!PartitionKind::CostBalanced.is_positional());
    }
}

//! Worker selection
//!
//! Pure function over `(worker, outstanding, capacity)` triples; no I/O.
//!
//! [`Scoring::Weight`] scores `weight / (1 + outstanding)`.
//! [`Scoring::LoadAware`] folds in the last probe's CPU count and load
//! average: `weight * cpus / (1 + load + outstanding)`, with unprobed
//! workers counted as one idle CPU. Ties go to fewer outstanding jobs, then
//! higher raw weight, then the lexically smaller name, so the choice is
//! deterministic for a given book state.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::inventory::WorkerEntry;

/// How candidates are scored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scoring {
    #[default]
    Weight,
    LoadAware,
}

/// CPU count and load average from the last successful probe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Capacity {
    pub cpus: u32,
    pub load: f64,
}

/// An available worker and its current load.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub worker: &'a WorkerEntry,
    pub outstanding: u32,
    pub capacity: Option<Capacity>,
}

impl<'a> Candidate<'a> {
    pub fn new(worker: &'a WorkerEntry, outstanding: u32) -> Self {
        Self {
            worker,
            outstanding,
            capacity: None,
        }
    }

    pub fn with_capacity(mut self, capacity: Option<Capacity>) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn score(&self, scoring: Scoring) -> f64 {
        let outstanding = f64::from(self.outstanding);
        match scoring {
            Scoring::Weight => self.worker.weight / (1.0 + outstanding),
            Scoring::LoadAware => {
                let (cpus, load) = match self.capacity {
                    Some(c) if c.cpus > 0 => (f64::from(c.cpus), c.load.max(0.0)),
                    _ => (1.0, 0.0),
                };
                self.worker.weight * cpus / (1.0 + load + outstanding)
            }
        }
    }
}

/// Best-first ordering.
fn compare(a: &Candidate<'_>, b: &Candidate<'_>, scoring: Scoring) -> Ordering {
    b.score(scoring)
        .total_cmp(&a.score(scoring))
        .then_with(|| a.outstanding.cmp(&b.outstanding))
        .then_with(|| b.worker.weight.total_cmp(&a.worker.weight))
        .then_with(|| a.worker.name.cmp(&b.worker.name))
}

/// Pick the best candidate, if any.
pub fn select<'a>(candidates: &[Candidate<'a>], scoring: Scoring) -> Option<&'a WorkerEntry> {
    candidates
        .iter()
        .min_by(|a, b| compare(a, b, scoring))
        .map(|c| c.worker)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(name: &str, weight: f64) -> WorkerEntry {
        WorkerEntry::new(name, format!("{name}.local"), 5555).with_weight(weight)
    }

    fn capacity(cpus: u32, load: f64) -> Option<Capacity> {
        Some(Capacity { cpus, load })
    }

    #[test]
    fn test_empty() {
        assert!(select(&[], Scoring::Weight).is_none());
    }

    #[test]
    fn test_highest_weight_wins_at_equal_load() {
        let a = worker("a", 10.0);
        let b = worker("b", 2.0);
        for scoring in [Scoring::Weight, Scoring::LoadAware] {
            let chosen = select(&[Candidate::new(&b, 0), Candidate::new(&a, 0)], scoring).unwrap();
            assert_eq!(chosen.name, "a");
        }
    }

    #[test]
    fn test_load_shifts_choice() {
        let a = worker("a", 10.0);
        let b = worker("b", 2.0);
        // 10/6 < 2/1
        let chosen = select(&[Candidate::new(&a, 5), Candidate::new(&b, 0)], Scoring::Weight).unwrap();
        assert_eq!(chosen.name, "b");
    }

    #[test]
    fn test_score_tie_prefers_fewer_outstanding() {
        let a = worker("a", 4.0);
        let b = worker("b", 2.0);
        // 4/2 == 2/1
        let chosen = select(&[Candidate::new(&a, 1), Candidate::new(&b, 0)], Scoring::Weight).unwrap();
        assert_eq!(chosen.name, "b");
    }

    #[test]
    fn test_full_tie_breaks_by_name() {
        let a = worker("alpha", 1.0);
        let b = worker("beta", 1.0);
        let chosen = select(&[Candidate::new(&b, 0), Candidate::new(&a, 0)], Scoring::Weight).unwrap();
        assert_eq!(chosen.name, "alpha");
    }

    #[test]
    fn test_capacity_ignored_by_weight_scoring() {
        let a = worker("a", 2.0);
        let b = worker("b", 1.0);
        let candidates = [
            Candidate::new(&a, 0).with_capacity(capacity(1, 3.0)),
            Candidate::new(&b, 0).with_capacity(capacity(16, 0.0)),
        ];
        assert_eq!(select(&candidates, Scoring::Weight).unwrap().name, "a");
    }

    #[test]
    fn test_load_aware_prefers_idle_cores() {
        let a = worker("a", 2.0);
        let b = worker("b", 1.0);
        // a: 2*4/(1+7) = 1, b: 1*8/(1+1) = 4
        let candidates = [
            Candidate::new(&a, 0).with_capacity(capacity(4, 7.0)),
            Candidate::new(&b, 0).with_capacity(capacity(8, 1.0)),
        ];
        assert_eq!(select(&candidates, Scoring::LoadAware).unwrap().name, "b");
    }

    #[test]
    fn test_load_aware_unknown_capacity_counts_as_one_idle_cpu() {
        let a = worker("a", 3.0);
        let b = worker("b", 1.0);
        // a: 3*1/1 = 3, b: 1*4/(1+0.5) = 2.67
        let candidates = [
            Candidate::new(&a, 0),
            Candidate::new(&b, 0).with_capacity(capacity(4, 0.5)),
        ];
        assert_eq!(select(&candidates, Scoring::LoadAware).unwrap().name, "a");
    }

    #[test]
    fn test_proportional_share_under_load() {
        let a = worker("a", 3.0);
        let b = worker("b", 1.0);
        let mut load = [0u32, 0u32];
        for _ in 0..8 {
            let candidates = [Candidate::new(&a, load[0]), Candidate::new(&b, load[1])];
            match select(&candidates, Scoring::Weight).unwrap().name.as_str() {
                "a" => load[0] += 1,
                _ => load[1] += 1,
            }
        }
        assert_eq!(load, [6, 2]);
    }
}

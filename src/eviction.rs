//! Ordered data shedding for writes that do not fit.
//!
//! Data goes in increasing order of what it costs the user to lose it:
//! the visual cache first (regenerable), then history down to each configured
//! size. Profiles and growth timelines are never touched.

use std::fmt;

use crate::model::SystemState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionStage {
    Normal,
    CacheCleared,
    HistoryPrunedTo(usize),
    Failed,
}

impl fmt::Display for EvictionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvictionStage::Normal => f.write_str("normal"),
            EvictionStage::CacheCleared => f.write_str("cache-cleared"),
            EvictionStage::HistoryPrunedTo(n) => write!(f, "history-pruned-to-{n}"),
            EvictionStage::Failed => f.write_str("failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionStep {
    ClearVisualCache,
    PruneHistory(usize),
}

impl EvictionStep {
    fn stage(self) -> EvictionStage {
        match self {
            EvictionStep::ClearVisualCache => EvictionStage::CacheCleared,
            EvictionStep::PruneHistory(n) => EvictionStage::HistoryPrunedTo(n),
        }
    }

    /// `None` when the step would not remove anything from `state`.
    fn apply(self, state: &SystemState) -> Option<SystemState> {
        match self {
            EvictionStep::ClearVisualCache => {
                if state.visual_cache.is_empty() {
                    return None;
                }
                let mut next = state.clone();
                next.visual_cache.clear();
                Some(next)
            }
            EvictionStep::PruneHistory(keep) => {
                if state.history.len() <= keep {
                    return None;
                }
                let mut next = state.clone();
                // history is newest-first
                next.history.truncate(keep);
                Some(next)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionPolicy {
    steps: Vec<EvictionStep>,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self::new(&[10, 2])
    }
}

impl EvictionPolicy {
    /// `history_prune_steps` must be strictly decreasing; `StoreConfig`
    /// validates this.
    pub fn new(history_prune_steps: &[usize]) -> Self {
        let steps = std::iter::once(EvictionStep::ClearVisualCache)
            .chain(
                history_prune_steps
                    .iter()
                    .copied()
                    .map(EvictionStep::PruneHistory),
            )
            .collect();
        Self { steps }
    }

    pub fn steps(&self) -> &[EvictionStep] {
        &self.steps
    }

    pub fn cascade(&self) -> EvictionCascade<'_> {
        EvictionCascade {
            steps: &self.steps,
            next_step: 0,
            stage: EvictionStage::Normal,
        }
    }
}

/// One pass through the policy for a single write. Only moves forward.
#[derive(Debug)]
pub struct EvictionCascade<'a> {
    steps: &'a [EvictionStep],
    next_step: usize,
    stage: EvictionStage,
}

impl EvictionCascade<'_> {
    pub fn stage(&self) -> EvictionStage {
        self.stage
    }

    /// Produce the next strictly smaller candidate. Steps that would not
    /// shed anything from `state` are passed over. Returns `None` and
    /// enters `Failed` once the policy is exhausted.
    pub fn advance(&mut self, state: &SystemState) -> Option<SystemState> {
        while let Some(&step) = self.steps.get(self.next_step) {
            self.next_step += 1;
            if let Some(next) = step.apply(state) {
                self.stage = step.stage();
                return Some(next);
            }
        }
        self.stage = EvictionStage::Failed;
        None
    }
}

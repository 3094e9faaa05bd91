use serde::{Deserialize, Serialize};

/// Serializable view of an [`ExecutionTask`](crate::execution::ExecutionTask) subtree,
/// sent as interim progress from a server-side execution to its caller.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSnapshot {
    pub id: String,
    pub description: Option<String>,
    pub total_step_count: Option<u32>,
    pub worked: u32,
    pub canceled: bool,
    pub finished: bool,
    pub cancelable: bool,
    pub step_proportion: Option<f64>,
    pub user_question: Option<String>,
    pub children: Vec<ExecutionSnapshot>,
}

impl ExecutionSnapshot {
    /// Weighted completion in `[0, 1]`, or `None` when nothing in the subtree has a
    /// known step count.
    ///
    /// Children claim their step proportion of the parent; the parent's own steps fill
    /// whatever share is left. Children without a proportion do not contribute.
    pub fn progress(&self) -> Option<f64> {
        if self.finished {
            return Some(1.0);
        }

        let own = self.total_step_count.map(|total| {
            if total == 0 {
                1.0
            } else {
                (f64::from(self.worked) / f64::from(total)).min(1.0)
            }
        });

        let weighted: Vec<(f64, Option<f64>)> = self
            .children
            .iter()
            .filter_map(|child| {
                child
                    .step_proportion
                    .map(|proportion| (proportion.clamp(0.0, 1.0), child.progress()))
            })
            .collect();

        if own.is_none() && weighted.iter().all(|(_, progress)| progress.is_none()) {
            return None;
        }

        let claimed = weighted
            .iter()
            .map(|(proportion, _)| proportion)
            .sum::<f64>()
            .min(1.0);
        let children_share: f64 = weighted
            .iter()
            .map(|(proportion, progress)| proportion * progress.unwrap_or(0.0))
            .sum();

        Some((own.unwrap_or(0.0) * (1.0 - claimed) + children_share).clamp(0.0, 1.0))
    }
}

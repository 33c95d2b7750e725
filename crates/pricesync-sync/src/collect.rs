//! Progress tracking and the end-of-run tally.

use pricesync_core::UpdateOutcome;
use serde::Serialize;

use crate::executor::ExecutionEvent;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
    /// SKU of the most recently started update.
    pub current_sku: Option<String>,
}

impl Progress {
    /// Completed share in `[0.0, 1.0]`; an empty run counts as done.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        (self.completed as f64 / self.total as f64).min(1.0)
    }

    pub fn is_done(&self) -> bool {
        self.completed >= self.total
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub success_count: usize,
    pub failure_count: usize,
    /// Input order.
    pub outcomes: Vec<UpdateOutcome>,
    /// The failed subset of `outcomes`, same order.
    pub failures: Vec<UpdateOutcome>,
}

impl Summary {
    pub fn is_clean(&self) -> bool {
        self.failure_count == 0
    }

    /// One `sku<TAB>variant_id<TAB>reason` line per failed update.
    pub fn failure_report(&self) -> String {
        let mut report = String::new();
        for outcome in &self.failures {
            let reason = outcome
                .failure_reason()
                .unwrap_or_default()
                .replace(['\r', '\n', '\t'], " ");
            report.push_str(&format!(
                "{}\t{}\t{}\n",
                outcome.sku,
                outcome.variant_id,
                reason.trim()
            ));
        }
        report
    }
}

/// Folds executor events into live progress and, at the end, a [`Summary`].
#[derive(Debug, Default)]
pub struct ResultCollector {
    progress: Progress,
    finished: Vec<(usize, UpdateOutcome)>,
}

impl ResultCollector {
    pub fn new(total: usize) -> Self {
        Self {
            progress: Progress {
                total,
                ..Progress::default()
            },
            finished: Vec::with_capacity(total),
        }
    }

    pub fn observe(&mut self, event: &ExecutionEvent) -> &Progress {
        match event {
            ExecutionEvent::Started { total, sku, .. } => {
                self.progress.total = self.progress.total.max(*total);
                self.progress.current_sku = Some(sku.clone());
            }
            ExecutionEvent::Finished {
                index, outcome, ..
            } => {
                self.progress.completed += 1;
                self.finished.push((*index, outcome.clone()));
            }
        }
        &self.progress
    }

    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    pub fn finish(mut self) -> Summary {
        self.finished.sort_by_key(|(index, _)| *index);
        collect(self.finished.into_iter().map(|(_, outcome)| outcome))
    }
}

/// Tally outcomes that are already in order.
pub fn collect(outcomes: impl IntoIterator<Item = UpdateOutcome>) -> Summary {
    let outcomes: Vec<UpdateOutcome> = outcomes.into_iter().collect();
    let failures: Vec<UpdateOutcome> = outcomes
        .iter()
        .filter(|o| !o.is_success())
        .cloned()
        .collect();
    Summary {
        success_count: outcomes.len() - failures.len(),
        failure_count: failures.len(),
        outcomes,
        failures,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::tests::pending;

    #[test]
    fn counts_add_up_and_failures_are_listed() {
        let outcomes = vec![
            UpdateOutcome::success(&pending(0)),
            UpdateOutcome::failed(&pending(1), "HTTP 422: {\"errors\":\n\"price invalid\"}"),
            UpdateOutcome::success(&pending(2)),
        ];
        let summary = collect(outcomes);
        assert_eq!(summary.success_count, 2);
        assert_eq!(summary.failure_count, 1);
        assert_eq!(summary.success_count + summary.failure_count, summary.outcomes.len());
        assert!(!summary.is_clean());
        assert_eq!(summary.failures.len(), summary.failure_count);
        assert_eq!(summary.failures[0].sku, "SKU-1");
        assert_eq!(summary.failures[0].variant_id.as_str(), "1001");
        assert_eq!(
            summary.failure_report(),
            "SKU-1\t1001\tHTTP 422: {\"errors\": \"price invalid\"}\n"
        );
    }

    #[test]
    fn empty_run_is_clean_and_complete() {
        let summary = collect(Vec::new());
        assert!(summary.is_clean());
        assert!(summary.failures.is_empty());
        assert!(summary.failure_report().is_empty());
        assert_eq!(Progress::default().fraction(), 1.0);
    }

    #[test]
    fn collector_tracks_progress_and_restores_order() {
        let mut collector = ResultCollector::new(2);
        assert_eq!(collector.progress().fraction(), 0.0);

        let progress = collector.observe(&ExecutionEvent::Started {
            index: 1,
            total: 2,
            sku: "SKU-1".into(),
        });
        assert_eq!(progress.current_sku.as_deref(), Some("SKU-1"));
        assert_eq!(progress.completed, 0);

        collector.observe(&ExecutionEvent::Finished {
            index: 1,
            total: 2,
            outcome: UpdateOutcome::failed(&pending(1), "timeout"),
        });
        assert_eq!(collector.progress().fraction(), 0.5);

        collector.observe(&ExecutionEvent::Finished {
            index: 0,
            total: 2,
            outcome: UpdateOutcome::success(&pending(0)),
        });
        assert!(collector.progress().is_done());

        let summary = collector.finish();
        assert_eq!(
            summary.outcomes.iter().map(|o| o.sku.as_str()).collect::<Vec<_>>(),
            vec!["SKU-0", "SKU-1"]
        );
        assert_eq!(summary.failure_count, 1);
        assert_eq!(summary.failures[0].sku, "SKU-1");
    }
}

//! Capability traits for the out-of-process agents (planner, coder, GitHub
//! integrator) and the in-memory fakes used by tests and demos.
//!
//! The engine only ever talks to these traits; swapping a fake for a real
//! adapter is a construction-time decision.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::diff;
use crate::errors::AdapterFailure;
use crate::models::{CoderResult, PatchSummary, Step, WorkOrder, RETURN_FORMAT_UNIFIED_DIFF};

/// Turns a queued step into a constrained work order.
#[async_trait]
pub trait SubPlanner: Send + Sync {
    async fn build_work_order(&self, step: &Step) -> Result<WorkOrder, AdapterFailure>;
}

/// Executes one work order and returns a diff.
#[async_trait]
pub trait Coder: Send + Sync {
    async fn execute(&self, order: &WorkOrder) -> Result<CoderResult, AdapterFailure>;
}

/// Branch, patch, and pull-request operations against the code host.
#[async_trait]
pub trait GitHub: Send + Sync {
    async fn ensure_branch(
        &self,
        repo: &str,
        base_ref: &str,
        branch_ref: &str,
    ) -> Result<(), AdapterFailure>;

    async fn apply_patch(
        &self,
        repo: &str,
        branch_ref: &str,
        diff: &str,
    ) -> Result<PatchSummary, AdapterFailure>;

    async fn upsert_pr(
        &self,
        repo: &str,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<(i64, String), AdapterFailure>;

    async fn update_pr_body(
        &self,
        repo: &str,
        pr_number: i64,
        title: &str,
        body: &str,
    ) -> Result<(), AdapterFailure>;

    async fn merge_pr(&self, repo: &str, pr_number: i64) -> Result<(), AdapterFailure>;
}

/// Planner that drafts a work order directly from the step text. No model
/// call; suitable for tests and dry runs.
#[derive(Debug, Default)]
pub struct DraftSubPlanner;

impl DraftSubPlanner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SubPlanner for DraftSubPlanner {
    async fn build_work_order(&self, step: &Step) -> Result<WorkOrder, AdapterFailure> {
        let objective = if step.body.is_empty() {
            step.title.clone()
        } else {
            step.body.clone()
        };
        Ok(WorkOrder {
            work_order_id: Uuid::new_v4(),
            title: step.title.clone(),
            objective,
            constraints: Vec::new(),
            acceptance_criteria: step.acceptance_criteria.clone(),
            context_files: Vec::new(),
            return_format: RETURN_FORMAT_UNIFIED_DIFF.to_string(),
        })
    }
}

/// Planner that always fails with a fixed message.
#[derive(Debug)]
pub struct FailingSubPlanner {
    pub message: String,
}

#[async_trait]
impl SubPlanner for FailingSubPlanner {
    async fn build_work_order(&self, _step: &Step) -> Result<WorkOrder, AdapterFailure> {
        Err(AdapterFailure::Error {
            message: self.message.clone(),
        })
    }
}

/// Coder fake that replays scripted results or failures. When the queue is
/// empty it synthesizes a small deterministic diff for the work order, so
/// happy-path tests need no scripting at all.
#[derive(Debug, Default)]
pub struct ScriptedCoder {
    queue: Mutex<VecDeque<Result<CoderResult, AdapterFailure>>>,
}

impl ScriptedCoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_result(&self, result: CoderResult) {
        self.queue
            .lock()
            .expect("scripted coder lock")
            .push_back(Ok(result));
    }

    /// Queue a diff for the next work order; the work order id is filled in
    /// at execution time.
    pub fn push_diff(&self, diff: impl Into<String>) {
        self.push_result(CoderResult {
            work_order_id: Uuid::nil(),
            diff: diff.into(),
            notes: None,
        });
    }

    pub fn push_failure(&self, failure: AdapterFailure) {
        self.queue
            .lock()
            .expect("scripted coder lock")
            .push_back(Err(failure));
    }
}

#[async_trait]
impl Coder for ScriptedCoder {
    async fn execute(&self, order: &WorkOrder) -> Result<CoderResult, AdapterFailure> {
        let next = self.queue.lock().expect("scripted coder lock").pop_front();
        match next {
            Some(Ok(mut result)) => {
                if result.work_order_id.is_nil() {
                    result.work_order_id = order.work_order_id;
                }
                Ok(result)
            }
            Some(Err(failure)) => Err(failure),
            None => {
                let slug: String = order
                    .title
                    .to_lowercase()
                    .chars()
                    .map(|c| if c.is_alphanumeric() { c } else { '-' })
                    .collect();
                Ok(CoderResult {
                    work_order_id: order.work_order_id,
                    diff: diff::synthetic_diff(&format!("generated/{slug}.txt"), 3),
                    notes: Some(format!("implemented: {}", order.objective)),
                })
            }
        }
    }
}

/// Coder that sleeps before answering, for exercising adapter timeouts.
#[derive(Debug)]
pub struct StallingCoder {
    pub delay: Duration,
}

#[async_trait]
impl Coder for StallingCoder {
    async fn execute(&self, order: &WorkOrder) -> Result<CoderResult, AdapterFailure> {
        tokio::time::sleep(self.delay).await;
        Ok(CoderResult {
            work_order_id: order.work_order_id,
            diff: diff::synthetic_diff("generated/slow.txt", 1),
            notes: None,
        })
    }
}

/// One recorded call against the in-memory GitHub fake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GitHubCall {
    EnsureBranch { repo: String, branch_ref: String },
    ApplyPatch { repo: String, branch_ref: String },
    UpsertPr { repo: String, title: String },
    UpdatePrBody { repo: String, pr_number: i64 },
    MergePr { repo: String, pr_number: i64 },
}

/// GitHub fake that records every call and hands out sequential PR numbers.
#[derive(Debug, Default)]
pub struct InMemoryGitHub {
    calls: Mutex<Vec<GitHubCall>>,
    next_pr: AtomicI64,
    fail_apply: AtomicBool,
    fail_merge: AtomicBool,
    call_delay_ms: AtomicU64,
}

impl InMemoryGitHub {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            next_pr: AtomicI64::new(1),
            fail_apply: AtomicBool::new(false),
            fail_merge: AtomicBool::new(false),
            call_delay_ms: AtomicU64::new(0),
        }
    }

    pub fn calls(&self) -> Vec<GitHubCall> {
        self.calls.lock().expect("github fake lock").clone()
    }

    pub fn call_count(&self, matcher: impl Fn(&GitHubCall) -> bool) -> usize {
        self.calls().iter().filter(|c| matcher(c)).count()
    }

    /// Make the next (and all following) `apply_patch` calls fail until
    /// cleared.
    pub fn set_fail_apply(&self, fail: bool) {
        self.fail_apply.store(fail, Ordering::SeqCst);
    }

    /// Make `merge_pr` calls fail until cleared.
    pub fn set_fail_merge(&self, fail: bool) {
        self.fail_merge.store(fail, Ordering::SeqCst);
    }

    /// Sleep this long at the start of every call, so tests can land an
    /// operator action while a call is in flight.
    pub fn set_call_delay(&self, delay: Duration) {
        self.call_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    async fn maybe_delay(&self) {
        let ms = self.call_delay_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    fn record(&self, call: GitHubCall) {
        self.calls.lock().expect("github fake lock").push(call);
    }
}

#[async_trait]
impl GitHub for InMemoryGitHub {
    async fn ensure_branch(
        &self,
        repo: &str,
        _base_ref: &str,
        branch_ref: &str,
    ) -> Result<(), AdapterFailure> {
        self.record(GitHubCall::EnsureBranch {
            repo: repo.to_string(),
            branch_ref: branch_ref.to_string(),
        });
        self.maybe_delay().await;
        Ok(())
    }

    async fn apply_patch(
        &self,
        repo: &str,
        branch_ref: &str,
        diff_text: &str,
    ) -> Result<PatchSummary, AdapterFailure> {
        self.record(GitHubCall::ApplyPatch {
            repo: repo.to_string(),
            branch_ref: branch_ref.to_string(),
        });
        self.maybe_delay().await;
        if self.fail_apply.load(Ordering::SeqCst) {
            return Err(AdapterFailure::Error {
                message: "patch does not apply cleanly".to_string(),
            });
        }
        let stats = diff::DiffStats::from_unified(diff_text)?;
        Ok(PatchSummary {
            changed_files: stats.changed_files,
            additions: stats.additions,
            deletions: stats.deletions,
        })
    }

    async fn upsert_pr(
        &self,
        repo: &str,
        _head: &str,
        _base: &str,
        title: &str,
        _body: &str,
    ) -> Result<(i64, String), AdapterFailure> {
        self.record(GitHubCall::UpsertPr {
            repo: repo.to_string(),
            title: title.to_string(),
        });
        self.maybe_delay().await;
        let number = self.next_pr.fetch_add(1, Ordering::SeqCst);
        Ok((number, format!("https://example.test/pr/{number}")))
    }

    async fn update_pr_body(
        &self,
        repo: &str,
        pr_number: i64,
        _title: &str,
        _body: &str,
    ) -> Result<(), AdapterFailure> {
        self.record(GitHubCall::UpdatePrBody {
            repo: repo.to_string(),
            pr_number,
        });
        self.maybe_delay().await;
        Ok(())
    }

    async fn merge_pr(&self, repo: &str, pr_number: i64) -> Result<(), AdapterFailure> {
        self.record(GitHubCall::MergePr {
            repo: repo.to_string(),
            pr_number,
        });
        self.maybe_delay().await;
        if self.fail_merge.load(Ordering::SeqCst) {
            return Err(AdapterFailure::Error {
                message: "merge rejected by branch protection".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StepSpec;

    fn step() -> Step {
        Step::from_spec(
            Uuid::new_v4(),
            &StepSpec::new(0, "Add login form").with_body("Render the form"),
        )
    }

    #[tokio::test]
    async fn draft_planner_copies_step_fields() {
        let order = DraftSubPlanner::new()
            .build_work_order(&step())
            .await
            .unwrap();
        assert_eq!(order.title, "Add login form");
        assert_eq!(order.objective, "Render the form");
        assert_eq!(order.return_format, RETURN_FORMAT_UNIFIED_DIFF);
    }

    #[tokio::test]
    async fn scripted_coder_fills_in_work_order_id() {
        let coder = ScriptedCoder::new();
        coder.push_diff(diff::synthetic_diff("src/a.rs", 2));
        let order = DraftSubPlanner::new()
            .build_work_order(&step())
            .await
            .unwrap();
        let result = coder.execute(&order).await.unwrap();
        assert_eq!(result.work_order_id, order.work_order_id);
    }

    #[tokio::test]
    async fn scripted_coder_synthesizes_when_queue_is_empty() {
        let coder = ScriptedCoder::new();
        let order = DraftSubPlanner::new()
            .build_work_order(&step())
            .await
            .unwrap();
        let result = coder.execute(&order).await.unwrap();
        assert!(diff::is_unified_diff(&result.diff));
        assert_eq!(result.work_order_id, order.work_order_id);
    }

    #[tokio::test]
    async fn github_fake_applies_patches_and_counts_lines() {
        let github = InMemoryGitHub::new();
        let diff_text = diff::synthetic_diff("src/a.rs", 4);
        let summary = github
            .apply_patch("acme/site", "autogen/feature-abc", &diff_text)
            .await
            .unwrap();
        assert_eq!(summary.additions, 4);
        assert_eq!(github.calls().len(), 1);
    }

    #[tokio::test]
    async fn github_fake_fail_apply_surfaces_adapter_error() {
        let github = InMemoryGitHub::new();
        github.set_fail_apply(true);
        let diff_text = diff::synthetic_diff("src/a.rs", 1);
        let err = github
            .apply_patch("acme/site", "branch", &diff_text)
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterFailure::Error { .. }));
    }

    #[tokio::test]
    async fn github_fake_hands_out_sequential_pr_numbers() {
        let github = InMemoryGitHub::new();
        let (first, url) = github
            .upsert_pr("acme/site", "head", "main", "t", "b")
            .await
            .unwrap();
        let (second, _) = github
            .upsert_pr("acme/site", "head", "main", "t", "b")
            .await
            .unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 2);
        assert_eq!(url, "https://example.test/pr/1");
    }
}

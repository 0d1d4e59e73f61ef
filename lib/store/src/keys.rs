//! Canonical key shapes in the shared store.
//!
//! Every engine component addresses the store through these helpers so that
//! the key namespace stays in one place. Identifier arguments are taken as
//! `Display` so both typed IDs and raw strings work.

use std::fmt::Display;

/// Run document: `kb:run:<runId>`.
#[must_use]
pub fn run(run_id: &(impl Display + ?Sized)) -> String {
    format!("kb:run:{run_id}")
}

/// Time-sorted run index: `workflow:runs:index`.
#[must_use]
pub fn runs_index() -> String {
    "workflow:runs:index".to_string()
}

/// Per-priority ready queue: `kb:jobs:queue:<priority>`.
#[must_use]
pub fn job_queue(priority: &(impl Display + ?Sized)) -> String {
    format!("kb:jobs:queue:{priority}")
}

/// Concurrency-group lock: `kb:concurrency:<group>`.
#[must_use]
pub fn concurrency(group: &(impl Display + ?Sized)) -> String {
    format!("kb:concurrency:{group}")
}

/// Idempotency binding: `kb:idempotency:<key>`.
#[must_use]
pub fn idempotency(key: &(impl Display + ?Sized)) -> String {
    format!("kb:idempotency:{key}")
}

/// Job lease: `kb:lock:job-lease:<jobId>`.
#[must_use]
pub fn job_lease(job_id: &(impl Display + ?Sized)) -> String {
    format!("kb:lock:job-lease:{job_id}")
}

/// Per-run event stream: `kb:events:<runId>`.
#[must_use]
pub fn events(run_id: &(impl Display + ?Sized)) -> String {
    format!("kb:events:{run_id}")
}

/// Run snapshot: `workflow:snapshot:<runId>`.
#[must_use]
pub fn snapshot(run_id: &(impl Display + ?Sized)) -> String {
    format!("workflow:snapshot:{run_id}")
}

/// Approval request: `workflow:approval:<runId>:<stepId>`.
#[must_use]
pub fn approval(run_id: &(impl Display + ?Sized), step_id: &(impl Display + ?Sized)) -> String {
    format!("workflow:approval:{run_id}:{step_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_shapes() {
        assert_eq!(run(&"run_1"), "kb:run:run_1");
        assert_eq!(job_queue(&"high"), "kb:jobs:queue:high");
        assert_eq!(concurrency(&"deploy"), "kb:concurrency:deploy");
        assert_eq!(idempotency(&"abc"), "kb:idempotency:abc");
        assert_eq!(job_lease(&"run_1:build"), "kb:lock:job-lease:run_1:build");
        assert_eq!(events(&"run_1"), "kb:events:run_1");
        assert_eq!(snapshot(&"run_1"), "workflow:snapshot:run_1");
        assert_eq!(approval(&"run_1", &"run_1:build:0"), "workflow:approval:run_1:run_1:build:0");
        assert_eq!(runs_index(), "workflow:runs:index");
    }
}

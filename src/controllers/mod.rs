//! Controllers for the PRStack operator
//!
//! One controller watches the PRStack CRD and reconciles the actual cluster
//! state with the desired state, one stack at a time.

mod cleanup;
mod deploy;
mod provision;
mod scale;
mod stack;

pub use stack::StackController;

use crate::crd::PRStack;
use crate::error::OperatorError;
use kube::runtime::controller::Action;
use std::sync::Arc;
use std::time::Duration;

/// Fallback policy for errors that escape the reconcile function.
/// Categorizes errors by kind to choose the retry delay.
pub(crate) fn error_policy(
    stack: Arc<PRStack>,
    error: &OperatorError,
    ctx: Arc<StackController>,
) -> Action {
    ctx.metrics.reconcile_failure(&stack.spec.stack_id, error);

    match error {
        // Spec problems only resolve when the user edits the object
        OperatorError::Validation(_) => Action::await_change(),
        // Transient K8s API errors — retry quickly
        OperatorError::KubeApi(_) => Action::requeue(Duration::from_secs(10)),
        // External systems — moderate wait
        OperatorError::Database(_) | OperatorError::ObjectStore(_) => {
            Action::requeue(Duration::from_secs(30))
        }
        // Status out of sync with the cluster — re-run soon to re-create
        OperatorError::Inconsistency(_) => Action::requeue(Duration::from_secs(5)),
        // Config/serialization errors unlikely to self-heal — back off further
        OperatorError::Configuration(_) | OperatorError::Serialization(_) => {
            Action::requeue(Duration::from_secs(60))
        }
    }
}

//! Rollout and scale control across every Deployment in a stack namespace.

use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Api, ListParams, Patch, PatchParams};
use tracing::{debug, info, warn};

use super::stack::StackController;
use crate::error::{OperatorError, Result};

/// Annotation stamped on pod templates to force a rolling restart.
pub(crate) const RESTART_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";

/// Whether a Deployment needs a replica write. Deployments already at the
/// target are skipped to avoid generation churn.
pub(crate) fn needs_scale(current: Option<i32>, desired: i32) -> bool {
    current != Some(desired)
}

impl StackController {
    /// Set every Deployment in the namespace to the desired replica count.
    ///
    /// Tolerates an empty namespace. Individual failures do not abort the
    /// list; the first error is returned once every Deployment was attempted.
    pub(crate) async fn scale_all(&self, namespace: &str, desired: i32) -> Result<usize> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let list = deployments.list(&ListParams::default()).await?;

        let mut scaled = 0;
        let mut first_error: Option<OperatorError> = None;
        for deployment in &list.items {
            let name = match deployment.metadata.name.as_deref() {
                Some(name) => name,
                None => continue,
            };
            let current = deployment.spec.as_ref().and_then(|s| s.replicas);
            if !needs_scale(current, desired) {
                continue;
            }

            debug!(deployment = %name, namespace = %namespace, desired, "Scaling deployment");
            let patch = serde_json::json!({"spec": {"replicas": desired}});
            match deployments
                .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
            {
                Ok(_) => scaled += 1,
                Err(e) => {
                    warn!(deployment = %name, error = %e, "Failed to scale deployment");
                    if first_error.is_none() {
                        first_error = Some(e.into());
                    }
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        if scaled > 0 {
            info!(namespace = %namespace, scaled, desired, "Scaled deployments");
        }
        Ok(scaled)
    }

    /// Re-stamp the restart annotation on every Deployment's pod template,
    /// rolling all pods without changing the image reference.
    pub(crate) async fn rollout_all(&self, namespace: &str, stamp: &str) -> Result<usize> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let list = deployments.list(&ListParams::default()).await?;

        if list.items.is_empty() {
            debug!(namespace = %namespace, "No deployments to roll out");
            return Ok(0);
        }

        let mut rolled = 0;
        let mut first_error: Option<OperatorError> = None;
        for deployment in &list.items {
            let name = match deployment.metadata.name.as_deref() {
                Some(name) => name,
                None => continue,
            };
            let patch = serde_json::json!({
                "spec": {
                    "template": {
                        "metadata": {
                            "annotations": {RESTART_ANNOTATION: stamp}
                        }
                    }
                }
            });
            match deployments
                .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
            {
                Ok(_) => {
                    debug!(deployment = %name, stamp = %stamp, "Triggered rollout");
                    rolled += 1;
                }
                Err(e) => {
                    warn!(deployment = %name, error = %e, "Failed to roll out deployment");
                    if first_error.is_none() {
                        first_error = Some(e.into());
                    }
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        info!(namespace = %namespace, rolled, "Rolled out deployments");
        Ok(rolled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_needs_scale_skips_at_target() {
        assert!(!needs_scale(Some(1), 1));
        assert!(!needs_scale(Some(0), 0));
    }

    #[test]
    fn test_needs_scale_on_mismatch() {
        assert!(needs_scale(Some(1), 0));
        assert!(needs_scale(Some(0), 1));
        // Unset replicas always get an explicit write
        assert!(needs_scale(None, 1));
        assert!(needs_scale(None, 0));
    }
}

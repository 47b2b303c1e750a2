//! Cleaning branch: ordered teardown of everything a stack owns.
//!
//! The namespace goes first (cascading every in-namespace resource), then
//! the databases and the per-stack user, which live outside the namespace
//! and are guarded by the finalizer. The finalizer is removed only after the
//! Cleaned status was written, so a crash in between keeps the record.

use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use super::stack::{StackController, REQUEUE_MEDIUM};
use crate::conditions::STACK_FINALIZER;
use crate::crd::{PRStack, StackPhase, StackStatus};
use crate::database::DatabaseAdmin;
use crate::error::Result;
use crate::names;

/// Finalizer list with the operator's entry removed.
pub(crate) fn remaining_finalizers(finalizers: &[String]) -> Vec<String> {
    finalizers
        .iter()
        .filter(|f| f.as_str() != STACK_FINALIZER)
        .cloned()
        .collect()
}

impl StackController {
    pub(crate) async fn cleanup(
        &self,
        stack: &PRStack,
        mut status: StackStatus,
    ) -> std::result::Result<Action, crate::error::OperatorError> {
        let stack_id = &stack.spec.stack_id;
        info!(stack = %stack_id, "Cleaning up stack");

        self.record(
            stack,
            EventType::Normal,
            "Cleaning",
            format!("Cleaning up all resources for stack {}", stack_id),
        )
        .await;

        // Final backup before anything is torn down. Best-effort: cleanup
        // proceeds even when the job cannot be created.
        let backup_enabled = stack.spec.backup_config.as_ref().is_some_and(|b| b.enabled);
        if backup_enabled && status.db_credentials.is_some() {
            match self.backups.create_backup(stack).await {
                Ok(name) => info!(stack = %stack_id, backup = %name, "Dispatched final backup"),
                Err(e) => warn!(stack = %stack_id, error = %e, "Failed to create final backup"),
            }
        }

        if let Err(e) = self.teardown(stack, &status).await {
            warn!(stack = %stack_id, error = %e, "Cleanup failed, will retry");
            self.metrics.reconcile_failure(stack_id, &e);
            status.message = Some(format!("Cleanup failed: {}", e));
            self.patch_status(stack, &status).await?;
            return Ok(Action::requeue(REQUEUE_MEDIUM));
        }

        // Record success before removing the finalizer; removal is what lets
        // Kubernetes actually delete the object.
        status.phase = StackPhase::Cleaned;
        status.message = Some("All resources have been cleaned up".to_string());
        self.patch_status(stack, &status).await?;

        self.record(
            stack,
            EventType::Normal,
            "CleanupComplete",
            format!("All resources for stack {} cleaned up successfully", stack_id),
        )
        .await;

        self.remove_finalizer(stack).await?;
        info!(stack = %stack_id, "Cleanup complete, finalizer removed");

        Ok(Action::await_change())
    }

    /// Delete Kubernetes-scoped resources first, then the database tier.
    async fn teardown(&self, stack: &PRStack, status: &StackStatus) -> Result<()> {
        let stack_id = &stack.spec.stack_id;
        let namespace = self.namespace(stack);

        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        match namespaces.delete(&namespace, &DeleteParams::default()).await {
            Ok(_) => info!(namespace = %namespace, "Deleted namespace"),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(namespace = %namespace, "Namespace already gone")
            }
            Err(e) => return Err(e.into()),
        }

        // Databases and the user live outside the namespace. Drops are
        // best-effort: a database that fails to drop is logged and the loop
        // continues, so one bad entry cannot wedge the teardown.
        if let Some(credentials) = &status.db_credentials {
            let uri = stack
                .spec
                .db_uri
                .clone()
                .unwrap_or_else(|| self.config.db_uri.clone());
            let admin = DatabaseAdmin::connect(&uri).await?;

            for db_name in &credentials.databases {
                if let Err(e) = admin.drop_database(db_name).await {
                    warn!(database = %db_name, error = %e, "Failed to drop database");
                }
            }

            if let Err(e) = admin.drop_user(&credentials.user).await {
                warn!(user = %credentials.user, error = %e, "Failed to drop user");
            }
        }

        // Bus subjects and cache key ranges lived inside the namespace, so
        // deleting it already released them.
        debug!(
            subject_prefix = %names::bus_subject_prefix(stack_id),
            key_prefix = %names::cache_key_prefix(stack_id),
            "Per-stack messaging and cache ranges released"
        );

        Ok(())
    }

    async fn remove_finalizer(&self, stack: &PRStack) -> Result<()> {
        let finalizers = remaining_finalizers(stack.metadata.finalizers.as_deref().unwrap_or_default());

        let api: Api<PRStack> = Api::all(self.client.clone());
        let patch = serde_json::json!({"metadata": {"finalizers": finalizers}});
        api.patch(&stack.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remaining_finalizers_removes_only_ours() {
        let finalizers = vec![
            "other.io/keep".to_string(),
            STACK_FINALIZER.to_string(),
            "another.io/keep".to_string(),
        ];
        let remaining = remaining_finalizers(&finalizers);
        assert_eq!(remaining, vec!["other.io/keep".to_string(), "another.io/keep".to_string()]);
    }

    #[test]
    fn test_remaining_finalizers_empty() {
        assert!(remaining_finalizers(&[]).is_empty());
        assert!(remaining_finalizers(&[STACK_FINALIZER.to_string()]).is_empty());
    }
}

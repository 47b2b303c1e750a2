//! Idempotent Kubernetes resource helpers shared by the controller branches.

use std::collections::BTreeMap;
use std::fmt::Debug;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::crd::PRStack;
use crate::error::Result;

/// Field manager / managed-by identity for everything this operator writes.
pub const MANAGER: &str = "prstack-operator";

/// Name of the per-stack database credentials secret.
pub const DB_SECRET_NAME: &str = "db-credentials";

/// Name of the image-pull secret referenced by every pod spec.
pub const REGISTRY_SECRET_NAME: &str = "registry-credentials";

/// Name of the backup storage PVC.
pub const BACKUP_PVC_NAME: &str = "backup-store";

/// Create the object if missing, otherwise patch it to the desired state.
pub async fn create_or_update<K>(api: &Api<K>, name: &str, obj: &K) -> Result<()>
where
    K: Resource + Clone + Debug + DeserializeOwned + Serialize,
{
    match api.get(name).await {
        Ok(_existing) => {
            api.patch(name, &PatchParams::default(), &Patch::Merge(obj)).await?;
        }
        Err(_) => {
            api.create(&PostParams::default(), obj).await?;
        }
    }
    Ok(())
}

/// Common labels for resources belonging to one workload of one stack.
pub fn common_labels(app: &str, stack_id: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert("app.kubernetes.io/name".to_string(), app.to_string());
    labels.insert("app.kubernetes.io/instance".to_string(), format!("pr-{}", stack_id));
    labels.insert("app.kubernetes.io/managed-by".to_string(), MANAGER.to_string());
    labels.insert("shop.pilab.hu/stack-id".to_string(), stack_id.to_string());
    labels
}

/// Selector labels for one workload's pods.
pub fn selector_labels(app: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert("app".to_string(), app.to_string());
    labels
}

/// Owner reference back to the stack. Applied to everything the controller
/// creates except the Namespace and the external database entities, whose
/// lifetimes are handled by the finalizer path.
pub fn owner_reference(stack: &PRStack) -> OwnerReference {
    OwnerReference {
        api_version: PRStack::api_version(&()).to_string(),
        kind: PRStack::kind(&()).to_string(),
        name: stack.name_any(),
        uid: stack.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::StackSpec;

    #[test]
    fn test_common_labels() {
        let labels = common_labels("products-service", "42");
        assert_eq!(labels["app.kubernetes.io/name"], "products-service");
        assert_eq!(labels["app.kubernetes.io/instance"], "pr-42");
        assert_eq!(labels["app.kubernetes.io/managed-by"], MANAGER);
        assert_eq!(labels["shop.pilab.hu/stack-id"], "42");
    }

    #[test]
    fn test_owner_reference_points_at_stack() {
        let spec: StackSpec = serde_json::from_str(r#"{"stackID": "42"}"#).unwrap();
        let stack = PRStack::new("pr-42", spec);
        let owner = owner_reference(&stack);
        assert_eq!(owner.kind, "PRStack");
        assert_eq!(owner.api_version, "shop.pilab.hu/v1alpha1");
        assert_eq!(owner.name, "pr-42");
        assert_eq!(owner.controller, Some(true));
    }
}

//! Provisioning branch: namespace, database tier, credentials secret and
//! per-stack messaging/cache coordinates.
//!
//! Every step is idempotent and tolerates being replayed after a crash: the
//! namespace and secret go through create-or-update, and the database user
//! is dropped before it is re-created.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Namespace, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use tracing::info;

use super::stack::{merge_condition, StackController, REQUEUE_SHORT};
use crate::conditions::{build_condition, CONDITION_TRUE, STACK_CONDITION_PROGRESSING};
use crate::crd::{CacheCoordinates, DatabaseCredentials, MessageBusCoordinates, PRStack, StackPhase, StackStatus};
use crate::database::DatabaseAdmin;
use crate::error::{OperatorError, Result};
use crate::resources::{self, DB_SECRET_NAME};
use crate::services::{self, CollectionSpec};
use crate::names;

/// Databases to create for a stack, with their collection sets.
/// An unknown service name is a hard error.
pub(crate) fn database_plan(
    services_list: &[String],
    stack_id: &str,
) -> Result<Vec<(String, &'static [CollectionSpec])>> {
    let mut plan = Vec::with_capacity(services_list.len());
    for service in services_list {
        let logical = names::logical_name(service);
        let set = services::collection_set(logical).ok_or_else(|| {
            OperatorError::Validation(format!("unknown service '{}'", service))
        })?;
        plan.push((names::database_name(service, stack_id), set));
    }
    Ok(plan)
}

impl StackController {
    pub(crate) async fn provision(
        &self,
        stack: &PRStack,
        mut status: StackStatus,
    ) -> std::result::Result<Action, OperatorError> {
        let stack_id = &stack.spec.stack_id;
        let namespace = self.namespace(stack);

        info!(stack = %stack_id, namespace = %namespace, "Provisioning stack resources");
        self.record(
            stack,
            EventType::Normal,
            "Provisioning",
            format!("Provisioning infrastructure for stack {}", stack_id),
        )
        .await;

        if let Err(e) = self.ensure_namespace(&namespace).await {
            return self
                .branch_error(stack, &mut status, "namespace", "ProvisioningFailed", e)
                .await;
        }

        let credentials = match self.provision_databases(stack).await {
            Ok(credentials) => credentials,
            Err(e @ OperatorError::Validation(_)) => {
                return self
                    .fail_terminal(stack, &mut status, "ProvisioningFailed", "Invalid", e)
                    .await;
            }
            Err(e) => {
                return self
                    .branch_error(stack, &mut status, "database tier", "ProvisioningFailed", e)
                    .await;
            }
        };

        status.db_credentials = Some(credentials.clone());
        self.patch_status(stack, &status).await?;

        if let Err(e) = self.ensure_db_secret(stack, &namespace, &credentials).await {
            return self
                .branch_error(stack, &mut status, "credentials secret", "ProvisioningFailed", e)
                .await;
        }

        // Bus and cache are stood up inside the namespace during Deploying;
        // only their deterministic coordinates are recorded here.
        status.message_bus = Some(MessageBusCoordinates {
            subject_prefix: names::bus_subject_prefix(stack_id),
            url: names::bus_url(&namespace),
        });
        status.cache = Some(CacheCoordinates {
            key_prefix: names::cache_key_prefix(stack_id),
            url: names::cache_url(&namespace),
        });

        status.phase = StackPhase::Deploying;
        status.message = Some("Resources provisioned, starting service deployment".to_string());
        merge_condition(
            &mut status,
            build_condition(STACK_CONDITION_PROGRESSING, CONDITION_TRUE, "Provisioned", "Infrastructure provisioned"),
        );
        self.patch_status(stack, &status).await?;

        self.record(
            stack,
            EventType::Normal,
            "ProvisioningComplete",
            "Infrastructure provisioning completed successfully".to_string(),
        )
        .await;

        Ok(Action::requeue(REQUEUE_SHORT))
    }

    async fn ensure_namespace(&self, name: &str) -> Result<()> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        if namespaces.get_opt(name).await?.is_none() {
            let namespace = Namespace {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    ..Default::default()
                },
                ..Default::default()
            };
            namespaces.create(&PostParams::default(), &namespace).await?;
            info!(namespace = %name, "Created namespace");
        }
        Ok(())
    }

    /// Drop-then-create the per-stack user, then assert every database's
    /// collection and index set. Existing databases are preserved.
    async fn provision_databases(&self, stack: &PRStack) -> Result<DatabaseCredentials> {
        let stack_id = &stack.spec.stack_id;
        let uri = stack
            .spec
            .db_uri
            .clone()
            .unwrap_or_else(|| self.config.db_uri.clone());

        let plan = database_plan(&services::effective_services(&stack.spec), stack_id)?;
        let databases: Vec<String> = plan.iter().map(|(db, _)| db.clone()).collect();

        let admin = DatabaseAdmin::connect(&uri).await?;

        let user = names::database_user(stack_id);
        let password = names::generate_password();

        admin.drop_user(&user).await?;
        admin.create_user(&user, &password, &databases).await?;

        for (db_name, collections) in &plan {
            admin.ensure_collections(db_name, collections).await?;
        }

        info!(stack = %stack_id, user = %user, databases = databases.len(), "Provisioned database tier");

        let connection_string = names::with_credentials(&uri, &user, &password);
        Ok(DatabaseCredentials {
            user,
            password,
            connection_string,
            databases,
        })
    }

    async fn ensure_db_secret(
        &self,
        stack: &PRStack,
        namespace: &str,
        credentials: &DatabaseCredentials,
    ) -> Result<()> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);

        let mut string_data = BTreeMap::new();
        string_data.insert("username".to_string(), credentials.user.clone());
        string_data.insert("password".to_string(), credentials.password.clone());
        string_data.insert("connectionString".to_string(), credentials.connection_string.clone());
        string_data.insert("databases".to_string(), credentials.databases.join(","));

        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(DB_SECRET_NAME.to_string()),
                namespace: Some(namespace.to_string()),
                labels: Some(resources::common_labels("db-credentials", &stack.spec.stack_id)),
                owner_references: Some(vec![resources::owner_reference(stack)]),
                ..Default::default()
            },
            string_data: Some(string_data),
            type_: Some("Opaque".to_string()),
            ..Default::default()
        };

        resources::create_or_update(&secrets, DB_SECRET_NAME, &secret).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::StackSpec;

    #[test]
    fn test_database_plan_matches_effective_services() {
        let spec: StackSpec = serde_json::from_str(r#"{"stackID": "42"}"#).unwrap();
        let effective = services::effective_services(&spec);
        let plan = database_plan(&effective, "42").unwrap();
        // One database per effective service
        assert_eq!(plan.len(), effective.len());
        assert!(plan.iter().any(|(db, _)| db == "pishop_products_pr_42"));
        assert!(plan.iter().any(|(db, _)| db == "pishop_graphql_pr_42"));
    }

    #[test]
    fn test_database_plan_rejects_unknown_service() {
        let err = database_plan(&["mystery-service".to_string()], "42").unwrap_err();
        assert!(matches!(err, OperatorError::Validation(_)));
    }

    #[test]
    fn test_database_plan_single_service() {
        let plan = database_plan(&["products-service".to_string()], "42").unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].0, "pishop_products_pr_42");
        assert!(plan[0].1.iter().any(|c| c.name == "products"));
    }
}

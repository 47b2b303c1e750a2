//! Deploying branch: per-stack message bus and cache, connection config,
//! backup storage, and the service fan-out with its ingress.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, Container, ContainerPort, EmptyDirVolumeSource, EnvVar, HTTPGetAction,
    LocalObjectReference, PersistentVolumeClaim, PersistentVolumeClaimSpec, PodSpec,
    PodTemplateSpec, Probe, ResourceRequirements, Secret, Service, ServicePort, ServiceSpec,
    Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::Api;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use tracing::{error, info};

use super::stack::{merge_condition, StackController, REQUEUE_LONG, REQUEUE_MEDIUM};
use crate::conditions::{
    build_condition, CONDITION_FALSE, CONDITION_TRUE, STACK_CONDITION_DEGRADED,
    STACK_CONDITION_PROGRESSING, STACK_CONDITION_READY,
};
use crate::config::OperatorConfig;
use crate::crd::{PRStack, ResourceLimits, ServiceStatus, StackPhase, StackStatus};
use crate::error::Result;
use crate::names;
use crate::resources::{self, BACKUP_PVC_NAME, REGISTRY_SECRET_NAME};
use crate::services;

const SERVICE_PORT: i32 = 8080;

impl StackController {
    pub(crate) async fn deploy(
        &self,
        stack: &PRStack,
        mut status: StackStatus,
    ) -> std::result::Result<Action, crate::error::OperatorError> {
        let stack_id = &stack.spec.stack_id;
        let namespace = self.namespace(stack);

        info!(stack = %stack_id, namespace = %namespace, "Deploying stack services");
        self.record(
            stack,
            EventType::Normal,
            "Deploying",
            format!("Deploying services for stack {}", stack_id),
        )
        .await;

        if let Err(e) = self.ensure_registry_secret(stack, &namespace).await {
            return self
                .branch_error(stack, &mut status, "registry secret", "DeploymentFailed", e)
                .await;
        }

        if let Err(e) = self.ensure_stack_tier(stack, &namespace, &status).await {
            return self
                .branch_error(stack, &mut status, "message bus and cache", "DeploymentFailed", e)
                .await;
        }

        if stack.spec.backup_config.as_ref().is_some_and(|b| b.enabled) {
            if let Err(e) = self.ensure_backup_pvc(stack, &namespace).await {
                return self
                    .branch_error(stack, &mut status, "backup storage", "DeploymentFailed", e)
                    .await;
            }
        }

        let effective = services::effective_services(&stack.spec);
        let front_door = services::front_door(&effective).map(|s| s.to_string());

        let mut results = Vec::with_capacity(effective.len());
        for service in &effective {
            let is_front_door = front_door.as_deref() == Some(service.as_str());
            match self.deploy_service(stack, &namespace, service, is_front_door).await {
                Ok(()) => results.push(ServiceStatus {
                    name: service.clone(),
                    status: "Running".to_string(),
                    message: Some("Service deployed successfully".to_string()),
                }),
                Err(e) => {
                    error!(stack = %stack_id, service = %service, error = %e, "Failed to deploy service");
                    results.push(ServiceStatus {
                        name: service.clone(),
                        status: "Failed".to_string(),
                        message: Some(e.to_string()),
                    });
                }
            }
        }

        let total = results.len();
        let failed = results.iter().filter(|s| s.status == "Failed").count();
        status.services = results;
        status.observed_generation = stack.metadata.generation;

        let action = if failed == 0 {
            status.phase = StackPhase::Running;
            status.message = Some(format!("Stack is running with {} services", total));
            merge_condition(
                &mut status,
                build_condition(STACK_CONDITION_READY, CONDITION_TRUE, "AllServicesRunning", "All services deployed"),
            );
            merge_condition(
                &mut status,
                build_condition(STACK_CONDITION_DEGRADED, CONDITION_FALSE, "Healthy", "Stack is healthy"),
            );
            merge_condition(
                &mut status,
                build_condition(STACK_CONDITION_PROGRESSING, CONDITION_FALSE, "Deployed", "Rollout complete"),
            );
            self.record(
                stack,
                EventType::Normal,
                "Deployed",
                format!("Stack {} is now running with {} services", stack_id, total),
            )
            .await;
            Action::requeue(REQUEUE_LONG)
        } else if failed < total {
            status.phase = StackPhase::Degraded;
            status.message = Some(format!("{}/{} services failed to deploy", failed, total));
            merge_condition(
                &mut status,
                build_condition(STACK_CONDITION_READY, CONDITION_TRUE, "PartiallyDegraded", "Some services failed"),
            );
            merge_condition(
                &mut status,
                build_condition(
                    STACK_CONDITION_DEGRADED,
                    CONDITION_TRUE,
                    "ServiceFailures",
                    &format!("{}/{} services failed", failed, total),
                ),
            );
            self.record(
                stack,
                EventType::Warning,
                "DeploymentFailed",
                format!("{}/{} services failed to deploy", failed, total),
            )
            .await;
            Action::requeue(REQUEUE_LONG)
        } else {
            status.phase = StackPhase::Failed;
            status.message = Some("All services failed to deploy".to_string());
            merge_condition(
                &mut status,
                build_condition(STACK_CONDITION_READY, CONDITION_FALSE, "DeploymentFailed", "No service is running"),
            );
            merge_condition(
                &mut status,
                build_condition(STACK_CONDITION_DEGRADED, CONDITION_TRUE, "ServiceFailures", "All services failed"),
            );
            self.record(
                stack,
                EventType::Warning,
                "DeploymentFailed",
                format!("All {} services failed to deploy", total),
            )
            .await;
            Action::requeue(REQUEUE_MEDIUM)
        };

        self.patch_status(stack, &status).await?;
        Ok(action)
    }

    async fn deploy_service(
        &self,
        stack: &PRStack,
        namespace: &str,
        service: &str,
        front_door: bool,
    ) -> Result<()> {
        let env = services::render_service_env(service, stack, &self.config)?;

        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let deployment = build_service_deployment(stack, namespace, service, env, &self.config);
        resources::create_or_update(&deployments, service, &deployment).await?;

        let svcs: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let workload_service = build_workload_service(stack, namespace, service);
        resources::create_or_update(&svcs, service, &workload_service).await?;

        if front_door {
            let ingresses: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
            let ingress = build_ingress(stack, namespace, service, &self.config);
            resources::create_or_update(&ingresses, service, &ingress).await?;
        }

        Ok(())
    }

    /// Image-pull secret, skipped when no registry credentials are
    /// configured. Pod specs reference it by name regardless; absence is
    /// tolerated for public images.
    async fn ensure_registry_secret(&self, stack: &PRStack, namespace: &str) -> Result<()> {
        if !self.config.registry_configured() {
            return Ok(());
        }

        let docker_config = docker_config_json(&self.config)?;
        let mut string_data = BTreeMap::new();
        string_data.insert(".dockerconfigjson".to_string(), docker_config);

        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(REGISTRY_SECRET_NAME.to_string()),
                namespace: Some(namespace.to_string()),
                labels: Some(resources::common_labels("registry-credentials", &stack.spec.stack_id)),
                owner_references: Some(vec![resources::owner_reference(stack)]),
                ..Default::default()
            },
            string_data: Some(string_data),
            type_: Some("kubernetes.io/dockerconfigjson".to_string()),
            ..Default::default()
        };

        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        resources::create_or_update(&secrets, REGISTRY_SECRET_NAME, &secret).await
    }

    /// Message-bus and cache Deployments and Services, plus the ConfigMaps
    /// downstream services read their connection strings from.
    async fn ensure_stack_tier(
        &self,
        stack: &PRStack,
        namespace: &str,
        status: &StackStatus,
    ) -> Result<()> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let svcs: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let configmaps: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);

        let bus_deployment = build_bus_deployment(stack, namespace);
        resources::create_or_update(&deployments, "message-bus", &bus_deployment).await?;
        let bus_service = build_bus_service(stack, namespace);
        resources::create_or_update(&svcs, "message-bus", &bus_service).await?;

        let cache_deployment = build_cache_deployment(stack, namespace);
        resources::create_or_update(&deployments, "cache", &cache_deployment).await?;
        let cache_service = build_cache_service(stack, namespace);
        resources::create_or_update(&svcs, "cache", &cache_service).await?;

        for (name, data) in tier_configmaps(status) {
            let configmap = ConfigMap {
                metadata: ObjectMeta {
                    name: Some(name.clone()),
                    namespace: Some(namespace.to_string()),
                    labels: Some(resources::common_labels(&name, &stack.spec.stack_id)),
                    owner_references: Some(vec![resources::owner_reference(stack)]),
                    ..Default::default()
                },
                data: Some(data),
                ..Default::default()
            };
            resources::create_or_update(&configmaps, &name, &configmap).await?;
        }

        Ok(())
    }

    async fn ensure_backup_pvc(&self, stack: &PRStack, namespace: &str) -> Result<()> {
        let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        if pvcs.get_opt(BACKUP_PVC_NAME).await?.is_some() {
            return Ok(());
        }
        let pvc = build_backup_pvc(stack, namespace);
        pvcs.create(&kube::api::PostParams::default(), &pvc).await?;
        info!(namespace = %namespace, "Created backup PVC");
        Ok(())
    }
}

/// Connection ConfigMaps for the stack tier.
pub(crate) fn tier_configmaps(status: &StackStatus) -> Vec<(String, BTreeMap<String, String>)> {
    let mut out = Vec::new();

    let mut db = BTreeMap::new();
    if let Some(credentials) = &status.db_credentials {
        db.insert("uri".to_string(), credentials.connection_string.clone());
        db.insert("databases".to_string(), credentials.databases.join(","));
    }
    out.push(("db-config".to_string(), db));

    let mut bus = BTreeMap::new();
    if let Some(message_bus) = &status.message_bus {
        bus.insert("url".to_string(), message_bus.url.clone());
        bus.insert("subjectPrefix".to_string(), message_bus.subject_prefix.clone());
    }
    out.push(("bus-config".to_string(), bus));

    let mut cache = BTreeMap::new();
    if let Some(coordinates) = &status.cache {
        cache.insert("url".to_string(), coordinates.url.clone());
        cache.insert("keyPrefix".to_string(), coordinates.key_prefix.clone());
    }
    out.push(("cache-config".to_string(), cache));

    out
}

/// Docker config JSON for the image-pull secret.
pub(crate) fn docker_config_json(config: &OperatorConfig) -> Result<String> {
    let auth = STANDARD.encode(format!("{}:{}", config.registry_user, config.registry_token));
    let entry = serde_json::json!({
        "username": config.registry_user,
        "password": config.registry_token,
        "email": config.registry_email,
        "auth": auth,
    });
    let mut auths = serde_json::Map::new();
    auths.insert(config.registry.clone(), entry);
    let value = serde_json::json!({"auths": auths});
    Ok(serde_json::to_string(&value)?)
}

/// Container limits from the spec, or the defaults. Requests stay at zero so
/// PR environments never reserve cluster capacity.
pub(crate) fn resource_requirements(limits: Option<&ResourceLimits>) -> ResourceRequirements {
    let cpu = limits
        .and_then(|l| l.cpu_limit.clone())
        .unwrap_or_else(|| "500m".to_string());
    let memory = limits
        .and_then(|l| l.memory_limit.clone())
        .unwrap_or_else(|| "512Mi".to_string());

    let mut limit_map = BTreeMap::new();
    limit_map.insert("cpu".to_string(), Quantity(cpu));
    limit_map.insert("memory".to_string(), Quantity(memory));

    let mut request_map = BTreeMap::new();
    request_map.insert("cpu".to_string(), Quantity("0m".to_string()));
    request_map.insert("memory".to_string(), Quantity("0Mi".to_string()));

    ResourceRequirements {
        limits: Some(limit_map),
        requests: Some(request_map),
        ..Default::default()
    }
}

fn http_probe(path: &str, initial_delay: i32, period: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.to_string()),
            port: IntOrString::Int(SERVICE_PORT),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay),
        period_seconds: Some(period),
        ..Default::default()
    }
}

/// Deployment for one stack service.
pub(crate) fn build_service_deployment(
    stack: &PRStack,
    namespace: &str,
    service: &str,
    env: Vec<EnvVar>,
    config: &OperatorConfig,
) -> Deployment {
    let stack_id = &stack.spec.stack_id;
    let replicas = if stack.spec.active { 1 } else { 0 };
    let tag = names::effective_tag(stack.spec.image_tag.as_deref(), stack_id);
    let image = names::image_reference(&config.registry, &config.registry_org, service, &tag);

    let labels = resources::common_labels(service, stack_id);
    let selector = resources::selector_labels(service);

    let container = Container {
        name: service.to_string(),
        image: Some(image),
        ports: Some(vec![ContainerPort {
            container_port: SERVICE_PORT,
            name: Some("http".to_string()),
            ..Default::default()
        }]),
        env: Some(env),
        resources: Some(resource_requirements(stack.spec.resource_limits.as_ref())),
        liveness_probe: Some(http_probe("/health", 30, 10)),
        readiness_probe: Some(http_probe("/ready", 5, 5)),
        ..Default::default()
    };

    let mut pod_labels = selector.clone();
    pod_labels.insert("shop.pilab.hu/stack-id".to_string(), stack_id.clone());

    Deployment {
        metadata: ObjectMeta {
            name: Some(service.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            owner_references: Some(vec![resources::owner_reference(stack)]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            selector: LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    image_pull_secrets: Some(vec![LocalObjectReference {
                        name: REGISTRY_SECRET_NAME.to_string(),
                    }]),
                    containers: vec![container],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// ClusterIP Service exposing one workload on port 8080.
pub(crate) fn build_workload_service(stack: &PRStack, namespace: &str, service: &str) -> Service {
    let mut annotations = BTreeMap::new();
    annotations.insert("prometheus.io/scrape".to_string(), "true".to_string());
    annotations.insert("prometheus.io/port".to_string(), SERVICE_PORT.to_string());
    annotations.insert("prometheus.io/path".to_string(), "/metrics".to_string());

    Service {
        metadata: ObjectMeta {
            name: Some(service.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(resources::common_labels(service, &stack.spec.stack_id)),
            annotations: Some(annotations),
            owner_references: Some(vec![resources::owner_reference(stack)]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(resources::selector_labels(service)),
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                port: SERVICE_PORT,
                target_port: Some(IntOrString::Int(SERVICE_PORT)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Ingress for the front-door service, bound to the effective hostname.
pub(crate) fn build_ingress(
    stack: &PRStack,
    namespace: &str,
    service: &str,
    config: &OperatorConfig,
) -> Ingress {
    let host = names::hostname(
        stack.spec.custom_domain.as_deref(),
        &stack.spec.stack_id,
        &config.base_domain,
    );

    let mut annotations = BTreeMap::new();
    if !config.cert_manager_issuer.is_empty() {
        annotations.insert(
            "cert-manager.io/cluster-issuer".to_string(),
            config.cert_manager_issuer.clone(),
        );
    }
    if !config.ingress_entrypoints.is_empty() {
        annotations.insert(
            "traefik.ingress.kubernetes.io/router.entrypoints".to_string(),
            config.ingress_entrypoints.clone(),
        );
    }
    if !config.ingress_router_tls.is_empty() {
        annotations.insert(
            "traefik.ingress.kubernetes.io/router.tls".to_string(),
            config.ingress_router_tls.clone(),
        );
    }
    if config.ingress_ssl_redirect {
        annotations.insert(
            "ingress.kubernetes.io/ssl-redirect".to_string(),
            "true".to_string(),
        );
    }

    let tls_secret = match (&stack.spec.ingress_tls_secret_ref, config.cert_manager_issuer.is_empty()) {
        (Some(secret_ref), _) if !secret_ref.is_empty() => Some(secret_ref.clone()),
        (_, false) => Some(format!("{}-tls", service)),
        _ => None,
    };

    let path_prefix = names::logical_name(service);

    Ingress {
        metadata: ObjectMeta {
            name: Some(service.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(resources::common_labels(service, &stack.spec.stack_id)),
            annotations: Some(annotations),
            owner_references: Some(vec![resources::owner_reference(stack)]),
            ..Default::default()
        },
        spec: Some(IngressSpec {
            ingress_class_name: Some(config.ingress_class.clone()),
            rules: Some(vec![IngressRule {
                host: Some(host.clone()),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some(format!("/{}", path_prefix)),
                        path_type: "Prefix".to_string(),
                        backend: IngressBackend {
                            service: Some(IngressServiceBackend {
                                name: service.to_string(),
                                port: Some(ServiceBackendPort {
                                    number: Some(SERVICE_PORT),
                                    ..Default::default()
                                }),
                            }),
                            ..Default::default()
                        },
                    }],
                }),
            }]),
            tls: tls_secret.map(|secret_name| {
                vec![IngressTLS {
                    hosts: Some(vec![host]),
                    secret_name: Some(secret_name),
                }]
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn tier_deployment(
    stack: &PRStack,
    namespace: &str,
    app: &str,
    image: &str,
    args: Vec<String>,
    ports: Vec<(i32, &str)>,
) -> Deployment {
    let labels = resources::common_labels(app, &stack.spec.stack_id);
    let selector = resources::selector_labels(app);

    let container = Container {
        name: app.to_string(),
        image: Some(image.to_string()),
        args: Some(args),
        ports: Some(
            ports
                .iter()
                .map(|(port, name)| ContainerPort {
                    container_port: *port,
                    name: Some(name.to_string()),
                    ..Default::default()
                })
                .collect(),
        ),
        volume_mounts: Some(vec![VolumeMount {
            name: "data".to_string(),
            mount_path: "/data".to_string(),
            ..Default::default()
        }]),
        resources: Some(resource_requirements(None)),
        ..Default::default()
    };

    Deployment {
        metadata: ObjectMeta {
            name: Some(app.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            owner_references: Some(vec![resources::owner_reference(stack)]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(selector.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(selector),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: Some(vec![Volume {
                        name: "data".to_string(),
                        empty_dir: Some(EmptyDirVolumeSource::default()),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn tier_service(stack: &PRStack, namespace: &str, app: &str, ports: Vec<(i32, &str)>) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(app.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(resources::common_labels(app, &stack.spec.stack_id)),
            owner_references: Some(vec![resources::owner_reference(stack)]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(resources::selector_labels(app)),
            ports: Some(
                ports
                    .iter()
                    .map(|(port, name)| ServicePort {
                        name: Some(name.to_string()),
                        port: *port,
                        target_port: Some(IntOrString::Int(*port)),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn build_bus_deployment(stack: &PRStack, namespace: &str) -> Deployment {
    tier_deployment(
        stack,
        namespace,
        "message-bus",
        "nats:2.10-alpine",
        vec!["--jetstream".to_string(), "--store_dir=/data".to_string()],
        vec![(4222, "client"), (8222, "monitor")],
    )
}

pub(crate) fn build_bus_service(stack: &PRStack, namespace: &str) -> Service {
    tier_service(stack, namespace, "message-bus", vec![(4222, "client"), (8222, "monitor")])
}

pub(crate) fn build_cache_deployment(stack: &PRStack, namespace: &str) -> Deployment {
    tier_deployment(
        stack,
        namespace,
        "cache",
        "redis:7-alpine",
        vec![
            "redis-server".to_string(),
            "--appendonly".to_string(),
            "yes".to_string(),
            "--maxmemory".to_string(),
            "256mb".to_string(),
            "--maxmemory-policy".to_string(),
            "allkeys-lru".to_string(),
        ],
        vec![(6379, "redis")],
    )
}

pub(crate) fn build_cache_service(stack: &PRStack, namespace: &str) -> Service {
    tier_service(stack, namespace, "cache", vec![(6379, "redis")])
}

/// PVC backing the backup archive path.
pub(crate) fn build_backup_pvc(stack: &PRStack, namespace: &str) -> PersistentVolumeClaim {
    let backup = stack.spec.backup_config.clone().unwrap_or_default();
    let size = backup.storage_size.unwrap_or_else(|| "10Gi".to_string());
    let storage_class = backup.storage_class.unwrap_or_else(|| "standard".to_string());

    let mut requests = BTreeMap::new();
    requests.insert("storage".to_string(), Quantity(size));

    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(BACKUP_PVC_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(resources::common_labels("backup-store", &stack.spec.stack_id)),
            owner_references: Some(vec![resources::owner_reference(stack)]),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: Some(storage_class),
            resources: Some(VolumeResourceRequirements {
                requests: Some(requests),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stack(spec_json: &str) -> PRStack {
        PRStack::new("test", serde_json::from_str(spec_json).unwrap())
    }

    #[test]
    fn test_deployment_replicas_follow_active() {
        let config = OperatorConfig::default();
        let active = stack(r#"{"stackID": "42", "active": true}"#);
        let deployment =
            build_service_deployment(&active, "pr-42-shop-pilab-hu", "products-service", vec![], &config);
        assert_eq!(deployment.spec.as_ref().unwrap().replicas, Some(1));

        let inactive = stack(r#"{"stackID": "42", "active": false}"#);
        let deployment =
            build_service_deployment(&inactive, "pr-42-shop-pilab-hu", "products-service", vec![], &config);
        assert_eq!(deployment.spec.as_ref().unwrap().replicas, Some(0));
    }

    #[test]
    fn test_deployment_image_and_probes() {
        let config = OperatorConfig::default();
        let s = stack(r#"{"stackID": "42"}"#);
        let deployment =
            build_service_deployment(&s, "pr-42-shop-pilab-hu", "products-service", vec![], &config);

        let pod = deployment.spec.as_ref().unwrap().template.spec.as_ref().unwrap();
        let container = &pod.containers[0];
        assert_eq!(
            container.image.as_deref(),
            Some("ghcr.io/pilab-dev/products-service:pr-42")
        );

        let liveness = container.liveness_probe.as_ref().unwrap();
        assert_eq!(
            liveness.http_get.as_ref().unwrap().path.as_deref(),
            Some("/health")
        );
        let readiness = container.readiness_probe.as_ref().unwrap();
        assert_eq!(
            readiness.http_get.as_ref().unwrap().path.as_deref(),
            Some("/ready")
        );

        // Image-pull secret referenced unconditionally by name
        let pull = pod.image_pull_secrets.as_ref().unwrap();
        assert_eq!(pull[0].name, REGISTRY_SECRET_NAME);
    }

    #[test]
    fn test_deployment_custom_image_tag() {
        let config = OperatorConfig::default();
        let s = stack(r#"{"stackID": "42", "imageTag": "v1.2.3"}"#);
        let deployment = build_service_deployment(&s, "ns", "auth-service", vec![], &config);
        let image = deployment.spec.unwrap().template.spec.unwrap().containers[0]
            .image
            .clone()
            .unwrap();
        assert_eq!(image, "ghcr.io/pilab-dev/auth-service:v1.2.3");
    }

    #[test]
    fn test_resource_limits_defaults_and_overrides() {
        let defaults = resource_requirements(None);
        let limits = defaults.limits.unwrap();
        assert_eq!(limits["cpu"].0, "500m");
        assert_eq!(limits["memory"].0, "512Mi");
        let requests = defaults.requests.unwrap();
        assert_eq!(requests["cpu"].0, "0m");

        let custom = ResourceLimits {
            cpu_limit: Some("2".to_string()),
            memory_limit: Some("1Gi".to_string()),
            storage_limit: None,
        };
        let reqs = resource_requirements(Some(&custom));
        assert_eq!(reqs.limits.unwrap()["cpu"].0, "2");
    }

    #[test]
    fn test_ingress_host_and_path() {
        let config = OperatorConfig::default();
        let s = stack(r#"{"stackID": "42"}"#);
        let ingress = build_ingress(&s, "ns", "graphql-service", &config);

        let spec = ingress.spec.as_ref().unwrap();
        assert_eq!(spec.ingress_class_name.as_deref(), Some("traefik"));
        let rule = &spec.rules.as_ref().unwrap()[0];
        assert_eq!(rule.host.as_deref(), Some("pr-42.shop.pilab.hu"));
        let path = &rule.http.as_ref().unwrap().paths[0];
        assert_eq!(path.path.as_deref(), Some("/graphql"));
        assert_eq!(path.path_type, "Prefix");
        let backend = path.backend.service.as_ref().unwrap();
        assert_eq!(backend.port.as_ref().unwrap().number, Some(8080));

        // No TLS ref and no issuer: no TLS block
        assert!(spec.tls.is_none());
    }

    #[test]
    fn test_ingress_tls_iff_secret_ref() {
        let config = OperatorConfig::default();
        let s = stack(r#"{"stackID": "42", "ingressTLSSecretRef": "wildcard-tls", "customDomain": "magicshop.hu"}"#);
        let ingress = build_ingress(&s, "ns", "graphql-service", &config);

        let spec = ingress.spec.as_ref().unwrap();
        let tls = &spec.tls.as_ref().unwrap()[0];
        assert_eq!(tls.secret_name.as_deref(), Some("wildcard-tls"));
        assert_eq!(tls.hosts.as_ref().unwrap()[0], "magicshop.hu");
        assert_eq!(
            spec.rules.as_ref().unwrap()[0].host.as_deref(),
            Some("magicshop.hu")
        );
    }

    #[test]
    fn test_ingress_tls_from_cluster_issuer() {
        let config = OperatorConfig {
            cert_manager_issuer: "letsencrypt".to_string(),
            ..Default::default()
        };
        let s = stack(r#"{"stackID": "42"}"#);
        let ingress = build_ingress(&s, "ns", "graphql-service", &config);

        let spec = ingress.spec.as_ref().unwrap();
        let tls = &spec.tls.as_ref().unwrap()[0];
        assert_eq!(tls.secret_name.as_deref(), Some("graphql-service-tls"));
        let annotations = ingress.metadata.annotations.as_ref().unwrap();
        assert_eq!(annotations["cert-manager.io/cluster-issuer"], "letsencrypt");
    }

    #[test]
    fn test_workload_service_scrape_annotations() {
        let s = stack(r#"{"stackID": "42"}"#);
        let service = build_workload_service(&s, "ns", "products-service");
        let annotations = service.metadata.annotations.as_ref().unwrap();
        assert_eq!(annotations["prometheus.io/scrape"], "true");
        let port = &service.spec.as_ref().unwrap().ports.as_ref().unwrap()[0];
        assert_eq!(port.port, 8080);
    }

    #[test]
    fn test_backup_pvc_defaults() {
        let s = stack(r#"{"stackID": "42", "backupConfig": {"enabled": true}}"#);
        let pvc = build_backup_pvc(&s, "ns");
        assert_eq!(pvc.metadata.name.as_deref(), Some(BACKUP_PVC_NAME));
        let spec = pvc.spec.as_ref().unwrap();
        assert_eq!(spec.storage_class_name.as_deref(), Some("standard"));
        let requests = spec.resources.as_ref().unwrap().requests.as_ref().unwrap();
        assert_eq!(requests["storage"].0, "10Gi");
    }

    #[test]
    fn test_backup_pvc_spec_overrides() {
        let s = stack(
            r#"{"stackID": "42", "backupConfig": {"enabled": true, "storageSize": "20Gi", "storageClass": "fast"}}"#,
        );
        let pvc = build_backup_pvc(&s, "ns");
        let spec = pvc.spec.as_ref().unwrap();
        assert_eq!(spec.storage_class_name.as_deref(), Some("fast"));
        assert_eq!(
            spec.resources.as_ref().unwrap().requests.as_ref().unwrap()["storage"].0,
            "20Gi"
        );
    }

    #[test]
    fn test_tier_builders() {
        let s = stack(r#"{"stackID": "42"}"#);
        let bus = build_bus_deployment(&s, "ns");
        assert_eq!(bus.metadata.name.as_deref(), Some("message-bus"));
        assert_eq!(bus.spec.as_ref().unwrap().replicas, Some(1));

        let cache = build_cache_deployment(&s, "ns");
        let args = cache.spec.unwrap().template.spec.unwrap().containers[0]
            .args
            .clone()
            .unwrap();
        assert!(args.contains(&"redis-server".to_string()));
    }

    #[test]
    fn test_docker_config_json_shape() {
        let config = OperatorConfig {
            registry_user: "bot".to_string(),
            registry_token: "token".to_string(),
            registry_email: "bot@example.com".to_string(),
            ..Default::default()
        };
        let json: serde_json::Value =
            serde_json::from_str(&docker_config_json(&config).unwrap()).unwrap();
        let entry = &json["auths"]["ghcr.io"];
        assert_eq!(entry["username"], "bot");
        assert!(entry["auth"].as_str().unwrap().len() > 0);
    }

    #[test]
    fn test_tier_configmaps_carry_status_coordinates() {
        let status = StackStatus {
            db_credentials: Some(crate::crd::DatabaseCredentials {
                user: "pishop_pr_42".to_string(),
                password: "p".to_string(),
                connection_string: "mongodb://pishop_pr_42:p@db:27017".to_string(),
                databases: vec!["pishop_products_pr_42".to_string()],
            }),
            message_bus: Some(crate::crd::MessageBusCoordinates {
                subject_prefix: "pishop.pr.42".to_string(),
                url: "nats://message-bus.ns.svc.cluster.local:4222".to_string(),
            }),
            cache: Some(crate::crd::CacheCoordinates {
                key_prefix: "pishop:pr:42:".to_string(),
                url: "redis://cache.ns.svc.cluster.local:6379".to_string(),
            }),
            ..Default::default()
        };
        let maps = tier_configmaps(&status);
        assert_eq!(maps.len(), 3);
        let bus = maps.iter().find(|(n, _)| n == "bus-config").unwrap();
        assert_eq!(bus.1["subjectPrefix"], "pishop.pr.42");
        let db = maps.iter().find(|(n, _)| n == "db-config").unwrap();
        assert_eq!(db.1["databases"], "pishop_products_pr_42");
    }
}

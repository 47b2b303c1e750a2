//! PRStack Custom Resource Definition
//!
//! A cluster-scoped resource describing one per-pull-request environment:
//! which services to run, how to expose them, and how to back them up.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// PRStack is the Schema for the prstacks API
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "shop.pilab.hu",
    version = "v1alpha1",
    kind = "PRStack",
    status = "StackStatus",
    shortname = "prs",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"StackID","type":"string","jsonPath":".spec.stackID"}"#,
    printcolumn = r#"{"name":"Environment","type":"string","jsonPath":".spec.environment"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct StackSpec {
    /// Short identifier disambiguating this environment; participates in all derived names
    #[serde(rename = "stackID")]
    pub stack_id: String,

    /// Image tag applied to every service image; defaults to `pr-<stackID>`
    #[serde(default)]
    pub image_tag: Option<String>,

    /// Overrides the default ingress host `pr-<stackID>.<baseDomain>`
    #[serde(default)]
    pub custom_domain: Option<String>,

    /// TLS key/cert secret for the ingress; unset leaves the ingress plain
    #[serde(default, rename = "ingressTLSSecretRef")]
    pub ingress_tls_secret_ref: Option<String>,

    /// When false, every Deployment is scaled to 0 replicas; when true, to 1
    #[serde(default = "default_active")]
    pub active: bool,

    /// Advancing this timestamp re-stamps every pod template to force a rollout
    #[serde(default)]
    pub deployed_at: Option<String>,

    /// Workload set to deploy; empty means the built-in default set
    #[serde(default)]
    pub services: Vec<String>,

    /// Free-form environment label, surfaced in printer columns and service env
    #[serde(default)]
    pub environment: Option<String>,

    /// Per-container resource limits; defaults apply when absent
    #[serde(default)]
    pub resource_limits: Option<ResourceLimits>,

    /// Backup pipeline configuration
    #[serde(default)]
    pub backup_config: Option<BackupConfig>,

    /// Override the operator-wide database admin connection tuple
    #[serde(default, rename = "dbURI")]
    pub db_uri: Option<String>,
    #[serde(default)]
    pub db_user: Option<String>,
    #[serde(default)]
    pub db_password: Option<String>,
}

fn default_active() -> bool {
    true
}

/// Resource constraints applied to each service container
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    /// CPU limit per service (e.g. "500m")
    #[serde(default)]
    pub cpu_limit: Option<String>,
    /// Memory limit per service (e.g. "512Mi")
    #[serde(default)]
    pub memory_limit: Option<String>,
    /// Storage limit for databases
    #[serde(default)]
    pub storage_limit: Option<String>,
}

/// Backup pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct BackupConfig {
    /// Whether backups are enabled for this stack
    #[serde(default)]
    pub enabled: bool,
    /// 5-field cron expression for scheduled backups
    #[serde(default)]
    pub cron_schedule: Option<String>,
    /// Days to keep backups; 0 disables retention cleanup
    #[serde(default)]
    pub retention_days: i32,
    /// Storage class of the backup PVC
    #[serde(default)]
    pub storage_class: Option<String>,
    /// Size of the backup PVC
    #[serde(default)]
    pub storage_size: Option<String>,
}

/// Observed state of a PRStack
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct StackStatus {
    /// Current lifecycle phase
    #[serde(default)]
    pub phase: StackPhase,
    /// Human-readable progress or failure message
    #[serde(default)]
    pub message: Option<String>,
    /// First time the controller observed this stack
    #[serde(default)]
    pub created_at: Option<String>,
    /// Last time the stack was created or reactivated
    #[serde(default)]
    pub last_active_at: Option<String>,
    /// `spec.deployedAt` value of the last completed rollout
    #[serde(default)]
    pub last_deployed_at: Option<String>,
    /// Per-stack database principal and created databases
    #[serde(default)]
    pub db_credentials: Option<DatabaseCredentials>,
    /// Message-bus coordinates reserved for this stack
    #[serde(default)]
    pub message_bus: Option<MessageBusCoordinates>,
    /// Cache coordinates reserved for this stack
    #[serde(default)]
    pub cache: Option<CacheCoordinates>,
    /// Per-service deployment results
    #[serde(default)]
    pub services: Vec<ServiceStatus>,
    /// Conditions representing stack state
    #[serde(default)]
    pub conditions: Vec<StackCondition>,
    /// Backup pipeline status
    #[serde(default)]
    pub backup: Option<BackupStatus>,
    /// Last observed generation
    #[serde(default)]
    pub observed_generation: Option<i64>,
}

/// Phase of the stack lifecycle
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub enum StackPhase {
    /// Freshly observed, nothing provisioned yet
    #[default]
    Init,
    /// External resources (namespace, databases, credentials) being created
    Provisioning,
    /// Workloads being rolled out
    Deploying,
    /// All services running
    Running,
    /// Some services failed, the rest are serving
    Degraded,
    /// Scaled to zero; databases and secrets retained
    Inactive,
    /// Teardown in progress
    Cleaning,
    /// Teardown finished; finalizer about to be removed
    Cleaned,
    /// Terminal failure awaiting a spec edit
    Failed,
}

impl std::fmt::Display for StackPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StackPhase::Init => "Init",
            StackPhase::Provisioning => "Provisioning",
            StackPhase::Deploying => "Deploying",
            StackPhase::Running => "Running",
            StackPhase::Degraded => "Degraded",
            StackPhase::Inactive => "Inactive",
            StackPhase::Cleaning => "Cleaning",
            StackPhase::Cleaned => "Cleaned",
            StackPhase::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// Database principal created for one stack
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseCredentials {
    /// Per-stack user name
    #[serde(default)]
    pub user: String,
    /// Generated password
    #[serde(default)]
    pub password: String,
    /// Admin URI with the per-stack credentials injected
    #[serde(default)]
    pub connection_string: String,
    /// Databases created for this stack
    #[serde(default)]
    pub databases: Vec<String>,
}

/// Message-bus coordinates for one stack
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct MessageBusCoordinates {
    /// Subject prefix reserved for this stack
    #[serde(default)]
    pub subject_prefix: String,
    /// In-namespace endpoint
    #[serde(default)]
    pub url: String,
}

/// Cache coordinates for one stack
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct CacheCoordinates {
    /// Key prefix reserved for this stack
    #[serde(default)]
    pub key_prefix: String,
    /// In-namespace endpoint
    #[serde(default)]
    pub url: String,
}

/// Deployment result of a single service
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    /// Workload name
    pub name: String,
    /// "Running" or "Failed"
    pub status: String,
    /// Detail about the result
    #[serde(default)]
    pub message: Option<String>,
}

/// Condition of the stack
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StackCondition {
    /// Type of condition (Ready, Progressing, Degraded)
    pub r#type: String,
    /// Status of the condition (True, False, Unknown)
    pub status: String,
    /// Last time the condition transitioned
    #[serde(default)]
    pub last_transition_time: Option<String>,
    /// Reason for the condition
    #[serde(default)]
    pub reason: Option<String>,
    /// Human-readable message
    #[serde(default)]
    pub message: Option<String>,
}

/// Backup pipeline status
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct BackupStatus {
    /// Completion time of the last successful backup
    #[serde(default)]
    pub last_backup_time: Option<String>,
    /// Name of the last successful backup
    #[serde(default)]
    pub last_backup_name: Option<String>,
    /// Number of backups available
    #[serde(default)]
    pub backup_count: i32,
    /// Size of the last backup archive
    #[serde(default)]
    pub last_backup_size: Option<String>,
    /// In-flight and recent backup/restore jobs
    #[serde(default)]
    pub backup_jobs: Vec<BackupJobRecord>,
}

/// Record of one backup or restore job
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupJobRecord {
    /// Job name
    pub name: String,
    /// "backup" or "restore"
    pub r#type: String,
    /// "Running", "Completed" or "Failed"
    pub status: String,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub completion_time: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_defaults() {
        let spec: StackSpec = serde_json::from_str(r#"{"stackID": "42"}"#).unwrap();
        assert_eq!(spec.stack_id, "42");
        assert!(spec.active);
        assert!(spec.services.is_empty());
        assert!(spec.image_tag.is_none());
        assert!(spec.backup_config.is_none());
    }

    #[test]
    fn test_spec_field_spelling() {
        let spec = StackSpec {
            stack_id: "42".to_string(),
            db_uri: Some("mongodb://db:27017".to_string()),
            ..serde_json::from_str(r#"{"stackID": "x"}"#).unwrap()
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert!(json.get("stackID").is_some());
        assert!(json.get("dbURI").is_some());
        assert!(json.get("stackId").is_none());
    }

    #[test]
    fn test_phase_default_is_init() {
        let status = StackStatus::default();
        assert_eq!(status.phase, StackPhase::Init);
        assert_eq!(status.backup.map(|b| b.backup_count), None);
    }

    #[test]
    fn test_backup_config_parsing() {
        let config: BackupConfig = serde_json::from_str(
            r#"{"enabled": true, "cronSchedule": "0 2 * * *", "retentionDays": 7, "storageSize": "10Gi"}"#,
        )
        .unwrap();
        assert!(config.enabled);
        assert_eq!(config.retention_days, 7);
        assert_eq!(config.cron_schedule.as_deref(), Some("0 2 * * *"));
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(StackPhase::Provisioning.to_string(), "Provisioning");
        assert_eq!(StackPhase::Cleaned.to_string(), "Cleaned");
    }
}

//! Backup dispatcher: one-shot backup/restore Jobs plus object-store
//! enumeration and retention.
//!
//! The Jobs run a database client image with a generated shell script; the
//! controller only dispatches them and reflects their state onto the stack
//! status. Listing and retention work against the real storage backend.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::TryStreamExt;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, EnvVarSource, PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec,
    SecretKeySelector, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, ListParams, PostParams};
use kube::Client;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use tracing::{debug, info, warn};

use crate::config::OperatorConfig;
use crate::crd::{BackupJobRecord, BackupStatus, PRStack};
use crate::error::{OperatorError, Result};
use crate::names;
use crate::resources::{self, BACKUP_PVC_NAME, DB_SECRET_NAME};

const BACKUP_IMAGE: &str = "mongo:7.0";
const JOB_TTL_SECONDS: i32 = 3600;
const JOB_KIND_LABEL: &str = "shop.pilab.hu/job-kind";
const BACKUP_NAME_LABEL: &str = "shop.pilab.hu/backup-name";

pub struct BackupDispatcher {
    client: Client,
    store: Option<Arc<dyn ObjectStore>>,
    namespace_suffix: String,
}

/// Compacted timestamp used in job names, archive keys and `backupName`.
pub fn backup_stamp(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d-%H%M%S").to_string()
}

/// Terminal/running phase of a Job from its counters.
pub fn job_phase(succeeded: i32, failed: i32, active: i32) -> &'static str {
    if succeeded > 0 {
        "Completed"
    } else if failed > 0 && active == 0 {
        "Failed"
    } else {
        "Running"
    }
}

/// Keys under a stack's backup prefix older than the cutoff.
pub fn expired_keys(objects: &[(String, DateTime<Utc>)], cutoff: DateTime<Utc>) -> Vec<String> {
    objects
        .iter()
        .filter(|(_, modified)| *modified < cutoff)
        .map(|(key, _)| key.clone())
        .collect()
}

impl BackupDispatcher {
    pub fn new(client: Client, config: &OperatorConfig) -> Result<Self> {
        let store: Option<Arc<dyn ObjectStore>> = if config.backup_bucket.is_empty() {
            None
        } else {
            let s3 = AmazonS3Builder::from_env()
                .with_bucket_name(&config.backup_bucket)
                .build()?;
            Some(Arc::new(s3))
        };
        Ok(Self {
            client,
            store,
            namespace_suffix: config.namespace_suffix.clone(),
        })
    }

    fn namespace(&self, stack: &PRStack) -> String {
        names::namespace_name(&stack.spec.stack_id, &self.namespace_suffix)
    }

    /// Dispatch a backup Job for every database recorded in status.
    /// Returns the backup name.
    pub async fn create_backup(&self, stack: &PRStack) -> Result<String> {
        let credentials = stack
            .status
            .as_ref()
            .and_then(|s| s.db_credentials.as_ref())
            .ok_or_else(|| {
                OperatorError::Inconsistency("database credentials not recorded in status".to_string())
            })?;

        let stack_id = &stack.spec.stack_id;
        let backup_name = backup_stamp(Utc::now());
        let job_name = format!("backup-{}-{}", stack_id, backup_name);
        let namespace = self.namespace(stack);

        let script = backup_script(&credentials.databases);
        let job = self.build_job(
            stack,
            &namespace,
            &job_name,
            &backup_name,
            "backup",
            "db-backup",
            script,
        );

        let jobs: Api<Job> = Api::namespaced(self.client.clone(), &namespace);
        jobs.create(&PostParams::default(), &job).await?;

        info!(stack = %stack_id, job = %job_name, "Created backup job");
        Ok(backup_name)
    }

    /// Dispatch the symmetric restore Job for a named backup.
    pub async fn restore_backup(&self, stack: &PRStack, backup_name: &str) -> Result<String> {
        let credentials = stack
            .status
            .as_ref()
            .and_then(|s| s.db_credentials.as_ref())
            .ok_or_else(|| {
                OperatorError::Inconsistency("database credentials not recorded in status".to_string())
            })?;

        let stack_id = &stack.spec.stack_id;
        let job_name = format!("restore-{}-{}", stack_id, backup_name);
        let namespace = self.namespace(stack);

        let script = restore_script(&credentials.databases);
        let job = self.build_job(
            stack,
            &namespace,
            &job_name,
            backup_name,
            "restore",
            "db-restore",
            script,
        );

        let jobs: Api<Job> = Api::namespaced(self.client.clone(), &namespace);
        jobs.create(&PostParams::default(), &job).await?;

        info!(stack = %stack_id, job = %job_name, backup = %backup_name, "Created restore job");
        Ok(job_name)
    }

    /// Enumerate backups for a stack from the storage backend.
    pub async fn list_backups(&self, stack_id: &str) -> Result<Vec<String>> {
        let store = self.store()?;
        let prefix = ObjectPath::from(names::backup_prefix(stack_id));
        let objects: Vec<_> = store.list(Some(&prefix)).try_collect().await?;

        let mut backups: Vec<String> = objects
            .iter()
            .filter_map(|meta| {
                meta.location
                    .filename()
                    .and_then(|name| name.strip_suffix(".tar.gz"))
                    .map(|name| name.to_string())
            })
            .collect();
        backups.sort();
        Ok(backups)
    }

    /// Delete every object under a stack's backup prefix older than the
    /// retention cutoff. Returns the number of deleted objects.
    pub async fn cleanup_old_backups(&self, stack_id: &str, retention_days: i32) -> Result<usize> {
        if retention_days <= 0 {
            return Ok(0);
        }
        let store = self.store()?;
        let prefix = ObjectPath::from(names::backup_prefix(stack_id));
        let objects: Vec<_> = store.list(Some(&prefix)).try_collect().await?;

        let cutoff = Utc::now() - ChronoDuration::days(i64::from(retention_days));
        let listed: Vec<(String, DateTime<Utc>)> = objects
            .iter()
            .map(|meta| (meta.location.to_string(), meta.last_modified))
            .collect();

        let mut deleted = 0;
        for key in expired_keys(&listed, cutoff) {
            store.delete(&ObjectPath::from(key.as_str())).await?;
            debug!(stack = %stack_id, key = %key, "Deleted expired backup object");
            deleted += 1;
        }
        if deleted > 0 {
            info!(stack = %stack_id, deleted, retention_days, "Enforced backup retention");
        }
        Ok(deleted)
    }

    /// Re-read job state and fold it into the stack's backup status.
    pub async fn reflect_jobs(&self, stack: &PRStack) -> Result<BackupStatus> {
        let namespace = self.namespace(stack);
        let stack_id = &stack.spec.stack_id;
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), &namespace);
        let list = jobs
            .list(&ListParams::default().labels(JOB_KIND_LABEL))
            .await?;

        let mut status = stack
            .status
            .as_ref()
            .and_then(|s| s.backup.clone())
            .unwrap_or_default();

        let mut records = Vec::new();
        for job in &list.items {
            let name = job.metadata.name.clone().unwrap_or_default();
            let labels = job.metadata.labels.clone().unwrap_or_default();
            let kind = labels
                .get(JOB_KIND_LABEL)
                .cloned()
                .unwrap_or_else(|| "backup".to_string());
            let backup_name = labels.get(BACKUP_NAME_LABEL).cloned();

            let (succeeded, failed, active, start, completion) = job
                .status
                .as_ref()
                .map(|s| {
                    (
                        s.succeeded.unwrap_or(0),
                        s.failed.unwrap_or(0),
                        s.active.unwrap_or(0),
                        s.start_time.as_ref().map(|t| t.0.to_rfc3339()),
                        s.completion_time.as_ref().map(|t| t.0.to_rfc3339()),
                    )
                })
                .unwrap_or((0, 0, 0, None, None));

            let phase = job_phase(succeeded, failed, active);

            if phase == "Completed" && kind == "backup" {
                let newer = match (&completion, &status.last_backup_time) {
                    (Some(done), Some(last)) => done > last,
                    (Some(_), None) => true,
                    _ => false,
                };
                if newer {
                    status.last_backup_time = completion.clone();
                    status.last_backup_name = backup_name.clone();
                }
            }

            records.push(BackupJobRecord {
                name,
                r#type: kind,
                status: phase.to_string(),
                start_time: start,
                completion_time: completion,
                message: None,
            });
        }
        status.backup_jobs = records;

        if let Ok(store) = self.store() {
            match self.list_backups(stack_id).await {
                Ok(backups) => status.backup_count = backups.len() as i32,
                Err(e) => warn!(stack = %stack_id, error = %e, "Failed to enumerate backups"),
            }
            if let Some(name) = &status.last_backup_name {
                let key = format!("{}/{}.tar.gz", names::backup_prefix(stack_id), name);
                if let Ok(meta) = store.head(&ObjectPath::from(key.as_str())).await {
                    status.last_backup_size = Some(format!("{}B", meta.size));
                }
            }
        } else {
            let completed = status
                .backup_jobs
                .iter()
                .filter(|j| j.r#type == "backup" && j.status == "Completed")
                .count() as i32;
            status.backup_count = status.backup_count.max(completed);
        }

        Ok(status)
    }

    fn store(&self) -> Result<&Arc<dyn ObjectStore>> {
        self.store.as_ref().ok_or_else(|| {
            OperatorError::Configuration("backup object store is not configured".to_string())
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn build_job(
        &self,
        stack: &PRStack,
        namespace: &str,
        job_name: &str,
        backup_name: &str,
        kind: &str,
        app: &str,
        script: String,
    ) -> Job {
        let stack_id = &stack.spec.stack_id;
        let mut labels = resources::common_labels(app, stack_id);
        labels.insert(JOB_KIND_LABEL.to_string(), kind.to_string());
        labels.insert(BACKUP_NAME_LABEL.to_string(), backup_name.to_string());

        let env = vec![
            secret_env("MONGO_URI", "connectionString"),
            secret_env("MONGO_USERNAME", "username"),
            secret_env("MONGO_PASSWORD", "password"),
            plain_env("BACKUP_NAME", backup_name),
            plain_env("STACK_ID", stack_id),
        ];

        let container = Container {
            name: app.to_string(),
            image: Some(BACKUP_IMAGE.to_string()),
            command: Some(vec!["/bin/bash".to_string(), "-c".to_string()]),
            args: Some(vec![script]),
            env: Some(env),
            volume_mounts: Some(vec![VolumeMount {
                name: "backup-storage".to_string(),
                mount_path: "/backup".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        };

        Job {
            metadata: ObjectMeta {
                name: Some(job_name.to_string()),
                namespace: Some(namespace.to_string()),
                labels: Some(labels.clone()),
                owner_references: Some(vec![resources::owner_reference(stack)]),
                ..Default::default()
            },
            spec: Some(JobSpec {
                ttl_seconds_after_finished: Some(JOB_TTL_SECONDS),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        restart_policy: Some("OnFailure".to_string()),
                        containers: vec![container],
                        volumes: Some(vec![Volume {
                            name: "backup-storage".to_string(),
                            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                                claim_name: BACKUP_PVC_NAME.to_string(),
                                ..Default::default()
                            }),
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
}

fn plain_env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

fn secret_env(name: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: DB_SECRET_NAME.to_string(),
                key: key.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Shell script dumping every database and writing the metadata sidecar.
pub fn backup_script(databases: &[String]) -> String {
    let mut script = String::from(
        r#"#!/bin/bash
set -e

echo "Starting backup ${BACKUP_NAME} for stack ${STACK_ID}"

BACKUP_DIR="/backup/backups/${STACK_ID}"
WORK_DIR="${BACKUP_DIR}/${BACKUP_NAME}"
mkdir -p "${WORK_DIR}"

backup_database() {
    local db_name=$1
    echo "Backing up database: ${db_name}"
    mongodump \
        --uri="${MONGO_URI}" \
        --db="${db_name}" \
        --out="${WORK_DIR}" \
        --gzip
}

"#,
    );

    for db in databases {
        script.push_str(&format!("backup_database \"{}\"\n", db));
    }

    script.push_str(
        r#"
cat > "${BACKUP_DIR}/${BACKUP_NAME}.metadata.json" << EOF
{
    "backup_name": "${BACKUP_NAME}",
    "stack_id": "${STACK_ID}",
    "timestamp": "$(date -u +%Y-%m-%dT%H:%M:%SZ)",
    "databases": [
"#,
    );

    for (i, db) in databases.iter().enumerate() {
        if i > 0 {
            script.push_str(",\n");
        }
        script.push_str(&format!("        \"{}\"", db));
    }

    script.push_str(
        r#"
    ]
}
EOF

cd "${BACKUP_DIR}"
tar -czf "${BACKUP_NAME}.tar.gz" "${BACKUP_NAME}"
rm -rf "${BACKUP_NAME}"

echo "Backup completed: ${BACKUP_NAME}.tar.gz ($(du -h ${BACKUP_NAME}.tar.gz | cut -f1))"
"#,
    );

    script
}

/// Shell script extracting an archive, then dropping and restoring each
/// target database.
pub fn restore_script(databases: &[String]) -> String {
    let mut script = String::from(
        r#"#!/bin/bash
set -e

echo "Starting restore of ${BACKUP_NAME} for stack ${STACK_ID}"

BACKUP_DIR="/backup/backups/${STACK_ID}"
WORK_DIR="${BACKUP_DIR}/${BACKUP_NAME}"
cd "${BACKUP_DIR}"

if [ ! -f "${BACKUP_NAME}.tar.gz" ]; then
    echo "Backup archive not found: ${BACKUP_NAME}.tar.gz"
    exit 1
fi

tar -xzf "${BACKUP_NAME}.tar.gz"

restore_database() {
    local db_name=$1
    echo "Restoring database: ${db_name}"
    mongosh "${MONGO_URI}" --eval "db.getSiblingDB('${db_name}').dropDatabase()"
    mongorestore \
        --uri="${MONGO_URI}" \
        --db="${db_name}" \
        --gzip \
        "${WORK_DIR}/${db_name}"
}

"#,
    );

    for db in databases {
        script.push_str(&format!("restore_database \"{}\"\n", db));
    }

    script.push_str(
        r#"
rm -rf "${WORK_DIR}"

echo "Restore completed"
"#,
    );

    script
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_backup_stamp_is_dns_safe() {
        let now = Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();
        let stamp = backup_stamp(now);
        assert_eq!(stamp, "20250102-030405");
        assert!(stamp.chars().all(|c| c.is_ascii_digit() || c == '-'));
    }

    #[test]
    fn test_job_phase() {
        assert_eq!(job_phase(1, 0, 0), "Completed");
        assert_eq!(job_phase(0, 2, 0), "Failed");
        assert_eq!(job_phase(0, 1, 1), "Running");
        assert_eq!(job_phase(0, 0, 1), "Running");
        assert_eq!(job_phase(0, 0, 0), "Running");
    }

    #[test]
    fn test_backup_script_covers_every_database() {
        let dbs = vec![
            "pishop_products_pr_42".to_string(),
            "pishop_orders_pr_42".to_string(),
        ];
        let script = backup_script(&dbs);
        assert!(script.contains("backup_database \"pishop_products_pr_42\""));
        assert!(script.contains("backup_database \"pishop_orders_pr_42\""));
        assert!(script.contains("mongodump"));
        assert!(script.contains("--gzip"));
        assert!(script.contains("metadata.json"));
        assert!(script.contains("\"stack_id\""));
        assert!(script.contains("tar -czf"));
    }

    #[test]
    fn test_restore_script_drops_before_restoring() {
        let dbs = vec!["pishop_products_pr_42".to_string()];
        let script = restore_script(&dbs);
        let drop_at = script.find("dropDatabase").unwrap();
        let restore_at = script.find("mongorestore").unwrap();
        assert!(drop_at < restore_at);
        assert!(script.contains("restore_database \"pishop_products_pr_42\""));
    }

    #[test]
    fn test_expired_keys_respects_cutoff() {
        let cutoff = Utc.with_ymd_and_hms(2025, 1, 10, 0, 0, 0).unwrap();
        let objects = vec![
            (
                "backups/42/20250101-000000.tar.gz".to_string(),
                Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            ),
            (
                "backups/42/20250101-000000.metadata.json".to_string(),
                Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            ),
            (
                "backups/42/20250115-000000.tar.gz".to_string(),
                Utc.with_ymd_and_hms(2025, 1, 15, 0, 0, 0).unwrap(),
            ),
        ];
        let expired = expired_keys(&objects, cutoff);
        assert_eq!(expired.len(), 2);
        assert!(expired.iter().all(|k| k.contains("20250101")));
    }
}

//! Syntactic and semantic validation of a PRStack spec.
//!
//! Runs before the state machine; a rejected spec goes straight to `Failed`
//! and is not requeued until the user edits it.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::crd::{BackupConfig, ResourceLimits, StackSpec};
use crate::error::{OperatorError, Result};
use crate::services;

const MAX_STACK_ID_LEN: usize = 40;
const MAX_IMAGE_TAG_LEN: usize = 128;
const MAX_DOMAIN_LEN: usize = 253;
const MAX_RETENTION_DAYS: i32 = 3650;

static STACK_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").expect("stack id regex"));
static IMAGE_TAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").expect("image tag regex"));
static DOMAIN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(\.[a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)*$")
        .expect("domain regex")
});
static QUANTITY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9]+(\.[0-9]+)?[a-zA-Z]*$").expect("quantity regex"));

/// Validate a PRStack spec, collecting every problem into one error.
pub fn validate(spec: &StackSpec) -> Result<()> {
    let mut problems = Vec::new();

    validate_stack_id(&spec.stack_id, &mut problems);

    if let Some(tag) = spec.image_tag.as_deref() {
        validate_image_tag(tag, &mut problems);
    }

    if let Some(domain) = spec.custom_domain.as_deref() {
        validate_domain(domain, &mut problems);
    }

    for service in &spec.services {
        if !services::is_known_service(service) {
            problems.push(format!("services: unknown service '{}'", service));
        }
    }

    if let Some(limits) = &spec.resource_limits {
        validate_resource_limits(limits, &mut problems);
    }

    if let Some(backup) = &spec.backup_config {
        validate_backup_config(backup, &mut problems);
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(OperatorError::Validation(problems.join("; ")))
    }
}

fn validate_stack_id(stack_id: &str, problems: &mut Vec<String>) {
    if stack_id.is_empty() {
        problems.push("stackID: required".to_string());
        return;
    }
    if !STACK_ID_RE.is_match(stack_id) {
        problems.push("stackID: contains invalid characters".to_string());
    }
    if stack_id.len() > MAX_STACK_ID_LEN {
        problems.push(format!("stackID: too long (max {} characters)", MAX_STACK_ID_LEN));
    }
}

fn validate_image_tag(tag: &str, problems: &mut Vec<String>) {
    if tag.is_empty() {
        return;
    }
    if !IMAGE_TAG_RE.is_match(tag) {
        problems.push("imageTag: contains invalid characters".to_string());
    }
    if tag.len() > MAX_IMAGE_TAG_LEN {
        problems.push(format!("imageTag: too long (max {} characters)", MAX_IMAGE_TAG_LEN));
    }
}

fn validate_domain(domain: &str, problems: &mut Vec<String>) {
    if domain.is_empty() {
        return;
    }
    if !DOMAIN_RE.is_match(domain) {
        problems.push("customDomain: invalid domain format".to_string());
    }
    if domain.len() > MAX_DOMAIN_LEN {
        problems.push(format!("customDomain: too long (max {} characters)", MAX_DOMAIN_LEN));
    }
}

fn validate_quantity(quantity: &str, field: &str, problems: &mut Vec<String>) {
    if !QUANTITY_RE.is_match(quantity) {
        problems.push(format!("{}: invalid resource quantity '{}'", field, quantity));
    }
}

fn validate_resource_limits(limits: &ResourceLimits, problems: &mut Vec<String>) {
    if let Some(cpu) = limits.cpu_limit.as_deref() {
        validate_quantity(cpu, "resourceLimits.cpuLimit", problems);
    }
    if let Some(memory) = limits.memory_limit.as_deref() {
        validate_quantity(memory, "resourceLimits.memoryLimit", problems);
    }
    if let Some(storage) = limits.storage_limit.as_deref() {
        validate_quantity(storage, "resourceLimits.storageLimit", problems);
    }
}

fn validate_backup_config(backup: &BackupConfig, problems: &mut Vec<String>) {
    if backup.enabled {
        if let Some(schedule) = backup.cron_schedule.as_deref() {
            if schedule.split_whitespace().count() != 5 {
                problems.push(
                    "backupConfig.cronSchedule: expected a 5-field cron expression".to_string(),
                );
            }
        }
    }
    if backup.retention_days < 0 || backup.retention_days > MAX_RETENTION_DAYS {
        problems.push(format!(
            "backupConfig.retentionDays: must be in [0, {}]",
            MAX_RETENTION_DAYS
        ));
    }
    if let Some(size) = backup.storage_size.as_deref() {
        validate_quantity(size, "backupConfig.storageSize", problems);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(json: &str) -> StackSpec {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_minimal_spec_is_valid() {
        assert!(validate(&spec(r#"{"stackID": "42"}"#)).is_ok());
    }

    #[test]
    fn test_empty_stack_id_rejected() {
        let err = validate(&spec(r#"{"stackID": ""}"#)).unwrap_err();
        assert!(err.to_string().contains("stackID"));
    }

    #[test]
    fn test_stack_id_character_set() {
        assert!(validate(&spec(r#"{"stackID": "pr.42_a-b"}"#)).is_ok());
        assert!(validate(&spec(r#"{"stackID": "-42"}"#)).is_err());
        assert!(validate(&spec(r#"{"stackID": "42/other"}"#)).is_err());
    }

    #[test]
    fn test_stack_id_length_bound() {
        let long = "a".repeat(41);
        assert!(validate(&spec(&format!(r#"{{"stackID": "{}"}}"#, long))).is_err());
        let ok = "a".repeat(40);
        assert!(validate(&spec(&format!(r#"{{"stackID": "{}"}}"#, ok))).is_ok());
    }

    #[test]
    fn test_image_tag_rules() {
        assert!(validate(&spec(r#"{"stackID": "42", "imageTag": "pr-42-abc123"}"#)).is_ok());
        assert!(validate(&spec(r#"{"stackID": "42", "imageTag": "bad tag"}"#)).is_err());
        let long = "t".repeat(129);
        assert!(validate(&spec(&format!(r#"{{"stackID": "42", "imageTag": "{}"}}"#, long))).is_err());
    }

    #[test]
    fn test_custom_domain_rules() {
        assert!(validate(&spec(r#"{"stackID": "42", "customDomain": "magicshop.hu"}"#)).is_ok());
        assert!(validate(&spec(r#"{"stackID": "42", "customDomain": "-bad.example"}"#)).is_err());
        assert!(validate(&spec(r#"{"stackID": "42", "customDomain": "no spaces.hu"}"#)).is_err());
    }

    #[test]
    fn test_unknown_service_rejected() {
        let err =
            validate(&spec(r#"{"stackID": "42", "services": ["mystery-service"]}"#)).unwrap_err();
        assert!(err.to_string().contains("mystery-service"));
    }

    #[test]
    fn test_resource_quantities() {
        assert!(validate(&spec(
            r#"{"stackID": "42", "resourceLimits": {"cpuLimit": "500m", "memoryLimit": "512Mi"}}"#
        ))
        .is_ok());
        assert!(validate(&spec(
            r#"{"stackID": "42", "resourceLimits": {"cpuLimit": "half a core"}}"#
        ))
        .is_err());
    }

    #[test]
    fn test_backup_config_rules() {
        assert!(validate(&spec(
            r#"{"stackID": "42", "backupConfig": {"enabled": true, "cronSchedule": "0 2 * * *", "retentionDays": 7}}"#
        ))
        .is_ok());
        assert!(validate(&spec(
            r#"{"stackID": "42", "backupConfig": {"enabled": true, "cronSchedule": "hourly"}}"#
        ))
        .is_err());
        assert!(validate(&spec(
            r#"{"stackID": "42", "backupConfig": {"retentionDays": 4000}}"#
        ))
        .is_err());
        assert!(validate(&spec(
            r#"{"stackID": "42", "backupConfig": {"enabled": true, "storageSize": "not-a-size"}}"#
        ))
        .is_err());
    }

    #[test]
    fn test_problems_are_collected() {
        let err = validate(&spec(
            r#"{"stackID": "", "imageTag": "bad tag", "customDomain": "-x"}"#,
        ))
        .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("stackID"));
        // A single validation error carries every problem
        assert!(message.contains(';'));
    }
}

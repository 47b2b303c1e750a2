//! Kubernetes-standard status condition helpers
//!
//! Provides constants and builder functions for the PRStack status conditions
//! following the Kubernetes API conventions.

use chrono::Utc;

// Condition status values
pub const CONDITION_TRUE: &str = "True";
pub const CONDITION_FALSE: &str = "False";
pub const CONDITION_UNKNOWN: &str = "Unknown";

// PRStack condition types
pub const STACK_CONDITION_READY: &str = "Ready";
pub const STACK_CONDITION_PROGRESSING: &str = "Progressing";
pub const STACK_CONDITION_DEGRADED: &str = "Degraded";

/// Finalizer guarding external cleanup (databases, user) before deletion
pub const STACK_FINALIZER: &str = "shop.pilab.hu/finalizer";

/// Build a condition with the current timestamp.
pub fn build_condition(
    condition_type: &str,
    status: &str,
    reason: &str,
    message: &str,
) -> ConditionFields {
    ConditionFields {
        condition_type: condition_type.to_string(),
        status: status.to_string(),
        last_transition_time: Some(Utc::now().to_rfc3339()),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
    }
}

/// Generic condition fields convertible into the CRD condition type.
#[derive(Debug, Clone)]
pub struct ConditionFields {
    pub condition_type: String,
    pub status: String,
    pub last_transition_time: Option<String>,
    pub reason: Option<String>,
    pub message: Option<String>,
}

impl ConditionFields {
    pub fn into_stack_condition(self) -> crate::crd::StackCondition {
        crate::crd::StackCondition {
            r#type: self.condition_type,
            status: self.status,
            last_transition_time: self.last_transition_time,
            reason: self.reason,
            message: self.message,
        }
    }
}

/// Set or update a condition in a list, preserving lastTransitionTime when status hasn't changed.
pub fn set_condition(conditions: &mut Vec<ConditionFields>, new: ConditionFields) {
    if let Some(existing) = conditions
        .iter_mut()
        .find(|c| c.condition_type == new.condition_type)
    {
        if existing.status != new.status {
            *existing = new;
        } else {
            existing.reason = new.reason;
            existing.message = new.message;
        }
    } else {
        conditions.push(new);
    }
}

/// Lift existing CRD conditions back into the generic form for merging.
pub fn from_stack_conditions(conditions: &[crate::crd::StackCondition]) -> Vec<ConditionFields> {
    conditions
        .iter()
        .map(|c| ConditionFields {
            condition_type: c.r#type.clone(),
            status: c.status.clone(),
            last_transition_time: c.last_transition_time.clone(),
            reason: c.reason.clone(),
            message: c.message.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_condition() {
        let cond = build_condition(STACK_CONDITION_READY, CONDITION_TRUE, "AllServicesRunning", "all services up");
        assert_eq!(cond.condition_type, "Ready");
        assert_eq!(cond.status, "True");
        assert!(cond.last_transition_time.is_some());
        assert_eq!(cond.reason.as_deref(), Some("AllServicesRunning"));
    }

    #[test]
    fn test_set_condition_adds_new() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, build_condition("Ready", CONDITION_TRUE, "OK", "ok"));
        assert_eq!(conditions.len(), 1);
    }

    #[test]
    fn test_set_condition_preserves_transition_time_on_same_status() {
        let mut conditions = vec![ConditionFields {
            condition_type: "Ready".to_string(),
            status: CONDITION_TRUE.to_string(),
            last_transition_time: Some("2024-01-01T00:00:00Z".to_string()),
            reason: Some("First".to_string()),
            message: Some("first".to_string()),
        }];

        set_condition(&mut conditions, build_condition("Ready", CONDITION_TRUE, "Second", "second"));

        assert_eq!(conditions.len(), 1);
        // Transition time preserved because status didn't change
        assert_eq!(
            conditions[0].last_transition_time.as_deref(),
            Some("2024-01-01T00:00:00Z")
        );
        assert_eq!(conditions[0].reason.as_deref(), Some("Second"));
    }

    #[test]
    fn test_set_condition_updates_transition_time_on_status_change() {
        let mut conditions = vec![ConditionFields {
            condition_type: "Ready".to_string(),
            status: CONDITION_FALSE.to_string(),
            last_transition_time: Some("2024-01-01T00:00:00Z".to_string()),
            reason: Some("NotReady".to_string()),
            message: Some("not ready".to_string()),
        }];

        set_condition(&mut conditions, build_condition("Ready", CONDITION_TRUE, "AllReady", "all ready"));

        assert_eq!(conditions.len(), 1);
        assert_ne!(
            conditions[0].last_transition_time.as_deref(),
            Some("2024-01-01T00:00:00Z")
        );
    }

    #[test]
    fn test_round_trip_through_crd_type() {
        let cond = build_condition("Degraded", CONDITION_FALSE, "Healthy", "stack healthy");
        let cc = cond.into_stack_condition();
        assert_eq!(cc.r#type, "Degraded");
        let lifted = from_stack_conditions(&[cc]);
        assert_eq!(lifted[0].status, CONDITION_FALSE);
    }
}

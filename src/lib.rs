//! PRStack Kubernetes Operator
//!
//! Reconciles the cluster-scoped `PRStack` resource into a complete
//! per-pull-request environment: an isolated namespace, a database user and
//! per-service databases on a shared cluster, per-stack messaging and cache
//! endpoints, the service deployments, an ingress with optional TLS, and a
//! backup/restore pipeline built out of one-shot jobs.
//!
//! ## Example
//!
//! ```yaml
//! apiVersion: shop.pilab.hu/v1alpha1
//! kind: PRStack
//! metadata:
//!   name: pr-42
//! spec:
//!   stackID: "42"
//!   active: true
//!   services:
//!     - products-service
//! ```

pub mod backup;
pub mod conditions;
pub mod config;
pub mod controllers;
pub mod crd;
pub mod database;
pub mod error;
pub mod http;
pub mod leader_election;
pub mod metrics;
pub mod names;
pub mod resources;
pub mod services;
pub mod validation;

pub use config::OperatorConfig;
pub use controllers::StackController;
pub use crd::{
    BackupConfig, BackupJobRecord, BackupStatus, CacheCoordinates, DatabaseCredentials,
    MessageBusCoordinates, PRStack, ResourceLimits, ServiceStatus, StackCondition, StackPhase,
    StackSpec, StackStatus,
};
pub use error::{OperatorError, Result};

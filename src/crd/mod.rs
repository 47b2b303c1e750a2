//! Custom Resource Definitions for the PRStack operator

mod stack;

pub use stack::{
    BackupConfig, BackupJobRecord, BackupStatus, CacheCoordinates, DatabaseCredentials,
    MessageBusCoordinates, PRStack, ResourceLimits, ServiceStatus, StackCondition, StackPhase,
    StackSpec, StackStatus,
};

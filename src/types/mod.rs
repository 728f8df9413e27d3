//! Core types for the floor kernel.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (ProcessId, ThreadId, InstanceId, etc.)
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Configuration structures consumed at build time

mod config;
mod errors;
mod ids;

pub use config::{
    property_usize, AdministrationConfig, AssetConfig, DependencyConfig, EscalationConfig,
    FlowConfig, FunctionConfig, GovernanceConfig, KernelConfig, ManagedObjectConfig,
    ManagedObjectScope, ManagedObjectSourceConfig, ObservabilityConfig, OfficeConfig, TeamConfig,
};
pub use errors::{Error, Result};
pub use ids::{AssetId, FaultId, InstanceId, ProcessId, ThreadId};

//! # Floor Kernel - Managed Function Execution Kernel
//!
//! Runs configured functions as processes of job-node threads on teams:
//! - Teams (passive, worker pool, one person, tokio) execute job nodes
//! - Managed objects are sourced, pooled and scoped to function, thread or process
//! - Faults escalate through function, office and kernel-wide handlers
//! - Governance and administration duties wrap function execution
//! - Asset monitors park waiting job nodes and expire them on timeout
//!
//! ## Architecture
//!
//! ```text
//!                    ┌─────────────────────────────────────┐
//!   invoke_function  │               Kernel                │
//!        ─────────→  │  ┌────────┐  ┌────────┐  ┌───────┐  │
//!                    │  │ Office │→ │ Thread │→ │ Team  │  │
//!                    │  └────────┘  │ State  │  └───────┘  │
//!                    │              └────────┘             │
//!                    │  ┌─────────────┐  ┌──────────────┐  │
//!                    │  │  Managed    │  │    Asset     │  │
//!                    │  │  Objects    │  │   Monitors   │  │
//!                    │  └─────────────┘  └──────────────┘  │
//!                    └─────────────────────────────────────┘
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod kernel;
pub mod types;

// Internal utilities
pub mod observability;

pub use kernel::{Kernel, KernelBuilder, KernelStatus, Office, ProcessHandle, ProcessOutcome};
pub use types::{Error, KernelConfig, Result};

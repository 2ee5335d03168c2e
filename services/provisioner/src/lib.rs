//! # stratus-provisioner
//!
//! Drives an eventually consistent cloud provider to the states a deployment
//! orchestrator asks for: VMs, persistent disks, snapshots, stemcells.
//!
//! ## Architecture
//!
//! - **Provider**: async trait over the cloud API (in-memory mock for dev and tests)
//! - **Waits**: resource handles converged with `stratus-reconcile`
//! - **Instance Manager**: launch, spot acquisition, compensation on failure
//! - **Registry**: per-instance agent settings over HTTP
//! - **Cloud**: the operation facade, dispatched by the CPI protocol layer

pub mod availability_zone;
pub mod cloud;
pub mod config;
pub mod cpi;
pub mod error;
pub mod instance_manager;
pub mod launch;
pub mod provider;
pub mod registry;
pub mod resources;
pub mod spot;
pub mod wait;

pub use cloud::Cloud;
pub use config::{CloudOptions, Config};
pub use error::{CloudError, Result};

//! Common types for Lattice Azure: CRDs, errors, retry and telemetry

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod retry;
pub mod telemetry;

pub use error::Error;

/// Field manager used for all status writes made by the Azure controllers
pub const AZURE_FIELD_MANAGER: &str = "lattice-azure";

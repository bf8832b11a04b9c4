#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]
//! Api contains the versions of the SpiceDBCluster CRDs.

pub mod v1alpha1;

/// GROUP is the kubernetes API group.
pub static GROUP: &str = "authzed.com";

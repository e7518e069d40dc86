//! Cluster infrastructure CRD definitions
//!
//! Kubernetes Custom Resource Definitions and shared status types for the
//! cluster infrastructure controller:
//! - `AWSCluster`: network, security groups, bastion, load balancer and bucket of one cluster
//! - `AWSMachine`: one compute instance belonging to a cluster
//!
//! The condition model (`conditions`) is pure data with mutation helpers and
//! performs no I/O.

pub mod aws_cluster;
pub mod aws_machine;
pub mod conditions;
pub mod instance;
pub mod network;
pub mod references;

pub use aws_cluster::*;
pub use aws_machine::*;
pub use conditions::{Condition, ConditionSeverity, ConditionStatus};
pub use instance::*;
pub use network::*;
pub use references::*;

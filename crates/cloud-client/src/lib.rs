//! Cloud resource API client
//!
//! Capability interface over the provider's compute, load balancer, object
//! store and event APIs, consumed by the cluster infrastructure controller.
//!
//! # Example
//!
//! ```no_run
//! use cloud_client::{CloudClient, CloudClientTrait, Filter};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = CloudClient::new(
//!     "http://cloud-gateway:8080".to_string(),
//!     "your-api-token".to_string(),
//! )?
//! .with_region("eu-west-1");
//!
//! let subnets = client
//!     .describe_subnets(&[Filter::new("vpc-id", ["vpc-0123"])])
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! "Not found" is reported as `CloudError::NotFound`, distinct from every
//! other failure, so callers can treat absence as a normal result.

pub mod client;
pub mod error;
pub mod models;
#[path = "trait.rs"]
pub mod cloud_trait;
#[cfg(feature = "test-util")]
pub mod mock;

pub use client::CloudClient;
pub use error::CloudError;
pub use models::*;
pub use cloud_trait::CloudClientTrait;
#[cfg(feature = "test-util")]
pub use mock::MockCloudClient;

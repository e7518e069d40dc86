//! Subnet selection for new instances.
//!
//! Strict priority, first match wins:
//! 1. explicit subnet id, which must be part of the cluster network
//! 2. subnet filters, queried against the provider
//! 3. failure domain only: first private subnet in that zone
//! 4. first private subnet

use cloud_client::{CloudClientTrait, Filter};
use crds::{AwsResourceReference, NetworkStatus};
use tracing::debug;

use crate::error::{CloudResultExt, ControllerError};
use crate::resolvers::to_cloud_filters;

/// Pick the subnet an instance is launched into.
///
/// When several subnets match the filters, the first one returned by the
/// provider is used.
pub async fn find_subnet(
    client: &dyn CloudClientTrait,
    network: &NetworkStatus,
    externally_managed: bool,
    subnet: Option<&AwsResourceReference>,
    failure_domain: Option<&str>,
) -> Result<String, ControllerError> {
    if let Some(id) = subnet.and_then(|s| s.id.as_deref()) {
        let found = network.find_subnet(id).ok_or_else(|| {
            ControllerError::FailedDependency(format!("subnet {id} is not part of the cluster network"))
        })?;
        if let Some(zone) = failure_domain {
            if found.availability_zone != zone {
                return Err(ControllerError::FailedDependency(format!(
                    "subnet {id} is in availability zone {}, but failure domain {zone} was requested",
                    found.availability_zone
                )));
            }
        }
        return Ok(found.id.clone());
    }

    if let Some(reference) = subnet.filter(|s| !s.filters.is_empty()) {
        let mut filters = vec![Filter::new("state", ["pending", "available"])];
        if !externally_managed {
            if let Some(vpc_id) = network.vpc_id.as_deref() {
                filters.push(Filter::new("vpc-id", [vpc_id]));
            }
        }
        if let Some(zone) = failure_domain {
            filters.push(Filter::new("availability-zone", [zone]));
        }
        filters.extend(to_cloud_filters(&reference.filters));

        let subnets = client
            .describe_subnets(&filters)
            .await
            .with_operation(|| "describe subnets".to_string())?;
        debug!("Subnet filters matched {} subnets", subnets.len());
        return subnets
            .into_iter()
            .next()
            .map(|s| s.subnet_id)
            .ok_or_else(|| ControllerError::FailedDependency("no subnets matched the subnet filters".to_string()));
    }

    if let Some(zone) = failure_domain {
        return network
            .private_subnets()
            .find(|s| s.availability_zone == zone)
            .map(|s| s.id.clone())
            .ok_or_else(|| {
                ControllerError::FailedDependency(format!("no private subnets available in availability zone {zone}"))
            });
    }

    network
        .private_subnets()
        .next()
        .map(|s| s.id.clone())
        .ok_or_else(|| ControllerError::FailedDependency("no private subnets available".to_string()))
}

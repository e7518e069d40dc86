//! Security group resolution for instances.

use cloud_client::CloudClientTrait;
use crds::{AwsResourceReference, BASTION_ROLE, CONTROL_PLANE_ROLE, NODE_ROLE, NetworkStatus, SecurityGroupRole};

use crate::error::{CloudResultExt, ControllerError};
use crate::resolvers::to_cloud_filters;

/// Group roles an instance of `role` carries
pub fn roles_for(role: &str, managed_control_plane: bool) -> Result<Vec<SecurityGroupRole>, ControllerError> {
    if role == BASTION_ROLE {
        return Ok(vec![SecurityGroupRole::Bastion]);
    }

    let mut roles = vec![SecurityGroupRole::Node];
    if !managed_control_plane {
        roles.push(SecurityGroupRole::Lb);
    }
    match role {
        CONTROL_PLANE_ROLE => roles.push(SecurityGroupRole::ControlPlane),
        NODE_ROLE => {
            if managed_control_plane {
                roles.push(SecurityGroupRole::NodeEksAdditional);
            }
        }
        other => return Err(ControllerError::UnknownRole(other.to_string())),
    }
    Ok(roles)
}

/// Ids of the cluster-managed groups for an instance of `role`.
///
/// Externally managed clusters bring their own groups, so nothing is
/// returned for them. A role without a recorded group means security groups
/// have not been converged yet.
pub fn core_security_groups(
    network: &NetworkStatus,
    role: &str,
    externally_managed: bool,
    managed_control_plane: bool,
) -> Result<Vec<String>, ControllerError> {
    let roles = roles_for(role, managed_control_plane)?;
    if externally_managed {
        return Ok(Vec::new());
    }
    roles
        .into_iter()
        .map(|r| {
            network
                .security_group(r)
                .map(|g| g.id.clone())
                .ok_or_else(|| ControllerError::FailedDependency(format!("{r} security group not available")))
        })
        .collect()
}

/// Ids of additional groups given by id or by filters (first match).
pub async fn additional_security_groups(
    client: &dyn CloudClientTrait,
    references: &[AwsResourceReference],
) -> Result<Vec<String>, ControllerError> {
    let mut ids = Vec::new();
    for reference in references {
        if let Some(id) = &reference.id {
            ids.push(id.clone());
            continue;
        }
        if reference.filters.is_empty() {
            continue;
        }
        let groups = client
            .describe_security_groups(&to_cloud_filters(&reference.filters))
            .await
            .with_operation(|| "describe security groups".to_string())?;
        let group = groups.into_iter().next().ok_or_else(|| {
            ControllerError::FailedDependency("no security group matched the additional security group filters".to_string())
        })?;
        ids.push(group.group_id);
    }
    Ok(ids)
}

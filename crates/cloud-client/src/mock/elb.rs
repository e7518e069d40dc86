//! Load balancer operations for MockCloudClient

use super::MockCloudClient;
use crate::error::CloudError;
use crate::models::*;

pub async fn describe_load_balancer(client: &MockCloudClient, name: &str) -> Result<Option<LoadBalancer>, CloudError> {
    let state = client.lock();
    state.check("DescribeLoadBalancer")?;
    Ok(state.load_balancers.get(name).cloned())
}

pub async fn create_load_balancer(
    client: &MockCloudClient,
    request: CreateLoadBalancerRequest,
) -> Result<LoadBalancer, CloudError> {
    let mut state = client.lock();
    state.check("CreateLoadBalancer")?;
    if state.load_balancers.contains_key(&request.name) {
        return Err(CloudError::api(
            "DuplicateLoadBalancerName",
            format!("load balancer {} already exists", request.name),
        ));
    }

    let mut zones: Vec<String> = Vec::new();
    for subnet_id in &request.subnet_ids {
        let subnet = state
            .subnets
            .get(subnet_id)
            .ok_or_else(|| CloudError::NotFound(format!("Subnet {subnet_id} not found")))?;
        if !zones.contains(&subnet.availability_zone) {
            zones.push(subnet.availability_zone.clone());
        }
    }

    let dns_name = if state.assign_load_balancer_dns {
        format!("{}-{}.{}.elb.amazonaws.com", request.name, state.next_id, client.region)
    } else {
        String::new()
    };
    state.next_id += 1;

    let load_balancer = LoadBalancer {
        name: request.name.clone(),
        dns_name,
        scheme: request.scheme,
        subnet_ids: request.subnet_ids,
        security_group_ids: request.security_group_ids,
        availability_zones: zones,
        listeners: request.listeners,
        tags: request.tags,
    };
    state.record("CreateLoadBalancer", &request.name);
    state.load_balancers.insert(request.name, load_balancer.clone());
    Ok(load_balancer)
}

pub async fn attach_load_balancer_subnets(
    client: &MockCloudClient,
    name: &str,
    subnet_ids: &[String],
) -> Result<(), CloudError> {
    let mut state = client.lock();
    state.check("AttachLoadBalancerToSubnets")?;
    let zones: Vec<String> = subnet_ids
        .iter()
        .filter_map(|id| state.subnets.get(id).map(|s| s.availability_zone.clone()))
        .collect();
    let load_balancer = state
        .load_balancers
        .get_mut(name)
        .ok_or_else(|| CloudError::NotFound(format!("Load balancer {name} not found")))?;
    for subnet_id in subnet_ids {
        if !load_balancer.subnet_ids.contains(subnet_id) {
            load_balancer.subnet_ids.push(subnet_id.clone());
        }
    }
    for zone in zones {
        if !load_balancer.availability_zones.contains(&zone) {
            load_balancer.availability_zones.push(zone);
        }
    }
    state.record("AttachLoadBalancerToSubnets", name);
    Ok(())
}

pub async fn delete_load_balancer(client: &MockCloudClient, name: &str) -> Result<(), CloudError> {
    let mut state = client.lock();
    state.check("DeleteLoadBalancer")?;
    if state.load_balancers.remove(name).is_none() {
        return Err(CloudError::NotFound(format!("Load balancer {name} not found")));
    }
    state.record("DeleteLoadBalancer", name);
    Ok(())
}

//! Compute operations for MockCloudClient
//!
//! Handles VPCs, subnets, security groups, instances, tags, network interfaces and images

use super::MockCloudClient;
use super::filters::matches_all;
use crate::error::CloudError;
use crate::models::*;

pub async fn describe_vpcs(client: &MockCloudClient, filters: &[Filter]) -> Result<Vec<Vpc>, CloudError> {
    let state = client.lock();
    state.check("DescribeVpcs")?;
    Ok(state.vpcs.values().filter(|v| matches_all(*v, filters)).cloned().collect())
}

pub async fn create_vpc(client: &MockCloudClient, request: CreateVpcRequest) -> Result<Vpc, CloudError> {
    let mut state = client.lock();
    state.check("CreateVpc")?;
    let vpc = Vpc {
        vpc_id: state.next_id("vpc"),
        cidr_block: request.cidr_block,
        state: "available".to_string(),
        tags: request.tags,
    };
    state.record("CreateVpc", &vpc.vpc_id);
    state.vpcs.insert(vpc.vpc_id.clone(), vpc.clone());
    Ok(vpc)
}

pub async fn delete_vpc(client: &MockCloudClient, vpc_id: &str) -> Result<(), CloudError> {
    let mut state = client.lock();
    state.check("DeleteVpc")?;
    if !state.vpcs.contains_key(vpc_id) {
        return Err(CloudError::NotFound(format!("VPC {vpc_id} not found")));
    }
    let in_use = state.subnets.values().any(|s| s.vpc_id == vpc_id)
        || state.security_groups.values().any(|g| g.vpc_id == vpc_id);
    if in_use {
        return Err(CloudError::api(
            "DependencyViolation",
            format!("VPC {vpc_id} has dependencies and cannot be deleted"),
        ));
    }
    state.record("DeleteVpc", vpc_id);
    state.vpcs.remove(vpc_id);
    Ok(())
}

pub async fn describe_subnets(client: &MockCloudClient, filters: &[Filter]) -> Result<Vec<Subnet>, CloudError> {
    let state = client.lock();
    state.check("DescribeSubnets")?;
    Ok(state.subnets.values().filter(|s| matches_all(*s, filters)).cloned().collect())
}

pub async fn create_subnet(client: &MockCloudClient, request: CreateSubnetRequest) -> Result<Subnet, CloudError> {
    let mut state = client.lock();
    state.check("CreateSubnet")?;
    if !state.vpcs.contains_key(&request.vpc_id) {
        return Err(CloudError::NotFound(format!("VPC {} not found", request.vpc_id)));
    }
    let subnet = Subnet {
        subnet_id: state.next_id("subnet"),
        vpc_id: request.vpc_id,
        cidr_block: request.cidr_block,
        availability_zone: request.availability_zone,
        state: "available".to_string(),
        map_public_ip_on_launch: request.map_public_ip_on_launch,
        tags: request.tags,
    };
    state.record("CreateSubnet", &subnet.subnet_id);
    state.subnets.insert(subnet.subnet_id.clone(), subnet.clone());
    Ok(subnet)
}

pub async fn delete_subnet(client: &MockCloudClient, subnet_id: &str) -> Result<(), CloudError> {
    let mut state = client.lock();
    state.check("DeleteSubnet")?;
    if state.subnets.remove(subnet_id).is_none() {
        return Err(CloudError::NotFound(format!("Subnet {subnet_id} not found")));
    }
    state.record("DeleteSubnet", subnet_id);
    Ok(())
}

pub async fn describe_security_groups(client: &MockCloudClient, filters: &[Filter]) -> Result<Vec<SecurityGroup>, CloudError> {
    let state = client.lock();
    state.check("DescribeSecurityGroups")?;
    Ok(state.security_groups.values().filter(|g| matches_all(*g, filters)).cloned().collect())
}

pub async fn create_security_group(
    client: &MockCloudClient,
    request: CreateSecurityGroupRequest,
) -> Result<SecurityGroup, CloudError> {
    let mut state = client.lock();
    state.check("CreateSecurityGroup")?;
    let duplicate = state
        .security_groups
        .values()
        .any(|g| g.vpc_id == request.vpc_id && g.group_name == request.group_name);
    if duplicate {
        return Err(CloudError::api(
            "InvalidGroup.Duplicate",
            format!("security group {} already exists", request.group_name),
        ));
    }
    let group = SecurityGroup {
        group_id: state.next_id("sg"),
        group_name: request.group_name,
        vpc_id: request.vpc_id,
        description: request.description,
        ingress_rules: Vec::new(),
        tags: request.tags,
    };
    state.record("CreateSecurityGroup", &group.group_id);
    state.security_groups.insert(group.group_id.clone(), group.clone());
    Ok(group)
}

pub async fn authorize_ingress(client: &MockCloudClient, group_id: &str, rules: &[IngressRule]) -> Result<(), CloudError> {
    let mut state = client.lock();
    state.check("AuthorizeSecurityGroupIngress")?;
    let group = state
        .security_groups
        .get_mut(group_id)
        .ok_or_else(|| CloudError::NotFound(format!("Security group {group_id} not found")))?;
    for rule in rules {
        if !group.ingress_rules.contains(rule) {
            group.ingress_rules.push(rule.clone());
        }
    }
    state.record("AuthorizeSecurityGroupIngress", group_id);
    Ok(())
}

pub async fn revoke_ingress(client: &MockCloudClient, group_id: &str, rules: &[IngressRule]) -> Result<(), CloudError> {
    let mut state = client.lock();
    state.check("RevokeSecurityGroupIngress")?;
    let group = state
        .security_groups
        .get_mut(group_id)
        .ok_or_else(|| CloudError::NotFound(format!("Security group {group_id} not found")))?;
    group.ingress_rules.retain(|r| !rules.contains(r));
    state.record("RevokeSecurityGroupIngress", group_id);
    Ok(())
}

pub async fn delete_security_group(client: &MockCloudClient, group_id: &str) -> Result<(), CloudError> {
    let mut state = client.lock();
    state.check("DeleteSecurityGroup")?;
    if !state.security_groups.contains_key(group_id) {
        return Err(CloudError::NotFound(format!("Security group {group_id} not found")));
    }
    let referenced = state.security_groups.values().any(|g| {
        g.group_id != group_id
            && g.ingress_rules
                .iter()
                .any(|r| r.source_security_group_ids.iter().any(|s| s == group_id))
    });
    if referenced {
        return Err(CloudError::api(
            "DependencyViolation",
            format!("security group {group_id} is referenced by another group"),
        ));
    }
    state.record("DeleteSecurityGroup", group_id);
    state.security_groups.remove(group_id);
    Ok(())
}

/// Instance with its security groups derived from the attached interfaces
fn with_interface_groups(state: &super::MockState, instance: &CloudInstance) -> CloudInstance {
    let mut instance = instance.clone();
    let mut groups: Vec<GroupIdentifier> = Vec::new();
    for interface in state
        .network_interfaces
        .values()
        .filter(|i| i.attachment_instance_id.as_deref() == Some(instance.instance_id.as_str()))
    {
        for group in &interface.groups {
            if !groups.iter().any(|g| g.group_id == group.group_id) {
                groups.push(group.clone());
            }
        }
    }
    if !groups.is_empty() {
        instance.security_groups = groups;
    }
    instance
}

pub async fn describe_instances(client: &MockCloudClient, filters: &[Filter]) -> Result<Vec<CloudInstance>, CloudError> {
    let state = client.lock();
    state.check("DescribeInstances")?;
    Ok(state
        .instances
        .values()
        .filter(|i| matches_all(*i, filters))
        .map(|i| with_interface_groups(&state, i))
        .collect())
}

fn group_identifiers(state: &super::MockState, group_ids: &[String]) -> Vec<GroupIdentifier> {
    group_ids
        .iter()
        .map(|id| GroupIdentifier {
            group_id: id.clone(),
            group_name: state
                .security_groups
                .get(id)
                .map(|g| g.group_name.clone())
                .unwrap_or_default(),
        })
        .collect()
}

pub async fn run_instance(client: &MockCloudClient, request: RunInstanceRequest) -> Result<CloudInstance, CloudError> {
    let mut state = client.lock();
    state.check("RunInstances")?;
    state.run_requests.push(request.clone());

    let instance_id = state.next_id("i");
    let sequence = state.next_id - 1;

    // Subnet comes from the request or from the first provided interface
    let subnet_id = request.subnet_id.clone().or_else(|| {
        request
            .network_interfaces
            .first()
            .and_then(|ni| state.network_interfaces.get(&ni.network_interface_id))
            .map(|ni| ni.subnet_id.clone())
    });
    let subnet = subnet_id.as_ref().and_then(|id| state.subnets.get(id)).cloned();

    let mut interfaces = Vec::new();
    if request.network_interfaces.is_empty() {
        let interface_id = state.next_id("eni");
        let groups = group_identifiers(&state, &request.security_group_ids);
        state.network_interfaces.insert(interface_id.clone(), NetworkInterface {
            network_interface_id: interface_id.clone(),
            subnet_id: subnet_id.clone().unwrap_or_default(),
            vpc_id: subnet.as_ref().map(|s| s.vpc_id.clone()).unwrap_or_default(),
            attachment_instance_id: Some(instance_id.clone()),
            groups,
        });
        interfaces.push(interface_id);
    } else {
        for spec in &request.network_interfaces {
            let interface = state
                .network_interfaces
                .entry(spec.network_interface_id.clone())
                .or_insert_with(|| NetworkInterface {
                    network_interface_id: spec.network_interface_id.clone(),
                    subnet_id: subnet_id.clone().unwrap_or_default(),
                    vpc_id: String::new(),
                    attachment_instance_id: None,
                    groups: Vec::new(),
                });
            interface.attachment_instance_id = Some(instance_id.clone());
            interfaces.push(spec.network_interface_id.clone());
        }
    }

    let private_ip = format!("10.0.{}.{}", sequence / 256, sequence % 256);
    let instance = CloudInstance {
        instance_id: instance_id.clone(),
        instance_type: request.instance_type.clone(),
        image_id: request.image_id.clone(),
        state: state.launch_state.clone(),
        subnet_id,
        vpc_id: subnet.as_ref().map(|s| s.vpc_id.clone()),
        key_name: request.key_name.clone(),
        iam_instance_profile_arn: request
            .iam_instance_profile
            .as_ref()
            .map(|p| format!("arn:aws:iam::123456789012:instance-profile/{p}")),
        availability_zone: subnet.as_ref().map(|s| s.availability_zone.clone()),
        private_ip_address: Some(private_ip.clone()),
        public_ip_address: None,
        instance_lifecycle: request.instance_market_options.as_ref().map(|_| "spot".to_string()),
        security_groups: group_identifiers(&state, &request.security_group_ids),
        network_interfaces: interfaces
            .iter()
            .map(|id| InstanceNetworkInterface {
                network_interface_id: id.clone(),
                private_dns_name: Some(format!("ip-{}.ec2.internal", private_ip.replace('.', "-"))),
                private_ip_address: Some(private_ip.clone()),
                association: None,
            })
            .collect(),
        tags: request.tags,
    };

    state.record("RunInstances", &instance_id);
    state.instances.insert(instance_id, instance.clone());
    Ok(with_interface_groups(&state, &instance))
}

pub async fn terminate_instance(client: &MockCloudClient, instance_id: &str) -> Result<(), CloudError> {
    let mut state = client.lock();
    state.check("TerminateInstances")?;
    let terminate_state = state.terminate_state.clone();
    let instance = state
        .instances
        .get_mut(instance_id)
        .ok_or_else(|| CloudError::NotFound(format!("Instance {instance_id} not found")))?;
    instance.state = terminate_state;
    state.record("TerminateInstances", instance_id);
    Ok(())
}

fn tags_of<'a>(state: &'a mut super::MockState, resource_id: &str) -> Option<&'a mut Vec<Tag>> {
    if let Some(vpc) = state.vpcs.get_mut(resource_id) {
        return Some(&mut vpc.tags);
    }
    if let Some(subnet) = state.subnets.get_mut(resource_id) {
        return Some(&mut subnet.tags);
    }
    if let Some(group) = state.security_groups.get_mut(resource_id) {
        return Some(&mut group.tags);
    }
    state.instances.get_mut(resource_id).map(|i| &mut i.tags)
}

pub async fn create_tags(client: &MockCloudClient, resource_id: &str, tags: &[Tag]) -> Result<(), CloudError> {
    let mut state = client.lock();
    state.check("CreateTags")?;
    let current = tags_of(&mut state, resource_id)
        .ok_or_else(|| CloudError::NotFound(format!("Resource {resource_id} not found")))?;
    for tag in tags {
        current.retain(|t| t.key != tag.key);
        current.push(tag.clone());
    }
    state.record("CreateTags", resource_id);
    Ok(())
}

pub async fn delete_tags(client: &MockCloudClient, resource_id: &str, tags: &[Tag]) -> Result<(), CloudError> {
    let mut state = client.lock();
    state.check("DeleteTags")?;
    let current = tags_of(&mut state, resource_id)
        .ok_or_else(|| CloudError::NotFound(format!("Resource {resource_id} not found")))?;
    current.retain(|t| !tags.iter().any(|d| d.key == t.key));
    state.record("DeleteTags", resource_id);
    Ok(())
}

pub async fn describe_network_interfaces(
    client: &MockCloudClient,
    filters: &[Filter],
) -> Result<Vec<NetworkInterface>, CloudError> {
    let state = client.lock();
    state.check("DescribeNetworkInterfaces")?;
    Ok(state.network_interfaces.values().filter(|i| matches_all(*i, filters)).cloned().collect())
}

pub async fn describe_network_interface_groups(client: &MockCloudClient, interface_id: &str) -> Result<Vec<String>, CloudError> {
    let state = client.lock();
    state.check("DescribeNetworkInterfaceAttribute")?;
    state
        .network_interfaces
        .get(interface_id)
        .map(|i| i.groups.iter().map(|g| g.group_id.clone()).collect())
        .ok_or_else(|| CloudError::NotFound(format!("Network interface {interface_id} not found")))
}

pub async fn modify_network_interface_groups(
    client: &MockCloudClient,
    interface_id: &str,
    group_ids: &[String],
) -> Result<(), CloudError> {
    let mut state = client.lock();
    state.check("ModifyNetworkInterfaceAttribute")?;
    let groups = group_identifiers(&state, group_ids);
    let interface = state
        .network_interfaces
        .get_mut(interface_id)
        .ok_or_else(|| CloudError::NotFound(format!("Network interface {interface_id} not found")))?;
    interface.groups = groups;
    state.record("ModifyNetworkInterfaceAttribute", interface_id);
    Ok(())
}

pub async fn describe_images(client: &MockCloudClient, filters: &[Filter]) -> Result<Vec<Image>, CloudError> {
    let state = client.lock();
    state.check("DescribeImages")?;
    Ok(state.images.values().filter(|i| matches_all(*i, filters)).cloned().collect())
}

pub async fn get_parameter(client: &MockCloudClient, name: &str) -> Result<String, CloudError> {
    let state = client.lock();
    state.check("GetParameter")?;
    state
        .parameters
        .get(name)
        .cloned()
        .ok_or_else(|| CloudError::NotFound(format!("Parameter {name} not found")))
}

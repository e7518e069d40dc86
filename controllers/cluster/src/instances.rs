//! Instance provisioner.
//!
//! Lookup-or-create for compute instances, plus security group membership
//! on the instances' network interfaces. Every operation is safe to repeat:
//! lookups come first and writes are skipped when nothing would change.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use cloud_client::{
    BlockDeviceMapping, CloudClientTrait, CloudInstance, EbsBlockDevice, Filter, InstanceNetworkInterfaceSpec,
    Placement, RunInstanceRequest,
};
use crds::{
    BASTION_ROLE, Instance, InstanceState, InstanceTemplate, MachineAddress, MachineAddressType, SpotMarketOptions,
    Volume,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{CloudResultExt, ControllerError, ignore_not_found};
use crate::resolvers::{image, security_groups, spot, subnet, tags};
use crate::scope::ClusterScope;

/// SSH key used when neither the machine nor the cluster names one
pub const DEFAULT_SSH_KEY_NAME: &str = "default";

const RUNNING: &str = "running";
const TERMINATED: &str = "terminated";

/// Bounds on the waits after create and terminate
#[derive(Debug, Clone, Copy)]
pub struct InstanceTimeouts {
    /// Wait for a new instance to run
    pub running: Duration,
    /// Wait for an instance to terminate
    pub terminate: Duration,
    /// Delay between state polls
    pub poll_interval: Duration,
}

impl Default for InstanceTimeouts {
    fn default() -> Self {
        Self {
            running: Duration::from_secs(60),
            terminate: Duration::from_secs(600),
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// What to launch
#[derive(Debug, Clone, Copy)]
pub struct InstanceRequest<'a> {
    /// Name tag
    pub name: &'a str,
    /// Machine role
    pub role: &'a str,
    /// Instance configuration
    pub template: &'a InstanceTemplate,
    /// Kubernetes version, for image lookup
    pub version: Option<&'a str>,
    /// Availability zone constraint
    pub failure_domain: Option<&'a str>,
    /// Plain-text bootstrap data
    pub user_data: Option<&'a str>,
}

/// Instance operations against one region
#[derive(Clone)]
pub struct InstanceService {
    client: Arc<dyn CloudClientTrait>,
    timeouts: InstanceTimeouts,
}

impl InstanceService {
    /// Create a service
    pub fn new(client: Arc<dyn CloudClientTrait>, timeouts: InstanceTimeouts) -> Self {
        Self { client, timeouts }
    }

    /// Instance owned by `cluster` with Name tag `name`, pending or running.
    ///
    /// When several match, the first one returned by the provider is used.
    pub async fn find_existing(
        &self,
        cluster: &str,
        name: &str,
        vpc_id: Option<&str>,
    ) -> Result<Option<Instance>, ControllerError> {
        let mut filters = vec![
            Filter::new(format!("tag:{}", tags::cluster_tag_key(cluster)), [tags::OWNED]),
            Filter::new(format!("tag:{}", tags::NAME_TAG), [name]),
            Filter::new("instance-state-name", ["pending", RUNNING]),
        ];
        if let Some(vpc_id) = vpc_id {
            filters.push(Filter::new("vpc-id", [vpc_id]));
        }
        let instances = self
            .client
            .describe_instances(&filters)
            .await
            .with_operation(|| format!("describe instances named {name}"))?;
        if instances.len() > 1 {
            debug!("{} instances named {} found, using the first", instances.len(), name);
        }
        Ok(instances.first().map(to_instance))
    }

    /// Instance by id; `None` when the provider no longer knows it
    pub async fn instance_by_id(&self, instance_id: &str) -> Result<Option<Instance>, ControllerError> {
        Ok(self.describe(instance_id).await?.as_ref().map(to_instance))
    }

    async fn describe(&self, instance_id: &str) -> Result<Option<CloudInstance>, ControllerError> {
        match self
            .client
            .describe_instances(&[Filter::new("instance-id", [instance_id])])
            .await
        {
            Ok(instances) => Ok(instances.into_iter().next()),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e).with_operation(|| format!("describe instance {instance_id}")),
        }
    }

    /// Cluster groups for `role` followed by the template's additional groups
    pub async fn security_group_ids(
        &self,
        scope: &ClusterScope,
        role: &str,
        template: &InstanceTemplate,
    ) -> Result<Vec<String>, ControllerError> {
        let mut group_ids = security_groups::core_security_groups(
            scope.network(),
            role,
            scope.is_externally_managed(),
            scope.is_managed_control_plane(),
        )?;
        let additional =
            security_groups::additional_security_groups(self.client.as_ref(), &template.additional_security_groups)
                .await?;
        for id in additional {
            if !group_ids.contains(&id) {
                group_ids.push(id);
            }
        }
        Ok(group_ids)
    }

    /// Launch an instance and wait (bounded) for it to run.
    ///
    /// Every validation happens before the launch call. A wait that expires
    /// is logged and the instance returned in whatever state it was seen.
    pub async fn create_instance(
        &self,
        scope: &ClusterScope,
        request: &InstanceRequest<'_>,
    ) -> Result<Instance, ControllerError> {
        let template = request.template;
        let client = self.client.as_ref();

        if template.non_root_volumes.iter().any(|v| v.device_name.is_empty()) {
            return Err(ControllerError::InvalidConfig(
                "non root volume should have device name specified".to_string(),
            ));
        }

        let image_id = image::resolve_image_id(
            client,
            template,
            scope.spec(),
            request.version,
            scope.is_managed_control_plane(),
        )
        .await?;

        let uses_interfaces = !template.network_interfaces.is_empty();
        let subnet_id = if uses_interfaces {
            None
        } else {
            Some(
                subnet::find_subnet(
                    client,
                    scope.network(),
                    scope.is_externally_managed(),
                    template.subnet.as_ref(),
                    request.failure_domain,
                )
                .await?,
            )
        };

        if request.role != BASTION_ROLE && !scope.is_externally_managed() && !scope.is_managed_control_plane() {
            let has_dns = scope
                .network()
                .api_server_elb
                .as_ref()
                .is_some_and(|lb| !lb.dns_name.is_empty());
            if !has_dns {
                return Err(ControllerError::FailedDependency(
                    "API server load balancer DNS name not available yet".to_string(),
                ));
            }
        }

        let group_ids = self.security_group_ids(scope, request.role, template).await?;
        let block_device_mappings = self.block_device_mappings(template, &image_id).await?;

        let mut additional_tags = scope.spec().additional_tags.clone();
        additional_tags.extend(template.additional_tags.clone());
        let instance_tags = tags::build_tags(scope.name(), request.name, request.role, &additional_tags);

        let run = RunInstanceRequest {
            instance_type: template.instance_type.clone(),
            image_id,
            key_name: ssh_key_name(template, scope),
            subnet_id,
            security_group_ids: if uses_interfaces { Vec::new() } else { group_ids.clone() },
            network_interfaces: template
                .network_interfaces
                .iter()
                .enumerate()
                .map(|(index, id)| InstanceNetworkInterfaceSpec {
                    network_interface_id: id.clone(),
                    device_index: i32::try_from(index).unwrap_or(i32::MAX),
                })
                .collect(),
            iam_instance_profile: template.iam_instance_profile.clone(),
            block_device_mappings,
            tags: tags::to_cloud_tags(&instance_tags),
            instance_market_options: spot::market_options(template.spot_market_options.as_ref()),
            placement: template.tenancy.clone().map(|tenancy| Placement { tenancy }),
            user_data: request.user_data.map(|data| STANDARD.encode(data)),
        };

        info!("Launching instance {} for cluster {}", request.name, scope.key);
        let mut created = self
            .client
            .run_instance(run)
            .await
            .with_operation(|| format!("run instance {}", request.name))?;

        if uses_interfaces {
            for interface in &template.network_interfaces {
                self.attach_security_groups(interface, &group_ids).await?;
            }
            if let Some(refreshed) = self.describe(&created.instance_id).await? {
                created = refreshed;
            }
        }

        let observed = if created.state == RUNNING {
            created
        } else {
            match self
                .wait_for_state(
                    &created.instance_id,
                    RUNNING,
                    self.timeouts.running,
                    format!("wait for instance {} to run", created.instance_id),
                )
                .await
            {
                Ok(Some(instance)) => instance,
                Ok(None) => created,
                Err(e) => {
                    warn!("Instance {} not running yet: {}", created.instance_id, e);
                    created
                }
            }
        };

        let mut instance = to_instance(&observed);
        instance.root_volume = template.root_volume.clone();
        instance.non_root_volumes = template.non_root_volumes.clone();
        instance.spot_market_options = template.spot_market_options.clone();
        Ok(instance)
    }

    async fn block_device_mappings(
        &self,
        template: &InstanceTemplate,
        image_id: &str,
    ) -> Result<Vec<BlockDeviceMapping>, ControllerError> {
        let mut mappings = Vec::new();
        if let Some(root) = &template.root_volume {
            let image = image::describe_image(self.client.as_ref(), image_id).await?;
            if let Some(snapshot) = image.root_snapshot_size {
                if root.size < snapshot {
                    return Err(ControllerError::InvalidConfig(format!(
                        "root volume size ({}) must be greater than or equal to snapshot size ({snapshot})",
                        root.size
                    )));
                }
            }
            let device_name = image.root_device_name.ok_or_else(|| {
                ControllerError::InvalidConfig(format!("image {image_id} has no root device name"))
            })?;
            mappings.push(block_device(device_name, root));
        }
        for volume in &template.non_root_volumes {
            mappings.push(block_device(volume.device_name.clone(), volume));
        }
        Ok(mappings)
    }

    /// Request termination. An instance that no longer exists counts as terminated.
    pub async fn terminate(&self, instance_id: &str) -> Result<(), ControllerError> {
        info!("Terminating instance {}", instance_id);
        ignore_not_found(self.client.terminate_instance(instance_id).await)
            .with_operation(|| format!("terminate instance {instance_id}"))
    }

    /// Terminate and block until the provider reports the instance terminated
    pub async fn terminate_and_wait(&self, instance_id: &str) -> Result<(), ControllerError> {
        self.terminate(instance_id).await?;
        self.wait_for_state(
            instance_id,
            TERMINATED,
            self.timeouts.terminate,
            format!("wait for instance {instance_id} to terminate"),
        )
        .await?;
        Ok(())
    }

    /// Poll until the instance is in `wanted`. `None` means it disappeared.
    async fn wait_for_state(
        &self,
        instance_id: &str,
        wanted: &str,
        timeout: Duration,
        operation: String,
    ) -> Result<Option<CloudInstance>, ControllerError> {
        let poll = async {
            loop {
                match self.describe(instance_id).await? {
                    Some(instance) if instance.state == wanted => return Ok(Some(instance)),
                    Some(instance) => {
                        debug!("Instance {} is {}, waiting for {}", instance_id, instance.state, wanted);
                    }
                    None => return Ok(None),
                }
                tokio::time::sleep(self.timeouts.poll_interval).await;
            }
        };
        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| ControllerError::Timeout {
                operation,
                waited: timeout,
            })?
    }

    /// Add `group_ids` to every network interface of the instance, keeping
    /// the groups already there. Interfaces already carrying all of them are
    /// left alone.
    pub async fn update_security_groups(&self, instance_id: &str, group_ids: &[String]) -> Result<(), ControllerError> {
        let interfaces = self
            .client
            .describe_network_interfaces(&[Filter::new("attachment.instance-id", [instance_id])])
            .await
            .with_operation(|| format!("describe network interfaces of {instance_id}"))?;
        for interface in interfaces {
            self.attach_security_groups(&interface.network_interface_id, group_ids)
                .await?;
        }
        Ok(())
    }

    async fn attach_security_groups(&self, interface_id: &str, group_ids: &[String]) -> Result<(), ControllerError> {
        let current = self.interface_groups(interface_id).await?;
        let mut wanted = current.clone();
        for id in group_ids {
            if !wanted.contains(id) {
                wanted.push(id.clone());
            }
        }
        if wanted.len() == current.len() {
            debug!("Network interface {} already has every requested group", interface_id);
            return Ok(());
        }
        self.modify_groups(interface_id, &wanted).await
    }

    /// Remove `group_ids` from a network interface
    pub async fn detach_security_groups(&self, interface_id: &str, group_ids: &[String]) -> Result<(), ControllerError> {
        let current = self.interface_groups(interface_id).await?;
        let remaining: Vec<String> = current.iter().filter(|g| !group_ids.contains(g)).cloned().collect();
        if remaining.len() == current.len() {
            debug!("Network interface {} has none of the groups to detach", interface_id);
            return Ok(());
        }
        self.modify_groups(interface_id, &remaining).await
    }

    async fn interface_groups(&self, interface_id: &str) -> Result<Vec<String>, ControllerError> {
        self.client
            .describe_network_interface_groups(interface_id)
            .await
            .with_operation(|| format!("describe security groups of network interface {interface_id}"))
    }

    async fn modify_groups(&self, interface_id: &str, group_ids: &[String]) -> Result<(), ControllerError> {
        info!("Setting security groups of network interface {} to {:?}", interface_id, group_ids);
        self.client
            .modify_network_interface_groups(interface_id, group_ids)
            .await
            .with_operation(|| format!("modify security groups of network interface {interface_id}"))
    }

    /// Converge the additional tags of an instance.
    ///
    /// Only keys in `previous` or `desired` are considered, so tags written
    /// by anyone else are never touched.
    pub async fn converge_tags(
        &self,
        instance: &Instance,
        previous: &BTreeMap<String, String>,
        desired: &BTreeMap<String, String>,
    ) -> Result<(), ControllerError> {
        let current: BTreeMap<String, String> = instance
            .tags
            .iter()
            .filter(|(k, _)| previous.contains_key(*k) || desired.contains_key(*k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        tags::apply_tag_diff(self.client.as_ref(), &instance.id, &tags::diff(&current, desired)).await
    }
}

/// Template key, else cluster key, else the default key unless the cluster
/// is externally managed. An empty name means no key.
fn ssh_key_name(template: &InstanceTemplate, scope: &ClusterScope) -> Option<String> {
    let name = match (&template.ssh_key_name, &scope.spec().ssh_key_name) {
        (Some(name), _) | (None, Some(name)) => name.clone(),
        (None, None) if scope.is_externally_managed() => return None,
        (None, None) => DEFAULT_SSH_KEY_NAME.to_string(),
    };
    (!name.is_empty()).then_some(name)
}

fn block_device(device_name: String, volume: &Volume) -> BlockDeviceMapping {
    BlockDeviceMapping {
        device_name,
        ebs: EbsBlockDevice {
            volume_size: volume.size,
            volume_type: volume.volume_type.clone(),
            iops: volume.iops,
            encrypted: volume
                .encrypted
                .or_else(|| volume.encryption_key.as_ref().map(|_| true)),
            kms_key_id: volume.encryption_key.clone(),
            delete_on_termination: true,
        },
    }
}

/// Observed instance from the provider's description
pub(crate) fn to_instance(cloud: &CloudInstance) -> Instance {
    let mut security_group_ids: Vec<String> = Vec::new();
    for group in &cloud.security_groups {
        if !security_group_ids.contains(&group.group_id) {
            security_group_ids.push(group.group_id.clone());
        }
    }

    let mut addresses = Vec::new();
    for interface in &cloud.network_interfaces {
        let mut push = |address_type, value: &Option<String>| {
            if let Some(address) = value.as_ref().filter(|a| !a.is_empty()) {
                addresses.push(MachineAddress {
                    address_type,
                    address: address.clone(),
                });
            }
        };
        push(MachineAddressType::InternalDNS, &interface.private_dns_name);
        push(MachineAddressType::InternalIP, &interface.private_ip_address);
        if let Some(association) = &interface.association {
            push(MachineAddressType::ExternalIP, &association.public_ip);
            push(MachineAddressType::ExternalDNS, &association.public_dns_name);
        }
    }

    Instance {
        id: cloud.instance_id.clone(),
        instance_type: cloud.instance_type.clone(),
        image_id: cloud.image_id.clone(),
        subnet_id: cloud.subnet_id.clone().unwrap_or_default(),
        security_group_ids,
        tags: tags::from_cloud_tags(&cloud.tags),
        iam_profile: cloud
            .iam_instance_profile_arn
            .as_deref()
            .and_then(|arn| arn.rsplit_once("instance-profile/"))
            .map(|(_, name)| name.to_string()),
        root_volume: None,
        non_root_volumes: Vec::new(),
        network_interfaces: cloud
            .network_interfaces
            .iter()
            .map(|i| i.network_interface_id.clone())
            .collect(),
        ssh_key_name: cloud.key_name.clone(),
        spot_market_options: (cloud.instance_lifecycle.as_deref() == Some("spot"))
            .then(SpotMarketOptions::default),
        state: InstanceState::from_cloud(&cloud.state),
        availability_zone: cloud.availability_zone.clone(),
        private_ip: cloud.private_ip_address.clone(),
        public_ip: cloud.public_ip_address.clone(),
        addresses,
    }
}

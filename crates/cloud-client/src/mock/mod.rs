//! Mock CloudClient for unit testing
//!
//! In-memory implementation of `CloudClientTrait`. Every mutating call is
//! recorded so tests can assert on exactly which remote writes happened.
//!
//! The mock is organized into domain-specific modules:
//! - `ec2.rs` - VPCs, subnets, security groups, instances, tags, network interfaces, images
//! - `elb.rs` - load balancers
//! - `storage.rs` - buckets
//! - `events.rs` - queues and event rules
//! - `filters.rs` - describe filter matching

mod ec2;
mod elb;
mod events;
mod filters;
mod storage;

use crate::cloud_trait::CloudClientTrait;
use crate::error::CloudError;
use crate::models::*;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// In-memory provider state
#[derive(Debug)]
pub(crate) struct MockState {
    pub(crate) vpcs: BTreeMap<String, Vpc>,
    pub(crate) subnets: BTreeMap<String, Subnet>,
    pub(crate) security_groups: BTreeMap<String, SecurityGroup>,
    pub(crate) instances: BTreeMap<String, CloudInstance>,
    pub(crate) network_interfaces: BTreeMap<String, NetworkInterface>,
    pub(crate) images: BTreeMap<String, Image>,
    pub(crate) parameters: HashMap<String, String>,
    pub(crate) load_balancers: BTreeMap<String, LoadBalancer>,
    pub(crate) buckets: BTreeSet<String>,
    pub(crate) queues: BTreeMap<String, Queue>,
    pub(crate) event_rules: BTreeMap<String, EventRule>,
    pub(crate) run_requests: Vec<RunInstanceRequest>,
    pub(crate) calls: Vec<String>,
    pub(crate) failures: HashMap<String, String>,
    pub(crate) launch_state: String,
    pub(crate) terminate_state: String,
    pub(crate) assign_load_balancer_dns: bool,
    pub(crate) next_id: u64,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            vpcs: BTreeMap::new(),
            subnets: BTreeMap::new(),
            security_groups: BTreeMap::new(),
            instances: BTreeMap::new(),
            network_interfaces: BTreeMap::new(),
            images: BTreeMap::new(),
            parameters: HashMap::new(),
            load_balancers: BTreeMap::new(),
            buckets: BTreeSet::new(),
            queues: BTreeMap::new(),
            event_rules: BTreeMap::new(),
            run_requests: Vec::new(),
            calls: Vec::new(),
            failures: HashMap::new(),
            launch_state: "running".to_string(),
            terminate_state: "terminated".to_string(),
            assign_load_balancer_dns: true,
            next_id: 1,
        }
    }
}

impl MockState {
    /// Fails the operation if a failure was injected for it
    pub(crate) fn check(&self, operation: &str) -> Result<(), CloudError> {
        match self.failures.get(operation) {
            Some(message) => Err(CloudError::api("MockFailure", message.clone())),
            None => Ok(()),
        }
    }

    /// Records a mutating call
    pub(crate) fn record(&mut self, operation: &str, target: &str) {
        self.calls.push(format!("{operation}:{target}"));
    }

    /// Generates the next resource id with a fixed-width counter so ids sort
    /// in creation order
    pub(crate) fn next_id(&mut self, prefix: &str) -> String {
        let id = format!("{prefix}-{:08x}", self.next_id);
        self.next_id += 1;
        id
    }
}

/// Mock CloudClient for testing
///
/// Clones share the same state.
#[derive(Debug, Clone)]
pub struct MockCloudClient {
    pub(crate) region: String,
    pub(crate) state: Arc<Mutex<MockState>>,
}

impl Default for MockCloudClient {
    fn default() -> Self {
        Self::new("us-east-1")
    }
}

impl MockCloudClient {
    /// Create a new mock client
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a VPC (for test setup)
    pub fn add_vpc(&self, vpc: Vpc) {
        self.lock().vpcs.insert(vpc.vpc_id.clone(), vpc);
    }

    /// Add a subnet (for test setup)
    pub fn add_subnet(&self, subnet: Subnet) {
        self.lock().subnets.insert(subnet.subnet_id.clone(), subnet);
    }

    /// Add a security group (for test setup)
    pub fn add_security_group(&self, group: SecurityGroup) {
        self.lock().security_groups.insert(group.group_id.clone(), group);
    }

    /// Add an instance (for test setup)
    pub fn add_instance(&self, instance: CloudInstance) {
        self.lock().instances.insert(instance.instance_id.clone(), instance);
    }

    /// Add a network interface (for test setup)
    pub fn add_network_interface(&self, interface: NetworkInterface) {
        self.lock().network_interfaces.insert(interface.network_interface_id.clone(), interface);
    }

    /// Add an image (for test setup)
    pub fn add_image(&self, image: Image) {
        self.lock().images.insert(image.image_id.clone(), image);
    }

    /// Set a parameter store value (for test setup)
    pub fn set_parameter(&self, name: impl Into<String>, value: impl Into<String>) {
        self.lock().parameters.insert(name.into(), value.into());
    }

    /// Add a bucket (for test setup)
    pub fn add_bucket(&self, name: impl Into<String>) {
        self.lock().buckets.insert(name.into());
    }

    /// Make every call to `operation` fail with a provider error
    pub fn fail_operation(&self, operation: &str, message: impl Into<String>) {
        self.lock().failures.insert(operation.to_string(), message.into());
    }

    /// Remove all injected failures
    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// State new instances launch in (default "running")
    pub fn set_launch_state(&self, state: &str) {
        self.lock().launch_state = state.to_string();
    }

    /// State terminated instances move to (default "terminated")
    pub fn set_terminate_state(&self, state: &str) {
        self.lock().terminate_state = state.to_string();
    }

    /// Whether new load balancers get a DNS name immediately (default true)
    pub fn set_assign_load_balancer_dns(&self, assign: bool) {
        self.lock().assign_load_balancer_dns = assign;
    }

    /// Recorded mutating calls, formatted as `Operation:target`
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Number of recorded calls to `operation`
    pub fn call_count(&self, operation: &str) -> usize {
        let prefix = format!("{operation}:");
        self.lock().calls.iter().filter(|c| c.starts_with(&prefix)).count()
    }

    /// Forget recorded calls
    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Launch requests received, in order
    pub fn run_requests(&self) -> Vec<RunInstanceRequest> {
        self.lock().run_requests.clone()
    }

    /// Current state of an instance
    pub fn instance(&self, instance_id: &str) -> Option<CloudInstance> {
        self.lock().instances.get(instance_id).cloned()
    }

    /// Current state of a load balancer
    pub fn load_balancer(&self, name: &str) -> Option<LoadBalancer> {
        self.lock().load_balancers.get(name).cloned()
    }

    /// Whether a bucket exists
    pub fn has_bucket(&self, name: &str) -> bool {
        self.lock().buckets.contains(name)
    }

    /// Number of VPCs
    pub fn vpc_count(&self) -> usize {
        self.lock().vpcs.len()
    }

    /// Number of security groups
    pub fn security_group_count(&self) -> usize {
        self.lock().security_groups.len()
    }
}

#[async_trait::async_trait]
impl CloudClientTrait for MockCloudClient {
    fn region(&self) -> &str {
        &self.region
    }

    async fn describe_vpcs(&self, filters: &[Filter]) -> Result<Vec<Vpc>, CloudError> {
        ec2::describe_vpcs(self, filters).await
    }

    async fn create_vpc(&self, request: CreateVpcRequest) -> Result<Vpc, CloudError> {
        ec2::create_vpc(self, request).await
    }

    async fn delete_vpc(&self, vpc_id: &str) -> Result<(), CloudError> {
        ec2::delete_vpc(self, vpc_id).await
    }

    async fn describe_subnets(&self, filters: &[Filter]) -> Result<Vec<Subnet>, CloudError> {
        ec2::describe_subnets(self, filters).await
    }

    async fn create_subnet(&self, request: CreateSubnetRequest) -> Result<Subnet, CloudError> {
        ec2::create_subnet(self, request).await
    }

    async fn delete_subnet(&self, subnet_id: &str) -> Result<(), CloudError> {
        ec2::delete_subnet(self, subnet_id).await
    }

    async fn describe_security_groups(&self, filters: &[Filter]) -> Result<Vec<SecurityGroup>, CloudError> {
        ec2::describe_security_groups(self, filters).await
    }

    async fn create_security_group(&self, request: CreateSecurityGroupRequest) -> Result<SecurityGroup, CloudError> {
        ec2::create_security_group(self, request).await
    }

    async fn authorize_ingress(&self, group_id: &str, rules: &[IngressRule]) -> Result<(), CloudError> {
        ec2::authorize_ingress(self, group_id, rules).await
    }

    async fn revoke_ingress(&self, group_id: &str, rules: &[IngressRule]) -> Result<(), CloudError> {
        ec2::revoke_ingress(self, group_id, rules).await
    }

    async fn delete_security_group(&self, group_id: &str) -> Result<(), CloudError> {
        ec2::delete_security_group(self, group_id).await
    }

    async fn describe_instances(&self, filters: &[Filter]) -> Result<Vec<CloudInstance>, CloudError> {
        ec2::describe_instances(self, filters).await
    }

    async fn run_instance(&self, request: RunInstanceRequest) -> Result<CloudInstance, CloudError> {
        ec2::run_instance(self, request).await
    }

    async fn terminate_instance(&self, instance_id: &str) -> Result<(), CloudError> {
        ec2::terminate_instance(self, instance_id).await
    }

    async fn create_tags(&self, resource_id: &str, tags: &[Tag]) -> Result<(), CloudError> {
        ec2::create_tags(self, resource_id, tags).await
    }

    async fn delete_tags(&self, resource_id: &str, tags: &[Tag]) -> Result<(), CloudError> {
        ec2::delete_tags(self, resource_id, tags).await
    }

    async fn describe_network_interfaces(&self, filters: &[Filter]) -> Result<Vec<NetworkInterface>, CloudError> {
        ec2::describe_network_interfaces(self, filters).await
    }

    async fn describe_network_interface_groups(&self, interface_id: &str) -> Result<Vec<String>, CloudError> {
        ec2::describe_network_interface_groups(self, interface_id).await
    }

    async fn modify_network_interface_groups(&self, interface_id: &str, group_ids: &[String]) -> Result<(), CloudError> {
        ec2::modify_network_interface_groups(self, interface_id, group_ids).await
    }

    async fn describe_images(&self, filters: &[Filter]) -> Result<Vec<Image>, CloudError> {
        ec2::describe_images(self, filters).await
    }

    async fn get_parameter(&self, name: &str) -> Result<String, CloudError> {
        ec2::get_parameter(self, name).await
    }

    async fn describe_load_balancer(&self, name: &str) -> Result<Option<LoadBalancer>, CloudError> {
        elb::describe_load_balancer(self, name).await
    }

    async fn create_load_balancer(&self, request: CreateLoadBalancerRequest) -> Result<LoadBalancer, CloudError> {
        elb::create_load_balancer(self, request).await
    }

    async fn attach_load_balancer_subnets(&self, name: &str, subnet_ids: &[String]) -> Result<(), CloudError> {
        elb::attach_load_balancer_subnets(self, name, subnet_ids).await
    }

    async fn delete_load_balancer(&self, name: &str) -> Result<(), CloudError> {
        elb::delete_load_balancer(self, name).await
    }

    async fn bucket_exists(&self, name: &str) -> Result<bool, CloudError> {
        storage::bucket_exists(self, name).await
    }

    async fn create_bucket(&self, name: &str) -> Result<(), CloudError> {
        storage::create_bucket(self, name).await
    }

    async fn delete_bucket(&self, name: &str) -> Result<(), CloudError> {
        storage::delete_bucket(self, name).await
    }

    async fn describe_queue(&self, name: &str) -> Result<Option<Queue>, CloudError> {
        events::describe_queue(self, name).await
    }

    async fn create_queue(&self, name: &str) -> Result<Queue, CloudError> {
        events::create_queue(self, name).await
    }

    async fn delete_queue(&self, name: &str) -> Result<(), CloudError> {
        events::delete_queue(self, name).await
    }

    async fn describe_event_rule(&self, name: &str) -> Result<Option<EventRule>, CloudError> {
        events::describe_event_rule(self, name).await
    }

    async fn put_event_rule(&self, rule: EventRule) -> Result<(), CloudError> {
        events::put_event_rule(self, rule).await
    }

    async fn delete_event_rule(&self, name: &str) -> Result<(), CloudError> {
        events::delete_event_rule(self, name).await
    }
}

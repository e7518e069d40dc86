//! CloudClient trait for mocking
//!
//! This trait abstracts the cloud resource API so the controller can run
//! against the HTTP client in production and the in-memory mock in tests.

use crate::error::CloudError;
use crate::models::*;

/// Trait for cloud resource API operations
///
/// Describe calls return every match in provider order. Calls addressing a
/// single resource return `CloudError::NotFound` when it does not exist, except
/// the `Option`-returning lookups which report absence as `None`.
#[async_trait::async_trait]
pub trait CloudClientTrait: Send + Sync {
    /// Region this client targets
    fn region(&self) -> &str;

    // VPC and subnet operations
    async fn describe_vpcs(&self, filters: &[Filter]) -> Result<Vec<Vpc>, CloudError>;
    async fn create_vpc(&self, request: CreateVpcRequest) -> Result<Vpc, CloudError>;
    async fn delete_vpc(&self, vpc_id: &str) -> Result<(), CloudError>;
    async fn describe_subnets(&self, filters: &[Filter]) -> Result<Vec<Subnet>, CloudError>;
    async fn create_subnet(&self, request: CreateSubnetRequest) -> Result<Subnet, CloudError>;
    async fn delete_subnet(&self, subnet_id: &str) -> Result<(), CloudError>;

    // Security group operations
    async fn describe_security_groups(&self, filters: &[Filter]) -> Result<Vec<SecurityGroup>, CloudError>;
    async fn create_security_group(&self, request: CreateSecurityGroupRequest) -> Result<SecurityGroup, CloudError>;
    async fn authorize_ingress(&self, group_id: &str, rules: &[IngressRule]) -> Result<(), CloudError>;
    async fn revoke_ingress(&self, group_id: &str, rules: &[IngressRule]) -> Result<(), CloudError>;
    async fn delete_security_group(&self, group_id: &str) -> Result<(), CloudError>;

    // Instance operations
    async fn describe_instances(&self, filters: &[Filter]) -> Result<Vec<CloudInstance>, CloudError>;
    async fn run_instance(&self, request: RunInstanceRequest) -> Result<CloudInstance, CloudError>;
    async fn terminate_instance(&self, instance_id: &str) -> Result<(), CloudError>;

    // Tag operations
    async fn create_tags(&self, resource_id: &str, tags: &[Tag]) -> Result<(), CloudError>;
    async fn delete_tags(&self, resource_id: &str, tags: &[Tag]) -> Result<(), CloudError>;

    // Network interface operations
    async fn describe_network_interfaces(&self, filters: &[Filter]) -> Result<Vec<NetworkInterface>, CloudError>;
    async fn describe_network_interface_groups(&self, interface_id: &str) -> Result<Vec<String>, CloudError>;
    async fn modify_network_interface_groups(&self, interface_id: &str, group_ids: &[String]) -> Result<(), CloudError>;

    // Image operations
    async fn describe_images(&self, filters: &[Filter]) -> Result<Vec<Image>, CloudError>;
    async fn get_parameter(&self, name: &str) -> Result<String, CloudError>;

    // Load balancer operations
    async fn describe_load_balancer(&self, name: &str) -> Result<Option<LoadBalancer>, CloudError>;
    async fn create_load_balancer(&self, request: CreateLoadBalancerRequest) -> Result<LoadBalancer, CloudError>;
    async fn attach_load_balancer_subnets(&self, name: &str, subnet_ids: &[String]) -> Result<(), CloudError>;
    async fn delete_load_balancer(&self, name: &str) -> Result<(), CloudError>;

    // Object store operations
    async fn bucket_exists(&self, name: &str) -> Result<bool, CloudError>;
    async fn create_bucket(&self, name: &str) -> Result<(), CloudError>;
    async fn delete_bucket(&self, name: &str) -> Result<(), CloudError>;

    // Event operations
    async fn describe_queue(&self, name: &str) -> Result<Option<Queue>, CloudError>;
    async fn create_queue(&self, name: &str) -> Result<Queue, CloudError>;
    async fn delete_queue(&self, name: &str) -> Result<(), CloudError>;
    async fn describe_event_rule(&self, name: &str) -> Result<Option<EventRule>, CloudError>;
    async fn put_event_rule(&self, rule: EventRule) -> Result<(), CloudError>;
    async fn delete_event_rule(&self, name: &str) -> Result<(), CloudError>;
}

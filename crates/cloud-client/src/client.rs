//! Cloud API client
//!
//! Talks JSON to the cloud gateway: every operation is a `POST` to
//! `{base_url}/v1/{region}/{Action}` with a JSON body. Errors come back as
//! `{"code": "...", "message": "..."}` with a non-2xx status.

use crate::cloud_trait::CloudClientTrait;
use crate::error::CloudError;
use crate::models::*;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

const DEFAULT_REGION: &str = "us-east-1";

/// Cloud API client
#[derive(Debug, Clone)]
pub struct CloudClient {
    client: Client,
    base_url: String,
    token: String,
    region: String,
}

#[derive(Debug, serde::Deserialize)]
struct ApiErrorBody {
    code: String,
    message: String,
}

impl CloudClient {
    /// Create a new client
    ///
    /// # Arguments
    /// * `base_url` - Gateway base URL (e.g., "http://cloud-gateway:8080")
    /// * `token` - Bearer token for authentication
    pub fn new(base_url: String, token: String) -> Result<Self, CloudError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            region: DEFAULT_REGION.to_string(),
        })
    }

    /// Same client targeting another region; the connection pool is shared
    #[must_use]
    pub fn with_region(&self, region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            ..self.clone()
        }
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn send<B: Serialize + ?Sized>(&self, action: &str, body: &B) -> Result<String, CloudError> {
        let url = format!("{}/v1/{}/{}", self.base_url, self.region, action);
        debug!("Calling {}", url);

        let response = self.client
            .post(&url)
            .bearer_auth(&self.token)
            .header("Accept", "application/json")
            .json(body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if status.is_success() {
            return Ok(text);
        }

        let parsed = serde_json::from_str::<ApiErrorBody>(&text).ok();
        match status {
            StatusCode::NOT_FOUND => Err(CloudError::NotFound(
                parsed.map_or_else(|| format!("{action}: {text}"), |e| e.message),
            )),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(CloudError::Authentication(
                parsed.map_or(text, |e| e.message),
            )),
            StatusCode::BAD_REQUEST if parsed.is_none() => Err(CloudError::InvalidRequest(text)),
            _ => Err(match parsed {
                Some(e) => CloudError::api(e.code, e.message),
                None => CloudError::api(status.as_str(), text),
            }),
        }
    }

    async fn call<B: Serialize + ?Sized, R: DeserializeOwned>(&self, action: &str, body: &B) -> Result<R, CloudError> {
        let text = self.send(action, body).await?;
        Ok(serde_json::from_str(&text)?)
    }

    async fn call_unit<B: Serialize + ?Sized>(&self, action: &str, body: &B) -> Result<(), CloudError> {
        self.send(action, body).await.map(|_| ())
    }

    async fn call_optional<B: Serialize + ?Sized, R: DeserializeOwned>(&self, action: &str, body: &B) -> Result<Option<R>, CloudError> {
        match self.call(action, body).await {
            Ok(value) => Ok(Some(value)),
            Err(CloudError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[async_trait::async_trait]
impl CloudClientTrait for CloudClient {
    fn region(&self) -> &str {
        &self.region
    }

    async fn describe_vpcs(&self, filters: &[Filter]) -> Result<Vec<Vpc>, CloudError> {
        self.call("DescribeVpcs", &json!({ "filters": filters })).await
    }

    async fn create_vpc(&self, request: CreateVpcRequest) -> Result<Vpc, CloudError> {
        self.call("CreateVpc", &request).await
    }

    async fn delete_vpc(&self, vpc_id: &str) -> Result<(), CloudError> {
        self.call_unit("DeleteVpc", &json!({ "vpcId": vpc_id })).await
    }

    async fn describe_subnets(&self, filters: &[Filter]) -> Result<Vec<Subnet>, CloudError> {
        self.call("DescribeSubnets", &json!({ "filters": filters })).await
    }

    async fn create_subnet(&self, request: CreateSubnetRequest) -> Result<Subnet, CloudError> {
        self.call("CreateSubnet", &request).await
    }

    async fn delete_subnet(&self, subnet_id: &str) -> Result<(), CloudError> {
        self.call_unit("DeleteSubnet", &json!({ "subnetId": subnet_id })).await
    }

    async fn describe_security_groups(&self, filters: &[Filter]) -> Result<Vec<SecurityGroup>, CloudError> {
        self.call("DescribeSecurityGroups", &json!({ "filters": filters })).await
    }

    async fn create_security_group(&self, request: CreateSecurityGroupRequest) -> Result<SecurityGroup, CloudError> {
        self.call("CreateSecurityGroup", &request).await
    }

    async fn authorize_ingress(&self, group_id: &str, rules: &[IngressRule]) -> Result<(), CloudError> {
        self.call_unit("AuthorizeSecurityGroupIngress", &json!({ "groupId": group_id, "rules": rules })).await
    }

    async fn revoke_ingress(&self, group_id: &str, rules: &[IngressRule]) -> Result<(), CloudError> {
        self.call_unit("RevokeSecurityGroupIngress", &json!({ "groupId": group_id, "rules": rules })).await
    }

    async fn delete_security_group(&self, group_id: &str) -> Result<(), CloudError> {
        self.call_unit("DeleteSecurityGroup", &json!({ "groupId": group_id })).await
    }

    async fn describe_instances(&self, filters: &[Filter]) -> Result<Vec<CloudInstance>, CloudError> {
        self.call("DescribeInstances", &json!({ "filters": filters })).await
    }

    async fn run_instance(&self, request: RunInstanceRequest) -> Result<CloudInstance, CloudError> {
        self.call("RunInstances", &request).await
    }

    async fn terminate_instance(&self, instance_id: &str) -> Result<(), CloudError> {
        self.call_unit("TerminateInstances", &json!({ "instanceIds": [instance_id] })).await
    }

    async fn create_tags(&self, resource_id: &str, tags: &[Tag]) -> Result<(), CloudError> {
        self.call_unit("CreateTags", &json!({ "resources": [resource_id], "tags": tags })).await
    }

    async fn delete_tags(&self, resource_id: &str, tags: &[Tag]) -> Result<(), CloudError> {
        self.call_unit("DeleteTags", &json!({ "resources": [resource_id], "tags": tags })).await
    }

    async fn describe_network_interfaces(&self, filters: &[Filter]) -> Result<Vec<NetworkInterface>, CloudError> {
        self.call("DescribeNetworkInterfaces", &json!({ "filters": filters })).await
    }

    async fn describe_network_interface_groups(&self, interface_id: &str) -> Result<Vec<String>, CloudError> {
        self.call(
            "DescribeNetworkInterfaceAttribute",
            &json!({ "networkInterfaceId": interface_id, "attribute": "groupSet" }),
        )
        .await
    }

    async fn modify_network_interface_groups(&self, interface_id: &str, group_ids: &[String]) -> Result<(), CloudError> {
        self.call_unit(
            "ModifyNetworkInterfaceAttribute",
            &json!({ "networkInterfaceId": interface_id, "groups": group_ids }),
        )
        .await
    }

    async fn describe_images(&self, filters: &[Filter]) -> Result<Vec<Image>, CloudError> {
        self.call("DescribeImages", &json!({ "filters": filters })).await
    }

    async fn get_parameter(&self, name: &str) -> Result<String, CloudError> {
        self.call("GetParameter", &json!({ "name": name })).await
    }

    async fn describe_load_balancer(&self, name: &str) -> Result<Option<LoadBalancer>, CloudError> {
        self.call_optional("DescribeLoadBalancer", &json!({ "name": name })).await
    }

    async fn create_load_balancer(&self, request: CreateLoadBalancerRequest) -> Result<LoadBalancer, CloudError> {
        self.call("CreateLoadBalancer", &request).await
    }

    async fn attach_load_balancer_subnets(&self, name: &str, subnet_ids: &[String]) -> Result<(), CloudError> {
        self.call_unit("AttachLoadBalancerToSubnets", &json!({ "name": name, "subnetIds": subnet_ids })).await
    }

    async fn delete_load_balancer(&self, name: &str) -> Result<(), CloudError> {
        self.call_unit("DeleteLoadBalancer", &json!({ "name": name })).await
    }

    async fn bucket_exists(&self, name: &str) -> Result<bool, CloudError> {
        match self.call_unit("HeadBucket", &json!({ "bucket": name })).await {
            Ok(()) => Ok(true),
            Err(CloudError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn create_bucket(&self, name: &str) -> Result<(), CloudError> {
        self.call_unit("CreateBucket", &json!({ "bucket": name })).await
    }

    async fn delete_bucket(&self, name: &str) -> Result<(), CloudError> {
        self.call_unit("DeleteBucket", &json!({ "bucket": name })).await
    }

    async fn describe_queue(&self, name: &str) -> Result<Option<Queue>, CloudError> {
        self.call_optional("GetQueue", &json!({ "name": name })).await
    }

    async fn create_queue(&self, name: &str) -> Result<Queue, CloudError> {
        self.call("CreateQueue", &json!({ "name": name })).await
    }

    async fn delete_queue(&self, name: &str) -> Result<(), CloudError> {
        self.call_unit("DeleteQueue", &json!({ "name": name })).await
    }

    async fn describe_event_rule(&self, name: &str) -> Result<Option<EventRule>, CloudError> {
        self.call_optional("DescribeRule", &json!({ "name": name })).await
    }

    async fn put_event_rule(&self, rule: EventRule) -> Result<(), CloudError> {
        self.call_unit("PutRule", &rule).await
    }

    async fn delete_event_rule(&self, name: &str) -> Result<(), CloudError> {
        self.call_unit("DeleteRule", &json!({ "name": name })).await
    }
}

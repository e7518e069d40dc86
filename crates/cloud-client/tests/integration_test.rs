//! Integration tests for the cloud client
//!
//! These tests require a running cloud gateway.
//! Set CLOUD_API_URL and CLOUD_API_TOKEN environment variables to run.

use cloud_client::{CloudClient, CloudClientTrait, CloudError, Filter};

fn client() -> CloudClient {
    let url = std::env::var("CLOUD_API_URL")
        .unwrap_or_else(|_| "http://localhost:8080".to_string());
    let token = std::env::var("CLOUD_API_TOKEN")
        .expect("CLOUD_API_TOKEN environment variable must be set");
    let region = std::env::var("CLOUD_REGION").unwrap_or_else(|_| "us-east-1".to_string());

    CloudClient::new(url, token)
        .expect("Failed to create client")
        .with_region(region)
}

#[tokio::test]
#[ignore] // Requires running cloud gateway
async fn test_describe_vpcs() {
    let vpcs = client().describe_vpcs(&[]).await;
    assert!(vpcs.is_ok(), "Failed to describe VPCs: {:?}", vpcs.err());
}

#[tokio::test]
#[ignore]
async fn test_describe_subnets_with_filter() {
    let subnets = client()
        .describe_subnets(&[Filter::new("state", ["pending", "available"])])
        .await
        .expect("Failed to describe subnets");

    println!("Found {} subnets", subnets.len());
}

#[tokio::test]
#[ignore]
async fn test_missing_load_balancer_is_none() {
    let lb = client()
        .describe_load_balancer("does-not-exist-apiserver")
        .await
        .expect("Failed to describe load balancer");
    assert!(lb.is_none());
}

#[tokio::test]
#[ignore]
async fn test_missing_instance_termination_is_not_found() {
    let result = client().terminate_instance("i-00000000000000000").await;
    assert!(matches!(result, Err(CloudError::NotFound(_))));
}

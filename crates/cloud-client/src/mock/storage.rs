//! Bucket operations for MockCloudClient

use super::MockCloudClient;
use crate::error::CloudError;

pub async fn bucket_exists(client: &MockCloudClient, name: &str) -> Result<bool, CloudError> {
    let state = client.lock();
    state.check("HeadBucket")?;
    Ok(state.buckets.contains(name))
}

pub async fn create_bucket(client: &MockCloudClient, name: &str) -> Result<(), CloudError> {
    let mut state = client.lock();
    state.check("CreateBucket")?;
    if !state.buckets.insert(name.to_string()) {
        return Err(CloudError::api("BucketAlreadyOwnedByYou", format!("bucket {name} already exists")));
    }
    state.record("CreateBucket", name);
    Ok(())
}

pub async fn delete_bucket(client: &MockCloudClient, name: &str) -> Result<(), CloudError> {
    let mut state = client.lock();
    state.check("DeleteBucket")?;
    if !state.buckets.remove(name) {
        return Err(CloudError::NotFound(format!("Bucket {name} not found")));
    }
    state.record("DeleteBucket", name);
    Ok(())
}

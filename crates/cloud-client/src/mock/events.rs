//! Queue and event rule operations for MockCloudClient

use super::MockCloudClient;
use crate::error::CloudError;
use crate::models::*;

pub async fn describe_queue(client: &MockCloudClient, name: &str) -> Result<Option<Queue>, CloudError> {
    let state = client.lock();
    state.check("GetQueue")?;
    Ok(state.queues.get(name).cloned())
}

pub async fn create_queue(client: &MockCloudClient, name: &str) -> Result<Queue, CloudError> {
    let mut state = client.lock();
    state.check("CreateQueue")?;
    let queue = Queue {
        name: name.to_string(),
        url: format!("https://sqs.{}.amazonaws.com/123456789012/{name}", client.region),
        arn: format!("arn:aws:sqs:{}:123456789012:{name}", client.region),
    };
    state.record("CreateQueue", name);
    state.queues.insert(name.to_string(), queue.clone());
    Ok(queue)
}

pub async fn delete_queue(client: &MockCloudClient, name: &str) -> Result<(), CloudError> {
    let mut state = client.lock();
    state.check("DeleteQueue")?;
    if state.queues.remove(name).is_none() {
        return Err(CloudError::NotFound(format!("Queue {name} not found")));
    }
    state.record("DeleteQueue", name);
    Ok(())
}

pub async fn describe_event_rule(client: &MockCloudClient, name: &str) -> Result<Option<EventRule>, CloudError> {
    let state = client.lock();
    state.check("DescribeRule")?;
    Ok(state.event_rules.get(name).cloned())
}

pub async fn put_event_rule(client: &MockCloudClient, rule: EventRule) -> Result<(), CloudError> {
    let mut state = client.lock();
    state.check("PutRule")?;
    state.record("PutRule", &rule.name);
    state.event_rules.insert(rule.name.clone(), rule);
    Ok(())
}

pub async fn delete_event_rule(client: &MockCloudClient, name: &str) -> Result<(), CloudError> {
    let mut state = client.lock();
    state.check("DeleteRule")?;
    if state.event_rules.remove(name).is_none() {
        return Err(CloudError::NotFound(format!("Rule {name} not found")));
    }
    state.record("DeleteRule", name);
    Ok(())
}

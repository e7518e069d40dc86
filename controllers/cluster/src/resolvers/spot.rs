//! Spot market translation.
//!
//! Machines map 1:1 to instances, so a spot instance is always one-time and
//! terminated on interruption. Hibernate, stop and persistent requests are
//! never produced.

use cloud_client::{InstanceMarketOptions, SpotOptions};
use crds::SpotMarketOptions;

/// Market type for spot instances
pub const MARKET_TYPE_SPOT: &str = "spot";
/// Interruption behaviour
pub const INTERRUPTION_TERMINATE: &str = "terminate";
/// Request type
pub const SPOT_ONE_TIME: &str = "one-time";

/// Market options for the launch request; `None` means on-demand
#[must_use]
pub fn market_options(spot: Option<&SpotMarketOptions>) -> Option<InstanceMarketOptions> {
    let spot = spot?;
    Some(InstanceMarketOptions {
        market_type: MARKET_TYPE_SPOT.to_string(),
        spot_options: SpotOptions {
            instance_interruption_behavior: INTERRUPTION_TERMINATE.to_string(),
            spot_instance_type: SPOT_ONE_TIME.to_string(),
            max_price: spot.max_price.clone().filter(|p| !p.is_empty()),
        },
    })
}

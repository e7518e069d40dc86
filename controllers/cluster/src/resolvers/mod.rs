//! Resource resolvers
//!
//! Functions translating spec plus observed snapshots into concrete request
//! parameters:
//! - `subnet`: which subnet an instance goes into
//! - `security_groups`: which groups an instance of a role carries
//! - `image`: which image an instance boots from
//! - `tags`: ownership tags and tag diffs
//! - `spot`: market options for spot instances

pub mod image;
pub mod security_groups;
pub mod spot;
pub mod subnet;
pub mod tags;

/// Converts spec filters into provider filters
pub(crate) fn to_cloud_filters(filters: &[crds::Filter]) -> Vec<cloud_client::Filter> {
    filters
        .iter()
        .map(|f| cloud_client::Filter::new(f.name.clone(), f.values.clone()))
        .collect()
}

//! Describe filter matching for MockCloudClient
//!
//! A resource matches a filter set when every filter has at least one value
//! matching one of the resource's values for that field. Values support the
//! provider's `*` and `?` wildcards.

use crate::models::*;

pub(crate) trait Filterable {
    /// Values of the named field; empty when the field is unknown or unset
    fn field_values(&self, name: &str) -> Vec<String>;
}

pub(crate) fn matches_all<T: Filterable>(item: &T, filters: &[Filter]) -> bool {
    filters.iter().all(|filter| {
        let values = item.field_values(&filter.name);
        filter
            .values
            .iter()
            .any(|pattern| values.iter().any(|value| glob_match(pattern, value)))
    })
}

pub(crate) fn glob_match(pattern: &str, value: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let value: Vec<char> = value.chars().collect();
    let (mut p, mut v) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while v < value.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == value[v]) {
            p += 1;
            v += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            backtrack = Some((p, v));
            p += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            v = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|c| *c == '*')
}

fn tag_values(tags: &[Tag], name: &str) -> Option<Vec<String>> {
    if name == "tag-key" {
        return Some(tags.iter().map(|t| t.key.clone()).collect());
    }
    let key = name.strip_prefix("tag:")?;
    Some(tag_value(tags, key).map(str::to_string).into_iter().collect())
}

fn one(value: &str) -> Vec<String> {
    vec![value.to_string()]
}

fn maybe(value: Option<&String>) -> Vec<String> {
    value.cloned().into_iter().collect()
}

impl Filterable for Vpc {
    fn field_values(&self, name: &str) -> Vec<String> {
        if let Some(values) = tag_values(&self.tags, name) {
            return values;
        }
        match name {
            "vpc-id" => one(&self.vpc_id),
            "cidr-block" => one(&self.cidr_block),
            "state" => one(&self.state),
            _ => Vec::new(),
        }
    }
}

impl Filterable for Subnet {
    fn field_values(&self, name: &str) -> Vec<String> {
        if let Some(values) = tag_values(&self.tags, name) {
            return values;
        }
        match name {
            "subnet-id" => one(&self.subnet_id),
            "vpc-id" => one(&self.vpc_id),
            "cidr-block" => one(&self.cidr_block),
            "availability-zone" => one(&self.availability_zone),
            "state" => one(&self.state),
            _ => Vec::new(),
        }
    }
}

impl Filterable for SecurityGroup {
    fn field_values(&self, name: &str) -> Vec<String> {
        if let Some(values) = tag_values(&self.tags, name) {
            return values;
        }
        match name {
            "group-id" => one(&self.group_id),
            "group-name" => one(&self.group_name),
            "vpc-id" => one(&self.vpc_id),
            _ => Vec::new(),
        }
    }
}

impl Filterable for CloudInstance {
    fn field_values(&self, name: &str) -> Vec<String> {
        if let Some(values) = tag_values(&self.tags, name) {
            return values;
        }
        match name {
            "instance-id" => one(&self.instance_id),
            "instance-state-name" => one(&self.state),
            "instance-type" => one(&self.instance_type),
            "vpc-id" => maybe(self.vpc_id.as_ref()),
            "subnet-id" => maybe(self.subnet_id.as_ref()),
            _ => Vec::new(),
        }
    }
}

impl Filterable for NetworkInterface {
    fn field_values(&self, name: &str) -> Vec<String> {
        match name {
            "network-interface-id" => one(&self.network_interface_id),
            "subnet-id" => one(&self.subnet_id),
            "vpc-id" => one(&self.vpc_id),
            "attachment.instance-id" => maybe(self.attachment_instance_id.as_ref()),
            _ => Vec::new(),
        }
    }
}

impl Filterable for Image {
    fn field_values(&self, name: &str) -> Vec<String> {
        match name {
            "image-id" => one(&self.image_id),
            "name" => one(&self.name),
            "owner-id" => one(&self.owner_id),
            _ => Vec::new(),
        }
    }
}

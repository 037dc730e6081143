//! Conversions between engine inputs and EC2 request/response types

use crate::error::{AwsError, Result};
use aws_sdk_ec2::types::{self, ResourceType, Tag, TagSpecification};
use serde::de::DeserializeOwned;
use settle::{FindInput, ResourceData};
use std::collections::BTreeMap;

/// EC2 `Filter` list for a find input; `None` when the input is unfiltered
pub fn ec2_filters(input: &FindInput) -> Option<Vec<types::Filter>> {
    input.filters.as_ref().map(|filters| {
        filters
            .iter()
            .map(|f| {
                types::Filter::builder()
                    .name(&f.name)
                    .set_values(Some(f.values.clone()))
                    .build()
            })
            .collect()
    })
}

/// Identifier list for a find input; `None` when any identifier matches
pub fn ec2_ids(input: &FindInput) -> Option<Vec<String>> {
    if input.identifiers.is_empty() {
        None
    } else {
        Some(input.identifiers.iter().cloned().collect())
    }
}

pub fn tags_to_map(tags: &[Tag]) -> BTreeMap<String, String> {
    tags.iter()
        .filter_map(|t| Some((t.key()?.to_string(), t.value().unwrap_or_default().to_string())))
        .collect()
}

/// Tag specification applied at creation; `None` for an empty tag map
pub fn tag_specification(
    resource_type: ResourceType,
    tags: &BTreeMap<String, String>,
) -> Option<TagSpecification> {
    if tags.is_empty() {
        return None;
    }
    let tags = tags
        .iter()
        .map(|(k, v)| Tag::builder().key(k).value(v).build())
        .collect();
    Some(
        TagSpecification::builder()
            .resource_type(resource_type)
            .set_tags(Some(tags))
            .build(),
    )
}

/// Deserialize the attribute map of `data` into a typed request spec
pub(crate) fn spec_from_data<T: DeserializeOwned>(data: &ResourceData) -> Result<T> {
    let object: serde_json::Map<String, serde_json::Value> = data
        .attributes
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    serde_json::from_value(serde_json::Value::Object(object))
        .map_err(|e| AwsError::invalid(data.kind.clone(), e.to_string()))
}

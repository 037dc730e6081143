//! Equality filters for describe calls
//!
//! Filters are always built in key order so that the same logical query
//! serializes to the same request, whatever order the caller collected its
//! attributes in.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A single `name = any-of(values)` constraint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    /// Attribute name understood by the backend (e.g. "availability-zone")
    pub name: String,

    /// Accepted values; never empty, sorted, no duplicates
    pub values: Vec<String>,
}

impl Filter {
    /// Build a filter, returning `None` when no non-empty value remains
    pub fn new<I, S>(name: impl Into<String>, values: I) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let values: BTreeSet<String> = values
            .into_iter()
            .map(Into::into)
            .filter(|v| !v.is_empty())
            .collect();

        if values.is_empty() {
            return None;
        }

        Some(Self {
            name: name.into(),
            values: values.into_iter().collect(),
        })
    }

    pub fn matches(&self, value: &str) -> bool {
        self.values.iter().any(|v| v == value)
    }
}

/// Build single-valued filters from an attribute map.
///
/// Entries with an empty value are dropped: the caller means "unconstrained",
/// not "equals empty".
pub fn attribute_filters<I, K, V>(attributes: I) -> Vec<Filter>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    let sorted: BTreeMap<String, String> = attributes
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect();

    sorted
        .into_iter()
        .filter_map(|(name, value)| Filter::new(name, [value]))
        .collect()
}

/// Set-valued variant of [`attribute_filters`]
pub fn attribute_filters_multi<I, K, V, S>(attributes: I) -> Vec<Filter>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut sorted: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for (name, values) in attributes {
        sorted
            .entry(name.into())
            .or_default()
            .extend(values.into_iter().map(Into::into));
    }

    sorted
        .into_iter()
        .filter_map(|(name, values)| Filter::new(name, values))
        .collect()
}

/// Build `tag:<key>` filters from a tag map
pub fn tag_filters<I, K, V>(tags: I) -> Vec<Filter>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: Into<String>,
{
    attribute_filters(
        tags.into_iter()
            .map(|(k, v)| (format!("tag:{}", k.as_ref()), v.into())),
    )
}

/// Input to a describe call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindInput {
    /// Exact identifiers to look up; empty means "any"
    pub identifiers: BTreeSet<String>,

    /// Filters narrowing the query; `None` means "send no filter parameter"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filters: Option<Vec<Filter>>,
}

impl FindInput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up one resource by identifier
    pub fn by_id(id: impl Into<String>) -> Self {
        Self::new().with_id(id)
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        let id = id.into();
        if !id.is_empty() {
            self.identifiers.insert(id);
        }
        self
    }

    /// Append filters; an empty list leaves the input unfiltered
    pub fn with_filters(mut self, filters: Vec<Filter>) -> Self {
        if filters.is_empty() {
            return self;
        }
        let mut merged = self.filters.take().unwrap_or_default();
        merged.extend(filters);
        merged.sort_by(|a, b| a.name.cmp(&b.name));
        self.filters = Some(merged);
        self
    }

    /// The single identifier asked for, if exactly one was given
    pub fn exact_id(&self) -> Option<&str> {
        if self.identifiers.len() == 1 {
            self.identifiers.iter().next().map(String::as_str)
        } else {
            None
        }
    }

    pub fn filters(&self) -> &[Filter] {
        self.filters.as_deref().unwrap_or(&[])
    }

    pub fn is_unconstrained(&self) -> bool {
        self.identifiers.is_empty() && self.filters.is_none()
    }
}

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{LimitRange, LimitRangeItem};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::client::LimitRangeClient;
use crate::error::Result;
use crate::models::Resources;
use crate::quantity::{resources_from_list, resources_to_list};

/// Effective container and pod limit range items of a namespace
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LimitRangeItems {
    pub container: Option<LimitRangeItem>,
    pub pod: Option<LimitRangeItem>,
}

fn list_of(list: &Option<BTreeMap<String, Quantity>>) -> Resources {
    list.as_ref().map(resources_from_list).unwrap_or_default()
}

fn keep_lower(into: &mut Resources, from: Resources) {
    for (resource, amount) in from {
        into.entry(resource)
            .and_modify(|a| *a = (*a).min(amount))
            .or_insert(amount);
    }
}

fn keep_higher(into: &mut Resources, from: Resources) {
    for (resource, amount) in from {
        into.entry(resource)
            .and_modify(|a| *a = (*a).max(amount))
            .or_insert(amount);
    }
}

fn non_empty(resources: Resources) -> Option<BTreeMap<String, Quantity>> {
    (!resources.is_empty()).then(|| resources_to_list(&resources))
}

/// Combines every item of `type_` across the namespace's limit ranges into
/// the strictest single item: lowest max, highest min, lowest default.
pub fn merge_limit_range_items(ranges: &[LimitRange], type_: &str) -> Option<LimitRangeItem> {
    let mut found = false;
    let mut max = Resources::new();
    let mut min = Resources::new();
    let mut default = Resources::new();
    for item in ranges
        .iter()
        .filter_map(|r| r.spec.as_ref())
        .flat_map(|s| s.limits.iter())
        .filter(|i| i.type_ == type_)
    {
        found = true;
        keep_lower(&mut max, list_of(&item.max));
        keep_higher(&mut min, list_of(&item.min));
        keep_lower(&mut default, list_of(&item.default));
    }
    if !found {
        return None;
    }
    Some(LimitRangeItem {
        type_: type_.to_string(),
        max: non_empty(max),
        min: non_empty(min),
        default: non_empty(default),
        ..Default::default()
    })
}

impl LimitRangeItems {
    pub fn from_ranges(ranges: &[LimitRange]) -> Self {
        Self {
            container: merge_limit_range_items(ranges, "Container"),
            pod: merge_limit_range_items(ranges, "Pod"),
        }
    }
}

/// Reads limit ranges through the client and merges them per namespace
#[derive(Clone)]
pub struct LimitRangeCalculator {
    client: Arc<dyn LimitRangeClient>,
}

impl LimitRangeCalculator {
    pub fn new(client: Arc<dyn LimitRangeClient>) -> Self {
        Self { client }
    }

    pub async fn items(&self, namespace: &str) -> Result<LimitRangeItems> {
        let ranges = self.client.list_limit_ranges(namespace).await?;
        Ok(LimitRangeItems::from_ranges(&ranges))
    }
}

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use k8s_openapi::api::autoscaling::v1::Scale;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use tracing::debug;

use super::selector::Selector;
use crate::client::{ControllerClient, ScaleClient, ScaleMapping};
use crate::error::{Error, Result};

/// Controller kinds resolved from informer caches instead of the scale sub-resource
pub const WELL_KNOWN_KINDS: [&str; 7] = [
    "Deployment",
    "StatefulSet",
    "DaemonSet",
    "ReplicaSet",
    "ReplicationController",
    "Job",
    "CronJob",
];

/// Identity of a controller in the ownership chain
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ControllerKey {
    pub namespace: String,
    pub kind: String,
    pub name: String,
    pub api_version: Option<String>,
}

impl ControllerKey {
    pub fn new(
        namespace: impl Into<String>,
        kind: impl Into<String>,
        name: impl Into<String>,
        api_version: Option<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            kind: kind.into(),
            name: name.into(),
            api_version,
        }
    }

    pub fn from_owner(namespace: &str, owner: &OwnerReference) -> Self {
        Self::new(
            namespace,
            owner.kind.clone(),
            owner.name.clone(),
            Some(owner.api_version.clone()),
        )
    }

    /// API group, empty for the core group
    pub fn group(&self) -> &str {
        match self.api_version.as_deref() {
            Some(av) => av.rsplit_once('/').map(|(g, _)| g).unwrap_or(""),
            None => "",
        }
    }

    pub fn is_well_known(&self) -> bool {
        WELL_KNOWN_KINDS.contains(&self.kind.as_str())
    }
}

impl fmt::Display for ControllerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.kind, self.name)
    }
}

/// The owner reference flagged as controller, if any
pub fn controller_of(owners: &[OwnerReference]) -> Option<&OwnerReference> {
    owners.iter().find(|o| o.controller == Some(true))
}

/// Walks ownership chains and reads scale sub-resources
#[derive(Clone)]
pub struct ControllerFetcher {
    controllers: Arc<dyn ControllerClient>,
    scales: Arc<dyn ScaleClient>,
}

impl ControllerFetcher {
    pub fn new(controllers: Arc<dyn ControllerClient>, scales: Arc<dyn ScaleClient>) -> Self {
        Self {
            controllers,
            scales,
        }
    }

    pub fn scales(&self) -> &Arc<dyn ScaleClient> {
        &self.scales
    }

    pub fn controllers(&self) -> &Arc<dyn ControllerClient> {
        &self.controllers
    }

    /// Follows controller owner references from `key` upwards and returns the
    /// last controller that is well-known or exposes a scale sub-resource.
    ///
    /// A missing owner ends the walk. Cycles and node owners are errors.
    pub async fn find_topmost_well_known_or_scalable(
        &self,
        key: &ControllerKey,
    ) -> Result<Option<ControllerKey>> {
        reject_node(&key.kind)?;
        let mut topmost = None;
        if self.is_well_known_or_scalable(key).await {
            topmost = Some(key.clone());
        }

        let mut visited = HashSet::new();
        visited.insert(key.clone());
        let mut current = key.clone();
        loop {
            let Some(owner) = self.parent_of(&current).await? else {
                return Ok(topmost);
            };
            if !visited.insert(owner.clone()) {
                return Err(Error::owner_cycle(owner.to_string()));
            }
            if self.is_well_known_or_scalable(&owner).await {
                topmost = Some(owner.clone());
            }
            current = owner;
        }
    }

    async fn is_well_known_or_scalable(&self, key: &ControllerKey) -> bool {
        if key.is_well_known() {
            return true;
        }
        self.get_scale(key).await.is_ok()
    }

    async fn parent_of(&self, key: &ControllerKey) -> Result<Option<ControllerKey>> {
        if key.is_well_known() {
            let Some(info) = self.controllers.get_controller(key).await? else {
                return Ok(None);
            };
            return owner_key(&key.namespace, &info.owner_references);
        }
        match self.scale_of(key).await {
            Ok(Some((_, scale))) => {
                let owners = scale.metadata.owner_references.unwrap_or_default();
                owner_key(&key.namespace, &owners)
            }
            // Kinds without a scale sub-resource end the walk
            Ok(None) => Ok(None),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(Error::scale(format!(
                "unhandled targetRef {} / {} / {}, last error {}",
                key.api_version.as_deref().unwrap_or(""),
                key.kind,
                key.name,
                e
            ))),
        }
    }

    /// Reads the scale sub-resource, trying each REST mapping in turn and
    /// returning the first error when none succeeds
    pub async fn get_scale(&self, key: &ControllerKey) -> Result<(ScaleMapping, Scale)> {
        self.scale_of(key)
            .await?
            .ok_or_else(|| Error::scale(format!("no scalable resource mapping for {}", key)))
    }

    /// `None` when the kind has no scale sub-resource at all
    async fn scale_of(&self, key: &ControllerKey) -> Result<Option<(ScaleMapping, Scale)>> {
        let mappings = self.scales.mappings(key.group(), &key.kind).await?;
        if mappings.is_empty() {
            return Ok(None);
        }
        let mut first_error = None;
        for mapping in mappings {
            match self
                .scales
                .get_scale(&mapping, &key.namespace, &key.name)
                .await
            {
                Ok(scale) => return Ok(Some((mapping, scale))),
                Err(e) => {
                    debug!(controller = %key, mapping = ?mapping, error = %e, "Scale lookup failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        Err(first_error.unwrap_or_else(|| {
            Error::scale(format!("no scalable resource mapping for {}", key))
        }))
    }

    /// Pod selector of the controller: from the informer for well-known
    /// kinds, from the scale sub-resource's status otherwise
    pub async fn selector_for(&self, key: &ControllerKey) -> Result<Selector> {
        if key.is_well_known() {
            let info = self
                .controllers
                .get_controller(key)
                .await?
                .ok_or_else(|| Error::unknown_key(key.to_string()))?;
            let selector = info.selector.ok_or_else(|| {
                Error::validation(format!("{} has no pod selector", key))
            })?;
            return Selector::from_label_selector(&selector);
        }
        let (_, scale) = self.get_scale(key).await?;
        let selector = scale
            .status
            .and_then(|s| s.selector)
            .ok_or_else(|| Error::scale(format!("scale of {} has no selector", key)))?;
        Selector::parse(&selector)
    }
}

fn reject_node(kind: &str) -> Result<()> {
    if kind == "Node" {
        return Err(Error::invalid_owner("node is not a valid owner"));
    }
    Ok(())
}

fn owner_key(namespace: &str, owners: &[OwnerReference]) -> Result<Option<ControllerKey>> {
    let Some(owner) = controller_of(owners) else {
        return Ok(None);
    };
    reject_node(&owner.kind)?;
    Ok(Some(ControllerKey::from_owner(namespace, owner)))
}

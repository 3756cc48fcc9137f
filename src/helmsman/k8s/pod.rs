use crate::helmsman::k8s::ObjectMeta;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Pod {
    #[serde(default)]
    pub metadata: PodMeta,
    #[serde(default)]
    pub spec: PodSpec,
}

/// Pod metadata carries owner references on top of the common fields.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodMeta {
    #[serde(flatten)]
    pub common: ObjectMeta,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OwnerReference {
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
}

impl Pod {
    pub fn name(&self) -> &str {
        self.metadata.common.name.as_deref().unwrap_or_default()
    }

    pub fn namespace(&self) -> &str {
        self.metadata.common.namespace.as_deref().unwrap_or("default")
    }

    pub fn is_daemonset_managed(&self) -> bool {
        self.metadata
            .owner_references
            .iter()
            .any(|owner| owner.kind == "DaemonSet")
    }

    /// Static pods are mirrored into the API by kubelet and cannot be evicted.
    pub fn is_mirror(&self) -> bool {
        self.metadata
            .common
            .annotations
            .contains_key("kubernetes.io/config.mirror")
    }
}

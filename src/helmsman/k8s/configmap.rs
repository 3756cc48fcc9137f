use crate::helmsman::k8s::ObjectMeta;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigMap {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub data: HashMap<String, String>,
}

impl ConfigMap {
    pub fn new(namespace: &str, name: &str) -> Self {
        ConfigMap {
            metadata: ObjectMeta::named(namespace, name),
            data: HashMap::new(),
        }
    }

    pub fn with_entry(mut self, key: &str, value: String) -> Self {
        self.data.insert(key.to_string(), value);
        self
    }
}

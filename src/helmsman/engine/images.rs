use crate::helmsman::op::{
    API_SERVER_CONTAINER, CONTROLLER_MANAGER_CONTAINER, ETCD_CONTAINER, ETCD_RIVERS_CONTAINER,
    KUBELET_CONTAINER, PROXY_CONTAINER, RIVERS_CONTAINER, SCHEDULER_CONTAINER,
};

/// Image carrying the rivers proxy and the engine's node-side tools.
pub const TOOLS_IMAGE: &str = "quay.io/helmsman/helmsman-tools:1.30.0";
pub const ETCD_IMAGE: &str = "quay.io/helmsman/etcd:3.5.12";
pub const KUBERNETES_IMAGE: &str = "quay.io/helmsman/kubernetes:1.30.2";

/// Resolves the image for a well-known container name.
pub fn image_for(container: &str) -> &'static str {
    match container {
        RIVERS_CONTAINER | ETCD_RIVERS_CONTAINER => TOOLS_IMAGE,
        ETCD_CONTAINER => ETCD_IMAGE,
        API_SERVER_CONTAINER | CONTROLLER_MANAGER_CONTAINER | SCHEDULER_CONTAINER
        | KUBELET_CONTAINER | PROXY_CONTAINER => KUBERNETES_IMAGE,
        _ => TOOLS_IMAGE,
    }
}

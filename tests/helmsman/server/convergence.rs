use helmsman::helmsman::cluster::status::ClusterStatus;
use helmsman::helmsman::cluster::{Cluster, Constraints};
use helmsman::helmsman::op::{Operator, Phase};
use helmsman::helmsman::reboot::RebootArgs;
use helmsman::helmsman::server::strategy::{decide_ops, DecideConfig};
use helmsman::helmsman::test_support::{connected_status, converged_status, test_cluster};

/// Applies the node-level effect of one operation to the observed status,
/// as a perfect execution would.
fn apply(op_name: &str, targets: &[String], status: &mut ClusterStatus, cluster: &Cluster) {
    let model = converged_status(cluster);

    match op_name {
        "rivers-bootstrap" | "rivers-restart" => {
            for target in targets {
                status.node_statuses.get_mut(target).unwrap().rivers =
                    model.node_statuses[target].rivers.clone();
            }
        }
        "etcd-rivers-bootstrap" | "etcd-rivers-restart" => {
            for target in targets {
                status.node_statuses.get_mut(target).unwrap().etcd_rivers =
                    model.node_statuses[target].etcd_rivers.clone();
            }
        }
        "etcd-bootstrap" | "etcd-start" | "etcd-wait-cluster" => {
            for target in targets {
                status.node_statuses.get_mut(target).unwrap().etcd =
                    model.node_statuses[target].etcd.clone();
            }
            status.etcd = model.etcd.clone();
        }
        "apiserver-restart" => {
            for target in targets {
                status.node_statuses.get_mut(target).unwrap().api_server =
                    model.node_statuses[target].api_server.clone();
            }
        }
        "controller-manager-bootstrap" | "controller-manager-restart" => {
            for target in targets {
                status.node_statuses.get_mut(target).unwrap().controller_manager =
                    model.node_statuses[target].controller_manager.clone();
            }
        }
        "scheduler-bootstrap" | "scheduler-restart" => {
            for target in targets {
                status.node_statuses.get_mut(target).unwrap().scheduler =
                    model.node_statuses[target].scheduler.clone();
            }
        }
        "kubelet-bootstrap" | "kubelet-restart" => {
            for target in targets {
                status.node_statuses.get_mut(target).unwrap().kubelet =
                    model.node_statuses[target].kubelet.clone();
            }
        }
        "kube-proxy-bootstrap" | "kube-proxy-restart" => {
            for target in targets {
                status.node_statuses.get_mut(target).unwrap().proxy =
                    model.node_statuses[target].proxy.clone();
            }
        }
        other => panic!("simulation does not know operation {other}"),
    }

    // Once etcd and the apiservers run, the cluster view follows.
    let all_up = cluster.nodes.iter().filter(|n| n.control_plane).all(|n| {
        status.node_statuses[&n.address].api_server.service.running
    });
    if all_up && status.etcd.is_healthy {
        status.kubernetes = model.kubernetes.clone();
    }
}

/// A fresh cluster must walk the cascade forward every tick and reach the
/// Kubernetes maintenance phase in a bounded number of ticks; the node
/// bootstrap never loops.
#[test]
fn fresh_cluster_progresses_to_maintenance() {
    let cluster = test_cluster(3, 2);
    let constraints = Constraints {
        control_plane_count: 3,
        ..Default::default()
    };
    let config = DecideConfig::default();
    let mut status = connected_status(&cluster);

    let mut phases = Vec::new();
    for _tick in 0..20 {
        let (ops, phase) = decide_ops(
            &cluster,
            &status,
            &constraints,
            &[],
            &RebootArgs::default(),
            &config,
        );
        phases.push(phase);
        if phase == Phase::K8sMaintain || phase == Phase::Completed {
            assert!(phases.contains(&Phase::Rivers), "phases: {phases:?}");
            assert!(phases.contains(&Phase::EtcdBoot), "phases: {phases:?}");
            assert!(phases.contains(&Phase::K8sStart), "phases: {phases:?}");
            return;
        }
        assert!(!ops.is_empty(), "{phase:?} emitted nothing");
        for op in &ops {
            apply(op.name(), &op.targets(), &mut status, &cluster);
        }
    }
    panic!("cluster did not progress: {phases:?}");
}

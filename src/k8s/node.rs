//! The virtual node object

use chrono::Utc;
use k8s_openapi::api::core::v1::{
    DaemonEndpoint, Node, NodeAddress, NodeCondition, NodeDaemonEndpoints, NodeSpec, NodeStatus,
    NodeSystemInfo, Taint,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use std::collections::BTreeMap;

use crate::config::{NodeSettings, Quota};

pub const K8S_VERSION: &str = "v1.26.3";
pub const GPU_RESOURCE: &str = "nvidia.com/gpu";

/// Everything needed to describe the node to the API server
#[derive(Debug, Clone)]
pub struct NodeBlueprint {
    pub name: String,
    pub operating_system: String,
    pub settings: NodeSettings,
    pub taint: bool,
}

impl NodeBlueprint {
    pub fn kubelet_version() -> String {
        format!("{}-vk-apptainer-{}", K8S_VERSION, crate::VERSION)
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        let os = self.operating_system.to_lowercase();
        BTreeMap::from([
            ("type".to_string(), "virtual-kubelet".to_string()),
            ("kubernetes.io/role".to_string(), "agent".to_string()),
            ("kubernetes.io/hostname".to_string(), self.name.clone()),
            (
                "alpha.service-controller.kubernetes.io/exclude-balancer".to_string(),
                "true".to_string(),
            ),
            (
                "node.kubernetes.io/exclude-from-external-load-balancers".to_string(),
                "true".to_string(),
            ),
            ("beta.kubernetes.io/os".to_string(), os.clone()),
            ("kubernetes.io/os".to_string(), os),
        ])
    }

    pub fn taints(&self) -> Vec<Taint> {
        if !self.taint {
            return Vec::new();
        }
        let t = &self.settings.taint;
        vec![Taint {
            key: t.key.clone(),
            value: Some(t.value.clone()),
            effect: t.effect.clone(),
            time_added: None,
        }]
    }

    pub fn build(&self) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                labels: Some(self.labels()),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                taints: Some(self.taints()),
                ..Default::default()
            }),
            status: Some(self.status()),
        }
    }

    /// Status with fresh heartbeat times
    pub fn status(&self) -> NodeStatus {
        let capacity = capacity(&self.settings.quota);
        let addresses = self.settings.pod_ip.as_ref().map(|ip| {
            vec![NodeAddress {
                type_: "InternalIP".to_string(),
                address: ip.clone(),
            }]
        });

        NodeStatus {
            capacity: Some(capacity.clone()),
            allocatable: Some(capacity),
            conditions: Some(conditions()),
            addresses,
            daemon_endpoints: Some(NodeDaemonEndpoints {
                kubelet_endpoint: Some(DaemonEndpoint {
                    port: self.settings.kubelet_port,
                }),
            }),
            node_info: Some(NodeSystemInfo {
                operating_system: self.operating_system.clone(),
                architecture: std::env::consts::ARCH.to_string(),
                kubelet_version: Self::kubelet_version(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

fn capacity(quota: &Quota) -> BTreeMap<String, Quantity> {
    let mut resources = BTreeMap::from([
        ("cpu".to_string(), Quantity(quota.cpu.clone())),
        ("memory".to_string(), Quantity(quota.memory.clone())),
        ("pods".to_string(), Quantity(quota.pods.clone())),
    ]);
    if let Some(gpu) = &quota.gpu {
        resources.insert(GPU_RESOURCE.to_string(), Quantity(gpu.clone()));
    }
    resources
}

fn conditions() -> Vec<NodeCondition> {
    let now = Time(Utc::now());
    let condition = |type_: &str, status: &str, reason: &str, message: &str| NodeCondition {
        type_: type_.to_string(),
        status: status.to_string(),
        last_heartbeat_time: Some(now.clone()),
        last_transition_time: Some(now.clone()),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
    };

    vec![
        condition("Ready", "True", "KubeletReady", "kubelet is ready."),
        condition(
            "OutOfDisk",
            "False",
            "KubeletHasSufficientDisk",
            "kubelet has sufficient disk space available",
        ),
        condition(
            "MemoryPressure",
            "False",
            "KubeletHasSufficientMemory",
            "kubelet has sufficient memory available",
        ),
        condition(
            "DiskPressure",
            "False",
            "KubeletHasNoDiskPressure",
            "kubelet has no disk pressure",
        ),
        condition(
            "NetworkUnavailable",
            "False",
            "RouteCreated",
            "RouteController created a route",
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TaintSettings;

    fn blueprint(taint: bool) -> NodeBlueprint {
        NodeBlueprint {
            name: "vk-apptainer".to_string(),
            operating_system: "Linux".to_string(),
            settings: NodeSettings {
                kubelet_port: 10250,
                pod_ip: Some("10.0.0.5".to_string()),
                taint: TaintSettings {
                    key: "virtual-kubelet.io/provider".to_string(),
                    value: "apptainer".to_string(),
                    effect: "NoSchedule".to_string(),
                },
                quota: Quota {
                    gpu: Some("4".to_string()),
                    ..Default::default()
                },
            },
            taint,
        }
    }

    #[test]
    fn test_node_capacity_and_labels() {
        let node = blueprint(true).build();
        let status = node.status.unwrap();
        let capacity = status.capacity.unwrap();
        assert_eq!(capacity["cpu"], Quantity("64".to_string()));
        assert_eq!(capacity["memory"], Quantity("512Gi".to_string()));
        assert_eq!(capacity["pods"], Quantity("640".to_string()));
        assert_eq!(capacity[GPU_RESOURCE], Quantity("4".to_string()));
        assert_eq!(status.allocatable.unwrap().len(), 4);

        let labels = node.metadata.labels.unwrap();
        assert_eq!(labels["kubernetes.io/os"], "linux");
        assert_eq!(labels["type"], "virtual-kubelet");

        let info = status.node_info.unwrap();
        assert!(info.kubelet_version.starts_with("v1.26.3-vk-apptainer-"));
        assert_eq!(
            status.daemon_endpoints.unwrap().kubelet_endpoint.unwrap().port,
            10250
        );
    }

    #[test]
    fn test_conditions_report_ready() {
        let status = blueprint(true).status();
        let conditions = status.conditions.unwrap();
        assert_eq!(conditions.len(), 5);
        let ready = conditions.iter().find(|c| c.type_ == "Ready").unwrap();
        assert_eq!(ready.status, "True");
        assert!(conditions
            .iter()
            .filter(|c| c.type_ != "Ready")
            .all(|c| c.status == "False"));
    }

    #[test]
    fn test_taint_can_be_disabled() {
        assert_eq!(blueprint(true).taints().len(), 1);
        assert_eq!(blueprint(true).taints()[0].effect, "NoSchedule");
        assert!(blueprint(false).taints().is_empty());
    }
}

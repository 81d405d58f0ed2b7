use vk_apptainer::config::{parse_duration, NodeSettings};
use vk_apptainer::error::VkError;
use vk_apptainer::k8s::NodeBlueprint;
use vk_apptainer_provider::ProviderError;

#[test]
fn test_error_types() {
    let err = VkError::from(ProviderError::NotFound {
        name: "test-pod".to_string(),
        namespace: "default".to_string(),
    });

    assert!(err.to_string().contains("test-pod"));
    assert!(err.to_string().contains("default"));
}

#[test]
fn test_version_const() {
    assert!(!vk_apptainer::VERSION.is_empty());
    assert!(NodeBlueprint::kubelet_version().ends_with(vk_apptainer::VERSION));
}

#[test]
fn test_node_from_environment_defaults() {
    let settings = NodeSettings::from_lookup(|_| None).unwrap();
    let node = NodeBlueprint {
        name: "vk-apptainer".to_string(),
        operating_system: "Linux".to_string(),
        settings,
        taint: true,
    }
    .build();

    assert_eq!(node.metadata.name.as_deref(), Some("vk-apptainer"));
    let taints = node.spec.and_then(|s| s.taints).unwrap();
    assert_eq!(taints[0].key, "virtual-kubelet.io/provider");
    assert!(node.status.unwrap().addresses.is_none());
}

#[test]
fn test_durations() {
    assert!(parse_duration("90s").is_ok());
    assert!(parse_duration("-1s").is_err());
}

pub mod client;
pub mod node;
pub mod notifier;
pub mod watcher;

pub use client::K8sClient;
pub use node::NodeBlueprint;
pub use notifier::KubeStatusSink;
pub use watcher::PodWatcher;

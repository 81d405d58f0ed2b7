pub mod collector;
pub mod exporter;

pub use collector::PrometheusMetrics;
pub use exporter::TextfileExporter;

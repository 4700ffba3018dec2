pub mod types;
pub mod config;
pub mod error;
pub mod layout;
pub mod metrics;
pub mod prepare;
pub mod report;
pub mod store;

// Re-export commonly used types for convenience
pub use types::{
    EnvironmentSpec, ExecutionMode, ExecutionStatus, IsolationStrategy, ReportFormat, TaskOutputs,
    TaskRecord, Variant, VariantOutcome,
};
pub use config::Config;
pub use error::{ConfigError, EvalError, StoreError};
pub use metrics::{MetricRecord, MetricSummary};

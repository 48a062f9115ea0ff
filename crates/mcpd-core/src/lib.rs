//! Shared data model for the mcpd host: server specs, fingerprints, the
//! catalog, the error taxonomy, and the process-wide log bus.

mod caps;
mod catalog;
mod error;
mod logbus;
mod redact;
mod spec;

pub use caps::CapabilityFlags;
pub use catalog::{
    BootstrapMode, Catalog, NamespaceStrategy, ObservabilityConfig, RpcAddr, RpcConfig,
    RuntimeConfig,
};
pub use error::HostError;
pub use logbus::{DEFAULT_SUBSCRIBER_CAPACITY, LogBus, LogLevel, LogRecord, LogStream};
pub use redact::{format_env, is_sensitive_key, redact_value};
pub use spec::{
    DEFAULT_PROTOCOL_VERSION, ExposeSpec, ServerSpec, SpecFingerprint, Strategy, TransportSpec,
};

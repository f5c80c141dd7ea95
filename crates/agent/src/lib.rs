//! publisher-agent-lib: signs price updates and streams them to brokers
//!
//! Raw value updates arrive over websockets (push or pull), a per signature
//! type processor decides what to sign, and signed batches fan out to every
//! broker the registry lists for this publisher.

pub mod config;
pub mod error;
pub mod incoming;
pub mod manager;
pub mod metadata;
pub mod model;
pub mod outgoing;
pub mod processor;
pub mod puller;
pub mod quantize;
pub mod registry;
pub mod runner;
pub mod server;
pub mod websocket;

pub use config::AgentConfig;
pub use error::{AgentError, ConfigError, ConnectionError, RegistryError, SendError};
pub use manager::{BrokerTable, ConnectionManager, ReconcileSummary};
pub use model::{SignedPriceUpdate, SignedPriceUpdateBatch, TriggerType, ValueUpdate};
pub use processor::{ProcessorConfig, ValueUpdateProcessor};
pub use registry::{BrokerRegistry, RegistryClient};
pub use runner::PublisherAgentRunner;

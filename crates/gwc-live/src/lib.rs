pub mod client;
pub mod config;
pub mod connectivity;
pub mod credentials;
pub mod dashboard;
pub mod metric_stream;
pub mod pairing;
pub mod push;
pub mod visibility;

pub use client::{ClientError, GatewayApi, GatewayClient};
pub use config::{ConfigError, ConsoleConfig};
pub use pairing::SessionClosed;

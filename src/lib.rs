pub mod config;
pub mod config_validation;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod parser;
pub mod relay;
pub mod server;
pub mod session;
pub mod tunnel;
pub mod upstream;

pub use config::{Config, ProxySettings};
pub use error::ProxyError;
pub use metrics::ProxyMetrics;
pub use parser::{ParserEvent, WireParser};
pub use relay::{RelayAction, RequestRelay};
pub use server::ProxyServer;
pub use upstream::{Target, UpstreamConnector};

pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod socks;
pub mod tls;
pub mod transport;

pub use config::Config;
pub use connection::{ConnectionState, TransportEvent};
pub use endpoint::{EndpointPublisher, EndpointState, EndpointWatcher, ProxyEndpoint};
pub use error::{Error, Result};
pub use socks::{ClientOptions, ShutdownHandle, Socks5Client};
pub use tls::{CertPolicy, PinStore, TlsOptions};
pub use transport::Transport;

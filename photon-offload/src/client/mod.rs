//! Live backend client.

pub mod connection;
pub mod discovery;
pub mod protocol;

pub use connection::{Connector, TcpConnection, TcpConnector, Transport};
pub use discovery::{normalize_endpoint, resolve_broker};
pub use protocol::{ClientSettings, ClientState, ProtocolClient};

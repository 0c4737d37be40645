//! Client side of the chat sync protocol: the reconnecting realtime channel,
//! the REST fallback and a session that keeps a local replica current.

pub mod connection;
pub mod rest;
pub mod session;

pub use connection::{
    ConnectionConfig, ConnectionManager, ConnectionObserver, ConnectionState, Connector,
    DisconnectReason, WsConnector,
};
pub use rest::RestClient;
pub use session::ChatSession;

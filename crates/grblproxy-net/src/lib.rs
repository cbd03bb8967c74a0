//! Network-facing layer: the client registry/write actor and the
//! line-oriented TCP server built on top of it.

pub mod connection;
pub mod server;

pub use connection::ConnectionManager;
pub use server::TcpServer;

//! OpenFlow channel layer: TCP accept loop and per-connection handlers.
pub mod acceptor;
pub mod handler;

pub use acceptor::ConnectionAcceptor;
pub use handler::{ChannelHandler, HandshakeState};

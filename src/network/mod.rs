//! Network communication layer: framing, transport security and the
//! accept loop.

pub mod codec;
pub mod server;
pub mod tls;

pub use codec::{read_frame, write_frame, MAX_FRAME_SIZE};
pub use server::{ConnectionHandler, NetworkServer};
pub use tls::{
    Acceptor, AsyncStream, BoxedStream, Connector, PlainAcceptor, PlainConnector, TlsAcceptor,
    TlsConnector,
};

pub mod connection;
pub mod data_channel;
pub mod ice;
pub mod session;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod mock;

pub use connection::WebRtcFactory;
pub use session::{NegotiationSession, StateOutcome};
pub use transport::{PeerEvent, Transport, TransportEvent, TransportEvents, TransportFactory};

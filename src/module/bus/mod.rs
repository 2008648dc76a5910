//! Scoped message bus
//!
//! Publish/subscribe events and correlated request/response calls between the
//! coordinator and its worker processes. Every registration carries an
//! [`AccessScope`] filter that each call's metadata must satisfy.

pub mod error;
pub mod listeners;
pub mod message_bus;
pub mod protocol;
pub mod scope;
pub mod transport;

pub use error::BusError;
pub use listeners::{
    event_listener, request_handler, subscriber_listener, BusEvent, BusRequest, ChangeKind,
    EventCallback, Origin, PeerId, RequestHandler, RequestHandlerRef, SubscriberCallback,
    SubscriberChange,
};
pub use message_bus::{MessageBus, PeerDrained, CORRELATION_ID_CEILING};
pub use protocol::{CorrelationId, Envelope, EnvelopeType};
pub use scope::{authorize, AccessScope, ScopeSet, SYSTEM_SCOPE};
pub use transport::{memory_pair, ChannelTransport, FramedTransport, Inbound, Transport};

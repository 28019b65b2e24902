//! Syncline client library.
//!
//! Mirrors the server's two data surfaces on the client side: a chat replica
//! that overlays optimistic local edits on authoritative rows, and a presence
//! mirror fed by diff broadcasts. [`transport`] provides the REST calls and a
//! reconnecting SSE subscriber; [`sync`] wires transport and replicas into
//! background loops that publish reconciled views on watch channels.

pub mod normalize;
pub mod presence;
pub mod replica;
pub mod sync;
pub mod ticker;
pub mod transport;

pub use normalize::{DEFAULT_WINDOW, normalize};
pub use presence::PresenceReplica;
pub use replica::ChatReplica;
pub use sync::{ChatSync, PresenceSync};
pub use ticker::Ticker;
pub use transport::{
    ChatTransport, ClientError, LiveClient, PresenceTransport, SseDecoder, SubscriptionHandle,
};

//! Wire models shared by the server, the client library, and tests.

pub mod channel;
pub mod envelope;
pub mod message;
pub mod presence;
pub mod timestamp;

pub use channel::Channel;
pub use envelope::UpdateEnvelope;
pub use message::{Message, MessageUpsert, UpsertReceipt};
pub use presence::{
    HeartbeatRequest, HeartbeatResponse, PresenceEntry, PresenceUpdate, PresenceUpsertRequest,
};
pub use timestamp::Timestamp;

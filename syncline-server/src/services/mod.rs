//! Domain services: sequenced chat log writes and the presence register.
//!
//! Each service owns a storage seam (a trait with a PostgreSQL and an
//! in-memory implementation) and the relay handle it broadcasts through.

pub mod chat_log;
pub mod presence;

pub use chat_log::{ChatLogError, ChatLogService, ChatLogStore, MemoryChatLog, PgChatLog};
pub use presence::{
    ExpiredEntry, MemoryPresenceStore, PgPresenceStore, PresenceError, PresenceService,
    PresenceStore, spawn_presence_sweeper,
};

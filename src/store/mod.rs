//! Persistence layer: libSQL-backed storage for clients, tags and messages.

pub mod libsql_backend;
pub mod migrations;
pub mod model;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use model::{
    Client, DeliveryStatus, Direction, InsertOutcome, NewInboundMessage, NewOutboundMessage,
    StoredMessage, normalize_tag,
};
pub use traits::ConversationStore;

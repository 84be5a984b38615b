//! Persistence layer: libSQL-backed storage for conversations, messages and the roster.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{ConversationRecord, ConversationStore};

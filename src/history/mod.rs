//! The retrieval pipeline: per-document state machines driven in cycles by
//! a dispatcher session.

mod document;
mod session;

pub use self::document::Document;
pub use self::session::{HistorySession, SessionContext};

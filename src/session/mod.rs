//! Session management
//!
//! Session lifecycle, the on-disk session store and CSV export.

pub mod export;
pub mod layout;
pub mod manager;

pub use export::export_session_csv;
pub use layout::{SessionLayout, MANIFEST_FILE};
pub use manager::{SessionEvent, SessionManager, SessionStatus};

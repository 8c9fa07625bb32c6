//! Authentication session management.
//!
//! This module provides:
//! - `Session`: the persisted bearer-token session with expiry and permissions
//! - `SessionStore`: create/read/validate/refresh/clear with an auto-refresh timer
//! - `SessionCodec`: pluggable encoding for the `secure_session` record
//! - `SessionEvent`: lifecycle notifications, including logouts from other contexts
//!
//! Tokens expire after 60 minutes by default and are refreshed 5 minutes
//! before expiry when auto refresh is enabled.

pub mod codec;
pub mod events;
pub mod session;
pub mod store;

pub use codec::{ObfuscatedCodec, SealedCodec, SessionCodec};
pub use events::SessionEvent;
pub use session::{Session, SessionConfig};
pub use store::{SessionStore, SessionStoreBuilder, StoreOptions};

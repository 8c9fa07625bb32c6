//! sessionkeep core - client-side authentication session cache.
//!
//! Persists one bearer-token session per profile in a key-value store,
//! checks expiry lazily, refreshes tokens through a pluggable exchange, and
//! announces logouts to every context sharing the store.

pub mod api;
pub mod auth;
pub mod clock;
pub mod error;
pub mod storage;
pub mod utils;

pub use api::{ExchangeError, HttpExchanger, RefreshExchanger, RefreshGrant, SimulatedExchanger};
pub use auth::{
    ObfuscatedCodec, SealedCodec, Session, SessionCodec, SessionConfig, SessionEvent,
    SessionStore, StoreOptions,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CodecError, SessionError, StoreError};
pub use storage::{FileStore, KeyValueStore, KeyringStore, MemoryStore};

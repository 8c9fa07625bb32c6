//! Refresh-token exchange.
//!
//! This module provides the `RefreshExchanger` seam the session store calls to
//! trade a refresh token for a new bearer token, plus two implementations:
//! - `HttpExchanger`: JSON POST to a refresh endpoint
//! - `SimulatedExchanger`: mints tokens locally for offline use and demos

pub mod client;
pub mod error;
pub mod simulated;

use std::collections::BTreeSet;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

pub use client::HttpExchanger;
pub use error::ExchangeError;
pub use simulated::SimulatedExchanger;

/// Successful exchange response.
///
/// `refresh_token` and `permissions` replace the session's values only when present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshGrant {
    pub token: String,
    /// Milliseconds since the Unix epoch
    pub expires_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<BTreeSet<String>>,
}

pub trait RefreshExchanger: Send + Sync {
    fn exchange<'a>(&'a self, refresh_token: &'a str)
        -> BoxFuture<'a, Result<RefreshGrant, ExchangeError>>;
}

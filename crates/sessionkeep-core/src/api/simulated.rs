//! Offline refresh exchange.
//!
//! Issues unsigned JWT-shaped tokens from the local clock. Useful when no
//! refresh endpoint is configured; nothing it issues is verifiable by a server.

use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Duration;
use futures::future::{self, BoxFuture, FutureExt};
use rand::rngs::OsRng;
use rand::RngCore;
use serde_json::json;

use super::{ExchangeError, RefreshExchanger, RefreshGrant};
use crate::auth::session::DEFAULT_TOKEN_EXPIRATION_MINUTES;
use crate::clock::{Clock, SystemClock};

pub struct SimulatedExchanger {
    clock: Arc<dyn Clock>,
    token_lifetime: Duration,
}

impl SimulatedExchanger {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            token_lifetime: Duration::minutes(DEFAULT_TOKEN_EXPIRATION_MINUTES),
        }
    }

    pub fn with_token_lifetime(mut self, lifetime: Duration) -> Self {
        self.token_lifetime = lifetime;
        self
    }

    fn mint(&self, refresh_token: &str) -> Result<RefreshGrant, ExchangeError> {
        if refresh_token.is_empty() {
            return Err(ExchangeError::Rejected("empty refresh token".to_string()));
        }

        let now = self.clock.now();
        let expires = now + self.token_lifetime;

        let header = URL_SAFE_NO_PAD.encode(json!({"alg": "none", "typ": "JWT"}).to_string());
        let payload = URL_SAFE_NO_PAD.encode(
            json!({"iat": now.timestamp(), "exp": expires.timestamp()}).to_string(),
        );
        let mut signature = [0u8; 16];
        OsRng.fill_bytes(&mut signature);

        Ok(RefreshGrant {
            token: format!("{}.{}.{}", header, payload, URL_SAFE_NO_PAD.encode(signature)),
            expires_at: expires.timestamp_millis(),
            refresh_token: None,
            permissions: None,
        })
    }
}

impl Default for SimulatedExchanger {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl RefreshExchanger for SimulatedExchanger {
    fn exchange<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> BoxFuture<'a, Result<RefreshGrant, ExchangeError>> {
        future::ready(self.mint(refresh_token)).boxed()
    }
}

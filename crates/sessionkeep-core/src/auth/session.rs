use std::collections::BTreeSet;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Token lifetime used when none is configured, and for legacy records without an expiry.
pub const DEFAULT_TOKEN_EXPIRATION_MINUTES: i64 = 60;

/// Refresh token lifetime used when none is configured.
pub const DEFAULT_REFRESH_TOKEN_EXPIRATION_DAYS: i64 = 7;

/// Permission that grants every other permission.
pub const ADMIN_PERMISSION: &str = "admin";

/// The persisted authentication session.
///
/// Field names serialize in camelCase so records written by the web client
/// (`sessionData`, `secure_session`) decode unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub token: String,
    pub user_id: String,
    /// Milliseconds since the Unix epoch
    pub expires_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Expiry of `refresh_token` itself, milliseconds since the Unix epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_expires_at: Option<i64>,
    #[serde(default)]
    pub permissions: BTreeSet<String>,
}

impl Session {
    pub fn is_expired_at(&self, now_millis: i64) -> bool {
        now_millis >= self.expires_at
    }

    /// The refresh token, if present and not past its own expiry
    pub fn usable_refresh_token(&self, now_millis: i64) -> Option<&str> {
        let expired = matches!(self.refresh_expires_at, Some(at) if now_millis >= at);
        if expired {
            return None;
        }
        self.refresh_token.as_deref()
    }

    pub fn expires_at_utc(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.expires_at).single()
    }

    pub fn time_until_expiry(&self, now_millis: i64) -> Duration {
        Duration::milliseconds(self.expires_at - now_millis)
    }

    pub fn has_permission(&self, name: &str) -> bool {
        self.permissions.contains(name)
    }
}

/// Options for a single [`SessionStore::create`](super::SessionStore::create) call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    pub token_expiration_minutes: i64,
    /// `None` issues no refresh token, so the session cannot be renewed.
    pub refresh_token_expiration_days: Option<i64>,
    pub auto_refresh: bool,
    /// Persist through the store's codec under `secure_session` instead of the plain keys.
    pub secure_storage: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            token_expiration_minutes: DEFAULT_TOKEN_EXPIRATION_MINUTES,
            refresh_token_expiration_days: Some(DEFAULT_REFRESH_TOKEN_EXPIRATION_DAYS),
            auto_refresh: true,
            secure_storage: false,
        }
    }
}

impl SessionConfig {
    pub fn with_expiration_minutes(mut self, minutes: i64) -> Self {
        self.token_expiration_minutes = minutes;
        self
    }

    pub fn without_refresh_token(mut self) -> Self {
        self.refresh_token_expiration_days = None;
        self
    }

    pub fn with_auto_refresh(mut self, enabled: bool) -> Self {
        self.auto_refresh = enabled;
        self
    }

    pub fn with_secure_storage(mut self, enabled: bool) -> Self {
        self.secure_storage = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session {
            token: "tok".into(),
            user_id: "u1".into(),
            expires_at: 10_000,
            refresh_token: Some("rt".into()),
            refresh_expires_at: Some(20_000),
            permissions: BTreeSet::new(),
        }
    }

    #[test]
    fn test_session_serializes_camel_case() {
        let json = serde_json::to_value(session()).unwrap();
        assert_eq!(json["userId"], "u1");
        assert_eq!(json["expiresAt"], 10_000);
        assert_eq!(json["refreshToken"], "rt");
        assert_eq!(json["permissions"], serde_json::json!([]));
    }

    #[test]
    fn test_session_parses_web_client_record() {
        // Written by the browser client: no refreshExpiresAt, unordered permissions
        let json = r#"{"token":"t","userId":"u","expiresAt":5,"permissions":["write","read","write"]}"#;
        let parsed: Session = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.refresh_token, None);
        assert_eq!(parsed.refresh_expires_at, None);
        assert_eq!(parsed.permissions.iter().collect::<Vec<_>>(), vec!["read", "write"]);
    }

    #[test]
    fn test_is_expired_at_boundary() {
        let s = session();
        assert!(!s.is_expired_at(9_999));
        assert!(s.is_expired_at(10_000));
    }

    #[test]
    fn test_usable_refresh_token_respects_own_expiry() {
        let mut s = session();
        assert_eq!(s.usable_refresh_token(19_999), Some("rt"));
        assert_eq!(s.usable_refresh_token(20_000), None);

        s.refresh_expires_at = None;
        assert_eq!(s.usable_refresh_token(i64::MAX), Some("rt"));

        s.refresh_token = None;
        assert_eq!(s.usable_refresh_token(0), None);
    }

    #[test]
    fn test_session_config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.token_expiration_minutes, 60);
        assert_eq!(config.refresh_token_expiration_days, Some(7));
        assert!(config.auto_refresh);
        assert!(!config.secure_storage);

        let partial: SessionConfig = serde_json::from_str(r#"{"tokenExpirationMinutes": 1}"#).unwrap();
        assert_eq!(partial.token_expiration_minutes, 1);
        assert!(partial.auto_refresh);
    }
}

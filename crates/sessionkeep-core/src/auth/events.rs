use serde::Serialize;

/// Lifecycle notifications published by a session store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SessionEvent {
    #[serde(rename_all = "camelCase")]
    Created { user_id: String, expires_at: i64 },

    #[serde(rename_all = "camelCase")]
    Refreshed { user_id: String, expires_at: i64 },

    /// `remote` is true when the logout was announced by another context.
    Cleared { remote: bool },
}

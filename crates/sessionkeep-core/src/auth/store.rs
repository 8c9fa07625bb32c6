//! The session store: sole writer of the persisted session.
//!
//! Reads go straight to the key-value store on every call; nothing about the
//! session is cached in memory except the auto-refresh timer and the
//! in-flight refresh, both owned by the store instance.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Duration;
use futures::future::{BoxFuture, FutureExt, Shared};
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::codec::{ObfuscatedCodec, SessionCodec};
use super::events::SessionEvent;
use super::session::{
    Session, SessionConfig, ADMIN_PERMISSION, DEFAULT_TOKEN_EXPIRATION_MINUTES,
};
use crate::api::RefreshExchanger;
use crate::clock::{Clock, SystemClock};
use crate::error::{SessionError, StoreError};
use crate::storage::{
    purge_expired, KeyValueStore, AUTH_TOKEN_KEY, LOGOUT_EVENT_KEY, SECURE_SESSION_KEY,
    SESSION_DATA_KEY, SESSION_EXPIRY_KEY, SESSION_KEYS, USER_ID_KEY,
};

/// Refresh this long before the token expires (5 minutes)
const DEFAULT_REFRESH_LEAD_MINUTES: i64 = 5;

/// Minimum gap between a refresh and the next timer-driven refresh.
/// Stops tokens shorter-lived than the lead from refreshing in a tight loop.
const MIN_REFRESH_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

/// Random bytes in a generated refresh token
const REFRESH_TOKEN_BYTES: usize = 32;

/// Capacity of the session event channel
const EVENT_CHANNEL_CAPACITY: usize = 16;

/// User id granted every permission unless disabled
pub const DEFAULT_ADMIN_USER_ID: &str = "admin";

/// Per-store behavior.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// A session with this user id passes every permission check. `None` disables the bypass.
    pub admin_user_id: Option<String>,
    /// How long before expiry the auto-refresh timer fires.
    pub refresh_lead: Duration,
    /// On a failed write, purge expired entries and retry once.
    pub retry_after_cleanup: bool,
    /// Whether [`SessionStore::resume`] re-arms the auto-refresh timer.
    pub auto_refresh: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            admin_user_id: Some(DEFAULT_ADMIN_USER_ID.to_string()),
            refresh_lead: Duration::minutes(DEFAULT_REFRESH_LEAD_MINUTES),
            retry_after_cleanup: true,
            auto_refresh: true,
        }
    }
}

/// Where a session record was found, and where it is written back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    Plain,
    Secure,
    /// Reconstructed from `authToken`/`userId`/`sessionExpiry`; written back as `Plain`.
    Legacy,
}

type RefreshOutcome = Result<Session, SessionError>;

type SharedRefresh = Shared<BoxFuture<'static, RefreshOutcome>>;

struct InFlight {
    id: u64,
    refresh_token: String,
    outcome: SharedRefresh,
}

enum NextRefresh {
    Started(SharedRefresh),
    Join(SharedRefresh),
    WaitForOther(SharedRefresh),
}

struct Inner {
    storage: Arc<dyn KeyValueStore>,
    exchanger: Arc<dyn RefreshExchanger>,
    codec: Arc<dyn SessionCodec>,
    clock: Arc<dyn Clock>,
    options: StoreOptions,
    auto_refresh: AtomicBool,
    /// Bumped whenever the session is replaced or removed; a refresh that
    /// started under an older epoch never writes.
    epoch: AtomicU64,
    refresh_seq: AtomicU64,
    /// Serializes read-modify-write sequences against storage
    write_lock: Mutex<()>,
    timer: Mutex<Option<JoinHandle<()>>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    in_flight: Mutex<Option<InFlight>>,
    /// Refresh token retired by the last rotating refresh of the current session
    rotated_from: Mutex<Option<String>>,
    /// Tags this store's logout broadcasts
    instance_id: u64,
    /// Value of the last logout broadcast this store wrote
    last_logout_stamp: Mutex<Option<String>>,
    events: broadcast::Sender<SessionEvent>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for slot in [&self.timer, &self.watcher] {
            if let Some(handle) = lock(slot).take() {
                handle.abort();
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct SessionStoreBuilder {
    storage: Arc<dyn KeyValueStore>,
    exchanger: Arc<dyn RefreshExchanger>,
    codec: Arc<dyn SessionCodec>,
    clock: Arc<dyn Clock>,
    options: StoreOptions,
}

impl SessionStoreBuilder {
    pub fn codec(mut self, codec: Arc<dyn SessionCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn options(mut self, options: StoreOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build(self) -> SessionStore {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        SessionStore {
            inner: Arc::new(Inner {
                storage: self.storage,
                exchanger: self.exchanger,
                codec: self.codec,
                clock: self.clock,
                auto_refresh: AtomicBool::new(self.options.auto_refresh),
                options: self.options,
                epoch: AtomicU64::new(0),
                refresh_seq: AtomicU64::new(0),
                write_lock: Mutex::new(()),
                timer: Mutex::new(None),
                watcher: Mutex::new(None),
                in_flight: Mutex::new(None),
                rotated_from: Mutex::new(None),
                instance_id: OsRng.next_u64(),
                last_logout_stamp: Mutex::new(None),
                events,
            }),
        }
    }
}

/// Handle to a session store. Clone is cheap; clones share timer, in-flight
/// refresh and event channel.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<Inner>,
}

impl SessionStore {
    pub fn builder(
        storage: Arc<dyn KeyValueStore>,
        exchanger: Arc<dyn RefreshExchanger>,
    ) -> SessionStoreBuilder {
        SessionStoreBuilder {
            storage,
            exchanger,
            codec: Arc::new(ObfuscatedCodec),
            clock: Arc::new(SystemClock),
            options: StoreOptions::default(),
        }
    }

    pub fn options(&self) -> &StoreOptions {
        &self.inner.options
    }

    /// Receive lifecycle events from this store
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    // ===== Create =====

    /// Start a new session, replacing any existing one in full.
    ///
    /// Either the whole new session is persisted or the previous state is left
    /// untouched.
    pub fn create(
        &self,
        token: &str,
        user_id: &str,
        config: &SessionConfig,
    ) -> Result<Session, SessionError> {
        if token.is_empty() {
            return Err(SessionError::InvalidInput("token must not be empty"));
        }
        if user_id.is_empty() {
            return Err(SessionError::InvalidInput("user id must not be empty"));
        }
        if config.token_expiration_minutes <= 0 {
            return Err(SessionError::InvalidInput("token expiration must be positive"));
        }

        let now = self.inner.clock.now();
        let expires_at = Duration::try_minutes(config.token_expiration_minutes)
            .and_then(|lifetime| now.checked_add_signed(lifetime))
            .ok_or(SessionError::InvalidInput("token expiration is out of range"))?;
        let (refresh_token, refresh_expires_at) = match config.refresh_token_expiration_days {
            Some(days) if days <= 0 => {
                return Err(SessionError::InvalidInput(
                    "refresh token expiration must be positive",
                ))
            }
            Some(days) => {
                let refresh_expires_at = Duration::try_days(days)
                    .and_then(|lifetime| now.checked_add_signed(lifetime))
                    .ok_or(SessionError::InvalidInput(
                        "refresh token expiration is out of range",
                    ))?;
                (
                    Some(generate_refresh_token()),
                    Some(refresh_expires_at.timestamp_millis()),
                )
            }
            None => (None, None),
        };

        let session = Session {
            token: token.to_string(),
            user_id: user_id.to_string(),
            expires_at: expires_at.timestamp_millis(),
            refresh_token,
            refresh_expires_at,
            permissions: BTreeSet::new(),
        };

        let layout = if config.secure_storage {
            Layout::Secure
        } else {
            Layout::Plain
        };
        let batch = self.records(&session, layout)?;

        {
            let _guard = lock(&self.inner.write_lock);
            self.persist(&batch)?;
            self.inner.epoch.fetch_add(1, Ordering::SeqCst);
            lock(&self.inner.rotated_from).take();
        }

        self.inner.auto_refresh.store(config.auto_refresh, Ordering::SeqCst);
        if config.auto_refresh && session.refresh_token.is_some() {
            self.schedule_refresh(session.expires_at, std::time::Duration::ZERO);
        } else {
            self.cancel_refresh();
        }

        info!(
            user_id = %session.user_id,
            expires_at = session.expires_at,
            secure = config.secure_storage,
            "Session created"
        );
        let _ = self.inner.events.send(SessionEvent::Created {
            user_id: session.user_id.clone(),
            expires_at: session.expires_at,
        });
        Ok(session)
    }

    // ===== Read =====

    /// The persisted session, without any expiry check.
    ///
    /// Unreadable or corrupt records are reported as absent.
    pub fn read(&self) -> Option<Session> {
        match self.load() {
            Ok(found) => found.map(|(session, _)| session),
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable session record");
                None
            }
        }
    }

    /// Get the bearer token if a session exists
    pub fn token(&self) -> Option<String> {
        self.read().map(|s| s.token)
    }

    /// Get the user id if a session exists
    pub fn user_id(&self) -> Option<String> {
        self.read().map(|s| s.user_id)
    }

    /// Time left before the token expires (negative once expired)
    pub fn time_until_expiry(&self) -> Option<Duration> {
        let now = self.inner.clock.now_millis();
        self.read().map(|s| s.time_until_expiry(now))
    }

    fn get(&self, key: &str) -> Result<Option<String>, SessionError> {
        self.inner
            .storage
            .get(key)
            .map_err(|e| SessionError::StorageCorrupt(format!("{}: {}", key, e)))
    }

    fn load(&self) -> Result<Option<(Session, Layout)>, SessionError> {
        if let Some(encoded) = self.get(SECURE_SESSION_KEY)? {
            let session = self
                .inner
                .codec
                .decode(&encoded)
                .map_err(|e| SessionError::StorageCorrupt(format!("{}: {}", SECURE_SESSION_KEY, e)))?;
            return Ok(Some((session, Layout::Secure)));
        }

        if let Some(json) = self.get(SESSION_DATA_KEY)? {
            let session: Session = serde_json::from_str(&json)
                .map_err(|e| SessionError::StorageCorrupt(format!("{}: {}", SESSION_DATA_KEY, e)))?;
            return Ok(Some((session, Layout::Plain)));
        }

        let token = self.get(AUTH_TOKEN_KEY)?.filter(|t| !t.is_empty());
        let user_id = self.get(USER_ID_KEY)?.filter(|u| !u.is_empty());
        let (Some(token), Some(user_id)) = (token, user_id) else {
            return Ok(None);
        };

        let expires_at = match self.get(SESSION_EXPIRY_KEY)? {
            Some(raw) => raw.trim().parse::<i64>().map_err(|e| {
                SessionError::StorageCorrupt(format!("{}: {}", SESSION_EXPIRY_KEY, e))
            })?,
            None => {
                (self.inner.clock.now() + Duration::minutes(DEFAULT_TOKEN_EXPIRATION_MINUTES))
                    .timestamp_millis()
            }
        };

        debug!(user_id = %user_id, "Reconstructed session from legacy keys");
        Ok(Some((
            Session {
                token,
                user_id,
                expires_at,
                refresh_token: None,
                refresh_expires_at: None,
                permissions: BTreeSet::new(),
            },
            Layout::Legacy,
        )))
    }

    // ===== Validation =====

    /// True when a session exists and has not expired.
    ///
    /// An expired session with a usable refresh token gets one refresh attempt
    /// before answering. An expired session that cannot be refreshed is cleared.
    pub async fn is_valid(&self) -> bool {
        let now = self.inner.clock.now_millis();
        let session = match self.load() {
            Ok(Some((session, _))) => session,
            Ok(None) => return false,
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable session record");
                return false;
            }
        };

        if !session.is_expired_at(now) {
            return true;
        }

        match session.usable_refresh_token(now) {
            Some(refresh_token) => {
                info!(user_id = %session.user_id, "Session expired, attempting refresh");
                let refresh_token = refresh_token.to_string();
                match self.refresh(&refresh_token).await {
                    Ok(refreshed) => !refreshed.is_expired_at(self.inner.clock.now_millis()),
                    Err(e) => {
                        debug!(error = %e, "Refresh on expiry failed");
                        false
                    }
                }
            }
            None => {
                info!(user_id = %session.user_id, "Session expired with no usable refresh token");
                self.clear();
                false
            }
        }
    }

    /// Permission check. Invalid sessions have no permissions.
    ///
    /// The configured admin user id, or the `admin` permission, passes every check.
    pub async fn has_permission(&self, name: &str) -> bool {
        if !self.is_valid().await {
            return false;
        }
        let Some(session) = self.read() else {
            return false;
        };

        let is_admin_user = matches!(
            &self.inner.options.admin_user_id,
            Some(admin) if *admin == session.user_id
        );
        if is_admin_user || session.has_permission(ADMIN_PERMISSION) {
            return true;
        }
        session.has_permission(name)
    }

    /// Replace the permission set of the active session
    pub fn set_permissions<I, S>(&self, permissions: I) -> Result<Session, SessionError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let _guard = lock(&self.inner.write_lock);
        let (mut session, layout) = match self.load() {
            Ok(Some(found)) => found,
            Ok(None) => return Err(SessionError::NoActiveSession),
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable session record");
                return Err(SessionError::NoActiveSession);
            }
        };

        session.permissions = permissions.into_iter().map(Into::into).collect();
        let batch = self.records(&session, layout)?;
        self.persist(&batch)?;

        debug!(user_id = %session.user_id, count = session.permissions.len(), "Permissions updated");
        Ok(session)
    }

    // ===== Refresh =====

    /// Exchange the refresh token for a new bearer token.
    ///
    /// Concurrent calls with the same token share one exchange and its outcome.
    /// A token retired by this store's last rotation returns the current
    /// session while it is unexpired. Any failure clears the session.
    pub async fn refresh(&self, refresh_token: &str) -> Result<Session, SessionError> {
        loop {
            let next = {
                let mut slot = lock(&self.inner.in_flight);
                match slot.as_ref() {
                    Some(in_flight) if in_flight.refresh_token == refresh_token => {
                        NextRefresh::Join(in_flight.outcome.clone())
                    }
                    Some(in_flight) => NextRefresh::WaitForOther(in_flight.outcome.clone()),
                    None => {
                        let (id, outcome) = self.start_refresh(refresh_token);
                        *slot = Some(InFlight {
                            id,
                            refresh_token: refresh_token.to_string(),
                            outcome: outcome.clone(),
                        });
                        NextRefresh::Started(outcome)
                    }
                }
            };

            match next {
                NextRefresh::Started(outcome) => return outcome.await,
                NextRefresh::Join(outcome) => {
                    debug!("Joining in-flight refresh");
                    return outcome.await;
                }
                NextRefresh::WaitForOther(other) => {
                    // A refresh with another token is running; let it finish first
                    let _ = other.await;
                }
            }
        }
    }

    fn start_refresh(&self, refresh_token: &str) -> (u64, SharedRefresh) {
        let id = self.inner.refresh_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let store = self.clone();
        let refresh_token = refresh_token.to_string();

        let work = async move {
            let outcome = store.run_refresh(&refresh_token).await;
            store.finish_refresh(id);
            outcome
        };

        let outcome = match Handle::try_current() {
            // Runs as its own task so an abandoned caller cannot stop it halfway
            Ok(runtime) => {
                let task = runtime.spawn(work);
                async move {
                    task.await.unwrap_or_else(|e| {
                        Err(SessionError::RefreshRejected(format!("refresh task failed: {}", e)))
                    })
                }
                .boxed()
                .shared()
            }
            Err(_) => {
                debug!("No async runtime, refreshing on the caller's executor");
                work.boxed().shared()
            }
        };

        (id, outcome)
    }

    fn finish_refresh(&self, id: u64) {
        let mut slot = lock(&self.inner.in_flight);
        if matches!(slot.as_ref(), Some(in_flight) if in_flight.id == id) {
            *slot = None;
        }
    }

    async fn run_refresh(&self, refresh_token: &str) -> Result<Session, SessionError> {
        let epoch = self.inner.epoch.load(Ordering::SeqCst);
        let now = self.inner.clock.now_millis();

        let (session, layout) = match self.load() {
            Ok(Some(found)) => found,
            Ok(None) => return Err(SessionError::NoActiveSession),
            Err(e) => {
                warn!(error = %e, "Unreadable session record during refresh");
                self.clear_if_current(epoch);
                return Err(SessionError::NoActiveSession);
            }
        };

        let current = session.usable_refresh_token(now).map(str::to_string);
        match current.as_deref() {
            Some(current) if current == refresh_token => {}
            Some(_) if self.was_rotated_away(refresh_token) && !session.is_expired_at(now) => {
                debug!(
                    user_id = %session.user_id,
                    "Refresh token already rotated, keeping current session"
                );
                return Ok(session);
            }
            Some(_) => {
                return Err(self.reject(epoch, "refresh token does not match the active session"))
            }
            None => return Err(self.reject(epoch, "no usable refresh token")),
        }

        debug!(user_id = %session.user_id, "Exchanging refresh token");
        let grant = match self.inner.exchanger.exchange(refresh_token).await {
            Ok(grant) => grant,
            Err(e) => return Err(self.reject(epoch, &e.to_string())),
        };

        if grant.token.is_empty() || grant.expires_at <= self.inner.clock.now_millis() {
            return Err(self.reject(epoch, "exchange returned an unusable token"));
        }

        let updated = Session {
            token: grant.token,
            expires_at: grant.expires_at,
            refresh_token: grant.refresh_token.or(session.refresh_token),
            permissions: grant.permissions.unwrap_or(session.permissions),
            ..session
        };

        let written = {
            let _guard = lock(&self.inner.write_lock);
            if self.inner.epoch.load(Ordering::SeqCst) != epoch {
                None
            } else {
                let result = self.records(&updated, layout).and_then(|batch| self.persist(&batch));
                if result.is_ok() && updated.refresh_token.as_deref() != Some(refresh_token) {
                    *lock(&self.inner.rotated_from) = Some(refresh_token.to_string());
                }
                Some(result)
            }
        };

        match written {
            None => {
                debug!("Session replaced or cleared during refresh, discarding result");
                Err(SessionError::NoActiveSession)
            }
            Some(Err(e)) => {
                warn!(error = %e, "Failed to persist refreshed session, clearing");
                self.clear_if_current(epoch);
                Err(e)
            }
            Some(Ok(())) => {
                if self.inner.auto_refresh.load(Ordering::SeqCst) {
                    self.schedule_refresh(updated.expires_at, MIN_REFRESH_INTERVAL);
                }
                info!(
                    user_id = %updated.user_id,
                    expires_at = updated.expires_at,
                    "Session refreshed"
                );
                let _ = self.inner.events.send(SessionEvent::Refreshed {
                    user_id: updated.user_id.clone(),
                    expires_at: updated.expires_at,
                });
                Ok(updated)
            }
        }
    }

    fn was_rotated_away(&self, refresh_token: &str) -> bool {
        lock(&self.inner.rotated_from).as_deref() == Some(refresh_token)
    }

    /// Fail closed: drop the session the refresh was started for
    fn reject(&self, epoch: u64, reason: &str) -> SessionError {
        warn!(reason, "Refresh rejected, clearing session");
        self.clear_if_current(epoch);
        SessionError::RefreshRejected(reason.to_string())
    }

    // ===== Clear =====

    /// Log out: remove the session, cancel the timer, and announce the logout
    /// to other contexts sharing the store. No-op when there is no session.
    pub fn clear(&self) {
        self.clear_inner(None);
    }

    fn clear_if_current(&self, epoch: u64) {
        self.clear_inner(Some(epoch));
    }

    fn clear_inner(&self, expected_epoch: Option<u64>) {
        let existed = {
            let _guard = lock(&self.inner.write_lock);
            if let Some(expected) = expected_epoch {
                if self.inner.epoch.load(Ordering::SeqCst) != expected {
                    return;
                }
            }

            let existed = SESSION_KEYS
                .iter()
                .any(|key| matches!(self.inner.storage.get(key), Ok(Some(_))));
            for key in SESSION_KEYS {
                if let Err(e) = self.inner.storage.remove(key) {
                    warn!(key, error = %e, "Failed to remove session key");
                }
            }
            self.inner.epoch.fetch_add(1, Ordering::SeqCst);
            lock(&self.inner.rotated_from).take();
            existed
        };

        self.cancel_refresh();

        if !existed {
            debug!("Clear requested with no active session");
            return;
        }

        self.broadcast_logout();
        info!("Session cleared");
        let _ = self.inner.events.send(SessionEvent::Cleared { remote: false });
    }

    fn broadcast_logout(&self) {
        let stamp = logout_stamp(self.inner.clock.now_millis(), self.inner.instance_id);
        *lock(&self.inner.last_logout_stamp) = Some(stamp.clone());

        if let Err(e) = self.inner.storage.set(LOGOUT_EVENT_KEY, &stamp) {
            warn!(error = %e, "Failed to broadcast logout");
        }
        if let Err(e) = self.inner.storage.remove(LOGOUT_EVENT_KEY) {
            warn!(error = %e, "Failed to remove logout broadcast key");
        }
    }

    /// Listen for logouts announced by other contexts on the same store.
    ///
    /// Returns false when the storage backend has no change notifications or no
    /// async runtime is available. The listener stops with the store.
    pub fn watch_remote_logout(&self) -> bool {
        let Some(mut changes) = self.inner.storage.watch() else {
            debug!("Storage backend has no change notifications");
            return false;
        };
        let Ok(runtime) = Handle::try_current() else {
            warn!("No async runtime, remote logout watch disabled");
            return false;
        };

        let weak = Arc::downgrade(&self.inner);
        let handle = runtime.spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) if change.key == LOGOUT_EVENT_KEY => {
                        let Some(value) = change.value else { continue };
                        let Some(inner) = weak.upgrade() else { break };
                        SessionStore { inner }.on_remote_logout(&value);
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Storage watcher lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        if let Some(previous) = lock(&self.inner.watcher).replace(handle) {
            previous.abort();
        }
        true
    }

    fn on_remote_logout(&self, stamp: &str) {
        if lock(&self.inner.last_logout_stamp).as_deref() == Some(stamp) {
            return;
        }

        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        self.cancel_refresh();
        lock(&self.inner.in_flight).take();
        lock(&self.inner.rotated_from).take();

        info!("Logout announced by another context");
        let _ = self.inner.events.send(SessionEvent::Cleared { remote: true });
    }

    // ===== Auto refresh =====

    /// Re-arm the auto-refresh timer for a session persisted by an earlier run.
    pub fn resume(&self) -> Option<Session> {
        let session = self.read()?;
        let now = self.inner.clock.now_millis();
        if self.inner.auto_refresh.load(Ordering::SeqCst)
            && session.usable_refresh_token(now).is_some()
        {
            self.schedule_refresh(session.expires_at, std::time::Duration::ZERO);
        }
        debug!(user_id = %session.user_id, "Session resumed");
        Some(session)
    }

    /// Whether an auto-refresh timer is pending
    pub fn refresh_scheduled(&self) -> bool {
        lock(&self.inner.timer)
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Replace any pending timer with one firing `refresh_lead` before
    /// `expires_at`, immediately if less time than that remains, but no sooner
    /// than `floor`.
    fn schedule_refresh(&self, expires_at: i64, floor: std::time::Duration) {
        let Ok(runtime) = Handle::try_current() else {
            warn!("No async runtime, auto-refresh disabled");
            return;
        };

        let fire_at = expires_at - self.inner.options.refresh_lead.num_milliseconds();
        let wait_ms = (fire_at - self.inner.clock.now_millis()).max(0) as u64;
        let delay = std::time::Duration::from_millis(wait_ms).max(floor);

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let handle = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                SessionStore { inner }.on_refresh_timer().await;
            }
        });

        if let Some(previous) = lock(&self.inner.timer).replace(handle) {
            previous.abort();
        }
        debug!(delay_secs = delay.as_secs(), "Auto-refresh scheduled");
    }

    fn cancel_refresh(&self) {
        if let Some(handle) = lock(&self.inner.timer).take() {
            handle.abort();
            debug!("Auto-refresh cancelled");
        }
    }

    async fn on_refresh_timer(&self) {
        let now = self.inner.clock.now_millis();
        let Some(session) = self.read() else {
            return;
        };
        let Some(refresh_token) = session.usable_refresh_token(now).map(str::to_string) else {
            debug!("Auto-refresh skipped, no usable refresh token");
            return;
        };

        if let Err(e) = self.refresh(&refresh_token).await {
            warn!(error = %e, "Auto-refresh failed");
        }
    }

    // ===== Persistence =====

    fn records(
        &self,
        session: &Session,
        layout: Layout,
    ) -> Result<Vec<(&'static str, Option<String>)>, SessionError> {
        let expiry = Some(session.expires_at.to_string());
        match layout {
            Layout::Secure => {
                let encoded = self
                    .inner
                    .codec
                    .encode(session)
                    .map_err(|e| SessionError::StorageWriteFailed(e.to_string()))?;
                Ok(vec![
                    (SECURE_SESSION_KEY, Some(encoded)),
                    (SESSION_EXPIRY_KEY, expiry),
                    (AUTH_TOKEN_KEY, None),
                    (USER_ID_KEY, None),
                    (SESSION_DATA_KEY, None),
                ])
            }
            Layout::Plain | Layout::Legacy => {
                let json = serde_json::to_string(session)
                    .map_err(|e| SessionError::StorageWriteFailed(e.to_string()))?;
                Ok(vec![
                    (AUTH_TOKEN_KEY, Some(session.token.clone())),
                    (USER_ID_KEY, Some(session.user_id.clone())),
                    (SESSION_DATA_KEY, Some(json)),
                    (SESSION_EXPIRY_KEY, expiry),
                    (SECURE_SESSION_KEY, None),
                ])
            }
        }
    }

    /// Apply a batch of writes as a unit. Callers hold the write lock.
    fn persist(&self, batch: &[(&'static str, Option<String>)]) -> Result<(), SessionError> {
        let snapshot = self.snapshot()?;

        let first = match self.apply(batch) {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        self.restore(&snapshot);

        if !self.inner.options.retry_after_cleanup {
            return Err(SessionError::StorageWriteFailed(first.to_string()));
        }

        warn!(error = %first, "Session write failed, purging expired entries and retrying");
        let mut protected: Vec<&str> = SESSION_KEYS.to_vec();
        protected.push(LOGOUT_EVENT_KEY);
        purge_expired(
            self.inner.storage.as_ref(),
            self.inner.clock.now_millis(),
            &protected,
        );

        match self.apply(batch) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.restore(&snapshot);
                Err(SessionError::StorageWriteFailed(e.to_string()))
            }
        }
    }

    fn snapshot(&self) -> Result<Vec<(&'static str, Option<String>)>, SessionError> {
        SESSION_KEYS
            .iter()
            .map(|key| {
                self.inner
                    .storage
                    .get(key)
                    .map(|value| (*key, value))
                    .map_err(|e| SessionError::StorageWriteFailed(e.to_string()))
            })
            .collect()
    }

    fn apply(&self, batch: &[(&'static str, Option<String>)]) -> Result<(), StoreError> {
        for (key, value) in batch {
            match value {
                Some(value) => self.inner.storage.set(key, value)?,
                None => self.inner.storage.remove(key)?,
            }
        }
        Ok(())
    }

    fn restore(&self, snapshot: &[(&'static str, Option<String>)]) {
        // Removals first so restored values have room
        let (removals, writes): (Vec<_>, Vec<_>) =
            snapshot.iter().partition(|(_, value)| value.is_none());

        for (key, _) in removals {
            if let Err(e) = self.inner.storage.remove(key) {
                warn!(key, error = %e, "Failed to roll back session key");
            }
        }
        for (key, value) in writes {
            if let Some(value) = value {
                if let Err(e) = self.inner.storage.set(key, value) {
                    warn!(key, error = %e, "Failed to roll back session key");
                }
            }
        }
    }
}

/// `logout_event` value: time of the logout and the store that announced it
fn logout_stamp(now_millis: i64, instance_id: u64) -> String {
    format!("{}-{:016x}", now_millis, instance_id)
}

/// Random URL-safe refresh token from the OS CSPRNG
fn generate_refresh_token() -> String {
    let mut bytes = [0u8; REFRESH_TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

// ============================================================================
// Tests
// ============================================================================

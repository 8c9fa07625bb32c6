use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use sessionkeep_core::utils::{format_remaining, format_timestamp, mask_token};
use sessionkeep_core::{
    FileStore, HttpExchanger, KeyValueStore, KeyringStore, ObfuscatedCodec, RefreshExchanger,
    SealedCodec, Session, SessionCodec, SessionEvent, SessionStore, SimulatedExchanger,
    StoreOptions,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info};

use crate::config::{Backend, Config, APP_NAME};

// ============================================================================
// Constants
// ============================================================================

/// Environment variable holding the sealing passphrase
pub const PASSPHRASE_ENV: &str = "SESSIONKEEP_PASSPHRASE";

/// How often `watch` re-checks the stored session
const WATCH_POLL_INTERVAL: Duration = Duration::from_secs(30);

pub const USAGE: &str = "\
Usage: sessionkeep <command> [args]

Commands:
  login <token> <user-id> [--minutes N] [--no-refresh-token] [--no-auto-refresh] [--secure]
  status                  Show the stored session
  refresh                 Exchange the refresh token for a new token
  can <permission>        Exit 0 if the session holds the permission
  grant <permission>...   Add permissions to the session
  logout                  Remove the session
  watch                   Keep the session refreshed until interrupted";

// ============================================================================
// Command line
// ============================================================================

/// Per-login overrides of the configured session defaults
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoginOverrides {
    pub minutes: Option<i64>,
    pub no_refresh_token: bool,
    pub no_auto_refresh: bool,
    pub secure: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Login {
        token: String,
        user_id: String,
        overrides: LoginOverrides,
    },
    Status,
    Refresh,
    Can(String),
    Grant(Vec<String>),
    Logout,
    Watch,
    Help,
}

impl Command {
    /// Parse arguments following the program name
    pub fn parse(args: &[String]) -> Result<Self> {
        let Some((name, rest)) = args.split_first() else {
            return Ok(Command::Help);
        };

        match name.as_str() {
            "login" => Self::parse_login(rest),
            "status" => no_args(rest, Command::Status),
            "refresh" => no_args(rest, Command::Refresh),
            "logout" => no_args(rest, Command::Logout),
            "watch" => no_args(rest, Command::Watch),
            "can" => match rest {
                [permission] => Ok(Command::Can(permission.clone())),
                _ => bail!("can takes exactly one permission"),
            },
            "grant" => {
                if rest.is_empty() {
                    bail!("grant needs at least one permission");
                }
                Ok(Command::Grant(rest.to_vec()))
            }
            "help" | "--help" | "-h" => Ok(Command::Help),
            other => bail!("Unknown command: {}", other),
        }
    }

    fn parse_login(args: &[String]) -> Result<Self> {
        let mut positional = Vec::new();
        let mut overrides = LoginOverrides::default();
        let mut iter = args.iter();

        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--minutes" => {
                    let value = iter
                        .next()
                        .ok_or_else(|| anyhow!("--minutes needs a value"))?;
                    let minutes: i64 = value
                        .parse()
                        .with_context(|| format!("Invalid minutes: {}", value))?;
                    if minutes <= 0 {
                        bail!("--minutes must be positive");
                    }
                    overrides.minutes = Some(minutes);
                }
                "--no-refresh-token" => overrides.no_refresh_token = true,
                "--no-auto-refresh" => overrides.no_auto_refresh = true,
                "--secure" => overrides.secure = true,
                flag if flag.starts_with("--") => bail!("Unknown option: {}", flag),
                _ => positional.push(arg.clone()),
            }
        }

        match <[String; 2]>::try_from(positional) {
            Ok([token, user_id]) => Ok(Command::Login {
                token,
                user_id,
                overrides,
            }),
            Err(_) => bail!("login takes a token and a user id"),
        }
    }
}

fn no_args(rest: &[String], command: Command) -> Result<Command> {
    if rest.is_empty() {
        Ok(command)
    } else {
        bail!("Unexpected arguments: {}", rest.join(" "))
    }
}

/// Read the sealing passphrase from the environment, prompting if unset
pub fn read_passphrase() -> Result<String> {
    if let Ok(passphrase) = std::env::var(PASSPHRASE_ENV) {
        return Ok(passphrase);
    }
    let passphrase = rpassword::prompt_password("Session passphrase: ")?;
    if passphrase.is_empty() {
        bail!("Passphrase must not be empty");
    }
    Ok(passphrase)
}

// ============================================================================
// App
// ============================================================================

/// Result of a command, mapped to the process exit status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

impl From<Outcome> for ExitCode {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Success => ExitCode::SUCCESS,
            Outcome::Failure => ExitCode::FAILURE,
        }
    }
}

pub struct App {
    config: Config,
    store: SessionStore,
}

impl App {
    /// Build the session store described by `config`.
    ///
    /// `passphrase` is only called when sealing is enabled. A newly generated
    /// sealing salt is written into `config`; the caller saves it.
    pub fn new(config: &mut Config, passphrase: impl FnOnce() -> Result<String>) -> Result<Self> {
        let storage: Arc<dyn KeyValueStore> = match config.backend {
            Backend::File => {
                let dir = config.data_dir()?.join("session");
                Arc::new(FileStore::new(dir).context("Failed to open session directory")?)
            }
            Backend::Keyring => Arc::new(KeyringStore::new(APP_NAME)),
        };

        let exchanger: Arc<dyn RefreshExchanger> = match config.refresh_url {
            Some(ref url) => Arc::new(HttpExchanger::new(url.clone())?),
            None => {
                debug!("No refresh_url configured, using simulated exchange");
                Arc::new(SimulatedExchanger::default())
            }
        };

        let codec: Arc<dyn SessionCodec> = if config.seal_with_passphrase {
            let (salt, _) = config.sealing_salt()?;
            let passphrase = passphrase()?;
            Arc::new(
                SealedCodec::from_passphrase(&passphrase, &salt)
                    .context("Failed to derive sealing key")?,
            )
        } else {
            Arc::new(ObfuscatedCodec)
        };

        let options = StoreOptions {
            admin_user_id: config.admin_user_id.clone(),
            auto_refresh: config.session.auto_refresh,
            ..StoreOptions::default()
        };

        let store = SessionStore::builder(storage, exchanger)
            .codec(codec)
            .options(options)
            .build();

        Ok(Self {
            config: config.clone(),
            store,
        })
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub async fn run(&self, command: Command) -> Result<Outcome> {
        match command {
            Command::Login {
                token,
                user_id,
                overrides,
            } => self.login(&token, &user_id, &overrides),
            Command::Status => self.status().await,
            Command::Refresh => self.refresh().await,
            Command::Can(permission) => self.can(&permission).await,
            Command::Grant(permissions) => self.grant(permissions).await,
            Command::Logout => {
                self.store.clear();
                println!("Logged out");
                Ok(Outcome::Success)
            }
            Command::Watch => self.watch().await,
            Command::Help => {
                println!("{}", USAGE);
                Ok(Outcome::Success)
            }
        }
    }

    fn login(&self, token: &str, user_id: &str, overrides: &LoginOverrides) -> Result<Outcome> {
        let mut session_config = self.config.session.clone();
        if let Some(minutes) = overrides.minutes {
            session_config = session_config.with_expiration_minutes(minutes);
        }
        if overrides.no_refresh_token {
            session_config = session_config.without_refresh_token();
        }
        if overrides.no_auto_refresh {
            session_config = session_config.with_auto_refresh(false);
        }
        if overrides.secure {
            session_config = session_config.with_secure_storage(true);
        }

        let session = self
            .store
            .create(token, user_id, &session_config)
            .context("Failed to store session")?;
        info!(user_id = %session.user_id, "Logged in");
        println!("Logged in as {}", session.user_id);
        self.print_session(&session);
        Ok(Outcome::Success)
    }

    async fn status(&self) -> Result<Outcome> {
        let Some(before) = self.store.read() else {
            println!("Not logged in");
            return Ok(Outcome::Failure);
        };

        if !self.store.is_valid().await {
            println!("Session for {} has expired", before.user_id);
            return Ok(Outcome::Failure);
        }

        let Some(session) = self.store.read() else {
            println!("Not logged in");
            return Ok(Outcome::Failure);
        };
        if session.token != before.token {
            println!("Session was renewed");
        }
        println!("User: {}", session.user_id);
        self.print_session(&session);
        Ok(Outcome::Success)
    }

    async fn refresh(&self) -> Result<Outcome> {
        let session = self.store.read().ok_or_else(|| anyhow!("Not logged in"))?;
        let refresh_token = session
            .refresh_token
            .ok_or_else(|| anyhow!("Session has no refresh token"))?;

        let session = self
            .store
            .refresh(&refresh_token)
            .await
            .context("Refresh failed, session cleared")?;
        println!("Session refreshed");
        self.print_session(&session);
        Ok(Outcome::Success)
    }

    async fn can(&self, permission: &str) -> Result<Outcome> {
        if self.store.has_permission(permission).await {
            println!("yes");
            Ok(Outcome::Success)
        } else {
            println!("no");
            Ok(Outcome::Failure)
        }
    }

    async fn grant(&self, permissions: Vec<String>) -> Result<Outcome> {
        if !self.store.is_valid().await {
            println!("Not logged in");
            return Ok(Outcome::Failure);
        }
        let session = self.store.read().ok_or_else(|| anyhow!("Not logged in"))?;
        let merged = session.permissions.into_iter().chain(permissions);
        let session = self
            .store
            .set_permissions(merged)
            .context("Failed to update permissions")?;

        let listed: Vec<&str> = session.permissions.iter().map(String::as_str).collect();
        println!("Permissions: {}", listed.join(", "));
        Ok(Outcome::Success)
    }

    async fn watch(&self) -> Result<Outcome> {
        let Some(session) = self.store.resume() else {
            println!("Not logged in");
            return Ok(Outcome::Failure);
        };
        println!("Watching session for {} (Ctrl-C to stop)", session.user_id);
        self.print_session(&session);

        if !self.store.watch_remote_logout() {
            debug!("Remote logout notifications unavailable, polling only");
        }
        let mut events = self.store.subscribe();
        let mut poll = tokio::time::interval(WATCH_POLL_INTERVAL);
        poll.tick().await;

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => {
                        println!("{}", serde_json::to_string(&event)?);
                        if matches!(event, SessionEvent::Cleared { .. }) {
                            return Ok(Outcome::Success);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => debug!(skipped, "Event stream lagged"),
                    Err(RecvError::Closed) => return Ok(Outcome::Success),
                },
                _ = poll.tick() => {
                    if !self.store.is_valid().await {
                        println!("Session ended");
                        return Ok(Outcome::Success);
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Watch interrupted");
                    return Ok(Outcome::Success);
                }
            }
        }
    }

    fn print_session(&self, session: &Session) {
        let now = chrono::Utc::now().timestamp_millis();
        println!("Token: {}", mask_token(&session.token));
        println!(
            "Expires: {} ({})",
            format_timestamp(session.expires_at),
            format_remaining(session.time_until_expiry(now))
        );
        match session.refresh_expires_at {
            Some(at) => println!("Refresh until: {}", format_timestamp(at)),
            None => println!("Refresh: not available"),
        }
        if !session.permissions.is_empty() {
            let listed: Vec<&str> = session.permissions.iter().map(String::as_str).collect();
            println!("Permissions: {}", listed.join(", "));
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use sessionkeep_core::{ManualClock, SessionConfig};

    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn file_config(dir: &tempfile::TempDir) -> Config {
        Config {
            data_dir: Some(dir.path().to_path_buf()),
            ..Config::default()
        }
    }

    fn no_passphrase() -> Result<String> {
        bail!("passphrase not expected")
    }

    #[test]
    fn test_parse_login_with_flags() {
        let command = Command::parse(&args(&[
            "login",
            "tok",
            "user-1",
            "--minutes",
            "15",
            "--secure",
            "--no-auto-refresh",
        ]))
        .unwrap();

        assert_eq!(
            command,
            Command::Login {
                token: "tok".into(),
                user_id: "user-1".into(),
                overrides: LoginOverrides {
                    minutes: Some(15),
                    no_refresh_token: false,
                    no_auto_refresh: true,
                    secure: true,
                },
            }
        );
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(Command::parse(&args(&["login", "tok"])).is_err());
        assert!(Command::parse(&args(&["login", "tok", "u", "--minutes", "0"])).is_err());
        assert!(Command::parse(&args(&["login", "tok", "u", "--minutes"])).is_err());
        assert!(Command::parse(&args(&["login", "tok", "u", "--bogus"])).is_err());
        assert!(Command::parse(&args(&["can"])).is_err());
        assert!(Command::parse(&args(&["grant"])).is_err());
        assert!(Command::parse(&args(&["status", "extra"])).is_err());
        assert!(Command::parse(&args(&["frobnicate"])).is_err());
    }

    #[test]
    fn test_parse_simple_commands() {
        assert_eq!(Command::parse(&[]).unwrap(), Command::Help);
        assert_eq!(Command::parse(&args(&["status"])).unwrap(), Command::Status);
        assert_eq!(
            Command::parse(&args(&["can", "reports:read"])).unwrap(),
            Command::Can("reports:read".into())
        );
        assert_eq!(
            Command::parse(&args(&["grant", "a", "b"])).unwrap(),
            Command::Grant(vec!["a".into(), "b".into()])
        );
    }

    #[tokio::test]
    async fn test_login_grant_and_logout_with_file_backend() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = file_config(&dir);
        let app = App::new(&mut config, no_passphrase).unwrap();

        let login = Command::parse(&args(&["login", "tok", "user-1", "--no-auto-refresh"])).unwrap();
        assert_eq!(app.run(login).await.unwrap(), Outcome::Success);
        assert_eq!(app.store().user_id().as_deref(), Some("user-1"));

        app.run(Command::Grant(vec!["reports:read".into()]))
            .await
            .unwrap();
        app.run(Command::Grant(vec!["reports:write".into()]))
            .await
            .unwrap();
        let session = app.store().read().unwrap();
        assert!(session.has_permission("reports:read"));
        assert!(session.has_permission("reports:write"));

        assert_eq!(
            app.run(Command::Can("reports:read".into())).await.unwrap(),
            Outcome::Success
        );
        assert_eq!(
            app.run(Command::Can("billing".into())).await.unwrap(),
            Outcome::Failure
        );

        app.run(Command::Logout).await.unwrap();
        assert!(app.store().read().is_none());
        assert_eq!(app.run(Command::Status).await.unwrap(), Outcome::Failure);
    }

    #[tokio::test]
    async fn test_session_survives_a_new_app() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = file_config(&dir);

        let first = App::new(&mut config, no_passphrase).unwrap();
        first
            .run(Command::parse(&args(&["login", "tok", "user-1", "--no-auto-refresh"])).unwrap())
            .await
            .unwrap();
        drop(first);

        let second = App::new(&mut config, no_passphrase).unwrap();
        assert_eq!(second.store().token().as_deref(), Some("tok"));
        assert_eq!(second.run(Command::Status).await.unwrap(), Outcome::Success);
    }

    #[tokio::test]
    async fn test_refresh_command_uses_simulated_exchange() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = file_config(&dir);
        let app = App::new(&mut config, no_passphrase).unwrap();

        app.run(Command::parse(&args(&["login", "tok", "user-1", "--no-auto-refresh"])).unwrap())
            .await
            .unwrap();
        assert_eq!(app.run(Command::Refresh).await.unwrap(), Outcome::Success);

        let session = app.store().read().unwrap();
        assert_ne!(session.token, "tok");
        assert_eq!(session.user_id, "user-1");
    }

    #[tokio::test]
    async fn test_sealed_store_needs_same_passphrase() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config {
            seal_with_passphrase: true,
            ..file_config(&dir)
        };

        let app = App::new(&mut config, || Ok("correct horse".to_string())).unwrap();
        assert!(config.sealing_salt.is_some());
        app.run(
            Command::parse(&args(&["login", "tok", "user-1", "--secure", "--no-auto-refresh"]))
                .unwrap(),
        )
        .await
        .unwrap();
        drop(app);

        let same = App::new(&mut config, || Ok("correct horse".to_string())).unwrap();
        assert_eq!(same.store().token().as_deref(), Some("tok"));

        let other = App::new(&mut config, || Ok("wrong".to_string())).unwrap();
        assert!(other.store().read().is_none());
    }

    #[tokio::test]
    async fn test_grant_refuses_expired_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = file_config(&dir);

        // Session written two hours ago with a one hour lifetime
        let clock = ManualClock::new(Utc::now() - chrono::Duration::hours(2));
        let writer = SessionStore::builder(
            Arc::new(FileStore::new(dir.path().join("session")).unwrap()),
            Arc::new(SimulatedExchanger::default()),
        )
        .clock(Arc::new(clock))
        .build();
        writer
            .create(
                "tok",
                "user-1",
                &SessionConfig::default()
                    .with_expiration_minutes(60)
                    .without_refresh_token()
                    .with_auto_refresh(false),
            )
            .unwrap();

        let app = App::new(&mut config, no_passphrase).unwrap();
        assert_eq!(
            app.run(Command::Grant(vec!["reports:read".into()])).await.unwrap(),
            Outcome::Failure
        );
        assert!(app.store().read().is_none());
    }

    #[tokio::test]
    async fn test_login_with_out_of_range_minutes_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = file_config(&dir);
        let app = App::new(&mut config, no_passphrase).unwrap();

        let login = Command::parse(&args(&[
            "login",
            "tok",
            "user-1",
            "--minutes",
            "1000000000000",
        ]))
        .unwrap();
        assert!(app.run(login).await.is_err());
        assert!(app.store().read().is_none());
    }
}

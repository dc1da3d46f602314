//! Durable home of [`ControlSettings`]. A single row keyed `user-settings`;
//! each setter updates exactly one column so a mode change never clobbers a
//! concurrent light-state write and vice versa.

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::OnceCell;

use crate::control::{ControlSettings, LightState, Mode};
use crate::error::Error;

pub const SETTINGS_KEY: &str = "user-settings";

#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// `Ok(None)` when the record has never been written.
    async fn load(&self) -> Result<Option<ControlSettings>, Error>;
    /// Create the record if missing, leaving an existing one alone.
    async fn init(&self, defaults: ControlSettings) -> Result<(), Error>;
    async fn set_mode(&self, mode: Mode) -> Result<(), Error>;
    async fn set_light_state(&self, state: LightState) -> Result<(), Error>;
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

pub struct SqliteStore {
    pool: Pool<Sqlite>,
    migrated: OnceCell<()>,
}

impl SqliteStore {
    /// Build a lazy pool: nothing is opened until the first call, and every
    /// call retries the database, so a disk that is not ready at boot is
    /// picked up by a later write.
    ///
    /// db_url examples:
    /// - "sqlite:/home/pi/porchlight/porchlight.db"
    /// - "sqlite::memory:" (tests)
    pub fn connect(db_url: &str) -> Result<Self, Error> {
        let options = SqliteConnectOptions::from_str(db_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        // One connection keeps `sqlite::memory:` a single shared database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(5))
            .connect_lazy_with(options);

        Ok(Self {
            pool,
            migrated: OnceCell::new(),
        })
    }

    /// Runs SQLx migrations from ./migrations once; a failed attempt is
    /// retried by the next call.
    pub async fn migrate(&self) -> Result<(), Error> {
        self.migrated
            .get_or_try_init(|| async {
                sqlx::migrate!("./migrations")
                    .run(&self.pool)
                    .await
                    .map_err(|e| Error::StoreUnavailable(format!("migrations failed: {e}")))
            })
            .await?;
        Ok(())
    }

    fn now_unix() -> i64 {
        OffsetDateTime::now_utc().unix_timestamp()
    }
}

#[async_trait]
impl SettingsStore for SqliteStore {
    async fn load(&self) -> Result<Option<ControlSettings>, Error> {
        self.migrate().await?;
        let row = sqlx::query("SELECT mode, light_state FROM settings WHERE key = ?")
            .bind(SETTINGS_KEY)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let mode: String = row.try_get("mode")?;
        let light: String = row.try_get("light_state")?;
        Ok(Some(ControlSettings {
            mode: mode.parse().map_err(Error::StoreUnavailable)?,
            light_state: light.parse().map_err(Error::StoreUnavailable)?,
        }))
    }

    async fn init(&self, defaults: ControlSettings) -> Result<(), Error> {
        self.migrate().await?;
        sqlx::query(
            r#"
            INSERT INTO settings (key, mode, light_state, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(key) DO NOTHING
            "#,
        )
        .bind(SETTINGS_KEY)
        .bind(defaults.mode.as_str())
        .bind(defaults.light_state.as_str())
        .bind(Self::now_unix())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // Upserts: a record lost to an outage at boot is recreated by the next
    // write, with the other column at its default.
    async fn set_mode(&self, mode: Mode) -> Result<(), Error> {
        self.migrate().await?;
        sqlx::query(
            r#"
            INSERT INTO settings (key, mode, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
              mode = excluded.mode,
              updated_at = excluded.updated_at
            "#,
        )
        .bind(SETTINGS_KEY)
        .bind(mode.as_str())
        .bind(Self::now_unix())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_light_state(&self, state: LightState) -> Result<(), Error> {
        self.migrate().await?;
        sqlx::query(
            r#"
            INSERT INTO settings (key, light_state, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
              light_state = excluded.light_state,
              updated_at = excluded.updated_at
            "#,
        )
        .bind(SETTINGS_KEY)
        .bind(state.as_str())
        .bind(Self::now_unix())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory (tests, and a fallback when the database URL is invalid)
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryStore {
    record: Mutex<Option<ControlSettings>>,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with `StoreUnavailable`.
    #[cfg(test)]
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub fn snapshot(&self) -> Option<ControlSettings> {
        *self.lock()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<ControlSettings>> {
        self.record.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn check(&self) -> Result<(), Error> {
        if self.offline.load(Ordering::SeqCst) {
            Err(Error::StoreUnavailable("memory store offline".into()))
        } else {
            Ok(())
        }
    }

    fn update(&self, f: impl FnOnce(&mut ControlSettings)) -> Result<(), Error> {
        self.check()?;
        f(self.lock().get_or_insert_with(ControlSettings::default));
        Ok(())
    }
}

#[async_trait]
impl SettingsStore for MemoryStore {
    async fn load(&self) -> Result<Option<ControlSettings>, Error> {
        self.check()?;
        Ok(*self.lock())
    }

    async fn init(&self, defaults: ControlSettings) -> Result<(), Error> {
        self.check()?;
        self.lock().get_or_insert(defaults);
        Ok(())
    }

    async fn set_mode(&self, mode: Mode) -> Result<(), Error> {
        self.update(|r| r.mode = mode)
    }

    async fn set_light_state(&self, state: LightState) -> Result<(), Error> {
        self.update(|r| r.light_state = state)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    async fn sqlite() -> SqliteStore {
        SqliteStore::connect("sqlite::memory:").unwrap()
    }

    #[tokio::test]
    async fn sqlite_empty_store_loads_none() {
        let store = sqlite().await;
        assert_eq!(store.load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn sqlite_init_creates_defaults_once() {
        let store = sqlite().await;
        store.init(ControlSettings::default()).await.unwrap();
        store.set_mode(Mode::Manual).await.unwrap();

        // A second init must not reset the existing record.
        store.init(ControlSettings::default()).await.unwrap();
        let s = store.load().await.unwrap().unwrap();
        assert_eq!(s.mode, Mode::Manual);
        assert_eq!(s.light_state, LightState::Off);
    }

    #[tokio::test]
    async fn sqlite_point_updates_do_not_clobber() {
        let store = sqlite().await;
        store.init(ControlSettings::default()).await.unwrap();

        store.set_light_state(LightState::On).await.unwrap();
        store.set_mode(Mode::Manual).await.unwrap();

        let s = store.load().await.unwrap().unwrap();
        assert_eq!(
            s,
            ControlSettings {
                mode: Mode::Manual,
                light_state: LightState::On
            }
        );
    }

    #[tokio::test]
    async fn sqlite_update_without_record_creates_it() {
        let store = sqlite().await;
        store.set_light_state(LightState::On).await.unwrap();
        let s = store.load().await.unwrap().unwrap();
        assert_eq!(s.mode, Mode::Sensor);
        assert_eq!(s.light_state, LightState::On);
    }

    #[tokio::test]
    async fn sqlite_unreachable_at_boot_recovers_on_later_write() {
        let tmp = tempfile::tempdir().unwrap();
        let data = tmp.path().join("data");
        let url = format!("sqlite:{}", data.join("porchlight.db").display());
        let store = SqliteStore::connect(&url).unwrap();

        // The data directory is not mounted yet.
        assert!(matches!(store.load().await, Err(Error::StoreUnavailable(_))));
        assert!(store.set_mode(Mode::Manual).await.is_err());

        std::fs::create_dir(&data).unwrap();
        store.set_light_state(LightState::On).await.unwrap();

        let reopened = SqliteStore::connect(&url).unwrap();
        let s = reopened.load().await.unwrap().unwrap();
        assert_eq!(s.light_state, LightState::On);
        assert_eq!(s.mode, Mode::Sensor);
    }

    #[tokio::test]
    async fn memory_store_offline_fails_every_call() {
        let store = MemoryStore::new();
        store.init(ControlSettings::default()).await.unwrap();
        store.set_offline(true);
        assert!(store.load().await.is_err());
        assert!(store.set_light_state(LightState::On).await.is_err());
        store.set_offline(false);
        assert_eq!(store.snapshot(), Some(ControlSettings::default()));
    }
}

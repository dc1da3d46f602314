//! The only writer of the light pin.
//!
//! Every path (sensor evaluation, client command, toggle) goes through
//! [`Controller`], which holds the pin, the in-memory [`ControlSettings`] and
//! a write generation behind one async mutex.
//!
//! Ordering: an automatic evaluation takes a [`Ticket`] *before* sampling the
//! sensor. Manual writes and mode changes bump the generation, and
//! [`Controller::evaluate`] discards any decision whose ticket is older than
//! the current generation. A stale automatic decision therefore never
//! overwrites a manual command that landed while the sensor was being read.
//! The previous state fed to the policy is read under the lock at decision
//! time, so two overlapping automatic evaluations never undo each other.

use std::sync::Arc;
use time::Time;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::actuator::LightSwitch;
use crate::control::{
    decide, resolve_command, ActuatorCommand, ControlSettings, LightPolicy, LightState, Mode,
    Origin,
};
use crate::error::Error;
use crate::store::SettingsStore;

struct Inner {
    switch: LightSwitch,
    settings: ControlSettings,
    generation: u64,
}

/// Captured at the start of an automatic evaluation.
#[derive(Debug, Clone, Copy)]
pub struct Ticket {
    generation: u64,
}

/// Result of one write to the pin.
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    pub command: ActuatorCommand,
    /// Pin read-back after the write. This is the state of record.
    pub confirmed: LightState,
    /// `confirmed` differs from the state held before the write.
    pub changed: bool,
    /// Set when the read-back disagrees with the request.
    pub anomaly: Option<Error>,
    /// Set when persisting the new state failed.
    pub store_error: Option<Error>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Applied(Applied),
    /// A newer manual write superseded this automatic decision.
    Discarded,
    /// The command is not honoured in the current mode.
    Ignored { mode: Mode },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModeChange {
    pub mode: Mode,
    pub store_error: Option<Error>,
}

pub struct Controller {
    inner: Mutex<Inner>,
    store: Arc<dyn SettingsStore>,
    policy: LightPolicy,
}

impl Controller {
    /// Load settings (creating defaults on first boot) and reconcile the pin
    /// with the persisted light state. A store failure is logged and the
    /// daemon runs on defaults.
    pub async fn boot(
        switch: LightSwitch,
        store: Arc<dyn SettingsStore>,
        policy: LightPolicy,
    ) -> (Self, Applied) {
        let settings = match store.load().await {
            Ok(Some(s)) => {
                info!(mode = %s.mode, light = %s.light_state, "settings loaded");
                s
            }
            Ok(None) => {
                let defaults = ControlSettings::default();
                if let Err(e) = store.init(defaults).await {
                    error!("settings: creating defaults failed: {e}");
                } else {
                    info!("settings: created defaults on first boot");
                }
                defaults
            }
            Err(e) => {
                error!("settings: load failed, running on defaults: {e}");
                ControlSettings::default()
            }
        };

        let controller = Self {
            inner: Mutex::new(Inner {
                switch,
                settings,
                generation: 0,
            }),
            store,
            policy,
        };

        let reconciled = {
            let mut inner = controller.inner.lock().await;
            let cmd = ActuatorCommand {
                requested: settings.light_state,
                origin: Origin::Sensor,
            };
            controller.apply_locked(&mut inner, cmd).await
        };

        (controller, reconciled)
    }

    pub fn policy(&self) -> &LightPolicy {
        &self.policy
    }

    pub async fn settings(&self) -> ControlSettings {
        self.inner.lock().await.settings
    }

    pub async fn begin_evaluation(&self) -> Ticket {
        Ticket {
            generation: self.inner.lock().await.generation,
        }
    }

    /// Run the sensor policy for a reading taken under `ticket`.
    pub async fn evaluate(&self, ticket: Ticket, reading: Option<f64>, now: Time) -> Outcome {
        let mut inner = self.inner.lock().await;

        if inner.generation != ticket.generation {
            debug!(
                ticket = ticket.generation,
                current = inner.generation,
                "evaluation superseded by a newer write, discarded"
            );
            return Outcome::Discarded;
        }

        let mode = inner.settings.mode;
        if mode == Mode::Manual {
            return Outcome::Ignored { mode };
        }

        let prev = inner.settings.light_state;
        let next = decide(&self.policy, reading, mode, prev, now);
        let cmd = ActuatorCommand {
            requested: next,
            origin: Origin::Sensor,
        };
        Outcome::Applied(self.apply_locked(&mut inner, cmd).await)
    }

    /// Client-issued target state; only honoured in manual mode.
    pub async fn set_light(&self, requested: LightState) -> Outcome {
        let mut inner = self.inner.lock().await;
        let cmd = ActuatorCommand {
            requested,
            origin: Origin::Client,
        };
        let mode = inner.settings.mode;
        match resolve_command(&cmd, mode) {
            None => {
                info!(%requested, %mode, "light command ignored outside manual mode");
                Outcome::Ignored { mode }
            }
            Some(_) => {
                inner.generation += 1;
                Outcome::Applied(self.apply_locked(&mut inner, cmd).await)
            }
        }
    }

    /// Flip whatever the pin currently reads, bypassing policy.
    pub async fn toggle(&self) -> Applied {
        let mut inner = self.inner.lock().await;
        let requested = inner.switch.read().flipped();
        inner.generation += 1;
        let cmd = ActuatorCommand {
            requested,
            origin: Origin::Toggle,
        };
        self.apply_locked(&mut inner, cmd).await
    }

    pub async fn set_mode(&self, mode: Mode) -> ModeChange {
        let mut inner = self.inner.lock().await;
        inner.settings.mode = mode;
        inner.generation += 1;
        info!(%mode, "control mode changed");

        let store_error = self.store.set_mode(mode).await.err();
        if let Some(e) = &store_error {
            error!(%mode, "settings: persisting mode failed: {e}");
        }
        ModeChange { mode, store_error }
    }

    /// Write, read back, reconcile. Caller holds the lock.
    async fn apply_locked(&self, inner: &mut Inner, command: ActuatorCommand) -> Applied {
        let before = inner.settings.light_state;

        inner.switch.write(command.requested);
        let confirmed = inner.switch.read();

        let anomaly = (confirmed != command.requested).then(|| {
            let e = Error::ActuatorMismatch {
                requested: command.requested,
                actual: confirmed,
            };
            warn!(origin = ?command.origin, "light pin update failed: {e}");
            e
        });

        let changed = confirmed != before;
        let mut store_error = None;
        if changed {
            inner.settings.light_state = confirmed;
            info!(from = %before, to = %confirmed, origin = ?command.origin, "light switched");
            if let Err(e) = self.store.set_light_state(confirmed).await {
                error!(light = %confirmed, "settings: persisting light state failed: {e}");
                store_error = Some(e);
            }
        }

        Applied {
            command,
            confirmed,
            changed,
            anomaly,
            store_error,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(all(test, not(feature = "gpio")))]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use time::macros::time;

    async fn boot_with(store: Arc<MemoryStore>) -> Controller {
        let switch = LightSwitch::new(16, true).unwrap();
        let (controller, _) = Controller::boot(switch, store, LightPolicy::default()).await;
        controller
    }

    async fn stick(controller: &Controller, level: LightState) {
        controller.inner.lock().await.switch.stuck = Some(level);
    }

    fn applied(outcome: Outcome) -> Applied {
        match outcome {
            Outcome::Applied(a) => a,
            other => panic!("expected Applied, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn first_boot_persists_defaults() {
        let store = Arc::new(MemoryStore::new());
        let c = boot_with(store.clone()).await;
        assert_eq!(c.settings().await, ControlSettings::default());
        assert_eq!(store.snapshot(), Some(ControlSettings::default()));
    }

    #[tokio::test]
    async fn boot_reconciles_pin_with_persisted_state() {
        let store = Arc::new(MemoryStore::new());
        store
            .init(ControlSettings {
                mode: Mode::Manual,
                light_state: LightState::On,
            })
            .await
            .unwrap();

        let c = boot_with(store).await;
        assert_eq!(c.inner.lock().await.switch.read(), LightState::On);
        assert_eq!(c.settings().await.mode, Mode::Manual);
    }

    #[tokio::test]
    async fn unreachable_store_at_boot_runs_on_defaults() {
        let store = Arc::new(MemoryStore::new());
        store.set_offline(true);
        let c = boot_with(store).await;
        assert_eq!(c.settings().await, ControlSettings::default());
    }

    #[tokio::test]
    async fn evaluation_switches_and_persists() {
        let store = Arc::new(MemoryStore::new());
        let c = boot_with(store.clone()).await;

        let ticket = c.begin_evaluation().await;
        let a = applied(c.evaluate(ticket, Some(220.0), time!(19:00)).await);

        assert_eq!(a.confirmed, LightState::On);
        assert!(a.changed);
        assert_eq!(a.anomaly, None);
        assert_eq!(store.snapshot().unwrap().light_state, LightState::On);
    }

    #[tokio::test]
    async fn read_back_wins_over_request() {
        let store = Arc::new(MemoryStore::new());
        let c = boot_with(store.clone()).await;
        stick(&c, LightState::Off).await;

        let ticket = c.begin_evaluation().await;
        let a = applied(c.evaluate(ticket, Some(220.0), time!(19:00)).await);

        assert_eq!(a.command.requested, LightState::On);
        assert_eq!(a.confirmed, LightState::Off);
        assert!(!a.changed);
        assert!(matches!(
            a.anomaly,
            Some(Error::ActuatorMismatch {
                requested: LightState::On,
                actual: LightState::Off
            })
        ));
        assert_eq!(c.settings().await.light_state, LightState::Off);
        assert_eq!(store.snapshot().unwrap().light_state, LightState::Off);
    }

    #[tokio::test]
    async fn mismatch_reconciles_settings_to_read_back() {
        let store = Arc::new(MemoryStore::new());
        let c = boot_with(store.clone()).await;
        c.set_mode(Mode::Manual).await;
        stick(&c, LightState::On).await;

        // Asked for OFF (already the recorded state) but the relay reads ON.
        let a = applied(c.set_light(LightState::Off).await);
        assert_eq!(a.confirmed, LightState::On);
        assert!(a.changed);
        assert!(a.anomaly.is_some());
        assert_eq!(store.snapshot().unwrap().light_state, LightState::On);
    }

    #[tokio::test]
    async fn manual_write_discards_in_flight_evaluation() {
        let store = Arc::new(MemoryStore::new());
        let c = boot_with(store).await;
        c.set_mode(Mode::Manual).await;
        c.set_mode(Mode::Sensor).await;

        // Evaluation starts, then a toggle lands while the sensor is read.
        let ticket = c.begin_evaluation().await;
        let t = c.toggle().await;
        assert_eq!(t.confirmed, LightState::On);

        // A bright daytime reading would turn the lamp off, but it is stale.
        let outcome = c.evaluate(ticket, Some(100.0), time!(12:00)).await;
        assert_eq!(outcome, Outcome::Discarded);
        assert_eq!(c.settings().await.light_state, LightState::On);
    }

    #[tokio::test]
    async fn overlapping_evaluations_decide_from_current_state() {
        let c = boot_with(Arc::new(MemoryStore::new())).await;

        // Both loops take a ticket before either reading comes back.
        let first = c.begin_evaluation().await;
        let second = c.begin_evaluation().await;

        let a = applied(c.evaluate(first, Some(220.0), time!(15:00)).await);
        assert_eq!(a.confirmed, LightState::On);

        // A failed reading outside both windows keeps the state just applied.
        let b = applied(c.evaluate(second, None, time!(15:00)).await);
        assert_eq!(b.command.requested, LightState::On);
        assert!(!b.changed);
        assert_eq!(c.settings().await.light_state, LightState::On);
    }

    #[tokio::test]
    async fn evaluation_in_manual_mode_is_ignored() {
        let c = boot_with(Arc::new(MemoryStore::new())).await;
        c.set_mode(Mode::Manual).await;
        let ticket = c.begin_evaluation().await;
        let outcome = c.evaluate(ticket, Some(250.0), time!(19:00)).await;
        assert_eq!(outcome, Outcome::Ignored { mode: Mode::Manual });
        assert_eq!(c.settings().await.light_state, LightState::Off);
    }

    #[tokio::test]
    async fn manual_on_command_wins_regardless_of_time_or_reading() {
        let c = boot_with(Arc::new(MemoryStore::new())).await;
        c.set_mode(Mode::Manual).await;
        let a = applied(c.set_light(LightState::On).await);
        assert_eq!(a.confirmed, LightState::On);
        assert_eq!(a.command.origin, Origin::Client);
    }

    #[tokio::test]
    async fn client_light_command_ignored_in_sensor_mode() {
        let c = boot_with(Arc::new(MemoryStore::new())).await;
        let outcome = c.set_light(LightState::On).await;
        assert_eq!(outcome, Outcome::Ignored { mode: Mode::Sensor });
        assert_eq!(c.inner.lock().await.switch.read(), LightState::Off);
    }

    #[tokio::test]
    async fn toggle_flips_pin_read_back() {
        let c = boot_with(Arc::new(MemoryStore::new())).await;
        assert_eq!(c.toggle().await.confirmed, LightState::On);
        assert_eq!(c.toggle().await.confirmed, LightState::Off);
    }

    #[tokio::test]
    async fn store_failure_keeps_in_memory_state() {
        let store = Arc::new(MemoryStore::new());
        let c = boot_with(store.clone()).await;
        store.set_offline(true);

        let a = c.toggle().await;
        assert_eq!(a.confirmed, LightState::On);
        assert!(matches!(a.store_error, Some(Error::StoreUnavailable(_))));
        assert_eq!(c.settings().await.light_state, LightState::On);

        let change = c.set_mode(Mode::Manual).await;
        assert!(change.store_error.is_some());
        assert_eq!(c.settings().await.mode, Mode::Manual);
    }
}

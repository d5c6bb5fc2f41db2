//! Live-registrar slot shared between a component and its retry supervisor.
//!
//! The component owns the slot. A supervisor only receives an
//! [`InstallHandle`] tagged with the generation it was started under; once
//! the slot has moved on (another install, or shutdown) the handle's install
//! is rejected, so a late supervisor can never replace a newer registrar.

use meshkit_registry::{Registrar, Result};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Where a component stands with the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    /// Not started, or running without a registry.
    Unregistered,
    /// Registered with a heartbeat running.
    Live,
    /// Backend unreachable at start; registering in the background.
    Retrying,
    /// Shut down or cancelled.
    Terminated,
}

#[derive(Debug, Default)]
struct LiveRegistration {
    registrar: Option<Arc<Registrar>>,
    generation: u64,
}

#[derive(Debug)]
pub struct RegistrationSlot {
    live: RwLock<LiveRegistration>,
    state: Mutex<RegistrationState>,
}

impl RegistrationSlot {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            live: RwLock::new(LiveRegistration::default()),
            state: Mutex::new(RegistrationState::Unregistered),
        })
    }

    /// Registrar currently serving the component.
    pub async fn registrar(&self) -> Option<Arc<Registrar>> {
        self.live.read().await.registrar.clone()
    }

    pub async fn generation(&self) -> u64 {
        self.live.read().await.generation
    }

    #[must_use]
    pub fn state(&self) -> RegistrationState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: RegistrationState) {
        *self.state.lock() = state;
    }

    /// Handle that may install a registrar as long as nothing else does first.
    pub async fn install_handle(self: &Arc<Self>) -> InstallHandle {
        InstallHandle {
            slot: Arc::downgrade(self),
            generation: self.generation().await,
        }
    }

    /// Empty the slot and invalidate every outstanding handle.
    pub async fn take(&self) -> Option<Arc<Registrar>> {
        let mut live = self.live.write().await;
        live.generation += 1;
        live.registrar.take()
    }
}

/// The only way a supervisor can touch the slot.
#[derive(Debug, Clone)]
pub struct InstallHandle {
    slot: Weak<RegistrationSlot>,
    generation: u64,
}

impl InstallHandle {
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Make `registrar` the live one for `service_id`.
    ///
    /// Under the slot's write lock: start the heartbeat on the new registrar,
    /// swap, then stop and close the previous one. Returns `false` (after
    /// stopping and closing `registrar`) when the slot has moved past this
    /// handle's generation or no longer exists.
    ///
    /// # Errors
    /// Returns an error if the heartbeat cannot be started; the slot keeps
    /// its previous registrar.
    pub async fn install(
        &self,
        registrar: Arc<Registrar>,
        service_id: &str,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let Some(slot) = self.slot.upgrade() else {
            discard(&registrar, service_id, "component dropped").await;
            return Ok(false);
        };

        let mut live = slot.live.write().await;
        if live.generation != self.generation {
            drop(live);
            discard(&registrar, service_id, "stale registrar").await;
            return Ok(false);
        }

        registrar.start_heartbeat(service_id, cancel).await?;
        let previous = live.registrar.replace(registrar);
        live.generation += 1;
        slot.set_state(RegistrationState::Live);
        tracing::debug!(service_id, generation = live.generation, "registrar installed");

        if let Some(previous) = previous {
            previous.stop_all().await;
            previous.backend().close().await;
        }
        Ok(true)
    }
}

/// Stop a registrar that lost the race. Its record stays: the winner owns
/// the same id.
async fn discard(registrar: &Registrar, service_id: &str, reason: &str) {
    tracing::info!(service_id, reason, "discarding registrar");
    registrar.stop_all().await;
    registrar.backend().close().await;
}

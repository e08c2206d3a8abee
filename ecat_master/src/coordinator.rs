//! Bus state coordinator.
//!
//! Called once per supervisory iteration. Each call computes the next state
//! on the way to the requested one, issues exactly one transition request,
//! and runs the setup tied to entering that state.
//!
//! ```text
//! requested  current              next expected
//! ---------  -------------------  -------------
//! INIT       any                  INIT
//! PREOP      UNKNOWN, BOOTSTRAP   INIT
//!            otherwise            PREOP
//! SAFEOP     UNKNOWN, BOOTSTRAP   INIT
//!            INIT                 PREOP
//!            otherwise            SAFEOP
//! OP         UNKNOWN, BOOTSTRAP   INIT
//!            INIT                 PREOP
//!            PREOP                SAFEOP
//!            SAFEOP, OP           OP
//! BOOTSTRAP  INIT, BOOTSTRAP      BOOTSTRAP
//!            otherwise            INIT
//! UNKNOWN    any                  current (hold)
//! ```

use crate::directory;
use crate::error::CoordinatorError;
use ecat_common::bus::BusState;
use ecat_common::bus::config::MasterConfig;
use ecat_common::bus::master::{BusMaster, StatusCode};
use ecat_shared_memory::ProcessDataBridge;
use std::sync::Arc;
use tracing::{info, warn};

/// Next state on the way from `current` to `requested`.
pub fn next_expected_state(requested: BusState, current: BusState) -> BusState {
    use BusState::*;
    match requested {
        Unknown => current,
        Init => Init,
        _ if current.is_indeterminate() && requested != Bootstrap => Init,
        PreOp => PreOp,
        SafeOp | Op if current == Init => PreOp,
        SafeOp => SafeOp,
        Op if current == PreOp => SafeOp,
        Op => Op,
        Bootstrap if matches!(current, Init | Bootstrap) => Bootstrap,
        Bootstrap => Init,
    }
}

/// Result of one coordinator step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Already in the next expected state; nothing requested.
    Holding(BusState),
    /// The transition succeeded; the bus is now in this state.
    Entered(BusState),
    /// The transition did not complete; retried next iteration.
    Retry {
        /// State that was requested.
        target: BusState,
        /// Status returned by the master.
        status: StatusCode,
    },
}

/// Drives the master one step at a time toward the requested state.
pub struct StateCoordinator {
    master: Arc<dyn BusMaster>,
    bridge: Arc<ProcessDataBridge>,
    config: MasterConfig,
    /// Slave count verified for the current stay in INIT.
    inventory_checked: bool,
}

impl StateCoordinator {
    /// Coordinator for `master`, publishing into `bridge`.
    pub fn new(master: Arc<dyn BusMaster>, bridge: Arc<ProcessDataBridge>, config: MasterConfig) -> Self {
        Self {
            master,
            bridge,
            config,
            inventory_checked: false,
        }
    }

    /// Requested state, as currently stored in the snapshot.
    pub fn requested(&self) -> BusState {
        self.bridge.snapshot().requested_state()
    }

    /// Change the requested state.
    pub fn request(&self, state: BusState) {
        info!(%state, "Bus state requested");
        self.bridge.snapshot().set_requested_state(state);
    }

    /// One coordinator iteration.
    ///
    /// # Errors
    ///
    /// Fatal setup problems, and transition failures below SAFEOP that are
    /// not transient. The slave inventory is checked whenever the bus is
    /// first seen in INIT, including a master already in INIT at startup.
    pub fn step(&mut self) -> Result<StepOutcome, CoordinatorError> {
        let bridge = Arc::clone(&self.bridge);
        let snapshot = bridge.snapshot();
        let current = self.master.master_state();
        let requested = snapshot.requested_state();
        let next = next_expected_state(requested, current);

        snapshot.set_current_state(current);
        snapshot.set_next_expected_state(next);
        snapshot
            .is_authorized
            .store(self.master.is_authorized(), std::sync::atomic::Ordering::Relaxed);

        if current != BusState::Init {
            self.inventory_checked = false;
        } else if !self.inventory_checked {
            self.check_inventory()?;
        }

        if next == current {
            return Ok(StepOutcome::Holding(current));
        }

        let status = self
            .master
            .set_master_state(self.config.bus.state_timeout(), next);
        let reached = self.master.master_state();
        snapshot.set_current_state(reached);

        if !status.is_ok() || reached != next {
            return self.transition_failed(next, status);
        }

        info!(from = %current, to = %reached, "Bus state changed");
        self.on_enter(reached)?;
        Ok(StepOutcome::Entered(reached))
    }

    fn transition_failed(
        &self,
        target: BusState,
        status: StatusCode,
    ) -> Result<StepOutcome, CoordinatorError> {
        match target {
            BusState::SafeOp if self.config.bus.dc_enabled => {
                warn!(
                    %status,
                    sync = ?self.master.sync_status(),
                    "SAFEOP not reached, waiting for clock synchronization"
                );
            }
            BusState::SafeOp | BusState::Op => {
                warn!(%target, %status, "Transition not completed, retrying");
            }
            _ if status.is_tolerated() || status == StatusCode::Ok => {
                warn!(%target, %status, "Transition not completed, retrying");
            }
            _ => return Err(CoordinatorError::TransitionFailed { target, status }),
        }
        Ok(StepOutcome::Retry { target, status })
    }

    /// Setup tied to entering `state`.
    fn on_enter(&mut self, state: BusState) -> Result<(), CoordinatorError> {
        match state {
            BusState::Init => self.check_inventory()?,
            BusState::PreOp => {
                directory::resolve_and_publish(
                    self.master.as_ref(),
                    &self.config.slaves,
                    self.bridge.snapshot(),
                )?;
            }
            _ => {}
        }
        Ok(())
    }

    fn check_inventory(&mut self) -> Result<(), CoordinatorError> {
        let configured = self.config.slaves.len();
        let found = self.master.slave_count();
        if found != configured {
            return Err(CoordinatorError::ConfigurationMismatch { configured, found });
        }
        info!(slaves = found, "Slave inventory matches configuration");
        self.inventory_checked = true;
        Ok(())
    }
}

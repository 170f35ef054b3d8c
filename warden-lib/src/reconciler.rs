// SPDX-License-Identifier: GPL-2.0-only
use crate::prefs::{self, PrefKey, PrefValue, Preference, ValidationError};
use crate::registry::traits::{CreateGuestParams, RegistryError, VmHandle, VmRegistry};
use crate::vm::{DesiredState, GuestInfo, NetVmChoice, VmClass, VmState};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Wait between re-checks of observed state while decommissioning a guest.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Errors from reconciliation operations.
#[derive(Debug)]
pub enum ReconcileError {
    /// Guest name unresolvable
    NotFound(String),
    /// The request failed schema or referential validation
    Validation(ValidationError),
    /// The undefine wait outlived its deadline
    DeadlineExceeded(String),
    /// The registry or a per-guest operation failed
    Registry(RegistryError),
}

impl std::fmt::Display for ReconcileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReconcileError::NotFound(name) => write!(f, "guest not found: {name}"),
            ReconcileError::Validation(e) => write!(f, "{e}"),
            ReconcileError::DeadlineExceeded(name) => {
                write!(f, "guest '{name}' did not reach shutdown before the deadline")
            }
            ReconcileError::Registry(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ReconcileError {}

impl From<RegistryError> for ReconcileError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound(name) => ReconcileError::NotFound(name),
            other => ReconcileError::Registry(other),
        }
    }
}

impl From<ValidationError> for ReconcileError {
    fn from(e: ValidationError) -> Self {
        ReconcileError::Validation(e)
    }
}

/// What a reconciliation operation actually did.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Detail {
    Created { name: String },
    AlreadyPresent { name: String },
    Started,
    Unpaused,
    Paused,
    ShutdownRequested,
    ForcedOff,
    InSync { state: VmState },
    PrefsApplied { created: bool, fields: Vec<String> },
    Removed { name: String },
}

/// Result of one reconciliation operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Outcome {
    pub changed: bool,
    pub detail: Detail,
}

impl Outcome {
    fn changed(detail: Detail) -> Self {
        Outcome { changed: true, detail }
    }

    fn unchanged(detail: Detail) -> Self {
        Outcome { changed: false, detail }
    }
}

/// The sole mutator of guest state and guest attributes.
///
/// Holds no state of its own beyond the injected registry; every read goes
/// to the registry fresh, so a concurrent external actor is a tolerated
/// best-effort race rather than a cache-coherence bug.
pub struct Reconciler<'a> {
    registry: &'a dyn VmRegistry,
    poll_interval: Duration,
}

impl<'a> Reconciler<'a> {
    pub fn new(registry: &'a dyn VmRegistry) -> Self {
        Reconciler {
            registry,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Observed lifecycle state of one guest. Pure read.
    pub fn status(&self, name: &str) -> Result<VmState, ReconcileError> {
        Ok(self.registry.lookup(name)?.observed_state()?)
    }

    /// Names of all guests, administrative domain excluded, optionally
    /// filtered by observed state.
    pub fn list_vms(&self, filter: Option<VmState>) -> Result<Vec<String>, ReconcileError> {
        let mut names = Vec::new();
        for handle in self.registry.list_handles()? {
            if handle.class()? == VmClass::AdminVM {
                continue;
            }
            if let Some(state) = filter {
                if handle.observed_state()? != state {
                    continue;
                }
            }
            names.push(handle.name().to_string());
        }
        Ok(names)
    }

    /// Snapshot of every guest except the administrative domain.
    pub fn info(&self) -> Result<BTreeMap<String, GuestInfo>, ReconcileError> {
        let mut map = BTreeMap::new();
        for handle in self.registry.list_handles()? {
            if handle.class()? == VmClass::AdminVM {
                continue;
            }
            let provides_network = match handle.get_pref(PrefKey::ProvidesNetwork)? {
                PrefValue::Bool(b) => b,
                _ => false,
            };
            let label = match handle.get_pref(PrefKey::Label)? {
                PrefValue::Str(s) => s,
                _ => String::new(),
            };
            map.insert(
                handle.name().to_string(),
                GuestInfo {
                    state: handle.observed_state()?,
                    provides_network,
                    label,
                },
            );
        }
        Ok(map)
    }

    /// "name state" lines over every guest, administrative domain included.
    pub fn get_states(&self) -> Result<Vec<String>, ReconcileError> {
        let mut states = Vec::new();
        for handle in self.registry.list_handles()? {
            states.push(format!("{} {}", handle.name(), handle.observed_state()?));
        }
        Ok(states)
    }

    /// Create the guest if it does not exist; report whether it did.
    ///
    /// The network VM resolves like a preference reference: "default" means
    /// the registry's configured default network VM, absent means none, and
    /// any other name must already exist.
    pub fn ensure_present(
        &self,
        params: &CreateGuestParams,
        netvm: &NetVmChoice,
    ) -> Result<Outcome, ReconcileError> {
        match self.registry.lookup(&params.name) {
            Ok(_) => Ok(Outcome::unchanged(Detail::AlreadyPresent {
                name: params.name.clone(),
            })),
            Err(RegistryError::NotFound(_)) => {
                let netvm_name = match netvm {
                    NetVmChoice::Default => self.registry.default_netvm()?,
                    NetVmChoice::None => None,
                    NetVmChoice::Named(name) => {
                        self.registry.lookup(name)?;
                        Some(name.clone())
                    }
                };
                let handle = self.registry.create_handle(params)?;
                handle.set_pref(&Preference {
                    key: PrefKey::NetVm,
                    value: PrefValue::Str(netvm_name.unwrap_or_default()),
                })?;
                info!(guest = %params.name, class = %params.class, "created guest");
                Ok(Outcome::changed(Detail::Created {
                    name: params.name.clone(),
                }))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Converge the guest's attribute bag on the requested preferences.
    ///
    /// Validation runs to completion first, so an invalid request mutates
    /// nothing. A missing guest is created (that is the one place absence is
    /// not an error). Differing fields are then applied one by one, in
    /// request order; an external failure mid-way leaves earlier writes in
    /// place, and a re-run converges on the remainder.
    pub fn apply_preferences(
        &self,
        requested: &[Preference],
        params: &CreateGuestParams,
        netvm: &NetVmChoice,
    ) -> Result<Outcome, ReconcileError> {
        prefs::validate(requested, self.registry)?;

        let mut created = false;
        let handle = match self.registry.lookup(&params.name) {
            Ok(handle) => handle,
            Err(RegistryError::NotFound(_)) => {
                self.ensure_present(params, netvm)?;
                created = true;
                self.registry.lookup(&params.name)?
            }
            Err(e) => return Err(e.into()),
        };

        let mut fields = Vec::new();
        for pref in requested {
            let current = handle.get_pref(pref.key)?;
            if current != pref.value {
                handle.set_pref(pref)?;
                debug!(guest = %params.name, pref = pref.key.as_str(), "preference updated");
                fields.push(pref.key.as_str().to_string());
            }
        }
        Ok(Outcome {
            changed: created || !fields.is_empty(),
            detail: Detail::PrefsApplied { created, fields },
        })
    }

    /// Converge the guest on a desired lifecycle state, issuing zero or one
    /// corrective action. Invoked twice in a row with no external
    /// interference, the second call is a no-op.
    pub fn transition(
        &self,
        name: &str,
        desired: DesiredState,
        deadline: Option<Instant>,
    ) -> Result<Outcome, ReconcileError> {
        let handle = self.registry.lookup(name)?;
        let state = handle.observed_state()?;
        let outcome = match desired {
            DesiredState::Running => match state {
                VmState::Paused => {
                    handle.unpause()?;
                    Outcome::changed(Detail::Unpaused)
                }
                VmState::Running => Outcome::unchanged(Detail::InSync { state }),
                _ => {
                    handle.start()?;
                    Outcome::changed(Detail::Started)
                }
            },
            DesiredState::Paused => match state {
                VmState::Running => {
                    handle.pause()?;
                    Outcome::changed(Detail::Paused)
                }
                _ => Outcome::unchanged(Detail::InSync { state }),
            },
            DesiredState::Shutdown => match state {
                VmState::Running | VmState::Paused => {
                    handle.shutdown()?;
                    Outcome::changed(Detail::ShutdownRequested)
                }
                _ => Outcome::unchanged(Detail::InSync { state }),
            },
            DesiredState::Destroyed => match state {
                VmState::Running | VmState::Paused => {
                    handle.force_shutdown()?;
                    Outcome::changed(Detail::ForcedOff)
                }
                _ => Outcome::unchanged(Detail::InSync { state }),
            },
            DesiredState::Undefine => self.undefine(&*handle, deadline)?,
        };
        if outcome.changed {
            info!(guest = %name, desired = %desired, detail = ?outcome.detail, "converged");
        }
        Ok(outcome)
    }

    /// Stop a guest and remove it from the registry.
    ///
    /// The forced stop tolerates a "not started" report: the guest may have
    /// halted between the state read and the stop, and the poll below makes
    /// the outcome correct either way. Removal happens even when the guest
    /// was already down.
    fn undefine(
        &self,
        handle: &dyn VmHandle,
        deadline: Option<Instant>,
    ) -> Result<Outcome, ReconcileError> {
        let name = handle.name().to_string();
        if handle.observed_state()? != VmState::Shutdown {
            match handle.force_shutdown() {
                Ok(()) => {}
                Err(RegistryError::NotStarted(_)) => {
                    warn!(guest = %name, "guest stopped on its own during forced shutdown");
                }
                Err(e) => return Err(e.into()),
            }
            loop {
                if handle.observed_state()? == VmState::Shutdown {
                    break;
                }
                if let Some(deadline) = deadline {
                    if Instant::now() >= deadline {
                        return Err(ReconcileError::DeadlineExceeded(name));
                    }
                }
                std::thread::sleep(self.poll_interval);
            }
        }
        self.registry.delete_handle(&name)?;
        info!(guest = %name, "guest removed from registry");
        Ok(Outcome::changed(Detail::Removed { name }))
    }

    /// Imperative guest commands. Unlike `transition`, these issue their
    /// action unconditionally and surface whatever the manager reports.
    pub fn start(&self, name: &str) -> Result<Outcome, ReconcileError> {
        self.registry.lookup(name)?.start()?;
        Ok(Outcome::changed(Detail::Started))
    }

    pub fn pause(&self, name: &str) -> Result<Outcome, ReconcileError> {
        self.registry.lookup(name)?.pause()?;
        Ok(Outcome::changed(Detail::Paused))
    }

    pub fn unpause(&self, name: &str) -> Result<Outcome, ReconcileError> {
        self.registry.lookup(name)?.unpause()?;
        Ok(Outcome::changed(Detail::Unpaused))
    }

    pub fn shutdown(&self, name: &str) -> Result<Outcome, ReconcileError> {
        self.registry.lookup(name)?.shutdown()?;
        Ok(Outcome::changed(Detail::ShutdownRequested))
    }

    pub fn force_off(&self, name: &str) -> Result<Outcome, ReconcileError> {
        self.registry.lookup(name)?.force_shutdown()?;
        Ok(Outcome::changed(Detail::ForcedOff))
    }
}

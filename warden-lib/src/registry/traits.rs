// SPDX-License-Identifier: GPL-2.0-only
use crate::prefs::{PrefKey, PrefValue, Preference};
use crate::vm::{VmClass, VmState};

/// Errors from the VM registry and from per-guest operations.
#[derive(Debug)]
pub enum RegistryError {
    /// No guest with that name
    NotFound(String),
    /// A guest with that name already exists
    AlreadyExists(String),
    /// Lifecycle operation on a guest that is not running
    NotStarted(String),
    /// The underlying virtualization manager call failed
    Backend(String),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::NotFound(name) => write!(f, "guest not found: {name}"),
            RegistryError::AlreadyExists(name) => write!(f, "guest already exists: {name}"),
            RegistryError::NotStarted(name) => write!(f, "guest not started: {name}"),
            RegistryError::Backend(e) => write!(f, "backend error: {e}"),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Parameters for defining a new guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateGuestParams {
    pub name: String,
    pub class: VmClass,
    pub label: String,
    pub template: Option<String>,
}

impl CreateGuestParams {
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("guest name must not be empty".to_string());
        }
        Ok(())
    }
}

/// One guest as seen by the underlying virtualization manager.
///
/// Lifecycle operations are opaque, possibly slow, possibly failing remote
/// calls. `force_shutdown` on a guest that is already down reports
/// `NotStarted`; callers that poll afterwards may tolerate it.
pub trait VmHandle: std::fmt::Debug {
    fn name(&self) -> &str;

    fn class(&self) -> Result<VmClass, RegistryError>;

    fn is_paused(&self) -> Result<bool, RegistryError>;
    fn is_running(&self) -> Result<bool, RegistryError>;
    fn is_halted(&self) -> Result<bool, RegistryError>;

    fn start(&self) -> Result<(), RegistryError>;
    fn pause(&self) -> Result<(), RegistryError>;
    fn unpause(&self) -> Result<(), RegistryError>;
    fn shutdown(&self) -> Result<(), RegistryError>;
    fn force_shutdown(&self) -> Result<(), RegistryError>;

    /// Read one attribute of the guest's mutable attribute bag.
    fn get_pref(&self, key: PrefKey) -> Result<PrefValue, RegistryError>;

    /// Write one attribute of the guest's mutable attribute bag.
    fn set_pref(&self, pref: &Preference) -> Result<(), RegistryError>;

    /// Derive the lifecycle state from the three ordered probes.
    /// First match wins; a guest no probe claims is `Unknown`.
    fn observed_state(&self) -> Result<VmState, RegistryError> {
        if self.is_paused()? {
            return Ok(VmState::Paused);
        }
        if self.is_running()? {
            return Ok(VmState::Running);
        }
        if self.is_halted()? {
            return Ok(VmState::Shutdown);
        }
        Ok(VmState::Unknown)
    }
}

/// The domain registry of the underlying virtualization manager.
///
/// Queried fresh on every read; the reconciler never caches guest state
/// across operations.
pub trait VmRegistry {
    /// All guests known to the registry, administrative domain included.
    fn list_handles(&self) -> Result<Vec<Box<dyn VmHandle + '_>>, RegistryError>;

    /// Look up one guest by name. Fails with `NotFound`.
    fn lookup(&self, name: &str) -> Result<Box<dyn VmHandle + '_>, RegistryError>;

    /// Define a new guest. Fails with `AlreadyExists` on a name collision.
    fn create_handle(&self, params: &CreateGuestParams)
        -> Result<Box<dyn VmHandle + '_>, RegistryError>;

    /// Remove a guest from the registry.
    fn delete_handle(&self, name: &str) -> Result<(), RegistryError>;

    /// Name of the registry's configured default network VM, if any.
    fn default_netvm(&self) -> Result<Option<String>, RegistryError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_error_display() {
        assert_eq!(
            RegistryError::NotFound("alpha".to_string()).to_string(),
            "guest not found: alpha"
        );
        assert!(RegistryError::Backend("qvm-ls exited 1".to_string())
            .to_string()
            .contains("qvm-ls"));
    }

    #[test]
    fn create_params_reject_empty_name() {
        let params = CreateGuestParams {
            name: String::new(),
            class: crate::vm::VmClass::AppVM,
            label: "red".to_string(),
            template: None,
        };
        assert!(params.validate().is_err());
    }
}

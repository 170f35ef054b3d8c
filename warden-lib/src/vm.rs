// SPDX-License-Identifier: GPL-2.0-only
use serde::{Deserialize, Serialize};

/// Observed guest lifecycle state.
///
/// Never stored authoritatively; always re-derived from the live probes
/// (`VmHandle::observed_state`). `Unknown` covers a guest none of the
/// probes claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    Running,
    Paused,
    Shutdown,
    Crashed,
    Unknown,
}

impl VmState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VmState::Running => "running",
            VmState::Paused => "paused",
            VmState::Shutdown => "shutdown",
            VmState::Crashed => "crashed",
            VmState::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for VmState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(VmState::Running),
            "paused" => Ok(VmState::Paused),
            // The admin tooling reports halted guests as "Halted".
            "shutdown" | "halted" => Ok(VmState::Shutdown),
            "crashed" => Ok(VmState::Crashed),
            _ => Err(format!("invalid VM state: '{s}'")),
        }
    }
}

/// Target of a declarative state request.
///
/// `Destroyed` is a forced power-off; `Undefine` additionally removes the
/// guest from the registry once it is observed down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DesiredState {
    Running,
    Paused,
    Shutdown,
    Destroyed,
    Undefine,
}

impl DesiredState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DesiredState::Running => "running",
            DesiredState::Paused => "paused",
            DesiredState::Shutdown => "shutdown",
            DesiredState::Destroyed => "destroyed",
            DesiredState::Undefine => "undefine",
        }
    }
}

impl std::fmt::Display for DesiredState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DesiredState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(DesiredState::Running),
            "paused" => Ok(DesiredState::Paused),
            "shutdown" => Ok(DesiredState::Shutdown),
            "destroyed" => Ok(DesiredState::Destroyed),
            "undefine" => Ok(DesiredState::Undefine),
            _ => Err(format!(
                "invalid desired state: '{s}' (expected: running, paused, shutdown, destroyed, undefine)"
            )),
        }
    }
}

/// Guest class. `AdminVM` marks the privileged administrative domain,
/// which read-only listings exclude.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VmClass {
    AppVM,
    TemplateVM,
    StandaloneVM,
    DispVM,
    AdminVM,
}

impl VmClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            VmClass::AppVM => "AppVM",
            VmClass::TemplateVM => "TemplateVM",
            VmClass::StandaloneVM => "StandaloneVM",
            VmClass::DispVM => "DispVM",
            VmClass::AdminVM => "AdminVM",
        }
    }
}

impl std::fmt::Display for VmClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for VmClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AppVM" => Ok(VmClass::AppVM),
            "TemplateVM" => Ok(VmClass::TemplateVM),
            "StandaloneVM" => Ok(VmClass::StandaloneVM),
            "DispVM" => Ok(VmClass::DispVM),
            "AdminVM" => Ok(VmClass::AdminVM),
            _ => Err(format!(
                "invalid VM class: '{s}' (expected: AppVM, TemplateVM, StandaloneVM, DispVM, AdminVM)"
            )),
        }
    }
}

/// How a create request names its network-providing VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetVmChoice {
    /// Use the registry's configured default network VM.
    Default,
    /// No network VM.
    None,
    /// A specific guest, which must exist.
    Named(String),
}

impl NetVmChoice {
    pub fn from_option(raw: Option<&str>) -> Self {
        match raw {
            None | Some("") => NetVmChoice::None,
            Some("default") => NetVmChoice::Default,
            Some(name) => NetVmChoice::Named(name.to_string()),
        }
    }
}

/// One row of the registry-wide `info` snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GuestInfo {
    pub state: VmState,
    pub provides_network: bool,
    pub label: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_roundtrip() {
        assert_eq!("running".parse::<VmState>().unwrap(), VmState::Running);
        assert_eq!("paused".parse::<VmState>().unwrap(), VmState::Paused);
        assert_eq!("shutdown".parse::<VmState>().unwrap(), VmState::Shutdown);
        assert_eq!("halted".parse::<VmState>().unwrap(), VmState::Shutdown);
        assert_eq!("crashed".parse::<VmState>().unwrap(), VmState::Crashed);
        assert!("bogus".parse::<VmState>().is_err());
    }

    #[test]
    fn unknown_is_not_parseable() {
        // "unknown" is derived, never supplied by a caller
        assert!("unknown".parse::<VmState>().is_err());
    }

    #[test]
    fn desired_state_roundtrip() {
        for s in ["running", "paused", "shutdown", "destroyed", "undefine"] {
            assert_eq!(s.parse::<DesiredState>().unwrap().as_str(), s);
        }
        assert!("present".parse::<DesiredState>().is_err());
    }

    #[test]
    fn class_roundtrip() {
        for c in ["AppVM", "TemplateVM", "StandaloneVM", "DispVM", "AdminVM"] {
            assert_eq!(c.parse::<VmClass>().unwrap().as_str(), c);
        }
        assert!("appvm".parse::<VmClass>().is_err());
    }

    #[test]
    fn netvm_choice_resolution() {
        assert_eq!(NetVmChoice::from_option(None), NetVmChoice::None);
        assert_eq!(NetVmChoice::from_option(Some("")), NetVmChoice::None);
        assert_eq!(NetVmChoice::from_option(Some("default")), NetVmChoice::Default);
        assert_eq!(
            NetVmChoice::from_option(Some("sys-firewall")),
            NetVmChoice::Named("sys-firewall".to_string())
        );
    }

    #[test]
    fn state_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&VmState::Shutdown).unwrap(), "\"shutdown\"");
    }
}

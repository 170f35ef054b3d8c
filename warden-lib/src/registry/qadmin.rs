// SPDX-License-Identifier: GPL-2.0-only
use crate::prefs::{PrefKey, PrefKind, PrefValue, Preference};
use crate::registry::traits::{CreateGuestParams, RegistryError, VmHandle, VmRegistry};
use crate::vm::{VmClass, VmState};
use std::process::Command;
use tracing::debug;

/// Registry backend over the `qvm-*` admin tools.
///
/// Deliberately thin: every method is one process invocation plus output
/// parsing. The admin tools are the external virtualization manager; their
/// calls are opaque, possibly slow, and possibly failing.
#[derive(Debug, Clone, Default)]
pub struct QadminRegistry;

impl QadminRegistry {
    pub fn new() -> Self {
        QadminRegistry
    }
}

fn run_tool(tool: &str, args: &[String]) -> Result<String, RegistryError> {
    run_tool_for(tool, args, None)
}

fn run_tool_for(tool: &str, args: &[String], guest: Option<&str>) -> Result<String, RegistryError> {
    debug!(%tool, ?args, "invoking admin tool");
    let output = Command::new(tool)
        .args(args)
        .output()
        .map_err(|e| RegistryError::Backend(format!("cannot run {tool}: {e}")))?;
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(classify_failure(tool, guest, &stderr, output.status.code()))
    }
}

/// Map an admin-tool failure onto the registry error taxonomy by its
/// diagnostic text. Anything unrecognized stays a backend error.
fn classify_failure(
    tool: &str,
    guest: Option<&str>,
    stderr: &str,
    code: Option<i32>,
) -> RegistryError {
    let diag = stderr.trim();
    let lowered = diag.to_lowercase();
    let name = guest.unwrap_or(diag).to_string();
    if lowered.contains("no such domain") || lowered.contains("does not exist") {
        return RegistryError::NotFound(name);
    }
    if lowered.contains("not started")
        || lowered.contains("not running")
        || lowered.contains("already stopped")
        || lowered.contains("powered off")
        || lowered.contains("is halted")
    {
        return RegistryError::NotStarted(name);
    }
    if lowered.contains("already exists") {
        return RegistryError::AlreadyExists(name);
    }
    match code {
        Some(code) if diag.is_empty() => {
            RegistryError::Backend(format!("{tool} exited with status {code}"))
        }
        _ => RegistryError::Backend(format!("{tool}: {diag}")),
    }
}

fn parse_name_list(raw: &str) -> Vec<String> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Admin-tool state words onto the derived-state enum. The tools report a
/// few transient states the core does not distinguish.
fn parse_state(raw: &str) -> VmState {
    match raw.trim().to_lowercase().as_str() {
        "running" | "transient" => VmState::Running,
        "paused" | "suspended" => VmState::Paused,
        "halted" => VmState::Shutdown,
        "crashed" => VmState::Crashed,
        _ => VmState::Unknown,
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim() {
        "True" => Some(true),
        "False" => Some(false),
        _ => None,
    }
}

fn format_value(value: &PrefValue) -> String {
    match value {
        PrefValue::Bool(true) => "True".to_string(),
        PrefValue::Bool(false) => "False".to_string(),
        PrefValue::Int(n) => n.to_string(),
        PrefValue::Str(s) => s.clone(),
    }
}

fn create_args(params: &CreateGuestParams) -> Vec<String> {
    let mut args = vec![
        "--class".to_string(),
        params.class.as_str().to_string(),
        "--label".to_string(),
        params.label.clone(),
    ];
    if let Some(template) = &params.template {
        args.push("--template".to_string());
        args.push(template.clone());
    }
    args.push("--".to_string());
    args.push(params.name.clone());
    args
}

fn guest_args(name: &str) -> Vec<String> {
    vec!["--".to_string(), name.to_string()]
}

impl VmRegistry for QadminRegistry {
    fn list_handles(&self) -> Result<Vec<Box<dyn VmHandle + '_>>, RegistryError> {
        let raw = run_tool("qvm-ls", &["--raw-list".to_string()])?;
        Ok(parse_name_list(&raw)
            .into_iter()
            .map(|name| Box::new(QadminHandle { name }) as Box<dyn VmHandle>)
            .collect())
    }

    fn lookup(&self, name: &str) -> Result<Box<dyn VmHandle + '_>, RegistryError> {
        let raw = run_tool("qvm-ls", &["--raw-list".to_string()])?;
        if parse_name_list(&raw).iter().any(|n| n == name) {
            Ok(Box::new(QadminHandle {
                name: name.to_string(),
            }))
        } else {
            Err(RegistryError::NotFound(name.to_string()))
        }
    }

    fn create_handle(
        &self,
        params: &CreateGuestParams,
    ) -> Result<Box<dyn VmHandle + '_>, RegistryError> {
        params.validate().map_err(RegistryError::Backend)?;
        run_tool_for("qvm-create", &create_args(params), Some(&params.name))?;
        Ok(Box::new(QadminHandle {
            name: params.name.clone(),
        }))
    }

    fn delete_handle(&self, name: &str) -> Result<(), RegistryError> {
        let mut args = vec!["--force".to_string()];
        args.extend(guest_args(name));
        run_tool_for("qvm-remove", &args, Some(name))?;
        Ok(())
    }

    fn default_netvm(&self) -> Result<Option<String>, RegistryError> {
        let raw = run_tool("qubes-prefs", &["default_netvm".to_string()])?;
        let name = raw.trim();
        if name.is_empty() || name == "None" {
            Ok(None)
        } else {
            Ok(Some(name.to_string()))
        }
    }
}

#[derive(Debug)]
struct QadminHandle {
    name: String,
}

impl QadminHandle {
    fn state(&self) -> Result<VmState, RegistryError> {
        let mut args = vec!["--raw-data".to_string(), "--fields".to_string(), "state".to_string()];
        args.extend(guest_args(&self.name));
        let raw = run_tool_for("qvm-ls", &args, Some(&self.name))?;
        Ok(parse_state(&raw))
    }

    fn lifecycle(&self, tool: &str) -> Result<(), RegistryError> {
        run_tool_for(tool, &guest_args(&self.name), Some(&self.name))?;
        Ok(())
    }
}

impl VmHandle for QadminHandle {
    fn name(&self) -> &str {
        &self.name
    }

    fn class(&self) -> Result<VmClass, RegistryError> {
        let mut args = vec!["--raw-data".to_string(), "--fields".to_string(), "class".to_string()];
        args.extend(guest_args(&self.name));
        let raw = run_tool_for("qvm-ls", &args, Some(&self.name))?;
        raw.trim()
            .parse()
            .map_err(|e: String| RegistryError::Backend(e))
    }

    fn is_paused(&self) -> Result<bool, RegistryError> {
        Ok(self.state()? == VmState::Paused)
    }

    fn is_running(&self) -> Result<bool, RegistryError> {
        Ok(self.state()? == VmState::Running)
    }

    fn is_halted(&self) -> Result<bool, RegistryError> {
        Ok(self.state()? == VmState::Shutdown)
    }

    // One tool invocation instead of three probe calls.
    fn observed_state(&self) -> Result<VmState, RegistryError> {
        self.state()
    }

    fn start(&self) -> Result<(), RegistryError> {
        self.lifecycle("qvm-start")
    }

    fn pause(&self) -> Result<(), RegistryError> {
        self.lifecycle("qvm-pause")
    }

    fn unpause(&self) -> Result<(), RegistryError> {
        self.lifecycle("qvm-unpause")
    }

    fn shutdown(&self) -> Result<(), RegistryError> {
        self.lifecycle("qvm-shutdown")
    }

    fn force_shutdown(&self) -> Result<(), RegistryError> {
        self.lifecycle("qvm-kill")
    }

    fn get_pref(&self, key: PrefKey) -> Result<PrefValue, RegistryError> {
        let mut args = guest_args(&self.name);
        args.push(key.as_str().to_string());
        let raw = run_tool_for("qvm-prefs", &args, Some(&self.name))?;
        let raw = raw.trim();
        match key.kind() {
            PrefKind::Bool => parse_bool(raw).map(PrefValue::Bool).ok_or_else(|| {
                RegistryError::Backend(format!(
                    "unexpected value for {}: '{raw}'",
                    key.as_str()
                ))
            }),
            PrefKind::Int => raw.parse::<u64>().map(PrefValue::Int).map_err(|_| {
                RegistryError::Backend(format!(
                    "unexpected value for {}: '{raw}'",
                    key.as_str()
                ))
            }),
            PrefKind::Str => Ok(PrefValue::Str(if raw == "None" {
                String::new()
            } else {
                raw.to_string()
            })),
        }
    }

    fn set_pref(&self, pref: &Preference) -> Result<(), RegistryError> {
        let mut args = guest_args(&self.name);
        args.push(pref.key.as_str().to_string());
        args.push(format_value(&pref.value));
        run_tool_for("qvm-prefs", &args, Some(&self.name))?;
        Ok(())
    }
}

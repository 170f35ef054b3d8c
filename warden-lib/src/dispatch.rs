// SPDX-License-Identifier: GPL-2.0-only
use crate::config::Config;
use crate::prefs::{self, Preference, ValidationError};
use crate::reconciler::{Detail, Outcome, ReconcileError, Reconciler};
use crate::registry::traits::CreateGuestParams;
use crate::vm::{DesiredState, GuestInfo, NetVmChoice, VmClass, VmState};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// One declarative task, as supplied by a caller or a YAML task file.
///
/// A task names a guest and carries either a desired `state`, an explicit
/// `command`, or a `preferences` map. Unset creation attributes fall back
/// to the configured defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TaskSpec {
    pub name: Option<String>,
    pub state: Option<String>,
    pub command: Option<String>,
    pub preferences: BTreeMap<String, serde_json::Value>,
    pub class: Option<String>,
    pub label: Option<String>,
    pub template: Option<String>,
    pub netvm: Option<String>,
    pub timeout_secs: Option<u64>,
}

/// Caller input errors, reported before anything runs.
#[derive(Debug)]
pub enum DispatchError {
    UnrecognizedCommand(String),
    UnrecognizedState(String),
    UnknownClass(String),
    /// The preferences map failed schema validation
    Validation(ValidationError),
    /// The command or state requires a guest name and none was given
    MissingGuest(&'static str),
    /// Neither state, command, nor preferences were supplied
    NothingToDo,
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchError::UnrecognizedCommand(cmd) => {
                write!(f, "command '{cmd}' not recognized")
            }
            DispatchError::UnrecognizedState(state) => {
                write!(f, "unrecognized state: '{state}'")
            }
            DispatchError::UnknownClass(class) => {
                write!(f, "invalid VM class: '{class}'")
            }
            DispatchError::Validation(e) => write!(f, "{e}"),
            DispatchError::MissingGuest(what) => {
                write!(f, "{what} requires a guest name")
            }
            DispatchError::NothingToDo => {
                write!(f, "expected state, command, or preferences to be specified")
            }
        }
    }
}

impl std::error::Error for DispatchError {}

impl From<ValidationError> for DispatchError {
    fn from(e: ValidationError) -> Self {
        DispatchError::Validation(e)
    }
}

/// Guest-scoped imperative commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestCommand {
    Destroy,
    Pause,
    Shutdown,
    Status,
    Start,
    Stop,
    Unpause,
}

/// Registry-scoped read commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostCommand {
    Info,
    ListVms,
    GetStates,
}

/// A fully resolved task. String inputs are parsed exactly once, here;
/// execution matches on these variants exhaustively.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    Preferences {
        prefs: Vec<Preference>,
        params: CreateGuestParams,
        netvm: NetVmChoice,
    },
    Transition {
        name: String,
        desired: DesiredState,
        timeout: Option<Duration>,
    },
    Ensure {
        params: CreateGuestParams,
        netvm: NetVmChoice,
    },
    Guest {
        name: String,
        command: GuestCommand,
    },
    Host {
        command: HostCommand,
        filter: Option<VmState>,
    },
}

impl TaskSpec {
    fn create_params(&self, config: &Config) -> Result<CreateGuestParams, DispatchError> {
        let name = self
            .name
            .clone()
            .ok_or(DispatchError::MissingGuest("guest operation"))?;
        let class_str = self
            .class
            .clone()
            .unwrap_or_else(|| config.defaults.class.clone());
        let class: VmClass = class_str
            .parse()
            .map_err(|_| DispatchError::UnknownClass(class_str))?;
        Ok(CreateGuestParams {
            name,
            class,
            label: self
                .label
                .clone()
                .unwrap_or_else(|| config.defaults.label.clone()),
            template: self.template.clone().or_else(|| config.defaults.template.clone()),
        })
    }

    fn netvm_choice(&self, config: &Config) -> NetVmChoice {
        let raw = self.netvm.as_deref().unwrap_or(&config.defaults.netvm);
        NetVmChoice::from_option(Some(raw))
    }

    /// Resolve the task into a directive.
    ///
    /// Precedence mirrors the caller contract: a preferences map wins (any
    /// accompanying state must still be recognized), then an explicit
    /// command, then a desired state.
    pub fn directive(&self, config: &Config) -> Result<Directive, DispatchError> {
        if !self.preferences.is_empty() {
            if let Some(state) = &self.state {
                state
                    .parse::<DesiredState>()
                    .map_err(|_| DispatchError::UnrecognizedState(state.clone()))?;
            }
            let prefs =
                prefs::parse_request(self.preferences.iter().map(|(k, v)| (k.as_str(), v)))?;
            return Ok(Directive::Preferences {
                prefs,
                params: self.create_params(config)?,
                netvm: self.netvm_choice(config),
            });
        }

        if let Some(command) = &self.command {
            return match command.as_str() {
                "info" => Ok(Directive::Host {
                    command: HostCommand::Info,
                    filter: None,
                }),
                "get_states" => Ok(Directive::Host {
                    command: HostCommand::GetStates,
                    filter: None,
                }),
                "list_vms" => {
                    let filter = match &self.state {
                        Some(state) => Some(state.parse::<VmState>().map_err(|_| {
                            DispatchError::UnrecognizedState(state.clone())
                        })?),
                        None => None,
                    };
                    Ok(Directive::Host {
                        command: HostCommand::ListVms,
                        filter,
                    })
                }
                "create" => Ok(Directive::Ensure {
                    params: self.create_params(config)?,
                    netvm: self.netvm_choice(config),
                }),
                other => {
                    let guest_command = match other {
                        "destroy" => GuestCommand::Destroy,
                        "pause" => GuestCommand::Pause,
                        "shutdown" => GuestCommand::Shutdown,
                        "status" => GuestCommand::Status,
                        "start" => GuestCommand::Start,
                        "stop" => GuestCommand::Stop,
                        "unpause" => GuestCommand::Unpause,
                        _ => return Err(DispatchError::UnrecognizedCommand(other.to_string())),
                    };
                    let name = self
                        .name
                        .clone()
                        .ok_or(DispatchError::MissingGuest("command"))?;
                    Ok(Directive::Guest {
                        name,
                        command: guest_command,
                    })
                }
            };
        }

        if let Some(state) = &self.state {
            let desired: DesiredState = state
                .parse()
                .map_err(|_| DispatchError::UnrecognizedState(state.clone()))?;
            let name = self
                .name
                .clone()
                .ok_or(DispatchError::MissingGuest("state change"))?;
            let timeout = self
                .timeout_secs
                .or(config.reconcile.undefine_timeout_secs)
                .map(Duration::from_secs);
            return Ok(Directive::Transition {
                name,
                desired,
                timeout,
            });
        }

        Err(DispatchError::NothingToDo)
    }
}

/// Failure classification for callers that map results to exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Guest name unresolvable
    NotFound,
    /// Caller input or validation failure; nothing was mutated
    Invalid,
    /// The external manager failed or a deadline expired
    External,
}

/// The structured result of one task. A failure never reports
/// `changed = true`.
#[derive(Debug, Serialize)]
pub struct Response {
    pub succeeded: bool,
    pub changed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<Detail>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<VmState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vms: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<BTreeMap<String, GuestInfo>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub states: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
}

impl Response {
    fn empty(succeeded: bool) -> Self {
        Response {
            succeeded,
            changed: false,
            detail: None,
            status: None,
            vms: None,
            info: None,
            states: None,
            error: None,
            failure_kind: None,
        }
    }

    fn from_outcome(outcome: Outcome) -> Self {
        Response {
            changed: outcome.changed,
            detail: Some(outcome.detail),
            ..Response::empty(true)
        }
    }

    fn from_reconcile_error(e: &ReconcileError) -> Self {
        let kind = match e {
            ReconcileError::NotFound(_) => FailureKind::NotFound,
            ReconcileError::Validation(_) => FailureKind::Invalid,
            ReconcileError::DeadlineExceeded(_) | ReconcileError::Registry(_) => {
                FailureKind::External
            }
        };
        Response {
            error: Some(e.to_string()),
            failure_kind: Some(kind),
            ..Response::empty(false)
        }
    }

    /// A task rejected before execution (caller input error).
    pub fn rejected(e: &DispatchError) -> Self {
        Response {
            error: Some(e.to_string()),
            failure_kind: Some(FailureKind::Invalid),
            ..Response::empty(false)
        }
    }
}

/// Execute one resolved directive against the reconciler.
pub fn run(recon: &Reconciler<'_>, directive: &Directive) -> Response {
    let result = match directive {
        Directive::Preferences {
            prefs,
            params,
            netvm,
        } => recon.apply_preferences(prefs, params, netvm),
        Directive::Transition {
            name,
            desired,
            timeout,
        } => {
            let deadline = timeout.map(|t| Instant::now() + t);
            recon.transition(name, *desired, deadline)
        }
        Directive::Ensure { params, netvm } => {
            // Create is idempotent: an existing guest is reported, not
            // re-created.
            return match recon.ensure_present(params, netvm) {
                Ok(outcome) => Response::from_outcome(outcome),
                Err(e) => Response::from_reconcile_error(&e),
            };
        }
        Directive::Guest { name, command } => match command {
            GuestCommand::Status => {
                return match recon.status(name) {
                    Ok(state) => Response {
                        status: Some(state),
                        ..Response::empty(true)
                    },
                    Err(e) => Response::from_reconcile_error(&e),
                }
            }
            GuestCommand::Destroy => recon.force_off(name),
            GuestCommand::Pause => recon.pause(name),
            GuestCommand::Shutdown | GuestCommand::Stop => recon.shutdown(name),
            GuestCommand::Start => recon.start(name),
            GuestCommand::Unpause => recon.unpause(name),
        },
        Directive::Host { command, filter } => {
            return match command {
                HostCommand::ListVms => match recon.list_vms(*filter) {
                    Ok(vms) => Response {
                        vms: Some(vms),
                        ..Response::empty(true)
                    },
                    Err(e) => Response::from_reconcile_error(&e),
                },
                HostCommand::Info => match recon.info() {
                    Ok(info) => Response {
                        info: Some(info),
                        ..Response::empty(true)
                    },
                    Err(e) => Response::from_reconcile_error(&e),
                },
                HostCommand::GetStates => match recon.get_states() {
                    Ok(states) => Response {
                        states: Some(states),
                        ..Response::empty(true)
                    },
                    Err(e) => Response::from_reconcile_error(&e),
                },
            };
        }
    };
    match result {
        Ok(outcome) => Response::from_outcome(outcome),
        Err(e) => Response::from_reconcile_error(&e),
    }
}

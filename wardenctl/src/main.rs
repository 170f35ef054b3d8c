// SPDX-License-Identifier: GPL-2.0-only
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info};
use warden_lib::config::{self, BackendKind, Config};
use warden_lib::dispatch::{self, FailureKind, Response, TaskSpec};
use warden_lib::prefs::{PrefKey, PrefKind};
use warden_lib::reconciler::Reconciler;
use warden_lib::registry::memory::MemoryRegistry;
use warden_lib::registry::qadmin::QadminRegistry;
use warden_lib::registry::traits::VmRegistry;

mod logging;

const EXIT_GENERAL_ERROR: u8 = 1;
const EXIT_BACKEND_FAILED: u8 = 3;
const EXIT_NOT_FOUND: u8 = 4;

#[derive(Parser)]
#[command(
    name = "wardenctl",
    about = "Declarative VM lifecycle reconciler",
    version
)]
struct Cli {
    /// Path to configuration file
    /// [default: $XDG_CONFIG_HOME/warden/warden.yaml]
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Registry backend (qadmin, memory)
    #[arg(long, global = true)]
    backend: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the guest if it does not exist
    Ensure {
        /// Guest name
        name: String,
        /// Guest class (AppVM, TemplateVM, StandaloneVM, DispVM)
        #[arg(long)]
        class: Option<String>,
        /// Guest label
        #[arg(long)]
        label: Option<String>,
        /// Template the guest is based on
        #[arg(long)]
        template: Option<String>,
        /// Network VM ("default", empty for none, or a guest name)
        #[arg(long)]
        netvm: Option<String>,
    },
    /// Converge the guest on a desired lifecycle state
    State {
        /// Guest name
        name: String,
        /// Desired state: running, paused, shutdown, destroyed, undefine
        state: String,
        /// Bound on the undefine wait, in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Apply declared preferences to the guest
    Prefs {
        /// Guest name
        name: String,
        /// Preference to declare, repeatable
        #[arg(long = "set", value_name = "KEY=VALUE")]
        set: Vec<String>,
        /// Guest class used if the guest must be created
        #[arg(long)]
        class: Option<String>,
        /// Label used if the guest must be created
        #[arg(long)]
        label: Option<String>,
        /// Template used if the guest must be created
        #[arg(long)]
        template: Option<String>,
        /// Network VM used if the guest must be created
        #[arg(long)]
        netvm: Option<String>,
    },
    /// Start a guest
    Start { name: String },
    /// Shut a guest down gracefully
    Stop { name: String },
    /// Pause a guest
    Pause { name: String },
    /// Resume a paused guest
    Unpause { name: String },
    /// Request a graceful shutdown
    Shutdown { name: String },
    /// Pull the virtual power
    Destroy { name: String },
    /// Report a guest's observed state
    Status { name: String },
    /// List guests, optionally filtered by observed state
    List {
        /// Observed state to filter on
        #[arg(long)]
        state: Option<String>,
    },
    /// Snapshot of every guest's state, networking, and label
    Info,
    /// "name state" lines for every domain
    States,
    /// Run every task in a YAML task file, in order
    Apply {
        /// Task file (a YAML list of tasks)
        file: PathBuf,
    },
    /// Print version information
    Version,
}

fn load_config(path: Option<PathBuf>) -> Result<Config, ExitCode> {
    let config_path = path.unwrap_or_else(config::default_config_path);
    match Config::load(&config_path) {
        Ok(config) => {
            info!(config_path = %config_path.display(), "loaded configuration");
            Ok(config)
        }
        Err(e) if e.is_not_found() => Ok(Config::default()),
        Err(e) => {
            error!(error = %e, path = %config_path.display(), "invalid configuration file");
            Err(ExitCode::from(EXIT_GENERAL_ERROR))
        }
    }
}

fn make_registry(kind: BackendKind) -> Box<dyn VmRegistry> {
    match kind {
        BackendKind::Qadmin => Box::new(QadminRegistry::new()),
        BackendKind::Memory => Box::new(MemoryRegistry::new()),
    }
}

/// Parse one `--set KEY=VALUE` argument. Values type according to the
/// preference schema, so `memory=512` becomes an integer while
/// `kernel=6.6` stays a string. A value that does not fit its key's type
/// is passed through as a string and rejected by validation.
fn parse_set_arg(raw: &str) -> Result<(String, serde_json::Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))?;
    let as_string = || serde_json::Value::String(value.to_string());
    let typed = match key.parse::<PrefKey>() {
        Ok(known) => match known.kind() {
            PrefKind::Bool => match value {
                "true" | "True" => serde_json::Value::Bool(true),
                "false" | "False" => serde_json::Value::Bool(false),
                _ => as_string(),
            },
            PrefKind::Int => value
                .parse::<u64>()
                .map(serde_json::Value::from)
                .unwrap_or_else(|_| as_string()),
            PrefKind::Str => as_string(),
        },
        // unknown keys still reach validation, which names them
        Err(_) => as_string(),
    };
    Ok((key.to_string(), typed))
}

fn execute(config: &Config, recon: &Reconciler<'_>, task: &TaskSpec) -> Response {
    match task.directive(config) {
        Ok(directive) => dispatch::run(recon, &directive),
        Err(e) => Response::rejected(&e),
    }
}

fn print_response(response: &Response) -> ExitCode {
    println!(
        "{}",
        serde_json::to_string_pretty(response).expect("response serialization")
    );
    exit_for(response)
}

fn exit_for(response: &Response) -> ExitCode {
    if response.succeeded {
        return ExitCode::SUCCESS;
    }
    match response.failure_kind {
        Some(FailureKind::NotFound) => ExitCode::from(EXIT_NOT_FOUND),
        Some(FailureKind::External) => ExitCode::from(EXIT_BACKEND_FAILED),
        _ => ExitCode::from(EXIT_GENERAL_ERROR),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    logging::init();

    if let Commands::Version = cli.command {
        println!("wardenctl {}", env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    }

    let config = match load_config(cli.config) {
        Ok(config) => config,
        Err(code) => return code,
    };

    let backend = match &cli.backend {
        Some(raw) => match raw.parse::<BackendKind>() {
            Ok(kind) => kind,
            Err(e) => {
                eprintln!("Error: {e}");
                return ExitCode::from(EXIT_GENERAL_ERROR);
            }
        },
        None => config.backend.kind,
    };
    let registry = make_registry(backend);
    let recon = Reconciler::new(&*registry)
        .with_poll_interval(Duration::from_millis(config.reconcile.poll_interval_ms));

    let task = match cli.command {
        Commands::Version => unreachable!("handled above"),
        Commands::Ensure { name, class, label, template, netvm } => TaskSpec {
            name: Some(name),
            command: Some("create".to_string()),
            class,
            label,
            template,
            netvm,
            ..TaskSpec::default()
        },
        Commands::State { name, state, timeout } => TaskSpec {
            name: Some(name),
            state: Some(state),
            timeout_secs: timeout,
            ..TaskSpec::default()
        },
        Commands::Prefs { name, set, class, label, template, netvm } => {
            let mut preferences = BTreeMap::new();
            for raw in &set {
                match parse_set_arg(raw) {
                    Ok((key, value)) => {
                        preferences.insert(key, value);
                    }
                    Err(e) => {
                        eprintln!("Error: {e}");
                        return ExitCode::from(EXIT_GENERAL_ERROR);
                    }
                }
            }
            TaskSpec {
                name: Some(name),
                preferences,
                class,
                label,
                template,
                netvm,
                ..TaskSpec::default()
            }
        }
        Commands::Start { name } => command_task(name, "start"),
        Commands::Stop { name } => command_task(name, "stop"),
        Commands::Pause { name } => command_task(name, "pause"),
        Commands::Unpause { name } => command_task(name, "unpause"),
        Commands::Shutdown { name } => command_task(name, "shutdown"),
        Commands::Destroy { name } => command_task(name, "destroy"),
        Commands::Status { name } => command_task(name, "status"),
        Commands::List { state } => TaskSpec {
            command: Some("list_vms".to_string()),
            state,
            ..TaskSpec::default()
        },
        Commands::Info => TaskSpec {
            command: Some("info".to_string()),
            ..TaskSpec::default()
        },
        Commands::States => TaskSpec {
            command: Some("get_states".to_string()),
            ..TaskSpec::default()
        },
        Commands::Apply { file } => {
            return apply_file(&config, &recon, &file);
        }
    };

    let response = execute(&config, &recon, &task);
    print_response(&response)
}

fn command_task(name: String, command: &str) -> TaskSpec {
    TaskSpec {
        name: Some(name),
        command: Some(command.to_string()),
        ..TaskSpec::default()
    }
}

/// Run every task in the file against one registry, in order, and print
/// the collected results. The exit code reflects the first failure.
fn apply_file(config: &Config, recon: &Reconciler<'_>, file: &PathBuf) -> ExitCode {
    let content = match std::fs::read_to_string(file) {
        Ok(content) => content,
        Err(e) => {
            eprintln!("Error: cannot read task file '{}': {e}", file.display());
            return ExitCode::from(EXIT_GENERAL_ERROR);
        }
    };
    let tasks: Vec<TaskSpec> = match serde_norway::from_str(&content) {
        Ok(tasks) => tasks,
        Err(e) => {
            eprintln!("Error: invalid task file '{}': {e}", file.display());
            return ExitCode::from(EXIT_GENERAL_ERROR);
        }
    };

    let mut responses = Vec::with_capacity(tasks.len());
    let mut exit = ExitCode::SUCCESS;
    let mut failed = false;
    for task in &tasks {
        let response = execute(config, recon, task);
        if !failed && !response.succeeded {
            exit = exit_for(&response);
            failed = true;
        }
        responses.push(response);
    }
    println!(
        "{}",
        serde_json::to_string_pretty(&responses).expect("response serialization")
    );
    exit
}

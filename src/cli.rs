use crate::config::presets::{get_preset, list_presets};
use crate::config::types::{
    ConnectionId, ExitClass, StreamType, SupervisorConfig, EXIT_INTERNAL_FAILURE,
};
use crate::events::file_monitor::FileEvent;
use crate::exec::builder::CommandBuilder;
use crate::exec::request::CommandResult;
use crate::io::redirector::{parse_mode, validate_mode_string};
use crate::resource::limits::ResourceLimitType;
use crate::runtime::security::path_validation;
use crate::supervisor::Supervisor;
use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Connection id used for everything the CLI does
const CLI_CONNECTION: ConnectionId = 1;

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON supervisor configuration; defaults apply to missing fields
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one command under supervision and print its result
    Run {
        /// Timeout in seconds
        #[arg(long, default_value_t = 30)]
        timeout: u64,
        /// Working directory
        #[arg(long)]
        cwd: Option<String>,
        /// Resource limit (format: TYPE=SOFT:HARD:ACTION)
        #[arg(long = "limit", value_name = "LIMIT")]
        limits: Vec<String>,
        /// Stdout redirection (format: MODE[:PATH])
        #[arg(long)]
        stdout: Option<String>,
        /// Data written to the command's stdin
        #[arg(long)]
        input: Option<String>,
        /// Security preset (default, restricted, trusted)
        #[arg(long, default_value = "trusted")]
        preset: String,
        /// Print the full result as JSON
        #[arg(long)]
        json: bool,
        /// Command and arguments to execute
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Print file events under a path
    Watch {
        path: String,
        /// Stop after this many seconds
        #[arg(long, default_value_t = 10)]
        seconds: u64,
    },
    /// Report whether a path is acceptable as a watch target and working directory
    CheckPath { path: String },
}

extern "C" fn signal_handler(_sig: i32) {
    // Only an atomic store: async-signal-safe
    INTERRUPTED.store(true, Ordering::SeqCst);
}

fn setup_signal_handlers() {
    // SAFETY: the handler only touches an atomic
    unsafe {
        libc::signal(libc::SIGTERM, signal_handler as usize);
        libc::signal(libc::SIGINT, signal_handler as usize);
    }
}

/// Parse arguments, run the subcommand and return the process status
pub fn run() -> Result<i32> {
    env_logger::init();
    setup_signal_handlers();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => SupervisorConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SupervisorConfig::default(),
    };

    match cli.command {
        Commands::Run {
            timeout,
            cwd,
            limits,
            stdout,
            input,
            preset,
            json,
            command,
        } => {
            let security = get_preset(&preset).ok_or_else(|| {
                anyhow!("unknown preset {} (expected one of {:?})", preset, list_presets())
            })?;
            let supervisor = Supervisor::init(config)?;
            supervisor.register_connection(CLI_CONNECTION);

            for limit in &limits {
                let (name, spec) = limit
                    .split_once('=')
                    .ok_or_else(|| anyhow!("limit must be TYPE=SOFT:HARD:ACTION, got {}", limit))?;
                let limit_type: ResourceLimitType = name.parse()?;
                supervisor
                    .resources()
                    .configure_limit_from_spec(CLI_CONNECTION, limit_type, spec)?;
            }
            if let Some(stdout) = &stdout {
                let (mode, path) = match stdout.split_once(':') {
                    Some((mode, path)) => (mode, Some(path)),
                    None => (stdout.as_str(), None),
                };
                if !validate_mode_string(mode) {
                    return Err(anyhow!("unknown redirect mode {}", mode));
                }
                let mode = parse_mode(mode);
                supervisor
                    .redirector()
                    .configure(CLI_CONNECTION, StreamType::Stdout, mode, path)?;
            }

            let (program, args) = command
                .split_first()
                .ok_or_else(|| anyhow!("missing command"))?;
            let mut builder = CommandBuilder::new(program.as_str())
                .connection(CLI_CONNECTION)
                .args(args.iter().cloned())
                .timeout(timeout)
                .security(security)
                .requester("procwarden-cli");
            if let Some(dir) = cwd {
                builder = builder.working_dir(dir);
            }
            if let Some(data) = input {
                builder = builder.input(data);
            }
            let request = builder.build();
            let request_id = request.request_id.clone();

            supervisor.executor().execute_sync(request);
            let result = supervisor.executor().get_result(&request_id);
            supervisor.shutdown();

            let Some(result) = result else {
                eprintln!("Command rejected; see log output for the reason");
                return Ok(exit_status(EXIT_INTERNAL_FAILURE));
            };
            print_result(&result, json)?;
            Ok(exit_status(result.exit_code))
        }
        Commands::Watch { path, seconds } => {
            let supervisor = Supervisor::init(config)?;
            let files = supervisor.require_files()?;
            supervisor.register_connection(CLI_CONNECTION);
            files.monitor().try_add_watch(CLI_CONNECTION, &path, 0)?;
            eprintln!("Watching {} for {}s", path, seconds);

            let deadline = Instant::now() + Duration::from_secs(seconds);
            while Instant::now() < deadline && !INTERRUPTED.load(Ordering::SeqCst) {
                files.process_file_events();
                for event in files.get_events(CLI_CONNECTION) {
                    print_file_event(&event);
                }
                std::thread::sleep(Duration::from_millis(100));
            }
            supervisor.cleanup_connection(CLI_CONNECTION);
            supervisor.shutdown();
            Ok(0)
        }
        Commands::CheckPath { path } => {
            let safe_prefixes = &config.files.safe_prefixes;
            let watch = path_validation::validate_watch_path(&path, safe_prefixes);
            let working_dir = path_validation::is_safe_working_dir(&path);
            match &watch {
                Ok(()) => println!("watch target: allowed"),
                Err(e) => println!("watch target: rejected ({})", e),
            }
            println!(
                "working directory: {}",
                if working_dir { "allowed" } else { "rejected" }
            );
            Ok(if watch.is_ok() && working_dir { 0 } else { 1 })
        }
    }
}

/// Map a supervisor exit code onto a shell status
fn exit_status(code: i32) -> i32 {
    match ExitClass::from_code(code) {
        ExitClass::Success => 0,
        ExitClass::Exited(c) => c & 0xff,
        ExitClass::Signaled(sig) => 128 + sig,
        ExitClass::Timeout => 124,
        ExitClass::InternalFailure | ExitClass::Pending | ExitClass::NotFound => 125,
    }
}

fn print_result(result: &CommandResult, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }
    print!("{}", result.stdout);
    eprint!("{}", result.stderr);
    if !result.success {
        eprintln!(
            "procwarden: {} (exit {}, {}ms)",
            result.error_message, result.exit_code, result.execution_time_ms
        );
    }
    Ok(())
}

fn print_file_event(event: &FileEvent) {
    let stamp = chrono::DateTime::<chrono::Local>::from(event.timestamp);
    println!(
        "{} {:<11} {}{}",
        stamp.format("%H:%M:%S%.3f"),
        event.event_type.as_str(),
        event.path,
        if event.is_directory { "/" } else { "" }
    );
}

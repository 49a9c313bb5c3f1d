//! protorun CLI Entry Point
//!
//! Runs a pipeline file as a protocol of a project. Running the same file
//! again resumes the stored protocol.
//!
//! # Usage
//!
//! ```bash
//! # Run (or resume) a pipeline in the current project
//! protorun pipeline.yaml
//!
//! # Use another project directory
//! protorun pipeline.yaml --project /data/analysis
//!
//! # Throw away previous results
//! protorun pipeline.yaml --restart
//!
//! # Approve the step waiting for review and go on
//! protorun pipeline.yaml --continue
//!
//! # Show the protocols stored in the project
//! protorun --list
//! ```

use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use colored::{ColoredString, Colorize};
use log::{error, info, warn};

use protorun::monitoring::{ChannelObserver, ExecutionTimeline, StepEvent};
use protorun::protocol::StopHandle;
use protorun::{
    EngineConfig, Node, PipelineProtocol, Project, Protocol, RunMode, StepStatus, APP_NAME,
    PIPELINE_CLASS, VERSION,
};

/// Default project directory.
const DEFAULT_PROJECT: &str = ".";

/// Interval for checking the stop file.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Command-line configuration parsed from arguments.
#[derive(Debug, Default)]
struct Config {
    pipeline_path: Option<String>,
    project_dir: Option<PathBuf>,
    restart: bool,
    continue_run: bool,
    threads: Option<usize>,
    mpi: Option<usize>,
    stop_file: Option<PathBuf>,
    list: bool,
    verbose: bool,
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME, VERSION);
    println!("Resumable Protocol Engine");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: protorun [OPTIONS] <PIPELINE_FILE>");
    println!();
    println!("Arguments:");
    println!("  <PIPELINE_FILE>     Path to pipeline YAML file");
    println!();
    println!("Options:");
    println!("  --project DIR       Project directory (default: current directory)");
    println!("  --restart           Discard previous results and run every step");
    println!("  --continue          Approve the waiting step and resume");
    println!("  --threads N         Threads per step");
    println!("  --mpi N             Processes per external program");
    println!("  --stop-file PATH    Stop between steps once PATH exists");
    println!("  --list              List the protocols of the project");
    println!("  --verbose           Enable debug logging");
    println!("  --help              Show this help message");
    println!("  --version           Show version information");
    println!();
    println!("Examples:");
    println!("  protorun pipeline.yaml");
    println!("  protorun pipeline.yaml --project /data/analysis --threads 8");
    println!("  protorun pipeline.yaml --continue");
}

/// Reads the value following an option.
fn option_value<'a>(args: &'a [String], i: &mut usize, option: &str) -> Result<&'a str, String> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{} requires an argument", option))
}

fn parse_count(value: &str, option: &str) -> Result<usize, String> {
    match value.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(format!("Invalid {} value: {}", option, value)),
    }
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--verbose" | "-v" => config.verbose = true,
            "--restart" => config.restart = true,
            "--continue" => config.continue_run = true,
            "--list" => config.list = true,
            "--project" => {
                config.project_dir = Some(PathBuf::from(option_value(args, &mut i, arg)?));
            }
            "--stop-file" => {
                config.stop_file = Some(PathBuf::from(option_value(args, &mut i, arg)?));
            }
            "--threads" => {
                config.threads = Some(parse_count(option_value(args, &mut i, arg)?, arg)?);
            }
            "--mpi" => {
                config.mpi = Some(parse_count(option_value(args, &mut i, arg)?, arg)?);
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                if config.pipeline_path.is_some() {
                    return Err(format!("Unexpected argument: {}", arg));
                }
                config.pipeline_path = Some(arg.clone());
            }
        }
        i += 1;
    }

    if config.restart && config.continue_run {
        return Err("--restart and --continue cannot be combined".to_string());
    }
    if !config.list && config.pipeline_path.is_none() {
        return Err("Missing pipeline file".to_string());
    }

    Ok(config)
}

fn colored_status(status: StepStatus) -> ColoredString {
    let text = status.as_str();
    match status {
        StepStatus::Finished => text.green(),
        StepStatus::Failed => text.red(),
        StepStatus::WaitingApproval => text.yellow(),
        StepStatus::Running => text.cyan(),
        StepStatus::Created => text.normal(),
    }
}

fn node_text<'a>(node: &'a Node, key: &str) -> &'a str {
    node.field(key).and_then(Node::as_str).unwrap_or("")
}

/// Prints the protocols stored in the project.
fn list_protocols(project: &Project) -> Result<(), Box<dyn std::error::Error>> {
    let protocols = project.find_protocols(PIPELINE_CLASS)?;
    if protocols.is_empty() {
        println!("No protocols in {}", project.path().display());
        return Ok(());
    }

    println!("{:>5}  {:24} {:10} {:25} {}", "ID", "NAME", "STATUS", "STARTED", "PIPELINE");
    for node in &protocols {
        let status = StepStatus::parse(node_text(node, "status")).unwrap_or(StepStatus::Created);
        println!(
            "{:>5}  {:24} {:10} {:25} {}",
            node.str_id(),
            node.name(),
            colored_status(status),
            node_text(node, "initTime"),
            node_text(node, "pipelineFile"),
        );
    }
    Ok(())
}

/// Latest stored protocol that was created from the same pipeline file.
fn find_existing(project: &Project, source: &Path) -> Result<Option<Node>, Box<dyn std::error::Error>> {
    let source = source.display().to_string();
    let found = project
        .find_protocols(PIPELINE_CLASS)?
        .into_iter()
        .filter(|node| node_text(node, "pipelineFile") == source)
        .last();
    Ok(found)
}

/// Requests a stop as soon as `path` exists, until `done` is set.
fn watch_stop_file(path: PathBuf, handle: StopHandle, done: Arc<AtomicBool>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        while !done.load(Ordering::SeqCst) {
            if path.exists() {
                warn!("Stop file found, stopping after the current step");
                handle.request_stop();
                return;
            }
            thread::sleep(STOP_POLL_INTERVAL);
        }
    })
}

fn report_event(event: &StepEvent) {
    let time = event.at.format("%H:%M:%S");
    match event.status {
        StepStatus::Running => println!("[{}] step {} {} ...", time, event.index, event.label.bold()),
        status => {
            let suffix = event
                .error
                .as_deref()
                .map(|e| format!(": {}", e))
                .unwrap_or_default();
            println!(
                "[{}] step {} {} {}{}",
                time,
                event.index,
                event.label.bold(),
                colored_status(status),
                suffix
            );
        }
    }
}

/// Prints the final status of a protocol and its steps.
fn print_summary(protocol: &Protocol<PipelineProtocol>) {
    println!();
    println!(
        "{} {}",
        protocol.run_name().bold(),
        colored_status(protocol.status())
    );
    println!("Working directory: {}", protocol.working_dir().display());
    for step in protocol.steps() {
        println!("  {:>3}. {:20} {}", step.index(), step.label(), colored_status(step.status()));
    }
    if let Some(message) = protocol.error_message() {
        println!();
        println!("{} {}", "Error:".red().bold(), message);
    }
    if protocol.status() == StepStatus::WaitingApproval {
        println!();
        println!("Review the results, then run again with --continue");
    }
}

/// Main application entry point.
fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(config.verbose);
    print_banner();

    let engine_config = EngineConfig::load_default();
    let project_dir = config
        .project_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_PROJECT));
    let mut project = Project::open(&project_dir, engine_config)?;
    info!("Project: {}", project.path().display());

    if config.list {
        return list_protocols(&project);
    }

    let Some(pipeline_path) = config.pipeline_path.as_deref() else {
        return Err("Missing pipeline file".into());
    };
    let kind = PipelineProtocol::from_file(pipeline_path).map_err(|e| {
        error!("Failed to load pipeline: {}", e);
        format!("Could not load pipeline from '{}': {}", pipeline_path, e)
    })?;
    info!("Pipeline loaded: {} steps", kind.pipeline().len());

    let threads = config.threads.or(kind.pipeline().threads);
    let mpi = config.mpi.or(kind.pipeline().mpi);

    let existing = find_existing(&project, kind.source())?;
    let mut protocol = match existing {
        Some(node) => {
            let id = node.id().ok_or("stored protocol without id")?;
            info!("Resuming protocol {}", node.name());
            project.load_protocol(kind, id)?
        }
        None if config.continue_run => {
            return Err(format!("No stored protocol for '{}' to continue", pipeline_path).into());
        }
        None => project.new_protocol(kind),
    };

    if let Some(threads) = threads {
        protocol.set_threads(project.config().cap_threads(threads));
    }
    if let Some(mpi) = mpi {
        protocol.set_processes(mpi);
    }
    protocol.set_mode(if config.restart { RunMode::Restart } else { RunMode::Resume });

    let timeline = ExecutionTimeline::shared();
    protocol.add_observer(Box::new(Arc::clone(&timeline)));

    let (observer, events) = ChannelObserver::channel();
    protocol.add_observer(Box::new(observer));
    let reporter = thread::spawn(move || {
        for event in events {
            report_event(&event);
        }
    });

    let done = Arc::new(AtomicBool::new(false));
    let watcher = config
        .stop_file
        .clone()
        .map(|path| watch_stop_file(path, protocol.stop_handle(), Arc::clone(&done)));

    let result = if config.continue_run {
        project.continue_protocol(&mut protocol)
    } else {
        project.launch_protocol(&mut protocol)
    };

    done.store(true, Ordering::SeqCst);
    if let Some(watcher) = watcher {
        let _ = watcher.join();
    }

    if let Ok(timeline) = timeline.lock() {
        print!("{}", timeline.gantt_chart());
    }
    print_summary(&protocol);

    // Dropping the protocol closes the event channel
    drop(protocol);
    let _ = reporter.join();

    result?;
    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("protorun")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_parse_defaults() {
        let config = parse_arguments(&args(&["pipeline.yaml"])).unwrap();
        assert_eq!(config.pipeline_path.as_deref(), Some("pipeline.yaml"));
        assert!(config.project_dir.is_none());
        assert!(!config.restart);
        assert!(config.threads.is_none());
    }

    #[test]
    fn test_parse_options() {
        let config = parse_arguments(&args(&[
            "p.yaml", "--project", "/data", "--threads", "4", "--mpi", "2", "--restart",
        ]))
        .unwrap();
        assert_eq!(config.project_dir, Some(PathBuf::from("/data")));
        assert_eq!(config.threads, Some(4));
        assert_eq!(config.mpi, Some(2));
        assert!(config.restart);
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_arguments(&args(&[])).is_err());
        assert!(parse_arguments(&args(&["p.yaml", "--threads", "0"])).is_err());
        assert!(parse_arguments(&args(&["p.yaml", "--mpi"])).is_err());
        assert!(parse_arguments(&args(&["p.yaml", "--bogus"])).is_err());
        assert!(parse_arguments(&args(&["p.yaml", "--restart", "--continue"])).is_err());
        assert!(parse_arguments(&args(&["a.yaml", "b.yaml"])).is_err());
    }

    #[test]
    fn test_list_needs_no_pipeline() {
        let config = parse_arguments(&args(&["--list"])).unwrap();
        assert!(config.list);
        assert!(config.pipeline_path.is_none());
    }
}

//! procwatch agent
//!
//! The entry point for pw-agent, handling:
//! - Running the monitoring agent as a foreground service
//! - Classifying exit codes offline
//! - Retention sweeps over the telemetry directory
//! - Printing the resolved configuration

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use pw_common::{AgentConfig, ConfigPaths, ConfigResolver, ConfigSnapshot, OutputFormat};
use pw_core::crash::{classify, classify_signal, Classification, ExitTaxonomy};
use pw_core::collect::Termination;
use pw_core::exit_codes::ExitCode;
use pw_core::logging::{init_logging, LogConfig, LogFormat, LogLevel};
use pw_core::supervisor::{Agent, AgentError, AgentStatus};
use pw_telemetry::{LogLayout, RetentionSweeper};
use serde::Serialize;
use tracing::{error, info, warn};

/// procwatch - crash, hang and resource monitoring for a single process
#[derive(Parser)]
#[command(name = "pw-agent")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    global: GlobalOpts,
}

/// Global options available to all commands
#[derive(Args, Debug)]
struct GlobalOpts {
    /// Config file (JSON or TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, short = 'f', global = true, default_value = "json")]
    format: OutputFormat,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Diagnostic log format
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    /// Append diagnostics to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Monitor a process until interrupted
    Run(RunArgs),

    /// Classify an exit code or signal
    Classify(ClassifyArgs),

    /// Delete telemetry files past the retention horizon
    Sweep(SweepArgs),

    /// Print the resolved configuration
    Config,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Target process name (overrides monitor.process_name)
    #[arg(long, short = 'p')]
    process: Option<String>,

    /// Telemetry directory (overrides monitor.log_dir)
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ClassifyArgs {
    /// Exit code (signed or raw DWORD) or signal number
    #[arg(allow_negative_numbers = true)]
    code: i64,

    /// Treat CODE as a signal number
    #[arg(long)]
    signal: bool,

    /// Exit status conventions; defaults to this platform's
    #[arg(long)]
    taxonomy: Option<TaxonomyArg>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TaxonomyArg {
    Windows,
    Unix,
}

impl From<TaxonomyArg> for ExitTaxonomy {
    fn from(arg: TaxonomyArg) -> Self {
        match arg {
            TaxonomyArg::Windows => ExitTaxonomy::Windows,
            TaxonomyArg::Unix => ExitTaxonomy::Unix,
        }
    }
}

#[derive(Args, Debug)]
struct SweepArgs {
    /// Report what would be deleted without deleting
    #[arg(long)]
    dry_run: bool,

    /// Telemetry directory (overrides monitor.log_dir)
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();

    let level = (cli.global.verbose > 0 || cli.global.quiet)
        .then(|| LogLevel::from_verbosity(cli.global.verbose, cli.global.quiet));
    let log_config =
        LogConfig::from_env(level, cli.global.log_format).with_file(cli.global.log_file.clone());
    if let Err(e) = init_logging(&log_config) {
        eprintln!("pw-agent: failed to initialize logging: {}", e);
        std::process::exit(ExitCode::IoError.as_i32());
    }

    let exit_code = match &cli.command {
        Commands::Run(args) => run_agent(&cli.global, args),
        Commands::Classify(args) => run_classify(&cli.global, args),
        Commands::Sweep(args) => run_sweep(&cli.global, args),
        Commands::Config => run_config(&cli.global),
    };
    std::process::exit(exit_code.as_i32());
}

// ============================================================================
// Helpers
// ============================================================================

fn load_config(global: &GlobalOpts) -> Result<(AgentConfig, ConfigSnapshot), ExitCode> {
    let resolver = ConfigResolver::new(ConfigPaths {
        config_path: global.config.clone(),
        config_dir: None,
    });
    resolver.load().map_err(|e| {
        error!(error = %e, "failed to load configuration");
        report_config_error(&e);
        ExitCode::ConfigError
    })
}

fn report_config_error(err: &pw_common::Error) {
    eprintln!("pw-agent: {}", err);
    eprintln!("hint: {}", err.remediation());
}

fn print_output<T: Serialize>(format: OutputFormat, value: &T, summary: impl FnOnce() -> String) {
    match format.render(value, summary) {
        Ok(text) => println!("{}", text),
        Err(e) => eprintln!("pw-agent: failed to render output: {}", e),
    }
}

// ============================================================================
// Commands
// ============================================================================

fn run_agent(global: &GlobalOpts, args: &RunArgs) -> ExitCode {
    let (mut config, snapshot) = match load_config(global) {
        Ok(loaded) => loaded,
        Err(code) => return code,
    };
    if let Some(process) = &args.process {
        config.monitor.process_name = process.clone();
    }
    if let Some(dir) = &args.log_dir {
        config.monitor.log_dir = Some(dir.clone());
    }
    if let Err(e) = config.validate_for_run() {
        report_config_error(&e);
        return ExitCode::ConfigError;
    }

    info!(
        config = %snapshot.describe(),
        hash = snapshot.hash.as_deref().unwrap_or("-"),
        process = %config.monitor.process_name,
        log_dir = %config.log_dir().display(),
        "configuration loaded"
    );

    let agent = match Agent::new(config) {
        Ok(agent) => Arc::new(agent.with_snapshot(snapshot)),
        Err(e) => {
            eprintln!("pw-agent: {}", e);
            return ExitCode::from(&e);
        }
    };

    {
        let agent = Arc::clone(&agent);
        if let Err(e) = ctrlc::set_handler(move || agent.request_stop()) {
            warn!(error = %e, "failed to install signal handler; Ctrl-C will not stop the agent cleanly");
        }
    }

    match agent.run_with_restarts() {
        Ok(status) => {
            print_output(global.format, &status, || status_summary(&status));
            if status.stats.entries_dropped > 0 || status.stats.write_errors > 0 {
                ExitCode::Degraded
            } else {
                ExitCode::Clean
            }
        }
        Err(AgentError::Config(e)) => {
            report_config_error(&e);
            ExitCode::ConfigError
        }
        Err(e) => {
            error!(error = %e, "agent exited with error");
            eprintln!("pw-agent: {}", e);
            ExitCode::from(&e)
        }
    }
}

fn status_summary(status: &AgentStatus) -> String {
    format!(
        "{}: written={} dropped={} write_errors={} rotated={} pruned={}",
        status.run_id,
        status.stats.entries_written,
        status.stats.entries_dropped,
        status.stats.write_errors,
        status.stats.files_rotated,
        status.stats.files_pruned,
    )
}

fn run_classify(global: &GlobalOpts, args: &ClassifyArgs) -> ExitCode {
    let classification: Classification = if args.signal {
        match i32::try_from(args.code) {
            Ok(signal) => classify_signal(signal),
            Err(_) => {
                eprintln!("pw-agent: signal {} out of range", args.code);
                return ExitCode::ArgsError;
            }
        }
    } else {
        let taxonomy = args.taxonomy.map(ExitTaxonomy::from).unwrap_or_else(ExitTaxonomy::native);
        classify(Termination::ExitCode(args.code), taxonomy)
    };

    print_output(global.format, &classification, || {
        format!("{}: {}", classification.kind, classification.description)
    });
    ExitCode::Clean
}

fn run_sweep(global: &GlobalOpts, args: &SweepArgs) -> ExitCode {
    let (mut config, _) = match load_config(global) {
        Ok(loaded) => loaded,
        Err(code) => return code,
    };
    if let Some(dir) = &args.log_dir {
        config.monitor.log_dir = Some(dir.clone());
    }

    let layout = LogLayout::new(config.log_dir(), config.logging.file_prefix.clone());
    let sweeper = RetentionSweeper::new(layout, config.retention());
    let result = if args.dry_run {
        sweeper.dry_run()
    } else {
        sweeper.sweep()
    };
    match result {
        Ok(report) => {
            print_output(global.format, &report, || {
                format!(
                    "scanned={} {}={} bytes={} failures={}",
                    report.scanned,
                    if args.dry_run { "would_delete" } else { "deleted" },
                    if args.dry_run { report.events.len() } else { report.deleted() },
                    report.events.iter().map(|e| e.size_bytes).sum::<u64>(),
                    report.failures,
                )
            });
            if report.failures > 0 {
                ExitCode::Degraded
            } else {
                ExitCode::Clean
            }
        }
        Err(e) => {
            eprintln!("pw-agent: {}", e);
            ExitCode::IoError
        }
    }
}

fn run_config(global: &GlobalOpts) -> ExitCode {
    let (config, snapshot) = match load_config(global) {
        Ok(loaded) => loaded,
        Err(code) => return code,
    };

    #[derive(Serialize)]
    struct Resolved<'a> {
        source: String,
        hash: Option<&'a str>,
        log_dir: PathBuf,
        config: &'a AgentConfig,
    }
    let resolved = Resolved {
        source: snapshot.describe(),
        hash: snapshot.hash.as_deref(),
        log_dir: config.log_dir(),
        config: &config,
    };
    print_output(global.format, &resolved, || {
        format!(
            "{}: process={:?} log_dir={}",
            resolved.source,
            config.monitor.process_name,
            resolved.log_dir.display()
        )
    });
    ExitCode::Clean
}

//! Converge CLI entrypoint.
//!
//! This is the main entrypoint for the converge command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use converge::cli::{Cli, Commands, OutputFormat, OutputFormatter, StateCommands};
use converge::config::{find_config_file, ConfigParser, ConfigValidator, ConvergeConfig, StateBackend};
use converge::error::Result;
use converge::graph::GraphBuilder;
use converge::planner::{ApplyReport, CancelSignal, ExecutionPlan};
use converge::provider::ProviderRegistry;
use converge::reconciler::Reconciler;
use converge::state::{generate_holder_id, LocalStateStore, MemoryStateStore, StateStore, STATE_DIR};

use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(cli.verbose, cli.log_format);

    // Run async runtime
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system. `RUST_LOG` takes precedence over the
/// verbosity flag.
fn init_logging(verbose: bool, format: OutputFormat) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        OutputFormat::Json => builder.json().init(),
        OutputFormat::Text => builder.init(),
    }
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<ExitCode> {
    let formatter = OutputFormatter::new(cli.output);
    let config_path = cli.config.as_ref();

    match cli.command {
        Commands::Validate { warnings } => cmd_validate(config_path, warnings, &formatter),
        Commands::Plan { out, detailed } => {
            cmd_plan(config_path, out.as_deref(), detailed, &formatter).await
        }
        Commands::Apply { plan, yes } => {
            cmd_apply(config_path, plan.as_deref(), yes, &formatter).await
        }
        Commands::Show { plan } => cmd_show(config_path, plan.as_deref(), &formatter).await,
        Commands::Destroy { yes } => cmd_destroy(config_path, yes, &formatter).await,
        Commands::Drift => cmd_drift(config_path, &formatter).await,
        Commands::State { command } => cmd_state(config_path, command, &formatter).await,
    }
}

/// Validate configuration and the resource graph.
fn cmd_validate(
    config_path: Option<&PathBuf>,
    show_warnings: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let (config, _) = load_config(config_path)?;
    let registry = ProviderRegistry::builtin();

    let result = ConfigValidator::new()
        .with_known_types(registry.types())
        .validate(&config)?;
    let graph = GraphBuilder::new().build(&config.resources)?;
    graph.topological_order()?;

    emit(&formatter.format_validation(&config, &result, show_warnings))?;
    Ok(ExitCode::SUCCESS)
}

/// Compute and display a plan, optionally saving it.
async fn cmd_plan(
    config_path: Option<&PathBuf>,
    out: Option<&Path>,
    detailed: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let (config, store) = load_config_and_state(config_path)?;
    let registry = ProviderRegistry::builtin();
    let reconciler = Reconciler::new(&config, store.as_ref(), &registry);

    let plan = reconciler.plan().await?;
    emit(&formatter.format_plan(&plan, detailed))?;

    if let Some(path) = out {
        plan.save(path)?;
        info!("Saved plan {} to {}", plan.id, path.display());
    }

    Ok(ExitCode::SUCCESS)
}

/// Apply a fresh or saved plan.
async fn cmd_apply(
    config_path: Option<&PathBuf>,
    plan_path: Option<&Path>,
    auto_approve: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let (config, store) = load_config_and_state(config_path)?;
    let registry = ProviderRegistry::builtin();
    let cancel = cancel_on_ctrl_c();
    let reconciler =
        Reconciler::new(&config, store.as_ref(), &registry).with_cancel_signal(cancel);

    let report = if let Some(path) = plan_path {
        // A saved plan was already reviewed when it was written.
        let plan = ExecutionPlan::load(path)?;
        emit(&formatter.format_plan(&plan, false))?;
        reconciler.apply_plan(&plan).await?
    } else if auto_approve {
        let (plan, report) = reconciler.apply().await?;
        emit(&formatter.format_plan(&plan, false))?;
        report
    } else {
        let preview = reconciler.plan().await?;
        emit(&formatter.format_plan(&preview, false))?;
        match Approval::for_plan(&preview) {
            Approval::NothingToDo => return Ok(ExitCode::SUCCESS),
            Approval::Ask if !confirm("Do you want to apply this plan? [y/N]: ", "y")? => {
                eprintln!("Apply cancelled.");
                return Ok(ExitCode::SUCCESS);
            }
            Approval::Ask | Approval::NotNeeded => {}
        }
        // Applying the previewed plan fails if anyone changed the state in
        // between, instead of silently applying something else.
        reconciler.apply_plan(&preview).await?
    };

    finish(&report, formatter)
}

/// Show a saved plan or the current state.
async fn cmd_show(
    config_path: Option<&PathBuf>,
    plan_path: Option<&Path>,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    if let Some(path) = plan_path {
        let plan = ExecutionPlan::load(path)?;
        emit(&formatter.format_plan(&plan, true))?;
        return Ok(ExitCode::SUCCESS);
    }

    let (config, store) = load_config_and_state(config_path)?;
    let key = config.state_key();
    let state = store.load(&key).await?;
    emit(&formatter.format_state(&key, &state))?;
    Ok(ExitCode::SUCCESS)
}

/// Destroy every stored resource.
async fn cmd_destroy(
    config_path: Option<&PathBuf>,
    auto_approve: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let (config, store) = load_config_and_state(config_path)?;
    let registry = ProviderRegistry::builtin();
    let cancel = cancel_on_ctrl_c();
    let reconciler =
        Reconciler::new(&config, store.as_ref(), &registry).with_cancel_signal(cancel);

    let preview = reconciler.destroy_plan().await?;
    if !preview.has_changes() {
        eprintln!("Nothing to destroy.");
        return Ok(ExitCode::SUCCESS);
    }
    emit(&formatter.format_plan(&preview, false))?;

    if !auto_approve
        && !confirm(
            "\nThis action is IRREVERSIBLE. Type 'destroy' to confirm: ",
            "destroy",
        )?
    {
        eprintln!("Destruction cancelled.");
        return Ok(ExitCode::SUCCESS);
    }

    let report = reconciler.apply_plan(&preview).await?;
    finish(&report, formatter)
}

/// Check for drift.
async fn cmd_drift(config_path: Option<&PathBuf>, formatter: &OutputFormatter) -> Result<ExitCode> {
    let (config, store) = load_config_and_state(config_path)?;
    let registry = ProviderRegistry::builtin();
    let reconciler = Reconciler::new(&config, store.as_ref(), &registry);

    let report = reconciler.detect_drift().await?;
    emit(&formatter.format_drift(&report))?;

    Ok(if report.has_drift() {
        ExitCode::from(2)
    } else {
        ExitCode::SUCCESS
    })
}

/// State management commands.
async fn cmd_state(
    config_path: Option<&PathBuf>,
    command: StateCommands,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let (config, store) = load_config_and_state(config_path)?;
    let key = config.state_key();

    match command {
        StateCommands::Show => {
            let state = store.load(&key).await?;
            emit(&formatter.format_state(&key, &state))?;
        }
        StateCommands::Lock { holder } => {
            let holder = holder.unwrap_or_else(generate_holder_id);
            let timeout = Duration::from_secs(config.state.lock_timeout_secs);
            let lock = store.acquire_lock(&key, &holder, timeout).await?;
            emit(&formatter.format_lock(Some(lock.info())))?;
        }
        StateCommands::Unlock { force } => {
            let info = store.lock_info(&key).await?;
            if info.is_none() {
                emit(&formatter.format_lock(None))?;
            } else if force {
                if store.force_unlock(&key).await? {
                    warn!("Forcefully removed the lock on {key}");
                }
                eprintln!("State forcefully unlocked.");
            } else {
                emit(&formatter.format_lock(info.as_ref()))?;
                eprintln!("Use --force to remove a lock held by someone else.");
                return Ok(ExitCode::FAILURE);
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// Helper Functions
// ============================================================================

/// What an interactive apply needs before running a previewed plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Approval {
    /// The plan is empty.
    NothingToDo,
    /// Only data sources are read; nothing outside the state changes.
    NotNeeded,
    /// The plan changes resources.
    Ask,
}

impl Approval {
    fn for_plan(plan: &ExecutionPlan) -> Self {
        if plan.is_empty() {
            Self::NothingToDo
        } else if plan.has_changes() {
            Self::Ask
        } else {
            Self::NotNeeded
        }
    }
}

/// Prints an apply report and maps its outcome to an exit code.
fn finish(report: &ApplyReport, formatter: &OutputFormatter) -> Result<ExitCode> {
    emit(&formatter.format_report(report))?;
    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Writes command output to stdout. Logs go to stderr.
fn emit(text: &str) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}", text.trim_end())?;
    Ok(())
}

/// Asks for confirmation on stderr.
fn confirm(prompt: &str, expected: &str) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case(expected))
}

/// Returns a signal that is raised on the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancelSignal {
    let cancel = CancelSignal::new();
    let signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight actions");
            signal.cancel();
        }
    });
    cancel
}

/// Resolves the configuration file path.
fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))
}

/// Loads and validates the configuration. Returns it with its directory.
fn load_config(config_path: Option<&PathBuf>) -> Result<(ConvergeConfig, PathBuf)> {
    let config_file = resolve_config_path(config_path)?;
    debug!("Loading configuration from: {}", config_file.display());

    let base = config_file
        .parent()
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    let parser = ConfigParser::new().with_base_path(&base);
    parser.load_dotenv()?;

    let config = parser.load_with_env(&config_file)?;
    Ok((config, base))
}

/// Loads configuration and creates the configured state store.
fn load_config_and_state(
    config_path: Option<&PathBuf>,
) -> Result<(ConvergeConfig, Box<dyn StateStore>)> {
    let (config, base) = load_config(config_path)?;

    ConfigValidator::new()
        .with_known_types(ProviderRegistry::builtin().types())
        .validate(&config)?;

    let store: Box<dyn StateStore> = match config.state.backend {
        StateBackend::Local => {
            let dir = config
                .state
                .path
                .as_ref()
                .map_or_else(|| base.join(STATE_DIR), PathBuf::from);
            Box::new(LocalStateStore::with_base_dir(dir))
        }
        StateBackend::Memory => {
            warn!("Using the in-memory state backend; state is discarded on exit");
            Box::new(MemoryStateStore::new())
        }
    };

    debug!("Using {} state backend", store.backend_type());
    Ok((config, store))
}

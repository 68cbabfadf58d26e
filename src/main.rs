use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use callmerge::config::{
    ConfigOverrides, EffectiveConfig, default_repo_config_yaml, load_effective_config,
    repo_config_path,
};
use callmerge::error::{ChangesError, ExportError, MergeError};
use callmerge::facts::FactBatch;
use callmerge::query::{export, load_snapshot, update_snapshot, write_snapshot};
use callmerge::store::{merge, with_locked_index};
use clap::{Args, Parser, Subcommand};
use serde_json::{Value, json};
use tracing::warn;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "CALLMERGE_LOG";

#[derive(Debug)]
struct CliError {
    code: &'static str,
    message: String,
}

impl CliError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn io(code: &'static str, err: io::Error) -> Self {
        Self::new(code, err.to_string())
    }
}

impl From<MergeError> for CliError {
    fn from(value: MergeError) -> Self {
        Self::new(value.code(), value.to_string())
    }
}

impl From<ExportError> for CliError {
    fn from(value: ExportError) -> Self {
        Self::new(value.code(), value.to_string())
    }
}

impl From<ChangesError> for CliError {
    fn from(value: ChangesError) -> Self {
        Self::new(value.code(), value.to_string())
    }
}

impl From<serde_json::Error> for CliError {
    fn from(value: serde_json::Error) -> Self {
        Self::new("json_error", value.to_string())
    }
}

#[derive(Parser, Debug)]
#[command(name = "callmerge")]
#[command(about = "Merges per-unit call graph facts into one shared store")]
struct Cli {
    /// Fact store path.
    #[arg(long, global = true)]
    database: Option<PathBuf>,
    /// Lock file path; defaults to `<database>.lock`.
    #[arg(long, global = true)]
    lock: Option<PathBuf>,
    /// Source root stripped from absolute unit paths.
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    /// Ignore call edges and their endpoints.
    #[arg(long, global = true)]
    no_callgraph: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Init,
    Merge(MergeArgs),
    Stats,
    Export(ExportArgs),
    /// Carries a snapshot forward across a source patch.
    Changes(ChangesArgs),
}

#[derive(Args, Debug)]
struct MergeArgs {
    /// Fact batch JSON file.
    file: Option<PathBuf>,
    #[arg(long)]
    stdin: bool,
    /// Exit non-zero when the merge fails.
    #[arg(long)]
    strict: bool,
}

#[derive(Args, Debug)]
struct ExportArgs {
    #[arg(long)]
    revision: String,
    #[arg(long)]
    output: PathBuf,
    #[arg(long)]
    compress: bool,
}

#[derive(Args, Debug)]
struct ChangesArgs {
    /// Snapshot compiled before the patch.
    #[arg(long)]
    before: PathBuf,
    /// Snapshot compiled after the patch.
    #[arg(long)]
    after: PathBuf,
    /// Unified diff between the two source trees.
    #[arg(long)]
    patch: PathBuf,
    /// Where to write the merged snapshot.
    #[arg(long)]
    output: Option<PathBuf>,
    #[arg(long, requires = "output")]
    compress: bool,
}

fn main() -> ExitCode {
    init_tracing();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let payload = json!({
                "error": {
                    "code": err.code,
                    "message": err.message,
                }
            });
            eprintln!("{payload}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    let cwd = std::env::current_dir().map_err(|err| CliError::io("cwd_error", err))?;
    let overrides = ConfigOverrides {
        database: cli.database,
        lock: cli.lock,
        root: cli.root,
        no_callgraph: cli.no_callgraph,
    };
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let config = load_effective_config(
        &cwd,
        home.as_deref(),
        |name| std::env::var(name).ok(),
        &overrides,
    )
    .map_err(|err| CliError::new("config_error", err.to_string()))?;

    match cli.command {
        Command::Init => cmd_init(&cwd, &config),
        Command::Merge(args) => cmd_merge(&config, args),
        Command::Stats => cmd_stats(&config),
        Command::Export(args) => cmd_export(&config, args),
        Command::Changes(args) => cmd_changes(args),
    }
}

fn cmd_init(cwd: &Path, config: &EffectiveConfig) -> Result<(), CliError> {
    with_locked_index(config, |_| Ok::<_, MergeError>(()))?;
    let repo_config = repo_config_path(cwd);
    let wrote_config = write_default_config(&repo_config)?;

    print_json(&json!({
        "status": "ok",
        "database": config.database,
        "lock": config.lock,
        "config": repo_config,
        "config_created": wrote_config,
        "callgraph": config.callgraph,
    }))
}

fn cmd_merge(config: &EffectiveConfig, args: MergeArgs) -> Result<(), CliError> {
    let input = match (&args.file, args.stdin) {
        (Some(_), true) => {
            return Err(CliError::new(
                "invalid_merge_args",
                "use either `callmerge merge <file>` or `callmerge merge --stdin`",
            ));
        }
        (Some(path), false) => {
            fs::read_to_string(path).map_err(|err| CliError::io("read_error", err))?
        }
        (None, true) => {
            let mut buf = String::new();
            io::stdin()
                .read_to_string(&mut buf)
                .map_err(|err| CliError::io("stdin_error", err))?;
            buf
        }
        (None, false) => {
            return Err(CliError::new(
                "missing_merge_input",
                "expected a fact batch file or --stdin",
            ));
        }
    };
    let batch = FactBatch::from_json(&input)
        .map_err(|err| CliError::new("invalid_batch", err.to_string()))?;

    match merge(config, &batch) {
        Ok(report) => print_json(&json!({
            "status": "ok",
            "report": report,
        })),
        // A failed merge loses this unit's facts but must not fail the build.
        Err(err) if !args.strict => {
            warn!(code = err.code(), error = %err, "merge failed, unit facts dropped");
            print_json(&json!({
                "status": "failed",
                "error": {
                    "code": err.code(),
                    "message": err.to_string(),
                }
            }))
        }
        Err(err) => Err(err.into()),
    }
}

fn cmd_stats(config: &EffectiveConfig) -> Result<(), CliError> {
    let counts = with_locked_index(config, |index| {
        index.relation_counts().map_err(MergeError::Transaction)
    })?;
    print_json(&json!({
        "database": config.database,
        "relations": counts,
    }))
}

fn cmd_export(config: &EffectiveConfig, args: ExportArgs) -> Result<(), CliError> {
    if args.revision.trim().is_empty() {
        return Err(CliError::new("invalid_revision", "revision must not be empty"));
    }
    let summary = export(config, &args.revision, &args.output, args.compress)?;
    print_json(&json!({
        "status": "ok",
        "export": summary,
    }))
}

fn cmd_changes(args: ChangesArgs) -> Result<(), CliError> {
    let before = load_snapshot(&args.before).map_err(ChangesError::from)?;
    let after = load_snapshot(&args.after).map_err(ChangesError::from)?;
    let patch = fs::read_to_string(&args.patch).map_err(ChangesError::from)?;
    let update = update_snapshot(&before, &after, &patch)?;

    let written = match &args.output {
        Some(output) => Some(
            write_snapshot(&update.snapshot, output, args.compress)
                .map_err(ChangesError::from)?,
        ),
        None => None,
    };
    print_json(&json!({
        "status": "ok",
        "revision": update.snapshot.revision,
        "definitions": update.snapshot.definitions.len(),
        "changes": update.changes,
        "output": args.output,
        "bytes": written,
    }))
}

fn write_default_config(config_path: &Path) -> Result<bool, CliError> {
    if config_path.exists() {
        return Ok(false);
    }
    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent).map_err(|err| CliError::io("mkdir_error", err))?;
    }
    fs::write(config_path, default_repo_config_yaml())
        .map_err(|err| CliError::io("write_error", err))?;
    Ok(true)
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string(value)?;
    println!("{rendered}");
    Ok(())
}

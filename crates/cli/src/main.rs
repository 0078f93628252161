//! accugit command-line conversion tool.
//!
//! Provides subcommands for running a conversion pass, tracking a depot
//! continuously, stitching the converted history, inspecting progress,
//! checking the usermap, and generating / validating configuration files.

mod track;

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use accugit_core::config::AppConfig;
use accugit_core::engine::ConversionEngine;

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// accugit command-line conversion tool.
#[derive(Parser, Debug)]
#[command(
    name = "accugit",
    version,
    about = "Convert an AccuRev depot into a Git repository"
)]
struct Cli {
    /// Path to the TOML configuration file. Defaults to the platform config
    /// directory, e.g. ~/.config/accugit/config.toml.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured log level.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one conversion pass: retrieve every stream, then process.
    Run {
        /// Remove all conversion state first and start over. Asks for
        /// confirmation by depot name.
        #[arg(long)]
        restart: bool,
    },

    /// Convert continuously, polling the depot on the configured interval.
    Track,

    /// Build the history stitch plan over the converted branches.
    Finalize {
        /// Apply the plan to the repository instead of only emitting it.
        #[arg(long)]
        apply: bool,

        /// Write the rewrite script (or JSON plan) to this path.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Emit the plan as JSON instead of a shell script.
        #[arg(long)]
        json: bool,
    },

    /// Show conversion progress from persisted state. Works offline.
    Status,

    /// List AccuRev principals in the configured range that have no
    /// usermap entry.
    Users,

    /// Generate a default configuration file.
    Init {
        /// Output path for the generated config file.
        #[arg(short, long, default_value = "./accugit.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file.
    Validate,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    match cli.command {
        Commands::Init { output } => {
            basic_logging();
            cmd_init(&output)
        }
        Commands::Validate => {
            basic_logging();
            cmd_validate(&config_path)
        }
        command => {
            let config = AppConfig::load_and_resolve(&config_path).with_context(|| {
                format!("failed to load configuration from {}", config_path.display())
            })?;
            let level = cli
                .log_level
                .as_deref()
                .unwrap_or(&config.conversion.log_level)
                .to_string();
            let _guard = init_logging(&level, config.conversion.log_file.as_deref());

            match command {
                Commands::Run { restart } => cmd_run(config, restart).await,
                Commands::Track => track::run_track(config).await,
                Commands::Finalize {
                    apply,
                    output,
                    json,
                } => cmd_finalize(config, apply, output.as_deref(), json),
                Commands::Status => cmd_status(config),
                Commands::Users => cmd_users(config).await,
                _ => unreachable!(),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Logging and config helpers
// ---------------------------------------------------------------------------

/// Minimal logging for commands that run before a config exists.
fn basic_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("warn"))
        .with_target(false)
        .without_time()
        .init();
}

/// Console logging at the configured level, duplicated into the log file
/// when one is configured. The returned guard flushes the file writer on
/// drop and must live for the rest of the program.
fn init_logging(
    level: &str,
    log_file: Option<&Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::new(level);
    let console = fmt::layer().with_target(false);
    match log_file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            let file = path
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_else(|| "accugit.log".into());
            let appender = tracing_appender::rolling::never(dir, file);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .init();
            None
        }
    }
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("accugit")
        .join("config.toml")
}

// ---------------------------------------------------------------------------
// Subcommand implementations
// ---------------------------------------------------------------------------

async fn cmd_run(config: AppConfig, restart: bool) -> Result<()> {
    let mut engine = ConversionEngine::new(config)?;

    if restart {
        confirm_restart(engine.depot_name())?;
        let deleted = engine.wipe()?;
        println!("Removed {} conversion ref(s).", deleted);
    }

    let plan = engine.prepare().await?;
    let streams = plan.streams.clone();
    let (start, end) = (plan.start, plan.end);
    println!(
        "Converting depot '{}', transactions {}..{}, {} stream(s)",
        engine.depot_name(),
        start,
        end,
        streams.len()
    );

    let bar = ProgressBar::new(streams.len() as u64);
    bar.set_style(
        ProgressStyle::with_template("{bar:30.cyan/blue} {pos}/{len} {msg}")
            .unwrap()
            .progress_chars("=> "),
    );
    for stream in &streams {
        bar.set_message(stream.name.clone());
        engine.retrieve_stream(stream).await?;
        bar.inc(1);
    }
    bar.finish_and_clear();

    let summary = engine.process()?;
    println!("{}", console::style("Conversion pass complete.").green());
    println!(
        "  Processed through transaction {}",
        summary.processed_through
    );
    println!(
        "  Branches: {}",
        summary
            .branches
            .values()
            .cloned()
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!();
    println!("Run 'accugit finalize' to stitch the branch histories together.");

    Ok(())
}

/// A restart throws away every converted branch and all resume state; make
/// the operator type the depot name before proceeding.
fn confirm_restart(depot: &str) -> Result<()> {
    println!(
        "This removes all conversion refs, notes, and mapped branches for depot '{}'.",
        depot
    );
    print!("Type the depot name to confirm: ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    if line.trim() != depot {
        bail!("confirmation did not match the depot name; nothing was removed");
    }
    Ok(())
}

fn cmd_finalize(
    config: AppConfig,
    apply: bool,
    output: Option<&Path>,
    json: bool,
) -> Result<()> {
    let engine = ConversionEngine::new(config)?;
    let plan = engine.finalize(apply)?;

    if plan.is_empty() {
        println!("Nothing to stitch; branch histories are already connected.");
        return Ok(());
    }

    let rendered = if json {
        serde_json::to_string_pretty(&plan).context("failed to encode stitch plan")?
    } else {
        plan.render_script()
    };
    match output {
        Some(path) => {
            std::fs::write(path, &rendered)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("Stitch plan written to {}", path.display());
        }
        None => print!("{}", rendered),
    }

    let summary = format!(
        "{} alias(es), {} graft(s), {} branch move(s)",
        plan.aliases.len(),
        plan.grafts.len(),
        plan.branch_moves.len()
    );
    if apply {
        eprintln!(
            "{}",
            console::style(format!("Applied: {}.", summary)).green()
        );
    } else {
        eprintln!(
            "Planned: {}. Re-run with --apply to rewrite the repository.",
            summary
        );
    }

    Ok(())
}

fn cmd_status(config: AppConfig) -> Result<()> {
    let engine = ConversionEngine::new(config)?;
    let report = engine.status()?;

    let checkpoint = match report.checkpoint {
        Some(checkpoint) => checkpoint,
        None => {
            println!("No conversion state found. Run 'accugit run' first.");
            return Ok(());
        }
    };

    println!();
    println!("{}", console::style("Conversion status").bold());
    println!();
    println!("  Depot number         : {}", checkpoint.depot);
    println!("  Processed through tx : {}", checkpoint.last_transaction);
    println!();

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Stream", "Branch", "Retrieved", "Tip"]);
    for stream in &report.streams {
        let retrieved = stream
            .high_water_mark
            .map(|hwm| hwm.to_string())
            .unwrap_or_else(|| "-".to_string());
        let tip = match &stream.tip {
            Some(tip) => Cell::new(short_oid(tip)).fg(comfy_table::Color::Green),
            None => Cell::new("no commits").fg(comfy_table::Color::Yellow),
        };
        table.add_row(vec![
            Cell::new(stream.stream_number),
            Cell::new(&stream.branch),
            Cell::new(retrieved),
            tip,
        ]);
    }
    println!("{table}");

    Ok(())
}

fn short_oid(oid: &str) -> String {
    oid.chars().take(10).collect()
}

async fn cmd_users(config: AppConfig) -> Result<()> {
    let engine = ConversionEngine::new(config)?;
    let missing = engine.unmapped_users().await?;

    if missing.is_empty() {
        println!("Every principal in the configured range has a usermap entry.");
        return Ok(());
    }

    println!("{} principal(s) without a usermap entry:", missing.len());
    for user in &missing {
        println!("  {}", user);
    }
    println!();
    println!("Commits by these principals get synthesized author identities.");
    println!("Add [[usermap]] entries to the configuration to control them.");

    Ok(())
}

fn cmd_init(output: &PathBuf) -> Result<()> {
    let default_config = r#"# accugit configuration
# See documentation for all available options.

[accurev]
depot = "MyDepot"
username = "converter"
password_env = "ACCUREV_PASSWORD"
start_transaction = 1
end_transaction = "highest"

[git]
repo_path = "/var/lib/accugit/MyDepot"
message_style = "normal"

[conversion]
method = "diff"
retry_attempts = 3
retry_delay_secs = 3
preserve_empty_dirs = true
log_level = "info"
# log_file = "/var/log/accugit/accugit.log"

[track]
interval_secs = 300

# Streams to convert. Leave this out to convert every non-workspace stream.
# [[streams]]
# stream = "MyDepot_int"
# branch = "main"

# [[usermap]]
# accurev_username = "jdoe"
# git_name = "Jane Doe"
# git_email = "jdoe@example.com"
# timezone = "+0100"
"#;

    if output.exists() {
        anyhow::bail!(
            "file already exists: {}. Use a different path or remove the existing file.",
            output.display()
        );
    }

    std::fs::write(output, default_config).context("failed to write config file")?;

    println!("Default configuration written to {}", output.display());
    println!();
    println!("Next steps:");
    println!("  1. Edit the config file with your AccuRev server and depot details");
    println!("  2. Set the referenced environment variable (ACCUREV_PASSWORD)");
    println!(
        "  3. Validate with: accugit validate --config {}",
        output.display()
    );
    println!(
        "  4. Start converting: accugit run --config {}",
        output.display()
    );

    Ok(())
}

fn cmd_validate(config_path: &Path) -> Result<()> {
    println!("Validating configuration: {}", config_path.display());
    println!();

    let config = AppConfig::load_from_file(config_path).context("failed to parse configuration")?;

    // Check structure
    println!("  [OK] TOML structure is valid");

    // Resolve env vars (non-fatal warnings)
    let mut config = config;
    let _ = config.resolve_env_vars();
    println!("  [OK] Environment variable references processed");

    // Validate values
    match config.validate() {
        Ok(()) => {
            println!("  [OK] All required fields are valid");
        }
        Err(e) => {
            println!("  [FAIL] Validation error: {}", e);
            anyhow::bail!("configuration validation failed");
        }
    }

    // Summary
    println!();
    println!("Configuration summary:");
    println!("  Depot          : {}", config.accurev.depot);
    println!("  Username       : {}", config.accurev.username);
    println!(
        "  Password       : {}",
        if config.accurev.password.is_some() {
            "set"
        } else {
            "NOT SET"
        }
    );
    println!("  Repository     : {}", config.git.repo_path.display());
    println!("  Method         : {}", config.conversion.method);
    println!(
        "  Transactions   : {}..{}",
        config.accurev.start_transaction, config.accurev.end_transaction
    );
    println!(
        "  Streams        : {}",
        if config.streams.is_empty() {
            "all non-workspace streams".to_string()
        } else {
            config.streams.len().to_string()
        }
    );
    println!("  Usermap entries: {}", config.usermap.len());
    println!("  Track interval : {}s", config.track.interval_secs);
    println!();
    println!("Configuration is valid.");

    Ok(())
}

//! BinForge CLI - build, inspect and decompose binary images
//!
//! Commands: build, layout, decompose, validate, get, eval
//! Outputs JSON to stdout, logs to stderr
//! Returns 2 on build, validation or decomposition failure

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use binforge_core::{BuildContext, BuildError, Engine, ProcessSigner, ToolMode, Value};

#[derive(Parser)]
#[command(name = "binforge-cli")]
#[command(about = "BinForge CLI - Declarative Binary Image Builder")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the declaration (JSON)
    #[arg(short, long)]
    declaration: PathBuf,

    /// Optional engine configuration (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Setting overrides applied before the command, as PATH=VALUE
    #[arg(short, long = "set", value_name = "PATH=VALUE")]
    overrides: Vec<String>,

    /// External program performing sign and verify operations
    #[arg(long, value_name = "PROGRAM")]
    signer: Option<PathBuf>,

    /// Argument passed to the signer program (repeatable)
    #[arg(long = "signer-arg", value_name = "ARG", allow_hyphen_values = true)]
    signer_args: Vec<String>,

    /// Log debug output to stderr
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the image
    Build {
        /// Output image path; without it the image is returned as base64
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Compute offsets and sizes only
    Layout,

    /// Recover settings from an existing image
    Decompose {
        /// Image to read
        #[arg(short, long)]
        image: PathBuf,
    },

    /// Check every constraint against the current settings
    Validate,

    /// Read a value or property, e.g. /settings/baud or /layout/crc.offset
    Get {
        path: String,
    },

    /// Evaluate a formula in the scope of the settings
    Eval {
        formula: String,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn parse_override(spec: &str) -> Result<(&str, Value), BuildError> {
    let (path, value) = spec
        .split_once('=')
        .ok_or_else(|| BuildError::parse("--set", format!("expected PATH=VALUE, got {spec:?}")))?;
    Ok((path.trim(), Value::Str(value.to_string())))
}

fn open(cli: &Cli) -> Result<Engine, BuildError> {
    let ctx = match &cli.config {
        Some(path) => BuildContext::load(path)?,
        None => BuildContext::default(),
    };
    let ctx = match cli.command {
        Commands::Decompose { .. } => ctx.with_mode(ToolMode::Decompose),
        _ => ctx,
    };
    let mut engine = Engine::from_path(&cli.declaration, ctx)?;
    if let Some(program) = &cli.signer {
        let signer = ProcessSigner::new(program, engine.ctx().external_timeout()).with_args(cli.signer_args.clone());
        engine = engine.with_crypto(Box::new(signer));
    }
    for spec in &cli.overrides {
        let (path, value) = parse_override(spec)?;
        engine.set(path, value)?;
    }
    Ok(engine)
}

fn print(value: &serde_json::Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(e) => eprintln!("failed to render output: {e}"),
    }
}

fn failure(error: &BuildError) -> ExitCode {
    print(&serde_json::json!({
        "success": false,
        "error": error.to_string(),
    }));
    ExitCode::from(2)
}

fn run(cli: &Cli) -> Result<ExitCode, BuildError> {
    let mut engine = open(cli)?;

    match &cli.command {
        Commands::Build { output: Some(output) } => {
            let built = engine.build_to(output)?;
            print(&serde_json::json!({
                "success": true,
                "output": output,
                "build": built,
            }));
        }

        Commands::Build { output: None } => {
            let built = engine.build()?;
            print(&serde_json::json!({
                "success": true,
                "image_base64": STANDARD.encode(&built.image),
                "build": built,
            }));
        }

        Commands::Layout => {
            let report = engine.build_layout()?;
            print(&serde_json::json!({
                "success": true,
                "layout": report,
                "map": binforge_core::build::byte_map(engine.tree()),
            }));
        }

        Commands::Decompose { image } => {
            let report = engine.decompose(Path::new(image))?;
            print(&serde_json::json!({
                "success": true,
                "decomposition": report,
                "settings": engine.settings()?,
            }));
        }

        Commands::Validate => {
            let result = engine.validate()?;
            print(&serde_json::to_value(&result)?);
            if !result.valid {
                return Ok(ExitCode::from(2));
            }
        }

        Commands::Get { path } => {
            let value = engine.get(path)?;
            print(&serde_json::json!({ "path": path, "value": value.to_string() }));
        }

        Commands::Eval { formula } => {
            let value = engine.evaluate(formula)?;
            print(&serde_json::json!({ "formula": formula, "value": value.to_string() }));
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(&cli) {
        Ok(code) => code,
        Err(e) => failure(&e),
    }
}

use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use layerdiff::config::Config;
use layerdiff::{DiffDriver, DirDriver, IdMappings, NaiveDiffDriver};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "layerdiff", about = "Diff, apply and size directory-backed layers", version)]
struct Cli {
    /// Configuration file (defaults to ./config.* when present)
    #[arg(long, global = true, env = "LAYERDIFF_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding the layers
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// UID mapping as container:host:size, repeatable
    #[arg(long = "uid-map", global = true, value_name = "C:H:S")]
    uid_maps: Vec<String>,

    /// GID mapping as container:host:size, repeatable
    #[arg(long = "gid-map", global = true, value_name = "C:H:S")]
    gid_maps: Vec<String>,

    /// Keep applying when file ownership cannot be changed
    #[arg(long, global = true)]
    ignore_chown_errors: bool,

    /// Log as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a layer, optionally as a copy of its parent
    Create(LayerArgs),
    /// Remove a layer
    Remove {
        id: String,
    },
    /// Print the changes between a layer and its parent
    Changes {
        #[command(flatten)]
        layer: LayerArgs,
        #[arg(long)]
        json: bool,
    },
    /// Write the diff between a layer and its parent as a tar archive
    Diff {
        #[command(flatten)]
        layer: LayerArgs,
        /// Output file, "-" for stdout
        #[arg(short, long, default_value = "-")]
        output: PathBuf,
    },
    /// Apply a tar archive onto a layer
    Apply {
        #[command(flatten)]
        layer: LayerArgs,
        /// Input file, "-" for stdin
        #[arg(short, long, default_value = "-")]
        input: PathBuf,
    },
    /// Print the size in bytes of the changes in a layer
    Size(LayerArgs),
}

#[derive(Args)]
struct LayerArgs {
    id: String,
    #[arg(long)]
    parent: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = load_config(&cli)?;
    run_command(cli, config)
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "layerdiff=info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr)).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer().with_writer(io::stderr)).init();
    }
}

/// Configuration file and environment, overridden by command line flags.
fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::load().context("Failed to load config")?,
    };

    if let Some(root) = &cli.root {
        config.driver.root = root.clone();
    }
    if !cli.uid_maps.is_empty() {
        config.idmap.uid_maps = cli.uid_maps.clone();
    }
    if !cli.gid_maps.is_empty() {
        config.idmap.gid_maps = cli.gid_maps.clone();
    }
    config.archive.ignore_chown_errors |= cli.ignore_chown_errors;
    Ok(config)
}

fn run_command(cli: Cli, config: Config) -> anyhow::Result<()> {
    let dir = Arc::new(
        DirDriver::new(&config.driver.root)
            .with_context(|| format!("Failed to open layer root {}", config.driver.root.display()))?,
    );
    let id_mappings: IdMappings = config.idmap.mappings().context("Invalid id mapping")?;
    let driver = NaiveDiffDriver::new(dir.clone(), id_mappings)
        .with_mount_label(config.driver.mount_label.clone())
        .with_ignore_chown_errors(config.archive.ignore_chown_errors);

    match cli.command {
        Command::Create(args) => {
            dir.create(&args.id, args.parent.as_deref())
                .with_context(|| format!("Failed to create layer {}", args.id))?;
        }
        Command::Remove { id } => {
            dir.remove(&id).with_context(|| format!("Failed to remove layer {}", id))?;
        }
        Command::Changes { layer, json } => {
            let changes = driver.changes(&layer.id, layer.parent.as_deref())?;
            let mut out = io::stdout().lock();
            if json {
                serde_json::to_writer_pretty(&mut out, &changes)?;
                writeln!(out)?;
            } else {
                for change in &changes {
                    writeln!(out, "{}", change)?;
                }
            }
        }
        Command::Diff { layer, output } => {
            let mut stream = driver.diff(&layer.id, layer.parent.as_deref())?;
            let mut out = open_output(&output)?;
            let copied = io::copy(&mut stream, &mut out).context("Failed to write diff");
            stream.close().context("Failed to finish diff")?;
            let written = copied?;
            out.flush()?;
            tracing::info!(layer = %layer.id, bytes = written, "Wrote diff");
        }
        Command::Apply { layer, input } => {
            let mut diff = open_input(&input)?;
            let size = driver.apply_diff(&layer.id, layer.parent.as_deref(), &mut diff)?;
            println!("{}", size);
        }
        Command::Size(layer) => {
            let size = driver.diff_size(&layer.id, layer.parent.as_deref())?;
            println!("{}", size);
        }
    }

    Ok(())
}

fn open_output(path: &Path) -> anyhow::Result<Box<dyn Write>> {
    if path.as_os_str() == "-" {
        return Ok(Box::new(BufWriter::new(io::stdout().lock())));
    }
    let file =
        File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    Ok(Box::new(BufWriter::new(file)))
}

fn open_input(path: &Path) -> anyhow::Result<Box<dyn Read>> {
    if path.as_os_str() == "-" {
        return Ok(Box::new(io::stdin().lock()));
    }
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    Ok(Box::new(file))
}

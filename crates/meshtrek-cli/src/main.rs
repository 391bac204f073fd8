//! MeshTrek - per-request latency breakdowns for service mesh proxies
//!
//! Correlates the fragment logs written by per-hop proxy probes into request
//! traces and reports where each request spent its time.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use meshtrek_core::codec::PackedStreamIds;
use meshtrek_core::config::{ConfigLoader, MeshtrekConfig};
use meshtrek_core::{pack_stream_ids, ScanMode, MESHTREK_VERSION};
use meshtrek_correlate::{EngineConfig, RunStats, Topology, TraceEngine, TraceSink};
use meshtrek_export::chunked::{ChunkedWriter, ChunkedWriterConfig};
use meshtrek_export::{rechunk_directory, report_directory, FlushSummary};
use serde_json::json;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "meshtrek")]
#[command(version)]
#[command(about = "Per-request latency breakdowns from service mesh proxy logs", long_about = None)]
struct Cli {
    /// Increase verbosity
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Output format for logs and command results
    #[arg(short, long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Path to configuration file
    #[arg(short, long, global = true, env = "MESHTREK_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Correlate a capture directory into span and metadata chunks
    Correlate {
        /// Directory holding one fragment log per service
        #[arg(short, long)]
        dir: PathBuf,

        /// Log file whose requests drive the run (name inside --dir or a path)
        #[arg(short, long)]
        entry: PathBuf,

        /// Output directory for chunks
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Layered service topology (JSON) for fan-out aware aggregation
        #[arg(long)]
        topology: Option<PathBuf>,

        /// Accepted hop count; repeat for several
        #[arg(short = 'l', long = "span-length")]
        span_lengths: Vec<usize>,

        /// Traces per output chunk
        #[arg(short, long)]
        batch_size: Option<usize>,

        /// How non-entry files are searched (indexed, rescan)
        #[arg(long)]
        scan_mode: Option<ScanMode>,

        /// Fraction of entry-file requests dropped at each end
        #[arg(long)]
        trim: Option<f64>,

        /// Abort on the first malformed line
        #[arg(long)]
        strict: bool,
    },

    /// Merge existing chunks and rewrite them in larger ones
    Rechunk {
        /// Directory holding spans_*.json and spans_meta_*.json
        #[arg(short, long)]
        dir: PathBuf,

        /// Output directory (default: same as --dir)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Entries per output file
        #[arg(short = 'n', long)]
        chunk_size: Option<usize>,
    },

    /// Request-time percentiles over a chunk set
    Report {
        /// Directory holding spans_meta_*.json
        #[arg(short, long)]
        dir: PathBuf,

        /// Hop counts to include; repeat for several (default: all)
        #[arg(short = 'l', long = "len")]
        lengths: Vec<usize>,
    },

    /// Pack plain stream ids the way HTTP/2 connection fragments carry them
    Pack {
        /// Up to 6 non-zero ids
        ids: Vec<u16>,
    },

    /// Unpack `Stream IDs` / `Extra Stream IDs` values
    Unpack {
        inline: u64,

        #[arg(default_value_t = 0)]
        overflow: u64,
    },

    /// Write the default configuration file
    Init {
        /// Destination (default: user config directory)
        #[arg(short, long)]
        path: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.clone());
    init_logging(cli.verbose, cli.format, &config.general.log_level)?;

    match cli.command {
        Commands::Correlate {
            dir,
            entry,
            output,
            topology,
            span_lengths,
            batch_size,
            scan_mode,
            trim,
            strict,
        } => {
            let run = merge_correlate_config(
                &config,
                CorrelateOverrides {
                    output,
                    topology,
                    span_lengths,
                    batch_size,
                    scan_mode,
                    trim,
                    strict,
                },
            )?;
            correlate_command(dir, entry, run, cli.format)
        }
        Commands::Rechunk {
            dir,
            output,
            chunk_size,
        } => {
            let output = output.unwrap_or_else(|| dir.clone());
            let chunk_size = chunk_size.unwrap_or(config.output.rechunk_size);
            let summary = rechunk_directory(&dir, &output, chunk_size)
                .with_context(|| format!("failed to re-chunk {}", dir.display()))?;
            match cli.format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
                OutputFormat::Text => {
                    println!("[spans] written {} files", summary.spans_files.len());
                    println!("[meta ] written {} files", summary.meta_files.len());
                }
            }
            Ok(())
        }
        Commands::Report { dir, lengths } => {
            let lengths = if lengths.is_empty() {
                config.correlation.required_span_lengths.clone()
            } else {
                lengths
            };
            let report = report_directory(&dir, &lengths)
                .with_context(|| format!("failed to read metadata under {}", dir.display()))?;
            match cli.format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
                OutputFormat::Text => {
                    println!(
                        "count={} p50={:.6} p99={:.6}",
                        report.count, report.p50, report.p99
                    );
                    println!(
                        "median share: wait={:.3} parse={:.3} filter={:.3} overhead={:.3}",
                        report.shares.wait,
                        report.shares.parse,
                        report.shares.filter,
                        report.shares.overhead
                    );
                }
            }
            Ok(())
        }
        Commands::Pack { ids } => {
            let packed = pack_stream_ids(&ids)?;
            match cli.format {
                OutputFormat::Json => println!(
                    "{}",
                    json!({"Stream IDs": packed.inline, "Extra Stream IDs": packed.overflow})
                ),
                OutputFormat::Text => {
                    println!("Stream IDs:       {}", packed.inline);
                    println!("Extra Stream IDs: {}", packed.overflow);
                }
            }
            Ok(())
        }
        Commands::Unpack { inline, overflow } => {
            let ids = PackedStreamIds::new(inline, overflow).unpack();
            match cli.format {
                OutputFormat::Json => println!("{}", json!(ids)),
                OutputFormat::Text => {
                    let ids: Vec<String> = ids.iter().map(u16::to_string).collect();
                    println!("{}", ids.join(" "));
                }
            }
            Ok(())
        }
        Commands::Init { path } => {
            let Some(path) = path.or_else(ConfigLoader::default_config_path) else {
                bail!("no user config directory, pass --path");
            };
            ConfigLoader::new().save(&MeshtrekConfig::default(), &path)?;
            println!("Wrote default configuration to {}", path.display());
            Ok(())
        }
    }
}

/// Install the tracing subscriber.
///
/// Precedence: `-v` count, then `RUST_LOG`, then the config file level.
fn init_logging(verbose: u8, format: OutputFormat, config_level: &str) -> anyhow::Result<()> {
    let filter = if verbose > 0 {
        let level = match verbose {
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        };
        EnvFilter::new(level.as_str().to_lowercase())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config_level))
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    let installed = match format {
        OutputFormat::Json => builder.json().try_init(),
        OutputFormat::Text => builder.try_init(),
    };
    installed.map_err(anyhow::Error::msg)
}

fn load_config(cli_path: Option<PathBuf>) -> MeshtrekConfig {
    let loader = ConfigLoader::new().with_cli_path(cli_path);
    match loader.load() {
        Ok(config) => config,
        Err(e) => {
            // The subscriber is not installed yet
            eprintln!("Failed to load configuration: {}, using defaults", e);
            MeshtrekConfig::default()
        }
    }
}

/// CLI values that override the config file for a correlate run
struct CorrelateOverrides {
    output: Option<PathBuf>,
    topology: Option<PathBuf>,
    span_lengths: Vec<usize>,
    batch_size: Option<usize>,
    scan_mode: Option<ScanMode>,
    trim: Option<f64>,
    strict: bool,
}

struct CorrelateRun {
    engine: EngineConfig,
    topology: Option<PathBuf>,
    writer: ChunkedWriterConfig,
}

/// Merge CLI arguments with config file settings.
/// CLI arguments take precedence when provided.
fn merge_correlate_config(
    config: &MeshtrekConfig,
    overrides: CorrelateOverrides,
) -> anyhow::Result<CorrelateRun> {
    let mut merged = config.clone();
    if !overrides.span_lengths.is_empty() {
        merged.correlation.required_span_lengths = overrides.span_lengths;
    }
    if let Some(mode) = overrides.scan_mode {
        merged.correlation.scan_mode = mode;
    }
    if let Some(trim) = overrides.trim {
        merged.correlation.trim_fraction = trim;
    }
    if overrides.strict {
        merged.correlation.strict_parse = true;
    }
    if let Some(size) = overrides.batch_size {
        merged.output.batch_size = size;
    }
    ConfigLoader::validate(&merged)?;

    let topology = overrides
        .topology
        .or_else(|| merged.topology.path.as_ref().map(PathBuf::from));
    let dir = overrides
        .output
        .unwrap_or_else(|| PathBuf::from(&merged.output.dir));

    Ok(CorrelateRun {
        engine: EngineConfig::from(&merged.correlation),
        topology,
        writer: ChunkedWriterConfig {
            dir,
            batch_size: merged.output.batch_size,
            pretty: true,
        },
    })
}

fn correlate_command(
    dir: PathBuf,
    entry: PathBuf,
    run: CorrelateRun,
    format: OutputFormat,
) -> anyhow::Result<()> {
    info!("MeshTrek {} correlating {}", MESHTREK_VERSION, dir.display());

    let topology = match &run.topology {
        Some(path) => Some(
            Topology::load(path)
                .with_context(|| format!("failed to load topology {}", path.display()))?,
        ),
        None => None,
    };
    let mut writer = ChunkedWriter::new(run.writer.clone())
        .with_context(|| format!("failed to prepare {}", run.writer.dir.display()))?;
    let mut engine = TraceEngine::new(run.engine, topology);
    let stats = engine
        .run_directory(&dir, &entry, &mut writer)
        .with_context(|| format!("failed to correlate {}", dir.display()))?;
    writer.finish()?;

    print_run(&stats, writer.summary(), format)
}

fn print_run(stats: &RunStats, summary: &FlushSummary, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({"stats": stats, "output": summary}))?
            );
        }
        OutputFormat::Text => {
            println!(
                "{} traces written, {} discarded, {} duplicate entries",
                summary.traces_written,
                stats.discarded_total(),
                stats.duplicate_entries
            );
            for (reason, count) in &stats.discarded {
                println!("  {:<30} {}", reason, count);
            }
            for file in &summary.files {
                println!("  {}", file.display());
            }
        }
    }
    Ok(())
}

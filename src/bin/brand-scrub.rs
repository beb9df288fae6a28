use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use brand_scrub::{
    default_output_path, default_sidecar_path, process_directory, CancelToken, ContrastVerifier,
    EditMode, JsonReportStore, PipelineConfig, ProcessResult, RemediationEngine, SidecarDetector,
    Status,
};

#[derive(Parser)]
#[command(
    name = "brand-scrub",
    about = "Remove or mask brand logos and lettering in product photos",
    version,
    after_help = "Simple usage: brand-scrub <image>  (reads <image stem>.detections.json)\n\n\
                  Detections are read from a JSON sidecar: either a detection result\n\
                  {\"brands\": [...], \"risk_score\": 80, \"regions\": [...]} or a bare region list."
)]
struct Cli {
    /// Input image file or directory
    input: String,

    /// Output file or directory (default: {name}_clean.{ext})
    #[arg(short, long)]
    output: Option<String>,

    /// Detection sidecar for a single input file
    #[arg(short, long)]
    detections: Option<String>,

    /// Pipeline configuration file (.toml or .json)
    #[arg(short, long)]
    config: Option<String>,

    /// Edit chain to use
    #[arg(short, long, value_enum)]
    mode: Option<EditMode>,

    /// Suspected brand (repeatable)
    #[arg(short, long = "brand")]
    brands: Vec<String>,

    /// Concurrent images in directory mode
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Write one JSON report per image into this directory
    #[arg(long)]
    report_dir: Option<String>,

    /// Give up on a run after this many seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Suppress all non-error output
    #[arg(short, long)]
    quiet: bool,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let mut config = match &cli.config {
        Some(path) => match PipelineConfig::load(Path::new(path)) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Error: {e}");
                process::exit(1);
            }
        },
        None => PipelineConfig::default(),
    };
    if let Some(mode) = cli.mode {
        config.mode = mode;
    }
    if let Some(jobs) = cli.jobs {
        config.concurrency = jobs;
    }
    // Sidecar coordinates only describe the upright image.
    config.multi_angle = false;
    if let Err(e) = config.validate() {
        eprintln!("Error: {e}");
        process::exit(1);
    }

    let input_path = Path::new(&cli.input);
    if !input_path.exists() {
        eprintln!("Error: Input path does not exist: {}", cli.input);
        process::exit(1);
    }

    let cancel = match cli.timeout {
        Some(secs) => CancelToken::with_timeout(Duration::from_secs(secs)),
        None => CancelToken::new(),
    };
    let brands: BTreeSet<String> = cli.brands.iter().cloned().collect();
    let report_dir = cli.report_dir.as_ref().map(PathBuf::from);

    let make_engine = |image_path: &Path, sidecar: Option<&Path>| {
        let sidecar = sidecar.map_or_else(|| default_sidecar_path(image_path), Path::to_path_buf);
        let detector = SidecarDetector::from_file(&sidecar).map_err(|e| {
            brand_scrub::Error::Config(format!("detections {}: {e}", sidecar.display()))
        })?;
        let verifier = ContrastVerifier::new(detector.clone(), config.acceptable_risk);
        let engine = RemediationEngine::new(config.clone(), detector, verifier)?;
        Ok::<_, brand_scrub::Error>(match &report_dir {
            Some(dir) => engine.with_persistence(JsonReportStore::new(dir.clone())),
            None => engine,
        })
    };

    if !cli.quiet {
        eprintln!("Mode: {:?}, padding: {:?}", config.mode, config.padding);
        eprintln!();
    }

    let results = if input_path.is_dir() {
        let output_dir = if let Some(o) = &cli.output {
            PathBuf::from(o)
        } else {
            eprintln!("Error: Output directory is required for batch processing");
            eprintln!("Usage: brand-scrub <input_dir> -o <output_dir>");
            process::exit(1);
        };
        if cli.detections.is_some() {
            eprintln!("Error: --detections applies to a single file; directories use sidecars");
            process::exit(1);
        }
        process_directory(
            input_path,
            &output_dir,
            config.concurrency,
            &brands,
            &cancel,
            |path| make_engine(path, None),
        )
    } else {
        let output_path = match &cli.output {
            Some(o) => PathBuf::from(o),
            None => default_output_path(input_path),
        };
        match make_engine(input_path, cli.detections.as_deref().map(Path::new)) {
            Ok(engine) => vec![engine.process_file(input_path, &output_path, &brands, &cancel)],
            Err(e) => {
                eprintln!("Error: {e}");
                process::exit(1);
            }
        }
    };

    let mut clean_count = 0u32;
    let mut masked_count = 0u32;
    let mut fail_count = 0u32;

    for r in &results {
        print_result(r, cli.verbose, cli.quiet);
        match r.status {
            Status::Clean => clean_count += 1,
            Status::Masked => masked_count += 1,
            Status::Failed => fail_count += 1,
        }
    }

    if results.len() > 1 && !cli.quiet {
        eprintln!();
        eprint!("[Summary] Clean: {clean_count}, Masked: {masked_count}");
        if fail_count > 0 {
            eprint!(", Failed: {fail_count}");
        }
        eprintln!(" (Total: {})", results.len());
    }

    if fail_count > 0 {
        process::exit(1);
    }
}

fn init_tracing(verbose: bool, quiet: bool) {
    let level = if verbose {
        "debug"
    } else if quiet {
        "error"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .init();
}

fn print_result(result: &ProcessResult, verbose: bool, quiet: bool) {
    if quiet && result.status != Status::Failed {
        return;
    }

    let filename = result.path.file_name().map_or_else(
        || result.path.display().to_string(),
        |f| f.to_string_lossy().to_string(),
    );

    match result.status {
        Status::Clean => eprintln!("[OK] {filename} (risk {:.0})", result.risk_score),
        Status::Masked => eprintln!("[MASKED] {filename} (risk {:.0})", result.risk_score),
        Status::Failed => eprintln!("[FAIL] {filename}: {}", result.message),
    }

    if verbose && !result.message.is_empty() {
        eprintln!("  -> {}", result.message);
    }
}

use clap::{Parser, Subcommand};
use eyre::{Result, WrapErr};
use std::fs;
use std::path::PathBuf;

use defectsim::random::{PolicySourceFactory, SeedPolicy, SourceFactory};
use defectsim::{Detector, DetectorConfig, LatencyRange};

#[derive(Parser)]
#[command(
    name = "defectsim",
    version,
    about = "Simulated steel surface defect classifier (no real image analysis)."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP upload service
    Serve {
        /// Address to bind to
        #[arg(long, env = "DEFECTSIM_BIND", default_value = "127.0.0.1:5000")]
        bind: String,

        /// Rate limit in requests per minute per IP (0 = no limit)
        #[arg(long, env = "DEFECTSIM_RATE_LIMIT", default_value_t = 60)]
        rate_limit: u32,

        /// Path for JSONL access log
        #[arg(long, env = "DEFECTSIM_ACCESS_LOG", default_value = "defectsim-access.jsonl")]
        access_log: String,

        /// Directory for preview thumbnails and the metrics snapshot
        #[arg(long, env = "DEFECTSIM_UPLOAD_DIR", default_value = defectsim::server::DEFAULT_UPLOAD_DIR)]
        upload_dir: PathBuf,

        /// Lower bound of the simulated inference delay, in seconds
        #[arg(long, env = "DEFECTSIM_MIN_LATENCY", default_value_t = LatencyRange::DEFAULT.min_secs())]
        min_latency: f64,

        /// Upper bound of the simulated inference delay, in seconds
        #[arg(long, env = "DEFECTSIM_MAX_LATENCY", default_value_t = LatencyRange::DEFAULT.max_secs())]
        max_latency: f64,

        /// Seeding: entropy, clock, or fixed:<u64>
        #[arg(long, env = "DEFECTSIM_SEED", default_value = "entropy", value_parser = parse_seed)]
        seed: SeedPolicy,
    },

    /// Classify one local file without starting the server
    Check {
        /// Path to an image file (png, jpg, jpeg, bmp, gif)
        #[arg(long)]
        input: PathBuf,

        /// Output format: json or summary
        #[arg(long, default_value = "summary")]
        format: String,

        /// Skip the simulated inference delay (otherwise 0.3s to 1.2s)
        #[arg(long)]
        no_latency: bool,

        /// Seeding: entropy, clock, or fixed:<u64>
        #[arg(long, default_value = "entropy", value_parser = parse_seed)]
        seed: SeedPolicy,
    },
}

fn parse_seed(s: &str) -> std::result::Result<SeedPolicy, String> {
    s.parse().map_err(|e: eyre::Report| e.to_string())
}

struct ServeArgs {
    bind: String,
    rate_limit: u32,
    access_log: String,
    upload_dir: PathBuf,
    latency: (f64, f64),
    seed: SeedPolicy,
}

fn cmd_serve(args: ServeArgs) -> Result<()> {
    use defectsim::server::{run_server, ServerConfig};

    let bind_addr = args
        .bind
        .parse()
        .wrap_err_with(|| format!("Invalid bind address: {}", args.bind))?;
    let latency = LatencyRange::new(args.latency.0, args.latency.1)?;

    let config = ServerConfig {
        bind_addr,
        rate_limit_rpm: args.rate_limit,
        access_log_path: args.access_log,
        upload_dir: args.upload_dir,
        detector: DetectorConfig {
            latency,
            seed_policy: args.seed,
        },
        ..Default::default()
    };

    eprintln!("Starting defectsim service...");
    eprintln!("Mode: simulation (predictions are not derived from image content)");
    eprintln!(
        "Latency: {:.2}s to {:.2}s, seed policy: {}",
        latency.min_secs(),
        latency.max_secs(),
        args.seed
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run_server(config))?;

    Ok(())
}

fn cmd_check(input: PathBuf, format: String, no_latency: bool, seed: SeedPolicy) -> Result<()> {
    let bytes = fs::read(&input).wrap_err_with(|| format!("reading {}", input.display()))?;
    let filename = input
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    let classification = defectsim::upload::classification_input(&filename, &bytes)?;
    let image = defectsim::preview::inspect(&bytes).ok().map(|(_, summary)| summary);

    let latency = if no_latency {
        LatencyRange::NONE
    } else {
        LatencyRange::MODEL_PROFILE
    };
    let detector = Detector::new(latency);
    let mut rng = PolicySourceFactory::new(seed).create();

    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(detector.detect(&classification, rng.as_mut(), None))?;

    match format.as_str() {
        "json" => {
            let data = defectsim::server::DetectionData::new(&result, image.as_ref());
            let out = serde_json::json!({ "success": true, "data": data });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        _ => {
            println!("Surface Defect Detection (simulated)");
            println!("====================================");
            println!("File:       {} ({} byte sample)", filename, result.input.byte_length);
            if let Some(img) = &image {
                println!(
                    "Image:      {}x{} {}",
                    img.width,
                    img.height,
                    img.format.as_deref().unwrap_or("unknown")
                );
            }
            println!();
            println!("Defect:     {}", result.predicted);
            println!("Confidence: {:.1}%", result.confidence * 100.0);
            match result.matched_keyword {
                Some(k) => println!("Reason:     filename keyword '{}'", k),
                None => println!("Reason:     no keyword matched; class drawn at random"),
            }
            println!("Time:       {:.3}s", result.processing_seconds);
            println!();
            println!("Probabilities:");
            for (class, p) in result.probabilities.iter() {
                println!("  {:<16} {:>5.1}%", class.short_name(), p * 100.0);
            }
        }
    }

    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Serve {
            bind,
            rate_limit,
            access_log,
            upload_dir,
            min_latency,
            max_latency,
            seed,
        } => cmd_serve(ServeArgs {
            bind,
            rate_limit,
            access_log,
            upload_dir,
            latency: (min_latency, max_latency),
            seed,
        }),
        Commands::Check {
            input,
            format,
            no_latency,
            seed,
        } => cmd_check(input, format, no_latency, seed),
    };

    if let Err(e) = result {
        eprintln!("Error: {e:?}");
        std::process::exit(1);
    }
}

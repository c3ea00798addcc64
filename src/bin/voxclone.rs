//! voxclone — voice-cloning TTS server and voice sample tooling.
//!
//! Usage:
//!   voxclone                                  # serve on 0.0.0.0:8000
//!   voxclone serve --port 9000 --voices-dir ./voices
//!   voxclone convert                          # MP3/M4A in ./voices → WAV
//!   voxclone convert --input andrew.mp3       # → ./voices/andrew.wav
//!   voxclone check                            # load the model and report
//!
//! Every flag also reads a `VOXCLONE_*` environment variable.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use voxclone::config::{
    ServerConfig, DEFAULT_HOST, DEFAULT_MAX_UPLOAD_BYTES, DEFAULT_PORT, DEFAULT_VOICES_DIR,
};
use voxclone::convert::{SamplePreparer, TARGET_SAMPLE_RATE};
use voxclone::engine::command::parse_args_template;
use voxclone::engine::{DEFAULT_MODEL, DEFAULT_PROGRAM};
use voxclone::registry::VoiceRegistry;
use voxclone::{http, VoiceError};

const DEFAULT_LOG_FILTER: &str = "voxclone=info,tower_http=info";

// ─────────────────────────────────────────────────────────────────────────────
// CLI
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "voxclone", version)]
#[command(about = "Self-hosted voice-cloning TTS server")]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    /// Log filter, e.g. `voxclone=debug` (defaults to RUST_LOG)
    #[arg(long, global = true, env = "VOXCLONE_LOG")]
    log: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP server (the default)
    Serve(ServeArgs),
    /// Convert voice samples to mono 22 050 Hz WAV
    Convert(ConvertArgs),
    /// Load the synthesis model and report whether it works
    Check(EngineArgs),
}

#[derive(Args, Debug, Clone)]
struct EngineArgs {
    /// Interpreter for the bundled XTTS runner, or the program run per
    /// request when --engine-args is given
    #[arg(long, default_value = DEFAULT_PROGRAM, env = "VOXCLONE_ENGINE")]
    engine: PathBuf,

    /// Model name passed to the synthesizer
    #[arg(long, default_value = DEFAULT_MODEL, env = "VOXCLONE_MODEL")]
    model: String,

    /// Run one process per request with this argument template instead of the
    /// persistent worker, e.g. "--text {text} --speaker_wav {speaker_wav} --out_path {out_path}"
    #[arg(long, env = "VOXCLONE_ENGINE_ARGS")]
    engine_args: Option<String>,

    /// Abort a synthesis call after this many seconds
    #[arg(long, env = "VOXCLONE_ENGINE_TIMEOUT_SECS")]
    engine_timeout_secs: Option<u64>,
}

#[derive(Args, Debug, Clone)]
struct ServeArgs {
    /// Host to bind to
    #[arg(long, default_value = DEFAULT_HOST, env = "VOXCLONE_HOST")]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT, env = "VOXCLONE_PORT")]
    port: u16,

    /// Directory of voice samples
    #[arg(long, default_value = DEFAULT_VOICES_DIR, env = "VOXCLONE_VOICES_DIR")]
    voices_dir: PathBuf,

    #[command(flatten)]
    engine: EngineArgs,

    /// Synthesis calls allowed to run at the same time
    #[arg(long, default_value_t = 1, env = "VOXCLONE_MAX_CONCURRENT")]
    max_concurrent: usize,

    /// Directory for temporary engine output
    #[arg(long, env = "VOXCLONE_TEMP_DIR")]
    temp_dir: Option<PathBuf>,

    /// Largest accepted request body
    #[arg(long, default_value_t = DEFAULT_MAX_UPLOAD_BYTES, env = "VOXCLONE_MAX_UPLOAD_BYTES")]
    max_upload_bytes: usize,

    /// Start serving before the model is loaded (it loads on the first request)
    #[arg(long)]
    no_warm_up: bool,
}

#[derive(Args, Debug)]
struct ConvertArgs {
    /// Directory of voice samples
    #[arg(long, default_value = DEFAULT_VOICES_DIR, env = "VOXCLONE_VOICES_DIR")]
    voices_dir: PathBuf,

    /// Convert a single file instead of the whole voices directory
    #[arg(long)]
    input: Option<PathBuf>,

    /// Output for --input (default: <voices-dir>/<stem>.wav)
    #[arg(long, requires = "input")]
    output: Option<PathBuf>,

    /// ffmpeg executable used to decode MP3 / M4A
    #[arg(long, default_value = "ffmpeg", env = "FFMPEG_PATH")]
    ffmpeg: PathBuf,

    /// Target sample rate
    #[arg(long, default_value_t = TARGET_SAMPLE_RATE)]
    sample_rate: u32,
}

impl EngineArgs {
    fn apply(&self, config: &mut ServerConfig) {
        config.engine_program = self.engine.clone();
        config.model = self.model.clone();
        config.engine_args = self.engine_args.as_deref().map(parse_args_template);
        config.engine_timeout = self.engine_timeout_secs.map(Duration::from_secs);
    }
}

impl ServeArgs {
    fn to_config(&self) -> ServerConfig {
        let mut config = ServerConfig {
            host: self.host.clone(),
            port: self.port,
            voices_dir: self.voices_dir.clone(),
            max_concurrent_synthesis: self.max_concurrent,
            temp_dir: self.temp_dir.clone(),
            max_upload_bytes: self.max_upload_bytes,
            ..ServerConfig::default()
        };
        self.engine.apply(&mut config);
        config
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────────────────────────

async fn serve(args: ServeArgs) -> Result<()> {
    let config = args.to_config();
    let engine = config.build_engine();

    if !args.no_warm_up {
        info!(model = %config.model, "loading synthesis model, this may take a few minutes on first run");
        engine
            .warm_up()
            .await
            .map_err(|e| VoiceError::StartupFailure(e.message))?;
        info!("synthesis engine ready");
    }

    let service = Arc::new(config.build_service(engine)?);
    let addr = config.bind_addr()?;
    let app = http::router(service.clone(), config.max_upload_bytes);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Cannot bind {}", addr))?;
    info!(
        voices_dir = %service.registry().dir().display(),
        voices = service.registry().list().len(),
        "listening on http://{}",
        addr
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;
    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("cannot listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("cannot listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown requested");
}

fn convert(args: ConvertArgs) -> Result<()> {
    let preparer = SamplePreparer::new(&args.ffmpeg, args.sample_rate);

    if let Some(input) = &args.input {
        let output = match &args.output {
            Some(output) => output.clone(),
            None => {
                let stem = input
                    .file_stem()
                    .with_context(|| format!("No file name in {}", input.display()))?;
                std::fs::create_dir_all(&args.voices_dir)
                    .with_context(|| format!("Cannot create {}", args.voices_dir.display()))?;
                args.voices_dir.join(format!("{}.wav", stem.to_string_lossy()))
            }
        };
        let report = preparer.prepare(input, &output)?;
        println!("Processing: {}", input.display());
        println!("  Original: {} Hz, {} channel(s)", report.source_rate, report.source_channels);
        if report.downmixed() {
            println!("  -> Converted to mono");
        }
        if report.resampled(preparer.target_rate()) {
            println!("  -> Resampled to {} Hz", preparer.target_rate());
        }
        println!("  -> Saved: {}", output.display());
        return Ok(());
    }

    let summary = preparer.convert_directory(&args.voices_dir)?;
    for path in &summary.converted {
        println!("[OK]   {}", path.display());
    }
    for path in &summary.skipped {
        println!("[SKIP] {} (WAV already exists)", path.display());
    }
    for (path, reason) in &summary.failed {
        println!("[FAIL] {}: {}", path.display(), reason);
    }
    println!(
        "\nConverted: {}, skipped: {}, failed: {}",
        summary.converted.len(),
        summary.skipped.len(),
        summary.failed.len()
    );

    let registry = VoiceRegistry::open(&args.voices_dir)?;
    println!("Voices: {:?}", registry.list());

    if !summary.failed.is_empty() {
        bail!("{} file(s) could not be converted", summary.failed.len());
    }
    Ok(())
}

async fn check(args: EngineArgs) -> Result<()> {
    let mut config = ServerConfig::default();
    args.apply(&mut config);
    let engine = config.build_engine();

    println!("Engine : {}", config.engine_program.display());
    println!("Model  : {}", engine.model_id());
    engine
        .warm_up()
        .await
        .map_err(|e| VoiceError::StartupFailure(e.message))?;
    println!("[OK] Synthesis engine is working");
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────

fn init_logging(filter: Option<&str>) {
    let filter = match filter {
        Some(f) => EnvFilter::new(f),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log.as_deref());

    match cli.command {
        Some(Commands::Serve(args)) => serve(args).await,
        Some(Commands::Convert(args)) => convert(args),
        Some(Commands::Check(args)) => check(args).await,
        None => serve(cli.serve).await,
    }
}

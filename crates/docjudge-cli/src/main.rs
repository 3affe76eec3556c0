use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;

use docjudge_core::backend::upstage::{UpstageBackend, UpstageModel};
use docjudge_core::cache::build_artifact_cache;
use docjudge_core::config::{
    STRATEGY_MUPDF_SPLIT, STRATEGY_MUPDF_TEXT, STRATEGY_UPSTAGE_DOCUMENT_PARSE,
    STRATEGY_UPSTAGE_OCR,
};
use docjudge_core::config_file;
use docjudge_core::judge::llm::LlmJudge;
use docjudge_core::llm::LlmClient;
use docjudge_core::refine::llm::LlmRefineAgent;
use docjudge_core::{
    ArtifactCache, CachedBackend, CachedJudge, Config, EventSink, ExtractionBackend, JudgeOracle,
    PipelineEvent, RefinePipeline, ReportSink, StageLimit, StrategyPipeline, discover_inputs,
    run_batch,
};
use docjudge_core::ConfigError;
use docjudge_pdf_mupdf::MupdfBackend;
use docjudge_reporting::ReportWriter;

mod output;

use output::ColorMode;

const DEFAULT_INPUT_DIR: &str = "data/input";
const LOG_FILE: &str = "docjudge.log";
const DEFAULT_CACHE_FILE: &str = "artifact_cache.db";

/// Document extraction judge - compare extraction strategies with an LLM judge and refine the winner
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the strategy and/or refine pipeline over a batch of documents
    Run(RunArgs),

    /// Empty the artifact cache
    ClearCache {
        /// Path to the SQLite artifact cache
        #[arg(long)]
        cache_path: Option<PathBuf>,

        /// Config file to read instead of the default locations
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Which pipeline to run
    #[arg(long, value_enum, default_value_t = Mode::Strategy)]
    mode: Mode,

    /// A single PDF or HWP document
    #[arg(long, conflicts_with = "input_dir")]
    input: Option<PathBuf>,

    /// Directory of documents (non-recursive)
    #[arg(long)]
    input_dir: Option<PathBuf>,

    /// Stop the strategy pipeline after this stage (extraction, validation, judge, all)
    #[arg(long)]
    stage: Option<StageLimit>,

    /// Comma-separated list of strategies to enable
    #[arg(long, value_delimiter = ',')]
    strategies: Vec<String>,

    /// Disable the artifact cache
    #[arg(long)]
    no_cache: bool,

    /// Path to the SQLite artifact cache
    #[arg(long)]
    cache_path: Option<PathBuf>,

    /// Directory for reports, tables and the log file
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Config file to read instead of the default locations
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of documents processed concurrently
    #[arg(long)]
    workers: Option<usize>,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Log at debug level
    #[arg(long)]
    debug: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Strategy,
    Refine,
    /// Strategy batch, then refine batch
    Both,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Run(args) => run(args).await,
        Command::ClearCache { cache_path, config } => clear_cache(cache_path, config),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            if e.downcast_ref::<ConfigError>().is_some() {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

/// Config file layer: `--config` when given (must exist), else the cascade.
fn load_file_layer(path: Option<&Path>) -> Result<config_file::ConfigFile, ConfigError> {
    match path {
        Some(path) => config_file::load_from_path(path)?.ok_or_else(|| ConfigError::File {
            path: path.to_path_buf(),
            message: "file not found".into(),
        }),
        None => Ok(config_file::load_config()),
    }
}

/// Resolve configuration: CLI flags > env vars > config file > defaults.
fn build_config(args: &RunArgs) -> Result<Config, ConfigError> {
    let mut config = Config::default();
    load_file_layer(args.config.as_deref())?.apply(&mut config)?;

    if let Ok(key) = std::env::var("SOLAR_API_KEY") {
        config.solar_api_key = Some(key);
    }
    if let Ok(base) = std::env::var("SOLAR_API_BASE") {
        config.llm.base_url = base;
    }

    if !args.strategies.is_empty() {
        config.strategies = args.strategies.clone();
    }
    if let Some(stage) = args.stage {
        config.stage_limit = stage;
    }
    if let Some(workers) = args.workers {
        config.num_workers = workers;
    }
    if let Some(dir) = &args.output_dir {
        config.output_dir = dir.clone();
    }
    if let Some(path) = &args.cache_path {
        config.cache_path = Some(path.clone());
    }
    if args.no_cache {
        config.use_cache = false;
    }
    if config.use_cache && config.cache_path.is_none() {
        config.cache_path = Some(config.output_dir.join(DEFAULT_CACHE_FILE));
    }

    for name in &config.strategies {
        if !is_known_strategy(name) {
            return Err(ConfigError::Invalid(format!("unknown strategy '{name}'")));
        }
    }
    config.validate()?;
    config.require_api_key()?;
    Ok(config)
}

fn is_known_strategy(name: &str) -> bool {
    [
        STRATEGY_UPSTAGE_DOCUMENT_PARSE,
        STRATEGY_UPSTAGE_OCR,
        STRATEGY_MUPDF_TEXT,
        STRATEGY_MUPDF_SPLIT,
    ]
    .contains(&name)
}

/// Log to stderr and to `docjudge.log` in the output directory.
fn init_tracing(debug: bool, output_dir: &Path) -> anyhow::Result<WorkerGuard> {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{EnvFilter, fmt};

    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("cannot create output directory {}", output_dir.display()))?;

    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let (file_writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(output_dir, LOG_FILE));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(fmt::layer().with_writer(file_writer).with_ansi(false))
        .init();
    Ok(guard)
}

fn build_backend(
    name: &str,
    config: &Config,
    http: &reqwest::Client,
    api_key: &str,
    cache: Option<&Arc<ArtifactCache>>,
) -> Result<Arc<dyn ExtractionBackend>, ConfigError> {
    let upstage = |model| {
        Arc::new(UpstageBackend::new(
            http.clone(),
            api_key,
            config.upstage_endpoint.clone(),
            model,
            config.extraction_timeout,
        )) as Arc<dyn ExtractionBackend>
    };
    let backend: Arc<dyn ExtractionBackend> = match name {
        STRATEGY_UPSTAGE_DOCUMENT_PARSE => upstage(UpstageModel::DocumentParse),
        STRATEGY_UPSTAGE_OCR => upstage(UpstageModel::Ocr),
        STRATEGY_MUPDF_TEXT => Arc::new(MupdfBackend::text()),
        STRATEGY_MUPDF_SPLIT => Arc::new(MupdfBackend::split(config.layout)),
        other => return Err(ConfigError::Invalid(format!("unknown strategy '{other}'"))),
    };
    Ok(match cache {
        Some(cache) => Arc::new(CachedBackend::new(backend, Arc::clone(cache))),
        None => backend,
    })
}

fn collect_inputs(args: &RunArgs) -> anyhow::Result<Vec<PathBuf>> {
    if let Some(file) = &args.input {
        anyhow::ensure!(file.is_file(), "input file not found: {}", file.display());
        return Ok(vec![file.clone()]);
    }
    let dir = args
        .input_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_INPUT_DIR));
    let inputs = discover_inputs(&dir)
        .with_context(|| format!("cannot list input directory {}", dir.display()))?;
    Ok(inputs)
}

fn progress_bar(total: usize, label: &str) -> anyhow::Result<ProgressBar> {
    let bar = ProgressBar::with_draw_target(Some(total as u64), ProgressDrawTarget::stdout());
    bar.set_style(
        ProgressStyle::with_template("{spinner:.green} {msg} [{bar:30.cyan/blue}] {pos}/{len} ({elapsed})")?
            .progress_chars("=>-"),
    );
    bar.set_message(label.to_string());
    Ok(bar)
}

/// Print each event above the bar; advance the bar as documents finish.
fn event_sink(bar: &ProgressBar, color: ColorMode) -> EventSink {
    let bar = bar.clone();
    Arc::new(move |event: PipelineEvent| {
        if let Some(line) = output::format_event(&event, color) {
            bar.println(line);
        }
        if matches!(event, PipelineEvent::DocumentFinished { .. }) {
            bar.inc(1);
        }
    })
}

async fn run(args: RunArgs) -> anyhow::Result<ExitCode> {
    let config = build_config(&args).context("invalid configuration")?;
    let _log_guard = init_tracing(args.debug, &config.output_dir)?;
    let color = ColorMode(!args.no_color);
    tracing::debug!(config = ?config, "configuration resolved");

    let inputs = collect_inputs(&args)?;
    let mut stdout = std::io::stdout();
    if inputs.is_empty() {
        writeln!(stdout, "No .pdf or .hwp documents found")?;
        return Ok(ExitCode::FAILURE);
    }
    tracing::info!(documents = inputs.len(), mode = ?args.mode, "starting batch");

    let config = Arc::new(config);
    let api_key = config.require_api_key()?.to_string();
    let http = reqwest::Client::builder()
        .build()
        .context("failed to build HTTP client")?;
    let llm = LlmClient::new(
        http.clone(),
        api_key.clone(),
        config.llm.clone(),
        config.llm_timeout,
    );
    let cache = config
        .use_cache
        .then(|| build_artifact_cache(config.cache_path.as_deref()));
    let writer = Arc::new(ReportWriter::new(&config.output_dir));
    writer.ensure_dirs()?;
    let sink: Arc<dyn ReportSink> = writer;

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted: finishing documents in flight");
            cancel_clone.cancel();
        }
    });

    let mut any_succeeded = false;

    if matches!(args.mode, Mode::Strategy | Mode::Both) {
        let backends = config
            .strategies
            .iter()
            .map(|name| build_backend(name, &config, &http, &api_key, cache.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        let mut judge: Arc<dyn JudgeOracle> =
            Arc::new(LlmJudge::new(llm.clone(), config.judge_temperature));
        if let Some(cache) = &cache {
            judge = Arc::new(CachedJudge::new(judge, Arc::clone(cache)));
        }

        let bar = progress_bar(inputs.len(), "strategy")?;
        let events = event_sink(&bar, color);
        let pipeline = StrategyPipeline::new(Arc::clone(&config), backends, judge)
            .context("failed to build strategy pipeline")?
            .with_report_sink(Arc::clone(&sink))
            .with_events(Arc::clone(&events));
        let outcome = run_batch(
            Arc::new(pipeline),
            inputs.clone(),
            config.num_workers,
            cancel.clone(),
            Some(events),
        )
        .await;
        bar.finish_and_clear();

        output::print_strategy_summary(&mut stdout, &outcome, color)?;
        any_succeeded |= outcome.any_succeeded();
    }

    if matches!(args.mode, Mode::Refine | Mode::Both) && !cancel.is_cancelled() {
        let strategy = config
            .refine_strategy()
            .ok_or_else(|| ConfigError::Invalid("no refine strategy configured".into()))?;
        let backend = build_backend(strategy, &config, &http, &api_key, cache.as_ref())?;
        let agent = Arc::new(LlmRefineAgent::new(
            llm.clone(),
            config.refine.validation_temperature,
            config.refine.refine_temperature,
        ));

        let bar = progress_bar(inputs.len(), "refine")?;
        let events = event_sink(&bar, color);
        let pipeline = RefinePipeline::new(Arc::clone(&config), &[backend], agent)
            .context("failed to build refine pipeline")?
            .with_report_sink(Arc::clone(&sink))
            .with_events(Arc::clone(&events));
        let outcome = run_batch(
            Arc::new(pipeline),
            inputs.clone(),
            config.num_workers,
            cancel.clone(),
            Some(events),
        )
        .await;
        bar.finish_and_clear();

        output::print_refine_summary(&mut stdout, &outcome, color)?;
        any_succeeded |= outcome.any_succeeded();
    }

    if let Some(cache) = &cache {
        tracing::debug!(hits = cache.hits(), misses = cache.misses(), "artifact cache stats");
    }
    output::print_output_locations(&mut stdout, &config.output_dir, color)?;

    Ok(if any_succeeded {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn clear_cache(cache_path: Option<PathBuf>, config: Option<PathBuf>) -> anyhow::Result<ExitCode> {
    let path = match cache_path {
        Some(path) => path,
        None => {
            let mut resolved = Config::default();
            load_file_layer(config.as_deref())?.apply(&mut resolved)?;
            resolved
                .cache_path
                .unwrap_or_else(|| resolved.output_dir.join(DEFAULT_CACHE_FILE))
        }
    };

    if !path.exists() {
        println!("No artifact cache at {}", path.display());
        return Ok(ExitCode::SUCCESS);
    }
    let cache = ArtifactCache::open(&path)
        .map_err(|e| anyhow::anyhow!(e))
        .with_context(|| format!("cannot open artifact cache {}", path.display()))?;
    let entries = cache.disk_len();
    cache.clear();
    println!(
        "Cleared {} cached artifacts from {}",
        entries,
        path.display()
    );
    Ok(ExitCode::SUCCESS)
}

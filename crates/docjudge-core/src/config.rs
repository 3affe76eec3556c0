use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::ConfigError;
use crate::backend::upstage::DEFAULT_ENDPOINT;
use crate::fallback::FallbackConfig;
use crate::layout::LayoutConfig;
use crate::llm::LlmConfig;
use crate::pipeline::StageLimit;
use crate::quality::QualityAggregator;
use crate::refine::RefineConfig;
use crate::selection::SelectionConfig;

pub const STRATEGY_UPSTAGE_DOCUMENT_PARSE: &str = "upstage_document_parse";
pub const STRATEGY_UPSTAGE_OCR: &str = "upstage_ocr";
pub const STRATEGY_MUPDF_TEXT: &str = "mupdf_text";
pub const STRATEGY_MUPDF_SPLIT: &str = "mupdf_split";

const WEIGHT_TOLERANCE: f64 = 1e-6;

/// Run configuration. Built once at startup and shared read-only.
#[derive(Clone)]
pub struct Config {
    pub solar_api_key: Option<String>,
    pub llm: LlmConfig,
    pub judge_temperature: f32,
    pub upstage_endpoint: String,
    /// Enabled strategies, in the order they are recorded and judged.
    pub strategies: Vec<String>,
    /// USD per page, by strategy.
    pub pricing: BTreeMap<String, f64>,
    pub quality: QualityAggregator,
    pub fallback: FallbackConfig,
    pub selection: SelectionConfig,
    pub layout: LayoutConfig,
    pub refine: RefineConfig,
    pub extraction_timeout: Duration,
    pub llm_timeout: Duration,
    pub num_workers: usize,
    pub stage_limit: StageLimit,
    /// Path to the persistent SQLite artifact cache (optional).
    pub cache_path: Option<PathBuf>,
    pub use_cache: bool,
    pub output_dir: PathBuf,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("solar_api_key", &self.solar_api_key.as_ref().map(|_| "***"))
            .field("llm", &self.llm)
            .field("judge_temperature", &self.judge_temperature)
            .field("upstage_endpoint", &self.upstage_endpoint)
            .field("strategies", &self.strategies)
            .field("pricing", &self.pricing)
            .field("quality", &self.quality)
            .field("fallback", &self.fallback)
            .field("selection", &self.selection)
            .field("layout", &self.layout)
            .field("refine", &self.refine)
            .field("extraction_timeout", &self.extraction_timeout)
            .field("llm_timeout", &self.llm_timeout)
            .field("num_workers", &self.num_workers)
            .field("stage_limit", &self.stage_limit)
            .field("cache_path", &self.cache_path)
            .field("use_cache", &self.use_cache)
            .field("output_dir", &self.output_dir)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        let pricing = [
            (STRATEGY_UPSTAGE_OCR, 0.0015),
            (STRATEGY_UPSTAGE_DOCUMENT_PARSE, 0.01),
            (STRATEGY_MUPDF_TEXT, 0.0),
            (STRATEGY_MUPDF_SPLIT, 0.0),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        Self {
            solar_api_key: None,
            llm: LlmConfig::default(),
            judge_temperature: 0.3,
            upstage_endpoint: DEFAULT_ENDPOINT.to_string(),
            strategies: vec![
                STRATEGY_UPSTAGE_DOCUMENT_PARSE.to_string(),
                STRATEGY_UPSTAGE_OCR.to_string(),
                STRATEGY_MUPDF_TEXT.to_string(),
                STRATEGY_MUPDF_SPLIT.to_string(),
            ],
            pricing,
            quality: QualityAggregator::default(),
            fallback: FallbackConfig::default(),
            selection: SelectionConfig::default(),
            layout: LayoutConfig::default(),
            refine: RefineConfig::default(),
            extraction_timeout: Duration::from_secs(300),
            llm_timeout: Duration::from_secs(120),
            num_workers: 4,
            stage_limit: StageLimit::All,
            cache_path: None,
            use_cache: true,
            output_dir: PathBuf::from("data/output"),
        }
    }
}

impl Config {
    /// Check cross-field invariants once, before any document is processed.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let weights = self.quality.weights.sum();
        if (weights - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(ConfigError::Invalid(format!(
                "judge weights sum to {weights}, expected 1.0"
            )));
        }
        let thresholds = &self.quality.thresholds;
        if thresholds.pass < thresholds.borderline {
            return Err(ConfigError::Invalid(format!(
                "pass threshold {} is below borderline threshold {}",
                thresholds.pass, thresholds.borderline
            )));
        }
        let selection = self.selection.score_weight + self.selection.speed_weight;
        if (selection - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(ConfigError::Invalid(format!(
                "selection weights sum to {selection}, expected 1.0"
            )));
        }
        if self.fallback.min_improvement_delta < 0.0 {
            return Err(ConfigError::Invalid(
                "min_improvement_delta must not be negative".into(),
            ));
        }
        if self.num_workers == 0 {
            return Err(ConfigError::Invalid("num_workers must be at least 1".into()));
        }
        if self.strategies.is_empty() {
            return Err(ConfigError::Invalid("no extraction strategy enabled".into()));
        }
        Ok(())
    }

    /// Per-page price of a strategy; unknown strategies are free.
    pub fn cost_per_page(&self, strategy: &str) -> f64 {
        self.pricing.get(strategy).copied().unwrap_or(0.0)
    }

    pub fn require_api_key(&self) -> Result<&str, ConfigError> {
        self.solar_api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or(ConfigError::MissingCredential("SOLAR_API_KEY"))
    }

    /// Strategy used by the refine pipeline.
    pub fn refine_strategy(&self) -> Option<&str> {
        self.refine
            .strategy
            .as_deref()
            .or_else(|| self.strategies.first().map(String::as_str))
    }

    /// Whether any enabled strategy needs the Upstage API.
    pub fn needs_remote_credentials(&self) -> bool {
        self.strategies.iter().any(|s| s.starts_with("upstage_"))
    }
}

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ConfigError;
use crate::config::Config;
use crate::fallback::{FallbackAction, IrrelevantActionPolicy};
use crate::layout::MidlineMode;
use crate::quality::MissingAxisPolicy;

/// On-disk TOML configuration structure.
/// All fields are optional so partial configs work (merge with defaults).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    pub api: Option<ApiConfig>,
    pub strategies: Option<StrategiesConfig>,
    pub quality: Option<QualityConfig>,
    pub fallback: Option<FallbackFileConfig>,
    pub selection: Option<SelectionFileConfig>,
    pub refine: Option<RefineFileConfig>,
    pub concurrency: Option<ConcurrencyConfig>,
    pub paths: Option<PathsConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiConfig {
    pub solar_api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub upstage_endpoint: Option<String>,
    pub max_tokens: Option<u32>,
    pub judge_temperature: Option<f32>,
    pub input_price_per_mtok: Option<f64>,
    pub output_price_per_mtok: Option<f64>,
    pub requests_per_second: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrategiesConfig {
    pub enabled: Option<Vec<String>>,
    /// USD per page, by strategy. Merged key by key.
    pub pricing: Option<std::collections::BTreeMap<String, f64>>,
    pub midline: Option<MidlineMode>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QualityConfig {
    pub weight_read: Option<f64>,
    pub weight_sent: Option<f64>,
    pub weight_noise: Option<f64>,
    pub weight_table: Option<f64>,
    pub weight_fig: Option<f64>,
    pub pass_threshold: Option<f64>,
    pub borderline_threshold: Option<f64>,
    /// Same threshold for every binary axis.
    pub axis_threshold: Option<f64>,
    pub missing_axis_policy: Option<MissingAxisPolicy>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FallbackFileConfig {
    pub max_attempts: Option<u32>,
    pub min_improvement_delta: Option<f64>,
    pub priority: Option<Vec<FallbackAction>>,
    pub irrelevant_action_policy: Option<IrrelevantActionPolicy>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SelectionFileConfig {
    pub score_weight: Option<f64>,
    pub speed_weight: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RefineFileConfig {
    pub strategy: Option<String>,
    pub min_text_length: Option<usize>,
    pub validation_temperature: Option<f32>,
    pub refine_temperature: Option<f32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    pub num_workers: Option<usize>,
    pub extraction_timeout_secs: Option<u64>,
    pub llm_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathsConfig {
    pub cache_path: Option<String>,
    pub output_dir: Option<String>,
}

/// Platform config directory path: `<config_dir>/docjudge/config.toml`.
pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("docjudge").join("config.toml"))
}

/// Load config by cascading CWD `.docjudge.toml` over platform config.
/// CWD values override platform values.
pub fn load_config() -> ConfigFile {
    let platform = config_path().and_then(|p| load_from_path(&p).ok().flatten());
    let cwd = load_from_path(Path::new(".docjudge.toml")).ok().flatten();

    match (platform, cwd) {
        (None, None) => ConfigFile::default(),
        (Some(p), None) => p,
        (None, Some(c)) => c,
        (Some(p), Some(c)) => merge(p, c),
    }
}

/// Load a config from a specific path. A missing file is `Ok(None)`; an
/// unreadable or malformed one is an error.
pub fn load_from_path(path: &Path) -> Result<Option<ConfigFile>, ConfigError> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(ConfigError::File {
                path: path.to_path_buf(),
                message: e.to_string(),
            });
        }
    };
    toml::from_str(&content)
        .map(Some)
        .map_err(|e| ConfigError::File {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

/// Pick the overlay's field, else the base's.
macro_rules! pick {
    ($base:expr, $overlay:expr, $section:ident . $field:ident) => {
        $overlay
            .$section
            .as_ref()
            .and_then(|s| s.$field.clone())
            .or_else(|| $base.$section.as_ref().and_then(|s| s.$field.clone()))
    };
}

/// Merge two configs: `overlay` values take precedence over `base`.
pub fn merge(base: ConfigFile, overlay: ConfigFile) -> ConfigFile {
    let pricing = match (
        base.strategies.as_ref().and_then(|s| s.pricing.clone()),
        overlay.strategies.as_ref().and_then(|s| s.pricing.clone()),
    ) {
        (None, None) => None,
        (Some(b), None) => Some(b),
        (None, Some(o)) => Some(o),
        (Some(mut b), Some(o)) => {
            b.extend(o);
            Some(b)
        }
    };

    ConfigFile {
        api: Some(ApiConfig {
            solar_api_key: pick!(base, overlay, api.solar_api_key),
            base_url: pick!(base, overlay, api.base_url),
            model: pick!(base, overlay, api.model),
            upstage_endpoint: pick!(base, overlay, api.upstage_endpoint),
            max_tokens: pick!(base, overlay, api.max_tokens),
            judge_temperature: pick!(base, overlay, api.judge_temperature),
            input_price_per_mtok: pick!(base, overlay, api.input_price_per_mtok),
            output_price_per_mtok: pick!(base, overlay, api.output_price_per_mtok),
            requests_per_second: pick!(base, overlay, api.requests_per_second),
        }),
        strategies: Some(StrategiesConfig {
            enabled: pick!(base, overlay, strategies.enabled),
            pricing,
            midline: pick!(base, overlay, strategies.midline),
        }),
        quality: Some(QualityConfig {
            weight_read: pick!(base, overlay, quality.weight_read),
            weight_sent: pick!(base, overlay, quality.weight_sent),
            weight_noise: pick!(base, overlay, quality.weight_noise),
            weight_table: pick!(base, overlay, quality.weight_table),
            weight_fig: pick!(base, overlay, quality.weight_fig),
            pass_threshold: pick!(base, overlay, quality.pass_threshold),
            borderline_threshold: pick!(base, overlay, quality.borderline_threshold),
            axis_threshold: pick!(base, overlay, quality.axis_threshold),
            missing_axis_policy: pick!(base, overlay, quality.missing_axis_policy),
        }),
        fallback: Some(FallbackFileConfig {
            max_attempts: pick!(base, overlay, fallback.max_attempts),
            min_improvement_delta: pick!(base, overlay, fallback.min_improvement_delta),
            priority: pick!(base, overlay, fallback.priority),
            irrelevant_action_policy: pick!(base, overlay, fallback.irrelevant_action_policy),
        }),
        selection: Some(SelectionFileConfig {
            score_weight: pick!(base, overlay, selection.score_weight),
            speed_weight: pick!(base, overlay, selection.speed_weight),
        }),
        refine: Some(RefineFileConfig {
            strategy: pick!(base, overlay, refine.strategy),
            min_text_length: pick!(base, overlay, refine.min_text_length),
            validation_temperature: pick!(base, overlay, refine.validation_temperature),
            refine_temperature: pick!(base, overlay, refine.refine_temperature),
        }),
        concurrency: Some(ConcurrencyConfig {
            num_workers: pick!(base, overlay, concurrency.num_workers),
            extraction_timeout_secs: pick!(base, overlay, concurrency.extraction_timeout_secs),
            llm_timeout_secs: pick!(base, overlay, concurrency.llm_timeout_secs),
        }),
        paths: Some(PathsConfig {
            cache_path: pick!(base, overlay, paths.cache_path),
            output_dir: pick!(base, overlay, paths.output_dir),
        }),
    }
}

impl ConfigFile {
    /// Overlay every present field onto `config`.
    pub fn apply(&self, config: &mut Config) -> Result<(), ConfigError> {
        if let Some(api) = &self.api {
            if let Some(v) = &api.solar_api_key {
                config.solar_api_key = Some(v.clone());
            }
            if let Some(v) = &api.base_url {
                config.llm.base_url = v.clone();
            }
            if let Some(v) = &api.model {
                config.llm.model = v.clone();
            }
            if let Some(v) = &api.upstage_endpoint {
                config.upstage_endpoint = v.clone();
            }
            if let Some(v) = api.max_tokens {
                config.llm.max_tokens = v;
            }
            if let Some(v) = api.judge_temperature {
                config.judge_temperature = v;
            }
            if let Some(v) = api.input_price_per_mtok {
                config.llm.input_price_per_mtok = v;
            }
            if let Some(v) = api.output_price_per_mtok {
                config.llm.output_price_per_mtok = v;
            }
            if let Some(v) = api.requests_per_second {
                config.llm.requests_per_second = v;
            }
        }

        if let Some(s) = &self.strategies {
            if let Some(enabled) = &s.enabled {
                config.strategies = enabled.clone();
            }
            if let Some(pricing) = &s.pricing {
                config.pricing.extend(pricing.clone());
            }
            if let Some(m) = s.midline {
                config.layout.midline = m;
            }
        }

        if let Some(q) = &self.quality {
            let weights = &mut config.quality.weights;
            for (slot, value) in [
                (&mut weights.read, q.weight_read),
                (&mut weights.sent, q.weight_sent),
                (&mut weights.noise, q.weight_noise),
                (&mut weights.table, q.weight_table),
                (&mut weights.fig, q.weight_fig),
            ] {
                if let Some(v) = value {
                    *slot = v;
                }
            }
            if let Some(v) = q.pass_threshold {
                config.quality.thresholds.pass = v;
            }
            if let Some(v) = q.borderline_threshold {
                config.quality.thresholds.borderline = v;
            }
            if let Some(v) = q.axis_threshold {
                if !(0.0..=1.0).contains(&v) {
                    return Err(ConfigError::Invalid(format!(
                        "axis_threshold {v} is outside [0, 1]"
                    )));
                }
                let axes = &mut config.quality.axis_thresholds;
                axes.read = v;
                axes.sent = v;
                axes.noise = v;
                axes.table = v;
            }
            if let Some(p) = q.missing_axis_policy {
                config.quality.missing_axis_policy = p;
            }
        }

        if let Some(f) = &self.fallback {
            if let Some(v) = f.max_attempts {
                config.fallback.max_attempts = v;
            }
            if let Some(v) = f.min_improvement_delta {
                config.fallback.min_improvement_delta = v;
            }
            if let Some(v) = &f.priority {
                config.fallback.priority = v.clone();
            }
            if let Some(v) = f.irrelevant_action_policy {
                config.fallback.irrelevant_action_policy = v;
            }
        }

        if let Some(s) = &self.selection {
            if let Some(v) = s.score_weight {
                config.selection.score_weight = v;
            }
            if let Some(v) = s.speed_weight {
                config.selection.speed_weight = v;
            }
        }

        if let Some(r) = &self.refine {
            if let Some(v) = &r.strategy {
                config.refine.strategy = Some(v.clone());
            }
            if let Some(v) = r.min_text_length {
                config.refine.min_text_length = v;
            }
            if let Some(v) = r.validation_temperature {
                config.refine.validation_temperature = v;
            }
            if let Some(v) = r.refine_temperature {
                config.refine.refine_temperature = v;
            }
        }

        if let Some(c) = &self.concurrency {
            if let Some(v) = c.num_workers {
                config.num_workers = v;
            }
            if let Some(v) = c.extraction_timeout_secs {
                config.extraction_timeout = Duration::from_secs(v);
            }
            if let Some(v) = c.llm_timeout_secs {
                config.llm_timeout = Duration::from_secs(v);
            }
        }

        if let Some(p) = &self.paths {
            if let Some(v) = &p.cache_path {
                config.cache_path = Some(PathBuf::from(v));
            }
            if let Some(v) = &p.output_dir {
                config.output_dir = PathBuf::from(v);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_parses() {
        let toml_str = "[fallback]\nmax_attempts = 3\npriority = [\"table_enhancement\"]\n";
        let parsed: ConfigFile = toml::from_str(toml_str).unwrap();
        let fallback = parsed.fallback.unwrap();
        assert_eq!(fallback.max_attempts, Some(3));
        assert_eq!(fallback.priority, Some(vec![FallbackAction::TableEnhancement]));
        assert!(fallback.min_improvement_delta.is_none());
        assert!(parsed.quality.is_none());
    }

    #[test]
    fn merge_overlay_wins() {
        let base = ConfigFile {
            paths: Some(PathsConfig {
                cache_path: Some("/base/cache.db".to_string()),
                output_dir: Some("/base/out".to_string()),
            }),
            ..Default::default()
        };
        let overlay = ConfigFile {
            paths: Some(PathsConfig {
                cache_path: Some("/overlay/cache.db".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let merged = merge(base, overlay);
        let paths = merged.paths.unwrap();
        assert_eq!(paths.cache_path.unwrap(), "/overlay/cache.db");
        assert_eq!(paths.output_dir.unwrap(), "/base/out");
    }

    #[test]
    fn merge_pricing_key_by_key() {
        let mut base_pricing = std::collections::BTreeMap::new();
        base_pricing.insert("upstage_ocr".to_string(), 0.002);
        base_pricing.insert("mupdf_text".to_string(), 0.0);
        let mut overlay_pricing = std::collections::BTreeMap::new();
        overlay_pricing.insert("upstage_ocr".to_string(), 0.003);

        let base = ConfigFile {
            strategies: Some(StrategiesConfig {
                pricing: Some(base_pricing),
                ..Default::default()
            }),
            ..Default::default()
        };
        let overlay = ConfigFile {
            strategies: Some(StrategiesConfig {
                pricing: Some(overlay_pricing),
                ..Default::default()
            }),
            ..Default::default()
        };
        let pricing = merge(base, overlay).strategies.unwrap().pricing.unwrap();
        assert_eq!(pricing["upstage_ocr"], 0.003);
        assert_eq!(pricing["mupdf_text"], 0.0);
    }

    #[test]
    fn apply_overrides_only_present_fields() {
        let file: ConfigFile = toml::from_str(
            r#"
            [quality]
            pass_threshold = 90.0
            missing_axis_policy = "neutral"

            [fallback]
            irrelevant_action_policy = "consume_slot"

            [concurrency]
            llm_timeout_secs = 60
            "#,
        )
        .unwrap();
        let mut config = Config::default();
        file.apply(&mut config).unwrap();
        assert_eq!(config.quality.thresholds.pass, 90.0);
        assert_eq!(config.quality.thresholds.borderline, 70.0);
        assert_eq!(config.quality.missing_axis_policy, MissingAxisPolicy::Neutral);
        assert_eq!(
            config.fallback.irrelevant_action_policy,
            IrrelevantActionPolicy::ConsumeSlot
        );
        assert_eq!(config.llm_timeout, Duration::from_secs(60));
        assert_eq!(config.extraction_timeout, Duration::from_secs(300));
    }

    #[test]
    fn out_of_range_axis_threshold_is_rejected() {
        let file: ConfigFile = toml::from_str("[quality]\naxis_threshold = 50.0\n").unwrap();
        let mut config = Config::default();
        assert!(matches!(file.apply(&mut config), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn load_from_path_missing_and_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        assert!(load_from_path(&missing).unwrap().is_none());

        let bad = dir.path().join("bad.toml");
        std::fs::write(&bad, "[quality\npass_threshold = ").unwrap();
        assert!(matches!(
            load_from_path(&bad),
            Err(ConfigError::File { .. })
        ));

        let good = dir.path().join("good.toml");
        std::fs::write(&good, "[concurrency]\nnum_workers = 2\n").unwrap();
        let parsed = load_from_path(&good).unwrap().unwrap();
        assert_eq!(parsed.concurrency.unwrap().num_workers, Some(2));
    }
}

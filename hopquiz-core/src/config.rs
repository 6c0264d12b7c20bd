//! Engine configuration.
//!
//! Everything tunable lives in [`EngineConfig`] and its nested sections.
//! Defaults match a production run; [`EngineConfig::from_env`] overlays
//! environment variables on top of them.

use crate::error::ConfigError;
use crate::mcq::QuestionMode;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_GENERATOR_MODEL: &str = "claude-sonnet-4-20250514";
const DEFAULT_MEDIUM_MODEL: &str = "claude-3-5-haiku-20241022";
const DEFAULT_STRONG_MODEL: &str = "claude-opus-4-20250514";

/// Model identifiers for every role the engine calls.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRoster {
    /// Generator for the anchor hop (k = 0).
    pub stage1: String,
    /// Generator for odd hops.
    pub stage2: String,
    /// Generator for even hops after the anchor.
    pub stage3: String,
    /// Vision model that describes the image.
    pub vision_knowledge: String,
    /// Text model that extracts relation triples.
    pub extraction: String,
    pub solve_medium: String,
    pub solve_strong: String,
    /// Independent reviewer and visual verifier.
    pub review: String,
    /// Final composition, refinement and reflection.
    pub judge: String,
    /// Stem rewrites of final candidates.
    pub obfuscation: String,
}

impl Default for ModelRoster {
    fn default() -> Self {
        Self {
            stage1: DEFAULT_GENERATOR_MODEL.to_string(),
            stage2: DEFAULT_GENERATOR_MODEL.to_string(),
            stage3: DEFAULT_GENERATOR_MODEL.to_string(),
            vision_knowledge: DEFAULT_GENERATOR_MODEL.to_string(),
            extraction: DEFAULT_GENERATOR_MODEL.to_string(),
            solve_medium: DEFAULT_MEDIUM_MODEL.to_string(),
            solve_strong: DEFAULT_STRONG_MODEL.to_string(),
            review: DEFAULT_GENERATOR_MODEL.to_string(),
            judge: DEFAULT_GENERATOR_MODEL.to_string(),
            obfuscation: DEFAULT_GENERATOR_MODEL.to_string(),
        }
    }
}

impl ModelRoster {
    /// Use one model for every role.
    pub fn uniform(model: impl Into<String>) -> Self {
        let model = model.into();
        Self {
            stage1: model.clone(),
            stage2: model.clone(),
            stage3: model.clone(),
            vision_knowledge: model.clone(),
            extraction: model.clone(),
            solve_medium: model.clone(),
            solve_strong: model.clone(),
            review: model.clone(),
            judge: model.clone(),
            obfuscation: model,
        }
    }

    /// The generator model for hop `k`.
    pub fn generator_for_hop(&self, k: usize) -> &str {
        if k == 0 {
            &self.stage1
        } else if k % 2 == 1 {
            &self.stage2
        } else {
            &self.stage3
        }
    }
}

/// Delay growth between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed,
    Exponential,
}

/// Retry and timeout policy applied to every oracle call.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub delay: Duration,
    pub backoff: Backoff,
    /// Hard timeout for a single attempt.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_secs(10),
            backoff: Backoff::Fixed,
            timeout: Duration::from_secs(120),
        }
    }
}

impl RetryPolicy {
    /// A policy with no delay between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            delay: Duration::ZERO,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_delay(mut self, delay: Duration, backoff: Backoff) -> Self {
        self.delay = delay;
        self.backoff = backoff;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Exponential => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1).min(16));
                self.delay.saturating_mul(factor)
            }
        }
    }
}

/// Path sampling constraints.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplerConfig {
    /// Forbid two edges from the same extraction call in one path.
    pub distinct_sources: bool,
    /// Maximum adjacent pairs sharing a source id.
    pub max_shortcut_edges: usize,
    /// Whole-procedure retries when a source type is preferred.
    pub prefer_attempts: usize,
    /// Node expansions allowed per sampling call.
    pub expansion_budget: usize,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            distinct_sources: false,
            max_shortcut_edges: 10,
            prefer_attempts: 6,
            expansion_budget: 10_000,
        }
    }
}

/// Bounds and switches for per-hop synthesis.
#[derive(Debug, Clone, PartialEq)]
pub struct StepPolicy {
    /// Content revisions before the last candidate is accepted as-is.
    pub max_revisions: u32,
    /// Visual-claim revisions before the hop is dropped.
    pub max_visual_revisions: u32,
    pub verify_visual_claims: bool,
    pub require_cross_modal: bool,
    /// Reject stems that contain the literal answer text.
    pub check_answer_leak: bool,
    /// Distractor entities offered to the generator.
    pub distractor_count: usize,
}

impl Default for StepPolicy {
    fn default() -> Self {
        Self {
            max_revisions: 1,
            max_visual_revisions: 2,
            verify_visual_claims: true,
            require_cross_modal: true,
            check_answer_leak: true,
            distractor_count: 6,
        }
    }
}

/// Bounds for the final refine loop.
#[derive(Debug, Clone, PartialEq)]
pub struct ComposerPolicy {
    pub max_refinements: u32,
    pub mode: QuestionMode,
}

impl Default for ComposerPolicy {
    fn default() -> Self {
        Self {
            max_refinements: 2,
            mode: QuestionMode::SingleSelect,
        }
    }
}

/// How source text is split and sent for triple extraction.
///
/// Every field takes part in the cache key.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionOptions {
    pub model: String,
    pub chunk_words: usize,
    pub max_chunks: usize,
    pub max_tokens: usize,
}

impl Default for ExtractionOptions {
    fn default() -> Self {
        Self {
            model: DEFAULT_GENERATOR_MODEL.to_string(),
            chunk_words: 160,
            max_chunks: 20,
            max_tokens: 2048,
        }
    }
}

/// Episode sizing and batch bounds.
#[derive(Debug, Clone, PartialEq)]
pub struct EpisodeSettings {
    pub max_steps_per_round: usize,
    pub min_hops: usize,
    /// Accepted questions a batch aims for.
    pub target_questions: usize,
    /// Episodes a batch may run before giving up.
    pub max_attempts: usize,
}

impl Default for EpisodeSettings {
    fn default() -> Self {
        Self {
            max_steps_per_round: 6,
            min_hops: 5,
            target_questions: 5,
            max_attempts: 15,
        }
    }
}

impl EpisodeSettings {
    /// Number of edge-anchored hops after the anchor hop.
    pub fn target_hops(&self) -> usize {
        self.max_steps_per_round
            .saturating_sub(1)
            .min(self.min_hops.max(2))
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub models: ModelRoster,
    pub retry: RetryPolicy,
    pub sampler: SamplerConfig,
    pub step: StepPolicy,
    pub composer: ComposerPolicy,
    pub extraction: ExtractionOptions,
    pub episode: EpisodeSettings,
    pub temperature: f32,
    pub max_tokens: usize,
    /// Timeout for each concurrent strong-solver probe.
    pub probe_timeout: Duration,
    /// Persisted fact-graph cache; in-memory only when unset.
    pub cache_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            models: ModelRoster::default(),
            retry: RetryPolicy::default(),
            sampler: SamplerConfig::default(),
            step: StepPolicy::default(),
            composer: ComposerPolicy::default(),
            extraction: ExtractionOptions::default(),
            episode: EpisodeSettings::default(),
            temperature: 0.0,
            max_tokens: 4096,
            probe_timeout: Duration::from_secs(180),
            cache_path: None,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_models(mut self, models: ModelRoster) -> Self {
        self.extraction.model = models.extraction.clone();
        self.models = models;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_sampler(mut self, sampler: SamplerConfig) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn with_step_policy(mut self, step: StepPolicy) -> Self {
        self.step = step;
        self
    }

    pub fn with_composer_policy(mut self, composer: ComposerPolicy) -> Self {
        self.composer = composer;
        self
    }

    pub fn with_question_mode(mut self, mode: QuestionMode) -> Self {
        self.composer.mode = mode;
        self
    }

    pub fn with_episode_settings(mut self, episode: EpisodeSettings) -> Self {
        self.episode = episode;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_cache_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_path = Some(path.into());
        self
    }

    /// Build a configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    ///
    /// Unset and empty keys keep their defaults; unparsable values fail.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup };
        let mut config = Self::default();

        let models = &mut config.models;
        env.string("MODEL_STAGE_1", &mut models.stage1);
        env.string("MODEL_STAGE_2", &mut models.stage2);
        env.string("MODEL_STAGE_3", &mut models.stage3);
        env.string("MODEL_VISION_KNOWLEDGE", &mut models.vision_knowledge);
        env.string("MODEL_SUM", &mut models.extraction);
        env.string("MODEL_SOLVE_MEDIUM", &mut models.solve_medium);
        env.string("MODEL_SOLVE_STRONG", &mut models.solve_strong);
        env.string("MODEL_REVIEW", &mut models.review);
        env.string("MODEL_JUDGE", &mut models.judge);
        env.string("MODEL_OBFUSCATE", &mut models.obfuscation);
        config.extraction.model = config.models.extraction.clone();

        env.parse("DEFAULT_TEMPERATURE", &mut config.temperature)?;

        if let Some(attempts) = env.get::<u32>("API_MAX_RETRIES")? {
            config.retry.max_attempts = attempts.max(1);
        }
        if let Some(secs) = env.get::<f64>("API_RETRY_SLEEP_SECONDS")? {
            config.retry.delay = seconds("API_RETRY_SLEEP_SECONDS", secs)?;
        }
        if let Some(secs) = env.get::<f64>("API_TIMEOUT_SECONDS")? {
            config.retry.timeout = seconds("API_TIMEOUT_SECONDS", secs)?;
        }

        env.parse("MAX_STEPS_PER_ROUND", &mut config.episode.max_steps_per_round)?;
        env.parse("MIN_HOPS", &mut config.episode.min_hops)?;
        env.flag("REQUIRE_CROSS_MODAL", &mut config.step.require_cross_modal)?;
        env.flag("VERIFY_STRICT", &mut config.step.check_answer_leak)?;
        env.parse("DOC_CHUNK_WORDS", &mut config.extraction.chunk_words)?;
        env.flag("REQUIRE_DISTINCT_SOURCES", &mut config.sampler.distinct_sources)?;
        env.parse("MAX_SHORTCUT_EDGES", &mut config.sampler.max_shortcut_edges)?;
        env.parse("QUESTION_MODE", &mut config.composer.mode)?;

        if let Some(path) = env.raw("FACT_CACHE_PATH") {
            config.cache_path = Some(PathBuf::from(path));
        }

        Ok(config)
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn raw(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, slot: &mut String) {
        if let Some(value) = self.raw(key) {
            *slot = value;
        }
    }

    fn get<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.raw(key) {
            None => Ok(None),
            Some(value) => value
                .parse::<T>()
                .map(Some)
                .map_err(|e| invalid(key, &value, e.to_string())),
        }
    }

    fn parse<T>(&self, key: &str, slot: &mut T) -> Result<(), ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        if let Some(value) = self.get(key)? {
            *slot = value;
        }
        Ok(())
    }

    fn flag(&self, key: &str, slot: &mut bool) -> Result<(), ConfigError> {
        if let Some(value) = self.raw(key) {
            *slot = match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => return Err(invalid(key, &value, "expected a boolean".into())),
            };
        }
        Ok(())
    }
}

fn seconds(key: &str, secs: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(secs).map_err(|e| invalid(key, &secs.to_string(), e.to_string()))
}

fn invalid(key: &str, value: &str, reason: String) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
        reason,
    }
}

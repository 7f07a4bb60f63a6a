use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::decomposition::terminators::DEFAULT_CONTRADICTION_PAIRS;
use crate::error::{EngineError, EngineResult, MetaError, MetaResult};
use crate::meta::{MetaConfig, ParamValue};
use crate::router::Role;

/// Process configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub engine: EngineConfig,
    pub meta: MetaConfig,
    pub invoker: InvokerConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub artifacts: ArtifactConfig,
}

/// The tunable engine configuration.
///
/// This is the object the meta-learning loop versions: adoption produces a new
/// `EngineConfig`, rollback reinstates a previous one. Nothing in here is
/// consulted through globals; it travels inside the `EngineContext`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    pub decomposition: DecompositionConfig,
    pub router: RouterConfig,
    pub roles: RolesConfig,
    pub controller: ControllerConfig,
    pub sampling: SamplingConfig,
}

/// Decomposition (LAG) configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecompositionConfig {
    /// Maximum dependency depth of a generated plan
    pub max_depth: usize,
    /// Cognitive-load threshold in (0, 1]; at or below it the query is not decomposed
    pub load_threshold: f64,
    /// Relevance floor for the LOW_SUPPORT probe
    pub min_support: f64,
    /// Cognitive-load feature weights
    pub load_weights: LoadWeights,
    /// Additional UNANSWERABLE regexes on top of the built-in rules
    pub extra_unanswerable_patterns: Vec<String>,
    /// Mutually exclusive term pairs for CONTRADICTION detection
    pub contradiction_pairs: Vec<(String, String)>,
}

impl Default for DecompositionConfig {
    fn default() -> Self {
        Self {
            max_depth: 5,
            load_threshold: 0.7,
            min_support: 0.1,
            load_weights: LoadWeights::default(),
            extra_unanswerable_patterns: Vec::new(),
            contradiction_pairs: DEFAULT_CONTRADICTION_PAIRS
                .iter()
                .map(|(a, b)| (a.to_string(), b.to_string()))
                .collect(),
        }
    }
}

impl DecompositionConfig {
    /// Validate caller-supplied decomposition settings.
    pub fn validate(&self) -> EngineResult<()> {
        if self.max_depth < 1 {
            return Err(EngineError::config(format!(
                "decomposition.max_depth must be >= 1 (got {})",
                self.max_depth
            )));
        }
        if !(self.load_threshold > 0.0 && self.load_threshold <= 1.0) {
            return Err(EngineError::config(format!(
                "decomposition.load_threshold must be in (0, 1] (got {})",
                self.load_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.min_support) {
            return Err(EngineError::config(format!(
                "decomposition.min_support must be in [0, 1] (got {})",
                self.min_support
            )));
        }
        self.load_weights.validate()
    }
}

/// Weights and normalizers for the cognitive-load score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadWeights {
    pub length: f64,
    pub clauses: f64,
    pub comparative: f64,
    pub ambiguity: f64,
    /// Word count at which the length feature saturates
    pub length_norm_words: f64,
    /// Clause-marker count at which the clause feature saturates
    pub clause_norm: f64,
}

impl Default for LoadWeights {
    fn default() -> Self {
        Self {
            length: 0.2,
            clauses: 0.6,
            comparative: 0.3,
            ambiguity: 0.2,
            length_norm_words: 20.0,
            clause_norm: 3.0,
        }
    }
}

impl LoadWeights {
    fn validate(&self) -> EngineResult<()> {
        for (name, w) in [
            ("length", self.length),
            ("clauses", self.clauses),
            ("comparative", self.comparative),
            ("ambiguity", self.ambiguity),
        ] {
            if !w.is_finite() || w < 0.0 {
                return Err(EngineError::config(format!(
                    "decomposition.load_weights.{} must be a finite non-negative number (got {})",
                    name, w
                )));
            }
        }
        if !(self.length_norm_words > 0.0 && self.clause_norm > 0.0) {
            return Err(EngineError::config(
                "cognitive-load normalizers must be positive",
            ));
        }
        Ok(())
    }
}

/// Context router (RCR) configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Maximum survivors of the semantic filter
    pub topk: usize,
    /// Minimum cosine similarity to survive the semantic filter
    pub min_sim: f64,
    /// Importance-score weights
    pub weights: ImportanceWeights,
    /// Recency decay applied to item age
    pub recency: RecencyDecay,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            topk: 12,
            min_sim: 0.35,
            weights: ImportanceWeights::default(),
            recency: RecencyDecay::default(),
        }
    }
}

impl RouterConfig {
    /// Validate router settings.
    pub fn validate(&self) -> EngineResult<()> {
        if self.topk < 1 {
            return Err(EngineError::config("router.topk must be >= 1"));
        }
        if !(-1.0..=1.0).contains(&self.min_sim) {
            return Err(EngineError::config(format!(
                "router.min_sim must be in [-1, 1] (got {})",
                self.min_sim
            )));
        }
        for (name, w) in [
            ("role_keyword", self.weights.role_keyword),
            ("task_stage", self.weights.task_stage),
            ("recency", self.weights.recency),
        ] {
            if !w.is_finite() || w < 0.0 {
                return Err(EngineError::config(format!(
                    "router.weights.{} must be a finite non-negative number (got {})",
                    name, w
                )));
            }
        }
        self.recency.validate()
    }
}

/// Importance-score weights (`w1`, `w2`, `w3`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportanceWeights {
    pub role_keyword: f64,
    pub task_stage: f64,
    pub recency: f64,
}

impl Default for ImportanceWeights {
    fn default() -> Self {
        Self {
            role_keyword: 0.4,
            task_stage: 0.4,
            recency: 0.2,
        }
    }
}

/// Monotonically non-increasing decay over item age.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecencyDecay {
    /// `0.5^(age / half_life)`
    Exponential { half_life_hours: f64 },
    /// `max(0, 1 - age / horizon)`
    Linear { horizon_hours: f64 },
    /// Constant 1.0
    None,
}

impl Default for RecencyDecay {
    fn default() -> Self {
        RecencyDecay::Exponential {
            half_life_hours: 168.0,
        }
    }
}

impl RecencyDecay {
    fn validate(&self) -> EngineResult<()> {
        match self {
            RecencyDecay::Exponential { half_life_hours }
                if !(half_life_hours.is_finite() && *half_life_hours > 0.0) =>
            {
                Err(EngineError::config(
                    "router.recency half_life_hours must be positive",
                ))
            }
            RecencyDecay::Linear { horizon_hours }
                if !(horizon_hours.is_finite() && *horizon_hours > 0.0) =>
            {
                Err(EngineError::config(
                    "router.recency horizon_hours must be positive",
                ))
            }
            _ => Ok(()),
        }
    }
}

impl FromStr for RecencyDecay {
    type Err = String;

    /// Parses `exponential:<hours>`, `linear:<hours>` or `none`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        if s == "none" {
            return Ok(RecencyDecay::None);
        }
        let (kind, hours) = s
            .split_once(':')
            .ok_or_else(|| format!("Unknown recency decay: {}", s))?;
        let hours: f64 = hours
            .parse()
            .map_err(|_| format!("Invalid recency hours: {}", hours))?;
        match kind {
            "exponential" => Ok(RecencyDecay::Exponential {
                half_life_hours: hours,
            }),
            "linear" => Ok(RecencyDecay::Linear {
                horizon_hours: hours,
            }),
            _ => Err(format!("Unknown recency decay: {}", kind)),
        }
    }
}

/// Per-role routing configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleConfig {
    pub budget_tokens: usize,
    pub keywords: Vec<String>,
}

impl RoleConfig {
    fn new(budget_tokens: usize, keywords: &[&str]) -> Self {
        Self {
            budget_tokens,
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
        }
    }
}

/// Configuration of all six pipeline roles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolesConfig {
    pub planner: RoleConfig,
    pub retriever: RoleConfig,
    pub solver: RoleConfig,
    pub critic: RoleConfig,
    pub verifier: RoleConfig,
    pub rewriter: RoleConfig,
}

impl Default for RolesConfig {
    fn default() -> Self {
        Self {
            planner: RoleConfig::new(
                512,
                &["plan", "steps", "goal", "strategy", "outline", "decompose"],
            ),
            retriever: RoleConfig::new(
                1024,
                &["source", "fact", "data", "evidence", "document", "reference"],
            ),
            solver: RoleConfig::new(
                2048,
                &["answer", "solution", "compute", "result", "method", "derive"],
            ),
            critic: RoleConfig::new(
                768,
                &["issue", "flaw", "risk", "counterexample", "weakness", "error"],
            ),
            verifier: RoleConfig::new(
                768,
                &["verify", "check", "confirm", "evidence", "citation", "consistent"],
            ),
            rewriter: RoleConfig::new(
                512,
                &["summary", "style", "format", "concise", "clarity", "final"],
            ),
        }
    }
}

impl RolesConfig {
    /// Configuration for one role.
    pub fn get(&self, role: Role) -> &RoleConfig {
        match role {
            Role::Planner => &self.planner,
            Role::Retriever => &self.retriever,
            Role::Solver => &self.solver,
            Role::Critic => &self.critic,
            Role::Verifier => &self.verifier,
            Role::Rewriter => &self.rewriter,
        }
    }

    /// Mutable configuration for one role.
    pub fn get_mut(&mut self, role: Role) -> &mut RoleConfig {
        match role {
            Role::Planner => &mut self.planner,
            Role::Retriever => &mut self.retriever,
            Role::Solver => &mut self.solver,
            Role::Critic => &mut self.critic,
            Role::Verifier => &mut self.verifier,
            Role::Rewriter => &mut self.rewriter,
        }
    }

    fn validate(&self) -> EngineResult<()> {
        for role in Role::ALL {
            if self.get(role).budget_tokens == 0 {
                return Err(EngineError::config(format!(
                    "budget.{} must be positive",
                    role
                )));
            }
        }
        Ok(())
    }
}

/// Orchestration controller configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Wall-clock ceiling per query (circuit breaker)
    pub max_wall_ms: u64,
    /// Role-invocation ceiling per query (circuit breaker)
    pub max_steps: u32,
    /// Timeout for a single role invocation attempt
    pub role_timeout_ms: u64,
    /// Retries after the first failed attempt
    pub max_retries: u32,
    /// Base delay for exponential backoff
    pub retry_delay_ms: u64,
    /// Upper bound on a single backoff delay
    pub max_retry_delay_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_wall_ms: 120_000,
            max_steps: 256,
            role_timeout_ms: 30_000,
            max_retries: 2,
            retry_delay_ms: 200,
            max_retry_delay_ms: 2_000,
        }
    }
}

impl ControllerConfig {
    fn validate(&self) -> EngineResult<()> {
        if self.max_wall_ms == 0 {
            return Err(EngineError::config("controller.max_wall_ms must be >= 1"));
        }
        if self.max_steps == 0 {
            return Err(EngineError::config("controller.max_steps must be >= 1"));
        }
        if self.role_timeout_ms == 0 {
            return Err(EngineError::config(
                "controller.role_timeout_ms must be >= 1",
            ));
        }
        if self.max_retry_delay_ms < self.retry_delay_ms {
            return Err(EngineError::config(
                "controller.max_retry_delay_ms must be >= controller.retry_delay_ms",
            ));
        }
        Ok(())
    }
}

/// Sampling parameters forwarded to the reasoning collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    pub temperature: f64,
    pub seed: u64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            seed: 42,
        }
    }
}

/// External reasoning endpoint configuration
#[derive(Debug, Clone, Default)]
pub struct InvokerConfig {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub timeout_ms: u64,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub max_connections: u32,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log output format
#[derive(Debug, Clone, PartialEq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Persisted artifact configuration
#[derive(Debug, Clone)]
pub struct ArtifactConfig {
    pub enabled: bool,
    pub dir: PathBuf,
}

impl EngineConfig {
    /// Validate the whole engine configuration.
    pub fn validate(&self) -> EngineResult<()> {
        self.decomposition.validate()?;
        self.router.validate()?;
        self.roles.validate()?;
        self.controller.validate()?;
        if !(0.0..=2.0).contains(&self.sampling.temperature) {
            return Err(EngineError::config(format!(
                "sampling.temperature must be in [0, 2] (got {})",
                self.sampling.temperature
            )));
        }
        Ok(())
    }

    /// Load the engine configuration from `ENGINE_*` variables.
    pub fn from_env() -> EngineResult<Self> {
        let mut config = EngineConfig::default();

        let d = &mut config.decomposition;
        set_from_env(&mut d.max_depth, "ENGINE_MAX_DEPTH")?;
        set_from_env(&mut d.load_threshold, "ENGINE_LOAD_THRESHOLD")?;
        set_from_env(&mut d.min_support, "ENGINE_MIN_SUPPORT")?;
        set_from_env(&mut d.load_weights.length, "ENGINE_LOAD_W_LENGTH")?;
        set_from_env(&mut d.load_weights.clauses, "ENGINE_LOAD_W_CLAUSES")?;
        set_from_env(&mut d.load_weights.comparative, "ENGINE_LOAD_W_COMPARATIVE")?;
        set_from_env(&mut d.load_weights.ambiguity, "ENGINE_LOAD_W_AMBIGUITY")?;
        if let Ok(patterns) = env::var("ENGINE_UNANSWERABLE_PATTERNS") {
            d.extra_unanswerable_patterns = patterns
                .split("||")
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect();
        }
        if let Ok(pairs) = env::var("ENGINE_CONTRADICTION_PAIRS") {
            d.contradiction_pairs = parse_pairs(&pairs)?;
        }

        let r = &mut config.router;
        set_from_env(&mut r.topk, "ENGINE_TOPK")?;
        set_from_env(&mut r.min_sim, "ENGINE_MIN_SIM")?;
        set_from_env(&mut r.weights.role_keyword, "ENGINE_W_ROLE_KEYWORD")?;
        set_from_env(&mut r.weights.task_stage, "ENGINE_W_TASK_STAGE")?;
        set_from_env(&mut r.weights.recency, "ENGINE_W_RECENCY")?;
        set_from_env(&mut r.recency, "ENGINE_RECENCY_DECAY")?;

        for role in Role::ALL {
            let upper = role.as_str().to_uppercase();
            let rc = config.roles.get_mut(role);
            set_from_env(&mut rc.budget_tokens, &format!("ENGINE_BUDGET_{}", upper))?;
            if let Ok(keywords) = env::var(format!("ENGINE_KEYWORDS_{}", upper)) {
                rc.keywords = keywords
                    .split(',')
                    .map(|k| k.trim().to_lowercase())
                    .filter(|k| !k.is_empty())
                    .collect();
            }
        }

        let c = &mut config.controller;
        set_from_env(&mut c.max_wall_ms, "ENGINE_MAX_WALL_MS")?;
        set_from_env(&mut c.max_steps, "ENGINE_MAX_STEPS")?;
        set_from_env(&mut c.role_timeout_ms, "ENGINE_ROLE_TIMEOUT_MS")?;
        set_from_env(&mut c.max_retries, "ENGINE_MAX_RETRIES")?;
        set_from_env(&mut c.retry_delay_ms, "ENGINE_RETRY_DELAY_MS")?;
        set_from_env(&mut c.max_retry_delay_ms, "ENGINE_MAX_RETRY_DELAY_MS")?;

        set_from_env(&mut config.sampling.temperature, "ENGINE_TEMPERATURE")?;
        set_from_env(&mut config.sampling.seed, "ENGINE_SEED")?;

        config.validate()?;
        Ok(config)
    }

    /// Keys addressable through [`EngineConfig::get_param`].
    pub fn param_keys() -> Vec<String> {
        let mut keys: Vec<String> = [
            "decomposition.max_depth",
            "decomposition.load_threshold",
            "decomposition.min_support",
            "router.topk",
            "router.min_sim",
            "router.weights.role_keyword",
            "router.weights.task_stage",
            "router.weights.recency",
            "controller.max_wall_ms",
            "controller.max_steps",
            "controller.role_timeout_ms",
            "controller.max_retries",
            "sampling.temperature",
        ]
        .iter()
        .map(|k| k.to_string())
        .collect();
        keys.extend(Role::ALL.iter().map(|r| format!("budget.{}", r)));
        keys
    }

    /// Read a tunable parameter by dotted key.
    pub fn get_param(&self, key: &str) -> Option<ParamValue> {
        let value = match key {
            "decomposition.max_depth" => ParamValue::Integer(self.decomposition.max_depth as i64),
            "decomposition.load_threshold" => ParamValue::Float(self.decomposition.load_threshold),
            "decomposition.min_support" => ParamValue::Float(self.decomposition.min_support),
            "router.topk" => ParamValue::Integer(self.router.topk as i64),
            "router.min_sim" => ParamValue::Float(self.router.min_sim),
            "router.weights.role_keyword" => ParamValue::Float(self.router.weights.role_keyword),
            "router.weights.task_stage" => ParamValue::Float(self.router.weights.task_stage),
            "router.weights.recency" => ParamValue::Float(self.router.weights.recency),
            "controller.max_wall_ms" => ParamValue::Integer(self.controller.max_wall_ms as i64),
            "controller.max_steps" => ParamValue::Integer(self.controller.max_steps as i64),
            "controller.role_timeout_ms" => {
                ParamValue::Integer(self.controller.role_timeout_ms as i64)
            }
            "controller.max_retries" => ParamValue::Integer(self.controller.max_retries as i64),
            "sampling.temperature" => ParamValue::Float(self.sampling.temperature),
            other => {
                let role: Role = other.strip_prefix("budget.")?.parse().ok()?;
                ParamValue::Integer(self.roles.get(role).budget_tokens as i64)
            }
        };
        Some(value)
    }

    /// Set a tunable parameter by dotted key.
    ///
    /// The result is not validated; call [`EngineConfig::validate`] after a
    /// batch of changes.
    pub fn set_param(&mut self, key: &str, value: &ParamValue) -> MetaResult<()> {
        let int = || {
            value
                .as_integer()
                .filter(|v| *v >= 0)
                .ok_or_else(|| MetaError::TypeMismatch {
                    key: key.to_string(),
                    expected: "non-negative integer".to_string(),
                })
        };
        let float = || {
            value.as_float().ok_or_else(|| MetaError::TypeMismatch {
                key: key.to_string(),
                expected: "float".to_string(),
            })
        };

        match key {
            "decomposition.max_depth" => self.decomposition.max_depth = int()? as usize,
            "decomposition.load_threshold" => self.decomposition.load_threshold = float()?,
            "decomposition.min_support" => self.decomposition.min_support = float()?,
            "router.topk" => self.router.topk = int()? as usize,
            "router.min_sim" => self.router.min_sim = float()?,
            "router.weights.role_keyword" => self.router.weights.role_keyword = float()?,
            "router.weights.task_stage" => self.router.weights.task_stage = float()?,
            "router.weights.recency" => self.router.weights.recency = float()?,
            "controller.max_wall_ms" => self.controller.max_wall_ms = int()? as u64,
            "controller.max_steps" => self.controller.max_steps = int()? as u32,
            "controller.role_timeout_ms" => self.controller.role_timeout_ms = int()? as u64,
            "controller.max_retries" => self.controller.max_retries = int()? as u32,
            "sampling.temperature" => self.sampling.temperature = float()?,
            other => {
                let role: Role = other
                    .strip_prefix("budget.")
                    .and_then(|r| r.parse().ok())
                    .ok_or_else(|| MetaError::UnknownParameter {
                        key: key.to_string(),
                    })?;
                self.roles.get_mut(role).budget_tokens = int()? as usize;
            }
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> EngineResult<Self> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let engine = EngineConfig::from_env()?;
        let meta = MetaConfig::from_env()?;

        let invoker = InvokerConfig {
            base_url: env::var("INVOKER_BASE_URL").ok().filter(|s| !s.is_empty()),
            api_key: env::var("INVOKER_API_KEY").ok().filter(|s| !s.is_empty()),
            timeout_ms: parse_env("INVOKER_TIMEOUT_MS")?.unwrap_or(30000),
        };

        let database = DatabaseConfig {
            path: PathBuf::from(
                env::var("DATABASE_PATH").unwrap_or_else(|_| "./data/engine.db".to_string()),
            ),
            max_connections: parse_env("DATABASE_MAX_CONNECTIONS")?.unwrap_or(5),
        };

        let logging = LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "pretty".to_string())
                .to_lowercase()
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        };

        let artifacts = ArtifactConfig {
            enabled: env::var("ARTIFACTS_ENABLED")
                .map(|v| v.to_lowercase() != "false")
                .unwrap_or(true),
            dir: PathBuf::from(
                env::var("ARTIFACTS_DIR").unwrap_or_else(|_| "./artifacts".to_string()),
            ),
        };

        Ok(Config {
            engine,
            meta,
            invoker,
            database,
            logging,
            artifacts,
        })
    }
}

/// Parse an optional environment variable; a present but malformed value is an error.
pub(crate) fn parse_env<T: FromStr>(key: &str) -> EngineResult<Option<T>> {
    match env::var(key) {
        Ok(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
            EngineError::config(format!("{} has an invalid value: '{}'", key, raw))
        }),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(env::VarError::NotUnicode(_)) => Err(EngineError::config(format!(
            "{} is not valid unicode",
            key
        ))),
    }
}

pub(crate) fn set_from_env<T: FromStr>(slot: &mut T, key: &str) -> EngineResult<()> {
    if let Some(value) = parse_env(key)? {
        *slot = value;
    }
    Ok(())
}

fn parse_pairs(raw: &str) -> EngineResult<Vec<(String, String)>> {
    raw.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|pair| {
            pair.split_once(':')
                .map(|(a, b)| (a.trim().to_lowercase(), b.trim().to_lowercase()))
                .filter(|(a, b)| !a.is_empty() && !b.is_empty())
                .ok_or_else(|| {
                    EngineError::config(format!(
                        "ENGINE_CONTRADICTION_PAIRS entry '{}' must look like 'a:b'",
                        pair
                    ))
                })
        })
        .collect()
}

use crate::models::StrategyKind;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    pub service: ServiceConfig,
    pub profile: ProfileConfig,
    pub cache: CacheConfig,
    pub orchestration: OrchestrationConfig,
    pub weights: StrategyWeights,
    pub exploration: ExplorationConfig,
    pub social: SocialConfig,
    pub feedback: FeedbackConfig,
    pub signals: SignalsConfig,
    pub oracle: OracleConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub service_name: String,
    /// JSON array of catalog books loaded at start-up
    pub catalog_path: Option<String>,
    /// `json` switches the log formatter
    pub log_format: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            service_name: "book-recommendation-service".to_string(),
            catalog_path: None,
            log_format: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProfileConfig {
    /// Smoothing factor of the interest update
    pub alpha: f64,
    /// Recent interaction window capacity
    pub window_capacity: usize,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            alpha: 0.3,
            window_capacity: 200,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { ttl_secs: 15 * 60 }
    }
}

/// One year; longer TTLs are clamped
const MAX_TTL_SECS: u64 = 365 * 24 * 60 * 60;

impl CacheConfig {
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.ttl_secs.min(MAX_TTL_SECS) as i64)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestrationConfig {
    /// Overall budget for one fan-out
    pub generator_timeout_ms: u64,
    /// Budget for one scoring oracle call
    pub oracle_timeout_ms: u64,
    pub default_count: usize,
    pub max_count: usize,
    /// Share of the oracle score in the refined personalized score
    pub oracle_blend: f64,
    /// Completions and rejections older than this no longer exclude a book
    pub active_window_days: i64,
    /// Max candidates a single generator may emit
    pub candidate_pool: usize,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            generator_timeout_ms: 3000,
            oracle_timeout_ms: 800,
            default_count: 10,
            max_count: 50,
            oracle_blend: 0.5,
            active_window_days: 90,
            candidate_pool: 200,
        }
    }
}

impl OrchestrationConfig {
    pub fn generator_timeout(&self) -> Duration {
        Duration::from_millis(self.generator_timeout_ms)
    }

    pub fn oracle_timeout(&self) -> Duration {
        Duration::from_millis(self.oracle_timeout_ms)
    }

    pub fn active_window(&self) -> chrono::Duration {
        chrono::Duration::days(self.active_window_days)
    }
}

/// Per-strategy weights of the merge sum
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StrategyWeights {
    pub personalized: f64,
    pub contextual: f64,
    pub sequential: f64,
    pub multi_objective: f64,
    pub exploratory: f64,
    pub social: f64,
    pub group: f64,
}

impl Default for StrategyWeights {
    fn default() -> Self {
        Self {
            personalized: 1.0,
            contextual: 1.0,
            sequential: 1.0,
            multi_objective: 1.0,
            exploratory: 1.0,
            social: 1.0,
            group: 1.0,
        }
    }
}

impl StrategyWeights {
    pub fn weight(&self, kind: StrategyKind) -> f64 {
        match kind {
            StrategyKind::Personalized => self.personalized,
            StrategyKind::Contextual => self.contextual,
            StrategyKind::Sequential => self.sequential,
            StrategyKind::MultiObjective => self.multi_objective,
            StrategyKind::Exploratory => self.exploratory,
            StrategyKind::Social => self.social,
            StrategyKind::Group => self.group,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExplorationConfig {
    /// Books at or below this popularity percentile form the long tail
    pub long_tail_quantile: f64,
}

impl Default for ExplorationConfig {
    fn default() -> Self {
        Self {
            long_tail_quantile: 0.3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SocialConfig {
    pub top_k_users: usize,
    /// Minimum signal weight for a neighbour interaction to count as an endorsement
    pub min_positive_weight: f64,
}

impl Default for SocialConfig {
    fn default() -> Self {
        Self {
            top_k_users: 10,
            min_positive_weight: 0.5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedbackConfig {
    /// Served recommendations kept per user for strategy attribution
    pub attribution_capacity: usize,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            attribution_capacity: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SignalsConfig {
    /// Recently seen signal ids remembered for duplicate suppression
    pub dedup_capacity: usize,
}

impl Default for SignalsConfig {
    fn default() -> Self {
        Self {
            dedup_capacity: 10_000,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    /// Scoring endpoint; the dot-product baseline is used alone when unset
    pub url: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();

        Ok(Config {
            service: envy::from_env()?,
            profile: envy::prefixed("PROFILE_").from_env()?,
            cache: envy::prefixed("CACHE_").from_env()?,
            orchestration: envy::prefixed("ORCHESTRATION_").from_env()?,
            weights: envy::prefixed("WEIGHT_").from_env()?,
            exploration: envy::prefixed("EXPLORATION_").from_env()?,
            social: envy::prefixed("SOCIAL_").from_env()?,
            feedback: envy::prefixed("FEEDBACK_").from_env()?,
            signals: envy::prefixed("SIGNALS_").from_env()?,
            oracle: envy::prefixed("ORACLE_").from_env()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = Config::default();
        assert!((config.profile.alpha - 0.3).abs() < f64::EPSILON);
        assert_eq!(config.profile.window_capacity, 200);
        assert_eq!(config.cache.ttl(), chrono::Duration::minutes(15));
        assert_eq!(config.orchestration.generator_timeout(), Duration::from_secs(3));
        assert_eq!(config.orchestration.oracle_timeout(), Duration::from_millis(800));
        assert_eq!(config.orchestration.default_count, 10);
        assert_eq!(config.orchestration.max_count, 50);
        assert_eq!(config.weights.weight(StrategyKind::Social), 1.0);
    }

    #[test]
    fn test_prefixed_section_overrides() {
        let vars = vec![
            ("PROFILE_ALPHA".to_string(), "0.5".to_string()),
            ("PROFILE_WINDOW_CAPACITY".to_string(), "20".to_string()),
        ];
        let profile: ProfileConfig = envy::prefixed("PROFILE_").from_iter(vars).unwrap();
        assert!((profile.alpha - 0.5).abs() < f64::EPSILON);
        assert_eq!(profile.window_capacity, 20);

        let weights: StrategyWeights = envy::prefixed("WEIGHT_")
            .from_iter(vec![("WEIGHT_SOCIAL".to_string(), "2.5".to_string())])
            .unwrap();
        assert_eq!(weights.weight(StrategyKind::Social), 2.5);
        assert_eq!(weights.weight(StrategyKind::Personalized), 1.0);
    }

    #[test]
    fn test_extreme_ttl_is_clamped() {
        let cache = CacheConfig { ttl_secs: u64::MAX };
        assert_eq!(cache.ttl(), chrono::Duration::days(365));
    }
}

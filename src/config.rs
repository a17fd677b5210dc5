/**
 * Tunable parameters for the engine, read from `config.toml` in the data directory.
 *
 * Every field has a default, so an absent file or a file that sets only a few keys is
 * fine.
 */
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use super::common::{QuizError, Result};
use super::retry::RetryPolicy;

pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const DATABASE_FILE_NAME: &str = "examdrill.sqlite3";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub selection: SelectionConfig,
    pub tracker: TrackerConfig,
    pub pool: PoolConfig,
    pub session: SessionConfig,
    pub generation: GenerationConfig,
    pub concurrency: ConcurrencyConfig,
}

/// Weights and filters for the per-bucket candidate scoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    pub quality_floor: u8,
    pub recent_window_days: i64,
    /// How many candidates to fetch per requested question.
    pub candidate_multiplier: usize,
    pub new_question_bonus: f64,
    pub weak_area_bonus: f64,
    pub spaced_rep_bonus: f64,
    pub quality_weight: f64,
    pub max_jitter: f64,
    /// Accuracy (percent) below which a question counts as a weak area.
    pub weak_accuracy_threshold: f64,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        SelectionConfig {
            quality_floor: 50,
            recent_window_days: 7,
            candidate_multiplier: 3,
            new_question_bonus: 40.0,
            weak_area_bonus: 30.0,
            spaced_rep_bonus: 20.0,
            quality_weight: 0.5,
            max_jitter: 10.0,
            weak_accuracy_threshold: 70.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub mastery_min_attempts: u32,
    pub mastery_min_accuracy: f64,
    pub mastery_min_streak: u32,
    /// Longest gap between reviews, however easy a question has become.
    pub max_interval_days: i64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        TrackerConfig {
            mastery_min_attempts: 5,
            mastery_min_accuracy: 90.0,
            mastery_min_streak: 3,
            max_interval_days: 365,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub min_active_blueprints: usize,
    pub assignment_ttl_hours: i64,
    pub retire_after_days: i64,
    pub retire_min_uses: usize,
    pub retire_quality_floor: u8,
    pub questions_per_blueprint: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            min_active_blueprints: 10,
            assignment_ttl_hours: 24,
            retire_after_days: 180,
            retire_min_uses: 5,
            retire_quality_floor: 30,
            questions_per_blueprint: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub inactivity_timeout_hours: i64,
    pub strength_threshold: f64,
    pub weakness_threshold: f64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            inactivity_timeout_hours: 24,
            strength_threshold: 80.0,
            weakness_threshold: 60.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// External program that produces questions. Generation is disabled when empty.
    pub command: Vec<String>,
    pub max_retries: u32,
    pub backoff_ms: u64,
    /// Quality score given to generated questions before anyone has answered them.
    pub initial_quality_score: u8,
    pub knowledge_results: usize,
    pub knowledge_min_score: f64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        GenerationConfig {
            command: Vec::new(),
            max_retries: 2,
            backoff_ms: 500,
            initial_quality_score: 70,
            knowledge_results: 5,
            knowledge_min_score: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    pub max_retries: u32,
    pub backoff_ms: u64,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        ConcurrencyConfig {
            max_retries: 3,
            backoff_ms: 50,
        }
    }
}

impl GenerationConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, Duration::from_millis(self.backoff_ms))
    }
}

impl ConcurrencyConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, Duration::from_millis(self.backoff_ms))
    }
}

impl Config {
    /// Load `config.toml` from `dir`, falling back to defaults if it does not exist.
    pub fn load(dir: &Path) -> Result<Config> {
        let path = dir.join(CONFIG_FILE_NAME);
        if !path.exists() {
            debug!("no configuration at {}, using defaults", path.display());
            return Ok(Config::default());
        }

        let data = fs::read_to_string(&path)?;
        let config = Config::parse(&data)?;
        info!("loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn parse(data: &str) -> Result<Config> {
        toml::from_str(data).map_err(QuizError::Config)
    }
}

/// The directory that holds the database and configuration, creating it if needed.
pub fn require_data_dir(directory: Option<&Path>) -> Result<PathBuf> {
    let dir = match directory {
        Some(dir) => dir.to_path_buf(),
        None => {
            let mut dir = dirs::data_dir().ok_or_else(|| {
                QuizError::InvalidArgument(String::from("could not locate a data directory"))
            })?;
            dir.push("examdrill");
            dir
        }
    };

    if !dir.exists() {
        fs::create_dir_all(&dir)?;
    }
    Ok(dir)
}

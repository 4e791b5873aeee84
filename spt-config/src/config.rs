use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;

/// Batching parameters for one model subscription point. Fixed at load time.
#[derive(Debug, Deserialize, Serialize, JsonSchema, Clone)]
#[serde(deny_unknown_fields)]
pub struct BatchSettings {
    /// Maximum number of prediction requests coalesced into one model call.
    pub max_size: usize,

    /// How long to wait for more requests after the first one arrives, in
    /// nanoseconds. Sub-millisecond values are honored by the flush timer.
    #[serde(default = "default_batch_timeout_ns")]
    pub timeout_ns: u64,
}

fn default_batch_timeout_ns() -> u64 {
    50_000_000
}

#[derive(Debug, Deserialize, Serialize, JsonSchema, Clone)]
#[serde(deny_unknown_fields)]
pub struct PoolSettings {
    /// Number of games kept in flight at all times.
    pub num_threads: usize,

    /// Turn cap per game. Games hitting the cap count as ties.
    #[serde(default = "default_max_turns")]
    pub max_turns: Option<u32>,

    /// Sample per-game debug logs instead of emitting all of them.
    /// Logs for errored games are always retained.
    #[serde(default = "default_reduce_logs")]
    pub reduce_logs: bool,

    /// Capacity of the bounded result queue. The pool never pulls more than
    /// `num_threads + high_water_mark` tasks ahead of the consumer.
    #[serde(default = "default_high_water_mark")]
    pub high_water_mark: usize,
}

fn default_max_turns() -> Option<u32> {
    Some(500)
}

fn default_reduce_logs() -> bool {
    false
}

fn default_high_water_mark() -> usize {
    8
}

#[derive(Debug, Deserialize, Serialize, JsonSchema, Clone)]
#[serde(deny_unknown_fields)]
pub struct ExplorationSettings {
    /// Exploration probability at episode 0.
    #[serde(default = "default_exploration_start")]
    pub start: f64,

    /// Multiplicative decay applied per episode.
    #[serde(default = "default_exploration_decay")]
    pub decay: f64,

    /// Floor the schedule never goes below.
    #[serde(default = "default_exploration_min")]
    pub min: f64,
}

fn default_exploration_start() -> f64 {
    0.5
}

fn default_exploration_decay() -> f64 {
    0.95
}

fn default_exploration_min() -> f64 {
    0.05
}

impl Default for ExplorationSettings {
    fn default() -> Self {
        ExplorationSettings {
            start: default_exploration_start(),
            decay: default_exploration_decay(),
            min: default_exploration_min(),
        }
    }
}

impl ExplorationSettings {
    pub fn factor_at(&self, episode: u64) -> f64 {
        (self.start * self.decay.powi(episode as i32)).max(self.min)
    }
}

#[derive(Debug, Deserialize, Serialize, JsonSchema, Clone)]
#[serde(deny_unknown_fields)]
pub struct LearnSettings {
    pub batch_size: usize,

    pub epochs: usize,

    pub learning_rate: f32,
}

#[derive(Debug, Deserialize, Serialize, JsonSchema, Clone)]
#[serde(deny_unknown_fields)]
pub struct TrainingSettings {
    /// Self-play games to collect per rollout phase.
    pub rollout_games: u64,

    /// Cut-off time for one rollout phase in seconds.
    #[serde(default = "default_max_rollout_time")]
    pub max_rollout_time_s: Option<u64>,

    /// How often the rollout progress reporter wakes up.
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,

    #[serde(default)]
    pub exploration: ExplorationSettings,

    /// Probability that the rollout opponent is the frozen previous version
    /// instead of the current policy. Adds opponent diversity.
    #[serde(default = "default_previous_opponent_prob")]
    pub previous_opponent_prob: f64,

    /// How many experience records the replay buffer retains.
    pub replay_capacity: usize,

    /// Minimum number of buffered records before a learn phase may start.
    #[serde(default = "default_replay_min_prefill")]
    pub replay_min_prefill: usize,

    /// Discount applied per remaining turn when converting a game outcome
    /// into per-move returns.
    #[serde(default = "default_return_discount")]
    pub return_discount: f32,

    pub learn: LearnSettings,
}

fn default_max_rollout_time() -> Option<u64> {
    Some(5 * 60)
}

fn default_progress_interval_ms() -> u64 {
    2_000
}

fn default_previous_opponent_prob() -> f64 {
    0.2
}

fn default_replay_min_prefill() -> usize {
    0
}

fn default_return_discount() -> f32 {
    0.99
}

#[derive(Debug, Deserialize, Serialize, JsonSchema, Clone)]
#[serde(deny_unknown_fields)]
pub struct EvaluationSettings {
    /// Scored games per opponent (previous version and random baseline).
    #[serde(default = "default_evaluation_games")]
    pub games: u64,
}

fn default_evaluation_games() -> u64 {
    16
}

impl Default for EvaluationSettings {
    fn default() -> Self {
        EvaluationSettings {
            games: default_evaluation_games(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, JsonSchema, Clone)]
#[serde(deny_unknown_fields)]
pub struct CheckpointSettings {
    /// Write a checkpoint every N episodes.
    #[serde(default = "default_checkpoint_interval")]
    pub interval: u64,

    /// Keep every episode checkpoint instead of only the latest.
    #[serde(default = "default_keep_all")]
    pub keep_all: bool,
}

fn default_checkpoint_interval() -> u64 {
    1
}

fn default_keep_all() -> bool {
    false
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        CheckpointSettings {
            interval: default_checkpoint_interval(),
            keep_all: default_keep_all(),
        }
    }
}

/// Named seeds so a run with concurrency disabled (num_threads = 1) is fully
/// reproducible.
#[derive(Debug, Deserialize, Serialize, JsonSchema, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct SeedSettings {
    #[serde(default)]
    pub model_init: u64,

    #[serde(default)]
    pub battle: u64,

    #[serde(default)]
    pub exploration: u64,

    #[serde(default)]
    pub shuffle: u64,
}

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Name of the run, used for storing checkpoints, logs and metrics.
    pub run_name: String,

    /// Base directory for 'run_name' artifacts.
    #[serde(default = "default_base_dir")]
    pub base_dir: String,

    /// Whether to overwrite existing run artifacts. Be careful with this!
    #[serde(default = "default_overwrite_run")]
    pub overwrite_run: bool,

    /// How many rollout-learn-evaluate episodes to perform.
    /// If null, runs indefinitely, till the user stops the process.
    pub number_of_episodes: Option<u64>,

    pub batch: BatchSettings,

    pub pool: PoolSettings,

    pub training: TrainingSettings,

    #[serde(default)]
    pub evaluation: EvaluationSettings,

    #[serde(default)]
    pub checkpoint: CheckpointSettings,

    #[serde(default)]
    pub seeds: SeedSettings,
}

fn default_base_dir() -> String {
    "runs".to_string()
}

fn default_overwrite_run() -> bool {
    false
}

impl AppConfig {
    /// Loads configuration from a YAML file.
    pub fn load(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let file = std::fs::File::open(path)?;
        let config: Self = serde_yaml::from_reader(file)?;
        config.validate()?;

        info!("Configuration from '{}' loaded:\n{:#?}", &path, config);

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.batch.max_size == 0 {
            return Err("batch.max_size must be positive".into());
        }
        if self.pool.num_threads == 0 {
            return Err("pool.num_threads must be positive".into());
        }
        if let Some(0) = self.pool.max_turns {
            return Err("pool.max_turns must be positive when set".into());
        }
        if self.training.replay_capacity == 0 {
            return Err("training.replay_capacity must be positive".into());
        }
        if self.training.learn.batch_size == 0 {
            return Err("training.learn.batch_size must be positive".into());
        }
        if !(0.0..=1.0).contains(&self.training.previous_opponent_prob) {
            return Err("training.previous_opponent_prob must be in [0, 1]".into());
        }
        let exploration = &self.training.exploration;
        if !(0.0..=1.0).contains(&exploration.start) {
            return Err("training.exploration.start must be in [0, 1]".into());
        }
        if !(0.0..=1.0).contains(&exploration.min) {
            return Err("training.exploration.min must be in [0, 1]".into());
        }
        if !(0.0..=1.0).contains(&exploration.decay) {
            return Err("training.exploration.decay must be in [0, 1]".into());
        }

        Ok(())
    }

    pub fn save_to_file(&self, path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
        let file = std::fs::File::create(path)?;
        serde_yaml::to_writer(file, self)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL_YAML: &str = r#"
run_name: smoke
number_of_episodes: 2
batch:
  max_size: 4
pool:
  num_threads: 2
training:
  rollout_games: 8
  replay_capacity: 512
  learn:
    batch_size: 16
    epochs: 2
    learning_rate: 0.01
"#;

    #[test]
    fn minimal_yaml_fills_defaults() {
        let config: AppConfig = serde_yaml::from_str(MINIMAL_YAML).unwrap();
        config.validate().unwrap();

        assert_eq!(config.batch.timeout_ns, 50_000_000);
        assert_eq!(config.pool.high_water_mark, 8);
        assert_eq!(config.checkpoint.interval, 1);
        assert!(!config.checkpoint.keep_all);
        assert_eq!(config.evaluation.games, 16);
        assert_eq!(config.seeds.model_init, 0);
    }

    #[test]
    fn unknown_field_is_rejected() {
        let yaml = format!("{MINIMAL_YAML}\nnot_a_field: 1\n");
        assert!(serde_yaml::from_str::<AppConfig>(&yaml).is_err());
    }

    #[test]
    fn zero_batch_size_fails_validation() {
        let yaml = MINIMAL_YAML.replace("max_size: 4", "max_size: 0");
        let config: AppConfig = serde_yaml::from_str(&yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn out_of_range_exploration_fails_validation() {
        // The schedule feeds a probability; values outside [0, 1] would only
        // blow up deep inside a game task otherwise.
        let yaml = format!(
            "{MINIMAL_YAML}  exploration:\n    start: 1.5\n"
        );
        let config: AppConfig = serde_yaml::from_str(&yaml).unwrap();
        assert!(config.validate().is_err());

        let yaml = format!("{MINIMAL_YAML}  exploration:\n    min: -0.1\n");
        let config: AppConfig = serde_yaml::from_str(&yaml).unwrap();
        assert!(config.validate().is_err());

        let yaml = format!("{MINIMAL_YAML}  exploration:\n    decay: 1.05\n");
        let config: AppConfig = serde_yaml::from_str(&yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn exploration_schedule_decays_to_floor() {
        let exploration = ExplorationSettings::default();
        assert!((exploration.factor_at(0) - 0.5).abs() < 1e-9);
        assert!(exploration.factor_at(1) < exploration.factor_at(0));
        assert!((exploration.factor_at(1_000) - 0.05).abs() < 1e-9);
    }
}

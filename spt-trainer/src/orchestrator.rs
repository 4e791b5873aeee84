use crate::episode_log::{EpisodeLog, Record};
use crate::evaluate::{run_evaluation, WinLossTie};
use crate::game::Game;
use crate::metrics::MetricsRecorder;
use crate::pool::run_game_pool;
use crate::replay::ReplayBuffer;
use crate::reporter::{spawn_progress_reporter, RolloutLimits};
use crate::self_play::{Agent, GameTask, Policy};
use anyhow::Context;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use spt_config::config::AppConfig;
use spt_core::endpoint::ChannelEndpoint;
use spt_core::net::{LearnConfig, NetworkSpawner};
use spt_core::protocol::{MetricsWindow, ModelRequest, ReplyPayload};
use spt_core::registry::{spawn_registry, BatchConfig};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// The copy being trained. Never serves predictions.
const MAIN: &str = "main";
/// Serving copy of `main` used by self-play workers.
const ROLLOUT: &str = "rollout";
/// Frozen copy from the previous episode, used as a sparring opponent and as
/// the evaluation baseline.
const PREVIOUS: &str = "previous";
/// Frozen copy of `main` taken at the start of each learn phase, available to
/// value-target bootstrapping.
const TARGET: &str = "target";

const SELFPLAY_SCOPE: &str = "selfplay";

async fn ack(control: &ChannelEndpoint, request: ModelRequest) -> anyhow::Result<()> {
    match control.request(request).await? {
        ReplyPayload::Ack => Ok(()),
        other => anyhow::bail!("expected an ack, got {other:?}"),
    }
}

async fn unlock(control: &ChannelEndpoint, name: &str) -> anyhow::Result<MetricsWindow> {
    match control
        .request(ModelRequest::Unlock {
            name: name.to_string(),
        })
        .await?
    {
        ReplyPayload::MetricsWindow(window) => Ok(window),
        other => anyhow::bail!("expected a metrics window, got {other:?}"),
    }
}

/// Highest-numbered checkpoint in `dir`, if any.
fn latest_checkpoint(dir: &Path) -> anyhow::Result<Option<(u64, PathBuf)>> {
    if !dir.exists() {
        return Ok(None);
    }

    let mut latest: Option<(u64, PathBuf)> = None;
    for entry in std::fs::read_dir(dir).with_context(|| format!("Failed to list {dir:?}"))? {
        let path = entry?.path();
        let episode = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u64>().ok());

        if let Some(episode) = episode {
            if latest.as_ref().is_none_or(|(e, _)| episode > *e) {
                latest = Some((episode, path));
            }
        }
    }

    Ok(latest)
}

struct FinishedEvaluation {
    episode: u64,
    vs_previous: WinLossTie,
    vs_random: WinLossTie,
    seconds: f64,
}

/// Runs the rollout, learn and evaluate episode loop until the configured
/// number of episodes is reached (or forever when unset).
///
/// Within an episode the phases are strictly ordered; evaluation is the one
/// exception and overlaps the next episode's rollout, but it is always awaited
/// before the next learn so its serving traffic never races a weight update.
pub async fn run_training<G: Game>(
    config: AppConfig,
    run_dir: PathBuf,
    spawner: Arc<dyn NetworkSpawner>,
) -> anyhow::Result<()> {
    let registry = spawn_registry(
        spawner,
        BatchConfig::new(config.batch.max_size, config.batch.timeout_ns),
    );
    let control = registry.controller().await?;

    let mut episode_log = EpisodeLog::new(run_dir.join("training_log.csv"))?;
    let mut metrics = MetricsRecorder::new(run_dir.join("metrics.csv"))?;

    let checkpoint_dir = run_dir.join("checkpoints");
    std::fs::create_dir_all(&checkpoint_dir)
        .with_context(|| format!("Failed to create {checkpoint_dir:?}"))?;

    let resume = latest_checkpoint(&checkpoint_dir)?;
    if let Some((episode, path)) = &resume {
        info!("Resuming weights from checkpoint {path:?} (episode {episode})");
    }

    ack(
        &control,
        ModelRequest::Load {
            name: MAIN.to_string(),
            source: resume.map(|(_, path)| path),
            seed: Some(config.seeds.model_init),
        },
    )
    .await?;

    for copy in [ROLLOUT, PREVIOUS, TARGET] {
        ack(
            &control,
            ModelRequest::CloneModel {
                name: MAIN.to_string(),
                new_name: copy.to_string(),
            },
        )
        .await?;
    }

    let rollout_worker = Arc::new(registry.subscribe(ROLLOUT).await?);
    let previous_worker = Arc::new(registry.subscribe(PREVIOUS).await?);

    let replay = Arc::new(Mutex::new(ReplayBuffer::new(config.training.replay_capacity)));

    let first_episode = episode_log.last_episode().map_or(0, |last| last + 1);
    if first_episode > 0 {
        warn!("Resuming training from episode {first_episode}");
    }

    let mut pending_eval: Option<JoinHandle<FinishedEvaluation>> = None;
    let mut last_eval: Option<FinishedEvaluation> = None;

    let mut episode = first_episode;
    loop {
        if let Some(total) = config.number_of_episodes {
            if episode >= total {
                info!("Reached the configured number of episodes: {total}");
                break;
            }
        }

        let rollout_started = Instant::now();
        let exploration = config.training.exploration.factor_at(episode);

        for name in [ROLLOUT, PREVIOUS] {
            ack(
                &control,
                ModelRequest::Lock {
                    name: name.to_string(),
                    scope: SELFPLAY_SCOPE.to_string(),
                    step: episode,
                },
            )
            .await?;
        }

        // Rollout: self-play games stream experience into the replay buffer
        // until the reporter raises the stop signal.
        let stop = Arc::new(AtomicBool::new(false));
        let games = Arc::new(AtomicU64::new(0));
        let samples = Arc::new(AtomicU64::new(0));

        let reporter = spawn_progress_reporter(
            games.clone(),
            samples.clone(),
            RolloutLimits {
                target_games: config.training.rollout_games,
                max_time: config.training.max_rollout_time_s.map(Duration::from_secs),
            },
            Duration::from_millis(config.training.progress_interval_ms),
            stop.clone(),
        );

        let seed_base = config
            .seeds
            .battle
            .wrapping_add(episode.wrapping_mul(1_000_003));
        let mut opponent_rng =
            StdRng::seed_from_u64(config.seeds.exploration.wrapping_add(episode));

        let self_agent = Agent {
            endpoint: Some(rollout_worker.clone()),
            policy: Policy::Mixed {
                explore_prob: exploration,
            },
            collect: true,
        };
        let sparring_agent = Agent {
            endpoint: Some(previous_worker.clone()),
            policy: Policy::Exploit,
            collect: false,
        };

        let pool_outcome = run_game_pool::<G, _, _, _>(
            config.pool.num_threads,
            config.pool.high_water_mark,
            config.pool.reduce_logs,
            stop.clone(),
            |i| {
                let seed = seed_base.wrapping_add(i);
                let away = if opponent_rng.random_bool(config.training.previous_opponent_prob) {
                    sparring_agent.clone()
                } else {
                    self_agent.clone()
                };

                Some(GameTask {
                    seed,
                    home: self_agent.clone(),
                    away,
                    max_turns: config.pool.max_turns,
                    return_discount: config.training.return_discount,
                    exploration_seed: config.seeds.exploration ^ seed,
                    game: PhantomData,
                })
            },
            |result| {
                let replay = replay.clone();
                let games = games.clone();
                let samples = samples.clone();
                async move {
                    games.fetch_add(1, Ordering::Relaxed);
                    samples.fetch_add(result.experience.len() as u64, Ordering::Relaxed);
                    replay.lock().expect("replay buffer poisoned").extend(result.experience);
                }
            },
        )
        .await;

        reporter.await.context("progress reporter panicked")?;
        let rollout_seconds = rollout_started.elapsed().as_secs_f64();

        info!(
            "Rollout {episode} done: {} games, {} samples in {rollout_seconds:.1}s",
            pool_outcome.finished,
            samples.load(Ordering::Relaxed)
        );

        // The previous episode's evaluation served through `rollout`; settle
        // it before `main` learns and the serving copies move.
        if let Some(handle) = pending_eval.take() {
            let finished = handle.await.context("evaluation task panicked")?;
            record_evaluation(&mut metrics, &finished)?;
            last_eval = Some(finished);
        }

        // Learn on the buffered experience snapshot.
        let learn_started = Instant::now();
        let snapshot = replay.lock().expect("replay buffer poisoned").snapshot();
        let mut mean_loss = 0.0f64;

        if snapshot.is_empty() || snapshot.len() < config.training.replay_min_prefill {
            info!(
                "Skipping learn phase: {} buffered samples, {} required",
                snapshot.len(),
                config.training.replay_min_prefill
            );
        } else {
            let mut rx = control.request_streaming(ModelRequest::Learn {
                name: MAIN.to_string(),
                samples: snapshot,
                config: LearnConfig {
                    batch_size: config.training.learn.batch_size,
                    epochs: config.training.learn.epochs,
                    learning_rate: config.training.learn.learning_rate,
                    shuffle_seed: config.seeds.shuffle.wrapping_add(episode),
                },
            })?;

            loop {
                let reply = rx
                    .recv()
                    .await
                    .context("learn stream closed before completion")?;
                match reply.result.map_err(anyhow::Error::msg)? {
                    ReplyPayload::LearnProgress(progress) => {
                        debug!(
                            "Learn epoch {} done: {} batches, loss {:.5}",
                            progress.epoch, progress.batches, progress.epoch_loss
                        );
                    }
                    ReplyPayload::LearnDone(summary) => {
                        mean_loss = summary.mean_loss as f64;
                        metrics.record("learn/mean_loss", episode, mean_loss)?;
                        metrics.record("learn/batches", episode, summary.batches as f64)?;
                        info!(
                            "Learn {episode} done: {} epochs, {} batches, mean loss {:.5} in {}ms",
                            summary.epochs, summary.batches, summary.mean_loss, summary.duration_ms
                        );
                        break;
                    }
                    other => anyhow::bail!("unexpected learn reply {other:?}"),
                }
            }
        }
        let learn_seconds = learn_started.elapsed().as_secs_f64();

        for (name, prefix) in [(ROLLOUT, "selfplay/rollout"), (PREVIOUS, "selfplay/previous")] {
            let window = unlock(&control, name).await?;
            metrics.record_window(prefix, &window)?;
        }

        // Rotate the serving copies: yesterday's policy becomes the sparring
        // opponent, the freshly learned weights go out to serve.
        for (from, to) in [(ROLLOUT, PREVIOUS), (MAIN, ROLLOUT), (MAIN, TARGET)] {
            ack(
                &control,
                ModelRequest::CopyTo {
                    from: from.to_string(),
                    to: to.to_string(),
                },
            )
            .await?;
        }

        if episode % config.checkpoint.interval == 0 {
            let path = checkpoint_dir.join(format!("{episode:06}.json"));
            ack(
                &control,
                ModelRequest::Save {
                    name: MAIN.to_string(),
                    path: path.clone(),
                },
            )
            .await?;
            info!("Checkpoint written to {path:?}");

            if !config.checkpoint.keep_all {
                prune_checkpoints(&checkpoint_dir, episode)?;
            }
        }

        // Evaluation overlaps the next rollout; it is awaited before the next
        // learn phase.
        if config.evaluation.games > 0 {
            pending_eval = Some(spawn_evaluation::<G>(
                episode,
                &config,
                rollout_worker.clone(),
                previous_worker.clone(),
            ));
        }

        metrics.record("rollout/games", episode, pool_outcome.finished as f64)?;
        metrics.record(
            "rollout/samples",
            episode,
            samples.load(Ordering::Relaxed) as f64,
        )?;
        metrics.record("rollout/seconds", episode, rollout_seconds)?;
        metrics.record("learn/seconds", episode, learn_seconds)?;
        if let Some(resident_mb) = spt_util::mem::resident_memory_mb() {
            metrics.record("process/resident_mb", episode, resident_mb)?;
        }

        let record = Record {
            episode,
            games_played: pool_outcome.finished,
            samples_collected: samples.load(Ordering::Relaxed),
            rollout_time_seconds: rollout_seconds,
            learn_time_seconds: learn_seconds,
            evaluation_time_seconds: last_eval.as_ref().map_or(0.0, |e| e.seconds),
            mean_loss,
            win_rate_vs_previous: last_eval.as_ref().map_or(0.0, |e| e.vs_previous.win_rate()),
            win_rate_vs_random: last_eval.as_ref().map_or(0.0, |e| e.vs_random.win_rate()),
            exploration_factor: exploration,
        };
        info!("Episode record: {record:#?}");
        episode_log.append(record)?;

        episode += 1;
    }

    if let Some(handle) = pending_eval.take() {
        let finished = handle.await.context("evaluation task panicked")?;
        record_evaluation(&mut metrics, &finished)?;
    }

    control.close().await.ok();

    Ok(())
}

fn spawn_evaluation<G: Game>(
    episode: u64,
    config: &AppConfig,
    rollout_worker: Arc<ChannelEndpoint>,
    previous_worker: Arc<ChannelEndpoint>,
) -> JoinHandle<FinishedEvaluation> {
    let games = config.evaluation.games;
    let num_threads = config.pool.num_threads;
    let high_water_mark = config.pool.high_water_mark;
    let max_turns = config.pool.max_turns;
    // Offset so evaluation seeds never collide with rollout seeds.
    let seed_base = config.seeds.battle.wrapping_add(0x00E7_A100_0000_0000);

    tokio::spawn(async move {
        let started = Instant::now();

        let vs_previous = run_evaluation::<G>()
            .games(games)
            .num_threads(num_threads)
            .high_water_mark(high_water_mark)
            .maybe_max_turns(max_turns)
            .candidate(rollout_worker.clone())
            .opponent(previous_worker)
            .seed_base(seed_base.wrapping_add(episode.wrapping_mul(2)))
            .call()
            .await;

        let vs_random = run_evaluation::<G>()
            .games(games)
            .num_threads(num_threads)
            .high_water_mark(high_water_mark)
            .maybe_max_turns(max_turns)
            .candidate(rollout_worker)
            .seed_base(seed_base.wrapping_add(episode.wrapping_mul(2) + 1))
            .call()
            .await;

        FinishedEvaluation {
            episode,
            vs_previous,
            vs_random,
            seconds: started.elapsed().as_secs_f64(),
        }
    })
}

fn record_evaluation(
    metrics: &mut MetricsRecorder,
    finished: &FinishedEvaluation,
) -> anyhow::Result<()> {
    info!(
        "Evaluation for episode {}: vs previous {:?} ({:.0}%), vs random {:?} ({:.0}%)",
        finished.episode,
        finished.vs_previous,
        finished.vs_previous.win_rate() * 100.0,
        finished.vs_random,
        finished.vs_random.win_rate() * 100.0
    );

    metrics.record(
        "eval/win_rate_vs_previous",
        finished.episode,
        finished.vs_previous.win_rate(),
    )?;
    metrics.record(
        "eval/win_rate_vs_random",
        finished.episode,
        finished.vs_random.win_rate(),
    )?;
    metrics.record("eval/seconds", finished.episode, finished.seconds)?;

    Ok(())
}

fn prune_checkpoints(dir: &Path, keep_episode: u64) -> anyhow::Result<()> {
    for entry in std::fs::read_dir(dir).with_context(|| format!("Failed to list {dir:?}"))? {
        let path = entry?.path();
        let episode = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u64>().ok());

        if let Some(episode) = episode {
            if episode != keep_episode {
                std::fs::remove_file(&path)
                    .with_context(|| format!("Failed to remove old checkpoint {path:?}"))?;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demo_game::NimGame;
    use spt_core::net::LinearSpawner;

    fn smoke_config(run_name: &str, episodes: u64) -> AppConfig {
        let yaml = format!(
            r#"
run_name: {run_name}
number_of_episodes: {episodes}
batch:
  max_size: 4
  timeout_ns: 1000000
pool:
  num_threads: 2
  max_turns: 64
  reduce_logs: true
training:
  rollout_games: 4
  max_rollout_time_s: 30
  progress_interval_ms: 25
  replay_capacity: 512
  learn:
    batch_size: 8
    epochs: 2
    learning_rate: 0.01
evaluation:
  games: 2
"#
        );
        serde_yaml::from_str(&yaml).unwrap()
    }

    #[tokio::test]
    async fn two_episode_smoke_run_produces_all_artifacts() {
        let run_dir = std::env::temp_dir().join(format!("spt-smoke-{}", std::process::id()));
        std::fs::remove_dir_all(&run_dir).ok();
        std::fs::create_dir_all(&run_dir).unwrap();

        let config = smoke_config("smoke", 2);
        run_training::<NimGame>(
            config,
            run_dir.clone(),
            Arc::new(LinearSpawner::new(NimGame::schema())),
        )
        .await
        .unwrap();

        let log = EpisodeLog::new(run_dir.join("training_log.csv")).unwrap();
        assert_eq!(log.last_episode(), Some(1));
        assert_eq!(log.records().len(), 2);
        assert!(log.records().iter().all(|r| r.games_played >= 4));
        assert!(log.records().iter().all(|r| r.samples_collected > 0));

        // keep_all defaults to false, so only the newest checkpoint survives.
        let checkpoints: Vec<_> = std::fs::read_dir(run_dir.join("checkpoints"))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(checkpoints, vec!["000001.json".to_string()]);

        let metrics = std::fs::read_to_string(run_dir.join("metrics.csv")).unwrap();
        assert!(metrics.contains("learn/mean_loss,0,"));
        assert!(metrics.contains("rollout/games,1,"));
        assert!(metrics.contains("selfplay/rollout/batch_size_mean,0,"));
        // The evaluation spawned for episode 0 lands during episode 1.
        assert!(metrics.contains("eval/win_rate_vs_previous,0,"));

        std::fs::remove_dir_all(&run_dir).ok();
    }

    #[tokio::test]
    async fn finished_run_restarts_as_a_no_op() {
        let run_dir = std::env::temp_dir().join(format!("spt-resume-{}", std::process::id()));
        std::fs::remove_dir_all(&run_dir).ok();
        std::fs::create_dir_all(&run_dir).unwrap();

        let spawner = Arc::new(LinearSpawner::new(NimGame::schema()));
        run_training::<NimGame>(smoke_config("resume", 1), run_dir.clone(), spawner.clone())
            .await
            .unwrap();

        // Same episode budget, already met: the loop body must not run again.
        run_training::<NimGame>(smoke_config("resume", 1), run_dir.clone(), spawner)
            .await
            .unwrap();

        let log = EpisodeLog::new(run_dir.join("training_log.csv")).unwrap();
        assert_eq!(log.records().len(), 1);

        std::fs::remove_dir_all(&run_dir).ok();
    }
}

use spt_util::math::safe_div;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, Instrument};

/// When a rollout phase ends: after this many games, or after this much wall
/// time, whichever comes first.
#[derive(Debug, Clone, Copy)]
pub struct RolloutLimits {
    pub target_games: u64,
    pub max_time: Option<Duration>,
}

/// Periodically logs rollout progress and raises the stop signal once a limit
/// is hit. The pool only polls the signal, so the reporter is the sole judge
/// of when a rollout phase is over.
pub fn spawn_progress_reporter(
    games: Arc<AtomicU64>,
    samples: Arc<AtomicU64>,
    limits: RolloutLimits,
    interval: Duration,
    stop_signal: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            let mut ticker = tokio::time::interval(interval);
            let start_time = Instant::now();

            let mut last_games = 0u64;
            let mut last_samples = 0u64;

            loop {
                ticker.tick().await;

                if stop_signal.load(Ordering::Relaxed) {
                    break;
                }

                let current_games = games.load(Ordering::Relaxed);
                let current_samples = samples.load(Ordering::Relaxed);
                let elapsed = start_time.elapsed();

                if current_games >= limits.target_games {
                    info!(
                        "Rollout complete. Reason: game target ({current_games} >= {}).",
                        limits.target_games
                    );
                    stop_signal.store(true, Ordering::Relaxed);
                    break;
                }

                if let Some(max_time) = limits.max_time {
                    if elapsed >= max_time {
                        info!(
                            "Rollout complete. Reason: time limit ({:.0}s >= {:.0}s) at {current_games} games.",
                            elapsed.as_secs_f64(),
                            max_time.as_secs_f64()
                        );
                        stop_signal.store(true, Ordering::Relaxed);
                        break;
                    }
                }

                if current_samples == last_samples {
                    info!(
                        "No new samples collected. Still at {current_samples} samples and {current_games} games."
                    );
                    continue;
                }

                let elapsed_seconds = elapsed.as_secs_f64();
                let games_per_sec = safe_div(current_games as f64, elapsed_seconds);
                let samples_per_sec = safe_div(current_samples as f64, elapsed_seconds);

                info!(
                    "[+{} samp. / +{} G.] {}/{} games ({:.1}%), {} samples. Speed {:.1} samp./s, {:.2} G/s.",
                    current_samples - last_samples,
                    current_games - last_games,
                    current_games,
                    limits.target_games,
                    (current_games as f64 / limits.target_games as f64) * 100.0,
                    current_samples,
                    samples_per_sec,
                    games_per_sec
                );

                last_games = current_games;
                last_samples = current_samples;
            }
        }
        .instrument(tracing::info_span!("Progress")),
    )
}

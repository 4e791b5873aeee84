use crate::game::Game;
use crate::self_play::{play_game, GameResult, GameTask};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

/// How often the pool re-checks the stop signal while nothing else happens.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolOutcome {
    /// Tasks pulled from the generator.
    pub started: u64,
    /// Results delivered to the consumer.
    pub finished: u64,
}

/// Plays games from `generator` with a fixed number in flight, delivering
/// results through a bounded queue to `on_result`.
///
/// A finished game parks on the queue until the consumer takes its result, and
/// its slot is not refilled while it parks; the pool therefore never runs more
/// than `num_threads + high_water_mark` tasks ahead of the consumer. When the
/// stop signal is raised, in-flight games are aborted and already-buffered
/// results are still delivered.
pub async fn run_game_pool<G, Gen, F, Fut>(
    num_threads: usize,
    high_water_mark: usize,
    reduce_logs: bool,
    stop_signal: Arc<AtomicBool>,
    mut generator: Gen,
    mut on_result: F,
) -> PoolOutcome
where
    G: Game,
    Gen: FnMut(u64) -> Option<GameTask<G>>,
    F: FnMut(GameResult) -> Fut,
    Fut: Future<Output = ()>,
{
    let (tx, mut rx) = mpsc::channel::<GameResult>(high_water_mark.max(1));
    let mut join_set: JoinSet<()> = JoinSet::new();
    let mut seeds: HashMap<tokio::task::Id, u64> = HashMap::new();

    let mut started = 0u64;
    let mut finished = 0u64;
    let mut exhausted = false;

    loop {
        let stopped = stop_signal.load(Ordering::Relaxed);

        if !stopped {
            while join_set.len() < num_threads && !exhausted {
                match generator(started) {
                    Some(task) => {
                        let tx = tx.clone();
                        let seed = task.seed;
                        let handle = join_set.spawn(async move {
                            let result = play_game(task).await;
                            let _ = tx.send(result).await;
                        });
                        seeds.insert(handle.id(), seed);
                        started += 1;
                    }
                    None => exhausted = true,
                }
            }
        }

        if stopped {
            join_set.abort_all();
            while let Some(joined) = join_set.join_next_with_id().await {
                if let Err(join_err) = joined {
                    if join_err.is_panic() {
                        let seed = seeds.remove(&join_err.id());
                        error!("Game task for seed {seed:?} panicked: {join_err}");
                    }
                }
            }
        }

        if join_set.is_empty() {
            break;
        }

        tokio::select! {
            joined = join_set.join_next_with_id() => {
                match joined {
                    Some(Ok((id, ()))) => {
                        seeds.remove(&id);
                    }
                    Some(Err(join_err)) => {
                        let seed = seeds.remove(&join_err.id());
                        if join_err.is_panic() {
                            error!("Game task for seed {seed:?} panicked: {join_err}");
                        }
                    }
                    None => {}
                }
            }
            Some(result) = rx.recv() => {
                finished += 1;
                log_result(&result, reduce_logs, finished);
                on_result(result).await;
            }
            _ = tokio::time::sleep(STOP_POLL_INTERVAL) => {}
        }
    }

    // Nothing produces anymore; deliver what is still buffered.
    drop(tx);
    while let Some(result) = rx.recv().await {
        finished += 1;
        log_result(&result, reduce_logs, finished);
        on_result(result).await;
    }

    debug!("Game pool done: {started} started, {finished} delivered");

    PoolOutcome { started, finished }
}

fn log_result(result: &GameResult, reduce_logs: bool, finished: u64) {
    if let Some(message) = &result.error {
        // Errored games are always worth a log line.
        warn!(
            "Game {} failed after {} turns: {message}",
            result.seed, result.turns
        );
    } else if !reduce_logs || finished % 16 == 0 {
        debug!(
            "Game {} finished: winner {:?} in {} turns, {} samples",
            result.seed,
            result.winner,
            result.turns,
            result.experience.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demo_game::NimGame;
    use crate::self_play::{Agent, Policy};
    use std::marker::PhantomData;
    use std::sync::atomic::AtomicU64;
    use std::sync::Mutex;

    fn random_task(seed: u64, max_turns: Option<u32>) -> GameTask<NimGame> {
        GameTask {
            seed,
            home: Agent::random(),
            away: Agent::random(),
            max_turns,
            return_discount: 0.9,
            exploration_seed: seed,
            game: PhantomData,
        }
    }

    #[tokio::test]
    async fn finite_generator_plays_every_task() {
        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = results.clone();

        let outcome = run_game_pool(
            2,
            4,
            false,
            Arc::new(AtomicBool::new(false)),
            |i| (i < 10).then(|| random_task(i, Some(100))),
            move |result| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push(result);
                }
            },
        )
        .await;

        assert_eq!(outcome, PoolOutcome { started: 10, finished: 10 });

        let results = results.lock().unwrap();
        assert_eq!(results.len(), 10);
        assert!(results.iter().all(|r| r.winner.is_some() && r.error.is_none()));

        let mut seeds: Vec<u64> = results.iter().map(|r| r.seed).collect();
        seeds.sort_unstable();
        assert_eq!(seeds, (0..10).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn producers_never_outrun_the_consumer_beyond_the_bound() {
        let num_threads = 3;
        let high_water_mark = 2;
        let pulled = Arc::new(AtomicU64::new(0));
        let delivered = Arc::new(AtomicU64::new(0));

        let pulled_gen = pulled.clone();
        let delivered_sink = delivered.clone();
        let pulled_sink = pulled.clone();

        let stop = Arc::new(AtomicBool::new(false));
        let stop_sink = stop.clone();

        run_game_pool(
            num_threads,
            high_water_mark,
            true,
            stop.clone(),
            move |i| {
                pulled_gen.fetch_add(1, Ordering::SeqCst);
                // Instant games: a one-turn cap resolves as a tie immediately.
                Some(random_task(i, Some(1)))
            },
            move |_result| {
                let delivered = delivered_sink.clone();
                let pulled = pulled_sink.clone();
                let stop = stop_sink.clone();
                async move {
                    // Slow consumer; fast producers pile up against the bound.
                    tokio::time::sleep(Duration::from_millis(15)).await;
                    let done = delivered.fetch_add(1, Ordering::SeqCst) + 1;

                    let ahead = pulled.load(Ordering::SeqCst) - done;
                    assert!(
                        ahead <= (num_threads + high_water_mark) as u64,
                        "pool ran {ahead} tasks ahead of the consumer"
                    );

                    if done >= 20 {
                        stop.store(true, Ordering::SeqCst);
                    }
                }
            },
        )
        .await;

        assert!(delivered.load(Ordering::SeqCst) >= 20);
    }

    #[tokio::test]
    async fn stop_signal_ends_an_infinite_generator() {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_setter = stop.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stop_setter.store(true, Ordering::SeqCst);
        });

        let outcome = run_game_pool(
            2,
            2,
            true,
            stop,
            |i| Some(random_task(i, Some(100))),
            |_result| async {},
        )
        .await;

        assert!(outcome.finished > 0, "nothing came through before the stop");
        assert!(outcome.finished <= outcome.started);
    }

    #[tokio::test]
    async fn errored_games_are_delivered_not_dropped() {
        let errors = Arc::new(AtomicU64::new(0));
        let errors_sink = errors.clone();

        run_game_pool(
            2,
            2,
            false,
            Arc::new(AtomicBool::new(false)),
            |i| {
                (i < 4).then(|| {
                    let mut task = random_task(i, Some(100));
                    // A model policy without an endpoint fails inside the game.
                    task.home.policy = Policy::Exploit;
                    task
                })
            },
            move |result| {
                let errors = errors_sink.clone();
                async move {
                    if result.error.is_some() {
                        errors.fetch_add(1, Ordering::SeqCst);
                    }
                }
            },
        )
        .await;

        assert_eq!(errors.load(Ordering::SeqCst), 4);
    }
}

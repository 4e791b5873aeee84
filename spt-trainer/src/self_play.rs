use crate::game::{Game, Side};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use spt_core::endpoint::ChannelEndpoint;
use spt_core::error::ProtocolError;
use spt_core::experience::Experience;
use std::sync::Arc;

/// How one side of a game picks its moves.
#[derive(Debug, Clone, Copy)]
pub enum Policy {
    /// Greedy argmax over the model's outputs for the legal actions.
    Exploit,
    /// Uniform random over the legal actions; no model involved.
    Random,
    /// Exploit, but pick a random legal action with the given probability.
    Mixed { explore_prob: f64 },
}

#[derive(Clone)]
pub struct Agent {
    /// Subscription to the model this side plays with. `None` is only valid
    /// for `Policy::Random`.
    pub endpoint: Option<Arc<ChannelEndpoint>>,
    pub policy: Policy,
    /// Whether this side's decisions are recorded as training experience.
    pub collect: bool,
}

impl Agent {
    pub fn random() -> Self {
        Agent {
            endpoint: None,
            policy: Policy::Random,
            collect: false,
        }
    }
}

pub struct GameTask<G: Game> {
    pub seed: u64,
    pub home: Agent,
    pub away: Agent,
    /// Games reaching the cap count as ties.
    pub max_turns: Option<u32>,
    pub return_discount: f32,
    pub exploration_seed: u64,
    pub game: std::marker::PhantomData<G>,
}

/// The finished game as seen by the pool consumer. An errored game carries the
/// failure message and no experience; its partial trajectory is discarded.
#[derive(Debug)]
pub struct GameResult {
    pub seed: u64,
    pub winner: Option<Side>,
    pub turns: u32,
    pub error: Option<String>,
    pub experience: Vec<Experience>,
}

struct Decision {
    side: Side,
    slots: Vec<ndarray::ArrayD<f32>>,
    action: usize,
    turn: u32,
}

enum PlayError {
    Protocol(ProtocolError),
    MissingEndpoint(Side),
}

impl std::fmt::Display for PlayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlayError::Protocol(e) => write!(f, "{e}"),
            PlayError::MissingEndpoint(side) => {
                write!(f, "{side:?} uses a model policy but has no endpoint")
            }
        }
    }
}

/// Plays one game to completion, issuing prediction requests as the driven
/// sides need them. Per-move returns are computed only once the outcome is
/// known.
pub async fn play_game<G: Game>(task: GameTask<G>) -> GameResult {
    let mut game = G::from_seed(task.seed);
    let mut rng = StdRng::seed_from_u64(task.exploration_seed);
    let mut decisions: Vec<Decision> = Vec::new();
    let mut turns = 0u32;

    let outcome = loop {
        if let Some(outcome) = game.outcome() {
            break Ok(outcome);
        }
        if task.max_turns.is_some_and(|cap| turns >= cap) {
            break Ok(None);
        }

        let side = game.to_move();
        let agent = match side {
            Side::Home => &task.home,
            Side::Away => &task.away,
        };

        let legal = game.legal_actions();
        if legal.is_empty() {
            // A side with no moves loses.
            break Ok(Some(side.opponent()));
        }

        let explore = match agent.policy {
            Policy::Random => true,
            Policy::Exploit => false,
            Policy::Mixed { explore_prob } => rng.random_bool(explore_prob),
        };

        let action = if explore {
            legal[rng.random_range(0..legal.len())]
        } else {
            let Some(endpoint) = agent.endpoint.as_ref() else {
                break Err(PlayError::MissingEndpoint(side));
            };
            match endpoint.predict(game.encode()).await {
                Ok(output) => greedy_action(&legal, &output.values),
                Err(e) => break Err(PlayError::Protocol(e)),
            }
        };

        if agent.collect {
            decisions.push(Decision {
                side,
                slots: game.encode(),
                action,
                turn: turns,
            });
        }

        game.apply(action);
        turns += 1;
    };

    match outcome {
        Ok(winner) => GameResult {
            seed: task.seed,
            winner,
            turns,
            error: None,
            experience: discounted_returns(decisions, winner, turns, task.return_discount),
        },
        Err(e) => GameResult {
            seed: task.seed,
            winner: None,
            turns,
            error: Some(e.to_string()),
            experience: Vec::new(),
        },
    }
}

fn greedy_action(legal: &[usize], values: &[f32]) -> usize {
    *legal
        .iter()
        .max_by(|&&a, &&b| {
            values[a]
                .partial_cmp(&values[b])
                .expect("model outputs validated finite")
        })
        .expect("legal actions checked non-empty")
}

/// Converts the game outcome into one return per recorded decision: +1/-1
/// from the deciding side's perspective (0 for a tie), discounted once per
/// move between the decision and the end of the game.
fn discounted_returns(
    decisions: Vec<Decision>,
    winner: Option<Side>,
    turns: u32,
    discount: f32,
) -> Vec<Experience> {
    decisions
        .into_iter()
        .map(|decision| {
            let signal = match winner {
                None => 0.0,
                Some(w) if w == decision.side => 1.0,
                Some(_) => -1.0,
            };
            let moves_to_end = turns - 1 - decision.turn;

            Experience {
                slots: decision.slots,
                action: decision.action,
                ret: signal * discount.powi(moves_to_end as i32),
            }
        })
        .collect()
}

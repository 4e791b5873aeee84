use crate::game::{Game, Side};
use ndarray::{ArrayD, IxDyn};
use spt_core::schema::{SlotSpec, TensorSchema};

const STICK_BITS: usize = 8;
const MAX_TAKE: usize = 3;

/// Nim with a seed-varied starting pile: take one to three sticks per turn,
/// taking the last stick wins. Small enough that thousands of games per second
/// flow through the pipeline, but the optimal policy is learnable.
#[derive(Debug, Clone)]
pub struct NimGame {
    sticks: u32,
    to_move: Side,
    last_mover: Option<Side>,
}

impl Game for NimGame {
    fn from_seed(seed: u64) -> Self {
        NimGame {
            sticks: 12 + (seed % 7) as u32,
            to_move: Side::Home,
            last_mover: None,
        }
    }

    fn schema() -> TensorSchema {
        TensorSchema {
            inputs: vec![
                SlotSpec::new("sticks", vec![STICK_BITS]),
                SlotSpec::new("to_move", vec![2]),
            ],
            output_len: MAX_TAKE,
        }
    }

    fn encode(&self) -> Vec<ArrayD<f32>> {
        let sticks = ArrayD::from_shape_fn(IxDyn(&[STICK_BITS]), |ix| {
            ((self.sticks >> ix[0]) & 1) as f32
        });

        let mut to_move = ArrayD::zeros(IxDyn(&[2]));
        to_move[[match self.to_move {
            Side::Home => 0,
            Side::Away => 1,
        }]] = 1.0;

        vec![sticks, to_move]
    }

    fn to_move(&self) -> Side {
        self.to_move
    }

    fn legal_actions(&self) -> Vec<usize> {
        (0..MAX_TAKE)
            .filter(|take| (take + 1) as u32 <= self.sticks)
            .collect()
    }

    fn apply(&mut self, action: usize) {
        debug_assert!((action + 1) as u32 <= self.sticks, "illegal take");

        self.sticks -= (action + 1) as u32;
        self.last_mover = Some(self.to_move);
        self.to_move = self.to_move.opponent();
    }

    fn outcome(&self) -> Option<Option<Side>> {
        if self.sticks == 0 {
            Some(self.last_mover)
        } else {
            None
        }
    }
}

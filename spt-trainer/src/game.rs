use ndarray::ArrayD;
use spt_core::schema::TensorSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Home,
    Away,
}

impl Side {
    pub fn opponent(self) -> Side {
        match self {
            Side::Home => Side::Away,
            Side::Away => Side::Home,
        }
    }
}

/// A two-player, turn-based game driven by the self-play pipeline.
///
/// `encode` must produce one array per slot of `schema`, shaped exactly as the
/// slot declares (no batch axis). Actions are indices into the model's output
/// row, so `schema().output_len` bounds every legal action.
pub trait Game: Clone + Send + 'static {
    fn from_seed(seed: u64) -> Self;

    fn schema() -> TensorSchema;

    fn encode(&self) -> Vec<ArrayD<f32>>;

    fn to_move(&self) -> Side;

    fn legal_actions(&self) -> Vec<usize>;

    fn apply(&mut self, action: usize);

    /// `None` while the game is running, `Some(None)` for a tie and
    /// `Some(Some(side))` once a side has won.
    fn outcome(&self) -> Option<Option<Side>>;
}

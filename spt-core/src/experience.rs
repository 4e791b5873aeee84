use ndarray::ArrayD;

/// One recorded decision point: the encoded state, the action taken and the
/// discounted multi-step return observed from that point to the end of the
/// game.
#[derive(Debug, Clone)]
pub struct Experience {
    /// Encoded state, one array per schema input slot.
    pub slots: Vec<ArrayD<f32>>,

    /// Index of the chosen action in the model's output row.
    pub action: usize,

    /// Discounted return from this state.
    pub ret: f32,
}

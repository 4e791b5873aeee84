use thiserror::Error;

/// Schema violations indicate encoding bugs upstream and are never tolerated.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SchemaError {
    #[error("expected {expected} input slots, got {actual}")]
    SlotCount { expected: usize, actual: usize },

    #[error("slot '{slot}' has shape {actual:?}, schema declares {expected:?}")]
    SlotShape {
        slot: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("slot '{slot}' contains a non-finite value")]
    NonFinite { slot: String },

    #[error("model produced {actual} output rows for a batch of {expected}")]
    OutputRows { expected: usize, actual: usize },

    #[error("model output width {actual} does not match declared width {expected}")]
    OutputWidth { expected: usize, actual: usize },

    #[error("weight tensor {index} has shape {actual:?}, expected {expected:?}")]
    WeightShape {
        index: usize,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
}

/// Lifecycle errors on the model registry. These are programming errors on the
/// caller's side and fail immediately instead of being swallowed.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown model '{0}'")]
    UnknownModel(String),

    #[error("model '{0}' already exists")]
    DuplicateModel(String),

    #[error("model '{name}' is locked under scope '{scope}' step {step}, refusing scope '{requested}'")]
    ScopeAlreadyLocked {
        name: String,
        scope: String,
        step: u64,
        requested: String,
    },

    #[error("model '{0}' is not locked")]
    NotLocked(String),

    #[error("model '{0}' is learning; serving and weight mutation are excluded until it finishes")]
    Learning(String),

    #[error("endpoint is not subscribed to any model")]
    NotSubscribed,

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("failed to load model: {0}")]
    Load(String),

    #[error("failed to save model: {0}")]
    Save(String),

    #[error("registry channel closed")]
    Closed,
}

/// Errors seen by a channel caller: either the remote side reported a failure
/// for this request id, or the channel itself went away.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("remote error: {0}")]
    Remote(String),

    #[error("channel closed before a final reply arrived")]
    ChannelClosed,

    #[error("unexpected reply payload: {0}")]
    UnexpectedReply(&'static str),
}

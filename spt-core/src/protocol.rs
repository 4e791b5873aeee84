use crate::batch::PredictionOutput;
use crate::experience::Experience;
use crate::net::{LearnConfig, LearnProgress, LearnSummary};
use ndarray::ArrayD;
use std::path::PathBuf;
use std::sync::Arc;
use spt_util::math::HistogramSummary;

pub type RequestId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointId(pub u64);

/// Every operation a worker can ask of the model-hosting side. A closed enum,
/// so adding an operation is a compile-time-checked change at every match
/// site.
#[derive(Debug)]
pub enum ModelRequest {
    /// Routed through the batch accumulator of the endpoint's subscription.
    /// Slot arrays are moved, not copied; megabyte-scale tensors change owner.
    Predict { slots: Vec<ArrayD<f32>> },

    /// Deserialize from `source`, or construct freshly from `seed`.
    Load {
        name: String,
        source: Option<PathBuf>,
        seed: Option<u64>,
    },

    /// Reconstruct an independent frozen copy under a new name.
    CloneModel { name: String, new_name: String },

    /// Overwrite `to`'s weights with `from`'s, in place.
    CopyTo { from: String, to: String },

    /// Open a metrics-collection window on `name`.
    Lock {
        name: String,
        scope: String,
        step: u64,
    },

    /// Close the metrics window; the reply carries the flushed histograms.
    Unlock { name: String },

    /// One supervised update episode. The sample snapshot is shared by
    /// reference, never copied per message.
    Learn {
        name: String,
        samples: Arc<Vec<Experience>>,
        config: LearnConfig,
    },

    Save { name: String, path: PathBuf },

    Unload { name: String },

    /// Drain this endpoint's in-flight work, confirm, then detach.
    Close,
}

/// Histograms collected between `Lock` and `Unlock`, tagged with the window.
#[derive(Debug, Clone)]
pub struct MetricsWindow {
    pub scope: String,
    pub step: u64,
    /// Wall time of each batched model call, in seconds.
    pub batch_latency: HistogramSummary,
    /// Per-request queuing delay before its batch executed, in seconds.
    pub request_delay: HistogramSummary,
    pub batch_size: HistogramSummary,
}

#[derive(Debug)]
pub enum ReplyPayload {
    Prediction(PredictionOutput),
    Ack,
    MetricsWindow(MetricsWindow),
    /// Non-final; several may precede the closing `LearnDone`.
    LearnProgress(LearnProgress),
    LearnDone(LearnSummary),
    Closed,
}

/// A reply correlated to its request purely by id. `done` closes the id;
/// multi-part operations send non-final replies first.
#[derive(Debug)]
pub struct ModelReply {
    pub id: RequestId,
    pub done: bool,
    pub result: Result<ReplyPayload, String>,
}

/// One request tagged with its per-endpoint monotone id.
#[derive(Debug)]
pub struct Envelope {
    pub id: RequestId,
    pub request: ModelRequest,
}

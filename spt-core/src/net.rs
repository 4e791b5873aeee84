use crate::error::SchemaError;
use crate::experience::Experience;
use crate::schema::TensorSchema;
use anyhow::Context;
use ndarray::{Array1, Array2, ArrayD, Axis, CowArray, Ix2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One supervised update episode over a buffered experience snapshot.
#[derive(Debug, Clone)]
pub struct LearnConfig {
    pub batch_size: usize,
    pub epochs: usize,
    pub learning_rate: f32,
    pub shuffle_seed: u64,
}

/// Non-final progress event emitted while a learn episode runs.
#[derive(Debug, Clone, PartialEq)]
pub struct LearnProgress {
    pub epoch: usize,
    pub batches: usize,
    pub epoch_loss: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LearnSummary {
    pub epochs: usize,
    pub batches: usize,
    pub mean_loss: f32,
    pub duration_ms: u64,
}

/// Boundary trait for the actual neural network. The registry treats a
/// forward pass as a pure function of weights and input for the duration of
/// the call; all mutation goes through `import_weights` or `train_step`.
pub trait Network: Send {
    fn schema(&self) -> &TensorSchema;

    /// One batched evaluation. `inputs` holds one stacked array per schema
    /// slot, batch axis first. Returns one output row per batch element, in
    /// batch order.
    fn forward(&self, inputs: &[ArrayD<f32>]) -> Array2<f32>;

    fn export_weights(&self) -> Vec<ArrayD<f32>>;

    fn import_weights(&mut self, weights: &[ArrayD<f32>]) -> Result<(), SchemaError>;

    /// One gradient step over `batch`. Returns the batch loss.
    fn train_step(&mut self, batch: &[&Experience], learning_rate: f32) -> f32;

    fn save(&self, path: &Path) -> anyhow::Result<()>;
}

/// Constructs networks, either freshly seeded or from a checkpoint.
pub trait NetworkSpawner: Send + Sync {
    fn schema(&self) -> TensorSchema;

    fn fresh(&self, seed: u64) -> Box<dyn Network>;

    fn load(&self, path: &Path) -> anyhow::Result<Box<dyn Network>>;
}

/// A deterministic seeded linear value model. Stands in for the external
/// network collaborator in tests and dry runs; real deployments plug their
/// own `NetworkSpawner` in.
pub struct LinearNetwork {
    schema: TensorSchema,
    weights: Array2<f32>,
    bias: Array1<f32>,
}

impl LinearNetwork {
    pub fn seeded(schema: TensorSchema, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let input_len = schema.input_len();
        let output_len = schema.output_len;

        let weights =
            Array2::from_shape_fn((input_len, output_len), |_| (rng.random::<f32>() - 0.5) * 0.1);
        let bias = Array1::zeros(output_len);

        LinearNetwork {
            schema,
            weights,
            bias,
        }
    }

    /// Flattens stacked per-slot inputs into one `(batch, input_len)` matrix.
    fn flatten_inputs(&self, inputs: &[ArrayD<f32>]) -> Array2<f32> {
        let batch = inputs
            .first()
            .map(|a| a.shape()[0])
            .expect("forward on a schema with no input slots");

        let flattened: Vec<CowArray<'_, f32, Ix2>> = inputs
            .iter()
            .zip(&self.schema.inputs)
            .map(|(array, spec)| {
                array
                    .to_shape((batch, spec.len()))
                    .expect("slot shape verified against schema")
            })
            .collect();

        let views: Vec<_> = flattened.iter().map(|a| a.view()).collect();
        ndarray::concatenate(Axis(1), &views).expect("slot batch axes agree")
    }

    fn flatten_sample(&self, slots: &[ArrayD<f32>]) -> Array1<f32> {
        let mut row = Vec::with_capacity(self.schema.input_len());
        for array in slots {
            row.extend(array.iter().copied());
        }
        Array1::from_vec(row)
    }
}

impl Network for LinearNetwork {
    fn schema(&self) -> &TensorSchema {
        &self.schema
    }

    fn forward(&self, inputs: &[ArrayD<f32>]) -> Array2<f32> {
        let x = self.flatten_inputs(inputs);
        x.dot(&self.weights) + &self.bias
    }

    fn export_weights(&self) -> Vec<ArrayD<f32>> {
        vec![
            self.weights.clone().into_dyn(),
            self.bias.clone().into_dyn(),
        ]
    }

    fn import_weights(&mut self, weights: &[ArrayD<f32>]) -> Result<(), SchemaError> {
        if weights.len() != 2 {
            return Err(SchemaError::WeightShape {
                index: weights.len().min(2),
                expected: vec![2],
                actual: vec![weights.len()],
            });
        }

        for (index, (target, source)) in [
            (self.weights.shape().to_vec(), &weights[0]),
            (self.bias.shape().to_vec(), &weights[1]),
        ]
        .into_iter()
        .enumerate()
        {
            if source.shape() != target.as_slice() {
                return Err(SchemaError::WeightShape {
                    index,
                    expected: target,
                    actual: source.shape().to_vec(),
                });
            }
        }

        self.weights = weights[0]
            .clone()
            .into_dimensionality()
            .expect("shape checked above");
        self.bias = weights[1]
            .clone()
            .into_dimensionality()
            .expect("shape checked above");

        Ok(())
    }

    fn train_step(&mut self, batch: &[&Experience], learning_rate: f32) -> f32 {
        let mut loss_sum = 0.0f32;

        for sample in batch {
            let x = self.flatten_sample(&sample.slots);
            let predicted = x.dot(&self.weights.column(sample.action)) + self.bias[sample.action];
            let gradient = predicted - sample.ret;

            self.weights
                .column_mut(sample.action)
                .scaled_add(-learning_rate * gradient, &x);
            self.bias[sample.action] -= learning_rate * gradient;

            loss_sum += gradient * gradient;
        }

        loss_sum / batch.len().max(1) as f32
    }

    fn save(&self, path: &Path) -> anyhow::Result<()> {
        let checkpoint = LinearCheckpoint {
            schema: self.schema.clone(),
            weights: self.weights.iter().copied().collect(),
            bias: self.bias.to_vec(),
        };

        let file = std::fs::File::create(path)
            .with_context(|| format!("failed to create checkpoint at {path:?}"))?;
        serde_json::to_writer(file, &checkpoint)
            .with_context(|| format!("failed to serialize checkpoint to {path:?}"))?;

        Ok(())
    }
}

/// Weights plus architecture metadata, enough to rebuild and verify the model.
#[derive(Serialize, Deserialize)]
struct LinearCheckpoint {
    schema: TensorSchema,
    weights: Vec<f32>,
    bias: Vec<f32>,
}

pub struct LinearSpawner {
    schema: TensorSchema,
}

impl LinearSpawner {
    pub fn new(schema: TensorSchema) -> Self {
        LinearSpawner { schema }
    }
}

impl NetworkSpawner for LinearSpawner {
    fn schema(&self) -> TensorSchema {
        self.schema.clone()
    }

    fn fresh(&self, seed: u64) -> Box<dyn Network> {
        Box::new(LinearNetwork::seeded(self.schema.clone(), seed))
    }

    fn load(&self, path: &Path) -> anyhow::Result<Box<dyn Network>> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("failed to open checkpoint at {path:?}"))?;
        let checkpoint: LinearCheckpoint = serde_json::from_reader(file)
            .with_context(|| format!("failed to parse checkpoint at {path:?}"))?;

        if checkpoint.schema != self.schema {
            anyhow::bail!(
                "checkpoint at {path:?} declares schema {:?}, expected {:?}",
                checkpoint.schema,
                self.schema
            );
        }

        let input_len = self.schema.input_len();
        let output_len = self.schema.output_len;

        if checkpoint.weights.len() != input_len * output_len
            || checkpoint.bias.len() != output_len
        {
            anyhow::bail!("checkpoint at {path:?} has truncated weight data");
        }

        let mut network = LinearNetwork::seeded(self.schema.clone(), 0);
        let weights = Array2::from_shape_vec((input_len, output_len), checkpoint.weights)
            .expect("length checked above")
            .into_dyn();
        let bias = Array1::from_vec(checkpoint.bias).into_dyn();
        network
            .import_weights(&[weights, bias])
            .expect("checkpoint shapes verified");

        Ok(Box::new(network))
    }
}

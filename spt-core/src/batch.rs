use crate::error::SchemaError;
use crate::schema::TensorSchema;
use ndarray::{Array2, ArrayD, Axis};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// One output row of the batched model call, owned by the caller afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionOutput {
    pub values: Vec<f32>,
}

/// Opaque completion handle attached to a prediction request.
pub type Completion = Box<dyn FnOnce(PredictionOutput) + Send>;

struct Pending {
    completion: Completion,
    arrived: Instant,
}

/// Arrival-ordered requests awaiting one batched model call. Does not decide
/// execution timing; the scheduler swaps a full or timed-out batch for a fresh
/// one and resolves it. Resolving consumes the batch, so a flushed batch can
/// never be flushed again and can never accept another request.
pub struct PendingBatch {
    schema: Arc<TensorSchema>,
    slots: Vec<Vec<ArrayD<f32>>>,
    pending: Vec<Pending>,
}

impl PendingBatch {
    pub fn new(schema: Arc<TensorSchema>) -> Self {
        let slots = schema.inputs.iter().map(|_| Vec::new()).collect();
        PendingBatch {
            schema,
            slots,
            pending: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Stores a request in arrival order. The slot arrays are moved in, not
    /// copied; they are validated against the schema before acceptance.
    pub fn add(
        &mut self,
        request_slots: Vec<ArrayD<f32>>,
        completion: Completion,
    ) -> Result<(), SchemaError> {
        self.schema.validate_request(&request_slots)?;

        for (stack, array) in self.slots.iter_mut().zip(request_slots) {
            stack.push(array);
        }

        self.pending.push(Pending {
            completion,
            arrived: Instant::now(),
        });

        Ok(())
    }

    /// `add` variant returning an awaitable receiver instead of a callback.
    pub fn add_waiter(
        &mut self,
        request_slots: Vec<ArrayD<f32>>,
    ) -> Result<oneshot::Receiver<PredictionOutput>, SchemaError> {
        let (tx, rx) = oneshot::channel();
        self.add(
            request_slots,
            Box::new(move |output| {
                let _ = tx.send(output);
            }),
        )?;
        Ok(rx)
    }

    /// Concatenates the stored requests along a new batch axis, one stacked
    /// array per declared input slot.
    pub fn stacked_inputs(&self) -> Vec<ArrayD<f32>> {
        debug_assert!(!self.is_empty(), "stacking an empty batch");

        self.slots
            .iter()
            .map(|stack| {
                let views: Vec<_> = stack.iter().map(|a| a.view()).collect();
                ndarray::stack(Axis(0), &views).expect("slot shapes verified on add")
            })
            .collect()
    }

    /// How long each request has been queued, in arrival order.
    pub fn queue_delays(&self, now: Instant) -> Vec<Duration> {
        self.pending
            .iter()
            .map(|p| now.duration_since(p.arrived))
            .collect()
    }

    /// Distributes output row `i` to request `i`'s completion handle, in the
    /// order the requests were added. Consumes the batch.
    pub fn resolve(self, outputs: Array2<f32>) -> Result<(), SchemaError> {
        if outputs.nrows() != self.pending.len() {
            return Err(SchemaError::OutputRows {
                expected: self.pending.len(),
                actual: outputs.nrows(),
            });
        }
        if outputs.ncols() != self.schema.output_len {
            return Err(SchemaError::OutputWidth {
                expected: self.schema.output_len,
                actual: outputs.ncols(),
            });
        }

        for (row, pending) in outputs.rows().into_iter().zip(self.pending) {
            (pending.completion)(PredictionOutput {
                values: row.to_vec(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SlotSpec;
    use ndarray::IxDyn;

    fn schema() -> Arc<TensorSchema> {
        Arc::new(TensorSchema {
            inputs: vec![SlotSpec::new("a", vec![3]), SlotSpec::new("b", vec![2, 2])],
            output_len: 2,
        })
    }

    fn request(fill: f32) -> Vec<ArrayD<f32>> {
        vec![
            ArrayD::from_elem(IxDyn(&[3]), fill),
            ArrayD::from_elem(IxDyn(&[2, 2]), fill),
        ]
    }

    #[test]
    fn results_are_delivered_in_arrival_order() {
        let mut batch = PendingBatch::new(schema());

        let receivers: Vec<_> = (0..5)
            .map(|i| batch.add_waiter(request(i as f32)).unwrap())
            .collect();

        let outputs =
            Array2::from_shape_fn((5, 2), |(row, col)| row as f32 * 10.0 + col as f32);
        batch.resolve(outputs).unwrap();

        for (i, rx) in receivers.into_iter().enumerate() {
            let out = rx.blocking_recv().unwrap();
            assert_eq!(out.values, vec![i as f32 * 10.0, i as f32 * 10.0 + 1.0]);
        }
    }

    #[test]
    fn stacked_inputs_gain_a_batch_axis() {
        let mut batch = PendingBatch::new(schema());
        let _rx0 = batch.add_waiter(request(0.0)).unwrap();
        let _rx1 = batch.add_waiter(request(1.0)).unwrap();

        let stacked = batch.stacked_inputs();
        assert_eq!(stacked[0].shape(), &[2, 3]);
        assert_eq!(stacked[1].shape(), &[2, 2, 2]);
        assert_eq!(stacked[0][[1, 0]], 1.0);
        assert_eq!(stacked[1][[0, 1, 1]], 0.0);
    }

    #[test]
    fn schema_violation_is_rejected_on_add() {
        let mut batch = PendingBatch::new(schema());
        let bad = vec![ArrayD::zeros(IxDyn(&[3]))];
        assert!(batch.add_waiter(bad).is_err());
        assert!(batch.is_empty());
    }

    #[test]
    fn row_count_mismatch_is_a_schema_error() {
        let mut batch = PendingBatch::new(schema());
        let _rx = batch.add_waiter(request(0.0)).unwrap();

        let outputs = Array2::zeros((2, 2));
        assert_eq!(
            batch.resolve(outputs),
            Err(SchemaError::OutputRows {
                expected: 1,
                actual: 2
            })
        );
    }

    #[test]
    fn dropping_an_unresolved_batch_cancels_its_waiters() {
        let mut batch = PendingBatch::new(schema());
        let rx = batch.add_waiter(request(0.0)).unwrap();
        drop(batch);
        assert!(rx.blocking_recv().is_err());
    }
}

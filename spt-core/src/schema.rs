use crate::error::SchemaError;
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

/// One named input slot with a fixed per-request shape (no batch axis).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotSpec {
    pub name: String,
    pub shape: Vec<usize>,
}

impl SlotSpec {
    pub fn new(name: impl Into<String>, shape: Vec<usize>) -> Self {
        SlotSpec {
            name: name.into(),
            shape,
        }
    }

    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The model's declared input/output contract. Every prediction request and
/// every loaded checkpoint is checked against this before touching a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorSchema {
    /// Input slots in fixed order.
    pub inputs: Vec<SlotSpec>,

    /// Width of one output row per request.
    pub output_len: usize,
}

impl TensorSchema {
    pub fn input_len(&self) -> usize {
        self.inputs.iter().map(SlotSpec::len).sum()
    }

    /// Checks one request's slot arrays: count, shapes and value finiteness.
    pub fn validate_request(&self, slots: &[ArrayD<f32>]) -> Result<(), SchemaError> {
        if slots.len() != self.inputs.len() {
            return Err(SchemaError::SlotCount {
                expected: self.inputs.len(),
                actual: slots.len(),
            });
        }

        for (spec, array) in self.inputs.iter().zip(slots) {
            if array.shape() != spec.shape.as_slice() {
                return Err(SchemaError::SlotShape {
                    slot: spec.name.clone(),
                    expected: spec.shape.clone(),
                    actual: array.shape().to_vec(),
                });
            }

            if array.iter().any(|v| !v.is_finite()) {
                return Err(SchemaError::NonFinite {
                    slot: spec.name.clone(),
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::ArrayD;

    fn schema() -> TensorSchema {
        TensorSchema {
            inputs: vec![SlotSpec::new("board", vec![2, 3]), SlotSpec::new("side", vec![2])],
            output_len: 4,
        }
    }

    fn valid_slots() -> Vec<ArrayD<f32>> {
        vec![
            ArrayD::zeros(ndarray::IxDyn(&[2, 3])),
            ArrayD::zeros(ndarray::IxDyn(&[2])),
        ]
    }

    #[test]
    fn accepts_matching_request() {
        assert!(schema().validate_request(&valid_slots()).is_ok());
    }

    #[test]
    fn rejects_wrong_slot_count() {
        let slots = vec![ArrayD::zeros(ndarray::IxDyn(&[2, 3]))];
        assert_eq!(
            schema().validate_request(&slots),
            Err(SchemaError::SlotCount {
                expected: 2,
                actual: 1
            })
        );
    }

    #[test]
    fn rejects_wrong_shape() {
        let mut slots = valid_slots();
        slots[1] = ArrayD::zeros(ndarray::IxDyn(&[3]));
        assert!(matches!(
            schema().validate_request(&slots),
            Err(SchemaError::SlotShape { .. })
        ));
    }

    #[test]
    fn rejects_nan() {
        let mut slots = valid_slots();
        slots[0][[0, 0]] = f32::NAN;
        assert_eq!(
            schema().validate_request(&slots),
            Err(SchemaError::NonFinite {
                slot: "board".to_string()
            })
        );
    }
}

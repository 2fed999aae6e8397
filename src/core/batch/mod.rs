//! Batch assembly utilities.
//!
//! Samples travel as [`TensorMap`]s whose tensors carry a leading batch dimension.
//! [`stack_samples`] concatenates them along that dimension (optionally zero-padding
//! up to a compiled batch size) and [`split_outputs`] fans a batched result back out.

pub mod micro;

pub use micro::{BatchTicket, MicroBatcher};

use crate::core::errors::{OCRError, OcrResult, SimpleError};
use crate::core::inference::TensorMap;
use ndarray::{ArrayD, ArrayViewD, Axis, IxDyn};

/// Appends zero rows along axis 0 until the tensor has `target` rows.
pub fn pad_leading(tensor: ArrayD<f32>, target: usize) -> OcrResult<ArrayD<f32>> {
    let rows = tensor.shape().first().copied().unwrap_or(0);
    if rows >= target {
        return Ok(tensor);
    }
    let mut pad_shape = tensor.shape().to_vec();
    pad_shape[0] = target - rows;
    let padding = ArrayD::<f32>::zeros(IxDyn(&pad_shape));
    ndarray::concatenate(Axis(0), &[tensor.view(), padding.view()])
        .map_err(|e| OCRError::batch_processing("pad batch", e))
}

/// Concatenates per-sample tensors along axis 0, padding to `pad_to` rows if given.
///
/// Returns the stacked inputs and the number of real (unpadded) rows.
pub fn stack_samples(samples: &[TensorMap], pad_to: Option<usize>) -> OcrResult<(TensorMap, usize)> {
    let first = samples.first().ok_or_else(|| {
        OCRError::batch_processing("stack samples", SimpleError::new("empty batch"))
    })?;

    let mut stacked = TensorMap::with_capacity(first.len());
    let mut rows = 0;
    for name in first.keys() {
        let views = samples
            .iter()
            .map(|sample| {
                sample.get(name).map(|t| t.view()).ok_or_else(|| {
                    OCRError::batch_processing(
                        "stack samples",
                        SimpleError::new(format!("sample is missing input '{name}'")),
                    )
                })
            })
            .collect::<OcrResult<Vec<ArrayViewD<'_, f32>>>>()?;
        let tensor = ndarray::concatenate(Axis(0), &views)
            .map_err(|e| OCRError::batch_processing(&format!("concatenate input '{name}'"), e))?;
        rows = tensor.shape().first().copied().unwrap_or(0);
        let tensor = match pad_to {
            Some(target) => pad_leading(tensor, target)?,
            None => tensor,
        };
        stacked.insert(name.clone(), tensor);
    }
    Ok((stacked, rows))
}

/// Splits batched outputs into `count` per-slot maps.
///
/// `batch_rows` is the leading dimension the inputs were run with (`count`
/// plus any padding). Outputs whose leading dimension is `count` or
/// `batch_rows` are sliced per slot, keeping a leading dimension of 1; any other
/// output is shared by cloning it into every slot.
pub fn split_outputs(outputs: &TensorMap, count: usize, batch_rows: usize) -> Vec<TensorMap> {
    let mut slots: Vec<TensorMap> = (0..count).map(|_| TensorMap::new()).collect();
    for (name, tensor) in outputs {
        let per_slot = tensor
            .shape()
            .first()
            .is_some_and(|&rows| rows == count || rows == batch_rows);
        for (slot_idx, slot) in slots.iter_mut().enumerate() {
            let value = if per_slot {
                tensor
                    .index_axis(Axis(0), slot_idx)
                    .insert_axis(Axis(0))
                    .to_owned()
            } else {
                tensor.clone()
            };
            slot.insert(name.clone(), value);
        }
    }
    slots
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(value: f32) -> TensorMap {
        let mut map = TensorMap::new();
        map.insert(
            "x".to_string(),
            ArrayD::from_elem(IxDyn(&[1, 2]), value),
        );
        map
    }

    #[test]
    fn test_stack_samples_concatenates_in_order() {
        let (stacked, rows) = stack_samples(&[sample(1.0), sample(2.0), sample(3.0)], None).unwrap();
        assert_eq!(rows, 3);
        let x = &stacked["x"];
        assert_eq!(x.shape(), &[3, 2]);
        assert_eq!(x[[0, 0]], 1.0);
        assert_eq!(x[[2, 1]], 3.0);
    }

    #[test]
    fn test_stack_samples_pads_to_compiled_size() {
        let (stacked, rows) = stack_samples(&[sample(5.0)], Some(4)).unwrap();
        assert_eq!(rows, 1);
        let x = &stacked["x"];
        assert_eq!(x.shape(), &[4, 2]);
        assert_eq!(x[[0, 0]], 5.0);
        assert_eq!(x[[3, 1]], 0.0);
    }

    #[test]
    fn test_stack_samples_rejects_missing_input() {
        let mut other = TensorMap::new();
        other.insert("y".to_string(), ArrayD::zeros(IxDyn(&[1, 2])));
        assert!(stack_samples(&[sample(1.0), other], None).is_err());
        assert!(stack_samples(&[], None).is_err());
    }

    #[test]
    fn test_split_outputs_slices_and_broadcasts() {
        let mut outputs = TensorMap::new();
        outputs.insert(
            "per_slot".to_string(),
            ArrayD::from_shape_vec(IxDyn(&[3, 1]), vec![10.0, 20.0, 30.0]).unwrap(),
        );
        outputs.insert("shared".to_string(), ArrayD::from_elem(IxDyn(&[1]), 7.0));

        let slots = split_outputs(&outputs, 2, 3);
        assert_eq!(slots.len(), 2);
        assert_eq!(slots[1]["per_slot"].shape(), &[1, 1]);
        assert_eq!(slots[1]["per_slot"][[0, 0]], 20.0);
        assert_eq!(slots[0]["shared"][[0]], 7.0);
    }

    #[test]
    fn test_split_outputs_shares_unrelated_leading_dims() {
        let mut outputs = TensorMap::new();
        outputs.insert(
            "table".to_string(),
            ArrayD::from_shape_vec(IxDyn(&[5]), vec![1.0, 2.0, 3.0, 4.0, 5.0]).unwrap(),
        );
        outputs.insert("rows".to_string(), ArrayD::from_elem(IxDyn(&[4, 2]), 1.0));

        let slots = split_outputs(&outputs, 2, 4);
        for slot in &slots {
            assert_eq!(slot["table"].shape(), &[5]);
            assert_eq!(slot["rows"].shape(), &[1, 2]);
        }
    }
}

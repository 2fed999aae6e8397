//! Greedy decoding of recognition outputs.
//!
//! This module turns the recognition model's per-position scores (or token ids)
//! into strings through a [`CharTable`]. Decoding stops at the end-of-sequence
//! token; begin-of-sequence and padding tokens are dropped.

use crate::domain::CharTable;
use ndarray::{ArrayView1, ArrayView2, ArrayViewD, Axis};
use std::sync::Arc;

/// Greedy attention-sequence decoder over a fixed character table.
#[derive(Debug, Clone)]
pub struct GreedyDecoder {
    table: Arc<CharTable>,
}

impl GreedyDecoder {
    /// Creates a decoder for `table`.
    pub fn new(table: Arc<CharTable>) -> Self {
        Self { table }
    }

    /// The character table.
    pub fn table(&self) -> &CharTable {
        &self.table
    }

    /// Decodes one `[T, V]` score matrix.
    ///
    /// Entries blocked by `mask` (value `0.0`) are never selected. Returns the text
    /// and the mean max-softmax probability over the kept positions (zero when
    /// nothing was kept).
    ///
    /// # Arguments
    ///
    /// * `logits` - Raw per-position scores.
    /// * `mask` - Optional vocabulary mask of length `V`.
    pub fn decode_logits(&self, logits: ArrayView2<'_, f32>, mask: Option<&[f32]>) -> (String, f32) {
        let mut text = String::new();
        let mut probs = Vec::new();

        for row in logits.outer_iter() {
            let Some((idx, prob)) = masked_argmax_softmax(row, mask) else {
                break;
            };
            if idx == self.table.eos() {
                break;
            }
            if self.table.is_special(idx) {
                continue;
            }
            if let Some(symbol) = self.table.symbol(idx) {
                text.push_str(symbol);
                probs.push(prob);
            }
        }

        let confidence = if probs.is_empty() {
            0.0
        } else {
            probs.iter().sum::<f32>() / probs.len() as f32
        };
        (text, confidence)
    }

    /// Decodes one sequence of token ids. Confidence is `1.0` for non-empty output.
    pub fn decode_ids(&self, ids: ArrayView1<'_, f32>) -> (String, f32) {
        let mut text = String::new();
        for &raw in ids {
            let idx = raw.round().max(0.0) as usize;
            if idx == self.table.eos() {
                break;
            }
            if self.table.is_special(idx) {
                continue;
            }
            if let Some(symbol) = self.table.symbol(idx) {
                text.push_str(symbol);
            }
        }
        let confidence = if text.is_empty() { 0.0 } else { 1.0 };
        (text, confidence)
    }

    /// Decodes a batched output: `[B, T, V]` scores or `[B, T]` token ids.
    ///
    /// `masks` holds one optional mask per row. Rows beyond `rows` (padding) are
    /// skipped. Returns `None` for unsupported ranks.
    pub fn decode_batch(
        &self,
        output: ArrayViewD<'_, f32>,
        masks: &[Option<Vec<f32>>],
        rows: usize,
    ) -> Option<Vec<(String, f32)>> {
        match output.ndim() {
            3 => {
                let output = output.into_dimensionality::<ndarray::Ix3>().ok()?;
                Some(
                    output
                        .axis_iter(Axis(0))
                        .take(rows)
                        .enumerate()
                        .map(|(i, seq)| {
                            let mask = masks.get(i).and_then(|m| m.as_deref());
                            self.decode_logits(seq, mask)
                        })
                        .collect(),
                )
            }
            2 => {
                let output = output.into_dimensionality::<ndarray::Ix2>().ok()?;
                Some(
                    output
                        .axis_iter(Axis(0))
                        .take(rows)
                        .map(|seq| self.decode_ids(seq))
                        .collect(),
                )
            }
            _ => None,
        }
    }
}

/// Argmax over the allowed entries of `row` and its softmax probability among them.
fn masked_argmax_softmax(row: ArrayView1<'_, f32>, mask: Option<&[f32]>) -> Option<(usize, f32)> {
    let allowed = |i: usize| mask.is_none_or(|m| m.get(i).copied().unwrap_or(0.0) > 0.0);

    let (best_idx, best) = row
        .iter()
        .enumerate()
        .filter(|(i, _)| allowed(*i))
        .max_by(|(_, a), (_, b)| a.total_cmp(b))
        .map(|(i, &v)| (i, v))?;

    let denom: f32 = row
        .iter()
        .enumerate()
        .filter(|(i, _)| allowed(*i))
        .map(|(_, &v)| (v - best).exp())
        .sum();
    Some((best_idx, 1.0 / denom))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, Array3, arr1};

    fn decoder() -> GreedyDecoder {
        // 0 EOS, 1 '1', 2 '2', 3 'A', 4 BOS, 5 PAD
        GreedyDecoder::new(Arc::new(CharTable::from_symbols(["1", "2", "A"]).unwrap()))
    }

    fn one_hot(seq: &[usize], vocab: usize) -> Array2<f32> {
        let mut logits = Array2::<f32>::zeros((seq.len(), vocab));
        for (t, &idx) in seq.iter().enumerate() {
            logits[[t, idx]] = 10.0;
        }
        logits
    }

    #[test]
    fn test_decode_stops_at_eos_and_skips_specials() {
        let logits = one_hot(&[4, 1, 5, 2, 0, 3], 6);
        let (text, conf) = decoder().decode_logits(logits.view(), None);
        assert_eq!(text, "12");
        assert!(conf > 0.99);
    }

    #[test]
    fn test_mask_redirects_argmax() {
        let mut logits = one_hot(&[3], 6);
        logits[[0, 2]] = 5.0;
        let mask = vec![1.0, 1.0, 1.0, 0.0, 1.0, 1.0];
        let (text, _) = decoder().decode_logits(logits.view(), Some(&mask));
        assert_eq!(text, "2");
    }

    #[test]
    fn test_confidence_is_mean_max_softmax() {
        let mut logits = Array2::<f32>::zeros((2, 6));
        logits[[0, 1]] = 10.0;
        // second position: uniform over all six entries
        let (text, conf) = decoder().decode_logits(logits.view(), None);
        assert_eq!(text.chars().next(), Some('1'));
        // ties pick the last maximum; position 2 lands on PAD and is skipped
        assert!(conf > 0.99);
        assert_eq!(text, "1");
    }

    #[test]
    fn test_decode_ids_and_batch() {
        let (text, conf) = decoder().decode_ids(arr1(&[1.0, 3.0, 0.0, 2.0]).view());
        assert_eq!(text, "1A");
        assert_eq!(conf, 1.0);

        let mut batch = Array3::<f32>::zeros((3, 2, 6));
        batch[[0, 0, 1]] = 10.0;
        batch[[1, 0, 2]] = 10.0;
        let decoded = decoder()
            .decode_batch(batch.into_dyn().view(), &[None, None, None], 2)
            .unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].0, "1");
        assert_eq!(decoded[1].0, "2");
    }

    #[test]
    fn test_empty_output_has_zero_confidence() {
        let (text, conf) = decoder().decode_logits(one_hot(&[0], 6).view(), None);
        assert!(text.is_empty());
        assert_eq!(conf, 0.0);
    }
}

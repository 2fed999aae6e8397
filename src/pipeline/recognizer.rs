//! Text recognizer: reads every field box of the frame.
//!
//! Crops are expanded, resized to the fixed recognition geometry and grouped into
//! batches of the compiled batch size. The last partial batch is zero-padded and
//! the padding rows are discarded after decoding.

use crate::core::batch::pad_leading;
use crate::core::config::ExtractionConfig;
use crate::core::errors::{OCRError, OcrResult};
use crate::core::inference::{ModelHandle, TensorMap};
use crate::domain::{CharTable, DocumentCatalog, FieldBoxSet, RecognizedText};
use crate::processors::{GreedyDecoder, RecResize};
use crate::utils::image::crop;
use image::RgbImage;
use ndarray::{Array2, ArrayD, Axis, stack};
use rayon::prelude::*;
use std::sync::Arc;
use tracing::debug;

/// Recognition geometry `(height, width)` when the artifact declares dynamic dimensions.
pub const DEFAULT_REC_INPUT: (u32, u32) = (32, 128);
/// Batch size when the artifact declares a dynamic batch dimension.
pub const DEFAULT_REC_BATCH: usize = 8;
const MASK_INPUT: &str = "class_mask";

/// Texts read from a frame plus the number of model calls it took.
#[derive(Debug, Clone)]
pub struct Recognition {
    /// One entry per field box, in reading order.
    pub texts: Vec<RecognizedText>,
    /// Batched model invocations.
    pub calls: usize,
}

/// Runs the recognition model over field crops.
#[derive(Debug, Clone)]
pub struct TextRecognizer {
    handle: ModelHandle,
    decoder: GreedyDecoder,
    resize: RecResize,
    batch_size: usize,
}

impl TextRecognizer {
    /// Creates a recognizer.
    ///
    /// Geometry and batch size come from the artifact's `image` input; `batch_size`
    /// is only used when the artifact's batch dimension is dynamic.
    pub fn new(handle: ModelHandle, table: Arc<CharTable>, batch_size: Option<usize>) -> OcrResult<Self> {
        let spec = handle.input_spec("image");
        let (height, width) = spec
            .and_then(|s| s.static_hw())
            .unwrap_or(DEFAULT_REC_INPUT);
        let batch_size = spec
            .and_then(|s| s.static_batch())
            .or(batch_size)
            .unwrap_or(DEFAULT_REC_BATCH);
        if batch_size == 0 {
            return Err(OCRError::config_error_with_context(
                "rec_batch_size",
                "0",
                "batch size must be greater than 0",
            ));
        }
        Ok(Self {
            handle,
            decoder: GreedyDecoder::new(table),
            resize: RecResize::new(height, width),
            batch_size,
        })
    }

    /// Compiled batch size.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Reads every box of `boxes` on `frame`.
    pub fn recognize(
        &self,
        frame: &RgbImage,
        boxes: &FieldBoxSet,
        catalog: &DocumentCatalog,
        config: &ExtractionConfig,
    ) -> OcrResult<Recognition> {
        let table = self.decoder.table();
        let prepared: Vec<Prepared> = boxes
            .as_slice()
            .par_iter()
            .map(|field| {
                let margin = field.bbox.height() * config.box_expansion;
                let charset = catalog.charset(&field.class).map(str::to_string);
                let mask = charset.as_deref().map(|c| table.class_mask(Some(c)));
                let tensor = match crop(frame, &field.bbox.expand(margin, margin)) {
                    Some(sub) => Some(self.resize.preprocess(&sub)?),
                    None => None,
                };
                Ok(Prepared {
                    tensor,
                    mask,
                    charset,
                })
            })
            .collect::<OcrResult<_>>()?;

        let readable: Vec<usize> = (0..prepared.len())
            .filter(|&i| prepared[i].tensor.is_some())
            .collect();

        let mut decoded: Vec<Option<(String, f32)>> = vec![None; prepared.len()];
        let mut calls = 0;
        for chunk in readable.chunks(self.batch_size) {
            let results = self.run_batch(chunk.iter().map(|&i| &prepared[i]).collect())?;
            calls += 1;
            for (&i, result) in chunk.iter().zip(results) {
                decoded[i] = Some(result);
            }
        }
        debug!(boxes = prepared.len(), batches = calls, "recognized field crops");

        let texts = boxes
            .iter()
            .zip(prepared)
            .zip(decoded)
            .map(|((field, prep), result)| {
                let (text, confidence) = result.unwrap_or_default();
                RecognizedText {
                    field: field.clone(),
                    text,
                    confidence,
                    charset: prep.charset,
                }
            })
            .collect();
        Ok(Recognition { texts, calls })
    }

    fn run_batch(&self, items: Vec<&Prepared>) -> OcrResult<Vec<(String, f32)>> {
        let rows = items.len();
        let model = self.handle.name();
        let views: Vec<_> = items
            .iter()
            .filter_map(|p| p.tensor.as_ref().map(|t| t.view()))
            .collect();
        let images = stack(Axis(0), &views)
            .map_err(|e| OCRError::tensor_operation("stack recognition crops", e))?
            .into_dyn();
        let mut inputs = TensorMap::new();
        inputs.insert("image".to_string(), pad_leading(images, self.batch_size)?);

        let vocab = self.decoder.table().len();
        let masks: Vec<Option<Vec<f32>>> = items.iter().map(|p| p.mask.clone()).collect();
        if self.handle.accepts(MASK_INPUT) {
            let mut mask = Array2::<f32>::ones((rows, vocab));
            for (row, item_mask) in masks.iter().enumerate() {
                if let Some(m) = item_mask {
                    mask.row_mut(row)
                        .iter_mut()
                        .zip(m)
                        .for_each(|(dst, &src)| *dst = src);
                }
            }
            inputs.insert(MASK_INPUT.to_string(), pad_leading(mask.into_dyn(), self.batch_size)?);
        }

        let outputs = self.handle.run(&inputs)?;
        let output = outputs
            .get("logits")
            .or_else(|| outputs.get("ids"))
            .or_else(|| if outputs.len() == 1 { outputs.values().next() } else { None })
            .ok_or_else(|| OCRError::artifact_contract(model, "missing output 'logits'"))?;
        check_output(output, rows, vocab, model)?;

        self.decoder
            .decode_batch(output.view(), &masks, rows)
            .ok_or_else(|| {
                OCRError::artifact_contract(
                    model,
                    format!("unsupported recognition output shape {:?}", output.shape()),
                )
            })
    }
}

struct Prepared {
    tensor: Option<ndarray::Array3<f32>>,
    mask: Option<Vec<f32>>,
    charset: Option<String>,
}

fn check_output(output: &ArrayD<f32>, rows: usize, vocab: usize, model: &str) -> OcrResult<()> {
    let shape = output.shape();
    let batch_ok = shape.first().is_some_and(|&b| b >= rows);
    let vocab_ok = shape.len() != 3 || shape[2] == vocab;
    if batch_ok && vocab_ok {
        Ok(())
    } else {
        Err(OCRError::artifact_contract(
            model,
            format!("recognition output {shape:?} does not fit {rows} rows over a {vocab}-symbol table"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::inference::{FnBackend, TensorSpec};
    use crate::domain::FieldBox;
    use crate::processors::geometry::BoundingBox;
    use ndarray::IxDyn;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Recognition model with a static batch of 2 that answers `texts[row]` per
    /// slot, consuming one text per real (non-zero) row.
    fn recognizer(
        texts: Vec<&'static str>,
        with_mask: bool,
    ) -> (TextRecognizer, Arc<AtomicUsize>, Arc<Mutex<Vec<Vec<usize>>>>) {
        let table = Arc::new(CharTable::builtin());
        let vocab = table.len();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen_shapes = Arc::new(Mutex::new(Vec::new()));
        let queue = Arc::new(Mutex::new(texts.into_iter()));

        let mut specs = vec![TensorSpec::new("image", vec![2, 3, 8, 32])];
        if with_mask {
            specs.push(TensorSpec::new(MASK_INPUT, vec![2, vocab as i64]));
        }
        let backend_table = Arc::clone(&table);
        let backend_calls = Arc::clone(&calls);
        let backend_shapes = Arc::clone(&seen_shapes);
        let handle = ModelHandle::new(FnBackend::new("rec", specs, move |inputs: &TensorMap| {
            backend_calls.fetch_add(1, Ordering::SeqCst);
            let images = &inputs["image"];
            backend_shapes.lock().unwrap().push(images.shape().to_vec());
            let mut logits = ArrayD::<f32>::zeros(IxDyn(&[2, 6, vocab]));
            for row in 0..2 {
                let real = images.index_axis(Axis(0), row).iter().any(|&v| v != 0.0);
                let text = if real { queue.lock().unwrap().next().unwrap_or("") } else { "" };
                for t in 0..6 {
                    let idx = text
                        .chars()
                        .nth(t)
                        .and_then(|c| backend_table.index_of(&c.to_string()))
                        .unwrap_or(backend_table.eos());
                    logits[[row, t, idx]] = 10.0;
                }
            }
            let mut out = TensorMap::new();
            out.insert("logits".to_string(), logits);
            Ok(out)
        }));
        (
            TextRecognizer::new(handle, table, None).unwrap(),
            calls,
            seen_shapes,
        )
    }

    fn frame() -> RgbImage {
        RgbImage::from_pixel(100, 60, image::Rgb([200, 200, 200]))
    }

    fn boxes(classes: &[&str]) -> FieldBoxSet {
        FieldBoxSet::from_unsorted(
            classes
                .iter()
                .enumerate()
                .map(|(i, c)| {
                    let y = 5.0 + i as f32 * 15.0;
                    FieldBox::new(*c, 0.9, BoundingBox::new(10.0, y, 60.0, y + 10.0))
                })
                .collect(),
        )
    }

    #[test]
    fn pads_last_batch_and_discards_padding() {
        let (rec, calls, shapes) = recognizer(vec!["KIM", "42", "SEOUL"], false);
        let result = rec
            .recognize(
                &frame(),
                &boxes(&["name", "serial_number", "address"]),
                &DocumentCatalog::builtin(),
                &ExtractionConfig::default(),
            )
            .unwrap();
        assert_eq!(result.calls, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(shapes.lock().unwrap().iter().all(|s| s == &vec![2, 3, 8, 32]));
        let texts: Vec<&str> = result.texts.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["KIM", "42", "SEOUL"]);
        assert!(result.texts[0].confidence > 0.99);
    }

    #[test]
    fn class_mask_limits_vocabulary() {
        // the fake reads "A1" but the date charset has no letters
        let (rec, _, _) = recognizer(vec!["A1"], true);
        let result = rec
            .recognize(
                &frame(),
                &boxes(&["issue_date"]),
                &DocumentCatalog::builtin(),
                &ExtractionConfig::default(),
            )
            .unwrap();
        assert_eq!(result.texts.len(), 1);
        assert!(!result.texts[0].text.contains('A'));
        assert!(result.texts[0].charset.is_some());
    }

    #[test]
    fn box_outside_frame_reads_empty() {
        let (rec, calls, _) = recognizer(vec![], false);
        let outside = FieldBoxSet::from_unsorted(vec![FieldBox::new(
            "name",
            0.9,
            BoundingBox::new(200.0, 200.0, 250.0, 220.0),
        )]);
        let result = rec
            .recognize(&frame(), &outside, &DocumentCatalog::builtin(), &ExtractionConfig::default())
            .unwrap();
        assert_eq!(result.calls, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(result.texts[0].text, "");
    }

    #[test]
    fn static_batch_overrides_requested_size() {
        let (rec, _, _) = recognizer(vec![], false);
        assert_eq!(rec.batch_size(), 2);
    }
}

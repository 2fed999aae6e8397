//! Character table of the recognition model.
//!
//! Index 0 is the end-of-sequence token, followed by the dictionary symbols, then
//! the begin-of-sequence and padding tokens.

use crate::core::errors::{OCRError, OcrResult};
use std::collections::HashMap;
use std::path::Path;

const EOS_TOKEN: &str = "[EOS]";
const BOS_TOKEN: &str = "[BOS]";
const PAD_TOKEN: &str = "[PAD]";

/// Symbol table mapping model output indices to characters.
#[derive(Debug, Clone)]
pub struct CharTable {
    symbols: Vec<String>,
    index: HashMap<String, usize>,
}

impl CharTable {
    /// Builds a table from dictionary symbols. Duplicates keep their first index.
    pub fn from_symbols<I, S>(symbols: I) -> OcrResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let symbols: Vec<String> = symbols.into_iter().map(Into::into).collect();
        if symbols.is_empty() {
            return Err(OCRError::config_error("character dictionary is empty"));
        }
        Ok(Self::build(symbols))
    }

    fn build(symbols: Vec<String>) -> Self {
        let mut table = Vec::with_capacity(symbols.len() + 3);
        table.push(EOS_TOKEN.to_string());
        table.extend(symbols);
        table.push(BOS_TOKEN.to_string());
        table.push(PAD_TOKEN.to_string());

        let mut index = HashMap::with_capacity(table.len());
        for (i, symbol) in table.iter().enumerate() {
            index.entry(symbol.clone()).or_insert(i);
        }
        Self {
            symbols: table,
            index,
        }
    }

    /// Reads a dictionary with one symbol per line. A line holding a single space is kept.
    pub fn from_dict_file(path: impl AsRef<Path>) -> OcrResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let symbols = text
            .lines()
            .map(|line| line.trim_end_matches('\r'))
            .filter(|line| !line.is_empty())
            .map(str::to_string);
        Self::from_symbols(symbols)
    }

    /// Printable ASCII plus a space.
    pub fn builtin() -> Self {
        let symbols = (0x21u8..=0x7e)
            .map(|b| (b as char).to_string())
            .chain(std::iter::once(" ".to_string()));
        Self::build(symbols.collect())
    }

    /// Table size, i.e. the vocabulary dimension of the model output.
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    /// Always false; a table holds at least the special tokens and one symbol.
    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// End-of-sequence index.
    pub fn eos(&self) -> usize {
        0
    }

    /// Begin-of-sequence index.
    pub fn bos(&self) -> usize {
        self.symbols.len() - 2
    }

    /// Padding index.
    pub fn pad(&self) -> usize {
        self.symbols.len() - 1
    }

    /// Whether `index` is one of the special tokens.
    pub fn is_special(&self, index: usize) -> bool {
        index == self.eos() || index == self.bos() || index == self.pad()
    }

    /// Symbol at `index`.
    pub fn symbol(&self, index: usize) -> Option<&str> {
        self.symbols.get(index).map(String::as_str)
    }

    /// Index of `symbol`.
    pub fn index_of(&self, symbol: &str) -> Option<usize> {
        self.index.get(symbol).copied()
    }

    /// Vocabulary mask allowing only `charset` (plus the special tokens).
    ///
    /// `None` allows every symbol. Entries are `1.0` for allowed and `0.0` for
    /// blocked indices.
    pub fn class_mask(&self, charset: Option<&str>) -> Vec<f32> {
        let Some(charset) = charset else {
            return vec![1.0; self.len()];
        };
        let mut mask = vec![0.0; self.len()];
        for special in [self.eos(), self.bos(), self.pad()] {
            mask[special] = 1.0;
        }
        let mut buf = [0u8; 4];
        for ch in charset.chars() {
            if let Some(i) = self.index_of(ch.encode_utf8(&mut buf)) {
                mask[i] = 1.0;
            }
        }
        mask
    }
}

impl Default for CharTable {
    fn default() -> Self {
        Self::builtin()
    }
}

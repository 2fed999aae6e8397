//! Field assembly: collapses recognized texts into one value per class.
//!
//! Every class resolves through the [`FieldStrategy`] the catalog assigns to it.
//! The resolvers are plain functions over the candidates of one class, so they
//! can be tested without running any model.

use crate::core::config::ExtractionConfig;
use crate::domain::{DocumentCatalog, FieldStrategy, RecognizedText};
use chrono::NaiveDate;
use itertools::Itertools;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Block widths of a license number without a region code.
const LICENSE_SCHEDULE_FULL: [usize; 4] = [2, 2, 6, 2];
/// Block widths of a license number whose region code is printed separately.
const LICENSE_SCHEDULE_REGION: [usize; 3] = [2, 6, 2];

static NON_DIGIT_RUNS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[^0-9]+").unwrap_or_else(|e| panic!("Failed to compile regex pattern: {e}"))
});
static LICENSE_TEXT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9-]+$").unwrap_or_else(|e| panic!("Failed to compile regex pattern: {e}"))
});

/// Inputs a resolver needs besides the candidates themselves.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResolveContext {
    /// Mask identifier values.
    pub redact_id: bool,
    /// Mask name values.
    pub redact_name: bool,
    /// Resolve dates from the lowest candidate on the page.
    pub bottom_most: bool,
    /// The license region field was read as non-empty text.
    pub region_present: bool,
}

/// Builds the final field map of a document.
#[derive(Debug, Clone)]
pub struct FieldAssembler {
    catalog: Arc<DocumentCatalog>,
}

impl FieldAssembler {
    /// Creates an assembler over `catalog`.
    pub fn new(catalog: Arc<DocumentCatalog>) -> Self {
        Self { catalog }
    }

    /// Resolves `texts` (in reading order) into one value per class.
    ///
    /// Every valid class of `document_type` is present in the output; classes
    /// without candidates map to an empty string.
    pub fn assemble(
        &self,
        document_type: Option<&str>,
        texts: &[RecognizedText],
        config: &ExtractionConfig,
    ) -> BTreeMap<String, String> {
        let doc = document_type.and_then(|name| self.catalog.document_type(name));
        let groups = texts.iter().into_group_map_by(|t| t.field.class.as_str());

        let mut fields = BTreeMap::new();
        let mut dropped_region: Option<String> = None;
        for (class, candidates) in &groups {
            let strategy = self.catalog.strategy(class);
            let mut context = ResolveContext {
                redact_id: config.redact_id,
                redact_name: config.redact_name,
                bottom_most: doc.is_some_and(|d| d.uses_bottom_most(class)),
                region_present: false,
            };
            if let FieldStrategy::LicenseNumber { region_class } = &strategy {
                context.region_present = groups
                    .get(region_class.as_str())
                    .is_some_and(|region| region.iter().any(|t| !t.text.trim().is_empty()));
                if !context.region_present {
                    dropped_region = Some(region_class.clone());
                }
            }
            fields.insert(class.to_string(), resolve(&strategy, candidates, &context));
        }

        if let Some(doc) = doc {
            for class in &doc.valid_classes {
                fields.entry(class.clone()).or_default();
            }
        }
        if let Some(region) = dropped_region {
            fields.remove(&region);
        }
        debug!(
            document_type = document_type.unwrap_or("unknown"),
            fields = fields.len(),
            "assembled record"
        );
        fields
    }
}

/// Collapses the candidates of one class into its final value.
pub fn resolve(
    strategy: &FieldStrategy,
    candidates: &[&RecognizedText],
    context: &ResolveContext,
) -> String {
    match strategy {
        FieldStrategy::Serial => best_text(candidates).to_uppercase(),
        FieldStrategy::RedactedId { keep, masked_len } => {
            if context.redact_id {
                let first = candidates.first().map_or("", |t| t.text.trim());
                redact_id(first, *keep, *masked_len)
            } else {
                best_text(candidates).to_string()
            }
        }
        FieldStrategy::LicenseNumber { .. } => license_number(candidates, context.region_present),
        FieldStrategy::Name => {
            let name = best_text(candidates);
            if context.redact_name {
                redact_name(name)
            } else {
                name.to_string()
            }
        }
        FieldStrategy::Date => {
            let raw = if context.bottom_most {
                candidates
                    .iter()
                    .copied()
                    .reduce(|low, t| if t.field.bbox.y2 > low.field.bbox.y2 { t } else { low })
                    .map_or("", |t| t.text.trim())
            } else {
                best_text(candidates)
            };
            normalize_date(raw)
        }
        FieldStrategy::Concat => concat(candidates.iter().map(|t| t.text.as_str())),
    }
}

/// Trimmed text of the highest-confidence candidate; the earliest one wins ties.
fn best_text<'a>(candidates: &[&'a RecognizedText]) -> &'a str {
    candidates
        .iter()
        .copied()
        .reduce(|best, t| if t.confidence > best.confidence { t } else { best })
        .map_or("", |t| t.text.trim())
}

/// Keeps the first `keep` characters and pads with `*` up to `masked_len`.
pub fn redact_id(text: &str, keep: usize, masked_len: usize) -> String {
    if text.is_empty() {
        return String::new();
    }
    let mut masked: String = text.chars().take(keep).collect();
    let visible = masked.chars().count();
    masked.extend(std::iter::repeat_n('*', masked_len.saturating_sub(visible)));
    masked
}

/// Masks a name: two characters keep the first, longer names keep the first two.
pub fn redact_name(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    match chars.len() {
        0 | 1 => name.to_string(),
        2 => format!("{}*", chars[0]),
        n => chars[..2]
            .iter()
            .copied()
            .chain(std::iter::repeat_n('*', n - 2))
            .collect(),
    }
}

/// Joins non-empty parts with a space and strips a trailing comma.
pub fn concat<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
    let joined = parts
        .into_iter()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .join(" ");
    joined.trim_end_matches(',').trim_end().to_string()
}

/// Builds a hyphenated license number from block candidates.
///
/// Candidates that are not made of digits and hyphens only are ignored; the rest
/// are split into blocks on hyphens. The
/// most confident blocks are kept (three when the region code is printed in its
/// own field, four otherwise), put back into reading order and cut to the block
/// widths of the layout. Missing blocks stay empty.
pub fn license_number(candidates: &[&RecognizedText], region_present: bool) -> String {
    let schedule: &[usize] = if region_present {
        &LICENSE_SCHEDULE_REGION
    } else {
        &LICENSE_SCHEDULE_FULL
    };

    let blocks: Vec<(usize, usize, f32, String)> = candidates
        .iter()
        .enumerate()
        .filter(|(_, candidate)| LICENSE_TEXT.is_match(candidate.text.trim()))
        .flat_map(|(ci, candidate)| {
            candidate
                .text
                .trim()
                .split('-')
                .filter(|b| !b.is_empty())
                .enumerate()
                .map(|(bi, b)| (ci, bi, candidate.confidence, b.to_string()))
                .collect::<Vec<_>>()
        })
        .collect();
    if blocks.is_empty() {
        return String::new();
    }

    let mut kept: Vec<String> = blocks
        .into_iter()
        .sorted_by(|a, b| b.2.total_cmp(&a.2))
        .take(schedule.len())
        .sorted_by_key(|&(ci, bi, _, _)| (ci, bi))
        .zip(schedule)
        .map(|((_, _, _, block), &width)| block.chars().take(width).collect())
        .collect();
    kept.resize(schedule.len(), String::new());
    kept.join("-")
}

/// Repairs an OCR'd date into `YYYY-MM-DD`.
///
/// Runs of non-digits become separators and an eight-digit run splits 4/2/2. A
/// zero month reads as 9 and months past 12 clamp to 12; a zero day reads as 9
/// and days from 32 clamp to 31 unless both digits are equal. When the result
/// still is not a valid calendar date the repaired string is returned as is.
pub fn normalize_date(raw: &str) -> String {
    let separated = NON_DIGIT_RUNS.replace_all(raw, "-");
    let mut parts: Vec<String> = separated
        .split('-')
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect();
    if parts.len() == 1 && parts[0].len() == 8 {
        let run = parts.remove(0);
        parts = vec![run[..4].to_string(), run[4..6].to_string(), run[6..].to_string()];
    }
    parts.truncate(3);

    let [year, month, day] = parts.as_slice() else {
        return parts.join("-");
    };
    let month = repair_month(month);
    let day = repair_day(day);
    let repaired = format!("{year}-{month}-{day}");

    if year.len() == 4
        && let Ok(date) = NaiveDate::parse_from_str(&repaired, "%Y-%m-%d")
    {
        return date.format("%Y-%m-%d").to_string();
    }
    debug!(raw, repaired = %repaired, "date kept in partially repaired form");
    repaired
}

fn repair_month(month: &str) -> String {
    match month.parse::<u32>() {
        Ok(0) => "09".to_string(),
        Ok(m) if m > 12 => "12".to_string(),
        Ok(m) => format!("{m:02}"),
        Err(_) => month.to_string(),
    }
}

fn repair_day(day: &str) -> String {
    let doubled = day.len() == 2 && day.chars().all_equal();
    match day.parse::<u32>() {
        Ok(0) => "09".to_string(),
        Ok(d) if d >= 32 && !doubled => "31".to_string(),
        Ok(d) => format!("{d:02}"),
        Err(_) => day.to_string(),
    }
}

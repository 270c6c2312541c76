//! Confidence scoring for candidate extractions.
//!
//! The score is a pure function of the candidate and the field schema:
//!
//! 1. start at 1.0
//! 2. subtract `missing_required_penalty` per missing required field
//! 3. multiply by the fraction of schema values that pass kind validation
//! 4. add a repetition bonus for lists of structurally identical items,
//!    capped at `max_repetition_bonus`
//! 5. clamp to `[0, 1]`
//!
//! A result with no non-blank value always scores 0.0.

use adaptcrawl_shared::{ExtractionResult, FieldSchema, ScoringConfig};

/// Deterministic scorer; holds only configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfidenceScorer {
    config: ScoringConfig,
}

impl ConfidenceScorer {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    /// Required fields with no non-blank value in `result.fields`.
    pub fn missing_required(&self, result: &ExtractionResult, schema: &FieldSchema) -> Vec<String> {
        schema
            .required()
            .filter(|spec| result.fields.get(&spec.name).is_none_or(|v| v.is_blank()))
            .map(|spec| spec.name.clone())
            .collect()
    }

    /// Fraction of schema-known values that fail their kind check.
    ///
    /// Fields the schema does not name are ignored. Returns 0.0 when there is
    /// nothing to validate.
    pub fn invalid_fraction(&self, result: &ExtractionResult, schema: &FieldSchema) -> f64 {
        let mut total = 0usize;
        let mut invalid = 0usize;
        for (name, value) in &result.fields {
            let Some(spec) = schema.get(name) else {
                continue;
            };
            for raw in value.iter() {
                total += 1;
                if !spec.kind.accepts(raw) {
                    invalid += 1;
                }
            }
        }
        if total == 0 {
            0.0
        } else {
            invalid as f64 / total as f64
        }
    }

    /// Bonus for `raw_item_count` repeated items.
    pub fn repetition_bonus(&self, raw_item_count: usize) -> f64 {
        let extra = raw_item_count.saturating_sub(1) as f64;
        (extra * self.config.repetition_bonus_per_item).min(self.config.max_repetition_bonus)
    }

    /// Score `result` against `schema`. Ignores any confidence already on it.
    pub fn score(&self, result: &ExtractionResult, schema: &FieldSchema) -> f64 {
        if result.is_empty() {
            return 0.0;
        }

        let missing = self.missing_required(result, schema).len() as f64;
        let mut score = 1.0 - self.config.missing_required_penalty * missing;
        score *= 1.0 - self.invalid_fraction(result, schema);
        score += self.repetition_bonus(result.raw_item_count);
        score.clamp(0.0, 1.0)
    }

    /// Return `result` with `missing_required` and `confidence` recomputed.
    pub fn assess(&self, mut result: ExtractionResult, schema: &FieldSchema) -> ExtractionResult {
        result.missing_required = self.missing_required(&result, schema);
        result.confidence = self.score(&result, schema);
        result
    }
}

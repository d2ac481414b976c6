//! Result payload printed by the evaluation script
//!
//! The script reports through stdout: the last non-empty line (or, failing
//! that, the whole output) must be a JSON object with a finite numeric
//! `score`. `summary`, `status`, `metrics` and `artifacts` are optional.
//! A reported non-success status always scores 0.

use pes_core::{EvaluationResult, EvaluationStatus};
use serde_json::{Map, Value};

/// Parse captured stdout into an evaluation result
///
/// Malformed payloads come back as `validation_failed`, never as an error.
pub fn parse_evaluation(stdout: &str) -> EvaluationResult {
    let Some(object) = find_object(stdout) else {
        return EvaluationResult::validation_failed(format!(
            "Evaluator output does not end with a JSON object: {}",
            tail(stdout, 200)
        ));
    };

    match object.get("score").and_then(Value::as_f64) {
        Some(score) if score.is_finite() => {}
        Some(score) => {
            return EvaluationResult::validation_failed(format!(
                "Evaluator reported a non-finite score: {}",
                score
            ))
        }
        None => {
            return EvaluationResult::validation_failed(
                "Evaluator output is missing a numeric 'score'",
            )
        }
    }

    let mut result: EvaluationResult = match serde_json::from_value(Value::Object(object)) {
        Ok(result) => result,
        Err(e) => {
            return EvaluationResult::validation_failed(format!(
                "Malformed evaluation payload: {}",
                e
            ))
        }
    };
    // framework_error is reserved for the harness itself
    if result.status == EvaluationStatus::FrameworkError {
        result.status = EvaluationStatus::ExecutionFailed;
    }
    if result.status != EvaluationStatus::Success {
        result.score = 0.0;
    }
    result
}

fn find_object(stdout: &str) -> Option<Map<String, Value>> {
    let last_line = stdout.lines().rev().find(|line| !line.trim().is_empty())?;
    if let Ok(Value::Object(object)) = serde_json::from_str(last_line.trim()) {
        return Some(object);
    }
    match serde_json::from_str(stdout.trim()) {
        Ok(Value::Object(object)) => Some(object),
        _ => None,
    }
}

/// Last `max` characters of `text`
pub(crate) fn tail(text: &str, max: usize) -> &str {
    let trimmed = text.trim_end();
    match trimmed.char_indices().rev().nth(max.saturating_sub(1)) {
        Some((idx, _)) if idx > 0 => &trimmed[idx..],
        _ => trimmed,
    }
}

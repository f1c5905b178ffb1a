//! Grading Engine (C5): weighted-check pipeline comparing a student result
//! against an expected result with configurable order/partial-match/
//! keyword semantics.

use crate::types::{CheckOutcome, GradingContext, GradingOutcome, QueryResult, ScalarValue};
use regex::Regex;
use std::collections::HashSet;

const FORBIDDEN_WEIGHT: f64 = 20.0;
const REQUIRED_WEIGHT: f64 = 20.0;
const RESULT_WEIGHT: f64 = 60.0;

/// Grades a student submission. Never panics; always returns a bounded
/// outcome, even for degenerate inputs.
pub fn grade(ctx: &GradingContext) -> GradingOutcome {
    if !ctx.student_result.success {
        return GradingOutcome {
            score: 0.0,
            max_score: ctx.max_score,
            is_correct: false,
            checks: vec![CheckOutcome {
                name: "execution".into(),
                passed: false,
                details: Some(ctx.student_result.error_message.clone()),
            }],
            hints: vec![ctx.student_result.error_message.clone()],
        };
    }

    let mut checks = Vec::new();
    let mut hints = Vec::new();
    let mut weighted_parts: Vec<(f64, f64)> = Vec::new();

    if !ctx.forbidden_keywords.is_empty() {
        let (score, passed, found) = check_forbidden_keywords(&ctx.student_query_text, &ctx.forbidden_keywords);
        checks.push(CheckOutcome {
            name: "forbidden_keywords".into(),
            passed,
            details: (!found.is_empty()).then(|| found.join(", ")),
        });
        if !passed {
            hints.push(format!("avoid using: {}", found.join(", ")));
        }
        weighted_parts.push((score, FORBIDDEN_WEIGHT));
    }

    if !ctx.required_keywords.is_empty() {
        let (score, passed, missing) = check_required_keywords(&ctx.student_query_text, &ctx.required_keywords);
        checks.push(CheckOutcome {
            name: "required_keywords".into(),
            passed,
            details: (!missing.is_empty()).then(|| missing.join(", ")),
        });
        if !passed {
            hints.push(format!("missing required keyword(s): {}", missing.join(", ")));
        }
        weighted_parts.push((score, REQUIRED_WEIGHT));
    }

    if let Some(expected) = &ctx.expected_result {
        let (score, passed, detail) =
            check_result_match(&ctx.student_result, expected, ctx.order_matters, ctx.partial_match);
        checks.push(CheckOutcome {
            name: "result_match".into(),
            passed,
            details: detail.clone(),
        });
        if !passed {
            if let Some(detail) = detail {
                hints.push(detail);
            }
        }
        weighted_parts.push((score, RESULT_WEIGHT));
    }

    let total_weight: f64 = weighted_parts.iter().map(|(_, w)| w).sum();
    let is_correct = checks.iter().all(|c| c.passed);

    let score = if total_weight == 0.0 {
        ctx.max_score
    } else {
        let weighted_sum: f64 = weighted_parts.iter().map(|(s, w)| s * w).sum();
        round2(weighted_sum / total_weight * ctx.max_score / 100.0)
    };

    GradingOutcome {
        score,
        max_score: ctx.max_score,
        is_correct: if total_weight == 0.0 { true } else { is_correct },
        checks,
        hints,
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Word-boundary, case-insensitive keyword matcher over the upper-cased
/// query. `\b` only anchors on word characters, so a keyword like `*` that
/// contains none falls back to a plain substring search.
fn contains_keyword(query_upper: &str, keyword: &str) -> bool {
    let keyword_upper = keyword.to_uppercase();
    let starts_word = keyword_upper.chars().next().is_some_and(|c| c.is_alphanumeric() || c == '_');
    let ends_word = keyword_upper.chars().last().is_some_and(|c| c.is_alphanumeric() || c == '_');
    if !starts_word || !ends_word {
        return query_upper.contains(&keyword_upper);
    }
    let pattern = format!(r"\b{}\b", regex::escape(&keyword_upper));
    Regex::new(&pattern)
        .map(|re| re.is_match(query_upper))
        .unwrap_or(false)
}

fn check_forbidden_keywords(query_text: &str, forbidden: &[String]) -> (f64, bool, Vec<String>) {
    let upper = query_text.to_uppercase();
    let found: Vec<String> = forbidden
        .iter()
        .filter(|kw| contains_keyword(&upper, kw))
        .cloned()
        .collect();
    let passed = found.is_empty();
    (if passed { 100.0 } else { 0.0 }, passed, found)
}

fn check_required_keywords(query_text: &str, required: &[String]) -> (f64, bool, Vec<String>) {
    let upper = query_text.to_uppercase();
    let missing: Vec<String> = required
        .iter()
        .filter(|kw| !contains_keyword(&upper, kw))
        .cloned()
        .collect();
    let passed = missing.is_empty();
    let score = 100.0 * (required.len() - missing.len()) as f64 / required.len() as f64;
    (score, passed, missing)
}

fn normalize_scalar(value: &ScalarValue) -> String {
    match value {
        ScalarValue::Null => String::new(),
        ScalarValue::Bool(b) => b.to_string(),
        ScalarValue::Int(i) => i.to_string(),
        ScalarValue::Float(f) => format!("{:.6}", f).trim_end_matches('0').trim_end_matches('.').to_string(),
        ScalarValue::Text(s) => s.trim().to_string(),
    }
}

fn normalize_row(row: &[ScalarValue]) -> Vec<String> {
    row.iter().map(normalize_scalar).collect()
}

/// §4.5.1 result comparison.
fn check_result_match(
    student: &QueryResult,
    expected: &QueryResult,
    order_matters: bool,
    partial_match: bool,
) -> (f64, bool, Option<String>) {
    let student_cols_upper: HashSet<String> = student.columns.iter().map(|c| c.to_uppercase()).collect();
    let expected_cols_upper: HashSet<String> = expected.columns.iter().map(|c| c.to_uppercase()).collect();
    if student_cols_upper != expected_cols_upper {
        return (0.0, false, Some("column_mismatch".to_string()));
    }

    // Permute student rows to match expected column order.
    let col_index: Vec<usize> = expected
        .columns
        .iter()
        .map(|expected_col| {
            student
                .columns
                .iter()
                .position(|c| c.eq_ignore_ascii_case(expected_col))
                .unwrap_or(0)
        })
        .collect();

    let student_rows: Vec<Vec<String>> = student
        .rows
        .iter()
        .map(|row| col_index.iter().map(|&i| normalize_scalar(&row[i])).collect())
        .collect();
    let expected_rows: Vec<Vec<String>> = expected.rows.iter().map(|row| normalize_row(row)).collect();

    if student_rows.len() != expected_rows.len() {
        if !partial_match {
            return (0.0, false, Some("row_count_mismatch".to_string()));
        }
        let matches = count_matches(&student_rows, &expected_rows, order_matters);
        let total = expected_rows.len().max(1);
        let score = 100.0 * matches as f64 / total as f64;
        return (score, false, Some("row_count_mismatch".to_string()));
    }

    let matches = count_matches(&student_rows, &expected_rows, order_matters);
    let total = expected_rows.len().max(1);
    let score = 100.0 * matches as f64 / total as f64;
    (score, matches == expected_rows.len(), None)
}

fn count_matches(student_rows: &[Vec<String>], expected_rows: &[Vec<String>], order_matters: bool) -> usize {
    if order_matters {
        student_rows
            .iter()
            .zip(expected_rows.iter())
            .filter(|(a, b)| a == b)
            .count()
    } else {
        let mut remaining = expected_rows.to_vec();
        let mut matches = 0;
        for row in student_rows {
            if let Some(pos) = remaining.iter().position(|r| r == row) {
                remaining.remove(pos);
                matches += 1;
            }
        }
        matches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::QueryResult;

    fn result(columns: &[&str], rows: Vec<Vec<ScalarValue>>) -> QueryResult {
        QueryResult::ok(columns.iter().map(|s| s.to_string()).collect(), rows, 1)
    }

    #[test]
    fn partial_match_unordered_scores_66_67() {
        let expected = result(
            &["id"],
            vec![
                vec![ScalarValue::Int(1)],
                vec![ScalarValue::Int(2)],
                vec![ScalarValue::Int(3)],
            ],
        );
        let student = result(&["id"], vec![vec![ScalarValue::Int(3)], vec![ScalarValue::Int(2)]]);

        let ctx = GradingContext {
            student_result: student,
            expected_result: Some(expected),
            expected_query_text: None,
            required_keywords: vec![],
            forbidden_keywords: vec![],
            order_matters: false,
            partial_match: true,
            max_score: 100.0,
            student_query_text: "SELECT id FROM t".into(),
        };

        let outcome = grade(&ctx);
        assert_eq!(outcome.score, 66.67);
        assert!(!outcome.is_correct);
    }

    #[test]
    fn forbidden_keyword_scenario_scores_80() {
        let expected = result(&["id"], vec![vec![ScalarValue::Int(1)]]);
        let student = result(&["id"], vec![vec![ScalarValue::Int(1)]]);

        let ctx = GradingContext {
            student_result: student,
            expected_result: Some(expected),
            expected_query_text: None,
            required_keywords: vec!["JOIN".into()],
            forbidden_keywords: vec!["*".into()],
            order_matters: true,
            partial_match: false,
            max_score: 100.0,
            student_query_text: "SELECT * FROM t JOIN u ON t.id=u.id".into(),
        };

        let outcome = grade(&ctx);
        assert_eq!(outcome.score, 80.0);
        assert!(!outcome.is_correct);
    }

    #[test]
    fn execution_failure_is_a_hard_gate() {
        let ctx = GradingContext {
            student_result: QueryResult::failure("syntax error near FORM"),
            expected_result: None,
            expected_query_text: None,
            required_keywords: vec![],
            forbidden_keywords: vec![],
            order_matters: true,
            partial_match: false,
            max_score: 100.0,
            student_query_text: "SELECT * FORM t".into(),
        };
        let outcome = grade(&ctx);
        assert_eq!(outcome.score, 0.0);
        assert!(!outcome.is_correct);
        assert_eq!(outcome.hints, vec!["syntax error near FORM".to_string()]);
    }

    #[test]
    fn no_weighted_checks_awards_full_score_on_success() {
        let ctx = GradingContext {
            student_result: result(&["id"], vec![vec![ScalarValue::Int(1)]]),
            expected_result: None,
            expected_query_text: None,
            required_keywords: vec![],
            forbidden_keywords: vec![],
            order_matters: true,
            partial_match: false,
            max_score: 50.0,
            student_query_text: "SELECT id FROM t".into(),
        };
        let outcome = grade(&ctx);
        assert_eq!(outcome.score, 50.0);
        assert!(outcome.is_correct);
    }

    #[test]
    fn grading_is_idempotent() {
        let ctx = GradingContext {
            student_result: result(&["id"], vec![vec![ScalarValue::Int(1)], vec![ScalarValue::Int(2)]]),
            expected_result: Some(result(&["id"], vec![vec![ScalarValue::Int(1)], vec![ScalarValue::Int(2)]])),
            expected_query_text: None,
            required_keywords: vec!["SELECT".into()],
            forbidden_keywords: vec!["DELETE".into()],
            order_matters: true,
            partial_match: false,
            max_score: 100.0,
            student_query_text: "SELECT id FROM t ORDER BY id".into(),
        };
        assert_eq!(grade(&ctx), grade(&ctx));
    }

    #[test]
    fn score_is_always_within_bounds() {
        let ctx = GradingContext {
            student_result: result(&["id"], vec![vec![ScalarValue::Int(1)]]),
            expected_result: Some(result(&["id"], vec![vec![ScalarValue::Int(2)]])),
            expected_query_text: None,
            required_keywords: vec!["WHERE".into()],
            forbidden_keywords: vec!["DROP".into()],
            order_matters: true,
            partial_match: false,
            max_score: 100.0,
            student_query_text: "SELECT id FROM t".into(),
        };
        let outcome = grade(&ctx);
        assert!(outcome.score >= 0.0 && outcome.score <= outcome.max_score);
    }

    #[test]
    fn column_set_mismatch_fails_hard() {
        let ctx = GradingContext {
            student_result: result(&["name"], vec![vec![ScalarValue::Text("a".into())]]),
            expected_result: Some(result(&["id"], vec![vec![ScalarValue::Int(1)]])),
            expected_query_text: None,
            required_keywords: vec![],
            forbidden_keywords: vec![],
            order_matters: true,
            partial_match: false,
            max_score: 100.0,
            student_query_text: "SELECT name FROM t".into(),
        };
        let outcome = grade(&ctx);
        assert_eq!(outcome.score, 0.0);
    }
}

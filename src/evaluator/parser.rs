// src/evaluator/parser.rs — Normalize vision replies into the fixed evaluation shape

use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::core::types::DimensionScores;
use crate::provider::VisionJudgment;

/// Neutral value for any score the evaluator did not provide.
pub const NEUTRAL_SCORE: f64 = 0.5;

const OBJECT_KEYS: &[&str] = &[
    "object_match",
    "objects",
    "object",
    "object_accuracy",
    "subject_match",
];
const COLOR_KEYS: &[&str] = &[
    "color_match",
    "colour_match",
    "color",
    "colors",
    "color_accuracy",
];
const SPATIAL_KEYS: &[&str] = &[
    "spatial_match",
    "spatial",
    "composition",
    "layout",
    "spatial_accuracy",
];
const STYLE_DEVIATION_KEYS: &[&str] = &["style_deviation", "style_drift"];
/// Reported as a match; deviation is the complement.
const STYLE_MATCH_KEYS: &[&str] = &["style_match", "style_adherence", "style"];
const CONFIDENCE_KEYS: &[&str] = &["confidence", "certainty"];
const MISSING_KEYS: &[&str] = &["missing_elements", "missing", "missing_objects"];
const UNWANTED_KEYS: &[&str] = &[
    "unwanted_elements",
    "unwanted",
    "extra_elements",
    "unexpected_elements",
];
const STYLE_ISSUE_KEYS: &[&str] = &["style_issues", "style_problems", "style_notes"];
const DESCRIPTION_KEYS: &[&str] = &["description", "summary", "caption"];

/// Evaluator output mapped onto the fixed fields.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedJudgment {
    pub description: String,
    pub dimensions: DimensionScores,
    pub missing_elements: Vec<String>,
    pub unwanted_elements: Vec<String>,
    pub style_issues: Vec<String>,
    /// At least one score took the neutral default.
    pub incomplete: bool,
    pub extra: BTreeMap<String, Value>,
}

/// Map any supported reply shape onto the fixed fields.
///
/// Accepts a flat object, an object with a nested `scores` object, or free
/// text with `name: value` lines. Scores on 0-10 or 0-100 scales are rescaled.
pub fn normalize(judgment: &VisionJudgment) -> NormalizedJudgment {
    match &judgment.raw {
        Value::Object(obj) => normalize_object(obj, &judgment.description),
        Value::String(text) => normalize_text(text, &judgment.description),
        other => {
            let mut n = normalize_text("", &judgment.description);
            n.extra.insert("raw".into(), other.clone());
            n
        }
    }
}

fn normalize_object(obj: &Map<String, Value>, fallback_description: &str) -> NormalizedJudgment {
    // Nested "scores" entries are lifted; top-level keys win on conflict.
    let mut fields: Map<String, Value> = Map::new();
    if let Some(Value::Object(scores)) = obj.get("scores") {
        for (k, v) in scores {
            fields.insert(k.to_lowercase(), v.clone());
        }
    }
    for (k, v) in obj {
        if k != "scores" {
            fields.insert(k.to_lowercase(), v.clone());
        }
    }

    let mut incomplete = false;
    let mut take_score = |keys: &[&str], fields: &mut Map<String, Value>| -> Option<f64> {
        let v = take_first(fields, keys).and_then(|v| as_score(&v));
        if v.is_none() {
            incomplete = true;
        }
        v
    };

    let object_match = take_score(OBJECT_KEYS, &mut fields);
    let color_match = take_score(COLOR_KEYS, &mut fields);
    let spatial_match = take_score(SPATIAL_KEYS, &mut fields);
    let confidence = take_score(CONFIDENCE_KEYS, &mut fields);

    let style_deviation = match take_first(&mut fields, STYLE_DEVIATION_KEYS).and_then(|v| as_score(&v)) {
        Some(d) => Some(d),
        None => take_first(&mut fields, STYLE_MATCH_KEYS)
            .and_then(|v| as_score(&v))
            .map(|m| 1.0 - m),
    };
    if style_deviation.is_none() {
        incomplete = true;
    }

    let description = take_first(&mut fields, DESCRIPTION_KEYS)
        .and_then(|v| v.as_str().map(String::from))
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| fallback_description.to_string());

    let missing_elements = take_first(&mut fields, MISSING_KEYS)
        .map(|v| as_list(&v))
        .unwrap_or_default();
    let unwanted_elements = take_first(&mut fields, UNWANTED_KEYS)
        .map(|v| as_list(&v))
        .unwrap_or_default();
    let style_issues = take_first(&mut fields, STYLE_ISSUE_KEYS)
        .map(|v| as_list(&v))
        .unwrap_or_default();

    NormalizedJudgment {
        description,
        dimensions: DimensionScores {
            object_match: object_match.unwrap_or(NEUTRAL_SCORE),
            color_match: color_match.unwrap_or(NEUTRAL_SCORE),
            spatial_match: spatial_match.unwrap_or(NEUTRAL_SCORE),
            style_deviation: style_deviation.unwrap_or(NEUTRAL_SCORE),
            confidence: confidence.unwrap_or(NEUTRAL_SCORE),
        },
        missing_elements,
        unwanted_elements,
        style_issues,
        incomplete,
        extra: fields.into_iter().collect(),
    }
}

/// Free-text fallback: `name: value` (or `name = value`) lines, plus
/// `missing:` / `unwanted:` / `style issues:` lists.
fn normalize_text(text: &str, description: &str) -> NormalizedJudgment {
    let mut obj: Map<String, Value> = Map::new();
    let mut leftover = Vec::new();

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some((name, score)) = parse_score_line(trimmed) {
            obj.insert(name, Value::from(score));
            continue;
        }
        if let Some((name, rest)) = split_key(trimmed) {
            let key = name.to_lowercase().replace([' ', '-'], "_");
            if MISSING_KEYS.contains(&key.as_str())
                || UNWANTED_KEYS.contains(&key.as_str())
                || STYLE_ISSUE_KEYS.contains(&key.as_str())
            {
                obj.insert(key, Value::String(rest.to_string()));
                continue;
            }
        }
        leftover.push(trimmed);
    }

    let fallback = if description.trim().is_empty() {
        leftover.join(" ")
    } else {
        description.to_string()
    };
    normalize_object(&obj, &fallback)
}

fn split_key(line: &str) -> Option<(&str, &str)> {
    let line = line.trim_start_matches('-').trim();
    let (name, rest) = line.split_once(':').or_else(|| line.split_once('='))?;
    Some((name.trim(), rest.trim()))
}

/// Parse a line like "object_match: 0.85", "- color = 7/10" or "spatial: 80%".
pub(crate) fn parse_score_line(line: &str) -> Option<(String, f64)> {
    let (name, value) = split_key(line)?;
    if name.is_empty() || name.split_whitespace().count() > 3 {
        return None;
    }
    let score = parse_scaled(value)?;
    Some((name.to_lowercase().replace([' ', '-'], "_"), score))
}

fn parse_scaled(raw: &str) -> Option<f64> {
    let raw = raw.trim().trim_end_matches(['.', ',']);
    if let Some(pct) = raw.strip_suffix('%') {
        let v: f64 = pct.trim().parse().ok()?;
        return (0.0..=100.0).contains(&v).then_some(v / 100.0);
    }
    if let Some((num, den)) = raw.split_once('/') {
        let n: f64 = num.trim().parse().ok()?;
        let d: f64 = den.trim().parse().ok()?;
        return (d > 0.0 && (0.0..=d).contains(&n)).then_some(n / d);
    }
    rescale(raw.parse().ok()?)
}

/// Bring a 0-1, 0-10 or 0-100 value into [0, 1].
fn rescale(v: f64) -> Option<f64> {
    if !v.is_finite() || v < 0.0 {
        None
    } else if v <= 1.0 {
        Some(v)
    } else if v <= 10.0 {
        Some(v / 10.0)
    } else if v <= 100.0 {
        Some(v / 100.0)
    } else {
        None
    }
}

fn as_score(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => rescale(n.as_f64()?),
        Value::String(s) => parse_scaled(s),
        Value::Object(o) => o.get("score").and_then(as_score),
        _ => None,
    }
}

fn as_list(v: &Value) -> Vec<String> {
    let items: Vec<String> = match v {
        Value::Array(items) => items
            .iter()
            .filter_map(|i| match i {
                Value::String(s) => Some(s.clone()),
                Value::Object(o) => o
                    .get("name")
                    .or_else(|| o.get("element"))
                    .and_then(|n| n.as_str())
                    .map(String::from),
                Value::Null => None,
                other => Some(other.to_string()),
            })
            .collect(),
        Value::String(s) => s.split([',', ';']).map(String::from).collect(),
        _ => Vec::new(),
    };
    items
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("none"))
        .collect()
}

fn take_first(fields: &mut Map<String, Value>, keys: &[&str]) -> Option<Value> {
    let mut found = None;
    for key in keys {
        if let Some(v) = fields.remove(*key) {
            if found.is_none() && !v.is_null() {
                found = Some(v);
            }
        }
    }
    found
}

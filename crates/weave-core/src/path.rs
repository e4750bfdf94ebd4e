//! Dot-path resolution and data mappings.
//!
//! Paths address values inside JSON documents using dot notation with
//! optional bracket indices, e.g. `workflow.context.ticket`,
//! `steps.classify.output.labels[0]`. Mappings copy a value from a
//! source path to a target path, optionally through a named transform.
//! Applying the same mapping set to the same source document twice
//! produces the same target projection.

use serde_json::{Map, Value};

/// Maximum number of path segments accepted by the parser. Deeper
/// paths are rejected rather than silently truncated.
pub const MAX_PATH_DEPTH: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum MappingError {
    #[error("invalid path '{0}': {1}")]
    InvalidPath(String, String),

    #[error("path '{0}' exceeds maximum depth of {MAX_PATH_DEPTH}")]
    DepthExceeded(String),

    #[error("unknown transform '{0}'")]
    UnknownTransform(String),

    #[error("transform '{transform}' cannot be applied to {found}")]
    TransformMismatch { transform: String, found: String },

    #[error("cannot write through non-container value at '{0}'")]
    WriteConflict(String),
}

// ---------------------------------------------------------------------------
// Path parsing
// ---------------------------------------------------------------------------

/// One segment of a parsed path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

/// Parse a dot-path with optional bracket indices into segments.
///
/// `a.b[2].c` becomes `[Key(a), Key(b), Index(2), Key(c)]`.
pub fn parse_path(path: &str) -> Result<Vec<Segment>, MappingError> {
    if path.trim().is_empty() {
        return Err(MappingError::InvalidPath(
            path.to_string(),
            "empty path".to_string(),
        ));
    }

    let mut segments = Vec::new();
    for part in path.split('.') {
        if part.is_empty() {
            return Err(MappingError::InvalidPath(
                path.to_string(),
                "empty segment".to_string(),
            ));
        }
        let mut rest = part;
        // Leading key portion before any bracket.
        if let Some(open) = rest.find('[') {
            let key = &rest[..open];
            if !key.is_empty() {
                segments.push(Segment::Key(key.to_string()));
            }
            rest = &rest[open..];
            while let Some(stripped) = rest.strip_prefix('[') {
                let Some(close) = stripped.find(']') else {
                    return Err(MappingError::InvalidPath(
                        path.to_string(),
                        "unclosed bracket".to_string(),
                    ));
                };
                let idx: usize = stripped[..close].parse().map_err(|_| {
                    MappingError::InvalidPath(
                        path.to_string(),
                        format!("invalid index '{}'", &stripped[..close]),
                    )
                })?;
                segments.push(Segment::Index(idx));
                rest = &stripped[close + 1..];
            }
            if !rest.is_empty() {
                return Err(MappingError::InvalidPath(
                    path.to_string(),
                    format!("unexpected trailing '{rest}'"),
                ));
            }
        } else {
            segments.push(Segment::Key(rest.to_string()));
        }
    }

    if segments.len() > MAX_PATH_DEPTH {
        return Err(MappingError::DepthExceeded(path.to_string()));
    }
    Ok(segments)
}

// ---------------------------------------------------------------------------
// Resolve / write
// ---------------------------------------------------------------------------

/// Resolve a path against a document. Returns `None` when any segment
/// is missing or of the wrong shape. An undefined path is not an error.
pub fn resolve<'a>(doc: &'a Value, path: &str) -> Result<Option<&'a Value>, MappingError> {
    let segments = parse_path(path)?;
    let mut current = doc;
    for segment in &segments {
        match (segment, current) {
            (Segment::Key(k), Value::Object(map)) => match map.get(k) {
                Some(v) => current = v,
                None => return Ok(None),
            },
            (Segment::Index(i), Value::Array(items)) => match items.get(*i) {
                Some(v) => current = v,
                None => return Ok(None),
            },
            _ => return Ok(None),
        }
    }
    Ok(Some(current))
}

/// Write a value at a path, creating intermediate objects as needed.
/// Writing through an existing scalar is an error; an index one past
/// the end of an array appends.
pub fn write(doc: &mut Value, path: &str, value: Value) -> Result<(), MappingError> {
    let segments = parse_path(path)?;
    let mut current = doc;
    for (pos, segment) in segments.iter().enumerate() {
        let last = pos == segments.len() - 1;
        match segment {
            Segment::Key(k) => {
                if current.is_null() {
                    *current = Value::Object(Map::new());
                }
                let Value::Object(map) = current else {
                    return Err(MappingError::WriteConflict(path.to_string()));
                };
                if last {
                    map.insert(k.clone(), value);
                    return Ok(());
                }
                current = map.entry(k.clone()).or_insert(Value::Null);
            }
            Segment::Index(i) => {
                if current.is_null() {
                    *current = Value::Array(Vec::new());
                }
                let Value::Array(items) = current else {
                    return Err(MappingError::WriteConflict(path.to_string()));
                };
                if *i > items.len() {
                    return Err(MappingError::WriteConflict(path.to_string()));
                }
                if *i == items.len() {
                    items.push(Value::Null);
                }
                if last {
                    items[*i] = value;
                    return Ok(());
                }
                current = &mut items[*i];
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Transforms
// ---------------------------------------------------------------------------

/// Apply a named transform to a value. Transform names are validated
/// when a definition is published, so an unknown name here means the
/// definition bypassed validation.
pub fn apply_transform(name: &str, value: Value) -> Result<Value, MappingError> {
    let type_name = |v: &Value| -> String {
        match v {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
        .to_string()
    };

    match name {
        "lower" => match value {
            Value::String(s) => Ok(Value::String(s.to_lowercase())),
            other => Err(MappingError::TransformMismatch {
                transform: name.to_string(),
                found: type_name(&other),
            }),
        },
        "upper" => match value {
            Value::String(s) => Ok(Value::String(s.to_uppercase())),
            other => Err(MappingError::TransformMismatch {
                transform: name.to_string(),
                found: type_name(&other),
            }),
        },
        "trim" => match value {
            Value::String(s) => Ok(Value::String(s.trim().to_string())),
            other => Err(MappingError::TransformMismatch {
                transform: name.to_string(),
                found: type_name(&other),
            }),
        },
        "length" => match &value {
            Value::String(s) => Ok(Value::from(s.chars().count())),
            Value::Array(items) => Ok(Value::from(items.len())),
            Value::Object(map) => Ok(Value::from(map.len())),
            other => Err(MappingError::TransformMismatch {
                transform: name.to_string(),
                found: type_name(other),
            }),
        },
        "not" => Ok(Value::Bool(!value_truthy(&value))),
        "to_string" => match value {
            Value::String(s) => Ok(Value::String(s)),
            other => Ok(Value::String(other.to_string())),
        },
        "to_number" => match &value {
            Value::Number(_) => Ok(value),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| MappingError::TransformMismatch {
                    transform: name.to_string(),
                    found: "non-numeric string".to_string(),
                }),
            other => Err(MappingError::TransformMismatch {
                transform: name.to_string(),
                found: type_name(other),
            }),
        },
        "first" => match value {
            Value::Array(mut items) => {
                if items.is_empty() {
                    Ok(Value::Null)
                } else {
                    Ok(items.swap_remove(0))
                }
            }
            other => Err(MappingError::TransformMismatch {
                transform: name.to_string(),
                found: type_name(&other),
            }),
        },
        "last" => match value {
            Value::Array(mut items) => Ok(items.pop().unwrap_or(Value::Null)),
            other => Err(MappingError::TransformMismatch {
                transform: name.to_string(),
                found: type_name(&other),
            }),
        },
        _ => Err(MappingError::UnknownTransform(name.to_string())),
    }
}

/// Whether a transform name is recognised. Used at publish time.
pub fn is_known_transform(name: &str) -> bool {
    matches!(
        name,
        "lower" | "upper" | "trim" | "length" | "not" | "to_string" | "to_number" | "first" | "last"
    )
}

/// JavaScript-style truthiness used by the `not` transform and
/// condition evaluation.
pub fn value_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

// ---------------------------------------------------------------------------
// Mappings
// ---------------------------------------------------------------------------

/// Apply a mapping set: for each mapping, resolve the source path in
/// `source`, apply the optional transform, and write the result at the
/// target path in `target`. Undefined sources are skipped so the target
/// path stays absent. Pure with respect to `source`; reapplying yields
/// the same projection.
pub fn apply_mappings(
    mappings: &[weave_types::workflow::Mapping],
    source: &Value,
    target: &mut Value,
) -> Result<(), MappingError> {
    for mapping in mappings {
        let Some(found) = resolve(source, &mapping.source_path)? else {
            continue;
        };
        let mut value = found.clone();
        if let Some(transform) = &mapping.transform {
            value = apply_transform(transform, value)?;
        }
        write(target, &mapping.target_path, value)?;
    }
    Ok(())
}

/// Recursively merge `overlay` into `base`. Objects merge key by key;
/// any other value in the overlay replaces the base value outright.
pub fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

//! Reference expressions inside attribute values.
//!
//! A string attribute may embed references of the form `${type.name.attr}`,
//! optionally followed by further path segments (`${type.name.attr.key.0}`).
//! A string that is exactly one reference evaluates to the referenced value
//! with its JSON type; otherwise references are interpolated as text.
//! `$${` escapes a literal `${`.

use serde_json::Value;
use std::fmt;

use crate::config::ResourceId;

/// A reference to another resource's attribute.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Reference {
    /// Referenced resource.
    pub target: ResourceId,
    /// Attribute name followed by nested keys or array indices.
    pub path: Vec<String>,
}

/// One piece of a parsed template string.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Reference(Reference),
}

/// What a lookup produced for a reference.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    /// The value is known now.
    Known(Value),
    /// The value is only known after apply.
    Unknown,
    /// The referenced attribute does not exist.
    Missing,
}

/// Result of evaluating an attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluated {
    /// Fully resolved value.
    Known(Value),
    /// At least one reference is only known after apply.
    Unknown,
}

/// Why an attribute value could not be evaluated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvalError {
    /// The template text is malformed.
    Malformed(String),
    /// A reference points at an attribute that does not exist.
    Missing(Reference),
}

impl Reference {
    /// Parses the inside of `${...}`.
    fn parse(inner: &str) -> Option<Self> {
        let parts: Vec<&str> = inner.trim().split('.').collect();
        if parts.len() < 3 || parts.iter().any(|p| p.is_empty()) {
            return None;
        }

        Some(Self {
            target: ResourceId::new(parts[0], parts[1]),
            path: parts[2..].iter().map(|p| (*p).to_string()).collect(),
        })
    }

    /// Returns the top-level attribute this reference reads.
    #[must_use]
    pub fn attribute(&self) -> &str {
        &self.path[0]
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.target, self.path.join("."))
    }
}

/// Splits a string into literal and reference segments.
fn parse_template(s: &str) -> Result<Vec<Segment>, EvalError> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut rest = s;

    while let Some(pos) = rest.find("${") {
        // `$${` is an escaped literal `${`
        if pos > 0 && rest.as_bytes()[pos - 1] == b'$' {
            literal.push_str(&rest[..pos - 1]);
            literal.push_str("${");
            rest = &rest[pos + 2..];
            continue;
        }

        literal.push_str(&rest[..pos]);
        let after = &rest[pos + 2..];
        let end = after
            .find('}')
            .ok_or_else(|| EvalError::Malformed(s.to_string()))?;
        let reference =
            Reference::parse(&after[..end]).ok_or_else(|| EvalError::Malformed(s.to_string()))?;

        if !literal.is_empty() {
            segments.push(Segment::Literal(std::mem::take(&mut literal)));
        }
        segments.push(Segment::Reference(reference));
        rest = &after[end + 1..];
    }

    literal.push_str(rest);
    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    Ok(segments)
}

/// Collects every reference found in a value, recursively.
///
/// # Errors
///
/// Returns the offending text if a template is malformed.
pub fn references_in(value: &Value) -> Result<Vec<Reference>, String> {
    let mut out = Vec::new();
    collect(value, &mut out).map_err(|e| match e {
        EvalError::Malformed(text) => text,
        EvalError::Missing(r) => r.to_string(),
    })?;
    Ok(out)
}

fn collect(value: &Value, out: &mut Vec<Reference>) -> Result<(), EvalError> {
    match value {
        Value::String(s) => {
            for segment in parse_template(s)? {
                if let Segment::Reference(r) = segment {
                    out.push(r);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect(item, out)?;
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect(item, out)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Evaluates a value, resolving references through `lookup`.
///
/// # Errors
///
/// Returns an error for malformed templates or missing attributes.
pub fn evaluate<F>(value: &Value, lookup: &F) -> Result<Evaluated, EvalError>
where
    F: Fn(&Reference) -> Lookup,
{
    match value {
        Value::String(s) => evaluate_string(s, lookup),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                match evaluate(item, lookup)? {
                    Evaluated::Known(v) => out.push(v),
                    Evaluated::Unknown => return Ok(Evaluated::Unknown),
                }
            }
            Ok(Evaluated::Known(Value::Array(out)))
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (key, item) in map {
                match evaluate(item, lookup)? {
                    Evaluated::Known(v) => {
                        out.insert(key.clone(), v);
                    }
                    Evaluated::Unknown => return Ok(Evaluated::Unknown),
                }
            }
            Ok(Evaluated::Known(Value::Object(out)))
        }
        other => Ok(Evaluated::Known(other.clone())),
    }
}

fn evaluate_string<F>(s: &str, lookup: &F) -> Result<Evaluated, EvalError>
where
    F: Fn(&Reference) -> Lookup,
{
    let segments = parse_template(s)?;

    // A lone reference keeps the referenced value's type.
    if let [Segment::Reference(r)] = segments.as_slice() {
        return match lookup(r) {
            Lookup::Known(v) => Ok(Evaluated::Known(v)),
            Lookup::Unknown => Ok(Evaluated::Unknown),
            Lookup::Missing => Err(EvalError::Missing(r.clone())),
        };
    }

    let mut out = String::new();
    for segment in segments {
        match segment {
            Segment::Literal(text) => out.push_str(&text),
            Segment::Reference(r) => match lookup(&r) {
                Lookup::Known(Value::String(text)) => out.push_str(&text),
                Lookup::Known(other) => out.push_str(&other.to_string()),
                Lookup::Unknown => return Ok(Evaluated::Unknown),
                Lookup::Missing => return Err(EvalError::Missing(r)),
            },
        }
    }
    Ok(Evaluated::Known(Value::String(out)))
}

/// Walks nested keys or array indices below a value.
#[must_use]
pub fn navigate<'a>(value: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter().try_fold(value, |current, key| match current {
        Value::Object(map) => map.get(key),
        Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn lookup_fixed(r: &Reference) -> Lookup {
        match (r.target.name.as_str(), r.attribute()) {
            ("net", "id") => Lookup::Known(json!("net-123")),
            ("net", "cidrs") => Lookup::Known(json!(["10.0.0.0/24"])),
            ("ip", "address") => Lookup::Unknown,
            _ => Lookup::Missing,
        }
    }

    #[test]
    fn test_references_in_nested_values() {
        let value = json!({
            "subnet": "${null_resource.net.id}",
            "hosts": ["${null_resource.ip.address}:22", "static"],
        });
        let refs = references_in(&value).unwrap();

        assert_eq!(refs.len(), 2);
        assert!(refs.iter().any(|r| r.target == ResourceId::new("null_resource", "net")));
        assert!(refs.iter().any(|r| r.to_string() == "null_resource.ip.address"));
    }

    #[test]
    fn test_malformed_template() {
        assert!(references_in(&json!("${null_resource.net}")).is_err());
        assert!(references_in(&json!("${null_resource.net.id")).is_err());
    }

    #[test]
    fn test_escaped_dollar_is_literal() {
        let value = json!("echo $${HOME}");
        assert!(references_in(&value).unwrap().is_empty());
        assert_eq!(
            evaluate(&value, &lookup_fixed).unwrap(),
            Evaluated::Known(json!("echo ${HOME}"))
        );
    }

    #[test]
    fn test_lone_reference_keeps_type() {
        let value = json!("${null_resource.net.cidrs}");
        assert_eq!(
            evaluate(&value, &lookup_fixed).unwrap(),
            Evaluated::Known(json!(["10.0.0.0/24"]))
        );
    }

    #[test]
    fn test_interpolation() {
        let value = json!("subnet=${null_resource.net.id}");
        assert_eq!(
            evaluate(&value, &lookup_fixed).unwrap(),
            Evaluated::Known(json!("subnet=net-123"))
        );
    }

    #[test]
    fn test_unknown_propagates() {
        let value = json!(["a", "${null_resource.ip.address}"]);
        assert_eq!(evaluate(&value, &lookup_fixed).unwrap(), Evaluated::Unknown);
    }

    #[test]
    fn test_missing_attribute() {
        let value = json!("${null_resource.net.nope}");
        assert!(matches!(evaluate(&value, &lookup_fixed), Err(EvalError::Missing(_))));
    }

    #[test]
    fn test_navigate() {
        let value = json!({"disks": [{"lun": 0}, {"lun": 1}]});
        let path = vec![String::from("disks"), String::from("1"), String::from("lun")];
        assert_eq!(navigate(&value, &path), Some(&json!(1)));
        assert_eq!(navigate(&value, &[String::from("missing")]), None);
    }
}

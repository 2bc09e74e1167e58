//! Rewrites of a single value inside a file.
//!
//! Each function returns the new content, or `None` when the file already
//! carries the value.
use regex::Regex;
use serde_yaml::Value;

use crate::error::{KeelPipedError, KeelPipedResult};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(usize),
}

/// Parses the `$.a.b[0].c` subset of JSONPath.
fn parse_path(field: &str) -> KeelPipedResult<Vec<Segment>> {
    let invalid = || KeelPipedError::InvalidConfig(format!("invalid yaml field path {}", field));
    let rest = field.strip_prefix('$').ok_or_else(invalid)?;
    let mut segments = Vec::new();
    let mut chars = rest.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '.' => {
                let mut key = String::new();
                while let Some(&c) = chars.peek() {
                    if c == '.' || c == '[' {
                        break;
                    }
                    key.push(c);
                    chars.next();
                }
                if key.is_empty() {
                    return Err(invalid());
                }
                segments.push(Segment::Key(key));
            }
            '[' => {
                let mut index = String::new();
                for c in chars.by_ref() {
                    if c == ']' {
                        break;
                    }
                    index.push(c);
                }
                let index = index.trim().parse().map_err(|_| invalid())?;
                segments.push(Segment::Index(index));
            }
            _ => return Err(invalid()),
        }
    }
    if segments.is_empty() {
        return Err(invalid());
    }
    Ok(segments)
}

fn lookup<'a>(root: &'a mut Value, path: &[Segment]) -> Option<&'a mut Value> {
    path.iter().try_fold(root, |v, segment| match segment {
        Segment::Key(k) => v.get_mut(k.as_str()),
        Segment::Index(i) => v.get_mut(*i),
    })
}

fn scalar_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(
            n.as_i64()
                .map(|i| i.to_string())
                .or_else(|| n.as_u64().map(|u| u.to_string()))
                .or_else(|| n.as_f64().map(|f| f.to_string()))?,
        ),
        _ => None,
    }
}

/// Sets the scalar at `field` to `value`.
pub fn yaml(content: &[u8], field: &str, value: &str) -> KeelPipedResult<Option<Vec<u8>>> {
    let path = parse_path(field)?;
    let mut doc: Value = serde_yaml::from_slice(content)?;
    let current = lookup(&mut doc, &path)
        .ok_or_else(|| KeelPipedError::runtime(format!("no value found at {}", field)))?;
    let current_str = scalar_string(current).ok_or_else(|| {
        KeelPipedError::runtime(format!("a value of unknown type is defined at {}", field))
    })?;
    if current_str == value {
        return Ok(None);
    }
    *current = Value::String(value.to_string());
    Ok(Some(serde_yaml::to_string(&doc)?.into_bytes()))
}

/// Replaces the first capturing group of every match of `pattern` with `value`.
pub fn text(content: &[u8], pattern: &str, value: &str) -> KeelPipedResult<Option<Vec<u8>>> {
    let re = Regex::new(pattern)?;
    if re.captures_len() < 2 {
        return Err(KeelPipedError::InvalidConfig(
            "capturing group not found in the given regex".to_string(),
        ));
    }
    let content = String::from_utf8_lossy(content);
    let mut touched = false;
    let mut outdated = false;
    let replaced = re.replace_all(&content, |caps: &regex::Captures| {
        touched = true;
        let whole = caps.get(0).map_or("", |m| m.as_str()).to_string();
        let (Some(all), Some(group)) = (caps.get(0), caps.get(1)) else {
            return whole;
        };
        if group.as_str() != value {
            outdated = true;
        }
        let start = group.start() - all.start();
        let end = group.end() - all.start();
        format!("{}{}{}", &whole[..start], value, &whole[end..])
    });
    if !touched {
        return Err(KeelPipedError::runtime(format!(
            "the content doesn't match {}",
            pattern
        )));
    }
    if !outdated {
        return Ok(None);
    }
    Ok(Some(replaced.into_owned().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_field_paths() {
        assert_eq!(
            parse_path("$.spec.containers[1].image").unwrap(),
            vec![
                Segment::Key("spec".into()),
                Segment::Key("containers".into()),
                Segment::Index(1),
                Segment::Key("image".into()),
            ]
        );
        for bad in ["spec.image", "$", "$..a", "$.a[x]"] {
            assert!(parse_path(bad).is_err(), "{}", bad);
        }
    }

    #[test]
    fn rewrites_yaml_values() {
        let content = b"image:\n  tag: v1\n  pullPolicy: Always\nreplicas: 2\n";
        let out = yaml(content, "$.image.tag", "v2").unwrap().unwrap();
        let doc: Value = serde_yaml::from_slice(&out).unwrap();
        assert_eq!(doc["image"]["tag"], Value::from("v2"));
        assert_eq!(doc["image"]["pullPolicy"], Value::from("Always"));

        assert!(yaml(content, "$.image.tag", "v1").unwrap().is_none());
        assert!(yaml(content, "$.replicas", "2").unwrap().is_none());
        assert!(yaml(content, "$.image", "v2").is_err());
        assert!(yaml(content, "$.missing", "v2").is_err());
    }

    #[test]
    fn rewrites_list_items() {
        let content = b"containers:\n- name: a\n  image: a:1\n- name: b\n  image: b:1\n";
        let out = yaml(content, "$.containers[1].image", "b:2").unwrap().unwrap();
        let doc: Value = serde_yaml::from_slice(&out).unwrap();
        assert_eq!(doc["containers"][0]["image"], Value::from("a:1"));
        assert_eq!(doc["containers"][1]["image"], Value::from("b:2"));
    }

    #[test]
    fn rewrites_the_first_capture_group() {
        let content = b"image: app:v1\nsidecar: app:v1\n";
        let out = text(content, r"app:(v[0-9]+)", "v2").unwrap().unwrap();
        assert_eq!(out, b"image: app:v2\nsidecar: app:v2\n");

        assert!(text(content, r"app:(v[0-9]+)", "v1").unwrap().is_none());
        let err = text(content, r"app:v[0-9]+", "v2").unwrap_err();
        assert!(err.to_string().contains("capturing group not found"));
        let err = text(content, r"other:(v[0-9]+)", "v2").unwrap_err();
        assert!(err.to_string().contains("doesn't match"));
    }
}

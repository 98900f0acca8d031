//! Consistency hash for divergence detection.
//!
//! Every replica serializes its content map and structure tree in a
//! canonical form (object keys sorted at every depth, content first) and
//! runs CRC-32 over the result. Two replicas holding the same blocks hash
//! identically no matter the order fields were inserted in.
//!
//! This is a detector, not an integrity check against an adversary.

use serde_json::Value;

use crate::block::{ContentMap, StructureNode};

/// Fingerprint of a page's content and structure.
pub fn consistency_hash(content: &ContentMap, structure: &StructureNode) -> u32 {
    let mut buf = String::with_capacity(256);
    write_content_map(&mut buf, content);
    let structure = serde_json::to_value(structure).unwrap_or_default();
    write_canonical(&mut buf, &structure);

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(buf.as_bytes());
    hasher.finalize()
}

/// Canonical JSON text of a value: compact, keys sorted recursively.
pub fn canonical_json(value: &Value) -> String {
    let mut buf = String::new();
    write_canonical(&mut buf, value);
    buf
}

fn write_content_map(buf: &mut String, content: &ContentMap) {
    buf.push('{');
    for (i, (id, record)) in content.iter().enumerate() {
        if i > 0 {
            buf.push(',');
        }
        write_str(buf, id);
        buf.push(':');
        write_object(buf, record.iter());
    }
    buf.push('}');
}

fn write_canonical(buf: &mut String, value: &Value) {
    match value {
        Value::Null => buf.push_str("null"),
        Value::Bool(b) => buf.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => buf.push_str(&n.to_string()),
        Value::String(s) => write_str(buf, s),
        Value::Array(items) => {
            buf.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    buf.push(',');
                }
                write_canonical(buf, item);
            }
            buf.push(']');
        }
        Value::Object(map) => write_object(buf, map.iter()),
    }
}

fn write_object<'a>(buf: &mut String, entries: impl Iterator<Item = (&'a String, &'a Value)>) {
    let mut entries: Vec<_> = entries.collect();
    entries.sort_unstable_by(|a, b| a.0.cmp(b.0));

    buf.push('{');
    for (i, (key, value)) in entries.into_iter().enumerate() {
        if i > 0 {
            buf.push(',');
        }
        write_str(buf, key);
        buf.push(':');
        write_canonical(buf, value);
    }
    buf.push('}');
}

fn write_str(buf: &mut String, s: &str) {
    // Value's Display emits a quoted, escaped JSON string.
    buf.push_str(&Value::String(s.to_owned()).to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Content;
    use serde_json::json;

    fn record(value: Value) -> Content {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_canonical_json_sorts_nested_keys() {
        let value = json!({"b": 1, "a": {"d": [true, null], "c": "x\"y"}});
        assert_eq!(canonical_json(&value), r#"{"a":{"c":"x\"y","d":[true,null]},"b":1}"#);
    }

    #[test]
    fn test_hash_is_deterministic() {
        let mut content = ContentMap::new();
        content.insert("a".into(), record(json!({"type": "text", "textContent": "hi"})));
        let structure = StructureNode::root_with(vec![StructureNode::leaf("a")]);

        assert_eq!(
            consistency_hash(&content, &structure),
            consistency_hash(&content.clone(), &structure.clone())
        );
    }

    #[test]
    fn test_hash_ignores_field_insertion_order() {
        let mut first = Content::new();
        first.insert("x".into(), json!(1));
        first.insert("y".into(), json!(2));
        let mut second = Content::new();
        second.insert("y".into(), json!(2));
        second.insert("x".into(), json!(1));

        let structure = StructureNode::root_with(vec![StructureNode::leaf("a")]);
        let a: ContentMap = [("a".to_string(), first)].into_iter().collect();
        let b: ContentMap = [("a".to_string(), second)].into_iter().collect();
        assert_eq!(consistency_hash(&a, &structure), consistency_hash(&b, &structure));
    }

    #[test]
    fn test_hash_changes_with_content_and_structure() {
        let mut content = ContentMap::new();
        content.insert("a".into(), record(json!({"textContent": "hi"})));
        let structure = StructureNode::root_with(vec![StructureNode::leaf("a")]);
        let base = consistency_hash(&content, &structure);

        let mut edited = content.clone();
        edited.insert("a".into(), record(json!({"textContent": "hi!"})));
        assert_ne!(base, consistency_hash(&edited, &structure));

        let nested = StructureNode::root_with(vec![StructureNode::node(
            "a",
            vec![StructureNode::leaf("b")],
        )]);
        assert_ne!(base, consistency_hash(&content, &nested));
    }
}

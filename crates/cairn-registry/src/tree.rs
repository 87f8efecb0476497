//! Rebuilds nested mappings from flat `/a/b/c` keys.

use cairn::{Key, Value};

/// Nests `(key, value)` pairs into a mapping tree, preserving first-seen
/// order at every level. A leaf that later gains children becomes a mapping.
pub fn nest<I>(pairs: I) -> Value
where
    I: IntoIterator<Item = (String, Value)>,
{
    let mut root = Vec::new();
    for (key, value) in pairs {
        let segments: Vec<&str> = key.split('/').filter(|s| !s.is_empty()).collect();
        insert(&mut root, &segments, value);
    }
    Value::Mapping(root)
}

fn insert(entries: &mut Vec<(Key, Value)>, segments: &[&str], value: Value) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    let pos = entries.iter().position(|(k, _)| k.as_str() == *first);

    if rest.is_empty() {
        match pos {
            Some(i) => entries[i].1 = value,
            None => entries.push((Key::from(*first), value)),
        }
        return;
    }

    let idx = match pos {
        Some(i) => {
            if !matches!(entries[i].1, Value::Mapping(_)) {
                entries[i].1 = Value::empty_mapping();
            }
            i
        }
        None => {
            entries.push((Key::from(*first), Value::empty_mapping()));
            entries.len() - 1
        }
    };
    if let Value::Mapping(children) = &mut entries[idx].1 {
        insert(children, rest, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_keys_become_nested_mappings() {
        let tree = nest([
            ("/db/host".to_string(), Value::from("localhost")),
            ("/db/port".to_string(), Value::Integer(5432)),
            ("/name".to_string(), Value::from("svc")),
        ]);
        assert_eq!(
            tree,
            Value::mapping([
                (
                    "db",
                    Value::mapping([
                        ("host", Value::from("localhost")),
                        ("port", Value::Integer(5432)),
                    ]),
                ),
                ("name", Value::from("svc")),
            ])
        );
    }

    #[test]
    fn empty_input_is_an_empty_mapping() {
        assert_eq!(nest(Vec::new()), Value::empty_mapping());
    }
}

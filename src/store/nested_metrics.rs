use dashmap::DashMap;
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Hierarchical numeric store fed by external metric submissions.
///
/// A submission `a.b.c = 1.5` lands under path `a.b`, leaf `c`.
#[derive(Debug, Default)]
pub struct NestedMetricsStore {
    groups: DashMap<String, HashMap<String, f64>>,
}

impl NestedMetricsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one leaf value into the group at `path`
    pub fn merge_leaf(&self, path: &str, leaf: &str, value: f64) {
        self.groups
            .entry(path.to_string())
            .or_default()
            .insert(leaf.to_string(), value);
    }

    /// Merge a dotted metric name such as `servers.web1.cpu`
    pub fn submit(&self, metric: &str, value: f64) -> bool {
        let metric = metric.trim_matches('.');
        match metric.rsplit_once('.') {
            Some((path, leaf)) if !path.is_empty() && !leaf.is_empty() => {
                self.merge_leaf(path, leaf, value);
                true
            }
            None if !metric.is_empty() => {
                self.merge_leaf("", metric, value);
                true
            }
            _ => false,
        }
    }

    /// Parse one graphite plaintext line: `<metric> <value> [timestamp]`
    pub fn submit_graphite_line(&self, line: &str) -> bool {
        let mut parts = line.split_whitespace();
        let (Some(metric), Some(value)) = (parts.next(), parts.next()) else {
            return false;
        };
        match value.parse::<f64>() {
            Ok(v) if v.is_finite() => self.submit(metric, v),
            _ => false,
        }
    }

    pub fn leaf(&self, path: &str, leaf: &str) -> Option<f64> {
        self.groups.get(path).and_then(|g| g.get(leaf).copied())
    }

    /// Read-only nested copy of the whole store
    pub fn snapshot(&self) -> Value {
        let mut root = Map::new();
        for group in self.groups.iter() {
            let segments: Vec<&str> = group.key().split('.').filter(|s| !s.is_empty()).collect();
            insert_group(&mut root, &segments, group.value());
        }
        Value::Object(root)
    }
}

fn insert_group(node: &mut Map<String, Value>, segments: &[&str], leaves: &HashMap<String, f64>) {
    match segments.split_first() {
        None => {
            for (leaf, value) in leaves {
                if let Some(number) = serde_json::Number::from_f64(*value) {
                    node.insert(leaf.clone(), Value::Number(number));
                }
            }
        }
        Some((head, rest)) => {
            let child = node
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !child.is_object() {
                *child = Value::Object(Map::new());
            }
            if let Value::Object(map) = child {
                insert_group(map, rest, leaves);
            }
        }
    }
}

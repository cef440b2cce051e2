//! Condition queries over cached task results
//!
//! A query is rewritten token by token before evaluation:
//!
//! 1. data paths (`/r/...`, `/w/...`, `/x/...`) become the JSON value found
//!    under `Data.<selector>` of the cached envelope, so `/r/cpu/load.Load`
//!    reads the `Load` field of the envelope cached at `/r/cpu/load`
//! 2. `tags.<name>` becomes the quoted host tag value (or `""`)
//! 3. any token ending in `name` becomes the quoted hostname
//!
//! Leading `(` characters on a token survive each rewrite. Classification is
//! purely lexical: a trailing `)` glued to a data path token ends up in the
//! selector, and a tag token keeps whatever follows its name.

pub mod expr;

use crate::config::Tags;
use crate::store::ResultCache;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

const DATA_PATH_MARKERS: [&str; 3] = ["/r/", "/w/", "/x/"];

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("data path '{path}': {reason}")]
    DataPath { path: String, reason: String },

    #[error("syntax error: {0}")]
    Syntax(String),

    #[error("'{0}' is not defined")]
    UndefinedIdentifier(String),
}

/// Read access to cached envelopes by canonical path
pub trait DataSource {
    fn envelope(&self, path: &str) -> Option<serde_json::Value>;
}

impl DataSource for HashMap<String, Vec<u8>> {
    fn envelope(&self, path: &str) -> Option<serde_json::Value> {
        self.get(path)
            .and_then(|bytes| serde_json::from_slice(bytes).ok())
    }
}

impl DataSource for BTreeMap<String, serde_json::Value> {
    fn envelope(&self, path: &str) -> Option<serde_json::Value> {
        self.get(path).cloned()
    }
}

impl DataSource for ResultCache {
    fn envelope(&self, path: &str) -> Option<serde_json::Value> {
        self.get(path)
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
    }
}

pub struct QueryParser<'a, D: DataSource + ?Sized> {
    data: &'a D,
    tags: &'a Tags,
    hostname: &'a str,
}

impl<'a, D: DataSource + ?Sized> QueryParser<'a, D> {
    pub fn new(data: &'a D, tags: &'a Tags, hostname: &'a str) -> Self {
        Self {
            data,
            tags,
            hostname,
        }
    }

    /// Run all substitution passes and return the expression text
    pub fn substitute(&self, query: &str) -> Result<String, QueryError> {
        let query = self.replace_data_paths(query)?;
        let query = self.replace_tags(&query);
        Ok(self.replace_hostname(&query))
    }

    pub fn evaluate(&self, query: &str) -> Result<bool, QueryError> {
        let text = self.substitute(query)?;
        Ok(expr::eval(&text)?.truthy())
    }

    fn replace_data_paths(&self, query: &str) -> Result<String, QueryError> {
        let chunks = query
            .split_whitespace()
            .map(|chunk| {
                if !DATA_PATH_MARKERS.iter().any(|m| chunk.contains(m)) {
                    return Ok(chunk.to_string());
                }
                let (parens, bare) = split_leading_parens(chunk);
                let (path, selector) = bare.split_once('.').unwrap_or((bare, ""));
                let value = self.data_value(path, selector)?;
                Ok(format!("{}{}", parens, value))
            })
            .collect::<Result<Vec<_>, QueryError>>()?;
        Ok(chunks.join(" "))
    }

    fn data_value(&self, path: &str, selector: &str) -> Result<serde_json::Value, QueryError> {
        let fail = |reason: String| QueryError::DataPath {
            path: path.to_string(),
            reason,
        };

        let envelope = self
            .data
            .envelope(path)
            .ok_or_else(|| fail("no cached result".to_string()))?;

        let mut current = &envelope;
        for key in std::iter::once("Data").chain(selector.split('.')) {
            let next = match current {
                serde_json::Value::Object(map) => map.get(key),
                serde_json::Value::Array(items) => {
                    key.parse::<usize>().ok().and_then(|i| items.get(i))
                }
                _ => None,
            };
            current = next.ok_or_else(|| fail(format!("no field '{}'", key)))?;
        }
        Ok(current.clone())
    }

    fn replace_tags(&self, query: &str) -> String {
        query
            .split_whitespace()
            .map(|chunk| {
                if !chunk.contains("tags.") {
                    return chunk.to_string();
                }
                let (parens, bare) = split_leading_parens(chunk);
                let name = bare.split('.').nth(1).unwrap_or_default();
                let value = self.tags.get(name).map(String::as_str).unwrap_or_default();
                format!("{}{}", parens, quote(value))
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn replace_hostname(&self, query: &str) -> String {
        query
            .split_whitespace()
            .map(|chunk| {
                if !chunk.ends_with("name") {
                    return chunk.to_string();
                }
                let (parens, _) = split_leading_parens(chunk);
                format!("{}{}", parens, quote(self.hostname))
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Evaluate `query` against `data`, `tags`, and `hostname`
pub fn evaluate<D: DataSource + ?Sized>(
    query: &str,
    data: &D,
    tags: &Tags,
    hostname: &str,
) -> Result<bool, QueryError> {
    QueryParser::new(data, tags, hostname).evaluate(query)
}

fn split_leading_parens(chunk: &str) -> (&str, &str) {
    let bare = chunk.trim_start_matches('(');
    (&chunk[..chunk.len() - bare.len()], bare)
}

fn quote(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (HashMap<String, Vec<u8>>, Tags) {
        let mut data = HashMap::new();
        data.insert(
            "/r/cpu/load".to_string(),
            br#"{"Path":"/r/cpu/load","Data":{"Load":2.5,"Cores":[{"Id":0}]}}"#.to_vec(),
        );
        let mut tags = Tags::new();
        tags.insert("env".to_string(), "prod".to_string());
        (data, tags)
    }

    #[test]
    fn test_data_path_and_tags() {
        let (data, tags) = fixture();
        assert!(evaluate("/r/cpu/load.Load > 2 && tags.env == \"prod\"", &data, &tags, "h1").unwrap());
        assert!(!evaluate("/r/cpu/load.Load > 3", &data, &tags, "h1").unwrap());
    }

    #[test]
    fn test_hostname() {
        let (data, tags) = fixture();
        assert!(evaluate("hostname == \"h1\"", &data, &tags, "h1").unwrap());
        assert!(!evaluate("hostname == \"h2\"", &data, &tags, "h1").unwrap());
    }

    #[test]
    fn test_missing_path_is_error() {
        let (data, tags) = fixture();
        let err = evaluate("/r/missing/path.Load > 0", &data, &tags, "h1").unwrap_err();
        assert!(matches!(err, QueryError::DataPath { .. }));

        let err = evaluate("/r/cpu/load.Nope > 0", &data, &tags, "h1").unwrap_err();
        assert!(matches!(err, QueryError::DataPath { .. }));
    }

    #[test]
    fn test_leading_parens_are_preserved() {
        let (data, tags) = fixture();
        let parser = QueryParser::new(&data, &tags, "h1");
        assert_eq!(
            parser.substitute("((/r/cpu/load.Load > 2) && (tags.env == \"prod\"))").unwrap(),
            "((2.5 > 2) && (\"prod\" == \"prod\"))"
        );
        assert!(parser.evaluate("((/r/cpu/load.Load > 2) && (hostname == \"h1\"))").unwrap());
    }

    #[test]
    fn test_unknown_tag_is_empty_string() {
        let (data, tags) = fixture();
        assert!(evaluate("tags.region == \"\"", &data, &tags, "h1").unwrap());
    }

    #[test]
    fn test_array_selector() {
        let (data, tags) = fixture();
        assert!(evaluate("/r/cpu/load.Cores.0.Id == 0", &data, &tags, "h1").unwrap());
    }

    #[test]
    fn test_result_cache_source() {
        let cache = ResultCache::new(std::time::Duration::from_secs(60));
        cache.set("/r/disk", br#"{"Data":{"Free":10}}"#.to_vec());
        let tags = Tags::new();
        assert!(evaluate("/r/disk.Free >= 10", &cache, &tags, "h1").unwrap());
    }
}

//! Reassembly of corrected chunks into one document.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use super::chunker::Chunk;
use crate::models::{ChunkResult, TextEntry};

/// How the repeated context at the start of a chunk is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum SeamPolicy {
    /// Strip the overlap only when the output repeats it verbatim.
    #[default]
    Exact,
    /// Strip the longest run where the merged text's tail and the output's
    /// head agree, up to the overlap length and at least half of it.
    LongestMatch,
}

/// How values of one field from different chunks combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    /// First non-empty value wins.
    Singular,
    /// Union of all values, first-seen order.
    Set,
    /// Every value kept, tagged with the chunk it came from.
    Text,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldSchema {
    kinds: BTreeMap<String, FieldKind>,
}

impl Default for FieldSchema {
    fn default() -> Self {
        use FieldKind::*;
        let kinds = [
            ("title", Singular),
            ("document_number", Singular),
            ("classification", Singular),
            ("document_date", Singular),
            ("keywords", Set),
            ("entities", Set),
            ("people", Set),
            ("organizations", Set),
            ("locations", Set),
            ("dates", Set),
            ("summary", Text),
            ("notes", Text),
        ]
        .into_iter()
        .map(|(name, kind)| (name.to_string(), kind))
        .collect();
        Self { kinds }
    }
}

impl FieldSchema {
    pub fn empty() -> Self {
        Self {
            kinds: BTreeMap::new(),
        }
    }

    /// Add or replace field kinds.
    pub fn with_fields<I>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = (String, FieldKind)>,
    {
        self.kinds.extend(fields);
        self
    }

    pub fn field_names(&self) -> Vec<String> {
        self.kinds.keys().cloned().collect()
    }

    /// Declared kind, else arrays are sets and everything else singular.
    pub fn kind_of(&self, name: &str, value: &Value) -> FieldKind {
        match self.kinds.get(name) {
            Some(kind) => *kind,
            None if value.is_array() => FieldKind::Set,
            None => FieldKind::Singular,
        }
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.iter().all(is_empty_value),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn normalize(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(s.trim().to_string()),
        other => other.clone(),
    }
}

fn flatten(value: &Value) -> Vec<&Value> {
    match value {
        Value::Array(items) => items.iter().filter(|v| !is_empty_value(v)).collect(),
        v if is_empty_value(v) => Vec::new(),
        v => vec![v],
    }
}

/// Merge structured fields across chunks, in chunk order.
pub fn merge_fields(schema: &FieldSchema, chunks: &[ChunkResult]) -> BTreeMap<String, Value> {
    let mut singular: BTreeMap<String, Value> = BTreeMap::new();
    let mut sets: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    let mut texts: BTreeMap<String, Vec<TextEntry>> = BTreeMap::new();

    let mut ordered: Vec<&ChunkResult> = chunks.iter().collect();
    ordered.sort_by_key(|c| c.chunk_index);

    for chunk in ordered {
        for (name, value) in &chunk.fields {
            if is_empty_value(value) {
                continue;
            }
            match schema.kind_of(name, value) {
                FieldKind::Singular => {
                    singular
                        .entry(name.clone())
                        .or_insert_with(|| normalize(value));
                }
                FieldKind::Set => {
                    let set = sets.entry(name.clone()).or_default();
                    for item in flatten(value) {
                        let item = normalize(item);
                        if !set.contains(&item) {
                            set.push(item);
                        }
                    }
                }
                FieldKind::Text => {
                    let entries = texts.entry(name.clone()).or_default();
                    for item in flatten(value) {
                        let text = match item {
                            Value::String(s) => s.trim().to_string(),
                            other => other.to_string(),
                        };
                        entries.push(TextEntry {
                            chunk: chunk.chunk_index,
                            text,
                        });
                    }
                }
            }
        }
    }

    let mut merged = singular;
    merged.extend(sets.into_iter().map(|(k, v)| (k, Value::Array(v))));
    for (name, entries) in texts {
        let value = serde_json::to_value(entries).unwrap_or(Value::Null);
        merged.insert(name, value);
    }
    merged
}

/// Byte length of the prefix of `next` that repeats the tail of `merged`.
fn longest_seam(merged: &str, next: &str, overlap_chars: usize) -> usize {
    let mut tail: Vec<char> = merged.chars().rev().take(overlap_chars).collect();
    tail.reverse();
    let head: Vec<char> = next.chars().take(overlap_chars).collect();
    let min_k = overlap_chars.div_ceil(2).max(1);

    let max_k = tail.len().min(head.len());
    for k in (min_k..=max_k).rev() {
        if tail[tail.len() - k..] == head[..k] {
            return head[..k].iter().map(|c| c.len_utf8()).sum();
        }
    }
    0
}

fn trailing_whitespace(s: &str) -> &str {
    &s[s.trim_end().len()..]
}

/// Concatenate corrected chunk texts in order, removing each chunk's
/// repeated context once. Where the collaborator dropped a chunk's trailing
/// separator, the original separator is put back so paragraphs stay apart.
pub fn merge_texts(chunks: &[Chunk], outputs: &[&str], policy: SeamPolicy) -> String {
    let mut merged = String::new();
    for (chunk, &output) in chunks.iter().zip(outputs) {
        let mut body = output;
        if !chunk.overlap.is_empty() {
            body = match policy {
                SeamPolicy::Exact => match output.strip_prefix(chunk.overlap.as_str()) {
                    Some(rest) => rest,
                    None => {
                        warn!(
                            "Chunk {} does not repeat its overlap verbatim; keeping it whole",
                            chunk.index
                        );
                        output
                    }
                },
                SeamPolicy::LongestMatch => {
                    let strip = longest_seam(&merged, output, chunk.overlap.chars().count());
                    &output[strip..]
                }
            };
        }
        merged.push_str(body);

        let separator = trailing_whitespace(&chunk.body);
        if !body.is_empty() && !separator.is_empty() && trailing_whitespace(body).is_empty() {
            merged.push_str(separator);
        }
    }
    merged
}

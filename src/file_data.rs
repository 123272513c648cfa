//! File-based data source for testing and local development.
//!
//! Reads one or more JSON files with top-level `flags`, `flagValues` and
//! `segments` keys, merges them, and delivers the result as a single `put`.
//! The `flagValues` form is shorthand: each entry expands to a minimal
//! always-on flag serving that one value. When the same key appears in
//! multiple files the first occurrence wins and the duplicate is logged.

use crate::message::Message;
use crate::models::{AllData, FeatureFlag, Segment, VariationOrRollout};
use crate::source::Source;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Clone, Debug, thiserror::Error)]
pub enum FileDataError {
    #[error("Failed to read {path}: {message}")]
    Io { path: PathBuf, message: String },

    #[error("Failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// A [Source] reading flag data from files.
pub struct FileDataSource {
    paths: Vec<PathBuf>,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileContents {
    #[serde(default)]
    flags: HashMap<String, FeatureFlag>,
    #[serde(default)]
    flag_values: HashMap<String, Value>,
    #[serde(default)]
    segments: HashMap<String, Segment>,
}

impl FileDataSource {
    pub fn new<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
        }
    }

    /// Read and merge every configured file.
    pub fn load(&self) -> Result<AllData, FileDataError> {
        let mut data = AllData::default();
        for path in &self.paths {
            let contents = read_file(path)?;
            merge_file(&mut data, path, contents);
        }
        Ok(data)
    }
}

fn read_file(path: &Path) -> Result<FileContents, FileDataError> {
    let text = std::fs::read_to_string(path).map_err(|error| FileDataError::Io {
        path: path.to_path_buf(),
        message: error.to_string(),
    })?;
    serde_json::from_str(&text).map_err(|error| FileDataError::Parse {
        path: path.to_path_buf(),
        message: error.to_string(),
    })
}

fn merge_file(data: &mut AllData, path: &Path, contents: FileContents) {
    for (key, mut flag) in contents.flags {
        if data.flags.contains_key(&key) {
            warn!(%key, ?path, "duplicate flag key, keeping the first");
            continue;
        }
        // file flags carry no real version or salt
        flag.version = 1;
        flag.salt = "salt".to_string();
        data.flags.insert(key, flag);
    }

    for (key, value) in contents.flag_values {
        if data.flags.contains_key(&key) {
            warn!(%key, ?path, "duplicate flag key, keeping the first");
            continue;
        }
        data.flags.insert(key.clone(), expand_simple_flag(key, value));
    }

    for (key, segment) in contents.segments {
        if data.segments.contains_key(&key) {
            warn!(%key, ?path, "duplicate segment key, keeping the first");
            continue;
        }
        data.segments.insert(key, segment);
    }
}

/// Expand a `flagValues` entry into a minimal flag serving one constant.
fn expand_simple_flag(key: String, value: Value) -> FeatureFlag {
    FeatureFlag {
        key,
        version: 1,
        on: true,
        salt: "salt".to_string(),
        variations: vec![value],
        fallthrough: Some(VariationOrRollout {
            variation: Some(0),
            rollout: None,
        }),
        ..FeatureFlag::default()
    }
}

impl Source for FileDataSource {
    type Error = FileDataError;
    type Stream = futures::stream::Iter<std::vec::IntoIter<Result<Message, FileDataError>>>;

    fn stream(&self) -> Self::Stream {
        let item = self.load().map(Message::Put);
        futures::stream::iter(vec![item])
    }
}

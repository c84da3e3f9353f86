//! Finding collection source files in an input directory.

use std::cmp::Ordering;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use super::{Collection, CollectionError};
use crate::constants::{COLLECTION_EXTENSION, ERROR_LOG_PREFIX, UNCATEGORIZED_EXPORT_FILE};

static GROUP_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(Group (\d+)\)").unwrap());

fn group_number(name: &str) -> Option<u32> {
    GROUP_PATTERN
        .captures(name)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Named collections first, by case-insensitive name; then uncategorized
/// groups by group number.
fn processing_order(a: &Collection, b: &Collection) -> Ordering {
    match (a.uncategorized, b.uncategorized) {
        (false, true) => Ordering::Less,
        (true, false) => Ordering::Greater,
        (false, false) => a
            .name
            .to_lowercase()
            .cmp(&b.name.to_lowercase())
            .then_with(|| a.name.cmp(&b.name)),
        (true, true) => group_number(&a.name)
            .unwrap_or(0)
            .cmp(&group_number(&b.name).unwrap_or(0))
            .then_with(|| a.name.cmp(&b.name)),
    }
}

fn has_collection_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(COLLECTION_EXTENSION))
}

/// Collections to process for `input`.
///
/// A file yields that one collection. A directory yields every `.txt` file
/// in it except error logs and the raw uncategorized export.
///
/// # Errors
///
/// Returns an error if `input` cannot be read.
pub async fn discover(input: &Path) -> Result<Vec<Collection>, CollectionError> {
    let read_err = |source| CollectionError::ReadInput {
        path: input.to_path_buf(),
        source,
    };
    let metadata = tokio::fs::metadata(input).await.map_err(read_err)?;
    if metadata.is_file() {
        return Ok(vec![Collection::from_source(input)?]);
    }

    let mut collections = Vec::new();
    let mut entries = tokio::fs::read_dir(input).await.map_err(read_err)?;
    while let Some(entry) = entries.next_entry().await.map_err(read_err)? {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if !path.is_file()
            || !has_collection_extension(&path)
            || name.starts_with(ERROR_LOG_PREFIX)
            || name == UNCATEGORIZED_EXPORT_FILE
        {
            continue;
        }
        match Collection::from_source(&path) {
            Ok(collection) => collections.push(collection),
            Err(e) => debug!(path = %path.display(), error = %e, "Skipping file"),
        }
    }

    collections.sort_by(processing_order);
    Ok(collections)
}

/// Collections that have an error log in `dir`, in processing order.
///
/// # Errors
///
/// Returns an error if `dir` cannot be read.
pub async fn with_error_logs(dir: &Path) -> Result<Vec<Collection>, CollectionError> {
    let read_err = |source| CollectionError::ReadInput {
        path: dir.to_path_buf(),
        source,
    };
    let mut collections = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await.map_err(read_err)?;
    while let Some(entry) = entries.next_entry().await.map_err(read_err)? {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if !path.is_file() || !name.starts_with(ERROR_LOG_PREFIX) {
            continue;
        }
        if let Some(collection) = Collection::from_error_log(&path) {
            collections.push(collection);
        }
    }
    collections.sort_by(processing_order);
    Ok(collections)
}

/// Remote namespace for `input`: the input directory's name, or the name
/// of the directory holding a single input file.
#[must_use]
pub fn namespace_for(input: &Path) -> String {
    let dir = if input.is_file() {
        input.parent().unwrap_or(input)
    } else {
        input
    };
    dir.file_name()
        .map_or_else(|| "default".to_string(), |n| n.to_string_lossy().to_string())
}

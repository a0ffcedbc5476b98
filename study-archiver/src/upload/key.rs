use chrono::{DateTime, Utc};

use crate::pipeline::JobId;
use crate::source::DatasetMetadata;
use crate::utils::filename::sanitize_key_component;

/// Extension of every archive object.
pub const ARCHIVE_EXTENSION: &str = "zip";

/// Build `{prefix}/{YYYY}/{MM}/{DD}/{name}_{id}_{HHMMSS}_{job}.zip` for a dataset.
///
/// The name is omitted when the dataset has no name of its own. The time and
/// job id keep repeated archives of one dataset from replacing each other.
pub fn object_key(
    prefix: &str,
    metadata: &DatasetMetadata,
    job_id: JobId,
    now: DateTime<Utc>,
) -> String {
    let id = sanitize_key_component(&metadata.id);
    let name = sanitize_key_component(metadata.display_name());
    let dataset = if name == id {
        id
    } else {
        format!("{name}_{id}")
    };
    let file_stem = format!("{dataset}_{}_{job_id}", now.format("%H%M%S"));

    let date = now.format("%Y/%m/%d");
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        format!("{date}/{file_stem}.{ARCHIVE_EXTENSION}")
    } else {
        format!("{prefix}/{date}/{file_stem}.{ARCHIVE_EXTENSION}")
    }
}

/// Public URL of `key` under `base`, if a public base is configured.
pub fn public_url(base: Option<&str>, key: &str) -> Option<String> {
    let base = base?.trim_end_matches('/');
    if base.is_empty() {
        return None;
    }
    Some(format!("{base}/{key}"))
}

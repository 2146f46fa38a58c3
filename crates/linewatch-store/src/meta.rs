//! Per-route metadata: one JSON map from file id to upload record.
//!
//! The map lives next to the assets as `metadata.json`. Loading is forgiving,
//! a missing or corrupt file reads as an empty route; saving goes through a
//! sibling temp file and a rename so a crash never leaves a half-written map.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use linewatch_annotate::DetectionSummary;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::Result;

/// File name of the per-route map, relative to the route directory.
pub const METADATA_FILE: &str = "metadata.json";

/// One uploaded file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Name the client uploaded the file under.
    pub original_name: String,
    /// Extension of that name, lowercased, with the leading dot. Empty when
    /// the name had none.
    pub extension: String,
    pub uploaded_at: DateTime<Utc>,
    /// Detection counts, flattened into the record. Absent (all five fields
    /// missing) when the file was stored without processing.
    #[serde(flatten)]
    pub summary: Option<DetectionSummary>,
    /// Why processing was skipped or failed, when it was.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// file id → record. Ordered map so the JSON on disk is stable.
pub type RouteMeta = BTreeMap<String, FileRecord>;

/// Read a route's metadata map. Missing and unreadable files both load as an
/// empty map; corruption is logged, never fatal.
pub async fn load(path: &Path) -> RouteMeta {
    match tokio::fs::read(path).await {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(meta) => meta,
            Err(e) => {
                warn!(
                    "corrupt metadata at {}: {e}; treating route as empty",
                    path.display()
                );
                RouteMeta::new()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => RouteMeta::new(),
        Err(e) => {
            warn!(
                "unreadable metadata at {}: {e}; treating route as empty",
                path.display()
            );
            RouteMeta::new()
        }
    }
}

/// Persist a route's metadata map: write a sibling temp file, then rename it
/// over the real one.
pub async fn save(path: &Path, meta: &RouteMeta) -> Result<()> {
    let json = serde_json::to_vec_pretty(meta)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

// linewatch-store/src/lib.rs
// ============================================================
// linewatch-store  –  Route-scoped photo storage
// Owns the on-disk layout, runs uploads through the detection
// pipeline and keeps per-route metadata and defect statistics.
// ------------------------------------------------------------
// <root>/<route_id>/metadata.json            file id → record
// <root>/<route_id>/<file_id>.<ext>          original upload
// <root>/<route_id>/<file_id>_processed.jpg  annotated copy
// ============================================================

//! Per-route storage for inspection photos.
//!
//! [`RouteStore`] is the piece an HTTP layer talks to: a batch upload runs
//! each image through letterbox → model → decode → NMS → remap → annotate on
//! the blocking pool, stores the original next to the annotated JPEG and
//! records a [`FileRecord`] per file. Reads reconcile the metadata against
//! what is actually on disk, so assets removed out-of-band simply disappear
//! from listings instead of erroring.
//!
//! Metadata mutation is serialized per route behind an async mutex; two
//! concurrent uploads to the same route cannot tear the metadata map.

mod config;
pub mod meta;

pub use self::config::{load_config, AnnotateConfig, ModelConfig, StorageConfig, StoreConfig};
pub use meta::{FileRecord, RouteMeta, METADATA_FILE};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use linewatch_annotate::{Annotator, DetectionSummary};
use linewatch_detect::{
    decode_raw_output, non_max_suppression, remap_detections, DetectionEngine, IOU_THRESHOLD,
};
use linewatch_preprocess::{decode_image, Letterbox};

/// Upload extensions recognized as images (lowercase, with the dot).
pub const IMAGE_EXTENSIONS: [&str; 7] = [
    ".jpg", ".jpeg", ".png", ".bmp", ".tiff", ".tif", ".webp",
];

/// Suffix of the annotated asset next to its original.
pub const PROCESSED_SUFFIX: &str = "_processed.jpg";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("file {file} not found in route {route}")]
    NotFound { route: String, file: String },
    #[error("invalid id {0:?}")]
    InvalidId(String),
    #[error("metadata serialization failed: {0}")]
    Meta(#[from] serde_json::Error),
    #[error("configuration error: {0}")]
    Config(#[from] ::config::ConfigError),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Where one photo died inside the pipeline. Internal; callers see it
/// flattened into the outcome string and the metadata note.
#[derive(Debug, Error)]
enum PipelineError {
    #[error("preprocess: {0}")]
    Preprocess(#[from] linewatch_preprocess::PreprocessError),
    #[error("inference: {0}")]
    Inference(#[from] linewatch_detect::EngineError),
    #[error("postprocess: {0}")]
    Postprocess(#[from] linewatch_detect::DetectError),
    #[error("annotate: {0}")]
    Annotate(#[from] linewatch_annotate::AnnotateError),
}

/// Outcome of one file inside an upload batch, reported in input order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UploadOutcome {
    /// Stored and ran through the detection pipeline.
    Processed {
        original_name: String,
        file_id: String,
        processed_path: PathBuf,
        summary: DetectionSummary,
    },
    /// Stored untouched: not an image, or no engine to run.
    Skipped {
        original_name: String,
        file_id: String,
        note: String,
    },
    /// Stored, but the pipeline failed on it. The original is kept so the
    /// photo can be reprocessed later.
    Failed {
        original_name: String,
        file_id: String,
        error: String,
    },
}

impl UploadOutcome {
    pub fn original_name(&self) -> &str {
        match self {
            Self::Processed { original_name, .. }
            | Self::Skipped { original_name, .. }
            | Self::Failed { original_name, .. } => original_name,
        }
    }

    pub fn file_id(&self) -> &str {
        match self {
            Self::Processed { file_id, .. }
            | Self::Skipped { file_id, .. }
            | Self::Failed { file_id, .. } => file_id,
        }
    }
}

/// Report for one [`RouteStore::upload_batch`] call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadReport {
    /// Files written to disk. Every input lands on disk whatever its
    /// outcome, so this equals the batch size.
    pub uploaded_count: usize,
    pub outcomes: Vec<UploadOutcome>,
}

/// One row of [`RouteStore::list_files`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessedEntry {
    pub original_name: String,
    pub processed_id: String,
    pub processed_path: PathBuf,
}

/// Defect statistics for one route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct RouteStats {
    /// Files with both assets still on disk and a recorded summary.
    pub total_processed: usize,
    /// Photos with at least one defect-class detection.
    pub with_defects: usize,
    /// Photos with detections, none of them defects.
    pub without_defects: usize,
}

/// Per-route photo store with the detection pipeline wired in.
pub struct RouteStore {
    root: PathBuf,
    engine: Option<Arc<dyn DetectionEngine>>,
    annotator: Arc<Annotator>,
    route_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RouteStore {
    /// Open the store, creating the root directory if needed.
    ///
    /// `engine: None` keeps uploads working when no model is available;
    /// files are stored unprocessed with a note instead of failing the batch.
    pub fn open(cfg: StoreConfig, engine: Option<Arc<dyn DetectionEngine>>) -> Result<Self> {
        std::fs::create_dir_all(&cfg.storage.root)?;
        if engine.is_none() {
            warn!("no detection engine; uploads will be stored unprocessed");
        }
        let annotator = Arc::new(Annotator::new(
            cfg.annotate.font_path.as_deref().map(Path::new),
            cfg.annotate.jpeg_quality,
        ));
        info!("route store open at {}", cfg.storage.root.display());
        Ok(Self {
            root: cfg.storage.root,
            engine,
            annotator,
            route_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Store a batch of uploads under one route.
    ///
    /// Each image runs through the detection pipeline; non-images and files
    /// that fail processing are kept as originals with a note. A file whose
    /// name the route has seen before replaces the earlier upload. Metadata
    /// is saved after every file and once more after the batch.
    pub async fn upload_batch(
        &self,
        route_id: &str,
        files: Vec<(String, Vec<u8>)>,
    ) -> Result<UploadReport> {
        let dir = self.route_dir(route_id)?;

        let lock = self.route_lock(route_id).await;
        let _guard = lock.lock().await;

        // created under the route lock; a concurrent route delete orders
        // entirely before or after this batch, never inside it
        tokio::fs::create_dir_all(&dir).await?;

        let meta_path = dir.join(METADATA_FILE);
        let mut meta = meta::load(&meta_path).await;
        let mut outcomes = Vec::with_capacity(files.len());

        for (original_name, bytes) in files {
            // 1. a re-upload under the same name replaces the older copy
            if let Some((old_id, old_ext)) = meta
                .iter()
                .find(|(_, rec)| rec.original_name == original_name)
                .map(|(id, rec)| (id.clone(), rec.extension.clone()))
            {
                meta.remove(&old_id);
                remove_if_exists(&dir.join(format!("{old_id}{old_ext}"))).await?;
                remove_if_exists(&dir.join(format!("{old_id}{PROCESSED_SUFFIX}"))).await?;
                debug!("route {route_id}: {original_name} replaces earlier upload {old_id}");
            }

            let file_id = Uuid::new_v4().to_string();
            let extension = extension_of(&original_name);

            // 2. the original goes to disk first, so nothing is lost however
            //    the pipeline ends
            tokio::fs::write(dir.join(format!("{file_id}{extension}")), &bytes).await?;

            let mut record = FileRecord {
                original_name: original_name.clone(),
                extension,
                uploaded_at: Utc::now(),
                summary: None,
                note: None,
            };

            // 3. detection pipeline on the blocking pool
            let outcome = if !is_image_name(&original_name) {
                let note = "not an image, stored as-is".to_string();
                record.note = Some(note.clone());
                UploadOutcome::Skipped {
                    original_name,
                    file_id: file_id.clone(),
                    note,
                }
            } else if let Some(engine) = self.engine.clone() {
                let annotator = self.annotator.clone();
                let joined = tokio::task::spawn_blocking(move || {
                    process_photo(engine.as_ref(), &annotator, &bytes)
                })
                .await;

                match joined {
                    Ok(Ok((jpeg, summary))) => {
                        let processed_path = dir.join(format!("{file_id}{PROCESSED_SUFFIX}"));
                        tokio::fs::write(&processed_path, &jpeg).await?;
                        record.summary = Some(summary);
                        UploadOutcome::Processed {
                            original_name,
                            file_id: file_id.clone(),
                            processed_path,
                            summary,
                        }
                    }
                    Ok(Err(e)) => {
                        warn!("route {route_id}: processing {original_name} failed: {e}");
                        record.note = Some(format!("processing failed: {e}"));
                        UploadOutcome::Failed {
                            original_name,
                            file_id: file_id.clone(),
                            error: e.to_string(),
                        }
                    }
                    Err(join_err) => {
                        warn!(
                            "route {route_id}: processing task for {original_name} \
                             did not finish: {join_err}"
                        );
                        record.note = Some(format!("processing failed: {join_err}"));
                        UploadOutcome::Failed {
                            original_name,
                            file_id: file_id.clone(),
                            error: join_err.to_string(),
                        }
                    }
                }
            } else {
                let note = "no detection engine available".to_string();
                record.note = Some(note.clone());
                UploadOutcome::Skipped {
                    original_name,
                    file_id: file_id.clone(),
                    note,
                }
            };

            // 4. record the file, persist before touching the next one
            meta.insert(file_id, record);
            meta::save(&meta_path, &meta).await?;
            outcomes.push(outcome);
        }

        meta::save(&meta_path, &meta).await?;
        info!("route {route_id}: stored {} file(s)", outcomes.len());
        Ok(UploadReport {
            uploaded_count: outcomes.len(),
            outcomes,
        })
    }

    /// Read back the annotated JPEG for one file.
    ///
    /// `NotFound` covers every way the asset can be missing: unknown route,
    /// unknown id, a file stored unprocessed, or an entry whose original was
    /// removed out-of-band.
    pub async fn fetch_processed(&self, route_id: &str, file_id: &str) -> Result<Vec<u8>> {
        let dir = self.route_dir(route_id)?;
        checked_id(file_id)?;

        let meta = meta::load(&dir.join(METADATA_FILE)).await;
        let not_found = || StoreError::NotFound {
            route: route_id.to_string(),
            file: file_id.to_string(),
        };
        let record = meta.get(file_id).ok_or_else(not_found)?;

        // the original is the entry's anchor; without it the file counts as
        // deleted even if a processed copy survives
        if !path_exists(&dir.join(format!("{file_id}{}", record.extension))).await {
            return Err(not_found());
        }
        match tokio::fs::read(dir.join(format!("{file_id}{PROCESSED_SUFFIX}"))).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(not_found()),
            Err(e) => Err(e.into()),
        }
    }

    /// Every file in the route that still has both its original upload and
    /// its processed copy on disk, oldest upload first.
    pub async fn list_files(&self, route_id: &str) -> Result<Vec<ProcessedEntry>> {
        let dir = self.route_dir(route_id)?;
        let meta = meta::load(&dir.join(METADATA_FILE)).await;

        let mut rows: Vec<(DateTime<Utc>, ProcessedEntry)> = Vec::new();
        for (file_id, record) in &meta {
            if !path_exists(&dir.join(format!("{file_id}{}", record.extension))).await {
                continue;
            }
            let processed_path = dir.join(format!("{file_id}{PROCESSED_SUFFIX}"));
            if !path_exists(&processed_path).await {
                continue;
            }
            rows.push((
                record.uploaded_at,
                ProcessedEntry {
                    original_name: record.original_name.clone(),
                    processed_id: file_id.clone(),
                    processed_path,
                },
            ));
        }
        rows.sort_by(|a, b| {
            a.0.cmp(&b.0)
                .then_with(|| a.1.processed_id.cmp(&b.1.processed_id))
        });
        Ok(rows.into_iter().map(|(_, entry)| entry).collect())
    }

    /// Defect statistics over files whose original and processed assets are
    /// both still on disk.
    ///
    /// A processed photo with zero detections counts toward `total_processed`
    /// and neither bucket; a photo with both defect and regular detections
    /// counts as defective.
    pub async fn route_stats(&self, route_id: &str) -> Result<RouteStats> {
        let dir = self.route_dir(route_id)?;
        let meta = meta::load(&dir.join(METADATA_FILE)).await;

        let mut stats = RouteStats::default();
        for (file_id, record) in &meta {
            let Some(summary) = record.summary else {
                continue;
            };
            if !path_exists(&dir.join(format!("{file_id}{}", record.extension))).await
                || !path_exists(&dir.join(format!("{file_id}{PROCESSED_SUFFIX}"))).await
            {
                continue;
            }
            stats.total_processed += 1;
            if summary.has_red {
                stats.with_defects += 1;
            } else if summary.has_green {
                stats.without_defects += 1;
            }
        }
        Ok(stats)
    }

    /// Remove one file's assets and metadata entry. Returns whether anything
    /// was actually there; deleting twice is not an error.
    pub async fn delete_file(&self, route_id: &str, file_id: &str) -> Result<bool> {
        let dir = self.route_dir(route_id)?;
        checked_id(file_id)?;

        let lock = self.route_lock(route_id).await;
        let _guard = lock.lock().await;

        let meta_path = dir.join(METADATA_FILE);
        let mut meta = meta::load(&meta_path).await;
        let record = meta.remove(file_id);

        // with a record the original's extension is known; without one,
        // sweep for an original left behind by an interrupted upload
        let mut removed = match record.as_ref() {
            Some(rec) => {
                remove_if_exists(&dir.join(format!("{file_id}{}", rec.extension))).await?
            }
            None => remove_unrecorded_original(&dir, file_id).await?,
        };
        removed |= remove_if_exists(&dir.join(format!("{file_id}{PROCESSED_SUFFIX}"))).await?;

        if record.is_some() {
            meta::save(&meta_path, &meta).await?;
            debug!("route {route_id}: deleted {file_id}");
        }
        Ok(record.is_some() || removed)
    }

    /// Delete a whole route: every file, the metadata map and the directory
    /// itself. Returns how many files had metadata entries.
    pub async fn delete_route(&self, route_id: &str) -> Result<usize> {
        let dir = self.route_dir(route_id)?;

        let lock = self.route_lock(route_id).await;
        let _guard = lock.lock().await;

        let meta_path = dir.join(METADATA_FILE);
        let mut meta = meta::load(&meta_path).await;
        let ids: Vec<String> = meta.keys().cloned().collect();
        let mut removed = 0usize;
        for file_id in ids {
            let extension = meta
                .remove(&file_id)
                .map(|rec| rec.extension)
                .unwrap_or_default();
            remove_if_exists(&dir.join(format!("{file_id}{extension}"))).await?;
            remove_if_exists(&dir.join(format!("{file_id}{PROCESSED_SUFFIX}"))).await?;
            meta::save(&meta_path, &meta).await?;
            removed += 1;
        }
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        // two strong refs = the map's plus this call's; more means another
        // task still holds this mutex, and the entry has to keep resolving
        // to that same instance, never a fresh one
        let mut locks = self.route_locks.lock().await;
        if locks.get(route_id).is_some_and(|l| Arc::strong_count(l) == 2) {
            locks.remove(route_id);
        }
        drop(locks);

        info!("route {route_id} deleted ({removed} file(s))");
        Ok(removed)
    }

    fn route_dir(&self, route_id: &str) -> Result<PathBuf> {
        Ok(self.root.join(checked_id(route_id)?))
    }

    async fn route_lock(&self, route_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.route_locks.lock().await;
        locks.entry(route_id.to_string()).or_default().clone()
    }
}

/// Run one photo through the full pipeline. Blocking; called on the blocking
/// pool.
fn process_photo(
    engine: &dyn DetectionEngine,
    annotator: &Annotator,
    bytes: &[u8],
) -> std::result::Result<(Vec<u8>, DetectionSummary), PipelineError> {
    let img = decode_image(bytes)?;
    let (input_w, input_h) = engine.input_size();
    let letterbox = Letterbox::new(input_w, input_h);
    let (input, plan) = letterbox.run(&img)?;

    let raw = engine.run(&input)?;
    let dets = decode_raw_output(raw.view(), letterbox.target())?;
    let dets = non_max_suppression(dets, IOU_THRESHOLD);
    let dets = remap_detections(dets, &plan);
    debug!(
        "{} detection(s) on a {}x{} photo",
        dets.len(),
        plan.orig.0,
        plan.orig.1
    );

    Ok(annotator.annotate(img, &dets)?)
}

/// Extension of an uploaded name: lowercased, with the leading dot, empty
/// when there is none. Only the basename counts, so a dotted directory in a
/// relative upload name does not leak in.
fn extension_of(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    match base.rfind('.') {
        Some(i) if i > 0 => base[i..].to_ascii_lowercase(),
        _ => String::new(),
    }
}

/// Upload-time image check, by extension alone; the bytes are not sniffed.
fn is_image_name(name: &str) -> bool {
    let ext = extension_of(name);
    IMAGE_EXTENSIONS.contains(&ext.as_str())
}

/// Reject ids that could escape the store root when joined onto a path.
fn checked_id(id: &str) -> Result<&str> {
    let bad = id.is_empty()
        || id == "."
        || id == ".."
        || id.contains('/')
        || id.contains('\\')
        || id.contains('\0');
    if bad {
        return Err(StoreError::InvalidId(id.to_string()));
    }
    Ok(id)
}

async fn path_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

async fn remove_if_exists(path: &Path) -> std::io::Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Remove an original whose metadata record never made it to disk, e.g.
/// after a crash between the asset write and the metadata save. The
/// extension is unknown, so any `<file_id>.<ext>` (or bare `<file_id>`)
/// entry in the route directory counts.
async fn remove_unrecorded_original(dir: &Path, file_id: &str) -> std::io::Result<bool> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    let dotted = format!("{file_id}.");
    let mut removed = false;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name == METADATA_FILE {
            continue;
        }
        if name == file_id || name.starts_with(&dotted) {
            removed |= remove_if_exists(&entry.path()).await?;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_is_lowercased_and_keeps_the_dot() {
        assert_eq!(extension_of("tower.JPG"), ".jpg");
        assert_eq!(extension_of("a.tar.gz"), ".gz");
        assert_eq!(extension_of("noext"), "");
        assert_eq!(extension_of(".bashrc"), "");
        assert_eq!(extension_of("dir.v2/file"), "");
        assert_eq!(extension_of("dir\\photo.PNG"), ".png");
    }

    #[test]
    fn image_check_follows_the_extension_allow_list() {
        for name in [
            "a.jpg", "a.JPEG", "a.png", "a.bmp", "a.tiff", "a.tif", "a.webp",
        ] {
            assert!(is_image_name(name), "{name} should count as an image");
        }
        for name in ["a.txt", "a.gif", "a.jpg.exe", "archive", ".png"] {
            assert!(!is_image_name(name), "{name} should not count as an image");
        }
    }

    #[test]
    fn path_escaping_ids_are_rejected() {
        for id in ["", ".", "..", "a/b", "a\\b", "nul\0byte"] {
            assert!(checked_id(id).is_err(), "{id:?} should be rejected");
        }
        assert!(checked_id("route-7").is_ok());
        assert!(checked_id("550e8400-e29b-41d4-a716-446655440000").is_ok());
    }
}

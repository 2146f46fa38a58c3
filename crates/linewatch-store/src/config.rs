//! Store configuration.
//!
//! Loaded from `linewatch.toml` (working directory) with environment variable
//! overrides. Env format: `LINEWATCH__SECTION__KEY` (double underscore
//! separators), e.g. `LINEWATCH__STORAGE__ROOT=/var/lib/linewatch`.

use std::path::PathBuf;

use serde::Deserialize;

use crate::Result;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub annotate: AnnotateConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Directory holding one subdirectory per route.
    #[serde(default = "default_root")]
    pub root: PathBuf,
}

fn default_root() -> PathBuf {
    PathBuf::from("routes")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_model_path")]
    pub path: String,
    /// Name of the model's input tensor.
    #[serde(default = "default_input_name")]
    pub input_name: String,
    /// Square model input edge in pixels.
    #[serde(default = "default_input_size")]
    pub input_size: u32,
}

fn default_model_path() -> String {
    "models/linewatch.onnx".to_string()
}
fn default_input_name() -> String {
    "images".to_string()
}
fn default_input_size() -> u32 {
    640
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: default_model_path(),
            input_name: default_input_name(),
            input_size: default_input_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnnotateConfig {
    /// TTF font for box labels; without it boxes are drawn label-less.
    pub font_path: Option<String>,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

fn default_jpeg_quality() -> u8 {
    linewatch_annotate::JPEG_QUALITY
}

impl Default for AnnotateConfig {
    fn default() -> Self {
        Self {
            font_path: None,
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

/// Load configuration from `linewatch.toml` + environment variable overrides.
///
/// Search order:
///   1. `./linewatch.toml` (working directory, optional)
///   2. Environment variables: `LINEWATCH__MODEL__PATH`, etc.
pub fn load_config() -> Result<StoreConfig> {
    let builder = config::Config::builder()
        .add_source(config::File::with_name("linewatch").required(false))
        .add_source(
            config::Environment::with_prefix("LINEWATCH")
                .separator("__")
                .try_parsing(true),
        );

    let settings = builder.build()?;
    Ok(settings.try_deserialize::<StoreConfig>()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_every_field() {
        let cfg = StoreConfig::default();
        assert_eq!(cfg.storage.root, PathBuf::from("routes"));
        assert_eq!(cfg.model.path, "models/linewatch.onnx");
        assert_eq!(cfg.model.input_name, "images");
        assert_eq!(cfg.model.input_size, 640);
        assert_eq!(cfg.annotate.font_path, None);
        assert_eq!(cfg.annotate.jpeg_quality, 95);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let cfg: StoreConfig = config::Config::builder()
            .add_source(config::File::from_str(
                "[storage]\nroot = \"/tmp/lw-routes\"\n\n[model]\npath = \"m.onnx\"\n",
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(cfg.storage.root, PathBuf::from("/tmp/lw-routes"));
        assert_eq!(cfg.model.path, "m.onnx");
        assert_eq!(cfg.model.input_size, 640);
        assert_eq!(cfg.annotate.jpeg_quality, 95);
    }
}

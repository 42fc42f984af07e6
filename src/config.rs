use std::path::{Path, PathBuf};

/// Directory holding the artifacts, relative to the working directory.
pub const DEFAULT_MODEL_DIR: &str = "model";

pub const CLASSIFIER_ARTIFACT: &str = "rfc.pkl";
pub const PROJECTION_ARTIFACT: &str = "trained_pca.pkl";
pub const CLASSIFIER_JSON: &str = "rfc.json";
pub const PROJECTION_JSON: &str = "trained_pca.json";

/// Where the exporter reads artifacts and writes JSON.
///
/// The binary always uses [`ExportConfig::default`]; other roots exist for tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportConfig {
    pub model_dir: PathBuf,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self::in_dir(DEFAULT_MODEL_DIR)
    }
}

impl ExportConfig {
    pub fn in_dir(model_dir: impl Into<PathBuf>) -> Self {
        Self {
            model_dir: model_dir.into(),
        }
    }

    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }

    pub fn classifier_input(&self) -> PathBuf {
        self.model_dir.join(CLASSIFIER_ARTIFACT)
    }

    pub fn projection_input(&self) -> PathBuf {
        self.model_dir.join(PROJECTION_ARTIFACT)
    }

    pub fn classifier_output(&self) -> PathBuf {
        self.model_dir.join(CLASSIFIER_JSON)
    }

    pub fn projection_output(&self) -> PathBuf {
        self.model_dir.join(PROJECTION_JSON)
    }
}

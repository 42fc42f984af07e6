use std::collections::BTreeMap;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use log::{debug, info};
use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use tempfile::NamedTempFile;

use crate::config::ExportConfig;
use crate::data::loader::{load_classifier_collection, load_projection_model};
use crate::data::model::ArrayLike;
use crate::data::normalize::{normalize, Nested};
use crate::error::ExportError;

// ---------------------------------------------------------------------------
// Output documents
// ---------------------------------------------------------------------------

/// One entry of `rfc.json`. Field order is the emitted key order.
#[derive(Debug, Serialize)]
struct ClassifierDocument {
    alpha: Nested,
    beta: Nested,
    n_components: i64,
    degree_n: i64,
    degree_d: i64,
}

/// The whole of `trained_pca.json`.
#[derive(Debug, Serialize)]
struct ProjectionDocument {
    components: Nested,
    mean: Nested,
    explained_variance: Nested,
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// Ensure the model directory exists, then export both artifacts.
/// Stops at the first failure.
pub fn run(config: &ExportConfig) -> Result<(), ExportError> {
    ensure_dir(config.model_dir())?;
    export_classifier_models(&config.classifier_input(), &config.classifier_output())?;
    export_projection_model(&config.projection_input(), &config.projection_output())?;
    Ok(())
}

/// Convert the per-class model collection at `input` into JSON at `output`.
pub fn export_classifier_models(input: &Path, output: &Path) -> Result<(), ExportError> {
    info!("Loading classifier models from {}", input.display());
    let collection = load_classifier_collection(input)?;

    let mut document = BTreeMap::new();
    for (label, bundle) in collection.iter() {
        let field = |name: &str, value: &ArrayLike| {
            normalize_field(input, &format!("{label}.{name}"), value)
        };
        document.insert(
            label.clone(),
            ClassifierDocument {
                alpha: field("alpha", &bundle.alpha)?,
                beta: field("beta", &bundle.beta)?,
                n_components: bundle.n_components,
                degree_n: bundle.degree_n,
                degree_d: bundle.degree_d,
            },
        );
    }

    write_json(output, &document)?;
    info!("Exported {} classifier models", document.len());
    println!("Generated {}", output.display());
    Ok(())
}

/// Convert the PCA transform at `input` into JSON at `output`.
pub fn export_projection_model(input: &Path, output: &Path) -> Result<(), ExportError> {
    info!("Loading projection model from {}", input.display());
    let model = load_projection_model(input)?;

    let document = ProjectionDocument {
        components: normalize_field(input, "components", &model.components)?,
        mean: normalize_field(input, "mean", &model.mean)?,
        explained_variance: normalize_field(input, "explained_variance", &model.explained_variance)?,
    };

    write_json(output, &document)?;
    info!(
        "Exported projection with {} components",
        document.components.outer_len().unwrap_or(0)
    );
    println!("Generated {}", output.display());
    Ok(())
}

fn normalize_field(input: &Path, field: &str, value: &ArrayLike) -> Result<Nested, ExportError> {
    normalize(value).map_err(|err| ExportError::UnsupportedValue {
        path: input.to_path_buf(),
        field: field.to_string(),
        reason: err.to_string(),
    })
}

// ---------------------------------------------------------------------------
// File output
// ---------------------------------------------------------------------------

fn write_error(path: &Path, source: io::Error) -> ExportError {
    ExportError::Write {
        path: path.to_path_buf(),
        source,
    }
}

/// Create `dir` and its parents if absent.
pub fn ensure_dir(dir: &Path) -> Result<(), ExportError> {
    fs::create_dir_all(dir).map_err(|e| write_error(dir, e))?;
    debug!("Model directory {} ready", dir.display());
    Ok(())
}

/// Serialize `value` as JSON with 2-space indentation and replace `path`
/// with it atomically. The parent directory must already exist.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ExportError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| write_error(path, e))?;

    {
        let mut writer = BufWriter::new(tmp.as_file_mut());
        let formatter = PrettyFormatter::with_indent(b"  ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut writer, formatter);
        value
            .serialize(&mut serializer)
            .map_err(|e| write_error(path, e.into()))?;
        writer.flush().map_err(|e| write_error(path, e))?;
    }

    // Temporary files are created owner-only.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(fs::Permissions::from_mode(0o644))
            .map_err(|e| write_error(path, e))?;
    }

    tmp.persist(path).map_err(|e| write_error(path, e.error))?;
    debug!("Wrote {}", path.display());
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

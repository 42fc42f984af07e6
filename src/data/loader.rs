use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, warn};
use serde_json::Value as JsonValue;

use super::model::{ArrayLike, ClassifierModelBundle, ClassifierModelCollection, ProjectionModel};
use crate::error::ExportError;
use crate::pickle;
use crate::value::Value;

// ---------------------------------------------------------------------------
// Public entry-points
// ---------------------------------------------------------------------------

/// Load the per-class model collection (`rfc.pkl`).
pub fn load_classifier_collection(path: &Path) -> Result<ClassifierModelCollection, ExportError> {
    read_artifact(path)
        .and_then(classifier_collection)
        .map_err(|e| deserialization_error(path, e))
}

/// Load the PCA transform (`trained_pca.pkl`).
pub fn load_projection_model(path: &Path) -> Result<ProjectionModel, ExportError> {
    read_artifact(path)
        .and_then(projection_model)
        .map_err(|e| deserialization_error(path, e))
}

fn deserialization_error(path: &Path, err: anyhow::Error) -> ExportError {
    ExportError::Deserialization {
        path: path.to_path_buf(),
        reason: format!("{err:#}"),
    }
}

/// Read an artifact into a [`Value`] tree. Dispatch by extension.
///
/// Supported formats:
/// * `.pkl` / `.pickle` – Python pickle (NumPy arrays, scikit-learn objects)
/// * `.json`            – plain JSON, for artifacts already converted
pub fn read_artifact(path: &Path) -> Result<Value> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    match ext.as_str() {
        "pkl" | "pickle" => read_pickle(path),
        "json" => read_json(path),
        other => bail!("Unsupported file extension: .{other}"),
    }
}

// ---------------------------------------------------------------------------
// Format readers
// ---------------------------------------------------------------------------

fn read_pickle(path: &Path) -> Result<Value> {
    let file = File::open(path).context("opening pickle file")?;
    let size = file.metadata().map(|m| m.len()).unwrap_or(0);
    debug!("reading {} ({size} bytes)", path.display());
    pickle::from_reader(file).context("decoding pickle")
}

fn read_json(path: &Path) -> Result<Value> {
    let text = std::fs::read_to_string(path).context("reading JSON file")?;
    let root: JsonValue = serde_json::from_str(&text).context("parsing JSON")?;
    Ok(json_to_value(root))
}

fn json_to_value(val: JsonValue) -> Value {
    match val {
        JsonValue::Null => Value::None,
        JsonValue::Bool(b) => Value::Bool(b),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else {
                // u64 beyond i64 and all non-integers
                Value::Float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        JsonValue::String(s) => Value::String(s),
        JsonValue::Array(items) => Value::List(items.into_iter().map(json_to_value).collect()),
        JsonValue::Object(map) => Value::Dict(
            map.into_iter()
                .map(|(k, v)| (Value::String(k), json_to_value(v)))
                .collect(),
        ),
    }
}

// ---------------------------------------------------------------------------
// Record extraction
// ---------------------------------------------------------------------------

/// Expected layout: a mapping `label → {alpha, beta, n_components, degree_n, degree_d}`.
fn classifier_collection(root: Value) -> Result<ClassifierModelCollection> {
    let entries = match root {
        Value::Dict(entries) => entries,
        other => bail!("expected a mapping of class labels, found {}", other.kind()),
    };

    let mut models = BTreeMap::new();
    for (key, value) in entries {
        let label = label_of(&key)?;
        let bundle = classifier_bundle(value).with_context(|| format!("model `{label}`"))?;
        if models.insert(label.clone(), bundle).is_some() {
            bail!("class label `{label}` appears more than once");
        }
    }
    debug!("loaded {} classifier models", models.len());
    Ok(ClassifierModelCollection { models })
}

/// Render a mapping key the way a JSON object key is written.
fn label_of(key: &Value) -> Result<String> {
    match key {
        Value::String(s) => Ok(s.clone()),
        Value::Int(i) => Ok(i.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Array(array) => array
            .as_scalar_i64()
            .map(|i| i.to_string())
            .ok_or_else(|| anyhow!("class label is a {} array", array.dtype_name())),
        other => bail!("class label of type {} cannot be a JSON key", other.kind()),
    }
}

fn classifier_bundle(value: Value) -> Result<ClassifierModelBundle> {
    let mut fields = into_fields(value)?;
    Ok(ClassifierModelBundle {
        alpha: ArrayLike::from(take(&mut fields, "alpha")?),
        beta: ArrayLike::from(take(&mut fields, "beta")?),
        n_components: integer(take(&mut fields, "n_components")?, "n_components")?,
        degree_n: integer(take(&mut fields, "degree_n")?, "degree_n")?,
        degree_d: integer(take(&mut fields, "degree_d")?, "degree_d")?,
    })
}

/// Expected layout: a scikit-learn `PCA` object (fitted attributes in its
/// state), or a mapping with `components`, `mean` and `explained_variance`.
fn projection_model(root: Value) -> Result<ProjectionModel> {
    if let Value::Object(obj) = &root {
        match obj.attribute("n_features_in_").and_then(Value::as_i64) {
            Some(features) => {
                debug!("projection model is a {} fitted on {features} features", obj.class)
            }
            None => debug!("projection model is a {} instance", obj.class),
        }
    }
    let mut fields = into_fields(root)?;

    let components = take_any(&mut fields, &["components_", "components"])?;
    let mean = take_any(&mut fields, &["mean_", "mean"])?;
    let explained_variance =
        take_any(&mut fields, &["explained_variance_ratio_", "explained_variance"])?;
    let declared = match fields.remove("n_components_") {
        Some(value) => Some(integer(value, "n_components_")?),
        None => None,
    };

    let model = ProjectionModel {
        components: ArrayLike::from(components),
        mean: ArrayLike::from(mean),
        explained_variance: ArrayLike::from(explained_variance),
    };
    model.check_shapes(declared).map_err(|reason| anyhow!(reason))?;
    Ok(model)
}

// -- field helpers --

/// String-keyed fields of a mapping, or of an object's dictionary state.
fn into_fields(value: Value) -> Result<BTreeMap<String, Value>> {
    let entries = match value {
        Value::Dict(entries) => entries,
        Value::Object(obj) => match obj.state.map(|state| *state) {
            Some(Value::Dict(entries)) => entries,
            Some(other) => bail!("{} has {} state, expected a dict", obj.class, other.kind()),
            None => bail!("{} has no state", obj.class),
        },
        other => bail!("expected a mapping, found {}", other.kind()),
    };
    Ok(entries
        .into_iter()
        .filter_map(|(key, value)| match key {
            Value::String(name) => Some((name, value)),
            _ => None,
        })
        .collect())
}

fn take(fields: &mut BTreeMap<String, Value>, name: &str) -> Result<Value> {
    fields
        .remove(name)
        .with_context(|| format!("missing field `{name}`"))
}

fn take_any(fields: &mut BTreeMap<String, Value>, names: &[&str]) -> Result<Value> {
    names
        .iter()
        .find_map(|name| fields.remove(*name))
        .with_context(|| format!("missing field `{}`", names.join("` / `")))
}

fn integer(value: Value, name: &str) -> Result<i64> {
    match (value.as_i64(), &value) {
        (Some(i), Value::Int(_)) => Ok(i),
        (Some(i), Value::Array(array)) => {
            warn!("field `{name}` is a NumPy {} scalar", array.dtype_name());
            Ok(i)
        }
        (_, Value::Array(array)) => {
            bail!("field `{name}` must be an integer, found a {:?} array", array.shape())
        }
        (_, other) => bail!("field `{name}` must be an integer, found {}", other.kind()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::model::NumericArray;
    use crate::pickle::writer;
    use crate::value::{ClassPath, Object};
    use ndarray::{ArrayD, IxDyn};
    use std::fs;

    fn s(text: &str) -> Value {
        Value::String(text.into())
    }

    fn floats(shape: &[usize]) -> Value {
        let len: usize = shape.iter().product();
        let data = (0..len).map(|i| i as f64 / 10.0).collect();
        Value::Array(NumericArray::Float(
            ArrayD::from_shape_vec(IxDyn(shape), data).unwrap(),
        ))
    }

    fn bundle() -> Value {
        Value::Dict(vec![
            (s("alpha"), floats(&[2])),
            (s("beta"), floats(&[2, 2])),
            (s("n_components"), Value::Int(5)),
            (s("degree_n"), Value::Int(2)),
            (s("degree_d"), Value::Int(1)),
        ])
    }

    fn write_pickle(dir: &Path, name: &str, value: &Value) -> std::path::PathBuf {
        let path = dir.join(name);
        fs::write(&path, writer::to_vec(value).unwrap()).unwrap();
        path
    }

    #[test]
    fn loads_pickled_collection_with_int_labels() {
        let tmp = tempfile::TempDir::new().unwrap();
        let root = Value::Dict(vec![(Value::Int(3), bundle()), (s("7"), bundle())]);
        let path = write_pickle(tmp.path(), "rfc.pkl", &root);

        let collection = load_classifier_collection(&path).unwrap();
        assert_eq!(collection.len(), 2);
        let three = &collection.models["3"];
        assert_eq!(three.n_components, 5);
        assert_eq!(three.beta.shape(), Some(vec![2, 2]));
        assert!(collection.models.contains_key("7"));
    }

    #[test]
    fn duplicate_labels_are_rejected() {
        let root = Value::Dict(vec![(Value::Int(3), bundle()), (s("3"), bundle())]);
        let err = classifier_collection(root).unwrap_err();
        assert!(format!("{err:#}").contains("more than once"));
    }

    #[test]
    fn missing_field_names_the_model() {
        let mut fields = match bundle() {
            Value::Dict(entries) => entries,
            _ => unreachable!(),
        };
        fields.retain(|(k, _)| k.as_str() != Some("degree_d"));
        let root = Value::Dict(vec![(s("4"), Value::Dict(fields))]);
        let err = format!("{:#}", classifier_collection(root).unwrap_err());
        assert!(err.contains("model `4`"), "{err}");
        assert!(err.contains("missing field `degree_d`"), "{err}");
    }

    #[test]
    fn non_mapping_root_is_rejected() {
        let err = classifier_collection(Value::List(vec![bundle()])).unwrap_err();
        assert!(err.to_string().contains("expected a mapping"));
    }

    #[test]
    fn float_integer_field_is_rejected() {
        let root = Value::Dict(vec![(
            s("1"),
            Value::Dict(vec![
                (s("alpha"), floats(&[1])),
                (s("beta"), floats(&[1])),
                (s("n_components"), Value::Float(5.0)),
                (s("degree_n"), Value::Int(2)),
                (s("degree_d"), Value::Int(1)),
            ]),
        )]);
        let err = format!("{:#}", classifier_collection(root).unwrap_err());
        assert!(err.contains("`n_components` must be an integer"), "{err}");
    }

    #[test]
    fn numpy_integer_scalars_count_as_integers() {
        let scalar = |v: i64| {
            Value::Array(NumericArray::Int(
                ArrayD::from_shape_vec(IxDyn(&[]), vec![v]).unwrap(),
            ))
        };
        assert_eq!(integer(scalar(4), "degree_n").unwrap(), 4);
        assert_eq!(integer(Value::Int(-3), "degree_n").unwrap(), -3);

        let err = integer(floats(&[2]), "degree_n").unwrap_err().to_string();
        assert!(err.contains("[2] array"), "{err}");
    }

    #[test]
    fn sklearn_pca_object_uses_variance_ratio() {
        let pca = Value::Object(Object {
            class: ClassPath::new("sklearn.decomposition._pca", "PCA"),
            args: Vec::new(),
            state: Some(Box::new(Value::Dict(vec![
                (s("n_components_"), Value::Int(3)),
                (s("components_"), floats(&[3, 5])),
                (s("mean_"), floats(&[5])),
                (s("explained_variance_"), floats(&[4])),
                (s("explained_variance_ratio_"), floats(&[3])),
                (s("_sklearn_version"), s("1.3.0")),
            ]))),
        });
        let model = projection_model(pca).unwrap();
        assert_eq!(model.components.shape(), Some(vec![3, 5]));
        assert_eq!(model.explained_variance.shape(), Some(vec![3]));
    }

    #[test]
    fn pca_with_mismatched_component_count_is_rejected() {
        let pca = Value::Dict(vec![
            (s("n_components_"), Value::Int(4)),
            (s("components_"), floats(&[3, 5])),
            (s("mean_"), floats(&[5])),
            (s("explained_variance_ratio_"), floats(&[3])),
        ]);
        let err = projection_model(pca).unwrap_err().to_string();
        assert!(err.contains("declared 4 components"), "{err}");
    }

    #[test]
    fn json_projection_is_accepted() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("trained_pca.json");
        fs::write(
            &path,
            r#"{"components": [[1, 2], [3, 4], [5, 6]], "mean": [0.5, 0.25], "explained_variance": [0.7, 0.2, 0.1]}"#,
        )
        .unwrap();
        let model = load_projection_model(&path).unwrap();
        assert_eq!(model.components.shape(), Some(vec![3, 2]));
    }

    #[test]
    fn missing_and_corrupt_files_are_deserialization_errors() {
        let tmp = tempfile::TempDir::new().unwrap();
        let missing = tmp.path().join("rfc.pkl");
        let err = load_classifier_collection(&missing).unwrap_err();
        assert!(matches!(err, ExportError::Deserialization { ref path, .. } if *path == missing));

        let corrupt = tmp.path().join("trained_pca.pkl");
        fs::write(&corrupt, b"\x80\x04not a pickle").unwrap();
        let err = load_projection_model(&corrupt).unwrap_err();
        assert!(matches!(err, ExportError::Deserialization { .. }));

        let unknown = tmp.path().join("model.bin");
        fs::write(&unknown, b"").unwrap();
        let err = load_projection_model(&unknown).unwrap_err();
        assert!(err.to_string().contains("Unsupported file extension: .bin"));
    }
}

use std::collections::BTreeMap;

use ndarray::ArrayD;

use crate::value::Value;

// ---------------------------------------------------------------------------
// NumericArray – a typed n-dimensional array decoded from an artifact
// ---------------------------------------------------------------------------

/// A typed array mirroring the NumPy dtypes the exporter understands.
/// Narrower dtypes are widened on decode (`float32` → `f64`, `uint8` → `i64`).
#[derive(Debug, Clone, PartialEq)]
pub enum NumericArray {
    Float(ArrayD<f64>),
    Int(ArrayD<i64>),
    Bool(ArrayD<bool>),
}

impl NumericArray {
    pub fn shape(&self) -> &[usize] {
        match self {
            NumericArray::Float(a) => a.shape(),
            NumericArray::Int(a) => a.shape(),
            NumericArray::Bool(a) => a.shape(),
        }
    }

    pub fn ndim(&self) -> usize {
        self.shape().len()
    }

    /// Total number of elements.
    pub fn len(&self) -> usize {
        match self {
            NumericArray::Float(a) => a.len(),
            NumericArray::Int(a) => a.len(),
            NumericArray::Bool(a) => a.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// NumPy name of the element type.
    pub fn dtype_name(&self) -> &'static str {
        match self {
            NumericArray::Float(_) => "float64",
            NumericArray::Int(_) => "int64",
            NumericArray::Bool(_) => "bool",
        }
    }

    /// The single element of a 0-d integer array.
    pub fn as_scalar_i64(&self) -> Option<i64> {
        match self {
            NumericArray::Int(a) if a.ndim() == 0 => a.iter().next().copied(),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// ArrayLike – what a model field holds before normalization
// ---------------------------------------------------------------------------

/// Representation of an array-valued field, decided when the artifact is read.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayLike {
    /// A typed array with a known dtype and shape.
    Typed(NumericArray),
    /// A generic ordered sequence (list or tuple) of values.
    Sequence(Vec<Value>),
    /// Anything else; carries the kind of value found.
    Unsupported(&'static str),
}

impl From<Value> for ArrayLike {
    fn from(value: Value) -> Self {
        match value {
            Value::Array(array) => ArrayLike::Typed(array),
            Value::List(items) | Value::Tuple(items) => ArrayLike::Sequence(items),
            other => ArrayLike::Unsupported(other.kind()),
        }
    }
}

impl ArrayLike {
    /// Rectangular shape of the field, or `None` when it is unsupported,
    /// ragged, or holds non-numeric elements.
    pub fn shape(&self) -> Option<Vec<usize>> {
        match self {
            ArrayLike::Typed(array) => Some(array.shape().to_vec()),
            ArrayLike::Sequence(items) => sequence_shape(items),
            ArrayLike::Unsupported(_) => None,
        }
    }
}

fn value_shape(value: &Value) -> Option<Vec<usize>> {
    match value {
        Value::Int(_) | Value::Float(_) | Value::Bool(_) => Some(Vec::new()),
        Value::Array(array) => Some(array.shape().to_vec()),
        Value::List(items) | Value::Tuple(items) => sequence_shape(items),
        _ => None,
    }
}

fn sequence_shape(items: &[Value]) -> Option<Vec<usize>> {
    let mut inner: Option<Vec<usize>> = None;
    for item in items {
        let shape = value_shape(item)?;
        match &inner {
            Some(expected) if *expected != shape => return None,
            Some(_) => {}
            None => inner = Some(shape),
        }
    }
    let mut shape = vec![items.len()];
    shape.extend(inner.unwrap_or_default());
    Some(shape)
}

// ---------------------------------------------------------------------------
// Classifier models – one parameter bundle per digit class
// ---------------------------------------------------------------------------

/// Parameters of a single per-class model.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifierModelBundle {
    pub alpha: ArrayLike,
    pub beta: ArrayLike,
    pub n_components: i64,
    pub degree_n: i64,
    pub degree_d: i64,
}

/// All per-class models, keyed by class label.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClassifierModelCollection {
    pub models: BTreeMap<String, ClassifierModelBundle>,
}

impl ClassifierModelCollection {
    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ClassifierModelBundle)> {
        self.models.iter()
    }
}

// ---------------------------------------------------------------------------
// ProjectionModel – the trained PCA transform
// ---------------------------------------------------------------------------

/// A linear projection: `components` is R×C, `mean` has C entries and
/// `explained_variance` has R entries.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionModel {
    pub components: ArrayLike,
    pub mean: ArrayLike,
    pub explained_variance: ArrayLike,
}

impl ProjectionModel {
    /// Check the shape invariants between the three arrays, and against the
    /// component count the artifact declares, when it declares one.
    ///
    /// Unsupported fields are skipped here; normalization reports them.
    pub fn check_shapes(&self, declared_components: Option<i64>) -> Result<(), String> {
        let fields = [
            ("components", &self.components),
            ("mean", &self.mean),
            ("explained_variance", &self.explained_variance),
        ];
        if fields
            .iter()
            .any(|(_, field)| matches!(field, ArrayLike::Unsupported(_)))
        {
            return Ok(());
        }

        let mut shapes = Vec::with_capacity(fields.len());
        for (name, field) in fields {
            let shape = field
                .shape()
                .ok_or_else(|| format!("`{name}` is not a rectangular numeric array"))?;
            shapes.push(shape);
        }

        let (rows, cols) = match shapes[0].as_slice() {
            [rows, cols] => (*rows, *cols),
            other => return Err(format!("`components` must be 2-D, found shape {other:?}")),
        };
        if shapes[1] != [cols] {
            return Err(format!(
                "`mean` has shape {:?} but `components` has {cols} columns",
                shapes[1]
            ));
        }
        if shapes[2] != [rows] {
            return Err(format!(
                "`explained_variance` has shape {:?} but `components` has {rows} rows",
                shapes[2]
            ));
        }
        if let Some(declared) = declared_components {
            if usize::try_from(declared).ok() != Some(rows) {
                return Err(format!(
                    "declared {declared} components but `components` has {rows} rows"
                ));
            }
        }
        Ok(())
    }
}

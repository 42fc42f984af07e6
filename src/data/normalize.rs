use serde::ser::{Serialize, SerializeSeq, Serializer};
use thiserror::Error;

use super::model::{ArrayLike, NumericArray};
use crate::value::Value;

// ---------------------------------------------------------------------------
// Nested – the JSON-ready form of an array field
// ---------------------------------------------------------------------------

/// A plain numeric leaf.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Leaf {
    Int(i64),
    Float(f64),
    Bool(bool),
}

/// Nested ordered sequences of numeric leaves.
#[derive(Debug, Clone, PartialEq)]
pub enum Nested {
    Leaf(Leaf),
    List(Vec<Nested>),
}

impl Nested {
    /// Outer length, or `None` for a leaf.
    pub fn outer_len(&self) -> Option<usize> {
        match self {
            Nested::Leaf(_) => None,
            Nested::List(items) => Some(items.len()),
        }
    }
}

impl Serialize for Nested {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Nested::Leaf(Leaf::Int(i)) => serializer.serialize_i64(*i),
            Nested::Leaf(Leaf::Float(f)) => serializer.serialize_f64(*f),
            Nested::Leaf(Leaf::Bool(b)) => serializer.serialize_bool(*b),
            Nested::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum NormalizeError {
    #[error("expected an array or sequence, found {0}")]
    NotArrayLike(&'static str),
    #[error("element {index} is {kind}, not a number")]
    NonNumeric { index: usize, kind: &'static str },
    #[error("non-finite value {0} has no JSON representation")]
    NonFinite(f64),
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Convert an array-like field into nested sequences, preserving shape and
/// element order.
pub fn normalize(field: &ArrayLike) -> Result<Nested, NormalizeError> {
    match field {
        ArrayLike::Typed(array) => typed(array),
        ArrayLike::Sequence(items) => sequence(items),
        ArrayLike::Unsupported(kind) => Err(NormalizeError::NotArrayLike(kind)),
    }
}

fn typed(array: &NumericArray) -> Result<Nested, NormalizeError> {
    // `iter` walks in logical (row-major) order whatever the memory layout.
    match array {
        NumericArray::Float(a) => {
            if let Some(bad) = a.iter().find(|v| !v.is_finite()) {
                return Err(NormalizeError::NonFinite(*bad));
            }
            let data: Vec<f64> = a.iter().copied().collect();
            Ok(nest(a.shape(), &data, Leaf::Float))
        }
        NumericArray::Int(a) => {
            let data: Vec<i64> = a.iter().copied().collect();
            Ok(nest(a.shape(), &data, Leaf::Int))
        }
        NumericArray::Bool(a) => {
            let data: Vec<bool> = a.iter().copied().collect();
            Ok(nest(a.shape(), &data, Leaf::Bool))
        }
    }
}

fn nest<T: Copy>(shape: &[usize], data: &[T], leaf: fn(T) -> Leaf) -> Nested {
    match shape.split_first() {
        // 0-d: exactly one element
        None => Nested::Leaf(leaf(data[0])),
        Some((&outer, rest)) => {
            let stride: usize = rest.iter().product();
            Nested::List(
                (0..outer)
                    .map(|i| nest(rest, &data[i * stride..(i + 1) * stride], leaf))
                    .collect(),
            )
        }
    }
}

fn sequence(items: &[Value]) -> Result<Nested, NormalizeError> {
    items
        .iter()
        .enumerate()
        .map(|(index, item)| element(index, item))
        .collect::<Result<Vec<_>, _>>()
        .map(Nested::List)
}

fn element(index: usize, item: &Value) -> Result<Nested, NormalizeError> {
    match item {
        Value::Int(i) => Ok(Nested::Leaf(Leaf::Int(*i))),
        Value::Float(f) if f.is_finite() => Ok(Nested::Leaf(Leaf::Float(*f))),
        Value::Float(f) => Err(NormalizeError::NonFinite(*f)),
        Value::Bool(b) => Ok(Nested::Leaf(Leaf::Bool(*b))),
        Value::Array(array) => typed(array),
        Value::List(inner) | Value::Tuple(inner) => sequence(inner),
        other => Err(NormalizeError::NonNumeric {
            index,
            kind: other.kind(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{ArrayD, IxDyn, ShapeBuilder};

    fn leaf_f(v: f64) -> Nested {
        Nested::Leaf(Leaf::Float(v))
    }

    #[test]
    fn typed_matrix_keeps_rows() {
        let array = ArrayD::from_shape_vec(IxDyn(&[2, 3]), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0])
            .unwrap();
        let nested = normalize(&ArrayLike::Typed(NumericArray::Float(array))).unwrap();
        assert_eq!(
            nested,
            Nested::List(vec![
                Nested::List(vec![leaf_f(1.0), leaf_f(2.0), leaf_f(3.0)]),
                Nested::List(vec![leaf_f(4.0), leaf_f(5.0), leaf_f(6.0)]),
            ])
        );
    }

    #[test]
    fn fortran_layout_is_read_logically() {
        // memory order column-major: [[1, 2], [3, 4]] stored as 1, 3, 2, 4
        let array = ArrayD::from_shape_vec(IxDyn(&[2, 2]).f(), vec![1i64, 3, 2, 4]).unwrap();
        let nested = normalize(&ArrayLike::Typed(NumericArray::Int(array))).unwrap();
        let json = serde_json::to_string(&nested).unwrap();
        assert_eq!(json, "[[1,2],[3,4]]");
    }

    #[test]
    fn three_dimensional_shape_survives() {
        let array = ArrayD::from_shape_vec(IxDyn(&[2, 1, 3]), (0..6).collect()).unwrap();
        let nested = normalize(&ArrayLike::Typed(NumericArray::Int(array))).unwrap();
        let json = serde_json::to_string(&nested).unwrap();
        assert_eq!(json, "[[[0,1,2]],[[3,4,5]]]");
    }

    #[test]
    fn empty_dimensions_produce_empty_lists() {
        let array = ArrayD::<f64>::from_shape_vec(IxDyn(&[2, 0]), Vec::new()).unwrap();
        let nested = normalize(&ArrayLike::Typed(NumericArray::Float(array))).unwrap();
        assert_eq!(serde_json::to_string(&nested).unwrap(), "[[],[]]");
    }

    #[test]
    fn zero_dim_array_is_a_leaf() {
        let array = ArrayD::from_elem(IxDyn(&[]), 2.5);
        let nested = normalize(&ArrayLike::Typed(NumericArray::Float(array))).unwrap();
        assert_eq!(nested, leaf_f(2.5));
        assert_eq!(nested.outer_len(), None);
    }

    #[test]
    fn generic_sequence_materializes_elements() {
        let field = ArrayLike::Sequence(vec![
            Value::Float(0.1),
            Value::Int(2),
            Value::Tuple(vec![Value::Bool(true)]),
        ]);
        let json = serde_json::to_string(&normalize(&field).unwrap()).unwrap();
        assert_eq!(json, "[0.1,2,[true]]");
    }

    #[test]
    fn non_numeric_elements_are_rejected() {
        let field = ArrayLike::Sequence(vec![Value::Int(1), Value::None]);
        assert_eq!(
            normalize(&field),
            Err(NormalizeError::NonNumeric {
                index: 1,
                kind: "None"
            })
        );
    }

    #[test]
    fn unsupported_values_are_rejected() {
        assert_eq!(
            normalize(&ArrayLike::Unsupported("int")),
            Err(NormalizeError::NotArrayLike("int"))
        );
    }

    #[test]
    fn nan_is_rejected() {
        let array = ArrayD::from_shape_vec(IxDyn(&[2]), vec![1.0, f64::NAN]).unwrap();
        let err = normalize(&ArrayLike::Typed(NumericArray::Float(array))).unwrap_err();
        assert!(matches!(err, NormalizeError::NonFinite(v) if v.is_nan()));

        let field = ArrayLike::Sequence(vec![Value::Float(f64::INFINITY)]);
        assert_eq!(
            normalize(&field),
            Err(NormalizeError::NonFinite(f64::INFINITY))
        );
    }
}

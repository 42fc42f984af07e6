use std::fmt;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use half::f16;
use ndarray::{ArrayD, IxDyn, ShapeBuilder};

use super::PickleError;
use crate::data::model::NumericArray;

/// Module paths NumPy uses for `_reconstruct` and `scalar` (1.x and 2.x).
pub fn is_multiarray(module: &str) -> bool {
    matches!(module, "numpy.core.multiarray" | "numpy._core.multiarray")
}

/// Module paths NumPy uses for `_frombuffer` (protocol 5 arrays).
pub fn is_numeric(module: &str) -> bool {
    matches!(module, "numpy.core.numeric" | "numpy._core.numeric")
}

// ---------------------------------------------------------------------------
// Dtype
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
    /// `|`: single-byte types.
    NotApplicable,
}

/// A NumPy dtype as pickled: a type code such as `f8` plus a byte order.
///
/// Any code is accepted when the dtype object is built; only decoding an
/// array checks that the element type is supported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dtype {
    code: String,
    endian: Endian,
}

impl Dtype {
    pub fn new(code: &str) -> Self {
        let (endian, code) = match code.as_bytes().first() {
            Some(b'>') => (Endian::Big, &code[1..]),
            Some(b'<') | Some(b'=') => (Endian::Little, &code[1..]),
            Some(b'|') => (Endian::NotApplicable, &code[1..]),
            _ => (Endian::Little, code),
        };
        Self {
            code: code.to_string(),
            endian,
        }
    }

    /// The dtype a [`NumericArray`] is written with.
    pub fn for_array(array: &NumericArray) -> Self {
        match array {
            NumericArray::Float(_) => Self::new("<f8"),
            NumericArray::Int(_) => Self::new("<i8"),
            NumericArray::Bool(_) => Self::new("|b1"),
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    /// Apply the byte-order character from the dtype's `__setstate__` tuple.
    pub fn set_byte_order(&mut self, order: &str) -> Result<(), PickleError> {
        self.endian = match order {
            "<" | "=" => Endian::Little,
            ">" => Endian::Big,
            "|" => Endian::NotApplicable,
            other => return Err(PickleError::Invalid(format!("byte order `{other}`"))),
        };
        Ok(())
    }

    /// Decode a raw buffer into an array of the given shape.
    pub fn decode(
        &self,
        shape: &[usize],
        fortran: bool,
        raw: &[u8],
    ) -> Result<NumericArray, PickleError> {
        let element = Element::from_code(&self.code)
            .ok_or_else(|| PickleError::UnsupportedDtype(self.to_string()))?;
        let count = shape
            .iter()
            .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
            .ok_or_else(|| PickleError::Invalid(format!("array shape {shape:?} overflows")))?;
        if Some(raw.len()) != count.checked_mul(element.size()) {
            return Err(PickleError::Invalid(format!(
                "{} bytes of data for {count} elements of {self}",
                raw.len()
            )));
        }
        match self.endian {
            Endian::Big => decode_as::<BigEndian>(element, shape, fortran, raw),
            Endian::Little | Endian::NotApplicable => {
                decode_as::<LittleEndian>(element, shape, fortran, raw)
            }
        }
    }
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let order = match self.endian {
            Endian::Little => '<',
            Endian::Big => '>',
            Endian::NotApplicable => '|',
        };
        write!(f, "{order}{}", self.code)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Element {
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F16,
    F32,
    F64,
}

impl Element {
    fn from_code(code: &str) -> Option<Self> {
        Some(match code {
            "b1" | "?" | "bool" => Element::Bool,
            "i1" | "int8" => Element::I8,
            "i2" | "int16" => Element::I16,
            "i4" | "int32" => Element::I32,
            "i8" | "int64" => Element::I64,
            "u1" | "uint8" => Element::U8,
            "u2" | "uint16" => Element::U16,
            "u4" | "uint32" => Element::U32,
            "u8" | "uint64" => Element::U64,
            "f2" | "float16" => Element::F16,
            "f4" | "float32" => Element::F32,
            "f8" | "float64" => Element::F64,
            _ => return None,
        })
    }

    fn size(self) -> usize {
        match self {
            Element::Bool | Element::I8 | Element::U8 => 1,
            Element::I16 | Element::U16 | Element::F16 => 2,
            Element::I32 | Element::U32 | Element::F32 => 4,
            Element::I64 | Element::U64 | Element::F64 => 8,
        }
    }
}

fn decode_as<B: ByteOrder>(
    element: Element,
    shape: &[usize],
    fortran: bool,
    raw: &[u8],
) -> Result<NumericArray, PickleError> {
    let chunks = raw.chunks_exact(element.size());
    let array = match element {
        Element::Bool => NumericArray::Bool(shaped(shape, fortran, chunks.map(|c| c[0] != 0).collect())?),
        Element::I8 => ints(shape, fortran, chunks.map(|c| i64::from(c[0] as i8)).collect())?,
        Element::I16 => ints(shape, fortran, chunks.map(|c| i64::from(B::read_i16(c))).collect())?,
        Element::I32 => ints(shape, fortran, chunks.map(|c| i64::from(B::read_i32(c))).collect())?,
        Element::I64 => ints(shape, fortran, chunks.map(B::read_i64).collect())?,
        Element::U8 => ints(shape, fortran, chunks.map(|c| i64::from(c[0])).collect())?,
        Element::U16 => ints(shape, fortran, chunks.map(|c| i64::from(B::read_u16(c))).collect())?,
        Element::U32 => ints(shape, fortran, chunks.map(|c| i64::from(B::read_u32(c))).collect())?,
        Element::U64 => {
            let data = chunks
                .map(|c| i64::try_from(B::read_u64(c)).map_err(|_| PickleError::IntegerOverflow))
                .collect::<Result<Vec<_>, _>>()?;
            ints(shape, fortran, data)?
        }
        Element::F16 => floats(shape, fortran, chunks.map(|c| f16::from_bits(B::read_u16(c)).to_f64()).collect())?,
        Element::F32 => floats(shape, fortran, chunks.map(|c| f64::from(B::read_f32(c))).collect())?,
        Element::F64 => floats(shape, fortran, chunks.map(B::read_f64).collect())?,
    };
    Ok(array)
}

fn ints(shape: &[usize], fortran: bool, data: Vec<i64>) -> Result<NumericArray, PickleError> {
    shaped(shape, fortran, data).map(NumericArray::Int)
}

fn floats(shape: &[usize], fortran: bool, data: Vec<f64>) -> Result<NumericArray, PickleError> {
    shaped(shape, fortran, data).map(NumericArray::Float)
}

fn shaped<T>(shape: &[usize], fortran: bool, data: Vec<T>) -> Result<ArrayD<T>, PickleError> {
    ArrayD::from_shape_vec(IxDyn(shape).set_f(fortran), data)
        .map_err(|e| PickleError::Invalid(format!("array data does not fit shape {shape:?}: {e}")))
}

use std::io::Write;

use byteorder::{BigEndian, LittleEndian, WriteBytesExt};

use super::numpy::Dtype;
use super::opcode as op;
use super::PickleError;
use crate::data::model::NumericArray;
use crate::value::{ClassPath, Value};

/// Protocol written by [`to_writer`]. Frames are optional and not emitted.
pub const PROTOCOL: u8 = 4;

/// Pickle `value` into a byte vector.
pub fn to_vec(value: &Value) -> Result<Vec<u8>, PickleError> {
    let mut out = Vec::new();
    to_writer(&mut out, value)?;
    Ok(out)
}

/// Pickle `value` into `out`. Arrays are written the way NumPy pickles
/// them (`_reconstruct` followed by a BUILD state), objects as
/// `cls.__new__(cls, *args)` followed by BUILD.
pub fn to_writer<W: Write>(out: &mut W, value: &Value) -> Result<(), PickleError> {
    out.write_all(&[op::PROTO, PROTOCOL])?;
    write_value(out, value)?;
    out.write_u8(op::STOP)?;
    Ok(())
}

fn write_value<W: Write>(out: &mut W, value: &Value) -> Result<(), PickleError> {
    match value {
        Value::None => out.write_u8(op::NONE)?,
        Value::Bool(true) => out.write_u8(op::NEWTRUE)?,
        Value::Bool(false) => out.write_u8(op::NEWFALSE)?,
        Value::Int(i) => write_int(out, *i)?,
        Value::Float(f) => {
            out.write_u8(op::BINFLOAT)?;
            out.write_f64::<BigEndian>(*f)?;
        }
        Value::String(s) => write_str(out, s)?,
        Value::Bytes(b) => write_bytes(out, b)?,
        Value::List(items) => {
            out.write_u8(op::EMPTY_LIST)?;
            if !items.is_empty() {
                out.write_u8(op::MARK)?;
                for item in items {
                    write_value(out, item)?;
                }
                out.write_u8(op::APPENDS)?;
            }
        }
        Value::Tuple(items) => write_tuple(out, items)?,
        Value::Dict(entries) => {
            out.write_u8(op::EMPTY_DICT)?;
            if !entries.is_empty() {
                out.write_u8(op::MARK)?;
                for (key, value) in entries {
                    write_value(out, key)?;
                    write_value(out, value)?;
                }
                out.write_u8(op::SETITEMS)?;
            }
        }
        Value::Set(items) => {
            out.write_u8(op::EMPTY_SET)?;
            if !items.is_empty() {
                out.write_u8(op::MARK)?;
                for item in items {
                    write_value(out, item)?;
                }
                out.write_u8(op::ADDITEMS)?;
            }
        }
        Value::Global(class) => write_global(out, class)?,
        Value::Object(obj) => {
            write_global(out, &obj.class)?;
            write_tuple(out, &obj.args)?;
            out.write_u8(op::NEWOBJ)?;
            if let Some(state) = &obj.state {
                write_value(out, state)?;
                out.write_u8(op::BUILD)?;
            }
        }
        Value::Array(array) => write_array(out, array)?,
    }
    Ok(())
}

fn write_int<W: Write>(out: &mut W, value: i64) -> Result<(), PickleError> {
    if let Ok(small) = u8::try_from(value) {
        out.write_u8(op::BININT1)?;
        out.write_u8(small)?;
    } else if let Ok(word) = i32::try_from(value) {
        out.write_u8(op::BININT)?;
        out.write_i32::<LittleEndian>(word)?;
    } else {
        let bytes = encode_long(value);
        out.write_u8(op::LONG1)?;
        // at most 8 bytes
        out.write_u8(bytes.len() as u8)?;
        out.write_all(&bytes)?;
    }
    Ok(())
}

/// Shortest little-endian two's complement encoding.
fn encode_long(value: i64) -> Vec<u8> {
    let mut bytes = value.to_le_bytes().to_vec();
    while bytes.len() > 1 {
        let last = bytes[bytes.len() - 1];
        let next_sign = bytes[bytes.len() - 2] & 0x80;
        if (last == 0x00 && next_sign == 0) || (last == 0xff && next_sign != 0) {
            bytes.pop();
        } else {
            break;
        }
    }
    bytes
}

fn write_str<W: Write>(out: &mut W, text: &str) -> Result<(), PickleError> {
    let bytes = text.as_bytes();
    if let Ok(len) = u8::try_from(bytes.len()) {
        out.write_u8(op::SHORT_BINUNICODE)?;
        out.write_u8(len)?;
    } else {
        out.write_u8(op::BINUNICODE)?;
        out.write_u32::<LittleEndian>(length_u32(bytes.len())?)?;
    }
    out.write_all(bytes)?;
    Ok(())
}

fn write_bytes<W: Write>(out: &mut W, bytes: &[u8]) -> Result<(), PickleError> {
    if let Ok(len) = u8::try_from(bytes.len()) {
        out.write_u8(op::SHORT_BINBYTES)?;
        out.write_u8(len)?;
    } else {
        out.write_u8(op::BINBYTES8)?;
        out.write_u64::<LittleEndian>(bytes.len() as u64)?;
    }
    out.write_all(bytes)?;
    Ok(())
}

fn length_u32(len: usize) -> Result<u32, PickleError> {
    u32::try_from(len).map_err(|_| PickleError::Invalid(format!("string of {len} bytes")))
}

fn write_tuple<W: Write>(out: &mut W, items: &[Value]) -> Result<(), PickleError> {
    match items.len() {
        0 => out.write_u8(op::EMPTY_TUPLE)?,
        n @ 1..=3 => {
            for item in items {
                write_value(out, item)?;
            }
            out.write_u8(op::TUPLE1 + n as u8 - 1)?;
        }
        _ => {
            out.write_u8(op::MARK)?;
            for item in items {
                write_value(out, item)?;
            }
            out.write_u8(op::TUPLE)?;
        }
    }
    Ok(())
}

fn write_global<W: Write>(out: &mut W, class: &ClassPath) -> Result<(), PickleError> {
    if class.module.contains('\n') || class.name.contains('\n') {
        return Err(PickleError::Invalid(format!("global name `{class}`")));
    }
    out.write_u8(op::GLOBAL)?;
    writeln!(out, "{}", class.module)?;
    writeln!(out, "{}", class.name)?;
    Ok(())
}

fn write_dtype<W: Write>(out: &mut W, dtype: &Dtype) -> Result<(), PickleError> {
    let order = dtype.to_string();
    let order = &order[..1];
    write_global(out, &ClassPath::new("numpy", "dtype"))?;
    write_tuple(
        out,
        &[
            Value::String(dtype.code().to_string()),
            Value::Bool(false),
            Value::Bool(true),
        ],
    )?;
    out.write_u8(op::REDUCE)?;
    write_tuple(
        out,
        &[
            Value::Int(3),
            Value::String(order.to_string()),
            Value::None,
            Value::None,
            Value::None,
            Value::Int(-1),
            Value::Int(-1),
            Value::Int(0),
        ],
    )?;
    out.write_u8(op::BUILD)?;
    Ok(())
}

fn write_array<W: Write>(out: &mut W, array: &NumericArray) -> Result<(), PickleError> {
    // numpy.core.multiarray._reconstruct(ndarray, (0,), b'b')
    write_global(out, &ClassPath::new("numpy.core.multiarray", "_reconstruct"))?;
    write_global(out, &ClassPath::new("numpy", "ndarray"))?;
    write_tuple(out, &[Value::Int(0)])?;
    write_bytes(out, b"b")?;
    out.write_u8(op::TUPLE3)?;
    out.write_u8(op::REDUCE)?;

    // state: (1, shape, dtype, is_fortran, rawdata)
    out.write_u8(op::MARK)?;
    write_int(out, 1)?;
    let shape: Vec<Value> = array
        .shape()
        .iter()
        .map(|&dim| i64::try_from(dim).map(Value::Int))
        .collect::<Result<_, _>>()
        .map_err(|_| PickleError::IntegerOverflow)?;
    write_tuple(out, &shape)?;
    write_dtype(out, &Dtype::for_array(array))?;
    out.write_u8(op::NEWFALSE)?;
    write_bytes(out, &raw_data(array)?)?;
    out.write_u8(op::TUPLE)?;
    out.write_u8(op::BUILD)?;
    Ok(())
}

/// Elements in C order, little-endian.
fn raw_data(array: &NumericArray) -> Result<Vec<u8>, PickleError> {
    let mut raw = Vec::new();
    match array {
        NumericArray::Float(a) => {
            raw.reserve(a.len() * 8);
            for v in a.iter() {
                raw.write_f64::<LittleEndian>(*v)?;
            }
        }
        NumericArray::Int(a) => {
            raw.reserve(a.len() * 8);
            for v in a.iter() {
                raw.write_i64::<LittleEndian>(*v)?;
            }
        }
        NumericArray::Bool(a) => raw.extend(a.iter().map(|&b| u8::from(b))),
    }
    Ok(raw)
}

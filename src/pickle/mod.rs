//! Python pickle support, limited to what NumPy and scikit-learn artifacts need.
//!
//! ```text
//!   .pkl bytes
//!        │
//!        ▼
//!   ┌──────────┐
//!   │ machine  │  opcode VM → object arena → Value tree
//!   └──────────┘
//!        │  numpy._reconstruct / dtype / scalar
//!        ▼
//!   ┌──────────┐
//!   │  numpy   │  dtype + raw buffer → NumericArray
//!   └──────────┘
//! ```
//!
//! `writer` encodes the same subset and is used to produce sample artifacts.

pub mod machine;
pub mod numpy;
pub mod opcode;
pub mod writer;

use std::io::{self, BufRead, BufReader, Read};

use thiserror::Error;

use crate::value::Value;

#[derive(Debug, Error)]
pub enum PickleError {
    #[error("pickle data ends unexpectedly")]
    Truncated,
    #[error("i/o error while reading pickle: {0}")]
    Io(io::Error),
    #[error("unsupported pickle protocol {0}")]
    UnsupportedProtocol(u8),
    #[error("unknown opcode 0x{0:02x}")]
    UnknownOpcode(u8),
    #[error("opcode {0} is not supported")]
    UnsupportedOpcode(&'static str),
    #[error("stack underflow at opcode 0x{0:02x}")]
    StackUnderflow(u8),
    #[error("no mark on the stack")]
    MissingMark,
    #[error("memo key {0} is not defined")]
    MissingMemo(u32),
    #[error("integer does not fit in 64 bits")]
    IntegerOverflow,
    #[error("unsupported dtype `{0}`")]
    UnsupportedDtype(String),
    #[error("object graph is nested more than {0} levels deep or is cyclic")]
    TooDeep(usize),
    #[error("invalid pickle data: {0}")]
    Invalid(String),
}

impl From<io::Error> for PickleError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            PickleError::Truncated
        } else {
            PickleError::Io(err)
        }
    }
}

/// Decode one pickled object from a byte slice.
pub fn from_slice(bytes: &[u8]) -> Result<Value, PickleError> {
    from_bufread(io::Cursor::new(bytes))
}

/// Decode one pickled object from a reader.
pub fn from_reader<R: Read>(reader: R) -> Result<Value, PickleError> {
    from_bufread(BufReader::new(reader))
}

fn from_bufread<R: BufRead>(reader: R) -> Result<Value, PickleError> {
    machine::Machine::new(reader).run()
}

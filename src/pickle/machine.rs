use std::collections::HashMap;
use std::io::{BufRead, Read};

use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use log::{debug, trace};

use super::numpy::{self, Dtype};
use super::opcode as op;
use super::PickleError;
use crate::data::model::NumericArray;
use crate::value::{ClassPath, Object, Value};

/// Deepest object nesting accepted when building the [`Value`] tree.
/// scikit-learn and NumPy graphs stay below ten levels; the bound also has
/// to fit a 2 MiB thread stack.
pub const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ObjId(usize);

/// One heap object. Containers refer to their members by id so that
/// mutation through one reference (APPENDS, SETITEMS, BUILD) is seen by
/// every memo reference to the same object.
#[derive(Debug)]
enum Slot {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<ObjId>),
    Tuple(Vec<ObjId>),
    Dict(Vec<(ObjId, ObjId)>),
    Set(Vec<ObjId>),
    Global(ClassPath),
    Object {
        class: ClassPath,
        args: Vec<ObjId>,
        state: Option<ObjId>,
    },
    Dtype(Dtype),
    /// Result of `numpy _reconstruct`, waiting for its BUILD state.
    PendingArray,
    Array(NumericArray),
}

/// What a BUILD opcode is applied to.
enum BuildTarget {
    Array,
    Dtype,
    Dict,
    Object,
}

impl Slot {
    fn kind(&self) -> &'static str {
        match self {
            Slot::None => "None",
            Slot::Bool(_) => "bool",
            Slot::Int(_) => "int",
            Slot::Float(_) => "float",
            Slot::String(_) => "str",
            Slot::Bytes(_) => "bytes",
            Slot::List(_) => "list",
            Slot::Tuple(_) => "tuple",
            Slot::Dict(_) => "dict",
            Slot::Set(_) => "set",
            Slot::Global(_) => "global",
            Slot::Object { .. } => "object",
            Slot::Dtype(_) => "dtype",
            Slot::PendingArray | Slot::Array(_) => "ndarray",
        }
    }
}

/// The unpickling virtual machine.
pub struct Machine<R> {
    reader: R,
    heap: Vec<Slot>,
    stack: Vec<ObjId>,
    marks: Vec<usize>,
    memo: HashMap<u32, ObjId>,
    protocol: u8,
    opcodes: usize,
}

impl<R: BufRead> Machine<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            heap: Vec::new(),
            stack: Vec::new(),
            marks: Vec::new(),
            memo: HashMap::new(),
            protocol: 0,
            opcodes: 0,
        }
    }

    /// Execute opcodes until STOP and return the object on top of the stack.
    pub fn run(mut self) -> Result<Value, PickleError> {
        loop {
            let code = self.reader.read_u8()?;
            self.opcodes += 1;
            trace!("opcode 0x{code:02x}");
            if code == op::STOP {
                let root = self.pop(code)?;
                debug!(
                    "unpickled protocol {} stream: {} opcodes, {} objects",
                    self.protocol,
                    self.opcodes,
                    self.heap.len()
                );
                return self.resolve(root, 0);
            }
            self.step(code)?;
        }
    }

    fn step(&mut self, code: u8) -> Result<(), PickleError> {
        match code {
            op::PROTO => {
                let protocol = self.reader.read_u8()?;
                if protocol > op::HIGHEST_PROTOCOL {
                    return Err(PickleError::UnsupportedProtocol(protocol));
                }
                self.protocol = protocol;
            }
            op::FRAME => {
                // frames only group opcodes; the length carries no meaning here
                self.reader.read_u64::<LittleEndian>()?;
            }
            op::MARK => self.marks.push(self.stack.len()),
            op::POP => {
                if self.marks.last() == Some(&self.stack.len()) {
                    self.marks.pop();
                } else {
                    self.pop(code)?;
                }
            }
            op::POP_MARK => {
                self.pop_mark()?;
            }
            op::DUP => {
                let top = self.top(code)?;
                self.stack.push(top);
            }

            // -- scalars --
            op::NONE => self.push(Slot::None),
            op::NEWTRUE => self.push(Slot::Bool(true)),
            op::NEWFALSE => self.push(Slot::Bool(false)),
            op::INT => {
                let line = self.read_line()?;
                let slot = match line.as_str() {
                    "00" => Slot::Bool(false),
                    "01" => Slot::Bool(true),
                    text => Slot::Int(parse_int(text)?),
                };
                self.push(slot);
            }
            op::BININT => {
                let v = self.reader.read_i32::<LittleEndian>()?;
                self.push(Slot::Int(i64::from(v)));
            }
            op::BININT1 => {
                let v = self.reader.read_u8()?;
                self.push(Slot::Int(i64::from(v)));
            }
            op::BININT2 => {
                let v = self.reader.read_u16::<LittleEndian>()?;
                self.push(Slot::Int(i64::from(v)));
            }
            op::LONG => {
                let line = self.read_line()?;
                let text = line.strip_suffix('L').unwrap_or(&line);
                self.push(Slot::Int(parse_int(text)?));
            }
            op::LONG1 => {
                let n = usize::from(self.reader.read_u8()?);
                let bytes = self.read_bytes(n)?;
                self.push(Slot::Int(decode_long(&bytes)?));
            }
            op::LONG4 => {
                let n = self.read_length_i32()?;
                let bytes = self.read_bytes(n)?;
                self.push(Slot::Int(decode_long(&bytes)?));
            }
            op::FLOAT => {
                let line = self.read_line()?;
                let v = line
                    .trim()
                    .parse::<f64>()
                    .map_err(|_| PickleError::Invalid(format!("float literal `{line}`")))?;
                self.push(Slot::Float(v));
            }
            op::BINFLOAT => {
                let v = self.reader.read_f64::<BigEndian>()?;
                self.push(Slot::Float(v));
            }

            // -- strings and bytes --
            op::STRING => {
                let line = self.read_line()?;
                let text = unquote(&line)?;
                self.push(Slot::String(text));
            }
            op::BINSTRING => {
                let n = self.read_length_i32()?;
                let bytes = self.read_bytes(n)?;
                self.push(Slot::String(latin1(&bytes)));
            }
            op::SHORT_BINSTRING => {
                let n = usize::from(self.reader.read_u8()?);
                let bytes = self.read_bytes(n)?;
                self.push(Slot::String(latin1(&bytes)));
            }
            op::UNICODE => {
                // raw-unicode-escape: latin-1 bytes plus \uXXXX / \UXXXXXXXX
                let line = self.read_raw_line()?;
                self.push(Slot::String(raw_unicode_unescape(&latin1(&line))?));
            }
            op::BINUNICODE => {
                let n = self.read_length_u32()?;
                self.push_utf8(n)?;
            }
            op::SHORT_BINUNICODE => {
                let n = usize::from(self.reader.read_u8()?);
                self.push_utf8(n)?;
            }
            op::BINUNICODE8 => {
                let n = self.read_length_u64()?;
                self.push_utf8(n)?;
            }
            op::BINBYTES => {
                let n = self.read_length_u32()?;
                let bytes = self.read_bytes(n)?;
                self.push(Slot::Bytes(bytes));
            }
            op::SHORT_BINBYTES => {
                let n = usize::from(self.reader.read_u8()?);
                let bytes = self.read_bytes(n)?;
                self.push(Slot::Bytes(bytes));
            }
            op::BINBYTES8 | op::BYTEARRAY8 => {
                let n = self.read_length_u64()?;
                let bytes = self.read_bytes(n)?;
                self.push(Slot::Bytes(bytes));
            }

            // -- containers --
            op::EMPTY_LIST => self.push(Slot::List(Vec::new())),
            op::LIST => {
                let items = self.pop_mark()?;
                self.push(Slot::List(items));
            }
            op::APPEND => {
                let item = self.pop(code)?;
                let target = self.top(code)?;
                self.extend_list(target, vec![item])?;
            }
            op::APPENDS => {
                let items = self.pop_mark()?;
                let target = self.top(code)?;
                self.extend_list(target, items)?;
            }
            op::EMPTY_TUPLE => self.push(Slot::Tuple(Vec::new())),
            op::TUPLE => {
                let items = self.pop_mark()?;
                self.push(Slot::Tuple(items));
            }
            op::TUPLE1 | op::TUPLE2 | op::TUPLE3 => {
                let n = usize::from(code - op::TUPLE1 + 1);
                if self.stack.len() < n {
                    return Err(PickleError::StackUnderflow(code));
                }
                let items = self.stack.split_off(self.stack.len() - n);
                self.push(Slot::Tuple(items));
            }
            op::EMPTY_DICT => self.push(Slot::Dict(Vec::new())),
            op::DICT => {
                let items = self.pop_mark()?;
                let pairs = pairs(items)?;
                self.push(Slot::Dict(pairs));
            }
            op::SETITEM => {
                let value = self.pop(code)?;
                let key = self.pop(code)?;
                let target = self.top(code)?;
                self.extend_dict(target, vec![(key, value)])?;
            }
            op::SETITEMS => {
                let items = self.pop_mark()?;
                let target = self.top(code)?;
                self.extend_dict(target, pairs(items)?)?;
            }
            op::EMPTY_SET => self.push(Slot::Set(Vec::new())),
            op::ADDITEMS => {
                let items = self.pop_mark()?;
                let target = self.top(code)?;
                match &mut self.heap[target.0] {
                    Slot::Set(members) => members.extend(items),
                    other => {
                        return Err(PickleError::Invalid(format!(
                            "ADDITEMS on {}",
                            other.kind()
                        )))
                    }
                }
            }
            op::FROZENSET => {
                let items = self.pop_mark()?;
                self.push(Slot::Set(items));
            }

            // -- objects --
            op::GLOBAL => {
                let module = self.read_line()?;
                let name = self.read_line()?;
                self.push(Slot::Global(ClassPath::new(module, name)));
            }
            op::STACK_GLOBAL => {
                let name = self.pop(code)?;
                let module = self.pop(code)?;
                let class = ClassPath::new(self.string(module)?, self.string(name)?);
                self.push(Slot::Global(class));
            }
            op::REDUCE => {
                let args = self.pop(code)?;
                let callable = self.pop(code)?;
                let args = self.tuple_items(args)?;
                let slot = self.reduce(callable, args)?;
                self.push(slot);
            }
            op::NEWOBJ => {
                let args = self.pop(code)?;
                let class = self.pop(code)?;
                let args = self.tuple_items(args)?;
                let slot = self.new_object(class, args)?;
                self.push(slot);
            }
            op::NEWOBJ_EX => {
                let kwargs = self.pop(code)?;
                let args = self.pop(code)?;
                let class = self.pop(code)?;
                if !matches!(&self.heap[kwargs.0], Slot::Dict(pairs) if pairs.is_empty()) {
                    debug!("ignoring keyword arguments of NEWOBJ_EX");
                }
                let args = self.tuple_items(args)?;
                let slot = self.new_object(class, args)?;
                self.push(slot);
            }
            op::OBJ => {
                let mut items = self.pop_mark()?;
                if items.is_empty() {
                    return Err(PickleError::StackUnderflow(code));
                }
                let class = items.remove(0);
                let slot = self.new_object(class, items)?;
                self.push(slot);
            }
            op::INST => {
                let module = self.read_line()?;
                let name = self.read_line()?;
                let args = self.pop_mark()?;
                self.push(Slot::Object {
                    class: ClassPath::new(module, name),
                    args,
                    state: None,
                });
            }
            op::BUILD => {
                let state = self.pop(code)?;
                let target = self.top(code)?;
                self.build(target, state)?;
            }

            // -- memo --
            op::PUT => {
                let line = self.read_line()?;
                let key = line
                    .parse::<u32>()
                    .map_err(|_| PickleError::Invalid(format!("memo key `{line}`")))?;
                self.memoize(key, code)?;
            }
            op::BINPUT => {
                let key = u32::from(self.reader.read_u8()?);
                self.memoize(key, code)?;
            }
            op::LONG_BINPUT => {
                let key = self.reader.read_u32::<LittleEndian>()?;
                self.memoize(key, code)?;
            }
            op::MEMOIZE => {
                let key = u32::try_from(self.memo.len())
                    .map_err(|_| PickleError::Invalid("memo overflow".into()))?;
                self.memoize(key, code)?;
            }
            op::GET => {
                let line = self.read_line()?;
                let key = line
                    .parse::<u32>()
                    .map_err(|_| PickleError::Invalid(format!("memo key `{line}`")))?;
                self.recall(key)?;
            }
            op::BINGET => {
                let key = u32::from(self.reader.read_u8()?);
                self.recall(key)?;
            }
            op::LONG_BINGET => {
                let key = self.reader.read_u32::<LittleEndian>()?;
                self.recall(key)?;
            }

            other => {
                return Err(match op::unsupported_name(other) {
                    Some(name) => PickleError::UnsupportedOpcode(name),
                    None => PickleError::UnknownOpcode(other),
                })
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Stack and heap helpers
    // -----------------------------------------------------------------------

    fn alloc(&mut self, slot: Slot) -> ObjId {
        self.heap.push(slot);
        ObjId(self.heap.len() - 1)
    }

    fn push(&mut self, slot: Slot) {
        let id = self.alloc(slot);
        self.stack.push(id);
    }

    fn pop(&mut self, code: u8) -> Result<ObjId, PickleError> {
        let floor = self.marks.last().copied().unwrap_or(0);
        if self.stack.len() <= floor {
            return Err(PickleError::StackUnderflow(code));
        }
        self.stack.pop().ok_or(PickleError::StackUnderflow(code))
    }

    fn top(&self, code: u8) -> Result<ObjId, PickleError> {
        self.stack.last().copied().ok_or(PickleError::StackUnderflow(code))
    }

    fn pop_mark(&mut self) -> Result<Vec<ObjId>, PickleError> {
        let mark = self.marks.pop().ok_or(PickleError::MissingMark)?;
        Ok(self.stack.split_off(mark))
    }

    fn memoize(&mut self, key: u32, code: u8) -> Result<(), PickleError> {
        let top = self.top(code)?;
        self.memo.insert(key, top);
        Ok(())
    }

    fn recall(&mut self, key: u32) -> Result<(), PickleError> {
        let id = *self.memo.get(&key).ok_or(PickleError::MissingMemo(key))?;
        self.stack.push(id);
        Ok(())
    }

    fn extend_list(&mut self, target: ObjId, items: Vec<ObjId>) -> Result<(), PickleError> {
        match &mut self.heap[target.0] {
            Slot::List(members) => {
                members.extend(items);
                Ok(())
            }
            other => Err(PickleError::Invalid(format!("append to {}", other.kind()))),
        }
    }

    fn extend_dict(
        &mut self,
        target: ObjId,
        entries: Vec<(ObjId, ObjId)>,
    ) -> Result<(), PickleError> {
        match &mut self.heap[target.0] {
            Slot::Dict(members) => {
                members.extend(entries);
                Ok(())
            }
            other => Err(PickleError::Invalid(format!("set item on {}", other.kind()))),
        }
    }

    fn string(&self, id: ObjId) -> Result<String, PickleError> {
        match &self.heap[id.0] {
            Slot::String(s) => Ok(s.clone()),
            other => Err(PickleError::Invalid(format!("expected str, found {}", other.kind()))),
        }
    }

    fn tuple_items(&self, id: ObjId) -> Result<Vec<ObjId>, PickleError> {
        match &self.heap[id.0] {
            Slot::Tuple(items) => Ok(items.clone()),
            other => Err(PickleError::Invalid(format!(
                "expected argument tuple, found {}",
                other.kind()
            ))),
        }
    }

    fn int(&self, id: ObjId) -> Result<i64, PickleError> {
        match &self.heap[id.0] {
            Slot::Int(i) => Ok(*i),
            Slot::Bool(b) => Ok(i64::from(*b)),
            other => Err(PickleError::Invalid(format!("expected int, found {}", other.kind()))),
        }
    }

    /// Raw bytes of a `bytes`, `bytearray` or latin-1 `str` object.
    fn buffer(&self, id: ObjId) -> Result<Vec<u8>, PickleError> {
        match &self.heap[id.0] {
            Slot::Bytes(b) => Ok(b.clone()),
            Slot::String(s) => latin1_bytes(s),
            // object arrays pickle their elements as a list
            Slot::List(_) => Err(PickleError::UnsupportedDtype("object".into())),
            other => Err(PickleError::Invalid(format!(
                "expected bytes, found {}",
                other.kind()
            ))),
        }
    }

    fn dtype(&self, id: ObjId) -> Result<&Dtype, PickleError> {
        match &self.heap[id.0] {
            Slot::Dtype(dtype) => Ok(dtype),
            other => Err(PickleError::Invalid(format!(
                "expected dtype, found {}",
                other.kind()
            ))),
        }
    }

    fn shape(&self, id: ObjId) -> Result<Vec<usize>, PickleError> {
        let dims = match &self.heap[id.0] {
            Slot::Tuple(items) | Slot::List(items) => items.clone(),
            Slot::Int(_) => vec![id],
            other => {
                return Err(PickleError::Invalid(format!(
                    "expected shape tuple, found {}",
                    other.kind()
                )))
            }
        };
        dims.into_iter()
            .map(|dim| {
                usize::try_from(self.int(dim)?)
                    .map_err(|_| PickleError::Invalid("negative array dimension".into()))
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Object construction
    // -----------------------------------------------------------------------

    fn class_of(&self, id: ObjId) -> Result<ClassPath, PickleError> {
        match &self.heap[id.0] {
            Slot::Global(class) => Ok(class.clone()),
            other => Err(PickleError::Invalid(format!(
                "{} is not callable",
                other.kind()
            ))),
        }
    }

    /// REDUCE: call `callable(*args)`.
    fn reduce(&self, callable: ObjId, args: Vec<ObjId>) -> Result<Slot, PickleError> {
        let class = self.class_of(callable)?;
        let arg = |i: usize| {
            args.get(i).copied().ok_or_else(|| {
                PickleError::Invalid(format!("{class} expects at least {} arguments", i + 1))
            })
        };
        let slot = match (class.module.as_str(), class.name.as_str()) {
            (module, "_reconstruct") if numpy::is_multiarray(module) => Slot::PendingArray,
            ("numpy", "dtype") => Slot::Dtype(Dtype::new(&self.string(arg(0)?)?)),
            (module, "scalar") if numpy::is_multiarray(module) => {
                let raw = self.buffer(arg(1)?)?;
                Slot::Array(self.dtype(arg(0)?)?.decode(&[], false, &raw)?)
            }
            (module, "_frombuffer") if numpy::is_numeric(module) => {
                let shape = self.shape(arg(2)?)?;
                let fortran = self.string(arg(3)?)? == "F";
                let raw = self.buffer(arg(0)?)?;
                Slot::Array(self.dtype(arg(1)?)?.decode(&shape, fortran, &raw)?)
            }
            ("_codecs", "encode") => {
                let encoding = match args.get(1) {
                    Some(&id) => self.string(id)?,
                    None => "utf-8".to_string(),
                };
                let text = self.string(arg(0)?)?;
                match encoding.as_str() {
                    "latin1" | "latin-1" | "iso-8859-1" => Slot::Bytes(latin1_bytes(&text)?),
                    "utf-8" | "utf8" => Slot::Bytes(text.into_bytes()),
                    other => return Err(PickleError::Invalid(format!("codec `{other}`"))),
                }
            }
            ("copyreg" | "copy_reg", "_reconstructor") => {
                let target = self.class_of(arg(0)?)?;
                instantiate(target, Vec::new())
            }
            ("builtins" | "__builtin__", "bytearray") | ("builtins" | "__builtin__", "bytes") => {
                match args.first() {
                    Some(&id) => Slot::Bytes(self.buffer(id)?),
                    None => Slot::Bytes(Vec::new()),
                }
            }
            ("builtins" | "__builtin__", "set" | "frozenset") => match args.first() {
                Some(&id) => Slot::Set(self.sequence(id)?),
                None => Slot::Set(Vec::new()),
            },
            ("builtins" | "__builtin__", "list") => match args.first() {
                Some(&id) => Slot::List(self.sequence(id)?),
                None => Slot::List(Vec::new()),
            },
            ("collections", "OrderedDict") => {
                let mut entries = Vec::new();
                if let Some(&id) = args.first() {
                    for pair in self.sequence(id)? {
                        match self.sequence(pair)?.as_slice() {
                            [key, value] => entries.push((*key, *value)),
                            _ => return Err(PickleError::Invalid("OrderedDict item".into())),
                        }
                    }
                }
                Slot::Dict(entries)
            }
            _ => instantiate(class.clone(), args.clone()),
        };
        Ok(slot)
    }

    /// NEWOBJ / OBJ: `cls.__new__(cls, *args)`.
    fn new_object(&self, class: ObjId, args: Vec<ObjId>) -> Result<Slot, PickleError> {
        let class = self.class_of(class)?;
        Ok(instantiate(class, args))
    }

    fn sequence(&self, id: ObjId) -> Result<Vec<ObjId>, PickleError> {
        match &self.heap[id.0] {
            Slot::List(items) | Slot::Tuple(items) | Slot::Set(items) => Ok(items.clone()),
            other => Err(PickleError::Invalid(format!(
                "expected a sequence, found {}",
                other.kind()
            ))),
        }
    }

    /// BUILD: apply `__setstate__` to the object on top of the stack.
    fn build(&mut self, target: ObjId, state: ObjId) -> Result<(), PickleError> {
        let kind = match &self.heap[target.0] {
            Slot::PendingArray => BuildTarget::Array,
            Slot::Dtype(_) => BuildTarget::Dtype,
            Slot::Dict(_) => BuildTarget::Dict,
            Slot::Object { .. } => BuildTarget::Object,
            other => {
                return Err(PickleError::Invalid(format!(
                    "cannot set state of {}",
                    other.kind()
                )))
            }
        };
        match kind {
            BuildTarget::Array => {
                let array = self.array_from_state(state)?;
                self.heap[target.0] = Slot::Array(array);
            }
            BuildTarget::Dtype => {
                // (version, byteorder, subarray, names, fields, elsize, alignment, flags)
                let order = match self.sequence(state)?.get(1) {
                    Some(&id) => self.string(id)?,
                    None => return Err(PickleError::Invalid("dtype state".into())),
                };
                if let Slot::Dtype(dtype) = &mut self.heap[target.0] {
                    dtype.set_byte_order(&order)?;
                }
            }
            BuildTarget::Dict => {
                let entries = match &self.heap[state.0] {
                    Slot::Dict(entries) => entries.clone(),
                    other => {
                        return Err(PickleError::Invalid(format!(
                            "dict state must be a dict, found {}",
                            other.kind()
                        )))
                    }
                };
                self.extend_dict(target, entries)?;
            }
            BuildTarget::Object => {
                // (dict_state, slot_state) pairs come from classes with __slots__
                let state = match &self.heap[state.0] {
                    Slot::Tuple(parts) if parts.len() == 2 => match &self.heap[parts[0].0] {
                        Slot::None => parts[1],
                        _ => parts[0],
                    },
                    _ => state,
                };
                if let Slot::Object { state: slot, .. } = &mut self.heap[target.0] {
                    *slot = Some(state);
                }
            }
        }
        Ok(())
    }

    /// ndarray state: `(version, shape, dtype, is_fortran, rawdata)`; very old
    /// pickles omit the version.
    fn array_from_state(&self, state: ObjId) -> Result<NumericArray, PickleError> {
        let parts = self.sequence(state)?;
        let parts = match parts.len() {
            5 => &parts[1..],
            4 => &parts[..],
            n => return Err(PickleError::Invalid(format!("ndarray state has {n} fields"))),
        };
        let shape = self.shape(parts[0])?;
        let dtype = self.dtype(parts[1])?;
        let fortran = self.int(parts[2])? != 0;
        let raw = self.buffer(parts[3])?;
        dtype.decode(&shape, fortran, &raw)
    }

    // -----------------------------------------------------------------------
    // Readers
    // -----------------------------------------------------------------------

    fn read_raw_line(&mut self) -> Result<Vec<u8>, PickleError> {
        let mut line = Vec::new();
        self.reader.read_until(b'\n', &mut line)?;
        if line.pop() != Some(b'\n') {
            return Err(PickleError::Truncated);
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Ok(line)
    }

    fn read_line(&mut self) -> Result<String, PickleError> {
        let line = self.read_raw_line()?;
        String::from_utf8(line).map_err(|_| PickleError::Invalid("line is not UTF-8".into()))
    }

    fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>, PickleError> {
        // `take` keeps a corrupt length from allocating more than the input holds
        let mut buf = Vec::new();
        (&mut self.reader).take(n as u64).read_to_end(&mut buf)?;
        if buf.len() != n {
            return Err(PickleError::Truncated);
        }
        Ok(buf)
    }

    fn read_length_i32(&mut self) -> Result<usize, PickleError> {
        let n = self.reader.read_i32::<LittleEndian>()?;
        usize::try_from(n).map_err(|_| PickleError::Invalid(format!("negative length {n}")))
    }

    fn read_length_u32(&mut self) -> Result<usize, PickleError> {
        let n = self.reader.read_u32::<LittleEndian>()?;
        usize::try_from(n).map_err(|_| PickleError::Invalid(format!("length {n}")))
    }

    fn read_length_u64(&mut self) -> Result<usize, PickleError> {
        let n = self.reader.read_u64::<LittleEndian>()?;
        usize::try_from(n).map_err(|_| PickleError::Invalid(format!("length {n}")))
    }

    fn push_utf8(&mut self, n: usize) -> Result<(), PickleError> {
        let bytes = self.read_bytes(n)?;
        let text = String::from_utf8(bytes)
            .map_err(|_| PickleError::Invalid("string is not UTF-8".into()))?;
        self.push(Slot::String(text));
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Arena → Value
    // -----------------------------------------------------------------------

    fn resolve(&self, id: ObjId, depth: usize) -> Result<Value, PickleError> {
        if depth > MAX_DEPTH {
            return Err(PickleError::TooDeep(MAX_DEPTH));
        }
        let next = depth + 1;
        let value = match &self.heap[id.0] {
            Slot::None => Value::None,
            Slot::Bool(b) => Value::Bool(*b),
            Slot::Int(i) => Value::Int(*i),
            Slot::Float(f) => Value::Float(*f),
            Slot::String(s) => Value::String(s.clone()),
            Slot::Bytes(b) => Value::Bytes(b.clone()),
            Slot::List(items) => Value::List(self.resolve_all(items, next)?),
            Slot::Tuple(items) => Value::Tuple(self.resolve_all(items, next)?),
            Slot::Set(items) => Value::Set(self.resolve_all(items, next)?),
            Slot::Dict(entries) => Value::Dict(
                entries
                    .iter()
                    .map(|(k, v)| Ok((self.resolve(*k, next)?, self.resolve(*v, next)?)))
                    .collect::<Result<_, PickleError>>()?,
            ),
            Slot::Global(class) => Value::Global(class.clone()),
            Slot::Object { class, args, state } => Value::Object(Object {
                class: class.clone(),
                args: self.resolve_all(args, next)?,
                state: match state {
                    Some(state) => Some(Box::new(self.resolve(*state, next)?)),
                    None => None,
                },
            }),
            Slot::Dtype(dtype) => Value::Object(Object {
                class: ClassPath::new("numpy", "dtype"),
                args: vec![Value::String(dtype.to_string())],
                state: None,
            }),
            Slot::PendingArray => {
                return Err(PickleError::Invalid("ndarray was never given its state".into()))
            }
            Slot::Array(array) => Value::Array(array.clone()),
        };
        Ok(value)
    }

    fn resolve_all(&self, ids: &[ObjId], depth: usize) -> Result<Vec<Value>, PickleError> {
        ids.iter().map(|id| self.resolve(*id, depth)).collect()
    }
}

/// Instance of `class`; dict and list subclasses keep their container shape.
fn instantiate(class: ClassPath, args: Vec<ObjId>) -> Slot {
    match (class.module.as_str(), class.name.as_str()) {
        ("collections", "OrderedDict") | ("builtins", "dict") => return Slot::Dict(Vec::new()),
        ("builtins", "list") => return Slot::List(Vec::new()),
        _ => {}
    }
    Slot::Object {
        class,
        args,
        state: None,
    }
}

// ---------------------------------------------------------------------------
// Literal decoding
// ---------------------------------------------------------------------------

fn pairs(items: Vec<ObjId>) -> Result<Vec<(ObjId, ObjId)>, PickleError> {
    if items.len() % 2 != 0 {
        return Err(PickleError::Invalid("odd number of dict items".into()));
    }
    Ok(items.chunks_exact(2).map(|kv| (kv[0], kv[1])).collect())
}

fn parse_int(text: &str) -> Result<i64, PickleError> {
    text.trim().parse::<i64>().map_err(|e| match e.kind() {
        std::num::IntErrorKind::PosOverflow | std::num::IntErrorKind::NegOverflow => {
            PickleError::IntegerOverflow
        }
        _ => PickleError::Invalid(format!("integer literal `{text}`")),
    })
}

/// Little-endian two's complement, as written by LONG1 / LONG4.
pub(crate) fn decode_long(bytes: &[u8]) -> Result<i64, PickleError> {
    let Some(&last) = bytes.last() else {
        return Ok(0);
    };
    let negative = last & 0x80 != 0;
    let fill = if negative { 0xff } else { 0x00 };
    if bytes.len() > 8 && bytes[8..].iter().any(|&b| b != fill) {
        return Err(PickleError::IntegerOverflow);
    }
    let mut buf = [fill; 8];
    let n = bytes.len().min(8);
    buf[..n].copy_from_slice(&bytes[..n]);
    let value = i64::from_le_bytes(buf);
    if (value < 0) != negative {
        return Err(PickleError::IntegerOverflow);
    }
    Ok(value)
}

fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

fn latin1_bytes(text: &str) -> Result<Vec<u8>, PickleError> {
    text.chars()
        .map(|c| {
            u8::try_from(u32::from(c))
                .map_err(|_| PickleError::Invalid(format!("`{c}` is not latin-1")))
        })
        .collect()
}

/// Protocol-0 STRING argument: a quoted Python literal with backslash escapes.
fn unquote(line: &str) -> Result<String, PickleError> {
    let bytes = line.as_bytes();
    let quoted = bytes.len() >= 2
        && (bytes[0] == b'\'' || bytes[0] == b'"')
        && bytes[bytes.len() - 1] == bytes[0];
    if !quoted {
        return Err(PickleError::Invalid(format!("unquoted string `{line}`")));
    }
    let inner = &line[1..line.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('x') => {
                let hex: String = chars.by_ref().take(2).collect();
                let code = u8::from_str_radix(&hex, 16)
                    .map_err(|_| PickleError::Invalid(format!("escape `\\x{hex}`")))?;
                out.push(char::from(code));
            }
            Some(other) => out.push(other),
            None => return Err(PickleError::Invalid("dangling escape".into())),
        }
    }
    Ok(out)
}

/// Protocol-0 UNICODE argument: raw-unicode-escape encoding.
fn raw_unicode_unescape(line: &str) -> Result<String, PickleError> {
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        let width = match (c, chars.peek()) {
            ('\\', Some('u')) => 4,
            ('\\', Some('U')) => 8,
            _ => {
                out.push(c);
                continue;
            }
        };
        chars.next();
        let hex: String = chars.by_ref().take(width).collect();
        let decoded = u32::from_str_radix(&hex, 16)
            .ok()
            .and_then(char::from_u32)
            .ok_or_else(|| PickleError::Invalid(format!("escape `{hex}`")))?;
        out.push(decoded);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pickle::from_slice;

    fn dict_get<'a>(value: &'a Value, key: &str) -> &'a Value {
        value.get(key).unwrap_or_else(|| panic!("missing key {key}"))
    }

    #[test]
    fn protocol2_dict() {
        // pickle.dumps({'a': 1}, protocol=2)
        let bytes = b"\x80\x02}q\x00X\x01\x00\x00\x00aq\x01K\x01s.";
        let value = from_slice(bytes).unwrap();
        assert_eq!(
            value,
            Value::Dict(vec![(Value::String("a".into()), Value::Int(1))])
        );
    }

    #[test]
    fn protocol4_framed_dict() {
        // pickle.dumps({'a': 1}, protocol=4)
        let bytes = b"\x80\x04\x95\n\x00\x00\x00\x00\x00\x00\x00}\x94\x8c\x01a\x94K\x01s.";
        let value = from_slice(bytes).unwrap();
        assert_eq!(dict_get(&value, "a"), &Value::Int(1));
    }

    #[test]
    fn protocol0_text_opcodes() {
        // pickle.dumps([1, 2.5, 'x'], protocol=0)
        let bytes = b"(lp0\nI1\naF2.5\naVx\np1\na.";
        let value = from_slice(bytes).unwrap();
        assert_eq!(
            value,
            Value::List(vec![Value::Int(1), Value::Float(2.5), Value::String("x".into())])
        );
    }

    #[test]
    fn memo_sees_later_appends() {
        // l = []; pickle.dumps([l, l]) where l is filled after being memoized
        let bytes = b"\x80\x02]q\x00(]q\x01h\x01e.";
        let value = from_slice(bytes).unwrap();
        assert_eq!(
            value,
            Value::List(vec![Value::List(vec![]), Value::List(vec![])])
        );

        // a list memoized while empty, then filled, then fetched again
        let bytes = b"\x80\x02](]q\x00K\x07ah\x00e.";
        let value = from_slice(bytes).unwrap();
        let inner = Value::List(vec![Value::Int(7)]);
        assert_eq!(value, Value::List(vec![inner.clone(), inner]));
    }

    #[test]
    fn protocol3_numpy_array() {
        // numpy.array([1.0, 2.0]) pickled with protocol 3
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"\x80\x03cnumpy.core.multiarray\n_reconstruct\nq\x00");
        bytes.extend_from_slice(b"cnumpy\nndarray\nq\x01K\x00\x85q\x02C\x01bq\x03\x87q\x04Rq\x05");
        bytes.extend_from_slice(b"(K\x01K\x02\x85q\x06cnumpy\ndtype\nq\x07X\x02\x00\x00\x00f8q\x08");
        bytes.extend_from_slice(b"K\x00K\x01\x87q\tRq\n(K\x03X\x01\x00\x00\x00<q\x0bNNNJ\xff\xff\xff\xff");
        bytes.extend_from_slice(b"J\xff\xff\xff\xffK\x00tq\x0cb\x89C\x10");
        bytes.extend_from_slice(&1.0f64.to_le_bytes());
        bytes.extend_from_slice(&2.0f64.to_le_bytes());
        bytes.extend_from_slice(b"q\rtq\x0eb.");

        let value = from_slice(&bytes).unwrap();
        match value {
            Value::Array(NumericArray::Float(a)) => {
                assert_eq!(a.shape(), &[2]);
                assert_eq!(a.iter().copied().collect::<Vec<_>>(), vec![1.0, 2.0]);
            }
            other => panic!("expected float array, got {other:?}"),
        }
    }

    #[test]
    fn protocol2_array_bytes_via_codecs() {
        // protocol 2 stores the raw buffer as _codecs.encode(text, 'latin1')
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"\x80\x02cnumpy.core.multiarray\n_reconstruct\n");
        bytes.extend_from_slice(b"cnumpy\nndarray\nK\x00\x85c_codecs\nencode\nX\x01\x00\x00\x00b");
        bytes.extend_from_slice(b"X\x06\x00\x00\x00latin1\x86R\x87R");
        bytes.extend_from_slice(b"(K\x01K\x02\x85cnumpy\ndtype\nX\x02\x00\x00\x00u1\x89\x88\x87R");
        bytes.extend_from_slice(b"(K\x03X\x01\x00\x00\x00|NNNJ\xff\xff\xff\xffJ\xff\xff\xff\xffK\x00tb");
        // latin-1 text "\x05\xc8" encoded as UTF-8 for BINUNICODE
        bytes.extend_from_slice(b"\x89c_codecs\nencode\nX\x03\x00\x00\x00\x05\xc3\x88");
        bytes.extend_from_slice(b"X\x06\x00\x00\x00latin1\x86Rtb.");

        let value = from_slice(&bytes).unwrap();
        match value {
            Value::Array(NumericArray::Int(a)) => {
                assert_eq!(a.iter().copied().collect::<Vec<_>>(), vec![5, 200]);
            }
            other => panic!("expected int array, got {other:?}"),
        }
    }

    #[test]
    fn numpy_scalar() {
        // numpy.int64(5) pickled with protocol 3
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"\x80\x03cnumpy.core.multiarray\nscalar\n");
        bytes.extend_from_slice(b"cnumpy\ndtype\nX\x02\x00\x00\x00i8\x89\x88\x87R");
        bytes.extend_from_slice(b"(K\x03X\x01\x00\x00\x00<NNNJ\xff\xff\xff\xffJ\xff\xff\xff\xffK\x00tb");
        bytes.extend_from_slice(b"C\x08");
        bytes.extend_from_slice(&5i64.to_le_bytes());
        bytes.extend_from_slice(b"\x86R.");

        let value = from_slice(&bytes).unwrap();
        assert_eq!(value.as_i64(), Some(5));
    }

    #[test]
    fn sklearn_style_object() {
        // class instance via NEWOBJ + BUILD with a __dict__ state
        let bytes = b"\x80\x04\x8c\x1asklearn.decomposition._pca\x94\x8c\x03PCA\x94\x93\x94)\x81\x94}\x94\x8c\rn_components_\x94K\x11sb.";
        let value = from_slice(bytes).unwrap();
        match value {
            Value::Object(obj) => {
                assert_eq!(obj.class, ClassPath::new("sklearn.decomposition._pca", "PCA"));
                assert_eq!(obj.attribute("n_components_"), Some(&Value::Int(17)));
            }
            other => panic!("expected object, got {other:?}"),
        }
    }

    #[test]
    fn copyreg_reconstructor_builds_object() {
        let bytes = b"\x80\x02ccopy_reg\n_reconstructor\ncmymod\nThing\ncbuiltins\nobject\nN\x87R}X\x01\x00\x00\x00xK\x02sb.";
        let value = from_slice(bytes).unwrap();
        match value {
            Value::Object(obj) => {
                assert_eq!(obj.class.to_string(), "mymod.Thing");
                assert_eq!(obj.attribute("x"), Some(&Value::Int(2)));
            }
            other => panic!("expected object, got {other:?}"),
        }
    }

    #[test]
    fn long_integers() {
        assert_eq!(decode_long(&[]).unwrap(), 0);
        assert_eq!(decode_long(&[0xff]).unwrap(), -1);
        assert_eq!(decode_long(&[0x00, 0x01]).unwrap(), 256);
        assert_eq!(
            decode_long(&[0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x7f]).unwrap(),
            i64::MAX
        );
        // 2**63 needs a ninth byte
        assert!(matches!(
            decode_long(&[0, 0, 0, 0, 0, 0, 0, 0x80, 0x00]),
            Err(PickleError::IntegerOverflow)
        ));
        assert_eq!(from_slice(b"\x80\x02\x8a\x02\x00\x01.").unwrap(), Value::Int(256));
        assert_eq!(from_slice(b"L12345678901L\n.").unwrap(), Value::Int(12_345_678_901));
    }

    #[test]
    fn string_escapes() {
        assert_eq!(unquote("'a\\nb'").unwrap(), "a\nb");
        assert_eq!(unquote("'\\x41'").unwrap(), "A");
        assert!(unquote("abc").is_err());
        assert_eq!(raw_unicode_unescape("caf\\u00e9").unwrap(), "café");
    }

    #[test]
    fn truncated_input_is_reported() {
        assert!(matches!(
            from_slice(b"\x80\x02}q\x00X\x05\x00\x00\x00ab"),
            Err(PickleError::Truncated)
        ));
        assert!(matches!(from_slice(b""), Err(PickleError::Truncated)));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(from_slice(b"\xff"), Err(PickleError::UnknownOpcode(0xff))));
        assert!(matches!(
            from_slice(b"\x80\x09."),
            Err(PickleError::UnsupportedProtocol(9))
        ));
        assert!(matches!(from_slice(b"."), Err(PickleError::StackUnderflow(b'.'))));
        assert!(matches!(from_slice(b"\x80\x02h\x05."), Err(PickleError::MissingMemo(5))));
        assert!(matches!(
            from_slice(b"\x80\x05\x97."),
            Err(PickleError::UnsupportedOpcode("NEXT_BUFFER"))
        ));
        assert!(matches!(from_slice(b"\x80\x02e."), Err(PickleError::MissingMark)));
    }

    #[test]
    fn cyclic_graph_is_rejected() {
        // l = []; l.append(l)
        let bytes = b"\x80\x02]q\x00h\x00a.";
        assert!(matches!(from_slice(bytes), Err(PickleError::TooDeep(_))));
    }

    fn nested_lists(depth: usize) -> Vec<u8> {
        // [[...[1]...]]: EMPTY_LIST MARK per level, BININT1 1, APPENDS per level
        let mut bytes = b"\x80\x02".to_vec();
        bytes.extend_from_slice(&b"](".repeat(depth));
        bytes.extend_from_slice(b"K\x01");
        bytes.extend_from_slice(&b"e".repeat(depth));
        bytes.push(b'.');
        bytes
    }

    #[test]
    fn nesting_depth_is_bounded() {
        let mut value = from_slice(&nested_lists(40)).unwrap();
        let mut levels = 0;
        while let Value::List(mut items) = value {
            levels += 1;
            value = items.remove(0);
        }
        assert_eq!(levels, 40);
        assert_eq!(value, Value::Int(1));

        assert!(matches!(
            from_slice(&nested_lists(MAX_DEPTH + 10)),
            Err(PickleError::TooDeep(MAX_DEPTH))
        ));
    }

    #[test]
    fn protocol0_unicode_is_raw_unicode_escape() {
        // pickle.dumps('\xe9', protocol=0)
        assert_eq!(
            from_slice(b"V\xe9\np0\n.").unwrap(),
            Value::String("\u{e9}".into())
        );
        // pickle.dumps('a\\b\u20ac', protocol=0)
        assert_eq!(
            from_slice(b"Va\\u005cb\\u20ac\np0\n.").unwrap(),
            Value::String("a\\b\u{20ac}".into())
        );
    }

    #[test]
    fn protocol0_numpy_array() {
        // numpy.array([1.5, -2.0]) pickled with protocol 0; the raw buffer is
        // latin-1 text with NUL bytes escaped as \u0000
        let nul = b"\\u0000";
        let mut raw_text = Vec::new();
        for _ in 0..6 {
            raw_text.extend_from_slice(nul);
        }
        raw_text.extend_from_slice(b"\xf8?");
        for _ in 0..7 {
            raw_text.extend_from_slice(nul);
        }
        raw_text.push(0xc0);

        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"cnumpy.core.multiarray\n_reconstruct\np0\n");
        bytes.extend_from_slice(b"(cnumpy\nndarray\np1\n(I0\ntp2\n");
        bytes.extend_from_slice(b"c_codecs\nencode\np3\n(Vb\np4\nVlatin1\np5\ntp6\nRp7\n");
        bytes.extend_from_slice(b"tp8\nRp9\n(I1\n(I2\ntp10\n");
        bytes.extend_from_slice(b"cnumpy\ndtype\np11\n(Vf8\np12\nI00\nI01\ntp13\nRp14\n");
        bytes.extend_from_slice(b"(I3\nV<\np15\nNNNI-1\nI-1\nI0\ntp16\nb");
        bytes.extend_from_slice(b"I00\ng3\n(V");
        bytes.extend_from_slice(&raw_text);
        bytes.extend_from_slice(b"\np17\ng5\ntp18\nRp19\ntp20\nb.");

        match from_slice(&bytes).unwrap() {
            Value::Array(NumericArray::Float(a)) => {
                assert_eq!(a.shape(), &[2]);
                assert_eq!(a.iter().copied().collect::<Vec<_>>(), vec![1.5, -2.0]);
            }
            other => panic!("expected float array, got {other:?}"),
        }
    }
}

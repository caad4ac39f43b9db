//! Restricted pickle machine for torch checkpoints.
//!
//! Implements the opcode subset `torch.save` emits (pickle protocols 2-5)
//! over an in-memory stream. GLOBAL resolution is allowlist-only: the tensor
//! reconstruction helpers, the typed storage classes, and
//! `collections.OrderedDict`. Anything else fails the load with
//! [`WeightsmithError::UnsafeGlobal`] before an object is built, which is
//! the `weights_only` trust boundary: a checkpoint cannot name code to run.

use crate::errors::WeightsmithError;
use crate::tensor::Dtype;
use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use std::collections::HashMap;
use std::io::{Cursor, Read};

// Protocol 0-2 opcodes
const MARK: u8 = b'(';
const STOP: u8 = b'.';
const POP: u8 = b'0';
const POP_MARK: u8 = b'1';
const DUP: u8 = b'2';
const BINFLOAT: u8 = b'G';
const BININT: u8 = b'J';
const BININT1: u8 = b'K';
const BININT2: u8 = b'M';
const NONE: u8 = b'N';
const BINPERSID: u8 = b'Q';
const REDUCE: u8 = b'R';
const BINSTRING: u8 = b'T';
const SHORT_BINSTRING: u8 = b'U';
const BINUNICODE: u8 = b'X';
const APPEND: u8 = b'a';
const BUILD: u8 = b'b';
const GLOBAL: u8 = b'c';
const DICT: u8 = b'd';
const APPENDS: u8 = b'e';
const BINGET: u8 = b'h';
const LONG_BINGET: u8 = b'j';
const LIST: u8 = b'l';
const BINPUT: u8 = b'q';
const LONG_BINPUT: u8 = b'r';
const SETITEM: u8 = b's';
const TUPLE: u8 = b't';
const SETITEMS: u8 = b'u';
const EMPTY_DICT: u8 = b'}';
const EMPTY_LIST: u8 = b']';
const EMPTY_TUPLE: u8 = b')';
const PROTO: u8 = 0x80;
const NEWOBJ: u8 = 0x81;
const TUPLE1: u8 = 0x85;
const TUPLE2: u8 = 0x86;
const TUPLE3: u8 = 0x87;
const NEWTRUE: u8 = 0x88;
const NEWFALSE: u8 = 0x89;
const LONG1: u8 = 0x8a;
// Protocol 3
const BINBYTES: u8 = b'B';
const SHORT_BINBYTES: u8 = b'C';
// Protocol 4-5
const SHORT_BINUNICODE: u8 = 0x8c;
const BINUNICODE8: u8 = 0x8d;
const BINBYTES8: u8 = 0x8e;
const NEWOBJ_EX: u8 = 0x92;
const STACK_GLOBAL: u8 = 0x93;
const MEMOIZE: u8 = 0x94;
const FRAME: u8 = 0x95;
const BYTEARRAY8: u8 = 0x96;

const MAX_PROTOCOL: u8 = 5;

/// Globals the machine is willing to resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnownGlobal {
    OrderedDict,
    RebuildTensorV2,
    RebuildTensor,
    RebuildParameter,
    /// Typed storage class; `None` for `torch.UntypedStorage`, whose element
    /// width is unknowable here and rejected later at tensor rebuild.
    Storage(Option<Dtype>),
}

/// Persistent-id reference to a storage blob inside the archive.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageRef {
    pub dtype: Option<Dtype>,
    pub key: String,
    pub numel: u64,
}

/// A tensor as the pickle stream describes it: a storage view.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorSpec {
    pub storage: StorageRef,
    pub storage_offset: u64,
    pub shape: Vec<usize>,
    pub stride: Vec<usize>,
    pub requires_grad: bool,
}

/// Value produced by the machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Object {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Object>),
    Tuple(Vec<Object>),
    /// Insertion-ordered mapping.
    Dict(Vec<(Object, Object)>),
    Class(KnownGlobal),
    Storage(StorageRef),
    Tensor(TensorSpec),
}

impl Object {
    /// Python-style type name, for schema-violation reporting.
    pub fn type_name(&self) -> &'static str {
        match self {
            Object::None => "NoneType",
            Object::Bool(_) => "bool",
            Object::Int(_) => "int",
            Object::Float(_) => "float",
            Object::Str(_) => "str",
            Object::Bytes(_) => "bytes",
            Object::List(_) => "list",
            Object::Tuple(_) => "tuple",
            Object::Dict(_) => "dict",
            Object::Class(_) => "type",
            Object::Storage(_) => "storage",
            Object::Tensor(_) => "Tensor",
        }
    }
}

fn resolve_global(module: &str, name: &str) -> Result<KnownGlobal, WeightsmithError> {
    match (module, name) {
        ("collections", "OrderedDict") => Ok(KnownGlobal::OrderedDict),
        ("torch._utils", "_rebuild_tensor_v2") => Ok(KnownGlobal::RebuildTensorV2),
        ("torch._utils", "_rebuild_tensor") => Ok(KnownGlobal::RebuildTensor),
        ("torch._utils", "_rebuild_parameter") => Ok(KnownGlobal::RebuildParameter),
        ("torch" | "torch.storage", "UntypedStorage") => Ok(KnownGlobal::Storage(None)),
        ("torch", storage) => match Dtype::from_storage_class(storage) {
            Some(dtype) => Ok(KnownGlobal::Storage(Some(dtype))),
            None => Err(WeightsmithError::UnsafeGlobal {
                module: module.to_string(),
                name: name.to_string(),
            }),
        },
        _ => Err(WeightsmithError::UnsafeGlobal {
            module: module.to_string(),
            name: name.to_string(),
        }),
    }
}

/// Run the machine over a complete pickle stream and return the root object.
pub fn read_pickle(data: &[u8]) -> Result<Object, WeightsmithError> {
    Machine::new(data).run()
}

struct Machine<'a> {
    cursor: Cursor<&'a [u8]>,
    stack: Vec<Object>,
    marks: Vec<usize>,
    memo: HashMap<u32, Object>,
}

fn invalid(msg: impl Into<String>) -> WeightsmithError {
    WeightsmithError::InvalidFormat(msg.into())
}

fn truncated() -> WeightsmithError {
    invalid("truncated pickle stream")
}

impl<'a> Machine<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(data),
            stack: Vec::new(),
            marks: Vec::new(),
            memo: HashMap::new(),
        }
    }

    fn run(mut self) -> Result<Object, WeightsmithError> {
        loop {
            let pos = self.cursor.position();
            let op = self.read_u8()?;
            match op {
                STOP => return self.pop(),
                PROTO => {
                    let version = self.read_u8()?;
                    if version > MAX_PROTOCOL {
                        return Err(invalid(format!("pickle protocol {} unsupported", version)));
                    }
                }
                FRAME => {
                    // frame length; framing is irrelevant for an in-memory stream
                    self.read_u64()?;
                }
                MARK => self.marks.push(self.stack.len()),
                POP => {
                    self.pop()?;
                }
                POP_MARK => {
                    self.pop_mark()?;
                }
                DUP => {
                    let top = self.top()?.clone();
                    self.stack.push(top);
                }
                NONE => self.stack.push(Object::None),
                NEWTRUE => self.stack.push(Object::Bool(true)),
                NEWFALSE => self.stack.push(Object::Bool(false)),
                BININT => {
                    let v = self
                        .cursor
                        .read_i32::<LittleEndian>()
                        .map_err(|_| truncated())?;
                    self.stack.push(Object::Int(v as i64));
                }
                BININT1 => {
                    let v = self.read_u8()?;
                    self.stack.push(Object::Int(v as i64));
                }
                BININT2 => {
                    let v = self
                        .cursor
                        .read_u16::<LittleEndian>()
                        .map_err(|_| truncated())?;
                    self.stack.push(Object::Int(v as i64));
                }
                LONG1 => {
                    let len = self.read_u8()? as usize;
                    let bytes = self.read_bytes(len)?;
                    self.stack.push(Object::Int(long_from_le(&bytes)?));
                }
                BINFLOAT => {
                    let v = self
                        .cursor
                        .read_f64::<BigEndian>()
                        .map_err(|_| truncated())?;
                    self.stack.push(Object::Float(v));
                }
                SHORT_BINSTRING => {
                    let len = self.read_u8()? as usize;
                    let bytes = self.read_bytes(len)?;
                    self.stack.push(Object::Str(latin1(&bytes)));
                }
                BINSTRING => {
                    let len = self.read_u32()? as usize;
                    let bytes = self.read_bytes(len)?;
                    self.stack.push(Object::Str(latin1(&bytes)));
                }
                BINUNICODE => {
                    let len = self.read_u32()? as usize;
                    let bytes = self.read_bytes(len)?;
                    self.stack.push(Object::Str(utf8(bytes)?));
                }
                SHORT_BINUNICODE => {
                    let len = self.read_u8()? as usize;
                    let bytes = self.read_bytes(len)?;
                    self.stack.push(Object::Str(utf8(bytes)?));
                }
                BINUNICODE8 => {
                    let len = self.read_len64()?;
                    let bytes = self.read_bytes(len)?;
                    self.stack.push(Object::Str(utf8(bytes)?));
                }
                BINBYTES => {
                    let len = self.read_u32()? as usize;
                    let bytes = self.read_bytes(len)?;
                    self.stack.push(Object::Bytes(bytes));
                }
                SHORT_BINBYTES => {
                    let len = self.read_u8()? as usize;
                    let bytes = self.read_bytes(len)?;
                    self.stack.push(Object::Bytes(bytes));
                }
                BINBYTES8 | BYTEARRAY8 => {
                    let len = self.read_len64()?;
                    let bytes = self.read_bytes(len)?;
                    self.stack.push(Object::Bytes(bytes));
                }
                EMPTY_DICT => self.stack.push(Object::Dict(Vec::new())),
                EMPTY_LIST => self.stack.push(Object::List(Vec::new())),
                EMPTY_TUPLE => self.stack.push(Object::Tuple(Vec::new())),
                TUPLE => {
                    let items = self.pop_mark()?;
                    self.stack.push(Object::Tuple(items));
                }
                TUPLE1 => {
                    let a = self.pop()?;
                    self.stack.push(Object::Tuple(vec![a]));
                }
                TUPLE2 => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.stack.push(Object::Tuple(vec![a, b]));
                }
                TUPLE3 => {
                    let c = self.pop()?;
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.stack.push(Object::Tuple(vec![a, b, c]));
                }
                LIST => {
                    let items = self.pop_mark()?;
                    self.stack.push(Object::List(items));
                }
                DICT => {
                    let items = self.pop_mark()?;
                    self.stack.push(pairs_to_dict(items)?);
                }
                APPEND => {
                    let item = self.pop()?;
                    match self.top_mut()? {
                        Object::List(list) => list.push(item),
                        other => return Err(invalid(format!("APPEND on {}", other.type_name()))),
                    }
                }
                APPENDS => {
                    let items = self.pop_mark()?;
                    match self.top_mut()? {
                        Object::List(list) => list.extend(items),
                        other => return Err(invalid(format!("APPENDS on {}", other.type_name()))),
                    }
                }
                SETITEM => {
                    let value = self.pop()?;
                    let key = self.pop()?;
                    match self.top_mut()? {
                        Object::Dict(pairs) => dict_insert(pairs, key, value),
                        other => return Err(invalid(format!("SETITEM on {}", other.type_name()))),
                    }
                }
                SETITEMS => {
                    let items = self.pop_mark()?;
                    if items.len() % 2 != 0 {
                        return Err(invalid("odd number of SETITEMS operands"));
                    }
                    match self.top_mut()? {
                        Object::Dict(pairs) => {
                            let mut it = items.into_iter();
                            while let (Some(key), Some(value)) = (it.next(), it.next()) {
                                dict_insert(pairs, key, value);
                            }
                        }
                        other => {
                            return Err(invalid(format!("SETITEMS on {}", other.type_name())))
                        }
                    }
                }
                BINPUT => {
                    let idx = self.read_u8()? as u32;
                    let top = self.top()?.clone();
                    self.memo.insert(idx, top);
                }
                LONG_BINPUT => {
                    let idx = self.read_u32()?;
                    let top = self.top()?.clone();
                    self.memo.insert(idx, top);
                }
                MEMOIZE => {
                    let idx = self.memo.len() as u32;
                    let top = self.top()?.clone();
                    self.memo.insert(idx, top);
                }
                BINGET => {
                    let idx = self.read_u8()? as u32;
                    self.push_memo(idx)?;
                }
                LONG_BINGET => {
                    let idx = self.read_u32()?;
                    self.push_memo(idx)?;
                }
                GLOBAL => {
                    let module = self.read_line()?;
                    let name = self.read_line()?;
                    let global = resolve_global(&module, &name)?;
                    self.stack.push(Object::Class(global));
                }
                STACK_GLOBAL => {
                    let name = self.pop_str()?;
                    let module = self.pop_str()?;
                    let global = resolve_global(&module, &name)?;
                    self.stack.push(Object::Class(global));
                }
                REDUCE | NEWOBJ => {
                    let args = self.pop()?;
                    let callable = self.pop()?;
                    let result = apply(callable, args)?;
                    self.stack.push(result);
                }
                NEWOBJ_EX => {
                    let kwargs = self.pop()?;
                    let args = self.pop()?;
                    let callable = self.pop()?;
                    if !matches!(&kwargs, Object::Dict(pairs) if pairs.is_empty()) {
                        return Err(invalid("NEWOBJ_EX with keyword arguments"));
                    }
                    let result = apply(callable, args)?;
                    self.stack.push(result);
                }
                BUILD => {
                    let state = self.pop()?;
                    let obj = self.pop()?;
                    self.stack.push(build(obj, state)?);
                }
                BINPERSID => {
                    let pid = self.pop()?;
                    self.stack.push(Object::Storage(parse_persistent_id(pid)?));
                }
                other => {
                    return Err(invalid(format!(
                        "unsupported pickle opcode 0x{:02x} at offset {}",
                        other, pos
                    )))
                }
            }
        }
    }

    fn read_u8(&mut self) -> Result<u8, WeightsmithError> {
        self.cursor.read_u8().map_err(|_| truncated())
    }

    fn read_u32(&mut self) -> Result<u32, WeightsmithError> {
        self.cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| truncated())
    }

    fn read_u64(&mut self) -> Result<u64, WeightsmithError> {
        self.cursor
            .read_u64::<LittleEndian>()
            .map_err(|_| truncated())
    }

    fn read_len64(&mut self) -> Result<usize, WeightsmithError> {
        let len = self.read_u64()?;
        usize::try_from(len).map_err(|_| invalid("length field exceeds address space"))
    }

    fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>, WeightsmithError> {
        let remaining = self.cursor.get_ref().len() as u64 - self.cursor.position();
        if (len as u64) > remaining {
            return Err(truncated());
        }
        let mut buf = vec![0u8; len];
        self.cursor.read_exact(&mut buf).map_err(|_| truncated())?;
        Ok(buf)
    }

    /// Newline-terminated field, as GLOBAL encodes module and name.
    fn read_line(&mut self) -> Result<String, WeightsmithError> {
        let mut bytes = Vec::new();
        loop {
            let b = self.read_u8()?;
            if b == b'\n' {
                return Ok(latin1(&bytes));
            }
            bytes.push(b);
        }
    }

    fn pop(&mut self) -> Result<Object, WeightsmithError> {
        if let Some(limit) = self.marks.last() {
            if self.stack.len() <= *limit {
                return Err(invalid("pop below mark"));
            }
        }
        self.stack.pop().ok_or_else(|| invalid("pop on empty stack"))
    }

    fn pop_str(&mut self) -> Result<String, WeightsmithError> {
        match self.pop()? {
            Object::Str(s) => Ok(s),
            other => Err(invalid(format!("expected str, found {}", other.type_name()))),
        }
    }

    fn pop_mark(&mut self) -> Result<Vec<Object>, WeightsmithError> {
        let mark = self.marks.pop().ok_or_else(|| invalid("no mark on stack"))?;
        Ok(self.stack.split_off(mark))
    }

    fn top(&self) -> Result<&Object, WeightsmithError> {
        self.stack.last().ok_or_else(|| invalid("empty stack"))
    }

    fn top_mut(&mut self) -> Result<&mut Object, WeightsmithError> {
        self.stack.last_mut().ok_or_else(|| invalid("empty stack"))
    }

    fn push_memo(&mut self, idx: u32) -> Result<(), WeightsmithError> {
        let obj = self
            .memo
            .get(&idx)
            .cloned()
            .ok_or_else(|| invalid(format!("memo slot {} unset", idx)))?;
        self.stack.push(obj);
        Ok(())
    }
}

fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

fn utf8(bytes: Vec<u8>) -> Result<String, WeightsmithError> {
    String::from_utf8(bytes).map_err(|_| invalid("invalid utf-8 in pickle string"))
}

/// Little-endian two's-complement integer of up to 8 bytes (LONG1 payload).
fn long_from_le(bytes: &[u8]) -> Result<i64, WeightsmithError> {
    if bytes.is_empty() {
        return Ok(0);
    }
    if bytes.len() > 8 {
        return Err(invalid("integer wider than 64 bits"));
    }
    let negative = bytes[bytes.len() - 1] & 0x80 != 0;
    let mut buf = if negative { [0xffu8; 8] } else { [0u8; 8] };
    buf[..bytes.len()].copy_from_slice(bytes);
    Ok(i64::from_le_bytes(buf))
}

fn pairs_to_dict(items: Vec<Object>) -> Result<Object, WeightsmithError> {
    if items.len() % 2 != 0 {
        return Err(invalid("odd number of DICT operands"));
    }
    let mut pairs = Vec::with_capacity(items.len() / 2);
    let mut it = items.into_iter();
    while let (Some(key), Some(value)) = (it.next(), it.next()) {
        dict_insert(&mut pairs, key, value);
    }
    Ok(Object::Dict(pairs))
}

fn dict_insert(pairs: &mut Vec<(Object, Object)>, key: Object, value: Object) {
    if let Some(slot) = pairs.iter_mut().find(|(k, _)| *k == key) {
        slot.1 = value;
    } else {
        pairs.push((key, value));
    }
}

/// REDUCE/NEWOBJ dispatch over the allowlisted constructors.
fn apply(callable: Object, args: Object) -> Result<Object, WeightsmithError> {
    let global = match callable {
        Object::Class(global) => global,
        other => {
            return Err(invalid(format!(
                "cannot call a {} object",
                other.type_name()
            )))
        }
    };
    let args = match args {
        Object::Tuple(items) => items,
        other => {
            return Err(invalid(format!(
                "constructor arguments are {}, expected tuple",
                other.type_name()
            )))
        }
    };
    match global {
        KnownGlobal::OrderedDict => ordered_dict(args),
        KnownGlobal::RebuildTensorV2 => rebuild_tensor(args, true),
        KnownGlobal::RebuildTensor => rebuild_tensor(args, false),
        KnownGlobal::RebuildParameter => match args.into_iter().next() {
            Some(tensor @ Object::Tensor(_)) => Ok(tensor),
            _ => Err(invalid("_rebuild_parameter without inner tensor")),
        },
        KnownGlobal::Storage(_) => Err(invalid("storage classes are not constructible")),
    }
}

fn ordered_dict(args: Vec<Object>) -> Result<Object, WeightsmithError> {
    match args.into_iter().next() {
        None => Ok(Object::Dict(Vec::new())),
        Some(Object::List(items)) => {
            let mut pairs = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Object::Tuple(kv) if kv.len() == 2 => {
                        let mut kv = kv.into_iter();
                        let key = kv.next().unwrap_or(Object::None);
                        let value = kv.next().unwrap_or(Object::None);
                        dict_insert(&mut pairs, key, value);
                    }
                    other => {
                        return Err(invalid(format!(
                            "OrderedDict item is {}, expected pair",
                            other.type_name()
                        )))
                    }
                }
            }
            Ok(Object::Dict(pairs))
        }
        Some(other) => Err(invalid(format!(
            "OrderedDict argument is {}, expected list of pairs",
            other.type_name()
        ))),
    }
}

/// `_rebuild_tensor_v2(storage, offset, size, stride, requires_grad, hooks[, metadata])`
/// or the v1 form without the trailing three.
fn rebuild_tensor(args: Vec<Object>, v2: bool) -> Result<Object, WeightsmithError> {
    let expected = if v2 { 6 } else { 4 };
    if args.len() < expected {
        return Err(invalid(format!(
            "tensor constructor takes {} arguments, got {}",
            expected,
            args.len()
        )));
    }
    let mut it = args.into_iter();
    let storage = match it.next() {
        Some(Object::Storage(storage)) => storage,
        Some(other) => {
            return Err(invalid(format!(
                "tensor storage is {}, expected persistent storage",
                other.type_name()
            )))
        }
        None => unreachable!(),
    };
    let storage_offset = expect_u64(it.next(), "storage offset")?;
    let shape = expect_dims(it.next(), "shape")?;
    let stride = expect_dims(it.next(), "stride")?;
    let requires_grad = if v2 {
        matches!(it.next(), Some(Object::Bool(true)))
    } else {
        false
    };
    if shape.len() != stride.len() {
        return Err(invalid(format!(
            "shape rank {} does not match stride rank {}",
            shape.len(),
            stride.len()
        )));
    }
    Ok(Object::Tensor(TensorSpec {
        storage,
        storage_offset,
        shape,
        stride,
        requires_grad,
    }))
}

fn expect_u64(obj: Option<Object>, what: &str) -> Result<u64, WeightsmithError> {
    match obj {
        Some(Object::Int(v)) if v >= 0 => Ok(v as u64),
        Some(other) => Err(invalid(format!(
            "{} is {}, expected non-negative int",
            what,
            other.type_name()
        ))),
        None => Err(invalid(format!("{} missing", what))),
    }
}

fn expect_dims(obj: Option<Object>, what: &str) -> Result<Vec<usize>, WeightsmithError> {
    match obj {
        Some(Object::Tuple(items)) | Some(Object::List(items)) => items
            .into_iter()
            .map(|item| match item {
                Object::Int(v) if v >= 0 => Ok(v as usize),
                other => Err(invalid(format!(
                    "{} element is {}, expected non-negative int",
                    what,
                    other.type_name()
                ))),
            })
            .collect(),
        Some(other) => Err(invalid(format!(
            "{} is {}, expected tuple",
            what,
            other.type_name()
        ))),
        None => Err(invalid(format!("{} missing", what))),
    }
}

/// BUILD applies `__setstate__`; the only shapes torch emits here are dict
/// merges and tensor metadata (which carries nothing we keep).
fn build(obj: Object, state: Object) -> Result<Object, WeightsmithError> {
    match (obj, state) {
        (obj, Object::None) => Ok(obj),
        (Object::Dict(mut pairs), Object::Dict(state)) => {
            for (key, value) in state {
                dict_insert(&mut pairs, key, value);
            }
            Ok(Object::Dict(pairs))
        }
        (tensor @ Object::Tensor(_), Object::Dict(_)) | (tensor @ Object::Tensor(_), Object::Tuple(_)) => {
            Ok(tensor)
        }
        (obj, state) => Err(invalid(format!(
            "cannot BUILD {} with {} state",
            obj.type_name(),
            state.type_name()
        ))),
    }
}

/// Torch persistent ids: `('storage', StorageClass, key, location, numel)`.
fn parse_persistent_id(pid: Object) -> Result<StorageRef, WeightsmithError> {
    let items = match pid {
        Object::Tuple(items) => items,
        other => {
            return Err(invalid(format!(
                "persistent id is {}, expected tuple",
                other.type_name()
            )))
        }
    };
    if items.len() < 5 {
        return Err(invalid("persistent id tuple too short"));
    }
    let mut it = items.into_iter();
    match it.next() {
        Some(Object::Str(tag)) if tag == "storage" => {}
        _ => return Err(invalid("persistent id is not a storage reference")),
    }
    let dtype = match it.next() {
        Some(Object::Class(KnownGlobal::Storage(dtype))) => dtype,
        _ => return Err(invalid("persistent id lacks a storage class")),
    };
    let key = match it.next() {
        Some(Object::Str(key)) => key,
        _ => return Err(invalid("persistent id lacks a storage key")),
    };
    let _location = it.next();
    let numel = expect_u64(it.next(), "storage element count")?;
    Ok(StorageRef { dtype, key, numel })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unicode(s: &str) -> Vec<u8> {
        let mut out = vec![BINUNICODE];
        out.extend_from_slice(&(s.len() as u32).to_le_bytes());
        out.extend_from_slice(s.as_bytes());
        out
    }

    #[test]
    fn ints_and_strings() {
        let mut p = vec![PROTO, 2, EMPTY_DICT, MARK];
        p.extend(unicode("epoch"));
        p.extend([BININT1, 7]);
        p.extend(unicode("step"));
        p.extend([BININT, 0x40, 0xe2, 0x01, 0x00]); // 123456
        p.extend([SETITEMS, STOP]);
        let obj = read_pickle(&p).unwrap();
        let Object::Dict(pairs) = obj else { panic!("expected dict") };
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0], (Object::Str("epoch".into()), Object::Int(7)));
        assert_eq!(pairs[1], (Object::Str("step".into()), Object::Int(123_456)));
    }

    #[test]
    fn long1_signed() {
        // -2 encoded as LONG1 \x01\xfe
        let p = vec![PROTO, 2, LONG1, 1, 0xfe, STOP];
        assert_eq!(read_pickle(&p).unwrap(), Object::Int(-2));
        // 0-byte payload is zero
        let p = vec![PROTO, 2, LONG1, 0, STOP];
        assert_eq!(read_pickle(&p).unwrap(), Object::Int(0));
    }

    #[test]
    fn memo_roundtrip() {
        let mut p = vec![PROTO, 2];
        p.extend(unicode("shared"));
        p.extend([BINPUT, 0, POP, BINGET, 0, STOP]);
        assert_eq!(read_pickle(&p).unwrap(), Object::Str("shared".into()));
    }

    #[test]
    fn unsafe_global_rejected() {
        let mut p = vec![PROTO, 2, GLOBAL];
        p.extend_from_slice(b"os\nsystem\n");
        p.push(STOP);
        let err = read_pickle(&p).unwrap_err();
        assert!(matches!(
            err,
            WeightsmithError::UnsafeGlobal { ref module, ref name }
                if module == "os" && name == "system"
        ));
    }

    #[test]
    fn unknown_storage_class_rejected() {
        let mut p = vec![PROTO, 2, GLOBAL];
        p.extend_from_slice(b"torch\n_C\n");
        p.push(STOP);
        assert!(matches!(
            read_pickle(&p).unwrap_err(),
            WeightsmithError::UnsafeGlobal { .. }
        ));
    }

    #[test]
    fn stack_global_allowlisted() {
        let mut p = vec![PROTO, 4];
        p.push(SHORT_BINUNICODE);
        p.push("collections".len() as u8);
        p.extend_from_slice(b"collections");
        p.push(SHORT_BINUNICODE);
        p.push("OrderedDict".len() as u8);
        p.extend_from_slice(b"OrderedDict");
        p.extend([STACK_GLOBAL, EMPTY_TUPLE, REDUCE, STOP]);
        assert_eq!(read_pickle(&p).unwrap(), Object::Dict(Vec::new()));
    }

    #[test]
    fn tensor_rebuild_via_persistent_storage() {
        let mut p = vec![PROTO, 2, GLOBAL];
        p.extend_from_slice(b"torch._utils\n_rebuild_tensor_v2\n");
        // args tuple
        p.push(MARK);
        {
            // persistent id: ('storage', FloatStorage, '0', 'cpu', 6)
            p.push(MARK);
            p.extend(unicode("storage"));
            p.push(GLOBAL);
            p.extend_from_slice(b"torch\nFloatStorage\n");
            p.extend(unicode("0"));
            p.extend(unicode("cpu"));
            p.extend([BININT1, 6]);
            p.extend([TUPLE, BINPERSID]);
        }
        p.extend([BININT1, 0]); // offset
        p.extend([MARK, BININT1, 2, BININT1, 3, TUPLE]); // shape (2, 3)
        p.extend([MARK, BININT1, 3, BININT1, 1, TUPLE]); // stride (3, 1)
        p.push(NEWFALSE);
        p.push(GLOBAL);
        p.extend_from_slice(b"collections\nOrderedDict\n");
        p.extend([EMPTY_TUPLE, REDUCE]); // empty hooks
        p.extend([TUPLE, REDUCE, STOP]);

        let obj = read_pickle(&p).unwrap();
        let Object::Tensor(spec) = obj else { panic!("expected tensor") };
        assert_eq!(spec.storage.key, "0");
        assert_eq!(spec.storage.dtype, Some(Dtype::F32));
        assert_eq!(spec.storage.numel, 6);
        assert_eq!(spec.shape, vec![2, 3]);
        assert_eq!(spec.stride, vec![3, 1]);
        assert!(!spec.requires_grad);
    }

    #[test]
    fn truncated_stream_is_invalid() {
        let p = vec![PROTO, 2, BINUNICODE, 0xff, 0xff, 0xff];
        assert!(matches!(
            read_pickle(&p).unwrap_err(),
            WeightsmithError::InvalidFormat(_)
        ));
    }
}

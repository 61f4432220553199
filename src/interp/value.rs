//! Value representation and bytecode encoding

use crate::interp::arena::Handle;
use crate::interp::error::VmError;
use parking_lot::Mutex;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Type-safe handle for tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TableHandle(pub Handle);

/// Type-safe handle for bytecode closures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClosureHandle(pub Handle);

/// Type-safe handle for host functions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeHandle(pub Handle);

/// A captured variable shared between closures
pub type UpvalueCell = Arc<Mutex<Value>>;

/// Create a fresh upvalue cell
pub fn new_cell(value: Value) -> UpvalueCell {
    Arc::new(Mutex::new(value))
}

/// Core value type
#[derive(Debug, Clone)]
pub enum Value {
    /// Nil value
    Nil,

    /// Boolean value
    Boolean(bool),

    /// Number value (all numbers are f64)
    Number(f64),

    /// Immutable string
    String(Arc<str>),

    /// Table handle
    Table(TableHandle),

    /// Bytecode closure handle
    Closure(ClosureHandle),

    /// Host function handle
    Native(NativeHandle),
}

impl Value {
    /// Get the type name of this value
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Boolean(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Table(_) => "table",
            Value::Closure(_) | Value::Native(_) => "function",
        }
    }

    /// Truthiness: everything except nil and false
    pub fn to_bool(&self) -> bool {
        !matches!(self, Value::Nil | Value::Boolean(false))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Check if function (closure or native)
    pub fn is_function(&self) -> bool {
        matches!(self, Value::Closure(_) | Value::Native(_))
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<TableHandle> {
        match self {
            Value::Table(t) => Some(*t),
            _ => None,
        }
    }

    /// Heap handle behind a reference value
    pub fn handle(&self) -> Option<Handle> {
        match self {
            Value::Table(TableHandle(h))
            | Value::Closure(ClosureHandle(h))
            | Value::Native(NativeHandle(h)) => Some(*h),
            _ => None,
        }
    }

    /// Whether equality for this value is identity rather than content
    pub fn is_reference(&self) -> bool {
        self.handle().is_some()
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            // NaN != NaN
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Table(a), Value::Table(b)) => a == b,
            (Value::Closure(a), Value::Closure(b)) => a == b,
            (Value::Native(a), Value::Native(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Value::Nil => 0u8.hash(state),
            Value::Boolean(b) => {
                1u8.hash(state);
                b.hash(state);
            }
            Value::Number(n) => {
                2u8.hash(state);
                // -0.0 and 0.0 compare equal, so they must hash equal
                let n = if *n == 0.0 { 0.0 } else { *n };
                n.to_bits().hash(state);
            }
            Value::String(s) => {
                3u8.hash(state);
                s.hash(state);
            }
            Value::Table(t) => {
                4u8.hash(state);
                t.hash(state);
            }
            Value::Closure(c) => {
                5u8.hash(state);
                c.hash(state);
            }
            Value::Native(n) => {
                6u8.hash(state);
                n.hash(state);
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => write!(f, "{}", *n as i64),
            Value::Number(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "{}", s),
            Value::Table(t) => write!(f, "table: {:#x}", t.0.index),
            Value::Closure(c) => write!(f, "function: {:#x}", c.0.index),
            Value::Native(n) => write!(f, "function: builtin: {:#x}", n.0.index),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n as f64)
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Value::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(Arc::from(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(Arc::from(s))
    }
}

impl From<TableHandle> for Value {
    fn from(t: TableHandle) -> Self {
        Value::Table(t)
    }
}

impl From<ClosureHandle> for Value {
    fn from(c: ClosureHandle) -> Self {
        Value::Closure(c)
    }
}

impl From<NativeHandle> for Value {
    fn from(n: NativeHandle) -> Self {
        Value::Native(n)
    }
}

/// Bit set on a B/C operand to select a constant instead of a register
pub const RK_CONSTANT: u16 = 0x100;

/// Encode constant index `k` as an RK operand
pub fn rk(k: u32) -> u16 {
    RK_CONSTANT | (k as u16 & 0xFF)
}

/// Bias applied to the signed Bx field
pub const SBX_BIAS: i32 = 131071;

/// Bytecode instruction (32-bit format compatible with Lua 5.1)
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Instruction(pub u32);

impl Instruction {
    /// Encode an A/B/C instruction
    pub fn abc(op: OpCode, a: u8, b: u16, c: u16) -> Self {
        Instruction(
            (op as u32)
                | ((a as u32) << 6)
                | (((b as u32) & 0x1FF) << 14)
                | (((c as u32) & 0x1FF) << 23),
        )
    }

    /// Encode an A/Bx instruction
    pub fn abx(op: OpCode, a: u8, bx: u32) -> Self {
        Instruction((op as u32) | ((a as u32) << 6) | ((bx & 0x3FFFF) << 14))
    }

    /// Encode an A/sBx instruction
    pub fn asbx(op: OpCode, a: u8, sbx: i32) -> Self {
        Self::abx(op, a, (sbx + SBX_BIAS) as u32)
    }

    /// Extract opcode (6 bits)
    pub fn opcode(&self) -> u8 {
        (self.0 & 0x3F) as u8
    }

    /// Extract A field (8 bits)
    pub fn a(&self) -> u8 {
        ((self.0 >> 6) & 0xFF) as u8
    }

    /// Extract B field (9 bits)
    pub fn b(&self) -> u16 {
        ((self.0 >> 14) & 0x1FF) as u16
    }

    /// Extract C field (9 bits)
    pub fn c(&self) -> u16 {
        ((self.0 >> 23) & 0x1FF) as u16
    }

    /// Extract Bx field (18 bits unsigned)
    pub fn bx(&self) -> u32 {
        (self.0 >> 14) & 0x3FFFF
    }

    /// Extract sBx field (18 bits signed)
    pub fn sbx(&self) -> i32 {
        (self.bx() as i32) - SBX_BIAS
    }
}

/// Opcodes (Lua 5.1 numbering)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Move = 0,
    LoadK = 1,
    LoadBool = 2,
    LoadNil = 3,
    GetUpval = 4,
    GetGlobal = 5,
    GetTable = 6,
    SetGlobal = 7,
    SetUpval = 8,
    SetTable = 9,
    NewTable = 10,
    Self_ = 11,
    Add = 12,
    Sub = 13,
    Mul = 14,
    Div = 15,
    Mod = 16,
    Pow = 17,
    Unm = 18,
    Not = 19,
    Len = 20,
    Concat = 21,
    Jmp = 22,
    Eq = 23,
    Lt = 24,
    Le = 25,
    Test = 26,
    TestSet = 27,
    Call = 28,
    TailCall = 29,
    Return = 30,
    ForLoop = 31,
    ForPrep = 32,
    TForLoop = 33,
    SetList = 34,
    Close = 35,
    Closure = 36,
    Vararg = 37,
}

impl TryFrom<u8> for OpCode {
    type Error = VmError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use OpCode::*;
        const TABLE: [OpCode; 38] = [
            Move, LoadK, LoadBool, LoadNil, GetUpval, GetGlobal, GetTable, SetGlobal, SetUpval,
            SetTable, NewTable, Self_, Add, Sub, Mul, Div, Mod, Pow, Unm, Not, Len, Concat, Jmp,
            Eq, Lt, Le, Test, TestSet, Call, TailCall, Return, ForLoop, ForPrep, TForLoop,
            SetList, Close, Closure, Vararg,
        ];
        TABLE.get(value as usize).copied().ok_or_else(|| VmError::InvalidInstruction {
            pc: 0,
            reason: format!("unknown opcode {}", value),
        })
    }
}

//! Bytecode assembler
//!
//! There is no source-language front end; hosts and tests assemble function
//! prototypes instruction by instruction.

use crate::interp::proto::{FunctionProto, ProtoRef};
use crate::interp::value::{Instruction, OpCode, Value};
use std::sync::Arc;

/// Incrementally assembles a [`FunctionProto`]
#[derive(Debug, Default)]
pub struct ProtoBuilder {
    proto: FunctionProto,
}

impl ProtoBuilder {
    /// Start a named function
    pub fn new(name: &str) -> Self {
        let mut builder = Self::default();
        builder.proto.name = Some(Arc::from(name));
        builder
    }

    /// Start an anonymous function (a chunk)
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn params(mut self, count: u8) -> Self {
        self.proto.param_count = count;
        self
    }

    pub fn vararg(mut self) -> Self {
        self.proto.is_vararg = true;
        self
    }

    pub fn upvalues(mut self, count: u8) -> Self {
        self.proto.upvalue_count = count;
        self
    }

    pub fn line(mut self, line: u32) -> Self {
        self.proto.line_defined = line;
        self
    }

    pub fn source(mut self, source: &str) -> Self {
        self.proto.source = Arc::from(source);
        self
    }

    /// Add a constant, reusing an equal existing slot; returns its 0-based index
    pub fn constant(&mut self, value: impl Into<Value>) -> u32 {
        let value = value.into();
        if let Some(pos) = self.proto.constants.iter().position(|c| *c == value) {
            return pos as u32;
        }
        self.proto.constants.push(value);
        (self.proto.constants.len() - 1) as u32
    }

    /// Add a nested prototype; returns its 0-based index
    pub fn nested(&mut self, proto: ProtoRef) -> u32 {
        self.proto.nested.push(proto);
        (self.proto.nested.len() - 1) as u32
    }

    /// Append an instruction; returns its pc
    pub fn emit(&mut self, instr: Instruction) -> usize {
        self.proto.code.push(instr);
        self.proto.code.len() - 1
    }

    pub fn abc(&mut self, op: OpCode, a: u8, b: u16, c: u16) -> usize {
        self.emit(Instruction::abc(op, a, b, c))
    }

    pub fn abx(&mut self, op: OpCode, a: u8, bx: u32) -> usize {
        self.emit(Instruction::abx(op, a, bx))
    }

    pub fn asbx(&mut self, op: OpCode, a: u8, sbx: i32) -> usize {
        self.emit(Instruction::asbx(op, a, sbx))
    }

    /// `R[a] = K[value]`
    pub fn load(&mut self, a: u8, value: impl Into<Value>) -> usize {
        let k = self.constant(value);
        self.abx(OpCode::LoadK, a, k)
    }

    /// `R[a] = _ENV[name]`
    pub fn get_global(&mut self, a: u8, name: &str) -> usize {
        let k = self.constant(name);
        self.abx(OpCode::GetGlobal, a, k)
    }

    /// `_ENV[name] = R[a]`
    pub fn set_global(&mut self, a: u8, name: &str) -> usize {
        let k = self.constant(name);
        self.abx(OpCode::SetGlobal, a, k)
    }

    /// Call `R[a]` with `nargs` arguments, keeping `nresults` results
    pub fn call(&mut self, a: u8, nargs: u16, nresults: u16) -> usize {
        self.abc(OpCode::Call, a, nargs + 1, nresults + 1)
    }

    /// Return `count` registers starting at `a`
    pub fn ret(&mut self, a: u8, count: u16) -> usize {
        self.abc(OpCode::Return, a, count + 1, 0)
    }

    /// Finish, sizing the register window from the emitted code
    pub fn build(mut self) -> ProtoRef {
        let highest = self
            .proto
            .code
            .iter()
            .map(|i| i.a() as usize + 1)
            .max()
            .unwrap_or(0)
            .max(self.proto.param_count as usize)
            .max(2);
        self.proto.max_stack = highest.min(u8::MAX as usize) as u8;
        if self.proto.code.last().map(|i| i.opcode()) != Some(OpCode::Return as u8) {
            self.ret(0, 0);
        }
        self.proto.into_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants_are_deduplicated() {
        let mut b = ProtoBuilder::new("f");
        let first = b.constant("x");
        b.constant(1.0);
        assert_eq!(b.constant("x"), first);
        let proto = b.build();
        assert_eq!(proto.read().constants.len(), 2);
    }

    #[test]
    fn test_build_appends_return() {
        let mut b = ProtoBuilder::new("f").params(3);
        b.load(0, 1.0);
        let proto = b.build();
        let p = proto.read();
        assert_eq!(p.code.last().map(|i| i.opcode()), Some(OpCode::Return as u8));
        assert_eq!(p.max_stack, 3);
    }
}

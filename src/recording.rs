//! A recording assembler for tests and diagnostics.
//!
//! Instead of encoding bytes it renders every applied operation as one text
//! line and counts one length unit per operation, so code promises resolve
//! to operation indices. The emission log is shared through an `Rc` handle
//! that stays valid after the assembler is boxed into the compiler.
//!
//! The default geometry models a small regular machine: eight registers,
//! of which 5 (thread), 6 (base) and 7 (stack) are reserved, return values
//! travel in 0/1, and the first two argument words in 2/3.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::assembler::{
    Assembler, AssemblerClient, AsmOperand, BinaryOp, NullaryOp, OperandConstraint, OperandKind,
    Plan, UnaryOp, UnaryPlan,
};
use crate::promise::Promise;

/// Shared handle to the emission log.
pub type EmissionLog = Rc<RefCell<Vec<String>>>;

pub struct RecordingAssembler<'arena> {
    word: u32,
    ops: EmissionLog,
    /// Unary applications whose operand carried a promise, by op index.
    promises: Rc<RefCell<Vec<(usize, UnaryOp, Promise<'arena>)>>>,
    /// Binary operations redirected to runtime helpers.
    thunks: HashMap<BinaryOp, i64>,
}

impl<'arena> RecordingAssembler<'arena> {
    pub fn new(word: u32) -> Self {
        Self {
            word,
            ops: Rc::new(RefCell::new(Vec::new())),
            promises: Rc::new(RefCell::new(Vec::new())),
            thunks: HashMap::new(),
        }
    }

    pub fn log(&self) -> EmissionLog {
        Rc::clone(&self.ops)
    }

    pub fn promise_log(&self) -> Rc<RefCell<Vec<(usize, UnaryOp, Promise<'arena>)>>> {
        Rc::clone(&self.promises)
    }

    /// Declare that `op` cannot be emitted directly and must go through the
    /// runtime helper at `address`.
    pub fn set_thunk(&mut self, op: BinaryOp, address: i64) {
        self.thunks.insert(op, address);
    }

    fn render(&self, operand: &AsmOperand<'arena>) -> String {
        match operand {
            AsmOperand::Constant(p) => match p.value() {
                Ok(v) => format!("const({v})"),
                Err(_) => "const(?)".to_string(),
            },
            AsmOperand::Address(p) => match p.value() {
                Ok(v) => format!("addr({v})"),
                Err(_) => "addr(?)".to_string(),
            },
            AsmOperand::Register { low, high: None } => format!("reg({low})"),
            AsmOperand::Register { low, high: Some(h) } => format!("reg({h}:{low})"),
            AsmOperand::Memory { base, offset, index: None, .. } => {
                format!("[r{base}{offset:+}]")
            }
            AsmOperand::Memory { base, offset, index: Some(i), scale } => {
                format!("[r{base}{offset:+}+r{i}*{scale}]")
            }
        }
    }

    fn emit(&mut self, line: String) {
        self.ops.borrow_mut().push(line);
    }
}

impl<'arena> Assembler<'arena> for RecordingAssembler<'arena> {
    fn register_count(&self) -> usize {
        8
    }

    fn base(&self) -> u8 {
        6
    }

    fn stack(&self) -> u8 {
        7
    }

    fn thread(&self) -> u8 {
        5
    }

    fn return_low(&self) -> u8 {
        0
    }

    fn return_high(&self) -> u8 {
        1
    }

    fn argument_register_count(&self) -> usize {
        2
    }

    fn argument_register(&self, index: usize) -> u8 {
        match index {
            0 => 2,
            1 => 3,
            _ => panic!("argument register {index} out of range"),
        }
    }

    fn word(&self) -> u32 {
        self.word
    }

    fn stack_padding(&self, depth: u32) -> u32 {
        depth
    }

    fn plan(&self, op: BinaryOp, _size: u32) -> Plan {
        let value_kinds = OperandKind::Constant.bit()
            | OperandKind::Address.bit()
            | OperandKind::Register.bit()
            | OperandKind::Memory.bit();
        let (src, dst) = match op {
            BinaryOp::Move | BinaryOp::MoveZ | BinaryOp::Move4To8 => (
                OperandConstraint { type_mask: value_kinds, register_mask: !0 },
                OperandConstraint {
                    type_mask: OperandKind::Register.bit() | OperandKind::Memory.bit(),
                    register_mask: !0,
                },
            ),
            _ => (
                OperandConstraint { type_mask: value_kinds, register_mask: !0 },
                OperandConstraint { type_mask: OperandKind::Register.bit(), register_mask: !0 },
            ),
        };
        Plan { src, dst, thunk: self.thunks.get(&op).copied() }
    }

    fn plan_unary(&self, _op: UnaryOp, _size: u32) -> UnaryPlan {
        UnaryPlan {
            operand: OperandConstraint {
                type_mask: OperandKind::Register.bit(),
                register_mask: !0,
            },
            thunk: None,
        }
    }

    fn apply0(&mut self, op: NullaryOp) {
        self.emit(format!("{op:?}"));
    }

    fn apply1(
        &mut self,
        op: UnaryOp,
        size: u32,
        a: AsmOperand<'arena>,
        _client: &mut dyn AssemblerClient,
    ) {
        match a {
            AsmOperand::Constant(p) | AsmOperand::Address(p) => {
                let index = self.ops.borrow().len();
                self.promises.borrow_mut().push((index, op, p));
            }
            _ => {}
        }
        let a = self.render(&a);
        self.emit(format!("{op:?}{size} {a}"));
    }

    fn apply2(
        &mut self,
        op: BinaryOp,
        size: u32,
        a: AsmOperand<'arena>,
        b: AsmOperand<'arena>,
        _client: &mut dyn AssemblerClient,
    ) {
        let a = self.render(&a);
        let b = self.render(&b);
        self.emit(format!("{op:?}{size} {a}, {b}"));
    }

    fn length(&self) -> usize {
        self.ops.borrow().len()
    }

    fn write_to(&self, dst: &mut [u8]) {
        let len = self.length();
        for byte in dst.iter_mut().take(len) {
            *byte = 0x90;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::promise::PromiseNode;
    use bumpalo::Bump;

    struct NullClient;

    impl AssemblerClient for NullClient {
        fn acquire_temporary(&mut self, _mask: u64) -> u8 {
            4
        }
        fn release_temporary(&mut self, _r: u8) {}
        fn save(&mut self, _r: u8) -> bool {
            false
        }
        fn restore(&mut self, _r: u8) -> bool {
            false
        }
    }

    #[test]
    fn test_rendering() {
        let arena = Bump::new();
        let mut asm = RecordingAssembler::new(8);
        let log = asm.log();

        let p = Promise::new(arena.alloc(PromiseNode::Resolved(42)));
        asm.apply2(
            BinaryOp::Move,
            4,
            AsmOperand::Constant(p),
            AsmOperand::Register { low: 0, high: None },
            &mut NullClient,
        );
        asm.apply1(
            UnaryOp::Push,
            8,
            AsmOperand::Memory { base: 6, offset: -16, index: None, scale: 1 },
            &mut NullClient,
        );
        asm.apply0(NullaryOp::Return);

        let ops = log.borrow();
        assert_eq!(ops[0], "Move4 const(42), reg(0)");
        assert_eq!(ops[1], "Push8 [r6-16]");
        assert_eq!(ops[2], "Return");
        assert_eq!(asm.length(), 3);
    }

    #[test]
    fn test_plan_thunk_override() {
        let mut asm = RecordingAssembler::new(8);
        assert!(asm.plan(BinaryOp::Divide, 4).thunk.is_none());
        asm.set_thunk(BinaryOp::Divide, 0x5000);
        assert_eq!(asm.plan(BinaryOp::Divide, 4).thunk, Some(0x5000));
    }
}

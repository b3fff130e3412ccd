//! End-to-end scenarios against the recording assembler.
//!
//! Each test lowers a small program through the public façade, compiles it,
//! and checks the rendered operation stream. The recording assembler counts
//! one length unit per operation, so code promises resolve to operation
//! indices.

use std::cell::Cell;

use bumpalo::Bump;
use jitgen::{
    BinaryOp, Compiler, Promise, RecordingAssembler, TraceHandler, UnaryOp, CALL_ALIGNED,
};

fn assert_contains(ops: &[String], pattern: &str) {
    assert!(
        ops.iter().any(|op| op.contains(pattern)),
        "missing '{pattern}' in emission:\n{}",
        ops.join("\n")
    );
}

fn assert_absent(ops: &[String], pattern: &str) {
    assert!(
        !ops.iter().any(|op| op.contains(pattern)),
        "unexpected '{pattern}' in emission:\n{}",
        ops.join("\n")
    );
}

fn index_of(ops: &[String], exact: &str) -> usize {
    ops.iter()
        .position(|op| op == exact)
        .unwrap_or_else(|| panic!("missing '{exact}' in emission:\n{}", ops.join("\n")))
}

#[test]
fn constant_return() {
    let arena = Bump::new();
    let asm = RecordingAssembler::new(8);
    let log = asm.log();
    let mut c = Compiler::new(&arena, Box::new(asm));

    c.init(1, 0);
    c.start_logical_ip(0);
    let k = c.constant(42);
    c.return_(4, k);

    let length = c.compile().unwrap();
    c.check_invariants();

    let ops = log.borrow().clone();
    assert_eq!(
        ops,
        vec![
            "Push8 reg(6)",
            "Move8 reg(7), reg(6)",
            "Move4 const(42), reg(0)",
            "Move8 reg(6), reg(7)",
            "Pop8 reg(6)",
            "Return",
        ]
    );
    assert_eq!(length, 6);
}

#[test]
fn local_add() {
    let arena = Bump::new();
    let asm = RecordingAssembler::new(8);
    let log = asm.log();
    let mut c = Compiler::new(&arena, Box::new(asm));

    c.init(1, 2);
    c.start_logical_ip(0);
    let one = c.constant(1);
    c.store_local(4, one, 0).unwrap();
    let two = c.constant(2);
    c.store_local(4, two, 1).unwrap();
    let a = c.load_local(4, 0).unwrap();
    let b = c.load_local(4, 1).unwrap();
    let sum = c.add(4, a, b);
    c.push_value(4, sum);
    let result = c.pop(4);
    c.return_(4, result);

    c.compile().unwrap();
    c.check_invariants();

    let ops = log.borrow().clone();
    assert_eq!(
        ops,
        vec![
            "Push8 reg(6)",
            "Move8 reg(7), reg(6)",
            "Subtract8 const(16), reg(7)",
            "Move4 const(1), [r6-8]",
            "Move4 const(2), [r6-16]",
            "Move4 [r6-16], reg(0)",
            "Add4 [r6-8], reg(0)",
            "Move8 reg(6), reg(7)",
            "Pop8 reg(6)",
            "Return",
        ]
    );
}

#[test]
fn conditional_branch_resolves_to_mark() {
    let arena = Bump::new();
    let asm = RecordingAssembler::new(8);
    let log = asm.log();
    let promises = asm.promise_log();
    let mut c = Compiler::new(&arena, Box::new(asm));

    c.init(3, 2);
    c.start_logical_ip(0);
    let x = c.constant(7);
    c.store_local(4, x, 0).unwrap();
    let y = c.constant(9);
    c.store_local(4, y, 1).unwrap();
    let a = c.load_local(4, 0).unwrap();
    let b = c.load_local(4, 1).unwrap();
    let target = c.label();
    c.cmp(4, a, b);
    c.jl(target);

    c.start_logical_ip(1);
    let t1 = c.constant(1);
    let t2 = c.constant(2);
    c.add(4, t1, t2);

    c.start_logical_ip(2);
    c.mark(target);
    let zero = c.constant(0);
    c.return_(4, zero);

    let length = c.compile().unwrap();
    c.check_invariants();

    let ops = log.borrow().clone();
    assert_contains(&ops, "Compare4 [r6-8], [r6-16]");
    assert_contains(&ops, "JumpIfLess8 const(?)");

    let mut buffer = vec![0u8; length + c.pool_size()];
    c.write_to(&mut buffer).unwrap();

    // The branch promise resolves to the position where mark() ran: right
    // before the return sequence starts.
    let expected = index_of(&ops, "Move4 const(0), reg(0)");
    let (_, op, promise) = promises
        .borrow()
        .iter()
        .copied()
        .find(|(_, op, _)| *op == UnaryOp::JumpIfLess)
        .expect("no conditional branch recorded");
    assert_eq!(op, UnaryOp::JumpIfLess);
    assert_eq!(promise.value().unwrap() - buffer.as_ptr() as i64, expected as i64);
}

#[test]
fn call_with_three_arguments() {
    let arena = Bump::new();
    let asm = RecordingAssembler::new(8);
    let log = asm.log();
    let mut c = Compiler::new(&arena, Box::new(asm));

    c.init(1, 0);
    c.start_logical_ip(0);
    let address = c.constant(0x1000);
    let x = c.constant(10);
    let y = c.constant(20);
    let z = c.constant(30);
    let result = c.call(address, 0, None, 4, &[(8, x), (8, y), (8, z)]);
    c.return_(4, result);

    c.compile().unwrap();
    c.check_invariants();

    let ops = log.borrow().clone();
    // The third argument goes to the machine stack, the first two to the
    // argument registers; one argument word is cleaned up after the call.
    let push = index_of(&ops, "Push8 const(30)");
    let arg1 = index_of(&ops, "Move8 const(20), reg(3)");
    let arg0 = index_of(&ops, "Move8 const(10), reg(2)");
    let call = index_of(&ops, "Call8 const(4096)");
    let cleanup = index_of(&ops, "Add8 const(8), reg(7)");
    assert!(push < call && arg1 < call && arg0 < call && call < cleanup);
}

#[test]
fn spill_under_pressure() {
    let arena = Bump::new();
    let asm = RecordingAssembler::new(8);
    let log = asm.log();
    let mut c = Compiler::new(&arena, Box::new(asm));

    c.init(1, 0);
    c.start_logical_ip(0);

    // Five live intermediates fill every allocatable register.
    for i in 0..5 {
        let a = c.constant(i + 1);
        let b = c.constant(i + 10);
        let t = c.add(4, a, b);
        c.push_value(4, t);
    }
    // One more allocation has no free register left; the victim's sole copy
    // is saved to the machine stack first.
    let a = c.constant(7);
    let b = c.constant(8);
    let s = c.add(4, a, b);
    c.push_value(4, s);

    let mut acc = c.pop(4);
    for _ in 0..5 {
        let x = c.pop(4);
        acc = c.add(4, acc, x);
    }
    c.return_(4, acc);

    c.compile().unwrap();
    c.check_invariants();

    let ops = log.borrow().clone();
    // Skip the prologue and epilogue; they push and pop the frame base.
    let body = &ops[2..ops.len() - 3];
    let spills = body.iter().filter(|op| op.starts_with("Push8 reg(")).count();
    assert_eq!(spills, 5, "victims saved to the stack:\n{}", ops.join("\n"));
    let pops = body.iter().filter(|op| op.starts_with("Pop8 reg(")).count();
    assert_eq!(pops, 5);
    assert_contains(&ops, "Return");
}

#[test]
fn wide_add_on_narrow_word() {
    let arena = Bump::new();
    let asm = RecordingAssembler::new(4);
    let log = asm.log();
    let mut c = Compiler::new(&arena, Box::new(asm));

    c.init(1, 0);
    c.start_logical_ip(0);
    let a = c.constant(0x1_0000_0001);
    let b = c.constant(2);
    let sum = c.add(8, a, b);
    c.return_(8, sum);

    c.compile().unwrap();
    c.check_invariants();

    let ops = log.borrow().clone();
    // The result needs a register pair: return-low and return-high.
    assert_contains(&ops, "Move8 const(2), reg(1:0)");
    assert_contains(&ops, "Add8 const(4294967297), reg(1:0)");
}

#[test]
fn unplannable_combine_becomes_helper_call() {
    let arena = Bump::new();
    let mut asm = RecordingAssembler::new(8);
    asm.set_thunk(BinaryOp::Divide, 0x7000);
    let log = asm.log();
    let mut c = Compiler::new(&arena, Box::new(asm));

    c.init(1, 0);
    c.start_logical_ip(0);
    let a = c.constant(100);
    let b = c.constant(5);
    let q = c.div(4, a, b);
    c.return_(4, q);

    c.compile().unwrap();
    c.check_invariants();

    let ops = log.borrow().clone();
    // Both operands travel as call arguments; the helper address is called
    // through the indirect-call register.
    assert_contains(&ops, "Move8 const(100), reg(2)");
    assert_contains(&ops, "Move8 const(5), reg(3)");
    assert_contains(&ops, "Move8 const(28672), reg(0)");
    assert_contains(&ops, "Call8 reg(0)");
    assert_absent(&ops, "Divide");
}

#[test]
fn constant_compare_folds_taken_branch_to_jump() {
    let arena = Bump::new();
    let asm = RecordingAssembler::new(8);
    let log = asm.log();
    let mut c = Compiler::new(&arena, Box::new(asm));

    c.init(2, 0);
    c.start_logical_ip(0);
    let a = c.constant(1);
    let b = c.constant(2);
    let target = c.label();
    c.cmp(4, a, b);
    c.jl(target);

    c.start_logical_ip(1);
    c.mark(target);
    let zero = c.constant(0);
    c.return_(4, zero);

    c.compile().unwrap();

    let ops = log.borrow().clone();
    assert_absent(&ops, "Compare");
    assert_absent(&ops, "JumpIfLess");
    assert_contains(&ops, "Jump8");
}

#[test]
fn constant_compare_elides_untaken_branch() {
    let arena = Bump::new();
    let asm = RecordingAssembler::new(8);
    let log = asm.log();
    let mut c = Compiler::new(&arena, Box::new(asm));

    c.init(2, 0);
    c.start_logical_ip(0);
    let a = c.constant(1);
    let b = c.constant(2);
    let target = c.label();
    c.cmp(4, a, b);
    c.jg(target);

    c.start_logical_ip(1);
    c.mark(target);
    let zero = c.constant(0);
    c.return_(4, zero);

    c.compile().unwrap();

    let ops = log.borrow().clone();
    assert_absent(&ops, "Compare");
    assert_absent(&ops, "Jump");
}

#[test]
fn bounds_check_skips_low_test_for_constant_index() {
    let arena = Bump::new();
    let asm = RecordingAssembler::new(8);
    let log = asm.log();
    let mut c = Compiler::new(&arena, Box::new(asm));

    c.init(1, 0);
    c.start_logical_ip(0);
    let object = c.base();
    let index = c.constant(3);
    c.check_bounds(object, 8, index, 0x9000);
    c.return_void();

    c.compile().unwrap();

    let ops = log.borrow().clone();
    assert_contains(&ops, "Compare4 const(3), [r6+8]");
    assert_contains(&ops, "JumpIfGreaterOrEqual8 const(36864)");
    assert_absent(&ops, "JumpIfLess");
}

#[test]
fn bounds_check_tests_both_ends_for_dynamic_index() {
    let arena = Bump::new();
    let asm = RecordingAssembler::new(8);
    let log = asm.log();
    let mut c = Compiler::new(&arena, Box::new(asm));

    c.init(1, 1);
    c.start_logical_ip(0);
    let k = c.constant(5);
    c.store_local(4, k, 0).unwrap();
    let index = c.load_local(4, 0).unwrap();
    let object = c.base();
    c.check_bounds(object, 8, index, 0x9000);
    c.return_void();

    c.compile().unwrap();

    let ops = log.borrow().clone();
    // A dynamic index is forced into a register first.
    assert_contains(&ops, "Move4 [r6-8], reg(4)");
    assert_contains(&ops, "Compare4 reg(4), const(0)");
    assert_contains(&ops, "JumpIfLess8 const(36864)");
    assert_contains(&ops, "Compare4 reg(4), [r6+8]");
    assert_contains(&ops, "JumpIfGreaterOrEqual8 const(36864)");
}

#[test]
fn memory_folds_constant_index_into_displacement() {
    let arena = Bump::new();
    let asm = RecordingAssembler::new(8);
    let log = asm.log();
    let mut c = Compiler::new(&arena, Box::new(asm));

    c.init(1, 0);
    c.start_logical_ip(0);
    let base = c.base();
    let index = c.constant(2);
    let slot = c.memory(base, 16, Some(index), 4);
    let loaded = c.load(4, slot);
    c.return_(4, loaded);

    c.compile().unwrap();
    c.check_invariants();

    let ops = log.borrow().clone();
    assert_contains(&ops, "Move4 [r6+24], reg(0)");
    assert_absent(&ops, "*4]");
}

#[test]
fn local_round_trip_is_a_no_op() {
    let arena = Bump::new();
    let asm = RecordingAssembler::new(8);
    let log = asm.log();
    let mut c = Compiler::new(&arena, Box::new(asm));

    c.init(1, 1);
    c.start_logical_ip(0);
    let v = c.load_local(4, 0).unwrap();
    c.store_local(4, v, 0).unwrap();
    c.return_void();

    c.compile().unwrap();

    let ops = log.borrow().clone();
    // Prologue, epilogue, and nothing in between: the slot already holds
    // the value.
    assert_eq!(
        ops,
        vec![
            "Push8 reg(6)",
            "Move8 reg(7), reg(6)",
            "Subtract8 const(8), reg(7)",
            "Move8 reg(6), reg(7)",
            "Pop8 reg(6)",
            "Return",
        ]
    );
}

#[test]
fn aligned_call_uses_aligned_variant() {
    let arena = Bump::new();
    let asm = RecordingAssembler::new(8);
    let log = asm.log();
    let mut c = Compiler::new(&arena, Box::new(asm));

    c.init(1, 0);
    c.start_logical_ip(0);
    let address = c.constant(0x2000);
    c.call(address, CALL_ALIGNED, None, 0, &[]);
    c.return_void();

    c.compile().unwrap();

    let ops = log.borrow().clone();
    assert_contains(&ops, "AlignedCall8 const(8192)");
}

struct Tracer<'arena> {
    seen: Cell<Option<Promise<'arena>>>,
}

impl<'arena> TraceHandler<'arena> for Tracer<'arena> {
    fn handle_trace(&self, promise: Promise<'arena>) {
        self.seen.set(Some(promise));
    }
}

#[test]
fn trace_handler_receives_call_site_promise() {
    let arena = Bump::new();
    let tracer = Tracer { seen: Cell::new(None) };
    let asm = RecordingAssembler::new(8);
    let log = asm.log();
    let mut c = Compiler::new(&arena, Box::new(asm));

    c.init(1, 0);
    c.start_logical_ip(0);
    let address = c.constant(0x3000);
    c.call(address, 0, Some(&tracer), 0, &[]);
    c.return_void();

    let length = c.compile().unwrap();
    let mut buffer = vec![0u8; length + c.pool_size()];
    c.write_to(&mut buffer).unwrap();

    let ops = log.borrow().clone();
    let call = index_of(&ops, "Call8 const(12288)");
    let promise = tracer.seen.get().expect("trace handler not invoked");
    // Pinned right after the call instruction.
    assert_eq!(promise.value().unwrap() - buffer.as_ptr() as i64, call as i64 + 1);
}

#[test]
fn stack_call_reads_arguments_from_the_operand_stack() {
    let arena = Bump::new();
    let asm = RecordingAssembler::new(8);
    let log = asm.log();
    let mut c = Compiler::new(&arena, Box::new(asm));

    c.init(1, 0);
    c.start_logical_ip(0);
    let a = c.constant(11);
    let b = c.constant(22);
    c.push_value(8, a);
    c.push_value(8, b);
    let address = c.constant(0x4000);
    let r = c.stack_call(address, 0, None, 4, 2);
    c.popped(2);
    c.return_(4, r);

    c.compile().unwrap();

    let ops = log.borrow().clone();
    // The top of the argument stack is argument zero.
    assert_contains(&ops, "Move8 const(22), reg(2)");
    assert_contains(&ops, "Move8 const(11), reg(3)");
    assert_contains(&ops, "Call8 const(16384)");
}

#[test]
fn constant_pool_lands_after_the_code() {
    let arena = Bump::new();
    let asm = RecordingAssembler::new(8);
    let mut c = Compiler::new(&arena, Box::new(asm));

    c.init(1, 0);
    c.start_logical_ip(0);
    let pool_entry = c.pool_append(0x1122334455667788);
    let zero = c.constant(0);
    c.return_(4, zero);

    let length = c.compile().unwrap();
    assert_eq!(c.pool_size(), 8);

    let padded = (length + 7) / 8 * 8;
    let mut buffer = vec![0u8; padded + c.pool_size()];
    c.write_to(&mut buffer).unwrap();

    assert_eq!(pool_entry.value().unwrap(), buffer.as_ptr() as i64 + padded as i64);
    assert_eq!(
        &buffer[padded..padded + 8],
        &0x1122334455667788u64.to_le_bytes()
    );
}

#[test]
fn back_branch_creates_a_junction_and_still_compiles() {
    let arena = Bump::new();
    let asm = RecordingAssembler::new(8);
    let log = asm.log();
    let mut c = Compiler::new(&arena, Box::new(asm));

    c.init(3, 1);
    c.start_logical_ip(0);
    let init = c.constant(5);
    c.store_local(4, init, 0).unwrap();

    c.start_logical_ip(1);
    let x = c.load_local(4, 0).unwrap();
    let one = c.constant(1);
    let next = c.add(4, x, one);
    c.store_local(4, next, 0).unwrap();
    let loop_ip = c.machine_ip(1);
    let back = c.address(loop_ip);
    c.jmp(back);
    c.visit_logical_ip(1);

    c.start_logical_ip(2);
    c.return_void();

    let length = c.compile().unwrap();
    c.check_invariants();

    let ops = log.borrow().clone();
    assert_contains(&ops, "Jump8 addr(?)");

    let mut buffer = vec![0u8; length + c.pool_size()];
    c.write_to(&mut buffer).unwrap();

    // The back edge lands on ip 1's machine offset.
    let store = index_of(&ops, "Move4 const(5), [r6-8]");
    assert_eq!(
        loop_ip.value().unwrap() - buffer.as_ptr() as i64,
        store as i64 + 1
    );
}

#[test]
fn loadz_emits_zero_extension_even_between_registers() {
    let arena = Bump::new();
    let asm = RecordingAssembler::new(8);
    let log = asm.log();
    let mut c = Compiler::new(&arena, Box::new(asm));

    c.init(1, 1);
    c.start_logical_ip(0);
    let k = c.constant(300);
    c.store_local(2, k, 0).unwrap();
    let narrow = c.load_local(2, 0).unwrap();
    let wide = c.loadz(2, narrow);
    c.return_(4, wide);

    c.compile().unwrap();

    let ops = log.borrow().clone();
    assert_contains(&ops, "MoveZ2");
}

#[test]
fn negate_runs_in_place_and_result_takes_the_site() {
    let arena = Bump::new();
    let asm = RecordingAssembler::new(8);
    let log = asm.log();
    let mut c = Compiler::new(&arena, Box::new(asm));

    c.init(1, 0);
    c.start_logical_ip(0);
    let k = c.constant(17);
    let n = c.neg(4, k);
    c.return_(4, n);

    c.compile().unwrap();
    c.check_invariants();

    let ops = log.borrow().clone();
    // The operand is first materialized in a register, negated there, and
    // that register flows into the return move.
    let load = ops.iter().position(|op| op.starts_with("Move4 const(17), reg(")).unwrap();
    let neg = ops.iter().position(|op| op.starts_with("Negate4 reg(")).unwrap();
    assert!(load < neg);
}

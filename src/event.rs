//! Events: selected operations and their emission.
//!
//! The scan pass turns every front-end request into one or more events,
//! threading input reads onto the consumed values. The compile pass walks
//! the event chain in order; each event resolves its sources, emits zero or
//! more assembler operations, and advances the read cursors of its inputs.
//!
//! Construction is where operand constraints are fixed: the assembler's
//! `plan` answer becomes the read constraints of the operands, or turns the
//! whole operation into a runtime helper call when the target cannot
//! express it directly.

use std::cmp::Ordering;

use crate::assembler::{AsmOperand, BinaryOp, NullaryOp, OperandKind, UnaryOp, ANY_REGISTER};
use crate::context::{Context, EventId, LocalSnapshot, SiteId, StackId, ValueId};
use crate::promise::{Promise, PromiseNode};
use crate::site::SiteKind;
use crate::value::{any_read, fixed_register_read, target_read, ReadConstraint, ReadKind};

/// Emit the call-site variant that keeps the return address aligned.
pub const CALL_ALIGNED: u32 = 1 << 0;
/// The callee never returns; skip post-call stack cleanup.
pub const CALL_NO_RETURN: u32 = 1 << 1;
/// The call target is reached through a register, not an immediate.
pub const CALL_INDIRECT: u32 = 1 << 2;

/// Callback receiving a code promise pinned to a call instruction, so the
/// runtime can record a stack map for the site.
pub trait TraceHandler<'arena> {
    fn handle_trace(&self, promise: Promise<'arena>);
}

/// Payload of one scheduled operation.
#[derive(Clone, Copy)]
pub(crate) enum EventKind<'arena> {
    Move {
        op: BinaryOp,
        size: u32,
        src: ValueId,
        dst: ValueId,
    },
    Combine {
        op: BinaryOp,
        size: u32,
        first: ValueId,
        second: ValueId,
        result: ValueId,
    },
    Translate {
        op: UnaryOp,
        size: u32,
        value: ValueId,
        result: ValueId,
    },
    Compare {
        size: u32,
        first: ValueId,
        second: ValueId,
    },
    Branch {
        op: UnaryOp,
        address: ValueId,
    },
    Call {
        address: ValueId,
        flags: u32,
        trace: Option<&'arena dyn TraceHandler<'arena>>,
        result: ValueId,
        result_size: u32,
        argument_footprint: u32,
    },
    Return {
        size: u32,
        value: Option<ValueId>,
    },
    Memory {
        base: ValueId,
        displacement: i32,
        index: Option<ValueId>,
        scale: u8,
        result: ValueId,
    },
    BoundsCheck {
        object: ValueId,
        length_offset: i32,
        index: ValueId,
        handler: i64,
    },
    StackSync {
        locals: &'arena [LocalSnapshot],
    },
    Push {
        entry: StackId,
        active: bool,
    },
    Pop {
        count: u32,
        ignore: bool,
    },
}

impl<'arena> Context<'arena> {
    // ==================================================================
    // Scan pass: event construction
    // ==================================================================

    pub fn append_move(&mut self, op: BinaryOp, size: u32, src: ValueId, dst: ValueId) {
        log::trace!("append move {:?}", op);
        let plan = self.asm.plan(op, size);
        assert!(plan.thunk.is_none(), "data movement planned as a helper call");

        let e = self.new_event(EventKind::Move { op, size, src, dst });
        let kind = ReadKind::Target {
            value: Some(dst),
            constraint: ReadConstraint {
                type_mask: plan.src.type_mask,
                register_mask: plan.src.register_mask,
                frame_index: None,
            },
        };
        self.insert_read(e, None, src, size, kind);
    }

    pub fn append_combine(
        &mut self,
        op: BinaryOp,
        size: u32,
        first: ValueId,
        second: ValueId,
        result: ValueId,
    ) {
        let plan = self.asm.plan(op, size);
        if let Some(thunk) = plan.thunk {
            log::trace!("append combine {:?} via helper {:#x}", op, thunk);
            let old_stack = self.cur_stack();
            self.push_value_internal(size, second);
            self.push_value_internal(size, first);
            let argument_stack = self.cur_stack();
            self.set_stack(old_stack);

            let promise = self.resolved_promise(thunk);
            let site = self.constant_site(promise);
            let address = self.new_value(Some(site), None);
            self.append_call(address, CALL_INDIRECT, None, result, size, argument_stack, 2, None);
            return;
        }

        log::trace!("append combine {:?}", op);
        // Shift counts are always a 4-byte quantity.
        let first_size = match op {
            BinaryOp::ShiftLeft | BinaryOp::ShiftRight | BinaryOp::UnsignedShiftRight => 4,
            _ => size,
        };
        let e = self.new_event(EventKind::Combine { op, size, first, second, result });
        self.insert_read(
            e,
            None,
            first,
            first_size,
            target_read(None, plan.src.type_mask, plan.src.register_mask),
        );
        self.insert_read(
            e,
            None,
            second,
            size,
            ReadKind::Target {
                value: Some(result),
                constraint: ReadConstraint {
                    type_mask: plan.dst.type_mask,
                    register_mask: plan.dst.register_mask,
                    frame_index: None,
                },
            },
        );
    }

    pub fn append_translate(&mut self, op: UnaryOp, size: u32, value: ValueId, result: ValueId) {
        log::trace!("append translate {:?}", op);
        let plan = self.asm.plan_unary(op, size);
        assert!(plan.thunk.is_none(), "unary translation planned as a helper call");

        let e = self.new_event(EventKind::Translate { op, size, value, result });
        let kind = ReadKind::Target {
            value: Some(result),
            constraint: ReadConstraint {
                type_mask: plan.operand.type_mask,
                register_mask: plan.operand.register_mask,
                frame_index: None,
            },
        };
        self.insert_read(e, None, value, size, kind);
    }

    pub fn append_compare(&mut self, size: u32, first: ValueId, second: ValueId) {
        log::trace!("append compare");
        let e = self.new_event(EventKind::Compare { size, first, second });
        self.insert_read(e, None, first, size, any_read());
        self.insert_read(e, None, second, size, any_read());
    }

    pub fn append_branch(&mut self, op: UnaryOp, address: ValueId) {
        self.append_stack_sync();
        log::trace!("append branch {:?}", op);
        let e = self.new_event(EventKind::Branch { op, address });
        let word = self.word();
        self.insert_read(e, None, address, word, any_read());
        self.reset_stack();
    }

    #[allow(clippy::too_many_arguments)]
    pub fn append_call(
        &mut self,
        address: ValueId,
        flags: u32,
        trace: Option<&'arena dyn TraceHandler<'arena>>,
        result: ValueId,
        result_size: u32,
        argument_stack: Option<StackId>,
        argument_count: u32,
        stack_override: Option<Option<StackId>>,
    ) {
        log::trace!("append call");
        let e = self.new_event(EventKind::Call {
            address,
            flags,
            trace,
            result,
            result_size,
            argument_footprint: 0,
        });
        if let Some(below) = stack_override {
            self.event_mut(e).stack = below;
        }

        let word = self.word();
        let mut footprint = 0u32;
        let mut index = 0usize;
        let mut cur = argument_stack;
        for _ in 0..argument_count {
            let s = cur.expect("argument stack shorter than argument count");
            let node = *self.node(s);
            if index < self.asm.argument_register_count() {
                let low = self.asm.argument_register(index);
                let high = if node.size == 2 && index + 1 < self.asm.argument_register_count() {
                    Some(self.asm.argument_register(index + 1))
                } else {
                    None
                };
                self.insert_read(e, None, node.value, node.size * word, fixed_register_read(low, high));
            } else {
                let pe = node.push_event.expect("stack argument without a push event");
                if let EventKind::Push { active, .. } = &mut self.event_mut(pe).kind {
                    *active = true;
                }
                footprint += node.size;
                self.insert_read(e, None, node.value, node.size * word, any_read());
            }
            index += node.size as usize;
            cur = node.next;
        }

        // Every caller-stack slot is an implicit input: it must survive the
        // call in its stack slot.
        let mut cur = self.event(e).stack;
        while let Some(s) = cur {
            let node = *self.node(s);
            self.insert_read(e, None, node.value, node.size * word, any_read());
            cur = node.next;
        }

        let kind = if flags & CALL_INDIRECT != 0 {
            fixed_register_read(self.asm.return_low(), None)
        } else {
            any_read()
        };
        self.insert_read(e, None, address, word, kind);

        if let EventKind::Call { argument_footprint, .. } = &mut self.event_mut(e).kind {
            *argument_footprint = footprint;
        }
    }

    pub fn append_return(&mut self, size: u32, value: Option<ValueId>) {
        log::trace!("append return");
        let e = self.new_event(EventKind::Return { size, value });
        if let Some(v) = value {
            let word = self.word();
            let high = if size > word { Some(self.asm.return_high()) } else { None };
            let low = self.asm.return_low();
            self.insert_read(e, None, v, size, fixed_register_read(low, high));
        }
    }

    pub fn append_memory(
        &mut self,
        base: ValueId,
        displacement: i32,
        index: Option<ValueId>,
        scale: u8,
        result: ValueId,
    ) {
        log::trace!("append memory");
        let mut displacement = displacement;
        let mut index = index;
        if let Some(i) = index {
            if let Some(v) = self.constant_value_of(i) {
                displacement += v as i32 * scale as i32;
                index = None;
            }
        }

        let e = self.new_event(EventKind::Memory { base, displacement, index, scale, result });
        let word = self.word();
        let register_only = target_read(None, OperandKind::Register.bit(), ANY_REGISTER);
        self.insert_read(e, None, base, word, register_only);
        if let Some(i) = index {
            self.insert_read(e, None, i, word, register_only);
        }
    }

    pub fn append_bounds_check(
        &mut self,
        object: ValueId,
        length_offset: i32,
        index: ValueId,
        handler: i64,
    ) {
        log::trace!("append bounds check");
        let e = self.new_event(EventKind::BoundsCheck { object, length_offset, index, handler });
        let word = self.word();
        let index_kind = target_read(
            None,
            OperandKind::Constant.bit() | OperandKind::Register.bit(),
            ANY_REGISTER,
        );
        self.insert_read(e, None, index, 4, index_kind);
        let register_only = target_read(None, OperandKind::Register.bit(), ANY_REGISTER);
        self.insert_read(e, None, object, word, register_only);
    }

    pub fn append_stack_sync(&mut self) {
        log::trace!("append stack sync");
        let locals = self.local_snapshot();
        let e = self.new_event(EventKind::StackSync { locals });
        let word = self.word();
        let mut cur = self.event(e).stack;
        while let Some(s) = cur {
            let node = *self.node(s);
            if let Some(pe) = node.push_event {
                if let EventKind::Push { active, .. } = &mut self.event_mut(pe).kind {
                    *active = true;
                }
            }
            self.insert_read(e, None, node.value, node.size * word, any_read());
            cur = node.next;
        }
    }

    pub fn append_push_for(&mut self, entry: StackId) {
        log::trace!("append push");
        assert!(self.node(entry).push_event.is_none(), "entry already has a push event");
        let e = self.new_event(EventKind::Push { entry, active: false });
        self.node_mut(entry).push_event = Some(e);
        let node = *self.node(entry);
        let size = node.size * self.word();
        self.insert_read(e, None, node.value, size, any_read());
    }

    pub fn append_pop(&mut self, count: u32, ignore: bool) {
        log::trace!("append pop");
        self.new_event(EventKind::Pop { count, ignore });
    }

    /// Push a value onto the abstract operand stack with a lazy push event.
    pub fn push_value_internal(&mut self, size: u32, v: ValueId) {
        let word = self.word();
        let words = (size + word - 1) / word;
        assert!(words > 0, "pushing an empty value");
        let next = self.cur_stack();
        let id = self.new_stack_node(v, words, next);
        self.set_stack(Some(id));
        self.append_push_for(id);
    }

    pub fn pop_value_internal(&mut self, size: u32) -> ValueId {
        let s = self.cur_stack().expect("pop from an empty operand stack");
        let node = *self.node(s);
        let word = self.word();
        assert_eq!((size + word - 1) / word, node.size, "pop size does not match the top entry");
        self.append_pop(node.size, false);
        self.set_stack(node.next);
        node.value
    }

    /// Resolved constant materializing `v`, if any.
    pub fn constant_value_of(&self, v: ValueId) -> Option<i64> {
        let mut cur = self.value(v).sites;
        while let Some(s) = cur {
            if let SiteKind::Constant { value: Some(p) } = self.site(s).kind {
                if p.resolved() {
                    return Some(p.expect_value());
                }
            }
            cur = self.site(s).next;
        }
        None
    }

    pub fn local_snapshot(&mut self) -> &'arena [LocalSnapshot] {
        let snapshot: Vec<LocalSnapshot> = self
            .locals
            .iter()
            .enumerate()
            .filter_map(|(i, b)| {
                b.map(|binding| LocalSnapshot {
                    index: i as u32,
                    value: binding.value,
                    size: binding.size,
                })
            })
            .collect();
        self.arena.alloc_slice_copy(&snapshot)
    }

    // ==================================================================
    // Compile pass: event emission
    // ==================================================================

    pub fn compile_event(&mut self, e: EventId) {
        let kind = self.event(e).kind;
        match kind {
            EventKind::Move { op, size, src, dst } => self.compile_move(e, op, size, src, dst),
            EventKind::Combine { op, size, first, second, result } => {
                self.compile_combine(e, op, size, first, second, result)
            }
            EventKind::Translate { op, size, value, result } => {
                self.compile_translate(e, op, size, value, result)
            }
            EventKind::Compare { size, first, second } => {
                self.compile_compare(size, first, second)
            }
            EventKind::Branch { op, address } => self.compile_branch(op, address),
            EventKind::Call { address, flags, trace, result, result_size, argument_footprint } => {
                self.compile_call(e, address, flags, trace, result, result_size, argument_footprint)
            }
            EventKind::Return { value, .. } => self.compile_return(value),
            EventKind::Memory { base, displacement, index, scale, result } => {
                self.compile_memory(base, displacement, index, scale, result)
            }
            EventKind::BoundsCheck { object, length_offset, index, handler } => {
                self.compile_bounds_check(object, length_offset, index, handler)
            }
            EventKind::StackSync { locals } => self.compile_stack_sync(e, locals),
            EventKind::Push { entry, active } => {
                log::trace!("compile push, active {}", active);
                if active {
                    self.push_now(Some(entry));
                }
                let v = self.node(entry).value;
                self.next_read(v);
            }
            EventKind::Pop { count, ignore } => {
                log::trace!("compile pop");
                let stack = self.event(e).stack;
                self.pop_now(stack, count, ignore);
            }
        }
    }

    fn compile_move(&mut self, e: EventId, op: BinaryOp, size: u32, src: ValueId, dst: ValueId) {
        log::trace!("compile move {:?}", op);
        let src_source = self.value(src).source.expect("move source unresolved");

        // A word-sized move feeding straight into an active push can skip
        // the intermediate location; the push reads the source directly.
        let mut skip = false;
        if op == BinaryOp::Move && size >= self.word() {
            if let Some(dr) = self.value(dst).reads {
                if let Some(de) = self.read(dr).event {
                    if self.event(e).next == Some(de) {
                        if let EventKind::Push { active: true, .. } = self.event(de).kind {
                            skip = true;
                        }
                    }
                }
            }
        }

        let (target, cost) = if skip {
            (src_source, 0)
        } else {
            self.site_freeze(src_source);
            let target = self.target_or_register(size, dst);
            self.site_thaw(src_source);
            (target, self.copy_cost(src_source, Some(target)))
        };

        self.next_read(src);

        if self.value(dst).reads.is_some() {
            let stack = self.event(e).stack;
            self.add_site(stack, size, dst, target);
        }

        if cost > 0 || op != BinaryOp::Move {
            self.apply2(op, size, src_source, target);
        }

        if self.value(dst).reads.is_none() {
            self.remove_site(dst, target);
        }
    }

    fn compile_combine(
        &mut self,
        e: EventId,
        op: BinaryOp,
        size: u32,
        first: ValueId,
        second: ValueId,
        result: ValueId,
    ) {
        log::trace!("compile combine {:?}", op);
        let first_source = self.value(first).source.expect("combine operand unresolved");
        let second_source = self.value(second).source.expect("combine operand unresolved");

        self.site_freeze(first_source);
        self.site_freeze(second_source);
        let stack = self.event(e).stack;
        self.maybe_preserve(stack, size, second, second_source);
        self.site_thaw(second_source);
        self.site_thaw(first_source);

        self.apply2(op, size, first_source, second_source);

        self.next_read(first);
        self.next_read(second);

        // The two-operand form leaves the result where the second operand
        // was; hand the site over.
        self.remove_site(second, second_source);
        if self.value(result).reads.is_some() {
            self.add_site(None, size, result, second_source);
        }
    }

    fn compile_translate(
        &mut self,
        e: EventId,
        op: UnaryOp,
        size: u32,
        value: ValueId,
        result: ValueId,
    ) {
        log::trace!("compile translate {:?}", op);
        let source = self.value(value).source.expect("translate operand unresolved");

        self.site_freeze(source);
        let stack = self.event(e).stack;
        self.maybe_preserve(stack, size, value, source);
        self.site_thaw(source);

        self.apply1(op, size, source);

        self.next_read(value);

        self.remove_site(value, source);
        if self.value(result).reads.is_some() {
            self.add_site(None, size, result, source);
        }
    }

    /// Keep a value alive across an operation that destroys its only copy.
    fn maybe_preserve(&mut self, stack: Option<StackId>, size: u32, v: ValueId, site: SiteId) {
        let head = self.value(v).reads.expect("preserving a value with no reads");
        if self.read(head).next.is_none() {
            return;
        }
        let first = self.value(v).sites.expect("preserving a value with no sites");
        if self.site(first).next.is_some() {
            return;
        }
        let fresh = self.free_register_site(size, ANY_REGISTER);
        self.add_site(stack, size, v, fresh);
        self.apply2(BinaryOp::Move, size, site, fresh);
    }

    fn compile_compare(&mut self, size: u32, first: ValueId, second: ValueId) {
        log::trace!("compile compare");
        let first_source = self.value(first).source.expect("compare operand unresolved");
        let second_source = self.value(second).source.expect("compare operand unresolved");

        // Two resolved constants fold at compile time; the following branch
        // consumes the recorded ordering instead of condition flags.
        self.constant_compare = match (self.site(first_source).kind, self.site(second_source).kind) {
            (
                SiteKind::Constant { value: Some(a) },
                SiteKind::Constant { value: Some(b) },
            ) if a.resolved() && b.resolved() => {
                let a = a.expect_value();
                let b = b.expect_value();
                Some(if size == 4 {
                    (a as i32).cmp(&(b as i32))
                } else {
                    a.cmp(&b)
                })
            }
            _ => None,
        };

        if self.constant_compare.is_none() {
            self.apply2(BinaryOp::Compare, size, first_source, second_source);
        }

        self.next_read(first);
        self.next_read(second);
    }

    fn compile_branch(&mut self, op: UnaryOp, address: ValueId) {
        log::trace!("compile branch {:?}", op);
        let source = self.value(address).source.expect("branch target unresolved");
        let word = self.word();

        if op != UnaryOp::Jump {
            if let Some(ordering) = self.constant_compare.take() {
                if branch_taken(op, ordering) {
                    self.apply1(UnaryOp::Jump, word, source);
                }
                self.next_read(address);
                return;
            }
        }

        self.apply1(op, word, source);
        self.next_read(address);
    }

    #[allow(clippy::too_many_arguments)]
    fn compile_call(
        &mut self,
        e: EventId,
        address: ValueId,
        flags: u32,
        trace: Option<&'arena dyn TraceHandler<'arena>>,
        result: ValueId,
        result_size: u32,
        argument_footprint: u32,
    ) {
        log::trace!("compile call");
        let stack = self.event(e).stack;
        self.push_now(stack);

        let op = if flags & CALL_ALIGNED != 0 { UnaryOp::AlignedCall } else { UnaryOp::Call };
        let source = self.value(address).source.expect("call target unresolved");
        let word = self.word();
        self.apply1(op, word, source);

        // The callee may clobber everything; the caller stack survives only
        // in its stack slots.
        let mut cur = stack;
        while let Some(s) = cur {
            let v = self.node(s).value;
            self.clear_sites(v);
            cur = self.node(s).next;
        }
        let mut cur = stack;
        while let Some(s) = cur {
            let node = *self.node(s);
            if let Some(ps) = node.push_site {
                self.add_site(None, node.size * word, node.value, ps);
            }
            cur = node.next;
        }

        let mut r = self.event(e).reads;
        while let Some(rd) = r {
            let v = self.read(rd).value;
            self.next_read(v);
            r = self.read(rd).event_next;
        }

        if result_size > 0 && self.value(result).reads.is_some() {
            let low = self.asm.return_low();
            let high = if result_size > word { Some(self.asm.return_high()) } else { None };
            let site = self.register_site(low, high);
            self.add_site(None, result_size, result, site);
        }

        if let Some(handler) = trace {
            let node = &*self.arena.alloc(PromiseNode::Code {
                base: self.code,
                offset: std::cell::Cell::new(self.asm.length() as i64),
                next: std::cell::Cell::new(None),
            });
            handler.handle_trace(Promise::new(node));
        }

        if argument_footprint > 0 && flags & CALL_NO_RETURN == 0 {
            self.emit_stack_adjust(argument_footprint);
        }
    }

    fn compile_return(&mut self, value: Option<ValueId>) {
        log::trace!("compile return");
        if let Some(v) = value {
            self.next_read(v);
        }
        let word = self.word();
        let base = AsmOperand::Register { low: self.asm.base(), high: None };
        let sp = AsmOperand::Register { low: self.asm.stack(), high: None };
        self.apply2_raw(BinaryOp::Move, word, base, sp);
        self.apply1_raw(UnaryOp::Pop, word, base);
        self.apply0_raw(NullaryOp::Return);
    }

    fn compile_memory(
        &mut self,
        base: ValueId,
        displacement: i32,
        index: Option<ValueId>,
        scale: u8,
        result: ValueId,
    ) {
        log::trace!("compile memory");
        let base_source = self.value(base).source.expect("memory base unresolved");
        let base_register = match self.site(base_source).kind {
            SiteKind::Register { low, .. } => low,
            _ => panic!("memory base not materialized in a register"),
        };
        let index_register = index.map(|i| {
            let s = self.value(i).source.expect("memory index unresolved");
            match self.site(s).kind {
                SiteKind::Register { low, .. } => low,
                _ => panic!("memory index not materialized in a register"),
            }
        });

        self.next_read(base);
        if let Some(i) = index {
            self.next_read(i);
            if self.word() == 8 {
                // The index register holds a 32-bit quantity.
                let s = self.value(i).source.unwrap();
                self.apply2(BinaryOp::Move4To8, 8, s, s);
            }
        }

        let site = self.memory_site(base_register, displacement, index_register, scale);
        self.value_mut(result).target = Some(site);
        self.add_site(None, 0, result, site);
    }

    fn compile_bounds_check(
        &mut self,
        object: ValueId,
        length_offset: i32,
        index: ValueId,
        handler: i64,
    ) {
        log::trace!("compile bounds check");
        let word = self.word();
        let index_source = self.value(index).source.expect("bounds index unresolved");
        let object_source = self.value(object).source.expect("bounds object unresolved");
        let object_register = match self.site(object_source).kind {
            SiteKind::Register { low, .. } => low,
            _ => panic!("bounds-checked object not in a register"),
        };

        let handler_site = {
            let p = self.resolved_promise(handler);
            self.constant_site(p)
        };

        let known_non_negative = matches!(
            self.site(index_source).kind,
            SiteKind::Constant { value: Some(p) } if p.resolved() && p.expect_value() >= 0
        );
        if !known_non_negative {
            let zero = {
                let p = self.resolved_promise(0);
                self.constant_site(p)
            };
            self.apply2(BinaryOp::Compare, 4, index_source, zero);
            self.apply1(UnaryOp::JumpIfLess, word, handler_site);
        }

        let length_site = self.memory_site(object_register, length_offset, None, 1);
        self.apply2(BinaryOp::Compare, 4, index_source, length_site);
        self.apply1(UnaryOp::JumpIfGreaterOrEqual, word, handler_site);

        self.next_read(index);
        self.next_read(object);
    }

    fn compile_stack_sync(&mut self, e: EventId, locals: &'arena [LocalSnapshot]) {
        log::trace!("compile stack sync");
        let stack = self.event(e).stack;
        let word = self.word();

        // Strip per-path residency first, then re-attach the canonical
        // sites: stack slots for operand-stack entries, frame slots for
        // live locals.
        let mut cur = stack;
        while let Some(s) = cur {
            let v = self.node(s).value;
            self.clear_sites(v);
            cur = self.node(s).next;
        }
        for l in locals {
            if self.value(l.value).reads.is_some() {
                self.clear_sites(l.value);
            }
        }

        let mut cur = stack;
        while let Some(s) = cur {
            let node = *self.node(s);
            if let Some(ps) = node.push_site {
                self.add_site(None, node.size * word, node.value, ps);
            }
            cur = node.next;
        }
        for l in locals {
            if self.value(l.value).reads.is_some() {
                let fs = self.frame_site(l.index);
                self.add_site(None, l.size, l.value, fs);
            }
        }

        let mut r = self.event(e).reads;
        while let Some(rd) = r {
            let v = self.read(rd).value;
            self.next_read(v);
            r = self.read(rd).event_next;
        }
    }
}

fn branch_taken(op: UnaryOp, ordering: Ordering) -> bool {
    match op {
        UnaryOp::JumpIfLess => ordering == Ordering::Less,
        UnaryOp::JumpIfGreater => ordering == Ordering::Greater,
        UnaryOp::JumpIfLessOrEqual => ordering != Ordering::Greater,
        UnaryOp::JumpIfGreaterOrEqual => ordering != Ordering::Less,
        UnaryOp::JumpIfEqual => ordering == Ordering::Equal,
        UnaryOp::JumpIfNotEqual => ordering != Ordering::Equal,
        _ => unreachable!("not a conditional branch"),
    }
}

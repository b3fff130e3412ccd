//! The public façade driven by the front-end.
//!
//! A front-end lowers its source one instruction at a time: it announces
//! instruction boundaries (`start_logical_ip`), branch targets
//! (`visit_logical_ip`), manipulates the abstract operand stack and locals,
//! and requests operations. All of that is the scan pass; nothing is
//! emitted until `compile`, which splices sync events into junction
//! predecessors, then walks the event chains emitting machine operations
//! and resolving forward references. `write_to` finally copies the code and
//! appends the constant pool.

use bumpalo::Bump;

use crate::assembler::{pad, Assembler, AsmOperand, BinaryOp, OperandKind, UnaryOp};
use crate::context::{Context, LocalBinding, Operand, Pass};
use crate::error::{CompileError, CompileResult};
use crate::event::{EventKind, TraceHandler};
use crate::promise::Promise;
use crate::site::SiteKind;
use crate::value::{ReadConstraint, ReadKind};

pub struct Compiler<'arena> {
    cx: Context<'arena>,
}

impl<'arena> Compiler<'arena> {
    pub fn new(arena: &'arena Bump, asm: Box<dyn Assembler<'arena> + 'arena>) -> Self {
        Self { cx: Context::new(arena, asm) }
    }

    /// Size the logical-code array and the locals area of the frame. Must be
    /// called before any instruction is appended.
    pub fn init(&mut self, logical_code_length: usize, local_footprint: u32) {
        self.cx.logical = vec![Default::default(); logical_code_length];
        self.cx.local_footprint = local_footprint;
        self.cx.locals = vec![None; local_footprint as usize];
        let offsets = &*self
            .cx
            .arena
            .alloc_slice_fill_with(logical_code_length, |_| std::cell::Cell::new(-1i64));
        self.cx.code.offsets.set(Some(offsets));
    }

    // ==================================================================
    // State control
    // ==================================================================

    pub fn push_state(&mut self) {
        self.cx.push_state();
    }

    pub fn pop_state(&mut self) {
        self.cx.pop_state();
    }

    pub fn save_stack(&mut self) {
        self.cx.save_stack();
    }

    pub fn reset_stack(&mut self) {
        self.cx.reset_stack();
    }

    fn visit(&mut self, ip: u32) {
        assert!((ip as usize) < self.cx.logical.len(), "logical ip {} out of range", ip);
        if let Some(current) = self.cx.logical_ip {
            if !self.cx.stack_reset {
                let li = &mut self.cx.logical[ip as usize];
                assert!(
                    li.immediate_predecessor.is_none(),
                    "logical ip {} already has a fall-through predecessor",
                    ip
                );
                li.immediate_predecessor = Some(current);
            }
        }
    }

    /// Note a branch edge to `ip`. An ip reached both by fall-through and a
    /// branch becomes a junction and gets its predecessors synchronized.
    pub fn visit_logical_ip(&mut self, ip: u32) {
        self.visit(ip);
        self.cx.stack_reset = false;
        if self.cx.logical[ip as usize].immediate_predecessor.is_some() {
            self.cx.junctions.push(ip);
        }
    }

    pub fn start_logical_ip(&mut self, ip: u32) {
        log::trace!(" -- ip: {}", ip);
        self.visit(ip);
        self.cx.save_stack();
        self.cx.logical_ip = Some(ip);
    }

    /// Promise for the machine offset of a logical instruction.
    pub fn machine_ip(&self, ip: u32) -> Promise<'arena> {
        self.cx.ip_promise(ip)
    }

    // ==================================================================
    // Constant pool
    // ==================================================================

    pub fn pool_append(&mut self, value: i64) -> Promise<'arena> {
        let p = self.cx.resolved_promise(value);
        self.pool_append_promise(p)
    }

    pub fn pool_append_promise(&mut self, value: Promise<'arena>) -> Promise<'arena> {
        let key = self.cx.pool.len() as u32;
        let promise = self.cx.pool_promise(key);
        self.cx.pool.push(value);
        promise
    }

    // ==================================================================
    // Operand creation
    // ==================================================================

    pub fn constant(&mut self, value: i64) -> Operand {
        let p = self.cx.resolved_promise(value);
        self.promise_constant(p)
    }

    pub fn promise_constant(&mut self, value: Promise<'arena>) -> Operand {
        let site = self.cx.constant_site(value);
        Operand(self.cx.new_value(Some(site), None))
    }

    pub fn address(&mut self, address: Promise<'arena>) -> Operand {
        let site = self.cx.address_site(address);
        Operand(self.cx.new_value(Some(site), None))
    }

    pub fn memory(
        &mut self,
        base: Operand,
        displacement: i32,
        index: Option<Operand>,
        scale: u8,
    ) -> Operand {
        let result = self.cx.new_value(None, None);
        self.cx.append_memory(base.0, displacement, index.map(|o| o.0), scale, result);
        Operand(result)
    }

    pub fn stack(&mut self) -> Operand {
        let r = self.cx.asm.stack();
        self.pinned_register(r)
    }

    pub fn base(&mut self) -> Operand {
        let r = self.cx.asm.base();
        self.pinned_register(r)
    }

    pub fn thread(&mut self) -> Operand {
        let r = self.cx.asm.thread();
        self.pinned_register(r)
    }

    fn pinned_register(&mut self, r: u8) -> Operand {
        let site = self.cx.register_site(r, None);
        Operand(self.cx.new_value(Some(site), Some(site)))
    }

    pub fn label(&mut self) -> Operand {
        let site = self.cx.unmarked_label_site();
        Operand(self.cx.new_value(Some(site), None))
    }

    /// Bind `label` to the current code position.
    pub fn mark(&mut self, label: Operand) {
        self.cx.append_stack_sync();
        self.cx.reset_stack();

        let ip = self.cx.logical_ip.expect("mark outside an instruction") as usize;
        let last = self.cx.logical[ip].last_event.expect("mark with no event to pin to");
        let promise = self.cx.add_code_promise(last);

        let mut cur = self.cx.value(label.0).sites;
        while let Some(s) = cur {
            if matches!(self.cx.site(s).kind, SiteKind::Constant { .. }) {
                self.cx.site_mut(s).kind = SiteKind::Constant { value: Some(promise) };
                return;
            }
            cur = self.cx.site(s).next;
        }
        panic!("mark target is not a label");
    }

    // ==================================================================
    // Operand stack
    // ==================================================================

    /// Reserve an abstract slot without a value to push.
    pub fn push(&mut self, size: u32) {
        let word = self.cx.word();
        let words = (size + word - 1) / word;
        assert!(words > 0, "pushing an empty slot");
        let value = self.cx.new_value(None, None);
        let next = self.cx.cur_stack();
        let id = self.cx.new_stack_node(value, words, next);
        self.cx.set_stack(Some(id));
    }

    pub fn push_value(&mut self, size: u32, value: Operand) {
        self.cx.push_value_internal(size, value.0);
    }

    pub fn pop(&mut self, size: u32) -> Operand {
        Operand(self.cx.pop_value_internal(size))
    }

    /// Note `count` single-word entries that the caller has already placed
    /// on the concrete stack.
    pub fn pushed(&mut self, count: u32) {
        let word = self.cx.word();
        for _ in 0..count {
            let value = self.cx.new_value(None, None);
            let next = self.cx.cur_stack();
            let id = self.cx.new_stack_node(value, 1, next);
            let index = self.cx.node(id).index;
            let site = self.cx.stack_slot_site(index);
            self.cx.add_site(None, word, value, site);
            let node = self.cx.node_mut(id);
            node.pushed = true;
            node.push_site = Some(site);
            self.cx.set_stack(Some(id));
        }
    }

    /// Discard `count` words from the abstract and concrete stacks.
    pub fn popped(&mut self, count: u32) {
        self.cx.append_pop(count, true);
        let mut remaining = count;
        while remaining > 0 {
            let s = self.cx.cur_stack().expect("popped past the stack bottom");
            let node = *self.cx.node(s);
            self.cx.set_stack(node.next);
            remaining = remaining.saturating_sub(node.size);
        }
    }

    pub fn peek(&self, size: u32, index: u32) -> Operand {
        let word = self.cx.word();
        let mut cur = self.cx.cur_stack();
        let mut remaining = index;
        while remaining > 0 {
            let node = self.cx.node(cur.expect("peek past the stack bottom"));
            remaining = remaining.saturating_sub(node.size);
            cur = node.next;
        }
        let node = self.cx.node(cur.expect("peek past the stack bottom"));
        assert_eq!(node.size, (size + word - 1) / word, "peek size mismatch");
        Operand(node.value)
    }

    pub fn top(&self) -> Operand {
        let s = self.cx.cur_stack().expect("top of an empty stack");
        Operand(self.cx.node(s).value)
    }

    // ==================================================================
    // Locals
    // ==================================================================

    pub fn store_local(&mut self, size: u32, src: Operand, index: u32) -> CompileResult<()> {
        if index >= self.cx.local_footprint {
            return Err(CompileError::LocalOutOfRange { index, footprint: self.cx.local_footprint });
        }
        let site = self.cx.frame_site(index);
        let dst = self.cx.new_value(None, Some(site));
        self.cx.append_move(BinaryOp::Move, size, src.0, dst);
        self.cx.locals[index as usize] = Some(LocalBinding { value: dst, size });
        Ok(())
    }

    pub fn load_local(&mut self, size: u32, index: u32) -> CompileResult<Operand> {
        if index >= self.cx.local_footprint {
            return Err(CompileError::LocalOutOfRange { index, footprint: self.cx.local_footprint });
        }
        if let Some(binding) = self.cx.locals[index as usize] {
            return Ok(Operand(binding.value));
        }
        let site = self.cx.frame_site(index);
        let value = self.cx.new_value(Some(site), None);
        self.cx.locals[index as usize] = Some(LocalBinding { value, size });
        Ok(Operand(value))
    }

    // ==================================================================
    // Operations
    // ==================================================================

    fn combine(&mut self, op: BinaryOp, size: u32, a: Operand, b: Operand) -> Operand {
        let result = self.cx.new_value(None, None);
        self.cx.append_combine(op, size, a.0, b.0, result);
        Operand(result)
    }

    pub fn add(&mut self, size: u32, a: Operand, b: Operand) -> Operand {
        self.combine(BinaryOp::Add, size, a, b)
    }

    pub fn sub(&mut self, size: u32, a: Operand, b: Operand) -> Operand {
        self.combine(BinaryOp::Subtract, size, a, b)
    }

    pub fn mul(&mut self, size: u32, a: Operand, b: Operand) -> Operand {
        self.combine(BinaryOp::Multiply, size, a, b)
    }

    pub fn div(&mut self, size: u32, a: Operand, b: Operand) -> Operand {
        self.combine(BinaryOp::Divide, size, a, b)
    }

    pub fn rem(&mut self, size: u32, a: Operand, b: Operand) -> Operand {
        self.combine(BinaryOp::Remainder, size, a, b)
    }

    pub fn shl(&mut self, size: u32, a: Operand, b: Operand) -> Operand {
        self.combine(BinaryOp::ShiftLeft, size, a, b)
    }

    pub fn shr(&mut self, size: u32, a: Operand, b: Operand) -> Operand {
        self.combine(BinaryOp::ShiftRight, size, a, b)
    }

    pub fn ushr(&mut self, size: u32, a: Operand, b: Operand) -> Operand {
        self.combine(BinaryOp::UnsignedShiftRight, size, a, b)
    }

    pub fn and_(&mut self, size: u32, a: Operand, b: Operand) -> Operand {
        self.combine(BinaryOp::And, size, a, b)
    }

    pub fn or_(&mut self, size: u32, a: Operand, b: Operand) -> Operand {
        self.combine(BinaryOp::Or, size, a, b)
    }

    pub fn xor(&mut self, size: u32, a: Operand, b: Operand) -> Operand {
        self.combine(BinaryOp::Xor, size, a, b)
    }

    /// Three-way comparison of two long operands.
    pub fn lcmp(&mut self, a: Operand, b: Operand) -> Operand {
        self.combine(BinaryOp::LongCompare, 8, a, b)
    }

    pub fn neg(&mut self, size: u32, a: Operand) -> Operand {
        let result = self.cx.new_value(None, None);
        self.cx.append_translate(UnaryOp::Negate, size, a.0, result);
        Operand(result)
    }

    pub fn load(&mut self, size: u32, src: Operand) -> Operand {
        let dst = self.cx.new_value(None, None);
        self.cx.append_move(BinaryOp::Move, size, src.0, dst);
        Operand(dst)
    }

    pub fn loadz(&mut self, size: u32, src: Operand) -> Operand {
        let dst = self.cx.new_value(None, None);
        self.cx.append_move(BinaryOp::MoveZ, size, src.0, dst);
        Operand(dst)
    }

    pub fn load4_to8(&mut self, src: Operand) -> Operand {
        let dst = self.cx.new_value(None, None);
        self.cx.append_move(BinaryOp::Move4To8, 8, src.0, dst);
        Operand(dst)
    }

    pub fn store(&mut self, size: u32, src: Operand, dst: Operand) {
        self.cx.append_move(BinaryOp::Move, size, src.0, dst.0);
    }

    pub fn cmp(&mut self, size: u32, a: Operand, b: Operand) {
        self.cx.append_compare(size, a.0, b.0);
    }

    pub fn jl(&mut self, address: Operand) {
        self.cx.append_branch(UnaryOp::JumpIfLess, address.0);
    }

    pub fn jg(&mut self, address: Operand) {
        self.cx.append_branch(UnaryOp::JumpIfGreater, address.0);
    }

    pub fn jle(&mut self, address: Operand) {
        self.cx.append_branch(UnaryOp::JumpIfLessOrEqual, address.0);
    }

    pub fn jge(&mut self, address: Operand) {
        self.cx.append_branch(UnaryOp::JumpIfGreaterOrEqual, address.0);
    }

    pub fn je(&mut self, address: Operand) {
        self.cx.append_branch(UnaryOp::JumpIfEqual, address.0);
    }

    pub fn jne(&mut self, address: Operand) {
        self.cx.append_branch(UnaryOp::JumpIfNotEqual, address.0);
    }

    pub fn jmp(&mut self, address: Operand) {
        self.cx.append_branch(UnaryOp::Jump, address.0);
    }

    /// Guard an array access: `index` must be non-negative and below the
    /// length word at `object + length_offset`; otherwise control transfers
    /// to `handler`.
    pub fn check_bounds(&mut self, object: Operand, length_offset: i32, index: Operand, handler: i64) {
        self.cx.append_bounds_check(object.0, length_offset, index.0, handler);
    }

    /// Call with explicit arguments, each a `(size, value)` pair. The
    /// leading argument words travel in argument registers, the rest on the
    /// machine stack.
    pub fn call(
        &mut self,
        address: Operand,
        flags: u32,
        trace: Option<&'arena dyn TraceHandler<'arena>>,
        result_size: u32,
        arguments: &[(u32, Operand)],
    ) -> Operand {
        // Everything live on the operand stack must survive the call in
        // its stack slot.
        let mut entries = Vec::new();
        let mut cur = self.cx.cur_stack();
        while let Some(s) = cur {
            entries.push(s);
            cur = self.cx.node(s).next;
        }
        for s in entries {
            if self.cx.node(s).push_event.is_none() {
                self.cx.append_push_for(s);
            }
            let pe = self.cx.node(s).push_event.unwrap();
            if let EventKind::Push { active, .. } = &mut self.cx.event_mut(pe).kind {
                *active = true;
            }
        }

        let old_stack = self.cx.cur_stack();
        for &(size, value) in arguments.iter().rev() {
            self.cx.push_value_internal(size, value.0);
        }
        let argument_stack = self.cx.cur_stack();
        self.cx.set_stack(old_stack);

        let result = self.cx.new_value(None, None);
        self.cx.append_call(
            address.0,
            flags,
            trace,
            result,
            result_size,
            argument_stack,
            arguments.len() as u32,
            None,
        );
        Operand(result)
    }

    /// Call whose arguments already sit on the operand stack, `footprint`
    /// words deep. The caller pops them afterwards.
    pub fn stack_call(
        &mut self,
        address: Operand,
        flags: u32,
        trace: Option<&'arena dyn TraceHandler<'arena>>,
        result_size: u32,
        argument_footprint: u32,
    ) -> Operand {
        let argument_stack = self.cx.cur_stack();
        let mut below = argument_stack;
        let mut words = 0;
        let mut count = 0;
        while words < argument_footprint {
            let s = below.expect("argument footprint exceeds the stack");
            let node = *self.cx.node(s);
            words += node.size;
            count += 1;
            below = node.next;
        }

        let result = self.cx.new_value(None, None);
        self.cx.append_call(
            address.0,
            flags,
            trace,
            result,
            result_size,
            argument_stack,
            count,
            Some(below),
        );
        Operand(result)
    }

    pub fn return_(&mut self, size: u32, value: Operand) {
        self.cx.append_return(size, Some(value.0));
    }

    pub fn return_void(&mut self) {
        self.cx.append_return(0, None);
    }

    // ==================================================================
    // Introspection
    // ==================================================================

    pub fn is_constant(&self, v: Operand) -> bool {
        let mut cur = self.cx.value(v.0).sites;
        while let Some(s) = cur {
            if matches!(self.cx.site(s).kind, SiteKind::Constant { value: Some(_) }) {
                return true;
            }
            cur = self.cx.site(s).next;
        }
        false
    }

    pub fn constant_value(&self, v: Operand) -> Option<i64> {
        self.cx.constant_value_of(v.0)
    }

    // ==================================================================
    // Compile pass
    // ==================================================================

    /// Splice a sync event into the predecessor of every junction so each
    /// inbound path arrives with the canonical residency.
    fn update_junctions(&mut self) {
        let junctions = std::mem::take(&mut self.cx.junctions);
        for &ip in &junctions {
            let Some(pred) = self.cx.logical[ip as usize].immediate_predecessor else {
                continue;
            };
            let p = self.cx.logical[pred as usize];
            let Some(last) = p.last_event else { continue };
            let sequence = self.cx.event(last).sequence;
            let locals = p.locals.unwrap_or(&[]);
            log::trace!("junction at ip {}, syncing predecessor {}", ip, pred);

            let e = self.cx.new_detached_event(sequence, p.stack, EventKind::StackSync { locals });

            let word = self.cx.word();
            let mut cur = p.stack;
            while let Some(s) = cur {
                let node = *self.cx.node(s);
                if let Some(pe) = node.push_event {
                    if let EventKind::Push { active, .. } = &mut self.cx.event_mut(pe).kind {
                        *active = true;
                    }
                }
                // Paths may disagree about constants; the agreed location
                // is the stack slot.
                let components = &*self.cx.arena.alloc_slice_copy(&[
                    ReadConstraint::any(),
                    ReadConstraint {
                        type_mask: OperandKind::Address.bit()
                            | OperandKind::Register.bit()
                            | OperandKind::Memory.bit(),
                        register_mask: !0,
                        frame_index: None,
                    },
                ]);
                self.cx.insert_read(
                    e,
                    Some(sequence),
                    node.value,
                    node.size * word,
                    ReadKind::Multi { components },
                );
                cur = node.next;
            }

            self.cx.event_mut(last).next = Some(e);
            self.cx.logical[pred as usize].last_event = Some(e);
        }
        self.cx.junctions = junctions;
    }

    /// Run the compile pass: prologue, then every event in order.
    pub fn compile(&mut self) -> CompileResult<usize> {
        if self.cx.logical.is_empty() {
            return Err(CompileError::NotInitialized);
        }
        if self.cx.pass != Pass::Scan {
            return Err(CompileError::AlreadyCompiled);
        }
        self.cx.pass = Pass::Compile;

        self.update_junctions();

        let word = self.cx.word();
        let base = AsmOperand::Register { low: self.cx.asm.base(), high: None };
        let sp = AsmOperand::Register { low: self.cx.asm.stack(), high: None };
        self.cx.apply1_raw(UnaryOp::Push, word, base);
        self.cx.apply2_raw(BinaryOp::Move, word, sp, base);
        if self.cx.local_footprint > 0 {
            let frame = self.cx.resolved_promise((self.cx.local_footprint * word) as i64);
            self.cx.apply2_raw(BinaryOp::Subtract, word, AsmOperand::Constant(frame), sp);
        }

        let offsets = self.cx.code.offsets.get().expect("compile before init");
        for ip in 0..self.cx.logical.len() {
            let li = self.cx.logical[ip];
            let Some(first) = li.first_event else { continue };
            offsets[ip].set(self.cx.asm.length() as i64);
            log::trace!(" -- compile ip: {}", ip);

            let mut cursor = Some(first);
            while let Some(e) = cursor {
                self.compile_one(e);
                cursor = self.cx.event(e).next;
            }
        }

        self.cx.code.code_length.set(self.cx.asm.length());
        self.cx.pass = Pass::Done;
        log::debug!(
            "compiled {} instructions into {} operations",
            self.cx.logical.len(),
            self.cx.asm.length()
        );
        Ok(self.cx.asm.length())
    }

    fn compile_one(&mut self, e: crate::context::EventId) {
        let word = self.cx.word();

        // The first event after a stack reset re-acquires the canonical
        // residency the reset promised.
        if self.cx.event(e).stack_reset {
            let mut cur = self.cx.event(e).stack;
            while let Some(s) = cur {
                let node = *self.cx.node(s);
                if let Some(head) = self.cx.value(node.value).sites {
                    assert!(
                        self.cx.site(head).next.is_none(),
                        "reset entry with more than one site"
                    );
                    self.cx.site_acquire(None, node.size * word, node.value, head);
                }
                cur = node.next;
            }
        }

        // Resolve every input, pinning each source until the whole operand
        // set is settled.
        let stack = self.cx.event(e).stack;
        let mut read_ids = Vec::new();
        let mut r = self.cx.event(e).reads;
        while let Some(id) = r {
            read_ids.push(id);
            r = self.cx.read(id).event_next;
        }
        let mut frozen = Vec::with_capacity(read_ids.len());
        for &id in &read_ids {
            let source = self.cx.read_source(stack, id);
            let v = self.cx.read(id).value;
            self.cx.value_mut(v).source = Some(source);
            self.cx.site_freeze(source);
            frozen.push(source);
        }
        for s in frozen {
            self.cx.site_thaw(s);
        }

        self.cx.compile_event(e);
        self.cx.stamp_promises(e);
    }

    // ==================================================================
    // Output
    // ==================================================================

    /// Bytes of constant pool that follow the code.
    pub fn pool_size(&self) -> usize {
        self.cx.pool.len() * self.cx.word() as usize
    }

    /// Copy the emitted code into `dst` and append the resolved constant
    /// pool. Fixes the machine-code address every promise resolves against.
    pub fn write_to(&mut self, dst: &mut [u8]) -> CompileResult<()> {
        if self.cx.pass != Pass::Done {
            return Err(CompileError::NotCompiled);
        }
        let word = self.cx.word() as usize;
        let length = self.cx.code.code_length.get();
        let needed = pad(length, word as u32) + self.cx.pool.len() * word;
        if dst.len() < needed {
            return Err(CompileError::BufferTooSmall { needed, got: dst.len() });
        }

        self.cx.code.machine_code.set(Some(dst.as_ptr() as i64));
        self.cx.asm.write_to(dst);

        let mut offset = pad(length, word as u32);
        for i in 0..self.cx.pool.len() {
            let value = self.cx.pool[i].value()?;
            dst[offset..offset + word].copy_from_slice(&value.to_le_bytes()[..word]);
            offset += word;
        }
        Ok(())
    }

    // ==================================================================
    // Diagnostics
    // ==================================================================

    /// Assert the cross-layer invariants: register bookkeeping, the
    /// value/site/register web, and stack materialization state.
    pub fn check_invariants(&self) {
        self.cx.validate_registers();

        for slot in &self.cx.registers {
            if slot.reserved {
                continue;
            }
            if let (Some(v), Some(s)) = (slot.value, slot.site) {
                if self.cx.find_site(v, s) {
                    assert!(
                        self.cx.value(v).reads.is_some() || self.cx.value(v).sites.is_some(),
                        "register {} holds a value with no residency",
                        slot.number
                    );
                }
            }
        }

        let mut cur = self.cx.cur_stack();
        while let Some(s) = cur {
            let node = self.cx.node(s);
            if node.pushed && node.push_event.is_some() {
                assert!(
                    node.push_site.is_some(),
                    "pushed stack entry without a push site"
                );
            }
            cur = node.next;
        }
    }
}

//! The per-compilation mutable root.
//!
//! Every data structure of one compilation hangs off a [`Context`]: the IR
//! pools (values, sites, reads, events, operand-stack nodes), the register
//! file, the locals table, the logical-code array, the constant pool and the
//! state snapshot stack. Pools grow in the caller's bump arena and are
//! dropped wholesale with it; cross-links between IR nodes are plain pool
//! indices, so the cyclic value/site/register web needs no ownership.
//!
//! The context is single threaded and non-reentrant. Helpers shared by
//! several layers live here: site-list surgery on values, read-cursor
//! advancement, event linking, and the emission funnels that hand operands
//! to the assembler together with a scratch-register client.

use bumpalo::collections::Vec as ArenaVec;
use bumpalo::Bump;
use std::cell::Cell;
use std::cmp::Ordering;

use crate::assembler::{Assembler, AsmOperand, BinaryOp, NullaryOp, UnaryOp};
use crate::event::EventKind;
use crate::promise::{CodeBase, Promise, PromiseNode};
use crate::regfile::{RegisterClient, RegisterSlot};
use crate::site::SiteKind;
use crate::stack::StackNode;
use crate::value::ReadData;

macro_rules! pool_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub(crate) struct $name(pub(crate) u32);

        impl $name {
            #[inline]
            pub(crate) fn idx(self) -> usize {
                self.0 as usize
            }
        }
    };
}

pool_id!(ValueId);
pool_id!(SiteId);
pool_id!(ReadId);
pool_id!(EventId);
pool_id!(StackId);

/// Opaque operand handle returned to the front-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operand(pub(crate) ValueId);

/// Which phase the compilation is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pass {
    Scan,
    Compile,
    Done,
}

/// A symbolic value: its current residency and its future demands.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ValueData {
    /// Head of the site list materializing this value.
    pub sites: Option<SiteId>,
    /// Head of the pending read queue, ordered by event sequence.
    pub reads: Option<ReadId>,
    pub last_read: Option<ReadId>,
    /// Site chosen for the event currently compiling.
    pub source: Option<SiteId>,
    /// Preferred site, set by the producer (frame slots, pinned registers).
    pub target: Option<SiteId>,
}

/// One site pool entry, intrusively linked into its value's site list.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SiteData<'arena> {
    pub next: Option<SiteId>,
    pub kind: SiteKind<'arena>,
}

/// A scheduled backend action. Common bookkeeping here, the operation
/// payload in [`EventKind`].
pub(crate) struct EventData<'arena> {
    pub next: Option<EventId>,
    /// Operand stack as of event construction.
    pub stack: Option<StackId>,
    /// Code promises pinned just after this event's emission.
    pub promises: Option<&'arena PromiseNode<'arena>>,
    /// Head of this event's input reads (chained by `event_next`).
    pub reads: Option<ReadId>,
    pub sequence: u32,
    /// First event after a stack reset re-establishes residency.
    pub stack_reset: bool,
    pub kind: EventKind<'arena>,
}

/// Binding of a frame-local slot to the value last stored there.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LocalBinding {
    pub value: ValueId,
    pub size: u32,
}

/// Snapshot entry of the locals table, captured into sync events.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LocalSnapshot {
    pub index: u32,
    pub value: ValueId,
    pub size: u32,
}

/// Per-source-instruction record: its event chain, predecessor link and the
/// abstract state at entry.
#[derive(Clone, Copy, Default)]
pub(crate) struct LogicalInstruction<'arena> {
    pub first_event: Option<EventId>,
    pub last_event: Option<EventId>,
    pub immediate_predecessor: Option<u32>,
    pub stack: Option<StackId>,
    pub locals: Option<&'arena [LocalSnapshot]>,
    pub stack_saved: bool,
}

pub(crate) struct Context<'arena> {
    pub arena: &'arena Bump,
    pub asm: Box<dyn Assembler<'arena> + 'arena>,
    pub code: &'arena CodeBase<'arena>,

    pub values: ArenaVec<'arena, ValueData>,
    pub sites: ArenaVec<'arena, SiteData<'arena>>,
    pub reads: ArenaVec<'arena, ReadData<'arena>>,
    pub events: ArenaVec<'arena, EventData<'arena>>,
    pub stack_nodes: ArenaVec<'arena, StackNode>,

    pub registers: Vec<RegisterSlot>,
    pub logical: Vec<LogicalInstruction<'arena>>,
    pub locals: Vec<Option<LocalBinding>>,
    pub junctions: Vec<u32>,
    pub pool: Vec<Promise<'arena>>,

    /// State snapshot stack; the last entry is the live operand stack.
    pub states: Vec<Option<StackId>>,

    pub logical_ip: Option<u32>,
    pub next_sequence: u32,
    /// Words reserved below the frame base for locals.
    pub local_footprint: u32,
    pub stack_reset: bool,
    /// Outcome of a compare of two resolved constants, consumed by the next
    /// conditional branch.
    pub constant_compare: Option<Ordering>,
    pub pass: Pass,
}

impl<'arena> Context<'arena> {
    pub fn new(arena: &'arena Bump, asm: Box<dyn Assembler<'arena> + 'arena>) -> Self {
        let word = asm.word();
        let code = &*arena.alloc(CodeBase::new(word));
        let count = asm.register_count();
        let mut registers = Vec::with_capacity(count);
        for n in 0..count {
            registers.push(RegisterSlot::new(n as u8));
        }
        for r in [asm.base(), asm.stack(), asm.thread()] {
            let slot = &mut registers[r as usize];
            slot.reserved = true;
            slot.ref_count = 1;
        }

        Self {
            arena,
            asm,
            code,
            values: ArenaVec::new_in(arena),
            sites: ArenaVec::new_in(arena),
            reads: ArenaVec::new_in(arena),
            events: ArenaVec::new_in(arena),
            stack_nodes: ArenaVec::new_in(arena),
            registers,
            logical: Vec::new(),
            locals: Vec::new(),
            junctions: Vec::new(),
            pool: Vec::new(),
            states: vec![None],
            logical_ip: None,
            next_sequence: 0,
            local_footprint: 0,
            stack_reset: false,
            constant_compare: None,
            pass: Pass::Scan,
        }
    }

    pub fn word(&self) -> u32 {
        self.asm.word()
    }

    // ------------------------------------------------------------------
    // Pool accessors
    // ------------------------------------------------------------------

    pub fn value(&self, v: ValueId) -> &ValueData {
        &self.values[v.idx()]
    }

    pub fn value_mut(&mut self, v: ValueId) -> &mut ValueData {
        &mut self.values[v.idx()]
    }

    pub fn site(&self, s: SiteId) -> &SiteData<'arena> {
        &self.sites[s.idx()]
    }

    pub fn site_mut(&mut self, s: SiteId) -> &mut SiteData<'arena> {
        &mut self.sites[s.idx()]
    }

    pub fn read(&self, r: ReadId) -> &ReadData<'arena> {
        &self.reads[r.idx()]
    }

    pub fn read_mut(&mut self, r: ReadId) -> &mut ReadData<'arena> {
        &mut self.reads[r.idx()]
    }

    pub fn event(&self, e: EventId) -> &EventData<'arena> {
        &self.events[e.idx()]
    }

    pub fn event_mut(&mut self, e: EventId) -> &mut EventData<'arena> {
        &mut self.events[e.idx()]
    }

    pub fn node(&self, s: StackId) -> &StackNode {
        &self.stack_nodes[s.idx()]
    }

    pub fn node_mut(&mut self, s: StackId) -> &mut StackNode {
        &mut self.stack_nodes[s.idx()]
    }

    pub fn new_value(&mut self, site: Option<SiteId>, target: Option<SiteId>) -> ValueId {
        let id = ValueId(self.values.len() as u32);
        self.values.push(ValueData { sites: site, reads: None, last_read: None, source: None, target });
        id
    }

    pub fn new_site(&mut self, kind: SiteKind<'arena>) -> SiteId {
        let id = SiteId(self.sites.len() as u32);
        self.sites.push(SiteData { next: None, kind });
        id
    }

    // ------------------------------------------------------------------
    // Site lists
    // ------------------------------------------------------------------

    pub fn find_site(&self, v: ValueId, site: SiteId) -> bool {
        let mut cur = self.value(v).sites;
        while let Some(s) = cur {
            if s == site {
                return true;
            }
            cur = self.site(s).next;
        }
        false
    }

    /// Acquire `site` for `v` and prepend it to the value's site list.
    pub fn add_site(&mut self, stack: Option<StackId>, size: u32, v: ValueId, site: SiteId) {
        if self.find_site(v, site) {
            return;
        }
        log::trace!("add site {:?} ({:?}) to {:?}", site, self.site(site).kind, v);
        self.site_acquire(stack, size, v, site);
        let head = self.value(v).sites;
        self.site_mut(site).next = head;
        self.value_mut(v).sites = Some(site);
    }

    /// Release `site` and unlink it from the value's site list.
    pub fn remove_site(&mut self, v: ValueId, site: SiteId) {
        let mut prev: Option<SiteId> = None;
        let mut cur = self.value(v).sites;
        while let Some(s) = cur {
            if s == site {
                log::trace!("remove site {:?} from {:?}", site, v);
                self.site_release(s);
                let next = self.site(s).next;
                match prev {
                    None => self.value_mut(v).sites = next,
                    Some(p) => self.site_mut(p).next = next,
                }
                return;
            }
            prev = cur;
            cur = self.site(s).next;
        }
    }

    /// Drop every plain memory site of `v`. Frame slots survive; only stack
    /// copies go stale when the machine stack is about to be rewritten.
    pub fn remove_memory_sites(&mut self, v: ValueId) {
        let mut prev: Option<SiteId> = None;
        let mut cur = self.value(v).sites;
        while let Some(s) = cur {
            let next = self.site(s).next;
            if matches!(self.site(s).kind, SiteKind::Memory { .. }) {
                self.site_release(s);
                match prev {
                    None => self.value_mut(v).sites = next,
                    Some(p) => self.site_mut(p).next = next,
                }
            } else {
                prev = cur;
            }
            cur = next;
        }
    }

    pub fn clear_sites(&mut self, v: ValueId) {
        let mut cur = self.value(v).sites;
        while let Some(s) = cur {
            self.site_release(s);
            cur = self.site(s).next;
        }
        self.value_mut(v).sites = None;
    }

    /// Advance the read cursor of `v`; a value with no reads left releases
    /// its residency.
    pub fn next_read(&mut self, v: ValueId) {
        let head = self.value(v).reads.expect("advancing read cursor of a value with no reads");
        let next = self.read(head).next;
        self.value_mut(v).reads = next;
        if next.is_none() {
            self.value_mut(v).last_read = None;
            self.clear_sites(v);
        }
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// Append an event to the current logical instruction.
    pub fn new_event(&mut self, kind: EventKind<'arena>) -> EventId {
        let ip = self.logical_ip.expect("event appended before startLogicalIp") as usize;
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let stack_reset = self.stack_reset;
        if stack_reset {
            self.stack_reset = false;
        }

        let stack = self.cur_stack();
        let id = EventId(self.events.len() as u32);
        self.events.push(EventData {
            next: None,
            stack,
            promises: None,
            reads: None,
            sequence,
            stack_reset,
            kind,
        });

        let li = &mut self.logical[ip];
        match li.last_event {
            Some(last) => {
                li.last_event = Some(id);
                self.events[last.idx()].next = Some(id);
            }
            None => {
                li.first_event = Some(id);
                li.last_event = Some(id);
            }
        }
        id
    }

    /// Build an event outside the current instruction; used for the sync
    /// events spliced into junction predecessors after the scan.
    pub fn new_detached_event(
        &mut self,
        sequence: u32,
        stack: Option<StackId>,
        kind: EventKind<'arena>,
    ) -> EventId {
        let id = EventId(self.events.len() as u32);
        self.events.push(EventData {
            next: None,
            stack,
            promises: None,
            reads: None,
            sequence,
            stack_reset: false,
            kind,
        });
        id
    }

    /// Pin a fresh code promise to `e`; it resolves to the assembler length
    /// right after the event finishes emitting.
    pub fn add_code_promise(&mut self, e: EventId) -> Promise<'arena> {
        let head = self.event(e).promises;
        let node = &*self.arena.alloc(PromiseNode::Code {
            base: self.code,
            offset: Cell::new(-1),
            next: Cell::new(head),
        });
        self.event_mut(e).promises = Some(node);
        Promise::new(node)
    }

    /// Stamp every promise pinned to `e` with the current assembler length.
    pub fn stamp_promises(&mut self, e: EventId) {
        let length = self.asm.length() as i64;
        let mut cur = self.event(e).promises;
        while let Some(node) = cur {
            match node {
                PromiseNode::Code { offset, next, .. } => {
                    offset.set(length);
                    cur = next.get();
                }
                _ => unreachable!("non-code promise pinned to an event"),
            }
        }
    }

    // ------------------------------------------------------------------
    // Promises
    // ------------------------------------------------------------------

    pub fn resolved_promise(&self, value: i64) -> Promise<'arena> {
        Promise::new(self.arena.alloc(PromiseNode::Resolved(value)))
    }

    pub fn pool_promise(&self, key: u32) -> Promise<'arena> {
        Promise::new(self.arena.alloc(PromiseNode::Pool { base: self.code, key }))
    }

    pub fn ip_promise(&self, ip: u32) -> Promise<'arena> {
        Promise::new(self.arena.alloc(PromiseNode::Ip { base: self.code, ip }))
    }

    // ------------------------------------------------------------------
    // Abstract stack state
    // ------------------------------------------------------------------

    pub fn cur_stack(&self) -> Option<StackId> {
        *self.states.last().expect("state stack empty")
    }

    pub fn set_stack(&mut self, stack: Option<StackId>) {
        *self.states.last_mut().expect("state stack empty") = stack;
    }

    // ------------------------------------------------------------------
    // Emission funnels
    // ------------------------------------------------------------------

    pub fn apply0_raw(&mut self, op: NullaryOp) {
        self.asm.apply0(op);
    }

    pub fn apply1_raw(&mut self, op: UnaryOp, size: u32, a: AsmOperand<'arena>) {
        let Context { asm, registers, .. } = self;
        let mut client = RegisterClient { registers };
        asm.apply1(op, size, a, &mut client);
    }

    pub fn apply2_raw(&mut self, op: BinaryOp, size: u32, a: AsmOperand<'arena>, b: AsmOperand<'arena>) {
        let Context { asm, registers, .. } = self;
        let mut client = RegisterClient { registers };
        asm.apply2(op, size, a, b, &mut client);
    }

    pub fn apply1(&mut self, op: UnaryOp, size: u32, a: SiteId) {
        let ao = self.as_operand(a);
        self.apply1_raw(op, size, ao);
    }

    pub fn apply2(&mut self, op: BinaryOp, size: u32, a: SiteId, b: SiteId) {
        let ao = self.as_operand(a);
        let bo = self.as_operand(b);
        self.apply2_raw(op, size, ao, bo);
    }

    /// `Add sp, count*word`, coalescing dead stack slots away.
    pub fn emit_stack_adjust(&mut self, count: u32) {
        if count == 0 {
            return;
        }
        let word = self.word();
        let offset = AsmOperand::Constant(self.resolved_promise((count * word) as i64));
        let sp = AsmOperand::Register { low: self.asm.stack(), high: None };
        self.apply2_raw(BinaryOp::Add, word, offset, sp);
    }
}

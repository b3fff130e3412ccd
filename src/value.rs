//! Reads: recorded future uses of values, with allocation constraints.
//!
//! Every event that consumes a value appends a read to that value's queue
//! during the scan. A read carries the constraint the consuming event puts
//! on the value's location: which operand kinds are legal, which registers,
//! and optionally a frame slot. At compile time the queue head tells the
//! allocator what the value is needed for next; advancing past the last
//! read releases the value's residency.
//!
//! `Target` is the ordinary single-constraint read. `Multi` intersects a
//! set of constraints and backs join points, where every inbound path must
//! agree on one location.

use crate::assembler::{BinaryOp, OperandKind, ANY_REGISTER, ANY_TYPE};
use crate::context::{Context, EventId, ReadId, SiteId, StackId, ValueId};
use crate::event::EventKind;

/// One constraint set: acceptable operand kinds and registers, plus an
/// optional frame slot the value may be saved to.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReadConstraint {
    pub type_mask: u8,
    pub register_mask: u64,
    pub frame_index: Option<u32>,
}

impl ReadConstraint {
    pub const fn any() -> Self {
        Self { type_mask: ANY_TYPE, register_mask: ANY_REGISTER, frame_index: None }
    }

    pub fn intersect(self, other: ReadConstraint) -> ReadConstraint {
        ReadConstraint {
            type_mask: self.type_mask & other.type_mask,
            register_mask: self.register_mask & other.register_mask,
            frame_index: self.frame_index.or(other.frame_index),
        }
    }

    /// A constraint that admits nothing cannot be satisfied.
    pub fn valid(&self) -> bool {
        self.type_mask != 0
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum ReadKind<'arena> {
    Target {
        /// Producer hint: prefer wherever this value wants to end up.
        value: Option<ValueId>,
        constraint: ReadConstraint,
    },
    /// Intersection of several constraint sets, used at junctions.
    Multi { components: &'arena [ReadConstraint] },
}

impl ReadKind<'_> {
    pub fn constraint(&self) -> ReadConstraint {
        match self {
            ReadKind::Target { constraint, .. } => *constraint,
            ReadKind::Multi { components } => components
                .iter()
                .copied()
                .fold(ReadConstraint::any(), ReadConstraint::intersect),
        }
    }

    /// An unconstrained read never forces a move or an allocation; it only
    /// consumes whatever site the value already has.
    pub fn unconstrained(&self) -> bool {
        match self {
            ReadKind::Target { value: None, constraint } => {
                constraint.type_mask == ANY_TYPE
                    && constraint.register_mask == ANY_REGISTER
                    && constraint.frame_index.is_none()
            }
            ReadKind::Target { value: Some(_), .. } => false,
            ReadKind::Multi { .. } => false,
        }
    }
}

/// A read: one future use of `value` by `event`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReadData<'arena> {
    /// Operand size in bytes.
    pub size: u32,
    pub value: ValueId,
    /// Next read of the same value, in event-sequence order.
    pub next: Option<ReadId>,
    pub event: Option<EventId>,
    /// Next read of the same event.
    pub event_next: Option<ReadId>,
    pub kind: ReadKind<'arena>,
}

impl<'arena> Context<'arena> {
    /// Record that `event` reads `v`. With a sequence number the read is
    /// inserted at its ordered position in the value's queue (used when
    /// junction syncs are spliced in after the scan); otherwise it appends.
    pub fn insert_read(
        &mut self,
        event: EventId,
        sequence: Option<u32>,
        v: ValueId,
        size: u32,
        kind: ReadKind<'arena>,
    ) -> ReadId {
        let id = ReadId(self.reads.len() as u32);
        let event_head = self.event(event).reads;
        self.reads.push(ReadData {
            size,
            value: v,
            next: None,
            event: Some(event),
            event_next: event_head,
            kind,
        });
        self.event_mut(event).reads = Some(id);
        log::trace!("add read {:?} to {:?}", id, v);

        if let Some(seq) = sequence {
            let mut prev: Option<ReadId> = None;
            let mut cur = self.value(v).reads;
            while let Some(c) = cur {
                let ev = self.read(c).event.expect("queued read without event");
                if self.event(ev).sequence > seq {
                    self.read_mut(id).next = Some(c);
                    match prev {
                        None => self.value_mut(v).reads = Some(id),
                        Some(p) => self.read_mut(p).next = Some(id),
                    }
                    return id;
                }
                prev = cur;
                cur = self.read(c).next;
            }
        }

        match self.value(v).last_read {
            Some(last) => self.read_mut(last).next = Some(id),
            None => self.value_mut(v).reads = Some(id),
        }
        self.value_mut(v).last_read = Some(id);
        id
    }

    /// Append a read for the event currently being constructed.
    pub fn add_read(&mut self, v: ValueId, size: u32, kind: ReadKind<'arena>) -> ReadId {
        let ip = self.logical_ip.expect("read appended outside an instruction") as usize;
        let event = self.logical[ip].last_event.expect("read appended before its event");
        self.insert_read(event, None, v, size, kind)
    }

    pub fn read_constraint(&self, r: ReadId) -> ReadConstraint {
        self.read(r).kind.constraint()
    }

    /// Cheapest existing site of `v` satisfying a constraint.
    pub fn pick_site_matching(
        &self,
        v: ValueId,
        type_mask: u8,
        register_mask: u64,
    ) -> Option<SiteId> {
        let mut best = None;
        let mut best_cost = u32::MAX;
        let mut cur = self.value(v).sites;
        while let Some(s) = cur {
            if self.match_site(s, type_mask, register_mask) {
                let cost = self.copy_cost(s, None);
                if cost < best_cost {
                    best = Some(s);
                    best_cost = cost;
                }
            }
            cur = self.site(s).next;
        }
        best
    }

    /// A fresh site satisfying the read's constraint.
    pub fn allocate_site_for_read(&mut self, r: ReadId) -> SiteId {
        let size = self.read(r).size;
        let c = self.read_constraint(r);
        assert!(c.valid(), "read constraint admits no location");
        if c.type_mask & OperandKind::Register.bit() != 0 && c.register_mask != 0 {
            self.free_register_site(size, c.register_mask)
        } else if let Some(index) = c.frame_index {
            self.frame_site(index)
        } else {
            panic!("read constraint admits neither register nor frame slot");
        }
    }

    /// The site this read wants the value in, or `None` when any site will
    /// do. Reads owned by an inactive push defer to the following read; an
    /// active push needs no target at all, the push emission handles it.
    pub fn resolve_read_target(&mut self, r: ReadId) -> Option<SiteId> {
        if let Some(e) = self.read(r).event {
            if let EventKind::Push { active, .. } = self.event(e).kind {
                return if active {
                    None
                } else {
                    let next = self.read(r).next;
                    next.and_then(|n| self.target_or_null_read(n))
                };
            }
        }
        if self.read(r).kind.unconstrained() {
            return None;
        }
        Some(self.read_target_constrained(r))
    }

    /// Constraint resolution: the hinted destination when it satisfies the
    /// masks, else the cheapest matching existing site, else a fresh
    /// register.
    fn read_target_constrained(&mut self, r: ReadId) -> SiteId {
        let rd = *self.read(r);
        let c = rd.kind.constraint();
        if let ReadKind::Target { value: Some(hint), .. } = rd.kind {
            if let Some(s) = self.value_target_or_null(hint) {
                if self.match_site(s, c.type_mask, c.register_mask) {
                    return s;
                }
            }
        }
        if let Some(s) = self.pick_site_matching(rd.value, c.type_mask, c.register_mask) {
            return s;
        }
        self.allocate_site_for_read(r)
    }

    fn target_or_null_read(&mut self, r: ReadId) -> Option<SiteId> {
        let v = self.read(r).value;
        if let Some(t) = self.value(v).target {
            return Some(t);
        }
        self.resolve_read_target(r)
    }

    /// Where `v` wants to end up, if anything has expressed a preference.
    pub fn value_target_or_null(&mut self, v: ValueId) -> Option<SiteId> {
        if let Some(t) = self.value(v).target {
            return Some(t);
        }
        if let Some(r) = self.value(v).reads {
            return self.resolve_read_target(r);
        }
        None
    }

    /// The hinted target when it is safe to take, else a fresh register.
    pub fn target_or_register(&mut self, size: u32, v: ValueId) -> SiteId {
        if let Some(s) = self.value_target_or_null(v) {
            if self.site_is_free(s) {
                return s;
            }
        }
        self.free_register_site(size, ANY_REGISTER)
    }

    /// Resolve one event input: choose the value's source site, emitting a
    /// move into the read's target when the cheapest copy is elsewhere.
    pub fn read_source(&mut self, stack: Option<StackId>, r: ReadId) -> SiteId {
        let v = self.read(r).value;
        let size = self.read(r).size;

        let mut target = self.resolve_read_target(r);
        if let Some(t) = target {
            if !self.site_is_free(t) {
                target = None;
            }
        }

        let (site, cost) = self.pick_site(v, target);
        match target {
            Some(t) => {
                if cost > 0 {
                    let site = site.expect("reading a value with no site");
                    self.add_site(stack, size, v, t);
                    self.apply2(BinaryOp::Move, size, site, t);
                }
                t
            }
            None => site.expect("reading a value with no site"),
        }
    }
}

/// Shorthand for the common single-constraint read.
pub(crate) fn target_read(
    value: Option<ValueId>,
    type_mask: u8,
    register_mask: u64,
) -> ReadKind<'static> {
    ReadKind::Target {
        value,
        constraint: ReadConstraint { type_mask, register_mask, frame_index: None },
    }
}

/// A read that accepts the value wherever it already is.
pub(crate) fn any_read() -> ReadKind<'static> {
    target_read(None, ANY_TYPE, ANY_REGISTER)
}

/// A read demanding one specific register (pair).
pub(crate) fn fixed_register_read(low: u8, high: Option<u8>) -> ReadKind<'static> {
    let mut mask = 1u64 << low;
    if let Some(h) = high {
        mask |= 1u64 << (h as u32 + 32);
    }
    target_read(None, OperandKind::Register.bit(), mask)
}

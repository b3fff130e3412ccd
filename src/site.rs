//! Concrete locations of values and their cost model.
//!
//! A site is one place a value currently lives: an immediate constant, a
//! code address, one or two registers, an arbitrary memory operand, or a
//! fixed frame slot. Values keep a list of sites; the allocator picks among
//! them by copy cost and materializes new ones on demand.
//!
//! Cost ordering, cheapest first: an identical (or structurally equal)
//! site costs nothing, then constant (1), register (2), address (3),
//! memory and frame slots (4). A zero cost means no move is emitted.

use crate::assembler::{AsmOperand, OperandKind};
use crate::context::{Context, SiteId, StackId, ValueId};
use crate::promise::Promise;

/// Tagged site variants.
#[derive(Debug, Clone, Copy)]
pub(crate) enum SiteKind<'arena> {
    /// An immediate. The promise is `None` only for a label that has not
    /// been marked yet.
    Constant { value: Option<Promise<'arena>> },
    /// A code or data address.
    Address { address: Promise<'arena> },
    /// One register, or a low/high pair for two-word values.
    Register { low: u8, high: Option<u8> },
    /// A full memory operand.
    Memory { base: u8, offset: i32, index: Option<u8>, scale: u8 },
    /// A frame slot at a displacement fixed by its index.
    Frame { index: u32 },
}

impl SiteKind<'_> {
    pub fn operand_kind(&self) -> OperandKind {
        match self {
            SiteKind::Constant { .. } => OperandKind::Constant,
            SiteKind::Address { .. } => OperandKind::Address,
            SiteKind::Register { .. } => OperandKind::Register,
            SiteKind::Memory { .. } | SiteKind::Frame { .. } => OperandKind::Memory,
        }
    }
}

impl<'arena> Context<'arena> {
    // ------------------------------------------------------------------
    // Constructors
    // ------------------------------------------------------------------

    pub fn constant_site(&mut self, value: Promise<'arena>) -> SiteId {
        self.new_site(SiteKind::Constant { value: Some(value) })
    }

    pub fn unmarked_label_site(&mut self) -> SiteId {
        self.new_site(SiteKind::Constant { value: None })
    }

    pub fn address_site(&mut self, address: Promise<'arena>) -> SiteId {
        self.new_site(SiteKind::Address { address })
    }

    pub fn register_site(&mut self, low: u8, high: Option<u8>) -> SiteId {
        debug_assert!((low as usize) < self.registers.len());
        debug_assert!(high.map_or(true, |h| (h as usize) < self.registers.len()));
        self.new_site(SiteKind::Register { low, high })
    }

    pub fn memory_site(&mut self, base: u8, offset: i32, index: Option<u8>, scale: u8) -> SiteId {
        self.new_site(SiteKind::Memory { base, offset, index, scale })
    }

    pub fn frame_site(&mut self, index: u32) -> SiteId {
        self.new_site(SiteKind::Frame { index })
    }

    /// Byte displacement of local frame slot `index` from the frame base.
    pub fn frame_offset(&self, index: u32) -> i32 {
        -(((index + 1) * self.word()) as i32)
    }

    /// Memory site of operand-stack slot `index` (indices count words above
    /// the locals area).
    pub fn stack_slot_site(&mut self, index: u32) -> SiteId {
        let offset = -(((self.local_footprint + index + 1) * self.word()) as i32);
        let base = self.asm.base();
        self.memory_site(base, offset, None, 1)
    }

    // ------------------------------------------------------------------
    // Cost model
    // ------------------------------------------------------------------

    /// Relative cost of materializing a value living in `site` into
    /// `target`; zero means the target is already satisfied.
    pub fn copy_cost(&self, site: SiteId, target: Option<SiteId>) -> u32 {
        if target == Some(site) {
            return 0;
        }
        let kind = self.site(site).kind;
        if let Some(t) = target {
            if sites_equal(&kind, &self.site(t).kind) {
                return 0;
            }
        }
        match kind {
            SiteKind::Constant { .. } => 1,
            SiteKind::Register { .. } => 2,
            SiteKind::Address { .. } => 3,
            SiteKind::Memory { .. } | SiteKind::Frame { .. } => 4,
        }
    }

    /// Cheapest site of `v` relative to `target`.
    pub fn pick_site(&self, v: ValueId, target: Option<SiteId>) -> (Option<SiteId>, u32) {
        let mut best = None;
        let mut best_cost = u32::MAX;
        let mut cur = self.value(v).sites;
        while let Some(s) = cur {
            let cost = self.copy_cost(s, target);
            if cost < best_cost {
                best = Some(s);
                best_cost = cost;
            }
            cur = self.site(s).next;
        }
        (best, best_cost)
    }

    /// Whether `site` satisfies a type/register constraint pair.
    pub fn match_site(&self, site: SiteId, type_mask: u8, register_mask: u64) -> bool {
        let kind = self.site(site).kind;
        if kind.operand_kind().bit() & type_mask == 0 {
            return false;
        }
        match kind {
            SiteKind::Register { low, high } => {
                register_mask & (1u64 << low) != 0
                    && high.map_or(true, |h| register_mask & (1u64 << (h as u32 + 32)) != 0)
            }
            _ => true,
        }
    }

    /// A register target is only usable when taking it will not destroy the
    /// sole copy of some other value.
    pub fn site_is_free(&self, site: SiteId) -> bool {
        match self.site(site).kind {
            SiteKind::Register { low, high } => {
                !(self.used_exclusively(low)
                    || high.map_or(false, |h| self.used_exclusively(h)))
            }
            _ => true,
        }
    }

    // ------------------------------------------------------------------
    // Acquire / release / freeze
    // ------------------------------------------------------------------

    /// Take ownership of the site's underlying resources for `v`.
    pub fn site_acquire(&mut self, stack: Option<StackId>, size: u32, v: ValueId, site: SiteId) {
        let kind = self.site(site).kind;
        match kind {
            SiteKind::Register { low, high } => {
                self.acquire_register(low, stack, size, v, site);
                if let Some(h) = high {
                    // Pin the low half so acquiring the high half cannot
                    // evict it.
                    self.freeze_register(low);
                    self.acquire_register(h, stack, size, v, site);
                    self.thaw_register(low);
                }
            }
            SiteKind::Memory { base, index, .. } => {
                self.increment(base);
                if let Some(i) = index {
                    self.increment(i);
                }
            }
            SiteKind::Constant { .. } | SiteKind::Address { .. } | SiteKind::Frame { .. } => {}
        }
    }

    pub fn site_release(&mut self, site: SiteId) {
        let kind = self.site(site).kind;
        match kind {
            SiteKind::Register { low, high } => {
                self.release_register(low, site);
                if let Some(h) = high {
                    self.release_register(h, site);
                }
            }
            SiteKind::Memory { base, index, .. } => {
                self.decrement(base);
                if let Some(i) = index {
                    self.decrement(i);
                }
            }
            SiteKind::Constant { .. } | SiteKind::Address { .. } | SiteKind::Frame { .. } => {}
        }
    }

    pub fn site_freeze(&mut self, site: SiteId) {
        let kind = self.site(site).kind;
        if let SiteKind::Register { low, high } = kind {
            self.freeze_register(low);
            if let Some(h) = high {
                self.freeze_register(h);
            }
        }
    }

    pub fn site_thaw(&mut self, site: SiteId) {
        let kind = self.site(site).kind;
        if let SiteKind::Register { low, high } = kind {
            self.thaw_register(low);
            if let Some(h) = high {
                self.thaw_register(h);
            }
        }
    }

    /// A fresh register site satisfying `mask`, paired when a two-word value
    /// does not fit one register.
    pub fn free_register_site(&mut self, size: u32, mask: u64) -> SiteId {
        if self.word() == 4 && size == 8 {
            let low = self.pick_register((mask & 0xFFFF_FFFF) as u32);
            let high = self.pick_register(((mask >> 32) as u32) & !(1u32 << low));
            self.register_site(low, Some(high))
        } else {
            let low = self.pick_register((mask & 0xFFFF_FFFF) as u32);
            self.register_site(low, None)
        }
    }

    // ------------------------------------------------------------------
    // Assembler presentation
    // ------------------------------------------------------------------

    pub fn as_operand(&self, site: SiteId) -> AsmOperand<'arena> {
        match self.site(site).kind {
            SiteKind::Constant { value } => {
                AsmOperand::Constant(value.expect("label used before mark()"))
            }
            SiteKind::Address { address } => AsmOperand::Address(address),
            SiteKind::Register { low, high } => AsmOperand::Register { low, high },
            SiteKind::Memory { base, offset, index, scale } => {
                AsmOperand::Memory { base, offset, index, scale }
            }
            SiteKind::Frame { index } => AsmOperand::Memory {
                base: self.asm.base(),
                offset: self.frame_offset(index),
                index: None,
                scale: 1,
            },
        }
    }
}

/// Structural equality; identity is checked by the caller.
fn sites_equal(a: &SiteKind, b: &SiteKind) -> bool {
    match (a, b) {
        (
            SiteKind::Register { low: al, high: ah },
            SiteKind::Register { low: bl, high: bh },
        ) => al == bl && ah == bh,
        (
            SiteKind::Memory { base: ab, offset: ao, index: ai, scale: asc },
            SiteKind::Memory { base: bb, offset: bo, index: bi, scale: bsc },
        ) => ab == bb && ao == bo && ai == bi && asc == bsc,
        (SiteKind::Frame { index: a }, SiteKind::Frame { index: b }) => a == b,
        _ => false,
    }
}

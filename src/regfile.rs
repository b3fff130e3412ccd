//! The register file: slot bookkeeping, the allocation cost model, and the
//! steal/replace discipline.
//!
//! Each architectural register has one slot tracking the value it holds,
//! the owning site, a reference count (memory sites pin their base and
//! index registers through it), a freeze count for scoped pinning, and the
//! reserved flag for the base, stack and thread registers.
//!
//! Allocation is local and cost driven: `pick_register` scans the file for
//! the cheapest legal register, acquisition steals the current occupant
//! when it can be saved elsewhere and otherwise relocates it with a move.
//! A frozen register is never stolen, replaced or released.

use crate::assembler::{AssemblerClient, BinaryOp, ANY_REGISTER};
use crate::context::{Context, SiteId, StackId, ValueId};

/// One architectural register's bookkeeping.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RegisterSlot {
    pub number: u8,
    pub value: Option<ValueId>,
    pub site: Option<SiteId>,
    pub size: u32,
    pub ref_count: u32,
    pub freeze_count: u32,
    pub reserved: bool,
    pub pushed: bool,
}

impl RegisterSlot {
    pub fn new(number: u8) -> Self {
        Self {
            number,
            value: None,
            site: None,
            size: 0,
            ref_count: 0,
            freeze_count: 0,
            reserved: false,
            pushed: false,
        }
    }
}

impl<'arena> Context<'arena> {
    pub fn increment(&mut self, r: u8) {
        let slot = &mut self.registers[r as usize];
        slot.ref_count += 1;
        log::trace!("increment {} to {}", r, slot.ref_count);
    }

    pub fn decrement(&mut self, r: u8) {
        let slot = &mut self.registers[r as usize];
        assert!(slot.ref_count > 0, "register {} ref count underflow", r);
        assert!(
            slot.ref_count > 1 || !slot.reserved,
            "releasing the pinned reference of reserved register {}",
            r
        );
        slot.ref_count -= 1;
        log::trace!("decrement {} to {}", r, slot.ref_count);
    }

    /// Whether register `r` currently materializes a live value.
    pub fn used(&self, r: u8) -> bool {
        let slot = &self.registers[r as usize];
        match (slot.value, slot.site) {
            (Some(v), Some(s)) => self.find_site(v, s),
            _ => false,
        }
    }

    /// Whether `r` holds the only copy of its value.
    pub fn used_exclusively(&self, r: u8) -> bool {
        if !self.used(r) {
            return false;
        }
        let v = self.registers[r as usize].value.unwrap();
        let head = self.value(v).sites.unwrap();
        self.site(head).next.is_none()
    }

    /// Cheapest register admitted by `mask`: freezing costs 6, being used
    /// costs 1 (plus 2 when the register is the value's only copy), a
    /// nonzero reference count costs 2. Ties go to the highest number.
    pub fn pick_register(&self, mask: u32) -> u8 {
        let mut best: Option<(u32, u8)> = None;
        for n in (0..self.registers.len().min(32)).rev() {
            if mask & (1u32 << n) == 0 {
                continue;
            }
            let slot = &self.registers[n];
            if slot.reserved {
                continue;
            }
            let r = n as u8;
            let mut cost = 0;
            if slot.freeze_count > 0 {
                cost += 6;
            }
            if self.used(r) {
                cost += 1;
                if self.used_exclusively(r) {
                    cost += 2;
                }
            }
            if slot.ref_count > 0 {
                cost += 2;
            }
            match best {
                Some((c, _)) if cost >= c => {}
                _ => best = Some((cost, r)),
            }
        }
        let (cost, r) = best.expect("no allocatable register admitted by mask");
        assert!(cost < 6, "register pressure: only frozen registers remain");
        log::trace!("pick register {} (cost {})", r, cost);
        r
    }

    /// Dedicate `r` to (`v`, `site`), evicting the current occupant.
    pub fn acquire_register(
        &mut self,
        r: u8,
        stack: Option<StackId>,
        size: u32,
        v: ValueId,
        site: SiteId,
    ) {
        if self.registers[r as usize].reserved {
            return;
        }
        log::trace!("acquire {} for {:?}", r, v);

        let slot = &self.registers[r as usize];
        if let (Some(old), Some(old_site)) = (slot.value, slot.site) {
            if old != v && self.find_site(old, old_site) {
                if !self.steal_register(r, stack) {
                    self.replace_register(r, stack);
                }
            }
        }

        let slot = &mut self.registers[r as usize];
        slot.size = size;
        slot.value = Some(v);
        slot.site = Some(site);
    }

    /// Take `r` from its value without a move if the value survives
    /// elsewhere; otherwise save the sole copy to a frame slot or the
    /// machine stack. Fails when no save location exists or `r` is frozen.
    pub fn steal_register(&mut self, r: u8, stack: Option<StackId>) -> bool {
        let slot = &self.registers[r as usize];
        if slot.freeze_count > 0 {
            return false;
        }
        assert!(slot.ref_count == 0, "stealing register {} with live references", r);
        let v = slot.value.unwrap();
        let site = slot.site.unwrap();
        let size = slot.size;
        log::trace!("try steal {} from {:?}", r, v);

        let sole_copy = {
            let head = self.value(v).sites.expect("stolen value has no sites");
            // The register site is in the list (checked by the caller), so a
            // single-element list means it is the only copy.
            self.site(head).next.is_none()
        };

        if sole_copy {
            if let Some(index) = self.local_slot_of(v) {
                let fs = self.frame_site(index);
                self.add_site(stack, size, v, fs);
                self.apply2(BinaryOp::Move, size, site, fs);
            } else if let Some(index) = self.pending_frame_index(v) {
                let fs = self.frame_site(index);
                self.add_site(stack, size, v, fs);
                self.apply2(BinaryOp::Move, size, site, fs);
            } else if self.on_unpushed_stack(stack, v) {
                self.push_now(stack);
            } else {
                return false;
            }
        }

        self.remove_site(v, site);
        true
    }

    /// Relocate the occupant of `r` into a freshly acquired register.
    pub fn replace_register(&mut self, r: u8, stack: Option<StackId>) {
        let slot = &self.registers[r as usize];
        assert!(slot.freeze_count == 0, "replacing frozen register {}", r);
        let v = slot.value.unwrap();
        let site = slot.site.unwrap();
        let size = slot.size;
        log::trace!("replace {} holding {:?}", r, v);

        let mask = ANY_REGISTER & !(1u64 << r) & !(1u64 << (r as u32 + 32));
        let fresh = self.free_register_site(size, mask);
        self.add_site(stack, size, v, fresh);
        self.apply2(BinaryOp::Move, size, site, fresh);
        self.remove_site(v, site);
    }

    /// Clear `r` if `site` still owns it. Reference counts are managed
    /// separately by memory-site acquire/release.
    pub fn release_register(&mut self, r: u8, site: SiteId) {
        let slot = &mut self.registers[r as usize];
        if slot.site == Some(site) {
            log::trace!("release {}", r);
            slot.value = None;
            slot.site = None;
            slot.size = 0;
        }
    }

    /// Pin `r` against theft, replacement and release. A freeze holds a
    /// reference so `ref_count >= freeze_count` stays true.
    pub fn freeze_register(&mut self, r: u8) {
        let slot = &mut self.registers[r as usize];
        slot.freeze_count += 1;
        slot.ref_count += 1;
    }

    pub fn thaw_register(&mut self, r: u8) {
        let slot = &mut self.registers[r as usize];
        assert!(slot.freeze_count > 0, "thawing register {} that is not frozen", r);
        assert!(slot.ref_count > 0, "thawing register {} with no references", r);
        slot.freeze_count -= 1;
        slot.ref_count -= 1;
    }

    fn local_slot_of(&self, v: ValueId) -> Option<u32> {
        self.locals
            .iter()
            .position(|b| matches!(b, Some(binding) if binding.value == v))
            .map(|i| i as u32)
    }

    /// First frame-slot constraint among the value's pending reads.
    fn pending_frame_index(&self, v: ValueId) -> Option<u32> {
        let mut cur = self.value(v).reads;
        while let Some(r) = cur {
            if let Some(fi) = self.read(r).kind.constraint().frame_index {
                return Some(fi);
            }
            cur = self.read(r).next;
        }
        None
    }

    fn on_unpushed_stack(&self, stack: Option<StackId>, v: ValueId) -> bool {
        let mut cur = stack;
        while let Some(s) = cur {
            let node = self.node(s);
            if node.pushed {
                break;
            }
            if node.value == v {
                return true;
            }
            cur = node.next;
        }
        false
    }

    /// Internal consistency assertions over the register file; exercised by
    /// the test suite after every scenario.
    pub fn validate_registers(&self) {
        for slot in &self.registers {
            assert!(
                slot.ref_count >= slot.freeze_count,
                "register {}: ref count {} below freeze count {}",
                slot.number,
                slot.ref_count,
                slot.freeze_count
            );
            if let (Some(v), Some(s)) = (slot.value, slot.site) {
                if self.find_site(v, s) {
                    // The site must point back at this register.
                    match self.site(s).kind {
                        crate::site::SiteKind::Register { low, high } => {
                            assert!(
                                low == slot.number || high == Some(slot.number),
                                "register {} owned by a site for another register",
                                slot.number
                            );
                        }
                        _ => panic!("register {} owned by a non-register site", slot.number),
                    }
                }
            }
        }
    }
}

/// Scratch-register broker handed to the assembler during emission.
pub(crate) struct RegisterClient<'c> {
    pub registers: &'c mut Vec<RegisterSlot>,
}

impl AssemblerClient for RegisterClient<'_> {
    fn acquire_temporary(&mut self, mask: u64) -> u8 {
        let mut fallback = None;
        for n in (0..self.registers.len().min(32)).rev() {
            if mask & (1u64 << n) == 0 {
                continue;
            }
            let slot = &self.registers[n];
            if slot.reserved || slot.freeze_count > 0 {
                continue;
            }
            if slot.value.is_none() && slot.ref_count == 0 {
                self.registers[n].ref_count += 1;
                return n as u8;
            }
            if fallback.is_none() {
                fallback = Some(n);
            }
        }
        let n = fallback.expect("no temporary register available");
        self.registers[n].ref_count += 1;
        n as u8
    }

    fn release_temporary(&mut self, r: u8) {
        let slot = &mut self.registers[r as usize];
        assert!(slot.ref_count > 0, "temporary register {} over-released", r);
        slot.ref_count -= 1;
    }

    fn save(&mut self, r: u8) -> bool {
        let slot = &mut self.registers[r as usize];
        if slot.value.is_some() {
            slot.pushed = true;
            true
        } else {
            false
        }
    }

    fn restore(&mut self, r: u8) -> bool {
        let slot = &mut self.registers[r as usize];
        if slot.pushed {
            slot.pushed = false;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::RecordingAssembler;
    use bumpalo::Bump;

    fn test_context(arena: &Bump) -> Context<'_> {
        Context::new(arena, Box::new(RecordingAssembler::new(8)))
    }

    #[test]
    fn test_reserved_registers_never_picked() {
        let arena = Bump::new();
        let cx = test_context(&arena);
        // Registers 5, 6, 7 are thread, base and stack.
        for _ in 0..16 {
            let r = cx.pick_register(!0);
            assert!(r < 5);
        }
    }

    #[test]
    fn test_pick_prefers_highest_free() {
        let arena = Bump::new();
        let cx = test_context(&arena);
        assert_eq!(cx.pick_register(!0), 4);
        assert_eq!(cx.pick_register(0b0110), 2);
    }

    #[test]
    fn test_pick_avoids_occupied() {
        let arena = Bump::new();
        let mut cx = test_context(&arena);

        let v = cx.new_value(None, None);
        let site = cx.register_site(4, None);
        cx.add_site(None, 8, v, site);
        assert!(cx.used(4));
        assert!(cx.used_exclusively(4));

        assert_eq!(cx.pick_register(!0), 3);
        // With only register 4 admitted, it is picked despite the cost.
        assert_eq!(cx.pick_register(1 << 4), 4);
    }

    #[test]
    fn test_freeze_blocks_steal() {
        let arena = Bump::new();
        let mut cx = test_context(&arena);

        let v = cx.new_value(None, None);
        let site = cx.register_site(4, None);
        cx.add_site(None, 8, v, site);
        cx.freeze_register(4);

        assert!(!cx.steal_register(4, None));
        cx.thaw_register(4);
        cx.validate_registers();
    }

    #[test]
    fn test_steal_detaches_redundant_copy() {
        let arena = Bump::new();
        let mut cx = test_context(&arena);

        let p = cx.resolved_promise(3);
        let constant = cx.constant_site(p);
        let v = cx.new_value(Some(constant), None);
        let site = cx.register_site(4, None);
        cx.add_site(None, 8, v, site);

        // The constant copy survives, so the steal is free.
        assert!(cx.steal_register(4, None));
        assert!(!cx.find_site(v, site));
        assert!(cx.find_site(v, constant));
        assert!(!cx.used(4));
    }

    #[test]
    fn test_acquire_assigns_slot() {
        let arena = Bump::new();
        let mut cx = test_context(&arena);

        let v = cx.new_value(None, None);
        let site = cx.register_site(2, None);
        cx.acquire_register(2, None, 4, v, site);

        let slot = &cx.registers[2];
        assert_eq!(slot.value, Some(v));
        assert_eq!(slot.site, Some(site));
        assert_eq!(slot.size, 4);
    }

    proptest::proptest! {
        #[test]
        fn prop_pick_respects_mask_and_reservations(mask in 1u32..32) {
            let arena = Bump::new();
            let cx = test_context(&arena);
            let r = cx.pick_register(mask);
            proptest::prop_assert!(mask & (1 << r) != 0);
            proptest::prop_assert!(!cx.registers[r as usize].reserved);
        }

        #[test]
        fn prop_pick_is_deterministic(mask in 1u32..32) {
            let arena = Bump::new();
            let cx = test_context(&arena);
            proptest::prop_assert_eq!(cx.pick_register(mask), cx.pick_register(mask));
        }
    }

    #[test]
    fn test_client_temporary_roundtrip() {
        let arena = Bump::new();
        let mut cx = test_context(&arena);

        let mut client = RegisterClient { registers: &mut cx.registers };
        let r = client.acquire_temporary(!0);
        assert!(r < 5);
        assert!(!client.save(r));
        assert!(!client.restore(r));
        client.release_temporary(r);
        assert_eq!(cx.registers[r as usize].ref_count, 0);
    }
}

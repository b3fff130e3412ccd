//! The abstract operand stack and its lazy materialization.
//!
//! Pushes are recorded symbolically: a stack node remembers its value, its
//! word footprint and its slot index, and a push event that stays inactive
//! until something (a call, a branch sync) needs the value on the concrete
//! machine stack. `push_now` materializes the unpushed suffix in machine
//! order and records each entry's push site, the frame-relative memory
//! operand other sites can be rebuilt from. `pop_now` unwinds, popping
//! wanted values into fresh sites and coalescing the rest into one stack
//! pointer adjustment.
//!
//! State snapshots (`push_state` / `pop_state`) bracket conditional
//! regions so both arms start from the same abstract shape; `reset_stack`
//! rebuilds the canonical all-pushed shape after a branch.

use crate::assembler::{AsmOperand, BinaryOp, UnaryOp};
use crate::context::{Context, SiteId, StackId, ValueId};

/// One operand-stack entry, linked youngest-first.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StackNode {
    pub value: ValueId,
    /// Footprint in words.
    pub size: u32,
    /// Distance in words from the frame base, above the locals area.
    pub index: u32,
    pub next: Option<StackId>,
    pub push_event: Option<crate::context::EventId>,
    pub push_site: Option<SiteId>,
    pub pushed: bool,
}

impl<'arena> Context<'arena> {
    /// Link a fresh entry on top of `next`.
    pub fn new_stack_node(&mut self, value: ValueId, size: u32, next: Option<StackId>) -> StackId {
        let index = match next {
            Some(n) => {
                let node = self.node(n);
                node.index + node.size
            }
            None => 0,
        };
        let id = StackId(self.stack_nodes.len() as u32);
        self.stack_nodes.push(StackNode {
            value,
            size,
            index,
            next,
            push_event: None,
            push_site: None,
            pushed: false,
        });
        id
    }

    /// Materialize the unpushed suffix starting at `start`, oldest entry
    /// first. Already-pushed entries below it are left alone, so calling
    /// this twice is a no-op.
    pub fn push_now(&mut self, start: Option<StackId>) {
        let mut segment = Vec::new();
        let mut cur = start;
        while let Some(s) = cur {
            if self.node(s).pushed {
                break;
            }
            segment.push(s);
            cur = self.node(s).next;
        }
        for &s in segment.iter().rev() {
            self.push_entry(s);
        }
    }

    fn push_entry(&mut self, s: StackId) {
        let node = *self.node(s);
        assert!(!node.pushed, "entry pushed twice");
        let word = self.word();

        if self.value(node.value).sites.is_some() {
            let (source, _) = self.pick_site(node.value, None);
            let source = source.expect("pushing a value with no site");
            // Stale stack copies are about to be overwritten.
            self.remove_memory_sites(node.value);

            let push_site = self.stack_slot_site(node.index);
            self.node_mut(s).push_site = Some(push_site);
            self.add_site(None, node.size * word, node.value, push_site);

            self.apply1(UnaryOp::Push, node.size * word, source);
        } else {
            let offset = self.resolved_promise((node.size * word) as i64);
            let sp = AsmOperand::Register { low: self.asm.stack(), high: None };
            self.apply2_raw(BinaryOp::Subtract, word, AsmOperand::Constant(offset), sp);
        }

        log::trace!("pushed {:?} value {:?}", s, node.value);
        self.node_mut(s).pushed = true;
    }

    /// Unwind `count` words of the concrete stack. Values still awaited by
    /// a reader are popped into a chosen site; dead entries coalesce into a
    /// single stack-pointer adjustment.
    pub fn pop_now(&mut self, stack: Option<StackId>, count: u32, ignore: bool) {
        let mut cur = stack;
        let mut remaining = count;
        let mut ignored = 0u32;
        while remaining > 0 {
            let Some(s) = cur else { break };
            let node = *self.node(s);
            if node.pushed {
                let live = self.value(node.value).reads.is_some();
                if live && !ignore {
                    self.emit_stack_adjust(ignored);
                    ignored = 0;

                    let size = node.size * self.word();
                    let target = self.target_or_register(size, node.value);
                    log::trace!("pop {:?} value {:?} into {:?}", s, node.value, target);
                    self.add_site(stack, size, node.value, target);
                    self.apply1(UnaryOp::Pop, size, target);
                } else {
                    log::trace!("pop ignore {:?} value {:?}", s, node.value);
                    ignored += node.size;
                }

                if let Some(ps) = node.push_site {
                    self.remove_site(node.value, ps);
                }
                let n = self.node_mut(s);
                n.push_site = None;
                n.pushed = false;
            }
            remaining = remaining.saturating_sub(node.size);
            cur = node.next;
        }
        self.emit_stack_adjust(ignored);
    }

    /// Replace every entry with a fresh value living only in its stack
    /// slot: the canonical shape both sides of a branch agree on.
    pub fn reset_stack(&mut self) {
        let mut prev: Option<StackId> = None;
        let mut cur = self.cur_stack();
        while let Some(s) = cur {
            let old = *self.node(s);
            let value = self.new_value(None, None);
            let push_site = self.stack_slot_site(old.index);
            self.value_mut(value).sites = Some(push_site);

            let id = StackId(self.stack_nodes.len() as u32);
            self.stack_nodes.push(StackNode {
                value,
                size: old.size,
                index: old.index,
                next: None,
                push_event: None,
                push_site: Some(push_site),
                pushed: true,
            });

            match prev {
                None => self.set_stack(Some(id)),
                Some(p) => self.node_mut(p).next = Some(id),
            }
            prev = Some(id);
            cur = old.next;
        }
        self.stack_reset = true;
    }

    pub fn push_state(&mut self) {
        let top = self.cur_stack();
        self.states.push(top);
        log::trace!("push state, depth {}", self.states.len());
    }

    /// Drop back to the shape captured by the matching `push_state`.
    pub fn pop_state(&mut self) {
        let n = self.states.len();
        assert!(n >= 2, "pop_state without matching push_state");
        let saved = self.states[n - 2];
        self.states.truncate(n - 2);
        self.states.push(saved);
        log::trace!("pop state, depth {}", self.states.len());
    }

    /// Snapshot the operand stack and locals into the current instruction,
    /// once per instruction.
    pub fn save_stack(&mut self) {
        let Some(ip) = self.logical_ip else { return };
        if self.logical[ip as usize].stack_saved {
            return;
        }
        let stack = self.cur_stack();
        let snapshot: Vec<crate::context::LocalSnapshot> = self
            .locals
            .iter()
            .enumerate()
            .filter_map(|(i, b)| {
                b.map(|binding| crate::context::LocalSnapshot {
                    index: i as u32,
                    value: binding.value,
                    size: binding.size,
                })
            })
            .collect();
        let locals = &*self.arena.alloc_slice_copy(&snapshot);

        let li = &mut self.logical[ip as usize];
        li.stack_saved = true;
        li.stack = stack;
        li.locals = Some(locals);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::RecordingAssembler;
    use bumpalo::Bump;

    fn test_context(arena: &Bump) -> (Context<'_>, crate::recording::EmissionLog) {
        let asm = RecordingAssembler::new(8);
        let log = asm.log();
        (Context::new(arena, Box::new(asm)), log)
    }

    fn constant_value<'a>(cx: &mut Context<'a>, v: i64) -> ValueId {
        let p = cx.resolved_promise(v);
        let site = cx.constant_site(p);
        cx.new_value(Some(site), None)
    }

    #[test]
    fn test_node_indices_stack_up() {
        let arena = Bump::new();
        let (mut cx, _) = test_context(&arena);

        let a = constant_value(&mut cx, 1);
        let b = constant_value(&mut cx, 2);
        let n1 = cx.new_stack_node(a, 1, None);
        let n2 = cx.new_stack_node(b, 2, Some(n1));
        let n3 = cx.new_stack_node(a, 1, Some(n2));

        assert_eq!(cx.node(n1).index, 0);
        assert_eq!(cx.node(n2).index, 1);
        assert_eq!(cx.node(n3).index, 3);
    }

    #[test]
    fn test_push_now_is_idempotent() {
        let arena = Bump::new();
        let (mut cx, log) = test_context(&arena);

        let a = constant_value(&mut cx, 1);
        let b = constant_value(&mut cx, 2);
        let n1 = cx.new_stack_node(a, 1, None);
        let n2 = cx.new_stack_node(b, 1, Some(n1));

        cx.push_now(Some(n2));
        let emitted = log.borrow().len();
        assert_eq!(emitted, 2);
        assert!(cx.node(n1).pushed && cx.node(n1).push_site.is_some());
        assert!(cx.node(n2).pushed && cx.node(n2).push_site.is_some());
        // Oldest entry lands first: slot 0, then slot 1.
        assert_eq!(log.borrow()[0], "Push8 const(1)");
        assert_eq!(log.borrow()[1], "Push8 const(2)");

        cx.push_now(Some(n2));
        assert_eq!(log.borrow().len(), emitted);
    }

    #[test]
    fn test_pop_now_coalesces_dead_entries() {
        let arena = Bump::new();
        let (mut cx, log) = test_context(&arena);

        let a = constant_value(&mut cx, 1);
        let b = constant_value(&mut cx, 2);
        let n1 = cx.new_stack_node(a, 1, None);
        let n2 = cx.new_stack_node(b, 1, Some(n1));
        cx.push_now(Some(n2));
        log.borrow_mut().clear();

        // Neither value has pending reads, so both entries just vanish.
        cx.pop_now(Some(n2), 2, false);
        let ops = log.borrow();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0], "Add8 const(16), reg(7)");
    }

    #[test]
    fn test_state_snapshots_restore_stack() {
        let arena = Bump::new();
        let (mut cx, _) = test_context(&arena);

        let a = constant_value(&mut cx, 1);
        let n1 = cx.new_stack_node(a, 1, None);
        cx.set_stack(Some(n1));

        cx.push_state();
        let b = constant_value(&mut cx, 2);
        let n2 = cx.new_stack_node(b, 1, Some(n1));
        cx.set_stack(Some(n2));

        cx.pop_state();
        assert_eq!(cx.cur_stack(), Some(n1));
        assert_eq!(cx.states.len(), 1);
    }

    #[test]
    fn test_reset_stack_rebuilds_entries_pushed() {
        let arena = Bump::new();
        let (mut cx, _) = test_context(&arena);

        let a = constant_value(&mut cx, 1);
        let n1 = cx.new_stack_node(a, 1, None);
        cx.set_stack(Some(n1));

        cx.reset_stack();
        assert!(cx.stack_reset);
        let top = cx.cur_stack().unwrap();
        assert_ne!(top, n1);
        let node = *cx.node(top);
        assert!(node.pushed);
        assert!(node.push_site.is_some());
        assert_ne!(node.value, a);
        assert_eq!(cx.value(node.value).sites, node.push_site);
    }
}

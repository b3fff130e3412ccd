//! Deferred integers resolved during and after machine-code layout.
//!
//! A [`Promise`] stands for a value that is not known while events are being
//! appended: the address of a constant-pool slot, the machine offset of a
//! logical instruction, or the offset of a forward-referenced point in the
//! emitted code. Promises are `Copy` handles to arena nodes; once the
//! compile pass and `write_to` have filled in the shared [`CodeBase`], every
//! handle resolves on its own, with no access to the compiler.
//!
//! Resolution is idempotent: `resolved()` never flips back to false and
//! `value()` keeps returning the same number.

use std::cell::Cell;

use crate::assembler::pad;
use crate::error::{CompileError, CompileResult};

/// Shared resolution state for one compilation.
///
/// Allocated in the compilation arena so promise nodes can hold plain
/// references to it. `machine_code` is the destination address recorded by
/// `write_to`; `code_length` is the assembler length recorded when the
/// compile pass finishes; `offsets` holds one machine offset per logical
/// instruction, -1 until the compile pass reaches it.
pub(crate) struct CodeBase<'arena> {
    pub machine_code: Cell<Option<i64>>,
    pub code_length: Cell<usize>,
    pub word: Cell<u32>,
    pub offsets: Cell<Option<&'arena [Cell<i64>]>>,
}

impl CodeBase<'_> {
    pub fn new(word: u32) -> Self {
        Self {
            machine_code: Cell::new(None),
            code_length: Cell::new(0),
            word: Cell::new(word),
            offsets: Cell::new(None),
        }
    }

    fn offset_of(&self, ip: u32) -> Option<i64> {
        let offsets = self.offsets.get()?;
        let v = offsets.get(ip as usize)?.get();
        if v >= 0 {
            Some(v)
        } else {
            None
        }
    }
}

/// One promise node in the arena.
pub(crate) enum PromiseNode<'arena> {
    /// A value known from the start.
    Resolved(i64),
    /// Address of slot `key` in the constant pool appended after the code.
    Pool { base: &'arena CodeBase<'arena>, key: u32 },
    /// A point inside the emitted code. `offset` stays -1 until the compile
    /// pass stamps it; `next` chains promises pinned to the same event.
    Code {
        base: &'arena CodeBase<'arena>,
        offset: Cell<i64>,
        next: Cell<Option<&'arena PromiseNode<'arena>>>,
    },
    /// The machine offset of a logical instruction.
    Ip { base: &'arena CodeBase<'arena>, ip: u32 },
}

/// Copyable handle to a deferred integer.
#[derive(Clone, Copy)]
pub struct Promise<'arena> {
    pub(crate) node: &'arena PromiseNode<'arena>,
}

impl std::fmt::Debug for Promise<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.value() {
            Ok(v) => write!(f, "Promise({v})"),
            Err(_) => write!(f, "Promise(?)"),
        }
    }
}

impl<'arena> Promise<'arena> {
    pub(crate) fn new(node: &'arena PromiseNode<'arena>) -> Self {
        Self { node }
    }

    /// Whether `value` would succeed.
    pub fn resolved(&self) -> bool {
        match self.node {
            PromiseNode::Resolved(_) => true,
            PromiseNode::Pool { base, .. } => base.machine_code.get().is_some(),
            PromiseNode::Code { base, offset, .. } => {
                base.machine_code.get().is_some() && offset.get() >= 0
            }
            PromiseNode::Ip { base, ip } => {
                base.machine_code.get().is_some() && base.offset_of(*ip).is_some()
            }
        }
    }

    /// The resolved value.
    pub fn value(&self) -> CompileResult<i64> {
        match self.node {
            PromiseNode::Resolved(v) => Ok(*v),
            PromiseNode::Pool { base, key } => {
                let mc = base.machine_code.get().ok_or(CompileError::UnresolvedPromise)?;
                let word = base.word.get();
                let pool = pad(base.code_length.get(), word) as i64;
                Ok(mc + pool + *key as i64 * word as i64)
            }
            PromiseNode::Code { base, offset, .. } => {
                let mc = base.machine_code.get().ok_or(CompileError::UnresolvedPromise)?;
                let off = offset.get();
                if off < 0 {
                    return Err(CompileError::UnresolvedPromise);
                }
                Ok(mc + off)
            }
            PromiseNode::Ip { base, ip } => {
                let mc = base.machine_code.get().ok_or(CompileError::UnresolvedPromise)?;
                let off = base.offset_of(*ip).ok_or(CompileError::UnresolvedPromise)?;
                Ok(mc + off)
            }
        }
    }

    /// `value`, where the caller has already established resolution.
    pub(crate) fn expect_value(&self) -> i64 {
        self.value().expect("promise not resolved")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bumpalo::Bump;

    fn base_in<'a>(arena: &'a Bump, word: u32) -> &'a CodeBase<'a> {
        arena.alloc(CodeBase::new(word))
    }

    #[test]
    fn test_resolved_promise() {
        let arena = Bump::new();
        let node = arena.alloc(PromiseNode::Resolved(42));
        let p = Promise::new(node);
        assert!(p.resolved());
        assert_eq!(p.value().unwrap(), 42);
    }

    #[test]
    fn test_pool_promise_layout() {
        let arena = Bump::new();
        let base = base_in(&arena, 8);
        let p0 = Promise::new(arena.alloc(PromiseNode::Pool { base, key: 0 }));
        let p2 = Promise::new(arena.alloc(PromiseNode::Pool { base, key: 2 }));

        assert!(!p0.resolved());
        assert!(p0.value().is_err());

        base.code_length.set(13);
        base.machine_code.set(Some(0x1000));
        // Code pads to 16, then one word per pool slot.
        assert_eq!(p0.value().unwrap(), 0x1000 + 16);
        assert_eq!(p2.value().unwrap(), 0x1000 + 16 + 16);
    }

    #[test]
    fn test_code_promise_needs_offset_and_base() {
        let arena = Bump::new();
        let base = base_in(&arena, 8);
        let node = &*arena.alloc(PromiseNode::Code {
            base,
            offset: Cell::new(-1),
            next: Cell::new(None),
        });
        let p = Promise::new(node);

        base.machine_code.set(Some(0x2000));
        assert!(!p.resolved());

        if let PromiseNode::Code { offset, .. } = node {
            offset.set(7);
        }
        assert!(p.resolved());
        assert_eq!(p.value().unwrap(), 0x2007);
    }

    #[test]
    fn test_ip_promise() {
        let arena = Bump::new();
        let base = base_in(&arena, 4);
        let offsets = &*arena.alloc_slice_fill_with(3, |_| Cell::new(-1i64));
        base.offsets.set(Some(offsets));

        let p = Promise::new(arena.alloc(PromiseNode::Ip { base, ip: 1 }));
        base.machine_code.set(Some(0x4000));
        assert!(!p.resolved());

        offsets[1].set(24);
        assert!(p.resolved());
        assert_eq!(p.value().unwrap(), 0x4000 + 24);
    }
}

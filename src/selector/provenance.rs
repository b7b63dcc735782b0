//! Pointer provenance tags for the collector.
//!
//! Every target value that holds a heap reference is tagged once: as a
//! managed pointer, as a compressed (narrow) pointer, or as a pointer
//! derived from a managed base. Tags never change the emitted code; they
//! feed the stack maps and guard the compression paths.

use hashbrown::HashMap;

use crate::core::error::{CompileError, CompileResult};
use crate::target::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PtrTag {
    Managed,
    Narrow,
    Derived { base: Value },
}

/// Value to tag table of one unit.
#[derive(Debug, Clone, Default)]
pub struct Provenance {
    tags: HashMap<Value, PtrTag>,
    disabled: bool,
}

impl Provenance {
    pub fn new(enabled: bool) -> Self {
        Self {
            tags: HashMap::new(),
            disabled: !enabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.disabled
    }

    pub fn tag(&self, value: Value) -> Option<PtrTag> {
        self.tags.get(&value).copied()
    }

    pub fn is_managed(&self, value: Value) -> bool {
        self.tag(value) == Some(PtrTag::Managed)
    }

    pub fn is_narrow(&self, value: Value) -> bool {
        self.tag(value) == Some(PtrTag::Narrow)
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Value, PtrTag)> + '_ {
        self.tags.iter().map(|(v, t)| (*v, *t))
    }

    fn mark(&mut self, value: Value, tag: PtrTag) -> CompileResult<()> {
        if self.disabled {
            return Ok(());
        }
        match self.tags.get(&value) {
            Some(existing) if *existing != tag => Err(CompileError::ProvenanceConflict {
                value,
                existing: *existing,
                requested: tag,
            }),
            Some(_) => Ok(()),
            None => {
                self.tags.insert(value, tag);
                Ok(())
            }
        }
    }

    pub fn mark_mptr(&mut self, value: Value) -> CompileResult<()> {
        self.mark(value, PtrTag::Managed)
    }

    /// Tag a compressed pointer. Under fast compression narrow and full
    /// pointers share a representation, so the value is managed instead.
    pub fn mark_nptr(&mut self, value: Value, fast_compression: bool) -> CompileResult<()> {
        if fast_compression {
            self.mark_mptr(value)
        } else {
            self.mark(value, PtrTag::Narrow)
        }
    }

    /// Tag `ptr` as derived from `base`, which must already be managed.
    pub fn mark_dptr(&mut self, ptr: Value, base: Value) -> CompileResult<()> {
        if self.disabled {
            return Ok(());
        }
        if !self.is_managed(base) {
            return Err(CompileError::UntaggedPointer {
                value: base,
                reason: "base of a derived pointer",
            });
        }
        self.mark(ptr, PtrTag::Derived { base })
    }

    pub fn require_managed(&self, value: Value, reason: &'static str) -> CompileResult<()> {
        if self.disabled || self.is_managed(value) {
            Ok(())
        } else {
            Err(CompileError::UntaggedPointer { value, reason })
        }
    }

    pub fn require_narrow(&self, value: Value, reason: &'static str) -> CompileResult<()> {
        if self.disabled || self.is_narrow(value) {
            Ok(())
        } else {
            Err(CompileError::UntaggedPointer { value, reason })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn narrow_and_managed_are_exclusive() {
        let mut p = Provenance::new(true);
        p.mark_mptr(Value(1)).unwrap();
        p.mark_mptr(Value(1)).unwrap();
        assert!(matches!(
            p.mark_nptr(Value(1), false),
            Err(CompileError::ProvenanceConflict { .. })
        ));
        // Fast compression folds narrow into managed.
        p.mark_nptr(Value(1), true).unwrap();
    }

    #[test]
    fn derived_needs_managed_base() {
        let mut p = Provenance::new(true);
        assert!(p.mark_dptr(Value(2), Value(1)).is_err());
        p.mark_mptr(Value(1)).unwrap();
        p.mark_dptr(Value(2), Value(1)).unwrap();
        assert_eq!(p.tag(Value(2)), Some(PtrTag::Derived { base: Value(1) }));
    }

    #[test]
    fn disabled_table_accepts_everything() {
        let mut p = Provenance::new(false);
        p.mark_dptr(Value(2), Value(1)).unwrap();
        p.require_narrow(Value(3), "test").unwrap();
        assert!(p.is_empty());
    }
}

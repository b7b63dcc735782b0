// This module defines the debug information attached to emitted code: stack map ids and the
// payload the relocator classifies. A StackMapId packs the kind of site (block start, in-block
// marker, Java static or dynamic call, runtime call, rethrow) into its top byte and a per-unit
// sequence number into the rest, so the code emitter can recover the kind of a stack map
// record from the id alone. patch_bytes reserves room at a call site for the sequence the
// runtime patches later (the inline-cache load in front of a dynamic call). DebugInfo is the
// per-site request handed to the relocator once the site's buffer offset is known.

//! Stack map ids and relocation requests.

use std::fmt;

use crate::graph::MethodRef;

/// Size in bytes of the native `mov reg, imm` holding an inline-cache value.
pub fn native_mov_size(pointer_size: u32) -> usize {
    if pointer_size == 64 {
        10
    } else {
        5
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StackMapKind {
    BlockStart = 1,
    InBlock = 2,
    StaticCall = 3,
    DynamicCall = 4,
    RuntimeCall = 5,
    Rethrow = 6,
}

impl StackMapKind {
    fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            1 => StackMapKind::BlockStart,
            2 => StackMapKind::InBlock,
            3 => StackMapKind::StaticCall,
            4 => StackMapKind::DynamicCall,
            5 => StackMapKind::RuntimeCall,
            6 => StackMapKind::Rethrow,
            _ => return None,
        })
    }

    pub fn is_call(self) -> bool {
        matches!(
            self,
            StackMapKind::StaticCall
                | StackMapKind::DynamicCall
                | StackMapKind::RuntimeCall
                | StackMapKind::Rethrow
        )
    }
}

const KIND_SHIFT: u32 = 56;
const SEQ_MASK: u64 = (1 << KIND_SHIFT) - 1;

/// Stack map id: kind in the top byte, sequence number below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StackMapId(u64);

impl StackMapId {
    pub fn new(kind: StackMapKind, seq: u64) -> Self {
        Self(((kind as u64) << KIND_SHIFT) | (seq & SEQ_MASK))
    }

    pub fn from_raw(raw: u64) -> Option<Self> {
        StackMapKind::from_u8((raw >> KIND_SHIFT) as u8).map(|_| Self(raw))
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn kind(self) -> StackMapKind {
        // Constructed only through `new`/`from_raw`, so the tag is valid.
        StackMapKind::from_u8((self.0 >> KIND_SHIFT) as u8).unwrap_or(StackMapKind::InBlock)
    }

    pub fn seq(self) -> u64 {
        self.0 & SEQ_MASK
    }

    /// Bytes the call site reserves for runtime patching.
    pub fn patch_bytes(self) -> u32 {
        match self.kind() {
            // mov rax, imm64 + call rel32
            StackMapKind::DynamicCall => 15,
            // mov r11, imm64 + call r11
            StackMapKind::RuntimeCall => 13,
            StackMapKind::StaticCall | StackMapKind::Rethrow => 5,
            StackMapKind::BlockStart | StackMapKind::InBlock => 0,
        }
    }
}

impl fmt::Display for StackMapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}#{}", self.kind(), self.seq())
    }
}

/// What a relocatable site in the emitted code refers to.
#[derive(Debug, Clone, PartialEq)]
pub enum DebugInfo {
    BlockStart(u32),
    InBlock,
    /// Call dispatched through an inline cache.
    DynamicCall,
    /// Statically bound call; `None` for runtime routines.
    StaticCall { method: Option<MethodRef> },
    Rethrow,
    /// Embedded object reference.
    Oop(u64),
    /// Slot holding the original pc of the frame.
    OrigPc,
}

impl DebugInfo {
    pub fn name(&self) -> &'static str {
        match self {
            DebugInfo::BlockStart(_) => "block start",
            DebugInfo::InBlock => "in-block",
            DebugInfo::DynamicCall => "dynamic call",
            DebugInfo::StaticCall { .. } => "static call",
            DebugInfo::Rethrow => "rethrow",
            DebugInfo::Oop(_) => "oop",
            DebugInfo::OrigPc => "original pc",
        }
    }
}

// This module defines SelectorConfig, the immutable description of the host runtime that the
// selector needs while lowering one compilation unit. It replaces every ambient lookup of VM
// state: the target word size, how many general-purpose parameters fit into the packed
// calling-convention group, heap-oop and klass-pointer compression parameters (base, shift,
// whether compression is enabled at all), the klass offset inside an object header, whether
// the collector needs explicit pointer provenance, the thread-local-storage accessor used by
// the prolog and the thread field offsets (TLAB top/end, pending handler index), the
// rethrow stub and the fixed frame size. The configuration is threaded explicitly into the
// selector so the core can be exercised in tests without a live VM.

//! Host runtime configuration for a selection pass.

use super::error::{CompileError, CompileResult};

/// Compressed pointer encoding: `full = base + (narrow << shift)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Compression {
    pub base: u64,
    pub shift: u32,
}

impl Compression {
    pub const fn new(base: u64, shift: u32) -> Self {
        Self { base, shift }
    }

    /// Narrow and full representations are bit-identical.
    pub fn is_identity(&self) -> bool {
        self.base == 0 && self.shift == 0
    }

    /// Encode a full pointer; null stays null.
    pub fn encode(&self, full: u64) -> u64 {
        if full == 0 {
            return 0;
        }
        (full.wrapping_sub(self.base) >> self.shift) & 0xFFFF_FFFF
    }

    /// Decode a narrow pointer; zero stays null.
    pub fn decode(&self, narrow: u64) -> u64 {
        if narrow == 0 {
            return 0;
        }
        self.base.wrapping_add(narrow << self.shift)
    }
}

/// Thread layout used by the prolog and thread-relative nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadLayout {
    /// Address of the host routine returning the current thread.
    pub tls_accessor: u64,
    /// Thread-local storage index passed to the accessor.
    pub thread_index: u32,
    pub tlab_top_offset: i64,
    pub tlab_end_offset: i64,
    /// 32-bit slot the runtime fills with the index of the taken handler.
    pub pending_handler_offset: i64,
}

/// Immutable configuration for one selection pass.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectorConfig {
    /// Target pointer size in bits.
    pub pointer_size: u32,
    /// Number of general-purpose parameters in the packed group.
    pub general_param_quota: usize,
    /// Heap oop compression, `None` when oops are never compressed.
    pub oop_compression: Option<Compression>,
    /// Klass pointer compression, `None` without compressed class pointers.
    pub klass_compression: Option<Compression>,
    pub klass_offset_in_bytes: i64,
    /// Whether the collector needs provenance tags for its stack maps.
    pub track_provenance: bool,
    pub thread: ThreadLayout,
    /// Runtime stub that rethrows the pending exception.
    pub rethrow_stub: u64,
    /// Bytes reserved by the prolog for the fixed frame.
    pub frame_size: u32,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            pointer_size: 64,
            general_param_quota: 6,
            oop_compression: Some(Compression::new(0, 3)),
            klass_compression: Some(Compression::new(0x8_0000_0000, 0)),
            klass_offset_in_bytes: 8,
            track_provenance: true,
            thread: ThreadLayout {
                tls_accessor: 0x7f00_0000_1000,
                thread_index: 0,
                tlab_top_offset: 0x78,
                tlab_end_offset: 0x80,
                pending_handler_offset: 0x3a0,
            },
            rethrow_stub: 0x7f00_0000_2000,
            frame_size: 64,
        }
    }
}

impl SelectorConfig {
    pub fn with_pointer_size(mut self, bits: u32) -> Self {
        self.pointer_size = bits;
        self
    }

    pub fn with_param_quota(mut self, quota: usize) -> Self {
        self.general_param_quota = quota;
        self
    }

    pub fn with_oop_compression(mut self, compression: Option<Compression>) -> Self {
        self.oop_compression = compression;
        self
    }

    pub fn with_klass_compression(mut self, compression: Option<Compression>) -> Self {
        self.klass_compression = compression;
        self
    }

    pub fn with_provenance(mut self, track: bool) -> Self {
        self.track_provenance = track;
        self
    }

    pub fn with_thread(mut self, thread: ThreadLayout) -> Self {
        self.thread = thread;
        self
    }

    pub fn with_rethrow_stub(mut self, entry: u64) -> Self {
        self.rethrow_stub = entry;
        self
    }

    pub fn with_frame_size(mut self, bytes: u32) -> Self {
        self.frame_size = bytes;
        self
    }

    /// Narrow oops share the full representation (no base, no shift).
    pub fn is_fast_compression(&self) -> bool {
        self.oop_compression.map_or(true, |c| c.is_identity())
    }

    /// Reject configurations the selector cannot lower against.
    pub fn validate(&self) -> CompileResult<()> {
        if self.pointer_size != 32 && self.pointer_size != 64 {
            return Err(CompileError::InvalidConfig {
                reason: format!("unsupported pointer size {}", self.pointer_size),
            });
        }
        if self.general_param_quota == 0 {
            return Err(CompileError::InvalidConfig {
                reason: "general parameter quota must be at least 1".to_string(),
            });
        }
        for (what, compression) in [("oop", self.oop_compression), ("klass", self.klass_compression)] {
            if let Some(c) = compression {
                if c.shift >= self.pointer_size {
                    return Err(CompileError::InvalidConfig {
                        reason: format!("{what} shift {} exceeds the word size", c.shift),
                    });
                }
            }
        }
        Ok(())
    }
}

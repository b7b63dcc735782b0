//! Compressed oop and klass pointer lowering.
//!
//! A narrow pointer is `(full - base) >> shift` truncated to 32 bits. With
//! neither base nor shift ("fast" compression) narrow and full pointers
//! share one representation and the conversions disappear.

use super::{RelocAnchor, RelocSite, Selector};
use crate::core::config::Compression;
use crate::core::error::{CompileError, CompileResult};
use crate::debug_info::DebugInfo;
use crate::graph::{BasicType, NodeId};
use crate::reloc::RelocRequest;
use crate::target::{BinOp, CastOp, IntPredicate, Type, Value};

impl<'g, 'arena> Selector<'g, 'arena> {
    fn oop_compression(&self) -> Compression {
        self.config.oop_compression.unwrap_or(Compression::new(0, 0))
    }

    fn klass_compression(&self, context: &'static str) -> CompileResult<Compression> {
        self.config
            .klass_compression
            .ok_or(CompileError::UnsupportedType {
                ty: BasicType::NarrowKlass,
                context,
            })
    }

    pub(super) fn narrow_oop_constant(&mut self, addr: u64) -> CompileResult<Value> {
        if self.fast_compression {
            let c = self.builder.const_ptr(addr);
            if addr != 0 {
                self.reloc_sites.push(RelocSite {
                    anchor: RelocAnchor::Constant(c),
                    request: RelocRequest::Debug(DebugInfo::Oop(addr)),
                });
            }
            return Ok(c);
        }
        let narrow = self.oop_compression().encode(addr);
        Ok(self.builder.const_int(Type::I32, narrow))
    }

    pub(super) fn narrow_klass_constant(&mut self, node: NodeId, addr: u64) -> CompileResult<Value> {
        let c = self.klass_compression("narrow klass constant").map_err(|_| {
            CompileError::MalformedNode {
                node,
                reason: "narrow klass constant without klass compression".to_string(),
            }
        })?;
        Ok(self.builder.const_int(Type::I32, c.encode(addr)))
    }

    /// `base + (zext(narrow) << shift)` as a pointer.
    fn widen_narrow(&mut self, narrow: Value, c: Compression) -> CompileResult<Value> {
        let word = self.word_type();
        let mut w = self.int_resize(narrow, word, false)?;
        if c.shift != 0 {
            let shift = self.builder.const_int(word, c.shift as u64);
            w = self.builder.binary(BinOp::Shl, w, shift)?;
        }
        if c.base == 0 {
            self.builder.cast(CastOp::IntToPtr, w, Type::Ptr)
        } else {
            let base = self.builder.const_ptr(c.base);
            self.builder.gep(base, w)
        }
    }

    pub(super) fn decode_heap_oop(&mut self, narrow: Value, not_null: bool) -> CompileResult<Value> {
        if self.fast_compression {
            self.provenance.require_managed(narrow, "decoding a narrow oop")?;
            return Ok(narrow);
        }
        self.provenance.require_narrow(narrow, "decoding a narrow oop")?;
        let c = self.oop_compression();
        let mut full = self.widen_narrow(narrow, c)?;
        if !not_null {
            let zero = self.builder.null(self.builder.value_type(narrow));
            let is_null = self.builder.icmp(IntPredicate::Eq, narrow, zero)?;
            let null = self.builder.null(Type::Ptr);
            full = self.builder.select(is_null, null, full)?;
        }
        self.provenance.mark_mptr(full)?;
        Ok(full)
    }

    pub(super) fn encode_heap_oop(&mut self, oop: Value, not_null: bool) -> CompileResult<Value> {
        self.provenance.require_managed(oop, "encoding an oop")?;
        if self.fast_compression {
            return Ok(oop);
        }
        let c = self.oop_compression();
        let word = self.word_type();
        let mut w = self.builder.cast(CastOp::PtrToInt, oop, word)?;
        if c.base != 0 {
            let base = self.builder.const_int(word, c.base);
            if !not_null {
                // Null maps to the base so the subtraction yields zero.
                let null = self.builder.null(Type::Ptr);
                let is_null = self.builder.icmp(IntPredicate::Eq, oop, null)?;
                w = self.builder.select(is_null, base, w)?;
            }
            w = self.builder.binary(BinOp::Sub, w, base)?;
        }
        if c.shift != 0 {
            let shift = self.builder.const_int(word, c.shift as u64);
            w = self.builder.binary(BinOp::AShr, w, shift)?;
        }
        let narrow = self.int_resize(w, Type::I32, false)?;
        self.provenance.mark_nptr(narrow, false)?;
        Ok(narrow)
    }

    pub(super) fn decode_klass_not_null(&mut self, narrow: Value) -> CompileResult<Value> {
        let c = self.klass_compression("klass decoding")?;
        self.widen_narrow(narrow, c)
    }

    /// Klass pointer of `obj`, read from its header.
    pub(super) fn load_klass_not_null(&mut self, obj: Value) -> CompileResult<Value> {
        let addr = self.gep_const(obj, self.config.klass_offset_in_bytes)?;
        match self.config.klass_compression {
            Some(c) => {
                let narrow = self.builder.load(addr, Type::I32)?;
                self.widen_narrow(narrow, c)
            }
            None => self.builder.load(addr, Type::Ptr),
        }
    }
}

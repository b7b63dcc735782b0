// This module implements the Relocator, the last step of code installation. While the code
// emitter resolves the selector's relocation sites to buffer offsets it records one pending
// relocation per site; each is classified once, at creation, into a call kind (virtual,
// static, optimized virtual, runtime), an inline constant (float, double, object reference) or
// an internal address. Non-relocatable debug kinds are rejected there. Applying sorts the
// records by offset, rejects duplicate offsets and processes them in order against a copy of
// the buffer, which replaces the original only when every record succeeded. Constants are
// appended to the constant section at that point and the instruction at the record's offset is
// rewritten to reach them: the instruction is decoded with iced-x86 and its RIP-relative
// displacement, absolute displacement or 64-bit immediate receives the slot. Object
// references additionally get an index in the oop recorder and an oop relocation on their
// slot. A virtual call's inline-cache anchor is the native-size `mov reg, imm` immediately in
// front of the call, which is verified by decoding it. Calls with a known target have their
// rel32 displacement or absolute immediate patched.

//! Deferred code buffer patching.

use iced_x86::{Code, ConstantOffsets, Decoder, DecoderOptions, Formatter, Instruction, NasmFormatter};
use log::{debug, error, trace};

use crate::core::error::{CompileError, CompileResult};
use crate::core::session::CompilationSession;
use crate::debug_info::{native_mov_size, DebugInfo};
use crate::selector::RelocSite;

pub mod buffer;

pub use buffer::{CodeBuffer, OopRecorder, RelocEntry, RelocHolder};

/// What the selector asks to be relocated at a site.
#[derive(Debug, Clone, PartialEq)]
pub enum RelocRequest {
    Debug(DebugInfo),
    Float(f32),
    Double(f64),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RelocKind {
    OptVirtualCall,
    StaticCall,
    RuntimeCall,
    VirtualCall,
    Float(f32),
    Double(f64),
    Oop(u64),
    Internal,
}

impl RelocKind {
    /// Classify a site's debug info.
    pub fn classify(info: &DebugInfo) -> CompileResult<Self> {
        Ok(match info {
            DebugInfo::DynamicCall => RelocKind::VirtualCall,
            DebugInfo::StaticCall { method: None } | DebugInfo::Rethrow => RelocKind::RuntimeCall,
            DebugInfo::StaticCall {
                method: Some(method),
            } if method.is_static => RelocKind::StaticCall,
            DebugInfo::StaticCall { method: Some(_) } => RelocKind::OptVirtualCall,
            DebugInfo::Oop(value) => RelocKind::Oop(*value),
            DebugInfo::OrigPc => RelocKind::Internal,
            DebugInfo::BlockStart(_) | DebugInfo::InBlock => {
                return Err(CompileError::UnsupportedRelocation {
                    reason: format!("{} sites carry no relocation", info.name()),
                })
            }
        })
    }

    pub fn is_call(&self) -> bool {
        matches!(
            self,
            RelocKind::OptVirtualCall
                | RelocKind::StaticCall
                | RelocKind::RuntimeCall
                | RelocKind::VirtualCall
        )
    }
}

/// Pending relocation at an instruction offset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reloc {
    pub offset: usize,
    pub kind: RelocKind,
    /// Resolved call destination, patched into the call when present.
    pub target: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct Relocator {
    relocs: Vec<Reloc>,
}

impl Relocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn relocs(&self) -> &[Reloc] {
        &self.relocs
    }

    pub fn len(&self) -> usize {
        self.relocs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relocs.is_empty()
    }

    fn push(&mut self, offset: usize, kind: RelocKind, target: Option<u64>) {
        trace!("reloc {kind:?} at {offset:#x}");
        self.relocs.push(Reloc {
            offset,
            kind,
            target,
        });
    }

    pub fn add(&mut self, info: &DebugInfo, offset: usize) -> CompileResult<()> {
        let kind = RelocKind::classify(info)?;
        self.push(offset, kind, None);
        Ok(())
    }

    /// Call relocation whose destination is already known.
    pub fn add_call(&mut self, info: &DebugInfo, offset: usize, target: u64) -> CompileResult<()> {
        let kind = RelocKind::classify(info)?;
        if !kind.is_call() {
            return Err(CompileError::UnsupportedRelocation {
                reason: format!("{} is not a call", info.name()),
            });
        }
        self.push(offset, kind, Some(target));
        Ok(())
    }

    pub fn add_float(&mut self, offset: usize, value: f32) {
        self.push(offset, RelocKind::Float(value), None);
    }

    pub fn add_double(&mut self, offset: usize, value: f64) {
        self.push(offset, RelocKind::Double(value), None);
    }

    pub fn add_request(&mut self, request: &RelocRequest, offset: usize) -> CompileResult<()> {
        match request {
            RelocRequest::Debug(info) => self.add(info, offset),
            RelocRequest::Float(v) => {
                self.add_float(offset, *v);
                Ok(())
            }
            RelocRequest::Double(v) => {
                self.add_double(offset, *v);
                Ok(())
            }
        }
    }

    /// Record a selector site once the emitter placed it at `offset`.
    pub fn add_site(&mut self, site: &RelocSite, offset: usize) -> CompileResult<()> {
        self.add_request(&site.request, offset)
    }

    /// Patch `buf` with every pending relocation. On error `buf` is left
    /// untouched.
    pub fn apply(&self, buf: &mut CodeBuffer, session: &CompilationSession<'_>) -> CompileResult<()> {
        let mut sorted = self.relocs.clone();
        sorted.sort_by_key(|r| r.offset);
        if let Some(pair) = sorted.windows(2).find(|w| w[0].offset == w[1].offset) {
            let err = CompileError::DuplicateRelocation {
                offset: pair[0].offset,
            };
            error!("relocation failed: {err}");
            return Err(err);
        }

        let mut work = buf.clone();
        for reloc in &sorted {
            if let Err(err) = apply_one(&mut work, reloc, session) {
                error!("relocation failed: {err}");
                return Err(err);
            }
        }
        debug!(
            "applied {} relocations, {} constant bytes, {} oops",
            sorted.len(),
            work.consts().len(),
            work.oop_recorder().len()
        );
        *buf = work;
        Ok(())
    }
}

fn apply_one(buf: &mut CodeBuffer, reloc: &Reloc, session: &CompilationSession<'_>) -> CompileResult<()> {
    let offset = reloc.offset;
    let holder = match reloc.kind {
        RelocKind::Float(v) => place_constant(buf, offset, &v.to_le_bytes(), session)?,
        RelocKind::Double(v) => place_constant(buf, offset, &v.to_le_bytes(), session)?,
        RelocKind::Oop(v) => {
            let holder = if buf.bitness() == 64 {
                place_constant(buf, offset, &v.to_le_bytes(), session)?
            } else {
                place_constant(buf, offset, &(v as u32).to_le_bytes(), session)?
            };
            let RelocHolder::InternalWord {
                target: Some(slot),
            } = holder
            else {
                return Err(CompileError::UnsupportedRelocation {
                    reason: "oop constant without a slot".to_string(),
                });
            };
            let index = buf.allocate_oop_index(v);
            let slot_offset = (slot - buf.consts_base()) as usize;
            buf.add_consts_reloc(slot_offset, RelocHolder::Oop { index });
            holder
        }
        RelocKind::VirtualCall => {
            let ic_offset = offset
                .checked_sub(native_mov_size(buf.bitness()))
                .ok_or_else(|| CompileError::InvalidPatchSite {
                    offset,
                    reason: "no room for the inline-cache load".to_string(),
                })?;
            check_ic_load(buf, ic_offset)?;
            if let Some(target) = reloc.target {
                patch_call(buf, offset, target)?;
            }
            RelocHolder::VirtualCall {
                ic_addr: buf.insts_address(ic_offset),
            }
        }
        RelocKind::StaticCall | RelocKind::OptVirtualCall | RelocKind::RuntimeCall => {
            if let Some(target) = reloc.target {
                patch_call(buf, offset, target)?;
            }
            match reloc.kind {
                RelocKind::StaticCall => RelocHolder::StaticCall,
                RelocKind::OptVirtualCall => RelocHolder::OptVirtualCall,
                _ => RelocHolder::RuntimeCall,
            }
        }
        RelocKind::Internal => RelocHolder::InternalWord { target: None },
    };
    buf.add_insts_reloc(offset, holder);
    session.record_relocation_applied();
    Ok(())
}

/// Append a constant and point the instruction at `offset` to it.
fn place_constant(
    buf: &mut CodeBuffer,
    offset: usize,
    bytes: &[u8],
    session: &CompilationSession<'_>,
) -> CompileResult<RelocHolder> {
    let (_, slot) = buf.place_constant(bytes);
    patch_data_ref(buf, offset, slot)?;
    session.record_constant_materialized();
    Ok(RelocHolder::InternalWord { target: Some(slot) })
}

fn decode_at(buf: &CodeBuffer, offset: usize) -> CompileResult<(Instruction, ConstantOffsets)> {
    let bytes = buf
        .code()
        .get(offset..)
        .filter(|b| !b.is_empty())
        .ok_or_else(|| CompileError::InvalidPatchSite {
            offset,
            reason: "offset outside the code".to_string(),
        })?;
    let mut decoder = Decoder::with_ip(
        buf.bitness(),
        bytes,
        buf.insts_address(offset),
        DecoderOptions::NONE,
    );
    let instr = decoder.decode();
    if instr.is_invalid() {
        return Err(CompileError::InvalidPatchSite {
            offset,
            reason: "undecodable instruction".to_string(),
        });
    }
    if log::log_enabled!(log::Level::Trace) {
        let mut text = String::new();
        NasmFormatter::new().format(&instr, &mut text);
        trace!("patch site {:#x}: {text}", instr.ip());
    }
    let offsets = decoder.get_constant_offsets(&instr);
    Ok((instr, offsets))
}

/// Make the instruction at `offset` refer to `target` data.
fn patch_data_ref(buf: &mut CodeBuffer, offset: usize, target: u64) -> CompileResult<()> {
    let (instr, offsets) = decode_at(buf, offset)?;
    if instr.is_ip_rel_memory_operand() && offsets.displacement_size() == 4 {
        let disp = rel32(offset, target.wrapping_sub(instr.next_ip()) as i64)?;
        return buf.write_code(offset + offsets.displacement_offset(), &disp.to_le_bytes());
    }
    if offsets.has_immediate() && offsets.immediate_size() as u32 * 8 == buf.bitness() {
        let at = offset + offsets.immediate_offset();
        return if buf.bitness() == 64 {
            buf.write_code(at, &target.to_le_bytes())
        } else {
            buf.write_code(at, &(target as u32).to_le_bytes())
        };
    }
    if offsets.has_displacement() && offsets.displacement_size() == 4 {
        let abs = u32::try_from(target).map_err(|_| CompileError::InvalidPatchSite {
            offset,
            reason: format!("constant at {target:#x} out of reach of an absolute address"),
        })?;
        return buf.write_code(offset + offsets.displacement_offset(), &abs.to_le_bytes());
    }
    Err(CompileError::InvalidPatchSite {
        offset,
        reason: format!("{:?} has no address operand", instr.code()),
    })
}

fn rel32(offset: usize, disp: i64) -> CompileResult<i32> {
    i32::try_from(disp).map_err(|_| CompileError::InvalidPatchSite {
        offset,
        reason: format!("displacement {disp:#x} exceeds 32 bits"),
    })
}

/// Point the call at `offset` to `target`.
fn patch_call(buf: &mut CodeBuffer, offset: usize, target: u64) -> CompileResult<()> {
    let (instr, offsets) = decode_at(buf, offset)?;
    match instr.code() {
        Code::Call_rel32_64 | Code::Call_rel32_32 => {
            let disp = rel32(offset, target.wrapping_sub(instr.next_ip()) as i64)?;
            buf.write_code(offset + instr.len() - 4, &disp.to_le_bytes())
        }
        // mov r11, imm64 ahead of an indirect call
        Code::Mov_r64_imm64 => buf.write_code(offset + offsets.immediate_offset(), &target.to_le_bytes()),
        code => Err(CompileError::InvalidPatchSite {
            offset,
            reason: format!("{code:?} is not a patchable call"),
        }),
    }
}

/// The inline-cache anchor must be a native-size `mov reg, imm`.
fn check_ic_load(buf: &CodeBuffer, ic_offset: usize) -> CompileResult<()> {
    let (instr, _) = decode_at(buf, ic_offset)?;
    let expected = if buf.bitness() == 64 {
        Code::Mov_r64_imm64
    } else {
        Code::Mov_r32_imm32
    };
    if instr.code() != expected || instr.len() != native_mov_size(buf.bitness()) {
        return Err(CompileError::InvalidPatchSite {
            offset: ic_offset,
            reason: format!("inline-cache anchor is {:?}", instr.code()),
        });
    }
    Ok(())
}

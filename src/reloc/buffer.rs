//! Code buffer model patched by the relocator.
//!
//! The instruction section has its final address when relocation runs.
//! The constant section grows append-only while relocations are applied;
//! every constant is naturally aligned inside it.

use crate::core::error::{CompileError, CompileResult};

/// Side table of object references embedded in the code.
///
/// Index 0 stands for null, so the first recorded oop gets index 1.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OopRecorder {
    oops: Vec<u64>,
}

impl OopRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `oop` and return its index. Repeated oops get fresh indices.
    pub fn allocate_index(&mut self, oop: u64) -> usize {
        self.oops.push(oop);
        self.oops.len()
    }

    pub fn oop_at(&self, index: usize) -> Option<u64> {
        index.checked_sub(1).and_then(|i| self.oops.get(i)).copied()
    }

    pub fn len(&self) -> usize {
        self.oops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.oops.is_empty()
    }
}

/// Relocation metadata shape recorded for the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocHolder {
    OptVirtualCall,
    StaticCall,
    RuntimeCall,
    /// Call through an inline cache loaded at `ic_addr`.
    VirtualCall { ic_addr: u64 },
    /// Word pointing into the buffer; `None` when the target is implicit.
    InternalWord { target: Option<u64> },
    Oop { index: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelocEntry {
    /// Offset inside the owning section.
    pub offset: usize,
    pub holder: RelocHolder,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeBuffer {
    bitness: u32,
    insts_base: u64,
    code: Vec<u8>,
    consts_base: u64,
    consts: Vec<u8>,
    insts_relocs: Vec<RelocEntry>,
    consts_relocs: Vec<RelocEntry>,
    oop_recorder: OopRecorder,
}

impl CodeBuffer {
    /// Wrap emitted `code` placed at `insts_base`, with its constant
    /// section starting at `consts_base`.
    pub fn new(bitness: u32, insts_base: u64, code: Vec<u8>, consts_base: u64) -> CompileResult<Self> {
        if bitness != 32 && bitness != 64 {
            return Err(CompileError::InvalidConfig {
                reason: format!("unsupported code bitness {bitness}"),
            });
        }
        Ok(Self {
            bitness,
            insts_base,
            code,
            consts_base,
            consts: Vec::new(),
            insts_relocs: Vec::new(),
            consts_relocs: Vec::new(),
            oop_recorder: OopRecorder::new(),
        })
    }

    pub fn bitness(&self) -> u32 {
        self.bitness
    }

    pub fn insts_base(&self) -> u64 {
        self.insts_base
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn consts_base(&self) -> u64 {
        self.consts_base
    }

    pub fn consts(&self) -> &[u8] {
        &self.consts
    }

    pub fn insts_relocs(&self) -> &[RelocEntry] {
        &self.insts_relocs
    }

    pub fn consts_relocs(&self) -> &[RelocEntry] {
        &self.consts_relocs
    }

    pub fn oop_recorder(&self) -> &OopRecorder {
        &self.oop_recorder
    }

    pub fn insts_address(&self, offset: usize) -> u64 {
        self.insts_base + offset as u64
    }

    /// Constant section bytes at `address`.
    pub fn const_at(&self, address: u64, len: usize) -> Option<&[u8]> {
        let start = usize::try_from(address.checked_sub(self.consts_base)?).ok()?;
        self.consts.get(start..start.checked_add(len)?)
    }

    /// Append a constant, aligned to its size. Returns its section offset
    /// and address.
    pub(crate) fn place_constant(&mut self, bytes: &[u8]) -> (usize, u64) {
        let align = bytes.len().max(1);
        let offset = self.consts.len().next_multiple_of(align);
        self.consts.resize(offset, 0);
        self.consts.extend_from_slice(bytes);
        (offset, self.consts_base + offset as u64)
    }

    pub(crate) fn allocate_oop_index(&mut self, oop: u64) -> usize {
        self.oop_recorder.allocate_index(oop)
    }

    pub(crate) fn add_insts_reloc(&mut self, offset: usize, holder: RelocHolder) {
        self.insts_relocs.push(RelocEntry { offset, holder });
    }

    pub(crate) fn add_consts_reloc(&mut self, offset: usize, holder: RelocHolder) {
        self.consts_relocs.push(RelocEntry { offset, holder });
    }

    /// Overwrite code bytes at `offset`.
    pub(crate) fn write_code(&mut self, offset: usize, bytes: &[u8]) -> CompileResult<()> {
        let end = offset + bytes.len();
        let slot = self
            .code
            .get_mut(offset..end)
            .ok_or_else(|| CompileError::InvalidPatchSite {
                offset,
                reason: format!("patch of {} bytes past the end of the code", bytes.len()),
            })?;
        slot.copy_from_slice(bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constants_are_naturally_aligned() {
        let mut buf = CodeBuffer::new(64, 0x1000, vec![0x90; 4], 0x8000).unwrap();
        let (f, fa) = buf.place_constant(&1.5f32.to_le_bytes());
        let (d, da) = buf.place_constant(&2.5f64.to_le_bytes());
        assert_eq!((f, fa), (0, 0x8000));
        assert_eq!((d, da), (8, 0x8008));
        assert_eq!(buf.const_at(da, 8), Some(&2.5f64.to_le_bytes()[..]));
    }

    #[test]
    fn oop_indices_start_at_one_and_never_dedup() {
        let mut oops = OopRecorder::new();
        assert_eq!(oops.allocate_index(0xdead), 1);
        assert_eq!(oops.allocate_index(0xdead), 2);
        assert_eq!(oops.oop_at(2), Some(0xdead));
        assert_eq!(oops.oop_at(0), None);
    }

    #[test]
    fn rejects_unknown_bitness() {
        assert!(CodeBuffer::new(16, 0, Vec::new(), 0).is_err());
    }
}

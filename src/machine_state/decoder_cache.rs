// SPDX-FileCopyrightText: 2026 TriliTech <contact@trili.tech>
//
// SPDX-License-Identifier: MIT

//! Pre-decoded instruction descriptors.
//!
//! Every executable guest page has a [`DecoderCache`]: an array of 8-byte
//! [`DecoderEntry`] descriptors, one per instruction slot. The interpreter
//! loads the descriptor for `pc` with a single aligned load and dispatches
//! either on the bytecode or through the process-wide handler table.
//!
//! Handlers are deduplicated process-wide: a handler function is assigned
//! an index at most once, and every descriptor sharing that index resolves
//! to the same host function. Index 0 is reserved for the invalid handler.
//! The table also remembers one representative raw encoding per handler
//! index so a serialized cache can re-bind indices to live function
//! pointers on load.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicU16;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Mutex;

use crate::interpreter;
use crate::interpreter::InstrHandler;
use crate::log;
use crate::machine_state::memory::page::PAGE_SIZE_USIZE;
use crate::machine_state::memory::Address;
use crate::machine_state::memory::OFFSET_MASK;
use crate::parser;
use crate::parser::Bytecode;
use crate::parser::Instruction;

/// Bytes per decoder slot.
pub const DIVISOR: usize = if cfg!(feature = "compressed") { 2 } else { 4 };

/// Shift converting a page offset into a slot index.
pub const SHIFT: u32 = if cfg!(feature = "compressed") { 1 } else { 2 };

/// Number of slots per page.
pub const SIZE: usize = PAGE_SIZE_USIZE / DIVISOR;

/// Longest basic block, in slots, that `idxend` can describe. One short of
/// the field maximum, as a block may close one two-slot instruction past
/// the threshold.
const MAX_BLOCK_SLOTS: usize = 254;

/// Pre-decoded descriptor of one instruction slot. Exactly 8 bytes;
/// aligned so the whole descriptor can be replaced with a single store.
#[repr(C, align(8))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct DecoderEntry {
    /// Opcode index into the bytecode dispatch table
    bytecode: u8,

    /// Index into the process-wide handler table
    handler: u8,

    /// Offset in slots to the last instruction start of this basic block
    #[cfg(feature = "compressed")]
    idxend: u8,

    /// Number of slots in this block, from this one on, that are not
    /// instruction starts
    #[cfg(feature = "compressed")]
    icount: u8,

    /// Offset in slots to the last instruction start of this basic block
    #[cfg(not(feature = "compressed"))]
    idxend: u16,

    /// Raw encoding; 16-bit encodings are zero-extended
    instr: u32,
}

const _: () = assert!(std::mem::size_of::<DecoderEntry>() == 8);

impl DecoderEntry {
    pub fn get_bytecode(&self) -> u8 {
        self.bytecode
    }

    pub fn set_bytecode(&mut self, bytecode: u8) {
        self.bytecode = bytecode;
    }

    pub fn instr(&self) -> u32 {
        self.instr
    }

    pub fn set_instr(&mut self, instr: u32) {
        self.instr = instr;
    }

    /// Bind this descriptor to the handler of a decoded instruction,
    /// assigning a table index if the handler has none yet. The current
    /// raw encoding is recorded as the representative for that index.
    pub fn set_handler(&mut self, insn: Instruction) {
        self.handler = INSTR_HANDLERS.index_for(insn.handler);
        INSTR_HANDLERS.record_encoding(self.handler, self.instr);
    }

    pub fn get_handler(&self) -> InstrHandler {
        INSTR_HANDLERS.get(self.handler)
    }

    pub fn handler_index(&self) -> u8 {
        self.handler
    }

    pub fn set_invalid_handler(&mut self) {
        self.handler = 0;
    }

    pub fn is_invalid_handler(&self) -> bool {
        self.handler == 0
    }

    /// Dispatch through the handler table.
    #[inline(always)]
    pub fn execute(
        &self,
        core: &mut crate::machine_state::MachineCoreState,
    ) -> Result<(), crate::machine_state::Exception> {
        (self.get_handler())(core, self.instr)
    }

    /// Update bytecode and handler index together with a single 16-bit
    /// store, so a concurrently executing dispatch sees either the old
    /// pair or the new pair, never a mix.
    pub fn set_atomic_bytecode_and_handler(&self, bytecode: u8, handler_idx: u8) {
        // XXX: Assumes a little-endian host
        let value = (handler_idx as u16) << 8 | bytecode as u16;
        // SAFETY: `bytecode` and `handler` are the first two bytes of an
        // 8-aligned repr(C) struct, so the cast pointer is valid and
        // 2-aligned.
        let atomic = unsafe { &*(self as *const Self as *const AtomicU16) };
        atomic.store(value, Ordering::Release);
    }

    /// Replace the whole descriptor with a single aligned 8-byte store.
    pub fn atomic_overwrite(&self, other: &DecoderEntry) {
        // SAFETY: Both descriptors are 8 bytes and 8-aligned.
        let value = unsafe { *(other as *const Self as *const u64) };
        let atomic = unsafe { &*(self as *const Self as *const AtomicU64) };
        atomic.store(value, Ordering::Release);
    }

    /// Bytes covered by this basic block, up to its last instruction
    /// start.
    pub fn block_bytes(&self) -> usize {
        self.idxend as usize * DIVISOR
    }

    /// Instructions in this basic block, from this slot on.
    #[cfg(feature = "compressed")]
    pub fn instruction_count(&self) -> usize {
        self.idxend as usize + 1 - self.icount as usize
    }

    /// Instructions in this basic block, from this slot on.
    #[cfg(not(feature = "compressed"))]
    pub fn instruction_count(&self) -> usize {
        self.idxend as usize + 1
    }

    /// The descriptor's on-disk form.
    #[cfg(feature = "compressed")]
    pub fn to_bytes(&self) -> [u8; 8] {
        let instr = self.instr.to_le_bytes();
        [
            self.bytecode,
            self.handler,
            self.idxend,
            self.icount,
            instr[0],
            instr[1],
            instr[2],
            instr[3],
        ]
    }

    /// The descriptor's on-disk form.
    #[cfg(not(feature = "compressed"))]
    pub fn to_bytes(&self) -> [u8; 8] {
        let idxend = self.idxend.to_le_bytes();
        let instr = self.instr.to_le_bytes();
        [
            self.bytecode,
            self.handler,
            idxend[0],
            idxend[1],
            instr[0],
            instr[1],
            instr[2],
            instr[3],
        ]
    }

    /// Rebuild a descriptor from its on-disk form.
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self {
            bytecode: bytes[0],
            handler: bytes[1],
            #[cfg(feature = "compressed")]
            idxend: bytes[2],
            #[cfg(feature = "compressed")]
            icount: bytes[3],
            #[cfg(not(feature = "compressed"))]
            idxend: u16::from_le_bytes([bytes[2], bytes[3]]),
            instr: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }
}

/// Decoder cache of one executable guest page, addressed by
/// `(pc & OFFSET_MASK) >> SHIFT`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecoderCache {
    cache: [DecoderEntry; SIZE],
}

impl DecoderCache {
    /// A cache with every slot bound to the invalid handler.
    pub fn new() -> Box<Self> {
        Box::new(Self {
            cache: [DecoderEntry::default(); SIZE],
        })
    }

    pub fn get(&self, idx: usize) -> &DecoderEntry {
        &self.cache[idx]
    }

    pub fn get_mut(&mut self, idx: usize) -> &mut DecoderEntry {
        &mut self.cache[idx]
    }

    /// The descriptor for the instruction slot holding `pc`.
    #[inline(always)]
    pub fn entry_for(&self, pc: Address) -> &DecoderEntry {
        &self.cache[((pc & OFFSET_MASK) >> SHIFT) as usize]
    }

    pub fn len(&self) -> usize {
        SIZE
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn entries(&self) -> &[DecoderEntry; SIZE] {
        &self.cache
    }

    /// Pre-decode an executable page: classify every instruction start,
    /// bind handlers, and backfill the basic-block geometry
    /// (`idxend`/`icount`) of every slot.
    pub fn generate(page: &[u8; PAGE_SIZE_USIZE]) -> Box<Self> {
        let mut cache = Self::new();
        let mut starts = [false; SIZE];

        // Decode pass: fill in bytecode, handler and raw encoding for
        // every instruction start.
        let mut slot = 0;
        while slot < SIZE {
            let offset = slot * DIVISOR;
            let (encoding, width_slots) = read_encoding(page, offset);
            starts[slot] = true;

            let entry = &mut cache.cache[slot];
            entry.set_instr(encoding);

            if offset + width_slots * DIVISOR > PAGE_SIZE_USIZE {
                // The instruction crosses the page boundary; it cannot be
                // decoded from this page alone.
                entry.set_bytecode(Bytecode::Invalid.into());
                entry.set_invalid_handler();
            } else {
                let insn = parser::decode(encoding);
                entry.set_bytecode(insn.bytecode.into());
                entry.set_handler(insn);
            }

            slot += width_slots;
        }

        // Block pass: group instruction starts into basic blocks and
        // backfill the per-slot geometry.
        let mut block_first = 0;
        let mut slot = 0;
        while slot < SIZE {
            let bytecode =
                Bytecode::try_from(cache.cache[slot].bytecode).unwrap_or(Bytecode::Invalid);
            let width_slots = if starts[slot] {
                (parser::instruction_width(cache.cache[slot].instr) as usize) / DIVISOR
            } else {
                1
            };
            let ends = bytecode.ends_block()
                || slot - block_first >= MAX_BLOCK_SLOTS
                || slot + width_slots.max(1) >= SIZE;
            if ends {
                let block_last = (slot + width_slots.max(1) - 1).min(SIZE - 1);
                Self::backfill_block(&mut cache.cache, &starts, block_first, slot, block_last);
                block_first = block_last + 1;
                slot = block_last + 1;
            } else {
                slot += width_slots.max(1);
            }
        }

        cache
    }

    /// Fill `idxend` and `icount` for every slot of one basic block.
    /// `end_start` is the slot of the block's last instruction start;
    /// `block_last` includes that instruction's trailing slots.
    fn backfill_block(
        entries: &mut [DecoderEntry; SIZE],
        starts: &[bool; SIZE],
        block_first: usize,
        end_start: usize,
        block_last: usize,
    ) {
        let mut non_starts: usize = 0;
        for slot in (block_first..=block_last).rev() {
            if slot <= end_start && !starts[slot] {
                non_starts += 1;
            }
            let entry = &mut entries[slot];
            let idxend = end_start.saturating_sub(slot);
            #[cfg(feature = "compressed")]
            {
                entry.idxend = idxend as u8;
                entry.icount = if slot <= end_start { non_starts as u8 } else { 0 };
            }
            #[cfg(not(feature = "compressed"))]
            {
                entry.idxend = idxend as u16;
            }
        }
    }
}

/// Read the encoding starting at `offset`, and its width in slots. Missing
/// upper halves beyond the page read as zero.
fn read_encoding(page: &[u8; PAGE_SIZE_USIZE], offset: usize) -> (u32, usize) {
    let lo = u16::from_le_bytes([page[offset], page[offset + 1]]);
    if lo & 0b11 != 0b11 {
        // 16-bit encoding, zero-extended. Without compressed support this
        // is an invalid slot of its own.
        (lo as u32, 1)
    } else {
        let hi = if offset + 4 <= PAGE_SIZE_USIZE {
            u16::from_le_bytes([page[offset + 2], page[offset + 3]])
        } else {
            0
        };
        ((hi as u32) << 16 | lo as u32, 4 / DIVISOR)
    }
}

struct HandlerTableInner {
    /// Number of assigned handler indices, excluding the invalid handler
    count: usize,

    /// Handler function address → assigned index
    indices: BTreeMap<usize, u8>,

    /// Assigned index → representative raw encoding
    encodings: BTreeMap<u8, u32>,
}

/// Process-wide table of instruction handlers, shared by every machine.
///
/// Slots are written at most once per unique handler (under the mutex) and
/// read lock-free with acquire loads, so machines can be constructed and
/// run concurrently.
pub struct HandlerTable {
    slots: [AtomicUsize; 256],
    inner: Mutex<HandlerTableInner>,
}

/// The process-wide handler table.
pub static INSTR_HANDLERS: HandlerTable = HandlerTable {
    slots: [const { AtomicUsize::new(0) }; 256],
    inner: Mutex::new(HandlerTableInner {
        count: 0,
        indices: BTreeMap::new(),
        encodings: BTreeMap::new(),
    }),
};

impl HandlerTable {
    /// The stable index of `handler`, assigning the next free one on first
    /// sight. Returns 0 (the invalid handler) when the table is full.
    pub fn index_for(&self, handler: InstrHandler) -> u8 {
        let key = handler as usize;
        let mut inner = self.inner.lock().expect("handler table is never poisoned");
        if let Some(&idx) = inner.indices.get(&key) {
            return idx;
        }
        if inner.count >= 255 {
            log::warning!("Handler table exhausted; falling back to the invalid handler");
            return 0;
        }
        inner.count += 1;
        let idx = inner.count as u8;
        inner.indices.insert(key, idx);
        self.slots[idx as usize].store(key, Ordering::Release);
        idx
    }

    /// Remember `encoding` as the representative for `idx`, so the
    /// assignment can be reconstructed from serialized bytes.
    pub fn record_encoding(&self, idx: u8, encoding: u32) {
        if idx == 0 {
            return;
        }
        let mut inner = self.inner.lock().expect("handler table is never poisoned");
        inner.encodings.insert(idx, encoding);
    }

    /// The handler stored at `idx`. Unassigned slots resolve to the
    /// invalid handler.
    #[inline(always)]
    pub fn get(&self, idx: u8) -> InstrHandler {
        let addr = self.slots[idx as usize].load(Ordering::Acquire);
        if addr == 0 {
            return interpreter::handle_invalid;
        }
        // SAFETY: Non-zero slots only ever hold addresses of
        // `InstrHandler` functions, stored by `index_for` or `bind`.
        unsafe { std::mem::transmute::<usize, InstrHandler>(addr) }
    }

    /// Install `handler` at a specific index while re-binding a
    /// deserialized cache.
    pub fn bind(&self, idx: u8, handler: InstrHandler, encoding: u32) {
        if idx == 0 {
            return;
        }
        let key = handler as usize;
        let mut inner = self.inner.lock().expect("handler table is never poisoned");
        inner.count = inner.count.max(idx as usize);
        inner.indices.insert(key, idx);
        inner.encodings.insert(idx, encoding);
        self.slots[idx as usize].store(key, Ordering::Release);
    }

    /// Snapshot of the `index → representative encoding` bindings, in
    /// index order.
    pub fn bindings(&self) -> Vec<(u8, u32)> {
        let inner = self.inner.lock().expect("handler table is never poisoned");
        inner.encodings.iter().map(|(&i, &e)| (i, e)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_is_eight_bytes() {
        assert_eq!(std::mem::size_of::<DecoderEntry>(), 8);
        assert_eq!(std::mem::align_of::<DecoderEntry>(), 8);
    }

    #[test]
    fn test_handler_indices_are_stable() {
        let a = INSTR_HANDLERS.index_for(interpreter::handle_op_imm);
        let b = INSTR_HANDLERS.index_for(interpreter::handle_op_imm);
        assert_eq!(a, b);
        assert_ne!(a, 0);

        let c = INSTR_HANDLERS.index_for(interpreter::handle_lui);
        assert_ne!(a, c);
        assert_eq!(INSTR_HANDLERS.index_for(interpreter::handle_lui), c);
    }

    #[test]
    fn test_invalid_handler_is_index_zero() {
        let mut entry = DecoderEntry::default();
        assert!(entry.is_invalid_handler());
        entry.set_instr(0x0015_0513);
        entry.set_handler(parser::decode(0x0015_0513));
        assert!(!entry.is_invalid_handler());
        entry.set_invalid_handler();
        assert!(entry.is_invalid_handler());
    }

    #[test]
    fn test_atomic_pair_patch() {
        let entry = DecoderEntry::default();
        entry.set_atomic_bytecode_and_handler(7, 9);
        assert_eq!(entry.get_bytecode(), 7);
        assert_eq!(entry.handler_index(), 9);
    }

    #[test]
    fn test_atomic_overwrite() {
        let target = DecoderEntry::default();
        let mut source = DecoderEntry::default();
        source.set_instr(0xdead_beef);
        source.set_bytecode(3);
        target.atomic_overwrite(&source);
        assert_eq!(target, source);
    }

    #[test]
    fn test_entry_bytes_roundtrip() {
        let mut entry = DecoderEntry::default();
        entry.set_instr(0x1234_5678);
        entry.set_bytecode(5);
        let bytes = entry.to_bytes();
        assert_eq!(DecoderEntry::from_bytes(bytes), entry);
        // The raw encoding occupies bytes 4..8 in little-endian order.
        assert_eq!(&bytes[4..], &[0x78, 0x56, 0x34, 0x12]);
    }

    fn page_of(words: &[u32]) -> [u8; PAGE_SIZE_USIZE] {
        let mut page = [0u8; PAGE_SIZE_USIZE];
        for (i, word) in words.iter().enumerate() {
            page[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
        }
        page
    }

    #[test]
    fn test_generate_classifies_block() {
        // addi a0, a0, 1; addi a0, a0, 2; jal x0, 0
        let page = page_of(&[0x0015_0513, 0x0025_0513, 0x0000_006f]);
        let cache = DecoderCache::generate(&page);

        let first = cache.get(0);
        assert_eq!(first.get_bytecode(), u8::from(Bytecode::OpImm));
        assert_eq!(first.instr(), 0x0015_0513);
        assert!(!first.is_invalid_handler());

        // The block spans three instructions and ends at the jal.
        assert_eq!(first.instruction_count(), 3);
        assert_eq!(first.block_bytes(), 8);

        let last = cache.entry_for(8);
        assert_eq!(last.get_bytecode(), u8::from(Bytecode::Jal));
        assert_eq!(last.instruction_count(), 1);
        assert_eq!(last.block_bytes(), 0);
    }

    #[test]
    fn test_generate_invariants() {
        // A page of zeroes decodes to invalid slots; sprinkle in real
        // instructions.
        let mut words = vec![0u32; 64];
        words[0] = 0x0015_0513; // addi
        words[1] = 0x0000_0073; // ecall
        words[10] = 0x1234_5537; // lui
        let page = page_of(&words);
        let cache = DecoderCache::generate(&page);
        for i in 0..cache.len() {
            let entry = cache.get(i);
            assert!(entry.instruction_count() >= 1);
            assert!(entry.block_bytes() <= PAGE_SIZE_USIZE);
        }
    }

    #[test]
    fn test_bind_and_get() {
        INSTR_HANDLERS.bind(200, interpreter::handle_fence, 0x0000_000f);
        let resolved = INSTR_HANDLERS.get(200);
        assert_eq!(resolved as usize, interpreter::handle_fence as usize);
        assert!(INSTR_HANDLERS
            .bindings()
            .iter()
            .any(|&(idx, enc)| idx == 200 && enc == 0x0000_000f));
    }
}

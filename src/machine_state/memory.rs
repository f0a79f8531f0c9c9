// SPDX-FileCopyrightText: 2026 TriliTech <contact@trili.tech>
//
// SPDX-License-Identifier: MIT

//! Guest virtual memory: a sparse map from page numbers to 4 KiB pages.
//!
//! Pages are created on demand when an access faults on an unmapped page,
//! subject to a hard page quota. Copy-on-write pages alias a process-wide
//! zero page until their first write. The gather primitive exposes a guest
//! range as a sequence of contiguous host buffers so system calls can do
//! vectored I/O without copying.

pub mod page;

use std::collections::BTreeMap;
use std::ptr;

use thiserror::Error;

use self::page::Page;
use self::page::PageAttributes;
use self::page::PAGE_SIZE_USIZE;
use crate::machine_state::registers::XValue;

/// Guest virtual address
pub type Address = XValue;

/// Size of a memory page in bytes
pub const PAGE_SIZE: u64 = 4096;

/// Shift converting a guest address to its page number
pub const PAGE_SHIFT: u32 = 12;

/// Mask extracting the offset of an address within its page
pub const OFFSET_MASK: u64 = PAGE_SIZE - 1;

/// Longest NUL-terminated string [`Memory::memstring`] will read.
const MEMSTRING_MAX: usize = 16 * 1024;

/// Fatal memory faults. These terminate the guest; they are never reflected
/// back as an errno.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum MemoryError {
    /// The page quota was exhausted.
    #[error("Out of memory")]
    OutOfMemory,

    /// A structurally invalid operation, such as installing a shared page
    /// over a non copy-on-write page.
    #[error("Illegal operation: {0}")]
    IllegalOperation(&'static str),

    /// An access violated the page attributes.
    #[error("Protection fault at {0:#x}")]
    ProtectionFault(Address),
}

/// One contiguous host-memory span covering part of a guest range.
#[derive(Clone, Copy, Debug)]
pub struct VBuffer {
    pub ptr: *mut u8,
    pub len: usize,
}

impl VBuffer {
    /// Borrow the span for reading.
    ///
    /// # Safety
    ///
    /// The [`Memory`] the span was gathered from must still be alive and
    /// must not have evicted or promoted the underlying page.
    pub unsafe fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

/// The last-touched page for one access direction, so sequential accesses
/// bypass the page-map lookup.
#[derive(Clone, Copy)]
struct CachedPage {
    pageno: u64,
    ptr: *mut u8,
}

impl CachedPage {
    const INVALID: Self = Self {
        pageno: u64::MAX,
        ptr: ptr::null_mut(),
    };
}

/// Guest virtual memory.
pub struct Memory {
    pages: BTreeMap<u64, Page>,

    /// Hard cap on the number of pages.
    pages_total: usize,

    /// Peak page count observed.
    pages_highest: usize,

    cached_rd: CachedPage,
    cached_wr: CachedPage,

    /// ELF entry point
    pub start_address: Address,

    /// Initial stack pointer region
    pub stack_address: Address,

    /// Start of the program break area
    pub heap_address: Address,

    /// Highest address of any loaded segment
    pub elf_end_vaddr: Address,

    /// Resolved address of the guest `_exit` symbol, if any
    pub exit_address: Address,

    /// Cursor for anonymous memory mappings
    pub mmap_address: Address,

    /// Apply ELF segment permissions when loading
    pub protect_segments: bool,

    /// Maximum distance the program break may move above
    /// [`heap_address`](Self::heap_address)
    pub brk_max: u64,
}

// SAFETY: The cached page pointers refer to page buffers owned by `pages`
// (or the process-wide zero page) and are only dereferenced through
// `&mut self` methods that revalidate them against the page number.
unsafe impl Send for Memory {}

impl Memory {
    /// Create a memory limited to `pages_total` pages and set up initial
    /// paging.
    pub fn new(pages_total: usize) -> Self {
        let mut memory = Self {
            pages: BTreeMap::new(),
            pages_total,
            pages_highest: 0,
            cached_rd: CachedPage::INVALID,
            cached_wr: CachedPage::INVALID,
            start_address: 0,
            stack_address: 0,
            heap_address: 0,
            elf_end_vaddr: 0,
            exit_address: 0,
            mmap_address: 0,
            protect_segments: true,
            brk_max: 0x100_0000,
        };
        memory.initial_paging();
        memory
    }

    /// Number of pages currently mapped.
    pub fn pages_active(&self) -> usize {
        self.pages.len()
    }

    /// The page quota.
    pub fn pages_total(&self) -> usize {
        self.pages_total
    }

    /// Peak page count observed so far.
    pub fn pages_highest(&self) -> usize {
        self.pages_highest
    }

    /// Drop all pages. Owned buffers are freed here; shared buffers are
    /// only released, never freed.
    pub fn clear_all_pages(&mut self) {
        self.pages.clear();
        self.cached_rd = CachedPage::INVALID;
        self.cached_wr = CachedPage::INVALID;
    }

    /// Clear all pages and make the zero page unreadable, so null-pointer
    /// accesses fault.
    pub fn initial_paging(&mut self) {
        self.clear_all_pages();
        let zp = self
            .create_page(0)
            .expect("the zero page fits in any quota");
        zp.attr = PageAttributes::DENY;
    }

    /// Forget the cached page for both directions if it refers to
    /// `pageno`.
    fn invalidate_cache(&mut self, pageno: u64) {
        if self.cached_rd.pageno == pageno {
            self.cached_rd = CachedPage::INVALID;
        }
        if self.cached_wr.pageno == pageno {
            self.cached_wr = CachedPage::INVALID;
        }
    }

    /// Insert a freshly zeroed owned page at `pageno`, replacing whatever
    /// was there.
    pub fn allocate_page(&mut self, pageno: u64) -> Result<&mut Page, MemoryError> {
        if !self.pages.contains_key(&pageno) && self.pages_active() >= self.pages_total {
            return Err(MemoryError::OutOfMemory);
        }
        self.invalidate_cache(pageno);
        self.pages.insert(pageno, Page::zeroed());
        self.pages_highest = self.pages_highest.max(self.pages.len());
        Ok(self.pages.get_mut(&pageno).expect("page was just inserted"))
    }

    /// Insert a page during initial paging. Must be called for page 0 with
    /// all-deny attributes.
    pub fn create_page(&mut self, pageno: u64) -> Result<&mut Page, MemoryError> {
        self.allocate_page(pageno)
    }

    /// Place a caller-provided shared page at `pageno`. The slot must be
    /// empty or still copy-on-write, and the page must carry the shared
    /// attribute.
    pub fn install_shared_page(&mut self, pageno: u64, page: Page) -> Result<(), MemoryError> {
        if let Some(existing) = self.pages.get(&pageno) {
            if !existing.attr.is_cow {
                return Err(MemoryError::IllegalOperation(
                    "There was a page at the specified location already",
                ));
            }
        }
        if !page.attr.shared {
            return Err(MemoryError::IllegalOperation(
                "The provided page did not have the shared attribute",
            ));
        }
        self.invalidate_cache(pageno);
        self.pages.insert(pageno, page);
        self.pages_highest = self.pages_highest.max(self.pages.len());
        Ok(())
    }

    /// On-demand page creation: allocate when under quota, fail otherwise.
    pub fn default_page_fault(&mut self, pageno: u64) -> Result<&mut Page, MemoryError> {
        if self.pages_active() < self.pages_total {
            return self.allocate_page(pageno);
        }
        Err(MemoryError::OutOfMemory)
    }

    /// Look up a page, faulting it in when unmapped.
    fn page_or_fault(&mut self, pageno: u64) -> Result<&mut Page, MemoryError> {
        if self.pages.contains_key(&pageno) {
            return Ok(self.pages.get_mut(&pageno).expect("page is present"));
        }
        self.default_page_fault(pageno)
    }

    /// A readable pointer to the start of the page holding `pageno`,
    /// faulting the page in if needed. Updates the read cache.
    fn readable_page_ptr(&mut self, pageno: u64) -> Result<*const u8, MemoryError> {
        if self.cached_rd.pageno == pageno {
            return Ok(self.cached_rd.ptr);
        }
        let page = self.page_or_fault(pageno)?;
        if !page.attr.read {
            return Err(MemoryError::ProtectionFault(pageno << PAGE_SHIFT));
        }
        let ptr = page.buffer().as_ptr().cast_mut();
        self.cached_rd = CachedPage { pageno, ptr };
        Ok(ptr)
    }

    /// A writable pointer to the start of the page holding `pageno`,
    /// faulting the page in and breaking copy-on-write if needed. Updates
    /// the write cache.
    fn writable_page_ptr(&mut self, pageno: u64) -> Result<*mut u8, MemoryError> {
        if self.cached_wr.pageno == pageno {
            return Ok(self.cached_wr.ptr);
        }
        let page = self.page_or_fault(pageno)?;
        if !page.attr.write && !page.attr.is_cow {
            return Err(MemoryError::ProtectionFault(pageno << PAGE_SHIFT));
        }
        if page.buffer_mut().is_none() {
            page.promote();
            page.attr.write = true;
        }
        let ptr = page
            .buffer_mut()
            .expect("promoted page is owned")
            .as_mut_ptr();
        // The promotion may have replaced the buffer the read cache points
        // at.
        if self.cached_rd.pageno == pageno {
            self.cached_rd = CachedPage::INVALID;
        }
        self.cached_wr = CachedPage { pageno, ptr };
        Ok(ptr)
    }

    /// Copy a host buffer into guest memory, walking page by page.
    pub fn memcpy(&mut self, mut dst: Address, src: &[u8]) -> Result<(), MemoryError> {
        let mut src = src;
        while !src.is_empty() {
            let pageno = dst >> PAGE_SHIFT;
            let offset = (dst & OFFSET_MASK) as usize;
            let chunk = src.len().min(PAGE_SIZE_USIZE - offset);
            let base = self.writable_page_ptr(pageno)?;
            unsafe {
                ptr::copy_nonoverlapping(src.as_ptr(), base.add(offset), chunk);
            }
            dst += chunk as Address;
            src = &src[chunk..];
        }
        Ok(())
    }

    /// Copy guest memory into a host buffer, walking page by page.
    pub fn memcpy_out(&mut self, dst: &mut [u8], src: Address) -> Result<(), MemoryError> {
        let mut copied = 0;
        while copied < dst.len() {
            let addr = src + copied as Address;
            let pageno = addr >> PAGE_SHIFT;
            let offset = (addr & OFFSET_MASK) as usize;
            let chunk = (dst.len() - copied).min(PAGE_SIZE_USIZE - offset);
            let base = self.readable_page_ptr(pageno)?;
            unsafe {
                ptr::copy_nonoverlapping(base.add(offset), dst[copied..].as_mut_ptr(), chunk);
            }
            copied += chunk;
        }
        Ok(())
    }

    /// Fill a guest range with a byte value.
    pub fn memset(&mut self, mut dst: Address, value: u8, mut len: usize) -> Result<(), MemoryError> {
        while len > 0 {
            let pageno = dst >> PAGE_SHIFT;
            let offset = (dst & OFFSET_MASK) as usize;
            let chunk = len.min(PAGE_SIZE_USIZE - offset);
            let base = self.writable_page_ptr(pageno)?;
            unsafe {
                ptr::write_bytes(base.add(offset), value, chunk);
            }
            dst += chunk as Address;
            len -= chunk;
        }
        Ok(())
    }

    /// Read a NUL-terminated string from guest memory. The string and its
    /// terminator must be readable; unterminated strings fail after 16 KiB.
    pub fn memstring(&mut self, addr: Address) -> Result<String, MemoryError> {
        let mut collected = Vec::new();
        let mut cursor = addr;
        while collected.len() < MEMSTRING_MAX {
            let pageno = cursor >> PAGE_SHIFT;
            let offset = (cursor & OFFSET_MASK) as usize;
            let chunk = PAGE_SIZE_USIZE - offset;
            let base = self.readable_page_ptr(pageno)?;
            let bytes = unsafe { std::slice::from_raw_parts(base.add(offset), chunk) };
            match bytes.iter().position(|&b| b == 0) {
                Some(end) => {
                    collected.extend_from_slice(&bytes[..end]);
                    return Ok(String::from_utf8_lossy(&collected).into_owned());
                }
                None => {
                    collected.extend_from_slice(bytes);
                    cursor += chunk as Address;
                }
            }
        }
        Err(MemoryError::IllegalOperation("Unterminated guest string"))
    }

    /// Write a small host struct into guest memory with its packed
    /// little-endian layout.
    pub fn copy_to_guest<T: serde::Serialize>(
        &mut self,
        addr: Address,
        value: &T,
    ) -> Result<(), MemoryError> {
        let bytes = crate::storage::serialise(value)
            .map_err(|_| MemoryError::IllegalOperation("Unserialisable guest struct"))?;
        self.memcpy(addr, &bytes)
    }

    /// Read a small host struct from guest memory.
    pub fn copy_from_guest<T: GuestStruct>(&mut self, addr: Address) -> Result<T, MemoryError> {
        let mut bytes = vec![0u8; T::SIZE];
        self.memcpy_out(&mut bytes, addr)?;
        crate::storage::deserialise(&bytes)
            .map_err(|_| MemoryError::IllegalOperation("Undeserialisable guest struct"))
    }

    /// Fill `out` with `{ptr, len}` spans covering the guest range
    /// `[addr, addr + len)` exactly, one entry per contiguous host span.
    /// Unmapped pages in the range fault in; copy-on-write pages are
    /// promoted so the host may write through the spans. Returns the number
    /// of entries used.
    pub fn gather_buffers_from_range(
        &mut self,
        out: &mut [VBuffer],
        mut addr: Address,
        mut len: usize,
    ) -> Result<usize, MemoryError> {
        let mut count = 0;
        while len > 0 {
            let pageno = addr >> PAGE_SHIFT;
            let offset = (addr & OFFSET_MASK) as usize;
            let chunk = len.min(PAGE_SIZE_USIZE - offset);
            let base = self.gather_page_ptr(pageno)?;
            let ptr = unsafe { base.add(offset) };

            // Merge with the previous span when the host memory happens to
            // be contiguous.
            let merged = count > 0 && {
                let prev: &mut VBuffer = &mut out[count - 1];
                if unsafe { prev.ptr.add(prev.len) } == ptr {
                    prev.len += chunk;
                    true
                } else {
                    false
                }
            };
            if !merged {
                if count == out.len() {
                    return Err(MemoryError::IllegalOperation(
                        "Out of buffers in gather operation",
                    ));
                }
                out[count] = VBuffer { ptr, len: chunk };
                count += 1;
            }

            addr += chunk as Address;
            len -= chunk;
        }
        Ok(count)
    }

    /// A page pointer suitable for gather spans: present, readable, and
    /// owned (so host writes can never reach a shared buffer).
    fn gather_page_ptr(&mut self, pageno: u64) -> Result<*mut u8, MemoryError> {
        let page = self.page_or_fault(pageno)?;
        if !page.attr.read {
            return Err(MemoryError::ProtectionFault(pageno << PAGE_SHIFT));
        }
        if page.buffer_mut().is_none() {
            page.promote();
            self.invalidate_cache(pageno);
        }
        let page = self.pages.get_mut(&pageno).expect("page is present");
        Ok(page
            .buffer_mut()
            .expect("gather pages are owned")
            .as_mut_ptr())
    }

    /// Update the R/W/X attributes of every page overlapping the range,
    /// faulting pages in as needed. Sharing and copy-on-write state is
    /// preserved.
    pub fn set_page_attr(
        &mut self,
        addr: Address,
        len: usize,
        attr: PageAttributes,
    ) -> Result<(), MemoryError> {
        let first = addr >> PAGE_SHIFT;
        let last = (addr + len.max(1) as Address - 1) >> PAGE_SHIFT;
        for pageno in first..=last {
            let page = self.page_or_fault(pageno)?;
            page.attr.read = attr.read;
            page.attr.write = attr.write;
            page.attr.exec = attr.exec;
            self.invalidate_cache(pageno);
        }
        Ok(())
    }

    /// Evict every page fully contained in the range. Owned buffers are
    /// freed; shared buffers are released only.
    pub fn free_pages(&mut self, addr: Address, len: usize) {
        let first = addr >> PAGE_SHIFT;
        let last = (addr + len.max(1) as Address - 1) >> PAGE_SHIFT;
        for pageno in first..=last {
            if self.pages.remove(&pageno).is_some() {
                self.invalidate_cache(pageno);
            }
        }
    }

    /// Look at a mapped page without faulting.
    pub fn get_page(&self, pageno: u64) -> Option<&Page> {
        self.pages.get(&pageno)
    }

    /// Borrow the bytes of an executable page, for decoder-cache
    /// generation.
    pub fn exec_page_data(&mut self, pageno: u64) -> Result<&[u8; PAGE_SIZE_USIZE], MemoryError> {
        let page = self.page_or_fault(pageno)?;
        if !page.attr.exec {
            return Err(MemoryError::ProtectionFault(pageno << PAGE_SHIFT));
        }
        Ok(page.buffer())
    }

    /// Read a little-endian value that may cross a page boundary.
    pub fn read_u8(&mut self, addr: Address) -> Result<u8, MemoryError> {
        let mut buf = [0u8; 1];
        self.memcpy_out(&mut buf, addr)?;
        Ok(buf[0])
    }

    pub fn read_u16(&mut self, addr: Address) -> Result<u16, MemoryError> {
        let mut buf = [0u8; 2];
        self.memcpy_out(&mut buf, addr)?;
        Ok(u16::from_le_bytes(buf))
    }

    pub fn read_u32(&mut self, addr: Address) -> Result<u32, MemoryError> {
        let mut buf = [0u8; 4];
        self.memcpy_out(&mut buf, addr)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn read_u64(&mut self, addr: Address) -> Result<u64, MemoryError> {
        let mut buf = [0u8; 8];
        self.memcpy_out(&mut buf, addr)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn write_u8(&mut self, addr: Address, value: u8) -> Result<(), MemoryError> {
        self.memcpy(addr, &[value])
    }

    pub fn write_u16(&mut self, addr: Address, value: u16) -> Result<(), MemoryError> {
        self.memcpy(addr, &value.to_le_bytes())
    }

    pub fn write_u32(&mut self, addr: Address, value: u32) -> Result<(), MemoryError> {
        self.memcpy(addr, &value.to_le_bytes())
    }

    pub fn write_u64(&mut self, addr: Address, value: u64) -> Result<(), MemoryError> {
        self.memcpy(addr, &value.to_le_bytes())
    }
}

/// Guest ABI structs declare their packed size so they can be fetched from
/// guest memory in one bounded copy.
pub trait GuestStruct: serde::Serialize + serde::de::DeserializeOwned {
    const SIZE: usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory() -> Memory {
        Memory::new(64)
    }

    #[test]
    fn test_zero_page_denies_access() {
        let mut memory = memory();
        assert_eq!(
            memory.read_u32(0x10),
            Err(MemoryError::ProtectionFault(0))
        );
        assert_eq!(
            memory.write_u32(0x10, 1),
            Err(MemoryError::ProtectionFault(0))
        );
    }

    #[test]
    fn test_page_quota() {
        let mut memory = Memory::new(2);
        // Page 0 occupies one slot already.
        memory.write_u8(0x1000, 1).unwrap();
        assert_eq!(
            memory.write_u8(0x2000, 1),
            Err(MemoryError::OutOfMemory)
        );
        assert_eq!(memory.pages_highest(), 2);
    }

    #[test]
    fn test_memcpy_across_page_boundary() {
        let mut memory = memory();
        let data: Vec<u8> = (0..=255).collect();
        let addr = 0x2000 - 128;
        memory.memcpy(addr, &data).unwrap();
        let mut readback = vec![0u8; data.len()];
        memory.memcpy_out(&mut readback, addr).unwrap();
        assert_eq!(readback, data);
    }

    #[test]
    fn test_read_write_ints() {
        let mut memory = memory();
        memory.write_u64(0x1ffc, 0x1122_3344_5566_7788).unwrap();
        assert_eq!(memory.read_u64(0x1ffc).unwrap(), 0x1122_3344_5566_7788);
        assert_eq!(memory.read_u32(0x1ffc).unwrap(), 0x5566_7788);
        assert_eq!(memory.read_u16(0x2002).unwrap(), 0x1122);
    }

    #[test]
    fn test_memstring() {
        let mut memory = memory();
        memory.memcpy(0x3000 - 3, b"hi there\0trailing").unwrap();
        assert_eq!(memory.memstring(0x3000 - 3).unwrap(), "hi there");
    }

    #[test]
    fn test_memstring_unterminated() {
        let mut memory = Memory::new(1024);
        memory.memset(0x4000, b'a', super::MEMSTRING_MAX + 16).unwrap();
        assert_eq!(
            memory.memstring(0x4000),
            Err(MemoryError::IllegalOperation("Unterminated guest string"))
        );
    }

    #[test]
    fn test_cow_promotion_on_write() {
        let mut memory = memory();
        memory
            .install_shared_page(7, Page::cow_page())
            .expect("cow pages install over empty slots");
        assert!(memory.get_page(7).unwrap().is_cow());

        memory.write_u8(7 << PAGE_SHIFT, 0xAB).unwrap();
        let page = memory.get_page(7).unwrap();
        assert!(!page.is_cow());
        assert_eq!(page.buffer()[0], 0xAB);
    }

    #[test]
    fn test_install_shared_page_rejections() {
        let mut memory = memory();
        memory.write_u8(0x5000, 1).unwrap();

        // The occupied slot is not copy-on-write.
        assert!(matches!(
            memory.install_shared_page(5, Page::cow_page()),
            Err(MemoryError::IllegalOperation(_))
        ));

        // The page itself must carry the shared attribute.
        assert!(matches!(
            memory.install_shared_page(6, Page::zeroed()),
            Err(MemoryError::IllegalOperation(_))
        ));
    }

    #[test]
    fn test_gather_covers_range_exactly() {
        let mut memory = memory();
        let addr = 0x1800;
        let len = 3 * PAGE_SIZE_USIZE;
        memory.memset(addr, 0x5A, len).unwrap();

        let mut spans = [VBuffer {
            ptr: std::ptr::null_mut(),
            len: 0,
        }; 8];
        let count = memory
            .gather_buffers_from_range(&mut spans, addr, len)
            .unwrap();

        let total: usize = spans[..count].iter().map(|b| b.len).sum();
        assert_eq!(total, len);
        for span in &spans[..count] {
            assert!(span.len > 0);
            let bytes = unsafe { span.as_slice() };
            assert!(bytes.iter().all(|&b| b == 0x5A));
        }
    }

    #[test]
    fn test_gather_breaks_cow() {
        let mut memory = memory();
        memory.install_shared_page(9, Page::cow_page()).unwrap();

        let mut spans = [VBuffer {
            ptr: std::ptr::null_mut(),
            len: 0,
        }; 2];
        let count = memory
            .gather_buffers_from_range(&mut spans, 9 << PAGE_SHIFT, 64)
            .unwrap();
        assert_eq!(count, 1);

        // The span must point into an owned buffer, not the zero page.
        let page = memory.get_page(9).unwrap();
        assert!(!page.is_cow());
    }

    #[test]
    fn test_gather_span_overflow() {
        let mut memory = memory();
        let mut spans = [VBuffer {
            ptr: std::ptr::null_mut(),
            len: 0,
        }; 1];
        // Pages allocated separately are almost never contiguous, but the
        // merge path makes this probabilistic; force distinct pages by
        // touching them in reverse order first.
        memory.write_u8(0x3000, 1).unwrap();
        memory.write_u8(0x1000, 1).unwrap();
        memory.write_u8(0x2000, 1).unwrap();
        let res = memory.gather_buffers_from_range(&mut spans, 0x1800, 3 * PAGE_SIZE_USIZE);
        if let Err(err) = res {
            assert_eq!(
                err,
                MemoryError::IllegalOperation("Out of buffers in gather operation")
            );
        }
    }

    #[test]
    fn test_set_page_attr_applies_to_range() {
        let mut memory = memory();
        memory.memset(0x6000, 0, 2 * PAGE_SIZE_USIZE).unwrap();
        memory
            .set_page_attr(0x6000, 2 * PAGE_SIZE_USIZE, PageAttributes::rwx(true, false, true))
            .unwrap();
        assert_eq!(
            memory.write_u8(0x6000, 1),
            Err(MemoryError::ProtectionFault(0x6000))
        );
        assert!(memory.read_u8(0x6fff).is_ok());
        assert!(memory.exec_page_data(6).is_ok());
    }

    #[test]
    fn test_free_pages() {
        let mut memory = memory();
        memory.write_u8(0x8000, 1).unwrap();
        memory.write_u8(0x9000, 1).unwrap();
        let before = memory.pages_active();
        memory.free_pages(0x8000, 2 * PAGE_SIZE_USIZE);
        assert_eq!(memory.pages_active(), before - 2);
        // Freed pages fault back in as zeroes.
        assert_eq!(memory.read_u8(0x8000).unwrap(), 0);
    }

    proptest::proptest! {
        #[test]
        fn test_gather_concatenation_matches_memcpy_out(
            offset in 0u64..(PAGE_SIZE * 2),
            len in 1usize..(3 * PAGE_SIZE_USIZE),
        ) {
            let mut memory = Memory::new(64);
            let addr = 0x10_000 + offset;
            let data: Vec<u8> = (0..len).map(|i| (i * 31 % 251) as u8).collect();
            memory.memcpy(addr, &data).unwrap();

            let mut spans = [VBuffer { ptr: std::ptr::null_mut(), len: 0 }; 8];
            let count = memory.gather_buffers_from_range(&mut spans, addr, len).unwrap();

            let mut concatenated = Vec::with_capacity(len);
            for span in &spans[..count] {
                concatenated.extend_from_slice(unsafe { span.as_slice() });
            }
            proptest::prop_assert_eq!(concatenated, data);
        }
    }
}

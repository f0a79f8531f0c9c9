// SPDX-FileCopyrightText: 2026 TriliTech <contact@trili.tech>
//
// SPDX-License-Identifier: MIT

//! Test support: hand-assembled ELF images for driving the loader and the
//! interpreter without a cross toolchain.

pub mod elf_builder {
    /// Load address of the code segment.
    pub const BASE_VADDR: u64 = 0x40_0000;

    /// Load address of the optional data segment.
    pub const DATA_VADDR: u64 = 0x48_0000;

    const EHSIZE: usize = 64;
    const PHENTSIZE: usize = 56;
    const CODE_OFFSET: usize = 0x1000;
    const DATA_OFFSET: usize = 0x2000;

    fn write_u16(image: &mut [u8], offset: usize, value: u16) {
        image[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn write_u32(image: &mut [u8], offset: usize, value: u32) {
        image[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn write_u64(image: &mut [u8], offset: usize, value: u64) {
        image[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    fn write_phdr(
        image: &mut [u8],
        index: usize,
        flags: u32,
        offset: u64,
        vaddr: u64,
        size: u64,
    ) {
        let at = EHSIZE + index * PHENTSIZE;
        write_u32(image, at, 1); // PT_LOAD
        write_u32(image, at + 4, flags);
        write_u64(image, at + 8, offset);
        write_u64(image, at + 16, vaddr);
        write_u64(image, at + 24, vaddr);
        write_u64(image, at + 32, size);
        write_u64(image, at + 40, size);
        write_u64(image, at + 48, 0x1000);
    }

    fn header(phnum: u16, total: usize) -> Vec<u8> {
        let mut image = vec![0u8; total];
        image[..8].copy_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
        write_u16(&mut image, 16, 2); // ET_EXEC
        write_u16(&mut image, 18, 243); // EM_RISCV
        write_u32(&mut image, 20, 1);
        write_u64(&mut image, 24, BASE_VADDR); // e_entry
        write_u64(&mut image, 32, EHSIZE as u64); // e_phoff
        write_u16(&mut image, 52, EHSIZE as u16);
        write_u16(&mut image, 54, PHENTSIZE as u16);
        write_u16(&mut image, 56, phnum);
        image
    }

    /// A static RV64 executable with one read-execute segment holding the
    /// given instruction words. Entry is the first word.
    pub fn minimal_rv64(code: &[u32]) -> Vec<u8> {
        let code_len = code.len() * 4;
        let mut image = header(1, CODE_OFFSET + code_len);
        write_phdr(&mut image, 0, 0x5, CODE_OFFSET as u64, BASE_VADDR, code_len as u64);
        for (i, word) in code.iter().enumerate() {
            write_u32(&mut image, CODE_OFFSET + i * 4, *word);
        }
        image
    }

    /// Like [`minimal_rv64`], plus a read-write data segment at
    /// [`DATA_VADDR`].
    pub fn rv64_with_data(code: &[u32], data: &[u8]) -> Vec<u8> {
        let code_len = code.len() * 4;
        assert!(code_len <= DATA_OFFSET - CODE_OFFSET, "code overflows its segment");

        let mut image = header(2, DATA_OFFSET + data.len());
        write_phdr(&mut image, 0, 0x5, CODE_OFFSET as u64, BASE_VADDR, code_len as u64);
        write_phdr(
            &mut image,
            1,
            0x6,
            DATA_OFFSET as u64,
            DATA_VADDR,
            data.len() as u64,
        );
        for (i, word) in code.iter().enumerate() {
            write_u32(&mut image, CODE_OFFSET + i * 4, *word);
        }
        image[DATA_OFFSET..DATA_OFFSET + data.len()].copy_from_slice(data);
        image
    }
}

// SPDX-FileCopyrightText: 2026 TriliTech <contact@trili.tech>
//
// SPDX-License-Identifier: MIT

//! Instruction handler implementations.
//!
//! Every function with the [`InstrHandler`] signature may end up in the
//! process-wide handler table, dispatched through decoder-cache entries as
//! `handler(core, raw_encoding)`. Handlers advance the program counter
//! themselves.

use arbitrary_int::u5;

use crate::machine_state::memory::Address;
use crate::machine_state::registers;
use crate::machine_state::registers::XRegister;
use crate::machine_state::Exception;
use crate::machine_state::MachineCoreState;
use crate::machine_state::Xlen;

/// Host function implementing one decoded instruction.
pub type InstrHandler = fn(&mut MachineCoreState, u32) -> Result<(), Exception>;

#[inline(always)]
fn rd(instr: u32) -> XRegister {
    registers::parse_xregister(u5::new(((instr >> 7) & 0x1f) as u8))
}

#[inline(always)]
fn rs1(instr: u32) -> XRegister {
    registers::parse_xregister(u5::new(((instr >> 15) & 0x1f) as u8))
}

#[inline(always)]
fn rs2(instr: u32) -> XRegister {
    registers::parse_xregister(u5::new(((instr >> 20) & 0x1f) as u8))
}

#[inline(always)]
fn funct3(instr: u32) -> u32 {
    (instr >> 12) & 0b111
}

#[inline(always)]
fn funct7(instr: u32) -> u32 {
    instr >> 25
}

/// I-type immediate, sign-extended.
#[inline(always)]
fn imm_i(instr: u32) -> i64 {
    (instr as i32 >> 20) as i64
}

/// S-type immediate, sign-extended.
#[inline(always)]
fn imm_s(instr: u32) -> i64 {
    let upper = (instr as i32 >> 25) as i64;
    let lower = ((instr >> 7) & 0x1f) as i64;
    (upper << 5) | lower
}

/// B-type immediate, sign-extended.
#[inline(always)]
fn imm_b(instr: u32) -> i64 {
    let imm12 = ((instr >> 31) & 1) as i64;
    let imm11 = ((instr >> 7) & 1) as i64;
    let imm10_5 = ((instr >> 25) & 0x3f) as i64;
    let imm4_1 = ((instr >> 8) & 0xf) as i64;
    let value = (imm12 << 12) | (imm11 << 11) | (imm10_5 << 5) | (imm4_1 << 1);
    (value << 51) >> 51
}

/// U-type immediate, sign-extended.
#[inline(always)]
fn imm_u(instr: u32) -> i64 {
    (instr & 0xffff_f000) as i32 as i64
}

/// J-type immediate, sign-extended.
#[inline(always)]
fn imm_j(instr: u32) -> i64 {
    let imm20 = ((instr >> 31) & 1) as i64;
    let imm19_12 = ((instr >> 12) & 0xff) as i64;
    let imm11 = ((instr >> 20) & 1) as i64;
    let imm10_1 = ((instr >> 21) & 0x3ff) as i64;
    let value = (imm20 << 20) | (imm19_12 << 12) | (imm11 << 11) | (imm10_1 << 1);
    (value << 43) >> 43
}

/// Write a register result, narrowing to the guest width. RV32 registers
/// hold their value sign-extended to 64 bits, which keeps both signed and
/// unsigned comparisons on the full width correct.
#[inline(always)]
fn write_result(core: &mut MachineCoreState, reg: XRegister, value: u64) {
    let value = match core.xlen {
        Xlen::Rv64 => value,
        Xlen::Rv32 => value as i32 as i64 as u64,
    };
    core.hart.xregisters.write(reg, value);
}

pub fn handle_invalid(_core: &mut MachineCoreState, instr: u32) -> Result<(), Exception> {
    Err(Exception::IllegalInstruction(instr))
}

pub fn handle_lui(core: &mut MachineCoreState, instr: u32) -> Result<(), Exception> {
    exec_lui(core, instr, 4)
}

pub fn handle_auipc(core: &mut MachineCoreState, instr: u32) -> Result<(), Exception> {
    exec_auipc(core, instr, 4)
}

pub fn handle_jal(core: &mut MachineCoreState, instr: u32) -> Result<(), Exception> {
    exec_jal(core, instr, 4)
}

pub fn handle_jalr(core: &mut MachineCoreState, instr: u32) -> Result<(), Exception> {
    exec_jalr(core, instr, 4)
}

pub fn handle_branch(core: &mut MachineCoreState, instr: u32) -> Result<(), Exception> {
    exec_branch(core, instr, 4)
}

pub fn handle_load(core: &mut MachineCoreState, instr: u32) -> Result<(), Exception> {
    exec_load(core, instr, 4)
}

pub fn handle_store(core: &mut MachineCoreState, instr: u32) -> Result<(), Exception> {
    exec_store(core, instr, 4)
}

pub fn handle_op_imm(core: &mut MachineCoreState, instr: u32) -> Result<(), Exception> {
    exec_op_imm(core, instr, 4)
}

pub fn handle_op(core: &mut MachineCoreState, instr: u32) -> Result<(), Exception> {
    exec_op(core, instr, 4)
}

pub fn handle_op_imm32(core: &mut MachineCoreState, instr: u32) -> Result<(), Exception> {
    exec_op_imm32(core, instr, 4)
}

pub fn handle_op32(core: &mut MachineCoreState, instr: u32) -> Result<(), Exception> {
    exec_op32(core, instr, 4)
}

pub fn handle_fence(core: &mut MachineCoreState, instr: u32) -> Result<(), Exception> {
    // Single hart: fences have nothing to order.
    let _ = instr;
    core.hart.pc += 4;
    Ok(())
}

pub fn handle_system(core: &mut MachineCoreState, instr: u32) -> Result<(), Exception> {
    let _ = core;
    match instr >> 20 {
        0 if funct3(instr) == 0 => Err(Exception::EnvCall),
        1 if funct3(instr) == 0 => Err(Exception::Breakpoint),
        _ => Err(Exception::IllegalInstruction(instr)),
    }
}

pub fn handle_atomic(core: &mut MachineCoreState, instr: u32) -> Result<(), Exception> {
    exec_atomic(core, instr, 4)
}

/// Execute a compressed instruction by expanding it and running the
/// expansion with a 2-byte program-counter step.
#[cfg(feature = "compressed")]
pub fn handle_compressed(core: &mut MachineCoreState, instr: u32) -> Result<(), Exception> {
    let Some(expanded) = crate::parser::expand_compressed(instr as u16) else {
        return Err(Exception::IllegalInstruction(instr));
    };

    match expanded & 0x7f {
        0x37 => exec_lui(core, expanded, 2),
        0x17 => exec_auipc(core, expanded, 2),
        0x6f => exec_jal(core, expanded, 2),
        0x67 => exec_jalr(core, expanded, 2),
        0x63 => exec_branch(core, expanded, 2),
        0x03 => exec_load(core, expanded, 2),
        0x23 => exec_store(core, expanded, 2),
        0x13 => exec_op_imm(core, expanded, 2),
        0x33 => exec_op(core, expanded, 2),
        0x1b => exec_op_imm32(core, expanded, 2),
        0x3b => exec_op32(core, expanded, 2),
        0x73 => handle_system(core, expanded),
        _ => Err(Exception::IllegalInstruction(instr)),
    }
}

fn exec_lui(core: &mut MachineCoreState, instr: u32, width: Address) -> Result<(), Exception> {
    write_result(core, rd(instr), imm_u(instr) as u64);
    core.hart.pc += width;
    Ok(())
}

fn exec_auipc(core: &mut MachineCoreState, instr: u32, width: Address) -> Result<(), Exception> {
    let value = core.hart.pc.wrapping_add(imm_u(instr) as u64);
    write_result(core, rd(instr), value);
    core.hart.pc += width;
    Ok(())
}

fn exec_jal(core: &mut MachineCoreState, instr: u32, width: Address) -> Result<(), Exception> {
    let target = core.hart.pc.wrapping_add(imm_j(instr) as u64);
    write_result(core, rd(instr), core.hart.pc.wrapping_add(width));
    core.hart.pc = target;
    Ok(())
}

fn exec_jalr(core: &mut MachineCoreState, instr: u32, width: Address) -> Result<(), Exception> {
    let base = core.hart.xregisters.read(rs1(instr));
    let target = base.wrapping_add(imm_i(instr) as u64) & !1;
    write_result(core, rd(instr), core.hart.pc.wrapping_add(width));
    core.hart.pc = target;
    Ok(())
}

fn exec_branch(core: &mut MachineCoreState, instr: u32, width: Address) -> Result<(), Exception> {
    let lhs = core.hart.xregisters.read(rs1(instr));
    let rhs = core.hart.xregisters.read(rs2(instr));
    let taken = match funct3(instr) {
        0b000 => lhs == rhs,
        0b001 => lhs != rhs,
        0b100 => (lhs as i64) < (rhs as i64),
        0b101 => (lhs as i64) >= (rhs as i64),
        0b110 => lhs < rhs,
        0b111 => lhs >= rhs,
        _ => return Err(Exception::IllegalInstruction(instr)),
    };
    if taken {
        core.hart.pc = core.hart.pc.wrapping_add(imm_b(instr) as u64);
    } else {
        core.hart.pc += width;
    }
    Ok(())
}

fn exec_load(core: &mut MachineCoreState, instr: u32, width: Address) -> Result<(), Exception> {
    let addr = core
        .hart
        .xregisters
        .read(rs1(instr))
        .wrapping_add(imm_i(instr) as u64);
    let value = match funct3(instr) {
        0b000 => core.main_memory.read_u8(addr)? as i8 as i64 as u64,
        0b001 => core.main_memory.read_u16(addr)? as i16 as i64 as u64,
        0b010 => core.main_memory.read_u32(addr)? as i32 as i64 as u64,
        0b011 => core.main_memory.read_u64(addr)?,
        0b100 => core.main_memory.read_u8(addr)? as u64,
        0b101 => core.main_memory.read_u16(addr)? as u64,
        0b110 => core.main_memory.read_u32(addr)? as u64,
        _ => return Err(Exception::IllegalInstruction(instr)),
    };
    write_result(core, rd(instr), value);
    core.hart.pc += width;
    Ok(())
}

fn exec_store(core: &mut MachineCoreState, instr: u32, width: Address) -> Result<(), Exception> {
    let addr = core
        .hart
        .xregisters
        .read(rs1(instr))
        .wrapping_add(imm_s(instr) as u64);
    let value = core.hart.xregisters.read(rs2(instr));
    match funct3(instr) {
        0b000 => core.main_memory.write_u8(addr, value as u8)?,
        0b001 => core.main_memory.write_u16(addr, value as u16)?,
        0b010 => core.main_memory.write_u32(addr, value as u32)?,
        0b011 => core.main_memory.write_u64(addr, value)?,
        _ => return Err(Exception::IllegalInstruction(instr)),
    }
    core.hart.pc += width;
    Ok(())
}

fn exec_op_imm(core: &mut MachineCoreState, instr: u32, width: Address) -> Result<(), Exception> {
    let lhs = core.hart.xregisters.read(rs1(instr));
    let imm = imm_i(instr) as u64;
    let shamt_mask = match core.xlen {
        Xlen::Rv64 => 0x3f,
        Xlen::Rv32 => 0x1f,
    };
    let value = match funct3(instr) {
        0b000 => lhs.wrapping_add(imm),
        0b010 => ((lhs as i64) < (imm as i64)) as u64,
        0b011 => (lhs < imm) as u64,
        0b100 => lhs ^ imm,
        0b110 => lhs | imm,
        0b111 => lhs & imm,
        0b001 => lhs.wrapping_shl((imm & shamt_mask) as u32),
        0b101 => {
            let shamt = (imm & shamt_mask) as u32;
            if instr & 0x4000_0000 != 0 {
                // Arithmetic shift: RV32 operands are sign-extended, so the
                // 64-bit shift produces the correctly extended result.
                ((lhs as i64) >> shamt) as u64
            } else {
                match core.xlen {
                    Xlen::Rv64 => lhs >> shamt,
                    Xlen::Rv32 => ((lhs as u32) >> shamt) as u64,
                }
            }
        }
        _ => return Err(Exception::IllegalInstruction(instr)),
    };
    write_result(core, rd(instr), value);
    core.hart.pc += width;
    Ok(())
}

fn exec_op(core: &mut MachineCoreState, instr: u32, width: Address) -> Result<(), Exception> {
    let lhs = core.hart.xregisters.read(rs1(instr));
    let rhs = core.hart.xregisters.read(rs2(instr));

    let value = if funct7(instr) == 1 {
        mul_div(core.xlen, funct3(instr), lhs, rhs)
    } else {
        let shamt_mask = match core.xlen {
            Xlen::Rv64 => 0x3f,
            Xlen::Rv32 => 0x1f,
        };
        match (funct3(instr), funct7(instr)) {
            (0b000, 0x00) => lhs.wrapping_add(rhs),
            (0b000, 0x20) => lhs.wrapping_sub(rhs),
            (0b001, 0x00) => lhs.wrapping_shl((rhs & shamt_mask) as u32),
            (0b010, 0x00) => ((lhs as i64) < (rhs as i64)) as u64,
            (0b011, 0x00) => (lhs < rhs) as u64,
            (0b100, 0x00) => lhs ^ rhs,
            (0b101, 0x00) => match core.xlen {
                Xlen::Rv64 => lhs >> (rhs & shamt_mask),
                Xlen::Rv32 => ((lhs as u32) >> (rhs & shamt_mask)) as u64,
            },
            (0b101, 0x20) => ((lhs as i64) >> (rhs & shamt_mask)) as u64,
            (0b110, 0x00) => lhs | rhs,
            (0b111, 0x00) => lhs & rhs,
            _ => return Err(Exception::IllegalInstruction(instr)),
        }
    };
    write_result(core, rd(instr), value);
    core.hart.pc += width;
    Ok(())
}

/// The M extension on the full register width.
fn mul_div(xlen: Xlen, funct3: u32, lhs: u64, rhs: u64) -> u64 {
    match xlen {
        Xlen::Rv64 => match funct3 {
            0b000 => lhs.wrapping_mul(rhs),
            0b001 => (((lhs as i64 as i128) * (rhs as i64 as i128)) >> 64) as u64,
            0b010 => (((lhs as i64 as i128) * (rhs as u128 as i128)) >> 64) as u64,
            0b011 => (((lhs as u128) * (rhs as u128)) >> 64) as u64,
            0b100 => match (lhs as i64, rhs as i64) {
                (_, 0) => u64::MAX,
                (i64::MIN, -1) => i64::MIN as u64,
                (a, b) => (a / b) as u64,
            },
            0b101 => {
                if rhs == 0 {
                    u64::MAX
                } else {
                    lhs / rhs
                }
            }
            0b110 => match (lhs as i64, rhs as i64) {
                (a, 0) => a as u64,
                (i64::MIN, -1) => 0,
                (a, b) => (a % b) as u64,
            },
            0b111 => {
                if rhs == 0 {
                    lhs
                } else {
                    lhs % rhs
                }
            }
            _ => unreachable!("funct3 is three bits"),
        },
        Xlen::Rv32 => {
            let a = lhs as u32;
            let b = rhs as u32;
            let value = match funct3 {
                0b000 => a.wrapping_mul(b),
                0b001 => (((a as i32 as i64) * (b as i32 as i64)) >> 32) as u32,
                0b010 => (((a as i32 as i64) * (b as i64)) >> 32) as u32,
                0b011 => (((a as u64) * (b as u64)) >> 32) as u32,
                0b100 => match (a as i32, b as i32) {
                    (_, 0) => u32::MAX,
                    (i32::MIN, -1) => i32::MIN as u32,
                    (x, y) => (x / y) as u32,
                },
                0b101 => {
                    if b == 0 {
                        u32::MAX
                    } else {
                        a / b
                    }
                }
                0b110 => match (a as i32, b as i32) {
                    (x, 0) => x as u32,
                    (i32::MIN, -1) => 0,
                    (x, y) => (x % y) as u32,
                },
                0b111 => {
                    if b == 0 {
                        a
                    } else {
                        a % b
                    }
                }
                _ => unreachable!("funct3 is three bits"),
            };
            value as i32 as i64 as u64
        }
    }
}

/// RV64 *W instructions: 32-bit operations with sign-extended results.
fn exec_op_imm32(core: &mut MachineCoreState, instr: u32, width: Address) -> Result<(), Exception> {
    if core.xlen == Xlen::Rv32 {
        return Err(Exception::IllegalInstruction(instr));
    }
    let lhs = core.hart.xregisters.read(rs1(instr)) as u32;
    let imm = imm_i(instr);
    let value = match funct3(instr) {
        0b000 => lhs.wrapping_add(imm as u32),
        0b001 => lhs.wrapping_shl((imm & 0x1f) as u32),
        0b101 => {
            let shamt = (imm & 0x1f) as u32;
            if instr & 0x4000_0000 != 0 {
                ((lhs as i32) >> shamt) as u32
            } else {
                lhs >> shamt
            }
        }
        _ => return Err(Exception::IllegalInstruction(instr)),
    };
    core.hart
        .xregisters
        .write(rd(instr), value as i32 as i64 as u64);
    core.hart.pc += width;
    Ok(())
}

fn exec_op32(core: &mut MachineCoreState, instr: u32, width: Address) -> Result<(), Exception> {
    if core.xlen == Xlen::Rv32 {
        return Err(Exception::IllegalInstruction(instr));
    }
    let lhs = core.hart.xregisters.read(rs1(instr)) as u32;
    let rhs = core.hart.xregisters.read(rs2(instr)) as u32;

    let value = if funct7(instr) == 1 {
        mul_div(Xlen::Rv32, funct3(instr), lhs as u64, rhs as u64) as u32
    } else {
        match (funct3(instr), funct7(instr)) {
            (0b000, 0x00) => lhs.wrapping_add(rhs),
            (0b000, 0x20) => lhs.wrapping_sub(rhs),
            (0b001, 0x00) => lhs.wrapping_shl(rhs & 0x1f),
            (0b101, 0x00) => lhs >> (rhs & 0x1f),
            (0b101, 0x20) => ((lhs as i32) >> (rhs & 0x1f)) as u32,
            _ => return Err(Exception::IllegalInstruction(instr)),
        }
    };
    core.hart
        .xregisters
        .write(rd(instr), value as i32 as i64 as u64);
    core.hart.pc += width;
    Ok(())
}

/// The A extension, trivially sequentially consistent on a single hart:
/// reservations always succeed.
fn exec_atomic(core: &mut MachineCoreState, instr: u32, width: Address) -> Result<(), Exception> {
    let addr = core.hart.xregisters.read(rs1(instr));
    let src = core.hart.xregisters.read(rs2(instr));
    let funct5 = instr >> 27;
    let is_double = match funct3(instr) {
        0b010 => false,
        0b011 if core.xlen == Xlen::Rv64 => true,
        _ => return Err(Exception::IllegalInstruction(instr)),
    };

    let old = if is_double {
        core.main_memory.read_u64(addr)?
    } else {
        core.main_memory.read_u32(addr)? as i32 as i64 as u64
    };

    let store = |core: &mut MachineCoreState, value: u64| -> Result<(), Exception> {
        if is_double {
            core.main_memory.write_u64(addr, value)?;
        } else {
            core.main_memory.write_u32(addr, value as u32)?;
        }
        Ok(())
    };

    match funct5 {
        // lr
        0x02 => write_result(core, rd(instr), old),
        // sc: always succeeds
        0x03 => {
            store(core, src)?;
            write_result(core, rd(instr), 0);
        }
        // amoswap
        0x01 => {
            store(core, src)?;
            write_result(core, rd(instr), old);
        }
        // amoadd
        0x00 => {
            store(core, old.wrapping_add(src))?;
            write_result(core, rd(instr), old);
        }
        // amoxor
        0x04 => {
            store(core, old ^ src)?;
            write_result(core, rd(instr), old);
        }
        // amoand
        0x0c => {
            store(core, old & src)?;
            write_result(core, rd(instr), old);
        }
        // amoor
        0x08 => {
            store(core, old | src)?;
            write_result(core, rd(instr), old);
        }
        // amomin
        0x10 => {
            store(core, (old as i64).min(src as i64) as u64)?;
            write_result(core, rd(instr), old);
        }
        // amomax
        0x14 => {
            store(core, (old as i64).max(src as i64) as u64)?;
            write_result(core, rd(instr), old);
        }
        // amominu
        0x18 => {
            store(core, old.min(src))?;
            write_result(core, rd(instr), old);
        }
        // amomaxu
        0x1c => {
            store(core, old.max(src))?;
            write_result(core, rd(instr), old);
        }
        _ => return Err(Exception::IllegalInstruction(instr)),
    }

    core.hart.pc += width;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine_state::registers::{a0, a1, a2};

    fn core() -> MachineCoreState {
        MachineCoreState::new(Xlen::Rv64, 64)
    }

    #[test]
    fn test_addi() {
        let mut core = core();
        core.hart.pc = 0x1000;
        core.hart.xregisters.write(a0, 41);
        // addi a0, a0, 1
        handle_op_imm(&mut core, 0x0015_0513).unwrap();
        assert_eq!(core.hart.xregisters.read(a0), 42);
        assert_eq!(core.hart.pc, 0x1004);
    }

    #[test]
    fn test_rv32_sign_extension() {
        let mut core = MachineCoreState::new(Xlen::Rv32, 64);
        core.hart.xregisters.write(a0, 0x7fff_ffff);
        // addi a0, a0, 1 overflows into the sign bit on RV32
        handle_op_imm(&mut core, 0x0015_0513).unwrap();
        assert_eq!(core.hart.xregisters.read(a0), 0x8000_0000u64 as i32 as i64 as u64);
    }

    #[test]
    fn test_branch_taken_and_not() {
        let mut core = core();
        core.hart.pc = 0x1000;
        core.hart.xregisters.write(a0, 7);
        core.hart.xregisters.write(a1, 7);
        // beq a0, a1, +16
        let beq = (1 << 8) | (0b000 << 12) | (10 << 15) | (11 << 20) | 0x63;
        handle_branch(&mut core, beq).unwrap();
        assert_eq!(core.hart.pc, 0x1010);

        core.hart.xregisters.write(a1, 8);
        handle_branch(&mut core, beq).unwrap();
        assert_eq!(core.hart.pc, 0x1014);
    }

    #[test]
    fn test_load_store_roundtrip() {
        let mut core = core();
        core.hart.xregisters.write(a1, 0x2000);
        core.hart.xregisters.write(a2, 0xdead_beef_cafe_f00d);
        // sd a2, 8(a1)
        let sd = (0 << 25) | (12 << 20) | (11 << 15) | (0b011 << 12) | (8 << 7) | 0x23;
        handle_store(&mut core, sd).unwrap();
        // ld a0, 8(a1)
        let ld = (8 << 20) | (11 << 15) | (0b011 << 12) | (10 << 7) | 0x03;
        handle_load(&mut core, ld).unwrap();
        assert_eq!(core.hart.xregisters.read(a0), 0xdead_beef_cafe_f00d);
    }

    #[test]
    fn test_ecall_and_ebreak_raise() {
        let mut core = core();
        assert_eq!(handle_system(&mut core, 0x0000_0073), Err(Exception::EnvCall));
        assert_eq!(
            handle_system(&mut core, 0x0010_0073),
            Err(Exception::Breakpoint)
        );
    }

    #[test]
    fn test_division_edge_cases() {
        // div by zero
        assert_eq!(mul_div(Xlen::Rv64, 0b100, 5, 0), u64::MAX);
        // signed overflow
        assert_eq!(
            mul_div(Xlen::Rv64, 0b100, i64::MIN as u64, -1i64 as u64),
            i64::MIN as u64
        );
        // rem by zero returns the dividend
        assert_eq!(mul_div(Xlen::Rv64, 0b110, 17, 0), 17);
    }

    #[cfg(feature = "compressed")]
    #[test]
    fn test_compressed_addi_steps_two_bytes() {
        let mut core = core();
        core.hart.pc = 0x1000;
        core.hart.xregisters.write(a0, 1);
        // c.addi a0, 1
        handle_compressed(&mut core, 0x0505).unwrap();
        assert_eq!(core.hart.xregisters.read(a0), 2);
        assert_eq!(core.hart.pc, 0x1002);
    }

    #[test]
    fn test_amoadd() {
        let mut core = core();
        core.main_memory.write_u32(0x3000, 40).unwrap();
        core.hart.xregisters.write(a1, 0x3000);
        core.hart.xregisters.write(a2, 2);
        // amoadd.w a0, a2, (a1)
        let amo = (0x00 << 27) | (12 << 20) | (11 << 15) | (0b010 << 12) | (10 << 7) | 0x2f;
        handle_atomic(&mut core, amo).unwrap();
        assert_eq!(core.hart.xregisters.read(a0), 40);
        assert_eq!(core.main_memory.read_u32(0x3000).unwrap(), 42);
    }
}

// SPDX-FileCopyrightText: 2026 TriliTech <contact@trili.tech>
//
// SPDX-License-Identifier: MIT

//! State of a single hart: the program counter and the integer register
//! file. Floating-point and CSR state are not modelled.

use crate::machine_state::memory::Address;
use crate::machine_state::registers::XRegisters;

/// Hart state
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HartState {
    /// Integer registers
    pub xregisters: XRegisters,

    /// Program counter
    pub pc: Address,
}

impl HartState {
    pub fn new() -> Self {
        Self {
            xregisters: XRegisters::new(),
            pc: 0,
        }
    }

    /// Reset the hart: clear the registers and place the program counter at
    /// the given address.
    pub fn reset(&mut self, pc: Address) {
        self.xregisters.reset();
        self.pc = pc;
    }
}

impl Default for HartState {
    fn default() -> Self {
        Self::new()
    }
}

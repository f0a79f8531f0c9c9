// SPDX-FileCopyrightText: 2026 TriliTech <contact@trili.tech>
//
// SPDX-License-Identifier: MIT

//! Signal actions, the per-thread alternate stack, and signal delivery.

use serde::Deserialize;
use serde::Serialize;

use super::error::Error;
use crate::machine_state::memory::Address;
use crate::machine_state::memory::GuestStruct;
use crate::machine_state::registers;
use crate::machine_state::MachineError;
use crate::machine_state::MachineState;
use crate::machine_state::Xlen;

/// `SA_ONSTACK`: deliver on the alternate stack.
pub const SA_ONSTACK: u64 = 0x0800_0000;

/// Number of signal slots.
const SIGNAL_MAX: usize = 64;

/// Action configured for one signal.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SignalAction {
    /// Guest address of the handler; 0 means unset
    pub handler: Address,

    /// Deliver on the alternate stack
    pub altstack: bool,

    /// Signal mask while the handler runs
    pub mask: u64,
}

impl SignalAction {
    /// No handler was ever installed.
    pub fn is_unset(&self) -> bool {
        self.handler == 0
    }
}

/// The per-thread alternate signal stack, in the guest's `stack_t` shape.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SignalStack {
    pub ss_sp: Address,
    pub ss_flags: i32,
    pub ss_size: Address,
}

impl SignalStack {
    pub fn is_unset(&self) -> bool {
        self.ss_sp == 0 || self.ss_size == 0
    }
}

/// `stack_t` as RV64 guests lay it out.
#[derive(Serialize, Deserialize)]
struct GuestStack64 {
    ss_sp: u64,
    ss_flags: i32,
    __pad: i32,
    ss_size: u64,
}

impl GuestStruct for GuestStack64 {
    const SIZE: usize = 24;
}

/// `stack_t` as RV32 guests lay it out.
#[derive(Serialize, Deserialize)]
struct GuestStack32 {
    ss_sp: u32,
    ss_flags: i32,
    ss_size: u32,
}

impl GuestStruct for GuestStack32 {
    const SIZE: usize = 12;
}

/// `struct kernel_sigaction`, width-generic.
#[derive(Serialize, Deserialize)]
struct GuestSigaction64 {
    sa_handler: u64,
    sa_flags: u64,
    sa_mask: u64,
}

impl GuestStruct for GuestSigaction64 {
    const SIZE: usize = 24;
}

#[derive(Serialize, Deserialize)]
struct GuestSigaction32 {
    sa_handler: u32,
    sa_flags: u32,
    sa_mask: u32,
}

impl GuestStruct for GuestSigaction32 {
    const SIZE: usize = 12;
}

/// Process-wide signal actions plus the (single) thread's alternate stack.
pub struct Signals {
    actions: [SignalAction; SIGNAL_MAX],

    /// Alternate stack of the main thread
    pub stack: SignalStack,

    /// Stack pointer and program counter at the last delivery, for the
    /// handler's sigreturn
    saved: Option<(Address, Address)>,
}

impl Signals {
    pub fn new() -> Self {
        Self {
            actions: [SignalAction::default(); SIGNAL_MAX],
            stack: SignalStack::default(),
            saved: None,
        }
    }

    /// The action slot for a signal.
    pub fn sigaction(&mut self, sig: u64) -> Option<&mut SignalAction> {
        self.actions.get_mut(sig as usize)
    }

    /// The pc and sp that were live before the last delivery.
    pub fn saved_context(&self) -> Option<(Address, Address)> {
        self.saved
    }
}

impl Default for Signals {
    fn default() -> Self {
        Self::new()
    }
}

/// Deliver a signal: remember the interrupted context, make the current pc
/// the handler's return address, jump to the handler, and switch to the
/// alternate stack when the action requests it.
pub fn enter(machine: &mut MachineState, sig: u64) {
    let Some(action) = machine.signals.sigaction(sig).copied() else {
        return;
    };

    let pc = machine.core.hart.pc;
    let sp = machine.core.hart.xregisters.read(registers::sp);
    machine.signals.saved = Some((pc, sp));

    machine.core.hart.xregisters.write(registers::ra, pc);
    // Handlers may carry metadata in the low bits; jump to the aligned
    // entry.
    machine.core.hart.pc = action.handler & !0xF;

    let stack = machine.signals.stack;
    if action.altstack && !stack.is_unset() {
        let top = (stack.ss_sp + stack.ss_size) & !0xF;
        machine.core.hart.xregisters.write(registers::sp, top);
    }
}

/// Handle `sigaltstack`: write the current alternate stack out, then read
/// the new one in.
///
/// See: <https://man7.org/linux/man-pages/man2/sigaltstack.2.html>
pub fn syscall_sigaltstack(machine: &mut MachineState) -> Result<(), MachineError> {
    let ss = machine.sysarg(0);
    let old_ss = machine.sysarg(1);

    let stack = machine.signals.stack;
    match machine.core.xlen {
        Xlen::Rv64 => {
            if old_ss != 0 {
                let out = GuestStack64 {
                    ss_sp: stack.ss_sp,
                    ss_flags: stack.ss_flags,
                    __pad: 0,
                    ss_size: stack.ss_size,
                };
                machine.core.main_memory.copy_to_guest(old_ss, &out)?;
            }
            if ss != 0 {
                let new: GuestStack64 = machine.core.main_memory.copy_from_guest(ss)?;
                machine.signals.stack = SignalStack {
                    ss_sp: new.ss_sp,
                    ss_flags: new.ss_flags,
                    ss_size: new.ss_size,
                };
            }
        }
        Xlen::Rv32 => {
            if old_ss != 0 {
                let out = GuestStack32 {
                    ss_sp: stack.ss_sp as u32,
                    ss_flags: stack.ss_flags,
                    ss_size: stack.ss_size as u32,
                };
                machine.core.main_memory.copy_to_guest(old_ss, &out)?;
            }
            if ss != 0 {
                let new: GuestStack32 = machine.core.main_memory.copy_from_guest(ss)?;
                machine.signals.stack = SignalStack {
                    ss_sp: new.ss_sp as Address,
                    ss_flags: new.ss_flags,
                    ss_size: new.ss_size as Address,
                };
            }
        }
    }

    machine.set_result(0);
    Ok(())
}

/// Handle `rt_sigaction`: write the old action out, then read the new one
/// in. Only the `SA_ONSTACK` flag is preserved.
///
/// See: <https://man7.org/linux/man-pages/man2/sigaction.2.html>
pub fn syscall_sigaction(machine: &mut MachineState) -> Result<(), MachineError> {
    let sig = machine.sysarg(0);
    let action = machine.sysarg(1);
    let old_action = machine.sysarg(2);

    if sig == 0 {
        machine.set_result(0);
        return Ok(());
    }
    let Some(current) = machine.signals.sigaction(sig).copied() else {
        machine.set_result(Error::InvalidArgument.into_xvalue());
        return Ok(());
    };

    match machine.core.xlen {
        Xlen::Rv64 => {
            if old_action != 0 {
                let out = GuestSigaction64 {
                    sa_handler: current.handler,
                    sa_flags: if current.altstack { SA_ONSTACK } else { 0 },
                    sa_mask: current.mask,
                };
                machine.core.main_memory.copy_to_guest(old_action, &out)?;
            }
            if action != 0 {
                let new: GuestSigaction64 = machine.core.main_memory.copy_from_guest(action)?;
                let slot = machine
                    .signals
                    .sigaction(sig)
                    .expect("signal number was validated above");
                slot.handler = new.sa_handler;
                slot.altstack = new.sa_flags & SA_ONSTACK != 0;
                slot.mask = new.sa_mask;
            }
        }
        Xlen::Rv32 => {
            if old_action != 0 {
                let out = GuestSigaction32 {
                    sa_handler: current.handler as u32,
                    sa_flags: if current.altstack { SA_ONSTACK as u32 } else { 0 },
                    sa_mask: current.mask as u32,
                };
                machine.core.main_memory.copy_to_guest(old_action, &out)?;
            }
            if action != 0 {
                let new: GuestSigaction32 = machine.core.main_memory.copy_from_guest(action)?;
                let slot = machine
                    .signals
                    .sigaction(sig)
                    .expect("signal number was validated above");
                slot.handler = new.sa_handler as Address;
                slot.altstack = new.sa_flags as u64 & SA_ONSTACK != 0;
                slot.mask = new.sa_mask as u64;
            }
        }
    }

    machine.set_result(0);
    Ok(())
}

/// Handle `tgkill`/`kill`: signals with an installed action jump straight
/// into their guest handler; everything else is ignored.
///
/// See: <https://man7.org/linux/man-pages/man2/tgkill.2.html>
pub fn syscall_kill(machine: &mut MachineState) -> Result<(), MachineError> {
    let sig = machine.sysarg(2);

    let unset = machine
        .signals
        .sigaction(sig)
        .map_or(true, |action| action.is_unset());
    if sig == 0 || unset {
        machine.set_result(0);
        return Ok(());
    }

    enter(machine, sig);
    // The guest handler receives the signal number as its argument.
    machine.set_result(sig);
    Ok(())
}

/// Handle `rt_sigprocmask`. Masking is not modelled; pretend success.
///
/// See: <https://man7.org/linux/man-pages/man2/rt_sigprocmask.2.html>
pub fn syscall_sigprocmask(machine: &mut MachineState) -> Result<(), MachineError> {
    machine.set_result(0);
    Ok(())
}

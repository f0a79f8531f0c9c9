// SPDX-FileCopyrightText: 2026 TriliTech <contact@trili.tech>
//
// SPDX-License-Identifier: MIT

//! End-to-end scenarios: hand-assembled RV64 ELF images running through
//! the loader, the decoder cache, the interpreter and the Linux layer.

use std::cell::RefCell;
use std::rc::Rc;

use riscv_usermode::machine_state::MachineError;
use riscv_usermode::machine_state::MachineOptions;
use riscv_usermode::machine_state::MachineState;
use riscv_usermode::program::Program;
use riscv_usermode::storage;
use riscv_usermode::testing::elf_builder;

/// Shared capture buffer for the machine's stdout hook.
type Captured = Rc<RefCell<Vec<u8>>>;

fn machine_for(image: Vec<u8>) -> (MachineState, Program, Captured) {
    let program = Program::new(image).expect("the test image is valid ELF");
    let mut machine = MachineState::new(program.xlen, MachineOptions::default());
    machine
        .setup_linux_process(&program, &["test-program"], &[])
        .expect("the test image loads");
    machine.setup_linux_syscalls(false, false);

    let captured: Captured = Rc::default();
    let sink = captured.clone();
    machine.hooks.stdout = Box::new(move |bytes| {
        sink.borrow_mut().extend_from_slice(bytes);
    });

    (machine, program, captured)
}

/// writev(1, [{buf, 5}, {buf + 5, 1}], 2) with buffer "hello\n", then
/// exit.
fn hello_writev_image() -> Vec<u8> {
    let code = [
        0x0010_0513, // addi a0, x0, 1
        0x0048_05b7, // lui a1, 0x480
        0x0105_8593, // addi a1, a1, 16
        0x0020_0613, // addi a2, x0, 2
        0x0420_0893, // addi a7, x0, 66
        0x0000_0073, // ecall
        0x05d0_0893, // addi a7, x0, 93
        0x0000_0073, // ecall
    ];

    let mut data = Vec::new();
    data.extend_from_slice(b"hello\n");
    data.resize(16, 0);
    for value in [
        elf_builder::DATA_VADDR,
        5,
        elf_builder::DATA_VADDR + 5,
        1,
    ] {
        data.extend_from_slice(&value.to_le_bytes());
    }

    elf_builder::rv64_with_data(&code, &data)
}

#[test]
fn test_hello_via_writev() {
    let (mut machine, _program, captured) = machine_for(hello_writev_image());

    machine.run(1000).unwrap();

    assert_eq!(captured.borrow().as_slice(), b"hello\n");
    assert_eq!(machine.return_value(), 6);
    assert!(machine.stopped());
}

#[test]
fn test_counting_loop() {
    let code = [
        0x0000_0513, // addi a0, x0, 0
        0x00a0_0593, // addi a1, x0, 10
        0x0015_0513, // addi a0, a0, 1
        0xfeb5_1ee3, // bne a0, a1, -4
        0x05d0_0893, // addi a7, x0, 93
        0x0000_0073, // ecall
    ];
    let (mut machine, _program, _captured) = machine_for(elf_builder::minimal_rv64(&code));

    machine.run(1000).unwrap();

    assert_eq!(machine.return_value(), 10);
    assert!(machine.stopped());
}

#[test]
fn test_read_from_stdin_hook() {
    let code = [
        0x0000_0513, // addi a0, x0, 0
        0x0048_05b7, // lui a1, 0x480
        0x0400_0613, // addi a2, x0, 64
        0x03f0_0893, // addi a7, x0, 63
        0x0000_0073, // ecall
        0x05d0_0893, // addi a7, x0, 93
        0x0000_0073, // ecall
    ];
    let image = elf_builder::rv64_with_data(&code, &[0u8; 64]);
    let (mut machine, _program, _captured) = machine_for(image);

    machine.hooks.stdin = Box::new(|buffer| {
        let input = b"ping";
        buffer[..input.len()].copy_from_slice(input);
        input.len()
    });

    machine.run(1000).unwrap();

    assert_eq!(machine.return_value(), 4);
    let mut readback = [0u8; 4];
    machine
        .core
        .main_memory
        .memcpy_out(&mut readback, elf_builder::DATA_VADDR)
        .unwrap();
    assert_eq!(&readback, b"ping");
}

#[test]
fn test_ebreak_raises_unhandled_syscall() {
    let code = [0x0010_0073]; // ebreak
    let (mut machine, _program, _captured) = machine_for(elf_builder::minimal_rv64(&code));

    match machine.run(10) {
        Err(MachineError::UnhandledSyscall(msg)) => {
            assert_eq!(msg, "EBREAK instruction");
        }
        other => panic!("expected an unhandled-syscall error, got {other:?}"),
    }
}

#[test]
fn test_illegal_instruction_is_fatal() {
    let code = [0xffff_ffff];
    let (mut machine, _program, _captured) = machine_for(elf_builder::minimal_rv64(&code));

    assert!(matches!(
        machine.run(10),
        Err(MachineError::IllegalInstruction { .. })
    ));
}

/// Serialize the decoder caches of a finished run, load them into a fresh
/// machine, and check that re-dispatching through the restored handler
/// bindings produces the same architectural effect.
#[test]
fn test_decoder_cache_roundtrip_preserves_execution() {
    let (mut machine, _program, captured) = machine_for(hello_writev_image());
    machine.run(1000).unwrap();
    assert_eq!(captured.borrow().as_slice(), b"hello\n");

    let (pages, caches): (Vec<u64>, Vec<Box<_>>) = machine
        .decoder_caches()
        .map(|(pageno, cache)| (pageno, Box::new(cache.clone())))
        .unzip();
    assert!(!caches.is_empty());

    let serialized = storage::serialize_decoder_caches(&caches);
    let restored = storage::deserialize_decoder_caches(&serialized, caches.len()).unwrap();

    // Byte-exact round-trip, descriptor by descriptor.
    for (cache, loaded) in caches.iter().zip(&restored) {
        assert_eq!(cache.as_ref(), loaded.as_ref());
    }

    // A fresh machine primed with the restored caches behaves the same.
    let (mut machine, _program, captured) = machine_for(hello_writev_image());
    for (pageno, cache) in pages.into_iter().zip(restored) {
        machine.install_decoder_cache(pageno, cache);
    }
    machine.run(1000).unwrap();

    assert_eq!(captured.borrow().as_slice(), b"hello\n");
    assert_eq!(machine.return_value(), 6);
}

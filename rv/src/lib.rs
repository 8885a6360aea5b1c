//! Library surface for the `rv` RV32I emulator: the interpreter, segmented
//! memory, ELF loader adapter, host syscall bridge, and GDB RSP server.
//! `main.rs` is a thin CLI wrapper around these modules.

pub mod cpu;
pub mod gdb;
pub mod instructions;
pub mod loader;
pub mod memory;
pub mod syscall;

//! loong-core: a user-mode LoongArch64 emulator.
//!
//! Loads a statically linked LA64 ELF binary into a flat memory arena,
//! pre-decodes its code into per-instruction bytecode records and runs
//! them through a block-oriented dispatch loop with a Linux-like system
//! call surface. Host programs embed a [`runtime::Machine`] and either
//! run the guest from its entry point or call individual guest functions
//! through `vmcall`.

pub mod elf;
pub mod runtime;
pub mod utils;

pub use runtime::{CallArg, Machine, MachineError};
pub use utils::MachineOptions;

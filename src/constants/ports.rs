//! I/O port definitions.

/// Base I/O port address for the first serial port (COM1).
pub const SERIAL_PORT: u16 = 0x3F8;

/// QEMU isa-debug-exit device port used by the test harness.
pub const QEMU_EXIT_PORT: u16 = 0xF4;

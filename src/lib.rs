#![no_std]
#![cfg_attr(test, no_main)]
#![feature(custom_test_frameworks)]
#![test_runner(crate::test_runner)]
#![reexport_test_harness_main = "test_main"]
extern crate alloc;

use x86_64::instructions::hlt;

pub mod constants;
pub mod devices;
pub mod logging;
pub mod memory;
pub mod processes;

pub use devices::serial;

pub fn idle_loop() -> ! {
    loop {
        hlt();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum QemuExitCode {
    Success = 0x10,
    Failed = 0x11,
}

/// Exits QEMU through the isa-debug-exit device the test image is run with.
pub fn exit_qemu(exit_code: QemuExitCode) -> ! {
    use x86_64::instructions::port::Port;

    unsafe {
        let mut port = Port::new(constants::ports::QEMU_EXIT_PORT);
        port.write(exit_code as u32);
    }
    idle_loop()
}

pub fn test_runner(tests: &[&dyn Fn()]) {
    crate::serial_println!("Running {} tests", tests.len());
    for test in tests {
        test();
    }
    crate::serial_println!("All tests passed");
    exit_qemu(QemuExitCode::Success);
}

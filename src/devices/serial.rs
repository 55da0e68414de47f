//! UART 16550 serial shim.
//!
//! COM1 is this kernel's only output channel: the logger, the boot messages
//! and the test runner all end up here. Writes go through a spinlocked port
//! so lines from different contexts do not interleave mid-write.

use crate::constants::ports::SERIAL_PORT;
use lazy_static::lazy_static;
use spin::Mutex;
use uart_16550::SerialPort;

lazy_static! {
    /// COM1 behind a spinlock.
    pub static ref SERIAL1: Mutex<SerialPort> = {
        let mut port = unsafe { SerialPort::new(SERIAL_PORT) };
        port.init();
        Mutex::new(port)
    };
}

/// Forces port setup on the boot CPU so the first real message does not pay
/// for initialization. Mirrors `logging::init`.
pub fn init(cpu_id: u32) {
    if cpu_id == 0 {
        lazy_static::initialize(&SERIAL1);
    }
}

#[doc(hidden)]
pub fn _print(args: ::core::fmt::Arguments) {
    use core::fmt::Write;
    SERIAL1.lock().write_fmt(args).expect("serial write failed");
}

/// Writes formatted text to COM1.
#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::serial::_print(format_args!($($arg)*))
    };
}

/// Writes formatted text to COM1, followed by a newline.
#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($($arg:tt)*) => ($crate::serial_print!("{}\n", format_args!($($arg)*)));
}

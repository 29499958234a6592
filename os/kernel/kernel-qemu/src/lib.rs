//! # QEMU Debug Console
//!
//! Log output for kernels running under QEMU. Bytes written to I/O port
//! `0x402` show up on the host when QEMU runs with `-debugcon`:
//!
//! ```bash
//! qemu-system-x86_64 -kernel kernel.bin -debugcon stdio
//! ```
//!
//! ## Components
//!
//! * [`QemuLogger`]: a `log::Log` sink writing `[LEVEL] target: message`
//!   lines, so the memory subsystem's `log` calls reach the host.
//! * [`qemu_trace!`]: `format!`-style output straight to the port, usable
//!   before any logger is installed.
//!
//! ## `enabled` Feature (default)
//!
//! With the feature, the port writes are compiled in. Without it
//! [`qemu_trace!`] expands to a no-op and the logger discards everything.
//! On targets other than x86-64 the port write is always a no-op.
//!
//! ## Usage
//! ```rust,no_run
//! use kernel_qemu::QemuLogger;
//! use log::LevelFilter;
//!
//! static LOGGER: QemuLogger = QemuLogger::new(LevelFilter::Debug);
//!
//! LOGGER.init().expect("logger installed twice");
//! log::info!("memory bring-up");
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod logger;

pub use logger::QemuLogger;

#[cfg(feature = "enabled")]
#[doc(hidden)]
pub mod qemu_fmt {
    use core::fmt::{self, Write};

    /// QEMU's debug console port.
    const QEMU_DEBUG_PORT: u16 = 0x402;

    /// Write a single byte to the debug console.
    #[allow(clippy::inline_always)]
    #[inline(always)]
    pub fn dbg_putc(c: u8) {
        // SAFETY: port 0x402 is unused outside QEMU; writing it has no
        // effect on memory.
        #[cfg(target_arch = "x86_64")]
        unsafe {
            core::arch::asm!(
                "out dx, al",
                in("dx") QEMU_DEBUG_PORT,
                in("al") c,
                options(nomem, nostack, preserves_flags)
            );
        }
        #[cfg(not(target_arch = "x86_64"))]
        let _ = (QEMU_DEBUG_PORT, c);
    }

    /// `fmt::Write` over the debug console.
    pub struct QemuSink;

    impl Write for QemuSink {
        #[inline]
        fn write_str(&mut self, s: &str) -> fmt::Result {
            s.bytes().for_each(dbg_putc);
            Ok(())
        }
    }

    #[inline]
    pub fn qemu_write(args: fmt::Arguments) {
        // Best effort; the sink cannot fail.
        let _ = QemuSink.write_fmt(args);
    }
}

#[cfg(not(feature = "enabled"))]
#[doc(hidden)]
pub mod qemu_fmt {
    use core::fmt;

    #[inline(always)]
    #[allow(clippy::inline_always)]
    pub fn qemu_write(_: fmt::Arguments) {}
}

/// Formatted output to the QEMU debug console.
#[macro_export]
macro_rules! qemu_trace {
    ($($arg:tt)*) => {{
        $crate::qemu_fmt::qemu_write(core::format_args!($($arg)*));
    }};
}

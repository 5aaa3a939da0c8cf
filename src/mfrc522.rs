//! MFRC522 contactless reader frontend driver.
//!
//! The driver owns the chip across an SPI bus, programs its registers and
//! exposes the abstract [`crate::pcd::Pcd`] interface. Waiting for the chip
//! is cooperative: a transceive suspends the calling task until the chip's
//! IRQ line fires (or the caller's timeout runs out), so other tasks keep
//! running while the RF exchange is in flight.
//!
//!   - [`config`] is the tuning-knob structure with datasheet defaults.
//!   - [`bus`] is the register-level SPI transport.
//!   - [`irq`] is the driver registry the interrupt dispatch walks to find
//!     the waiter belonging to an IRQ channel.
//!   - [`driver`] is the state machine and the transceive engine.
//!   - [`selftest`] runs the chip's digital self-test.
//!
//! One driver instance owns one chip. A single instance must not be used
//! from several tasks at once; share it through [`crate::pcd::SharedPcd`].

mod bus;
mod config;
mod driver;
mod irq;
mod regs;
mod selftest;

pub use bus::Connection;
pub use config::{ClUartInput, DriverInput, MfOut, Mfrc522Config, RxGain};
pub use driver::{FIFO_SIZE, Mfrc522};
pub use irq::{IrqChannel, MAX_DEVICES, isr_dispatch};

#[cfg(feature = "pico1")]
pub use irq::irq_pump;

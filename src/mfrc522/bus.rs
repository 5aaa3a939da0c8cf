//! Register-level transport to the chip.
//!
//! SPI framing: the address byte carries the read/write flag in bit 7 and
//! the 6-bit register address in bits 6..1 (bit 0 stays 0). Writes append
//! the payload back to back; reads clock the address out again for every
//! byte wanted, the response stream lagging one byte behind. Chip select is
//! asserted once per logical transaction, which is exactly what one
//! `SpiDevice` transaction guarantees.

use embedded_hal::spi::{Operation, SpiDevice};

use super::driver::FIFO_SIZE;
use super::regs::{Command, Reg};
use crate::pcd::PcdError;

/// How the chip is wired to the MCU. Only SPI is implemented; the other
/// interfaces the chip offers are accepted by the type and rejected at use.
pub enum Connection<Spi> {
    Spi(Spi),
    I2c,
    Uart,
}

pub(crate) struct RegisterBus<Spi> {
    conn: Connection<Spi>,
}

const fn addr(reg: Reg, read: bool) -> u8 {
    ((read as u8) << 7) | ((reg as u8 & 0x3F) << 1)
}

impl<Spi: SpiDevice> RegisterBus<Spi> {
    pub(crate) fn new(conn: Connection<Spi>) -> Self {
        Self { conn }
    }

    pub(crate) fn write(&mut self, reg: Reg, value: u8) -> Result<(), PcdError> {
        match &mut self.conn {
            Connection::Spi(spi) => spi
                .write(&[addr(reg, false), value])
                .map_err(|_| PcdError::Failure),
            Connection::I2c | Connection::Uart => Err(PcdError::Unimplemented),
        }
    }

    pub(crate) fn read(&mut self, reg: Reg) -> Result<u8, PcdError> {
        match &mut self.conn {
            Connection::Spi(spi) => {
                let mut buf = [addr(reg, true), 0x00];
                spi.transfer_in_place(&mut buf)
                    .map_err(|_| PcdError::Failure)?;
                Ok(buf[1])
            }
            Connection::I2c | Connection::Uart => Err(PcdError::Unimplemented),
        }
    }

    pub(crate) fn write_burst(&mut self, reg: Reg, values: &[u8]) -> Result<(), PcdError> {
        match &mut self.conn {
            Connection::Spi(spi) => spi
                .transaction(&mut [
                    Operation::Write(&[addr(reg, false)]),
                    Operation::Write(values),
                ])
                .map_err(|_| PcdError::Failure),
            Connection::I2c | Connection::Uart => Err(PcdError::Unimplemented),
        }
    }

    pub(crate) fn read_burst(&mut self, reg: Reg, out: &mut [u8]) -> Result<(), PcdError> {
        match &mut self.conn {
            Connection::Spi(spi) => {
                // Every clocked-out byte repeats the read address so the chip
                // keeps streaming the register.
                let tx = [addr(reg, true); FIFO_SIZE];
                let len = out.len().min(FIFO_SIZE);
                spi.transaction(&mut [
                    Operation::Write(&[addr(reg, true)]),
                    Operation::Transfer(&mut out[..len], &tx[..len]),
                ])
                .map_err(|_| PcdError::Failure)
            }
            Connection::I2c | Connection::Uart => Err(PcdError::Unimplemented),
        }
    }

    pub(crate) fn set_bits(&mut self, reg: Reg, mask: u8) -> Result<(), PcdError> {
        let value = self.read(reg)?;
        self.write(reg, value | mask)
    }

    pub(crate) fn clear_bits(&mut self, reg: Reg, mask: u8) -> Result<(), PcdError> {
        let value = self.read(reg)?;
        self.write(reg, value & !mask)
    }

    pub(crate) fn write_masked(&mut self, reg: Reg, mask: u8, data: u8) -> Result<(), PcdError> {
        let value = self.read(reg)?;
        self.write(reg, (value & !mask) | data)
    }

    pub(crate) fn command(&mut self, command: Command) -> Result<(), PcdError> {
        self.write(Reg::Command, command as u8)
    }
}

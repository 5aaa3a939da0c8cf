//! Driver state machine and the transceive engine.

use embassy_time::{Duration, Timer};
use embedded_hal::digital::OutputPin;
use embedded_hal::spi::SpiDevice;

use super::bus::{Connection, RegisterBus};
use super::config::Mfrc522Config;
use super::irq::{self, IrqChannel, IrqSlot, Wakeup};
use super::regs::{COMMAND_MASK, Command, Reg, bits};
use super::selftest;
use crate::fmt::{debug, warning};
use crate::pcd::{
    FeatureKind, FeatureRequest, FeatureResponse, Mode, ModeMask, Pcd, PcdError, PcdRecover,
    PcdState, ResponseRead, Speed, SpeedMask, SupportedParams, Transceive,
};

/// Depth of the chip's FIFO, which bounds both frame directions.
pub const FIFO_SIZE: usize = 64;

/// Oscillator start-up time after the reset line is released.
const OSC_STARTUP_US: u64 = 40;

/// MFRC522 driver instance. One instance owns one chip.
///
/// Freshly constructed instances sit in the `Stop` state with the hardware
/// untouched; `start` brings the chip up and `stop` parks it again. All
/// the contactless work goes through the [`Pcd`] implementation.
pub struct Mfrc522<Spi, Rst> {
    bus: RegisterBus<Spi>,
    reset: Rst,
    channel: IrqChannel,
    irq: Option<&'static IrqSlot>,
    state: PcdState,
    config: Mfrc522Config,
    rx_speed: Speed,
    tx_speed: Speed,
    mode: Mode,
    response: [u8; FIFO_SIZE],
    resp_length: u8,
    resp_read_bytes: u8,
    resp_last_valid_bits: u8,
}

impl<Spi: SpiDevice, Rst: OutputPin> Mfrc522<Spi, Rst> {
    /// Object initialization; no hardware is touched until `start`.
    ///
    /// `reset` is the line that holds the chip in reset while low and
    /// `channel` the external-interrupt channel its IRQ pin is wired to.
    pub fn new(conn: Connection<Spi>, reset: Rst, channel: IrqChannel) -> Self {
        Self {
            bus: RegisterBus::new(conn),
            reset,
            channel,
            irq: None,
            state: PcdState::Stop,
            config: Mfrc522Config::default(),
            rx_speed: Speed::Kbd106,
            tx_speed: Speed::Kbd106,
            mode: Mode::IsoA,
            response: [0; FIFO_SIZE],
            resp_length: 0,
            resp_read_bytes: 0,
            resp_last_valid_bits: 8,
        }
    }

    fn require_state(&self, allowed: &[PcdState]) -> Result<(), PcdError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(PcdError::BadState)
        }
    }

    /// Brings the chip out of reset and applies `config`; `Stop` -> `RfOff`.
    pub async fn start(&mut self, config: Mfrc522Config) -> Result<(), PcdError> {
        self.require_state(&[PcdState::Stop])?;

        self.reset.set_high().map_err(|_| PcdError::Failure)?;
        Timer::after_micros(OSC_STARTUP_US).await;

        match self.start_registers(config) {
            Ok(()) => {
                self.state = PcdState::RfOff;
                self.set_params(Speed::Kbd106, Speed::Kbd106, Mode::IsoA, false, false)?;
                debug!("mfrc522: started");
                Ok(())
            }
            Err(error) => {
                if let Some(slot) = self.irq.take() {
                    irq::unbind(slot);
                }
                let _ = self.reset.set_low();
                Err(error)
            }
        }
    }

    fn start_registers(&mut self, config: Mfrc522Config) -> Result<(), PcdError> {
        self.bus.command(Command::SoftReset)?;

        // Mask all communication interrupts, then drive the IRQ pin
        // push-pull with everything else masked too.
        self.bus.write(Reg::ComIEn, 0)?;
        self.bus.write(Reg::DivIEn, bits::IRQ_PUSH_PULL)?;

        // Each chip hangs off its own interrupt channel; nothing else may
        // share it.
        self.irq = Some(irq::bind(self.channel));

        self.config = config;
        self.apply_config()
    }

    /// Reapplies a configuration; allowed with the RF field on or off.
    /// Interrupt wiring is never changed by this.
    pub fn reconfigure(&mut self, config: Mfrc522Config) -> Result<(), PcdError> {
        self.require_state(&[PcdState::RfOff, PcdState::Ready])?;
        self.config = config;
        self.apply_config()
    }

    pub(super) fn apply_config(&mut self) -> Result<(), PcdError> {
        let config = self.config;

        self.bus.write_masked(
            Reg::Mode,
            bits::POL_MFIN | bits::CRC_PRESET_MASK,
            (u8::from(config.mfin_polarity) << bits::POL_MFIN_SHIFT) | bits::CRC_PRESET_6363,
        )?;
        self.bus.write_masked(
            Reg::TxMode,
            bits::INV_MOD,
            if config.invert_modulation { bits::INV_MOD } else { 0 },
        )?;
        self.bus.write(Reg::TxControl, config.tx_control)?;
        self.bus.write_masked(
            Reg::TxSel,
            bits::DRIVER_SEL_MASK | bits::MFOUT_SEL_MASK,
            ((config.driver_input as u8) << bits::DRIVER_SEL_SHIFT) | config.mfout as u8,
        )?;
        self.bus.write_masked(
            Reg::RxSel,
            bits::UART_SEL_MASK,
            (config.cl_uart_input as u8) << bits::UART_SEL_SHIFT,
        )?;
        self.bus.write_masked(
            Reg::RxThreshold,
            bits::MIN_LEVEL_MASK | bits::COLL_LEVEL_MASK,
            ((config.rx_signal_strength & 0xF) << bits::MIN_LEVEL_SHIFT)
                | (config.rx_collision_level & bits::COLL_LEVEL_MASK),
        )?;
        self.bus.write(Reg::Demod, config.demod)?;
        self.bus.write_masked(
            Reg::RfCfg,
            bits::RX_GAIN_MASK,
            (config.rx_gain as u8) << bits::RX_GAIN_SHIFT,
        )?;
        self.bus.write(
            Reg::GsN,
            ((config.tx_power_n & 0xF) << bits::CW_GSN_SHIFT) | (config.mod_index_n & 0xF),
        )?;
        self.bus
            .write_masked(Reg::CwGsP, bits::GSP_MASK, config.tx_power_p & bits::GSP_MASK)?;
        self.bus
            .write_masked(Reg::ModGsP, bits::GSP_MASK, config.mod_index_p & bits::GSP_MASK)?;

        // Keep the received values frozen at the collision, otherwise the
        // collision position is gone by the time the interrupt is handled.
        self.bus.clear_bits(Reg::Coll, bits::VALUES_AFTER_COLL)
    }

    /// Parks the chip in reset; allowed from any state.
    pub fn stop(&mut self) {
        if let Some(slot) = self.irq.take() {
            irq::unbind(slot);
        }
        let _ = self.reset.set_low();
        self.state = PcdState::Stop;
    }

    // --- common transceive machinery ---

    fn prepare_transceive(&mut self) -> Result<(), PcdError> {
        self.bus.write(Reg::FifoLevel, bits::FIFO_FLUSH)?;

        // Writing ones with Set1 low clears every interrupt flag.
        self.bus.write(Reg::ComIrq, 0xFF & !bits::SET1)?;
        if let Some(slot) = self.irq {
            slot.clear_pending();
        }

        // The flags we are about to enable must be clear here. A set one
        // means a driver bug or an overheating module; halt either way.
        let irqs = self.bus.read(Reg::ComIrq)? & (bits::RX_I | bits::ERR_I);
        assert!(irqs == 0, "mfrc522: unexpected irq bit before transceive");

        self.bus.set_bits(Reg::ComIEn, bits::RX_I | bits::ERR_I)?;
        self.bus.command(Command::Transceive)
    }

    async fn wait_for_response(&self, timeout_us: u32) -> Wakeup {
        let slot = self.irq.expect("transceive on a stopped driver");
        slot.wait(Duration::from_micros(u64::from(timeout_us))).await
    }

    fn handle_response(
        &mut self,
        wakeup: Wakeup,
        collisions_possible: bool,
    ) -> Result<Transceive, PcdError> {
        match wakeup {
            Wakeup::Timeout => return Ok(Transceive::Timeout),
            Wakeup::Interrupt | Wakeup::PendingInterrupt => {}
        }

        let mut collision_happened = false;
        let error = self.bus.read(Reg::Error)?;
        if error != 0 {
            // Parity, CRC and protocol trouble is the receiver's; a FIFO
            // write conflict or thermal shutdown is the transmitter's. The
            // card layer retries both.
            if error & bits::ERR_BUFFER_OVFL != 0 {
                return Err(PcdError::RxOverflow);
            } else if error & bits::ERR_COLL != 0 && collisions_possible {
                collision_happened = true;
            } else if error & (bits::ERR_PARITY | bits::ERR_CRC | bits::ERR_PROTOCOL) != 0 {
                return Err(PcdError::Rx);
            } else if error & (bits::ERR_WR | bits::ERR_TEMP) != 0 {
                return Err(PcdError::Tx);
            } else {
                return Err(PcdError::Failure);
            }
        }

        self.resp_read_bytes = 0;
        if collision_happened {
            let coll = self.bus.read(Reg::Coll)?;
            if coll & bits::COLL_POS_NOT_VALID != 0 {
                // The collision sits past the 32nd received bit, i.e. in the
                // BCC of an anticollision frame. This driver does not
                // resolve those.
                return Err(PcdError::Failure);
            }
            // Collision position: 1 = first received bit, 0 means the 32nd.
            let coll_pos = coll & bits::COLL_POS_MASK;
            let valid_bits = coll_pos.wrapping_sub(1) & 31;
            self.resp_length = valid_bits / 8 + 1;
            self.resp_last_valid_bits = valid_bits % 8;
        } else {
            self.resp_last_valid_bits = 8;
            self.resp_length = (self.bus.read(Reg::FifoLevel)? & 0x7F).min(FIFO_SIZE as u8);
        }
        if self.resp_length != 0 {
            let length = usize::from(self.resp_length);
            let (bus, response) = (&mut self.bus, &mut self.response);
            bus.read_burst(Reg::FifoData, &mut response[..length])?;
        }

        Ok(if collision_happened {
            Transceive::Collision { len: self.resp_length }
        } else {
            Transceive::Done { len: self.resp_length }
        })
    }

    fn cleanup_transceive(&mut self) {
        // Best effort on every path out of a transceive; an Idle command
        // also clears the error bits.
        let _ = self.bus.write(Reg::BitFraming, 0);
        let _ = self.bus.clear_bits(Reg::ComIEn, bits::RX_I | bits::ERR_I);
        let _ = self.bus.command(Command::Idle);
        let _ = self.bus.write(Reg::ComIrq, 0xFF & !bits::SET1);
        if let Some(slot) = self.irq {
            slot.clear_pending();
        }
    }

    fn finish_transceive(
        &mut self,
        result: Result<Transceive, PcdError>,
    ) -> Result<Transceive, PcdError> {
        self.cleanup_transceive();
        self.state = PcdState::Ready;
        result
    }

    // --- self-test ---

    pub(super) async fn run_self_test(&mut self) -> Result<bool, PcdError> {
        self.bus.command(Command::SoftReset)?;

        // Clear the 25-byte internal memory through the FIFO.
        self.bus.write_burst(Reg::FifoData, &[0; 25])?;
        self.bus.command(Command::Mem)?;

        self.bus.write(Reg::AutoTest, bits::SELF_TEST_ENABLED)?;
        self.bus.write(Reg::FifoData, 0)?;
        self.bus.command(Command::CalcCrc)?;

        // The test takes a moment; poll until the command register falls
        // back to Idle, yielding so other tasks keep running.
        loop {
            let command = self.bus.read(Reg::Command)? & COMMAND_MASK;
            if command == Command::Idle as u8 {
                break;
            }
            embassy_futures::yield_now().await;
        }

        let mut fifo = [0u8; FIFO_SIZE];
        self.bus.read_burst(Reg::FifoData, &mut fifo)?;

        // The test clobbered the register file; restore the stored
        // configuration before judging the result.
        self.apply_config()?;

        let version = self.bus.read(Reg::Version)?;
        let passed = match selftest::expected_pattern(version) {
            Some(expected) => fifo == *expected,
            None => {
                warning!("mfrc522: unknown version {}", version);
                false
            }
        };
        Ok(passed)
    }
}

const fn speed_code(speed: Speed) -> u8 {
    match speed {
        Speed::Kbd106 => 0b000,
        Speed::Kbd212 => 0b001,
        Speed::Kbd424 => 0b010,
        Speed::Kbd848 => 0b011,
    }
}

impl<Spi: SpiDevice, Rst: OutputPin> Pcd for Mfrc522<Spi, Rst> {
    fn state(&self) -> PcdState {
        self.state
    }

    fn activate_rf(&mut self) -> Result<(), PcdError> {
        self.require_state(&[PcdState::RfOff])?;
        self.bus
            .set_bits(Reg::TxControl, bits::TX1_RF_EN | bits::TX2_RF_EN)?;
        self.state = PcdState::Ready;
        Ok(())
    }

    fn deactivate_rf(&mut self) -> Result<(), PcdError> {
        self.require_state(&[PcdState::Ready])?;
        self.bus
            .clear_bits(Reg::TxControl, bits::TX1_RF_EN | bits::TX2_RF_EN)?;
        self.state = PcdState::RfOff;
        Ok(())
    }

    fn supported_params(&self) -> SupportedParams {
        SupportedParams {
            speeds_a: SpeedMask::ALL,
            speeds_b: SpeedMask::NONE,
            asymmetric_speeds: true,
            modes: ModeMask::A,
            max_tx_size: FIFO_SIZE as u16,
            max_rx_size: FIFO_SIZE as u16,
        }
    }

    fn set_params(
        &mut self,
        rx: Speed,
        tx: Speed,
        mode: Mode,
        tx_crc: bool,
        rx_crc: bool,
    ) -> Result<(), PcdError> {
        self.require_state(&[PcdState::Ready, PcdState::RfOff])?;
        if mode != Mode::IsoA {
            return Err(PcdError::Unsupported);
        }

        self.bus.write_masked(
            Reg::TxMode,
            bits::SPEED_MASK | bits::CRC_EN,
            (speed_code(tx) << bits::SPEED_SHIFT) | if tx_crc { bits::CRC_EN } else { 0 },
        )?;
        self.bus.write_masked(
            Reg::RxMode,
            bits::SPEED_MASK | bits::CRC_EN,
            (speed_code(rx) << bits::SPEED_SHIFT) | if rx_crc { bits::CRC_EN } else { 0 },
        )?;

        // The standard mandates 100 % ASK at 106 kBd in mode A.
        if rx == Speed::Kbd106 && tx == Speed::Kbd106 && mode == Mode::IsoA {
            self.bus.set_bits(Reg::TxAsk, bits::FORCE_100ASK)?;
        } else {
            self.bus.clear_bits(Reg::TxAsk, bits::FORCE_100ASK)?;
        }

        self.rx_speed = rx;
        self.tx_speed = tx;
        self.mode = mode;
        Ok(())
    }

    async fn transceive_short(
        &mut self,
        data: u8,
        timeout_us: u32,
    ) -> Result<Transceive, PcdError> {
        self.require_state(&[PcdState::Ready])?;
        self.state = PcdState::Active;

        let result = async {
            self.prepare_transceive()?;
            self.bus.write(Reg::FifoData, data)?;
            // Transmit the 7 low bits only.
            self.bus.write(Reg::BitFraming, bits::START_SEND | 7)?;
            let wakeup = self.wait_for_response(timeout_us).await;
            self.handle_response(wakeup, true)
        };
        let result = result.await;
        self.finish_transceive(result)
    }

    async fn transceive_standard(
        &mut self,
        frame: &[u8],
        timeout_us: u32,
    ) -> Result<Transceive, PcdError> {
        self.require_state(&[PcdState::Ready])?;
        if frame.len() > FIFO_SIZE {
            return Err(PcdError::TxOverflow);
        }
        self.state = PcdState::Active;

        let result = async {
            self.prepare_transceive()?;
            self.bus.write_burst(Reg::FifoData, frame)?;
            self.bus.write(Reg::BitFraming, bits::START_SEND)?;
            let wakeup = self.wait_for_response(timeout_us).await;
            self.handle_response(wakeup, false)
        };
        let result = result.await;
        self.finish_transceive(result)
    }

    async fn transceive_anticoll(
        &mut self,
        frame: &[u8],
        tx_last_bits: u8,
        rx_align: u8,
        timeout_us: u32,
    ) -> Result<Transceive, PcdError> {
        self.require_state(&[PcdState::Ready])?;
        if frame.len() > FIFO_SIZE {
            return Err(PcdError::TxOverflow);
        }
        // Anticollision only works at the base speed in mode A.
        if self.rx_speed != Speed::Kbd106
            || self.tx_speed != Speed::Kbd106
            || self.mode != Mode::IsoA
        {
            return Err(PcdError::Unsupported);
        }
        self.state = PcdState::Active;

        let result = async {
            self.prepare_transceive()?;
            self.bus.write_burst(Reg::FifoData, frame)?;
            self.bus.write(
                Reg::BitFraming,
                bits::START_SEND
                    | ((rx_align & bits::TX_LAST_BITS_MASK) << bits::RX_ALIGN_SHIFT)
                    | (tx_last_bits & bits::TX_LAST_BITS_MASK),
            )?;
            let wakeup = self.wait_for_response(timeout_us).await;
            self.handle_response(wakeup, true)
        };
        let result = result.await;
        self.finish_transceive(result)
    }

    fn response_length(&self) -> Result<u8, PcdError> {
        self.require_state(&[PcdState::Ready, PcdState::RfOff])?;
        Ok(self.resp_length - self.resp_read_bytes)
    }

    fn read_response(&mut self, out: &mut [u8]) -> Result<ResponseRead, PcdError> {
        self.require_state(&[PcdState::Ready, PcdState::RfOff])?;

        let remaining = usize::from(self.resp_length - self.resp_read_bytes);
        let size_copied = out.len().min(remaining);
        let start = usize::from(self.resp_read_bytes);
        out[..size_copied].copy_from_slice(&self.response[start..start + size_copied]);
        self.resp_read_bytes += size_copied as u8;

        let n_last_bits = if self.resp_read_bytes == self.resp_length {
            self.resp_last_valid_bits
        } else {
            8
        };
        Ok(ResponseRead {
            size_copied: size_copied as u8,
            n_last_bits,
        })
    }

    fn discard_response(&mut self) -> Result<(), PcdError> {
        self.require_state(&[PcdState::Ready, PcdState::RfOff])?;
        self.resp_length = 0;
        self.resp_read_bytes = 0;
        self.resp_last_valid_bits = 8;
        Ok(())
    }

    fn feature_supported(&self, feature: FeatureKind) -> bool {
        feature == FeatureKind::SelfTest
    }

    async fn call_feature(
        &mut self,
        request: FeatureRequest<'_>,
    ) -> Result<FeatureResponse, PcdError> {
        self.require_state(&[PcdState::Ready, PcdState::RfOff])?;
        match request {
            FeatureRequest::SelfTest => {
                let passed = self.run_self_test().await?;
                Ok(FeatureResponse::SelfTest { passed })
            }
            FeatureRequest::CalcCrcA { .. } | FeatureRequest::MifareAuth { .. } => {
                Err(PcdError::Unsupported)
            }
        }
    }
}

impl<Spi: SpiDevice, Rst: OutputPin> PcdRecover for Mfrc522<Spi, Rst> {
    async fn recover(&mut self) {
        let config = self.config;
        self.stop();
        if self.start(config).await.is_err() {
            warning!("mfrc522: recovery start failed; module stays down");
        }
    }
}

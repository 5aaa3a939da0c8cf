//! Tuning knobs of the MFRC522 analog and framing frontend.
//!
//! The defaults work out of the box with the common RFID-RC522 modules; the
//! other values exist for boards that route an external modulator through
//! the MFIN/MFOUT pins. Register/page references are to the MFRC522
//! datasheet.

/// Input selection for the TX1/TX2 antenna drivers (TxSelReg, page 51).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum DriverInput {
    /// 3-state during soft power-down.
    ThreeState = 0b00,
    /// Miller-pulse-encoded envelope from the internal encoder.
    Encoder = 0b01,
    /// Envelope from pin MFIN.
    Mfin = 0b10,
    /// Constant HIGH (subject to the InvTxXRF bits).
    High = 0b11,
}

/// Output selection for pin MFOUT (TxSelReg, page 52).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum MfOut {
    ThreeState = 0b0000,
    Low = 0b0001,
    High = 0b0010,
    /// Test bus signal selected by TestSel1Reg.
    TestBus = 0b0011,
    /// Miller-pulse-encoded envelope from the internal encoder.
    Encoder = 0b0100,
    /// Serial TX data stream before the Miller encoder.
    PreMiller = 0b0101,
    /// Serial RX data stream after the Manchester decoder.
    PostManchester = 0b0111,
}

/// Input selection for the contactless UART (RxSelReg, page 52).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum ClUartInput {
    /// Constant LOW.
    Low = 0b00,
    /// Manchester with subcarrier from pin MFIN.
    ManchesterMfin = 0b01,
    /// Modulated signal from the internal analog frontend.
    Analog = 0b10,
    /// NRZ without subcarrier from pin MFIN (valid above 106 kBd only).
    NrzMfin = 0b11,
}

/// Receiver gain (RFCfgReg, page 59).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum RxGain {
    Db18 = 0b000,
    Db23 = 0b001,
    Db33 = 0b100,
    Db38 = 0b101,
    Db43 = 0b110,
    Db48 = 0b111,
}

/// Configuration applied by `Mfrc522::start` and `Mfrc522::reconfigure`.
///
/// Interrupt wiring (the EXTI channel and reset line) is passed to the
/// driver constructor instead; reconfiguring never rebinds interrupts.
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Mfrc522Config {
    /// MFIN is active HIGH (page 48).
    pub mfin_polarity: bool,
    /// Invert the modulation of transmitted data (page 49).
    pub invert_modulation: bool,
    /// Raw image of the transmission control register (page 50).
    pub tx_control: u8,
    pub driver_input: DriverInput,
    pub mfout: MfOut,
    pub cl_uart_input: ClUartInput,
    /// Minimum signal strength accepted by the decoder, 4 bits (page 53).
    pub rx_signal_strength: u8,
    /// Minimum relative strength of the weaker Manchester half-bit that
    /// still counts as a collision, 3 bits (page 53).
    pub rx_collision_level: u8,
    /// Raw image of the demodulator register (page 53).
    pub demod: u8,
    pub rx_gain: RxGain,
    /// Conductance of the output n-driver: TX power, 4 bits (page 59).
    pub tx_power_n: u8,
    /// Conductance of the output n-driver: modulation index, 4 bits.
    pub mod_index_n: u8,
    /// Conductance of the output p-driver: TX power, 6 bits (page 60).
    pub tx_power_p: u8,
    /// Conductance of the output p-driver: modulation index, 6 bits.
    pub mod_index_p: u8,
}

impl Default for Mfrc522Config {
    fn default() -> Self {
        Self {
            mfin_polarity: true,
            invert_modulation: false,
            tx_control: 0x80,
            driver_input: DriverInput::Encoder,
            mfout: MfOut::ThreeState,
            cl_uart_input: ClUartInput::Analog,
            rx_signal_strength: 8,
            rx_collision_level: 4,
            demod: 0x4D,
            rx_gain: RxGain::Db33,
            tx_power_n: 8,
            mod_index_n: 8,
            tx_power_p: 32,
            mod_index_p: 32,
        }
    }
}

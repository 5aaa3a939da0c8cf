//! Abstract ISO/IEC 14443 proximity-coupling device (PCD) interface.
//!
//! The reader side of the contactless link is modelled as a trait so that the
//! card protocol in [`crate::iso14443`] works against any PCD: the MFRC522
//! driver on the board, or a simulated card field in the host tests. The
//! interface is deliberately frame-level; everything card-specific (cascades,
//! UIDs, SAKs) lives one layer up.

use derive_more::derive::{Display, Error};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;

/// States of the PCD state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PcdState {
    /// Object exists, nothing initialized yet.
    Uninit,
    /// Initialized, hardware held in reset.
    Stop,
    /// Configured, RF field off.
    RfOff,
    /// RF field on, ready to transmit.
    Ready,
    /// A transceive operation is in flight.
    Active,
}

/// Contactless transfer speeds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Speed {
    Kbd106,
    Kbd212,
    Kbd424,
    Kbd848,
}

/// Standard communication modes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Mode {
    IsoA,
    IsoB,
}

/// A set of [`Speed`]s, one bit per speed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct SpeedMask(u8);

impl SpeedMask {
    pub const NONE: Self = Self(0);
    pub const ALL: Self = Self(0b1111);

    #[must_use]
    pub const fn with(self, speed: Speed) -> Self {
        Self(self.0 | 1 << speed as u8)
    }

    #[must_use]
    pub const fn contains(self, speed: Speed) -> bool {
        self.0 & (1 << speed as u8) != 0
    }
}

/// A set of [`Mode`]s, one bit per mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct ModeMask(u8);

impl ModeMask {
    pub const NONE: Self = Self(0);
    pub const A: Self = Self(1 << Mode::IsoA as u8);
    pub const B: Self = Self(1 << Mode::IsoB as u8);

    #[must_use]
    pub const fn with(self, mode: Mode) -> Self {
        Self(self.0 | 1 << mode as u8)
    }

    #[must_use]
    pub const fn contains(self, mode: Mode) -> bool {
        self.0 & (1 << mode as u8) != 0
    }
}

/// Communication parameters a PCD supports, as reported by
/// [`Pcd::supported_params`].
#[derive(Clone, Copy, Debug)]
pub struct SupportedParams {
    /// Speeds usable in mode A.
    pub speeds_a: SpeedMask,
    /// Speeds usable in mode B.
    pub speeds_b: SpeedMask,
    /// Whether rx and tx speed may differ.
    pub asymmetric_speeds: bool,
    /// Modes the device can operate in.
    pub modes: ModeMask,
    /// Maximum transmit frame size in bytes (0 = unlimited).
    pub max_tx_size: u16,
    /// Maximum receive frame size in bytes (0 = unlimited).
    pub max_rx_size: u16,
}

/// Successful outcomes of a transceive operation. Collisions and card
/// silence are expected events during anticollision, not errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Transceive {
    /// A complete response was received; `len` bytes wait in the response
    /// queue.
    Done { len: u8 },
    /// A bit collision occurred; the queue holds the bytes up to and
    /// including the collided bit.
    Collision { len: u8 },
    /// The field stayed silent for the whole timeout.
    Timeout,
}

/// Error codes surfaced by the PCD contract.
#[expect(missing_docs, reason = "The variants mirror the PCD contract.")]
#[derive(Clone, Copy, Debug, Display, Error, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PcdError {
    #[display("operation not allowed in the current device state")]
    BadState,
    #[display("parameter combination not supported by this device")]
    Unsupported,
    #[display("connection interface not implemented")]
    Unimplemented,
    #[display("transmitter failure")]
    Tx,
    #[display("receiver failure")]
    Rx,
    #[display("receive buffer overflow")]
    RxOverflow,
    #[display("transmit frame too large for this device")]
    TxOverflow,
    #[display("communication with the device failed")]
    Failure,
}

/// Result of one [`Pcd::read_response`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResponseRead {
    /// Bytes actually copied out of the response queue.
    pub size_copied: u8,
    /// Valid bits in the last byte copied; 8 unless the final queue byte
    /// was among the copied ones.
    pub n_last_bits: u8,
}

/// Extended (device-specific, optional) feature identifiers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FeatureKind {
    SelfTest,
    CalcCrcA,
    MifareAuth,
}

/// Invocation of an extended feature, one variant per feature.
#[derive(Clone, Copy, Debug)]
pub enum FeatureRequest<'a> {
    /// Run the device's digital self-test.
    SelfTest,
    /// Have the device compute the ISO14443-A CRC of `data`.
    CalcCrcA { data: &'a [u8] },
    /// Classic-card sector authentication.
    MifareAuth {
        command: u8,
        block: u8,
        sector_key: [u8; 6],
        card_serial: [u8; 4],
    },
}

impl FeatureRequest<'_> {
    #[must_use]
    pub const fn kind(&self) -> FeatureKind {
        match self {
            Self::SelfTest => FeatureKind::SelfTest,
            Self::CalcCrcA { .. } => FeatureKind::CalcCrcA,
            Self::MifareAuth { .. } => FeatureKind::MifareAuth,
        }
    }
}

/// Response of an extended feature call, matching the request variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeatureResponse {
    SelfTest { passed: bool },
    CalcCrcA { crc: u16 },
    MifareAuth { granted: bool },
}

/// A generic ISO/IEC 14443 proximity-coupling device.
///
/// Drivers are not internally thread safe; a device shared between tasks is
/// wrapped in a [`SharedPcd`] and every client holds the scoped lock for the
/// whole protocol exchange it performs.
pub trait Pcd {
    /// Current state of the device state machine.
    fn state(&self) -> PcdState;

    /// Turns the RF field on. Allowed in `RfOff` only.
    fn activate_rf(&mut self) -> Result<(), PcdError>;

    /// Turns the RF field off. Allowed in `Ready` only.
    fn deactivate_rf(&mut self) -> Result<(), PcdError>;

    /// Communication parameters this device can be asked for.
    fn supported_params(&self) -> SupportedParams;

    /// Sets speeds, mode and CRC handling for subsequent frames. Allowed in
    /// `Ready` and `RfOff`; an unsupported combination leaves the device
    /// untouched.
    fn set_params(
        &mut self,
        rx: Speed,
        tx: Speed,
        mode: Mode,
        tx_crc: bool,
        rx_crc: bool,
    ) -> Result<(), PcdError>;

    /// Transmits a short frame (7 data bits, no parity) and waits for the
    /// response for at most `timeout_us`.
    async fn transceive_short(&mut self, data: u8, timeout_us: u32)
    -> Result<Transceive, PcdError>;

    /// Transmits a standard frame (whole bytes) and waits for the response.
    async fn transceive_standard(
        &mut self,
        frame: &[u8],
        timeout_us: u32,
    ) -> Result<Transceive, PcdError>;

    /// Transmits the reader part of an anticollision frame. `tx_last_bits`
    /// is the number of valid bits in the last byte sent (0 = all eight);
    /// the received bits are aligned so the first one lands at position
    /// `rx_align` of the first response byte.
    async fn transceive_anticoll(
        &mut self,
        frame: &[u8],
        tx_last_bits: u8,
        rx_align: u8,
        timeout_us: u32,
    ) -> Result<Transceive, PcdError>;

    /// Bytes still waiting in the response queue.
    fn response_length(&self) -> Result<u8, PcdError>;

    /// Copies up to `out.len()` bytes out of the response queue, advancing
    /// the read cursor. Bytes received first are copied first.
    fn read_response(&mut self, out: &mut [u8]) -> Result<ResponseRead, PcdError>;

    /// Drops whatever is left in the response queue.
    fn discard_response(&mut self) -> Result<(), PcdError>;

    /// Whether the device implements the given extended feature.
    fn feature_supported(&self, feature: FeatureKind) -> bool;

    /// Invokes an extended feature. Unsupported features report
    /// [`PcdError::Unsupported`].
    async fn call_feature(
        &mut self,
        request: FeatureRequest<'_>,
    ) -> Result<FeatureResponse, PcdError>;
}

/// Power-cycle recovery for a reader that stopped responding sanely. The
/// card-id task invokes this after a failed RF transition so the field is
/// known to be off afterwards.
pub trait PcdRecover {
    async fn recover(&mut self);
}

/// A PCD shared between tasks. Locking yields a scoped guard; the bus is
/// released when the guard drops, early returns included.
pub type SharedPcd<P> = Mutex<CriticalSectionRawMutex, P>;

#[cfg(test)]
mod tests {
    use super::{Speed, SpeedMask};

    #[test]
    fn speed_mask_round_trips() {
        let mask = SpeedMask::NONE.with(Speed::Kbd106).with(Speed::Kbd848);
        assert!(mask.contains(Speed::Kbd106));
        assert!(!mask.contains(Speed::Kbd212));
        assert!(mask.contains(Speed::Kbd848));
        assert_eq!(SpeedMask::ALL, mask.with(Speed::Kbd212).with(Speed::Kbd424));
    }
}

//! Interface of the controller link layer.
//!
//! The link layer (an external collaborator) turns a lossy byte stream
//! into reliable framed datagrams and tracks whether the controller on the
//! far end is alive. It is internally synchronized: the comm task drives it
//! from two tasks at once, one feeding received bytes, one transmitting.

use embassy_time::Duration;

/// Longest datagram the link layer will carry.
pub const MAX_FRAME_LEN: usize = 256;

/// Whether a controller is currently reachable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkState {
    Up,
    Down,
}

/// A reliable, connection-oriented datagram link.
pub trait Link {
    fn state(&self) -> LinkState;

    /// One time-bounded attempt to (re)establish the link. Returns when the
    /// link is up or the attempt is abandoned; the caller just calls again.
    async fn connect(&self);

    /// Feeds one received byte into the link-layer state machine.
    fn feed(&self, byte: u8);

    /// Takes a completely received datagram, if one is waiting.
    fn take_frame(&self, out: &mut [u8; MAX_FRAME_LEN]) -> Option<usize>;

    /// Transmits one datagram; returns once it is handed to the wire.
    async fn send(&self, frame: &[u8]);
}

/// The raw byte pipe underneath the link layer (a UART on the board).
pub trait Transport {
    /// Reads a single byte, giving up after `timeout`.
    async fn read_byte(&mut self, timeout: Duration) -> Option<u8>;
}

//! Stand-in for the external link-layer and CRPM codec crate.
//!
//! The real firmware links the controller-link crate here. This stub keeps
//! the link permanently down (every connect attempt just waits out its
//! window), so the rest of the firmware runs, shows the error UI and keeps
//! the watchdog fed while the board sits on a bench without a controller.

use embassy_time::Timer;
use reader_kit::crpm::{CodecError, CrpmCodec, CrpmIn, CrpmOut};
use reader_kit::link::{Link, LinkState, MAX_FRAME_LEN};

pub struct StubLink(());

impl StubLink {
    pub const fn new() -> Self {
        Self(())
    }
}

impl Link for StubLink {
    fn state(&self) -> LinkState {
        LinkState::Down
    }

    async fn connect(&self) {
        // One "attempt" per second keeps the control loop cooperative.
        Timer::after_millis(1_000).await;
    }

    fn feed(&self, _byte: u8) {}

    fn take_frame(&self, _out: &mut [u8; MAX_FRAME_LEN]) -> Option<usize> {
        None
    }

    async fn send(&self, _frame: &[u8]) {}
}

pub struct StubCodec;

impl CrpmCodec for StubCodec {
    fn encode(&mut self, _message: &CrpmOut, _out: &mut [u8]) -> Result<usize, CodecError> {
        Ok(0)
    }

    fn decode(&mut self, _frame: &[u8]) -> Result<CrpmIn, CodecError> {
        Err(CodecError::Malformed)
    }
}

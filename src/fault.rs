//! Hard-fault capture.
//!
//! Invariant violations in this firmware panic (`panic-probe` prints them
//! over RTT); genuine processor faults land here. The handler parks the
//! core after logging the stacked frame, which starves the heartbeat rule
//! and lets the hardware watchdog reboot the board.

#[cfg(target_os = "none")]
use cortex_m_rt::{ExceptionFrame, exception};

#[cfg(target_os = "none")]
#[exception]
unsafe fn HardFault(frame: &ExceptionFrame) -> ! {
    #[cfg(feature = "defmt")]
    defmt::error!("hard fault: {}", defmt::Debug2Format(frame));
    loop {
        cortex_m::asm::bkpt();
    }
}

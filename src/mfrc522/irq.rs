//! Interrupt plumbing between the chip's IRQ line and the task waiting on a
//! transceive.
//!
//! A small fixed registry maps external-interrupt channels to drivers. The
//! dispatch runs in the interrupt context; it may only flip the pending flag
//! and wake the registered waker. The pending flag closes the classic
//! missed-wakeup race: the waiting side re-checks it after registering its
//! waker, so an edge that fires between "start the chip" and "suspend" is
//! consumed instead of lost. Each channel carries exactly one reader and
//! nothing else.

use core::cell::Cell;
use core::future::poll_fn;
use core::task::Poll;

use critical_section::Mutex;
use embassy_sync::waitqueue::AtomicWaker;
use embassy_time::{Duration, with_timeout};
use portable_atomic::{AtomicBool, Ordering};

/// How many MFRC522 modules one firmware image can drive.
pub const MAX_DEVICES: usize = 1;

/// Identifies the external-interrupt channel a chip's IRQ pin is wired to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct IrqChannel(pub u8);

/// Why a transceive wait returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Wakeup {
    /// The IRQ fired while we were suspended.
    Interrupt,
    /// The IRQ had already fired before we got around to suspending.
    PendingInterrupt,
    /// The caller's timeout ran out first.
    Timeout,
}

pub(crate) struct IrqSlot {
    channel: Mutex<Cell<Option<IrqChannel>>>,
    pending: AtomicBool,
    waker: AtomicWaker,
}

impl IrqSlot {
    const NEW: Self = Self {
        channel: Mutex::new(Cell::new(None)),
        pending: AtomicBool::new(false),
        waker: AtomicWaker::new(),
    };

    pub(crate) fn clear_pending(&self) {
        self.pending.store(false, Ordering::Release);
    }

    fn take_pending(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }

    /// Suspends the caller until the bound IRQ fires or `timeout` passes.
    /// A latched edge is consumed without suspending at all.
    pub(crate) async fn wait(&self, timeout: Duration) -> Wakeup {
        if self.take_pending() {
            return Wakeup::PendingInterrupt;
        }
        let fired = poll_fn(|cx| {
            // Register first, check second; the dispatch may run in between
            // and must find the waker.
            self.waker.register(cx.waker());
            if self.take_pending() {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        });
        match with_timeout(timeout, fired).await {
            Ok(()) => Wakeup::Interrupt,
            Err(_) => Wakeup::Timeout,
        }
    }
}

static REGISTRY: [IrqSlot; MAX_DEVICES] = [IrqSlot::NEW; MAX_DEVICES];

/// Claims a registry slot for `channel`. Panics when the registry is full
/// or the channel is already taken; both mean the board wiring and
/// `MAX_DEVICES` disagree, which no runtime handling can fix.
pub(crate) fn bind(channel: IrqChannel) -> &'static IrqSlot {
    critical_section::with(|cs| {
        let taken = REGISTRY
            .iter()
            .any(|slot| slot.channel.borrow(cs).get() == Some(channel));
        assert!(!taken, "mfrc522: interrupt channel bound twice");
        for slot in &REGISTRY {
            if slot.channel.borrow(cs).get().is_none() {
                slot.clear_pending();
                slot.channel.borrow(cs).set(Some(channel));
                return slot;
            }
        }
        panic!("mfrc522: maximum number of active modules exceeded");
    })
}

/// Releases a slot claimed by [`bind`].
pub(crate) fn unbind(slot: &'static IrqSlot) {
    critical_section::with(|cs| {
        slot.channel.borrow(cs).set(None);
        slot.clear_pending();
    });
}

/// Interrupt dispatch: marks the interrupt pending for the driver bound to
/// `channel` and wakes its waiter. Called from the interrupt context (or
/// the edge-pump task standing in for it); anything further happens in the
/// woken task.
pub fn isr_dispatch(channel: IrqChannel) {
    critical_section::with(|cs| {
        // MAX_DEVICES is tiny, so the walk is fine inside the lock.
        for slot in &REGISTRY {
            if slot.channel.borrow(cs).get() == Some(channel) {
                slot.pending.store(true, Ordering::Release);
                slot.waker.wake();
                break;
            }
        }
    });
}

/// Forwards rising edges of the chip's IRQ pin into [`isr_dispatch`].
#[cfg(feature = "pico1")]
#[embassy_executor::task]
pub async fn irq_pump(mut pin: embassy_rp::gpio::Input<'static>, channel: IrqChannel) -> ! {
    loop {
        pin.wait_for_rising_edge().await;
        isr_dispatch(channel);
    }
}

//! Card-id task: polls the RF field and reports the UIDs it finds.
//!
//! The master arms polling explicitly; one successful poll delivers its
//! cards and disarms again, so every batch of UIDs the controller gets was
//! asked for. While polling is off the RF field is kept down and the
//! reader module idles in low power.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;
use embassy_time::Timer;
use heapless::Vec;

use crate::crpm::PiccUid;
use crate::fmt::{info, warning};
use crate::heartbeat::{Heartbeat, TaskId};
use crate::iso14443::{self, MAX_CARDS_PER_POLL};
use crate::pcd::{Pcd, PcdRecover, SharedPcd};
use crate::tasks::master::{MasterInbox, MasterMsg};

/// The poll switch. The mutex also serializes a stop request against a
/// delivery in flight: `stop_polling` blocks until a concurrent
/// `card_detected` delivery has finished, after which no delivery happens
/// until the next `start_polling`.
pub struct CardIdControl {
    poll: Mutex<CriticalSectionRawMutex, bool>,
}

impl CardIdControl {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            poll: Mutex::new(false),
        }
    }

    pub async fn start_polling(&self) {
        *self.poll.lock().await = true;
    }

    pub async fn stop_polling(&self) {
        *self.poll.lock().await = false;
    }
}

impl Default for CardIdControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Task body. `pcd` is the shared reader; the bus lock is held for one
/// whole poll cycle at a time.
pub async fn run<P: Pcd + PcdRecover>(
    control: &CardIdControl,
    pcd: &SharedPcd<P>,
    master: &MasterInbox,
    heartbeat: &Heartbeat,
) -> ! {
    let mut reader_active = false;

    loop {
        // An unlocked read is fine here: a racing change costs at most one
        // extra poll cycle, and delivery re-checks under the lock below.
        let poll_this_cycle = *control.poll.lock().await;

        // Reconcile the RF field with the poll switch.
        if poll_this_cycle != reader_active {
            let mut reader = pcd.lock().await;
            let result = if poll_this_cycle {
                reader.activate_rf()
            } else {
                reader.deactivate_rf()
            };
            match result {
                Ok(()) => reader_active = poll_this_cycle,
                Err(error) => {
                    warning!("cardid: rf transition failed: {}", error);
                    let mut poll = control.poll.lock().await;
                    master.send(MasterMsg::ReaderError).await;
                    *poll = false;
                    reader_active = false;
                    // The module is in an unknown state; power-cycle it so
                    // the RF field is known to be off.
                    reader.recover().await;
                }
            }
        }

        if poll_this_cycle && reader_active {
            let found = {
                let mut reader = pcd.lock().await;
                iso14443::find_cards::<P, MAX_CARDS_PER_POLL>(&mut *reader).await
            };
            match found {
                Ok(found) if !found.cards.is_empty() => {
                    info!("cardid: {} card(s) in the field", found.cards.len());
                    let mut poll = control.poll.lock().await;
                    // A stop that raced the scan wins: the results are
                    // discarded, nothing is delivered.
                    if *poll {
                        let uids: Vec<PiccUid, MAX_CARDS_PER_POLL> =
                            found.cards.iter().map(PiccUid::from).collect();
                        master.send(MasterMsg::CardDetected(uids)).await;
                    }
                    // One delivery per arming, found or discarded.
                    *poll = false;
                }
                Ok(_) => {}
                Err(error) => {
                    warning!("cardid: poll failed: {}", error);
                    let mut poll = control.poll.lock().await;
                    master.send(MasterMsg::ReaderError).await;
                    *poll = false;
                    reader_active = false;
                    pcd.lock().await.recover().await;
                }
            }
        } else {
            Timer::after_millis(100).await;
        }

        heartbeat.mark(TaskId::CardId);
    }
}

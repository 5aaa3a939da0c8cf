//! Comm task: everything between the master inbox and the serial wire.
//!
//! Two sub-tasks share the link layer. The control side keeps the link
//! connected and drains the outbox, encoding each message through the
//! external codec. The receive side pumps bytes from the transport into
//! the link, watches the link state, and dispatches decoded CRPMs to the
//! master; message kinds the reader has no business with are silently
//! ignored, malformed payloads are silently dropped.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_time::{Duration, with_timeout};

use crate::crpm::{AuthMethod, CrpmCodec, CrpmIn, CrpmOut};
use crate::fmt::{debug, info};
use crate::heartbeat::{Heartbeat, TaskId};
use crate::link::{Link, LinkState, MAX_FRAME_LEN, Transport};
use crate::tasks::master::{MasterInbox, MasterMsg};

pub const OUTBOX_DEPTH: usize = 5;
pub type CommOutbox = Channel<CriticalSectionRawMutex, CrpmOut, OUTBOX_DEPTH>;

/// How long the control side blocks on the outbox before heartbeating.
const OUTBOX_FETCH_TIMEOUT: Duration = Duration::from_millis(10);
/// How long the receive side waits for a byte before looking around.
const READ_TIMEOUT: Duration = Duration::from_millis(10);

/// Control sub-task body: reconnect while down, transmit while up.
pub async fn run_control<L: Link, C: CrpmCodec>(
    link: &L,
    codec: &mut C,
    outbox: &CommOutbox,
    heartbeat: &Heartbeat,
) -> ! {
    loop {
        if link.state() == LinkState::Down {
            link.connect().await;
        } else if let Ok(message) = with_timeout(OUTBOX_FETCH_TIMEOUT, outbox.receive()).await {
            let mut wire = [0u8; MAX_FRAME_LEN];
            // Failing to encode our own message is a bug, not a condition.
            let len = codec
                .encode(&message, &mut wire)
                .expect("CRPM encoding failed");
            link.send(&wire[..len]).await;
        }
        heartbeat.mark(TaskId::CommControl);
    }
}

/// Receive sub-task body: byte pump, link-state watch, CRPM dispatch.
pub async fn run_receive<T: Transport, L: Link, C: CrpmCodec>(
    transport: &mut T,
    link: &L,
    codec: &mut C,
    master: &MasterInbox,
    heartbeat: &Heartbeat,
) -> ! {
    let mut last_state = LinkState::Down;

    loop {
        if let Some(byte) = transport.read_byte(READ_TIMEOUT).await {
            link.feed(byte);
        }

        let state = link.state();
        if state != last_state {
            info!("link {}", state);
            master.send(MasterMsg::LinkChange(state)).await;
            last_state = state;
        }

        let mut frame = [0u8; MAX_FRAME_LEN];
        if let Some(len) = link.take_frame(&mut frame) {
            match codec.decode(&frame[..len]) {
                Ok(CrpmIn::SysQueryRequest) => {
                    master.send(MasterMsg::SysQueryRequest).await;
                }
                Ok(CrpmIn::ActivateAuthMethods(methods)) => {
                    // An activation set without the one method this reader
                    // implements deactivates it.
                    let msg = if methods.contains(&AuthMethod::PiccUuid) {
                        MasterMsg::ActivateAuthMethods(methods)
                    } else {
                        MasterMsg::DeactivateAuthMethods
                    };
                    master.send(msg).await;
                }
                Ok(CrpmIn::UiUpdate(ui_state)) => {
                    master.send(MasterMsg::UiUpdate(ui_state)).await;
                }
                Ok(CrpmIn::Other) => {}
                Err(_) => {
                    debug!("comm: dropping malformed frame");
                }
            }
        }

        heartbeat.mark(TaskId::CommReceive);
    }
}

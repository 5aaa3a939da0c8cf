//! Master task: the reader's overall state machine.
//!
//! Everything the other tasks learn flows into the master inbox; the
//! master reacts by steering card polling, the UI and the outgoing
//! controller traffic. The decision logic is a pure core so the host tests
//! can trace it message by message; the task body applies the resulting
//! effects and runs the watchdog rule.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_time::{Duration, with_timeout};
use heapless::Vec;

use crate::crpm::{
    AuthMethod, CrpmOut, MAX_AUTH_METHODS, PiccUid, SERIAL_LEN, SysQueryResponse, UiClass0State,
};
use crate::fmt::info;
use crate::heartbeat::{FeedWatchdog, Heartbeat};
use crate::iso14443::MAX_CARDS_PER_POLL as MAX_CARDS;
use crate::link::LinkState;
use crate::tasks::cardid::CardIdControl;
use crate::tasks::comm::CommOutbox;
use crate::tasks::ui::{UiCommand, UiFlash, UiInbox, UiPersistent};

pub const INBOX_DEPTH: usize = 10;
pub type MasterInbox = Channel<CriticalSectionRawMutex, MasterMsg, INBOX_DEPTH>;

/// Everything the master can be told.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MasterMsg {
    CardDetected(Vec<PiccUid, MAX_CARDS>),
    ReaderError,
    LinkChange(LinkState),
    SysQueryRequest,
    ActivateAuthMethods(Vec<AuthMethod, MAX_AUTH_METHODS>),
    DeactivateAuthMethods,
    UiUpdate(UiClass0State),
}

/// Master states. `Active` means auth method 0 is on and the reader polls
/// for cards.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MasterState {
    Disconnected,
    Inactive,
    Active,
}

/// Identity constants reported in the System Query Response.
#[derive(Clone, Copy, Debug)]
pub struct BoardInfo {
    pub rdr_class: u16,
    pub hw_model: u16,
    pub hw_rev: u16,
    pub serial: [u8; SERIAL_LEN],
    pub sw_ver_major: u8,
    pub sw_ver_minor: u8,
}

/// What one handled message asks the task body to do.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Effect {
    Send(CrpmOut),
    StartPolling,
    StopPolling,
    SetUi(UiPersistent),
    Flash(UiFlash),
}

/// The decision logic, free of I/O.
pub struct MasterCore {
    state: MasterState,
    board: BoardInfo,
}

impl MasterCore {
    #[must_use]
    pub fn new(board: BoardInfo) -> Self {
        Self {
            state: MasterState::Disconnected,
            board,
        }
    }

    #[must_use]
    pub fn state(&self) -> MasterState {
        self.state
    }

    /// Consumes one message, returns the effects to apply.
    pub fn handle(&mut self, msg: MasterMsg) -> Vec<Effect, 4> {
        let mut effects = Vec::new();

        if self.state == MasterState::Disconnected {
            // Nothing but the link coming up matters while disconnected.
            if msg == MasterMsg::LinkChange(LinkState::Up) {
                self.state = MasterState::Inactive;
            }
            return effects;
        }

        match msg {
            MasterMsg::CardDetected(cards) => {
                if self.state == MasterState::Active {
                    let _ = effects.push(Effect::Send(CrpmOut::Am0GotUids(cards)));
                    // The card-id task disarmed itself on delivery; keep
                    // the reader polling while the method stays active.
                    let _ = effects.push(Effect::StartPolling);
                }
            }
            MasterMsg::ReaderError => {
                let mut text = heapless::String::new();
                let _ = text.push_str("Reader module failed!");
                let _ = effects.push(Effect::Send(CrpmOut::ReaderFailure(text)));
                let _ = effects.push(Effect::StopPolling);
                let _ = effects.push(Effect::SetUi(UiPersistent::Error));
                self.state = MasterState::Inactive;
            }
            MasterMsg::LinkChange(LinkState::Down) => {
                let _ = effects.push(Effect::StopPolling);
                let _ = effects.push(Effect::SetUi(UiPersistent::Error));
                self.state = MasterState::Disconnected;
            }
            MasterMsg::LinkChange(LinkState::Up) => {}
            MasterMsg::SysQueryRequest => {
                let _ = effects.push(Effect::Send(CrpmOut::SysQueryResponse(SysQueryResponse {
                    rdr_class: self.board.rdr_class,
                    hw_model: self.board.hw_model,
                    hw_rev: self.board.hw_rev,
                    serial: self.board.serial,
                    sw_ver_major: self.board.sw_ver_major,
                    sw_ver_minor: self.board.sw_ver_minor,
                })));
            }
            MasterMsg::ActivateAuthMethods(methods) => {
                if methods.contains(&AuthMethod::PiccUuid) {
                    if self.state != MasterState::Active {
                        let _ = effects.push(Effect::StartPolling);
                        self.state = MasterState::Active;
                    }
                } else if self.state != MasterState::Inactive {
                    let _ = effects.push(Effect::StopPolling);
                    self.state = MasterState::Inactive;
                }
            }
            MasterMsg::DeactivateAuthMethods => {
                if self.state != MasterState::Inactive {
                    let _ = effects.push(Effect::StopPolling);
                    self.state = MasterState::Inactive;
                }
            }
            MasterMsg::UiUpdate(ui_state) => match ui_state {
                UiClass0State::DoorClosed => {
                    let _ = effects.push(Effect::SetUi(UiPersistent::Locked));
                }
                UiClass0State::IdAcceptedDoorUnlocked => {
                    let _ = effects.push(Effect::SetUi(UiPersistent::Unlocked));
                    let _ = effects.push(Effect::Flash(UiFlash::ReadOk));
                }
                UiClass0State::IdRejected => {
                    let _ = effects.push(Effect::Flash(UiFlash::ReadFail));
                }
                UiClass0State::DoorPermanentlyUnlocked => {
                    let _ = effects.push(Effect::SetUi(UiPersistent::Unlocked));
                }
                UiClass0State::DoorPermanentlyLocked => {
                    let _ = effects.push(Effect::SetUi(UiPersistent::Locked));
                }
                UiClass0State::SystemFailure => {
                    let _ = effects.push(Effect::SetUi(UiPersistent::Error));
                }
                // No good representation on this UI class.
                UiClass0State::DoorOpenTooLong => {}
            },
        }

        effects
    }
}

/// Task body: applies core effects and feeds the watchdog when every
/// watched task has heartbeaten since the last iteration.
pub async fn run<W: FeedWatchdog>(
    board: BoardInfo,
    inbox: &MasterInbox,
    outbox: &CommOutbox,
    ui: &UiInbox,
    cardid: &CardIdControl,
    heartbeat: &Heartbeat,
    watchdog: &mut W,
) -> ! {
    let mut core = MasterCore::new(board);

    // Power-on UI: error until the controller says otherwise.
    ui.send(UiCommand::SetState(UiPersistent::Error)).await;

    loop {
        if let Ok(msg) = with_timeout(Duration::from_millis(100), inbox.receive()).await {
            let effects = core.handle(msg);
            for effect in effects {
                match effect {
                    Effect::Send(message) => outbox.send(message).await,
                    Effect::StartPolling => cardid.start_polling().await,
                    Effect::StopPolling => cardid.stop_polling().await,
                    Effect::SetUi(state) => ui.send(UiCommand::SetState(state)).await,
                    Effect::Flash(flash) => ui.send(UiCommand::Flash(flash)).await,
                }
            }
            info!("master state: {}", core.state());
        }

        if heartbeat.all_alive() {
            watchdog.feed();
        }
    }
}

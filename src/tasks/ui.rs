//! User-interface task: two bi-color LEDs and a piezo beeper.
//!
//! The UI shows one persistent state (system error, door locked, door
//! unlocked) until told otherwise, and can overlay a one-shot "flash"
//! sequence for transient events (card accepted, card rejected). Both are
//! tapes over static step sequences, advanced on a 100 ms tick; while a
//! flash is running the persistent tape is paused, and when it ends the
//! persistent pattern reasserts itself through the looping SET actions.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_time::{Duration, with_timeout};

use crate::heartbeat::{Heartbeat, TaskId};

/// What a step does to one LED.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LedAction {
    #[default]
    NoChange,
    Set,
    Clear,
}

/// The four board LEDs (two bi-color packages).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(usize)]
pub enum Led {
    StatusRed = 0,
    StatusGreen = 1,
    LockRed = 2,
    LockGreen = 3,
}

pub const LED_COUNT: usize = 4;

/// Output state one sequence step asks for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UiState {
    /// Beeper half-period in 2 MHz ticks; 0 keeps the beeper silent.
    pub buzzer_half_period: u16,
    pub leds: [LedAction; LED_COUNT],
}

/// Beeper half-period for a tone frequency.
const fn tone(freq_hz: u32) -> u16 {
    (1_000_000 / freq_hz) as u16
}

impl UiState {
    const QUIET: Self = Self {
        buzzer_half_period: 0,
        leds: [LedAction::NoChange; LED_COUNT],
    };

    const fn with_tone(mut self, freq_hz: u32) -> Self {
        self.buzzer_half_period = tone(freq_hz);
        self
    }

    const fn set(mut self, led: Led) -> Self {
        self.leds[led as usize] = LedAction::Set;
        self
    }

    const fn clear(mut self, led: Led) -> Self {
        self.leds[led as usize] = LedAction::Clear;
        self
    }
}

/// One element of a UI sequence: a state and how long to hold it.
#[derive(Clone, Copy, Debug)]
pub struct UiStep {
    pub state: UiState,
    /// Hold time in 100 ms ticks; never zero.
    pub duration: u8,
}

const fn step(state: UiState, duration: u8) -> UiStep {
    UiStep { state, duration }
}

/// Persistent UI states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UiPersistent {
    /// Status LED blinking red. The power-on default.
    Error,
    /// Status green, lock red.
    Locked,
    /// Status green, lock green.
    Unlocked,
}

/// One-shot flash sequences overlaid on the persistent state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UiFlash {
    /// Card read and accepted: one long high beep.
    ReadOk,
    /// Card read but rejected: three short low beeps, lock blinking red.
    ReadFail,
}

/// Commands understood by the UI task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UiCommand {
    SetState(UiPersistent),
    Flash(UiFlash),
}

pub const UI_INBOX_DEPTH: usize = 5;
pub type UiInbox = Channel<CriticalSectionRawMutex, UiCommand, UI_INBOX_DEPTH>;

/// 1 Hz red blink on the status LED.
static ERROR_SEQ: [UiStep; 2] = [
    step(UiState::QUIET.set(Led::StatusRed), 5),
    step(UiState::QUIET.clear(Led::StatusRed), 5),
];

static LOCKED_SEQ: [UiStep; 1] = [step(UiState::QUIET.set(Led::StatusGreen).set(Led::LockRed), 10)];

static UNLOCKED_SEQ: [UiStep; 1] =
    [step(UiState::QUIET.set(Led::StatusGreen).set(Led::LockGreen), 10)];

/// One second of a high tone.
static READ_OK_SEQ: [UiStep; 1] = [step(UiState::QUIET.with_tone(880), 10)];

/// Three low bursts with the lock LED blinking red in time.
static READ_FAIL_SEQ: [UiStep; 6] = [
    step(UiState::QUIET.with_tone(220).set(Led::LockRed), 2),
    step(UiState::QUIET.clear(Led::LockRed), 2),
    step(UiState::QUIET.with_tone(220).set(Led::LockRed), 2),
    step(UiState::QUIET.clear(Led::LockRed), 2),
    step(UiState::QUIET.with_tone(220).set(Led::LockRed), 2),
    step(UiState::QUIET.clear(Led::LockRed), 2),
];

const fn persistent_seq(state: UiPersistent) -> &'static [UiStep] {
    match state {
        UiPersistent::Error => &ERROR_SEQ,
        UiPersistent::Locked => &LOCKED_SEQ,
        UiPersistent::Unlocked => &UNLOCKED_SEQ,
    }
}

const fn flash_seq(flash: UiFlash) -> &'static [UiStep] {
    match flash {
        UiFlash::ReadOk => &READ_OK_SEQ,
        UiFlash::ReadFail => &READ_FAIL_SEQ,
    }
}

/// Position in one sequence.
struct Tape {
    seq: &'static [UiStep],
    position: usize,
    remaining: u8,
}

impl Tape {
    fn new(seq: &'static [UiStep]) -> Self {
        Self {
            seq,
            position: 0,
            remaining: 0,
        }
    }

    /// The state to hold for this tick, or `None` when a one-shot sequence
    /// has run out.
    fn tick(&mut self, looping: bool) -> Option<UiState> {
        if self.position >= self.seq.len() {
            if looping {
                self.position = 0;
            } else {
                return None;
            }
        }
        let current = &self.seq[self.position];
        if self.remaining == 0 {
            self.remaining = current.duration;
        }
        self.remaining -= 1;
        if self.remaining == 0 {
            self.position += 1;
        }
        Some(current.state)
    }

    fn rewind(&mut self) {
        self.position = 0;
        self.remaining = 0;
    }
}

/// Raw output levels the engine asks the board to drive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UiOutputs {
    pub buzzer_half_period: u16,
    pub leds: [bool; LED_COUNT],
}

/// The tape sequencer, separated from the hardware so it can run on the
/// host in tests.
pub struct UiEngine {
    persistent: Tape,
    flash: Option<Tape>,
    outputs: UiOutputs,
}

impl UiEngine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            persistent: Tape::new(persistent_seq(UiPersistent::Error)),
            flash: None,
            outputs: UiOutputs::default(),
        }
    }

    pub fn handle(&mut self, command: UiCommand) {
        match command {
            UiCommand::SetState(state) => {
                self.persistent = Tape::new(persistent_seq(state));
                if let Some(flash) = &mut self.flash {
                    flash.rewind();
                }
                // Sequences use SET actions only and rely on this clear
                // for their return-to-off.
                self.outputs = UiOutputs::default();
            }
            UiCommand::Flash(flash) => {
                self.flash = Some(Tape::new(flash_seq(flash)));
            }
        }
    }

    /// Advances the active tape by one 100 ms tick.
    pub fn tick(&mut self) {
        if let Some(flash) = &mut self.flash {
            match flash.tick(false) {
                Some(state) => {
                    self.apply(state);
                    return;
                }
                None => {
                    self.flash = None;
                    self.outputs = UiOutputs::default();
                }
            }
        }
        if let Some(state) = self.persistent.tick(true) {
            self.apply(state);
        }
    }

    fn apply(&mut self, state: UiState) {
        self.outputs.buzzer_half_period = state.buzzer_half_period;
        for (level, action) in self.outputs.leds.iter_mut().zip(state.leds) {
            match action {
                LedAction::NoChange => {}
                LedAction::Set => *level = true,
                LedAction::Clear => *level = false,
            }
        }
    }

    #[must_use]
    pub fn outputs(&self) -> UiOutputs {
        self.outputs
    }
}

impl Default for UiEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// What the task needs from the board: four LED lines and a tone timer.
pub trait UiBoard {
    fn apply(&mut self, outputs: &UiOutputs);
}

/// Task body. One iteration per 100 ms (or per command, whichever comes
/// first), heartbeat after every iteration.
pub async fn run<B: UiBoard>(inbox: &UiInbox, board: &mut B, heartbeat: &Heartbeat) -> ! {
    let mut engine = UiEngine::new();
    loop {
        if let Ok(command) = with_timeout(Duration::from_millis(100), inbox.receive()).await {
            engine.handle(command);
        }
        engine.tick();
        board.apply(&engine.outputs());
        heartbeat.mark(TaskId::Ui);
    }
}

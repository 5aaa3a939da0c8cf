//! MFRC522 driver tests against a register-level chip model.
//!
//! The model decodes the SPI framing the same way the silicon does (so a
//! framing bug shows up as a register landing in the wrong place), tracks
//! the FIFO, and answers transceive attempts from a per-test script. The
//! interrupt side goes through the real dispatch, either synchronously
//! (the latched-pending path) or from a helper thread (the suspension
//! path).

mod common;

use std::collections::VecDeque;
use std::convert::Infallible;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration as StdDuration;

use common::block_on;
use embedded_hal::digital::OutputPin;
use embedded_hal::spi::{Operation, SpiDevice};
use reader_kit::mfrc522::{Connection, IrqChannel, Mfrc522, Mfrc522Config};
use reader_kit::pcd::{FeatureRequest, FeatureResponse, Mode, Pcd, PcdError, PcdState, Speed, Transceive};

// Register numbers as the chip sees them.
const COMMAND: u8 = 0x01;
const COM_IEN: u8 = 0x02;
const DIV_IEN: u8 = 0x03;
const COM_IRQ: u8 = 0x04;
const ERROR: u8 = 0x06;
const FIFO_DATA: u8 = 0x09;
const FIFO_LEVEL: u8 = 0x0A;
const BIT_FRAMING: u8 = 0x0D;
const COLL: u8 = 0x0E;
const MODE: u8 = 0x11;
const TX_MODE: u8 = 0x12;
const TX_CONTROL: u8 = 0x14;
const TX_ASK: u8 = 0x15;
const RX_THRESHOLD: u8 = 0x18;
const DEMOD: u8 = 0x19;
const GS_N: u8 = 0x27;
const AUTO_TEST: u8 = 0x36;
const VERSION: u8 = 0x37;

const CMD_IDLE: u8 = 0x0;
const CMD_MEM: u8 = 0x1;
const CMD_CALC_CRC: u8 = 0x3;
const CMD_TRANSCEIVE: u8 = 0xC;
const CMD_SOFT_RESET: u8 = 0xF;

const IRQ_RX: u8 = 1 << 5;
const ERR_TEMP: u8 = 1 << 6;
const ERR_BUFFER_OVFL: u8 = 1 << 4;
const ERR_COLL: u8 = 1 << 3;
const ERR_PARITY: u8 = 1 << 1;
const COLL_POS_NOT_VALID: u8 = 1 << 5;

/// What the "card side" does when the driver fires a transceive.
enum Script {
    Reply { fifo: Vec<u8>, error: u8, coll: u8 },
    /// Reply after a delay, from another thread (the driver really
    /// suspends).
    Deferred { delay_ms: u64, fifo: Vec<u8> },
    /// No card answers.
    Silent,
}

struct ChipState {
    regs: [u8; 0x40],
    fifo: VecDeque<u8>,
    version: u8,
    selftest_pattern: Vec<u8>,
    reset_high: bool,
    scripts: VecDeque<Script>,
    /// First (address) byte of every SPI transaction.
    addr_log: Vec<u8>,
    /// Every value written to BitFramingReg.
    bit_framing_log: Vec<u8>,
    /// When set, ComIrqReg reads always report RxIRq (a stuck interrupt).
    stuck_irq: bool,
    channel: IrqChannel,
}

type Chip = Arc<Mutex<ChipState>>;

fn power_on_regs() -> [u8; 0x40] {
    let mut regs = [0u8; 0x40];
    // ValuesAfterColl starts set; the driver must clear it.
    regs[usize::from(COLL)] = 0x80;
    regs
}

impl ChipState {
    fn new(version: u8, selftest_pattern: Vec<u8>, channel: IrqChannel) -> Chip {
        Arc::new(Mutex::new(Self {
            regs: power_on_regs(),
            fifo: VecDeque::new(),
            version,
            selftest_pattern,
            reset_high: false,
            scripts: VecDeque::new(),
            addr_log: Vec::new(),
            bit_framing_log: Vec::new(),
            stuck_irq: false,
            channel,
        }))
    }

    fn reg(&self, reg: u8) -> u8 {
        self.regs[usize::from(reg)]
    }

    fn read_reg(&mut self, reg: u8) -> u8 {
        match reg {
            FIFO_DATA => self.fifo.pop_front().unwrap_or(0),
            FIFO_LEVEL => self.fifo.len() as u8,
            VERSION => self.version,
            COM_IRQ if self.stuck_irq => self.reg(COM_IRQ) | IRQ_RX,
            _ => self.reg(reg),
        }
    }

    fn write_reg(&mut self, chip: &Chip, reg: u8, value: u8) {
        match reg {
            COMMAND => {
                self.regs[usize::from(COMMAND)] = value & 0x0F;
                match value & 0x0F {
                    CMD_SOFT_RESET => {
                        self.regs = power_on_regs();
                        self.fifo.clear();
                    }
                    CMD_MEM => self.fifo.clear(),
                    CMD_CALC_CRC => {
                        if self.reg(AUTO_TEST) & 0x0F == 0b1001 {
                            self.fifo = self.selftest_pattern.iter().copied().collect();
                        }
                        // The command finishes "instantly".
                        self.regs[usize::from(COMMAND)] = CMD_IDLE;
                    }
                    _ => {}
                }
            }
            COM_IRQ => {
                // Set1 low: written ones clear; Set1 high: written ones set.
                if value & 0x80 == 0 {
                    self.regs[usize::from(COM_IRQ)] &= !(value & 0x7F);
                } else {
                    self.regs[usize::from(COM_IRQ)] |= value & 0x7F;
                }
            }
            FIFO_LEVEL => {
                if value & 0x80 != 0 {
                    self.fifo.clear();
                }
            }
            FIFO_DATA => self.fifo.push_back(value),
            BIT_FRAMING => {
                self.regs[usize::from(BIT_FRAMING)] = value;
                self.bit_framing_log.push(value);
                if value & 0x80 != 0 && self.reg(COMMAND) == CMD_TRANSCEIVE {
                    self.fire_script(chip);
                }
            }
            _ => self.regs[usize::from(reg)] = value,
        }
    }

    fn fire_script(&mut self, chip: &Chip) {
        match self.scripts.pop_front() {
            None | Some(Script::Silent) => {}
            Some(Script::Reply { fifo, error, coll }) => {
                self.fifo = fifo.into_iter().collect();
                self.regs[usize::from(ERROR)] = error;
                self.regs[usize::from(COLL)] = coll;
                self.regs[usize::from(COM_IRQ)] |= IRQ_RX;
                reader_kit::mfrc522::isr_dispatch(self.channel);
            }
            Some(Script::Deferred { delay_ms, fifo }) => {
                let chip = chip.clone();
                thread::spawn(move || {
                    thread::sleep(StdDuration::from_millis(delay_ms));
                    let channel = {
                        let mut state = chip.lock().unwrap();
                        state.fifo = fifo.into_iter().collect();
                        state.regs[usize::from(ERROR)] = 0;
                        state.regs[usize::from(COM_IRQ)] |= IRQ_RX;
                        state.channel
                    };
                    reader_kit::mfrc522::isr_dispatch(channel);
                });
            }
        }
    }
}

/// The SPI device handed to the driver; decodes the wire framing.
struct ChipSpi(Chip);

enum Access {
    Read(u8),
    Write(u8),
}

impl embedded_hal::spi::ErrorType for ChipSpi {
    type Error = Infallible;
}

impl SpiDevice for ChipSpi {
    fn transaction(&mut self, operations: &mut [Operation<'_, u8>]) -> Result<(), Infallible> {
        let chip = self.0.clone();
        let mut state = self.0.lock().unwrap();
        let mut access: Option<Access> = None;

        let mut clock = |state: &mut ChipState, mosi: u8| -> u8 {
            match &access {
                None => {
                    state.addr_log.push(mosi);
                    let reg = (mosi >> 1) & 0x3F;
                    access = Some(if mosi & 0x80 != 0 {
                        Access::Read(reg)
                    } else {
                        Access::Write(reg)
                    });
                    0
                }
                Some(Access::Read(reg)) => {
                    let reg = *reg;
                    state.read_reg(reg)
                }
                Some(Access::Write(reg)) => {
                    let reg = *reg;
                    state.write_reg(&chip, reg, mosi);
                    0
                }
            }
        };

        for operation in operations {
            match operation {
                Operation::Write(bytes) => {
                    for &byte in bytes.iter() {
                        clock(&mut state, byte);
                    }
                }
                Operation::Transfer(rx, tx) => {
                    for (out, &byte) in rx.iter_mut().zip(tx.iter()) {
                        *out = clock(&mut state, byte);
                    }
                }
                Operation::TransferInPlace(buffer) => {
                    for byte in buffer.iter_mut() {
                        *byte = clock(&mut state, *byte);
                    }
                }
                Operation::Read(buffer) => {
                    for byte in buffer.iter_mut() {
                        *byte = clock(&mut state, 0);
                    }
                }
                Operation::DelayNs(_) => {}
            }
        }
        Ok(())
    }
}

struct ResetPin(Chip);

impl embedded_hal::digital::ErrorType for ResetPin {
    type Error = Infallible;
}

impl OutputPin for ResetPin {
    fn set_low(&mut self) -> Result<(), Infallible> {
        self.0.lock().unwrap().reset_high = false;
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Infallible> {
        self.0.lock().unwrap().reset_high = true;
        Ok(())
    }
}

type Driver = Mfrc522<ChipSpi, ResetPin>;

/// The driver registry holds one slot, so tests that start a driver are
/// serialized and always release the slot, panics included.
static DRIVER_LOCK: Mutex<()> = Mutex::new(());

fn with_started_driver(
    version: u8,
    selftest_pattern: Vec<u8>,
    test: impl FnOnce(&mut Driver, &Chip),
) {
    let _guard: MutexGuard<'_, ()> = DRIVER_LOCK
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    let chip = ChipState::new(version, selftest_pattern, IrqChannel(7));
    let mut driver = Mfrc522::new(
        Connection::Spi(ChipSpi(chip.clone())),
        ResetPin(chip.clone()),
        IrqChannel(7),
    );
    block_on(driver.start(Mfrc522Config::default())).expect("driver start failed");

    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| test(&mut driver, &chip)));
    driver.stop();
    if let Err(panic) = outcome {
        std::panic::resume_unwind(panic);
    }
}

fn push_script(chip: &Chip, script: Script) {
    chip.lock().unwrap().scripts.push_back(script);
}

fn reg(chip: &Chip, reg: u8) -> u8 {
    chip.lock().unwrap().reg(reg)
}

/// The V2.0 reference pattern, as published for the self-test.
const V2_PATTERN: [u8; 64] = [
    0x00, 0xEB, 0x66, 0xBA, 0x57, 0xBF, 0x23, 0x95, 0xD0, 0xE3, 0x0D, 0x3D, 0x27, 0x89, 0x5C,
    0xDE, 0x9D, 0x3B, 0xA7, 0x00, 0x21, 0x5B, 0x89, 0x82, 0x51, 0x3A, 0xEB, 0x02, 0x0C, 0xA5,
    0x00, 0x49, 0x7C, 0x84, 0x4D, 0xB3, 0xCC, 0xD2, 0x1B, 0x81, 0x5D, 0x48, 0x76, 0xD5, 0x71,
    0x61, 0x21, 0xA9, 0x86, 0x96, 0x83, 0x38, 0xCF, 0x9D, 0x5B, 0x6D, 0xDC, 0x15, 0xBA, 0x3E,
    0x7D, 0x95, 0x3B, 0x2F,
];

#[test]
fn start_programs_the_radio() {
    with_started_driver(0x92, V2_PATTERN.to_vec(), |driver, chip| {
        assert_eq!(driver.state(), PcdState::RfOff);
        let state = chip.lock().unwrap();
        assert!(state.reset_high);
        // IRQ pin push-pull, communication interrupts masked.
        assert_eq!(state.reg(DIV_IEN), 0x80);
        assert_eq!(state.reg(COM_IEN), 0x00);
        // Configuration image: defaults straight from the datasheet.
        assert_eq!(state.reg(TX_CONTROL), 0x80);
        assert_eq!(state.reg(DEMOD), 0x4D);
        assert_eq!(state.reg(RX_THRESHOLD), 0x84);
        assert_eq!(state.reg(GS_N), 0x88);
        assert_eq!(state.reg(MODE) & 0x0B, 0x09);
        // 106 kBd mode A forces 100 % ASK.
        assert_eq!(state.reg(TX_ASK) & 0x40, 0x40);
        // Collision values latch at collision time.
        assert_eq!(state.reg(COLL) & 0x80, 0x00);
        // Wire framing: a write address and a read address both appeared.
        assert!(state.addr_log.contains(&((COMMAND) << 1)));
        assert!(state.addr_log.contains(&(0x80 | (MODE << 1))));
    });
}

#[test]
fn rf_transitions_and_bad_states() {
    with_started_driver(0x92, V2_PATTERN.to_vec(), |driver, chip| {
        assert_eq!(
            block_on(driver.transceive_short(0x52, 1_000)),
            Err(PcdError::BadState)
        );
        assert_eq!(driver.state(), PcdState::RfOff);

        driver.activate_rf().expect("rf on");
        assert_eq!(driver.state(), PcdState::Ready);
        assert_eq!(reg(chip, TX_CONTROL) & 0x03, 0x03);
        assert_eq!(driver.activate_rf(), Err(PcdError::BadState));
        assert_eq!(driver.state(), PcdState::Ready);

        driver.deactivate_rf().expect("rf off");
        assert_eq!(driver.state(), PcdState::RfOff);
        assert_eq!(reg(chip, TX_CONTROL) & 0x03, 0x00);
        assert_eq!(driver.deactivate_rf(), Err(PcdError::BadState));
    });
}

#[test]
fn short_frame_reads_back_an_atqa() {
    with_started_driver(0x92, V2_PATTERN.to_vec(), |driver, chip| {
        driver.activate_rf().expect("rf on");
        push_script(
            chip,
            Script::Reply {
                fifo: vec![0x04, 0x00],
                error: 0,
                coll: 0,
            },
        );

        let outcome = block_on(driver.transceive_short(0x52, 1_000)).expect("transceive");
        assert_eq!(outcome, Transceive::Done { len: 2 });
        assert_eq!(driver.state(), PcdState::Ready);
        assert_eq!(driver.response_length(), Ok(2));

        // Short frames transmit seven bits.
        assert!(chip.lock().unwrap().bit_framing_log.contains(&0x87));
        // Interrupts are off again and the framing register is clean.
        assert_eq!(reg(chip, COM_IEN), 0);
        assert_eq!(reg(chip, BIT_FRAMING), 0);

        // Empty-buffer reads consume nothing and report whole bytes.
        let read = driver.read_response(&mut []).expect("read");
        assert_eq!((read.size_copied, read.n_last_bits), (0, 8));
        assert_eq!(driver.response_length(), Ok(2));

        let mut byte = [0u8; 1];
        let read = driver.read_response(&mut byte).expect("read");
        assert_eq!((read.size_copied, read.n_last_bits), (1, 8));
        assert_eq!(byte[0], 0x04);

        let mut rest = [0u8; 8];
        let read = driver.read_response(&mut rest).expect("read");
        assert_eq!((read.size_copied, read.n_last_bits), (1, 8));
        assert_eq!(rest[0], 0x00);
        assert_eq!(driver.response_length(), Ok(0));
    });
}

#[test]
fn collision_position_maps_to_partial_bytes() {
    with_started_driver(0x92, V2_PATTERN.to_vec(), |driver, chip| {
        driver.activate_rf().expect("rf on");

        // Collision in the fifth received bit: one byte, four valid bits.
        push_script(
            chip,
            Script::Reply {
                fifo: vec![0x0B],
                error: ERR_COLL,
                coll: 5,
            },
        );
        let outcome = block_on(driver.transceive_anticoll(&[0x93, 0x20], 0, 0, 1_000));
        assert_eq!(outcome, Ok(Transceive::Collision { len: 1 }));
        let mut byte = [0u8; 1];
        let read = driver.read_response(&mut byte).expect("read");
        assert_eq!((read.size_copied, read.n_last_bits), (1, 4));

        // Collision position 0 means the 32nd bit: four whole bytes minus
        // the last bit.
        push_script(
            chip,
            Script::Reply {
                fifo: vec![1, 2, 3, 4],
                error: ERR_COLL,
                coll: 0,
            },
        );
        let outcome = block_on(driver.transceive_anticoll(&[0x93, 0x20], 0, 0, 1_000));
        assert_eq!(outcome, Ok(Transceive::Collision { len: 4 }));
        let mut bytes = [0u8; 4];
        let read = driver.read_response(&mut bytes).expect("read");
        assert_eq!((read.size_copied, read.n_last_bits), (4, 7));

        // A collision past the fourth byte is unresolvable.
        push_script(
            chip,
            Script::Reply {
                fifo: vec![],
                error: ERR_COLL,
                coll: COLL_POS_NOT_VALID,
            },
        );
        let outcome = block_on(driver.transceive_anticoll(&[0x93, 0x20], 0, 0, 1_000));
        assert_eq!(outcome, Err(PcdError::Failure));
        assert_eq!(driver.state(), PcdState::Ready);
    });
}

#[test]
fn error_register_outcomes() {
    with_started_driver(0x92, V2_PATTERN.to_vec(), |driver, chip| {
        driver.activate_rf().expect("rf on");

        push_script(
            chip,
            Script::Reply {
                fifo: vec![],
                error: ERR_BUFFER_OVFL,
                coll: 0,
            },
        );
        let outcome = block_on(driver.transceive_short(0x52, 1_000));
        assert_eq!(outcome, Err(PcdError::RxOverflow));

        // A collision during a standard frame is not expected and fails.
        push_script(
            chip,
            Script::Reply {
                fifo: vec![0xAA],
                error: ERR_COLL,
                coll: 3,
            },
        );
        let outcome = block_on(driver.transceive_standard(&[0x50, 0x00], 1_000));
        assert_eq!(outcome, Err(PcdError::Failure));
        assert_eq!(driver.state(), PcdState::Ready);

        // Receiver-side detection errors come back as Rx, transmitter
        // trouble as Tx; both are the retryable class.
        push_script(
            chip,
            Script::Reply {
                fifo: vec![],
                error: ERR_PARITY,
                coll: 0,
            },
        );
        let outcome = block_on(driver.transceive_short(0x52, 1_000));
        assert_eq!(outcome, Err(PcdError::Rx));

        push_script(
            chip,
            Script::Reply {
                fifo: vec![],
                error: ERR_TEMP,
                coll: 0,
            },
        );
        let outcome = block_on(driver.transceive_short(0x52, 1_000));
        assert_eq!(outcome, Err(PcdError::Tx));
    });
}

#[test]
fn silent_field_times_out() {
    with_started_driver(0x92, V2_PATTERN.to_vec(), |driver, chip| {
        driver.activate_rf().expect("rf on");
        push_script(chip, Script::Silent);
        let outcome = block_on(driver.transceive_short(0x52, 500)).expect("transceive");
        assert_eq!(outcome, Transceive::Timeout);
        assert_eq!(driver.state(), PcdState::Ready);
        assert_eq!(driver.response_length(), Ok(0));
    });
}

#[test]
fn deferred_interrupt_resumes_the_suspended_wait() {
    with_started_driver(0x92, V2_PATTERN.to_vec(), |driver, chip| {
        driver.activate_rf().expect("rf on");
        push_script(
            chip,
            Script::Deferred {
                delay_ms: 5,
                fifo: vec![0xAA],
            },
        );
        let outcome = block_on(driver.transceive_standard(&[1, 2, 3], 200_000)).expect("transceive");
        assert_eq!(outcome, Transceive::Done { len: 1 });
    });
}

#[test]
fn set_params_enforces_the_mode_and_ask() {
    with_started_driver(0x92, V2_PATTERN.to_vec(), |driver, chip| {
        assert_eq!(
            driver.set_params(Speed::Kbd106, Speed::Kbd106, Mode::IsoB, false, false),
            Err(PcdError::Unsupported)
        );

        driver
            .set_params(Speed::Kbd212, Speed::Kbd212, Mode::IsoA, false, false)
            .expect("set_params");
        assert_eq!(reg(chip, TX_MODE) & 0x70, 0x10);
        assert_eq!(reg(chip, TX_ASK) & 0x40, 0x00);

        // Anticollision frames demand the base speed.
        driver.activate_rf().expect("rf on");
        let outcome = block_on(driver.transceive_anticoll(&[0x93, 0x20], 0, 0, 1_000));
        assert_eq!(outcome, Err(PcdError::Unsupported));
    });
}

#[test]
fn oversized_frames_are_rejected() {
    with_started_driver(0x92, V2_PATTERN.to_vec(), |driver, _chip| {
        driver.activate_rf().expect("rf on");
        let frame = [0u8; 65];
        let outcome = block_on(driver.transceive_standard(&frame, 1_000));
        assert_eq!(outcome, Err(PcdError::TxOverflow));
        assert_eq!(driver.state(), PcdState::Ready);
    });
}

#[test]
fn selftest_passes_on_a_v2_chip() {
    with_started_driver(0x92, V2_PATTERN.to_vec(), |driver, chip| {
        let response = block_on(driver.call_feature(FeatureRequest::SelfTest)).expect("self-test");
        assert_eq!(response, FeatureResponse::SelfTest { passed: true });
        // The register file was wiped by the soft reset and restored from
        // the stored configuration afterwards.
        assert_eq!(reg(chip, DEMOD), 0x4D);
    });
}

#[test]
fn selftest_fails_on_a_corrupted_pattern() {
    let mut pattern = V2_PATTERN.to_vec();
    pattern[17] ^= 0x01;
    with_started_driver(0x92, pattern, |driver, _chip| {
        let response = block_on(driver.call_feature(FeatureRequest::SelfTest)).expect("self-test");
        assert_eq!(response, FeatureResponse::SelfTest { passed: false });
    });
}

#[test]
fn selftest_fails_on_an_unknown_version() {
    with_started_driver(0x13, V2_PATTERN.to_vec(), |driver, _chip| {
        let response = block_on(driver.call_feature(FeatureRequest::SelfTest)).expect("self-test");
        assert_eq!(response, FeatureResponse::SelfTest { passed: false });
    });
}

#[test]
fn unimplemented_features_say_so() {
    with_started_driver(0x92, V2_PATTERN.to_vec(), |driver, _chip| {
        assert!(!driver.feature_supported(reader_kit::pcd::FeatureKind::CalcCrcA));
        let outcome = block_on(driver.call_feature(FeatureRequest::CalcCrcA { data: &[1, 2] }));
        assert_eq!(outcome, Err(PcdError::Unsupported));
    });
}

#[test]
#[should_panic(expected = "unexpected irq bit")]
fn stuck_interrupt_halts_the_driver() {
    with_started_driver(0x92, V2_PATTERN.to_vec(), |driver, chip| {
        driver.activate_rf().expect("rf on");
        chip.lock().unwrap().stuck_irq = true;
        let _ = block_on(driver.transceive_short(0x52, 1_000));
    });
}

//! ISO/IEC 14443-3 type-A card activation and anticollision.
//!
//! [`find_cards`] enumerates the UIDs of every card in the RF field. The
//! anticollision frame is a 7-byte frame `{SEL, NVB, UID0..UID3, BCC}`
//! split anywhere after the 16th and before the 55th bit: the reader sends
//! the bits of the UID it already knows, every card whose UID matches that
//! prefix answers with the rest, and a bit where two cards disagree comes
//! back flagged as a collision. The walk forces each collided bit to 1
//! first, completes that branch (SELECT, possibly descending a cascade
//! level for 7- and 10-byte UIDs), then backtracks to the most significant
//! recorded collision with the bit forced to 0. The result is every UID in
//! the field, visited in UID-bit order, with one SELECT per card.

use heapless::Vec;

use crate::pcd::{Mode, Pcd, PcdError, PcdState, Speed, Transceive};

/// Longest UID the cascade can produce, in bytes.
pub const MAX_UID: usize = 10;

/// Most cards one `find_cards` call can report.
pub const MAX_CARDS_PER_POLL: usize = 10;

/// Wakes cards in the idle state only.
pub const REQA: u8 = 0x26;
/// Wakes all cards, the halted ones included.
pub const WUPA: u8 = 0x52;
/// Puts the selected card into the halt state.
pub const HLTA: u8 = 0x50;
/// SELECT/anticollision command codes per cascade level.
const SEL: [u8; 3] = [0x93, 0x95, 0x97];
const CASCADE_LEVELS: usize = 3;

/// SAK bit 2: the UID is incomplete, proceed to the next cascade level.
const SAK_UID_INCOMPLETE: u8 = 1 << 2;
/// SAK bit 5: the card speaks ISO/IEC 14443-4.
const SAK_ISO14443_4_COMPLIANT: u8 = 1 << 5;

// Frame delay times. For REQA, WUPA, SEL and HLTA the standard mandates
// 1172/fc or 1236/fc (~87/~92 us at fc = 13.56 MHz); 100 us covers both.
// A byte at 106 kBd takes 85 us with parity, plus 19 us start/stop, plus
// slack for reader, driver and scheduler overhead.
const FRAME_DELAY_US: u32 = 100;
const OVERHEAD_US: u32 = 50;
const fn rx_time_us(num_bytes: u32) -> u32 {
    85 * num_bytes + 19
}
/// WUPA/REQA are answered by a 2-byte ATQA.
const WUPA_TIMEOUT_US: u32 = FRAME_DELAY_US + OVERHEAD_US + rx_time_us(2);
/// An anticollision frame is answered by up to 5 bytes of UID CLn.
const ANTICOLL_TIMEOUT_US: u32 = FRAME_DELAY_US + OVERHEAD_US + rx_time_us(5);
/// SELECT is answered by a SAK (1 byte + CRC).
const SAK_TIMEOUT_US: u32 = FRAME_DELAY_US + OVERHEAD_US + rx_time_us(3);

const MAX_RETRIES: u8 = 3;

/// Length class of a card UID.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum UidLen {
    Four = 4,
    Seven = 7,
    Ten = 10,
}

/// A detected proximity card.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Picc {
    /// Final UID with the cascade tags removed; `uid[uid_len..]` is zero.
    pub uid: [u8; MAX_UID],
    pub uid_len: UidLen,
    /// The card announced ISO/IEC 14443-4 compliance in its SAK.
    pub iso_compliant: bool,
}

/// Result of one [`find_cards`] poll.
#[derive(Clone, Debug)]
pub struct FoundCards<const N: usize> {
    pub cards: Vec<Picc, N>,
    /// True when the walk ended because the field was exhausted, false when
    /// it gave up (output array full, or repeated transmission errors).
    pub complete: bool,
}

/// Working state of one cascade level of the anticollision walk.
struct CascadeLevel {
    /// `{SEL, NVB, UID0..UID3, BCC}`.
    frame: [u8; 7],
    /// Bits of this level's UID CLn already known, 0..=40.
    valid_bits: u8,
    /// Bit i set: a collision happened at bit i and the bit was forced
    /// to 1; the 0 branch is still unexplored.
    collision_map: u64,
    retries: u8,
}

impl CascadeLevel {
    fn new(level: usize) -> Self {
        let mut frame = [0u8; 7];
        frame[0] = SEL[level];
        Self {
            frame,
            valid_bits: 0,
            collision_map: 0,
            retries: 0,
        }
    }

    fn uid_cln(&self) -> [u8; 5] {
        self.frame[2..7].try_into().expect("frame tail is 5 bytes")
    }
}

/// NVB byte: whole valid bytes (command and NVB themselves included) in the
/// upper nibble, leftover bits in the lower.
const fn nvb(valid_bits: u8) -> u8 {
    ((2 + valid_bits / 8) << 4) | (valid_bits % 8)
}

/// The chip overwrites the whole partially-transmitted byte when it aligns
/// the response; splice the known low bits back in.
const fn restore_known_bits(received: u8, backup: u8, incomplete: u8) -> u8 {
    let mask = (1u8 << incomplete) - 1;
    (received & !mask) | (backup & mask)
}

enum Probe {
    /// All 40 bits of this level's UID CLn are known.
    UidComplete,
    /// The card being completed stopped answering.
    Vanished,
    /// Too many transmission errors; give up the whole poll.
    Abort,
}

enum SelectOutcome {
    UidIncomplete,
    Complete { iso_compliant: bool },
    Timeout,
    ProtocolError,
}

/// Finds and returns the UIDs of all cards in the RF field, at most `N`
/// (N <= [`MAX_CARDS_PER_POLL`]).
///
/// The reader must be `Ready` (RF field on); that is a caller bug, not a
/// runtime condition, so it panics.
pub async fn find_cards<P: Pcd, const N: usize>(pcd: &mut P) -> Result<FoundCards<N>, PcdError> {
    const { assert!(N <= MAX_CARDS_PER_POLL) };
    assert!(
        pcd.state() == PcdState::Ready,
        "find_cards needs an activated reader"
    );

    // Wake all cards, the halted ones included. Silence means an empty
    // field; an error means we could not have found anything anyway.
    match pcd.transceive_short(WUPA, WUPA_TIMEOUT_US).await {
        Ok(Transceive::Done { .. } | Transceive::Collision { .. }) => {}
        Ok(Transceive::Timeout) => {
            return Ok(FoundCards {
                cards: Vec::new(),
                complete: true,
            });
        }
        Err(_) => {
            return Ok(FoundCards {
                cards: Vec::new(),
                complete: false,
            });
        }
    }

    anticollision_walk(pcd).await
}

async fn anticollision_walk<P: Pcd, const N: usize>(
    pcd: &mut P,
) -> Result<FoundCards<N>, PcdError> {
    // Standard anticollision settings: base speed, mode A, CRC off.
    pcd.set_params(Speed::Kbd106, Speed::Kbd106, Mode::IsoA, false, false)?;

    let mut cards: Vec<Picc, N> = Vec::new();
    let mut stack: Vec<CascadeLevel, CASCADE_LEVELS> = Vec::new();
    let _ = stack.push(CascadeLevel::new(0));
    // Set when a finished child cascade returns control: the parent goes
    // straight to its collision bookkeeping, its own SELECT already done.
    let mut resume_after_child = false;

    loop {
        let level = stack.len() - 1;

        if !resume_after_child {
            let probe = {
                let lvl = stack.last_mut().expect("cascade stack never empty here");
                probe_level(pcd, lvl).await?
            };
            match probe {
                Probe::Abort => {
                    return Ok(FoundCards {
                        cards,
                        complete: false,
                    });
                }
                Probe::Vanished => {
                    // No SELECT; the collision bookkeeping below still
                    // makes progress.
                }
                Probe::UidComplete => {
                    let uid_cln = stack[level].uid_cln();
                    match select(pcd, &uid_cln, level).await? {
                        SelectOutcome::UidIncomplete => {
                            if level + 1 < CASCADE_LEVELS {
                                let _ = stack.push(CascadeLevel::new(level + 1));
                                continue;
                            }
                            // No UID is longer than ten bytes; a fourth
                            // cascade is a protocol violation. Skip the card.
                        }
                        SelectOutcome::Complete { iso_compliant } => {
                            let picc = assemble_picc(&stack, iso_compliant);
                            if cards.push(picc).is_err() {
                                return Ok(FoundCards {
                                    cards,
                                    complete: false,
                                });
                            }
                        }
                        SelectOutcome::Timeout | SelectOutcome::ProtocolError => {
                            // The card misbehaved mid-select; skip it.
                        }
                    }
                }
            }
        }
        resume_after_child = false;

        {
            let lvl = stack.last_mut().expect("cascade stack never empty here");
            if lvl.collision_map == 0 {
                let _ = stack.pop();
                if stack.is_empty() {
                    return Ok(FoundCards {
                        cards,
                        complete: true,
                    });
                }
                resume_after_child = true;
                continue;
            }

            // Revisit the most significant collision, this time with 0.
            let pos = (63 - lvl.collision_map.leading_zeros()) as u8;
            lvl.collision_map &= !(1u64 << pos);
            lvl.frame[2 + usize::from(pos / 8)] &= !(1 << (pos % 8));
            lvl.valid_bits = pos + 1;
            lvl.retries = 0;
        }

        // Cards whose UID stopped matching the transmitted prefix dropped
        // back to idle; wake everything up again. If nobody answers, the
        // remaining branches drain through timeouts.
        let _ = pcd.transceive_short(WUPA, WUPA_TIMEOUT_US).await?;

        // Only cards that passed the outer cascade levels belong in this
        // one; re-selecting the outer prefixes puts the rest back to sleep.
        for outer in 0..stack.len() - 1 {
            let prefix = stack[outer].uid_cln();
            let _ = select(pcd, &prefix, outer).await?;
        }
    }
}

async fn probe_level<P: Pcd>(pcd: &mut P, lvl: &mut CascadeLevel) -> Result<Probe, PcdError> {
    while lvl.valid_bits < 40 {
        let valid_bytes = usize::from(lvl.valid_bits / 8);
        let incomplete = lvl.valid_bits % 8;
        lvl.frame[1] = nvb(lvl.valid_bits);
        let send_len = 2 + valid_bytes + usize::from(incomplete != 0);

        let outcome = pcd
            .transceive_anticoll(&lvl.frame[..send_len], incomplete, incomplete, ANTICOLL_TIMEOUT_US)
            .await;

        match outcome {
            Ok(Transceive::Done { .. } | Transceive::Collision { .. }) => {
                lvl.retries = 0;
                let collision = matches!(outcome, Ok(Transceive::Collision { .. }));

                let backup = lvl.frame[2 + valid_bytes];
                let Ok(read) = pcd.read_response(&mut lvl.frame[2 + valid_bytes..7]) else {
                    panic!("PCD response queue failed right after a successful exchange");
                };
                if read.size_copied == 0 {
                    // The chip acknowledged a frame but delivered nothing;
                    // treat it like a receiver error.
                    if lvl.retries >= MAX_RETRIES {
                        return Ok(Probe::Abort);
                    }
                    lvl.retries += 1;
                    continue;
                }
                if incomplete != 0 {
                    lvl.frame[2 + valid_bytes] =
                        restore_known_bits(lvl.frame[2 + valid_bytes], backup, incomplete);
                }

                // The first response byte repeats the bits of an incomplete
                // byte we transmitted ourselves; they are not new.
                let received_new_bits = ((u16::from(read.size_copied) - 1) * 8
                    + u16::from(read.n_last_bits))
                .saturating_sub(u16::from(incomplete)) as u8;
                lvl.valid_bits = (lvl.valid_bits + received_new_bits).min(40);

                if collision {
                    if lvl.valid_bits >= 40 {
                        // A collision position past the frame end; broken
                        // card or missed collision, give up.
                        return Ok(Probe::Abort);
                    }
                    lvl.collision_map |= 1u64 << lvl.valid_bits;
                    lvl.frame[2 + usize::from(lvl.valid_bits / 8)] |= 1 << (lvl.valid_bits % 8);
                    lvl.valid_bits += 1;
                }
            }
            Ok(Transceive::Timeout) => {
                // The tentative card left the field; continue as if it had
                // never existed.
                lvl.retries = 0;
                return Ok(Probe::Vanished);
            }
            Err(PcdError::Tx | PcdError::Rx) => {
                if lvl.retries >= MAX_RETRIES {
                    return Ok(Probe::Abort);
                }
                lvl.retries += 1;
            }
            Err(error @ (PcdError::BadState | PcdError::Unsupported | PcdError::Unimplemented)) => {
                // Misuse of the PCD, not an RF condition.
                return Err(error);
            }
            Err(_) => return Ok(Probe::Abort),
        }
    }
    Ok(Probe::UidComplete)
}

async fn select<P: Pcd>(
    pcd: &mut P,
    uid_cln: &[u8; 5],
    level: usize,
) -> Result<SelectOutcome, PcdError> {
    // SELECT is a standard frame with automatic CRC on both directions.
    pcd.set_params(Speed::Kbd106, Speed::Kbd106, Mode::IsoA, true, true)?;

    // NVB 0x70: all seven bytes valid.
    let frame = [
        SEL[level],
        0x70,
        uid_cln[0],
        uid_cln[1],
        uid_cln[2],
        uid_cln[3],
        uid_cln[4],
    ];
    let outcome = pcd.transceive_standard(&frame, SAK_TIMEOUT_US).await;

    // Back to plain anticollision settings before judging the answer.
    pcd.set_params(Speed::Kbd106, Speed::Kbd106, Mode::IsoA, false, false)?;

    let outcome = match outcome {
        Ok(value) => value,
        Err(_) => return Ok(SelectOutcome::ProtocolError),
    };
    match outcome {
        Transceive::Done { len: 1 } => {
            let mut sak = [0u8; 1];
            match pcd.read_response(&mut sak) {
                Ok(read) if read.size_copied == 1 => {}
                _ => return Ok(SelectOutcome::ProtocolError),
            }
            if sak[0] & SAK_UID_INCOMPLETE != 0 {
                Ok(SelectOutcome::UidIncomplete)
            } else {
                Ok(SelectOutcome::Complete {
                    iso_compliant: sak[0] & SAK_ISO14443_4_COMPLIANT != 0,
                })
            }
        }
        // A SAK is exactly one byte; anything else is a protocol error.
        Transceive::Done { .. } | Transceive::Collision { .. } => Ok(SelectOutcome::ProtocolError),
        Transceive::Timeout => Ok(SelectOutcome::Timeout),
    }
}

fn assemble_picc(stack: &[CascadeLevel], iso_compliant: bool) -> Picc {
    let mut uid = [0u8; MAX_UID];
    // Byte 0 of the outer levels is the cascade tag, not UID material.
    let uid_len = match stack {
        [l0] => {
            uid[..4].copy_from_slice(&l0.frame[2..6]);
            UidLen::Four
        }
        [l0, l1] => {
            uid[..3].copy_from_slice(&l0.frame[3..6]);
            uid[3..7].copy_from_slice(&l1.frame[2..6]);
            UidLen::Seven
        }
        [l0, l1, l2] => {
            uid[..3].copy_from_slice(&l0.frame[3..6]);
            uid[3..6].copy_from_slice(&l1.frame[3..6]);
            uid[6..10].copy_from_slice(&l2.frame[2..6]);
            UidLen::Ten
        }
        _ => unreachable!("cascade stack holds one to three levels"),
    };
    Picc {
        uid,
        uid_len,
        iso_compliant,
    }
}

//! Typed controller<->reader protocol messages (CRPMs).
//!
//! The wire encoding is CBOR, produced and parsed by an external codec
//! behind [`CrpmCodec`]; the reader core only ever sees these typed
//! messages. Outgoing and incoming kinds are separate enums because the
//! two directions share nothing.

use derive_more::derive::{Display, Error};
use heapless::{String, Vec};

use crate::iso14443::{MAX_CARDS_PER_POLL, MAX_UID, Picc, UidLen};

/// Length of the reader serial number, hex plus filler.
pub const SERIAL_LEN: usize = 25;

/// Upper bound on a reader-failure description.
pub const MAX_FAILURE_LEN: usize = 200;

/// Auth-method tags a controller can activate.
pub const MAX_AUTH_METHODS: usize = 4;

/// A card identifier as carried in CRPMs: the UID without the protocol
/// details that only matter while the card is in the field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PiccUid {
    pub uid: [u8; MAX_UID],
    pub uid_len: UidLen,
}

impl From<&Picc> for PiccUid {
    fn from(picc: &Picc) -> Self {
        Self {
            uid: picc.uid,
            uid_len: picc.uid_len,
        }
    }
}

/// Authentication methods the controller may switch on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AuthMethod {
    /// Method 0: identify by PICC UID.
    PiccUuid,
}

/// User-interface states of UI class 0 (two bi-color LEDs and a beeper).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UiClass0State {
    DoorClosed,
    IdAcceptedDoorUnlocked,
    IdRejected,
    DoorPermanentlyUnlocked,
    DoorPermanentlyLocked,
    SystemFailure,
    DoorOpenTooLong,
}

/// Payload of a System Query Response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SysQueryResponse {
    pub rdr_class: u16,
    pub hw_model: u16,
    pub hw_rev: u16,
    pub serial: [u8; SERIAL_LEN],
    pub sw_ver_major: u8,
    pub sw_ver_minor: u8,
}

/// Messages the reader sends to the controller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CrpmOut {
    SysQueryResponse(SysQueryResponse),
    ReaderFailure(String<MAX_FAILURE_LEN>),
    /// Auth method 0 obtained card UIDs.
    Am0GotUids(Vec<PiccUid, MAX_CARDS_PER_POLL>),
}

/// Messages the reader understands from the controller. Everything else
/// decodes to [`CrpmIn::Other`] and is ignored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CrpmIn {
    SysQueryRequest,
    ActivateAuthMethods(Vec<AuthMethod, MAX_AUTH_METHODS>),
    UiUpdate(UiClass0State),
    Other,
}

/// Codec failures. A malformed incoming frame is dropped by the comm task;
/// failing to encode our own message is a bug.
#[expect(missing_docs, reason = "The variants are self-explanatory.")]
#[derive(Clone, Copy, Debug, Display, Error, PartialEq, Eq)]
pub enum CodecError {
    #[display("output buffer too small for the encoded message")]
    BufferTooSmall,
    #[display("frame is not a well-formed CRPM")]
    Malformed,
}

/// The external CBOR codec, one instance per direction (each carries its
/// own scratch allocator).
pub trait CrpmCodec {
    fn encode(&mut self, message: &CrpmOut, out: &mut [u8]) -> Result<usize, CodecError>;
    fn decode(&mut self, frame: &[u8]) -> Result<CrpmIn, CodecError>;
}

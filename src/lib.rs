//! Firmware core for a contactless door-access reader board.
//!
//! The stack has three layers: a register-level MFRC522 driver exposing the
//! abstract PCD interface ([`pcd`], [`mfrc522`]), the ISO/IEC 14443-3 type-A
//! card protocol on top of it ([`iso14443`]), and the four cooperating tasks
//! that turn the two into a reader ([`tasks`]). The controller link and its
//! CBOR codec are external collaborators; only their interfaces live here
//! ([`link`], [`crpm`]).
//!
//! Plain `cargo build`/`cargo test` compiles the portable core for the host;
//! the `pico1` feature adds the board layer and the firmware binary.
#![no_std]
// The PCD trait is implemented by this crate's driver and by test mocks;
// the extra Send bounds a helper trait would buy are not needed.
#![allow(async_fn_in_trait)]

// The firmware binary needs both the board and a logging transport.
#[cfg(all(feature = "pico1", not(any(feature = "defmt", test))))]
compile_error!("Board builds need the 'defmt' feature for logging and panics");

mod fmt;

mod error;

pub mod crpm;
pub mod heartbeat;
pub mod iso14443;
pub mod link;
pub mod mfrc522;
pub mod pcd;
pub mod serial_id;
pub mod tasks;

#[cfg(feature = "pico1")]
pub mod fault;
#[cfg(feature = "pico1")]
pub mod hardware;

// Re-export error types and result (used throughout)
pub use error::{Error, Result};

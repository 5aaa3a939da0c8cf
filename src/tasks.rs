//! The four cooperating tasks of the reader.
//!
//! The [`master`] task owns the overall state machine and the watchdog;
//! [`cardid`] polls the RF field, [`comm`] speaks to the controller and
//! [`ui`] runs the LEDs and the beeper. Messages travel through bounded
//! channels; the task bodies are generic async functions so the host tests
//! can drive them with mock hardware, and the firmware binary wraps them
//! into Embassy tasks with the board types filled in.

pub mod cardid;
pub mod comm;
pub mod master;
pub mod ui;

//! The ScanLogic/Cypress SL811HS/T USB 1.1 Host Controller Driver
//!
//! The SL811HS/T is a register-level host chip without DMA: it has two transaction engines
//! ("slot A" and "slot B") sharing a 240 byte buffer, and generates the start of frame packets
//! for a single downstream port. Everything a more capable controller does in hardware
//! (scheduling control, bulk and interrupt transfers within the 1 ms frame budget, retrying
//! NAKed and failed transactions, tracking data toggles, being a root hub) is done here.
//!
//! The crate does not talk to the hardware directly. The platform supplies a [`sl811::ChipPort`]
//! to reach the chip's registers and calls [`sl811::HostController::on_hardware_event`] from its
//! interrupt handler, or runs the controller in polling mode.
//!
//! This documentation refers to the following documents:
//!
//! - USB11 - Universal Serial Bus Specification, Revision 1.1
//! - SL811HS - Cypress SL811HS Embedded USB Host/Slave Controller data sheet
//!

pub extern crate plain;

pub mod config;
mod driver_interface;
pub mod sl811;
pub mod usb;

pub use config::{ConfigError, InterruptMethod, SchedulerConfig};
pub use driver_interface::*;
pub use sl811::{Bus, ChipPort, HostController};

//! A BLE Link-Layer controller core.
//!
//! Implements a *Bluetooth Core Specification v5.1* Link Layer: legacy advertising, scanning and
//! connection initiation, the per-connection event state machine, the Link-Layer Control
//! Protocol (LLCP) procedures negotiated over it, and the ISO adaptation layer that turns
//! isochronous PDUs into SDUs and back.
//!
//! # Using the controller
//!
//! Ripple is runtime and hardware-agnostic. Everything platform-specific is reached through a few
//! traits that are bundled together by a [`Config`] implementation:
//!
//! * A [`Radio`] that can be tuned to an advertising or data channel, and can transmit and receive
//!   one PDU at a time.
//! * A [`Scheduler`] that calls the controller's prepare hooks ahead of every advertising event,
//!   scan window and connection event.
//! * An [`Executor`] that runs deferred [`Job`]s at a lower priority than the radio interrupt.
//! * A [`Cipher`] providing the AES-128 block function used for session key derivation.
//!
//! The [`Controller`] owns all of those, together with its buffer pools and connection contexts.
//! Interrupt context drives it through [`Controller::prepare`], [`Controller::execute`] and
//! [`Controller::radio_event`], while the host side uses the request methods and
//! [`Controller::rx_get`].
//!
//! [`Config`]: config/trait.Config.html
//! [`Radio`]: phy/trait.Radio.html
//! [`Scheduler`]: ticker/trait.Scheduler.html
//! [`Executor`]: ticker/trait.Executor.html
//! [`Job`]: ticker/enum.Job.html
//! [`Cipher`]: link/procedure/encryption/trait.Cipher.html
//! [`Controller`]: link/controller/struct.Controller.html
//! [`Controller::prepare`]: link/controller/struct.Controller.html#method.prepare
//! [`Controller::execute`]: link/controller/struct.Controller.html#method.execute
//! [`Controller::radio_event`]: link/controller/struct.Controller.html#method.radio_event
//! [`Controller::rx_get`]: link/controller/struct.Controller.html#method.rx_get

// We're `#[no_std]`, except when we're testing
#![cfg_attr(not(test), no_std)]
// Deny a few warnings in doctests, since rustdoc `allow`s many warnings by default
#![doc(test(attr(deny(unused_imports, unused_must_use))))]
#![warn(rust_2018_idioms)]
// The claims of this lint are dubious, disable it
#![allow(clippy::trivially_copy_pass_by_ref)]

#[macro_use]
mod log;
#[macro_use]
mod utils;
pub mod bytes;
pub mod config;
mod error;
pub mod isoal;
pub mod link;
pub mod phy;
pub mod ticker;
pub mod time;

pub use self::error::{Error, ErrorCode, RequestError};

use self::link::llcp::VersionNumber;

/// Version of the Bluetooth specification implemented by Ripple.
pub const BLUETOOTH_VERSION: VersionNumber = VersionNumber::V5_1;

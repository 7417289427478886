//! Controller configuration.
//!
//! A [`Config`] bundles the platform types the controller talks to. [`Settings`] select the
//! optional behaviour of one controller instance at construction time.
//!
//! [`Config`]: trait.Config.html
//! [`Settings`]: struct.Settings.html

use crate::{
    link::{connect::SleepClockAccuracy, features::FeatureSet, procedure::encryption::Cipher},
    phy::{PhySet, Radio},
    ticker::{Executor, Scheduler},
};
use rand_core::RngCore;

/// Trait for Ripple controller configurations.
///
/// This trait defines the hardware and system interface types used by the controller. Every
/// application must define a type implementing this trait and supply it to the `Controller`.
pub trait Config {
    /// The radio used for connection events.
    type Radio: Radio;

    /// The timer service that drives connection events.
    type Scheduler: Scheduler;

    /// Runs deferred work.
    type Executor: Executor;

    /// AES-128 block cipher for session key derivation.
    type Cipher: Cipher;

    /// Random number source for access addresses, CRC init values, and the key diversifier and IV
    /// halves of the encryption procedure.
    ///
    /// This should be a cryptographically secure generator.
    type Rng: RngCore;
}

/// Optional controller behaviour, fixed when the controller is created.
#[derive(Debug, Copy, Clone)]
pub struct Settings {
    /// Link Layer features to support and advertise in the feature exchange.
    pub features: FeatureSet,

    /// Accuracy of the local sleep clock.
    pub sca: SleepClockAccuracy,

    /// Company identifier sent in `LL_VERSION_IND`.
    pub company_id: u16,

    /// Implementation-specific sub-version sent in `LL_VERSION_IND`.
    pub sub_version: u16,

    /// Answer `LL_ENC_REQ` before the host supplied the long term key.
    ///
    /// The default is to wait for the key, so that a missing key can still be reported with
    /// `LL_REJECT_IND`.
    pub fast_encryption: bool,

    /// Report significant RSSI changes to the host.
    pub rssi_reporting: bool,

    /// Initial maximum transmit payload size of new connections, in octets.
    pub default_tx_octets: u16,

    /// Initial maximum transmit time of new connections, in µs.
    pub default_tx_time: u16,

    /// PHYs preferred for transmission on new connections.
    pub default_phy_tx: PhySet,

    /// PHYs preferred for reception on new connections.
    pub default_phy_rx: PhySet,

    /// Authenticated payload timeout of new connections, in 10 ms units.
    pub auth_payload_timeout: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            features: FeatureSet::supported(),
            sca: SleepClockAccuracy::Ppm0To20,
            // 0xFFFF is reserved for unassigned company identifiers
            company_id: 0xffff,
            sub_version: 0,
            fast_encryption: false,
            rssi_reporting: true,
            default_tx_octets: 27,
            default_tx_time: 328,
            default_phy_tx: PhySet::all(),
            default_phy_rx: PhySet::all(),
            auth_payload_timeout: 3000,
        }
    }
}

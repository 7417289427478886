//! Data channel selection algorithms.
//!
//! Every connection picks the data channel of its next event using one of two algorithms, fixed
//! when the connection is created:
//!
//! * **Algorithm #1** hops a fixed number of channels per event and is always available.
//! * **Algorithm #2** derives a pseudo-random channel from the event counter and the access
//!   address. It is used when both devices announce support for it in their advertising and
//!   `CONNECT_IND` PDUs.
//!
//! Both remap unused channels onto the used ones by rank, so they only ever yield channels marked
//! as used in the [`ChannelMap`].
//!
//! [`ChannelMap`]: ../channel_map/struct.ChannelMap.html

use crate::{link::channel_map::ChannelMap, phy::DataChannel};

/// Per-connection channel selection state.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChannelSelection {
    /// Channel Selection Algorithm #1.
    Algorithm1 {
        /// Number of channels to hop per connection event (5..=16).
        hop: u8,
        /// The unmapped channel of the last connection event (`lastUnmappedChannel`).
        last_unmapped: u8,
    },

    /// Channel Selection Algorithm #2.
    Algorithm2 {
        /// Identifier derived from the access address.
        channel_id: u16,
    },
}

impl ChannelSelection {
    /// Creates the state for algorithm #1, before the first connection event.
    pub fn algorithm1(hop: u8) -> Self {
        ChannelSelection::Algorithm1 {
            hop,
            last_unmapped: 0,
        }
    }

    /// Creates the state for algorithm #2 on a connection using `access_address`.
    pub fn algorithm2(access_address: u32) -> Self {
        let channel_id = ((access_address >> 16) ^ (access_address & 0xffff)) as u16;
        ChannelSelection::Algorithm2 { channel_id }
    }

    /// Returns whether this is algorithm #2.
    pub fn is_algorithm2(&self) -> bool {
        match self {
            ChannelSelection::Algorithm1 { .. } => false,
            ChannelSelection::Algorithm2 { .. } => true,
        }
    }

    /// Selects the channel for the connection event with number `counter`.
    ///
    /// `skipped` is the number of connection events that passed since the last call without being
    /// selected for (peripheral latency and skipped events). It only matters to algorithm #1, which
    /// is stateful; algorithm #2 is a pure function of `counter`.
    ///
    /// # Panics
    ///
    /// This will panic if `map` has no used channels.
    pub fn next(&mut self, counter: u16, skipped: u16, map: &ChannelMap) -> DataChannel {
        assert!(map.num_used_channels() > 0, "channel map without used channels");

        match self {
            ChannelSelection::Algorithm1 { hop, last_unmapped } => {
                let steps = u32::from(*hop) * (1 + u32::from(skipped));
                let unmapped = ((u32::from(*last_unmapped) + steps) % 37) as u8;
                *last_unmapped = unmapped;

                let channel = DataChannel::new(unmapped);
                if map.is_used(channel) {
                    channel
                } else {
                    map.by_index(unmapped % map.num_used_channels())
                }
            }
            ChannelSelection::Algorithm2 { channel_id } => {
                let prn_e = csa2_prn_e(counter, *channel_id);
                let channel = DataChannel::new((prn_e % 37) as u8);
                if map.is_used(channel) {
                    channel
                } else {
                    let remap = (u32::from(map.num_used_channels()) * u32::from(prn_e)) >> 16;
                    map.by_index(remap as u8)
                }
            }
        }
    }
}

/// Reverses the bit order inside each byte of `v`.
fn perm(v: u16) -> u16 {
    let lo = (v as u8).reverse_bits();
    let hi = ((v >> 8) as u8).reverse_bits();
    u16::from(hi) << 8 | u16::from(lo)
}

/// Multiply, add, modulo 2^16.
fn mam(a: u16, b: u16) -> u16 {
    a.wrapping_mul(17).wrapping_add(b)
}

/// Computes the unmapped event pseudo-random number `prn_e`.
fn csa2_prn_e(counter: u16, channel_id: u16) -> u16 {
    let mut prn = counter ^ channel_id;
    for _ in 0..3 {
        prn = mam(perm(prn), channel_id);
    }
    prn ^ channel_id
}

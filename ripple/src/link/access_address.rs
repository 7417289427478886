//! Access address generation for new connections.

use rand_core::RngCore;

/// The access address used on the advertising channels.
pub const ADVERTISING_ADDRESS: u32 = 0x8E89BED6;

/// Generates a random access address for a new connection.
///
/// Keeps drawing from `rng` until a value satisfies the rules for data channel access addresses:
///
/// * It is not the advertising channel access address, and differs from it in more than one bit.
/// * Its four octets are not all equal.
/// * It has no more than six consecutive zeros or ones.
/// * It has no more than 24 bit transitions.
/// * Its six most significant bits contain at least two transitions.
pub fn generate<R: RngCore>(rng: &mut R) -> u32 {
    loop {
        let candidate = rng.next_u32();
        if is_valid(candidate) {
            return candidate;
        }
    }
}

/// Checks whether `aa` may be used as the access address of a connection.
pub fn is_valid(aa: u32) -> bool {
    if (aa ^ ADVERTISING_ADDRESS).count_ones() <= 1 {
        return false;
    }

    let octets = aa.to_le_bytes();
    if octets.iter().all(|&o| o == octets[0]) {
        return false;
    }

    // A transition is a bit that differs from its more significant neighbour.
    let transitions = (aa ^ (aa >> 1)) & 0x7fff_ffff;
    if transitions.count_ones() > 24 {
        return false;
    }

    // 6 MSbs have 5 neighbouring pairs: bits 26..=30 of `transitions`.
    if ((transitions >> 26) & 0b11111).count_ones() < 2 {
        return false;
    }

    longest_run(aa) <= 6
}

/// Returns the length of the longest run of equal bits in `value`.
fn longest_run(value: u32) -> u32 {
    let mut longest = 1;
    let mut run = 1;
    for bit in 1..32 {
        if (value >> bit) & 1 == (value >> (bit - 1)) & 1 {
            run += 1;
            longest = longest.max(run);
        } else {
            run = 1;
        }
    }
    longest
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::mock::TestRng;

    #[test]
    fn rejects_advertising_address() {
        assert!(!is_valid(ADVERTISING_ADDRESS));
        assert!(!is_valid(ADVERTISING_ADDRESS ^ (1 << 13)));
    }

    #[test]
    fn rejects_equal_octets() {
        assert!(!is_valid(0x5A5A_5A5A));
    }

    #[test]
    fn rejects_long_runs() {
        assert_eq!(longest_run(0b1000_0000), 24);
        assert!(!is_valid(0x71764080));
        assert_eq!(longest_run(0x71764129), 5);
    }

    #[test]
    fn rejects_too_many_transitions() {
        // Alternating bits everywhere except for the top nibble.
        assert!(!is_valid(0x6555_5555));
    }

    #[test]
    fn rejects_flat_msbs() {
        // 0b110000.. has only one transition in its top 6 bits.
        assert!(!is_valid(0xC3A5_6C39));
    }

    #[test]
    fn accepts_typical_address() {
        assert!(is_valid(0x71764129));
        assert!(is_valid(0x50654AB2));
    }

    #[test]
    fn generated_addresses_are_valid() {
        let mut rng = TestRng::new(0x1234_5678);
        for _ in 0..500 {
            let aa = generate(&mut rng);
            assert!(is_valid(aa), "{:#010x}", aa);
            assert!(longest_run(aa) <= 6);
            assert!((aa ^ ADVERTISING_ADDRESS).count_ones() > 1);
        }
    }
}

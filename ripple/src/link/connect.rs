//! The `LLData` carried by `CONNECT_IND`, which establishes a connection.

use crate::{
    bytes::*,
    link::{access_address, channel_map::ChannelMap},
    time::Duration,
    utils::Hex,
    Error,
};
use rand_core::RngCore;

/// Accuracy of a device's sleep clock, as transmitted in the 3-bit `SCA` field.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SleepClockAccuracy {
    Ppm251To500 = 0,
    Ppm151To250 = 1,
    Ppm101To150 = 2,
    Ppm76To100 = 3,
    Ppm51To75 = 4,
    Ppm31To50 = 5,
    Ppm21To30 = 6,
    Ppm0To20 = 7,
}

impl SleepClockAccuracy {
    /// Decodes the lowest 3 bits of `raw`.
    pub fn from_bits(raw: u8) -> Self {
        use self::SleepClockAccuracy::*;

        match raw & 0b111 {
            0 => Ppm251To500,
            1 => Ppm151To250,
            2 => Ppm101To150,
            3 => Ppm76To100,
            4 => Ppm51To75,
            5 => Ppm31To50,
            6 => Ppm21To30,
            _ => Ppm0To20,
        }
    }

    /// Returns the worst-case drift in parts per million covered by this accuracy class.
    pub fn ppm(&self) -> u32 {
        const PPM: [u32; 8] = [500, 250, 150, 100, 75, 50, 30, 20];
        PPM[*self as usize]
    }
}

/// Connection parameters sent by the central in `CONNECT_IND`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ConnectInd {
    pub access_address: Hex<u32>,
    /// 24-bit CRC initialization value.
    pub crc_init: Hex<u32>,
    /// Transmit window size, in 1.25 ms units.
    pub win_size: u8,
    /// Transmit window offset, in 1.25 ms units.
    pub win_offset: u16,
    /// Connection interval, in 1.25 ms units.
    pub interval: u16,
    pub latency: u16,
    /// Supervision timeout, in 10 ms units.
    pub timeout: u16,
    pub channel_map: ChannelMap,
    /// Channel hop increment for channel selection algorithm #1 (5..=16).
    pub hop: u8,
    /// Sleep clock accuracy of the central.
    pub sca: SleepClockAccuracy,
}

/// Encoded size of `ConnectInd`.
pub const CONNECT_IND_SIZE: usize = 22;

impl ConnectInd {
    /// Creates the `LLData` a central sends to open a connection with the given parameters.
    ///
    /// The access address, CRC initialization value and hop increment are drawn from `rng`.
    pub fn generate<R: RngCore>(
        rng: &mut R,
        interval: u16,
        latency: u16,
        timeout: u16,
        channel_map: ChannelMap,
        sca: SleepClockAccuracy,
    ) -> Self {
        let access_address = access_address::generate(rng);
        let crc_init = rng.next_u32() & 0x00ff_ffff;
        let hop = 5 + (rng.next_u32() % 12) as u8;
        Self {
            access_address: Hex(access_address),
            crc_init: Hex(crc_init),
            win_size: 1,
            win_offset: 0,
            interval,
            latency,
            timeout,
            channel_map,
            hop,
            sca,
        }
    }

    /// Returns the size of the transmit window for the first PDU of the connection.
    pub fn win_size(&self) -> Duration {
        Duration::from_units_1250(self.win_size.into())
    }

    /// Returns the offset of the transmit window, counted from the end of the transmit window
    /// delay.
    pub fn win_offset(&self) -> Duration {
        Duration::from_units_1250(self.win_offset)
    }

    /// Returns the connection interval.
    pub fn interval(&self) -> Duration {
        Duration::from_units_1250(self.interval)
    }

    /// Returns the connection supervision timeout (`connSupervisionTimeout`).
    pub fn timeout(&self) -> Duration {
        Duration::from_units_10ms(self.timeout)
    }

    /// Returns the time from the end of the `CONNECT_IND` to the end of the transmit window.
    pub fn end_of_tx_window(&self) -> Duration {
        Duration::from_micros(1250) + self.win_offset() + self.win_size()
    }
}

impl<'a> FromBytes<'a> for ConnectInd {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        let access_address = bytes.read_u32_le()?;
        let crc_init = bytes.read_u24_le()?;
        let win_size = bytes.read_u8()?;
        let win_offset = bytes.read_u16_le()?;
        let interval = bytes.read_u16_le()?;
        let latency = bytes.read_u16_le()?;
        let timeout = bytes.read_u16_le()?;
        let channel_map = ChannelMap::from_raw(bytes.read_array()?);
        let hop_sca = bytes.read_u8()?;
        Ok(Self {
            access_address: Hex(access_address),
            crc_init: Hex(crc_init),
            win_size,
            win_offset,
            interval,
            latency,
            timeout,
            channel_map,
            hop: hop_sca & 0b11111,
            sca: SleepClockAccuracy::from_bits(hop_sca >> 5),
        })
    }
}

impl ToBytes for ConnectInd {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u32_le(self.access_address.0)?;
        writer.write_u24_le(self.crc_init.0)?;
        writer.write_u8(self.win_size)?;
        writer.write_u16_le(self.win_offset)?;
        writer.write_u16_le(self.interval)?;
        writer.write_u16_le(self.latency)?;
        writer.write_u16_le(self.timeout)?;
        writer.write_slice(&self.channel_map.to_raw())?;
        writer.write_u8((self.sca as u8) << 5 | (self.hop & 0b11111))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::mock::TestRng;

    #[test]
    fn decode() {
        let raw = [
            0x29, 0x41, 0x76, 0x71, // AA
            0x55, 0x66, 0x77, // CRCInit
            0x02, // WinSize
            0x03, 0x00, // WinOffset
            0x18, 0x00, // Interval
            0x01, 0x00, // Latency
            0x48, 0x00, // Timeout
            0xff, 0xff, 0xff, 0xff, 0x1f, // ChM
            0xa7, // Hop 7, SCA 5
        ];
        let ind = ConnectInd::from_bytes(&mut ByteReader::new(&raw)).unwrap();
        assert_eq!(ind.access_address, Hex(0x71764129));
        assert_eq!(ind.crc_init, Hex(0x776655));
        assert_eq!(ind.win_size(), Duration::from_micros(2500));
        assert_eq!(ind.interval(), Duration::from_millis(30));
        assert_eq!(ind.latency, 1);
        assert_eq!(ind.timeout(), Duration::from_millis(720));
        assert_eq!(ind.channel_map, ChannelMap::with_all_channels());
        assert_eq!(ind.hop, 7);
        assert_eq!(ind.sca, SleepClockAccuracy::Ppm31To50);
        assert_eq!(ind.sca.ppm(), 50);

        let mut buf = [0; CONNECT_IND_SIZE];
        let mut writer = ByteWriter::new(&mut buf);
        ind.to_bytes(&mut writer).unwrap();
        assert_eq!(writer.space_left(), 0);
        assert_eq!(buf, raw);
    }

    #[test]
    fn truncated() {
        let raw = [0; CONNECT_IND_SIZE - 1];
        assert_eq!(
            ConnectInd::from_bytes(&mut ByteReader::new(&raw)),
            Err(Error::Eof)
        );
    }

    #[test]
    fn generated_parameters() {
        let mut rng = TestRng::new(99);
        for _ in 0..50 {
            let ind = ConnectInd::generate(
                &mut rng,
                24,
                0,
                100,
                ChannelMap::with_all_channels(),
                SleepClockAccuracy::Ppm0To20,
            );
            assert!(access_address::is_valid(ind.access_address.0));
            assert!(ind.crc_init.0 <= 0x00ff_ffff);
            assert!((5..=16).contains(&ind.hop));
        }
    }
}

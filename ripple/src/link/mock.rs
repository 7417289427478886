//! Test doubles for the controller's collaborators.

use crate::{
    config::Config,
    link::{
        advertising,
        data::{Header, Llid, PduBuf},
        llcp::ControlPdu,
        procedure::encryption::Cipher,
        SeqNum,
    },
    phy::{AdvReceived, AdvertisingChannel, Ccm, DataChannel, Phy, Radio, Received},
    ticker::{Context, Executor, Job, Reservation, Scheduler, TickerId, TickerStatus},
    time::{Duration, Instant},
};
use rand_core::RngCore;

/// Deterministic xorshift generator.
pub struct TestRng(u64);

impl TestRng {
    pub fn new(seed: u64) -> Self {
        TestRng(seed | 1)
    }
}

impl RngCore for TestRng {
    fn next_u32(&mut self) -> u32 {
        (self.next_u64() >> 16) as u32
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        rand_core::impls::fill_bytes_via_next(self, dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

/// "Encrypts" by XORing the key into the block.
pub struct MockCipher;

impl Cipher for MockCipher {
    fn encrypt_block(&mut self, key: &[u8; 16], block: &mut [u8; 16]) {
        for (b, k) in block.iter_mut().zip(key) {
            *b ^= *k;
        }
    }
}

/// A PDU handed to `MockRadio::arm_transmit`.
#[derive(Debug, Clone)]
pub struct Sent {
    pub header: Header,
    pub payload: Vec<u8>,
    pub encrypted: bool,
}

/// An advertising channel PDU handed to `MockRadio::arm_transmit_advertising`.
#[derive(Debug, Clone)]
pub struct AdvSent {
    pub channel: Option<AdvertisingChannel>,
    pub header: advertising::Header,
    pub payload: Vec<u8>,
}

/// Records everything the controller asks the radio to do.
pub struct MockRadio {
    buf: [u8; 255],
    pub configured: Vec<(DataChannel, Phy)>,
    pub sent: Vec<Sent>,
    pub rx_windows: Vec<Duration>,
    pub disabled: usize,
    pub adv_channel: Option<AdvertisingChannel>,
    pub adv_sent: Vec<AdvSent>,
    pub adv_rx_windows: Vec<Duration>,
}

impl MockRadio {
    pub fn new() -> Self {
        Self {
            buf: [0; 255],
            configured: Vec::new(),
            sent: Vec::new(),
            rx_windows: Vec::new(),
            disabled: 0,
            adv_channel: None,
            adv_sent: Vec::new(),
            adv_rx_windows: Vec::new(),
        }
    }

    /// Returns the control PDUs sent so far, decoded into owned buffers.
    pub fn sent_control(&self) -> Vec<PduBuf> {
        self.sent
            .iter()
            .filter(|s| s.header.llid() == Llid::Control)
            .map(|s| {
                let mut buf = PduBuf::empty();
                buf.set_data(Llid::Control, &s.payload).unwrap();
                buf
            })
            .collect()
    }
}

impl Radio for MockRadio {
    fn configure(&mut self, channel: DataChannel, _access_address: u32, _crc_init: u32, phy: Phy) {
        self.configured.push((channel, phy));
    }

    fn tx_payload_buf(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    fn arm_transmit(&mut self, header: Header, ccm: Option<&Ccm>) {
        let len = usize::from(header.payload_length());
        self.sent.push(Sent {
            header,
            payload: self.buf[..len].to_vec(),
            encrypted: ccm.is_some(),
        });
    }

    fn arm_receive(&mut self, window: Duration, _ccm: Option<&Ccm>) {
        self.rx_windows.push(window);
    }

    fn configure_advertising(&mut self, channel: AdvertisingChannel) {
        self.adv_channel = Some(channel);
    }

    fn arm_transmit_advertising(&mut self, header: advertising::Header) {
        let len = usize::from(header.payload_length());
        self.adv_sent.push(AdvSent {
            channel: self.adv_channel,
            header,
            payload: self.buf[..len].to_vec(),
        });
    }

    fn arm_receive_advertising(&mut self, window: Duration) {
        self.adv_rx_windows.push(window);
    }

    fn disable(&mut self) {
        self.disabled += 1;
    }
}

/// Records timer operations. Reservations of other connections can be injected.
#[derive(Default)]
pub struct MockScheduler {
    pub started: Vec<(TickerId, Instant, Duration, Duration)>,
    pub updates: Vec<(TickerId, Duration, Duration, u16, bool)>,
    pub stopped: Vec<TickerId>,
    pub reservations: Vec<(TickerId, Reservation)>,
}

impl Scheduler for MockScheduler {
    fn start(
        &mut self,
        id: TickerId,
        anchor: Instant,
        first_offset: Duration,
        period: Duration,
        _slot: Duration,
        _lazy_permitted: bool,
    ) -> TickerStatus {
        self.started.push((id, anchor, first_offset, period));
        TickerStatus::Success
    }

    fn update(
        &mut self,
        id: TickerId,
        drift_plus: Duration,
        drift_minus: Duration,
        lazy: u16,
        force: bool,
    ) -> TickerStatus {
        self.updates.push((id, drift_plus, drift_minus, lazy, force));
        TickerStatus::Success
    }

    fn stop(&mut self, id: TickerId) -> TickerStatus {
        self.stopped.push(id);
        TickerStatus::Success
    }

    fn reservations(&self, exclude: TickerId, f: &mut dyn FnMut(Reservation)) {
        for (id, r) in &self.reservations {
            if *id != exclude {
                f(*r);
            }
        }
    }
}

/// Records jobs, or refuses them all when `refuse` is set.
#[derive(Default)]
pub struct MockExecutor {
    pub jobs: Vec<Job>,
    pub refuse: bool,
}

impl Executor for MockExecutor {
    fn enqueue(&mut self, from: Context, to: Context, job: Job) -> Result<(), Job> {
        assert_eq!((from, to), (Context::Worker, Context::Job));
        if self.refuse {
            Err(job)
        } else {
            self.jobs.push(job);
            Ok(())
        }
    }
}

pub enum MockConfig {}

impl Config for MockConfig {
    type Radio = MockRadio;
    type Scheduler = MockScheduler;
    type Executor = MockExecutor;
    type Cipher = MockCipher;
    type Rng = TestRng;
}

/// Encodes a control PDU the way the peer would send it.
pub fn control_payload(pdu: ControlPdu<'_>) -> Vec<u8> {
    let mut buf = PduBuf::empty();
    buf.set_control(&pdu).unwrap();
    buf.payload().to_vec()
}

/// Builds a valid received PDU.
pub fn received(llid: Llid, sn: SeqNum, nesn: SeqNum, md: bool, payload: &[u8]) -> Received<'_> {
    let mut header = Header::new(llid);
    header.set_payload_length(payload.len() as u8);
    header.set_sn(sn);
    header.set_nesn(nesn);
    header.set_md(md);
    Received {
        header,
        payload,
        crc_ok: true,
        mic_ok: true,
        rssi: Some(60),
        start_to_address: Duration::from_micros(40),
    }
}

/// Builds a valid advertising channel PDU from the given addresses and data.
pub fn adv_received<'a>(
    ty: advertising::PduType,
    tx: &advertising::DeviceAddress,
    rx: Option<&advertising::DeviceAddress>,
    data: &[u8],
    buf: &'a mut [u8; 39],
) -> AdvReceived<'a> {
    let header = match rx {
        Some(rx) => advertising::lower(ty, &[tx, rx], data, buf),
        None => advertising::lower(ty, &[tx], data, buf),
    };
    let len = usize::from(header.payload_length());
    AdvReceived {
        header,
        payload: &buf[..len],
        crc_ok: true,
        rssi: Some(50),
    }
}

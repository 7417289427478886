//! The Link-Layer controller.
//!
//! A [`Controller`] owns every connection context together with the resources they share: the
//! PDU buffer pools, the pipes to the host and the instant token. It also runs the advertiser and
//! the scanner, which hand new connections to it. It is driven from two contexts:
//!
//! * The **worker** context (radio interrupt and scheduler callbacks) calls [`prepare`],
//!   [`adv_prepare`], [`scan_prepare`], [`execute`] and [`radio_event`].
//! * The **job** context (deferred work and the host) calls [`run_job`], the host requests and
//!   the data path methods ([`tx_mem_enqueue`], [`rx_get`], ...).
//!
//! Host requests never change negotiated state directly. They only mark a procedure as requested,
//! and the connection picks it up in its next prepare step.
//!
//! [`Controller`]: struct.Controller.html
//! [`prepare`]: struct.Controller.html#method.prepare
//! [`adv_prepare`]: struct.Controller.html#method.adv_prepare
//! [`scan_prepare`]: struct.Controller.html#method.scan_prepare
//! [`execute`]: struct.Controller.html#method.execute
//! [`radio_event`]: struct.Controller.html#method.radio_event
//! [`run_job`]: struct.Controller.html#method.run_job
//! [`tx_mem_enqueue`]: struct.Controller.html#method.tx_mem_enqueue
//! [`rx_get`]: struct.Controller.html#method.rx_get

use crate::{
    config::{Config, Settings},
    link::{
        advertiser::{self, AdvData, AdvParams, Advertiser, ConnectRequest, HIGH_DUTY_TIMEOUT_US},
        advertising::{AdvReport, DeviceAddress},
        channel_map::ChannelMap,
        connect::ConnectInd,
        connection::Connection,
        data::{Llid, PduBuf},
        event::{self, ActiveEvent, PREPARE_LEAD_US},
        features::FeatureSet,
        llcp::ControlPdu,
        notification::Notification,
        pipe::{Pipe, ReleaseItem, RxEvent, RxItem, RxKind, TxItem},
        pool::{Handle, Pool},
        procedure::{
            chan_map,
            conn_update::{self, ConnParams},
            encryption, exchange,
            length::{self, DataLength},
            phy, InstantToken, NoMemory,
        },
        scanner::{self, Initiator, ScanParams, Scanner},
        tx_list::TxNode,
        ConnHandle, Role, MAX_CONNECTIONS, MAX_PAYLOAD_SIZE, MAX_PAYLOAD_TIME, RELEASE_PIPE_SIZE,
        REPORT_PIPE_SIZE, RX_PIPE_SIZE, RX_POOL_SIZE, TX_CTRL_POOL_SIZE, TX_DATA_POOL_SIZE,
        TX_PIPE_SIZE,
    },
    phy::{Phy, PhySet, Radio, RadioEvent},
    ticker::{Context, Executor, Job, Scheduler, TickerId, TickerStatus},
    time::{Duration, Instant},
    ErrorCode, RequestError,
};

/// A role other than a connection that is using the radio.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum RadioRole {
    Advertiser,
    Scanner,
}

/// Everything the connections and roles share.
pub(crate) struct Shared<C: Config> {
    pub radio: C::Radio,
    pub scheduler: C::Scheduler,
    pub executor: C::Executor,
    pub cipher: C::Cipher,
    pub rng: C::Rng,
    pub settings: Settings,
    pub token: InstantToken,

    /// Control PDUs queued by the procedures.
    pub ctrl_pool: Pool<PduBuf, TX_CTRL_POOL_SIZE>,
    /// Host data PDUs.
    pub tx_pool: Pool<PduBuf, TX_DATA_POOL_SIZE>,
    /// Received data PDUs.
    pub rx_pool: Pool<PduBuf, RX_POOL_SIZE>,

    pub tx_pipe: Pipe<TxItem, TX_PIPE_SIZE>,
    pub release_pipe: Pipe<ReleaseItem, RELEASE_PIPE_SIZE>,
    pub rx_pipe: Pipe<RxItem, RX_PIPE_SIZE>,
    pub report_pipe: Pipe<AdvReport, REPORT_PIPE_SIZE>,

    /// The connection event using the radio.
    pub event: Option<ActiveEvent>,
    /// The advertising or scanning event using the radio.
    pub radio_role: Option<RadioRole>,
    pub adv_data: AdvData,
    /// Channel map used for new central connections and channel map updates.
    pub channel_map: ChannelMap,
}

impl<C: Config> Shared<C> {
    /// Queues a control PDU on `conn`.
    pub fn send_ctrl(&mut self, conn: &mut Connection, pdu: ControlPdu<'_>) -> Result<(), NoMemory> {
        let node = self.ctrl_pool.acquire().ok_or(NoMemory)?;
        let encoded = self.ctrl_pool.get_mut(node).set_control(&pdu);
        assert!(encoded.is_ok(), "failed to encode {:?}", pdu);
        if conn.tx.push_ctrl(node).is_err() {
            self.ctrl_pool.release(node);
            return Err(NoMemory);
        }
        info!("LLCP-> {:?}", pdu);
        Ok(())
    }

    /// Returns whether an event of any role holds the radio.
    pub fn radio_busy(&self) -> bool {
        self.event.is_some() || self.radio_role.is_some()
    }

    /// Returns whether `ConnectionComplete` and `ChannelSelection` of a new connection fit into
    /// the rx pipe.
    pub fn can_establish(&self) -> bool {
        self.rx_pipe.free_slots() > MAX_CONNECTIONS + 1
    }

    /// Returns whether a notification can be queued.
    ///
    /// One slot per connection is held back for its `Terminated` event.
    pub fn can_notify(&self) -> bool {
        self.rx_pipe.free_slots() > MAX_CONNECTIONS
    }

    /// Queues a notification for the host.
    pub fn notify(&mut self, handle: ConnHandle, event: Notification) -> Result<(), NoMemory> {
        if !self.can_notify() {
            trace!("rx pipe full, dropping {:?}", event);
            return Err(NoMemory);
        }
        let item = RxItem {
            handle,
            kind: RxKind::Notify(event),
        };
        self.rx_pipe.enqueue(item).map_err(|_| NoMemory)?;
        self.signal_rx();
        Ok(())
    }

    /// Queues the final event of a connection context, using the held-back slots.
    fn notify_final(&mut self, handle: ConnHandle, event: Notification) {
        let item = RxItem {
            handle,
            kind: RxKind::Notify(event),
        };
        if self.rx_pipe.enqueue(item).is_err() {
            error!("no room for final event of {:?}", handle);
        }
        self.signal_rx();
    }

    /// Tells the host side that the rx or release pipe has new elements.
    pub fn signal_rx(&mut self) {
        if self
            .executor
            .enqueue(Context::Worker, Context::Job, Job::RxReady)
            .is_err()
        {
            trace!("executor full, host will poll");
        }
    }
}

/// A BLE Link-Layer controller handling up to `MAX_CONNECTIONS` connections.
pub struct Controller<C: Config> {
    conns: [Option<Connection>; MAX_CONNECTIONS],
    advertiser: Option<Advertiser>,
    scanner: Option<Scanner>,
    shared: Shared<C>,
}

impl<C: Config> Controller<C> {
    /// Creates a controller without any connections, neither advertising nor scanning.
    pub fn new(
        radio: C::Radio,
        scheduler: C::Scheduler,
        executor: C::Executor,
        cipher: C::Cipher,
        rng: C::Rng,
        settings: Settings,
    ) -> Self {
        Self {
            conns: Default::default(),
            advertiser: None,
            scanner: None,
            shared: Shared {
                radio,
                scheduler,
                executor,
                cipher,
                rng,
                settings,
                token: InstantToken::new(),
                ctrl_pool: Pool::new(),
                tx_pool: Pool::new(),
                rx_pool: Pool::new(),
                tx_pipe: Pipe::new(),
                release_pipe: Pipe::new(),
                rx_pipe: Pipe::new(),
                report_pipe: Pipe::new(),
                event: None,
                radio_role: None,
                adv_data: AdvData::default(),
                channel_map: ChannelMap::with_all_channels(),
            },
        }
    }

    /// Drops all connections and stops advertising and scanning without notifying the host, and
    /// frees every buffer.
    ///
    /// Buffer handles held by the host become invalid.
    pub fn reset(&mut self) {
        let sh = &mut self.shared;
        for conn in self.conns.iter_mut() {
            if let Some(conn) = conn.take() {
                sh.scheduler.stop(TickerId::Connection(conn.handle));
            }
        }
        if self.advertiser.take().is_some() {
            sh.scheduler.stop(TickerId::Advertiser);
            sh.scheduler.stop(TickerId::AdvertiserTimeout);
        }
        if self.scanner.take().is_some() {
            sh.scheduler.stop(TickerId::Scanner);
        }
        let had_event = sh.event.take().is_some();
        if sh.radio_role.take().is_some() || had_event {
            sh.scheduler.stop(TickerId::Event);
            sh.radio.disable();
        }

        sh.ctrl_pool.reset();
        sh.tx_pool.reset();
        sh.rx_pool.reset();
        sh.tx_pipe = Pipe::new();
        sh.release_pipe = Pipe::new();
        sh.rx_pipe = Pipe::new();
        sh.report_pipe = Pipe::new();
        sh.adv_data = AdvData::default();
        sh.token = InstantToken::new();
        sh.channel_map = ChannelMap::with_all_channels();
        info!("controller reset");
    }

    /// Resets the controller and hands back its collaborators.
    pub fn shutdown(mut self) -> (C::Radio, C::Scheduler, C::Executor, C::Cipher, C::Rng) {
        self.reset();
        let Shared {
            radio,
            scheduler,
            executor,
            cipher,
            rng,
            ..
        } = self.shared;
        (radio, scheduler, executor, cipher, rng)
    }

    /// Returns the settings the controller was created with.
    pub fn settings(&self) -> &Settings {
        &self.shared.settings
    }

    fn conn_mut(
        &mut self,
        handle: ConnHandle,
    ) -> Result<(&mut Connection, &mut Shared<C>), RequestError> {
        match &mut self.conns[handle.index()] {
            Some(conn) => Ok((conn, &mut self.shared)),
            None => Err(RequestError::UnknownConnection),
        }
    }

    fn conn(&self, handle: ConnHandle) -> Result<&Connection, RequestError> {
        self.conns[handle.index()]
            .as_ref()
            .ok_or(RequestError::UnknownConnection)
    }

    // Worker context

    /// The connection timer of `handle` fired. `lazy` expiries were skipped before it.
    pub fn prepare(&mut self, handle: ConnHandle, now: Instant, lazy: u16) {
        self.drain_tx();
        if let Some(conn) = &mut self.conns[handle.index()] {
            event::prepare(conn, &mut self.shared, now, lazy);
        }
        self.release_if_terminated(handle);
    }

    /// The event timer fired: start the radio for the prepared event.
    pub fn execute(&mut self) {
        let sh = &mut self.shared;
        match (sh.radio_role, &mut self.advertiser, &mut self.scanner) {
            (Some(RadioRole::Advertiser), Some(adv), _) => return advertiser::execute(adv, sh),
            (Some(RadioRole::Scanner), _, Some(scan)) => return scanner::execute(scan, sh),
            _ => {}
        }

        let handle = match &self.shared.event {
            Some(ev) => ev.handle,
            None => return,
        };
        if let Some(conn) = &mut self.conns[handle.index()] {
            event::execute(conn, &mut self.shared);
        }
    }

    /// The radio completed a transfer.
    pub fn radio_event(&mut self, event: RadioEvent<'_>, now: Instant) {
        match self.shared.radio_role {
            Some(RadioRole::Advertiser) => return self.adv_radio_event(event, now),
            Some(RadioRole::Scanner) => return self.scan_radio_event(event, now),
            None => {}
        }

        let handle = match &self.shared.event {
            Some(ev) => ev.handle,
            None => {
                trace!("radio event without connection event: {:?}", event);
                return;
            }
        };
        if let Some(conn) = &mut self.conns[handle.index()] {
            event::radio_event(conn, &mut self.shared, event, now);
        }
        self.release_if_terminated(handle);
    }

    /// Moves queued host data into the tx lists.
    fn drain_tx(&mut self) {
        let sh = &mut self.shared;
        while let Some(item) = sh.tx_pipe.dequeue() {
            let queued = match &mut self.conns[item.handle.index()] {
                Some(conn) if conn.terminated.is_none() => conn.tx.push_data(item.node).is_ok(),
                _ => false,
            };
            if !queued {
                let release = ReleaseItem {
                    handle: item.handle,
                    node: item.node,
                    counted: false,
                };
                // Cannot fail: the release pipe has room for every data buffer.
                sh.release_pipe.enqueue(release).ok();
                sh.signal_rx();
            }
        }
    }

    fn release_if_terminated(&mut self, handle: ConnHandle) {
        let busy = matches!(&self.shared.event, Some(ev) if ev.handle == handle);
        let terminated = match &self.conns[handle.index()] {
            Some(conn) => conn.terminated.is_some(),
            None => false,
        };
        if terminated && !busy {
            self.release_conn(handle);
        }
    }

    /// Returns a connection context to the pool, flushing everything it still holds.
    fn release_conn(&mut self, handle: ConnHandle) {
        let mut conn = match self.conns[handle.index()].take() {
            Some(conn) => conn,
            None => return,
        };
        let reason = conn.terminated.unwrap_or(ErrorCode::LocalHostTerminated);
        let sh = &mut self.shared;

        sh.scheduler.stop(TickerId::Connection(handle));
        if matches!(&sh.event, Some(ev) if ev.handle == handle) {
            sh.event = None;
            sh.scheduler.stop(TickerId::Event);
            sh.radio.disable();
        }

        let ctrl_pool = &mut sh.ctrl_pool;
        let release_pipe = &mut sh.release_pipe;
        conn.tx.flush(|node| match node {
            TxNode::Ctrl(node) => ctrl_pool.release(node),
            TxNode::Data(node) => {
                let item = ReleaseItem {
                    handle,
                    node,
                    counted: false,
                };
                release_pipe.enqueue(item).ok();
            }
        });
        sh.token.release(handle);

        info!("conn {:?} closed: {}", handle, reason);
        sh.notify_final(handle, Notification::Terminated { reason });
    }

    /// Runs a job the controller gave to the executor.
    pub fn run_job(&mut self, job: Job) {
        match job {
            // The host drains the pipes with `rx_get`.
            Job::RxReady => {}
            Job::WindowOffsets(handle) => {
                if let Ok((conn, sh)) = self.conn_mut(handle) {
                    conn_update::window_offsets(conn, sh);
                }
            }
        }
    }

    // Connection setup

    /// Creates a peripheral connection from a received `CONNECT_IND`.
    ///
    /// `end` is the time the `CONNECT_IND` ended on air. `csa2` says whether both sides announced
    /// support for channel selection algorithm #2.
    pub fn connect_peripheral(
        &mut self,
        ind: &ConnectInd,
        csa2: bool,
        end: Instant,
    ) -> Result<ConnHandle, RequestError> {
        let index = self.free_index().ok_or(RequestError::NoMemory)?;
        self.establish(index, Role::Peripheral, ind, csa2, end, None)
    }

    /// Generates the `CONNECT_IND` parameters for a new central connection.
    pub fn new_connect_ind(
        &mut self,
        interval: u16,
        latency: u16,
        timeout: u16,
    ) -> Result<ConnectInd, RequestError> {
        let sh = &mut self.shared;
        let ind = ConnectInd::generate(
            &mut sh.rng,
            interval,
            latency,
            timeout,
            sh.channel_map,
            sh.settings.sca,
        );
        validate_connect_ind(&ind)?;
        Ok(ind)
    }

    /// Creates a central connection after `ind` was sent, ending at `end`.
    pub fn connect_central(
        &mut self,
        ind: &ConnectInd,
        csa2: bool,
        end: Instant,
    ) -> Result<ConnHandle, RequestError> {
        let index = self.free_index().ok_or(RequestError::NoMemory)?;
        self.establish(index, Role::Central, ind, csa2, end, None)
    }

    /// Returns a connection context that is neither in use nor reserved by the advertiser or
    /// initiator.
    fn free_index(&self) -> Option<usize> {
        let adv = self.advertiser.as_ref().and_then(|adv| adv.conn);
        let init = self
            .scanner
            .as_ref()
            .and_then(|scan| scan.initiator.as_ref())
            .map(|init| init.conn);
        (0..MAX_CONNECTIONS).find(|&i| {
            let reserved = |h: Option<ConnHandle>| h.map_or(false, |h| h.index() == i);
            self.conns[i].is_none() && !reserved(adv) && !reserved(init)
        })
    }

    /// Creates a connection in context `index`.
    fn establish(
        &mut self,
        index: usize,
        role: Role,
        ind: &ConnectInd,
        csa2: bool,
        end: Instant,
        peer: Option<DeviceAddress>,
    ) -> Result<ConnHandle, RequestError> {
        validate_connect_ind(ind)?;
        let sh = &mut self.shared;
        if !sh.can_establish() {
            return Err(RequestError::NoMemory);
        }

        let handle = ConnHandle::new(index as u8);
        let csa2 = csa2
            && sh
                .settings
                .features
                .contains(FeatureSet::CHANNEL_SELECTION_ALGORITHM_2);
        let conn = Connection::new(handle, role, ind, csa2, &sh.settings);

        // The first anchor lies in the transmit window, 1.25 ms plus the window offset after the
        // end of the CONNECT_IND.
        let first = Duration::from_micros(1250) + ind.win_offset()
            - Duration::from_micros(PREPARE_LEAD_US);
        let status = sh.scheduler.start(
            TickerId::Connection(handle),
            end,
            first,
            ind.interval(),
            conn.slot(),
            true,
        );
        if status == TickerStatus::Failure {
            return Err(RequestError::NoMemory);
        }

        info!("conn {:?} established as {:?}: {:?}", handle, role, ind);
        let _ = sh.notify(
            handle,
            Notification::ConnectionComplete {
                role,
                peer,
                interval: ind.interval,
                latency: ind.latency,
                timeout: ind.timeout,
            },
        );
        let _ = sh.notify(
            handle,
            Notification::ChannelSelection {
                algorithm: csa2 as u8,
            },
        );
        self.conns[index] = Some(conn);
        Ok(handle)
    }

    // Advertiser

    /// Sets the data sent in advertising PDUs. Takes effect with the next PDU.
    pub fn adv_data_set(&mut self, data: &[u8]) -> Result<(), RequestError> {
        advertiser::set_data(&mut self.shared.adv_data.adv, data)
    }

    /// Sets the data sent in scan responses. Takes effect with the next response.
    pub fn scan_rsp_data_set(&mut self, data: &[u8]) -> Result<(), RequestError> {
        advertiser::set_data(&mut self.shared.adv_data.scan_rsp, data)
    }

    /// Starts advertising. The first advertising event is prepared right away.
    ///
    /// Connectable advertising reserves a connection context, so this fails with `NoMemory` when
    /// all contexts are in use.
    pub fn adv_enable(&mut self, params: AdvParams, now: Instant) -> Result<(), RequestError> {
        if self.advertiser.is_some() {
            return Err(RequestError::Disallowed);
        }
        params.validate()?;
        let conn = if params.pdu_type.is_connectable() {
            let index = self.free_index().ok_or(RequestError::NoMemory)?;
            Some(ConnHandle::new(index as u8))
        } else {
            None
        };

        let sh = &mut self.shared;
        let status = sh.scheduler.start(
            TickerId::Advertiser,
            now,
            Duration::ZERO,
            params.period(),
            params.slot(),
            false,
        );
        if status == TickerStatus::Failure {
            return Err(RequestError::NoMemory);
        }
        if params.is_high_duty() {
            let status = sh.scheduler.start(
                TickerId::AdvertiserTimeout,
                now,
                Duration::from_micros(HIGH_DUTY_TIMEOUT_US),
                Duration::ZERO,
                Duration::ZERO,
                false,
            );
            if status == TickerStatus::Failure {
                sh.scheduler.stop(TickerId::Advertiser);
                return Err(RequestError::NoMemory);
            }
        }

        info!("advertising as {:?}: {:?}", params.own_address, params.pdu_type);
        self.advertiser = Some(Advertiser::new(params, conn));
        Ok(())
    }

    /// Stops advertising. A reserved connection context is freed without notification.
    ///
    /// Fails with `Disallowed` if the advertiser is not enabled.
    pub fn adv_disable(&mut self) -> Result<(), RequestError> {
        self.stop_advertiser()
            .map(|_| ())
            .ok_or(RequestError::Disallowed)
    }

    /// Returns whether the advertiser is enabled.
    pub fn is_advertising(&self) -> bool {
        self.advertiser.is_some()
    }

    /// The advertising timer fired.
    pub fn adv_prepare(&mut self, now: Instant) {
        if let Some(adv) = &mut self.advertiser {
            advertiser::prepare(adv, &mut self.shared, now);
        }
    }

    /// High duty cycle directed advertising ran out without a connection.
    pub fn adv_timeout(&mut self) {
        if let Some(adv) = self.stop_advertiser() {
            if let Some(handle) = adv.conn {
                info!("directed advertising timed out");
                self.shared.notify_final(
                    handle,
                    Notification::ConnectionFailed {
                        status: ErrorCode::AdvertisingTimeout,
                    },
                );
            }
        }
    }

    fn stop_advertiser(&mut self) -> Option<Advertiser> {
        let adv = self.advertiser.take()?;
        let sh = &mut self.shared;
        sh.scheduler.stop(TickerId::Advertiser);
        sh.scheduler.stop(TickerId::AdvertiserTimeout);
        if sh.radio_role == Some(RadioRole::Advertiser) {
            sh.radio_role = None;
            sh.scheduler.stop(TickerId::Event);
            sh.radio.disable();
        }
        Some(adv)
    }

    fn adv_radio_event(&mut self, event: RadioEvent<'_>, now: Instant) {
        let request = match &mut self.advertiser {
            Some(adv) => advertiser::radio_event(adv, &mut self.shared, event),
            None => return,
        };
        let request = match request {
            Some(request) => request,
            None => return,
        };
        let index = match self.advertiser.as_ref().and_then(|adv| adv.conn) {
            Some(handle) => handle.index(),
            None => return,
        };

        // `now` is the end of the CONNECT_IND
        match self.establish_from(index, Role::Peripheral, &request, now) {
            Ok(_) => {
                self.stop_advertiser();
            }
            Err(e) => {
                debug!("ignoring CONNECT_IND: {}", e);
                if let Some(adv) = &mut self.advertiser {
                    advertiser::next_channel(adv, &mut self.shared);
                }
            }
        }
    }

    fn establish_from(
        &mut self,
        index: usize,
        role: Role,
        request: &ConnectRequest,
        end: Instant,
    ) -> Result<ConnHandle, RequestError> {
        let ConnectRequest { ind, chsel, peer } = *request;
        self.establish(index, role, &ind, chsel, end, Some(peer))
    }

    // Scanner and initiator

    /// Starts scanning. Received advertising PDUs are reported as `RxEvent::AdvReport`.
    pub fn scan_enable(&mut self, params: ScanParams, now: Instant) -> Result<(), RequestError> {
        self.start_scanner(params, None, now)
    }

    /// Stops scanning. Use `connect_disable` to stop the initiator.
    pub fn scan_disable(&mut self) -> Result<(), RequestError> {
        match &self.scanner {
            Some(scan) if scan.initiator.is_none() => {}
            _ => return Err(RequestError::Disallowed),
        }
        self.stop_scanner();
        Ok(())
    }

    /// Returns whether the scanner or initiator is enabled.
    pub fn is_scanning(&self) -> bool {
        self.scanner.is_some()
    }

    /// Starts initiating a connection to `peer`, using the connection parameters in `ind`
    /// (created with `new_connect_ind`).
    ///
    /// Reserves a connection context, so this fails with `NoMemory` when all contexts are in use.
    pub fn connect_enable(
        &mut self,
        params: ScanParams,
        peer: DeviceAddress,
        ind: ConnectInd,
        now: Instant,
    ) -> Result<(), RequestError> {
        validate_connect_ind(&ind)?;
        let index = self.free_index().ok_or(RequestError::NoMemory)?;
        let init = Initiator::new(peer, ind, ConnHandle::new(index as u8));
        self.start_scanner(params, Some(init), now)
    }

    /// Cancels the initiator. The host receives `ConnectionFailed` for the reserved context.
    pub fn connect_disable(&mut self) -> Result<(), RequestError> {
        match &self.scanner {
            Some(scan) if scan.initiator.is_some() => {}
            _ => return Err(RequestError::Disallowed),
        }
        if let Some(init) = self.stop_scanner().and_then(|scan| scan.initiator) {
            self.shared.notify_final(
                init.conn,
                Notification::ConnectionFailed {
                    status: ErrorCode::UnknownConnectionId,
                },
            );
        }
        Ok(())
    }

    /// The scan timer fired.
    pub fn scan_prepare(&mut self, now: Instant) {
        if let Some(scan) = &mut self.scanner {
            scanner::prepare(scan, &mut self.shared, now);
        }
    }

    fn start_scanner(
        &mut self,
        params: ScanParams,
        initiator: Option<Initiator>,
        now: Instant,
    ) -> Result<(), RequestError> {
        if self.scanner.is_some() {
            return Err(RequestError::Disallowed);
        }
        params.validate()?;
        let status = self.shared.scheduler.start(
            TickerId::Scanner,
            now,
            Duration::ZERO,
            params.period(),
            params.window(),
            false,
        );
        if status == TickerStatus::Failure {
            return Err(RequestError::NoMemory);
        }
        info!(
            "scanning as {:?}, initiating: {}",
            params.own_address,
            initiator.is_some()
        );
        self.scanner = Some(Scanner::new(params, initiator));
        Ok(())
    }

    fn stop_scanner(&mut self) -> Option<Scanner> {
        let scan = self.scanner.take()?;
        let sh = &mut self.shared;
        sh.scheduler.stop(TickerId::Scanner);
        if sh.radio_role == Some(RadioRole::Scanner) {
            sh.radio_role = None;
            sh.scheduler.stop(TickerId::Event);
            sh.radio.disable();
        }
        Some(scan)
    }

    fn scan_radio_event(&mut self, event: RadioEvent<'_>, now: Instant) {
        let request = match &mut self.scanner {
            Some(scan) => scanner::radio_event(scan, &mut self.shared, event, now),
            None => return,
        };
        let request = match request {
            Some(request) => request,
            None => return,
        };
        let init = match self.stop_scanner().and_then(|scan| scan.initiator) {
            Some(init) => init,
            None => return,
        };

        // The peer acts on the CONNECT_IND, so there is no going back to scanning.
        if let Err(e) = self.establish_from(init.conn.index(), Role::Central, &request, now) {
            error!("failed to create connection after CONNECT_IND: {}", e);
            self.shared.notify_final(
                init.conn,
                Notification::ConnectionFailed {
                    status: ErrorCode::from(e),
                },
            );
        }
    }

    // Host requests

    /// Asks for new connection parameters.
    ///
    /// A central updates the connection directly, a peripheral asks the central.
    pub fn conn_update(&mut self, handle: ConnHandle, params: ConnParams) -> Result<(), RequestError> {
        let (conn, _) = self.conn_mut(handle)?;
        conn_update::request(conn, params)
    }

    /// Answers a `ConnectionParamRequest` notification, either accepting with the given
    /// parameters or rejecting with an error code.
    pub fn conn_param_reply(
        &mut self,
        handle: ConnHandle,
        reply: Result<ConnParams, ErrorCode>,
    ) -> Result<(), RequestError> {
        let (conn, sh) = self.conn_mut(handle)?;
        conn_update::host_reply(conn, sh, reply)
    }

    /// Sets the host channel map and starts a channel map update on every central connection
    /// that isn't busy with another procedure.
    pub fn chm_update(&mut self, map: ChannelMap) -> Result<(), RequestError> {
        if !map.is_valid() {
            return Err(RequestError::InvalidParameters);
        }
        self.shared.channel_map = map;
        for conn in self.conns.iter_mut().flatten() {
            if conn.role != Role::Central {
                continue;
            }
            match chan_map::request(conn, map) {
                Ok(()) => {}
                Err(e) => debug!("conn {:?}: channel map update deferred: {}", conn.handle, e),
            }
        }
        Ok(())
    }

    /// Returns the channel map in use on a connection.
    pub fn chm_get(&self, handle: ConnHandle) -> Result<ChannelMap, RequestError> {
        Ok(self.conn(handle)?.channel_map)
    }

    /// Starts or refreshes encryption on a central connection.
    pub fn enc_start(
        &mut self,
        handle: ConnHandle,
        rand: u64,
        ediv: u16,
        ltk: [u8; 16],
    ) -> Result<(), RequestError> {
        let (conn, _) = self.conn_mut(handle)?;
        encryption::request(conn, rand, ediv, ltk)
    }

    /// Answers an `LtkRequest` notification. `None` means the host has no key.
    pub fn ltk_reply(&mut self, handle: ConnHandle, ltk: Option<[u8; 16]>) -> Result<(), RequestError> {
        let (conn, _) = self.conn_mut(handle)?;
        encryption::ltk_reply(conn, ltk)
    }

    /// Starts a feature exchange.
    pub fn feature_exchange(&mut self, handle: ConnHandle) -> Result<(), RequestError> {
        let (conn, _) = self.conn_mut(handle)?;
        exchange::request_features(conn)
    }

    /// Starts a version exchange.
    pub fn version_exchange(&mut self, handle: ConnHandle) -> Result<(), RequestError> {
        let (conn, sh) = self.conn_mut(handle)?;
        exchange::request_version(conn, sh)
    }

    /// Terminates a connection, telling the peer `reason`.
    pub fn terminate(&mut self, handle: ConnHandle, reason: ErrorCode) -> Result<(), RequestError> {
        let (conn, _) = self.conn_mut(handle)?;
        conn.terminate.slot.request()?;
        conn.terminate.reason = reason;
        Ok(())
    }

    /// Starts a data length update with new maximum transmit sizes.
    pub fn length_req(
        &mut self,
        handle: ConnHandle,
        tx_octets: u16,
        tx_time: u16,
    ) -> Result<(), RequestError> {
        let (conn, _) = self.conn_mut(handle)?;
        length::request(conn, tx_octets, tx_time)
    }

    /// Sets the maximum transmit sizes of new connections.
    pub fn length_default_set(&mut self, tx_octets: u16, tx_time: u16) -> Result<(), RequestError> {
        length::validate(tx_octets, tx_time)?;
        self.shared.settings.default_tx_octets = tx_octets;
        self.shared.settings.default_tx_time = tx_time;
        Ok(())
    }

    /// Returns the maximum transmit sizes of new connections, as `(octets, time)`.
    pub fn length_default_get(&self) -> (u16, u16) {
        let s = &self.shared.settings;
        (s.default_tx_octets, s.default_tx_time)
    }

    /// Returns the largest supported sizes as `(tx_octets, tx_time, rx_octets, rx_time)`.
    pub fn length_max_get(&self) -> (u16, u16, u16, u16) {
        let octets = MAX_PAYLOAD_SIZE as u16;
        (octets, MAX_PAYLOAD_TIME, octets, MAX_PAYLOAD_TIME)
    }

    /// Returns the PDU sizes of a connection.
    pub fn length_get(&self, handle: ConnHandle) -> Result<DataLength, RequestError> {
        Ok(self.conn(handle)?.data_len)
    }

    /// Asks to move a connection to one of the given PHYs in each direction.
    pub fn phy_update(&mut self, handle: ConnHandle, tx: PhySet, rx: PhySet) -> Result<(), RequestError> {
        let (conn, _) = self.conn_mut(handle)?;
        phy::request(conn, tx, rx)
    }

    /// Sets the preferred PHYs of new connections.
    pub fn phy_default_set(&mut self, tx: PhySet, rx: PhySet) -> Result<(), RequestError> {
        if tx.is_empty() || rx.is_empty() {
            return Err(RequestError::InvalidParameters);
        }
        self.shared.settings.default_phy_tx = tx;
        self.shared.settings.default_phy_rx = rx;
        Ok(())
    }

    /// Returns the PHYs of a connection as `(tx, rx)`.
    pub fn phy_get(&self, handle: ConnHandle) -> Result<(Phy, Phy), RequestError> {
        let conn = self.conn(handle)?;
        Ok((conn.phy.tx, conn.phy.rx))
    }

    /// Returns the authenticated payload timeout in 10 ms units.
    pub fn apto_get(&self, handle: ConnHandle) -> Result<u16, RequestError> {
        Ok(self.conn(handle)?.apto)
    }

    /// Sets the authenticated payload timeout in 10 ms units.
    ///
    /// The timeout must cover at least one full latency period.
    pub fn apto_set(&mut self, handle: ConnHandle, apto: u16) -> Result<(), RequestError> {
        let (conn, _) = self.conn_mut(handle)?;
        let period = conn.interval().as_micros() * (u32::from(conn.latency) + 1);
        if apto == 0 || u32::from(apto) * 10_000 < period {
            return Err(RequestError::InvalidParameters);
        }
        conn.apto = apto;
        conn.reload_apto();
        Ok(())
    }

    /// Returns the last RSSI sampled on a connection, as a positive value in -dBm.
    pub fn rssi(&self, handle: ConnHandle) -> Result<u8, RequestError> {
        Ok(self.conn(handle)?.rssi.latest)
    }

    // Data path

    /// Takes a buffer for an outgoing data PDU.
    pub fn tx_mem_acquire(&mut self) -> Option<Handle> {
        self.shared.tx_pool.acquire()
    }

    /// Gives access to an acquired transmit buffer. Fill it with `PduBuf::set_data`.
    pub fn tx_mem(&mut self, node: Handle) -> &mut PduBuf {
        self.shared.tx_pool.get_mut(node)
    }

    /// Returns an unused transmit buffer.
    pub fn tx_mem_release(&mut self, node: Handle) {
        self.shared.tx_pool.release(node);
    }

    /// Queues a filled transmit buffer on a connection.
    ///
    /// On success, the buffer is owned by the controller until it shows up in a
    /// `RxEvent::Completed` (or the connection terminates). On error, the host keeps it.
    pub fn tx_mem_enqueue(&mut self, handle: ConnHandle, node: Handle) -> Result<(), RequestError> {
        self.conn(handle)?;
        let sh = &mut self.shared;
        let header = sh.tx_pool.get(node).header();
        let valid = match header.llid() {
            Llid::DataStart | Llid::DataCont => header.payload_length() > 0,
            Llid::Control | Llid::Reserved => false,
        };
        if !valid {
            return Err(RequestError::InvalidParameters);
        }
        sh.tx_pipe
            .enqueue(TxItem { handle, node })
            .map_err(|_| RequestError::NoMemory)
    }

    /// Returns the next event for the host.
    ///
    /// Completed transmissions are reported first, grouped per connection, and advertising
    /// reports last.
    pub fn rx_get(&mut self) -> Option<RxEvent> {
        let sh = &mut self.shared;
        while let Some(first) = sh.release_pipe.dequeue() {
            let handle = first.handle;
            let mut count = 0u8;
            let mut item = Some(first);
            while let Some(released) = item {
                sh.tx_pool.release(released.node);
                if released.counted {
                    count += 1;
                }
                item = match sh.release_pipe.peek() {
                    Some(next) if next.handle == handle => sh.release_pipe.dequeue(),
                    _ => None,
                };
            }
            if count > 0 {
                return Some(RxEvent::Completed { handle, count });
            }
        }

        if let Some(item) = sh.rx_pipe.dequeue() {
            return Some(match item.kind {
                RxKind::Pdu(node) => RxEvent::Pdu {
                    handle: item.handle,
                    node,
                },
                RxKind::Notify(event) => RxEvent::Notify {
                    handle: item.handle,
                    event,
                },
            });
        }
        sh.report_pipe.dequeue().map(RxEvent::AdvReport)
    }

    /// Gives access to a received PDU reported by `RxEvent::Pdu`.
    pub fn rx_pdu(&self, node: Handle) -> &PduBuf {
        self.shared.rx_pool.get(node)
    }

    /// Hands a received PDU back to the controller.
    pub fn rx_release(&mut self, node: Handle) {
        self.shared.rx_pool.release(node);
    }
}

fn validate_connect_ind(ind: &ConnectInd) -> Result<(), RequestError> {
    ConnParams {
        interval_min: ind.interval,
        interval_max: ind.interval,
        latency: ind.latency,
        timeout: ind.timeout,
    }
    .validate()?;

    let window_ok = ind.win_size >= 1
        && ind.win_size <= 8
        && u16::from(ind.win_size) < ind.interval
        && ind.win_offset <= ind.interval;
    if window_ok && (5..=16).contains(&ind.hop) && ind.channel_map.is_valid() {
        Ok(())
    } else {
        Err(RequestError::InvalidParameters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bytes::{ByteReader, ByteWriter, FromBytes, ToBytes},
        link::{
            advertiser::{response_window, AdvChannels},
            advertising::{AddressKind, PduType},
            connect::{SleepClockAccuracy, CONNECT_IND_SIZE},
            llcp::{ConnectionParamData, ConnectionUpdateData, ControlOpcode},
            mock::{
                adv_received, control_payload, received, MockCipher, MockConfig, MockExecutor,
                MockRadio, MockScheduler, TestRng,
            },
            SeqNum,
        },
        phy::AdvertisingChannel,
        utils::Hex,
    };

    const ZERO: SeqNum = SeqNum::ZERO;
    const ONE: SeqNum = SeqNum::ONE;

    fn controller() -> Controller<MockConfig> {
        controller_with(Settings::default())
    }

    fn controller_with(settings: Settings) -> Controller<MockConfig> {
        Controller::new(
            MockRadio::new(),
            MockScheduler::default(),
            MockExecutor::default(),
            MockCipher,
            TestRng::new(7),
            settings,
        )
    }

    fn connect_ind(interval: u16) -> ConnectInd {
        ConnectInd {
            access_address: Hex(0x71764129),
            crc_init: Hex(0x123456),
            win_size: 1,
            win_offset: 0,
            interval,
            latency: 0,
            timeout: 100,
            channel_map: ChannelMap::with_all_channels(),
            hop: 7,
            sca: SleepClockAccuracy::Ppm0To20,
        }
    }

    /// Creates a peripheral connection and drains its setup events.
    fn peripheral(ctl: &mut Controller<MockConfig>, interval: u16) -> ConnHandle {
        let handle = ctl
            .connect_peripheral(&connect_ind(interval), false, Instant::from_raw_micros(0))
            .unwrap();
        drain(ctl);
        handle
    }

    fn drain(ctl: &mut Controller<MockConfig>) -> Vec<RxEvent> {
        let mut events = Vec::new();
        while let Some(event) = ctl.rx_get() {
            events.push(event);
        }
        events
    }

    fn conn(ctl: &Controller<MockConfig>, handle: ConnHandle) -> &Connection {
        ctl.conns[handle.index()].as_ref().unwrap()
    }

    fn sent_control(ctl: &Controller<MockConfig>) -> Vec<PduBuf> {
        ctl.shared.radio.sent_control()
    }

    /// Starts a peripheral event; returns the anchor point.
    fn start_event(ctl: &mut Controller<MockConfig>, handle: ConnHandle, n: u32) -> Instant {
        let now = Instant::from_raw_micros(n * 100_000);
        ctl.prepare(handle, now, 0);
        ctl.execute();
        now + Duration::from_micros(PREPARE_LEAD_US)
    }

    fn peer_sends(ctl: &mut Controller<MockConfig>, at: Instant, rx: crate::phy::Received<'_>) {
        ctl.radio_event(RadioEvent::RxDone(rx), at);
        ctl.radio_event(RadioEvent::TxDone, at + Duration::from_micros(400));
    }

    /// Sequence number of the peer's first PDU in the `n`th peripheral event, if nothing is lost.
    fn peer_seq(n: u32) -> SeqNum {
        if n % 2 == 1 {
            ZERO
        } else {
            ONE
        }
    }

    /// Runs peripheral events in which the central only sends empty PDUs.
    fn idle_events(
        ctl: &mut Controller<MockConfig>,
        handle: ConnHandle,
        events: core::ops::RangeInclusive<u32>,
    ) {
        for n in events {
            let anchor = start_event(ctl, handle, n);
            let sn = peer_seq(n);
            peer_sends(
                ctl,
                anchor + Duration::from_micros(100),
                received(Llid::DataCont, sn, sn, false, &[]),
            );
        }
    }

    /// Runs central event `counter`, in which the peripheral acknowledges and sends nothing.
    fn central_event(ctl: &mut Controller<MockConfig>, handle: ConnHandle, counter: u16, now: Instant) {
        ctl.prepare(handle, now, 0);
        ctl.execute();
        let t = now + Duration::from_micros(PREPARE_LEAD_US);
        let (sn, nesn) = if counter % 2 == 0 {
            (ZERO, ONE)
        } else {
            (ONE, ZERO)
        };
        ctl.radio_event(RadioEvent::TxDone, t + Duration::from_micros(300));
        ctl.radio_event(
            RadioEvent::RxDone(received(Llid::DataCont, sn, nesn, false, &[])),
            t + Duration::from_micros(500),
        );
    }

    fn central(ctl: &mut Controller<MockConfig>) -> ConnHandle {
        let ind = ctl.new_connect_ind(24, 0, 100).unwrap();
        let handle = ctl
            .connect_central(&ind, false, Instant::from_raw_micros(0))
            .unwrap();
        drain(ctl);
        handle
    }

    fn terminations(events: &[RxEvent]) -> Vec<ErrorCode> {
        events
            .iter()
            .filter_map(|e| match e {
                RxEvent::Notify {
                    event: Notification::Terminated { reason },
                    ..
                } => Some(*reason),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn peripheral_setup_events() {
        let mut ctl = controller();
        let handle = ctl
            .connect_peripheral(&connect_ind(24), true, Instant::from_raw_micros(0))
            .unwrap();
        let events = drain(&mut ctl);
        assert_eq!(
            events,
            [
                RxEvent::Notify {
                    handle,
                    event: Notification::ConnectionComplete {
                        role: Role::Peripheral,
                        peer: None,
                        interval: 24,
                        latency: 0,
                        timeout: 100,
                    },
                },
                RxEvent::Notify {
                    handle,
                    event: Notification::ChannelSelection { algorithm: 1 },
                },
            ]
        );

        let (id, anchor, first, period) = ctl.shared.scheduler.started[0];
        assert_eq!(id, TickerId::Connection(handle));
        assert_eq!(anchor, Instant::from_raw_micros(0));
        assert_eq!(first, Duration::from_micros(250));
        assert_eq!(period, Duration::from_micros(30_000));
    }

    #[test]
    fn rejects_bad_connect_ind() {
        let mut ctl = controller();
        let mut ind = connect_ind(24);
        ind.hop = 3;
        assert_eq!(
            ctl.connect_peripheral(&ind, false, Instant::from_raw_micros(0)),
            Err(RequestError::InvalidParameters)
        );
        assert!(ctl.rx_get().is_none());
    }

    #[test]
    fn context_exhaustion() {
        let mut ctl = controller();
        for _ in 0..MAX_CONNECTIONS {
            peripheral(&mut ctl, 24);
        }
        assert_eq!(
            ctl.connect_peripheral(&connect_ind(24), false, Instant::from_raw_micros(0)),
            Err(RequestError::NoMemory)
        );
    }

    #[test]
    fn central_connection() {
        let mut ctl = controller();
        let ind = ctl.new_connect_ind(40, 0, 200).unwrap();
        assert!(crate::link::access_address::is_valid(ind.access_address.0));
        let handle = ctl
            .connect_central(&ind, false, Instant::from_raw_micros(0))
            .unwrap();
        drain(&mut ctl);

        ctl.prepare(handle, Instant::from_raw_micros(250), 0);
        ctl.execute();
        // The central opens the event with an empty PDU.
        let sent = &ctl.shared.radio.sent;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].header.payload_length(), 0);
        assert!(ctl.shared.radio.rx_windows.is_empty());

        assert_eq!(
            ctl.new_connect_ind(40, 0, 10),
            Err(RequestError::InvalidParameters)
        );
    }

    /// The peer asks for our features: exactly one response goes out, and its buffer is freed
    /// once acknowledged.
    #[test]
    fn feature_request_answered_once() {
        let mut ctl = controller();
        let handle = peripheral(&mut ctl, 30);

        let req = control_payload(ControlPdu::FeatureReq {
            features_central: FeatureSet::supported(),
        });
        let anchor = start_event(&mut ctl, handle, 1);
        peer_sends(
            &mut ctl,
            anchor + Duration::from_micros(100),
            received(Llid::Control, ZERO, ZERO, false, &req),
        );
        assert!(ctl.shared.event.is_none());

        let anchor = start_event(&mut ctl, handle, 2);
        peer_sends(
            &mut ctl,
            anchor + Duration::from_micros(100),
            received(Llid::DataCont, ONE, ONE, false, &[]),
        );

        let ctrl = sent_control(&ctl);
        assert_eq!(ctrl.len(), 1);
        assert_eq!(ctrl[0].control_opcode(), Some(ControlOpcode::FeatureRsp));
        assert_eq!(ctl.shared.ctrl_pool.free_count(), TX_CTRL_POOL_SIZE);

        let c = conn(&ctl, handle);
        assert!(!c.llcp.pending());
        assert!(c.tx.is_idle());
        assert!(c.established);
        // second event answered with an empty PDU
        let last = ctl.shared.radio.sent.last().unwrap();
        assert_eq!(last.header.payload_length(), 0);
    }

    /// Out-of-range parameters are refused without touching the link.
    #[test]
    fn invalid_conn_update_rejected_locally() {
        let mut ctl = controller();
        let handle = peripheral(&mut ctl, 24);
        let params = ConnParams {
            interval_min: 12,
            interval_max: 3201,
            latency: 0,
            timeout: 100,
        };
        assert_eq!(
            ctl.conn_update(handle, params),
            Err(RequestError::InvalidParameters)
        );

        let anchor = start_event(&mut ctl, handle, 1);
        peer_sends(
            &mut ctl,
            anchor + Duration::from_micros(100),
            received(Llid::DataCont, ZERO, ZERO, false, &[]),
        );
        assert!(sent_control(&ctl).is_empty());
        assert!(!conn(&ctl, handle).llcp.pending());
        assert!(drain(&mut ctl).is_empty());
    }

    /// Supervision timeout on its last tick terminates the link exactly once.
    #[test]
    fn supervision_timeout() {
        let mut ctl = controller();
        let handle = peripheral(&mut ctl, 24);

        let anchor = start_event(&mut ctl, handle, 1);
        peer_sends(
            &mut ctl,
            anchor + Duration::from_micros(100),
            received(Llid::DataCont, ZERO, ZERO, false, &[]),
        );
        assert!(conn(&ctl, handle).established);

        let anchor = start_event(&mut ctl, handle, 2);
        ctl.conns[handle.index()]
            .as_mut()
            .unwrap()
            .timers
            .supervision_expire = 1;
        ctl.radio_event(RadioEvent::RxTimeout, anchor + Duration::from_micros(200));
        // stray events after the release are ignored
        ctl.radio_event(RadioEvent::RxTimeout, anchor + Duration::from_micros(300));
        ctl.prepare(handle, Instant::from_raw_micros(300_000), 0);

        assert!(ctl.conns[handle.index()].is_none());
        assert_eq!(
            drain(&mut ctl),
            [RxEvent::Notify {
                handle,
                event: Notification::Terminated {
                    reason: ErrorCode::ConnectionTimeout
                },
            }]
        );
        let stops = ctl
            .shared
            .scheduler
            .stopped
            .iter()
            .filter(|id| **id == TickerId::Connection(handle))
            .count();
        assert_eq!(stops, 1);
    }

    /// Without a single valid packet, a new connection fails after 6 events.
    #[test]
    fn establishment_timeout() {
        let mut ctl = controller();
        let handle = peripheral(&mut ctl, 24);
        for n in 1..=6 {
            let anchor = start_event(&mut ctl, handle, n);
            ctl.radio_event(RadioEvent::RxTimeout, anchor + Duration::from_micros(200));
        }
        assert_eq!(
            drain(&mut ctl),
            [RxEvent::Notify {
                handle,
                event: Notification::Terminated {
                    reason: ErrorCode::ConnectionFailedToEstablish
                },
            }]
        );
    }

    /// The peer starting encryption while our feature exchange runs is turned away, and the
    /// feature exchange still completes.
    #[test]
    fn enc_req_collides_with_feature_exchange() {
        let mut ctl = controller();
        let handle = peripheral(&mut ctl, 24);
        ctl.feature_exchange(handle).unwrap();

        let enc_req = control_payload(ControlPdu::EncReq {
            rand: Hex(1),
            ediv: Hex(2),
            skd_m: Hex(3),
            iv_m: Hex(4),
        });
        let anchor = start_event(&mut ctl, handle, 1);
        let t = anchor + Duration::from_micros(100);
        // LL_PERIPHERAL_FEATURE_REQ goes out, with the reject queued behind it
        ctl.radio_event(
            RadioEvent::RxDone(received(Llid::Control, ZERO, ZERO, false, &enc_req)),
            t,
        );
        ctl.radio_event(RadioEvent::TxDone, t + Duration::from_micros(300));
        assert!(ctl.shared.event.is_some());
        peer_sends(
            &mut ctl,
            t + Duration::from_micros(600),
            received(Llid::DataCont, ONE, ONE, false, &[]),
        );
        assert!(ctl.shared.event.is_none());

        let ctrl = sent_control(&ctl);
        assert_eq!(ctrl.len(), 2);
        assert_eq!(
            ctrl[0].control_opcode(),
            Some(ControlOpcode::PeripheralFeatureReq)
        );
        assert_eq!(
            ctrl[1].control().unwrap(),
            ControlPdu::RejectExtInd {
                reject_opcode: ControlOpcode::EncReq,
                error_code: ErrorCode::DifferentTransactionCollision,
            }
        );
        assert!(drain(&mut ctl).is_empty());

        let rsp = control_payload(ControlPdu::FeatureRsp {
            features_used: FeatureSet::supported(),
        });
        let anchor = start_event(&mut ctl, handle, 2);
        peer_sends(
            &mut ctl,
            anchor + Duration::from_micros(100),
            received(Llid::Control, ZERO, ZERO, false, &rsp),
        );
        assert_eq!(
            drain(&mut ctl),
            [RxEvent::Notify {
                handle,
                event: Notification::FeatureExchangeComplete {
                    status: ErrorCode::Success,
                    features: FeatureSet::supported(),
                },
            }]
        );
        let c = conn(&ctl, handle);
        assert!(!c.llcp.pending());
        assert!(!c.enc.pause_rx);
        assert!(c.terminated.is_none());
    }

    /// Host data is fragmented to the connection's maximum payload size and reported as
    /// completed after the last fragment is acknowledged.
    #[test]
    fn data_fragmentation_and_completion() {
        let mut ctl = controller();
        let handle = peripheral(&mut ctl, 24);

        let node = ctl.tx_mem_acquire().unwrap();
        let data = [0xab; 40];
        ctl.tx_mem(node).set_data(Llid::DataStart, &data).unwrap();
        ctl.tx_mem_enqueue(handle, node).unwrap();

        let anchor = start_event(&mut ctl, handle, 1);
        let t = anchor + Duration::from_micros(100);
        ctl.radio_event(
            RadioEvent::RxDone(received(Llid::DataCont, ZERO, ZERO, false, &[])),
            t,
        );
        ctl.radio_event(RadioEvent::TxDone, t + Duration::from_micros(300));
        peer_sends(
            &mut ctl,
            t + Duration::from_micros(600),
            received(Llid::DataCont, ONE, ONE, false, &[]),
        );

        let sent = &ctl.shared.radio.sent;
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].header.llid(), Llid::DataStart);
        assert_eq!(sent[0].payload.len(), 27);
        assert!(sent[0].header.md());
        assert_eq!(sent[1].header.llid(), Llid::DataCont);
        assert_eq!(sent[1].payload.len(), 13);
        assert!(!sent[1].header.md());

        // second fragment not acknowledged yet
        assert!(drain(&mut ctl).is_empty());

        let anchor = start_event(&mut ctl, handle, 2);
        peer_sends(
            &mut ctl,
            anchor + Duration::from_micros(100),
            received(Llid::DataCont, ZERO, ZERO, false, &[]),
        );
        assert_eq!(
            drain(&mut ctl),
            [RxEvent::Completed { handle, count: 1 }]
        );
        assert_eq!(ctl.shared.tx_pool.free_count(), TX_DATA_POOL_SIZE);
    }

    #[test]
    fn received_data_reaches_host() {
        let mut ctl = controller();
        let handle = peripheral(&mut ctl, 24);

        let anchor = start_event(&mut ctl, handle, 1);
        peer_sends(
            &mut ctl,
            anchor + Duration::from_micros(100),
            received(Llid::DataStart, ZERO, ZERO, false, b"hello"),
        );
        let events = drain(&mut ctl);
        let node = match events.as_slice() {
            [RxEvent::Pdu { handle: h, node }] if *h == handle => *node,
            other => panic!("unexpected events {:?}", other),
        };
        assert_eq!(ctl.rx_pdu(node).payload(), b"hello");
        assert_eq!(ctl.rx_pdu(node).header().llid(), Llid::DataStart);
        ctl.rx_release(node);
        assert_eq!(ctl.shared.rx_pool.free_count(), RX_POOL_SIZE);
        assert_eq!(conn(&ctl, handle).nesn, ONE);
    }

    #[test]
    fn termination_flushes_queued_data() {
        let mut ctl = controller();
        let handle = peripheral(&mut ctl, 24);

        let node = ctl.tx_mem_acquire().unwrap();
        ctl.tx_mem(node).set_data(Llid::DataStart, &[1, 2, 3]).unwrap();
        ctl.tx_mem_enqueue(handle, node).unwrap();
        ctl.terminate(handle, ErrorCode::RemoteUserTerminated).unwrap();
        assert_eq!(
            ctl.terminate(handle, ErrorCode::RemoteUserTerminated),
            Err(RequestError::Busy)
        );

        // LL_TERMINATE_IND goes first and is acknowledged
        let anchor = start_event(&mut ctl, handle, 1);
        let t = anchor + Duration::from_micros(100);
        ctl.radio_event(
            RadioEvent::RxDone(received(Llid::DataCont, ZERO, ZERO, false, &[])),
            t,
        );
        let sent = &ctl.shared.radio.sent;
        assert_eq!(
            sent[0].header.llid(),
            Llid::Control,
            "terminate goes before data"
        );
        ctl.radio_event(RadioEvent::TxDone, t + Duration::from_micros(300));
        ctl.radio_event(
            RadioEvent::RxDone(received(Llid::DataCont, ONE, ONE, false, &[])),
            t + Duration::from_micros(600),
        );
        ctl.radio_event(RadioEvent::TxDone, t + Duration::from_micros(900));

        assert!(ctl.conns[handle.index()].is_none());
        // the flushed data buffer is freed but not counted
        assert_eq!(
            drain(&mut ctl),
            [RxEvent::Notify {
                handle,
                event: Notification::Terminated {
                    reason: ErrorCode::LocalHostTerminated
                },
            }]
        );
        assert_eq!(ctl.shared.tx_pool.free_count(), TX_DATA_POOL_SIZE);
        assert_eq!(ctl.shared.ctrl_pool.free_count(), TX_CTRL_POOL_SIZE);
    }

    #[test]
    fn crc_errors() {
        let mut ctl = controller();
        let handle = peripheral(&mut ctl, 24);

        let anchor = start_event(&mut ctl, handle, 1);
        let mut bad = received(Llid::DataCont, ZERO, ZERO, false, &[]);
        bad.crc_ok = false;
        ctl.radio_event(RadioEvent::RxDone(bad), anchor);
        // first strike: respond anyway, without processing the header
        assert_eq!(ctl.shared.radio.sent.len(), 1);
        let c = conn(&ctl, handle);
        assert_eq!(c.nesn, ZERO);
        assert!(!c.established);

        ctl.radio_event(RadioEvent::TxDone, anchor + Duration::from_micros(300));
        // no MD on either side
        assert!(ctl.shared.event.is_none());
    }

    #[test]
    fn mic_failure_terminates() {
        let mut ctl = controller();
        let handle = peripheral(&mut ctl, 24);

        let anchor = start_event(&mut ctl, handle, 1);
        let mut bad = received(Llid::DataStart, ZERO, ZERO, false, &[1]);
        bad.mic_ok = false;
        ctl.radio_event(RadioEvent::RxDone(bad), anchor);

        assert!(ctl.conns[handle.index()].is_none());
        assert_eq!(
            drain(&mut ctl),
            [RxEvent::Notify {
                handle,
                event: Notification::Terminated {
                    reason: ErrorCode::MicFailure
                },
            }]
        );
    }

    #[test]
    fn host_request_validation() {
        let mut ctl = controller();
        let handle = peripheral(&mut ctl, 24);
        let other = ConnHandle::new(3);

        assert_eq!(ctl.feature_exchange(other), Err(RequestError::UnknownConnection));
        assert_eq!(
            ctl.enc_start(handle, 0, 0, [0; 16]),
            Err(RequestError::Disallowed)
        );
        assert_eq!(ctl.ltk_reply(handle, None), Err(RequestError::Disallowed));
        assert_eq!(
            ctl.length_default_set(26, 328),
            Err(RequestError::InvalidParameters)
        );
        ctl.length_default_set(251, 2120).unwrap();
        assert_eq!(ctl.length_default_get(), (251, 2120));
        assert_eq!(ctl.length_max_get(), (251, 17040, 251, 17040));
        assert_eq!(
            ctl.phy_default_set(PhySet::empty(), PhySet::LE_1M),
            Err(RequestError::InvalidParameters)
        );
        assert_eq!(ctl.phy_get(handle), Ok((Phy::Le1M, Phy::Le1M)));

        assert_eq!(ctl.apto_get(handle), Ok(3000));
        assert_eq!(ctl.apto_set(handle, 2), Err(RequestError::InvalidParameters));
        ctl.apto_set(handle, 100).unwrap();
        assert_eq!(ctl.apto_get(handle), Ok(100));

        ctl.feature_exchange(handle).unwrap();
        assert_eq!(ctl.feature_exchange(handle), Err(RequestError::Busy));
        assert_eq!(ctl.version_exchange(handle), Err(RequestError::Busy));
    }

    #[test]
    fn channel_map_update_on_centrals_only() {
        let mut ctl = controller();
        let p = peripheral(&mut ctl, 24);
        let ind = ctl.new_connect_ind(24, 0, 100).unwrap();
        let c = ctl
            .connect_central(&ind, false, Instant::from_raw_micros(0))
            .unwrap();
        drain(&mut ctl);

        let map = ChannelMap::from_raw([0xff, 0, 0, 0, 0]);
        assert_eq!(
            ctl.chm_update(ChannelMap::from_raw([1, 0, 0, 0, 0])),
            Err(RequestError::InvalidParameters)
        );
        ctl.chm_update(map).unwrap();
        assert!(conn(&ctl, c).llcp.pending());
        assert!(!conn(&ctl, p).llcp.pending());
        // old map stays in use until the instant
        assert_eq!(ctl.chm_get(c), Ok(ChannelMap::with_all_channels()));
    }

    #[test]
    fn window_offsets_job() {
        let mut ctl = controller();
        let ind = ctl.new_connect_ind(24, 0, 100).unwrap();
        let handle = ctl
            .connect_central(&ind, false, Instant::from_raw_micros(0))
            .unwrap();
        drain(&mut ctl);
        let params = ConnParams {
            interval_min: 40,
            interval_max: 40,
            latency: 0,
            timeout: 200,
        };
        ctl.conn_update(handle, params).unwrap();

        ctl.prepare(handle, Instant::from_raw_micros(250), 0);
        assert!(ctl
            .shared
            .executor
            .jobs
            .contains(&Job::WindowOffsets(handle)));
        ctl.run_job(Job::WindowOffsets(handle));
        assert!(conn(&ctl, handle).llcp.pending());
    }

    #[test]
    fn reset_and_shutdown() {
        let mut ctl = controller();
        let handle = peripheral(&mut ctl, 24);
        let node = ctl.tx_mem_acquire().unwrap();
        ctl.tx_mem(node).set_data(Llid::DataStart, &[1]).unwrap();
        ctl.tx_mem_enqueue(handle, node).unwrap();
        start_event(&mut ctl, handle, 1);

        ctl.reset();
        assert!(ctl.conns.iter().all(Option::is_none));
        assert!(ctl.shared.event.is_none());
        assert!(ctl.rx_get().is_none());
        assert_eq!(ctl.shared.tx_pool.free_count(), TX_DATA_POOL_SIZE);
        assert_eq!(ctl.shared.token.owner(), None);

        let (radio, scheduler, ..) = ctl.shutdown();
        assert!(radio.disabled > 0);
        assert!(scheduler
            .stopped
            .contains(&TickerId::Connection(handle)));
    }

    #[test]
    fn rssi_reported_after_sustained_change() {
        let mut ctl = controller();
        let handle = peripheral(&mut ctl, 24);

        let mut sn = ZERO;
        for n in 1..=10 {
            let anchor = start_event(&mut ctl, handle, n);
            let mut rx = received(Llid::DataCont, sn, sn, false, &[]);
            rx.rssi = Some(70);
            peer_sends(&mut ctl, anchor + Duration::from_micros(100), rx);
            sn.increment();
        }

        assert_eq!(ctl.rssi(handle), Ok(70));
        assert_eq!(
            drain(&mut ctl),
            [RxEvent::Notify {
                handle,
                event: Notification::Rssi { rssi: 70 },
            }]
        );
    }

    /// Indications whose instant already passed end the connection.
    #[test]
    fn instant_in_the_past_terminates() {
        let pdus = [
            control_payload(ControlPdu::ConnectionUpdateInd(ConnectionUpdateData {
                win_size: 1,
                win_offset: 0,
                interval: 40,
                latency: 0,
                timeout: 200,
                instant: 2,
            })),
            control_payload(ControlPdu::ChannelMapInd {
                map: ChannelMap::from_raw([0xff, 0, 0, 0, 0]),
                instant: 2,
            }),
            control_payload(ControlPdu::PhyUpdateInd {
                c_to_p_phy: PhySet::LE_2M,
                p_to_c_phy: PhySet::LE_2M,
                instant: 2,
            }),
        ];

        for pdu in &pdus {
            let mut ctl = controller();
            let handle = peripheral(&mut ctl, 24);
            idle_events(&mut ctl, handle, 1..=3);

            // event 3
            let anchor = start_event(&mut ctl, handle, 4);
            peer_sends(
                &mut ctl,
                anchor + Duration::from_micros(100),
                received(Llid::Control, ONE, ONE, false, pdu),
            );

            assert!(ctl.conns[handle.index()].is_none());
            assert_eq!(
                drain(&mut ctl),
                [RxEvent::Notify {
                    handle,
                    event: Notification::Terminated {
                        reason: ErrorCode::InstantPassed
                    },
                }]
            );
        }
    }

    /// A peer that never answers our request is disconnected after 40 s.
    #[test]
    fn procedure_response_timeout() {
        let mut ctl = controller();
        let handle = peripheral(&mut ctl, 24);
        ctl.feature_exchange(handle).unwrap();

        // 40 s in 30 ms events
        let events = 1334;
        idle_events(&mut ctl, handle, 1..=events - 1);
        assert_eq!(conn(&ctl, handle).timers.procedure_expire, 1);
        assert!(terminations(&drain(&mut ctl)).is_empty());

        idle_events(&mut ctl, handle, events..=events);
        assert!(ctl.conns[handle.index()].is_none());
        assert_eq!(
            terminations(&drain(&mut ctl)),
            [ErrorCode::LlResponseTimeout]
        );
        let ctrl = sent_control(&ctl);
        assert_eq!(ctrl.len(), 1);
        assert_eq!(
            ctrl[0].control_opcode(),
            Some(ControlOpcode::PeripheralFeatureReq)
        );
    }

    /// The central starts encryption; the host supplies the key one event later.
    #[test]
    fn peripheral_encryption_start() {
        let mut ctl = controller();
        let handle = peripheral(&mut ctl, 24);

        let enc_req = control_payload(ControlPdu::EncReq {
            rand: Hex(0x1122),
            ediv: Hex(0x33),
            skd_m: Hex(0xACBDCEDFE0F10213),
            iv_m: Hex(0xBADCAB24),
        });
        let anchor = start_event(&mut ctl, handle, 1);
        peer_sends(
            &mut ctl,
            anchor + Duration::from_micros(100),
            received(Llid::Control, ZERO, ZERO, false, &enc_req),
        );
        assert_eq!(
            drain(&mut ctl),
            [RxEvent::Notify {
                handle,
                event: Notification::LtkRequest {
                    rand: Hex(0x1122),
                    ediv: Hex(0x33),
                },
            }]
        );
        assert!(sent_control(&ctl).is_empty());
        assert!(conn(&ctl, handle).enc.pause_rx);
        ctl.ltk_reply(handle, Some([0x4c; 16])).unwrap();

        // LL_ENC_RSP, then LL_START_ENC_REQ in the same event
        let anchor = start_event(&mut ctl, handle, 2);
        let t = anchor + Duration::from_micros(100);
        peer_sends(&mut ctl, t, received(Llid::DataCont, ONE, ONE, false, &[]));
        assert!(ctl.shared.event.is_some());
        peer_sends(
            &mut ctl,
            t + Duration::from_micros(600),
            received(Llid::DataCont, ZERO, ZERO, false, &[]),
        );
        assert!(ctl.shared.event.is_none());
        let c = conn(&ctl, handle);
        assert!(c.enc.rx.is_some());
        assert!(c.enc.tx.is_none());
        assert!(c.enc.pause_tx);

        // encrypted LL_START_ENC_RSP from the central
        let start_rsp = control_payload(ControlPdu::StartEncRsp);
        let anchor = start_event(&mut ctl, handle, 3);
        peer_sends(
            &mut ctl,
            anchor + Duration::from_micros(100),
            received(Llid::Control, ONE, ONE, false, &start_rsp),
        );
        assert!(drain(&mut ctl).is_empty());

        let anchor = start_event(&mut ctl, handle, 4);
        peer_sends(
            &mut ctl,
            anchor + Duration::from_micros(100),
            received(Llid::DataCont, ZERO, ZERO, false, &[]),
        );

        let opcodes = sent_control(&ctl)
            .iter()
            .map(|pdu| pdu.control_opcode())
            .collect::<Vec<_>>();
        assert_eq!(
            opcodes,
            [
                Some(ControlOpcode::EncRsp),
                Some(ControlOpcode::StartEncReq),
                Some(ControlOpcode::StartEncRsp),
            ]
        );
        let ctrl = ctl
            .shared
            .radio
            .sent
            .iter()
            .filter(|s| s.header.llid() == Llid::Control)
            .map(|s| s.encrypted)
            .collect::<Vec<_>>();
        assert_eq!(ctrl, [false, false, true]);

        assert_eq!(
            drain(&mut ctl),
            [RxEvent::Notify {
                handle,
                event: Notification::EncryptionChange {
                    status: ErrorCode::Success,
                    enabled: true,
                },
            }]
        );
        let c = conn(&ctl, handle);
        assert!(c.enc.rx.is_some() && c.enc.tx.is_some());
        assert!(!c.enc.pause_rx && !c.enc.pause_tx);
        assert!(!c.llcp.pending());
        // one PDU received encrypted
        assert_eq!(c.enc.rx.as_ref().map(|ccm| ccm.counter), Some(1));
    }

    /// With fast encryption, LL_ENC_RSP goes out before the host has looked up the key.
    #[test]
    fn fast_encryption_answers_before_the_key() {
        let mut ctl = controller_with(Settings {
            fast_encryption: true,
            ..Settings::default()
        });
        let handle = peripheral(&mut ctl, 24);

        let enc_req = control_payload(ControlPdu::EncReq {
            rand: Hex(1),
            ediv: Hex(2),
            skd_m: Hex(3),
            iv_m: Hex(4),
        });
        let anchor = start_event(&mut ctl, handle, 1);
        peer_sends(
            &mut ctl,
            anchor + Duration::from_micros(100),
            received(Llid::Control, ZERO, ZERO, false, &enc_req),
        );
        let ctrl = sent_control(&ctl);
        assert_eq!(ctrl.len(), 1);
        assert_eq!(ctrl[0].control_opcode(), Some(ControlOpcode::EncRsp));
        drain(&mut ctl);

        ctl.ltk_reply(handle, Some([0x4c; 16])).unwrap();
        idle_events(&mut ctl, handle, 2..=2);
        let ctrl = sent_control(&ctl);
        assert_eq!(ctrl.len(), 2);
        assert_eq!(ctrl[1].control_opcode(), Some(ControlOpcode::StartEncReq));
    }

    /// New parameters take effect at the instant, restarting the connection timer.
    #[test]
    fn conn_update_at_instant() {
        let mut ctl = controller();
        let handle = peripheral(&mut ctl, 24);

        let ind = control_payload(ControlPdu::ConnectionUpdateInd(ConnectionUpdateData {
            win_size: 2,
            win_offset: 2,
            interval: 40,
            latency: 0,
            timeout: 200,
            instant: 3,
        }));
        let anchor = start_event(&mut ctl, handle, 1);
        peer_sends(
            &mut ctl,
            anchor + Duration::from_micros(100),
            received(Llid::Control, ZERO, ZERO, false, &ind),
        );
        idle_events(&mut ctl, handle, 2..=3);
        assert!(drain(&mut ctl).is_empty());
        assert_eq!(conn(&ctl, handle).interval, 24);

        // event 3 is the instant: no event on the old timing
        let now = Instant::from_raw_micros(400_000);
        ctl.prepare(handle, now, 0);
        assert!(ctl.shared.event.is_none());
        let (id, anchor, first, period) = *ctl.shared.scheduler.started.last().unwrap();
        assert_eq!(id, TickerId::Connection(handle));
        assert_eq!(anchor, now);
        assert_eq!(first, Duration::from_micros(1250 + 2 * 1250));
        assert_eq!(period, Duration::from_micros(50_000));
        assert!(ctl
            .shared
            .scheduler
            .stopped
            .contains(&TickerId::Connection(handle)));
        assert_eq!(
            drain(&mut ctl),
            [RxEvent::Notify {
                handle,
                event: Notification::ConnectionUpdateComplete {
                    status: ErrorCode::Success,
                    interval: 40,
                    latency: 0,
                    timeout: 200,
                },
            }]
        );

        // the first event on the new timing listens across the transmit window
        ctl.prepare(handle, Instant::from_raw_micros(403_750), 0);
        ctl.execute();
        let c = conn(&ctl, handle);
        assert_eq!(c.event_counter, 3);
        assert_eq!(c.interval, 40);
        assert!(*ctl.shared.radio.rx_windows.last().unwrap() > Duration::from_micros(2500));
    }

    /// Both directions switch to 2M at the instant.
    #[test]
    fn phy_update_at_instant() {
        let mut ctl = controller();
        let handle = peripheral(&mut ctl, 24);

        let ind = control_payload(ControlPdu::PhyUpdateInd {
            c_to_p_phy: PhySet::LE_2M,
            p_to_c_phy: PhySet::LE_2M,
            instant: 2,
        });
        let anchor = start_event(&mut ctl, handle, 1);
        peer_sends(
            &mut ctl,
            anchor + Duration::from_micros(100),
            received(Llid::Control, ZERO, ZERO, false, &ind),
        );
        idle_events(&mut ctl, handle, 2..=2);
        assert_eq!(ctl.phy_get(handle), Ok((Phy::Le1M, Phy::Le1M)));
        assert_eq!(ctl.shared.radio.configured.last().unwrap().1, Phy::Le1M);
        assert!(drain(&mut ctl).is_empty());

        start_event(&mut ctl, handle, 3);
        assert_eq!(ctl.phy_get(handle), Ok((Phy::Le2M, Phy::Le2M)));
        assert_eq!(ctl.shared.radio.configured.last().unwrap().1, Phy::Le2M);
        assert_eq!(
            drain(&mut ctl),
            [RxEvent::Notify {
                handle,
                event: Notification::PhyUpdateComplete {
                    status: ErrorCode::Success,
                    tx: Phy::Le2M,
                    rx: Phy::Le2M,
                },
            }]
        );
        assert!(conn(&ctl, handle).instant.is_none());
    }

    /// Only one connection at a time waits for an instant. The second central sends its
    /// LL_CHANNEL_MAP_IND once the first one's map is in use.
    #[test]
    fn channel_map_instants_are_serialized() {
        let mut ctl = controller();
        let a = central(&mut ctl);
        let b = central(&mut ctl);
        let map = ChannelMap::from_raw([0xff, 0, 0, 0, 0]);
        ctl.chm_update(map).unwrap();

        let channel_map_inds = |ctl: &Controller<MockConfig>| {
            sent_control(ctl)
                .iter()
                .filter_map(|pdu| match pdu.control() {
                    Ok(ControlPdu::ChannelMapInd { instant, .. }) => Some(instant),
                    _ => None,
                })
                .collect::<Vec<_>>()
        };

        central_event(&mut ctl, a, 0, Instant::from_raw_micros(100_000));
        assert_eq!(channel_map_inds(&ctl), [6]);
        assert_eq!(ctl.shared.token.owner(), Some(a));

        central_event(&mut ctl, b, 0, Instant::from_raw_micros(110_000));
        assert_eq!(channel_map_inds(&ctl), [6]);
        assert!(conn(&ctl, b).llcp.pending());

        for counter in 1..6 {
            let now = Instant::from_raw_micros(100_000 + u32::from(counter) * 30_000);
            central_event(&mut ctl, a, counter, now);
        }
        assert_eq!(ctl.chm_get(a), Ok(ChannelMap::with_all_channels()));

        // instant of a
        central_event(&mut ctl, a, 6, Instant::from_raw_micros(280_000));
        assert_eq!(ctl.chm_get(a), Ok(map));
        assert!(!conn(&ctl, a).llcp.pending());
        assert_eq!(ctl.shared.token.owner(), None);

        central_event(&mut ctl, b, 1, Instant::from_raw_micros(290_000));
        assert_eq!(channel_map_inds(&ctl), [6, 7]);
        assert_eq!(ctl.shared.token.owner(), Some(b));
        assert_eq!(ctl.chm_get(b), Ok(ChannelMap::with_all_channels()));
    }

    #[test]
    fn invalid_param_req_from_peer_is_rejected() {
        let mut ctl = controller();
        let handle = peripheral(&mut ctl, 24);
        let req = control_payload(ControlPdu::ConnectionParamReq(ConnectionParamData {
            interval_min: 24,
            interval_max: 24,
            latency: 0,
            // below 100 ms
            timeout: 5,
            preferred_periodicity: 0,
            reference_conn_event_count: 0,
            offsets: [ConnectionParamData::NO_OFFSET; 6],
        }));
        let anchor = start_event(&mut ctl, handle, 1);
        peer_sends(
            &mut ctl,
            anchor + Duration::from_micros(100),
            received(Llid::Control, ZERO, ZERO, false, &req),
        );
        idle_events(&mut ctl, handle, 2..=2);

        let reject = ControlPdu::RejectExtInd {
            reject_opcode: ControlOpcode::ConnectionParamReq,
            error_code: ErrorCode::InvalidLlParameters,
        };
        assert!(sent_control(&ctl)
            .iter()
            .any(|pdu| pdu.control().ok() == Some(reject)));
        assert!(!conn(&ctl, handle).llcp.pending());
        assert!(ctl.conns[handle.index()].is_some());
        assert!(drain(&mut ctl).is_empty());
    }

    fn addr(byte: u8) -> DeviceAddress {
        DeviceAddress::new([byte; 6], AddressKind::Random)
    }

    fn us(micros: u32) -> Duration {
        Duration::from_micros(micros)
    }

    fn adv_params(pdu_type: PduType) -> AdvParams {
        AdvParams {
            pdu_type,
            interval: 0x0800,
            channels: AdvChannels::all(),
            own_address: addr(1),
            peer: None,
            high_duty: false,
        }
    }

    fn scan_params(active: bool) -> ScanParams {
        ScanParams {
            active,
            interval: 0x0010,
            window: 0x0010,
            own_address: addr(1),
        }
    }

    fn lldata(ind: &ConnectInd) -> [u8; CONNECT_IND_SIZE] {
        let mut buf = [0; CONNECT_IND_SIZE];
        ind.to_bytes(&mut ByteWriter::new(&mut buf)).unwrap();
        buf
    }

    fn reports(events: &[RxEvent]) -> Vec<AdvReport> {
        events
            .iter()
            .filter_map(|e| match e {
                RxEvent::AdvReport(report) => Some(*report),
                _ => None,
            })
            .collect()
    }

    fn last_adv_sent(ctl: &Controller<MockConfig>) -> (u8, PduType, Vec<u8>) {
        let sent = ctl.shared.radio.adv_sent.last().unwrap();
        (
            sent.channel.unwrap().index(),
            sent.header.type_(),
            sent.payload.clone(),
        )
    }

    #[test]
    fn nonconnectable_advertising_cycles_channels() {
        let mut ctl = controller();
        ctl.adv_data_set(&[0x02, 0x01, 0x06]).unwrap();
        let t = Instant::from_raw_micros(10_000);
        ctl.adv_enable(adv_params(PduType::AdvNonconnInd), t).unwrap();
        assert_eq!(
            ctl.adv_enable(adv_params(PduType::AdvNonconnInd), t),
            Err(RequestError::Disallowed)
        );
        assert_eq!(
            ctl.shared.scheduler.started,
            [(TickerId::Advertiser, t, Duration::ZERO, Duration::from_millis(1280))]
        );

        ctl.adv_prepare(t);
        assert_eq!(ctl.shared.radio_role, Some(RadioRole::Advertiser));
        let (id, delay, ..) = ctl.shared.scheduler.updates[0];
        assert_eq!(id, TickerId::Advertiser);
        assert!(delay <= Duration::from_millis(10));

        ctl.execute();
        let mut pdu = vec![1; 6];
        pdu.extend_from_slice(&[0x02, 0x01, 0x06]);
        assert_eq!(last_adv_sent(&ctl), (37, PduType::AdvNonconnInd, pdu.clone()));
        ctl.radio_event(RadioEvent::TxDone, t + us(1200));
        assert_eq!(last_adv_sent(&ctl), (38, PduType::AdvNonconnInd, pdu.clone()));
        ctl.radio_event(RadioEvent::TxDone, t + us(1400));
        assert_eq!(last_adv_sent(&ctl), (39, PduType::AdvNonconnInd, pdu));
        ctl.radio_event(RadioEvent::TxDone, t + us(1600));

        // Nothing to listen for after a non-connectable PDU
        assert!(ctl.shared.radio.adv_rx_windows.is_empty());
        assert_eq!(ctl.shared.radio.adv_sent.len(), 3);
        assert_eq!(ctl.shared.radio_role, None);
        assert_eq!(ctl.shared.radio.disabled, 1);

        ctl.adv_disable().unwrap();
        assert!(!ctl.is_advertising());
        assert!(ctl.shared.scheduler.stopped.contains(&TickerId::Advertiser));
        assert_eq!(ctl.adv_disable(), Err(RequestError::Disallowed));
    }

    #[test]
    fn advertiser_answers_scan_request() {
        let mut ctl = controller();
        ctl.scan_rsp_data_set(b"\x03\x09hi").unwrap();
        let t = Instant::from_raw_micros(10_000);
        ctl.adv_enable(adv_params(PduType::AdvScanInd), t).unwrap();
        ctl.adv_prepare(t);
        ctl.execute();
        ctl.radio_event(RadioEvent::TxDone, t + us(1200));
        assert_eq!(ctl.shared.radio.adv_rx_windows, [response_window()]);

        // A request for another advertiser moves on to the next channel
        let scanner = addr(9);
        let mut buf = [0; 39];
        let rx = adv_received(PduType::ScanReq, &scanner, Some(&addr(2)), &[], &mut buf);
        ctl.radio_event(RadioEvent::AdvRxDone(rx), t + us(1400));
        assert_eq!(last_adv_sent(&ctl), (38, PduType::AdvScanInd, vec![1; 6]));
        ctl.radio_event(RadioEvent::TxDone, t + us(1600));

        let rx = adv_received(PduType::ScanReq, &scanner, Some(&addr(1)), &[], &mut buf);
        ctl.radio_event(RadioEvent::AdvRxDone(rx), t + us(1800));
        let mut rsp = vec![1; 6];
        rsp.extend_from_slice(b"\x03\x09hi");
        assert_eq!(last_adv_sent(&ctl), (38, PduType::ScanRsp, rsp));

        ctl.radio_event(RadioEvent::TxDone, t + us(2000));
        assert_eq!(last_adv_sent(&ctl), (39, PduType::AdvScanInd, vec![1; 6]));
        ctl.radio_event(RadioEvent::TxDone, t + us(2200));
        ctl.radio_event(RadioEvent::RxTimeout, t + us(2400));
        assert_eq!(ctl.shared.radio_role, None);
        assert_eq!(ctl.shared.radio.adv_sent.len(), 4);

        // Scannable advertising ignores connection requests
        ctl.adv_prepare(t + Duration::from_millis(1280));
        ctl.execute();
        ctl.radio_event(RadioEvent::TxDone, t + us(1_281_200));
        let data = lldata(&connect_ind(24));
        let rx = adv_received(PduType::ConnectInd, &scanner, Some(&addr(1)), &data, &mut buf);
        ctl.radio_event(RadioEvent::AdvRxDone(rx), t + us(1_281_400));
        assert!(ctl.is_advertising());
        assert!(ctl.conns.iter().all(Option::is_none));
        assert_eq!(last_adv_sent(&ctl), (38, PduType::AdvScanInd, vec![1; 6]));
    }

    #[test]
    fn advertiser_accepts_connect_ind() {
        let mut ctl = controller();
        let t = Instant::from_raw_micros(10_000);
        ctl.adv_enable(adv_params(PduType::AdvInd), t).unwrap();

        // The reserved context is not handed out
        let other = ctl.connect_peripheral(&connect_ind(24), false, t).unwrap();
        assert_eq!(other.index(), 1);
        drain(&mut ctl);

        ctl.adv_prepare(t);
        ctl.execute();
        ctl.radio_event(RadioEvent::TxDone, t + us(1200));

        let initiator = addr(7);
        let data = lldata(&connect_ind(24));
        let mut buf = [0; 39];
        let rx = adv_received(PduType::ConnectInd, &initiator, Some(&addr(1)), &data, &mut buf);
        let end = t + us(1500);
        ctl.radio_event(RadioEvent::AdvRxDone(rx), end);

        assert!(!ctl.is_advertising());
        assert_eq!(ctl.shared.radio_role, None);
        assert!(ctl.shared.scheduler.stopped.contains(&TickerId::Advertiser));
        let handle = ConnHandle::new(0);
        assert_eq!(conn(&ctl, handle).role, Role::Peripheral);
        assert!(ctl.shared.scheduler.started.contains(&(
            TickerId::Connection(handle),
            end,
            us(250),
            us(30_000)
        )));
        assert_eq!(
            drain(&mut ctl),
            [
                RxEvent::Notify {
                    handle,
                    event: Notification::ConnectionComplete {
                        role: Role::Peripheral,
                        peer: Some(initiator),
                        interval: 24,
                        latency: 0,
                        timeout: 100,
                    },
                },
                RxEvent::Notify {
                    handle,
                    event: Notification::ChannelSelection { algorithm: 0 },
                },
            ]
        );
    }

    #[test]
    fn directed_advertising_times_out() {
        let mut ctl = controller();
        let t = Instant::from_raw_micros(0);
        let mut params = adv_params(PduType::AdvDirectInd);
        params.peer = Some(addr(7));
        params.high_duty = true;
        params.interval = 0;
        ctl.adv_enable(params, t).unwrap();
        assert_eq!(
            ctl.shared.scheduler.started,
            [
                (TickerId::Advertiser, t, Duration::ZERO, us(3750)),
                (TickerId::AdvertiserTimeout, t, us(1_280_000), Duration::ZERO),
            ]
        );

        ctl.adv_prepare(t);
        assert!(ctl.shared.scheduler.updates.is_empty());
        ctl.execute();
        let mut pdu = vec![1; 6];
        pdu.extend_from_slice(&[7; 6]);
        assert_eq!(last_adv_sent(&ctl), (37, PduType::AdvDirectInd, pdu));
        ctl.radio_event(RadioEvent::TxDone, t + us(1200));

        // Only the addressed initiator may connect
        let data = lldata(&connect_ind(24));
        let mut buf = [0; 39];
        let rx = adv_received(PduType::ConnectInd, &addr(8), Some(&addr(1)), &data, &mut buf);
        ctl.radio_event(RadioEvent::AdvRxDone(rx), t + us(1500));
        assert!(ctl.is_advertising());
        assert!(ctl.conns.iter().all(Option::is_none));
        assert_eq!(ctl.shared.radio.adv_sent.len(), 2);

        ctl.adv_timeout();
        assert!(!ctl.is_advertising());
        assert_eq!(ctl.shared.radio_role, None);
        assert!(ctl.shared.scheduler.stopped.contains(&TickerId::AdvertiserTimeout));
        assert_eq!(
            drain(&mut ctl),
            [RxEvent::Notify {
                handle: ConnHandle::new(0),
                event: Notification::ConnectionFailed {
                    status: ErrorCode::AdvertisingTimeout,
                },
            }]
        );

        // The reserved context is free again
        let handle = ctl.connect_peripheral(&connect_ind(24), false, t).unwrap();
        assert_eq!(handle.index(), 0);
    }

    #[test]
    fn connectable_advertising_needs_a_free_context() {
        let mut ctl = controller();
        for _ in 0..MAX_CONNECTIONS {
            peripheral(&mut ctl, 24);
        }
        let t = Instant::from_raw_micros(0);
        assert_eq!(
            ctl.adv_enable(adv_params(PduType::AdvInd), t),
            Err(RequestError::NoMemory)
        );
        ctl.adv_enable(adv_params(PduType::AdvNonconnInd), t).unwrap();
    }

    #[test]
    fn active_scanner_reports_and_requests() {
        let mut ctl = controller();
        let t = Instant::from_raw_micros(0);
        ctl.scan_enable(scan_params(true), t).unwrap();
        assert_eq!(
            ctl.shared.scheduler.started,
            [(TickerId::Scanner, t, Duration::ZERO, us(10_000))]
        );
        ctl.scan_prepare(t);
        ctl.execute();
        assert_eq!(ctl.shared.radio.adv_channel, Some(AdvertisingChannel::first()));
        assert_eq!(ctl.shared.radio.adv_rx_windows, [us(10_000)]);

        // The window starts PREPARE_LEAD_US after the prepare
        let start = t + us(PREPARE_LEAD_US);
        let adv = addr(4);
        let mut buf = [0; 39];
        let rx = adv_received(PduType::AdvInd, &adv, None, &[0x02, 0x01, 0x06], &mut buf);
        ctl.radio_event(RadioEvent::AdvRxDone(rx), start + us(2000));
        let mut req = vec![1; 6];
        req.extend_from_slice(&[4; 6]);
        assert_eq!(last_adv_sent(&ctl), (37, PduType::ScanReq, req));

        ctl.radio_event(RadioEvent::TxDone, start + us(2300));
        let rx = adv_received(PduType::ScanRsp, &adv, None, b"\x03\x09hi", &mut buf);
        ctl.radio_event(RadioEvent::AdvRxDone(rx), start + us(2500));
        assert_eq!(
            ctl.shared.radio.adv_rx_windows,
            [us(10_000), response_window(), us(7500)]
        );

        ctl.radio_event(RadioEvent::RxTimeout, start + us(10_000));
        assert_eq!(ctl.shared.radio_role, None);

        let reports = reports(&drain(&mut ctl));
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].pdu_type, PduType::AdvInd);
        assert_eq!(reports[0].address, adv);
        assert_eq!(reports[0].rssi, Some(50));
        assert_eq!(reports[0].data(), &[0x02, 0x01, 0x06]);
        assert_eq!(reports[1].pdu_type, PduType::ScanRsp);
        assert_eq!(reports[1].data(), b"\x03\x09hi");

        // The next window uses the next channel
        ctl.scan_prepare(t + us(10_000));
        ctl.execute();
        assert_eq!(ctl.shared.radio.adv_channel, Some(AdvertisingChannel::new(38)));

        ctl.scan_disable().unwrap();
        assert!(!ctl.is_scanning());
        assert_eq!(ctl.shared.radio_role, None);
        assert_eq!(ctl.scan_disable(), Err(RequestError::Disallowed));
    }

    #[test]
    fn passive_scanner_filters_pdus() {
        let mut ctl = controller();
        let t = Instant::from_raw_micros(0);
        ctl.scan_enable(scan_params(false), t).unwrap();
        ctl.scan_prepare(t);
        ctl.execute();

        let adv = addr(4);
        let mut buf = [0; 39];
        let now = t + us(3000);
        let rx = adv_received(PduType::AdvDirectInd, &adv, Some(&addr(5)), &[], &mut buf);
        ctl.radio_event(RadioEvent::AdvRxDone(rx), now);
        let rx = adv_received(PduType::AdvDirectInd, &adv, Some(&addr(1)), &[], &mut buf);
        ctl.radio_event(RadioEvent::AdvRxDone(rx), now);
        let rx = adv_received(PduType::ScanReq, &adv, Some(&addr(1)), &[], &mut buf);
        ctl.radio_event(RadioEvent::AdvRxDone(rx), now);
        let rx = adv_received(PduType::AdvScanInd, &adv, None, &[0x02, 0x01, 0x04], &mut buf);
        ctl.radio_event(RadioEvent::AdvRxDone(rx), now);

        assert!(ctl.shared.radio.adv_sent.is_empty());
        assert_eq!(ctl.shared.radio.adv_rx_windows.len(), 5);
        let reports = reports(&drain(&mut ctl));
        let types = reports.iter().map(|r| r.pdu_type).collect::<Vec<_>>();
        assert_eq!(types, [PduType::AdvDirectInd, PduType::AdvScanInd]);
        assert_eq!(reports[0].data(), &[1; 6]);
    }

    #[test]
    fn initiator_connects_to_peer() {
        let mut ctl = controller();
        let t = Instant::from_raw_micros(0);
        let peer = addr(4);
        let ind = ctl.new_connect_ind(24, 0, 100).unwrap();
        ctl.connect_enable(scan_params(false), peer, ind, t).unwrap();
        assert_eq!(ctl.scan_disable(), Err(RequestError::Disallowed));
        ctl.scan_prepare(t);
        ctl.execute();

        let mut buf = [0; 39];
        let rx = adv_received(PduType::AdvInd, &addr(5), None, &[], &mut buf);
        ctl.radio_event(RadioEvent::AdvRxDone(rx), t + us(2000));
        let rx = adv_received(PduType::AdvNonconnInd, &peer, None, &[], &mut buf);
        ctl.radio_event(RadioEvent::AdvRxDone(rx), t + us(2500));
        assert!(ctl.shared.radio.adv_sent.is_empty());
        assert!(drain(&mut ctl).is_empty());

        let rx = adv_received(PduType::AdvInd, &peer, None, &[], &mut buf);
        ctl.radio_event(RadioEvent::AdvRxDone(rx), t + us(3000));
        let sent = ctl.shared.radio.adv_sent[0].clone();
        assert_eq!(sent.header.type_(), PduType::ConnectInd);
        assert!(sent.header.chsel());
        assert_eq!(sent.payload[..12], [1, 1, 1, 1, 1, 1, 4, 4, 4, 4, 4, 4]);
        let sent_ind = ConnectInd::from_bytes(&mut ByteReader::new(&sent.payload[12..])).unwrap();
        assert_eq!(sent_ind, ind);

        let end = t + us(3400);
        ctl.radio_event(RadioEvent::TxDone, end);
        assert!(!ctl.is_scanning());
        assert_eq!(ctl.shared.radio_role, None);
        let handle = ConnHandle::new(0);
        assert_eq!(conn(&ctl, handle).role, Role::Central);
        assert!(ctl.shared.scheduler.started.contains(&(
            TickerId::Connection(handle),
            end,
            us(250),
            us(30_000)
        )));
        assert_eq!(
            drain(&mut ctl)[0],
            RxEvent::Notify {
                handle,
                event: Notification::ConnectionComplete {
                    role: Role::Central,
                    peer: Some(peer),
                    interval: 24,
                    latency: 0,
                    timeout: 100,
                },
            }
        );
    }

    #[test]
    fn initiator_cancel() {
        let mut ctl = controller();
        let t = Instant::from_raw_micros(0);
        let ind = ctl.new_connect_ind(24, 0, 100).unwrap();
        assert_eq!(ctl.connect_disable(), Err(RequestError::Disallowed));
        ctl.connect_enable(scan_params(false), addr(4), ind, t).unwrap();
        assert_eq!(
            ctl.connect_enable(scan_params(false), addr(4), ind, t),
            Err(RequestError::Disallowed)
        );

        ctl.connect_disable().unwrap();
        assert!(!ctl.is_scanning());
        assert!(ctl.shared.scheduler.stopped.contains(&TickerId::Scanner));
        assert_eq!(
            drain(&mut ctl),
            [RxEvent::Notify {
                handle: ConnHandle::new(0),
                event: Notification::ConnectionFailed {
                    status: ErrorCode::UnknownConnectionId,
                },
            }]
        );
    }

    #[test]
    fn roles_share_the_radio() {
        let mut ctl = controller();
        let handle = peripheral(&mut ctl, 24);
        let t = Instant::from_raw_micros(100_000);
        ctl.adv_enable(adv_params(PduType::AdvNonconnInd), t).unwrap();
        ctl.adv_prepare(t);

        ctl.prepare(handle, t, 0);
        assert!(ctl.shared.event.is_none());
        ctl.scan_enable(scan_params(false), t).unwrap();
        ctl.scan_prepare(t);
        assert_eq!(ctl.shared.radio_role, Some(RadioRole::Advertiser));

        ctl.execute();
        for n in 0..3 {
            ctl.radio_event(RadioEvent::TxDone, t + us(1200 + n * 200));
        }
        assert_eq!(ctl.shared.radio_role, None);

        ctl.prepare(handle, t + us(30_000), 0);
        assert_eq!(ctl.shared.event.as_ref().map(|ev| ev.handle), Some(handle));
        ctl.adv_prepare(t + us(30_000));
        assert_eq!(ctl.shared.radio_role, None);
    }
}

//! Interfaces to the event scheduler and the deferred executor.
//!
//! The controller never reads a clock itself. Instead, a [`Scheduler`] keeps one periodic timer per
//! connection and role and calls back into the controller shortly before each event, and an
//! [`Executor`] runs [`Job`]s that are too slow for the radio interrupt.
//!
//! [`Scheduler`]: trait.Scheduler.html
//! [`Executor`]: trait.Executor.html
//! [`Job`]: enum.Job.html

use crate::{link::ConnHandle, time::Duration, time::Instant};

/// Identifies a timer owned by the controller.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TickerId {
    /// The periodic timer of a connection. When it fires, the glue calls `Controller::prepare`.
    Connection(ConnHandle),

    /// A one-shot timer covering the radio warm-up before an event. When it fires, the glue calls
    /// `Controller::execute`.
    Event,

    /// The periodic advertising timer. When it fires, the glue calls `Controller::adv_prepare`.
    Advertiser,

    /// The one-shot end of high duty cycle directed advertising. When it fires, the glue calls
    /// `Controller::adv_timeout`.
    AdvertiserTimeout,

    /// The periodic scan window timer. When it fires, the glue calls `Controller::scan_prepare`.
    Scanner,
}

/// Result of a scheduler operation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TickerStatus {
    Success,
    /// The operation was queued and will complete later.
    Busy,
    Failure,
}

/// A periodic slot reserved in the scheduler.
///
/// Used when picking connection update window offsets that do not overlap other connections.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Reservation {
    /// The next time this slot starts.
    pub next: Instant,
    /// The slot's period. Zero for one-shot slots.
    pub period: Duration,
    /// How long the slot occupies the radio.
    pub len: Duration,
}

/// The periodic/one-shot timer service driving connection events.
pub trait Scheduler {
    /// Starts (or restarts) the timer `id`.
    ///
    /// The first expiry is at `anchor + first_offset`. If `period` is non-zero, the timer then
    /// expires every `period`. `slot` is the radio time reserved at every expiry. If
    /// `lazy_permitted` is set, the scheduler may skip expiries when the radio is contended and
    /// report the number of skipped ones as `lazy` to the prepare hook.
    fn start(
        &mut self,
        id: TickerId,
        anchor: Instant,
        first_offset: Duration,
        period: Duration,
        slot: Duration,
        lazy_permitted: bool,
    ) -> TickerStatus;

    /// Moves the next expiry of `id` by `drift_plus - drift_minus`, asks for `lazy` expiries to be
    /// skipped, and, if `force` is set, forbids the scheduler from skipping the next one.
    fn update(
        &mut self,
        id: TickerId,
        drift_plus: Duration,
        drift_minus: Duration,
        lazy: u16,
        force: bool,
    ) -> TickerStatus;

    /// Stops the timer `id`.
    fn stop(&mut self, id: TickerId) -> TickerStatus;

    /// Calls `f` with every reservation except the one belonging to `exclude`.
    fn reservations(&self, exclude: TickerId, f: &mut dyn FnMut(Reservation));
}

/// Execution contexts of the controller, in decreasing priority.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Context {
    /// The radio interrupt and the scheduler callbacks.
    Worker,
    /// Deferred work and host requests.
    Job,
}

/// Work the controller hands to the [`Executor`].
///
/// The glue must pass every job it runs to `Controller::run_job`.
///
/// [`Executor`]: trait.Executor.html
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Job {
    /// New PDUs or events are waiting in the rx pipe; the host should call `Controller::rx_get`.
    RxReady,

    /// Collect the scheduler's reservations and compute free transmit window offsets for a
    /// pending connection parameter procedure.
    WindowOffsets(ConnHandle),
}

/// Cross-context deferred procedure calls.
pub trait Executor {
    /// Queues `job` to run in context `to`. Called from context `from`.
    ///
    /// Returns the job back when the executor's queue is full. The controller then either does
    /// the work inline or retries at the next event.
    fn enqueue(&mut self, from: Context, to: Context, job: Job) -> Result<(), Job>;
}

//! Per-pool orchestrator thread.
//!
//! The reactor receives unit events and control-loop ticks and hands each
//! one to the pool, which applies it under its state lock. Together with
//! caller-side submissions this gives one serialized stream of mutations per
//! pool; a tick runs atomically with respect to every other event.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{never, select, tick, unbounded, Receiver, Sender};
use tracing::{debug, warn};

use crate::core::error::PoolError;
use crate::core::unit::UnitEvent;

/// Pool-side event handlers driven by the reactor.
pub(crate) trait Orchestrator: Send + Sync + 'static {
    fn on_unit_event(&self, event: UnitEvent);
    fn on_tick(&self, now: Instant) -> Result<(), PoolError>;
    /// Report an error that has no task to settle.
    fn report(&self, subsystem: &'static str, error: PoolError);
}

enum Control {
    StopTicker,
    Stop,
}

enum Step {
    Event(UnitEvent),
    Tick(Instant),
    Skip,
    StopTicker,
    Stop,
}

/// Handle on a running reactor thread.
#[derive(Debug)]
pub(crate) struct Reactor {
    control: Sender<Control>,
    thread: Option<JoinHandle<()>>,
}

impl Reactor {
    /// Start the reactor. `interval` enables the control loop.
    pub(crate) fn start<O: Orchestrator>(
        name: &str,
        orchestrator: Arc<O>,
        events: Receiver<UnitEvent>,
        interval: Option<Duration>,
    ) -> Result<Self, PoolError> {
        let (control, control_rx) = unbounded();
        let thread = thread::Builder::new()
            .name(format!("{name}-reactor"))
            .spawn(move || run(&*orchestrator, &events, &control_rx, interval))
            .map_err(|e| PoolError::Internal(format!("failed to spawn reactor: {e}")))?;
        Ok(Self {
            control,
            thread: Some(thread),
        })
    }

    /// Stop delivering control-loop ticks; unit events keep flowing.
    pub(crate) fn stop_ticker(&self) {
        let _ = self.control.send(Control::StopTicker);
    }

    /// Stop the reactor thread without waiting for it.
    pub(crate) fn stop(&mut self) {
        let _ = self.control.send(Control::Stop);
        self.thread.take();
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run<O: Orchestrator>(
    orchestrator: &O,
    events: &Receiver<UnitEvent>,
    control: &Receiver<Control>,
    interval: Option<Duration>,
) {
    let ticker = interval.map_or_else(never, tick);
    let mut ticking = interval.is_some();
    debug!(?interval, "Reactor started");

    loop {
        let step = select! {
            recv(events) -> event => event.map_or(Step::Stop, Step::Event),
            recv(ticker) -> at => at.map_or(Step::Skip, Step::Tick),
            recv(control) -> command => match command {
                Ok(Control::StopTicker) => Step::StopTicker,
                Ok(Control::Stop) | Err(_) => Step::Stop,
            },
        };
        match step {
            Step::Event(event) => orchestrator.on_unit_event(event),
            Step::Tick(at) if ticking => guarded_tick(orchestrator, at),
            Step::Tick(_) | Step::Skip => {}
            Step::StopTicker => ticking = false,
            Step::Stop => break,
        }
    }
    debug!("Reactor stopped");
}

/// Errors and panics inside a tick become `Error` events; the reactor keeps running.
fn guarded_tick<O: Orchestrator>(orchestrator: &O, at: Instant) {
    match panic::catch_unwind(AssertUnwindSafe(|| orchestrator.on_tick(at))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => orchestrator.report("control-loop", e),
        Err(_) => {
            warn!("Control loop tick panicked");
            orchestrator.report("control-loop", PoolError::Internal("control loop tick panicked".into()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        ticks: AtomicUsize,
        reports: Mutex<Vec<PoolError>>,
    }

    impl Orchestrator for Recorder {
        fn on_unit_event(&self, _event: UnitEvent) {}

        fn on_tick(&self, _now: Instant) -> Result<(), PoolError> {
            match self.ticks.fetch_add(1, Ordering::SeqCst) {
                0 => Err(PoolError::Internal("first tick fails".into())),
                1 => panic!("second tick panics"),
                _ => Ok(()),
            }
        }

        fn report(&self, _subsystem: &'static str, error: PoolError) {
            self.reports.lock().push(error);
        }
    }

    #[test]
    fn test_tick_failures_are_reported_not_fatal() {
        let recorder = Arc::new(Recorder::default());
        let (_tx, rx) = unbounded();
        let mut reactor =
            Reactor::start("test", Arc::clone(&recorder), rx, Some(Duration::from_millis(5))).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while recorder.ticks.load(Ordering::SeqCst) < 4 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        reactor.stop_ticker();
        reactor.stop();

        assert!(recorder.ticks.load(Ordering::SeqCst) >= 4);
        assert_eq!(recorder.reports.lock().len(), 2);
    }
}

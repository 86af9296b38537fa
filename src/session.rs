pub mod listener;
pub mod protocol;
pub mod timer;

use std::io;
use std::net::TcpStream;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::Level::{Debug, Error, Info, Warn};
use thiserror::Error;

use crate::accel::AccelAnalyzer;
use crate::config::Config;
use crate::gnss::{GnssAcquisition, GnssError, SpeedSample};
use crate::session::protocol::{ClientWriter, LineReader, ServerMessage};
use crate::session::timer::PhaseTimer;
use crate::{accel_log, session_log};

/// Sleep between iterations while nothing is running.
const IDLE_TICK: Duration = Duration::from_millis(10);

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Failed to set up client connection: {0}")]
    Connection(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    WaitingForClient,
    StartRequested,
    StartRequestedPollSignal,
    Working,
    WorkingWaitAccel,
    WorkingMeasure,
    WorkingAnalyze,
    AbortRequested,
    Done,
    Finished,
    Error,
    UnexpectedError,
}

impl SessionState {
    /// A run is in progress, from the start request up to result reporting.
    pub fn accepts_abort(self) -> bool {
        match self {
            SessionState::StartRequested
            | SessionState::StartRequestedPollSignal
            | SessionState::Working
            | SessionState::WorkingWaitAccel
            | SessionState::WorkingMeasure
            | SessionState::WorkingAnalyze => true,
            SessionState::Init
            | SessionState::WaitingForClient
            | SessionState::AbortRequested
            | SessionState::Done
            | SessionState::Finished
            | SessionState::Error
            | SessionState::UnexpectedError => false,
        }
    }

    /// A fix has been acquired and the run has not ended yet.
    pub fn accepts_status_request(self) -> bool {
        match self {
            SessionState::Working
            | SessionState::WorkingWaitAccel
            | SessionState::WorkingMeasure
            | SessionState::WorkingAnalyze => true,
            SessionState::Init
            | SessionState::WaitingForClient
            | SessionState::StartRequested
            | SessionState::StartRequestedPollSignal
            | SessionState::AbortRequested
            | SessionState::Done
            | SessionState::Finished
            | SessionState::Error
            | SessionState::UnexpectedError => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Error | SessionState::UnexpectedError)
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Which line an out-of-band status push produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusPush {
    Status,
    RunningError,
}

/// State shared between the orchestration thread and the listener thread
/// of one connection.
pub struct SessionContext {
    state: Mutex<SessionState>,
    run_listener: AtomicBool,
    teardown: Arc<AtomicBool>,
    gnss: Arc<GnssAcquisition>,
    writer: ClientWriter,
    reader: Mutex<LineReader>,
    config: Arc<Config>,
}

impl SessionContext {
    fn new(
        stream: TcpStream,
        config: Arc<Config>,
        gnss: Arc<GnssAcquisition>,
        teardown: Arc<AtomicBool>,
    ) -> Result<Self, SessionError> {
        stream.set_nonblocking(false)?;
        let reader = LineReader::new(stream.try_clone()?, config.client_read_timeout())?;

        Ok(Self {
            state: Mutex::new(SessionState::Init),
            run_listener: AtomicBool::new(false),
            teardown,
            gnss,
            writer: ClientWriter::new(stream),
            reader: Mutex::new(reader),
            config,
        })
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    pub fn set_state(&self, state: SessionState) {
        *lock(&self.state) = state;
    }

    /// Swap in `to` when the current state satisfies `condition`.
    pub fn replace_state_if(
        &self,
        condition: impl FnOnce(SessionState) -> bool,
        to: SessionState,
    ) -> bool {
        let mut state = lock(&self.state);
        if !condition(*state) {
            return false;
        }
        *state = to;
        true
    }

    /// Moves `from` to `to`; anything the listener wrote in between wins.
    fn advance(&self, from: SessionState, to: SessionState) -> bool {
        let advanced = self.replace_state_if(|current| current == from, to);
        if advanced {
            session_log!(Debug, "{:?} -> {:?}", from, to);
        }
        advanced
    }

    pub fn teardown_requested(&self) -> bool {
        self.teardown.load(Ordering::Acquire)
    }

    fn listener_should_run(&self) -> bool {
        self.run_listener.load(Ordering::Acquire) && !self.teardown_requested()
    }

    fn stop_listener(&self) {
        self.run_listener.store(false, Ordering::Release);
    }

    fn lock_reader(&self) -> MutexGuard<'_, LineReader> {
        lock(&self.reader)
    }

    /// A failed send leaves the session in `UnexpectedError`.
    pub fn send(&self, message: &ServerMessage<'_>) -> bool {
        match self.writer.send(message) {
            Ok(()) => true,
            Err(e) => {
                session_log!(Error, "Failed to send \"{}\" to client: {}", message, e);
                self.set_state(SessionState::UnexpectedError);
                self.stop_listener();
                false
            }
        }
    }

    /// Let the reader pick up a fresh GSV report, then send the status line.
    pub fn push_status(&self, kind: StatusPush) -> bool {
        self.gnss.set_want_status(true);
        thread::sleep(self.config.status_refresh());
        self.gnss.set_want_status(false);

        let status = self.gnss.get_status();
        let message = match kind {
            StatusPush::Status => ServerMessage::Status { status: &status },
            StatusPush::RunningError => ServerMessage::RunningError { status: &status },
        };
        self.send(&message)
    }
}

enum Poll {
    /// Register unchanged since the last poll
    Stale,
    /// New reading; `None` when it carried no usable timestamp or speed
    Fresh(Option<SpeedSample>),
    Failed(GnssError),
}

/// One client connection driven through repeated measurement runs.
///
/// The orchestration loop runs on the calling thread; the listener thread
/// only writes requested transitions into the shared state cell.
pub struct Session {
    ctx: Arc<SessionContext>,
    analyzer: AccelAnalyzer,
    timer: PhaseTimer,
    listener: Option<JoinHandle<()>>,
    last_sequence: u64,
}

impl Session {
    pub fn new(
        stream: TcpStream,
        config: Arc<Config>,
        gnss: Arc<GnssAcquisition>,
        teardown: Arc<AtomicBool>,
    ) -> Result<Self, SessionError> {
        let analyzer = AccelAnalyzer::new(config.analyzer.clone());
        let ctx = SessionContext::new(stream, config, gnss, teardown)?;

        Ok(Self {
            ctx: Arc::new(ctx),
            analyzer,
            timer: PhaseTimer::default(),
            listener: None,
            last_sequence: 0,
        })
    }

    pub fn context(&self) -> Arc<SessionContext> {
        Arc::clone(&self.ctx)
    }

    /// Runs until a terminal state or teardown; returns the final state.
    /// Acquisition and the listener are stopped on every exit path.
    pub fn run(mut self) -> SessionState {
        session_log!(Info, "Session started");
        let final_state = loop {
            if self.ctx.teardown_requested() {
                session_log!(Info, "Teardown requested");
                break self.ctx.state();
            }
            if let ControlFlow::Break(state) = self.step() {
                break state;
            }
        };

        self.shutdown();
        session_log!(Info, "Session ended in state {:?}", final_state);
        final_state
    }

    fn step(&mut self) -> ControlFlow<SessionState> {
        let state = self.ctx.state();
        match state {
            SessionState::Init => self.init(),
            SessionState::WaitingForClient => thread::sleep(IDLE_TICK),
            SessionState::StartRequested => self.start_requested(),
            SessionState::StartRequestedPollSignal => self.poll_signal(),
            SessionState::Working => self.working(),
            SessionState::WorkingWaitAccel => self.wait_accel(),
            SessionState::WorkingMeasure => self.measure(),
            SessionState::WorkingAnalyze => self.analyze(),
            SessionState::AbortRequested => self.abort(),
            SessionState::Done => self.done(),
            SessionState::Finished => {
                self.ctx.advance(SessionState::Finished, SessionState::Init);
            }
            SessionState::Error | SessionState::UnexpectedError => return ControlFlow::Break(state),
        }
        ControlFlow::Continue(())
    }

    fn init(&mut self) {
        if self.ctx.advance(SessionState::Init, SessionState::WaitingForClient) {
            self.spawn_listener();
        }
    }

    fn spawn_listener(&mut self) {
        if self.listener.is_some() {
            return;
        }

        self.ctx.run_listener.store(true, Ordering::Release);
        match listener::spawn(Arc::clone(&self.ctx)) {
            Ok(handle) => self.listener = Some(handle),
            Err(e) => {
                session_log!(Error, "Failed to spawn listener thread: {}", e);
                self.ctx.stop_listener();
                self.ctx.set_state(SessionState::Error);
            }
        }
    }

    fn start_requested(&mut self) {
        // A start request may race the previous run's teardown of the listener
        self.spawn_listener();
        if let Err(e) = self.ctx.gnss.start() {
            session_log!(Error, "Failed to start GNSS acquisition: {}", e);
        }
        self.timer.restart();
        self.ctx.advance(SessionState::StartRequested, SessionState::StartRequestedPollSignal);
    }

    fn poll_signal(&mut self) {
        let gnss = &self.ctx.gnss;
        if gnss.poll_status() {
            gnss.set_want_status(false);
            self.timer.stop();
            let status = gnss.get_status();
            session_log!(Info, "Fix acquired: {}", status);
            if self
                .ctx
                .advance(SessionState::StartRequestedPollSignal, SessionState::Working)
            {
                self.ctx.send(&ServerMessage::FixAcquired { status: &status });
            }
            return;
        }

        let failure = gnss.failure();
        if failure.is_none() && !self.timer.is_elapsed(self.ctx.config.fix_timeout()) {
            thread::sleep(self.ctx.config.fix_poll_interval());
            return;
        }

        match failure {
            Some(e) => session_log!(Error, "GNSS acquisition failed: {}", e),
            None => session_log!(Warn, "No fix within {} s", self.ctx.config.fix_timeout_secs),
        }
        self.timer.stop();
        gnss.set_want_status(false);
        gnss.stop();
        let message = ServerMessage::NoSignal {
            timeout_secs: self.ctx.config.fix_timeout_secs,
        };
        if self.ctx.send(&message) {
            self.ctx.advance(SessionState::StartRequestedPollSignal, SessionState::Done);
        }
    }

    fn working(&mut self) {
        self.timer.restart();
        self.analyzer.start();
        self.ctx.advance(SessionState::Working, SessionState::WorkingWaitAccel);
    }

    fn poll_reading(&mut self) -> Poll {
        let reading = self.ctx.gnss.latest_reading();
        if reading.sequence != self.last_sequence {
            self.last_sequence = reading.sequence;
            return Poll::Fresh(reading.sample());
        }
        match self.ctx.gnss.failure() {
            Some(e) => Poll::Failed(e),
            None => Poll::Stale,
        }
    }

    fn wait_accel(&mut self) {
        match self.poll_reading() {
            Poll::Fresh(Some(sample)) => {
                let threshold = self.analyzer.config().start_speed_threshold;
                if self.analyzer.add_data(sample) && sample.speed_kmh >= threshold {
                    session_log!(
                        Info,
                        "Acceleration started at {:.2} km/h (t={:.2})",
                        sample.speed_kmh,
                        sample.timestamp
                    );
                    self.timer.restart();
                    self.ctx.advance(SessionState::WorkingWaitAccel, SessionState::WorkingMeasure);
                    return;
                }
                self.analyzer.trim_idle();
            }
            Poll::Fresh(None) => {
                self.analyzer.handle_incorrect_data();
                if self.analyzer.incorrect_limit_reached() {
                    session_log!(
                        Error,
                        "Too many invalid samples ({}) while waiting for acceleration",
                        self.analyzer.incorrect_data_count()
                    );
                    self.abandon_run(SessionState::WorkingWaitAccel);
                    return;
                }
            }
            Poll::Failed(e) => {
                session_log!(Error, "GNSS acquisition failed: {}", e);
                self.abandon_run(SessionState::WorkingWaitAccel);
                return;
            }
            Poll::Stale => {}
        }

        if self.timer.is_elapsed(self.ctx.config.accel_timeout()) {
            session_log!(Warn, "No acceleration within {} s", self.ctx.config.accel_timeout_secs);
            self.stop_measurement();
            let message = ServerMessage::CheckpointTimeout {
                index: 0,
                timeout_secs: self.ctx.config.accel_timeout_secs,
            };
            if self.ctx.send(&message) {
                self.ctx.advance(SessionState::WorkingWaitAccel, SessionState::Done);
            }
            return;
        }

        thread::sleep(self.ctx.config.wait_accel_tick());
    }

    fn measure(&mut self) {
        match self.poll_reading() {
            Poll::Fresh(Some(sample)) => {
                if self.analyzer.add_data(sample) {
                    // Same crossing rule as the analysis: strictly above
                    while let Some(checkpoint) = self.analyzer.current_checkpoint() {
                        if sample.speed_kmh <= checkpoint {
                            break;
                        }
                        session_log!(Info, "Passed {} km/h", checkpoint);
                        self.analyzer.set_checkpoint(checkpoint);
                        self.timer.restart();
                    }
                    if self.analyzer.current_checkpoint().is_none() {
                        session_log!(Info, "All checkpoints reached");
                        self.finish_measurement();
                        return;
                    }
                }
            }
            Poll::Fresh(None) => {
                self.analyzer.handle_incorrect_data();
                if self.analyzer.incorrect_limit_reached() {
                    session_log!(
                        Error,
                        "Too many invalid samples ({}) during measurement",
                        self.analyzer.incorrect_data_count()
                    );
                    self.measurement_failed();
                    return;
                }
            }
            Poll::Failed(e) => {
                session_log!(Error, "GNSS acquisition failed: {}", e);
                self.measurement_failed();
                return;
            }
            Poll::Stale => {}
        }

        if self.timer.is_elapsed(self.ctx.config.accel_timeout()) {
            session_log!(
                Warn,
                "No checkpoint passed within {} s",
                self.ctx.config.accel_timeout_secs
            );
            self.finish_measurement();
            return;
        }

        thread::sleep(self.ctx.config.measure_tick());
    }

    /// Stop sampling and report whatever was measured.
    fn finish_measurement(&mut self) {
        self.timer.stop();
        self.ctx.gnss.stop();
        self.ctx.advance(SessionState::WorkingMeasure, SessionState::WorkingAnalyze);
    }

    fn measurement_failed(&mut self) {
        if self.analyzer.reached_count() > 0 {
            self.finish_measurement();
        } else {
            self.abandon_run(SessionState::WorkingMeasure);
        }
    }

    /// Report a running error and end the run without results.
    fn abandon_run(&mut self, from: SessionState) {
        // Status is refreshed while the reader is still attached
        let sent = self.ctx.push_status(StatusPush::RunningError);
        self.stop_measurement();
        if sent {
            self.ctx.advance(from, SessionState::Done);
        }
    }

    fn analyze(&mut self) {
        accel_log!(Debug, "Analyzing {} samples", self.analyzer.sample_count());
        for (i, sample) in self.analyzer.samples().iter().enumerate() {
            accel_log!(Debug, "#{:03} t={:.2} v={:.2}", i, sample.timestamp, sample.speed_kmh);
        }

        let checkpoint_count = self.analyzer.checkpoints().len();
        let times = self.analyzer.analyze_data().unwrap_or_else(|e| {
            accel_log!(Warn, "Analysis failed: {}", e);
            vec![None; checkpoint_count]
        });
        self.stop_measurement();

        let timeout_secs = self.ctx.config.accel_timeout_secs;
        for (index, time) in times.into_iter().enumerate() {
            let message = match time {
                Some(elapsed_secs) => ServerMessage::CheckpointReached { index, elapsed_secs },
                None => ServerMessage::CheckpointTimeout { index, timeout_secs },
            };
            if !self.ctx.send(&message) {
                return;
            }
        }

        if self.ctx.send(&ServerMessage::RunningDone) {
            self.ctx.advance(SessionState::WorkingAnalyze, SessionState::Done);
        }
    }

    fn abort(&mut self) {
        session_log!(Info, "Aborting run");
        self.ctx.stop_listener();
        self.stop_measurement();
        if self.ctx.send(&ServerMessage::Aborted) {
            self.ctx.advance(SessionState::AbortRequested, SessionState::Done);
        }
    }

    fn done(&mut self) {
        self.join_listener();
        self.ctx.advance(SessionState::Done, SessionState::Finished);
    }

    fn stop_measurement(&mut self) {
        self.timer.stop();
        self.analyzer.stop();
        self.ctx.gnss.set_want_status(false);
        self.ctx.gnss.stop();
    }

    fn join_listener(&mut self) {
        self.ctx.stop_listener();
        if let Some(handle) = self.listener.take() {
            if handle.join().is_err() {
                session_log!(Error, "Listener thread panicked");
            }
        }
    }

    fn shutdown(&mut self) {
        self.stop_measurement();
        // Closing the socket first unblocks a listener waiting on a read
        self.ctx.writer.shutdown();
        self.join_listener();
    }
}

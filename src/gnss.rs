pub mod nmea;
pub mod simulated;
pub mod source;

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use log::Level::{Debug, Error, Info};
use thiserror::Error;

use crate::gnss::nmea::{KNOTS_TO_KMH, NmeaError, Sentence, Talker};
use crate::gnss::source::SourceFactory;
use crate::gnss_log;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GnssError {
    #[error("Failed to open sentence source {path}: {reason}")]
    Open { path: String, reason: String },

    #[error("Failed to read from sentence source: {0}")]
    Read(String),

    #[error("Sentence source reached end of stream")]
    EndOfStream,

    #[error("Failed to decode sentence: {0}")]
    Decode(#[from] NmeaError),

    #[error("GNSS module start script {script} failed: {reason}")]
    ModuleStart { script: String, reason: String },

    #[error("Failed to spawn reader thread: {0}")]
    Spawn(String),
}

/// Receiver health as last reported by RMC and GSV sentences.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GnssStatus {
    /// Signal validity is decided on this flag alone
    pub fix_valid: bool,
    pub sats_valid: bool,
    pub ant_valid: bool,
    pub sats_count: String,
    pub signal_strength: String,
}

impl Default for GnssStatus {
    fn default() -> Self {
        Self {
            fix_valid: false,
            sats_valid: false,
            ant_valid: false,
            sats_count: "NA".to_string(),
            signal_strength: "NA".to_string(),
        }
    }
}

impl GnssStatus {
    pub fn render(&self) -> String {
        format!(
            "Fix status: {}, Satellites in view: {}, Signal strength: {}",
            if self.fix_valid { "OK" } else { "NA" },
            if self.sats_valid { self.sats_count.as_str() } else { "NA" },
            if self.ant_valid { self.signal_strength.as_str() } else { "NA" },
        )
    }
}

/// One validated speed measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeedSample {
    /// Seconds since UTC midnight
    pub timestamp: f64,
    pub speed_kmh: f64,
}

/// Latest RMC-derived values. `sequence` increments once per decoded RMC so
/// pollers can tell a new reading from one they have already seen.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GnssReading {
    pub sequence: u64,
    pub timestamp: Option<f64>,
    pub speed_kmh: Option<f64>,
}

impl GnssReading {
    pub fn sample(&self) -> Option<SpeedSample> {
        Some(SpeedSample {
            timestamp: self.timestamp?,
            speed_kmh: self.speed_kmh?,
        })
    }
}

struct StatusRegister {
    status: GnssStatus,
    rendered: String,
}

impl StatusRegister {
    fn new() -> Self {
        let status = GnssStatus::default();
        let rendered = status.render();
        Self { status, rendered }
    }

    fn refresh(&mut self) {
        self.rendered = self.status.render();
    }
}

#[derive(Default)]
struct SpeedRegister {
    sequence: u64,
    timestamp: Option<f64>,
    speed_knots: Option<f64>,
}

struct GnssShared {
    run: AtomicBool,
    want_status: AtomicBool,
    status: Mutex<StatusRegister>,
    speed: Mutex<SpeedRegister>,
    failure: Mutex<Option<GnssError>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl GnssShared {
    fn new() -> Self {
        Self {
            run: AtomicBool::new(false),
            want_status: AtomicBool::new(false),
            status: Mutex::new(StatusRegister::new()),
            speed: Mutex::new(SpeedRegister::default()),
            failure: Mutex::new(None),
        }
    }

    fn reset(&self) {
        *lock(&self.status) = StatusRegister::new();
        let mut speed = lock(&self.speed);
        speed.timestamp = None;
        speed.speed_knots = None;
        drop(speed);
        *lock(&self.failure) = None;
    }

    fn fail(&self, error: GnssError) {
        gnss_log!(Error, "GNSS acquisition stopped: {}", error);
        self.run.store(false, Ordering::Release);
        *lock(&self.failure) = Some(error);
    }

    /// Apply one framed sentence to the registers. Only one register lock is
    /// held at a time.
    fn decode(&self, raw: &str) -> Result<(), NmeaError> {
        let sentence = Sentence::parse(raw)?;
        match sentence.talker() {
            Talker::Rmc => {
                let Some(rmc) = sentence.rmc() else {
                    return Ok(());
                };
                {
                    let mut speed = lock(&self.speed);
                    speed.sequence += 1;
                    speed.timestamp = rmc.utc_seconds;
                    speed.speed_knots = rmc.speed.knots();
                }
                if rmc.speed.knots().is_none() {
                    gnss_log!(Debug, "Speed invalid: {:?}", rmc.speed);
                }

                let mut status = lock(&self.status);
                if status.status.fix_valid != rmc.fix_valid {
                    status.status.fix_valid = rmc.fix_valid;
                    status.refresh();
                }
            }
            Talker::Gsv => {
                // Satellite details are only copied while someone asked for them
                if !self.want_status.load(Ordering::Acquire) {
                    return Ok(());
                }
                let Some(gsv) = sentence.gsv() else {
                    return Ok(());
                };

                let mut status = lock(&self.status);
                status.status.sats_valid = gsv.satellites_in_view.is_some();
                if let Some(sats) = gsv.satellites_in_view {
                    status.status.sats_count = sats;
                }
                status.status.ant_valid = gsv.signal_strength.is_some();
                if let Some(strength) = gsv.signal_strength {
                    status.status.signal_strength = strength;
                }
                status.refresh();
            }
            Talker::Txt => {
                if let Some(text) = sentence.txt() {
                    gnss_log!(Info, "Received text message from GNSS: {}", text);
                }
            }
        }
        Ok(())
    }
}

/// Background acquisition of GNSS data for one measurement window.
///
/// `start` spawns a reader thread that pulls sentences from a fresh source
/// and decodes them into shared registers; `stop` joins it. All accessors
/// are independent locked reads and may be called from any thread.
pub struct GnssAcquisition {
    shared: Arc<GnssShared>,
    factory: SourceFactory,
    module_start_script: Option<PathBuf>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl GnssAcquisition {
    pub fn new(factory: SourceFactory, module_start_script: Option<PathBuf>) -> Self {
        Self {
            shared: Arc::new(GnssShared::new()),
            factory,
            module_start_script,
            reader: Mutex::new(None),
        }
    }

    /// No-op while a reader thread is already attached. `start` and `stop`
    /// are driven from one thread; the handle lock is never held while the
    /// register locks are taken.
    pub fn start(&self) -> Result<(), GnssError> {
        if self.is_running() {
            return Ok(());
        }

        gnss_log!(Debug, "Starting GNSS acquisition");
        self.shared.reset();
        self.shared.want_status.store(true, Ordering::Release);
        self.shared.run.store(true, Ordering::Release);

        let shared = Arc::clone(&self.shared);
        let factory = Arc::clone(&self.factory);
        let script = self.module_start_script.clone();
        let handle = thread::Builder::new()
            .name("gnss-reader".to_string())
            .spawn(move || read_sentences(shared, factory, script))
            .map_err(|e| {
                let error = GnssError::Spawn(e.to_string());
                self.shared.fail(error.clone());
                error
            })?;

        *lock(&self.reader) = Some(handle);
        Ok(())
    }

    /// No-op while stopped.
    pub fn stop(&self) {
        let Some(handle) = lock(&self.reader).take() else {
            return;
        };

        self.shared.run.store(false, Ordering::Release);
        self.shared.want_status.store(false, Ordering::Release);
        if handle.join().is_err() {
            gnss_log!(Error, "GNSS reader thread panicked");
        }
        gnss_log!(Debug, "GNSS acquisition stopped");
    }

    pub fn is_running(&self) -> bool {
        lock(&self.reader).is_some()
    }

    /// Error that ended the current window, if any.
    pub fn failure(&self) -> Option<GnssError> {
        lock(&self.shared.failure).clone()
    }

    pub fn set_want_status(&self, want: bool) {
        self.shared.want_status.store(want, Ordering::Release);
    }

    pub fn poll_status(&self) -> bool {
        lock(&self.shared.status).status.fix_valid
    }

    pub fn get_status(&self) -> String {
        lock(&self.shared.status).rendered.clone()
    }

    /// Speed over ground in km/h.
    pub fn get_speed(&self) -> Option<f64> {
        lock(&self.shared.speed).speed_knots.map(|knots| knots * KNOTS_TO_KMH)
    }

    pub fn get_timestamp(&self) -> Option<f64> {
        lock(&self.shared.speed).timestamp
    }

    /// Timestamp and speed taken under a single lock.
    pub fn latest_reading(&self) -> GnssReading {
        let speed = lock(&self.shared.speed);
        GnssReading {
            sequence: speed.sequence,
            timestamp: speed.timestamp,
            speed_kmh: speed.speed_knots.map(|knots| knots * KNOTS_TO_KMH),
        }
    }
}

impl Drop for GnssAcquisition {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_module_start_script(script: &Path) -> Result<(), GnssError> {
    gnss_log!(Debug, "Setting up GNSS module with {}", script.display());
    let failure = |reason: String| GnssError::ModuleStart {
        script: script.display().to_string(),
        reason,
    };

    let status = Command::new(script).status().map_err(|e| failure(e.to_string()))?;
    if !status.success() {
        return Err(failure(status.to_string()));
    }
    Ok(())
}

fn read_sentences(shared: Arc<GnssShared>, factory: SourceFactory, script: Option<PathBuf>) {
    if let Some(script) = script.as_ref() {
        if let Err(e) = run_module_start_script(script) {
            shared.fail(e);
            return;
        }
    }

    let mut source = match factory() {
        Ok(source) => source,
        Err(e) => {
            shared.fail(e);
            return;
        }
    };

    gnss_log!(Info, "GNSS reader attached");
    while shared.run.load(Ordering::Acquire) {
        match source.next_sentence() {
            Ok(Some(sentence)) => {
                if let Err(e) = shared.decode(&sentence) {
                    shared.fail(e.into());
                }
            }
            Ok(None) => {}
            Err(e) => shared.fail(e),
        }
    }
    gnss_log!(Info, "Closing GNSS reader");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gnss::source::SentenceSource;
    use std::collections::VecDeque;
    use std::time::{Duration, Instant};

    /// Replays a fixed list of sentences, then idles.
    struct ScriptedSource {
        lines: VecDeque<String>,
        pace: Duration,
        end_of_stream: bool,
    }

    impl SentenceSource for ScriptedSource {
        fn next_sentence(&mut self) -> Result<Option<String>, GnssError> {
            thread::sleep(self.pace);
            match self.lines.pop_front() {
                Some(line) => Ok(Some(line)),
                None if self.end_of_stream => Err(GnssError::EndOfStream),
                None => Ok(None),
            }
        }
    }

    fn scripted(lines: &[&str], pace: Duration, end_of_stream: bool) -> SourceFactory {
        let lines: Vec<String> = lines.iter().map(|l| l.to_string()).collect();
        Arc::new(move || {
            Ok(Box::new(ScriptedSource {
                lines: lines.iter().cloned().collect(),
                pace,
                end_of_stream,
            }) as Box<dyn SentenceSource>)
        })
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn status_renders_defaults() {
        assert_eq!(
            GnssStatus::default().render(),
            "Fix status: NA, Satellites in view: NA, Signal strength: NA"
        );
    }

    #[test]
    fn reader_updates_registers() {
        let factory = scripted(
            &[
                "$GPGSV,3,1,11,03,03,111,42*74",
                "$GPTXT,01,01,02,ANTSTATUS=OK*3B",
                "$GPRMC,120000.00,A,4717.11437,N,00833.91522,E,10.0,77.52,091202,,,A*57",
            ],
            Duration::from_millis(1),
            false,
        );
        let gnss = GnssAcquisition::new(factory, None);
        gnss.start().unwrap();

        assert!(wait_until(|| gnss.latest_reading().sequence == 1));
        assert!(gnss.poll_status());
        assert_eq!(
            gnss.get_status(),
            "Fix status: OK, Satellites in view: 11, Signal strength: 42"
        );
        assert_eq!(gnss.get_timestamp(), Some(43200.0));
        approx::assert_relative_eq!(gnss.get_speed().unwrap(), 18.52);
        assert_eq!(gnss.failure(), None);

        gnss.stop();
        assert!(!gnss.is_running());
    }

    #[test]
    fn gsv_is_ignored_unless_status_wanted() {
        let factory = scripted(
            &["$GPRMC,120000.00,V,,,,,,", "$GPGSV,3,1,11,03,03,111,42", "$GPRMC,120001.00,V,,,,,,"],
            Duration::from_millis(5),
            false,
        );
        let gnss = GnssAcquisition::new(factory, None);
        gnss.start().unwrap();
        gnss.set_want_status(false);

        assert!(wait_until(|| gnss.latest_reading().sequence == 2));
        assert_eq!(gnss.get_status(), GnssStatus::default().render());
        assert_eq!(gnss.get_speed(), None);
        gnss.stop();
    }

    #[test]
    fn unsupported_talker_stops_the_window() {
        let factory = scripted(
            &["$GPGGA,1,2,3", "$GPRMC,120000.00,A,,,,,5.0"],
            Duration::from_millis(1),
            false,
        );
        let gnss = GnssAcquisition::new(factory, None);
        gnss.start().unwrap();

        assert!(wait_until(|| gnss.failure().is_some()));
        assert!(matches!(gnss.failure(), Some(GnssError::Decode(NmeaError::UnsupportedTalker(_)))));
        assert_eq!(gnss.latest_reading().sequence, 0);
        gnss.stop();
    }

    #[test]
    fn end_of_stream_is_reported() {
        let gnss = GnssAcquisition::new(scripted(&[], Duration::from_millis(1), true), None);
        gnss.start().unwrap();
        assert!(wait_until(|| gnss.failure() == Some(GnssError::EndOfStream)));
        gnss.stop();
    }

    #[test]
    fn start_and_stop_are_idempotent() {
        let gnss = GnssAcquisition::new(scripted(&[], Duration::from_millis(1), false), None);
        gnss.stop();
        gnss.start().unwrap();
        gnss.start().unwrap();
        assert!(gnss.is_running());
        gnss.stop();
        gnss.stop();
        assert!(!gnss.is_running());
    }

    #[test]
    fn accessors_stay_available_across_restarts() {
        let factory = scripted(&["$GPRMC,120000.00,A,,,,,5.0"], Duration::from_millis(1), false);
        let gnss = Arc::new(GnssAcquisition::new(factory, None));
        let done = Arc::new(AtomicBool::new(false));

        let poller = {
            let gnss = Arc::clone(&gnss);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut polls = 0u64;
                while !done.load(Ordering::Acquire) {
                    gnss.is_running();
                    gnss.get_status();
                    gnss.latest_reading();
                    polls += 1;
                }
                polls
            })
        };

        for _ in 0..20 {
            gnss.start().unwrap();
            gnss.stop();
        }
        done.store(true, Ordering::Release);
        assert!(poller.join().unwrap() > 0);
        assert!(!gnss.is_running());
    }

    #[test]
    fn restart_resets_registers() {
        let factory = scripted(&["$GPRMC,120000.00,A,,,,,5.0"], Duration::from_millis(50), false);
        let gnss = GnssAcquisition::new(factory, None);
        gnss.start().unwrap();
        assert!(wait_until(|| gnss.poll_status()));
        gnss.stop();
        assert!(gnss.get_status().starts_with("Fix status: OK"));

        gnss.start().unwrap();
        assert!(!gnss.poll_status());
        assert_eq!(gnss.get_timestamp(), None);
        assert_eq!(gnss.get_speed(), None);
        gnss.stop();
    }
}

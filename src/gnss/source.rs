use std::collections::VecDeque;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::Level::{Debug, Info, Warn};

use crate::config::{GnssConfig, SourceKind};
use crate::gnss::GnssError;
use crate::gnss::nmea::{NMEA_ADDR_LEN, Talker};
use crate::gnss::simulated::SimulatedSource;
use crate::gnss_log;

/// Longest sentence accepted by the framer, terminators included.
pub const NMEA_MAX_LENGTH: usize = 128;
/// Framed sentences kept while the consumer is busy; the oldest is dropped
/// once this is exceeded.
pub const SENTENCE_QUEUE_DEPTH: usize = 16;

const SERIAL_READ_TIMEOUT_MS: u64 = 1000;

/// Producer of complete NMEA sentences.
///
/// `Ok(None)` means nothing arrived within the source's own wait period; the
/// caller may check its stop flag and call again.
pub trait SentenceSource: Send {
    fn next_sentence(&mut self) -> Result<Option<String>, GnssError>;
}

/// Opens a fresh source for every acquisition window.
pub type SourceFactory = Arc<dyn Fn() -> Result<Box<dyn SentenceSource>, GnssError> + Send + Sync>;

pub fn factory_from_config(config: &GnssConfig) -> SourceFactory {
    match config.source {
        SourceKind::Device => {
            let path = config.device_path.clone();
            Arc::new(move || Ok(Box::new(DeviceSource::open(&path)?) as Box<dyn SentenceSource>))
        }
        SourceKind::Serial => {
            let path = config.serial_path.clone();
            let baud_rate = config.baud_rate;
            Arc::new(move || {
                Ok(Box::new(SerialSource::open(&path, baud_rate)?) as Box<dyn SentenceSource>)
            })
        }
        SourceKind::Simulated => {
            let interval = Duration::from_millis(config.simulated_interval_ms);
            Arc::new(move || {
                Ok(Box::new(SimulatedSource::new(interval)) as Box<dyn SentenceSource>)
            })
        }
    }
}

/// Character device exposed by the NMEA line discipline. Every `read()`
/// yields exactly one framed sentence and blocks until one is available.
///
/// There is no read timeout: with a silent receiver, stopping acquisition
/// (and with it NO_SIGNAL reporting and shutdown) waits for the next sentence.
/// Use the `serial` source where that matters.
pub struct DeviceSource {
    path: PathBuf,
    file: File,
    buffer: [u8; 256],
}

impl DeviceSource {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, GnssError> {
        let path = path.as_ref().to_path_buf();
        gnss_log!(Info, "Opening sentence device {}", path.display());
        let file = File::open(&path).map_err(|e| GnssError::Open {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            path,
            file,
            buffer: [0u8; 256],
        })
    }
}

impl SentenceSource for DeviceSource {
    fn next_sentence(&mut self) -> Result<Option<String>, GnssError> {
        match self.file.read(&mut self.buffer) {
            Ok(0) => {
                gnss_log!(Info, "{}: received nothing", self.path.display());
                Err(GnssError::EndOfStream)
            }
            Ok(n) => {
                let line = String::from_utf8_lossy(&self.buffer[..n]);
                Ok(Some(line.trim_end_matches(['\r', '\n', '\0']).to_string()))
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(None),
            Err(e) => Err(GnssError::Read(e.to_string())),
        }
    }
}

/// Splits a raw UART byte stream into sentences: a frame starts at `$`, ends
/// at CR or LF, and is discarded when it grows past [`NMEA_MAX_LENGTH`] or
/// carries a talker other than RMC/GSV/TXT.
#[derive(Debug, Default)]
pub struct SentenceFramer {
    frame: Vec<u8>,
    in_frame: bool,
    ready: VecDeque<String>,
    dropped: u64,
}

impl SentenceFramer {
    pub fn new() -> Self {
        Self {
            frame: Vec::with_capacity(NMEA_MAX_LENGTH),
            ..Default::default()
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.feed_byte(byte);
        }
    }

    fn feed_byte(&mut self, byte: u8) {
        if byte == b'$' {
            self.frame.clear();
            self.in_frame = true;
        }
        if !self.in_frame {
            return;
        }

        match byte {
            b'\r' | b'\n' => {
                self.finish_frame();
            }
            _ if self.frame.len() < NMEA_MAX_LENGTH - 1 => self.frame.push(byte),
            _ => {
                gnss_log!(Debug, "Incorrect NMEA, too long");
                self.frame.clear();
                self.in_frame = false;
            }
        }
    }

    fn finish_frame(&mut self) {
        self.in_frame = false;
        if self.frame.len() < NMEA_ADDR_LEN {
            self.frame.clear();
            return;
        }

        let frame = String::from_utf8_lossy(&self.frame).into_owned();
        self.frame.clear();
        if frame.get(..NMEA_ADDR_LEN).and_then(Talker::from_prefix).is_none() {
            return;
        }

        if self.ready.len() == SENTENCE_QUEUE_DEPTH {
            self.ready.pop_front();
            self.dropped += 1;
            gnss_log!(Warn, "Sentence queue full, dropping oldest");
        }
        self.ready.push_back(frame);
    }

    pub fn pop(&mut self) -> Option<String> {
        self.ready.pop_front()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Raw UART without the kernel line discipline; framing happens here.
pub struct SerialSource {
    port: Box<dyn tokio_serial::SerialPort>,
    framer: SentenceFramer,
    buffer: [u8; 256],
}

impl SerialSource {
    pub fn open(path: &str, baud_rate: u32) -> Result<Self, GnssError> {
        gnss_log!(Info, "Opening UART port {} at {} baud", path, baud_rate);
        let port = tokio_serial::new(path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .timeout(Duration::from_millis(SERIAL_READ_TIMEOUT_MS))
            .open()
            .map_err(|e| GnssError::Open {
                path: path.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            port,
            framer: SentenceFramer::new(),
            buffer: [0u8; 256],
        })
    }
}

impl SentenceSource for SerialSource {
    fn next_sentence(&mut self) -> Result<Option<String>, GnssError> {
        if let Some(sentence) = self.framer.pop() {
            return Ok(Some(sentence));
        }

        match self.port.read(&mut self.buffer) {
            Ok(0) => Ok(None),
            Ok(n) => {
                self.framer.feed(&self.buffer[..n]);
                Ok(self.framer.pop())
            }
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::TimedOut | ErrorKind::Interrupted | ErrorKind::WouldBlock
                ) =>
            {
                Ok(None)
            }
            Err(e) => Err(GnssError::Read(e.to_string())),
        }
    }
}

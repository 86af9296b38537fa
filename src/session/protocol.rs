use std::fmt;
use std::io::{self, BufRead, BufReader, ErrorKind, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Mutex;
use std::time::Duration;

use log::Level::{Debug, Warn};

use crate::client_log;
use crate::session::lock;

pub const CMD_STATE_INIT: &str = "STATE_INIT\n";
pub const CMD_REQUEST_ABORT: &str = "REQUEST_ABORT\n";
pub const CMD_REQUEST_STATUS: &str = "REQUEST_STATUS\n";

/// Longest line kept while waiting for its terminator.
const MAX_LINE_LENGTH: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    Start,
    RequestAbort,
    RequestStatus,
    /// No complete line arrived within the read timeout
    Timeout,
    Unrecognized(String),
}

impl ClientCommand {
    /// Commands match verbatim, terminator included.
    pub fn parse(line: &str) -> Self {
        match line {
            CMD_STATE_INIT => ClientCommand::Start,
            CMD_REQUEST_ABORT => ClientCommand::RequestAbort,
            CMD_REQUEST_STATUS => ClientCommand::RequestStatus,
            other => ClientCommand::Unrecognized(other.to_string()),
        }
    }
}

/// Lines sent to the client. `Display` renders them without the terminator.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage<'a> {
    FixAcquired { status: &'a str },
    NoSignal { timeout_secs: u64 },
    CheckpointReached { index: usize, elapsed_secs: f64 },
    CheckpointTimeout { index: usize, timeout_secs: u64 },
    RunningError { status: &'a str },
    RunningDone,
    Status { status: &'a str },
    Aborted,
}

impl fmt::Display for ServerMessage<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerMessage::FixAcquired { status } => {
                write!(f, "STATE_START_REQUESTED^WORKING^{}", status)
            }
            ServerMessage::NoSignal { timeout_secs } => {
                write!(f, "STATE_START_REQUESTED^NO_SIGNAL^{}", timeout_secs)
            }
            ServerMessage::CheckpointReached { index, elapsed_secs } => {
                write!(f, "STATE_WORKING^RUNNING_STATUS^{}#{:.2}", index, elapsed_secs)
            }
            ServerMessage::CheckpointTimeout { index, timeout_secs } => {
                write!(f, "STATE_WORKING^RUNNING_TIMEOUT^{}#{}", index, timeout_secs)
            }
            ServerMessage::RunningError { status } => {
                write!(f, "STATE_WORKING^RUNNING_ERROR^{}", status)
            }
            ServerMessage::RunningDone => write!(f, "STATE_WORKING^RUNNING_DONE^Finished"),
            ServerMessage::Status { status } => write!(f, "STATE_WORKING^{}", status),
            ServerMessage::Aborted => write!(f, "ABORTED"),
        }
    }
}

/// Write half of a client connection, shared by the orchestration and
/// listener threads.
pub struct ClientWriter {
    stream: Mutex<TcpStream>,
}

impl ClientWriter {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream: Mutex::new(stream),
        }
    }

    pub fn send(&self, message: &ServerMessage<'_>) -> io::Result<()> {
        let mut stream = lock(&self.stream);
        writeln!(stream, "{}", message)?;
        stream.flush()?;
        client_log!(Debug, "Data sent to client: {}", message);
        Ok(())
    }

    /// Unblocks any pending read on the other half as well.
    pub fn shutdown(&self) {
        if let Err(e) = lock(&self.stream).shutdown(Shutdown::Both) {
            client_log!(Debug, "Connection already closed: {}", e);
        }
    }
}

/// Read half of a client connection. Partial lines survive read timeouts.
pub struct LineReader {
    reader: BufReader<TcpStream>,
    pending: Vec<u8>,
}

impl LineReader {
    pub fn new(stream: TcpStream, read_timeout: Duration) -> io::Result<Self> {
        stream.set_read_timeout(Some(read_timeout))?;
        Ok(Self {
            reader: BufReader::new(stream),
            pending: Vec::new(),
        })
    }

    /// Blocks for at most the read timeout. A closed connection is an error.
    pub fn read_command(&mut self) -> io::Result<ClientCommand> {
        loop {
            match self.reader.read_until(b'\n', &mut self.pending) {
                Ok(0) => {
                    let reason = "client closed the connection";
                    return Err(io::Error::new(ErrorKind::UnexpectedEof, reason));
                }
                Ok(_) if self.pending.ends_with(b"\n") => {
                    let line = String::from_utf8_lossy(&self.pending).into_owned();
                    self.pending.clear();
                    return Ok(ClientCommand::parse(&line));
                }
                // Unterminated tail before EOF; the next read reports the EOF
                Ok(_) => continue,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    if self.pending.len() > MAX_LINE_LENGTH {
                        let discarded = self.pending.len();
                        client_log!(Warn, "Discarding {} bytes without line terminator", discarded);
                        self.pending.clear();
                    }
                    return Ok(ClientCommand::Timeout);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

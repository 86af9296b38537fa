//! NMEA 0183 sentence model for the three message types the receiver is
//! configured to emit: RMC (time, fix, speed), GSV (satellites, signal) and
//! TXT (receiver notices).

use thiserror::Error;

/// Length of the talker prefix (`$GPXXX`).
pub const NMEA_ADDR_LEN: usize = 6;
/// Expected length of the RMC UTC field (`hhmmss.ss`).
pub const RMC_TIME_LEN: usize = 9;
/// Knots to km/h.
pub const KNOTS_TO_KMH: f64 = 1.852;

const RMC_INDEX_TIME: usize = 1;
const RMC_INDEX_FIX_STAT: usize = 2;
const RMC_INDEX_SPEED_K: usize = 7;
const GSV_INDEX_SAT_COUNT: usize = 3;
const GSV_INDEX_ANT_STR: usize = 7;
const TXT_INDEX_TEXT: usize = 4;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NmeaError {
    #[error("Empty NMEA sentence")]
    Empty,

    #[error("Sentence does not start with '$': {0}")]
    MissingStart(String),

    #[error("Unsupported message received from GNSS: {0}")]
    UnsupportedTalker(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Talker {
    Rmc,
    Gsv,
    Txt,
}

impl Talker {
    pub fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "$GPRMC" => Some(Talker::Rmc),
            "$GPGSV" => Some(Talker::Gsv),
            "$GPTXT" => Some(Talker::Txt),
            _ => None,
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            Talker::Rmc => "$GPRMC",
            Talker::Gsv => "$GPGSV",
            Talker::Txt => "$GPTXT",
        }
    }
}

/// Speed-over-ground field of an RMC sentence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SpeedOverGround {
    Knots(f64),
    /// Parsed, but zero or negative.
    NotMoving,
    /// Field empty or absent.
    Missing,
    /// Field present but not a finite number.
    Malformed,
}

impl SpeedOverGround {
    pub fn parse(field: Option<&str>) -> Self {
        let Some(field) = field.filter(|f| !f.is_empty()) else {
            return SpeedOverGround::Missing;
        };
        match field.parse::<f64>() {
            Ok(knots) if !knots.is_finite() => SpeedOverGround::Malformed,
            Ok(knots) if knots <= 0.0 => SpeedOverGround::NotMoving,
            Ok(knots) => SpeedOverGround::Knots(knots),
            Err(_) => SpeedOverGround::Malformed,
        }
    }

    /// Usable speed in knots. A receiver reporting exactly zero is folded
    /// into "no usable speed", same as an empty or garbled field.
    pub fn knots(&self) -> Option<f64> {
        match self {
            SpeedOverGround::Knots(knots) => Some(*knots),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RmcData {
    /// UTC time of the fix as seconds since midnight.
    pub utc_seconds: Option<f64>,
    pub fix_valid: bool,
    pub speed: SpeedOverGround,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GsvData {
    pub satellites_in_view: Option<String>,
    pub signal_strength: Option<String>,
}

/// A framed sentence split into its comma-separated fields. Fields borrow
/// from the input line; semantic extraction happens per talker on demand.
#[derive(Debug, Clone, PartialEq)]
pub struct Sentence<'a> {
    talker: Talker,
    fields: Vec<&'a str>,
}

impl<'a> Sentence<'a> {
    /// Parse a framed sentence. Anything from `*` onwards (checksum) and any
    /// trailing line terminators are ignored.
    pub fn parse(raw: &'a str) -> Result<Self, NmeaError> {
        let body = strip_checksum(raw);
        if body.is_empty() {
            return Err(NmeaError::Empty);
        }
        if !body.starts_with('$') {
            return Err(NmeaError::MissingStart(body.to_string()));
        }

        let fields: Vec<&str> = body.split(',').collect();
        let talker = Talker::from_prefix(fields[0])
            .ok_or_else(|| NmeaError::UnsupportedTalker(body.to_string()))?;

        Ok(Self { talker, fields })
    }

    pub fn talker(&self) -> Talker {
        self.talker
    }

    fn field(&self, index: usize) -> Option<&'a str> {
        self.fields.get(index).copied()
    }

    fn non_empty_field(&self, index: usize) -> Option<&'a str> {
        self.field(index).filter(|f| !f.is_empty())
    }

    pub fn rmc(&self) -> Option<RmcData> {
        if self.talker != Talker::Rmc {
            return None;
        }

        let utc_seconds = self
            .field(RMC_INDEX_TIME)
            .filter(|f| f.len() == RMC_TIME_LEN)
            .and_then(parse_utc_to_seconds);
        // A = autonomous fix, D = differential fix
        let fix_valid = matches!(self.field(RMC_INDEX_FIX_STAT), Some("A") | Some("D"));
        let speed = SpeedOverGround::parse(self.field(RMC_INDEX_SPEED_K));

        Some(RmcData {
            utc_seconds,
            fix_valid,
            speed,
        })
    }

    pub fn gsv(&self) -> Option<GsvData> {
        if self.talker != Talker::Gsv {
            return None;
        }

        Some(GsvData {
            satellites_in_view: self.non_empty_field(GSV_INDEX_SAT_COUNT).map(str::to_string),
            signal_strength: self.non_empty_field(GSV_INDEX_ANT_STR).map(str::to_string),
        })
    }

    pub fn txt(&self) -> Option<&'a str> {
        if self.talker != Talker::Txt {
            return None;
        }
        self.non_empty_field(TXT_INDEX_TEXT)
    }
}

/// Cut a sentence at the checksum marker and drop line terminators.
pub fn strip_checksum(raw: &str) -> &str {
    let body = match raw.find('*') {
        Some(pos) => &raw[..pos],
        None => raw,
    };
    body.trim_end_matches(['\r', '\n', '\0'])
}

/// `hhmmss.ss` to seconds since midnight.
pub fn parse_utc_to_seconds(utc: &str) -> Option<f64> {
    let hh = utc.get(0..2)?;
    let mm = utc.get(2..4)?;
    let ss = utc.get(4..)?;
    if !hh.bytes().chain(mm.bytes()).all(|b| b.is_ascii_digit()) {
        return None;
    }

    let hh: u32 = hh.parse().ok()?;
    let mm: u32 = mm.parse().ok()?;
    let ss: f64 = ss.parse().ok()?;
    if !ss.is_finite() || ss < 0.0 {
        return None;
    }

    Some(hh as f64 * 3600.0 + mm as f64 * 60.0 + ss)
}

use std::collections::VecDeque;
use std::thread::sleep;
use std::time::Duration;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::gnss::GnssError;
use crate::gnss::nmea::{KNOTS_TO_KMH, Talker};
use crate::gnss::source::SentenceSource;

const NO_FIX_SAMPLES: u32 = 3;
const STANDSTILL_SAMPLES: u32 = 8;
const LAUNCH_ACCEL_KMH_PER_S: f64 = 11.0;
const BRAKING_KMH_PER_S: f64 = 8.0;
const TOP_SPEED_KMH: f64 = 115.0;
const START_OF_DAY_SECONDS: f64 = 12.0 * 3600.0;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    NoFix,
    Standstill,
    Launch,
    Braking,
}

/// Stand-in receiver emitting a repeating launch profile: a few samples
/// without fix, a standstill, a full-throttle run past 100 km/h and a stop.
pub struct SimulatedSource {
    interval: Duration,
    step_s: f64,
    rng: SmallRng,
    queue: VecDeque<String>,
    phase: Phase,
    phase_samples: u32,
    elapsed_s: f64,
    speed_kmh: f64,
}

impl SimulatedSource {
    pub fn new(interval: Duration) -> Self {
        Self::with_step(interval, interval)
    }

    /// Emit a sample every `interval` of wall time while simulating `step`
    /// of vehicle time per sample.
    pub fn with_step(interval: Duration, step: Duration) -> Self {
        let mut queue = VecDeque::new();
        queue.push_back(format!("{},01,01,02,ANTSTATUS=OK", Talker::Txt.prefix()));

        Self {
            interval,
            step_s: step.as_secs_f64(),
            rng: SmallRng::from_entropy(),
            queue,
            phase: Phase::NoFix,
            phase_samples: 0,
            elapsed_s: 0.0,
            speed_kmh: 0.0,
        }
    }

    fn advance(&mut self) {
        let dt = self.step_s;
        self.elapsed_s += dt;
        self.phase_samples += 1;

        match self.phase {
            Phase::NoFix if self.phase_samples >= NO_FIX_SAMPLES => self.enter(Phase::Standstill),
            Phase::Standstill if self.phase_samples >= STANDSTILL_SAMPLES => {
                self.enter(Phase::Launch)
            }
            Phase::Launch => {
                let jitter = self.rng.gen_range(-0.8..0.8);
                self.speed_kmh = (self.speed_kmh + LAUNCH_ACCEL_KMH_PER_S * dt + jitter).max(0.0);
                if self.speed_kmh >= TOP_SPEED_KMH {
                    self.enter(Phase::Braking);
                }
            }
            Phase::Braking => {
                self.speed_kmh -= BRAKING_KMH_PER_S * dt;
                if self.speed_kmh <= 0.0 {
                    self.speed_kmh = 0.0;
                    self.enter(Phase::Standstill);
                }
            }
            _ => {}
        }
    }

    fn enter(&mut self, phase: Phase) {
        self.phase = phase;
        self.phase_samples = 0;
    }

    fn utc_field(&self) -> String {
        let total = (START_OF_DAY_SECONDS + self.elapsed_s) % 86_400.0;
        let hours = (total / 3600.0) as u32;
        let minutes = ((total % 3600.0) / 60.0) as u32;
        let seconds = total % 60.0;
        format!("{:02}{:02}{:05.2}", hours, minutes, seconds)
    }

    fn emit_sample(&mut self) {
        let fix = if self.phase == Phase::NoFix { "V" } else { "A" };
        // Receivers report a little noise rather than a hard zero at rest
        let speed_field = match self.phase {
            Phase::NoFix => String::new(),
            _ => {
                let noise = self.rng.gen_range(0.01..0.15);
                format!("{:.3}", self.speed_kmh / KNOTS_TO_KMH + noise)
            }
        };

        self.queue.push_back(format!(
            "{},{},{},4717.11437,N,00833.91522,E,{},77.52,091202,,,A",
            Talker::Rmc.prefix(),
            self.utc_field(),
            fix,
            speed_field
        ));

        let satellites = if self.phase == Phase::NoFix { 3 } else { 9 };
        let strength = self.rng.gen_range(28..45);
        self.queue.push_back(format!(
            "{},3,1,{:02},03,03,111,{:02},04,15,270,00",
            Talker::Gsv.prefix(),
            satellites,
            strength
        ));
    }
}

impl SentenceSource for SimulatedSource {
    fn next_sentence(&mut self) -> Result<Option<String>, GnssError> {
        if let Some(sentence) = self.queue.pop_front() {
            return Ok(Some(sentence));
        }

        sleep(self.interval);
        self.advance();
        self.emit_sample();
        Ok(self.queue.pop_front())
    }
}

//! Acceleration run analysis: collects speed samples for one run, finds the
//! instant the vehicle launched and the time it took to reach each speed
//! checkpoint.

use log::Level::{Debug, Warn};
use serde::Deserialize;
use thiserror::Error;

use crate::accel_log;
use crate::gnss::SpeedSample;

/// Samples that must exceed the start threshold back to back before a
/// launch is accepted.
pub const DEFAULT_JITTER_COUNT: usize = 5;
/// Consecutive speed rises (walking backwards) that end start refinement.
const REFINE_STOP_COUNT: usize = 2;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AnalysisError {
    #[error("No samples recorded")]
    NoSamples,

    #[error("No sustained acceleration above {threshold} km/h in {samples} samples")]
    NoAccelerationStart { threshold: f64, samples: usize },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// km/h; acceleration is considered started above this speed
    pub start_speed_threshold: f64,
    /// Sample storage kept while waiting for the launch
    pub initial_capacity: usize,
    pub max_incorrect_samples: u32,
    pub jitter_count: usize,
    /// km/h, ascending
    pub checkpoints: Vec<f64>,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            start_speed_threshold: 3.0,
            initial_capacity: 10,
            max_incorrect_samples: 5,
            jitter_count: DEFAULT_JITTER_COUNT,
            checkpoints: vec![30.0, 60.0, 100.0],
        }
    }
}

/// Insertion-ordered samples of the current run. A sample repeating the
/// previous timestamp is a repeated fix and is refused.
#[derive(Debug, Clone, Default)]
pub struct SampleSeries {
    samples: Vec<SpeedSample>,
}

impl SampleSeries {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, sample: SpeedSample) -> bool {
        if self.last().is_some_and(|last| last.timestamp == sample.timestamp) {
            return false;
        }
        self.samples.push(sample);
        true
    }

    pub fn last(&self) -> Option<&SpeedSample> {
        self.samples.last()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn as_slice(&self) -> &[SpeedSample] {
        &self.samples
    }

    /// Drop everything but the newest sample.
    pub fn truncate_to_last(&mut self, capacity: usize) {
        let last = self.samples.pop();
        self.samples = Vec::with_capacity(capacity);
        self.samples.extend(last);
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Checkpoint {
    pub threshold: f64,
    pub reached: bool,
}

pub struct AccelAnalyzer {
    config: AnalyzerConfig,
    running: bool,
    series: SampleSeries,
    incorrect_count: u32,
    checkpoints: Vec<Checkpoint>,
}

impl AccelAnalyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        let checkpoints = Self::fresh_checkpoints(&config);
        Self {
            config,
            running: false,
            series: SampleSeries::default(),
            incorrect_count: 0,
            checkpoints,
        }
    }

    fn fresh_checkpoints(config: &AnalyzerConfig) -> Vec<Checkpoint> {
        config
            .checkpoints
            .iter()
            .map(|&threshold| Checkpoint {
                threshold,
                reached: false,
            })
            .collect()
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    /// Begin a new run, discarding anything from the previous one.
    pub fn start(&mut self) {
        self.series = SampleSeries::with_capacity(self.config.initial_capacity);
        self.incorrect_count = 0;
        self.checkpoints = Self::fresh_checkpoints(&self.config);
        self.running = true;
    }

    pub fn stop(&mut self) {
        self.running = false;
        self.series = SampleSeries::default();
    }

    pub fn add_data(&mut self, sample: SpeedSample) -> bool {
        self.running && self.series.push(sample)
    }

    pub fn samples(&self) -> &[SpeedSample] {
        self.series.as_slice()
    }

    pub fn sample_count(&self) -> usize {
        self.series.len()
    }

    /// Bound memory while idling before the launch.
    pub fn trim_idle(&mut self) {
        if self.series.len() > self.config.initial_capacity {
            accel_log!(Debug, "Trimming {} idle samples", self.series.len() - 1);
            self.series.truncate_to_last(self.config.initial_capacity);
        }
    }

    pub fn handle_incorrect_data(&mut self) {
        self.incorrect_count += 1;
    }

    pub fn incorrect_data_count(&self) -> u32 {
        self.incorrect_count
    }

    pub fn incorrect_limit_reached(&self) -> bool {
        self.incorrect_count >= self.config.max_incorrect_samples
    }

    /// Lowest threshold not reached yet; `None` once all are reached.
    pub fn current_checkpoint(&self) -> Option<f64> {
        self.checkpoints.iter().find(|c| !c.reached).map(|c| c.threshold)
    }

    pub fn set_checkpoint(&mut self, threshold: f64) {
        if let Some(checkpoint) = self.checkpoints.iter_mut().find(|c| c.threshold == threshold) {
            checkpoint.reached = true;
        }
    }

    pub fn checkpoints(&self) -> &[Checkpoint] {
        &self.checkpoints
    }

    pub fn reached_count(&self) -> usize {
        self.checkpoints.iter().filter(|c| c.reached).count()
    }

    /// Index of the sample completing `jitter_count` consecutive samples
    /// above the start threshold.
    pub fn coarse_start_index(&self) -> Result<usize, AnalysisError> {
        let samples = self.series.as_slice();
        if samples.is_empty() {
            return Err(AnalysisError::NoSamples);
        }

        let threshold = self.config.start_speed_threshold;
        let jitter_count = self.config.jitter_count.max(1);
        let mut hits = 0;
        let coarse = samples.iter().position(|s| {
            if s.speed_kmh > threshold {
                hits += 1;
            } else {
                hits = 0;
            }
            hits == jitter_count
        });
        coarse.ok_or(AnalysisError::NoAccelerationStart {
            threshold,
            samples: samples.len(),
        })
    }

    /// Index of the sample where the launch began.
    ///
    /// The coarse candidate is walked back while speed keeps falling towards
    /// earlier samples, since the threshold is crossed some time after the car
    /// actually started moving.
    pub fn find_start_index(&self) -> Result<usize, AnalysisError> {
        let coarse = self.coarse_start_index()?;
        let samples = self.series.as_slice();

        let mut start = coarse;
        if coarse > 2 {
            let mut rises = 0;
            for i in (1..=coarse).rev() {
                if samples[i - 1].speed_kmh <= samples[i].speed_kmh {
                    start = i - 1;
                    rises = 0;
                } else {
                    rises += 1;
                    if rises == REFINE_STOP_COUNT {
                        break;
                    }
                }
            }
        }

        accel_log!(Debug, "Acceleration start: coarse index {}, refined index {}", coarse, start);
        Ok(start)
    }

    /// Elapsed seconds from launch to each checkpoint, `None` where the
    /// checkpoint was never exceeded. A sample exactly at a threshold does
    /// not count as a crossing.
    pub fn analyze_data(&self) -> Result<Vec<Option<f64>>, AnalysisError> {
        let start = self.find_start_index()?;
        let samples = self.series.as_slice();
        let start_timestamp = samples[start].timestamp;
        let thresholds = &self.config.checkpoints;

        let mut times = vec![None; thresholds.len()];
        let mut next = 0;
        for sample in &samples[start..] {
            if next == thresholds.len() {
                break;
            }
            if sample.speed_kmh > thresholds[next] {
                times[next] = Some(sample.timestamp - start_timestamp);
                next += 1;
            }
        }

        if next < thresholds.len() {
            accel_log!(Warn, "Checkpoint {} km/h not reached", thresholds[next]);
        }
        Ok(times)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample(timestamp: f64, speed_kmh: f64) -> SpeedSample {
        SpeedSample { timestamp, speed_kmh }
    }

    fn running_with(speeds: &[f64]) -> AccelAnalyzer {
        let mut analyzer = AccelAnalyzer::new(AnalyzerConfig::default());
        analyzer.start();
        for (i, &speed) in speeds.iter().enumerate() {
            assert!(analyzer.add_data(sample(100.0 + i as f64 * 0.5, speed)));
        }
        analyzer
    }

    #[test]
    fn duplicate_timestamp_is_rejected() {
        let mut analyzer = AccelAnalyzer::new(AnalyzerConfig::default());
        analyzer.start();
        assert!(analyzer.add_data(sample(10.0, 5.0)));
        assert!(!analyzer.add_data(sample(10.0, 5.0)));
        assert!(!analyzer.add_data(sample(10.0, 7.0)));
        assert_eq!(analyzer.sample_count(), 1);
    }

    #[test]
    fn samples_are_refused_while_stopped() {
        let mut analyzer = AccelAnalyzer::new(AnalyzerConfig::default());
        assert!(!analyzer.add_data(sample(1.0, 5.0)));
        analyzer.start();
        assert!(analyzer.add_data(sample(1.0, 5.0)));
        analyzer.stop();
        assert!(!analyzer.add_data(sample(2.0, 5.0)));
        assert_eq!(analyzer.sample_count(), 0);
    }

    #[test]
    fn coarse_start_completes_jitter_run() {
        // Below threshold for 0..=4, above it for 5..=14, strictly increasing
        let speeds: Vec<f64> = (0..15)
            .map(|i| if i < 5 { 0.1 * (i + 1) as f64 } else { 4.0 + i as f64 })
            .collect();
        let analyzer = running_with(&speeds);
        assert_eq!(analyzer.coarse_start_index(), Ok(9));
        // Refinement walks all the way back
        assert_eq!(analyzer.find_start_index(), Ok(0));

        // Refinement cut short by a descending prefix right before the run
        let speeds = [2.9, 2.8, 2.7, 2.6, 2.5, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0];
        let mut analyzer = AccelAnalyzer::new(AnalyzerConfig::default());
        analyzer.start();
        for (i, &speed) in speeds.iter().enumerate() {
            analyzer.add_data(sample(i as f64, speed));
        }
        assert_eq!(analyzer.coarse_start_index(), Ok(9));
        // Walked back to 4 where the prefix stops falling
        assert_eq!(analyzer.find_start_index(), Ok(4));
    }

    #[test]
    fn coarse_start_follows_jitter_count() {
        let speeds = [1.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0];
        let mut analyzer = AccelAnalyzer::new(AnalyzerConfig {
            jitter_count: 3,
            ..AnalyzerConfig::default()
        });
        analyzer.start();
        for (i, &speed) in speeds.iter().enumerate() {
            analyzer.add_data(sample(i as f64, speed));
        }
        assert_eq!(analyzer.coarse_start_index(), Ok(3));

        // A dip under the threshold restarts the count
        let analyzer = running_with(&[4.0, 5.0, 6.0, 7.0, 2.0, 8.0, 9.0, 10.0, 11.0, 12.0]);
        assert_eq!(analyzer.coarse_start_index(), Ok(9));
    }

    #[test]
    fn sample_at_threshold_is_not_a_crossing() {
        let speeds = [0.5, 10.0, 20.0, 30.0, 31.0, 45.0, 60.0, 100.0];
        let analyzer = running_with(&speeds);
        assert_eq!(analyzer.find_start_index(), Ok(0));

        let times = analyzer.analyze_data().unwrap();
        let ts = |i: usize| 100.0 + i as f64 * 0.5;
        // 30.0 and 60.0 sit exactly on their thresholds
        assert_relative_eq!(times[0].unwrap(), ts(4) - ts(0));
        assert_relative_eq!(times[1].unwrap(), ts(7) - ts(0));
        assert_eq!(times[2], None);
    }

    #[test]
    fn refinement_stops_after_two_rises() {
        let speeds = [2.0, 1.0, 0.5, 1.0, 2.0, 5.0, 6.0, 7.0, 8.0, 9.0];
        let analyzer = running_with(&speeds);
        // Coarse index 9 (fifth sample above 3 km/h), refined back to the dip
        assert_eq!(analyzer.find_start_index(), Ok(2));
    }

    #[test]
    fn single_bump_is_tolerated_during_refinement() {
        let speeds = [0.2, 0.4, 1.0, 0.8, 1.5, 4.0, 5.0, 6.0, 7.0, 8.0];
        let analyzer = running_with(&speeds);
        assert_eq!(analyzer.find_start_index(), Ok(0));
    }

    #[test]
    fn no_sustained_run_is_a_detection_failure() {
        let analyzer = running_with(&[1.0, 4.0, 5.0, 1.0, 6.0, 7.0, 8.0, 9.0, 1.0]);
        assert!(matches!(
            analyzer.find_start_index(),
            Err(AnalysisError::NoAccelerationStart { samples: 9, .. })
        ));

        let analyzer = running_with(&[]);
        assert_eq!(analyzer.analyze_data(), Err(AnalysisError::NoSamples));
    }

    #[test]
    fn checkpoint_times_are_relative_to_start() {
        let speeds = [0.5, 10.0, 20.0, 35.0, 40.0, 45.0, 55.0, 65.0, 70.0, 75.0];
        let analyzer = running_with(&speeds);
        assert_eq!(analyzer.find_start_index(), Ok(0));

        let times = analyzer.analyze_data().unwrap();
        assert_eq!(times.len(), 3);
        let ts = |i: usize| 100.0 + i as f64 * 0.5;
        assert_relative_eq!(times[0].unwrap(), ts(3) - ts(0));
        assert_relative_eq!(times[1].unwrap(), ts(7) - ts(0));
        assert_eq!(times[2], None);
    }

    #[test]
    fn checkpoints_advance_in_order() {
        let mut analyzer = AccelAnalyzer::new(AnalyzerConfig::default());
        analyzer.start();
        assert_eq!(analyzer.current_checkpoint(), Some(30.0));
        analyzer.set_checkpoint(30.0);
        assert_eq!(analyzer.current_checkpoint(), Some(60.0));
        analyzer.set_checkpoint(60.0);
        analyzer.set_checkpoint(100.0);
        assert_eq!(analyzer.current_checkpoint(), None);
        assert_eq!(analyzer.reached_count(), 3);

        analyzer.start();
        assert_eq!(analyzer.current_checkpoint(), Some(30.0));
        assert_eq!(analyzer.reached_count(), 0);
    }

    #[test]
    fn incorrect_data_ceiling() {
        let mut analyzer = AccelAnalyzer::new(AnalyzerConfig::default());
        analyzer.start();
        for _ in 0..4 {
            analyzer.handle_incorrect_data();
            assert!(!analyzer.incorrect_limit_reached());
        }
        analyzer.handle_incorrect_data();
        assert!(analyzer.incorrect_limit_reached());
        assert_eq!(analyzer.incorrect_data_count(), 5);
    }

    #[test]
    fn idle_trim_keeps_newest_sample() {
        let mut analyzer = running_with(&[0.5; 12]);
        analyzer.trim_idle();
        assert_eq!(analyzer.sample_count(), 1);
        assert_eq!(analyzer.samples()[0].timestamp, 105.5);
        // Duplicate protection survives the trim
        assert!(!analyzer.add_data(sample(105.5, 0.5)));
        assert!(analyzer.add_data(sample(106.0, 0.5)));
    }
}

//! Progress reporting policy
//!
//! [`ProgressStage`] counts records and decides which counts are worth a
//! report: the first record of a run, every crossing of a `step` percent
//! threshold, and the last record. [`ProgressStage::finish`] guarantees a
//! final 100% report without duplicating one already sent.

use crate::model::Progress;

pub struct ProgressStage {
    total: u64,
    step: u8,
    last_percentage: u8,
    last_reported: Option<u64>,
}

impl ProgressStage {
    /// Create a stage for a run starting at `start_processed` records
    pub fn new(total: u64, step: u8, start_processed: u64) -> Self {
        Self {
            total,
            step: step.max(1),
            last_percentage: Progress::new(start_processed, total).percentage,
            last_reported: None,
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Account for one more record; returns progress when it should be reported
    pub fn record(&mut self, processed: u64) -> Option<Progress> {
        let progress = Progress::new(processed, self.total);
        let first = self.last_reported.is_none();
        let last = self.total > 0 && processed == self.total;
        let crossed = progress.percentage / self.step > self.last_percentage / self.step;

        if first || last || crossed {
            self.last_percentage = self.last_percentage.max(progress.percentage);
            self.last_reported = Some(processed);
            Some(progress)
        } else {
            None
        }
    }

    /// Final 100% report, unless the last report already was exactly that
    pub fn finish(&mut self, processed: u64) -> Option<Progress> {
        let done = Progress::complete(processed);
        if self.last_reported == Some(processed) && self.last_percentage == 100 {
            return None;
        }
        self.last_percentage = 100;
        self.last_reported = Some(processed);
        Some(done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_percent_step_reported_once() {
        let mut stage = ProgressStage::new(10, 1, 0);
        let reports: Vec<u8> = (1..=10)
            .filter_map(|n| stage.record(n))
            .map(|p| p.percentage)
            .collect();
        assert_eq!(reports, vec![10, 20, 30, 40, 50, 60, 70, 80, 90, 100]);
        assert!(stage.finish(10).is_none());
    }

    #[test]
    fn test_coarse_step_reports_first_and_last() {
        let mut stage = ProgressStage::new(1000, 25, 0);
        let reported: Vec<u64> = (1..=1000)
            .filter_map(|n| stage.record(n))
            .map(|p| p.processed_items)
            .collect();
        assert_eq!(reported, vec![1, 250, 500, 750, 1000]);
    }

    #[test]
    fn test_finish_when_total_shrank() {
        let mut stage = ProgressStage::new(10, 10, 0);
        for n in 1..=8 {
            stage.record(n);
        }
        let done = stage.finish(8).unwrap();
        assert_eq!(done.percentage, 100);
        assert_eq!(done.total_items, 8);
    }

    #[test]
    fn test_empty_export_finishes_at_100() {
        let mut stage = ProgressStage::new(0, 1, 0);
        let done = stage.finish(0).unwrap();
        assert_eq!(done.percentage, 100);
        assert_eq!(done.processed_items, 0);
    }

    #[test]
    fn test_resumed_stage_continues_from_checkpoint() {
        let mut stage = ProgressStage::new(10, 1, 4);
        let first = stage.record(5).unwrap();
        assert_eq!(first.percentage, 50);
        assert_eq!(stage.record(6).unwrap().percentage, 60);
    }
}

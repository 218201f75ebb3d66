//! Bode step sub-machine.
//!
//! A Bode step runs one pass per test signal. A parallel pass is a single
//! acquisition of every AC input. A sequential pass pops one channel at a time
//! and acquires it alone, storing its measured tone bins into a column of the
//! pass buffer. Gains (measured bin / drive bin) are computed only once the
//! pass buffer is complete, then stacked below the rows of earlier passes.

use crate::bode::{AcquisitionMode, BodePlan, TestSignal};
use crate::data::SampleBlock;
use crate::error::{AppResult, CharactError};
use crate::hardware::InputGroup;
use num_complex::Complex64;
use std::collections::VecDeque;
use std::sync::Arc;

/// Progress of one Bode step.
#[derive(Debug)]
pub(crate) struct BodeRun {
    plan: Arc<BodePlan>,
    n_channels: usize,
    pass: usize,
    pending: VecDeque<InputGroup>,
    in_flight: Option<InputGroup>,
    buffer: Vec<Option<Vec<Complex64>>>,
    stacked: Vec<Vec<Complex64>>,
}

impl BodeRun {
    pub(crate) fn new(plan: Arc<BodePlan>, n_channels: usize) -> Self {
        let mut run = Self {
            plan,
            n_channels,
            pass: 0,
            pending: VecDeque::new(),
            in_flight: None,
            buffer: vec![None; n_channels],
            stacked: vec![Vec::new(); n_channels],
        };
        run.start_pass();
        run
    }

    fn start_pass(&mut self) {
        self.pending.clear();
        self.buffer = vec![None; self.n_channels];
        if let Some(signal) = self.plan.signals.get(self.pass) {
            match signal.mode {
                AcquisitionMode::Parallel => self.pending.push_back(InputGroup::Ac),
                AcquisitionMode::Sequential => self
                    .pending
                    .extend((0..self.n_channels).map(InputGroup::AcChannel)),
            }
        }
    }

    /// Test signal of the current pass.
    pub(crate) fn signal(&self) -> Option<&TestSignal> {
        self.plan.signals.get(self.pass)
    }

    /// Index of the current pass.
    pub(crate) fn pass(&self) -> usize {
        self.pass
    }

    /// Input group of the next acquisition, or `None` once every pass is done.
    pub(crate) fn next_acquisition(&mut self) -> Option<InputGroup> {
        let group = self.pending.pop_front()?;
        self.in_flight = Some(group);
        Some(group)
    }

    /// Store the trace of the acquisition returned by the last `next_acquisition`.
    pub(crate) fn accept(&mut self, block: &SampleBlock) -> AppResult<()> {
        let group = self.in_flight.take().ok_or_else(|| {
            CharactError::InvalidState("Bode data without an acquisition in flight".into())
        })?;
        let signal = self
            .plan
            .signals
            .get(self.pass)
            .ok_or_else(|| CharactError::InvalidState("Bode data after the last pass".into()))?;

        match group {
            InputGroup::Ac => {
                if block.n_channels() != self.n_channels {
                    return Err(CharactError::ShapeMismatch {
                        what: "parallel Bode block channels".into(),
                        expected: self.n_channels,
                        actual: block.n_channels(),
                    });
                }
                for (ch, column) in block.deinterleave().iter().enumerate() {
                    self.buffer[ch] = Some(signal.measure(column)?);
                }
            }
            InputGroup::AcChannel(ch) if ch < self.n_channels => {
                if block.n_channels() != 1 {
                    return Err(CharactError::ShapeMismatch {
                        what: "sequential Bode block channels".into(),
                        expected: 1,
                        actual: block.n_channels(),
                    });
                }
                self.buffer[ch] = Some(signal.measure(&block.channel_data(0))?);
            }
            other => {
                return Err(CharactError::InvalidState(format!(
                    "unexpected Bode input group {other}"
                )))
            }
        }

        if self.pending.is_empty() {
            self.finish_pass()?;
        }
        Ok(())
    }

    fn finish_pass(&mut self) -> AppResult<()> {
        let signal = &self.plan.signals[self.pass];
        for (ch, measured) in self.buffer.iter().enumerate() {
            let measured = measured.as_ref().ok_or_else(|| {
                CharactError::InvalidState(format!("Bode pass {} missing channel {ch}", self.pass))
            })?;
            let gains = signal.normalize(measured)?;
            self.stacked[ch].extend(gains);
        }
        self.pass += 1;
        self.start_pass();
        Ok(())
    }

    /// Every pass finished.
    pub(crate) fn is_complete(&self) -> bool {
        self.pass >= self.plan.signals.len()
    }

    /// Stacked gains per channel.
    pub(crate) fn into_gains(self) -> Vec<Vec<Complex64>> {
        self.stacked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BodeSettings;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn plan() -> Arc<BodePlan> {
        let settings = BodeSettings {
            freq_min: 10.0,
            freq_max: 200.0,
            n_freqs: 8,
            freq_split: 50.0,
            fs_low: 1000.0,
            fs_high: 4000.0,
            n_avg: 1,
            ..BodeSettings::default()
        };
        Arc::new(BodePlan::generate(&settings, &mut StdRng::seed_from_u64(9)).unwrap())
    }

    fn response(signal: &TestSignal, gains: &[f64]) -> SampleBlock {
        let columns: Vec<Vec<f64>> = gains
            .iter()
            .map(|g| signal.samples.iter().map(|v| g * v).collect())
            .collect();
        SampleBlock::from_columns(&columns).unwrap()
    }

    #[test]
    fn passes_run_parallel_then_one_channel_at_a_time() {
        let gm = [3e-5, -4e-5, 5e-5];
        let mut run = BodeRun::new(plan(), 3);
        let mut groups = Vec::new();
        while let Some(group) = run.next_acquisition() {
            groups.push(group);
            let signal = run.signal().unwrap().clone();
            let block = match group {
                InputGroup::Ac => response(&signal, &gm),
                InputGroup::AcChannel(ch) => response(&signal, &gm[ch..=ch]),
                _ => unreachable!(),
            };
            run.accept(&block).unwrap();
        }
        assert_eq!(
            groups,
            [
                InputGroup::Ac,
                InputGroup::AcChannel(0),
                InputGroup::AcChannel(1),
                InputGroup::AcChannel(2)
            ]
        );
        assert!(run.is_complete());

        let n = plan().n_freqs();
        for (ch, gains) in run.into_gains().iter().enumerate() {
            assert_eq!(gains.len(), n);
            for g in gains {
                assert!((g.re - gm[ch]).abs() < 1e-12 && g.im.abs() < 1e-12, "{g}");
            }
        }
    }

    #[test]
    fn data_without_request_is_rejected() {
        let mut run = BodeRun::new(plan(), 1);
        let block = SampleBlock::new(vec![0.0; 4], 1).unwrap();
        assert!(run.accept(&block).is_err());
        assert_eq!(run.pass(), 0);
    }

    #[test]
    fn wrong_width_block_is_rejected() {
        let mut run = BodeRun::new(plan(), 2);
        assert_eq!(run.next_acquisition(), Some(InputGroup::Ac));
        let signal = run.signal().unwrap().clone();
        assert!(run.accept(&response(&signal, &[1.0])).is_err());
    }
}

//! Step catalog: the ordered instruction list of a run.

use crate::bode::BodePlan;
use crate::stability::StabilityCriteria;
use crate::sweep::{PsdPlan, SweepConfig};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Bias point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bias {
    /// Gate-source voltage (V)
    pub vgs: f64,
    /// Drain-source voltage (V)
    pub vds: f64,
}

/// Position of a DC point in the Vgs x Vds grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepIndex {
    /// Vds index
    pub i_vd: usize,
    /// Vgs index
    pub i_vg: usize,
}

/// Position of an AC point: Vds index and position inside the AC selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcIndex {
    /// Vds index
    pub i_vd: usize,
    /// Vgs index in the full sweep
    pub i_vg: usize,
    /// Position of `i_vg` in the AC selection
    pub i_vg_ac: usize,
}

/// DC stabilization at one bias point.
#[derive(Debug, Clone, PartialEq)]
pub struct DcStep {
    /// Bias applied before reading
    pub bias: Bias,
    /// Result cell
    pub index: SweepIndex,
    /// Sampling rate (Hz)
    pub fs: f64,
    /// Samples per stability evaluation
    pub n_samps: usize,
    /// Record the last fit after this long
    pub timeout: Duration,
    /// Stability threshold (A/s)
    pub max_slope: f64,
    /// How channel slopes are combined
    pub criteria: StabilityCriteria,
}

/// Gate leakage at the current bias point.
#[derive(Debug, Clone, PartialEq)]
pub struct GateStep {
    /// Result cell
    pub index: SweepIndex,
    /// Sampling rate (Hz)
    pub fs: f64,
    /// Samples averaged
    pub n_samps: usize,
}

/// Noise spectrum at the current bias point.
#[derive(Debug, Clone, PartialEq)]
pub struct PsdStep {
    /// Result row
    pub index: AcIndex,
    /// Acquisition length and Welch segment size
    pub plan: PsdPlan,
}

/// Transconductance at the current bias point.
#[derive(Debug, Clone)]
pub struct BodeStep {
    /// Result row
    pub index: AcIndex,
    /// Test signals and passes, shared by every Bode step
    pub plan: Arc<BodePlan>,
}

/// Closed set of step types.
#[derive(Debug, Clone)]
pub enum StepKind {
    /// `GetIds`
    Dc(DcStep),
    /// `GetGate`
    Gate(GateStep),
    /// `GetBode`
    Bode(BodeStep),
    /// `GetPSD`
    Psd(PsdStep),
}

/// One queued instruction.
#[derive(Debug, Clone)]
pub struct Step {
    /// What to run
    pub kind: StepKind,
    /// Human-readable description, e.g. `DCIds Vds 1 of 2 Vgs 3 of 5`
    pub label: String,
}

impl Step {
    /// Function selector of the step.
    pub fn selector(&self) -> &'static str {
        match self.kind {
            StepKind::Dc(_) => "GetIds",
            StepKind::Gate(_) => "GetGate",
            StepKind::Bode(_) => "GetBode",
            StepKind::Psd(_) => "GetPSD",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.label, self.selector())
    }
}

/// Expand `cfg` into its step queue.
///
/// Vds is the outer loop and Vgs the inner one. Each bias point gets a DC step,
/// then a gate step if enabled, then for selected AC points a Bode step and a
/// PSD step, each if enabled.
pub fn build_steps(cfg: &SweepConfig) -> VecDeque<Step> {
    let (n_vd, n_vg) = (cfg.vds.len(), cfg.vgs.len());
    let mut steps = VecDeque::new();

    for (i_vd, &vds) in cfg.vds.iter().enumerate() {
        for (i_vg, &vgs) in cfg.vgs.iter().enumerate() {
            let point = format!("Vds {} of {} Vgs {} of {}", i_vd + 1, n_vd, i_vg + 1, n_vg);
            let index = SweepIndex { i_vd, i_vg };

            steps.push_back(Step {
                kind: StepKind::Dc(DcStep {
                    bias: Bias { vgs, vds },
                    index,
                    fs: cfg.dc.fs,
                    n_samps: cfg.dc.n_samps,
                    timeout: Duration::from_secs_f64(cfg.dc.timeout_s),
                    max_slope: cfg.dc.max_slope,
                    criteria: cfg.dc.criteria,
                }),
                label: format!("DCIds {point}"),
            });

            if cfg.gate {
                steps.push_back(Step {
                    kind: StepKind::Gate(GateStep {
                        index,
                        fs: cfg.dc.fs,
                        n_samps: cfg.dc.n_samps,
                    }),
                    label: format!("Gate {point}"),
                });
            }

            let Some(ac) = &cfg.ac else { continue };
            let Some(i_vg_ac) = ac.selection.position(i_vg) else {
                continue;
            };
            let ac_index = AcIndex {
                i_vd,
                i_vg,
                i_vg_ac,
            };
            if let Some(plan) = &ac.bode {
                steps.push_back(Step {
                    kind: StepKind::Bode(BodeStep {
                        index: ac_index,
                        plan: Arc::clone(plan),
                    }),
                    label: format!("Bode {point}"),
                });
            }
            if let Some(plan) = ac.psd {
                steps.push_back(Step {
                    kind: StepKind::Psd(PsdStep {
                        index: ac_index,
                        plan,
                    }),
                    label: format!("PSD {point}"),
                });
            }
        }
    }
    steps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::SAMPLE;
    use crate::config::Settings;

    fn plan() -> SweepConfig {
        let mut settings = Settings::from_toml_str(SAMPLE).unwrap();
        settings.bode.seed = Some(1);
        SweepConfig::from_settings(&settings).unwrap()
    }

    #[test]
    fn steps_follow_catalog_order() {
        let steps = build_steps(&plan());
        let selectors: Vec<&str> = steps.iter().take(6).map(Step::selector).collect();
        assert_eq!(
            selectors,
            ["GetIds", "GetGate", "GetBode", "GetPSD", "GetIds", "GetGate"]
        );
        assert_eq!(steps[0].label, "DCIds Vds 1 of 1 Vgs 1 of 5");
        assert_eq!(steps[5].label, "Gate Vds 1 of 1 Vgs 2 of 5");
    }

    #[test]
    fn step_count_matches_grid() {
        let cfg = plan();
        // 5 DC + 5 gate + 3 AC points x (Bode + PSD)
        assert_eq!(build_steps(&cfg).len(), 5 + 5 + 3 * 2);
    }

    #[test]
    fn ac_steps_carry_selection_position() {
        let steps = build_steps(&plan());
        let psd: Vec<AcIndex> = steps
            .iter()
            .filter_map(|s| match &s.kind {
                StepKind::Psd(p) => Some(p.index),
                _ => None,
            })
            .collect();
        let pos: Vec<(usize, usize)> = psd.iter().map(|i| (i.i_vg, i.i_vg_ac)).collect();
        assert_eq!(pos, [(0, 0), (2, 1), (4, 2)]);
    }

    #[test]
    fn dc_step_carries_bias_and_timeout() {
        let steps = build_steps(&plan());
        let StepKind::Dc(dc) = &steps[4].kind else {
            panic!("expected a DC step");
        };
        assert!((dc.bias.vgs - 0.1).abs() < 1e-12);
        assert!((dc.bias.vds - 0.05).abs() < 1e-12);
        assert_eq!(dc.timeout, Duration::from_secs(5));
        assert_eq!(dc.criteria, StabilityCriteria::OneChannel);
    }
}

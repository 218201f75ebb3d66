//! Conversion of amplifier output voltages into currents.
//!
//! The DC path is referenced to the drain bias, so its offset `BiasVd =
//! Vds - Vgs` is removed before dividing by the transimpedance gain.

use crate::config::Gains;
use crate::error::{AppResult, CharactError};
use crate::hardware::InputGroup;

/// Gains and bias offset of the current front end.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Conditioning {
    dc_gain: f64,
    ac_gain: f64,
    gate_gain: Option<f64>,
    bias_vd: f64,
}

impl Conditioning {
    /// Front end with the board gains and zero bias.
    pub fn new(gains: &Gains) -> Self {
        Self {
            dc_gain: gains.dc,
            ac_gain: gains.ac,
            gate_gain: gains.gate,
            bias_vd: 0.0,
        }
    }

    /// Track a new bias point.
    pub fn set_bias(&mut self, vgs: f64, vds: f64) {
        self.bias_vd = vds - vgs;
    }

    /// Drain reference voltage of the DC path.
    pub fn bias_vd(&self) -> f64 {
        self.bias_vd
    }

    fn gate_gain(&self) -> AppResult<f64> {
        self.gate_gain
            .ok_or_else(|| CharactError::Hardware("board has no gate current gain".into()))
    }

    /// Current (A) for an input voltage read on `group`.
    pub fn to_current(&self, group: InputGroup, volts: f64) -> AppResult<f64> {
        Ok(match group {
            InputGroup::Dc => (volts - self.bias_vd) / self.dc_gain,
            InputGroup::Ac | InputGroup::AcChannel(_) => volts / self.ac_gain,
            InputGroup::Gate => volts / self.gate_gain()?,
        })
    }

    /// Amplifier output voltage for a current on `group`.
    pub fn to_volts(&self, group: InputGroup, amps: f64) -> AppResult<f64> {
        Ok(match group {
            InputGroup::Dc => amps * self.dc_gain + self.bias_vd,
            InputGroup::Ac | InputGroup::AcChannel(_) => amps * self.ac_gain,
            InputGroup::Gate => amps * self.gate_gain()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gains() -> Gains {
        Gains {
            dc: 1e4,
            ac: 1e6,
            gate: Some(1e8),
        }
    }

    #[test]
    fn dc_current_removes_bias_offset() {
        let mut c = Conditioning::new(&gains());
        c.set_bias(0.2, 0.05);
        assert!((c.bias_vd() + 0.15).abs() < 1e-15);
        // 1 uA through 10 kOhm on top of -0.15 V
        let i = c.to_current(InputGroup::Dc, 0.01 - 0.15).unwrap();
        assert!((i - 1e-6).abs() < 1e-15);
    }

    #[test]
    fn ac_and_gate_are_plain_transimpedance() {
        let c = Conditioning::new(&gains());
        assert!((c.to_current(InputGroup::AcChannel(3), 0.5).unwrap() - 5e-7).abs() < 1e-18);
        assert!((c.to_current(InputGroup::Gate, 1.0).unwrap() - 1e-8).abs() < 1e-20);
    }

    #[test]
    fn gate_without_gain_is_a_hardware_error() {
        let c = Conditioning::new(&Gains {
            gate: None,
            ..gains()
        });
        assert!(c.to_current(InputGroup::Gate, 1.0).unwrap_err().is_hardware());
    }
}

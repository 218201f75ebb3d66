//! JSON characterization file.
//!
//! Layout:
//!
//! ```text
//! {
//!   "DevDC": {
//!     "<channel>": { "Name", "ChName", "DateTime", "Vgs", "Vds", "Ids", "Slope" },
//!     "Gate":      { "Vgs", "Vds", "Ig" }                      (gate measurement only)
//!   },
//!   "DevAC": {
//!     "<channel>": { "Name", "VgsAC", "VdsAC", "Fpsd", "PSD": { "Vd0": .. },
//!                    "Fgm", "gm": { "Vd0": .. } }
//!   }
//! }
//! ```
//!
//! DC grids are `Vgs x Vds`; PSD and gm grids are `VgsAC x frequency`, one per
//! Vds index. Unmeasured cells are `null`, complex gains `[re, im]`.

use crate::error::{AppResult, CharactError};
use crate::storage::{Grid, ResultSink};
use crate::sweep::SweepConfig;
use chrono::{DateTime, Local};
use num_complex::Complex64;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Relative tolerance when comparing PSD frequency axes.
const FREQ_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone)]
struct DcTables {
    ids: Grid<f64>,
    slope: Grid<f64>,
}

#[derive(Debug, Clone)]
struct AcTables {
    psd: Vec<Grid<f64>>,
    gm: Vec<Grid<Complex64>>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct DcView<'a> {
    name: &'a str,
    ch_name: &'a str,
    date_time: String,
    vgs: &'a [f64],
    vds: &'a [f64],
    ids: &'a Grid<f64>,
    slope: &'a Grid<f64>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct GateView<'a> {
    vgs: &'a [f64],
    vds: &'a [f64],
    ig: &'a Grid<f64>,
}

#[derive(Serialize)]
struct AcView<'a> {
    #[serde(rename = "Name")]
    name: &'a str,
    #[serde(rename = "VgsAC")]
    vgs_ac: &'a [f64],
    #[serde(rename = "VdsAC")]
    vds_ac: &'a [f64],
    #[serde(rename = "Fpsd", skip_serializing_if = "Option::is_none")]
    f_psd: Option<&'a [f64]>,
    #[serde(rename = "PSD", skip_serializing_if = "BTreeMap::is_empty")]
    psd: BTreeMap<String, &'a Grid<f64>>,
    #[serde(rename = "Fgm", skip_serializing_if = "Option::is_none")]
    f_gm: Option<&'a [f64]>,
    #[serde(rename = "gm", skip_serializing_if = "BTreeMap::is_empty")]
    gm: BTreeMap<String, &'a Grid<Complex64>>,
}

fn vd_key(i_vd: usize) -> String {
    format!("Vd{i_vd}")
}

/// Pre-allocated result arrays of one run, optionally persisted to a JSON file.
#[derive(Debug, Clone)]
pub struct CharactFile {
    path: Option<PathBuf>,
    created: DateTime<Local>,
    channels: Vec<String>,
    vgs: Vec<f64>,
    vds: Vec<f64>,
    vgs_ac: Vec<f64>,
    f_psd: Option<Vec<f64>>,
    f_gm: Option<Vec<f64>>,
    dc: Vec<DcTables>,
    gate: Option<Grid<f64>>,
    ac: Vec<AcTables>,
    writes: usize,
}

impl CharactFile {
    /// Allocate every array the step catalog of `cfg` will fill.
    pub fn new(cfg: &SweepConfig, path: Option<PathBuf>) -> Self {
        let (n_vg, n_vd) = (cfg.vgs.len(), cfg.vds.len());
        let n_ac = cfg.n_ac();
        let f_psd = cfg.psd().map(|p| p.freqs());
        let f_gm = cfg.bode().map(|b| b.freqs());

        let dc = cfg
            .channels
            .iter()
            .map(|ch| DcTables {
                ids: Grid::new(format!("{ch}.Ids"), n_vg, n_vd),
                slope: Grid::new(format!("{ch}.Slope"), n_vg, n_vd),
            })
            .collect();
        let ac = cfg
            .channels
            .iter()
            .map(|ch| AcTables {
                psd: match &f_psd {
                    Some(f) => (0..n_vd)
                        .map(|i| Grid::new(format!("{ch}.PSD.{}", vd_key(i)), n_ac, f.len()))
                        .collect(),
                    None => Vec::new(),
                },
                gm: match &f_gm {
                    Some(f) => (0..n_vd)
                        .map(|i| Grid::new(format!("{ch}.gm.{}", vd_key(i)), n_ac, f.len()))
                        .collect(),
                    None => Vec::new(),
                },
            })
            .collect();

        Self {
            path,
            created: Local::now(),
            channels: cfg.channels.clone(),
            vgs: cfg.vgs.clone(),
            vds: cfg.vds.clone(),
            vgs_ac: cfg.ac.as_ref().map(|a| a.vgs.clone()).unwrap_or_default(),
            f_psd,
            f_gm,
            dc,
            gate: cfg.gate.then(|| Grid::new("Gate.Ig", n_vg, n_vd)),
            ac,
            writes: 0,
        }
    }

    /// Output file, if the results are persisted.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Number of successful record calls.
    pub fn writes(&self) -> usize {
        self.writes
    }

    /// Channel names.
    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    /// `Ids` grid of a channel.
    pub fn ids(&self, channel: usize) -> Option<&Grid<f64>> {
        self.dc.get(channel).map(|t| &t.ids)
    }

    /// `Slope` grid of a channel.
    pub fn slope(&self, channel: usize) -> Option<&Grid<f64>> {
        self.dc.get(channel).map(|t| &t.slope)
    }

    /// Gate current grid.
    pub fn gate(&self) -> Option<&Grid<f64>> {
        self.gate.as_ref()
    }

    /// PSD grid of a channel at a Vds index.
    pub fn psd(&self, channel: usize, i_vd: usize) -> Option<&Grid<f64>> {
        self.ac.get(channel).and_then(|t| t.psd.get(i_vd))
    }

    /// gm grid of a channel at a Vds index.
    pub fn gm(&self, channel: usize, i_vd: usize) -> Option<&Grid<Complex64>> {
        self.ac.get(channel).and_then(|t| t.gm.get(i_vd))
    }

    /// PSD frequency axis.
    pub fn psd_freqs(&self) -> Option<&[f64]> {
        self.f_psd.as_deref()
    }

    /// gm frequency axis.
    pub fn gm_freqs(&self) -> Option<&[f64]> {
        self.f_gm.as_deref()
    }

    /// Cells of every array that have not been written.
    pub fn unwritten_cells(&self) -> usize {
        let dc: usize = self
            .dc
            .iter()
            .map(|t| t.ids.unwritten() + t.slope.unwritten())
            .sum();
        let ac: usize = self
            .ac
            .iter()
            .map(|t| {
                t.psd.iter().map(Grid::unwritten).sum::<usize>()
                    + t.gm.iter().map(Grid::unwritten).sum::<usize>()
            })
            .sum();
        dc + ac + self.gate.as_ref().map_or(0, Grid::unwritten)
    }

    fn channel_name(&self, channel: usize) -> AppResult<&str> {
        self.channels
            .get(channel)
            .map(String::as_str)
            .ok_or_else(|| CharactError::IndexOutOfRange {
                what: "channel".into(),
                index: channel,
                len: self.channels.len(),
            })
    }

    fn check_len(what: &str, expected: usize, actual: usize) -> AppResult<()> {
        if expected != actual {
            return Err(CharactError::ShapeMismatch {
                what: what.into(),
                expected,
                actual,
            });
        }
        Ok(())
    }

    /// Serialized form of the whole file.
    pub fn to_json(&self) -> AppResult<Value> {
        let date_time = self.created.format("%Y-%m-%d %H:%M:%S").to_string();

        let mut dev_dc = Map::new();
        for (name, t) in self.channels.iter().zip(&self.dc) {
            let view = DcView {
                name,
                ch_name: name,
                date_time: date_time.clone(),
                vgs: &self.vgs,
                vds: &self.vds,
                ids: &t.ids,
                slope: &t.slope,
            };
            dev_dc.insert(name.clone(), serde_json::to_value(view)?);
        }
        if let Some(ig) = &self.gate {
            let view = GateView {
                vgs: &self.vgs,
                vds: &self.vds,
                ig,
            };
            dev_dc.insert("Gate".into(), serde_json::to_value(view)?);
        }

        let mut dev_ac = Map::new();
        if self.f_psd.is_some() || self.f_gm.is_some() {
            for (name, t) in self.channels.iter().zip(&self.ac) {
                let view = AcView {
                    name,
                    vgs_ac: &self.vgs_ac,
                    vds_ac: &self.vds,
                    f_psd: self.f_psd.as_deref(),
                    psd: t.psd.iter().enumerate().map(|(i, g)| (vd_key(i), g)).collect(),
                    f_gm: self.f_gm.as_deref(),
                    gm: t.gm.iter().enumerate().map(|(i, g)| (vd_key(i), g)).collect(),
                };
                dev_ac.insert(name.clone(), serde_json::to_value(view)?);
            }
        }

        let mut root = Map::new();
        root.insert("DevDC".into(), Value::Object(dev_dc));
        root.insert("DevAC".into(), Value::Object(dev_ac));
        Ok(Value::Object(root))
    }
}

impl ResultSink for CharactFile {
    fn record_dc(&mut self, i_vg: usize, i_vd: usize, ids: &[f64], slope: &[f64]) -> AppResult<()> {
        Self::check_len("DC levels", self.channels.len(), ids.len())?;
        Self::check_len("DC slopes", self.channels.len(), slope.len())?;
        // Validate every target before writing any of them.
        for t in &self.dc {
            for g in [&t.ids, &t.slope] {
                if g.get(i_vg, i_vd).is_none() {
                    return Err(CharactError::IndexOutOfRange {
                        what: "DC point".into(),
                        index: i_vg,
                        len: g.rows(),
                    });
                }
            }
        }
        for (t, (&i, &s)) in self.dc.iter_mut().zip(ids.iter().zip(slope)) {
            t.ids.set(i_vg, i_vd, i)?;
            t.slope.set(i_vg, i_vd, s)?;
        }
        self.writes += 1;
        Ok(())
    }

    fn record_gate(&mut self, i_vg: usize, i_vd: usize, ig: f64) -> AppResult<()> {
        let grid = self
            .gate
            .as_mut()
            .ok_or_else(|| CharactError::InvalidState("gate current is not measured".into()))?;
        grid.set(i_vg, i_vd, ig)?;
        self.writes += 1;
        Ok(())
    }

    fn record_psd(
        &mut self,
        channel: usize,
        i_vd: usize,
        i_vg_ac: usize,
        freqs: &[f64],
        psd: &[f64],
    ) -> AppResult<()> {
        let name = self.channel_name(channel)?.to_string();
        let axis = self
            .f_psd
            .as_deref()
            .ok_or_else(|| CharactError::InvalidState("PSD is not measured".into()))?;
        let same_axis = axis.len() == freqs.len()
            && axis
                .iter()
                .zip(freqs)
                .all(|(a, f)| (a - f).abs() <= FREQ_TOLERANCE * a.abs().max(1.0));
        if !same_axis {
            return Err(CharactError::FrequencyAxisMismatch {
                channel: name,
                expected: axis.len(),
                actual: freqs.len(),
            });
        }
        let grid = self.ac[channel]
            .psd
            .get_mut(i_vd)
            .ok_or_else(|| CharactError::IndexOutOfRange {
                what: "PSD Vds index".into(),
                index: i_vd,
                len: self.vds.len(),
            })?;
        grid.set_row(i_vg_ac, psd)?;
        self.writes += 1;
        Ok(())
    }

    fn record_bode(
        &mut self,
        channel: usize,
        i_vd: usize,
        i_vg_ac: usize,
        gain: &[Complex64],
    ) -> AppResult<()> {
        self.channel_name(channel)?;
        if self.f_gm.is_none() {
            return Err(CharactError::InvalidState("Bode is not measured".into()));
        }
        let grid = self.ac[channel]
            .gm
            .get_mut(i_vd)
            .ok_or_else(|| CharactError::IndexOutOfRange {
                what: "gm Vds index".into(),
                index: i_vd,
                len: self.vds.len(),
            })?;
        grid.set_row(i_vg_ac, gain)?;
        self.writes += 1;
        Ok(())
    }

    fn flush(&mut self) -> AppResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let bytes = serde_json::to_vec(&self.to_json()?)?;
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, path)?;
        debug!(path = %path.display(), writes = self.writes, "Result file flushed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::SAMPLE;
    use crate::config::Settings;

    fn plan() -> SweepConfig {
        let mut settings = Settings::from_toml_str(SAMPLE).unwrap();
        settings.bode.seed = Some(5);
        SweepConfig::from_settings(&settings).unwrap()
    }

    #[test]
    fn arrays_are_allocated_for_the_whole_plan() {
        let cfg = plan();
        let f = CharactFile::new(&cfg, None);
        assert_eq!(f.ids(0).unwrap().rows(), 5);
        assert_eq!(f.ids(0).unwrap().cols(), 1);
        assert_eq!(f.psd(1, 0).unwrap().rows(), 3);
        assert_eq!(f.psd(1, 0).unwrap().cols(), 129);
        assert_eq!(f.gm(0, 0).unwrap().cols(), cfg.bode().unwrap().n_freqs());
        assert!(f.gate().is_some());
        let n_freq = 129 + cfg.bode().unwrap().n_freqs();
        assert_eq!(f.unwritten_cells(), 2 * (5 * 2) + 5 + 2 * 3 * n_freq);
    }

    #[test]
    fn dc_cells_are_write_once() {
        let mut f = CharactFile::new(&plan(), None);
        f.record_dc(2, 0, &[1e-6, 2e-6], &[1e-9, -1e-9]).unwrap();
        assert_eq!(f.ids(1).unwrap().get(2, 0), Some(2e-6));
        let e = f.record_dc(2, 0, &[1.0, 1.0], &[0.0, 0.0]).unwrap_err();
        assert!(matches!(e, CharactError::CellAlreadyWritten { .. }));
        assert!(f.record_dc(9, 0, &[1.0, 1.0], &[0.0, 0.0]).is_err());
        assert_eq!(f.writes(), 1);
    }

    #[test]
    fn psd_with_foreign_axis_is_rejected() {
        let cfg = plan();
        let mut f = CharactFile::new(&cfg, None);
        let good = cfg.psd().unwrap().freqs();
        let psd = vec![1e-20; good.len()];
        f.record_psd(0, 0, 1, &good, &psd).unwrap();

        let shifted: Vec<f64> = good.iter().map(|x| x * 2.0).collect();
        let e = f.record_psd(1, 0, 1, &shifted, &psd).unwrap_err();
        assert!(matches!(e, CharactError::FrequencyAxisMismatch { .. }));
        assert!(f.psd(1, 0).unwrap().get(1, 0).unwrap().is_nan());
    }

    #[test]
    fn flush_writes_expected_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join("charact.json");
        let cfg = plan();
        let mut f = CharactFile::new(&cfg, Some(path.clone()));
        f.record_dc(0, 0, &[1e-6, 2e-6], &[0.0, 0.0]).unwrap();
        f.record_gate(0, 0, 3e-10).unwrap();
        let gain = vec![Complex64::new(2e-5, -1e-6); cfg.bode().unwrap().n_freqs()];
        f.record_bode(1, 0, 2, &gain).unwrap();
        f.flush().unwrap();

        let v: Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(v["DevDC"]["Ch01"]["Ids"][0][0], 1e-6);
        assert!(v["DevDC"]["Ch01"]["Ids"][1][0].is_null());
        assert_eq!(v["DevDC"]["Gate"]["Ig"][0][0], 3e-10);
        assert_eq!(v["DevDC"]["Ch02"]["ChName"], "Ch02");
        assert_eq!(v["DevAC"]["Ch02"]["gm"]["Vd0"][2][0][0], 2e-5);
        assert_eq!(v["DevAC"]["Ch02"]["gm"]["Vd0"][2][0][1], -1e-6);
        assert_eq!(v["DevAC"]["Ch01"]["VgsAC"].as_array().unwrap().len(), 3);
        assert_eq!(v["DevAC"]["Ch01"]["Fpsd"].as_array().unwrap().len(), 129);
        assert!(!dir.path().join("run").join("charact.json.tmp").exists());
    }

    #[test]
    fn flush_without_path_is_a_no_op() {
        let mut f = CharactFile::new(&plan(), None);
        f.flush().unwrap();
        assert!(f.path().is_none());
    }
}

use serde::{Deserialize, Serialize};

use crate::physics::refraction::RefractionParams;

const C_LIGHT: f64 = 299_792_458.0;
/// Thermal noise density at 290 K, dBm/Hz.
const THERMAL_NOISE_DBM_HZ: f64 = -174.0;

pub const MIN_PATH_LOSS_EXPONENT: f64 = 1.5;

pub fn calculate_wavelength(freq_mhz: f64) -> f64 {
    C_LIGHT / (freq_mhz * 1e6)
}

pub fn receiver_sensitivity_dbm(bandwidth_hz: f64, noise_figure_db: f64, snr_min_db: f64) -> f64 {
    THERMAL_NOISE_DBM_HZ + 10.0 * bandwidth_hz.log10() + noise_figure_db + snr_min_db
}

/// Free-space path loss at 1 m.
pub fn fspl_at_1m_db(freq_mhz: f64) -> f64 {
    32.44 + 20.0 * freq_mhz.log10() - 60.0
}

pub fn max_path_loss_db(tx_dbm: f64, sensitivity_dbm: f64, fade_margin_db: f64) -> f64 {
    tx_dbm - sensitivity_dbm - fade_margin_db
}

/// Cutoff mode: the budget ends where received power drops below `min_rx_dbm`.
pub fn max_path_loss_cutoff_db(tx_dbm: f64, min_rx_dbm: f64) -> f64 {
    tx_dbm - min_rx_dbm
}

/// Log-distance path loss at `distance_m`, without terrain terms.
pub fn log_distance_loss_db(fspl_1m_db: f64, n: f64, distance_m: f64, clutter_loss_db: f64) -> f64 {
    fspl_1m_db + 10.0 * n * distance_m.log10() + clutter_loss_db
}

/// Inverts the log-distance model for the distance at which the loss budget is used up.
pub fn range_meters(max_path_loss_db: f64, freq_mhz: f64, n: f64, clutter_loss_db: f64) -> f64 {
    let n = n.max(MIN_PATH_LOSS_EXPONENT);
    let clutter = if clutter_loss_db.is_finite() { clutter_loss_db } else { 0.0 };
    let budget = max_path_loss_db - fspl_at_1m_db(freq_mhz) - clutter;
    10f64.powf(budget / (10.0 * n)).max(1.0)
}

/// Environment preset: path-loss exponent plus fixed clutter loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropagationModel {
    FreeSpace,
    #[default]
    Suburban,
    Urban,
    Indoor,
}

impl PropagationModel {
    pub fn path_loss_exponent(&self) -> f64 {
        match self {
            PropagationModel::FreeSpace => 2.0,
            PropagationModel::Suburban => 2.2,
            PropagationModel::Urban => 2.3,
            PropagationModel::Indoor => 2.7,
        }
    }

    pub fn clutter_loss_db(&self) -> f64 {
        match self {
            PropagationModel::FreeSpace => 0.0,
            PropagationModel::Suburban => 6.0,
            PropagationModel::Urban => 10.0,
            PropagationModel::Indoor => 18.0,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            PropagationModel::FreeSpace => "Best-case (free-space)",
            PropagationModel::Suburban => "Suburban",
            PropagationModel::Urban => "Urban",
            PropagationModel::Indoor => "Indoor/obstructed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkBudgetConfig {
    pub frequency_mhz: f64,
    pub bandwidth_hz: f64,
    pub noise_figure_db: f64,
    pub snr_min_db: f64,
    pub fade_margin_db: f64,
    pub tx_power_dbm: f64,
    pub antenna_gain_db: f64,
    pub path_loss_exponent: f64,
    pub clutter_loss_db: f64,
    pub fresnel_factor: f64,
    pub clearance_ratio: f64,
    pub clearance_loss_db: f64,
    pub effective_earth_radius_m: f64,
    pub min_rx_dbm: f64,
    /// Size the budget by `min_rx_dbm` instead of sensitivity and fade margin.
    pub cutoff_mode: bool,
}

impl Default for LinkBudgetConfig {
    fn default() -> Self {
        let model = PropagationModel::default();
        Self {
            frequency_mhz: 910.525,
            bandwidth_hz: 62_500.0,
            noise_figure_db: 6.0,
            snr_min_db: -7.5,
            fade_margin_db: 10.0,
            tx_power_dbm: 20.0,
            antenna_gain_db: 3.0,
            path_loss_exponent: model.path_loss_exponent(),
            clutter_loss_db: model.clutter_loss_db(),
            fresnel_factor: 0.2,
            clearance_ratio: 0.6,
            clearance_loss_db: 12.0,
            effective_earth_radius_m: RefractionParams::default().effective_earth_radius(),
            min_rx_dbm: -97.0,
            cutoff_mode: false,
        }
    }
}

impl LinkBudgetConfig {
    pub fn with_model(mut self, model: PropagationModel) -> Self {
        self.path_loss_exponent = model.path_loss_exponent();
        self.clutter_loss_db = model.clutter_loss_db();
        self
    }

    /// Clamps `min_rx_dbm` into the accepted [-150, -60] dBm range.
    pub fn sanitized(&self) -> Self {
        let min_rx_dbm = if self.min_rx_dbm.is_finite() { self.min_rx_dbm.clamp(-150.0, -60.0) } else { -97.0 };
        Self { min_rx_dbm, ..self.clone() }
    }

    pub fn wavelength_m(&self) -> f64 {
        calculate_wavelength(self.frequency_mhz)
    }

    pub fn sensitivity_dbm(&self) -> f64 {
        receiver_sensitivity_dbm(self.bandwidth_hz, self.noise_figure_db, self.snr_min_db)
    }

    pub fn fspl_1m_db(&self) -> f64 {
        fspl_at_1m_db(self.frequency_mhz)
    }

    pub fn effective_tx_dbm(&self) -> f64 {
        self.tx_power_dbm + self.antenna_gain_db
    }

    pub fn max_path_loss_db(&self) -> f64 {
        if self.cutoff_mode {
            max_path_loss_cutoff_db(self.effective_tx_dbm(), self.min_rx_dbm)
        } else {
            max_path_loss_db(self.effective_tx_dbm(), self.sensitivity_dbm(), self.fade_margin_db)
        }
    }

    /// Free-space reference range for the configured budget and environment.
    pub fn base_range_m(&self) -> f64 {
        range_meters(
            self.max_path_loss_db(),
            self.frequency_mhz,
            self.path_loss_exponent,
            self.clutter_loss_db,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensitivity_matches_reference_radio() {
        let s = receiver_sensitivity_dbm(62_500.0, 6.0, -7.5);
        assert!((s - -127.54).abs() < 0.01, "sensitivity {s}");
    }

    #[test]
    fn fspl_reference() {
        assert!((fspl_at_1m_db(910.525) - 31.63).abs() < 0.01);
    }

    #[test]
    fn range_round_trips_through_forward_model() {
        let r = range_meters(150.54, 910.525, 2.0, 0.0);
        assert!((r - 882_000.0).abs() / 882_000.0 < 0.01, "range {r}");
        let back = log_distance_loss_db(fspl_at_1m_db(910.525), 2.0, r, 0.0);
        assert!((back - 150.54).abs() < 0.01);
    }

    #[test]
    fn range_floors() {
        // Exponent floored at 1.5.
        let a = range_meters(100.0, 910.525, 0.5, 0.0);
        let b = range_meters(100.0, 910.525, 1.5, 0.0);
        assert_eq!(a, b);
        // Negative budget floors at 1 m.
        assert_eq!(range_meters(0.0, 910.525, 2.0, 50.0), 1.0);
    }

    #[test]
    fn cutoff_mode_ignores_fade_margin() {
        let mut cfg = LinkBudgetConfig::default();
        cfg.cutoff_mode = true;
        cfg.fade_margin_db = 99.0;
        assert!((cfg.max_path_loss_db() - (23.0 + 97.0)).abs() < 1e-9);
    }
}

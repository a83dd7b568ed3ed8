use bevy::prelude::Resource;
use serde::{Deserialize, Serialize};

use crate::geo::EARTH_RADIUS;

#[derive(Clone, Copy, Debug, Resource, Serialize, Deserialize)]
pub struct RefractionParams {
    pub k_factor: f64,
}

impl Default for RefractionParams {
    fn default() -> Self {
        Self { k_factor: 4.0 / 3.0 }
    }
}

impl RefractionParams {
    pub fn effective_earth_radius(&self) -> f64 {
        EARTH_RADIUS * self.k_factor
    }
}

/// Height of the Earth bulge at a point `d1`/`d2` meters from the path ends.
pub fn earth_bulge_m(d1: f64, d2: f64, effective_radius_m: f64) -> f64 {
    if effective_radius_m <= 0.0 {
        return 0.0;
    }
    (d1 * d2) / (2.0 * effective_radius_m)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_atmosphere_radius() {
        let r = RefractionParams::default().effective_earth_radius();
        assert!((r - 8_494_666.67).abs() < 0.01);
    }

    #[test]
    fn bulge_at_mid_path() {
        let r = RefractionParams::default().effective_earth_radius();
        assert!((earth_bulge_m(10_000.0, 10_000.0, r) - 5.886).abs() < 0.001);
        // Flatter Earth, smaller bulge.
        assert!(earth_bulge_m(10_000.0, 10_000.0, r * 2.0) < earth_bulge_m(10_000.0, 10_000.0, r));
        assert_eq!(earth_bulge_m(0.0, 10_000.0, r), 0.0);
        assert_eq!(earth_bulge_m(10_000.0, 10_000.0, 0.0), 0.0);
    }
}

//! Single knife-edge diffraction and Fresnel-zone helpers.

/// First Fresnel zone radius at a point `d1`/`d2` meters from the path ends.
pub fn fresnel_radius_m(wavelength_m: f64, d1: f64, d2: f64) -> f64 {
    let total = d1 + d2;
    if total <= 0.0 || d1 <= 0.0 || d2 <= 0.0 {
        return 0.0;
    }
    (wavelength_m * d1 * d2 / total).sqrt()
}

/// Normalised diffraction parameter `v` for an obstruction `h` meters above the ray.
/// Zero for anything that would divide by zero.
pub fn diffraction_parameter(obstruction_m: f64, wavelength_m: f64, d1: f64, d2: f64) -> f64 {
    let denom = wavelength_m * d1 * d2;
    if denom <= 0.0 {
        return 0.0;
    }
    let v = obstruction_m * (2.0 * (d1 + d2) / denom).sqrt();
    if v.is_finite() { v } else { 0.0 }
}

/// ITU-R P.526 approximation of the single knife-edge loss.
pub fn knife_edge_loss_db(v: f64) -> f64 {
    if !v.is_finite() || v <= 0.0 {
        return 0.0;
    }
    let x = v - 0.1;
    let loss = 6.9 + 20.0 * ((x * x + 1.0).sqrt() + x).log10();
    loss.max(0.0)
}

/// Extra loss for a path whose worst Fresnel clearance ratio falls below `threshold`.
/// Ramps linearly with the deficit and saturates at `cap_db`.
pub fn clearance_penalty_db(min_clearance_ratio: f64, threshold: f64, cap_db: f64) -> f64 {
    if !min_clearance_ratio.is_finite() || threshold <= 0.0 || min_clearance_ratio >= threshold {
        return 0.0;
    }
    let ratio = min_clearance_ratio.max(-1.0);
    let deficit = threshold - ratio;
    (deficit / threshold * cap_db).min(cap_db)
}

// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::f64::consts::PI;

extern crate nalgebra as na;

/// Convert ra/dec (radians) to x/y/z on unit sphere.
pub fn to_unit_vector(ra: f64, dec: f64) -> [f64; 3] {
    [
        (ra.cos() * dec.cos()), // x
        (ra.sin() * dec.cos()), // y
        dec.sin(),
    ] // z
}

/// Convert x/y/z on unit sphere to ra/dec (radians). Returned ra is in
/// 0..2*PI.
pub fn from_unit_vector(v: &[f64; 3]) -> (f64, f64) {
    let x = v[0];
    let y = v[1];
    let z = v[2];
    let dec = z.asin();
    let mut ra = y.atan2(x);
    if ra < 0.0 {
        ra += 2.0 * PI;
    }
    (ra, dec)
}

/// Convert a spherical position to a Cartesian vector in the same (ICRS
/// aligned) frame. Angles in degrees; the vector has the units of `distance`.
pub fn cartesian_from_spherical(
    ra_deg: f64,
    dec_deg: f64,
    distance: f64,
) -> na::Vector3<f64> {
    let [x, y, z] = to_unit_vector(ra_deg.to_radians(), dec_deg.to_radians());
    na::Vector3::new(x, y, z) * distance
}

/// Inverse of cartesian_from_spherical(). Returns (ra_deg, dec_deg,
/// distance), ra in [0, 360). A zero vector has no direction; the returned
/// angles are then NaN.
pub fn spherical_from_cartesian(v: &na::Vector3<f64>) -> (f64, f64, f64) {
    let distance = v.norm();
    let unit = v / distance;
    let (ra, dec) = from_unit_vector(&[unit.x, unit.y, unit.z]);
    (normalize_degrees(ra.to_degrees()), dec.to_degrees(), distance)
}

/// Maps an angle in degrees to [0, 360).
pub fn normalize_degrees(angle: f64) -> f64 {
    let wrapped = angle.rem_euclid(360.0);
    // rem_euclid() can round up to exactly 360 for tiny negative inputs.
    if wrapped >= 360.0 {
        0.0
    } else {
        wrapped
    }
}

/// Returns the separation, in radians, between the given celestial coordinates
/// (in radians). Result is in 0..=PI, also for (nearly) coincident or
/// antipodal points.
pub fn angular_separation(
    p0_ra: f64,
    p0_dec: f64,
    p1_ra: f64,
    p1_dec: f64,
) -> f64 {
    let v0 = na::Vector3::from(to_unit_vector(p0_ra, p0_dec));
    let v1 = na::Vector3::from(to_unit_vector(p1_ra, p1_dec));
    v0.angle(&v1)
}

/// Parallax (milliarcseconds) to distance (parsecs), using the flat
/// 1/parallax model. Returns None for non-positive or non-finite parallax.
pub fn distance_from_parallax(parallax_mas: f64) -> Option<f64> {
    if parallax_mas.is_finite() && parallax_mas > 0.0 {
        Some(1000.0 / parallax_mas)
    } else {
        None
    }
}

/// Display color for a star given its Gaia color indices, as "#RRGGBB".
/// Redder stars (large BP-RP) get more red; G-RP and BP-G pull green and
/// blue down respectively.
pub fn color_from_indices(bp_rp: f64, g_rp: f64, bp_g: f64) -> String {
    fn normalize(value: f64, min: f64, max: f64) -> f64 {
        (value - min) / (max - min)
    }
    fn channel(fraction: f64) -> u8 {
        (fraction * 255.0).round().clamp(0.0, 255.0) as u8
    }
    let red = channel(normalize(bp_rp, -0.5, 3.0));
    let green = channel(1.0 - normalize(g_rp, 0.0, 2.5));
    let blue = channel(1.0 - normalize(bp_g, 0.0, 1.5));
    format!("#{:02X}{:02X}{:02X}", red, green, blue)
}

// mod tests.

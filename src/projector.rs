// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Re-expresses catalog stars in the sky frame of a chosen observer.
//!
//! Stars and observer are both placed in a common Cartesian frame centered on
//! the Sun, the observer vector is subtracted, and the result is converted
//! back to spherical coordinates. Angles cannot simply be differenced: the
//! spherical representation is not closed under translation.

use std::str::FromStr;

use canonical_error::{CanonicalError, invalid_argument_error,
                      not_found_error};
use log::debug;
use rayon::prelude::*;
use serde::Serialize;

use crate::astro_util::{angular_separation, cartesian_from_spherical,
                        color_from_indices, distance_from_parallax,
                        spherical_from_cartesian};
use crate::catalog::{Catalog, ExoplanetRecord, StarRecord};

extern crate nalgebra as na;

/// Relative distances (parsecs) at or below this are treated as the star
/// coinciding with the observer.
pub const MIN_RELATIVE_DISTANCE: f64 = 1e-9;

/// Below this many stars the projection is not worth spreading over threads.
const PARALLEL_THRESHOLD: usize = 4096;

/// Who is looking. Spherical position in degrees and parsecs, relative to
/// the solar system.
#[derive(Clone, Debug, PartialEq)]
pub enum ObserverFrame {
    Earth,
    Exoplanet(ExoplanetRecord),
}

impl ObserverFrame {
    /// (ra_deg, dec_deg, distance_pc) of the observer.
    pub fn position(&self) -> (f64, f64, f64) {
        match self {
            ObserverFrame::Earth => (0.0, 0.0, 0.0),
            ObserverFrame::Exoplanet(planet) =>
                (planet.ra_deg, planet.dec_deg, planet.distance_pc),
        }
    }

    fn cartesian(&self) -> na::Vector3<f64> {
        match self {
            ObserverFrame::Earth => na::Vector3::zeros(),
            ObserverFrame::Exoplanet(planet) => cartesian_from_spherical(
                planet.ra_deg, planet.dec_deg, planet.distance_pc),
        }
    }
}

/// Parsed form of the location path segment: "earth" or an exoplanet id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObserverId {
    Earth,
    Exoplanet(usize),
}

impl FromStr for ObserverId {
    type Err = CanonicalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("earth") {
            return Ok(ObserverId::Earth);
        }
        let digits = s.strip_prefix(['+', '-']).unwrap_or(s);
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid_argument_error(
                format!("Location must be 'earth' or an exoplanet id; got '{}'",
                        s).as_str()));
        }
        // Well-formed integers that cannot index the catalog (negative or
        // too large) name no exoplanet.
        s.parse::<usize>().map(ObserverId::Exoplanet).map_err(|_| {
            not_found_error(format!("No exoplanet with id {}", s).as_str())
        })
    }
}

impl ObserverId {
    /// NotFound if the id names no loaded exoplanet.
    pub fn resolve(self, catalog: &Catalog)
                   -> Result<ObserverFrame, CanonicalError> {
        match self {
            ObserverId::Earth => Ok(ObserverFrame::Earth),
            ObserverId::Exoplanet(id) =>
                Ok(ObserverFrame::Exoplanet(catalog.exoplanet(id)?.clone())),
        }
    }
}

/// A catalog star as seen by the observer. Field names on the wire are the
/// ones the viewer consumes.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProjectedStar {
    #[serde(rename = "ra")]
    pub ra_deg: f64,
    #[serde(rename = "dec")]
    pub dec_deg: f64,
    #[serde(rename = "distance")]
    pub distance_pc: f64,
    #[serde(rename = "brightness")]
    pub mag_g: f64,
    pub bp_rp: f64,
    pub g_rp: f64,
    pub bp_g: f64,
    pub color: String,
}

#[derive(Clone, Copy, Debug)]
pub struct Projector {
    // Degrees. Stars further than this from the observer's forward direction
    // are dropped; 180 keeps everything.
    max_separation_deg: f64,
}

impl Default for Projector {
    fn default() -> Self {
        Projector { max_separation_deg: 180.0 }
    }
}

impl Projector {
    pub fn new(max_separation_deg: f64) -> Result<Self, CanonicalError> {
        if !(max_separation_deg > 0.0 && max_separation_deg <= 180.0) {
            return Err(invalid_argument_error(
                format!("max_separation must be in (0, 180]; got {}",
                        max_separation_deg).as_str()));
        }
        Ok(Projector { max_separation_deg })
    }

    pub fn max_separation_deg(&self) -> f64 {
        self.max_separation_deg
    }

    /// Projects every usable star into the observer's frame. Output is in
    /// catalog order; stars failing accepts() are left out.
    pub fn project(&self, stars: &[StarRecord], observer: &ObserverFrame)
                   -> Vec<ProjectedStar> {
        let observer_vector = observer.cartesian();
        let (forward_ra, forward_dec, _) = observer.position();
        let forward = (forward_ra.to_radians(), forward_dec.to_radians());

        let project_one =
            |star: &StarRecord| self.project_star(star, &observer_vector, forward);
        let projected: Vec<ProjectedStar> = if stars.len() >= PARALLEL_THRESHOLD {
            stars.par_iter().filter_map(project_one).collect()
        } else {
            stars.iter().filter_map(project_one).collect()
        };
        debug!("Projected {} of {} stars for observer at {:?}",
               projected.len(), stars.len(), observer.position());
        projected
    }

    fn project_star(&self, star: &StarRecord,
                    observer_vector: &na::Vector3<f64>,
                    forward: (f64, f64)) -> Option<ProjectedStar> {
        let distance = distance_from_parallax(star.parallax_mas)?;
        let star_vector =
            cartesian_from_spherical(star.ra_deg, star.dec_deg, distance);
        let (ra, dec, rel_distance) =
            spherical_from_cartesian(&(star_vector - observer_vector));

        let projected = ProjectedStar {
            ra_deg: ra,
            dec_deg: dec,
            distance_pc: rel_distance,
            mag_g: star.mag_g,
            bp_rp: star.bp_rp,
            g_rp: star.g_rp,
            bp_g: star.bp_g,
            color: String::new(),
        };
        if !self.accepts(&projected, forward) {
            return None;
        }
        Some(ProjectedStar {
            color: color_from_indices(star.bp_rp, star.g_rp, star.bp_g),
            ..projected
        })
    }

    /// Routine data-quality filter. Rejects non-finite geometry or photometry,
    /// stars coincident with the observer (no defined direction), and stars
    /// outside the separation cutoff around `forward` (ra, dec radians).
    pub fn accepts(&self, star: &ProjectedStar, forward: (f64, f64)) -> bool {
        let finite = [star.ra_deg, star.dec_deg, star.distance_pc,
                      star.mag_g, star.bp_rp, star.g_rp, star.bp_g]
            .iter().all(|v| v.is_finite());
        if !finite || star.distance_pc <= MIN_RELATIVE_DISTANCE {
            return false;
        }
        if self.max_separation_deg >= 180.0 {
            return true;
        }
        let separation = angular_separation(
            forward.0, forward.1,
            star.ra_deg.to_radians(), star.dec_deg.to_radians());
        separation.to_degrees() <= self.max_separation_deg
    }
}

// mod tests.

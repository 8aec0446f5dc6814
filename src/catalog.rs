// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Star catalog and exoplanet list, loaded once at startup and immutable
//! thereafter.

use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use canonical_error::{CanonicalError, failed_precondition_error,
                      not_found_error};
use log::{debug, info};
use serde::{Deserialize, Serialize};

/// Columns that must be present in the star catalog file.
pub const STAR_COLUMNS: [&str; 7] =
    ["ra", "dec", "parallax", "phot_g_mean_mag", "bp_rp", "g_rp", "bp_g"];

/// Columns that must be present in the exoplanet file.
pub const EXOPLANET_COLUMNS: [&str; 4] = ["pl_name", "ra", "dec", "sy_dist"];

/// One row of the star survey. Angles in degrees, parallax in milliarcseconds.
/// Photometric values that were absent in the source are NaN.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StarRecord {
    pub ra_deg: f64,
    pub dec_deg: f64,
    pub parallax_mas: f64,
    pub mag_g: f64,
    pub bp_rp: f64,
    pub g_rp: f64,
    pub bp_g: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ExoplanetRecord {
    pub id: usize,
    pub name: String,
    #[serde(rename = "ra")]
    pub ra_deg: f64,
    #[serde(rename = "dec")]
    pub dec_deg: f64,
    #[serde(rename = "distance")]
    pub distance_pc: f64,
}

// Gaia export row. Empty cells become None; text that is not a number is an
// error.
#[derive(Debug, Deserialize)]
struct GaiaRow {
    ra: f64,
    dec: f64,
    parallax: Option<f64>,
    phot_g_mean_mag: Option<f64>,
    bp_rp: Option<f64>,
    g_rp: Option<f64>,
    bp_g: Option<f64>,
}

// Exoplanet archive row. Any unusable value makes the row ineligible rather
// than failing the load.
#[derive(Debug, Deserialize)]
struct ExoplanetRow {
    pl_name: Option<String>,
    #[serde(deserialize_with = "csv::invalid_option")]
    ra: Option<f64>,
    #[serde(deserialize_with = "csv::invalid_option")]
    dec: Option<f64>,
    #[serde(deserialize_with = "csv::invalid_option")]
    sy_dist: Option<f64>,
}

#[derive(Debug)]
pub struct Catalog {
    stars: Vec<StarRecord>,
    exoplanets: Vec<ExoplanetRecord>,
}

impl Catalog {
    pub fn new(stars: Vec<StarRecord>,
               exoplanets: Vec<ExoplanetRecord>) -> Self {
        Catalog { stars, exoplanets }
    }

    /// Loads both input files. Any error here means the server cannot start.
    pub fn load(stars_path: &Path, exoplanets_path: &Path)
                -> Result<Self, CanonicalError> {
        let stars = load_stars(stars_path)?;
        let exoplanets = load_exoplanets(exoplanets_path)?;
        info!("Loaded {} stars from {:?} and {} exoplanets from {:?}",
              stars.len(), stars_path, exoplanets.len(), exoplanets_path);
        Ok(Catalog::new(stars, exoplanets))
    }

    pub fn stars(&self) -> &[StarRecord] {
        &self.stars
    }

    pub fn exoplanets(&self) -> &[ExoplanetRecord] {
        &self.exoplanets
    }

    /// Returns NotFound if no loaded exoplanet has the given id.
    pub fn exoplanet(&self, id: usize)
                     -> Result<&ExoplanetRecord, CanonicalError> {
        // Ids are assigned densely in load order.
        self.exoplanets.get(id).ok_or_else(|| not_found_error(
            format!("No exoplanet with id {}; {} are loaded",
                    id, self.exoplanets.len()).as_str()))
    }
}

fn open_source(path: &Path) -> Result<File, CanonicalError> {
    File::open(path).map_err(|e| not_found_error(
        format!("Could not open {:?}: {}", path, e).as_str()))
}

fn check_columns(headers: &csv::StringRecord, required: &[&str],
                 what: &str) -> Result<(), CanonicalError> {
    let missing: Vec<&str> = required.iter()
        .filter(|column| !headers.iter().any(|h| h.trim() == **column))
        .copied()
        .collect();
    if !missing.is_empty() {
        return Err(failed_precondition_error(
            format!("{} is missing column(s) {:?}", what, missing).as_str()));
    }
    Ok(())
}

pub fn load_stars(path: &Path) -> Result<Vec<StarRecord>, CanonicalError> {
    read_stars(open_source(path)?)
}

/// Parses a Gaia CSV export. Fails if a required column is absent or any cell
/// in a required column is malformed.
pub fn read_stars<R: Read>(source: R)
                           -> Result<Vec<StarRecord>, CanonicalError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(source);
    let headers = reader.headers().map_err(|e| failed_precondition_error(
        format!("Could not read star catalog header: {}", e).as_str()))?;
    check_columns(headers, &STAR_COLUMNS, "Star catalog")?;

    let mut stars = Vec::new();
    for result in reader.deserialize::<GaiaRow>() {
        let row = result.map_err(|e| failed_precondition_error(
            format!("Malformed star catalog row: {}", e).as_str()))?;
        stars.push(StarRecord {
            ra_deg: row.ra,
            dec_deg: row.dec,
            parallax_mas: row.parallax.unwrap_or(f64::NAN),
            mag_g: row.phot_g_mean_mag.unwrap_or(f64::NAN),
            bp_rp: row.bp_rp.unwrap_or(f64::NAN),
            g_rp: row.g_rp.unwrap_or(f64::NAN),
            bp_g: row.bp_g.unwrap_or(f64::NAN),
        });
    }
    Ok(stars)
}

pub fn load_exoplanets(path: &Path)
                       -> Result<Vec<ExoplanetRecord>, CanonicalError> {
    read_exoplanets(open_source(path)?)
}

/// Parses an exoplanet archive CSV export; `#` lines are comments. Rows with a
/// missing name, position or distance, a non-finite distance, or a name seen
/// earlier in the file are dropped. Survivors are numbered from 0 in file
/// order.
pub fn read_exoplanets<R: Read>(source: R)
                                -> Result<Vec<ExoplanetRecord>, CanonicalError> {
    let mut reader = csv::ReaderBuilder::new()
        .comment(Some(b'#'))
        .trim(csv::Trim::All)
        .from_reader(source);
    let headers = reader.headers().map_err(|e| failed_precondition_error(
        format!("Could not read exoplanet header: {}", e).as_str()))?;
    check_columns(headers, &EXOPLANET_COLUMNS, "Exoplanet list")?;

    let mut seen_names = HashSet::<String>::new();
    let mut exoplanets = Vec::<ExoplanetRecord>::new();
    let mut dropped = 0;
    for result in reader.deserialize::<ExoplanetRow>() {
        let row = result.map_err(|e| failed_precondition_error(
            format!("Malformed exoplanet row: {}", e).as_str()))?;
        let (Some(name), Some(ra), Some(dec), Some(distance)) =
            (row.pl_name, row.ra, row.dec, row.sy_dist) else {
                dropped += 1;
                continue;
            };
        if name.is_empty() || !ra.is_finite() || !dec.is_finite()
            || !distance.is_finite() {
            dropped += 1;
            continue;
        }
        if !seen_names.insert(name.clone()) {
            dropped += 1;
            continue;
        }
        exoplanets.push(ExoplanetRecord {
            id: exoplanets.len(),
            name,
            ra_deg: ra,
            dec_deg: dec,
            distance_pc: distance,
        });
    }
    if dropped > 0 {
        debug!("Dropped {} incomplete or duplicate exoplanet rows", dropped);
    }
    Ok(exoplanets)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use canonical_error::CanonicalErrorCode;

    use super::*;

    const STARS_CSV: &str = "\
source_id,ra,dec,parallax,phot_g_mean_mag,bp_rp,g_rp,bp_g,random_index
1,10.5,20.25,500.0,5.1,0.8,0.5,0.3,17
2,200.0,-45.0,-0.2,6.0,1.1,0.6,0.5,3
3,300.0,10.0,2.0,6.5,,0.7,0.4,99
";

    const EXOPLANETS_CSV: &str = "\
# This file was produced by the NASA Exoplanet Archive
# COLUMN pl_name: Planet Name
pl_name,hostname,ra,dec,sy_dist
Proxima Cen b,Proxima Cen,217.4292,-62.6795,1.295
Proxima Cen b,Proxima Cen,1.0,2.0,3.0
eps Eri b,eps Eri,53.2327,-9.4583,3.2
Missing Distance,Nobody,10.0,10.0,
Bad Distance,Nobody,10.0,10.0,inf
Bad Position,Nobody,nan,inf,2.0
,Nameless,1.0,1.0,1.0
GJ 674 b,GJ 674,262.5469,-46.8993,4.55
";

    #[test]
    fn test_read_stars() {
        let stars = read_stars(STARS_CSV.as_bytes()).unwrap();
        assert_eq!(stars.len(), 3);
        assert_eq!(stars[0], StarRecord {
            ra_deg: 10.5, dec_deg: 20.25, parallax_mas: 500.0,
            mag_g: 5.1, bp_rp: 0.8, g_rp: 0.5, bp_g: 0.3,
        });
        // Non-positive parallax is kept at load time; the projector drops it.
        assert_eq!(stars[1].parallax_mas, -0.2);
        // Empty photometry is NaN.
        assert!(stars[2].bp_rp.is_nan());
        assert_eq!(stars[2].g_rp, 0.7);
    }

    #[test]
    fn test_read_stars_missing_column() {
        let csv = "ra,dec,parallax,phot_g_mean_mag,bp_rp,g_rp\n1,2,3,4,5,6\n";
        let err = read_stars(csv.as_bytes()).unwrap_err();
        assert!(err.code == CanonicalErrorCode::FailedPrecondition);
        assert!(err.message.contains("bp_g"));
    }

    #[test]
    fn test_read_stars_malformed_cell() {
        let csv = "ra,dec,parallax,phot_g_mean_mag,bp_rp,g_rp,bp_g\n\
                   1,2,three,4,5,6,7\n";
        let err = read_stars(csv.as_bytes()).unwrap_err();
        assert!(err.code == CanonicalErrorCode::FailedPrecondition);
    }

    #[test]
    fn test_read_exoplanets_dedup_and_filter() {
        let planets = read_exoplanets(EXOPLANETS_CSV.as_bytes()).unwrap();
        let names: Vec<&str> = planets.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["Proxima Cen b", "eps Eri b", "GJ 674 b"]);

        // First occurrence wins.
        assert_eq!(planets[0].ra_deg, 217.4292);
        assert_eq!(planets[0].distance_pc, 1.295);

        // Ids are contiguous in file order.
        let ids: Vec<usize> = planets.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn test_read_exoplanets_missing_column() {
        let csv = "pl_name,ra,dec\nfoo,1,2\n";
        let err = read_exoplanets(csv.as_bytes()).unwrap_err();
        assert!(err.code == CanonicalErrorCode::FailedPrecondition);
        assert!(err.message.contains("sy_dist"));
    }

    #[test]
    fn test_exoplanet_lookup() {
        let planets = read_exoplanets(EXOPLANETS_CSV.as_bytes()).unwrap();
        let catalog = Catalog::new(Vec::new(), planets);
        assert_eq!(catalog.exoplanet(1).unwrap().name, "eps Eri b");
        let err = catalog.exoplanet(99999).unwrap_err();
        assert!(err.code == CanonicalErrorCode::NotFound);
    }

    #[test]
    fn test_load_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let stars_path = dir.path().join("stars.csv");
        let planets_path = dir.path().join("planets.csv");
        File::create(&stars_path).unwrap()
            .write_all(STARS_CSV.as_bytes()).unwrap();
        File::create(&planets_path).unwrap()
            .write_all(EXOPLANETS_CSV.as_bytes()).unwrap();

        let catalog = Catalog::load(&stars_path, &planets_path).unwrap();
        assert_eq!(catalog.stars().len(), 3);
        assert_eq!(catalog.exoplanets().len(), 3);

        let err = Catalog::load(&dir.path().join("absent.csv"), &planets_path)
            .unwrap_err();
        assert!(err.code == CanonicalErrorCode::NotFound);
    }
}  // mod tests.

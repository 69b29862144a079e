/**
 * Reads the engine's solution file. Records are RTKLIB llh lines with an
 * hms time stamp:
 *
 * date time lat lon height Q ns sdn sde sdu sdne sdeu sdun age ratio
 */
use std::fs;
use std::path::Path;

use chrono::NaiveDateTime;
use enum_primitive::FromPrimitive;

use crate::coordinates::Coordinates;
use crate::receiver::{AcquisitionResult, Quality};

const MINIMUM_FIELDS: usize = 6;
const EPOCH_FORMAT: &str = "%Y/%m/%d %H:%M:%S%.f";

enum_from_primitive! {
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SolutionStatus {
    Fix = 1,
    Float = 2,
    Sbas = 3,
    Dgps = 4,
    Single = 5,
    Ppp = 6,
}
}


impl SolutionStatus {
    /**
     * Only the differential solutions are useful; anything else means the
     * engine hasn't converged yet.
     */
    pub fn quality(&self) -> Option<Quality> {
        match *self {
            SolutionStatus::Fix => Some(Quality::Fix),
            SolutionStatus::Float => Some(Quality::Float),
            _ => None,
        }
    }
}


/**
 * A single epoch record, whatever its status.
 */
#[derive(Clone, Debug, PartialEq)]
pub struct SolutionRecord {
    pub epoch: Option<NaiveDateTime>,
    pub coordinates: Coordinates,
    pub status: Option<SolutionStatus>,
    pub satellites: Option<u32>,
}


impl SolutionRecord {
    pub fn parse(line: &str) -> Option<SolutionRecord> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < MINIMUM_FIELDS {
            return None;
        }
        let lat: f64 = fields[2].parse().ok()?;
        let lon: f64 = fields[3].parse().ok()?;
        let alt: f64 = fields[4].parse().ok()?;
        let status_code: i32 = fields[5].parse().ok()?;
        let epoch = NaiveDateTime::parse_from_str(&format!("{} {}", fields[0], fields[1]), EPOCH_FORMAT).ok();
        Some(SolutionRecord {
            epoch: epoch,
            coordinates: Coordinates::new(lat, lon, alt),
            status: SolutionStatus::from_i32(status_code),
            satellites: fields.get(6).and_then(|s| s.parse().ok()),
        })
    }

    pub fn to_result(&self) -> Option<AcquisitionResult> {
        let quality = self.status?.quality()?;
        Some(AcquisitionResult {
            coordinates: self.coordinates,
            quality: quality,
            satellites: self.satellites,
            epoch: self.epoch,
        })
    }
}


fn is_data_line(line: &str) -> bool {
    let trimmed = line.trim();
    !trimmed.is_empty() && !trimmed.starts_with('%')
}


/**
 * Returns the most recent record in the file, skipping comments, blank lines
 * and a partially written last line.
 */
pub fn latest_record(path: &Path) -> Option<SolutionRecord> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(_) => return None,
    };
    contents.lines()
        .rev()
        .filter(|line| is_data_line(line))
        .filter_map(SolutionRecord::parse)
        .next()
}


/**
 * The latest epoch as a usable result, or None when the file is missing or
 * the latest epoch is neither FIX nor FLOAT.
 */
pub fn read_solution(path: &Path) -> Option<AcquisitionResult> {
    latest_record(path).and_then(|record| record.to_result())
}

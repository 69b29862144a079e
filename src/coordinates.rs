use std::cmp::Ordering;
use std::fmt;

use num::Float;
use serde::{Deserialize, Serialize};

pub type Degrees = f64;
pub type Meters = f64;


/**
 * A geodetic position. Positions are replaced wholesale, never adjusted in
 * place.
 */
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: Degrees,
    pub lon: Degrees,
    pub alt: Meters,
}


impl Coordinates {
    pub fn new(lat: Degrees, lon: Degrees, alt: Meters) -> Coordinates {
        Coordinates { lat: lat, lon: lon, alt: alt }
    }

    /**
     * Per-axis median of a set of samples. Returns None for an empty set.
     */
    pub fn median(samples: &[Coordinates]) -> Option<Coordinates> {
        let lats: Vec<Degrees> = samples.iter().map(|c| c.lat).collect();
        let lons: Vec<Degrees> = samples.iter().map(|c| c.lon).collect();
        let alts: Vec<Meters> = samples.iter().map(|c| c.alt).collect();
        Some(Coordinates {
            lat: median(&lats)?,
            lon: median(&lons)?,
            alt: median(&alts)?,
        })
    }
}


impl fmt::Display for Coordinates {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Lat: {:.8}, Lon: {:.8}, Alt: {:.3}", self.lat, self.lon, self.alt)
    }
}


/**
 * Median of a slice of floats. Even lengths average the two middle values.
 */
pub fn median<T: Float>(values: &[T]) -> Option<T> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    let middle = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        Some(sorted[middle])
    } else {
        let two = T::one() + T::one();
        Some((sorted[middle - 1] + sorted[middle]) / two)
    }
}


/**
 * Converts a NMEA DDMM.MMMM or DDDMM.MMMM value to decimal degrees.
 */
pub fn ddmm_to_degrees(raw: f64) -> Degrees {
    let degrees = (raw / 100.0).floor();
    degrees + (raw - 100.0 * degrees) / 60.0
}

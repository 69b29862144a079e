/**
 * Decodes NMEA position sentences from a receiver's stream.
 */

use crate::coordinates::{ddmm_to_degrees, Coordinates, Degrees, Meters};

const MINIMUM_GGA_FIELDS: usize = 10;


/**
 * GGA: Global positioning system fix data.
 */
#[derive(Debug, PartialEq)]
pub struct GgaMessage {
    pub latitude_degrees: Degrees,
    pub longitude_degrees: Degrees,
    pub fix_quality: u8,
    pub satellites_used: Option<u8>,
    pub horizontal_dilution_of_precision: Option<f32>,
    pub altitude_m: Meters,
}


macro_rules! bail_err {
    ($result:expr) => (
        match $result {
            Ok(s) => s,
            Err(_) => return None,
        }
    );
}


impl GgaMessage {
    /**
     * Parses any talker's GGA sentence, e.g.
     * $GNGGA,hhmmss.ss,ddmm.mmmm,a,dddmm.mmmm,a,x,xx,x.x,x.x,M,x.x,M,,*hh
     * Returns None for malformed sentences and for sentences without a fix.
     */
    pub fn parse(sentence: &str) -> Option<GgaMessage> {
        let fields: Vec<&str> = sentence.trim().split(',').collect();
        if fields.len() < MINIMUM_GGA_FIELDS {
            return None;
        }

        let fix_quality: u8 = bail_err!(fields[6].trim().parse());
        if fix_quality == 0 {
            return None;
        }

        let latitude_degrees = {
            let raw: f64 = bail_err!(fields[2].parse());
            let d = ddmm_to_degrees(raw);
            if fields[3] == "S" { -d } else { d }
        };

        let longitude_degrees = {
            let raw: f64 = bail_err!(fields[4].parse());
            let d = ddmm_to_degrees(raw);
            if fields[5] == "W" { -d } else { d }
        };

        let altitude_m: f64 = bail_err!(fields[9].parse());

        Some(
            GgaMessage {
                latitude_degrees: latitude_degrees,
                longitude_degrees: longitude_degrees,
                fix_quality: fix_quality,
                satellites_used: fields[7].parse().ok(),
                horizontal_dilution_of_precision: fields[8].parse().ok(),
                altitude_m: altitude_m,
            }
        )
    }

    pub fn coordinates(&self) -> Coordinates {
        Coordinates::new(self.latitude_degrees, self.longitude_degrees, self.altitude_m)
    }
}


/**
 * Returns the position carried by a GGA sentence, or None if the sentence is
 * invalid or reports no fix.
 */
pub fn decode_position_sentence(sentence: &str) -> Option<Coordinates> {
    GgaMessage::parse(sentence).map(|gga| gga.coordinates())
}


/**
 * True for lines the Base acquirer should hand to the decoder.
 */
pub fn is_position_sentence(line: &str) -> bool {
    line.starts_with('$') && line.contains("GGA")
}


/**
 * Accumulates raw stream bytes and splits them into complete lines.
 */
pub struct LineBuffer {
    pending: String,
}


impl LineBuffer {
    pub fn new() -> LineBuffer {
        LineBuffer { pending: String::new() }
    }

    /**
     * Appends a chunk and returns every line it completed, trimmed. Bytes
     * that aren't ASCII are dropped.
     */
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend(chunk.iter().filter(|b| b.is_ascii()).map(|b| *b as char));
        let mut lines = Vec::new();
        while let Some(index) = self.pending.find('\n') {
            let line: String = self.pending.drain(..index + 1).collect();
            lines.push(line.trim().to_string());
        }
        lines
    }
}

/**
 * Positions the Base by sampling GGA sentences from its live stream.
 */
use std::io::{ErrorKind, Read};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use crate::coordinates::Coordinates;
use crate::error::{Error, Result};
use crate::nmea::{decode_position_sentence, is_position_sentence, LineBuffer};
use crate::poll::{poll_until, Shutdown, Step};
use crate::stream_verifier::resolve;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Silence longer than this ends sampling.
const READ_TIMEOUT: Duration = Duration::from_secs(10);
/// Longest single blocking read, so a shutdown request is noticed.
const READ_SLICE: Duration = Duration::from_millis(250);


enum StreamEnd {
    TargetReached,
    Closed,
    Silent,
    Failed(String),
    Cancelled,
}


/**
 * Collects up to `target_samples` valid positions, stopping early when the
 * stream closes or goes silent, and returns their per-axis median. Failures
 * are reported once and never retried here.
 */
pub fn acquire_base_position(
    serial: &str,
    address: &str,
    port: u16,
    timeout: Duration,
    target_samples: usize,
    shutdown: &Shutdown,
) -> Result<Coordinates> {
    info!("Acquiring Base position (target: {} samples)", target_samples);

    let socket_address = match resolve(address, port) {
        Some(socket_address) => socket_address,
        None => return Err(Error::acquisition(serial, format!("unable to resolve {}:{}", address, port))),
    };
    let mut stream = match TcpStream::connect_timeout(&socket_address, CONNECT_TIMEOUT.min(timeout)) {
        Ok(stream) => stream,
        Err(e) => return Err(Error::acquisition(serial, format!("unable to connect to {}: {}", socket_address, e))),
    };

    let mut samples: Vec<Coordinates> = Vec::with_capacity(target_samples);
    let mut lines = LineBuffer::new();
    let mut chunk = [0u8; 1024];
    let mut last_data = Instant::now();

    let end = poll_until(Duration::from_secs(0), timeout, |remaining| {
        if shutdown.is_requested() {
            return Step::Ready(StreamEnd::Cancelled);
        }
        if samples.len() >= target_samples {
            return Step::Ready(StreamEnd::TargetReached);
        }
        if remaining == Duration::from_secs(0) {
            return Step::Pending;
        }
        match stream.set_read_timeout(Some(READ_SLICE.min(remaining))) {
            Ok(_) => (),
            Err(e) => return Step::Ready(StreamEnd::Failed(e.to_string())),
        }
        let bytes_read = match stream.read(&mut chunk) {
            Ok(0) => return Step::Ready(StreamEnd::Closed),
            Ok(bytes_read) => bytes_read,
            Err(e) => return match e.kind() {
                ErrorKind::Interrupted => Step::Pending,
                ErrorKind::WouldBlock | ErrorKind::TimedOut => if last_data.elapsed() >= READ_TIMEOUT {
                    Step::Ready(StreamEnd::Silent)
                } else {
                    Step::Pending
                },
                _ => Step::Ready(StreamEnd::Failed(e.to_string())),
            },
        };
        last_data = Instant::now();

        for line in lines.push(&chunk[..bytes_read]) {
            if samples.len() >= target_samples {
                break;
            }
            if !is_position_sentence(&line) {
                continue;
            }
            match decode_position_sentence(&line) {
                Some(coordinates) => {
                    samples.push(coordinates);
                    info!(
                        "[BASE_STATUS] Sample {}/{}: {:.6}, {:.6}, {:.2}",
                        samples.len(),
                        target_samples,
                        coordinates.lat,
                        coordinates.lon,
                        coordinates.alt);
                },
                None => debug!("Skipping sentence without a fix: {}", line),
            }
        }
        if samples.len() >= target_samples {
            Step::Ready(StreamEnd::TargetReached)
        } else {
            Step::Pending
        }
    });

    match end {
        Some(StreamEnd::TargetReached) => (),
        Some(StreamEnd::Cancelled) => {
            warn!("Base acquisition cancelled after {} samples", samples.len());
            return Err(Error::Cancelled);
        },
        Some(StreamEnd::Closed) => warn!("Base stream closed after {} samples", samples.len()),
        Some(StreamEnd::Silent) => warn!("Base stream went silent after {} samples", samples.len()),
        Some(StreamEnd::Failed(reason)) => {
            if samples.is_empty() {
                return Err(Error::acquisition(serial, format!("socket error: {}", reason)));
            }
            warn!("Base stream failed after {} samples: {}", samples.len(), reason);
        },
        None => warn!("Base acquisition timed out after {} samples", samples.len()),
    }

    match Coordinates::median(&samples) {
        Some(median) => {
            info!("Base median over {} samples: {}", samples.len(), median);
            Ok(median)
        },
        None => Err(Error::acquisition(serial, "no valid position samples received")),
    }
}

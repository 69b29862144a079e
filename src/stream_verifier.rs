/**
 * Probes a receiver endpoint and classifies the protocol it is streaming.
 */
use std::fmt;
use std::io::{ErrorKind, Read};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::receiver::Endpoint;

const PROBE_BUFFER_SIZE: usize = 1024;
const PROBE_HEADER_SIZE: usize = 32;
const NMEA_SCAN_WINDOW: usize = 256;
const NMEA_TALKERS: [&str; 4] = ["$GP", "$GN", "$GL", "$GA"];


#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// u-blox binary.
    Ubx,
    Rtcm3,
    /// Decoded NMEA sentences.
    Nmea,
    /// An SSH banner, i.e. the management port was configured instead of the data port.
    Ssh,
    Unknown,
    /// Connected but nothing was sent before the peer closed.
    Empty,
    Timeout,
    Error,
}


impl Protocol {
    pub fn tag(&self) -> &'static str {
        match *self {
            Protocol::Ubx => "UBX",
            Protocol::Rtcm3 => "RTCM3",
            Protocol::Nmea => "NMEA",
            Protocol::Ssh => "SSH",
            Protocol::Unknown => "UNKNOWN",
            Protocol::Empty => "EMPTY",
            Protocol::Timeout => "TIMEOUT",
            Protocol::Error => "ERROR",
        }
    }

    pub fn is_unreachable(&self) -> bool {
        *self == Protocol::Error || *self == Protocol::Timeout
    }
}


impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.tag())
    }
}


/**
 * Classifies the first bytes read from a stream.
 */
pub fn classify(data: &[u8]) -> Protocol {
    if data.is_empty() {
        return Protocol::Empty;
    }
    if data.starts_with(&[0xB5, 0x62]) {
        return Protocol::Ubx;
    }
    if data[0] == 0xD3 {
        return Protocol::Rtcm3;
    }
    if data.starts_with(b"SSH-") {
        return Protocol::Ssh;
    }
    // Streams joined mid-sentence can have leading garbage, so scan a window
    let window = &data[..data.len().min(NMEA_SCAN_WINDOW)];
    let text = String::from_utf8_lossy(window);
    if NMEA_TALKERS.iter().any(|talker| text.contains(talker)) {
        return Protocol::Nmea;
    }
    Protocol::Unknown
}


/**
 * What a probe saw: the classification and up to `PROBE_HEADER_SIZE` of the
 * bytes it was based on.
 */
#[derive(Clone, Debug, PartialEq)]
pub struct ProbeResult {
    pub protocol: Protocol,
    pub header: Vec<u8>,
}


impl ProbeResult {
    fn failed(protocol: Protocol) -> ProbeResult {
        ProbeResult { protocol: protocol, header: Vec::new() }
    }
}


/**
 * Connects to the endpoint, reads one chunk and classifies it. The probe
 * connection is always closed before returning.
 */
pub fn probe_stream(address: &str, port: u16, timeout: Duration) -> ProbeResult {
    let socket_address = match resolve(address, port) {
        Some(socket_address) => socket_address,
        None => {
            debug!("Unable to resolve {}:{}", address, port);
            return ProbeResult::failed(Protocol::Error);
        }
    };

    let mut stream = match TcpStream::connect_timeout(&socket_address, timeout) {
        Ok(stream) => stream,
        Err(e) => {
            debug!("Unable to connect to {}: {}", socket_address, e);
            return ProbeResult::failed(match e.kind() {
                ErrorKind::TimedOut | ErrorKind::WouldBlock => Protocol::Timeout,
                _ => Protocol::Error,
            });
        }
    };
    match stream.set_read_timeout(Some(timeout)) {
        Ok(_) => (),
        Err(e) => {
            debug!("Unable to set read timeout on {}: {}", socket_address, e);
            return ProbeResult::failed(Protocol::Error);
        }
    }

    let mut buffer = [0u8; PROBE_BUFFER_SIZE];
    let result = match stream.read(&mut buffer) {
        Ok(bytes_read) => ProbeResult {
            protocol: classify(&buffer[..bytes_read]),
            header: buffer[..bytes_read.min(PROBE_HEADER_SIZE)].to_vec(),
        },
        Err(e) => match e.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => ProbeResult::failed(Protocol::Timeout),
            _ => {
                debug!("Unable to read from {}: {}", socket_address, e);
                ProbeResult::failed(Protocol::Error)
            }
        },
    };
    let _ = stream.shutdown(Shutdown::Both);
    result
}


pub fn detect_protocol(address: &str, port: u16, timeout: Duration) -> Protocol {
    probe_stream(address, port, timeout).protocol
}


/// Space separated hex, e.g. "b5 62 01 07".
pub fn hex_dump(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02x}", b)).collect::<Vec<String>>().join(" ")
}


pub fn resolve(address: &str, port: u16) -> Option<SocketAddr> {
    match (address, port).to_socket_addrs() {
        Ok(mut addresses) => addresses.next(),
        Err(_) => None,
    }
}


/**
 * Source of protocol classifications, so the run can be driven without a
 * network.
 */
pub trait StreamProbe {
    fn probe(&self, endpoint: &Endpoint, timeout: Duration) -> ProbeResult;

    fn detect_protocol(&self, endpoint: &Endpoint, timeout: Duration) -> Protocol {
        self.probe(endpoint, timeout).protocol
    }
}


pub struct TcpProbe;

impl StreamProbe for TcpProbe {
    fn probe(&self, endpoint: &Endpoint, timeout: Duration) -> ProbeResult {
        probe_stream(&endpoint.address, endpoint.port, timeout)
    }
}


/**
 * What the run should do with a unit after verification.
 */
#[derive(Clone, Debug, PartialEq)]
pub enum Gate {
    Proceed,
    Warn(String),
    Exclude(String),
    Abort(String),
}


pub fn gate_base(protocol: Protocol, has_coordinates: bool) -> Gate {
    match protocol {
        Protocol::Ssh => Gate::Abort(
            "SSH banner on the data port, the management port is configured".to_string()),
        Protocol::Error | Protocol::Timeout => if has_coordinates {
            Gate::Warn(format!("unreachable ({}), using stored coordinates", protocol))
        } else {
            Gate::Abort(format!("unreachable ({}) and no stored coordinates", protocol))
        },
        Protocol::Empty | Protocol::Unknown => Gate::Warn(format!("stream is {}", protocol)),
        Protocol::Ubx | Protocol::Rtcm3 | Protocol::Nmea => Gate::Proceed,
    }
}


pub fn gate_rover(protocol: Protocol) -> Gate {
    match protocol {
        Protocol::Ssh => Gate::Exclude(
            "SSH banner on the data port, the management port is configured".to_string()),
        Protocol::Error | Protocol::Timeout => Gate::Exclude(format!("unreachable ({})", protocol)),
        Protocol::Nmea => Gate::Warn(
            "streams NMEA, the engine needs raw UBX/RTCM data".to_string()),
        Protocol::Empty | Protocol::Unknown => Gate::Warn(format!("stream is {}", protocol)),
        Protocol::Ubx | Protocol::Rtcm3 => Gate::Proceed,
    }
}

/**
 * Loads receiver definitions and writes them back with acquired positions.
 *
 * {
 *   "receivers": {
 *     "B-01": {"serial": "B-01", "address": "192.168.1.10", "port": 5010, "role": "base",
 *              "coordinates": {"lat": 45.1, "lon": 9.2, "alt": 130.0}},
 *     "R-17": {"serial": "R-17", "address": "192.168.1.20", "port": 5017, "role": "rover",
 *              "timeout": 120}
 *   }
 * }
 */
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

use chrono::Local;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::coordinates::Coordinates;
use crate::error::{Error, Result};
use crate::receiver::{Base, Quality, Receiver, Role, Rover};

const REQUIRED_FIELDS: [&str; 4] = ["serial", "address", "port", "role"];


#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleName {
    #[serde(alias = "master")]
    Base,
    Rover,
}


/**
 * One receiver as it appears in the file.
 */
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReceiverRecord {
    pub serial: String,
    #[serde(alias = "ip")]
    pub address: String,
    pub port: u16,
    pub role: RoleName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, alias = "coords", skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<Coordinates>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<Quality>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<String>,
}


impl ReceiverRecord {
    pub fn into_receiver(self, default_timeout: Duration) -> Receiver {
        let role = match self.role {
            RoleName::Base => Role::Base(Base),
            RoleName::Rover => Role::Rover(Rover {
                timeout: self.timeout.map(Duration::from_secs).unwrap_or(default_timeout),
            }),
        };
        let mut receiver = Receiver::new(&self.serial, &self.address, self.port, role);
        receiver.coordinates = self.coordinates;
        receiver.quality = self.quality;
        receiver.base = self.base;
        receiver
    }

    pub fn from_receiver(receiver: &Receiver) -> ReceiverRecord {
        let (role, timeout) = match receiver.role {
            Role::Base(_) => (RoleName::Base, None),
            Role::Rover(ref rover) => (RoleName::Rover, Some(rover.timeout.as_secs())),
        };
        ReceiverRecord {
            serial: receiver.serial.clone(),
            address: receiver.endpoint.address.clone(),
            port: receiver.endpoint.port,
            role: role,
            timeout: timeout,
            coordinates: receiver.coordinates,
            quality: receiver.quality,
            base: receiver.base.clone(),
        }
    }
}


fn has_field(entry: &Map<String, Value>, field: &str) -> bool {
    match field {
        "address" => entry.contains_key("address") || entry.contains_key("ip"),
        _ => entry.contains_key(field),
    }
}


/**
 * Field-presence and type checks, with messages naming the offending entry.
 */
fn validate_entry(key: &str, value: &Value) -> Result<()> {
    let entry = match value.as_object() {
        Some(entry) => entry,
        None => return Err(Error::Configuration(format!("receiver '{}' is not an object", key))),
    };
    for field in REQUIRED_FIELDS.iter() {
        if !has_field(entry, field) {
            return Err(Error::Configuration(
                format!("receiver '{}' is missing the required field '{}'", key, field)));
        }
    }
    match entry.get("role").and_then(|role| role.as_str()) {
        Some("base") | Some("master") | Some("rover") => (),
        _ => return Err(Error::Configuration(
            format!("receiver '{}' has an invalid role {}, expected base or rover", key, entry["role"]))),
    }
    match entry.get("port").and_then(|port| port.as_u64()) {
        Some(port) if port >= 1 && port <= 65535 => (),
        _ => return Err(Error::Configuration(
            format!("receiver '{}' port must be an integer in 1-65535, found {}", key, entry["port"]))),
    }
    if let Some(timeout) = entry.get("timeout") {
        match timeout.as_u64() {
            Some(seconds) if seconds > 0 => (),
            _ => return Err(Error::Configuration(
                format!("receiver '{}' timeout must be a positive integer, found {}", key, timeout))),
        }
    }
    Ok(())
}


/**
 * Parses receiver definitions, in file order. Rejects malformed input
 * without touching the network.
 */
pub fn parse_receivers(text: &str, default_timeout: Duration) -> Result<Vec<Receiver>> {
    let document: Value = match serde_json::from_str(text) {
        Ok(document) => document,
        Err(e) => return Err(Error::Configuration(format!("unable to parse receivers: {}", e))),
    };
    let entries = match document.get("receivers") {
        Some(Value::Object(entries)) => entries,
        Some(Value::Null) => return Ok(Vec::new()),
        Some(_) => return Err(Error::Configuration("'receivers' must be a mapping".to_string())),
        None => return Err(Error::Configuration("the file must contain a 'receivers' key".to_string())),
    };
    if entries.is_empty() {
        warn!("The receiver list is empty");
    }

    let mut receivers = Vec::with_capacity(entries.len());
    let mut serials = HashSet::new();
    let mut base_count = 0;
    for (key, value) in entries {
        validate_entry(key, value)?;
        let record: ReceiverRecord = match serde_json::from_value(value.clone()) {
            Ok(record) => record,
            Err(e) => return Err(Error::Configuration(format!("receiver '{}': {}", key, e))),
        };
        if !serials.insert(record.serial.clone()) {
            return Err(Error::Configuration(format!("serial '{}' is defined more than once", record.serial)));
        }
        if record.role == RoleName::Base {
            base_count += 1;
        }
        receivers.push(record.into_receiver(default_timeout));
    }
    if base_count > 1 {
        return Err(Error::Configuration(format!("{} Base receivers configured, at most one is allowed", base_count)));
    }
    info!("Configuration valid: {} receivers found", receivers.len());
    Ok(receivers)
}


pub fn load_receivers(path: &Path, default_timeout: Duration) -> Result<Vec<Receiver>> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => return Err(Error::Configuration(format!("unable to read {}: {}", path.display(), e))),
    };
    parse_receivers(&text, default_timeout)
}


#[derive(Serialize)]
struct StationDocument {
    updated: String,
    receivers: Map<String, Value>,
}


pub fn render_receivers(receivers: &[Receiver]) -> Result<String> {
    let mut entries = Map::new();
    for receiver in receivers {
        let record = ReceiverRecord::from_receiver(receiver);
        entries.insert(receiver.serial.clone(), serde_json::to_value(&record)?);
    }
    let document = StationDocument {
        updated: Local::now().to_rfc3339(),
        receivers: entries,
    };
    Ok(serde_json::to_string_pretty(&document)?)
}


/**
 * Writes the full receiver set. The file is replaced in one step so readers
 * never see a partial document.
 */
pub fn save_receivers(path: &Path, receivers: &[Receiver]) -> Result<()> {
    let text = render_receivers(receivers)?;
    let staging = path.with_extension("partial");
    match fs::write(&staging, text.as_bytes()) {
        Ok(_) => (),
        Err(e) => return Err(Error::io(&staging, e)),
    }
    match fs::rename(&staging, path) {
        Ok(_) => (),
        Err(e) => return Err(Error::io(path, e)),
    }
    info!("Receivers saved to {}", path.display());
    Ok(())
}


#[cfg(test)]
mod tests {
    use std::fs;
    use std::time::Duration;

    use serde_json::Value;
    use tempfile::tempdir;

    use super::{load_receivers, parse_receivers, save_receivers};
    use crate::coordinates::Coordinates;
    use crate::error::Error;
    use crate::receiver::{Quality, Role};

    const DEFAULT_TIMEOUT: Duration = Duration::from_secs(150);

    fn expect_configuration_error(text: &str) -> String {
        match parse_receivers(text, DEFAULT_TIMEOUT) {
            Err(Error::Configuration(message)) => message,
            other => panic!("Expected a configuration error, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_in_file_order() {
        let text = r#"{"receivers": {
            "z-rover": {"serial": "Z", "address": "10.0.0.3", "port": 5003, "role": "rover", "timeout": 60},
            "a-base": {"serial": "A", "ip": "10.0.0.1", "port": 5001, "role": "master",
                       "coords": {"lat": 45.0, "lon": 9.0, "alt": 120.0}},
            "m-rover": {"serial": "M", "address": "10.0.0.2", "port": 5002, "role": "rover"}
        }}"#;
        let receivers = parse_receivers(text, DEFAULT_TIMEOUT).unwrap();
        let serials: Vec<&str> = receivers.iter().map(|r| r.serial.as_str()).collect();
        assert!(serials == vec!["Z", "A", "M"]);
        assert!(receivers[1].is_base());
        assert!(receivers[1].coordinates == Some(Coordinates::new(45.0, 9.0, 120.0)));
        assert!(receivers[1].endpoint.address == "10.0.0.1");
        match receivers[0].role {
            Role::Rover(ref rover) => assert!(rover.timeout == Duration::from_secs(60)),
            _ => panic!("Expected a Rover"),
        }
        match receivers[2].role {
            Role::Rover(ref rover) => assert!(rover.timeout == DEFAULT_TIMEOUT),
            _ => panic!("Expected a Rover"),
        }
    }

    #[test]
    fn test_missing_field() {
        let message = expect_configuration_error(
            r#"{"receivers": {"r": {"serial": "R", "address": "10.0.0.2", "role": "rover"}}}"#);
        assert!(message.contains("'port'"));
    }

    #[test]
    fn test_invalid_values() {
        let message = expect_configuration_error(
            r#"{"receivers": {"r": {"serial": "R", "address": "h", "port": 5002, "role": "car"}}}"#);
        assert!(message.contains("role"));
        let message = expect_configuration_error(
            r#"{"receivers": {"r": {"serial": "R", "address": "h", "port": "5002", "role": "rover"}}}"#);
        assert!(message.contains("port"));
        let message = expect_configuration_error(
            r#"{"receivers": {"r": {"serial": "R", "address": "h", "port": 70000, "role": "rover"}}}"#);
        assert!(message.contains("port"));
        let message = expect_configuration_error(
            r#"{"receivers": {"r": {"serial": "R", "address": "h", "port": 1, "role": "rover", "timeout": 2.5}}}"#);
        assert!(message.contains("timeout"));
    }

    #[test]
    fn test_structure_errors() {
        expect_configuration_error("not json");
        expect_configuration_error(r#"{"stations": {}}"#);
        expect_configuration_error(r#"{"receivers": [1, 2]}"#);
        expect_configuration_error(r#"{"receivers": {"r": 5}}"#);
    }

    #[test]
    fn test_at_most_one_base() {
        let message = expect_configuration_error(r#"{"receivers": {
            "a": {"serial": "A", "address": "h", "port": 1, "role": "base"},
            "b": {"serial": "B", "address": "h", "port": 2, "role": "base"}
        }}"#);
        assert!(message.contains("at most one"));
    }

    #[test]
    fn test_duplicate_serial() {
        let message = expect_configuration_error(r#"{"receivers": {
            "a": {"serial": "A", "address": "h", "port": 1, "role": "rover"},
            "b": {"serial": "A", "address": "h", "port": 2, "role": "rover"}
        }}"#);
        assert!(message.contains("more than once"));
    }

    #[test]
    fn test_empty_is_allowed() {
        assert!(parse_receivers(r#"{"receivers": {}}"#, DEFAULT_TIMEOUT).unwrap().is_empty());
        assert!(parse_receivers(r#"{"receivers": null}"#, DEFAULT_TIMEOUT).unwrap().is_empty());
    }

    #[test]
    fn test_missing_file() {
        let dir = tempdir().unwrap();
        match load_receivers(&dir.path().join("missing.json"), DEFAULT_TIMEOUT) {
            Err(Error::Configuration(_)) => (),
            other => panic!("Expected a configuration error, got {:?}", other),
        }
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stations.json");
        let mut receivers = parse_receivers(r#"{"receivers": {
            "a": {"serial": "A", "address": "10.0.0.1", "port": 5001, "role": "base",
                  "coordinates": {"lat": 45.0, "lon": 9.0, "alt": 120.0}},
            "r": {"serial": "R", "address": "10.0.0.2", "port": 5002, "role": "rover"},
            "s": {"serial": "S", "address": "10.0.0.3", "port": 5003, "role": "rover"}
        }}"#, DEFAULT_TIMEOUT).unwrap();
        receivers[1].coordinates = Some(Coordinates::new(45.001, 9.002, 121.5));
        receivers[1].quality = Some(Quality::Fix);
        receivers[1].base = Some("A".to_string());

        save_receivers(&path, &receivers).unwrap();
        assert!(!dir.path().join("stations.partial").exists());

        let document: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert!(document["updated"].is_string());
        assert!(document["receivers"]["R"]["quality"] == "FIX");
        assert!(document["receivers"]["R"]["base"] == "A");
        assert!(document["receivers"]["R"]["coordinates"]["alt"] == 121.5);
        assert!(document["receivers"]["S"].get("coordinates").is_none());

        let reloaded = load_receivers(&path, DEFAULT_TIMEOUT).unwrap();
        assert!(reloaded.len() == 3);
        assert!(reloaded[1].coordinates == receivers[1].coordinates);
        assert!(reloaded[1].quality == Some(Quality::Fix));
        assert!(reloaded[2].coordinates.is_none());
    }
}

/**
 * Receivers taking part in a run and the capability each role has to
 * acquire its own position.
 */
use std::fmt;
use std::time::Duration;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::base_acquirer;
use crate::coordinates::Coordinates;
use crate::engine_config;
use crate::error::{Error, Result};
use crate::poll::Shutdown;
use crate::settings::Settings;
use crate::stream_verifier::Protocol;
use crate::supervisor::{EngineLauncher, EngineSupervisor};


#[derive(Clone, Debug, PartialEq)]
pub struct Endpoint {
    pub address: String,
    pub port: u16,
}


impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}


#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Quality {
    Fix,
    Float,
    Unknown,
}


impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match *self {
            Quality::Fix => "FIX",
            Quality::Float => "FLOAT",
            Quality::Unknown => "UNKNOWN",
        })
    }
}


/**
 * A solution produced by the engine supervisor.
 */
#[derive(Clone, Debug, PartialEq)]
pub struct AcquisitionResult {
    pub coordinates: Coordinates,
    pub quality: Quality,
    pub satellites: Option<u32>,
    pub epoch: Option<NaiveDateTime>,
}


/**
 * What a successful acquisition assigns to a receiver.
 */
#[derive(Clone, Debug, PartialEq)]
pub struct Resolution {
    pub coordinates: Coordinates,
    pub quality: Option<Quality>,
    /// Serial of the Base the position is relative to.
    pub base: Option<String>,
}


/// The stationary reference unit. Positions itself from its own NMEA stream.
#[derive(Clone, Debug, PartialEq)]
pub struct Base;


/// A mobile unit, positioned by the engine relative to the Base.
#[derive(Clone, Debug, PartialEq)]
pub struct Rover {
    pub timeout: Duration,
}


#[derive(Clone, Debug, PartialEq)]
pub enum Role {
    Base(Base),
    Rover(Rover),
}


impl Role {
    pub fn name(&self) -> &'static str {
        match *self {
            Role::Base(_) => "base",
            Role::Rover(_) => "rover",
        }
    }
}


#[derive(Clone, Debug, PartialEq)]
pub struct Receiver {
    pub serial: String,
    pub endpoint: Endpoint,
    pub role: Role,
    pub coordinates: Option<Coordinates>,
    pub quality: Option<Quality>,
    pub base: Option<String>,
    /// What verification observed on the endpoint, if it was probed.
    pub protocol: Option<Protocol>,
}


impl Receiver {
    pub fn new(serial: &str, address: &str, port: u16, role: Role) -> Receiver {
        Receiver {
            serial: serial.to_string(),
            endpoint: Endpoint { address: address.to_string(), port: port },
            role: role,
            coordinates: None,
            quality: None,
            base: None,
            protocol: None,
        }
    }

    pub fn is_base(&self) -> bool {
        match self.role {
            Role::Base(_) => true,
            Role::Rover(_) => false,
        }
    }

    pub fn has_coordinates(&self) -> bool {
        self.coordinates.is_some()
    }

    pub fn resolve(&mut self, resolution: Resolution) {
        self.coordinates = Some(resolution.coordinates);
        self.quality = resolution.quality;
        self.base = resolution.base;
    }

    /**
     * Runs the role's acquisition. Nothing on the receiver changes; the
     * caller decides what to do with the outcome.
     */
    pub fn acquire(&self, context: &AcquireContext) -> Result<Resolution> {
        match self.role {
            Role::Base(ref base) => base.acquire(self, context),
            Role::Rover(ref rover) => rover.acquire(self, context),
        }
    }
}


impl fmt::Display for Receiver {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Serial: {}, Endpoint: {}, Role: {} | ", self.serial, self.endpoint, self.role.name())?;
        match self.coordinates {
            Some(ref coordinates) => write!(f, "{}", coordinates)?,
            None => write!(f, "Coordinates: Not set")?,
        }
        match self.quality {
            Some(quality) => write!(f, " ({})", quality),
            None => Ok(()),
        }
    }
}


/**
 * Everything a role needs from the run to acquire a position.
 */
pub struct AcquireContext<'a> {
    pub settings: &'a Settings,
    pub launcher: &'a dyn EngineLauncher,
    /// The positioned Base, required by Rovers.
    pub base: Option<&'a Receiver>,
    pub shutdown: &'a Shutdown,
}


pub trait Acquire {
    fn acquire(&self, receiver: &Receiver, context: &AcquireContext) -> Result<Resolution>;
}


impl Acquire for Base {
    fn acquire(&self, receiver: &Receiver, context: &AcquireContext) -> Result<Resolution> {
        let coordinates = base_acquirer::acquire_base_position(
            &receiver.serial,
            &receiver.endpoint.address,
            receiver.endpoint.port,
            context.settings.base_timeout,
            context.settings.base_samples,
            context.shutdown)?;
        Ok(Resolution { coordinates: coordinates, quality: None, base: None })
    }
}


impl Acquire for Rover {
    fn acquire(&self, receiver: &Receiver, context: &AcquireContext) -> Result<Resolution> {
        let base = match context.base {
            Some(base) if base.has_coordinates() => base,
            _ => return Err(Error::acquisition(&receiver.serial, "the Base has no coordinates")),
        };

        if context.shutdown.is_requested() {
            return Err(Error::Cancelled);
        }

        let job = engine_config::generate_config(receiver, base, &context.settings.work_dir)?;
        info!("Engine configuration written to {}", job.config_path.display());

        let mut supervisor = EngineSupervisor::new(&receiver.serial, job, context.launcher, context.settings)
            .with_shutdown(context.shutdown.clone());
        if !supervisor.start() {
            supervisor.stop(true);
            return Err(Error::process(&receiver.serial, "unable to start the engine"));
        }

        info!("Waiting for a FIX solution (timeout: {}s)", self.timeout.as_secs());
        let result = supervisor.wait_for_fix(self.timeout, context.settings.median_samples);
        let exited_early = supervisor.exited_early();
        supervisor.stop(true);

        match result {
            Some(result) => {
                if result.quality != Quality::Fix {
                    warn!("Rover {} positioned with a {} solution only", receiver.serial, result.quality);
                }
                Ok(Resolution {
                    coordinates: result.coordinates,
                    quality: Some(result.quality),
                    base: Some(base.serial.clone()),
                })
            },
            None => if context.shutdown.is_requested() {
                Err(Error::Cancelled)
            } else if exited_early {
                Err(Error::process(&receiver.serial, "the engine exited before producing a solution"))
            } else {
                Err(Error::acquisition(
                    &receiver.serial,
                    format!("no usable solution within {}s", self.timeout.as_secs())))
            },
        }
    }
}

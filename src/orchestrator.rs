/**
 * Drives a whole acquisition run:
 *
 * LOAD -> VERIFY -> ACQUIRE_BASE -> PROCESS_ROVERS -> PERSIST -> DONE
 *
 * with an early exit to ABORTED at every gate. Once the receivers are
 * loaded, the receiver set is persisted exactly once, whether the run
 * completes, aborts or is shut down.
 */
use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use crate::error::{Error, Result};
use crate::poll::Shutdown;
use crate::receiver::{AcquireContext, Endpoint, Quality, Receiver};
use crate::settings::Settings;
use crate::station_file;
use crate::stream_verifier::{gate_base, gate_rover, hex_dump, Gate, ProbeResult, StreamProbe};
use crate::supervisor::EngineLauncher;


#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Load,
    Verify,
    AcquireBase,
    ProcessRovers,
    Persist,
    Done,
    Aborted,
}


impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match *self {
            RunState::Load => "LOAD",
            RunState::Verify => "VERIFY",
            RunState::AcquireBase => "ACQUIRE_BASE",
            RunState::ProcessRovers => "PROCESS_ROVERS",
            RunState::Persist => "PERSIST",
            RunState::Done => "DONE",
            RunState::Aborted => "ABORTED",
        })
    }
}


#[derive(Debug)]
pub enum RoverOutcome {
    Resolved(Quality),
    /// Dropped during verification.
    Excluded(Error),
    Failed(Error),
}


impl fmt::Display for RoverOutcome {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            RoverOutcome::Resolved(quality) => write!(f, "resolved ({})", quality),
            RoverOutcome::Excluded(ref e) => write!(f, "excluded: {}", e),
            RoverOutcome::Failed(ref e) => write!(f, "failed: {}", e),
        }
    }
}


#[derive(Debug)]
pub struct RunReport {
    pub final_state: RunState,
    /// The state the run was in when it gave up.
    pub aborted_at: Option<RunState>,
    pub abort_reason: Option<Error>,
    /// Rover serial and outcome, in input order. Rovers never reached are absent.
    pub rovers: Vec<(String, RoverOutcome)>,
    /// The receiver set as persisted.
    pub receivers: Vec<Receiver>,
}


impl RunReport {
    pub fn is_done(&self) -> bool {
        self.final_state == RunState::Done
    }

    pub fn outcome(&self, serial: &str) -> Option<&RoverOutcome> {
        self.rovers.iter()
            .find(|&&(ref s, _)| s == serial)
            .map(|&(_, ref outcome)| outcome)
    }
}


/**
 * One receiver as seen by a verification-only pass.
 */
#[derive(Clone, Debug)]
pub struct VerifyEntry {
    pub serial: String,
    pub role: &'static str,
    pub endpoint: Endpoint,
    pub probe: ProbeResult,
    pub gate: Gate,
}


impl VerifyEntry {
    pub fn passed(&self) -> bool {
        match self.gate {
            Gate::Proceed | Gate::Warn(_) => true,
            Gate::Exclude(_) | Gate::Abort(_) => false,
        }
    }
}


pub struct Orchestrator {
    settings: Settings,
    probe: Box<dyn StreamProbe>,
    launcher: Box<dyn EngineLauncher>,
    shutdown: Shutdown,
    state: RunState,
}


impl Orchestrator {
    pub fn new(
        settings: Settings,
        probe: Box<dyn StreamProbe>,
        launcher: Box<dyn EngineLauncher>
    ) -> Orchestrator {
        Orchestrator {
            settings: settings,
            probe: probe,
            launcher: launcher,
            shutdown: Shutdown::new(),
            state: RunState::Load,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /**
     * A handle that winds the run down: the running engine is stopped, no
     * further Rovers are started, and what was resolved so far is persisted.
     */
    pub fn shutdown(&self) -> Shutdown {
        self.shutdown.clone()
    }

    fn enter(&mut self, state: RunState) {
        debug!("Run state {} -> {}", self.state, state);
        self.state = state;
    }

    fn check_shutdown(&self) -> Result<()> {
        if self.shutdown.is_requested() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /**
     * Runs the whole state machine. Only a configuration error or a failure
     * to write the results is returned as an error; everything else ends up
     * in the report.
     */
    pub fn run(&mut self, config_path: &Path, output_path: &Path) -> Result<RunReport> {
        self.enter(RunState::Load);
        info!("Loading receivers from {}", config_path.display());
        let mut receivers = station_file::load_receivers(config_path, self.settings.rover_timeout)?;

        let mut rovers = Vec::new();
        let abort = match self.acquire(&mut receivers, &mut rovers) {
            Ok(()) => None,
            Err(e) => {
                error!("Run aborted during {}: {}", self.state, e);
                Some((self.state, e))
            }
        };

        self.enter(RunState::Persist);
        station_file::save_receivers(output_path, &receivers)?;

        let (aborted_at, abort_reason) = match abort {
            Some((state, e)) => {
                self.enter(RunState::Aborted);
                (Some(state), Some(e))
            },
            None => {
                self.enter(RunState::Done);
                (None, None)
            },
        };
        Ok(RunReport {
            final_state: self.state,
            aborted_at: aborted_at,
            abort_reason: abort_reason,
            rovers: rovers,
            receivers: receivers,
        })
    }

    /**
     * LOAD and VERIFY only, with the header bytes of every stream logged.
     * Nothing is launched or persisted.
     */
    pub fn verify_only(&mut self, config_path: &Path) -> Result<Vec<VerifyEntry>> {
        self.enter(RunState::Load);
        let receivers = station_file::load_receivers(config_path, self.settings.rover_timeout)?;

        self.enter(RunState::Verify);
        let mut entries = Vec::with_capacity(receivers.len());
        for receiver in &receivers {
            let (probe, gate) = self.check(receiver);
            info!("  First {} bytes: {}", probe.header.len(), hex_dump(&probe.header));
            entries.push(VerifyEntry {
                serial: receiver.serial.clone(),
                role: receiver.role.name(),
                endpoint: receiver.endpoint.clone(),
                probe: probe,
                gate: gate,
            });
        }
        self.enter(RunState::Done);
        Ok(entries)
    }

    /**
     * VERIFY, ACQUIRE_BASE and PROCESS_ROVERS. An Err is the abort reason.
     */
    fn acquire(&mut self, receivers: &mut Vec<Receiver>, rovers: &mut Vec<(String, RoverOutcome)>) -> Result<()> {
        self.enter(RunState::Verify);
        let excluded = self.verify(receivers, rovers)?;
        self.check_shutdown()?;

        self.enter(RunState::AcquireBase);
        let base_index = self.acquire_base(receivers)?;

        self.enter(RunState::ProcessRovers);
        let pending: Vec<usize> = (0..receivers.len())
            .filter(|&i| !receivers[i].is_base() && !excluded.contains(&receivers[i].serial))
            .collect();
        if pending.is_empty() {
            warn!("No Rovers left to process");
        }
        for (count, index) in pending.iter().enumerate() {
            self.check_shutdown()?;
            info!("Processing Rover {} ({}/{})", receivers[*index].serial, count + 1, pending.len());
            let outcome = self.process_rover(receivers, base_index, *index);
            let cancelled = match outcome {
                RoverOutcome::Failed(Error::Cancelled) => true,
                _ => false,
            };
            rovers.push((receivers[*index].serial.clone(), outcome));
            if cancelled {
                return Err(Error::Cancelled);
            }
        }
        Ok(())
    }

    fn check(&self, receiver: &Receiver) -> (ProbeResult, Gate) {
        let probe = self.probe.probe(&receiver.endpoint, self.settings.probe_timeout);
        info!("{} {} at {}: {}", receiver.role.name(), receiver.serial, receiver.endpoint, probe.protocol);
        let gate = if receiver.is_base() {
            gate_base(probe.protocol, receiver.has_coordinates())
        } else {
            gate_rover(probe.protocol)
        };
        (probe, gate)
    }

    /**
     * Probes every receiver and applies the gates. Returns the serials of
     * the Rovers to skip.
     */
    fn verify(
        &self,
        receivers: &mut Vec<Receiver>,
        rovers: &mut Vec<(String, RoverOutcome)>
    ) -> Result<HashSet<String>> {
        let mut excluded = HashSet::new();
        for receiver in receivers.iter_mut() {
            let (probe, gate) = self.check(receiver);
            debug!("Header: {}", hex_dump(&probe.header));
            receiver.protocol = Some(probe.protocol);

            match gate {
                Gate::Proceed => (),
                Gate::Warn(reason) => warn!("{} {}: {}", receiver.role.name(), receiver.serial, reason),
                Gate::Exclude(reason) => {
                    warn!("Excluding Rover {}: {}", receiver.serial, reason);
                    excluded.insert(receiver.serial.clone());
                    let e = Error::connectivity(&receiver.serial, &receiver.endpoint, probe.protocol);
                    rovers.push((receiver.serial.clone(), RoverOutcome::Excluded(e)));
                },
                Gate::Abort(reason) => {
                    error!("Base {}: {}", receiver.serial, reason);
                    return Err(Error::connectivity(&receiver.serial, &receiver.endpoint, probe.protocol));
                },
            }
        }
        Ok(excluded)
    }

    /**
     * Makes sure the Base has coordinates and returns its index.
     */
    fn acquire_base(&self, receivers: &mut Vec<Receiver>) -> Result<usize> {
        let index = match receivers.iter().position(|r| r.is_base()) {
            Some(index) => index,
            None => return Err(Error::Configuration("no Base receiver configured".to_string())),
        };
        if let Some(coordinates) = receivers[index].coordinates {
            info!("Base {} using stored coordinates: {}", receivers[index].serial, coordinates);
            return Ok(index);
        }

        info!("Acquiring the Base {} position", receivers[index].serial);
        let resolution = {
            let context = AcquireContext {
                settings: &self.settings,
                launcher: self.launcher.as_ref(),
                base: None,
                shutdown: &self.shutdown,
            };
            receivers[index].acquire(&context)?
        };
        receivers[index].resolve(resolution);
        info!("Base position acquired: {}", receivers[index]);
        Ok(index)
    }

    fn process_rover(&self, receivers: &mut Vec<Receiver>, base_index: usize, index: usize) -> RoverOutcome {
        let resolution = {
            let context = AcquireContext {
                settings: &self.settings,
                launcher: self.launcher.as_ref(),
                base: Some(&receivers[base_index]),
                shutdown: &self.shutdown,
            };
            receivers[index].acquire(&context)
        };
        match resolution {
            Ok(resolution) => {
                let quality = resolution.quality.unwrap_or(Quality::Unknown);
                receivers[index].resolve(resolution);
                info!("Rover {} resolved: {}", receivers[index].serial, receivers[index]);
                RoverOutcome::Resolved(quality)
            },
            Err(e) => {
                error!("{}", e);
                RoverOutcome::Failed(e)
            },
        }
    }
}

/**
 * Owns one external engine process: starts it, polls its solution file until
 * a stable FIX emerges, stops it and cleans up after it.
 */
use std::collections::HashMap;
use std::fs::{self, File};
use std::io;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, SystemTime};

use crate::coordinates::Coordinates;
use crate::engine_config::EngineJob;
use crate::poll::{poll_until, Shutdown, Step};
use crate::receiver::{AcquisitionResult, Quality};
use crate::settings::Settings;
use crate::solution::latest_record;

/// Positions closer than this are re-reads of the same epoch.
pub const LATLON_EPSILON: f64 = 1e-8;
pub const ALTITUDE_EPSILON: f64 = 1e-3;

const TERMINATE_POLL_INTERVAL: Duration = Duration::from_millis(100);
const LOG_TAIL_LINES: usize = 20;
const TALLY_ENTRIES: usize = 10;


/**
 * A running engine process.
 */
pub trait EngineHandle {
    fn id(&self) -> u32;

    /// Doesn't block. True once the process is gone.
    fn has_exited(&mut self) -> bool;

    /// Asks the process to exit, waits up to `grace`, then kills it.
    fn terminate(&mut self, grace: Duration);
}


/**
 * Starts engine processes for jobs.
 */
pub trait EngineLauncher {
    fn launch(&self, job: &EngineJob) -> io::Result<Box<dyn EngineHandle>>;
}


/**
 * Launches rtkrcv in its own session with output redirected to the job's
 * log files.
 */
pub struct RtkrcvLauncher {
    engine_path: PathBuf,
}


impl RtkrcvLauncher {
    pub fn new(engine_path: &Path) -> RtkrcvLauncher {
        RtkrcvLauncher { engine_path: engine_path.to_path_buf() }
    }
}


fn absolute(path: &Path) -> io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}


impl EngineLauncher for RtkrcvLauncher {
    fn launch(&self, job: &EngineJob) -> io::Result<Box<dyn EngineHandle>> {
        let engine_path = absolute(&self.engine_path)?;
        let config_path = absolute(&job.config_path)?;
        info!("Command: {} -s -nc -t 2 -o {}", engine_path.display(), config_path.display());

        let stdout = File::create(&job.stdout_path)?;
        let stderr = File::create(&job.stderr_path)?;
        let mut command = Command::new(&engine_path);
        command
            .arg("-s")
            .arg("-nc")
            .arg("-t")
            .arg("2")
            .arg("-o")
            .arg(&config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .current_dir(&job.run_dir);
        // Detach from our session so a terminal hangup doesn't reach the engine,
        // but take it down with us if we die without stopping it
        unsafe {
            command.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(io::Error::last_os_error());
                }
                #[cfg(target_os = "linux")]
                {
                    if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                        return Err(io::Error::last_os_error());
                    }
                }
                Ok(())
            });
        }
        let child = command.spawn()?;
        Ok(Box::new(ChildHandle { child: child }))
    }
}


pub struct ChildHandle {
    child: Child,
}


impl EngineHandle for ChildHandle {
    fn id(&self) -> u32 {
        self.child.id()
    }

    fn has_exited(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                debug!("Engine {} exited with {}", self.child.id(), status);
                true
            },
            Ok(None) => false,
            Err(e) => {
                warn!("Unable to query engine {}: {}", self.child.id(), e);
                true
            }
        }
    }

    fn terminate(&mut self, grace: Duration) {
        if self.has_exited() {
            return;
        }
        let pid = self.child.id() as libc::pid_t;
        if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
            warn!("Unable to send SIGTERM to engine {}: {}", pid, io::Error::last_os_error());
        }
        let stopped = poll_until(TERMINATE_POLL_INTERVAL, grace, |_| {
            if self.has_exited() { Step::Ready(()) } else { Step::Pending }
        });
        if stopped.is_none() {
            warn!("Engine {} ignored SIGTERM for {}s, killing it", pid, grace.as_secs());
            match self.child.kill() {
                Ok(_) => (),
                Err(e) => warn!("Unable to kill engine {}: {}", pid, e),
            }
            let _ = self.child.wait();
        }
    }
}


/**
 * Collects distinct FIX solutions until there are enough for a median.
 */
pub struct FixAccumulator {
    samples: Vec<AcquisitionResult>,
    target: usize,
}


impl FixAccumulator {
    pub fn new(target: usize) -> FixAccumulator {
        FixAccumulator { samples: Vec::new(), target: target.max(1) }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /**
     * Accepts a FIX that differs from the last accepted one. Returns false
     * for duplicates and for anything that isn't a FIX.
     */
    pub fn offer(&mut self, result: &AcquisitionResult) -> bool {
        if result.quality != Quality::Fix {
            return false;
        }
        match self.samples.last() {
            Some(last) if !is_distinct(&last.coordinates, &result.coordinates) => false,
            _ => {
                self.samples.push(result.clone());
                true
            }
        }
    }

    pub fn median(&self) -> Option<AcquisitionResult> {
        if self.samples.len() < self.target {
            return None;
        }
        let coordinates: Vec<Coordinates> = self.samples.iter().map(|s| s.coordinates).collect();
        let latest = self.samples.last()?;
        Some(AcquisitionResult {
            coordinates: Coordinates::median(&coordinates)?,
            quality: Quality::Fix,
            satellites: latest.satellites,
            epoch: latest.epoch,
        })
    }
}


pub fn is_distinct(previous: &Coordinates, current: &Coordinates) -> bool {
    (current.lat - previous.lat).abs() > LATLON_EPSILON
        || (current.lon - previous.lon).abs() > LATLON_EPSILON
        || (current.alt - previous.alt).abs() > ALTITUDE_EPSILON
}


/**
 * Counts diagnostic lines mentioning errors or warnings. Numbers are masked so
 * the same fault at different epochs groups together. Most frequent first.
 */
pub fn tally_diagnostics(texts: &[String]) -> Vec<(String, usize)> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for text in texts {
        for line in text.lines() {
            let lower = line.to_lowercase();
            if !lower.contains("error") && !lower.contains("warn") {
                continue;
            }
            let mut masked = String::with_capacity(line.len());
            let mut in_number = false;
            for c in line.trim().chars() {
                if c.is_ascii_digit() {
                    if !in_number {
                        masked.push('#');
                    }
                    in_number = true;
                } else {
                    masked.push(c);
                    in_number = false;
                }
            }
            let key = masked.split_whitespace().collect::<Vec<&str>>().join(" ");
            *counts.entry(key).or_insert(0) += 1;
        }
    }
    let mut tally: Vec<(String, usize)> = counts.into_iter().collect();
    tally.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    tally
}


#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SupervisorState {
    Created,
    Started,
    Polling,
    Fixed,
    FloatTimeout,
    Failed,
    Stopped,
}


enum PollOutcome {
    Converged(AcquisitionResult),
    Exited,
    Cancelled,
}


pub struct EngineSupervisor<'a> {
    serial: String,
    job: EngineJob,
    launcher: &'a dyn EngineLauncher,
    poll_interval: Duration,
    stop_grace: Duration,
    keep_logs: bool,
    handle: Option<Box<dyn EngineHandle>>,
    state: SupervisorState,
    exited_early: bool,
    shutdown: Shutdown,
    started_at: Option<SystemTime>,
    last_status_line: String,
}


impl<'a> EngineSupervisor<'a> {
    pub fn new(
        serial: &str,
        job: EngineJob,
        launcher: &'a dyn EngineLauncher,
        settings: &Settings,
    ) -> EngineSupervisor<'a> {
        EngineSupervisor {
            serial: serial.to_string(),
            job: job,
            launcher: launcher,
            poll_interval: settings.poll_interval,
            stop_grace: settings.stop_grace,
            keep_logs: settings.keep_logs,
            handle: None,
            state: SupervisorState::Created,
            exited_early: false,
            shutdown: Shutdown::new(),
            started_at: None,
            last_status_line: String::new(),
        }
    }

    /// Stop polling as soon as `shutdown` is requested.
    pub fn with_shutdown(mut self, shutdown: Shutdown) -> EngineSupervisor<'a> {
        self.shutdown = shutdown;
        self
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// True if the engine died on its own while we were polling.
    pub fn exited_early(&self) -> bool {
        self.exited_early
    }

    pub fn job(&self) -> &EngineJob {
        &self.job
    }

    /**
     * Launches the engine in the background. Returns false, leaving the
     * supervisor FAILED, if it can't be spawned.
     */
    pub fn start(&mut self) -> bool {
        if self.state != SupervisorState::Created {
            warn!("Engine for {} already started", self.serial);
            return false;
        }
        match fs::create_dir_all(&self.job.run_dir) {
            Ok(_) => (),
            Err(e) => {
                error!("Unable to create {}: {}", self.job.run_dir.display(), e);
                self.state = SupervisorState::Failed;
                return false;
            }
        }
        // A solution file left over from an earlier run would read as fresh epochs
        match fs::remove_file(&self.job.solution_path) {
            Ok(_) => debug!("Removed stale {}", self.job.solution_path.display()),
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => (),
            Err(e) => {
                error!("Unable to remove stale {}: {}", self.job.solution_path.display(), e);
                self.state = SupervisorState::Failed;
                return false;
            }
        }

        self.started_at = Some(SystemTime::now());
        match self.launcher.launch(&self.job) {
            Ok(handle) => {
                info!("Engine started for Rover {} (PID: {})", self.serial, handle.id());
                info!("Solution file: {}", self.job.solution_path.display());
                self.handle = Some(handle);
                self.state = SupervisorState::Started;
                true
            },
            Err(e) => {
                error!("Unable to start the engine for Rover {}: {}", self.serial, e);
                self.state = SupervisorState::Failed;
                false
            }
        }
    }

    /**
     * Polls the solution file until `median_samples` distinct FIX epochs
     * have been seen, then returns their median. If the timeout passes
     * first, falls back to the latest FLOAT, if any. If the engine exits,
     * polling stops and the FLOAT fallback is returned. A shutdown request
     * returns None straight away.
     */
    pub fn wait_for_fix(&mut self, timeout: Duration, median_samples: usize) -> Option<AcquisitionResult> {
        if self.state != SupervisorState::Started {
            warn!("Engine for {} isn't running, nothing to wait for", self.serial);
            return None;
        }
        self.state = SupervisorState::Polling;

        let mut fixes = FixAccumulator::new(median_samples);
        let mut fallback: Option<AcquisitionResult> = None;
        let outcome = poll_until(self.poll_interval, timeout, |remaining| {
            if self.shutdown.is_requested() {
                return Step::Ready(PollOutcome::Cancelled);
            }
            match latest_record(&self.job.solution_path) {
                Some(record) => {
                    let progress = if fixes.len() > 0 {
                        format!(" [{}/{}]", fixes.len(), fixes.target)
                    } else {
                        String::new()
                    };
                    let quality = match record.status.and_then(|s| s.quality()) {
                        Some(quality) => quality.to_string(),
                        None => match record.status {
                            Some(status) => format!("{:?}", status).to_uppercase(),
                            None => "Q=?".to_string(),
                        },
                    };
                    self.update_status(&format!(
                        "Solution: {:.8}, {:.8}, {:.3} ({}{}) - {}s",
                        record.coordinates.lat,
                        record.coordinates.lon,
                        record.coordinates.alt,
                        quality,
                        progress,
                        remaining.as_secs()));

                    if let Some(result) = record.to_result() {
                        match result.quality {
                            Quality::Fix => {
                                if fixes.offer(&result) {
                                    info!("FIX sample #{} collected", fixes.len());
                                }
                                if let Some(median) = fixes.median() {
                                    return Step::Ready(PollOutcome::Converged(median));
                                }
                            },
                            Quality::Float => fallback = Some(result),
                            Quality::Unknown => (),
                        }
                    }
                },
                None => self.update_status(&format!("Waiting for a solution... {}s", remaining.as_secs())),
            }

            let exited = match self.handle {
                Some(ref mut handle) => handle.has_exited(),
                None => true,
            };
            if exited {
                Step::Ready(PollOutcome::Exited)
            } else {
                Step::Pending
            }
        });

        match outcome {
            Some(PollOutcome::Converged(median)) => {
                info!("Median solution from {} FIX samples: {}", median_samples.max(1), median.coordinates);
                self.state = SupervisorState::Fixed;
                Some(median)
            },
            Some(PollOutcome::Cancelled) => {
                warn!("Shutdown requested, abandoning Rover {}", self.serial);
                self.state = SupervisorState::Failed;
                None
            },
            Some(PollOutcome::Exited) => {
                warn!("Engine for Rover {} exited unexpectedly", self.serial);
                self.exited_early = true;
                self.state = SupervisorState::Failed;
                fallback
            },
            None => match fallback {
                Some(result) => {
                    warn!("Timed out without a stable FIX, accepting FLOAT solution");
                    self.state = SupervisorState::FloatTimeout;
                    Some(result)
                },
                None => {
                    self.state = SupervisorState::Failed;
                    None
                }
            },
        }
    }

    /**
     * Stops the engine and disposes of its files: removed after a successful
     * run, kept and summarised after a failed one when
     * `preserve_logs_on_failure` is set.
     */
    pub fn stop(&mut self, preserve_logs_on_failure: bool) {
        if self.state == SupervisorState::Stopped {
            return;
        }
        if let Some(mut handle) = self.handle.take() {
            handle.terminate(self.stop_grace);
        }

        let failed = match self.state {
            SupervisorState::Fixed | SupervisorState::FloatTimeout => false,
            _ => true,
        };
        if failed && preserve_logs_on_failure {
            self.log_summary();
        } else if self.keep_logs {
            info!("Engine files kept in {}", self.files_dir().display());
        } else {
            self.remove_files();
        }
        self.state = SupervisorState::Stopped;
    }

    fn files_dir(&self) -> &Path {
        match self.job.config_path.parent() {
            Some(parent) => parent,
            None => self.job.run_dir.as_path(),
        }
    }

    fn update_status(&mut self, status_line: &str) {
        if status_line != self.last_status_line {
            info!("[RTK_STATUS] {}", status_line);
            self.last_status_line = status_line.to_string();
        }
    }

    /**
     * Trace files the engine wrote during this run. rtkrcv names its own
     * trace after the start time, so anything touched since we launched it
     * counts.
     */
    fn trace_files(&self) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        let entries = match fs::read_dir(&self.job.run_dir) {
            Ok(entries) => entries,
            Err(_) => return paths,
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.extension().map_or(true, |extension| extension != "trace") {
                continue;
            }
            let modified = entry.metadata().and_then(|m| m.modified()).ok();
            let recent = match (modified, self.started_at) {
                (Some(modified), Some(started_at)) => modified >= started_at,
                _ => path == self.job.trace_path,
            };
            if recent {
                paths.push(path);
            }
        }
        paths.sort();
        paths
    }

    fn remove_files(&self) {
        let mut paths: Vec<PathBuf> = self.job.files().iter().map(|p| p.to_path_buf()).collect();
        paths.extend(self.trace_files());
        for path in paths {
            match fs::remove_file(&path) {
                Ok(_) => (),
                Err(ref e) if e.kind() == io::ErrorKind::NotFound => (),
                Err(e) => warn!("Unable to remove {}: {}", path.display(), e),
            }
        }
    }

    fn log_summary(&self) {
        error!("=== Engine logs for Rover {} ===", self.serial);
        for &(path, label) in [(&self.job.stdout_path, "stdout"), (&self.job.stderr_path, "stderr")].iter() {
            match fs::read_to_string(path) {
                Ok(contents) => {
                    let lines: Vec<&str> = contents.lines().filter(|l| !l.trim().is_empty()).collect();
                    if lines.is_empty() {
                        error!("--- {} (empty) ---", label);
                        continue;
                    }
                    error!("--- {} (last {} lines) ---", label, LOG_TAIL_LINES.min(lines.len()));
                    for line in &lines[lines.len().saturating_sub(LOG_TAIL_LINES)..] {
                        error!("{}", line);
                    }
                },
                Err(_) => error!("--- {} (missing) ---", label),
            }
        }

        let mut texts: Vec<String> = Vec::new();
        let mut sources = vec![self.job.stderr_path.clone()];
        sources.extend(self.trace_files());
        for path in &sources {
            if let Ok(contents) = fs::read_to_string(path) {
                texts.push(contents);
            }
        }
        let tally = tally_diagnostics(&texts);
        if !tally.is_empty() {
            error!("--- Most frequent engine errors/warnings ---");
            for (line, count) in tally.iter().take(TALLY_ENTRIES) {
                error!("{:>6} x {}", count, line);
            }
        }
        info!("Engine logs kept in {}", self.files_dir().display());
    }
}


impl<'a> Drop for EngineSupervisor<'a> {
    fn drop(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.terminate(self.stop_grace);
        }
    }
}


#[cfg(test)]
mod tests {
    use std::fs::{self, OpenOptions};
    use std::io::{self, Write};
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread::{self, JoinHandle};
    use std::time::{Duration, Instant};

    use tempfile::tempdir;

    use super::{
        is_distinct, tally_diagnostics, EngineHandle, EngineLauncher, EngineSupervisor, FixAccumulator,
        RtkrcvLauncher, SupervisorState,
    };
    use crate::coordinates::Coordinates;
    use crate::engine_config::EngineJob;
    use crate::poll::Shutdown;
    use crate::receiver::{AcquisitionResult, Quality};
    use crate::settings::Settings;

    fn fix(lat: f64, lon: f64, alt: f64) -> AcquisitionResult {
        AcquisitionResult {
            coordinates: Coordinates::new(lat, lon, alt),
            quality: Quality::Fix,
            satellites: Some(10),
            epoch: None,
        }
    }

    /// Appends one solution line per step, then idles (or exits) until terminated.
    struct ScriptedHandle {
        stop: Arc<AtomicBool>,
        done: Arc<AtomicBool>,
        exit_when_done: bool,
        writer: Option<JoinHandle<()>>,
    }

    impl EngineHandle for ScriptedHandle {
        fn id(&self) -> u32 { 4242 }

        fn has_exited(&mut self) -> bool {
            self.exit_when_done && self.done.load(Ordering::SeqCst)
        }

        fn terminate(&mut self, _grace: Duration) {
            self.stop.store(true, Ordering::SeqCst);
            if let Some(writer) = self.writer.take() {
                writer.join().unwrap();
            }
        }
    }

    struct ScriptedLauncher {
        lines: Vec<String>,
        step: Duration,
        exit_when_done: bool,
        fail: bool,
    }

    impl ScriptedLauncher {
        fn new(lines: Vec<&str>) -> ScriptedLauncher {
            ScriptedLauncher {
                lines: lines.iter().map(|l| l.to_string()).collect(),
                step: Duration::from_millis(30),
                exit_when_done: false,
                fail: false,
            }
        }
    }

    impl EngineLauncher for ScriptedLauncher {
        fn launch(&self, job: &EngineJob) -> io::Result<Box<dyn EngineHandle>> {
            if self.fail {
                return Err(io::Error::new(io::ErrorKind::NotFound, "no such engine"));
            }
            fs::write(&job.stderr_path, "parity error w=1234\nparity error w=99\nfatal warning\n")?;
            let stop = Arc::new(AtomicBool::new(false));
            let done = Arc::new(AtomicBool::new(false));
            let lines = self.lines.clone();
            let step = self.step;
            let path = job.solution_path.clone();
            let (thread_stop, thread_done) = (stop.clone(), done.clone());
            let writer = thread::spawn(move || {
                for line in lines {
                    if thread_stop.load(Ordering::SeqCst) {
                        return;
                    }
                    append(&path, &line);
                    thread::sleep(step);
                }
                thread_done.store(true, Ordering::SeqCst);
            });
            Ok(Box::new(ScriptedHandle {
                stop: stop,
                done: done,
                exit_when_done: self.exit_when_done,
                writer: Some(writer),
            }))
        }
    }

    fn append(path: &Path, line: &str) {
        let mut file = OpenOptions::new().create(true).append(true).open(path).unwrap();
        file.write_all(format!("{}\n", line).as_bytes()).unwrap();
    }

    fn settings(work_dir: &Path) -> Settings {
        Settings {
            work_dir: work_dir.to_path_buf(),
            poll_interval: Duration::from_millis(5),
            stop_grace: Duration::from_millis(100),
            ..Settings::default()
        }
    }

    fn job(work_dir: &Path) -> EngineJob {
        let job = EngineJob::for_rover("R1", work_dir);
        fs::write(&job.config_path, "# config\n").unwrap();
        job
    }

    #[test]
    fn test_duplicate_rejection() {
        let mut fixes = FixAccumulator::new(3);
        assert!(fixes.offer(&fix(48.0, 11.0, 500.0)));
        assert!(!fixes.offer(&fix(48.0, 11.0, 500.0)));
        assert!(fixes.len() == 1);
        // 2e-9 degrees is below the threshold
        assert!(!fixes.offer(&fix(48.0 + 2e-9, 11.0, 500.0)));
        assert!(fixes.len() == 1);
        // 2e-8 degrees is not
        assert!(fixes.offer(&fix(48.0 + 2e-8, 11.0, 500.0)));
        assert!(fixes.len() == 2);
        assert!(fixes.median().is_none());
        assert!(fixes.offer(&fix(48.0 + 2e-8, 11.0, 500.002)));
        assert!(fixes.median().is_some());
    }

    #[test]
    fn test_float_is_never_accumulated() {
        let mut fixes = FixAccumulator::new(1);
        let mut float = fix(1.0, 2.0, 3.0);
        float.quality = Quality::Float;
        assert!(!fixes.offer(&float));
        assert!(fixes.median().is_none());
    }

    #[test]
    fn test_is_distinct() {
        let a = Coordinates::new(45.0, 9.0, 100.0);
        assert!(!is_distinct(&a, &Coordinates::new(45.0, 9.0, 100.0005)));
        assert!(is_distinct(&a, &Coordinates::new(45.0, 9.0, 100.002)));
        assert!(is_distinct(&a, &Coordinates::new(45.0, 9.00000002, 100.0)));
    }

    #[test]
    fn test_median_of_fixes() {
        let mut fixes = FixAccumulator::new(3);
        fixes.offer(&fix(48.00, 11.0, 1.0));
        fixes.offer(&fix(48.02, 11.0, 3.0));
        fixes.offer(&fix(48.01, 11.0, 2.0));
        let median = fixes.median().unwrap();
        assert!(median.coordinates.lat == 48.01);
        assert!(median.coordinates.alt == 2.0);
        assert!(median.quality == Quality::Fix);
    }

    #[test]
    fn test_tally_diagnostics() {
        let texts = vec![
            "3 parity error w=1234\n4 parity error w=99\nok line\n".to_string(),
            "5 WARNING: no base\n6 parity error w=7\n".to_string(),
        ];
        let tally = tally_diagnostics(&texts);
        assert!(tally[0] == ("# parity error w=#".to_string(), 3));
        assert!(tally[1] == ("# WARNING: no base".to_string(), 1));
        assert!(tally.len() == 2);
    }

    #[test]
    fn test_converges_on_distinct_fixes() {
        let dir = tempdir().unwrap();
        let launcher = ScriptedLauncher::new(vec![
            "% header",
            "2024/05/01 10:00:01.000 45.00000000 9.0 100.000 5 6",
            "2024/05/01 10:00:02.000 45.00000010 9.0 100.000 2 8",
            "2024/05/01 10:00:03.000 45.00000100 9.0 100.000 1 9",
            "2024/05/01 10:00:04.000 45.00000300 9.0 100.000 1 9",
            "2024/05/01 10:00:05.000 45.00000200 9.0 100.000 1 9",
            "2024/05/01 10:00:06.000 45.00000400 9.0 100.000 1 9",
            "2024/05/01 10:00:07.000 45.00000500 9.0 100.000 1 9",
        ]);
        let settings = settings(dir.path());
        let job = job(dir.path());
        let mut supervisor = EngineSupervisor::new("R1", job.clone(), &launcher, &settings);
        assert!(supervisor.start());
        assert!(supervisor.state() == SupervisorState::Started);

        let start = Instant::now();
        let result = supervisor.wait_for_fix(Duration::from_secs(10), 3).unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(supervisor.state() == SupervisorState::Fixed);
        assert!(result.quality == Quality::Fix);
        // Usually the median of the first three FIX epochs, 45.000002
        assert!(result.coordinates.lat >= 45.000001 && result.coordinates.lat <= 45.000005);

        supervisor.stop(true);
        assert!(supervisor.state() == SupervisorState::Stopped);
        assert!(!job.config_path.exists());
        assert!(!job.solution_path.exists());
        assert!(!job.stderr_path.exists());
    }

    #[test]
    fn test_float_fallback_on_timeout() {
        let dir = tempdir().unwrap();
        let launcher = ScriptedLauncher::new(vec![
            "2024/05/01 10:00:01.000 45.1 9.1 100.0 2 8",
            "2024/05/01 10:00:02.000 45.2 9.2 100.0 1 9",
            "2024/05/01 10:00:03.000 45.3 9.3 100.0 2 8",
        ]);
        let settings = settings(dir.path());
        let mut supervisor = EngineSupervisor::new("R1", job(dir.path()), &launcher, &settings);
        assert!(supervisor.start());
        let result = supervisor.wait_for_fix(Duration::from_millis(400), 3).unwrap();
        assert!(result.quality == Quality::Float);
        assert!(result.coordinates.lat == 45.3);
        assert!(supervisor.state() == SupervisorState::FloatTimeout);
        supervisor.stop(true);
    }

    #[test]
    fn test_timeout_without_solution_keeps_logs() {
        let dir = tempdir().unwrap();
        let launcher = ScriptedLauncher::new(vec![]);
        let settings = settings(dir.path());
        let job = job(dir.path());
        let mut supervisor = EngineSupervisor::new("R1", job.clone(), &launcher, &settings);
        assert!(supervisor.start());
        assert!(supervisor.wait_for_fix(Duration::from_millis(100), 3).is_none());
        assert!(supervisor.state() == SupervisorState::Failed);
        assert!(!supervisor.exited_early());
        supervisor.stop(true);
        assert!(job.config_path.exists());
        assert!(job.stderr_path.exists());
    }

    #[test]
    fn test_early_exit_stops_polling() {
        let dir = tempdir().unwrap();
        let mut launcher = ScriptedLauncher::new(vec!["2024/05/01 10:00:01.000 45.1 9.1 100.0 2 8"]);
        launcher.exit_when_done = true;
        let settings = settings(dir.path());
        let mut supervisor = EngineSupervisor::new("R1", job(dir.path()), &launcher, &settings);
        assert!(supervisor.start());
        let start = Instant::now();
        let result = supervisor.wait_for_fix(Duration::from_secs(10), 3);
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(supervisor.exited_early());
        assert!(supervisor.state() == SupervisorState::Failed);
        assert!(result.map(|r| r.quality) == Some(Quality::Float));
        supervisor.stop(false);
    }

    #[test]
    fn test_spawn_failure() {
        let dir = tempdir().unwrap();
        let mut launcher = ScriptedLauncher::new(vec![]);
        launcher.fail = true;
        let settings = settings(dir.path());
        let mut supervisor = EngineSupervisor::new("R1", job(dir.path()), &launcher, &settings);
        assert!(!supervisor.start());
        assert!(supervisor.state() == SupervisorState::Failed);
        assert!(supervisor.wait_for_fix(Duration::from_secs(1), 3).is_none());
    }

    #[test]
    fn test_keep_logs_on_success() {
        let dir = tempdir().unwrap();
        let launcher = ScriptedLauncher::new(vec!["2024/05/01 10:00:01.000 45.1 9.1 100.0 1 8"]);
        let mut settings = settings(dir.path());
        settings.keep_logs = true;
        let job = job(dir.path());
        let mut supervisor = EngineSupervisor::new("R1", job.clone(), &launcher, &settings);
        assert!(supervisor.start());
        assert!(supervisor.wait_for_fix(Duration::from_secs(5), 1).is_some());
        supervisor.stop(true);
        assert!(job.solution_path.exists());
    }

    #[test]
    fn test_shutdown_interrupts_wait() {
        let dir = tempdir().unwrap();
        let launcher = ScriptedLauncher::new(vec![]);
        let settings = settings(dir.path());
        let shutdown = Shutdown::new();
        let mut supervisor = EngineSupervisor::new("R1", job(dir.path()), &launcher, &settings)
            .with_shutdown(shutdown.clone());
        assert!(supervisor.start());
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            shutdown.request();
        });
        let start = Instant::now();
        assert!(supervisor.wait_for_fix(Duration::from_secs(30), 3).is_none());
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(supervisor.state() == SupervisorState::Failed);
        assert!(!supervisor.exited_early());
        supervisor.stop(true);
        assert!(supervisor.state() == SupervisorState::Stopped);
    }

    #[test]
    fn test_unremovable_stale_solution_fails_start() {
        let dir = tempdir().unwrap();
        let launcher = ScriptedLauncher::new(vec![]);
        let settings = settings(dir.path());
        let job = job(dir.path());
        // A directory can't be removed with remove_file
        fs::create_dir_all(&job.solution_path).unwrap();
        let mut supervisor = EngineSupervisor::new("R1", job, &launcher, &settings);
        assert!(!supervisor.start());
        assert!(supervisor.state() == SupervisorState::Failed);
    }

    #[test]
    fn test_stale_solution_is_removed() {
        let dir = tempdir().unwrap();
        let launcher = ScriptedLauncher::new(vec![]);
        let settings = settings(dir.path());
        let job = job(dir.path());
        fs::write(&job.solution_path, "2024/05/01 10:00:01.000 45.1 9.1 100.0 1 8\n").unwrap();
        let mut supervisor = EngineSupervisor::new("R1", job.clone(), &launcher, &settings);
        assert!(supervisor.start());
        assert!(!job.solution_path.exists());
        assert!(supervisor.wait_for_fix(Duration::from_millis(100), 1).is_none());
        supervisor.stop(false);
    }

    /// Writes an executable engine stand-in into `dir`.
    fn engine_script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("fake-rtkrcv");
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn launch_real(launcher: &RtkrcvLauncher, job: &EngineJob) -> Box<dyn EngineHandle> {
        // Another test thread forking while the script was open for writing
        // makes exec fail with ETXTBSY for a moment
        for _ in 0..20 {
            match launcher.launch(job) {
                Ok(handle) => return handle,
                Err(ref e) if e.raw_os_error() == Some(libc::ETXTBSY) => thread::sleep(Duration::from_millis(50)),
                Err(e) => panic!("Unable to launch: {}", e),
            }
        }
        panic!("Engine script stayed busy");
    }

    #[test]
    fn test_rtkrcv_launcher_redirects_and_terminates() {
        let dir = tempdir().unwrap();
        let engine = engine_script(dir.path(), "echo \"args: $*\"\necho \"fatal error\" >&2\nexec sleep 30");
        let job = job(dir.path());
        fs::create_dir_all(&job.run_dir).unwrap();
        let launcher = RtkrcvLauncher::new(&engine);
        let mut handle = launch_real(&launcher, &job);
        thread::sleep(Duration::from_millis(300));
        assert!(!handle.has_exited());

        let start = Instant::now();
        handle.terminate(Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(3));
        assert!(handle.has_exited());

        let stdout = fs::read_to_string(&job.stdout_path).unwrap();
        assert!(stdout.contains("-s -nc -t 2 -o"));
        assert!(stdout.contains("rtkrcv_R1.conf"));
        assert!(fs::read_to_string(&job.stderr_path).unwrap().contains("fatal error"));
    }

    #[test]
    fn test_rtkrcv_launcher_kills_after_grace() {
        let dir = tempdir().unwrap();
        let engine = engine_script(dir.path(), "trap '' TERM\nwhile true; do sleep 0.1; done");
        let job = job(dir.path());
        fs::create_dir_all(&job.run_dir).unwrap();
        let launcher = RtkrcvLauncher::new(&engine);
        let mut handle = launch_real(&launcher, &job);
        thread::sleep(Duration::from_millis(300));

        let start = Instant::now();
        handle.terminate(Duration::from_millis(800));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(800));
        assert!(elapsed < Duration::from_secs(5));
        assert!(handle.has_exited());
        assert!(job.stdout_path.exists());
        assert!(job.stderr_path.exists());
    }
}

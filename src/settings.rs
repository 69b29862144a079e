use std::path::PathBuf;
use std::time::Duration;


/**
 * Runtime knobs for a run. Defaults match the field setup; the binary
 * overrides them from the command line.
 */
#[derive(Clone, Debug)]
pub struct Settings {
    /// The external positioning engine executable.
    pub engine_path: PathBuf,
    /// Generated configs, solution files and engine logs go here.
    pub work_dir: PathBuf,
    pub probe_timeout: Duration,
    pub base_timeout: Duration,
    pub base_samples: usize,
    pub median_samples: usize,
    /// Used for Rovers that don't set their own timeout.
    pub rover_timeout: Duration,
    pub poll_interval: Duration,
    pub stop_grace: Duration,
    /// Keep engine files after a successful acquisition too.
    pub keep_logs: bool,
}


impl Default for Settings {
    fn default() -> Settings {
        Settings {
            engine_path: PathBuf::from("./lib/rtkrcv"),
            work_dir: PathBuf::from("./tmp"),
            probe_timeout: Duration::from_secs(5),
            base_timeout: Duration::from_secs(30),
            base_samples: 10,
            median_samples: 3,
            rover_timeout: Duration::from_secs(150),
            poll_interval: Duration::from_secs(1),
            stop_grace: Duration::from_secs(5),
            keep_logs: false,
        }
    }
}

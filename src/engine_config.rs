/**
 * Renders the rtkrcv configuration for one Rover/Base pair. Every file name
 * is keyed by the Rover's serial, so jobs for different Rovers never collide.
 */
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Local;

use crate::error::{Error, Result};
use crate::receiver::Receiver;
use crate::stream_verifier::Protocol;

/// rtkrcv runs from here, relative to the work directory, and drops its trace file in it.
pub const ENGINE_RUN_DIR: &str = "rt";


/**
 * Paths of every file one engine run reads or writes.
 */
#[derive(Clone, Debug, PartialEq)]
pub struct EngineJob {
    pub serial: String,
    pub run_dir: PathBuf,
    pub config_path: PathBuf,
    pub solution_path: PathBuf,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    pub trace_path: PathBuf,
}


impl EngineJob {
    pub fn for_rover(serial: &str, output_dir: &Path) -> EngineJob {
        let run_dir = output_dir.join(ENGINE_RUN_DIR);
        EngineJob {
            serial: serial.to_string(),
            config_path: output_dir.join(format!("rtkrcv_{}.conf", serial)),
            solution_path: output_dir.join(format!("solution_{}.pos", serial)),
            stdout_path: output_dir.join(format!("rtkrcv_stdout_{}.log", serial)),
            stderr_path: output_dir.join(format!("rtkrcv_stderr_{}.log", serial)),
            trace_path: run_dir.join(format!("rtkrcv_{}.trace", serial)),
            run_dir: run_dir,
        }
    }

    /// Files removed once the run no longer needs them.
    pub fn files(&self) -> Vec<&Path> {
        vec![
            self.config_path.as_path(),
            self.solution_path.as_path(),
            self.stdout_path.as_path(),
            self.stderr_path.as_path(),
            self.trace_path.as_path(),
        ]
    }
}


/**
 * Input format rtkrcv should decode for a stream we classified earlier.
 */
pub fn stream_format(protocol: Option<Protocol>) -> &'static str {
    match protocol {
        Some(Protocol::Rtcm3) => "rtcm3",
        _ => "ubx",
    }
}


fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path.to_path_buf(),
    }
}


/**
 * Renders the configuration text. The Base must hold coordinates.
 */
pub fn render_config(rover: &Receiver, base: &Receiver, job: &EngineJob) -> Result<String> {
    let base_position = match base.coordinates {
        Some(coordinates) => coordinates,
        None => return Err(Error::acquisition(&rover.serial, "the Base has no coordinates")),
    };

    // rtkrcv runs from the run directory, so every path it sees is absolute
    let solution_path = absolute(&job.solution_path);
    let trace_path = absolute(&job.trace_path);

    let mut text = String::new();
    text.push_str(&format!("# rtkrcv configuration for Rover {} against Base {}\n", rover.serial, base.serial));
    text.push_str(&format!("# generated {}\n", Local::now().format("%Y-%m-%d %H:%M:%S")));
    text.push_str("console-passwd     =admin\n");
    text.push_str("console-timetype   =utc\n");
    text.push_str("console-soltype    =dms\n");
    text.push_str("console-solflag    =off\n");
    text.push_str("\n# positioning\n");
    text.push_str("pos1-posmode       =kinematic\n");
    text.push_str("pos1-frequency     =l1+l2\n");
    text.push_str("pos1-soltype       =forward\n");
    text.push_str("pos1-elmask        =15\n");
    text.push_str("pos1-snrmask_r     =off\n");
    text.push_str("pos1-snrmask_b     =off\n");
    text.push_str("pos1-dynamics      =on\n");
    text.push_str("pos1-tidecorr      =off\n");
    text.push_str("pos1-ionoopt       =brdc\n");
    text.push_str("pos1-tropopt       =saas\n");
    text.push_str("pos1-sateph        =brdc\n");
    text.push_str("pos1-navsys        =5\n");
    text.push_str("\n# ambiguity resolution\n");
    text.push_str("pos2-armode        =continuous\n");
    text.push_str("pos2-gloarmode     =on\n");
    text.push_str("pos2-arthres       =3.0\n");
    text.push_str("pos2-arlockcnt     =5\n");
    text.push_str("pos2-minfixsats    =4\n");
    text.push_str("pos2-minholdsats   =5\n");
    text.push_str("pos2-arelmask      =15\n");
    text.push_str("pos2-maxage        =30\n");
    text.push_str("pos2-slipthres     =0.05\n");
    text.push_str("\n# solution output\n");
    text.push_str("out-solformat      =llh\n");
    text.push_str("out-outhead        =on\n");
    text.push_str("out-outopt         =off\n");
    text.push_str("out-timesys        =gpst\n");
    text.push_str("out-timeform       =hms\n");
    text.push_str("out-timendec       =3\n");
    text.push_str("out-degform        =deg\n");
    text.push_str("out-height         =ellipsoidal\n");
    text.push_str("out-outsingle      =on\n");
    text.push_str("\n# rover antenna\n");
    text.push_str("ant1-postype       =llh\n");
    text.push_str("ant1-anttype       =*\n");
    text.push_str("\n# base antenna, fixed at the surveyed Base position\n");
    text.push_str("ant2-postype       =llh\n");
    text.push_str(&format!("ant2-pos1          ={:.9}\n", base_position.lat));
    text.push_str(&format!("ant2-pos2          ={:.9}\n", base_position.lon));
    text.push_str(&format!("ant2-pos3          ={:.4}\n", base_position.alt));
    text.push_str("ant2-anttype       =*\n");
    text.push_str("\n# input streams\n");
    text.push_str("inpstr1-type       =tcpcli\n");
    text.push_str(&format!("inpstr1-path       ={}\n", rover.endpoint));
    text.push_str(&format!("inpstr1-format     ={}\n", stream_format(rover.protocol)));
    text.push_str("inpstr2-type       =tcpcli\n");
    text.push_str(&format!("inpstr2-path       ={}\n", base.endpoint));
    text.push_str(&format!("inpstr2-format     ={}\n", stream_format(base.protocol)));
    text.push_str("inpstr2-nmeareq    =off\n");
    text.push_str("inpstr3-type       =off\n");
    text.push_str("\n# output streams\n");
    text.push_str("outstr1-type       =file\n");
    text.push_str(&format!("outstr1-path       ={}\n", solution_path.display()));
    text.push_str("outstr1-format     =llh\n");
    text.push_str("outstr2-type       =off\n");
    text.push_str("logstr1-type       =off\n");
    text.push_str("logstr2-type       =off\n");
    text.push_str("logstr3-type       =off\n");
    text.push_str("\n# miscellaneous\n");
    text.push_str("misc-svrcycle      =10\n");
    text.push_str("misc-timeout       =10000\n");
    text.push_str("misc-reconnect     =10000\n");
    text.push_str("misc-buffsize      =32768\n");
    text.push_str("misc-navmsgsel     =all\n");
    text.push_str(&format!("file-tracefile     ={}\n", trace_path.display()));
    Ok(text)
}


/**
 * Writes the configuration into `output_dir` and returns the job describing
 * where the engine will read and write.
 */
pub fn generate_config(rover: &Receiver, base: &Receiver, output_dir: &Path) -> Result<EngineJob> {
    let job = EngineJob::for_rover(&rover.serial, output_dir);
    let text = render_config(rover, base, &job)?;

    match fs::create_dir_all(&job.run_dir) {
        Ok(_) => (),
        Err(e) => return Err(Error::io(&job.run_dir, e)),
    }
    let mut file = match File::create(&job.config_path) {
        Ok(file) => file,
        Err(e) => return Err(Error::io(&job.config_path, e)),
    };
    match file.write_all(text.as_bytes()) {
        Ok(_) => (),
        Err(e) => return Err(Error::io(&job.config_path, e)),
    }
    debug!("Wrote {} bytes to {}", text.len(), job.config_path.display());
    Ok(job)
}

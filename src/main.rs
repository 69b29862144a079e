extern crate ctrlc;
extern crate getopts;
extern crate libc;
#[macro_use]
extern crate log;
extern crate rtk_survey;
extern crate simplelog;

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process;
use std::str::FromStr;
use std::time::Duration;

use getopts::{Matches, Options};
use log::LevelFilter;
use simplelog::{ColorChoice, CombinedLogger, Config, SharedLogger, TermLogger, TerminalMode, WriteLogger};

use rtk_survey::error::Error;
use rtk_survey::orchestrator::Orchestrator;
use rtk_survey::settings::Settings;
use rtk_survey::stream_verifier::TcpProbe;
use rtk_survey::supervisor::RtkrcvLauncher;

const EXIT_DONE: i32 = 0;
const EXIT_ABORTED: i32 = 1;
const EXIT_CONFIGURATION: i32 = 2;


struct Invocation {
    settings: Settings,
    config_path: PathBuf,
    output_path: PathBuf,
    verify_only: bool,
}


fn main() {
    let invocation = match handle_opts() {
        Ok(Some(invocation)) => invocation,
        Ok(None) => return,
        Err(message) => {
            eprintln!("{}", message);
            process::exit(EXIT_CONFIGURATION);
        }
    };
    info!("Starting up");

    let launcher = RtkrcvLauncher::new(&invocation.settings.engine_path);
    let mut orchestrator = Orchestrator::new(
        invocation.settings,
        Box::new(TcpProbe),
        Box::new(launcher));

    if invocation.verify_only {
        process::exit(verify_only(&mut orchestrator, &invocation.config_path));
    }

    let shutdown = orchestrator.shutdown();
    let handler = ctrlc::set_handler(move || {
        warn!("Interrupted, stopping the engine and saving results");
        shutdown.request();
    });
    if let Err(e) = handler {
        warn!("Unable to install the interrupt handler: {}", e);
    }

    let report = match orchestrator.run(&invocation.config_path, &invocation.output_path) {
        Ok(report) => report,
        Err(e @ Error::Configuration(_)) => {
            error!("{}", e);
            process::exit(EXIT_CONFIGURATION);
        },
        Err(e) => {
            error!("{}", e);
            process::exit(EXIT_ABORTED);
        },
    };

    info!("Final receiver positions:");
    for receiver in &report.receivers {
        info!("  {}", receiver);
    }
    for &(ref serial, ref outcome) in &report.rovers {
        info!("  Rover {}: {}", serial, outcome);
    }

    if report.is_done() {
        info!("Run complete");
        process::exit(EXIT_DONE);
    }
    match (report.aborted_at, report.abort_reason) {
        (Some(state), Some(reason)) => error!("Run aborted during {}: {}", state, reason),
        _ => error!("Run aborted"),
    }
    process::exit(EXIT_ABORTED);
}


/**
 * Checks every stream and prints one line per receiver. Returns the exit
 * code.
 */
fn verify_only(orchestrator: &mut Orchestrator, config_path: &Path) -> i32 {
    let entries = match orchestrator.verify_only(config_path) {
        Ok(entries) => entries,
        Err(e @ Error::Configuration(_)) => {
            error!("{}", e);
            return EXIT_CONFIGURATION;
        },
        Err(e) => {
            error!("{}", e);
            return EXIT_ABORTED;
        },
    };
    for entry in &entries {
        println!(
            "{} {} {} at {}: {}",
            if entry.passed() { "OK  " } else { "FAIL" },
            entry.role,
            entry.serial,
            entry.endpoint,
            entry.probe.protocol);
    }
    if entries.iter().all(|entry| entry.passed()) {
        EXIT_DONE
    } else {
        EXIT_ABORTED
    }
}


/// Escape codes only when a terminal is reading.
fn color_choice(stdout_is_tty: bool) -> ColorChoice {
    if stdout_is_tty {
        ColorChoice::Auto
    } else {
        ColorChoice::Never
    }
}


fn parse_number<T: FromStr>(matches: &Matches, name: &str, default: T) -> Result<T, String> {
    match matches.opt_str(name) {
        Some(value) => match value.parse() {
            Ok(number) => Ok(number),
            Err(_) => Err(format!("Invalid value for --{}: {}", name, value)),
        },
        None => Ok(default),
    }
}


fn parse_seconds(matches: &Matches, name: &str, default: Duration) -> Result<Duration, String> {
    parse_number(matches, name, default.as_secs()).map(Duration::from_secs)
}


fn handle_opts() -> Result<Option<Invocation>, String> {
    let defaults = Settings::default();
    let mut opts = Options::new();
    opts.optopt("c", "config", "Receiver definitions (JSON).", "FILE");
    opts.optopt("o", "output", "Where to save the results. Defaults to the config file.", "FILE");
    opts.optopt("e", "engine", "The rtkrcv executable.", "PATH");
    opts.optopt("w", "work-dir", "Directory for engine configs, solutions and logs.", "DIR");
    opts.optopt("", "probe-timeout", "Seconds to wait when probing a stream.", "SECONDS");
    opts.optopt("", "base-timeout", "Seconds to collect Base position samples.", "SECONDS");
    opts.optopt("", "base-samples", "Base position samples to collect.", "COUNT");
    opts.optopt("", "median-samples", "Distinct FIX solutions per Rover.", "COUNT");
    opts.optopt("", "rover-timeout", "Seconds to wait for a Rover FIX, unless the Rover sets its own.", "SECONDS");
    opts.optflag("", "verify-only", "Only check the receiver streams. Nothing is launched or saved.");
    opts.optflag("", "keep-logs", "Keep engine files after successful acquisitions.");
    opts.optopt("l", "log-file", "Also write the log to this file.", "FILE");
    opts.optflag("v", "verbose", "Prints extra logging.");
    opts.optflag("h", "help", "Print this help menu.");
    let mut args = std::env::args();
    args.next();  // Skip the program name
    let matches = match opts.parse(args) {
        Ok(m) => m,
        Err(e) => return Err(format!("Unable to parse options: {}", e)),
    };
    if matches.opt_present("h") {
        print_usage(opts);
        return Ok(None);
    }

    let level = if matches.opt_present("v") {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        };
    let mut loggers: Vec<Box<dyn SharedLogger>> = Vec::new();
    let color = color_choice(unsafe { libc::isatty(libc::STDOUT_FILENO) } == 1);
    loggers.push(TermLogger::new(level, Config::default(), TerminalMode::Mixed, color));
    if let Some(path) = matches.opt_str("l") {
        match File::create(&path) {
            Ok(file) => loggers.push(WriteLogger::new(level, Config::default(), file)),
            Err(e) => return Err(format!("Unable to open log file {}: {}", path, e)),
        }
    }
    match CombinedLogger::init(loggers) {
        Ok(_) => (),
        Err(e) => return Err(format!("Unable to initialize logger: {}", e)),
    }

    let config_path = match matches.opt_str("c") {
        Some(path) => PathBuf::from(path),
        None => {
            print_usage(opts);
            return Err("Missing required option --config".to_string());
        }
    };
    let output_path = matches.opt_str("o").map(PathBuf::from).unwrap_or_else(|| config_path.clone());

    let settings = Settings {
        engine_path: matches.opt_str("e").map(PathBuf::from).unwrap_or(defaults.engine_path),
        work_dir: matches.opt_str("w").map(PathBuf::from).unwrap_or(defaults.work_dir),
        probe_timeout: parse_seconds(&matches, "probe-timeout", defaults.probe_timeout)?,
        base_timeout: parse_seconds(&matches, "base-timeout", defaults.base_timeout)?,
        base_samples: parse_number(&matches, "base-samples", defaults.base_samples)?,
        median_samples: parse_number(&matches, "median-samples", defaults.median_samples)?,
        rover_timeout: parse_seconds(&matches, "rover-timeout", defaults.rover_timeout)?,
        keep_logs: matches.opt_present("keep-logs"),
        ..defaults
    };
    if settings.base_samples == 0 || settings.median_samples == 0 {
        return Err("Sample counts must be positive".to_string());
    }
    Ok(Some(Invocation {
        settings: settings,
        config_path: config_path,
        output_path: output_path,
        verify_only: matches.opt_present("verify-only"),
    }))
}


fn print_usage(opts: Options) {
    let brief = "Usage: rtk-survey -c FILE [options]";
    print!("{}", opts.usage(&brief));
}

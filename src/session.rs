/**
 * Runs an acquisition as a background child process and relays its output.
 * A service that surveys on an operator's behalf owns one session per run,
 * reads progress lines from it (the `[BASE_STATUS]` and `[RTK_STATUS]`
 * lines included) and can cancel it.
 */
use std::ffi::OsStr;
use std::io::{self, BufRead, BufReader, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread::{spawn, JoinHandle};
use std::time::Duration;

use crate::poll::{poll_until, Step};

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(50);


#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}


#[derive(Clone, Debug, PartialEq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}


pub struct RunSession {
    child: Child,
    lines_rx: Receiver<OutputLine>,
    readers: Vec<JoinHandle<()>>,
    status: Option<ExitStatus>,
}


fn spawn_reader<R>(source: R, stream: OutputStream, lines_tx: Sender<OutputLine>) -> JoinHandle<()>
    where R: Read + Send + 'static
{
    spawn(move || {
        for line in BufReader::new(source).lines() {
            let text = match line {
                Ok(text) => text,
                Err(e) => {
                    debug!("Stopped reading {:?}: {}", stream, e);
                    return;
                }
            };
            if lines_tx.send(OutputLine { stream: stream, text: text }).is_err() {
                // Nobody is listening anymore
                return;
            }
        }
    })
}


impl RunSession {
    /**
     * Starts `program` with `args`, capturing both output streams.
     */
    pub fn launch<I, S>(program: &OsStr, args: I) -> io::Result<RunSession>
        where I: IntoIterator<Item = S>, S: AsRef<OsStr>
    {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        info!("Run started (PID: {})", child.id());

        let (lines_tx, lines_rx) = channel();
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, OutputStream::Stdout, lines_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, OutputStream::Stderr, lines_tx));
        }
        Ok(RunSession {
            child: child,
            lines_rx: lines_rx,
            readers: readers,
            status: None,
        })
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// The next pending output line, without blocking.
    pub fn try_next_line(&self) -> Option<OutputLine> {
        match self.lines_rx.try_recv() {
            Ok(line) => Some(line),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /**
     * Waits up to `timeout` for an output line. None on timeout, or once the
     * run has exited and every line has been read.
     */
    pub fn next_line_timeout(&self, timeout: Duration) -> Option<OutputLine> {
        match self.lines_rx.recv_timeout(timeout) {
            Ok(line) => Some(line),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn is_running(&mut self) -> bool {
        if self.status.is_some() {
            return false;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.status = Some(status);
                false
            },
            Ok(None) => true,
            Err(e) => {
                warn!("Unable to query run {}: {}", self.child.id(), e);
                false
            }
        }
    }

    /**
     * Sends SIGTERM and waits up to `grace` for the run to wind down. The run
     * stops its engine and saves what it has before exiting. Kills it if it
     * is still running after `grace`.
     */
    pub fn cancel(&mut self, grace: Duration) -> io::Result<ExitStatus> {
        if self.is_running() {
            let pid = self.child.id() as libc::pid_t;
            info!("Cancelling run {}", pid);
            if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
                warn!("Unable to send SIGTERM to run {}: {}", pid, io::Error::last_os_error());
            }
            let stopped = poll_until(CANCEL_POLL_INTERVAL, grace, |_| {
                if self.is_running() { Step::Pending } else { Step::Ready(()) }
            });
            if stopped.is_none() {
                warn!("Run {} ignored SIGTERM, killing it", pid);
                match self.child.kill() {
                    Ok(_) => (),
                    Err(e) => warn!("Unable to kill run {}: {}", pid, e),
                }
            }
        }
        self.wait()
    }

    /// Blocks until the run exits. Output lines stay readable afterwards.
    pub fn wait(&mut self) -> io::Result<ExitStatus> {
        let status = match self.status {
            Some(status) => status,
            None => {
                let status = self.child.wait()?;
                self.status = Some(status);
                status
            }
        };
        for reader in self.readers.drain(..) {
            match reader.join() {
                Ok(_) => (),
                Err(_) => error!("Unable to join output reader, reader thread panicked"),
            }
        }
        Ok(status)
    }
}


impl Drop for RunSession {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

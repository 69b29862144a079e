/**
 * Bounded polling shared by the Base acquirer and the engine supervisor.
 */
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};


pub enum Step<T> {
    Ready(T),
    Pending,
}


/**
 * Calls `step` with the time remaining until `timeout`, sleeping `interval`
 * between calls, until it returns Ready or the deadline passes. The step is
 * called at least once. Returns None on timeout.
 */
pub fn poll_until<T, F>(interval: Duration, timeout: Duration, mut step: F) -> Option<T>
    where F: FnMut(Duration) -> Step<T>
{
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match step(remaining) {
            Step::Ready(value) => return Some(value),
            Step::Pending => (),
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining == Duration::from_secs(0) {
            return None;
        }
        thread::sleep(interval.min(remaining));
    }
}


/**
 * A request to wind a run down, shared between the signal handler and the
 * loops that poll. Clones share the same flag.
 */
#[derive(Clone, Debug, Default)]
pub struct Shutdown {
    requested: Arc<AtomicBool>,
}


impl Shutdown {
    pub fn new() -> Shutdown {
        Shutdown::default()
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

use std::io;
use std::process::{Child, ExitStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::flag;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Set once SIGINT, SIGTERM or SIGHUP arrives.
///
/// Registering replaces the default "terminate" disposition, so the launcher
/// survives the signal long enough to stop its container.
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    flag: Arc<AtomicBool>,
}

impl Interrupt {
    pub fn register() -> io::Result<Self> {
        let interrupt = Self::default();
        for signal in [SIGINT, SIGTERM, SIGHUP] {
            flag::register(signal, Arc::clone(&interrupt.flag))?;
        }
        Ok(interrupt)
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }
}

/// How an attached child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildExit {
    Code(i32),
    Interrupted,
}

/// Exit status as a shell reports it: `128 + N` for death by signal N.
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

/// Wait for `child`, killing it if the launcher is interrupted first.
///
/// A child that dies from a signal while the launcher's own flag is set
/// (the terminal delivered SIGINT to both) counts as interrupted.
pub fn wait_or_interrupt(child: &mut Child, interrupt: &Interrupt) -> io::Result<ChildExit> {
    loop {
        if let Some(status) = child.try_wait()? {
            if status.code().is_none() && interrupt.is_set() {
                return Ok(ChildExit::Interrupted);
            }
            return Ok(ChildExit::Code(exit_code(status)));
        }
        if interrupt.is_set() {
            log::debug!("interrupted, killing child {}", child.id());
            let _ = child.kill();
            child.wait()?;
            return Ok(ChildExit::Interrupted);
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

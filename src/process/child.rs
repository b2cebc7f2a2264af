use std::io;

use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use tokio::{process::Child, sync::watch};

use super::status::StageExitStatus;

/// The live process behind a stage.
#[derive(Debug)]
pub enum StageChild {
    Process(Child),
    /// A debuggee reaped by its harvester thread, which publishes the exit
    /// code once the root process is gone.
    Traced(TracedChild),
}

#[derive(Debug)]
pub struct TracedChild {
    pub pid: Pid,
    pub exit: watch::Receiver<Option<i32>>,
}

impl From<Child> for StageChild {
    fn from(value: Child) -> Self {
        Self::Process(value)
    }
}

impl From<TracedChild> for StageChild {
    fn from(value: TracedChild) -> Self {
        Self::Traced(value)
    }
}

fn exited_unexpectedly() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "Child exited unexpectedly")
}

impl StageChild {
    pub fn id(&self) -> Option<i32> {
        match self {
            Self::Process(process) => process.id().map(|id| id as i32),
            Self::Traced(traced) => Some(traced.pid.as_raw()),
        }
    }

    pub async fn wait(&mut self) -> io::Result<StageExitStatus> {
        match self {
            Self::Process(process) => process.wait().await.map(Into::into),
            Self::Traced(traced) => loop {
                if let Some(code) = *traced.exit.borrow_and_update() {
                    break Ok(StageExitStatus::Traced(code));
                }
                traced.exit.changed().await.map_err(|_| exited_unexpectedly())?;
            },
        }
    }

    /// The exit status if the process is already gone.
    pub fn try_status(&mut self) -> Option<StageExitStatus> {
        match self {
            Self::Process(process) => process.try_wait().ok().flatten().map(Into::into),
            Self::Traced(traced) => (*traced.exit.borrow()).map(StageExitStatus::Traced),
        }
    }

    pub fn is_running(&mut self) -> bool {
        match self {
            Self::Process(process) => matches!(process.try_wait(), Ok(None)),
            Self::Traced(traced) => {
                traced.exit.borrow().is_none() && traced.exit.has_changed().is_ok()
            }
        }
    }

    pub fn signal(&self, signal: Signal) -> io::Result<()> {
        let id = self.id().ok_or_else(exited_unexpectedly)?;
        kill(Pid::from_raw(id), signal)?;
        Ok(())
    }

    /// Forcibly terminates the process.
    pub fn kill(&mut self) -> io::Result<()> {
        match self {
            Self::Process(process) => process.start_kill(),
            Self::Traced(_) => self.signal(Signal::SIGKILL),
        }
    }
}

use std::{
    fmt::Display,
    fs::{File, OpenOptions},
    io::{self, Write},
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    path::Path,
    sync::{Mutex, MutexGuard, PoisonError},
};

use nix::{
    fcntl::{fcntl, FcntlArg, OFlag},
    unistd::{close, dup2, pipe2},
};
use once_cell::sync::Lazy;

use super::buffer::OutputBuffer;
use crate::{
    cancel::Cancellation,
    cmd::execution_plan::{InputSource, OutputTarget, Stage},
    error::{ExecError, ExecResult},
};

/// Serializes every change to fds 0/1/2. Held from capture to restore.
static STANDARD_STREAMS: Lazy<Mutex<()>> = Lazy::new(Mutex::default);

const STDIN: RawFd = 0;
const STDOUT: RawFd = 1;
const STDERR: RawFd = 2;
const NULL_DEVICE: &str = "/dev/null";

/// The standard streams as they were before a stage's redirection went live.
///
/// Dropping the snapshot restores them, so every early return reverts.
pub struct RedirectSnapshot {
    saved: [Option<OwnedFd>; 3],
    overridden: [bool; 3],
    stdout_stderr_aliased: bool,
    created: Vec<OwnedFd>,
    next_input: Option<OwnedFd>,
    routing: Option<(Cancellation, bool)>,
    restored: bool,
    _lock: MutexGuard<'static, ()>,
}

impl RedirectSnapshot {
    /// Takes the stream lock and records close-on-exec duplicates of fds
    /// 0/1/2. A stream that is closed is recorded as absent.
    pub fn capture() -> Self {
        let lock = STANDARD_STREAMS
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        Self {
            saved: [STDIN, STDOUT, STDERR].map(duplicate),
            overridden: [false; 3],
            stdout_stderr_aliased: false,
            created: Vec::new(),
            next_input: None,
            routing: None,
            restored: false,
            _lock: lock,
        }
    }

    pub fn is_overridden(&self, stream: RawFd) -> bool {
        self.overridden.get(stream as usize).copied().unwrap_or(false)
    }

    pub fn is_aliased(&self) -> bool {
        self.stdout_stderr_aliased
    }

    /// The read end of the pipe installed as stdout, destined for the next
    /// stage's stdin.
    pub fn take_next_input(&mut self) -> Option<OwnedFd> {
        self.next_input.take()
    }

    pub fn revert(mut self) {
        self.restore();
    }

    fn install(&mut self, fd: OwnedFd, stream: RawFd, target: impl Display) -> ExecResult<()> {
        dup2(fd.as_raw_fd(), stream).map_err(|err| redirect_error(target, err.into()))?;
        self.overridden[stream as usize] = true;
        self.created.push(fd);
        Ok(())
    }

    fn alias(&mut self, from: RawFd, to: RawFd) -> ExecResult<()> {
        dup2(from, to).map_err(|err| redirect_error(format!("&{from}"), err.into()))?;
        self.overridden[to as usize] = true;
        self.stdout_stderr_aliased = true;
        Ok(())
    }

    fn open_input(&mut self, stage: &mut Stage) -> ExecResult<()> {
        match stage.stdin.clone() {
            InputSource::Inherit => Ok(()),
            InputSource::File(path) => {
                let file = File::open(&path).map_err(|err| redirect_error(path.display(), err))?;
                self.install(file.into(), STDIN, path.display())
            }
            InputSource::Null => self.install(open_null(false)?, STDIN, NULL_DEVICE),
            InputSource::PipeFromPrevious => match stage.piped_input.take() {
                Some(reader) => self.install(reader, STDIN, "pipe"),
                None => {
                    // the producing stage never started
                    self.install(open_null(false)?, STDIN, NULL_DEVICE)
                }
            },
        }
    }

    fn open_output(
        &mut self,
        stage: &mut Stage,
        target: &OutputTarget,
        stream: RawFd,
    ) -> ExecResult<()> {
        match target {
            OutputTarget::Inherit | OutputTarget::SameAsOther => Ok(()),
            OutputTarget::Overwrite(path) => {
                let file = open_output_file(path, false)?;
                self.install(file.into(), stream, path.display())
            }
            OutputTarget::Append(path) => {
                let file = open_output_file(path, true)?;
                self.install(file.into(), stream, path.display())
            }
            OutputTarget::Null => self.install(open_null(true)?, stream, NULL_DEVICE),
            OutputTarget::PipeToNext if stream == STDOUT => {
                let (reader, writer) = pipe()?;
                self.install(writer, stream, "pipe")?;
                self.next_input = Some(reader);
                Ok(())
            }
            OutputTarget::PipeToNext => {
                warn!(stream, "only stdout can pipe to the next stage");
                Ok(())
            }
            OutputTarget::Buffer => {
                let (reader, writer) = pipe()?;
                self.install(writer, stream, "buffer")?;

                let slot = if stream == STDOUT {
                    &mut stage.stdout_buffer
                } else {
                    &mut stage.stderr_buffer
                };
                let buffer = slot.get_or_insert_with(OutputBuffer::new).clone();
                stage.pending_drains.push((buffer, reader));
                Ok(())
            }
        }
    }

    fn restore(&mut self) {
        if self.restored {
            return;
        }
        self.restored = true;

        flush_standard_streams();

        for stream in [STDIN, STDOUT, STDERR] {
            if !self.overridden[stream as usize] {
                continue;
            }

            let result = match &self.saved[stream as usize] {
                Some(saved) => dup2(saved.as_raw_fd(), stream).map(drop),
                None => close(stream),
            };

            if let Err(err) = result {
                error!(stream, %err, "failed to restore standard stream");
            }
        }

        self.created.clear();
        self.next_input = None;

        if let Some((cancel, routed)) = self.routing.take() {
            cancel.restore_routing(routed);
        }

        trace!(
            overridden = ?self.overridden,
            aliased = self.stdout_stderr_aliased,
            "standard streams restored"
        );
    }
}

impl Drop for RedirectSnapshot {
    fn drop(&mut self) {
        self.restore();
    }
}

/// Makes the stage's redirection the live fds 0/1/2 of this process, so the
/// next child created inherits it.
///
/// Buffered outputs get their pipe and buffer here, before the process
/// exists; the pumps are started by the caller from `stage.pending_drains`.
pub fn apply(
    stage: &mut Stage,
    cancel: &Cancellation,
    enable_ctrl_c: bool,
) -> ExecResult<RedirectSnapshot> {
    let mut snapshot = RedirectSnapshot::capture();
    flush_standard_streams();

    snapshot.open_input(stage)?;

    let stdout = stage.stdout.clone();
    let stderr = stage.stderr.clone();

    match (&stdout, &stderr) {
        (OutputTarget::SameAsOther, OutputTarget::SameAsOther) => {
            warn!("both output streams alias each other, leaving them alone");
        }
        (OutputTarget::SameAsOther, _) => {
            snapshot.open_output(stage, &stderr, STDERR)?;
            snapshot.alias(STDERR, STDOUT)?;
        }
        (_, OutputTarget::SameAsOther) => {
            snapshot.open_output(stage, &stdout, STDOUT)?;
            snapshot.alias(STDOUT, STDERR)?;
        }
        _ => {
            snapshot.open_output(stage, &stdout, STDOUT)?;
            snapshot.open_output(stage, &stderr, STDERR)?;
        }
    }

    let routed = if enable_ctrl_c {
        cancel.enable()
    } else {
        cancel.ignore()
    };
    snapshot.routing = Some((cancel.clone(), routed));

    trace!(
        stage = %stage.text,
        overridden = ?snapshot.overridden,
        "redirection applied"
    );

    Ok(snapshot)
}

fn duplicate(stream: RawFd) -> Option<OwnedFd> {
    fcntl(stream, FcntlArg::F_DUPFD_CLOEXEC(STDERR + 1))
        .ok()
        .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) })
}

fn pipe() -> ExecResult<(OwnedFd, OwnedFd)> {
    let (reader, writer) =
        pipe2(OFlag::O_CLOEXEC).map_err(|err| redirect_error("pipe", err.into()))?;
    Ok(unsafe { (OwnedFd::from_raw_fd(reader), OwnedFd::from_raw_fd(writer)) })
}

fn open_null(write: bool) -> ExecResult<OwnedFd> {
    OpenOptions::new()
        .read(!write)
        .write(write)
        .open(NULL_DEVICE)
        .map(OwnedFd::from)
        .map_err(|err| redirect_error(NULL_DEVICE, err))
}

fn open_output_file(path: &Path, append: bool) -> ExecResult<File> {
    let mut options = OpenOptions::new();
    if append {
        options.append(true);
    } else {
        options.write(true).truncate(true);
    }

    options
        .create(true)
        .open(path)
        .map_err(|err| redirect_error(path.display(), err))
}

fn redirect_error(target: impl Display, source: io::Error) -> ExecError {
    ExecError::Redirect {
        target: target.to_string(),
        source,
    }
}

fn flush_standard_streams() {
    let _ = io::stdout().flush();
    let _ = io::stderr().flush();
}

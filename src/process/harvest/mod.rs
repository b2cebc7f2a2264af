//! Recovering the environment and current directory of a finished stage.
//!
//! The stage is started as a ptrace debuggee of a dedicated thread. That
//! thread follows the debuggee and everything it forks; when the root process
//! is about to exit it reads the process parameters out of it and makes them
//! the shell's own.

use std::{
    collections::HashSet,
    io,
    os::unix::process::CommandExt,
    process::Command,
    sync::{mpsc, Arc},
    thread::{self, JoinHandle},
};

use nix::{
    errno::Errno,
    sys::{
        ptrace::{self, Event, Options},
        signal::Signal,
        wait::{waitpid, WaitPidFlag, WaitStatus},
    },
    unistd::Pid,
};
use tokio::sync::watch;

use self::params::ProcessParameters;
use super::{child::TracedChild, status::signaled_code, DebuggedChild, StageRuntime};
use crate::{
    config::HarvestConfig,
    env::{AliasSource, AliasTable},
    error::{ExecError, ExecResult},
    Shell,
};

pub mod params;

/// Starts `command` as a debuggee on a new harvester thread and blocks until
/// the process exists. Redirection must already be applied; the child
/// inherits fds 0/1/2 at creation like any other.
pub fn start(
    mut command: Command,
    shell: &Shell,
    runtime: Arc<StageRuntime>,
) -> ExecResult<(TracedChild, JoinHandle<()>)> {
    let program = command.get_program().to_string_lossy().into_owned();

    unsafe {
        command.pre_exec(|| ptrace::traceme().map_err(io::Error::from));
    }

    let (init_tx, init_rx) = mpsc::sync_channel(1);
    let (exit_tx, exit_rx) = watch::channel(None);

    let pump = DebugPump {
        runtime,
        config: shell.config().harvest.clone(),
        aliases: shell.aliases().clone(),
        system_aliases: shell.system_aliases(),
        exit: exit_tx,
        tracees: Vec::new(),
        fresh: HashSet::new(),
        root: None,
        root_started: false,
        applied: false,
    };

    let handle = thread::Builder::new()
        .name("shex-harvest".into())
        .spawn(move || pump.run(command, init_tx))
        .map_err(|source| ExecError::Launch {
            program: program.clone(),
            source,
        })?;

    let init = init_rx.recv().unwrap_or_else(|_| {
        Err(io::Error::new(
            io::ErrorKind::Other,
            "harvester exited during initialization",
        ))
    });

    match init {
        Ok(pid) => {
            debug!(%pid, %program, "harvested stage started");
            Ok((TracedChild { pid, exit: exit_rx }, handle))
        }
        Err(source) => {
            if handle.join().is_err() {
                warn!("harvester thread panicked");
            }
            Err(ExecError::Launch { program, source })
        }
    }
}

struct DebugPump {
    runtime: Arc<StageRuntime>,
    config: HarvestConfig,
    aliases: AliasTable,
    system_aliases: Arc<dyn AliasSource>,
    exit: watch::Sender<Option<i32>>,
    tracees: Vec<Pid>,
    /// Auto-attached children whose initial stop has not been seen yet.
    fresh: HashSet<Pid>,
    root: Option<Pid>,
    root_started: bool,
    applied: bool,
}

impl DebugPump {
    fn run(mut self, mut command: Command, init: mpsc::SyncSender<io::Result<Pid>>) {
        let aliases_before = self.system_aliases.system_aliases();

        let root = match command.spawn() {
            Ok(child) => Pid::from_raw(child.id() as i32),
            Err(err) => {
                let _ = init.send(Err(err));
                return;
            }
        };

        self.root = Some(root);
        self.tracees.push(root);
        self.runtime.set_process_id(Some(root.as_raw()));
        let _ = init.send(Ok(root));
        drop(init);

        let flags = WaitPidFlag::WNOHANG | WaitPidFlag::__WALL;

        while !self.tracees.is_empty() {
            let mut progressed = false;

            for pid in self.tracees.clone() {
                match waitpid(pid, Some(flags)) {
                    Ok(WaitStatus::StillAlive) => {}
                    Ok(status) => {
                        progressed = true;
                        self.handle(status);
                    }
                    Err(Errno::EINTR) => {}
                    Err(err) => {
                        debug!(%pid, %err, "lost track of tracee");
                        self.exited(pid, None);
                    }
                }
            }

            if !progressed {
                thread::sleep(self.config.poll_interval());
            }
        }

        if self.applied {
            if let (Some(before), Some(after)) =
                (aliases_before, self.system_aliases.system_aliases())
            {
                self.aliases.merge_changed(&before, &after);
            }
        }

        self.runtime.mark_debug_pump_finished();
        trace!(%root, applied = self.applied, "debug pump finished");
    }

    fn handle(&mut self, status: WaitStatus) {
        match status {
            WaitStatus::Stopped(pid, Signal::SIGTRAP)
                if Some(pid) == self.root && !self.root_started =>
            {
                // the trap raised by the initial exec
                self.root_started = true;
                let options = Options::PTRACE_O_TRACEFORK
                    | Options::PTRACE_O_TRACEVFORK
                    | Options::PTRACE_O_TRACEEXEC
                    | Options::PTRACE_O_TRACEEXIT
                    | Options::PTRACE_O_EXITKILL;
                if let Err(err) = ptrace::setoptions(pid, options) {
                    warn!(%pid, %err, "cannot follow children of harvested stage");
                }
                resume(pid, None);
            }
            WaitStatus::Stopped(pid, Signal::SIGSTOP) if self.fresh.remove(&pid) => {
                resume(pid, None);
            }
            WaitStatus::Stopped(pid, signal) => resume(pid, Some(signal)),
            WaitStatus::PtraceEvent(pid, _, event) => {
                self.event(pid, event);
                resume(pid, None);
            }
            WaitStatus::Exited(pid, code) => self.exited(pid, Some(code)),
            WaitStatus::Signaled(pid, signal, _) => {
                self.exited(pid, Some(signaled_code(signal as i32)))
            }
            WaitStatus::PtraceSyscall(pid) => resume(pid, None),
            WaitStatus::Continued(_) | WaitStatus::StillAlive => {}
        }
    }

    fn event(&mut self, pid: Pid, event: i32) {
        if event == Event::PTRACE_EVENT_FORK as i32 || event == Event::PTRACE_EVENT_VFORK as i32 {
            match ptrace::getevent(pid) {
                Ok(child) => {
                    let child = Pid::from_raw(child as i32);
                    trace!(parent = %pid, %child, "tracee forked");
                    self.tracees.push(child);
                    self.fresh.insert(child);
                    self.runtime.debugged_children().push(DebuggedChild {
                        pid: child,
                        initial_thread: child,
                    });
                }
                Err(err) => warn!(%pid, %err, "cannot identify forked tracee"),
            }
        } else if event == Event::PTRACE_EVENT_EXIT as i32 && Some(pid) == self.root {
            if self.runtime.capture_environment_on_exit() {
                let parameters = ProcessParameters::read(pid, &self.config);
                self.applied = parameters.apply();
                debug!(%pid, applied = self.applied, "harvested process parameters");
            } else {
                trace!(%pid, "stage detached, environment left alone");
            }
        }
    }

    fn exited(&mut self, pid: Pid, code: Option<i32>) {
        self.tracees.retain(|&tracee| tracee != pid);
        self.fresh.remove(&pid);

        if Some(pid) == self.root {
            let code = code.unwrap_or(super::status::EXIT_FAILURE);
            trace!(%pid, code, "harvested stage exited");
            self.exit.send_replace(Some(code));
        } else {
            self.runtime
                .debugged_children()
                .retain(|child| child.pid != pid);
        }
    }
}

fn resume(pid: Pid, signal: Option<Signal>) {
    if let Err(err) = ptrace::cont(pid, signal) {
        // gone between the stop and the resume
        trace!(%pid, %err, "cannot resume tracee");
    }
}

use std::{
    os::fd::OwnedFd,
    path::{Path, PathBuf},
};

use nix::sys::signal::{kill, Signal};

use super::{
    delegate::delegate_to_subshell,
    execution_plan::{next_stage, ExecPlan, OutputTarget, Stage},
};
use crate::{
    builtins::{BuiltinCommand, BuiltinCommands},
    prelude::*,
    process::{
        buffer::OutputBuffer,
        launch::{self, is_url},
        monitor::{self, WaitOutcome},
        redirect,
        status::{signaled_code, EXIT_FAILURE, EXIT_SUCCESS},
    },
};

enum StageResult {
    Status(i32),
    /// Handed to a subshell; nothing else in the plan runs here.
    Delegated,
}

impl ExecPlan {
    /// Runs the plan stage by stage and records each exit code as the
    /// shell's error level.
    ///
    /// Returns the output buffer most recently written by a stage, so a
    /// caller that redirected stages into buffers can read what they wrote.
    pub async fn execute(&mut self, shell: &Shell, want_output: bool) -> Option<OutputBuffer> {
        if self.is_empty() {
            return None;
        }

        if !want_output && self.len() > 1 && !self.wait_for_completion && !shell.is_subshell() {
            self.delegate(shell);
            return None;
        }

        let rules = self.rules();
        let mut current = 0;
        let mut last_buffer: Option<(OutputBuffer, bool)> = None;

        loop {
            let stage = &mut self.stages_mut()[current];

            if stage.stdout.is_buffer() && stage.stdout_buffer.is_none() {
                if let Some((buffer, true)) = &last_buffer {
                    trace!(stage = %stage.text, "chaining output buffer");
                    stage.stdout_buffer = Some(buffer.clone());
                }
            }

            if shell.cancel().is_set() {
                debug!(plan = %self.text, stage = current, "cancelled before stage");
                break;
            }

            let status = match self.run_stage(current, shell).await {
                Ok(StageResult::Status(code)) => code,
                Ok(StageResult::Delegated) => {
                    shell.set_error_level(EXIT_SUCCESS);
                    return None;
                }
                Err(err) => {
                    report(&err);
                    shell.set_error_level(EXIT_FAILURE);
                    if err.is_redirection() {
                        break;
                    }
                    EXIT_FAILURE
                }
            };

            shell.set_error_level(status);
            trace!(stage = current, status, "stage finished");

            let stage = &self.stages()[current];
            if let Some(buffer) = stage.stdout_buffer() {
                last_buffer = Some((buffer.clone(), stage.wait_for_completion));
            }

            match next_stage(&rules, current, status) {
                Some(next) => current = next,
                None => break,
            }
        }

        if shell.cancel().is_set() {
            self.cancel_stages(shell).await;
        }

        self.release(shell).await;

        last_buffer.map(|(buffer, _)| buffer)
    }

    fn delegate(&self, shell: &Shell) {
        match delegate_to_subshell(shell, &self.text) {
            Ok(_) => shell.set_error_level(EXIT_SUCCESS),
            Err(err) => {
                report(&err);
                shell.set_error_level(EXIT_FAILURE);
            }
        }
    }

    async fn run_stage(&mut self, index: usize, shell: &Shell) -> ExecResult<StageResult> {
        let single = self.len() == 1;
        let stage = &mut self.stages_mut()[index];
        let program = stage.program().to_owned();

        if let Some(builtin) = BuiltinCommands::from_name(&program) {
            let mut snapshot = redirect::apply(stage, shell.cancel(), true)?;

            // the next stage starts only after the builtin returns
            let held = match snapshot.take_next_input() {
                Some(reader) => {
                    let held = OutputBuffer::new();
                    held.commence(reader)?;
                    Some(held)
                }
                None => None,
            };
            commence_drains(stage)?;

            let status = builtin.execute(shell, &stage.argv[1..]).await;
            snapshot.revert();

            for buffer in [&stage.stdout_buffer, &stage.stderr_buffer, &held]
                .into_iter()
                .flatten()
            {
                buffer.wait_for_finalize().await;
            }

            let next_input = held.map(|held| held.replay()).transpose()?;
            self.hand_off(index, next_input);
            return Ok(StageResult::Status(status.code()));
        }

        let resolved = if is_url(&program) {
            Some(PathBuf::from(&program))
        } else {
            resolve(&program)
        };

        let Some(resolved) = resolved else {
            if single && !stage.wait_for_completion && !shell.is_subshell() {
                delegate_to_subshell(shell, &stage.text)?;
                return Ok(StageResult::Delegated);
            }
            return Err(ExecError::NotFound(program));
        };

        let mut snapshot = redirect::apply(stage, shell.cancel(), false)?;
        let launched = launch::launch(stage, shell, &resolved);
        let next_input = snapshot.take_next_input();
        snapshot.revert();

        if let Err(err) = launched {
            stage.pending_drains.clear();
            return Err(err);
        }
        commence_drains(stage)?;

        let status = if !stage.wait_for_completion || stage.child.is_none() {
            EXIT_SUCCESS
        } else {
            match monitor::wait_for_stage(stage, shell).await? {
                WaitOutcome::Completed(status) => status.code(),
                WaitOutcome::Cancelled => signaled_code(Signal::SIGINT as i32),
                WaitOutcome::Backgrounded => {
                    let id = shell.jobs().register(
                        stage.text.clone(),
                        stage.child.take(),
                        stage.debugger.take(),
                    );
                    eprintln!("[{id}] {}", stage.text);
                    EXIT_SUCCESS
                }
            }
        };

        self.hand_off(index, next_input);
        Ok(StageResult::Status(status))
    }

    fn hand_off(&mut self, index: usize, reader: Option<OwnedFd>) {
        if let (Some(reader), Some(next)) = (reader, self.stages_mut().get_mut(index + 1)) {
            next.piped_input = Some(reader);
        }
    }

    /// Terminates every stage still running: politely first, then by force
    /// once the grace period is over. Harvester threads are joined.
    async fn cancel_stages(&mut self, shell: &Shell) {
        debug!(plan = %self.text, "cancelling plan");

        for stage in self.stages_mut() {
            if stage.has_live_process() {
                if let Some(Err(err)) = stage.child.as_ref().map(|c| c.signal(Signal::SIGTERM)) {
                    trace!(%err, "stage exited before SIGTERM");
                }
            }
        }

        tokio::time::sleep(shell.config().cancel.grace_period()).await;

        for stage in self.stages_mut() {
            if stage.has_live_process() {
                if let Some(Err(err)) = stage.child.as_mut().map(|c| c.kill()) {
                    trace!(%err, "stage exited before SIGKILL");
                }
            }

            if stage.debugger.is_some() {
                for debugged in stage.runtime.debugged_children().iter() {
                    if let Err(err) = kill(debugged.pid, Signal::SIGKILL) {
                        trace!(pid = %debugged.pid, %err, "debuggee exited before SIGKILL");
                    }
                }
            }
        }

        for stage in self.stages_mut() {
            if let Some(debugger) = stage.debugger.take() {
                join_harvester(debugger).await;
            }
        }
    }

    /// Hands whatever still runs over to the job table. Finished harvesters
    /// are joined here.
    async fn release(&mut self, shell: &Shell) {
        for stage in self.stages_mut() {
            if let Some(debugger) = stage.debugger.take() {
                let root_exited = stage.child.as_mut().map_or(true, |c| !c.is_running());
                let settled = root_exited && stage.runtime.debugged_children().is_empty();
                let finished = stage.runtime.debug_pump_finished() || debugger.is_finished();

                if finished || settled {
                    join_harvester(debugger).await;
                } else {
                    shell
                        .jobs()
                        .register(stage.text.clone(), stage.child.take(), Some(debugger));
                    continue;
                }
            }

            if !stage.wait_for_completion && stage.stdout != OutputTarget::PipeToNext {
                if let Some(child) = stage.child.take() {
                    let pid = child.id();
                    let id = shell.jobs().register(stage.text.clone(), Some(child), None);
                    debug!(id, ?pid, "background stage registered");
                }
            }
        }
    }
}

async fn join_harvester(debugger: std::thread::JoinHandle<()>) {
    match tokio::task::spawn_blocking(move || debugger.join()).await {
        Ok(Ok(())) => {}
        Ok(Err(_)) => warn!("harvester thread panicked"),
        Err(err) => warn!(%err, "failed to join harvester thread"),
    }
}

/// Starts the pumps for the buffers the stage's redirection created.
fn commence_drains(stage: &mut Stage) -> ExecResult<()> {
    for (buffer, reader) in stage.pending_drains.drain(..) {
        buffer.commence(reader)?;
    }
    Ok(())
}

/// Finds the executable for a command name. Names with a directory part are
/// taken as paths and only need to exist.
fn resolve(program: &str) -> Option<PathBuf> {
    let path = Path::new(program);
    if path.is_absolute() || path.components().count() > 1 {
        return path.exists().then(|| path.to_owned());
    }

    which::which(program).ok()
}

fn report(err: &ExecError) {
    error!(%err, "stage failed");
    eprintln!("shex: {err}");
}

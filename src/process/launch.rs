use std::{
    ffi::OsStr,
    io,
    path::Path,
    process::Command as StdCommand,
};

use nix::unistd::{setpgid, Pid};
use tokio::process::Command;

use super::{harvest, status::EXIT_FAILURE};
use crate::{
    cmd::execution_plan::{quote_arg, Stage},
    config::Config,
    error::{ExecError, ExecResult},
    Shell,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchStrategy {
    /// Handed to the desktop opener.
    Opener,
    /// A script for this shell, run by a new instance of it.
    ShellScript,
    /// A script for the POSIX interpreter, whose exported environment can be
    /// harvested.
    Batch,
    Direct,
}

/// `scheme://…` or `mailto:`.
pub fn is_url(target: &str) -> bool {
    if target
        .get(..7)
        .map_or(false, |scheme| scheme.eq_ignore_ascii_case("mailto:"))
    {
        return true;
    }

    match target.split_once("://") {
        Some((scheme, rest)) => {
            !rest.is_empty()
                && scheme.starts_with(|c: char| c.is_ascii_alphabetic())
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || "+-.".contains(c))
        }
        None => false,
    }
}

pub fn classify(target: &str, config: &Config) -> LaunchStrategy {
    if is_url(target) {
        return LaunchStrategy::Opener;
    }

    let extension = Path::new(target)
        .extension()
        .and_then(OsStr::to_str)
        .map(str::to_ascii_lowercase);

    match extension {
        Some(ext) if ext == config.launch.script_extension => LaunchStrategy::ShellScript,
        Some(ext) if config.harvest.batch_extensions.contains(&ext) => LaunchStrategy::Batch,
        _ => LaunchStrategy::Direct,
    }
}

/// Starts the stage's process. Redirection must already be applied.
///
/// On success `stage.child` holds the process, except for opener launches,
/// which never yield one.
pub fn launch(stage: &mut Stage, shell: &Shell, program: &Path) -> ExecResult<()> {
    let target = program.to_string_lossy().into_owned();
    let strategy = classify(&target, shell.config());
    trace!(stage = %stage.text, ?strategy, "launching");

    match strategy {
        LaunchStrategy::Opener => open(stage, shell, &target),
        LaunchStrategy::ShellScript => {
            let mut command = Command::new(shell.subshell_program()?);
            command.arg(program).args(&stage.argv[1..]);
            spawn(stage, command)
        }
        LaunchStrategy::Batch if stage.wait_for_completion => {
            let interpreter = &shell.config().harvest.interpreter;
            stage.runtime.set_capture_environment_on_exit(true);

            match harvest::start(
                batch_command(interpreter, program, &stage.argv[1..]),
                shell,
                stage.runtime.clone(),
            ) {
                Ok((child, debugger)) => {
                    stage.child = Some(child.into());
                    stage.debugger = Some(debugger);
                    Ok(())
                }
                Err(err) => {
                    warn!(%err, "cannot harvest stage, running it plainly");
                    stage.runtime.set_capture_environment_on_exit(false);
                    let command = batch_command(interpreter, program, &stage.argv[1..]);
                    spawn(stage, command.into())
                }
            }
        }
        LaunchStrategy::Batch => {
            let interpreter = &shell.config().harvest.interpreter;
            let command = batch_command(interpreter, program, &stage.argv[1..]);
            spawn(stage, command.into())
        }
        LaunchStrategy::Direct => {
            let mut command = Command::new(program);
            command.args(&stage.argv[1..]);

            match spawn(stage, command) {
                Err(err) if err.is_permission_denied() => {
                    debug!(%target, "direct creation refused, trying the opener");
                    open(stage, shell, &target)
                }
                result => result,
            }
        }
    }
}

/// Sources `script` and then replaces the interpreter with a fresh one that
/// only exits, so the exported environment becomes the process's own
/// environment block right before it exits.
pub fn batch_command(interpreter: &Path, script: &Path, args: &[String]) -> StdCommand {
    let wrapper = format!(
        r#". "$0"; status=$?; exec {} -c 'exit "$1"' sh "$status""#,
        quote_arg(&interpreter.to_string_lossy())
    );

    let mut command = StdCommand::new(interpreter);
    command.arg("-c").arg(wrapper).arg(script).args(args);
    command
}

fn spawn(stage: &mut Stage, mut command: Command) -> ExecResult<()> {
    if !stage.wait_for_completion {
        // out of the terminal's foreground group, so Ctrl+C stays ours
        stage.terminate_gracefully = true;
        new_process_group(&mut command);
    }

    let program = command.as_std().get_program().to_string_lossy().into_owned();
    let child = command
        .spawn()
        .map_err(|source| ExecError::Launch { program, source })?;

    stage
        .runtime
        .set_process_id(child.id().map(|id| id as i32));
    stage.child = Some(child.into());
    Ok(())
}

fn open(stage: &mut Stage, shell: &Shell, target: &str) -> ExecResult<()> {
    let mut command = Command::new(&shell.config().launch.opener);
    command.arg(target);
    new_process_group(&mut command);

    match command.spawn() {
        Ok(child) => {
            // the opener hands off to whatever owns the target; its own
            // process says nothing about the document
            debug!(%target, opener = ?child.id(), "handed to opener");
            stage.runtime.set_suppress_task_completion();
            Ok(())
        }
        Err(err) => Err(opener_error(target, err)),
    }
}

fn opener_error(target: &str, err: io::Error) -> ExecError {
    ExecError::Open {
        target: target.to_owned(),
        status: err.raw_os_error().unwrap_or(EXIT_FAILURE),
        detail: err.to_string(),
    }
}

pub(crate) fn new_process_group(command: &mut Command) {
    unsafe {
        command.pre_exec(|| {
            setpgid(Pid::from_raw(0), Pid::from_raw(0))?;
            Ok(())
        });
    }
}

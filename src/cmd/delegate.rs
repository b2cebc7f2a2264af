use tokio::process::Command;

use crate::{
    prelude::*,
    process::{launch::new_process_group, redirect::RedirectSnapshot},
};

/// Runs `text` in a new instance of the shell that the current one does not
/// wait for. The instance becomes a background job; returns its id.
pub fn delegate_to_subshell(shell: &Shell, text: &str) -> ExecResult<usize> {
    let program = shell.subshell_program()?;

    let mut command = Command::new(&program);
    command.arg(&shell.config().subshell.switch).arg(text);
    new_process_group(&mut command);

    let child = {
        // the subshell gets the shell's own streams, not a stage's
        let _streams = RedirectSnapshot::capture();
        command.spawn().map_err(|source| ExecError::Launch {
            program: program.display().to_string(),
            source,
        })?
    };

    let id = shell.jobs().register(text, Some(child.into()), None);
    debug!(id, %text, program = %program.display(), "delegated to subshell");
    Ok(id)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::config::Config;

    #[tokio::test]
    async fn delegated_text_becomes_a_job() {
        let mut config = Config::default();
        config.subshell.program = Some(PathBuf::from("/bin/sh"));
        config.subshell.switch = "-c".into();
        let shell = Shell::new(config);

        let id = delegate_to_subshell(&shell, "exit 6").unwrap();
        assert_eq!(shell.jobs().len(), 1);

        let mut reaped = Vec::new();
        for _ in 0..200 {
            reaped = shell.jobs().reap();
            if !reaped.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(reaped[0].id, id);
        assert_eq!(reaped[0].exit, Some(6));
    }

    #[test]
    fn missing_subshell_is_reported() {
        let mut config = Config::default();
        config.subshell.program = None;
        let shell = Shell::new(config);

        if std::env::var_os(crate::shell::SUBSHELL_ENV).is_none() {
            assert!(matches!(
                delegate_to_subshell(&shell, "true"),
                Err(ExecError::NoSubshell)
            ));
        }
    }
}

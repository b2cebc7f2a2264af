use std::io::{self, Write};

use async_trait::async_trait;
use enum_dispatch::enum_dispatch;
use strum::{EnumIter, IntoEnumIterator};

use crate::{process::status::BuiltinExitStatus, Shell};

pub mod alias;
pub mod cd;
pub mod exit;
pub mod jobs;
pub mod pwd;
pub mod set;

/// A command run inside the shell process. Its standard streams are the
/// shell's own fds 0/1/2, with the stage's redirection applied.
#[async_trait]
#[enum_dispatch(BuiltinCommands)]
pub trait BuiltinCommand {
    fn name(&self) -> &'static str;
    async fn execute(&self, shell: &Shell, args: &[String]) -> BuiltinExitStatus;
}

#[enum_dispatch]
#[derive(EnumIter)]
pub enum BuiltinCommands {
    Alias(alias::Alias),
    Cd(cd::Cd),
    Exit(exit::Exit),
    Jobs(jobs::Jobs),
    Pwd(pwd::Pwd),
    Set(set::Set),
}

impl BuiltinCommands {
    pub fn from_name(name: &str) -> Option<Self> {
        Self::iter().find(|cmd| cmd.name() == name)
    }
}

/// Writes to the live fd 1 and flushes, so the output lands before the
/// redirection is reverted.
pub(crate) fn write_stdout(text: &str) -> io::Result<()> {
    let mut stdout = io::stdout().lock();
    stdout.write_all(text.as_bytes())?;
    stdout.flush()
}

pub(crate) fn report(name: &str, err: impl std::fmt::Display) -> BuiltinExitStatus {
    let mut stderr = io::stderr().lock();
    let _ = writeln!(stderr, "{name}: {err}");
    let _ = stderr.flush();
    BuiltinExitStatus::new_failure()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_builtins_by_name() {
        for name in ["alias", "cd", "exit", "jobs", "pwd", "set"] {
            let builtin = BuiltinCommands::from_name(name).unwrap();
            assert_eq!(builtin.name(), name);
        }
        assert!(BuiltinCommands::from_name("ls").is_none());
    }
}

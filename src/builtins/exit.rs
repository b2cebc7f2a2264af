use async_trait::async_trait;

use super::{report, BuiltinCommand};
use crate::{process::status::BuiltinExitStatus, Shell};

#[derive(Default)]
pub struct Exit;

#[async_trait]
impl BuiltinCommand for Exit {
    fn name(&self) -> &'static str {
        "exit"
    }

    /// Asks the shell to stop after the current plan. Without an argument the
    /// shell exits with the current error level.
    async fn execute(&self, shell: &Shell, args: &[String]) -> BuiltinExitStatus {
        let code = match args.first() {
            Some(arg) => match arg.parse::<i32>() {
                Ok(code) => code,
                Err(_) => return report(self.name(), format!("{arg}: numeric argument required")),
            },
            None => shell.error_level(),
        };

        debug!(code, "exit requested");
        shell.request_exit(code);
        BuiltinExitStatus::from_code(code)
    }
}

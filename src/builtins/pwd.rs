use async_trait::async_trait;

use super::{report, write_stdout, BuiltinCommand};
use crate::{process::status::BuiltinExitStatus, Shell};

#[derive(Default)]
pub struct Pwd;

#[async_trait]
impl BuiltinCommand for Pwd {
    fn name(&self) -> &'static str {
        "pwd"
    }

    async fn execute(&self, _shell: &Shell, _args: &[String]) -> BuiltinExitStatus {
        let cwd = match std::env::current_dir() {
            Ok(cwd) => cwd,
            Err(err) => return report(self.name(), err),
        };

        match write_stdout(&format!("{}\n", cwd.display())) {
            Ok(()) => BuiltinExitStatus::new_success(),
            Err(err) => report(self.name(), err),
        }
    }
}

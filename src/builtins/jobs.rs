use async_trait::async_trait;

use super::{report, write_stdout, BuiltinCommand};
use crate::{process::status::BuiltinExitStatus, Shell};

#[derive(Default)]
pub struct Jobs;

#[async_trait]
impl BuiltinCommand for Jobs {
    fn name(&self) -> &'static str {
        "jobs"
    }

    async fn execute(&self, shell: &Shell, _args: &[String]) -> BuiltinExitStatus {
        let listing = shell
            .jobs()
            .list()
            .into_iter()
            .map(|job| {
                let state = match job.exit {
                    Some(code) => format!("done({code})"),
                    None => "running".to_string(),
                };
                let pid = job.pid.map(|pid| pid.to_string()).unwrap_or_default();
                format!("[{}] {pid:>7} {state:<10} {}\n", job.id, job.text)
            })
            .collect::<String>();

        match write_stdout(&listing) {
            Ok(()) => BuiltinExitStatus::new_success(),
            Err(err) => report(self.name(), err),
        }
    }
}

use std::path::PathBuf;

use async_trait::async_trait;

use super::{report, BuiltinCommand};
use crate::{process::status::BuiltinExitStatus, Shell};

#[derive(Default)]
pub struct Cd;

#[async_trait]
impl BuiltinCommand for Cd {
    fn name(&self) -> &'static str {
        "cd"
    }

    async fn execute(&self, _shell: &Shell, args: &[String]) -> BuiltinExitStatus {
        trace!("executing cd builtin: {args:?}");

        let target = match args.first().map(String::as_str) {
            None | Some("~") => std::env::var_os("HOME").map(PathBuf::from),
            Some("-") => std::env::var_os("OLDPWD").map(PathBuf::from),
            Some(path) => Some(PathBuf::from(path)),
        };

        let Some(target) = target else {
            return report(self.name(), "no directory given and HOME/OLDPWD unset");
        };

        let previous = std::env::current_dir().ok();

        let full_path = match std::env::current_dir()
            .map(|cwd| cwd.join(&target))
            .and_then(|path| path.canonicalize())
        {
            Ok(path) => path,
            Err(err) => return report(self.name(), format!("{}: {err}", target.display())),
        };

        trace!("cd: {:?}", full_path);

        match std::env::set_current_dir(&full_path) {
            Ok(_) => {
                if let Some(previous) = previous {
                    std::env::set_var("OLDPWD", previous);
                }
                std::env::set_var("PWD", &full_path);
                BuiltinExitStatus::new_success()
            }
            Err(err) => {
                error!("failed to cd: {}", err);
                report(self.name(), format!("{}: {err}", full_path.display()))
            }
        }
    }
}

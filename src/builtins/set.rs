use async_trait::async_trait;
use itertools::Itertools;

use super::{report, write_stdout, BuiltinCommand};
use crate::{env::EnvBlock, process::status::BuiltinExitStatus, Shell};

/// `set` lists the environment, `set NAME=value` defines a variable and
/// `set NAME=` removes it.
#[derive(Default)]
pub struct Set;

#[async_trait]
impl BuiltinCommand for Set {
    fn name(&self) -> &'static str {
        "set"
    }

    async fn execute(&self, _shell: &Shell, args: &[String]) -> BuiltinExitStatus {
        if args.is_empty() {
            let listing = std::env::vars_os()
                .map(|(k, v)| format!("{}={}\n", k.to_string_lossy(), v.to_string_lossy()))
                .sorted()
                .collect::<String>();

            return match write_stdout(&listing) {
                Ok(()) => BuiltinExitStatus::new_success(),
                Err(err) => report(self.name(), err),
            };
        }

        for arg in args {
            match arg.split_once('=') {
                Some((name, _)) if name.is_empty() || name.contains('\0') => {
                    return report(self.name(), format!("{arg}: invalid variable name"));
                }
                Some((name, "")) => std::env::remove_var(name),
                Some((name, value)) => std::env::set_var(name, value),
                None => {
                    let value = EnvBlock::capture().get(arg).map(str::to_owned);
                    match value {
                        Some(value) => {
                            if let Err(err) = write_stdout(&format!("{arg}={value}\n")) {
                                return report(self.name(), err);
                            }
                        }
                        None => return BuiltinExitStatus::new_failure(),
                    }
                }
            }
        }

        BuiltinExitStatus::new_success()
    }
}

use async_trait::async_trait;

use super::{report, write_stdout, BuiltinCommand};
use crate::{process::status::BuiltinExitStatus, Shell};

/// `alias` lists aliases, `alias name=value` defines one, `alias name=`
/// deletes it and `alias name` shows it.
#[derive(Default)]
pub struct Alias;

#[async_trait]
impl BuiltinCommand for Alias {
    fn name(&self) -> &'static str {
        "alias"
    }

    async fn execute(&self, shell: &Shell, args: &[String]) -> BuiltinExitStatus {
        let aliases = shell.aliases();

        if args.is_empty() {
            let listing = aliases
                .snapshot()
                .iter()
                .map(|(name, value)| format!("{name}={value}\n"))
                .collect::<String>();

            return match write_stdout(&listing) {
                Ok(()) => BuiltinExitStatus::new_success(),
                Err(err) => report(self.name(), err),
            };
        }

        let mut status = BuiltinExitStatus::new_success();

        for arg in args {
            match arg.split_once('=') {
                Some(("", _)) => return report(self.name(), format!("{arg}: missing name")),
                Some((name, "")) => {
                    aliases.remove(name);
                }
                Some((name, value)) => aliases.set(name, value),
                None => match aliases.get(arg) {
                    Some(value) => {
                        if let Err(err) = write_stdout(&format!("{arg}={value}\n")) {
                            return report(self.name(), err);
                        }
                    }
                    None => status = BuiltinExitStatus::new_failure(),
                },
            }
        }

        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn defines_and_removes() {
        let shell = Shell::default();
        let alias = Alias;

        let status = alias
            .execute(&shell, &["ll=ls -l".to_string(), "la=ls -a".to_string()])
            .await;
        assert!(status.success());
        assert_eq!(shell.aliases().get("ll").as_deref(), Some("ls -l"));

        alias.execute(&shell, &["ll=".to_string()]).await;
        assert_eq!(shell.aliases().get("ll"), None);
        assert!(alias.execute(&shell, &["ll".to_string()]).await.failure());
        assert!(alias.execute(&shell, &["=x".to_string()]).await.failure());
    }
}

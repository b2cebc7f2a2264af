//! Boundary to the shell's alias table and the process environment.
//!
//! Both are shared, process-wide state. The harvester replaces them from its
//! own worker thread; a backgrounded stage racing with that merge leaves one of
//! the two orders in place, never a mix.

use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock},
};

use crate::error::HarvestError;

pub type AliasMap = BTreeMap<String, String>;

/// A complete environment block: every variable of a process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvBlock {
    vars: BTreeMap<String, String>,
}

impl EnvBlock {
    pub fn capture() -> Self {
        let vars = std::env::vars_os()
            .map(|(k, v)| {
                (
                    k.to_string_lossy().into_owned(),
                    v.to_string_lossy().into_owned(),
                )
            })
            .collect();

        Self { vars }
    }

    /// Parses NUL separated `NAME=value` strings terminated by an empty
    /// string (a double NUL). Anything after the terminator is ignored.
    pub fn parse(block: &str) -> Result<Self, HarvestError> {
        if block.chars().count() <= 2 {
            return Err(HarvestError::EmptyEnvironment);
        }

        let end = block.find("\0\0").ok_or(HarvestError::InvalidEnvironment)?;

        let vars = block[..end]
            .split('\0')
            .filter_map(|entry| match entry.split_once('=') {
                // a leading '=' belongs to the name
                Some(("", _)) => entry[1..]
                    .split_once('=')
                    .map(|(k, v)| (format!("={k}"), v.to_owned())),
                Some((k, v)) => Some((k.to_owned(), v.to_owned())),
                None => None,
            })
            .collect::<BTreeMap<_, _>>();

        if vars.is_empty() {
            return Err(HarvestError::EmptyEnvironment);
        }

        Ok(Self { vars })
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Makes this block the environment of the current process.
    pub fn apply(&self) {
        for (name, _) in std::env::vars_os() {
            let keep = name
                .to_str()
                .map_or(false, |name| self.vars.contains_key(name));
            if !keep {
                std::env::remove_var(&name);
            }
        }

        for (name, value) in &self.vars {
            if name.is_empty() || name.contains('\0') || value.contains('\0') {
                continue;
            }
            if std::env::var(name).ok().as_deref() != Some(value) {
                std::env::set_var(name, value);
            }
        }
    }
}

/// Where the alias definitions visible to nested interpreters live.
pub trait AliasSource: Send + Sync {
    fn system_aliases(&self) -> Option<AliasMap>;
}

/// The platform keeps no alias store shared with child interpreters.
#[derive(Debug, Default)]
pub struct NoSystemAliases;

impl AliasSource for NoSystemAliases {
    fn system_aliases(&self) -> Option<AliasMap> {
        None
    }
}

#[derive(Debug, Clone, Default)]
pub struct AliasTable {
    inner: Arc<RwLock<AliasMap>>,
}

impl AliasTable {
    pub fn get(&self, name: &str) -> Option<String> {
        self.read().get(name).cloned()
    }

    pub fn set(&self, name: impl Into<String>, value: impl Into<String>) {
        self.write().insert(name.into(), value.into());
    }

    pub fn remove(&self, name: &str) -> Option<String> {
        self.write().remove(name)
    }

    pub fn snapshot(&self) -> AliasMap {
        self.read().clone()
    }

    pub fn replace(&self, aliases: AliasMap) {
        *self.write() = aliases;
    }

    /// Applies what changed between two snapshots of another table: new or
    /// redefined aliases are set, deleted ones are removed. Aliases the other
    /// table never touched are left alone.
    pub fn merge_changed(&self, before: &AliasMap, after: &AliasMap) {
        let mut table = self.write();

        for (name, value) in after {
            if before.get(name) != Some(value) {
                trace!(%name, %value, "merging changed alias");
                table.insert(name.clone(), value.clone());
            }
        }

        for name in before.keys().filter(|name| !after.contains_key(*name)) {
            trace!(%name, "merging removed alias");
            table.remove(name);
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, AliasMap> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, AliasMap> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl AliasSource for AliasTable {
    fn system_aliases(&self) -> Option<AliasMap> {
        Some(self.snapshot())
    }
}

//! Named machines built from configuration.

use crate::config::{MachineDef, MachinesConfig};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::ssh::SshOptions;
use super::{LocalMachine, Machine, MachineKind, SshMachine};

/// A live machine plus the settings it was built from.
#[derive(Clone)]
pub struct MachineEntry {
    pub machine: Arc<dyn Machine>,
    pub def: MachineDef,
}

/// Lookup table of configured machines.
#[derive(Clone, Default)]
pub struct MachineRegistry {
    entries: BTreeMap<String, MachineEntry>,
    default_name: String,
}

impl MachineRegistry {
    pub fn from_config(config: &MachinesConfig) -> Self {
        let mut registry = Self {
            entries: BTreeMap::new(),
            default_name: config.default.clone(),
        };
        for (name, def) in &config.defs {
            let machine: Arc<dyn Machine> = match def.kind {
                MachineKind::Local => Arc::new(LocalMachine::new(name.clone())),
                MachineKind::Ssh => Arc::new(SshMachine::new(
                    name.clone(),
                    SshOptions {
                        host: def.host.clone().unwrap_or_default(),
                        user: def.user.clone().unwrap_or_default(),
                        port: def.port,
                        key_path: def.key_path.clone(),
                        known_hosts: def.known_hosts.clone(),
                        use_agent: def.use_agent,
                        connect_timeout_secs: def.connect_timeout_secs,
                    },
                )),
            };
            registry.insert(machine, def.clone());
        }
        registry
    }

    /// Register (or replace) a machine under its own name.
    pub fn insert(&mut self, machine: Arc<dyn Machine>, def: MachineDef) {
        let name = machine.name().to_string();
        if self.default_name.is_empty() {
            self.default_name = name.clone();
        }
        self.entries.insert(name, MachineEntry { machine, def });
    }

    pub fn get(&self, name: &str) -> Option<&MachineEntry> {
        self.entries.get(name)
    }

    pub fn default_name(&self) -> &str {
        &self.default_name
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Failover target for `name`: the local machine called `local`, else
    /// the first local machine. Never `name` itself.
    pub fn fallback_for(&self, name: &str) -> Option<&MachineEntry> {
        let is_candidate = |(key, entry): &(&String, &MachineEntry)| {
            key.as_str() != name && entry.def.kind == MachineKind::Local
        };
        if let Some(entry) = self
            .entries
            .get("local")
            .filter(|entry| name != "local" && entry.def.kind == MachineKind::Local)
        {
            return Some(entry);
        }
        self.entries
            .iter()
            .find(is_candidate)
            .map(|(_, entry)| entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MachineDef;

    fn ssh_def() -> MachineDef {
        MachineDef {
            kind: MachineKind::Ssh,
            host: Some("h".into()),
            user: Some("u".into()),
            ..MachineDef::default()
        }
    }

    #[test]
    fn fallback_prefers_machine_named_local() {
        let mut config = MachinesConfig::default();
        config.defs.insert("aaa".into(), MachineDef::default());
        config.defs.insert("remote".into(), ssh_def());
        let registry = MachineRegistry::from_config(&config);
        let fallback = registry.fallback_for("remote").unwrap();
        assert_eq!(fallback.machine.name(), "local");
    }

    #[test]
    fn fallback_uses_first_local_when_no_local_name() {
        let mut config = MachinesConfig::default();
        config.defs.clear();
        config.defs.insert("remote".into(), ssh_def());
        config.defs.insert("workstation".into(), MachineDef::default());
        config.default = "remote".into();
        let registry = MachineRegistry::from_config(&config);
        assert_eq!(
            registry.fallback_for("remote").unwrap().machine.name(),
            "workstation"
        );
        assert!(registry.fallback_for("workstation").is_none());
    }

    #[test]
    fn fallback_never_returns_self() {
        let registry = MachineRegistry::from_config(&MachinesConfig::default());
        assert!(registry.fallback_for("local").is_none());
        assert_eq!(registry.default_name(), "local");
    }
}

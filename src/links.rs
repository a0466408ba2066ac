//! Environment exported to a container for each container it links to.
//!
//! For a link to `db` under alias `database` exposing `5432/tcp`:
//!
//! ```text
//! DATABASE_PORT=tcp://172.17.0.5:5432
//! DATABASE_PORT_5432_TCP=tcp://172.17.0.5:5432
//! DATABASE_PORT_5432_TCP_ADDR=172.17.0.5
//! DATABASE_PORT_5432_TCP_PORT=5432
//! DATABASE_PORT_5432_TCP_PROTO=tcp
//! DATABASE_NAME=/web/database
//! DATABASE_ENV_POSTGRES_USER=app
//! ```

use crate::runconfig::Port;

/// A resolved link from a parent to a running child container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    /// Full link path, e.g. `/web/database`.
    pub name: String,
    pub alias: String,
    pub child_ip: String,
    /// Child's `KEY=value` environment.
    pub child_env: Vec<String>,
    /// Ports the child exposes.
    pub ports: Vec<Port>,
}

impl Link {
    fn env_prefix(&self) -> String {
        self.alias.to_uppercase().replace('-', "_")
    }

    /// Lowest exposed port, tcp first on a tie.
    fn default_port(&self) -> Option<&Port> {
        self.ports.iter().min_by_key(|p| {
            (
                p.number().unwrap_or(u16::MAX),
                p.proto() != "tcp",
            )
        })
    }

    /// Environment entries describing the child.
    pub fn env(&self) -> Vec<String> {
        let alias = self.env_prefix();
        let mut env = Vec::new();

        if let Some(port) = self.default_port() {
            env.push(format!(
                "{}_PORT={}://{}:{}",
                alias,
                port.proto(),
                self.child_ip,
                port.port()
            ));
        }

        for port in &self.ports {
            let prefix = format!("{}_PORT_{}_{}", alias, port.port(), port.proto().to_uppercase());
            env.push(format!(
                "{}={}://{}:{}",
                prefix,
                port.proto(),
                self.child_ip,
                port.port()
            ));
            env.push(format!("{}_ADDR={}", prefix, self.child_ip));
            env.push(format!("{}_PORT={}", prefix, port.port()));
            env.push(format!("{}_PROTO={}", prefix, port.proto()));
        }

        env.push(format!("{}_NAME={}", alias, self.name));

        for entry in &self.child_env {
            let Some((key, value)) = entry.split_once('=') else {
                continue;
            };
            // Build-time variables, meaningless to the parent.
            if key == "HOME" || key == "PATH" {
                continue;
            }
            env.push(format!("{}_ENV_{}={}", alias, key, value));
        }
        env
    }
}

fn env_key(entry: &str) -> &str {
    entry.split_once('=').map(|(k, _)| k).unwrap_or(entry)
}

/// Replaces entries of `env` with the same key from `overrides`, appending
/// the rest.
pub fn replace_or_append(env: &mut Vec<String>, overrides: &[String]) {
    for entry in overrides {
        let key = env_key(entry);
        match env.iter_mut().find(|e| env_key(e) == key) {
            Some(existing) => *existing = entry.clone(),
            None => env.push(entry.clone()),
        }
    }
}

//! Self-reference guard.
//!
//! A downstream configuration that points back at this process would make
//! the proxy spawn itself recursively. Before sessions are created, stdio
//! configs matching any of three patterns are dropped and surfaced as
//! warnings:
//!
//! 1. the command is (or ends with) this process's binary name;
//! 2. the command is a package runner invoking this package's identifier;
//! 3. the command is a generic interpreter pointed at this process's entry
//!    file.
//!
//! Non-stdio transports are not guarded.

use crate::config::{ServerConfig, TransportConfig};
use std::path::{Path, PathBuf};

const PACKAGE_RUNNERS: &[&str] = &["npx", "pnpx", "bunx", "uvx", "pipx", "pnpm", "yarn"];
const INTERPRETERS: &[&str] = &["node", "nodejs", "deno", "bun", "python", "python3"];

/// What this process looks like from the outside.
#[derive(Debug, Clone)]
pub struct SelfIdentity {
    /// File name of the running binary.
    pub binary_name: String,
    /// Package identifier a package runner would use.
    pub package_name: String,
    /// Resolved path of the running binary.
    pub entry_path: Option<PathBuf>,
}

impl SelfIdentity {
    /// Identity of the current process.
    #[must_use]
    pub fn current() -> Self {
        let entry_path = std::env::current_exe()
            .ok()
            .map(|p| p.canonicalize().unwrap_or(p));
        let binary_name = entry_path
            .as_deref()
            .and_then(Path::file_name)
            .map_or_else(
                || env!("CARGO_PKG_NAME").to_string(),
                |n| n.to_string_lossy().into_owned(),
            );
        Self {
            binary_name,
            package_name: env!("CARGO_PKG_NAME").to_string(),
            entry_path,
        }
    }
}

/// Returns the reason a config must be dropped, or `None` when it is safe.
#[must_use]
pub fn self_reference(config: &ServerConfig, identity: &SelfIdentity) -> Option<String> {
    let TransportConfig::Stdio { command, args, .. } = &config.transport else {
        return None;
    };

    let command_base = base_name(command);

    if command_base == identity.binary_name {
        return Some(format!(
            "command '{command}' is this proxy's own binary"
        ));
    }

    if PACKAGE_RUNNERS.contains(&command_base.as_str())
        && args.iter().any(|a| arg_names_package(a, &identity.package_name))
    {
        return Some(format!(
            "'{command}' would launch this proxy's package '{}'",
            identity.package_name
        ));
    }

    if INTERPRETERS.contains(&command_base.as_str())
        && let Some(entry) = identity.entry_path.as_deref()
        && args.iter().any(|a| resolves_to(a, entry))
    {
        return Some(format!(
            "'{command}' would execute this proxy's entry file"
        ));
    }

    None
}

fn base_name(command: &str) -> String {
    Path::new(command)
        .file_name()
        .map_or_else(|| command.to_string(), |n| n.to_string_lossy().into_owned())
}

/// An arg names our package when it equals the identifier or is a scoped
/// form ending in `/<identifier>`.
fn arg_names_package(arg: &str, package: &str) -> bool {
    arg == package || arg.rsplit('/').next() == Some(package)
}

fn resolves_to(arg: &str, entry: &Path) -> bool {
    let candidate = Path::new(arg);
    let resolved = candidate
        .canonicalize()
        .unwrap_or_else(|_| candidate.to_path_buf());
    resolved == entry
}

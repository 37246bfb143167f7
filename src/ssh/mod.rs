//! SSH access to pool machines
//!
//! The transport is pluggable: provisioning only needs to run a command and
//! to chain through a jump host.

mod openssh;
#[cfg(test)]
pub(crate) mod testing;

pub use openssh::OpenSshConnector;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::Result;

/// A connected SSH session able to run commands
#[cfg_attr(test, mockall::automock)]
pub trait SshClient: Send + Sync {
    /// Run a command and return its stdout
    fn output(&self, cmd: &str) -> Result<String>;

    /// Client for `host:port` reached through this one
    fn add_hop(&self, host: &str, port: u16) -> Result<Box<dyn SshClient>>;
}

/// Opens SSH sessions to an address
#[cfg_attr(test, mockall::automock)]
pub trait SshConnector: Send + Sync {
    fn connect(&self, addr: &str) -> Result<Box<dyn SshClient>>;
}

/// Quote a value for a POSIX shell
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Write `contents` to `path` on the remote side with sudo.
///
/// The payload travels base64 encoded so key material never has to survive
/// shell quoting.
pub fn write_file(client: &dyn SshClient, path: &str, contents: &str) -> Result<()> {
    let encoded = STANDARD.encode(contents.as_bytes());
    let cmd = format!(
        "echo {} | base64 -d | sudo tee {} > /dev/null",
        encoded,
        shell_quote(path)
    );
    client.output(&cmd)?;
    Ok(())
}

/// Create a directory on the remote side with sudo, replacing any existing one
pub fn create_dir(client: &dyn SshClient, path: &str) -> Result<()> {
    let path = shell_quote(path);
    client.output(&format!("sudo rm -rf {} && sudo mkdir -p {}", path, path))?;
    Ok(())
}

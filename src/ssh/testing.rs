//! Recording SSH fakes for unit tests

use std::sync::Arc;

use parking_lot::Mutex;

use super::{MockSshClient, MockSshConnector, SshClient, SshConnector};
use crate::{Error, Result};

/// `(host, command)` pairs in execution order
pub(crate) type Log = Arc<Mutex<Vec<(String, String)>>>;

/// Records every command with the host it ran on. Commands containing
/// `fail_on` fail.
pub(crate) struct RecordingClient {
    pub host: String,
    pub log: Log,
    pub fail_on: Option<&'static str>,
}

impl SshClient for RecordingClient {
    fn output(&self, cmd: &str) -> Result<String> {
        self.log.lock().push((self.host.clone(), cmd.to_string()));
        match self.fail_on {
            Some(pattern) if cmd.contains(pattern) => Err(Error::Ssh(format!("{} failed", pattern))),
            _ => Ok(String::new()),
        }
    }

    fn add_hop(&self, host: &str, _port: u16) -> Result<Box<dyn SshClient>> {
        Ok(Box::new(RecordingClient {
            host: host.to_string(),
            log: self.log.clone(),
            fail_on: self.fail_on,
        }))
    }
}

/// Connector handing out recording clients for any address
pub(crate) fn connector(log: &Log, fail_on: Option<&'static str>) -> Arc<dyn SshConnector> {
    let log = log.clone();
    let mut connector = MockSshConnector::new();
    connector.expect_connect().returning(move |addr| {
        Ok(Box::new(RecordingClient {
            host: addr.to_string(),
            log: log.clone(),
            fail_on,
        }))
    });
    Arc::new(connector)
}

/// Connector whose jump hosts answer but can't reach any hop behind them
pub(crate) fn unreachable_hops(log: &Log) -> Arc<dyn SshConnector> {
    let log = log.clone();
    let mut connector = MockSshConnector::new();
    connector.expect_connect().returning(move |addr| {
        let host = addr.to_string();
        let log = log.clone();
        let mut client = MockSshClient::new();
        client.expect_output().returning(move |cmd| {
            log.lock().push((host.clone(), cmd.to_string()));
            Ok(String::new())
        });
        client
            .expect_add_hop()
            .returning(|host, _| Err(Error::Ssh(format!("connection to {} timed out", host))));
        Ok(Box::new(client))
    });
    Arc::new(connector)
}

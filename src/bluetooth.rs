//! Bluetooth link teardown through BlueZ
//!
//! BlueZ exposes adapters as `org.bluez.Adapter1` objects (`/org/bluez/hci0`)
//! and known remote devices below them as `org.bluez.Device1` objects
//! (`/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF`). A controller may be paired
//! through any adapter, so a disconnect request is sent to every adapter; an
//! adapter without a link to that address answers with an error we treat as
//! a no-op.

use crate::device::Identity;
use std::collections::HashSet;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

const BLUEZ_SERVICE: &str = "org.bluez";
const ADAPTER_INTERFACE: &str = "org.bluez.Adapter1";
const DEVICE_INTERFACE: &str = "org.bluez.Device1";

/// Error names meaning "nothing to disconnect on this adapter"
const NO_LINK_ERRORS: &[&str] = &[
    "org.freedesktop.DBus.Error.UnknownObject",
    "org.freedesktop.DBus.Error.UnknownMethod",
    "org.bluez.Error.NotConnected",
    "org.bluez.Error.DoesNotExist",
];

#[derive(Debug, thiserror::Error)]
pub enum BluetoothError {
    #[error("D-Bus error: {0}")]
    DBus(#[from] zbus::Error),

    #[error("BlueZ object manager error: {0}")]
    ObjectManager(#[from] zbus::fdo::Error),

    #[error("disconnect worker failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Result of a disconnect request on one adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOutcome {
    Disconnected,
    /// The adapter had no link to this controller
    NoLink,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterReport {
    pub adapter: String,
    pub outcome: LinkOutcome,
}

/// Wireless control operations needed by the disconnect action
pub trait LinkControl {
    /// Object paths of every local adapter
    fn adapters(&self) -> Result<Vec<String>, BluetoothError>;

    fn disconnect_device(&self, adapter: &str, identity: &Identity) -> Result<LinkOutcome, BluetoothError>;
}

/// BlueZ client on the system bus
pub struct BluezClient {
    conn: zbus::blocking::Connection,
}

impl BluezClient {
    pub fn connect() -> Result<Self, BluetoothError> {
        let conn = zbus::blocking::Connection::system()?;
        Ok(Self { conn })
    }
}

impl LinkControl for BluezClient {
    fn adapters(&self) -> Result<Vec<String>, BluetoothError> {
        let manager = zbus::blocking::fdo::ObjectManagerProxy::builder(&self.conn)
            .destination(BLUEZ_SERVICE)?
            .path("/")?
            .build()?;

        let mut adapters: Vec<String> = manager
            .get_managed_objects()?
            .into_iter()
            .filter(|(_, interfaces)| interfaces.keys().any(|i| i.as_str() == ADAPTER_INTERFACE))
            .map(|(path, _)| path.as_str().to_string())
            .collect();

        adapters.sort();
        Ok(adapters)
    }

    fn disconnect_device(&self, adapter: &str, identity: &Identity) -> Result<LinkOutcome, BluetoothError> {
        let path = device_path(adapter, identity);

        match self.conn.call_method(
            Some(BLUEZ_SERVICE),
            path.as_str(),
            Some(DEVICE_INTERFACE),
            "Disconnect",
            &(),
        ) {
            Ok(_) => Ok(LinkOutcome::Disconnected),
            Err(zbus::Error::MethodError(name, _, _)) if NO_LINK_ERRORS.contains(&name.as_str()) => {
                debug!("{}: no link on {} ({})", identity, adapter, name.as_str());
                Ok(LinkOutcome::NoLink)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// BlueZ object path of a remote device below an adapter
pub fn device_path(adapter: &str, identity: &Identity) -> String {
    format!("{}/dev_{}", adapter.trim_end_matches('/'), identity.underscored())
}

/// Ask every adapter to drop its link to `identity`
///
/// Per-adapter failures are recorded in the report and never stop the fan-out.
pub fn disconnect<C: LinkControl + ?Sized>(
    control: &C,
    identity: &Identity,
) -> Result<Vec<AdapterReport>, BluetoothError> {
    let adapters = control.adapters()?;
    if adapters.is_empty() {
        warn!("{}: no Bluetooth adapters available", identity);
    }

    let mut reports = Vec::with_capacity(adapters.len());
    for adapter in adapters {
        let outcome = match control.disconnect_device(&adapter, identity) {
            Ok(outcome) => outcome,
            Err(e) => LinkOutcome::Failed(e.to_string()),
        };
        reports.push(AdapterReport { adapter, outcome });
    }

    Ok(reports)
}

fn log_reports(identity: &Identity, reports: &[AdapterReport]) {
    for report in reports {
        match &report.outcome {
            LinkOutcome::Disconnected => info!("{}: disconnected from {}", identity, report.adapter),
            LinkOutcome::NoLink => debug!("{}: no link on {}", identity, report.adapter),
            LinkOutcome::Failed(reason) => {
                warn!("{}: disconnect on {} failed: {}", identity, report.adapter, reason)
            }
        }
    }
}

/// Serve disconnect requests from workers until every sender is gone
///
/// Requests that pile up while a disconnect is running are coalesced, so one
/// controller is never torn down twice in a row.
pub async fn run_disconnect_task<F, C>(mut requests: UnboundedReceiver<Identity>, connect: F)
where
    F: Fn() -> Result<C, BluetoothError> + Clone + Send + 'static,
    C: LinkControl,
{
    while let Some(first) = requests.recv().await {
        let mut batch = vec![first];
        let mut seen: HashSet<Identity> = batch.iter().cloned().collect();
        while let Ok(next) = requests.try_recv() {
            if seen.insert(next.clone()) {
                batch.push(next);
            } else {
                debug!("{}: disconnect already queued", next);
            }
        }

        for identity in batch {
            let connect = connect.clone();
            let target = identity.clone();
            let result = tokio::task::spawn_blocking(move || {
                let control = connect()?;
                disconnect(&control, &target)
            })
            .await
            .map_err(BluetoothError::from)
            .and_then(|r| r);

            match result {
                Ok(reports) => {
                    log_reports(&identity, &reports);
                    if !reports.iter().any(|r| r.outcome == LinkOutcome::Disconnected) {
                        warn!("{}: no adapter reported an active link", identity);
                    }
                }
                Err(e) => warn!("{}: disconnect failed: {}", identity, e),
            }
        }
    }

    debug!("Disconnect task finished");
}

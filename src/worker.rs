//! Per-controller monitoring workers
//!
//! Each worker is a named OS thread doing blocking `fetch_events` calls on one
//! evdev node. There is no stop signal: a worker ends when its node goes away
//! (ENODEV or any other read error) or when the daemon process exits. The
//! supervisor notices a finished worker through [`WorkerHandle::is_alive`]
//! and reaps it.

use crate::decoder::{self, ComboCodes, ComboDetector, EventSource};
use crate::device::{Device, Identity};
use std::io;
use std::path::PathBuf;
use std::thread;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

/// Liveness view of a running worker
pub trait WorkerHandle {
    fn is_alive(&self) -> bool;

    /// Short description written to the worker's marker file
    fn describe(&self) -> String;
}

/// Starts workers for newly seen controllers
pub trait Spawn {
    type Handle: WorkerHandle;

    fn spawn(&self, device: &Device, identity: &Identity) -> io::Result<Self::Handle>;
}

/// Handle to a worker thread
pub struct Worker {
    node: PathBuf,
    join: thread::JoinHandle<()>,
}

impl WorkerHandle for Worker {
    fn is_alive(&self) -> bool {
        !self.join.is_finished()
    }

    fn describe(&self) -> String {
        format!(
            "pid={} thread={} node={}",
            std::process::id(),
            self.join.thread().name().unwrap_or("?"),
            self.node.display()
        )
    }
}

/// Spawns decoder threads that report combos on a channel
#[derive(Clone)]
pub struct ThreadSpawner {
    codes: ComboCodes,
    combo_tx: UnboundedSender<Identity>,
}

impl ThreadSpawner {
    pub fn new(codes: ComboCodes, combo_tx: UnboundedSender<Identity>) -> Self {
        Self { codes, combo_tx }
    }
}

impl Spawn for ThreadSpawner {
    type Handle = Worker;

    fn spawn(&self, device: &Device, identity: &Identity) -> io::Result<Worker> {
        let node = device.node.clone();
        let thread_node = node.clone();
        let thread_identity = identity.clone();
        let codes = self.codes;
        let combo_tx = self.combo_tx.clone();

        let join = thread::Builder::new()
            .name(format!("combo-{}", identity.underscored()))
            .spawn(move || run_worker(thread_node, thread_identity, codes, combo_tx))?;

        info!("Monitoring {} on {:?}", identity, node);

        Ok(Worker { node, join })
    }
}

fn run_worker(
    node: PathBuf,
    identity: Identity,
    codes: ComboCodes,
    combo_tx: UnboundedSender<Identity>,
) {
    let mut device = match evdev::Device::open(&node) {
        Ok(device) => device,
        Err(e) => {
            warn!("{}: failed to open {:?}: {}", identity, node, e);
            return;
        }
    };

    let end = watch_events(&mut device, &identity, codes, &combo_tx);
    debug!("{}: stopped reading {:?}: {}", identity, node, end);
}

/// Forward every combo on `source` to the disconnect task; returns why the stream ended
fn watch_events<E: EventSource + ?Sized>(
    source: &mut E,
    identity: &Identity,
    codes: ComboCodes,
    combo_tx: &UnboundedSender<Identity>,
) -> io::Error {
    let mut detector = ComboDetector::new(codes);
    decoder::run_stream(source, &mut detector, || {
        info!("{}: Home + Triangle pressed, requesting disconnect", identity);
        if combo_tx.send(identity.clone()).is_err() {
            warn!("{}: disconnect task is gone, combo dropped", identity);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::tests::{ScriptedSource, key};
    use std::time::{Duration, Instant};
    use tokio::sync::mpsc;

    fn wait_until_finished(worker: &Worker) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while worker.is_alive() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_worker_on_missing_node_exits() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let spawner = ThreadSpawner::new(ComboCodes::default(), tx);
        let device = Device {
            node: PathBuf::from("/nonexistent/padkill/event99"),
            syspath: PathBuf::from("/sys/class/input/event99"),
            name: "Wireless Controller".to_string(),
        };
        let identity = Identity::parse("00:11:22:33:44:55").unwrap();

        let worker = spawner.spawn(&device, &identity).unwrap();
        wait_until_finished(&worker);
        assert!(!worker.is_alive());
        assert!(worker.describe().contains("thread=combo-00_11_22_33_44_55"));
    }

    #[test]
    fn test_worker_rejects_non_evdev_node() {
        let dir = std::env::temp_dir().join(format!("padkill-worker-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let node = dir.join("event0");
        std::fs::write(&node, [0u8; 48]).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let spawner = ThreadSpawner::new(ComboCodes::default(), tx);
        let device = Device {
            node: node.clone(),
            syspath: PathBuf::from("/sys/class/input/event0"),
            name: "Wireless Controller".to_string(),
        };
        let identity = Identity::parse("00:11:22:33:44:55").unwrap();

        let worker = spawner.spawn(&device, &identity).unwrap();
        wait_until_finished(&worker);
        assert!(!worker.is_alive());
        drop(spawner);
        assert!(rx.try_recv().is_err());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_combo_is_sent_with_identity() {
        let codes = ComboCodes::default();
        let identity = Identity::parse("00:11:22:33:44:55").unwrap();
        let mut source = ScriptedSource::new(vec![
            vec![key(codes.home, 1), key(codes.triangle, 1)],
            vec![key(codes.home, 2), key(codes.triangle, 2)],
        ]);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let end = watch_events(&mut source, &identity, codes, &tx);

        assert_eq!(end.raw_os_error(), Some(libc::ENODEV));
        assert_eq!(rx.try_recv().unwrap(), identity);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_combo_without_receiver_is_dropped() {
        let codes = ComboCodes::default();
        let identity = Identity::parse("00:11:22:33:44:55").unwrap();
        let mut source = ScriptedSource::new(vec![vec![key(codes.home, 1), key(codes.triangle, 1)]]);
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);

        let end = watch_events(&mut source, &identity, codes, &tx);
        assert_eq!(end.raw_os_error(), Some(libc::ENODEV));
    }
}

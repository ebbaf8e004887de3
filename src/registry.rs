//! Worker registry
//!
//! Maps each controller identity to the worker monitoring it. The map is
//! owned by the supervisor and is the single source of truth; it is mirrored
//! to a scratch directory so an operator (or a restarted daemon) can see
//! which controllers were being monitored:
//!
//! - `<state_dir>/monitored`: one identity per line
//! - `<state_dir>/<AA_BB_CC_DD_EE_FF>.worker`: description of the worker
//!
//! Failures to write the mirror are logged and otherwise ignored.

use crate::device::Identity;
use crate::worker::WorkerHandle;
use anyhow::{Context, Result, bail};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::os::unix::fs::{DirBuilderExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const MONITORED_FILE: &str = "monitored";
const MARKER_EXTENSION: &str = "worker";
const STATE_DIR_MODE: u32 = 0o700;

/// One registered worker
#[derive(Debug)]
pub struct MonitorEntry<H> {
    pub identity: Identity,
    pub handle: H,
    /// Last observed running state
    pub alive: bool,
}

pub struct WorkerRegistry<H> {
    state_dir: PathBuf,
    entries: BTreeMap<Identity, MonitorEntry<H>>,
}

impl<H: WorkerHandle> WorkerRegistry<H> {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            entries: BTreeMap::new(),
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Prepare the state directory, wiping whatever a previous run left behind
    ///
    /// The directory must be a real directory owned by the effective user;
    /// it is created (or tightened) to mode 0700.
    pub fn reset(&mut self) -> Result<()> {
        self.prepare_state_dir()?;

        fs::write(self.monitored_path(), "")
            .with_context(|| format!("Failed to truncate {:?}", self.monitored_path()))?;

        let mut stale = 0;
        for entry in fs::read_dir(&self.state_dir)? {
            let path = entry?.path();
            if path.extension().map_or(false, |ext| ext == MARKER_EXTENSION) {
                fs::remove_file(&path).with_context(|| format!("Failed to remove {:?}", path))?;
                stale += 1;
            }
        }

        if stale > 0 {
            info!("Removed {} stale worker marker(s) from {:?}", stale, self.state_dir);
        }
        Ok(())
    }

    pub fn is_monitored(&self, identity: &Identity) -> bool {
        self.entries.contains_key(identity)
    }

    /// Record a new worker; returns false and drops nothing if the identity is taken
    pub fn register(&mut self, identity: Identity, handle: H) -> bool {
        if self.entries.contains_key(&identity) {
            debug!("{} is already monitored", identity);
            return false;
        }

        self.write_marker(&identity, &handle.describe());
        let alive = handle.is_alive();
        self.entries.insert(
            identity.clone(),
            MonitorEntry {
                identity,
                handle,
                alive,
            },
        );
        self.write_monitored();
        true
    }

    /// Remove an entry and its marker; no-op if absent
    pub fn unregister(&mut self, identity: &Identity) -> Option<H> {
        let entry = self.entries.remove(identity);
        self.remove_marker(identity);
        if entry.is_some() {
            self.write_monitored();
        }
        entry.map(|e| e.handle)
    }

    pub fn list(&self) -> Vec<Identity> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Refresh liveness and unregister every entry whose worker has finished
    pub fn reap(&mut self) -> Vec<Identity> {
        for entry in self.entries.values_mut() {
            entry.alive = entry.handle.is_alive();
        }

        let dead: Vec<Identity> = self
            .entries
            .values()
            .filter(|e| !e.alive)
            .map(|e| e.identity.clone())
            .collect();

        for identity in &dead {
            self.unregister(identity);
            info!("Stopped monitoring {}", identity);
        }

        dead
    }

    /// Drop every entry and its files (daemon shutdown)
    pub fn clear(&mut self) {
        for identity in std::mem::take(&mut self.entries).into_keys() {
            self.remove_marker(&identity);
        }
        self.write_monitored();
    }

    fn prepare_state_dir(&self) -> Result<()> {
        let dir = &self.state_dir;
        match fs::symlink_metadata(dir) {
            Ok(meta) => {
                if !meta.is_dir() {
                    bail!("State directory {:?} is not a directory", dir);
                }
                let euid = unsafe { libc::geteuid() };
                if meta.uid() != euid {
                    bail!("State directory {:?} is owned by uid {}, expected {}", dir, meta.uid(), euid);
                }
                fs::set_permissions(dir, fs::Permissions::from_mode(STATE_DIR_MODE))
                    .with_context(|| format!("Failed to restrict permissions of {:?}", dir))?;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                fs::DirBuilder::new()
                    .recursive(true)
                    .mode(STATE_DIR_MODE)
                    .create(dir)
                    .with_context(|| format!("Failed to create state directory {:?}", dir))?;
            }
            Err(e) => return Err(e).with_context(|| format!("Cannot inspect state directory {:?}", dir)),
        }
        Ok(())
    }

    fn monitored_path(&self) -> PathBuf {
        self.state_dir.join(MONITORED_FILE)
    }

    fn marker_path(&self, identity: &Identity) -> PathBuf {
        self.state_dir
            .join(format!("{}.{}", identity.underscored(), MARKER_EXTENSION))
    }

    fn write_monitored(&self) {
        let mut content = String::new();
        for identity in self.entries.keys() {
            content.push_str(identity.as_str());
            content.push('\n');
        }

        if let Err(e) = fs::write(self.monitored_path(), content) {
            warn!("Failed to write {:?}: {}", self.monitored_path(), e);
        }
    }

    fn write_marker(&self, identity: &Identity, description: &str) {
        let path = self.marker_path(identity);
        if let Err(e) = fs::write(&path, format!("{}\n", description)) {
            warn!("{}: failed to write marker {:?}: {}", identity, path, e);
        }
    }

    fn remove_marker(&self, identity: &Identity) {
        let path = self.marker_path(identity);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("{}: failed to remove marker {:?}: {}", identity, path, e),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Worker stand-in whose liveness the test controls
    #[derive(Debug, Clone)]
    pub(crate) struct FakeHandle {
        pub alive: Arc<AtomicBool>,
    }

    impl FakeHandle {
        pub fn new() -> Self {
            Self {
                alive: Arc::new(AtomicBool::new(true)),
            }
        }

        pub fn kill(&self) {
            self.alive.store(false, Ordering::SeqCst);
        }
    }

    impl WorkerHandle for FakeHandle {
        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        fn describe(&self) -> String {
            "fake".to_string()
        }
    }

    /// Scratch directory removed on drop
    pub(crate) struct TestDir(pub PathBuf);

    impl TestDir {
        pub fn new(name: &str) -> Self {
            let dir = std::env::temp_dir().join(format!("padkill-test-{}-{}", std::process::id(), name));
            let _ = fs::remove_dir_all(&dir);
            Self(dir)
        }
    }

    impl Drop for TestDir {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.0);
        }
    }

    fn id(s: &str) -> Identity {
        Identity::parse(s).unwrap()
    }

    fn monitored_lines(dir: &Path) -> Vec<String> {
        fs::read_to_string(dir.join(MONITORED_FILE))
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_register_once_per_identity() {
        let dir = TestDir::new("register-once");
        let mut registry = WorkerRegistry::new(&dir.0);
        registry.reset().unwrap();

        assert!(registry.register(id("00:11:22:33:44:55"), FakeHandle::new()));
        assert!(!registry.register(id("00:11:22:33:44:55"), FakeHandle::new()));
        assert_eq!(registry.len(), 1);
        assert!(registry.is_monitored(&id("00:11:22:33:44:55")));
        assert_eq!(monitored_lines(&dir.0), vec!["00:11:22:33:44:55"]);
        assert!(dir.0.join("00_11_22_33_44_55.worker").exists());
    }

    #[test]
    fn test_unregister_absent_is_noop() {
        let dir = TestDir::new("unregister-absent");
        let mut registry: WorkerRegistry<FakeHandle> = WorkerRegistry::new(&dir.0);
        registry.reset().unwrap();

        assert!(registry.unregister(&id("00:11:22:33:44:55")).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_reap_removes_dead_workers_and_markers() {
        let dir = TestDir::new("reap");
        let mut registry = WorkerRegistry::new(&dir.0);
        registry.reset().unwrap();

        let live = FakeHandle::new();
        let dead = FakeHandle::new();
        registry.register(id("00:11:22:33:44:55"), live);
        registry.register(id("66:77:88:99:AA:BB"), dead.clone());

        assert!(registry.reap().is_empty());
        dead.kill();

        assert_eq!(registry.reap(), vec![id("66:77:88:99:AA:BB")]);
        assert_eq!(registry.list(), vec![id("00:11:22:33:44:55")]);
        assert!(!dir.0.join("66_77_88_99_AA_BB.worker").exists());
        assert!(dir.0.join("00_11_22_33_44_55.worker").exists());
        assert_eq!(monitored_lines(&dir.0), vec!["00:11:22:33:44:55"]);
        assert!(registry.entries[&id("00:11:22:33:44:55")].alive);
    }

    #[test]
    fn test_reset_wipes_previous_run() {
        let dir = TestDir::new("reset");
        fs::create_dir_all(&dir.0).unwrap();
        fs::write(dir.0.join(MONITORED_FILE), "00:11:22:33:44:55\n").unwrap();
        fs::write(dir.0.join("00_11_22_33_44_55.worker"), "pid=1\n").unwrap();
        fs::write(dir.0.join("notes.txt"), "keep me").unwrap();

        let mut registry: WorkerRegistry<FakeHandle> = WorkerRegistry::new(&dir.0);
        registry.reset().unwrap();

        assert!(monitored_lines(&dir.0).is_empty());
        assert!(!dir.0.join("00_11_22_33_44_55.worker").exists());
        assert!(dir.0.join("notes.txt").exists());
    }

    #[test]
    fn test_clear_removes_everything() {
        let dir = TestDir::new("clear");
        let mut registry = WorkerRegistry::new(&dir.0);
        registry.reset().unwrap();
        registry.register(id("00:11:22:33:44:55"), FakeHandle::new());
        registry.register(id("66:77:88:99:AA:BB"), FakeHandle::new());

        registry.clear();

        assert!(registry.is_empty());
        assert!(monitored_lines(&dir.0).is_empty());
        assert!(!dir.0.join("00_11_22_33_44_55.worker").exists());
    }

    #[test]
    fn test_clear_on_empty_registry_writes_list() {
        let dir = TestDir::new("clear-empty");
        let mut registry: WorkerRegistry<FakeHandle> = WorkerRegistry::new(&dir.0);
        registry.reset().unwrap();
        fs::remove_file(dir.0.join(MONITORED_FILE)).unwrap();

        registry.clear();

        assert!(monitored_lines(&dir.0).is_empty());
    }

    #[test]
    fn test_reset_creates_private_dir() {
        let dir = TestDir::new("private");
        let mut registry: WorkerRegistry<FakeHandle> = WorkerRegistry::new(dir.0.join("state"));
        registry.reset().unwrap();

        let mode = fs::metadata(dir.0.join("state")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn test_reset_tightens_existing_dir() {
        let dir = TestDir::new("loose");
        fs::create_dir_all(&dir.0).unwrap();
        fs::set_permissions(&dir.0, fs::Permissions::from_mode(0o777)).unwrap();

        let mut registry: WorkerRegistry<FakeHandle> = WorkerRegistry::new(&dir.0);
        registry.reset().unwrap();

        let mode = fs::metadata(&dir.0).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn test_reset_refuses_symlinked_dir() {
        let dir = TestDir::new("symlink");
        let target = dir.0.join("elsewhere");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join(MONITORED_FILE), "keep\n").unwrap();
        let link = dir.0.join("state");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let mut registry: WorkerRegistry<FakeHandle> = WorkerRegistry::new(&link);
        assert!(registry.reset().is_err());
        assert_eq!(fs::read_to_string(target.join(MONITORED_FILE)).unwrap(), "keep\n");
    }

    #[test]
    fn test_reset_refuses_plain_file() {
        let dir = TestDir::new("file");
        fs::create_dir_all(&dir.0).unwrap();
        let path = dir.0.join("state");
        fs::write(&path, "not a dir").unwrap();

        let mut registry: WorkerRegistry<FakeHandle> = WorkerRegistry::new(&path);
        assert!(registry.reset().is_err());
    }

    #[test]
    fn test_reset_refuses_foreign_owner() {
        // Only meaningful when the test user does not own /
        let root = Path::new("/");
        if fs::metadata(root).unwrap().uid() == unsafe { libc::geteuid() } {
            return;
        }
        let mut registry: WorkerRegistry<FakeHandle> = WorkerRegistry::new(root);
        let err = registry.reset().unwrap_err();
        assert!(err.to_string().contains("owned by uid"));
    }
}

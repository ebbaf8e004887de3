//! systemd service registration
//!
//! `--install` writes a system unit pointing at the running executable and
//! enables it; `--uninstall` reverses that. Both are idempotent: the unit file
//! is the marker of "installed".

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{info, warn};

pub const SERVICE_NAME: &str = "padkill.service";
const SYSTEM_UNIT_DIR: &str = "/etc/systemd/system";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed,
    AlreadyInstalled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UninstallOutcome {
    Removed,
    NotFound,
}

/// Runs `systemctl` subcommands
pub trait Systemctl {
    fn run(&self, args: &[&str]) -> Result<()>;
}

/// The real `systemctl` binary
pub struct SystemSystemctl;

impl Systemctl for SystemSystemctl {
    fn run(&self, args: &[&str]) -> Result<()> {
        let output = Command::new("systemctl")
            .args(args)
            .output()
            .context("Failed to run systemctl")?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("systemctl {} failed: {}", args.join(" "), stderr.trim())
        }
    }
}

pub struct ServiceManager<S> {
    unit_path: PathBuf,
    exe: PathBuf,
    systemctl: S,
}

impl ServiceManager<SystemSystemctl> {
    /// Manager for the system unit of the current executable
    pub fn system() -> Result<Self> {
        let exe = std::env::current_exe().context("Cannot determine path of the executable")?;
        Ok(Self::new(Path::new(SYSTEM_UNIT_DIR).join(SERVICE_NAME), exe, SystemSystemctl))
    }
}

impl<S: Systemctl> ServiceManager<S> {
    pub fn new(unit_path: PathBuf, exe: PathBuf, systemctl: S) -> Self {
        Self {
            unit_path,
            exe,
            systemctl,
        }
    }

    pub fn is_installed(&self) -> bool {
        self.unit_path.exists()
    }

    pub fn unit_file(&self) -> String {
        format!(
            r#"[Unit]
Description=Disconnect wireless PlayStation controllers with Home + Triangle
After=bluetooth.target
Wants=bluetooth.target

[Service]
Type=simple
ExecStart={}
Restart=on-failure
RestartSec=5
KillMode=control-group
RuntimeDirectory=padkill
RuntimeDirectoryMode=0700

[Install]
WantedBy=multi-user.target
"#,
            self.exe.display()
        )
    }

    pub fn install(&self) -> Result<InstallOutcome> {
        if self.is_installed() {
            info!("Service already installed at {:?}", self.unit_path);
            return Ok(InstallOutcome::AlreadyInstalled);
        }

        fs::write(&self.unit_path, self.unit_file())
            .with_context(|| format!("Failed to write unit file {:?}", self.unit_path))?;
        info!("Created unit file at {:?}", self.unit_path);

        let enabled = self
            .systemctl
            .run(&["daemon-reload"])
            .and_then(|()| self.systemctl.run(&["enable", "--now", SERVICE_NAME]));

        // No unit file may outlive a failed install
        if let Err(e) = enabled {
            if let Err(remove_err) = fs::remove_file(&self.unit_path) {
                warn!("Failed to remove unit file {:?}: {}", self.unit_path, remove_err);
            }
            return Err(e.context("Service could not be enabled, unit file removed"));
        }

        info!("Service enabled and started");
        Ok(InstallOutcome::Installed)
    }

    pub fn uninstall(&self) -> Result<UninstallOutcome> {
        if !self.is_installed() {
            return Ok(UninstallOutcome::NotFound);
        }

        // A unit that is already stopped or disabled must not block removal
        if let Err(e) = self.systemctl.run(&["disable", "--now", SERVICE_NAME]) {
            warn!("{e:#}");
        }

        fs::remove_file(&self.unit_path)
            .with_context(|| format!("Failed to remove unit file {:?}", self.unit_path))?;
        info!("Removed unit file {:?}", self.unit_path);

        self.systemctl.run(&["daemon-reload"])?;
        Ok(UninstallOutcome::Removed)
    }
}

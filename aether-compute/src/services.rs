//! Service manager abstraction and the systemd user-unit implementation.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use aether_core::VmId;
use async_trait::async_trait;

use crate::exec::{argv, CommandRunner};
use crate::ComputeError;

const VM_UNIT_PREFIX: &str = "aether-vm-";
const VM_UNIT_SUFFIX: &str = ".service";

/// Name of the unit supervising a VM.
#[must_use]
pub fn vm_unit_name(vm_id: &VmId) -> String {
    format!("{VM_UNIT_PREFIX}{vm_id}{VM_UNIT_SUFFIX}")
}

/// Inverse of [`vm_unit_name`]. Returns `None` for any other unit.
#[must_use]
pub fn vm_id_from_unit_name(unit: &str) -> Option<VmId> {
    unit.strip_prefix(VM_UNIT_PREFIX)?
        .strip_suffix(VM_UNIT_SUFFIX)?
        .parse()
        .ok()
}

/// A service definition: what to run and when to start it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitFile {
    pub description: String,
    /// Already escaped command line.
    pub exec_start: String,
    pub wanted_by: String,
}

impl UnitFile {
    /// A long-running service started with the user session.
    #[must_use]
    pub fn simple(exec_start: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            exec_start: exec_start.into(),
            wanted_by: "default.target".to_owned(),
        }
    }

    /// Render in systemd unit file syntax.
    #[must_use]
    pub fn render(&self) -> String {
        format!(
            "[Unit]\nDescription={}\n\n[Service]\nExecStart={}\n\n[Install]\nWantedBy={}\n",
            self.description, self.exec_start, self.wanted_by
        )
    }
}

/// Installs and supervises long-running services.
///
/// Unit names must carry their type suffix (`foo.service`). Every query goes
/// to the live service manager; implementations must not cache state.
#[async_trait]
pub trait ServiceManager: Send + Sync {
    /// Install a unit so it can be started.
    ///
    /// # Errors
    /// Returns [`ComputeError::InvalidUnitName`] for a name without suffix and
    /// [`ComputeError::Service`] if the unit cannot be written or loaded.
    async fn install(&self, unit: &UnitFile, name: &str) -> Result<(), ComputeError>;

    /// Install a unit that just runs `exec_start`.
    ///
    /// # Errors
    /// See [`ServiceManager::install`].
    async fn install_simple(&self, exec_start: &str, name: &str) -> Result<(), ComputeError> {
        let unit = UnitFile::simple(exec_start, format!("aether {name}"));
        self.install(&unit, name).await
    }

    /// Remove an installed unit. Removing a missing unit succeeds.
    async fn uninstall(&self, name: &str) -> Result<(), ComputeError>;

    /// Start the unit automatically with the user session.
    async fn enable(&self, name: &str) -> Result<(), ComputeError>;

    async fn disable(&self, name: &str) -> Result<(), ComputeError>;

    async fn start(&self, name: &str) -> Result<(), ComputeError>;

    async fn stop(&self, name: &str) -> Result<(), ComputeError>;

    /// Whether the unit is installed.
    async fn exists(&self, name: &str) -> Result<bool, ComputeError>;

    /// Whether the unit is currently active.
    async fn is_running(&self, name: &str) -> Result<bool, ComputeError>;
}

fn check_unit_name(name: &str) -> Result<(), ComputeError> {
    let valid = name.contains('.') && !name.contains('/') && !name.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(ComputeError::InvalidUnitName(name.to_owned()))
    }
}

/// [`ServiceManager`] for systemd user units.
///
/// Unit files live in `unit_dir` (normally `~/.config/systemd/user`); state
/// changes go through `systemctl --user`.
pub struct SystemdServiceManager {
    unit_dir: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl SystemdServiceManager {
    #[must_use]
    pub fn new(unit_dir: PathBuf, runner: Arc<dyn CommandRunner>) -> Self {
        Self { unit_dir, runner }
    }

    fn unit_path(&self, name: &str) -> PathBuf {
        self.unit_dir.join(name)
    }

    async fn systemctl(
        &self,
        action: &'static str,
        name: Option<&str>,
    ) -> Result<crate::exec::CommandOutput, ComputeError> {
        let mut cmd = argv(["systemctl", "--user", action]);
        if let Some(name) = name {
            cmd.push(name.to_owned());
        }
        self.runner.run(&cmd).await
    }

    async fn transition(&self, action: &'static str, name: &str) -> Result<(), ComputeError> {
        check_unit_name(name)?;
        let out = self.systemctl(action, Some(name)).await?;
        if out.success() {
            Ok(())
        } else {
            Err(ComputeError::Service {
                unit: name.to_owned(),
                action,
                reason: out.stderr.trim().to_owned(),
            })
        }
    }
}

#[async_trait]
impl ServiceManager for SystemdServiceManager {
    async fn install(&self, unit: &UnitFile, name: &str) -> Result<(), ComputeError> {
        check_unit_name(name)?;
        let service_error = |reason: String| ComputeError::Service {
            unit: name.to_owned(),
            action: "install",
            reason,
        };

        tokio::fs::create_dir_all(&self.unit_dir)
            .await
            .map_err(|e| service_error(format!("create {}: {e}", self.unit_dir.display())))?;
        tokio::fs::write(self.unit_path(name), unit.render())
            .await
            .map_err(|e| service_error(format!("write unit file: {e}")))?;

        let out = self.systemctl("daemon-reload", None).await?;
        if !out.success() {
            return Err(service_error(format!("daemon-reload: {}", out.stderr.trim())));
        }

        tracing::debug!(unit = %name, "installed unit");
        Ok(())
    }

    async fn uninstall(&self, name: &str) -> Result<(), ComputeError> {
        check_unit_name(name)?;
        match tokio::fs::remove_file(self.unit_path(name)).await {
            Ok(()) => {
                tracing::debug!(unit = %name, "removed unit");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ComputeError::Service {
                unit: name.to_owned(),
                action: "uninstall",
                reason: e.to_string(),
            }),
        }
    }

    async fn enable(&self, name: &str) -> Result<(), ComputeError> {
        self.transition("enable", name).await
    }

    async fn disable(&self, name: &str) -> Result<(), ComputeError> {
        self.transition("disable", name).await
    }

    async fn start(&self, name: &str) -> Result<(), ComputeError> {
        self.transition("start", name).await
    }

    async fn stop(&self, name: &str) -> Result<(), ComputeError> {
        self.transition("stop", name).await
    }

    async fn exists(&self, name: &str) -> Result<bool, ComputeError> {
        check_unit_name(name)?;
        Ok(tokio::fs::try_exists(self.unit_path(name)).await?)
    }

    async fn is_running(&self, name: &str) -> Result<bool, ComputeError> {
        check_unit_name(name)?;
        let cmd = argv(["systemctl", "--user", "is-active", "--quiet", name]);
        Ok(self.runner.run(&cmd).await?.success())
    }
}

/// Check that a freshly started unit is still up once `grace` has passed.
///
/// systemd reports a `Type=simple` unit active as soon as it is forked, so
/// the unit is polled for the whole grace period and a single poll that
/// finds it stopped fails the check.
///
/// # Errors
/// Returns [`ComputeError::Service`] if the unit stops before `grace` ends.
pub async fn confirm_running<S>(
    services: &S,
    name: &str,
    grace: Duration,
) -> Result<(), ComputeError>
where
    S: ServiceManager + ?Sized,
{
    const POLL: Duration = Duration::from_millis(100);
    let deadline = tokio::time::Instant::now() + grace;
    loop {
        if !services.is_running(name).await? {
            return Err(ComputeError::Service {
                unit: name.to_owned(),
                action: "start",
                reason: format!("exited within {}ms of starting", grace.as_millis()),
            });
        }
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return Ok(());
        }
        tokio::time::sleep(POLL.min(deadline - now)).await;
    }
}

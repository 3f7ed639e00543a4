//! Disk image handling: copy-on-write clones and guest filesystem access.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use async_trait::async_trait;

use crate::exec::{argv, run_chain, CommandRunner};
use crate::ComputeError;

/// Path of the first-boot script inside the guest.
pub const GUEST_INIT_SCRIPT: &str = "usr/local/sbin/aether-init.sh";

/// Path of the first-boot unit inside the guest.
pub const GUEST_INIT_UNIT: &str = "etc/systemd/system/aether-init.service";

const GUEST_INIT_WANTS: &str =
    "etc/systemd/system/multi-user.target.wants/aether-init.service";

const GUEST_INIT_UNIT_TEXT: &str = "\
[Unit]
Description=aether first-boot script
ConditionPathExists=!/var/lib/aether/init-done
Wants=network-online.target
After=network-online.target

[Service]
Type=oneshot
ExecStart=/usr/local/sbin/aether-init.sh
ExecStartPost=/bin/mkdir -p /var/lib/aether
ExecStartPost=/bin/touch /var/lib/aether/init-done

[Install]
WantedBy=multi-user.target
";

/// A guest filesystem mounted on the host.
///
/// Dropping a managed mount unmounts it in the background (or in place when
/// no tokio runtime is running) and only logs failures. Callers are expected
/// to use [`ImageTool::unmount`], which reports them.
#[derive(Debug)]
pub struct GuestMount {
    mount_point: PathBuf,
    unmount_program: Option<String>,
}

impl GuestMount {
    /// A mount that `unmount_program <mount_point>` undoes.
    #[must_use]
    pub fn new(mount_point: PathBuf, unmount_program: impl Into<String>) -> Self {
        Self {
            mount_point,
            unmount_program: Some(unmount_program.into()),
        }
    }

    /// A plain directory standing in for a mount. Nothing happens on drop.
    #[must_use]
    pub fn unmanaged(mount_point: PathBuf) -> Self {
        Self {
            mount_point,
            unmount_program: None,
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.mount_point
    }

    /// Give up responsibility for unmounting.
    fn disarm(&mut self) -> Option<String> {
        self.unmount_program.take()
    }
}

impl Drop for GuestMount {
    fn drop(&mut self) {
        let Some(program) = self.unmount_program.take() else {
            return;
        };
        let mount_point = std::mem::take(&mut self.mount_point);
        tracing::warn!(mount = %mount_point.display(), "guest mount dropped while mounted");

        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                let status = tokio::process::Command::new(&program)
                    .arg(&mount_point)
                    .stdin(Stdio::null())
                    .status()
                    .await;
                if unmounted(&mount_point, status) {
                    if let Err(e) = tokio::fs::remove_dir(&mount_point).await {
                        warn_mount_point_kept(&mount_point, &e);
                    }
                }
            });
        } else {
            let status = std::process::Command::new(&program)
                .arg(&mount_point)
                .stdin(Stdio::null())
                .status();
            if unmounted(&mount_point, status) {
                if let Err(e) = std::fs::remove_dir(&mount_point) {
                    warn_mount_point_kept(&mount_point, &e);
                }
            }
        }
    }
}

/// Only an empty directory is ever removed afterwards, so a failed unmount
/// never leads to deleting guest files.
fn unmounted(mount_point: &Path, status: std::io::Result<ExitStatus>) -> bool {
    match status {
        Ok(s) if s.success() => true,
        Ok(s) => {
            tracing::warn!(mount = %mount_point.display(), status = %s, "unmount on drop failed");
            false
        }
        Err(e) => {
            tracing::warn!(mount = %mount_point.display(), error = %e, "unmount on drop failed");
            false
        }
    }
}

fn warn_mount_point_kept(mount_point: &Path, err: &std::io::Error) {
    tracing::warn!(mount = %mount_point.display(), error = %err, "could not remove mount point");
}

/// Operations on VM disk images.
#[async_trait]
pub trait ImageTool: Send + Sync {
    /// Create `target` as a copy-on-write overlay of `base`.
    ///
    /// # Errors
    /// Returns [`ComputeError::ExternalTool`] if the image cannot be created.
    async fn clone_image(&self, base: &Path, target: &Path) -> Result<(), ComputeError>;

    /// Mount the filesystem of `image` at `mount_point`.
    ///
    /// # Errors
    /// Returns [`ComputeError::ExternalTool`] if the mount fails.
    async fn mount_guest(&self, image: &Path, mount_point: &Path) -> Result<GuestMount, ComputeError>;

    /// Unmount and remove the mount point.
    ///
    /// # Errors
    /// Returns [`ComputeError::ExternalTool`] if the unmount fails.
    async fn unmount(&self, mount: GuestMount) -> Result<(), ComputeError>;

    /// Install `script` to run once on the guest's first boot.
    ///
    /// # Errors
    /// Returns [`ComputeError::Io`] if the guest filesystem cannot be written.
    async fn install_startup_script(&self, script: &str, mount: &GuestMount) -> Result<(), ComputeError> {
        install_first_boot_script(mount.path(), script).await
    }
}

async fn install_first_boot_script(root: &Path, script: &str) -> Result<(), ComputeError> {
    use std::os::unix::fs::PermissionsExt;

    let script_path = root.join(GUEST_INIT_SCRIPT);
    let unit_path = root.join(GUEST_INIT_UNIT);
    let wants_path = root.join(GUEST_INIT_WANTS);

    for path in [&script_path, &unit_path, &wants_path] {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let body = if script.starts_with("#!") {
        script.to_owned()
    } else {
        format!("#!/bin/sh\n{script}")
    };
    tokio::fs::write(&script_path, body).await?;
    tokio::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755)).await?;

    tokio::fs::write(&unit_path, GUEST_INIT_UNIT_TEXT).await?;

    match tokio::fs::remove_file(&wants_path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    tokio::fs::symlink(Path::new("/").join(GUEST_INIT_UNIT), &wants_path).await?;

    tracing::debug!(root = %root.display(), "installed first-boot script");
    Ok(())
}

/// [`ImageTool`] using `qemu-img` and libguestfs.
pub struct LibguestfsImageTool {
    runner: Arc<dyn CommandRunner>,
}

impl LibguestfsImageTool {
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl ImageTool for LibguestfsImageTool {
    async fn clone_image(&self, base: &Path, target: &Path) -> Result<(), ComputeError> {
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let base = tokio::fs::canonicalize(base).await?;
        let cmd = vec![
            "qemu-img".to_owned(),
            "create".to_owned(),
            "-f".to_owned(),
            "qcow2".to_owned(),
            "-b".to_owned(),
            base.to_string_lossy().into_owned(),
            "-F".to_owned(),
            "qcow2".to_owned(),
            target.to_string_lossy().into_owned(),
        ];
        run_chain(self.runner.as_ref(), &[cmd]).await
    }

    async fn mount_guest(&self, image: &Path, mount_point: &Path) -> Result<GuestMount, ComputeError> {
        tokio::fs::create_dir_all(mount_point).await?;
        let cmd = argv([
            "guestmount",
            "-a",
            &*image.to_string_lossy(),
            "-i",
            &*mount_point.to_string_lossy(),
        ]);
        if let Err(e) = run_chain(self.runner.as_ref(), &[cmd]).await {
            if let Err(rm) = tokio::fs::remove_dir(mount_point).await {
                warn_mount_point_kept(mount_point, &rm);
            }
            return Err(e);
        }
        tracing::debug!(image = %image.display(), mount = %mount_point.display(), "mounted guest");
        Ok(GuestMount::new(mount_point.to_owned(), "guestunmount"))
    }

    async fn unmount(&self, mut mount: GuestMount) -> Result<(), ComputeError> {
        let Some(program) = mount.disarm() else {
            return Ok(());
        };
        let cmd = argv([program.as_str(), &*mount.path().to_string_lossy()]);
        if let Err(e) = run_chain(self.runner.as_ref(), &[cmd]).await {
            // Re-arm so drop gets another chance.
            mount.unmount_program = Some(program);
            return Err(e);
        }
        tokio::fs::remove_dir(mount.path()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::SystemRunner;

    #[tokio::test]
    async fn first_boot_script_is_installed_and_enabled() {
        let dir = match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => panic!("tempdir: {e}"),
        };
        let mount = GuestMount::unmanaged(dir.path().to_owned());
        let tool = LibguestfsImageTool::new(Arc::new(SystemRunner));

        if let Err(e) = tool.install_startup_script("apt-get install -y nginx\n", &mount).await {
            panic!("install failed: {e}");
        }

        let script = match std::fs::read_to_string(dir.path().join(GUEST_INIT_SCRIPT)) {
            Ok(s) => s,
            Err(e) => panic!("script missing: {e}"),
        };
        assert_eq!(script, "#!/bin/sh\napt-get install -y nginx\n");

        let unit = match std::fs::read_to_string(dir.path().join(GUEST_INIT_UNIT)) {
            Ok(s) => s,
            Err(e) => panic!("unit missing: {e}"),
        };
        assert!(unit.contains("Type=oneshot"), "{unit}");
        assert!(unit.contains("ConditionPathExists=!/var/lib/aether/init-done"), "{unit}");

        let link = match std::fs::read_link(dir.path().join(GUEST_INIT_WANTS)) {
            Ok(l) => l,
            Err(e) => panic!("wants link missing: {e}"),
        };
        assert_eq!(link, PathBuf::from("/etc/systemd/system/aether-init.service"));
    }

    #[tokio::test]
    async fn installing_twice_replaces_the_link() {
        let dir = match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => panic!("tempdir: {e}"),
        };
        let mount = GuestMount::unmanaged(dir.path().to_owned());
        let tool = LibguestfsImageTool::new(Arc::new(SystemRunner));
        for script in ["#!/bin/bash\necho one\n", "#!/bin/bash\necho two\n"] {
            if let Err(e) = tool.install_startup_script(script, &mount).await {
                panic!("install failed: {e}");
            }
        }
        let script = std::fs::read_to_string(dir.path().join(GUEST_INIT_SCRIPT)).unwrap_or_default();
        assert_eq!(script, "#!/bin/bash\necho two\n", "existing shebang must be kept");
    }

    fn scratch_mount_point() -> (tempfile::TempDir, PathBuf) {
        let dir = match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => panic!("tempdir: {e}"),
        };
        let mount_point = dir.path().join("mnt");
        if let Err(e) = std::fs::create_dir(&mount_point) {
            panic!("mkdir: {e}");
        }
        (dir, mount_point)
    }

    #[tokio::test]
    async fn dropped_mount_is_unmounted_in_the_background() {
        let (_dir, mount_point) = scratch_mount_point();
        drop(GuestMount::new(mount_point.clone(), "true"));

        for _ in 0..100 {
            if !mount_point.exists() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        panic!("mount point {} was not removed", mount_point.display());
    }

    #[tokio::test]
    async fn failed_unmount_on_drop_keeps_the_mount_point() {
        let (_dir, mount_point) = scratch_mount_point();
        drop(GuestMount::new(mount_point.clone(), "false"));
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        assert!(mount_point.exists(), "guest files must never be removed after a failed unmount");
    }

    #[test]
    fn dropped_mount_outside_a_runtime_unmounts_in_place() {
        let (_dir, mount_point) = scratch_mount_point();
        drop(GuestMount::new(mount_point.clone(), "true"));
        assert!(!mount_point.exists());
    }

    #[tokio::test]
    async fn unmanaged_mount_unmounts_without_commands() {
        let tool = LibguestfsImageTool::new(Arc::new(SystemRunner));
        let mount = GuestMount::unmanaged(PathBuf::from("/nonexistent/aether-mount"));
        assert!(tool.unmount(mount).await.is_ok(), "nothing to undo for an unmanaged mount");
    }
}

//! In-memory stand-ins for the host: service manager, process table, image
//! tool, guest control and command runner.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use aether_compute::{
    vm_id_from_unit_name, vm_process_name, CommandOutput, CommandRunner, ComputeError,
    ControlError, GuestControl, GuestMount, HostConfig, ImageTool, OverlayManager, ProcessTable,
    RouterAdvertisements, ServiceManager, UnitFile, VmManager, VpnPool,
};
use aether_core::VmId;
use async_trait::async_trait;

#[derive(Default)]
struct ServiceState {
    units: BTreeMap<String, UnitFile>,
    running: BTreeSet<String>,
    enabled: BTreeSet<String>,
    installs: Vec<String>,
    /// Units that exit after answering this many more liveness polls.
    short_lived: BTreeMap<String, usize>,
    polls: BTreeMap<String, usize>,
    starts: Vec<String>,
}

/// Service manager whose running VM units double as the process table.
#[derive(Default)]
pub struct FakeServices {
    state: Mutex<ServiceState>,
    pub fail_vm_start: AtomicBool,
}

impl FakeServices {
    fn state(&self) -> std::sync::MutexGuard<'_, ServiceState> {
        self.state.lock().expect("service state poisoned")
    }

    pub fn unit(&self, name: &str) -> Option<UnitFile> {
        self.state().units.get(name).cloned()
    }

    pub fn unit_names(&self) -> Vec<String> {
        self.state().units.keys().cloned().collect()
    }

    pub fn running(&self, name: &str) -> bool {
        self.state().running.contains(name)
    }

    pub fn enabled(&self, name: &str) -> bool {
        self.state().enabled.contains(name)
    }

    /// How often `name` was installed.
    pub fn install_count(&self, name: &str) -> usize {
        self.state().installs.iter().filter(|n| *n == name).count()
    }

    /// How often `name` was started.
    pub fn start_count(&self, name: &str) -> usize {
        self.state().starts.iter().filter(|n| *n == name).count()
    }

    /// Simulate the hypervisor exiting on its own.
    pub fn crash(&self, name: &str) {
        self.state().running.remove(name);
    }

    /// Make `name` report running for `polls` liveness checks after each
    /// start and exit afterwards, like a daemon that dies during startup.
    pub fn crash_after_polls(&self, name: &str, polls: usize) {
        self.state().short_lived.insert(name.to_owned(), polls);
    }
}

fn check_suffix(name: &str) -> Result<(), ComputeError> {
    if name.contains('.') {
        Ok(())
    } else {
        Err(ComputeError::InvalidUnitName(name.to_owned()))
    }
}

#[async_trait]
impl ServiceManager for FakeServices {
    async fn install(&self, unit: &UnitFile, name: &str) -> Result<(), ComputeError> {
        check_suffix(name)?;
        let mut state = self.state();
        state.units.insert(name.to_owned(), unit.clone());
        state.installs.push(name.to_owned());
        Ok(())
    }

    async fn uninstall(&self, name: &str) -> Result<(), ComputeError> {
        check_suffix(name)?;
        self.state().units.remove(name);
        Ok(())
    }

    async fn enable(&self, name: &str) -> Result<(), ComputeError> {
        self.state().enabled.insert(name.to_owned());
        Ok(())
    }

    async fn disable(&self, name: &str) -> Result<(), ComputeError> {
        self.state().enabled.remove(name);
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<(), ComputeError> {
        let fail = self.fail_vm_start.load(Ordering::SeqCst) && vm_id_from_unit_name(name).is_some();
        let mut state = self.state();
        if fail || !state.units.contains_key(name) {
            return Err(ComputeError::Service {
                unit: name.to_owned(),
                action: "start",
                reason: "Unit failed to start".to_owned(),
            });
        }
        state.running.insert(name.to_owned());
        state.starts.push(name.to_owned());
        state.polls.remove(name);
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<(), ComputeError> {
        self.state().running.remove(name);
        Ok(())
    }

    async fn exists(&self, name: &str) -> Result<bool, ComputeError> {
        Ok(self.state().units.contains_key(name))
    }

    async fn is_running(&self, name: &str) -> Result<bool, ComputeError> {
        let mut state = self.state();
        if !state.running.contains(name) {
            return Ok(false);
        }
        let Some(limit) = state.short_lived.get(name).copied() else {
            return Ok(true);
        };
        let polls = state.polls.get(name).copied().unwrap_or(0);
        if polls >= limit {
            state.running.remove(name);
            return Ok(false);
        }
        state.polls.insert(name.to_owned(), polls + 1);
        Ok(true)
    }
}

#[async_trait]
impl ProcessTable for FakeServices {
    async fn process_names(&self) -> Result<Vec<String>, ComputeError> {
        let mut names: Vec<String> = self
            .state()
            .running
            .iter()
            .filter_map(|unit| vm_id_from_unit_name(unit))
            .map(|id| vm_process_name(&id))
            .collect();
        names.push("systemd".to_owned());
        names.push("qemu-img".to_owned());
        Ok(names)
    }
}

/// Image tool that writes empty files instead of qcow2 images and hands out
/// plain directories as mounts.
#[derive(Default)]
pub struct FakeImages {
    pub clones: Mutex<Vec<(PathBuf, PathBuf)>>,
    pub mounts: Mutex<Vec<PathBuf>>,
    pub fail_clone: AtomicBool,
}

#[async_trait]
impl ImageTool for FakeImages {
    async fn clone_image(&self, base: &Path, target: &Path) -> Result<(), ComputeError> {
        if self.fail_clone.load(Ordering::SeqCst) {
            return Err(ComputeError::ExternalTool {
                tool: "qemu-img".to_owned(),
                reason: "exit status 1".to_owned(),
            });
        }
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(target, b"").await?;
        self.clones
            .lock()
            .expect("clones poisoned")
            .push((base.to_owned(), target.to_owned()));
        Ok(())
    }

    async fn mount_guest(&self, _image: &Path, mount_point: &Path) -> Result<GuestMount, ComputeError> {
        tokio::fs::create_dir_all(mount_point).await?;
        self.mounts.lock().expect("mounts poisoned").push(mount_point.to_owned());
        Ok(GuestMount::unmanaged(mount_point.to_owned()))
    }

    async fn unmount(&self, _mount: GuestMount) -> Result<(), ComputeError> {
        Ok(())
    }
}

/// Guest control that records power-downs and answers address queries from
/// a table. Guests missing from the table behave like a silent agent.
#[derive(Default)]
pub struct FakeControl {
    pub powerdowns: Mutex<Vec<VmId>>,
    pub addresses: Mutex<BTreeMap<VmId, Vec<String>>>,
}

#[async_trait]
impl GuestControl for FakeControl {
    async fn powerdown(&self, vm_id: &VmId) -> Result<(), ControlError> {
        self.powerdowns.lock().expect("powerdowns poisoned").push(vm_id.clone());
        Ok(())
    }

    async fn guest_ip_addresses(&self, vm_id: &VmId) -> Result<Vec<String>, ControlError> {
        self.addresses
            .lock()
            .expect("addresses poisoned")
            .get(vm_id)
            .cloned()
            .ok_or_else(|| ControlError::Unavailable {
                path: PathBuf::from(format!("/tmp/aether-qga-{vm_id}.sock")),
                reason: "guest agent did not respond".to_owned(),
            })
    }
}

/// Records every command. `ip link show dev X` succeeds with output only for
/// devices in `devices`; any command whose joined argv equals an entry of
/// `failing` exits with status 1.
#[derive(Default)]
pub struct RecordingRunner {
    calls: Mutex<Vec<Vec<String>>>,
    pub devices: Mutex<BTreeSet<String>>,
    pub failing: Mutex<BTreeSet<String>>,
}

impl RecordingRunner {
    pub fn with_devices(devices: &[&str]) -> Self {
        let runner = Self::default();
        runner
            .devices
            .lock()
            .expect("devices poisoned")
            .extend(devices.iter().map(|d| (*d).to_owned()));
        runner
    }

    pub fn fail_on(&self, command: &str) {
        self.failing.lock().expect("failing poisoned").insert(command.to_owned());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .expect("calls poisoned")
            .iter()
            .map(|argv| argv.join(" "))
            .collect()
    }

    /// Calls other than device existence queries.
    pub fn mutations(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| !c.starts_with("ip link show"))
            .collect()
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, argv: &[String]) -> Result<CommandOutput, ComputeError> {
        self.calls.lock().expect("calls poisoned").push(argv.to_vec());
        let joined = argv.join(" ");
        if self.failing.lock().expect("failing poisoned").contains(&joined) {
            return Ok(CommandOutput::failed(1, "RTNETLINK answers: Operation not permitted"));
        }
        if let ["ip", "link", "show", "dev", device] =
            argv.iter().map(String::as_str).collect::<Vec<_>>().as_slice()
        {
            let mut out = CommandOutput::ok();
            if self.devices.lock().expect("devices poisoned").contains(*device) {
                out.stdout = format!("4: {device}: <BROADCAST,MULTICAST,UP> mtu 1500\n");
            }
            return Ok(out);
        }
        Ok(CommandOutput::ok())
    }
}

/// A VM manager wired to fakes inside a scratch directory.
pub struct Harness {
    pub dir: tempfile::TempDir,
    pub config: Arc<HostConfig>,
    pub services: Arc<FakeServices>,
    pub images: Arc<FakeImages>,
    pub control: Arc<FakeControl>,
    pub runner: Arc<RecordingRunner>,
    pub manager: VmManager,
}

impl Harness {
    /// A host with base image `base1` and a VPN pool of `pool_size` slots.
    pub fn new(pool_size: usize) -> Self {
        Self::build(pool_size, None)
    }

    /// Like [`Harness::new`], advertising IPv6 networks from `2001:db8:0`.
    pub fn with_router_advertisements(pool_size: usize) -> Self {
        let site = "2001:db8:0".parse().expect("valid site prefix");
        let adverts = RouterAdvertisements::new(site, "nobody", false).expect("valid user");
        Self::build(pool_size, Some(adverts))
    }

    fn build(pool_size: usize, adverts: Option<RouterAdvertisements>) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        for sub in ["base", "user", "vpn", "run"] {
            std::fs::create_dir_all(root.join(sub)).expect("create scratch dir");
        }
        std::fs::write(root.join("base").join("base1.qcow2"), b"").expect("write base image");

        let mut config = HostConfig::new(
            root.join("base"),
            root.join("user"),
            root.join("vpn"),
            root.join("run"),
        );
        config.startup_grace = Duration::from_millis(50);
        let config = Arc::new(config);

        let services = Arc::new(FakeServices::default());
        let images = Arc::new(FakeImages::default());
        let control = Arc::new(FakeControl::default());
        let runner = Arc::new(RecordingRunner::default());

        let mut overlays = OverlayManager::new(
            VpnPool::with_capacity(pool_size),
            Arc::clone(&config),
            services.clone(),
            runner.clone(),
        );
        if let Some(adverts) = adverts {
            overlays = overlays.with_router_advertisements(adverts);
        }
        let manager = VmManager::new(
            Arc::clone(&config),
            services.clone(),
            images.clone(),
            services.clone(),
            control.clone(),
            overlays,
        );

        Self {
            dir,
            config,
            services,
            images,
            control,
            runner,
            manager,
        }
    }
}

//! Compiles a VM's launch parameters into a QEMU invocation and the unit
//! that supervises it.
//!
//! Compilation is pure: nothing here touches the host. The argument vector
//! stays structured until [`LaunchDefinition::command_line`] serialises it
//! through [`escape_exec_arg`], the only place where quoting happens.

use std::path::{Path, PathBuf};

use aether_core::{MacAddress, OverlayName, VmId};

use crate::process::vm_process_name;
use crate::services::{vm_unit_name, UnitFile};
use crate::HostConfig;

/// What a VM network interface is attached to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterfaceRole {
    /// The host-wide public switch.
    Public,
    /// The private switch of a VPN overlay.
    PrivateVpn(OverlayName),
}

/// A virtual NIC backed by a VDE switch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInterface {
    pub mac: MacAddress,
    /// Control socket of the VDE switch.
    pub backend: PathBuf,
    pub role: InterfaceRole,
}

impl NetworkInterface {
    /// A public interface with a fresh MAC address.
    #[must_use]
    pub fn public(backend: PathBuf) -> Self {
        Self {
            mac: MacAddress::random(),
            backend,
            role: InterfaceRole::Public,
        }
    }

    /// A private overlay interface with a fresh MAC address.
    #[must_use]
    pub fn private(overlay: OverlayName, backend: PathBuf) -> Self {
        Self {
            mac: MacAddress::random(),
            backend,
            role: InterfaceRole::PrivateVpn(overlay),
        }
    }
}

/// Everything needed to run one VM under the service manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchDefinition {
    pub vm_id: VmId,
    pub unit_name: String,
    pub program: String,
    pub args: Vec<String>,
    pub monitor_socket: PathBuf,
    pub agent_socket: PathBuf,
    /// Interfaces in guest order (`net0`, `net1`, ...).
    pub interfaces: Vec<NetworkInterface>,
}

impl LaunchDefinition {
    /// The command line in systemd `ExecStart=` syntax.
    #[must_use]
    pub fn command_line(&self) -> String {
        let program = if self.program.starts_with(['@', '-', ':', '+', '!']) {
            quote(&self.program)
        } else {
            escape_exec_arg(&self.program)
        };
        std::iter::once(program)
            .chain(self.args.iter().map(|a| escape_exec_arg(a)))
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[must_use]
    pub fn unit(&self) -> UnitFile {
        UnitFile::simple(self.command_line(), format!("aether VM {}", self.vm_id))
    }
}

/// Build the launch definition of a VM.
///
/// Private interfaces always precede the public one so the guest sees the
/// VPN as `net0`.
#[must_use]
pub fn compile(
    vm_id: &VmId,
    user_image: &Path,
    interfaces: &[NetworkInterface],
    config: &HostConfig,
) -> LaunchDefinition {
    let monitor_socket = config.monitor_socket(vm_id);
    let agent_socket = config.agent_socket(vm_id);

    let ordered: Vec<NetworkInterface> = interfaces
        .iter()
        .filter(|i| i.role != InterfaceRole::Public)
        .chain(interfaces.iter().filter(|i| i.role == InterfaceRole::Public))
        .cloned()
        .collect();

    let mut args: Vec<String> = vec![
        "-cpu".into(),
        "host".into(),
        "-m".into(),
        config.memory_mib.to_string(),
        "-accel".into(),
        "kvm".into(),
        "-hda".into(),
        opt_value(user_image),
        "-name".into(),
        format!("qemu-vm-{vm_id},process={}", vm_process_name(vm_id)),
        "-nographic".into(),
        "-qmp".into(),
        format!("unix:{},server,nowait", opt_value(&monitor_socket)),
        "-chardev".into(),
        format!("socket,path={},server,nowait,id=qga0", opt_value(&agent_socket)),
        "-device".into(),
        "virtio-serial".into(),
        "-device".into(),
        "virtserialport,chardev=qga0,name=org.qemu.guest_agent.0".into(),
    ];

    for (i, iface) in ordered.iter().enumerate() {
        args.push("-device".into());
        args.push(format!("virtio-net-pci,netdev=net{i},mac={}", iface.mac));
        args.push("-netdev".into());
        args.push(format!("vde,id=net{i},sock={}", opt_value(&iface.backend)));
    }

    LaunchDefinition {
        vm_id: vm_id.clone(),
        unit_name: vm_unit_name(vm_id),
        program: config.qemu_binary.clone(),
        args,
        monitor_socket,
        agent_socket,
        interfaces: ordered,
    }
}

/// A path as a QEMU option value: commas are doubled.
fn opt_value(path: &Path) -> String {
    path.to_string_lossy().replace(',', ",,")
}

fn is_safe_byte(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '/' | ':' | ',' | '=' | '@' | '+' | '-')
}

/// Escape one argument for a systemd `ExecStart=` line.
///
/// Words made only of `[A-Za-z0-9_./:,=@+-]` are left bare. Anything else
/// is single-quoted with `\` and `'` backslash-escaped, control characters
/// written as `\xNN`/`\uNNNN`, and the specifier and variable markers `%`
/// and `$` doubled.
#[must_use]
pub fn escape_exec_arg(arg: &str) -> String {
    if !arg.is_empty() && arg.chars().all(is_safe_byte) {
        return arg.to_owned();
    }
    quote(arg)
}

fn quote(arg: &str) -> String {
    let mut out = String::with_capacity(arg.len() + 2);
    out.push('\'');
    for c in arg.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '%' => out.push_str("%%"),
            '$' => out.push_str("$$"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c if c.is_ascii_control() => out.push_str(&format!("\\x{:02x}", u32::from(c))),
            c if c.is_control() => out.push_str(&format!("\\u{:04x}", u32::from(c))),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> HostConfig {
        HostConfig::new(
            PathBuf::from("/srv/base"),
            PathBuf::from("/srv/user"),
            PathBuf::from("/srv/vpn"),
            PathBuf::from("/tmp"),
        )
    }

    fn vm_id() -> VmId {
        match "abcdefgh".parse() {
            Ok(id) => id,
            Err(e) => panic!("invalid test id: {e}"),
        }
    }

    fn overlay(name: &str) -> OverlayName {
        match name.parse() {
            Ok(n) => n,
            Err(e) => panic!("invalid overlay: {e}"),
        }
    }

    /// Splits an `ExecStart=` line the way systemd does for the subset of
    /// the grammar produced by [`escape_exec_arg`].
    fn split_exec_line(line: &str) -> Vec<String> {
        let mut words = Vec::new();
        let mut chars = line.chars().peekable();
        while let Some(&c) = chars.peek() {
            if c == ' ' {
                chars.next();
                continue;
            }
            let mut word = String::new();
            if c == '\'' {
                chars.next();
                while let Some(c) = chars.next() {
                    match c {
                        '\'' => break,
                        '\\' => match chars.next() {
                            Some('n') => word.push('\n'),
                            Some('t') => word.push('\t'),
                            Some('r') => word.push('\r'),
                            Some('x') => {
                                let hex: String = chars.by_ref().take(2).collect();
                                let code = u32::from_str_radix(&hex, 16).unwrap_or(0);
                                word.push(char::from_u32(code).unwrap_or('?'));
                            }
                            Some('u') => {
                                let hex: String = chars.by_ref().take(4).collect();
                                let code = u32::from_str_radix(&hex, 16).unwrap_or(0);
                                word.push(char::from_u32(code).unwrap_or('?'));
                            }
                            Some(other) => word.push(other),
                            None => {}
                        },
                        '%' | '$' => {
                            chars.next();
                            word.push(c);
                        }
                        other => word.push(other),
                    }
                }
            } else {
                while let Some(&c) = chars.peek() {
                    if c == ' ' {
                        break;
                    }
                    word.push(c);
                    chars.next();
                }
            }
            words.push(word);
        }
        words
    }

    #[test]
    fn single_public_interface_compiles_to_net0() {
        let id = vm_id();
        let config = config();
        let iface = NetworkInterface::public(PathBuf::from("/tmp/vde.ctl"));
        let def = compile(&id, &config.user_image(&id), &[iface.clone()], &config);

        let line = def.command_line();
        assert!(line.starts_with("qemu-system-x86_64 -cpu host -m 4096 -accel kvm"), "{line}");
        assert!(line.contains("-hda /srv/user/abcdefgh.qcow2"), "{line}");
        assert!(line.contains("-name qemu-vm-abcdefgh,process=vm-abcdefgh"), "{line}");
        assert!(line.contains("-qmp unix:/tmp/aether-qmp-abcdefgh.sock,server,nowait"), "{line}");
        assert!(
            line.contains("-chardev socket,path=/tmp/aether-qga-abcdefgh.sock,server,nowait,id=qga0"),
            "{line}"
        );
        assert!(
            line.contains(&format!("-device virtio-net-pci,netdev=net0,mac={}", iface.mac)),
            "{line}"
        );
        assert!(line.contains("-netdev vde,id=net0,sock=/tmp/vde.ctl"), "{line}");
        assert!(!line.contains("net1"), "only one interface expected: {line}");
        assert_eq!(def.unit_name, "aether-vm-abcdefgh.service");
    }

    #[test]
    fn private_interface_comes_first() {
        let id = vm_id();
        let config = config();
        let public = NetworkInterface::public(PathBuf::from("/tmp/vde.ctl"));
        let private = NetworkInterface::private(overlay("corp"), PathBuf::from("/tmp/vde-corp.ctl"));
        let def = compile(&id, Path::new("/srv/user/x.qcow2"), &[public, private.clone()], &config);

        assert_eq!(def.interfaces[0], private, "VPN interface must be net0");
        let line = def.command_line();
        let net0 = line.find("sock=/tmp/vde-corp.ctl");
        let net1 = line.find("sock=/tmp/vde.ctl");
        assert!(net0 < net1, "private before public: {line}");
        assert!(line.contains("-netdev vde,id=net0,sock=/tmp/vde-corp.ctl"), "{line}");
        assert!(line.contains("-netdev vde,id=net1,sock=/tmp/vde.ctl"), "{line}");
    }

    #[test]
    fn unusual_paths_are_quoted() {
        let id = vm_id();
        let config = config();
        let def = compile(&id, Path::new("/srv/my images/$HOME%i,x.qcow2"), &[], &config);
        let line = def.command_line();
        assert!(line.contains("-hda '/srv/my images/$$HOME%%i,,x.qcow2'"), "{line}");
        let words = split_exec_line(&line);
        assert!(
            words.contains(&"/srv/my images/$HOME%i,,x.qcow2".to_owned()),
            "{words:?}"
        );
    }

    #[test]
    fn escape_leaves_safe_words_bare() {
        assert_eq!(escape_exec_arg("-cpu"), "-cpu");
        assert_eq!(escape_exec_arg("virtio-net-pci,netdev=net0"), "virtio-net-pci,netdev=net0");
        assert_eq!(escape_exec_arg(""), "''");
        assert_eq!(escape_exec_arg("a b"), "'a b'");
        assert_eq!(escape_exec_arg("it's"), "'it\\'s'");
        assert_eq!(escape_exec_arg("; rm -rf /"), "'; rm -rf /'");
        assert_eq!(escape_exec_arg("\u{1}"), "'\\x01'");
    }

    #[test]
    fn special_program_prefix_is_quoted() {
        let id = vm_id();
        let mut config = config();
        config.qemu_binary = "-qemu".to_owned();
        let def = compile(&id, Path::new("/i.qcow2"), &[], &config);
        assert!(def.command_line().starts_with("'-qemu' "), "{}", def.command_line());
    }

    proptest::proptest! {
        #[test]
        fn proptest_escaped_arguments_split_back(args in proptest::collection::vec(".*", 1..6usize)) {
            let line = args.iter().map(|a| escape_exec_arg(a)).collect::<Vec<_>>().join(" ");
            proptest::prop_assert_eq!(split_exec_line(&line), args);
        }

        #[test]
        fn proptest_escaped_arguments_have_no_raw_markers(arg in ".*") {
            let escaped = escape_exec_arg(&arg);
            proptest::prop_assert!(!escaped.contains('\n'), "newline must be escaped");
            let singles = escaped.replace("%%", "").replace("$$", "");
            proptest::prop_assert!(!singles.contains('%') && !singles.contains('$'));
        }
    }
}

//! Host network provisioning for board and emulator access.
//!
//! Everything here is safe to repeat. A run that died halfway is simply
//! started again, so "already there" is always a success.

use anyhow::{bail, Context, Result};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::error::PipelineError;
use crate::process::{Cmd, Runner};
use crate::stage::Stage;

pub const DEFAULT_SUBNET_ADDRESS: Ipv4Addr = Ipv4Addr::new(192, 168, 18, 1);
pub const DEFAULT_PREFIX_LEN: u8 = 24;

/// Tap devices the emulated machine attaches to.
pub const DEFAULT_TAP_DEVICES: &[&str] = &["tap0", "tap1", "tap2"];
/// Tap device that carries the host side of the emulator subnet.
pub const DEFAULT_HOST_TAP: &str = "tap2";

/// An address with prefix to be bound to a host interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkBinding {
    pub interface: String,
    pub address: Ipv4Addr,
    pub prefix_len: u8,
}

impl NetworkBinding {
    pub fn new(interface: impl Into<String>, address: Ipv4Addr, prefix_len: u8) -> Result<Self> {
        if prefix_len > 32 {
            bail!("invalid prefix length /{} for {}", prefix_len, address);
        }
        Ok(Self {
            interface: interface.into(),
            address,
            prefix_len,
        })
    }

    /// Parse `a.b.c.d/n` and attach it to `interface`.
    pub fn parse(interface: impl Into<String>, cidr: &str) -> Result<Self> {
        let (address, prefix_len) = parse_cidr(cidr)?;
        Self::new(interface, address, prefix_len)
    }

    pub fn cidr(&self) -> String {
        format!("{}/{}", self.address, self.prefix_len)
    }

    /// Whether `addr` lies in this binding's subnet.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let mask = prefix_mask(self.prefix_len);
        u32::from(addr) & mask == u32::from(self.address) & mask
    }
}

impl fmt::Display for NetworkBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {}", self.cidr(), self.interface)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionOutcome {
    AlreadyPresent,
    Created,
}

/// Result of a best-effort provisioning pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionReport {
    pub created: Vec<String>,
    pub present: Vec<String>,
    pub warnings: Vec<String>,
}

impl ProvisionReport {
    pub fn warn(&mut self, warning: impl Into<String>) {
        let warning = warning.into();
        tracing::warn!("[{}] {}", Stage::ProvisioningNetwork, warning);
        self.warnings.push(warning);
    }
}

/// IPv4 addresses configured on the host, or on one interface, as `(address, prefix)`.
pub fn host_addresses(runner: &dyn Runner, interface: Option<&str>) -> Result<Vec<(Ipv4Addr, u8)>> {
    let mut cmd = Cmd::new("ip").args(["-o", "-4", "addr", "show"]);
    if let Some(interface) = interface {
        cmd = cmd.args(["dev", interface]);
    }
    let output = runner
        .capture(&cmd)
        .context("listing host IPv4 addresses")?;
    if !output.success() {
        bail!(
            "{} failed with exit code {}: {}",
            cmd,
            output.exit_code(),
            output.stderr.trim()
        );
    }
    Ok(parse_inet_lines(&output.stdout))
}

/// Extract every `inet a.b.c.d/n` from `ip -o -4 addr show` output.
pub fn parse_inet_lines(text: &str) -> Vec<(Ipv4Addr, u8)> {
    let mut found = Vec::new();
    for line in text.lines() {
        let mut words = line.split_whitespace();
        while let Some(word) = words.next() {
            if word != "inet" {
                continue;
            }
            if let Some(Ok(entry)) = words.next().map(parse_cidr) {
                found.push(entry);
            }
        }
    }
    found
}

/// Whether any host interface already has an address in the binding's subnet.
pub fn subnet_present(runner: &dyn Runner, binding: &NetworkBinding) -> Result<bool> {
    Ok(host_addresses(runner, None)?
        .into_iter()
        .any(|(addr, _)| binding.contains(addr)))
}

/// Bind the address unless its subnet is already reachable from this host.
pub fn ensure_address(runner: &dyn Runner, binding: &NetworkBinding) -> Result<ProvisionOutcome> {
    let present = subnet_present(runner, binding)?;
    bind_unless_present(runner, binding, present)
}

/// Bind the address unless the binding's own interface already sits in its subnet.
pub fn ensure_interface_address(
    runner: &dyn Runner,
    binding: &NetworkBinding,
) -> Result<ProvisionOutcome> {
    let present = host_addresses(runner, Some(&binding.interface))?
        .into_iter()
        .any(|(addr, _)| binding.contains(addr));
    bind_unless_present(runner, binding, present)
}

fn bind_unless_present(
    runner: &dyn Runner,
    binding: &NetworkBinding,
    present: bool,
) -> Result<ProvisionOutcome> {
    if present {
        tracing::info!(
            "[{}] subnet of {} already present",
            Stage::ProvisioningNetwork,
            binding.cidr()
        );
        return Ok(ProvisionOutcome::AlreadyPresent);
    }

    let cmd = Cmd::privileged("ip")
        .args(["addr", "add"])
        .arg(binding.cidr())
        .args(["dev", binding.interface.as_str()]);
    tracing::info!("[{}] binding {}", Stage::ProvisioningNetwork, binding);
    let output = runner
        .capture(&cmd)
        .with_context(|| format!("binding {}", binding))?;
    if !output.success() {
        return Err(PipelineError::StageFailed {
            stage: Stage::ProvisioningNetwork,
            exit_code: output.exit_code(),
            diagnostic: None,
            stderr: output.stderr,
        }
        .into());
    }
    Ok(ProvisionOutcome::Created)
}

/// Create missing tap devices. Failures are recorded, never returned.
pub fn ensure_tap_devices<S: AsRef<str>>(runner: &dyn Runner, names: &[S]) -> ProvisionReport {
    let mut report = ProvisionReport::default();
    for name in names.iter().map(AsRef::as_ref) {
        match link_exists(runner, name) {
            Ok(true) => {
                report.present.push(name.to_string());
                continue;
            }
            Ok(false) => {}
            Err(err) => {
                report.warn(format!("could not query {}: {:#}", name, err));
                continue;
            }
        }

        let cmd = Cmd::privileged("ip").args(["tuntap", "add", name, "mode", "tap"]);
        match runner.capture(&cmd) {
            Ok(out) if out.success() => report.created.push(name.to_string()),
            Ok(out) if is_already_exists(&out.stderr) => report.present.push(name.to_string()),
            Ok(out) => report.warn(format!(
                "creating tap device {} failed with exit code {}: {}",
                name,
                out.exit_code(),
                out.stderr.trim()
            )),
            Err(err) => report.warn(format!("creating tap device {}: {:#}", name, err)),
        }
    }
    report
}

/// `ip link set <iface> up`.
pub fn bring_up(runner: &dyn Runner, interface: &str) -> Result<()> {
    let cmd = Cmd::privileged("ip").args(["link", "set", interface, "up"]);
    let output = runner
        .capture(&cmd)
        .with_context(|| format!("bringing up {}", interface))?;
    if !output.success() {
        bail!(
            "bringing up {} failed with exit code {}: {}",
            interface,
            output.exit_code(),
            output.stderr.trim()
        );
    }
    Ok(())
}

fn link_exists(runner: &dyn Runner, name: &str) -> Result<bool> {
    let output = runner
        .capture(&Cmd::new("ip").args(["link", "show", "dev", name]))
        .with_context(|| format!("querying link {}", name))?;
    Ok(output.success())
}

fn is_already_exists(stderr: &str) -> bool {
    stderr.contains("File exists") || stderr.contains("Device or resource busy")
}

fn parse_cidr(text: &str) -> Result<(Ipv4Addr, u8)> {
    let (addr, prefix) = text
        .split_once('/')
        .with_context(|| format!("expected a.b.c.d/n, got '{}'", text))?;
    let addr = Ipv4Addr::from_str(addr).with_context(|| format!("invalid IPv4 address '{}'", addr))?;
    let prefix: u8 = prefix
        .parse()
        .with_context(|| format!("invalid prefix length '{}'", prefix))?;
    if prefix > 32 {
        bail!("invalid prefix length /{}", prefix);
    }
    Ok((addr, prefix))
}

fn prefix_mask(prefix_len: u8) -> u32 {
    match prefix_len {
        0 => 0,
        n => u32::MAX << (32 - u32::from(n.min(32))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::CmdOutput;
    use std::cell::RefCell;

    /// Emulates `ip` against an in-memory set of addresses and links.
    #[derive(Default)]
    struct FakeIp {
        addrs: RefCell<Vec<(String, String)>>,
        links: RefCell<Vec<String>>,
        calls: RefCell<Vec<String>>,
        fail_tuntap: bool,
    }

    impl FakeIp {
        fn adds(&self, what: &str) -> usize {
            self.calls
                .borrow()
                .iter()
                .filter(|c| c.contains(what))
                .count()
        }
    }

    impl Runner for FakeIp {
        fn capture(&self, cmd: &Cmd) -> anyhow::Result<CmdOutput> {
            let mut args = cmd.arg_strings();
            if cmd.program() == "sudo" {
                args.remove(0);
            }
            self.calls.borrow_mut().push(args.join(" "));
            let argv: Vec<&str> = args.iter().map(String::as_str).collect();
            let out = match argv.as_slice() {
                ["-o", "-4", "addr", "show", rest @ ..] => {
                    let only = match rest {
                        ["dev", name] => Some(name.to_string()),
                        _ => None,
                    };
                    let stdout = self
                        .addrs
                        .borrow()
                        .iter()
                        .filter(|(iface, _)| only.as_ref().map_or(true, |o| o == iface))
                        .map(|(iface, a)| format!("2: {iface}    inet {a} scope global {iface}\n"))
                        .collect();
                    CmdOutput {
                        code: Some(0),
                        stdout,
                        stderr: String::new(),
                    }
                }
                ["addr", "add", cidr, "dev", iface] => {
                    self.addrs
                        .borrow_mut()
                        .push((iface.to_string(), cidr.to_string()));
                    CmdOutput::with_code(0)
                }
                ["link", "show", "dev", name] => {
                    let code = if self.links.borrow().iter().any(|l| l == name) { 0 } else { 1 };
                    CmdOutput::with_code(code)
                }
                ["tuntap", "add", name, "mode", "tap"] => {
                    if self.fail_tuntap {
                        CmdOutput {
                            code: Some(1),
                            stdout: String::new(),
                            stderr: "ioctl(TUNSETIFF): Operation not permitted\n".into(),
                        }
                    } else {
                        self.links.borrow_mut().push(name.to_string());
                        CmdOutput::with_code(0)
                    }
                }
                ["link", "set", _, "up"] => CmdOutput::with_code(0),
                other => panic!("unexpected ip invocation: {:?}", other),
            };
            Ok(out)
        }

        fn stream(&self, cmd: &Cmd) -> anyhow::Result<CmdOutput> {
            self.capture(cmd)
        }
    }

    fn binding() -> NetworkBinding {
        NetworkBinding::new("enp0s31f6", DEFAULT_SUBNET_ADDRESS, DEFAULT_PREFIX_LEN).unwrap()
    }

    #[test]
    fn test_second_ensure_address_is_a_noop() {
        let ip = FakeIp::default();
        ip.addrs
            .borrow_mut()
            .push(("eth0".into(), "10.0.0.5/8".into()));

        assert_eq!(ensure_address(&ip, &binding()).unwrap(), ProvisionOutcome::Created);
        assert_eq!(ensure_address(&ip, &binding()).unwrap(), ProvisionOutcome::AlreadyPresent);
        assert_eq!(ip.adds("addr add"), 1);
    }

    #[test]
    fn test_other_address_in_subnet_counts_as_present() {
        let ip = FakeIp::default();
        ip.addrs
            .borrow_mut()
            .push(("eth0".into(), "192.168.18.77/24".into()));
        assert_eq!(ensure_address(&ip, &binding()).unwrap(), ProvisionOutcome::AlreadyPresent);
        assert_eq!(ip.adds("addr add"), 0);
    }

    #[test]
    fn test_interface_address_ignores_other_interfaces() {
        let ip = FakeIp::default();
        ip.addrs
            .borrow_mut()
            .push(("enp0s31f6".into(), "192.168.18.1/24".into()));
        let tap = NetworkBinding::new("tap2", DEFAULT_SUBNET_ADDRESS, DEFAULT_PREFIX_LEN).unwrap();

        assert_eq!(ensure_interface_address(&ip, &tap).unwrap(), ProvisionOutcome::Created);
        assert_eq!(
            ensure_interface_address(&ip, &tap).unwrap(),
            ProvisionOutcome::AlreadyPresent
        );
        assert_eq!(ip.adds("addr add"), 1);
    }

    #[test]
    fn test_parse_inet_lines() {
        let text = "\
1: lo    inet 127.0.0.1/8 scope host lo\\       valid_lft forever preferred_lft forever
2: enp0s31f6    inet 192.168.18.1/24 brd 192.168.18.255 scope global enp0s31f6\\       valid_lft forever
";
        assert_eq!(
            parse_inet_lines(text),
            vec![
                (Ipv4Addr::new(127, 0, 0, 1), 8),
                (Ipv4Addr::new(192, 168, 18, 1), 24)
            ]
        );
    }

    #[test]
    fn test_contains_masks_host_bits() {
        let b = binding();
        assert!(b.contains(Ipv4Addr::new(192, 168, 18, 6)));
        assert!(!b.contains(Ipv4Addr::new(192, 168, 19, 6)));
        let any = NetworkBinding::new("lo", Ipv4Addr::new(1, 2, 3, 4), 0).unwrap();
        assert!(any.contains(Ipv4Addr::new(8, 8, 8, 8)));
    }

    #[test]
    fn test_parse_binding() {
        let b = NetworkBinding::parse("tap2", "192.168.18.1/24").unwrap();
        assert_eq!(b, NetworkBinding::new("tap2", DEFAULT_SUBNET_ADDRESS, 24).unwrap());
        assert!(NetworkBinding::parse("tap2", "192.168.18.1").is_err());
        assert!(NetworkBinding::parse("tap2", "192.168.18.1/33").is_err());
    }

    #[test]
    fn test_tap_devices_created_once() {
        let ip = FakeIp::default();
        ip.links.borrow_mut().push("tap0".into());

        let first = ensure_tap_devices(&ip, DEFAULT_TAP_DEVICES);
        assert_eq!(first.present, vec!["tap0"]);
        assert_eq!(first.created, vec!["tap1", "tap2"]);
        assert!(first.warnings.is_empty());

        let second = ensure_tap_devices(&ip, DEFAULT_TAP_DEVICES);
        assert_eq!(second.present, vec!["tap0", "tap1", "tap2"]);
        assert!(second.created.is_empty());
    }

    #[test]
    fn test_tap_failures_are_warnings() {
        let ip = FakeIp {
            fail_tuntap: true,
            ..Default::default()
        };
        let report = ensure_tap_devices(&ip, &["tap0"]);
        assert!(report.created.is_empty());
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("Operation not permitted"));
    }
}

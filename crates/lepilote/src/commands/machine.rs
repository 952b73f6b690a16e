use crate::tools::{self, Tool};
use anyhow::Result;
use futures::future::join_all;
use leflotte::console::Status;
use leflotte::lifecycle::boot_arguments;
use leflotte::machine::LOOPBACK;
use leflotte::{Machine, RunContext, RunEnv, RunOptions};
use std::path::Path;
use tracing::{debug, warn};

/// Quote a command-line word when it holds anything beyond plain characters
fn quote_word(word: &str) -> String {
    let plain = word
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '=' | ':' | '.' | ','));
    if plain && !word.is_empty() {
        word.to_string()
    } else {
        format!("\"{word}\"")
    }
}

/// Connection details of a machine, as printed by `info`
///
/// # Arguments
///
/// * `machine` - Selected machine
/// * `binary` - Resolved hypervisor binary
/// * `options` - Operator options, for the command line
#[must_use]
pub fn info_lines(machine: &Machine, binary: &Path, options: &RunOptions) -> Vec<String> {
    let mut lines = vec![format!("  - Machine: {} ({})", machine.name, machine.key)];

    let Some(qemu) = &machine.qemu else {
        lines.push("    * Managed manually".to_string());
        return lines;
    };

    let command = std::iter::once(binary.display().to_string())
        .chain(boot_arguments(qemu, options))
        .map(|word| quote_word(&word))
        .collect::<Vec<_>>()
        .join(" ");
    let vnc = qemu
        .vnc_port
        .map_or_else(|| "none".to_string(), |port| port.to_string());

    lines.push(format!("    * Command-line: {command}"));
    lines.push(format!("    * SSH port: {}", qemu.ssh_port));
    lines.push(format!("    * VNC port: {vnc}"));
    lines.push(format!("    * Username: {}", qemu.username));
    lines.push(format!("    * Password: {}", qemu.password));
    lines
}

/// Print how to reach every selected machine
pub fn info(ctx: &mut RunContext) -> Result<bool> {
    let env = &ctx.env;
    env.backend.launcher.check()?;

    env.log.phase("Machines:");
    for machine in &ctx.fleet.machines {
        let binary = machine
            .qemu
            .as_ref()
            .map(|q| env.backend.launcher.binary_path(&q.binary))
            .unwrap_or_default();
        for line in info_lines(machine, &binary, &env.options) {
            env.log.say(line);
        }
    }

    Ok(true)
}

/// Arguments of the interactive `sshpass` session
#[must_use]
pub fn ssh_arguments(machine: &Machine) -> Option<Vec<String>> {
    let qemu = machine.qemu.as_ref()?;
    let known_hosts = if cfg!(windows) { r"\\.\NUL" } else { "/dev/null" };

    Some(vec![
        format!("-p{}", qemu.password),
        "ssh".to_string(),
        "-o".to_string(),
        "StrictHostKeyChecking=no".to_string(),
        "-o".to_string(),
        format!("UserKnownHostsFile={known_hosts}"),
        "-p".to_string(),
        qemu.ssh_port.to_string(),
        format!("{}@{LOOPBACK}", qemu.username),
    ])
}

/// Open an interactive session with the only selected machine
pub fn ssh(ctx: &mut RunContext) -> Result<bool> {
    let log = ctx.log();

    let [machine] = ctx.fleet.machines.as_slice() else {
        log.warn("The ssh command can only be used with one machine");
        return Ok(false);
    };
    let Some(args) = ssh_arguments(machine) else {
        log.warn(format!("Machine {} is managed manually", machine.name));
        return Ok(false);
    };

    let status = Tool::Sshpass.command().args(&args).status();
    match status {
        Ok(status) if status.success() => Ok(true),
        _ => {
            tools::require(Tool::Sshpass)?;
            log.warn("Connection failed");
            Ok(false)
        }
    }
}

async fn reset_machine(env: &RunEnv, machine: &Machine, binary: &Path) -> Option<bool> {
    let qemu = machine.qemu.as_ref()?;
    let dir = env.config.paths.machine_dir(&machine.key);
    if !dir.is_dir() {
        env.log.line(&machine.name, "Missing files", Status::Ignore);
        return None;
    }

    let args = vec![
        "snapshot".to_string(),
        dir.join(&qemu.disk).to_string_lossy().into_owned(),
        "-a".to_string(),
        "base".to_string(),
    ];
    let result = env.backend.launcher.run_tool(binary, &args, &dir).await;

    match result {
        Ok(output) => {
            let ok = output.success();
            env.log.line(&machine.name, "Reset disk", Status::from_success(ok));
            if !ok {
                debug!(machine = %machine.key, code = output.code, "Snapshot restore failed");
                env.log.output("", &output.stderr);
            }
            Some(ok)
        }
        Err(err) => {
            warn!(machine = %machine.key, error = %err, "Could not run qemu-img");
            env.log.line(&machine.name, "Reset disk", Status::Error);
            Some(false)
        }
    }
}

/// Restore the base snapshot of every selected machine disk
///
/// # Returns
///
/// `Ok(true)` when every attempted restore succeeded
pub async fn reset(ctx: &mut RunContext) -> Result<bool> {
    let env = &ctx.env;
    env.backend.launcher.check()?;
    let binary = env.backend.launcher.binary_path("qemu-img");
    env.log.phase("Restoring snapshots...");

    let outcomes = join_all(
        ctx.fleet
            .machines
            .iter()
            .map(|machine| reset_machine(env, machine, &binary)),
    )
    .await;

    let attempted: Vec<bool> = outcomes.into_iter().flatten().collect();
    debug!(attempted = attempted.len(), "Reset finished");
    Ok(attempted.into_iter().all(|ok| ok))
}

#[cfg(test)]
mod tests {
    use super::*;
    use leflotte::machine::MachineSpec;

    fn machine(json: &str) -> Machine {
        let spec: MachineSpec = serde_json::from_str(json).unwrap();
        Machine::from_spec("debian_x64", spec)
    }

    const MANAGED: &str = r#"{
        "name": "Debian x64",
        "platform": "linux",
        "qemu": {
            "binary": "qemu-system-x86_64",
            "arguments": ["-m", "2G", "-drive", "file=disk.qcow2,if=virtio", "-display", "vnc=127.0.0.1:10"],
            "disk": "disk.qcow2",
            "version": 2,
            "ssh_port": 22201,
            "vnc_port": 5910,
            "username": "debian",
            "password": "debian",
            "shutdown": "sudo poweroff"
        }
    }"#;

    #[test]
    fn test_quote_word() {
        assert_eq!(quote_word("-m"), "-m");
        assert_eq!(quote_word("file=disk.qcow2,if=virtio"), "file=disk.qcow2,if=virtio");
        assert_eq!(quote_word("/usr/bin/qemu"), "\"/usr/bin/qemu\"");
        assert_eq!(quote_word("a b"), "\"a b\"");
        assert_eq!(quote_word(""), "\"\"");
    }

    #[test]
    fn test_info_lines() {
        let lines = info_lines(&machine(MANAGED), Path::new("qemu-system-x86_64"), &RunOptions::default());

        assert_eq!(
            lines,
            vec![
                "  - Machine: Debian x64 (debian_x64)",
                "    * Command-line: qemu-system-x86_64 -m 2G -drive file=disk.qcow2,if=virtio -display vnc=127.0.0.1:10",
                "    * SSH port: 22201",
                "    * VNC port: 5910",
                "    * Username: debian",
                "    * Password: debian",
            ]
        );
    }

    #[test]
    fn test_info_manual_machine() {
        let lines = info_lines(&machine(r#"{ "platform": "darwin" }"#), Path::new(""), &RunOptions::default());
        assert_eq!(lines, vec!["  - Machine: debian_x64 (debian_x64)", "    * Managed manually"]);
    }

    #[test]
    fn test_ssh_arguments() {
        let args = ssh_arguments(&machine(MANAGED)).unwrap();
        assert_eq!(args[0], "-pdebian");
        assert_eq!(args[1], "ssh");
        assert_eq!(&args[6..], ["-p", "22201", "debian@127.0.0.1"]);

        assert!(ssh_arguments(&machine(r#"{ "platform": "darwin" }"#)).is_none());
    }
}

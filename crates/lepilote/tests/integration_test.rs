// Integration Tests for LePilote
//
// These tests cover end-to-end workflows including:
// - CLI parsing
// - Test runs against scripted machines
// - Package preparation
// - Single-machine commands

use leflotte::config::TimingConfig;
use leflotte::console::StatusLog;
use leflotte::remote::RemoteSession;
use leflotte::testing::{RecordingLauncher, ScriptedConnector, ScriptedSession};
use leflotte::{select_machines, Backend, FleetConfig, HostOs, Registry, RunContext, RunOptions};
use lepilote::{dispatch, Commands};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

const REGISTRY: &str = r#"{
    "m1": {
        "name": "Machine 1",
        "platform": "linux",
        "qemu": {
            "binary": "qemu-system-x86_64",
            "arguments": ["-m", "1G"],
            "disk": "disk.qcow2",
            "version": 0,
            "ssh_port": 22201,
            "vnc_port": 5901,
            "username": "qemu",
            "password": "secret1",
            "shutdown": "sudo poweroff"
        },
        "builds": { "Linux x64": { "directory": "/home/qemu/build", "build": "make release", "arch": "x64" } },
        "tests": {
            "Node": {
                "directory": "/home/qemu/koffi",
                "build": "make",
                "commands": { "Sync": "node test/sync.js", "Async": "node test/async.js" }
            }
        }
    },
    "m2": {
        "name": "Machine 2",
        "platform": "linux",
        "qemu": {
            "binary": "qemu-system-aarch64",
            "arguments": ["-m", "2G"],
            "disk": "disk.qcow2",
            "version": 0,
            "ssh_port": 22202,
            "username": "qemu",
            "password": "secret2",
            "shutdown": "sudo poweroff"
        },
        "builds": { "Linux ARM64": { "directory": "/home/qemu/build", "build": "make release", "arch": "arm64" } },
        "tests": {
            "Node": {
                "directory": "/home/qemu/koffi",
                "build": "make",
                "commands": { "Sync": "node test/sync.js", "Async": "node test/async.js" }
            }
        }
    }
}"#;

const MANUAL_REGISTRY: &str = r#"{
    "mac": {
        "name": "Mac",
        "platform": "darwin",
        "tests": {
            "Node": {
                "directory": "/Users/qemu/koffi",
                "build": "make",
                "commands": { "Sync": "node test/sync.js" }
            }
        }
    }
}"#;

const MANIFEST: &str = r#"{ "name": "koffi", "version": "2.8.0", "main": "index.js" }"#;

struct Fixture {
    ctx: RunContext,
    connector: Arc<ScriptedConnector>,
    launcher: Arc<RecordingLauncher>,
    work: TempDir,
}

impl Fixture {
    fn captured(&self) -> Vec<String> {
        self.ctx.log().captured()
    }

    fn component_dir(&self) -> PathBuf {
        self.ctx.env.config.paths.component_dir()
    }
}

fn write(path: &Path, text: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, text).unwrap();
}

fn fixture(
    patterns: &[&str],
    connector: ScriptedConnector,
    launcher: RecordingLauncher,
) -> leflotte::Result<Fixture> {
    fixture_from(REGISTRY, patterns, connector, launcher)
}

fn fixture_from(
    registry: &str,
    patterns: &[&str],
    connector: ScriptedConnector,
    launcher: RecordingLauncher,
) -> leflotte::Result<Fixture> {
    let registry = Registry::parse(registry, HostOs::Linux, false).unwrap();
    let machines = select_machines(registry, patterns)?;

    let work = tempfile::tempdir().unwrap();
    let root = work.path().join("root");
    write(&root.join("src/koffi/package.json"), MANIFEST);
    write(&root.join("src/koffi/index.js"), "module.exports = {}");

    let mut config = FleetConfig::default();
    config.timings = TimingConfig::instant();
    config.paths.root = root;
    config.paths.build = work.path().join("build");
    config.paths.machines = work.path().join("qemu");
    config.snapshot.include = vec!["src/koffi".to_string()];
    config.snapshot.exclude = Vec::new();
    for key in ["m1", "m2"] {
        fs::create_dir_all(config.paths.machine_dir(key)).unwrap();
    }

    let connector = Arc::new(connector);
    let launcher = Arc::new(launcher);
    let backend = Backend {
        connector: connector.clone(),
        launcher: launcher.clone(),
    };
    let log = StatusLog::capturing(machines.iter().map(|m| m.name.clone()));

    Ok(Fixture {
        ctx: RunContext::with_log(machines, config, RunOptions::default(), backend, log),
        connector,
        launcher,
        work,
    })
}

fn command(args: &[&str]) -> Commands {
    use clap::Parser;
    lepilote::Cli::parse_from(args).command.unwrap_or_default()
}

// ============================================================================
// CLI PARSING TESTS
// ============================================================================

mod cli_parsing_tests {
    use super::*;
    use clap::error::ErrorKind;
    use clap::Parser;
    use lepilote::{BootArgs, Cli};

    #[test]
    fn test_error_report() {
        use anyhow::Context;
        use leflotte::FleetError;

        let fatal = Err::<(), _>(FleetError::UnmatchedPattern("freebsd*".into()))
            .context("Failed to select machines")
            .unwrap_err();
        assert_eq!(lepilote::error_report(&fatal), "Error: Pattern 'freebsd*' does not match any machine");

        let other = Err::<(), _>(FleetError::Timeout(std::time::Duration::from_secs(60)))
            .context("Failed to stop m1")
            .unwrap_err();
        assert_eq!(lepilote::error_report(&other), "Error: Failed to stop m1: Timed out after 60s");
    }

    #[test]
    fn test_default_command_is_test() {
        let cli = Cli::parse_from(["qemu"]);
        assert!(cli.command.is_none());
        assert!(matches!(cli.command.unwrap_or_default(), Commands::Test { .. }));
    }

    #[test]
    fn test_boot_options() {
        let cli = Cli::parse_from(["qemu", "-v", "test", "-k", "fr", "--no_accel", "debian_*", "Windows*"]);
        assert!(cli.verbose);

        let command = cli.command.unwrap();
        assert_eq!(command.patterns(), ["debian_*", "Windows*"]);
        let options = command.run_options();
        assert_eq!(options.keyboard_layout.as_deref(), Some("fr"));
        assert!(!options.accelerate);

        match command {
            Commands::Test { boot, .. } => assert_eq!(
                boot,
                BootArgs {
                    keyboard: Some("fr".to_string()),
                    no_accel: true
                }
            ),
            other => panic!("Expected Test command, got {other:?}"),
        }
    }

    #[test]
    fn test_tool_dir_is_global() {
        let cli = Cli::parse_from(["qemu", "info", "--dir", "/opt/tools", "m1"]);
        assert_eq!(cli.tool_dir.as_deref(), Some(Path::new("/opt/tools")));
        assert_eq!(cli.command.unwrap().patterns(), ["m1"]);
    }

    #[test]
    fn test_keyboard_only_on_boot_commands() {
        let err = Cli::try_parse_from(["qemu", "stop", "-k", "fr"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownArgument);
        assert!(err.use_stderr());
    }

    #[test]
    fn test_invalid_patterns_are_usage_errors() {
        for pattern in ["a/b", "__proto__", "..", "a\\b"] {
            let err = Cli::try_parse_from(["qemu", "start", pattern]).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::ValueValidation, "{pattern}");
        }
    }

    #[test]
    fn test_missing_keyboard_value() {
        let err = Cli::try_parse_from(["qemu", "test", "-k"]).unwrap_err();
        assert!(err.use_stderr());
    }

    #[test]
    fn test_help_is_not_an_error() {
        let err = Cli::try_parse_from(["qemu", "--help"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DisplayHelp);
        assert!(!err.use_stderr());
    }
}

// ============================================================================
// TEST RUN TESTS
// ============================================================================

mod test_run_tests {
    use super::*;

    #[tokio::test]
    async fn test_failed_build_skips_suite_and_ignores_machine() {
        let m1 = Arc::new(ScriptedSession::new().with_failure("make", 2, "error: missing header"));
        let m2 = Arc::new(ScriptedSession::new());
        let mut f = fixture(
            &[],
            ScriptedConnector::new()
                .with_session(22201, m1.clone())
                .with_session(22202, m2.clone()),
            RecordingLauncher::new(),
        )
        .unwrap();

        let success = dispatch(&mut f.ctx, &command(&["qemu", "test"])).await.unwrap();

        assert!(!success);
        assert!(f.ctx.fleet.is_ignored("m1"));
        assert!(!f.ctx.fleet.is_ignored("m2"));

        assert_eq!(m1.count("make"), 1);
        assert_eq!(m1.count("node test"), 0);
        assert_eq!(m2.count("node test/sync.js"), 1);
        assert_eq!(m2.count("node test/async.js"), 1);

        let cwd = Some("/home/qemu/koffi/src/koffi".to_string());
        assert!(m2.execs().contains(&("node test/sync.js".to_string(), cwd)));
        assert_eq!(m2.uploads(), vec!["/home/qemu/koffi".to_string()]);

        assert_eq!(m1.shutdowns().len(), 1);
        assert_eq!(m2.shutdowns().len(), 1);
        assert_eq!(f.launcher.launches().len(), 2);

        let captured = f.captured();
        assert_eq!(captured[0], "Machines: Machine 1, Machine 2");
        assert!(captured
            .iter()
            .any(|l| l.contains("[Machine 1]") && l.contains("Node > Build") && l.ends_with("[error]")));
        assert!(captured.iter().any(|l| l.contains("error: missing header")));
        assert!(captured
            .iter()
            .any(|l| l.contains("[Machine 2]") && l.contains("Node > Async") && l.ends_with("s]")));
        assert_eq!(captured.last().unwrap(), ">> Status: FAILED");
    }

    #[tokio::test]
    async fn test_successful_run() {
        let m1 = Arc::new(ScriptedSession::new());
        let mut f = fixture(
            &["m1"],
            ScriptedConnector::new().with_session(22201, m1.clone()),
            RecordingLauncher::new(),
        )
        .unwrap();

        assert!(dispatch(&mut f.ctx, &command(&["qemu", "test", "m1"])).await.unwrap());
        assert_eq!(m1.count("node test"), 2);
        assert_eq!(f.connector.attempts(22202), 0);
        assert_eq!(f.captured().last().unwrap(), ">> Status: SUCCESS");
    }

    #[tokio::test]
    async fn test_manual_machine_with_live_session_is_tested() {
        let mac = Arc::new(ScriptedSession::new());
        let mut f = fixture_from(
            MANUAL_REGISTRY,
            &[],
            ScriptedConnector::new(),
            RecordingLauncher::new(),
        )
        .unwrap();
        f.ctx.fleet.machines[0].session = Some(mac.clone() as Arc<dyn RemoteSession>);

        assert!(dispatch(&mut f.ctx, &command(&["qemu", "test"])).await.unwrap());
        assert!(!f.ctx.fleet.is_ignored("mac"));

        assert_eq!(mac.count("rm -rf \"/Users/qemu/koffi\""), 1);
        assert_eq!(mac.uploads(), vec!["/Users/qemu/koffi".to_string()]);

        let cwd = Some("/Users/qemu/koffi/src/koffi".to_string());
        let execs = mac.execs();
        assert!(execs.contains(&("make".to_string(), cwd.clone())));
        assert!(execs.contains(&("node test/sync.js".to_string(), cwd)));

        assert!(mac.shutdowns().is_empty());
        assert!(f.launcher.launches().is_empty());

        let captured = f.captured();
        assert!(captured
            .iter()
            .any(|l| l.contains("[Mac]") && l.contains("Manual") && l.ends_with("[ok]")));
        assert_eq!(captured.last().unwrap(), ">> Status: SUCCESS");
    }

    #[tokio::test]
    async fn test_debug_run_uses_debug_build() {
        let m1 = Arc::new(ScriptedSession::new());
        let mut f = fixture(
            &["m1"],
            ScriptedConnector::new().with_session(22201, m1.clone()),
            RecordingLauncher::new(),
        )
        .unwrap();

        assert!(dispatch(&mut f.ctx, &command(&["qemu", "debug", "m1"])).await.unwrap());
        assert_eq!(m1.count("make --debug"), 1);
    }

    #[tokio::test]
    async fn test_unreachable_machine_is_skipped() {
        let m2 = Arc::new(ScriptedSession::new());
        let mut f = fixture(
            &[],
            ScriptedConnector::new().with_session(22202, m2.clone()),
            RecordingLauncher::new(),
        )
        .unwrap();

        let success = dispatch(&mut f.ctx, &command(&["qemu", "test"])).await.unwrap();

        assert!(!success);
        assert!(f.ctx.fleet.is_ignored("m1"));
        assert_eq!(m2.count("node test"), 2);
    }
}

// ============================================================================
// PREPARE TESTS
// ============================================================================

mod prepare_tests {
    use super::*;

    fn write_artifact(f: &Fixture, arch: &str) {
        let dir = f
            .component_dir()
            .join(format!("build/qemu/2.8.0/koffi_linux_{arch}"));
        write(&dir.join("koffi.node"), "binary");
    }

    #[tokio::test]
    async fn test_all_binaries_present_boots_nothing() {
        let mut f = fixture(&[], ScriptedConnector::new(), RecordingLauncher::new()).unwrap();
        write_artifact(&f, "x64");
        write_artifact(&f, "arm64");

        let dist = lepilote::commands::prepare::prepare(&mut f.ctx)
            .await
            .unwrap()
            .unwrap();

        assert!(f.launcher.launches().is_empty());
        assert_eq!(f.connector.total_attempts(), 0);
        assert!(dist.join("src/koffi/build/qemu/2.8.0/koffi_linux_x64/koffi.node").exists());
        assert!(dist.join("src/koffi/build/qemu/2.8.0/koffi_linux_arm64/koffi.node").exists());
        assert!(dist.join("package.json").exists());
        assert!(!dist.join("src/koffi/package.json").exists());

        let captured = f.captured();
        assert!(captured.contains(&">> Version: 2.8.0".to_string()));
        assert!(captured
            .iter()
            .any(|l| l.contains("Linux x64 > Status") && l.ends_with("[ok]")));
    }

    #[tokio::test]
    async fn test_missing_binaries_are_built_and_fetched() {
        let m2 = Arc::new(ScriptedSession::new().with_remote_files(&["koffi.node", "v20.1.0.tmp"]));
        let mut f = fixture(
            &[],
            ScriptedConnector::new().with_session(22202, m2.clone()),
            RecordingLauncher::new(),
        )
        .unwrap();
        write_artifact(&f, "x64");

        let dist = lepilote::commands::prepare::prepare(&mut f.ctx)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(f.launcher.launches().len(), 1);
        assert_eq!(f.connector.attempts(22201), 0);
        assert_eq!(m2.uploads(), vec!["/home/qemu/build".to_string()]);
        assert_eq!(m2.count("make release"), 1);
        assert_eq!(m2.fetches(), vec!["/home/qemu/build/src/koffi/build".to_string()]);
        assert_eq!(m2.shutdowns().len(), 1);

        let local = f.component_dir().join("build/qemu/2.8.0/koffi_linux_arm64");
        assert!(local.join("koffi.node").exists());
        assert!(!local.join("v20.1.0.tmp").exists());
        assert!(dist.join("src/koffi/build/qemu/2.8.0/koffi_linux_arm64/koffi.node").exists());

        let captured = f.captured();
        assert!(captured
            .iter()
            .any(|l| l.contains("[Machine 2]") && l.contains("Linux ARM64 > Status") && l.ends_with("[missing]")));
        assert!(captured.iter().any(|l| l.contains("[Machine 2]") && l.contains("Pack") && l.ends_with("[ok]")));
    }

    #[tokio::test]
    async fn test_failed_build_aborts_packaging() {
        let m2 = Arc::new(ScriptedSession::new().with_exit("make release", 1));
        let mut f = fixture(
            &["m2"],
            ScriptedConnector::new().with_session(22202, m2.clone()),
            RecordingLauncher::new(),
        )
        .unwrap();

        let dist = lepilote::commands::prepare::prepare(&mut f.ctx).await.unwrap();

        assert!(dist.is_none());
        assert!(m2.fetches().is_empty());
        assert!(!f.work.path().join("build/dist").exists());
        assert_eq!(f.captured().last().unwrap(), ">> Status: FAILED");
    }
}

// ============================================================================
// MACHINE COMMAND TESTS
// ============================================================================

mod machine_command_tests {
    use super::*;
    use leflotte::FleetError;

    #[tokio::test]
    async fn test_ssh_requires_exactly_one_machine() {
        let mut f = fixture(&[], ScriptedConnector::new(), RecordingLauncher::new()).unwrap();

        let success = dispatch(&mut f.ctx, &command(&["qemu", "ssh"])).await.unwrap();

        assert!(!success);
        assert_eq!(f.connector.total_attempts(), 0);
        assert!(f
            .captured()
            .contains(&"The ssh command can only be used with one machine".to_string()));
    }

    #[tokio::test]
    async fn test_info_prints_selected_machines_only() {
        let mut f = fixture(&["m1"], ScriptedConnector::new(), RecordingLauncher::new()).unwrap();

        assert!(dispatch(&mut f.ctx, &command(&["qemu", "info", "m1"])).await.unwrap());

        let captured = f.captured();
        assert!(captured.contains(&"  - Machine: Machine 1 (m1)".to_string()));
        assert!(captured.contains(&"    * SSH port: 22201".to_string()));
        assert!(captured.contains(&"    * Password: secret1".to_string()));
        assert!(!captured.iter().any(|l| l.contains("(m2)")));
        assert_eq!(f.connector.total_attempts(), 0);
    }

    #[tokio::test]
    async fn test_info_requires_qemu() {
        let mut f = fixture(&["m1"], ScriptedConnector::new(), RecordingLauncher::new().without_qemu()).unwrap();
        assert!(dispatch(&mut f.ctx, &command(&["qemu", "info"])).await.is_err());
    }

    #[test]
    fn test_unmatched_pattern_selects_nothing() {
        let result = fixture(&["windows*"], ScriptedConnector::new(), RecordingLauncher::new());
        assert!(matches!(result, Err(FleetError::UnmatchedPattern(p)) if p == "windows*"));
    }

    #[tokio::test]
    async fn test_start_detaches_and_stop_all() {
        let m1 = Arc::new(ScriptedSession::new());
        let mut f = fixture(
            &["m1"],
            ScriptedConnector::new().with_session(22201, m1.clone()),
            RecordingLauncher::new(),
        )
        .unwrap();

        assert!(dispatch(&mut f.ctx, &command(&["qemu", "start", "m1"])).await.unwrap());
        let launches = f.launcher.launches();
        assert_eq!(launches.len(), 1);
        assert!(launches[0].detach);
        assert!(m1.shutdowns().is_empty());

        assert!(dispatch(&mut f.ctx, &command(&["qemu", "stop", "m1"])).await.unwrap());
        assert_eq!(m1.shutdowns(), vec!["sudo poweroff".to_string()]);
    }

    #[tokio::test]
    async fn test_reset_restores_base_snapshot() {
        let mut f = fixture(&[], ScriptedConnector::new(), RecordingLauncher::new()).unwrap();

        assert!(dispatch(&mut f.ctx, &command(&["qemu", "reset"])).await.unwrap());

        let runs = f.launcher.tool_runs();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].0, PathBuf::from("qemu-img"));
        assert_eq!(runs[0].1[0], "snapshot");
        assert!(runs[0].1[1].ends_with("disk.qcow2"));
        assert_eq!(&runs[0].1[2..], ["-a", "base"]);
    }

    #[tokio::test]
    async fn test_failed_reset_reports_stderr() {
        let mut f = fixture(
            &["m1"],
            ScriptedConnector::new(),
            RecordingLauncher::new().with_tool_failure(1, "Could not open disk.qcow2"),
        )
        .unwrap();

        assert!(!dispatch(&mut f.ctx, &command(&["qemu", "reset"])).await.unwrap());

        let captured = f.captured();
        assert!(captured
            .iter()
            .any(|l| l.contains("Reset disk") && l.ends_with("[error]")));
        assert!(captured.iter().any(|l| l.contains("Could not open disk.qcow2")));
    }
}

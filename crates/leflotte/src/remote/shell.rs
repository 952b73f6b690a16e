use crate::machine::Machine;

/// How a working directory reaches a remote command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteShell {
    /// The session handles the working directory itself
    NativeCwd,
    /// The command line is prefixed with `cd "<cwd>" &&`, for Windows `cmd.exe`
    PrefixedCd,
}

impl RemoteShell {
    /// Shell flavour of a target machine
    #[must_use]
    pub fn for_machine(machine: &Machine) -> Self {
        if machine.is_windows() {
            Self::PrefixedCd
        } else {
            Self::NativeCwd
        }
    }

    /// Final command line and the working directory left for the session
    #[must_use]
    pub fn compose(&self, command: &str, cwd: Option<&str>) -> (String, Option<String>) {
        match (self, cwd) {
            (Self::PrefixedCd, Some(cwd)) => {
                let cwd = cwd.replace('/', "\\");
                (format!("cd \"{cwd}\" && {command}"), None)
            }
            (Self::PrefixedCd, None) => (command.to_string(), None),
            (Self::NativeCwd, cwd) => (command.to_string(), cwd.map(str::to_string)),
        }
    }
}

/// Quote a string for a POSIX shell
pub(crate) fn posix_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::MachineSpec;

    fn machine(platform: &str) -> Machine {
        let spec: MachineSpec =
            serde_json::from_str(&format!(r#"{{ "platform": "{platform}" }}"#)).unwrap();
        Machine::from_spec("m", spec)
    }

    #[test]
    fn test_windows_prefixes_cd() {
        let shell = RemoteShell::for_machine(&machine("win32"));
        let (line, cwd) = shell.compose("node build.js", Some("C:/Users/qemu/koffi/src/koffi"));

        assert_eq!(line, r#"cd "C:\Users\qemu\koffi\src\koffi" && node build.js"#);
        assert_eq!(cwd, None);
    }

    #[test]
    fn test_posix_keeps_cwd() {
        let shell = RemoteShell::for_machine(&machine("linux"));
        let (line, cwd) = shell.compose("node build.js", Some("/home/debian/koffi"));

        assert_eq!(shell, RemoteShell::NativeCwd);
        assert_eq!(line, "node build.js");
        assert_eq!(cwd.as_deref(), Some("/home/debian/koffi"));
    }

    #[test]
    fn test_without_cwd() {
        let (line, cwd) = RemoteShell::PrefixedCd.compose("shutdown /s /t 0", None);
        assert_eq!(line, "shutdown /s /t 0");
        assert_eq!(cwd, None);
    }

    #[test]
    fn test_posix_quote() {
        assert_eq!(posix_quote("/home/a b"), "'/home/a b'");
        assert_eq!(posix_quote("it's"), r"'it'\''s'");
    }
}

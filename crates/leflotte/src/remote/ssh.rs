//! libssh2-backed sessions
//!
//! `ssh2` is blocking, so every session call runs on the blocking thread pool. One session
//! serves all the work of a machine; transfers open one SFTP channel per worker.

use super::session::{CommandOutput, Connector, EntryFilter, RemoteSession, SshTarget};
use super::shell::posix_quote;
use crate::error::{FleetError, Result};
use async_trait::async_trait;
use futures::future::try_join_all;
use ssh2::{KeyboardInteractivePrompt, Prompt, Session, Sftp};
use std::io::Read;
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;
use walkdir::WalkDir;

/// Time allowed for the SSH handshake and authentication, in milliseconds
const HANDSHAKE_TIMEOUT_MS: u32 = 30_000;

/// Interval between liveness probes while waiting for a shutdown
const SHUTDOWN_POLL: Duration = Duration::from_millis(500);

/// Blocking call limit for libssh2, where zero would mean no limit
fn timeout_ms(timeout: Duration) -> u32 {
    u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX).max(1)
}

async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| FleetError::Ssh(format!("SSH worker failed: {e}")))?
}

/// Answers every keyboard-interactive prompt with the password
struct PasswordPrompt<'a> {
    password: &'a str,
}

impl KeyboardInteractivePrompt for PasswordPrompt<'_> {
    fn prompt<'b>(
        &mut self,
        _username: &str,
        _instructions: &str,
        prompts: &[Prompt<'b>],
    ) -> Vec<String> {
        prompts.iter().map(|_| self.password.to_string()).collect()
    }
}

fn open_session(target: &SshTarget) -> Result<Session> {
    let tcp = TcpStream::connect((target.host.as_str(), target.port))
        .map_err(|e| FleetError::io(format!("Failed to reach {target}"), e))?;

    let mut session = Session::new()?;
    session.set_tcp_stream(tcp);
    session.set_timeout(HANDSHAKE_TIMEOUT_MS);
    session.handshake()?;

    if session
        .userauth_password(&target.username, &target.password)
        .is_err()
    {
        let mut prompt = PasswordPrompt {
            password: &target.password,
        };
        session.userauth_keyboard_interactive(&target.username, &mut prompt)?;
    }

    if !session.authenticated() {
        return Err(FleetError::Ssh(format!("Authentication rejected for {target}")));
    }

    session.set_timeout(0);
    Ok(session)
}

/// Join a relative local path onto a remote directory
fn remote_join(base: &str, relative: &Path) -> String {
    let mut path = base.trim_end_matches('/').to_string();
    for component in relative.components() {
        path.push('/');
        path.push_str(&component.as_os_str().to_string_lossy());
    }
    path
}

fn ensure_remote_dir(sftp: &Sftp, path: &str) -> Result<()> {
    let mut current = String::new();
    for part in path.split('/') {
        if part.is_empty() {
            if current.is_empty() {
                current.push('/');
            }
            continue;
        }
        if !current.is_empty() && !current.ends_with('/') {
            current.push('/');
        }
        current.push_str(part);

        let dir = Path::new(&current);
        if sftp.stat(dir).is_err() {
            sftp.mkdir(dir, 0o755)?;
        }
    }
    Ok(())
}

/// Deal work items round-robin over at most `workers` buckets
fn buckets<T>(items: Vec<T>, workers: usize) -> Vec<Vec<T>> {
    let workers = workers.max(1).min(items.len().max(1));
    let mut buckets: Vec<Vec<T>> = (0..workers).map(|_| Vec::new()).collect();
    for (i, item) in items.into_iter().enumerate() {
        buckets[i % workers].push(item);
    }
    buckets
}

/// Connects with `ssh2`
#[derive(Debug, Default, Clone, Copy)]
pub struct Ssh2Connector;

#[async_trait]
impl Connector for Ssh2Connector {
    async fn connect(&self, target: &SshTarget) -> Result<Arc<dyn RemoteSession>> {
        let owned = target.clone();
        let session = blocking(move || open_session(&owned)).await?;
        debug!(peer = %target, "SSH session open");

        Ok(Arc::new(Ssh2Session {
            session: Arc::new(session),
            target: target.clone(),
        }))
    }
}

/// Authenticated `ssh2` session
pub struct Ssh2Session {
    session: Arc<Session>,
    target: SshTarget,
}

impl Ssh2Session {
    async fn copy_files(&self, files: Vec<(PathBuf, PathBuf)>, upload: bool, concurrency: usize) -> Result<()> {
        let workers = buckets(files, concurrency).into_iter().map(|bucket| {
            let session = Arc::clone(&self.session);
            blocking(move || {
                let sftp = session.sftp()?;
                for (local, remote) in bucket {
                    let copied = if upload {
                        let mut source = std::fs::File::open(&local)
                            .map_err(|e| FleetError::io(format!("Failed to open {local:?}"), e))?;
                        let mut dest = sftp.create(&remote)?;
                        std::io::copy(&mut source, &mut dest)
                    } else {
                        let mut source = sftp.open(&remote)?;
                        let mut dest = std::fs::File::create(&local)
                            .map_err(|e| FleetError::io(format!("Failed to create {local:?}"), e))?;
                        std::io::copy(&mut source, &mut dest)
                    };
                    copied.map_err(|e| FleetError::io(format!("Failed to transfer {remote:?}"), e))?;
                }
                Ok(())
            })
        });

        try_join_all(workers).await?;
        Ok(())
    }
}

#[async_trait]
impl RemoteSession for Ssh2Session {
    async fn exec(&self, command: &str, cwd: Option<&str>) -> Result<CommandOutput> {
        let line = match cwd {
            Some(cwd) => format!("cd {} && {command}", posix_quote(cwd)),
            None => command.to_string(),
        };
        debug!(peer = %self.target, command = %line, "Remote exec");

        let session = Arc::clone(&self.session);
        blocking(move || {
            let mut channel = session.channel_session()?;
            channel.exec(&line)?;

            let mut stdout = Vec::new();
            channel
                .read_to_end(&mut stdout)
                .map_err(|e| FleetError::io("Failed to read remote output", e))?;
            let mut stderr = Vec::new();
            channel
                .stderr()
                .read_to_end(&mut stderr)
                .map_err(|e| FleetError::io("Failed to read remote errors", e))?;

            channel.wait_close()?;
            Ok(CommandOutput {
                code: channel.exit_status()?,
                stdout: String::from_utf8_lossy(&stdout).into_owned(),
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
            })
        })
        .await
    }

    async fn put_directory(&self, local: &Path, remote: &str, concurrency: usize) -> Result<()> {
        let mut dirs = Vec::new();
        let mut files = Vec::new();
        for entry in WalkDir::new(local).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|e| FleetError::io(format!("Failed to walk {local:?}"), e.into()))?;
            let Ok(relative) = entry.path().strip_prefix(local) else {
                continue;
            };
            let target = remote_join(remote, relative);

            if entry.file_type().is_dir() {
                dirs.push(target);
            } else if entry.file_type().is_file() {
                files.push((entry.path().to_path_buf(), PathBuf::from(target)));
            }
        }
        debug!(peer = %self.target, remote, dirs = dirs.len(), files = files.len(), "Uploading directory");

        let session = Arc::clone(&self.session);
        let root = remote.to_string();
        blocking(move || {
            let sftp = session.sftp()?;
            ensure_remote_dir(&sftp, &root)?;
            for dir in dirs {
                sftp.mkdir(Path::new(&dir), 0o755)?;
            }
            Ok(())
        })
        .await?;

        self.copy_files(files, true, concurrency).await
    }

    async fn get_directory(
        &self,
        local: &Path,
        remote: &str,
        filter: EntryFilter,
        concurrency: usize,
    ) -> Result<()> {
        let session = Arc::clone(&self.session);
        let dir = PathBuf::from(remote);
        let entries = blocking(move || {
            let sftp = session.sftp()?;
            Ok(sftp.readdir(&dir)?)
        })
        .await?;

        let files: Vec<_> = entries
            .into_iter()
            .filter(|(_, stat)| stat.is_file())
            .filter_map(|(path, _)| {
                let name = path.file_name()?.to_string_lossy().into_owned();
                filter(&name).then(|| (local.join(&name), path))
            })
            .collect();
        debug!(peer = %self.target, remote, files = files.len(), "Downloading directory");

        self.copy_files(files, false, concurrency).await
    }

    async fn shutdown(&self, command: &str, timeout: Duration) -> Result<()> {
        debug!(peer = %self.target, command, "Sending shutdown command");

        let session = Arc::clone(&self.session);
        let command = command.to_string();
        let deadline = Instant::now() + timeout;
        let work = blocking(move || {
            session.set_timeout(timeout_ms(timeout));
            let mut channel = session.channel_session()?;
            channel.exec(&command)?;

            session.set_keepalive(false, 1);
            while Instant::now() < deadline {
                if session.keepalive_send().is_err() {
                    return Ok(());
                }
                std::thread::sleep(SHUTDOWN_POLL);
            }

            Err(FleetError::Timeout(timeout))
        });

        tokio::time::timeout(timeout, work)
            .await
            .map_err(|_| FleetError::Timeout(timeout))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_ms_is_never_unbounded() {
        assert_eq!(timeout_ms(Duration::from_secs(60)), 60_000);
        assert_eq!(timeout_ms(Duration::ZERO), 1);
        assert_eq!(timeout_ms(Duration::from_secs(u64::MAX)), u32::MAX);
    }

    #[test]
    fn test_remote_join() {
        assert_eq!(remote_join("/home/debian/koffi/", Path::new("src/koffi")), "/home/debian/koffi/src/koffi");
        assert_eq!(remote_join("C:/koffi", Path::new("README.md")), "C:/koffi/README.md");
    }

    #[test]
    fn test_buckets() {
        let split = buckets((0..7).collect(), 3);
        assert_eq!(split, vec![vec![0, 3, 6], vec![1, 4], vec![2, 5]]);

        let single = buckets(vec![1, 2], 8);
        assert_eq!(single.len(), 2);

        let empty: Vec<Vec<u8>> = buckets(Vec::new(), 4);
        assert_eq!(empty.len(), 1);
        assert!(empty[0].is_empty());
    }
}

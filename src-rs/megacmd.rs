//! MEGAcmd collaborator: locating the client scripts, checking the login,
//! probing remote paths and queueing folder uploads.
//!
//! Every call shells out with a fixed timeout. Nothing here retries.

use std::env;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};
use wait_timeout::ChildExt;

pub const DEFAULT_REMOTE_DEST: &str = "/book";

const WHOAMI_TIMEOUT: Duration = Duration::from_secs(30);
const LS_TIMEOUT: Duration = Duration::from_secs(30);
const LOGIN_TIMEOUT: Duration = Duration::from_secs(60);
const PUT_QUEUE_TIMEOUT: Duration = Duration::from_secs(60);
const PUT_WAIT_TIMEOUT: Duration = Duration::from_secs(600);

/// Lower-cased fragments MEGAcmd (and the shells wrapping it) print when a
/// remote path is absent, across the locales seen in practice.
const NOT_FOUND_SIGNALS: &[&str] = &[
    "not found",
    "no such file",
    "could not find",
    "cannot find",
    "does not exist",
    "not exist",
    "no existe",
    "no encontrado",
    "non trouvé",
    "nicht gefunden",
    "不存在",
    "見つかりません",
    "みつかりません",
];

#[derive(Debug, Error)]
pub enum MegaError {
    #[error("MEGAcmd command `{0}` not found; install MEGAcmd from https://mega.io/cmd")]
    ToolMissing(String),
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{program} timed out after {}s", timeout.as_secs())]
    Timeout { program: String, timeout: Duration },
    #[error("{program} failed (exit {code}): {message}")]
    Failed {
        program: String,
        code: i32,
        message: String,
    },
    #[error("login failed: {0}")]
    LoginFailed(String),
    #[error("could not check whether {path} exists: {message}")]
    ExistenceUnknown { path: String, message: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Stderr if present, else stdout, trimmed.
    pub fn diagnostic(&self) -> String {
        let err = self.stderr.trim();
        if err.is_empty() {
            self.stdout.trim().to_string()
        } else {
            err.to_string()
        }
    }
}

pub trait CommandRunner {
    fn run(&self, program: &Path, args: &[String], timeout: Duration)
        -> Result<ToolOutput, MegaError>;
}

/// Runs the real executable, killing it when the timeout expires.
#[derive(Debug, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(
        &self,
        program: &Path,
        args: &[String],
        timeout: Duration,
    ) -> Result<ToolOutput, MegaError> {
        let name = program_name(program);
        let mut cmd = command_for(program);
        cmd.args(args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        debug!("running {} ({} args)", program.display(), args.len());

        let mut child = cmd.spawn().map_err(|source| MegaError::Spawn {
            program: name.clone(),
            source,
        })?;

        // Pipes are drained while the child runs so chatty output cannot fill
        // the buffer and stall it until the timeout.
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let status = match child.wait_timeout(timeout) {
            Ok(Some(status)) => status,
            Ok(None) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(MegaError::Timeout {
                    program: name,
                    timeout,
                });
            }
            Err(source) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(MegaError::Spawn {
                    program: name,
                    source,
                });
            }
        };

        Ok(ToolOutput {
            code: status.code(),
            stdout: collect(stdout),
            stderr: collect(stderr),
        })
    }
}

fn drain<S: Read + Send + 'static>(mut stream: S) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut raw = Vec::new();
        let _ = stream.read_to_end(&mut raw);
        raw
    })
}

fn collect(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .map(|raw| String::from_utf8_lossy(&raw).to_string())
        .unwrap_or_default()
}

/// `.bat`/`.cmd` wrappers only run through the command interpreter.
fn command_for(program: &Path) -> Command {
    if is_batch_script(program) {
        let mut cmd = Command::new("cmd.exe");
        cmd.arg("/c").arg(program);
        cmd
    } else {
        Command::new(program)
    }
}

fn is_batch_script(program: &Path) -> bool {
    program
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("bat") || ext.eq_ignore_ascii_case("cmd"))
        .unwrap_or(false)
}

fn program_name(program: &Path) -> String {
    program
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("mega")
        .to_string()
}

/// Where to look for the MEGAcmd scripts, in priority order.
#[derive(Debug, Clone, Default)]
pub struct ToolSearch {
    pub dirs: Vec<PathBuf>,
    /// Suffixes tried in each directory; earlier entries win.
    pub suffixes: Vec<&'static str>,
}

impl ToolSearch {
    /// `$MEGACMD_DIR`, then `PATH`, then the usual install locations.
    pub fn from_env() -> Self {
        let mut dirs = Vec::new();
        if let Some(dir) = env::var_os("MEGACMD_DIR").filter(|v| !v.is_empty()) {
            dirs.push(PathBuf::from(dir));
        }
        if let Some(path) = env::var_os("PATH") {
            dirs.extend(env::split_paths(&path));
        }
        dirs.extend(install_dirs());
        Self {
            dirs,
            suffixes: default_suffixes(),
        }
    }

    pub fn find(&self, name: &str) -> Option<PathBuf> {
        for dir in &self.dirs {
            for suffix in &self.suffixes {
                let candidate = dir.join(format!("{name}{suffix}"));
                if candidate.is_file() {
                    return Some(candidate);
                }
            }
        }
        None
    }
}

#[cfg(windows)]
fn default_suffixes() -> Vec<&'static str> {
    vec![".bat", ".cmd", ".exe"]
}

#[cfg(not(windows))]
fn default_suffixes() -> Vec<&'static str> {
    vec![""]
}

#[cfg(windows)]
fn install_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(local) = env::var_os("LOCALAPPDATA").filter(|v| !v.is_empty()) {
        dirs.push(PathBuf::from(local).join("MEGAcmd"));
    }
    dirs.push(PathBuf::from(r"C:\Program Files\MEGAcmd"));
    dirs.push(PathBuf::from(r"C:\Program Files (x86)\MEGAcmd"));
    dirs
}

#[cfg(target_os = "macos")]
fn install_dirs() -> Vec<PathBuf> {
    vec![PathBuf::from("/Applications/MEGAcmd.app/Contents/MacOS")]
}

#[cfg(all(unix, not(target_os = "macos")))]
fn install_dirs() -> Vec<PathBuf> {
    vec![PathBuf::from("/usr/bin"), PathBuf::from("/usr/local/bin")]
}

pub struct Credentials {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutMode {
    /// Add to the MEGAcmd transfer queue (`-q`) and return immediately.
    pub queue: bool,
    /// Print the command instead of running it.
    pub dry_run: bool,
}

impl Default for PutMode {
    fn default() -> Self {
        Self {
            queue: true,
            dry_run: false,
        }
    }
}

#[derive(Debug)]
pub struct MegaCmd<R = SystemRunner> {
    put: PathBuf,
    whoami: PathBuf,
    login: Option<PathBuf>,
    ls: Option<PathBuf>,
    runner: R,
}

impl MegaCmd<SystemRunner> {
    pub fn locate(search: &ToolSearch) -> Result<Self, MegaError> {
        Self::locate_with(search, SystemRunner)
    }
}

impl<R: CommandRunner> MegaCmd<R> {
    pub fn locate_with(search: &ToolSearch, runner: R) -> Result<Self, MegaError> {
        let put = search
            .find("mega-put")
            .ok_or_else(|| MegaError::ToolMissing("mega-put".to_string()))?;
        let whoami = search
            .find("mega-whoami")
            .ok_or_else(|| MegaError::ToolMissing("mega-whoami".to_string()))?;
        let login = search.find("mega-login");
        let ls = search.find("mega-ls");
        debug!(
            "MEGAcmd: put={} whoami={} login={:?} ls={:?}",
            put.display(),
            whoami.display(),
            login,
            ls
        );
        Ok(Self {
            put,
            whoami,
            login,
            ls,
            runner,
        })
    }

    pub fn has_ls(&self) -> bool {
        self.ls.is_some()
    }

    /// Account name when logged in, `None` otherwise.
    pub fn logged_in_account(&self) -> Result<Option<String>, MegaError> {
        let out = self.runner.run(&self.whoami, &[], WHOAMI_TIMEOUT)?;
        let combined = format!("{}\n{}", out.stdout, out.stderr).to_lowercase();
        if !out.success() || combined.contains("not logged in") {
            return Ok(None);
        }
        let account = out.stdout.trim();
        if account.is_empty() {
            Ok(None)
        } else {
            Ok(Some(account.to_string()))
        }
    }

    /// Log in with prompted credentials unless a session already exists.
    pub fn ensure_login<F>(&self, credentials: F) -> Result<(), MegaError>
    where
        F: FnOnce() -> anyhow::Result<Credentials>,
    {
        if let Some(account) = self.logged_in_account()? {
            info!("logged in to MEGA as {account}");
            return Ok(());
        }

        let Some(login) = self.login.as_ref() else {
            return Err(MegaError::LoginFailed(
                "not logged in and mega-login was not found".to_string(),
            ));
        };

        println!("Not logged in to MEGA.");
        let creds = credentials().map_err(|err| MegaError::LoginFailed(format!("{err:#}")))?;
        if creds.email.trim().is_empty() {
            return Err(MegaError::LoginFailed("email is empty".to_string()));
        }
        if creds.password.is_empty() {
            return Err(MegaError::LoginFailed("password is empty".to_string()));
        }

        let args = vec![creds.email.trim().to_string(), creds.password];
        let out = match self.runner.run(login, &args, LOGIN_TIMEOUT) {
            Ok(out) => out,
            Err(MegaError::Timeout { .. }) => {
                return Err(MegaError::LoginFailed("login timed out".to_string()))
            }
            Err(err) => return Err(err),
        };
        if !out.success() {
            return Err(MegaError::LoginFailed(out.diagnostic()));
        }
        println!("Logged in.");
        Ok(())
    }

    /// `Ok(false)` only when MEGAcmd clearly reported the path as missing.
    pub fn remote_entry_exists(&self, remote_path: &str) -> Result<bool, MegaError> {
        let ls = self
            .ls
            .as_ref()
            .ok_or_else(|| MegaError::ToolMissing("mega-ls".to_string()))?;
        let out = self
            .runner
            .run(ls, &[remote_path.to_string()], LS_TIMEOUT)?;
        if out.success() {
            return Ok(true);
        }
        if reports_not_found(&out) {
            return Ok(false);
        }
        Err(MegaError::ExistenceUnknown {
            path: remote_path.to_string(),
            message: out.diagnostic(),
        })
    }

    pub fn upload_folder(&self, folder: &Path, dest: &str, mode: PutMode) -> Result<(), MegaError> {
        if mode.dry_run {
            println!("[dry-run] {}", put_command_line(folder, dest, mode.queue));
            return Ok(());
        }

        let (args, timeout) = put_args(folder, dest, mode.queue);
        let out = self.runner.run(&self.put, &args, timeout)?;
        if !out.success() {
            return Err(MegaError::Failed {
                program: "mega-put".to_string(),
                code: out.code.unwrap_or(1),
                message: out.diagnostic(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
impl<R> MegaCmd<R> {
    pub(crate) fn runner_ref(&self) -> &R {
        &self.runner
    }
}

fn put_args(folder: &Path, dest: &str, queue: bool) -> (Vec<String>, Duration) {
    let mut args = vec!["-c".to_string()];
    if queue {
        args.push("-q".to_string());
    }
    args.push(folder.display().to_string());
    args.push(dest.to_string());
    let timeout = if queue {
        PUT_QUEUE_TIMEOUT
    } else {
        PUT_WAIT_TIMEOUT
    };
    (args, timeout)
}

pub fn put_command_line(folder: &Path, dest: &str, queue: bool) -> String {
    let flags = if queue { "-c -q" } else { "-c" };
    format!("mega-put {flags} \"{}\" {dest}", folder.display())
}

pub fn reports_not_found(out: &ToolOutput) -> bool {
    let text = format!("{}\n{}", out.stdout, out.stderr).to_lowercase();
    NOT_FOUND_SIGNALS.iter().any(|signal| text.contains(signal))
}

/// Join a remote directory and an entry name with exactly one slash.
pub fn remote_join(dest: &str, name: &str) -> String {
    let dest = dest.trim();
    if dest.is_empty() {
        name.to_string()
    } else if dest.ends_with('/') {
        format!("{dest}{name}")
    } else {
        format!("{dest}/{name}")
    }
}

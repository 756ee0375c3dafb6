//! Display server controller: spawn the X server for a display, wait for it
//! to become ready, and take it down again.

use crate::dm::config::MasterConfig;
use crate::dm::cookie::CookieAuthority;
use crate::dm::display::{Display, ServerStatus};
use crate::dm::signals::{Cancelled, Wake, WorkerSignals};
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::Pid;
use std::ffi::CString;
use std::fs::{self, OpenOptions};
use std::io;
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

/// Grace period between `SIGTERM` and `SIGKILL`.
pub const TERM_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("display :{number} is held by live pid {pid}")]
    Busy { number: u32, pid: i32 },
    #[error("server binary {0} not found")]
    NoBinary(String),
    #[error("failed to spawn {cmd}: {source}")]
    Spawn {
        cmd: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerOutcome {
    Running,
    Timeout,
    Abort,
}

/// Identity a child process drops to before exec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunAs {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
}

impl RunAs {
    pub fn lookup(name: &str) -> Option<RunAs> {
        let u = users::get_user_by_name(name)?;
        Some(RunAs {
            name: name.to_string(),
            uid: u.uid(),
            gid: u.primary_group_id(),
        })
    }

    pub fn is_root(&self) -> bool {
        self.uid == 0
    }
}

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub command: Vec<String>,
    pub disallow_tcp: bool,
    pub timeout: Duration,
    /// `None` keeps the worker's (root) identity.
    pub run_as: Option<RunAs>,
    pub log_dir: PathBuf,
    pub x11_tmp_dir: PathBuf,
}

impl ServerOptions {
    pub fn from_config(cfg: &MasterConfig, number: u32) -> Result<Self, ServerError> {
        let d = &cfg.daemon;
        let run_as = if d.server_user == "root" {
            None
        } else {
            Some(RunAs::lookup(&d.server_user).ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("server user {} not found", d.server_user))
            })?)
        };
        Ok(Self {
            command: cfg.server_command_for(number).to_vec(),
            disallow_tcp: d.disallow_tcp,
            timeout: Duration::from_secs(d.server_timeout_secs),
            run_as,
            log_dir: d.log_dir.clone(),
            x11_tmp_dir: d.x11_tmp_dir.clone(),
        })
    }

    fn signals_readiness(&self) -> bool {
        self.run_as.as_ref().is_none_or(RunAs::is_root)
    }
}

pub fn lock_path(x11_tmp_dir: &Path, number: u32) -> PathBuf {
    x11_tmp_dir.join(format!(".X{number}-lock"))
}

pub fn socket_path(x11_tmp_dir: &Path, number: u32) -> PathBuf {
    x11_tmp_dir.join(".X11-unix").join(format!("X{number}"))
}

/// Full argv: command, display name, authority file, VT, listen policy.
pub fn server_argv(opts: &ServerOptions, d: &Display, authfile: Option<&Path>) -> Vec<String> {
    let mut argv = opts.command.clone();
    argv.push(format!(":{}", d.number));
    if let Some(p) = authfile {
        argv.push("-auth".to_string());
        argv.push(p.display().to_string());
    }
    if let Some(vt) = d.vt {
        argv.push(format!("vt{vt}"));
    }
    if opts.disallow_tcp {
        argv.push("-nolisten".to_string());
        argv.push("tcp".to_string());
    }
    argv
}

fn pid_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Removes a lock and socket left by a dead server; a live owner means the number is busy.
pub fn clear_stale(x11_tmp_dir: &Path, number: u32) -> Result<(), ServerError> {
    let lock = lock_path(x11_tmp_dir, number);
    match fs::read_to_string(&lock) {
        Ok(raw) => {
            let pid = raw.trim().parse::<i32>().unwrap_or(0);
            if pid_alive(pid) {
                return Err(ServerError::Busy { number, pid });
            }
            tracing::info!("display=:{number} removing stale lock {} (pid {pid})", lock.display());
            remove_quiet(&lock);
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    remove_quiet(&socket_path(x11_tmp_dir, number));
    Ok(())
}

fn remove_quiet(p: &Path) {
    if let Err(e) = fs::remove_file(p)
        && e.kind() != io::ErrorKind::NotFound
    {
        tracing::warn!("remove {} failed: {e}", p.display());
    }
}

fn find_binary(prog: &str) -> Option<PathBuf> {
    if prog.contains('/') {
        let p = PathBuf::from(prog);
        return p.is_file().then_some(p);
    }
    let path = std::env::var_os("PATH").unwrap_or_else(|| "/usr/local/bin:/usr/bin:/bin".into());
    std::env::split_paths(&path).map(|d| d.join(prog)).find(|p| p.is_file())
}

/// Owns at most one server process for one display.
pub struct ServerController<'a> {
    signals: &'a WorkerSignals,
    authority: &'a CookieAuthority,
    pub opts: ServerOptions,
    child: Option<Child>,
    reached_running: bool,
    number: u32,
}

impl<'a> ServerController<'a> {
    pub fn new(signals: &'a WorkerSignals, authority: &'a CookieAuthority, opts: ServerOptions) -> Self {
        Self {
            signals,
            authority,
            opts,
            child: None,
            reached_running: false,
            number: 0,
        }
    }

    pub fn pid(&self) -> Option<i32> {
        self.child.as_ref().map(|c| c.id() as i32)
    }

    /// Starts the server and waits until it is ready, dies, or the timeout passes.
    ///
    /// Anything but `Running` leaves no process, lock, socket or authority file behind.
    pub fn start(&mut self, d: &mut Display) -> Result<ServerOutcome, ServerError> {
        self.signals.check()?;
        if self.child.is_some() {
            self.stop(d);
        }
        self.number = d.number;
        self.reached_running = false;

        clear_stale(&self.opts.x11_tmp_dir, d.number)?;

        let program = self.opts.command.first().cloned().unwrap_or_default();
        let Some(binary) = find_binary(&program) else {
            self.authority.purge_display_entries(d);
            return Err(ServerError::NoBinary(program));
        };

        let authfile = d.authfile_server.clone().or_else(|| d.authfile.clone());
        let argv = server_argv(&self.opts, d, authfile.as_deref());
        let child = match self.launch(d, &binary, &argv) {
            Ok(c) => c,
            Err(e) => {
                self.fail(d, ServerStatus::Abort);
                return Err(e);
            }
        };
        let pid = child.id() as i32;
        self.child = Some(child);
        let _ = d.set_server(pid, ServerStatus::Pending);
        tracing::info!("display={} server spawned pid={pid} argv={:?}", d.name, argv);

        let outcome = match self.wait_ready(d) {
            Ok(o) => o,
            Err(c) => {
                self.fail(d, ServerStatus::Abort);
                return Err(c.into());
            }
        };
        match outcome {
            ServerOutcome::Running => {
                self.reached_running = true;
                let _ = d.set_server(pid, ServerStatus::Running);
            }
            ServerOutcome::Timeout => self.fail(d, ServerStatus::Timeout),
            ServerOutcome::Abort => self.fail(d, ServerStatus::Abort),
        }
        tracing::info!("display={} server outcome={outcome:?}", d.name);
        Ok(outcome)
    }

    fn wait_ready(&mut self, d: &Display) -> Result<ServerOutcome, Cancelled> {
        let deadline = Instant::now() + self.opts.timeout;
        let signalled = self.opts.signals_readiness();
        let sock = socket_path(&self.opts.x11_tmp_dir, d.number);
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(ServerOutcome::Timeout);
            }
            let slice = if signalled {
                deadline - now
            } else {
                (deadline - now).min(Duration::from_millis(500))
            };
            match self.signals.wait(&[], Some(slice))? {
                Wake::Ready if signalled => return Ok(ServerOutcome::Running),
                Wake::Child if self.exited() => return Ok(ServerOutcome::Abort),
                _ => {}
            }
            if self.exited() {
                return Ok(ServerOutcome::Abort);
            }
            if !signalled && UnixStream::connect(&sock).is_ok() {
                return Ok(ServerOutcome::Running);
            }
        }
    }

    /// Whether the server process is gone (reaping it if so).
    pub fn exited(&mut self) -> bool {
        match self.child.as_mut() {
            None => true,
            Some(c) => match c.try_wait() {
                Ok(Some(status)) => {
                    tracing::info!("display=:{} server exited {status}", self.number);
                    true
                }
                Ok(None) => false,
                Err(_) => true,
            },
        }
    }

    /// Log file, privilege drop and spawn; the caller cleans up on error.
    fn launch(&self, d: &Display, binary: &Path, argv: &[String]) -> Result<Child, ServerError> {
        fs::create_dir_all(&self.opts.log_dir)?;
        let log_path = self.opts.log_dir.join(format!("{}.log", d.name));
        let log = OpenOptions::new().create(true).append(true).open(&log_path)?;

        let mut cmd = Command::new(binary);
        cmd.args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log));
        let drop_to = match self.opts.run_as.clone() {
            Some(r) if !r.is_root() => {
                let cname = CString::new(r.name.clone())
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
                Some((r, cname))
            }
            _ => None,
        };
        unsafe {
            cmd.pre_exec(move || {
                child_setup(drop_to.as_ref().map(|(r, c)| (r, c.as_c_str())))
            });
        }

        self.signals.drain_ready();
        cmd.spawn().map_err(|e| ServerError::Spawn {
            cmd: binary.display().to_string(),
            source: e,
        })
    }

    fn fail(&mut self, d: &mut Display, status: ServerStatus) {
        self.terminate();
        remove_quiet(&lock_path(&self.opts.x11_tmp_dir, d.number));
        remove_quiet(&socket_path(&self.opts.x11_tmp_dir, d.number));
        self.authority.purge_display_entries(d);
        let _ = d.set_server(0, status);
    }

    fn terminate(&mut self) {
        let Some(mut child) = self.child.take() else { return };
        let pid = Pid::from_raw(child.id() as i32);
        if matches!(child.try_wait(), Ok(Some(_))) {
            return;
        }
        // The server leads its own process group.
        if killpg(pid, Signal::SIGTERM).is_err() {
            let _ = kill(pid, Signal::SIGTERM);
        }
        let deadline = Instant::now() + TERM_GRACE;
        while Instant::now() < deadline {
            if matches!(child.try_wait(), Ok(Some(_))) {
                return;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        tracing::warn!("server pid={pid} ignored SIGTERM; killing");
        let _ = killpg(pid, Signal::SIGKILL);
        let _ = child.kill();
        let _ = child.wait();
    }

    /// Stops a running server. Does nothing when there is none.
    pub fn stop(&mut self, d: &mut Display) {
        if self.child.is_none() {
            return;
        }
        self.terminate();
        // Locks of a server that never came up might belong to someone else.
        if self.reached_running {
            remove_quiet(&lock_path(&self.opts.x11_tmp_dir, self.number));
            remove_quiet(&socket_path(&self.opts.x11_tmp_dir, self.number));
        }
        self.reached_running = false;
        let _ = d.set_server(0, ServerStatus::Dead);
    }
}

/// Runs in the forked child before exec.
fn child_setup(drop_to: Option<(&RunAs, &std::ffi::CStr)>) -> io::Result<()> {
    use nix::sys::signal::{SigHandler, SigSet, SigmaskHow, signal, sigprocmask};
    nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))?;
    for sig in [
        Signal::SIGTERM,
        Signal::SIGINT,
        Signal::SIGHUP,
        Signal::SIGCHLD,
        Signal::SIGPIPE,
        Signal::SIGALRM,
        Signal::SIGUSR2,
    ] {
        unsafe { signal(sig, SigHandler::SigDfl) }?;
    }
    // An ignored SIGUSR1 tells the server to signal its parent once ready.
    for sig in [Signal::SIGUSR1, Signal::SIGTTIN, Signal::SIGTTOU] {
        unsafe { signal(sig, SigHandler::SigIgn) }?;
    }
    sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None)?;
    if let Some((r, cname)) = drop_to {
        let gid = nix::unistd::Gid::from_raw(r.gid);
        nix::unistd::setgid(gid)?;
        nix::unistd::initgroups(cname, gid)?;
        nix::unistd::setuid(nix::unistd::Uid::from_raw(r.uid))?;
    }
    Ok(())
}

//! The master: owns the display registry, runs one worker process per
//! display, answers the control socket and decides what happens after a
//! worker exits.
//!
//! Everything that touches the registry runs on the select loop in
//! [`run_daemon_async`]; connection handlers, worker pipe readers and
//! helper processes talk to it through [`MasterEvent`]s.

use crate::dm::asyncutil::TaskTracker;
use crate::dm::build_info;
use crate::dm::config::{MAX_DISPLAY_NUMBER, MasterConfig};
use crate::dm::control::{self, ControlCommand, ControlError, DEFAULT_EVENTS, MAX_MESSAGES, ServerEntry};
use crate::dm::cookie;
use crate::dm::display::{Display, DisplayEvent, DisplayKind, DisplayStatus, LogoutAction, Registry, ServerStatus};
use crate::dm::governor::{RestartCause, Verdict};
use crate::dm::login::DialogRequest;
use crate::dm::mux::{BusyProbe, ConnState, Connection, LineBuffer, Listener, MAX_CONNECTIONS};
use crate::dm::proto::{self, Notification, WORKER_FROM_MASTER_FD, WORKER_TO_MASTER_FD, WorkerChannel, WorkerExit, WorkerMsg};
use crate::dm::vt;
use crate::dm::worker::WorkerArgs;
use nix::errno::Errno;
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{Gid, Pid, Uid, chown, geteuid, pipe2};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::unix::AsyncFd;
use tokio::net::UnixListener as TokioUnixListener;
use tokio::signal::unix::{SignalKind, signal as unix_signal};
use tokio::sync::{mpsc, oneshot};
use users::{get_group_by_name, get_user_by_name};

/// How long workers get to tear down after `SIGTERM` before `SIGKILL`.
pub const WORKER_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Descriptors handed to a worker are first moved at or above this, so the
/// `dup2` onto 3 and 4 in the child can never clobber one another.
const HIGH_FD: i32 = 10;

#[derive(Debug, Clone, Copy, Default)]
pub struct DaemonOptions {
    /// Skip the root and ownership checks (for running unprivileged).
    pub no_daemon_check: bool,
}

/// Sent back to a connection handler once its command was dispatched.
#[derive(Debug)]
pub struct ControlReply {
    pub state: ConnState,
    /// `None` means nothing is written (`CLOSE`).
    pub line: Option<String>,
}

#[derive(Debug)]
pub enum MasterEvent {
    Control {
        state: ConnState,
        cmd: ControlCommand,
        busy: bool,
        resp: oneshot::Sender<ControlReply>,
    },
    WorkerLine { worker_pid: i32, line: String },
    WorkerPipeClosed { worker_pid: i32 },
    DialogAnswered { worker_pid: i32, answer: String },
    ManageDue { number: u32 },
}

/// What the master does with a display whose worker exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterExit {
    Remanage(RestartCause),
    Dispose,
    /// Leave the display dead; nothing restarts it.
    Disable,
    Machine(LogoutAction),
    RestartDaemon,
}

/// `exit` is `None` when the worker died from a signal or used an unknown code.
pub fn decide_after_exit(kind: DisplayKind, exit: Option<WorkerExit>) -> AfterExit {
    use AfterExit as A;
    use DisplayKind as K;
    use WorkerExit as W;
    if kind == K::Remote {
        return A::Dispose;
    }
    let Some(exit) = exit else {
        return A::Remanage(RestartCause::Routine);
    };
    match (exit, kind) {
        (W::Halt, _) => A::Machine(LogoutAction::Halt),
        (W::Reboot, _) => A::Machine(LogoutAction::Reboot),
        (W::Suspend, _) => A::Machine(LogoutAction::Suspend),
        (W::RestartDaemon, _) => A::RestartDaemon,
        (W::GreeterFailed, _) => A::Remanage(RestartCause::Routine),
        (W::Remanage | W::RestartGreeter, K::Static) => A::Remanage(RestartCause::Routine),
        (W::ServerFailed, K::Static) => A::Remanage(RestartCause::ServerFailed),
        (W::Abort, K::Static) => A::Disable,
        (W::Remanage | W::RestartGreeter | W::ServerFailed | W::Abort, _) => A::Dispose,
    }
}

/// `:0 local /usr/bin/X :0 -nolisten tcp`
pub fn xservers_line(d: &Display, command: &[String]) -> String {
    format!("{} local {}", d.name, command.join(" "))
}

/// A freshly started worker process and the master's ends of its pipes.
pub struct SpawnedWorker {
    pub pid: i32,
    pub to_worker: OwnedFd,
    pub from_worker: OwnedFd,
    /// Whether acks are followed by `SIGUSR2` to the worker.
    pub notify: bool,
}

pub trait WorkerSpawner: Send {
    fn spawn(&mut self, args: &WorkerArgs) -> io::Result<SpawnedWorker>;
}

/// Re-executes the running binary with the `worker` subcommand.
pub struct ExecSpawner {
    exe: PathBuf,
}

impl ExecSpawner {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            exe: std::env::current_exe()?,
        })
    }
}

fn dup_high(fd: &OwnedFd) -> io::Result<OwnedFd> {
    let raw = fcntl(fd.as_raw_fd(), FcntlArg::F_DUPFD_CLOEXEC(HIGH_FD)).map_err(io::Error::from)?;
    // SAFETY: fcntl just returned this descriptor and nothing else owns it.
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

impl WorkerSpawner for ExecSpawner {
    fn spawn(&mut self, args: &WorkerArgs) -> io::Result<SpawnedWorker> {
        let (down_r, down_w) = pipe2(OFlag::O_CLOEXEC).map_err(io::Error::from)?;
        let (up_r, up_w) = pipe2(OFlag::O_CLOEXEC).map_err(io::Error::from)?;
        let child_in = dup_high(&down_r)?;
        let child_out = dup_high(&up_w)?;
        drop((down_r, up_w));
        let (in_fd, out_fd) = (child_in.as_raw_fd(), child_out.as_raw_fd());

        let mut cmd = std::process::Command::new(&self.exe);
        cmd.args(args.to_argv()).stdin(Stdio::null());
        // SAFETY: only async-signal-safe calls between fork and exec.
        unsafe {
            cmd.pre_exec(move || {
                // dup2 leaves the new descriptors without FD_CLOEXEC.
                if libc::dup2(in_fd, WORKER_FROM_MASTER_FD) < 0 || libc::dup2(out_fd, WORKER_TO_MASTER_FD) < 0 {
                    return Err(io::Error::last_os_error());
                }
                libc::signal(libc::SIGUSR2, libc::SIG_IGN);
                if libc::setsid() < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }
        let child = cmd.spawn()?;
        // The child is reaped with waitpid by pid; std's handle is not needed.
        let pid = child.id() as i32;
        drop(child);
        Ok(SpawnedWorker {
            pid,
            to_worker: down_w,
            from_worker: up_r,
            notify: true,
        })
    }
}

/// Master-side state; only the select loop touches it.
pub struct Supervisor {
    cfg: MasterConfig,
    registry: Registry,
    channels: HashMap<i32, WorkerChannel>,
    /// `FLEXI_XSERVER` callers waiting for their display, by display number.
    pending_flexi: HashMap<u32, (ConnState, oneshot::Sender<ControlReply>)>,
    global_cookie: String,
    events: crate::dm::events::EventRing,
    spawner: Box<dyn WorkerSpawner>,
    tx: mpsc::UnboundedSender<MasterEvent>,
    tasks: TaskTracker,
    autologin_used: bool,
    shutting_down: bool,
    restart_requested: bool,
}

impl Supervisor {
    pub fn new(
        cfg: MasterConfig,
        global_cookie: String,
        spawner: Box<dyn WorkerSpawner>,
        tx: mpsc::UnboundedSender<MasterEvent>,
    ) -> Self {
        Self {
            cfg,
            registry: Registry::new(),
            channels: HashMap::new(),
            pending_flexi: HashMap::new(),
            global_cookie,
            events: crate::dm::events::EventRing::new(),
            spawner,
            tx,
            tasks: TaskTracker::new(),
            autologin_used: false,
            shutting_down: false,
            restart_requested: false,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn shutting_down(&self) -> bool {
        self.shutting_down
    }

    pub fn restart_requested(&self) -> bool {
        self.restart_requested
    }

    fn taken_vts(&self) -> Vec<u32> {
        self.registry.iter().filter_map(|d| d.vt).collect()
    }

    /// Registers the configured static displays and starts a worker for each.
    pub fn start_static_displays(&mut self) {
        for sc in self.cfg.displays.clone() {
            let vt = match sc.vt {
                Some(v) => Some(v),
                None if self.cfg.daemon.vt_allocation => vt::pick_vt(self.cfg.daemon.first_vt, &self.taken_vts()),
                None => None,
            };
            if let Err(e) = self.registry.add(Display::new_static(sc.number, vt, sc.handled)) {
                tracing::warn!("skipping static display :{}: {e}", sc.number);
                continue;
            }
            if let Err(e) = self.manage(sc.number) {
                self.events.push("display", Some(&format!(":{}", sc.number)), format!("start failed: {e:#}"));
            }
        }
    }

    /// Registers a display whose server is `host`'s and starts its worker.
    ///
    /// Library entry point for a remote-display source embedding the
    /// supervisor. The daemon binary ships no such source (there is no XDMCP
    /// listener), so nothing in it calls this.
    pub fn add_remote(&mut self, host: &str, number: u32, addresses: Vec<std::net::IpAddr>) -> anyhow::Result<()> {
        anyhow::ensure!(!self.shutting_down, "shutting down");
        anyhow::ensure!(number < MAX_DISPLAY_NUMBER, "display number {number} out of range");
        let d = self.registry.add(Display::new_remote(host, number, addresses))?;
        let name = d.name.clone();
        if let Err(e) = self.manage(number) {
            if let Some(d) = self.registry.get_mut(number) {
                let _ = d.apply(DisplayEvent::WorkerReaped);
            }
            let _ = self.registry.dispose(number);
            return Err(e.context(format!("starting remote display {name}")));
        }
        Ok(())
    }

    /// Starts a worker for `number` (Unborn on first start, Dead on re-management).
    pub fn manage(&mut self, number: u32) -> anyhow::Result<()> {
        let first_static = self.cfg.displays.first().map(|s| s.number);
        let autologin = match self.cfg.daemon.autologin_user.as_deref() {
            Some(user) if !self.autologin_used && first_static == Some(number) => Some(user.to_string()),
            _ => None,
        };
        let d = self
            .registry
            .get_mut(number)
            .ok_or_else(|| anyhow::anyhow!("no display :{number}"))?;
        let args = WorkerArgs::for_display(&self.cfg.source, d, autologin.as_deref());
        let spawned = self.spawner.spawn(&args)?;
        d.worker_pid = spawned.pid;
        d.apply(DisplayEvent::WorkerForked)?;
        let name = d.name.clone();
        if autologin.is_some() {
            self.autologin_used = true;
        }
        let chan_pid = if spawned.notify { spawned.pid } else { 0 };
        self.channels.insert(spawned.pid, WorkerChannel::new(chan_pid, spawned.to_worker)?);
        self.tasks.spawn(read_worker_pipe(spawned.pid, spawned.from_worker, self.tx.clone()));
        self.events.push("worker", Some(&name), format!("spawned pid={}", spawned.pid));
        Ok(())
    }

    pub fn handle_event(&mut self, ev: MasterEvent) {
        match ev {
            MasterEvent::Control { state, cmd, busy, resp } => self.handle_control(state, cmd, busy, resp),
            MasterEvent::WorkerLine { worker_pid, line } => self.handle_worker_line(worker_pid, &line),
            MasterEvent::WorkerPipeClosed { worker_pid } => {
                tracing::debug!("worker {worker_pid} closed its pipe");
                self.channels.remove(&worker_pid);
            }
            MasterEvent::DialogAnswered { worker_pid, answer } => self.ack(worker_pid, &answer),
            MasterEvent::ManageDue { number } => {
                let due = self
                    .registry
                    .get(number)
                    .is_some_and(|d| d.status == DisplayStatus::Dead && d.worker_pid == 0);
                if due && !self.shutting_down {
                    if let Err(e) = self.manage(number) {
                        self.events.push("display", Some(&format!(":{number}")), format!("re-manage failed: {e:#}"));
                    }
                }
            }
        }
    }

    fn ack(&mut self, worker_pid: i32, payload: &str) {
        if let Some(chan) = self.channels.get_mut(&worker_pid)
            && let Err(e) = chan.ack(payload)
        {
            tracing::warn!("ack to worker {worker_pid} failed: {e}");
        }
    }

    /// Pushes out acks a full worker pipe could not take earlier.
    pub fn flush_workers(&mut self) {
        for (pid, chan) in self.channels.iter_mut().filter(|(_, c)| c.pending() > 0) {
            if let Err(e) = chan.flush() {
                tracing::warn!("flushing to worker {pid} failed: {e}");
            }
        }
    }

    // -------- worker messages --------

    fn handle_worker_line(&mut self, worker_pid: i32, line: &str) {
        let (sender, msg) = match WorkerMsg::decode(line) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("bad line from worker {worker_pid}: {e}");
                return;
            }
        };
        if sender != worker_pid {
            tracing::warn!("worker {worker_pid} sent a message claiming pid {sender}; ignored");
            return;
        }
        let Some(number) = self.registry.by_worker_pid(worker_pid).map(|d| d.number) else {
            tracing::warn!("message from unknown worker {worker_pid}: {}", msg.opcode());
            return;
        };
        if let Some(payload) = self.apply_worker_msg(number, worker_pid, msg) {
            self.ack(worker_pid, &payload);
        }
    }

    /// Applies one worker report; `None` means the ack is sent later.
    fn apply_worker_msg(&mut self, number: u32, worker_pid: i32, msg: WorkerMsg) -> Option<String> {
        let Some(d) = self.registry.get_mut(number) else {
            return Some(String::new());
        };
        let name = d.name.clone();
        match msg {
            WorkerMsg::XPid(pid) if pid > 0 => {
                let r = d.set_server(pid, ServerStatus::Running);
                if let Err(e) = r.and_then(|_| d.apply(DisplayEvent::ServerRunning).map(|_| ())) {
                    tracing::warn!("{e}");
                }
                self.events.push("server", Some(&name), format!("running pid={pid}"));
            }
            WorkerMsg::XPid(_) => {
                if d.kind == DisplayKind::Remote && d.status == DisplayStatus::Unborn {
                    if let Err(e) = d.apply(DisplayEvent::Attached) {
                        tracing::warn!("{e}");
                    }
                } else {
                    let _ = d.set_server(0, ServerStatus::Dead);
                }
            }
            WorkerMsg::SessPid(pid) => d.sesspid = pid,
            WorkerMsg::GreetPid(pid) => d.greetpid = pid,
            WorkerMsg::LoggedIn(true) => {}
            WorkerMsg::LoggedIn(false) => d.login = None,
            WorkerMsg::Login(user) => d.login = Some(user),
            WorkerMsg::DispNum(n) => return Some(self.renumber(number, n)),
            WorkerMsg::VtNum(vt) => d.vt = Some(vt),
            WorkerMsg::Cookie(hex) => d.cookie_hex = hex,
            WorkerMsg::AuthFile(path) => d.authfile = Some(PathBuf::from(path)),
            WorkerMsg::FlexiOk => {
                let line = control::ok_reply(Some(&name));
                self.answer_flexi(number, line);
            }
            WorkerMsg::FlexiErr(code) => {
                let line = ControlError::from_flexi_code(code).reply();
                self.answer_flexi(number, line);
            }
            WorkerMsg::WriteXServers => {
                if let Err(e) = self.write_xservers(number) {
                    tracing::warn!("writing Xservers file for {name} failed: {e}");
                }
            }
            WorkerMsg::Configuring(on) => {
                let ev = if on { DisplayEvent::ConfigureBegin } else { DisplayEvent::ConfigureEnd };
                if let Err(e) = d.apply(ev) {
                    tracing::warn!("{e}");
                }
            }
            WorkerMsg::SetLogoutAction(action) => d.logout_action = action,
            WorkerMsg::QueryLogin(user) => {
                let found: Vec<String> = self
                    .registry
                    .iter()
                    .filter(|o| o.number != number && o.login.as_deref() == Some(user.as_str()))
                    .map(|o| format!("{},{}", o.name, o.vt.map(|v| v.to_string()).unwrap_or_default()))
                    .collect();
                return Some(found.join(";"));
            }
            WorkerMsg::Migrate(target) => {
                match self.registry.by_name(&target).and_then(|o| o.vt) {
                    Some(vt) => self.switch_vt(vt),
                    None => tracing::warn!("{name}: cannot migrate to {target}: no vt"),
                }
            }
            WorkerMsg::ChosenTheme(theme) => d.theme = Some(theme),
            dialog @ (WorkerMsg::ShowErrorDialog(_)
            | WorkerMsg::ShowYesNoDialog(_)
            | WorkerMsg::ShowQuestionDialog(_)
            | WorkerMsg::ShowAskButtonsDialog { .. }) => {
                let req = DialogRequest::from_msg(&dialog)?;
                return self.open_dialog(number, worker_pid, req);
            }
        }
        Some(String::new())
    }

    fn renumber(&mut self, number: u32, to: u32) -> String {
        if to >= MAX_DISPLAY_NUMBER || self.registry.get(to).is_some() {
            return "BUSY".to_string();
        }
        let Some(d) = self.registry.get_mut(number) else {
            return "BUSY".to_string();
        };
        d.number = to;
        d.name = format!(":{to}");
        let name = d.name.clone();
        if let Some(waiter) = self.pending_flexi.remove(&number) {
            self.pending_flexi.insert(to, waiter);
        }
        self.events.push("display", Some(&name), format!("renumbered from :{number}"));
        "OK".to_string()
    }

    fn answer_flexi(&mut self, number: u32, line: String) {
        if let Some((state, resp)) = self.pending_flexi.remove(&number) {
            let _ = resp.send(ControlReply { state, line: Some(line) });
        }
    }

    fn write_xservers(&self, number: u32) -> io::Result<()> {
        let Some(d) = self.registry.get(number) else {
            return Ok(());
        };
        let path = self.xservers_path(&d.name);
        let line = xservers_line(d, self.cfg.server_command_for(d.number));
        cookie::write_file_atomic(&path, format!("{line}\n").as_bytes(), 0o644, None)
    }

    fn xservers_path(&self, name: &str) -> PathBuf {
        self.cfg.daemon.server_auth_dir.join(format!("{name}.Xservers"))
    }

    fn switch_vt(&self, vt: u32) {
        self.tasks.spawn_blocking(move || {
            if let Err(e) = vt::activate_vt(vt) {
                tracing::warn!("switching to vt{vt} failed: {e}");
            }
        });
    }

    fn open_dialog(&mut self, number: u32, worker_pid: i32, req: DialogRequest) -> Option<String> {
        let d = self.registry.get(number)?;
        self.events.push("dialog", Some(&d.name), format!("{:?}: {}", req.kind, req.message));
        let helper = match self.cfg.daemon.dialog_helper.as_deref() {
            Some(h) if !h.is_empty() && d.attached && !self.shutting_down => h,
            _ => return Some(req.default_answer()),
        };
        let argv = req.argv(helper, &d.name);
        let display = d.name.clone();
        let xauth = d.authfile.clone().unwrap_or_default();
        let tx = self.tx.clone();
        self.tasks.spawn(async move {
            let out = tokio::process::Command::new(&argv[0])
                .args(&argv[1..])
                .env("DISPLAY", &display)
                .env("XAUTHORITY", &xauth)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output()
                .await;
            let answer = match out {
                Ok(out) => req.answer_from(out.status.success(), &String::from_utf8_lossy(&out.stdout)),
                Err(e) => {
                    tracing::warn!("dialog helper {} failed: {e}", argv[0]);
                    req.default_answer()
                }
            };
            let _ = tx.send(MasterEvent::DialogAnswered { worker_pid, answer });
        });
        None
    }

    // -------- worker exits --------

    /// Polls every known worker without blocking.
    pub fn reap_workers(&mut self) {
        let pids: Vec<i32> = self.registry.iter().map(|d| d.worker_pid).filter(|p| *p > 0).collect();
        for pid in pids {
            match waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(_, code)) => self.worker_exited(pid, Some(code)),
                Ok(WaitStatus::Signaled(_, sig, _)) => {
                    tracing::warn!("worker {pid} killed by {sig:?}");
                    self.worker_exited(pid, None);
                }
                Ok(_) => {}
                Err(Errno::ECHILD) => {
                    tracing::warn!("worker {pid} vanished");
                    self.worker_exited(pid, None);
                }
                Err(e) => tracing::warn!("waitpid({pid}) failed: {e}"),
            }
        }
    }

    /// `code` is the worker's exit status, `None` when it was killed.
    pub fn worker_exited(&mut self, worker_pid: i32, code: Option<i32>) {
        self.channels.remove(&worker_pid);
        let Some(d) = self.registry.iter_mut().find(|d| d.worker_pid == worker_pid) else {
            return;
        };
        let number = d.number;
        let kind = d.kind;
        let name = d.name.clone();
        if let Err(e) = d.apply(DisplayEvent::WorkerReaped) {
            tracing::warn!("{e}");
        }
        d.clear_worker_state();
        let exit = code.and_then(WorkerExit::from_code);
        self.events.push(
            "worker",
            Some(&name),
            format!("pid={worker_pid} exited code={} ({exit:?})", code.map(|c| c.to_string()).unwrap_or("-".into())),
        );
        self.answer_flexi(number, ControlError::StartupErrors.reply());
        if self.shutting_down {
            return;
        }
        self.after_exit(number, decide_after_exit(kind, exit));
    }

    fn after_exit(&mut self, number: u32, action: AfterExit) {
        let Some(d) = self.registry.get_mut(number) else {
            return;
        };
        let name = d.name.clone();
        match action {
            AfterExit::Remanage(cause) => {
                let now = chrono::Utc::now().timestamp();
                match d.retry.evaluate(now, cause) {
                    Verdict::Disable => {
                        self.events.push("display", Some(&name), "server keeps failing; display disabled");
                    }
                    verdict @ (Verdict::Proceed { sleep } | Verdict::Wait { sleep }) => {
                        if matches!(verdict, Verdict::Wait { .. }) {
                            self.events.push(
                                "display",
                                Some(&name),
                                format!("restarting too fast; waiting {}s", sleep.as_secs()),
                            );
                        }
                        self.schedule_manage(number, sleep);
                    }
                }
            }
            AfterExit::Dispose => {
                let xservers = self.xservers_path(&name);
                match self.registry.dispose(number) {
                    Ok(_) => {
                        let _ = fs::remove_file(xservers);
                        self.events.push("display", Some(&name), "disposed");
                    }
                    Err(e) => tracing::warn!("{e}"),
                }
            }
            AfterExit::Disable => self.events.push("display", Some(&name), "aborted; left dead"),
            AfterExit::Machine(action) => {
                let command = match action {
                    LogoutAction::Halt => self.cfg.daemon.halt_command.clone(),
                    LogoutAction::Reboot => self.cfg.daemon.reboot_command.clone(),
                    LogoutAction::Suspend => self.cfg.daemon.suspend_command.clone(),
                    LogoutAction::None => None,
                };
                match command {
                    Some(argv) if !argv.is_empty() => {
                        self.events.push("master", Some(&name), format!("{action} requested"));
                        self.run_machine_command(argv);
                    }
                    _ => self.events.push("master", Some(&name), format!("{action} requested but not configured")),
                }
                match action {
                    LogoutAction::Halt | LogoutAction::Reboot => self.begin_shutdown("machine going down"),
                    _ => {
                        let kind = self.registry.get(number).map(|d| d.kind).unwrap_or(DisplayKind::Flexi);
                        let next = decide_after_exit(kind, Some(WorkerExit::Remanage));
                        self.after_exit(number, next);
                    }
                }
            }
            AfterExit::RestartDaemon => {
                self.restart_requested = true;
                self.begin_shutdown("restart requested");
            }
        }
    }

    fn schedule_manage(&self, number: u32, delay: Duration) {
        let tx = self.tx.clone();
        self.tasks.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(MasterEvent::ManageDue { number });
        });
    }

    fn run_machine_command(&self, argv: Vec<String>) {
        self.tasks.spawn(async move {
            match tokio::process::Command::new(&argv[0]).args(&argv[1..]).stdin(Stdio::null()).status().await {
                Ok(st) if st.success() => {}
                Ok(st) => tracing::warn!("{} exited with {st}", argv[0]),
                Err(e) => tracing::warn!("running {} failed: {e}", argv[0]),
            }
        });
    }

    pub fn begin_shutdown(&mut self, why: &str) {
        if !self.shutting_down {
            self.events.push("shutdown", None, format!("begin ({why})"));
        }
        self.shutting_down = true;
    }

    // -------- control socket --------

    pub fn handle_control(
        &mut self,
        mut state: ConnState,
        cmd: ControlCommand,
        busy: bool,
        resp: oneshot::Sender<ControlReply>,
    ) {
        if cmd.requires_auth() && !state.authenticated {
            let _ = resp.send(ControlReply {
                state,
                line: Some(ControlError::NotAuthenticated.reply()),
            });
            return;
        }
        if cmd == ControlCommand::FlexiXServer {
            match self.start_flexi(busy) {
                Ok(number) => {
                    self.pending_flexi.insert(number, (state, resp));
                }
                Err(e) => {
                    let _ = resp.send(ControlReply {
                        state,
                        line: Some(e.reply()),
                    });
                }
            }
            return;
        }
        let line = self.control_line(&mut state, cmd);
        let _ = resp.send(ControlReply { state, line });
    }

    fn control_line(&mut self, state: &mut ConnState, cmd: ControlCommand) -> Option<String> {
        let r = match cmd {
            ControlCommand::AuthLocal(hex) => self.auth_local(state, &hex),
            ControlCommand::FlexiXServer => Err(ControlError::Unknown),
            ControlCommand::GetConfig { key, display } => {
                let number = display.as_deref().and_then(|s| s.trim().trim_start_matches(':').parse().ok());
                self.cfg
                    .lookup_key(&key, number)
                    .map(Some)
                    .ok_or(ControlError::UnsupportedKey(key))
            }
            ControlCommand::QueryLogoutAction => {
                let current = state
                    .display
                    .and_then(|n| self.registry.get(n))
                    .map(|d| d.logout_action)
                    .unwrap_or(LogoutAction::None);
                Ok(Some(control::format_logout_actions(&self.available_actions(), current)))
            }
            ControlCommand::SetLogoutAction(a) => self.set_logout_action(state, &a, false),
            ControlCommand::SetSafeLogoutAction(a) => self.set_logout_action(state, &a, true),
            ControlCommand::QueryVt => vt::query_active_vt()
                .map(|v| Some(v.to_string()))
                .map_err(|_| ControlError::VtNotSupported),
            ControlCommand::SetVt(arg) => self.set_vt(&arg),
            ControlCommand::AttachedServers(pattern) => self.server_list(pattern.as_deref(), true),
            ControlCommand::AllServers(pattern) => self.server_list(pattern.as_deref(), false),
            ControlCommand::GreeterPids => {
                let pids: Vec<String> = self
                    .registry
                    .iter()
                    .filter(|d| d.greetpid > 0)
                    .map(|d| d.greetpid.to_string())
                    .collect();
                Ok(Some(pids.join(";")))
            }
            ControlCommand::Close => return None,
            ControlCommand::Version => Ok(Some(build_info::version_line())),
            ControlCommand::Events(n) => {
                let lines: Vec<String> = self.events.tail(n.unwrap_or(DEFAULT_EVENTS)).map(|e| e.render()).collect();
                Ok(Some(lines.join(";")))
            }
            ControlCommand::Unknown(c) => {
                tracing::debug!("unknown control command {c:?}");
                Err(ControlError::NotImplemented)
            }
        };
        Some(control::reply_of(r))
    }

    fn auth_local(&self, state: &mut ConnState, hex: &str) -> Result<Option<String>, ControlError> {
        let hex = hex.trim();
        if hex.is_empty() {
            return Err(ControlError::NotAuthenticated);
        }
        if hex.eq_ignore_ascii_case(&self.global_cookie) {
            state.authenticated = true;
            state.auth_global = true;
            return Ok(None);
        }
        match self.registry.by_cookie_hex(hex) {
            Some(d) => {
                state.authenticated = true;
                state.display = Some(d.number);
                Ok(None)
            }
            None => Err(ControlError::NotAuthenticated),
        }
    }

    /// Machine actions with a configured command.
    fn available_actions(&self) -> Vec<LogoutAction> {
        let d = &self.cfg.daemon;
        LogoutAction::SELECTABLE
            .into_iter()
            .filter(|a| {
                let cmd = match a {
                    LogoutAction::Halt => &d.halt_command,
                    LogoutAction::Reboot => &d.reboot_command,
                    LogoutAction::Suspend => &d.suspend_command,
                    LogoutAction::None => return false,
                };
                cmd.as_ref().is_some_and(|c| !c.is_empty())
            })
            .collect()
    }

    fn set_logout_action(&mut self, state: &ConnState, arg: &str, safe: bool) -> Result<Option<String>, ControlError> {
        let Some(number) = state.display else {
            return Err(ControlError::NotAuthenticated);
        };
        let action: LogoutAction = arg.trim().parse().map_err(|_| ControlError::UnknownLogoutAction)?;
        if action != LogoutAction::None && !self.available_actions().contains(&action) {
            return Err(ControlError::UnknownLogoutAction);
        }
        let effective = if safe && action != LogoutAction::None && self.registry.other_logins(number) {
            LogoutAction::None
        } else {
            action
        };
        let d = self.registry.get_mut(number).ok_or(ControlError::Unknown)?;
        d.logout_action = effective;
        let (name, worker_pid) = (d.name.clone(), d.worker_pid);
        if effective != action {
            self.events.push("control", Some(&name), format!("{action} refused: other users are logged in"));
        }
        if let Some(chan) = self.channels.get_mut(&worker_pid)
            && let Err(e) = chan.notify(Notification::LogoutAction(effective))
        {
            tracing::warn!("notifying worker {worker_pid} failed: {e}");
        }
        Ok(None)
    }

    fn set_vt(&self, arg: &str) -> Result<Option<String>, ControlError> {
        let vt: u32 = arg.trim().parse().map_err(|_| ControlError::InvalidVt)?;
        if vt == 0 || vt > vt::MAX_VT {
            return Err(ControlError::InvalidVt);
        }
        if !Path::new(vt::CONSOLE_PATH).exists() {
            return Err(ControlError::VtNotSupported);
        }
        self.switch_vt(vt);
        Ok(None)
    }

    fn server_list(&self, pattern: Option<&str>, attached_only: bool) -> Result<Option<String>, ControlError> {
        let matcher = match pattern.map(str::trim).filter(|p| !p.is_empty()) {
            Some(p) => Some(
                globset::Glob::new(p)
                    .map_err(|_| ControlError::Unknown)?
                    .compile_matcher(),
            ),
            None => None,
        };
        let entries: Vec<ServerEntry> = self
            .registry
            .iter()
            .filter(|d| !attached_only || d.attached)
            .filter(|d| matches!(d.status, DisplayStatus::Alive | DisplayStatus::Configuring))
            .filter(|d| matcher.as_ref().is_none_or(|m| m.is_match(&d.name)))
            .map(|d| ServerEntry {
                name: d.name.clone(),
                user: d.login.clone().unwrap_or_default(),
                vt: d.vt,
            })
            .collect();
        Ok(Some(control::format_server_list(&entries)))
    }

    fn start_flexi(&mut self, busy: bool) -> Result<u32, ControlError> {
        if self.shutting_down {
            return Err(ControlError::StartupErrors);
        }
        if busy || self.registry.count_kind(DisplayKind::Flexi) >= self.cfg.daemon.max_flexi_servers as usize {
            return Err(ControlError::NoMoreFlexi);
        }
        let number = self.registry.next_free_number(self.cfg.daemon.first_flexi_display);
        if number >= MAX_DISPLAY_NUMBER {
            return Err(ControlError::NoMoreFlexi);
        }
        let mut d = Display::new_flexi(number);
        if self.cfg.daemon.vt_allocation {
            d.vt = vt::pick_vt(self.cfg.daemon.first_vt, &self.taken_vts());
        }
        self.registry.add(d).map_err(|_| ControlError::Unknown)?;
        if let Err(e) = self.manage(number) {
            self.events.push("display", Some(&format!(":{number}")), format!("flexi start failed: {e:#}"));
            if let Some(d) = self.registry.get_mut(number) {
                let _ = d.apply(DisplayEvent::WorkerReaped);
            }
            let _ = self.registry.dispose(number);
            return Err(ControlError::StartupErrors);
        }
        Ok(number)
    }

    // -------- shutdown --------

    fn live_workers(&self) -> Vec<i32> {
        self.registry.iter().map(|d| d.worker_pid).filter(|p| *p > 0).collect()
    }

    /// Stops every worker (TERM, then KILL after the grace period) and waits for helper tasks.
    pub async fn shutdown_workers(&mut self) {
        self.shutting_down = true;
        for (_, (state, resp)) in self.pending_flexi.drain() {
            let _ = resp.send(ControlReply {
                state,
                line: Some(ControlError::StartupErrors.reply()),
            });
        }
        for pid in self.live_workers() {
            let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
        }
        let deadline = tokio::time::Instant::now() + WORKER_SHUTDOWN_GRACE;
        while !self.live_workers().is_empty() && tokio::time::Instant::now() < deadline {
            self.reap_workers();
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        for pid in self.live_workers() {
            tracing::warn!("worker {pid} ignored SIGTERM; killing");
            let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
            let code = match waitpid(Pid::from_raw(pid), None) {
                Ok(WaitStatus::Exited(_, c)) => Some(c),
                _ => None,
            };
            self.worker_exited(pid, code);
        }
        let left = self.tasks.settle(Duration::from_secs(5)).await;
        if left > 0 {
            tracing::warn!("{left} helper task(s) still running at shutdown");
        }
        self.events.push("shutdown", None, format!("workers stopped; helper tasks spawned={}", self.tasks.spawned()));
    }
}

// -------- worker pipes --------

async fn read_from_asyncfd(fd: &AsyncFd<OwnedFd>, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        let mut guard = fd.readable().await?;
        let r = guard.try_io(|inner| {
            // SAFETY: inner is an open pipe and buf is valid for buf.len() bytes.
            let n = unsafe { libc::read(inner.get_ref().as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
            if n < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(n as usize)
        });
        match r {
            Ok(Ok(n)) => return Ok(n),
            Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
            Ok(Err(e)) => return Err(e),
            Err(_would_block) => continue,
        }
    }
}

async fn read_worker_pipe(worker_pid: i32, fd: OwnedFd, tx: mpsc::UnboundedSender<MasterEvent>) {
    let afd = match proto::set_nonblocking(fd.as_raw_fd()).and_then(|_| AsyncFd::new(fd)) {
        Ok(a) => a,
        Err(e) => {
            tracing::warn!("cannot watch worker {worker_pid} pipe: {e}");
            let _ = tx.send(MasterEvent::WorkerPipeClosed { worker_pid });
            return;
        }
    };
    let mut lines = LineBuffer::new();
    let mut buf = [0u8; 4096];
    loop {
        match read_from_asyncfd(&afd, &mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                for line in lines.push(&buf[..n]) {
                    if tx.send(MasterEvent::WorkerLine { worker_pid, line }).is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                tracing::warn!("reading worker {worker_pid} pipe failed: {e}");
                break;
            }
        }
    }
    let _ = tx.send(MasterEvent::WorkerPipeClosed { worker_pid });
}

// -------- control connections --------

async fn serve_connection(mut conn: Connection, tx: mpsc::UnboundedSender<MasterEvent>, probe: BusyProbe) {
    loop {
        let line = match conn.next_line().await {
            Ok(Some(l)) => l,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("control connection {} read failed: {e}", conn.id);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        conn.state.begin_dispatch();
        if conn.state.messages > MAX_MESSAGES {
            let _ = conn.reply(&ControlError::TooManyMessages.reply()).await;
            break;
        }
        let cmd = ControlCommand::parse(&line);
        let closing = cmd == ControlCommand::Close;
        let (rtx, rrx) = oneshot::channel();
        let ev = MasterEvent::Control {
            state: conn.state.clone(),
            cmd,
            busy: probe.is_busy(),
            resp: rtx,
        };
        if tx.send(ev).is_err() {
            break;
        }
        let Ok(reply) = rrx.await else {
            break;
        };
        conn.state = reply.state;
        if let Some(out) = reply.line
            && let Err(e) = conn.reply(&out).await
        {
            tracing::debug!("control connection {} write failed: {e}", conn.id);
            break;
        }
        if closing {
            conn.state.request_close();
        }
        if conn.state.end_dispatch() {
            break;
        }
    }
}

// -------- startup --------

fn prepare_socket(sock: &Path) -> anyhow::Result<()> {
    if let Some(parent) = sock.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| anyhow::anyhow!("failed to create socket directory {}: {e}", parent.display()))?;
    }
    if sock.exists() {
        match UnixStream::connect(sock) {
            Ok(_) => anyhow::bail!(
                "displaymaster already running (socket {} is accepting connections)",
                sock.display()
            ),
            Err(_) => fs::remove_file(sock)
                .map_err(|e| anyhow::anyhow!("failed to remove stale socket {}: {e}", sock.display()))?,
        }
    }
    Ok(())
}

fn apply_socket_settings(cfg: &MasterConfig) -> anyhow::Result<()> {
    fs::set_permissions(&cfg.sock, fs::Permissions::from_mode(cfg.sock_mode))
        .map_err(|e| anyhow::anyhow!("failed to chmod socket {} to {:o}: {e}", cfg.sock.display(), cfg.sock_mode))?;
    if cfg.sock_owner.is_none() && cfg.sock_group.is_none() {
        return Ok(());
    }
    if !geteuid().is_root() {
        tracing::warn!("not root; leaving ownership of {} alone", cfg.sock.display());
        return Ok(());
    }
    let uid = match cfg.sock_owner.as_deref() {
        None => None,
        Some(u) => {
            let user = get_user_by_name(u).ok_or_else(|| anyhow::anyhow!("unknown sock owner user: {u}"))?;
            Some(Uid::from_raw(user.uid()))
        }
    };
    let gid = match cfg.sock_group.as_deref() {
        None => None,
        Some(g) => {
            let group = get_group_by_name(g).ok_or_else(|| anyhow::anyhow!("unknown sock group: {g}"))?;
            Some(Gid::from_raw(group.gid()))
        }
    };
    chown(&cfg.sock, uid, gid).map_err(|e| anyhow::anyhow!("failed to chown socket {}: {e}", cfg.sock.display()))?;
    Ok(())
}

/// The daemon identity must exist before any display is managed.
pub fn check_daemon_identity(cfg: &MasterConfig) -> anyhow::Result<()> {
    let d = &cfg.daemon;
    if get_user_by_name(&d.user).is_none() {
        anyhow::bail!("daemon user {:?} does not exist", d.user);
    }
    if get_group_by_name(&d.group).is_none() {
        anyhow::bail!("daemon group {:?} does not exist", d.group);
    }
    Ok(())
}

/// Creates `dir` if needed, then insists it is a real directory owned by
/// `owner` that neither group nor others can write.
pub fn check_auth_dir(dir: &Path, owner: u32) -> anyhow::Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir).map_err(|e| anyhow::anyhow!("failed to create {}: {e}", dir.display()))?;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o755))?;
    }
    let md = fs::symlink_metadata(dir).map_err(|e| anyhow::anyhow!("cannot stat {}: {e}", dir.display()))?;
    if !md.is_dir() {
        anyhow::bail!("{} is not a directory", dir.display());
    }
    if md.uid() != owner {
        anyhow::bail!("{} is owned by uid {}, expected {owner}", dir.display(), md.uid());
    }
    if md.mode() & 0o022 != 0 {
        anyhow::bail!("{} is group or world writable (mode {:o})", dir.display(), md.mode() & 0o7777);
    }
    Ok(())
}

/// Refuses to start while the recorded pid is alive, then records ours.
pub fn acquire_pid_file(path: &Path) -> anyhow::Result<()> {
    let me = std::process::id() as i32;
    if let Ok(raw) = fs::read_to_string(path)
        && let Ok(pid) = raw.trim().parse::<i32>()
        && pid > 0
        && pid != me
        && kill(Pid::from_raw(pid), None).is_ok()
    {
        anyhow::bail!("displaymaster already running (pid {pid} in {})", path.display());
    }
    cookie::write_file_atomic(path, format!("{me}\n").as_bytes(), 0o644, None)
        .map_err(|e| anyhow::anyhow!("failed to write pid file {}: {e}", path.display()))
}

pub fn run_daemon(cfg: MasterConfig, opts: DaemonOptions) -> anyhow::Result<()> {
    let rt = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    rt.block_on(run_daemon_async(cfg, opts))
}

pub async fn run_daemon_async(cfg: MasterConfig, opts: DaemonOptions) -> anyhow::Result<()> {
    if !opts.no_daemon_check {
        if !geteuid().is_root() {
            anyhow::bail!("displaymaster must run as root (use --no-daemon-check to skip)");
        }
        check_daemon_identity(&cfg)?;
        check_auth_dir(&cfg.daemon.auth_dir, 0)?;
    } else {
        fs::create_dir_all(&cfg.daemon.auth_dir)?;
    }
    fs::create_dir_all(&cfg.daemon.server_auth_dir)
        .map_err(|e| anyhow::anyhow!("failed to create {}: {e}", cfg.daemon.server_auth_dir.display()))?;
    acquire_pid_file(&cfg.daemon.pid_file)?;

    let sock = cfg.sock.clone();
    prepare_socket(&sock)?;
    let listener = TokioUnixListener::bind(&sock)
        .map_err(|e| anyhow::anyhow!("failed to bind control socket {}: {e}", sock.display()))?;
    apply_socket_settings(&cfg)?;
    let listener = Listener::from_listener(listener, MAX_CONNECTIONS);
    let probe = listener.busy_probe();

    let cookie_file = cfg.global_cookie_file();
    let global_cookie = cookie::write_global_cookie(&cookie_file)
        .map_err(|e| anyhow::anyhow!("failed to write {}: {e}", cookie_file.display()))?;

    let pid_file = cfg.daemon.pid_file.clone();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut sv = Supervisor::new(cfg, global_cookie, Box::new(ExecSpawner::new()?), tx.clone());
    sv.events.push("boot", None, build_info::banner());
    sv.events.push("boot", None, format!("control socket {}", sock.display()));

    let mut chld = unix_signal(SignalKind::child())?;
    let mut term = unix_signal(SignalKind::terminate())?;
    let mut int = unix_signal(SignalKind::interrupt())?;
    // Workers only use this to wake each other's peers; the master must not die from it.
    let mut usr2 = unix_signal(SignalKind::user_defined2())?;
    let mut tick = tokio::time::interval(Duration::from_secs(1));

    sv.start_static_displays();

    while !sv.shutting_down() {
        tokio::select! {
            Some(ev) = rx.recv() => sv.handle_event(ev),
            _ = chld.recv() => sv.reap_workers(),
            _ = term.recv() => sv.begin_shutdown("SIGTERM"),
            _ = int.recv() => sv.begin_shutdown("SIGINT"),
            _ = usr2.recv() => {}
            r = listener.accept() => match r {
                Ok(conn) => {
                    tracing::debug!("control connection {} accepted (live={})", conn.id, listener.live());
                    sv.tasks.spawn(serve_connection(conn, tx.clone(), probe.clone()));
                }
                Err(e) => {
                    tracing::warn!("accept failed: {e}");
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
            },
            _ = tick.tick() => {
                sv.reap_workers();
                sv.flush_workers();
            }
        }
    }

    drop(listener);
    // Queued control requests are dropped so their handlers see the closed reply channel.
    drop(rx);
    let _ = fs::remove_file(&sock);
    sv.shutdown_workers().await;
    let _ = fs::remove_file(&cookie_file);
    let _ = fs::remove_file(&pid_file);
    sv.events.push("shutdown", None, format!("done; closed sock={}", sock.display()));

    if sv.restart_requested() {
        let exe = std::env::current_exe()?;
        let err = std::process::Command::new(exe).args(std::env::args_os().skip(1)).exec();
        anyhow::bail!("re-exec failed: {err}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dm::config::parse_master_config;
    use std::sync::{Arc, Mutex};

    /// Hands out pipes instead of processes; the worker ends stay alive in `held`.
    struct FakeSpawner {
        spawned: Arc<Mutex<Vec<WorkerArgs>>>,
        held: Vec<(OwnedFd, OwnedFd)>,
        next_pid: i32,
    }

    impl WorkerSpawner for FakeSpawner {
        fn spawn(&mut self, args: &WorkerArgs) -> io::Result<SpawnedWorker> {
            let (down_r, down_w) = pipe2(OFlag::O_CLOEXEC).map_err(io::Error::from)?;
            let (up_r, up_w) = pipe2(OFlag::O_CLOEXEC).map_err(io::Error::from)?;
            self.held.push((down_r, up_w));
            self.spawned.lock().unwrap().push(args.clone());
            self.next_pid += 1;
            Ok(SpawnedWorker {
                pid: self.next_pid,
                to_worker: down_w,
                from_worker: up_r,
                notify: false,
            })
        }
    }

    struct Harness {
        sv: Supervisor,
        rx: mpsc::UnboundedReceiver<MasterEvent>,
        spawned: Arc<Mutex<Vec<WorkerArgs>>>,
        _tmp: tempfile::TempDir,
    }

    fn harness(daemon_yaml: &str) -> Harness {
        let tmp = tempfile::TempDir::new().unwrap();
        let raw = format!(
            "daemon:\n  server_auth_dir: {}\n  auth_dir: {}\n{daemon_yaml}",
            tmp.path().join("serverauth").display(),
            tmp.path().join("auth").display(),
        );
        let cfg = parse_master_config(&raw, &tmp.path().join("config.yaml")).unwrap();
        let spawned = Arc::new(Mutex::new(Vec::new()));
        let spawner = FakeSpawner {
            spawned: Arc::clone(&spawned),
            held: Vec::new(),
            next_pid: 4000,
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let sv = Supervisor::new(cfg, "00ff".repeat(8), Box::new(spawner), tx);
        Harness {
            sv,
            rx,
            spawned,
            _tmp: tmp,
        }
    }

    fn authed() -> ConnState {
        ConnState {
            authenticated: true,
            auth_global: true,
            ..ConnState::default()
        }
    }

    fn call(sv: &mut Supervisor, state: ConnState, cmd: ControlCommand) -> ControlReply {
        let (tx, mut rx) = oneshot::channel();
        sv.handle_control(state, cmd, false, tx);
        rx.try_recv().expect("reply should be immediate")
    }

    fn line(sv: &mut Supervisor, state: ConnState, cmd: &str) -> String {
        call(sv, state, ControlCommand::parse(cmd)).line.unwrap()
    }

    fn worker_says(sv: &mut Supervisor, pid: i32, msg: WorkerMsg) {
        sv.handle_event(MasterEvent::WorkerLine {
            worker_pid: pid,
            line: msg.encode(pid),
        });
    }

    #[test]
    fn post_mortem_table() {
        use AfterExit as A;
        use DisplayKind as K;
        assert_eq!(decide_after_exit(K::Static, None), A::Remanage(RestartCause::Routine));
        assert_eq!(decide_after_exit(K::Flexi, None), A::Remanage(RestartCause::Routine));
        assert_eq!(decide_after_exit(K::Remote, None), A::Dispose);
        assert_eq!(decide_after_exit(K::Static, Some(WorkerExit::Remanage)), A::Remanage(RestartCause::Routine));
        assert_eq!(decide_after_exit(K::Flexi, Some(WorkerExit::Remanage)), A::Dispose);
        assert_eq!(decide_after_exit(K::Static, Some(WorkerExit::Abort)), A::Disable);
        assert_eq!(decide_after_exit(K::Flexi, Some(WorkerExit::Abort)), A::Dispose);
        assert_eq!(
            decide_after_exit(K::Static, Some(WorkerExit::ServerFailed)),
            A::Remanage(RestartCause::ServerFailed)
        );
        assert_eq!(decide_after_exit(K::Flexi, Some(WorkerExit::ServerFailed)), A::Dispose);
        assert_eq!(decide_after_exit(K::Flexi, Some(WorkerExit::GreeterFailed)), A::Remanage(RestartCause::Routine));
        assert_eq!(decide_after_exit(K::Static, Some(WorkerExit::Halt)), A::Machine(LogoutAction::Halt));
        assert_eq!(decide_after_exit(K::Remote, Some(WorkerExit::Halt)), A::Dispose);
        assert_eq!(decide_after_exit(K::Static, Some(WorkerExit::RestartDaemon)), A::RestartDaemon);
    }

    #[test]
    fn xservers_line_names_display_and_command() {
        let d = Display::new_static(0, Some(7), true);
        let cmd = vec!["/usr/bin/X".to_string(), "-nolisten".to_string(), "tcp".to_string()];
        assert_eq!(xservers_line(&d, &cmd), ":0 local /usr/bin/X -nolisten tcp");
    }

    #[tokio::test]
    async fn flexi_request_over_the_limit_changes_nothing() {
        let mut h = harness("  max_flexi_servers: 1\n");
        h.sv.registry.add(Display::new_flexi(20)).unwrap();
        let before = h.sv.registry.len();
        assert_eq!(line(&mut h.sv, authed(), "FLEXI_XSERVER"), "ERROR 1 No more flexi servers");
        assert_eq!(h.sv.registry.len(), before);
        assert!(h.spawned.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn busy_listener_refuses_flexi() {
        let mut h = harness("");
        let (tx, mut rx) = oneshot::channel();
        h.sv.handle_control(authed(), ControlCommand::FlexiXServer, true, tx);
        assert_eq!(rx.try_recv().unwrap().line.unwrap(), "ERROR 1 No more flexi servers");
        assert!(h.sv.registry.is_empty());
    }

    #[tokio::test]
    async fn flexi_reply_waits_for_the_worker() {
        let mut h = harness("  max_flexi_servers: 4\n  first_flexi_display: 20\n");
        let (tx, mut rx) = oneshot::channel();
        h.sv.handle_control(authed(), ControlCommand::FlexiXServer, false, tx);
        assert!(rx.try_recv().is_err());
        let pid = h.sv.registry.get(20).unwrap().worker_pid;
        assert_eq!(h.spawned.lock().unwrap()[0].kind, "flexi");

        // the worker found :20 taken and moved
        worker_says(&mut h.sv, pid, WorkerMsg::DispNum(21));
        assert!(h.sv.registry.get(21).is_some());
        worker_says(&mut h.sv, pid, WorkerMsg::XPid(777));
        worker_says(&mut h.sv, pid, WorkerMsg::FlexiOk);
        assert_eq!(rx.try_recv().unwrap().line.unwrap(), "OK :21");
        assert_eq!(h.sv.registry.get(21).unwrap().status, DisplayStatus::Alive);
    }

    #[tokio::test]
    async fn flexi_worker_dying_early_answers_startup_error() {
        let mut h = harness("  first_flexi_display: 20\n");
        let (tx, mut rx) = oneshot::channel();
        h.sv.handle_control(authed(), ControlCommand::FlexiXServer, false, tx);
        let pid = h.sv.registry.get(20).unwrap().worker_pid;
        h.sv.worker_exited(pid, Some(WorkerExit::ServerFailed.code()));
        assert_eq!(rx.try_recv().unwrap().line.unwrap(), "ERROR 2 Startup errors");
        assert!(h.sv.registry.get(20).is_none());
    }

    #[tokio::test]
    async fn auth_local_distinguishes_global_and_display_cookies() {
        let mut h = harness("");
        h.sv.registry.add(Display::new_static(0, None, true)).unwrap();
        h.sv.registry.get_mut(0).unwrap().cookie_hex = "abcd".repeat(8);

        assert_eq!(line(&mut h.sv, ConnState::default(), "FLEXI_XSERVER"), "ERROR 100 Not authenticated");

        let r = call(&mut h.sv, ConnState::default(), ControlCommand::AuthLocal("00FF".repeat(8)));
        assert_eq!(r.line.as_deref(), Some("OK"));
        assert!(r.state.authenticated && r.state.auth_global);
        assert_eq!(r.state.display, None);

        let r = call(&mut h.sv, ConnState::default(), ControlCommand::AuthLocal("abcd".repeat(8)));
        assert!(r.state.authenticated && !r.state.auth_global);
        assert_eq!(r.state.display, Some(0));

        let r = call(&mut h.sv, ConnState::default(), ControlCommand::AuthLocal("1234".into()));
        assert_eq!(r.line.as_deref(), Some("ERROR 100 Not authenticated"));
        assert!(!r.state.authenticated);
    }

    #[tokio::test]
    async fn crashed_static_worker_is_remanaged_after_a_second() {
        let mut h = harness("");
        h.sv.registry.add(Display::new_static(0, Some(7), true)).unwrap();
        h.sv.manage(0).unwrap();
        let pid = h.sv.registry.get(0).unwrap().worker_pid;
        worker_says(&mut h.sv, pid, WorkerMsg::XPid(555));
        assert_eq!(h.sv.registry.get(0).unwrap().status, DisplayStatus::Alive);

        h.sv.worker_exited(pid, None);
        let d = h.sv.registry.get(0).unwrap();
        assert_eq!(d.status, DisplayStatus::Dead);
        assert_eq!(d.retry.sleep_before_run, 1);
        assert_eq!(d.worker_pid, 0);

        let due = loop {
            let ev = tokio::time::timeout(Duration::from_secs(5), h.rx.recv()).await.unwrap().unwrap();
            if let MasterEvent::ManageDue { number } = ev {
                break number;
            }
        };
        assert_eq!(due, 0);
        h.sv.handle_event(MasterEvent::ManageDue { number: due });
        assert_eq!(h.spawned.lock().unwrap().len(), 2);
        let d = h.sv.registry.get(0).unwrap();
        assert_ne!(d.worker_pid, pid);
        assert_eq!(d.status, DisplayStatus::Alive);
    }

    #[tokio::test]
    async fn remote_display_attaches_and_is_disposed_on_exit() {
        let mut h = harness("");
        let peer: std::net::IpAddr = "192.0.2.7".parse().unwrap();
        h.sv.add_remote("far", 3, vec![peer]).unwrap();
        let d = h.sv.registry.get(3).unwrap();
        assert_eq!(d.name, "far:3");
        let pid = d.worker_pid;
        {
            let spawned = h.spawned.lock().unwrap();
            assert_eq!(spawned[0].kind, "remote");
            assert_eq!(spawned[0].host.as_deref(), Some("far"));
            assert_eq!(spawned[0].addresses, vec![peer]);
        }
        worker_says(&mut h.sv, pid, WorkerMsg::XPid(0));
        assert_eq!(h.sv.registry.get(3).unwrap().status, DisplayStatus::Alive);
        h.sv.worker_exited(pid, Some(WorkerExit::Remanage.code()));
        assert!(h.sv.registry.get(3).is_none());
        assert!(h.sv.add_remote("again", 3, Vec::new()).is_ok());
    }

    #[tokio::test]
    async fn aborted_static_display_stays_dead() {
        let mut h = harness("");
        h.sv.registry.add(Display::new_static(0, None, true)).unwrap();
        h.sv.manage(0).unwrap();
        let pid = h.sv.registry.get(0).unwrap().worker_pid;
        h.sv.worker_exited(pid, Some(WorkerExit::Abort.code()));
        assert_eq!(h.sv.registry.get(0).unwrap().status, DisplayStatus::Dead);
        assert_eq!(h.sv.tasks.spawned(), 1, "only the pipe reader, no re-manage timer");
    }

    #[tokio::test]
    async fn autologin_goes_to_the_first_static_display_once() {
        let mut h = harness("  autologin_user: kiosk\n");
        h.sv.start_static_displays();
        let pid = h.sv.registry.get(0).unwrap().worker_pid;
        h.sv.worker_exited(pid, Some(WorkerExit::Remanage.code()));
        h.sv.handle_event(MasterEvent::ManageDue { number: 0 });
        let spawned = h.spawned.lock().unwrap();
        assert_eq!(spawned.len(), 2);
        assert_eq!(spawned[0].autologin.as_deref(), Some("kiosk"));
        assert_eq!(spawned[1].autologin, None);
    }

    #[tokio::test]
    async fn worker_reports_are_recorded() {
        let mut h = harness("");
        h.sv.registry.add(Display::new_static(0, Some(7), true)).unwrap();
        h.sv.registry.add(Display::new_static(1, Some(8), true)).unwrap();
        h.sv.manage(0).unwrap();
        h.sv.manage(1).unwrap();
        let p0 = h.sv.registry.get(0).unwrap().worker_pid;
        let p1 = h.sv.registry.get(1).unwrap().worker_pid;
        worker_says(&mut h.sv, p0, WorkerMsg::Login("alice".into()));
        worker_says(&mut h.sv, p0, WorkerMsg::GreetPid(91));
        worker_says(&mut h.sv, p0, WorkerMsg::Cookie("beef".into()));
        worker_says(&mut h.sv, p0, WorkerMsg::WriteXServers);
        worker_says(&mut h.sv, p1, WorkerMsg::DispNum(0));

        let d0 = h.sv.registry.get(0).unwrap();
        assert_eq!(d0.login.as_deref(), Some("alice"));
        assert_eq!(d0.greetpid, 91);
        assert_eq!(d0.cookie_hex, "beef");
        let xservers = fs::read_to_string(h.sv.xservers_path(&d0.name)).unwrap();
        assert!(xservers.starts_with(":0 local "));
        // :0 is taken, so :1 keeps its number
        assert!(h.sv.registry.get(1).is_some());

        assert_eq!(line(&mut h.sv, authed(), "GREETERPIDS"), "OK 91");
        worker_says(&mut h.sv, p0, WorkerMsg::LoggedIn(false));
        assert_eq!(h.sv.registry.get(0).unwrap().login, None);
    }

    #[tokio::test]
    async fn logout_actions_need_a_display_and_a_command() {
        let mut h = harness("  halt_command: [/sbin/poweroff]\n");
        h.sv.registry.add(Display::new_static(0, None, true)).unwrap();
        h.sv.registry.add(Display::new_static(1, None, true)).unwrap();
        let mut on_zero = authed();
        on_zero.display = Some(0);

        assert_eq!(line(&mut h.sv, authed(), "SET_LOGOUT_ACTION HALT"), "ERROR 100 Not authenticated");
        assert_eq!(
            line(&mut h.sv, on_zero.clone(), "SET_LOGOUT_ACTION REBOOT"),
            "ERROR 7 Unknown logout action"
        );
        assert_eq!(line(&mut h.sv, on_zero.clone(), "SET_LOGOUT_ACTION HALT"), "OK");
        assert_eq!(h.sv.registry.get(0).unwrap().logout_action, LogoutAction::Halt);
        assert_eq!(line(&mut h.sv, on_zero.clone(), "QUERY_LOGOUT_ACTION"), "OK HALT!");

        h.sv.registry.get_mut(1).unwrap().login = Some("bob".into());
        assert_eq!(line(&mut h.sv, on_zero.clone(), "SET_SAFE_LOGOUT_ACTION HALT"), "OK");
        assert_eq!(h.sv.registry.get(0).unwrap().logout_action, LogoutAction::None);
    }

    #[tokio::test]
    async fn simple_queries() {
        let mut h = harness("");
        assert_eq!(line(&mut h.sv, authed(), "GET_CONFIG daemon/User"), "OK displaymaster");
        assert!(line(&mut h.sv, authed(), "GET_CONFIG nope/Nothing").starts_with("ERROR 50 "));
        assert_eq!(line(&mut h.sv, authed(), "VERSION"), format!("OK {}", build_info::version_line()));
        assert_eq!(line(&mut h.sv, authed(), "SET_VT 0"), "ERROR 9 Invalid VT number");
        assert_eq!(line(&mut h.sv, authed(), "SET_VT seven"), "ERROR 9 Invalid VT number");
        assert!(call(&mut h.sv, authed(), ControlCommand::Close).line.is_none());
        assert!(line(&mut h.sv, authed(), "NO_SUCH_THING").starts_with("ERROR 0 "));
    }

    #[tokio::test]
    async fn server_lists_filter_by_pattern_and_attachment() {
        let mut h = harness("");
        for n in [0, 1] {
            let d = h.sv.registry.add(Display::new_static(n, Some(7 + n), true)).unwrap();
            d.status = DisplayStatus::Alive;
        }
        let r = h.sv.registry.add(Display::new_remote("far", 2, Vec::new())).unwrap();
        r.status = DisplayStatus::Alive;
        h.sv.registry.get_mut(1).unwrap().login = Some("carol".into());

        let all = line(&mut h.sv, authed(), "ALL_SERVERS");
        let attached = line(&mut h.sv, authed(), "ATTACHED_SERVERS");
        let one = line(&mut h.sv, authed(), "ATTACHED_SERVERS :1");
        assert_eq!(control::parse_server_list(all.strip_prefix("OK ").unwrap()).len(), 3);
        assert_eq!(control::parse_server_list(attached.strip_prefix("OK ").unwrap()).len(), 2);
        let one = control::parse_server_list(one.strip_prefix("OK ").unwrap());
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].user, "carol");
        assert_eq!(one[0].vt, Some(8));
    }

    #[tokio::test]
    async fn query_login_lists_other_sessions_of_the_user() {
        let mut h = harness("");
        h.sv.registry.add(Display::new_static(0, Some(7), true)).unwrap();
        h.sv.registry.add(Display::new_static(1, Some(8), true)).unwrap();
        h.sv.registry.get_mut(1).unwrap().login = Some("dave".into());
        assert_eq!(h.sv.apply_worker_msg(0, 0, WorkerMsg::QueryLogin("dave".into())).as_deref(), Some(":1,8"));
        assert_eq!(h.sv.apply_worker_msg(1, 0, WorkerMsg::QueryLogin("dave".into())).as_deref(), Some(""));
    }

    #[tokio::test]
    async fn unattended_dialog_gets_default_answer() {
        let mut h = harness("");
        h.sv.registry.add(Display::new_static(0, None, true)).unwrap();
        let answer = h.sv.apply_worker_msg(0, 0, WorkerMsg::ShowYesNoDialog("Retry?".into()));
        assert_eq!(answer.as_deref(), Some("NO"));
    }

    #[tokio::test]
    async fn dialog_helper_answer_comes_back_as_an_event() {
        let mut h = harness("  dialog_helper: [/bin/sh, -c, 'exit 0', helper]\n");
        h.sv.registry.add(Display::new_static(0, None, true)).unwrap();
        let answer = h.sv.apply_worker_msg(0, 42, WorkerMsg::ShowYesNoDialog("Retry?".into()));
        assert_eq!(answer, None);
        let ev = tokio::time::timeout(Duration::from_secs(5), h.rx.recv()).await.unwrap().unwrap();
        match ev {
            MasterEvent::DialogAnswered { worker_pid, answer } => {
                assert_eq!(worker_pid, 42);
                assert_eq!(answer, "YES");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn auth_dir_must_not_be_world_writable() {
        let tmp = tempfile::TempDir::new().unwrap();
        let me = nix::unistd::getuid().as_raw();
        let dir = tmp.path().join("auth");
        check_auth_dir(&dir, me).unwrap();
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o777)).unwrap();
        assert!(check_auth_dir(&dir, me).is_err());
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o700)).unwrap();
        assert!(check_auth_dir(&dir, me + 1).is_err());
    }

    #[test]
    fn pid_file_refuses_a_live_owner() {
        let tmp = tempfile::TempDir::new().unwrap();
        let p = tmp.path().join("dm.pid");
        fs::write(&p, format!("{}\n", nix::unistd::getppid())).unwrap();
        assert!(acquire_pid_file(&p).is_err());
        fs::write(&p, "999999999\n").unwrap();
        acquire_pid_file(&p).unwrap();
        assert_eq!(fs::read_to_string(&p).unwrap().trim(), std::process::id().to_string());
    }

    #[test]
    fn stale_socket_is_replaced_but_live_one_is_not() {
        let tmp = tempfile::TempDir::new().unwrap();
        let sock = tmp.path().join("run/dm.sock");
        prepare_socket(&sock).unwrap();
        let live = std::os::unix::net::UnixListener::bind(&sock).unwrap();
        assert!(prepare_socket(&sock).is_err());
        drop(live);
        prepare_socket(&sock).unwrap();
        assert!(!sock.exists());
    }
}

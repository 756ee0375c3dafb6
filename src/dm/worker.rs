//! The per-display worker process.
//!
//! The master re-executes its own binary as `displaymaster worker ...` with
//! the IPC pipes on descriptors 3 and 4. The worker owns one display end to
//! end: X server, greeter, session. It reports progress to the master over
//! the pipe protocol and its final outcome through its exit status.

use crate::dm::config::{self, MasterConfig};
use crate::dm::control::ControlError;
use crate::dm::cookie::CookieAuthority;
use crate::dm::display::{Display, DisplayKind, LogoutAction};
use crate::dm::events::dm_event;
use crate::dm::login::{
    Authenticator, CommandAuthenticator, Identity, SessionEnv, build_user_command, run_program, terminate_child,
};
use crate::dm::mux::LineBuffer;
use crate::dm::proto::{AckOutcome, LinkError, MasterLink, Notification, WorkerExit, WorkerMsg};
use crate::dm::server::{ServerController, ServerError, ServerOptions, ServerOutcome};
use crate::dm::signals::{Cancelled, Wake, WorkerSignals};
use anyhow::Context;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::net::IpAddr;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, ExitStatus, Stdio};
use std::time::Duration;

/// Grace period for greeters and sessions when they are stopped.
const CHILD_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, clap::Args)]
pub struct WorkerArgs {
    /// Master config YAML
    #[arg(short = 'c', long = "config")]
    pub config: PathBuf,
    #[arg(long = "display")]
    pub display: u32,
    #[arg(long = "kind", default_value = "static", value_parser = ["static", "flexi", "remote"])]
    pub kind: String,
    #[arg(long = "vt")]
    pub vt: Option<u32>,
    /// Peer host of a remote display
    #[arg(long = "host")]
    pub host: Option<String>,
    #[arg(long = "address")]
    pub addresses: Vec<IpAddr>,
    /// Log this user in without a greeter
    #[arg(long = "autologin")]
    pub autologin: Option<String>,
}

impl WorkerArgs {
    pub fn for_display(config: &Path, d: &Display, autologin: Option<&str>) -> Self {
        Self {
            config: config.to_path_buf(),
            display: d.number,
            kind: kind_name(d.kind).to_string(),
            vt: d.vt,
            host: (d.kind == DisplayKind::Remote).then(|| d.hostname.clone()),
            addresses: d.addresses.clone(),
            autologin: autologin.map(str::to_string),
        }
    }

    /// Arguments after the program name, in the form `displaymaster worker` parses.
    pub fn to_argv(&self) -> Vec<String> {
        let mut argv = vec![
            "worker".to_string(),
            "--config".to_string(),
            self.config.display().to_string(),
            "--display".to_string(),
            self.display.to_string(),
            "--kind".to_string(),
            self.kind.clone(),
        ];
        if let Some(vt) = self.vt {
            argv.extend(["--vt".to_string(), vt.to_string()]);
        }
        if let Some(h) = &self.host {
            argv.extend(["--host".to_string(), h.clone()]);
        }
        for a in &self.addresses {
            argv.extend(["--address".to_string(), a.to_string()]);
        }
        if let Some(u) = &self.autologin {
            argv.extend(["--autologin".to_string(), u.clone()]);
        }
        argv
    }

    /// The worker's own copy of the display it manages.
    pub fn build_display(&self, cfg: &MasterConfig) -> Display {
        match self.kind.as_str() {
            "flexi" => {
                let mut d = Display::new_flexi(self.display);
                d.vt = self.vt;
                d
            }
            "remote" => Display::new_remote(
                self.host.as_deref().unwrap_or("localhost"),
                self.display,
                self.addresses.clone(),
            ),
            _ => {
                let handled = cfg.static_display(self.display).is_none_or(|s| s.handled);
                Display::new_static(self.display, self.vt, handled)
            }
        }
    }
}

fn kind_name(kind: DisplayKind) -> &'static str {
    match kind {
        DisplayKind::Static => "static",
        DisplayKind::Flexi => "flexi",
        DisplayKind::Remote => "remote",
    }
}

/// Lines a greeter writes on its stdout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GreeterRequest {
    /// `LOGIN <user>`: the greeter collected credentials for this user.
    Login(String),
    /// `CONFIGURE`: run the administrative configurator.
    Configure,
    /// `ACTION <HALT|REBOOT|SUSPEND>`: do it now instead of logging in.
    Action(LogoutAction),
    /// `LOGOUT_ACTION <action>`: do it after the session ends.
    LogoutAction(LogoutAction),
    /// `THEME <name>`: the user picked another theme.
    Theme(String),
    Unknown(String),
}

pub fn parse_greeter_line(line: &str) -> GreeterRequest {
    let line = line.trim();
    let (verb, arg) = line.split_once(' ').map(|(v, a)| (v, a.trim())).unwrap_or((line, ""));
    let action = || arg.parse::<LogoutAction>().ok().filter(|a| *a != LogoutAction::None);
    match verb.to_ascii_uppercase().as_str() {
        "LOGIN" if !arg.is_empty() && !arg.contains(char::is_whitespace) => GreeterRequest::Login(arg.to_string()),
        "CONFIGURE" => GreeterRequest::Configure,
        "ACTION" => action().map_or_else(|| GreeterRequest::Unknown(line.to_string()), GreeterRequest::Action),
        "LOGOUT_ACTION" => arg
            .parse::<LogoutAction>()
            .map_or_else(|_| GreeterRequest::Unknown(line.to_string()), GreeterRequest::LogoutAction),
        "THEME" if !arg.is_empty() => GreeterRequest::Theme(arg.to_string()),
        _ => GreeterRequest::Unknown(line.to_string()),
    }
}

fn reply(stdin: &mut ChildStdin, line: String) {
    if let Err(e) = writeln!(stdin, "{line}") {
        tracing::debug!("greeter reply lost: {e}");
    }
}

/// Exit status once the session is over.
pub fn session_exit(action: LogoutAction) -> WorkerExit {
    WorkerExit::for_logout(action).unwrap_or(WorkerExit::Remanage)
}

enum GreeterEnd {
    Login(Identity),
    Exit(WorkerExit),
}

enum Conversation {
    Login(Identity),
    Action(WorkerExit),
    ServerDied,
    GreeterExited(ExitStatus),
}

struct Worker<'a> {
    cfg: &'a MasterConfig,
    signals: &'a WorkerSignals,
    authority: &'a CookieAuthority,
    auth: &'a dyn Authenticator,
    link: MasterLink,
    d: Display,
    server: ServerController<'a>,
    greeter: Option<Child>,
    session: Option<Child>,
    autologin: Option<String>,
    torn_down: bool,
}

impl<'a> Worker<'a> {
    /// Sends a request and returns the master's answer, `None` when it did not answer.
    fn tell(&mut self, msg: WorkerMsg) -> Result<Option<String>, Cancelled> {
        let r = self.link.send(&msg, Some(self.signals.cancel_fd()));
        self.absorb_notifications();
        match r {
            Ok(AckOutcome::Acked(a)) => Ok(Some(a)),
            Ok(AckOutcome::TimedOut) => Ok(None),
            Err(LinkError::Cancelled) => Err(Cancelled),
            Err(LinkError::Io(e)) => {
                tracing::warn!("{}: master pipe: {e}", msg.opcode());
                Ok(None)
            }
        }
    }

    fn absorb_notifications(&mut self) {
        for n in self.link.take_notifications() {
            match n {
                Notification::LogoutAction(a) => {
                    tracing::info!("logout action is now {a}");
                    self.d.logout_action = a;
                }
            }
        }
    }

    fn error_dialog(&mut self, message: String) -> Result<(), Cancelled> {
        tracing::error!("{message}");
        self.tell(WorkerMsg::ShowErrorDialog(message)).map(|_| ())
    }

    fn server_died(&mut self) -> bool {
        self.d.kind != DisplayKind::Remote && self.server.exited()
    }

    fn manage(&mut self) -> Result<WorkerExit, Cancelled> {
        self.signals.check()?;
        if self.d.kind == DisplayKind::Remote {
            if let Some(exit) = self.secure()? {
                return Ok(exit);
            }
            // No local server; the master treats this as attaching.
            self.tell(WorkerMsg::XPid(0))?;
        } else {
            if let Some(exit) = self.start_server()? {
                return Ok(exit);
            }
            self.tell(WorkerMsg::WriteXServers)?;
            if let Some(vt) = self.d.vt {
                self.tell(WorkerMsg::VtNum(vt))?;
            }
        }

        if !self.d.handled {
            return self.wait_for_server_death();
        }

        let autologin = self.autologin.take().and_then(|u| match Identity::lookup(&u) {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!("automatic login for {u} skipped: {e}");
                None
            }
        });
        let id = match autologin {
            Some(id) => {
                dm_event("worker", Some(&self.d.name), format!("autologin user={}", id.name));
                id
            }
            None => match self.run_greeter()? {
                GreeterEnd::Login(id) => id,
                GreeterEnd::Exit(exit) => return Ok(exit),
            },
        };
        self.run_session(id)
    }

    /// Mints the display's cookie and tells the master about it.
    fn secure(&mut self) -> Result<Option<WorkerExit>, Cancelled> {
        if let Err(e) = self.authority.secure_display(&mut self.d) {
            self.error_dialog(format!("Cannot write authorization for display {}: {e}", self.d.name))?;
            return self.give_up(ControlError::StartupErrors, WorkerExit::Abort);
        }
        let hex = self.d.cookie_hex.clone();
        self.tell(WorkerMsg::Cookie(hex))?;
        if let Some(p) = self.d.authfile.clone() {
            self.tell(WorkerMsg::AuthFile(p.display().to_string()))?;
        }
        Ok(None)
    }

    fn give_up(&mut self, why: ControlError, exit: WorkerExit) -> Result<Option<WorkerExit>, Cancelled> {
        if self.d.kind == DisplayKind::Flexi {
            self.tell(WorkerMsg::FlexiErr(why.code()))?;
        }
        Ok(Some(exit))
    }

    /// Bounded start loop. `None` means the server is running.
    fn start_server(&mut self) -> Result<Option<WorkerExit>, Cancelled> {
        let attempts = self.cfg.daemon.server_attempts.max(1);
        let failsafe_cmd = self.cfg.daemon.failsafe_server_command.clone();
        let mut failures = 0u32;
        let mut renumbers = 0u32;
        let mut on_failsafe = false;

        loop {
            if let Some(exit) = self.secure()? {
                return Ok(Some(exit));
            }
            match self.server.start(&mut self.d) {
                Ok(ServerOutcome::Running) => {
                    let pid = self.server.pid().unwrap_or(0);
                    dm_event("server", Some(&self.d.name), format!("running pid={pid}"));
                    self.tell(WorkerMsg::XPid(pid))?;
                    if self.d.kind == DisplayKind::Flexi {
                        self.tell(WorkerMsg::FlexiOk)?;
                    }
                    return Ok(None);
                }
                Ok(o) => tracing::warn!("server start ended with {o:?}"),
                Err(ServerError::Cancelled(c)) => return Err(c),
                Err(ServerError::Busy { number, pid }) => {
                    let same = self.d.kind == DisplayKind::Static
                        && self.ask_yes_no(format!(
                            "Display :{number} is busy (held by pid {pid}). Keep trying on the same number?"
                        ))?;
                    if same {
                        self.signals.sleep(Duration::from_secs(2))?;
                    } else {
                        renumbers += 1;
                        if renumbers > self.cfg.daemon.flexi_retries || !self.move_to_free_number()? {
                            self.error_dialog(format!("No free display number after {}", self.d.name))?;
                            return self.give_up(ControlError::XTooBusy, WorkerExit::Abort);
                        }
                        continue;
                    }
                }
                Err(ServerError::NoBinary(bin)) => {
                    if on_failsafe || failsafe_cmd.is_none() {
                        self.error_dialog(format!("The X server binary {bin} does not exist"))?;
                        return self.give_up(ControlError::NoServerBinary, WorkerExit::Abort);
                    }
                    tracing::warn!("server binary {bin} missing; trying the failsafe server");
                    failures = attempts;
                }
                Err(e) => tracing::warn!("server start failed: {e}"),
            }
            failures = failures.saturating_add(1);
            if failures < attempts {
                self.signals.sleep(Duration::from_secs(1))?;
                continue;
            }
            match (&failsafe_cmd, on_failsafe) {
                (Some(cmd), false) => {
                    dm_event("server", Some(&self.d.name), "switching to the failsafe server");
                    self.server.opts.command = cmd.clone();
                    on_failsafe = true;
                    failures = 0;
                }
                _ => {
                    self.error_dialog(format!("The X server for display {} could not be started", self.d.name))?;
                    return self.give_up(ControlError::XFailed, WorkerExit::ServerFailed);
                }
            }
        }
    }

    fn ask_yes_no(&mut self, question: String) -> Result<bool, Cancelled> {
        Ok(self
            .tell(WorkerMsg::ShowYesNoDialog(question))?
            .is_some_and(|a| a.eq_ignore_ascii_case("YES")))
    }

    /// Asks the master for the next free number and moves the display there.
    fn move_to_free_number(&mut self) -> Result<bool, Cancelled> {
        let mut candidate = self.d.number + 1;
        for _ in 0..=self.cfg.daemon.flexi_retries {
            if candidate >= config::MAX_DISPLAY_NUMBER {
                return Ok(false);
            }
            match self.tell(WorkerMsg::DispNum(candidate))?.as_deref() {
                Some("OK") => {
                    self.authority.purge_display_entries(&mut self.d);
                    tracing::info!("moving {} to :{candidate}", self.d.name);
                    self.d.number = candidate;
                    self.d.name = format!(":{candidate}");
                    return Ok(true);
                }
                Some(_) => candidate += 1,
                None => return Ok(false),
            }
        }
        Ok(false)
    }

    fn wait_for_server_death(&mut self) -> Result<WorkerExit, Cancelled> {
        loop {
            match self.signals.wait(&[self.link.master_fd()], Some(Duration::from_secs(5)))? {
                Wake::Fd(_) => self.absorb_notifications(),
                _ => {
                    if self.server_died() {
                        dm_event("server", Some(&self.d.name), "server exited");
                        return Ok(WorkerExit::Remanage);
                    }
                }
            }
        }
    }

    fn display_env(&self) -> SessionEnv {
        let auth = self
            .d
            .authfile_server
            .clone()
            .or_else(|| self.d.authfile.clone())
            .unwrap_or_default();
        SessionEnv::for_display(&self.d, &auth)
    }

    fn log_file(&self, suffix: &str) -> io::Result<File> {
        std::fs::create_dir_all(&self.cfg.daemon.log_dir)?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.cfg.daemon.log_dir.join(format!("{}-{suffix}.log", self.d.name)))
    }

    fn spawn_greeter(&self, theme: &str) -> anyhow::Result<Child> {
        let mut argv = self.cfg.daemon.greeter_command.clone();
        argv.extend(["--display".to_string(), self.d.name.clone(), "--theme".to_string(), theme.to_string()]);
        let mut env = self.display_env();
        env.set("DM_GREETER_THEME", theme);
        let mut cmd = build_user_command(&argv, self.server.opts.run_as.as_ref(), &env, Path::new("/"))?;
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::from(self.log_file("greeter")?));
        cmd.spawn().with_context(|| format!("failed to spawn greeter {}", argv[0]))
    }

    fn run_greeter(&mut self) -> Result<GreeterEnd, Cancelled> {
        let default_theme = self.cfg.daemon.greeter_theme.clone();
        let mut theme = self.d.theme.clone().unwrap_or_else(|| default_theme.clone());
        let mut theme_retried = false;
        loop {
            let mut child = match self.spawn_greeter(&theme) {
                Ok(c) => c,
                Err(e) => {
                    tracing::error!("{e:#}");
                    return Ok(GreeterEnd::Exit(WorkerExit::GreeterFailed));
                }
            };
            let (Some(stdout), Some(stdin)) = (child.stdout.take(), child.stdin.take()) else {
                terminate_child(&mut child, CHILD_GRACE);
                return Ok(GreeterEnd::Exit(WorkerExit::GreeterFailed));
            };
            let pid = child.id() as i32;
            self.greeter = Some(child);
            self.tell(WorkerMsg::GreetPid(pid))?;

            let conv = self.converse(stdout, stdin, &mut theme)?;
            let status = match conv {
                Conversation::GreeterExited(status) => Some(status),
                _ => {
                    if let Some(mut g) = self.greeter.take() {
                        terminate_child(&mut g, CHILD_GRACE);
                    }
                    None
                }
            };
            self.greeter = None;
            self.tell(WorkerMsg::GreetPid(0))?;
            match conv {
                Conversation::Login(id) => return Ok(GreeterEnd::Login(id)),
                Conversation::Action(exit) => return Ok(GreeterEnd::Exit(exit)),
                Conversation::ServerDied => return Ok(GreeterEnd::Exit(WorkerExit::Remanage)),
                Conversation::GreeterExited(_) => {}
            }
            let status = status.map(|s| s.success()).unwrap_or(false);
            if status {
                return Ok(GreeterEnd::Exit(WorkerExit::RestartGreeter));
            }
            if !theme_retried && theme != default_theme {
                tracing::warn!("greeter failed with theme {theme}; retrying with {default_theme}");
                theme_retried = true;
                theme = default_theme.clone();
                self.d.theme = None;
                self.tell(WorkerMsg::ChosenTheme(default_theme.clone()))?;
                continue;
            }
            dm_event("greeter", Some(&self.d.name), "greeter failed");
            return Ok(GreeterEnd::Exit(WorkerExit::GreeterFailed));
        }
    }

    fn converse(
        &mut self,
        mut stdout: ChildStdout,
        mut stdin: ChildStdin,
        theme: &mut String,
    ) -> Result<Conversation, Cancelled> {
        let _ = crate::dm::proto::set_nonblocking(stdout.as_raw_fd());
        let mut lines = LineBuffer::new();
        let mut eof = false;
        loop {
            let fds = if eof {
                vec![self.link.master_fd()]
            } else {
                vec![self.link.master_fd(), stdout.as_raw_fd()]
            };
            match self.signals.wait(&fds, Some(Duration::from_secs(1)))? {
                Wake::Fd(0) => self.absorb_notifications(),
                Wake::Fd(_) => {
                    let mut buf = [0u8; 1024];
                    match stdout.read(&mut buf) {
                        Ok(0) => eof = true,
                        Ok(n) => {
                            for line in lines.push(&buf[..n]) {
                                if let Some(done) = self.greeter_request(parse_greeter_line(&line), &mut stdin, theme)? {
                                    return Ok(done);
                                }
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(_) => eof = true,
                    }
                }
                _ => {}
            }
            if self.server_died() {
                dm_event("server", Some(&self.d.name), "server died under the greeter");
                return Ok(Conversation::ServerDied);
            }
            if let Some(g) = self.greeter.as_mut()
                && let Ok(Some(status)) = g.try_wait()
            {
                return Ok(Conversation::GreeterExited(status));
            }
        }
    }

    fn greeter_request(
        &mut self,
        req: GreeterRequest,
        stdin: &mut ChildStdin,
        theme: &mut String,
    ) -> Result<Option<Conversation>, Cancelled> {
        match req {
            GreeterRequest::Login(user) => match self.auth.verify(&self.d, &user) {
                Ok(id) => {
                    let elsewhere = self.tell(WorkerMsg::QueryLogin(user.clone()))?.unwrap_or_default();
                    if let Some(target) = elsewhere.split(';').filter_map(|e| e.split(',').next()).find(|n| !n.is_empty())
                    {
                        self.tell(WorkerMsg::Migrate(target.to_string()))?;
                        reply(stdin, format!("FAIL {user} already has a session on {target}"));
                        return Ok(None);
                    }
                    reply(stdin, "OK".to_string());
                    dm_event("worker", Some(&self.d.name), format!("login user={user}"));
                    Ok(Some(Conversation::Login(id)))
                }
                Err(e) => {
                    tracing::info!("login for {user} refused: {e}");
                    reply(stdin, format!("FAIL {e}"));
                    Ok(None)
                }
            },
            GreeterRequest::Configure => {
                let Some(cmd) = self.cfg.daemon.configurator_command.clone() else {
                    reply(stdin, "FAIL no configurator".to_string());
                    return Ok(None);
                };
                self.tell(WorkerMsg::Configuring(true))?;
                let root_env = {
                    let auth = self.d.authfile.clone().unwrap_or_default();
                    SessionEnv::for_display(&self.d, &auth)
                };
                let r = self.script(&cmd, None, &root_env);
                self.tell(WorkerMsg::Configuring(false))?;
                let ok = r?.is_some_and(|s| s.success());
                reply(stdin, if ok { "OK".to_string() } else { "FAIL configurator failed".to_string() });
                Ok(None)
            }
            GreeterRequest::Action(a) => {
                reply(stdin, "OK".to_string());
                Ok(Some(Conversation::Action(session_exit(a))))
            }
            GreeterRequest::LogoutAction(a) => {
                self.d.logout_action = a;
                self.tell(WorkerMsg::SetLogoutAction(a))?;
                reply(stdin, "OK".to_string());
                Ok(None)
            }
            GreeterRequest::Theme(t) => {
                self.tell(WorkerMsg::ChosenTheme(t.clone()))?;
                self.d.theme = Some(t.clone());
                *theme = t;
                reply(stdin, "OK".to_string());
                Ok(None)
            }
            GreeterRequest::Unknown(line) => {
                tracing::warn!("greeter sent {line:?}");
                reply(stdin, "FAIL unknown request".to_string());
                Ok(None)
            }
        }
    }

    /// Runs a helper script; `None` when it could not be started.
    fn script(
        &self,
        argv: &[String],
        identity: Option<&Identity>,
        env: &SessionEnv,
    ) -> Result<Option<ExitStatus>, Cancelled> {
        let run_as = identity.map(Identity::run_as);
        let cwd = identity.map(|i| i.home.clone()).unwrap_or_else(|| PathBuf::from("/"));
        match run_program(self.signals, argv, run_as.as_ref(), env, &cwd) {
            Ok(status) => Ok(Some(status)),
            Err(e) if e.downcast_ref::<Cancelled>().is_some() => Err(Cancelled),
            Err(e) => {
                tracing::warn!("{e:#}");
                Ok(None)
            }
        }
    }

    fn run_session(&mut self, id: Identity) -> Result<WorkerExit, Cancelled> {
        let grant = match self.authority.grant(&mut self.d, id.uid, id.gid, &id.home) {
            Ok(g) => g,
            Err(e) => {
                self.error_dialog(format!("Cannot set up authorization for {}: {e}", id.name))?;
                return Ok(WorkerExit::Remanage);
            }
        };
        if grant.fallback {
            tracing::info!("user {} gets private authority file {}", id.name, grant.path.display());
        }
        let env = self.auth.setup_session_environment(&id, &self.d, &grant.path);

        if let Some(pre) = self.cfg.daemon.pre_session_command.clone() {
            match self.script(&pre, None, &env)? {
                Some(s) if s.success() => {}
                other => {
                    tracing::warn!("pre-session script refused {} ({other:?})", id.name);
                    self.revoke_user();
                    return Ok(WorkerExit::Remanage);
                }
            }
        }

        let spawned = self.log_file("session").map_err(anyhow::Error::from).and_then(|log| {
            let mut cmd = build_user_command(&self.cfg.daemon.session_command, Some(&id.run_as()), &env, &id.home)?;
            cmd.stdin(Stdio::null())
                .stdout(Stdio::from(log.try_clone()?))
                .stderr(Stdio::from(log));
            Ok(cmd.spawn()?)
        });
        let child = match spawned {
            Ok(c) => c,
            Err(e) => {
                self.revoke_user();
                self.error_dialog(format!("Cannot start the session for {}: {e:#}", id.name))?;
                return Ok(WorkerExit::Remanage);
            }
        };
        let pid = child.id() as i32;
        self.session = Some(child);
        self.d.login = Some(id.name.clone());
        dm_event("session", Some(&self.d.name), format!("started user={} pid={pid}", id.name));
        self.tell(WorkerMsg::SessPid(pid))?;
        self.tell(WorkerMsg::Login(id.name.clone()))?;
        self.tell(WorkerMsg::LoggedIn(true))?;

        let server_died = self.wait_session()?;
        if let Some(mut s) = self.session.take() {
            let status = terminate_child(&mut s, CHILD_GRACE);
            dm_event("session", Some(&self.d.name), format!("ended user={} status={status:?}", id.name));
        }
        self.d.login = None;
        self.tell(WorkerMsg::LoggedIn(false))?;
        self.tell(WorkerMsg::SessPid(0))?;

        if let Some(post) = self.cfg.daemon.post_session_command.clone()
            && let Some(status) = self.script(&post, None, &env)?
            && !status.success()
        {
            tracing::warn!("post-session script ended with {status}");
        }
        self.revoke_user();

        if server_died {
            return Ok(WorkerExit::Remanage);
        }
        Ok(session_exit(self.d.logout_action))
    }

    /// Blocks until the session ends. `true` when the server went first.
    fn wait_session(&mut self) -> Result<bool, Cancelled> {
        loop {
            match self.signals.wait(&[self.link.master_fd()], Some(Duration::from_secs(5)))? {
                Wake::Fd(_) => self.absorb_notifications(),
                _ => {
                    if let Some(s) = self.session.as_mut()
                        && !matches!(s.try_wait(), Ok(None))
                    {
                        return Ok(false);
                    }
                    if self.server_died() {
                        dm_event("server", Some(&self.d.name), "server died under the session");
                        return Ok(true);
                    }
                }
            }
        }
    }

    fn revoke_user(&mut self) {
        if let Err(e) = self.authority.revoke(&mut self.d) {
            tracing::warn!("revoke failed: {e}");
        }
    }

    /// Stops everything this worker started. Runs once, never waits on signals.
    fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        if let Some(mut s) = self.session.take() {
            terminate_child(&mut s, CHILD_GRACE);
        }
        if let Some(mut g) = self.greeter.take() {
            terminate_child(&mut g, CHILD_GRACE);
        }
        self.revoke_user();
        self.server.stop(&mut self.d);
        self.authority.purge_display_entries(&mut self.d);
        tracing::debug!("teardown complete");
    }
}

impl Drop for Worker<'_> {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Entry point of `displaymaster worker`. Returns the outcome to exit with.
pub fn run_worker(args: &WorkerArgs) -> anyhow::Result<WorkerExit> {
    let cfg = config::load_master_config(&args.config)?;
    let signals = WorkerSignals::install().context("install worker signal handlers")?;
    let link = MasterLink::from_inherited().context("adopt master pipes")?;
    let authority = CookieAuthority::from_config(&cfg.daemon)?;
    let auth = CommandAuthenticator::new(cfg.daemon.verify_command.clone());
    let display = args.build_display(&cfg);
    let opts = ServerOptions::from_config(&cfg, display.number)?;

    let display_name = &display.name;
    let span = tracing::info_span!("worker", display = %display_name);
    let _enter = span.enter();
    Ok(manage_display(
        &cfg,
        &signals,
        &authority,
        &auth,
        link,
        display,
        opts,
        args.autologin.clone(),
    ))
}

/// Manages `display` until it ends; teardown has run when this returns.
#[allow(clippy::too_many_arguments)]
pub fn manage_display(
    cfg: &MasterConfig,
    signals: &WorkerSignals,
    authority: &CookieAuthority,
    auth: &dyn Authenticator,
    link: MasterLink,
    display: Display,
    opts: ServerOptions,
    autologin: Option<String>,
) -> WorkerExit {
    let mut w = Worker {
        cfg,
        signals,
        authority,
        auth,
        link,
        d: display,
        server: ServerController::new(signals, authority, opts),
        greeter: None,
        session: None,
        autologin,
        torn_down: false,
    };
    let outcome = w.manage();
    w.teardown();
    match outcome {
        Ok(exit) => {
            tracing::info!("display {} done: {exit:?}", w.d.name);
            exit
        }
        Err(Cancelled) => {
            tracing::info!("display {} cancelled", w.d.name);
            WorkerExit::Abort
        }
    }
}

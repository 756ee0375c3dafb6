//! Master/worker pipe protocol.
//!
//! Worker to master: `OPCODE <pid> <args>\n`. Text arguments are escaped so
//! they stay on one line; multi-field text uses TAB between fields.
//!
//! Master to worker: either an ack `A<payload>\n` answering the worker's
//! single outstanding request, or an unsolicited notification
//! `!KEY value\n`. Every write is followed by `SIGUSR2` to the reader.

use crate::dm::display::LogoutAction;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

/// Descriptor the worker reads master messages from.
pub const WORKER_FROM_MASTER_FD: RawFd = 3;
/// Descriptor the worker writes its requests to.
pub const WORKER_TO_MASTER_FD: RawFd = 4;

/// One-second polls spent waiting for an ordinary ack.
pub const ACK_POLLS: u32 = 10;

/// Exit status a worker reports its outcome with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Remanage,
    Abort,
    Reboot,
    Halt,
    Suspend,
    ServerFailed,
    GreeterFailed,
    RestartGreeter,
    RestartDaemon,
}

impl WorkerExit {
    pub fn code(self) -> i32 {
        match self {
            WorkerExit::Remanage => 2,
            WorkerExit::Abort => 4,
            WorkerExit::Reboot => 8,
            WorkerExit::Halt => 16,
            WorkerExit::Suspend => 17,
            WorkerExit::ServerFailed => 64,
            WorkerExit::GreeterFailed => 65,
            WorkerExit::RestartGreeter => 127,
            WorkerExit::RestartDaemon => 128,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            2 => WorkerExit::Remanage,
            4 => WorkerExit::Abort,
            8 => WorkerExit::Reboot,
            16 => WorkerExit::Halt,
            17 => WorkerExit::Suspend,
            64 => WorkerExit::ServerFailed,
            65 => WorkerExit::GreeterFailed,
            127 => WorkerExit::RestartGreeter,
            128 => WorkerExit::RestartDaemon,
            _ => return None,
        })
    }

    pub fn for_logout(action: LogoutAction) -> Option<Self> {
        match action {
            LogoutAction::None => None,
            LogoutAction::Halt => Some(WorkerExit::Halt),
            LogoutAction::Reboot => Some(WorkerExit::Reboot),
            LogoutAction::Suspend => Some(WorkerExit::Suspend),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtoError {
    #[error("empty message")]
    Empty,
    #[error("unknown opcode {0:?}")]
    UnknownOpcode(String),
    #[error("{0}: missing sender pid")]
    MissingPid(String),
    #[error("{opcode}: bad sender pid {pid:?}")]
    BadPid { opcode: String, pid: String },
    #[error("{opcode}: bad argument {arg:?}")]
    BadArg { opcode: String, arg: String },
    #[error("bad escape sequence in {0:?}")]
    BadEscape(String),
    #[error("unknown master message {0:?}")]
    BadMasterLine(String),
}

/// Requests and reports a worker sends its master.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerMsg {
    XPid(i32),
    SessPid(i32),
    GreetPid(i32),
    LoggedIn(bool),
    Login(String),
    /// The worker moved to another display number; acked `OK` or `BUSY`.
    DispNum(u32),
    VtNum(u32),
    Cookie(String),
    AuthFile(String),
    FlexiErr(u32),
    FlexiOk,
    WriteXServers,
    Configuring(bool),
    SetLogoutAction(LogoutAction),
    /// Which displays does this user already have sessions on? Ack: `name,vt;...`.
    QueryLogin(String),
    /// Switch to the display that already has this user's session.
    Migrate(String),
    ChosenTheme(String),
    ShowErrorDialog(String),
    ShowYesNoDialog(String),
    ShowQuestionDialog(String),
    ShowAskButtonsDialog { message: String, buttons: Vec<String> },
}

impl WorkerMsg {
    pub fn opcode(&self) -> &'static str {
        match self {
            WorkerMsg::XPid(_) => "XPID",
            WorkerMsg::SessPid(_) => "SESSPID",
            WorkerMsg::GreetPid(_) => "GREETPID",
            WorkerMsg::LoggedIn(_) => "LOGGED_IN",
            WorkerMsg::Login(_) => "LOGIN",
            WorkerMsg::DispNum(_) => "DISP_NUM",
            WorkerMsg::VtNum(_) => "VT_NUM",
            WorkerMsg::Cookie(_) => "COOKIE",
            WorkerMsg::AuthFile(_) => "AUTHFILE",
            WorkerMsg::FlexiErr(_) => "FLEXI_ERR",
            WorkerMsg::FlexiOk => "FLEXI_OK",
            WorkerMsg::WriteXServers => "WRITE_X_SERVERS",
            WorkerMsg::Configuring(_) => "CONFIGURING",
            WorkerMsg::SetLogoutAction(_) => "SET_LOGOUT_ACTION",
            WorkerMsg::QueryLogin(_) => "QUERYLOGIN",
            WorkerMsg::Migrate(_) => "MIGRATE",
            WorkerMsg::ChosenTheme(_) => "CHOSEN_THEME",
            WorkerMsg::ShowErrorDialog(_) => "SHOW_ERROR_DIALOG",
            WorkerMsg::ShowYesNoDialog(_) => "SHOW_YESNO_DIALOG",
            WorkerMsg::ShowQuestionDialog(_) => "SHOW_QUESTION_DIALOG",
            WorkerMsg::ShowAskButtonsDialog { .. } => "SHOW_ASKBUTTONS_DIALOG",
        }
    }

    /// Dialog requests block until the user answers.
    pub fn is_modal(&self) -> bool {
        matches!(
            self,
            WorkerMsg::ShowErrorDialog(_)
                | WorkerMsg::ShowYesNoDialog(_)
                | WorkerMsg::ShowQuestionDialog(_)
                | WorkerMsg::ShowAskButtonsDialog { .. }
        )
    }

    pub fn encode(&self, pid: i32) -> String {
        let args = match self {
            WorkerMsg::XPid(p) | WorkerMsg::SessPid(p) | WorkerMsg::GreetPid(p) => p.to_string(),
            WorkerMsg::LoggedIn(b) | WorkerMsg::Configuring(b) => u8::from(*b).to_string(),
            WorkerMsg::DispNum(n) | WorkerMsg::VtNum(n) | WorkerMsg::FlexiErr(n) => n.to_string(),
            WorkerMsg::FlexiOk | WorkerMsg::WriteXServers => String::new(),
            WorkerMsg::SetLogoutAction(a) => a.as_str().to_string(),
            WorkerMsg::Login(s)
            | WorkerMsg::Cookie(s)
            | WorkerMsg::AuthFile(s)
            | WorkerMsg::QueryLogin(s)
            | WorkerMsg::Migrate(s)
            | WorkerMsg::ChosenTheme(s)
            | WorkerMsg::ShowErrorDialog(s)
            | WorkerMsg::ShowYesNoDialog(s)
            | WorkerMsg::ShowQuestionDialog(s) => escape(s),
            WorkerMsg::ShowAskButtonsDialog { message, buttons } => std::iter::once(message)
                .chain(buttons.iter())
                .map(|s| escape(s))
                .collect::<Vec<_>>()
                .join("\t"),
        };
        if args.is_empty() {
            format!("{} {pid}", self.opcode())
        } else {
            format!("{} {pid} {args}", self.opcode())
        }
    }

    /// Parses one line (without its newline) into sender pid and message.
    pub fn decode(line: &str) -> Result<(i32, WorkerMsg), ProtoError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return Err(ProtoError::Empty);
        }
        let (opcode, rest) = line.split_once(' ').unwrap_or((line, ""));
        let (pid_s, args) = rest.split_once(' ').unwrap_or((rest, ""));
        if pid_s.is_empty() {
            return Err(ProtoError::MissingPid(opcode.to_string()));
        }
        let pid: i32 = pid_s.parse().map_err(|_| ProtoError::BadPid {
            opcode: opcode.to_string(),
            pid: pid_s.to_string(),
        })?;
        let bad = || ProtoError::BadArg {
            opcode: opcode.to_string(),
            arg: args.to_string(),
        };
        let int = |s: &str| s.trim().parse::<i32>().map_err(|_| bad());
        let uint = |s: &str| s.trim().parse::<u32>().map_err(|_| bad());
        let flag = |s: &str| match s.trim() {
            "0" => Ok(false),
            "1" => Ok(true),
            _ => Err(bad()),
        };
        let msg = match opcode {
            "XPID" => WorkerMsg::XPid(int(args)?),
            "SESSPID" => WorkerMsg::SessPid(int(args)?),
            "GREETPID" => WorkerMsg::GreetPid(int(args)?),
            "LOGGED_IN" => WorkerMsg::LoggedIn(flag(args)?),
            "LOGIN" => WorkerMsg::Login(unescape(args)?),
            "DISP_NUM" => WorkerMsg::DispNum(uint(args)?),
            "VT_NUM" => WorkerMsg::VtNum(uint(args)?),
            "COOKIE" => WorkerMsg::Cookie(unescape(args)?),
            "AUTHFILE" => WorkerMsg::AuthFile(unescape(args)?),
            "FLEXI_ERR" => WorkerMsg::FlexiErr(uint(args)?),
            "FLEXI_OK" => WorkerMsg::FlexiOk,
            "WRITE_X_SERVERS" => WorkerMsg::WriteXServers,
            "CONFIGURING" => WorkerMsg::Configuring(flag(args)?),
            "SET_LOGOUT_ACTION" => {
                WorkerMsg::SetLogoutAction(args.parse::<LogoutAction>().map_err(|_| bad())?)
            }
            "QUERYLOGIN" => WorkerMsg::QueryLogin(unescape(args)?),
            "MIGRATE" => WorkerMsg::Migrate(unescape(args)?),
            "CHOSEN_THEME" => WorkerMsg::ChosenTheme(unescape(args)?),
            "SHOW_ERROR_DIALOG" => WorkerMsg::ShowErrorDialog(unescape(args)?),
            "SHOW_YESNO_DIALOG" => WorkerMsg::ShowYesNoDialog(unescape(args)?),
            "SHOW_QUESTION_DIALOG" => WorkerMsg::ShowQuestionDialog(unescape(args)?),
            "SHOW_ASKBUTTONS_DIALOG" => {
                let mut fields = args.split('\t').map(unescape);
                let message = fields.next().transpose()?.unwrap_or_default();
                let buttons = fields.collect::<Result<Vec<_>, _>>()?;
                WorkerMsg::ShowAskButtonsDialog { message, buttons }
            }
            other => return Err(ProtoError::UnknownOpcode(other.to_string())),
        };
        Ok((pid, msg))
    }
}

pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => {}
            c => out.push(c),
        }
    }
    out
}

pub fn unescape(s: &str) -> Result<String, ProtoError> {
    let mut out = String::with_capacity(s.len());
    let mut it = s.chars();
    while let Some(c) = it.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match it.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            _ => return Err(ProtoError::BadEscape(s.to_string())),
        }
    }
    Ok(out)
}

/// Unsolicited master-to-worker messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    LogoutAction(LogoutAction),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MasterMsg {
    Ack(String),
    Notify(Notification),
}

impl MasterMsg {
    pub fn encode(&self) -> String {
        match self {
            MasterMsg::Ack(payload) => format!("A{}", escape(payload)),
            MasterMsg::Notify(Notification::LogoutAction(a)) => format!("!LOGOUT_ACTION {}", a.as_str()),
        }
    }

    pub fn decode(line: &str) -> Result<MasterMsg, ProtoError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if let Some(payload) = line.strip_prefix('A') {
            return Ok(MasterMsg::Ack(unescape(payload)?));
        }
        if let Some(rest) = line.strip_prefix('!') {
            let (key, value) = rest.split_once(' ').unwrap_or((rest, ""));
            if key == "LOGOUT_ACTION"
                && let Ok(a) = value.parse::<LogoutAction>()
            {
                return Ok(MasterMsg::Notify(Notification::LogoutAction(a)));
            }
        }
        Err(ProtoError::BadMasterLine(line.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    Acked(String),
    /// The master did not answer in time; the worker carries on.
    TimedOut,
}

impl AckOutcome {
    pub fn payload(&self) -> Option<&str> {
        match self {
            AckOutcome::Acked(p) => Some(p),
            AckOutcome::TimedOut => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("cancelled")]
    Cancelled,
    #[error("master pipe: {0}")]
    Io(#[from] io::Error),
}

/// Worker end of the pipe pair.
pub struct MasterLink {
    to_master: File,
    from_master: File,
    /// Signalled after each write; `None` skips signalling.
    master_pid: Option<Pid>,
    my_pid: i32,
    buf: Vec<u8>,
    notifications: VecDeque<Notification>,
    ack_polls: u32,
}

impl MasterLink {
    pub fn new(to_master: OwnedFd, from_master: OwnedFd, master_pid: Option<i32>) -> io::Result<Self> {
        set_nonblocking(from_master.as_raw_fd())?;
        Ok(Self {
            to_master: File::from(to_master),
            from_master: File::from(from_master),
            master_pid: master_pid.map(Pid::from_raw),
            my_pid: std::process::id() as i32,
            buf: Vec::new(),
            notifications: VecDeque::new(),
            ack_polls: ACK_POLLS,
        })
    }

    /// Adopts descriptors 3 and 4 set up by the master before exec.
    pub fn from_inherited() -> io::Result<Self> {
        for fd in [WORKER_FROM_MASTER_FD, WORKER_TO_MASTER_FD] {
            if unsafe { libc::fcntl(fd, libc::F_GETFD) } < 0 {
                return Err(io::Error::other(format!("ipc descriptor {fd} is not open")));
            }
        }
        // SAFETY: both descriptors are open and owned by nobody else in this process.
        let (from, to) = unsafe {
            (
                OwnedFd::from_raw_fd(WORKER_FROM_MASTER_FD),
                OwnedFd::from_raw_fd(WORKER_TO_MASTER_FD),
            )
        };
        let ppid = nix::unistd::getppid().as_raw();
        Self::new(to, from, Some(ppid))
    }

    pub fn set_ack_polls(&mut self, polls: u32) {
        self.ack_polls = polls;
    }

    pub fn master_fd(&self) -> RawFd {
        self.from_master.as_raw_fd()
    }

    /// Sends `msg` and waits for its ack. `cancel` becoming readable aborts the wait.
    pub fn send(&mut self, msg: &WorkerMsg, cancel: Option<RawFd>) -> Result<AckOutcome, LinkError> {
        // A late ack from a request that timed out must not answer this one.
        let _ = self.drain(true)?;

        let line = msg.encode(self.my_pid);
        tracing::debug!("ipc send {line}");
        let mut out = line.into_bytes();
        out.push(b'\n');
        self.to_master.write_all(&out)?;
        if let Some(pid) = self.master_pid {
            let _ = kill(pid, Signal::SIGUSR2);
        }

        let mut polls = 0u32;
        loop {
            if let Some(ack) = self.drain(false)? {
                return Ok(AckOutcome::Acked(ack));
            }
            if !msg.is_modal() && polls >= self.ack_polls {
                tracing::warn!("ipc {}: no ack from master, continuing", msg.opcode());
                return Ok(AckOutcome::TimedOut);
            }
            polls += 1;
            match poll_two(self.from_master.as_raw_fd(), cancel, Duration::from_secs(1))? {
                Ready::Cancel => return Err(LinkError::Cancelled),
                Ready::Data | Ready::Timeout => {}
            }
        }
    }

    /// Reads what is available. Notifications are queued; the first ack is returned
    /// unless `discard_acks` is set.
    pub fn drain(&mut self, discard_acks: bool) -> io::Result<Option<String>> {
        let mut chunk = [0u8; 512];
        loop {
            match self.from_master.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1]).into_owned();
            match MasterMsg::decode(&line) {
                Ok(MasterMsg::Notify(n)) => self.notifications.push_back(n),
                Ok(MasterMsg::Ack(a)) if !discard_acks => return Ok(Some(a)),
                Ok(MasterMsg::Ack(a)) => tracing::debug!("ipc dropping stale ack {a:?}"),
                Err(e) => tracing::warn!("ipc: {e}"),
            }
        }
        Ok(None)
    }

    pub fn take_notifications(&mut self) -> Vec<Notification> {
        let _ = self.drain(true);
        self.notifications.drain(..).collect()
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Ready {
    Data,
    Cancel,
    Timeout,
}

fn poll_two(fd: RawFd, cancel: Option<RawFd>, timeout: Duration) -> io::Result<Ready> {
    let mut fds = vec![libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    }];
    if let Some(c) = cancel {
        fds.push(libc::pollfd {
            fd: c,
            events: libc::POLLIN,
            revents: 0,
        });
    }
    let r = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout.as_millis() as i32) };
    if r < 0 {
        let e = io::Error::last_os_error();
        if e.kind() == io::ErrorKind::Interrupted {
            return Ok(Ready::Timeout);
        }
        return Err(e);
    }
    if fds.len() > 1 && fds[1].revents != 0 {
        return Ok(Ready::Cancel);
    }
    if fds[0].revents != 0 {
        return Ok(Ready::Data);
    }
    Ok(Ready::Timeout)
}

pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    use nix::fcntl::{FcntlArg, OFlag, fcntl};
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

/// Bytes a stuck worker may have queued on the master side before new lines are dropped.
pub const MAX_PENDING: usize = 64 * 1024;

/// Master end of one worker's pipe: acks and notifications go out here.
///
/// The pipe is non-blocking. Whatever the pipe does not take stays queued
/// and goes out in order on the next send or [`WorkerChannel::flush`], so a
/// line is never cut.
pub struct WorkerChannel {
    pub worker_pid: i32,
    to_worker: File,
    pending: Vec<u8>,
}

impl WorkerChannel {
    pub fn new(worker_pid: i32, to_worker: OwnedFd) -> io::Result<Self> {
        set_nonblocking(to_worker.as_raw_fd())?;
        Ok(Self {
            worker_pid,
            to_worker: File::from(to_worker),
            pending: Vec::new(),
        })
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Writes as much of the queue as the pipe takes. `true` once it is empty.
    pub fn flush(&mut self) -> io::Result<bool> {
        while !self.pending.is_empty() {
            match self.to_worker.write(&self.pending) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => {
                    self.pending.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    pub fn send(&mut self, msg: &MasterMsg) -> io::Result<()> {
        let mut out = msg.encode().into_bytes();
        out.push(b'\n');
        // Never block the master on a stuck worker.
        if self.pending.len() + out.len() > MAX_PENDING {
            tracing::warn!("worker {} pipe backed up; dropped {:?}", self.worker_pid, msg);
            return Ok(());
        }
        self.pending.extend_from_slice(&out);
        if !self.flush()? {
            tracing::debug!("worker {} pipe full; {} bytes queued", self.worker_pid, self.pending.len());
        }
        if self.worker_pid > 0 {
            let _ = kill(Pid::from_raw(self.worker_pid), Signal::SIGUSR2);
        }
        Ok(())
    }

    pub fn ack(&mut self, payload: &str) -> io::Result<()> {
        self.send(&MasterMsg::Ack(payload.to_string()))
    }

    pub fn notify(&mut self, n: Notification) -> io::Result<()> {
        self.send(&MasterMsg::Notify(n))
    }
}

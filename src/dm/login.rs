//! Capabilities the worker borrows from outside the core: credential
//! verification, the session environment, dialog helpers and plain program
//! runs under a given identity.

use crate::dm::display::Display;
use crate::dm::proto::WorkerMsg;
use crate::dm::server::RunAs;
use crate::dm::signals::{Cancelled, WorkerSignals};
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::{Pid, setsid};
use std::collections::BTreeMap;
use std::ffi::CString;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use users::os::unix::UserExt;

pub use crate::dm::cookie::AuthError;

pub const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// A verified local account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: PathBuf,
    pub shell: PathBuf,
}

impl Identity {
    pub fn lookup(name: &str) -> Result<Identity, AuthError> {
        let u = users::get_user_by_name(name).ok_or_else(|| AuthError::UnknownUser(name.to_string()))?;
        Ok(Identity {
            name: name.to_string(),
            uid: u.uid(),
            gid: u.primary_group_id(),
            home: u.home_dir().to_path_buf(),
            shell: u.shell().to_path_buf(),
        })
    }

    pub fn run_as(&self) -> RunAs {
        RunAs {
            name: self.name.clone(),
            uid: self.uid,
            gid: self.gid,
        }
    }
}

/// Environment handed to greeters, scripts and sessions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionEnv {
    vars: BTreeMap<String, String>,
}

impl SessionEnv {
    pub fn new() -> Self {
        Self::default()
    }

    /// What any client of the display needs: where it is and how to get in.
    pub fn for_display(d: &Display, xauthority: &Path) -> Self {
        let mut env = Self::new();
        env.set("DISPLAY", &d.name);
        env.set("XAUTHORITY", xauthority.display().to_string());
        env.set("PATH", DEFAULT_PATH);
        env.set("DM_DISPLAY_KIND", format!("{:?}", d.kind).to_lowercase());
        if let Some(vt) = d.vt {
            env.set("XDG_VTNR", vt.to_string());
        }
        env
    }

    pub fn for_user(id: &Identity, d: &Display, xauthority: &Path) -> Self {
        let mut env = Self::for_display(d, xauthority);
        env.set("HOME", id.home.display().to_string());
        env.set("USER", &id.name);
        env.set("LOGNAME", &id.name);
        env.set("SHELL", id.shell.display().to_string());
        env
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.vars.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Pluggable credential check. The worker only needs "who is this" and
/// "what environment does their session get".
pub trait Authenticator {
    fn verify(&self, display: &Display, username: &str) -> Result<Identity, AuthError>;

    fn setup_session_environment(&self, id: &Identity, display: &Display, xauthority: &Path) -> SessionEnv {
        SessionEnv::for_user(id, display, xauthority)
    }
}

/// Delegates to an external helper run as `<command...> <display> <user>`.
///
/// Exit 0 accepts, exit 1 rejects, anything else is a helper failure.
pub struct CommandAuthenticator {
    command: Vec<String>,
}

impl CommandAuthenticator {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

impl Authenticator for CommandAuthenticator {
    fn verify(&self, display: &Display, username: &str) -> Result<Identity, AuthError> {
        if username.is_empty() || username.contains(['/', '\0']) {
            return Err(AuthError::Rejected(username.to_string()));
        }
        let Some((prog, rest)) = self.command.split_first() else {
            return Err(AuthError::Helper("no verify command configured".to_string()));
        };
        let status = Command::new(prog)
            .args(rest)
            .arg(&display.name)
            .arg(username)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .status()
            .map_err(|e| AuthError::Helper(format!("{prog}: {e}")))?;
        match status.code() {
            Some(0) => Identity::lookup(username),
            Some(1) => Err(AuthError::Rejected(username.to_string())),
            _ => Err(AuthError::Helper(format!("{prog} ended with {status}"))),
        }
    }
}

/// Builds a command that runs in its own session, optionally as another
/// identity, with exactly `env` as its environment.
pub fn build_user_command(
    argv: &[String],
    run_as: Option<&RunAs>,
    env: &SessionEnv,
    cwd: &Path,
) -> anyhow::Result<Command> {
    anyhow::ensure!(!argv.is_empty(), "command must not be empty");

    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..]);
    cmd.env_clear();
    for (k, v) in env.iter() {
        cmd.env(k, v);
    }
    cmd.current_dir(if cwd.is_dir() { cwd } else { Path::new("/") });

    let drop_to = match run_as {
        Some(r) if !r.is_root() => Some((r.clone(), CString::new(r.name.clone())?)),
        _ => None,
    };

    // Child-side order: new session, default signal handling, then gid, groups, uid.
    unsafe {
        cmd.pre_exec(move || {
            let _ = setsid();
            let _ = nix::sys::signal::signal(Signal::SIGUSR2, nix::sys::signal::SigHandler::SigDfl);
            if let Some((r, cname)) = drop_to.as_ref() {
                let gid = nix::unistd::Gid::from_raw(r.gid);
                nix::unistd::setgid(gid).map_err(|e| {
                    std::io::Error::new(std::io::ErrorKind::PermissionDenied, format!("setgid({}) failed: {e}", r.gid))
                })?;
                nix::unistd::initgroups(cname, gid)?;
                nix::unistd::setuid(nix::unistd::Uid::from_raw(r.uid)).map_err(|e| {
                    std::io::Error::new(std::io::ErrorKind::PermissionDenied, format!("setuid({}) failed: {e}", r.name))
                })?;
            }
            Ok(())
        });
    }
    Ok(cmd)
}

/// Waits for `child` to exit, giving up only when the worker is cancelled.
pub fn wait_child(signals: &WorkerSignals, child: &mut Child) -> Result<ExitStatus, Cancelled> {
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("wait for pid {} failed: {e}", child.id());
                return Ok(ExitStatus::from_raw(255 << 8));
            }
        }
        signals.wait(&[], Some(Duration::from_secs(1)))?;
    }
}

/// `SIGTERM` to the child's session, then `SIGKILL` after `grace`. Always reaps.
pub fn terminate_child(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    if let Ok(Some(status)) = child.try_wait() {
        return Some(status);
    }
    let pid = Pid::from_raw(child.id() as i32);
    if killpg(pid, Signal::SIGTERM).is_err() {
        let _ = kill(pid, Signal::SIGTERM);
    }
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if let Ok(Some(status)) = child.try_wait() {
            return Some(status);
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    let _ = killpg(pid, Signal::SIGKILL);
    let _ = child.kill();
    child.wait().ok()
}

/// Runs a script to completion. Cancellation kills it.
pub fn run_program(
    signals: &WorkerSignals,
    argv: &[String],
    run_as: Option<&RunAs>,
    env: &SessionEnv,
    cwd: &Path,
) -> anyhow::Result<ExitStatus> {
    let mut cmd = build_user_command(argv, run_as, env, cwd)?;
    cmd.stdin(Stdio::null());
    let mut child = cmd
        .spawn()
        .map_err(|e| anyhow::anyhow!("failed to spawn {}: {e}", argv[0]))?;
    match wait_child(signals, &mut child) {
        Ok(status) => Ok(status),
        Err(c) => {
            terminate_child(&mut child, Duration::from_secs(2));
            Err(c.into())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogKind {
    Error,
    YesNo,
    Question,
    AskButtons,
}

/// A modal question a worker wants shown on its display's console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialogRequest {
    pub kind: DialogKind,
    pub message: String,
    pub buttons: Vec<String>,
}

impl DialogRequest {
    pub fn from_msg(msg: &WorkerMsg) -> Option<Self> {
        let (kind, message, buttons) = match msg {
            WorkerMsg::ShowErrorDialog(m) => (DialogKind::Error, m, Vec::new()),
            WorkerMsg::ShowYesNoDialog(m) => (DialogKind::YesNo, m, Vec::new()),
            WorkerMsg::ShowQuestionDialog(m) => (DialogKind::Question, m, Vec::new()),
            WorkerMsg::ShowAskButtonsDialog { message, buttons } => {
                (DialogKind::AskButtons, message, buttons.clone())
            }
            _ => return None,
        };
        Some(Self {
            kind,
            message: message.clone(),
            buttons,
        })
    }

    /// `helper --display :0 --yesno "message"`; buttons follow the message.
    pub fn argv(&self, helper: &[String], display: &str) -> Vec<String> {
        let flag = match self.kind {
            DialogKind::Error => "--error",
            DialogKind::YesNo => "--yesno",
            DialogKind::Question => "--question",
            DialogKind::AskButtons => "--buttons",
        };
        let mut argv = helper.to_vec();
        argv.extend(["--display".to_string(), display.to_string(), flag.to_string(), self.message.clone()]);
        argv.extend(self.buttons.iter().cloned());
        argv
    }

    /// The answer given when nobody can see the dialog.
    pub fn default_answer(&self) -> String {
        match self.kind {
            DialogKind::YesNo => "NO".to_string(),
            DialogKind::AskButtons => "0".to_string(),
            DialogKind::Error | DialogKind::Question => String::new(),
        }
    }

    pub fn answer_from(&self, success: bool, stdout: &str) -> String {
        let first = stdout.lines().next().unwrap_or("").trim();
        match self.kind {
            DialogKind::Error => String::new(),
            DialogKind::YesNo => if success { "YES" } else { "NO" }.to_string(),
            DialogKind::Question if success => first.to_string(),
            DialogKind::AskButtons if success => match first.parse::<usize>() {
                Ok(i) if i < self.buttons.len() => i.to_string(),
                _ => self.default_answer(),
            },
            _ => self.default_answer(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn me() -> Identity {
        let name = users::get_current_username()
            .and_then(|n| n.into_string().ok())
            .unwrap();
        Identity::lookup(&name).unwrap()
    }

    fn helper(dir: &Path, body: &str) -> Vec<String> {
        let p = dir.join("verify");
        std::fs::write(&p, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&p, std::fs::Permissions::from_mode(0o755)).unwrap();
        vec![p.display().to_string()]
    }

    #[test]
    fn verify_helper_exit_codes_map_to_outcomes() {
        let tmp = tempfile::TempDir::new().unwrap();
        let d = Display::new_static(0, None, true);
        let user = me();

        let ok = CommandAuthenticator::new(helper(tmp.path(), "[ \"$1\" = :0 ] && exit 0; exit 3"));
        assert_eq!(ok.verify(&d, &user.name).unwrap(), user);

        let no = CommandAuthenticator::new(helper(tmp.path(), "exit 1"));
        assert!(matches!(no.verify(&d, &user.name), Err(AuthError::Rejected(_))));

        let broken = CommandAuthenticator::new(helper(tmp.path(), "exit 7"));
        assert!(matches!(broken.verify(&d, &user.name), Err(AuthError::Helper(_))));

        assert!(matches!(ok.verify(&d, "../etc"), Err(AuthError::Rejected(_))));
    }

    #[test]
    fn session_env_describes_display_and_user() {
        let d = Display::new_static(1, Some(8), true);
        let id = me();
        let env = SessionEnv::for_user(&id, &d, Path::new("/home/x/.Xauthority"));
        assert_eq!(env.get("DISPLAY"), Some(":1"));
        assert_eq!(env.get("XAUTHORITY"), Some("/home/x/.Xauthority"));
        assert_eq!(env.get("USER"), Some(id.name.as_str()));
        assert_eq!(env.get("XDG_VTNR"), Some("8"));
        assert_eq!(env.get("PATH"), Some(DEFAULT_PATH));
    }

    #[test]
    fn run_program_sees_only_the_given_environment() {
        let tmp = tempfile::TempDir::new().unwrap();
        let sigs = WorkerSignals::install().unwrap();
        let out = tmp.path().join("env.txt");
        let mut env = SessionEnv::new();
        env.set("PATH", DEFAULT_PATH);
        env.set("DM_TEST", "yes");
        let argv = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            format!("echo \"$DM_TEST:${{HOME:-none}}\" > {}; exit 3", out.display()),
        ];
        let status = run_program(&sigs, &argv, None, &env, tmp.path()).unwrap();
        assert_eq!(status.code(), Some(3));
        assert_eq!(std::fs::read_to_string(&out).unwrap().trim(), "yes:none");
    }

    #[test]
    fn terminate_child_reaps_a_stubborn_process() {
        let env = SessionEnv::new();
        let argv = vec!["/bin/sh".to_string(), "-c".to_string(), "trap '' TERM; sleep 30".to_string()];
        let mut child = build_user_command(&argv, None, &env, Path::new("/")).unwrap().spawn().unwrap();
        std::thread::sleep(Duration::from_millis(100));
        assert!(terminate_child(&mut child, Duration::from_millis(200)).is_some());
    }

    #[test]
    fn dialog_requests_build_argv_and_interpret_answers() {
        let msg = WorkerMsg::ShowAskButtonsDialog {
            message: "Pick".into(),
            buttons: vec!["a".into(), "b".into()],
        };
        let req = DialogRequest::from_msg(&msg).unwrap();
        assert_eq!(
            req.argv(&["dmdialog".into()], ":0"),
            vec!["dmdialog", "--display", ":0", "--buttons", "Pick", "a", "b"]
        );
        assert_eq!(req.answer_from(true, "1\n"), "1");
        assert_eq!(req.answer_from(true, "5\n"), "0");

        let yn = DialogRequest::from_msg(&WorkerMsg::ShowYesNoDialog("Retry?".into())).unwrap();
        assert_eq!(yn.answer_from(true, ""), "YES");
        assert_eq!(yn.answer_from(false, ""), "NO");
        assert_eq!(yn.default_answer(), "NO");

        let q = DialogRequest::from_msg(&WorkerMsg::ShowQuestionDialog("Name?".into())).unwrap();
        assert_eq!(q.answer_from(true, "alice\nextra"), "alice");
        assert!(DialogRequest::from_msg(&WorkerMsg::FlexiOk).is_none());
    }
}

use crate::dm::cookie::Grant;
use crate::dm::governor::RetryState;
use crate::dm::xauth::AuthEntry;
use serde::Serialize;
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayKind {
    /// Configured in the `displays` section; re-armed forever.
    Static,
    /// Created on demand over the control socket; disposed when it ends.
    Flexi,
    /// Server is a remote peer; disposed when it ends.
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DisplayStatus {
    Unborn,
    Alive,
    Dead,
    Configuring,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ServerStatus {
    Dead,
    Pending,
    Running,
    Timeout,
    Abort,
}

/// Inputs to the display state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayEvent {
    /// The master started a worker for the display.
    WorkerForked,
    /// The worker reported a running server.
    ServerRunning,
    /// The worker attached without a local server (remote or unhandled).
    Attached,
    /// The worker process was reaped, whatever the reason.
    WorkerReaped,
    ConfigureBegin,
    ConfigureEnd,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("display {display}: no transition from {from:?} on {event:?}")]
    Illegal {
        display: String,
        from: DisplayStatus,
        event: DisplayEvent,
    },
    #[error("display {display}: server pid {pid} cannot have status Dead")]
    ServerInvariant { display: String, pid: i32 },
}

impl DisplayStatus {
    /// The transition table. `None` means the pair is not a legal transition.
    pub fn next(self, event: DisplayEvent) -> Option<DisplayStatus> {
        use DisplayEvent as E;
        use DisplayStatus as S;
        match (self, event) {
            // A fresh worker for an unborn display stays unborn until it reports back.
            (S::Unborn, E::WorkerForked) => Some(S::Unborn),
            // Re-management of a dead display.
            (S::Dead, E::WorkerForked) => Some(S::Alive),
            (S::Unborn | S::Alive, E::ServerRunning) => Some(S::Alive),
            // A restarted server while the configurator owns the display.
            (S::Configuring, E::ServerRunning) => Some(S::Configuring),
            (S::Unborn, E::Attached) => Some(S::Alive),
            (S::Unborn | S::Alive | S::Configuring, E::WorkerReaped) => Some(S::Dead),
            (S::Alive, E::ConfigureBegin) => Some(S::Configuring),
            (S::Configuring, E::ConfigureEnd) => Some(S::Alive),
            _ => None,
        }
    }
}

/// What a display does when its session ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum LogoutAction {
    #[default]
    None,
    Halt,
    Reboot,
    Suspend,
}

impl LogoutAction {
    pub const SELECTABLE: [LogoutAction; 3] =
        [LogoutAction::Halt, LogoutAction::Reboot, LogoutAction::Suspend];

    pub fn as_str(self) -> &'static str {
        match self {
            LogoutAction::None => "NONE",
            LogoutAction::Halt => "HALT",
            LogoutAction::Reboot => "REBOOT",
            LogoutAction::Suspend => "SUSPEND",
        }
    }
}

impl fmt::Display for LogoutAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogoutAction {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NONE" => Ok(LogoutAction::None),
            "HALT" => Ok(LogoutAction::Halt),
            "REBOOT" => Ok(LogoutAction::Reboot),
            "SUSPEND" => Ok(LogoutAction::Suspend),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Display {
    pub number: u32,
    pub name: String,
    pub hostname: String,
    pub kind: DisplayKind,
    pub status: DisplayStatus,

    // Process handles; 0 means not running.
    pub worker_pid: i32,
    pub servpid: i32,
    pub greetpid: i32,
    pub sesspid: i32,
    pub server_status: ServerStatus,

    pub retry: RetryState,

    pub cookie: Vec<u8>,
    pub cookie_hex: String,
    /// Root-owned authority file.
    pub authfile: Option<PathBuf>,
    /// Copy readable by a non-root server identity.
    pub authfile_server: Option<PathBuf>,
    pub auths: Vec<AuthEntry>,
    pub local_auths: Vec<AuthEntry>,
    /// Where the current user's entries were written, if any.
    pub user_grant: Option<Grant>,

    pub is_local: bool,
    /// Has a console (a VT the user can see dialogs on).
    pub attached: bool,
    pub addresses: Vec<IpAddr>,

    pub vt: Option<u32>,
    pub handled: bool,
    pub logout_action: LogoutAction,
    pub login: Option<String>,
    pub theme: Option<String>,
}

impl Display {
    fn blank(number: u32, name: String, hostname: String, kind: DisplayKind) -> Self {
        Self {
            number,
            name,
            hostname,
            kind,
            status: DisplayStatus::Unborn,
            worker_pid: 0,
            servpid: 0,
            greetpid: 0,
            sesspid: 0,
            server_status: ServerStatus::Dead,
            retry: RetryState::new(),
            cookie: Vec::new(),
            cookie_hex: String::new(),
            authfile: None,
            authfile_server: None,
            auths: Vec::new(),
            local_auths: Vec::new(),
            user_grant: None,
            is_local: kind != DisplayKind::Remote,
            attached: kind != DisplayKind::Remote,
            addresses: Vec::new(),
            vt: None,
            handled: true,
            logout_action: LogoutAction::None,
            login: None,
            theme: None,
        }
    }

    pub fn new_static(number: u32, vt: Option<u32>, handled: bool) -> Self {
        let mut d = Self::blank(number, format!(":{number}"), String::new(), DisplayKind::Static);
        d.vt = vt;
        d.handled = handled;
        d
    }

    pub fn new_flexi(number: u32) -> Self {
        Self::blank(number, format!(":{number}"), String::new(), DisplayKind::Flexi)
    }

    pub fn new_remote(hostname: &str, number: u32, addresses: Vec<IpAddr>) -> Self {
        let mut d = Self::blank(
            number,
            format!("{hostname}:{number}"),
            hostname.to_string(),
            DisplayKind::Remote,
        );
        d.addresses = addresses;
        d
    }

    pub fn apply(&mut self, event: DisplayEvent) -> Result<DisplayStatus, TransitionError> {
        match self.status.next(event) {
            Some(next) => {
                self.status = next;
                Ok(next)
            }
            None => Err(TransitionError::Illegal {
                display: self.name.clone(),
                from: self.status,
                event,
            }),
        }
    }

    /// Records the server pid together with its status; a live pid never pairs with `Dead`.
    pub fn set_server(&mut self, pid: i32, status: ServerStatus) -> Result<(), TransitionError> {
        if pid != 0 && status == ServerStatus::Dead {
            return Err(TransitionError::ServerInvariant {
                display: self.name.clone(),
                pid,
            });
        }
        self.servpid = pid;
        self.server_status = status;
        Ok(())
    }

    /// Clears everything a reaped worker owned, ready for re-management.
    pub fn clear_worker_state(&mut self) {
        self.worker_pid = 0;
        self.servpid = 0;
        self.greetpid = 0;
        self.sesspid = 0;
        self.server_status = ServerStatus::Dead;
        self.login = None;
        self.cookie.clear();
        self.cookie_hex.clear();
        self.logout_action = LogoutAction::None;
    }

    pub fn logged_in(&self) -> bool {
        self.login.as_deref().is_some_and(|u| !u.is_empty())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("display number {0} already in use")]
    NumberInUse(u32),
    #[error("no display numbered {0}")]
    NotFound(u32),
    #[error("display {0} is not dead; it cannot be disposed")]
    NotDead(String),
}

/// Ordered collection of displays, unique by number.
#[derive(Debug, Default)]
pub struct Registry {
    displays: Vec<Display>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, display: Display) -> Result<&mut Display, RegistryError> {
        if self.get(display.number).is_some() {
            return Err(RegistryError::NumberInUse(display.number));
        }
        self.displays.push(display);
        let idx = self.displays.len() - 1;
        Ok(&mut self.displays[idx])
    }

    pub fn get(&self, number: u32) -> Option<&Display> {
        self.displays.iter().find(|d| d.number == number)
    }

    pub fn get_mut(&mut self, number: u32) -> Option<&mut Display> {
        self.displays.iter_mut().find(|d| d.number == number)
    }

    pub fn by_name(&self, name: &str) -> Option<&Display> {
        self.displays.iter().find(|d| d.name == name)
    }

    pub fn by_worker_pid(&self, pid: i32) -> Option<&Display> {
        if pid == 0 {
            return None;
        }
        self.displays.iter().find(|d| d.worker_pid == pid)
    }

    pub fn by_cookie_hex(&self, hex: &str) -> Option<&Display> {
        if hex.is_empty() {
            return None;
        }
        self.displays
            .iter()
            .find(|d| !d.cookie_hex.is_empty() && d.cookie_hex.eq_ignore_ascii_case(hex))
    }

    /// Removes a dead display for good.
    pub fn dispose(&mut self, number: u32) -> Result<Display, RegistryError> {
        let idx = self
            .displays
            .iter()
            .position(|d| d.number == number)
            .ok_or(RegistryError::NotFound(number))?;
        if self.displays[idx].status != DisplayStatus::Dead {
            return Err(RegistryError::NotDead(self.displays[idx].name.clone()));
        }
        Ok(self.displays.remove(idx))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Display> {
        self.displays.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Display> {
        self.displays.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.displays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.displays.is_empty()
    }

    pub fn count_kind(&self, kind: DisplayKind) -> usize {
        self.displays.iter().filter(|d| d.kind == kind).count()
    }

    /// Lowest number `>= from` not held by any display.
    pub fn next_free_number(&self, from: u32) -> u32 {
        let mut n = from;
        while self.get(n).is_some() {
            n += 1;
        }
        n
    }

    /// Whether any display other than `except` has a logged-in user.
    pub fn other_logins(&self, except: u32) -> bool {
        self.displays.iter().any(|d| d.number != except && d.logged_in())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATUS: [DisplayStatus; 4] = [
        DisplayStatus::Unborn,
        DisplayStatus::Alive,
        DisplayStatus::Dead,
        DisplayStatus::Configuring,
    ];
    const ALL_EVENTS: [DisplayEvent; 6] = [
        DisplayEvent::WorkerForked,
        DisplayEvent::ServerRunning,
        DisplayEvent::Attached,
        DisplayEvent::WorkerReaped,
        DisplayEvent::ConfigureBegin,
        DisplayEvent::ConfigureEnd,
    ];

    #[test]
    fn every_live_status_dies_when_the_worker_is_reaped() {
        for s in [DisplayStatus::Unborn, DisplayStatus::Alive, DisplayStatus::Configuring] {
            assert_eq!(s.next(DisplayEvent::WorkerReaped), Some(DisplayStatus::Dead));
        }
        assert_eq!(DisplayStatus::Dead.next(DisplayEvent::WorkerReaped), None);
    }

    #[test]
    fn illegal_pairs_leave_status_untouched() {
        for s in ALL_STATUS {
            for e in ALL_EVENTS {
                let mut d = Display::new_static(0, None, true);
                d.status = s;
                match d.apply(e) {
                    Ok(next) => assert_eq!(Some(next), s.next(e)),
                    Err(err) => {
                        assert_eq!(d.status, s);
                        assert!(matches!(err, TransitionError::Illegal { .. }));
                    }
                }
            }
        }
    }

    #[test]
    fn lifecycle_unborn_alive_dead_alive() {
        let mut d = Display::new_static(0, Some(7), true);
        d.apply(DisplayEvent::WorkerForked).unwrap();
        assert_eq!(d.status, DisplayStatus::Unborn);
        d.apply(DisplayEvent::ServerRunning).unwrap();
        assert_eq!(d.status, DisplayStatus::Alive);
        d.apply(DisplayEvent::ConfigureBegin).unwrap();
        d.apply(DisplayEvent::ConfigureEnd).unwrap();
        d.apply(DisplayEvent::WorkerReaped).unwrap();
        assert_eq!(d.status, DisplayStatus::Dead);
        d.apply(DisplayEvent::WorkerForked).unwrap();
        assert_eq!(d.status, DisplayStatus::Alive);
    }

    #[test]
    fn server_pid_never_pairs_with_dead_status() {
        let mut d = Display::new_flexi(3);
        assert!(d.set_server(1234, ServerStatus::Dead).is_err());
        assert_eq!(d.servpid, 0);
        d.set_server(1234, ServerStatus::Running).unwrap();
        d.set_server(0, ServerStatus::Dead).unwrap();
        assert_eq!((d.servpid, d.server_status), (0, ServerStatus::Dead));
    }

    #[test]
    fn registry_numbers_are_unique_and_disposal_needs_dead() {
        let mut r = Registry::new();
        r.add(Display::new_static(0, None, true)).unwrap();
        assert_eq!(
            r.add(Display::new_flexi(0)).unwrap_err(),
            RegistryError::NumberInUse(0)
        );
        r.add(Display::new_flexi(1)).unwrap();
        assert!(matches!(r.dispose(1), Err(RegistryError::NotDead(_))));
        r.get_mut(1).unwrap().status = DisplayStatus::Dead;
        let gone = r.dispose(1).unwrap();
        assert_eq!(gone.name, ":1");
        assert_eq!(r.len(), 1);
        assert_eq!(r.next_free_number(0), 1);
    }

    #[test]
    fn logout_action_parses_case_insensitively() {
        assert_eq!("reboot".parse::<LogoutAction>(), Ok(LogoutAction::Reboot));
        assert_eq!("NONE".parse::<LogoutAction>(), Ok(LogoutAction::None));
        assert!("explode".parse::<LogoutAction>().is_err());
    }

    #[test]
    fn remote_display_name_includes_host() {
        let d = Display::new_remote("10.0.0.2", 0, vec!["10.0.0.2".parse().unwrap()]);
        assert_eq!(d.name, "10.0.0.2:0");
        assert!(!d.is_local);
        assert!(!d.attached);
    }
}

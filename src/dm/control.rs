use crate::dm::display::LogoutAction;
use serde::Serialize;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

/// Messages a single control connection may send before it is dropped.
pub const MAX_MESSAGES: u32 = 512;

/// Default `EVENTS` tail length.
pub const DEFAULT_EVENTS: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControlError {
    #[error("Not implemented")]
    NotImplemented,
    #[error("No more flexi servers")]
    NoMoreFlexi,
    #[error("Startup errors")]
    StartupErrors,
    #[error("X failed")]
    XFailed,
    #[error("X too busy")]
    XTooBusy,
    #[error("No server binary")]
    NoServerBinary,
    #[error("Unknown logout action")]
    UnknownLogoutAction,
    #[error("VT not supported")]
    VtNotSupported,
    #[error("Invalid VT number")]
    InvalidVt,
    #[error("Unsupported key {0}")]
    UnsupportedKey(String),
    #[error("Not authenticated")]
    NotAuthenticated,
    #[error("Too many messages")]
    TooManyMessages,
    #[error("Unknown error")]
    Unknown,
}

impl ControlError {
    pub fn code(&self) -> u32 {
        match self {
            ControlError::NotImplemented => 0,
            ControlError::NoMoreFlexi => 1,
            ControlError::StartupErrors => 2,
            ControlError::XFailed => 3,
            ControlError::XTooBusy => 4,
            ControlError::NoServerBinary => 6,
            ControlError::UnknownLogoutAction => 7,
            ControlError::VtNotSupported => 8,
            ControlError::InvalidVt => 9,
            ControlError::UnsupportedKey(_) => 50,
            ControlError::NotAuthenticated => 100,
            ControlError::TooManyMessages => 200,
            ControlError::Unknown => 999,
        }
    }

    /// Maps a worker's `FLEXI_ERR` code back onto the reply it stands for.
    pub fn from_flexi_code(code: u32) -> Self {
        match code {
            1 => ControlError::NoMoreFlexi,
            2 => ControlError::StartupErrors,
            3 => ControlError::XFailed,
            4 => ControlError::XTooBusy,
            6 => ControlError::NoServerBinary,
            _ => ControlError::Unknown,
        }
    }

    pub fn reply(&self) -> String {
        format!("ERROR {} {}", self.code(), self)
    }
}

pub fn ok_reply(payload: Option<&str>) -> String {
    match payload {
        Some(p) if !p.is_empty() => format!("OK {p}"),
        _ => "OK".to_string(),
    }
}

pub fn reply_of(r: Result<Option<String>, ControlError>) -> String {
    match r {
        Ok(p) => ok_reply(p.as_deref()),
        Err(e) => e.reply(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    AuthLocal(String),
    FlexiXServer,
    GetConfig { key: String, display: Option<String> },
    QueryLogoutAction,
    SetLogoutAction(String),
    SetSafeLogoutAction(String),
    QueryVt,
    SetVt(String),
    AttachedServers(Option<String>),
    AllServers(Option<String>),
    GreeterPids,
    Close,
    Version,
    Events(Option<usize>),
    Unknown(String),
}

impl ControlCommand {
    pub fn parse(line: &str) -> ControlCommand {
        let line = line.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((w, r)) => (w, r.trim()),
            None => (line, ""),
        };
        let opt = |s: &str| (!s.is_empty()).then(|| s.to_string());
        match word {
            "AUTH_LOCAL" => ControlCommand::AuthLocal(rest.to_string()),
            "FLEXI_XSERVER" => ControlCommand::FlexiXServer,
            "GET_CONFIG" => {
                let mut it = rest.split_whitespace();
                match it.next() {
                    Some(key) => ControlCommand::GetConfig {
                        key: key.to_string(),
                        display: it.next().map(str::to_string),
                    },
                    None => ControlCommand::Unknown(line.to_string()),
                }
            }
            "QUERY_LOGOUT_ACTION" => ControlCommand::QueryLogoutAction,
            "SET_LOGOUT_ACTION" => ControlCommand::SetLogoutAction(rest.to_string()),
            "SET_SAFE_LOGOUT_ACTION" => ControlCommand::SetSafeLogoutAction(rest.to_string()),
            "QUERY_VT" => ControlCommand::QueryVt,
            "SET_VT" => ControlCommand::SetVt(rest.to_string()),
            "ATTACHED_SERVERS" | "CONSOLE_SERVERS" => ControlCommand::AttachedServers(opt(rest)),
            "ALL_SERVERS" => ControlCommand::AllServers(opt(rest)),
            "GREETERPIDS" => ControlCommand::GreeterPids,
            "CLOSE" => ControlCommand::Close,
            "VERSION" => ControlCommand::Version,
            "EVENTS" => match rest {
                "" => ControlCommand::Events(None),
                n => match n.parse::<usize>() {
                    Ok(n) => ControlCommand::Events(Some(n)),
                    Err(_) => ControlCommand::Unknown(line.to_string()),
                },
            },
            _ => ControlCommand::Unknown(line.to_string()),
        }
    }

    pub fn requires_auth(&self) -> bool {
        matches!(
            self,
            ControlCommand::FlexiXServer
                | ControlCommand::QueryLogoutAction
                | ControlCommand::SetLogoutAction(_)
                | ControlCommand::SetSafeLogoutAction(_)
                | ControlCommand::SetVt(_)
                | ControlCommand::Events(_)
        )
    }
}

/// One entry of an `ATTACHED_SERVERS` / `ALL_SERVERS` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerEntry {
    pub name: String,
    pub user: String,
    pub vt: Option<u32>,
}

pub fn format_server_list(entries: &[ServerEntry]) -> String {
    entries
        .iter()
        .map(|e| {
            let vt = e.vt.map(|v| v.to_string()).unwrap_or_else(|| "-1".to_string());
            format!("{},{},{}", e.name, e.user.replace([',', ';'], "_"), vt)
        })
        .collect::<Vec<_>>()
        .join(";")
}

pub fn parse_server_list(payload: &str) -> Vec<ServerEntry> {
    payload
        .split(';')
        .filter(|s| !s.trim().is_empty())
        .filter_map(|item| {
            let mut f = item.splitn(3, ',');
            let name = f.next()?.to_string();
            let user = f.next().unwrap_or("").to_string();
            let vt = f.next().and_then(|v| v.trim().parse::<u32>().ok());
            Some(ServerEntry { name, user, vt })
        })
        .collect()
}

/// `HALT;REBOOT!;SUSPEND`: the configured actions, `!` marking the selected one.
pub fn format_logout_actions(available: &[LogoutAction], current: LogoutAction) -> String {
    available
        .iter()
        .map(|a| {
            if *a == current {
                format!("{a}!")
            } else {
                a.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(";")
}

/// Splits a reply line into its payload or its error code and message.
pub fn parse_reply(line: &str) -> Result<String, (u32, String)> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line == "OK" {
        return Ok(String::new());
    }
    if let Some(p) = line.strip_prefix("OK ") {
        return Ok(p.to_string());
    }
    if let Some(rest) = line.strip_prefix("ERROR ") {
        let (code, msg) = rest.split_once(' ').unwrap_or((rest, ""));
        return Err((code.parse().unwrap_or(999), msg.to_string()));
    }
    Err((999, format!("unexpected reply {line:?}")))
}

/// Sends one command, authenticating first when a cookie is given, and returns the OK payload.
pub fn client_call(sock: &Path, command: &str, cookie: Option<&str>, timeout: Duration) -> anyhow::Result<String> {
    let stream = UnixStream::connect(sock).map_err(|e| {
        anyhow::anyhow!(
            "failed to connect to displaymaster socket {}: {e}",
            sock.display()
        )
    })?;
    stream.set_read_timeout(Some(timeout))?;
    let mut writer = stream.try_clone()?;
    let mut reader = BufReader::new(stream);

    let mut exchange = |line: &str| -> anyhow::Result<String> {
        writer.write_all(format!("{line}\n").as_bytes())?;
        writer.flush()?;
        let mut resp = String::new();
        reader.read_line(&mut resp)?;
        if resp.trim().is_empty() {
            anyhow::bail!("empty response from daemon");
        }
        parse_reply(&resp).map_err(|(code, msg)| anyhow::anyhow!("ERROR {code} {msg}"))
    };

    if let Some(c) = cookie {
        exchange(&format!("AUTH_LOCAL {c}"))?;
    }
    let payload = exchange(command)?;
    let _ = writer.write_all(b"CLOSE\n");
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands_and_arguments() {
        assert_eq!(ControlCommand::parse("AUTH_LOCAL abcd"), ControlCommand::AuthLocal("abcd".into()));
        assert_eq!(
            ControlCommand::parse("GET_CONFIG daemon/User=root :0"),
            ControlCommand::GetConfig {
                key: "daemon/User=root".into(),
                display: Some(":0".into())
            }
        );
        assert_eq!(ControlCommand::parse("ATTACHED_SERVERS"), ControlCommand::AttachedServers(None));
        assert_eq!(
            ControlCommand::parse("ALL_SERVERS :1*"),
            ControlCommand::AllServers(Some(":1*".into()))
        );
        assert_eq!(ControlCommand::parse("EVENTS 20"), ControlCommand::Events(Some(20)));
        assert!(matches!(ControlCommand::parse("EVENTS lots"), ControlCommand::Unknown(_)));
        assert!(matches!(ControlCommand::parse("version"), ControlCommand::Unknown(_)));
    }

    #[test]
    fn error_replies_carry_code_and_text() {
        assert_eq!(ControlError::NoMoreFlexi.reply(), "ERROR 1 No more flexi servers");
        assert_eq!(ControlError::NotAuthenticated.reply(), "ERROR 100 Not authenticated");
        assert_eq!(
            ControlError::UnsupportedKey("x/y".into()).reply(),
            "ERROR 50 Unsupported key x/y"
        );
        assert_eq!(ControlError::from_flexi_code(6), ControlError::NoServerBinary);
    }

    #[test]
    fn server_list_round_trips_through_text() {
        let entries = vec![
            ServerEntry {
                name: ":0".into(),
                user: "alice".into(),
                vt: Some(7),
            },
            ServerEntry {
                name: ":1".into(),
                user: String::new(),
                vt: None,
            },
        ];
        let s = format_server_list(&entries);
        assert_eq!(s, ":0,alice,7;:1,,-1");
        assert_eq!(parse_server_list(&s), entries);
    }

    #[test]
    fn logout_actions_mark_current() {
        let s = format_logout_actions(
            &[LogoutAction::Halt, LogoutAction::Reboot, LogoutAction::Suspend],
            LogoutAction::Reboot,
        );
        assert_eq!(s, "HALT;REBOOT!;SUSPEND");
    }

    #[test]
    fn reply_parsing() {
        assert_eq!(parse_reply("OK\n"), Ok(String::new()));
        assert_eq!(parse_reply("OK :2"), Ok(":2".into()));
        assert_eq!(parse_reply("ERROR 1 No more flexi servers"), Err((1, "No more flexi servers".into())));
    }

    #[test]
    fn client_call_authenticates_then_sends() {
        use std::os::unix::net::UnixListener;
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("c.sock");
        let l = UnixListener::bind(&path).unwrap();
        let t = std::thread::spawn(move || {
            let (s, _) = l.accept().unwrap();
            let mut w = s.try_clone().unwrap();
            let mut r = BufReader::new(s);
            let mut got = Vec::new();
            for _ in 0..2 {
                let mut line = String::new();
                r.read_line(&mut line).unwrap();
                got.push(line.trim_end().to_string());
                let resp = if got.len() == 1 { "OK\n" } else { "OK :0,,7\n" };
                w.write_all(resp.as_bytes()).unwrap();
            }
            got
        });
        let p = client_call(&path, "ATTACHED_SERVERS", Some("feed"), Duration::from_secs(5)).unwrap();
        assert_eq!(p, ":0,,7");
        assert_eq!(t.join().unwrap(), vec!["AUTH_LOCAL feed".to_string(), "ATTACHED_SERVERS".to_string()]);
    }
}

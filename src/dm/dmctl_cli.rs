use crate::dm::cli::OutputFormat;
use crate::dm::control::{self, ServerEntry};
use crate::dm::cookie;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fmt};

pub const DEFAULT_SOCK: &str = "/run/displaymaster.sock";

#[derive(Debug, Parser)]
#[command(name = "dmctl", version, about = "displaymaster control client")]
pub struct DmctlArgs {
    /// Unix socket path to the displaymaster daemon
    #[arg(short = 's', long = "sock")]
    pub sock: Option<PathBuf>,

    /// File holding the daemon cookie (hex), used for AUTH_LOCAL
    #[arg(long = "cookie-file", env = "DMCTL_COOKIE_FILE")]
    pub cookie_file: Option<PathBuf>,

    /// Cookie (hex) given directly, e.g. a display's own cookie
    #[arg(long = "cookie", env = "DMCTL_COOKIE", conflicts_with = "cookie_file")]
    pub cookie: Option<String>,

    /// Seconds to wait for a reply
    #[arg(long = "timeout", default_value_t = 60)]
    pub timeout: u64,

    #[command(subcommand)]
    pub cmd: Option<DmctlCmd>,
}

#[derive(Debug, Subcommand)]
pub enum DmctlCmd {
    /// Start a new flexible display and print its name
    Flexi,
    /// List displays with a running server (attached ones unless --all)
    Servers {
        /// Glob over display names, e.g. ':1*'
        pattern: Option<String>,
        #[arg(long = "all")]
        all: bool,
        /// Output format: text (default) or json
        #[arg(long = "format", default_value = "text")]
        format: OutputFormat,
    },
    /// Pids of running greeters
    GreeterPids,
    /// Read one config key, e.g. `daemon/ServerCommand` or `display/Vt :0`
    GetConfig { key: String, display: Option<String> },
    /// Show the available logout actions, or select one
    LogoutAction {
        action: Option<String>,
        /// Only honor the action when nobody else is logged in
        #[arg(long = "safe")]
        safe: bool,
    },
    /// Show the active VT, or switch to one
    Vt { vt: Option<u32> },
    /// Daemon version
    Version,
    /// Show recent daemon events ("what happened")
    Events {
        /// Number of events to show
        #[arg(short = 'n', default_value_t = control::DEFAULT_EVENTS)]
        n: usize,
        /// Output format: text (default) or json
        #[arg(long = "format", default_value = "text")]
        format: OutputFormat,
    },
    /// Send one raw protocol line and print the reply payload
    Raw { line: Vec<String> },
}

impl DmctlCmd {
    /// The protocol line this subcommand sends.
    pub fn line(&self) -> String {
        match self {
            DmctlCmd::Flexi => "FLEXI_XSERVER".to_string(),
            DmctlCmd::Servers { pattern, all, .. } => {
                let word = if *all { "ALL_SERVERS" } else { "ATTACHED_SERVERS" };
                match pattern {
                    Some(p) => format!("{word} {p}"),
                    None => word.to_string(),
                }
            }
            DmctlCmd::GreeterPids => "GREETERPIDS".to_string(),
            DmctlCmd::GetConfig { key, display } => match display {
                Some(d) => format!("GET_CONFIG {key} {d}"),
                None => format!("GET_CONFIG {key}"),
            },
            DmctlCmd::LogoutAction { action: None, .. } => "QUERY_LOGOUT_ACTION".to_string(),
            DmctlCmd::LogoutAction {
                action: Some(a),
                safe,
            } => {
                let word = if *safe { "SET_SAFE_LOGOUT_ACTION" } else { "SET_LOGOUT_ACTION" };
                format!("{word} {}", a.to_ascii_uppercase())
            }
            DmctlCmd::Vt { vt: None } => "QUERY_VT".to_string(),
            DmctlCmd::Vt { vt: Some(n) } => format!("SET_VT {n}"),
            DmctlCmd::Version => "VERSION".to_string(),
            DmctlCmd::Events { n, .. } => format!("EVENTS {n}"),
            DmctlCmd::Raw { line } => line.join(" "),
        }
    }
}

fn resolve_sock(args: &DmctlArgs) -> anyhow::Result<PathBuf> {
    let sock = match args.sock.clone() {
        Some(s) => s,
        None => match env::var("DMCTL_SOCK") {
            Ok(v) if !v.trim().is_empty() => PathBuf::from(v.trim()),
            _ => PathBuf::from(DEFAULT_SOCK),
        },
    };
    if !sock.exists() {
        anyhow::bail!("{}", MissingSockHelp(&sock));
    }
    Ok(sock)
}

struct MissingSockHelp<'a>(&'a Path);

impl fmt::Display for MissingSockHelp<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "no displaymaster socket at {}", self.0.display())?;
        writeln!(f)?;
        writeln!(f, "dmctl does not read the displaymaster config file.")?;
        writeln!(f, "If the daemon listens elsewhere, pass its socket via one of:")?;
        writeln!(f, "  - dmctl --sock /path/to/displaymaster.sock <command>")?;
        writeln!(f, "  - export DMCTL_SOCK=/path/to/displaymaster.sock")?;
        writeln!(f)?;
        writeln!(f, "Examples:")?;
        writeln!(f, "  dmctl --sock /tmp/dm.sock servers --all")?;
        writeln!(f, "  DMCTL_SOCK=/tmp/dm.sock dmctl --cookie-file /tmp/dm/auth/daemon.cookie events -n 20")?;
        Ok(())
    }
}

fn resolve_cookie(args: &DmctlArgs) -> anyhow::Result<Option<String>> {
    if let Some(c) = &args.cookie {
        return Ok(Some(c.trim().to_string()));
    }
    match &args.cookie_file {
        Some(p) => cookie::read_global_cookie(p)
            .map(Some)
            .map_err(|e| anyhow::anyhow!("failed to read cookie file {}: {e}", p.display())),
        None => Ok(None),
    }
}

pub fn run() -> anyhow::Result<()> {
    let args = DmctlArgs::parse();
    let sock = resolve_sock(&args)?;
    let cookie = resolve_cookie(&args)?;
    let timeout = Duration::from_secs(args.timeout.max(1));

    let cmd = args.cmd.unwrap_or(DmctlCmd::Servers {
        pattern: None,
        all: true,
        format: OutputFormat::Text,
    });
    let payload = control::client_call(&sock, &cmd.line(), cookie.as_deref(), timeout)?;

    match cmd {
        DmctlCmd::Servers { format, .. } => {
            let entries = control::parse_server_list(&payload);
            match format {
                OutputFormat::Text => print_servers(&entries),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
            }
        }
        DmctlCmd::Events { format, .. } => {
            let lines: Vec<&str> = payload.split(';').filter(|l| !l.is_empty()).collect();
            match format {
                OutputFormat::Text => {
                    for l in lines {
                        println!("{l}");
                    }
                }
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&lines)?),
            }
        }
        DmctlCmd::GreeterPids => {
            for p in payload.split(';').filter(|p| !p.is_empty()) {
                println!("{p}");
            }
        }
        _ => {
            if !payload.trim().is_empty() {
                println!("{}", payload.trim_end());
            }
        }
    }
    Ok(())
}

fn print_servers(entries: &[ServerEntry]) {
    for e in entries {
        let vt = e.vt.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string());
        let user = if e.user.is_empty() { "-" } else { e.user.as_str() };
        println!("{:<12} vt={:<3} user={user}", e.name, vt);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn parse(argv: &[&str]) -> DmctlArgs {
        let mut full = vec!["dmctl"];
        full.extend_from_slice(argv);
        DmctlArgs::try_parse_from(full).unwrap()
    }

    #[test]
    fn cli_is_well_formed() {
        DmctlArgs::command().debug_assert();
    }

    #[test]
    fn subcommands_map_to_protocol_lines() {
        let line = |argv: &[&str]| parse(argv).cmd.unwrap().line();
        assert_eq!(line(&["flexi"]), "FLEXI_XSERVER");
        assert_eq!(line(&["servers"]), "ATTACHED_SERVERS");
        assert_eq!(line(&["servers", "--all", ":1*"]), "ALL_SERVERS :1*");
        assert_eq!(line(&["logout-action"]), "QUERY_LOGOUT_ACTION");
        assert_eq!(line(&["logout-action", "halt"]), "SET_LOGOUT_ACTION HALT");
        assert_eq!(line(&["logout-action", "--safe", "reboot"]), "SET_SAFE_LOGOUT_ACTION REBOOT");
        assert_eq!(line(&["vt"]), "QUERY_VT");
        assert_eq!(line(&["vt", "8"]), "SET_VT 8");
        assert_eq!(line(&["get-config", "display/Vt", ":0"]), "GET_CONFIG display/Vt :0");
        assert_eq!(line(&["events"]), format!("EVENTS {}", control::DEFAULT_EVENTS));
        assert_eq!(line(&["raw", "GREETERPIDS"]), "GREETERPIDS");
    }

    #[test]
    fn cookie_comes_from_flag_or_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let p = tmp.path().join("daemon.cookie");
        std::fs::write(&p, "c0ffee\n").unwrap();
        let a = parse(&["--cookie-file", p.to_str().unwrap(), "version"]);
        assert_eq!(resolve_cookie(&a).unwrap().as_deref(), Some("c0ffee"));
        let a = parse(&["--cookie", " beef ", "version"]);
        assert_eq!(resolve_cookie(&a).unwrap().as_deref(), Some("beef"));
    }

    #[test]
    fn missing_socket_explains_itself() {
        let a = parse(&["--sock", "/nonexistent/dm.sock", "version"]);
        let err = resolve_sock(&a).unwrap_err().to_string();
        assert!(err.contains("/nonexistent/dm.sock"));
        assert!(err.contains("DMCTL_SOCK"));
    }
}

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Highest display number the daemon will ever hand out.
pub const MAX_DISPLAY_NUMBER: u32 = 1000;

#[derive(Debug, Clone, Serialize)]
pub struct MasterConfig {
    /// Control socket path.
    pub sock: PathBuf,
    /// Control socket owner (username). Applied on daemon start (requires root to chown).
    pub sock_owner: Option<String>,
    /// Control socket group (group name). Applied on daemon start (requires root to chown).
    pub sock_group: Option<String>,
    /// Control socket mode (octal), e.g. 666 or "666" or "0666".
    pub sock_mode: u32,

    pub daemon: DaemonConfig,

    /// Statically configured displays, in config order.
    pub displays: Vec<StaticDisplayConfig>,

    /// The file this config was loaded from; handed to workers on re-exec.
    pub source: PathBuf,
}

/// Everything under the `daemon:` section.
///
/// Commands are argv lists; the first element is the program.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DaemonConfig {
    /// Identity the greeter and server run as when `server_user` is not root.
    pub user: String,
    pub group: String,
    pub pid_file: PathBuf,
    /// Root-owned directory holding per-display authority files and the daemon cookie.
    pub auth_dir: PathBuf,
    /// Directory holding the copy readable by the server identity, and `.Xservers` files.
    pub server_auth_dir: PathBuf,
    /// Server and worker logs: `{log_dir}/{name}.log`.
    pub log_dir: PathBuf,
    /// Where the X server keeps `.X{n}-lock` and `.X11-unix/X{n}`.
    pub x11_tmp_dir: PathBuf,

    /// Per-user authority file name, relative to the user's home.
    pub user_authority_file: String,
    /// Where fallback authority files go when the user's own file looks unsafe.
    pub user_auth_fallback_dir: PathBuf,
    /// Largest user authority file we are willing to append to.
    pub user_max_file: u64,
    pub disallow_tcp: bool,

    /// Identity the X server runs as. Non-root servers cannot signal readiness.
    pub server_user: String,
    pub server_command: Vec<String>,
    #[serde(default)]
    pub failsafe_server_command: Option<Vec<String>>,
    pub server_timeout_secs: u64,
    /// Start attempts with the configured server before trying the failsafe one.
    pub server_attempts: u32,

    pub max_flexi_servers: u32,
    pub first_flexi_display: u32,
    /// How many display numbers a flexi worker tries when its number is busy.
    pub flexi_retries: u32,

    pub first_vt: u32,
    pub vt_allocation: bool,

    pub greeter_command: Vec<String>,
    pub greeter_theme: String,
    /// Runs the authentication conversation for `<display> <user>`; exit 0 means accepted.
    pub verify_command: Vec<String>,
    pub session_command: Vec<String>,
    #[serde(default)]
    pub pre_session_command: Option<Vec<String>>,
    #[serde(default)]
    pub post_session_command: Option<Vec<String>>,
    #[serde(default)]
    pub configurator_command: Option<Vec<String>>,
    /// Out-of-process dialog helper used for error/question boxes on attached displays.
    #[serde(default)]
    pub dialog_helper: Option<Vec<String>>,

    #[serde(default)]
    pub halt_command: Option<Vec<String>>,
    #[serde(default)]
    pub reboot_command: Option<Vec<String>>,
    #[serde(default)]
    pub suspend_command: Option<Vec<String>>,

    #[serde(default)]
    pub autologin_user: Option<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            user: "displaymaster".to_string(),
            group: "displaymaster".to_string(),
            pid_file: "/run/displaymaster.pid".into(),
            auth_dir: "/var/lib/displaymaster/auth".into(),
            server_auth_dir: "/var/lib/displaymaster/serverauth".into(),
            log_dir: "/var/log/displaymaster".into(),
            x11_tmp_dir: "/tmp".into(),
            user_authority_file: ".Xauthority".to_string(),
            user_auth_fallback_dir: "/tmp".into(),
            user_max_file: 65536,
            disallow_tcp: true,
            server_user: "root".to_string(),
            server_command: vec!["/usr/bin/X".to_string(), "-br".to_string()],
            failsafe_server_command: None,
            server_timeout_secs: 10,
            server_attempts: 3,
            max_flexi_servers: 5,
            first_flexi_display: 1,
            flexi_retries: 5,
            first_vt: 7,
            vt_allocation: true,
            greeter_command: vec!["/usr/libexec/displaymaster-greeter".to_string()],
            greeter_theme: "default".to_string(),
            verify_command: vec!["/usr/libexec/displaymaster-verify".to_string()],
            session_command: vec!["/etc/X11/Xsession".to_string()],
            pre_session_command: None,
            post_session_command: None,
            configurator_command: None,
            dialog_helper: None,
            halt_command: Some(vec!["/sbin/shutdown".into(), "-h".into(), "now".into()]),
            reboot_command: Some(vec!["/sbin/shutdown".into(), "-r".into(), "now".into()]),
            suspend_command: None,
            autologin_user: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StaticDisplayConfig {
    pub number: u32,
    /// Fixed VT; `None` lets the worker pick one when allocation is on.
    pub vt: Option<u32>,
    /// Whether a greeter runs on this display.
    pub handled: bool,
    pub server_command: Option<Vec<String>>,
}

// -------- YAML file schema (grouped; strict) --------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct UnixSocketConfigFile {
    #[serde(default = "default_sock")]
    path: PathBuf,
    #[serde(default = "default_sock_owner")]
    owner: Option<String>,
    #[serde(default = "default_sock_group")]
    group: Option<String>,
    #[serde(default = "default_sock_mode", deserialize_with = "deserialize_sock_mode")]
    mode: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct StaticDisplayConfigFile {
    number: u32,
    #[serde(default)]
    vt: Option<u32>,
    #[serde(default = "default_handled")]
    handled: bool,
    #[serde(default)]
    server_command: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct MasterConfigFile {
    #[serde(default)]
    unix_socket: Option<UnixSocketConfigFile>,
    #[serde(default)]
    daemon: Option<DaemonConfig>,
    #[serde(default)]
    displays: Option<Vec<StaticDisplayConfigFile>>,
}

fn default_sock() -> PathBuf {
    "/run/displaymaster.sock".into()
}
fn default_sock_mode() -> u32 {
    0o666
}
fn default_sock_owner() -> Option<String> {
    Some("root".to_string())
}
fn default_sock_group() -> Option<String> {
    Some("root".to_string())
}
fn default_handled() -> bool {
    true
}

fn deserialize_sock_mode<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error as _;
    let v = serde_yaml::Value::deserialize(deserializer)?;
    match v {
        serde_yaml::Value::Number(n) => n
            .as_u64()
            .map(|x| x as u32)
            .ok_or_else(|| D::Error::custom("mode must be an integer")),
        serde_yaml::Value::String(s) => parse_mode_str(&s).map_err(D::Error::custom),
        _ => Err(D::Error::custom(
            "mode must be an integer or string (e.g. 666 or \"0666\")",
        )),
    }
}

fn parse_mode_str(s: &str) -> Result<u32, String> {
    let t = s.trim();
    let t = t.strip_prefix("0o").unwrap_or(t);
    let t = t.strip_prefix("0O").unwrap_or(t);
    let t = t.strip_prefix('0').unwrap_or(t);
    u32::from_str_radix(t, 8).map_err(|e| format!("invalid socket mode {s:?}: {e}"))
}

pub fn load_master_config(config_path: &Path) -> anyhow::Result<MasterConfig> {
    let raw = std::fs::read_to_string(config_path)
        .map_err(|e| anyhow::anyhow!("failed to read config {}: {e}", config_path.display()))?;
    parse_master_config(&raw, config_path)
}

/// Parses `raw` as if it had been read from `config_path` (relative paths resolve against its directory).
pub fn parse_master_config(raw: &str, config_path: &Path) -> anyhow::Result<MasterConfig> {
    let file_cfg: MasterConfigFile = serde_yaml::from_str(raw)
        .map_err(|e| anyhow::anyhow!("failed to parse config {}: {e}", config_path.display()))?;

    let mut cfg = MasterConfig {
        sock: default_sock(),
        sock_owner: default_sock_owner(),
        sock_group: default_sock_group(),
        sock_mode: default_sock_mode(),
        daemon: file_cfg.daemon.unwrap_or_default(),
        displays: Vec::new(),
        source: config_path.to_path_buf(),
    };

    if let Some(us) = file_cfg.unix_socket {
        cfg.sock = us.path;
        cfg.sock_owner = us.owner;
        cfg.sock_group = us.group;
        cfg.sock_mode = us.mode;
    }

    let displays = file_cfg.displays.unwrap_or_else(|| {
        vec![StaticDisplayConfigFile {
            number: 0,
            vt: None,
            handled: true,
            server_command: None,
        }]
    });
    let mut seen = HashSet::new();
    for d in displays {
        anyhow::ensure!(
            d.number < MAX_DISPLAY_NUMBER,
            "displays: display number {} out of range (max {})",
            d.number,
            MAX_DISPLAY_NUMBER - 1
        );
        anyhow::ensure!(seen.insert(d.number), "displays: duplicate display number {}", d.number);
        if let Some(cmd) = d.server_command.as_ref() {
            anyhow::ensure!(!cmd.is_empty(), "displays[{}].server_command must not be empty", d.number);
        }
        cfg.displays.push(StaticDisplayConfig {
            number: d.number,
            vt: d.vt,
            handled: d.handled,
            server_command: d.server_command,
        });
    }

    validate_daemon(&cfg.daemon)?;

    // Resolve relative paths against the config file directory.
    let base = config_path.parent().unwrap_or_else(|| Path::new("."));
    let resolve = |p: &mut PathBuf| {
        if p.is_relative() {
            *p = base.join(&*p);
        }
    };
    resolve(&mut cfg.sock);
    resolve(&mut cfg.daemon.pid_file);
    resolve(&mut cfg.daemon.auth_dir);
    resolve(&mut cfg.daemon.server_auth_dir);
    resolve(&mut cfg.daemon.log_dir);
    resolve(&mut cfg.daemon.x11_tmp_dir);
    resolve(&mut cfg.daemon.user_auth_fallback_dir);

    Ok(cfg)
}

fn validate_daemon(d: &DaemonConfig) -> anyhow::Result<()> {
    anyhow::ensure!(!d.user.trim().is_empty(), "daemon.user must not be empty");
    anyhow::ensure!(!d.group.trim().is_empty(), "daemon.group must not be empty");
    anyhow::ensure!(!d.server_command.is_empty(), "daemon.server_command must not be empty");
    if let Some(fs) = d.failsafe_server_command.as_ref() {
        anyhow::ensure!(!fs.is_empty(), "daemon.failsafe_server_command must not be empty if provided");
    }
    anyhow::ensure!(!d.greeter_command.is_empty(), "daemon.greeter_command must not be empty");
    anyhow::ensure!(!d.verify_command.is_empty(), "daemon.verify_command must not be empty");
    anyhow::ensure!(!d.session_command.is_empty(), "daemon.session_command must not be empty");
    anyhow::ensure!(
        d.max_flexi_servers <= 64,
        "daemon.max_flexi_servers must be at most 64 (got {})",
        d.max_flexi_servers
    );
    anyhow::ensure!(
        d.first_flexi_display < MAX_DISPLAY_NUMBER,
        "daemon.first_flexi_display out of range"
    );
    anyhow::ensure!(d.server_timeout_secs > 0, "daemon.server_timeout_secs must be positive");
    anyhow::ensure!(d.server_attempts > 0, "daemon.server_attempts must be positive");
    anyhow::ensure!(
        d.user_authority_file.trim() == d.user_authority_file && !d.user_authority_file.contains('/'),
        "daemon.user_authority_file must be a plain file name (got {:?})",
        d.user_authority_file
    );
    Ok(())
}

impl MasterConfig {
    /// The daemon-wide cookie file used by `AUTH_LOCAL`.
    pub fn global_cookie_file(&self) -> PathBuf {
        self.daemon.auth_dir.join("daemon.cookie")
    }

    pub fn static_display(&self, number: u32) -> Option<&StaticDisplayConfig> {
        self.displays.iter().find(|d| d.number == number)
    }

    /// Server argv for a display: its override, else the daemon-wide command.
    pub fn server_command_for(&self, number: u32) -> &[String] {
        self.static_display(number)
            .and_then(|d| d.server_command.as_deref())
            .unwrap_or(&self.daemon.server_command)
    }

    /// Backs `GET_CONFIG`. `display` scopes the per-display keys.
    pub fn lookup_key(&self, key: &str, display: Option<u32>) -> Option<String> {
        // Clients may send `key=default`; only the key part matters.
        let key = key.split('=').next().unwrap_or(key).trim();
        let d = &self.daemon;
        let join = |v: &[String]| v.join(" ");
        let opt_join = |v: &Option<Vec<String>>| v.as_deref().map(|c| c.join(" ")).unwrap_or_default();
        let path = |p: &Path| p.display().to_string();

        let v = match key.to_ascii_lowercase().as_str() {
            "daemon/user" => d.user.clone(),
            "daemon/group" => d.group.clone(),
            "daemon/pidfile" => path(&d.pid_file),
            "daemon/authdir" => path(&d.auth_dir),
            "daemon/servauthdir" => path(&d.server_auth_dir),
            "daemon/logdir" => path(&d.log_dir),
            "daemon/userauthfile" => d.user_authority_file.clone(),
            "daemon/userauthfbdir" => path(&d.user_auth_fallback_dir),
            "daemon/usermaxfile" => d.user_max_file.to_string(),
            "daemon/greeter" => join(&d.greeter_command),
            "daemon/greetertheme" => d.greeter_theme.clone(),
            "daemon/configurator" => opt_join(&d.configurator_command),
            "daemon/haltcommand" => opt_join(&d.halt_command),
            "daemon/rebootcommand" => opt_join(&d.reboot_command),
            "daemon/suspendcommand" => opt_join(&d.suspend_command),
            "daemon/automaticloginenable" => d.autologin_user.is_some().to_string(),
            "daemon/automaticlogin" => d.autologin_user.clone().unwrap_or_default(),
            "daemon/firstvt" => d.first_vt.to_string(),
            "daemon/vtallocation" => d.vt_allocation.to_string(),
            "daemon/flexibleservers" => d.max_flexi_servers.to_string(),
            "daemon/firstflexidisplay" => d.first_flexi_display.to_string(),
            "server/command" => match display {
                Some(n) => join(self.server_command_for(n)),
                None => join(&d.server_command),
            },
            "server/failsafecommand" => opt_join(&d.failsafe_server_command),
            "server/user" => d.server_user.clone(),
            "server/timeout" => d.server_timeout_secs.to_string(),
            "server/attempts" => d.server_attempts.to_string(),
            "security/disallowtcp" => d.disallow_tcp.to_string(),
            "display/vt" => {
                let sd = self.static_display(display?)?;
                sd.vt.map(|v| v.to_string()).unwrap_or_default()
            }
            "display/handled" => self.static_display(display?)?.handled.to_string(),
            _ => return None,
        };
        Some(v)
    }
}

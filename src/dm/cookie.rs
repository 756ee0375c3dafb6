use crate::dm::config::DaemonConfig;
use crate::dm::display::Display;
use crate::dm::xauth::{
    self, AuthEntry, FAMILY_INTERNET, FAMILY_INTERNET6, FAMILY_LOCAL, FAMILY_WILD, XauthError,
};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use rand::distributions::Alphanumeric;
use rand::{Rng, RngCore};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::net::IpAddr;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const COOKIE_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("unknown user {0}")]
    UnknownUser(String),
    #[error("authentication rejected for {0}")]
    Rejected(String),
    #[error("verification helper failed: {0}")]
    Helper(String),
    #[error(transparent)]
    Xauth(#[from] XauthError),
}

fn io_at(path: &Path) -> impl FnOnce(io::Error) -> AuthError + '_ {
    move |source| AuthError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Where a user's copy of the display entries went, and what revoking must put back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub path: PathBuf,
    /// A private temp file; revoking deletes it instead of editing it.
    pub fallback: bool,
    pub uid: u32,
    /// The exact records the grant wrote.
    pub written: Vec<AuthEntry>,
    /// User records displaced by ours, with their index in the file before the grant.
    pub displaced: Vec<(usize, AuthEntry)>,
    /// Whether the user file was there before the grant.
    pub existed: bool,
}

/// Fresh random secret and its lowercase hex form.
pub fn new_cookie() -> (Vec<u8>, String) {
    let mut buf = vec![0u8; COOKIE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    let hex = hex::encode(&buf);
    (buf, hex)
}

/// Writes `bytes` to `path` through a sibling temp file, so readers never see a partial file.
pub fn write_file_atomic(path: &Path, bytes: &[u8], mode: u32, owner: Option<(u32, u32)>) -> io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let file_name = path.file_name().and_then(|s| s.to_str()).unwrap_or("auth");
    let tmp = parent.join(format!(".{file_name}.tmp.{}", std::process::id()));
    let _ = fs::remove_file(&tmp);
    let res = (|| {
        let mut f = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(mode)
            .open(&tmp)?;
        f.write_all(bytes)?;
        if let Some((uid, gid)) = owner {
            std::os::unix::fs::fchown(&f, Some(uid), Some(gid))?;
        }
        f.sync_all()?;
        fs::rename(&tmp, path)
    })();
    if res.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    res
}

/// Mints the daemon-wide cookie and stores its hex form (mode 0600).
pub fn write_global_cookie(path: &Path) -> io::Result<String> {
    let (_, hex) = new_cookie();
    write_file_atomic(path, format!("{hex}\n").as_bytes(), 0o600, None)?;
    Ok(hex)
}

pub fn read_global_cookie(path: &Path) -> io::Result<String> {
    Ok(fs::read_to_string(path)?.trim().to_string())
}

/// Entries a display is reachable on, all carrying `secret`.
pub fn entries_for(
    number: u32,
    is_local: bool,
    hostnames: &[String],
    addresses: &[IpAddr],
    disallow_tcp: bool,
    secret: &[u8],
) -> Vec<AuthEntry> {
    let mut out = vec![AuthEntry::cookie(FAMILY_WILD, Vec::new(), number, secret)];
    let mut push = |e: AuthEntry| {
        if !out.iter().any(|x| x.same_target(&e)) {
            out.push(e);
        }
    };
    if is_local {
        for h in hostnames.iter().map(String::as_str).chain(["localhost", "localhost.localdomain"]) {
            if !h.is_empty() {
                push(AuthEntry::cookie(FAMILY_LOCAL, h.as_bytes().to_vec(), number, secret));
            }
        }
        if !disallow_tcp {
            push(AuthEntry::cookie(FAMILY_INTERNET, vec![127, 0, 0, 1], number, secret));
        }
    }
    if !is_local || !disallow_tcp {
        for a in addresses {
            let e = match a {
                IpAddr::V4(v4) => AuthEntry::cookie(FAMILY_INTERNET, v4.octets().to_vec(), number, secret),
                IpAddr::V6(v6) => AuthEntry::cookie(FAMILY_INTERNET6, v6.octets().to_vec(), number, secret),
            };
            push(e);
        }
    }
    out
}

pub fn local_hostnames() -> Vec<String> {
    match nix::unistd::gethostname() {
        Ok(h) => vec![h.to_string_lossy().into_owned()],
        Err(e) => {
            tracing::warn!("gethostname failed: {e}");
            Vec::new()
        }
    }
}

/// Non-loopback addresses bound on this host.
pub fn local_addresses() -> Vec<IpAddr> {
    let mut out = Vec::new();
    let Ok(ifs) = nix::ifaddrs::getifaddrs() else {
        return out;
    };
    for ifa in ifs {
        let Some(addr) = ifa.address else { continue };
        let ip = if let Some(sin) = addr.as_sockaddr_in() {
            IpAddr::V4(*std::net::SocketAddrV4::from(*sin).ip())
        } else if let Some(sin6) = addr.as_sockaddr_in6() {
            IpAddr::V6(*std::net::SocketAddrV6::from(*sin6).ip())
        } else {
            continue;
        };
        if !ip.is_loopback() && !out.contains(&ip) {
            out.push(ip);
        }
    }
    out
}

#[derive(Debug, Clone)]
pub struct CookieAuthority {
    pub auth_dir: PathBuf,
    pub server_auth_dir: PathBuf,
    /// uid/gid of the server identity when it is not root.
    pub server_owner: Option<(u32, u32)>,
    pub disallow_tcp: bool,
    pub user_authority_file: String,
    pub fallback_dir: PathBuf,
    pub user_max_file: u64,
}

impl CookieAuthority {
    pub fn from_config(cfg: &DaemonConfig) -> Result<Self, AuthError> {
        let server_owner = if cfg.server_user == "root" {
            None
        } else {
            let u = users::get_user_by_name(&cfg.server_user)
                .ok_or_else(|| AuthError::UnknownUser(cfg.server_user.clone()))?;
            (u.uid() != 0).then(|| (u.uid(), u.primary_group_id()))
        };
        Ok(Self {
            auth_dir: cfg.auth_dir.clone(),
            server_auth_dir: cfg.server_auth_dir.clone(),
            server_owner,
            disallow_tcp: cfg.disallow_tcp,
            user_authority_file: cfg.user_authority_file.clone(),
            fallback_dir: cfg.user_auth_fallback_dir.clone(),
            user_max_file: cfg.user_max_file,
        })
    }

    fn root_file(&self, d: &Display) -> PathBuf {
        self.auth_dir.join(format!("{}.Xauth", d.name))
    }

    fn server_file(&self, d: &Display) -> PathBuf {
        self.server_auth_dir.join(format!("{}.Xauth", d.name))
    }

    /// Mints a new cookie for `d` and writes its authority files, replacing any previous ones.
    pub fn secure_display(&self, d: &mut Display) -> Result<(), AuthError> {
        let (hostnames, addresses) = if d.is_local {
            (
                local_hostnames(),
                if self.disallow_tcp { Vec::new() } else { local_addresses() },
            )
        } else {
            (Vec::new(), d.addresses.clone())
        };
        self.secure_display_with(d, &hostnames, &addresses)
    }

    pub fn secure_display_with(
        &self,
        d: &mut Display,
        hostnames: &[String],
        addresses: &[IpAddr],
    ) -> Result<(), AuthError> {
        self.purge_display_entries(d);

        let (cookie, cookie_hex) = new_cookie();
        let auths = entries_for(d.number, d.is_local, hostnames, addresses, self.disallow_tcp, &cookie);
        let bytes = xauth::encode_all(&auths)?;

        let root = self.root_file(d);
        write_file_atomic(&root, &bytes, 0o600, None).map_err(io_at(&root))?;
        let server_copy = match self.server_owner {
            Some(owner) => {
                let p = self.server_file(d);
                if let Err(e) = write_file_atomic(&p, &bytes, 0o600, Some(owner)) {
                    let _ = fs::remove_file(&root);
                    return Err(AuthError::Io { path: p, source: e });
                }
                Some(p)
            }
            None => None,
        };

        d.local_auths = auths.iter().filter(|e| e.family != FAMILY_WILD).cloned().collect();
        d.auths = auths;
        d.cookie = cookie;
        d.cookie_hex = cookie_hex;
        d.authfile = Some(root);
        d.authfile_server = server_copy;
        Ok(())
    }

    /// Removes the display's authority files and forgets its entries.
    pub fn purge_display_entries(&self, d: &mut Display) {
        for p in [d.authfile.take(), d.authfile_server.take()].into_iter().flatten() {
            if let Err(e) = fs::remove_file(&p)
                && e.kind() != io::ErrorKind::NotFound
            {
                tracing::warn!("display={} remove {} failed: {e}", d.name, p.display());
            }
        }
        d.auths.clear();
        d.local_auths.clear();
    }

    /// Copies the display's entries into the user's authority file, or into a private temp file
    /// when that file does not look safe to touch.
    pub fn grant(&self, d: &mut Display, uid: u32, gid: u32, home: &Path) -> Result<Grant, AuthError> {
        let entries = if d.local_auths.is_empty() { d.auths.clone() } else { d.local_auths.clone() };
        let path = home.join(&self.user_authority_file);

        if d.user_grant.is_some()
            && let Err(e) = self.revoke(d)
        {
            tracing::warn!("display={} revoking the previous grant failed: {e}", d.name);
        }

        let grant = match self.check_user_file(home, &path, uid) {
            Ok(()) => match self.merge_into_real(&path, &entries, uid, gid) {
                Ok((existed, displaced)) => Grant {
                    path,
                    fallback: false,
                    uid,
                    written: entries,
                    displaced,
                    existed,
                },
                Err(e) => {
                    tracing::warn!("display={} cannot update {}: {e}; using fallback", d.name, path.display());
                    self.write_fallback(&entries, uid, gid)?
                }
            },
            Err(reason) => {
                tracing::warn!("display={} {} rejected: {reason}; using fallback", d.name, path.display());
                self.write_fallback(&entries, uid, gid)?
            }
        };
        d.user_grant = Some(grant.clone());
        Ok(grant)
    }

    /// Paranoia checks run before the user's own authority file is ever opened.
    pub fn check_user_file(&self, home: &Path, path: &Path, uid: u32) -> Result<(), String> {
        let hm = fs::symlink_metadata(home).map_err(|e| format!("home {}: {e}", home.display()))?;
        if !hm.is_dir() {
            return Err(format!("home {} is not a directory", home.display()));
        }
        if hm.uid() != uid {
            return Err(format!("home {} owned by uid {} not {uid}", home.display(), hm.uid()));
        }
        if hm.mode() & 0o002 != 0 {
            return Err(format!("home {} is world writable", home.display()));
        }
        if on_network_fs(home) {
            return Err(format!("home {} is on a network filesystem", home.display()));
        }
        let fm = match fs::symlink_metadata(path) {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(format!("stat: {e}")),
        };
        if fm.file_type().is_symlink() {
            return Err("is a symlink".to_string());
        }
        if !fm.is_file() {
            return Err("not a regular file".to_string());
        }
        if fm.uid() != uid {
            return Err(format!("owned by uid {} not {uid}", fm.uid()));
        }
        if fm.mode() & 0o022 != 0 {
            return Err(format!("mode {:o} is group/world writable", fm.mode() & 0o7777));
        }
        if fm.nlink() != 1 {
            return Err(format!("has {} hard links", fm.nlink()));
        }
        if fm.size() > self.user_max_file {
            return Err(format!("size {} exceeds {}", fm.size(), self.user_max_file));
        }
        Ok(())
    }

    /// Adds `entries` to the user's file. Returns whether the file existed
    /// and the same-target records that were taken out to make room.
    fn merge_into_real(
        &self,
        path: &Path,
        entries: &[AuthEntry],
        uid: u32,
        gid: u32,
    ) -> Result<(bool, Vec<(usize, AuthEntry)>), AuthError> {
        let existed = path.exists();
        let f = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o600)
            .custom_flags(libc::O_NOFOLLOW)
            .open(path)
            .map_err(io_at(path))?;
        let mut f = lock_exclusive(f).map_err(io_at(path))?;

        let meta = f.metadata().map_err(io_at(path))?;
        if existed && (meta.uid() != uid || meta.nlink() != 1) {
            return Err(AuthError::Io {
                path: path.to_path_buf(),
                source: io::Error::new(io::ErrorKind::PermissionDenied, "file changed under us"),
            });
        }
        if !existed && nix::unistd::geteuid().is_root() {
            std::os::unix::fs::fchown(&*f, Some(uid), Some(gid)).map_err(io_at(path))?;
        }

        let mut raw = Vec::new();
        f.read_to_end(&mut raw).map_err(io_at(path))?;
        let current = xauth::decode_all(&raw)?;
        let (displaced, kept): (Vec<_>, Vec<_>) = current
            .into_iter()
            .enumerate()
            .partition(|(_, c)| entries.iter().any(|e| e.same_target(c)));
        if displaced.is_empty() {
            f.seek(SeekFrom::End(0)).map_err(io_at(path))?;
            f.write_all(&xauth::encode_all(entries)?).map_err(io_at(path))?;
            f.sync_all().map_err(io_at(path))?;
        } else {
            // The X client takes the first match, so same-target records have to go.
            let mut next: Vec<AuthEntry> = kept.into_iter().map(|(_, c)| c).collect();
            next.extend_from_slice(entries);
            rewrite_in_place(&mut f, &xauth::encode_all(&next)?).map_err(io_at(path))?;
        }
        Ok((existed, displaced))
    }

    fn write_fallback(&self, entries: &[AuthEntry], uid: u32, gid: u32) -> Result<Grant, AuthError> {
        fs::create_dir_all(&self.fallback_dir).map_err(io_at(&self.fallback_dir))?;
        let bytes = xauth::encode_all(entries)?;
        // A few attempts in case a name is already taken.
        let mut last_err = None;
        for _ in 0..5 {
            let suffix: String = rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(10)
                .map(char::from)
                .collect();
            let path = self.fallback_dir.join(format!(".dmauth{suffix}"));
            let mut f = match OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o600)
                .custom_flags(libc::O_NOFOLLOW)
                .open(&path)
            {
                Ok(f) => f,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    last_err = Some(e);
                    continue;
                }
                Err(e) => return Err(AuthError::Io { path, source: e }),
            };
            f.write_all(&bytes).map_err(io_at(&path))?;
            if nix::unistd::geteuid().is_root() {
                std::os::unix::fs::fchown(&f, Some(uid), Some(gid)).map_err(io_at(&path))?;
            }
            return Ok(Grant {
                path,
                fallback: true,
                uid,
                written: entries.to_vec(),
                displaced: Vec::new(),
                existed: false,
            });
        }
        Err(AuthError::Io {
            path: self.fallback_dir.clone(),
            source: last_err.unwrap_or_else(|| io::Error::other("no free fallback name")),
        })
    }

    /// Undoes the last grant on `d`: our records leave the user's file and
    /// the ones they displaced return to their old places.
    pub fn revoke(&self, d: &mut Display) -> Result<(), AuthError> {
        let Some(grant) = d.user_grant.take() else {
            return Ok(());
        };
        if grant.fallback {
            return match fs::remove_file(&grant.path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(AuthError::Io {
                    path: grant.path,
                    source: e,
                }),
            };
        }

        let path = grant.path.as_path();
        let f = match OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOFOLLOW)
            .open(path)
        {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(AuthError::Io { path: path.to_path_buf(), source: e }),
        };
        let mut f = lock_exclusive(f).map_err(io_at(path))?;
        let mut raw = Vec::new();
        f.read_to_end(&mut raw).map_err(io_at(path))?;
        let current = match xauth::decode_all(&raw) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("display={} {} unreadable ({e}); leaving it alone", d.name, path.display());
                return Ok(());
            }
        };
        let mut kept: Vec<AuthEntry> = current.into_iter().filter(|c| !grant.written.contains(c)).collect();
        for (at, e) in grant.displaced {
            kept.insert(at.min(kept.len()), e);
        }
        if kept.is_empty() && !grant.existed {
            fs::remove_file(path).map_err(io_at(path))?;
        } else {
            rewrite_in_place(&mut f, &xauth::encode_all(&kept)?).map_err(io_at(path))?;
        }
        Ok(())
    }
}

fn rewrite_in_place(f: &mut File, bytes: &[u8]) -> io::Result<()> {
    f.set_len(0)?;
    f.seek(SeekFrom::Start(0))?;
    f.write_all(bytes)?;
    f.sync_all()
}

fn on_network_fs(path: &Path) -> bool {
    match nix::sys::statfs::statfs(path) {
        Ok(st) => st.filesystem_type() == nix::sys::statfs::NFS_SUPER_MAGIC,
        Err(_) => false,
    }
}

const LOCK_ATTEMPTS: u32 = 10;
const LOCK_RETRY: Duration = Duration::from_millis(100);

/// Exclusive advisory lock on `file`, released when the guard drops.
fn lock_exclusive(mut file: File) -> io::Result<Flock<File>> {
    for _ in 0..LOCK_ATTEMPTS {
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(locked) => return Ok(locked),
            Err((f, Errno::EAGAIN)) => {
                file = f;
                std::thread::sleep(LOCK_RETRY);
            }
            Err((_, e)) => return Err(e.into()),
        }
    }
    Err(io::Error::new(io::ErrorKind::WouldBlock, "authority file is locked"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn authority(tmp: &Path) -> CookieAuthority {
        CookieAuthority {
            auth_dir: tmp.join("auth"),
            server_auth_dir: tmp.join("serverauth"),
            server_owner: None,
            disallow_tcp: true,
            user_authority_file: ".Xauthority".to_string(),
            fallback_dir: tmp.join("fallback"),
            user_max_file: 65536,
        }
    }

    fn me() -> (u32, u32) {
        (nix::unistd::getuid().as_raw(), nix::unistd::getgid().as_raw())
    }

    fn secured(ca: &CookieAuthority) -> Display {
        let mut d = Display::new_static(0, Some(7), true);
        ca.secure_display_with(&mut d, &["box".to_string()], &[]).unwrap();
        d
    }

    fn home_dir(tmp: &Path) -> PathBuf {
        let home = tmp.join("home");
        fs::create_dir(&home).unwrap();
        fs::set_permissions(&home, fs::Permissions::from_mode(0o700)).unwrap();
        home
    }

    #[test]
    fn local_entries_cover_wild_and_local_names() {
        let e = entries_for(0, true, &["box".into()], &[], true, &[9; 16]);
        let fams: Vec<_> = e.iter().map(|x| (x.family, String::from_utf8_lossy(&x.address).into_owned())).collect();
        assert_eq!(
            fams,
            vec![
                (FAMILY_WILD, String::new()),
                (FAMILY_LOCAL, "box".into()),
                (FAMILY_LOCAL, "localhost".into()),
                (FAMILY_LOCAL, "localhost.localdomain".into()),
            ]
        );
        let tcp = entries_for(0, true, &[], &["192.168.1.5".parse().unwrap()], false, &[9; 16]);
        assert!(tcp.iter().any(|x| x.family == FAMILY_INTERNET && x.address == vec![127, 0, 0, 1]));
        assert!(tcp.iter().any(|x| x.family == FAMILY_INTERNET && x.address == vec![192, 168, 1, 5]));
    }

    #[test]
    fn remote_entries_use_peer_addresses() {
        let e = entries_for(2, false, &[], &["10.1.2.3".parse().unwrap(), "::2".parse().unwrap()], true, &[1; 16]);
        assert_eq!(e.len(), 3);
        assert_eq!(e[1].address, vec![10, 1, 2, 3]);
        assert_eq!(e[2].family, FAMILY_INTERNET6);
    }

    #[test]
    fn securing_twice_leaves_only_the_new_secret_on_disk() {
        let tmp = TempDir::new().unwrap();
        let ca = authority(tmp.path());
        let mut d = secured(&ca);
        let first = d.cookie.clone();
        ca.secure_display_with(&mut d, &["box".to_string()], &[]).unwrap();
        assert_ne!(first, d.cookie);

        let path = d.authfile.clone().unwrap();
        let on_disk = xauth::decode_all(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(on_disk.len(), d.auths.len());
        assert!(on_disk.iter().all(|e| e.data == d.cookie));
        assert_eq!(fs::metadata(&path).unwrap().permissions().mode() & 0o777, 0o600);
        assert_eq!(d.local_auths.len(), d.auths.len() - 1);
        assert_eq!(d.cookie_hex, hex::encode(&d.cookie));
    }

    #[test]
    fn purge_removes_files() {
        let tmp = TempDir::new().unwrap();
        let ca = authority(tmp.path());
        let mut d = secured(&ca);
        let path = d.authfile.clone().unwrap();
        ca.purge_display_entries(&mut d);
        assert!(!path.exists());
        assert!(d.auths.is_empty());
        // Idempotent.
        ca.purge_display_entries(&mut d);
    }

    #[test]
    fn grant_then_revoke_restores_real_file_bytes() {
        let tmp = TempDir::new().unwrap();
        let ca = authority(tmp.path());
        let (uid, gid) = me();
        let home = home_dir(tmp.path());
        let xa = home.join(".Xauthority");
        let foreign = AuthEntry::cookie(FAMILY_LOCAL, b"otherhost".to_vec(), 5, &[7; 16]);
        let before = xauth::encode_all(&[foreign]).unwrap();
        fs::write(&xa, &before).unwrap();
        fs::set_permissions(&xa, fs::Permissions::from_mode(0o600)).unwrap();

        let mut d = secured(&ca);
        let g = ca.grant(&mut d, uid, gid, &home).unwrap();
        assert!(!g.fallback);
        assert_eq!(g.path, xa);
        let during = xauth::decode_all(&fs::read(&xa).unwrap()).unwrap();
        assert_eq!(during.len(), 1 + d.local_auths.len());

        ca.revoke(&mut d).unwrap();
        assert_eq!(fs::read(&xa).unwrap(), before);
        assert!(d.user_grant.is_none());
    }

    #[test]
    fn revoke_keeps_a_file_that_was_empty_before_the_grant() {
        let tmp = TempDir::new().unwrap();
        let ca = authority(tmp.path());
        let (uid, gid) = me();
        let home = home_dir(tmp.path());
        let xa = home.join(".Xauthority");
        fs::write(&xa, b"").unwrap();
        fs::set_permissions(&xa, fs::Permissions::from_mode(0o600)).unwrap();

        let mut d = secured(&ca);
        let g = ca.grant(&mut d, uid, gid, &home).unwrap();
        assert!(!g.fallback);
        assert!(g.existed);
        assert!(!fs::read(&xa).unwrap().is_empty());

        ca.revoke(&mut d).unwrap();
        assert!(xa.exists());
        assert_eq!(fs::read(&xa).unwrap(), b"");
    }

    #[test]
    fn revoke_puts_back_a_same_target_user_record_in_place() {
        let tmp = TempDir::new().unwrap();
        let ca = authority(tmp.path());
        let (uid, gid) = me();
        let home = home_dir(tmp.path());
        let xa = home.join(".Xauthority");
        let mine = AuthEntry::cookie(FAMILY_LOCAL, b"box".to_vec(), 0, &[9; 16]);
        let other = AuthEntry::cookie(FAMILY_LOCAL, b"otherhost".to_vec(), 5, &[7; 16]);
        let before = xauth::encode_all(&[mine.clone(), other.clone()]).unwrap();
        fs::write(&xa, &before).unwrap();
        fs::set_permissions(&xa, fs::Permissions::from_mode(0o600)).unwrap();

        let mut d = secured(&ca);
        assert!(d.local_auths.iter().any(|e| e.same_target(&mine)));
        let g = ca.grant(&mut d, uid, gid, &home).unwrap();
        assert!(!g.fallback);
        assert_eq!(g.displaced, vec![(0, mine.clone())]);
        let during = xauth::decode_all(&fs::read(&xa).unwrap()).unwrap();
        assert!(!during.contains(&mine));
        assert_eq!(during[0], other);

        ca.revoke(&mut d).unwrap();
        assert_eq!(fs::read(&xa).unwrap(), before);
    }

    #[test]
    fn revoke_keeps_records_the_user_added_meanwhile() {
        let tmp = TempDir::new().unwrap();
        let ca = authority(tmp.path());
        let (uid, gid) = me();
        let home = home_dir(tmp.path());
        let xa = home.join(".Xauthority");
        let mut d = secured(&ca);
        ca.grant(&mut d, uid, gid, &home).unwrap();

        let added = AuthEntry::cookie(FAMILY_LOCAL, b"laptop".to_vec(), 1, &[3; 16]);
        let mut raw = fs::read(&xa).unwrap();
        raw.extend(xauth::encode_all(std::slice::from_ref(&added)).unwrap());
        fs::write(&xa, &raw).unwrap();

        ca.revoke(&mut d).unwrap();
        assert_eq!(xauth::decode_all(&fs::read(&xa).unwrap()).unwrap(), vec![added]);
    }

    #[test]
    fn grant_creates_and_revoke_deletes_missing_file() {
        let tmp = TempDir::new().unwrap();
        let ca = authority(tmp.path());
        let (uid, gid) = me();
        let home = home_dir(tmp.path());
        let mut d = secured(&ca);
        ca.grant(&mut d, uid, gid, &home).unwrap();
        // A second grant replaces rather than duplicates.
        ca.grant(&mut d, uid, gid, &home).unwrap();
        let on_disk = xauth::decode_all(&fs::read(home.join(".Xauthority")).unwrap()).unwrap();
        assert_eq!(on_disk.len(), d.local_auths.len());
        ca.revoke(&mut d).unwrap();
        assert!(!home.join(".Xauthority").exists());
    }

    #[test]
    fn world_writable_file_forces_fallback_and_is_never_touched() {
        let tmp = TempDir::new().unwrap();
        let ca = authority(tmp.path());
        let (uid, gid) = me();
        let home = home_dir(tmp.path());
        let xa = home.join(".Xauthority");
        fs::write(&xa, b"").unwrap();
        fs::set_permissions(&xa, fs::Permissions::from_mode(0o666)).unwrap();

        let mut d = secured(&ca);
        let g = ca.grant(&mut d, uid, gid, &home).unwrap();
        assert!(g.fallback);
        assert!(g.path.starts_with(tmp.path().join("fallback")));
        assert_eq!(fs::read(&xa).unwrap(), b"");
        ca.revoke(&mut d).unwrap();
        assert!(!g.path.exists());
    }

    #[test]
    fn fallback_revoke_leaves_the_rejected_file_byte_identical() {
        let tmp = TempDir::new().unwrap();
        let ca = authority(tmp.path());
        let (uid, gid) = me();
        let home = home_dir(tmp.path());
        let xa = home.join(".Xauthority");
        let mine = AuthEntry::cookie(FAMILY_LOCAL, b"box".to_vec(), 0, &[9; 16]);
        let before = xauth::encode_all(&[mine]).unwrap();
        fs::write(&xa, &before).unwrap();
        fs::set_permissions(&xa, fs::Permissions::from_mode(0o622)).unwrap();

        let mut d = secured(&ca);
        let g = ca.grant(&mut d, uid, gid, &home).unwrap();
        assert!(g.fallback);
        assert_eq!(xauth::decode_all(&fs::read(&g.path).unwrap()).unwrap(), d.local_auths);
        ca.revoke(&mut d).unwrap();
        assert_eq!(fs::read(&xa).unwrap(), before);
        assert_eq!(fs::read_dir(tmp.path().join("fallback")).unwrap().count(), 0);
    }

    #[test]
    fn foreign_owner_forces_fallback() {
        let tmp = TempDir::new().unwrap();
        let ca = authority(tmp.path());
        let (uid, gid) = me();
        let home = home_dir(tmp.path());
        fs::write(home.join(".Xauthority"), b"").unwrap();
        let mut d = secured(&ca);
        // The files belong to us, not to this other uid.
        let g = ca.grant(&mut d, uid + 1, gid, &home).unwrap();
        assert!(g.fallback);
        assert_eq!(fs::read(home.join(".Xauthority")).unwrap(), b"");
        ca.revoke(&mut d).unwrap();
    }

    #[test]
    fn symlink_and_oversize_are_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut ca = authority(tmp.path());
        let (uid, _) = me();
        let home = home_dir(tmp.path());
        let target = tmp.path().join("target");
        fs::write(&target, b"").unwrap();
        std::os::unix::fs::symlink(&target, home.join(".Xauthority")).unwrap();
        assert!(ca.check_user_file(&home, &home.join(".Xauthority"), uid).is_err());

        fs::remove_file(home.join(".Xauthority")).unwrap();
        fs::write(home.join(".Xauthority"), vec![0u8; 100]).unwrap();
        fs::set_permissions(home.join(".Xauthority"), fs::Permissions::from_mode(0o600)).unwrap();
        ca.user_max_file = 10;
        let err = ca.check_user_file(&home, &home.join(".Xauthority"), uid).unwrap_err();
        assert!(err.contains("exceeds"), "{err}");
    }

    #[test]
    fn revoke_leaves_malformed_file_alone() {
        let tmp = TempDir::new().unwrap();
        let ca = authority(tmp.path());
        let (uid, gid) = me();
        let home = home_dir(tmp.path());
        let mut d = secured(&ca);
        ca.grant(&mut d, uid, gid, &home).unwrap();
        let xa = home.join(".Xauthority");
        let mut junk = fs::read(&xa).unwrap();
        junk.extend_from_slice(&[0, 1, 0]);
        fs::write(&xa, &junk).unwrap();
        ca.revoke(&mut d).unwrap();
        assert_eq!(fs::read(&xa).unwrap(), junk);
    }

    #[test]
    fn global_cookie_file_is_private_hex() {
        let tmp = TempDir::new().unwrap();
        let p = tmp.path().join("auth/daemon.cookie");
        let hex = write_global_cookie(&p).unwrap();
        assert_eq!(hex.len(), COOKIE_LEN * 2);
        assert_eq!(read_global_cookie(&p).unwrap(), hex);
        assert_eq!(fs::metadata(&p).unwrap().permissions().mode() & 0o777, 0o600);
    }
}

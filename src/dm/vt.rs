use std::fs::OpenOptions;
use std::io;
use std::os::fd::AsRawFd;
use std::path::Path;

const VT_ACTIVATE: libc::c_ulong = 0x5606;
const VT_WAITACTIVE: libc::c_ulong = 0x5607;

/// VTs above this are not real consoles.
pub const MAX_VT: u32 = 63;

pub const ACTIVE_VT_PATH: &str = "/sys/class/tty/tty0/active";
pub const CONSOLE_PATH: &str = "/dev/tty0";

/// `tty7` -> 7
pub fn parse_active(s: &str) -> Option<u32> {
    s.trim().strip_prefix("tty")?.parse().ok()
}

pub fn query_active_vt_at(path: &Path) -> io::Result<u32> {
    let raw = std::fs::read_to_string(path)?;
    parse_active(&raw).ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, format!("unexpected active vt {raw:?}")))
}

pub fn query_active_vt() -> io::Result<u32> {
    query_active_vt_at(Path::new(ACTIVE_VT_PATH))
}

/// Switches the console to `vt` and waits until the switch completed.
pub fn activate_vt(vt: u32) -> io::Result<()> {
    if vt == 0 || vt > MAX_VT {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, format!("invalid vt {vt}")));
    }
    let console = OpenOptions::new().write(true).open(CONSOLE_PATH)?;
    let fd = console.as_raw_fd();
    // SAFETY: fd is an open console; both requests take the VT number by value.
    unsafe {
        if libc::ioctl(fd, VT_ACTIVATE as _, vt as libc::c_int) < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::ioctl(fd, VT_WAITACTIVE as _, vt as libc::c_int) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Lowest VT at or above `first` that no other display holds.
pub fn pick_vt(first: u32, taken: &[u32]) -> Option<u32> {
    (first.max(1)..=MAX_VT).find(|v| !taken.contains(v))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sysfs_value() {
        assert_eq!(parse_active("tty7\n"), Some(7));
        assert_eq!(parse_active("ttyS0"), None);
        assert_eq!(parse_active(""), None);
    }

    #[test]
    fn reads_active_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let p = tmp.path().join("active");
        std::fs::write(&p, "tty2\n").unwrap();
        assert_eq!(query_active_vt_at(&p).unwrap(), 2);
    }

    #[test]
    fn picks_first_free() {
        assert_eq!(pick_vt(7, &[7, 8]), Some(9));
        assert_eq!(pick_vt(7, &[]), Some(7));
        assert_eq!(pick_vt(0, &[]), Some(1));
        let all: Vec<u32> = (1..=MAX_VT).collect();
        assert_eq!(pick_vt(1, &all), None);
    }

    #[test]
    fn rejects_out_of_range_vt() {
        assert_eq!(activate_vt(0).unwrap_err().kind(), io::ErrorKind::InvalidInput);
        assert_eq!(activate_vt(MAX_VT + 1).unwrap_err().kind(), io::ErrorKind::InvalidInput);
    }
}

use chrono::TimeZone as _;

pub fn build_host() -> &'static str {
    option_env!("DISPLAYMASTER_BUILD_HOST").unwrap_or("unknown")
}

pub fn build_commit() -> &'static str {
    option_env!("DISPLAYMASTER_BUILD_COMMIT").unwrap_or("-")
}

pub fn build_time_raw() -> &'static str {
    option_env!("DISPLAYMASTER_BUILD_TIME").unwrap_or("unknown")
}

/// Renders the `epoch:<secs>` stamp produced by build.rs as a UTC date.
pub fn format_build_time(raw: &str) -> String {
    let raw = raw.trim();
    let Some(secs) = raw.strip_prefix("epoch:").and_then(|s| s.trim().parse::<i64>().ok()) else {
        return raw.to_string();
    };
    match chrono::Utc.timestamp_opt(secs, 0).single() {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => raw.to_string(),
    }
}

/// Reply payload of the `VERSION` control command.
pub fn version_line() -> String {
    format!("DISPLAYMASTER {}", env!("CARGO_PKG_VERSION"))
}

pub fn banner() -> String {
    format!(
        "Display master {} (commit {}, built on {} at {}).",
        env!("CARGO_PKG_VERSION"),
        build_commit(),
        build_host(),
        format_build_time(build_time_raw())
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_stamp_is_rendered_in_utc() {
        assert_eq!(format_build_time("epoch:0"), "1970-01-01 00:00:00");
        assert_eq!(format_build_time("epoch:86400"), "1970-01-02 00:00:00");
    }

    #[test]
    fn unknown_stamp_passes_through() {
        assert_eq!(format_build_time("unknown"), "unknown");
        assert_eq!(format_build_time("epoch:nope"), "epoch:nope");
    }

    #[test]
    fn version_line_names_the_daemon() {
        assert!(version_line().starts_with("DISPLAYMASTER "));
    }
}

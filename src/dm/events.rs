use chrono::Local;
use std::collections::VecDeque;

/// Events kept for the `EVENTS` control command.
pub const EVENT_RING_CAPACITY: usize = 2000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventEntry {
    pub ts: String,
    pub component: String,
    pub display: Option<String>,
    pub message: String,
}

impl EventEntry {
    /// One-line rendering used on the control socket, where `;` separates entries.
    pub fn render(&self) -> String {
        let line = match &self.display {
            Some(d) => format!("{} [{}] display={} {}", self.ts, self.component, d, self.message),
            None => format!("{} [{}] {}", self.ts, self.component, self.message),
        };
        line.replace(';', ",")
    }
}

/// Emit one operational event line: `[component] display=<name> key=value ...`.
pub fn dm_event(component: &str, display: Option<&str>, msg: impl AsRef<str>) {
    match display {
        Some(d) => tracing::info!(target: "displaymaster", "[{component}] display={d} {}", msg.as_ref()),
        None => tracing::info!(target: "displaymaster", "[{component}] {}", msg.as_ref()),
    }
}

#[derive(Debug, Default)]
pub struct EventRing {
    entries: VecDeque<EventEntry>,
}

impl EventRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Logs the event and keeps it for later inspection.
    pub fn push(&mut self, component: &str, display: Option<&str>, msg: impl AsRef<str>) {
        dm_event(component, display, msg.as_ref());
        self.entries.push_back(EventEntry {
            ts: Local::now().format("%Y-%m-%d_%H:%M:%S%.3f").to_string(),
            component: component.to_string(),
            display: display.map(str::to_string),
            message: msg.as_ref().to_string(),
        });
        while self.entries.len() > EVENT_RING_CAPACITY {
            self.entries.pop_front();
        }
    }

    /// The newest `n` entries, oldest first.
    pub fn tail(&self, n: usize) -> impl Iterator<Item = &EventEntry> {
        self.entries.iter().skip(self.entries.len().saturating_sub(n))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Installs the stderr subscriber shared by the master and its workers.
///
/// The filter comes from `DM_LOG` (e.g. `DM_LOG=debug`), defaulting to `info`.
pub fn init_logging(role: &str) {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_env("DM_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let r = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
    if r.is_ok() {
        tracing::debug!("logging initialised role={role}");
    }
}

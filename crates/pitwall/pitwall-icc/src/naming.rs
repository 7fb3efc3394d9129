//! Region names: `$<App>_<Kind>$`, optionally followed by the producer's
//! process id and preceded by a global namespace marker.

use std::fmt::Write;

/// Marker for regions visible across sessions.
pub const GLOBAL_NAMESPACE_PREFIX: &str = "Global\\";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegionNamer {
    app: String,
    pid: Option<u32>,
    global: bool,
}

impl RegionNamer {
    pub fn new(app: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            pid: None,
            global: false,
        }
    }

    /// Suffix every name with `pid`, for hosts running several instances.
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn global(mut self, global: bool) -> Self {
        self.global = global;
        self
    }

    pub fn name(&self, kind: &str) -> String {
        let mut name = String::with_capacity(self.app.len() + kind.len() + 16);
        if self.global {
            name.push_str(GLOBAL_NAMESPACE_PREFIX);
        }
        let _ = write!(name, "${}_{}$", self.app, kind);
        if let Some(pid) = self.pid {
            let _ = write!(name, "{pid}");
        }
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_name() {
        assert_eq!(RegionNamer::new("Pitwall").name("Telemetry"), "$Pitwall_Telemetry$");
    }

    #[test]
    fn pid_suffix_and_global_prefix() {
        let namer = RegionNamer::new("Pitwall").with_pid(4242).global(true);
        assert_eq!(namer.name("Scoring"), "Global\\$Pitwall_Scoring$4242");
    }
}

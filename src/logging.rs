//! Debug logging, explicitly constructed rather than ambient.
//!
//! `main` reads `ROOST_DEBUG` once and hands the resulting instance to the
//! components that want it; everything else gets the disabled default.

#[derive(Debug, Clone, Copy, Default)]
pub struct DebugLog {
    enabled: bool,
}

impl DebugLog {
    /// Enabled when `ROOST_DEBUG` is set to anything but empty or `0`.
    pub fn from_env() -> Self {
        let enabled = std::env::var("ROOST_DEBUG")
            .map(|v| !v.is_empty() && v != "0")
            .unwrap_or(false);
        Self { enabled }
    }

    pub fn disabled() -> Self {
        Self { enabled: false }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn log(&self, component: &str, message: impl AsRef<str>) {
        if self.enabled {
            eprintln!("[{component}] {}", message.as_ref());
        }
    }
}

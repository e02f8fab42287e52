//! Input-device access.
//!
//! All jobs on this machine share one mouse, one keyboard, and one
//! clipboard. `GuiLock` is the process-wide mutex every GUI-producing
//! sequence runs under; vision calls, screenshots, and challenge waits must
//! never hold it. It is safe for one job to wait on a user code while
//! another clicks, but never for two jobs to click at once.
//!
//! Actual input synthesis (humanized mouse paths, typing rhythm) lives in
//! small helper executables outside this crate; `HelperInput` shells out to
//! them.

use std::process::Command;
use std::sync::{Mutex, MutexGuard};

/// Scroll direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scroll {
    Up,
    Down,
}

/// The process-wide input-device mutex.
pub struct GuiLock {
    inner: Mutex<()>,
}

impl GuiLock {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(()),
        }
    }

    /// Acquire the input device. Hold the guard for exactly one
    /// uninterrupted GUI sequence.
    pub fn hold(&self) -> MutexGuard<'_, ()> {
        self.inner.lock().expect("gui lock poisoned")
    }
}

impl Default for GuiLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Synthesizes input events. Callers must hold the [`GuiLock`].
pub trait InputDriver: Send + Sync {
    fn click(&self, x: i32, y: i32) -> anyhow::Result<()>;
    fn type_text(&self, text: &str) -> anyhow::Result<()>;
    fn press_key(&self, key: &str) -> anyhow::Result<()>;
    fn hotkey(&self, modifier: &str, key: &str) -> anyhow::Result<()>;
    fn scroll(&self, direction: Scroll, clicks: u32) -> anyhow::Result<()>;
    fn clipboard_copy(&self, text: &str) -> anyhow::Result<()>;
    fn focus_window(&self, title: &str) -> anyhow::Result<()>;
}

/// Drives input through the configured helper executable.
pub struct HelperInput {
    helper: String,
}

impl HelperInput {
    pub fn new(helper: impl Into<String>) -> Self {
        Self {
            helper: helper.into(),
        }
    }

    /// Helper path from `AGENT_INPUT_HELPER`, falling back to the one on
    /// `PATH`.
    pub fn from_env() -> Self {
        Self::new(
            std::env::var("AGENT_INPUT_HELPER").unwrap_or_else(|_| "subpilot-input".to_string()),
        )
    }

    fn run(&self, args: &[&str]) -> anyhow::Result<()> {
        let status = Command::new(&self.helper).args(args).status()?;
        if !status.success() {
            anyhow::bail!("input helper {:?} {:?} exited with {status}", self.helper, args);
        }
        Ok(())
    }

    fn run_with_stdin(&self, args: &[&str], stdin: &str) -> anyhow::Result<()> {
        use std::io::Write as _;
        let mut child = Command::new(&self.helper)
            .args(args)
            .stdin(std::process::Stdio::piped())
            .spawn()?;
        if let Some(pipe) = child.stdin.as_mut() {
            pipe.write_all(stdin.as_bytes())?;
        }
        let status = child.wait()?;
        if !status.success() {
            anyhow::bail!("input helper {:?} {:?} exited with {status}", self.helper, args);
        }
        Ok(())
    }
}

impl InputDriver for HelperInput {
    fn click(&self, x: i32, y: i32) -> anyhow::Result<()> {
        self.run(&["click", &x.to_string(), &y.to_string()])
    }

    fn type_text(&self, text: &str) -> anyhow::Result<()> {
        // Secrets go over stdin, never argv.
        self.run_with_stdin(&["type"], text)
    }

    fn press_key(&self, key: &str) -> anyhow::Result<()> {
        self.run(&["key", key])
    }

    fn hotkey(&self, modifier: &str, key: &str) -> anyhow::Result<()> {
        self.run(&["hotkey", modifier, key])
    }

    fn scroll(&self, direction: Scroll, clicks: u32) -> anyhow::Result<()> {
        let dir = match direction {
            Scroll::Up => "up",
            Scroll::Down => "down",
        };
        self.run(&["scroll", dir, &clicks.to_string()])
    }

    fn clipboard_copy(&self, text: &str) -> anyhow::Result<()> {
        self.run_with_stdin(&["clipboard"], text)
    }

    fn focus_window(&self, title: &str) -> anyhow::Result<()> {
        self.run(&["focus", title])
    }
}

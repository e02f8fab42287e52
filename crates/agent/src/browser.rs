//! Browser lifecycle.
//!
//! Each job gets a fresh browser with a disposable temp profile. No
//! headless mode, no webdriver, no automation flags: navigation happens
//! through the address bar like a person would. Teardown is SIGTERM-ish
//! (kill, wait) and always removes the profile directory.

use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use crate::input::InputDriver;

/// Window placement and size, in screen pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bounds {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

/// An open browser window driving one job.
pub trait BrowserWindow: Send {
    /// Capture the window as base64 PNG.
    fn capture(&mut self) -> anyhow::Result<String>;

    /// Current window bounds.
    fn bounds(&self) -> Bounds;

    /// Bring the window to the front. Callers hold the GUI lock.
    fn focus(&mut self) -> anyhow::Result<()>;

    /// Close the browser and delete the profile.
    fn close(&mut self);
}

/// Opens browser windows.
pub trait Browser: Send + Sync {
    fn open(&self, url: &str) -> anyhow::Result<Box<dyn BrowserWindow>>;
}

/// Configuration for the system browser.
#[derive(Debug, Clone)]
pub struct BrowserConfig {
    /// Browser binary.
    pub binary: String,
    /// Screen-capture helper; prints base64 PNG of the focused window.
    pub capture_helper: String,
    /// Window title substring used for focusing.
    pub window_title: String,
    pub width: i32,
    pub height: i32,
    /// Wait after launch before the window is usable.
    pub launch_wait: Duration,
}

impl BrowserConfig {
    pub fn from_env() -> Self {
        Self {
            binary: std::env::var("BROWSER_BIN").unwrap_or_else(|_| "chromium".to_string()),
            capture_helper: std::env::var("AGENT_CAPTURE_HELPER")
                .unwrap_or_else(|_| "subpilot-capture".to_string()),
            window_title: std::env::var("BROWSER_WINDOW_TITLE")
                .unwrap_or_else(|_| "Chromium".to_string()),
            width: 1280,
            height: 900,
            launch_wait: Duration::from_secs(4),
        }
    }
}

/// Launches the real system browser.
pub struct SystemBrowser {
    cfg: BrowserConfig,
    input: Arc<dyn InputDriver>,
}

impl SystemBrowser {
    pub fn new(cfg: BrowserConfig, input: Arc<dyn InputDriver>) -> Self {
        Self { cfg, input }
    }
}

impl Browser for SystemBrowser {
    fn open(&self, url: &str) -> anyhow::Result<Box<dyn BrowserWindow>> {
        let profile = TempDir::with_prefix("subpilot-browser-")?;
        let child = Command::new(&self.cfg.binary)
            .arg(format!("--user-data-dir={}", profile.path().display()))
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg(format!("--window-size={},{}", self.cfg.width, self.cfg.height))
            .arg(url)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        tracing::info!(pid = child.id(), "browser launched");

        std::thread::sleep(self.cfg.launch_wait);
        Ok(Box::new(SystemWindow {
            cfg: self.cfg.clone(),
            input: self.input.clone(),
            child,
            _profile: profile,
        }))
    }
}

struct SystemWindow {
    cfg: BrowserConfig,
    input: Arc<dyn InputDriver>,
    child: Child,
    _profile: TempDir,
}

impl BrowserWindow for SystemWindow {
    fn capture(&mut self) -> anyhow::Result<String> {
        let output = Command::new(&self.cfg.capture_helper)
            .arg(&self.cfg.window_title)
            .output()?;
        if !output.status.success() {
            anyhow::bail!(
                "capture helper {:?} exited with {}",
                self.cfg.capture_helper,
                output.status
            );
        }
        Ok(String::from_utf8(output.stdout)?.trim().to_string())
    }

    fn bounds(&self) -> Bounds {
        Bounds {
            x: 0,
            y: 0,
            width: self.cfg.width,
            height: self.cfg.height,
        }
    }

    fn focus(&mut self) -> anyhow::Result<()> {
        self.input.focus_window(&self.cfg.window_title)
    }

    fn close(&mut self) {
        if let Err(err) = self.child.kill() {
            tracing::debug!("browser already gone: {err}");
        }
        let _ = self.child.wait();
    }
}

impl Drop for SystemWindow {
    fn drop(&mut self) {
        self.close();
    }
}

//! Stuck-flow detection.
//!
//! A rolling window of the last K `(state, action)` pairs and the last K
//! screenshot hashes. K identical entries in a row in either window means
//! the flow stopped making progress and the job fails instead of burning
//! vision calls forever. The window resets on phase transition.

use sha2::{Digest, Sha256};

const DEFAULT_THRESHOLD: usize = 3;

// Only this much of the base64 payload goes into the frame hash.
const HASH_PREFIX_LEN: usize = 10_000;

pub struct StuckDetector {
    threshold: usize,
    history: Vec<(String, String)>,
    screenshot_hashes: Vec<String>,
}

impl StuckDetector {
    pub fn new() -> Self {
        Self::with_threshold(DEFAULT_THRESHOLD)
    }

    pub fn with_threshold(threshold: usize) -> Self {
        Self {
            threshold,
            history: Vec::new(),
            screenshot_hashes: Vec::new(),
        }
    }

    /// Record one iteration; returns `true` when the flow is stuck.
    /// `wait` actions are not recorded (waiting in place is progress
    /// towards a slow page, not a loop).
    pub fn check(&mut self, state: &str, action: &str, screenshot_b64: &str) -> bool {
        if action != "wait" {
            self.history.push((state.to_string(), action.to_string()));
            if self.tail_identical(&self.history) {
                return true;
            }
        }

        let prefix = &screenshot_b64[..screenshot_b64.len().min(HASH_PREFIX_LEN)];
        let hash = hex_digest(prefix);
        self.screenshot_hashes.push(hash);
        self.tail_identical(&self.screenshot_hashes)
    }

    pub fn reset(&mut self) {
        self.history.clear();
        self.screenshot_hashes.clear();
    }

    fn tail_identical<T: PartialEq>(&self, entries: &[T]) -> bool {
        if entries.len() < self.threshold {
            return false;
        }
        let tail = &entries[entries.len() - self.threshold..];
        tail.iter().all(|e| *e == tail[0])
    }
}

impl Default for StuckDetector {
    fn default() -> Self {
        Self::new()
    }
}

fn hex_digest(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    format!("{digest:x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_identical_states_trip() {
        let mut stuck = StuckDetector::new();
        assert!(!stuck.check("plan_page", "click", "shot-1"));
        assert!(!stuck.check("plan_page", "click", "shot-2"));
        assert!(stuck.check("plan_page", "click", "shot-3"));
    }

    #[test]
    fn three_identical_screenshots_trip() {
        let mut stuck = StuckDetector::new();
        assert!(!stuck.check("a", "click", "same"));
        assert!(!stuck.check("b", "scroll_down", "same"));
        assert!(stuck.check("c", "press_key", "same"));
    }

    #[test]
    fn progress_keeps_it_quiet() {
        let mut stuck = StuckDetector::new();
        for i in 0..10 {
            assert!(!stuck.check(&format!("state-{i}"), "click", &format!("shot-{i}")));
        }
    }

    #[test]
    fn wait_actions_do_not_count_as_state_repeats() {
        let mut stuck = StuckDetector::new();
        assert!(!stuck.check("loading", "wait", "shot-1"));
        assert!(!stuck.check("loading", "wait", "shot-2"));
        assert!(!stuck.check("loading", "wait", "shot-3"));
        // Identical screenshots still trip even under `wait`.
        assert!(!stuck.check("loading", "wait", "same"));
        assert!(!stuck.check("loading", "wait", "same"));
        assert!(stuck.check("loading", "wait", "same"));
    }

    #[test]
    fn reset_clears_both_windows() {
        let mut stuck = StuckDetector::new();
        stuck.check("a", "click", "same");
        stuck.check("a", "click", "same");
        stuck.reset();
        assert!(!stuck.check("a", "click", "same"));
    }
}

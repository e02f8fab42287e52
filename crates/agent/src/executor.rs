//! Vision-driven flow executor.
//!
//! Drives one cancel/resume job to completion: screenshot, classify via
//! the vision model, dispatch, act, repeat. Two prompt phases: sign-in
//! (page-type classification with element boxes, multi-step sequences
//! dispatched locally) and the cancel/resume flow (one action per
//! screenshot). Runs synchronously on a blocking thread; the only async
//! edges are the vision call and the challenge bridge, and neither holds
//! the GUI lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::Deserialize;

use crate::browser::{Browser, BrowserWindow};
use crate::input::{GuiLock, InputDriver, Scroll};
use crate::report::ChallengeSource;
use crate::stuck::StuckDetector;
use crate::vision::{cancel_prompt, resume_prompt, signin_prompt, Vision};

/// One dispatched job, as the executor sees it.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub job_id: String,
    pub service: String,
    pub action: String,
    /// Plan tier for resume flows (e.g. `premium`), derived from plan_id.
    pub plan_tier: String,
}

/// Outcome of one job.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub success: bool,
    pub billing_end_date: Option<String>,
    pub error: Option<String>,
    pub error_code: Option<String>,
    pub step_count: u32,
    pub inference_count: u32,
    pub duration: Duration,
}

/// Login entry points for the supported services.
pub fn login_url(service: &str) -> Option<&'static str> {
    match service {
        "netflix" => Some("https://www.netflix.com/login"),
        "hulu" => Some("https://secure.hulu.com/account/login"),
        "disney_plus" => Some("https://www.disneyplus.com/login"),
        "paramount" => Some("https://www.paramountplus.com/account/signin/"),
        "peacock" => Some("https://www.peacocktv.com/signin"),
        "max" => Some("https://play.max.com/login"),
        _ => None,
    }
}

// How often a value is pasted from the clipboard instead of typed.
const PASTE_PROBABILITY: f64 = 0.4;

// Semantic credential hints the vision model may emit, mapped to the keys
// of the dispatched credential map.
const CREDENTIAL_KEYWORDS: &[(&[&str], &str)] = &[
    (&["email", "e-mail", "username", "phone"], "email"),
    (&["password", "passwd"], "pass"),
    (&["cvv", "cvc", "security code", "card verification"], "cvv"),
    (&["full name", "name"], "name"),
    (&["zip", "postal"], "zip"),
    (&["birth", "dob", "date of birth"], "birth"),
    (&["gender", "sex"], "gender"),
];

/// Map a semantic hint (`"the password"`) to a credential key.
pub fn resolve_credential_key(hint: &str) -> Option<&'static str> {
    let hint = hint.to_lowercase();
    for (keywords, key) in CREDENTIAL_KEYWORDS {
        if keywords.iter().any(|kw| hint.contains(kw)) {
            return Some(key);
        }
    }
    None
}

const FIELD_INDICATORS: &[&str] = &["field", "input", "box", "textbox", "text box"];
const NON_FIELD_INDICATORS: &[&str] = &["button", "link", "menu", "tab", "icon"];

/// Whether a click target looks like a credential input field, and which
/// credential it wants.
pub fn infer_credential_from_target(target_description: &str) -> Option<&'static str> {
    let desc = target_description.to_lowercase();
    if NON_FIELD_INDICATORS.iter().any(|kw| desc.contains(kw)) {
        return None;
    }
    if !FIELD_INDICATORS.iter().any(|kw| desc.contains(kw)) {
        return None;
    }
    resolve_credential_key(&desc).filter(|key| matches!(*key, "email" | "pass" | "cvv"))
}

// --- vision payloads ---

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SigninPage {
    page_type: String,
    email_box: Option<Vec<f64>>,
    password_box: Option<Vec<f64>>,
    button_box: Option<Vec<f64>>,
    profile_box: Option<Vec<f64>>,
    code_boxes: Vec<CodeBox>,
    actions: Vec<RecoveryAction>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CodeBox {
    #[allow(dead_code)]
    label: String,
    #[serde(rename = "box")]
    bbox: Option<Vec<f64>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RecoveryAction {
    action: String,
    #[serde(rename = "box")]
    bbox: Option<Vec<f64>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FlowStep {
    state: String,
    action: String,
    target_description: String,
    bounding_box: Option<Vec<f64>>,
    text_to_type: String,
    key_to_press: String,
    #[allow(dead_code)]
    confidence: f64,
    reasoning: String,
    billing_end_date: Option<String>,
}

enum SigninOutcome {
    Continue,
    SignedIn,
    Fail { error: String, code: &'static str },
}

/// The executor. One instance serves all jobs; per-job state lives on the
/// stack of `run`.
pub struct Executor {
    vision: Arc<dyn Vision>,
    browser: Arc<dyn Browser>,
    input: Arc<dyn InputDriver>,
    gui: Arc<GuiLock>,
    settle_delay: Duration,
    max_steps: u32,
}

impl Executor {
    pub fn new(
        vision: Arc<dyn Vision>,
        browser: Arc<dyn Browser>,
        input: Arc<dyn InputDriver>,
        gui: Arc<GuiLock>,
        settle_delay: Duration,
        max_steps: u32,
    ) -> Self {
        Self {
            vision,
            browser,
            input,
            gui,
            settle_delay,
            max_steps,
        }
    }

    /// Drive one job to completion. Blocks the calling thread for the
    /// whole flow; credentials are zeroed before this returns.
    pub fn run(
        &self,
        spec: &JobSpec,
        mut credentials: HashMap<String, String>,
        challenges: &dyn ChallengeSource,
        abort: &AtomicBool,
    ) -> ExecutionResult {
        let started = Instant::now();
        let mut steps = 0u32;
        let mut inferences = 0u32;
        let result = self.drive(spec, &mut credentials, challenges, abort, &mut steps, &mut inferences);
        scrub_credentials(&mut credentials);
        match result {
            Flow::Success(billing_end_date) => ExecutionResult {
                success: true,
                billing_end_date,
                error: None,
                error_code: None,
                step_count: steps,
                inference_count: inferences,
                duration: started.elapsed(),
            },
            Flow::Failure { error, code } => {
                tracing::warn!(job = %spec.job_id, code, "job failed: {error}");
                ExecutionResult {
                    success: false,
                    billing_end_date: None,
                    error: Some(error),
                    error_code: Some(code.to_string()),
                    step_count: steps,
                    inference_count: inferences,
                    duration: started.elapsed(),
                }
            }
        }
    }

    fn drive(
        &self,
        spec: &JobSpec,
        credentials: &mut HashMap<String, String>,
        challenges: &dyn ChallengeSource,
        abort: &AtomicBool,
        steps: &mut u32,
        inferences: &mut u32,
    ) -> Flow {
        let Some(url) = login_url(&spec.service) else {
            return Flow::fail(format!("unknown service: {}", spec.service), "unknown_service");
        };

        let flow_prompt = match spec.action.as_str() {
            "cancel" => cancel_prompt(&spec.service),
            "resume" => resume_prompt(&spec.service, &spec.plan_tier),
            other => return Flow::fail(format!("unknown action: {other}"), "unknown_action"),
        };
        let signin = signin_prompt(&spec.service);

        let mut window = match self.browser.open(url) {
            Ok(window) => window,
            Err(err) => return Flow::fail(format!("browser launch failed: {err:#}"), "browser"),
        };
        tracing::info!(job = %spec.job_id, service = %spec.service, action = %spec.action, "execution started");

        let mut stuck = StuckDetector::new();
        let mut in_signin = true;

        let outcome = 'job: {
            for iteration in 0..self.max_steps {
                if abort.load(Ordering::SeqCst) {
                    break 'job Flow::fail("job aborted".to_string(), "aborted");
                }
                std::thread::sleep(self.settle_delay);

                let shot = match window.capture() {
                    Ok(shot) => shot,
                    Err(err) => {
                        tracing::warn!(job = %spec.job_id, "screenshot failed: {err:#}");
                        continue;
                    }
                };

                let prompt = if in_signin { &signin } else { &flow_prompt };
                let raw = match self.vision.analyze(&shot, prompt) {
                    Ok(raw) => raw,
                    Err(err) => {
                        tracing::warn!(job = %spec.job_id, iteration, "vision error: {err:#}");
                        continue;
                    }
                };
                *inferences += 1;

                if in_signin {
                    let page: SigninPage = match serde_json::from_value(raw) {
                        Ok(page) => page,
                        Err(err) => {
                            tracing::warn!(job = %spec.job_id, "bad sign-in payload: {err}");
                            continue;
                        }
                    };
                    if stuck.check(&page.page_type, &page.page_type, &shot) {
                        break 'job Flow::fail(
                            format!("stuck during sign-in (page_type={} repeated)", page.page_type),
                            "stuck",
                        );
                    }
                    *steps += 1;
                    match self.signin_step(spec, &page, window.as_mut(), credentials, challenges) {
                        SigninOutcome::Continue => {}
                        SigninOutcome::SignedIn => {
                            tracing::info!(job = %spec.job_id, "sign-in complete");
                            in_signin = false;
                            stuck.reset();
                        }
                        SigninOutcome::Fail { error, code } => {
                            break 'job Flow::fail(error, code);
                        }
                    }
                    continue;
                }

                let step: FlowStep = match serde_json::from_value(raw) {
                    Ok(step) => step,
                    Err(err) => {
                        tracing::warn!(job = %spec.job_id, "bad flow payload: {err}");
                        continue;
                    }
                };

                if step.action == "done" {
                    tracing::info!(
                        job = %spec.job_id,
                        billing_end_date = ?step.billing_end_date,
                        "flow complete"
                    );
                    break 'job Flow::Success(step.billing_end_date);
                }
                if step.action == "need_human" || step.state.contains("need_human") {
                    let code = if step.state.contains("credential_invalid") {
                        "credential_invalid"
                    } else {
                        "need_human"
                    };
                    break 'job Flow::fail(
                        format!("needs human intervention: {}", step.reasoning),
                        code,
                    );
                }
                if stuck.check(&step.state, &step.action, &shot) {
                    break 'job Flow::fail(
                        format!(
                            "stuck during {} (state={}, action={})",
                            spec.action, step.state, step.action
                        ),
                        "stuck",
                    );
                }

                self.flow_step(spec, &step, window.as_mut(), credentials, challenges, steps);
            }
            Flow::fail(format!("max steps ({}) reached", self.max_steps), "max_steps")
        };

        window.close();
        outcome
    }

    // One sign-in page classification, dispatched to the matching local
    // multi-step sequence.
    fn signin_step(
        &self,
        spec: &JobSpec,
        page: &SigninPage,
        window: &mut dyn BrowserWindow,
        credentials: &mut HashMap<String, String>,
        challenges: &dyn ChallengeSource,
    ) -> SigninOutcome {
        match page.page_type.as_str() {
            "signed_in" => SigninOutcome::SignedIn,
            "spinner" => SigninOutcome::Continue,
            "captcha" => SigninOutcome::Fail {
                error: "CAPTCHA detected during sign-in".to_string(),
                code: "captcha",
            },
            "email_link" => SigninOutcome::Fail {
                error: "sign-in wants an email link".to_string(),
                code: "need_human",
            },
            "email_code_single" | "email_code_multi" | "phone_code_single" | "phone_code_multi" => {
                // The wait happens outside the GUI lock; another job may
                // click while this one sits on the code.
                let Some(code) = challenges.request_otp(&spec.job_id, &spec.service) else {
                    return SigninOutcome::Fail {
                        error: "verification code never arrived".to_string(),
                        code: "need_human",
                    };
                };
                let _gui = self.gui.hold();
                let _ = window.focus();
                // Codes always go through the clipboard.
                let _ = self.input.clipboard_copy(&code);
                if let Some(bbox) = page.code_boxes.first().and_then(|cb| cb.bbox.as_deref()) {
                    self.click_bbox(bbox, window);
                    pause(500);
                }
                let _ = self.input.hotkey("ctrl", "v");
                pause(300);
                if let Some(bbox) = page.button_box.as_deref() {
                    self.click_bbox(bbox, window);
                } else {
                    let _ = self.input.press_key("enter");
                }
                SigninOutcome::Continue
            }
            "unknown" => {
                if page.actions.is_empty() {
                    return SigninOutcome::Fail {
                        error: "unrecognized sign-in page with no recovery actions".to_string(),
                        code: "need_human",
                    };
                }
                let _gui = self.gui.hold();
                for recovery in &page.actions {
                    if matches!(recovery.action.as_str(), "click" | "dismiss") {
                        if let Some(bbox) = recovery.bbox.as_deref() {
                            self.click_bbox(bbox, window);
                            pause(500);
                        }
                    }
                }
                SigninOutcome::Continue
            }
            "profile_select" => {
                if let Some(bbox) = page.profile_box.as_deref() {
                    let _gui = self.gui.hold();
                    self.click_bbox(bbox, window);
                }
                SigninOutcome::Continue
            }
            "button_only" => {
                if let Some(bbox) = page.button_box.as_deref() {
                    let _gui = self.gui.hold();
                    self.click_bbox(bbox, window);
                }
                SigninOutcome::Continue
            }
            "user_pass" => {
                let email = credentials.get("email").cloned().unwrap_or_default();
                let pass = credentials.get("pass").cloned().unwrap_or_default();
                let _gui = self.gui.hold();
                if let Some(bbox) = page.email_box.as_deref() {
                    self.click_bbox(bbox, window);
                    pause(300);
                    self.select_all_and_type(&email);
                }
                if let Some(bbox) = page.password_box.as_deref() {
                    self.click_bbox(bbox, window);
                } else {
                    let _ = self.input.press_key("tab");
                }
                pause(200);
                self.select_all_and_type(&pass);
                pause(200);
                let _ = self.input.press_key("enter");
                SigninOutcome::Continue
            }
            "user_only" => {
                if let Some(bbox) = page.email_box.as_deref() {
                    let email = credentials.get("email").cloned().unwrap_or_default();
                    let _gui = self.gui.hold();
                    self.click_bbox(bbox, window);
                    pause(300);
                    self.select_all_and_type(&email);
                    pause(200);
                    let _ = self.input.press_key("enter");
                }
                SigninOutcome::Continue
            }
            "pass_only" => {
                if let Some(bbox) = page.password_box.as_deref() {
                    let pass = credentials.get("pass").cloned().unwrap_or_default();
                    let _gui = self.gui.hold();
                    self.click_bbox(bbox, window);
                    pause(300);
                    self.select_all_and_type(&pass);
                    pause(200);
                    let _ = self.input.press_key("enter");
                }
                SigninOutcome::Continue
            }
            other => {
                tracing::warn!(job = %spec.job_id, "unhandled sign-in page type: {other}");
                SigninOutcome::Continue
            }
        }
    }

    // One flow-phase action.
    fn flow_step(
        &self,
        spec: &JobSpec,
        step: &FlowStep,
        window: &mut dyn BrowserWindow,
        credentials: &mut HashMap<String, String>,
        challenges: &dyn ChallengeSource,
        steps: &mut u32,
    ) {
        match step.action.as_str() {
            "click" => {
                let Some(bbox) = step.bounding_box.as_deref() else {
                    return;
                };
                {
                    let _gui = self.gui.hold();
                    self.click_bbox(bbox, window);
                }
                *steps += 1;

                // Clicking into a credential field implies typing into it.
                if let Some(key) = infer_credential_from_target(&step.target_description) {
                    let value =
                        self.credential_value(spec, key, credentials, challenges);
                    if let Some(value) = value {
                        let _gui = self.gui.hold();
                        pause(300);
                        self.select_all_and_type(&value);
                        *steps += 1;
                    }
                }
            }
            "type_text" => {
                let value = match resolve_credential_key(&step.text_to_type) {
                    Some(key) => self.credential_value(spec, key, credentials, challenges),
                    // Not a credential hint: type the literal text.
                    None => Some(step.text_to_type.clone()),
                };
                if let Some(value) = value {
                    if !value.is_empty() {
                        let _gui = self.gui.hold();
                        self.select_all_and_type(&value);
                        *steps += 1;
                    }
                }
            }
            "scroll_up" | "scroll_down" => {
                let direction = if step.action == "scroll_up" {
                    Scroll::Up
                } else {
                    Scroll::Down
                };
                let window_h = window.bounds().height.max(300) as f64;
                let clicks = ((window_h * 0.75 / 30.0) as u32).max(5);
                let _gui = self.gui.hold();
                let _ = self.input.scroll(direction, clicks);
                *steps += 1;
            }
            "press_key" => {
                if !step.key_to_press.is_empty() {
                    let _gui = self.gui.hold();
                    let _ = self.input.press_key(&step.key_to_press);
                    *steps += 1;
                }
            }
            "wait" => {}
            other => {
                tracing::warn!(job = %spec.job_id, "unknown flow action: {other}");
            }
        }
    }

    // Resolve a credential key to its value, asking the orchestrator when
    // the dispatched map lacks it. A supplied value is cached for the rest
    // of the job.
    fn credential_value(
        &self,
        spec: &JobSpec,
        key: &str,
        credentials: &mut HashMap<String, String>,
        challenges: &dyn ChallengeSource,
    ) -> Option<String> {
        if let Some(value) = credentials.get(key) {
            if !value.is_empty() {
                return Some(value.clone());
            }
        }
        let value = challenges.request_credential(&spec.job_id, &spec.service, key)?;
        credentials.insert(key.to_string(), value.clone());
        Some(value)
    }

    fn select_all_and_type(&self, value: &str) {
        let _ = self.input.hotkey("ctrl", "a");
        pause(100);
        self.enter_value(value);
    }

    // Enter a value by pasting roughly 40% of the time and typing
    // otherwise, the way people alternate between a password manager and
    // the keyboard.
    fn enter_value(&self, value: &str) {
        if rand::thread_rng().gen_bool(PASTE_PROBABILITY)
            && self.input.clipboard_copy(value).is_ok()
        {
            let _ = self.input.hotkey("ctrl", "v");
            pause(150);
            return;
        }
        let _ = self.input.type_text(value);
    }

    // Click inside a bbox with a 10% inset and uniform jitter.
    fn click_bbox(&self, bbox: &[f64], window: &dyn BrowserWindow) {
        let [x1, y1, x2, y2] = match bbox {
            [x1, y1, x2, y2] => [*x1, *y1, *x2, *y2],
            _ => return,
        };
        let inset_x = (x2 - x1) * 0.10;
        let inset_y = (y2 - y1) * 0.10;
        let (lo_x, hi_x) = (x1 + inset_x, (x2 - inset_x).max(x1 + inset_x + 1.0));
        let (lo_y, hi_y) = (y1 + inset_y, (y2 - inset_y).max(y1 + inset_y + 1.0));
        let mut rng = rand::thread_rng();
        let cx = rng.gen_range(lo_x..hi_x);
        let cy = rng.gen_range(lo_y..hi_y);

        let bounds = window.bounds();
        let _ = self
            .input
            .click(bounds.x + cx.round() as i32, bounds.y + cy.round() as i32);
    }
}

enum Flow {
    Success(Option<String>),
    Failure { error: String, code: &'static str },
}

impl Flow {
    fn fail(error: String, code: &'static str) -> Self {
        Flow::Failure { error, code }
    }
}

fn pause(millis: u64) {
    std::thread::sleep(Duration::from_millis(millis));
}

/// Overwrite every credential value with zero bytes, then clear the map.
fn scrub_credentials(credentials: &mut HashMap<String, String>) {
    for value in credentials.values_mut() {
        let len = value.len();
        value.clear();
        value.push_str(&"\0".repeat(len));
    }
    credentials.clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hints_resolve_to_credential_keys() {
        assert_eq!(resolve_credential_key("the email address"), Some("email"));
        assert_eq!(resolve_credential_key("The Password"), Some("pass"));
        assert_eq!(resolve_credential_key("the cvv"), Some("cvv"));
        assert_eq!(resolve_credential_key("billing zip code"), Some("zip"));
        assert_eq!(resolve_credential_key("Continue"), None);
    }

    #[test]
    fn field_targets_imply_credentials() {
        assert_eq!(
            infer_credential_from_target("the email input field"),
            Some("email")
        );
        assert_eq!(
            infer_credential_from_target("password text box"),
            Some("pass")
        );
        // Buttons and links never auto-type.
        assert_eq!(infer_credential_from_target("the email me button"), None);
        // Fields without a credential keyword do not either.
        assert_eq!(infer_credential_from_target("the search field"), None);
        // Non-sensitive fields are typed only via explicit hints.
        assert_eq!(infer_credential_from_target("the zip code field"), None);
    }

    #[test]
    fn known_services_have_login_urls() {
        for service in ["netflix", "hulu", "disney_plus", "paramount", "peacock", "max"] {
            assert!(login_url(service).is_some());
        }
        assert!(login_url("blockbuster").is_none());
    }

    #[test]
    fn scrub_clears_the_map() {
        let mut creds = HashMap::from([("pass".to_string(), "hunter2".to_string())]);
        scrub_credentials(&mut creds);
        assert!(creds.is_empty());
    }
}

//! User-facing DM copy.
//!
//! Every string a user (or the operator) receives is built here, so tone
//! and wording live in one place. Keep these short; they render in small
//! DM bubbles.

use subpilot_core::jobs::Action;

/// Human display name for a service id.
pub fn service_display(service: &str) -> String {
    match service {
        "netflix" => "Netflix".to_string(),
        "hulu" => "Hulu".to_string(),
        "disney_plus" => "Disney+".to_string(),
        "paramount" => "Paramount+".to_string(),
        "peacock" => "Peacock".to_string(),
        "max" => "Max".to_string(),
        other => {
            let mut chars = other.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => other.to_string(),
            }
        }
    }
}

/// `3000` -> `3,000`.
pub fn format_sats(amount: u64) -> String {
    let digits = amount.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

// --- outreach ---

pub fn outreach_cancel(service: &str, billing_date: &str) -> String {
    format!(
        "Your {} renews on {}. Want me to cancel before then? Reply 'yes' to cancel, \
         'skip' to keep it this cycle, or 'snooze' to ask again later. \
         Have your email handy in case {} asks for a verification code.",
        service_display(service),
        billing_date,
        service_display(service),
    )
}

pub fn outreach_cancel_no_date(service: &str) -> String {
    format!(
        "Ready to cancel {}? Reply 'yes' and I'll take care of it, \
         'skip' to keep it, or 'snooze' to ask again later. \
         Have your email handy in case a verification code is needed.",
        service_display(service),
    )
}

pub fn outreach_resume(service: &str) -> String {
    format!(
        "Want your {} back? Reply 'yes' and I'll reactivate it, \
         'skip' if not, or 'snooze' to ask again later.",
        service_display(service),
    )
}

pub fn outreach_followup(service: &str, action: Action) -> String {
    let verb = match action {
        Action::Cancel => "cancel",
        Action::Resume => "resume",
    };
    format!(
        "Still thinking it over? Reply 'yes' to {} {}, 'skip' to leave it, \
         or 'snooze' and I'll ask again later.",
        verb,
        service_display(service),
    )
}

pub fn last_chance(service: &str, days_left: i64) -> String {
    format!(
        "Last chance: {} bills in {} day{}. Reply 'yes' now if you want me to cancel first.",
        service_display(service),
        days_left,
        if days_left == 1 { "" } else { "s" },
    )
}

pub fn debt_block(debt_sats: u64) -> String {
    format!(
        "You have an outstanding balance of {} sats from a previous action. \
         Settle it from your account page and I'll get back to work.",
        format_sats(debt_sats),
    )
}

pub fn skip_ack(service: &str) -> String {
    format!(
        "Skipping {} this cycle. I'll check in again before the next one.",
        service_display(service),
    )
}

pub fn snooze_ack(hours: u64) -> String {
    format!("Snoozed. I'll ask again in {hours} hours.")
}

pub fn queued_eta(position: usize) -> String {
    let minutes = (position.max(1) as u64) * 8;
    format!(
        "I'm mid-job for someone else right now. You're #{position} in line; \
         I'll start automatically in roughly {minutes} minutes."
    )
}

// --- execution ---

pub fn executing(service: &str, action: Action) -> String {
    match action {
        Action::Cancel => format!("Cancelling {} now. Give me a few minutes.", service_display(service)),
        Action::Resume => format!("Resuming {} now. Give me a few minutes.", service_display(service)),
    }
}

pub fn no_credentials(service: &str, base_url: &str) -> String {
    format!(
        "I don't have login credentials saved for {}. Add them at {}/account and reply 'yes' again.",
        service_display(service),
        base_url,
    )
}

pub fn otp_needed(service: &str, prompt: Option<&str>) -> String {
    match prompt {
        Some(prompt) if !prompt.is_empty() => format!(
            "{} is asking for a verification code ({prompt}). Forward me the code when it arrives.",
            service_display(service),
        ),
        _ => format!(
            "{} sent you a verification code. Forward me the code when it arrives.",
            service_display(service),
        ),
    }
}

pub fn otp_received() -> String {
    "Got it, entering the code now.".to_string()
}

pub fn credential_needed(service: &str, credential_name: &str) -> String {
    let what = match credential_name {
        "cvv" => "the CVV (security code) of your card on file".to_string(),
        "zip" => "your billing ZIP code".to_string(),
        "birth" => "your date of birth".to_string(),
        other => format!("your {other}"),
    };
    format!(
        "{} is asking for {}. Send it over and I'll continue.",
        service_display(service),
        what,
    )
}

pub fn credential_received() -> String {
    "Got it, continuing.".to_string()
}

// --- results ---

pub fn action_success_cancel(service: &str, access_end_date: Option<&str>) -> String {
    match access_end_date {
        Some(date) => format!(
            "Done: {} is cancelled. You keep access until {}.",
            service_display(service),
            date,
        ),
        None => format!("Done: {} is cancelled.", service_display(service)),
    }
}

pub fn action_success_resume(service: &str) -> String {
    format!(
        "Done: {} is reactivated and you're live again.",
        service_display(service),
    )
}

pub fn action_failed(service: &str, action: Action) -> String {
    format!(
        "The {} {} didn't go through. We were notified and will take a look; \
         you won't be charged for this attempt.",
        service_display(service),
        action,
    )
}

pub fn action_failed_credentials(service: &str, action: Action) -> String {
    format!(
        "The {} {} failed because your saved credentials were rejected. \
         Update them from your account page and reply 'yes' to retry.",
        service_display(service),
        action,
    )
}

pub fn operator_job_failed(job_id: &str, service: &str, error: Option<&str>) -> String {
    format!(
        "Job {} ({}) failed: {}",
        job_id,
        service,
        error.unwrap_or("no error message"),
    )
}

// --- billing ---

/// Two bubbles: the amount line, then the bare invoice for easy copy.
pub fn invoice(amount_sats: u64, bolt11: &str) -> [String; 2] {
    [
        format!("That's {} sats. Pay within 24 hours:", format_sats(amount_sats)),
        bolt11.to_string(),
    ]
}

pub fn payment_received(amount_sats: u64) -> String {
    format!("Received {} sats, thank you!", format_sats(amount_sats))
}

pub fn payment_expired(service: &str, debt_sats: u64) -> String {
    format!(
        "The invoice for the {} action expired unpaid. Your outstanding balance is now {} sats; \
         I can't take new work for you until it's settled.",
        service_display(service),
        format_sats(debt_sats),
    )
}

pub fn otp_timeout(minutes: u64) -> String {
    format!(
        "I didn't get the code within {minutes} minutes, so I stopped the job. \
         Reply 'yes' whenever you want me to try again."
    )
}

// --- session ---

pub fn session_cancelled() -> String {
    "Cancelled. Nothing was changed.".to_string()
}

pub fn error_generic() -> String {
    "Something went wrong on our side. Please try again in a bit.".to_string()
}

pub fn nothing_active() -> String {
    "There's nothing waiting on you right now.".to_string()
}

pub fn help() -> String {
    "I manage your streaming subscriptions. When I ask about an upcoming renewal, \
     reply 'yes', 'skip', or 'snooze'. Reply 'cancel' any time to stop a running job."
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sats_formatting() {
        assert_eq!(format_sats(0), "0");
        assert_eq!(format_sats(999), "999");
        assert_eq!(format_sats(3000), "3,000");
        assert_eq!(format_sats(1_234_567), "1,234,567");
    }

    #[test]
    fn display_names() {
        assert_eq!(service_display("netflix"), "Netflix");
        assert_eq!(service_display("disney_plus"), "Disney+");
        assert_eq!(service_display("somethingelse"), "Somethingelse");
    }

    #[test]
    fn invoice_is_two_bubbles_with_bare_bolt11() {
        let [amount, bolt11] = invoice(3000, "lnbc30u1...");
        assert!(amount.contains("3,000"));
        assert_eq!(bolt11, "lnbc30u1...");
    }

    #[test]
    fn failure_copy_differentiates_bad_credentials() {
        let generic = action_failed("netflix", Action::Cancel);
        let creds = action_failed_credentials("netflix", Action::Cancel);
        assert!(generic.contains("notified"));
        assert!(creds.contains("credentials were rejected"));
    }
}

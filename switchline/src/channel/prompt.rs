//! Prompt learning for devices whose prompt is not known in advance.
//!
//! The prompt is learned from the device itself: the last non-empty line
//! of output that looks like `hostname>` or `hostname(config-if)#` gives
//! the hostname token, and every later command completes when a line
//! made of that token, an optional mode suffix and `>`/`#` reappears.

use std::sync::LazyLock;

use log::debug;
use regex::Regex;

/// A CLI prompt line: token, optional `(mode)`, then `>` or `#`.
static PROMPT_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\S+(?:\([^)]+\))?)\s*([>#])\s*$").expect("prompt line pattern is valid")
});

/// Trailing `(mode)` suffix of a prompt token.
static MODE_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\([^)]*\)$").expect("mode suffix pattern is valid"));

static LOGIN_PROMPT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)login[:\s]*$").expect("login pattern is valid"));

static PASSWORD_PROMPT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)password[:\s]*$").expect("password pattern is valid"));

/// Whether `line` asks for a username.
pub fn is_login_prompt(line: &str) -> bool {
    LOGIN_PROMPT.is_match(line)
}

/// Whether `line` asks for a password.
pub fn is_password_prompt(line: &str) -> bool {
    PASSWORD_PROMPT.is_match(line)
}

/// A prompt learned from device output.
#[derive(Debug, Clone)]
pub struct LearnedPrompt {
    /// Hostname token with any mode suffix removed.
    base: String,

    /// The full token as matched, e.g. `SSH@ICX6450(config)`.
    token: String,

    /// Whether the prompt ended in `#`.
    elevated: bool,

    /// Completion matcher derived from `base`.
    pattern: Regex,
}

impl LearnedPrompt {
    /// Hostname token the pattern is anchored on.
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Full prompt token as last seen.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Whether the device is in elevated (`#`) mode.
    pub fn elevated(&self) -> bool {
        self.elevated
    }

    /// The compiled completion pattern.
    pub fn pattern(&self) -> &Regex {
        &self.pattern
    }

    /// Check whether `line` is this device's prompt in any mode.
    pub fn is_match(&self, line: &str) -> bool {
        self.pattern.is_match(line)
    }
}

/// Try to learn a prompt from the last non-empty line of `text`.
///
/// Returns `None` when that line is not prompt-shaped, or when the
/// hostname token has no alphanumeric character (banners made of
/// `###` or `>>>` are not prompts).
pub fn detect(text: &str) -> Option<LearnedPrompt> {
    let line = text
        .lines()
        .map(str::trim_end)
        .rev()
        .find(|l| !l.is_empty())?;

    let caps = PROMPT_LINE.captures(line.trim_start())?;
    let token = caps.get(1)?.as_str();
    let base = MODE_SUFFIX.replace(token, "");
    if !base.chars().any(char::is_alphanumeric) {
        return None;
    }

    let pattern = Regex::new(&format!(
        r"^{}(?:\([^)]*\))?\s*[>#]\s*$",
        regex::escape(&base)
    ))
    .ok()?;

    Some(LearnedPrompt {
        base: base.into_owned(),
        token: token.to_string(),
        elevated: caps.get(2).is_some_and(|m| m.as_str() == "#"),
        pattern,
    })
}

/// Tracks the device prompt across privilege transitions.
#[derive(Debug, Default)]
pub struct PromptLearner {
    current: Option<LearnedPrompt>,
}

impl PromptLearner {
    /// Create a learner with no prompt yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-learn from `text`. Returns true when the prompt changed.
    pub fn observe(&mut self, text: &str) -> bool {
        let Some(found) = detect(text) else {
            return false;
        };
        let unchanged = self
            .current
            .as_ref()
            .is_some_and(|p| p.token == found.token && p.elevated == found.elevated);
        if unchanged {
            return false;
        }

        debug!(
            "learned prompt '{}' (elevated: {})",
            found.token, found.elevated
        );
        self.current = Some(found);
        true
    }

    /// The prompt currently in force.
    pub fn current(&self) -> Option<&LearnedPrompt> {
        self.current.as_ref()
    }

    /// Whether `line` completes a command.
    ///
    /// Before any prompt is learned, any prompt-shaped line does.
    pub fn is_prompt(&self, line: &str) -> bool {
        match &self.current {
            Some(prompt) => prompt.is_match(line),
            None => detect(line).is_some(),
        }
    }

    /// Whether the last learned prompt was elevated.
    pub fn elevated(&self) -> bool {
        self.current.as_ref().is_some_and(|p| p.elevated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_user_mode() {
        let prompt = detect("Welcome\r\nSSH@ICX6450-24>").unwrap();
        assert_eq!(prompt.base(), "SSH@ICX6450-24");
        assert!(!prompt.elevated());
        assert!(prompt.is_match("SSH@ICX6450-24#"));
        assert!(prompt.is_match("SSH@ICX6450-24(config-vlan-10)#"));
        assert!(!prompt.is_match("OTHER#"));
    }

    #[test]
    fn test_detect_strips_mode_suffix() {
        let prompt = detect("switch(config)# ").unwrap();
        assert_eq!(prompt.base(), "switch");
        assert_eq!(prompt.token(), "switch(config)");
        assert!(prompt.elevated());
        assert!(prompt.is_match("switch>"));
    }

    #[test]
    fn test_detect_uses_last_non_empty_line() {
        assert!(detect("router#\r\n\r\n   \r\n").is_some());
        assert!(detect("router#\r\nsome output").is_none());
    }

    #[test]
    fn test_banner_without_alphanumerics_rejected() {
        assert!(detect("#####").is_none());
        assert!(detect(">>>").is_none());
    }

    #[test]
    fn test_hostname_metacharacters_escaped() {
        let prompt = detect("core.sw+1#").unwrap();
        assert!(prompt.is_match("core.sw+1>"));
        assert!(!prompt.is_match("coreXsw+1>"));
    }

    #[test]
    fn test_learning_is_idempotent() {
        let mut once = PromptLearner::new();
        assert!(once.observe("sw1#"));

        let mut many = PromptLearner::new();
        for _ in 0..5 {
            many.observe("sw1#");
        }
        assert_eq!(
            once.current().unwrap().pattern().as_str(),
            many.current().unwrap().pattern().as_str()
        );
        assert!(!many.observe("sw1#"));
    }

    #[test]
    fn test_privilege_change_relearns() {
        let mut learner = PromptLearner::new();
        learner.observe("sw1>");
        assert!(!learner.elevated());
        assert!(learner.observe("sw1#"));
        assert!(learner.elevated());
        assert_eq!(learner.current().map(|p| p.token()), Some("sw1"));
    }

    #[test]
    fn test_login_and_password_prompts() {
        assert!(is_login_prompt("User Login: "));
        assert!(is_login_prompt("login"));
        assert!(is_password_prompt("Password:"));
        assert!(is_password_prompt("Enable PASSWORD: "));
        assert!(!is_password_prompt("password changed for admin"));
    }
}

//! User-facing error classification for the pixelmuse CLI.
//!
//! Startup and wiring failures are turned into titled errors with recovery
//! suggestions before they reach the terminal. Backend and dictation errors
//! that occur mid-session are rendered as chat bubbles instead and never pass
//! through here.

use anyhow::Error;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Error with a user-friendly title and recovery suggestions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserError {
    pub title: String,
    pub message: String,
    pub suggestions: Vec<String>,
    pub error_type: ErrorType,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorType {
    /// Settings problems (bad base URL, malformed settings.json).
    Configuration,
    /// The backend is unreachable.
    Network,
    /// Voice capability problems (missing transcriber command).
    Voice,
    /// Bad user input (nonexistent attach path, invalid gallery index).
    Validation,
    Unknown,
}

impl UserError {
    pub fn new(title: impl Into<String>, message: impl Into<String>, error_type: ErrorType) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            suggestions: Vec::new(),
            error_type,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn into_error(self) -> Error {
        Error::new(self)
    }

    pub fn format(&self) -> String {
        let mut output = String::new();
        output.push_str(&format!("{}: {}\n", self.title, self.message));
        if !self.suggestions.is_empty() {
            output.push_str("  Suggestions:\n");
            for (i, suggestion) in self.suggestions.iter().enumerate() {
                output.push_str(&format!("    {}. {}\n", i + 1, suggestion));
            }
        }
        output
    }
}

impl fmt::Display for UserError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format())
    }
}

impl std::error::Error for UserError {}

/// Classify an error for terminal display. Preserves a [`UserError`] if one
/// is already inside, otherwise buckets by message pattern.
pub fn handle(error: &Error) -> String {
    if let Some(user) = error.downcast_ref::<UserError>() {
        return user.format();
    }
    classify(&error.to_string()).format()
}

fn classify(error_message: &str) -> UserError {
    let lower = error_message.to_lowercase();

    if lower.contains("settings") || lower.contains("config") || lower.contains("invalid url") {
        return UserError::new("Configuration Error", error_message, ErrorType::Configuration)
            .with_suggestion("Check .pixelmuse/settings.json")
            .with_suggestion("Verify backend.base_url points at the image service")
            .with_suggestion("Run `pixelmuse --init` to write default settings");
    }

    if lower.contains("connection")
        || lower.contains("timeout")
        || lower.contains("timed out")
        || lower.contains("dns")
    {
        return UserError::new("Network Error", error_message, ErrorType::Network)
            .with_suggestion("Check that the image backend is running")
            .with_suggestion("Verify backend.base_url and your connection");
    }

    if lower.contains("transcriber") || lower.contains("dictation") || lower.contains("voice") {
        return UserError::new("Voice Error", error_message, ErrorType::Voice)
            .with_suggestion("Install the transcriber named in voice.command")
            .with_suggestion("Set voice.enabled to false to hide the mic control");
    }

    UserError::new("Error", error_message, ErrorType::Unknown)
        .with_suggestion("Re-run with --verbose for details")
}

/// Common constructors for the failures the CLI startup can hit.
pub mod errors {
    use super::*;

    pub fn backend_unreachable(base_url: &str) -> UserError {
        UserError::new(
            "Backend Unreachable",
            format!("Could not reach the image service at '{base_url}'."),
            ErrorType::Network,
        )
        .with_suggestion("Start the backend, or pass --base-url")
        .with_suggestion("Check backend.base_url in .pixelmuse/settings.json")
    }

    pub fn attach_path_missing(path: &str) -> UserError {
        UserError::new(
            "File Not Found",
            format!("The image '{path}' does not exist."),
            ErrorType::Validation,
        )
        .with_suggestion("Check the path passed to /attach")
    }

    pub fn transcriber_missing(command: &str) -> UserError {
        UserError::new(
            "Transcriber Missing",
            format!("The transcriber command '{command}' is not on PATH."),
            ErrorType::Voice,
        )
        .with_suggestion("Install it, or point voice.command at another recognizer")
        .with_suggestion("Dictation stays disabled; everything else works")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn formats_title_and_suggestions() {
        let err = UserError::new("Test Error", "something broke", ErrorType::Unknown)
            .with_suggestion("try again");
        let out = err.format();
        assert!(out.contains("Test Error"));
        assert!(out.contains("something broke"));
        assert!(out.contains("Suggestions:"));
    }

    #[test]
    fn classifies_network_errors() {
        let out = handle(&anyhow!("connection refused (os error 111)"));
        assert!(out.contains("Network Error"));
    }

    #[test]
    fn classifies_configuration_errors() {
        let out = handle(&anyhow!("invalid url in settings"));
        assert!(out.contains("Configuration Error"));
        assert!(out.contains("settings.json"));
    }

    #[test]
    fn preserves_wrapped_user_errors() {
        let err = errors::transcriber_missing("hear").into_error();
        let out = handle(&err);
        assert!(out.contains("Transcriber Missing"));
        assert!(out.contains("hear"));
    }
}

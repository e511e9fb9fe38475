use base64::Engine;
use fleet_common::Error;
use std::fmt;

/// A value vetted for direct interpolation into a remote command.
///
/// Every token, key, hostname, and model identifier that ends up inside a
/// script must pass through here; anything outside the allow-list is
/// rejected before a shell session is even opened. Free-form text never
/// qualifies — that travels as an [`OpaquePayload`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellArg(String);

const MAX_LEN: usize = 512;

impl ShellArg {
    pub fn new(value: impl Into<String>) -> Result<Self, Error> {
        let value = value.into();
        if value.is_empty() {
            return Err(Error::Validation("empty shell argument".to_string()));
        }
        if value.len() > MAX_LEN {
            return Err(Error::Validation(format!(
                "shell argument exceeds {MAX_LEN} bytes"
            )));
        }
        if let Some(bad) = value
            .chars()
            .find(|c| !matches!(c, 'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '_' | '-' | ':' | '/' | '@' | '+' | '='))
        {
            return Err(Error::Validation(format!(
                "shell argument contains disallowed character {bad:?}"
            )));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShellArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Free-form content (prompts, memory seeds) bound for a file on the VM.
///
/// The text itself never appears in a command line; it crosses the wire
/// base64-encoded and is decoded on the far side, so its length and content
/// are unconstrained and shell metacharacters are inert.
#[derive(Debug, Clone)]
pub struct OpaquePayload {
    encoded: String,
}

impl OpaquePayload {
    pub fn new(content: &str) -> Self {
        Self {
            encoded: base64::engine::general_purpose::STANDARD.encode(content.as_bytes()),
        }
    }

    pub fn encoded(&self) -> &str {
        &self.encoded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_typical_identifiers() {
        for ok in [
            "sonnet-4",
            "agentvm-12.fleet.example.com",
            "fgw_0b1c2d3e4f",
            "123456:AAHk-telegram_token",
            "https://proxy.internal:8443/v1",
            "user@host",
        ] {
            assert!(ShellArg::new(ok).is_ok(), "expected {ok:?} to validate");
        }
    }

    #[test]
    fn rejects_shell_metacharacters() {
        for bad in [
            "a b",
            "a;rm -rf /",
            "$(reboot)",
            "`id`",
            "a\nb",
            "a'b",
            "a\"b",
            "a|b",
            "a&b",
            "a>b",
            "a\\b",
            "",
        ] {
            assert!(
                ShellArg::new(bad).is_err(),
                "expected {bad:?} to be rejected"
            );
        }
    }

    #[test]
    fn rejects_oversized_values() {
        let long = "a".repeat(MAX_LEN + 1);
        assert!(ShellArg::new(long).is_err());
    }

    #[test]
    fn opaque_payload_hides_raw_content() {
        let hostile = "you're great; $(rm -rf /) `reboot` \"quotes\"";
        let payload = OpaquePayload::new(hostile);
        assert!(!payload.encoded().contains("rm -rf"));
        // base64 alphabet stays inert inside single quotes
        assert!(payload
            .encoded()
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '=')));
    }
}

//! Pattern-based secret redaction for log output and stored error strings.
//!
//! Every message that may echo upstream responses or configuration passes
//! through [`redact`] before reaching a tracing call or a database row.

use regex::Regex;
use std::sync::OnceLock;

const PLACEHOLDER: &str = "[REDACTED]";

struct Patterns {
    api_key: Regex,
    bearer: Regex,
    goog_key: Regex,
    email: Regex,
    credential_path: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        // sk-ant-..., sk-proj-..., generic sk- keys
        api_key: Regex::new(r"sk-[A-Za-z0-9_-]{8,}").expect("api key pattern"),
        bearer: Regex::new(r"(?i)bearer\s+[A-Za-z0-9._~+/=-]{8,}").expect("bearer pattern"),
        goog_key: Regex::new(r"AIza[0-9A-Za-z_-]{30,}").expect("google key pattern"),
        email: Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("email pattern"),
        // typical credential file paths (service-account JSON, pem keys)
        credential_path: Regex::new(r"(?i)[\w./~-]*(credential|service[_-]?account|private[_-]?key)[\w./~-]*\.(json|pem|key)")
            .expect("credential path pattern"),
    })
}

/// Replace key material, tokens, emails, and credential paths with a
/// placeholder. Order matters: bearer first so the token part of
/// `Bearer sk-...` is consumed whole.
pub fn redact(input: &str) -> String {
    let p = patterns();
    let out = p.bearer.replace_all(input, PLACEHOLDER);
    let out = p.api_key.replace_all(&out, PLACEHOLDER);
    let out = p.goog_key.replace_all(&out, PLACEHOLDER);
    let out = p.credential_path.replace_all(&out, PLACEHOLDER);
    let out = p.email.replace_all(&out, PLACEHOLDER);
    out.into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_sk_keys() {
        let msg = "auth failed for key sk-ant-REDACTED";
        let out = redact(msg);
        assert!(!out.contains("sk-ant"));
        assert!(out.contains(PLACEHOLDER));
    }

    #[test]
    fn redacts_bearer_tokens() {
        let out = redact("header was Authorization: Bearer abc.def.ghi-jkl_mno");
        assert!(!out.contains("abc.def.ghi"));
    }

    #[test]
    fn redacts_emails() {
        let out = redact("user ops@example.com exceeded quota");
        assert!(!out.contains("ops@example.com"));
    }

    #[test]
    fn redacts_credential_paths() {
        let out = redact("read /etc/secrets/service-account.json failed");
        assert!(!out.contains("service-account.json"));
    }

    #[test]
    fn leaves_plain_text_alone() {
        let msg = "upstream returned 502 after 1.2s";
        assert_eq!(redact(msg), msg);
    }
}

//! Sender verification from authenticity headers.
//!
//! A sender is verified only when all of these hold: not flagged as spam,
//! DKIM signed, DKIM valid, DKIM aligned with the author domain, SPF pass.
//! Missing or unparseable headers count as failures.

use serde::{Deserialize, Serialize};

use crate::pipeline::types::EmailHeader;

/// Header-derived authenticity facts for one email.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticitySignals {
    pub spam: bool,
    pub dkim_signed: bool,
    pub dkim_valid: bool,
    pub dkim_aligned: bool,
    pub spf_pass: bool,
}

impl AuthenticitySignals {
    pub fn is_verified(&self) -> bool {
        !self.spam && self.dkim_signed && self.dkim_valid && self.dkim_aligned && self.spf_pass
    }

    /// Names of the checks that did not pass.
    pub fn failures(&self) -> Vec<&'static str> {
        let mut failed = Vec::new();
        if self.spam {
            failed.push("spam");
        }
        if !self.dkim_signed {
            failed.push("dkim_unsigned");
        }
        if !self.dkim_valid {
            failed.push("dkim_invalid");
        }
        if !self.dkim_aligned {
            failed.push("dkim_unaligned");
        }
        if !self.spf_pass {
            failed.push("spf_fail");
        }
        failed
    }
}

/// One `dkim=` result from an Authentication-Results header.
#[derive(Debug, PartialEq)]
struct DkimResult {
    result: String,
    domain: Option<String>,
}

/// Derive authenticity signals from headers and the sender address.
pub fn assess(headers: &[EmailHeader], sender: &str) -> AuthenticitySignals {
    let named = |name: &'static str| {
        headers
            .iter()
            .filter(move |h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.trim())
    };

    let spam = named("X-Spam-Flag")
        .chain(named("X-Spam-Status"))
        .any(|v| v.to_ascii_lowercase().starts_with("yes"));

    let auth_results: Vec<&str> = named("Authentication-Results")
        .chain(named("ARC-Authentication-Results"))
        .collect();

    let dkim: Vec<DkimResult> = auth_results
        .iter()
        .flat_map(|value| parse_dkim_results(value))
        .collect();

    let dkim_signed = named("DKIM-Signature").next().is_some()
        || dkim.iter().any(|r| r.result != "none");

    let passing: Vec<&DkimResult> = dkim.iter().filter(|r| r.result == "pass").collect();
    let dkim_valid = !passing.is_empty();

    let sender_domain = domain_of(sender);
    let dkim_aligned = match sender_domain.as_deref() {
        Some(author) => passing
            .iter()
            .filter_map(|r| r.domain.as_deref())
            .any(|signer| domains_aligned(author, signer)),
        None => false,
    };

    let spf_pass = named("Received-SPF").any(|v| v.to_ascii_lowercase().starts_with("pass"))
        || auth_results
            .iter()
            .flat_map(|v| v.split(';'))
            .any(|clause| clause.trim().to_ascii_lowercase().starts_with("spf=pass"));

    AuthenticitySignals {
        spam,
        dkim_signed,
        dkim_valid,
        dkim_aligned,
        spf_pass,
    }
}


fn parse_dkim_results(value: &str) -> Vec<DkimResult> {
    value
        .split(';')
        .map(str::trim)
        .filter_map(|clause| {
            let lower = clause.to_ascii_lowercase();
            let rest = lower.strip_prefix("dkim=")?;
            let result = rest.split_whitespace().next().unwrap_or_default().to_string();
            let domain = lower
                .split_whitespace()
                .find_map(|token| {
                    token
                        .strip_prefix("header.d=")
                        .or_else(|| token.strip_prefix("header.i=@"))
                })
                .map(|d| d.trim_matches(|c: char| c == '"' || c == ';').to_string());
            Some(DkimResult { result, domain })
        })
        .collect()
}

fn domain_of(address: &str) -> Option<String> {
    let address = crate::pipeline::types::normalize_address(address)?;
    address
        .rsplit_once('@')
        .map(|(_, domain)| domain.to_string())
        .filter(|d| !d.is_empty())
}

/// Equal, or the signer is a subdomain of the author domain.
///
/// A signer that is a parent of the author is not accepted: without a
/// public-suffix list, `co.uk` cannot be told apart from `example.com`.
fn domains_aligned(author: &str, signer: &str) -> bool {
    author == signer || signer.ends_with(&format!(".{author}"))
}

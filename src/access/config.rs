//! JSON access-control document.
//!
//! ```json
//! {
//!   "default_policy": "deny",
//!   "rules": [
//!     { "domain": ["public.example.com"], "policy": "bypass" },
//!     { "domain": ["*.example.com"], "subject": ["group:admins"],
//!       "policy": "two_factor", "required_methods": ["webauthn"] }
//!   ]
//! }
//! ```

use super::{AccessControl, DomainMatcher, Policy, Rule, SubjectMatcher};
use crate::session::SecondFactorMethod;
use anyhow::{anyhow, Context, Result};
use axum::http::Method;
use ipnetwork::IpNetwork;
use regex::Regex;
use serde::Deserialize;
use std::{collections::BTreeSet, path::Path, str::FromStr};
use tracing::info;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AccessControlDocument {
    #[serde(default = "default_policy")]
    pub default_policy: Policy,
    #[serde(default)]
    pub rules: Vec<RuleDocument>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleDocument {
    #[serde(default)]
    pub domain: Vec<String>,
    #[serde(default)]
    pub domain_regex: Vec<String>,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub subject: Vec<String>,
    #[serde(default)]
    pub networks: Vec<IpNetwork>,
    #[serde(default)]
    pub methods: Vec<String>,
    pub policy: Policy,
    #[serde(default)]
    pub required_methods: BTreeSet<SecondFactorMethod>,
}

const fn default_policy() -> Policy {
    Policy::Deny
}

impl RuleDocument {
    fn compile(self, index: usize) -> Result<Rule> {
        let mut rule = Rule::new(self.policy);

        rule.domains = self
            .domain
            .iter()
            .map(|domain| DomainMatcher::parse(domain))
            .collect();
        for pattern in &self.domain_regex {
            let regex = Regex::new(pattern)
                .with_context(|| format!("rule #{index}: invalid domain_regex '{pattern}'"))?;
            rule.domains.push(DomainMatcher::Pattern(regex));
        }

        rule.resources = self
            .resources
            .iter()
            .map(|pattern| {
                Regex::new(pattern)
                    .with_context(|| format!("rule #{index}: invalid resource '{pattern}'"))
            })
            .collect::<Result<_>>()?;

        rule.subjects = self
            .subject
            .iter()
            .map(|subject| {
                SubjectMatcher::from_str(subject).map_err(|err| anyhow!("rule #{index}: {err}"))
            })
            .collect::<Result<_>>()?;

        rule.networks = self.networks;

        rule.methods = self
            .methods
            .iter()
            .map(|method| {
                Method::from_bytes(method.to_uppercase().as_bytes())
                    .with_context(|| format!("rule #{index}: invalid method '{method}'"))
            })
            .collect::<Result<_>>()?;

        if !self.required_methods.is_empty() && self.policy != Policy::TwoFactor {
            return Err(anyhow!(
                "rule #{index}: required_methods is only valid with the two_factor policy"
            ));
        }
        rule.required_methods = self.required_methods;

        Ok(rule)
    }
}

impl AccessControlDocument {
    /// Compile the document into an immutable rule set.
    ///
    /// # Errors
    /// Returns an error naming the first invalid rule.
    pub fn compile(self) -> Result<AccessControl> {
        let rules = self
            .rules
            .into_iter()
            .enumerate()
            .map(|(index, rule)| rule.compile(index))
            .collect::<Result<Vec<_>>>()?;
        Ok(AccessControl::new(self.default_policy, rules))
    }
}

/// Parse and compile a JSON access-control document.
///
/// # Errors
/// Returns an error if the JSON is malformed or a rule is invalid.
pub fn parse(json: &str) -> Result<AccessControl> {
    let document: AccessControlDocument =
        serde_json::from_str(json).context("Invalid access control JSON")?;
    document.compile()
}

/// Load the access-control document from disk.
///
/// # Errors
/// Returns an error if the file cannot be read or compiled.
pub fn load_file(path: &Path) -> Result<AccessControl> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read access control file: {}", path.display()))?;
    let access_control = parse(&json)?;
    info!(
        rules = access_control.rules().len(),
        default_policy = access_control.default_policy().as_str(),
        "access control loaded"
    );
    Ok(access_control)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_document() {
        let access_control = parse(
            r#"{
                "default_policy": "one_factor",
                "rules": [
                    { "domain": ["public.example.com"], "policy": "bypass" },
                    {
                        "domain": ["*.example.com"],
                        "domain_regex": ["^app-[0-9]+\\.example\\.org$"],
                        "resources": ["^/admin"],
                        "subject": ["group:admins", "user:root"],
                        "networks": ["10.0.0.0/8"],
                        "methods": ["get", "POST"],
                        "policy": "two_factor",
                        "required_methods": ["webauthn", "totp"]
                    }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(access_control.default_policy(), Policy::OneFactor);
        assert_eq!(access_control.rules().len(), 2);
        let rule = &access_control.rules()[1];
        assert_eq!(rule.domains.len(), 2);
        assert_eq!(rule.subjects.len(), 2);
        assert_eq!(rule.methods, vec![Method::GET, Method::POST]);
        assert_eq!(rule.required_methods.len(), 2);
    }

    #[test]
    fn default_policy_is_deny() {
        let access_control = parse("{}").unwrap();
        assert_eq!(access_control.default_policy(), Policy::Deny);
        assert!(access_control.rules().is_empty());
    }

    #[test]
    fn rejects_bad_regex_with_rule_index() {
        let document = r#"{"rules": [
            {"policy": "bypass"},
            {"resources": ["("], "policy": "deny"}
        ]}"#;
        let err = parse(document).unwrap_err();
        assert!(format!("{err:#}").contains("rule #1"));
    }

    #[test]
    fn rejects_required_methods_outside_two_factor() {
        let document = r#"{"rules": [{"policy": "one_factor", "required_methods": ["totp"]}]}"#;
        assert!(parse(document).is_err());
    }

    #[test]
    fn rejects_unknown_fields() {
        assert!(parse(r#"{"rules": [{"policy": "bypass", "domains": ["x"]}]}"#).is_err());
    }
}

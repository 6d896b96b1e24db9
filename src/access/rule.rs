//! Rule matchers: domain, resource, subject, network, and method.

use crate::session::{IdentitySession, SecondFactorMethod};
use axum::http::Method;
use ipnetwork::IpNetwork;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, net::IpAddr, str::FromStr};
use url::Url;
use utoipa::ToSchema;

/// Level a matching rule demands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Policy {
    Bypass,
    OneFactor,
    TwoFactor,
    Deny,
}

impl Policy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bypass => "bypass",
            Self::OneFactor => "one_factor",
            Self::TwoFactor => "two_factor",
            Self::Deny => "deny",
        }
    }
}

/// The request being authorized.
#[derive(Clone, Debug)]
pub struct Target {
    pub url: Url,
    pub method: Method,
    pub client_ip: IpAddr,
}

impl Target {
    #[must_use]
    pub fn new(url: Url, method: Method, client_ip: IpAddr) -> Self {
        Self {
            url,
            method,
            client_ip,
        }
    }

    fn host(&self) -> String {
        self.url.host_str().unwrap_or_default().to_lowercase()
    }

    fn resource(&self) -> String {
        match self.url.query() {
            Some(query) => format!("{}?{query}", self.url.path()),
            None => self.url.path().to_string(),
        }
    }
}

#[derive(Clone, Debug)]
pub enum DomainMatcher {
    Exact(String),
    /// `*.example.com`: any subdomain, not the apex.
    Suffix(String),
    Pattern(Regex),
}

impl DomainMatcher {
    #[must_use]
    pub fn parse(value: &str) -> Self {
        let value = value.trim().to_lowercase();
        match value.strip_prefix("*.") {
            Some(suffix) => Self::Suffix(format!(".{suffix}")),
            None => Self::Exact(value),
        }
    }

    fn is_match(&self, host: &str) -> bool {
        match self {
            Self::Exact(domain) => host == domain,
            Self::Suffix(suffix) => host.len() > suffix.len() && host.ends_with(suffix.as_str()),
            Self::Pattern(regex) => regex.is_match(host),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubjectMatcher {
    User(String),
    Group(String),
    Any,
}

impl FromStr for SubjectMatcher {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        if value == "any" || value == "*" {
            return Ok(Self::Any);
        }
        if let Some(user) = value.strip_prefix("user:") {
            return Ok(Self::User(user.to_string()));
        }
        if let Some(group) = value.strip_prefix("group:") {
            return Ok(Self::Group(group.to_string()));
        }
        Err(format!(
            "invalid subject '{value}': expected user:<name>, group:<name> or any"
        ))
    }
}

impl SubjectMatcher {
    fn is_match(&self, session: &IdentitySession) -> bool {
        match self {
            Self::Any => true,
            Self::User(user) => session.principal.as_deref() == Some(user.as_str()),
            Self::Group(group) => session.groups.contains(group),
        }
    }
}

/// A single access-control rule. Empty matcher lists match everything.
#[derive(Clone, Debug)]
pub struct Rule {
    pub domains: Vec<DomainMatcher>,
    pub resources: Vec<Regex>,
    pub subjects: Vec<SubjectMatcher>,
    pub networks: Vec<IpNetwork>,
    pub methods: Vec<Method>,
    pub policy: Policy,
    pub required_methods: BTreeSet<SecondFactorMethod>,
}

impl Rule {
    #[must_use]
    pub fn new(policy: Policy) -> Self {
        Self {
            domains: Vec::new(),
            resources: Vec::new(),
            subjects: Vec::new(),
            networks: Vec::new(),
            methods: Vec::new(),
            policy,
            required_methods: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn with_domain(mut self, domain: &str) -> Self {
        self.domains.push(DomainMatcher::parse(domain));
        self
    }

    #[must_use]
    pub fn with_resource(mut self, resource: Regex) -> Self {
        self.resources.push(resource);
        self
    }

    #[must_use]
    pub fn with_subject(mut self, subject: SubjectMatcher) -> Self {
        self.subjects.push(subject);
        self
    }

    #[must_use]
    pub fn with_network(mut self, network: IpNetwork) -> Self {
        self.networks.push(network);
        self
    }

    #[must_use]
    pub fn with_method(mut self, method: Method) -> Self {
        self.methods.push(method);
        self
    }

    #[must_use]
    pub fn with_required_method(mut self, method: SecondFactorMethod) -> Self {
        self.required_methods.insert(method);
        self
    }

    #[must_use]
    pub fn has_subjects(&self) -> bool {
        !self.subjects.is_empty()
    }

    /// Domain, resource, network, and method; everything but the subject.
    #[must_use]
    pub fn matches_object(&self, target: &Target) -> bool {
        let host = target.host();
        let domain = self.domains.is_empty() || self.domains.iter().any(|d| d.is_match(&host));
        if !domain {
            return false;
        }

        let resource = self.resources.is_empty() || {
            let resource = target.resource();
            self.resources.iter().any(|r| r.is_match(&resource))
        };

        resource
            && (self.networks.is_empty()
                || self.networks.iter().any(|n| n.contains(target.client_ip)))
            && (self.methods.is_empty() || self.methods.contains(&target.method))
    }

    #[must_use]
    pub fn matches_subject(&self, session: &IdentitySession) -> bool {
        self.subjects.is_empty() || self.subjects.iter().any(|s| s.is_match(session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn target(url: &str, ip: &str) -> Target {
        Target::new(
            Url::parse(url).unwrap(),
            Method::GET,
            ip.parse().unwrap(),
        )
    }

    #[test]
    fn wildcard_domain_excludes_apex() {
        let matcher = DomainMatcher::parse("*.Example.com");
        assert!(matcher.is_match("app.example.com"));
        assert!(matcher.is_match("a.b.example.com"));
        assert!(!matcher.is_match("example.com"));
        assert!(!matcher.is_match("badexample.com"));
    }

    #[test]
    fn resource_includes_query() {
        let rule = Rule::new(Policy::Bypass).with_resource(Regex::new(r"^/api\?debug=1$").unwrap());
        assert!(rule.matches_object(&target("https://app.example.com/api?debug=1", "1.2.3.4")));
        assert!(!rule.matches_object(&target("https://app.example.com/api", "1.2.3.4")));
    }

    #[test]
    fn network_matcher_uses_cidr() {
        let rule = Rule::new(Policy::Bypass).with_network("10.0.0.0/8".parse().unwrap());
        assert!(rule.matches_object(&target("https://a.example.com/", "10.1.2.3")));
        assert!(!rule.matches_object(&target("https://a.example.com/", "192.168.1.1")));
    }

    #[test]
    fn method_matcher() {
        let rule = Rule::new(Policy::Bypass).with_method(Method::OPTIONS);
        assert!(!rule.matches_object(&target("https://a.example.com/", "10.1.2.3")));
    }

    #[test]
    fn subject_parsing() {
        assert_eq!(
            "user:alice".parse::<SubjectMatcher>(),
            Ok(SubjectMatcher::User("alice".to_string()))
        );
        assert_eq!(
            "group:dev".parse::<SubjectMatcher>(),
            Ok(SubjectMatcher::Group("dev".to_string()))
        );
        assert_eq!("any".parse::<SubjectMatcher>(), Ok(SubjectMatcher::Any));
        assert!("role:x".parse::<SubjectMatcher>().is_err());
    }

    #[test]
    fn group_subject_matches_membership() {
        let mut session = IdentitySession::anonymous(Utc::now());
        session.principal = Some("bob".to_string());
        session.groups.insert("dev".to_string());
        let rule = Rule::new(Policy::OneFactor).with_subject(SubjectMatcher::Group("dev".into()));
        assert!(rule.matches_subject(&session));
        session.groups.clear();
        assert!(!rule.matches_subject(&session));
    }
}

//! Access control policy engine.
//!
//! Flow Overview:
//! 1) Rules are tried in declaration order; the first match wins and the
//!    engine never reorders by specificity.
//! 2) No match falls back to the configured default policy.
//! 3) The resolved policy plus the session's factor level yield a [`Decision`].
//!
//! The rule set is immutable once loaded. [`PolicyHandle`] swaps whole
//! snapshots on reload; a request keeps the `Arc` it started with.

pub mod client_ip;
pub mod config;
pub mod rule;

pub use client_ip::TrustedProxies;
pub use rule::{DomainMatcher, Policy, Rule, SubjectMatcher, Target};

use crate::session::{FactorLevel, IdentitySession, SecondFactorMethod};
use std::{
    collections::BTreeSet,
    sync::{Arc, RwLock},
};
use tracing::trace;

/// Outcome of evaluating one request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    Allow,
    DenyRedirect {
        required_level: FactorLevel,
        required_methods: BTreeSet<SecondFactorMethod>,
    },
    Deny,
}

/// Policy resolved for a target before the session's level is compared.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Requirement {
    pub policy: Policy,
    pub required_methods: BTreeSet<SecondFactorMethod>,
    /// Index of the matching rule, `None` for the default policy.
    pub rule: Option<usize>,
    /// The rule binds subjects the caller has not proven yet.
    pub needs_identity: bool,
}

#[derive(Clone, Debug)]
pub struct AccessControl {
    default_policy: Policy,
    rules: Vec<Rule>,
}

impl AccessControl {
    #[must_use]
    pub fn new(default_policy: Policy, rules: Vec<Rule>) -> Self {
        Self {
            default_policy,
            rules,
        }
    }

    #[must_use]
    pub fn default_policy(&self) -> Policy {
        self.default_policy
    }

    #[must_use]
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Resolve the requirement for `target` as seen by `session`.
    ///
    /// An anonymous caller matches subject-bound rules provisionally: once it
    /// authenticates the rule is re-evaluated against its real identity.
    #[must_use]
    pub fn requirement(&self, target: &Target, session: &IdentitySession) -> Requirement {
        let anonymous = session.is_anonymous();
        for (index, rule) in self.rules.iter().enumerate() {
            if !rule.matches_object(target) {
                continue;
            }
            if rule.has_subjects() {
                if anonymous {
                    trace!(rule = index, "anonymous caller on subject-bound rule");
                    return Requirement {
                        policy: rule.policy,
                        required_methods: rule.required_methods.clone(),
                        rule: Some(index),
                        needs_identity: true,
                    };
                }
                if !rule.matches_subject(session) {
                    continue;
                }
            }
            trace!(rule = index, policy = rule.policy.as_str(), "rule matched");
            return Requirement {
                policy: rule.policy,
                required_methods: rule.required_methods.clone(),
                rule: Some(index),
                needs_identity: false,
            };
        }

        Requirement {
            policy: self.default_policy,
            required_methods: BTreeSet::new(),
            rule: None,
            needs_identity: false,
        }
    }

    /// Evaluate `target` for `session`. Pure; safe to call concurrently.
    #[must_use]
    pub fn evaluate(&self, target: &Target, session: &IdentitySession) -> Decision {
        decide(&self.requirement(target, session), session)
    }
}

/// Compare a resolved requirement against the session's factor state.
#[must_use]
pub fn decide(requirement: &Requirement, session: &IdentitySession) -> Decision {
    if requirement.needs_identity {
        let required_level = match requirement.policy {
            Policy::TwoFactor => FactorLevel::Second,
            Policy::Bypass | Policy::OneFactor | Policy::Deny => FactorLevel::First,
        };
        let required_methods = if required_level == FactorLevel::Second {
            requirement.required_methods.clone()
        } else {
            BTreeSet::new()
        };
        return Decision::DenyRedirect {
            required_level,
            required_methods,
        };
    }

    match requirement.policy {
        Policy::Bypass => Decision::Allow,
        Policy::Deny => Decision::Deny,
        Policy::OneFactor => {
            if session.factor_level >= FactorLevel::First {
                Decision::Allow
            } else {
                Decision::DenyRedirect {
                    required_level: FactorLevel::First,
                    required_methods: BTreeSet::new(),
                }
            }
        }
        Policy::TwoFactor => {
            let level_ok = session.factor_level >= FactorLevel::Second;
            let methods_ok = requirement.required_methods.is_empty()
                || requirement
                    .required_methods
                    .iter()
                    .any(|method| session.has_method(*method));
            if level_ok && methods_ok {
                Decision::Allow
            } else {
                Decision::DenyRedirect {
                    required_level: FactorLevel::Second,
                    required_methods: requirement.required_methods.clone(),
                }
            }
        }
    }
}

/// Shared, atomically replaceable rule set.
#[derive(Debug)]
pub struct PolicyHandle {
    current: RwLock<Arc<AccessControl>>,
}

impl PolicyHandle {
    #[must_use]
    pub fn new(access_control: AccessControl) -> Self {
        Self {
            current: RwLock::new(Arc::new(access_control)),
        }
    }

    /// The snapshot a request should hold for its whole duration.
    #[must_use]
    pub fn snapshot(&self) -> Arc<AccessControl> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Replace the whole rule set.
    pub fn replace(&self, access_control: AccessControl) {
        let next = Arc::new(access_control);
        match self.current.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }
}

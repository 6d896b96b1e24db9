//! Out-of-band push approval.
//!
//! `begin` sends an approval request bound to the ceremony token; `verify`
//! polls the approver until it answers or the wait elapses. Dropping the
//! `finish` future cancels the wait.

use super::{CeremonyToken, Challenge, FactorVerifier, Operation, Proof, Verdict};
use crate::{
    error::{AuthError, Result},
    session::SecondFactorMethod,
};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, instrument};
use url::Url;

pub const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushStatus {
    Pending,
    #[serde(alias = "allow")]
    Approved,
    #[serde(alias = "deny")]
    Denied,
}

/// External provider that asks the user to approve a sign-in.
#[async_trait]
pub trait PushApprover: Send + Sync {
    async fn is_enrolled(&self, subject: &str) -> Result<bool>;

    async fn send(&self, subject: &str, transaction: &str) -> Result<()>;

    async fn status(&self, transaction: &str) -> Result<PushStatus>;
}

#[derive(Serialize)]
struct PushRequest<'a> {
    subject: &'a str,
    transaction: &'a str,
}

#[derive(Deserialize)]
struct PushStatusResponse {
    status: PushStatus,
}

/// JSON-over-HTTP approver.
///
/// * `GET  {base}/enrollment/{subject}` answers 200 when enrolled, 404 otherwise
/// * `POST {base}/push` with `{"subject", "transaction"}`
/// * `GET  {base}/push/{transaction}` answers `{"status": "pending|approved|denied"}`
pub struct HttpPushApprover {
    client: Client,
    base: Url,
}

impl HttpPushApprover {
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(base: Url, request_timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent(crate::APP_USER_AGENT)
            .timeout(request_timeout)
            .build()?;
        Ok(Self { client, base })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| {
                error!("push approver base URL cannot carry a path: {}", self.base);
                AuthError::StoreUnavailable
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

fn upstream_error(err: &reqwest::Error) -> AuthError {
    error!("Push approver request failed: {err}");
    AuthError::StoreUnavailable
}

#[async_trait]
impl PushApprover for HttpPushApprover {
    async fn is_enrolled(&self, subject: &str) -> Result<bool> {
        let url = self.endpoint(&["enrollment", subject])?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| upstream_error(&err))?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => {
                error!("Push approver enrollment lookup returned {status}");
                Err(AuthError::StoreUnavailable)
            }
        }
    }

    async fn send(&self, subject: &str, transaction: &str) -> Result<()> {
        let url = self.endpoint(&["push"])?;
        self.client
            .post(url)
            .json(&PushRequest {
                subject,
                transaction,
            })
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|err| upstream_error(&err))?;
        Ok(())
    }

    async fn status(&self, transaction: &str) -> Result<PushStatus> {
        let url = self.endpoint(&["push", transaction])?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|err| upstream_error(&err))?;
        let body: PushStatusResponse = response.json().await.map_err(|err| upstream_error(&err))?;
        Ok(body.status)
    }
}

pub struct PushVerifier {
    approver: Arc<dyn PushApprover>,
    wait: Duration,
    poll_interval: Duration,
}

impl PushVerifier {
    #[must_use]
    pub fn new(approver: Arc<dyn PushApprover>) -> Self {
        Self {
            approver,
            wait: DEFAULT_APPROVAL_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    #[must_use]
    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    async fn await_decision(&self, transaction: &str) -> Result<()> {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.approver.status(transaction).await? {
                PushStatus::Pending => debug!("push approval pending"),
                PushStatus::Approved => return Ok(()),
                PushStatus::Denied => return Err(AuthError::ExternalDenied),
            }
        }
    }
}

#[async_trait]
impl FactorVerifier for PushVerifier {
    fn method(&self) -> SecondFactorMethod {
        SecondFactorMethod::Push
    }

    async fn is_registered(&self, subject: &str) -> Result<bool> {
        self.approver.is_enrolled(subject).await
    }

    async fn begin(&self, token: &CeremonyToken) -> Result<(Vec<u8>, Challenge)> {
        // Enrollment happens at the provider.
        if token.purpose.operation == Operation::Register {
            return Err(AuthError::MethodDisabled);
        }
        let transaction = token.id.to_string();
        self.approver.send(&token.subject, &transaction).await?;
        info!(subject = %token.subject, %transaction, "push approval requested");
        Ok((transaction.clone().into_bytes(), Challenge::Push { transaction }))
    }

    #[instrument(skip_all, fields(subject = %token.subject))]
    async fn verify(&self, token: &CeremonyToken, proof: &Proof) -> Result<Verdict> {
        if *proof != Proof::Approval {
            return Ok(Verdict::Rejected("proof type mismatch"));
        }
        let Ok(transaction) = std::str::from_utf8(&token.challenge) else {
            return Ok(Verdict::Rejected("transaction encoding"));
        };
        match timeout(self.wait, self.await_decision(transaction)).await {
            Ok(Ok(())) => Ok(Verdict::Accepted),
            Ok(Err(err)) => {
                info!("push approval failed: {err}");
                Err(err)
            }
            Err(_) => {
                info!("push approval timed out");
                Err(AuthError::Timeout)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ceremony::Purpose;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    /// Answers `Pending` until `answer_after` polls, then `answer`.
    struct ScriptedApprover {
        answer: PushStatus,
        answer_after: usize,
        polls: AtomicUsize,
        sent: Mutex<Vec<(String, String)>>,
    }

    impl ScriptedApprover {
        fn new(answer: PushStatus, answer_after: usize) -> Arc<Self> {
            Arc::new(Self {
                answer,
                answer_after,
                polls: AtomicUsize::new(0),
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl PushApprover for ScriptedApprover {
        async fn is_enrolled(&self, subject: &str) -> Result<bool> {
            Ok(subject == "alice")
        }

        async fn send(&self, subject: &str, transaction: &str) -> Result<()> {
            self.sent
                .lock()
                .await
                .push((subject.to_string(), transaction.to_string()));
            Ok(())
        }

        async fn status(&self, _transaction: &str) -> Result<PushStatus> {
            let polls = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
            if polls >= self.answer_after {
                Ok(self.answer)
            } else {
                Ok(PushStatus::Pending)
            }
        }
    }

    fn token(operation: Operation) -> CeremonyToken {
        CeremonyToken::issue(
            "alice",
            Purpose::new(SecondFactorMethod::Push, operation),
            Vec::new(),
            chrono::Duration::seconds(60),
            Utc::now(),
        )
        .unwrap()
    }

    async fn begun(verifier: &PushVerifier) -> CeremonyToken {
        let mut token = token(Operation::Authenticate);
        let (state, challenge) = verifier.begin(&token).await.unwrap();
        assert_eq!(
            challenge,
            Challenge::Push {
                transaction: token.id.to_string()
            }
        );
        token.challenge = state;
        token
    }

    #[tokio::test(start_paused = true)]
    async fn approval_after_polling_is_accepted() {
        let approver = ScriptedApprover::new(PushStatus::Approved, 3);
        let verifier = PushVerifier::new(approver.clone());
        let token = begun(&verifier).await;
        assert_eq!(approver.sent.lock().await.len(), 1);

        let verdict = verifier.verify(&token, &Proof::Approval).await.unwrap();
        assert_eq!(verdict, Verdict::Accepted);
        assert_eq!(approver.polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn denial_is_reported_as_external_denial() {
        let verifier = PushVerifier::new(ScriptedApprover::new(PushStatus::Denied, 1));
        let token = begun(&verifier).await;
        assert_eq!(
            verifier.verify(&token, &Proof::Approval).await,
            Err(AuthError::ExternalDenied)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn silence_times_out() {
        let verifier = PushVerifier::new(ScriptedApprover::new(PushStatus::Approved, usize::MAX))
            .with_wait(Duration::from_secs(10))
            .with_poll_interval(Duration::from_secs(1));
        let token = begun(&verifier).await;
        assert_eq!(
            verifier.verify(&token, &Proof::Approval).await,
            Err(AuthError::Timeout)
        );
    }

    #[tokio::test]
    async fn registration_is_not_offered() {
        let verifier = PushVerifier::new(ScriptedApprover::new(PushStatus::Approved, 1));
        assert_eq!(
            verifier.begin(&token(Operation::Register)).await.unwrap_err(),
            AuthError::MethodDisabled
        );
    }

    #[tokio::test]
    async fn wrong_proof_is_rejected_without_polling() {
        let approver = ScriptedApprover::new(PushStatus::Approved, 1);
        let verifier = PushVerifier::new(approver.clone());
        let verdict = verifier
            .verify(
                &token(Operation::Authenticate),
                &Proof::Code {
                    code: "123456".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(verdict, Verdict::Rejected("proof type mismatch"));
        assert_eq!(approver.polls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn endpoints_extend_base_path() {
        let base = Url::parse("http://push.local/api/").unwrap();
        let approver = HttpPushApprover::new(base, Duration::from_secs(5)).unwrap();
        assert_eq!(
            approver.endpoint(&["push", "01ABC"]).unwrap().as_str(),
            "http://push.local/api/push/01ABC"
        );
    }
}

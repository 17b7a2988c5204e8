//! The mailbox sync pipeline: token, account, labs, search, attachments, records.
//!
//! A job runs its steps strictly in order inside one task. Failures before the
//! message loop abort the job; failures inside it only skip the message or
//! attachment involved. Every outcome is reported through the [`StatusTracker`].

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::auth::CredentialBroker;
use crate::connectors::{MailProvider, MailSession, ProviderMessage, ProviderRegistry};
use crate::db::models::{JobStatus, MailboxToken, MedicalRecord, Provider};
use crate::error::IngestError;
use crate::labs::LabDirectory;
use crate::linking::RecordLinker;
use crate::records::RecordPersister;
use crate::status::{Counters, StatusTracker, Step, TrackedJob};
use crate::tokens::TokenStore;

pub const PROCESS_TYPE: &str = "mailbox_sync";
const ENTITY_TYPE: &str = "mailbox";
const SUBJECT_PREVIEW_LIMIT: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncCredential {
    /// Code from the provider's OAuth redirect, exchanged at the start of the job.
    AuthorizationCode(String),
    /// Token saved by an earlier job, refreshed when expired.
    Stored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    pub user_id: String,
    pub provider: Provider,
    pub credential: SyncCredential,
}

#[derive(Debug)]
pub struct JobTicket {
    pub job_id: String,
    pub handle: JoinHandle<JobOutcome>,
}

#[derive(Debug)]
pub struct JobOutcome {
    pub job_id: String,
    pub total: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub records: Vec<MedicalRecord>,
    /// The error that aborted the job, if any step was fatal.
    pub fatal: Option<IngestError>,
}

impl JobOutcome {
    fn new(job_id: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            total: 0,
            succeeded: 0,
            failed: 0,
            records: Vec::new(),
            fatal: None,
        }
    }
}

type LeaseSet = Arc<Mutex<HashSet<(String, Provider)>>>;

/// Marks one (user, provider) pair as busy until dropped.
struct SyncLease {
    leases: LeaseSet,
    key: (String, Provider),
}

impl Drop for SyncLease {
    fn drop(&mut self) {
        match self.leases.lock() {
            Ok(mut held) => {
                held.remove(&self.key);
            }
            Err(_) => warn!(user_id = %self.key.0, provider = %self.key.1, "sync lease set poisoned"),
        }
    }
}

#[derive(Clone)]
pub struct SyncOrchestrator {
    registry: Arc<ProviderRegistry>,
    tokens: Arc<dyn TokenStore>,
    labs: Arc<dyn LabDirectory>,
    linker: Arc<dyn RecordLinker>,
    persister: Arc<RecordPersister>,
    tracker: StatusTracker,
    leases: LeaseSet,
}

impl SyncOrchestrator {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        tokens: Arc<dyn TokenStore>,
        labs: Arc<dyn LabDirectory>,
        linker: Arc<dyn RecordLinker>,
        persister: Arc<RecordPersister>,
        tracker: StatusTracker,
    ) -> Self {
        Self {
            registry,
            tokens,
            labs,
            linker,
            persister,
            tracker,
            leases: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn tracker(&self) -> &StatusTracker {
        &self.tracker
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Queues the job and runs it on a detached task; returns as soon as the job row exists.
    pub fn start(&self, request: SyncRequest) -> Result<JobTicket, IngestError> {
        let (lease, job) = self.admit(&request)?;
        let job_id = job.job_id.clone();

        let orchestrator = self.clone();
        let handle = tokio::spawn(async move {
            let _lease = lease;
            orchestrator.execute(job, request).await
        });

        Ok(JobTicket { job_id, handle })
    }

    /// Runs the job on the current task and waits for its outcome.
    pub async fn run(&self, request: SyncRequest) -> Result<JobOutcome, IngestError> {
        let (_lease, job) = self.admit(&request)?;
        Ok(self.execute(job, request).await)
    }

    fn admit(&self, request: &SyncRequest) -> Result<(SyncLease, TrackedJob), IngestError> {
        if self.registry.get(request.provider).is_none() {
            return Err(IngestError::ProviderNotConfigured(request.provider));
        }

        let lease = self.acquire_lease(&request.user_id, request.provider)?;
        let provider_name = request.provider.to_string();
        let job = self.tracker.start_job(
            &request.user_id,
            PROCESS_TYPE,
            Some(provider_name.as_str()),
            Some(ENTITY_TYPE),
            Step::TokenExchange,
        );
        info!(job_id = %job.job_id, user_id = %request.user_id, provider = %request.provider, "sync job queued");
        Ok((lease, job))
    }

    fn acquire_lease(&self, user_id: &str, provider: Provider) -> Result<SyncLease, IngestError> {
        let mut held = self
            .leases
            .lock()
            .map_err(|_| IngestError::Config("sync lease set poisoned".to_string()))?;

        let key = (user_id.to_string(), provider);
        if !held.insert(key.clone()) {
            return Err(IngestError::SyncInProgress {
                user_id: user_id.to_string(),
                provider,
            });
        }

        Ok(SyncLease {
            leases: Arc::clone(&self.leases),
            key,
        })
    }

    async fn execute(&self, job: TrackedJob, request: SyncRequest) -> JobOutcome {
        let mut outcome = JobOutcome::new(&job.job_id);

        if let Err(error) = self.pipeline(&job, &request, &mut outcome).await {
            warn!(job_id = %job.job_id, %error, "sync job aborted");
            outcome.fatal = Some(error);
        }

        info!(
            job_id = %job.job_id,
            total = outcome.total,
            succeeded = outcome.succeeded,
            failed = outcome.failed,
            aborted = outcome.fatal.is_some(),
            "sync job finished"
        );
        outcome
    }

    async fn pipeline(
        &self,
        job: &TrackedJob,
        request: &SyncRequest,
        outcome: &mut JobOutcome,
    ) -> Result<(), IngestError> {
        let entry = self
            .registry
            .get(request.provider)
            .ok_or(IngestError::ProviderNotConfigured(request.provider))?;
        let client = Arc::clone(&entry.client);
        let broker = Arc::clone(&entry.broker);

        let mut token = self.acquire_token(job, request, broker.as_ref()).await?;

        let session = client.resolve_account(&token).await.map_err(|error| {
            self.fail(job, Step::AccountLookup, "Could not identify the mailbox account", error)
        })?;
        self.tracker.log_step(
            job,
            Step::AccountLookup,
            JobStatus::Success,
            "mailbox account resolved",
            Counters::none(),
        );

        token.provider_id = Some(session.account_email.clone());
        match self.tokens.save(&token).await {
            Ok(()) => self.tracker.log_step(
                job,
                Step::TokenSave,
                JobStatus::Success,
                "mailbox token saved",
                Counters::none(),
            ),
            Err(error) => self.tracker.log_step_and_fail(
                job,
                Step::TokenSave,
                "Could not save the mailbox token",
                error.to_string(),
                Counters::none(),
            ),
        }

        let filter = self.lab_filter(job, request, client.as_ref()).await?;

        let messages = client.search(&session, &filter).await.map_err(|error| {
            self.fail(job, Step::Search, "Could not search the mailbox", error)
        })?;
        self.tracker.log_step(
            job,
            Step::Search,
            JobStatus::Success,
            summarize_subjects(&messages),
            Counters {
                total: Some(messages.len() as i64),
                ..Counters::none()
            },
        );

        for message in &messages {
            self.ingest_message(job, request, client.as_ref(), &session, message, outcome)
                .await;
        }

        let summary = format!(
            "{} attachments found, {} saved, {} failed",
            outcome.total, outcome.succeeded, outcome.failed
        );
        let counters = Counters::progress(outcome.total, outcome.succeeded, outcome.failed);
        if outcome.total > 0 && outcome.succeeded == 0 {
            self.tracker.log_step_and_fail(
                job,
                Step::DownloadAttachment,
                "No attachments could be saved",
                summary,
                counters,
            );
        } else {
            self.tracker.log_step(job, Step::DownloadAttachment, JobStatus::Success, summary, counters);
        }

        match self
            .linker
            .link(&request.user_id, &job.job_id, &outcome.records)
            .await
        {
            Ok(()) => self.tracker.log_step(
                job,
                Step::RecordLinking,
                JobStatus::Success,
                format!("{} records handed off", outcome.records.len()),
                Counters::none(),
            ),
            Err(error) => self.tracker.log_step_and_fail(
                job,
                Step::RecordLinking,
                "Could not link the new records",
                error.to_string(),
                Counters::none(),
            ),
        }

        Ok(())
    }

    async fn acquire_token(
        &self,
        job: &TrackedJob,
        request: &SyncRequest,
        broker: &dyn CredentialBroker,
    ) -> Result<MailboxToken, IngestError> {
        let token = match &request.credential {
            SyncCredential::AuthorizationCode(code) => {
                let grant = broker.exchange_code(code).await.map_err(|error| {
                    self.fail(job, Step::TokenExchange, "Could not connect the mailbox", error)
                })?;
                grant.into_token(&request.user_id, request.provider, None)
            }
            SyncCredential::Stored => self.stored_token(job, request, broker).await?,
        };

        self.tracker.log_step(
            job,
            Step::TokenExchange,
            JobStatus::Success,
            "access token acquired",
            Counters::none(),
        );
        Ok(token)
    }

    async fn stored_token(
        &self,
        job: &TrackedJob,
        request: &SyncRequest,
        broker: &dyn CredentialBroker,
    ) -> Result<MailboxToken, IngestError> {
        let stored = self
            .tokens
            .load(&request.user_id, request.provider)
            .await
            .map_err(|error| IngestError::TokenExchangeFailed(format!("token store: {error}")))
            .and_then(|token| {
                token.ok_or_else(|| IngestError::MissingToken {
                    user_id: request.user_id.clone(),
                    provider: request.provider,
                })
            })
            .map_err(|error| {
                self.fail(job, Step::TokenExchange, "No saved mailbox connection", error)
            })?;

        if !stored.is_expired() {
            return Ok(stored);
        }

        let Some(refresh_token) = stored.refresh_token.as_deref() else {
            return Err(self.fail(
                job,
                Step::TokenRefresh,
                "The mailbox connection has expired",
                IngestError::TokenExchangeFailed("token expired without a refresh token".to_string()),
            ));
        };

        self.tracker.log_step(
            job,
            Step::TokenRefresh,
            JobStatus::Retrying,
            "access token expired, refreshing",
            Counters::none(),
        );
        let grant = broker.refresh(refresh_token).await.map_err(|error| {
            self.fail(job, Step::TokenRefresh, "Could not refresh the mailbox connection", error)
        })?;
        self.tracker.log_step(
            job,
            Step::TokenRefresh,
            JobStatus::Success,
            "access token refreshed",
            Counters::none(),
        );

        Ok(grant.into_token(&request.user_id, request.provider, stored.provider_id))
    }

    async fn lab_filter(
        &self,
        job: &TrackedJob,
        request: &SyncRequest,
        client: &dyn MailProvider,
    ) -> Result<String, IngestError> {
        let labs = self
            .labs
            .labs_for_user(&request.user_id)
            .await
            .map_err(|error| IngestError::LabDirectory(error.to_string()))
            .map_err(|error| self.fail(job, Step::LabLookup, "Could not load your labs", error))?;

        let filter = client.build_filter(&labs).map_err(|error| {
            self.fail(job, Step::LabLookup, "Add a lab before syncing your mailbox", error)
        })?;
        self.tracker.log_step(
            job,
            Step::LabLookup,
            JobStatus::Success,
            format!("{} labs in search filter", labs.len()),
            Counters::none(),
        );
        Ok(filter)
    }

    async fn ingest_message(
        &self,
        job: &TrackedJob,
        request: &SyncRequest,
        client: &dyn MailProvider,
        session: &MailSession,
        message: &ProviderMessage,
        outcome: &mut JobOutcome,
    ) {
        if !message.has_attachments {
            self.tracker.log_step(
                job,
                Step::FindAttachments,
                JobStatus::Success,
                format!("message {} has no attachments", message.message_id),
                Counters::none(),
            );
            return;
        }

        let descriptors = match client.list_attachments(session, message).await {
            Ok(descriptors) => descriptors,
            Err(error) => {
                self.tracker.log_step_and_fail(
                    job,
                    Step::FindAttachments,
                    format!("Could not read attachments of message {}", message.message_id),
                    error.to_string(),
                    Counters::progress(outcome.total, outcome.succeeded, outcome.failed),
                );
                return;
            }
        };

        for descriptor in &descriptors {
            outcome.total += 1;

            let saved = match client.download_attachment(session, message, descriptor).await {
                Ok(blob) => {
                    self.persister
                        .persist(&blob, message, &request.user_id, request.provider)
                }
                Err(error) => Err(error),
            };

            match saved {
                Ok(record) => {
                    outcome.succeeded += 1;
                    self.tracker.log_step(
                        job,
                        Step::DownloadAttachment,
                        JobStatus::Running,
                        format!("saved {}", record.record_name),
                        Counters::progress(outcome.total, outcome.succeeded, outcome.failed),
                    );
                    outcome.records.push(record);
                }
                Err(error) => {
                    outcome.failed += 1;
                    self.tracker.log_step_and_fail(
                        job,
                        Step::DownloadAttachment,
                        format!("Could not save attachment {}", descriptor.file_name),
                        format!(
                            "message_id={} attachment_id={}: {error}",
                            message.message_id, descriptor.attachment_id
                        ),
                        Counters::progress(outcome.total, outcome.succeeded, outcome.failed),
                    );
                }
            }
        }
    }

    fn fail(&self, job: &TrackedJob, step: Step, reason: &str, error: IngestError) -> IngestError {
        self.tracker
            .log_step_and_fail(job, step, reason, error.to_string(), Counters::none());
        error
    }
}

fn summarize_subjects(messages: &[ProviderMessage]) -> String {
    let subjects: Vec<&str> = messages
        .iter()
        .filter_map(|message| message.subject.as_deref())
        .map(str::trim)
        .filter(|subject| !subject.is_empty())
        .take(SUBJECT_PREVIEW_LIMIT)
        .collect();

    let mut summary = format!("{} messages found", messages.len());
    if !subjects.is_empty() {
        summary.push_str(": ");
        summary.push_str(&subjects.join("; "));
    }
    summary
}

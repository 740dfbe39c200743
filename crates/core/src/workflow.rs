//! Ingestion workflow.
//!
//! Drives units of work through the pipeline folders:
//!
//! ```text
//! Work/*.json    ──► document pipeline  ──► UploadedPatients | FailedPatients
//! Import/*.json  ──► document pipeline  ──► UploadedPatients | FailedPatients
//! Import/*.hl7   ──► received pipeline  ──► SentHL7 | UnsentHL7
//! HL7gen/*.hl7   ──► generated pipeline ──► SentHL7 | UnsentHL7
//! anything else  ──► Unsupported        ──► FailedPatients (UnsentHL7 for HL7gen)
//! ```
//!
//! Every unit is claimed before it is read and placed into exactly one terminal folder
//! afterwards. Failures inside a pipeline never abort a batch: each becomes an [`Outcome`] that
//! is logged and decides the terminal folder. Failed units stay parked; nothing is retried.

use crate::constants::{DOCUMENT_EXTENSION, MESSAGE_EXTENSION};
use crate::{MessageKind, Outcome, RecordCollaborator, WorkflowError, WorkflowResult};
use async_trait::async_trait;
use relay_files::{ArtifactName, ClaimedUnit, FilesError, Folder, PipelineStore};
use relay_hl7::{generate_ack, AckCode, Acknowledgment, Message};
use relay_transport::Forwarder;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Which pipeline a unit runs through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Document,
    Received,
    Generated,
    /// No pipeline for this file type; the unit goes straight to the given failure folder.
    Unsupported(Folder),
}

impl Route {
    fn for_unit(folder: Folder, name: &ArtifactName) -> Self {
        let extension = name.extension().map(str::to_ascii_lowercase);
        match (folder, extension.as_deref()) {
            (Folder::Work | Folder::Import, Some(DOCUMENT_EXTENSION)) => Route::Document,
            (Folder::Import, Some(MESSAGE_EXTENSION)) => Route::Received,
            (Folder::Generated, Some(MESSAGE_EXTENSION)) => Route::Generated,
            (Folder::Generated, _) => Route::Unsupported(Folder::Unsent),
            _ => Route::Unsupported(Folder::Failed),
        }
    }

    fn success_folder(&self) -> Folder {
        match self {
            Route::Document => Folder::Uploaded,
            Route::Received | Route::Generated => Folder::Sent,
            Route::Unsupported(folder) => *folder,
        }
    }

    fn failure_folder(&self) -> Folder {
        match self {
            Route::Document => Folder::Failed,
            Route::Received | Route::Generated => Folder::Unsent,
            Route::Unsupported(folder) => *folder,
        }
    }
}

/// Tally of one batch operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    /// The intake folder the batch drained.
    pub folder: Folder,
    pub succeeded: usize,
    pub failed: usize,
    /// Units claimed by another worker between listing and claiming.
    pub skipped: usize,
    /// Units whose pipeline ran but which could not be moved to a terminal folder. They stay in
    /// the claim folder until [`PipelineStore::recover_claims`] returns them.
    pub unplaced: Vec<ArtifactName>,
    pub outcomes: Vec<(ArtifactName, Outcome)>,
}

impl BatchReport {
    fn new(folder: Folder) -> Self {
        Self {
            folder,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            unplaced: Vec::new(),
            outcomes: Vec::new(),
        }
    }

    /// Number of units this batch moved to a terminal folder.
    pub fn processed(&self) -> usize {
        self.succeeded + self.failed
    }

    fn push(&mut self, name: ArtifactName, processed: Processed) {
        match processed.placement {
            Ok(_) if processed.outcome.is_ok() => self.succeeded += 1,
            Ok(_) => self.failed += 1,
            Err(_) => self.unplaced.push(name.clone()),
        }
        self.outcomes.push((name, processed.outcome));
    }
}

/// A unit that went through its pipeline, and where it ended up.
struct Processed {
    outcome: Outcome,
    placement: relay_files::FilesResult<PathBuf>,
}

/// Result of running the document pipeline on a document received without a file.
#[derive(Debug, Clone)]
pub struct DocumentReport {
    pub outcome: Outcome,
    /// The `ADT^A01` built for the document, when the pipeline got that far.
    pub outbound: Option<Message>,
    /// Acknowledgment of `outbound`: `AA` when the outcome is `Ok`, `AE` with the outcome
    /// detail otherwise.
    pub ack: Option<Acknowledgment>,
}

/// Single-document ingress.
#[async_trait]
pub trait DocumentIntake: Send + Sync {
    /// Runs the document pipeline on `raw` and reports what happened.
    async fn ingest_document(&self, raw: &str) -> DocumentReport;
}

/// The ingestion workflow over one folder store.
pub struct Pipeline<C, F: ?Sized> {
    store: PipelineStore,
    collaborator: Arc<C>,
    forwarder: Arc<F>,
}

impl<C, F> Pipeline<C, F>
where
    C: RecordCollaborator,
    F: Forwarder + ?Sized,
{
    pub fn new(store: PipelineStore, collaborator: Arc<C>, forwarder: Arc<F>) -> Self {
        Self {
            store,
            collaborator,
            forwarder,
        }
    }

    pub fn store(&self) -> &PipelineStore {
        &self.store
    }

    /// Runs every unit in `Work` through the document pipeline.
    ///
    /// # Errors
    ///
    /// Returns `WorkflowError::Files` only when the folder cannot be listed or a claim fails
    /// for a reason other than losing the race to another worker. A unit that cannot be placed
    /// does not stop the batch; it is reported in [`BatchReport::unplaced`].
    pub async fn upload_work_folder(&self) -> WorkflowResult<BatchReport> {
        self.run_batch(Folder::Work).await
    }

    /// Runs every unit in `Import`: documents through the document pipeline, messages through
    /// the received pipeline.
    ///
    /// # Errors
    ///
    /// As [`Pipeline::upload_work_folder`].
    pub async fn process_import_folder(&self) -> WorkflowResult<BatchReport> {
        self.run_batch(Folder::Import).await
    }

    /// Forwards every message staged in `HL7gen`.
    ///
    /// # Errors
    ///
    /// As [`Pipeline::upload_work_folder`].
    pub async fn dispatch_generated(&self) -> WorkflowResult<BatchReport> {
        self.run_batch(Folder::Generated).await
    }

    /// Uploads a single document from anywhere on disk.
    ///
    /// # Errors
    ///
    /// Returns `WorkflowError::InvalidInput` if `path` is not an existing `.json` file and
    /// `WorkflowError::Files` if the unit cannot be claimed or placed. Pipeline failures are not
    /// errors; they are reported in the returned [`Outcome`].
    pub async fn upload_from_file(&self, path: &Path) -> WorkflowResult<Outcome> {
        self.run_single(path, DOCUMENT_EXTENSION, Route::Document)
            .await
    }

    /// Applies a single received message from anywhere on disk.
    ///
    /// # Errors
    ///
    /// Returns `WorkflowError::InvalidInput` if `path` is not an existing `.hl7` file.
    pub async fn update_from_file(&self, path: &Path) -> WorkflowResult<Outcome> {
        self.run_single(path, MESSAGE_EXTENSION, Route::Received)
            .await
    }

    /// Builds `kind` for `record` and stages it in `HL7gen` for [`Pipeline::dispatch_generated`].
    ///
    /// # Returns
    ///
    /// The path of the staged unit.
    ///
    /// # Errors
    ///
    /// Returns `WorkflowError::Collaborator` if the message cannot be built,
    /// `WorkflowError::InvalidInput` if it is not structurally valid, and
    /// `WorkflowError::Files` if staging fails.
    pub async fn stage_outbound(
        &self,
        record: &C::Record,
        kind: MessageKind,
    ) -> WorkflowResult<PathBuf> {
        let message = self
            .collaborator
            .build_outbound_message(record, kind)
            .await?;
        message
            .validate()
            .map_err(|e| WorkflowError::InvalidInput(e.to_string()))?;

        let control_id: String = message
            .control_id()
            .unwrap_or_default()
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .collect();
        let name = ArtifactName::new(format!(
            "{}_{}-{}.{}",
            kind.code(),
            kind.trigger(),
            control_id,
            MESSAGE_EXTENSION
        ))
        .map_err(FilesError::from)?;

        let path = self
            .store
            .stage(Folder::Generated, &name, message.to_string().as_bytes())?;
        tracing::info!(kind = %kind, path = %path.display(), "outbound message staged");
        Ok(path)
    }

    async fn run_batch(&self, folder: Folder) -> WorkflowResult<BatchReport> {
        let names = self.store.list(folder, None)?;
        tracing::info!(folder = %folder, units = names.len(), "batch started");

        let mut report = BatchReport::new(folder);
        for name in names {
            let route = Route::for_unit(folder, &name);
            let unit = match self.store.claim(folder, &name) {
                Ok(Some(unit)) => unit,
                Ok(None) => {
                    report.skipped += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let processed = self.process_unit(unit, route).await;
            report.push(name, processed);
        }

        if !report.unplaced.is_empty() {
            tracing::error!(
                folder = %folder,
                unplaced = report.unplaced.len(),
                "units left in the claim folder until recovery"
            );
        }
        tracing::info!(
            folder = %folder,
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            "batch finished"
        );
        Ok(report)
    }

    async fn run_single(
        &self,
        path: &Path,
        extension: &str,
        route: Route,
    ) -> WorkflowResult<Outcome> {
        if !path.is_file() {
            return Err(WorkflowError::InvalidInput(format!(
                "{} is not a file",
                path.display()
            )));
        }
        let matches = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(extension));
        if !matches {
            return Err(WorkflowError::InvalidInput(format!(
                "{} is not a .{} file",
                path.display(),
                extension
            )));
        }

        let unit = self.store.claim_path(path)?.ok_or_else(|| {
            WorkflowError::InvalidInput(format!(
                "{} disappeared before it was claimed",
                path.display()
            ))
        })?;
        let processed = self.process_unit(unit, route).await;
        processed.placement?;
        Ok(processed.outcome)
    }

    /// Reads a claimed unit, runs its pipeline and places it. The unit is always placed unless
    /// the store itself fails, in which case it stays claimed until the next recovery.
    async fn process_unit(&self, unit: ClaimedUnit, route: Route) -> Processed {
        let name = unit.name().clone();
        let outcome = match route {
            Route::Unsupported(_) => Outcome::Unsupported(format!(
                "no pipeline for file type of {}",
                name
            )),
            _ => match unit.read_to_string() {
                Ok(raw) => match route {
                    Route::Document => self.run_document(&raw).await.0,
                    Route::Received => self.run_received(&raw).await,
                    _ => self.run_generated(&raw).await,
                },
                Err(e) => Outcome::StructuralInvalid(format!("unreadable unit: {}", e)),
            },
        };
        log_outcome(&name, &outcome);

        let destination = if outcome.is_ok() {
            route.success_folder()
        } else {
            route.failure_folder()
        };
        let placement = self.store.place(unit, destination);
        if let Err(e) = &placement {
            tracing::error!(name = %name, folder = %destination, error = %e, "failed to place unit");
        }
        Processed { outcome, placement }
    }

    /// parse → size check → duplicate check → build `ADT^A01` → forward → persist.
    async fn run_document(&self, raw: &str) -> (Outcome, Option<Message>) {
        let collaborator = &self.collaborator;

        let record = match collaborator.parse(raw).await {
            Ok(record) => record,
            Err(e) => return (Outcome::StructuralInvalid(e.to_string()), None),
        };
        match collaborator.size_ok(&record).await {
            Ok(true) => {}
            Ok(false) => {
                return (
                    Outcome::SizeExceeded("record exceeds the persistence size limit".into()),
                    None,
                )
            }
            Err(e) => return (Outcome::TransportError(e.to_string()), None),
        }
        match collaborator.exists(&record).await {
            Ok(false) => {}
            Ok(true) => {
                return (
                    Outcome::Conflict("record already exists".into()),
                    None,
                )
            }
            Err(e) => return (Outcome::TransportError(e.to_string()), None),
        }

        let message = match collaborator
            .build_outbound_message(&record, MessageKind::AdtA01)
            .await
        {
            Ok(message) => message,
            Err(e) => return (Outcome::StructuralInvalid(e.to_string()), None),
        };
        if let Err(e) = message.validate() {
            return (Outcome::StructuralInvalid(e.to_string()), Some(message));
        }

        let forwarded = self.forward(&message).await;
        if !forwarded.is_ok() {
            return (forwarded, Some(message));
        }

        let persisted = status_outcome(collaborator.persist(&record, false).await);
        (persisted, Some(message))
    }

    /// parse + validate → record from message → forward → dispatch by trigger event.
    async fn run_received(&self, raw: &str) -> Outcome {
        let message = match Message::parse(raw) {
            Ok(message) => message,
            Err(e) => return Outcome::StructuralInvalid(e.to_string()),
        };
        if let Err(e) = message.validate() {
            return Outcome::StructuralInvalid(e.to_string());
        }

        let record = match self.collaborator.record_from_message(&message).await {
            Ok(record) => record,
            Err(e) => return Outcome::StructuralInvalid(e.to_string()),
        };

        let forwarded = self.forward(&message).await;
        if !forwarded.is_ok() {
            return forwarded;
        }

        let kind = message
            .message_type()
            .as_ref()
            .and_then(MessageKind::from_message_type);
        match kind {
            Some(MessageKind::OrmO01) => {
                status_outcome(self.collaborator.update_following_order(&record).await)
            }
            Some(MessageKind::OruR01) => {
                status_outcome(self.collaborator.update_following_result(&record).await)
            }
            _ => Outcome::Unsupported(format!(
                "no update handler for message type {}",
                message
                    .message_type()
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "(none)".into())
            )),
        }
    }

    /// parse + validate → forward.
    async fn run_generated(&self, raw: &str) -> Outcome {
        let message = match Message::parse(raw) {
            Ok(message) => message,
            Err(e) => return Outcome::StructuralInvalid(e.to_string()),
        };
        if let Err(e) = message.validate() {
            return Outcome::StructuralInvalid(e.to_string());
        }
        self.forward(&message).await
    }

    async fn forward(&self, message: &Message) -> Outcome {
        match self.forwarder.forward(message).await {
            Ok(status) if status.is_success() => Outcome::Ok,
            Ok(status) => Outcome::DownstreamRejected(status.code()),
            Err(e) => {
                tracing::error!(hop = %self.forwarder.describe(), error = %e, "forward failed");
                Outcome::TransportError(e.to_string())
            }
        }
    }
}

#[async_trait]
impl<C, F> DocumentIntake for Pipeline<C, F>
where
    C: RecordCollaborator,
    F: Forwarder + ?Sized,
{
    async fn ingest_document(&self, raw: &str) -> DocumentReport {
        let (outcome, outbound) = self.run_document(raw).await;
        log_outcome("(http document)", &outcome);

        let ack = outbound.as_ref().and_then(|message| {
            let (code, detail) = if outcome.is_ok() {
                (AckCode::Accept, None)
            } else {
                (AckCode::Error, outcome.detail())
            };
            generate_ack(message, code, detail.as_deref())
                .map_err(|e| tracing::error!(error = %e, "failed to acknowledge outbound message"))
                .ok()
        });

        DocumentReport {
            outcome,
            outbound,
            ack,
        }
    }
}

/// Maps a collaborator status answer: `200` is success, any other code a rejection.
fn status_outcome(result: crate::CollaboratorResult<u16>) -> Outcome {
    match result {
        Ok(200) => Outcome::Ok,
        Ok(status) => Outcome::DownstreamRejected(status),
        Err(e) => Outcome::TransportError(e.to_string()),
    }
}

fn log_outcome(name: impl std::fmt::Display, outcome: &Outcome) {
    match outcome {
        Outcome::Ok => tracing::info!(name = %name, "unit processed"),
        Outcome::StructuralInvalid(detail) => {
            tracing::warn!(name = %name, reason = %detail, "structurally invalid input")
        }
        Outcome::SizeExceeded(detail) => {
            tracing::warn!(name = %name, reason = %detail, "record too large")
        }
        Outcome::Conflict(detail) => {
            tracing::warn!(name = %name, reason = %detail, "duplicate record")
        }
        Outcome::DownstreamRejected(status) => {
            tracing::warn!(name = %name, status = *status, "downstream rejected")
        }
        Outcome::Unsupported(detail) => {
            tracing::warn!(name = %name, reason = %detail, "unsupported input")
        }
        Outcome::TransportError(detail) => {
            tracing::error!(name = %name, reason = %detail, "no usable downstream answer")
        }
    }
}

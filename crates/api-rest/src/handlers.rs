use crate::AppState;
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use relay_files::ScratchStore;
use relay_hl7::{generate_ack, AckCode, Message};
use relay_transport::{Forwarder, HopStatus};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Longest prefix of a posted document echoed back in [`DocumentRes`].
const DOCUMENT_ECHO_CHARS: usize = 256;

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthRes {
    pub ok: bool,
    pub message: String,
}

/// Reply of `POST /hl7/tcp`.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct TcpRelayRes {
    pub hl7_message: String,
    pub ack_message: String,
    /// Raw reply of the TCP hop; `null` when the message was not forwarded.
    pub tcp_response: Option<String>,
    pub status: u16,
}

/// Reply of `POST /hl7/http`.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HttpRelayRes {
    pub hl7_message: String,
    pub ack_message: String,
    /// Raw body returned by the HTTP sink; `null` when the message was not forwarded.
    pub domain_response: Option<String>,
    pub status: u16,
}

/// Reply of `POST /documents`.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DocumentRes {
    /// The first 256 characters of the posted document.
    pub document: String,
    pub ack_message: Option<String>,
    pub outcome: String,
    pub status: u16,
}

/// Body of every `500 Internal Server Error` reply.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorRes {
    pub error: String,
    pub status: u16,
}

/// An internal failure, reported as `500` with a failure status in the body.
#[derive(Debug)]
pub struct ApiError(String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorRes {
            error: self.0,
            status: HopStatus::FAILURE.code(),
        };
        (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
    }
}

/// Records the posted body in the scratch store and decodes it, replacing invalid UTF-8.
///
/// Nothing else happens to a body until it has been recorded.
async fn record(scratch: &ScratchStore, body: Bytes) -> Result<String, ApiError> {
    let store = scratch.clone();
    let payload = body.clone();
    let recorded = tokio::task::spawn_blocking(move || store.record(&payload))
        .await
        .map_err(|e| ApiError(e.to_string()))?;
    if let Err(e) = recorded {
        tracing::error!(error = %e, "failed to record posted body");
        return Err(ApiError(e.to_string()));
    }
    Ok(String::from_utf8_lossy(&body).into_owned())
}

/// What happened to a message posted for relaying.
struct Relayed {
    ack_message: String,
    reply: Option<String>,
    status: HopStatus,
}

/// Acknowledges `raw` and, when it is structurally valid, sends it through `hop`.
///
/// An invalid message is answered with its `AE` acknowledgment and is not forwarded.
async fn relay(hop: &dyn Forwarder, raw: &str) -> Result<Relayed, ApiError> {
    let message = Message::parse(raw).map_err(|e| {
        tracing::warn!(error = %e, "unparsable HL7 body");
        ApiError(e.to_string())
    })?;

    let verdict = message.validate();
    let ack = match &verdict {
        Ok(()) => generate_ack(&message, AckCode::Accept, None),
        Err(e) => generate_ack(&message, AckCode::Error, Some(&e.to_string())),
    }
    .map_err(|e| ApiError(e.to_string()))?;

    if let Err(e) = verdict {
        tracing::warn!(reason = %e, "invalid HL7 message, not forwarding");
        return Ok(Relayed {
            ack_message: ack.to_string(),
            reply: None,
            status: HopStatus::FAILURE,
        });
    }

    let reply = hop.exchange(&message.to_string()).await.map_err(|e| {
        tracing::error!(hop = %hop.describe(), error = %e, "forward failed");
        ApiError(e.to_string())
    })?;
    let status = HopStatus::from_reply(&reply);
    tracing::info!(hop = %hop.describe(), status = %status, "message relayed");

    Ok(Relayed {
        ack_message: ack.to_string(),
        reply: Some(reply),
        status,
    })
}

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Health check response", body = HealthRes)
    )
)]
/// Health check endpoint for the ingress.
#[axum::debug_handler]
pub async fn health(State(_state): State<AppState>) -> Json<HealthRes> {
    Json(HealthRes {
        ok: true,
        message: "HL7 relay is alive".into(),
    })
}

#[utoipa::path(
    post,
    path = "/hl7/tcp",
    request_body(content = String, content_type = "text/plain", description = "HL7v2 message"),
    responses(
        (status = 200, description = "Message acknowledged and, if valid, forwarded", body = TcpRelayRes),
        (status = 500, description = "Message could not be processed", body = ErrorRes)
    )
)]
/// Acknowledge an HL7 message and forward it over mutual-TLS TCP.
///
/// # Returns
/// * `Ok(Json<TcpRelayRes>)` - The acknowledgment, the hop's raw reply and the mapped status
///
/// # Errors
/// Returns `500 Internal Server Error` if:
/// - the body cannot be recorded,
/// - the body is not an HL7 message with a control id, or
/// - the TCP hop gives no reply.
#[axum::debug_handler]
pub async fn relay_tcp(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<TcpRelayRes>, ApiError> {
    let body = record(&state.scratch, body).await?;
    let relayed = relay(state.tcp_hop.as_ref(), &body).await?;
    Ok(Json(TcpRelayRes {
        hl7_message: body,
        ack_message: relayed.ack_message,
        tcp_response: relayed.reply,
        status: relayed.status.code(),
    }))
}

#[utoipa::path(
    post,
    path = "/hl7/http",
    request_body(content = String, content_type = "text/plain", description = "HL7v2 message"),
    responses(
        (status = 200, description = "Message acknowledged and, if valid, posted to the sink", body = HttpRelayRes),
        (status = 500, description = "Message could not be processed", body = ErrorRes)
    )
)]
/// Acknowledge an HL7 message and post it to the configured HTTP sink.
///
/// # Errors
/// Returns `500 Internal Server Error` if the body cannot be recorded, is not an HL7 message with
/// a control id, or the sink cannot be reached.
#[axum::debug_handler]
pub async fn relay_http(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<HttpRelayRes>, ApiError> {
    let body = record(&state.scratch, body).await?;
    let relayed = relay(state.http_sink.as_ref(), &body).await?;
    Ok(Json(HttpRelayRes {
        hl7_message: body,
        ack_message: relayed.ack_message,
        domain_response: relayed.reply,
        status: relayed.status.code(),
    }))
}

#[utoipa::path(
    post,
    path = "/documents",
    request_body(content = String, content_type = "application/json", description = "FHIR Patient or Bundle"),
    responses(
        (status = 200, description = "Document pipeline outcome", body = DocumentRes),
        (status = 500, description = "Document could not be recorded", body = ErrorRes)
    )
)]
/// Run a FHIR document through the document pipeline.
///
/// The pipeline's outcome is reported in the body; a failed document is not an HTTP error.
///
/// # Errors
/// Returns `500 Internal Server Error` if the body cannot be recorded.
#[axum::debug_handler]
pub async fn ingest_document(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<DocumentRes>, ApiError> {
    let body = record(&state.scratch, body).await?;
    let report = state.intake.ingest_document(&body).await;
    let status = if report.outcome.is_ok() {
        HopStatus::OK
    } else {
        HopStatus::FAILURE
    };
    Ok(Json(DocumentRes {
        document: body.chars().take(DOCUMENT_ECHO_CHARS).collect(),
        ack_message: report.ack.map(|ack| ack.to_string()),
        outcome: report.outcome.to_string(),
        status: status.code(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router;
    use async_trait::async_trait;
    use relay_core::{LocalRecordStore, Pipeline};
    use relay_files::PipelineStore;
    use relay_transport::{TransportError, TransportResult};
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    const VALID: &str = "MSH|^~\\&|HIS|RIH|ADT|RIH|20230523102000||ADT^A01|CTRL123|P|2.4\rPID|1";
    const MSH_ONLY: &str = "MSH|^~\\&|HIS|RIH|ADT|RIH|20230523102000||ADT^A01|CTRL124|P|2.4";

    const PATIENT: &str = r#"{
        "resourceType": "Patient",
        "identifier": [{"value": "SYN0004S"}],
        "name": [{"family": "Stamm", "given": ["Cornell"]}],
        "gender": "male",
        "birthDate": "1994-01-01"
    }"#;

    /// Replies with a fixed payload, or fails when `reply` is `None`.
    struct FixedReply {
        reply: Option<&'static str>,
        calls: AtomicUsize,
    }

    impl FixedReply {
        fn new(reply: Option<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                reply,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Forwarder for FixedReply {
        fn describe(&self) -> String {
            "fixed".into()
        }

        async fn exchange(&self, _payload: &str) -> TransportResult<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reply
                .map(str::to_owned)
                .ok_or_else(|| TransportError::NoResponse("fixed".into()))
        }
    }

    struct Harness {
        base: String,
        tcp_hop: Arc<FixedReply>,
        data: TempDir,
    }

    impl Harness {
        fn scratch_dir(&self) -> std::path::PathBuf {
            self.data.path().join("Scratch")
        }

        fn scratch_files(&self) -> Vec<Vec<u8>> {
            std::fs::read_dir(self.scratch_dir())
                .unwrap()
                .map(|entry| std::fs::read(entry.unwrap().path()).unwrap())
                .collect()
        }
    }

    async fn start(tcp_reply: Option<&'static str>) -> Harness {
        let data = TempDir::new().unwrap();
        let tcp_hop = FixedReply::new(tcp_reply);
        let store = PipelineStore::new(data.path()).unwrap();
        let pipeline = Pipeline::new(
            store,
            Arc::new(LocalRecordStore::new(data.path().join("Records"))),
            FixedReply::new(Some("200")),
        );
        let state = AppState {
            tcp_hop: tcp_hop.clone(),
            http_sink: FixedReply::new(Some(r#"{"status": 200, "data": "received"}"#)),
            intake: Arc::new(pipeline),
            scratch: ScratchStore::new(&data.path().join("Scratch")).unwrap(),
        };

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });

        Harness {
            base: format!("http://{}", addr),
            tcp_hop,
            data,
        }
    }

    async fn post(base: &str, path: &str, body: &str) -> (u16, Value) {
        let response = reqwest::Client::new()
            .post(format!("{}{}", base, path))
            .header("content-type", "text/plain")
            .body(body.to_owned())
            .send()
            .await
            .unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let harness = start(Some("200")).await;
        let body: Value = reqwest::get(format!("{}/health", harness.base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["ok"], true);
    }

    #[tokio::test]
    async fn test_tcp_relay_acknowledges_and_forwards() {
        let harness = start(Some("200")).await;
        let (http_status, body) = post(&harness.base, "/hl7/tcp", VALID).await;

        assert_eq!(http_status, 200);
        assert!(body["ack_message"]
            .as_str()
            .unwrap()
            .contains("MSA|AA|CTRL123"));
        assert_eq!(body["tcp_response"], "200");
        assert_eq!(body["status"], 200);
        assert_eq!(body["hl7_message"], VALID);
        assert_eq!(harness.tcp_hop.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_tcp_relay_does_not_forward_invalid_message() {
        let harness = start(Some("200")).await;
        let (http_status, body) = post(&harness.base, "/hl7/tcp", MSH_ONLY).await;

        assert_eq!(http_status, 200);
        let ack = body["ack_message"].as_str().unwrap();
        assert!(ack.contains("MSA|AE|CTRL124|not enough segments"));
        assert!(body["tcp_response"].is_null());
        assert_eq!(body["status"], 400);
        assert_eq!(harness.tcp_hop.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_internal_failures_reply_500() {
        let harness = start(None).await;

        let (http_status, body) = post(&harness.base, "/hl7/tcp", VALID).await;
        assert_eq!(http_status, 500);
        assert_eq!(body["status"], 400);
        assert!(body["error"].as_str().unwrap().contains("No response"));

        let (http_status, body) = post(&harness.base, "/hl7/tcp", "hello there").await;
        assert_eq!(http_status, 500);
        assert_eq!(body["status"], 400);
    }

    #[tokio::test]
    async fn test_every_posted_body_is_recorded() {
        let harness = start(Some("200")).await;

        post(&harness.base, "/hl7/tcp", VALID).await;
        post(&harness.base, "/hl7/http", MSH_ONLY).await;
        post(&harness.base, "/documents", PATIENT).await;
        post(&harness.base, "/hl7/tcp", "hello there").await;

        let recorded = harness.scratch_files();
        assert_eq!(recorded.len(), 4);
        for body in [VALID, MSH_ONLY, PATIENT, "hello there"] {
            assert!(recorded.iter().any(|r| r == body.as_bytes()));
        }
    }

    #[tokio::test]
    async fn test_unrecordable_body_is_not_forwarded() {
        let harness = start(Some("200")).await;
        std::fs::remove_dir_all(harness.scratch_dir()).unwrap();
        std::fs::write(harness.scratch_dir(), b"not a directory").unwrap();

        let (http_status, body) = post(&harness.base, "/hl7/tcp", VALID).await;
        assert_eq!(http_status, 500);
        assert_eq!(body["status"], 400);
        assert_eq!(harness.tcp_hop.calls.load(Ordering::SeqCst), 0);

        let (http_status, _) = post(&harness.base, "/documents", PATIENT).await;
        assert_eq!(http_status, 500);
    }

    #[tokio::test]
    async fn test_http_relay_maps_sink_status() {
        let harness = start(Some("200")).await;
        let (_, body) = post(&harness.base, "/hl7/http", VALID).await;

        assert_eq!(body["status"], 200);
        assert!(body["domain_response"]
            .as_str()
            .unwrap()
            .contains("received"));
    }

    #[tokio::test]
    async fn test_documents_run_the_pipeline() {
        let harness = start(Some("200")).await;

        let (_, body) = post(&harness.base, "/documents", PATIENT).await;
        assert_eq!(body["outcome"], "Ok");
        assert_eq!(body["status"], 200);
        assert!(body["ack_message"].as_str().unwrap().contains("MSA|AA|"));

        let (_, body) = post(&harness.base, "/documents", PATIENT).await;
        assert!(body["outcome"].as_str().unwrap().starts_with("Conflict"));
        assert_eq!(body["status"], 400);
        assert!(body["ack_message"].is_null());

        let long = "x".repeat(1000);
        let (_, body) = post(&harness.base, "/documents", &long).await;
        assert_eq!(body["document"].as_str().unwrap().len(), 256);
        assert_eq!(body["status"], 400);
    }

    #[tokio::test]
    async fn test_openapi_document_lists_routes() {
        let harness = start(Some("200")).await;
        let body: Value = reqwest::get(format!("{}/api-docs/openapi.json", harness.base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(body["paths"]["/hl7/tcp"].is_object());
        assert!(body["paths"]["/documents"].is_object());
    }
}

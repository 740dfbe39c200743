use crate::{Forwarder, HopStatus, TransportResult, DEFAULT_READ_TIMEOUT};
use async_trait::async_trait;
use relay_hl7::Message;
use std::time::Duration;

/// HTTP hop: POSTs the raw message as `text/plain`.
#[derive(Debug, Clone)]
pub struct HttpHop {
    url: String,
    client: reqwest::Client,
}

impl HttpHop {
    /// Creates a hop for `url` with the default request timeout.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Http` if the HTTP client cannot be initialised.
    pub fn new(url: impl Into<String>) -> TransportResult<Self> {
        Self::with_timeout(url, DEFAULT_READ_TIMEOUT)
    }

    pub fn with_timeout(url: impl Into<String>, timeout: Duration) -> TransportResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn post(&self, payload: &str) -> TransportResult<reqwest::Response> {
        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(payload.to_owned())
            .send()
            .await?;
        Ok(response)
    }
}

#[async_trait]
impl Forwarder for HttpHop {
    fn describe(&self) -> String {
        self.url.clone()
    }

    /// Returns the response body whatever the HTTP status, for sinks that reply in plain text.
    async fn exchange(&self, payload: &str) -> TransportResult<String> {
        let response = self.post(payload).await?;
        Ok(response.text().await?)
    }

    /// Success requires a 2xx response whose JSON body carries `"status": 200`.
    async fn forward(&self, message: &Message) -> TransportResult<HopStatus> {
        let response = self.post(&message.to_string()).await?;
        let http_status = response.status();
        if !http_status.is_success() {
            tracing::warn!(url = %self.url, status = %http_status, "HTTP hop returned an error");
            return Ok(HopStatus(http_status.as_u16()));
        }

        let body = response.text().await?;
        let status = match serde_json::from_str::<serde_json::Value>(&body) {
            Ok(value) if value.get("status").is_some() => HopStatus::from_reply(&body),
            _ => {
                tracing::warn!(url = %self.url, "HTTP hop reply has no status");
                HopStatus::FAILURE
            }
        };
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::post, Json, Router};
    use serde_json::json;

    const ADT: &str = "MSH|^~\\&|HIS|RIH|ADT|RIH|20230523102000||ADT^A01|CTRL123|P|2.4\rPID|1";

    async fn spawn(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}/hl7", addr)
    }

    #[tokio::test]
    async fn test_status_200_is_success() {
        let url = spawn(Router::new().route(
            "/hl7",
            post(|body: String| async move { Json(json!({"status": 200, "data": body.len()})) }),
        ))
        .await;
        let hop = HttpHop::new(url).unwrap();
        let message = Message::parse(ADT).unwrap();
        assert_eq!(hop.forward(&message).await.unwrap(), HopStatus::OK);
    }

    #[tokio::test]
    async fn test_error_status_and_bad_bodies_fail() {
        let url = spawn(
            Router::new()
                .route("/hl7", post(|| async { Json(json!({"status": 400})) }))
                .route("/plain", post(|| async { "200" }))
                .route(
                    "/down",
                    post(|| async { (StatusCode::SERVICE_UNAVAILABLE, "busy") }),
                ),
        )
        .await;
        let message = Message::parse(ADT).unwrap();

        let rejected = HttpHop::new(url.clone()).unwrap();
        assert_eq!(rejected.forward(&message).await.unwrap(), HopStatus::FAILURE);

        let plain = HttpHop::new(url.replace("/hl7", "/plain")).unwrap();
        assert_eq!(plain.forward(&message).await.unwrap(), HopStatus::FAILURE);
        assert_eq!(plain.exchange(ADT).await.unwrap(), "200");

        let down = HttpHop::new(url.replace("/hl7", "/down")).unwrap();
        assert_eq!(down.forward(&message).await.unwrap(), HopStatus(503));
    }

    #[tokio::test]
    async fn test_unreachable_is_an_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let hop = HttpHop::new(format!("http://{}/hl7", addr)).unwrap();
        let message = Message::parse(ADT).unwrap();
        assert!(hop.forward(&message).await.is_err());
        assert_eq!(hop.forward_status(&message).await, HopStatus::FAILURE);
    }
}

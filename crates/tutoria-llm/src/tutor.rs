use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, instrument, warn};

use tutoria_core::{SessionRecord, Tutor, TutorAnswer, TutorError};

#[derive(Serialize)]
struct TutorRequest<'a> {
    session: &'a SessionRecord,
}

/// Tutor backed by an HTTP endpoint that accepts `{"session": record}` and
/// returns a [`TutorAnswer`] as JSON.
pub struct HttpTutor {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpTutor {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            timeout,
        }
    }

    fn map_transport(&self, e: reqwest::Error) -> TutorError {
        if e.is_timeout() {
            TutorError::Timeout(self.timeout)
        } else if e.is_decode() {
            TutorError::InvalidResponse(e.to_string())
        } else {
            TutorError::Network(e.to_string())
        }
    }
}

#[async_trait]
impl Tutor for HttpTutor {
    #[instrument(skip_all, fields(code = %snapshot.code, entries = snapshot.dialogue.len()))]
    async fn invoke(&self, snapshot: &SessionRecord) -> Result<TutorAnswer, TutorError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .timeout(self.timeout)
            .json(&TutorRequest { session: snapshot })
            .send()
            .await
            .map_err(|e| self.map_transport(e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "tutor endpoint returned an error");
            return Err(TutorError::from_status(status.as_u16(), body));
        }

        let answer: TutorAnswer = resp.json().await.map_err(|e| self.map_transport(e))?;
        debug!(progress = ?answer.progress, "tutor answered");
        Ok(answer)
    }
}

/// Stand-in used when no tutor endpoint is configured. Every call fails, which
/// surfaces to learners as a tutor-unavailable note.
pub struct UnconfiguredTutor;

#[async_trait]
impl Tutor for UnconfiguredTutor {
    async fn invoke(&self, _snapshot: &SessionRecord) -> Result<TutorAnswer, TutorError> {
        Err(TutorError::Network("no tutor endpoint configured".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn snapshot() -> SessionRecord {
        SessionRecord::new("ABCD", "u1", "en")
    }

    #[tokio::test]
    async fn parses_answer_with_annotations() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tutor"))
            .and(body_partial_json(json!({"session": {"code": "ABCD"}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "response": "Use a repeat block",
                "blockId": "b7",
                "blockName": "controls_repeat",
                "progress": 2
            })))
            .expect(1)
            .mount(&server)
            .await;

        let tutor = HttpTutor::new(format!("{}/tutor", server.uri()), Duration::from_secs(5));
        let answer = tutor.invoke(&snapshot()).await.unwrap();
        assert_eq!(answer.response, "Use a repeat block");
        assert_eq!(answer.block_id.as_deref(), Some("b7"));
        assert_eq!(answer.block_name.as_deref(), Some("controls_repeat"));
        assert_eq!(answer.progress, Some(2));
    }

    #[tokio::test]
    async fn optional_fields_may_be_missing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"response": "ok"})))
            .mount(&server)
            .await;

        let tutor = HttpTutor::new(server.uri(), Duration::from_secs(5));
        let answer = tutor.invoke(&snapshot()).await.unwrap();
        assert_eq!(answer, TutorAnswer::text("ok"));
    }

    #[tokio::test]
    async fn server_error_maps_to_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let tutor = HttpTutor::new(server.uri(), Duration::from_secs(5));
        match tutor.invoke(&snapshot()).await.unwrap_err() {
            TutorError::Http { status, body } => {
                assert_eq!(status, 503);
                assert_eq!(body, "overloaded");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_body_is_invalid_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let tutor = HttpTutor::new(server.uri(), Duration::from_secs(5));
        assert!(matches!(
            tutor.invoke(&snapshot()).await.unwrap_err(),
            TutorError::InvalidResponse(_)
        ));
    }

    #[tokio::test]
    async fn slow_endpoint_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"response": "late"}))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let tutor = HttpTutor::new(server.uri(), Duration::from_millis(100));
        assert!(matches!(
            tutor.invoke(&snapshot()).await.unwrap_err(),
            TutorError::Timeout(_)
        ));
    }

    #[tokio::test]
    async fn unconfigured_tutor_always_fails() {
        assert!(UnconfiguredTutor.invoke(&snapshot()).await.is_err());
    }
}

//! SRI SOAP client: document reception and authorization with bounded
//! retry, transient/permanent classification and per-comprobante state
//! transitions.
//!
//! A rejected comprobante is a *result*, not an error: the pipeline
//! completes and reports `RECHAZADO`. Errors are reserved for transport
//! and protocol failures that survive the retry budget.

pub(crate) mod soap;

use crate::access_key::AccessKey;
use crate::config::Environment;
use crate::sign::SignedDocument;
use crate::store::{DocumentStore, StoreError};
use reqwest::Client;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Per-call SOAP timeout.
pub const SOAP_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Lifecycle state of one comprobante.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentState {
    Signed,
    Received,
    Rejected,
    Authorized,
    Error,
    InProcess,
}

impl DocumentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentState::Signed => "FIRMADO",
            DocumentState::Received => "RECIBIDO",
            DocumentState::Rejected => "RECHAZADO",
            DocumentState::Authorized => "AUTORIZADO",
            DocumentState::Error => "ERROR",
            DocumentState::InProcess => "EN_PROCESO",
        }
    }

    /// Directory name under `comprobantes/`; transient states are never
    /// persisted.
    pub fn dir_name(&self) -> Option<&'static str> {
        match self {
            DocumentState::Signed => Some("firmado"),
            DocumentState::Received => Some("recibido"),
            DocumentState::Rejected => Some("rechazado"),
            DocumentState::Authorized => Some("autorizado"),
            DocumentState::Error => Some("error"),
            DocumentState::InProcess => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DocumentState::Rejected | DocumentState::Authorized | DocumentState::Error
        )
    }
}

#[derive(Debug, Error)]
pub enum SriError {
    #[error("invalid access key: {0}")]
    InvalidAccessKey(String),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("transport failure after {attempts} attempts: {detail}")]
    Transport { attempts: u32, detail: String },

    #[error("malformed SRI response after {attempts} attempts: {detail}")]
    Protocol { attempts: u32, detail: String },

    #[error("pipeline cancelled")]
    Cancelled,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One message from the SRI response envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SriMessage {
    pub identifier: String,
    pub text: String,
    pub additional_info: Option<String>,
    pub kind: Option<String>,
}

impl SriMessage {
    /// Heuristic transient classification: the SRI signals recoverable
    /// conditions with TIMEOUT / CONEXION / SERVICIO markers.
    pub fn is_transient(&self) -> bool {
        let id = self.identifier.to_uppercase();
        let text = self.text.to_uppercase();
        ["TIMEOUT", "CONEXION", "SERVICIO"]
            .iter()
            .any(|marker| id.contains(marker) || text.contains(marker))
    }
}

/// Reception service verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceptionState {
    Received,
    Returned,
}

impl ReceptionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReceptionState::Received => "RECIBIDA",
            ReceptionState::Returned => "DEVUELTA",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReceptionResult {
    pub state: ReceptionState,
    pub messages: Vec<SriMessage>,
}

/// Authorization service verdict for one access key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationState {
    Authorized,
    NotAuthorized,
    InProcess,
    NotFound,
}

#[derive(Debug, Clone)]
pub struct AuthorizationRecord {
    pub state: AuthorizationState,
    pub authorization_number: Option<String>,
    pub authorization_date: Option<String>,
    pub messages: Vec<SriMessage>,
    pub authorized_xml: Option<String>,
}

/// Bounded retry with a fixed backoff between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn reception() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            backoff: Duration::from_secs(3),
        }
    }

    pub fn authorization() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            backoff: Duration::from_secs(3),
        }
    }

    pub fn lookup() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            backoff: Duration::from_secs(2),
        }
    }
}

/// Options for [`SriClient::process`].
#[derive(Debug, Clone)]
pub struct ProcessOptions {
    /// Pause between a RECIBIDA verdict and the first authorization poll.
    pub authorization_delay: Duration,
    pub reception_retry: RetryPolicy,
    pub authorization_retry: RetryPolicy,
    pub cancellation: CancellationToken,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        ProcessOptions {
            authorization_delay: Duration::from_secs(3),
            reception_retry: RetryPolicy::reception(),
            authorization_retry: RetryPolicy::authorization(),
            cancellation: CancellationToken::new(),
        }
    }
}

/// Outcome of a one-shot pipeline run. `success` holds only for a
/// terminal AUTORIZADO.
#[derive(Debug, Clone)]
pub struct FinalResult {
    pub success: bool,
    pub state: DocumentState,
    pub access_key: AccessKey,
    pub messages: Vec<SriMessage>,
    pub authorization_number: Option<String>,
    /// Stable failure category plus detail, when the run did not
    /// authorize: `connectivity`, `rejected by SRI`, `in process`.
    pub failure: Option<String>,
}

/// Client for the SRI reception and authorization SOAP services.
#[derive(Debug)]
pub struct SriClient {
    http: Client,
    reception_url: String,
    authorization_url: String,
}

impl SriClient {
    /// Build a client against the fixed endpoints of `environment`.
    /// `FACTURERO_SRI_RECEPCION_URL` / `FACTURERO_SRI_AUTORIZACION_URL`
    /// override the endpoints when set.
    pub fn new(environment: Environment) -> Result<SriClient, SriError> {
        let reception_url = std::env::var("FACTURERO_SRI_RECEPCION_URL")
            .unwrap_or_else(|_| environment.reception_url().to_string());
        let authorization_url = std::env::var("FACTURERO_SRI_AUTORIZACION_URL")
            .unwrap_or_else(|_| environment.authorization_url().to_string());
        SriClient::with_endpoints(reception_url, authorization_url)
    }

    /// Build a client against explicit endpoints.
    pub fn with_endpoints(
        reception_url: impl Into<String>,
        authorization_url: impl Into<String>,
    ) -> Result<SriClient, SriError> {
        let http = Client::builder()
            .timeout(SOAP_CALL_TIMEOUT)
            .build()
            .map_err(SriError::Http)?;
        Ok(SriClient {
            http,
            reception_url: reception_url.into(),
            authorization_url: authorization_url.into(),
        })
    }

    /// Submit a signed document to the reception service.
    ///
    /// DEVUELTA with only transient messages is retried; DEVUELTA with
    /// business-rule messages is returned as a terminal result.
    pub async fn submit(
        &self,
        signed_xml: &str,
        policy: &RetryPolicy,
    ) -> Result<ReceptionResult, SriError> {
        let envelope = soap::validar_comprobante_envelope(signed_xml);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let body = match self.post(&self.reception_url, &envelope).await {
                Ok(body) => body,
                Err(detail) => {
                    if attempt >= policy.max_attempts {
                        return Err(SriError::Transport {
                            attempts: attempt,
                            detail,
                        });
                    }
                    warn!(target: "sri", attempt, detail = %detail, "reception transport failure, retrying");
                    tokio::time::sleep(policy.backoff).await;
                    continue;
                }
            };

            let parsed = match soap::parse_reception(&body) {
                Ok(parsed) => parsed,
                Err(error) => {
                    if attempt >= policy.max_attempts {
                        return Err(SriError::Protocol {
                            attempts: attempt,
                            detail: error.to_string(),
                        });
                    }
                    warn!(target: "sri", attempt, %error, "malformed reception response, retrying");
                    tokio::time::sleep(policy.backoff).await;
                    continue;
                }
            };

            if parsed.estado == "RECIBIDA" {
                info!(target: "sri", attempt, "comprobante RECIBIDA");
                return Ok(ReceptionResult {
                    state: ReceptionState::Received,
                    messages: parsed.messages,
                });
            }

            let transient = parsed.messages.iter().any(SriMessage::is_transient);
            if transient && attempt < policy.max_attempts {
                warn!(
                    target: "sri",
                    attempt,
                    "DEVUELTA with transient messages, retrying"
                );
                tokio::time::sleep(policy.backoff).await;
                continue;
            }

            info!(target: "sri", attempt, messages = parsed.messages.len(), "comprobante DEVUELTA");
            return Ok(ReceptionResult {
                state: ReceptionState::Returned,
                messages: parsed.messages,
            });
        }
    }

    /// Poll the authorization service until a terminal verdict or the
    /// retry budget runs out; EN_PROCESO (and an empty answer) always
    /// triggers another attempt.
    pub async fn poll(
        &self,
        access_key: &str,
        policy: &RetryPolicy,
    ) -> Result<AuthorizationRecord, SriError> {
        let key = AccessKey::parse(access_key)
            .map_err(|e| SriError::InvalidAccessKey(e.to_string()))?;
        let envelope = soap::autorizacion_comprobante_envelope(key.as_str());

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let body = match self.post(&self.authorization_url, &envelope).await {
                Ok(body) => body,
                Err(detail) => {
                    if attempt >= policy.max_attempts {
                        return Err(SriError::Transport {
                            attempts: attempt,
                            detail,
                        });
                    }
                    warn!(target: "sri", attempt, detail = %detail, "authorization transport failure, retrying");
                    tokio::time::sleep(policy.backoff).await;
                    continue;
                }
            };

            let parsed = match soap::parse_authorization(&body) {
                Ok(parsed) => parsed,
                Err(error) => {
                    if attempt >= policy.max_attempts {
                        return Err(SriError::Protocol {
                            attempts: attempt,
                            detail: error.to_string(),
                        });
                    }
                    warn!(target: "sri", attempt, %error, "malformed authorization response, retrying");
                    tokio::time::sleep(policy.backoff).await;
                    continue;
                }
            };

            let record = record_from_parsed(parsed);
            match record.state {
                AuthorizationState::Authorized | AuthorizationState::NotAuthorized => {
                    info!(
                        target: "sri",
                        attempt,
                        state = ?record.state,
                        authorization_number = record.authorization_number.as_deref(),
                        "authorization verdict"
                    );
                    return Ok(record);
                }
                AuthorizationState::InProcess | AuthorizationState::NotFound => {
                    if attempt >= policy.max_attempts {
                        return Ok(record);
                    }
                    warn!(
                        target: "sri",
                        attempt,
                        state = ?record.state,
                        "authorization pending, retrying"
                    );
                    tokio::time::sleep(policy.backoff).await;
                }
            }
        }
    }

    /// Out-of-band authorization query with the short lookup budget.
    pub async fn lookup(&self, access_key: &str) -> Result<AuthorizationRecord, SriError> {
        self.poll(access_key, &RetryPolicy::lookup()).await
    }

    /// One-shot pipeline: submit, wait, poll, persisting every observed
    /// state. Rejection is reported through [`FinalResult`], never as an
    /// error.
    pub async fn process(
        &self,
        document: &SignedDocument,
        store: &DocumentStore,
        options: &ProcessOptions,
    ) -> Result<FinalResult, SriError> {
        let key = document.access_key().clone();
        let cancel = &options.cancellation;
        store.save(DocumentState::Signed, &key, document.xml())?;

        let reception = tokio::select! {
            _ = cancel.cancelled() => return Err(SriError::Cancelled),
            result = self.submit(document.xml(), &options.reception_retry) => result,
        };
        let reception = match reception {
            Ok(reception) => reception,
            Err(error) => return self.error_result(store, &key, document.xml(), error),
        };

        if reception.state == ReceptionState::Returned {
            store.save(DocumentState::Rejected, &key, document.xml())?;
            return Ok(FinalResult {
                success: false,
                state: DocumentState::Rejected,
                access_key: key,
                messages: reception.messages,
                authorization_number: None,
                failure: Some("rejected by SRI at reception".to_string()),
            });
        }
        store.save(DocumentState::Received, &key, document.xml())?;

        tokio::select! {
            _ = cancel.cancelled() => return Err(SriError::Cancelled),
            _ = tokio::time::sleep(options.authorization_delay) => {}
        }

        let record = tokio::select! {
            _ = cancel.cancelled() => return Err(SriError::Cancelled),
            result = self.poll(key.as_str(), &options.authorization_retry) => result,
        };
        let record = match record {
            Ok(record) => record,
            Err(error) => return self.error_result(store, &key, document.xml(), error),
        };

        match record.state {
            AuthorizationState::Authorized => {
                let artifact = record
                    .authorized_xml
                    .clone()
                    .unwrap_or_else(|| document.xml().to_string());
                store.save(DocumentState::Authorized, &key, &artifact)?;
                Ok(FinalResult {
                    success: true,
                    state: DocumentState::Authorized,
                    access_key: key,
                    messages: record.messages,
                    authorization_number: record.authorization_number,
                    failure: None,
                })
            }
            AuthorizationState::NotAuthorized => {
                store.save(DocumentState::Rejected, &key, document.xml())?;
                Ok(FinalResult {
                    success: false,
                    state: DocumentState::Rejected,
                    access_key: key,
                    messages: record.messages,
                    authorization_number: None,
                    failure: Some("rejected by SRI at authorization".to_string()),
                })
            }
            AuthorizationState::InProcess | AuthorizationState::NotFound => Ok(FinalResult {
                success: false,
                state: DocumentState::Received,
                access_key: key,
                messages: record.messages,
                authorization_number: None,
                failure: Some("in process: authorization pending, query later".to_string()),
            }),
        }
    }

    fn error_result(
        &self,
        store: &DocumentStore,
        key: &AccessKey,
        signed_xml: &str,
        error: SriError,
    ) -> Result<FinalResult, SriError> {
        store.save(DocumentState::Error, key, signed_xml)?;
        Ok(FinalResult {
            success: false,
            state: DocumentState::Error,
            access_key: key.clone(),
            messages: Vec::new(),
            authorization_number: None,
            failure: Some(format!("connectivity: {error}")),
        })
    }

    async fn post(&self, url: &str, envelope: &str) -> Result<String, String> {
        let response = self
            .http
            .post(url)
            .header("Content-Type", "text/xml; charset=utf-8")
            .header("SOAPAction", "")
            .body(envelope.to_string())
            .send()
            .await
            .map_err(|e| format!("request failed: {e}"))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| format!("failed to read response body: {e}"))?;
        if !status.is_success() {
            return Err(format!("status {status}"));
        }
        Ok(body)
    }
}

fn record_from_parsed(parsed: soap::ParsedAuthorization) -> AuthorizationRecord {
    let state = match parsed.estado.as_deref() {
        Some("AUTORIZADO") => AuthorizationState::Authorized,
        Some("NO AUTORIZADO") | Some("NO_AUTORIZADO") | Some("RECHAZADA")
        | Some("RECHAZADO") => AuthorizationState::NotAuthorized,
        Some(_) => AuthorizationState::InProcess,
        None => AuthorizationState::NotFound,
    };
    AuthorizationRecord {
        state,
        authorization_number: parsed.numero_autorizacion,
        authorization_date: parsed.fecha_autorizacion,
        messages: parsed.messages,
        authorized_xml: parsed.comprobante,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_markers_match_identifier_or_text() {
        let by_text = SriMessage {
            identifier: "50".into(),
            text: "ERROR DE CONEXION CON LA BASE".into(),
            additional_info: None,
            kind: None,
        };
        assert!(by_text.is_transient());

        let by_id = SriMessage {
            identifier: "TIMEOUT-01".into(),
            text: "reintente".into(),
            additional_info: None,
            kind: None,
        };
        assert!(by_id.is_transient());

        let permanent = SriMessage {
            identifier: "43".into(),
            text: "CLAVE ACCESO REGISTRADA".into(),
            additional_info: None,
            kind: Some("ERROR".into()),
        };
        assert!(!permanent.is_transient());
    }

    #[test]
    fn terminal_states() {
        assert!(DocumentState::Authorized.is_terminal());
        assert!(DocumentState::Rejected.is_terminal());
        assert!(DocumentState::Error.is_terminal());
        assert!(!DocumentState::Received.is_terminal());
        assert!(!DocumentState::InProcess.is_terminal());
    }

    #[test]
    fn in_process_has_no_directory() {
        assert_eq!(DocumentState::InProcess.dir_name(), None);
        assert_eq!(DocumentState::Rejected.dir_name(), Some("rechazado"));
    }
}

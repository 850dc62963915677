mod common;

use facturero_core::{
    DocumentState, DocumentStore, ProcessOptions, ReceptionState, RetryPolicy, SriClient, SriError,
};
use httpmock::prelude::*;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn quick(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        backoff: Duration::from_millis(10),
    }
}

fn quick_options() -> ProcessOptions {
    ProcessOptions {
        authorization_delay: Duration::from_millis(10),
        reception_retry: quick(3),
        authorization_retry: quick(5),
        cancellation: CancellationToken::new(),
    }
}

const RECIBIDA: &str = r#"<?xml version="1.0"?>
<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"><soap:Body>
<ns2:validarComprobanteResponse xmlns:ns2="http://ec.gob.sri.ws.recepcion">
<RespuestaRecepcionComprobante><estado>RECIBIDA</estado><comprobantes/></RespuestaRecepcionComprobante>
</ns2:validarComprobanteResponse></soap:Body></soap:Envelope>"#;

const DEVUELTA_43: &str = r#"<?xml version="1.0"?>
<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"><soap:Body>
<ns2:validarComprobanteResponse xmlns:ns2="http://ec.gob.sri.ws.recepcion">
<RespuestaRecepcionComprobante><estado>DEVUELTA</estado><comprobantes><comprobante>
<claveAcceso>0</claveAcceso>
<mensajes><mensaje><identificador>43</identificador><mensaje>CLAVE ACCESO REGISTRADA</mensaje><tipo>ERROR</tipo></mensaje></mensajes>
</comprobante></comprobantes></RespuestaRecepcionComprobante>
</ns2:validarComprobanteResponse></soap:Body></soap:Envelope>"#;

const EN_PROCESO: &str = r#"<?xml version="1.0"?>
<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"><soap:Body>
<ns2:autorizacionComprobanteResponse xmlns:ns2="http://ec.gob.sri.ws.autorizacion">
<RespuestaAutorizacionComprobante><numeroComprobantes>1</numeroComprobantes>
<autorizaciones><autorizacion><estado>EN PROCESO</estado></autorizacion></autorizaciones>
</RespuestaAutorizacionComprobante>
</ns2:autorizacionComprobanteResponse></soap:Body></soap:Envelope>"#;

const SIN_COMPROBANTES: &str = r#"<?xml version="1.0"?>
<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"><soap:Body>
<ns2:autorizacionComprobanteResponse xmlns:ns2="http://ec.gob.sri.ws.autorizacion">
<RespuestaAutorizacionComprobante><numeroComprobantes>0</numeroComprobantes>
<autorizaciones/></RespuestaAutorizacionComprobante>
</ns2:autorizacionComprobanteResponse></soap:Body></soap:Envelope>"#;

fn autorizado_body(access_key: &str) -> String {
    format!(
        r#"<?xml version="1.0"?>
<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"><soap:Body>
<ns2:autorizacionComprobanteResponse xmlns:ns2="http://ec.gob.sri.ws.autorizacion">
<RespuestaAutorizacionComprobante><numeroComprobantes>1</numeroComprobantes>
<autorizaciones><autorizacion>
<estado>AUTORIZADO</estado>
<numeroAutorizacion>{access_key}</numeroAutorizacion>
<fechaAutorizacion>2025-08-07T12:00:00-05:00</fechaAutorizacion>
<comprobante>&lt;factura id="comprobante"&gt;&lt;claveAcceso&gt;{access_key}&lt;/claveAcceso&gt;&lt;/factura&gt;</comprobante>
</autorizacion></autorizaciones></RespuestaAutorizacionComprobante>
</ns2:autorizacionComprobanteResponse></soap:Body></soap:Envelope>"#
    )
}

fn client_for(server: &MockServer) -> SriClient {
    SriClient::with_endpoints(server.url("/recepcion"), server.url("/autorizacion"))
        .expect("client")
}

#[tokio::test(flavor = "multi_thread")]
async fn devuelta_is_a_terminal_result_not_an_error() {
    let server = MockServer::start_async().await;
    let reception = server
        .mock_async(|when, then| {
            when.method(POST).path("/recepcion");
            then.status(200)
                .header("content-type", "text/xml")
                .body(DEVUELTA_43);
        })
        .await;

    let dir = tempfile::tempdir().expect("tempdir");
    let store = DocumentStore::new(dir.path());
    let signed = common::signed_demo_document();
    let client = client_for(&server);

    let result = client
        .process(&signed, &store, &quick_options())
        .await
        .expect("process completes without exception");

    assert!(!result.success);
    assert_eq!(result.state, DocumentState::Rejected);
    assert_eq!(result.messages.len(), 1);
    assert_eq!(result.messages[0].identifier, "43");
    assert_eq!(result.messages[0].text, "CLAVE ACCESO REGISTRADA");
    reception.assert_async().await;

    let rejected_dir = dir.path().join("comprobantes").join("rechazado");
    let entries: Vec<_> = std::fs::read_dir(&rejected_dir)
        .expect("rechazado dir")
        .filter_map(Result::ok)
        .collect();
    assert_eq!(entries.len(), 1);
    let name = entries[0].file_name().to_string_lossy().to_string();
    assert!(name.starts_with(signed.access_key().as_str()));
}

#[tokio::test(flavor = "multi_thread")]
async fn en_proceso_then_autorizado_takes_two_polls() {
    let server = MockServer::start_async().await;
    let _reception = server
        .mock_async(|when, then| {
            when.method(POST).path("/recepcion");
            then.status(200)
                .header("content-type", "text/xml")
                .body(RECIBIDA);
        })
        .await;
    let pending = server
        .mock_async(|when, then| {
            when.method(POST).path("/autorizacion");
            then.status(200)
                .header("content-type", "text/xml")
                .body(EN_PROCESO);
        })
        .await;

    let signed = common::signed_demo_document();
    let access_key = signed.access_key().as_str().to_string();
    let dir = tempfile::tempdir().expect("tempdir");
    let store = DocumentStore::new(dir.path());
    let client = client_for(&server);
    let options = ProcessOptions {
        authorization_delay: Duration::from_millis(10),
        reception_retry: quick(3),
        authorization_retry: RetryPolicy {
            max_attempts: 5,
            backoff: Duration::from_millis(500),
        },
        cancellation: CancellationToken::new(),
    };

    let task = tokio::spawn({
        let store = store.clone();
        async move { client.process(&signed, &store, &options).await }
    });

    // wait for the first EN_PROCESO poll, then swap in the verdict
    for _ in 0..200 {
        if pending.hits_async().await >= 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(pending.hits_async().await, 1);
    pending.delete_async().await;
    let authorized = server
        .mock_async(|when, then| {
            when.method(POST).path("/autorizacion");
            then.status(200)
                .header("content-type", "text/xml")
                .body(autorizado_body(&access_key));
        })
        .await;

    let result = task
        .await
        .expect("join")
        .expect("process completes");

    assert!(result.success);
    assert_eq!(result.state, DocumentState::Authorized);
    assert_eq!(result.authorization_number.as_deref(), Some(access_key.as_str()));
    assert_eq!(authorized.hits_async().await, 1);

    // authorized artifact carries the SRI-returned XML
    let authorized_dir = dir.path().join("comprobantes").join("autorizado");
    let entries: Vec<_> = std::fs::read_dir(&authorized_dir)
        .expect("autorizado dir")
        .filter_map(Result::ok)
        .collect();
    assert_eq!(entries.len(), 1);
    let contents = std::fs::read_to_string(entries[0].path()).expect("read artifact");
    assert!(contents.starts_with("<factura"));
    assert!(contents.contains(&access_key));
}

#[tokio::test(flavor = "multi_thread")]
async fn transport_failures_exhaust_the_retry_budget() {
    let server = MockServer::start_async().await;
    let reception = server
        .mock_async(|when, then| {
            when.method(POST).path("/recepcion");
            then.status(500).body("boom");
        })
        .await;

    let client = client_for(&server);
    let err = client
        .submit("<factura/>", &quick(3))
        .await
        .expect_err("must fail");
    match err {
        SriError::Transport { attempts, .. } => assert_eq!(attempts, 3),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(reception.hits_async().await, 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn submit_parses_recibida() {
    let server = MockServer::start_async().await;
    let _reception = server
        .mock_async(|when, then| {
            when.method(POST).path("/recepcion");
            then.status(200)
                .header("content-type", "text/xml")
                .body(RECIBIDA);
        })
        .await;

    let client = client_for(&server);
    let result = client.submit("<factura/>", &quick(3)).await.expect("submit");
    assert_eq!(result.state, ReceptionState::Received);
    assert!(result.messages.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn poll_returns_pending_after_budget() {
    let server = MockServer::start_async().await;
    let pending = server
        .mock_async(|when, then| {
            when.method(POST).path("/autorizacion");
            then.status(200)
                .header("content-type", "text/xml")
                .body(EN_PROCESO);
        })
        .await;

    let signed = common::signed_demo_document();
    let client = client_for(&server);
    let record = client
        .poll(signed.access_key().as_str(), &quick(2))
        .await
        .expect("poll");
    assert_eq!(record.state, facturero_core::AuthorizationState::InProcess);
    assert_eq!(pending.hits_async().await, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn lookup_reports_not_found() {
    let server = MockServer::start_async().await;
    let _auth = server
        .mock_async(|when, then| {
            when.method(POST).path("/autorizacion");
            then.status(200)
                .header("content-type", "text/xml")
                .body(SIN_COMPROBANTES);
        })
        .await;

    let signed = common::signed_demo_document();
    let client = client_for(&server);
    let record = client
        .lookup(signed.access_key().as_str())
        .await
        .expect("lookup");
    assert_eq!(record.state, facturero_core::AuthorizationState::NotFound);
}

#[tokio::test(flavor = "multi_thread")]
async fn lookup_rejects_malformed_access_keys() {
    let server = MockServer::start_async().await;
    let client = client_for(&server);
    let err = client.lookup("12345").await.expect_err("must fail");
    assert!(matches!(err, SriError::InvalidAccessKey(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelled_pipeline_writes_no_terminal_state() {
    let server = MockServer::start_async().await;
    let _reception = server
        .mock_async(|when, then| {
            when.method(POST).path("/recepcion");
            then.status(200)
                .header("content-type", "text/xml")
                .delay(Duration::from_secs(2))
                .body(RECIBIDA);
        })
        .await;

    let dir = tempfile::tempdir().expect("tempdir");
    let store = DocumentStore::new(dir.path());
    let signed = common::signed_demo_document();
    let client = client_for(&server);

    let cancellation = CancellationToken::new();
    let options = ProcessOptions {
        cancellation: cancellation.clone(),
        ..quick_options()
    };
    cancellation.cancel();

    let err = client
        .process(&signed, &store, &options)
        .await
        .expect_err("must be cancelled");
    assert!(matches!(err, SriError::Cancelled));

    let base = dir.path().join("comprobantes");
    for terminal in ["rechazado", "autorizado", "error"] {
        assert!(!base.join(terminal).exists(), "{terminal} must not exist");
    }
}

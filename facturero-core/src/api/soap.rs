//! SOAP 1.1 envelope building and response parsing for the two SRI
//! services. Responses are queried through `local-name()` so prefix
//! choices on the SRI side never matter.

use super::SriMessage;
use base64ct::{Base64, Encoding};
use libxml::parser::Parser;
use libxml::tree::Node;
use libxml::xpath;
use thiserror::Error;

const SOAP_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";
const RECEPTION_NS: &str = "http://ec.gob.sri.ws.recepcion";
const AUTHORIZATION_NS: &str = "http://ec.gob.sri.ws.autorizacion";

#[derive(Debug, Error)]
pub(crate) enum SoapError {
    #[error("XML parse error: {0}")]
    Xml(String),

    #[error("missing node {0} in SRI response")]
    MissingNode(&'static str),
}

/// `validarComprobante` request with the signed document as the
/// base64Binary `xml` parameter.
pub(crate) fn validar_comprobante_envelope(signed_xml: &str) -> String {
    let encoded = Base64::encode_string(signed_xml.as_bytes());
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><soapenv:Envelope xmlns:soapenv="{SOAP_NS}" xmlns:ec="{RECEPTION_NS}"><soapenv:Header/><soapenv:Body><ec:validarComprobante><xml>{encoded}</xml></ec:validarComprobante></soapenv:Body></soapenv:Envelope>"#
    )
}

/// `autorizacionComprobante` request for one access key.
pub(crate) fn autorizacion_comprobante_envelope(access_key: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><soapenv:Envelope xmlns:soapenv="{SOAP_NS}" xmlns:ec="{AUTHORIZATION_NS}"><soapenv:Header/><soapenv:Body><ec:autorizacionComprobante><claveAccesoComprobante>{access_key}</claveAccesoComprobante></ec:autorizacionComprobante></soapenv:Body></soapenv:Envelope>"#
    )
}

#[derive(Debug)]
pub(crate) struct ParsedReception {
    pub(crate) estado: String,
    pub(crate) messages: Vec<SriMessage>,
}

pub(crate) fn parse_reception(body: &str) -> Result<ParsedReception, SoapError> {
    let doc = Parser::default()
        .parse_string(body)
        .map_err(|e| SoapError::Xml(format!("{e:?}")))?;
    let ctx = context(&doc)?;

    let estado = first_text(
        &ctx,
        "//*[local-name()='RespuestaRecepcionComprobante']/*[local-name()='estado']",
    )
    .ok_or(SoapError::MissingNode("RespuestaRecepcionComprobante/estado"))?;

    Ok(ParsedReception {
        estado,
        messages: collect_messages(&ctx)?,
    })
}

#[derive(Debug, Default)]
pub(crate) struct ParsedAuthorization {
    pub(crate) estado: Option<String>,
    pub(crate) numero_autorizacion: Option<String>,
    pub(crate) fecha_autorizacion: Option<String>,
    pub(crate) comprobante: Option<String>,
    pub(crate) messages: Vec<SriMessage>,
}

pub(crate) fn parse_authorization(body: &str) -> Result<ParsedAuthorization, SoapError> {
    let doc = Parser::default()
        .parse_string(body)
        .map_err(|e| SoapError::Xml(format!("{e:?}")))?;
    let ctx = context(&doc)?;

    if find(&ctx, "//*[local-name()='RespuestaAutorizacionComprobante']")?.is_empty() {
        return Err(SoapError::MissingNode("RespuestaAutorizacionComprobante"));
    }

    let autorizacion = find(&ctx, "//*[local-name()='autorizacion']")?
        .into_iter()
        .next();
    let Some(autorizacion) = autorizacion else {
        return Ok(ParsedAuthorization::default());
    };

    Ok(ParsedAuthorization {
        estado: child_text(&autorizacion, "estado"),
        numero_autorizacion: child_text(&autorizacion, "numeroAutorizacion"),
        fecha_autorizacion: child_text(&autorizacion, "fechaAutorizacion"),
        comprobante: child_text(&autorizacion, "comprobante"),
        messages: collect_messages(&ctx)?,
    })
}

fn context(doc: &libxml::tree::Document) -> Result<xpath::Context, SoapError> {
    xpath::Context::new(doc)
        .map_err(|_| SoapError::Xml("failed to create XPath context".to_string()))
}

fn find(ctx: &xpath::Context, expr: &str) -> Result<Vec<Node>, SoapError> {
    Ok(ctx
        .evaluate(expr)
        .map_err(|_| SoapError::Xml(format!("XPath evaluation failed: {expr}")))?
        .get_nodes_as_vec())
}

fn first_text(ctx: &xpath::Context, expr: &str) -> Option<String> {
    ctx.evaluate(expr)
        .ok()?
        .get_nodes_as_vec()
        .first()
        .map(|node| node.get_content().trim().to_string())
        .filter(|text| !text.is_empty())
}

/// Message containers are themselves named `mensaje` and carry a child
/// named `mensaje`; only elements with an `identificador` child are
/// message records.
fn collect_messages(ctx: &xpath::Context) -> Result<Vec<SriMessage>, SoapError> {
    let nodes = find(
        ctx,
        "//*[local-name()='mensaje'][*[local-name()='identificador']]",
    )?;
    Ok(nodes.iter().map(message_from_node).collect())
}

fn message_from_node(node: &Node) -> SriMessage {
    SriMessage {
        identifier: child_text(node, "identificador").unwrap_or_default(),
        text: child_text(node, "mensaje").unwrap_or_default(),
        additional_info: child_text(node, "informacionAdicional"),
        kind: child_text(node, "tipo"),
    }
}

fn child_text(node: &Node, name: &str) -> Option<String> {
    for child in node.get_child_elements() {
        if child.get_name() == name {
            let text = child.get_content();
            let trimmed = text.trim();
            if trimmed.is_empty() {
                return None;
            }
            return Some(trimmed.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reception_envelope_encodes_document_as_base64() {
        let envelope = validar_comprobante_envelope("<factura/>");
        assert!(envelope.contains("validarComprobante"));
        assert!(envelope.contains(&Base64::encode_string(b"<factura/>")));
        assert!(!envelope.contains("<factura/>"));
    }

    #[test]
    fn parses_devuelta_with_messages() {
        let body = r#"<?xml version="1.0"?>
<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
 <soap:Body>
  <ns2:validarComprobanteResponse xmlns:ns2="http://ec.gob.sri.ws.recepcion">
   <RespuestaRecepcionComprobante>
    <estado>DEVUELTA</estado>
    <comprobantes>
     <comprobante>
      <claveAcceso>0</claveAcceso>
      <mensajes>
       <mensaje>
        <identificador>43</identificador>
        <mensaje>CLAVE ACCESO REGISTRADA</mensaje>
        <informacionAdicional>ya registrada</informacionAdicional>
        <tipo>ERROR</tipo>
       </mensaje>
      </mensajes>
     </comprobante>
    </comprobantes>
   </RespuestaRecepcionComprobante>
  </ns2:validarComprobanteResponse>
 </soap:Body>
</soap:Envelope>"#;
        let parsed = parse_reception(body).expect("parse");
        assert_eq!(parsed.estado, "DEVUELTA");
        assert_eq!(parsed.messages.len(), 1);
        assert_eq!(parsed.messages[0].identifier, "43");
        assert_eq!(parsed.messages[0].text, "CLAVE ACCESO REGISTRADA");
        assert_eq!(parsed.messages[0].kind.as_deref(), Some("ERROR"));
    }

    #[test]
    fn parses_authorization_with_embedded_comprobante() {
        let body = r#"<?xml version="1.0"?>
<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
 <soap:Body>
  <ns2:autorizacionComprobanteResponse xmlns:ns2="http://ec.gob.sri.ws.autorizacion">
   <RespuestaAutorizacionComprobante>
    <claveAccesoConsultada>1</claveAccesoConsultada>
    <numeroComprobantes>1</numeroComprobantes>
    <autorizaciones>
     <autorizacion>
      <estado>AUTORIZADO</estado>
      <numeroAutorizacion>0208202501179214673900110010010000000011234567819</numeroAutorizacion>
      <fechaAutorizacion>2025-08-02T10:00:00-05:00</fechaAutorizacion>
      <ambiente>PRUEBAS</ambiente>
      <comprobante>&lt;factura id="comprobante"&gt;&lt;/factura&gt;</comprobante>
     </autorizacion>
    </autorizaciones>
   </RespuestaAutorizacionComprobante>
  </ns2:autorizacionComprobanteResponse>
 </soap:Body>
</soap:Envelope>"#;
        let parsed = parse_authorization(body).expect("parse");
        assert_eq!(parsed.estado.as_deref(), Some("AUTORIZADO"));
        assert!(parsed
            .numero_autorizacion
            .as_deref()
            .expect("numero")
            .starts_with("0208"));
        assert_eq!(
            parsed.comprobante.as_deref(),
            Some(r#"<factura id="comprobante"></factura>"#)
        );
    }

    #[test]
    fn missing_respuesta_node_is_an_error() {
        let err = parse_authorization("<vacio/>").expect_err("must fail");
        assert!(matches!(err, SoapError::MissingNode(_)));
    }

    #[test]
    fn empty_autorizaciones_yields_default() {
        let body = r#"<RespuestaAutorizacionComprobante>
            <numeroComprobantes>0</numeroComprobantes>
            <autorizaciones/>
        </RespuestaAutorizacionComprobante>"#;
        let parsed = parse_authorization(body).expect("parse");
        assert!(parsed.estado.is_none());
        assert!(parsed.messages.is_empty());
    }
}

//! Enveloped XML-DSIG signing of comprobantes.
//!
//! The SRI pins every algorithm: inclusive C14N (2001 REC), RSA-SHA256
//! and SHA-256 digests, with the enveloped-signature transform first.
//! The reference must resolve the root through its lowercase
//! `id="comprobante"` attribute and the `ds:`-prefixed signature must be
//! the last child of the root.
//!
//! The `xmlns:ds` declaration is added to the root *before* the
//! reference digest is computed: the declaration survives the
//! enveloped-signature transform, so a digest taken without it would
//! never verify.

use crate::access_key::AccessKey;
use crate::credential::Credential;
use base64ct::{Base64, Encoding};
use libxml::parser::Parser;
use libxml::tree::c14n::{CanonicalizationMode, CanonicalizationOptions};
use libxml::tree::{Document, Namespace, Node, SaveOptions};
use libxml::xpath;
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::RsaPublicKey;
use sha2::{Digest, Sha256};
use thiserror::Error;
use x509_cert::der::referenced::OwnedToRef;
use x509_cert::der::Decode;
use x509_cert::Certificate;

pub const DS_NAMESPACE: &str = "http://www.w3.org/2000/09/xmldsig#";
const C14N_ALGORITHM: &str = "http://www.w3.org/TR/2001/REC-xml-c14n-20010315";
const SIGNATURE_ALGORITHM: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256";
const DIGEST_ALGORITHM: &str = "http://www.w3.org/2001/04/xmlenc#sha256";
const ENVELOPED_TRANSFORM: &str = "http://www.w3.org/2000/09/xmldsig#enveloped-signature";

#[derive(Debug, Error)]
pub enum SignError {
    #[error("XML parse error: {0}")]
    InvalidXml(String),

    #[error("document violates the comprobante structure: {0}")]
    SchemaViolation(String),

    #[error("document already carries a signature")]
    AlreadySigned,

    #[error("invalid credential: {0}")]
    InvalidCredential(String),

    #[error("signing backend error: {0}")]
    Signing(String),
}

/// An immutable signed comprobante.
#[derive(Debug, Clone)]
pub struct SignedDocument {
    xml: String,
    access_key: AccessKey,
    root_name: String,
}

impl SignedDocument {
    /// UTF-8 XML bytes, starting with the XML declaration.
    pub fn xml(&self) -> &str {
        &self.xml
    }

    pub fn access_key(&self) -> &AccessKey {
        &self.access_key
    }

    pub fn root_name(&self) -> &str {
        &self.root_name
    }

    pub fn into_xml(self) -> String {
        self.xml
    }

    /// Wrap XML that already carries a signature, e.g. read back from
    /// disk. The bytes are kept untouched; only the embedded access key
    /// and root name are extracted.
    pub fn from_signed_xml(xml: &str) -> Result<SignedDocument, SignError> {
        let doc = Parser::default()
            .parse_string(xml)
            .map_err(|e| SignError::InvalidXml(format!("{e:?}")))?;
        let root = doc
            .get_root_element()
            .ok_or_else(|| SignError::InvalidXml("document has no root element".to_string()))?;
        let ctx = xpath_context(&doc)?;
        if find_nodes(&ctx, "//*[local-name()='Signature']")?.is_empty() {
            return Err(SignError::SchemaViolation(
                "document carries no signature".to_string(),
            ));
        }
        let access_key = embedded_access_key(&ctx)?;
        Ok(SignedDocument {
            xml: xml.to_string(),
            access_key,
            root_name: root.get_name(),
        })
    }
}

/// Signs comprobante XML with a loaded [`Credential`]. The credential
/// is borrowed for the duration of one signing call.
pub struct XmlSigner<'a> {
    credential: &'a Credential,
}

impl<'a> XmlSigner<'a> {
    pub fn new(credential: &'a Credential) -> XmlSigner<'a> {
        XmlSigner { credential }
    }

    /// Envelope-sign `xml`. Signing already-signed input is an error.
    pub fn sign(&self, xml: &str) -> Result<SignedDocument, SignError> {
        self.credential
            .check_validity()
            .map_err(|e| SignError::InvalidCredential(e.to_string()))?;

        let doc = Parser::default()
            .parse_string(xml)
            .map_err(|e| SignError::InvalidXml(format!("{e:?}")))?;
        let mut root = doc
            .get_root_element()
            .ok_or_else(|| SignError::InvalidXml("document has no root element".to_string()))?;

        let ctx = xpath_context(&doc)?;
        if !find_nodes(&ctx, "//*[local-name()='Signature']")?.is_empty() {
            return Err(SignError::AlreadySigned);
        }

        normalize_id_attribute(&mut root)?;
        if root.get_name() == "factura"
            && find_nodes(&ctx, "/*/*[local-name()='detalles']")?.is_empty()
        {
            return Err(SignError::SchemaViolation(
                "factura has no <detalles> element".to_string(),
            ));
        }

        let access_key = embedded_access_key(&ctx)?;
        let root_name = root.get_name();
        let ds_ns = declare_ds_namespace(&mut root)?;

        // Reference digest over the whole document. The signature is not
        // inserted yet, which is exactly what the enveloped-signature
        // transform produces on verification.
        let canonical = doc
            .canonicalize(inclusive_c14n(), None)
            .map_err(|_| SignError::Signing("document canonicalization failed".to_string()))?;
        let digest_value = Base64::encode_string(&Sha256::digest(canonical.as_bytes()));

        let mut signature_value = self.append_signature(&mut root, &ds_ns, &digest_value)?;
        let canonical_signed_info = canonical_signed_info(&digest_value)?;

        let signing_key = SigningKey::<Sha256>::new(self.credential.private_key().clone());
        let signature: Signature = signing_key.sign(canonical_signed_info.as_bytes());
        let signature_b64 = Base64::encode_string(&signature.to_vec());
        signature_value
            .set_content(&signature_b64)
            .map_err(|e| SignError::Signing(format!("failed to set SignatureValue: {e}")))?;

        let options = SaveOptions {
            no_empty_tags: true,
            ..Default::default()
        };
        Ok(SignedDocument {
            xml: doc.to_string_with_options(options),
            access_key,
            root_name,
        })
    }

    /// Build the `ds:Signature` subtree and append it as the last child
    /// of the root. Returns the still-empty `ds:SignatureValue` node.
    fn append_signature(
        &self,
        root: &mut Node,
        ds_ns: &Namespace,
        digest_value: &str,
    ) -> Result<Node, SignError> {
        let ns = || Some(ds_ns.clone());

        let mut signature = child(root, ds_ns, "Signature")?;
        let mut signed_info = child(&mut signature, ds_ns, "SignedInfo")?;

        let mut c14n_method = child(&mut signed_info, ds_ns, "CanonicalizationMethod")?;
        set_attribute(&mut c14n_method, "Algorithm", C14N_ALGORITHM)?;
        let mut signature_method = child(&mut signed_info, ds_ns, "SignatureMethod")?;
        set_attribute(&mut signature_method, "Algorithm", SIGNATURE_ALGORITHM)?;

        let mut reference = child(&mut signed_info, ds_ns, "Reference")?;
        set_attribute(&mut reference, "URI", "#comprobante")?;
        let mut transforms = child(&mut reference, ds_ns, "Transforms")?;
        let mut enveloped = child(&mut transforms, ds_ns, "Transform")?;
        set_attribute(&mut enveloped, "Algorithm", ENVELOPED_TRANSFORM)?;
        let mut c14n_transform = child(&mut transforms, ds_ns, "Transform")?;
        set_attribute(&mut c14n_transform, "Algorithm", C14N_ALGORITHM)?;
        let mut digest_method = child(&mut reference, ds_ns, "DigestMethod")?;
        set_attribute(&mut digest_method, "Algorithm", DIGEST_ALGORITHM)?;
        reference
            .add_text_child(ns(), "DigestValue", digest_value)
            .map_err(|e| SignError::Signing(format!("failed to add DigestValue: {e}")))?;

        let signature_value = child(&mut signature, ds_ns, "SignatureValue")?;

        let mut key_info = child(&mut signature, ds_ns, "KeyInfo")?;
        let mut x509_data = child(&mut key_info, ds_ns, "X509Data")?;
        x509_data
            .add_text_child(ns(), "X509Certificate", self.credential.certificate_base64())
            .map_err(|e| SignError::Signing(format!("failed to add X509Certificate: {e}")))?;

        Ok(signature_value)
    }
}

/// Verify the enveloped signature of a signed comprobante: the
/// `SignedInfo` signature against the embedded certificate and the
/// reference digest against the document with the signature removed.
pub fn verify_signature(xml: &str) -> Result<bool, SignError> {
    let doc = Parser::default()
        .parse_string(xml)
        .map_err(|e| SignError::InvalidXml(format!("{e:?}")))?;
    let ctx = xpath_context(&doc)?;

    if find_nodes(&ctx, "//*[local-name()='SignedInfo']")?.is_empty() {
        return Ok(false);
    }
    // A SignedInfo with foreign algorithms is not this profile; it can
    // never have been produced here and is rejected outright.
    if !pinned_profile_matches(&ctx)? {
        return Ok(false);
    }

    let digest_b64 = match node_text(
        &ctx,
        "//*[local-name()='Reference']/*[local-name()='DigestValue']",
    )? {
        Some(text) => text,
        None => return Ok(false),
    };
    let canonical_signed_info = canonical_signed_info(digest_b64.trim())?;

    let signature_b64 = match node_text(&ctx, "//*[local-name()='SignatureValue']")? {
        Some(text) => text,
        None => return Ok(false),
    };
    let certificate_b64 = match node_text(&ctx, "//*[local-name()='X509Certificate']")? {
        Some(text) => text,
        None => return Ok(false),
    };

    let signature_bytes = decode_base64(&signature_b64)?;
    let certificate_der = decode_base64(&certificate_b64)?;
    let certificate = Certificate::from_der(&certificate_der)
        .map_err(|e| SignError::InvalidCredential(e.to_string()))?;
    let public_key = RsaPublicKey::try_from(
        certificate
            .tbs_certificate
            .subject_public_key_info
            .owned_to_ref(),
    )
    .map_err(|e| SignError::InvalidCredential(e.to_string()))?;

    let signature = match Signature::try_from(signature_bytes.as_slice()) {
        Ok(signature) => signature,
        Err(_) => return Ok(false),
    };
    let verifying_key = VerifyingKey::<Sha256>::new(public_key);
    if verifying_key
        .verify(canonical_signed_info.as_bytes(), &signature)
        .is_err()
    {
        return Ok(false);
    }

    // Reference digest: canonicalize a copy with the signature removed.
    let stripped = doc
        .dup()
        .map_err(|_| SignError::Signing("failed to duplicate document".to_string()))?;
    let strip_ctx = xpath_context(&stripped)?;
    for mut node in find_nodes(&strip_ctx, "//*[local-name()='Signature']")? {
        node.unlink();
    }
    let canonical = stripped
        .canonicalize(inclusive_c14n(), None)
        .map_err(|_| SignError::Signing("document canonicalization failed".to_string()))?;
    let digest = Base64::encode_string(&Sha256::digest(canonical.as_bytes()));

    Ok(digest == digest_b64.trim())
}

fn inclusive_c14n() -> CanonicalizationOptions {
    CanonicalizationOptions {
        mode: CanonicalizationMode::Canonical1_0,
        with_comments: false,
        inclusive_ns_prefixes: vec![],
    }
}

/// Canonical bytes of the SignedInfo this profile emits, with only the
/// reference digest varying. Built as a standalone document and run
/// through document-level C14N; inside the signed comprobante the only
/// namespace in scope at SignedInfo is `ds`, so the standalone form is
/// byte-identical to the enveloped one.
fn canonical_signed_info(digest_value: &str) -> Result<String, SignError> {
    let xml = format!(
        concat!(
            r#"<ds:SignedInfo xmlns:ds="{ns}">"#,
            r#"<ds:CanonicalizationMethod Algorithm="{c14n}"></ds:CanonicalizationMethod>"#,
            r#"<ds:SignatureMethod Algorithm="{sig}"></ds:SignatureMethod>"#,
            r##"<ds:Reference URI="#comprobante">"##,
            r#"<ds:Transforms>"#,
            r#"<ds:Transform Algorithm="{env}"></ds:Transform>"#,
            r#"<ds:Transform Algorithm="{c14n}"></ds:Transform>"#,
            r#"</ds:Transforms>"#,
            r#"<ds:DigestMethod Algorithm="{dig}"></ds:DigestMethod>"#,
            r#"<ds:DigestValue>{value}</ds:DigestValue>"#,
            r#"</ds:Reference>"#,
            r#"</ds:SignedInfo>"#,
        ),
        ns = DS_NAMESPACE,
        c14n = C14N_ALGORITHM,
        sig = SIGNATURE_ALGORITHM,
        env = ENVELOPED_TRANSFORM,
        dig = DIGEST_ALGORITHM,
        value = digest_value,
    );
    let doc = Parser::default()
        .parse_string(&xml)
        .map_err(|e| SignError::Signing(format!("invalid SignedInfo template: {e:?}")))?;
    doc.canonicalize(inclusive_c14n(), None)
        .map_err(|_| SignError::Signing("SignedInfo canonicalization failed".to_string()))
}

/// Whether the document's SignedInfo carries exactly the pinned
/// algorithms: inclusive C14N, rsa-sha256, xmlenc#sha256 and the
/// enveloped-signature transform followed by C14N, referencing
/// `#comprobante`.
fn pinned_profile_matches(ctx: &xpath::Context) -> Result<bool, SignError> {
    let attr = |expr: &str| -> Result<Option<String>, SignError> { node_text(ctx, expr) };

    let c14n = attr("//*[local-name()='SignedInfo']/*[local-name()='CanonicalizationMethod']/@Algorithm")?;
    let signature = attr("//*[local-name()='SignedInfo']/*[local-name()='SignatureMethod']/@Algorithm")?;
    let reference_uri = attr("//*[local-name()='SignedInfo']/*[local-name()='Reference']/@URI")?;
    let digest = attr("//*[local-name()='Reference']/*[local-name()='DigestMethod']/@Algorithm")?;
    let transforms: Vec<String> = find_nodes(
        ctx,
        "//*[local-name()='Reference']/*[local-name()='Transforms']/*[local-name()='Transform']/@Algorithm",
    )?
    .iter()
    .map(|node| node.get_content())
    .collect();

    Ok(c14n.as_deref() == Some(C14N_ALGORITHM)
        && signature.as_deref() == Some(SIGNATURE_ALGORITHM)
        && reference_uri.as_deref() == Some("#comprobante")
        && digest.as_deref() == Some(DIGEST_ALGORITHM)
        && transforms == [ENVELOPED_TRANSFORM, C14N_ALGORITHM])
}

/// Exactly one lowercase `id` may survive; `Id`/`ID` duplicates break
/// the SRI reference resolution and are dropped before digesting.
fn normalize_id_attribute(root: &mut Node) -> Result<(), SignError> {
    for duplicate in ["Id", "ID"] {
        if root.get_attribute(duplicate).is_some() {
            root.remove_attribute(duplicate)
                .map_err(|e| SignError::Signing(format!("failed to drop {duplicate}: {e}")))?;
        }
    }
    match root.get_attribute("id").as_deref() {
        Some("comprobante") => Ok(()),
        Some(other) => Err(SignError::SchemaViolation(format!(
            "root id attribute is {other:?}, expected \"comprobante\""
        ))),
        None => Err(SignError::SchemaViolation(
            "root element has no id=\"comprobante\" attribute".to_string(),
        )),
    }
}

fn declare_ds_namespace(root: &mut Node) -> Result<Namespace, SignError> {
    let existing = root
        .get_namespace_declarations()
        .into_iter()
        .find(|ns| ns.get_prefix() == "ds");
    match existing {
        Some(ns) if ns.get_href() == DS_NAMESPACE => Ok(ns),
        Some(ns) => Err(SignError::SchemaViolation(format!(
            "prefix ds is bound to foreign namespace {}",
            ns.get_href()
        ))),
        None => Namespace::new("ds", DS_NAMESPACE, root)
            .map_err(|e| SignError::Signing(format!("failed to declare ds namespace: {e}"))),
    }
}

fn embedded_access_key(ctx: &xpath::Context) -> Result<AccessKey, SignError> {
    let text = node_text(ctx, "//*[local-name()='claveAcceso']")?.ok_or_else(|| {
        SignError::SchemaViolation("document has no <claveAcceso> element".to_string())
    })?;
    AccessKey::parse(text.trim())
        .map_err(|e| SignError::SchemaViolation(format!("invalid claveAcceso: {e}")))
}

fn xpath_context(doc: &Document) -> Result<xpath::Context, SignError> {
    xpath::Context::new(doc)
        .map_err(|_| SignError::Signing("failed to create XPath context".to_string()))
}

fn find_nodes(ctx: &xpath::Context, expr: &str) -> Result<Vec<Node>, SignError> {
    Ok(ctx
        .evaluate(expr)
        .map_err(|_| SignError::Signing(format!("XPath evaluation failed: {expr}")))?
        .get_nodes_as_vec())
}

fn node_text(ctx: &xpath::Context, expr: &str) -> Result<Option<String>, SignError> {
    let nodes = find_nodes(ctx, expr)?;
    Ok(nodes.first().map(|node| node.get_content()))
}

fn child(parent: &mut Node, ns: &Namespace, name: &str) -> Result<Node, SignError> {
    parent
        .new_child(Some(ns.clone()), name)
        .map_err(|e| SignError::Signing(format!("failed to create element {name}: {e}")))
}

fn set_attribute(node: &mut Node, name: &str, value: &str) -> Result<(), SignError> {
    node.set_attribute(name, value)
        .map_err(|e| SignError::Signing(format!("failed to set attribute {name}: {e}")))
}

fn decode_base64(text: &str) -> Result<Vec<u8>, SignError> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    Base64::decode_vec(&compact).map_err(|e| SignError::Signing(format!("invalid base64: {e}")))
}

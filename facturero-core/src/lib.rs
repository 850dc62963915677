//! Tax-compliance protocol engine for Ecuadorian electronic invoicing
//! (SRI). Generates the 49-digit clave de acceso, renders the factura
//! v1.1.0 XML, envelope-signs it with a PKCS#12 credential, submits it
//! to the SRI reception service and polls authorization until a
//! terminal state, persisting every observed state on disk.

pub mod access_key;
pub mod api;
mod clock;
pub mod config;
pub mod credential;
pub mod invoice;
pub mod logging;
pub mod sign;
pub mod store;

use thiserror::Error;

pub use access_key::{check_digit, AccessKey, AccessKeyError, AccessKeyFields, DocumentType};
pub use api::{
    AuthorizationRecord, AuthorizationState, DocumentState, FinalResult, ProcessOptions,
    ReceptionResult, ReceptionState, RetryPolicy, SriClient, SriError, SriMessage,
};
pub use config::{
    CertificateConfig, CertificateSource, ConfigError, EmissionType, EmitterConfig, Environment,
    EnvironmentParseError,
};
pub use credential::{Credential, CredentialError};
pub use invoice::xml::{factura_xml, InvoiceXmlError};
pub use invoice::{
    AdditionalField, Buyer, BuyerIdType, Emitter, Invoice, InvoiceBuilder, InvoiceError, LineItem,
    LineTax, Payment,
};
pub use logging::{LoggingError, LoggingOptions};
pub use sign::{verify_signature, SignError, SignedDocument, XmlSigner};
pub use store::{DocumentStore, StoreError};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    AccessKey(#[from] access_key::AccessKeyError),
    #[error(transparent)]
    Invoice(#[from] invoice::InvoiceError),
    #[error(transparent)]
    Xml(#[from] invoice::xml::InvoiceXmlError),
    #[error(transparent)]
    Credential(#[from] credential::CredentialError),
    #[error(transparent)]
    Sign(#[from] sign::SignError),
    #[error(transparent)]
    Sri(#[from] api::SriError),
    #[error(transparent)]
    Store(#[from] store::StoreError),
    #[error(transparent)]
    Logging(#[from] logging::LoggingError),
}

// Central SDK version
pub const FACTURERO_VERSION: &str = "0.1.0";

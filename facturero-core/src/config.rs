//! SRI environment selection and emitter configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// SRI environment. `1` is the certification (test) environment, `2` is
/// production. Any other value is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Environment {
    Test,
    Production,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvironmentParseError {
    #[error("invalid SRI environment: {input} (expected 1 or 2)")]
    Invalid { input: String },
}

impl FromStr for Environment {
    type Err = EnvironmentParseError;

    fn from_str(env: &str) -> Result<Environment, EnvironmentParseError> {
        match env.trim() {
            "1" => Ok(Environment::Test),
            "2" => Ok(Environment::Production),
            _ => Err(EnvironmentParseError::Invalid {
                input: env.to_string(),
            }),
        }
    }
}

impl Environment {
    /// Single-digit code embedded in the access key and the XML.
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Test => "1",
            Environment::Production => "2",
        }
    }

    pub fn reception_url(&self) -> &'static str {
        match self {
            Environment::Test => {
                "https://celcer.sri.gob.ec/comprobantes-electronicos-ws/RecepcionComprobantesOffline?wsdl"
            }
            Environment::Production => {
                "https://cel.sri.gob.ec/comprobantes-electronicos-ws/RecepcionComprobantesOffline?wsdl"
            }
        }
    }

    pub fn authorization_url(&self) -> &'static str {
        match self {
            Environment::Test => {
                "https://celcer.sri.gob.ec/comprobantes-electronicos-ws/AutorizacionComprobantesOffline?wsdl"
            }
            Environment::Production => {
                "https://cel.sri.gob.ec/comprobantes-electronicos-ws/AutorizacionComprobantesOffline?wsdl"
            }
        }
    }
}

/// Emission modality. Only normal emission ("1") is supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EmissionType {
    #[default]
    Normal,
}

impl EmissionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmissionType::Normal => "1",
        }
    }
}

/// Errors reading the configuration surface from the environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing environment variable {variable}")]
    Missing { variable: &'static str },

    #[error("invalid value for {variable}: {value}")]
    Invalid { variable: &'static str, value: String },
}

/// Taxpayer identity stamped on every comprobante, read from the
/// `EMPRESA_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmitterConfig {
    pub ruc: String,
    pub legal_name: String,
    pub trade_name: String,
    pub main_address: String,
    pub establishment_address: Option<String>,
    pub establishment_code: String,
    pub emission_point: String,
    pub keeps_accounting: bool,
}

impl EmitterConfig {
    /// Read the emitter identity from the process environment.
    pub fn from_env() -> Result<EmitterConfig, ConfigError> {
        let ruc = required("EMPRESA_RUC")?;
        if ruc.len() != 13 || !all_digits(&ruc) {
            return Err(ConfigError::Invalid {
                variable: "EMPRESA_RUC",
                value: ruc,
            });
        }

        let establishment_code = required("EMPRESA_CODIGO_ESTABLECIMIENTO")?;
        let emission_point = required("EMPRESA_PUNTO_EMISION")?;
        for (variable, value) in [
            ("EMPRESA_CODIGO_ESTABLECIMIENTO", &establishment_code),
            ("EMPRESA_PUNTO_EMISION", &emission_point),
        ] {
            if value.len() != 3 || !all_digits(value) {
                return Err(ConfigError::Invalid {
                    variable,
                    value: value.clone(),
                });
            }
        }

        let keeps_accounting = match required("EMPRESA_OBLIGADO_CONTABILIDAD")?.as_str() {
            "SI" => true,
            "NO" => false,
            other => {
                return Err(ConfigError::Invalid {
                    variable: "EMPRESA_OBLIGADO_CONTABILIDAD",
                    value: other.to_string(),
                })
            }
        };

        Ok(EmitterConfig {
            ruc,
            legal_name: required("EMPRESA_RAZON_SOCIAL")?,
            trade_name: required("EMPRESA_NOMBRE_COMERCIAL")?,
            main_address: required("EMPRESA_DIRECCION_MATRIZ")?,
            establishment_address: optional("EMPRESA_DIRECCION_ESTABLECIMIENTO"),
            establishment_code,
            emission_point,
            keeps_accounting,
        })
    }

    /// Six-digit serie: establishment code followed by emission point.
    pub fn serie(&self) -> String {
        format!("{}{}", self.establishment_code, self.emission_point)
    }
}

/// Where the signing PKCS#12 comes from. A base64 blob in
/// `CERT_P12_BASE64` takes precedence over `CERTIFICADO_PATH`.
#[derive(Debug, Clone)]
pub enum CertificateSource {
    File(PathBuf),
    Base64(String),
}

/// Certificate configuration: the PKCS#12 source plus its passphrase.
#[derive(Debug, Clone)]
pub struct CertificateConfig {
    pub source: CertificateSource,
    pub passphrase: String,
}

impl CertificateConfig {
    pub fn from_env() -> Result<CertificateConfig, ConfigError> {
        let source = if let Some(blob) = optional("CERT_P12_BASE64") {
            CertificateSource::Base64(blob)
        } else {
            CertificateSource::File(PathBuf::from(required("CERTIFICADO_PATH")?))
        };
        Ok(CertificateConfig {
            source,
            passphrase: required("CERTIFICADO_CLAVE")?,
        })
    }
}

/// Read `SRI_AMBIENTE` from the process environment.
pub fn environment_from_env() -> Result<Environment, ConfigError> {
    let value = required("SRI_AMBIENTE")?;
    value.parse().map_err(|_| ConfigError::Invalid {
        variable: "SRI_AMBIENTE",
        value,
    })
}

fn required(variable: &'static str) -> Result<String, ConfigError> {
    optional(variable).ok_or(ConfigError::Missing { variable })
}

fn optional(variable: &'static str) -> Option<String> {
    match std::env::var(variable) {
        Ok(value) if !value.trim().is_empty() => Some(value.trim().to_string()),
        _ => None,
    }
}

fn all_digits(value: &str) -> bool {
    !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_parses_codes() {
        assert_eq!("1".parse::<Environment>().unwrap(), Environment::Test);
        assert_eq!("2".parse::<Environment>().unwrap(), Environment::Production);
        assert!("3".parse::<Environment>().is_err());
        assert!("pruebas".parse::<Environment>().is_err());
    }

    #[test]
    fn environment_urls_split_by_host() {
        assert!(Environment::Test.reception_url().contains("celcer."));
        assert!(Environment::Production.reception_url().contains("//cel."));
        assert!(Environment::Test
            .authorization_url()
            .contains("AutorizacionComprobantesOffline"));
    }
}

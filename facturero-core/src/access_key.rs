//! 49-digit clave de acceso: layout assembly and the SRI módulo-11
//! check digit.
//!
//! The check digit multiplies the 48 base digits, left to right, by the
//! coefficient vector `[2,3,4,5,6,7]` repeated. With `r = 11 - (sum % 11)`
//! the SRI mandates the mapping `11 -> 0` and `10 -> 1`; generic MOD-11
//! implementations that fold both to `0` produce keys the SRI rejects.

use crate::config::{EmissionType, Environment};
use chrono::NaiveDate;
use rand::Rng;
use std::fmt;
use thiserror::Error;

const COEFFICIENTS: [u32; 6] = [2, 3, 4, 5, 6, 7];

/// Document type embedded in the access key.
///
/// Only the factura body is rendered by this crate; credit notes share
/// key generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentType {
    Factura,
    CreditNote,
}

impl DocumentType {
    pub fn code(&self) -> &'static str {
        match self {
            DocumentType::Factura => "01",
            DocumentType::CreditNote => "04",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccessKeyError {
    #[error("field {field} has invalid width: {value:?} (expected {expected} digits)")]
    InvalidWidth {
        field: &'static str,
        value: String,
        expected: usize,
    },

    #[error("field {field} is not numeric: {value:?}")]
    NotNumeric { field: &'static str, value: String },

    #[error("assembled base is not 48 digits: {0:?}")]
    InvalidBase(String),

    #[error("check digit mismatch in key: {0:?}")]
    CheckDigitMismatch(String),
}

/// Inputs for [`AccessKey::generate`].
#[derive(Debug, Clone)]
pub struct AccessKeyFields<'a> {
    /// Emission date; formatted `DDMMYYYY` inside the key.
    pub date: NaiveDate,
    pub document_type: DocumentType,
    /// 13-digit emitter RUC.
    pub ruc: &'a str,
    pub environment: Environment,
    /// Six digits: establishment code plus emission point.
    pub serie: &'a str,
    /// Up to nine digits; left-padded with zeros.
    pub sequential: &'a str,
    /// Eight random digits. `None` draws them from the thread RNG;
    /// tests inject a fixed value.
    pub numeric_code: Option<&'a str>,
    pub emission_type: EmissionType,
}

/// A validated 49-digit clave de acceso.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AccessKey(String);

impl AccessKey {
    /// Assemble and check-digit a new access key.
    pub fn generate(fields: AccessKeyFields<'_>) -> Result<AccessKey, AccessKeyError> {
        let ruc = digits_exact("ruc", fields.ruc, 13)?;
        let serie = digits_exact("serie", fields.serie, 6)?;
        let sequential = left_pad("secuencial", fields.sequential, 9)?;
        let numeric_code = match fields.numeric_code {
            Some(code) => digits_exact("codigoNumerico", code, 8)?,
            None => format!("{:08}", rand::thread_rng().gen_range(0..100_000_000u32)),
        };

        let base = format!(
            "{}{}{}{}{}{}{}{}",
            fields.date.format("%d%m%Y"),
            fields.document_type.code(),
            ruc,
            fields.environment.as_str(),
            serie,
            sequential,
            numeric_code,
            fields.emission_type.as_str(),
        );
        let digit = check_digit(&base)?;
        Ok(AccessKey(format!("{base}{digit}")))
    }

    /// Parse an externally supplied key, verifying width, digits and the
    /// check digit.
    pub fn parse(key: &str) -> Result<AccessKey, AccessKeyError> {
        if key.len() != 49 || !key.bytes().all(|b| b.is_ascii_digit()) {
            return Err(AccessKeyError::InvalidWidth {
                field: "claveAcceso",
                value: key.to_string(),
                expected: 49,
            });
        }
        let (base, digit) = key.split_at(48);
        if check_digit(base)?.to_string() != digit {
            return Err(AccessKeyError::CheckDigitMismatch(key.to_string()));
        }
        Ok(AccessKey(key.to_string()))
    }

    /// Whether `key` is a well-formed, self-consistent access key.
    pub fn validate(key: &str) -> bool {
        AccessKey::parse(key).is_ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The 48-digit base without the check digit.
    pub fn base(&self) -> &str {
        &self.0[..48]
    }
}

impl fmt::Display for AccessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Módulo-11 check digit over a 48-digit base.
pub fn check_digit(base: &str) -> Result<u32, AccessKeyError> {
    if base.len() != 48 || !base.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AccessKeyError::InvalidBase(base.to_string()));
    }
    let sum: u32 = base
        .bytes()
        .enumerate()
        .map(|(i, b)| u32::from(b - b'0') * COEFFICIENTS[i % COEFFICIENTS.len()])
        .sum();
    Ok(match 11 - (sum % 11) {
        11 => 0,
        10 => 1,
        r => r,
    })
}

fn digits_exact(
    field: &'static str,
    value: &str,
    expected: usize,
) -> Result<String, AccessKeyError> {
    if !value.bytes().all(|b| b.is_ascii_digit()) || value.is_empty() {
        return Err(AccessKeyError::NotNumeric {
            field,
            value: value.to_string(),
        });
    }
    if value.len() != expected {
        return Err(AccessKeyError::InvalidWidth {
            field,
            value: value.to_string(),
            expected,
        });
    }
    Ok(value.to_string())
}

fn left_pad(field: &'static str, value: &str, width: usize) -> Result<String, AccessKeyError> {
    if !value.bytes().all(|b| b.is_ascii_digit()) || value.is_empty() {
        return Err(AccessKeyError::NotNumeric {
            field,
            value: value.to_string(),
        });
    }
    if value.len() > width {
        return Err(AccessKeyError::InvalidWidth {
            field,
            value: value.to_string(),
            expected: width,
        });
    }
    Ok(format!("{value:0>width$}"))
}

//! Normalized invoice model: the input a caller assembles before the
//! factura XML is rendered.

mod builder;
pub mod xml;

pub use builder::InvoiceBuilder;

use crate::config::{EmissionType, Environment};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Fixed SRI currency literal.
pub const CURRENCY: &str = "DOLAR";

/// Default payment method code (cash).
pub const DEFAULT_PAYMENT_METHOD: &str = "01";

/// How far a caller-supplied line total may drift from the derived
/// `cantidad * precioUnitario - descuento` before it is rejected.
pub const LINE_TOTAL_TOLERANCE: f64 = 0.01;

#[derive(Debug, Error)]
pub enum InvoiceError {
    #[error("invoice must have at least one line item")]
    MissingLineItems,

    #[error("establishment and main addresses are both empty")]
    MissingAddress,

    #[error("invalid value for {field}: {value}")]
    InvalidField { field: &'static str, value: String },

    #[error(
        "declared line total {declared:.2} differs from derived {derived:.2} by more than one cent"
    )]
    InconsistentLineTotal { declared: f64, derived: f64 },
}

/// Buyer identification type, as coded by the SRI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuyerIdType {
    Ruc,
    Cedula,
    Passport,
    FinalConsumer,
}

impl BuyerIdType {
    pub fn code(&self) -> &'static str {
        match self {
            BuyerIdType::Ruc => "04",
            BuyerIdType::Cedula => "05",
            BuyerIdType::Passport => "06",
            BuyerIdType::FinalConsumer => "07",
        }
    }

    pub fn from_code(code: &str) -> Option<BuyerIdType> {
        match code {
            "04" => Some(BuyerIdType::Ruc),
            "05" => Some(BuyerIdType::Cedula),
            "06" => Some(BuyerIdType::Passport),
            "07" => Some(BuyerIdType::FinalConsumer),
            _ => None,
        }
    }
}

/// Emitter identity stamped into `infoTributaria` / `infoFactura`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Emitter {
    pub ruc: String,
    pub legal_name: String,
    pub trade_name: String,
    pub main_address: String,
    pub establishment_address: Option<String>,
    pub establishment_code: String,
    pub emission_point: String,
    pub keeps_accounting: bool,
}

impl Emitter {
    pub fn serie(&self) -> String {
        format!("{}{}", self.establishment_code, self.emission_point)
    }
}

impl From<crate::config::EmitterConfig> for Emitter {
    fn from(config: crate::config::EmitterConfig) -> Self {
        Emitter {
            ruc: config.ruc,
            legal_name: config.legal_name,
            trade_name: config.trade_name,
            main_address: config.main_address,
            establishment_address: config.establishment_address,
            establishment_code: config.establishment_code,
            emission_point: config.emission_point,
            keeps_accounting: config.keeps_accounting,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Buyer {
    pub id_type: BuyerIdType,
    pub identification: String,
    pub legal_name: String,
    pub address: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

impl Buyer {
    /// The anonymous "CONSUMIDOR FINAL" buyer.
    pub fn final_consumer() -> Buyer {
        Buyer {
            id_type: BuyerIdType::FinalConsumer,
            identification: "9999999999999".to_string(),
            legal_name: "CONSUMIDOR FINAL".to_string(),
            address: None,
            email: None,
            phone: None,
        }
    }
}

/// Per-line tax as supplied by the caller. `tarifa` and
/// `taxable_base` are derived when absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineTax {
    /// Tax code; `2` is IVA.
    pub code: String,
    /// Percentage code; drives the tarifa derivation.
    pub percentage_code: String,
    pub tarifa: Option<f64>,
    pub taxable_base: Option<f64>,
    pub amount: f64,
}

/// One invoice line as supplied by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub main_code: String,
    pub description: String,
    pub quantity: f64,
    pub unit_price: f64,
    #[serde(default)]
    pub discount: f64,
    /// Optional caller-stored total; validated against the derived
    /// value within one cent.
    pub total_without_tax: Option<f64>,
    pub tax: LineTax,
}

/// A line after derivation: the total is always computed and the tax
/// carries an explicit tarifa and base.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputedLine {
    pub main_code: String,
    pub description: String,
    pub quantity: f64,
    pub unit_price: f64,
    pub discount: f64,
    pub total_without_tax: f64,
    pub tax: ComputedLineTax,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputedLineTax {
    pub code: String,
    pub percentage_code: String,
    pub tarifa: f64,
    pub taxable_base: f64,
    pub amount: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub method: String,
    pub total: f64,
}

/// Free-form `campoAdicional` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdditionalField {
    pub name: String,
    pub value: String,
}

/// IVA tarifa for a percentage code when the caller did not supply one.
pub fn tarifa_for(percentage_code: &str) -> f64 {
    match percentage_code {
        "2" => 12.0,
        "3" => 14.0,
        "8" => 15.0,
        _ => 0.0,
    }
}

/// Aggregated tax bucket for `totalConImpuestos`, keyed by
/// `(codigo, codigoPorcentaje)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxTotal {
    pub code: String,
    pub percentage_code: String,
    pub taxable_base: f64,
    pub amount: f64,
}

/// Derived invoice totals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceTotals {
    pub total_without_taxes: f64,
    pub total_discount: f64,
    pub tax_totals: Vec<TaxTotal>,
    pub tip: f64,
    pub grand_total: f64,
}

impl InvoiceTotals {
    /// Aggregate line data. Buckets are ordered by key so the rendered
    /// XML is deterministic.
    pub(crate) fn from_lines(lines: &[ComputedLine], tip: f64) -> InvoiceTotals {
        let total_without_taxes: f64 = lines.iter().map(|l| l.total_without_tax).sum();
        let total_discount: f64 = lines.iter().map(|l| l.discount).sum();

        let mut buckets: BTreeMap<(String, String), (f64, f64)> = BTreeMap::new();
        for line in lines {
            let entry = buckets
                .entry((line.tax.code.clone(), line.tax.percentage_code.clone()))
                .or_insert((0.0, 0.0));
            entry.0 += line.tax.taxable_base;
            entry.1 += line.tax.amount;
        }
        let tax_totals = buckets
            .into_iter()
            .map(|((code, percentage_code), (taxable_base, amount))| TaxTotal {
                code,
                percentage_code,
                taxable_base,
                amount,
            })
            .collect::<Vec<_>>();

        let tax_amount: f64 = tax_totals.iter().map(|t| t.amount).sum();
        InvoiceTotals {
            total_without_taxes,
            total_discount,
            tax_totals,
            tip,
            grand_total: total_without_taxes + tax_amount + tip,
        }
    }
}

/// A fully validated invoice, ready for XML rendering. Produced by
/// [`InvoiceBuilder::build`]; totals and line derivations are already
/// resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub emitter: Emitter,
    pub environment: Environment,
    pub emission_type: EmissionType,
    /// Nine digits, zero-padded.
    pub sequential: String,
    /// Emission date in Ecuador local time, never in the future.
    pub emission_date: NaiveDate,
    /// Resolved establishment address (falls back to the main address).
    pub establishment_address: String,
    pub buyer: Buyer,
    pub lines: Vec<ComputedLine>,
    pub payments: Vec<Payment>,
    pub tip: f64,
    pub additional_fields: Vec<AdditionalField>,
    pub totals: InvoiceTotals,
}

impl Invoice {
    pub fn serie(&self) -> String {
        self.emitter.serie()
    }

    /// Generate the access key for this invoice. `numeric_code` injects
    /// the eight random digits; `None` draws them from the RNG.
    pub fn access_key(
        &self,
        numeric_code: Option<&str>,
    ) -> Result<crate::access_key::AccessKey, crate::access_key::AccessKeyError> {
        let serie = self.serie();
        crate::access_key::AccessKey::generate(crate::access_key::AccessKeyFields {
            date: self.emission_date,
            document_type: crate::access_key::DocumentType::Factura,
            ruc: &self.emitter.ruc,
            environment: self.environment,
            serie: &serie,
            sequential: &self.sequential,
            numeric_code,
            emission_type: self.emission_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(base: f64, amount: f64, percentage_code: &str) -> ComputedLine {
        ComputedLine {
            main_code: "P1".into(),
            description: "item".into(),
            quantity: 1.0,
            unit_price: base,
            discount: 0.0,
            total_without_tax: base,
            tax: ComputedLineTax {
                code: "2".into(),
                percentage_code: percentage_code.into(),
                tarifa: tarifa_for(percentage_code),
                taxable_base: base,
                amount,
            },
        }
    }

    #[test]
    fn totals_group_by_code_and_percentage() {
        let lines = vec![line(10.0, 1.2, "2"), line(5.0, 0.6, "2"), line(3.0, 0.0, "0")];
        let totals = InvoiceTotals::from_lines(&lines, 0.0);

        assert_eq!(totals.tax_totals.len(), 2);
        let iva = totals
            .tax_totals
            .iter()
            .find(|t| t.percentage_code == "2")
            .expect("iva bucket");
        assert!((iva.taxable_base - 15.0).abs() < 1e-9);
        assert!((iva.amount - 1.8).abs() < 1e-9);
        assert!((totals.grand_total - 19.8).abs() < 1e-9);
    }

    #[test]
    fn tarifa_derivation_table() {
        assert_eq!(tarifa_for("2"), 12.0);
        assert_eq!(tarifa_for("3"), 14.0);
        assert_eq!(tarifa_for("8"), 15.0);
        assert_eq!(tarifa_for("0"), 0.0);
        assert_eq!(tarifa_for("6"), 0.0);
    }
}

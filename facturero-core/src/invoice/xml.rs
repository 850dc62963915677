//! Factura v1.1.0 XML rendering.
//!
//! Element names and ordering follow the SRI XSD, which is a `sequence`:
//! `infoTributaria`, `infoFactura`, `detalles`, then an optional
//! `infoAdicional`. Output is compact and byte-deterministic for a given
//! invoice and access key, which the enveloped signature depends on.

use super::{AdditionalField, ComputedLine, Invoice, Payment, TaxTotal};
use crate::access_key::AccessKey;
use quick_xml::se::{SeError, Serializer as QuickXmlSerializer};
use serde::ser::{Serialize, SerializeStruct, Serializer};
use thiserror::Error;

/// Factura document type code inside `infoTributaria`.
const COD_DOC_FACTURA: &str = "01";

#[derive(Debug, Error)]
pub enum InvoiceXmlError {
    #[error("failed to serialize factura to XML: {source}")]
    Serialize {
        #[from]
        source: SeError,
    },
}

/// Render the factura for `invoice` with `key` embedded in
/// `<claveAcceso>`.
pub fn factura_xml(invoice: &Invoice, key: &AccessKey) -> Result<String, InvoiceXmlError> {
    let mut buffer = String::with_capacity(4096);
    buffer.push_str(r#"<?xml version="1.0" encoding="UTF-8"?>"#);

    {
        let serializer = QuickXmlSerializer::new(&mut buffer);
        FacturaXml { invoice, key }.serialize(serializer)?;
    }

    Ok(buffer)
}

mod helpers {
    use serde::ser::{Serialize, Serializer};
    use std::fmt::{self, Display, Formatter};

    /// Fixed-precision decimal with half-away-from-zero rounding.
    pub(super) struct FixedPrecision {
        value: f64,
        precision: usize,
    }

    impl FixedPrecision {
        pub(super) fn new(value: f64, precision: usize) -> Self {
            Self { value, precision }
        }
    }

    impl Display for FixedPrecision {
        fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
            let factor = 10f64.powi(self.precision as i32);
            let rounded = (self.value * factor).round() / factor;
            write!(f, "{:.*}", self.precision, rounded)
        }
    }

    impl Serialize for FixedPrecision {
        fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            serializer.collect_str(self)
        }
    }

    /// Two-decimal monetary value.
    pub(super) fn money(value: f64) -> FixedPrecision {
        FixedPrecision::new(value, 2)
    }

    /// Text with SRI sanitization applied: C0 controls other than tab,
    /// newline and carriage return are dropped, as are the XML-1.0
    /// illegal code points. Entity escaping is the serializer's job.
    pub(super) struct SanitizedText<'a>(pub(super) &'a str);

    impl Display for SanitizedText<'_> {
        fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
            for ch in self.0.chars() {
                if is_xml_legal(ch) {
                    f.write_fmt(format_args!("{ch}"))?;
                }
            }
            Ok(())
        }
    }

    impl Serialize for SanitizedText<'_> {
        fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            serializer.collect_str(self)
        }
    }

    fn is_xml_legal(ch: char) -> bool {
        match ch {
            '\t' | '\n' | '\r' => true,
            '\u{0000}'..='\u{001F}' => false,
            '\u{FFFE}' | '\u{FFFF}' => false,
            _ => true,
        }
    }
}

use helpers::{money, SanitizedText};

struct FacturaXml<'a> {
    invoice: &'a Invoice,
    key: &'a AccessKey,
}

impl Serialize for FacturaXml<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut root = serializer.serialize_struct("factura", 0)?;
        root.serialize_field("@id", "comprobante")?;
        root.serialize_field("@version", "1.1.0")?;
        root.serialize_field(
            "infoTributaria",
            &InfoTributariaXml {
                invoice: self.invoice,
                key: self.key,
            },
        )?;
        root.serialize_field("infoFactura", &InfoFacturaXml(self.invoice))?;
        root.serialize_field("detalles", &DetallesXml(&self.invoice.lines))?;

        let extra = additional_fields(self.invoice);
        if !extra.is_empty() {
            root.serialize_field("infoAdicional", &InfoAdicionalXml(&extra))?;
        }
        root.end()
    }
}

/// Buyer contact data has no slot in `infoFactura`; it travels as
/// `campoAdicional` entries alongside the caller-supplied ones.
fn additional_fields(invoice: &Invoice) -> Vec<AdditionalField> {
    let mut fields = invoice.additional_fields.clone();
    if let Some(email) = invoice.buyer.email.as_deref() {
        fields.push(AdditionalField {
            name: "Email".to_string(),
            value: email.to_string(),
        });
    }
    if let Some(phone) = invoice.buyer.phone.as_deref() {
        fields.push(AdditionalField {
            name: "Telefono".to_string(),
            value: phone.to_string(),
        });
    }
    fields
}

struct InfoTributariaXml<'a> {
    invoice: &'a Invoice,
    key: &'a AccessKey,
}

impl Serialize for InfoTributariaXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let emitter = &self.invoice.emitter;
        let mut st = s.serialize_struct("infoTributaria", 0)?;
        st.serialize_field("ambiente", self.invoice.environment.as_str())?;
        st.serialize_field("tipoEmision", self.invoice.emission_type.as_str())?;
        st.serialize_field("razonSocial", &SanitizedText(&emitter.legal_name))?;
        st.serialize_field("nombreComercial", &SanitizedText(&emitter.trade_name))?;
        st.serialize_field("ruc", &emitter.ruc)?;
        st.serialize_field("claveAcceso", self.key.as_str())?;
        st.serialize_field("codDoc", COD_DOC_FACTURA)?;
        st.serialize_field("estab", &emitter.establishment_code)?;
        st.serialize_field("ptoEmi", &emitter.emission_point)?;
        st.serialize_field("secuencial", &self.invoice.sequential)?;
        st.serialize_field("dirMatriz", &SanitizedText(&emitter.main_address))?;
        st.end()
    }
}

struct InfoFacturaXml<'a>(&'a Invoice);

impl Serialize for InfoFacturaXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let invoice = self.0;
        let totals = &invoice.totals;
        let mut st = s.serialize_struct("infoFactura", 0)?;
        st.serialize_field(
            "fechaEmision",
            &invoice.emission_date.format("%d/%m/%Y").to_string(),
        )?;
        st.serialize_field(
            "dirEstablecimiento",
            &SanitizedText(&invoice.establishment_address),
        )?;
        st.serialize_field(
            "obligadoContabilidad",
            if invoice.emitter.keeps_accounting {
                "SI"
            } else {
                "NO"
            },
        )?;
        st.serialize_field(
            "tipoIdentificacionComprador",
            invoice.buyer.id_type.code(),
        )?;
        st.serialize_field(
            "razonSocialComprador",
            &SanitizedText(&invoice.buyer.legal_name),
        )?;
        st.serialize_field("identificacionComprador", &invoice.buyer.identification)?;
        if let Some(address) = invoice.buyer.address.as_deref() {
            if !address.trim().is_empty() {
                st.serialize_field("direccionComprador", &SanitizedText(address))?;
            }
        }
        st.serialize_field("totalSinImpuestos", &money(totals.total_without_taxes))?;
        st.serialize_field("totalDescuento", &money(totals.total_discount))?;
        st.serialize_field("totalConImpuestos", &TotalConImpuestosXml(&totals.tax_totals))?;
        st.serialize_field("propina", &money(totals.tip))?;
        st.serialize_field("importeTotal", &money(totals.grand_total))?;
        st.serialize_field("moneda", super::CURRENCY)?;
        st.serialize_field("pagos", &PagosXml(&invoice.payments))?;
        st.end()
    }
}

struct TotalConImpuestosXml<'a>(&'a [TaxTotal]);

impl Serialize for TotalConImpuestosXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("totalConImpuestos", 0)?;
        for total in self.0 {
            st.serialize_field("totalImpuesto", &TotalImpuestoXml(total))?;
        }
        st.end()
    }
}

struct TotalImpuestoXml<'a>(&'a TaxTotal);

impl Serialize for TotalImpuestoXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let total = self.0;
        let mut st = s.serialize_struct("totalImpuesto", 0)?;
        st.serialize_field("codigo", &total.code)?;
        st.serialize_field("codigoPorcentaje", &total.percentage_code)?;
        st.serialize_field("baseImponible", &money(total.taxable_base))?;
        st.serialize_field("valor", &money(total.amount))?;
        st.end()
    }
}

struct PagosXml<'a>(&'a [Payment]);

impl Serialize for PagosXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("pagos", 0)?;
        for payment in self.0 {
            st.serialize_field("pago", &PagoXml(payment))?;
        }
        st.end()
    }
}

struct PagoXml<'a>(&'a Payment);

impl Serialize for PagoXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("pago", 0)?;
        st.serialize_field("formaPago", &self.0.method)?;
        st.serialize_field("total", &money(self.0.total))?;
        st.end()
    }
}

struct DetallesXml<'a>(&'a [ComputedLine]);

impl Serialize for DetallesXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("detalles", 0)?;
        for line in self.0 {
            st.serialize_field("detalle", &DetalleXml(line))?;
        }
        st.end()
    }
}

struct DetalleXml<'a>(&'a ComputedLine);

impl Serialize for DetalleXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let line = self.0;
        let mut st = s.serialize_struct("detalle", 0)?;
        st.serialize_field("codigoPrincipal", &SanitizedText(&line.main_code))?;
        st.serialize_field("descripcion", &SanitizedText(&line.description))?;
        st.serialize_field("cantidad", &money(line.quantity))?;
        st.serialize_field("precioUnitario", &money(line.unit_price))?;
        st.serialize_field("descuento", &money(line.discount))?;
        st.serialize_field("precioTotalSinImpuesto", &money(line.total_without_tax))?;
        st.serialize_field("impuestos", &ImpuestosXml(line))?;
        st.end()
    }
}

struct ImpuestosXml<'a>(&'a ComputedLine);

impl Serialize for ImpuestosXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("impuestos", 0)?;
        st.serialize_field("impuesto", &ImpuestoXml(self.0))?;
        st.end()
    }
}

struct ImpuestoXml<'a>(&'a ComputedLine);

impl Serialize for ImpuestoXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let tax = &self.0.tax;
        let mut st = s.serialize_struct("impuesto", 0)?;
        st.serialize_field("codigo", &tax.code)?;
        st.serialize_field("codigoPorcentaje", &tax.percentage_code)?;
        st.serialize_field("tarifa", &money(tax.tarifa))?;
        st.serialize_field("baseImponible", &money(tax.taxable_base))?;
        st.serialize_field("valor", &money(tax.amount))?;
        st.end()
    }
}

struct InfoAdicionalXml<'a>(&'a [AdditionalField]);

impl Serialize for InfoAdicionalXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("infoAdicional", 0)?;
        for field in self.0 {
            st.serialize_field("campoAdicional", &CampoAdicionalXml(field))?;
        }
        st.end()
    }
}

struct CampoAdicionalXml<'a>(&'a AdditionalField);

impl Serialize for CampoAdicionalXml<'_> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct("campoAdicional", 2)?;
        st.serialize_field("@nombre", &SanitizedText(&self.0.name).to_string())?;
        st.serialize_field("$text", &SanitizedText(&self.0.value))?;
        st.end()
    }
}

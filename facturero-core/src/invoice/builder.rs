use super::{
    AdditionalField, Buyer, ComputedLine, ComputedLineTax, Emitter, Invoice, InvoiceError,
    InvoiceTotals, LineItem, Payment, tarifa_for, DEFAULT_PAYMENT_METHOD, LINE_TOTAL_TOLERANCE,
};
use crate::clock;
use crate::config::{EmissionType, Environment};
use chrono::{Duration, NaiveDate};
use tracing::warn;

/// Builds a validated [`Invoice`] from the normalized sale record.
///
/// Validation and derivation happen in [`build`](InvoiceBuilder::build):
/// line totals, tarifa resolution, tax aggregation, address fallback,
/// payment synthesis and the emission-date clamp.
pub struct InvoiceBuilder {
    emitter: Emitter,
    environment: Environment,
    emission_type: EmissionType,
    sequential: String,
    emission_date: NaiveDate,
    buyer: Buyer,
    lines: Vec<LineItem>,
    payments: Vec<Payment>,
    tip: f64,
    additional_fields: Vec<AdditionalField>,
    clock_tolerance: Duration,
}

impl InvoiceBuilder {
    pub fn new(
        emitter: Emitter,
        environment: Environment,
        sequential: impl Into<String>,
        emission_date: NaiveDate,
        buyer: Buyer,
        lines: Vec<LineItem>,
    ) -> Self {
        Self {
            emitter,
            environment,
            emission_type: EmissionType::Normal,
            sequential: sequential.into(),
            emission_date,
            buyer,
            lines,
            payments: Vec::new(),
            tip: 0.0,
            additional_fields: Vec::new(),
            clock_tolerance: Duration::minutes(5),
        }
    }

    pub fn payment(mut self, payment: Payment) -> Self {
        self.payments.push(payment);
        self
    }

    pub fn tip(mut self, tip: f64) -> Self {
        self.tip = tip;
        self
    }

    pub fn additional_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.additional_fields.push(AdditionalField {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    /// Skew allowed before a caller-supplied date counts as "future".
    pub fn clock_tolerance(mut self, tolerance: Duration) -> Self {
        self.clock_tolerance = tolerance;
        self
    }

    pub fn build(self) -> Result<Invoice, InvoiceError> {
        if self.lines.is_empty() {
            return Err(InvoiceError::MissingLineItems);
        }

        let sequential = normalize_sequential(&self.sequential)?;
        let establishment_address = resolve_address(&self.emitter)?;
        let emission_date = clamp_emission_date(self.emission_date, self.clock_tolerance);

        let lines = self
            .lines
            .into_iter()
            .map(compute_line)
            .collect::<Result<Vec<_>, _>>()?;

        if self.tip < 0.0 {
            return Err(InvoiceError::InvalidField {
                field: "propina",
                value: format!("{:.2}", self.tip),
            });
        }

        let totals = InvoiceTotals::from_lines(&lines, self.tip);
        let payments = if self.payments.is_empty() {
            vec![Payment {
                method: DEFAULT_PAYMENT_METHOD.to_string(),
                total: totals.grand_total,
            }]
        } else {
            self.payments
        };

        Ok(Invoice {
            emitter: self.emitter,
            environment: self.environment,
            emission_type: self.emission_type,
            sequential,
            emission_date,
            establishment_address,
            buyer: self.buyer,
            lines,
            payments,
            tip: self.tip,
            additional_fields: self.additional_fields,
            totals,
        })
    }
}

fn normalize_sequential(sequential: &str) -> Result<String, InvoiceError> {
    let trimmed = sequential.trim();
    if trimmed.is_empty()
        || trimmed.len() > 9
        || !trimmed.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(InvoiceError::InvalidField {
            field: "secuencial",
            value: sequential.to_string(),
        });
    }
    Ok(format!("{trimmed:0>9}"))
}

/// `dirEstablecimiento` has `minLength=1` in the XSD; blank values fall
/// back to the main address and fail when both are blank.
fn resolve_address(emitter: &Emitter) -> Result<String, InvoiceError> {
    let establishment = emitter
        .establishment_address
        .as_deref()
        .map(str::trim)
        .filter(|a| !a.is_empty());
    match establishment {
        Some(address) => Ok(address.to_string()),
        None => {
            let main = emitter.main_address.trim();
            if main.is_empty() {
                return Err(InvoiceError::MissingAddress);
            }
            Ok(main.to_string())
        }
    }
}

fn clamp_emission_date(date: NaiveDate, tolerance: Duration) -> NaiveDate {
    let threshold = (clock::now_in_ecuador() + tolerance).date_naive();
    if date > threshold {
        let today = clock::today_in_ecuador();
        warn!(
            supplied = %date,
            clamped_to = %today,
            "emission date is in the future; clamping to today in Ecuador"
        );
        today
    } else {
        date
    }
}

fn compute_line(line: LineItem) -> Result<ComputedLine, InvoiceError> {
    if line.quantity <= 0.0 {
        return Err(InvoiceError::InvalidField {
            field: "cantidad",
            value: format!("{}", line.quantity),
        });
    }
    if line.unit_price < 0.0 || line.discount < 0.0 {
        return Err(InvoiceError::InvalidField {
            field: "precioUnitario/descuento",
            value: format!("{}/{}", line.unit_price, line.discount),
        });
    }

    let derived = line.quantity * line.unit_price - line.discount;
    if let Some(declared) = line.total_without_tax {
        if (declared - derived).abs() > LINE_TOTAL_TOLERANCE + f64::EPSILON {
            return Err(InvoiceError::InconsistentLineTotal { declared, derived });
        }
    }

    let tarifa = line
        .tax
        .tarifa
        .unwrap_or_else(|| tarifa_for(&line.tax.percentage_code));
    let taxable_base = line.tax.taxable_base.unwrap_or(derived);

    Ok(ComputedLine {
        main_code: line.main_code,
        description: line.description,
        quantity: line.quantity,
        unit_price: line.unit_price,
        discount: line.discount,
        total_without_tax: derived,
        tax: ComputedLineTax {
            code: line.tax.code,
            percentage_code: line.tax.percentage_code,
            tarifa,
            taxable_base,
            amount: line.tax.amount,
        },
    })
}

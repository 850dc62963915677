use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use facturero_core::{
    config, factura_xml, verify_signature, AccessKey, Buyer, CertificateConfig, Credential,
    DocumentStore, EmitterConfig, InvoiceBuilder, LineItem, LoggingOptions, Payment,
    ProcessOptions, SriClient, XmlSigner,
};
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "facturero")]
#[command(about = "SRI (Ecuador) electronic invoicing CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate an access key for a sequential.
    Clave {
        #[arg(long)]
        secuencial: String,
        /// Emission date (YYYY-MM-DD); defaults to today in Ecuador.
        #[arg(long)]
        fecha: Option<NaiveDate>,
        /// Inject the eight-digit numeric code instead of drawing it.
        #[arg(long)]
        codigo_numerico: Option<String>,
    },
    /// Render the factura XML for a sale record.
    Factura {
        /// JSON sale record (see SaleInput).
        #[arg(long)]
        venta: PathBuf,
        #[arg(long)]
        salida: Option<PathBuf>,
    },
    /// Sign a comprobante XML with the configured PKCS#12.
    Firmar {
        #[arg(long)]
        comprobante: PathBuf,
        #[arg(long)]
        salida: Option<PathBuf>,
    },
    /// Verify the enveloped signature of a signed comprobante.
    Verificar {
        #[arg(long)]
        comprobante: PathBuf,
    },
    /// Submit a signed comprobante and poll authorization.
    Procesar {
        #[arg(long)]
        comprobante: PathBuf,
        /// Base directory for comprobantes/<estado>/ artifacts.
        #[arg(long, default_value = ".")]
        directorio: PathBuf,
    },
    /// Query the authorization state for an access key.
    Consultar {
        #[arg(long)]
        clave: String,
    },
}

/// JSON input for `factura`: the normalized sale a POS adapter emits.
#[derive(Debug, Deserialize)]
struct SaleInput {
    secuencial: String,
    fecha: NaiveDate,
    comprador: Buyer,
    items: Vec<LineItem>,
    #[serde(default)]
    pagos: Vec<Payment>,
    #[serde(default)]
    propina: f64,
    codigo_numerico: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    facturero_core::logging::init(LoggingOptions::default())
        .context("failed to initialize logging")?;

    let cli = Cli::parse();
    match cli.command {
        Commands::Clave {
            secuencial,
            fecha,
            codigo_numerico,
        } => {
            let emitter = EmitterConfig::from_env()?;
            let environment = config::environment_from_env()?;
            let date = fecha.unwrap_or_else(today_in_ecuador);
            let serie = emitter.serie();
            let key = AccessKey::generate(facturero_core::AccessKeyFields {
                date,
                document_type: facturero_core::DocumentType::Factura,
                ruc: &emitter.ruc,
                environment,
                serie: &serie,
                sequential: &secuencial,
                numeric_code: codigo_numerico.as_deref(),
                emission_type: facturero_core::EmissionType::Normal,
            })?;
            println!("{key}");
        }
        Commands::Factura { venta, salida } => {
            let emitter = EmitterConfig::from_env()?;
            let environment = config::environment_from_env()?;
            let raw = std::fs::read_to_string(&venta)
                .with_context(|| format!("failed to read {}", venta.display()))?;
            let sale: SaleInput = serde_json::from_str(&raw)
                .with_context(|| format!("invalid sale record in {}", venta.display()))?;

            let mut builder = InvoiceBuilder::new(
                emitter.into(),
                environment,
                sale.secuencial,
                sale.fecha,
                sale.comprador,
                sale.items,
            )
            .tip(sale.propina);
            for payment in sale.pagos {
                builder = builder.payment(payment);
            }
            let invoice = builder.build()?;
            let key = invoice.access_key(sale.codigo_numerico.as_deref())?;
            let xml = factura_xml(&invoice, &key)?;
            write_output(salida, &xml)?;
        }
        Commands::Firmar {
            comprobante,
            salida,
        } => {
            let cert = CertificateConfig::from_env()?;
            let credential = Credential::load(&cert.source, &cert.passphrase)?;
            let xml = std::fs::read_to_string(&comprobante)
                .with_context(|| format!("failed to read {}", comprobante.display()))?;
            let signed = XmlSigner::new(&credential).sign(&xml)?;
            write_output(salida, signed.xml())?;
        }
        Commands::Verificar { comprobante } => {
            let xml = std::fs::read_to_string(&comprobante)
                .with_context(|| format!("failed to read {}", comprobante.display()))?;
            if verify_signature(&xml)? {
                println!("FIRMA VALIDA");
            } else {
                bail!("FIRMA INVALIDA");
            }
        }
        Commands::Procesar {
            comprobante,
            directorio,
        } => {
            let environment = config::environment_from_env()?;
            let xml = std::fs::read_to_string(&comprobante)
                .with_context(|| format!("failed to read {}", comprobante.display()))?;
            let cert = CertificateConfig::from_env();
            let signed = match cert {
                // already-signed input is passed through untouched
                _ if xml.contains("ds:Signature") => wrap_signed(&xml)?,
                Ok(cert) => {
                    let credential = Credential::load(&cert.source, &cert.passphrase)?;
                    XmlSigner::new(&credential).sign(&xml)?
                }
                Err(error) => return Err(error.into()),
            };

            let client = SriClient::new(environment)?;
            let store = DocumentStore::new(directorio);
            let result = client
                .process(&signed, &store, &ProcessOptions::default())
                .await?;

            println!("estado: {}", result.state.as_str());
            if let Some(numero) = result.authorization_number.as_deref() {
                println!("numeroAutorizacion: {numero}");
            }
            for message in &result.messages {
                println!("[{}] {}", message.identifier, message.text);
            }
            if !result.success {
                if let Some(failure) = result.failure.as_deref() {
                    eprintln!("{failure}");
                }
                std::process::exit(1);
            }
        }
        Commands::Consultar { clave } => {
            let environment = config::environment_from_env()?;
            let client = SriClient::new(environment)?;
            let record = client.lookup(&clave).await?;
            println!("estado: {:?}", record.state);
            if let Some(numero) = record.authorization_number.as_deref() {
                println!("numeroAutorizacion: {numero}");
            }
            for message in &record.messages {
                println!("[{}] {}", message.identifier, message.text);
            }
        }
    }

    Ok(())
}

/// Wrap an already-signed document without touching its bytes.
fn wrap_signed(xml: &str) -> Result<facturero_core::SignedDocument> {
    facturero_core::SignedDocument::from_signed_xml(xml).map_err(Into::into)
}

fn write_output(target: Option<PathBuf>, contents: &str) -> Result<()> {
    match target {
        Some(path) => std::fs::write(&path, contents)
            .with_context(|| format!("failed to write {}", path.display())),
        None => {
            println!("{contents}");
            Ok(())
        }
    }
}

fn today_in_ecuador() -> NaiveDate {
    use chrono::{FixedOffset, Utc};
    let offset = FixedOffset::west_opt(5 * 3600).expect("static offset");
    Utc::now().with_timezone(&offset).date_naive()
}

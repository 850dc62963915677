use chrono::NaiveDate;
use facturero_core::invoice::{LineItem, LineTax};
use facturero_core::{
    Buyer, Credential, Emitter, Environment, Invoice, InvoiceBuilder, SignedDocument, XmlSigner,
};
use rsa::pkcs8::EncodePrivateKey;
use rsa::RsaPrivateKey;
use sha2::Sha256;
use std::str::FromStr;
use std::time::Duration;
use x509_cert::builder::{Builder, CertificateBuilder, Profile};
use x509_cert::der::Encode;
use x509_cert::name::Name;
use x509_cert::serial_number::SerialNumber;
use x509_cert::spki::SubjectPublicKeyInfoOwned;
use x509_cert::time::Validity;

#[allow(dead_code)]
pub fn demo_emitter() -> Emitter {
    Emitter {
        ruc: "0918097783001".into(),
        legal_name: "COMERCIAL DEMO S.A.".into(),
        trade_name: "DEMO".into(),
        main_address: "Av. 9 de Octubre 100 y Malecon".into(),
        establishment_address: Some("C.C. Norte local 12".into()),
        establishment_code: "001".into(),
        emission_point: "001".into(),
        keeps_accounting: false,
    }
}

/// Final-consumer factura with one 10.00 item taxed at IVA 12%.
#[allow(dead_code)]
pub fn demo_invoice() -> Invoice {
    let buyer = Buyer {
        id_type: facturero_core::BuyerIdType::FinalConsumer,
        identification: "9999999999".into(),
        legal_name: "CONSUMIDOR FINAL".into(),
        address: None,
        email: None,
        phone: None,
    };
    InvoiceBuilder::new(
        demo_emitter(),
        Environment::Test,
        "1",
        NaiveDate::from_ymd_opt(2025, 8, 7).expect("valid date"),
        buyer,
        vec![LineItem {
            main_code: "P001".into(),
            description: "Producto demo".into(),
            quantity: 1.0,
            unit_price: 10.0,
            discount: 0.0,
            total_without_tax: None,
            tax: LineTax {
                code: "2".into(),
                percentage_code: "2".into(),
                tarifa: None,
                taxable_base: Some(10.0),
                amount: 1.2,
            },
        }],
    )
    .build()
    .expect("build demo invoice")
}

/// Generate an RSA key and a self-signed end-entity certificate whose
/// key usage asserts digitalSignature + nonRepudiation and whose
/// subject serialNumber carries the RUC.
#[allow(dead_code)]
pub fn test_signing_material() -> (RsaPrivateKey, Vec<u8>, Vec<u8>) {
    let private_key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).expect("rsa key");
    let key_der = private_key
        .to_pkcs8_der()
        .expect("key der")
        .as_bytes()
        .to_vec();
    let cert_der = build_test_cert(&private_key);
    (private_key, key_der, cert_der)
}

#[allow(dead_code)]
pub fn build_test_cert(private_key: &RsaPrivateKey) -> Vec<u8> {
    let signing_key = rsa::pkcs1v15::SigningKey::<Sha256>::new(private_key.clone());
    let serial_number = SerialNumber::new(&[1]).expect("serial");
    let validity = Validity::from_now(Duration::from_secs(3600)).expect("validity");
    let subject = Name::from_str(
        "CN=FIRMANTE DEMO,serialNumber=0918097783001,O=Facturero,C=EC",
    )
    .expect("subject");
    let issuer = subject.clone();
    let spki = SubjectPublicKeyInfoOwned::from_key(private_key.to_public_key()).expect("spki");

    let builder = CertificateBuilder::new(
        Profile::Leaf {
            issuer,
            enable_key_agreement: false,
            enable_key_encipherment: false,
        },
        serial_number,
        validity,
        subject,
        spki,
        &signing_key,
    )
    .expect("certificate builder");
    let certificate = builder
        .build::<rsa::pkcs1v15::Signature>()
        .expect("certificate");
    certificate.to_der().expect("cert der")
}

#[allow(dead_code)]
pub fn demo_credential() -> Credential {
    let (_key, key_der, cert_der) = test_signing_material();
    Credential::from_der(&cert_der, &key_der).expect("credential")
}

#[allow(dead_code)]
pub fn signed_demo_document() -> SignedDocument {
    let invoice = demo_invoice();
    let key = invoice
        .access_key(Some("12345678"))
        .expect("access key");
    let xml = facturero_core::factura_xml(&invoice, &key).expect("factura xml");
    let credential = demo_credential();
    XmlSigner::new(&credential).sign(&xml).expect("sign")
}

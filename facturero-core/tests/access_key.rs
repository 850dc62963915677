use chrono::NaiveDate;
use facturero_core::{check_digit, AccessKey, AccessKeyFields, DocumentType, Environment};

fn base_with_prefix(prefix: &str) -> String {
    format!("{prefix}{}", "0".repeat(48 - prefix.len()))
}

#[test]
fn check_digit_residue_zero_maps_to_zero() {
    // all zeros: sum = 0, 11 - 0 = 11 -> 0
    let base = base_with_prefix("");
    assert_eq!(check_digit(&base).expect("digit"), 0);
}

#[test]
fn check_digit_residue_one_maps_to_one() {
    // first digit 6 with coefficient 2: sum = 12, 12 % 11 = 1, r = 10 -> 1
    let base = base_with_prefix("6");
    assert_eq!(check_digit(&base).expect("digit"), 1);
}

#[test]
fn check_digit_residue_five_maps_to_six() {
    // first digit 8 with coefficient 2: sum = 16, 16 % 11 = 5, r = 6
    let base = base_with_prefix("8");
    assert_eq!(check_digit(&base).expect("digit"), 6);
}

#[test]
fn check_digit_rejects_short_base() {
    assert!(check_digit("123").is_err());
    assert!(check_digit(&"x".repeat(48)).is_err());
}

#[test]
fn generates_documented_layout() {
    let key = AccessKey::generate(AccessKeyFields {
        date: NaiveDate::from_ymd_opt(2025, 8, 7).expect("date"),
        document_type: DocumentType::Factura,
        ruc: "0918097783001",
        environment: Environment::Test,
        serie: "001001",
        sequential: "1",
        numeric_code: Some("12345678"),
        emission_type: facturero_core::EmissionType::Normal,
    })
    .expect("generate");

    assert_eq!(
        key.base(),
        "070820250109180977830011001001000000001123456781"
    );
    assert_eq!(key.as_str().len(), 49);
    let expected_digit = check_digit(key.base()).expect("digit");
    assert!(key.as_str().ends_with(&expected_digit.to_string()));
}

#[test]
fn generated_keys_validate_against_themselves() {
    for sequential in ["1", "42", "999999999"] {
        let key = AccessKey::generate(AccessKeyFields {
            date: NaiveDate::from_ymd_opt(2024, 12, 31).expect("date"),
            document_type: DocumentType::Factura,
            ruc: "1790012345001",
            environment: Environment::Production,
            serie: "002010",
            sequential,
            numeric_code: None,
            emission_type: facturero_core::EmissionType::Normal,
        })
        .expect("generate");
        assert!(AccessKey::validate(key.as_str()), "key {key} must validate");
        assert_eq!(key.as_str().len(), 49);
        assert!(key.as_str().bytes().all(|b| b.is_ascii_digit()));
    }
}

#[test]
fn credit_note_key_uses_doc_type_04() {
    let key = AccessKey::generate(AccessKeyFields {
        date: NaiveDate::from_ymd_opt(2025, 8, 7).expect("date"),
        document_type: DocumentType::CreditNote,
        ruc: "0918097783001",
        environment: Environment::Test,
        serie: "001001",
        sequential: "77",
        numeric_code: Some("00000001"),
        emission_type: facturero_core::EmissionType::Normal,
    })
    .expect("generate");
    assert_eq!(&key.base()[8..10], "04");
}

#[test]
fn tampered_key_fails_validation() {
    let key = AccessKey::generate(AccessKeyFields {
        date: NaiveDate::from_ymd_opt(2025, 8, 7).expect("date"),
        document_type: DocumentType::Factura,
        ruc: "0918097783001",
        environment: Environment::Test,
        serie: "001001",
        sequential: "1",
        numeric_code: Some("12345678"),
        emission_type: facturero_core::EmissionType::Normal,
    })
    .expect("generate");

    let mut tampered = key.as_str().to_string();
    // flip one digit in the RUC region
    let original = tampered.as_bytes()[12];
    let replacement = if original == b'9' { '0' } else { '9' };
    tampered.replace_range(12..13, &replacement.to_string());
    assert!(!AccessKey::validate(&tampered));
}

#[test]
fn field_width_violations_are_rejected() {
    let fields = |ruc: &'static str, serie: &'static str, sequential: &'static str| {
        AccessKeyFields {
            date: NaiveDate::from_ymd_opt(2025, 8, 7).expect("date"),
            document_type: DocumentType::Factura,
            ruc,
            environment: Environment::Test,
            serie,
            sequential,
            numeric_code: Some("12345678"),
            emission_type: facturero_core::EmissionType::Normal,
        }
    };

    assert!(AccessKey::generate(fields("123", "001001", "1")).is_err());
    assert!(AccessKey::generate(fields("0918097783001", "0010", "1")).is_err());
    assert!(AccessKey::generate(fields("0918097783001", "001001", "1234567890")).is_err());
    assert!(AccessKey::parse("123").is_err());
    assert!(!AccessKey::validate("not-a-key"));
}

//! Trust designation resolution.

use warden::trust::{accepted_values, resolve, TrustError, TrustMode};

#[test]
fn legacy_direct_aliases_resolve_to_direct() {
    for alias in ["trusted", "full", "vault"] {
        assert_eq!(resolve(alias), Ok(TrustMode::Direct), "alias {alias}");
    }
}

#[test]
fn untrusted_resolves_to_sandboxed() {
    assert_eq!(resolve("untrusted"), Ok(TrustMode::Sandboxed));
}

#[test]
fn canonical_values_resolve_case_insensitively() {
    assert_eq!(resolve("Direct"), Ok(TrustMode::Direct));
    assert_eq!(resolve("  SANDBOXED "), Ok(TrustMode::Sandboxed));
}

#[test]
fn unknown_value_lists_every_accepted_value() {
    let err = resolve("root").expect_err("unknown value must be rejected");
    assert!(matches!(err, TrustError::InvalidTrustValue { ref value } if value == "root"));
    let message = err.to_string();
    for accepted in accepted_values() {
        assert!(message.contains(accepted), "message should list {accepted}: {message}");
    }
}

#[test]
fn empty_value_is_rejected() {
    assert!(resolve("").is_err());
}

#[test]
fn trust_mode_deserializes_from_aliases() {
    let mode: TrustMode = serde_json::from_str("\"full\"").expect("alias should deserialize");
    assert_eq!(mode, TrustMode::Direct);
    assert!(serde_json::from_str::<TrustMode>("\"maybe\"").is_err());
    assert_eq!(
        serde_json::to_string(&TrustMode::Sandboxed).expect("serialize"),
        "\"sandboxed\""
    );
}

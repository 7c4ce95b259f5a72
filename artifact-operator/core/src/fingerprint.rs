use serde_json::Value;
use sha2::{Digest, Sha256};

/// Number of hex characters of a SHA-256 digest that make up a policy
/// fingerprint. The truncated digest is stored in the `policy-checksum` label,
/// so both sides of a comparison must use the same length.
pub const FINGERPRINT_LEN: usize = 48;

/// Truncated SHA-256 over raw bytes. Used as the fallback fingerprint for
/// manifests without a `spec` subtree.
pub fn fingerprint_bytes(data: &[u8]) -> String {
    let mut digest = hex::encode(Sha256::digest(data));
    digest.truncate(FINGERPRINT_LEN);
    digest
}

/// Fingerprint of a manifest's `spec` subtree.
///
/// The subtree is rendered as canonical JSON before hashing: object keys in
/// lexicographic order, no insignificant whitespace. `serde_json` maps are
/// backed by a `BTreeMap`, so a compact serialization meets both requirements.
pub fn spec_fingerprint(spec: &Value) -> String {
    let canonical = serde_json::to_vec(spec).expect("JSON values always serialize");
    fingerprint_bytes(&canonical)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fingerprint_is_truncated_hex() {
        let fp = fingerprint_bytes(b"policy");
        assert_eq!(fp.len(), FINGERPRINT_LEN);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn key_order_does_not_affect_spec_fingerprint() {
        // Two YAML spellings of the same object, keys in different order.
        let a: Value = serde_yaml::from_str("rules:\n- name: r1\nbackground: true").unwrap();
        let b: Value = serde_yaml::from_str("background: true\nrules:\n- name: r1").unwrap();
        assert_eq!(spec_fingerprint(&a), spec_fingerprint(&b));
    }

    #[test]
    fn distinct_specs_produce_distinct_fingerprints() {
        let a = json!({"rules": [{"name": "r1"}]});
        let b = json!({"rules": [{"name": "r2"}]});
        assert_ne!(spec_fingerprint(&a), spec_fingerprint(&b));
    }

    #[test]
    fn spec_fingerprint_differs_from_raw_bytes_of_same_yaml() {
        let raw = b"spec:\n  rules: []\n";
        let value: Value = serde_yaml::from_str(std::str::from_utf8(raw).unwrap()).unwrap();
        let spec = value.get("spec").unwrap();
        assert_ne!(spec_fingerprint(spec), fingerprint_bytes(raw));
    }
}

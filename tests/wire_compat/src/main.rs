fn main() {
    println!("Run `cargo test -p wire-compat` to execute wire compatibility tests.");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use stevedore_protocol::envelope::Message;
    use stevedore_protocol::messages::{
        AuthOk, AuthRequest, MigrationAck, MigrationComplete, MigrationStart, ProgressEvent,
        UploadControlRequest,
    };
    use stevedore_protocol::types::Principal;

    /// Returns the path to the fixtures directory.
    fn fixtures_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
    }

    fn load_fixture(name: &str) -> String {
        let path = fixtures_dir().join(name);
        fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("failed to read fixture {}: {e}", path.display()))
    }

    /// Normalizes JSON values so that integer-valued floats compare equal
    /// (`65` vs `65.0` are the same number on the wire).
    fn normalize_value(v: &serde_json::Value) -> serde_json::Value {
        match v {
            serde_json::Value::Number(n) => {
                if let Some(f) = n.as_f64() {
                    serde_json::json!(f)
                } else {
                    v.clone()
                }
            }
            serde_json::Value::Object(map) => {
                let normalized: serde_json::Map<String, serde_json::Value> = map
                    .iter()
                    .map(|(k, v)| (k.clone(), normalize_value(v)))
                    .collect();
                serde_json::Value::Object(normalized)
            }
            serde_json::Value::Array(arr) => {
                serde_json::Value::Array(arr.iter().map(normalize_value).collect())
            }
            _ => v.clone(),
        }
    }

    /// Deserializes a fixture, re-serializes it, and compares the JSON values
    /// (order-independent, float-normalized). Parses from the raw string so
    /// envelope payloads backed by `RawValue` survive.
    fn roundtrip_test<T>(name: &str)
    where
        T: serde::de::DeserializeOwned + serde::Serialize,
    {
        let raw = load_fixture(name);
        let fixture: serde_json::Value = serde_json::from_str(&raw)
            .unwrap_or_else(|e| panic!("failed to parse fixture {name}: {e}"));
        let parsed: T = serde_json::from_str(&raw)
            .unwrap_or_else(|e| panic!("failed to deserialize {name}: {e}"));
        let reserialized = serde_json::to_value(&parsed)
            .unwrap_or_else(|e| panic!("failed to re-serialize {name}: {e}"));

        assert_eq!(
            normalize_value(&fixture),
            normalize_value(&reserialized),
            "roundtrip mismatch for {name}"
        );
    }

    // --- Envelope ---

    #[test]
    fn fixture_message_envelope() {
        roundtrip_test::<Message>("message_envelope.json");
    }

    #[test]
    fn fixture_error_envelope() {
        roundtrip_test::<Message>("error_envelope.json");
    }

    #[test]
    fn envelope_payload_routes_by_type() {
        let raw = load_fixture("message_envelope.json");
        let msg: Message = serde_json::from_str(&raw).unwrap();
        let control: UploadControlRequest = msg.parse_payload().unwrap().unwrap();
        assert_eq!(control.upload_id, "3f6a2b1c-0d4e-4f61-9a7b-2c8d5e901234");
    }

    // --- Handshake ---

    #[test]
    fn fixture_auth_request() {
        roundtrip_test::<AuthRequest>("auth_request.json");
    }

    #[test]
    fn fixture_auth_ok() {
        roundtrip_test::<AuthOk>("auth_ok.json");
    }

    #[test]
    fn fixture_principal() {
        roundtrip_test::<Principal>("principal.json");
    }

    // --- Upload surface ---

    #[test]
    fn fixture_upload_control() {
        roundtrip_test::<UploadControlRequest>("upload_control.json");
    }

    #[test]
    fn fixture_progress_event() {
        roundtrip_test::<ProgressEvent>("progress_event.json");
    }

    #[test]
    fn progress_event_without_eta_omits_field() {
        let raw = load_fixture("progress_event_no_eta.json");
        let parsed: ProgressEvent = serde_json::from_str(&raw).unwrap();
        assert!(parsed.eta_secs.is_none());
        let out = serde_json::to_value(&parsed).unwrap();
        assert!(out.get("etaSecs").is_none());
    }

    // --- Migration handshake ---

    #[test]
    fn fixture_migration_start() {
        roundtrip_test::<MigrationStart>("migration_start.json");
    }

    #[test]
    fn fixture_migration_ack() {
        roundtrip_test::<MigrationAck>("migration_ack.json");
    }

    #[test]
    fn fixture_migration_complete() {
        roundtrip_test::<MigrationComplete>("migration_complete.json");
    }
}

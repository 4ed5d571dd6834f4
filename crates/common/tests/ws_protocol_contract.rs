use conclave_common::protocol::ws::{
    decode_client_message, decode_server_frame, encode_message, ServerFrame,
    CURRENT_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS,
};
use conclave_common::ErrorKind;

fn load_contract() -> serde_json::Value {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../../contracts/ws-protocol.json");
    let content = std::fs::read_to_string(path).expect("contract file should be readable");
    serde_json::from_str(&content).expect("contract file should be valid JSON")
}

fn frames(contract: &serde_json::Value, key: &str) -> Vec<serde_json::Value> {
    contract[key].as_array().unwrap_or_else(|| panic!("{key} should be an array")).clone()
}

#[test]
fn current_version_matches_contract() {
    let contract = load_contract();
    let expected =
        contract["current_version"].as_str().expect("current_version should be a string");
    assert_eq!(CURRENT_PROTOCOL_VERSION, expected);
}

#[test]
fn supported_versions_match_contract() {
    let contract = load_contract();
    let expected: Vec<&str> = contract["protocol_versions"]
        .as_array()
        .expect("protocol_versions should be an array")
        .iter()
        .map(|v| v.as_str().expect("version should be a string"))
        .collect();
    assert_eq!(SUPPORTED_PROTOCOL_VERSIONS, &expected[..]);
}

#[test]
fn every_client_frame_decodes_and_reencodes_losslessly() {
    let contract = load_contract();
    for frame in frames(&contract, "client_frames") {
        let raw = frame.to_string();
        let message = decode_client_message(&raw)
            .unwrap_or_else(|error| panic!("client frame {raw} should decode: {error}"));
        let reencoded: serde_json::Value =
            serde_json::from_str(&encode_message(&message).unwrap()).unwrap();
        assert_eq!(reencoded, frame, "client frame should survive re-encoding");
    }
}

#[test]
fn every_server_frame_decodes() {
    let contract = load_contract();
    let server_frames = frames(&contract, "server_frames");
    let hello_count = server_frames
        .iter()
        .map(|frame| decode_server_frame(&frame.to_string()).expect("server frame should decode"))
        .filter(|decoded| matches!(decoded, ServerFrame::Hello(_)))
        .count();
    assert_eq!(hello_count, 2, "exactly the two untagged frames are hello replies");
}

#[test]
fn error_kinds_match_contract() {
    let contract = load_contract();
    for kind in frames(&contract, "error_kinds") {
        let decoded: ErrorKind =
            serde_json::from_value(kind.clone()).expect("contract kind should decode");
        assert_eq!(kind.as_str(), Some(decoded.as_str()));
    }
}

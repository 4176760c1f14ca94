//! Verify Alt-Svc header decoding against JSON vectors in `test-vectors/`.
//!
//! Each case gives a raw header value and the alternates it should yield, in
//! order, as rendered origins plus parameters.

use std::collections::BTreeMap;

use httpmux_core::altsvc::parse;

#[test]
fn altsvc_test_vectors() {
    let raw = include_str!("../../test-vectors/altsvc.json");
    let vectors: serde_json::Value = serde_json::from_str(raw).unwrap();
    let host = vectors["request_host"].as_str().unwrap();

    for case in vectors["cases"].as_array().unwrap() {
        let name = case["name"].as_str().unwrap();
        let header = case["header"].as_str().unwrap();

        let parsed: Vec<(String, BTreeMap<String, String>)> = parse(header)
            .map(|d| (d.origin(host).to_string(), d.params))
            .collect();
        let expected: Vec<(String, BTreeMap<String, String>)> = case["expected"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| {
                let params = serde_json::from_value(e["params"].clone()).unwrap();
                (e["origin"].as_str().unwrap().to_string(), params)
            })
            .collect();

        assert_eq!(parsed, expected, "{name}");
    }
}

#[test]
fn reparsing_restarts_from_the_beginning() {
    let header = "h2=\":443\", h3=\":443\"";
    let first: Vec<_> = parse(header).collect();
    let second: Vec<_> = parse(header).collect();
    assert_eq!(first.len(), 2);
    assert_eq!(first, second);
}

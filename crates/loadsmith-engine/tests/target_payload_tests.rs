use loadsmith_engine::engine::target::Target;
use loadsmith_engine::payload::PayloadKind;
use loadsmith_engine::{PayloadProvider, SessionError, SyntheticPayloads};

#[test]
fn test_parse_target_forms() {
    let t = Target::parse("127.0.0.1:8080").unwrap();
    assert_eq!((t.host.as_str(), t.port), ("127.0.0.1", 8080));

    let t = Target::parse("http://example.test:9000/ignored/path").unwrap();
    assert_eq!((t.host.as_str(), t.port), ("example.test", 9000));

    let t = Target::parse("example.test").unwrap();
    assert_eq!(t.port, 80);
    assert_eq!(t.url_for("api/notes"), "http://example.test:80/api/notes");
    assert_eq!(t.url_for("/api/notes"), "http://example.test:80/api/notes");
}

#[test]
fn test_parse_target_rejects_https_and_garbage() {
    assert!(matches!(
        Target::parse("https://example.test"),
        Err(SessionError::InvalidTarget(_))
    ));
    assert!(Target::parse("http://").is_err());
    assert!(Target::parse("not a host:port").is_err());
}

#[test]
fn test_payload_kinds_follow_endpoint_table() {
    let payloads = SyntheticPayloads::new(["/auth/register", "/auth/login", "/api/notes"]);
    assert_eq!(payloads.kind_of("/auth/register"), PayloadKind::Register);
    assert_eq!(payloads.kind_of("/auth/login"), PayloadKind::Login);
    assert_eq!(payloads.kind_of("/api/notes"), PayloadKind::Note);
    assert_eq!(payloads.kind_of("/api/passwords"), PayloadKind::Empty);
}

#[test]
fn test_unknown_endpoint_gets_empty_object() {
    let payloads = SyntheticPayloads::new(["/auth/login"]);
    let body = payloads.payload_for("/nowhere");
    assert_eq!(body, serde_json::json!({}));

    let login = payloads.payload_for("/auth/login");
    assert!(login["username"].is_string());
    assert!(login["passwordHash"].is_string());
}

#[test]
fn test_random_headers_are_present() {
    let headers = SyntheticPayloads::default().random_headers();
    assert!(headers.contains_key("User-Agent"));
    assert_eq!(headers.get("X-Request-Id").map(String::len), Some(16));
}

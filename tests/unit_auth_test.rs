use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use olivinedb::core::OlivineError;
use olivinedb::core::handler::auth::verify_token;
use serde_json::{Value, json};

fn hs256_token(secret: &str, claims: &Value) -> String {
    encode(
        &Header::new(Algorithm::HS256),
        claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap()
}

#[tokio::test]
async fn test_hmac_token_round_trip() {
    let token = hs256_token(
        "topsecret",
        &json!({"sub": "alice", "roles": ["auditor", "writer"]}),
    );
    let principal = verify_token("topsecret", &token).unwrap();
    assert_eq!(principal.user_id, "alice");
    assert_eq!(principal.role_signature(), "auditor,writer");
}

#[tokio::test]
async fn test_missing_roles_default_to_user() {
    let token = hs256_token("topsecret", &json!({"sub": "bob"}));
    let principal = verify_token("topsecret", &token).unwrap();
    assert_eq!(principal.role_signature(), "USER");
}

#[tokio::test]
async fn test_wrong_secret_is_rejected() {
    let token = hs256_token("topsecret", &json!({"sub": "mallory"}));
    assert!(matches!(
        verify_token("othersecret", &token),
        Err(OlivineError::AuthFailed(_))
    ));
}

#[tokio::test]
async fn test_user_id_claim_overrides_subject() {
    let token = hs256_token("s", &json!({"sub": "device-7", "user_id": "carol"}));
    let principal = verify_token("s", &token).unwrap();
    assert_eq!(principal.user_id, "carol");
}

#[tokio::test]
async fn test_garbage_token_is_rejected() {
    assert!(matches!(
        verify_token("s", "not-a-token"),
        Err(OlivineError::AuthFailed(_))
    ));
}

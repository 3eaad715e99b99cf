//! Status-code mapping of the live Cloud Storage client.
//!
//! Every case runs against a wiremock server standing in for
//! storage.googleapis.com; the unreachable case points at a closed port.

use bytes::Bytes;
use std::time::Duration;
use storage_verifier::{
    credentials::{HmacKey, ServiceAccountKey},
    models::object::ObjectUpload,
    services::{
        gcs_client::GcsClient,
        store::{ObjectStore, StoreError},
    },
};
use wiremock::matchers::{body_string_contains, header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const BUCKET: &str = "eventhub-payment-proofs";

fn client(endpoint: &str) -> GcsClient {
    GcsClient::new(
        HmacKey::new("GOOG1TESTACCESSID", "test-secret"),
        endpoint,
        Duration::from_secs(5),
    )
    .unwrap()
}

fn error_body(code: &str, message: &str) -> String {
    format!(
        "<?xml version='1.0' encoding='UTF-8'?><Error><Code>{code}</Code><Message>{message}</Message></Error>"
    )
}

#[tokio::test]
async fn missing_bucket_is_not_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path(format!("/{BUCKET}")))
        .and(header_exists("authorization"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let exists = client(&server.uri()).bucket_exists(BUCKET).await.unwrap();
    assert!(!exists);
}

#[tokio::test]
async fn forbidden_metadata_is_permission_denied() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("/{BUCKET}")))
        .respond_with(ResponseTemplate::new(403).set_body_string(error_body(
            "AccessDenied",
            "uploader does not have storage.buckets.get access",
        )))
        .mount(&server)
        .await;

    let err = client(&server.uri())
        .bucket_metadata(BUCKET)
        .await
        .unwrap_err();
    match err {
        StoreError::PermissionDenied { status, message } => {
            assert_eq!(status, 403);
            assert!(message.contains("storage.buckets.get"));
        }
        other => panic!("expected PermissionDenied, got {other:?}"),
    }
}

const PRIVATE_ACL: &str = r#"<?xml version='1.0' encoding='UTF-8'?>
<AccessControlList><Entries>
  <Entry><Scope type="UserByEmail"><EmailAddress>uploader@eventhub.iam.gserviceaccount.com</EmailAddress></Scope><Permission>FULL_CONTROL</Permission></Entry>
</Entries></AccessControlList>"#;

fn iam_document(bindings: serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "kind": "storage#policy",
        "resourceId": format!("projects/_/buckets/{BUCKET}"),
        "version": 1,
        "etag": "CAE=",
        "bindings": bindings,
    })
}

fn iam_path() -> String {
    format!("/storage/v1/b/{BUCKET}/iam")
}

#[tokio::test]
async fn iam_grant_is_public_even_when_acl_is_private() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(iam_path()))
        .respond_with(ResponseTemplate::new(200).set_body_json(iam_document(serde_json::json!([
            {"role": "roles/storage.legacyBucketOwner", "members": ["projectOwner:eventhub-prod"]},
            {"role": "roles/storage.objectViewer", "members": ["allUsers"]},
        ]))))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/{BUCKET}")))
        .respond_with(ResponseTemplate::new(200).set_body_string(PRIVATE_ACL))
        .mount(&server)
        .await;

    let policy = client(&server.uri()).bucket_policy(BUCKET).await.unwrap();
    assert!(policy.is_public_readable());
    assert_eq!(
        policy.public_read_grants(),
        vec![("allUsers", "roles/storage.objectViewer")]
    );
}

#[tokio::test]
async fn acl_grants_supplement_a_private_iam_policy() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(iam_path()))
        .respond_with(ResponseTemplate::new(200).set_body_json(iam_document(serde_json::json!([]))))
        .mount(&server)
        .await;
    let acl = r#"<?xml version='1.0' encoding='UTF-8'?>
<AccessControlList><Entries>
  <Entry><Scope type="AllUsers"/><Permission>READ</Permission></Entry>
</Entries></AccessControlList>"#;
    Mock::given(method("GET"))
        .and(path(format!("/{BUCKET}")))
        .respond_with(ResponseTemplate::new(200).set_body_string(acl))
        .mount(&server)
        .await;

    let policy = client(&server.uri()).bucket_policy(BUCKET).await.unwrap();
    assert_eq!(policy.public_read_grants(), vec![("allUsers", "READ")]);
}

#[tokio::test]
async fn uniform_access_bucket_is_judged_on_iam_alone() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(iam_path()))
        .respond_with(ResponseTemplate::new(200).set_body_json(iam_document(serde_json::json!([
            {"role": "roles/storage.objectAdmin", "members": ["serviceAccount:uploader@eventhub.iam.gserviceaccount.com"]},
        ]))))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/{BUCKET}")))
        .respond_with(ResponseTemplate::new(400).set_body_string(error_body(
            "InvalidArgument",
            "Cannot get legacy ACL for a bucket that has uniform bucket-level access.",
        )))
        .mount(&server)
        .await;

    let policy = client(&server.uri()).bucket_policy(BUCKET).await.unwrap();
    assert!(!policy.is_public_readable());
    assert_eq!(policy.bindings.len(), 1);
}

#[tokio::test]
async fn denied_iam_read_is_an_error_even_if_acl_is_readable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(iam_path()))
        .respond_with(ResponseTemplate::new(403).set_body_json(serde_json::json!({
            "error": {"code": 403, "message": "uploader does not have storage.buckets.getIamPolicy access"}
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/{BUCKET}")))
        .respond_with(ResponseTemplate::new(200).set_body_string(PRIVATE_ACL))
        .mount(&server)
        .await;

    let err = client(&server.uri()).bucket_policy(BUCKET).await.unwrap_err();
    match err {
        StoreError::PermissionDenied { status, message } => {
            assert_eq!(status, 403);
            assert!(message.contains("getIamPolicy"), "{message}");
        }
        other => panic!("expected PermissionDenied, got {other:?}"),
    }
}

#[tokio::test]
async fn service_account_uses_one_cached_bearer_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains(
            "grant_type=urn%3Aietf%3Aparams%3Aoauth%3Agrant-type%3Ajwt-bearer",
        ))
        .and(body_string_contains("assertion="))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "ya29.test-token",
            "expires_in": 3599,
            "token_type": "Bearer",
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(iam_path()))
        .and(header("authorization", "Bearer ya29.test-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(iam_document(serde_json::json!([]))))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/{BUCKET}")))
        .and(header("authorization", "Bearer ya29.test-token"))
        .respond_with(ResponseTemplate::new(200).set_body_string(PRIVATE_ACL))
        .mount(&server)
        .await;

    let key = ServiceAccountKey::from_pem(
        "uploader@eventhub-prod.iam.gserviceaccount.com",
        include_str!("fixtures/service-account-key.pem"),
        format!("{}/token", server.uri()),
    )
    .unwrap();
    let client = GcsClient::new(key, &server.uri(), Duration::from_secs(5)).unwrap();

    let policy = client.bucket_policy(BUCKET).await.unwrap();
    assert!(!policy.is_public_readable());
}

#[tokio::test]
async fn refused_token_exchange_is_permission_denied() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
            "error": "invalid_grant",
            "error_description": "Invalid JWT Signature.",
        })))
        .mount(&server)
        .await;

    let key = ServiceAccountKey::from_pem(
        "uploader@eventhub-prod.iam.gserviceaccount.com",
        include_str!("fixtures/service-account-key.pem"),
        format!("{}/token", server.uri()),
    )
    .unwrap();
    let client = GcsClient::new(key, &server.uri(), Duration::from_secs(5)).unwrap();

    let err = client.bucket_exists(BUCKET).await.unwrap_err();
    assert!(matches!(err, StoreError::PermissionDenied { status: 400, .. }), "{err:?}");
    assert!(err.to_string().contains("invalid_grant"), "{err}");
}

#[tokio::test]
async fn upload_sends_digest_and_reads_etag() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path(format!("/{BUCKET}/test-uploads/test-1.txt")))
        .and(header_exists("content-md5"))
        .and(header_exists("x-goog-content-sha256"))
        .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"abc123\""))
        .expect(1)
        .mount(&server)
        .await;

    let stored = client(&server.uri())
        .upload(
            BUCKET,
            ObjectUpload {
                key: "test-uploads/test-1.txt".into(),
                content: Bytes::from_static(b"probe"),
                content_type: "text/plain".into(),
                cache_control: Some("private, max-age=60".into()),
            },
        )
        .await
        .unwrap();
    assert_eq!(stored.etag, "abc123");
    assert_eq!(stored.size_bytes, 5);
}

#[tokio::test]
async fn not_found_codes_distinguish_bucket_and_object() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path(format!("/{BUCKET}/gone.txt")))
        .respond_with(
            ResponseTemplate::new(404)
                .set_body_string(error_body("NoSuchKey", "The specified key does not exist.")),
        )
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/other-bucket/gone.txt"))
        .respond_with(ResponseTemplate::new(404).set_body_string(error_body(
            "NoSuchBucket",
            "The specified bucket does not exist.",
        )))
        .mount(&server)
        .await;

    let client = client(&server.uri());
    assert!(matches!(
        client.delete(BUCKET, "gone.txt").await,
        Err(StoreError::ObjectNotFound { .. })
    ));
    assert!(matches!(
        client.delete("other-bucket", "gone.txt").await,
        Err(StoreError::BucketNotFound(_))
    ));
}

#[tokio::test]
async fn server_errors_keep_the_code() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(500).set_body_string(error_body("InternalError", "backend down")),
        )
        .mount(&server)
        .await;

    let client = client(&server.uri());
    let err = client.bucket_exists(BUCKET).await.unwrap_err();
    assert_eq!(err.status(), Some(503));

    let err = client.bucket_policy(BUCKET).await.unwrap_err();
    assert!(err.to_string().contains("InternalError: backend down"), "{err}");
}

#[tokio::test]
async fn anonymous_fetch_returns_status_without_auth() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("/{BUCKET}/probe.txt")))
        .respond_with(ResponseTemplate::new(403).set_body_string(error_body(
            "AccessDenied",
            "Anonymous caller does not have storage.objects.get access.",
        )))
        .mount(&server)
        .await;

    let client = client(&server.uri());
    let url = client.public_url(BUCKET, "probe.txt");
    let response = client.fetch(&url).await.unwrap();
    assert_eq!(response.status, 403);
    assert!(!response.is_success());

    let requests = server.received_requests().await.unwrap();
    assert!(requests[0].headers.get("authorization").is_none());
}

#[tokio::test]
async fn unreachable_endpoint_is_a_transport_error() {
    let err = client("http://127.0.0.1:1")
        .bucket_exists(BUCKET)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Transport(_)), "{err:?}");
    assert_eq!(err.status(), None);
}

#[test]
fn rejects_endpoints_without_a_host() {
    let key = HmacKey::new("GOOG1TESTACCESSID", "test-secret");
    assert!(matches!(
        GcsClient::new(key.clone(), "not a url", Duration::from_secs(1)),
        Err(StoreError::InvalidEndpoint(_))
    ));
    assert!(matches!(
        GcsClient::new(key, "ftp://storage.example", Duration::from_secs(1)),
        Err(StoreError::InvalidEndpoint(_))
    ));
}

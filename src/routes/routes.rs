//! Routes of the Cloud Storage emulator.
//!
//! - `HEAD   /{bucket}`: bucket existence
//! - `GET    /{bucket}?location|storageClass|acl`: bucket sub-resources
//! - `PUT    /{bucket}/{*key}`: upload object
//! - `GET    /{bucket}/{*key}`: download (authenticated, signed URL or anonymous)
//! - `DELETE /{bucket}/{*key}`: delete object
//! - `GET    /storage/v1/b/{bucket}/iam`: bucket IAM policy (JSON API)
//! - `POST   /token`: OAuth JWT-bearer token exchange
//!
//! The wildcard `*key` allows nested keys like `test-uploads/test-1.txt`.

use crate::{
    emulator::EmulatorState,
    handlers::{
        health_handlers::{healthz, readyz},
        object_handlers::{
            delete_object, get_bucket, get_iam_policy, get_object, head_bucket, issue_token,
            put_object,
        },
    },
};
use axum::{
    Router,
    routing::{get, post, put},
};

pub fn routes() -> Router<EmulatorState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/token", post(issue_token))
        .route("/storage/v1/b/{bucket}/iam", get(get_iam_policy))
        .route(
            "/{bucket}/{*key}",
            put(put_object).get(get_object).delete(delete_object),
        )
        .route("/{bucket}", get(get_bucket).head(head_bucket))
}

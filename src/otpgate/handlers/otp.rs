//! OTP send/verify endpoints.
//!
//! Thin adapter over [`crate::verification::VerificationService`]: JSON in, status codes and the
//! `otp_session` cookie out. No verification logic lives here.

use axum::{
    Json,
    extract::Extension,
    http::{
        HeaderMap, HeaderValue, StatusCode,
        header::{InvalidHeaderValue, SET_COOKIE},
    },
    response::{IntoResponse, Response},
};
use anyhow::{Context, Result};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, warn};
use utoipa::ToSchema;

use super::{PeerAddr, client_ip, extract_cookie, valid_email};
use crate::otpgate::state::AppState;
use crate::verification::{
    CompleteVerification, IssuedCode, StartOutcome, StartVerification, VerifyOutcome,
    email::{Delivery, EmailMessage, otp_code_message, welcome_message},
    normalize_case_id, normalize_email,
};

pub const OTP_COOKIE_NAME: &str = "otp_session";

#[derive(ToSchema, Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct SendOtpRequest {
    pub email: String,
    pub case_id: String,
}

#[derive(ToSchema, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct VerifyOtpRequest {
    pub email: String,
    pub otp: String,
    pub case_id: String,
}

impl std::fmt::Debug for VerifyOtpRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerifyOtpRequest")
            .field("email", &self.email)
            .field("otp", &"***")
            .field("case_id", &self.case_id)
            .finish()
    }
}

#[derive(ToSchema, Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SendOtpResponse {
    pub success: bool,
    pub message: String,
    pub email_dispatched: bool,
    /// Only present when the server runs with code exposure enabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub otp: Option<String>,
}

#[derive(ToSchema, Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct VerifyOtpResponse {
    pub success: bool,
    pub message: String,
    pub email: String,
    pub case_id: String,
}

#[derive(ToSchema, Serialize, Debug)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
        .into_response()
}

/// Cookie carrying the signed session token, bounded by its TTL.
pub(crate) fn otp_session_cookie(
    token: &str,
    ttl_seconds: i64,
) -> Result<HeaderValue, InvalidHeaderValue> {
    HeaderValue::from_str(&format!(
        "{OTP_COOKIE_NAME}={token}; Path=/; HttpOnly; Secure; SameSite=Lax; Max-Age={ttl_seconds}"
    ))
}

pub(crate) fn clear_otp_session_cookie() -> HeaderValue {
    HeaderValue::from_static("otp_session=; Path=/; HttpOnly; Secure; SameSite=Lax; Max-Age=0")
}

/// Issue a code for `{email, caseId}`, mail it and set the session cookie.
#[utoipa::path(
    post,
    path = "/v1/otp/send",
    request_body = SendOtpRequest,
    responses(
        (status = 200, description = "Code issued, session cookie set", body = SendOtpResponse),
        (status = 400, description = "Missing or invalid email/caseId", body = ErrorResponse),
        (status = 429, description = "Rate limited", body = ErrorResponse),
        (status = 500, description = "Code could not be issued or delivered", body = ErrorResponse)
    ),
    tag = "otp"
)]
pub async fn send_otp(
    peer: PeerAddr,
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
    payload: Option<Json<SendOtpRequest>>,
) -> impl IntoResponse {
    let request: SendOtpRequest = match payload {
        Some(Json(payload)) => payload,
        None => return error_response(StatusCode::BAD_REQUEST, "Missing payload"),
    };

    let email = normalize_email(&request.email);
    let case_id = normalize_case_id(&request.case_id);
    if email.is_empty() || case_id.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "Email and caseId are required");
    }
    if !valid_email(&email) {
        return error_response(StatusCode::BAD_REQUEST, "Invalid email address");
    }

    let client_ip = client_ip(&headers, peer, state.config().trusted_proxies());
    let outcome = state
        .service()
        .start(&StartVerification {
            email: &email,
            case_id,
            client_ip: client_ip.as_deref(),
        })
        .await;

    let issued = match outcome {
        Ok(StartOutcome::Issued(issued)) => issued,
        Ok(StartOutcome::Denied) => {
            return error_response(
                StatusCode::TOO_MANY_REQUESTS,
                "Too many requests. Please try again later.",
            );
        }
        Err(err) => {
            error!("Failed to issue OTP: {err:#}");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to send OTP");
        }
    };

    let email_dispatched = match dispatch_code(&state, &email, case_id, &issued).await {
        Ok(Delivery::Sent) => true,
        Ok(Delivery::Skipped) => false,
        Err(err) => {
            error!(to_email = %email, "Failed to deliver OTP email: {err:#}");
            if state.config().require_email_delivery() {
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to send OTP email",
                );
            }
            false
        }
    };

    let cookie = match otp_session_cookie(&issued.token, issued.ttl_seconds) {
        Ok(cookie) => cookie,
        Err(err) => {
            error!("Failed to build OTP session cookie: {err}");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to send OTP");
        }
    };

    let body = SendOtpResponse {
        success: true,
        message: "OTP sent successfully".to_string(),
        email_dispatched,
        otp: state
            .config()
            .expose_code()
            .then(|| issued.code.expose_secret().to_string()),
    };

    let mut response_headers = HeaderMap::new();
    response_headers.insert(SET_COOKIE, cookie);
    (StatusCode::OK, response_headers, Json(body)).into_response()
}

async fn dispatch_code(
    state: &AppState,
    email: &str,
    case_id: &str,
    issued: &IssuedCode,
) -> Result<Delivery> {
    let message = otp_code_message(email, case_id, &issued.code, issued.ttl_seconds)?;
    deliver(state, message).await
}

// SMTP blocks; keep it off the async workers.
async fn deliver(state: &AppState, message: EmailMessage) -> Result<Delivery> {
    let sender = state.email_sender();
    tokio::task::spawn_blocking(move || sender.send(&message))
        .await
        .context("email delivery task failed")?
}

/// Check a submitted code against the `otp_session` cookie.
#[utoipa::path(
    post,
    path = "/v1/otp/verify",
    request_body = VerifyOtpRequest,
    responses(
        (status = 200, description = "Email verified, session cookie cleared", body = VerifyOtpResponse),
        (status = 400, description = "Missing fields, malformed code or no session", body = ErrorResponse),
        (status = 401, description = "Wrong code", body = ErrorResponse),
        (status = 429, description = "Rate limited", body = ErrorResponse)
    ),
    tag = "otp"
)]
pub async fn verify_otp(
    peer: PeerAddr,
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
    payload: Option<Json<VerifyOtpRequest>>,
) -> impl IntoResponse {
    let request: VerifyOtpRequest = match payload {
        Some(Json(payload)) => payload,
        None => return error_response(StatusCode::BAD_REQUEST, "Missing payload"),
    };

    let email = normalize_email(&request.email);
    let case_id = normalize_case_id(&request.case_id);
    if email.is_empty() || case_id.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "Email and caseId are required");
    }

    let client_ip = client_ip(&headers, peer, state.config().trusted_proxies());
    let token = extract_cookie(&headers, OTP_COOKIE_NAME);
    let outcome = state
        .service()
        .complete(&CompleteVerification {
            email: &email,
            case_id,
            // Untrimmed: blank or padded codes are rejected after the limiter counts them.
            code: &request.otp,
            token: token.as_deref(),
            client_ip: client_ip.as_deref(),
        })
        .await;

    match outcome {
        Ok(VerifyOutcome::Verified(payload)) => {
            send_welcome(&state, &payload.email, &payload.case_id).await;
            let body = VerifyOtpResponse {
                success: true,
                message: "Email verified successfully".to_string(),
                email: payload.email,
                case_id: payload.case_id,
            };
            let mut response_headers = HeaderMap::new();
            response_headers.insert(SET_COOKIE, clear_otp_session_cookie());
            (StatusCode::OK, response_headers, Json(body)).into_response()
        }
        Ok(VerifyOutcome::CodeMismatch) => error_response(StatusCode::UNAUTHORIZED, "Invalid OTP"),
        Ok(VerifyOutcome::Denied) => error_response(
            StatusCode::TOO_MANY_REQUESTS,
            "Too many verification attempts. Please try again later.",
        ),
        Ok(VerifyOutcome::NoSession) => {
            error_response(StatusCode::BAD_REQUEST, "OTP session expired or not found")
        }
        Ok(VerifyOutcome::MalformedInput) => {
            error_response(StatusCode::BAD_REQUEST, "Invalid OTP format")
        }
        Err(err) => {
            error!("Failed to verify OTP: {err:#}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to verify OTP")
        }
    }
}

// Informational only; a failed welcome email never fails the verification.
async fn send_welcome(state: &AppState, email: &str, case_id: &str) {
    let dashboard_url = state.config().dashboard_url();
    let result = match welcome_message(email, case_id, &dashboard_url) {
        Ok(message) => deliver(state, message).await,
        Err(err) => Err(err),
    };
    if let Err(err) = result {
        warn!(to_email = %email, "Failed to send welcome email: {err:#}");
    }
}

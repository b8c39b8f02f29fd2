//! # otpgate
//!
//! Passwordless email verification with one-time passcodes.
//!
//! A client asks for a code for `{email, caseId}`; the server mails a numeric
//! code and hands back a signed `otp_session` cookie carrying only an Argon2id
//! digest of that code. Verification needs the cookie, the same email and case,
//! and the code. No session state is kept server-side; the only in-memory state
//! is the fixed-window rate limiter guarding both steps.
//!
//! - [`verification`]: the framework-free core (limiter, codec, tokens, flows).
//! - [`otpgate`]: the axum adapter (routes, cookies, `OpenAPI`).
//! - [`cli`]: argument parsing, telemetry and server startup.

pub mod cli;
pub mod otpgate;
pub mod verification;

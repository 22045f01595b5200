use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use common::error::{Error, Result};
use md5::{Digest, Md5};

use super::{AuthStrategy, rejected};
use crate::account::{Account, AuthScheme};
use crate::connection::Connection;
use crate::protocol::api::ApiNumber;
use crate::protocol::messages;

/// Length of the decoded server challenge.
pub const CHALLENGE_LEN: usize = 64;
/// Passwords are zero-padded to this length before hashing.
pub const MAX_PASSWORD_LEN: usize = 50;

/// Challenge/response with the grid password.
#[derive(Clone, Copy, Debug, Default)]
pub struct NativeAuth;

impl AuthStrategy for NativeAuth {
    fn scheme(&self) -> AuthScheme {
        AuthScheme::Native
    }

    fn authenticate_after_startup(
        &self,
        connection: &mut Connection,
        account: &Account,
    ) -> impl std::future::Future<Output = Result<()>> + Send {
        respond_to_challenge(connection, account.user(), account.password())
    }
}

/// Base64 of MD5(challenge || password padded to [`MAX_PASSWORD_LEN`]), zero digest bytes
/// replaced by 1.
pub fn challenge_response(challenge: &[u8], password: &str) -> Result<String> {
    if password.len() > MAX_PASSWORD_LEN {
        return Err(Error::invalid_argument(format!(
            "password longer than {MAX_PASSWORD_LEN} bytes"
        )));
    }
    let mut padded = [0u8; MAX_PASSWORD_LEN];
    padded[..password.len()].copy_from_slice(password.as_bytes());
    let mut hasher = Md5::new();
    hasher.update(challenge);
    hasher.update(padded);
    let mut digest = hasher.finalize();
    for byte in digest.iter_mut() {
        if *byte == 0 {
            *byte = 1;
        }
    }
    Ok(STANDARD.encode(digest.as_slice()))
}

pub(super) async fn respond_to_challenge(
    connection: &mut Connection,
    user: &str,
    password: &str,
) -> Result<()> {
    let reply = connection.api_request(ApiNumber::AuthRequest, None).await?;
    let encoded = messages::parse_auth_request_out(reply.body()?)?;
    let challenge = STANDARD
        .decode(encoded.trim())
        .map_err(|err| Error::protocol(format!("challenge is not valid base64: {err}")))?;
    if challenge.len() != CHALLENGE_LEN {
        return Err(Error::protocol(format!(
            "challenge has {} bytes, expected {CHALLENGE_LEN}",
            challenge.len()
        )));
    }
    let response = challenge_response(&challenge, password)?;
    connection
        .api_request(
            ApiNumber::AuthResponse,
            Some(&messages::auth_response_inp(&response, user)),
        )
        .await
        .map_err(|error| rejected(user, error))?;
    tracing::debug!("challenge response accepted for {user}");
    Ok(())
}

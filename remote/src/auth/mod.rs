//! Session authentication.
//!
//! Authenticating a fresh [`Connection`] always runs the same pipeline:
//!
//! 1. send the startup pack (`RODS_CONNECT`) describing the client, zone and reconnect wish
//! 2. read the server's `RODS_VERSION` reply into a [`StartupResponse`]
//! 3. run the scheme-specific exchange of the account's [`AuthScheme`] ([`AuthStrategy`])
//! 4. combine both into an [`AuthResult`]
//!
//! Only step 3 varies. Rejected credentials surface as [`Error::Authentication`]; malformed or
//! interrupted exchanges as [`Error::Protocol`] or [`Error::Connection`]. Whatever the failure,
//! the connection is closed before the error is returned.

mod native;
mod pam;

use common::error::{Error, Result};

use crate::account::{Account, AuthScheme};
use crate::connection::Connection;
use crate::protocol::api;
use crate::protocol::messages::{StartupPack, StartupResponse};

pub use native::{CHALLENGE_LEN, MAX_PASSWORD_LEN, NativeAuth, challenge_response};
pub use pam::PamAuth;

/// Client name announced in the startup pack.
pub const CLIENT_NAME: &str = "rgrid";

/// Identity established for a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthResult {
    pub startup: StartupResponse,
    pub user: String,
    pub zone: String,
    pub scheme: AuthScheme,
}

/// Scheme-specific step of the authentication pipeline.
pub trait AuthStrategy: Send + Sync {
    fn scheme(&self) -> AuthScheme;

    /// Proves the account's identity over a connection that completed the startup handshake.
    fn authenticate_after_startup(
        &self,
        connection: &mut Connection,
        account: &Account,
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// Authenticates with the strategy matching the account's configured scheme.
pub async fn authenticate(connection: &mut Connection, account: &Account) -> Result<AuthResult> {
    match account.scheme() {
        AuthScheme::Native => authenticate_with(connection, account, &NativeAuth).await,
        AuthScheme::Pam => authenticate_with(connection, account, &PamAuth::default()).await,
    }
}

#[tracing::instrument(skip(connection, strategy), fields(scheme = %strategy.scheme()))]
pub async fn authenticate_with<S: AuthStrategy>(
    connection: &mut Connection,
    account: &Account,
    strategy: &S,
) -> Result<AuthResult> {
    match run_pipeline(connection, account, strategy).await {
        Ok(startup) => {
            tracing::info!(
                "authenticated {}#{} against {} ({})",
                account.user(),
                account.zone(),
                connection.peer_addr(),
                startup.release_version
            );
            Ok(AuthResult {
                startup,
                user: account.user().to_string(),
                zone: account.zone().to_string(),
                scheme: strategy.scheme(),
            })
        }
        Err(error) => {
            tracing::warn!("authentication of {} failed: {error}", account.user());
            if let Err(close_error) = connection.close().await {
                tracing::debug!(
                    "failed closing connection after authentication failure: {close_error}"
                );
            }
            Err(error)
        }
    }
}

async fn run_pipeline<S: AuthStrategy>(
    connection: &mut Connection,
    account: &Account,
    strategy: &S,
) -> Result<StartupResponse> {
    let startup = startup(connection, account).await?;
    strategy.authenticate_after_startup(connection, account).await?;
    Ok(startup)
}

async fn startup(connection: &mut Connection, account: &Account) -> Result<StartupResponse> {
    let pack = StartupPack {
        proxy_user: account.user().to_string(),
        proxy_zone: account.zone().to_string(),
        client_user: account.user().to_string(),
        client_zone: account.zone().to_string(),
        reconnect: connection.config().reconnect,
        option: CLIENT_NAME.to_string(),
    };
    connection
        .send_message(api::RODS_CONNECT, Some(&pack.to_tag()), 0)
        .await?;
    let reply = connection.read_message().await?;
    if reply.header.msg_type != api::RODS_VERSION {
        return Err(Error::protocol(format!(
            "expected {} in reply to startup pack, received {}",
            api::RODS_VERSION,
            reply.header.msg_type
        )));
    }
    if reply.status() < 0 {
        return Err(Error::Server {
            code: reply.status(),
            message: format!("startup rejected: {}", reply.error_message()),
        });
    }
    let response = StartupResponse::from_tag(reply.body()?)?;
    if response.status < 0 {
        return Err(Error::Server {
            code: response.status,
            message: "startup rejected".to_string(),
        });
    }
    tracing::debug!("startup response: {response:?}");
    Ok(response)
}

/// Maps a rejected credential exchange to [`Error::Authentication`].
fn rejected(user: &str, error: Error) -> Error {
    match error {
        Error::Server { code, message } => {
            Error::Authentication(format!("credentials of {user} rejected ({code}): {message}"))
        }
        other => other,
    }
}

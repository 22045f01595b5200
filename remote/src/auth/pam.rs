use common::error::Result;

use super::{AuthStrategy, native, rejected};
use crate::account::{Account, AuthScheme};
use crate::connection::Connection;
use crate::protocol::api::ApiNumber;
use crate::protocol::messages;

/// PAM authentication: the server checks the password with PAM and hands out a temporary grid
/// password, which is then used for the native challenge/response.
///
/// The password travels in clear text; only use this over a trusted network.
#[derive(Clone, Copy, Debug, Default)]
pub struct PamAuth {
    /// Lifetime of the temporary password in hours (0 = server default).
    pub time_to_live: i32,
}

impl AuthStrategy for PamAuth {
    fn scheme(&self) -> AuthScheme {
        AuthScheme::Pam
    }

    fn authenticate_after_startup(
        &self,
        connection: &mut Connection,
        account: &Account,
    ) -> impl std::future::Future<Output = Result<()>> + Send {
        let time_to_live = self.time_to_live;
        async move {
            let request =
                messages::pam_auth_request_inp(account.user(), account.password(), time_to_live);
            let reply = connection
                .api_request(ApiNumber::PamAuthRequest, Some(&request))
                .await
                .map_err(|error| rejected(account.user(), error))?;
            let temporary_password = messages::parse_pam_auth_request_out(reply.body()?)?;
            tracing::debug!("received temporary password from PAM exchange");
            native::respond_to_challenge(connection, account.user(), &temporary_password).await
        }
    }
}

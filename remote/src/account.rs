use common::error::{Error, Result};

/// How a session proves the user's identity after the startup handshake.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AuthScheme {
    /// Challenge/response with the user's grid password.
    #[default]
    Native,
    /// Password checked by the server's PAM stack, exchanged for a temporary grid password.
    Pam,
}

impl std::str::FromStr for AuthScheme {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "native" => Ok(AuthScheme::Native),
            "pam" => Ok(AuthScheme::Pam),
            other => Err(format!(
                "unknown authentication scheme {other:?}, expected native or pam"
            )),
        }
    }
}

impl std::fmt::Display for AuthScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthScheme::Native => f.write_str("native"),
            AuthScheme::Pam => f.write_str("pam"),
        }
    }
}

/// Connection target and credentials of one grid user.
#[derive(Clone, PartialEq, Eq)]
pub struct Account {
    host: String,
    port: u16,
    zone: String,
    user: String,
    password: String,
    default_resource: String,
    scheme: AuthScheme,
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("zone", &self.zone)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("default_resource", &self.default_resource)
            .field("scheme", &self.scheme)
            .finish()
    }
}

impl Account {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        user: impl Into<String>,
        zone: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self> {
        let account = Self {
            host: host.into(),
            port,
            zone: zone.into(),
            user: user.into(),
            password: password.into(),
            default_resource: String::new(),
            scheme: AuthScheme::Native,
        };
        for (name, value) in [
            ("host", &account.host),
            ("user", &account.user),
            ("zone", &account.zone),
        ] {
            if value.is_empty() {
                return Err(Error::invalid_argument(format!("account {name} is empty")));
            }
        }
        if account.port == 0 {
            return Err(Error::invalid_argument("account port is 0"));
        }
        Ok(account)
    }

    pub fn with_scheme(mut self, scheme: AuthScheme) -> Self {
        self.scheme = scheme;
        self
    }

    pub fn with_default_resource(mut self, resource: impl Into<String>) -> Self {
        self.default_resource = resource.into();
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn zone(&self) -> &str {
        &self.zone
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn default_resource(&self) -> &str {
        &self.default_resource
    }

    pub fn scheme(&self) -> AuthScheme {
        self.scheme
    }

    /// `/<zone>/home/<user>`
    pub fn home_directory(&self) -> String {
        format!("/{}/home/{}", self.zone, self.user)
    }
}

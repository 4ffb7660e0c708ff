use std::sync::Arc;

/// Produces the opaque authorization credential attached to every request.
///
/// The actual signing scheme (key storage, signature format) lives outside
/// this crate; the sync core only forwards what the signer returns.
pub trait RequestSigner: Send + Sync {
    /// Opaque signed token for the `Authorization` header.
    fn authorization(&self) -> String;

    /// Identity the requests act as, sent in the `user` header.
    fn identity(&self) -> String;
}

/// Snapshot of the signer output, taken once per request or subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub token: String,
    pub user: String,
}

impl Credentials {
    pub fn from_signer(signer: &dyn RequestSigner) -> Self {
        Self {
            token: signer.authorization(),
            user: signer.identity(),
        }
    }
}

/// Signer with a fixed token, for callers that refresh credentials
/// themselves and for tests.
#[derive(Debug, Clone)]
pub struct StaticSigner {
    token: String,
    user: String,
}

impl StaticSigner {
    pub fn new(token: impl Into<String>, user: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            token: token.into(),
            user: user.into(),
        })
    }
}

impl RequestSigner for StaticSigner {
    fn authorization(&self) -> String {
        self.token.clone()
    }

    fn identity(&self) -> String {
        self.user.clone()
    }
}

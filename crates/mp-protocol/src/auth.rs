//! The upstream authentication provider seam.
//!
//! Obtaining real access/client tokens and session material (Microsoft /
//! Mojang OAuth) is out of scope. `AuthProvider` is the seam a real
//! implementation would plug into; `OfflineAuthProvider` is the bundled
//! stand-in used by the service binary and tests.

use async_trait::async_trait;

/// Session material handed to the proxy core after authenticating
/// upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCredentials {
    pub username: String,
    pub access_token: Option<String>,
    pub client_token: Option<String>,
}

#[async_trait(?Send)]
pub trait AuthProvider {
    async fn authenticate(&self) -> Result<SessionCredentials, crate::ProxyError>;
}

/// "Offline mode": username-only, no token exchange. Stands in for a real
/// Microsoft/Mojang auth flow, which is a Non-goal of this workspace.
pub struct OfflineAuthProvider {
    pub username: String,
}

#[async_trait(?Send)]
impl AuthProvider for OfflineAuthProvider {
    async fn authenticate(&self) -> Result<SessionCredentials, crate::ProxyError> {
        Ok(SessionCredentials {
            username: self.username.clone(),
            access_token: None,
            client_token: None,
        })
    }
}

use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AdminAuthError {
    #[error("invalid admin password")]
    InvalidPassword,
    #[error("IP address not allowed for admin access")]
    IpNotAllowed,
}

/// Shared-secret admin check with an optional IP allow-list.
///
/// An empty allow-list admits every address. Loopback is always admitted.
#[derive(Clone)]
pub struct AdminAuth {
    password: String,
    allowed_ips: Vec<String>,
}

impl AdminAuth {
    pub fn new(password: impl Into<String>, allowed_ips: Vec<String>) -> Self {
        Self {
            password: password.into(),
            allowed_ips,
        }
    }

    /// IP first, then password.
    pub fn authenticate(&self, ip: &str, password: &str) -> Result<(), AdminAuthError> {
        if !self.is_ip_allowed(ip) {
            return Err(AdminAuthError::IpNotAllowed);
        }
        if self.password.is_empty() || !secrets_match(password, &self.password) {
            return Err(AdminAuthError::InvalidPassword);
        }
        Ok(())
    }

    pub fn is_ip_allowed(&self, ip: &str) -> bool {
        if self.allowed_ips.is_empty() {
            return true;
        }
        if matches!(ip, "127.0.0.1" | "::1" | "localhost") {
            return true;
        }
        self.allowed_ips.iter().any(|allowed| allowed == ip)
    }
}

/// Compare digests so timing does not depend on where the inputs differ.
fn secrets_match(given: &str, expected: &str) -> bool {
    let a = Sha256::digest(given.as_bytes());
    let b = Sha256::digest(expected.as_bytes());
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

//! SASL authentication for `connection.start-ok`.
//!
//! Only the outcome contract matters to the rest of the broker: a mechanism
//! name and response bytes go in, a [`Principal`] or a failure reason comes out.

use std::collections::HashMap;
use std::fmt;
use tracing::{debug, warn};

use crate::acl::Principal;

pub const MECHANISM_PLAIN: &str = "PLAIN";
pub const MECHANISM_ANONYMOUS: &str = "ANONYMOUS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthenticationResult {
    Success(Principal),
    Failure(String),
}

pub trait Authenticator: Send + Sync + fmt::Debug {
    /// Mechanisms in preference order, as advertised in `connection.start`.
    fn mechanisms(&self) -> Vec<&'static str>;

    fn authenticate(&self, mechanism: &str, response: &[u8]) -> AuthenticationResult;
}

/// Checks PLAIN credentials against a fixed user map; optionally accepts
/// ANONYMOUS.
#[derive(Clone)]
pub struct UserDirectoryAuthenticator {
    users: HashMap<String, String>,
    allow_anonymous: bool,
}

impl fmt::Debug for UserDirectoryAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserDirectoryAuthenticator")
            .field("users", &self.users.len())
            .field("allow_anonymous", &self.allow_anonymous)
            .finish()
    }
}

impl UserDirectoryAuthenticator {
    pub fn new(users: HashMap<String, String>, allow_anonymous: bool) -> Self {
        Self {
            users,
            allow_anonymous,
        }
    }

    pub fn anonymous_only() -> Self {
        Self::new(HashMap::new(), true)
    }

    pub fn with_user(mut self, name: &str, password: &str) -> Self {
        self.users.insert(name.to_string(), password.to_string());
        self
    }

    /// PLAIN response: `[authzid] NUL authcid NUL passwd`.
    fn plain(&self, response: &[u8]) -> AuthenticationResult {
        let mut parts = response.split(|b| *b == 0);
        let (Some(_authzid), Some(user), Some(password), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return AuthenticationResult::Failure("malformed PLAIN response".to_string());
        };
        let (Ok(user), Ok(password)) = (std::str::from_utf8(user), std::str::from_utf8(password))
        else {
            return AuthenticationResult::Failure("PLAIN response is not UTF-8".to_string());
        };
        match self.users.get(user) {
            Some(expected) if expected == password => {
                debug!(user, "Authenticated");
                AuthenticationResult::Success(Principal::user(user))
            }
            _ => {
                warn!(user, "Authentication failed");
                AuthenticationResult::Failure(format!("authentication failed for user '{user}'"))
            }
        }
    }
}

impl Authenticator for UserDirectoryAuthenticator {
    fn mechanisms(&self) -> Vec<&'static str> {
        if self.allow_anonymous {
            vec![MECHANISM_PLAIN, MECHANISM_ANONYMOUS]
        } else {
            vec![MECHANISM_PLAIN]
        }
    }

    fn authenticate(&self, mechanism: &str, response: &[u8]) -> AuthenticationResult {
        match mechanism {
            MECHANISM_PLAIN => self.plain(response),
            MECHANISM_ANONYMOUS if self.allow_anonymous => {
                AuthenticationResult::Success(Principal::anonymous())
            }
            other => AuthenticationResult::Failure(format!("unsupported mechanism '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_checks_password() {
        let auth = UserDirectoryAuthenticator::new(HashMap::new(), false).with_user("guest", "guest");
        assert_eq!(
            auth.authenticate(MECHANISM_PLAIN, b"\0guest\0guest"),
            AuthenticationResult::Success(Principal::user("guest"))
        );
        assert!(matches!(
            auth.authenticate(MECHANISM_PLAIN, b"\0guest\0wrong"),
            AuthenticationResult::Failure(_)
        ));
        assert!(matches!(
            auth.authenticate(MECHANISM_PLAIN, b"guest"),
            AuthenticationResult::Failure(_)
        ));
    }

    #[test]
    fn anonymous_requires_opt_in() {
        let closed = UserDirectoryAuthenticator::new(HashMap::new(), false);
        assert!(matches!(
            closed.authenticate(MECHANISM_ANONYMOUS, b""),
            AuthenticationResult::Failure(_)
        ));
        assert_eq!(closed.mechanisms(), vec![MECHANISM_PLAIN]);

        let open = UserDirectoryAuthenticator::anonymous_only();
        assert_eq!(
            open.authenticate(MECHANISM_ANONYMOUS, b""),
            AuthenticationResult::Success(Principal::anonymous())
        );
    }
}

pub mod scram;
pub mod session;

pub use session::{AuthSession, SessionState};

use std::fmt;

/// Password of the device's fixed `user` account
///
/// Input only: never persisted and redacted in debug output.
#[derive(Clone)]
pub struct Credential {
    password: String,
}

impl Credential {
    pub const USERNAME: &'static str = "user";

    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
        }
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("password", &"***")
            .finish()
    }
}

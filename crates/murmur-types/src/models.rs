use serde::{Deserialize, Serialize};

/// The identity a token is issued for and that authenticated requests carry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub username: String,
    pub full_name: String,
}

/// Attached to requests that passed the access-token gate.
#[derive(Debug, Clone)]
pub struct Identity {
    pub username: String,
    pub full_name: String,
    pub access_token: String,
}

/// Attached to requests that passed the refresh-token gate.
#[derive(Debug, Clone)]
pub struct RefreshIdentity {
    pub username: String,
    pub full_name: String,
    pub refresh_token: String,
}

impl RefreshIdentity {
    pub fn subject(&self) -> Subject {
        Subject {
            username: self.username.clone(),
            full_name: self.full_name.clone(),
        }
    }
}

//! Optional bearer-token gate in front of the gateway.

use crate::protocol::Request;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Let the request through to dispatch
    Continue,
    /// The request was an auth message; answer `authAck`
    Acknowledged,
    /// Answer `unauthorized` and drop the request
    Unauthorized,
}

#[derive(Debug, Clone, Default)]
pub struct AuthGate {
    token: Option<String>,
}

impl AuthGate {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: token
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.token.is_some()
    }

    /// Screen `request` for a connection whose auth flag is `authenticated`.
    /// A matching auth message sets the flag.
    pub fn screen(&self, authenticated: &mut bool, request: &Request) -> AuthOutcome {
        let Some(expected) = &self.token else {
            return match request {
                Request::Auth { .. } => AuthOutcome::Acknowledged,
                _ => AuthOutcome::Continue,
            };
        };

        match request {
            Request::Auth { .. } if *authenticated => AuthOutcome::Acknowledged,
            Request::Auth { token } if token == expected => {
                *authenticated = true;
                AuthOutcome::Acknowledged
            }
            Request::Auth { .. } => AuthOutcome::Unauthorized,
            _ if *authenticated => AuthOutcome::Continue,
            _ => AuthOutcome::Unauthorized,
        }
    }
}

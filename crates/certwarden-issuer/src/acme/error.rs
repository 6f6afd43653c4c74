//! ACME error types

use thiserror::Error;

/// Errors that can occur during ACME operations
#[derive(Debug, Error)]
pub enum AcmeError {
    /// No account registered for the issuer yet
    #[error("ACME account for issuer {issuer} not registered")]
    NoAccount {
        /// Issuer key
        issuer: String,
    },

    /// Failed to create or load an account
    #[error("failed to register ACME account: {0}")]
    AccountRegistration(String),

    /// The server refused the request (RFC 8555 problem document)
    #[error("ACME server rejected the request: {detail}")]
    Rejected {
        /// Problem detail from the server
        detail: String,
    },

    /// Network or protocol transport failure
    #[error("ACME request failed: {0}")]
    Transport(String),

    /// The server's reply did not contain what the protocol requires
    #[error("unexpected ACME response: {0}")]
    Protocol(String),

    /// No configured solver can handle a name
    #[error("no solver configured for '{domain}'")]
    NoSolver {
        /// Name lacking a solver
        domain: String,
    },

    /// The server offered no challenge of the type the solver handles
    #[error("no {challenge_type} challenge offered for '{domain}'")]
    ChallengeUnavailable {
        /// Name being authorized
        domain: String,
        /// Wanted challenge type
        challenge_type: String,
    },

    /// DNS provider failure
    #[error("DNS provider error: {0}")]
    DnsProvider(String),

    /// Local verification of a presented challenge failed
    #[error("self check for '{domain}' failed: {message}")]
    SelfCheck {
        /// Name being checked
        domain: String,
        /// What was observed
        message: String,
    },
}

impl AcmeError {
    /// Whether the server explicitly refused; such failures are terminal
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }
}

impl From<instant_acme::Error> for AcmeError {
    fn from(e: instant_acme::Error) -> Self {
        match e {
            instant_acme::Error::Api(problem) => AcmeError::Rejected {
                detail: problem
                    .detail
                    .clone()
                    .unwrap_or_else(|| problem.to_string()),
            },
            other => AcmeError::Transport(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_rejections_are_terminal() {
        assert!(AcmeError::Rejected {
            detail: "invalid".to_string()
        }
        .is_rejection());
        assert!(!AcmeError::Transport("reset".to_string()).is_rejection());
        assert!(!AcmeError::SelfCheck {
            domain: "a.example.com".to_string(),
            message: "404".to_string()
        }
        .is_rejection());
    }
}

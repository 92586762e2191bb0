use crate::config::AuthConfig;
use crate::error::{Error, Result};
use crate::protocol::Credentials;
use std::collections::HashMap;

/// Who a session belongs to, as established by an [`IdentityVerifier`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Identity {
    pub username: Option<String>,
    /// Opaque token handed back to password principals.
    pub token: Option<String>,
}

impl Identity {
    pub fn anonymous() -> Self {
        Self::default()
    }
}

/// Checks a principal's credentials. Implementations may call out to an
/// identity provider; failures must not leak provider details to the client.
pub trait IdentityVerifier: Send + Sync {
    fn verify(&self, credentials: &Credentials) -> Result<Identity>;
}

/// Verifier backed by the `[auth]` config section.
#[derive(Debug, Clone, Default)]
pub struct StaticVerifier {
    allow_anonymous: bool,
    users: HashMap<String, String>,
    trusted_domains: HashMap<String, String>,
}

impl StaticVerifier {
    pub fn from_config(config: &AuthConfig) -> Self {
        Self {
            allow_anonymous: config.allow_anonymous,
            users: config.users.clone(),
            trusted_domains: config.trusted_domains.clone(),
        }
    }
}

impl IdentityVerifier for StaticVerifier {
    fn verify(&self, credentials: &Credentials) -> Result<Identity> {
        match credentials {
            Credentials::OAuth {
                username, password, ..
            } => match self.users.get(username) {
                Some(expected) if expected == password => Ok(Identity {
                    username: Some(username.clone()),
                    token: Some(uuid::Uuid::new_v4().simple().to_string()),
                }),
                _ => {
                    tracing::warn!(username = username.as_str(), "password verification failed");
                    Err(Error::Auth("invalid username or password".to_string()))
                }
            },
            Credentials::Controld { domain, signature } => {
                match self.trusted_domains.get(domain) {
                    Some(expected) if expected == signature => Ok(Identity::anonymous()),
                    _ => {
                        tracing::warn!(domain = domain.as_str(), "domain signature verification failed");
                        Err(Error::Auth("domain verification failed".to_string()))
                    }
                }
            }
            Credentials::Anonymous if self.allow_anonymous => Ok(Identity::anonymous()),
            Credentials::Anonymous => Err(Error::Auth(
                "anonymous connections are disabled".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::AuthType;

    fn verifier() -> StaticVerifier {
        let mut config = AuthConfig::default();
        config.users.insert("ann".into(), "secret".into());
        config.trusted_domains.insert("lab.example".into(), "sig-1".into());
        StaticVerifier::from_config(&config)
    }

    fn password(user: &str, pass: &str) -> Credentials {
        Credentials::OAuth {
            username: user.into(),
            password: pass.into(),
            auth_type: AuthType::Password,
        }
    }

    #[test]
    fn test_password_principal() {
        let identity = verifier().verify(&password("ann", "secret")).unwrap();
        assert_eq!(identity.username.as_deref(), Some("ann"));
        assert!(identity.token.is_some());
        assert!(matches!(
            verifier().verify(&password("ann", "nope")),
            Err(Error::Auth(_))
        ));
        assert!(matches!(
            verifier().verify(&password("bob", "secret")),
            Err(Error::Auth(_))
        ));
    }

    #[test]
    fn test_signed_domain_principal() {
        let ok = Credentials::Controld {
            domain: "lab.example".into(),
            signature: "sig-1".into(),
        };
        assert_eq!(verifier().verify(&ok).unwrap(), Identity::anonymous());
        let bad = Credentials::Controld {
            domain: "lab.example".into(),
            signature: "forged".into(),
        };
        assert!(matches!(verifier().verify(&bad), Err(Error::Auth(_))));
    }

    #[test]
    fn test_anonymous_can_be_disabled() {
        assert!(verifier().verify(&Credentials::Anonymous).is_ok());
        let strict = StaticVerifier::from_config(&AuthConfig {
            allow_anonymous: false,
            ..Default::default()
        });
        assert!(matches!(
            strict.verify(&Credentials::Anonymous),
            Err(Error::Auth(_))
        ));
    }
}

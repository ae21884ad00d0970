use crate::domain_model::SessionId;

/// Derives backend keys from session ids under a fixed namespace.
#[derive(Debug, Clone)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        KeySpace {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn session(&self, id: &SessionId) -> String {
        format!("{}:{}", self.prefix, id)
    }

    /// Locks live under `<prefix>-lock:`, so no session id can name one.
    pub fn lock(&self, id: &SessionId) -> String {
        format!("{}-lock:{}", self.prefix, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_and_lock_keys_differ() {
        let keys = KeySpace::new("_oauth2_proxy");
        let id = SessionId("abc".into());
        assert_eq!(keys.session(&id), "_oauth2_proxy:abc");
        assert_eq!(keys.lock(&id), "_oauth2_proxy-lock:abc");
    }

    #[test]
    fn test_lock_key_never_matches_a_session_key() {
        let keys = KeySpace::new("_oauth2_proxy");
        let plain = SessionId("abc".into());
        let lookalike = SessionId("abc.lock".into());
        assert_ne!(keys.session(&lookalike), keys.lock(&plain));

        let shaped_like_lock: SessionId = "-lock:abc".parse().unwrap();
        assert_ne!(keys.session(&shaped_like_lock), keys.lock(&plain));
    }
}

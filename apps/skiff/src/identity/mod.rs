//! Identity resolution: which principal is attached to the bridge.
//!
//! Two mutually exclusive strategies, selected by configuration. The
//! service-backed strategy bootstraps anonymous sessions against the external
//! auth service and can elevate to an admin principal; the static strategy
//! serves deployments without an auth service, comparing a configured admin
//! pair locally and using the fingerprint itself as the anonymous id.

pub mod fingerprint;
pub mod store;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use url::Url;
use uuid::Uuid;

pub use fingerprint::{EnvironmentProbe, fingerprint};
pub use store::{Avatar, SessionStore, StoredSession};

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("network failure: {0}")]
    Network(String),
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("session storage failure: {0}")]
    Storage(String),
}

/// Identity strategy selector.
#[derive(Debug, Clone)]
pub enum AuthMode {
    /// Anonymous bootstrap and admin login go through the auth service.
    Service { base_url: Url },
    /// No auth service: a configured admin identifier/secret pair.
    StaticAdmin { account: String, secret: String },
}

/// The principal stamped on outgoing frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    Anonymous {
        user_id: String,
        token: Option<String>,
        avatar: Option<Avatar>,
    },
    Admin {
        master_id: String,
        token: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub principal: Principal,
}

impl Session {
    pub fn anonymous(user_id: String, token: Option<String>, avatar: Option<Avatar>) -> Self {
        Self {
            principal: Principal::Anonymous {
                user_id,
                token,
                avatar,
            },
        }
    }

    pub fn admin(master_id: String, token: Option<String>) -> Self {
        Self {
            principal: Principal::Admin { master_id, token },
        }
    }

    pub fn user_id(&self) -> &str {
        match &self.principal {
            Principal::Anonymous { user_id, .. } => user_id,
            Principal::Admin { master_id, .. } => master_id,
        }
    }

    /// Nickname shown on outgoing frames and friend-list answers.
    pub fn nickname(&self) -> &'static str {
        if self.is_admin() { "admin" } else { "user" }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self.principal, Principal::Admin { .. })
    }
}

#[derive(Debug, Serialize)]
struct InitUserRequest<'a> {
    fingerprint: &'a str,
    timestamp: i64,
}

#[derive(Debug, Deserialize)]
pub struct InitUserResponse {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, rename = "userId")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub avatar: Option<Avatar>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default, rename = "isNew")]
    pub is_new: bool,
}

#[derive(Debug, Deserialize)]
pub struct VerifyResponse {
    #[serde(default)]
    pub valid: bool,
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default, rename = "realMasterQQ")]
    pub real_master: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MasterLoginResponse {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default, rename = "realMasterQQ")]
    pub real_master: Option<String>,
}

/// HTTP surface of the external auth service.
#[async_trait]
pub trait AuthBackend: Send + Sync {
    async fn init_user(
        &self,
        base: &Url,
        fingerprint: &str,
        timestamp_ms: i64,
        token: Option<&str>,
    ) -> Result<InitUserResponse, AuthError>;

    async fn verify_token(&self, base: &Url, token: &str) -> Result<VerifyResponse, AuthError>;

    async fn master_login(
        &self,
        base: &Url,
        account: &str,
        password: &str,
    ) -> Result<MasterLoginResponse, AuthError>;

    async fn logout(&self, base: &Url, token: &str) -> Result<(), AuthError>;
}

struct ReqwestAuthBackend {
    client: reqwest::Client,
}

impl ReqwestAuthBackend {
    fn new() -> Result<Self, AuthError> {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(3))
            .timeout(std::time::Duration::from_secs(8))
            .build()
            .map_err(|err| AuthError::Network(err.to_string()))?;
        Ok(Self { client })
    }

    fn request_id() -> String {
        format!("req_{}", Uuid::new_v4().simple())
    }
}

fn endpoint(base: &Url, path: &str) -> String {
    format!(
        "{}/{}",
        base.as_str().trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[async_trait]
impl AuthBackend for ReqwestAuthBackend {
    async fn init_user(
        &self,
        base: &Url,
        fingerprint: &str,
        timestamp_ms: i64,
        token: Option<&str>,
    ) -> Result<InitUserResponse, AuthError> {
        let mut builder = self
            .client
            .post(endpoint(base, "api/user/init"))
            .header("x-request-id", Self::request_id())
            .json(&InitUserRequest {
                fingerprint,
                timestamp: timestamp_ms,
            });
        if let Some(token) = token {
            builder = builder.header("x-auth-token", token);
        }
        let response = builder
            .send()
            .await
            .map_err(|err| AuthError::Network(err.to_string()))?;
        if !response.status().is_success() {
            return Err(AuthError::Network(format!(
                "user init returned http {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|err| AuthError::InvalidResponse(err.to_string()))
    }

    async fn verify_token(&self, base: &Url, token: &str) -> Result<VerifyResponse, AuthError> {
        let response = self
            .client
            .get(endpoint(base, "auth/verify"))
            .header("x-request-id", Self::request_id())
            .query(&[("token", token)])
            .send()
            .await
            .map_err(|err| AuthError::Network(err.to_string()))?;
        if !response.status().is_success() {
            // A rejected verification is a demotion signal, not a failure.
            return Ok(VerifyResponse {
                valid: false,
                account: None,
                real_master: None,
            });
        }
        response
            .json()
            .await
            .map_err(|err| AuthError::InvalidResponse(err.to_string()))
    }

    async fn master_login(
        &self,
        base: &Url,
        account: &str,
        password: &str,
    ) -> Result<MasterLoginResponse, AuthError> {
        let response = self
            .client
            .post(endpoint(base, "auth/master"))
            .header("x-request-id", Self::request_id())
            .json(&serde_json::json!({ "account": account, "password": password }))
            .send()
            .await
            .map_err(|err| AuthError::Network(err.to_string()))?;
        if !response.status().is_success() {
            return Err(AuthError::Network(format!(
                "admin login returned http {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|err| AuthError::InvalidResponse(err.to_string()))
    }

    async fn logout(&self, base: &Url, token: &str) -> Result<(), AuthError> {
        self.client
            .post(endpoint(base, "auth/logout"))
            .header("x-request-id", Self::request_id())
            .json(&serde_json::json!({ "token": token }))
            .send()
            .await
            .map_err(|err| AuthError::Network(err.to_string()))?;
        Ok(())
    }
}

/// Outcome of a resolution: the session plus human-readable status notes the
/// bridge surfaces to the embedder.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub session: Session,
    pub notices: Vec<String>,
}

pub struct IdentityResolver {
    mode: AuthMode,
    backend: Arc<dyn AuthBackend>,
    store: SessionStore,
    probe: EnvironmentProbe,
}

impl IdentityResolver {
    pub fn new(mode: AuthMode, store: SessionStore) -> Result<Self, AuthError> {
        Ok(Self {
            mode,
            backend: Arc::new(ReqwestAuthBackend::new()?),
            store,
            probe: EnvironmentProbe::detect(),
        })
    }

    #[cfg(test)]
    fn with_backend(mode: AuthMode, store: SessionStore, backend: Arc<dyn AuthBackend>) -> Self {
        Self {
            mode,
            backend,
            store,
            probe: EnvironmentProbe::detect(),
        }
    }

    /// Replace the detected environment probe; embedders with a real user
    /// agent or screen should call this before the first resolution.
    pub fn with_probe(mut self, probe: EnvironmentProbe) -> Self {
        self.probe = probe;
        self
    }

    /// Resolve the session to run under. A stored admin token is verified
    /// lazily and demoted silently on invalidation; otherwise the anonymous
    /// strategy bootstraps (or recognizes) a session.
    pub async fn resolve(&self) -> Result<Resolved, AuthError> {
        let mut notices = Vec::new();
        let stored = self.store.load()?;

        if let Some(token) = stored.admin_token.clone() {
            if let Some(session) = self.verify_admin(&token, &mut notices).await? {
                return Ok(Resolved { session, notices });
            }
            self.store.update(|session| session.admin_token = None)?;
            notices.push("admin token no longer valid; continuing as anonymous user".to_string());
        }

        let session = self.resolve_anonymous(&stored, &mut notices).await?;
        Ok(Resolved { session, notices })
    }

    async fn verify_admin(
        &self,
        token: &str,
        notices: &mut Vec<String>,
    ) -> Result<Option<Session>, AuthError> {
        match &self.mode {
            AuthMode::Service { base_url } => {
                match self.backend.verify_token(base_url, token).await {
                    Ok(verify) if verify.valid => {
                        let master_id = verify.real_master.ok_or_else(|| {
                            AuthError::InvalidResponse(
                                "verify response missing master id".to_string(),
                            )
                        })?;
                        notices.push("admin token accepted; admin mode enabled".to_string());
                        Ok(Some(Session::admin(master_id, Some(token.to_string()))))
                    }
                    Ok(_) => Ok(None),
                    Err(err) => {
                        // The original clears the token on any verify failure;
                        // keep that so a flaky service cannot wedge startup.
                        tracing::warn!(target: "skiff::identity", error = %err, "admin token verification failed");
                        Ok(None)
                    }
                }
            }
            AuthMode::StaticAdmin { account, secret } => {
                if token == secret {
                    notices.push("admin token accepted; admin mode enabled".to_string());
                    Ok(Some(Session::admin(account.clone(), Some(token.to_string()))))
                } else {
                    Ok(None)
                }
            }
        }
    }

    async fn resolve_anonymous(
        &self,
        stored: &StoredSession,
        notices: &mut Vec<String>,
    ) -> Result<Session, AuthError> {
        let fingerprint = fingerprint(&self.probe);
        match &self.mode {
            AuthMode::Service { base_url } => {
                let response = self
                    .backend
                    .init_user(
                        base_url,
                        &fingerprint,
                        now_ms(),
                        stored.user_token.as_deref(),
                    )
                    .await?;
                if !response.success {
                    return Err(AuthError::InvalidResponse(
                        response
                            .message
                            .unwrap_or_else(|| "user init rejected".to_string()),
                    ));
                }
                let user_id = response.user_id.ok_or_else(|| {
                    AuthError::InvalidResponse("init response missing user id".to_string())
                })?;
                let token = response.token.ok_or_else(|| {
                    AuthError::InvalidResponse("init response missing token".to_string())
                })?;
                let avatar = response.avatar.clone();
                self.store.update(|session| {
                    session.user_token = Some(token.clone());
                    session.user_id = Some(user_id.clone());
                    session.avatar = avatar.clone();
                })?;
                notices.push(if response.is_new {
                    format!("welcome! new session id {user_id}")
                } else {
                    format!("welcome back, {user_id}")
                });
                Ok(Session::anonymous(user_id, Some(token), response.avatar))
            }
            AuthMode::StaticAdmin { .. } => {
                // No init service in this deployment: the fingerprint is the id.
                Ok(Session::anonymous(fingerprint, None, None))
            }
        }
    }

    /// Exchange credentials for an admin session and persist the token.
    pub async fn login_admin(&self, account: &str, password: &str) -> Result<Resolved, AuthError> {
        match &self.mode {
            AuthMode::Service { base_url } => {
                let response = self.backend.master_login(base_url, account, password).await?;
                if !response.success {
                    return Err(AuthError::InvalidCredentials(
                        response
                            .message
                            .unwrap_or_else(|| "account or password incorrect".to_string()),
                    ));
                }
                let token = response.token.ok_or_else(|| {
                    AuthError::InvalidResponse("login response missing token".to_string())
                })?;
                let master_id = response.real_master.ok_or_else(|| {
                    AuthError::InvalidResponse("login response missing master id".to_string())
                })?;
                self.store
                    .update(|session| session.admin_token = Some(token.clone()))?;
                Ok(Resolved {
                    session: Session::admin(master_id, Some(token)),
                    notices: vec!["admin login successful".to_string()],
                })
            }
            AuthMode::StaticAdmin {
                account: expected_account,
                secret,
            } => {
                if account == expected_account && password == secret {
                    self.store
                        .update(|session| session.admin_token = Some(secret.clone()))?;
                    Ok(Resolved {
                        session: Session::admin(account.to_string(), Some(secret.clone())),
                        notices: vec!["admin login successful".to_string()],
                    })
                } else {
                    Err(AuthError::InvalidCredentials(
                        "account or password incorrect".to_string(),
                    ))
                }
            }
        }
    }

    /// Invalidate the admin token server-side (best effort, fire and forget)
    /// and clear local state synchronously regardless of the network outcome.
    pub fn logout(&self) -> Result<(), AuthError> {
        let stored = self.store.load()?;
        if let (AuthMode::Service { base_url }, Some(token)) =
            (&self.mode, stored.admin_token.clone())
        {
            let backend = Arc::clone(&self.backend);
            let base_url = base_url.clone();
            tokio::spawn(async move {
                if let Err(err) = backend.logout(&base_url, &token).await {
                    tracing::debug!(target: "skiff::identity", error = %err, "logout request failed");
                }
            });
        }
        self.store.update(|session| session.admin_token = None)?;
        Ok(())
    }
}

fn now_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockAuthBackend {
        valid_admin_token: Option<String>,
        master_id: Option<String>,
        admin_password: Option<String>,
        init_fails: bool,
        known_user: Option<(String, String)>,
        init_tokens_seen: Mutex<Vec<Option<String>>>,
        logouts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AuthBackend for MockAuthBackend {
        async fn init_user(
            &self,
            _base: &Url,
            _fingerprint: &str,
            _timestamp_ms: i64,
            token: Option<&str>,
        ) -> Result<InitUserResponse, AuthError> {
            self.init_tokens_seen
                .lock()
                .unwrap()
                .push(token.map(str::to_string));
            if self.init_fails {
                return Ok(InitUserResponse {
                    success: false,
                    message: Some("service unavailable".into()),
                    user_id: None,
                    avatar: None,
                    token: None,
                    is_new: false,
                });
            }
            let recognized = matches!(
                (token, &self.known_user),
                (Some(seen), Some((_, expected))) if seen == expected.as_str()
            );
            let user_id = self
                .known_user
                .as_ref()
                .map(|(id, _)| id.clone())
                .unwrap_or_else(|| "u-new".to_string());
            Ok(InitUserResponse {
                success: true,
                message: None,
                user_id: Some(user_id),
                avatar: Some(Avatar {
                    url: Some("https://cdn.example/a.png".into()),
                }),
                token: Some("anon-token".into()),
                is_new: !recognized,
            })
        }

        async fn verify_token(&self, _base: &Url, token: &str) -> Result<VerifyResponse, AuthError> {
            let valid = self.valid_admin_token.as_deref() == Some(token);
            Ok(VerifyResponse {
                valid,
                account: valid.then(|| "root".to_string()),
                real_master: valid.then(|| self.master_id.clone().unwrap_or_default()),
            })
        }

        async fn master_login(
            &self,
            _base: &Url,
            _account: &str,
            password: &str,
        ) -> Result<MasterLoginResponse, AuthError> {
            if self.admin_password.as_deref() == Some(password) {
                Ok(MasterLoginResponse {
                    success: true,
                    message: None,
                    token: Some("fresh-admin-token".into()),
                    real_master: self.master_id.clone(),
                })
            } else {
                Ok(MasterLoginResponse {
                    success: false,
                    message: Some("account or password incorrect".into()),
                    token: None,
                    real_master: None,
                })
            }
        }

        async fn logout(&self, _base: &Url, token: &str) -> Result<(), AuthError> {
            self.logouts.lock().unwrap().push(token.to_string());
            Ok(())
        }
    }

    fn service_mode() -> AuthMode {
        AuthMode::Service {
            base_url: Url::parse("https://auth.example.com").unwrap(),
        }
    }

    fn resolver(backend: MockAuthBackend) -> (tempfile::TempDir, Arc<MockAuthBackend>, IdentityResolver) {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::at(dir.path().join("session.toml"));
        let backend = Arc::new(backend);
        let shared: Arc<dyn AuthBackend> = backend.clone();
        let resolver = IdentityResolver::with_backend(service_mode(), store, shared);
        (dir, backend, resolver)
    }

    #[tokio::test]
    async fn valid_admin_token_enters_admin_mode_directly() {
        let backend = MockAuthBackend {
            valid_admin_token: Some("tok-admin".into()),
            master_id: Some("9000".into()),
            ..Default::default()
        };
        let (_dir, backend, resolver) = resolver(backend);
        resolver
            .store
            .update(|session| session.admin_token = Some("tok-admin".into()))
            .unwrap();

        let resolved = resolver.resolve().await.unwrap();
        assert!(resolved.session.is_admin());
        assert_eq!(resolved.session.user_id(), "9000");
        assert_eq!(resolved.session.nickname(), "admin");
        // No anonymous bootstrap happened.
        assert!(backend.init_tokens_seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_admin_token_is_cleared_and_demotes_to_anonymous() {
        let backend = MockAuthBackend {
            valid_admin_token: Some("other".into()),
            ..Default::default()
        };
        let (_dir, backend, resolver) = resolver(backend);
        resolver
            .store
            .update(|session| session.admin_token = Some("stale".into()))
            .unwrap();

        let resolved = resolver.resolve().await.unwrap();
        assert!(!resolved.session.is_admin());
        assert_eq!(resolver.store.load().unwrap().admin_token, None);
        // The anonymous bootstrap proceeded after the demotion.
        assert_eq!(backend.init_tokens_seen.lock().unwrap().len(), 1);
        assert!(
            resolved
                .notices
                .iter()
                .any(|notice| notice.contains("no longer valid"))
        );
    }

    #[tokio::test]
    async fn anonymous_bootstrap_persists_session_and_reuses_token() {
        let backend = MockAuthBackend {
            known_user: Some(("u-42".into(), "anon-token".into())),
            ..Default::default()
        };
        let (_dir, backend, resolver) = resolver(backend);

        let first = resolver.resolve().await.unwrap();
        assert_eq!(first.session.user_id(), "u-42");
        assert!(first.notices.iter().any(|n| n.contains("welcome!")));

        let stored = resolver.store.load().unwrap();
        assert_eq!(stored.user_token.as_deref(), Some("anon-token"));
        assert_eq!(stored.user_id.as_deref(), Some("u-42"));

        let second = resolver.resolve().await.unwrap();
        assert!(second.notices.iter().any(|n| n.contains("welcome back")));
        // The stored token rode along on the second init call.
        assert_eq!(
            backend.init_tokens_seen.lock().unwrap().as_slice(),
            [None, Some("anon-token".to_string())]
        );
    }

    #[tokio::test]
    async fn failed_bootstrap_leaves_stored_state_untouched() {
        let backend = MockAuthBackend {
            init_fails: true,
            ..Default::default()
        };
        let (_dir, _backend, resolver) = resolver(backend);
        resolver
            .store
            .update(|session| {
                session.user_token = Some("prior-token".into());
                session.user_id = Some("prior-user".into());
            })
            .unwrap();

        let err = resolver.resolve().await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidResponse(_)));
        let stored = resolver.store.load().unwrap();
        assert_eq!(stored.user_token.as_deref(), Some("prior-token"));
        assert_eq!(stored.user_id.as_deref(), Some("prior-user"));
    }

    #[tokio::test]
    async fn admin_login_stores_token_and_wrong_password_is_typed() {
        let backend = MockAuthBackend {
            master_id: Some("9000".into()),
            admin_password: Some("hunter2".into()),
            ..Default::default()
        };
        let (_dir, _backend, resolver) = resolver(backend);

        let err = resolver.login_admin("root", "wrong").await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials(_)));
        assert_eq!(resolver.store.load().unwrap().admin_token, None);

        let resolved = resolver.login_admin("root", "hunter2").await.unwrap();
        assert!(resolved.session.is_admin());
        assert_eq!(
            resolver.store.load().unwrap().admin_token.as_deref(),
            Some("fresh-admin-token")
        );
    }

    #[tokio::test]
    async fn logout_clears_local_state_synchronously() {
        let backend = MockAuthBackend::default();
        let (_dir, backend, resolver) = resolver(backend);
        resolver
            .store
            .update(|session| session.admin_token = Some("tok".into()))
            .unwrap();

        resolver.logout().unwrap();
        assert_eq!(resolver.store.load().unwrap().admin_token, None);

        // The fire-and-forget invalidation still reaches the service.
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        assert_eq!(backend.logouts.lock().unwrap().as_slice(), ["tok"]);
    }

    #[tokio::test]
    async fn static_mode_resolves_fingerprint_and_checks_pair_locally() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::at(dir.path().join("session.toml"));
        let resolver = IdentityResolver::with_backend(
            AuthMode::StaticAdmin {
                account: "9000".into(),
                secret: "s3cret".into(),
            },
            store,
            Arc::new(MockAuthBackend::default()),
        );

        let resolved = resolver.resolve().await.unwrap();
        assert!(!resolved.session.is_admin());
        assert!(!resolved.session.user_id().is_empty());

        assert!(resolver.login_admin("9000", "nope").await.is_err());
        let admin = resolver.login_admin("9000", "s3cret").await.unwrap();
        assert_eq!(admin.session.user_id(), "9000");

        // The stored secret now short-circuits the next resolution.
        let resolved = resolver.resolve().await.unwrap();
        assert!(resolved.session.is_admin());
    }
}

//! Admin login with bcrypt.
//!
//! Admin accounts are read through the router, so the remote table is used
//! when reachable and the mirrored copy otherwise. Passwords are held in
//! zeroizing buffers and never logged.

use serde::Serialize;
use std::sync::Mutex;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::error::{CoreError, Result};
use crate::model::{from_row, Admin};
use crate::query::{Operation, Select, Table};
use crate::router::QueryRouter;

const INVALID_CREDENTIALS: &str = "Invalid username or password";

/// The signed-in admin, as exposed to the UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuthenticatedAdmin {
    pub id: i64,
    pub username: String,
    pub photo: Option<String>,
}

/// Current admin session.
#[derive(Default)]
pub struct AuthState {
    current: Mutex<Option<AuthenticatedAdmin>>,
}

impl AuthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_admin(&self) -> Option<AuthenticatedAdmin> {
        self.current.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

/// Verify `password` against the stored hash for `username`.
///
/// Unknown users and wrong passwords get the same error.
pub async fn login(
    router: &QueryRouter,
    auth: &AuthState,
    username: &str,
    password: Zeroizing<String>,
) -> Result<AuthenticatedAdmin> {
    let username = username.trim();
    if username.is_empty() || password.is_empty() {
        return Err(CoreError::Auth("Username and password are required".into()));
    }

    let op = Operation::Select(Select::new(Table::Admins).filter("username", username).limit(1));
    let rows = router.route(&op).await?.into_rows()?;
    let Some(row) = rows.first() else {
        warn!(username, "Login failed: unknown user");
        return Err(CoreError::Auth(INVALID_CREDENTIALS.into()));
    };
    let admin: Admin = from_row(row)?;

    if !bcrypt::verify(password.as_str(), &admin.password).unwrap_or(false) {
        warn!(username, "Login failed: wrong password");
        return Err(CoreError::Auth(INVALID_CREDENTIALS.into()));
    }

    let session = AuthenticatedAdmin {
        id: admin.id,
        username: admin.username,
        photo: admin.photo,
    };
    *auth.current.lock().unwrap_or_else(|p| p.into_inner()) = Some(session.clone());
    info!(admin_id = session.id, "Admin login successful");
    Ok(session)
}

/// Clear the current session.
pub fn logout(auth: &AuthState) {
    let mut current = auth.current.lock().unwrap_or_else(|p| p.into_inner());
    if let Some(admin) = current.take() {
        info!(admin_id = admin.id, "Admin logged out");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::LocalStore;
    use crate::testing::FakeRemote;
    use std::sync::Arc;
    use std::time::Duration;

    fn admin(password: &str) -> Admin {
        Admin {
            id: 3,
            username: "manager".into(),
            password: bcrypt::hash(password, 4).expect("hash test password"),
            photo: Some("uploads/manager.png".into()),
        }
    }

    fn router(remote: &Arc<FakeRemote>) -> QueryRouter {
        let local = Arc::new(LocalStore::open_in_memory().expect("local store"));
        QueryRouter::new(remote.clone(), local, Duration::from_millis(200))
    }

    fn secret(s: &str) -> Zeroizing<String> {
        Zeroizing::new(s.to_string())
    }

    #[tokio::test]
    async fn login_against_remote_admins() {
        let remote = FakeRemote::new();
        remote.store.replace_admins(&[admin("1234")]).expect("seed");
        let router = router(&remote);
        let auth = AuthState::new();

        let who = login(&router, &auth, "manager", secret("1234"))
            .await
            .expect("login");
        assert_eq!(who.id, 3);
        assert_eq!(who.photo.as_deref(), Some("uploads/manager.png"));
        assert_eq!(auth.current_admin(), Some(who));

        logout(&auth);
        assert_eq!(auth.current_admin(), None);
    }

    #[tokio::test]
    async fn login_offline_uses_mirrored_admins() {
        let remote = FakeRemote::new();
        remote.set_online(false);
        let router = router(&remote);
        router.local().replace_admins(&[admin("1234")]).expect("mirror");
        let auth = AuthState::new();

        login(&router, &auth, "manager", secret("1234"))
            .await
            .expect("offline login");
    }

    #[tokio::test]
    async fn wrong_password_and_unknown_user_look_the_same() {
        let remote = FakeRemote::new();
        remote.store.replace_admins(&[admin("1234")]).expect("seed");
        let router = router(&remote);
        let auth = AuthState::new();

        let wrong = login(&router, &auth, "manager", secret("9999"))
            .await
            .expect_err("wrong password");
        let unknown = login(&router, &auth, "nobody", secret("1234"))
            .await
            .expect_err("unknown user");
        assert_eq!(wrong.to_string(), unknown.to_string());
        assert!(matches!(wrong, CoreError::Auth(_)));
        assert_eq!(auth.current_admin(), None);

        let empty = login(&router, &auth, "  ", secret("1234")).await.unwrap_err();
        assert!(matches!(empty, CoreError::Auth(_)));
    }
}

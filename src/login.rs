use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
#[cfg(feature = "web")]
use axum::{
    Form, Json,
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
#[cfg(feature = "web")]
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::RwLock;
use std::time::{Duration, SystemTime};
#[cfg(feature = "web")]
use std::sync::Arc;
use uuid::Uuid;

#[cfg(feature = "web")]
use crate::app::AppState;
#[cfg(feature = "web")]
use crate::error::AppError;
use crate::error::{AuthError, StoreError};
use crate::source::{read_json, write_json_atomic};

/// Name of the cookie carrying the session id
pub const SESSION_COOKIE: &str = "session";

const MIN_PASSWORD_LEN: usize = 6;

/// User data structure representing a registered application user
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct User {
    /// Username, also the owner id of the user's data source
    pub username: String,

    /// Email address
    pub email: String,

    /// Name shown on the dashboard
    #[serde(default)]
    pub display_name: String,

    /// Argon2 hash of the user's password
    pub password_hash: String,
}

/// Credential data for login and registration
#[derive(Debug, Serialize, Deserialize)]
pub struct UserCredentials {
    /// Username for login/registration
    pub username: String,

    /// Email address (optional for login, required for registration)
    #[serde(default)]
    pub email: String,

    /// Password in plaintext (only transmitted, never stored)
    pub password: String,
}

/// Public view of a user, without the password hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub username: String,
    pub email: String,
    pub display_name: String,
}

impl From<&User> for Profile {
    fn from(user: &User) -> Self {
        Self {
            username: user.username.clone(),
            email: user.email.clone(),
            display_name: user.display_name.clone(),
        }
    }
}

/// Profile fields a user may change
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ProfileUpdate {
    pub email: Option<String>,
    pub display_name: Option<String>,
}

/// Password change request data
#[derive(Debug, Serialize, Deserialize)]
pub struct PasswordChangeRequest {
    /// Current password for verification
    pub old_password: String,

    /// New password to set
    pub new_password: String,

    /// Confirmation of the new password (must match new_password)
    pub confirm_password: String,
}

/// Check that `username` can double as an owner id in upload filenames
///
/// Only ASCII letters, digits and `-` are allowed so that the `_` in
/// `{owner}_{timestamp}.{ext}` stays unambiguous.
pub fn validate_username(username: &str) -> Result<(), AuthError> {
    let valid_chars = username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-');
    if !(3..=32).contains(&username.len()) || !valid_chars {
        return Err(AuthError::InvalidInput(
            "Username must be 3-32 letters, digits or '-'".to_string(),
        ));
    }
    Ok(())
}

fn validate_password(password: &str) -> Result<(), AuthError> {
    if password.len() < MIN_PASSWORD_LEN {
        return Err(AuthError::InvalidInput(format!(
            "Password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    Ok(())
}

fn validate_email(email: &str) -> Result<(), AuthError> {
    let trimmed = email.trim();
    match trimmed.split_once('@') {
        Some((local, domain)) if !local.is_empty() && domain.contains('.') => Ok(()),
        _ => Err(AuthError::InvalidInput("A valid email is required".to_string())),
    }
}

/// Hash a password
///
/// Uses Argon2 with a random salt to securely hash a password.
fn hash_password(password: &str) -> Result<String, AuthError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AuthError::Hash(e.to_string()))
}

/// Verify a password against a hash
fn verify_password(password: &str, hash: &str) -> Result<bool, AuthError> {
    let parsed_hash = PasswordHash::new(hash).map_err(|e| AuthError::Hash(e.to_string()))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}

/// Registered users, persisted as a JSON object keyed by username
pub struct UserStore {
    path: PathBuf,
    lock: RwLock<()>,
}

impl UserStore {
    /// Open the users file, creating it (and its directory) if needed
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|source| StoreError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        if !path.exists() {
            write_json_atomic(&path, &HashMap::<String, User>::new())?;
        }
        Ok(Self {
            path,
            lock: RwLock::new(()),
        })
    }

    fn load(&self) -> Result<HashMap<String, User>, StoreError> {
        read_json(&self.path)
    }

    /// Look up a user by name
    pub fn get(&self, username: &str) -> Result<Option<User>, AuthError> {
        let _guard = self.lock.read().map_err(|_| StoreError::Poisoned)?;
        Ok(self.load()?.remove(username))
    }

    /// Register a new user
    ///
    /// # Errors
    /// * `InvalidInput` for a malformed username, email or short password
    /// * `UserExists` when the username is taken
    pub fn register(&self, username: &str, email: &str, password: &str) -> Result<User, AuthError> {
        validate_username(username)?;
        validate_email(email)?;
        validate_password(password)?;

        let _guard = self.lock.write().map_err(|_| StoreError::Poisoned)?;
        let mut users = self.load()?;
        if users.contains_key(username) {
            return Err(AuthError::UserExists);
        }

        let user = User {
            username: username.to_string(),
            email: email.trim().to_string(),
            display_name: username.to_string(),
            password_hash: hash_password(password)?,
        };
        users.insert(username.to_string(), user.clone());
        write_json_atomic(&self.path, &users)?;
        log::info!("registered user {username}");
        Ok(user)
    }

    /// Check a username/password pair
    pub fn verify(&self, username: &str, password: &str) -> Result<User, AuthError> {
        let user = self.get(username)?.ok_or(AuthError::InvalidCredentials)?;
        if verify_password(password, &user.password_hash)? {
            Ok(user)
        } else {
            Err(AuthError::InvalidCredentials)
        }
    }

    /// Apply a profile update and return the new profile
    pub fn update_profile(&self, username: &str, update: ProfileUpdate) -> Result<Profile, AuthError> {
        if let Some(email) = &update.email {
            validate_email(email)?;
        }

        let _guard = self.lock.write().map_err(|_| StoreError::Poisoned)?;
        let mut users = self.load()?;
        let user = users.get_mut(username).ok_or(AuthError::UserNotFound)?;
        if let Some(email) = update.email {
            user.email = email.trim().to_string();
        }
        if let Some(name) = update.display_name {
            let name = name.trim();
            user.display_name = if name.is_empty() { username.to_string() } else { name.to_string() };
        }
        let profile = Profile::from(&*user);
        write_json_atomic(&self.path, &users)?;
        Ok(profile)
    }

    /// Change a password after verifying the current one
    pub fn change_password(&self, username: &str, request: &PasswordChangeRequest) -> Result<(), AuthError> {
        if request.new_password != request.confirm_password {
            return Err(AuthError::InvalidInput("New passwords don't match".to_string()));
        }
        validate_password(&request.new_password)?;

        let _guard = self.lock.write().map_err(|_| StoreError::Poisoned)?;
        let mut users = self.load()?;
        let user = users.get_mut(username).ok_or(AuthError::UserNotFound)?;
        if !verify_password(&request.old_password, &user.password_hash)? {
            return Err(AuthError::InvalidCredentials);
        }
        user.password_hash = hash_password(&request.new_password)?;
        write_json_atomic(&self.path, &users)?;
        log::info!("password changed for {username}");
        Ok(())
    }
}

/// User session data
#[derive(Debug, Clone)]
pub struct Session {
    /// Username of the authenticated user
    pub user_id: String,

    /// Time when the session expires
    pub expires_at: SystemTime,
}

/// Active sessions, keyed by session id
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Session>>,
    duration: Duration,
}

impl SessionStore {
    pub fn new(duration: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            duration,
        }
    }

    /// Start a session for `username` and return its id
    pub fn create(&self, username: &str) -> Result<String, StoreError> {
        let session_id = Uuid::new_v4().to_string();
        let session = Session {
            user_id: username.to_string(),
            expires_at: SystemTime::now() + self.duration,
        };
        let mut sessions = self.sessions.write().map_err(|_| StoreError::Poisoned)?;
        sessions.retain(|_, s| s.expires_at > SystemTime::now());
        sessions.insert(session_id.clone(), session);
        Ok(session_id)
    }

    /// Username of a live session
    pub fn validate(&self, session_id: &str) -> Option<String> {
        let sessions = self.sessions.read().ok()?;
        sessions
            .get(session_id)
            .filter(|session| session.expires_at > SystemTime::now())
            .map(|session| session.user_id.clone())
    }

    /// End a session; unknown ids are ignored
    pub fn revoke(&self, session_id: &str) {
        if let Ok(mut sessions) = self.sessions.write() {
            sessions.remove(session_id);
        }
    }
}

/// The user a request was authenticated as
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentUser(pub String);

impl CurrentUser {
    /// Refuse access to data owned by someone else
    pub fn require_owner(&self, owner_id: &str) -> Result<(), crate::error::AppError> {
        if self.0 == owner_id {
            Ok(())
        } else {
            Err(crate::error::AppError::Forbidden)
        }
    }
}

// Web handler functions below (only compiled with "web" feature)

/// Authentication middleware
///
/// Rejects requests without a live session and stores the session's user as
/// a [`CurrentUser`] request extension.
#[cfg(feature = "web")]
pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    mut request: Request,
    next: Next,
) -> Response {
    let user = jar
        .get(SESSION_COOKIE)
        .and_then(|cookie| state.sessions.validate(cookie.value()));

    match user {
        Some(username) => {
            request.extensions_mut().insert(CurrentUser(username));
            next.run(request).await
        }
        None => AppError::Unauthorized.into_response(),
    }
}

#[cfg(feature = "web")]
fn session_cookie(value: String) -> Cookie<'static> {
    let mut cookie = Cookie::new(SESSION_COOKIE, value);
    cookie.set_path("/");
    cookie.set_http_only(true);
    cookie.set_same_site(SameSite::Lax);
    cookie
}

/// Handle user login requests
///
/// Validates credentials and sets the session cookie.
#[cfg(feature = "web")]
pub async fn handle_login(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Form(credentials): Form<UserCredentials>,
) -> Result<(CookieJar, Json<Profile>), AppError> {
    let user = state.users.verify(&credentials.username, &credentials.password)?;
    let session_id = state.sessions.create(&user.username)?;
    log::info!("{} logged in", user.username);
    Ok((jar.add(session_cookie(session_id)), Json(Profile::from(&user))))
}

/// Handle user registration
#[cfg(feature = "web")]
pub async fn handle_signup(
    State(state): State<Arc<AppState>>,
    Form(credentials): Form<UserCredentials>,
) -> Result<(StatusCode, Json<Profile>), AppError> {
    let user = state.users.register(
        &credentials.username,
        &credentials.email,
        &credentials.password,
    )?;
    Ok((StatusCode::CREATED, Json(Profile::from(&user))))
}

/// Handle user logout
///
/// Revokes the session and clears the cookie.
#[cfg(feature = "web")]
pub async fn handle_logout(State(state): State<Arc<AppState>>, jar: CookieJar) -> (CookieJar, StatusCode) {
    if let Some(cookie) = jar.get(SESSION_COOKIE) {
        state.sessions.revoke(cookie.value());
    }
    (jar.remove(session_cookie(String::new())), StatusCode::NO_CONTENT)
}

/// Current user's profile
#[cfg(feature = "web")]
pub async fn get_profile(
    State(state): State<Arc<AppState>>,
    axum::Extension(user): axum::Extension<CurrentUser>,
) -> Result<Json<Profile>, AppError> {
    let found = state.users.get(&user.0)?.ok_or(AuthError::UserNotFound)?;
    Ok(Json(Profile::from(&found)))
}

/// Update email and display name
#[cfg(feature = "web")]
pub async fn update_profile(
    State(state): State<Arc<AppState>>,
    axum::Extension(user): axum::Extension<CurrentUser>,
    Json(update): Json<ProfileUpdate>,
) -> Result<Json<Profile>, AppError> {
    Ok(Json(state.users.update_profile(&user.0, update)?))
}

/// Handle password change for authenticated users
#[cfg(feature = "web")]
pub async fn handle_change_password(
    State(state): State<Arc<AppState>>,
    axum::Extension(user): axum::Extension<CurrentUser>,
    Json(change_req): Json<PasswordChangeRequest>,
) -> Result<StatusCode, AppError> {
    state.users.change_password(&user.0, &change_req)?;
    Ok(StatusCode::NO_CONTENT)
}

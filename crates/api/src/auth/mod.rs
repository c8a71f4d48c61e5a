//! Authentication: password hashing, cookie sessions and middleware

pub mod middleware;
pub mod password;
pub mod sessions;

pub use middleware::{extract_token, optional_auth, require_auth, AuthState, AuthUser};
pub use password::{hash_password, validate_password_strength, verify_password};
pub use sessions::{SessionManager, SessionUser};

pub mod codes;
pub mod middleware;
pub mod session;

/// Identity attached to a request after session authentication.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: i64,
    pub household_id: i64,
    pub role: String,
}

impl AuthContext {
    pub fn is_admin(&self) -> bool {
        self.role == "admin"
    }
}

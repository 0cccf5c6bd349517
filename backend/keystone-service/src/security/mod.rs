/// Security primitives: credential hashing, PKCE, client authentication,
/// certificate revocation.
pub mod client_auth;
pub mod password;
pub mod pkce;
pub mod revocation;

//! Access/refresh token issuance, verification, and rotation.

pub mod issuer;
pub mod jwt;
pub mod postgres;
pub mod store;

pub use issuer::{RefreshError, TokenConfig, TokenIssuer, TokenPair};
pub use jwt::{AccessTokenClaims, AccessTokenSigner};
pub use store::{MemoryRefreshTokenStore, RefreshRecord, RefreshTokenStore, SwapOutcome};

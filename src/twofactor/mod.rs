//! Second-factor challenges: TOTP, delivered codes, and backup codes.

pub mod delivery;
pub mod postgres;
pub mod recovery;
pub mod service;
pub mod store;
mod totp;

pub use delivery::{CodeSender, DeliveredChallenge, LogCodeSender};
pub use recovery::BackupCodeBatch;
pub use service::{FactorKind, TotpEnrollment, TwoFactorConfig, TwoFactorError, TwoFactorService};
pub use store::{FactorEnrollment, MemoryTwoFactorStore, TwoFactorStore};

pub mod capability;
pub mod config;
pub mod error;
pub mod key;
pub mod repository;
pub mod session;
pub mod stream;
pub mod tool;
pub mod trace;
pub mod usage;

pub use capability::{ProviderCapabilities, ToolSupport};
pub use config::Config;
pub use error::{Error, Result};
pub use key::{mask_secret, ApiKey, BalanceStatus, KeyActiveCheck};
pub use repository::{InMemoryRepository, Repository};
pub use session::{mask_session_token, AccountType, CursorSession, QuotaStatus};
pub use stream::{BoxStream, StreamEvent, Usage};
pub use trace::TraceEvent;
pub use usage::UsageRecord;

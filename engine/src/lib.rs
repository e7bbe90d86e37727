pub mod config;
pub mod gesture;
pub mod messaging;
pub mod presence;
pub mod reactions;
pub mod resolver;
pub mod session;
pub mod store;
pub mod timers;
pub mod view;

pub use config::{AppConfig, SyncConfig};
pub use gesture::TapOutcome;
pub use messaging::{SendError, SendRequest};
pub use resolver::{ConversationResolver, ResolveError};
pub use session::{ChatSession, PendingSend, SyncError};
pub use store::{Backends, LocalBackend, StoreError};
pub use view::ChatView;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

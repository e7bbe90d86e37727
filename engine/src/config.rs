use campus_chat_messaging::{ChatTarget, LocalUser, UserId};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Time boxes and sizes used by a chat session.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// How long a text send may take before the message is flagged failed.
    pub text_send_timeout: Duration,
    /// How long an image upload may take before the send is abandoned.
    pub image_upload_timeout: Duration,
    /// How long the message call of an image send may take once the upload is done.
    pub image_send_timeout: Duration,
    /// Minimum spacing between two outgoing "typing" broadcasts.
    pub typing_broadcast_interval: Duration,
    /// Quiet period after which an automatic "stop typing" goes out.
    pub typing_stop_after: Duration,
    /// How long a remote typing indicator stays up without a refresh.
    pub typing_expiry: Duration,
    /// Window in which a second press on the same message is a double tap.
    pub double_tap_window: Duration,
    /// Cadence of the full reaction refetch.
    pub reaction_refetch_interval: Duration,
    /// Messages fetched per history page.
    pub history_page_size: usize,
    /// Capacity of the session command channel.
    pub command_buffer: usize,
}

impl SyncConfig {
    pub fn with_history_page_size(mut self, size: usize) -> Self {
        self.history_page_size = size.max(1);
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            text_send_timeout: Duration::from_secs(45),
            image_upload_timeout: Duration::from_secs(45),
            image_send_timeout: Duration::from_secs(15),
            typing_broadcast_interval: Duration::from_millis(1200),
            typing_stop_after: Duration::from_secs(2),
            typing_expiry: Duration::from_secs(3),
            double_tap_window: Duration::from_millis(400),
            reaction_refetch_interval: Duration::from_secs(30),
            history_page_size: 50,
            command_buffer: 64,
        }
    }
}

/// Runtime configuration for the `campus-chat` binary.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub user: LocalUser,
    pub data_dir: PathBuf,
    pub target: ChatTarget,
    pub simulated_latency: Duration,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let user_id = env::var("CAMPUS_CHAT_USER_ID")
            .map(UserId)
            .unwrap_or_else(|_| UserId::new());
        let mut user = LocalUser::new(user_id);
        if let Ok(name) = env::var("CAMPUS_CHAT_DISPLAY_NAME") {
            user = user.with_display_name(name);
        }
        if let Ok(url) = env::var("CAMPUS_CHAT_AVATAR_URL") {
            user = user.with_avatar(url);
        }

        let data_dir = env::var("CAMPUS_CHAT_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("data/campus-chat"));

        let target = match (env::var("CAMPUS_CHAT_PEER"), env::var("CAMPUS_CHAT_GROUP")) {
            (Ok(peer), _) => ChatTarget::Direct(UserId(peer)),
            (Err(_), Ok(group)) => ChatTarget::Group(group),
            (Err(_), Err(_)) => anyhow::bail!("set CAMPUS_CHAT_PEER or CAMPUS_CHAT_GROUP"),
        };

        let simulated_latency = env::var("CAMPUS_CHAT_LATENCY_MS")
            .ok()
            .and_then(|ms| ms.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or_default();

        Ok(Self {
            user,
            data_dir,
            target,
            simulated_latency,
        })
    }
}

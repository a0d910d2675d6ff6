use std::sync::OnceLock;

/// Default cap on a single message, in bytes.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Messenger configuration.
///
/// `Default` never looks at the environment; use [`MessengerConfig::from_env`]
/// for that.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessengerConfig {
    /// Log every frame's channel and leading bytes at debug level.
    pub wire_spy: bool,
    /// Messages larger than this are dropped and answered with the empty
    /// message.
    pub max_message_size: usize,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            wire_spy: false,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl MessengerConfig {
    /// Defaults, overridden by `PERCH_WIRE_SPY` and `PERCH_MAX_MESSAGE_SIZE`.
    pub fn from_env() -> Self {
        let mut config = Self::default().with_wire_spy(wire_spy_from_env());
        if let Some(size) = std::env::var("PERCH_MAX_MESSAGE_SIZE")
            .ok()
            .and_then(|v| v.trim().parse().ok())
        {
            config.max_message_size = size;
        }
        config
    }

    pub fn with_wire_spy(mut self, enabled: bool) -> Self {
        self.wire_spy = enabled;
        self
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }
}

static WIRE_SPY: OnceLock<bool> = OnceLock::new();

/// Whether `PERCH_WIRE_SPY` is set. Read once per process.
pub fn wire_spy_from_env() -> bool {
    *WIRE_SPY.get_or_init(|| std::env::var_os("PERCH_WIRE_SPY").is_some())
}

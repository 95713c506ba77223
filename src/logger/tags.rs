/// Log tags identifying the subsystem a message comes from
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LogTag {
    System,
    Config,
    Broker,
    Topics,
    Liveness,
    Transport,
    Webserver,
    Demo,
    Test,
    Other(String),
}

impl LogTag {
    /// Key used by --debug-<key> flags and --log-tags filters
    pub fn to_debug_key(&self) -> String {
        match self {
            LogTag::System => "system".to_string(),
            LogTag::Config => "config".to_string(),
            LogTag::Broker => "broker".to_string(),
            LogTag::Topics => "topics".to_string(),
            LogTag::Liveness => "liveness".to_string(),
            LogTag::Transport => "transport".to_string(),
            LogTag::Webserver => "webserver".to_string(),
            LogTag::Demo => "demo".to_string(),
            LogTag::Test => "test".to_string(),
            LogTag::Other(s) => s.to_lowercase(),
        }
    }

    /// Uppercase label shown in the tag column
    pub fn to_plain_string(&self) -> String {
        match self {
            LogTag::Other(s) => s.to_uppercase(),
            other => other.to_debug_key().to_uppercase(),
        }
    }
}

impl std::fmt::Display for LogTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_plain_string())
    }
}

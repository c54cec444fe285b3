//! Payload types exchanged between a development host and a running target.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::protocol::Payload;

macro_rules! payload {
    ($($ty:ident),* $(,)?) => {
        $(
            impl Payload for $ty {
                const NAME: &'static str = stringify!($ty);
            }
        )*
    };
}

payload!(
    HostHello,
    TargetHello,
    LoadModuleRequest,
    Outcome,
    ExecuteCommandRequest,
    CachedModuleState,
    ModuleReference,
    ManyModuleReferences,
    HeartbeatRequest,
);

/// First message from the host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostHello {
    /// Path of a file the host just created, used to detect a shared
    /// filesystem.
    pub shared_host_file_path: Option<String>,
}

/// Target capabilities reported in reply to [`HostHello`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetHello {
    /// Whether the target could see the host's probe file.
    pub can_access_shared_host_file: bool,
    /// Directory the target application runs from.
    pub root_module_path: String,
    /// Identifier of the target application.
    pub application_identifier: String,
    /// Whether the target keeps a dependency cache on the host.
    pub use_dependency_cache: bool,
    /// Whether dependencies are resolved from the shared filesystem instead
    /// of being copied.
    pub use_shared_filesystem_dependency_resolution: bool,
}

/// A compiled module pushed to the target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadModuleRequest {
    /// Name of the module.
    pub module_name: String,
    /// Module image.
    pub image: Vec<u8>,
    /// Debug symbols for the image.
    pub debug_symbols: Option<Vec<u8>>,
    /// Type the reload manager should treat as the entry point.
    pub primary_type_name: Option<String>,
}

/// One line of an [`Outcome`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeMessage {
    /// Message text.
    pub message: String,
}

/// Result of an operation, with free-form messages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Outcome {
    /// Whether the operation succeeded.
    pub success: bool,
    /// Messages produced along the way.
    pub messages: Vec<OutcomeMessage>,
}

impl Outcome {
    /// A successful outcome with no messages.
    #[must_use]
    pub const fn ok() -> Self {
        Self {
            success: true,
            messages: Vec::new(),
        }
    }

    /// A failed outcome carrying `message`.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            messages: vec![OutcomeMessage {
                message: message.into(),
            }],
        }
    }

    /// Append a message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.messages.push(OutcomeMessage {
            message: message.into(),
        });
        self
    }
}

/// A named command with arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteCommandRequest {
    /// Command name.
    pub command: String,
    /// Command arguments.
    pub args: Vec<String>,
}

impl ExecuteCommandRequest {
    /// Build a request for `command` with `args`.
    pub fn new<I, S>(command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

/// A dependency module the host already holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedModule {
    /// Module name.
    pub module_name: String,
    /// Location of the module on the target.
    pub module_location: String,
    /// Modification time of the cached copy.
    pub modification_time: DateTime<Utc>,
}

/// Every dependency module the host already holds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedModuleState {
    /// Cached modules.
    pub cached_modules: Vec<CachedModule>,
}

/// A dependency module sent from the target to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleReference {
    /// Module name.
    pub module_name: String,
    /// Location of the module on the target.
    pub module_location: String,
    /// Modification time of the module file.
    pub modification_time: DateTime<Utc>,
    /// Module image; absent when the host reads it from a shared filesystem.
    pub image: Option<Vec<u8>>,
}

impl ModuleReference {
    /// The cache entry the host keeps for this reference.
    #[must_use]
    pub fn cached(&self) -> CachedModule {
        CachedModule {
            module_name: self.module_name.clone(),
            module_location: self.module_location.clone(),
            modification_time: self.modification_time,
        }
    }
}

/// A batch of [`ModuleReference`]s.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManyModuleReferences {
    /// The references.
    pub references: Vec<ModuleReference>,
}

/// Liveness signal from the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    /// When the target sent the heartbeat.
    pub sent_at: DateTime<Utc>,
}

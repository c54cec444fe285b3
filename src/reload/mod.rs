//! Hot-reload protocol: a development host pushes compiled modules into a
//! running target, and the target reports its dependencies and forwards
//! commands back.
//!
//! Both peers build their registry from [`reload_protocol`], the union of the
//! operations each side serves.

pub mod catalog;
pub mod host;
pub mod listener;
pub mod models;
pub mod target;

use std::sync::Arc;

pub use self::{
    catalog::{CatalogEntry, DirectoryCatalog, EmptyCatalog, ModuleCatalog},
    host::{DEFAULT_QUEUE_CAPACITY, HostChannels, HostService, TargetClient},
    listener::{TargetListener, shutdown_signal},
    models::{
        CachedModule,
        CachedModuleState,
        ExecuteCommandRequest,
        HeartbeatRequest,
        HostHello,
        LoadModuleRequest,
        ManyModuleReferences,
        ModuleReference,
        Outcome,
        OutcomeMessage,
        TargetHello,
    },
    target::{DEFAULT_LISTEN_ADDR, ReloadManager, SyncError, TargetConfig, TargetService},
};
use crate::protocol::{ProtocolDescription, Registry};

/// Operations served by the target.
#[must_use]
pub fn target_protocol() -> ProtocolDescription {
    ProtocolDescription::new()
        .operation::<HostHello, TargetHello>("hello")
        .operation::<LoadModuleRequest, Outcome>("load_module")
        .operation::<ExecuteCommandRequest, Outcome>("exec")
        .operation::<CachedModuleState, Outcome>("synchronize_dependencies")
}

/// Operations served by the host.
#[must_use]
pub fn host_protocol() -> ProtocolDescription {
    ProtocolDescription::new()
        .operation::<ModuleReference, Outcome>("add_module_reference")
        .operation::<ManyModuleReferences, Outcome>("add_many_module_references")
        .operation::<ExecuteCommandRequest, Outcome>("execute_command")
        .operation::<HeartbeatRequest, Outcome>("heartbeat")
}

/// The full protocol both peers agree on.
#[must_use]
pub fn reload_protocol() -> ProtocolDescription { target_protocol().merge(host_protocol()) }

/// Registry for [`reload_protocol`].
#[must_use]
pub fn reload_registry() -> Arc<Registry> { Arc::new(Registry::build(&reload_protocol())) }

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Payload;

    #[test]
    fn registry_covers_both_directions() {
        let registry = reload_registry();
        assert_eq!(registry.len(), 9);
        assert_eq!(registry.operations().len(), 8);
        for name in [
            CachedModuleState::NAME,
            ExecuteCommandRequest::NAME,
            HeartbeatRequest::NAME,
            HostHello::NAME,
            LoadModuleRequest::NAME,
            ManyModuleReferences::NAME,
            ModuleReference::NAME,
            Outcome::NAME,
            TargetHello::NAME,
        ] {
            assert!(registry.id_of_name(name).is_some(), "{name} missing");
        }
    }

    #[test]
    fn ids_are_assigned_alphabetically() {
        let registry = reload_registry();
        assert_eq!(registry.id_of::<CachedModuleState>(), Some(1));
        assert_eq!(registry.id_of::<TargetHello>(), Some(9));
    }
}

//! Deterministic mapping between payload types and wire type ids.
//!
//! Peers never exchange the mapping. Each side builds a [`Registry`] from the
//! same [`ProtocolDescription`]: every request and response type named by an
//! operation is collected, the names are sorted, and ids `1..=N` are handed
//! out in that order. Identical descriptions therefore yield identical ids.

use std::collections::{BTreeSet, HashMap};

use serde::{Serialize, de::DeserializeOwned};

/// A type that can travel inside an envelope.
///
/// `NAME` is the stable key used to order the registry, so it must be unique
/// across the protocol and identical on both peers.
pub trait Payload: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable name of the payload type.
    const NAME: &'static str;
}

impl Payload for () {
    const NAME: &'static str = "Unit";
}

/// One operation of a protocol: a request type and its response type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperationDescriptor {
    /// Operation name, used for logging and handler registration.
    pub name: &'static str,
    /// Payload name of the request type.
    pub request: &'static str,
    /// Payload name of the response type.
    pub response: &'static str,
}

/// The set of operations two peers agree to exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtocolDescription {
    operations: Vec<OperationDescriptor>,
}

impl ProtocolDescription {
    /// Create an empty description.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Declare an operation taking `Req` and answering with `Resp`.
    #[must_use]
    pub fn operation<Req: Payload, Resp: Payload>(mut self, name: &'static str) -> Self {
        self.operations.push(OperationDescriptor {
            name,
            request: Req::NAME,
            response: Resp::NAME,
        });
        self
    }

    /// Append every operation of `other`.
    #[must_use]
    pub fn merge(mut self, other: Self) -> Self {
        self.operations.extend(other.operations);
        self
    }

    /// Operations in declaration order.
    #[must_use]
    pub fn operations(&self) -> &[OperationDescriptor] { &self.operations }
}

/// Immutable, bidirectional payload-name to type-id mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registry {
    by_name: HashMap<&'static str, i32>,
    by_id: Vec<&'static str>,
    operations: Vec<OperationDescriptor>,
}

impl Registry {
    /// Build the registry for `description`.
    ///
    /// # Panics
    /// Panics if the protocol names more than `i32::MAX` distinct payload
    /// types.
    #[must_use]
    #[expect(
        clippy::expect_used,
        reason = "a protocol with more than i32::MAX payload types cannot be declared"
    )]
    pub fn build(description: &ProtocolDescription) -> Self {
        let names: BTreeSet<&'static str> = description
            .operations
            .iter()
            .flat_map(|op| [op.request, op.response])
            .collect();
        let by_id: Vec<&'static str> = names.into_iter().collect();
        let by_name = by_id
            .iter()
            .enumerate()
            .map(|(index, name)| {
                let id = i32::try_from(index + 1).expect("payload type count fits in i32");
                (*name, id)
            })
            .collect();
        Self {
            by_name,
            by_id,
            operations: description.operations.clone(),
        }
    }

    /// Type id of payload `T`, if the protocol uses it.
    #[must_use]
    pub fn id_of<T: Payload>(&self) -> Option<i32> { self.id_of_name(T::NAME) }

    /// Type id of the payload with the given name.
    #[must_use]
    pub fn id_of_name(&self, name: &str) -> Option<i32> { self.by_name.get(name).copied() }

    /// Payload name registered under `id`.
    #[must_use]
    pub fn name_of(&self, id: i32) -> Option<&'static str> {
        let index = usize::try_from(id).ok()?.checked_sub(1)?;
        self.by_id.get(index).copied()
    }

    /// Whether `id` names a registered payload type.
    #[must_use]
    pub fn contains_id(&self, id: i32) -> bool { self.name_of(id).is_some() }

    /// Number of registered payload types.
    #[must_use]
    pub fn len(&self) -> usize { self.by_id.len() }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.by_id.is_empty() }

    /// Operations of the description the registry was built from.
    #[must_use]
    pub fn operations(&self) -> &[OperationDescriptor] { &self.operations }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use rstest::{fixture, rstest};
    use serde::{Deserialize, Serialize};

    use super::*;

    macro_rules! payloads {
        ($($ty:ident),*) => {
            $(
                #[derive(Debug, Serialize, Deserialize)]
                struct $ty;
                impl Payload for $ty {
                    const NAME: &'static str = stringify!($ty);
                }
            )*
        };
    }

    payloads!(Alpha, Beta, Gamma, Delta, Omega);

    #[fixture]
    fn description() -> ProtocolDescription {
        ProtocolDescription::new()
            .operation::<Gamma, Alpha>("first")
            .operation::<Beta, Alpha>("second")
            .operation::<Omega, Delta>("third")
    }

    #[rstest]
    fn ids_follow_sorted_names(description: ProtocolDescription) {
        let registry = Registry::build(&description);
        assert_eq!(registry.len(), 5);
        assert_eq!(registry.id_of::<Alpha>(), Some(1));
        assert_eq!(registry.id_of::<Beta>(), Some(2));
        assert_eq!(registry.id_of::<Delta>(), Some(3));
        assert_eq!(registry.id_of::<Gamma>(), Some(4));
        assert_eq!(registry.id_of::<Omega>(), Some(5));
    }

    #[rstest]
    fn response_only_types_are_registered(description: ProtocolDescription) {
        let registry = Registry::build(&description);
        assert!(registry.id_of::<Delta>().is_some());
    }

    #[rstest]
    #[case(0)]
    #[case(-3)]
    #[case(6)]
    fn unknown_ids_resolve_to_nothing(description: ProtocolDescription, #[case] id: i32) {
        let registry = Registry::build(&description);
        assert_eq!(registry.name_of(id), None);
        assert!(!registry.contains_id(id));
    }

    #[rstest]
    fn merge_keeps_both_sides(description: ProtocolDescription) {
        let other = ProtocolDescription::new().operation::<Alpha, ()>("fire");
        let registry = Registry::build(&description.merge(other));
        assert_eq!(registry.operations().len(), 4);
        assert_eq!(registry.id_of::<()>(), Some(6));
    }

    fn build_from(order: &[usize]) -> Registry {
        let mut description = ProtocolDescription::new();
        for index in order {
            description = match index {
                0 => description.operation::<Alpha, Beta>("a"),
                1 => description.operation::<Gamma, Delta>("b"),
                2 => description.operation::<Omega, Alpha>("c"),
                3 => description.operation::<Beta, Gamma>("d"),
                _ => description.operation::<Delta, Omega>("e"),
            };
        }
        Registry::build(&description)
    }

    proptest! {
        #[test]
        fn declaration_order_does_not_change_ids(
            order in Just(vec![0usize, 1, 2, 3, 4]).prop_shuffle()
        ) {
            let shuffled = build_from(&order);
            let sorted = build_from(&[0, 1, 2, 3, 4]);
            for name in ["Alpha", "Beta", "Gamma", "Delta", "Omega"] {
                prop_assert_eq!(shuffled.id_of_name(name), sorted.id_of_name(name));
            }
        }
    }
}

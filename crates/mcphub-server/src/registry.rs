//! Capability registries.
//!
//! One parameterised registry serves tools, prompts, resources and resource
//! templates. Each keeps two maps: `public key → owning entry` and
//! `server → its registered items` (the reverse index). Collisions are
//! always computed from the reverse index, so clearing a server can never
//! leave a public entry without a source.

use std::collections::HashMap;

use parking_lot::RwLock;

use mcphub_core::{HubError, Result, ServerId};

/// Collision handling when two servers produce the same public key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CollisionPolicy {
    /// Registration fails atomically; neither server's batch is applied
    Error,
    /// The most recent registration owns the public key
    #[default]
    LastWriterWins,
    /// The earliest registration owns the public key (resource pass-through)
    FirstWriterWins,
}

/// One item offered for registration
#[derive(Debug, Clone)]
pub struct RegistrationItem<T> {
    /// Key the upstream knows this item by (name or URI)
    pub original_key: String,
    /// Key the hub exposes
    pub public_key: String,
    /// Opaque descriptor
    pub item: T,
}

/// A registered item with its origin
#[derive(Debug, Clone)]
pub struct RegisteredItem<T> {
    /// Public key
    pub public_key: String,
    /// Owning server
    pub server_id: ServerId,
    /// Key the upstream knows this item by
    pub original_key: String,
    /// Opaque descriptor
    pub item: T,
}

#[derive(Debug)]
struct RegistryInner<T> {
    /// Registration order of servers
    server_order: Vec<ServerId>,
    /// Items per server, in registration order
    per_server: HashMap<ServerId, Vec<RegisteredItem<T>>>,
    /// Public key to owning entry
    public: HashMap<String, RegisteredItem<T>>,
    /// Public key to every server providing it, in registration order
    sources: HashMap<String, Vec<ServerId>>,
}

impl<T> Default for RegistryInner<T> {
    fn default() -> Self {
        Self {
            server_order: Vec::new(),
            per_server: HashMap::new(),
            public: HashMap::new(),
            sources: HashMap::new(),
        }
    }
}

/// Keyed capability store with per-server reverse index
#[derive(Debug)]
pub struct CapabilityRegistry<T> {
    policy: CollisionPolicy,
    inner: RwLock<RegistryInner<T>>,
}

impl<T: Clone> CapabilityRegistry<T> {
    /// Create a registry with the given collision policy
    #[must_use]
    pub fn new(policy: CollisionPolicy) -> Self {
        Self {
            policy,
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    /// The collision policy in effect
    #[must_use]
    pub fn policy(&self) -> CollisionPolicy {
        self.policy
    }

    /// Atomically replace every item registered for `server_id`.
    ///
    /// Under [`CollisionPolicy::Error`], a prospective collision with
    /// another server fails the whole batch without mutating anything.
    pub fn register_server(
        &self,
        server_id: &ServerId,
        items: Vec<RegistrationItem<T>>,
    ) -> Result<()> {
        // Reject duplicates within the batch regardless of policy.
        {
            let mut seen = std::collections::HashSet::new();
            for item in &items {
                if !seen.insert(item.public_key.as_str()) {
                    return Err(HubError::config(format!(
                        "duplicate public key '{}' within one registration batch",
                        item.public_key
                    )));
                }
            }
        }

        let mut inner = self.inner.write();

        if self.policy == CollisionPolicy::Error {
            for item in &items {
                let foreign = inner
                    .sources
                    .get(&item.public_key)
                    .is_some_and(|sources| sources.iter().any(|s| s != server_id));
                if foreign {
                    return Err(HubError::config(format!(
                        "public key '{}' already registered by another server",
                        item.public_key
                    ))
                    .with_context("public_key", item.public_key.clone()));
                }
            }
        }

        Self::remove_server_locked(&mut inner, server_id);

        if !inner.server_order.contains(server_id) {
            inner.server_order.push(server_id.clone());
        }

        let mut owned = Vec::with_capacity(items.len());
        for item in items {
            let registered = RegisteredItem {
                public_key: item.public_key.clone(),
                server_id: server_id.clone(),
                original_key: item.original_key,
                item: item.item,
            };

            let sources = inner.sources.entry(item.public_key.clone()).or_default();
            sources.push(server_id.clone());
            let is_first = sources.len() == 1;

            let install = match self.policy {
                CollisionPolicy::Error | CollisionPolicy::LastWriterWins => true,
                CollisionPolicy::FirstWriterWins => is_first,
            };
            if install {
                inner.public.insert(item.public_key, registered.clone());
            }
            owned.push(registered);
        }
        inner.per_server.insert(server_id.clone(), owned);
        Ok(())
    }

    /// Remove every item registered for `server_id`
    pub fn clear_server(&self, server_id: &ServerId) {
        let mut inner = self.inner.write();
        Self::remove_server_locked(&mut inner, server_id);
        inner.server_order.retain(|s| s != server_id);
    }

    fn remove_server_locked(inner: &mut RegistryInner<T>, server_id: &ServerId) {
        let Some(items) = inner.per_server.remove(server_id) else {
            return;
        };

        for item in items {
            let Some(sources) = inner.sources.get_mut(&item.public_key) else {
                continue;
            };
            sources.retain(|s| s != server_id);

            if sources.is_empty() {
                inner.sources.remove(&item.public_key);
                inner.public.remove(&item.public_key);
                continue;
            }

            // Reassign ownership to a surviving source if this server owned
            // the public entry.
            let owned_here = inner
                .public
                .get(&item.public_key)
                .is_some_and(|entry| &entry.server_id == server_id);
            if owned_here {
                let heir = sources.last().cloned();
                if let Some(heir) = heir {
                    let replacement = inner.per_server.get(&heir).and_then(|items| {
                        items
                            .iter()
                            .find(|i| i.public_key == item.public_key)
                            .cloned()
                    });
                    match replacement {
                        Some(entry) => {
                            inner.public.insert(item.public_key.clone(), entry);
                        }
                        None => {
                            inner.public.remove(&item.public_key);
                        }
                    }
                }
            }
        }
    }

    /// Resolve a public key to its owning `(server_id, original_key)`
    #[must_use]
    pub fn resolve(&self, public_key: &str) -> Option<(ServerId, String)> {
        let inner = self.inner.read();
        inner
            .public
            .get(public_key)
            .map(|entry| (entry.server_id.clone(), entry.original_key.clone()))
    }

    /// Get the full registered entry for a public key
    #[must_use]
    pub fn get(&self, public_key: &str) -> Option<RegisteredItem<T>> {
        self.inner.read().public.get(public_key).cloned()
    }

    /// All public entries, in deterministic order: servers in registration
    /// order, items in per-server insertion order, shadowed entries omitted
    #[must_use]
    pub fn list(&self) -> Vec<RegisteredItem<T>> {
        let inner = self.inner.read();
        let mut out = Vec::new();
        for server in &inner.server_order {
            let Some(items) = inner.per_server.get(server) else {
                continue;
            };
            for item in items {
                let owns = inner
                    .public
                    .get(&item.public_key)
                    .is_some_and(|entry| &entry.server_id == server);
                if owns {
                    out.push(item.clone());
                }
            }
        }
        out
    }

    /// Items registered by one server, in insertion order
    #[must_use]
    pub fn list_by_server(&self, server_id: &ServerId) -> Vec<RegisteredItem<T>> {
        self.inner
            .read()
            .per_server
            .get(server_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Every server providing a public key, in registration order
    #[must_use]
    pub fn sources_of(&self, public_key: &str) -> Vec<ServerId> {
        self.inner
            .read()
            .sources
            .get(public_key)
            .cloned()
            .unwrap_or_default()
    }

    /// Public keys provided by more than one server
    #[must_use]
    pub fn collisions(&self) -> HashMap<String, Vec<ServerId>> {
        self.inner
            .read()
            .sources
            .iter()
            .filter(|(_, sources)| sources.len() > 1)
            .map(|(key, sources)| (key.clone(), sources.clone()))
            .collect()
    }

    /// Total registered items across all servers (shadowed items included)
    #[must_use]
    pub fn count(&self) -> usize {
        self.inner
            .read()
            .per_server
            .values()
            .map(Vec::len)
            .sum()
    }

    /// All public keys
    #[must_use]
    pub fn public_keys(&self) -> Vec<String> {
        self.inner.read().public.keys().cloned().collect()
    }

    /// Remove everything
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        *inner = RegistryInner::default();
    }
}

impl<T: Clone> Default for CapabilityRegistry<T> {
    fn default() -> Self {
        Self::new(CollisionPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(s: &str) -> ServerId {
        ServerId::new(s).unwrap()
    }

    fn item(original: &str, public: &str) -> RegistrationItem<String> {
        RegistrationItem {
            original_key: original.to_string(),
            public_key: public.to_string(),
            item: format!("descriptor-{original}"),
        }
    }

    #[test]
    fn test_register_and_resolve() {
        let registry = CapabilityRegistry::new(CollisionPolicy::LastWriterWins);
        registry
            .register_server(&sid("a"), vec![item("echo", "echo_a")])
            .unwrap();

        assert_eq!(
            registry.resolve("echo_a"),
            Some((sid("a"), "echo".to_string()))
        );
        assert_eq!(registry.resolve("missing"), None);
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_register_replaces_atomically() {
        let registry = CapabilityRegistry::new(CollisionPolicy::LastWriterWins);
        let a = sid("a");
        registry
            .register_server(&a, vec![item("one", "one_a"), item("two", "two_a")])
            .unwrap();
        registry
            .register_server(&a, vec![item("three", "three_a")])
            .unwrap();

        assert_eq!(registry.resolve("one_a"), None);
        assert_eq!(registry.resolve("two_a"), None);
        assert!(registry.resolve("three_a").is_some());
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_clear_server_removes_sources() {
        let registry = CapabilityRegistry::new(CollisionPolicy::LastWriterWins);
        let a = sid("a");
        registry
            .register_server(&a, vec![item("echo", "echo_a")])
            .unwrap();
        registry.clear_server(&a);

        assert_eq!(registry.resolve("echo_a"), None);
        assert_eq!(registry.count(), 0);
        assert!(registry.collisions().is_empty());
        assert!(registry.list().is_empty());
    }

    #[test]
    fn test_collision_error_policy_is_atomic() {
        let registry = CapabilityRegistry::new(CollisionPolicy::Error);
        registry
            .register_server(&sid("server1"), vec![item("search", "search")])
            .unwrap();

        let err = registry
            .register_server(
                &sid("server2"),
                vec![item("other", "other"), item("search", "search")],
            )
            .unwrap_err();
        assert!(err.message.contains("search"));

        // Nothing from server2 was applied.
        assert_eq!(registry.resolve("other"), None);
        assert_eq!(registry.resolve("search"), Some((sid("server1"), "search".to_string())));
        assert_eq!(registry.list().len(), 1);
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_last_writer_wins_remembers_sources() {
        let registry = CapabilityRegistry::new(CollisionPolicy::LastWriterWins);
        registry
            .register_server(&sid("a"), vec![item("search", "search")])
            .unwrap();
        registry
            .register_server(&sid("b"), vec![item("search", "search")])
            .unwrap();

        // Last writer owns the key.
        assert_eq!(registry.resolve("search"), Some((sid("b"), "search".to_string())));

        let collisions = registry.collisions();
        assert_eq!(collisions["search"], vec![sid("a"), sid("b")]);

        // Both registrations remain in the reverse index.
        assert_eq!(registry.count(), 2);
        assert_eq!(registry.list_by_server(&sid("a")).len(), 1);
    }

    #[test]
    fn test_first_writer_wins_for_passthrough_resources() {
        let registry = CapabilityRegistry::new(CollisionPolicy::FirstWriterWins);
        registry
            .register_server(&sid("a"), vec![item("file:///x", "file:///x")])
            .unwrap();
        registry
            .register_server(&sid("b"), vec![item("file:///x", "file:///x")])
            .unwrap();

        assert_eq!(
            registry.resolve("file:///x"),
            Some((sid("a"), "file:///x".to_string()))
        );
        assert_eq!(registry.collisions()["file:///x"], vec![sid("a"), sid("b")]);
    }

    #[test]
    fn test_ownership_reassigned_after_owner_clears() {
        let registry = CapabilityRegistry::new(CollisionPolicy::LastWriterWins);
        registry
            .register_server(&sid("a"), vec![item("search", "search")])
            .unwrap();
        registry
            .register_server(&sid("b"), vec![item("search", "search")])
            .unwrap();

        registry.clear_server(&sid("b"));
        // The surviving source takes over; no dangling public entry.
        assert_eq!(registry.resolve("search"), Some((sid("a"), "search".to_string())));
        assert_eq!(registry.collisions().len(), 0);
    }

    #[test]
    fn test_list_order_is_deterministic() {
        let registry = CapabilityRegistry::new(CollisionPolicy::LastWriterWins);
        registry
            .register_server(&sid("b"), vec![item("one", "one_b"), item("two", "two_b")])
            .unwrap();
        registry
            .register_server(&sid("a"), vec![item("three", "three_a")])
            .unwrap();

        let keys: Vec<String> = registry.list().into_iter().map(|i| i.public_key).collect();
        // Servers in registration order, items in insertion order.
        assert_eq!(keys, vec!["one_b", "two_b", "three_a"]);
    }

    #[test]
    fn test_count_matches_sum_of_per_server_listings() {
        let registry = CapabilityRegistry::new(CollisionPolicy::LastWriterWins);
        registry
            .register_server(&sid("a"), vec![item("x", "x"), item("y", "y_a")])
            .unwrap();
        registry
            .register_server(&sid("b"), vec![item("x", "x")])
            .unwrap();

        let total: usize = [sid("a"), sid("b")]
            .iter()
            .map(|s| registry.list_by_server(s).len())
            .sum();
        assert_eq!(registry.count(), total);

        // resolve(n) is Some iff n is a public key.
        for key in registry.public_keys() {
            assert!(registry.resolve(&key).is_some());
        }
    }

    #[test]
    fn test_duplicate_public_key_in_batch_rejected() {
        let registry = CapabilityRegistry::new(CollisionPolicy::LastWriterWins);
        let err = registry
            .register_server(&sid("a"), vec![item("x", "same"), item("y", "same")])
            .unwrap_err();
        assert!(err.message.contains("duplicate"));
        assert_eq!(registry.count(), 0);
    }
}

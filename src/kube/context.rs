//! Context and connection lifecycle management.
//!
//! [`ContextManager`] owns the registry of loaded contexts, their client
//! handles, and which single context is active. Three maps are kept in
//! lock-step (entries, typed clients, dynamic clients) and are always
//! mutated together under one write-lock acquisition, never partially.
//!
//! # Invariants
//!
//! - Registry keys are unique; a load never overwrites an existing key.
//! - At most one entry is active at any time (zero only when the registry
//!   is empty or no load could determine an initial selection).
//! - Callers only ever receive copies of [`ContextInfo`]; live references
//!   never escape the registry.
//!
//! # Concurrency
//!
//! The lock guards the maps only and is never held across network or file
//! I/O: parsing and the connectivity probe run before the write lock is
//! taken. Mutating operations (load/delete/rename/switch) are expected to
//! be serialized by the caller; reads are safe at any time.
//!
//! # Determinism
//!
//! Two situations need a tie-break and both use the lexicographically
//! smallest registry key: promoting a replacement after the active context
//! is deleted, and picking a client when connections exist but no explicit
//! selection was ever made.

use std::collections::HashMap;
use std::path::PathBuf;

use kube::Client;
use parking_lot::RwLock;
use tracing::{info, warn};

use super::client::{ClientFactory, DynamicClient, KubeClientFactory};
use super::error::ContextError;
use super::kubeconfig;
use super::types::ContextInfo;

/// Result of a successful kubeconfig load.
#[derive(Debug)]
pub struct LoadOutcome {
    /// Registry keys added by this load, in file order
    pub added: Vec<String>,
    /// Active context after the load, if any
    pub active: Option<String>,
}

#[derive(Default)]
struct Registry {
    entries: HashMap<String, ContextInfo>,
    clients: HashMap<String, Client>,
    dynamic: HashMap<String, DynamicClient>,
    current: Option<String>,
}

impl Registry {
    /// Smallest key in the entry map; the deterministic tie-break used for
    /// replacement promotion and for the no-selection client fallback.
    fn smallest_key(&self) -> Option<String> {
        self.entries.keys().min().cloned()
    }

    fn clear_active_flag(&mut self) {
        if let Some(current) = self.current.take()
            && let Some(entry) = self.entries.get_mut(&current)
        {
            entry.active = false;
        }
    }

    fn set_active(&mut self, key: &str) {
        self.clear_active_flag();
        if let Some(entry) = self.entries.get_mut(key) {
            entry.active = true;
            self.current = Some(key.to_string());
        }
    }
}

/// Owns loaded contexts, their client handles, and the active selection.
pub struct ContextManager {
    factory: Box<dyn ClientFactory>,
    registry: RwLock<Registry>,
}

impl ContextManager {
    /// Create a manager backed by the production client factory.
    pub fn new() -> Self {
        Self::with_factory(Box::new(KubeClientFactory))
    }

    /// Create a manager with a custom client factory (used by tests to skip
    /// the connectivity probe).
    pub fn with_factory(factory: Box<dyn ClientFactory>) -> Self {
        Self {
            factory,
            registry: RwLock::new(Registry::default()),
        }
    }

    /// Load a kubeconfig file and register every context it defines.
    ///
    /// Each context is registered under the key `"{name}-{context}"`. Keys
    /// that already exist are skipped, never overwritten. One shared pair of
    /// typed/dynamic client handles is built for the whole file and attached
    /// to every newly registered key, after a single connectivity probe; if
    /// the probe fails the entire load is aborted and nothing is registered.
    ///
    /// If no context is active yet and the file's own current-context marker
    /// matches one of the newly added keys, that key becomes active.
    ///
    /// A load name is considered taken while any registry key carries its
    /// prefix; reloading under the same name fails with `DuplicateContext`.
    pub async fn load_kubeconfig(
        &self,
        name: &str,
        path: &str,
    ) -> Result<LoadOutcome, ContextError> {
        if name.is_empty() {
            return Err(ContextError::EmptyIdentifier);
        }

        if self.name_taken(name) {
            return Err(ContextError::DuplicateContext(name.to_string()));
        }

        let resolved = kubeconfig::resolve_kubeconfig_path(path)?;
        let parsed = kubeconfig::parse_kubeconfig(&resolved)?;

        // Bind the shared client pair to the file's current context, falling
        // back to the first context when no marker is set.
        let bind_to = parsed
            .iter()
            .find(|c| c.is_current)
            .or_else(|| parsed.first())
            .cloned()
            .ok_or_else(|| ContextError::CredentialEmpty(resolved.clone()))?;

        info!(
            "Loading kubeconfig {} under name {} ({} contexts)",
            resolved.display(),
            name,
            parsed.len()
        );

        let (client, dynamic) = self
            .factory
            .build(&resolved, Some(&bind_to.name), &bind_to.server)
            .await?;

        let mut registry = self.registry.write();

        // Re-check under the lock; another load may have raced us in.
        if registry.entries.keys().any(|k| is_prefixed(k, name)) {
            return Err(ContextError::DuplicateContext(name.to_string()));
        }

        let mut added = Vec::new();
        let mut file_current_key = None;

        for ctx in &parsed {
            let key = format!("{name}-{}", ctx.name);
            if registry.entries.contains_key(&key) {
                warn!("Skipping context {}: key already registered", key);
                continue;
            }

            if ctx.is_current {
                file_current_key = Some(key.clone());
            }

            registry.entries.insert(
                key.clone(),
                ContextInfo {
                    name: key.clone(),
                    cluster: ctx.cluster.clone(),
                    user: ctx.user.clone(),
                    namespace: ctx.namespace.clone(),
                    server: ctx.server.clone(),
                    source_path: resolved.display().to_string(),
                    active: false,
                },
            );
            registry.clients.insert(key.clone(), client.clone());
            registry.dynamic.insert(key.clone(), dynamic.clone());
            added.push(key);
        }

        if registry.current.is_none()
            && let Some(key) = file_current_key
            && added.contains(&key)
        {
            registry.set_active(&key);
        }

        let active = registry.current.clone();
        info!("Registered {} contexts under {}", added.len(), name);

        Ok(LoadOutcome { added, active })
    }

    /// Remove a context and its two client handles together.
    ///
    /// If the removed entry was active, the lexicographically smallest
    /// remaining key is promoted; with no entries left, the active
    /// selection becomes empty.
    pub fn delete_context(&self, name: &str) -> Result<(), ContextError> {
        let mut registry = self.registry.write();

        if registry.entries.remove(name).is_none() {
            return Err(ContextError::ContextNotFound(name.to_string()));
        }
        registry.clients.remove(name);
        registry.dynamic.remove(name);

        if registry.current.as_deref() == Some(name) {
            registry.current = None;
            if let Some(replacement) = registry.smallest_key() {
                info!(
                    "Deleted active context {}; promoting {}",
                    name, replacement
                );
                registry.set_active(&replacement);
            } else {
                info!("Deleted last context {}; no active context remains", name);
            }
        }

        Ok(())
    }

    /// Move a context's three registrations to a new key as one operation.
    ///
    /// If the old key was active, the new key becomes active; the old key
    /// is not reachable afterwards.
    pub fn rename_context(&self, old_name: &str, new_name: &str) -> Result<(), ContextError> {
        if old_name == new_name {
            return Err(ContextError::SameName(old_name.to_string()));
        }

        let mut registry = self.registry.write();

        if !registry.entries.contains_key(old_name) {
            return Err(ContextError::ContextNotFound(old_name.to_string()));
        }
        if registry.entries.contains_key(new_name) {
            return Err(ContextError::DuplicateContext(new_name.to_string()));
        }

        let Some(mut entry) = registry.entries.remove(old_name) else {
            return Err(ContextError::ContextNotFound(old_name.to_string()));
        };
        entry.name = new_name.to_string();
        registry.entries.insert(new_name.to_string(), entry);

        if let Some(client) = registry.clients.remove(old_name) {
            registry.clients.insert(new_name.to_string(), client);
        }
        if let Some(dynamic) = registry.dynamic.remove(old_name) {
            registry.dynamic.insert(new_name.to_string(), dynamic);
        }

        if registry.current.as_deref() == Some(old_name) {
            registry.current = Some(new_name.to_string());
        }

        info!("Renamed context {} to {}", old_name, new_name);
        Ok(())
    }

    /// Switch the active context and persist the selection into the entry's
    /// original kubeconfig file.
    ///
    /// The in-memory switch happens first and is NOT rolled back if
    /// persistence fails: a `ContextNotFoundInCredential` or `Persist` error
    /// leaves the registry on the new selection while the file still names
    /// the old one. Callers detect that window by the distinct error.
    pub fn set_current_context(&self, name: &str) -> Result<(), ContextError> {
        let source_path = {
            let mut registry = self.registry.write();

            if !registry.clients.contains_key(name) {
                return Err(ContextError::ContextNotFound(name.to_string()));
            }

            registry.set_active(name);
            registry
                .entries
                .get(name)
                .map(|e| PathBuf::from(&e.source_path))
                .unwrap_or_default()
        };

        // Match the namespaced registry key back to the file's own context
        // name by suffix, then rewrite the file's current-context marker.
        // Everything from here on is the persist stage, so a re-read or
        // re-parse failure surfaces as Persist, not as a load-time error.
        let parsed =
            kubeconfig::parse_kubeconfig(&source_path).map_err(|e| ContextError::Persist {
                path: source_path.clone(),
                reason: e.to_string(),
            })?;
        let file_context = parsed
            .iter()
            .find(|c| key_matches_context(name, &c.name))
            .ok_or_else(|| ContextError::ContextNotFoundInCredential {
                key: name.to_string(),
                path: source_path.clone(),
            })?;

        kubeconfig::write_current_context(&source_path, &file_context.name)?;

        info!(
            "Switched active context to {} (persisted {} into {})",
            name,
            file_context.name,
            source_path.display()
        );
        Ok(())
    }

    /// Typed client for the active context.
    ///
    /// With connections loaded but no active selection, the client under the
    /// smallest registry key is returned rather than failing, so the manager
    /// stays usable.
    pub fn current_client(&self) -> Result<Client, ContextError> {
        let registry = self.registry.read();

        if registry.entries.is_empty() {
            return Err(ContextError::NoConnectionsConfigured);
        }

        if let Some(current) = &registry.current
            && let Some(client) = registry.clients.get(current)
        {
            return Ok(client.clone());
        }

        registry
            .smallest_key()
            .and_then(|key| registry.clients.get(&key).cloned())
            .ok_or(ContextError::NoClientsAvailable)
    }

    /// Dynamic client for the active context, with the same fallback rule as
    /// [`Self::current_client`].
    pub fn current_dynamic_client(&self) -> Result<DynamicClient, ContextError> {
        let registry = self.registry.read();

        if registry.entries.is_empty() {
            return Err(ContextError::NoConnectionsConfigured);
        }

        if let Some(current) = &registry.current
            && let Some(dynamic) = registry.dynamic.get(current)
        {
            return Ok(dynamic.clone());
        }

        registry
            .smallest_key()
            .and_then(|key| registry.dynamic.get(&key).cloned())
            .ok_or(ContextError::NoClientsAvailable)
    }

    /// Copy of the entry the current-client rule resolves to.
    pub fn active_entry(&self) -> Result<ContextInfo, ContextError> {
        let registry = self.registry.read();

        if registry.entries.is_empty() {
            return Err(ContextError::NoConnectionsConfigured);
        }

        registry
            .current
            .clone()
            .or_else(|| registry.smallest_key())
            .and_then(|key| registry.entries.get(&key).cloned())
            .ok_or(ContextError::NoClientsAvailable)
    }

    /// Name of the active context, if one is selected.
    pub fn current_context(&self) -> Option<String> {
        self.registry.read().current.clone()
    }

    /// Default namespace of the active (or fallback) context.
    pub fn current_namespace(&self) -> Result<String, ContextError> {
        Ok(self.active_entry()?.namespace)
    }

    /// Override the namespace of the active (or fallback) context, in memory
    /// only; the kubeconfig file is not touched.
    pub fn set_current_namespace(&self, namespace: &str) -> Result<(), ContextError> {
        let key = self.active_entry()?.name;
        let mut registry = self.registry.write();
        match registry.entries.get_mut(&key) {
            Some(entry) => {
                entry.namespace = namespace.to_string();
                Ok(())
            }
            None => Err(ContextError::ContextNotFound(key)),
        }
    }

    /// Copy of one context's metadata.
    pub fn get_context_info(&self, name: &str) -> Result<ContextInfo, ContextError> {
        self.registry
            .read()
            .entries
            .get(name)
            .cloned()
            .ok_or_else(|| ContextError::ContextNotFound(name.to_string()))
    }

    /// Copies of all context entries, sorted by key.
    pub fn list_contexts(&self) -> Vec<ContextInfo> {
        let registry = self.registry.read();
        let mut contexts: Vec<ContextInfo> = registry.entries.values().cloned().collect();
        contexts.sort_by(|a, b| a.name.cmp(&b.name));
        contexts
    }

    /// Distinct cluster identifiers across all registered contexts, sorted.
    pub fn list_clusters(&self) -> Vec<String> {
        let registry = self.registry.read();
        let mut clusters: Vec<String> = registry
            .entries
            .values()
            .map(|e| e.cluster.clone())
            .collect();
        clusters.sort();
        clusters.dedup();
        clusters
    }

    fn name_taken(&self, name: &str) -> bool {
        self.registry
            .read()
            .entries
            .keys()
            .any(|k| is_prefixed(k, name))
    }
}

impl Default for ContextManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether a registry key belongs to the given load name.
fn is_prefixed(key: &str, load_name: &str) -> bool {
    key.strip_prefix(load_name)
        .is_some_and(|rest| rest.starts_with('-'))
}

/// Whether a namespaced registry key refers to a context name from its
/// source file. Keys are `"{load}-{context}"`, so an exact match or a
/// dash-delimited suffix match both qualify.
fn key_matches_context(key: &str, context_name: &str) -> bool {
    key == context_name
        || key
            .strip_suffix(context_name)
            .is_some_and(|rest| rest.ends_with('-'))
}

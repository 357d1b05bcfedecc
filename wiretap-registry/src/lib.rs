use std::sync::Arc;

use thiserror::Error;

use wiretap_proxy::{EndpointConfig, OutputSink, PacketInterceptor, ProxyEndpoint, ProxyError};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("a proxy named {0} already exists")]
    DuplicateName(String),
    #[error("no proxy named {0}")]
    UnknownName(String),
    #[error("no proxy at index {0}")]
    UnknownIndex(usize),
    #[error(transparent)]
    Proxy(#[from] ProxyError),
}

/// Owns every configured endpoint and tracks which one is selected.
///
/// Names are unique; selection follows renames and is cleared when the
/// selected proxy is killed. Listing order is creation order.
#[derive(Default)]
pub struct ProxyRegistry {
    endpoints: Vec<ProxyEndpoint>,
    selected: Option<String>,
}

impl ProxyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds and starts a new endpoint under a unique name.
    pub fn create(
        &mut self,
        config: EndpointConfig,
        interceptor: Arc<dyn PacketInterceptor>,
        output: Arc<dyn OutputSink>,
    ) -> Result<(), RegistryError> {
        if self.get(&config.name).is_some() {
            return Err(RegistryError::DuplicateName(config.name));
        }
        let endpoint = ProxyEndpoint::new(config, interceptor, output)?;
        endpoint.start();
        self.endpoints.push(endpoint);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ProxyEndpoint> {
        self.endpoints
            .iter()
            .find(|endpoint| endpoint.name() == name)
    }

    pub fn get_by_number(&self, index: usize) -> Option<&ProxyEndpoint> {
        self.endpoints.get(index)
    }

    pub fn names(&self) -> Vec<String> {
        self.endpoints.iter().map(ProxyEndpoint::name).collect()
    }

    /// One status line per endpoint, in creation order.
    pub fn list(&self) -> Vec<String> {
        self.endpoints
            .iter()
            .map(|endpoint| endpoint.to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn select(&mut self, name: &str) -> Result<(), RegistryError> {
        if self.get(name).is_none() {
            return Err(RegistryError::UnknownName(name.to_string()));
        }
        self.selected = Some(name.to_string());
        Ok(())
    }

    pub fn select_by_number(&mut self, index: usize) -> Result<(), RegistryError> {
        let name = self
            .get_by_number(index)
            .map(ProxyEndpoint::name)
            .ok_or(RegistryError::UnknownIndex(index))?;
        self.selected = Some(name);
        Ok(())
    }

    pub fn deselect(&mut self) {
        self.selected = None;
    }

    pub fn selected(&self) -> Option<&ProxyEndpoint> {
        self.selected.as_deref().and_then(|name| self.get(name))
    }

    /// Renames an endpoint; the new name must be free. Sockets and threads
    /// are untouched, and the selection follows the rename.
    pub fn rename(&mut self, old: &str, new: &str) -> Result<(), RegistryError> {
        if self.get(new).is_some() {
            return Err(RegistryError::DuplicateName(new.to_string()));
        }
        let endpoint = self
            .get(old)
            .ok_or_else(|| RegistryError::UnknownName(old.to_string()))?;
        endpoint.set_name(new);
        if self.selected.as_deref() == Some(old) {
            self.selected = Some(new.to_string());
        }
        Ok(())
    }

    /// Shuts an endpoint down, waits for its threads and removes it.
    pub fn kill(&mut self, name: &str) -> Result<(), RegistryError> {
        let index = self
            .endpoints
            .iter()
            .position(|endpoint| endpoint.name() == name)
            .ok_or_else(|| RegistryError::UnknownName(name.to_string()))?;
        let endpoint = self.endpoints.remove(index);
        endpoint.shutdown();
        endpoint.join();
        if self.selected.as_deref() == Some(name) {
            self.selected = None;
        }
        Ok(())
    }

    /// Requests shutdown everywhere first, then joins, so endpoints wind
    /// down in parallel.
    pub fn shutdown_all(&mut self) {
        for endpoint in &self.endpoints {
            endpoint.shutdown();
        }
        for endpoint in &self.endpoints {
            endpoint.join();
        }
        self.endpoints.clear();
        self.selected = None;
    }

    /// Blocks until every endpoint's accept loop exits.
    pub fn join_all(&self) {
        for endpoint in &self.endpoints {
            endpoint.join();
        }
    }
}

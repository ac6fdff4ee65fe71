//! Responds to a child's "get module" requests by consulting a local
//! cache or recursively asking upstream, then streaming back the module
//! blob plus its transitive dependencies.

use crate::{
    error::Error,
    message::{Envelope, Handler, MessageKind},
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A cached module: its source/bytecode blob and the names of modules it
/// transitively imports (also expected to be in the cache).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    pub blob: Vec<u8>,
    pub dependencies: Vec<String>,
}

/// Request payload for "get module".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetModule {
    pub name: String,
}

pub struct ModuleForwarder {
    cache: Mutex<HashMap<String, Module>>,
}

impl Default for ModuleForwarder {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleForwarder {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, module: Module) {
        self.cache.lock().insert(module.name.clone(), module);
    }

    pub fn get(&self, name: &str) -> Option<Module> {
        self.cache.lock().get(name).cloned()
    }

    /// Handles a `GET_MODULE` request from `requester_id`, arrived on
    /// `handler`. On a cache hit, pushes the module plus every transitive
    /// dependency present in the cache, each as its own `LOAD_MODULE`
    /// message; absent dependencies are skipped (the child re-requests
    /// them later). On a miss, the caller is responsible for recursing
    /// upstream (see `Router::handle_data`'s non-master path) and calling
    /// this again once the module has been inserted.
    pub async fn serve(
        &self,
        handler: &Handler,
        requester_id: u32,
        request: &GetModule,
    ) -> Result<(), Error> {
        let Some(module) = self.get(&request.name) else {
            return Ok(());
        };

        self.push(handler, requester_id, &module).await?;

        for dependency in &module.dependencies {
            match self.get(dependency) {
                Some(dep_module) => self.push(handler, requester_id, &dep_module).await?,
                None => crate::log_warn!("module {} depends on uncached {}", module.name, dependency),
            }
        }

        Ok(())
    }

    async fn push(&self, handler: &Handler, requester_id: u32, module: &Module) -> Result<(), Error> {
        let payload = bincode::serialize(module)
            .map_err(|err| Error::ProtocolViolation(err.to_string().into()))?;
        handler
            .send(&Envelope::new(MessageKind::LoadModule, 0, requester_id, payload))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Handler;

    #[tokio::test]
    async fn pushes_module_and_its_dependencies() {
        let forwarder = ModuleForwarder::new();
        forwarder.insert(Module {
            name: "base".to_string(),
            blob: b"base blob".to_vec(),
            dependencies: vec!["dep".to_string(), "missing".to_string()],
        });
        forwarder.insert(Module {
            name: "dep".to_string(),
            blob: b"dep blob".to_vec(),
            dependencies: vec![],
        });

        let (a, b) = Handler::pair().unwrap();
        forwarder
            .serve(&a, 7, &GetModule { name: "base".to_string() })
            .await
            .unwrap();

        let first = b.recv().await.unwrap().unwrap();
        let first_module: Module = first.decode().unwrap();
        assert_eq!(first_module.name, "base");

        let second = b.recv().await.unwrap().unwrap();
        let second_module: Module = second.decode().unwrap();
        assert_eq!(second_module.name, "dep");
    }

    #[tokio::test]
    async fn miss_sends_nothing() {
        let forwarder = ModuleForwarder::new();
        let (a, b) = Handler::pair().unwrap();
        forwarder
            .serve(&a, 7, &GetModule { name: "nope".to_string() })
            .await
            .unwrap();
        drop(a);
        assert!(b.recv().await.unwrap().is_none());
    }
}

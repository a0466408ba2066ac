//! In-memory container store.

use crate::container::Container;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Containers by full ID.
#[derive(Debug, Default)]
pub struct ContainerStore {
    containers: Mutex<HashMap<String, Arc<Container>>>,
}

impl ContainerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Arc<Container>>>> {
        self.containers
            .lock()
            .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))
    }

    /// Adds a container, refusing a second one with the same ID.
    pub fn add(&self, container: Arc<Container>) -> Result<()> {
        let mut containers = self.lock()?;
        if containers.contains_key(&container.id) {
            return Err(Error::ContainerAlreadyExists(container.id.clone()));
        }
        containers.insert(container.id.clone(), container);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<Container>> {
        self.lock().ok()?.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn delete(&self, id: &str) -> Option<Arc<Container>> {
        self.lock().ok()?.remove(id)
    }

    /// Snapshot of every container, newest first.
    pub fn list(&self) -> Vec<Arc<Container>> {
        let mut list: Vec<Arc<Container>> = match self.lock() {
            Ok(containers) => containers.values().cloned().collect(),
            Err(_) => Vec::new(),
        };
        list.sort_by(|a, b| b.created.cmp(&a.created).then_with(|| a.id.cmp(&b.id)));
        list
    }

    pub fn len(&self) -> usize {
        self.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::generate_id;
    use crate::container::NewContainer;
    use crate::runconfig::{HostConfig, RunConfig};
    use std::path::PathBuf;

    fn container() -> Arc<Container> {
        let id = generate_id();
        Arc::new(Container::new(
            NewContainer {
                id: id.clone(),
                name: format!("/{}", &id[..12]),
                path: "true".to_string(),
                args: Vec::new(),
                config: RunConfig::default(),
                host_config: HostConfig::default(),
                image_id: String::new(),
                driver: "vfs".to_string(),
                exec_driver: "mock".to_string(),
            },
            PathBuf::from("/nonexistent").join(id),
        ))
    }

    #[test]
    fn test_add_get_delete() {
        let store = ContainerStore::new();
        let c = container();
        store.add(c.clone()).unwrap();
        assert!(matches!(
            store.add(c.clone()),
            Err(Error::ContainerAlreadyExists(_))
        ));
        assert!(store.contains(&c.id));
        assert_eq!(store.len(), 1);
        assert!(store.delete(&c.id).is_some());
        assert!(store.is_empty());
    }

    #[test]
    fn test_list_newest_first() {
        let store = ContainerStore::new();
        let first = container();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = container();
        store.add(first.clone()).unwrap();
        store.add(second.clone()).unwrap();

        let list = store.list();
        assert_eq!(list[0].id, second.id);
        assert_eq!(list[1].id, first.id);
    }
}

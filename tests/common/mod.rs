// Shared test object: an entity that unregisters itself when dropped.
#![allow(dead_code)]

use handle_directory::{Directory, Handle, Link, Managed, Persist};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use tracing_subscriber::filter::LevelFilter;

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct Payload {
    pub name: String,
    pub score: i64,
}

pub struct Entity {
    link: Link,
    content: Arc<Mutex<Payload>>,
    home: OnceLock<Arc<Directory<Entity>>>,
}

impl Entity {
    /// Registers a new entity in `dir`, publishing it when `public`.
    pub fn create(dir: &Arc<Directory<Entity>>, name: &str, score: i64, public: bool) -> Arc<Self> {
        let e = Arc::new(Self::restore(Payload {
            name: name.to_string(),
            score,
        }));
        dir.register(&e);
        if public {
            dir.assign_handle(&e);
        }
        e.adopt(dir);
        e
    }

    /// Makes `dir` responsible for this entity's teardown.
    pub fn adopt(&self, dir: &Arc<Directory<Entity>>) {
        assert!(self.home.set(dir.clone()).is_ok(), "entity adopted twice");
    }

    pub fn handle(&self) -> Option<Handle> {
        self.link.handle()
    }

    pub fn raw(&self) -> u64 {
        self.link.raw_handle()
    }

    pub fn payload(&self) -> Payload {
        self.content.lock().clone()
    }

    pub fn name(&self) -> String {
        self.content.lock().name.clone()
    }
}

impl Drop for Entity {
    fn drop(&mut self) {
        if let Some(dir) = self.home.get() {
            dir.remove(self);
        }
    }
}

impl Managed for Entity {
    type Content = Payload;

    fn link(&self) -> &Link {
        &self.link
    }

    fn content(&self) -> &Arc<Mutex<Payload>> {
        &self.content
    }
}

impl Persist for Entity {
    type Payload = Payload;

    fn save(&self, content: &Payload) -> Payload {
        content.clone()
    }

    fn restore(payload: Payload) -> Self {
        Self {
            link: Link::new(),
            content: Arc::new(Mutex::new(payload)),
            home: OnceLock::new(),
        }
    }
}

pub fn directory() -> Arc<Directory<Entity>> {
    init_tracing();
    Arc::new(Directory::new())
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(LevelFilter::DEBUG)
        .try_init();
}

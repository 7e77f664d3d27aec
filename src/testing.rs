//! Minimal managed object for unit tests.

use crate::codec::Persist;
use crate::object::{Link, Managed};
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug)]
pub(crate) struct Node {
    link: Link,
    content: Arc<Mutex<i64>>,
}

impl Node {
    pub(crate) fn new(value: i64) -> Arc<Self> {
        Arc::new(Self::restore(value))
    }

    pub(crate) fn value(&self) -> i64 {
        *self.content.lock()
    }
}

impl Managed for Node {
    type Content = i64;

    fn link(&self) -> &Link {
        &self.link
    }

    fn content(&self) -> &Arc<Mutex<i64>> {
        &self.content
    }
}

impl Persist for Node {
    type Payload = i64;

    fn save(&self, content: &i64) -> i64 {
        *content
    }

    fn restore(payload: i64) -> Self {
        Self {
            link: Link::new(),
            content: Arc::new(Mutex::new(payload)),
        }
    }
}

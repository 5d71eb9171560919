use std::fmt::{self, Display};
use std::sync::Arc;

use ctrlkit::QueueKeysFn;
use serde::{Deserialize, Serialize};

/// A namespaced object as delivered by a [`FakeSource`](crate::FakeSource).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TestObject {
    pub namespace: String,
    pub name: String,
    pub generation: u64,
}

impl TestObject {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            generation: 1,
        }
    }

    /// A copy with the generation bumped, as seen in an update.
    pub fn next_generation(&self) -> Self {
        Self {
            generation: self.generation + 1,
            ..self.clone()
        }
    }

    /// `namespace/name`, or just `name` for cluster-scoped objects.
    pub fn key(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.namespace, self.name)
        }
    }

    /// Key function mapping an object to its [`key`](Self::key).
    pub fn queue_keys() -> QueueKeysFn<TestObject> {
        Arc::new(|obj: &TestObject| vec![obj.key()])
    }
}

impl Display for TestObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.key(), self.generation)
    }
}

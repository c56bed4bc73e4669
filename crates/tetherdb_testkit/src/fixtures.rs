//! Test fixtures and store helpers.
//!
//! Provides a sample schema and convenience types for setting up test
//! stores that clean up after themselves.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use tempfile::TempDir;
use tetherdb_core::{
    Handle, Object, ObjectSchema, PropertyType, StaticSchemaMediator, StoreConfiguration,
    StoreConfigurationBuilder,
};
use tetherdb_storage::InMemoryBackend;

static NEXT_STORE: AtomicU64 = AtomicU64::new(0);

/// Returns a process-unique in-memory store name.
pub fn unique_name(prefix: &str) -> String {
    format!("{prefix}-{}", NEXT_STORE.fetch_add(1, Ordering::Relaxed))
}

/// Sample schema used across the testkit.
///
/// - `Person`: integer primary key `id`, `name`, `age`, a `dog` link and a
///   `friends` list of people.
/// - `Dog`: `name` and an `owner` link back to a person. No primary key.
/// - `Note`: a single `text` property. No primary key.
pub fn demo_schemas() -> Vec<ObjectSchema> {
    vec![
        ObjectSchema::builder("Person")
            .property("id", PropertyType::Integer)
            .property("name", PropertyType::Text)
            .property("age", PropertyType::Integer)
            .property("dog", PropertyType::Object("Dog".into()))
            .property("friends", PropertyType::List("Person".into()))
            .primary_key("id")
            .build()
            .expect("Person schema is valid"),
        ObjectSchema::builder("Dog")
            .property("name", PropertyType::Text)
            .property("owner", PropertyType::Object("Person".into()))
            .build()
            .expect("Dog schema is valid"),
        ObjectSchema::builder("Note")
            .property("text", PropertyType::Text)
            .build()
            .expect("Note schema is valid"),
    ]
}

/// Mediator over [`demo_schemas`].
pub fn demo_mediator() -> StaticSchemaMediator {
    StaticSchemaMediator::new(demo_schemas()).expect("demo schemas are consistent")
}

/// A detached `Person`.
pub fn person(id: i64, name: &str) -> Object {
    Object::new("Person").with("id", id).with("name", name)
}

/// A detached `Dog`.
pub fn dog(name: &str) -> Object {
    Object::new("Dog").with("name", name)
}

/// A detached `Note`.
pub fn note(text: &str) -> Object {
    Object::new("Note").with("text", text)
}

enum Backing {
    Memory {
        name: String,
        buffer: InMemoryBackend,
    },
    File(TempDir),
}

/// A test store with automatic cleanup.
///
/// In-memory stores get a unique name and their own buffer, so contents
/// survive closing every handle. File stores live in a temporary
/// directory removed on drop.
pub struct TestStore {
    config: StoreConfiguration,
    backing: Backing,
}

impl TestStore {
    /// Creates an in-memory store over the demo schema.
    pub fn memory() -> Self {
        Self::memory_with(|builder| builder)
    }

    /// Creates an in-memory store, letting `customize` adjust the builder.
    pub fn memory_with(
        customize: impl FnOnce(StoreConfigurationBuilder) -> StoreConfigurationBuilder,
    ) -> Self {
        let backing = Backing::Memory {
            name: unique_name("testkit"),
            buffer: InMemoryBackend::new(),
        };
        let config = build(&backing, customize);
        Self { config, backing }
    }

    /// Creates a file store over the demo schema.
    pub fn file() -> Self {
        Self::file_with(|builder| builder)
    }

    /// Creates a file store, letting `customize` adjust the builder.
    pub fn file_with(
        customize: impl FnOnce(StoreConfigurationBuilder) -> StoreConfigurationBuilder,
    ) -> Self {
        let backing = Backing::File(TempDir::new().expect("Failed to create temp directory"));
        let config = build(&backing, customize);
        Self { config, backing }
    }

    /// Builds another configuration for the same location.
    pub fn reconfigure(
        &self,
        customize: impl FnOnce(StoreConfigurationBuilder) -> StoreConfigurationBuilder,
    ) -> StoreConfiguration {
        build(&self.backing, customize)
    }

    /// The store's configuration.
    pub fn config(&self) -> &StoreConfiguration {
        &self.config
    }

    /// Opens a handle on the calling thread.
    pub fn open(&self) -> Handle {
        Handle::open(&self.config).expect("Failed to open handle")
    }

    /// The buffer behind an in-memory store.
    pub fn buffer(&self) -> Option<&InMemoryBackend> {
        match &self.backing {
            Backing::Memory { buffer, .. } => Some(buffer),
            Backing::File(_) => None,
        }
    }

    /// The store file, for file stores.
    pub fn path(&self) -> Option<PathBuf> {
        self.config.location().path().map(PathBuf::from)
    }
}

fn build(
    backing: &Backing,
    customize: impl FnOnce(StoreConfigurationBuilder) -> StoreConfigurationBuilder,
) -> StoreConfiguration {
    let builder = match backing {
        Backing::Memory { name, buffer } => {
            StoreConfiguration::builder().in_memory_backend(name.clone(), buffer.clone())
        }
        Backing::File(dir) => StoreConfiguration::builder().directory(dir.path()),
    };
    customize(builder.mediator(demo_mediator()))
        .build()
        .expect("Failed to build configuration")
}

/// Runs a test with a handle on a fresh in-memory store.
pub fn with_handle<F, R>(f: F) -> R
where
    F: FnOnce(&Handle) -> R,
{
    let store = TestStore::memory();
    let handle = store.open();
    f(&handle)
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;

    /// A store holding `count` people with ids `0..count`.
    pub fn populated_store(count: i64) -> TestStore {
        let store = TestStore::memory();
        let handle = store.open();
        handle
            .execute_transaction(|h| {
                for id in 0..count {
                    h.copy_to_store(&person(id, &format!("person-{id}")))?;
                }
                Ok(())
            })
            .expect("Failed to populate store");
        store
    }

    /// Two people who list each other as friends and share a dog.
    pub fn befriended_pair() -> (Object, Object) {
        let a = person(1, "a");
        let b = person(2, "b");
        let rex = dog("rex");
        a.push("friends", &b);
        b.push("friends", &a);
        a.set_link("dog", Some(&rex));
        b.set_link("dog", Some(&rex));
        rex.set_link("owner", Some(&a));
        (a, b)
    }

    /// Breaks the reference cycles [`befriended_pair`] creates.
    pub fn release_pair(pair: (Object, Object)) {
        let (a, b) = pair;
        if let Some(rex) = a.link("dog") {
            rex.clear_references();
        }
        a.clear_references();
        b.clear_references();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tetherdb_core::HandleRegistry;

    #[test]
    fn test_memory_store() {
        let store = TestStore::memory();
        let handle = store.open();
        assert_eq!(handle.count("Person").unwrap(), 0);
        assert!(store.buffer().is_some());
        assert!(store.path().is_none());
    }

    #[test]
    fn test_memory_contents_survive_reopen() {
        let store = scenarios::populated_store(3);
        assert_eq!(HandleRegistry::ref_count(store.config()), 0);
        assert_eq!(store.open().count("Person").unwrap(), 3);
    }

    #[test]
    fn test_file_store() {
        let store = TestStore::file();
        {
            let handle = store.open();
            handle
                .execute_transaction(|h| h.copy_to_store(&note("hello")).map(drop))
                .unwrap();
        }
        assert!(store.path().unwrap().exists());
        assert_eq!(store.open().count("Note").unwrap(), 1);
    }

    #[test]
    fn test_with_handle() {
        let count = with_handle(|handle| handle.count("Dog").unwrap());
        assert_eq!(count, 0);
    }

    #[test]
    fn test_unique_names() {
        assert_ne!(unique_name("x"), unique_name("x"));
    }
}

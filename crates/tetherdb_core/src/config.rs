//! Store configuration.
//!
//! A [`StoreConfiguration`] identifies a store and how it is opened. It is
//! immutable once built and compared by value, so it doubles as the key the
//! handle registry caches handles under.

use crate::error::{CoreError, CoreResult};
use crate::handle::Handle;
use crate::migration::{FnMigration, Migration, MigrationContext};
use crate::schema::{ObjectSchema, SchemaMediator};
use parking_lot::RwLock;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tetherdb_storage::{EncryptionKey, InMemoryBackend};

/// File name used when none is configured.
pub const DEFAULT_FILE_NAME: &str = "default.tether";

/// Transaction run once, when a store is created.
pub type InitialData = Arc<dyn Fn(&Handle) -> CoreResult<()> + Send + Sync>;

/// Where a store lives.
#[derive(Clone)]
pub enum StoreLocation {
    /// A commit log file.
    File(PathBuf),
    /// A named in-memory store.
    Memory {
        /// Store name.
        name: String,
        /// Buffer holding the commit log. Without one, the contents live as
        /// long as some handle keeps the store open.
        backend: Option<InMemoryBackend>,
    },
}

/// Identity of a location, ignoring how its bytes are held.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LocationKey {
    /// File path.
    File(PathBuf),
    /// In-memory store name.
    Memory(String),
}

impl StoreLocation {
    /// Identity of this location.
    #[must_use]
    pub fn key(&self) -> LocationKey {
        match self {
            Self::File(path) => LocationKey::File(path.clone()),
            Self::Memory { name, .. } => LocationKey::Memory(name.clone()),
        }
    }

    /// File path, for file-backed stores.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::File(path) => Some(path),
            Self::Memory { .. } => None,
        }
    }

    fn same_backing(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::File(a), Self::File(b)) => a == b,
            (
                Self::Memory {
                    name: a,
                    backend: ba,
                },
                Self::Memory {
                    name: b,
                    backend: bb,
                },
            ) => {
                a == b
                    && match (ba, bb) {
                        (None, None) => true,
                        (Some(x), Some(y)) => x.shares_buffer_with(y),
                        _ => false,
                    }
            }
            _ => false,
        }
    }
}

impl fmt::Display for StoreLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => write!(f, "{}", path.display()),
            Self::Memory { name, .. } => write!(f, "memory:{name}"),
        }
    }
}

impl fmt::Debug for StoreLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StoreLocation({self})")
    }
}

struct ConfigInner {
    location: StoreLocation,
    schema_version: u64,
    encryption_key: Option<EncryptionKey>,
    migration: Option<Arc<dyn Migration>>,
    mediator: Arc<dyn SchemaMediator>,
    initial_data: Option<InitialData>,
    sync_on_commit: bool,
}

/// Immutable configuration of one store.
///
/// Cloning is cheap. Two configurations are equal when they name the same
/// location with the same schema version, key, durability and schemas, and
/// share the same migration and initial-data callbacks.
#[derive(Clone)]
pub struct StoreConfiguration {
    inner: Arc<ConfigInner>,
}

impl StoreConfiguration {
    /// Starts building a configuration.
    #[must_use]
    pub fn builder() -> StoreConfigurationBuilder {
        StoreConfigurationBuilder::default()
    }

    /// Store location.
    #[must_use]
    pub fn location(&self) -> &StoreLocation {
        &self.inner.location
    }

    /// Schema version the store must be at once opened.
    #[must_use]
    pub fn schema_version(&self) -> u64 {
        self.inner.schema_version
    }

    /// Encryption key, if the store is encrypted.
    #[must_use]
    pub fn encryption_key(&self) -> Option<&EncryptionKey> {
        self.inner.encryption_key.as_ref()
    }

    /// Migration run when the stored schema version is older.
    #[must_use]
    pub fn migration(&self) -> Option<&Arc<dyn Migration>> {
        self.inner.migration.as_ref()
    }

    /// Schema mediator for the model classes.
    #[must_use]
    pub fn mediator(&self) -> &Arc<dyn SchemaMediator> {
        &self.inner.mediator
    }

    /// Transaction run once when the store is first created.
    #[must_use]
    pub fn initial_data(&self) -> Option<&InitialData> {
        self.inner.initial_data.as_ref()
    }

    /// Whether every commit is synced to durable storage.
    #[must_use]
    pub fn sync_on_commit(&self) -> bool {
        self.inner.sync_on_commit
    }

    fn schemas(&self) -> Vec<ObjectSchema> {
        let mediator = &self.inner.mediator;
        mediator
            .model_classes()
            .iter()
            .filter_map(|class| mediator.object_schema(class).cloned())
            .collect()
    }
}

fn same_callback<T: ?Sized>(a: Option<&Arc<T>>, b: Option<&Arc<T>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => std::ptr::eq(Arc::as_ptr(a).cast::<()>(), Arc::as_ptr(b).cast::<()>()),
        _ => false,
    }
}

impl PartialEq for StoreConfiguration {
    fn eq(&self, other: &Self) -> bool {
        if Arc::ptr_eq(&self.inner, &other.inner) {
            return true;
        }
        let (a, b) = (&self.inner, &other.inner);
        a.location.same_backing(&b.location)
            && a.schema_version == b.schema_version
            && a.encryption_key == b.encryption_key
            && a.sync_on_commit == b.sync_on_commit
            && same_callback(a.migration.as_ref(), b.migration.as_ref())
            && same_callback(a.initial_data.as_ref(), b.initial_data.as_ref())
            && self.schemas() == other.schemas()
    }
}

impl Eq for StoreConfiguration {}

impl Hash for StoreConfiguration {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.location.key().hash(state);
        self.inner.schema_version.hash(state);
        self.inner.encryption_key.hash(state);
        self.inner.sync_on_commit.hash(state);
    }
}

impl fmt::Debug for StoreConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfiguration")
            .field("location", &self.inner.location)
            .field("schema_version", &self.inner.schema_version)
            .field("encrypted", &self.inner.encryption_key.is_some())
            .field("migration", &self.inner.migration.is_some())
            .field("initial_data", &self.inner.initial_data.is_some())
            .field("sync_on_commit", &self.inner.sync_on_commit)
            .finish_non_exhaustive()
    }
}

/// Builder for [`StoreConfiguration`].
#[must_use]
pub struct StoreConfigurationBuilder {
    directory: Option<PathBuf>,
    file_name: String,
    memory: Option<(String, Option<InMemoryBackend>)>,
    schema_version: u64,
    encryption_key: Option<Vec<u8>>,
    migration: Option<Arc<dyn Migration>>,
    mediator: Option<Arc<dyn SchemaMediator>>,
    initial_data: Option<InitialData>,
    sync_on_commit: bool,
}

impl Default for StoreConfigurationBuilder {
    fn default() -> Self {
        Self {
            directory: None,
            file_name: DEFAULT_FILE_NAME.to_string(),
            memory: None,
            schema_version: 0,
            encryption_key: None,
            migration: None,
            mediator: None,
            initial_data: None,
            sync_on_commit: true,
        }
    }
}

impl StoreConfigurationBuilder {
    /// Sets the directory the store file lives in.
    pub fn directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = Some(directory.into());
        self
    }

    /// Sets the store file name.
    pub fn name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = file_name.into();
        self
    }

    /// Uses a named in-memory store instead of a file.
    pub fn in_memory(mut self, name: impl Into<String>) -> Self {
        self.memory = Some((name.into(), None));
        self
    }

    /// Uses a named in-memory store whose commit log is kept in `backend`.
    ///
    /// The buffer outlives every handle, so the store can be reopened.
    pub fn in_memory_backend(mut self, name: impl Into<String>, backend: InMemoryBackend) -> Self {
        self.memory = Some((name.into(), Some(backend)));
        self
    }

    /// Sets the schema version.
    pub const fn schema_version(mut self, version: u64) -> Self {
        self.schema_version = version;
        self
    }

    /// Encrypts the store with a 32-byte key.
    pub fn encryption_key(mut self, key: &[u8]) -> Self {
        self.encryption_key = Some(key.to_vec());
        self
    }

    /// Sets the migration run for older stores.
    pub fn migration(mut self, migration: impl Migration + 'static) -> Self {
        self.migration = Some(Arc::new(migration));
        self
    }

    /// Sets a closure as the migration run for older stores.
    pub fn migration_fn<F>(self, migrate: F) -> Self
    where
        F: Fn(&mut MigrationContext<'_>, u64, u64) -> CoreResult<()> + Send + Sync + 'static,
    {
        self.migration(FnMigration::new(migrate))
    }

    /// Sets the schema mediator.
    pub fn mediator(mut self, mediator: impl SchemaMediator + 'static) -> Self {
        self.mediator = Some(Arc::new(mediator));
        self
    }

    /// Sets a shared schema mediator.
    pub fn shared_mediator(mut self, mediator: Arc<dyn SchemaMediator>) -> Self {
        self.mediator = Some(mediator);
        self
    }

    /// Sets the transaction run once when the store is created.
    pub fn initial_data<F>(mut self, transaction: F) -> Self
    where
        F: Fn(&Handle) -> CoreResult<()> + Send + Sync + 'static,
    {
        self.initial_data = Some(Arc::new(transaction));
        self
    }

    /// Sets whether commits are synced to durable storage.
    pub const fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }

    /// Validates and builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if no location or mediator was set, the
    /// file or store name is empty, or the key is not 32 bytes. Returns an
    /// I/O error if the store path cannot be resolved.
    pub fn build(self) -> CoreResult<StoreConfiguration> {
        let mediator = self
            .mediator
            .ok_or_else(|| CoreError::invalid_argument("a schema mediator is required"))?;

        let location = match (self.memory, self.directory) {
            (Some((name, backend)), _) => {
                if name.is_empty() {
                    return Err(CoreError::invalid_argument("in-memory store name must not be empty"));
                }
                StoreLocation::Memory { name, backend }
            }
            (None, Some(directory)) => {
                if self.file_name.is_empty() {
                    return Err(CoreError::invalid_argument("file name must not be empty"));
                }
                StoreLocation::File(canonical_path(&directory.join(self.file_name))?)
            }
            (None, None) => {
                return Err(CoreError::invalid_argument(
                    "a directory or an in-memory name is required",
                ))
            }
        };

        let encryption_key = self
            .encryption_key
            .map(|bytes| {
                EncryptionKey::from_bytes(&bytes)
                    .map_err(|e| CoreError::invalid_argument(format!("encryption key: {e}")))
            })
            .transpose()?;

        Ok(StoreConfiguration {
            inner: Arc::new(ConfigInner {
                location,
                schema_version: self.schema_version,
                encryption_key,
                migration: self.migration,
                mediator,
                initial_data: self.initial_data,
                sync_on_commit: self.sync_on_commit,
            }),
        })
    }
}

/// Resolves `path` to the one spelling every configuration of the same file
/// shares: absolute, with symlinks, `.` and `..` resolved. Components that
/// do not exist yet are normalized lexically.
fn canonical_path(path: &Path) -> CoreResult<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    let components: Vec<Component<'_>> = absolute.components().collect();

    let mut existing = components.len();
    while existing > 0 && !components[..existing].iter().collect::<PathBuf>().exists() {
        existing -= 1;
    }
    let mut resolved = if existing == 0 {
        PathBuf::new()
    } else {
        components[..existing].iter().collect::<PathBuf>().canonicalize()?
    };
    for component in &components[existing..] {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                resolved.pop();
            }
            other => resolved.push(other.as_os_str()),
        }
    }
    Ok(resolved)
}

static DEFAULT_CONFIGURATION: RwLock<Option<StoreConfiguration>> = parking_lot::const_rwlock(None);

/// Sets the process-wide default configuration used by
/// [`Handle::open_default`].
pub fn set_default_configuration(config: StoreConfiguration) {
    *DEFAULT_CONFIGURATION.write() = Some(config);
}

/// Clears the process-wide default configuration.
pub fn remove_default_configuration() {
    *DEFAULT_CONFIGURATION.write() = None;
}

/// Returns the process-wide default configuration, if set.
#[must_use]
pub fn default_configuration() -> Option<StoreConfiguration> {
    DEFAULT_CONFIGURATION.read().clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ObjectSchema, PropertyType, StaticSchemaMediator};

    fn mediator() -> StaticSchemaMediator {
        StaticSchemaMediator::new(vec![ObjectSchema::builder("Note")
            .property("text", PropertyType::Text)
            .build()
            .unwrap()])
        .unwrap()
    }

    #[test]
    fn build_requires_mediator_and_location() {
        let err = StoreConfiguration::builder().in_memory("a").build().unwrap_err();
        assert!(err.to_string().contains("mediator"));

        let err = StoreConfiguration::builder().mediator(mediator()).build().unwrap_err();
        assert!(err.is_usage_error());

        let err = StoreConfiguration::builder()
            .directory("/tmp")
            .name("")
            .mediator(mediator())
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("file name"));
    }

    #[test]
    fn build_rejects_short_key() {
        let err = StoreConfiguration::builder()
            .in_memory("a")
            .encryption_key(&[1; 16])
            .mediator(mediator())
            .build()
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidArgument);
    }

    #[test]
    fn equality_is_by_value() {
        let a = StoreConfiguration::builder()
            .directory("/data")
            .schema_version(2)
            .mediator(mediator())
            .build()
            .unwrap();
        let b = StoreConfiguration::builder()
            .directory("/data")
            .name(DEFAULT_FILE_NAME)
            .schema_version(2)
            .mediator(mediator())
            .build()
            .unwrap();
        let c = StoreConfiguration::builder()
            .directory("/data")
            .schema_version(3)
            .mediator(mediator())
            .build()
            .unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(
            a.location().path(),
            Some(Path::new("/data").join(DEFAULT_FILE_NAME).as_path())
        );
    }

    #[test]
    fn file_locations_are_canonical() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let at = |directory: PathBuf| {
            StoreConfiguration::builder()
                .directory(directory)
                .name("app.tether")
                .mediator(mediator())
                .build()
                .unwrap()
        };

        let direct = at(dir.path().to_path_buf());
        let detour = at(dir.path().join("sub").join(".."));
        let not_yet_created = at(dir.path().join("later").join(".").join(".."));

        assert_eq!(direct, detour);
        assert_eq!(direct.location().key(), detour.location().key());
        assert_eq!(direct.location().path(), not_yet_created.location().path());
        assert!(direct.location().path().unwrap().is_absolute());
    }

    #[test]
    fn callbacks_compare_by_identity() {
        let base = || StoreConfiguration::builder().in_memory("cb").mediator(mediator());
        let a = base().initial_data(|_| Ok(())).build().unwrap();
        let b = base().initial_data(|_| Ok(())).build().unwrap();
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn memory_backends_compare_by_buffer() {
        let buffer = InMemoryBackend::new();
        let a = StoreConfiguration::builder()
            .in_memory_backend("m", buffer.clone())
            .mediator(mediator())
            .build()
            .unwrap();
        let b = StoreConfiguration::builder()
            .in_memory_backend("m", buffer)
            .mediator(mediator())
            .build()
            .unwrap();
        let c = StoreConfiguration::builder()
            .in_memory_backend("m", InMemoryBackend::new())
            .mediator(mediator())
            .build()
            .unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn default_configuration_round_trip() {
        let config = StoreConfiguration::builder()
            .in_memory("default-config-test")
            .mediator(mediator())
            .build()
            .unwrap();
        set_default_configuration(config.clone());
        assert_eq!(default_configuration(), Some(config));
        remove_default_configuration();
        assert_eq!(default_configuration(), None);
    }
}

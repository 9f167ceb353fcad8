//! # Skyform
//!
//! Skyform is a library for declaring AWS infrastructure in Rust and driving
//! it through its create, read, update and delete lifecycle. Resources are
//! typed structs implementing [`Resource`]; a [`Store`] compares what you
//! declare against what it has on file, plans the difference as a Directed
//! Acyclic Graph of actions, and applies it against the platform.
//!
//! Next to the lifecycle engine the crate carries the pieces an AWS provider
//! needs around it:
//!
//! - [`tags`] reconciles key/value tags between what is stored and what is
//!   desired.
//! - [`sweep`] lists and force-deletes resources leaked by acceptance tests.
//! - [`acctest`] runs multi-step acceptance scenarios against a [`Store`].
//! - [`aws`] holds the AWS client registry and the resources themselves.
//!
//! ### Concepts
//!
//! Skyform operates on the local and remote states of resources:
//!
//! - **Local State**: the desired state of the resource as defined in your
//!   Rust code.
//! - **Remote State**: the state of the resource as it exists on the platform,
//!   as returned by the platform's API. Every remote state carries an
//!   identifier (an ARN or service ID) that addresses the object afterwards.
//!
//! Both are written to one JSON store file per resource. On the next run the
//! stored local state decides whether a resource is loaded, updated, replaced
//! or created, and stored files without a matching declaration are destroyed.
//!
//! ## Error Handling
//!
//! Lifecycle operations return [`Error`]. Resource implementations bring their
//! own error type, which must implement [`Classify`] so the store can tell a
//! resource that is gone apart from a call that failed.
extern crate self as sky;

use std::{collections::HashMap, future::Future, ops::Deref, pin::Pin};

use dagga::{Node, Schedule};
use snafu::prelude::*;
use tokio::io::AsyncWriteExt;

pub use skyform_derive::HasDependencies;

pub mod acctest;
pub mod api;
pub mod aws;
mod has_dependencies_impl;
pub mod remote;
pub mod state;
pub mod sweep;
pub mod tags;

pub use api::{ApiError, Classify, ErrorClass};
use remote::{Remote, RemoteVar, Remotes};
use state::State;

/// Marker trait for userland errors.
pub trait UserError: core::fmt::Display + core::fmt::Debug + 'static {}
impl<T: core::fmt::Display + core::fmt::Debug + 'static> UserError for T {}

/// Top-level error enum that encompasses all errors.
#[derive(snafu::Snafu, Debug)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Could not read store file '{path:?}': {source}"))]
    StoreFileRead {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Could not delete store file '{path:?}': {source}"))]
    StoreFileDelete {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Could not serialize stored '{name}': {source}"))]
    Serialize {
        name: String,
        source: serde_json::Error,
    },

    #[snafu(display("Could not deserialize stored '{name}': {source}"))]
    Deserialize {
        name: String,
        source: serde_json::Error,
    },

    #[snafu(display("Could not build schedule: {msg}"))]
    Schedule { msg: String },

    #[snafu(display("Could not create file {path:?}: {source}"))]
    CreateFile {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Could not write file {path:?}: {source}"))]
    WriteFile {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Remote value of {ty:?} is unresolved. Depends on {depends_on}"))]
    RemoteUnresolved {
        ty: &'static str,
        depends_on: String,
    },

    #[snafu(display("Could not find a resource by the name '{name}'"))]
    MissingResource { name: String },

    #[snafu(display("Error during '{name}' creation: {error}"))]
    Create {
        name: String,
        error: Box<dyn UserError>,
    },

    #[snafu(display("Error during '{name}' read and import: {error}"))]
    Read {
        name: String,
        error: Box<dyn UserError>,
    },

    #[snafu(display("Error during '{name}' refresh: {error}"))]
    Refresh {
        name: String,
        error: Box<dyn UserError>,
    },

    #[snafu(display("Error during '{name}' update: {error}"))]
    Update {
        name: String,
        error: Box<dyn UserError>,
    },

    #[snafu(display("Error during '{name}' replacement: {error}"))]
    Replace {
        name: String,
        error: Box<dyn UserError>,
    },

    #[snafu(display("Error during '{name}' destruction: {error}"))]
    Destroy {
        name: String,
        error: Box<dyn UserError>,
    },

    #[snafu(display("Missing previous remote value '{name}'"))]
    Load { name: String },

    #[snafu(display("Could not downcast"))]
    Downcast,

    #[snafu(display("Missing store file for '{id}'"))]
    MissingStoreFile { id: String },

    #[snafu(display("Could not scan store directory '{path:?}': {source}"))]
    ScanStoreDir {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Not found in state: {name}"))]
    MissingState { name: String },

    #[snafu(display("Check failed for '{name}': {message}"))]
    Check { name: String, message: String },

    #[snafu(display("Check could not {verb} '{name}': {error}"))]
    CheckResource {
        verb: &'static str,
        name: String,
        error: Box<dyn UserError>,
    },

    #[snafu(display("{kind} ({identifier}) still exists, it was not destroyed"))]
    NotDestroyed {
        kind: &'static str,
        identifier: String,
    },

    #[snafu(display("After applying step {step} the plan was not empty:\n{plan}"))]
    NonEmptyPlan { step: usize, plan: String },

    #[snafu(display("Expected a non-empty plan after step {step}, but got an empty plan"))]
    EmptyPlan { step: usize },

    #[snafu(display("Imported '{name}' does not match its stored state:\n{diff}"))]
    ImportVerify { name: String, diff: String },

    #[snafu(display("Step {step}: {source}"))]
    Step {
        step: usize,
        #[snafu(source(from(Error, Box::new)))]
        source: Box<Error>,
    },
}

type Result<T, E = Error> = core::result::Result<T, E>;

/// IaC resources.
///
/// Represents a resource created on a platform (ie AWS).
///
/// `read` and `delete` address the resource by its identifier alone, so they
/// can be used for import, refresh, orphan deletion and sweeping, all of
/// which happen without a local definition in hand.
#[allow(unreachable_code)]
pub trait Resource:
    core::fmt::Debug
    + Clone
    + PartialEq
    + HasDependencies
    + serde::Serialize
    + serde::de::DeserializeOwned
    + 'static
{
    /// Type of the platform/resource provider.
    ///
    /// For example [`aws::Aws`] in the case of amazon web services.
    type Provider: 'static;

    /// Errors that may occur interacting with the provider.
    type Error: UserError + Classify;

    /// The remote type of this resource, which we can used to fill in
    /// [`Remote`] values in other resources.
    type Output: core::fmt::Debug
        + Clone
        + PartialEq
        + serde::Serialize
        + serde::de::DeserializeOwned
        + 'static;

    /// Creates a new resource on the platform.
    ///
    /// ## Note
    /// This method is explicitly `unimplemented!` for developer convenience.
    /// It allows you to define only the methods you need. However, take care when
    /// using this in contexts like long-running daemons, as calling an unimplemented
    /// method will cause a panic.
    fn create(
        &self,
        _provider: &Self::Provider,
    ) -> impl Future<Output = Result<Self::Output, Self::Error>> {
        unimplemented!(
            "Resource::create is unimplemented for {}",
            std::any::type_name::<Self>()
        ) as Box<dyn Future<Output = Result<_, _>> + Unpin>
    }

    /// Reads the current state of the resource with the given identifier.
    ///
    /// Must fail with an error classified [`ErrorClass::NotFound`] when the
    /// resource no longer exists.
    fn read(
        _provider: &Self::Provider,
        _identifier: &str,
    ) -> impl Future<Output = Result<Self::Output, Self::Error>> + Send {
        unimplemented!(
            "Resource::read is unimplemented for {}",
            std::any::type_name::<Self>()
        ) as Box<dyn Future<Output = Result<_, _>> + Unpin + Send>
    }

    /// Updates an existing resource on the platform in place.
    ///
    /// ## Note
    /// This method is explicitly `unimplemented!` for developer convenience.
    fn update(
        &self,
        _provider: &Self::Provider,
        _previous_local: &Self,
        _previous_remote: &Self::Output,
    ) -> impl Future<Output = Result<Self::Output, Self::Error>> {
        unimplemented!(
            "Resource::update is unimplemented for {}",
            std::any::type_name::<Self>()
        ) as Box<dyn Future<Output = Result<_, _>> + Unpin>
    }

    /// Deletes the resource with the given identifier from the platform.
    ///
    /// ## Note
    /// This method is explicitly `unimplemented!` for developer convenience.
    fn delete(
        _provider: &Self::Provider,
        _identifier: &str,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        unimplemented!(
            "Resource::delete is unimplemented for {}",
            std::any::type_name::<Self>()
        ) as Box<dyn Future<Output = Result<_, _>> + Unpin + Send>
    }

    /// Returns the identifier that addresses this resource on the platform.
    fn identifier(output: &Self::Output) -> String;

    /// Returns `true` when changing from `previous` to `self` can't be done in
    /// place, and the resource must be destroyed and created again.
    fn requires_replacement(&self, _previous: &Self) -> bool {
        false
    }

    /// Returns `true` when the remote state no longer matches `self`, even
    /// though the local definition has not changed.
    fn drifted(&self, _remote: &Self::Output) -> bool {
        false
    }

    /// A short name for the kind of resource, used in messages.
    fn kind() -> &'static str {
        std::any::type_name::<Self>()
    }
}

#[derive(Clone, Default, Debug)]
pub struct Dependencies {
    /// Specifies a dependency on a `Resource`.
    inner: Vec<String>,
}

impl IntoIterator for Dependencies {
    type Item = String;

    type IntoIter = <Vec<String> as IntoIterator>::IntoIter;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.into_iter()
    }
}

impl core::fmt::Display for Dependencies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.inner.join(", "))
    }
}

impl Dependencies {
    pub fn merge(self, other: Self) -> Self {
        Dependencies {
            inner: [self.inner, other.inner].concat(),
        }
    }
}

/// Tracks dependencies between resources.
///
/// This trait can be derived, and has a default implementation that
/// reports zero dependencies.
pub trait HasDependencies {
    fn dependencies(&self) -> Dependencies {
        Dependencies::default()
    }
}

/// `Create`, `Load`, `Read`, `Update` and `Replace` result in a resource being
/// added to the graph.
///
/// `Destroy` moves the resource out of the graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Action {
    Load,
    Create,
    Read,
    Update,
    Replace,
    Destroy,
}

impl core::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Action::Load => "load",
            Action::Create => "create",
            Action::Read => "read",
            Action::Update => "update",
            Action::Replace => "replace",
            Action::Destroy => "destroy",
        })
    }
}

/// The contents of one store file.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
struct StoreFile {
    name: String,
    local: serde_json::Value,
    remote: serde_json::Value,
    /// The Rust type name of the resource (via `std::any::type_name::<T>()`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    type_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    identifier: Option<String>,
    /// The resource IDs this resource depends on.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    dependencies: Vec<String>,
}

impl StoreFile {
    fn read(store_path: impl AsRef<std::path::Path>, id: &str) -> Result<Self> {
        let path = store_file_path(id, store_path);
        snafu::ensure!(path.exists(), MissingStoreFileSnafu { id: id.to_owned() });

        log::debug!("{path:?} exists, reading '{id}' from it");
        let contents = std::fs::read_to_string(&path).context(StoreFileReadSnafu {
            path: path.to_path_buf(),
        })?;
        log::trace!("contents:\n{}", indent(&contents));
        serde_json::from_str(&contents).context(DeserializeSnafu {
            name: id.to_owned(),
        })
    }

    async fn save(&self, store_path: impl AsRef<std::path::Path>) -> Result<(), Error> {
        let path = store_file_path(&self.name, &store_path);
        log::info!("  storing {} to {path:?}", self.name);

        let contents = serde_json::to_string_pretty(self).context(SerializeSnafu {
            name: format!("storing {}", self.name),
        })?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(&parent)
                .await
                .context(CreateFileSnafu { path: parent })?;
        }

        let mut file = tokio::fs::File::create(&path)
            .await
            .context(CreateFileSnafu { path: path.clone() })?;
        file.write_all(contents.as_bytes())
            .await
            .context(WriteFileSnafu { path: path.clone() })?;
        // tokio writes on a blocking task, the file must be flushed before
        // anything reads it back
        file.flush().await.context(WriteFileSnafu { path })?;
        Ok(())
    }

    async fn remove(store_path: impl AsRef<std::path::Path>, id: &str) -> Result<()> {
        let path = store_file_path(id, store_path);
        log::info!("  removing {id} store file {path:?}");
        tokio::fs::remove_file(&path)
            .await
            .context(StoreFileDeleteSnafu { path })
    }
}

fn indent(s: &str) -> String {
    s.lines()
        .map(|line| format!("  {line}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// A resource declared in a [`Store`].
#[derive(Clone, Debug)]
pub struct StoreResource<L, R> {
    /// Name of the resource from the user's perspective
    name: String,
    /// Local definition in _code_
    local_definition: L,
    action: Action,
    remote_var: RemoteVar<R>,
}

impl<L, R> Deref for StoreResource<L, R> {
    type Target = L;

    fn deref(&self) -> &Self::Target {
        &self.local_definition
    }
}

impl<L, R> AsRef<L> for StoreResource<L, R> {
    fn as_ref(&self) -> &L {
        &self.local_definition
    }
}

impl<T> StoreResource<T, T::Output>
where
    T: Resource,
{
    /// Map a remote value to use in local definitions.
    pub fn remote<X: Clone + core::fmt::Debug + 'static>(
        &self,
        f: impl Fn(&T::Output) -> X + 'static,
    ) -> Remote<X> {
        Remote::new(self, f)
    }

    /// Return the action that would be applied to this resource.
    pub fn action(&self) -> Action {
        self.action
    }

    /// The resource id this was declared with.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// The path to an individual resource store file.
fn store_file_path(name: &str, store_path: impl AsRef<std::path::Path>) -> std::path::PathBuf {
    store_path.as_ref().join(format!("{name}.json"))
}

type StoreNodeRunFn<Provider> = Box<
    dyn FnOnce(
        // Resource platform provider
        &'_ Provider,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + '_>>,
>;

type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + 'a>>;

/// Deletes by `(provider, resource id, identifier)`.
type DeleteFn<P> = for<'a> fn(&'a P, String, String) -> StoreFuture<'a, ()>;

/// Reads by `(provider, resource id, identifier)`, `None` when the resource is gone.
type RefreshFn<P> = for<'a> fn(&'a P, String, String) -> StoreFuture<'a, Option<serde_json::Value>>;

fn delete_by_identifier<T: Resource>(
    provider: &T::Provider,
    resource_id: String,
    identifier: String,
) -> StoreFuture<'_, ()> {
    Box::pin(async move {
        match T::delete(provider, &identifier).await {
            Ok(()) => Ok(()),
            Err(error) if error.is_not_found() => {
                log::warn!("  '{resource_id}' ({identifier}) was already gone");
                Ok(())
            }
            Err(error) => Err(Error::Destroy {
                name: resource_id,
                error: Box::new(error),
            }),
        }
    })
}

fn refresh_by_identifier<T: Resource>(
    provider: &T::Provider,
    resource_id: String,
    identifier: String,
) -> StoreFuture<'_, Option<serde_json::Value>> {
    Box::pin(async move {
        match T::read(provider, &identifier).await {
            Ok(output) => {
                let value = serde_json::to_value(output).context(SerializeSnafu {
                    name: format!("refreshed {resource_id}"),
                })?;
                Ok(Some(value))
            }
            Err(error) if error.is_not_found() => Ok(None),
            Err(error) => Err(Error::Refresh {
                name: resource_id,
                error: Box::new(error),
            }),
        }
    })
}

/// Type-erased operations for one resource type, keyed by its type name.
///
/// Lets the store refresh and destroy resources it only knows from their
/// store files.
struct Registration<P> {
    delete: DeleteFn<P>,
    refresh: RefreshFn<P>,
}

impl<P> Clone for Registration<P> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<P> Copy for Registration<P> {}

struct RunAction<'a, Provider, T: Resource<Provider = Provider>> {
    provider: &'a Provider,
    store_path: std::path::PathBuf,
    /// Name of the resource being acted on, not the node name.
    resource_id: String,
    action: Action,
    local_definition_code: T,
    local_definition_store: Option<T>,
    /// Identifier to read, for imports.
    import_identifier: Option<String>,
    remote_var: RemoteVar<T::Output>,
}

impl<Provider, T: Resource<Provider = Provider>> RunAction<'_, Provider, T> {
    async fn save(
        resource_id: &str,
        local_definition_code: &T,
        remote_var: &RemoteVar<T::Output>,
        store_path: impl AsRef<std::path::Path>,
    ) -> Result<(), Error> {
        let output = remote_var.get().context(LoadSnafu { name: resource_id })?;
        let store_file = StoreFile {
            name: resource_id.to_owned(),
            local: serde_json::to_value(local_definition_code).context(SerializeSnafu {
                name: format!("store {resource_id}"),
            })?,
            remote: serde_json::to_value(&output).context(SerializeSnafu {
                name: format!("store {resource_id} remote"),
            })?,
            type_name: Some(std::any::type_name::<T>().to_owned()),
            identifier: Some(T::identifier(&output)),
            dependencies: local_definition_code.dependencies().into_iter().collect(),
        };
        store_file.save(store_path).await
    }

    async fn run(self) -> Result<()> {
        let Self {
            provider,
            store_path,
            resource_id,
            action,
            local_definition_code,
            local_definition_store,
            import_identifier,
            remote_var,
        } = self;
        log::info!("{action} '{resource_id}':");

        match action {
            Action::Load => {
                Self::save(&resource_id, &local_definition_code, &remote_var, store_path).await?;
            }
            Action::Create => {
                let value = local_definition_code
                    .create(provider)
                    .await
                    .map_err(|error| Error::Create {
                        name: resource_id.to_owned(),
                        error: Box::new(error),
                    })?;
                remote_var.set(Some(value));
                Self::save(&resource_id, &local_definition_code, &remote_var, store_path).await?;
            }
            Action::Read => {
                let identifier = import_identifier.context(LoadSnafu {
                    name: resource_id.clone(),
                })?;
                log::info!("  importing {identifier}");
                let value = T::read(provider, &identifier)
                    .await
                    .map_err(|error| Error::Read {
                        name: resource_id.to_owned(),
                        error: Box::new(error),
                    })?;
                remote_var.set(Some(value));
                Self::save(&resource_id, &local_definition_code, &remote_var, store_path).await?;
            }
            Action::Update | Action::Replace => {
                let previous_local = local_definition_store.context(LoadSnafu {
                    name: resource_id.clone(),
                })?;
                let previous_remote = remote_var.get().context(LoadSnafu {
                    name: resource_id.clone(),
                })?;
                let cmp =
                    pretty_assertions::Comparison::new(&previous_local, &local_definition_code);
                let change_string = indent(&format!("{cmp}"));

                if action == Action::Replace
                    || local_definition_code.requires_replacement(&previous_local)
                {
                    log::info!("replacing '{resource_id}':\n{change_string}");
                    let identifier = T::identifier(&previous_remote);
                    match T::delete(provider, &identifier).await {
                        Ok(()) => {}
                        Err(error) if error.is_not_found() => {
                            log::warn!("  previous '{resource_id}' ({identifier}) was already gone");
                        }
                        Err(error) => {
                            return Err(Error::Replace {
                                name: resource_id,
                                error: Box::new(error),
                            });
                        }
                    }
                    let output = local_definition_code
                        .create(provider)
                        .await
                        .map_err(|error| Error::Replace {
                            name: resource_id.clone(),
                            error: Box::new(error),
                        })?;
                    remote_var.set(Some(output));
                    Self::save(&resource_id, &local_definition_code, &remote_var, store_path)
                        .await?;
                } else if previous_local == local_definition_code
                    && !local_definition_code.drifted(&previous_remote)
                {
                    log::warn!(
                        "Skipping '{resource_id}' update as the local value has not changed.\n\
                        If you require an update, consider adding a sentinel value."
                    );
                } else {
                    log::info!("updating '{resource_id}':\n{change_string}");
                    let output = local_definition_code
                        .update(provider, &previous_local, &previous_remote)
                        .await
                        .map_err(|error| Error::Update {
                            name: resource_id.clone(),
                            error: Box::new(error),
                        })?;
                    remote_var.set(Some(output));
                    Self::save(&resource_id, &local_definition_code, &remote_var, store_path)
                        .await?;
                }
            }
            Action::Destroy => {
                log::debug!("running destroy action on {resource_id}");
                let previous_remote = remote_var.get().context(LoadSnafu {
                    name: resource_id.clone(),
                })?;
                delete_by_identifier::<T>(
                    provider,
                    resource_id.clone(),
                    T::identifier(&previous_remote),
                )
                .await?;
                log::info!("  {resource_id} is destroyed");
                StoreFile::remove(&store_path, &resource_id).await?;
                remote_var.set(None);
            }
        }

        log::info!("  success!");
        Ok(())
    }
}

/// A resource scheduled for destruction.
pub struct DestroyResource<T: Resource> {
    local: T,
    remote: T::Output,
}

impl<T: Resource> Deref for DestroyResource<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.local
    }
}

impl<T: Resource> DestroyResource<T> {
    /// The last known remote state of the resource.
    pub fn remote(&self) -> &T::Output {
        &self.remote
    }
}

struct StoreNode<Provider> {
    run: StoreNodeRunFn<Provider>,
}

struct PreviouslyStored<T: Resource> {
    action: Action,
    resource: Option<(T, T::Output)>,
}

/// A single planned action for a resource.
#[derive(Clone, Debug, PartialEq)]
pub struct PlannedAction {
    /// The resource ID.
    pub id: String,
    /// The action to be taken.
    pub action: Action,
    /// The Rust type name, if known.
    pub type_name: Option<String>,
    /// Whether this is an auto-detected orphan.
    pub is_orphan: bool,
}

/// A plan of actions produced by [`Store::plan`].
///
/// Inspect the plan before passing it to [`Store::apply`] to execute.
pub struct Plan<Provider> {
    /// The planned actions, in execution order.
    pub actions: Vec<PlannedAction>,
    /// Resources that appear orphaned but could not be auto-deleted
    /// (unregistered type or incomplete store file).
    pub warnings: Vec<String>,
    schedule: Schedule<Node<StoreNode<Provider>, usize>>,
}

impl<Provider> Plan<Provider> {
    /// Returns the actions that would change something on the platform.
    pub fn changes(&self) -> impl Iterator<Item = &PlannedAction> {
        self.actions.iter().filter(|a| a.action != Action::Load)
    }

    /// Returns `true` if applying this plan would change anything.
    pub fn has_changes(&self) -> bool {
        self.changes().next().is_some()
    }

    /// Returns the planned action for the resource with the given id.
    pub fn action(&self, id: &str) -> Option<Action> {
        self.actions.iter().find(|a| a.id == id).map(|a| a.action)
    }
}

impl<Provider> core::fmt::Display for Plan<Provider> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.has_changes() {
            f.write_str("No changes.\n")?;
        }
        for action in self.changes() {
            let orphan_marker = if action.is_orphan { " (orphan)" } else { "" };
            let ty = action.type_name.as_deref().unwrap_or("unknown");
            writeln!(
                f,
                "  {} '{}' [{}]{}",
                action.action, action.id, ty, orphan_marker
            )?;
        }
        for warning in &self.warnings {
            writeln!(f, "  WARNING: {warning}")?;
        }
        Ok(())
    }
}

/// A directory of store files, the resources declared against it, and the
/// provider used to reach the platform.
pub struct Store<T> {
    path: std::path::PathBuf,
    provider: T,
    remotes: Remotes,
    graph: dagga::Dag<StoreNode<T>, usize>,
    registry: HashMap<String, Registration<T>>,
}

impl<P: 'static> Store<P> {
    fn read_from_store<T: Resource<Provider = P>>(
        path: impl AsRef<std::path::Path>,
        id: &str,
    ) -> Result<(T, T::Output)> {
        let store_file = StoreFile::read(path, id)?;
        log::trace!("reading '{id}' as {}", std::any::type_name::<T>());
        let stored_definition: T =
            serde_json::from_value(store_file.local).context(DeserializeSnafu {
                name: id.to_owned(),
            })?;
        let remote_value: T::Output =
            serde_json::from_value(store_file.remote).context(DeserializeSnafu {
                name: format!("remote {id}"),
            })?;
        Ok((stored_definition, remote_value))
    }

    pub fn new(path: impl AsRef<std::path::Path>, provider: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            graph: dagga::Dag::default(),
            remotes: Default::default(),
            provider,
            registry: Default::default(),
        }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// The store directory.
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Register a resource type for refresh and orphan deletion.
    ///
    /// Types are registered automatically whenever they are used via
    /// [`Store::resource`], [`Store::import`] or [`Store::destroy`]. Call this
    /// for types that are **not** declared in the current run but may still
    /// have store files from a previous apply.
    pub fn register<T>(&mut self) -> &mut Self
    where
        T: Resource<Provider = P>,
    {
        self.registry
            .entry(std::any::type_name::<T>().to_owned())
            .or_insert(Registration {
                delete: delete_by_identifier::<T>,
                refresh: refresh_by_identifier::<T>,
            });
        self
    }

    /// Forget every declaration made so far, keeping registered types.
    ///
    /// Use this to declare a new configuration against the same store.
    pub fn clear_resources(&mut self) {
        self.remotes = Remotes::default();
        self.graph = dagga::Dag::default();
    }

    /// Reads every store file, sorted by resource id.
    fn store_files(&self) -> Result<Vec<(String, StoreFile)>> {
        let mut files = vec![];
        let store_dir = &self.path;
        if !store_dir.exists() {
            return Ok(files);
        }
        let entries = std::fs::read_dir(store_dir).context(ScanStoreDirSnafu {
            path: store_dir.clone(),
        })?;
        for entry in entries {
            let entry = entry.context(ScanStoreDirSnafu {
                path: store_dir.clone(),
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            files.push((id.to_owned(), StoreFile::read(store_dir, id)?));
        }
        files.sort_by(|(a, _), (b, _)| a.cmp(b));
        Ok(files)
    }

    /// Refresh the stored remote state of every registered resource from the
    /// platform.
    ///
    /// Resources the platform reports as not found are dropped from the
    /// store, so the next plan creates them again. Resources whose remote
    /// state changed are rewritten with the fresh state.
    ///
    /// Refresh before declaring resources, as declarations read the store.
    pub async fn refresh(&mut self) -> Result<()> {
        for (id, mut store_file) in self.store_files()? {
            let Some(registration) = store_file
                .type_name
                .as_deref()
                .and_then(|type_name| self.registry.get(type_name))
                .copied()
            else {
                log::debug!("not refreshing '{id}', its type is not registered");
                continue;
            };
            let Some(identifier) = store_file.identifier.clone() else {
                log::debug!("not refreshing '{id}', it has no identifier");
                continue;
            };
            log::debug!("refreshing '{id}' ({identifier})");
            match (registration.refresh)(&self.provider, id.clone(), identifier.clone()).await? {
                None => {
                    log::warn!("'{id}' ({identifier}) no longer exists, removing it from the store");
                    StoreFile::remove(&self.path, &id).await?;
                }
                Some(remote) if remote != store_file.remote => {
                    log::info!("'{id}' ({identifier}) changed outside of the store, refreshing");
                    store_file.remote = remote;
                    store_file.save(&self.path).await?;
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// A snapshot of every stored resource.
    pub fn state(&self) -> Result<State> {
        let mut state = State::default();
        for (id, store_file) in self.store_files()? {
            state.insert(
                id,
                store_file.type_name,
                store_file.identifier,
                &store_file.remote,
            );
        }
        Ok(state)
    }

    fn dependency_keys(&self, name: &str, dependencies: Dependencies) -> Result<Vec<usize>> {
        let mut reads = vec![];
        for dep in dependencies {
            let var = self.remotes.get(&dep).context(MissingResourceSnafu {
                name: format!("{dep} (required by {name})"),
            })?;
            reads.push(var.key);
        }
        Ok(reads)
    }

    fn define_resource<T>(
        &mut self,
        id: impl AsRef<str>,
        local_definition: T,
        action: Action,
        stored_definition: Option<T>,
        output: Option<T::Output>,
        import_identifier: Option<String>,
    ) -> Result<StoreResource<T, T::Output>, Error>
    where
        T: Resource<Provider = P>,
    {
        self.register::<T>();
        let id = id.as_ref();
        let reads = self.dependency_keys(id, local_definition.dependencies())?;
        let (remote_var, rez, _ty) = self.remotes.dequeue_var::<T::Output>(id, action)?;
        remote_var.set(output);

        let store_path = self.path.clone();
        let run: StoreNodeRunFn<T::Provider> = Box::new({
            let resource_id = id.to_owned();
            let remote_var = remote_var.clone();
            let local_definition_code = local_definition.clone();
            move |provider: &T::Provider| {
                Box::pin(
                    RunAction {
                        provider,
                        store_path,
                        resource_id,
                        action,
                        local_definition_code,
                        local_definition_store: stored_definition,
                        import_identifier,
                        remote_var,
                    }
                    .run(),
                )
            }
        });

        log::debug!("adding main node {action} {id}");
        let node_name = format!("{action} {id}");
        let dag_node = dagga::Node::new(StoreNode { run })
            .with_name(node_name)
            .with_reads(reads);
        let dag_node = match action {
            Action::Destroy => {
                log::debug!("  with move {rez}");
                dag_node.with_move(rez)
            }
            _ => {
                log::debug!("  with result {rez}");
                dag_node.with_result(rez)
            }
        };
        self.graph.add_node(dag_node);

        Ok(StoreResource {
            name: id.to_owned(),
            local_definition,
            action,
            remote_var,
        })
    }

    /// Read the stored previous definition and determine the action.
    fn determine_action_from_previously_stored<T>(
        &self,
        local_definition: &T,
        id: &str,
    ) -> Result<PreviouslyStored<T>, Error>
    where
        T: Resource<Provider = P>,
    {
        match Self::read_from_store::<T>(&self.path, id) {
            Ok((stored_definition, output)) => {
                log::debug!("  {output:?}");
                let action = if *local_definition != stored_definition {
                    if local_definition.requires_replacement(&stored_definition) {
                        log::debug!("  local resource has changed and must be replaced");
                        Action::Replace
                    } else {
                        log::debug!("  local resource has changed, so this remote is now stale");
                        Action::Update
                    }
                } else if local_definition.dependencies().into_iter().any(|dep| {
                    self.remotes
                        .get(&dep)
                        .map(|var| var.action != Action::Load)
                        .unwrap_or(true)
                }) {
                    log::debug!("  an upstream dependency is stale");
                    Action::Update
                } else if local_definition.drifted(&output) {
                    log::debug!("  remote has drifted from the local definition");
                    Action::Update
                } else {
                    Action::Load
                };

                Ok(PreviouslyStored {
                    action,
                    resource: Some((stored_definition, output)),
                })
            }
            Err(Error::MissingStoreFile { id }) => {
                log::debug!("store file '{id}' does not exist, creating a new resource");
                Ok(PreviouslyStored {
                    action: Action::Create,
                    resource: None,
                })
            }
            Err(e) => {
                log::error!("could not define resource '{id}': {e}");
                Err(e)
            }
        }
    }

    /// Defines a resource.
    ///
    /// Depending on the result of comparing `local_definition` to the one on
    /// file (if it exists), either:
    /// - creates the resource on the platform
    /// - updates the resource on the platform
    /// - replaces the resource on the platform
    /// - loads the resource from a file
    ///
    /// and then stores the resource to a file.
    ///
    /// To import an existing resource from a platform, use [`Store::import`].
    pub fn resource<T>(
        &mut self,
        id: impl AsRef<str>,
        local_definition: T,
    ) -> Result<StoreResource<T, T::Output>, Error>
    where
        T: Resource<Provider = P>,
    {
        let id = id.as_ref();
        let PreviouslyStored { action, resource } =
            self.determine_action_from_previously_stored(&local_definition, id)?;
        let (local, remote) = resource
            .map(|(local, remote)| (Some(local), Some(remote)))
            .unwrap_or_default();
        self.define_resource(id, local_definition, action, local, remote, None)
    }

    /// Defines a pre-existing resource, importing it from the platform by its
    /// identifier.
    ///
    /// This only needs to be used once. After the resource is imported and
    /// stored to a file use [`Store::resource`].
    pub fn import<T>(
        &mut self,
        id: impl AsRef<str>,
        local_definition: T,
        identifier: impl Into<String>,
    ) -> Result<StoreResource<T, T::Output>, Error>
    where
        T: Resource<Provider = P>,
    {
        self.define_resource(
            id,
            local_definition,
            Action::Read,
            None,
            None,
            Some(identifier.into()),
        )
    }

    /// Destroys a resource.
    ///
    /// Resources that depended on it must be destroyed in the same plan.
    pub fn destroy<T>(&mut self, id: impl AsRef<str>) -> Result<DestroyResource<T>, Error>
    where
        T: Resource<Provider = P>,
    {
        self.register::<T>();
        let id = id.as_ref();
        let (local, remote) = Self::read_from_store::<T>(&self.path, id)?;
        let reads = self.dependency_keys(id, local.dependencies())?;
        let (remote_var, rez, _ty) = self.remotes.dequeue_var::<T::Output>(id, Action::Destroy)?;
        remote_var.set(Some(remote.clone()));

        // Destruction requires a load to introduce the resource (for the DAG)
        log::debug!("adding node {} {id}", Action::Load);
        let load_node = dagga::Node::new(StoreNode {
            run: Box::new({
                let resource_id = id.to_owned();
                move |_provider: &P| {
                    Box::pin(async move {
                        log::debug!("loading '{resource_id}' for destruction");
                        Ok(())
                    }) as Pin<Box<dyn Future<Output = Result<()>> + '_>>
                }
            }),
        })
        .with_name(format!("load {id}"))
        .with_reads(reads.clone())
        .with_result(rez);
        self.graph.add_node(load_node);

        log::debug!("adding node {} {id}", Action::Destroy);
        let destroy_node = dagga::Node::new(StoreNode {
            run: Box::new({
                let resource_id = id.to_owned();
                let local = local.clone();
                let store_path = self.path.clone();
                let remote_var = remote_var.clone();
                move |provider| {
                    Box::pin(
                        RunAction {
                            provider,
                            store_path,
                            resource_id,
                            action: Action::Destroy,
                            local_definition_code: local,
                            local_definition_store: None,
                            import_identifier: None,
                            remote_var,
                        }
                        .run(),
                    )
                }
            }),
        })
        .with_name(format!("destroy {id}"))
        .with_reads(reads)
        .with_move(rez);
        self.graph.add_node(destroy_node);

        Ok(DestroyResource { local, remote })
    }

    /// Scan the store directory and build an execution plan.
    ///
    /// Compares declared resources against store files on disk. Resources
    /// found on disk but not declared are orphans. Orphans whose types are
    /// registered are scheduled for deletion after anything that depended on
    /// them. Other orphans produce warnings.
    pub fn plan(&mut self) -> Result<Plan<P>> {
        let mut actions = Vec::new();
        let mut warnings = Vec::new();

        let declared_ids = self.remotes.declared_ids();
        for (id, var) in self.remotes.iter() {
            actions.push(PlannedAction {
                id: id.clone(),
                action: var.action,
                type_name: Some(var.ty.to_owned()),
                is_orphan: false,
            });
        }

        let mut orphans = vec![];
        for (id, store_file) in self.store_files()? {
            if declared_ids.contains(&id) {
                continue;
            }
            let registration = store_file
                .type_name
                .as_deref()
                .and_then(|type_name| self.registry.get(type_name))
                .copied();
            match (registration, store_file.identifier.clone()) {
                (Some(registration), Some(identifier)) => {
                    orphans.push((id, store_file, registration, identifier))
                }
                (registration, _) => {
                    let msg = match (&store_file.type_name, registration) {
                        (Some(tn), None) => format!(
                            "Orphaned resource '{id}' (type: {tn}) found in the store \
                            directory but its type is not known to this run. Call \
                            `store.register::<{tn}>()` to enable automatic deletion."
                        ),
                        _ => format!(
                            "Orphaned resource '{id}' found in the store directory but \
                            its store file has no type name or identifier."
                        ),
                    };
                    log::warn!("{msg}");
                    warnings.push(msg);
                }
            }
        }

        // Orphans may depend on each other, so all of them need keys before
        // any node reads one.
        let mut orphan_keys = Vec::with_capacity(orphans.len());
        for (id, _, _, _) in orphans.iter() {
            let (remote_var, rez, _ty) = self
                .remotes
                .dequeue_var::<serde_json::Value>(id, Action::Destroy)?;
            orphan_keys.push((remote_var, rez));
        }

        for ((id, store_file, registration, identifier), (remote_var, rez)) in
            orphans.into_iter().zip(orphan_keys)
        {
            log::info!(
                "orphan detected: '{id}' (type: {}), scheduling auto-delete",
                store_file.type_name.as_deref().unwrap_or("unknown")
            );
            remote_var.set(Some(store_file.remote.clone()));
            let dep_keys: Vec<usize> = store_file
                .dependencies
                .iter()
                .filter_map(|dep| self.remotes.get(dep).map(|v| v.key))
                .collect();

            let load_node = dagga::Node::new(StoreNode {
                run: Box::new({
                    let resource_id = id.clone();
                    move |_provider: &P| {
                        Box::pin(async move {
                            log::debug!("loading orphan '{resource_id}' for deletion");
                            Ok(())
                        }) as Pin<Box<dyn Future<Output = Result<()>> + '_>>
                    }
                }),
            })
            .with_name(format!("load {id}"))
            .with_reads(dep_keys.clone())
            .with_result(rez);
            self.graph.add_node(load_node);

            let destroy_node = dagga::Node::new(StoreNode {
                run: Box::new({
                    let resource_id = id.clone();
                    let store_path = self.path.clone();
                    move |provider: &P| {
                        Box::pin(async move {
                            log::info!("destroy '{resource_id}' (orphan):");
                            (registration.delete)(provider, resource_id.clone(), identifier)
                                .await?;
                            StoreFile::remove(&store_path, &resource_id).await?;
                            log::info!("  success!");
                            Ok(())
                        }) as Pin<Box<dyn Future<Output = Result<()>> + '_>>
                    }
                }),
            })
            .with_name(format!("destroy {id}"))
            .with_reads(dep_keys)
            .with_move(rez);
            self.graph.add_node(destroy_node);

            actions.push(PlannedAction {
                id,
                action: Action::Destroy,
                type_name: store_file.type_name,
                is_orphan: true,
            });
        }

        let graph = std::mem::take(&mut self.graph);
        let schedule = graph
            .build_schedule()
            .map_err(|e| Error::Schedule { msg: e.to_string() })?;

        // Node names are "{action} {id}", the first occurrence of an id in
        // schedule order is the position of its action.
        let mut ordered_actions = Vec::with_capacity(actions.len());
        let mut seen = std::collections::HashSet::new();
        for batch in &schedule.batches {
            for node in batch {
                let id = node
                    .name()
                    .split_once(' ')
                    .map(|(_, id)| id)
                    .unwrap_or(node.name());
                if seen.insert(id.to_owned()) {
                    if let Some(pos) = actions.iter().position(|a| a.id == id) {
                        ordered_actions.push(actions.remove(pos));
                    }
                }
            }
        }
        ordered_actions.extend(actions);

        Ok(Plan {
            actions: ordered_actions,
            warnings,
            schedule,
        })
    }

    /// Execute a plan previously built by [`Store::plan`].
    pub async fn apply(&mut self, plan: Plan<P>) -> Result<()> {
        for (i, batch) in plan.schedule.batches.into_iter().enumerate() {
            for (j, node) in batch.into_iter().enumerate() {
                log::debug!("applying node {j}, batch {i}");
                let store_node = node.into_inner();
                (store_node.run)(&self.provider).await?;
            }
        }
        Ok(())
    }
}

//! Remote values.
//!
//! Remote values are values that are determined after creating
//! or reading a resource from a provider, eg. the ARN of a contact that a
//! contact channel belongs to.

use std::{
    any::Any,
    collections::HashMap,
    sync::{Arc, Mutex},
};

use snafu::OptionExt;

use crate::HasDependencies;

use super::{
    Action, Dependencies, DowncastSnafu, Error, RemoteUnresolvedSnafu, Resource, StoreResource,
};

type VarFn<X> = Arc<dyn Fn(&Arc<dyn Any>) -> Result<X, Error>>;

#[derive(Clone)]
enum RemoteInner<X> {
    Init {
        depends_on: String,
        last_known_value: Option<X>,
    },
    Var {
        depends_on: String,
        map: VarFn<X>,
        // RemoteVar<T::Output>
        var: Arc<dyn Any>,
    },
}

/// A value taken from the remote state of another resource.
///
/// Declaring a resource with a `Remote` field makes it depend on the resource
/// the value comes from.
#[derive(Clone)]
pub struct Remote<X> {
    inner: RemoteInner<X>,
}

impl<X: Clone + core::fmt::Debug + 'static> std::fmt::Debug for Remote<X> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Remote")
            .field("depends_on", &self.depends_on())
            .field("value", &self.get().ok())
            .finish()
    }
}

impl<X: Clone + core::fmt::Debug + PartialEq + 'static> PartialEq for Remote<X> {
    fn eq(&self, other: &Self) -> bool {
        match (self.get(), other.get()) {
            (Ok(here), Ok(there)) => here == there,
            _ => false,
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct RemoteProxy<T> {
    depends_on: String,
    last_known_value: Option<T>,
}

impl<X: serde::Serialize + Clone + core::fmt::Debug + 'static> serde::Serialize for Remote<X> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let proxy = RemoteProxy {
            last_known_value: self.get().ok(),
            depends_on: self.depends_on().to_owned(),
        };
        proxy.serialize(serializer)
    }
}

impl<'de, X: serde::Deserialize<'de>> serde::Deserialize<'de> for Remote<X> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let RemoteProxy {
            depends_on,
            last_known_value,
        } = RemoteProxy::<X>::deserialize(deserializer)?;

        Ok(Remote {
            inner: RemoteInner::Init {
                depends_on,
                last_known_value,
            },
        })
    }
}

impl<X> Remote<X> {
    /// The id of the resource this value comes from.
    pub fn depends_on(&self) -> &str {
        match &self.inner {
            RemoteInner::Init { depends_on, .. } => depends_on,
            RemoteInner::Var { depends_on, .. } => depends_on,
        }
    }
}

impl<X: Clone + core::fmt::Debug + 'static> Remote<X> {
    pub(crate) fn new<T: Resource>(
        resource: &StoreResource<T, T::Output>,
        map: impl Fn(&T::Output) -> X + 'static,
    ) -> Self {
        log::trace!(
            "creating mapping of a remote resource '{}'",
            resource.remote_var.depends_on
        );
        let depends_on = resource.remote_var.depends_on.clone();
        Self {
            inner: RemoteInner::Var {
                map: Arc::new({
                    let depends_on = depends_on.clone();
                    move |any: &Arc<dyn Any>| {
                        let remote_var = any
                            .downcast_ref::<RemoteVar<T::Output>>()
                            .context(DowncastSnafu)?;
                        let t_output = remote_var.get().context(RemoteUnresolvedSnafu {
                            ty: core::any::type_name::<X>(),
                            depends_on: depends_on.clone(),
                        })?;
                        Ok(map(&t_output))
                    }
                }),
                depends_on,
                var: Arc::new(resource.remote_var.clone()),
            },
        }
    }

    /// Resolve the value.
    ///
    /// ## Errors
    /// Errs if the resource this depends on has not been applied yet.
    pub fn get(&self) -> Result<X, Error> {
        match &self.inner {
            RemoteInner::Init {
                depends_on,
                last_known_value,
            } => {
                log::trace!("remote var returning last known value: {last_known_value:?}");
                last_known_value.clone().context(RemoteUnresolvedSnafu {
                    ty: core::any::type_name::<X>(),
                    depends_on: depends_on.clone(),
                })
            }
            RemoteInner::Var { map, var, .. } => map(var),
        }
    }
}

impl<X> HasDependencies for Remote<X> {
    fn dependencies(&self) -> Dependencies {
        Dependencies {
            inner: vec![self.depends_on().to_owned()],
        }
    }
}

#[derive(Debug)]
pub(crate) struct RemoteVar<T> {
    depends_on: String,
    inner: Arc<Mutex<Option<T>>>,
}

impl<T> Clone for RemoteVar<T> {
    fn clone(&self) -> Self {
        Self {
            depends_on: self.depends_on.clone(),
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone> RemoteVar<T> {
    pub fn get(&self) -> Option<T> {
        // UNWRAP: only poisoned if a holder panicked, and holders never panic
        self.inner.lock().unwrap().clone()
    }

    pub fn set(&self, value: Option<T>) {
        // UNWRAP: see above
        *self.inner.lock().unwrap() = value;
    }
}

pub(crate) struct Var {
    pub(crate) key: usize,
    pub(crate) ty: &'static str,
    pub(crate) action: Action,
    pub(crate) remote: Box<dyn core::any::Any>,
}

#[derive(Default)]
pub(crate) struct Remotes {
    /// Map of resource name to key + RemoteVar<T>
    vars: HashMap<String, Var>,
}

impl Remotes {
    /// Returns a new `RemoteVar<T>` and its resource key.
    ///
    /// ## Errors
    /// Errs if a var by the given name exists but is of a different type than the type
    /// requested.
    pub fn dequeue_var<T: Any>(
        &mut self,
        id: &str,
        action: Action,
    ) -> Result<(RemoteVar<T>, usize, &'static str), Error> {
        log::trace!(
            "requested remote var '{id}' of type {}",
            core::any::type_name::<T>()
        );
        let next_k = self.vars.len();
        let var = self.vars.entry(id.to_owned()).or_insert_with(|| {
            log::trace!("   but one doesn't exist, so we're creating a new entry '{next_k}'");
            Var {
                key: next_k,
                ty: std::any::type_name::<T>(),
                action,
                remote: Box::new(RemoteVar::<T> {
                    depends_on: id.to_owned(),
                    inner: Default::default(),
                }),
            }
        });
        let remote: &RemoteVar<T> = var.remote.downcast_ref().context(DowncastSnafu)?;
        Ok((remote.clone(), var.key, var.ty))
    }

    /// Returns the var of the resource with the given name.
    pub fn get(&self, id: &str) -> Option<&Var> {
        self.vars.get(id)
    }

    /// Returns the set of all declared resource IDs.
    pub fn declared_ids(&self) -> std::collections::HashSet<String> {
        self.vars.keys().cloned().collect()
    }

    /// Iterate over all declared resources.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Var)> {
        self.vars.iter()
    }
}

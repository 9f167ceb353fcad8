//! Acceptance tests.
//!
//! A [`TestCase`] runs a sequence of [`TestStep`]s against its own [`Store`]:
//!
//! 1. A config step declares resources, plans and applies, then runs its
//!    checks against the resulting [`State`]. The runner then refreshes,
//!    declares the same resources again and plans once more. That plan must
//!    be empty, unless the step expects otherwise.
//! 2. An import step reads a stored resource by its identifier and compares
//!    what it read with what was stored.
//!
//! After the last step (or the first failure) every resource in the store is
//! destroyed, and the destroy checks run against the state as it was just
//! before.
//!
//! Cases that talk to AWS should only run when [`pre_check_acc`] is `true`.
use std::{future::Future, pin::Pin};

use random::Source;
use snafu::prelude::*;

use crate::{
    state::{flatten, State},
    CheckSnafu, Classify, EmptyPlanSnafu, Error, ImportVerifySnafu, NonEmptyPlanSnafu,
    NotDestroyedSnafu, Plan, Resource, SerializeSnafu, Store, StoreFileDeleteSnafu,
};

/// Prefix of every resource name an acceptance test creates, so sweepers can
/// find leaks.
pub const RESOURCE_PREFIX: &str = "tf-acc-test";

/// Returns `"{prefix}-{19 random digits}"`.
pub fn random_with_prefix(prefix: &str) -> String {
    let seed = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as u64)
        .unwrap_or(0x5eed);
    let mut source = random::default(seed ^ u64::from(std::process::id()));
    format!("{prefix}-{:019}", source.read_u64() >> 1)
}

/// The region acceptance tests run in.
pub fn region() -> String {
    std::env::var("AWS_DEFAULT_REGION").unwrap_or_else(|_| crate::aws::DEFAULT_REGION.to_owned())
}

/// Whether acceptance tests against real infrastructure are enabled.
pub fn pre_check_acc() -> bool {
    std::env::var("TF_ACC")
        .map(|value| !value.is_empty())
        .unwrap_or(false)
}

type Result<T, E = Error> = core::result::Result<T, E>;

pub type CheckFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + 'a>>;

type CheckFn<P> = Box<dyn for<'a> Fn(&'a State, &'a P) -> CheckFuture<'a>>;

/// An assertion about the state of a store, which may call the provider.
pub struct Check<P> {
    run: CheckFn<P>,
}

impl<P> Check<P> {
    pub fn new(f: impl for<'a> Fn(&'a State, &'a P) -> CheckFuture<'a> + 'static) -> Self {
        Self { run: Box::new(f) }
    }

    /// A check that only looks at the state.
    pub fn state(f: impl Fn(&State) -> Result<()> + 'static) -> Self {
        Self::new(move |state, _| Box::pin(std::future::ready(f(state))))
    }

    pub async fn run(&self, state: &State, provider: &P) -> Result<()> {
        (self.run)(state, provider).await
    }
}

/// Checks that attribute `key` of resource `name` equals `value`.
pub fn check_resource_attr<P>(
    name: impl Into<String>,
    key: impl Into<String>,
    value: impl Into<String>,
) -> Check<P> {
    let (name, key, value) = (name.into(), key.into(), value.into());
    Check::state(move |state| {
        let actual = state.get(&name)?.attr(&key);
        ensure!(
            actual == Some(value.as_str()),
            CheckSnafu {
                name: &name,
                message: format!("expected {key} = {value:?}, got {actual:?}"),
            }
        );
        Ok(())
    })
}

/// Checks that attribute `key` of resource `name` equals attribute
/// `other_key` of resource `other`.
pub fn check_resource_attr_pair<P>(
    name: impl Into<String>,
    key: impl Into<String>,
    other: impl Into<String>,
    other_key: impl Into<String>,
) -> Check<P> {
    let (name, key, other, other_key) = (name.into(), key.into(), other.into(), other_key.into());
    Check::state(move |state| {
        let actual = state.get(&name)?.attr(&key);
        let expected = state.get(&other)?.attr(&other_key);
        ensure!(
            actual.is_some() && actual == expected,
            CheckSnafu {
                name: &name,
                message: format!("expected {key} = {other}.{other_key} ({expected:?}), got {actual:?}"),
            }
        );
        Ok(())
    })
}

/// Checks attribute `key` of resource `name` with a predicate.
pub fn check_resource_attr_with<P>(
    name: impl Into<String>,
    key: impl Into<String>,
    predicate: impl Fn(&str) -> bool + 'static,
) -> Check<P> {
    let (name, key) = (name.into(), key.into());
    Check::state(move |state| {
        let actual = state.get(&name)?.attr(&key);
        ensure!(
            actual.map(&predicate).unwrap_or(false),
            CheckSnafu {
                name: &name,
                message: format!("{key} = {actual:?} does not pass the check"),
            }
        );
        Ok(())
    })
}

/// Checks that resource `name` has no attribute `key`.
pub fn check_no_resource_attr<P>(name: impl Into<String>, key: impl Into<String>) -> Check<P> {
    let (name, key) = (name.into(), key.into());
    Check::state(move |state| {
        let actual = state.get(&name)?.attr(&key);
        ensure!(
            actual.is_none(),
            CheckSnafu {
                name: &name,
                message: format!("expected no {key}, got {actual:?}"),
            }
        );
        Ok(())
    })
}

fn stored_identifier<'a>(state: &'a State, name: &str) -> Result<&'a str> {
    let resource = state.get(name)?;
    resource.identifier.as_deref().context(CheckSnafu {
        name,
        message: "no identifier in state",
    })
}

/// Checks that resource `name` can be read from the platform.
pub fn check_exists<T: Resource>(name: impl Into<String>) -> Check<T::Provider> {
    let name = name.into();
    Check::new(move |state, provider| {
        let name = name.clone();
        Box::pin(async move {
            let identifier = stored_identifier(state, &name)?;
            T::read(provider, identifier)
                .await
                .map_err(|error| Error::CheckResource {
                    verb: "read",
                    name,
                    error: Box::new(error),
                })?;
            Ok(())
        })
    })
}

/// Deletes resource `name` behind the store's back.
pub fn check_disappears<T: Resource>(name: impl Into<String>) -> Check<T::Provider> {
    let name = name.into();
    Check::new(move |state, provider| {
        let name = name.clone();
        Box::pin(async move {
            let identifier = stored_identifier(state, &name)?;
            log::info!("deleting '{name}' ({identifier}) out of band");
            T::delete(provider, identifier)
                .await
                .map_err(|error| Error::CheckResource {
                    verb: "delete",
                    name,
                    error: Box::new(error),
                })
        })
    })
}

/// Checks that no resource of type `T` in the state still exists.
///
/// A read failing as not found, or as invalid, proves the resource is gone.
pub fn check_destroy<T: Resource>() -> Check<T::Provider> {
    Check::new(|state, provider| {
        Box::pin(async move {
            for resource in state.of_type::<T>() {
                let Some(identifier) = resource.identifier.as_deref() else {
                    continue;
                };
                match T::read(provider, identifier).await {
                    Ok(_) => {
                        return NotDestroyedSnafu {
                            kind: T::kind(),
                            identifier,
                        }
                        .fail()
                    }
                    Err(error) if error.proves_absence() => {
                        log::debug!("{} ({identifier}) is gone: {error}", T::kind());
                    }
                    Err(error) => {
                        return Err(Error::CheckResource {
                            verb: "read",
                            name: resource.name.clone(),
                            error: Box::new(error),
                        })
                    }
                }
            }
            Ok(())
        })
    })
}

type ConfigFn<P> = Box<dyn Fn(&mut Store<P>) -> Result<()>>;

type ImportFn<P> = for<'a> fn(&'a State, &'a P, &'a str, &'a [String]) -> CheckFuture<'a>;

fn import_verify<'a, T: Resource>(
    state: &'a State,
    provider: &'a T::Provider,
    name: &'a str,
    ignore: &'a [String],
) -> CheckFuture<'a> {
    let name = name.to_owned();
    let ignore = ignore.to_vec();
    Box::pin(async move {
        let stored = state.get(&name)?;
        let identifier = stored_identifier(state, &name)?;
        log::info!("importing '{name}' ({identifier})");
        let output = T::read(provider, identifier)
            .await
            .map_err(|error| Error::CheckResource {
                verb: "import",
                name: name.clone(),
                error: Box::new(error),
            })?;
        let value = serde_json::to_value(output).context(SerializeSnafu {
            name: format!("imported {name}"),
        })?;
        let keep = |key: &String| !ignore.iter().any(|ignored| key.starts_with(ignored.as_str()));
        let mut imported = flatten(&value);
        imported.retain(|key, _| keep(key));
        let mut expected = stored.attributes.clone();
        expected.retain(|key, _| keep(key));
        ensure!(
            imported == expected,
            ImportVerifySnafu {
                name: &name,
                diff: format!("{}", pretty_assertions::Comparison::new(&expected, &imported)),
            }
        );
        Ok(())
    })
}

struct Import<P> {
    name: String,
    verify: ImportFn<P>,
    ignore: Vec<String>,
}

/// One step of a [`TestCase`].
pub struct TestStep<P> {
    config: Option<ConfigFn<P>>,
    import: Option<Import<P>>,
    checks: Vec<Check<P>>,
    expect_non_empty_plan: bool,
}

impl<P: 'static> TestStep<P> {
    /// A step declaring resources with `config`.
    pub fn config(config: impl Fn(&mut Store<P>) -> Result<()> + 'static) -> Self {
        Self {
            config: Some(Box::new(config)),
            import: None,
            checks: vec![],
            expect_non_empty_plan: false,
        }
    }

    /// A step importing the stored resource `name` of type `T` and verifying
    /// the import matches the state.
    pub fn import_state_verify<T: Resource<Provider = P>>(name: impl Into<String>) -> Self {
        Self {
            config: None,
            import: Some(Import {
                name: name.into(),
                verify: import_verify::<T>,
                ignore: vec![],
            }),
            checks: vec![],
            expect_non_empty_plan: false,
        }
    }

    /// Attribute keys, or key prefixes, left out of the import comparison.
    pub fn ignore<S: Into<String>>(mut self, keys: impl IntoIterator<Item = S>) -> Self {
        if let Some(import) = self.import.as_mut() {
            import.ignore.extend(keys.into_iter().map(Into::into));
        }
        self
    }

    pub fn check(mut self, check: Check<P>) -> Self {
        self.checks.push(check);
        self
    }

    /// Expect the plan after this step to still have changes, eg. because a
    /// check deleted a resource.
    pub fn expect_non_empty_plan(mut self) -> Self {
        self.expect_non_empty_plan = true;
        self
    }
}

/// A sequence of steps run against one store.
pub struct TestCase<P> {
    name: String,
    store: Store<P>,
    steps: Vec<TestStep<P>>,
    destroy_checks: Vec<Check<P>>,
}

impl<P: 'static> TestCase<P> {
    /// A case whose store lives in the system temp dir, under `name`.
    pub fn new(name: impl Into<String>, provider: P) -> Self {
        let name = name.into();
        let path = std::env::temp_dir().join("skyform-acctest").join(&name);
        Self {
            name,
            store: Store::new(path, provider),
            steps: vec![],
            destroy_checks: vec![],
        }
    }

    pub fn step(mut self, step: TestStep<P>) -> Self {
        self.steps.push(step);
        self
    }

    pub fn check_destroy(mut self, check: Check<P>) -> Self {
        self.destroy_checks.push(check);
        self
    }

    async fn apply_config(&mut self, config: &ConfigFn<P>) -> Result<Plan<P>> {
        self.store.clear_resources();
        self.store.refresh().await?;
        config(&mut self.store)?;
        self.store.plan()
    }

    async fn run_step(&mut self, step_number: usize, step: &TestStep<P>) -> Result<()> {
        if let Some(Import {
            name,
            verify,
            ignore,
        }) = &step.import
        {
            let state = self.store.state()?;
            verify(&state, self.store.provider(), name, ignore).await?;
        }

        let Some(config) = &step.config else {
            return Ok(());
        };
        let plan = self.apply_config(config).await?;
        log::info!("plan:\n{plan}");
        self.store.apply(plan).await?;

        let state = self.store.state()?;
        for check in step.checks.iter() {
            check.run(&state, self.store.provider()).await?;
        }

        let plan = self.apply_config(config).await?;
        match (plan.has_changes(), step.expect_non_empty_plan) {
            (true, false) => NonEmptyPlanSnafu {
                step: step_number,
                plan: plan.to_string(),
            }
            .fail(),
            (false, true) => EmptyPlanSnafu { step: step_number }.fail(),
            _ => Ok(()),
        }
    }

    async fn destroy(&mut self) -> Result<()> {
        self.store.clear_resources();
        self.store.refresh().await?;
        let state = self.store.state()?;
        let plan = self.store.plan()?;
        log::info!("destroying '{}':\n{plan}", self.name);
        self.store.apply(plan).await?;
        for check in self.destroy_checks.iter() {
            check.run(&state, self.store.provider()).await?;
        }
        Ok(())
    }

    /// Runs every step, then destroys everything.
    ///
    /// Returns the first error, from a step or from the destroy.
    pub async fn run(mut self) -> Result<()> {
        log::info!("running acceptance test '{}'", self.name);
        let path = self.store.path().to_path_buf();
        if path.exists() {
            tokio::fs::remove_dir_all(&path)
                .await
                .context(StoreFileDeleteSnafu { path })?;
        }

        let steps = std::mem::take(&mut self.steps);
        let mut result = Ok(());
        for (i, step) in steps.iter().enumerate() {
            let step_number = i + 1;
            log::info!("'{}' step {step_number}", self.name);
            if let Err(error) = self.run_step(step_number, step).await {
                log::error!("'{}' step {step_number} failed: {error}", self.name);
                result = Err(Error::Step {
                    step: step_number,
                    source: Box::new(error),
                });
                break;
            }
        }
        let destroyed = self.destroy().await;
        result.and(destroyed)
    }
}

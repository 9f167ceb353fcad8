//! Sweepers delete resources leaked by acceptance tests.
//!
//! A sweeper lists every resource of one kind in a region, page by page, and
//! hands the result to [`orchestrate`], which deletes them concurrently. When
//! listing fails because the service is not available in the region the
//! sweep is skipped, any other listing failure fails it.
use std::{
    collections::{BTreeMap, BTreeSet},
    future::Future,
    marker::PhantomData,
    sync::Arc,
};

use snafu::prelude::*;
use tokio::{sync::Semaphore, task::JoinSet};

use crate::{
    api::{ApiError, ApiFuture, BoxFuture, Classify},
    Resource,
};

/// Default number of deletes in flight at once.
pub const DEFAULT_CONCURRENCY: usize = 10;

/// A resource that failed to be swept.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SweepFailure {
    pub resource: String,
    pub message: String,
}

impl core::fmt::Display for SweepFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.resource, self.message)
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SweepError {
    #[snafu(display("error listing {kind} ({region}): {source}"))]
    List {
        kind: String,
        region: String,
        source: ApiError,
    },

    #[snafu(display(
        "{} resources could not be swept:\n{}",
        failures.len(),
        failures.iter().map(|f| format!("  {f}")).collect::<Vec<_>>().join("\n")
    ))]
    Orchestrate { failures: Vec<SweepFailure> },

    #[snafu(display("sweeper '{name}' failed in {region}: {source}"))]
    Sweeper {
        name: String,
        region: String,
        source: Box<SweepError>,
    },

    #[snafu(display("sweeper '{name}' depends on unknown sweeper '{dependency}'"))]
    UnknownDependency { name: String, dependency: String },

    #[snafu(display("sweeper '{name}' is part of a dependency cycle"))]
    DependencyCycle { name: String },

    #[snafu(display("no sweepers match {filter:?}"))]
    NoSweepers { filter: Vec<String> },
}

/// Something a sweep can delete.
pub trait Sweepable: Send + Sync {
    /// Names the resource in logs and failures.
    fn describe(&self) -> String;

    /// Deletes the resource. Deleting a resource that is already gone succeeds.
    fn delete(&self) -> BoxFuture<'_, Result<(), SweepFailure>>;
}

/// A sweep candidate: the identifier of a `T` and the provider to delete it
/// with.
pub struct SweepResource<T: Resource> {
    identifier: String,
    provider: Arc<T::Provider>,
    _resource: PhantomData<fn() -> T>,
}

impl<T: Resource> SweepResource<T> {
    pub fn new(identifier: impl Into<String>, provider: Arc<T::Provider>) -> Self {
        Self {
            identifier: identifier.into(),
            provider,
            _resource: PhantomData,
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }
}

impl<T> Sweepable for SweepResource<T>
where
    T: Resource,
    T::Provider: Send + Sync,
{
    fn describe(&self) -> String {
        format!("{} ({})", T::kind(), self.identifier)
    }

    fn delete(&self) -> BoxFuture<'_, Result<(), SweepFailure>> {
        Box::pin(async move {
            match T::delete(&self.provider, &self.identifier).await {
                Ok(()) => Ok(()),
                Err(error) if error.is_not_found() => {
                    log::debug!("{} was already gone", self.describe());
                    Ok(())
                }
                Err(error) => Err(SweepFailure {
                    resource: self.describe(),
                    message: error.to_string(),
                }),
            }
        })
    }
}

/// Deletes every resource, at most `concurrency` at a time.
///
/// Every delete runs even when others fail. Returns the number of resources
/// deleted, or every failure.
pub async fn orchestrate(
    resources: Vec<Arc<dyn Sweepable>>,
    concurrency: usize,
) -> Result<usize, SweepError> {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut tasks = JoinSet::new();
    for resource in resources {
        let semaphore = semaphore.clone();
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.map_err(|e| SweepFailure {
                resource: resource.describe(),
                message: e.to_string(),
            })?;
            log::info!("sweeping {}", resource.describe());
            resource.delete().await
        });
    }

    let mut deleted = 0;
    let mut failures = vec![];
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => deleted += 1,
            Ok(Err(failure)) => {
                log::error!("could not sweep {failure}");
                failures.push(failure);
            }
            Err(join_error) => failures.push(SweepFailure {
                resource: "unknown".to_owned(),
                message: join_error.to_string(),
            }),
        }
    }
    ensure!(failures.is_empty(), OrchestrateSnafu { failures });
    Ok(deleted)
}

/// One page of a listing.
#[derive(Clone, Debug, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_token: Option<String>,
}

impl<T> Page<T> {
    /// The last page.
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            next_token: None,
        }
    }
}

/// Lists every page, starting without a token.
///
/// Returns `None` when the region should be skipped.
pub async fn sweep_pages<'a, T, F>(
    kind: &str,
    region: &str,
    mut list: F,
) -> Result<Option<Vec<T>>, SweepError>
where
    F: FnMut(Option<String>) -> ApiFuture<'a, Page<T>>,
{
    let mut items = vec![];
    let mut next_token = None;
    loop {
        match list(next_token.take()).await {
            Ok(page) => {
                items.extend(page.items);
                match page.next_token {
                    Some(token) => next_token = Some(token),
                    None => break,
                }
            }
            Err(error) if error.is_skip_sweep() => {
                log::warn!("Skipping {kind} sweep for {region}: {error}");
                return Ok(None);
            }
            Err(source) => {
                return Err(SweepError::List {
                    kind: kind.to_owned(),
                    region: region.to_owned(),
                    source,
                });
            }
        }
    }
    Ok(Some(items))
}

/// Settings for a sweep pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SweepConfig {
    /// Deletes in flight at once.
    pub concurrency: usize,
    /// List and log, but delete nothing.
    pub dry_run: bool,
    /// Only sweep resources whose name starts with this.
    pub name_prefix: Option<String>,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            dry_run: false,
            name_prefix: None,
        }
    }
}

impl SweepConfig {
    pub fn matches(&self, name: &str) -> bool {
        self.name_prefix
            .as_deref()
            .map(|prefix| name.starts_with(prefix))
            .unwrap_or(true)
    }
}

/// What one sweeper did in one region.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SweepReport {
    pub name: String,
    pub region: String,
    pub listed: usize,
    pub deleted: usize,
    pub skipped: bool,
}

impl SweepReport {
    pub fn skipped(name: &str, region: &str) -> Self {
        Self {
            name: name.to_owned(),
            region: region.to_owned(),
            listed: 0,
            deleted: 0,
            skipped: true,
        }
    }
}

/// Deletes the candidates found by a sweeper, honoring `dry_run`.
pub async fn sweep_candidates(
    name: &str,
    region: &str,
    config: &SweepConfig,
    candidates: Vec<Arc<dyn Sweepable>>,
) -> Result<SweepReport, SweepError> {
    let listed = candidates.len();
    let deleted = if config.dry_run {
        for candidate in candidates.iter() {
            log::info!("[dry run] would sweep {}", candidate.describe());
        }
        0
    } else {
        orchestrate(candidates, config.concurrency).await?
    };
    Ok(SweepReport {
        name: name.to_owned(),
        region: region.to_owned(),
        listed,
        deleted,
        skipped: false,
    })
}

/// Runs one sweeper in one region with the region's client.
pub type SweepFn<C> =
    for<'a> fn(&'a C, &'a str, &'a SweepConfig) -> BoxFuture<'a, Result<SweepReport, SweepError>>;

/// A named sweeper and the sweepers that must run before it.
pub struct Sweeper<C> {
    pub name: &'static str,
    pub dependencies: &'static [&'static str],
    pub run: SweepFn<C>,
}

/// A sweeper that failed during a run that allows failures.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SweeperFailure {
    pub name: String,
    pub region: String,
    pub message: String,
}

/// Everything a [`Sweepers::run`] did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub reports: Vec<SweepReport>,
    pub failures: Vec<SweeperFailure>,
}

/// A registry of sweepers.
pub struct Sweepers<C> {
    sweepers: BTreeMap<&'static str, Sweeper<C>>,
}

impl<C> Default for Sweepers<C> {
    fn default() -> Self {
        Self {
            sweepers: BTreeMap::default(),
        }
    }
}

impl<C> Sweepers<C> {
    pub fn add(&mut self, sweeper: Sweeper<C>) -> &mut Self {
        self.sweepers.insert(sweeper.name, sweeper);
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.sweepers.keys().copied()
    }

    fn visit(
        &self,
        name: &'static str,
        visiting: &mut BTreeSet<&'static str>,
        order: &mut Vec<&'static str>,
    ) -> Result<(), SweepError> {
        if order.contains(&name) {
            return Ok(());
        }
        ensure!(
            visiting.insert(name),
            DependencyCycleSnafu { name: name.to_owned() }
        );
        if let Some(sweeper) = self.sweepers.get(name) {
            for dependency in sweeper.dependencies.iter().copied() {
                ensure!(
                    self.sweepers.contains_key(dependency),
                    UnknownDependencySnafu { name, dependency }
                );
                self.visit(dependency, visiting, order)?;
            }
        }
        visiting.remove(name);
        order.push(name);
        Ok(())
    }

    /// The sweepers matching `filter` (all of them when empty), each after
    /// its dependencies.
    pub fn order(&self, filter: &[String]) -> Result<Vec<&'static str>, SweepError> {
        let selected: Vec<&'static str> = self
            .names()
            .filter(|name| filter.is_empty() || filter.iter().any(|f| f == name))
            .collect();
        ensure!(
            !selected.is_empty(),
            NoSweepersSnafu {
                filter: filter.to_vec()
            }
        );
        let mut order = vec![];
        for name in selected {
            self.visit(name, &mut BTreeSet::default(), &mut order)?;
        }
        Ok(order)
    }

    /// Runs the sweepers matching `filter` in every region, loading a client
    /// per region with `load`.
    ///
    /// With `allow_failures` a failing sweeper is recorded and the run goes
    /// on, otherwise the first failure ends the run.
    pub async fn run<F, Fut>(
        &self,
        regions: &[String],
        filter: &[String],
        allow_failures: bool,
        config: &SweepConfig,
        load: F,
    ) -> Result<SweepSummary, SweepError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = C>,
    {
        let order = self.order(filter)?;
        let mut summary = SweepSummary::default();
        for region in regions {
            log::info!("sweeping {region}: {}", order.join(", "));
            let client = load(region.clone()).await;
            for name in order.iter() {
                let Some(sweeper) = self.sweepers.get(name) else {
                    continue;
                };
                match (sweeper.run)(&client, region, config).await {
                    Ok(report) => {
                        log::info!(
                            "{name} ({region}): listed {}, deleted {}{}",
                            report.listed,
                            report.deleted,
                            if report.skipped { ", skipped" } else { "" }
                        );
                        summary.reports.push(report);
                    }
                    Err(source) if allow_failures => {
                        log::error!("{name} ({region}) failed: {source}");
                        summary.failures.push(SweeperFailure {
                            name: name.to_string(),
                            region: region.clone(),
                            message: source.to_string(),
                        });
                    }
                    Err(source) => {
                        return Err(SweepError::Sweeper {
                            name: name.to_string(),
                            region: region.clone(),
                            source: Box::new(source),
                        });
                    }
                }
            }
        }
        Ok(summary)
    }
}

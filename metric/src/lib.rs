//! Metric instrumentation for this workspace.
//!
//! The design goals, in the spirit of keeping instrumented code cheap and
//! greppable:
//!
//! 1. Require minimal additional dependencies to instrument a given crate
//! 2. Decouple metric recording from metric export
//! 3. Make it easy to reason about the labels associated with a given metric
//! 4. Individual metric recording should be as cheap as possible
//!
//! A [`Registry`] stores [`Metric`]s by name. A `Metric<T>` maintains one
//! recorder `T` per set of [`Attributes`]; recording happens through plain
//! member functions on the recorder (e.g. [`U64Counter::inc`]), and reporting
//! happens by draining the registry into a [`RawReporter`].
//!
//! ```
//! use metric::{Registry, Metric, U64Counter, RawReporter, Attributes, Observation};
//!
//! let registry = Registry::new();
//! let counter: Metric<U64Counter> = registry.register_metric("cache_hits", "cache hit count");
//!
//! let recorder = counter.recorder(&[("name", "mark_cache")]);
//! recorder.inc(2);
//!
//! let mut reporter = RawReporter::default();
//! registry.report(&mut reporter);
//! let observations = reporter.metric("cache_hits").unwrap();
//! assert_eq!(
//!     observations.observation(&Attributes::from(&[("name", "mark_cache")])),
//!     Some(&Observation::U64Counter(2)),
//! );
//! ```

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use parking_lot::Mutex;
use std::any::Any;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

/// A set of key-value pairs associated with an observation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Attributes(BTreeMap<&'static str, Cow<'static, str>>);

impl Attributes {
    /// Insert or replace an attribute.
    pub fn insert(&mut self, key: &'static str, value: impl Into<Cow<'static, str>>) {
        self.0.insert(key, value.into());
    }
}

impl<const N: usize> From<&[(&'static str, &'static str); N]> for Attributes {
    fn from(pairs: &[(&'static str, &'static str); N]) -> Self {
        Self(
            pairs
                .iter()
                .map(|(k, v)| (*k, Cow::Borrowed(*v)))
                .collect(),
        )
    }
}

impl From<&[(&'static str, &'static str)]> for Attributes {
    fn from(pairs: &[(&'static str, &'static str)]) -> Self {
        Self(
            pairs
                .iter()
                .map(|(k, v)| (*k, Cow::Borrowed(*v)))
                .collect(),
        )
    }
}

/// A single reported measurement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// A monotonic u64 counter.
    U64Counter(u64),
}

/// Something that can record an [`Observation`] for a single attribute set.
pub trait MetricObserver: Debug + Default + Clone + Send + Sync + 'static {
    /// Produce the current observation.
    fn observe(&self) -> Observation;
}

/// A monotonic counter. Cheap to clone; clones share the same underlying value.
#[derive(Debug, Clone, Default)]
pub struct U64Counter(Arc<AtomicU64>);

impl U64Counter {
    /// Increment the counter by `count`.
    pub fn inc(&self, count: u64) {
        self.0.fetch_add(count, Ordering::Relaxed);
    }

    /// Read the current value.
    pub fn fetch(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl MetricObserver for U64Counter {
    fn observe(&self) -> Observation {
        Observation::U64Counter(self.fetch())
    }
}

/// A named instrument that maintains one recorder per attribute set.
#[derive(Debug)]
pub struct Metric<T> {
    name: &'static str,
    description: &'static str,
    shard: Arc<Mutex<BTreeMap<Attributes, T>>>,
}

impl<T> Clone for Metric<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            description: self.description,
            shard: Arc::clone(&self.shard),
        }
    }
}

impl<T: MetricObserver> Metric<T> {
    fn new(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            description,
            shard: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Get or create the recorder for the given attribute set.
    pub fn recorder(&self, attributes: impl Into<Attributes>) -> T {
        self.shard
            .lock()
            .entry(attributes.into())
            .or_default()
            .clone()
    }
}

/// Type-erased half of [`Metric`] stored in the [`Registry`].
trait Instrument: Debug + Send + Sync {
    fn report(&self, reporter: &mut RawReporter);

    fn as_any(&self) -> &dyn Any;
}

impl<T: MetricObserver> Instrument for Metric<T> {
    fn report(&self, reporter: &mut RawReporter) {
        let observations = self
            .shard
            .lock()
            .iter()
            .map(|(attributes, recorder)| (attributes.clone(), recorder.observe()))
            .collect();

        reporter.observations.push(ObservationSet {
            metric_name: self.name,
            description: self.description,
            observations,
        });
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Stores instruments by name and reports them in alphabetical order.
#[derive(Debug, Default)]
pub struct Registry {
    instruments: Mutex<BTreeMap<&'static str, Arc<dyn Instrument>>>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new metric, or return the existing registration.
    ///
    /// # Panics
    ///
    /// Panics if a metric of the same name but a different type has already
    /// been registered.
    pub fn register_metric<T: MetricObserver>(
        &self,
        name: &'static str,
        description: &'static str,
    ) -> Metric<T> {
        let mut instruments = self.instruments.lock();
        let instrument = Arc::clone(
            instruments
                .entry(name)
                .or_insert_with(|| Arc::new(Metric::<T>::new(name, description))),
        );

        instrument
            .as_any()
            .downcast_ref::<Metric<T>>()
            .unwrap_or_else(|| panic!("metric {name} registered with a different type"))
            .clone()
    }

    /// Report every registered instrument into `reporter`.
    pub fn report(&self, reporter: &mut RawReporter) {
        for instrument in self.instruments.lock().values() {
            instrument.report(reporter);
        }
    }
}

/// All observations of one metric at reporting time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservationSet {
    /// The name the metric was registered under.
    pub metric_name: &'static str,
    /// The registered help text.
    pub description: &'static str,
    /// One observation per attribute set.
    pub observations: Vec<(Attributes, Observation)>,
}

impl ObservationSet {
    /// The observation for the given attribute set, if any.
    pub fn observation(&self, attributes: &Attributes) -> Option<&Observation> {
        self.observations
            .iter()
            .find_map(|(a, o)| (a == attributes).then_some(o))
    }
}

/// A reporter that buffers observations, useful for tests.
#[derive(Debug, Default)]
pub struct RawReporter {
    observations: Vec<ObservationSet>,
}

impl RawReporter {
    /// The observation set for the given metric name, if any.
    pub fn metric(&self, metric_name: &str) -> Option<&ObservationSet> {
        self.observations
            .iter()
            .find(|set| set.metric_name == metric_name)
    }

    /// All buffered observation sets, in registration (alphabetical) order.
    pub fn observations(&self) -> &[ObservationSet] {
        &self.observations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_recorder_is_shared() {
        let registry = Registry::new();
        let metric: Metric<U64Counter> = registry.register_metric("calls", "number of calls");

        let r1 = metric.recorder(&[("kind", "read")]);
        let r2 = metric.recorder(&[("kind", "read")]);
        let other = metric.recorder(&[("kind", "write")]);

        r1.inc(1);
        r2.inc(2);
        other.inc(10);

        assert_eq!(r1.fetch(), 3);

        let mut reporter = RawReporter::default();
        registry.report(&mut reporter);

        let set = reporter.metric("calls").unwrap();
        assert_eq!(set.description, "number of calls");
        assert_eq!(
            set.observation(&Attributes::from(&[("kind", "read")])),
            Some(&Observation::U64Counter(3))
        );
        assert_eq!(
            set.observation(&Attributes::from(&[("kind", "write")])),
            Some(&Observation::U64Counter(10))
        );
    }

    #[test]
    fn test_re_registration_returns_same_metric() {
        let registry = Registry::new();
        let a: Metric<U64Counter> = registry.register_metric("dups", "");
        let b: Metric<U64Counter> = registry.register_metric("dups", "");

        a.recorder(&[("x", "1")]).inc(5);
        assert_eq!(b.recorder(&[("x", "1")]).fetch(), 5);
    }
}

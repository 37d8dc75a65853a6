//! Hardware-fault injection around any [`Client`].
//!
//! Two modes compose:
//!
//! - *Scripted* one-shot faults for deterministic tests, notably "the
//!   transaction applied but the acknowledgement was lost", the one case
//!   where the write path must tolerate partial success.
//! - *Probabilistic* faults from a seeded RNG for soak-style tests.

use crate::{
    Client, CreateMode, Error, ErrorKind, Event, MultiError, Op, OpResponse, Result, Stat,
};
use observability_deps::tracing::debug;
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{collections::VecDeque, sync::Arc};

/// A scripted one-shot fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Fail the next `multi` before anything is applied.
    MultiBeforeApply,
    /// Apply the next `multi`, then report `ConnectionLoss` anyway: the
    /// acknowledgement is lost.
    MultiAfterApply,
    /// Fail the next non-multi call.
    Op,
}

#[derive(Debug)]
struct FaultState {
    scripted: VecDeque<Fault>,
    rng: Option<(StdRng, f64)>,
}

/// A [`Client`] decorator injecting hardware faults.
#[derive(Debug)]
pub struct FaultInjecting {
    inner: Arc<dyn Client>,
    state: Mutex<FaultState>,
}

impl FaultInjecting {
    /// Wrap `inner` with no faults scripted.
    pub fn new(inner: Arc<dyn Client>) -> Self {
        Self {
            inner,
            state: Mutex::new(FaultState {
                scripted: VecDeque::new(),
                rng: None,
            }),
        }
    }

    /// Additionally fail any call with `probability`, drawn from a RNG
    /// seeded with `seed` so failures replay.
    pub fn with_probability(self, probability: f64, seed: u64) -> Self {
        self.state.lock().rng = Some((StdRng::seed_from_u64(seed), probability));
        self
    }

    /// Script the next fault; scripted faults fire in FIFO order before any
    /// probabilistic ones.
    pub fn script(&self, fault: Fault) {
        self.state.lock().scripted.push_back(fault);
    }

    fn connection_loss(path: &str) -> Error {
        Error::new(ErrorKind::ConnectionLoss, path)
    }

    /// Whether a probabilistic fault fires now.
    fn roll(&self) -> bool {
        let mut state = self.state.lock();
        match &mut state.rng {
            Some((rng, probability)) => rng.gen_bool(*probability),
            None => false,
        }
    }

    fn take_scripted(&self, expected: Fault) -> bool {
        let mut state = self.state.lock();
        if state.scripted.front() == Some(&expected) {
            state.scripted.pop_front();
            true
        } else {
            false
        }
    }

    fn maybe_fail_op(&self, path: &str) -> Result<()> {
        if self.take_scripted(Fault::Op) || self.roll() {
            debug!(path, "injecting fault");
            return Err(Self::connection_loss(path));
        }
        Ok(())
    }
}

impl Client for FaultInjecting {
    fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<String> {
        self.maybe_fail_op(path)?;
        self.inner.create(path, data, mode)
    }

    fn exists(&self, path: &str) -> Result<Option<Stat>> {
        self.maybe_fail_op(path)?;
        self.inner.exists(path)
    }

    fn exists_many(&self, paths: &[String]) -> Result<Vec<Option<Stat>>> {
        self.maybe_fail_op(paths.first().map(String::as_str).unwrap_or("/"))?;
        self.inner.exists_many(paths)
    }

    fn get(&self, path: &str) -> Result<(Vec<u8>, Stat)> {
        self.maybe_fail_op(path)?;
        self.inner.get(path)
    }

    fn try_get(&self, path: &str) -> Result<Option<(Vec<u8>, Stat)>> {
        self.maybe_fail_op(path)?;
        self.inner.try_get(path)
    }

    fn try_get_watch(&self, path: &str, watch: &Event) -> Result<Option<(Vec<u8>, Stat)>> {
        self.maybe_fail_op(path)?;
        self.inner.try_get_watch(path, watch)
    }

    fn get_children(&self, path: &str) -> Result<Vec<String>> {
        self.maybe_fail_op(path)?;
        self.inner.get_children(path)
    }

    fn set_data(&self, path: &str, data: Vec<u8>, version: Option<i32>) -> Result<Stat> {
        self.maybe_fail_op(path)?;
        self.inner.set_data(path, data, version)
    }

    fn delete(&self, path: &str, version: Option<i32>) -> Result<()> {
        self.maybe_fail_op(path)?;
        self.inner.delete(path, version)
    }

    fn multi(&self, ops: Vec<Op>) -> Result<Vec<OpResponse>, MultiError> {
        let hw = |e: Error| MultiError {
            source: e,
            failed_op_index: None,
        };

        if self.take_scripted(Fault::MultiBeforeApply) || self.roll() {
            debug!("injecting fault before multi");
            return Err(hw(Self::connection_loss("/")));
        }

        let after = self.take_scripted(Fault::MultiAfterApply);
        let result = self.inner.multi(ops);
        if after || self.roll() {
            debug!("injecting fault after multi, dropping the acknowledgement");
            return Err(hw(Self::connection_loss("/")));
        }
        result
    }

    fn expired(&self) -> bool {
        self.inner.expired()
    }
}

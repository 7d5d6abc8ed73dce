//! Independent chains polled as one unit.

use std::fmt::Debug;

use crate::artifact::{Artifact, Payload};
use crate::error::{EngineError, Result};
use crate::scheduler::{ComputeScheduler, ComputeStatus};

/// A new result delivered by [`ChainSet::poll`]
///
/// Delivering a result counts as consuming it.
#[derive(Debug)]
pub enum ChainUpdate<'a, T> {
    Ready(&'a Artifact<T>),
    Failed {
        error: EngineError,
        fallback: Option<&'a Artifact<T>>,
    },
}

struct Chain<K, T: Payload> {
    key: K,
    scheduler: ComputeScheduler<T>,
    current_result_ok: bool,
}

/// A set of independent chains, one per target
pub struct ChainSet<K, T: Payload> {
    chains: Vec<Chain<K, T>>,
    shut_down: bool,
}

impl<K, T: Payload> Default for ChainSet<K, T> {
    fn default() -> Self {
        Self {
            chains: Vec::new(),
            shut_down: false,
        }
    }
}

impl<K: PartialEq + Debug, T: Payload> ChainSet<K, T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a chain, replacing (and shutting down) any chain under the same key
    pub fn insert(&mut self, key: K, scheduler: ComputeScheduler<T>) {
        if let Some(mut old) = self.remove(&key) {
            old.shutdown();
        }
        self.chains.push(Chain {
            key,
            scheduler,
            current_result_ok: false,
        });
    }

    pub fn remove(&mut self, key: &K) -> Option<ComputeScheduler<T>> {
        let index = self.chains.iter().position(|c| &c.key == key)?;
        Some(self.chains.remove(index).scheduler)
    }

    pub fn get(&self, key: &K) -> Option<&ComputeScheduler<T>> {
        self.chains
            .iter()
            .find(|c| &c.key == key)
            .map(|c| &c.scheduler)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut ComputeScheduler<T>> {
        self.chains
            .iter_mut()
            .find(|c| &c.key == key)
            .map(|c| &mut c.scheduler)
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.chains.iter().map(|c| &c.key)
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }

    /// Whether the last delivered result of this chain was a success
    pub fn current_result_ok(&self, key: &K) -> Option<bool> {
        self.chains
            .iter()
            .find(|c| &c.key == key)
            .map(|c| c.current_result_ok)
    }

    /// Poll every chain once; returns true if any chain is computing
    ///
    /// `on_update` is called for each chain that produced a new result.
    /// Background faults are drained and logged here.
    pub fn poll(&mut self, mut on_update: impl FnMut(&K, ChainUpdate<'_, T>)) -> bool {
        if self.shut_down {
            return false;
        }

        let mut computing = false;
        for chain in &mut self.chains {
            let Chain {
                key,
                scheduler,
                current_result_ok,
            } = chain;

            let delivered = match scheduler.check_for_new_result() {
                ComputeStatus::Idle => None,
                ComputeStatus::Computing => {
                    computing = true;
                    None
                }
                ComputeStatus::Ready(_) => Some(true),
                ComputeStatus::Failed { .. } => Some(false),
            };

            if let Some(ok) = delivered {
                *current_result_ok = ok;
                if ok {
                    if let Some(artifact) = scheduler.peek() {
                        on_update(key, ChainUpdate::Ready(artifact));
                    }
                } else {
                    let error = scheduler
                        .error()
                        .cloned()
                        .unwrap_or_else(|| EngineError::not_ready("failed without an error"));
                    log::debug!("chain {:?} delivered a failed result: {}", key, error);
                    let fallback = scheduler.peek();
                    on_update(key, ChainUpdate::Failed { error, fallback });
                }
            }

            if let Some(fault) = scheduler.extract_background_exception() {
                log::error!("exception in background compute for chain {:?}: {}", key, fault);
            }
        }
        computing
    }

    /// True if any chain has a worker in flight
    pub fn is_computing(&self) -> bool {
        self.chains.iter().any(|c| c.scheduler.is_computing())
    }

    /// True only when every chain is idle with a consumed, successful result
    pub fn can_apply(&self) -> bool {
        !self.chains.is_empty()
            && self
                .chains
                .iter()
                .all(|c| c.current_result_ok && c.scheduler.can_apply())
    }

    /// Take every chain's result, or none if any chain is not ready
    ///
    /// Every chain is checked before anything is moved out, so a failure
    /// leaves all results in place.
    pub fn extract_all(&mut self) -> Result<Vec<(K, Artifact<T>)>>
    where
        K: Clone,
    {
        if self.shut_down {
            return Err(EngineError::ShutDown);
        }
        if self.chains.is_empty() {
            return Err(EngineError::not_ready("no chains"));
        }
        for chain in &self.chains {
            if !(chain.current_result_ok && chain.scheduler.can_apply()) {
                return Err(EngineError::not_ready(format!(
                    "chain {:?} has no applicable result",
                    chain.key
                )));
            }
            if !chain.scheduler.can_extract() {
                log::debug!("chain {:?} result is still shared", chain.key);
                return Err(EngineError::ArtifactShared);
            }
        }

        let mut results = Vec::with_capacity(self.chains.len());
        for chain in &mut self.chains {
            let artifact = chain.scheduler.extract()?;
            chain.current_result_ok = false;
            results.push((chain.key.clone(), artifact));
        }
        Ok(results)
    }

    /// Shut down every chain; later polls do nothing
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        for chain in &mut self.chains {
            chain.scheduler.shutdown();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use crate::builder::OperatorBuilder;
    use crate::error::DeriveError;
    use crate::operator::{DeriveContext, Operator};
    use crate::params::ParamSpec;

    fn chain(value: i64) -> (Operator<i64>, ComputeScheduler<i64>) {
        let source = Operator::constant("target", Artifact::new(value));
        let op = OperatorBuilder::new("offset", |ctx: &DeriveContext<'_, i64>| {
            let offset = ctx.params().int("offset").unwrap_or(0);
            if offset < 0 {
                return Err(DeriveError::new("negative offset"));
            }
            let input = ctx.input(0).ok_or("missing input")?;
            Ok(Some(Artifact::new(input.payload() + offset)))
        })
        .param(ParamSpec::int("offset", 1))
        .input(&source)
        .build()
        .unwrap();
        (op.clone(), ComputeScheduler::new(op))
    }

    fn poll_until_idle(set: &mut ChainSet<&'static str, i64>) -> Vec<(&'static str, bool)> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut delivered = Vec::new();
        loop {
            let computing = set.poll(|key, update| {
                delivered.push((*key, matches!(update, ChainUpdate::Ready(_))));
            });
            if !computing && !set.is_computing() {
                return delivered;
            }
            assert!(Instant::now() < deadline, "chains did not settle");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_apply_requires_every_chain() {
        let (_a_op, a) = chain(10);
        let (b_op, b) = chain(20);
        let mut set = ChainSet::new();
        set.insert("a", a);
        set.insert("b", b);
        assert!(!set.can_apply());

        let delivered = poll_until_idle(&mut set);
        assert_eq!(delivered.len(), 2);
        assert!(set.can_apply());

        // one failing chain blocks the whole set
        b_op.set_parameter("offset", -1).unwrap();
        let delivered = poll_until_idle(&mut set);
        assert_eq!(delivered, vec![("b", false)]);
        assert_eq!(set.current_result_ok(&"b"), Some(false));
        assert!(!set.can_apply());
        assert!(matches!(set.extract_all(), Err(EngineError::NotReady(_))));

        b_op.set_parameter("offset", 2).unwrap();
        poll_until_idle(&mut set);
        assert!(set.can_apply());

        let results = set.extract_all().unwrap();
        let values: Vec<(&str, i64)> = results
            .into_iter()
            .map(|(k, a)| (k, a.into_payload()))
            .collect();
        assert_eq!(values, vec![("a", 11), ("b", 22)]);
    }

    #[test]
    fn test_shutdown_stops_polling() {
        let (_op, scheduler) = chain(1);
        let mut set = ChainSet::new();
        set.insert(7u32, scheduler);
        set.shutdown();

        assert!(set.is_shut_down());
        assert!(!set.poll(|_, _| panic!("no updates after shutdown")));
        assert!(set.get(&7).unwrap().is_shut_down());
    }

    #[test]
    fn test_insert_replaces_existing_key() {
        let (_a, first) = chain(1);
        let (_b, second) = chain(2);
        let mut set = ChainSet::new();
        set.insert("x", first);
        set.insert("x", second);
        assert_eq!(set.len(), 1);
        assert_eq!(set.keys().copied().collect::<Vec<_>>(), vec!["x"]);
        assert!(set.remove(&"x").is_some());
        assert!(set.is_empty());
    }

    #[test]
    fn test_extract_all_leaves_everything_when_one_result_is_shared() {
        let (_a_op, a) = chain(10);
        let (b_op, b) = chain(20);
        let mut set = ChainSet::new();
        set.insert("a", a);
        set.insert("b", b);
        poll_until_idle(&mut set);
        assert!(set.can_apply());

        let held = b_op.cached().unwrap();
        assert_eq!(set.extract_all().unwrap_err(), EngineError::ArtifactShared);

        // chain a kept its result
        let a = set.get(&"a").unwrap();
        assert!(a.can_apply());
        assert_eq!(*a.fallback().unwrap().payload(), 11);
        assert!(set.can_apply());
        assert!(poll_until_idle(&mut set).is_empty());

        drop(held);
        let values: Vec<(&str, i64)> = set
            .extract_all()
            .unwrap()
            .into_iter()
            .map(|(k, a)| (k, a.into_payload()))
            .collect();
        assert_eq!(values, vec![("a", 11), ("b", 21)]);

        set.shutdown();
        assert_eq!(set.extract_all().unwrap_err(), EngineError::ShutDown);
    }

    /// Payload whose clone panics while `shatter` is set
    struct Brittle {
        shatter: Arc<AtomicBool>,
    }

    impl Clone for Brittle {
        fn clone(&self) -> Self {
            if self.shatter.load(Ordering::SeqCst) {
                panic!("cloned a shattered payload");
            }
            Self {
                shatter: self.shatter.clone(),
            }
        }
    }

    #[test]
    fn test_poll_drains_background_faults() {
        let shatter = Arc::new(AtomicBool::new(true));
        let source = Operator::constant(
            "target",
            Artifact::new(Brittle {
                shatter: shatter.clone(),
            }),
        );
        let reject = OperatorBuilder::new("reject", |_ctx: &DeriveContext<'_, Brittle>| {
            Err(DeriveError::new("rejected"))
        })
        .input(&source)
        .build()
        .unwrap();

        let mut set = ChainSet::new();
        set.insert("shell", ComputeScheduler::new(reject));

        let mut faults = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while set.poll(|_, update| {
            if let ChainUpdate::Failed { error, fallback } = update {
                faults.push((error, fallback.is_some()));
            }
        }) {
            assert!(Instant::now() < deadline, "chain did not settle");
            thread::sleep(Duration::from_millis(2));
        }

        assert_eq!(faults.len(), 1);
        assert!(matches!(faults[0], (EngineError::BackgroundFault(_), false)));
        assert_eq!(set.current_result_ok(&"shell"), Some(false));
        // the fault was taken by the poll
        assert!(set
            .get_mut(&"shell")
            .unwrap()
            .extract_background_exception()
            .is_none());
        assert!(!set.poll(|_, _| panic!("fault delivered twice")));
        assert!(!set.can_apply());
    }
}

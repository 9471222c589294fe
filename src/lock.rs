//! Lock manager: page-granularity locking with deadlock detection,
//! kept external to the B-tree/buffer-pool core per the narrow
//! contract of §6 (`get`/`put`/`vec`/`id`/`id_free`/`downgrade`). S/X
//! latch maps with a polling acquire-with-timeout, plus a wait-for
//! graph for cycle detection, generalized from a single fixed B-tree's
//! page id to any object the core wants to serialize access to — here,
//! a buffer-pool [`PageKey`].

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
    thread::sleep,
    time::{Duration, Instant},
};

use crate::{buffer_pool::PageKey, error::SmallError, types::SmallResult};

pub type LockerId = u64;

static NEXT_LOCKER_ID: AtomicU64 = AtomicU64::new(1);

static ACQUIRE_TIMEOUT_SECS: u64 = 3;
static POLL_INTERVAL_MS: u64 = 10;

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum LockMode {
    Read,
    Write,
    /// Intent-to-write: held while descending the tree toward a node
    /// that will be upgraded to `Write` once the split decision is
    /// known, so a reader isn't blocked by the whole root-to-leaf path.
    IWrite,
    Upgrade,
}

/// `vec()` takes an atomic batch of lock requests — e.g. every page on
/// a lock-coupled descent path — so the caller either gets all of them
/// or none, never a partial set it has to unwind by hand.
pub struct LockRequest {
    pub object: PageKey,
    pub mode: LockMode,
}

/// Returned by `get`/`vec`; dropping or calling [`LockManager::put`]
/// releases it. Kept intentionally dumb (no Drop-based auto-release):
/// the core decides exactly when a lock is released, which for
/// lock-coupling is "the instant the child is safely latched", not
/// "whenever this value happens to go out of scope".
#[derive(Debug, Clone, Copy)]
pub struct LockHandle {
    pub locker: LockerId,
    pub object: PageKey,
}

struct WaitForGraph {
    graph: HashMap<LockerId, HashSet<LockerId>>,
}

impl WaitForGraph {
    fn new() -> Self {
        Self {
            graph: HashMap::new(),
        }
    }

    fn add_edge(&mut self, from: LockerId, to: LockerId) {
        self.graph.entry(from).or_insert_with(HashSet::new).insert(to);
    }

    fn remove_waiter(&mut self, locker: LockerId) {
        self.graph.remove(&locker);
    }

    /// Returns the cycle itself rather than a bare yes/no, so the
    /// caller can name the transaction chosen as deadlock victim
    /// instead of just refusing the request.
    fn find_cycle(&self) -> Option<Vec<LockerId>> {
        let mut visited = HashSet::new();

        for &start in self.graph.keys() {
            if visited.contains(&start) {
                continue;
            }
            let mut stack = vec![start];
            let mut on_stack = HashSet::new();
            if let Some(cycle) = self.dfs(start, &mut visited, &mut on_stack, &mut stack) {
                return Some(cycle);
            }
        }

        None
    }

    fn dfs(
        &self,
        node: LockerId,
        visited: &mut HashSet<LockerId>,
        on_stack: &mut HashSet<LockerId>,
        stack: &mut Vec<LockerId>,
    ) -> Option<Vec<LockerId>> {
        visited.insert(node);
        on_stack.insert(node);

        if let Some(neighbors) = self.graph.get(&node) {
            for &next in neighbors {
                if on_stack.contains(&next) {
                    let start = stack.iter().position(|&n| n == next).unwrap_or(0);
                    return Some(stack[start..].to_vec());
                }
                if !visited.contains(&next) {
                    stack.push(next);
                    if let Some(cycle) = self.dfs(next, visited, on_stack, stack) {
                        return Some(cycle);
                    }
                    stack.pop();
                }
            }
        }

        on_stack.remove(&node);
        None
    }
}

/// The narrow contract a B-tree cursor or the applier's `apply_txn`
/// actually calls through.
pub trait LockManager: Send + Sync {
    fn id(&self) -> LockerId;
    fn id_free(&self, locker: LockerId);
    fn get(&self, locker: LockerId, object: PageKey, mode: LockMode) -> Result<LockHandle, SmallError>;
    fn vec(&self, locker: LockerId, requests: &[LockRequest]) -> Result<Vec<LockHandle>, SmallError>;
    fn put(&self, handle: LockHandle) -> SmallResult;
    fn downgrade(&self, handle: LockHandle, mode: LockMode) -> Result<LockHandle, SmallError>;
    fn release_locker(&self, locker: LockerId);
}

struct State {
    s_latches: HashMap<PageKey, HashSet<LockerId>>,
    x_latches: HashMap<PageKey, LockerId>,
    held: HashMap<LockerId, HashSet<PageKey>>,
    wait_for: WaitForGraph,
}

/// Reference implementation: S/X latch maps per object plus a
/// wait-for graph, matching `concurrent_status.rs`'s
/// check-for-deadlock-then-poll acquire loop. `IWrite` and `Upgrade`
/// are treated as `Write` for conflict purposes — this engine doesn't
/// need intention-lock granularity finer than "exclusive", since every
/// object is a single page rather than a hierarchy of tables/pages.
pub struct LatchLockManager {
    state: Mutex<State>,
}

impl LatchLockManager {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                s_latches: HashMap::new(),
                x_latches: HashMap::new(),
                held: HashMap::new(),
                wait_for: WaitForGraph::new(),
            }),
        }
    }

    fn is_exclusive(mode: LockMode) -> bool {
        !matches!(mode, LockMode::Read)
    }

    fn update_wait_for(state: &mut State, locker: LockerId, object: &PageKey, mode: LockMode) {
        if let Some(&holder) = state.x_latches.get(object) {
            if holder != locker {
                state.wait_for.add_edge(locker, holder);
            }
        }
        if Self::is_exclusive(mode) {
            if let Some(holders) = state.s_latches.get(object) {
                for &holder in holders {
                    if holder != locker {
                        state.wait_for.add_edge(locker, holder);
                    }
                }
            }
        }
    }

    /// Idempotent: granting a lock the locker already holds just
    /// returns success.
    fn try_add(state: &mut State, locker: LockerId, object: &PageKey, mode: LockMode) -> bool {
        if let Some(&holder) = state.x_latches.get(object) {
            if holder != locker {
                return false;
            }
        } else if Self::is_exclusive(mode) {
            if let Some(holders) = state.s_latches.get(object) {
                if holders.iter().any(|&h| h != locker) {
                    return false;
                }
            }
        }

        if Self::is_exclusive(mode) {
            state.x_latches.insert(*object, locker);
        } else {
            state.s_latches.entry(*object).or_insert_with(HashSet::new).insert(locker);
        }

        state.held.entry(locker).or_insert_with(HashSet::new).insert(*object);
        true
    }

    fn release_one(state: &mut State, locker: LockerId, object: &PageKey) {
        if let Some(holders) = state.s_latches.get_mut(object) {
            holders.remove(&locker);
            if holders.is_empty() {
                state.s_latches.remove(object);
            }
        }
        if state.x_latches.get(object) == Some(&locker) {
            state.x_latches.remove(object);
        }
        if let Some(set) = state.held.get_mut(&locker) {
            set.remove(object);
        }
    }
}

impl LockManager for LatchLockManager {
    fn id(&self) -> LockerId {
        NEXT_LOCKER_ID.fetch_add(1, Ordering::SeqCst)
    }

    fn id_free(&self, locker: LockerId) {
        self.release_locker(locker);
    }

    fn get(&self, locker: LockerId, object: PageKey, mode: LockMode) -> Result<LockHandle, SmallError> {
        {
            let mut state = self.state.lock().unwrap();
            Self::update_wait_for(&mut state, locker, &object, mode);
            if let Some(cycle) = state.wait_for.find_cycle() {
                let err = SmallError::new(&format!(
                    "deadlock detected acquiring {:?} on {:?}: cycle {:?}",
                    mode, object, cycle
                ));
                return Err(err);
            }
        }

        let start = Instant::now();
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if Self::try_add(&mut state, locker, &object, mode) {
                    state.wait_for.remove_waiter(locker);
                    return Ok(LockHandle { locker, object });
                }
            }

            if start.elapsed().as_secs() >= ACQUIRE_TIMEOUT_SECS {
                let mut state = self.state.lock().unwrap();
                state.wait_for.remove_waiter(locker);
                return Err(SmallError::new(&format!(
                    "lock acquire timeout: locker {} mode {:?} object {:?}",
                    locker, mode, object
                )));
            }

            sleep(Duration::from_millis(POLL_INTERVAL_MS));
        }
    }

    /// Grants every request or none: used for lock-coupled descents
    /// where the caller must not hold half of a chain if the other
    /// half deadlocks.
    fn vec(&self, locker: LockerId, requests: &[LockRequest]) -> Result<Vec<LockHandle>, SmallError> {
        let mut granted = Vec::with_capacity(requests.len());
        for req in requests {
            match self.get(locker, req.object, req.mode) {
                Ok(handle) => granted.push(handle),
                Err(e) => {
                    for handle in granted {
                        let _ = self.put(handle);
                    }
                    return Err(e);
                }
            }
        }
        Ok(granted)
    }

    fn put(&self, handle: LockHandle) -> SmallResult {
        let mut state = self.state.lock().unwrap();
        Self::release_one(&mut state, handle.locker, &handle.object);
        Ok(())
    }

    fn downgrade(&self, handle: LockHandle, mode: LockMode) -> Result<LockHandle, SmallError> {
        if mode != LockMode::Read {
            return Err(SmallError::new("downgrade only supports Read"));
        }
        let mut state = self.state.lock().unwrap();
        if state.x_latches.get(&handle.object) == Some(&handle.locker) {
            state.x_latches.remove(&handle.object);
            state
                .s_latches
                .entry(handle.object)
                .or_insert_with(HashSet::new)
                .insert(handle.locker);
        }
        Ok(LockHandle {
            locker: handle.locker,
            object: handle.object,
        })
    }

    fn release_locker(&self, locker: LockerId) {
        let mut state = self.state.lock().unwrap();
        let objects: Vec<PageKey> = state
            .held
            .get(&locker)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        for object in objects {
            Self::release_one(&mut state, locker, &object);
        }
        state.held.remove(&locker);
        state.wait_for.remove_waiter(locker);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(pgno: u32) -> PageKey {
        PageKey::new(crate::fileid::FileId::generate(), pgno)
    }

    #[test]
    fn shared_locks_coexist() {
        let lm = LatchLockManager::new();
        let a = lm.id();
        let b = lm.id();
        let obj = key(1);
        let h1 = lm.get(a, obj, LockMode::Read).unwrap();
        let h2 = lm.get(b, obj, LockMode::Read).unwrap();
        lm.put(h1).unwrap();
        lm.put(h2).unwrap();
    }

    #[test]
    fn exclusive_excludes_shared() {
        let lm = LatchLockManager::new();
        let a = lm.id();
        let obj = key(2);
        let h = lm.get(a, obj, LockMode::Write).unwrap();
        assert_eq!(h.object, obj);
        lm.put(h).unwrap();
    }

    #[test]
    fn release_locker_drops_all_its_locks() {
        let lm = LatchLockManager::new();
        let a = lm.id();
        let b = lm.id();
        let obj = key(3);
        let _h = lm.get(a, obj, LockMode::Write).unwrap();
        lm.release_locker(a);
        // now b can take it exclusively without blocking
        let h2 = lm.get(b, obj, LockMode::Write).unwrap();
        lm.put(h2).unwrap();
    }
}

use gw_core::RecoveredMark;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use crate::error::AllocError;

#[derive(Debug, Default)]
struct MarkState {
    in_use: BTreeSet<u32>,
    by_name: HashMap<String, u32>,
    /// Further recovered marks of an owner beyond its binding.
    extra: HashMap<String, Vec<u32>>,
    /// Last committed mark; scans for a free mark start right after it.
    last: u32,
}

impl MarkState {
    /// Unbind a name, releasing its mark and any extra recovered marks.
    fn remove(&mut self, name: &str) -> Option<u32> {
        let mark = self.by_name.remove(name)?;
        self.in_use.remove(&mark);
        for extra in self.extra.remove(name).unwrap_or_default() {
            self.in_use.remove(&extra);
        }
        Some(mark)
    }
}

/// Hands out connection marks in `1..=max`, one per entity name.
///
/// Every allocation runs inside a [`MarkTransaction`], which holds the
/// allocator lock until it is committed, aborted or dropped. Concurrent
/// callers are serialized for the whole span.
#[derive(Debug)]
pub struct MarkAllocator {
    max: u32,
    state: Mutex<MarkState>,
}

impl MarkAllocator {
    pub fn new(max: u32) -> Self {
        Self {
            max: max.max(1),
            state: Mutex::new(MarkState::default()),
        }
    }

    /// Rebuild allocator state from marks found on persisted objects. Routing
    /// marks and conntrack marks share one namespace.
    pub fn from_recovered(max: u32, recovered: &[RecoveredMark]) -> Self {
        let allocator = Self::new(max);

        {
            let mut state = allocator.lock();
            for entry in recovered {
                if entry.mark == 0 || entry.mark > allocator.max {
                    warn!(
                        owner = %entry.owner,
                        mark = entry.mark,
                        max = allocator.max,
                        "Ignoring persisted mark outside the allocatable range"
                    );
                    continue;
                }

                state.in_use.insert(entry.mark);
                let bound = state.by_name.get(&entry.owner).copied();
                match bound {
                    Some(bound) if bound != entry.mark => {
                        warn!(
                            owner = %entry.owner,
                            bound,
                            extra = entry.mark,
                            "Owner carries more than one mark, keeping the first"
                        );
                        state
                            .extra
                            .entry(entry.owner.clone())
                            .or_default()
                            .push(entry.mark);
                    }
                    Some(_) => {}
                    None => {
                        state.by_name.insert(entry.owner.clone(), entry.mark);
                    }
                }
                state.last = state.last.max(entry.mark);
            }

            info!(
                marks = state.in_use.len(),
                owners = state.by_name.len(),
                "Recovered mark allocator state"
            );
        }

        allocator
    }

    fn lock(&self) -> MutexGuard<'_, MarkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    /// Begin an allocation for `name`. If the name already owns a mark the
    /// transaction carries it; otherwise it carries the next free mark as a
    /// pending value that is only recorded on commit.
    pub fn start_transaction(&self, name: &str) -> Result<MarkTransaction<'_>, AllocError> {
        let state = self.lock();

        let existing = state.by_name.get(name).copied();
        if let Some(mark) = existing {
            return Ok(MarkTransaction {
                state,
                name: name.to_string(),
                mark,
                is_new: false,
            });
        }

        if state.in_use.len() as u64 >= u64::from(self.max) {
            return Err(AllocError::MarksExhausted { max: self.max });
        }

        let mut candidate = state.last;
        loop {
            candidate = if candidate >= self.max { 1 } else { candidate + 1 };
            if !state.in_use.contains(&candidate) {
                break;
            }
        }

        debug!(name, mark = candidate, "Reserved pending mark");
        Ok(MarkTransaction {
            state,
            name: name.to_string(),
            mark: candidate,
            is_new: true,
        })
    }

    /// Release the mark owned by `name`.
    pub fn free(&self, name: &str) -> Option<u32> {
        let freed = self.lock().remove(name);
        if let Some(mark) = freed {
            debug!(name, mark, "Freed mark");
        }
        freed
    }

    pub fn mark_of(&self, name: &str) -> Option<u32> {
        self.lock().by_name.get(name).copied()
    }

    pub fn in_use_count(&self) -> usize {
        self.lock().in_use.len()
    }

    /// Committed (name, mark) bindings, ordered by mark.
    pub fn bindings(&self) -> Vec<(String, u32)> {
        let mut bindings: Vec<_> = self
            .lock()
            .by_name
            .iter()
            .map(|(name, mark)| (name.clone(), *mark))
            .collect();
        bindings.sort_by_key(|(_, mark)| *mark);
        bindings
    }
}

/// An in-flight mark allocation. Holds the allocator lock until consumed.
/// Dropping it without committing leaves the allocator unchanged.
#[must_use = "dropping a transaction discards the pending mark"]
pub struct MarkTransaction<'a> {
    state: MutexGuard<'a, MarkState>,
    name: String,
    mark: u32,
    is_new: bool,
}

impl MarkTransaction<'_> {
    pub fn mark(&self) -> u32 {
        self.mark
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// False when the name already owned this mark.
    pub fn is_new(&self) -> bool {
        self.is_new
    }

    /// Record the mark as in use and bind it to the name.
    pub fn commit(mut self) -> u32 {
        if self.is_new {
            self.state.in_use.insert(self.mark);
            self.state.by_name.insert(self.name.clone(), self.mark);
            self.state.last = self.mark;
            info!(name = %self.name, mark = self.mark, "Committed mark");
        }
        self.mark
    }

    pub fn abort(self) {
        debug!(name = %self.name, mark = self.mark, "Aborted mark transaction");
    }

    /// Commit on success, abort on failure.
    pub fn finish<T, E>(self, outcome: &Result<T, E>) -> Option<u32> {
        match outcome {
            Ok(_) => Some(self.commit()),
            Err(_) => {
                self.abort();
                None
            }
        }
    }

    /// Release the name's mark instead of committing.
    pub fn free(mut self) -> Option<u32> {
        let freed = self.state.remove(&self.name);
        debug!(name = %self.name, mark = ?freed, "Freed mark");
        freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn allocate(allocator: &MarkAllocator, name: &str) -> u32 {
        allocator.start_transaction(name).unwrap().commit()
    }

    #[test]
    fn pending_mark_is_stable_until_commit() {
        let allocator = MarkAllocator::new(100);
        let first = allocator.start_transaction("a").unwrap().mark();
        let second = allocator.start_transaction("a").unwrap().mark();
        assert_eq!(first, second);
        assert_eq!(allocator.in_use_count(), 0);
        assert_eq!(allocator.mark_of("a"), None);
    }

    #[test]
    fn committed_mark_is_never_handed_to_another_name() {
        let allocator = MarkAllocator::new(100);
        let a = allocate(&allocator, "a");
        let b = allocator.start_transaction("b").unwrap();
        assert_ne!(b.mark(), a);
        assert!(b.is_new());
    }

    #[test]
    fn restart_for_bound_name_returns_existing_mark() {
        let allocator = MarkAllocator::new(100);
        let a = allocate(&allocator, "a");
        let again = allocator.start_transaction("a").unwrap();
        assert_eq!(again.mark(), a);
        assert!(!again.is_new());
        assert_eq!(again.commit(), a);
        assert_eq!(allocator.in_use_count(), 1);
    }

    #[test]
    fn failed_outcome_records_nothing() {
        let allocator = MarkAllocator::new(100);
        let txn = allocator.start_transaction("a").unwrap();
        let outcome: Result<(), &str> = Err("write failed");
        assert_eq!(txn.finish(&outcome), None);
        assert_eq!(allocator.in_use_count(), 0);

        let txn = allocator.start_transaction("a").unwrap();
        let mark = txn.mark();
        assert_eq!(txn.finish(&Ok::<_, ()>(())), Some(mark));
        assert_eq!(allocator.mark_of("a"), Some(mark));
    }

    #[test]
    fn freed_mark_is_reused_after_wrap() {
        let allocator = MarkAllocator::new(2);
        assert_eq!(allocate(&allocator, "a"), 1);
        assert_eq!(allocate(&allocator, "b"), 2);
        assert!(matches!(
            allocator.start_transaction("c"),
            Err(AllocError::MarksExhausted { max: 2 })
        ));

        assert_eq!(allocator.free("a"), Some(1));
        assert_eq!(allocate(&allocator, "c"), 1);
    }

    #[test]
    fn transaction_free_releases_binding() {
        let allocator = MarkAllocator::new(10);
        allocate(&allocator, "a");
        let freed = allocator.start_transaction("a").unwrap().free();
        assert_eq!(freed, Some(1));
        assert_eq!(allocator.in_use_count(), 0);
        assert_eq!(allocator.free("a"), None);
    }

    #[test]
    fn recovery_merges_route_and_ctmark_namespaces() {
        let recovered = vec![
            RecoveredMark {
                owner: "remote-a".into(),
                mark: 3,
            },
            RecoveredMark {
                owner: "remote-b".into(),
                mark: 16,
            },
            RecoveredMark {
                owner: "remote-c".into(),
                mark: 0,
            },
        ];
        let allocator = MarkAllocator::from_recovered(20, &recovered);

        assert_eq!(allocator.in_use_count(), 2);
        assert_eq!(allocator.mark_of("remote-a"), Some(3));
        assert_eq!(allocator.start_transaction("remote-a").unwrap().mark(), 3);
        assert_eq!(allocator.start_transaction("remote-d").unwrap().mark(), 17);
    }

    #[test]
    fn freeing_an_owner_releases_every_recovered_mark() {
        let recovered = vec![
            RecoveredMark {
                owner: "remote-a".into(),
                mark: 3,
            },
            RecoveredMark {
                owner: "remote-a".into(),
                mark: 9,
            },
            RecoveredMark {
                owner: "remote-b".into(),
                mark: 4,
            },
        ];
        let allocator = MarkAllocator::from_recovered(20, &recovered);
        assert_eq!(allocator.in_use_count(), 3);
        assert_eq!(allocator.mark_of("remote-a"), Some(3));

        assert_eq!(allocator.free("remote-a"), Some(3));
        assert_eq!(allocator.in_use_count(), 1);
        assert_eq!(allocator.mark_of("remote-b"), Some(4));
    }

    #[test]
    fn scan_skips_recovered_marks_after_wrap() {
        let recovered: Vec<_> = [1, 2, 5]
            .into_iter()
            .map(|mark| RecoveredMark {
                owner: format!("owner-{}", mark),
                mark,
            })
            .collect();
        let allocator = MarkAllocator::from_recovered(5, &recovered);
        assert_eq!(allocate(&allocator, "x"), 3);
        assert_eq!(allocate(&allocator, "y"), 4);
        assert!(allocator.start_transaction("z").is_err());
    }

    #[test]
    fn concurrent_allocations_are_distinct() {
        let allocator = Arc::new(MarkAllocator::new(1000));
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let allocator = Arc::clone(&allocator);
                std::thread::spawn(move || {
                    (0..25)
                        .map(|i| allocate(&allocator, &format!("w{}-{}", worker, i)))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let marks: HashSet<u32> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(marks.len(), 200);
        assert_eq!(allocator.in_use_count(), 200);
    }

    proptest! {
        #[test]
        fn committed_marks_stay_unique_and_in_range(
            max in 1u32..64,
            ops in proptest::collection::vec((0u8..12, any::<bool>()), 0..80),
        ) {
            let allocator = MarkAllocator::new(max);
            for (id, release) in ops {
                let name = format!("e{}", id);
                if release {
                    allocator.free(&name);
                } else if let Ok(txn) = allocator.start_transaction(&name) {
                    txn.commit();
                }
            }

            let bindings = allocator.bindings();
            let marks: HashSet<u32> = bindings.iter().map(|(_, m)| *m).collect();
            prop_assert_eq!(marks.len(), bindings.len());
            prop_assert!(marks.iter().all(|m| (1..=max).contains(m)));
            prop_assert_eq!(allocator.in_use_count(), bindings.len());
        }
    }
}

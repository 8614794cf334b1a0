//! Hook pipeline: ordered record lifecycle callbacks.

use std::cell::RefCell;
use std::collections::HashSet;
use std::sync::Arc;

use arc_swap::ArcSwap;

use super::record::{Record, Rid};

/// Dispatch order within the hook registry. Stable by position, then by
/// insertion order within a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HookPosition {
    First,
    Early,
    Regular,
    Late,
    Last,
}

/// Which lifecycle point a hook is being invoked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookEvent {
    BeforeCreate,
    AfterCreate,
    CreateFailed,
    CreateReplicated,
    BeforeRead,
    AfterRead,
    BeforeUpdate,
    AfterUpdate,
    UpdateFailed,
    UpdateReplicated,
    BeforeDelete,
    AfterDelete,
    DeleteFailed,
    DeleteReplicated,
}

/// Which node role a hook should still run for when storage is distributed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistributedMode {
    Both,
    SourceNodeOnly,
    TargetNodeOnly,
}

/// Whether the database is presently acting as the request's originating
/// node or as a replication target, for the purpose of the distributed
/// filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Default,
    RunningDistributed,
}

/// Outcome of a single hook invocation, replacing the exception-chain control
/// flow of the original with a sum type.
#[derive(Debug, Clone)]
pub enum HookResult {
    RecordNotChanged,
    RecordChanged,
    Skip,
    SkipIo,
    RecordReplaced(Record),
}

impl HookResult {
    fn short_circuits(&self) -> bool {
        matches!(
            self,
            HookResult::Skip | HookResult::SkipIo | HookResult::RecordReplaced(_)
        )
    }
}

pub trait Hook: Send + Sync {
    /// Stable identity used for re-registration and the reentrancy guard.
    fn identity(&self) -> u64;

    fn on_event(&self, event: HookEvent, record: &mut Record) -> HookResult;

    fn distributed_mode(&self) -> DistributedMode {
        DistributedMode::Both
    }
}

struct HookEntry {
    identity: u64,
    position: HookPosition,
    hook: Arc<dyn Hook>,
}

thread_local! {
    static REENTRANCY_GUARD: RefCell<HashSet<(u64, Rid)>> = RefCell::new(HashSet::new());
}

/// Ordered registry of hooks, copy-on-write under structural change.
pub struct HookRegistry {
    entries: ArcSwap<Vec<HookEntry>>,
}

impl Default for HookRegistry {
    fn default() -> Self {
        HookRegistry {
            entries: ArcSwap::from_pointee(Vec::new()),
        }
    }
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook at a position. Re-registering the same identity moves
    /// it to the new position instead of duplicating the entry.
    pub fn register(&self, hook: Arc<dyn Hook>, position: HookPosition) {
        let identity = hook.identity();
        let mut next: Vec<HookEntry> = (**self.entries.load())
            .iter()
            .filter(|e| e.identity != identity)
            .map(|e| HookEntry {
                identity: e.identity,
                position: e.position,
                hook: e.hook.clone(),
            })
            .collect();
        next.push(HookEntry {
            identity,
            position,
            hook,
        });
        next.sort_by_key(|e| e.position);
        self.entries.store(Arc::new(next));
    }

    pub fn clear(&self) {
        self.entries.store(Arc::new(Vec::new()));
    }

    /// Invoke every registered hook for `event` against `record`, honoring
    /// the reentrancy guard and distributed-mode filter, short-circuiting on
    /// the first hook that returns Skip/SkipIo/RecordReplaced.
    pub fn callback_hooks(
        &self,
        event: HookEvent,
        record: &mut Record,
        distributed: bool,
        run_mode: RunMode,
    ) -> HookResult {
        let entered = REENTRANCY_GUARD.with(|guard| {
            let mut guard = guard.borrow_mut();
            guard.insert((event as u32 as u64, record.rid))
        });
        if !entered {
            return HookResult::RecordNotChanged;
        }
        let _release = scopeguard::guard((), |_| {
            REENTRANCY_GUARD.with(|guard| {
                guard.borrow_mut().remove(&(event as u32 as u64, record.rid));
            });
        });

        let mut changed = false;
        let snapshot = self.entries.load();
        for entry in snapshot.iter() {
            if distributed {
                match (run_mode, entry.hook.distributed_mode()) {
                    (RunMode::Default, DistributedMode::TargetNodeOnly) => continue,
                    (RunMode::RunningDistributed, DistributedMode::SourceNodeOnly) => continue,
                    _ => {}
                }
            }
            let result = entry.hook.on_event(event, record);
            if result.short_circuits() {
                return result;
            }
            if matches!(result, HookResult::RecordChanged) {
                changed = true;
            }
        }
        if changed {
            HookResult::RecordChanged
        } else {
            HookResult::RecordNotChanged
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::record::{Record, RecordVersion};

    struct CountingHook {
        id: u64,
    }

    impl Hook for CountingHook {
        fn identity(&self) -> u64 {
            self.id
        }
        fn on_event(&self, _event: HookEvent, _record: &mut Record) -> HookResult {
            HookResult::RecordChanged
        }
    }

    struct SkipIoHook;

    impl Hook for SkipIoHook {
        fn identity(&self) -> u64 {
            99
        }
        fn on_event(&self, _event: HookEvent, _record: &mut Record) -> HookResult {
            HookResult::SkipIo
        }
    }

    fn sample_record() -> Record {
        Record::loaded(
            Rid::new(9, 1),
            RecordVersion::Tracked(1),
            1,
            b"{}".to_vec(),
        )
    }

    #[test]
    fn dispatch_is_stable_by_position() {
        let registry = HookRegistry::new();
        registry.register(Arc::new(CountingHook { id: 1 }), HookPosition::Last);
        registry.register(Arc::new(CountingHook { id: 2 }), HookPosition::First);
        let result = registry.callback_hooks(
            HookEvent::BeforeRead,
            &mut sample_record(),
            false,
            RunMode::Default,
        );
        assert!(matches!(result, HookResult::RecordChanged));
    }

    #[test]
    fn skip_io_short_circuits() {
        let registry = HookRegistry::new();
        registry.register(Arc::new(SkipIoHook), HookPosition::Regular);
        registry.register(Arc::new(CountingHook { id: 1 }), HookPosition::Last);
        let result = registry.callback_hooks(
            HookEvent::BeforeUpdate,
            &mut sample_record(),
            false,
            RunMode::Default,
        );
        assert!(matches!(result, HookResult::SkipIo));
    }

    #[test]
    fn reentrancy_guard_blocks_recursive_call_for_same_record() {
        struct ReentrantHook {
            registry_ptr: *const HookRegistry,
        }
        // Safety: only used within the single-threaded test body.
        unsafe impl Send for ReentrantHook {}
        unsafe impl Sync for ReentrantHook {}
        impl Hook for ReentrantHook {
            fn identity(&self) -> u64 {
                7
            }
            fn on_event(&self, event: HookEvent, record: &mut Record) -> HookResult {
                let registry = unsafe { &*self.registry_ptr };
                let inner = registry.callback_hooks(event, record, false, RunMode::Default);
                assert!(matches!(inner, HookResult::RecordNotChanged));
                HookResult::RecordChanged
            }
        }

        let registry = HookRegistry::new();
        registry.register(
            Arc::new(ReentrantHook {
                registry_ptr: &registry as *const HookRegistry,
            }),
            HookPosition::Regular,
        );
        let result = registry.callback_hooks(
            HookEvent::BeforeRead,
            &mut sample_record(),
            false,
            RunMode::Default,
        );
        assert!(matches!(result, HookResult::RecordChanged));
    }
}

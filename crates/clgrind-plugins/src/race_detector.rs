//! Data-race detection
//!
//! Each byte of shared memory keeps a [`ByteRecord`]: the last store and up
//! to two loads since the last synchronization point. A new access is tested
//! against the record with [`races`] before it is inserted.
//!
//! Records live at two scopes:
//!
//! ```text
//!   work-group table            kernel table (global memory only)
//!   ┌──────────────────┐ merge  ┌──────────────────────────┐
//!   │ local + global   │ ─────► │ ShadowMemory<ByteRecord> │
//!   │ since last fence │        │ conflicts across groups  │
//!   └──────────────────┘        └──────────────────────────┘
//! ```
//!
//! A local fence drops the group's local records. A global fence, and the
//! end of the group, merge its global records into the kernel table and
//! drop them. Races are collected per synchronization interval and reported
//! once per (instruction pair, accessor), at the lowest racing address.

use crate::shadow::{Location, ShadowMemory};
use clgrind_core::ir::{AddressSpace, InstructionRef};
use clgrind_core::{
    Allocation, AsyncCopy, AtomicOp, Capabilities, Diagnostic, DiagnosticKind, DiagnosticSink, Entity, EntityCoords,
    FenceFlags, KernelInvocation, LaunchConfig, Memory, Plugin, Size3, WorkGroup,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;

// ================================================================================================
// Records
// ================================================================================================

/// Who performed an access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Accessor {
    /// Work-item, by linear global index
    Item(usize),
    /// Work-group, by linear group index
    Group(usize),
}

/// One access to one byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Access {
    pub accessor: Accessor,
    /// Group index of the accessor
    pub group: usize,
    pub store: bool,
    pub atomic: bool,
    /// Byte written by a non-atomic store
    pub value: Option<u8>,
    pub instruction: Option<InstructionRef>,
}

/// Accesses to one byte since the last synchronization point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ByteRecord {
    pub store: Option<Access>,
    pub loads: [Option<Access>; 2],
}

impl ByteRecord {
    /// Every recorded access.
    pub fn accesses(&self) -> impl Iterator<Item = &Access> {
        self.store.iter().chain(self.loads.iter().flatten())
    }

    /// Record `access`. A store supersedes everything before it; loads keep
    /// one slot per accessor, reusing the last slot when both are taken.
    pub fn insert(&mut self, access: Access) {
        if access.store {
            self.store = Some(access);
            self.loads = [None; 2];
            return;
        }
        let slot = self
            .loads
            .iter()
            .position(|l| l.is_some_and(|l| l.accessor == access.accessor))
            .or_else(|| self.loads.iter().position(Option::is_none))
            .unwrap_or(1);
        self.loads[slot] = Some(access);
    }
}

/// Whether two accesses to the same byte conflict.
///
/// Accesses by the same accessor never race, and neither do two atomics. A
/// load races with a store. Two stores race when they write different bytes,
/// or on any write when same-value writes are not considered safe.
pub fn races(a: Option<&Access>, b: Option<&Access>, uniform_writes_safe: bool) -> bool {
    let (Some(a), Some(b)) = (a, b) else {
        return false;
    };
    if a.accessor == b.accessor || (a.atomic && b.atomic) {
        return false;
    }
    match (a.store, b.store) {
        (false, false) => false,
        (true, true) => a.value != b.value || !uniform_writes_safe,
        _ => true,
    }
}

// ================================================================================================
// Per-group state
// ================================================================================================

/// A detected race, identified by its instruction pair and second accessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct RaceKey {
    first: Option<InstructionRef>,
    second: Option<InstructionRef>,
    accessor: Accessor,
}

#[derive(Debug, Clone, Copy)]
struct Race {
    space: AddressSpace,
    address: u64,
    write_write: bool,
}

#[derive(Debug, Default)]
struct GroupRecords {
    table: HashMap<Location, (AddressSpace, ByteRecord)>,
    races: HashMap<RaceKey, Race>,
    /// Copy being performed by the group
    copy: Option<InstructionRef>,
}

fn note_race(races: &mut HashMap<RaceKey, Race>, first: &Access, second: &Access, space: AddressSpace, address: u64) {
    let key = RaceKey {
        first: first.instruction,
        second: second.instruction,
        accessor: second.accessor,
    };
    let race = Race {
        space,
        address,
        write_write: first.store && second.store,
    };
    races
        .entry(key)
        .and_modify(|r| {
            if address < r.address {
                *r = race;
            }
        })
        .or_insert(race);
}

// ================================================================================================
// Plugin
// ================================================================================================

/// Reports unsynchronized conflicting accesses to local and global memory.
pub struct RaceDetector {
    sink: DiagnosticSink,
    uniform_writes_safe: bool,
    global: ShadowMemory<ByteRecord>,
    launch: RwLock<Option<LaunchConfig>>,
    workers: RwLock<Vec<Mutex<GroupRecords>>>,
}

impl RaceDetector {
    pub fn new(sink: DiagnosticSink, uniform_writes_safe: bool) -> Self {
        Self {
            sink,
            uniform_writes_safe,
            global: ShadowMemory::new(),
            launch: RwLock::new(None),
            workers: RwLock::new(Vec::new()),
        }
    }

    pub fn uniform_writes_safe(&self) -> bool {
        self.uniform_writes_safe
    }

    fn with_worker<R>(&self, worker: usize, f: impl FnOnce(&mut GroupRecords) -> R) -> Option<R> {
        let workers = self.workers.read();
        let mut records = workers.get(worker)?.lock();
        Some(f(&mut records))
    }

    fn register(&self, entity: Entity<'_>, memory: &Memory, address: u64, data: Access, bytes: Option<&[u8]>, size: u64) {
        let space = memory.space();
        if space == AddressSpace::Private {
            return;
        }
        let start = Location::of(memory, address);
        let uniform_writes_safe = self.uniform_writes_safe;

        self.with_worker(entity.worker(), |records| {
            let access_instruction = match entity {
                Entity::WorkItem(item) => item.current_instruction(),
                Entity::WorkGroup(_) => records.copy,
            };
            for i in 0..size {
                let access = Access {
                    value: if data.store && !data.atomic {
                        bytes.and_then(|b| b.get(i as usize).copied())
                    } else {
                        None
                    },
                    instruction: access_instruction,
                    ..data
                };
                let at = start.advance(i);
                let (_, record) = records.table.entry(at).or_insert((space, ByteRecord::default()));

                let conflicts: Vec<Access> = record
                    .accesses()
                    .filter(|prior| races(Some(*prior), Some(&access), uniform_writes_safe))
                    .copied()
                    .collect();
                record.insert(access);
                for prior in &conflicts {
                    note_race(&mut records.races, prior, &access, space, at.address);
                }
            }
        });
    }

    fn access(entity: Entity<'_>, store: bool, atomic: bool) -> Access {
        let accessor = match entity {
            Entity::WorkItem(item) => Accessor::Item(item.global_index()),
            Entity::WorkGroup(group) => Accessor::Group(group.group_index()),
        };
        Access {
            accessor,
            group: entity.group_index(),
            store,
            atomic,
            value: None,
            instruction: None,
        }
    }

    /// Merge the group's global records into the kernel table, testing them
    /// against the accesses of other groups.
    fn merge_global(&self, records: &mut GroupRecords) {
        let uniform_writes_safe = self.uniform_writes_safe;
        let mut merged = Vec::new();
        for (at, (space, record)) in &records.table {
            if *space != AddressSpace::Global {
                continue;
            }
            self.global.update_at(*at, 1, |_, kernel| {
                for access in record.accesses() {
                    for prior in kernel.accesses() {
                        if prior.group != access.group && races(Some(prior), Some(access), uniform_writes_safe) {
                            merged.push((*prior, *access, at.address));
                        }
                    }
                }
                if let Some(store) = record.store {
                    kernel.insert(store);
                }
                for load in record.loads.iter().flatten() {
                    kernel.insert(*load);
                }
            });
        }
        for (prior, access, address) in merged {
            note_race(&mut records.races, &prior, &access, AddressSpace::Global, address);
        }
        records.table.retain(|_, (space, _)| *space != AddressSpace::Global);
    }

    fn coords(launch: &LaunchConfig, accessor: Accessor) -> EntityCoords {
        match accessor {
            Accessor::Item(index) => {
                let relative = Size3::unflatten(index, launch.global_size);
                let mut global = Size3::ZERO;
                let mut local = Size3::ZERO;
                let mut group = Size3::ZERO;
                for dim in 0..3 {
                    local[dim] = relative[dim] % launch.local_size[dim];
                    group[dim] = relative[dim] / launch.local_size[dim];
                    global[dim] = relative[dim] + launch.global_offset[dim];
                }
                EntityCoords::WorkItem { global, local, group }
            }
            Accessor::Group(index) => EntityCoords::WorkGroup {
                group: Size3::unflatten(index, launch.num_groups()),
            },
        }
    }

    fn flush(&self, records: &mut GroupRecords) {
        if records.races.is_empty() {
            return;
        }
        let launch = *self.launch.read();
        let mut races: Vec<(RaceKey, Race)> = records.races.drain().collect();
        races.sort_by_key(|(_, race)| race.address);

        for (key, race) in races {
            let kind = if race.write_write { "Write-write" } else { "Read-write" };
            let mut diagnostic = Diagnostic::error(
                DiagnosticKind::DataRace,
                format!("{kind} data race at {} memory address {:#x}", race.space, race.address),
            );
            if let Some(launch) = &launch {
                diagnostic = diagnostic.with_entity(Self::coords(launch, key.accessor));
            }
            if let Some(second) = key.second {
                diagnostic = diagnostic.at(second, None);
            }
            if let Some(first) = key.first {
                diagnostic = diagnostic.with_related(first);
            }
            tracing::debug!(address = race.address, space = %race.space, "data_race");
            self.sink.log(diagnostic);
        }
    }
}

impl std::fmt::Debug for RaceDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaceDetector")
            .field("uniform_writes_safe", &self.uniform_writes_safe)
            .field("global", &self.global)
            .finish_non_exhaustive()
    }
}

impl Plugin for RaceDetector {
    fn name(&self) -> &str {
        "race-detector"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::KERNEL | Capabilities::WORK_GROUP | Capabilities::MEMORY | Capabilities::ASYNC_COPY
    }

    fn kernel_begin(&self, invocation: &KernelInvocation<'_>) {
        *self.launch.write() = Some(*invocation.launch());
        let mut workers = self.workers.write();
        workers.clear();
        workers.resize_with(invocation.num_workers().max(1), Mutex::default);
        self.global.reset();
    }

    fn kernel_end(&self, _invocation: &KernelInvocation<'_>) {
        self.workers.write().clear();
        self.global.reset();
        *self.launch.write() = None;
    }

    fn work_group_begin(&self, group: &WorkGroup) {
        self.with_worker(group.worker(), |records| *records = GroupRecords::default());
    }

    fn work_group_barrier(&self, group: &WorkGroup, flags: FenceFlags) {
        self.with_worker(group.worker(), |records| {
            if flags.contains(FenceFlags::LOCAL) {
                records.table.retain(|_, (space, _)| *space != AddressSpace::Local);
            }
            if flags.contains(FenceFlags::GLOBAL) {
                self.merge_global(records);
            }
            self.flush(records);
        });
    }

    fn work_group_complete(&self, group: &WorkGroup) {
        self.with_worker(group.worker(), |records| {
            self.merge_global(records);
            records.table.clear();
            records.copy = None;
            self.flush(records);
        });
    }

    fn work_group_async_copy(&self, group: &WorkGroup, copy: &AsyncCopy) {
        self.with_worker(group.worker(), |records| records.copy = Some(copy.instruction));
    }

    fn memory_allocated(&self, allocation: &Allocation<'_>) {
        if allocation.memory.space() == AddressSpace::Global {
            self.global
                .allocate(allocation.memory, allocation.address, allocation.size, ByteRecord::default());
        }
    }

    fn memory_deallocated(&self, memory: &Memory, address: u64, _owner: Option<Entity<'_>>) {
        if memory.space() == AddressSpace::Global {
            self.global.release(memory, address);
        }
    }

    fn memory_load(&self, entity: Entity<'_>, memory: &Memory, address: u64, size: u64) {
        self.register(entity, memory, address, Self::access(entity, false, false), None, size);
    }

    fn memory_store(&self, entity: Entity<'_>, memory: &Memory, address: u64, data: &[u8]) {
        let access = Self::access(entity, true, false);
        self.register(entity, memory, address, access, Some(data), data.len() as u64);
    }

    fn memory_atomic_load(&self, entity: Entity<'_>, memory: &Memory, _op: AtomicOp, address: u64, size: u64) {
        self.register(entity, memory, address, Self::access(entity, false, true), None, size);
    }

    fn memory_atomic_store(&self, entity: Entity<'_>, memory: &Memory, _op: AtomicOp, address: u64, size: u64) {
        self.register(entity, memory, address, Self::access(entity, true, true), None, size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn access(item: usize, store: bool, atomic: bool, value: Option<u8>) -> Access {
        Access {
            accessor: Accessor::Item(item),
            group: 0,
            store,
            atomic,
            value,
            instruction: None,
        }
    }

    #[test]
    fn test_predicate_table() {
        let load_a = access(0, false, false, None);
        let load_b = access(1, false, false, None);
        let store_a = access(0, true, false, Some(1));
        let store_b = access(1, true, false, Some(1));
        let store_b2 = access(1, true, false, Some(2));

        assert!(!races(None, Some(&store_b), true));
        assert!(!races(Some(&store_a), Some(&load_a), true));
        assert!(!races(Some(&load_a), Some(&load_b), true));
        assert!(races(Some(&store_a), Some(&load_b), true));
        assert!(races(Some(&load_a), Some(&store_b), true));
        assert!(races(Some(&store_a), Some(&store_b2), true));
        assert!(!races(Some(&store_a), Some(&store_b), true));
        assert!(races(Some(&store_a), Some(&store_b), false));
    }

    #[test]
    fn test_atomics_only_race_with_plain_accesses() {
        let atomic_a = access(0, true, true, None);
        let atomic_b = access(1, true, true, None);
        let plain_b = access(1, false, false, None);
        assert!(!races(Some(&atomic_a), Some(&atomic_b), false));
        assert!(races(Some(&atomic_a), Some(&plain_b), true));
    }

    #[test]
    fn test_record_keeps_loads_per_accessor() {
        let mut record = ByteRecord::default();
        record.insert(access(0, false, false, None));
        record.insert(access(0, false, false, None));
        record.insert(access(1, false, false, None));
        assert_eq!(record.accesses().count(), 2);

        record.insert(access(2, false, false, None));
        assert_eq!(record.loads[1].map(|l| l.accessor), Some(Accessor::Item(2)));

        record.insert(access(3, true, false, Some(0)));
        assert_eq!(record.accesses().count(), 1);
    }

    #[test]
    fn test_coords_rebuilt_from_launch() {
        let launch = LaunchConfig::new_1d(16, 4).with_offset(Size3::new(100, 0, 0));
        let coords = RaceDetector::coords(&launch, Accessor::Item(9));
        assert_eq!(
            coords,
            EntityCoords::WorkItem {
                global: Size3::new(109, 0, 0),
                local: Size3::new(1, 0, 0),
                group: Size3::new(2, 0, 0),
            }
        );
    }

    proptest! {
        #[test]
        fn prop_predicate_is_symmetric(
            a_item in 0usize..3, b_item in 0usize..3,
            a_store: bool, b_store: bool,
            a_atomic: bool, b_atomic: bool,
            a_value in 0u8..2, b_value in 0u8..2,
            uniform: bool,
        ) {
            let a = access(a_item, a_store, a_atomic, Some(a_value));
            let b = access(b_item, b_store, b_atomic, Some(b_value));
            prop_assert_eq!(races(Some(&a), Some(&b), uniform), races(Some(&b), Some(&a), uniform));
        }
    }
}

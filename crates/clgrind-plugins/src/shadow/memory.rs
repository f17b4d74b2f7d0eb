//! Byte-granular metadata mirroring simulator memories.
//!
//! Every tracked buffer is registered with the value its bytes start with.
//! Storage is materialized lazily in fixed-size chunks on the first write, so
//! a buffer nobody touches costs one map entry. Chunks live in a
//! [`ShardedMap`] keyed by address, which lets worker threads update the
//! shadow of global memory concurrently with per-bucket locking.

use clgrind_core::memory::ShardedMap;
use clgrind_core::Memory;

/// Bytes per materialized chunk.
pub const CHUNK_SIZE: u64 = 64;

/// A byte address resolved against the buffer that contains it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Location {
    /// [`Memory::id`] of the owning memory
    pub memory: u64,
    /// Address of the buffer's first byte
    pub base: u64,
    pub address: u64,
}

impl Location {
    pub fn of(memory: &Memory, address: u64) -> Self {
        Self {
            memory: memory.id(),
            base: memory.make_address(memory.extract_buffer(address), 0),
            address,
        }
    }

    pub fn offset(&self) -> u64 {
        self.address - self.base
    }

    /// The location `bytes` further into the same buffer.
    pub fn advance(self, bytes: u64) -> Self {
        Self {
            address: self.address + bytes,
            ..self
        }
    }
}

#[derive(Debug, Clone)]
struct Tracked<T> {
    size: u64,
    fill: T,
}

/// One chunk-aligned piece of an access.
#[derive(Debug, Clone, Copy)]
struct Span {
    /// Address of the chunk's first byte
    chunk: u64,
    /// Range within the chunk
    from: usize,
    to: usize,
    /// Bytes of the access preceding this span
    done: usize,
}

fn spans(at: Location, len: u64) -> impl Iterator<Item = Span> {
    let start = at.offset();
    let end = start + len;
    let mut offset = start;
    std::iter::from_fn(move || {
        if offset >= end {
            return None;
        }
        let chunk = offset - offset % CHUNK_SIZE;
        let span = Span {
            chunk: at.base + chunk,
            from: (offset - chunk) as usize,
            to: (end - chunk).min(CHUNK_SIZE) as usize,
            done: (offset - start) as usize,
        };
        offset = chunk + span.to as u64;
        Some(span)
    })
}

/// Metadata of type `T` for every byte of the registered buffers.
pub struct ShadowMemory<T> {
    buffers: ShardedMap<(u64, u64), Tracked<T>>,
    chunks: ShardedMap<(u64, u64), Box<[T]>>,
}

impl<T: Clone> ShadowMemory<T> {
    pub fn new() -> Self {
        Self {
            buffers: ShardedMap::default(),
            chunks: ShardedMap::default(),
        }
    }

    /// Start tracking the buffer at `address` with every byte set to `fill`.
    pub fn allocate(&self, memory: &Memory, address: u64, size: u64, fill: T) {
        let at = Location::of(memory, address);
        self.drop_chunks(at.memory, at.base, size.max(1));
        self.buffers.shard(&(at.memory, at.base)).insert((at.memory, at.base), Tracked { size, fill });
    }

    /// Stop tracking the buffer containing `address`.
    pub fn release(&self, memory: &Memory, address: u64) {
        let at = Location::of(memory, address);
        let removed = self.buffers.shard(&(at.memory, at.base)).remove(&(at.memory, at.base));
        if let Some(tracked) = removed {
            self.drop_chunks(at.memory, at.base, tracked.size.max(1));
        }
    }

    /// Forget every buffer of one memory, e.g. when a work-item's private
    /// memory goes away.
    pub fn release_memory(&self, memory: u64) {
        self.buffers.retain(|key, _| key.0 != memory);
        self.chunks.retain(|key, _| key.0 != memory);
    }

    /// Return every buffer of one memory to its allocation-time fill.
    pub fn reset_memory(&self, memory: u64) {
        self.chunks.retain(|key, _| key.0 != memory);
    }

    /// Return every tracked byte to its allocation-time fill.
    pub fn reset(&self) {
        self.chunks.clear();
    }

    pub fn is_tracked(&self, memory: &Memory, address: u64) -> bool {
        let at = Location::of(memory, address);
        self.buffers.shard(&(at.memory, at.base)).contains_key(&(at.memory, at.base))
    }

    /// Number of tracked buffers.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    fn drop_chunks(&self, memory: u64, base: u64, size: u64) {
        let mut chunk = 0;
        while chunk < size {
            let key = (memory, base + chunk);
            self.chunks.shard(&key).remove(&key);
            chunk += CHUNK_SIZE;
        }
    }

    /// Fill value of the buffer holding `len` bytes at `at`, or `None` when
    /// the range is not inside a tracked buffer.
    fn fill_for(&self, at: Location, len: u64) -> Option<T> {
        let key = (at.memory, at.base);
        let buffers = self.buffers.shard(&key);
        let tracked = buffers.get(&key)?;
        match at.offset().checked_add(len) {
            Some(end) if end <= tracked.size => Some(tracked.fill.clone()),
            _ => None,
        }
    }

    /// Metadata of `len` bytes at `at`.
    pub fn read_at(&self, at: Location, len: u64) -> Option<Vec<T>> {
        let fill = self.fill_for(at, len)?;
        let mut out = vec![fill; len as usize];
        for span in spans(at, len) {
            let key = (at.memory, span.chunk);
            if let Some(chunk) = self.chunks.shard(&key).get(&key) {
                out[span.done..span.done + (span.to - span.from)].clone_from_slice(&chunk[span.from..span.to]);
            }
        }
        Some(out)
    }

    pub fn read(&self, memory: &Memory, address: u64, len: u64) -> Option<Vec<T>> {
        self.read_at(Location::of(memory, address), len)
    }

    /// Visit the metadata of `len` bytes at `at` in address order. Returns
    /// false when the range is not tracked.
    pub fn update_at(&self, at: Location, len: u64, mut f: impl FnMut(Location, &mut T)) -> bool {
        let Some(fill) = self.fill_for(at, len) else {
            return false;
        };
        for span in spans(at, len) {
            let key = (at.memory, span.chunk);
            self.chunks.with_entry(
                key,
                || vec![fill.clone(); CHUNK_SIZE as usize].into_boxed_slice(),
                |chunk| {
                    for (i, cell) in chunk[span.from..span.to].iter_mut().enumerate() {
                        f(at.advance((span.done + i) as u64), cell);
                    }
                },
            );
        }
        true
    }

    pub fn update(&self, memory: &Memory, address: u64, len: u64, f: impl FnMut(Location, &mut T)) -> bool {
        self.update_at(Location::of(memory, address), len, f)
    }

    /// Overwrite the metadata at `address` with `values`.
    pub fn write(&self, memory: &Memory, address: u64, values: &[T]) -> bool {
        let mut next = values.iter();
        self.update(memory, address, values.len() as u64, |_, cell| {
            if let Some(value) = next.next() {
                *cell = value.clone();
            }
        })
    }

    /// Set `len` bytes at `address` to `value`.
    pub fn fill(&self, memory: &Memory, address: u64, len: u64, value: T) -> bool {
        self.update(memory, address, len, |_, cell| *cell = value.clone())
    }
}

impl<T: Clone> Default for ShadowMemory<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for ShadowMemory<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShadowMemory")
            .field("chunks", &self.chunks.len())
            .finish_non_exhaustive()
    }
}

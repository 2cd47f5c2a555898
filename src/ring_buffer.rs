//! Lock-free single-producer single-consumer ring buffer.
//!
//! A [`RingBuffer`] holds `size` elements of `element_size` bytes each, where
//! `size` is a power of two. The read and write indices are free-running
//! counters that are masked on access, so `write_index - read_index` is always
//! the number of elements available for reading.
//!
//! The buffer is [`split`](RingBuffer::split) into a [`RingProducer`] and a
//! [`RingConsumer`] which may live on different threads. Neither half ever
//! blocks or allocates, which makes them usable from the audio callback:
//!
//! - The producer owns the free region `[write_index, read_index + size)`
//! - The consumer owns the filled region `[read_index, write_index)`
//! - Publishing an index uses `Release`, observing the other side's index
//!   uses `Acquire`, so element bytes are visible before the index moves
//!
//! Besides copying [`write`](RingProducer::write)/[`read`](RingConsumer::read)
//! calls, both halves expose up to two contiguous regions (to straddle the
//! wraparound point) for zero-copy access, committed afterwards with
//! `advance_write_index`/`advance_read_index`.

use crate::error::{PetalMixError, Result};
use std::cell::UnsafeCell;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Size in bytes of one 32-bit float sample.
pub const SAMPLE_SIZE: usize = std::mem::size_of::<f32>();

struct Shared {
    buffer: Box<[UnsafeCell<u8>]>,
    element_size: usize,
    size: usize,
    mask: usize,
    write_index: AtomicUsize,
    read_index: AtomicUsize,
}

// SAFETY: the byte storage is only touched through the split halves. The
// producer writes exclusively to elements the consumer cannot see yet and the
// consumer reads exclusively from elements the producer has published, with
// Acquire/Release on the indices ordering the byte accesses.
unsafe impl Send for Shared {}
unsafe impl Sync for Shared {}

impl Shared {
    fn new(element_size: usize, size: usize) -> Result<Self> {
        if element_size == 0 {
            return Err(PetalMixError::RingBuffer(
                "element size must be greater than zero".into(),
            ));
        }
        if !size.is_power_of_two() {
            return Err(PetalMixError::RingBuffer(format!(
                "size must be a power of two, got {}",
                size
            )));
        }
        let bytes = element_size.checked_mul(size).ok_or_else(|| {
            PetalMixError::RingBuffer(format!(
                "{} elements of {} bytes exceed the address space",
                size, element_size
            ))
        })?;

        Ok(Self {
            buffer: (0..bytes).map(|_| UnsafeCell::new(0u8)).collect(),
            element_size,
            size,
            mask: size - 1,
            write_index: AtomicUsize::new(0),
            read_index: AtomicUsize::new(0),
        })
    }

    fn read_available(&self) -> usize {
        let write = self.write_index.load(Ordering::Acquire);
        let read = self.read_index.load(Ordering::Acquire);
        write.wrapping_sub(read)
    }

    fn write_available(&self) -> usize {
        self.size - self.read_available()
    }

    /// Byte spans covering `count` elements starting at the (unmasked) `index`.
    ///
    /// Returns `(first_ptr, first_len, second_ptr, second_len)` in bytes. The
    /// second span is empty unless the range wraps around the end.
    fn spans(&self, index: usize, count: usize) -> (*mut u8, usize, *mut u8, usize) {
        debug_assert!(count <= self.size);
        let start = index & self.mask;
        let first = count.min(self.size - start);
        let second = count - first;
        // UnsafeCell<u8> has the same layout as u8.
        let base = self.buffer.as_ptr() as *mut u8;
        (
            base.wrapping_add(start * self.element_size),
            first * self.element_size,
            base,
            second * self.element_size,
        )
    }
}

/// Owning handle of a ring buffer before it is split.
pub struct RingBuffer {
    shared: Arc<Shared>,
}

impl RingBuffer {
    /// Create a ring buffer of `size` elements with `element_size` bytes each.
    ///
    /// Fails if `size` is not a power of two or `element_size` is zero.
    pub fn new(element_size: usize, size: usize) -> Result<Self> {
        Ok(Self {
            shared: Arc::new(Shared::new(element_size, size)?),
        })
    }

    /// Create a ring buffer whose elements are frames of `channels` float samples.
    pub fn for_frames(channels: usize, size: usize) -> Result<Self> {
        Self::new(channels * SAMPLE_SIZE, size)
    }

    pub fn element_size(&self) -> usize {
        self.shared.element_size
    }

    pub fn size(&self) -> usize {
        self.shared.size
    }

    pub fn read_available(&self) -> usize {
        self.shared.read_available()
    }

    pub fn write_available(&self) -> usize {
        self.shared.write_available()
    }

    /// Reset both indices to zero, discarding any buffered elements.
    pub fn flush(&mut self) {
        // &mut self and the absence of split halves rule out concurrent access.
        self.shared.write_index.store(0, Ordering::Relaxed);
        self.shared.read_index.store(0, Ordering::Relaxed);
    }

    /// Split into the producer and consumer halves.
    pub fn split(self) -> (RingProducer, RingConsumer) {
        let producer = RingProducer {
            shared: Arc::clone(&self.shared),
        };
        let consumer = RingConsumer {
            shared: self.shared,
        };
        (producer, consumer)
    }

    /// Join two halves of the same ring buffer back together.
    ///
    /// Returns the halves unchanged if they belong to different buffers.
    pub fn reunite(
        producer: RingProducer,
        consumer: RingConsumer,
    ) -> std::result::Result<Self, (RingProducer, RingConsumer)> {
        if !Arc::ptr_eq(&producer.shared, &consumer.shared) {
            return Err((producer, consumer));
        }
        drop(producer);
        Ok(Self {
            shared: consumer.shared,
        })
    }
}

impl fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBuffer")
            .field("element_size", &self.element_size())
            .field("size", &self.size())
            .field("read_available", &self.read_available())
            .finish()
    }
}

/// Writable regions claimed by [`RingProducer::get_write_regions`].
pub struct WriteRegions<'a> {
    /// Number of whole elements covered by both regions together.
    pub elements: usize,
    pub first: &'a mut [u8],
    pub second: &'a mut [u8],
}

/// Readable regions claimed by [`RingConsumer::get_read_regions`].
pub struct ReadRegions<'a> {
    /// Number of whole elements covered by both regions together.
    pub elements: usize,
    pub first: &'a [u8],
    pub second: &'a [u8],
}

/// Writing half of a [`RingBuffer`].
pub struct RingProducer {
    shared: Arc<Shared>,
}

impl RingProducer {
    pub fn element_size(&self) -> usize {
        self.shared.element_size
    }

    pub fn size(&self) -> usize {
        self.shared.size
    }

    pub fn read_available(&self) -> usize {
        self.shared.read_available()
    }

    pub fn write_available(&self) -> usize {
        self.shared.write_available()
    }

    /// Claim up to `count` free elements without copying.
    ///
    /// The regions cover `min(count, write_available())` elements. Nothing is
    /// published until [`advance_write_index`](Self::advance_write_index).
    pub fn get_write_regions(&mut self, count: usize) -> WriteRegions<'_> {
        let elements = count.min(self.shared.write_available());
        let index = self.shared.write_index.load(Ordering::Relaxed);
        let (first_ptr, first_len, second_ptr, second_len) = self.shared.spans(index, elements);
        // SAFETY: the spans lie in the free region, which only the producer
        // touches, and they do not overlap each other. `&mut self` keeps the
        // borrow unique on this side.
        let (first, second) = unsafe {
            (
                std::slice::from_raw_parts_mut(first_ptr, first_len),
                std::slice::from_raw_parts_mut(second_ptr, second_len),
            )
        };
        WriteRegions {
            elements,
            first,
            second,
        }
    }

    /// Publish `count` elements previously filled through write regions.
    ///
    /// Clamped to the free space; returns the number of elements published.
    pub fn advance_write_index(&mut self, count: usize) -> usize {
        let count = count.min(self.shared.write_available());
        let index = self.shared.write_index.load(Ordering::Relaxed);
        self.shared
            .write_index
            .store(index.wrapping_add(count), Ordering::Release);
        count
    }

    /// Copy as many whole elements from `data` as fit.
    ///
    /// Returns the number of elements written, which may be less than
    /// `data.len() / element_size` when the buffer is nearly full.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let element_size = self.shared.element_size;
        let regions = self.get_write_regions(data.len() / element_size);
        let elements = regions.elements;
        let (head, tail) = data[..elements * element_size].split_at(regions.first.len());
        regions.first.copy_from_slice(head);
        regions.second.copy_from_slice(tail);
        self.advance_write_index(elements)
    }

    /// Write interleaved float frames; each element must hold whole samples.
    ///
    /// Returns the number of elements written. Nothing is written when the
    /// element size is not a multiple of [`SAMPLE_SIZE`].
    pub fn write_samples(&mut self, samples: &[f32]) -> usize {
        let Some(per_element) = samples_per_element(self.shared.element_size) else {
            return 0;
        };
        let regions = self.get_write_regions(samples.len() / per_element);
        let elements = regions.elements;
        let first_samples = regions.first.len() / SAMPLE_SIZE;
        let (head, tail) = samples[..elements * per_element].split_at(first_samples);
        encode_samples(regions.first, head);
        encode_samples(regions.second, tail);
        self.advance_write_index(elements)
    }

    /// A consumer for the same buffer, available only once the split-off
    /// consumer has been dropped.
    pub(crate) fn orphaned_consumer(&self) -> Option<RingConsumer> {
        (Arc::strong_count(&self.shared) == 1).then(|| RingConsumer {
            shared: Arc::clone(&self.shared),
        })
    }

    /// Whether the consumer half has been dropped.
    pub(crate) fn is_orphaned(&self) -> bool {
        Arc::strong_count(&self.shared) == 1
    }
}

impl fmt::Debug for RingProducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingProducer")
            .field("element_size", &self.element_size())
            .field("size", &self.size())
            .field("write_available", &self.write_available())
            .finish()
    }
}

/// Reading half of a [`RingBuffer`].
pub struct RingConsumer {
    shared: Arc<Shared>,
}

impl RingConsumer {
    pub fn element_size(&self) -> usize {
        self.shared.element_size
    }

    pub fn size(&self) -> usize {
        self.shared.size
    }

    pub fn read_available(&self) -> usize {
        self.shared.read_available()
    }

    pub fn write_available(&self) -> usize {
        self.shared.write_available()
    }

    /// Claim up to `count` filled elements without copying.
    pub fn get_read_regions(&mut self, count: usize) -> ReadRegions<'_> {
        let elements = count.min(self.shared.read_available());
        let index = self.shared.read_index.load(Ordering::Relaxed);
        let (first_ptr, first_len, second_ptr, second_len) = self.shared.spans(index, elements);
        // SAFETY: the spans lie in the filled region published by the producer
        // (observed with Acquire), which the producer no longer writes to.
        let (first, second) = unsafe {
            (
                std::slice::from_raw_parts(first_ptr as *const u8, first_len),
                std::slice::from_raw_parts(second_ptr as *const u8, second_len),
            )
        };
        ReadRegions {
            elements,
            first,
            second,
        }
    }

    /// Release `count` elements previously consumed through read regions.
    ///
    /// Clamped to the filled space; returns the number of elements released.
    pub fn advance_read_index(&mut self, count: usize) -> usize {
        let count = count.min(self.shared.read_available());
        let index = self.shared.read_index.load(Ordering::Relaxed);
        self.shared
            .read_index
            .store(index.wrapping_add(count), Ordering::Release);
        count
    }

    /// Copy as many whole elements into `data` as are available.
    ///
    /// Returns the number of elements read.
    pub fn read(&mut self, data: &mut [u8]) -> usize {
        let element_size = self.shared.element_size;
        let regions = self.get_read_regions(data.len() / element_size);
        let elements = regions.elements;
        let (head, tail) = data[..elements * element_size].split_at_mut(regions.first.len());
        head.copy_from_slice(regions.first);
        tail.copy_from_slice(regions.second);
        self.advance_read_index(elements)
    }

    /// Read interleaved float frames; each element must hold whole samples.
    ///
    /// Returns the number of elements read.
    pub fn read_samples(&mut self, samples: &mut [f32]) -> usize {
        let Some(per_element) = samples_per_element(self.shared.element_size) else {
            return 0;
        };
        let regions = self.get_read_regions(samples.len() / per_element);
        let elements = regions.elements;
        let (head, tail) =
            samples[..elements * per_element].split_at_mut(regions.first.len() / SAMPLE_SIZE);
        decode_samples(regions.first, head);
        decode_samples(regions.second, tail);
        self.advance_read_index(elements)
    }
}

impl fmt::Debug for RingConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingConsumer")
            .field("element_size", &self.element_size())
            .field("size", &self.size())
            .field("read_available", &self.read_available())
            .finish()
    }
}

fn samples_per_element(element_size: usize) -> Option<usize> {
    (element_size % SAMPLE_SIZE == 0).then_some(element_size / SAMPLE_SIZE)
}

fn encode_samples(dest: &mut [u8], samples: &[f32]) {
    for (bytes, sample) in dest.chunks_exact_mut(SAMPLE_SIZE).zip(samples) {
        bytes.copy_from_slice(&sample.to_ne_bytes());
    }
}

fn decode_samples(src: &[u8], samples: &mut [f32]) {
    for (sample, bytes) in samples.iter_mut().zip(src.chunks_exact(SAMPLE_SIZE)) {
        *sample = f32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    }
}

/// Read the `index`-th float sample of a byte region.
#[inline]
pub(crate) fn sample_at(bytes: &[u8], index: usize) -> f32 {
    let at = index * SAMPLE_SIZE;
    f32::from_ne_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

/// Store `value` as the `index`-th float sample of a byte region.
#[inline]
pub(crate) fn store_sample(bytes: &mut [u8], index: usize, value: f32) {
    let at = index * SAMPLE_SIZE;
    bytes[at..at + SAMPLE_SIZE].copy_from_slice(&value.to_ne_bytes());
}

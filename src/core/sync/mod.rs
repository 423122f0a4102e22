/*!
 * Synchronization Primitives
 *
 * Lock-free exchange between one writer thread and its readers.
 *
 * # Choosing a Buffer
 *
 * - [`DoubleBuffer`]: any `T`, reader borrows the value in place and each
 *   committed value is handed out at most once
 * - [`OptimisticBuffer`]: `T: Copy`, readers copy out and may retry, any
 *   number of readers, the writer never waits
 *
 * Both assume exactly one writer, which [`DoubleBuffer::split`] and
 * [`OptimisticBuffer::split`] enforce through non-cloneable writer handles.
 */

// Atomics and scheduler hints come from loom when model checking, so every
// CAS loop below is explored by its scheduler
#[cfg(loom)]
pub(crate) use loom::{hint, sync::atomic, thread};
#[cfg(not(loom))]
pub(crate) use std::{hint, sync::atomic, thread};

pub(crate) mod backoff;
mod config;
pub mod lockfree;

pub use config::SpinConfig;
pub use lockfree::{
    DoubleBuffer, OptimisticBuffer, OptimisticReader, OptimisticWriter, ReadGuard, ReadLock,
    Reader, TaggedStack, WriteGuard, Writer,
};

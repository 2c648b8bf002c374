//! # inferq-core
//!
//! Platform substrate for the inferq probabilistic question-answering engine.
//!
//! This crate provides:
//! - **Quad helpers**: 4-lane f64 block primitives — IEEE-754 exponent
//!   extraction, exact power-of-two construction, gap-mask application,
//!   magnitude-ordered stable summation.
//! - **Aligned memory**: 64-byte-aligned zeroed slabs and a thread-safe
//!   freelist pool that recycles them for per-operation scratch.
//! - **Parallel execution**: a fixed worker pool that runs *split* subtasks
//!   over contiguous chunks of an index range, capturing worker panics and
//!   merging them at the join.
//! - **Bucket summation**: per-worker exponent-indexed buckets so that sums
//!   over values of wildly varying magnitude stay numerically stable.
//! - **SplitMix64**: a tiny deterministic RNG for harnesses and tests.
//!
//! Nothing in this crate knows about questions, targets or quizzes — it is
//! the numeric and concurrency floor the engine crate stands on.

pub mod arena;
pub mod atomic;
pub mod bucket;
pub mod parallel;
pub mod rng;
pub mod simd;

pub use arena::{AlignedBuf, MemPool, PooledBuf, SplitSlice};
pub use atomic::AtomicF64;
pub use bucket::{BucketSummator, BUCKET_COUNT};
pub use parallel::{PoolError, Split, WorkerPanic, WorkerPool, WorkerSlots};
pub use rng::SplitMix64;

//! Host-side parallel transforms over mirrored data
//!
//! Large slices are split into chunks of [`PARALLEL_CHUNK_SIZE`] elements that
//! run on rayon's global pool. Below [`PARALLEL_THRESHOLD`] elements the
//! transform runs on the calling thread, where the pool's overhead outweighs
//! the work. Either way every element is visited exactly once, in no
//! particular order, and the call returns when all elements are done.

use crate::buffer::Element;
use rayon::prelude::*;
use std::time::Instant;
use twinbuf_tracing::performance;

/// Elements handled per parallel task
pub const PARALLEL_CHUNK_SIZE: usize = 3072;

/// Minimum length at which work is spread over the pool
pub const PARALLEL_THRESHOLD: usize = 10_000;

/// Replace every element `x` of `data` with `f(x)`.
pub fn transform_in_place<T, F>(data: &mut [T], f: F)
where
    T: Element,
    F: Fn(T) -> T + Send + Sync,
{
    let start = Instant::now();
    if data.len() < PARALLEL_THRESHOLD {
        data.iter_mut().for_each(|x| *x = f(*x));
    } else {
        data.par_iter_mut()
            .with_min_len(PARALLEL_CHUNK_SIZE)
            .for_each(|x| *x = f(*x));
    }
    performance::record_throughput("host_transform", data.len(), start.elapsed().as_micros() as u64);
}

/// Overwrite every element of `data` with a freshly generated value.
pub fn generate_in_place<T, F>(data: &mut [T], generator: F)
where
    T: Element,
    F: Fn() -> T + Send + Sync,
{
    let start = Instant::now();
    if data.len() < PARALLEL_THRESHOLD {
        data.iter_mut().for_each(|x| *x = generator());
    } else {
        data.par_iter_mut()
            .with_min_len(PARALLEL_CHUNK_SIZE)
            .for_each(|x| *x = generator());
    }
    performance::record_throughput("host_generate", data.len(), start.elapsed().as_micros() as u64);
}

//! Lock-free SPSC ring buffers for crossing the realtime boundary.
//!
//! Two rings exist per running engine:
//! - the **mic ring**: platform capture callback → processing queue
//! - the **render ring**: processing queue → platform output callback
//!
//! Both use `ringbuf::HeapRb<f32>`, whose `push_slice`/`pop_slice` are
//! wait-free and allocation-free on either side.

pub mod block;

use ringbuf::{traits::Split, HeapRb};

pub use block::{AudioBlock, BlockFormat, Layout, RenderFormat, SampleBuffer, SampleFormat};
pub use ringbuf::traits::{Consumer, Observer, Producer};

/// Producer half of an interleaved f32 sample ring.
pub type SampleProducer = ringbuf::HeapProd<f32>;

/// Consumer half of an interleaved f32 sample ring.
pub type SampleConsumer = ringbuf::HeapCons<f32>;

/// Create a matched producer/consumer pair holding `capacity` samples.
pub fn create_sample_ring(capacity: usize) -> (SampleProducer, SampleConsumer) {
    HeapRb::<f32>::new(capacity.max(1)).split()
}

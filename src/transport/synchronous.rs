//! Inline scheduling: each message is produced, offered to the flusher and,
//! if a batch comes back, written before the next message is produced.

use super::{send_all, PipelineOutput, TransportError, TransportPipeline};
use crate::flush::Flusher;
use crate::generator::{DataPoint, MessageGenerator};
use std::io::Write;
use std::time::Instant;

pub(super) fn run<W: Write>(
    pipeline: &TransportPipeline,
    generator: &mut MessageGenerator,
    count: usize,
    mut sink: W,
) -> Result<PipelineOutput, TransportError> {
    let mut flusher = Flusher::new(pipeline.policy);
    let mut produced = Vec::with_capacity(count);
    let mut writes = 0;

    for _ in 0..count {
        let message = generator.next_message();
        produced.push(DataPoint::now(message.as_bytes().to_vec()));
        if let Some(batch) = flusher.offer(message.into_bytes(), Instant::now()) {
            send_all(&mut sink, &batch.bytes)?;
            writes += 1;
        }
    }

    if let Some(batch) = flusher.finish() {
        send_all(&mut sink, &batch.bytes)?;
        writes += 1;
    }
    send_all(&mut sink, &pipeline.sentinel)?;

    Ok(PipelineOutput { produced, writes })
}

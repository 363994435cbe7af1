//! Worker-thread scheduling.
//!
//! The caller is the producer and blocks on a full queue. A scoped worker
//! thread owns the sink and the flusher; it waits for items with a very short
//! timeout so that an idle coalescing buffer still gets flushed once its
//! window expires.

use super::{send_all, PipelineOutput, QueueItem, TransportError, TransportPipeline};
use crate::defaults::QUEUE_POLL_TIMEOUT;
use crate::flush::Flusher;
use crate::generator::{DataPoint, MessageGenerator};
use crate::queue::{self, QueueConsumer, QueueProducer};
use std::io::Write;
use std::thread;
use std::time::Instant;
use tracing::debug;

pub(super) fn run<W: Write + Send>(
    pipeline: &TransportPipeline,
    generator: &mut MessageGenerator,
    count: usize,
    sink: W,
) -> Result<PipelineOutput, TransportError> {
    let (producer, consumer) = queue::bounded(pipeline.queue_capacity)?;
    let flusher = Flusher::new(pipeline.policy);
    let sentinel = pipeline.sentinel.as_slice();

    thread::scope(|scope| {
        let worker = thread::Builder::new()
            .name("flusher".to_string())
            .spawn_scoped(scope, move || flush_worker(consumer, flusher, sink, sentinel))?;

        let drained = produce(&producer, generator, count).and_then(|produced| {
            producer.join()?;
            Ok(produced)
        });
        let flushed = worker.join().map_err(|_| TransportError::WorkerPanicked)?;

        // A worker failure is the root cause of any producer-side disconnect.
        let writes = flushed?;
        Ok::<_, TransportError>(PipelineOutput {
            produced: drained?,
            writes,
        })
    })
}

fn produce(
    producer: &QueueProducer<QueueItem>,
    generator: &mut MessageGenerator,
    count: usize,
) -> Result<Vec<DataPoint>, TransportError> {
    let mut produced = Vec::with_capacity(count);
    for _ in 0..count {
        let message = generator.next_message();
        produced.push(DataPoint::now(message.as_bytes().to_vec()));
        producer.push(QueueItem::Data(message))?;
    }
    producer.push(QueueItem::Stop)?;
    Ok(produced)
}

fn flush_worker<W: Write>(
    consumer: QueueConsumer<QueueItem>,
    mut flusher: Flusher,
    mut sink: W,
    sentinel: &[u8],
) -> Result<usize, TransportError> {
    let mut writes = 0;
    loop {
        let batch = match consumer.pop_timeout(QUEUE_POLL_TIMEOUT)? {
            Some(QueueItem::Data(message)) => flusher.offer(message.into_bytes(), Instant::now()),
            Some(QueueItem::Stop) => {
                if let Some(batch) = flusher.finish() {
                    send_all(&mut sink, &batch.bytes)?;
                    writes += 1;
                    consumer.task_done(batch.messages);
                }
                send_all(&mut sink, sentinel)?;
                consumer.task_done(1);
                debug!("Flusher thread drained after {} writes", writes);
                return Ok(writes);
            }
            None => flusher.poll(Instant::now()),
        };

        if let Some(batch) = batch {
            send_all(&mut sink, &batch.bytes)?;
            writes += 1;
            consumer.task_done(batch.messages);
        }
    }
}

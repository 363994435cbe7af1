//! Cooperative scheduling on a single-threaded tokio event loop.
//!
//! The owning future produces; the flusher is a local task on the same
//! thread. Nothing is preempted: the producer yields only when the queue is
//! full, the flusher only when the queue is empty or the socket would block.

use super::{
    send_all_cooperative, PipelineOutput, QueueItem, TransportError, TransportPipeline,
};
use crate::flush::Flusher;
use crate::generator::{DataPoint, MessageGenerator};
use crate::queue::{self, QueueConsumer, QueueError, QueueProducer, TryPushError};
use std::io::Write;
use std::time::Instant;
use tokio::task::{self, LocalSet};
use tracing::debug;

pub(super) fn run<W: Write + 'static>(
    pipeline: &TransportPipeline,
    generator: &mut MessageGenerator,
    count: usize,
    sink: W,
) -> Result<PipelineOutput, TransportError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(TransportError::Runtime)?;
    let (producer, consumer) = queue::bounded(pipeline.queue_capacity)?;
    let flusher = Flusher::new(pipeline.policy);
    let sentinel = pipeline.sentinel.clone();

    let local = LocalSet::new();
    local.block_on(&runtime, async move {
        let flusher_task = task::spawn_local(flush_task(consumer, flusher, sink, sentinel));

        let drained = match produce(&producer, generator, count).await {
            Ok(produced) => wait_drained(&producer).await.map(|()| produced),
            Err(e) => Err(e),
        };

        // The flusher has acknowledged the stop item by now (or failed), so
        // awaiting it only collects its result.
        let flushed = flusher_task
            .await
            .map_err(|_| TransportError::WorkerPanicked)?;
        let writes = flushed?;
        Ok::<_, TransportError>(PipelineOutput {
            produced: drained?,
            writes,
        })
    })
}

async fn produce(
    producer: &QueueProducer<QueueItem>,
    generator: &mut MessageGenerator,
    count: usize,
) -> Result<Vec<DataPoint>, TransportError> {
    let mut produced = Vec::with_capacity(count);
    for _ in 0..count {
        let message = generator.next_message();
        produced.push(DataPoint::now(message.as_bytes().to_vec()));
        push(producer, QueueItem::Data(message)).await?;
    }
    push(producer, QueueItem::Stop).await?;
    Ok(produced)
}

async fn push(
    producer: &QueueProducer<QueueItem>,
    mut item: QueueItem,
) -> Result<(), TransportError> {
    loop {
        match producer.try_push(item) {
            Ok(()) => return Ok(()),
            Err(TryPushError::Full(rejected)) => {
                item = rejected;
                task::yield_now().await;
            }
            Err(TryPushError::Disconnected(_)) => {
                return Err(QueueError::Disconnected {
                    outstanding: producer.outstanding(),
                }
                .into())
            }
        }
    }
}

async fn wait_drained(producer: &QueueProducer<QueueItem>) -> Result<(), TransportError> {
    while !producer.is_drained()? {
        task::yield_now().await;
    }
    Ok(())
}

async fn flush_task<W: Write>(
    consumer: QueueConsumer<QueueItem>,
    mut flusher: Flusher,
    mut sink: W,
    sentinel: Vec<u8>,
) -> Result<usize, TransportError> {
    let mut writes = 0;
    loop {
        let batch = match consumer.try_pop()? {
            Some(QueueItem::Data(message)) => flusher.offer(message.into_bytes(), Instant::now()),
            Some(QueueItem::Stop) => {
                if let Some(batch) = flusher.finish() {
                    send_all_cooperative(&mut sink, &batch.bytes).await?;
                    writes += 1;
                    consumer.task_done(batch.messages);
                }
                send_all_cooperative(&mut sink, &sentinel).await?;
                consumer.task_done(1);
                debug!("Flusher task drained after {} writes", writes);
                return Ok(writes);
            }
            None => {
                let expired = flusher.poll(Instant::now());
                if expired.is_none() {
                    task::yield_now().await;
                }
                expired
            }
        };

        if let Some(batch) = batch {
            send_all_cooperative(&mut sink, &batch.bytes).await?;
            writes += 1;
            consumer.task_done(batch.messages);
        }
    }
}

//! Receiving and sending engines.

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::device::memory::{MemoryAccess, TileMemory};
use crate::device::router::{Packet, Port, PortError, ReceiverPort};
use crate::pool::TaskPool;

use super::{DmaCommand, DmaCore, DmaDirection, DmaError, DmaStats};

/// Network-to-memory engine. It is also the port the network writes into.
///
/// Dropping the engine only closes its command queue: the mover finishes
/// the commands already queued but nobody joins it. Call
/// [`shutdown`](Self::shutdown) to drain and join, as `Device::shutdown`
/// does for every tile.
pub struct ReceivingDma {
    core: Arc<DmaCore>,
    fifo: Arc<ReceiverPort>,
}

impl ReceivingDma {
    /// Create the engine and start its mover on `pool`.
    pub fn new(
        name: impl Into<String>,
        memory: Arc<TileMemory>,
        pool: &TaskPool,
        command_depth: usize,
        fifo_depth: usize,
    ) -> Result<Self, DmaError> {
        let core = Arc::new(DmaCore::new(
            name.into(),
            DmaDirection::In,
            memory,
            command_depth,
        ));
        let fifo = Arc::new(ReceiverPort::new(fifo_depth));

        let mover = {
            let core = core.clone();
            let fifo = fifo.clone();
            pool.submit(move || async move {
                let mut stats = DmaStats::default();
                while let Some(command) = core.commands.pop().await {
                    let span = command.span;
                    for i in 0..span.words {
                        let packet = match fifo.read().await {
                            Ok(packet) => packet,
                            Err(e) => {
                                log::error!("{}: input closed mid-transfer", core.name);
                                core.fail();
                                return Err(DmaError::from(e));
                            }
                        };
                        core.memory.write_u32(span.word_offset(i), packet.value);
                        stats.words += 1;
                    }
                    stats.commands += 1;
                    core.complete_one();
                }
                Ok(stats)
            })?
        };
        *core.mover.lock() = Some(mover);

        Ok(Self { core, fifo })
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Queue a receive command, waiting if the command queue is full.
    pub async fn push(&self, command: DmaCommand) -> Result<(), DmaError> {
        self.core.push(command).await
    }

    /// Wait until every queued command has completed.
    pub async fn wait(&self) -> Result<(), DmaError> {
        self.core.wait().await
    }

    /// Commands queued or in flight.
    pub fn outstanding(&self) -> usize {
        self.core.outstanding()
    }

    /// The input FIFO, for binding to a router output.
    pub fn port(&self) -> Arc<dyn Port> {
        self.fifo.clone()
    }

    /// Stop accepting commands.
    pub fn close(&self) {
        self.core.close();
    }

    /// Close, let the mover finish queued commands, and join it.
    pub async fn shutdown(&self) -> Result<DmaStats, DmaError> {
        self.core.join().await
    }
}

impl Port for ReceivingDma {
    fn write(&self, packet: Packet) -> BoxFuture<'_, Result<(), PortError>> {
        self.fifo.write(packet)
    }

    fn try_write(&self, packet: Packet) -> Result<bool, PortError> {
        self.fifo.try_write(packet)
    }

    fn read(&self) -> BoxFuture<'_, Result<Packet, PortError>> {
        self.fifo.read()
    }

    fn try_read(&self) -> Result<Option<Packet>, PortError> {
        self.fifo.try_read()
    }
}

impl Drop for ReceivingDma {
    fn drop(&mut self) {
        self.core.close();
    }
}

/// Memory-to-network engine.
///
/// Drop closes the command queue without joining the mover; see
/// [`ReceivingDma`]. Use [`shutdown`](Self::shutdown) to drain and join.
pub struct SendingDma {
    core: Arc<DmaCore>,
}

impl SendingDma {
    /// Create the engine, writing into `output`, and start its mover.
    pub fn new(
        name: impl Into<String>,
        memory: Arc<TileMemory>,
        pool: &TaskPool,
        command_depth: usize,
        output: Arc<dyn Port>,
    ) -> Result<Self, DmaError> {
        let core = Arc::new(DmaCore::new(
            name.into(),
            DmaDirection::Out,
            memory,
            command_depth,
        ));

        let mover = {
            let core = core.clone();
            pool.submit(move || async move {
                let mut stats = DmaStats::default();
                while let Some(command) = core.commands.pop().await {
                    let span = command.span;
                    for i in 0..span.words {
                        let value = core.memory.read_u32(span.word_offset(i));
                        let packet = if i + 1 == span.words {
                            Packet::with_last(value)
                        } else {
                            Packet::new(value)
                        };
                        if let Err(e) = output.write(packet).await {
                            log::error!("{}: output closed mid-transfer", core.name);
                            core.fail();
                            return Err(DmaError::from(e));
                        }
                        stats.words += 1;
                    }
                    stats.commands += 1;
                    core.complete_one();
                }
                Ok(stats)
            })?
        };
        *core.mover.lock() = Some(mover);

        Ok(Self { core })
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Queue a send command, waiting if the command queue is full.
    pub async fn push(&self, command: DmaCommand) -> Result<(), DmaError> {
        self.core.push(command).await
    }

    /// Wait until every queued command has completed.
    pub async fn wait(&self) -> Result<(), DmaError> {
        self.core.wait().await
    }

    pub fn outstanding(&self) -> usize {
        self.core.outstanding()
    }

    pub fn close(&self) {
        self.core.close();
    }

    pub async fn shutdown(&self) -> Result<DmaStats, DmaError> {
        self.core.join().await
    }
}

impl Drop for SendingDma {
    fn drop(&mut self) {
        self.core.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::dma::MemorySpan;
    use crate::pool::{PoolConfig, SchedulerPolicy};
    use futures::executor::block_on;

    fn pool(policy: SchedulerPolicy) -> TaskPool {
        TaskPool::new(PoolConfig::new(policy, 2)).unwrap()
    }

    #[test]
    fn test_send_then_receive_roundtrip() {
        for policy in [SchedulerPolicy::RoundRobin, SchedulerPolicy::WorkStealing] {
            let pool = pool(policy);
            let src = Arc::new(TileMemory::new(256));
            let dst = Arc::new(TileMemory::new(256));
            let values: Vec<u32> = (0..16).map(|i| 0x1000 + i * 3).collect();
            src.write_words(64, &values);

            let rx = ReceivingDma::new("rx", dst.clone(), &pool, 8, 4).unwrap();
            let tx = SendingDma::new("tx", src.clone(), &pool, 8, rx.port()).unwrap();

            block_on(async {
                rx.push(DmaCommand::receive(MemorySpan::new(128, 16))).await.unwrap();
                tx.push(DmaCommand::send(MemorySpan::new(64, 16))).await.unwrap();
                tx.wait().await.unwrap();
                rx.wait().await.unwrap();
            });
            assert_eq!(dst.read_words(128, 16), values);
            assert_eq!(rx.outstanding(), 0);

            let stats = block_on(tx.shutdown()).unwrap();
            assert_eq!(stats, DmaStats { commands: 1, words: 16 });
            block_on(rx.shutdown()).unwrap();
        }
    }

    #[test]
    fn test_last_flag_on_final_word() {
        let pool = pool(SchedulerPolicy::SharedWork);
        let mem = Arc::new(TileMemory::new(64));
        let sink = Arc::new(ReceiverPort::new(8));
        let tx = SendingDma::new("tx", mem, &pool, 8, sink.clone()).unwrap();
        block_on(async {
            tx.push(DmaCommand::send(MemorySpan::new(0, 3))).await.unwrap();
            let lasts: Vec<bool> = [
                sink.read().await.unwrap(),
                sink.read().await.unwrap(),
                sink.read().await.unwrap(),
            ]
            .iter()
            .map(|p| p.last)
            .collect();
            assert_eq!(lasts, vec![false, false, true]);
        });
        block_on(tx.shutdown()).unwrap();
    }

    #[test]
    fn test_wait_with_nothing_queued() {
        let pool = pool(SchedulerPolicy::RoundRobin);
        let rx = ReceivingDma::new("rx", Arc::new(TileMemory::new(64)), &pool, 8, 4).unwrap();
        block_on(rx.wait()).unwrap();
        block_on(rx.shutdown()).unwrap();
    }

    #[test]
    fn test_commands_complete_in_order() {
        let pool = pool(SchedulerPolicy::WorkStealing);
        let mem = Arc::new(TileMemory::new(256));
        let rx = ReceivingDma::new("rx", mem.clone(), &pool, 2, 4).unwrap();

        let feeder = std::thread::spawn({
            let port = rx.port();
            move || {
                block_on(async {
                    for v in 0..8u32 {
                        port.write(Packet::new(v)).await.unwrap();
                    }
                })
            }
        });

        // More commands than the queue holds: pushes block until the mover
        // catches up.
        block_on(async {
            for i in 0..4u32 {
                rx.push(DmaCommand::receive(MemorySpan::new(i * 8, 2))).await.unwrap();
            }
            rx.wait().await.unwrap();
        });
        feeder.join().unwrap();
        assert_eq!(mem.read_words(0, 8), (0..8).collect::<Vec<_>>());
        block_on(rx.shutdown()).unwrap();
    }

    #[test]
    fn test_validation_errors() {
        let pool = pool(SchedulerPolicy::RoundRobin);
        let mem = Arc::new(TileMemory::new(64));
        let rx = ReceivingDma::new("rx", mem, &pool, 8, 4).unwrap();
        block_on(async {
            let err = rx.push(DmaCommand::send(MemorySpan::new(0, 1))).await.unwrap_err();
            assert!(matches!(err, DmaError::DirectionMismatch { .. }));
            let err = rx.push(DmaCommand::receive(MemorySpan::new(60, 2))).await.unwrap_err();
            assert!(matches!(err, DmaError::OutOfBounds { .. }));
            let err = rx.push(DmaCommand::receive(MemorySpan::new(2, 1))).await.unwrap_err();
            assert!(matches!(err, DmaError::Misaligned(2)));
        });
        assert_eq!(rx.outstanding(), 0);
        block_on(rx.shutdown()).unwrap();
    }

    #[test]
    fn test_drop_still_drains_queued_commands() {
        let pool = pool(SchedulerPolicy::SharedWork);
        let mem = Arc::new(TileMemory::new(64));
        mem.write_words(0, &[1, 2, 3, 4]);
        let sink = Arc::new(ReceiverPort::new(2));
        let tx = SendingDma::new("tx", mem, &pool, 4, sink.clone()).unwrap();
        block_on(async {
            tx.push(DmaCommand::send(MemorySpan::new(0, 2))).await.unwrap();
            tx.push(DmaCommand::send(MemorySpan::new(8, 2))).await.unwrap();
        });
        drop(tx);

        let values: Vec<u32> = block_on(async {
            let mut values = Vec::new();
            for _ in 0..4 {
                values.push(sink.read().await.unwrap().value);
            }
            values
        });
        assert_eq!(values, vec![1, 2, 3, 4]);
        pool.join();
    }

    #[test]
    fn test_push_after_close_fails() {
        let pool = pool(SchedulerPolicy::RoundRobin);
        let rx = ReceivingDma::new("rx", Arc::new(TileMemory::new(64)), &pool, 8, 4).unwrap();
        rx.close();
        let err = block_on(rx.push(DmaCommand::receive(MemorySpan::new(0, 1)))).unwrap_err();
        assert!(matches!(err, DmaError::Closed(_)));
        assert_eq!(rx.outstanding(), 0);
        block_on(rx.shutdown()).unwrap();
    }
}

//! Shared harness driving sinks the way the host runtime would: route records to writers,
//! deliver checkpoint barriers writer-first, and signal checkpoint completion to the coordinator.
//! Restarts are simulated by rebuilding the operators and restoring the byte-for-byte state
//! captures.
#![allow(dead_code)]

use sink_kernel::cdc::{CdcEvent, MultiplexCdcRecord};
use sink_kernel::record::SinkRecord;
use sink_kernel::sink::{CdcMultiplexSink, Sink};
use sink_kernel::state::MemoryStateBackend;
use sink_kernel::{CheckpointId, SinkResult};

/// A running single-table sink plus the operator state the host would snapshot.
pub struct SinkHarness {
    pub sink: Sink,
    pub writer_backends: Vec<MemoryStateBackend>,
    pub committer_backend: MemoryStateBackend,
}

impl SinkHarness {
    /// Initialize all operators against fresh state.
    pub fn start(sink: Sink) -> SinkResult<Self> {
        let backends = vec![MemoryStateBackend::new(); sink.writers.len()];
        let committer_backend = MemoryStateBackend::new();
        Self::start_from(sink, backends, committer_backend)
    }

    /// Initialize all operators against restored state captures (a restart).
    pub fn start_from(
        mut sink: Sink,
        mut writer_backends: Vec<MemoryStateBackend>,
        mut committer_backend: MemoryStateBackend,
    ) -> SinkResult<Self> {
        for (writer, backend) in sink.writers.iter_mut().zip(writer_backends.iter_mut()) {
            writer.initialize(backend)?;
        }
        sink.committer.initialize(&mut committer_backend)?;
        Ok(Self {
            sink,
            writer_backends,
            committer_backend,
        })
    }

    /// Route one record to the writer instance owning its bucket.
    pub fn send(&mut self, record: SinkRecord) -> SinkResult<()> {
        let channel = self.sink.channel_computer.channel(&record.bucket_key());
        self.sink.writers[channel].process(record)
    }

    /// Deliver the checkpoint barrier: writers snapshot first (emitting their committable
    /// batches to the coordinator), then the coordinator snapshots its pending aggregate.
    /// The commit itself waits for [`Self::complete_checkpoint`].
    pub fn barrier(&mut self, checkpoint_id: CheckpointId) -> SinkResult<()> {
        for (writer, backend) in self
            .sink
            .writers
            .iter_mut()
            .zip(self.writer_backends.iter_mut())
        {
            let batch = writer.snapshot(backend, checkpoint_id)?;
            self.sink.committer.process(batch)?;
        }
        self.sink
            .committer
            .snapshot(&mut self.committer_backend, checkpoint_id)
    }

    /// The host acknowledges the checkpoint; the coordinator commits it.
    pub fn complete_checkpoint(&mut self, checkpoint_id: CheckpointId) -> SinkResult<()> {
        self.sink.committer.notify_checkpoint_completed(checkpoint_id)
    }

    /// Barrier + completion in one step.
    pub fn checkpoint(&mut self, checkpoint_id: CheckpointId) -> SinkResult<()> {
        self.barrier(checkpoint_id)?;
        self.complete_checkpoint(checkpoint_id)
    }

    /// The state captures a restart would restore from.
    pub fn captured_state(&self) -> (Vec<MemoryStateBackend>, MemoryStateBackend) {
        (
            self.writer_backends.iter().map(|b| b.checkpoint()).collect(),
            self.committer_backend.checkpoint(),
        )
    }
}

/// A running multiplexed CDC sink plus its operator state.
pub struct CdcHarness {
    pub sink: CdcMultiplexSink,
    pub writer_backends: Vec<MemoryStateBackend>,
    pub committer_backend: MemoryStateBackend,
}

impl CdcHarness {
    pub fn start(sink: CdcMultiplexSink) -> SinkResult<Self> {
        let backends = vec![MemoryStateBackend::new(); sink.writers.len()];
        let committer_backend = MemoryStateBackend::new();
        Self::start_from(sink, backends, committer_backend)
    }

    pub fn start_from(
        mut sink: CdcMultiplexSink,
        mut writer_backends: Vec<MemoryStateBackend>,
        mut committer_backend: MemoryStateBackend,
    ) -> SinkResult<Self> {
        for (writer, backend) in sink.writers.iter_mut().zip(writer_backends.iter_mut()) {
            writer.initialize(backend)?;
        }
        sink.committer.initialize(&mut committer_backend)?;
        Ok(Self {
            sink,
            writer_backends,
            committer_backend,
        })
    }

    /// Deliver one CDC event in stream order: schema changes go through the parallelism-1
    /// schema-apply stage, data records are partitioned to their owning writer instance.
    pub fn send(&mut self, event: CdcEvent) -> SinkResult<()> {
        match event {
            CdcEvent::SchemaChange(change) => self.sink.schema_applier.apply(&change).map(|_| ()),
            CdcEvent::Data(record) => self.send_data(record),
        }
    }

    pub fn send_data(&mut self, record: MultiplexCdcRecord) -> SinkResult<()> {
        let channel = self.sink.channel_computer.channel(&record)?;
        self.sink.writers[channel].process(record)
    }

    pub fn barrier(&mut self, checkpoint_id: CheckpointId) -> SinkResult<()> {
        for writer in self.sink.writers.iter_mut() {
            let batch = writer.snapshot(checkpoint_id)?;
            self.sink.committer.process(batch)?;
        }
        self.sink
            .committer
            .snapshot(&mut self.committer_backend, checkpoint_id)
    }

    pub fn complete_checkpoint(&mut self, checkpoint_id: CheckpointId) -> SinkResult<()> {
        self.sink.committer.notify_checkpoint_completed(checkpoint_id)
    }

    pub fn checkpoint(&mut self, checkpoint_id: CheckpointId) -> SinkResult<()> {
        self.barrier(checkpoint_id)?;
        self.complete_checkpoint(checkpoint_id)
    }

    pub fn captured_state(&self) -> (Vec<MemoryStateBackend>, MemoryStateBackend) {
        (
            self.writer_backends.iter().map(|b| b.checkpoint()).collect(),
            self.committer_backend.checkpoint(),
        )
    }
}

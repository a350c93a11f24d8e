//! Bookkeeping for the bulk read requests kept in flight on the streaming endpoint.
//!
//! A buffer is owned by its slot while idle and by the [`StreamTransport`]
//! while submitted; it only comes back through a [`Completion`]. Nothing here
//! blocks: submission and cancellation are requests, and completions are
//! delivered whenever the owner calls [`StreamTransport::handle_events`].

use std::time::Duration;

use crate::config::BufferPlan;
use crate::framing::Flow;

pub type SlotId = usize;

/// How a submitted transfer ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    /// Partial (possibly empty) read; the received bytes are valid.
    TimedOut,
    Stall,
    Overflow,
    Error,
    NoDevice,
    Cancelled,
}

impl TransferStatus {
    pub fn carries_data(self) -> bool {
        matches!(self, Self::Completed | Self::TimedOut)
    }

    pub fn is_recoverable(self) -> bool {
        matches!(self, Self::Stall | Self::Overflow | Self::Error)
    }
}

/// A transfer handed back by the transport together with its buffer.
#[derive(Debug)]
pub struct Completion {
    pub slot: SlotId,
    pub status: TransferStatus,
    pub buffer: Vec<u8>,
    pub actual_length: usize,
}

impl Completion {
    pub fn data(&self) -> &[u8] {
        &self.buffer[..self.actual_length.min(self.buffer.len())]
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransferError {
    #[error("Device disconnected")]
    NoDevice,

    #[error("Slot {0} already has a transfer in flight")]
    Busy(SlotId),

    #[error("Transfer backend error: {0}")]
    Backend(String),
}

/// Asynchronous bulk IN endpoint.
pub trait StreamTransport: Send + Sync {
    /// Queue a read into `buffer`. On failure the buffer is handed back.
    fn submit(&self, slot: SlotId, buffer: Vec<u8>) -> Result<(), (Vec<u8>, TransferError)>;

    /// Ask for the transfer of `slot` to be cancelled. The buffer still comes
    /// back through a later completion.
    fn cancel(&self, slot: SlotId);

    /// Wait up to `timeout` and return the completions that arrived.
    fn handle_events(&self, timeout: Duration) -> Vec<Completion>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Submitted,
    Completed,
    Cancelled,
}

#[derive(Debug)]
struct TransferSlot {
    state: SlotState,
    buffer: Option<Vec<u8>>,
}

/// What happened to a slot after its completion was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotOutcome {
    Resubmitted,
    Released,
    /// The device vanished; the pool is aborting.
    DeviceGone,
    /// The completion did not belong to a submitted slot.
    Ignored,
}

#[derive(Debug)]
pub struct TransferPool {
    slots: Vec<TransferSlot>,
    buffer_size: usize,
    outstanding: usize,
    aborting: bool,
}

impl TransferPool {
    pub fn new(plan: BufferPlan) -> Self {
        Self {
            slots: (0..plan.num_transfers)
                .map(|_| TransferSlot {
                    state: SlotState::Idle,
                    buffer: None,
                })
                .collect(),
            buffer_size: plan.buffer_size,
            outstanding: 0,
            aborting: false,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    pub fn is_aborting(&self) -> bool {
        self.aborting
    }

    pub fn slot_state(&self, slot: SlotId) -> Option<SlotState> {
        self.slots.get(slot).map(|s| s.state)
    }

    /// Allocate and submit every slot. On the first failure the whole pool is
    /// aborted and the error returned; already submitted transfers still have
    /// to be drained by the caller.
    pub fn submit_all(&mut self, transport: &dyn StreamTransport) -> Result<(), TransferError> {
        log::debug!(
            "Submitting {} transfers of {} bytes",
            self.slots.len(),
            self.buffer_size
        );
        for id in 0..self.slots.len() {
            let buffer = self.slots[id]
                .buffer
                .take()
                .unwrap_or_else(|| vec![0; self.buffer_size]);
            if let Err(e) = self.submit(transport, id, buffer) {
                log::error!("Failed to submit transfer {}: {}", id, e);
                self.abort(transport);
                return Err(e);
            }
        }
        Ok(())
    }

    fn submit(
        &mut self,
        transport: &dyn StreamTransport,
        id: SlotId,
        buffer: Vec<u8>,
    ) -> Result<(), TransferError> {
        match transport.submit(id, buffer) {
            Ok(()) => {
                self.slots[id].state = SlotState::Submitted;
                self.outstanding += 1;
                Ok(())
            }
            Err((buffer, e)) => {
                self.release(id, buffer);
                Err(e)
            }
        }
    }

    fn release(&mut self, id: SlotId, buffer: Vec<u8>) {
        let slot = &mut self.slots[id];
        if slot.state != SlotState::Cancelled {
            slot.state = SlotState::Completed;
        }
        slot.buffer = Some(buffer);
    }

    /// Stop resubmitting; completions from now on only return their buffers.
    pub fn set_aborting(&mut self) {
        if !self.aborting {
            log::debug!("Aborting transfer pool ({} outstanding)", self.outstanding);
        }
        self.aborting = true;
    }

    /// Stop resubmitting and cancel everything in flight.
    pub fn abort(&mut self, transport: &dyn StreamTransport) {
        self.set_aborting();
        self.cancel_all(transport);
    }

    /// Request cancellation of every submitted slot. Slots already cancelled or
    /// back from the transport are skipped, so calling this twice is harmless.
    pub fn cancel_all(&mut self, transport: &dyn StreamTransport) {
        for (id, slot) in self.slots.iter_mut().enumerate() {
            if slot.state == SlotState::Submitted {
                slot.state = SlotState::Cancelled;
                transport.cancel(id);
            }
        }
    }

    /// Classify a completion, hand its payload to `process` when it carries
    /// data, and resubmit the buffer when streaming should go on.
    pub fn on_complete<F>(
        &mut self,
        completion: Completion,
        transport: &dyn StreamTransport,
        process: F,
    ) -> SlotOutcome
    where
        F: FnOnce(&[u8]) -> Flow,
    {
        let id = completion.slot;
        let state = self.slot_state(id);
        if !matches!(state, Some(SlotState::Submitted | SlotState::Cancelled)) {
            log::warn!("Completion for slot {} which is not in flight ({:?})", id, state);
            return SlotOutcome::Ignored;
        }
        self.outstanding -= 1;

        tracing::trace!(
            slot = id,
            status = ?completion.status,
            length = completion.actual_length,
            outstanding = self.outstanding,
            "transfer completed"
        );

        if state == Some(SlotState::Cancelled) || self.aborting {
            self.release(id, completion.buffer);
            return SlotOutcome::Released;
        }

        let resubmit = match completion.status {
            TransferStatus::NoDevice => {
                log::error!("Device gone while transfer {} was in flight", id);
                self.release(id, completion.buffer);
                self.abort(transport);
                return SlotOutcome::DeviceGone;
            }
            TransferStatus::Cancelled => false,
            status if status.is_recoverable() => {
                log::warn!("Transfer {} failed with {:?}, resubmitting", id, status);
                true
            }
            _ => process(completion.data()) == Flow::Continue,
        };

        if !resubmit {
            self.release(id, completion.buffer);
            return SlotOutcome::Released;
        }
        match self.submit(transport, id, completion.buffer) {
            Ok(()) => SlotOutcome::Resubmitted,
            Err(e) => {
                log::warn!("Failed to resubmit transfer {}: {}", id, e);
                SlotOutcome::Released
            }
        }
    }

    /// Drop all slot storage. Only valid once nothing is outstanding.
    pub fn release_buffers(&mut self) {
        if self.outstanding > 0 {
            log::warn!(
                "Not releasing buffers with {} transfers outstanding",
                self.outstanding
            );
            return;
        }
        for slot in &mut self.slots {
            slot.state = SlotState::Idle;
            slot.buffer = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Holds submitted buffers until the test completes them by hand.
    #[derive(Default)]
    struct ManualTransport {
        in_flight: Mutex<HashMap<SlotId, Vec<u8>>>,
        submits: Mutex<Vec<SlotId>>,
        cancels: Mutex<Vec<SlotId>>,
        fail_slot: Option<SlotId>,
    }

    impl ManualTransport {
        fn complete(&self, slot: SlotId, status: TransferStatus, data: &[u8]) -> Completion {
            let mut buffer = self.in_flight.lock().remove(&slot).unwrap();
            buffer[..data.len()].copy_from_slice(data);
            Completion {
                slot,
                status,
                buffer,
                actual_length: data.len(),
            }
        }
    }

    impl StreamTransport for ManualTransport {
        fn submit(&self, slot: SlotId, buffer: Vec<u8>) -> Result<(), (Vec<u8>, TransferError)> {
            if self.fail_slot == Some(slot) {
                return Err((buffer, TransferError::Backend("refused".into())));
            }
            self.submits.lock().push(slot);
            self.in_flight.lock().insert(slot, buffer);
            Ok(())
        }

        fn cancel(&self, slot: SlotId) {
            self.cancels.lock().push(slot);
        }

        fn handle_events(&self, _timeout: Duration) -> Vec<Completion> {
            Vec::new()
        }
    }

    fn pool(n: usize) -> TransferPool {
        TransferPool::new(BufferPlan {
            num_transfers: n,
            buffer_size: 16,
        })
    }

    #[test]
    fn test_submit_all_fills_every_slot() {
        let transport = ManualTransport::default();
        let mut pool = pool(4);
        pool.submit_all(&transport).unwrap();
        assert_eq!(pool.outstanding(), 4);
        assert_eq!(*transport.submits.lock(), vec![0, 1, 2, 3]);
        assert_eq!(pool.slot_state(2), Some(SlotState::Submitted));
    }

    #[test]
    fn test_submit_failure_aborts_pool() {
        let transport = ManualTransport {
            fail_slot: Some(2),
            ..Default::default()
        };
        let mut pool = pool(4);
        let err = pool.submit_all(&transport).unwrap_err();
        assert!(matches!(err, TransferError::Backend(_)));
        assert!(pool.is_aborting());
        assert_eq!(pool.outstanding(), 2);
        assert_eq!(*transport.cancels.lock(), vec![0, 1]);
    }

    #[test]
    fn test_data_completion_is_processed_and_resubmitted() {
        let transport = ManualTransport::default();
        let mut pool = pool(1);
        pool.submit_all(&transport).unwrap();

        let completion = transport.complete(0, TransferStatus::Completed, &[1, 2, 3]);
        let mut seen = Vec::new();
        let outcome = pool.on_complete(completion, &transport, |data| {
            seen.extend_from_slice(data);
            Flow::Continue
        });
        assert_eq!(outcome, SlotOutcome::Resubmitted);
        assert_eq!(seen, vec![1, 2, 3]);
        assert_eq!(pool.outstanding(), 1);
        // the full buffer goes back, not just the received part
        assert_eq!(transport.in_flight.lock()[&0].len(), 16);
    }

    #[test]
    fn test_timeout_is_processed_as_partial_data() {
        let transport = ManualTransport::default();
        let mut pool = pool(1);
        pool.submit_all(&transport).unwrap();

        let completion = transport.complete(0, TransferStatus::TimedOut, &[]);
        let mut calls = 0;
        let outcome = pool.on_complete(completion, &transport, |data| {
            calls += 1;
            assert!(data.is_empty());
            Flow::Continue
        });
        assert_eq!(outcome, SlotOutcome::Resubmitted);
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_final_frame_releases_slot() {
        let transport = ManualTransport::default();
        let mut pool = pool(2);
        pool.submit_all(&transport).unwrap();

        let completion = transport.complete(1, TransferStatus::Completed, &[9]);
        let outcome = pool.on_complete(completion, &transport, |_| Flow::FinalFrame);
        assert_eq!(outcome, SlotOutcome::Released);
        assert_eq!(pool.outstanding(), 1);
        assert_eq!(pool.slot_state(1), Some(SlotState::Completed));
    }

    #[test]
    fn test_recoverable_error_resubmits_without_processing() {
        let transport = ManualTransport::default();
        let mut pool = pool(1);
        pool.submit_all(&transport).unwrap();

        for status in [TransferStatus::Stall, TransferStatus::Overflow, TransferStatus::Error] {
            let completion = transport.complete(0, status, &[]);
            let outcome = pool.on_complete(completion, &transport, |_| unreachable!());
            assert_eq!(outcome, SlotOutcome::Resubmitted);
        }
        assert_eq!(pool.outstanding(), 1);
    }

    #[test]
    fn test_device_gone_aborts_and_cancels_the_rest() {
        let transport = ManualTransport::default();
        let mut pool = pool(3);
        pool.submit_all(&transport).unwrap();

        let completion = transport.complete(1, TransferStatus::NoDevice, &[]);
        let outcome = pool.on_complete(completion, &transport, |_| unreachable!());
        assert_eq!(outcome, SlotOutcome::DeviceGone);
        assert!(pool.is_aborting());
        assert_eq!(pool.outstanding(), 2);
        assert_eq!(*transport.cancels.lock(), vec![0, 2]);

        // data racing the cancellation is dropped
        for slot in [0, 2] {
            let completion = transport.complete(slot, TransferStatus::Completed, &[1]);
            let outcome = pool.on_complete(completion, &transport, |_| unreachable!());
            assert_eq!(outcome, SlotOutcome::Released);
        }
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_cancel_all_is_idempotent() {
        let transport = ManualTransport::default();
        let mut pool = pool(3);
        pool.submit_all(&transport).unwrap();

        let completion = transport.complete(0, TransferStatus::Completed, &[]);
        pool.on_complete(completion, &transport, |_| Flow::FinalFrame);

        pool.cancel_all(&transport);
        pool.cancel_all(&transport);
        assert_eq!(*transport.cancels.lock(), vec![1, 2]);
    }

    #[test]
    fn test_cancelled_pool_drains_to_zero() {
        let transport = ManualTransport::default();
        let mut pool = pool(5);
        pool.submit_all(&transport).unwrap();
        pool.abort(&transport);

        let mut completions = 0;
        for slot in 0..5 {
            let completion = transport.complete(slot, TransferStatus::Cancelled, &[]);
            assert_eq!(
                pool.on_complete(completion, &transport, |_| unreachable!()),
                SlotOutcome::Released
            );
            completions += 1;
        }
        assert_eq!(completions, 5);
        assert_eq!(pool.outstanding(), 0);
        assert!(transport.in_flight.lock().is_empty());

        pool.release_buffers();
        assert_eq!(pool.slot_state(0), Some(SlotState::Idle));
    }

    #[test]
    fn test_stray_completion_never_underflows() {
        let transport = ManualTransport::default();
        let mut pool = pool(1);
        let stray = Completion {
            slot: 0,
            status: TransferStatus::Completed,
            buffer: vec![0; 16],
            actual_length: 16,
        };
        assert_eq!(
            pool.on_complete(stray, &transport, |_| unreachable!()),
            SlotOutcome::Ignored
        );
        assert_eq!(pool.outstanding(), 0);
    }
}

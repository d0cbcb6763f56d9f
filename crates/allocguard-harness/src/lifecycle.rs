//! Start-up/shut-down model of a protocol stack that owns tracked buffers.
//!
//! Start-up gives every local controller a transmit and a completion command
//! queue, each filled with `depth` command buffers, and creates the HCI and
//! BTA message queues with `depth` messages apiece. Shut-down drains and
//! frees every queue, then the leak checkpoint runs. Buffers held back with
//! `leak` are released only after the checkpoint has reported them.

#![allow(unsafe_code)]

use std::collections::VecDeque;
use std::sync::Arc;

use allocguard_tracker::{
    AllocationTracker, LeakReport, LogSink, MetricsSnapshot, TrackedAllocator, TrackerConfig,
    TrackerMode, UserPtr, ViolationPolicy,
};
use serde::Serialize;

use crate::HarnessError;

/// Command buffer: 3-byte HCI command header plus the largest parameter block.
pub const COMMAND_BUFFER_SIZE: usize = 3 + 255;
/// Message buffer: ACL preamble plus the default data size.
pub const MESSAGE_BUFFER_SIZE: usize = 4 + 1017;
/// Control block allocated for each message queue.
pub const QUEUE_HEADER_SIZE: usize = 48;
/// Controller ids fit the one-byte slot after the command header.
pub const MAX_CONTROLLERS: usize = 1 << u8::BITS;

#[derive(Debug, Clone, Copy, Serialize)]
pub struct LifecycleConfig {
    pub controllers: usize,
    pub depth: usize,
    pub leak: usize,
    pub mode: TrackerMode,
}

#[derive(Debug, Clone, Serialize)]
pub struct LifecycleReport {
    pub config: LifecycleConfig,
    pub buffers_allocated: usize,
    pub buffers_freed: usize,
    pub peak_bytes: usize,
    pub leaks: LeakReport,
    pub leaked_bytes: usize,
    pub leaked_after_cleanup: usize,
    pub metrics: MetricsSnapshot,
}

impl LifecycleReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.leaked_bytes == 0 && self.leaked_after_cleanup == 0
    }
}

#[derive(Default)]
struct CommandQueues {
    xmit: VecDeque<UserPtr>,
    cmpl: VecDeque<UserPtr>,
}

struct MessageQueue {
    header: UserPtr,
    messages: VecDeque<UserPtr>,
}

struct Stack<'t> {
    alloc: TrackedAllocator<'t>,
    controllers: Vec<CommandQueues>,
    hci_msg_queue: Option<MessageQueue>,
    bta_msg_queue: Option<MessageQueue>,
    allocated: usize,
    freed: usize,
}

impl<'t> Stack<'t> {
    fn new(tracker: &'t AllocationTracker) -> Self {
        Self {
            alloc: TrackedAllocator::new(tracker).on_violation(ViolationPolicy::Report),
            controllers: Vec::new(),
            hci_msg_queue: None,
            bta_msg_queue: None,
            allocated: 0,
            freed: 0,
        }
    }

    fn command(&mut self, controller: u8, opcode: u16) -> Result<UserPtr, HarnessError> {
        let mut buf = [0_u8; COMMAND_BUFFER_SIZE];
        buf[..2].copy_from_slice(&opcode.to_le_bytes());
        buf[2] = (COMMAND_BUFFER_SIZE - 3) as u8;
        buf[3] = controller;
        let user = self.alloc.dup_bytes(&buf)?;
        self.allocated += 1;
        Ok(user)
    }

    fn message_queue(&mut self, depth: usize) -> Result<MessageQueue, HarnessError> {
        let header = self.alloc.alloc_zeroed(QUEUE_HEADER_SIZE)?;
        self.allocated += 1;
        let mut messages = VecDeque::with_capacity(depth);
        for _ in 0..depth {
            messages.push_back(self.alloc.alloc_zeroed(MESSAGE_BUFFER_SIZE)?);
            self.allocated += 1;
        }
        Ok(MessageQueue { header, messages })
    }

    fn start_up(&mut self, controllers: usize, depth: usize) -> Result<(), HarnessError> {
        for controller in (0..=u8::MAX).take(controllers) {
            let mut queues = CommandQueues::default();
            for i in 0..depth {
                let opcode = 0x0C00 | (i as u16 & 0x3FF);
                queues.xmit.push_back(self.command(controller, opcode)?);
                queues.cmpl.push_back(self.command(controller, opcode)?);
            }
            self.controllers.push(queues);
        }
        self.hci_msg_queue = Some(self.message_queue(depth)?);
        self.bta_msg_queue = Some(self.message_queue(depth)?);
        Ok(())
    }

    fn free(&mut self, user: UserPtr) -> Result<(), HarnessError> {
        // SAFETY: every pointer handed to free comes from self.alloc and is
        // dropped from its queue before this call.
        unsafe { self.alloc.free(Some(user)) }?;
        self.freed += 1;
        Ok(())
    }

    /// Frees everything except the last `leak` buffers drained, which are
    /// returned.
    fn shut_down(&mut self, leak: usize) -> Result<Vec<UserPtr>, HarnessError> {
        let mut drained = Vec::with_capacity(self.allocated - self.freed);
        for queues in &mut self.controllers {
            drained.extend(queues.xmit.drain(..));
            drained.extend(queues.cmpl.drain(..));
        }
        self.controllers.clear();
        for queue in [self.bta_msg_queue.take(), self.hci_msg_queue.take()]
            .into_iter()
            .flatten()
        {
            drained.extend(queue.messages);
            drained.push(queue.header);
        }

        let kept = drained.split_off(drained.len().saturating_sub(leak));
        for user in drained {
            self.free(user)?;
        }
        Ok(kept)
    }
}

/// Start up, shut down, take the leak checkpoint, then release anything held
/// back so the process itself ends clean.
pub fn run_lifecycle(
    config: LifecycleConfig,
    sink: Arc<dyn LogSink>,
) -> Result<LifecycleReport, HarnessError> {
    if config.controllers > MAX_CONTROLLERS {
        return Err(HarnessError::TooManyControllers {
            requested: config.controllers,
            max: MAX_CONTROLLERS,
        });
    }
    let tracker_config = TrackerConfig {
        mode: config.mode,
        ..TrackerConfig::default()
    };
    let tracker = AllocationTracker::with_config(&tracker_config, sink);

    let mut stack = Stack::new(&tracker);
    stack.start_up(config.controllers, config.depth)?;
    let peak_bytes = tracker.outstanding_bytes();
    let kept = stack.shut_down(config.leak)?;

    let leaks = tracker.leak_report();
    let leaked_bytes = tracker.expect_no_allocations();

    for user in kept {
        stack.free(user)?;
    }
    let leaked_after_cleanup = tracker.outstanding_bytes();

    Ok(LifecycleReport {
        config,
        buffers_allocated: stack.allocated,
        buffers_freed: stack.freed,
        peak_bytes,
        leaks,
        leaked_bytes,
        leaked_after_cleanup,
        metrics: tracker.metrics(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use allocguard_tracker::MemorySink;

    fn config(leak: usize) -> LifecycleConfig {
        LifecycleConfig {
            controllers: 2,
            depth: 3,
            leak,
            mode: TrackerMode::Canaries,
        }
    }

    #[test]
    fn clean_shutdown_leaves_nothing() {
        let report = run_lifecycle(config(0), Arc::new(MemorySink::new())).unwrap();
        // 2 controllers * 2 queues * 3 commands, plus 2 * (header + 3 messages).
        assert_eq!(report.buffers_allocated, 12 + 8);
        assert_eq!(report.buffers_freed, report.buffers_allocated);
        assert!(report.is_clean());
        assert_eq!(
            report.peak_bytes,
            12 * COMMAND_BUFFER_SIZE + 2 * QUEUE_HEADER_SIZE + 6 * MESSAGE_BUFFER_SIZE
        );
    }

    #[test]
    fn held_back_buffers_show_up_in_the_checkpoint() {
        let sink = Arc::new(MemorySink::new());
        let report = run_lifecycle(config(2), sink.clone()).unwrap();
        // The last two drained are the HCI queue's final message and its header.
        assert_eq!(report.leaks.len(), 2);
        assert_eq!(report.leaked_bytes, MESSAGE_BUFFER_SIZE + QUEUE_HEADER_SIZE);
        assert_eq!(report.leaked_after_cleanup, 0);
        assert!(!report.is_clean());
        assert_eq!(
            sink.events().iter().filter(|e| *e == "leaked_allocation").count(),
            2
        );
    }

    #[test]
    fn controller_ids_past_one_byte_are_rejected() {
        let sink = Arc::new(MemorySink::new());
        let config = LifecycleConfig {
            controllers: MAX_CONTROLLERS + 1,
            ..config(0)
        };
        let err = run_lifecycle(config, sink.clone()).unwrap_err();
        assert!(matches!(
            err,
            HarnessError::TooManyControllers {
                requested: 257,
                max: 256
            }
        ));
        assert!(sink.events().is_empty());
    }

    #[test]
    fn last_controller_id_is_stamped_into_its_commands() {
        let config = LifecycleConfig {
            controllers: MAX_CONTROLLERS,
            depth: 1,
            ..config(0)
        };
        let report = run_lifecycle(config, Arc::new(MemorySink::new())).unwrap();
        assert_eq!(report.buffers_allocated, 2 * MAX_CONTROLLERS + 2 * 2);
        assert!(report.is_clean());
    }

    #[test]
    fn tracking_mode_still_reports_held_back_buffers() {
        let config = LifecycleConfig {
            mode: TrackerMode::Tracking,
            ..config(1)
        };
        let report = run_lifecycle(config, Arc::new(MemorySink::new())).unwrap();
        assert_eq!(report.leaked_bytes, QUEUE_HEADER_SIZE);
        assert_eq!(report.metrics.canaries_installed, 0);
    }
}

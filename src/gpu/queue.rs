//! Command recording and submission.
//!
//! Commands are recorded single-threaded into a [`CommandStream`] and
//! handed to a [`CommandQueue`], which executes them in recorded order
//! and advances a monotonically increasing completion counter. Callers
//! hold [`ExecutionIndex`] tokens and poll or block on them before
//! reusing per-frame resources.

use parking_lot::Mutex;

use crate::error::Result;
use crate::gpu::device::{Device, DispatchRaysDesc, StructureBuildInputs};
use crate::gpu::resource::GpuAddress;

/// Completion token: the value of the queue's fence counter at
/// submission. Finished once the counter has passed it.
pub type ExecutionIndex = u64;

#[derive(Debug, Clone)]
pub(crate) enum Command {
    BuildStructure {
        inputs: StructureBuildInputs,
        dest: GpuAddress,
        scratch: GpuAddress,
    },
    Barrier {
        resource: GpuAddress,
    },
    TraceRays {
        desc: DispatchRaysDesc,
    },
}

/// Recorded command stream. Execution order is recording order.
pub struct CommandStream {
    label: String,
    pub(crate) commands: Vec<Command>,
}

impl CommandStream {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            commands: Vec::new(),
        }
    }

    /// Record an acceleration-structure build. `inputs` must be the
    /// value the result/scratch sizes were queried with.
    pub fn build_structure(
        &mut self,
        inputs: StructureBuildInputs,
        dest: GpuAddress,
        scratch: GpuAddress,
    ) {
        self.commands.push(Command::BuildStructure {
            inputs,
            dest,
            scratch,
        });
    }

    /// Record a completion barrier so later commands in this or a
    /// later submission may reference the resource.
    pub fn barrier(&mut self, resource: GpuAddress) {
        self.commands.push(Command::Barrier { resource });
    }

    /// Record a ray dispatch.
    pub fn trace_rays(&mut self, desc: DispatchRaysDesc) {
        self.commands.push(Command::TraceRays { desc });
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

struct FenceState {
    next_signal: ExecutionIndex,
    last_completed: ExecutionIndex,
}

/// Submission queue with an execution-index fence.
pub struct CommandQueue {
    label: String,
    device: Device,
    fence: Mutex<FenceState>,
}

impl CommandQueue {
    pub(crate) fn new(device: Device, label: &str) -> Self {
        Self {
            label: label.to_string(),
            device,
            fence: Mutex::new(FenceState {
                next_signal: 1,
                last_completed: 0,
            }),
        }
    }

    /// Execute a command stream. Returns the token that marks this
    /// submission finished.
    pub fn submit(&self, stream: CommandStream) -> Result<ExecutionIndex> {
        let index = self.fence.lock().next_signal;
        self.device.execute(&stream.commands)?;
        let mut fence = self.fence.lock();
        fence.next_signal = index + 1;
        fence.last_completed = index;
        log::trace!(
            "queue {}: '{}' ({} commands) completed as #{index}",
            self.label,
            stream.label(),
            stream.len()
        );
        Ok(index)
    }

    pub fn is_execution_finished(&self, index: ExecutionIndex) -> bool {
        index <= self.fence.lock().last_completed
    }

    /// Block until the submission holding `index` has finished.
    pub fn wait_until_finished(&self, index: ExecutionIndex) {
        // Execution is synchronous in the reference executor; a token
        // can only be unfinished if it was never submitted.
        let fence = self.fence.lock();
        debug_assert!(
            index < fence.next_signal,
            "waiting on token {index} that was never submitted"
        );
    }

    /// Block until every submitted command stream has finished.
    pub fn wait_idle(&self) {
        let fence = self.fence.lock();
        debug_assert_eq!(fence.last_completed + 1, fence.next_signal);
    }

    /// Token the next submission will complete as.
    pub fn next_execution_index(&self) -> ExecutionIndex {
        self.fence.lock().next_signal
    }

    /// Most recently finished token.
    pub fn last_execution_index(&self) -> ExecutionIndex {
        self.fence.lock().last_completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_increase_monotonically() {
        let device = Device::new();
        let queue = device.create_queue("direct");
        let a = queue.submit(CommandStream::new("a")).unwrap();
        let b = queue.submit(CommandStream::new("b")).unwrap();
        assert!(b > a);
        assert!(queue.is_execution_finished(a));
        assert!(queue.is_execution_finished(b));
        assert!(!queue.is_execution_finished(b + 1));
    }

    #[test]
    fn test_failed_submission_does_not_signal() {
        let device = Device::new();
        let queue = device.create_queue("direct");
        let mut stream = CommandStream::new("bad");
        stream.barrier(GpuAddress(0xdead));
        let before = queue.last_execution_index();
        assert!(queue.submit(stream).is_err());
        assert_eq!(queue.last_execution_index(), before);
    }
}

// Command queues
//
// Each logical queue owns a worker thread fed through a flume channel.
// Submissions execute in submission order: wait fences are consumed first,
// then the recorded commands replay against host memory, then signal fences
// fire and the submission status completes.

use bitflags::bitflags;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use super::command::Command;
use super::device::DeviceObject;
use super::sync::{Fence, SubmissionStatus};
use crate::error::{RhiError, RhiResult};
use crate::native::Backend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandQueueType {
    #[default]
    Graphics,
    Compute,
    Copy,
}

impl CommandQueueType {
    /// Queue family shared by every queue of this type.
    pub fn family_index(self) -> u32 {
        match self {
            CommandQueueType::Graphics => 0,
            CommandQueueType::Compute => 1,
            CommandQueueType::Copy => 2,
        }
    }

    pub fn supports_graphics(self) -> bool {
        self == CommandQueueType::Graphics
    }

    pub fn supports_compute(self) -> bool {
        matches!(self, CommandQueueType::Graphics | CommandQueueType::Compute)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CommandQueueFlags: u32 {
        /// Swap chains may present from this queue.
        const PRESENTING = 1 << 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandQueueDesc {
    pub ty: CommandQueueType,
    pub flags: CommandQueueFlags,
}

impl CommandQueueDesc {
    pub fn new(ty: CommandQueueType, flags: CommandQueueFlags) -> Self {
        Self { ty, flags }
    }

    pub fn family_index(&self) -> u32 {
        self.ty.family_index()
    }
}

pub(crate) struct Submission<B: Backend> {
    pub commands: Vec<Command<B>>,
    /// Keeps every referenced object alive until the submission retires.
    pub retained: Vec<DeviceObject>,
    pub wait_fences: Vec<Arc<Fence>>,
    pub signal_fences: Vec<Arc<Fence>>,
    pub status: Arc<SubmissionStatus>,
}

pub(crate) struct CommandQueue<B: Backend> {
    index: u32,
    desc: CommandQueueDesc,
    sender: Option<flume::Sender<Submission<B>>>,
    worker: Option<JoinHandle<()>>,
}

impl<B: Backend> CommandQueue<B> {
    pub fn spawn(index: u32, desc: CommandQueueDesc, shutdown: Arc<AtomicBool>) -> RhiResult<Self> {
        let (sender, receiver) = flume::unbounded::<Submission<B>>();
        let worker = thread::Builder::new()
            .name(format!("{:?}-queue-{}", B::KIND, index).to_lowercase())
            .spawn(move || run_queue(index, receiver, shutdown))
            .map_err(|e| RhiError::bad_platform_call(format!("failed to start queue {}: {}", index, e)))?;

        log::info!("Started {:?} queue {} ({:?})", desc.ty, index, desc.flags);

        Ok(Self {
            index,
            desc,
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    pub fn desc(&self) -> &CommandQueueDesc {
        &self.desc
    }

    pub fn submit(&self, submission: Submission<B>) -> RhiResult<()> {
        for fence in &submission.signal_fences {
            fence.reserve_signal();
        }
        let sender = self.sender.as_ref().ok_or(RhiError::Interrupted)?;
        sender.send(submission).map_err(|flume::SendError(rejected)| {
            rejected.status.complete(Err(RhiError::Interrupted));
            RhiError::Interrupted
        })
    }
}

impl<B: Backend> Drop for CommandQueue<B> {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain and exit.
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("Queue {} worker panicked", self.index);
            }
        }
        log::info!("Stopped {:?} queue {}", self.desc.ty, self.index);
    }
}

fn run_queue<B: Backend>(index: u32, receiver: flume::Receiver<Submission<B>>, shutdown: Arc<AtomicBool>) {
    while let Ok(submission) = receiver.recv() {
        let result = execute(index, &submission, &shutdown);
        if !matches!(result, Err(RhiError::Interrupted)) {
            for fence in &submission.signal_fences {
                fence.signal();
            }
        }
        submission.status.complete(result);
        // `submission.retained` drops here, after completion is visible.
    }
    log::debug!("Queue {} worker exiting (shutdown: {})", index, shutdown.load(Ordering::Acquire));
}

fn execute<B: Backend>(index: u32, submission: &Submission<B>, shutdown: &AtomicBool) -> RhiResult<()> {
    for fence in &submission.wait_fences {
        if let Err(e) = fence.consume(shutdown) {
            log::warn!("Queue {}: wait on fence #{} interrupted", index, fence.native_handle());
            return Err(e);
        }
    }
    for (i, command) in submission.commands.iter().enumerate() {
        if let Err(e) = command.execute() {
            log::error!("Queue {}: device fault at command {}: {}", index, i, e);
            return Err(RhiError::bad_platform_call(format!("queue {} faulted at command {}: {}", index, i, e)));
        }
    }
    log::trace!("Queue {} retired {} commands", index, submission.commands.len());
    Ok(())
}

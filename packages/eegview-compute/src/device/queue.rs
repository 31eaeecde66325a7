use super::{Device, DeviceBuffer, Sample};
use crate::error::{ComputeError, DeviceStatus, Result};
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    Pending,
    Complete,
    Failed,
}

type Callback = Box<dyn FnOnce(EventStatus) + Send>;

struct EventState {
    status: EventStatus,
    callbacks: Vec<Callback>,
}

struct EventInner {
    state: Mutex<EventState>,
    signal: Condvar,
}

/// Completion handle for an enqueued command, or a user event completed
/// explicitly by the host.
#[derive(Clone)]
pub struct Event {
    inner: Arc<EventInner>,
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event").field("status", &self.status()).finish()
    }
}

impl Event {
    fn pending() -> Self {
        Self {
            inner: Arc::new(EventInner {
                state: Mutex::new(EventState {
                    status: EventStatus::Pending,
                    callbacks: Vec::new(),
                }),
                signal: Condvar::new(),
            }),
        }
    }

    /// Create an event the host completes with [`Event::complete`].
    pub fn user() -> Self {
        Self::pending()
    }

    pub fn status(&self) -> EventStatus {
        self.inner.state.lock().status
    }

    pub fn is_complete(&self) -> bool {
        self.status() == EventStatus::Complete
    }

    pub fn complete(&self) {
        self.finish(EventStatus::Complete);
    }

    pub(crate) fn fail(&self) {
        self.finish(EventStatus::Failed);
    }

    fn finish(&self, status: EventStatus) {
        let callbacks = {
            let mut state = self.inner.state.lock();
            if state.status != EventStatus::Pending {
                return;
            }
            state.status = status;
            std::mem::take(&mut state.callbacks)
        };
        self.inner.signal.notify_all();

        for callback in callbacks {
            callback(status);
        }
    }

    /// Register a callback invoked once the event leaves the pending state.
    ///
    /// Callbacks run on the thread that completes the event, usually a queue
    /// worker, and must not block.
    pub fn on_complete<F>(&self, callback: F)
    where
        F: FnOnce(EventStatus) + Send + 'static,
    {
        let status = {
            let mut state = self.inner.state.lock();
            if state.status == EventStatus::Pending {
                state.callbacks.push(Box::new(callback));
                return;
            }
            state.status
        };
        callback(status);
    }

    /// Block until the event completes.
    pub fn wait(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        while state.status == EventStatus::Pending {
            self.inner.signal.wait(&mut state);
        }
        match state.status {
            EventStatus::Failed => Err(ComputeError::device(
                DeviceStatus::ExecutionFailure,
                "wait for event",
            )),
            _ => Ok(()),
        }
    }
}

type Task = Box<dyn FnOnce() -> Result<()> + Send>;

enum Message {
    Run {
        label: &'static str,
        task: Task,
        event: Event,
    },
    Shutdown,
}

/// In-order command queue.
///
/// Commands execute on a worker thread owned by the queue, strictly in
/// submission order. Every enqueue returns immediately with an [`Event`].
pub struct CommandQueue {
    device: Arc<Device>,
    sender: Sender<Message>,
    worker: Option<JoinHandle<()>>,
    failure: Arc<Mutex<Option<ComputeError>>>,
    submitted: AtomicU64,
}

impl CommandQueue {
    pub fn new(device: &Arc<Device>) -> Result<Self> {
        let (sender, receiver) = channel::unbounded();
        let failure = Arc::new(Mutex::new(None));
        let worker_failure = Arc::clone(&failure);

        let worker = std::thread::Builder::new()
            .name("eegview-queue".to_string())
            .spawn(move || run_worker(receiver, worker_failure))
            .map_err(|e| {
                ComputeError::device(
                    DeviceStatus::OutOfResources,
                    format!("spawn queue worker: {}", e),
                )
            })?;

        Ok(Self {
            device: Arc::clone(device),
            sender,
            worker: Some(worker),
            failure,
            submitted: AtomicU64::new(0),
        })
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Number of commands submitted over the lifetime of the queue.
    pub fn submitted_commands(&self) -> u64 {
        self.submitted.load(Ordering::Acquire)
    }

    pub(crate) fn submit<F>(&self, label: &'static str, task: F) -> Result<Event>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let event = Event::pending();
        self.sender
            .send(Message::Run {
                label,
                task: Box::new(task),
                event: event.clone(),
            })
            .map_err(|_| {
                ComputeError::device(DeviceStatus::ExecutionFailure, format!("enqueue {}", label))
            })?;
        self.submitted.fetch_add(1, Ordering::AcqRel);
        Ok(event)
    }

    /// Event that completes once every previously enqueued command has run.
    pub fn enqueue_marker(&self) -> Result<Event> {
        self.submit("marker", || Ok(()))
    }

    /// Block until all enqueued commands have run, reporting the first
    /// command failure since the previous call.
    pub fn finish(&self) -> Result<()> {
        let marker = self.enqueue_marker()?;
        marker.wait()?;
        match self.failure.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn enqueue_write<T: Sample>(
        &self,
        buffer: &DeviceBuffer<T>,
        offset: usize,
        data: Vec<T>,
    ) -> Result<Event> {
        check_range("write destination", buffer, offset, data.len())?;
        let buffer = buffer.clone();
        self.submit("write buffer", move || {
            let mut storage = buffer.storage().write();
            storage[offset..offset + data.len()].copy_from_slice(&data);
            Ok(())
        })
    }

    pub fn enqueue_fill<T: Sample>(
        &self,
        buffer: &DeviceBuffer<T>,
        value: T,
        offset: usize,
        len: usize,
    ) -> Result<Event> {
        check_range("fill destination", buffer, offset, len)?;
        let buffer = buffer.clone();
        self.submit("fill buffer", move || {
            let mut storage = buffer.storage().write();
            storage[offset..offset + len].fill(value);
            Ok(())
        })
    }

    pub fn enqueue_copy<T: Sample>(
        &self,
        source: &DeviceBuffer<T>,
        destination: &DeviceBuffer<T>,
        source_offset: usize,
        destination_offset: usize,
        len: usize,
    ) -> Result<Event> {
        check_range("copy source", source, source_offset, len)?;
        check_range("copy destination", destination, destination_offset, len)?;
        let source = source.clone();
        let destination = destination.clone();
        self.submit("copy buffer", move || {
            if source.same_buffer(&destination) {
                let mut storage = destination.storage().write();
                storage.copy_within(source_offset..source_offset + len, destination_offset);
            } else {
                let from = source.storage().read();
                let mut to = destination.storage().write();
                to[destination_offset..destination_offset + len]
                    .copy_from_slice(&from[source_offset..source_offset + len]);
            }
            Ok(())
        })
    }

    /// Blocking read of `len` elements starting at `offset`.
    pub fn read_buffer<T: Sample>(
        &self,
        buffer: &DeviceBuffer<T>,
        offset: usize,
        len: usize,
    ) -> Result<Vec<T>> {
        check_range("read source", buffer, offset, len)?;
        let (sender, receiver) = channel::bounded(1);
        let source = buffer.clone();
        let event = self.submit("read buffer", move || {
            let storage = source.storage().read();
            let _ = sender.send(storage[offset..offset + len].to_vec());
            Ok(())
        })?;
        event.wait()?;
        receiver.recv().map_err(|_| {
            ComputeError::device(DeviceStatus::ExecutionFailure, "read buffer")
        })
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        let _ = self.sender.send(Message::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("Command queue worker panicked");
            }
        }
    }
}

fn run_worker(receiver: Receiver<Message>, failure: Arc<Mutex<Option<ComputeError>>>) {
    for message in receiver {
        match message {
            Message::Run { label, task, event } => match task() {
                Ok(()) => event.complete(),
                Err(err) => {
                    log::error!("Queued command '{}' failed: {}", label, err);
                    let mut slot = failure.lock();
                    if slot.is_none() {
                        *slot = Some(err);
                    }
                    drop(slot);
                    event.fail();
                }
            },
            Message::Shutdown => break,
        }
    }
}

fn check_range<T: Sample>(
    what: &str,
    buffer: &DeviceBuffer<T>,
    offset: usize,
    len: usize,
) -> Result<()> {
    let element = std::mem::size_of::<T>();
    ComputeError::check_size(what, (offset + len) * element, buffer.len() * element)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HostDeviceOptions;
    use std::sync::atomic::AtomicBool;

    fn device() -> Arc<Device> {
        Device::open(0, 0, &HostDeviceOptions::default()).unwrap()
    }

    #[test]
    fn test_commands_run_in_submission_order() {
        let device = device();
        let queue = CommandQueue::new(&device).unwrap();
        let a = DeviceBuffer::<f32>::with_len(&device, 4).unwrap();
        let b = DeviceBuffer::<f32>::with_len(&device, 4).unwrap();

        queue.enqueue_write(&a, 0, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        queue.enqueue_copy(&a, &b, 1, 0, 3).unwrap();
        queue.enqueue_fill(&a, 0.0, 0, 4).unwrap();

        assert_eq!(queue.read_buffer(&b, 0, 4).unwrap(), vec![2.0, 3.0, 4.0, 0.0]);
        assert_eq!(queue.read_buffer(&a, 0, 4).unwrap(), vec![0.0; 4]);
        queue.finish().unwrap();
    }

    #[test]
    fn test_out_of_range_write_is_rejected_before_submission() {
        let device = device();
        let queue = CommandQueue::new(&device).unwrap();
        let buffer = DeviceBuffer::<f64>::with_len(&device, 2).unwrap();

        let before = queue.submitted_commands();
        let err = queue.enqueue_write(&buffer, 1, vec![1.0, 2.0]).unwrap_err();
        assert!(matches!(err, ComputeError::Size { .. }));
        assert_eq!(queue.submitted_commands(), before);
    }

    #[test]
    fn test_user_event_completed_from_callback() {
        let device = device();
        let queue = CommandQueue::new(&device).unwrap();
        let ready = Event::user();
        let flag = Arc::new(AtomicBool::new(false));

        let marker = queue.enqueue_marker().unwrap();
        let user = ready.clone();
        let seen = Arc::clone(&flag);
        marker.on_complete(move |_| {
            seen.store(true, Ordering::SeqCst);
            user.complete();
        });

        ready.wait().unwrap();
        assert!(flag.load(Ordering::SeqCst));
        assert_eq!(ready.status(), EventStatus::Complete);
    }

    #[test]
    fn test_failed_command_is_reported_by_finish() {
        let device = device();
        let queue = CommandQueue::new(&device).unwrap();
        let event = queue
            .submit("failing", || {
                Err(ComputeError::InvalidParameter("boom".to_string()))
            })
            .unwrap();

        assert!(event.wait().is_err());
        assert!(queue.finish().is_err());
        queue.finish().unwrap();
    }
}

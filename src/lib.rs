use defer_heavy::defer;
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt::{Debug, Formatter};
use std::io;
use std::panic::resume_unwind;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use std::{mem, thread};
use thiserror::Error;

/// Errors of the dispatch mechanism itself.
///
/// Fetch work never fails in this crate; the only thing that can go wrong is
/// asking for a queue where none exists.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Error)]
pub enum DispatchError {
    /// The calling thread does not run a [DispatchLoop], so there is no
    /// message queue that could receive posts.
    #[error("no message queue is attached to the current thread")]
    NoQueue,
}

type Task<S> = Box<dyn FnOnce(&mut S) + Send>;

struct Envelope<S> {
    due: Instant,
    seq: u64,
    task: Task<S>,
}

impl<S> Debug for Envelope<S> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Envelope")
            .field("due", &self.due)
            .field("seq", &self.seq)
            .finish()
    }
}

impl<S> PartialEq for Envelope<S> {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl<S> Eq for Envelope<S> {}

impl<S> PartialOrd for Envelope<S> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<S> Ord for Envelope<S> {
    // Inverted so the BinaryHeap yields the earliest (due, seq) pair first.
    fn cmp(&self, other: &Self) -> Ordering {
        other.due.cmp(&self.due).then(other.seq.cmp(&self.seq))
    }
}

#[derive(Debug)]
struct Queue<S> {
    pending: BinaryHeap<Envelope<S>>,
    next_seq: u64,
    terminated: bool,
}

#[derive(Debug)]
struct Shared<S> {
    queue: Mutex<Queue<S>>,
    cond: Condvar,
}

///
/// A post endpoint for a [DispatchLoop].
///
/// Handles are cheap to clone and may be sent to any thread. They hold only a
/// weak reference to the loop: a handle never keeps a torn-down loop alive,
/// and posting to one is a silent no-op.
///
#[derive(Debug)]
pub struct Handle<S: Send + 'static>(Weak<Shared<S>>);

impl<S: Send + 'static> Clone for Handle<S> {
    fn clone(&self) -> Self {
        Handle(self.0.clone())
    }
}

thread_local! {
    static CURRENT_HANDLE: RefCell<Option<Box<dyn Any>>> = RefCell::new(None);
}

impl<S: Send + 'static> Handle<S> {
    /// Enqueue a task for execution on the loop thread.
    ///
    /// Tasks posted from one thread execute in the order they were posted,
    /// and never concurrently with each other. The task runs with exclusive
    /// access to the loop state; it is the only way to reach that state.
    ///
    /// If the loop has been shut down or dropped the task is discarded.
    pub fn post(&self, task: impl FnOnce(&mut S) + Send + 'static) {
        self.post_delayed(task, Duration::ZERO);
    }

    /// Enqueue a task for execution no earlier than `delay` from now.
    ///
    /// Delayed tasks are ordered by their due time; ties are broken by post
    /// order. A delayed task that is not yet due when the loop shuts down is
    /// discarded.
    pub fn post_delayed(&self, task: impl FnOnce(&mut S) + Send + 'static, delay: Duration) {
        let Some(shared) = self.0.upgrade() else {
            log::debug!("post dropped, the message loop is gone");
            return;
        };

        let mut queue = shared.queue.lock();
        if queue.terminated {
            log::debug!("post dropped, the message loop is terminated");
            return;
        }

        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.pending.push(Envelope {
            due: Instant::now() + delay,
            seq,
            task: Box::new(task),
        });
        drop(queue);
        shared.cond.notify_all();
    }

    /// The handle of the loop that runs the calling thread.
    ///
    /// # Errors
    /// [DispatchError::NoQueue] if the calling thread runs no loop, or one
    /// with a different state type. A plain worker thread has no queue that
    /// could receive posts; this is an explicit failure, never a silent one.
    pub fn current() -> Result<Self, DispatchError> {
        CURRENT_HANDLE.with(|slot| {
            slot.borrow()
                .as_ref()
                .and_then(|any| any.downcast_ref::<Handle<S>>())
                .cloned()
                .ok_or(DispatchError::NoQueue)
        })
    }
}

///
/// A single-consumer message loop owning a piece of loop-local state.
///
/// One dedicated thread pops posted tasks in order and runs each with
/// `&mut S`. Since the state is moved into the loop at spawn and handed out
/// only to tasks executing there, no other thread can ever touch it. Display
/// state of the fetch chains lives here, which makes the single-writer rule
/// a property of the types rather than a runtime check.
///
#[derive(Debug)]
pub struct DispatchLoop<S: Send + 'static> {
    shared: Arc<Shared<S>>,
    thread: Option<JoinHandle<S>>,
}

impl<S: Send + 'static> DispatchLoop<S> {
    /// Spawn a named loop thread that owns `state`.
    ///
    /// # Errors
    /// Propagates the OS error if the thread cannot be spawned.
    pub fn spawn(name: &str, state: S) -> Result<Self, io::Error> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                pending: BinaryHeap::new(),
                next_seq: 0,
                terminated: false,
            }),
            cond: Condvar::new(),
        });

        let scl = shared.clone();
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run_loop(scl, state))?;

        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> Handle<S> {
        Handle(Arc::downgrade(&self.shared))
    }

    /// Stop the loop and return the final state.
    ///
    /// Tasks that are already due still run before the loop exits; delayed
    /// tasks that are not yet due are discarded. Posts issued after this call
    /// are discarded silently.
    ///
    /// # Panics
    /// Resumes the panic of any task that unwound the loop thread.
    pub fn shutdown(mut self) -> S {
        self.terminate();
        if let Some(thread) = self.thread.take() {
            return match thread.join() {
                Ok(state) => state,
                Err(panic) => resume_unwind(panic),
            };
        }
        panic!("loop thread already joined");
    }

    fn terminate(&self) {
        let mut queue = self.shared.queue.lock();
        queue.terminated = true;
        drop(queue);
        self.shared.cond.notify_all();
    }
}

impl<S: Send + 'static> Drop for DispatchLoop<S> {
    fn drop(&mut self) {
        self.terminate();
        if let Some(thread) = self.thread.take() {
            _ = thread.join();
        }
    }
}

fn run_loop<S: Send + 'static>(shared: Arc<Shared<S>>, mut state: S) -> S {
    let handle: Handle<S> = Handle(Arc::downgrade(&shared));
    CURRENT_HANDLE.with(|slot| *slot.borrow_mut() = Some(Box::new(handle)));
    defer! {
        CURRENT_HANDLE.with(|slot| *slot.borrow_mut() = None);
    }

    loop {
        let task = {
            let mut queue = shared.queue.lock();
            loop {
                let now = Instant::now();
                match queue.pending.peek().map(|env| env.due) {
                    Some(due) if due <= now => {
                        if let Some(env) = queue.pending.pop() {
                            break env.task;
                        }
                    }
                    Some(due) => {
                        if queue.terminated {
                            return state;
                        }
                        _ = shared.cond.wait_until(&mut queue, due);
                    }
                    None => {
                        if queue.terminated {
                            return state;
                        }
                        shared.cond.wait(&mut queue);
                    }
                }
            }
        };

        log::trace!("message loop executing a task");
        task(&mut state);
    }
}

///
/// The outcome a stage delivers to its consumer.
///
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Completion<T> {
    /// Another consumer already took the value.
    Taken,
    /// The supplier of the stage panicked.
    Panic,
    Value(T),
}

impl<T> Completion<T> {
    pub fn unwrap(self) -> T {
        match self {
            Completion::Taken => panic!("unwrap called on Taken Completion"),
            Completion::Panic => panic!("unwrap called on Panic Completion"),
            Completion::Value(v) => v,
        }
    }

    pub fn some(self) -> Option<T> {
        match self {
            Completion::Value(v) => Some(v),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum GetTimeoutResult<T> {
    /// The call would have needed to block longer than intended.
    TimedOut,
    /// The value was already taken out of the stage.
    Taken,
    /// The supplier of the stage panicked.
    Panic,
    /// The completed value from the stage.
    Value(T),
}

impl<T> GetTimeoutResult<T> {
    pub fn unwrap(self) -> T {
        match self {
            GetTimeoutResult::TimedOut => panic!("unwrap called on TimedOut"),
            GetTimeoutResult::Taken => panic!("unwrap called on Taken"),
            GetTimeoutResult::Panic => panic!("unwrap called on Panic"),
            GetTimeoutResult::Value(v) => v,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum TryResult<T> {
    /// The stage has not completed yet.
    WouldBlock,
    /// The value was already taken out of the stage.
    Taken,
    /// The completed value from the stage.
    Value(T),
}

#[derive(Debug)]
enum CellValue<T> {
    Empty,
    Taken,
    Panicked,
    Value(T),
}

impl<T> CellValue<T> {
    fn take(&mut self) -> CellValue<T> {
        match self {
            CellValue::Empty => CellValue::Empty,
            CellValue::Taken => CellValue::Taken,
            CellValue::Panicked => CellValue::Panicked,
            CellValue::Value(_) => mem::replace(self, CellValue::Taken),
        }
    }
}

enum Taker<T: Send> {
    None,
    Some(Box<dyn FnOnce(Completion<T>) + Send>),
    Closed,
}

impl<T: Send> Debug for Taker<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Taker::None => f.write_str("None"),
            Taker::Some(_) => f.write_str("Some"),
            Taker::Closed => f.write_str("Closed"),
        }
    }
}

impl<T: Send> Taker<T> {
    fn is_none(&self) -> bool {
        matches!(self, Taker::None)
    }

    fn take(&mut self) -> Option<Box<dyn FnOnce(Completion<T>) + Send>> {
        if let Taker::Some(fbox) = mem::replace(self, Taker::Closed) {
            return Some(fbox);
        }

        None
    }
}

#[derive(Debug)]
struct StageState<T: Send> {
    cell: CellValue<T>,
    taker: Taker<T>,
}

#[derive(Debug)]
struct StageInner<T: Send> {
    completed: AtomicBool,
    state: Mutex<StageState<T>>,
    cond: Condvar,
}

///
/// A push-based, single-consumer completion cell.
///
/// A stage is completed exactly once, from any thread, and hands the value to
/// at most one consumer. This is the hand-off half of the fetch machinery: a
/// worker completes the stage, and the registered continuation runs either on
/// the completing thread ([Stage::then_run]) or marshalled onto a message
/// loop ([Stage::then_run_on]).
///
#[derive(Debug)]
pub struct Stage<T: Send + 'static>(Arc<StageInner<T>>);

impl<T: Send + 'static> Clone for Stage<T> {
    fn clone(&self) -> Self {
        Stage(self.0.clone())
    }
}

fn complete_inner<T: Send + 'static>(
    inner: &Arc<StageInner<T>>,
    data: Completion<T>,
) -> Option<Completion<T>> {
    if inner.completed.load(SeqCst) {
        return Some(data);
    }

    let mut state = inner.state.lock();
    if inner.completed.swap(true, SeqCst) {
        return Some(data);
    }

    if let Some(taker) = state.taker.take() {
        state.cell = CellValue::Taken;
        drop(state);
        inner.cond.notify_all();
        taker(data);
        return None;
    }

    state.cell = match data {
        Completion::Taken => CellValue::Taken,
        Completion::Panic => CellValue::Panicked,
        Completion::Value(v) => CellValue::Value(v),
    };
    drop(state);
    inner.cond.notify_all();
    None
}

fn complete_on_panic<T: Send + 'static>(inner: &Arc<StageInner<T>>) {
    if thread::panicking() {
        complete_inner(inner, Completion::Panic);
    }
}

impl<T: Send + 'static> Stage<T> {
    pub fn new() -> Self {
        Self(Arc::new(StageInner {
            completed: Default::default(),
            state: Mutex::new(StageState {
                cell: CellValue::Empty,
                taker: Taker::None,
            }),
            cond: Condvar::new(),
        }))
    }

    pub fn new_completed_value(data: T) -> Self {
        Self(Arc::new(StageInner {
            completed: AtomicBool::new(true),
            state: Mutex::new(StageState {
                cell: CellValue::Value(data),
                taker: Taker::Closed,
            }),
            cond: Condvar::new(),
        }))
    }

    ///
    /// Create a stage that completes when the executor has finished running
    /// the supplier. A panicking supplier completes the stage with
    /// [Completion::Panic].
    ///
    /// The supplier always runs to completion once started, even if every
    /// consumer of the stage is gone by then.
    ///
    pub fn supply_async<E: InfallibleExecutor>(
        supplier: impl FnOnce() -> T + Send + 'static,
    ) -> Self {
        let stage = Stage::new();
        let inner = stage.0.clone();
        E::execute(move || {
            defer! {
                complete_on_panic(&inner)
            }
            complete_inner(&inner, Completion::Value(supplier()));
        });
        stage
    }

    ///
    /// Create a stage that completes when the executor has finished running
    /// the supplier.
    ///
    /// # Errors
    /// The executor may refuse execution, e.g. when the OS cannot spawn
    /// another thread. That error is propagated and no supplier runs.
    ///
    pub fn supply_async_with_error<E: FallibleExecutor<R>, R>(
        supplier: impl FnOnce() -> T + Send + 'static,
    ) -> Result<Self, R> {
        let stage = Stage::new();
        let inner = stage.0.clone();
        E::execute(move || {
            defer! {
                complete_on_panic(&inner)
            }
            complete_inner(&inner, Completion::Value(supplier()));
        })?;
        Ok(stage)
    }

    /// Complete this stage with the given value.
    ///
    /// # Returns
    /// - None if the call completed the stage.
    /// - Some with the input if the stage was already completed.
    ///
    /// # Triggers Execution
    /// The registered consumer may run in the current thread before this
    /// function returns.
    pub fn complete_with_value(&self, data: T) -> Option<T> {
        if let Some(Completion::Value(v)) = complete_inner(&self.0, Completion::Value(data)) {
            return Some(v);
        }

        None
    }

    /// Complete this stage with the given completion.
    ///
    /// # Returns
    /// - None if the call completed the stage.
    /// - Some with the input if the stage was already completed.
    pub fn complete(&self, data: Completion<T>) -> Option<Completion<T>> {
        complete_inner(&self.0, data)
    }

    ///
    /// Register the single consumer of this stage.
    ///
    /// If the stage is already completed the closure runs immediately in the
    /// current thread; otherwise it runs in the thread that completes the
    /// stage. A consumer registered after another one observes
    /// [Completion::Taken] immediately.
    ///
    pub fn then_run(&self, func: impl FnOnce(Completion<T>) + Send + 'static) -> &Self {
        let mut state = self.0.state.lock();
        if self.0.completed.load(SeqCst) {
            let taken = state.cell.take();
            drop(state);
            match taken {
                CellValue::Empty => panic!("stage marked completed with an empty cell"),
                CellValue::Taken => func(Completion::Taken),
                CellValue::Panicked => func(Completion::Panic),
                CellValue::Value(v) => func(Completion::Value(v)),
            }
            return self;
        }

        if !state.taker.is_none() {
            drop(state);
            func(Completion::Taken);
            return self;
        }

        state.taker = Taker::Some(Box::new(func));
        self
    }

    ///
    /// Register the single consumer of this stage and run it on the given
    /// message loop.
    ///
    /// This is the resume-on-context primitive: whichever thread completes
    /// the stage, the closure executes on the loop thread with access to the
    /// loop state, ordered like any other post. If the loop is gone by then
    /// the continuation is silently dropped.
    ///
    pub fn then_run_on<S: Send + 'static>(
        &self,
        handle: &Handle<S>,
        func: impl FnOnce(&mut S, Completion<T>) + Send + 'static,
    ) -> &Self {
        let handle = handle.clone();
        self.then_run(move |completion| {
            handle.post(move |state| func(state, completion));
        })
    }

    ///
    /// Create a child stage that completes with the closure's result, where
    /// the closure runs on the given message loop. `Taken` and `Panic`
    /// completions propagate to the child without running the closure, and a
    /// panicking closure completes the child with [Completion::Panic] before
    /// the loop thread unwinds.
    ///
    pub fn then_apply_on<S: Send + 'static, X: Send + 'static>(
        &self,
        handle: &Handle<S>,
        func: impl FnOnce(&mut S, T) -> X + Send + 'static,
    ) -> Stage<X> {
        let next = Stage::new();
        let next_inner = next.0.clone();
        self.then_run_on(handle, move |state, completion| {
            defer! {
                complete_on_panic(&next_inner)
            }
            let mapped = match completion {
                Completion::Taken => Completion::Taken,
                Completion::Panic => Completion::Panic,
                Completion::Value(v) => Completion::Value(func(state, v)),
            };
            complete_inner(&next_inner, mapped);
        });
        next
    }

    ///
    /// Create a child stage that completes when the stage produced by the
    /// closure completes. The closure runs on whichever thread completes
    /// this stage.
    ///
    pub fn then_compose<X: Send + 'static>(
        &self,
        func: impl FnOnce(T) -> Stage<X> + Send + 'static,
    ) -> Stage<X> {
        let next = Stage::new();
        let ncl = next.clone();
        self.then_run(move |completion| match completion {
            Completion::Taken => {
                _ = ncl.complete(Completion::Taken);
            }
            Completion::Panic => {
                _ = ncl.complete(Completion::Panic);
            }
            Completion::Value(v) => {
                func(v).then_run(move |inner| {
                    _ = ncl.complete(inner);
                });
            }
        });
        next
    }

    /// Blocks until the stage is complete and takes the value out of it.
    ///
    /// # Panics
    /// if the supplier of this stage panicked.
    ///
    /// # Returns
    /// - Some if the value was taken from the stage.
    /// - None if the value was already consumed.
    pub fn take(&self) -> Option<T> {
        let mut state = self.0.state.lock();
        loop {
            match state.cell.take() {
                CellValue::Empty => (),
                CellValue::Taken => return None,
                CellValue::Panicked => panic!("supplier panicked"),
                CellValue::Value(v) => return Some(v),
            }
            self.0.cond.wait(&mut state);
        }
    }

    /// Takes the value from the stage if it has been completed, without
    /// blocking.
    ///
    /// # Panics
    /// if the supplier of this stage panicked.
    pub fn try_take(&self) -> TryResult<T> {
        if !self.0.completed.load(SeqCst) {
            return TryResult::WouldBlock;
        }

        let taken = self.0.state.lock().cell.take();
        match taken {
            CellValue::Empty => TryResult::WouldBlock,
            CellValue::Taken => TryResult::Taken,
            CellValue::Panicked => panic!("supplier panicked"),
            CellValue::Value(v) => TryResult::Value(v),
        }
    }

    ///
    /// Same as calling take().unwrap.
    ///
    pub fn unwrap(&self) -> T {
        self.take().expect("value already taken from stage")
    }

    /// Take the value out of the stage without panicking.
    ///
    /// This function may block roughly for the given duration while the stage
    /// finishes completing.
    pub fn get_timeout(&self, timeout: Duration) -> GetTimeoutResult<T> {
        self.get_until(Instant::now() + timeout)
    }

    /// Take the value out of the stage without panicking, blocking roughly
    /// until the given instant.
    pub fn get_until(&self, until: Instant) -> GetTimeoutResult<T> {
        let mut state = self.0.state.lock();
        loop {
            match state.cell.take() {
                CellValue::Empty => (),
                CellValue::Taken => return GetTimeoutResult::Taken,
                CellValue::Panicked => return GetTimeoutResult::Panic,
                CellValue::Value(v) => return GetTimeoutResult::Value(v),
            }
            if self.0.cond.wait_until(&mut state, until).timed_out() {
                return GetTimeoutResult::TimedOut;
            }
        }
    }

    /// Returns true if the stage is either completed or completion is
    /// immediately imminent.
    pub fn completed(&self) -> bool {
        self.0.completed.load(SeqCst)
    }
}

impl<T: Send + 'static> Default for Stage<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Static Executor that can only fail to execute something by panicking.
pub trait InfallibleExecutor {
    fn execute(task: impl FnOnce() + Send + 'static);
}

/// Static Executor that can fail with a given error when trying to execute
/// something. Error refers to an OS error like "I cannot spawn more threads"
/// rather than any error the task may produce.
pub trait FallibleExecutor<R> {
    fn execute(task: impl FnOnce() + Send + 'static) -> Result<(), R>;
}

impl InfallibleExecutor for thread::Thread {
    fn execute(task: impl FnOnce() + Send + 'static) {
        thread::spawn(task);
    }
}

impl FallibleExecutor<io::Error> for thread::Builder {
    fn execute(task: impl FnOnce() + Send + 'static) -> Result<(), io::Error> {
        thread::Builder::new().spawn(task).map(|_| ())
    }
}

///
/// The display surface the fetch chains drive.
///
/// The crate only ever calls these; it never owns an implementation. The
/// implementation is the loop state of a [DispatchLoop], so every mutation
/// happens on the loop thread.
///
pub trait UiSurface {
    fn set_busy(&mut self, busy: bool);
    fn set_trigger_enabled(&mut self, enabled: bool);
    fn set_field_a(&mut self, value: &str);
    fn set_field_b(&mut self, value: &str);
    fn show_transient_notice(&mut self, message: &str);
}

/// Simulated city lookup: sleeps for `latency`, then produces the city name.
pub fn fetch_city(latency: Duration) -> String {
    thread::sleep(latency);
    log::trace!("city fetched");
    "Moscow".to_string()
}

/// Simulated temperature lookup for `city`: sleeps for `latency`, then
/// produces the reading.
pub fn fetch_temperature(city: &str, latency: Duration) -> i32 {
    thread::sleep(latency);
    log::trace!("temperature fetched for {city}");
    17
}

fn temperature_notice(city: &str) -> String {
    format!("loading temperature for {city}")
}

///
/// Run the two-step fetch as nested callbacks.
///
/// Each fetch runs on a fresh worker via `E`; its result is posted back to
/// the loop, where the next callback fires and updates the display. The
/// returned stage completes with `(city, temperature)` once the run is done
/// and the trigger has been re-enabled.
///
pub fn load_with_callbacks<S, E>(handle: &Handle<S>, latency: Duration) -> Stage<(String, i32)>
where
    S: UiSurface + Send + 'static,
    E: InfallibleExecutor,
{
    let chain = Stage::new();
    let done = chain.clone();
    let outer = handle.clone();
    handle.post(move |ui| {
        log::debug!("load started (callback form)");
        ui.set_busy(true);
        ui.set_trigger_enabled(false);
        let inner = outer.clone();
        load_city_async::<S, E>(&outer, latency, move |ui, city| {
            ui.set_field_a(&city);
            let loaded = city.clone();
            load_temperature_async::<S, E>(&inner, latency, city, move |ui, temperature| {
                ui.set_field_b(&temperature.to_string());
                ui.set_busy(false);
                ui.set_trigger_enabled(true);
                log::debug!("load finished (callback form)");
                _ = done.complete_with_value((loaded, temperature));
            });
        });
    });
    chain
}

fn load_city_async<S, E>(
    handle: &Handle<S>,
    latency: Duration,
    callback: impl FnOnce(&mut S, String) + Send + 'static,
) where
    S: UiSurface + Send + 'static,
    E: InfallibleExecutor,
{
    let handle = handle.clone();
    E::execute(move || {
        let city = fetch_city(latency);
        handle.post(move |ui| callback(ui, city));
    });
}

fn load_temperature_async<S, E>(
    handle: &Handle<S>,
    latency: Duration,
    city: String,
    callback: impl FnOnce(&mut S, i32) + Send + 'static,
) where
    S: UiSurface + Send + 'static,
    E: InfallibleExecutor,
{
    let handle = handle.clone();
    E::execute(move || {
        // The notice goes through the loop as well; widgets are never touched
        // from a worker. Same producer, so it lands before the result post.
        let notice = temperature_notice(&city);
        handle.post(move |ui| ui.show_transient_notice(&notice));
        let temperature = fetch_temperature(&city, latency);
        handle.post(move |ui| callback(ui, temperature));
    });
}

///
/// One run of the fetch chain, spelled out as explicit states.
///
/// [Step::FetchingB] carries the city it is fetching for; [Step::Done]
/// carries the full outcome.
///
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum Step {
    FetchingA,
    HaveA(String),
    FetchingB(String),
    Done(String, i32),
}

/// A fetch result arriving at the state machine.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum StepEvent {
    CityLoaded(String),
    TemperatureLoaded(i32),
}

///
/// The pure transition function of the step machine.
///
/// # Panics
/// On any state/event pair that a run cannot produce. The chain is strictly
/// sequential, so an invalid pair means the driver is broken.
///
pub fn advance(step: Step, event: StepEvent) -> Step {
    match (step, event) {
        (Step::FetchingA, StepEvent::CityLoaded(city)) => Step::HaveA(city),
        (Step::FetchingB(city), StepEvent::TemperatureLoaded(temperature)) => {
            Step::Done(city, temperature)
        }
        (step, event) => panic!("invalid transition from {step:?} on {event:?}"),
    }
}

///
/// Run the two-step fetch as an explicit state machine.
///
/// No worker threads: the fetch latency is modelled with delayed posts on the
/// loop itself, and each delayed post advances the machine via [advance].
/// Observably equivalent to [load_with_callbacks].
///
pub fn load_with_steps<S>(handle: &Handle<S>, latency: Duration) -> Stage<(String, i32)>
where
    S: UiSurface + Send + 'static,
{
    let chain = Stage::new();
    let done = chain.clone();
    let h = handle.clone();
    handle.post(move |ui| {
        log::debug!("load started (step form)");
        ui.set_busy(true);
        ui.set_trigger_enabled(false);
        drive(Step::FetchingA, &h, ui, latency, done);
    });
    chain
}

fn drive<S>(
    step: Step,
    handle: &Handle<S>,
    ui: &mut S,
    latency: Duration,
    done: Stage<(String, i32)>,
) where
    S: UiSurface + Send + 'static,
{
    match step {
        Step::FetchingA => {
            let h = handle.clone();
            handle.post_delayed(
                move |ui| {
                    let city = fetch_city(Duration::ZERO);
                    let next = advance(Step::FetchingA, StepEvent::CityLoaded(city));
                    drive(next, &h, ui, latency, done);
                },
                latency,
            );
        }
        Step::HaveA(city) => {
            ui.set_field_a(&city);
            ui.show_transient_notice(&temperature_notice(&city));
            let h = handle.clone();
            let pending = Step::FetchingB(city.clone());
            handle.post_delayed(
                move |ui| {
                    let temperature = fetch_temperature(&city, Duration::ZERO);
                    let next = advance(pending, StepEvent::TemperatureLoaded(temperature));
                    drive(next, &h, ui, latency, done);
                },
                latency,
            );
        }
        Step::FetchingB(_) => {
            // In-flight marker only; the delayed post advances past it.
        }
        Step::Done(city, temperature) => {
            ui.set_field_b(&temperature.to_string());
            ui.set_busy(false);
            ui.set_trigger_enabled(true);
            log::debug!("load finished (step form)");
            _ = done.complete_with_value((city, temperature));
        }
    }
}

///
/// Run the two-step fetch as a linear stage pipeline.
///
/// Reads top to bottom like a sequential routine: the two supply calls are
/// the suspension points, and every continuation resumes on the loop thread.
/// Observably equivalent to the other two forms.
///
pub fn load_with_stages<S, E>(handle: &Handle<S>, latency: Duration) -> Stage<(String, i32)>
where
    S: UiSurface + Send + 'static,
    E: InfallibleExecutor,
{
    handle.post(|ui| {
        log::debug!("load started (stage form)");
        ui.set_busy(true);
        ui.set_trigger_enabled(false);
    });

    Stage::supply_async::<E>(move || fetch_city(latency))
        .then_apply_on(handle, |ui, city| {
            ui.set_field_a(&city);
            ui.show_transient_notice(&temperature_notice(&city));
            city
        })
        .then_compose(move |city| {
            Stage::supply_async::<E>(move || {
                let temperature = fetch_temperature(&city, latency);
                (city, temperature)
            })
        })
        .then_apply_on(handle, |ui, (city, temperature)| {
            ui.set_field_b(&temperature.to_string());
            ui.set_busy(false);
            ui.set_trigger_enabled(true);
            log::debug!("load finished (stage form)");
            (city, temperature)
        })
}

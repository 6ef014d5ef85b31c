//! Typed, buffered event logging.
//!
//! A [`Logger`] timestamps events relative to a shared origin and buffers them, handing full
//! batches to an action closure. When the last handle to a logger is dropped the remaining
//! events are flushed and the action is called once more with an empty batch, which marks
//! the end of the stream.
//!
//! A [`Registry`] maps names to loggers so that independent components can find the logger
//! for the events they produce.
//!
//! ```
//! use std::rc::Rc;
//! use std::cell::RefCell;
//! use std::time::Instant;
//! use weft_logging::Registry;
//!
//! let seen = Rc::new(RefCell::new(Vec::new()));
//! let sink = Rc::clone(&seen);
//!
//! let mut registry = Registry::new(Instant::now());
//! registry.insert::<String, _>("text", move |_time, batch| {
//!     sink.borrow_mut().extend(batch.drain(..).map(|(_, event)| event));
//! });
//!
//! let logger = registry.get::<String>("text").expect("registered above");
//! logger.log("hello".to_string());
//! logger.flush();
//! assert_eq!(seen.borrow().as_slice(), &["hello".to_string()]);
//! ```

#![forbid(missing_docs)]

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Events buffered before an action is invoked.
const BUFFER_CAPACITY: usize = 1024;

/// A map from names to typed loggers.
pub struct Registry {
    /// Common origin for all loggers created through the registry.
    time: Instant,
    /// Type-erased loggers, and a handle able to flush each of them.
    map: HashMap<String, (Box<dyn Any>, Box<dyn Flush>)>,
}

impl Registry {
    /// Creates an empty registry whose loggers measure time from `time`.
    pub fn new(time: Instant) -> Self {
        Registry { time, map: HashMap::new() }
    }

    /// Binds a new logger for events of type `T` to `name`, returning any previous binding.
    pub fn insert<T: 'static, F: FnMut(&Duration, &mut Vec<(Duration, T)>)+'static>(
        &mut self,
        name: &str,
        action: F) -> Option<Box<dyn Any>>
    {
        let logger = Logger::<T>::new(self.time, Duration::default(), action);
        self.insert_logger(name, logger)
    }

    /// Binds an existing logger to `name`, returning any previous binding.
    pub fn insert_logger<T: 'static>(&mut self, name: &str, logger: Logger<T>) -> Option<Box<dyn Any>> {
        let flush = Box::new(logger.clone());
        self.map.insert(name.to_owned(), (Box::new(logger), flush)).map(|(any, _)| any)
    }

    /// Removes the binding for `name`.
    ///
    /// The logger itself keeps running until its last handle is dropped.
    pub fn remove(&mut self, name: &str) -> Option<Box<dyn Any>> {
        self.map.remove(name).map(|(any, _)| any)
    }

    /// Retrieves a handle to the logger bound to `name`, if its event type is `T`.
    pub fn get<T: 'static>(&self, name: &str) -> Option<Logger<T>> {
        self.map
            .get(name)
            .and_then(|(any, _)| any.downcast_ref::<Logger<T>>())
            .cloned()
    }

    /// Flushes every registered logger.
    pub fn flush(&mut self) {
        for (_, flush) in self.map.values() {
            flush.flush();
        }
    }
}

/// A buffering logger for events of type `T`.
///
/// Handles are cheap to clone and share one buffer.
pub struct Logger<T> {
    inner: Rc<RefCell<LoggerInner<T, dyn FnMut(&Duration, &mut Vec<(Duration, T)>)>>>,
}

impl<T> Clone for Logger<T> {
    fn clone(&self) -> Self {
        Logger { inner: Rc::clone(&self.inner) }
    }
}

impl<T> std::fmt::Debug for Logger<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logger").field("pending", &self.inner.borrow().buffer.len()).finish()
    }
}

struct LoggerInner<T, A: ?Sized + FnMut(&Duration, &mut Vec<(Duration, T)>)> {
    /// Origin of event timestamps.
    time: Instant,
    /// Added to every timestamp, to align loggers started at different moments.
    offset: Duration,
    buffer: Vec<(Duration, T)>,
    action: A,
}

impl<T: 'static> Logger<T> {
    /// Allocates a logger that hands batches of timestamped events to `action`.
    pub fn new<F>(time: Instant, offset: Duration, action: F) -> Self
    where
        F: FnMut(&Duration, &mut Vec<(Duration, T)>)+'static
    {
        let inner = LoggerInner {
            time,
            offset,
            buffer: Vec::with_capacity(BUFFER_CAPACITY),
            action,
        };
        let inner = Rc::new(RefCell::new(inner));
        Logger { inner }
    }
}

impl<T> Logger<T> {
    /// Records one event.
    pub fn log<S: Into<T>>(&self, event: S) {
        self.log_many(Some(event));
    }

    /// Records a sequence of events, sharing one timestamp.
    pub fn log_many<S: Into<T>, I: IntoIterator<Item=S>>(&self, events: I) {
        self.inner.borrow_mut().log_many(events)
    }

    /// Hands buffered events to the action.
    pub fn flush(&self) {
        self.inner.borrow_mut().flush()
    }
}

impl<T, A: ?Sized + FnMut(&Duration, &mut Vec<(Duration, T)>)> LoggerInner<T, A> {
    fn log_many<S: Into<T>, I: IntoIterator<Item=S>>(&mut self, events: I) {
        let elapsed = self.time.elapsed() + self.offset;
        for event in events {
            self.buffer.push((elapsed, event.into()));
            if self.buffer.len() >= BUFFER_CAPACITY {
                (self.action)(&elapsed, &mut self.buffer);
                self.buffer.clear();
            }
        }
    }

    fn flush(&mut self) {
        let elapsed = self.time.elapsed() + self.offset;
        if !self.buffer.is_empty() {
            (self.action)(&elapsed, &mut self.buffer);
            self.buffer.clear();
        }
    }
}

impl<T, A: ?Sized + FnMut(&Duration, &mut Vec<(Duration, T)>)> Drop for LoggerInner<T, A> {
    fn drop(&mut self) {
        self.flush();
        // An empty batch announces that no further events will arrive.
        let elapsed = self.time.elapsed() + self.offset;
        (self.action)(&elapsed, &mut Vec::new());
    }
}

/// Types that can be flushed without knowing their event type.
trait Flush {
    fn flush(&self);
}

impl<T> Flush for Logger<T> {
    fn flush(&self) {
        Logger::flush(self)
    }
}

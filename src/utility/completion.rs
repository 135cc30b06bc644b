//! One-shot result slot shared between an operation and its canceller.

use parking_lot::Mutex;

type Handler<T> = Box<dyn FnOnce(T) + Send + 'static>;

/// Holds a completion handler until exactly one party claims it.
///
/// The operation and `cancel()` race to `complete`; the first caller runs
/// the handler and every later caller gets its value handed back.
pub struct Completion<T> {
    handler: Mutex<Option<Handler<T>>>,
}

impl<T> Completion<T> {
    pub fn new<F>(handler: F) -> Self
    where
        F: FnOnce(T) + Send + 'static,
    {
        Self {
            handler: Mutex::new(Some(Box::new(handler))),
        }
    }

    /// Deliver `value` if nobody has yet; otherwise return it unused.
    pub fn complete(&self, value: T) -> Result<(), T> {
        // Take under the lock, invoke outside it.
        let handler = self.handler.lock().take();
        match handler {
            Some(handler) => {
                handler(value);
                Ok(())
            }
            None => Err(value),
        }
    }

    /// Remove the handler without invoking it.
    pub fn take(&self) -> Option<Handler<T>> {
        self.handler.lock().take()
    }

    pub fn is_complete(&self) -> bool {
        self.handler.lock().is_none()
    }
}

//! A delegate delivers items produced on any thread to one dedicated
//! consumer thread, in the order they were pushed, via an MPSC queue
//! (§4.7: "Delegate").

use std::sync::Mutex;
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Sender};

enum Msg<T> {
    Item(T),
    Stop,
}

/// Owns the consumer thread for the lifetime of the `Delegate`. Producers on
/// any thread call [`push`](Self::push); the user callback runs only on the
/// dedicated consumer thread, one item at a time, in push order.
pub struct Delegate<T> {
    tx: Sender<Msg<T>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> Delegate<T> {
    pub fn new(mut callback: impl FnMut(T) + Send + 'static) -> Self {
        let (tx, rx) = unbounded::<Msg<T>>();
        let handle = std::thread::spawn(move || {
            while let Ok(msg) = rx.recv() {
                match msg {
                    Msg::Item(item) => callback(item),
                    Msg::Stop => break,
                }
            }
        });
        Delegate { tx, handle: Mutex::new(Some(handle)) }
    }

    /// Enqueues an item for in-order delivery to the consumer thread.
    pub fn push(&self, item: T) {
        let _ = self.tx.send(Msg::Item(item));
    }

    /// Stops the consumer after it has drained everything pushed before
    /// this call, then joins its thread.
    pub fn stop(&self) {
        let _ = self.tx.send(Msg::Stop);
        if let Some(handle) = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = handle.join();
        }
    }
}

impl<T: Send + 'static> Drop for Delegate<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex as StdMutex};

    #[test]
    fn items_arrive_in_push_order() {
        let received = Arc::new(StdMutex::new(Vec::new()));
        let r2 = received.clone();
        let delegate = Delegate::new(move |item: u32| {
            r2.lock().unwrap().push(item);
        });

        for i in 0..20 {
            delegate.push(i);
        }
        delegate.stop();

        assert_eq!(*received.lock().unwrap(), (0..20).collect::<Vec<_>>());
    }
}

use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc, Condvar, Mutex,
};
use std::time::{Duration, Instant};

use crate::utils::stats;

#[derive(Debug, PartialEq)]
pub enum Error<T> {
    Timeout,
    Terminated(Option<T>),
    Full(T),
}

#[derive(Debug, Default)]
struct Counter {
    input: AtomicU64,
    output: AtomicU64,
    rejected: AtomicU64,
}

struct Inner<T> {
    capacity: usize,
    deque: Mutex<VecDeque<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    terminated: AtomicBool,
    senders: AtomicUsize,
    counter: Counter,
}

impl<T> Inner<T> {
    fn close(&self) {
        let _guard = self.deque.lock().unwrap();
        self.terminated.store(true, Ordering::Release);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}

// fixed capacity MPSC queue: senders block when full (TCP backpressure),
// or use try_send and shed load themselves (UDP)
pub fn bounded<T>(size: usize) -> (Sender<T>, Receiver<T>, StatsHandle<T>) {
    assert!(size > 0);
    let inner = Arc::new(Inner {
        capacity: size,
        deque: Mutex::new(VecDeque::with_capacity(size)),
        not_empty: Condvar::new(),
        not_full: Condvar::new(),
        terminated: AtomicBool::new(false),
        senders: AtomicUsize::new(1),
        counter: Counter::default(),
    });
    (
        Sender {
            inner: inner.clone(),
        },
        Receiver {
            inner: inner.clone(),
        },
        StatsHandle { inner },
    )
}

pub struct Sender<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Sender<T> {
    pub fn terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::Acquire)
    }

    pub fn send(&self, msg: T) -> Result<(), Error<T>> {
        let mut deque = self.inner.deque.lock().unwrap();
        loop {
            if self.inner.terminated.load(Ordering::Acquire) {
                return Err(Error::Terminated(Some(msg)));
            }
            if deque.len() < self.inner.capacity {
                break;
            }
            deque = self.inner.not_full.wait(deque).unwrap();
        }
        deque.push_back(msg);
        self.inner.counter.input.fetch_add(1, Ordering::Relaxed);
        self.inner.not_empty.notify_one();
        Ok(())
    }

    // like send but gives up after timeout, returning the message so the
    // caller can check for shutdown and retry
    pub fn send_timeout(&self, msg: T, timeout: Duration) -> Result<(), Error<T>> {
        let start = Instant::now();
        let mut deque = self.inner.deque.lock().unwrap();
        loop {
            if self.inner.terminated.load(Ordering::Acquire) {
                return Err(Error::Terminated(Some(msg)));
            }
            if deque.len() < self.inner.capacity {
                break;
            }
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(Error::Full(msg));
            }
            deque = self
                .inner
                .not_full
                .wait_timeout(deque, timeout - elapsed)
                .unwrap()
                .0;
        }
        deque.push_back(msg);
        self.inner.counter.input.fetch_add(1, Ordering::Relaxed);
        self.inner.not_empty.notify_one();
        Ok(())
    }

    // non-blocking variant, ownership of the message returns on a full queue
    pub fn try_send(&self, msg: T) -> Result<(), Error<T>> {
        let mut deque = self.inner.deque.lock().unwrap();
        if self.inner.terminated.load(Ordering::Acquire) {
            return Err(Error::Terminated(Some(msg)));
        }
        if deque.len() >= self.inner.capacity {
            self.inner.counter.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(Error::Full(msg));
        }
        deque.push_back(msg);
        self.inner.counter.input.fetch_add(1, Ordering::Relaxed);
        self.inner.not_empty.notify_one();
        Ok(())
    }

    // drains msgs front to back, items not yet queued at termination are lost
    pub fn send_all(&self, msgs: &mut Vec<T>) -> Result<(), Error<T>> {
        for msg in msgs.drain(..) {
            if let Err(e) = self.send(msg) {
                return Err(match e {
                    Error::Terminated(_) => Error::Terminated(None),
                    other => other,
                });
            }
        }
        Ok(())
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.inner.senders.fetch_add(1, Ordering::Relaxed);
        Sender {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        // last sender closes the queue, pending items remain receivable
        if self.inner.senders.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.close();
        }
    }
}

pub struct Receiver<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Receiver<T> {
    pub fn terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::Acquire)
    }

    fn wait_non_empty<'a>(
        &'a self,
        mut deque: std::sync::MutexGuard<'a, VecDeque<T>>,
        timeout: Option<Duration>,
    ) -> Result<std::sync::MutexGuard<'a, VecDeque<T>>, Error<T>> {
        let start = Instant::now();
        while deque.is_empty() {
            if self.inner.terminated.load(Ordering::Acquire) {
                return Err(Error::Terminated(None));
            }
            deque = match timeout {
                Some(d) => {
                    let elapsed = start.elapsed();
                    if elapsed >= d {
                        return Err(Error::Timeout);
                    }
                    self.inner
                        .not_empty
                        .wait_timeout(deque, d - elapsed)
                        .unwrap()
                        .0
                }
                None => self.inner.not_empty.wait(deque).unwrap(),
            };
        }
        Ok(deque)
    }

    pub fn recv(&self, timeout: Option<Duration>) -> Result<T, Error<T>> {
        let deque = self.inner.deque.lock().unwrap();
        let mut deque = self.wait_non_empty(deque, timeout)?;
        let msg = deque.pop_front().unwrap();
        self.inner.counter.output.fetch_add(1, Ordering::Relaxed);
        self.inner.not_full.notify_one();
        Ok(msg)
    }

    pub fn recv_n(&self, n: usize, timeout: Option<Duration>) -> Result<Vec<T>, Error<T>> {
        assert!(n > 0);
        let deque = self.inner.deque.lock().unwrap();
        let mut deque = self.wait_non_empty(deque, timeout)?;
        let count = deque.len().min(n);
        let msgs = deque.drain(..count).collect();
        self.inner
            .counter
            .output
            .fetch_add(count as u64, Ordering::Relaxed);
        self.inner.not_full.notify_all();
        Ok(msgs)
    }

    // clears msgs, then receives at most msgs.capacity() messages
    pub fn recv_all(&self, msgs: &mut Vec<T>, timeout: Option<Duration>) -> Result<(), Error<T>> {
        msgs.clear();
        let max_recv = msgs.capacity().max(1);
        let deque = self.inner.deque.lock().unwrap();
        let mut deque = self.wait_non_empty(deque, timeout)?;
        let count = deque.len().min(max_recv);
        msgs.extend(deque.drain(..count));
        self.inner
            .counter
            .output
            .fetch_add(count as u64, Ordering::Relaxed);
        self.inner.not_full.notify_all();
        Ok(())
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        self.inner.close();
    }
}

impl<T> Iterator for Receiver<T> {
    type Item = T;

    fn next(&mut self) -> Option<Self::Item> {
        self.recv(None).ok()
    }
}

pub struct StatsHandle<T> {
    inner: Arc<Inner<T>>,
}

impl<T: Send> stats::OwnedCountable for StatsHandle<T> {
    fn get_counters(&self) -> Vec<stats::Counter> {
        let pending = self.inner.deque.lock().unwrap().len();
        vec![
            (
                "in",
                stats::CounterType::Counted,
                stats::CounterValue::Unsigned(self.inner.counter.input.swap(0, Ordering::Relaxed)),
            ),
            (
                "out",
                stats::CounterType::Counted,
                stats::CounterValue::Unsigned(self.inner.counter.output.swap(0, Ordering::Relaxed)),
            ),
            (
                "rejected",
                stats::CounterType::Counted,
                stats::CounterValue::Unsigned(
                    self.inner.counter.rejected.swap(0, Ordering::Relaxed),
                ),
            ),
            (
                "pending",
                stats::CounterType::Gauged,
                stats::CounterValue::Unsigned(pending as u64),
            ),
        ]
    }

    fn closed(&self) -> bool {
        self.inner.terminated.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use std::mem;
    use std::thread;

    use super::*;

    #[test]
    fn one_element_send_receive() {
        let (s, r, _) = bounded(2);
        let h = thread::spawn(move || {
            let v: u64 = r.recv(None).unwrap();
            assert_eq!(v, 42);
        });
        s.send(42u64).unwrap();
        h.join().unwrap();
    }

    #[test]
    fn multiple_senders() {
        let (s, r, _) = bounded(1024);
        for i in 0..10 {
            let sender = s.clone();
            thread::spawn(move || {
                if i % 2 == 0 {
                    for j in 1..=10u64 {
                        sender.send(j).unwrap();
                    }
                } else {
                    sender
                        .send_all(&mut vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10])
                        .unwrap();
                }
            });
        }
        mem::drop(s);

        let mut sum = 0;
        for v in r {
            sum += v;
        }
        assert_eq!(sum, 550);
    }

    #[test]
    fn try_send_full() {
        let (s, r, _) = bounded(2);
        s.try_send(1).unwrap();
        s.try_send(2).unwrap();
        assert_eq!(s.try_send(3), Err(Error::Full(3)));
        assert_eq!(r.recv(None).unwrap(), 1);
        s.try_send(3).unwrap();
        assert_eq!(r.recv_n(10, None).unwrap(), vec![2, 3]);
    }

    #[test]
    fn blocking_send_resumes() {
        let (s, r, _) = bounded(1);
        s.send(1).unwrap();
        let h = thread::spawn(move || {
            // blocks until the receiver makes room
            s.send(2).unwrap();
        });
        thread::sleep(Duration::from_millis(50));
        assert_eq!(r.recv(None).unwrap(), 1);
        assert_eq!(r.recv(None).unwrap(), 2);
        h.join().unwrap();
    }

    #[test]
    fn send_timeout_returns_message_when_full() {
        let (s, r, _) = bounded(1);
        s.send(1).unwrap();
        let e = s.send_timeout(2, Duration::from_millis(10)).err().unwrap();
        assert_eq!(e, Error::Full(2));
        assert_eq!(r.recv(None).unwrap(), 1);
        s.send_timeout(2, Duration::from_millis(10)).unwrap();
        assert_eq!(r.recv(None).unwrap(), 2);
    }

    #[test]
    fn timeout_and_terminate() {
        let (s, r, _) = bounded::<u64>(2);

        let e = r.recv(Some(Duration::from_millis(10))).err().unwrap();
        assert_eq!(e, Error::Timeout);

        s.send(42).unwrap();
        s.send(43).unwrap();
        mem::drop(s);

        // queued items are drained after the last sender is gone
        let mut msgs = Vec::with_capacity(100);
        r.recv_all(&mut msgs, Some(Duration::from_millis(100)))
            .unwrap();
        assert_eq!(msgs, vec![42, 43]);
        let e = r.recv(Some(Duration::from_millis(10))).err().unwrap();
        assert_eq!(e, Error::Terminated(None));
    }

    #[test]
    fn receiver_drop_unblocks_sender() {
        let (s, r, _) = bounded(1);
        s.send(1).unwrap();
        let h = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            mem::drop(r);
        });
        assert_eq!(s.send(2), Err(Error::Terminated(Some(2))));
        h.join().unwrap();
    }
}

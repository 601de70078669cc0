//! Executive thread: the single consumer performing backend and device
//! submissions in the order the loader produced them.

use crate::error::StreamError;
use crossbeam::channel::{unbounded, Sender};
use log::{error, info};
use std::thread::JoinHandle;

/// Submission work of one frame.
pub type ExecutiveJob = Box<dyn FnOnce() -> Result<(), StreamError> + Send + 'static>;

pub struct Executive {
    thread: Option<JoinHandle<()>>,
}

impl Executive {
    /// Starts the executive thread and returns it with the sending end of
    /// its queue. The thread exits once every sender was dropped.
    ///
    /// `on_error` is called with the first error a job returns, all later
    /// jobs are dropped without running.
    pub fn new(on_error: impl Fn(StreamError) + Send + 'static) -> (Self, Sender<ExecutiveJob>) {
        let (tx, rx) = unbounded::<ExecutiveJob>();

        let thread = std::thread::Builder::new()
            .name("Executive".into())
            .spawn(move || {
                let mut failed = false;
                for job in rx.iter() {
                    if failed {
                        continue;
                    }
                    if let Err(e) = job() {
                        error!("Executive job failed: {}", e);
                        on_error(e);
                        failed = true;
                    }
                }
                info!("Executive thread exited!");
            })
            .expect("cannot start executive thread");

        (Self { thread: Some(thread) }, tx)
    }

    /// Waits until every queued job was handled. All senders must be
    /// dropped first.
    pub fn finish(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Executive thread panicked");
            }
        }
    }
}

impl Drop for Executive {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use crate::error::StreamError;
    use crate::executive::Executive;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn runs_jobs_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (mut executive, tx) = Executive::new(|_| panic!("no job fails"));

        for i in 0..16 {
            let log = log.clone();
            tx.send(Box::new(move || {
                log.lock().push(i);
                Ok(())
            }))
            .unwrap();
        }
        drop(tx);
        executive.finish();

        assert_eq!(*log.lock(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn stops_running_jobs_after_failure() {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let ran = Arc::new(Mutex::new(0));
        let (mut executive, tx) = {
            let errors = errors.clone();
            Executive::new(move |e| errors.lock().push(e))
        };

        tx.send(Box::new(|| Err(StreamError::Aborted))).unwrap();
        for _ in 0..3 {
            let ran = ran.clone();
            tx.send(Box::new(move || {
                *ran.lock() += 1;
                Ok(())
            }))
            .unwrap();
        }
        drop(tx);
        executive.finish();

        assert_eq!(errors.lock().len(), 1);
        assert_eq!(*ran.lock(), 0);
    }
}

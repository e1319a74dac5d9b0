// FenceGate - "has the GPU reached point N yet?"
//
// Wraps one device timeline. Values signaled through a gate are strictly
// increasing for the gate's whole lifetime and are never reused.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use thiserror::Error;

use crate::backend::{Backend, WaitOutcome};

#[derive(Debug, Error)]
pub enum FenceError {
    #[error("fence value {requested} is not above the last signaled value {last}")]
    NotIncreasing { requested: u64, last: u64 },

    #[error("device did not reach fence value {value} within {timeout:?} (completed: {completed})")]
    Timeout {
        value: u64,
        completed: u64,
        timeout: Duration,
    },
}

pub struct FenceGate<B: Backend> {
    backend: Arc<B>,
    timeline: B::Timeline,
    last_signaled: u64,
    timeout: Option<Duration>,
}

impl<B: Backend> FenceGate<B> {
    /// Create a gate whose waits give up after `timeout` (`None` = never)
    pub fn new(backend: Arc<B>, timeout: Option<Duration>) -> Result<Self> {
        let timeline = backend.create_timeline()?;
        Ok(Self {
            backend,
            timeline,
            last_signaled: 0,
            timeout,
        })
    }

    /// Highest value handed to `signal` so far
    #[cfg(test)]
    pub fn last_signaled(&self) -> u64 {
        self.last_signaled
    }

    /// Queue a signal of `value`; must exceed every previously signaled value
    pub fn signal(&mut self, value: u64) -> Result<()> {
        if value <= self.last_signaled {
            return Err(FenceError::NotIncreasing {
                requested: value,
                last: self.last_signaled,
            }
            .into());
        }

        self.backend.signal(&self.timeline, value)?;
        self.last_signaled = value;
        Ok(())
    }

    /// Allocate the next completion value and signal it
    pub fn signal_next(&mut self) -> Result<u64> {
        let value = self.last_signaled + 1;
        self.signal(value)?;
        Ok(value)
    }

    pub fn completed(&self) -> Result<u64> {
        self.backend.completed_value(&self.timeline)
    }

    pub fn is_reached(&self, value: u64) -> Result<bool> {
        Ok(self.completed()? >= value)
    }

    /// Block until the device reports at least `value`.
    ///
    /// Returns without blocking when the value is already reached.
    pub fn wait(&self, value: u64) -> Result<()> {
        if self.is_reached(value)? {
            return Ok(());
        }

        match self.backend.wait(&self.timeline, value, self.timeout)? {
            WaitOutcome::Reached => Ok(()),
            WaitOutcome::TimedOut => Err(FenceError::Timeout {
                value,
                completed: self.completed()?,
                timeout: self.timeout.unwrap_or(Duration::MAX),
            }
            .into()),
        }
    }

    /// Wait for everything signaled through this gate
    #[cfg(test)]
    pub fn drain(&self) -> Result<()> {
        self.wait(self.last_signaled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn signal_rejects_non_increasing_values() {
        let device = testing::device(3);
        let mut gate = FenceGate::new(device, None).unwrap();

        gate.signal(5).unwrap();
        let err = gate.signal(5).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FenceError>(),
            Some(FenceError::NotIncreasing { requested: 5, last: 5 })
        ));
        assert!(gate.signal(3).is_err());
        assert_eq!(gate.last_signaled(), 5);
    }

    #[test]
    fn signal_next_counts_up_by_one() {
        let device = testing::device(3);
        let mut gate = FenceGate::new(device, None).unwrap();

        assert_eq!(gate.signal_next().unwrap(), 1);
        assert_eq!(gate.signal_next().unwrap(), 2);
        assert_eq!(gate.signal_next().unwrap(), 3);
        gate.drain().unwrap();
        assert_eq!(gate.completed().unwrap(), 3);
    }

    #[test]
    fn wait_on_reached_value_does_not_block() {
        let device = testing::device(3);
        let gate = FenceGate::new(device.clone(), None).unwrap();

        gate.wait(0).unwrap();
        assert_eq!(device.stats().blocking_waits, 0);
    }

    #[test]
    fn wait_returns_only_after_completion() {
        let device = testing::device(3);
        let mut gate = FenceGate::new(device.clone(), None).unwrap();

        // Nothing executes the signal until the queue is released
        device.hold_queue();
        let value = gate.signal_next().unwrap();
        assert!(!gate.is_reached(value).unwrap());

        let releaser = {
            let device = device.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(30));
                device.release_queue();
            })
        };

        gate.wait(value).unwrap();
        assert!(gate.completed().unwrap() >= value);
        assert_eq!(device.stats().blocking_waits, 1);
        releaser.join().unwrap();
    }

    #[test]
    fn wait_times_out_on_stalled_device() {
        let device = testing::device(3);
        let mut gate = FenceGate::new(device.clone(), Some(Duration::from_millis(30))).unwrap();

        device.hold_queue();
        let value = gate.signal_next().unwrap();
        let err = gate.wait(value).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FenceError>(),
            Some(FenceError::Timeout { value: 1, completed: 0, .. })
        ));
        device.release_queue();
        gate.drain().unwrap();
    }
}

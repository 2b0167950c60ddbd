use std::fmt;
use std::sync::{Arc, Mutex};

/// The microphone is a single exclusive resource shared by the call machine
/// and the voice recorder. Whoever holds a [`MicClaim`] owns the device;
/// claiming while held surfaces the current holder instead of queueing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicOwner {
    Call,
    Recorder,
}

impl fmt::Display for MicOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MicOwner::Call => write!(f, "voice call"),
            MicOwner::Recorder => write!(f, "voice recorder"),
        }
    }
}

#[derive(Debug, Default)]
pub struct MicrophoneArbiter {
    owner: Mutex<Option<MicOwner>>,
}

impl MicrophoneArbiter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// On success the returned claim releases the microphone when dropped,
    /// which ties release to every exit path of the holder.
    pub fn claim(self: &Arc<Self>, owner: MicOwner) -> Result<MicClaim, MicOwner> {
        let mut guard = self.owner.lock().unwrap_or_else(|e| e.into_inner());
        match *guard {
            Some(current) => Err(current),
            None => {
                *guard = Some(owner);
                Ok(MicClaim {
                    arbiter: Arc::clone(self),
                })
            }
        }
    }

    pub fn holder(&self) -> Option<MicOwner> {
        *self.owner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn release(&self) {
        *self.owner.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

#[derive(Debug)]
pub struct MicClaim {
    arbiter: Arc<MicrophoneArbiter>,
}

impl Drop for MicClaim {
    fn drop(&mut self) {
        self.arbiter.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_claim_reports_holder() {
        let arbiter = MicrophoneArbiter::new();
        let claim = arbiter.claim(MicOwner::Call).expect("first claim");
        assert_eq!(
            arbiter.claim(MicOwner::Recorder).unwrap_err(),
            MicOwner::Call
        );
        drop(claim);
        assert!(arbiter.claim(MicOwner::Recorder).is_ok());
    }

    #[test]
    fn drop_releases_the_device() {
        let arbiter = MicrophoneArbiter::new();
        {
            let _claim = arbiter.claim(MicOwner::Recorder).expect("claim");
            assert_eq!(arbiter.holder(), Some(MicOwner::Recorder));
        }
        assert_eq!(arbiter.holder(), None);
    }
}

use crate::crypto;
use crate::error::Error;

/// Configuration for one engine instance (one per event loop).
#[derive(Clone)]
pub struct Config {
    /// Usable capacity of each buffer segment in bytes. Fixed at pool init.
    pub mbuf_size: usize,
    /// Trailing extra region per segment, sized to hold cipher overhead so a
    /// sealed envelope chunk fits in one segment.
    pub mbuf_extra: usize,
    /// Soft message-allocation ceiling. Non-forced acquires fail here so
    /// client traffic degrades before the replication plane is starved.
    pub msg_soft_limit: u32,
    /// Hard message-allocation ceiling. Nothing allocates past this.
    pub msg_hard_limit: u32,
    /// Upper bound on iovecs per scatter-gather send. Clamped at runtime to
    /// the platform IOV_MAX.
    pub iov_max: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mbuf_size: 16384,
            mbuf_extra: crypto::OVERHEAD,
            msg_soft_limit: 65536,
            msg_hard_limit: 131072,
            iov_max: 128,
        }
    }
}

impl Config {
    /// Validate configuration values. Returns an error if any value is out
    /// of range.
    pub fn validate(&self) -> Result<(), Error> {
        if self.mbuf_size < 64 {
            return Err(Error::Config("mbuf_size must be >= 64".into()));
        }
        if self.msg_soft_limit == 0 {
            return Err(Error::Config("msg_soft_limit must be > 0".into()));
        }
        if self.msg_soft_limit > self.msg_hard_limit {
            return Err(Error::Config(
                "msg_soft_limit must be <= msg_hard_limit".into(),
            ));
        }
        if self.iov_max == 0 {
            return Err(Error::Config("iov_max must be > 0".into()));
        }
        Ok(())
    }
}

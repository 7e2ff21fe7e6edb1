//! Pool configuration
//!
//! Bisa dibangun lewat `Default`, atau di-load dari file TOML:
//!
//! ```toml
//! worker_thread_count = 4
//! read_buffer_segment_size = 16384
//! write_high_watermark = 1048576
//! write_low_watermark = 262144
//! connect_timeout_ms = 3000
//! connect_retry_limit = 2
//! listen_backlog = 1024
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Jumlah event manager (= jumlah worker thread)
    pub worker_thread_count: usize,
    /// Ukuran satu segment Blob untuk read path
    pub read_buffer_segment_size: usize,
    pub write_high_watermark: usize,
    pub write_low_watermark: usize,
    #[serde(rename = "connect_timeout_ms", with = "millis")]
    pub connect_timeout: Duration,
    pub connect_retry_limit: u32,
    pub listen_backlog: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_thread_count: 2,
            read_buffer_segment_size: 16 * 1024, // 16KB
            write_high_watermark: 1024 * 1024,   // 1MB
            write_low_watermark: 256 * 1024,     // 256KB
            connect_timeout: Duration::from_secs(3),
            connect_retry_limit: 0,
            listen_backlog: 1024,
        }
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    /// Cek konsistensi nilai. `high == low` diperbolehkan (single-threshold toggle).
    pub fn validate(&self) -> Result<()> {
        if self.worker_thread_count == 0 {
            return Err(Error::Config("worker_thread_count must be at least 1".into()));
        }
        if self.read_buffer_segment_size == 0 {
            return Err(Error::Config("read_buffer_segment_size must be non-zero".into()));
        }
        if self.listen_backlog == 0 {
            return Err(Error::Config("listen_backlog must be non-zero".into()));
        }
        if self.write_low_watermark > self.write_high_watermark {
            return Err(Error::Config(format!(
                "write_low_watermark ({}) exceeds write_high_watermark ({})",
                self.write_low_watermark, self.write_high_watermark
            )));
        }
        Ok(())
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

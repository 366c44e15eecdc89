//! Stored chain descriptions.
//!
//! A [`ChainConfig`] is the JSON form of a filter chain, so encoder settings
//! can be kept next to the data they produced and the matching decoder built
//! later.
//!
//! ```json
//! {
//!   "filters": [
//!     { "type": "subblock", "alignment": 4, "chunk_size": 4096, "rle": 1 },
//!     { "type": "zstd", "level": 3 }
//!   ],
//!   "memlimit": 67108864
//! }
//! ```

use serde::{Deserialize, Serialize};

use crate::coder::filter::validate_chain;
use crate::coder::{Filter, Stream};
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ChainConfig {
    /// Filters in encoding order.
    pub filters:  Vec<Filter>,
    /// Ceiling for Index decoders built from this config.  `None` means no
    /// limit.
    #[serde(default)]
    pub memlimit: Option<u64>,
}

impl ChainConfig {
    pub fn new(filters: Vec<Filter>) -> Self {
        ChainConfig { filters, memlimit: None }
    }

    pub fn to_bytes(&self) -> std::result::Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn validate(&self) -> Result<()> {
        validate_chain(&self.filters)
    }

    pub fn encoder(&self) -> Result<Stream> {
        Stream::new_raw_encoder(&self.filters)
    }

    pub fn decoder(&self) -> Result<Stream> {
        Stream::new_raw_decoder(&self.filters)
    }

    pub fn index_decoder(&self) -> Result<Stream> {
        Stream::new_index_decoder(self.memlimit.unwrap_or(u64::MAX))
    }
}

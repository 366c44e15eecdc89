pub mod error;
pub mod vli;
pub mod coder;
pub mod codec;
pub mod index;
pub mod subblock;
pub mod config;

pub use error::{Error, Result};
pub use coder::{Action, Check, Coder, Filter, Status, Stream, SubfilterCommand, SubfilterState};
pub use index::{Index, Record};
pub use subblock::SubblockOptions;
pub use config::ChainConfig;

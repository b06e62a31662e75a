mod decision;
mod log_util;
mod pipe;
mod snapshot;
mod time;

pub use decision::*;
pub use log_util::*;
pub use pipe::*;
pub use snapshot::*;
pub use time::*;

pub mod clock;
pub mod message;
pub mod peers;
pub mod processor;
pub mod recorder;
pub mod report;

pub use clock::*;
pub use message::*;
pub use peers::*;
pub use processor::*;
pub use recorder::*;
pub use report::*;

pub mod cli;
pub mod devserve;
pub mod log;

pub use devserve::{
    BatchOutcome, Devserve, Selection, StartAction, StartOutcome, StartRequest,
};

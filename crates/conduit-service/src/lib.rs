pub mod aligner;

pub use aligner::{
    Aligner, AlignerHandle, AlignerLogic, DEFAULT_MAX_TIMESTAMP_DIFF_SECONDS, MAX_MESSAGE_BUFFER_SIZE,
};

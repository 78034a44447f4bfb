//! Progress events emitted while a song is prepared.
//!
//! A preparation emits zero or more [`Progress::Written`] events in the order
//! that bytes are committed to the temporary file, followed by exactly one
//! terminal item: either [`Progress::Done`] or an error.
//!
//! # Example
//!
//! ```rust
//! use songprep::events::Progress;
//!
//! fn handle(progress: Progress, total: &mut u64) {
//!     match progress {
//!         Progress::Written(len) => *total += len as u64,
//!         Progress::Done => println!("cached {total} bytes"),
//!     }
//! }
//! ```

/// Progress of a single preparation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Progress {
    /// This many transcoded bytes were written to the temporary file.
    Written(usize),

    /// The song is cached and ready to play.
    ///
    /// Terminal: nothing follows this event.
    Done,
}

impl Progress {
    /// Number of bytes this event reports; zero for [`Progress::Done`].
    #[must_use]
    pub fn bytes(&self) -> usize {
        match self {
            Self::Written(len) => *len,
            Self::Done => 0,
        }
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }
}

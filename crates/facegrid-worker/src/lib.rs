//! facegrid-worker — the consume → recognize → publish loop.
//!
//! ```text
//! request queue ──► fetch input blob ──► recognize ──► put output blob
//!                        │ (missing)          │ (fails)       │
//!                        ▼                    ▼               ▼
//!                 delete, abandon      delete, abandon   send response
//!                                                             │
//!                                                             ▼
//!                                                    delete request message
//! ```
//!
//! Everything after recognition is best effort: failures are logged and
//! the loop moves on. Redelivery of an undeleted request reprocesses the
//! job, which is safe because every write overwrites the same key or
//! repeats the same response.

pub mod recognizer;
pub mod worker;

pub use recognizer::{Embedder, Gallery, GalleryError, GalleryRecognizer, ThumbnailEmbedder};
pub use worker::{Outcome, Worker};

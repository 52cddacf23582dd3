pub mod analyzer;
pub mod phrase;
pub mod search;
pub mod store;

pub type DocId = u64;
pub type TermId = u64;
pub type Position = u32;

/// The two independently indexed fields of a document. Each field has its
/// own term dictionary, postings and frequency tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Title,
    Body,
}

impl Field {
    pub(crate) fn byte(self) -> u8 {
        match self {
            Field::Title => 0,
            Field::Body => 1,
        }
    }
}

pub use search::{RankParams, SearchEngine, SearchResult};
pub use store::{Document, DocumentUpdate, Posting, Store};

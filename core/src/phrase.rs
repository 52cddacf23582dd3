//! Phrase resolution over ordered postings scans.
//!
//! A phrase is an ordered list of terms that must occur contiguously.
//! Matches are found with the ordered-merge walk: advance forward through
//! the phrase with `next_posting`, then walk backward with `prev_posting`
//! to find where the phrase would have to start; if start and end are in
//! the same document exactly `len - 1` positions apart, the phrase occurs
//! there. Single-term phrases skip the positional merge entirely and use
//! the frequency tables, which need no adjacency check.

use anyhow::Result;

use crate::store::{Posting, Store};
use crate::{DocId, Field, Position, TermId};

/// A phrase resolved against one field's dictionary.
#[derive(Debug, Clone)]
pub struct FieldPhrase {
    pub field: Field,
    pub terms: Vec<TermId>,
}

/// The largest posting of document `doc`; everything strictly after it
/// belongs to a later document.
fn doc_boundary(doc: DocId) -> Posting {
    Posting {
        doc,
        pos: Position::MAX,
    }
}

/// Find the first contiguous occurrence of `phrase` strictly after
/// `after`, returned as (start, end) postings in the same document.
///
/// Every retry restarts from the backward walk's landing point, which is
/// strictly past the previous origin, so the loop always terminates.
pub fn next_phrase(
    store: &Store,
    phrase: &FieldPhrase,
    after: Option<Posting>,
) -> Result<Option<(Posting, Posting)>> {
    let Some((&last, front)) = phrase.terms.split_last() else {
        return Ok(None);
    };
    if front.is_empty() {
        return Ok(store
            .next_posting(phrase.field, last, after)?
            .map(|p| (p, p)));
    }
    let mut origin = after;
    loop {
        let mut cursor = origin;
        for &term in &phrase.terms {
            match store.next_posting(phrase.field, term, cursor)? {
                Some(p) => cursor = Some(p),
                None => return Ok(None),
            }
        }
        let v = cursor.expect("walked a non-empty phrase");
        let mut u = v;
        for &term in front.iter().rev() {
            match store.prev_posting(phrase.field, term, u)? {
                Some(p) => u = p,
                None => return Ok(None),
            }
        }
        if u.doc == v.doc && v.pos - u.pos == (phrase.terms.len() - 1) as Position {
            return Ok(Some((u, v)));
        }
        origin = Some(u);
    }
}

/// Smallest document id strictly greater than `after` containing the
/// phrase at least once. Single-term phrases seek the frequency table
/// directly instead of running the positional merge.
pub fn next_phrase_doc(
    store: &Store,
    phrase: &FieldPhrase,
    after: Option<DocId>,
) -> Result<Option<DocId>> {
    match phrase.terms.as_slice() {
        [] => Ok(None),
        [term] => store.next_doc_with_term(phrase.field, *term, after),
        _ => {
            let origin = after.map(doc_boundary);
            Ok(next_phrase(store, phrase, origin)?.map(|(u, _)| u.doc))
        }
    }
}

/// ftd: number of non-overlapping occurrences of the phrase in `doc`.
pub fn phrase_frequency(store: &Store, phrase: &FieldPhrase, doc: DocId) -> Result<u64> {
    match phrase.terms.as_slice() {
        [] => Ok(0),
        [term] => Ok(u64::from(store.term_frequency(phrase.field, *term, doc)?)),
        _ => {
            let mut count = 0;
            let mut cursor = doc.checked_sub(1).map(doc_boundary);
            while let Some((u, v)) = next_phrase(store, phrase, cursor)? {
                if u.doc != doc {
                    break;
                }
                count += 1;
                cursor = Some(v);
            }
            Ok(count)
        }
    }
}

/// Nt: number of documents containing the phrase at least once.
pub fn phrase_document_frequency(store: &Store, phrase: &FieldPhrase) -> Result<u64> {
    match phrase.terms.as_slice() {
        [] => Ok(0),
        [term] => store.document_frequency(phrase.field, *term),
        _ => {
            let mut count = 0;
            let mut doc = None;
            while let Some(d) = next_phrase_doc(store, phrase, doc)? {
                count += 1;
                doc = Some(d);
            }
            Ok(count)
        }
    }
}
